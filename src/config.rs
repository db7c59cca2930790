//! Configuration module for pgwarden.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Path to the SQLite database file (default: "pgwarden.db")
    pub db_path: String,
    /// Orchestrator tick (default: 1s)
    pub tick_interval: Duration,
    /// Budget for one target's metric collection (default: 30s)
    pub collection_timeout: Duration,
    /// Samples older than this many days are pruned (default: 90)
    pub retention_days: i64,
    /// How often the retention sweep fires (default: 5m)
    pub retention_sweep_interval: Duration,
    /// Row cap for ad-hoc queries when the caller gives none (default: 1000)
    pub query_default_rows: usize,
    /// Time budget for ad-hoc queries when the caller gives none (default: 30s)
    pub query_default_timeout: Duration,
    /// Reject anything but a single SELECT/WITH statement (default: false)
    pub query_read_only: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            db_path: "pgwarden.db".to_string(),
            tick_interval: Duration::from_secs(1),
            collection_timeout: Duration::from_secs(30),
            retention_days: 90,
            retention_sweep_interval: Duration::from_secs(5 * 60),
            query_default_rows: 1000,
            query_default_timeout: Duration::from_secs(30),
            query_read_only: false,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PGWARDEN_DB_PATH`: Database file path (default: "pgwarden.db")
    /// - `PGWARDEN_TICK_INTERVAL_SECS`: Orchestrator tick (default: 1)
    /// - `PGWARDEN_COLLECTION_TIMEOUT_SECS`: Per-target collection budget (default: 30)
    /// - `PGWARDEN_RETENTION_DAYS`: Metric retention horizon (default: 90)
    /// - `PGWARDEN_RETENTION_SWEEP_SECS`: Retention sweep period (default: 300)
    /// - `PGWARDEN_QUERY_DEFAULT_ROWS`: Ad-hoc query row cap (default: 1000)
    /// - `PGWARDEN_QUERY_DEFAULT_TIMEOUT_SECS`: Ad-hoc query budget (default: 30)
    /// - `PGWARDEN_QUERY_READ_ONLY`: Enforce the read-only validator (default: false)
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(db_path) = env::var("PGWARDEN_DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Some(secs) = parse_env::<u64>("PGWARDEN_TICK_INTERVAL_SECS").filter(|s| *s > 0) {
            cfg.tick_interval = Duration::from_secs(secs);
        }

        if let Some(secs) = parse_env::<u64>("PGWARDEN_COLLECTION_TIMEOUT_SECS").filter(|s| *s > 0) {
            cfg.collection_timeout = Duration::from_secs(secs);
        }

        if let Some(days) = parse_env::<i64>("PGWARDEN_RETENTION_DAYS").filter(|d| *d > 0) {
            cfg.retention_days = days;
        }

        if let Some(secs) = parse_env::<u64>("PGWARDEN_RETENTION_SWEEP_SECS").filter(|s| *s > 0) {
            cfg.retention_sweep_interval = Duration::from_secs(secs);
        }

        if let Some(rows) = parse_env::<usize>("PGWARDEN_QUERY_DEFAULT_ROWS").filter(|r| *r > 0) {
            cfg.query_default_rows = rows;
        }

        if let Some(secs) = parse_env::<u64>("PGWARDEN_QUERY_DEFAULT_TIMEOUT_SECS").filter(|s| *s > 0) {
            cfg.query_default_timeout = Duration::from_secs(secs);
        }

        if let Some(read_only) = parse_env::<bool>("PGWARDEN_QUERY_READ_ONLY") {
            cfg.query_read_only = read_only;
        }

        cfg
    }
}

fn parse_env<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
