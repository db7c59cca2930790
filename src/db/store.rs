//! SQLite database store implementation.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use uuid::Uuid;

use super::models::*;
use crate::target::{EngineKind, MonitoringTarget, TargetDirectory, TargetError};

mod embedded {
    refinery::embed_migrations!("migrations");
}

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
    #[error("store lock poisoned")]
    Poisoned,
}

/// Thread-safe database store for targets, monitoring settings and metric
/// samples.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let mut conn = Connection::open(path)?;

        embedded::migrations::runner()
            .run(&mut conn)
            .map_err(|e| DbError::Migration(e.to_string()))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    // --- Target CRUD ---

    /// Add a new target.
    pub fn add_target(&self, target: &MonitoringTarget) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO targets (id, owner_id, name, engine, version, host, port, username, password, database_name, use_tls)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                target.id.to_string(),
                target.owner_id.to_string(),
                target.name,
                target.engine.as_str(),
                target.version,
                target.host,
                target.port,
                target.username,
                target.password,
                target.database,
                target.use_tls,
            ],
        )?;
        Ok(())
    }

    /// Get all targets.
    pub fn get_targets(&self) -> Result<Vec<MonitoringTarget>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, owner_id, name, engine, version, host, port, username, password, database_name, use_tls FROM targets",
        )?;

        let targets = stmt
            .query_map([], target_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(targets)
    }

    /// Get a target by ID.
    pub fn get_target(&self, id: Uuid) -> Result<MonitoringTarget, DbError> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, owner_id, name, engine, version, host, port, username, password, database_name, use_tls FROM targets WHERE id = ?1",
            params![id.to_string()],
            target_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Delete a target with its settings and samples, all or nothing.
    pub fn delete_target(&self, id: Uuid) -> Result<(), DbError> {
        let conn = self.conn()?;
        let id = id.to_string();

        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM monitoring_metrics WHERE target_id = ?1", params![id])?;
        tx.execute("DELETE FROM monitoring_settings WHERE target_id = ?1", params![id])?;
        tx.execute("DELETE FROM targets WHERE id = ?1", params![id])?;
        tx.commit()?;

        Ok(())
    }

    // --- Monitoring settings ---

    /// Insert or replace the settings row for a target.
    pub fn save_settings(&self, settings: &MonitoringSettings) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO monitoring_settings (target_id, is_system_resources_monitoring_enabled, is_db_resources_monitoring_enabled,
                 is_queries_monitoring_enabled, monitoring_interval_seconds, installed_extensions_raw)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(target_id) DO UPDATE SET
                 is_system_resources_monitoring_enabled=excluded.is_system_resources_monitoring_enabled,
                 is_db_resources_monitoring_enabled=excluded.is_db_resources_monitoring_enabled,
                 is_queries_monitoring_enabled=excluded.is_queries_monitoring_enabled,
                 monitoring_interval_seconds=excluded.monitoring_interval_seconds,
                 installed_extensions_raw=excluded.installed_extensions_raw",
            params![
                settings.target_id.to_string(),
                settings.is_system_resources_monitoring_enabled,
                settings.is_db_resources_monitoring_enabled,
                settings.is_queries_monitoring_enabled,
                settings.monitoring_interval_seconds,
                settings.installed_extensions.encode(),
            ],
        )?;
        Ok(())
    }

    /// Get the settings row for a target, if one exists.
    pub fn get_settings(&self, target_id: Uuid) -> Result<Option<MonitoringSettings>, DbError> {
        let conn = self.conn()?;
        let settings = conn
            .query_row(
                "SELECT target_id, is_system_resources_monitoring_enabled, is_db_resources_monitoring_enabled,
                        is_queries_monitoring_enabled, monitoring_interval_seconds, installed_extensions_raw
                 FROM monitoring_settings WHERE target_id = ?1",
                params![target_id.to_string()],
                settings_from_row,
            )
            .optional()?;
        Ok(settings)
    }

    /// All settings rows with database resource monitoring switched on.
    pub fn get_settings_with_db_monitoring(&self) -> Result<Vec<MonitoringSettings>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT target_id, is_system_resources_monitoring_enabled, is_db_resources_monitoring_enabled,
                    is_queries_monitoring_enabled, monitoring_interval_seconds, installed_extensions_raw
             FROM monitoring_settings WHERE is_db_resources_monitoring_enabled = 1",
        )?;

        let settings = stmt
            .query_map([], settings_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(settings)
    }

    // --- Metric samples ---

    /// Insert samples as one atomic batch. An empty batch is a no-op.
    pub fn insert_metrics(&self, samples: &[MetricSample]) -> Result<(), DbError> {
        if samples.is_empty() {
            return Ok(());
        }

        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO monitoring_metrics (id, target_id, metric_kind, value_kind, value, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;

            for s in samples {
                stmt.execute(params![
                    s.id.to_string(),
                    s.target_id.to_string(),
                    s.metric.as_str(),
                    s.value_kind.as_str(),
                    s.value,
                    format_db_time(s.created_at),
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Samples of one kind for a target within `[from, to]`, newest first.
    pub fn query_metrics(
        &self,
        target_id: Uuid,
        metric: MetricKind,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, target_id, metric_kind, value_kind, value, created_at FROM monitoring_metrics
             WHERE target_id = ?1 AND metric_kind = ?2 AND created_at >= ?3 AND created_at <= ?4
             ORDER BY created_at DESC",
        )?;

        let samples = stmt
            .query_map(
                params![
                    target_id.to_string(),
                    metric.as_str(),
                    format_db_time(from),
                    format_db_time(to),
                ],
                sample_from_row,
            )?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(samples)
    }

    /// Delete every sample created before `cutoff`. Returns the number removed.
    pub fn remove_metrics_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM monitoring_metrics WHERE created_at < ?1",
            params![format_db_time(cutoff)],
        )?;
        Ok(removed)
    }

    /// Total number of stored samples.
    pub fn count_metrics(&self) -> Result<i64, DbError> {
        let conn = self.conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM monitoring_metrics", [], |r| r.get(0))?)
    }
}

#[async_trait]
impl TargetDirectory for Store {
    async fn get_target(&self, id: Uuid) -> Result<MonitoringTarget, TargetError> {
        match Store::get_target(self, id) {
            Ok(target) => Ok(target),
            Err(DbError::NotFound) => Err(TargetError::NotFound(id)),
            Err(e) => Err(e.into()),
        }
    }
}

fn target_from_row(row: &Row<'_>) -> SqlResult<MonitoringTarget> {
    let engine: String = row.get(3)?;
    Ok(MonitoringTarget {
        id: uuid_column(row, 0)?,
        owner_id: uuid_column(row, 1)?,
        name: row.get(2)?,
        engine: engine.parse::<EngineKind>().map_err(|e| conversion_error(3, e))?,
        version: row.get(4)?,
        host: row.get(5)?,
        port: row.get(6)?,
        username: row.get(7)?,
        password: row.get(8)?,
        database: row.get(9)?,
        use_tls: row.get(10)?,
    })
}

fn settings_from_row(row: &Row<'_>) -> SqlResult<MonitoringSettings> {
    let raw: String = row.get(5)?;
    Ok(MonitoringSettings {
        target_id: uuid_column(row, 0)?,
        is_system_resources_monitoring_enabled: row.get(1)?,
        is_db_resources_monitoring_enabled: row.get(2)?,
        is_queries_monitoring_enabled: row.get(3)?,
        monitoring_interval_seconds: row.get(4)?,
        installed_extensions: InstalledExtensions::decode(&raw),
    })
}

fn sample_from_row(row: &Row<'_>) -> SqlResult<MetricSample> {
    let metric: String = row.get(2)?;
    let value_kind: String = row.get(3)?;
    let created_at: String = row.get(5)?;
    Ok(MetricSample {
        id: uuid_column(row, 0)?,
        target_id: uuid_column(row, 1)?,
        metric: metric.parse().map_err(|e: String| conversion_error(2, e))?,
        value_kind: value_kind.parse().map_err(|e: String| conversion_error(3, e))?,
        value: row.get(4)?,
        created_at: parse_db_time(&created_at)
            .ok_or_else(|| conversion_error(5, format!("bad timestamp: {}", created_at)))?,
    })
}

fn uuid_column(row: &Row<'_>, idx: usize) -> SqlResult<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, err.into())
}

fn format_db_time(t: DateTime<Utc>) -> String {
    t.format(TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [TIME_FORMAT, "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}
