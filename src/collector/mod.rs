//! Collector module for database resource metrics.
//!
//! A collector turns an open connection into zero or more samples. Collectors
//! are independent: one failing never stops the others.

mod io;
mod memory;
mod postgres;

pub use io::*;
pub use memory::*;
pub use postgres::*;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use thiserror::Error;
use uuid::Uuid;

use crate::db::{MetricSample, MonitoringSettings};
use crate::target::{ConnectivityError, MonitoringTarget};

/// PostgreSQL page size assumed when converting block counters to bytes.
pub const PG_BLOCK_SIZE: i64 = 8192;

/// Collector error types.
#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("query failed: {0}")]
    Query(#[from] sqlx::Error),
    #[error("unexpected value: {0}")]
    Value(String),
}

/// One source of metric samples.
#[async_trait]
pub trait Collector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this collector runs under the given settings.
    fn enabled_for(&self, settings: &MonitoringSettings) -> bool {
        settings.is_db_resources_monitoring_enabled
    }

    async fn collect(
        &self,
        conn: &mut PgConnection,
        target_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>, CollectorError>;
}

/// Produces the samples for one target at one instant.
///
/// The orchestrator only sees this seam; how a source reaches the target is
/// its own business.
#[async_trait]
pub trait SampleSource: Send + Sync {
    async fn sample(
        &self,
        target: &MonitoringTarget,
        settings: &MonitoringSettings,
        at: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>, ConnectivityError>;
}

/// An ordered set of collectors run against one connection.
#[derive(Clone, Default)]
pub struct CollectorSet {
    collectors: Vec<Arc<dyn Collector>>,
}

impl CollectorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The I/O and memory collectors.
    pub fn standard() -> Self {
        Self::new()
            .with(IoActivityCollector)
            .with(MemoryCollector)
    }

    pub fn with<C: Collector + 'static>(mut self, collector: C) -> Self {
        self.collectors.push(Arc::new(collector));
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.collectors.iter().map(|c| c.name()).collect()
    }

    /// Names of the collectors that would run under `settings`.
    pub fn enabled_names(&self, settings: &MonitoringSettings) -> Vec<&'static str> {
        self.collectors
            .iter()
            .filter(|c| c.enabled_for(settings))
            .map(|c| c.name())
            .collect()
    }

    /// Run every enabled collector, keeping whatever succeeded.
    pub async fn collect(
        &self,
        conn: &mut PgConnection,
        settings: &MonitoringSettings,
        target_id: Uuid,
        at: DateTime<Utc>,
    ) -> Vec<MetricSample> {
        let mut samples = Vec::new();

        for collector in self.collectors.iter().filter(|c| c.enabled_for(settings)) {
            match collector.collect(conn, target_id, at).await {
                Ok(mut batch) => samples.append(&mut batch),
                Err(e) => {
                    tracing::warn!(
                        "Collector {} failed for target {}: {}",
                        collector.name(),
                        target_id,
                        e
                    );
                }
            }
        }

        samples
    }
}

/// Convert a block counter to bytes.
pub fn blocks_to_bytes(blocks: i64) -> f64 {
    (blocks as f64) * (PG_BLOCK_SIZE as f64)
}
