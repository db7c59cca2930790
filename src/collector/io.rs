//! I/O activity collector.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use super::{blocks_to_bytes, Collector, CollectorError};
use crate::db::{MetricKind, MetricSample};

const IO_QUERY: &str = "
    SELECT
        COALESCE(SUM(blks_read), 0)::bigint AS total_reads,
        COALESCE(SUM(blks_hit), 0)::bigint AS total_hits
    FROM pg_stat_database
    WHERE datname = current_database()
";

/// Reports blocks read plus blocks hit for the current database, in bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct IoActivityCollector;

#[async_trait]
impl Collector for IoActivityCollector {
    fn name(&self) -> &'static str {
        "io_activity"
    }

    async fn collect(
        &self,
        conn: &mut PgConnection,
        target_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>, CollectorError> {
        let (reads, hits): (i64, i64) = sqlx::query_as(IO_QUERY).fetch_one(&mut *conn).await?;

        let blocks = reads
            .checked_add(hits)
            .ok_or_else(|| CollectorError::Value(format!("block counters overflow: {} + {}", reads, hits)))?;

        Ok(vec![MetricSample::bytes(
            target_id,
            MetricKind::DbIoUsage,
            blocks_to_bytes(blocks),
            at,
        )])
    }
}
