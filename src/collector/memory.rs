//! Memory usage collector.
//!
//! PostgreSQL exposes no per-database RSS, so buffer hits stand in for the
//! memory the database is touching.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use super::{blocks_to_bytes, Collector, CollectorError};
use crate::db::{MetricKind, MetricSample};

const BUFFER_HITS_QUERY: &str = "
    SELECT COALESCE(SUM(blks_hit), 0)::bigint AS buffer_hits
    FROM pg_stat_database
    WHERE datname = current_database()
";

#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryCollector;

#[async_trait]
impl Collector for MemoryCollector {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn collect(
        &self,
        conn: &mut PgConnection,
        target_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>, CollectorError> {
        let hits: i64 = sqlx::query_scalar(BUFFER_HITS_QUERY).fetch_one(&mut *conn).await?;

        Ok(vec![MetricSample::bytes(
            target_id,
            MetricKind::DbRamUsage,
            blocks_to_bytes(hits),
            at,
        )])
    }
}
