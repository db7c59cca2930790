//! Ad-hoc SQL execution against monitored targets.
//!
//! Every call builds its own tiny pool (at most two connections, 90s idle
//! timeout), runs one statement under a deadline and closes the pool again.
//! Select-like statements are capped by wrapping them in a `LIMIT`
//! subquery; everything else runs as-is and reports affected rows.

mod cell;
mod classify;
mod validator;

pub use cell::*;
pub use classify::*;
pub use validator::*;

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Column, Executor, Statement};
use thiserror::Error;

use crate::config::ServerConfig;
use crate::target::{EngineKind, MonitoringTarget, TargetError};

/// Hard ceiling on a caller-supplied row cap.
pub const MAX_ROWS_CEILING: i64 = 10_000;

/// Longest caller-supplied time budget, in seconds.
pub const MAX_TIMEOUT_SECS: i64 = 119;

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("only PostgreSQL targets are supported, got {0}")]
    UnsupportedEngine(EngineKind),
    #[error(transparent)]
    Target(#[from] TargetError),
    #[error("statement is empty")]
    EmptyStatement,
    #[error("only single SELECT/WITH statements are allowed")]
    NotReadOnly,
    #[error("query timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Execution(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub sql: String,
    #[serde(default)]
    pub max_rows: Option<i64>,
    #[serde(default, rename = "timeoutSec")]
    pub timeout_seconds: Option<i64>,
}

impl QueryRequest {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            ..Default::default()
        }
    }

    pub fn max_rows(mut self, rows: i64) -> Self {
        self.max_rows = Some(rows);
        self
    }

    pub fn timeout_seconds(mut self, secs: i64) -> Self {
        self.timeout_seconds = Some(secs);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
    /// Rows returned for select-like statements, rows affected otherwise.
    pub row_count: u64,
    /// Set when the row cap was reached. Reaching it exactly also counts.
    pub truncated: bool,
    pub execution_ms: u64,
}

/// Effective limits for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryLimits {
    pub max_rows: usize,
    pub timeout: Duration,
}

/// Runs caller-supplied SQL against a target.
#[derive(Debug, Clone)]
pub struct QueryGateway {
    default_rows: usize,
    default_timeout: Duration,
    read_only: bool,
}

impl Default for QueryGateway {
    fn default() -> Self {
        Self {
            default_rows: 1000,
            default_timeout: Duration::from_secs(30),
            read_only: false,
        }
    }
}

impl QueryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(cfg: &ServerConfig) -> Self {
        Self {
            default_rows: cfg.query_default_rows,
            default_timeout: cfg.query_default_timeout,
            read_only: cfg.query_read_only,
        }
    }

    /// Reject anything [`is_safe_select`] does not accept.
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Resolve the request's limits. Out-of-range values fall back to the
    /// defaults rather than being clamped.
    pub fn limits_for(&self, request: &QueryRequest) -> QueryLimits {
        let max_rows = request
            .max_rows
            .filter(|n| (1..=MAX_ROWS_CEILING).contains(n))
            .map(|n| n as usize)
            .unwrap_or(self.default_rows);

        let timeout = request
            .timeout_seconds
            .filter(|s| (1..=MAX_TIMEOUT_SECS).contains(s))
            .map(|s| Duration::from_secs(s as u64))
            .unwrap_or(self.default_timeout);

        QueryLimits { max_rows, timeout }
    }

    /// Execute one statement. Nothing partial is returned on error.
    pub async fn execute(&self, target: &MonitoringTarget, request: &QueryRequest) -> Result<QueryResult, QueryError> {
        if !target.is_postgres() {
            return Err(QueryError::UnsupportedEngine(target.engine));
        }

        let sql = request.sql.trim();
        if sql.is_empty() {
            return Err(QueryError::EmptyStatement);
        }

        if self.read_only && !is_safe_select(sql) {
            return Err(QueryError::NotReadOnly);
        }

        let options = target.connect_options()?;
        let limits = self.limits_for(request);

        let pool = PgPoolOptions::new()
            .max_connections(2)
            .min_connections(0)
            .idle_timeout(Duration::from_secs(90))
            .acquire_timeout(limits.timeout)
            .connect_lazy_with(options);

        let started = Instant::now();
        let outcome = tokio::time::timeout(limits.timeout, run_statement(&pool, sql, limits.max_rows)).await;
        pool.close().await;

        let mut result = outcome.map_err(|_| QueryError::Timeout(limits.timeout))??;
        result.execution_ms = started.elapsed().as_millis() as u64;

        tracing::debug!(
            "Query: {} on {} returned {} rows in {}ms",
            if result.columns.is_empty() { "statement" } else { "select" },
            target.name,
            result.row_count,
            result.execution_ms
        );

        Ok(result)
    }
}

async fn run_statement(pool: &PgPool, sql: &str, max_rows: usize) -> Result<QueryResult, QueryError> {
    if !is_select_like(sql) {
        let done = sqlx::raw_sql(sql).execute(pool).await?;
        return Ok(QueryResult {
            columns: Vec::new(),
            rows: Vec::new(),
            row_count: done.rows_affected(),
            truncated: false,
            execution_ms: 0,
        });
    }

    let bounded = ensure_limit(sql, max_rows);

    // Column names come from the statement description so they are known
    // even when no rows come back.
    let statement = pool.prepare(&bounded).await?;
    let columns = statement.columns().iter().map(|c| c.name().to_string()).collect();

    // The simple protocol returns text-format values, which lets unknown
    // types fall back to their text form.
    let rows: Vec<Vec<CellValue>> = sqlx::raw_sql(&bounded)
        .fetch_all(pool)
        .await?
        .iter()
        .map(decode_row)
        .collect();

    let returned = rows.len();

    Ok(QueryResult {
        columns,
        rows,
        row_count: returned as u64,
        truncated: returned >= max_rows,
        execution_ms: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::testing::live_target;
    use uuid::Uuid;

    fn local_target() -> MonitoringTarget {
        MonitoringTarget {
            name: "local".to_string(),
            database: Some("postgres".to_string()),
            ..Default::default()
        }
    }

    /// A target pointing at a live server, if one is configured.
    #[test]
    fn test_limits_fall_back_to_defaults() {
        let gateway = QueryGateway::new();

        let limits = gateway.limits_for(&QueryRequest::new("SELECT 1"));
        assert_eq!(limits.max_rows, 1000);
        assert_eq!(limits.timeout, Duration::from_secs(30));

        let limits = gateway.limits_for(&QueryRequest::new("SELECT 1").max_rows(10_000).timeout_seconds(119));
        assert_eq!(limits.max_rows, 10_000);
        assert_eq!(limits.timeout, Duration::from_secs(119));

        let limits = gateway.limits_for(&QueryRequest::new("SELECT 1").max_rows(10_001).timeout_seconds(120));
        assert_eq!(limits.max_rows, 1000);
        assert_eq!(limits.timeout, Duration::from_secs(30));

        let limits = gateway.limits_for(&QueryRequest::new("SELECT 1").max_rows(0).timeout_seconds(-5));
        assert_eq!(limits.max_rows, 1000);
        assert_eq!(limits.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_limits_from_config() {
        let cfg = ServerConfig {
            query_default_rows: 50,
            query_default_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let limits = QueryGateway::from_config(&cfg).limits_for(&QueryRequest::new("SELECT 1"));
        assert_eq!(limits, QueryLimits { max_rows: 50, timeout: Duration::from_secs(5) });
    }

    #[test]
    fn test_request_json_shape() {
        let request: QueryRequest =
            serde_json::from_str(r#"{"sql":"SELECT 1","maxRows":5,"timeoutSec":10}"#).unwrap();
        assert_eq!(request.max_rows, Some(5));
        assert_eq!(request.timeout_seconds, Some(10));

        let request: QueryRequest = serde_json::from_str(r#"{"sql":"SELECT 1"}"#).unwrap();
        assert_eq!(request.max_rows, None);
    }

    #[tokio::test]
    async fn test_rejections_before_io() {
        let gateway = QueryGateway::new();

        let mysql = MonitoringTarget {
            engine: EngineKind::Mysql,
            ..local_target()
        };
        let err = gateway.execute(&mysql, &QueryRequest::new("SELECT 1")).await.unwrap_err();
        assert!(matches!(err, QueryError::UnsupportedEngine(EngineKind::Mysql)));

        let err = gateway.execute(&local_target(), &QueryRequest::new("  \n")).await.unwrap_err();
        assert!(matches!(err, QueryError::EmptyStatement));

        let no_db = MonitoringTarget {
            id: Uuid::new_v4(),
            database: None,
            ..local_target()
        };
        let err = gateway.execute(&no_db, &QueryRequest::new("SELECT 1")).await.unwrap_err();
        assert!(matches!(err, QueryError::Target(TargetError::MissingDatabase(_))));

        let err = gateway
            .clone()
            .with_read_only(true)
            .execute(&local_target(), &QueryRequest::new("SELECT 1; DROP TABLE t"))
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::NotReadOnly));
    }

    #[tokio::test]
    async fn test_unreachable_target_fails() {
        let target = MonitoringTarget {
            host: "127.0.0.1".to_string(),
            port: 1,
            ..local_target()
        };
        let result = QueryGateway::new()
            .execute(&target, &QueryRequest::new("SELECT 1").timeout_seconds(2))
            .await;
        tokio_test::assert_err!(result);
    }

    #[tokio::test]
    async fn test_live_select_update_and_truncation() {
        let Some(target) = live_target() else {
            return;
        };
        let gateway = QueryGateway::new();
        let table = format!("pgwarden_gateway_{}", Uuid::new_v4().simple());

        gateway
            .execute(&target, &QueryRequest::new(format!("CREATE TABLE {} (x int)", table)))
            .await
            .unwrap();

        let inserted = gateway
            .execute(
                &target,
                &QueryRequest::new(format!("INSERT INTO {} SELECT generate_series(1, 5)", table)),
            )
            .await
            .unwrap();
        assert_eq!(inserted.row_count, 5);

        let capped = gateway
            .execute(&target, &QueryRequest::new(format!("SELECT * FROM {}", table)).max_rows(2))
            .await
            .unwrap();
        assert_eq!(capped.columns, vec!["x".to_string()]);
        assert_eq!(capped.rows.len(), 2);
        assert!(capped.truncated);

        let all = gateway
            .execute(&target, &QueryRequest::new(format!("SELECT * FROM {}", table)).max_rows(10))
            .await
            .unwrap();
        assert_eq!(all.rows.len(), 5);
        assert_eq!(all.row_count, 5);
        assert!(!all.truncated);

        let updated = gateway
            .execute(&target, &QueryRequest::new(format!("UPDATE {} SET x = 1", table)))
            .await
            .unwrap();
        assert_eq!(updated.row_count, 5);
        assert!(updated.columns.is_empty());
        assert!(updated.rows.is_empty());

        let empty = gateway
            .execute(&target, &QueryRequest::new(format!("SELECT x FROM {} WHERE x > 1", table)))
            .await
            .unwrap();
        assert_eq!(empty.columns, vec!["x".to_string()]);
        assert!(empty.rows.is_empty());
        assert!(!empty.truncated);

        gateway
            .execute(&target, &QueryRequest::new(format!("DROP TABLE {}", table)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_live_cell_types() {
        let Some(target) = live_target() else {
            return;
        };

        let result = QueryGateway::new()
            .execute(
                &target,
                &QueryRequest::new(
                    "SELECT 1::int4 AS a, 'x'::text AS b, NULL::int8 AS c, true AS d, 1.5::float8 AS e, 12.50::numeric AS f",
                ),
            )
            .await
            .unwrap();

        assert_eq!(result.columns, vec!["a", "b", "c", "d", "e", "f"]);
        assert_eq!(
            result.rows,
            vec![vec![
                CellValue::Integer(1),
                CellValue::Text("x".to_string()),
                CellValue::Null,
                CellValue::Boolean(true),
                CellValue::Float(1.5),
                CellValue::Text("12.50".to_string()),
            ]]
        );
    }

    #[tokio::test]
    async fn test_live_timeout() {
        let Some(target) = live_target() else {
            return;
        };

        let err = QueryGateway::new()
            .execute(&target, &QueryRequest::new("SELECT pg_sleep(5)").timeout_seconds(1))
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_live_select_with_trailing_comments() {
        let Some(target) = live_target() else {
            return;
        };

        let gateway = QueryGateway::new();
        for sql in ["SELECT 1 AS x -- check", "SELECT 1 AS x; -- done"] {
            let result = gateway.execute(&target, &QueryRequest::new(sql)).await.unwrap();
            assert_eq!(result.columns, vec!["x"], "{}", sql);
            assert_eq!(result.rows, vec![vec![CellValue::Integer(1)]], "{}", sql);
            assert!(!result.truncated);
        }
    }
}
