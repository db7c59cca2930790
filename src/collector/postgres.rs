//! Direct PostgreSQL access: metric sampling, extension installs and
//! connection checks.
//!
//! Every function here opens its own short-lived connection and closes it on
//! the way out, whether or not the work succeeded.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use sqlx::{Connection, Executor, PgConnection};

use super::{CollectorSet, SampleSource};
use crate::db::{MetricSample, MonitoringSettings, PostgresExtension};
use crate::target::{ConnectivityError, ExtensionInstaller, MonitoringTarget};

/// Open a connection to the target's designated database.
pub async fn connect(target: &MonitoringTarget) -> Result<PgConnection, ConnectivityError> {
    let options = target.connect_options()?;
    let database = target.database_name().unwrap_or_default().to_string();

    PgConnection::connect_with(&options)
        .await
        .map_err(|source| ConnectivityError::Connect { database, source })
}

async fn close(conn: PgConnection, target: &MonitoringTarget) {
    if let Err(e) = conn.close().await {
        tracing::error!("Failed to close connection to {}: {}", target.name, e);
    }
}

/// Samples targets by running a [`CollectorSet`] over a fresh connection.
#[derive(Clone)]
pub struct PostgresSampler {
    collectors: CollectorSet,
}

impl PostgresSampler {
    pub fn new(collectors: CollectorSet) -> Self {
        Self { collectors }
    }
}

impl Default for PostgresSampler {
    fn default() -> Self {
        Self::new(CollectorSet::standard())
    }
}

#[async_trait]
impl SampleSource for PostgresSampler {
    async fn sample(
        &self,
        target: &MonitoringTarget,
        settings: &MonitoringSettings,
        at: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>, ConnectivityError> {
        if target.database_name().is_none() {
            tracing::debug!(
                "Collector: target {} has no database configured, nothing to collect",
                target.id
            );
            return Ok(Vec::new());
        }

        tracing::debug!("Collector: collecting metrics for target {}", target.id);

        let mut conn = connect(target).await?;
        let samples = self.collectors.collect(&mut conn, settings, target.id, at).await;
        close(conn, target).await;

        Ok(samples)
    }
}

/// Installs extensions over a direct connection with a bounded budget.
#[derive(Debug, Clone, Copy)]
pub struct PostgresExtensionInstaller {
    timeout: Duration,
}

impl PostgresExtensionInstaller {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for PostgresExtensionInstaller {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl ExtensionInstaller for PostgresExtensionInstaller {
    async fn install_extensions(
        &self,
        target: &MonitoringTarget,
        extensions: &[PostgresExtension],
    ) -> Result<(), ConnectivityError> {
        if extensions.is_empty() {
            return Ok(());
        }

        tokio::time::timeout(self.timeout, async {
            let mut conn = connect(target).await?;
            let result = install_missing(&mut conn, extensions).await;
            close(conn, target).await;
            result
        })
        .await
        .map_err(|_| ConnectivityError::Timeout(self.timeout))?
    }
}

async fn install_missing(
    conn: &mut PgConnection,
    extensions: &[PostgresExtension],
) -> Result<(), ConnectivityError> {
    let installed: Vec<String> = sqlx::query_scalar("SELECT extname::text FROM pg_extension")
        .fetch_all(&mut *conn)
        .await?;

    for extension in extensions {
        if installed.iter().any(|name| name == extension.name()) {
            continue;
        }

        let stmt = format!("CREATE EXTENSION IF NOT EXISTS {}", quote_ident(extension.name()));
        (&mut *conn).execute(sqlx::raw_sql(&stmt)).await.map_err(|e| {
            ConnectivityError::Unsupported(format!("failed to install extension '{}': {}", extension, e))
        })?;

        tracing::info!("Installed extension {}", extension);
    }

    Ok(())
}

/// Quote an SQL identifier, doubling embedded quotes.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Check that a target is reachable, runs the declared major version and
/// grants CONNECT on its database.
pub async fn verify_connection(target: &MonitoringTarget, timeout: Duration) -> Result<(), ConnectivityError> {
    tokio::time::timeout(timeout, async {
        let mut conn = connect(target).await?;
        let result = verify_target(&mut conn, target).await;
        close(conn, target).await;
        result
    })
    .await
    .map_err(|_| ConnectivityError::Timeout(timeout))?
}

async fn verify_target(conn: &mut PgConnection, target: &MonitoringTarget) -> Result<(), ConnectivityError> {
    let version: String = sqlx::query_scalar("SELECT version()").fetch_one(&mut *conn).await?;

    let actual = parse_major_version(&version)
        .ok_or_else(|| ConnectivityError::Unsupported(format!("could not parse version from: {}", version)))?;

    if actual != target.version {
        return Err(ConnectivityError::Unsupported(format!(
            "wrong version specified: server runs {}, target declares {}",
            actual, target.version
        )));
    }

    let can_connect: bool =
        sqlx::query_scalar("SELECT has_database_privilege(current_user, current_database(), 'CONNECT')")
            .fetch_one(&mut *conn)
            .await?;

    if !can_connect {
        return Err(ConnectivityError::Unsupported(format!(
            "user does not have CONNECT privilege on database '{}'",
            target.database_name().unwrap_or_default()
        )));
    }

    Ok(())
}

/// Extract the major version from `SELECT version()` output.
fn parse_major_version(version: &str) -> Option<u32> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"PostgreSQL (\d+)").unwrap());

    re.captures(version)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}
