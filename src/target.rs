//! Monitored database endpoints and the interfaces used to reach them.
//!
//! Connection profiles are owned elsewhere; this module only reads them.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{DbError, PostgresExtension};

/// Errors raised while turning a target into something connectable.
#[derive(Error, Debug)]
pub enum TargetError {
    #[error("target {0} not found")]
    NotFound(Uuid),
    #[error("database name is required to connect to target {0}")]
    MissingDatabase(Uuid),
    #[error("unknown engine: {0}")]
    UnknownEngine(String),
    #[error("storage error: {0}")]
    Db(#[from] DbError),
}

/// Failures talking to a target over the network.
#[derive(Error, Debug)]
pub enum ConnectivityError {
    #[error(transparent)]
    Target(#[from] TargetError),
    #[error("failed to connect to database '{database}': {source}")]
    Connect {
        database: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("query failed: {0}")]
    Query(#[from] sqlx::Error),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Unsupported(String),
}

/// Database engine behind a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineKind {
    Postgres,
    Mysql,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Postgres => "POSTGRES",
            EngineKind::Mysql => "MYSQL",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineKind {
    type Err = TargetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "POSTGRES" | "POSTGRESQL" => Ok(EngineKind::Postgres),
            "MYSQL" => Ok(EngineKind::Mysql),
            other => Err(TargetError::UnknownEngine(other.to_string())),
        }
    }
}

/// A reachable database endpoint under monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringTarget {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub engine: EngineKind,
    /// Major server version, e.g. 16.
    pub version: u32,
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub database: Option<String>,
    pub use_tls: bool,
}

impl Default for MonitoringTarget {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: Uuid::nil(),
            name: String::new(),
            engine: EngineKind::Postgres,
            version: 16,
            host: "localhost".to_string(),
            port: 5432,
            username: "postgres".to_string(),
            password: String::new(),
            database: None,
            use_tls: false,
        }
    }
}

impl MonitoringTarget {
    pub fn is_postgres(&self) -> bool {
        self.engine == EngineKind::Postgres
    }

    /// The configured database name, if it is non-empty.
    pub fn database_name(&self) -> Option<&str> {
        self.database.as_deref().filter(|d| !d.is_empty())
    }

    /// Connect options for the target's designated database.
    ///
    /// Fails when no database name is configured: every operation against a
    /// target needs a concrete database.
    pub fn connect_options(&self) -> Result<PgConnectOptions, TargetError> {
        let database = self
            .database_name()
            .ok_or(TargetError::MissingDatabase(self.id))?;

        let ssl_mode = if self.use_tls {
            PgSslMode::Require
        } else {
            PgSslMode::Disable
        };

        Ok(PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.username)
            .password(&self.password)
            .database(database)
            .ssl_mode(ssl_mode)
            .application_name("pgwarden"))
    }
}

/// The party invoking a service-layer operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub id: Uuid,
}

impl Caller {
    pub fn new(id: Uuid) -> Self {
        Self { id }
    }

    pub fn owns(&self, target: &MonitoringTarget) -> bool {
        target.owner_id == self.id
    }
}

/// Resolves target identifiers to live connection profiles.
#[async_trait]
pub trait TargetDirectory: Send + Sync {
    async fn get_target(&self, id: Uuid) -> Result<MonitoringTarget, TargetError>;
}

/// Installs PostgreSQL extensions on a target. Already-installed extensions
/// are skipped.
#[async_trait]
pub trait ExtensionInstaller: Send + Sync {
    async fn install_extensions(
        &self,
        target: &MonitoringTarget,
        extensions: &[PostgresExtension],
    ) -> Result<(), ConnectivityError>;
}
