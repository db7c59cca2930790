//! Database model types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a metric sample measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricKind {
    #[serde(rename = "DB_RAM_USAGE")]
    DbRamUsage,
    #[serde(rename = "DB_IO_USAGE")]
    DbIoUsage,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::DbRamUsage => "DB_RAM_USAGE",
            MetricKind::DbIoUsage => "DB_IO_USAGE",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DB_RAM_USAGE" => Ok(MetricKind::DbRamUsage),
            "DB_IO_USAGE" => Ok(MetricKind::DbIoUsage),
            other => Err(format!("unknown metric kind: {}", other)),
        }
    }
}

/// Unit of a metric sample's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueKind {
    Byte,
    Percent,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Byte => "BYTE",
            ValueKind::Percent => "PERCENT",
        }
    }
}

impl FromStr for ValueKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BYTE" => Ok(ValueKind::Byte),
            "PERCENT" => Ok(ValueKind::Percent),
            other => Err(format!("unknown value kind: {}", other)),
        }
    }
}

/// A single time-series observation. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSample {
    pub id: Uuid,
    pub target_id: Uuid,
    pub metric: MetricKind,
    pub value_kind: ValueKind,
    pub value: f64,
    pub created_at: DateTime<Utc>,
}

impl MetricSample {
    pub fn bytes(target_id: Uuid, metric: MetricKind, value: f64, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            target_id,
            metric,
            value_kind: ValueKind::Byte,
            value,
            created_at,
        }
    }
}

/// A PostgreSQL extension that gates a monitoring feature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PostgresExtension {
    PgProctab,
    PgStatMonitor,
    Other(String),
}

impl PostgresExtension {
    pub fn name(&self) -> &str {
        match self {
            PostgresExtension::PgProctab => "pg_proctab",
            PostgresExtension::PgStatMonitor => "pg_stat_monitor",
            PostgresExtension::Other(name) => name,
        }
    }
}

impl From<&str> for PostgresExtension {
    fn from(name: &str) -> Self {
        match name {
            "pg_proctab" => PostgresExtension::PgProctab,
            "pg_stat_monitor" => PostgresExtension::PgStatMonitor,
            other => PostgresExtension::Other(other.to_string()),
        }
    }
}

impl fmt::Display for PostgresExtension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for PostgresExtension {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for PostgresExtension {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(PostgresExtension::from(name.as_str()))
    }
}

/// Extensions known to be installed on a target, in install order, without
/// duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstalledExtensions(Vec<PostgresExtension>);

impl InstalledExtensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an extension unless it is already present.
    pub fn insert(&mut self, extension: PostgresExtension) -> bool {
        if self.0.contains(&extension) {
            return false;
        }
        self.0.push(extension);
        true
    }

    pub fn extend<I: IntoIterator<Item = PostgresExtension>>(&mut self, extensions: I) {
        for ext in extensions {
            self.insert(ext);
        }
    }

    pub fn contains(&self, extension: &PostgresExtension) -> bool {
        self.0.contains(extension)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PostgresExtension> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Column encoding. Only the store should call this.
    pub(crate) fn encode(&self) -> String {
        self.0
            .iter()
            .map(|e| e.name())
            .collect::<Vec<_>>()
            .join(",")
    }

    pub(crate) fn decode(raw: &str) -> Self {
        let mut set = Self::new();
        for name in raw.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            set.insert(PostgresExtension::from(name));
        }
        set
    }
}

impl FromIterator<PostgresExtension> for InstalledExtensions {
    fn from_iter<I: IntoIterator<Item = PostgresExtension>>(iter: I) -> Self {
        let mut set = Self::new();
        set.extend(iter);
        set
    }
}

/// Per-target monitoring configuration. One row per target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringSettings {
    pub target_id: Uuid,
    pub is_system_resources_monitoring_enabled: bool,
    pub is_db_resources_monitoring_enabled: bool,
    pub is_queries_monitoring_enabled: bool,
    pub monitoring_interval_seconds: i64,
    #[serde(default)]
    pub installed_extensions: InstalledExtensions,
}

impl MonitoringSettings {
    /// Permissive defaults used when a target is first seen.
    pub fn defaults_for(target_id: Uuid) -> Self {
        Self {
            target_id,
            is_system_resources_monitoring_enabled: true,
            is_db_resources_monitoring_enabled: true,
            is_queries_monitoring_enabled: true,
            monitoring_interval_seconds: 15,
            installed_extensions: InstalledExtensions::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_installed_extensions_dedupe_and_order() {
        let mut set = InstalledExtensions::new();
        assert!(set.insert(PostgresExtension::PgStatMonitor));
        assert!(set.insert(PostgresExtension::PgProctab));
        assert!(!set.insert(PostgresExtension::PgStatMonitor));

        assert_eq!(set.len(), 2);
        assert_eq!(set.encode(), "pg_stat_monitor,pg_proctab");
    }

    #[test]
    fn test_installed_extensions_decode() {
        assert!(InstalledExtensions::decode("").is_empty());

        let set = InstalledExtensions::decode("pg_proctab, pg_proctab,timescaledb");
        assert_eq!(set.len(), 2);
        assert!(set.contains(&PostgresExtension::PgProctab));
        assert!(set.contains(&PostgresExtension::Other("timescaledb".to_string())));
    }

    #[test]
    fn test_settings_json_shape() {
        let mut settings = MonitoringSettings::defaults_for(Uuid::nil());
        settings.installed_extensions.insert(PostgresExtension::PgProctab);

        let json = serde_json::to_value(&settings).unwrap();
        assert_eq!(json["monitoringIntervalSeconds"], 15);
        assert_eq!(json["installedExtensions"][0], "pg_proctab");
    }

    #[test]
    fn test_metric_kind_roundtrip_names() {
        for kind in [MetricKind::DbRamUsage, MetricKind::DbIoUsage] {
            assert_eq!(kind.as_str().parse::<MetricKind>().unwrap(), kind);
        }
        assert!("CPU".parse::<MetricKind>().is_err());
    }
}
