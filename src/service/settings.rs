//! Monitoring settings service.

use std::sync::Arc;

use uuid::Uuid;

use super::ServiceError;
use crate::db::{MonitoringSettings, PostgresExtension, Store};
use crate::target::{Caller, ExtensionInstaller, MonitoringTarget, TargetDirectory};

/// Oldest major version the monitoring extensions are installed on.
pub const MIN_EXTENSION_VERSION: u32 = 16;

/// Reads and writes per-target monitoring settings, installing the
/// extensions a feature needs when it is switched on.
pub struct SettingsService {
    store: Arc<Store>,
    targets: Arc<dyn TargetDirectory>,
    installer: Arc<dyn ExtensionInstaller>,
}

impl SettingsService {
    pub fn new(store: Arc<Store>, targets: Arc<dyn TargetDirectory>, installer: Arc<dyn ExtensionInstaller>) -> Self {
        Self {
            store,
            targets,
            installer,
        }
    }

    /// Create default settings for a newly seen target.
    ///
    /// Every feature starts enabled. A feature whose extension cannot be
    /// installed is switched off instead of failing the whole call. Returns
    /// `None` for targets that are not PostgreSQL.
    pub async fn provision(&self, target_id: Uuid) -> Result<Option<MonitoringSettings>, ServiceError> {
        let target = self.targets.get_target(target_id).await?;
        if !target.is_postgres() {
            return Ok(None);
        }

        let mut settings = MonitoringSettings::defaults_for(target_id);

        match self.ensure_installed(&target, PostgresExtension::PgProctab).await {
            Ok(()) => {
                settings.installed_extensions.insert(PostgresExtension::PgProctab);
            }
            Err(e) => {
                tracing::warn!("Settings: system resources monitoring disabled for {}: {}", target.name, e);
                settings.is_system_resources_monitoring_enabled = false;
            }
        }

        match self.ensure_installed(&target, PostgresExtension::PgStatMonitor).await {
            Ok(()) => {
                settings.installed_extensions.insert(PostgresExtension::PgStatMonitor);
            }
            Err(e) => {
                tracing::warn!("Settings: queries monitoring disabled for {}: {}", target.name, e);
                settings.is_queries_monitoring_enabled = false;
            }
        }

        self.store.save_settings(&settings)?;

        tracing::info!("Settings: provisioned monitoring for {}", target.name);

        Ok(Some(settings))
    }

    /// Settings for a target the caller owns, provisioning them on first
    /// access.
    pub async fn get(&self, caller: &Caller, target_id: Uuid) -> Result<MonitoringSettings, ServiceError> {
        let target = self.owned_target(caller, target_id).await?;

        if let Some(settings) = self.store.get_settings(target.id)? {
            return Ok(settings);
        }

        self.provision(target.id).await?.ok_or(ServiceError::NotFound)
    }

    /// Validate and store new settings.
    ///
    /// Switching system resources or queries monitoring from off to on
    /// installs its extension first; if that fails nothing is saved.
    pub async fn save(&self, caller: &Caller, mut settings: MonitoringSettings) -> Result<MonitoringSettings, ServiceError> {
        let target = self.owned_target(caller, settings.target_id).await?;

        if settings.monitoring_interval_seconds <= 0 {
            return Err(ServiceError::Validation(format!(
                "monitoring interval must be positive, got {}",
                settings.monitoring_interval_seconds
            )));
        }

        if let Some(existing) = self.store.get_settings(target.id)? {
            settings
                .installed_extensions
                .extend(existing.installed_extensions.iter().cloned());

            if settings.is_system_resources_monitoring_enabled && !existing.is_system_resources_monitoring_enabled {
                self.ensure_installed(&target, PostgresExtension::PgProctab)
                    .await
                    .map_err(|e| {
                        ServiceError::Extension(format!(
                            "failed to install pg_proctab extension, system resources monitoring is not possible (please disable it): {}",
                            e
                        ))
                    })?;
                settings.installed_extensions.insert(PostgresExtension::PgProctab);
            }

            if settings.is_queries_monitoring_enabled && !existing.is_queries_monitoring_enabled {
                self.ensure_installed(&target, PostgresExtension::PgStatMonitor)
                    .await
                    .map_err(|e| {
                        ServiceError::Extension(format!(
                            "failed to install pg_stat_monitor extension, queries monitoring is not possible (please disable it): {}",
                            e
                        ))
                    })?;
                settings.installed_extensions.insert(PostgresExtension::PgStatMonitor);
            }
        }

        self.store.save_settings(&settings)?;
        Ok(settings)
    }

    async fn owned_target(&self, caller: &Caller, target_id: Uuid) -> Result<MonitoringTarget, ServiceError> {
        let target = self.targets.get_target(target_id).await?;
        if !caller.owns(&target) {
            return Err(ServiceError::AccessDenied);
        }
        Ok(target)
    }

    async fn ensure_installed(&self, target: &MonitoringTarget, extension: PostgresExtension) -> Result<(), ServiceError> {
        if !target.is_postgres() {
            return Err(ServiceError::Extension("target is not a PostgreSQL database".to_string()));
        }

        if target.version < MIN_EXTENSION_VERSION {
            return Err(ServiceError::Extension(format!(
                "monitoring extensions are supported for PostgreSQL {}+",
                MIN_EXTENSION_VERSION
            )));
        }

        self.installer
            .install_extensions(target, &[extension])
            .await
            .map_err(|e| ServiceError::Extension(e.to_string()))
    }
}
