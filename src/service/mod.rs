//! Caller-facing services over the store: monitoring settings and metric
//! reads. Ownership is checked here and nowhere below.

mod metrics;
mod settings;

pub use metrics::*;
pub use settings::*;

use thiserror::Error;

use crate::db::DbError;
use crate::target::TargetError;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("user does not have access to this target")]
    AccessDenied,
    #[error("not found")]
    NotFound,
    #[error("invalid settings: {0}")]
    Validation(String),
    #[error("{0}")]
    Extension(String),
    #[error(transparent)]
    Target(#[from] TargetError),
    #[error("storage error: {0}")]
    Db(#[from] DbError),
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::db::PostgresExtension;
    use crate::target::{ConnectivityError, ExtensionInstaller, MonitoringTarget};

    /// Records install requests and fails for the listed extension names.
    #[derive(Default)]
    pub struct FakeInstaller {
        failing: HashSet<&'static str>,
        installed: Mutex<Vec<String>>,
    }

    impl FakeInstaller {
        pub fn failing(names: &[&'static str]) -> Self {
            Self {
                failing: names.iter().copied().collect(),
                ..Default::default()
            }
        }

        pub fn installed(&self) -> Vec<String> {
            self.installed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ExtensionInstaller for FakeInstaller {
        async fn install_extensions(
            &self,
            _target: &MonitoringTarget,
            extensions: &[PostgresExtension],
        ) -> Result<(), ConnectivityError> {
            for ext in extensions {
                if self.failing.contains(ext.name()) {
                    return Err(ConnectivityError::Unsupported(format!("extension \"{}\" is not available", ext)));
                }
                self.installed.lock().unwrap().push(ext.name().to_string());
            }
            Ok(())
        }
    }
}
