//! Metric reads for target owners.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::ServiceError;
use crate::db::{MetricKind, MetricSample, Store};
use crate::target::{Caller, TargetDirectory};

pub struct MetricsService {
    store: Arc<Store>,
    targets: Arc<dyn TargetDirectory>,
}

impl MetricsService {
    pub fn new(store: Arc<Store>, targets: Arc<dyn TargetDirectory>) -> Self {
        Self { store, targets }
    }

    /// Samples of one kind in `[from, to]`, newest first.
    ///
    /// A target the caller does not own reports as not found.
    pub async fn get_metrics(
        &self,
        caller: &Caller,
        target_id: Uuid,
        kind: MetricKind,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>, ServiceError> {
        let target = self.targets.get_target(target_id).await?;
        if !caller.owns(&target) {
            return Err(ServiceError::NotFound);
        }

        Ok(self.store.query_metrics(target.id, kind, from, to)?)
    }
}
