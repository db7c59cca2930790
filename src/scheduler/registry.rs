//! Last-run bookkeeping for the orchestrator.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::schedule::Trigger;

/// When each target was last collected successfully.
///
/// Lives as long as the orchestrator that owns it; nothing is persisted, so
/// after a restart every target is due immediately.
#[derive(Debug, Default)]
pub struct LastRunRegistry {
    runs: RwLock<HashMap<Uuid, DateTime<Utc>>>,
}

impl LastRunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn last_run(&self, target_id: Uuid) -> Option<DateTime<Utc>> {
        self.runs.read().await.get(&target_id).copied()
    }

    /// Whether `target_id` is due under `trigger` at `now`.
    pub async fn is_due<T: Trigger + ?Sized>(&self, target_id: Uuid, trigger: &T, now: DateTime<Utc>) -> bool {
        let runs = self.runs.read().await;
        trigger.should_trigger(now, runs.get(&target_id).copied())
    }

    pub async fn record(&self, target_id: Uuid, at: DateTime<Utc>) {
        self.runs.write().await.insert(target_id, at);
    }

    pub async fn forget(&self, target_id: Uuid) {
        self.runs.write().await.remove(&target_id);
    }

    pub async fn len(&self) -> usize {
        self.runs.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::Cooldown;
    use chrono::Duration;

    #[tokio::test]
    async fn test_registry_due_and_record() {
        let registry = LastRunRegistry::new();
        let id = Uuid::new_v4();
        let now = Utc::now();
        let cooldown = Cooldown::from_secs(15);

        assert!(registry.is_due(id, &cooldown, now).await);

        registry.record(id, now).await;
        assert_eq!(registry.last_run(id).await, Some(now));
        assert!(!registry.is_due(id, &cooldown, now + Duration::seconds(14)).await);
        assert!(registry.is_due(id, &cooldown, now + Duration::seconds(15)).await);

        registry.forget(id).await;
        assert_eq!(registry.len().await, 0);
        assert!(registry.is_due(id, &cooldown, now).await);
    }
}
