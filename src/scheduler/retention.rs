//! Retention sweeper for deleting old metric samples.

use crate::clock::{Clock, SystemClock};
use crate::db::{DbError, Store};

use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Default age beyond which samples are deleted.
pub const DEFAULT_RETENTION_DAYS: i64 = 90;

/// Periodically prunes samples older than a fixed horizon.
pub struct RetentionSweeper {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    horizon: ChronoDuration,
    period: Duration,
}

impl RetentionSweeper {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            horizon: ChronoDuration::days(DEFAULT_RETENTION_DAYS),
            period: Duration::from_secs(5 * 60),
        }
    }

    pub fn with_horizon_days(mut self, days: i64) -> Self {
        self.horizon = ChronoDuration::days(days);
        self
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Delete everything older than the horizon. Returns the number removed.
    pub fn sweep_once(&self) -> Result<usize, DbError> {
        let cutoff = self.clock.now() - self.horizon;
        let removed = self.store.remove_metrics_older_than(cutoff)?;

        if removed > 0 {
            tracing::debug!("RetentionSweeper: removed {} samples older than {}", removed, cutoff);
        }

        Ok(removed)
    }

    /// Sweep on every period until shutdown. Errors are logged and the timer
    /// keeps going.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!(
            "RetentionSweeper: starting, horizon {} days, every {:?}",
            self.horizon.num_days(),
            self.period
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.sweep_once() {
                        tracing::error!("RetentionSweeper: Failed to remove old metrics: {}", e);
                    }
                }
            }
        }

        tracing::info!("RetentionSweeper: stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::{MetricKind, MetricSample};
    use chrono::{TimeZone, Utc};
    use tempfile::NamedTempFile;
    use uuid::Uuid;

    #[test]
    fn test_sweep_removes_only_expired() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let target_id = Uuid::new_v4();

        let old = MetricSample::bytes(target_id, MetricKind::DbIoUsage, 1.0, now - ChronoDuration::days(100));
        let fresh = MetricSample::bytes(target_id, MetricKind::DbIoUsage, 2.0, now - ChronoDuration::days(10));
        store.insert_metrics(&[old, fresh.clone()]).unwrap();

        let sweeper = RetentionSweeper::new(store.clone()).with_clock(Arc::new(ManualClock::new(now)));
        assert_eq!(sweeper.sweep_once().unwrap(), 1);

        let left = store
            .query_metrics(target_id, MetricKind::DbIoUsage, now - ChronoDuration::days(365), now)
            .unwrap();
        assert_eq!(left, vec![fresh]);

        // Nothing left to prune.
        assert_eq!(sweeper.sweep_once().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let sweeper = Arc::new(RetentionSweeper::new(store).with_period(Duration::from_millis(10)));

        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(sweeper.run(rx));

        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper should stop promptly")
            .unwrap();
    }
}
