//! Scheduler module for polling monitored targets and pruning old samples.

mod registry;
mod retention;

pub use registry::*;
pub use retention::*;

use crate::clock::{Clock, SystemClock};
use crate::collector::SampleSource;
use crate::db::{DbError, MonitoringSettings, Store};
use crate::schedule::Cooldown;
use crate::target::{ConnectivityError, MonitoringTarget, TargetDirectory};

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Failures while collecting one target during a sweep.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("store error: {0}")]
    Db(#[from] DbError),
    #[error(transparent)]
    Connectivity(#[from] ConnectivityError),
    #[error("collection timed out after {0:?}")]
    Timeout(Duration),
}

/// Per-sweep tallies.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Targets with DB resource monitoring enabled at sweep start.
    pub considered: usize,
    pub collected: usize,
    pub not_due: usize,
    /// Resolved targets of another engine family.
    pub skipped: usize,
    pub failed: usize,
    pub samples: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepOutcome {
    Completed(SweepReport),
    /// Another sweep was already running.
    Skipped,
}

enum TargetOutcome {
    Collected(usize),
    NotDue,
    Skipped,
    Failed,
}

/// Clears the sweep flag when the sweep ends, however it ends.
struct SweepGuard<'a>(&'a AtomicBool);

impl<'a> SweepGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SweepGuard(flag))
    }
}

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Polls every PostgreSQL target with DB resource monitoring enabled and
/// stores whatever its collectors produce.
pub struct Orchestrator {
    store: Arc<Store>,
    targets: Arc<dyn TargetDirectory>,
    sampler: Arc<dyn SampleSource>,
    clock: Arc<dyn Clock>,
    registry: LastRunRegistry,
    sweeping: AtomicBool,
    tick: Duration,
    collection_timeout: Duration,
}

impl Orchestrator {
    pub fn new(store: Arc<Store>, targets: Arc<dyn TargetDirectory>, sampler: Arc<dyn SampleSource>) -> Self {
        Self {
            store,
            targets,
            sampler,
            clock: Arc::new(SystemClock),
            registry: LastRunRegistry::new(),
            sweeping: AtomicBool::new(false),
            tick: Duration::from_secs(1),
            collection_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_collection_timeout(mut self, timeout: Duration) -> Self {
        self.collection_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &LastRunRegistry {
        &self.registry
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweeping.load(Ordering::Acquire)
    }

    /// Run a single sweep over all enabled targets.
    ///
    /// Returns [`SweepOutcome::Skipped`] without doing anything if another
    /// sweep holds the flag. Only the settings read can fail the sweep as a
    /// whole; per-target failures are logged and counted.
    pub async fn run_once(&self) -> Result<SweepOutcome, MonitorError> {
        let Some(_guard) = SweepGuard::acquire(&self.sweeping) else {
            tracing::warn!("Scheduler: previous sweep still in progress, skipping");
            return Ok(SweepOutcome::Skipped);
        };

        let enabled = self.store.get_settings_with_db_monitoring()?;
        let mut report = SweepReport {
            considered: enabled.len(),
            ..Default::default()
        };

        for settings in &enabled {
            match self.process_target(settings).await {
                TargetOutcome::Collected(n) => {
                    report.collected += 1;
                    report.samples += n;
                }
                TargetOutcome::NotDue => report.not_due += 1,
                TargetOutcome::Skipped => report.skipped += 1,
                TargetOutcome::Failed => report.failed += 1,
            }
        }

        Ok(SweepOutcome::Completed(report))
    }

    async fn process_target(&self, settings: &MonitoringSettings) -> TargetOutcome {
        let target = match self.targets.get_target(settings.target_id).await {
            Ok(t) => t,
            Err(e) => {
                tracing::error!("Scheduler: failed to resolve target {}: {}", settings.target_id, e);
                return TargetOutcome::Failed;
            }
        };

        if !target.is_postgres() {
            return TargetOutcome::Skipped;
        }

        let now = self.clock.now();
        let cooldown = Cooldown::from_secs(settings.monitoring_interval_seconds.max(0) as u64);
        if !self.registry.is_due(target.id, &cooldown, now).await {
            return TargetOutcome::NotDue;
        }

        match self.collect_and_save(&target, settings, now).await {
            Ok(n) => {
                self.registry.record(target.id, now).await;
                TargetOutcome::Collected(n)
            }
            Err(e) => {
                tracing::error!("Scheduler: failed to collect metrics for {}: {}", target.name, e);
                TargetOutcome::Failed
            }
        }
    }

    async fn collect_and_save(
        &self,
        target: &MonitoringTarget,
        settings: &MonitoringSettings,
        now: DateTime<Utc>,
    ) -> Result<usize, MonitorError> {
        let samples = tokio::time::timeout(self.collection_timeout, self.sampler.sample(target, settings, now))
            .await
            .map_err(|_| MonitorError::Timeout(self.collection_timeout))??;

        self.store.insert_metrics(&samples)?;

        tracing::debug!("Scheduler: stored {} samples for {}", samples.len(), target.name);

        Ok(samples.len())
    }

    /// Sweep on every tick until shutdown.
    ///
    /// Each sweep runs on its own task so a slow target never delays the
    /// tick. A tick that lands while the previous sweep is still running is
    /// dropped. On shutdown the loop stops at the next tick boundary and
    /// waits for the in-flight sweep to finish.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut in_flight: Option<JoinHandle<()>> = None;

        tracing::info!("Scheduler: starting, tick {:?}", self.tick);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = interval.tick() => {
                    if in_flight.as_ref().is_some_and(|h| !h.is_finished()) {
                        tracing::warn!("Scheduler: previous sweep still in progress, skipping tick");
                        continue;
                    }

                    let this = self.clone();
                    in_flight = Some(tokio::spawn(async move {
                        if let Err(e) = this.run_once().await {
                            tracing::error!("Scheduler: sweep failed: {}", e);
                        }
                    }));
                }
            }
        }

        if let Some(handle) = in_flight {
            if let Err(e) = handle.await {
                tracing::error!("Scheduler: sweep task failed: {}", e);
            }
        }

        tracing::info!("Scheduler: stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::{MetricKind, MetricSample};
    use crate::target::EngineKind;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;
    use tokio::sync::Notify;
    use uuid::Uuid;

    /// Counts calls per target and returns one sample each time.
    #[derive(Default)]
    struct CountingSampler {
        calls: Mutex<HashMap<Uuid, usize>>,
        fail_first: AtomicUsize,
    }

    impl CountingSampler {
        fn failing_first(n: usize) -> Self {
            Self {
                fail_first: AtomicUsize::new(n),
                ..Default::default()
            }
        }

        fn calls(&self, id: Uuid) -> usize {
            self.calls.lock().unwrap().get(&id).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl SampleSource for CountingSampler {
        async fn sample(
            &self,
            target: &MonitoringTarget,
            _settings: &MonitoringSettings,
            at: DateTime<Utc>,
        ) -> Result<Vec<MetricSample>, ConnectivityError> {
            *self.calls.lock().unwrap().entry(target.id).or_default() += 1;

            let remaining = self.fail_first.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_first.store(remaining - 1, Ordering::SeqCst);
                return Err(ConnectivityError::Unsupported("boom".to_string()));
            }

            Ok(vec![MetricSample::bytes(target.id, MetricKind::DbRamUsage, 8192.0, at)])
        }
    }

    /// Parks inside `sample` until released.
    #[derive(Default)]
    struct BlockingSampler {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl SampleSource for BlockingSampler {
        async fn sample(
            &self,
            _target: &MonitoringTarget,
            _settings: &MonitoringSettings,
            _at: DateTime<Utc>,
        ) -> Result<Vec<MetricSample>, ConnectivityError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(Vec::new())
        }
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
    }

    fn add_target(store: &Store, engine: EngineKind, interval_secs: i64) -> Uuid {
        let target = MonitoringTarget {
            name: format!("target-{}", interval_secs),
            engine,
            database: Some("app".to_string()),
            ..Default::default()
        };
        store.add_target(&target).unwrap();

        let mut settings = MonitoringSettings::defaults_for(target.id);
        settings.monitoring_interval_seconds = interval_secs;
        store.save_settings(&settings).unwrap();

        target.id
    }

    fn orchestrator(store: &Arc<Store>, sampler: Arc<dyn SampleSource>, clock: Arc<ManualClock>) -> Orchestrator {
        Orchestrator::new(store.clone(), store.clone(), sampler).with_clock(clock)
    }

    #[tokio::test]
    async fn test_intervals_over_simulated_minute() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let fast = add_target(&store, EngineKind::Postgres, 15);
        let slow = add_target(&store, EngineKind::Postgres, 60);

        let clock = Arc::new(ManualClock::new(start()));
        let sampler = Arc::new(CountingSampler::default());
        let orch = orchestrator(&store, sampler.clone(), clock.clone());

        for second in 0..=61 {
            clock.set(start() + ChronoDuration::seconds(second));
            let outcome = orch.run_once().await.unwrap();
            assert!(matches!(outcome, SweepOutcome::Completed(_)));
        }

        // 0, 15, 30, 45, 60 and 0, 60.
        assert_eq!(sampler.calls(fast), 5);
        assert_eq!(sampler.calls(slow), 2);
        assert_eq!(store.count_metrics().unwrap(), 7);
        assert_eq!(
            orch.registry().last_run(fast).await,
            Some(start() + ChronoDuration::seconds(60))
        );
    }

    #[tokio::test]
    async fn test_overlapping_run_once_is_skipped() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        add_target(&store, EngineKind::Postgres, 15);

        let sampler = Arc::new(BlockingSampler::default());
        let orch = Arc::new(orchestrator(&store, sampler.clone(), Arc::new(ManualClock::new(start()))));

        let first = tokio::spawn({
            let orch = orch.clone();
            async move { orch.run_once().await }
        });

        sampler.entered.notified().await;
        assert!(orch.is_sweeping());

        let second = orch.run_once().await.unwrap();
        assert_eq!(second, SweepOutcome::Skipped);

        sampler.release.notify_one();
        let first = first.await.unwrap().unwrap();
        assert!(matches!(first, SweepOutcome::Completed(ref r) if r.collected == 1));
        assert!(!orch.is_sweeping());
    }

    #[tokio::test]
    async fn test_failed_collection_is_retried_next_tick() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let id = add_target(&store, EngineKind::Postgres, 60);

        let clock = Arc::new(ManualClock::new(start()));
        let sampler = Arc::new(CountingSampler::failing_first(1));
        let orch = orchestrator(&store, sampler.clone(), clock.clone());

        let SweepOutcome::Completed(report) = orch.run_once().await.unwrap() else {
            panic!("sweep was skipped");
        };
        assert_eq!(report.failed, 1);
        assert_eq!(orch.registry().last_run(id).await, None);
        assert_eq!(store.count_metrics().unwrap(), 0);

        clock.advance(ChronoDuration::seconds(1));
        let SweepOutcome::Completed(report) = orch.run_once().await.unwrap() else {
            panic!("sweep was skipped");
        };
        assert_eq!(report.collected, 1);
        assert_eq!(sampler.calls(id), 2);
        assert_eq!(store.count_metrics().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_other_engines_and_missing_targets() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let mysql = add_target(&store, EngineKind::Mysql, 15);

        // Settings whose target no longer resolves.
        store
            .save_settings(&MonitoringSettings::defaults_for(Uuid::new_v4()))
            .unwrap();

        let sampler = Arc::new(CountingSampler::default());
        let orch = orchestrator(&store, sampler.clone(), Arc::new(ManualClock::new(start())));

        let outcome = orch.run_once().await.unwrap();
        assert_eq!(
            outcome,
            SweepOutcome::Completed(SweepReport {
                considered: 2,
                skipped: 1,
                failed: 1,
                ..Default::default()
            })
        );
        assert_eq!(sampler.calls(mysql), 0);
    }

    #[tokio::test]
    async fn test_disabled_targets_are_not_polled() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let id = add_target(&store, EngineKind::Postgres, 15);

        let mut settings = store.get_settings(id).unwrap().unwrap();
        settings.is_db_resources_monitoring_enabled = false;
        store.save_settings(&settings).unwrap();

        let sampler = Arc::new(CountingSampler::default());
        let orch = orchestrator(&store, sampler.clone(), Arc::new(ManualClock::new(start())));

        orch.run_once().await.unwrap();
        assert_eq!(sampler.calls(id), 0);
    }

    #[tokio::test]
    async fn test_run_collects_and_stops_on_shutdown() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let id = add_target(&store, EngineKind::Postgres, 3600);

        let sampler = Arc::new(CountingSampler::default());
        let orch = Arc::new(
            Orchestrator::new(store.clone(), store.clone(), sampler.clone()).with_tick(Duration::from_millis(10)),
        );

        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(orch.clone().run(rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("orchestrator should stop promptly")
            .unwrap();

        // First tick collects; the hour-long cooldown holds off the rest.
        assert_eq!(sampler.calls(id), 1);
        assert!(!orch.is_sweeping());
    }
}
