//! Collection Scheduler
//!
//! ```text
//! Idle ──▶ Running(N) ──▶ Sleeping ──▶ Running(N+1) ──▶ ...
//!              │              │
//!              └── shutdown ──┴──▶ Stopped
//! ```
//!
//! Collectors run in a fixed order once per cycle. Source failures never
//! reach the scheduler; a collector error means the registry was misused and
//! stops the loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::collectors::{CollectionSummary, Collector};
use crate::error::Result;
use crate::metrics::catalog::{COLLECTION_CYCLES_TOTAL, LAST_COLLECTION_TIMESTAMP};
use crate::metrics::MetricRegistry;

/// Outcome of one pass through all collectors
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle: u64,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub collectors: Vec<(&'static str, CollectionSummary)>,
}

impl CycleReport {
    /// True when any collector published fallback values
    pub fn is_degraded(&self) -> bool {
        self.collectors.iter().any(|(_, s)| s.is_degraded())
    }
}

/// Drives the collectors on a fixed interval
pub struct Scheduler {
    registry: Arc<MetricRegistry>,
    collectors: Vec<Arc<dyn Collector>>,
    interval: Duration,
    cycles: AtomicU64,
}

impl Scheduler {
    pub fn new(registry: Arc<MetricRegistry>, interval: Duration) -> Self {
        Self {
            registry,
            collectors: Vec::new(),
            interval,
            cycles: AtomicU64::new(0),
        }
    }

    /// Append a collector; collectors run in insertion order
    pub fn with_collector(mut self, collector: Arc<dyn Collector>) -> Self {
        self.collectors.push(collector);
        self
    }

    /// Number of completed cycles
    pub fn completed_cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Declare the scheduler's own metrics and every collector's metrics
    pub fn register(&self) -> Result<()> {
        self.registry.declare(&COLLECTION_CYCLES_TOTAL)?;
        self.registry.declare(&LAST_COLLECTION_TIMESTAMP)?;
        for collector in &self.collectors {
            collector.register(&self.registry)?;
        }
        Ok(())
    }

    /// Run every collector once, in order
    #[instrument(skip(self), fields(cycle = self.cycles.load(Ordering::Relaxed) + 1))]
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let cycle = self.cycles.load(Ordering::Relaxed) + 1;
        let started_at = Utc::now();
        let start = Instant::now();

        let mut collectors = Vec::with_capacity(self.collectors.len());
        for collector in &self.collectors {
            let summary = collector.collect(&self.registry).await.map_err(|e| {
                error!(collector = collector.name(), error = %e, "collector failed");
                e
            })?;
            collectors.push((collector.name(), summary));
        }

        self.registry
            .increment(COLLECTION_CYCLES_TOTAL.name, &[], 1.0)?;
        self.registry.set(
            LAST_COLLECTION_TIMESTAMP.name,
            &[],
            Utc::now().timestamp() as f64,
        )?;
        self.cycles.store(cycle, Ordering::Relaxed);

        let report = CycleReport {
            cycle,
            started_at,
            elapsed: start.elapsed(),
            collectors,
        };

        if report.is_degraded() {
            warn!(
                started_at = %report.started_at,
                elapsed = ?report.elapsed,
                "collection cycle completed with fallback values"
            );
        } else {
            info!(
                started_at = %report.started_at,
                elapsed = ?report.elapsed,
                "collection cycle completed"
            );
        }
        Ok(report)
    }

    /// Collect, sleep, repeat until `shutdown` is cancelled.
    ///
    /// The first cycle starts immediately. Cancellation abandons an in-flight
    /// cycle or interrupts the sleep.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(
            interval = ?self.interval,
            collectors = self.collectors.len(),
            "Starting collection scheduler"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested during collection cycle");
                    break;
                }
                report = self.run_cycle() => {
                    report?;
                }
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!(cycles = self.completed_cycles(), "Collection scheduler stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::metrics::MetricDesc;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    const TICKS: MetricDesc = MetricDesc::counter("test_ticks_total", "Ticks");

    /// Appends its name to a shared log on every collection
    struct RecordingCollector {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        delay: Duration,
        fail: bool,
    }

    impl RecordingCollector {
        fn new(name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> Self {
            Self {
                name,
                log: log.clone(),
                delay: Duration::ZERO,
                fail: false,
            }
        }
    }

    #[async_trait]
    impl Collector for RecordingCollector {
        fn name(&self) -> &'static str {
            self.name
        }

        fn register(&self, registry: &MetricRegistry) -> Result<()> {
            registry.declare(&TICKS)
        }

        async fn collect(&self, registry: &MetricRegistry) -> Result<CollectionSummary> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.log.lock().push(self.name);
            if self.fail {
                return Err(Error::InvalidOperation("wrong kind".into()));
            }
            registry.increment(TICKS.name, &[], 1.0)?;
            Ok(CollectionSummary {
                live: 1,
                fallback: 0,
            })
        }
    }

    fn scheduler(collectors: Vec<RecordingCollector>, interval: Duration) -> Arc<Scheduler> {
        let mut scheduler = Scheduler::new(Arc::new(MetricRegistry::new()), interval);
        for collector in collectors {
            scheduler = scheduler.with_collector(Arc::new(collector));
        }
        scheduler.register().unwrap();
        Arc::new(scheduler)
    }

    #[tokio::test]
    async fn test_cycle_runs_collectors_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let scheduler = scheduler(
            vec![
                RecordingCollector::new("database", &log),
                RecordingCollector::new("weather", &log),
                RecordingCollector::new("synthetic", &log),
            ],
            Duration::from_secs(20),
        );

        let before = Utc::now();
        let report = scheduler.run_cycle().await.unwrap();

        assert_eq!(*log.lock(), vec!["database", "weather", "synthetic"]);
        assert!(report.started_at >= before && report.started_at <= Utc::now());
        assert_eq!(report.cycle, 1);
        assert_eq!(report.collectors.len(), 3);
        assert!(!report.is_degraded());
        assert_eq!(scheduler.completed_cycles(), 1);

        let snapshot = scheduler.registry.snapshot().unwrap();
        assert_eq!(snapshot.value("techno_collection_cycles_total", &[]), Some(1.0));
        assert!(snapshot.value("techno_last_collection_timestamp_seconds", &[]).unwrap() > 0.0);
    }

    #[tokio::test]
    async fn test_collector_error_is_fatal() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut broken = RecordingCollector::new("broken", &log);
        broken.fail = true;
        let scheduler = scheduler(
            vec![broken, RecordingCollector::new("after", &log)],
            Duration::from_millis(10),
        );

        let result = scheduler.run(CancellationToken::new()).await;

        assert_matches!(result, Err(Error::InvalidOperation(_)));
        assert_eq!(*log.lock(), vec!["broken"]);
        assert_eq!(scheduler.completed_cycles(), 0);
    }

    #[tokio::test]
    async fn test_run_repeats_until_shutdown() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let scheduler = scheduler(
            vec![RecordingCollector::new("only", &log)],
            Duration::from_millis(10),
        );
        let token = CancellationToken::new();

        let handle = {
            let scheduler = scheduler.clone();
            let token = token.clone();
            tokio::spawn(async move { scheduler.run(token).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
        handle.await.unwrap().unwrap();

        let cycles = scheduler.completed_cycles();
        assert!(cycles >= 2, "only {} cycles completed", cycles);
        let ticks = scheduler
            .registry
            .snapshot()
            .unwrap()
            .value("test_ticks_total", &[])
            .unwrap();
        assert!(ticks >= cycles as f64);
    }

    #[tokio::test]
    async fn test_shutdown_abandons_slow_cycle() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut slow = RecordingCollector::new("slow", &log);
        slow.delay = Duration::from_secs(60);
        let scheduler = scheduler(vec![slow], Duration::from_secs(20));
        let token = CancellationToken::new();

        let handle = {
            let scheduler = scheduler.clone();
            let token = token.clone();
            tokio::spawn(async move { scheduler.run(token).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("scheduler did not stop");
        assert!(result.unwrap().is_ok());
        assert_eq!(scheduler.completed_cycles(), 0);
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_sleep() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let scheduler = scheduler(
            vec![RecordingCollector::new("only", &log)],
            Duration::from_secs(3600),
        );
        let token = CancellationToken::new();

        let handle = {
            let scheduler = scheduler.clone();
            let token = token.clone();
            tokio::spawn(async move { scheduler.run(token).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("scheduler did not stop")
            .unwrap()
            .unwrap();
        assert_eq!(scheduler.completed_cycles(), 1);
    }
}
