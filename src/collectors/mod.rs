//! Collectors
//!
//! Each collector owns a disjoint set of metric names, declares them at
//! registration and refreshes them once per collection cycle.
//!
//! # Failure model
//!
//! ```text
//! source error  ──▶ fallback value + warn!  (absorbed, cycle continues)
//! registry error ─▶ Err(..)                 (programming error, fatal)
//! ```

use async_trait::async_trait;

use crate::error::Result;
use crate::metrics::MetricRegistry;

mod database;
pub mod sampling;
mod synthetic;
mod weather;

pub use database::{DatabaseCollector, Kpi, KpiSession, KpiStore, PostgresStore, KPIS};
pub use sampling::{Bounds, FixedSampler, Precision, RandomSampler, Sampler};
pub use synthetic::SyntheticCollector;
pub use weather::{
    CurrentConditions, OpenMeteoClient, WeatherCollector, WeatherProvider, FALLBACK_CONDITIONS,
};

/// Outcome of one collection pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectionSummary {
    /// Series written from the authoritative source
    pub live: usize,
    /// Series written from fallback values
    pub fallback: usize,
}

impl CollectionSummary {
    pub fn record(&mut self, live: bool) {
        if live {
            self.live += 1;
        } else {
            self.fallback += 1;
        }
    }

    /// True when at least one series fell back this cycle
    pub fn is_degraded(&self) -> bool {
        self.fallback > 0
    }
}

/// A metric source refreshed by the scheduler
#[async_trait]
pub trait Collector: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Declare the owned metrics and materialize their series
    fn register(&self, registry: &MetricRegistry) -> Result<()>;

    /// Refresh the owned metrics. Source failures are absorbed; an error here
    /// means the registry was misused.
    async fn collect(&self, registry: &MetricRegistry) -> Result<CollectionSummary>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_record() {
        let mut summary = CollectionSummary::default();
        summary.record(true);
        summary.record(true);
        assert!(!summary.is_degraded());

        summary.record(false);
        assert_eq!(
            summary,
            CollectionSummary {
                live: 2,
                fallback: 1
            }
        );
        assert!(summary.is_degraded());
    }
}
