//! Synthetic Activity Collector
//!
//! Internally generated load metrics: one request per cycle with a synthetic
//! duration, service uptime and two engagement gauges.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::debug;

use super::sampling::{Bounds, Precision, Sampler};
use super::{CollectionSummary, Collector};
use crate::error::Result;
use crate::metrics::catalog::{
    API_REQUESTS_TOTAL, REQUEST_DURATION_SECONDS, TOP_GENRE_POPULARITY, UPTIME_SECONDS,
    USER_ENGAGEMENT_SCORE,
};
use crate::metrics::MetricRegistry;

/// Range of synthetic request durations, in seconds
pub const REQUEST_DURATION: Bounds = Bounds::new(0.1, 0.5);

/// Range of the top genre popularity gauge
pub const GENRE_POPULARITY: Bounds = Bounds::new(20.0, 40.0);

/// Range of the user engagement gauge
pub const ENGAGEMENT_SCORE: Bounds = Bounds::new(70.0, 95.0);

pub struct SyntheticCollector {
    sampler: Arc<dyn Sampler>,
    started_at: Instant,
}

impl SyntheticCollector {
    /// `started_at` is the service start used for the uptime gauge
    pub fn new(sampler: Arc<dyn Sampler>, started_at: Instant) -> Self {
        Self {
            sampler,
            started_at,
        }
    }
}

#[async_trait]
impl Collector for SyntheticCollector {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn register(&self, registry: &MetricRegistry) -> Result<()> {
        registry.declare(&API_REQUESTS_TOTAL)?;
        registry.declare(&REQUEST_DURATION_SECONDS)?;
        registry.declare(&UPTIME_SECONDS)?;
        registry.declare(&TOP_GENRE_POPULARITY)?;
        registry.declare(&USER_ENGAGEMENT_SCORE)?;
        Ok(())
    }

    async fn collect(&self, registry: &MetricRegistry) -> Result<CollectionSummary> {
        let duration = self.sampler.uniform(REQUEST_DURATION);
        registry.increment(API_REQUESTS_TOTAL.name, &[], 1.0)?;
        registry.observe(REQUEST_DURATION_SECONDS.name, &[], duration)?;

        let uptime = self.started_at.elapsed().as_secs_f64();
        registry.set(UPTIME_SECONDS.name, &[], uptime)?;

        registry.set(
            TOP_GENRE_POPULARITY.name,
            &[],
            self.sampler.sample(GENRE_POPULARITY, Precision::Whole),
        )?;
        registry.set(
            USER_ENGAGEMENT_SCORE.name,
            &[],
            self.sampler.sample(ENGAGEMENT_SCORE, Precision::Places(1)),
        )?;

        debug!(uptime, duration, "synthetic activity recorded");
        Ok(CollectionSummary {
            live: 5,
            fallback: 0,
        })
    }
}
