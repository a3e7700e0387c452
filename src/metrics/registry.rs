//! Metric Registry
//!
//! An explicitly constructed set of typed instruments backed by a private
//! `prometheus::Registry`. Collectors write through [`MetricRegistry::set`],
//! [`MetricRegistry::increment`] and [`MetricRegistry::observe`]; the
//! exposition path reads through [`MetricRegistry::snapshot`].
//!
//! Values live in the prometheus atomics, so a reader never sees a torn value.
//! The instrument table itself sits behind one `RwLock` which is only taken for
//! writing when a new metric or a new label combination appears.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use parking_lot::RwLock;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, Opts,
    Registry, TextEncoder,
};
use tracing::debug;

use crate::error::{Error, Result};

// =============================================================================
// Descriptors
// =============================================================================

/// Kind of a metric instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    /// Monotonic cumulative count
    Counter,
    /// Point-in-time value
    Gauge,
    /// Distribution of observed durations (seconds)
    Histogram,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricKind::Counter => write!(f, "counter"),
            MetricKind::Gauge => write!(f, "gauge"),
            MetricKind::Histogram => write!(f, "histogram"),
        }
    }
}

/// Static description of a metric: name, help text, kind and label keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricDesc {
    pub name: &'static str,
    pub help: &'static str,
    pub kind: MetricKind,
    pub label_keys: &'static [&'static str],
}

impl MetricDesc {
    pub const fn counter(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            kind: MetricKind::Counter,
            label_keys: &[],
        }
    }

    pub const fn gauge(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            kind: MetricKind::Gauge,
            label_keys: &[],
        }
    }

    pub const fn labeled_gauge(
        name: &'static str,
        help: &'static str,
        label_keys: &'static [&'static str],
    ) -> Self {
        Self {
            name,
            help,
            kind: MetricKind::Gauge,
            label_keys,
        }
    }

    pub const fn histogram(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            kind: MetricKind::Histogram,
            label_keys: &[],
        }
    }
}

// =============================================================================
// Instruments
// =============================================================================

enum Family {
    Counter(CounterVec),
    Gauge(GaugeVec),
    Histogram(HistogramVec),
}

enum Series {
    Counter(Counter),
    Gauge(Gauge),
    Histogram(Histogram),
}

impl Series {
    fn sample(&self) -> SampleValue {
        match self {
            Series::Counter(c) => SampleValue::Scalar(c.get()),
            Series::Gauge(g) => SampleValue::Scalar(g.get()),
            Series::Histogram(h) => SampleValue::Distribution {
                count: h.get_sample_count(),
                sum: h.get_sample_sum(),
            },
        }
    }
}

struct Instrument {
    kind: MetricKind,
    help: String,
    label_keys: Vec<String>,
    family: Family,
    series: BTreeMap<Vec<String>, Series>,
}

impl Instrument {
    fn check(
        &self,
        name: &str,
        expected: Option<MetricKind>,
        operation: &str,
        label_values: &[&str],
    ) -> Result<()> {
        if let Some(expected) = expected {
            if self.kind != expected {
                return Err(Error::InvalidOperation(format!(
                    "{} is not allowed on {} {}",
                    operation, self.kind, name
                )));
            }
        }
        if label_values.len() != self.label_keys.len() {
            return Err(Error::InvalidOperation(format!(
                "{} expects labels {:?}, got {} value(s)",
                name,
                self.label_keys,
                label_values.len()
            )));
        }
        Ok(())
    }

    fn series_mut(&mut self, label_values: &[&str]) -> Result<&Series> {
        let key: Vec<String> = label_values.iter().map(|v| v.to_string()).collect();
        if !self.series.contains_key(&key) {
            let series = match &self.family {
                Family::Counter(vec) => {
                    Series::Counter(vec.get_metric_with_label_values(label_values)?)
                }
                Family::Gauge(vec) => Series::Gauge(vec.get_metric_with_label_values(label_values)?),
                Family::Histogram(vec) => {
                    Series::Histogram(vec.get_metric_with_label_values(label_values)?)
                }
            };
            self.series.insert(key.clone(), series);
        }
        self.series
            .get(&key)
            .ok_or_else(|| Error::Internal("series vanished after insert".into()))
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// Value of one series at snapshot time
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleValue {
    /// Counter or gauge value
    Scalar(f64),
    /// Histogram sample count and sum
    Distribution { count: u64, sum: f64 },
}

impl SampleValue {
    /// Scalar value, `None` for histograms
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            SampleValue::Scalar(v) => Some(*v),
            SampleValue::Distribution { .. } => None,
        }
    }
}

/// All series of one metric at snapshot time
#[derive(Debug, Clone)]
pub struct MetricSnapshot {
    pub kind: MetricKind,
    pub help: String,
    pub label_keys: Vec<String>,
    pub series: BTreeMap<Vec<String>, SampleValue>,
}

/// Immutable view of the registry, including its text exposition
#[derive(Debug, Clone)]
pub struct Snapshot {
    metrics: BTreeMap<String, MetricSnapshot>,
    exposition: String,
}

impl Snapshot {
    /// Get a metric by name
    pub fn get(&self, name: &str) -> Option<&MetricSnapshot> {
        self.metrics.get(name)
    }

    /// Scalar value of a counter or gauge series
    pub fn value(&self, name: &str, label_values: &[&str]) -> Option<f64> {
        self.sample(name, label_values)?.as_scalar()
    }

    /// Sample count and sum of a histogram series
    pub fn distribution(&self, name: &str, label_values: &[&str]) -> Option<(u64, f64)> {
        match self.sample(name, label_values)? {
            SampleValue::Distribution { count, sum } => Some((count, sum)),
            SampleValue::Scalar(_) => None,
        }
    }

    fn sample(&self, name: &str, label_values: &[&str]) -> Option<SampleValue> {
        let key: Vec<String> = label_values.iter().map(|v| v.to_string()).collect();
        self.metrics.get(name)?.series.get(&key).copied()
    }

    /// Names of all metrics in the snapshot, sorted
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.metrics.keys().map(String::as_str)
    }

    /// Number of metrics in the snapshot
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    /// True when no metric has been declared
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Prometheus text exposition of the snapshot
    pub fn exposition(&self) -> &str {
        &self.exposition
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Thread-safe set of named, typed metric instruments
pub struct MetricRegistry {
    registry: Registry,
    instruments: RwLock<HashMap<String, Instrument>>,
}

impl MetricRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            instruments: RwLock::new(HashMap::new()),
        }
    }

    /// Declare a metric.
    ///
    /// Repeating a declaration with the same kind and label keys is a no-op.
    /// Re-declaring a name with another kind or another label-key set is a
    /// configuration error. Unlabeled metrics get their single series
    /// materialized at zero right away.
    pub fn declare(&self, desc: &MetricDesc) -> Result<()> {
        let mut table = self.instruments.write();

        if let Some(existing) = table.get(desc.name) {
            let same_labels = existing
                .label_keys
                .iter()
                .map(String::as_str)
                .eq(desc.label_keys.iter().copied());
            if existing.kind == desc.kind && same_labels {
                return Ok(());
            }
            return Err(Error::Config(format!(
                "metric {} already declared as {} {:?}, cannot redeclare as {} {:?}",
                desc.name, existing.kind, existing.label_keys, desc.kind, desc.label_keys
            )));
        }

        let declare_err =
            |e: prometheus::Error| Error::Config(format!("cannot declare {}: {}", desc.name, e));

        let family = match desc.kind {
            MetricKind::Counter => {
                let vec = CounterVec::new(Opts::new(desc.name, desc.help), desc.label_keys)
                    .map_err(declare_err)?;
                self.registry
                    .register(Box::new(vec.clone()))
                    .map_err(declare_err)?;
                Family::Counter(vec)
            }
            MetricKind::Gauge => {
                let vec = GaugeVec::new(Opts::new(desc.name, desc.help), desc.label_keys)
                    .map_err(declare_err)?;
                self.registry
                    .register(Box::new(vec.clone()))
                    .map_err(declare_err)?;
                Family::Gauge(vec)
            }
            MetricKind::Histogram => {
                let vec =
                    HistogramVec::new(HistogramOpts::new(desc.name, desc.help), desc.label_keys)
                        .map_err(declare_err)?;
                self.registry
                    .register(Box::new(vec.clone()))
                    .map_err(declare_err)?;
                Family::Histogram(vec)
            }
        };

        let mut instrument = Instrument {
            kind: desc.kind,
            help: desc.help.to_string(),
            label_keys: desc.label_keys.iter().map(|k| k.to_string()).collect(),
            family,
            series: BTreeMap::new(),
        };
        if desc.label_keys.is_empty() {
            instrument.series_mut(&[])?;
        }

        debug!(metric = desc.name, kind = %desc.kind, "declared metric");
        table.insert(desc.name.to_string(), instrument);
        Ok(())
    }

    /// Overwrite a gauge's value
    pub fn set(&self, name: &str, label_values: &[&str], value: f64) -> Result<()> {
        ensure_finite(name, value)?;
        self.with_series(name, label_values, Some(MetricKind::Gauge), "set", |s| {
            if let Series::Gauge(g) = s {
                g.set(value);
            }
        })
    }

    /// Add a non-negative delta to a counter
    pub fn increment(&self, name: &str, label_values: &[&str], delta: f64) -> Result<()> {
        ensure_finite(name, delta)?;
        if delta < 0.0 {
            return Err(Error::InvalidOperation(format!(
                "counter {} cannot be decreased (delta {})",
                name, delta
            )));
        }
        self.with_series(
            name,
            label_values,
            Some(MetricKind::Counter),
            "increment",
            |s| {
                if let Series::Counter(c) = s {
                    c.inc_by(delta);
                }
            },
        )
    }

    /// Record one duration sample (seconds) into a histogram
    pub fn observe(&self, name: &str, label_values: &[&str], seconds: f64) -> Result<()> {
        ensure_finite(name, seconds)?;
        self.with_series(
            name,
            label_values,
            Some(MetricKind::Histogram),
            "observe",
            |s| {
                if let Series::Histogram(h) = s {
                    h.observe(seconds);
                }
            },
        )
    }

    /// Materialize a series at its initial value, leaving existing values alone
    pub fn touch(&self, name: &str, label_values: &[&str]) -> Result<()> {
        self.with_series(name, label_values, None, "touch", |_| ())
    }

    /// Kind of a declared metric
    pub fn kind_of(&self, name: &str) -> Option<MetricKind> {
        self.instruments.read().get(name).map(|i| i.kind)
    }

    /// Names of all declared metrics, sorted
    pub fn declared(&self) -> Vec<String> {
        let mut names: Vec<String> = self.instruments.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Take an immutable snapshot of every series and render the exposition
    pub fn snapshot(&self) -> Result<Snapshot> {
        let table = self.instruments.read();

        let metrics = table
            .iter()
            .map(|(name, instrument)| {
                let series = instrument
                    .series
                    .iter()
                    .map(|(labels, s)| (labels.clone(), s.sample()))
                    .collect();
                (
                    name.clone(),
                    MetricSnapshot {
                        kind: instrument.kind,
                        help: instrument.help.clone(),
                        label_keys: instrument.label_keys.clone(),
                        series,
                    },
                )
            })
            .collect();

        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        drop(table);

        let exposition = String::from_utf8(buffer)
            .map_err(|e| Error::Internal(format!("exposition is not UTF-8: {}", e)))?;

        Ok(Snapshot {
            metrics,
            exposition,
        })
    }

    fn with_series<T>(
        &self,
        name: &str,
        label_values: &[&str],
        expected: Option<MetricKind>,
        operation: &str,
        f: impl FnOnce(&Series) -> T,
    ) -> Result<T> {
        {
            let table = self.instruments.read();
            let instrument = table.get(name).ok_or_else(|| unknown_metric(name))?;
            instrument.check(name, expected, operation, label_values)?;
            let key: Vec<String> = label_values.iter().map(|v| v.to_string()).collect();
            if let Some(series) = instrument.series.get(&key) {
                return Ok(f(series));
            }
        }

        let mut table = self.instruments.write();
        let instrument = table.get_mut(name).ok_or_else(|| unknown_metric(name))?;
        let series = instrument.series_mut(label_values)?;
        Ok(f(series))
    }
}

impl Default for MetricRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MetricRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricRegistry")
            .field("metrics", &self.instruments.read().len())
            .finish()
    }
}

fn unknown_metric(name: &str) -> Error {
    Error::InvalidOperation(format!("metric {} was never declared", name))
}

fn ensure_finite(name: &str, value: f64) -> Result<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(Error::InvalidOperation(format!(
            "non-finite value {} for {}",
            value, name
        )))
    }
}
