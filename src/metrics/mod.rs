//! Metrics module
//!
//! Provides the typed metric registry and the catalog of exported metrics.

pub mod catalog;
mod registry;

pub use registry::{MetricDesc, MetricKind, MetricRegistry, MetricSnapshot, SampleValue, Snapshot};
