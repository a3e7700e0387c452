//! Techno Events Exporter
//!
//! Collects business KPIs from the events database, current weather for a set
//! of cities and synthetic load figures, and exposes them for Prometheus.
//!
//! # Architecture
//!
//! ```text
//!                  ┌────────────────────┐
//!                  │     Scheduler      │  every 20s
//!                  └─────────┬──────────┘
//!          ┌─────────────────┼─────────────────┐
//!          ▼                 ▼                 ▼
//!   ┌────────────┐    ┌────────────┐    ┌────────────┐
//!   │  Database  │    │  Weather   │    │ Synthetic  │
//!   └─────┬──────┘    └─────┬──────┘    └─────┬──────┘
//!         └─────────────────┼─────────────────┘
//!                           ▼
//!                  ┌────────────────────┐       GET /metrics
//!                  │   MetricRegistry   │◀──── Exposition server
//!                  └────────────────────┘
//! ```
//!
//! Source outages never interrupt collection: collectors publish bounded
//! fallback values and the exposition keeps serving.
//!
//! # Modules
//!
//! - [`collectors`] - Database, weather and synthetic collectors
//! - [`config`] - CLI/environment configuration and the city table
//! - [`error`] - Error types
//! - [`metrics`] - Metric registry and metric catalog
//! - [`scheduler`] - Collection loop
//! - [`server`] - HTTP exposition endpoint

pub mod collectors;
pub mod config;
pub mod error;
pub mod metrics;
pub mod scheduler;
pub mod server;

// Re-export commonly used types
pub use collectors::{Collector, DatabaseCollector, SyntheticCollector, WeatherCollector};
pub use config::{Cli, ExporterConfig};
pub use error::{Error, Result};
pub use metrics::{MetricRegistry, Snapshot};
pub use scheduler::{CycleReport, Scheduler};
pub use server::ExpositionServer;
