//! Database Collector
//!
//! Reads business KPIs from the events database. One connection is opened per
//! cycle and closed once the batch is done. A failing query only affects its
//! own metric; an unreachable database puts the whole batch on bounded
//! fallback values so the set of published series never changes.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::Connection;
use tracing::{debug, info, instrument, warn};

use super::sampling::{Bounds, Precision, Sampler};
use super::{CollectionSummary, Collector};
use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::metrics::catalog::{
    ACTIVE_USERS, AVG_RATING, DATABASE_SIZE_MB, DATABASE_UP, EVENTS_TOTAL, EVENT_ATTENDANCE_RATE,
};
use crate::metrics::{MetricDesc, MetricRegistry};

// =============================================================================
// KPI Definitions
// =============================================================================

/// One scalar aggregate published as a gauge
#[derive(Debug, Clone, Copy)]
pub struct Kpi {
    pub metric: MetricDesc,
    pub sql: &'static str,
    pub precision: Precision,
    pub fallback: Bounds,
}

/// KPIs in query order
pub const KPIS: [Kpi; 5] = [
    Kpi {
        metric: EVENTS_TOTAL,
        sql: "SELECT COUNT(*)::float8 FROM events",
        precision: Precision::Whole,
        fallback: Bounds::new(50.0, 100.0),
    },
    Kpi {
        metric: ACTIVE_USERS,
        sql: "SELECT COUNT(DISTINCT user_id)::float8 FROM eventhistory WHERE has_attended = true",
        precision: Precision::Whole,
        fallback: Bounds::new(10.0, 25.0),
    },
    Kpi {
        metric: AVG_RATING,
        sql: "SELECT AVG(rate)::float8 FROM eventhistory WHERE rate IS NOT NULL",
        precision: Precision::Places(2),
        fallback: Bounds::new(3.5, 4.8),
    },
    Kpi {
        metric: EVENT_ATTENDANCE_RATE,
        sql: "SELECT (COUNT(*) FILTER (WHERE has_attended = true) * 100.0 \
              / NULLIF(COUNT(*), 0))::float8 FROM eventhistory",
        precision: Precision::Places(2),
        fallback: Bounds::new(60.0, 90.0),
    },
    Kpi {
        metric: DATABASE_SIZE_MB,
        sql: "SELECT (pg_database_size(current_database()) / 1024 / 1024)::float8",
        precision: Precision::Places(1),
        fallback: Bounds::new(50.0, 150.0),
    },
];

// =============================================================================
// Store Ports
// =============================================================================

/// Opens one short-lived session per collection cycle
#[async_trait]
pub trait KpiStore: Send + Sync {
    async fn open(&self) -> Result<Box<dyn KpiSession>>;
}

/// A live connection able to answer scalar aggregate queries
#[async_trait]
pub trait KpiSession: Send {
    /// Run a query returning one nullable number
    async fn scalar(&mut self, sql: &str) -> Result<Option<f64>>;

    /// True once the connection can no longer serve further queries
    fn is_poisoned(&self) -> bool {
        false
    }

    /// Release the underlying connection
    fn close(self: Box<Self>) -> BoxFuture<'static, Result<()>>;
}

// =============================================================================
// Postgres Store
// =============================================================================

/// Extra time granted past the server-side `statement_timeout` before the
/// client gives up on a query
const QUERY_BACKSTOP_GRACE: Duration = Duration::from_secs(1);

/// Postgres-backed [`KpiStore`] using one `PgConnection` per cycle
pub struct PostgresStore {
    options: PgConnectOptions,
    connect_timeout: Duration,
    query_timeout: Duration,
}

impl PostgresStore {
    pub fn new(config: &DatabaseConfig) -> Self {
        Self {
            options: config.connect_options(),
            connect_timeout: config.connect_timeout,
            query_timeout: config.query_timeout,
        }
    }
}

impl fmt::Debug for PostgresStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresStore")
            .field("host", &self.options.get_host())
            .field("database", &self.options.get_database())
            .field("connect_timeout", &self.connect_timeout)
            .field("query_timeout", &self.query_timeout)
            .finish()
    }
}

#[async_trait]
impl KpiStore for PostgresStore {
    async fn open(&self) -> Result<Box<dyn KpiSession>> {
        let conn = tokio::time::timeout(
            self.connect_timeout,
            PgConnection::connect_with(&self.options),
        )
        .await
        .map_err(|_| Error::DatabaseTimeout(self.connect_timeout))??;

        Ok(Box::new(PostgresSession {
            conn,
            query_backstop: self.query_timeout + QUERY_BACKSTOP_GRACE,
            close_timeout: self.connect_timeout,
            poisoned: false,
        }))
    }
}

struct PostgresSession {
    conn: PgConnection,
    query_backstop: Duration,
    close_timeout: Duration,
    /// Set when a query was abandoned mid-flight; the connection still owes
    /// its response and would stall every later query
    poisoned: bool,
}

#[async_trait]
impl KpiSession for PostgresSession {
    async fn scalar(&mut self, sql: &str) -> Result<Option<f64>> {
        let query = sqlx::query_scalar::<_, Option<f64>>(sql).fetch_one(&mut self.conn);
        match tokio::time::timeout(self.query_backstop, query).await {
            Ok(value) => Ok(value?),
            Err(_) => {
                self.poisoned = true;
                Err(Error::DatabaseTimeout(self.query_backstop))
            }
        }
    }

    fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        let PostgresSession {
            conn,
            close_timeout,
            poisoned,
            ..
        } = *self;

        Box::pin(async move {
            let closing = async move {
                if poisoned {
                    conn.close_hard().await
                } else {
                    conn.close().await
                }
            };
            tokio::time::timeout(close_timeout, closing)
                .await
                .map_err(|_| Error::DatabaseTimeout(close_timeout))?
                .map_err(Error::from)
        })
    }
}

// =============================================================================
// Collector
// =============================================================================

/// Publishes the business KPIs of the events database
pub struct DatabaseCollector {
    store: Arc<dyn KpiStore>,
    sampler: Arc<dyn Sampler>,
}

impl DatabaseCollector {
    pub fn new(store: Arc<dyn KpiStore>, sampler: Arc<dyn Sampler>) -> Self {
        Self { store, sampler }
    }

    fn fallback(&self, kpi: &Kpi) -> f64 {
        self.sampler.sample(kpi.fallback, kpi.precision)
    }

    async fn release(session: Box<dyn KpiSession>) {
        if let Err(e) = session.close().await {
            debug!(error = %e, "error while closing database connection");
        }
    }

    /// Run every KPI query. A poisoned session is dropped and reopened before
    /// the next query; once a reopen fails the remaining KPIs fall back.
    async fn publish(
        &self,
        session: &mut Option<Box<dyn KpiSession>>,
        registry: &MetricRegistry,
    ) -> Result<CollectionSummary> {
        registry.set(DATABASE_UP.name, &[], 1.0)?;

        let mut summary = CollectionSummary::default();
        let mut reachable = true;

        for kpi in &KPIS {
            if session.is_none() && reachable {
                match self.store.open().await {
                    Ok(reopened) => *session = Some(reopened),
                    Err(e) => {
                        warn!(error = %e, "database reconnect failed, remaining KPIs use fallback values");
                        reachable = false;
                    }
                }
            }

            let (value, live) = match session.as_mut() {
                Some(conn) => match conn.scalar(kpi.sql).await {
                    Ok(value) => match value.unwrap_or(0.0) {
                        v if v.is_finite() => (kpi.precision.apply(v), true),
                        v => {
                            warn!(metric = kpi.metric.name, value = v, "non-finite KPI, using fallback");
                            (self.fallback(kpi), false)
                        }
                    },
                    Err(e) => {
                        warn!(metric = kpi.metric.name, error = %e, "KPI query failed, using fallback");
                        (self.fallback(kpi), false)
                    }
                },
                None => (self.fallback(kpi), false),
            };

            if session.as_ref().is_some_and(|conn| conn.is_poisoned()) {
                debug!(metric = kpi.metric.name, "discarding database connection after abandoned query");
                if let Some(poisoned) = session.take() {
                    Self::release(poisoned).await;
                }
            }

            registry.set(kpi.metric.name, &[], value)?;
            summary.record(live);
        }

        Ok(summary)
    }
}

#[async_trait]
impl Collector for DatabaseCollector {
    fn name(&self) -> &'static str {
        "database"
    }

    fn register(&self, registry: &MetricRegistry) -> Result<()> {
        registry.declare(&DATABASE_UP)?;
        for kpi in &KPIS {
            registry.declare(&kpi.metric)?;
        }
        Ok(())
    }

    #[instrument(skip_all, fields(collector = "database"))]
    async fn collect(&self, registry: &MetricRegistry) -> Result<CollectionSummary> {
        let session = match self.store.open().await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "database unavailable, publishing fallback KPIs");
                registry.set(DATABASE_UP.name, &[], 0.0)?;

                let mut summary = CollectionSummary::default();
                for kpi in &KPIS {
                    registry.set(kpi.metric.name, &[], self.fallback(kpi))?;
                    summary.record(false);
                }
                return Ok(summary);
            }
        };

        let mut session = Some(session);
        let outcome = self.publish(&mut session, registry).await;

        if let Some(session) = session.take() {
            Self::release(session).await;
        }

        if let Ok(summary) = &outcome {
            info!(live = summary.live, fallback = summary.fallback, "database KPIs refreshed");
        }
        outcome
    }
}
