//! Techno Events Exporter
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                 Techno Events Exporter                   │
//! ├──────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐    ┌──────────────┐    ┌─────────────┐  │
//! │  │  Scheduler  │───▶│   Registry   │◀───│   /metrics  │  │
//! │  │ (collectors)│    │              │    │   (hyper)   │  │
//! │  └─────────────┘    └──────────────┘    └─────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use techno_exporter::collectors::{
    DatabaseCollector, PostgresStore, RandomSampler, SyntheticCollector, WeatherCollector,
};
use techno_exporter::config::{Cli, ExporterConfig};
use techno_exporter::error::{Error, Result};
use techno_exporter::metrics::MetricRegistry;
use techno_exporter::scheduler::Scheduler;
use techno_exporter::server::ExpositionServer;

#[tokio::main]
async fn main() -> Result<()> {
    let started_at = Instant::now();
    let cli = Cli::parse();

    init_logging(&cli)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting Techno Events exporter"
    );

    let config = ExporterConfig::from_cli(&cli).map_err(|e| {
        error!(error = %e, "Invalid configuration");
        e
    })?;

    info!(
        listen_addr = %config.listen_addr,
        interval = ?config.interval,
        database = ?config.database,
        cities = config.weather.cities.len(),
        "Configuration loaded"
    );

    // Registry shared by the collectors and the exposition server
    let registry = Arc::new(MetricRegistry::new());
    let sampler = Arc::new(RandomSampler);

    let scheduler = Scheduler::new(registry.clone(), config.interval)
        .with_collector(Arc::new(DatabaseCollector::new(
            Arc::new(PostgresStore::new(&config.database)),
            sampler.clone(),
        )))
        .with_collector(Arc::new(WeatherCollector::from_config(&config.weather)?))
        .with_collector(Arc::new(SyntheticCollector::new(sampler, started_at)));
    scheduler.register()?;
    let scheduler = Arc::new(scheduler);

    let server = ExpositionServer::bind(config.listen_addr, registry).await?;

    let shutdown = CancellationToken::new();

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.cancel();
        });
    }

    let server_task = tokio::spawn(server.serve(shutdown.clone()));
    let scheduler_task = {
        let scheduler = scheduler.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { scheduler.run(shutdown).await })
    };

    let scheduler_result = scheduler_task
        .await
        .map_err(|e| Error::Internal(format!("Scheduler task failed: {}", e)))?;
    if let Err(e) = &scheduler_result {
        error!(error = %e, "Collection stopped with a fatal error");
    }

    // Stop the server whether the scheduler ended on a signal or an error
    shutdown.cancel();
    server_task
        .await
        .map_err(|e| Error::Internal(format!("Server task failed: {}", e)))??;

    scheduler_result?;
    info!("Exporter shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(cli: &Cli) -> Result<()> {
    let level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        other => {
            return Err(Error::Config(format!("unknown log level: {}", other)));
        }
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "sqlx=warn", "reqwest=warn"] {
        let directive = directive
            .parse::<Directive>()
            .map_err(|e| Error::Config(format!("invalid log directive {}: {}", directive, e)))?;
        filter = filter.add_directive(directive);
    }

    let result = if cli.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .try_init()
    };

    result.map_err(|e| Error::Internal(format!("Failed to initialize logging: {}", e)))
}

// =============================================================================
// Signals
// =============================================================================

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Signal received, starting graceful shutdown");
}
