//! Configuration
//!
//! Command-line flags with environment fallbacks, validated once at startup
//! into an [`ExporterConfig`]. Any problem here is fatal: the exporter never
//! starts serving with a half-valid configuration.

mod cities;

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use sqlx::postgres::PgConnectOptions;

use crate::error::{Error, Result};

pub use cities::{City, CityTable};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Techno Events exporter - business KPIs and weather metrics for Prometheus
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Exposition server bind address
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8000")]
    pub listen_addr: String,

    /// Seconds to sleep between collection cycles
    #[arg(long, env = "COLLECTION_INTERVAL_SECONDS", default_value = "20")]
    pub interval_seconds: u64,

    /// Database host
    #[arg(long, env = "DB_HOST")]
    pub db_host: Option<String>,

    /// Database port
    #[arg(long, env = "DB_PORT", default_value = "5432")]
    pub db_port: u16,

    /// Database name
    #[arg(long, env = "DB_NAME", default_value = "techno_events_db")]
    pub db_name: String,

    /// Database user
    #[arg(long, env = "DB_USER")]
    pub db_user: Option<String>,

    /// Database password
    #[arg(long, env = "DB_PASSWORD", hide_env_values = true)]
    pub db_password: Option<String>,

    /// Database connect timeout in seconds
    #[arg(long, env = "DB_CONNECT_TIMEOUT_SECONDS", default_value = "5")]
    pub db_connect_timeout_seconds: u64,

    /// Per-query timeout in seconds
    #[arg(long, env = "DB_QUERY_TIMEOUT_SECONDS", default_value = "5")]
    pub db_query_timeout_seconds: u64,

    /// Weather provider forecast endpoint
    #[arg(
        long,
        env = "WEATHER_URL",
        default_value = "https://api.open-meteo.com/v1/forecast"
    )]
    pub weather_url: String,

    /// Per-request weather timeout in seconds
    #[arg(long, env = "WEATHER_TIMEOUT_SECONDS", default_value = "10")]
    pub weather_timeout_seconds: u64,

    /// Attempts per city and cycle before falling back (1 = no retry)
    #[arg(long, env = "WEATHER_MAX_ATTEMPTS", default_value = "1")]
    pub weather_max_attempts: u32,

    /// Initial backoff between weather attempts in milliseconds
    #[arg(long, env = "WEATHER_RETRY_BACKOFF_MS", default_value = "500")]
    pub weather_retry_backoff_ms: u64,

    /// YAML file replacing the built-in city table
    #[arg(long, env = "CITIES_FILE")]
    pub cities_file: Option<PathBuf>,

    /// Poll only this city
    #[arg(long, env = "CITY")]
    pub city: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

// =============================================================================
// Validated Configuration
// =============================================================================

/// Database connection settings
#[derive(Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: Option<String>,
    pub connect_timeout: Duration,
    pub query_timeout: Duration,
}

impl DatabaseConfig {
    /// Connection options for a single Postgres connection.
    ///
    /// The server cancels any statement running longer than the query
    /// timeout, which leaves the connection usable for the next query.
    pub fn connect_options(&self) -> PgConnectOptions {
        let options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.name)
            .username(&self.user)
            .application_name("techno-exporter")
            .options([("statement_timeout", self.query_timeout.as_millis())]);

        match &self.password {
            Some(password) => options.password(password),
            None => options,
        }
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("name", &self.name)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("connect_timeout", &self.connect_timeout)
            .field("query_timeout", &self.query_timeout)
            .finish()
    }
}

/// Weather provider settings
#[derive(Debug, Clone)]
pub struct WeatherConfig {
    pub base_url: String,
    pub request_timeout: Duration,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub cities: Vec<City>,
}

/// Complete, validated exporter configuration
#[derive(Debug, Clone)]
pub struct ExporterConfig {
    pub listen_addr: SocketAddr,
    pub interval: Duration,
    pub database: DatabaseConfig,
    pub weather: WeatherConfig,
}

impl ExporterConfig {
    /// Validate command-line arguments
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let listen_addr: SocketAddr = cli.listen_addr.parse().map_err(|e| {
            Error::Config(format!("invalid listen address {}: {}", cli.listen_addr, e))
        })?;

        let interval = positive_secs("collection interval", cli.interval_seconds)?;

        let database = DatabaseConfig {
            host: required("DB_HOST", cli.db_host.as_deref())?,
            port: cli.db_port,
            name: required("DB_NAME", Some(cli.db_name.as_str()))?,
            user: required("DB_USER", cli.db_user.as_deref())?,
            password: cli.db_password.clone(),
            connect_timeout: positive_secs("database connect timeout", cli.db_connect_timeout_seconds)?,
            query_timeout: positive_secs("database query timeout", cli.db_query_timeout_seconds)?,
        };

        let parsed = reqwest::Url::parse(&cli.weather_url)
            .map_err(|e| Error::Config(format!("invalid weather URL {}: {}", cli.weather_url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "weather URL must be http(s), got {}",
                cli.weather_url
            )));
        }

        if cli.weather_max_attempts == 0 {
            return Err(Error::Config("weather max attempts must be at least 1".into()));
        }

        let table = match &cli.cities_file {
            Some(path) => CityTable::load(path)?,
            None => CityTable::builtin(),
        };
        let cities = table.select(cli.city.as_deref())?.into_cities();

        let weather = WeatherConfig {
            base_url: cli.weather_url.clone(),
            request_timeout: positive_secs("weather timeout", cli.weather_timeout_seconds)?,
            max_attempts: cli.weather_max_attempts,
            retry_backoff: Duration::from_millis(cli.weather_retry_backoff_ms),
            cities,
        };

        Ok(Self {
            listen_addr,
            interval,
            database,
            weather,
        })
    }
}

fn required(name: &str, value: Option<&str>) -> Result<String> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(Error::Config(format!("{} is required", name))),
    }
}

fn positive_secs(what: &str, secs: u64) -> Result<Duration> {
    if secs == 0 {
        return Err(Error::Config(format!("{} must be positive", what)));
    }
    Ok(Duration::from_secs(secs))
}
