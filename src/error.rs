//! Error types for the Techno Events exporter

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the exporter
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Registry misuse: wrong kind, unknown metric, bad label values
    #[error("Invalid metric operation: {0}")]
    InvalidOperation(String),

    /// Error raised by the underlying prometheus instruments
    #[error("Prometheus registry error: {0}")]
    Prometheus(#[from] prometheus::Error),

    // =========================================================================
    // Source Errors
    // =========================================================================
    /// Database driver error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Database connect or query exceeded its deadline
    #[error("Database operation timed out after {0:?}")]
    DatabaseTimeout(Duration),

    /// Weather provider could not be reached (connect error or timeout)
    #[error("Weather API connection error: {0}")]
    WeatherConnection(#[source] reqwest::Error),

    /// Weather provider answered with a non-success status
    #[error("Weather API returned status {status} for {city}")]
    WeatherStatus { city: String, status: u16 },

    /// Weather provider payload could not be decoded
    #[error("Failed to parse weather response: {0}")]
    WeatherResponseParse(String),

    // =========================================================================
    // Plumbing
    // =========================================================================
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for failures of an external source, which collectors recover from
    /// by writing fallback values.
    pub fn is_source_unavailable(&self) -> bool {
        matches!(
            self,
            Error::Database(_)
                | Error::DatabaseTimeout(_)
                | Error::WeatherConnection(_)
                | Error::WeatherStatus { .. }
                | Error::WeatherResponseParse(_)
        )
    }
}
