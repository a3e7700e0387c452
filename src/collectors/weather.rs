//! Weather Collector
//!
//! Polls the weather provider for every configured city. Cities are fetched
//! concurrently and each one has its own failure boundary: a city whose lookup
//! fails gets the documented fallback conditions and its
//! `techno_weather_api_status` drops to 0, while every other city is published
//! from its own result.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::{Client, Url};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use super::{CollectionSummary, Collector};
use crate::config::{City, WeatherConfig};
use crate::error::{Error, Result};
use crate::metrics::catalog::{
    WEATHER_API_STATUS, WEATHER_HUMIDITY, WEATHER_RAIN, WEATHER_TEMPERATURE, WEATHER_WINDSPEED,
};
use crate::metrics::MetricRegistry;

/// Fields requested from the provider
const CURRENT_FIELDS: &str = "temperature_2m,relative_humidity_2m,wind_speed_10m,rain";

// =============================================================================
// Conditions
// =============================================================================

/// Current weather at one location
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurrentConditions {
    /// Degrees Celsius
    pub temperature: f64,
    /// Relative humidity, percent
    pub humidity: f64,
    /// km/h at 10m
    pub wind_speed: f64,
    /// mm
    pub rain: f64,
}

/// Published for a city whose lookup failed
pub const FALLBACK_CONDITIONS: CurrentConditions = CurrentConditions {
    temperature: 20.0,
    humidity: 65.0,
    wind_speed: 15.0,
    rain: 0.0,
};

// =============================================================================
// Provider Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    current: CurrentBlock,
}

#[derive(Debug, Deserialize)]
struct CurrentBlock {
    temperature_2m: f64,
    relative_humidity_2m: f64,
    wind_speed_10m: f64,
    #[serde(default)]
    rain: Option<f64>,
}

fn parse_forecast(body: &[u8]) -> Result<CurrentConditions> {
    let response: ForecastResponse =
        serde_json::from_slice(body).map_err(|e| Error::WeatherResponseParse(e.to_string()))?;
    let current = response.current;

    Ok(CurrentConditions {
        temperature: current.temperature_2m,
        humidity: current.relative_humidity_2m,
        wind_speed: current.wind_speed_10m,
        rain: current.rain.unwrap_or(0.0),
    })
}

// =============================================================================
// Provider
// =============================================================================

/// Source of current conditions for a city
#[async_trait]
pub trait WeatherProvider: Send + Sync {
    async fn current(&self, city: &City) -> Result<CurrentConditions>;
}

/// Open-Meteo forecast API client
pub struct OpenMeteoClient {
    base_url: Url,
    client: Client,
}

impl OpenMeteoClient {
    /// Create a client; `timeout` bounds every request end to end.
    ///
    /// `base_url` may carry its own query string (an API key for instance);
    /// the forecast parameters are appended to it.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| Error::Config(format!("invalid weather URL {}: {}", base_url, e)))?;
        let path = base_url.path().trim_end_matches('/').to_string();
        base_url.set_path(&path);

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { base_url, client })
    }

    fn forecast_url(&self, city: &City) -> Url {
        let mut url = self.base_url.clone();
        url.query_pairs_mut()
            .append_pair("latitude", &city.latitude.to_string())
            .append_pair("longitude", &city.longitude.to_string())
            .append_pair("current", CURRENT_FIELDS)
            .append_pair("timezone", &city.timezone);
        url
    }
}

impl std::fmt::Debug for OpenMeteoClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenMeteoClient")
            .field("base_url", &self.base_url.as_str())
            .finish()
    }
}

#[async_trait]
impl WeatherProvider for OpenMeteoClient {
    #[instrument(skip(self, city), fields(city = %city.name))]
    async fn current(&self, city: &City) -> Result<CurrentConditions> {
        let url = self.forecast_url(city);
        debug!("Querying weather provider: {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(Error::WeatherConnection)?;

        if !response.status().is_success() {
            return Err(Error::WeatherStatus {
                city: city.name.clone(),
                status: response.status().as_u16(),
            });
        }

        let body = response.bytes().await.map_err(Error::WeatherConnection)?;
        parse_forecast(&body)
    }
}

// =============================================================================
// Collector
// =============================================================================

/// Publishes per-city weather gauges and the per-city API health gauge
pub struct WeatherCollector {
    provider: Arc<dyn WeatherProvider>,
    cities: Vec<City>,
    max_attempts: u32,
    retry_backoff: Duration,
}

impl WeatherCollector {
    /// One attempt per city and cycle
    pub fn new(provider: Arc<dyn WeatherProvider>, cities: Vec<City>) -> Self {
        Self {
            provider,
            cities,
            max_attempts: 1,
            retry_backoff: Duration::ZERO,
        }
    }

    /// Retry a failed lookup up to `max_attempts` in total, doubling the
    /// backoff after each failure
    pub fn with_retry(mut self, max_attempts: u32, retry_backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_backoff = retry_backoff;
        self
    }

    /// Build a collector backed by [`OpenMeteoClient`]
    pub fn from_config(config: &WeatherConfig) -> Result<Self> {
        let client = OpenMeteoClient::new(&config.base_url, config.request_timeout)?;
        Ok(Self::new(Arc::new(client), config.cities.clone())
            .with_retry(config.max_attempts, config.retry_backoff))
    }

    async fn fetch(&self, city: &City) -> Result<CurrentConditions> {
        let mut backoff = self.retry_backoff;
        let mut attempt = 1;

        loop {
            match self.provider.current(city).await {
                Ok(conditions) => return Ok(conditions),
                Err(e) if attempt < self.max_attempts => {
                    debug!(
                        city = %city.name,
                        attempt,
                        error = %e,
                        "weather lookup failed, retrying in {:?}",
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn publish(
        registry: &MetricRegistry,
        city: &City,
        conditions: &CurrentConditions,
        up: bool,
    ) -> Result<()> {
        let labels = [city.name.as_str()];
        registry.set(WEATHER_TEMPERATURE.name, &labels, conditions.temperature)?;
        registry.set(WEATHER_HUMIDITY.name, &labels, conditions.humidity)?;
        registry.set(WEATHER_WINDSPEED.name, &labels, conditions.wind_speed)?;
        registry.set(WEATHER_RAIN.name, &labels, conditions.rain)?;
        registry.set(
            WEATHER_API_STATUS.name,
            &labels,
            if up { 1.0 } else { 0.0 },
        )?;
        Ok(())
    }
}

#[async_trait]
impl Collector for WeatherCollector {
    fn name(&self) -> &'static str {
        "weather"
    }

    fn register(&self, registry: &MetricRegistry) -> Result<()> {
        let metrics = [
            WEATHER_TEMPERATURE,
            WEATHER_HUMIDITY,
            WEATHER_WINDSPEED,
            WEATHER_RAIN,
            WEATHER_API_STATUS,
        ];

        for metric in &metrics {
            registry.declare(metric)?;
            for city in &self.cities {
                registry.touch(metric.name, &[city.name.as_str()])?;
            }
        }
        Ok(())
    }

    #[instrument(skip_all, fields(collector = "weather"))]
    async fn collect(&self, registry: &MetricRegistry) -> Result<CollectionSummary> {
        let readings = join_all(
            self.cities
                .iter()
                .map(|city| async move { (city, self.fetch(city).await) }),
        )
        .await;

        let mut summary = CollectionSummary::default();
        for (city, reading) in readings {
            match reading {
                Ok(conditions) => {
                    debug!(
                        city = %city.name,
                        temperature = conditions.temperature,
                        humidity = conditions.humidity,
                        "weather updated"
                    );
                    Self::publish(registry, city, &conditions, true)?;
                    summary.record(true);
                }
                Err(e) => {
                    warn!(city = %city.name, error = %e, "weather lookup failed, using fallback");
                    Self::publish(registry, city, &FALLBACK_CONDITIONS, false)?;
                    summary.record(false);
                }
            }
        }

        info!(live = summary.live, fallback = summary.fallback, "weather refreshed");
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Barrier;

    fn cities() -> Vec<City> {
        crate::config::CityTable::builtin().into_cities()
    }

    fn conditions(temperature: f64) -> CurrentConditions {
        CurrentConditions {
            temperature,
            humidity: 40.0,
            wind_speed: 7.5,
            rain: 0.2,
        }
    }

    /// Answers from a fixed table; cities missing from it fail
    struct StubProvider {
        answers: HashMap<String, CurrentConditions>,
        calls: AtomicU32,
    }

    impl StubProvider {
        fn new(answers: &[(&str, CurrentConditions)]) -> Self {
            Self {
                answers: answers
                    .iter()
                    .map(|(name, c)| (name.to_string(), *c))
                    .collect(),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl WeatherProvider for StubProvider {
        async fn current(&self, city: &City) -> Result<CurrentConditions> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answers
                .get(&city.name)
                .copied()
                .ok_or_else(|| Error::WeatherStatus {
                    city: city.name.clone(),
                    status: 503,
                })
        }
    }

    /// Fails the first `failures` calls, then succeeds
    struct FlakyProvider {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl WeatherProvider for FlakyProvider {
        async fn current(&self, _city: &City) -> Result<CurrentConditions> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(Error::WeatherResponseParse("truncated body".into()))
            } else {
                Ok(conditions(11.0))
            }
        }
    }

    /// Every lookup waits until all cities are in flight at the same time
    struct RendezvousProvider {
        barrier: Barrier,
    }

    #[async_trait]
    impl WeatherProvider for RendezvousProvider {
        async fn current(&self, _city: &City) -> Result<CurrentConditions> {
            self.barrier.wait().await;
            Ok(conditions(5.0))
        }
    }

    fn registered(collector: &WeatherCollector) -> MetricRegistry {
        let registry = MetricRegistry::new();
        collector.register(&registry).unwrap();
        registry
    }

    // =========================================================================
    // Response Parsing
    // =========================================================================

    #[test]
    fn test_parse_forecast() {
        let body = r#"{
            "latitude": 52.52,
            "longitude": 13.419998,
            "current_units": {"temperature_2m": "°C"},
            "current": {
                "time": "2026-10-18T12:00",
                "interval": 900,
                "temperature_2m": 14.2,
                "relative_humidity_2m": 71,
                "wind_speed_10m": 9.7,
                "rain": 0.3
            }
        }"#;

        let parsed = parse_forecast(body.as_bytes()).unwrap();
        assert_eq!(
            parsed,
            CurrentConditions {
                temperature: 14.2,
                humidity: 71.0,
                wind_speed: 9.7,
                rain: 0.3
            }
        );
    }

    #[test]
    fn test_parse_forecast_without_rain() {
        let missing = br#"{"current": {"temperature_2m": 1.0, "relative_humidity_2m": 2.0, "wind_speed_10m": 3.0}}"#;
        let null = br#"{"current": {"temperature_2m": 1.0, "relative_humidity_2m": 2.0, "wind_speed_10m": 3.0, "rain": null}}"#;

        assert_eq!(parse_forecast(missing).unwrap().rain, 0.0);
        assert_eq!(parse_forecast(null).unwrap().rain, 0.0);
    }

    #[test]
    fn test_parse_forecast_rejects_malformed() {
        assert_matches!(
            parse_forecast(br#"{"current": {"temperature_2m": 1.0}}"#),
            Err(Error::WeatherResponseParse(_))
        );
        assert_matches!(
            parse_forecast(br#"{"hourly": {}}"#),
            Err(Error::WeatherResponseParse(_))
        );
        assert_matches!(
            parse_forecast(b"<html>502 Bad Gateway</html>"),
            Err(Error::WeatherResponseParse(_))
        );
    }

    // =========================================================================
    // Client
    // =========================================================================

    #[test]
    fn test_forecast_url() {
        let client =
            OpenMeteoClient::new("https://api.open-meteo.com/v1/forecast/", Duration::from_secs(10))
                .unwrap();
        let url = client.forecast_url(&City::new("Berlin", 52.52, 13.41, "Europe/Berlin"));

        assert_eq!(
            url.as_str(),
            "https://api.open-meteo.com/v1/forecast?latitude=52.52&longitude=13.41\
             &current=temperature_2m%2Crelative_humidity_2m%2Cwind_speed_10m%2Crain\
             &timezone=Europe%2FBerlin"
        );
    }

    #[test]
    fn test_forecast_url_keeps_base_query() {
        let client = OpenMeteoClient::new(
            "https://weather.example.com/v1/forecast?apikey=s3cret",
            Duration::from_secs(10),
        )
        .unwrap();
        let url = client.forecast_url(&City::new("Paris", 48.85, 2.35, "Europe/Paris"));

        assert_eq!(url.query().unwrap().matches('?').count(), 0);
        let pairs: HashMap<String, String> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["apikey"], "s3cret");
        assert_eq!(pairs["latitude"], "48.85");
        assert_eq!(pairs["longitude"], "2.35");
        assert_eq!(pairs["timezone"], "Europe/Paris");
        assert_eq!(url.path(), "/v1/forecast");
    }

    #[test]
    fn test_client_rejects_invalid_url() {
        assert_matches!(
            OpenMeteoClient::new("not a url", Duration::from_secs(1)),
            Err(Error::Config(_))
        );
    }

    #[tokio::test]
    async fn test_client_connection_refused() {
        let client =
            OpenMeteoClient::new("http://127.0.0.1:1/v1/forecast", Duration::from_secs(1)).unwrap();
        let city = City::new("Berlin", 52.52, 13.41, "Europe/Berlin");

        let result = client.current(&city).await;
        assert_matches!(result, Err(Error::WeatherConnection(_)));
    }

    #[tokio::test]
    async fn test_client_timeout() {
        // Non-routable address (RFC 5737)
        let client =
            OpenMeteoClient::new("http://192.0.2.1:9090/v1/forecast", Duration::from_millis(100))
                .unwrap();
        let city = City::new("London", 51.51, -0.13, "Europe/London");

        let result = client.current(&city).await;
        assert!(result.unwrap_err().is_source_unavailable());
    }

    // =========================================================================
    // Collector
    // =========================================================================

    #[test]
    fn test_register_primes_every_city() {
        let collector = WeatherCollector::new(Arc::new(StubProvider::new(&[])), cities());
        let snapshot = registered(&collector).snapshot().unwrap();

        for city in cities() {
            for metric in [
                "techno_weather_temperature",
                "techno_weather_humidity",
                "techno_weather_windspeed",
                "techno_weather_rain",
                "techno_weather_api_status",
            ] {
                assert_eq!(snapshot.value(metric, &[&city.name]), Some(0.0));
            }
        }
    }

    #[tokio::test]
    async fn test_failed_city_is_isolated() {
        let provider = StubProvider::new(&[
            ("Berlin", conditions(12.0)),
            ("Paris", conditions(17.0)),
            ("Amsterdam", conditions(10.0)),
        ]);
        let collector = WeatherCollector::new(Arc::new(provider), cities());
        let registry = registered(&collector);

        let summary = collector.collect(&registry).await.unwrap();
        assert_eq!(summary, CollectionSummary { live: 3, fallback: 1 });

        let snapshot = registry.snapshot().unwrap();
        assert_eq!(snapshot.value("techno_weather_api_status", &["London"]), Some(0.0));
        assert_eq!(snapshot.value("techno_weather_temperature", &["London"]), Some(20.0));
        assert_eq!(snapshot.value("techno_weather_humidity", &["London"]), Some(65.0));
        assert_eq!(snapshot.value("techno_weather_windspeed", &["London"]), Some(15.0));
        assert_eq!(snapshot.value("techno_weather_rain", &["London"]), Some(0.0));

        assert_eq!(snapshot.value("techno_weather_api_status", &["Paris"]), Some(1.0));
        assert_eq!(snapshot.value("techno_weather_temperature", &["Paris"]), Some(17.0));
        assert_eq!(snapshot.value("techno_weather_rain", &["Paris"]), Some(0.2));
        assert_eq!(snapshot.value("techno_weather_temperature", &["Berlin"]), Some(12.0));
    }

    #[tokio::test]
    async fn test_recovery_after_outage() {
        let collector = WeatherCollector::new(
            Arc::new(FlakyProvider {
                failures: 1,
                calls: AtomicU32::new(0),
            }),
            vec![City::new("Berlin", 52.52, 13.41, "Europe/Berlin")],
        );
        let registry = registered(&collector);

        collector.collect(&registry).await.unwrap();
        assert_eq!(
            registry.snapshot().unwrap().value("techno_weather_api_status", &["Berlin"]),
            Some(0.0)
        );

        collector.collect(&registry).await.unwrap();
        let snapshot = registry.snapshot().unwrap();
        assert_eq!(snapshot.value("techno_weather_api_status", &["Berlin"]), Some(1.0));
        assert_eq!(snapshot.value("techno_weather_temperature", &["Berlin"]), Some(11.0));
    }

    #[tokio::test]
    async fn test_retry_before_fallback() {
        let provider = Arc::new(FlakyProvider {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let collector = WeatherCollector::new(
            provider.clone(),
            vec![City::new("Berlin", 52.52, 13.41, "Europe/Berlin")],
        )
        .with_retry(3, Duration::from_millis(1));
        let registry = registered(&collector);

        let summary = collector.collect(&registry).await.unwrap();

        assert_eq!(summary, CollectionSummary { live: 1, fallback: 0 });
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let provider = Arc::new(StubProvider::new(&[]));
        let collector = WeatherCollector::new(
            provider.clone(),
            vec![City::new("Berlin", 52.52, 13.41, "Europe/Berlin")],
        )
        .with_retry(2, Duration::from_millis(1));
        let registry = registered(&collector);

        let summary = collector.collect(&registry).await.unwrap();

        assert_eq!(summary, CollectionSummary { live: 0, fallback: 1 });
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cities_are_fetched_concurrently() {
        let provider = RendezvousProvider {
            barrier: Barrier::new(cities().len()),
        };
        let collector = WeatherCollector::new(Arc::new(provider), cities());
        let registry = registered(&collector);

        // Sequential fetching would deadlock on the barrier
        let summary = tokio::time::timeout(Duration::from_secs(5), collector.collect(&registry))
            .await
            .expect("cities were not fetched concurrently")
            .unwrap();
        assert_eq!(summary.live, 4);
    }

    proptest! {
        #[test]
        fn failures_never_leak_across_cities(failing in proptest::collection::vec(any::<bool>(), 4)) {
            let all = cities();
            let answers: Vec<(&str, CurrentConditions)> = all
                .iter()
                .zip(&failing)
                .enumerate()
                .filter(|(_, (_, fails))| !**fails)
                .map(|(i, (city, _))| (city.name.as_str(), conditions(i as f64)))
                .collect();
            let collector = WeatherCollector::new(Arc::new(StubProvider::new(&answers)), all.clone());
            let registry = registered(&collector);

            let summary = tokio_test::block_on(collector.collect(&registry)).unwrap();
            let snapshot = registry.snapshot().unwrap();

            prop_assert_eq!(summary.fallback, failing.iter().filter(|f| **f).count());
            for (i, (city, fails)) in all.iter().zip(&failing).enumerate() {
                let labels = [city.name.as_str()];
                let status = snapshot.value("techno_weather_api_status", &labels);
                let temperature = snapshot.value("techno_weather_temperature", &labels);
                if *fails {
                    prop_assert_eq!(status, Some(0.0));
                    prop_assert_eq!(temperature, Some(FALLBACK_CONDITIONS.temperature));
                } else {
                    prop_assert_eq!(status, Some(1.0));
                    prop_assert_eq!(temperature, Some(i as f64));
                }
            }
        }
    }
}
