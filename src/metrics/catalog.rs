//! Metric catalog
//!
//! Every metric the exporter publishes, grouped by the collector that owns it.
//! Collectors write disjoint sets of names.

use super::registry::MetricDesc;

/// Label key used by all per-city weather gauges
pub const CITY_LABEL: &str = "city";

// =============================================================================
// Database
// =============================================================================

pub const EVENTS_TOTAL: MetricDesc =
    MetricDesc::gauge("techno_events_total", "Total number of events in database");

pub const ACTIVE_USERS: MetricDesc =
    MetricDesc::gauge("techno_active_users", "Number of active users");

pub const AVG_RATING: MetricDesc = MetricDesc::gauge("techno_avg_rating", "Average event rating");

pub const EVENT_ATTENDANCE_RATE: MetricDesc =
    MetricDesc::gauge("techno_event_attendance_rate", "Event attendance rate");

pub const DATABASE_SIZE_MB: MetricDesc =
    MetricDesc::gauge("techno_database_size_mb", "Database size in MB");

pub const DATABASE_UP: MetricDesc = MetricDesc::gauge(
    "techno_database_up",
    "Database reachability during the last cycle (1=up, 0=down)",
);

// =============================================================================
// Weather
// =============================================================================

pub const WEATHER_TEMPERATURE: MetricDesc = MetricDesc::labeled_gauge(
    "techno_weather_temperature",
    "Current temperature in Celsius",
    &[CITY_LABEL],
);

pub const WEATHER_HUMIDITY: MetricDesc = MetricDesc::labeled_gauge(
    "techno_weather_humidity",
    "Current humidity percentage",
    &[CITY_LABEL],
);

pub const WEATHER_WINDSPEED: MetricDesc = MetricDesc::labeled_gauge(
    "techno_weather_windspeed",
    "Current wind speed in km/h",
    &[CITY_LABEL],
);

pub const WEATHER_RAIN: MetricDesc =
    MetricDesc::labeled_gauge("techno_weather_rain", "Current rain volume", &[CITY_LABEL]);

pub const WEATHER_API_STATUS: MetricDesc = MetricDesc::labeled_gauge(
    "techno_weather_api_status",
    "Weather API status (1=up, 0=down)",
    &[CITY_LABEL],
);

// =============================================================================
// Synthetic activity
// =============================================================================

pub const API_REQUESTS_TOTAL: MetricDesc =
    MetricDesc::counter("techno_api_requests_total", "Total API requests");

pub const REQUEST_DURATION_SECONDS: MetricDesc =
    MetricDesc::histogram("techno_request_duration_seconds", "Request duration");

pub const UPTIME_SECONDS: MetricDesc =
    MetricDesc::gauge("techno_uptime_seconds", "Service uptime in seconds");

pub const TOP_GENRE_POPULARITY: MetricDesc =
    MetricDesc::gauge("techno_top_genre_popularity", "Popularity of top genre");

pub const USER_ENGAGEMENT_SCORE: MetricDesc =
    MetricDesc::gauge("techno_user_engagement_score", "User engagement score");

// =============================================================================
// Scheduler
// =============================================================================

pub const COLLECTION_CYCLES_TOTAL: MetricDesc = MetricDesc::counter(
    "techno_collection_cycles_total",
    "Completed collection cycles",
);

pub const LAST_COLLECTION_TIMESTAMP: MetricDesc = MetricDesc::gauge(
    "techno_last_collection_timestamp_seconds",
    "Unix time of the last completed collection cycle",
);
