//! City table
//!
//! Static mapping of city name to coordinates and timezone, polled by the
//! weather collector. The built-in table can be replaced by a YAML file:
//!
//! ```yaml
//! cities:
//!   - name: Berlin
//!     latitude: 52.52
//!     longitude: 13.41
//!     timezone: Europe/Berlin
//! ```

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

/// One polled location
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct City {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub timezone: String,
}

impl City {
    pub fn new(name: &str, latitude: f64, longitude: f64, timezone: &str) -> Self {
        Self {
            name: name.to_string(),
            latitude,
            longitude,
            timezone: timezone.to_string(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("city name must not be empty".into()));
        }
        if !(-90.0..=90.0).contains(&self.latitude) {
            return Err(Error::Config(format!(
                "latitude {} of {} is outside [-90, 90]",
                self.latitude, self.name
            )));
        }
        if !(-180.0..=180.0).contains(&self.longitude) {
            return Err(Error::Config(format!(
                "longitude {} of {} is outside [-180, 180]",
                self.longitude, self.name
            )));
        }
        if self.timezone.trim().is_empty() {
            return Err(Error::Config(format!("timezone of {} is empty", self.name)));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct CityFile {
    cities: Vec<City>,
}

/// Validated, ordered set of cities
#[derive(Debug, Clone, PartialEq)]
pub struct CityTable {
    cities: Vec<City>,
}

impl CityTable {
    /// Validate and wrap a list of cities
    pub fn new(cities: Vec<City>) -> Result<Self> {
        if cities.is_empty() {
            return Err(Error::Config("city table is empty".into()));
        }

        let mut seen = HashSet::new();
        for city in &cities {
            city.validate()?;
            if !seen.insert(city.name.to_lowercase()) {
                return Err(Error::Config(format!("duplicate city {}", city.name)));
            }
        }

        Ok(Self { cities })
    }

    /// The default table: Berlin, London, Paris, Amsterdam
    pub fn builtin() -> Self {
        Self {
            cities: vec![
                City::new("Berlin", 52.52, 13.41, "Europe/Berlin"),
                City::new("London", 51.51, -0.13, "Europe/London"),
                City::new("Paris", 48.85, 2.35, "Europe/Paris"),
                City::new("Amsterdam", 52.37, 4.90, "Europe/Amsterdam"),
            ],
        }
    }

    /// Parse a YAML city table
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let file: CityFile = serde_yaml::from_str(yaml)
            .map_err(|e| Error::Config(format!("malformed city table: {}", e)))?;
        Self::new(file.cities)
    }

    /// Load a YAML city table from disk
    pub fn load(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read city table {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&yaml)
    }

    /// Restrict the table to one city (case-insensitive), or keep all of them
    pub fn select(self, selected: Option<&str>) -> Result<Self> {
        let Some(selected) = selected else {
            return Ok(self);
        };

        let city = self
            .cities
            .into_iter()
            .find(|c| c.name.eq_ignore_ascii_case(selected.trim()))
            .ok_or_else(|| Error::Config(format!("unknown city {}", selected)))?;

        Ok(Self { cities: vec![city] })
    }

    pub fn cities(&self) -> &[City] {
        &self.cities
    }

    pub fn into_cities(self) -> Vec<City> {
        self.cities
    }
}
