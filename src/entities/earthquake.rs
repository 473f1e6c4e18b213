// 🌋 Earthquake Entity - One seismic event as delivered by the event fetcher
//
// Earthquakes are immutable once fetched. The engine never edits them, it only
// reads position, magnitude and the optional ground-motion grid reference.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::geo::Coordinate;

// ============================================================================
// PAGER ALERT LEVEL
// ============================================================================

/// PAGER alert level, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Green,
    Yellow,
    Orange,
    Red,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Green => "green",
            AlertLevel::Yellow => "yellow",
            AlertLevel::Orange => "orange",
            AlertLevel::Red => "red",
        }
    }

    /// Parse the feed's lowercase alert string; unknown values are ignored
    pub fn parse(value: &str) -> Option<AlertLevel> {
        match value.trim().to_lowercase().as_str() {
            "green" => Some(AlertLevel::Green),
            "yellow" => Some(AlertLevel::Yellow),
            "orange" => Some(AlertLevel::Orange),
            "red" => Some(AlertLevel::Red),
            _ => None,
        }
    }
}

// ============================================================================
// EARTHQUAKE ENTITY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Earthquake {
    /// Event identifier from the upstream catalogue (e.g. "us7000abcd")
    pub id: String,

    pub magnitude: f64,
    pub latitude: f64,
    pub longitude: f64,

    /// Hypocenter depth below the surface
    pub depth_km: f64,

    /// When the rupture happened
    pub time: DateTime<Utc>,

    /// Free-text location ("45 km SW of ...")
    #[serde(default)]
    pub place: String,

    /// ISO alpha-2 of the country the epicenter was attributed to
    #[serde(default)]
    pub country_code: Option<String>,

    /// Reference to a ground-motion grid product, when one was published
    #[serde(default)]
    pub grid_ref: Option<String>,

    #[serde(default)]
    pub alert: Option<AlertLevel>,

    #[serde(default)]
    pub tsunami: bool,

    /// "Did You Feel It?" report count
    #[serde(default)]
    pub felt_reports: u32,
}

impl Earthquake {
    /// Create an earthquake with only the fields every event has
    pub fn new(
        id: &str,
        magnitude: f64,
        latitude: f64,
        longitude: f64,
        depth_km: f64,
        time: DateTime<Utc>,
    ) -> Self {
        Earthquake {
            id: id.to_string(),
            magnitude,
            latitude,
            longitude,
            depth_km,
            time,
            place: String::new(),
            country_code: None,
            grid_ref: None,
            alert: None,
            tsunami: false,
            felt_reports: 0,
        }
    }

    /// Builder: attribute the event to a country
    pub fn in_country(mut self, iso_alpha2: &str) -> Self {
        self.country_code = Some(iso_alpha2.to_uppercase());
        self
    }

    /// Builder: attach a ground-motion grid reference
    pub fn with_grid(mut self, grid_ref: &str) -> Self {
        self.grid_ref = Some(grid_ref.to_string());
        self
    }

    /// Builder: attach PAGER context
    pub fn with_pager(mut self, alert: Option<AlertLevel>, felt_reports: u32, tsunami: bool) -> Self {
        self.alert = alert;
        self.felt_reports = felt_reports;
        self.tsunami = tsunami;
        self
    }

    pub fn epicenter(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }

    pub fn has_grid(&self) -> bool {
        self.grid_ref.as_deref().map_or(false, |r| !r.is_empty())
    }
}
