// ✈️ Airport Entity - Reference data for the exposure scan
//
// The IATA code is the stable identity used by snapshots and trends.
// Airports without an IATA code carry "N/A" and are still scored.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::geo::Coordinate;

/// IATA placeholder for airports that never received a code
pub const NO_IATA: &str = "N/A";

// ============================================================================
// AIRPORT TYPE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AirportType {
    LargeAirport,
    MediumAirport,
    SmallAirport,
    Heliport,
    SeaplaneBase,
    Closed,
    Other(String),
}

impl AirportType {
    pub fn as_str(&self) -> &str {
        match self {
            AirportType::LargeAirport => "large_airport",
            AirportType::MediumAirport => "medium_airport",
            AirportType::SmallAirport => "small_airport",
            AirportType::Heliport => "heliport",
            AirportType::SeaplaneBase => "seaplane_base",
            AirportType::Closed => "closed",
            AirportType::Other(s) => s.as_str(),
        }
    }

    /// Parse an OurAirports `type` column value
    pub fn parse(value: &str) -> AirportType {
        match value.trim() {
            "large_airport" => AirportType::LargeAirport,
            "medium_airport" => AirportType::MediumAirport,
            "small_airport" => AirportType::SmallAirport,
            "heliport" => AirportType::Heliport,
            "seaplane_base" => AirportType::SeaplaneBase,
            "closed" => AirportType::Closed,
            other => AirportType::Other(other.to_string()),
        }
    }
}

// ============================================================================
// AIRPORT ENTITY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Airport {
    /// IATA code (identity), or [`NO_IATA`]
    pub iata_code: String,

    pub name: String,
    pub municipality: String,

    /// ISO alpha-2 of the country the airport is in
    pub country_code: String,

    pub latitude: f64,
    pub longitude: f64,

    pub airport_type: AirportType,
}

impl Airport {
    pub fn new(
        iata_code: &str,
        name: &str,
        country_code: &str,
        latitude: f64,
        longitude: f64,
    ) -> Self {
        let iata = iata_code.trim();
        Airport {
            iata_code: if iata.is_empty() { NO_IATA.to_string() } else { iata.to_uppercase() },
            name: name.to_string(),
            municipality: String::new(),
            country_code: country_code.to_uppercase(),
            latitude,
            longitude,
            airport_type: AirportType::LargeAirport,
        }
    }

    pub fn with_type(mut self, airport_type: AirportType) -> Self {
        self.airport_type = airport_type;
        self
    }

    pub fn with_municipality(mut self, municipality: &str) -> Self {
        self.municipality = municipality.to_string();
        self
    }

    pub fn position(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }
}

// ============================================================================
// AIRPORT REGISTRY
// ============================================================================

/// Immutable set of airports for one run, indexed by country
#[derive(Debug, Clone, Default)]
pub struct AirportRegistry {
    airports: Vec<Airport>,
    by_country: HashMap<String, Vec<usize>>,
}

impl AirportRegistry {
    pub fn new(airports: Vec<Airport>) -> Self {
        let mut by_country: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, airport) in airports.iter().enumerate() {
            by_country
                .entry(airport.country_code.clone())
                .or_default()
                .push(index);
        }
        AirportRegistry { airports, by_country }
    }

    /// Keep only airports of the given classification (e.g. "large_airport")
    pub fn filtered_by_type(&self, airport_type: &str) -> AirportRegistry {
        let wanted = AirportType::parse(airport_type);
        AirportRegistry::new(
            self.airports
                .iter()
                .filter(|a| a.airport_type == wanted)
                .cloned()
                .collect(),
        )
    }

    /// Airports located in the given country (ISO alpha-2)
    pub fn in_country(&self, country_code: &str) -> Vec<&Airport> {
        self.by_country
            .get(&country_code.to_uppercase())
            .map(|indices| indices.iter().map(|&i| &self.airports[i]).collect())
            .unwrap_or_default()
    }

    /// Country codes with at least one airport, sorted
    pub fn countries(&self) -> Vec<String> {
        let mut codes: Vec<String> = self.by_country.keys().cloned().collect();
        codes.sort();
        codes
    }

    pub fn find_by_iata(&self, iata_code: &str) -> Option<&Airport> {
        let code = iata_code.to_uppercase();
        self.airports.iter().find(|a| a.iata_code == code)
    }

    pub fn all(&self) -> &[Airport] {
        &self.airports
    }

    pub fn count(&self) -> usize {
        self.airports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.airports.is_empty()
    }
}
