// 🗺️ Country Entity - Display metadata for scored countries
//
// Countries never influence the score; they only label results.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Country {
    /// ISO 3166-1 alpha-2 (join key with airports and earthquakes)
    pub iso_alpha2: String,

    /// ISO 3166-1 alpha-3 (what exporters show)
    #[serde(default)]
    pub iso_alpha3: String,

    pub name: String,

    #[serde(default)]
    pub capital: String,

    #[serde(default)]
    pub region: String,

    #[serde(default)]
    pub subregion: String,

    #[serde(default)]
    pub population: u64,

    #[serde(default)]
    pub area_km2: f64,
}

impl Country {
    pub fn new(iso_alpha2: &str, iso_alpha3: &str, name: &str, region: &str) -> Self {
        Country {
            iso_alpha2: iso_alpha2.to_uppercase(),
            iso_alpha3: iso_alpha3.to_uppercase(),
            name: name.to_string(),
            capital: String::new(),
            region: region.to_string(),
            subregion: String::new(),
            population: 0,
            area_km2: 0.0,
        }
    }
}

// ============================================================================
// COUNTRY REGISTRY
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct CountryRegistry {
    countries: HashMap<String, Country>,
}

impl CountryRegistry {
    pub fn new(countries: Vec<Country>) -> Self {
        CountryRegistry {
            countries: countries
                .into_iter()
                .map(|c| (c.iso_alpha2.to_uppercase(), c))
                .collect(),
        }
    }

    /// Look up by ISO alpha-2
    pub fn get(&self, iso_alpha2: &str) -> Option<&Country> {
        self.countries.get(&iso_alpha2.to_uppercase())
    }

    pub fn count(&self) -> usize {
        self.countries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.countries.is_empty()
    }
}
