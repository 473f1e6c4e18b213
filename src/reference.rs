// 📥 Reference Data - Airport and country registries from CSV
//
// Airports use the OurAirports column names. Rows that fail to decode are
// skipped with a warning; an unreadable file is an error.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::Deserialize;
use std::path::Path;

use crate::cache::{airports_ttl, countries_ttl, CacheKey, CacheStore};
use crate::entities::{Airport, AirportType, Country};

#[derive(Debug, Deserialize)]
struct AirportRow {
    #[serde(rename = "type")]
    airport_type: String,
    name: String,
    latitude_deg: f64,
    longitude_deg: f64,
    iso_country: String,
    #[serde(default)]
    municipality: Option<String>,
    #[serde(default)]
    iata_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CountryRow {
    iso_alpha2: String,
    #[serde(default)]
    iso_alpha3: Option<String>,
    name: String,
    #[serde(default)]
    capital: Option<String>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    subregion: Option<String>,
    #[serde(default)]
    population: Option<u64>,
    #[serde(default)]
    area_km2: Option<f64>,
}

/// Load every airport from an OurAirports `airports.csv`
pub fn load_airports_csv(csv_path: &Path) -> Result<Vec<Airport>> {
    let mut rdr = csv::Reader::from_path(csv_path)
        .with_context(|| format!("Failed to open airports CSV {:?}", csv_path))?;

    let mut airports = Vec::new();
    let mut skipped = 0;

    for (line, result) in rdr.deserialize::<AirportRow>().enumerate() {
        let row = match result {
            Ok(row) => row,
            Err(e) => {
                debug!("Skipping airport row {}: {}", line + 2, e);
                skipped += 1;
                continue;
            }
        };

        airports.push(
            Airport::new(
                row.iata_code.as_deref().unwrap_or(""),
                &row.name,
                &row.iso_country,
                row.latitude_deg,
                row.longitude_deg,
            )
            .with_type(AirportType::parse(&row.airport_type))
            .with_municipality(row.municipality.as_deref().unwrap_or("")),
        );
    }

    if skipped > 0 {
        warn!("Skipped {} malformed airport rows in {:?}", skipped, csv_path);
    }
    info!("Loaded {} airports from {:?}", airports.len(), csv_path);
    Ok(airports)
}

/// Load country metadata (ISO alpha-2 keyed)
pub fn load_countries_csv(csv_path: &Path) -> Result<Vec<Country>> {
    let mut rdr = csv::Reader::from_path(csv_path)
        .with_context(|| format!("Failed to open countries CSV {:?}", csv_path))?;

    let mut countries = Vec::new();
    let mut skipped = 0;

    for result in rdr.deserialize::<CountryRow>() {
        let row = match result {
            Ok(row) if !row.iso_alpha2.trim().is_empty() => row,
            Ok(_) | Err(_) => {
                skipped += 1;
                continue;
            }
        };

        let mut country = Country::new(
            row.iso_alpha2.trim(),
            row.iso_alpha3.as_deref().unwrap_or("").trim(),
            &row.name,
            row.region.as_deref().unwrap_or(""),
        );
        country.capital = row.capital.unwrap_or_default();
        country.subregion = row.subregion.unwrap_or_default();
        country.population = row.population.unwrap_or(0);
        country.area_km2 = row.area_km2.unwrap_or(0.0);
        countries.push(country);
    }

    if skipped > 0 {
        warn!("Skipped {} malformed country rows in {:?}", skipped, csv_path);
    }
    info!("Loaded {} countries from {:?}", countries.len(), csv_path);
    Ok(countries)
}

/// [`load_airports_csv`] behind the cache (24 h)
pub fn load_airports_cached(csv_path: &Path, cache: &CacheStore) -> Result<Vec<Airport>> {
    let key = reference_key("airports", csv_path);
    if let Some(airports) = cache.get_json::<Vec<Airport>>(&key) {
        debug!("Airports served from cache");
        return Ok(airports);
    }

    let airports = load_airports_csv(csv_path)?;
    if let Err(e) = cache.put_json(&key, &airports, airports_ttl()) {
        warn!("Could not cache airports: {:#}", e);
    }
    Ok(airports)
}

/// [`load_countries_csv`] behind the cache (7 days)
pub fn load_countries_cached(csv_path: &Path, cache: &CacheStore) -> Result<Vec<Country>> {
    let key = reference_key("countries", csv_path);
    if let Some(countries) = cache.get_json::<Vec<Country>>(&key) {
        debug!("Countries served from cache");
        return Ok(countries);
    }

    let countries = load_countries_csv(csv_path)?;
    if let Err(e) = cache.put_json(&key, &countries, countries_ttl()) {
        warn!("Could not cache countries: {:#}", e);
    }
    Ok(countries)
}

fn reference_key(source: &str, csv_path: &Path) -> CacheKey {
    let path = csv_path.to_string_lossy();
    CacheKey::fingerprint(source, &[("path", path.as_ref())])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::NO_IATA;
    use std::fs;
    use tempfile::tempdir;

    const AIRPORTS_CSV: &str = "\
id,ident,type,name,latitude_deg,longitude_deg,elevation_ft,continent,iso_country,iso_region,municipality,scheduled_service,gps_code,iata_code,local_code
1,RJAA,large_airport,Narita International Airport,35.764,140.386,141,AS,JP,JP-12,Narita,yes,RJAA,NRT,
2,RJTT,large_airport,Tokyo Haneda International Airport,35.552,139.780,35,AS,JP,JP-13,Tokyo,yes,RJTT,HND,
3,XX01,small_airport,Farm Strip,35.0,139.0,10,AS,JP,JP-13,,no,,,
4,XX02,large_airport,Broken Row,north,139.0,10,AS,JP,JP-13,,no,,,
";

    const COUNTRIES_CSV: &str = "\
iso_alpha2,iso_alpha3,name,capital,region,subregion,population,area_km2
JP,JPN,Japan,Tokyo,Asia,Eastern Asia,125000000,377975
PH,PHL,Philippines,Manila,Asia,South-Eastern Asia,,
,,Nowhere,,,,,
";

    #[test]
    fn test_load_airports() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("airports.csv");
        fs::write(&path, AIRPORTS_CSV).unwrap();

        let airports = load_airports_csv(&path).unwrap();
        assert_eq!(airports.len(), 3);
        assert_eq!(airports[0].iata_code, "NRT");
        assert_eq!(airports[0].municipality, "Narita");
        assert_eq!(airports[2].iata_code, NO_IATA);
        assert_eq!(airports[2].airport_type, AirportType::SmallAirport);
    }

    #[test]
    fn test_load_countries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("countries.csv");
        fs::write(&path, COUNTRIES_CSV).unwrap();

        let countries = load_countries_csv(&path).unwrap();
        assert_eq!(countries.len(), 2);
        assert_eq!(countries[0].population, 125_000_000);
        assert_eq!(countries[1].iso_alpha3, "PHL");
        assert_eq!(countries[1].population, 0);
    }

    #[test]
    fn test_missing_file_is_error() {
        let dir = tempdir().unwrap();
        assert!(load_airports_csv(&dir.path().join("nope.csv")).is_err());
    }

    #[test]
    fn test_cached_loader_survives_file_removal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("airports.csv");
        fs::write(&path, AIRPORTS_CSV).unwrap();
        let cache = CacheStore::open_in_memory().unwrap();

        let first = load_airports_cached(&path, &cache).unwrap();
        fs::remove_file(&path).unwrap();
        let second = load_airports_cached(&path, &cache).unwrap();
        assert_eq!(first, second);
    }
}
