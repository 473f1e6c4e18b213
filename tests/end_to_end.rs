// End-to-end runs through the public API

use chrono::{DateTime, Duration, TimeZone, Utc};
use seismic_exposure::geo::EARTH_RADIUS_KM;
use seismic_exposure::history::CountrySnapshot;
use seismic_exposure::shakemap::{EstimateSource, FallbackReason};
use seismic_exposure::*;
use tempfile::tempdir;

fn as_of() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 9, 15, 0, 0, 0).unwrap()
}

fn km_north(lat: f64, km: f64) -> f64 {
    lat + (km / EARTH_RADIUS_KM).to_degrees()
}

/// M6.0 at (10, 120) with airports 50 km and 300 km north
fn philippines_inputs(magnitudes: &[f64]) -> RunInputs {
    RunInputs {
        earthquakes: magnitudes
            .iter()
            .enumerate()
            .map(|(i, m)| {
                Earthquake::new(&format!("ph{}", i), *m, 10.0, 120.0, 10.0, as_of() - Duration::days(1))
                    .in_country("PH")
            })
            .collect(),
        airports: vec![
            Airport::new("NEA", "Fifty Km Intl", "PH", km_north(10.0, 50.0), 120.0),
            Airport::new("FAR", "Three Hundred Km Intl", "PH", km_north(10.0, 300.0), 120.0),
        ],
        countries: vec![Country::new("PH", "PHL", "Philippines", "Asia")],
    }
}

fn config(method: ScoringMethod) -> ExposureConfig {
    ExposureConfig {
        scoring_method: method,
        min_quakes_per_country: 1,
        ..ExposureConfig::default()
    }
}

#[test]
fn heuristic_scenario_single_exposed_airport() {
    let cache = CacheStore::disabled();
    let engine = ExposureEngine::new(config(ScoringMethod::Heuristic), &cache);

    let report = engine.run(&philippines_inputs(&[6.0]), as_of()).unwrap();

    assert_eq!(report.airports.len(), 1);
    assert_eq!(report.airports[0].iata_code, "NEA");
    assert!((report.airports[0].exposure - 19.6).abs() < 0.01);
    assert!((report.countries[0].score.score - 1000.0 / 51.0).abs() < 1e-6);

    let records = &report.countries[0].score.airports[0].records;
    assert_eq!(records.len(), 1);
    assert!((records[0].distance_km - 50.0).abs() < 1e-6);
}

#[test]
fn legacy_scenario_ratio() {
    let cache = CacheStore::disabled();
    let engine = ExposureEngine::new(config(ScoringMethod::Legacy), &cache);

    let mut inputs = philippines_inputs(&[5.0, 5.5, 6.0, 5.2, 5.8]);
    inputs
        .airports
        .push(Airport::new("NEB", "Second Near Intl", "PH", 10.0, 120.3));

    let report = engine.run(&inputs, as_of()).unwrap();
    let ph = &report.countries[0].score;
    assert_eq!(ph.earthquake_count, 5);
    assert_eq!(ph.exposed_airport_count, 2);
    assert!((ph.score - 13.75).abs() < 1e-9);
}

#[test]
fn ground_motion_grid_and_fallback() {
    let mut source = InMemoryGridSource::new();
    source
        .insert_payload(
            "ph0",
            &GridPayload {
                event_id: Some("ph0".to_string()),
                origin_lat: 11.0,
                origin_lon: 119.0,
                lat_spacing: 0.5,
                lon_spacing: 0.5,
                nlat: 5,
                nlon: 5,
                units: Some("g".to_string()),
                pga: vec![0.08; 25],
                mmi: Some(vec![6.0; 25]),
            },
        )
        .unwrap();

    let dir = tempdir().unwrap();
    let cache = CacheStore::open(dir.path().join("cache.db"));
    let engine = ExposureEngine::new(config(ScoringMethod::GroundMotion), &cache)
        .with_grid_source(&source);

    let mut inputs = philippines_inputs(&[6.0]);
    inputs.earthquakes[0] = inputs.earthquakes[0].clone().with_grid("grid://ph0");

    let report = engine.run(&inputs, as_of()).unwrap();
    assert_eq!(report.fidelity.grids_parsed, 1);

    let record = &report.countries[0].score.airports[0].records[0];
    assert_eq!(record.intensity_source, Some(EstimateSource::Interpolated));
    assert!((record.pga_g.unwrap() - 0.08).abs() < 1e-12);
    assert!((record.contribution - 8.0).abs() < 1e-9);
    assert!((record.mmi.unwrap() - 6.0).abs() < 1e-9);

    // Same run without the grid product falls back to the IPE
    let no_grid = engine.run(&philippines_inputs(&[6.0]), as_of()).unwrap();
    let record = &no_grid.countries[0].score.airports[0].records[0];
    assert_eq!(
        record.intensity_source,
        Some(EstimateSource::Fallback(FallbackReason::NoGrid))
    );
    assert!(record.contribution > 0.0);
}

#[test]
fn failing_grid_source_degrades_without_aborting() {
    struct Offline;
    impl GridSource for Offline {
        fn fetch_grid(&self, _: &str, _: &str) -> anyhow::Result<Option<Vec<u8>>> {
            Err(anyhow::anyhow!("network unreachable"))
        }
    }

    let cache = CacheStore::disabled();
    let source = Offline;
    let engine = ExposureEngine::new(config(ScoringMethod::GroundMotion), &cache)
        .with_grid_source(&source);

    let mut inputs = philippines_inputs(&[6.0]);
    inputs.earthquakes[0] = inputs.earthquakes[0].clone().with_grid("grid://ph0");

    let report = engine.run(&inputs, as_of()).unwrap();
    assert_eq!(report.countries.len(), 1);
    assert!(report.fidelity.degraded);
    assert_eq!(report.fidelity.degraded_events[0].reason, FallbackReason::FetchFailed);
}

#[test]
fn trend_delta_between_snapshots() {
    let dir = tempdir().unwrap();
    let history = HistoryStore::open(dir.path().join("history.db")).unwrap();

    let mut first = Snapshot::new(as_of(), Granularity::Daily, ScoringMethod::Heuristic);
    first.add_country(CountrySnapshot {
        iso_code: "PH".to_string(),
        name: "Philippines".to_string(),
        score: 6.5,
        earthquake_count: 3,
        exposed_airport_count: 1,
        avg_magnitude: 5.5,
        max_magnitude: 6.1,
    });
    let mut second = first.clone();
    second.snapshot_id = "second".to_string();
    second.generated_at = as_of() + Duration::days(1);
    if let Some(ph) = second.countries.get_mut("PH") {
        ph.score = 8.2;
    }

    history.append(&first).unwrap();
    history.append(&second).unwrap();

    let timeline = history.load_timeline(Some(90)).unwrap();
    let trends = compute_trends(&timeline, Metric::Score);
    assert_eq!(trends.len(), 1);
    assert_eq!(trends[0].status, TrendStatus::Changed);
    assert!((trends[0].delta.unwrap() - 1.7).abs() < 1e-9);

    let points = series(&timeline, &EntityRef::country("PH"), Metric::Score);
    assert_eq!(points.iter().map(|p| p.value).collect::<Vec<_>>(), vec![6.5, 8.2]);
}

#[test]
fn repeated_runs_build_history() {
    let dir = tempdir().unwrap();
    let cache = CacheStore::open(dir.path().join("cache.db"));
    let history = HistoryStore::open(dir.path().join("history.db")).unwrap();
    let engine = ExposureEngine::new(config(ScoringMethod::Heuristic), &cache).with_history(&history);

    let first = engine.run(&philippines_inputs(&[6.0]), as_of()).unwrap();
    let ph_first = first.countries[0].trend.as_ref().unwrap();
    assert_eq!(ph_first.status, TrendStatus::InsufficientHistory);
    assert!(ph_first.delta.is_none());

    let second = engine
        .run(&philippines_inputs(&[6.0]), as_of() + Duration::days(1))
        .unwrap();
    let ph_second = second.countries[0].trend.as_ref().unwrap();
    assert_eq!(ph_second.status, TrendStatus::Unchanged);
    assert_eq!(ph_second.delta, Some(0.0));
    assert_eq!(second.countries[0].series.len(), 2);
}
