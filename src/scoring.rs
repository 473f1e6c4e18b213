// 🎯 Scoring Engine - Airport exposure and country scores
//
// Three strategies share one contract: (earthquake, airport, distance) → a
// non-negative contribution. The strategy is chosen once per run; every
// strategy fills the same ExposureRecord / AirportExposure / CountryScore shapes.

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::entities::{Airport, AlertLevel, Country, Earthquake};
use crate::geo::{distance_km, felt_radius_at_depth_km};
use crate::shakemap::{
    ground_motion_at, ipe_estimate, EstimateSource, FallbackReason, GridCatalog,
    GroundMotionEstimate,
};

// ============================================================================
// SCORING METHOD
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringMethod {
    /// Sum of peak ground acceleration (%g) at each airport
    #[default]
    GroundMotion,
    /// Sum of 10^(0.5·M) / (d + 1)
    Heuristic,
    /// (quake count × avg magnitude) / exposed airports
    Legacy,
}

impl ScoringMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScoringMethod::GroundMotion => "ground_motion",
            ScoringMethod::Heuristic => "heuristic",
            ScoringMethod::Legacy => "legacy",
        }
    }

    pub fn parse(name: &str) -> Result<ScoringMethod> {
        match name.trim().to_lowercase().as_str() {
            "ground_motion" | "shakemap" => Ok(ScoringMethod::GroundMotion),
            "heuristic" | "exposure" => Ok(ScoringMethod::Heuristic),
            "legacy" => Ok(ScoringMethod::Legacy),
            other => bail!(
                "Unknown scoring method '{}' (expected ground_motion, heuristic or legacy)",
                other
            ),
        }
    }
}

impl FromStr for ScoringMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        ScoringMethod::parse(s)
    }
}

impl fmt::Display for ScoringMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// FORMULAS
// ============================================================================

/// Distance-weighted magnitude contribution: `10^(0.5·M) / (d + 1)`
pub fn heuristic_contribution(magnitude: f64, distance_km: f64) -> f64 {
    10f64.powf(0.5 * magnitude) / (distance_km.max(0.0) + 1.0)
}

/// Legacy country score; zero when nothing is exposed
pub fn legacy_score(earthquake_count: usize, avg_magnitude: f64, exposed_airport_count: usize) -> f64 {
    if exposed_airport_count == 0 {
        return 0.0;
    }
    (earthquake_count as f64 * avg_magnitude) / exposed_airport_count as f64
}

// ============================================================================
// RECORDS
// ============================================================================

/// One (airport, earthquake) pair inside the exposure radius
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureRecord {
    pub airport_code: String,
    pub earthquake_id: String,
    pub magnitude: f64,
    pub distance_km: f64,

    /// Peak ground acceleration in g (ground-motion scoring only)
    pub pga_g: Option<f64>,
    pub mmi: Option<f64>,
    pub intensity_source: Option<EstimateSource>,

    pub contribution: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AirportExposure {
    pub airport: Airport,

    /// Sorted by distance, closest first
    pub records: Vec<ExposureRecord>,

    pub closest_quake_km: f64,
    pub total_exposure: f64,
}

impl AirportExposure {
    pub fn nearby_quake_count(&self) -> usize {
        self.records.len()
    }

    pub fn max_pga_g(&self) -> Option<f64> {
        self.records.iter().filter_map(|r| r.pga_g).reduce(f64::max)
    }

    pub fn max_mmi(&self) -> Option<f64> {
        self.records.iter().filter_map(|r| r.mmi).reduce(f64::max)
    }

    /// Records whose ground motion came from the IPE instead of a grid
    pub fn fallback_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| matches!(r.intensity_source, Some(EstimateSource::Fallback(_))))
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeismicStats {
    pub avg_magnitude: f64,
    pub max_magnitude: f64,
    pub strongest_event_id: String,
    pub strongest_time: DateTime<Utc>,
    pub strongest_depth_km: f64,
    pub strongest_lat: f64,
    pub strongest_lon: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PagerContext {
    pub highest_alert: Option<AlertLevel>,
    pub max_felt_reports: u32,
    pub tsunami: bool,

    /// Events that carried any PAGER alert
    pub alert_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountryScore {
    pub iso_code: String,
    pub iso_alpha3: String,
    pub name: String,
    pub region: String,

    pub score: f64,
    pub earthquake_count: usize,
    pub exposed_airport_count: usize,

    pub stats: SeismicStats,
    pub pager: PagerContext,

    /// Exposed airports, highest exposure first
    pub airports: Vec<AirportExposure>,
}

// ============================================================================
// STATISTICS
// ============================================================================

/// Average magnitude and strongest event. Errors on an empty list.
pub fn compute_seismic_stats(quakes: &[&Earthquake]) -> Result<SeismicStats> {
    let strongest = quakes
        .iter()
        .copied()
        .reduce(|best, q| if q.magnitude > best.magnitude { q } else { best })
        .ok_or_else(|| anyhow!("Cannot compute seismic statistics without earthquakes"))?;

    let avg_magnitude = quakes.iter().map(|q| q.magnitude).sum::<f64>() / quakes.len() as f64;

    Ok(SeismicStats {
        avg_magnitude,
        max_magnitude: strongest.magnitude,
        strongest_event_id: strongest.id.clone(),
        strongest_time: strongest.time,
        strongest_depth_km: strongest.depth_km,
        strongest_lat: strongest.latitude,
        strongest_lon: strongest.longitude,
    })
}

pub fn compute_pager_context(quakes: &[&Earthquake]) -> PagerContext {
    PagerContext {
        highest_alert: quakes.iter().filter_map(|q| q.alert).max(),
        max_felt_reports: quakes.iter().map(|q| q.felt_reports).max().unwrap_or(0),
        tsunami: quakes.iter().any(|q| q.tsunami),
        alert_count: quakes.iter().filter(|q| q.alert.is_some()).count(),
    }
}

// ============================================================================
// PRE-FILTER
// ============================================================================

/// Quakes worth a grid lookup: they reference a grid and at least one airport
/// lies inside `min(felt radius, exposure radius)`.
pub fn quakes_needing_grids<'q>(
    quakes: &[&'q Earthquake],
    airports: &[&Airport],
    exposure_radius_km: f64,
) -> Vec<&'q Earthquake> {
    quakes
        .iter()
        .copied()
        .filter(|q| q.has_grid())
        .filter(|q| {
            let reach = felt_radius_at_depth_km(q.magnitude, q.depth_km).min(exposure_radius_km);
            airports
                .iter()
                .any(|a| distance_km(q.epicenter(), a.position()) <= reach)
        })
        .collect()
}

// ============================================================================
// SCORER
// ============================================================================

/// A scoring strategy bound to the run's grid catalog
#[derive(Debug, Clone, Copy)]
pub enum Scorer<'a> {
    GroundMotion { grids: &'a GridCatalog },
    Heuristic,
    Legacy,
}

impl<'a> Scorer<'a> {
    pub fn new(method: ScoringMethod, grids: &'a GridCatalog) -> Self {
        match method {
            ScoringMethod::GroundMotion => Scorer::GroundMotion { grids },
            ScoringMethod::Heuristic => Scorer::Heuristic,
            ScoringMethod::Legacy => Scorer::Legacy,
        }
    }

    pub fn method(&self) -> ScoringMethod {
        match self {
            Scorer::GroundMotion { .. } => ScoringMethod::GroundMotion,
            Scorer::Heuristic => ScoringMethod::Heuristic,
            Scorer::Legacy => ScoringMethod::Legacy,
        }
    }

    /// Ground motion for one pair. Pairs beyond the felt radius skip the grid.
    fn ground_motion(grids: &GridCatalog, quake: &Earthquake, airport: &Airport, distance: f64) -> GroundMotionEstimate {
        let felt = felt_radius_at_depth_km(quake.magnitude, quake.depth_km);
        if distance > felt {
            return ipe_estimate(
                quake.magnitude,
                distance,
                quake.depth_km,
                FallbackReason::BeyondFeltRadius,
            );
        }
        ground_motion_at(grids.state_for(&quake.id), quake, airport.position(), distance)
    }

    /// Build the record for one pair at a known distance
    pub fn record(&self, quake: &Earthquake, airport: &Airport, distance: f64) -> ExposureRecord {
        let mut record = ExposureRecord {
            airport_code: airport.iata_code.clone(),
            earthquake_id: quake.id.clone(),
            magnitude: quake.magnitude,
            distance_km: distance,
            pga_g: None,
            mmi: None,
            intensity_source: None,
            contribution: 0.0,
        };

        match self {
            Scorer::GroundMotion { grids } => {
                let estimate = Self::ground_motion(grids, quake, airport, distance);
                record.pga_g = Some(estimate.pga_g());
                record.mmi = estimate.mmi;
                record.intensity_source = Some(estimate.source);
                record.contribution = estimate.pga_pct_g.max(0.0);
            }
            // Legacy scores countries directly; its airport records use the heuristic
            Scorer::Heuristic | Scorer::Legacy => {
                record.contribution = heuristic_contribution(quake.magnitude, distance);
            }
        }

        record
    }

    /// Airports with at least one quake inside the radius, highest exposure first
    pub fn find_exposed_airports(
        &self,
        airports: &[&Airport],
        quakes: &[&Earthquake],
        exposure_radius_km: f64,
    ) -> Vec<AirportExposure> {
        let mut exposed: Vec<AirportExposure> = airports
            .iter()
            .filter_map(|airport| {
                let mut records: Vec<ExposureRecord> = quakes
                    .iter()
                    .filter_map(|quake| {
                        let d = distance_km(quake.epicenter(), airport.position());
                        (d <= exposure_radius_km).then(|| self.record(quake, airport, d))
                    })
                    .collect();

                if records.is_empty() {
                    return None;
                }

                records.sort_by(|a, b| {
                    a.distance_km
                        .total_cmp(&b.distance_km)
                        .then_with(|| a.earthquake_id.cmp(&b.earthquake_id))
                });

                Some(AirportExposure {
                    airport: (*airport).clone(),
                    closest_quake_km: records[0].distance_km,
                    total_exposure: records.iter().map(|r| r.contribution).sum(),
                    records,
                })
            })
            .collect();

        exposed.sort_by(|a, b| {
            b.total_exposure
                .total_cmp(&a.total_exposure)
                .then_with(|| a.airport.iata_code.cmp(&b.airport.iata_code))
        });
        exposed
    }

    /// Score one country. `None` when none of its airports is exposed.
    pub fn score_country(
        &self,
        country: &Country,
        quakes: &[&Earthquake],
        airports: &[&Airport],
        exposure_radius_km: f64,
    ) -> Result<Option<CountryScore>> {
        let exposed = self.find_exposed_airports(airports, quakes, exposure_radius_km);
        if exposed.is_empty() {
            debug!("{}: no airport within {} km of any quake", country.iso_alpha2, exposure_radius_km);
            return Ok(None);
        }

        let stats = compute_seismic_stats(quakes)?;
        let score = match self {
            Scorer::Legacy => legacy_score(quakes.len(), stats.avg_magnitude, exposed.len()),
            Scorer::GroundMotion { .. } | Scorer::Heuristic => {
                exposed.iter().map(|a| a.total_exposure).sum()
            }
        };

        Ok(Some(CountryScore {
            iso_code: country.iso_alpha2.clone(),
            iso_alpha3: country.iso_alpha3.clone(),
            name: country.name.clone(),
            region: country.region.clone(),
            score,
            earthquake_count: quakes.len(),
            exposed_airport_count: exposed.len(),
            pager: compute_pager_context(quakes),
            stats,
            airports: exposed,
        }))
    }
}

/// Highest score first, ties by ISO code
pub fn rank_scores(scores: &mut [CountryScore]) {
    scores.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.iso_code.cmp(&b.iso_code))
    });
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::EARTH_RADIUS_KM;
    use crate::shakemap::{grid_from_payload, GridPayload, GridState};
    use chrono::TimeZone;
    use std::sync::Arc;

    /// Latitude offset that is exactly `km` along a meridian
    fn lat_offset(km: f64) -> f64 {
        (km / EARTH_RADIUS_KM).to_degrees()
    }

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, day, 12, 0, 0).unwrap()
    }

    fn scenario() -> (Earthquake, Airport, Airport) {
        let quake = Earthquake::new("us6000", 6.0, 10.0, 120.0, 10.0, at(1)).in_country("PH");
        let near = Airport::new("NEA", "Near Field", "PH", 10.0 + lat_offset(50.0), 120.0);
        let far = Airport::new("FAR", "Far Field", "PH", 10.0 + lat_offset(300.0), 120.0);
        (quake, near, far)
    }

    #[test]
    fn test_method_names() {
        assert_eq!(ScoringMethod::parse("shakemap").unwrap(), ScoringMethod::GroundMotion);
        assert_eq!("exposure".parse::<ScoringMethod>().unwrap(), ScoringMethod::Heuristic);
        assert_eq!(ScoringMethod::parse("LEGACY").unwrap(), ScoringMethod::Legacy);
        assert!(ScoringMethod::parse("vibes").is_err());
        assert_eq!(ScoringMethod::default().to_string(), "ground_motion");
    }

    #[test]
    fn test_heuristic_only_inside_radius() {
        let (quake, near, far) = scenario();
        let grids = GridCatalog::default();
        let scorer = Scorer::new(ScoringMethod::Heuristic, &grids);

        let exposed = scorer.find_exposed_airports(&[&near, &far], &[&quake], 200.0);
        assert_eq!(exposed.len(), 1);
        assert_eq!(exposed[0].airport.iata_code, "NEA");
        assert!((exposed[0].closest_quake_km - 50.0).abs() < 1e-6);
        assert!((exposed[0].total_exposure - 1000.0 / 51.0).abs() < 1e-6);
        assert!((exposed[0].total_exposure - 19.6).abs() < 0.01);
        assert_eq!(exposed[0].records[0].pga_g, None);
    }

    #[test]
    fn test_heuristic_zero_distance() {
        assert_eq!(heuristic_contribution(6.0, 0.0), 1000.0);
    }

    #[test]
    fn test_legacy_formula() {
        assert_eq!(legacy_score(5, 5.5, 2), 13.75);
        assert_eq!(legacy_score(5, 5.5, 0), 0.0);
        assert_eq!(legacy_score(0, 0.0, 0), 0.0);
    }

    #[test]
    fn test_legacy_country_score() {
        let country = Country::new("PH", "PHL", "Philippines", "Asia");
        let quakes: Vec<Earthquake> = [5.0, 5.5, 6.0, 5.2, 5.8]
            .iter()
            .enumerate()
            .map(|(i, m)| Earthquake::new(&format!("q{}", i), *m, 10.0, 120.0, 10.0, at(1 + i as u32)))
            .collect();
        let quake_refs: Vec<&Earthquake> = quakes.iter().collect();
        let a = Airport::new("AAA", "A", "PH", 10.1, 120.0);
        let b = Airport::new("BBB", "B", "PH", 10.0, 120.1);
        let c = Airport::new("CCC", "C", "PH", 20.0, 120.0);

        let grids = GridCatalog::default();
        let scorer = Scorer::new(ScoringMethod::Legacy, &grids);
        let score = scorer
            .score_country(&country, &quake_refs, &[&a, &b, &c], 200.0)
            .unwrap()
            .unwrap();

        assert_eq!(score.exposed_airport_count, 2);
        assert!((score.stats.avg_magnitude - 5.5).abs() < 1e-12);
        assert!((score.score - 13.75).abs() < 1e-9);
        // Same record shape as the per-airport strategies
        assert!(score.airports.iter().all(|a| a.total_exposure > 0.0));
    }

    #[test]
    fn test_country_without_exposed_airports() {
        let (quake, _, far) = scenario();
        let country = Country::new("PH", "PHL", "Philippines", "Asia");
        let grids = GridCatalog::default();

        for method in [ScoringMethod::GroundMotion, ScoringMethod::Heuristic, ScoringMethod::Legacy] {
            let scorer = Scorer::new(method, &grids);
            let result = scorer.score_country(&country, &[&quake], &[&far], 200.0).unwrap();
            assert!(result.is_none(), "{} produced a score", method);
        }
    }

    #[test]
    fn test_ground_motion_uses_grid_when_parsed() {
        let quake = Earthquake::new("gm1", 6.8, 35.5, 139.5, 10.0, at(2)).with_grid("grid://gm1");
        let airport = Airport::new("HND", "Haneda", "JP", 35.5, 139.5);

        let grid = grid_from_payload(
            GridPayload {
                event_id: None,
                origin_lat: 36.0,
                origin_lon: 139.0,
                lat_spacing: 0.5,
                lon_spacing: 0.5,
                nlat: 3,
                nlon: 3,
                units: None,
                pga: vec![1.0, 2.0, 1.0, 2.0, 42.0, 2.0, 1.0, 2.0, 1.0],
                mmi: None,
            },
            "gm1",
        )
        .unwrap();
        let mut grids = GridCatalog::default();
        grids.insert("gm1".to_string(), GridState::Parsed(Arc::new(grid)));

        let scorer = Scorer::new(ScoringMethod::GroundMotion, &grids);
        let exposed = scorer.find_exposed_airports(&[&airport], &[&quake], 200.0);

        let record = &exposed[0].records[0];
        assert_eq!(record.contribution, 42.0);
        assert_eq!(record.pga_g, Some(0.42));
        assert_eq!(record.intensity_source, Some(EstimateSource::Interpolated));
        assert_eq!(exposed[0].fallback_count(), 0);
    }

    #[test]
    fn test_ground_motion_falls_back_without_grid() {
        let (quake, near, _) = scenario();
        let grids = GridCatalog::default();
        let scorer = Scorer::new(ScoringMethod::GroundMotion, &grids);

        let exposed = scorer.find_exposed_airports(&[&near], &[&quake], 200.0);
        let record = &exposed[0].records[0];
        assert!(record.contribution > 0.0);
        assert!(record.mmi.is_some());
        assert!(matches!(record.intensity_source, Some(EstimateSource::Fallback(_))));
        assert_eq!(exposed[0].max_pga_g(), record.pga_g);
    }

    #[test]
    fn test_beyond_felt_radius_skips_grid() {
        let quake = Earthquake::new("small", 4.0, 0.0, 0.0, 10.0, at(3)).with_grid("grid://small");
        let airport = Airport::new("XXX", "Remote", "ZZ", lat_offset(150.0), 0.0);
        let grids = GridCatalog::default();
        let scorer = Scorer::new(ScoringMethod::GroundMotion, &grids);

        let record = scorer.record(&quake, &airport, 150.0);
        assert_eq!(
            record.intensity_source,
            Some(EstimateSource::Fallback(FallbackReason::BeyondFeltRadius))
        );
        assert!(quakes_needing_grids(&[&quake], &[&airport], 200.0).is_empty());
    }

    #[test]
    fn test_quakes_needing_grids() {
        let with_grid = Earthquake::new("g", 6.5, 10.0, 120.0, 10.0, at(4)).with_grid("grid://g");
        let without = Earthquake::new("n", 6.5, 10.0, 120.0, 10.0, at(4));
        let airport = Airport::new("NEA", "Near", "PH", 10.0 + lat_offset(20.0), 120.0);

        let needed = quakes_needing_grids(&[&with_grid, &without], &[&airport], 200.0);
        assert_eq!(needed.len(), 1);
        assert_eq!(needed[0].id, "g");
    }

    #[test]
    fn test_seismic_stats_and_pager() {
        let q1 = Earthquake::new("a", 5.0, 1.0, 1.0, 5.0, at(1)).with_pager(Some(AlertLevel::Yellow), 10, false);
        let q2 = Earthquake::new("b", 7.0, 2.0, 2.0, 30.0, at(2)).with_pager(Some(AlertLevel::Orange), 4, true);
        let q3 = Earthquake::new("c", 6.0, 3.0, 3.0, 8.0, at(3));

        let stats = compute_seismic_stats(&[&q1, &q2, &q3]).unwrap();
        assert!((stats.avg_magnitude - 6.0).abs() < 1e-12);
        assert_eq!(stats.max_magnitude, 7.0);
        assert_eq!(stats.strongest_event_id, "b");
        assert_eq!(stats.strongest_depth_km, 30.0);

        let pager = compute_pager_context(&[&q1, &q2, &q3]);
        assert_eq!(pager.highest_alert, Some(AlertLevel::Orange));
        assert_eq!(pager.max_felt_reports, 10);
        assert!(pager.tsunami);
        assert_eq!(pager.alert_count, 2);

        assert!(compute_seismic_stats(&[]).is_err());
        assert_eq!(compute_pager_context(&[]), PagerContext::default());
    }

    #[test]
    fn test_rank_scores_ties_by_iso() {
        let (quake, near, _) = scenario();
        let grids = GridCatalog::default();
        let scorer = Scorer::new(ScoringMethod::Heuristic, &grids);
        let base = scorer
            .score_country(&Country::new("PH", "PHL", "Philippines", "Asia"), &[&quake], &[&near], 200.0)
            .unwrap()
            .unwrap();

        let mut tied = base.clone();
        tied.iso_code = "AA".to_string();
        let mut higher = base.clone();
        higher.iso_code = "ZZ".to_string();
        higher.score += 1.0;

        let mut scores = vec![base, tied, higher];
        rank_scores(&mut scores);
        let order: Vec<&str> = scores.iter().map(|s| s.iso_code.as_str()).collect();
        assert_eq!(order, vec!["ZZ", "AA", "PH"]);
    }
}
