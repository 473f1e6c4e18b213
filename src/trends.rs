// 📊 Trends - Deltas between the two newest snapshots
//
// Alignment is an outer join by stable identifier (ISO code / airport key):
//   present in both   → delta, Changed or Unchanged (exact zero only)
//   only in newest    → New, no delta
//   only in previous  → dropped from the output
// With fewer than two snapshots every entity is InsufficientHistory.
//
// Presence is per metric: an airport stored without a PGA value is absent for
// MaxPga, so it reads New once a value appears and drops out when it goes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::history::{Snapshot, Timeline};

/// Default |delta| below which a change reads as stable
pub const DEFAULT_TREND_THRESHOLD: f64 = 0.5;

// ============================================================================
// ENTITIES & METRICS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Country,
    Airport,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityRef {
    pub fn country(iso_code: &str) -> Self {
        EntityRef {
            kind: EntityKind::Country,
            id: iso_code.to_string(),
        }
    }

    pub fn airport(key: &str) -> Self {
        EntityRef {
            kind: EntityKind::Airport,
            id: key.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Score,
    EarthquakeCount,
    AvgMagnitude,
    ExposedAirportCount,
    Exposure,
    MaxPga,
}

impl Metric {
    pub fn kind(&self) -> EntityKind {
        match self {
            Metric::Score
            | Metric::EarthquakeCount
            | Metric::AvgMagnitude
            | Metric::ExposedAirportCount => EntityKind::Country,
            Metric::Exposure | Metric::MaxPga => EntityKind::Airport,
        }
    }

    /// Metric value for an entity in one snapshot. An entity without a value
    /// (missing, or no PGA recorded) counts as absent from that snapshot.
    pub fn value(&self, snapshot: &Snapshot, id: &str) -> Option<f64> {
        match self.kind() {
            EntityKind::Country => {
                let c = snapshot.countries.get(id)?;
                Some(match self {
                    Metric::Score => c.score,
                    Metric::EarthquakeCount => c.earthquake_count as f64,
                    Metric::AvgMagnitude => c.avg_magnitude,
                    _ => c.exposed_airport_count as f64,
                })
            }
            EntityKind::Airport => {
                let a = snapshot.airports.get(id)?;
                match self {
                    Metric::MaxPga => a.max_pga_g,
                    _ => Some(a.exposure),
                }
            }
        }
    }

    /// Identifiers with a value in this snapshot, with display labels
    fn entities(&self, snapshot: &Snapshot) -> BTreeMap<String, (String, f64)> {
        let ids: Vec<(&String, &String)> = match self.kind() {
            EntityKind::Country => snapshot.countries.iter().map(|(k, c)| (k, &c.name)).collect(),
            EntityKind::Airport => snapshot.airports.iter().map(|(k, a)| (k, &a.name)).collect(),
        };

        ids.into_iter()
            .filter_map(|(id, label)| {
                self.value(snapshot, id)
                    .map(|v| (id.clone(), (label.clone(), v)))
            })
            .collect()
    }
}

// ============================================================================
// TREND ENTRY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendStatus {
    New,
    Changed,
    Unchanged,
    InsufficientHistory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Up,
    Down,
    Stable,
    New,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendEntry {
    pub entity: EntityRef,
    pub label: String,
    pub metric: Metric,
    pub current: f64,
    pub previous: Option<f64>,

    /// current − previous; `None` unless the entity is in both snapshots
    pub delta: Option<f64>,

    pub status: TrendStatus,
}

impl TrendEntry {
    /// Display direction; `None` for insufficient history
    pub fn direction(&self, threshold: f64) -> Option<TrendDirection> {
        match self.status {
            TrendStatus::New => Some(TrendDirection::New),
            TrendStatus::InsufficientHistory => None,
            TrendStatus::Unchanged => Some(TrendDirection::Stable),
            TrendStatus::Changed => {
                let delta = self.delta.unwrap_or(0.0);
                Some(if delta > threshold {
                    TrendDirection::Up
                } else if delta < -threshold {
                    TrendDirection::Down
                } else {
                    TrendDirection::Stable
                })
            }
        }
    }
}

// ============================================================================
// COMPUTATION
// ============================================================================

/// Trends of `metric` for every entity with a value in the newest snapshot,
/// ordered by id. Entities join on having a value for `metric`: for MaxPga an
/// airport recorded without PGA in the previous snapshot counts as New.
pub fn compute_trends(timeline: &Timeline, metric: Metric) -> Vec<TrendEntry> {
    let current = match timeline.latest() {
        Some(s) => metric.entities(s),
        None => return Vec::new(),
    };
    let previous = timeline.previous().map(|s| metric.entities(s));

    current
        .into_iter()
        .map(|(id, (label, value))| {
            let entity = EntityRef {
                kind: metric.kind(),
                id,
            };

            let (previous_value, delta, status) = match &previous {
                None => (None, None, TrendStatus::InsufficientHistory),
                Some(prev) => match prev.get(&entity.id) {
                    None => (None, None, TrendStatus::New),
                    Some((_, before)) => {
                        let delta = value - before;
                        let status = if delta == 0.0 {
                            TrendStatus::Unchanged
                        } else {
                            TrendStatus::Changed
                        };
                        (Some(*before), Some(delta), status)
                    }
                },
            };

            TrendEntry {
                entity,
                label,
                metric,
                current: value,
                previous: previous_value,
                delta,
                status,
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub at: DateTime<Utc>,
    pub value: f64,
}

/// Ordered (timestamp, value) pairs across the full timeline. Snapshots where
/// the entity has no value are skipped.
pub fn series(timeline: &Timeline, entity: &EntityRef, metric: Metric) -> Vec<SeriesPoint> {
    if metric.kind() != entity.kind {
        return Vec::new();
    }

    timeline
        .snapshots
        .iter()
        .filter_map(|s| {
            metric.value(s, &entity.id).map(|value| SeriesPoint {
                at: s.generated_at,
                value,
            })
        })
        .collect()
}

/// The `n` largest |delta| entries, ties by identifier
pub fn top_movers(entries: &[TrendEntry], n: usize) -> Vec<TrendEntry> {
    let mut movers: Vec<&TrendEntry> = entries.iter().filter(|e| e.delta.is_some()).collect();
    movers.sort_by(|a, b| {
        let da = a.delta.unwrap_or(0.0).abs();
        let db = b.delta.unwrap_or(0.0).abs();
        db.total_cmp(&da).then_with(|| a.entity.cmp(&b.entity))
    });
    movers.into_iter().take(n).cloned().collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{AirportSnapshot, CountrySnapshot, Granularity};
    use crate::scoring::ScoringMethod;
    use chrono::TimeZone;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, day, 0, 0, 0).unwrap()
    }

    fn snap(day: u32, granularity: Granularity, countries: &[(&str, f64)]) -> Snapshot {
        let mut s = Snapshot::new(at(day), granularity, ScoringMethod::GroundMotion);
        for (iso, score) in countries {
            s.add_country(CountrySnapshot {
                iso_code: iso.to_string(),
                name: format!("Country {}", iso),
                score: *score,
                earthquake_count: 3,
                exposed_airport_count: 1,
                avg_magnitude: 5.5,
                max_magnitude: 6.0,
            });
        }
        s
    }

    fn with_airport(mut s: Snapshot, iata: &str, exposure: f64, pga: Option<f64>) -> Snapshot {
        s.add_airport(AirportSnapshot {
            iata_code: iata.to_string(),
            name: format!("Airport {}", iata),
            country_code: "JP".to_string(),
            exposure,
            nearby_quake_count: 1,
            closest_quake_km: 10.0,
            max_pga_g: pga,
            max_mmi: None,
        });
        s
    }

    fn entry<'a>(entries: &'a [TrendEntry], id: &str) -> &'a TrendEntry {
        entries.iter().find(|e| e.entity.id == id).unwrap()
    }

    #[test]
    fn test_changed_delta() {
        let timeline = Timeline::new(vec![
            snap(1, Granularity::Daily, &[("JP", 6.5)]),
            snap(2, Granularity::Daily, &[("JP", 8.2)]),
        ]);

        let trends = compute_trends(&timeline, Metric::Score);
        let jp = entry(&trends, "JP");
        assert_eq!(jp.status, TrendStatus::Changed);
        assert!((jp.delta.unwrap() - 1.7).abs() < 1e-9);
        assert_eq!(jp.previous, Some(6.5));
        assert_eq!(jp.direction(DEFAULT_TREND_THRESHOLD), Some(TrendDirection::Up));
    }

    #[test]
    fn test_new_unchanged_and_vanished() {
        let timeline = Timeline::new(vec![
            snap(1, Granularity::Daily, &[("JP", 4.0), ("CL", 2.0)]),
            snap(2, Granularity::Daily, &[("JP", 4.0), ("PH", 0.0)]),
        ]);

        let trends = compute_trends(&timeline, Metric::Score);
        assert_eq!(trends.len(), 2);

        let jp = entry(&trends, "JP");
        assert_eq!(jp.status, TrendStatus::Unchanged);
        assert_eq!(jp.delta, Some(0.0));

        // A zero score that did not exist before is new, not a delta from zero
        let ph = entry(&trends, "PH");
        assert_eq!(ph.status, TrendStatus::New);
        assert_eq!(ph.delta, None);
        assert_eq!(ph.direction(DEFAULT_TREND_THRESHOLD), Some(TrendDirection::New));

        assert!(trends.iter().all(|e| e.entity.id != "CL"));
    }

    #[test]
    fn test_tiny_delta_is_changed_not_unchanged() {
        let timeline = Timeline::new(vec![
            snap(1, Granularity::Daily, &[("JP", 1.0)]),
            snap(2, Granularity::Daily, &[("JP", 1.0 + 1e-12)]),
        ]);
        let jp = &compute_trends(&timeline, Metric::Score)[0];
        assert_eq!(jp.status, TrendStatus::Changed);
        assert_eq!(jp.direction(DEFAULT_TREND_THRESHOLD), Some(TrendDirection::Stable));
    }

    #[test]
    fn test_single_snapshot_has_no_deltas() {
        let timeline = Timeline::new(vec![snap(1, Granularity::Daily, &[("JP", 4.0), ("PH", 1.0)])]);
        let trends = compute_trends(&timeline, Metric::Score);
        assert_eq!(trends.len(), 2);
        assert!(trends
            .iter()
            .all(|e| e.delta.is_none() && e.status == TrendStatus::InsufficientHistory));
        assert_eq!(trends[0].direction(DEFAULT_TREND_THRESHOLD), None);
    }

    #[test]
    fn test_empty_timeline() {
        assert!(compute_trends(&Timeline::default(), Metric::Score).is_empty());
    }

    #[test]
    fn test_mixed_granularity_compares_uniformly() {
        let timeline = Timeline::new(vec![
            snap(2, Granularity::Daily, &[("JP", 3.0)]),
            snap(1, Granularity::Monthly, &[("JP", 1.0)]),
        ]);
        let jp = &compute_trends(&timeline, Metric::Score)[0];
        assert_eq!(jp.delta, Some(2.0));
    }

    #[test]
    fn test_airport_metrics() {
        let timeline = Timeline::new(vec![
            with_airport(snap(1, Granularity::Daily, &[]), "NRT", 10.0, None),
            with_airport(snap(2, Granularity::Daily, &[]), "NRT", 7.0, Some(0.2)),
        ]);

        let exposure = compute_trends(&timeline, Metric::Exposure);
        assert_eq!(exposure[0].delta, Some(-3.0));
        assert_eq!(exposure[0].direction(DEFAULT_TREND_THRESHOLD), Some(TrendDirection::Down));

        // No PGA last time: MaxPga has nothing to compare against
        let pga = compute_trends(&timeline, Metric::MaxPga);
        assert_eq!(pga[0].status, TrendStatus::New);
        assert_eq!(pga[0].previous, None);
    }

    #[test]
    fn test_max_pga_dropped_when_value_disappears() {
        let timeline = Timeline::new(vec![
            with_airport(snap(1, Granularity::Daily, &[]), "NRT", 10.0, Some(0.3)),
            with_airport(snap(2, Granularity::Daily, &[]), "NRT", 7.0, None),
        ]);

        assert!(compute_trends(&timeline, Metric::MaxPga).is_empty());
        assert_eq!(compute_trends(&timeline, Metric::Exposure).len(), 1);
    }

    #[test]
    fn test_series_skips_absent_snapshots() {
        let timeline = Timeline::new(vec![
            snap(1, Granularity::Monthly, &[("JP", 1.0)]),
            snap(2, Granularity::Daily, &[("PH", 9.0)]),
            snap(3, Granularity::Daily, &[("JP", 3.0)]),
        ]);

        let points = series(&timeline, &EntityRef::country("JP"), Metric::Score);
        assert_eq!(points.len(), 2);
        assert_eq!(points[0], SeriesPoint { at: at(1), value: 1.0 });
        assert_eq!(points[1], SeriesPoint { at: at(3), value: 3.0 });

        assert!(series(&timeline, &EntityRef::country("JP"), Metric::Exposure).is_empty());
    }

    #[test]
    fn test_top_movers_order_and_ties() {
        let timeline = Timeline::new(vec![
            snap(1, Granularity::Daily, &[("AA", 1.0), ("BB", 5.0), ("CC", 1.0), ("DD", 1.0)]),
            snap(2, Granularity::Daily, &[("AA", 3.0), ("BB", 3.0), ("CC", 6.0), ("DD", 1.0), ("EE", 9.0)]),
        ]);
        let trends = compute_trends(&timeline, Metric::Score);

        let movers = top_movers(&trends, 3);
        let ids: Vec<&str> = movers.iter().map(|e| e.entity.id.as_str()).collect();
        assert_eq!(ids, vec!["CC", "AA", "BB"]);

        assert_eq!(top_movers(&trends, 10).len(), 4);
        assert!(top_movers(&trends, 0).is_empty());
    }
}
