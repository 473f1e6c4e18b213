// 🔄 Exposure Pipeline - One scoring run from parsed records to a report
//
// filter quakes → resolve grids (cache-backed) → score countries → persist
// snapshot → trends against the previous snapshot → RunReport
//
// Nothing is written to history until every country has been scored.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::ops::{Bound, RangeBounds};

use crate::cache::CacheStore;
use crate::config::ExposureConfig;
use crate::entities::{Airport, AirportRegistry, Country, CountryRegistry, Earthquake};
use crate::history::{airport_key, Granularity, HistoryStore, MonthRange, Snapshot, Timeline};
use crate::scoring::{
    quakes_needing_grids, rank_scores, CountryScore, Scorer, ScoringMethod,
};
use crate::shakemap::{FallbackReason, GridCatalog, GridResolver, GridSource};
use crate::trends::{
    compute_trends, series, top_movers, EntityRef, Metric, SeriesPoint, TrendDirection, TrendEntry,
};

// ============================================================================
// INPUTS & OUTPUTS
// ============================================================================

/// Already-parsed records from the external fetchers
#[derive(Debug, Clone, Default)]
pub struct RunInputs {
    pub earthquakes: Vec<Earthquake>,
    pub airports: Vec<Airport>,
    pub countries: Vec<Country>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountryReport {
    #[serde(flatten)]
    pub score: CountryScore,
    pub trend: Option<TrendEntry>,

    /// up/down/stable/new at the configured threshold
    pub direction: Option<TrendDirection>,
    pub series: Vec<SeriesPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AirportReport {
    pub key: String,
    pub iata_code: String,
    pub name: String,
    pub country_code: String,
    pub exposure: f64,
    pub nearby_quake_count: usize,
    pub closest_quake_km: f64,
    pub max_pga_g: Option<f64>,
    pub max_mmi: Option<f64>,
    pub trend: Option<TrendEntry>,
    pub direction: Option<TrendDirection>,
    pub series: Vec<SeriesPoint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DegradedEvent {
    pub event_id: String,
    pub reason: FallbackReason,
}

/// How much of the run ran at full fidelity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fidelity {
    pub grids_parsed: usize,
    pub grid_fallbacks: usize,

    /// Quakes whose grid existed but could not be used
    pub degraded_events: Vec<DegradedEvent>,

    /// Exposure records computed with the IPE
    pub fallback_records: usize,

    pub countries_missing_metadata: Vec<String>,

    pub cache_available: bool,
    pub history_enabled: bool,
    pub history_skipped_snapshots: usize,
    pub history_write_failed: bool,
    pub history_read_failed: bool,

    pub degraded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub generated_at: DateTime<Utc>,
    pub window_start: DateTime<Utc>,
    pub granularity: Granularity,
    pub scoring_method: ScoringMethod,

    /// Id of the snapshot written for this run, if any
    pub snapshot_id: Option<String>,

    /// Highest score first
    pub countries: Vec<CountryReport>,

    /// Highest exposure first
    pub airports: Vec<AirportReport>,

    pub top_country_movers: Vec<TrendEntry>,
    pub top_airport_movers: Vec<TrendEntry>,

    pub fidelity: Fidelity,
}

// ============================================================================
// STORES
// ============================================================================

/// Cache and history handles opened from configuration
pub struct Stores {
    pub cache: CacheStore,
    pub history: Option<HistoryStore>,
}

impl Stores {
    /// The cache never fails to open (it degrades to always-miss); an
    /// unopenable history database is an error.
    pub fn open(config: &ExposureConfig) -> Result<Self> {
        let cache = CacheStore::from_settings(config.cache_enabled, config.cache_path.as_deref());
        let history = match &config.history_path {
            Some(path) => Some(HistoryStore::open(path)?),
            None => None,
        };
        Ok(Stores { cache, history })
    }

    /// Engine bound to these stores
    pub fn engine<'a>(&'a self, config: ExposureConfig) -> ExposureEngine<'a> {
        let engine = ExposureEngine::new(config, &self.cache);
        match &self.history {
            Some(history) => engine.with_history(history),
            None => engine,
        }
    }
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct ExposureEngine<'a> {
    config: ExposureConfig,
    cache: &'a CacheStore,
    history: Option<&'a HistoryStore>,
    grid_source: Option<&'a dyn GridSource>,
}

impl<'a> ExposureEngine<'a> {
    pub fn new(config: ExposureConfig, cache: &'a CacheStore) -> Self {
        ExposureEngine {
            config,
            cache,
            history: None,
            grid_source: None,
        }
    }

    pub fn with_history(mut self, history: &'a HistoryStore) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_grid_source(mut self, source: &'a dyn GridSource) -> Self {
        self.grid_source = Some(source);
        self
    }

    pub fn config(&self) -> &ExposureConfig {
        &self.config
    }

    /// Live run: quakes from the lookback window ending at `as_of`
    pub fn run(&self, inputs: &RunInputs, as_of: DateTime<Utc>) -> Result<RunReport> {
        let start = as_of - self.config.lookback();
        self.run_window(inputs, start, Bound::Included(as_of), as_of, Granularity::Daily)
    }

    /// Backfill run for one full month, stamped at the month's last second.
    /// Every event before the next month's midnight counts.
    pub fn run_month(&self, inputs: &RunInputs, month: &MonthRange) -> Result<RunReport> {
        self.run_window(
            inputs,
            month.start()?,
            Bound::Excluded(month.end_exclusive()?),
            month.snapshot_at,
            Granularity::Monthly,
        )
    }

    fn run_window(
        &self,
        inputs: &RunInputs,
        start: DateTime<Utc>,
        window_end: Bound<DateTime<Utc>>,
        end: DateTime<Utc>,
        granularity: Granularity,
    ) -> Result<RunReport> {
        self.config.validate()?;

        if inputs.airports.is_empty() {
            bail!("No airport reference data: cannot determine which airports to evaluate");
        }
        if inputs.countries.is_empty() {
            bail!("No country reference data: cannot label scored countries");
        }

        let airports = AirportRegistry::new(inputs.airports.clone())
            .filtered_by_type(&self.config.airport_type);
        let countries = CountryRegistry::new(inputs.countries.clone());
        info!(
            "Run {} → {}: {} {} airports, {} countries, {} quakes",
            start.format("%Y-%m-%d"),
            end.format("%Y-%m-%d"),
            airports.count(),
            self.config.airport_type,
            countries.count(),
            inputs.earthquakes.len()
        );

        let qualifying = self.qualifying_countries(&inputs.earthquakes, start, window_end);
        let grids = self.resolve_grids(&qualifying, &airports);
        let scorer = Scorer::new(self.config.scoring_method, &grids);

        let mut fidelity = Fidelity {
            grids_parsed: grids.parsed_count(),
            grid_fallbacks: grids.fallback_count(),
            degraded_events: grids
                .degraded_events()
                .into_iter()
                .map(|(event_id, reason)| DegradedEvent { event_id, reason })
                .collect(),
            cache_available: !self.cache.is_enabled() || self.cache.is_available(),
            history_enabled: self.history.is_some(),
            ..Fidelity::default()
        };

        let mut scores = Vec::new();
        for (iso, quakes) in &qualifying {
            let Some(country) = countries.get(iso) else {
                warn!("No metadata for country {}, skipping", iso);
                fidelity.countries_missing_metadata.push(iso.clone());
                continue;
            };

            let country_airports = airports.in_country(iso);
            if country_airports.is_empty() {
                debug!("{}: no {} airports", iso, self.config.airport_type);
                continue;
            }

            if let Some(score) =
                scorer.score_country(country, quakes, &country_airports, self.config.exposure_radius_km)?
            {
                scores.push(score);
            }
        }
        rank_scores(&mut scores);

        fidelity.fallback_records = scores
            .iter()
            .flat_map(|s| &s.airports)
            .map(|a| a.fallback_count())
            .sum();
        info!("Scored {} countries with {}", scores.len(), scorer.method());

        let (snapshot_id, timeline) = self.record_history(&scores, end, granularity, &mut fidelity);
        fidelity.degraded = !fidelity.degraded_events.is_empty()
            || !fidelity.cache_available
            || fidelity.history_skipped_snapshots > 0
            || fidelity.history_write_failed
            || fidelity.history_read_failed;

        Ok(self.build_report(scores, timeline, snapshot_id, start, end, granularity, fidelity))
    }

    /// Quakes in the window above the magnitude floor, grouped by country,
    /// keeping countries with enough events
    fn qualifying_countries<'q>(
        &self,
        earthquakes: &'q [Earthquake],
        start: DateTime<Utc>,
        end: Bound<DateTime<Utc>>,
    ) -> BTreeMap<String, Vec<&'q Earthquake>> {
        let window = (Bound::Included(start), end);
        let mut by_country: BTreeMap<String, Vec<&Earthquake>> = BTreeMap::new();
        let mut unattributed = 0;

        for quake in earthquakes {
            if quake.magnitude < self.config.min_magnitude || !window.contains(&quake.time) {
                continue;
            }
            match &quake.country_code {
                Some(code) if !code.is_empty() => by_country.entry(code.to_uppercase()).or_default().push(quake),
                _ => unattributed += 1,
            }
        }

        if unattributed > 0 {
            debug!("{} quakes without country attribution ignored", unattributed);
        }

        by_country.retain(|_, quakes| quakes.len() >= self.config.min_quakes_per_country);
        info!(
            "{} countries with at least {} quakes",
            by_country.len(),
            self.config.min_quakes_per_country
        );
        by_country
    }

    fn resolve_grids(
        &self,
        qualifying: &BTreeMap<String, Vec<&Earthquake>>,
        airports: &AirportRegistry,
    ) -> GridCatalog {
        let source = match (self.config.scoring_method, self.grid_source) {
            (ScoringMethod::GroundMotion, Some(source)) => source,
            _ => return GridCatalog::default(),
        };

        let mut wanted: Vec<&Earthquake> = Vec::new();
        for (iso, quakes) in qualifying {
            let country_airports = airports.in_country(iso);
            wanted.extend(quakes_needing_grids(quakes, &country_airports, self.config.exposure_radius_km));
        }
        if wanted.is_empty() {
            return GridCatalog::default();
        }

        debug!("Resolving {} ground-motion grids", wanted.len());
        GridResolver::new(source, self.cache)
            .with_ttl(self.config.grid_cache_ttl())
            .with_max_parallel(self.config.max_parallel_fetches)
            .resolve_all(&wanted)
    }

    /// Append the snapshot, then load the timeline it belongs to. A snapshot
    /// that could not be stored is still the latest entry of the timeline,
    /// so trends always describe this run. History problems degrade the
    /// report, they never fail the run.
    fn record_history(
        &self,
        scores: &[CountryScore],
        stamp: DateTime<Utc>,
        granularity: Granularity,
        fidelity: &mut Fidelity,
    ) -> (Option<String>, Option<Timeline>) {
        let Some(history) = self.history else {
            return (None, None);
        };

        let snapshot = Snapshot::from_scores(scores, stamp, granularity, self.config.scoring_method);
        let unstored = match history.append(&snapshot) {
            Ok(_) => None,
            Err(e) => {
                warn!("Snapshot not stored: {:#}", e);
                fidelity.history_write_failed = true;
                Some(snapshot.clone())
            }
        };
        let snapshot_id = unstored.is_none().then(|| snapshot.snapshot_id.clone());

        match history.load_timeline(None) {
            Ok(timeline) => {
                fidelity.history_skipped_snapshots = timeline.skipped;
                let timeline = match unstored {
                    Some(snapshot) => timeline.with_snapshot(snapshot),
                    None => timeline,
                };
                let timeline = timeline.until(stamp).keep_recent(self.config.history_window);
                (snapshot_id, Some(timeline))
            }
            Err(e) => {
                warn!("History unreadable, trends unavailable: {:#}", e);
                fidelity.history_read_failed = true;
                (snapshot_id, None)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_report(
        &self,
        scores: Vec<CountryScore>,
        timeline: Option<Timeline>,
        snapshot_id: Option<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        granularity: Granularity,
        fidelity: Fidelity,
    ) -> RunReport {
        let (country_trends, airport_trends) = match &timeline {
            Some(t) => (compute_trends(t, Metric::Score), compute_trends(t, Metric::Exposure)),
            None => (Vec::new(), Vec::new()),
        };
        let country_index: HashMap<&str, &TrendEntry> =
            country_trends.iter().map(|e| (e.entity.id.as_str(), e)).collect();
        let airport_index: HashMap<&str, &TrendEntry> =
            airport_trends.iter().map(|e| (e.entity.id.as_str(), e)).collect();

        let threshold = self.config.trend_threshold;
        let series_for = |entity: &EntityRef, metric: Metric| {
            timeline
                .as_ref()
                .map(|t| series(t, entity, metric))
                .unwrap_or_default()
        };

        let mut airports: Vec<AirportReport> = scores
            .iter()
            .flat_map(|s| &s.airports)
            .map(|exposure| {
                let a = &exposure.airport;
                let key = airport_key(&a.iata_code, &a.country_code, &a.name);
                let trend = airport_index.get(key.as_str()).map(|e| (*e).clone());
                AirportReport {
                    direction: trend.as_ref().and_then(|t| t.direction(threshold)),
                    trend,
                    series: series_for(&EntityRef::airport(&key), Metric::Exposure),
                    key,
                    iata_code: a.iata_code.clone(),
                    name: a.name.clone(),
                    country_code: a.country_code.clone(),
                    exposure: exposure.total_exposure,
                    nearby_quake_count: exposure.nearby_quake_count(),
                    closest_quake_km: exposure.closest_quake_km,
                    max_pga_g: exposure.max_pga_g(),
                    max_mmi: exposure.max_mmi(),
                }
            })
            .collect();
        airports.sort_by(|a, b| b.exposure.total_cmp(&a.exposure).then_with(|| a.key.cmp(&b.key)));

        let countries = scores
            .into_iter()
            .map(|score| {
                let trend = country_index.get(score.iso_code.as_str()).map(|e| (*e).clone());
                CountryReport {
                    direction: trend.as_ref().and_then(|t| t.direction(threshold)),
                    trend,
                    series: series_for(&EntityRef::country(&score.iso_code), Metric::Score),
                    score,
                }
            })
            .collect();

        RunReport {
            generated_at: end,
            window_start: start,
            granularity,
            scoring_method: self.config.scoring_method,
            snapshot_id,
            countries,
            airports,
            top_country_movers: top_movers(&country_trends, self.config.top_movers),
            top_airport_movers: top_movers(&airport_trends, self.config.top_movers),
            fidelity,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
