// 📈 ShakeMap Grids - Ground-motion lookup with an IPE fallback
//
// Every earthquake walks an explicit state machine:
//
//   NoGrid ──(has grid ref)──► Fetching ──(decoded)──► Parsed ──(query inside)──► Interpolated
//     │                           │                      │
//     └──(no grid ref)──► Fallback ◄──(fetch/parse fail)─┴──(query outside)──► Fallback
//
// Fallback is an ordinary state: it carries the reason and the caller gets an
// intensity-prediction-equation estimate instead of a grid sample.

use anyhow::{bail, Context, Result};
use chrono::Duration;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::cache::{grid_ttl, CacheKey, CacheStore};
use crate::entities::Earthquake;
use crate::geo::Coordinate;

/// Standard gravity in cm/s² (PGA unit conversion)
const GRAVITY_CM_S2: f64 = 980.665;

/// Tolerance for snapping a fractional grid index onto a node
const NODE_SNAP_EPSILON: f64 = 1e-9;

/// Concurrent grid fetches per batch unless configured otherwise
pub const DEFAULT_MAX_PARALLEL_FETCHES: usize = 8;

// ============================================================================
// GRID
// ============================================================================

/// A decoded ground-motion field for one earthquake.
///
/// Samples are row-major. Row 0 is the northern edge (`origin_lat`), column 0
/// the western edge (`origin_lon`); rows step south by `lat_spacing`, columns
/// step east by `lon_spacing`.
#[derive(Debug, Clone, PartialEq)]
pub struct GroundMotionGrid {
    pub event_id: String,
    pub origin_lat: f64,
    pub origin_lon: f64,
    pub lat_spacing: f64,
    pub lon_spacing: f64,
    pub nlat: usize,
    pub nlon: usize,

    /// Peak ground acceleration in %g
    pub pga_pct_g: Vec<f64>,

    /// Modified Mercalli Intensity, when the product ships it
    pub mmi: Option<Vec<f64>>,
}

/// One interpolated grid value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridSample {
    pub pga_pct_g: f64,
    pub mmi: Option<f64>,
}

impl GroundMotionGrid {
    pub fn lat_max(&self) -> f64 {
        self.origin_lat
    }

    pub fn lat_min(&self) -> f64 {
        self.origin_lat - (self.nlat - 1) as f64 * self.lat_spacing
    }

    pub fn lon_min(&self) -> f64 {
        self.origin_lon
    }

    pub fn lon_max(&self) -> f64 {
        self.origin_lon + (self.nlon - 1) as f64 * self.lon_spacing
    }

    pub fn contains(&self, point: Coordinate) -> bool {
        point.lat >= self.lat_min()
            && point.lat <= self.lat_max()
            && point.lon >= self.lon_min()
            && point.lon <= self.lon_max()
    }

    /// Raw PGA sample at a node
    pub fn pga_at(&self, row: usize, col: usize) -> f64 {
        self.pga_pct_g[row * self.nlon + col]
    }

    /// Bilinear interpolation at `point`; `None` outside the bounding box.
    ///
    /// At grid nodes the weights collapse to (1, 0, 0, 0), so the node's
    /// sample comes back unchanged.
    pub fn interpolate(&self, point: Coordinate) -> Option<GridSample> {
        if !self.contains(point) {
            return None;
        }

        let col = snap_to_node((point.lon - self.origin_lon) / self.lon_spacing)
            .clamp(0.0, (self.nlon - 1) as f64);
        let row = snap_to_node((self.origin_lat - point.lat) / self.lat_spacing)
            .clamp(0.0, (self.nlat - 1) as f64);

        let c0 = col.floor() as usize;
        let r0 = row.floor() as usize;
        let c1 = (c0 + 1).min(self.nlon - 1);
        let r1 = (r0 + 1).min(self.nlat - 1);
        let dc = col - c0 as f64;
        let dr = row - r0 as f64;

        let blend = |values: &[f64]| {
            let at = |r: usize, c: usize| values[r * self.nlon + c];
            at(r0, c0) * (1.0 - dc) * (1.0 - dr)
                + at(r0, c1) * dc * (1.0 - dr)
                + at(r1, c0) * (1.0 - dc) * dr
                + at(r1, c1) * dc * dr
        };

        Some(GridSample {
            pga_pct_g: blend(self.pga_pct_g.as_slice()),
            mmi: self.mmi.as_deref().map(|mmi| blend(mmi)),
        })
    }
}

fn snap_to_node(index: f64) -> f64 {
    let nearest = index.round();
    if (index - nearest).abs() < NODE_SNAP_EPSILON {
        nearest
    } else {
        index
    }
}

// ============================================================================
// GRID PAYLOAD (wire format)
// ============================================================================

/// JSON payload delivered by the grid fetcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridPayload {
    #[serde(default)]
    pub event_id: Option<String>,
    pub origin_lat: f64,
    pub origin_lon: f64,
    pub lat_spacing: f64,
    pub lon_spacing: f64,
    pub nlat: usize,
    pub nlon: usize,

    /// "pct_g" (default) or "g"
    #[serde(default)]
    pub units: Option<String>,

    pub pga: Vec<f64>,

    #[serde(default)]
    pub mmi: Option<Vec<f64>>,
}

/// Decode and validate a grid payload
pub fn parse_grid(bytes: &[u8], event_id: &str) -> Result<GroundMotionGrid> {
    let payload: GridPayload = serde_json::from_slice(bytes)
        .with_context(|| format!("Grid payload for {} is not valid JSON", event_id))?;
    grid_from_payload(payload, event_id)
}

pub fn grid_from_payload(payload: GridPayload, event_id: &str) -> Result<GroundMotionGrid> {
    if !(payload.lat_spacing > 0.0) || !(payload.lon_spacing > 0.0) {
        bail!(
            "Grid {}: spacing must be positive (lat {}, lon {})",
            event_id,
            payload.lat_spacing,
            payload.lon_spacing
        );
    }
    if payload.nlat == 0 || payload.nlon == 0 {
        bail!("Grid {}: empty dimensions {}x{}", event_id, payload.nlat, payload.nlon);
    }

    let expected = payload
        .nlat
        .checked_mul(payload.nlon)
        .with_context(|| format!("Grid {}: dimensions overflow", event_id))?;
    if payload.pga.len() != expected {
        bail!(
            "Grid {}: expected {} PGA samples, got {}",
            event_id,
            expected,
            payload.pga.len()
        );
    }
    if let Some(mmi) = &payload.mmi {
        if mmi.len() != expected {
            bail!("Grid {}: expected {} MMI samples, got {}", event_id, expected, mmi.len());
        }
    }
    if !payload.origin_lat.is_finite() || !payload.origin_lon.is_finite() {
        bail!("Grid {}: origin is not finite", event_id);
    }
    let all_finite = payload
        .pga
        .iter()
        .chain(payload.mmi.iter().flatten())
        .all(|v| v.is_finite());
    if !all_finite {
        bail!("Grid {}: non-finite sample values", event_id);
    }

    let scale = match payload.units.as_deref().unwrap_or("pct_g") {
        "pct_g" | "%g" => 1.0,
        "g" => 100.0,
        other => bail!("Grid {}: unsupported PGA units '{}'", event_id, other),
    };

    Ok(GroundMotionGrid {
        event_id: payload.event_id.unwrap_or_else(|| event_id.to_string()),
        origin_lat: payload.origin_lat,
        origin_lon: payload.origin_lon,
        lat_spacing: payload.lat_spacing,
        lon_spacing: payload.lon_spacing,
        nlat: payload.nlat,
        nlon: payload.nlon,
        pga_pct_g: payload.pga.into_iter().map(|v| v * scale).collect(),
        mmi: payload.mmi,
    })
}

// ============================================================================
// INTENSITY PREDICTION EQUATION (fallback)
// ============================================================================

/// Atkinson & Wald (2007) intensity at `distance_km` from the epicenter.
///
/// Uses hypocentral distance `R = max(√(d² + h²), 1)` and clamps to MMI I–X.
/// Non-increasing in distance, non-decreasing in magnitude.
pub fn ipe_mmi(magnitude: f64, distance_km: f64, depth_km: f64) -> f64 {
    let depth = depth_km.max(0.0);
    let r = (distance_km * distance_km + depth * depth).sqrt().max(1.0);
    (3.70 + 1.17 * magnitude - 1.26 * r.ln() - 0.0012 * r).clamp(1.0, 10.0)
}

/// MMI → PGA (%g) via Wald et al. (1999).
///
/// `MMI = 3.66·log10(PGA) − 1.66` for MMI ≥ V and `MMI = 2.20·log10(PGA) + 1.00`
/// below, with PGA in cm/s². Strictly increasing in MMI.
pub fn mmi_to_pga_pct_g(mmi: f64) -> f64 {
    let log_pga = if mmi >= 5.0 {
        (mmi + 1.66) / 3.66
    } else {
        (mmi - 1.0) / 2.20
    };
    10f64.powf(log_pga) / GRAVITY_CM_S2 * 100.0
}

// ============================================================================
// ESTIMATES
// ============================================================================

/// Why a grid sample was not available
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    /// The event has no grid product
    NoGrid,
    /// The source errored (network, HTTP status, ...)
    FetchFailed,
    /// The payload did not decode into a valid grid
    Malformed,
    /// The query point lies outside the grid extent
    OutsideGrid,
    /// The pair is beyond the felt radius, so no lookup was attempted
    BeyondFeltRadius,
    /// Query issued while the fetch had not completed
    FetchIncomplete,
}

impl FallbackReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackReason::NoGrid => "no_grid",
            FallbackReason::FetchFailed => "fetch_failed",
            FallbackReason::Malformed => "malformed",
            FallbackReason::OutsideGrid => "outside_grid",
            FallbackReason::BeyondFeltRadius => "beyond_felt_radius",
            FallbackReason::FetchIncomplete => "fetch_incomplete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum EstimateSource {
    Interpolated,
    Fallback(FallbackReason),
}

/// Ground motion at one site for one earthquake
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroundMotionEstimate {
    pub pga_pct_g: f64,
    pub mmi: Option<f64>,
    pub source: EstimateSource,
}

impl GroundMotionEstimate {
    pub fn pga_g(&self) -> f64 {
        self.pga_pct_g / 100.0
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self.source, EstimateSource::Fallback(_))
    }
}

/// IPE-only estimate
pub fn ipe_estimate(
    magnitude: f64,
    distance_km: f64,
    depth_km: f64,
    reason: FallbackReason,
) -> GroundMotionEstimate {
    let mmi = ipe_mmi(magnitude, distance_km, depth_km);
    GroundMotionEstimate {
        pga_pct_g: mmi_to_pga_pct_g(mmi),
        mmi: Some(mmi),
        source: EstimateSource::Fallback(reason),
    }
}

// ============================================================================
// STATE MACHINE
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum GridState {
    NoGrid,
    Fetching,
    Parsed(Arc<GroundMotionGrid>),
    Interpolated(GridSample),
    Fallback(FallbackReason),
}

static NO_GRID: GridState = GridState::NoGrid;

impl GridState {
    pub fn name(&self) -> &'static str {
        match self {
            GridState::NoGrid => "no_grid",
            GridState::Fetching => "fetching",
            GridState::Parsed(_) => "parsed",
            GridState::Interpolated(_) => "interpolated",
            GridState::Fallback(_) => "fallback",
        }
    }

    /// NoGrid → Fetching when the event references a grid, else Fallback
    pub fn begin_fetch(self, earthquake: &Earthquake) -> GridState {
        match self {
            GridState::NoGrid if earthquake.has_grid() => GridState::Fetching,
            GridState::NoGrid => GridState::Fallback(FallbackReason::NoGrid),
            other => other,
        }
    }

    /// Fetching → Parsed or Fallback
    pub fn finish_fetch(self, outcome: std::result::Result<GroundMotionGrid, FallbackReason>) -> GridState {
        match self {
            GridState::Fetching => match outcome {
                Ok(grid) => GridState::Parsed(Arc::new(grid)),
                Err(reason) => GridState::Fallback(reason),
            },
            other => other,
        }
    }

    /// Query a site: Parsed → Interpolated (inside) or Fallback (outside).
    /// Every other state yields Fallback with the matching reason.
    pub fn query(&self, point: Coordinate) -> GridState {
        match self {
            GridState::Parsed(grid) => match grid.interpolate(point) {
                Some(sample) => GridState::Interpolated(sample),
                None => GridState::Fallback(FallbackReason::OutsideGrid),
            },
            GridState::Fallback(reason) => GridState::Fallback(*reason),
            GridState::Fetching => GridState::Fallback(FallbackReason::FetchIncomplete),
            GridState::NoGrid | GridState::Interpolated(_) => GridState::Fallback(FallbackReason::NoGrid),
        }
    }

    pub fn grid(&self) -> Option<&GroundMotionGrid> {
        match self {
            GridState::Parsed(grid) => Some(grid.as_ref()),
            _ => None,
        }
    }
}

/// Ground motion at `site` for `earthquake`, from its grid state.
///
/// Interpolated samples without MMI keep `mmi: None`; every fallback carries
/// the IPE intensity.
pub fn ground_motion_at(
    state: &GridState,
    earthquake: &Earthquake,
    site: Coordinate,
    distance_km: f64,
) -> GroundMotionEstimate {
    match state.query(site) {
        GridState::Interpolated(sample) => GroundMotionEstimate {
            pga_pct_g: sample.pga_pct_g,
            mmi: sample.mmi,
            source: EstimateSource::Interpolated,
        },
        GridState::Fallback(reason) => {
            ipe_estimate(earthquake.magnitude, distance_km, earthquake.depth_km, reason)
        }
        _ => ipe_estimate(
            earthquake.magnitude,
            distance_km,
            earthquake.depth_km,
            FallbackReason::NoGrid,
        ),
    }
}

// ============================================================================
// GRID SOURCE
// ============================================================================

/// External collaborator that retrieves grid payloads
pub trait GridSource: Send + Sync {
    /// Raw payload for an event. `Ok(None)` means the event has no grid.
    fn fetch_grid(&self, event_id: &str, grid_ref: &str) -> Result<Option<Vec<u8>>>;
}

/// Pre-fetched payloads keyed by event id
#[derive(Debug, Clone, Default)]
pub struct InMemoryGridSource {
    payloads: HashMap<String, Vec<u8>>,
}

impl InMemoryGridSource {
    pub fn new() -> Self {
        InMemoryGridSource::default()
    }

    pub fn insert(&mut self, event_id: &str, payload: Vec<u8>) {
        self.payloads.insert(event_id.to_string(), payload);
    }

    /// Serialize a payload struct and store it
    pub fn insert_payload(&mut self, event_id: &str, payload: &GridPayload) -> Result<()> {
        let bytes = serde_json::to_vec(payload).context("Failed to encode grid payload")?;
        self.insert(event_id, bytes);
        Ok(())
    }
}

impl GridSource for InMemoryGridSource {
    fn fetch_grid(&self, event_id: &str, _grid_ref: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.payloads.get(event_id).cloned())
    }
}

// ============================================================================
// RESOLVER
// ============================================================================

pub fn grid_cache_key(earthquake: &Earthquake) -> CacheKey {
    CacheKey::fingerprint(
        "shakemap",
        &[
            ("event", earthquake.id.as_str()),
            ("grid", earthquake.grid_ref.as_deref().unwrap_or("")),
        ],
    )
}

/// Drives earthquakes through NoGrid → Fetching → Parsed/Fallback,
/// checking the cache before the source.
pub struct GridResolver<'a> {
    source: &'a dyn GridSource,
    cache: &'a CacheStore,
    ttl: Duration,
    max_parallel: usize,
}

impl<'a> GridResolver<'a> {
    pub fn new(source: &'a dyn GridSource, cache: &'a CacheStore) -> Self {
        GridResolver {
            source,
            cache,
            ttl: grid_ttl(),
            max_parallel: DEFAULT_MAX_PARALLEL_FETCHES,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// At most `n` fetches in flight at once (minimum 1)
    pub fn with_max_parallel(mut self, n: usize) -> Self {
        self.max_parallel = n.max(1);
        self
    }

    pub fn resolve(&self, earthquake: &Earthquake) -> GridState {
        let state = GridState::NoGrid.begin_fetch(earthquake);
        if state != GridState::Fetching {
            return state;
        }

        let key = grid_cache_key(earthquake);
        if let Some(bytes) = self.cache.get(&key) {
            match parse_grid(&bytes, &earthquake.id) {
                Ok(grid) => {
                    debug!("Grid for {} served from cache", earthquake.id);
                    return state.finish_fetch(Ok(grid));
                }
                Err(e) => warn!("Cached grid for {} unusable, refetching: {:#}", earthquake.id, e),
            }
        }

        let grid_ref = earthquake.grid_ref.as_deref().unwrap_or("");
        let bytes = match self.source.fetch_grid(&earthquake.id, grid_ref) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                info!("No grid published for {}, using IPE fallback", earthquake.id);
                return state.finish_fetch(Err(FallbackReason::NoGrid));
            }
            Err(e) => {
                warn!("Grid fetch for {} failed, using IPE fallback: {:#}", earthquake.id, e);
                return state.finish_fetch(Err(FallbackReason::FetchFailed));
            }
        };

        match parse_grid(&bytes, &earthquake.id) {
            Ok(grid) => {
                if let Err(e) = self.cache.put(&key, &bytes, self.ttl) {
                    warn!("Could not cache grid for {}: {:#}", earthquake.id, e);
                }
                state.finish_fetch(Ok(grid))
            }
            Err(e) => {
                warn!("Malformed grid for {}, using IPE fallback: {:#}", earthquake.id, e);
                state.finish_fetch(Err(FallbackReason::Malformed))
            }
        }
    }

    /// Resolve a batch. Fetches run on scoped threads, at most
    /// `max_parallel` at a time; they share only the cache, which tolerates
    /// concurrent writers.
    pub fn resolve_all(&self, earthquakes: &[&Earthquake]) -> GridCatalog {
        let mut catalog = GridCatalog::default();

        for batch in earthquakes.chunks(self.max_parallel) {
            std::thread::scope(|scope| {
                let handles: Vec<_> = batch
                    .iter()
                    .map(|eq| scope.spawn(move || (eq.id.clone(), self.resolve(eq))))
                    .collect();

                for handle in handles {
                    match handle.join() {
                        Ok((id, state)) => catalog.insert(id, state),
                        Err(_) => warn!("Grid resolution thread panicked; event falls back to IPE"),
                    }
                }
            });
        }

        info!(
            "Grid resolution: {} parsed, {} fallback",
            catalog.parsed_count(),
            catalog.fallback_count()
        );
        catalog
    }
}

// ============================================================================
// CATALOG
// ============================================================================

/// Grid state per earthquake id for one run
#[derive(Debug, Clone, Default)]
pub struct GridCatalog {
    states: HashMap<String, GridState>,
}

impl GridCatalog {
    pub fn insert(&mut self, event_id: String, state: GridState) {
        self.states.insert(event_id, state);
    }

    /// Unknown events are in NoGrid
    pub fn state_for(&self, event_id: &str) -> &GridState {
        self.states.get(event_id).unwrap_or(&NO_GRID)
    }

    pub fn parsed_count(&self) -> usize {
        self.states
            .values()
            .filter(|s| matches!(s, GridState::Parsed(_)))
            .count()
    }

    pub fn fallback_count(&self) -> usize {
        self.states
            .values()
            .filter(|s| matches!(s, GridState::Fallback(_)))
            .count()
    }

    /// Events that were meant to have a grid but ended in Fallback
    pub fn degraded_events(&self) -> Vec<(String, FallbackReason)> {
        let mut degraded: Vec<_> = self
            .states
            .iter()
            .filter_map(|(id, state)| match state {
                GridState::Fallback(reason) if *reason != FallbackReason::NoGrid => {
                    Some((id.clone(), *reason))
                }
                _ => None,
            })
            .collect();
        degraded.sort_by(|a, b| a.0.cmp(&b.0));
        degraded
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

// ============================================================================
// TESTS
// ============================================================================
