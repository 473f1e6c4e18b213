// Seismic Exposure Engine - Core Library
// Scores airport and country exposure to recent earthquakes and tracks how it
// changes between runs. Fetchers, CLI, server and exporters live outside.

pub mod geo;
pub mod entities;
pub mod cache;          // TTL cache (SQLite)
pub mod shakemap;       // Ground-motion grids + IPE fallback
pub mod scoring;
pub mod history;        // Snapshot timeline
pub mod trends;
pub mod config;
pub mod reference;      // CSV reference loaders
pub mod logging;
pub mod pipeline;

// Re-export commonly used types
pub use geo::{distance_km, felt_radius_at_depth_km, felt_radius_km, Coordinate};
pub use entities::{
    Airport, AirportRegistry, AirportType, AlertLevel,
    Country, CountryRegistry, Earthquake,
};
pub use cache::{CacheKey, CacheStore};
pub use shakemap::{
    EstimateSource, FallbackReason, GridCatalog, GridPayload, GridResolver,
    GridSource, GridState, GroundMotionEstimate, GroundMotionGrid, InMemoryGridSource,
};
pub use scoring::{
    AirportExposure, CountryScore, ExposureRecord, Scorer, ScoringMethod,
};
pub use history::{
    Granularity, HistoryStore, MonthRange, Snapshot, Timeline, month_ranges,
};
pub use trends::{
    EntityKind, EntityRef, Metric, SeriesPoint, TrendDirection, TrendEntry, TrendStatus,
    compute_trends, series, top_movers,
};
pub use config::ExposureConfig;
pub use pipeline::{ExposureEngine, Fidelity, RunInputs, RunReport, Stores};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
