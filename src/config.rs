// ⚙️ Configuration - Run settings for the exposure engine
//
// Sources, lowest precedence first: defaults, JSON file, SEISMIC_RISK_* env vars.

use anyhow::{bail, Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::scoring::ScoringMethod;
use crate::shakemap::DEFAULT_MAX_PARALLEL_FETCHES;
use crate::trends::DEFAULT_TREND_THRESHOLD;

/// Prefix of every environment override
pub const ENV_PREFIX: &str = "SEISMIC_RISK_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExposureConfig {
    /// Ignore quakes below this magnitude
    pub min_magnitude: f64,

    /// Only quakes from the last N days (relative to the run time)
    pub lookback_days: u32,

    /// Countries need at least this many quakes to be scored
    pub min_quakes_per_country: usize,

    pub exposure_radius_km: f64,

    /// OurAirports classification to keep
    pub airport_type: String,

    pub scoring_method: ScoringMethod,

    pub cache_enabled: bool,
    pub cache_path: Option<PathBuf>,
    pub grid_cache_ttl_secs: i64,

    /// Upper bound on concurrent grid fetches
    pub max_parallel_fetches: usize,

    /// Enables snapshots and trends when set
    pub history_path: Option<PathBuf>,

    /// Most recent snapshots considered for trends and series
    pub history_window: usize,

    pub top_movers: usize,
    pub trend_threshold: f64,
}

impl Default for ExposureConfig {
    fn default() -> Self {
        ExposureConfig {
            min_magnitude: 5.0,
            lookback_days: 30,
            min_quakes_per_country: 3,
            exposure_radius_km: 200.0,
            airport_type: "large_airport".to_string(),
            scoring_method: ScoringMethod::GroundMotion,
            cache_enabled: true,
            cache_path: None,
            grid_cache_ttl_secs: 24 * 60 * 60,
            max_parallel_fetches: DEFAULT_MAX_PARALLEL_FETCHES,
            history_path: None,
            history_window: 90,
            top_movers: 10,
            trend_threshold: DEFAULT_TREND_THRESHOLD,
        }
    }
}

impl ExposureConfig {
    /// Load from a JSON file; missing fields keep their defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: ExposureConfig =
            serde_json::from_str(&content).context("Failed to parse config JSON")?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `SEISMIC_RISK_*` variables from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(std::env::vars())
    }

    /// Apply `SEISMIC_RISK_*` overrides from any (name, value) source.
    /// Unrelated names are ignored; unparseable values are errors.
    pub fn apply_overrides<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in vars {
            let Some(key) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.trim();

            match key {
                "MIN_MAGNITUDE" => self.min_magnitude = parse_value(&name, value)?,
                "LOOKBACK_DAYS" => self.lookback_days = parse_value(&name, value)?,
                "MIN_QUAKES" => self.min_quakes_per_country = parse_value(&name, value)?,
                "RADIUS_KM" => self.exposure_radius_km = parse_value(&name, value)?,
                "AIRPORT_TYPE" => self.airport_type = value.to_string(),
                "SCORING_METHOD" => self.scoring_method = ScoringMethod::parse(value)?,
                "CACHE_ENABLED" => self.cache_enabled = parse_flag(&name, value)?,
                "CACHE_PATH" => self.cache_path = non_empty_path(value),
                "GRID_CACHE_TTL_SECS" => self.grid_cache_ttl_secs = parse_value(&name, value)?,
                "MAX_PARALLEL_FETCHES" => self.max_parallel_fetches = parse_value(&name, value)?,
                "HISTORY_PATH" => self.history_path = non_empty_path(value),
                "HISTORY_WINDOW" => self.history_window = parse_value(&name, value)?,
                "TOP_MOVERS" => self.top_movers = parse_value(&name, value)?,
                "TREND_THRESHOLD" => self.trend_threshold = parse_value(&name, value)?,
                _ => {}
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=10.0).contains(&self.min_magnitude) {
            bail!("min_magnitude must be between 0 and 10, got {}", self.min_magnitude);
        }
        if !(1..=365).contains(&self.lookback_days) {
            bail!("lookback_days must be between 1 and 365, got {}", self.lookback_days);
        }
        if self.min_quakes_per_country < 1 {
            bail!("min_quakes_per_country must be at least 1");
        }
        if !(self.exposure_radius_km > 0.0) || !self.exposure_radius_km.is_finite() {
            bail!("exposure_radius_km must be positive, got {}", self.exposure_radius_km);
        }
        if self.airport_type.trim().is_empty() {
            bail!("airport_type must not be empty");
        }
        if self.grid_cache_ttl_secs <= 0 {
            bail!("grid_cache_ttl_secs must be positive, got {}", self.grid_cache_ttl_secs);
        }
        if self.max_parallel_fetches < 1 {
            bail!("max_parallel_fetches must be at least 1");
        }
        if self.history_window < 2 {
            bail!("history_window must keep at least 2 snapshots, got {}", self.history_window);
        }
        if !(self.trend_threshold >= 0.0) {
            bail!("trend_threshold must be non-negative, got {}", self.trend_threshold);
        }
        Ok(())
    }

    pub fn grid_cache_ttl(&self) -> Duration {
        Duration::seconds(self.grid_cache_ttl_secs)
    }

    pub fn lookback(&self) -> Duration {
        Duration::days(self.lookback_days as i64)
    }
}

fn parse_value<T>(name: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|e| anyhow::anyhow!("Invalid value '{}' for {}: {}", value, name, e))
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("Invalid boolean '{}' for {}", other, name),
    }
}

fn non_empty_path(value: &str) -> Option<PathBuf> {
    (!value.is_empty()).then(|| PathBuf::from(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = ExposureConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scoring_method, ScoringMethod::GroundMotion);
        assert_eq!(config.grid_cache_ttl(), Duration::hours(24));
    }

    #[test]
    fn test_from_file_partial() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"min_magnitude": 6.0, "scoring_method": "legacy"}}"#).unwrap();

        let config = ExposureConfig::from_file(file.path()).unwrap();
        assert_eq!(config.min_magnitude, 6.0);
        assert_eq!(config.scoring_method, ScoringMethod::Legacy);
        assert_eq!(config.lookback_days, 30);
    }

    #[test]
    fn test_from_file_rejects_invalid() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"lookback_days": 0}}"#).unwrap();
        assert!(ExposureConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_overrides() {
        let mut config = ExposureConfig::default();
        config
            .apply_overrides(vars(&[
                ("SEISMIC_RISK_MIN_MAGNITUDE", "4.5"),
                ("SEISMIC_RISK_SCORING_METHOD", "shakemap"),
                ("SEISMIC_RISK_CACHE_ENABLED", "off"),
                ("SEISMIC_RISK_HISTORY_PATH", "/tmp/history.db"),
                ("SEISMIC_RISK_MAX_PARALLEL_FETCHES", "2"),
                ("PATH", "/usr/bin"),
            ]))
            .unwrap();

        assert_eq!(config.min_magnitude, 4.5);
        assert_eq!(config.scoring_method, ScoringMethod::GroundMotion);
        assert!(!config.cache_enabled);
        assert_eq!(config.history_path, Some(PathBuf::from("/tmp/history.db")));
        assert_eq!(config.max_parallel_fetches, 2);
    }

    #[test]
    fn test_bad_override_is_error() {
        let mut config = ExposureConfig::default();
        assert!(config
            .apply_overrides(vars(&[("SEISMIC_RISK_RADIUS_KM", "far")]))
            .is_err());
        assert!(config
            .apply_overrides(vars(&[("SEISMIC_RISK_SCORING_METHOD", "dice")]))
            .is_err());
    }

    #[test]
    fn test_validate_ranges() {
        let mut config = ExposureConfig::default();
        config.exposure_radius_km = 0.0;
        assert!(config.validate().is_err());

        let mut config = ExposureConfig::default();
        config.min_magnitude = 11.0;
        assert!(config.validate().is_err());

        let mut config = ExposureConfig::default();
        config.min_quakes_per_country = 0;
        assert!(config.validate().is_err());

        let mut config = ExposureConfig::default();
        config.max_parallel_fetches = 0;
        assert!(config.validate().is_err());
    }
}
