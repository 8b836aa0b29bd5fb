//! Smoother configuration
//!
//! ## Configuration Resolution
//!
//! Config is loaded with a two-layer resolution:
//! 1. An explicit path, or the override in the data dir
//!    (~/.local/share/smoother/config/smoother.toml)
//! 2. Fall back to embedded defaults (compiled into binary)
//!
//! Deployment knobs can then be overridden from the environment:
//!
//! - `SMOOTHER_PARTITIONS`: Total number of queue partitions
//! - `SMOOTHER_OWNED_PARTITIONS`: Comma-separated partitions this consumer claims
//! - `SMOOTHER_CONSUMER_ID`: Lease owner name (default: `smoother-<pid>`)
//! - `SMOOTHER_POLL_TIMEOUT_MS`: Upper bound on one blocking pull

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::{Error, Result};
use crate::filter::NoiseModel;

/// Embedded default config (compiled into binary)
const DEFAULT_CONFIG: &str = include_str!("../../../config/smoother.toml");

/// What the filter treats as the observed balance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservationModel {
    /// Each signed amount on its own (the default)
    Amount,
    /// Running sum of signed amounts (ledger balance)
    Balance,
}

impl ObservationModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Amount => "amount",
            Self::Balance => "balance",
        }
    }
}

/// Filter engine tuning
#[derive(Debug, Clone, PartialEq)]
pub struct FilterConfig {
    pub prior_variance: f64,
    pub min_dt_days: f64,
    pub observation: ObservationModel,
    pub degeneracy_tolerance: f64,
    pub noise: NoiseModel,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            prior_variance: 1e6,
            min_dt_days: 1.0,
            observation: ObservationModel::Amount,
            degeneracy_tolerance: 1e-6,
            noise: NoiseModel::default(),
        }
    }
}

/// Event queue consumption
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    pub poll_timeout: Duration,
    pub poll_interval: Duration,
    pub lease: Duration,
    pub partitions: u32,
    /// Empty means every partition
    pub owned_partitions: Vec<u32>,
    pub max_deliveries: u32,
    pub consumer_id: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
            lease: Duration::from_secs(60),
            partitions: 1,
            owned_partitions: Vec::new(),
            max_deliveries: 10,
            consumer_id: default_consumer_id(),
        }
    }
}

impl QueueConfig {
    /// Partitions this consumer claims events from
    pub fn claimed_partitions(&self) -> Vec<u32> {
        if self.owned_partitions.is_empty() {
            (0..self.partitions).collect()
        } else {
            self.owned_partitions.clone()
        }
    }
}

/// Backoff for transient store failures
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based), doubling each time
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Complete smoother configuration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SmootherConfig {
    pub filter: FilterConfig,
    pub queue: QueueConfig,
    pub retry: RetryConfig,
}

impl SmootherConfig {
    /// Load from `path` (or the default override location), then apply
    /// environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = load_config(path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML content on top of the defaults
    pub fn parse(content: &str) -> Result<Self> {
        parse_config(content)
    }

    /// Apply `SMOOTHER_*` overrides from a variable lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SMOOTHER_PARTITIONS") {
            self.queue.partitions = v
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("SMOOTHER_PARTITIONS is not a number: {}", v)))?;
        }
        if let Some(v) = lookup("SMOOTHER_OWNED_PARTITIONS") {
            self.queue.owned_partitions = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    s.parse().map_err(|_| {
                        Error::Config(format!("SMOOTHER_OWNED_PARTITIONS has a bad entry: {}", s))
                    })
                })
                .collect::<Result<Vec<u32>>>()?;
        }
        if let Some(v) = lookup("SMOOTHER_CONSUMER_ID") {
            if v.trim().is_empty() {
                warn!("SMOOTHER_CONSUMER_ID is empty, keeping {}", self.queue.consumer_id);
            } else {
                self.queue.consumer_id = v.trim().to_string();
            }
        }
        if let Some(v) = lookup("SMOOTHER_POLL_TIMEOUT_MS") {
            let ms: u64 = v.trim().parse().map_err(|_| {
                Error::Config(format!("SMOOTHER_POLL_TIMEOUT_MS is not a number: {}", v))
            })?;
            self.queue.poll_timeout = Duration::from_millis(ms);
        }
        Ok(())
    }

    /// Reject settings that would break the filter's invariants or the queue contract
    pub fn validate(&self) -> Result<()> {
        let f = &self.filter;
        if !(f.min_dt_days > 0.0 && f.min_dt_days.is_finite()) {
            return Err(Error::Config(format!(
                "filter.min_dt_days must be positive, got {}",
                f.min_dt_days
            )));
        }
        if !(f.prior_variance > 0.0 && f.prior_variance.is_finite()) {
            return Err(Error::Config(format!(
                "filter.prior_variance must be positive, got {}",
                f.prior_variance
            )));
        }
        if !(f.degeneracy_tolerance >= 0.0) {
            return Err(Error::Config(
                "filter.degeneracy_tolerance must not be negative".to_string(),
            ));
        }
        if !(f.noise.process_floor > 0.0) {
            return Err(Error::Config(
                "filter.process_noise.floor must be positive".to_string(),
            ));
        }
        if !(f.noise.measurement_floor > 0.0) {
            return Err(Error::Config(
                "filter.measurement_noise.floor must be positive".to_string(),
            ));
        }
        let n = &f.noise;
        let coefficients = [
            n.process_base,
            n.process_per_unit,
            n.process_floor,
            n.measurement_base,
            n.measurement_per_unit,
            n.measurement_floor,
        ];
        if !coefficients.iter().all(|c| c.is_finite()) {
            return Err(Error::Config(
                "noise coefficients must be finite".to_string(),
            ));
        }
        if f.noise.process_per_unit < 0.0 || f.noise.measurement_per_unit < 0.0 {
            return Err(Error::Config(
                "noise per_unit coefficients must not be negative".to_string(),
            ));
        }

        let q = &self.queue;
        if q.partitions == 0 {
            return Err(Error::Config("queue.partitions must be at least 1".to_string()));
        }
        if let Some(p) = q.owned_partitions.iter().find(|p| **p >= q.partitions) {
            return Err(Error::Config(format!(
                "owned partition {} is out of range (partitions = {})",
                p, q.partitions
            )));
        }
        if q.max_deliveries == 0 {
            return Err(Error::Config("queue.max_deliveries must be at least 1".to_string()));
        }
        if q.poll_timeout.is_zero() {
            return Err(Error::Config("queue.poll_timeout_ms must be positive".to_string()));
        }

        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".to_string()));
        }

        Ok(())
    }
}

fn default_consumer_id() -> String {
    format!("smoother-{}", std::process::id())
}

/// Default config override path
pub fn default_config_path() -> Option<PathBuf> {
    dirs::data_local_dir().map(|d| d.join("smoother").join("config").join("smoother.toml"))
}

/// Load configuration (override first, then default)
fn load_config(override_path: Option<&Path>) -> Result<SmootherConfig> {
    let content = match override_path {
        Some(path) => fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?,
        None => match default_config_path() {
            Some(default_path) if default_path.exists() => fs::read_to_string(&default_path)
                .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?,
            _ => DEFAULT_CONFIG.to_string(),
        },
    };

    parse_config(&content)
}

/// Raw config structure for TOML parsing
#[derive(Debug, Deserialize)]
struct RawConfig {
    filter: Option<RawFilter>,
    queue: Option<RawQueue>,
    retry: Option<RawRetry>,
}

#[derive(Debug, Deserialize)]
struct RawFilter {
    prior_variance: Option<f64>,
    min_dt_days: Option<f64>,
    observation: Option<ObservationModel>,
    degeneracy_tolerance: Option<f64>,
    process_noise: Option<RawNoise>,
    measurement_noise: Option<RawNoise>,
}

#[derive(Debug, Deserialize)]
struct RawNoise {
    base: Option<f64>,
    per_unit: Option<f64>,
    floor: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawQueue {
    poll_timeout_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
    lease_secs: Option<u64>,
    partitions: Option<u32>,
    owned_partitions: Option<Vec<u32>>,
    max_deliveries: Option<u32>,
    consumer_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRetry {
    max_attempts: Option<u32>,
    initial_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
}

/// Parse config from TOML content
fn parse_config(content: &str) -> Result<SmootherConfig> {
    let raw: RawConfig = toml::from_str(content)
        .map_err(|e| Error::Config(format!("Invalid config TOML: {}", e)))?;

    let mut config = SmootherConfig::default();

    if let Some(filter) = raw.filter {
        let f = &mut config.filter;
        if let Some(v) = filter.prior_variance {
            f.prior_variance = v;
        }
        if let Some(v) = filter.min_dt_days {
            f.min_dt_days = v;
        }
        if let Some(v) = filter.observation {
            f.observation = v;
        }
        if let Some(v) = filter.degeneracy_tolerance {
            f.degeneracy_tolerance = v;
        }
        if let Some(noise) = filter.process_noise {
            f.noise.process_base = noise.base.unwrap_or(f.noise.process_base);
            f.noise.process_per_unit = noise.per_unit.unwrap_or(f.noise.process_per_unit);
            f.noise.process_floor = noise.floor.unwrap_or(f.noise.process_floor);
        }
        if let Some(noise) = filter.measurement_noise {
            f.noise.measurement_base = noise.base.unwrap_or(f.noise.measurement_base);
            f.noise.measurement_per_unit =
                noise.per_unit.unwrap_or(f.noise.measurement_per_unit);
            f.noise.measurement_floor = noise.floor.unwrap_or(f.noise.measurement_floor);
        }
    }

    if let Some(queue) = raw.queue {
        let q = &mut config.queue;
        if let Some(ms) = queue.poll_timeout_ms {
            q.poll_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = queue.poll_interval_ms {
            q.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = queue.lease_secs {
            q.lease = Duration::from_secs(secs);
        }
        if let Some(v) = queue.partitions {
            q.partitions = v;
        }
        if let Some(v) = queue.owned_partitions {
            q.owned_partitions = v;
        }
        if let Some(v) = queue.max_deliveries {
            q.max_deliveries = v;
        }
        if let Some(v) = queue.consumer_id {
            q.consumer_id = v;
        }
    }

    if let Some(retry) = raw.retry {
        let r = &mut config.retry;
        if let Some(v) = retry.max_attempts {
            r.max_attempts = v;
        }
        if let Some(ms) = retry.initial_backoff_ms {
            r.initial_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = retry.max_backoff_ms {
            r.max_backoff = Duration::from_millis(ms);
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_parse_default_config() {
        let config = parse_config(DEFAULT_CONFIG).unwrap();
        assert_eq!(config.filter.prior_variance, 1e6);
        assert_eq!(config.filter.min_dt_days, 1.0);
        assert_eq!(config.filter.observation, ObservationModel::Amount);
        assert_eq!(config.filter, FilterConfig::default());
        assert_eq!(config.filter.noise, NoiseModel::default());
        assert_eq!(config.queue.poll_timeout, Duration::from_secs(5));
        assert_eq!(config.queue.partitions, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_override_keeps_defaults() {
        let config = parse_config(
            r#"
            [filter]
            observation = "balance"

            [filter.measurement_noise]
            per_unit = 0.25

            [queue]
            partitions = 4
            owned_partitions = [1, 3]
            "#,
        )
        .unwrap();

        assert_eq!(config.filter.observation, ObservationModel::Balance);
        assert_eq!(config.filter.noise.measurement_per_unit, 0.25);
        assert_eq!(config.filter.noise.measurement_base, 1.0);
        assert_eq!(config.filter.noise.process_per_unit, 0.1);
        assert_eq!(config.queue.claimed_partitions(), vec![1, 3]);
        assert_eq!(config.retry.max_attempts, 5);
    }

    #[test]
    fn test_invalid_toml_rejected() {
        assert!(matches!(
            parse_config("[filter\nmin_dt_days = "),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            parse_config("[filter]\nobservation = \"velocity\""),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_validation() {
        let mut config = SmootherConfig::default();
        config.filter.min_dt_days = 0.0;
        assert!(config.validate().is_err());

        let mut config = SmootherConfig::default();
        config.filter.noise.measurement_floor = 0.0;
        assert!(config.validate().is_err());

        let mut config = SmootherConfig::default();
        config.filter.noise.process_floor = f64::INFINITY;
        assert!(config.validate().is_err());

        let mut config = SmootherConfig::default();
        config.queue.partitions = 2;
        config.queue.owned_partitions = vec![2];
        assert!(config.validate().is_err());

        let mut config = SmootherConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = SmootherConfig::default();
        config
            .apply_overrides(lookup(&[
                ("SMOOTHER_PARTITIONS", "8"),
                ("SMOOTHER_OWNED_PARTITIONS", "0, 5,7"),
                ("SMOOTHER_CONSUMER_ID", "worker-a"),
                ("SMOOTHER_POLL_TIMEOUT_MS", "250"),
            ]))
            .unwrap();

        assert_eq!(config.queue.partitions, 8);
        assert_eq!(config.queue.owned_partitions, vec![0, 5, 7]);
        assert_eq!(config.queue.consumer_id, "worker-a");
        assert_eq!(config.queue.poll_timeout, Duration::from_millis(250));
        assert!(config.validate().is_ok());

        let mut config = SmootherConfig::default();
        assert!(config
            .apply_overrides(lookup(&[("SMOOTHER_PARTITIONS", "many")]))
            .is_err());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let retry = RetryConfig {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(700),
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(3), Duration::from_millis(400));
        assert_eq!(retry.backoff(4), Duration::from_millis(700));
        assert_eq!(retry.backoff(40), Duration::from_millis(700));
    }

    #[test]
    fn test_load_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("smoother.toml");
        fs::write(&path, "[filter]\nmin_dt_days = 0.5\n").unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.filter.min_dt_days, 0.5);

        assert!(load_config(Some(&dir.path().join("missing.toml"))).is_err());
    }
}
