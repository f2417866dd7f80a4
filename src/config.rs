use crate::errors::TallyError;
use serde::Deserialize;
use std::path::Path;
use std::{env, fs};

/// Recognized configuration for the counter core, all with defaults.
///
/// The embedding process can build this directly or load it from YAML via
/// [`CounterConfig::load`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CounterConfig {
    pub batch: BatchConfig,
    pub fallback: FallbackConfig,
    pub scheduler: SchedulerConfig,
}

/// Batch writer tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Flush as soon as this many distinct counters have pending deltas.
    pub size: usize,
    /// Periodic flush interval in milliseconds.
    pub interval_ms: u64,
    /// Intake channel capacity; enqueues beyond it are dropped.
    pub queue_capacity: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size: 100,
            interval_ms: 1_000,
            queue_capacity: 200,
        }
    }
}

/// Fallback-mode switching.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Consecutive fast-store failures before flipping to fallback.
    pub threshold: u32,
    /// Recovery probe cadence in milliseconds.
    pub probe_interval_ms: u64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            threshold: 3,
            probe_interval_ms: 5_000,
        }
    }
}

/// Midnight reset scheduling.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Which wall clock defines midnight: `"local"` or an IANA zone name.
    pub timezone: String,
    /// Counter names subject to archive-and-reset each midnight.
    pub daily_counters: Vec<String>,
    /// History rows older than this many days are pruned.
    pub retention_days: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timezone: "local".to_string(),
            daily_counters: Vec::new(),
            retention_days: 7,
        }
    }
}

impl CounterConfig {
    /// Load configuration from the YAML file named by `TALLY_CONFIG_PATH`
    /// (falling back to `./tally.yaml`). A missing file yields the defaults.
    pub fn load() -> Result<Self, TallyError> {
        let path = env::var("TALLY_CONFIG_PATH").unwrap_or_else(|_| "./tally.yaml".to_string());
        if !Path::new(&path).exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&path)
            .map_err(|e| TallyError::Config(format!("failed to read {path}: {e}")))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| TallyError::Config(format!("failed to parse {path}: {e}")))
    }
}
