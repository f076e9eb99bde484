use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::bus::EventType;
use crate::error::PipelineError;

pub const ENV_PREFIX: &str = "SESSION_TELEMETRY_";

pub const DEFAULT_WINDOW_MS: u64 = 100;
pub const DEFAULT_MAX_BATCH_SIZE: usize = 50;
pub const DEFAULT_BURST_THRESHOLD: usize = 10;
pub const DEFAULT_BURST_INTERVAL_MS: u64 = 100;
pub const DEFAULT_HIGH_WATER_MARK: usize = 100;

/// Tuning knobs for [`crate::bus::EventBatcher`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatcherConfig {
    /// Accumulation window before a timeout flush.
    #[serde(default = "default_window_ms", alias = "windowMs")]
    pub window_ms: u64,
    #[serde(default = "default_max_batch_size", alias = "maxBatchSize")]
    pub max_batch_size: usize,
    /// Stable-sort each batch by timestamp before delivery.
    #[serde(default = "default_true", alias = "preserveOrder")]
    pub preserve_order: bool,
    /// Arm the window timer. When off, only size/burst/priority/manual flush.
    #[serde(default = "default_true", alias = "flushOnIdle")]
    pub flush_on_idle: bool,
    /// Arrivals within `burst_interval_ms` above this count force a flush.
    #[serde(default = "default_burst_threshold", alias = "burstThreshold")]
    pub burst_threshold: usize,
    #[serde(default = "default_burst_interval_ms", alias = "burstIntervalMs")]
    pub burst_interval_ms: u64,
    /// Undelivered event count above which the batcher reports unhealthy.
    #[serde(default = "default_high_water_mark", alias = "highWaterMark")]
    pub high_water_mark: usize,
    /// Event kinds delivered without waiting for the window.
    #[serde(default, alias = "priorityTypes")]
    pub priority_types: Vec<EventType>,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            window_ms: DEFAULT_WINDOW_MS,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            preserve_order: true,
            flush_on_idle: true,
            burst_threshold: DEFAULT_BURST_THRESHOLD,
            burst_interval_ms: DEFAULT_BURST_INTERVAL_MS,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            priority_types: Vec::new(),
        }
    }
}

/// Partial update for [`BatcherConfig`]. `None` keeps the current value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatcherConfigPatch {
    #[serde(default, alias = "windowMs")]
    pub window_ms: Option<u64>,
    #[serde(default, alias = "maxBatchSize")]
    pub max_batch_size: Option<usize>,
    #[serde(default, alias = "preserveOrder")]
    pub preserve_order: Option<bool>,
    #[serde(default, alias = "flushOnIdle")]
    pub flush_on_idle: Option<bool>,
    #[serde(default, alias = "burstThreshold")]
    pub burst_threshold: Option<usize>,
    #[serde(default, alias = "burstIntervalMs")]
    pub burst_interval_ms: Option<u64>,
    #[serde(default, alias = "highWaterMark")]
    pub high_water_mark: Option<usize>,
    #[serde(default, alias = "priorityTypes")]
    pub priority_types: Option<Vec<EventType>>,
}

impl BatcherConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.window_ms == 0 {
            return Err(PipelineError::InvalidConfig(
                "window_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_batch_size == 0 {
            return Err(PipelineError::InvalidConfig(
                "max_batch_size must be greater than zero".to_string(),
            ));
        }
        if self.burst_threshold == 0 {
            return Err(PipelineError::InvalidConfig(
                "burst_threshold must be greater than zero".to_string(),
            ));
        }
        if self.burst_interval_ms == 0 {
            return Err(PipelineError::InvalidConfig(
                "burst_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Shallow merge. The result is validated before it is returned.
    pub fn merged(&self, patch: &BatcherConfigPatch) -> Result<Self, PipelineError> {
        let merged = Self {
            window_ms: patch.window_ms.unwrap_or(self.window_ms),
            max_batch_size: patch.max_batch_size.unwrap_or(self.max_batch_size),
            preserve_order: patch.preserve_order.unwrap_or(self.preserve_order),
            flush_on_idle: patch.flush_on_idle.unwrap_or(self.flush_on_idle),
            burst_threshold: patch.burst_threshold.unwrap_or(self.burst_threshold),
            burst_interval_ms: patch.burst_interval_ms.unwrap_or(self.burst_interval_ms),
            high_water_mark: patch.high_water_mark.unwrap_or(self.high_water_mark),
            priority_types: patch
                .priority_types
                .clone()
                .unwrap_or_else(|| self.priority_types.clone()),
        };
        merged.validate()?;
        Ok(merged)
    }

    /// Defaults overridden by `SESSION_TELEMETRY_*` environment variables.
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        let patch = BatcherConfigPatch {
            window_ms: env_value("WINDOW_MS"),
            max_batch_size: env_value("MAX_BATCH_SIZE"),
            preserve_order: env_value("PRESERVE_ORDER"),
            flush_on_idle: env_value("FLUSH_ON_IDLE"),
            burst_threshold: env_value("BURST_THRESHOLD"),
            burst_interval_ms: env_value("BURST_INTERVAL_MS"),
            high_water_mark: env_value("HIGH_WATER_MARK"),
            priority_types: env_priority_types(),
        };
        let defaults = Self::default();
        match defaults.merged(&patch) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("ignoring environment batcher config: {e}");
                defaults
            }
        }
    }
}

fn env_value<T: FromStr>(name: &str) -> Option<T> {
    let key = format!("{ENV_PREFIX}{name}");
    let raw = std::env::var(&key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("ignoring unparseable {key}={raw}");
            None
        }
    }
}

fn env_priority_types() -> Option<Vec<EventType>> {
    let key = format!("{ENV_PREFIX}PRIORITY_TYPES");
    let raw = std::env::var(&key).ok()?;
    let mut types = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.parse::<EventType>() {
            Ok(kind) => types.push(kind),
            Err(e) => tracing::warn!("{key}: {e}"),
        }
    }
    Some(types)
}

fn default_window_ms() -> u64 {
    DEFAULT_WINDOW_MS
}

fn default_max_batch_size() -> usize {
    DEFAULT_MAX_BATCH_SIZE
}

fn default_true() -> bool {
    true
}

fn default_burst_threshold() -> usize {
    DEFAULT_BURST_THRESHOLD
}

fn default_burst_interval_ms() -> u64 {
    DEFAULT_BURST_INTERVAL_MS
}

fn default_high_water_mark() -> usize {
    DEFAULT_HIGH_WATER_MARK
}
