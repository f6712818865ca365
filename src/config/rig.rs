//! Rig configuration: worker devices, assignment policy and timing.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::error::AutopatchError;
use crate::core::geometry::{Point2, Region};
use crate::core::strategy::{CLOSEST_FIRST, DEFAULT_STRATEGY, FAIR_BY_REGION};

/// Environment variable naming a JSON configuration file.
pub const CONFIG_ENV: &str = "AUTOPATCH_CONFIG";

/// One worker device (actuator) and the area it may work in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Unique device name.
    pub name: String,
    /// Reachable regions, in preference order.
    pub regions: Vec<Region>,
    /// Center of the device's view for distance-based strategies.
    #[serde(default)]
    pub view_center: Point2,
}

/// Poll intervals and bounds used by worker loops and tasks, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Sleep while the device is unavailable.
    pub unavailable_poll_ms: u64,
    /// Sleep after `request_job` found nothing.
    pub empty_queue_backoff_ms: u64,
    /// Slice used by every cancellable wait.
    pub poll_slice_ms: u64,
    /// Default bound for lock acquisition.
    pub lock_timeout_ms: u64,
    /// Default bound for waiting on pending operations.
    pub wait_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            unavailable_poll_ms: 500,
            empty_queue_backoff_ms: 3000,
            poll_slice_ms: 200,
            lock_timeout_ms: 20_000,
            wait_timeout_ms: 20_000,
        }
    }
}

impl TimingConfig {
    /// Short intervals for tests and simulations.
    #[must_use]
    pub const fn fast() -> Self {
        Self {
            unavailable_poll_ms: 5,
            empty_queue_backoff_ms: 10,
            poll_slice_ms: 5,
            lock_timeout_ms: 2_000,
            wait_timeout_ms: 2_000,
        }
    }

    /// [`unavailable_poll_ms`](Self::unavailable_poll_ms) as a duration.
    #[must_use]
    pub const fn unavailable_poll(&self) -> Duration {
        Duration::from_millis(self.unavailable_poll_ms)
    }

    /// [`empty_queue_backoff_ms`](Self::empty_queue_backoff_ms) as a duration.
    #[must_use]
    pub const fn empty_queue_backoff(&self) -> Duration {
        Duration::from_millis(self.empty_queue_backoff_ms)
    }

    /// [`poll_slice_ms`](Self::poll_slice_ms) as a duration.
    #[must_use]
    pub const fn poll_slice(&self) -> Duration {
        Duration::from_millis(self.poll_slice_ms)
    }

    /// [`lock_timeout_ms`](Self::lock_timeout_ms) as a duration.
    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// [`wait_timeout_ms`](Self::wait_timeout_ms) as a duration.
    #[must_use]
    pub const fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    /// Validate timing values.
    pub fn validate(&self) -> Result<(), String> {
        let fields = [
            ("unavailable_poll_ms", self.unavailable_poll_ms),
            ("empty_queue_backoff_ms", self.empty_queue_backoff_ms),
            ("poll_slice_ms", self.poll_slice_ms),
            ("lock_timeout_ms", self.lock_timeout_ms),
            ("wait_timeout_ms", self.wait_timeout_ms),
        ];
        for (name, value) in fields {
            if value == 0 {
                return Err(format!("{name} must be greater than 0"));
            }
        }
        if self.poll_slice_ms > self.lock_timeout_ms {
            return Err("poll_slice_ms must not exceed lock_timeout_ms".into());
        }
        Ok(())
    }
}

const fn default_exclusive() -> bool {
    true
}

const fn default_operator_priority() -> i32 {
    10
}

fn default_strategy() -> String {
    DEFAULT_STRATEGY.to_string()
}

/// Root configuration for one rig.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutopatchConfig {
    /// Worker devices.
    pub workers: Vec<WorkerConfig>,
    /// Initial assignment strategy.
    #[serde(default = "default_strategy")]
    pub strategy: String,
    /// Whether closest-first serializes work across all workers.
    #[serde(default = "default_exclusive")]
    pub closest_first_exclusive: bool,
    /// Task type selected at startup.
    #[serde(default)]
    pub default_protocol: Option<String>,
    /// Poll intervals and bounds.
    #[serde(default)]
    pub timing: TimingConfig,
    /// Arbiter priority of the operator override.
    #[serde(default = "default_operator_priority")]
    pub operator_priority: i32,
    /// Arbiter priority of worker tasks.
    #[serde(default)]
    pub worker_priority: i32,
}

impl Default for AutopatchConfig {
    fn default() -> Self {
        Self {
            workers: Vec::new(),
            strategy: default_strategy(),
            closest_first_exclusive: default_exclusive(),
            default_protocol: None,
            timing: TimingConfig::default(),
            operator_priority: default_operator_priority(),
            worker_priority: 0,
        }
    }
}

impl WorkerConfig {
    /// Validate one worker entry.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("worker name must not be empty".into());
        }
        if self.regions.is_empty() {
            return Err("at least one region must be defined".into());
        }
        for (idx, region) in self.regions.iter().enumerate() {
            region
                .validate()
                .map_err(|e| format!("region {idx} invalid: {e}"))?;
        }
        Ok(())
    }
}

impl AutopatchConfig {
    /// Validate all workers, timing and the strategy name.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        for worker in &self.workers {
            worker
                .validate()
                .map_err(|e| format!("worker `{}` invalid: {e}", worker.name))?;
            if !seen.insert(worker.name.as_str()) {
                return Err(format!("duplicate worker name `{}`", worker.name));
            }
        }
        self.timing.validate()?;
        if ![CLOSEST_FIRST, FAIR_BY_REGION].contains(&self.strategy.as_str()) {
            return Err(format!("unknown strategy `{}`", self.strategy));
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read and validate a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`AutopatchError::InvalidConfig`] if the file is unreadable
    /// or invalid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, AutopatchError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| AutopatchError::InvalidConfig(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&raw).map_err(AutopatchError::InvalidConfig)
    }

    /// Load `.env`, then read the file named by `AUTOPATCH_CONFIG`; defaults
    /// when the variable is unset.
    ///
    /// # Errors
    ///
    /// Returns [`AutopatchError::InvalidConfig`] if the named file is
    /// unreadable or invalid.
    pub fn from_env() -> Result<Self, AutopatchError> {
        let _ = dotenvy::dotenv();
        match std::env::var(CONFIG_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(path),
            _ => Ok(Self::default()),
        }
    }
}
