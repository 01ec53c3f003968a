//! Session configuration and its on-disk lifecycle.
//!
//! The authority owns the canonical copy and pushes it to replicas whole.
//! Gameplay parameters are carried as an opaque JSON object; the core only
//! validates the fields it consumes itself.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::ConfigError;

/// Longest accepted packet age limit: one day.
pub const MAX_STALE_THRESHOLD_MS: u64 = 86_400_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Background sweeps allowed to run at once
    pub max_concurrent_sweeps: usize,

    /// Server-side packet age limit (milliseconds)
    pub stale_packet_threshold_ms: u64,

    /// Ticks between unconditional full-snapshot broadcasts
    pub resync_interval_ticks: u64,

    /// Ticks a server-like session waits in LOADING for entities to settle
    pub startup_grace_ticks: u64,

    /// Tick at which a standalone client leaves LOADING
    pub client_first_update_tick: u64,

    /// Ticks between log flushes
    pub log_flush_interval_ticks: u64,

    /// Simulation rate the driver runs at (Hz)
    pub tick_rate_hz: u32,

    /// Longest link chain a link query may report
    pub max_link_depth: usize,

    /// Game-specific parameters, passed through untouched
    pub gameplay: serde_json::Value,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            max_concurrent_sweeps: 1,
            stale_packet_threshold_ms: 10_000,
            resync_interval_ticks: 600,
            startup_grace_ticks: 120,
            client_first_update_tick: 60,
            log_flush_interval_ticks: 3_600,
            tick_rate_hz: 60,
            max_link_depth: 64,
            gameplay: serde_json::Value::Object(serde_json::Map::new()),
        }
    }
}

impl Configuration {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("max_concurrent_sweeps", self.max_concurrent_sweeps as u64),
            ("stale_packet_threshold_ms", self.stale_packet_threshold_ms),
            ("resync_interval_ticks", self.resync_interval_ticks),
            ("log_flush_interval_ticks", self.log_flush_interval_ticks),
            ("tick_rate_hz", self.tick_rate_hz as u64),
        ];
        for (field, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if self.stale_packet_threshold_ms > MAX_STALE_THRESHOLD_MS {
            return Err(ConfigError::Invalid {
                field: "stale_packet_threshold_ms",
                reason: format!("must not exceed {MAX_STALE_THRESHOLD_MS}"),
            });
        }
        if !self.gameplay.is_object() {
            return Err(ConfigError::Invalid {
                field: "gameplay",
                reason: "must be a JSON object".to_string(),
            });
        }
        Ok(())
    }

    /// Reads and validates a configuration file.
    pub fn try_load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: Configuration = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`try_load`](Self::try_load), falling back to defaults on any failure.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::try_load(path) {
            Ok(config) => {
                info!(path = %path.display(), "configuration loaded");
                config
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "using default configuration");
                Self::default()
            }
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)?;
        Ok(())
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_millis(self.stale_packet_threshold_ms)
    }

    /// Seconds per tick at the configured rate.
    pub fn tick_seconds(&self) -> f64 {
        1.0 / self.tick_rate_hz.max(1) as f64
    }
}
