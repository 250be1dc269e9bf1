//! Engine settings.
//!
//! Every field has a default, so a config file only needs to name what it
//! overrides:
//!
//! ```toml
//! replay_binary = "/usr/local/bin/tcpreplay"
//! grace_period_ms = 3000
//!
//! [history]
//! db_path = "/var/lib/pcap_replay/history.sqlite3"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::validate::{ValidationError, ValidationResult};

/// Upper bound on any single blocking read or exit poll.
pub const MAX_POLL_INTERVAL_MS: u64 = 500;

/// Default replay executable.
pub const DEFAULT_REPLAY_BINARY: &str = "tcpreplay";

/// Speed ceilings applied when validating replay requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeedLimits {
    pub max_multiplier: f64,
    pub max_pps: f64,
}

impl Default for SpeedLimits {
    fn default() -> Self {
        Self {
            max_multiplier: 100.0,
            max_pps: 1_000_000.0,
        }
    }
}

/// Where and how replay history is kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistorySettings {
    /// SQLite database path. Defaults to `<data dir>/history.sqlite3`.
    pub db_path: Option<PathBuf>,
    /// Entries kept by `history prune` when no explicit count is given.
    pub retain: Option<u32>,
}

/// Settings for the replay engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Replay executable (name on PATH or absolute path).
    pub replay_binary: PathBuf,

    /// Bound on each output read and exit poll. Stop requests are observed
    /// within this interval.
    pub poll_interval_ms: u64,

    /// Wait after the graceful terminate signal before a forceful kill.
    pub grace_period_ms: u64,

    /// Pause between continuous-mode iterations.
    pub inter_loop_delay_ms: u64,

    /// Progress sampling cadence.
    pub progress_interval_ms: u64,

    /// Ask the replay binary for periodic statistics (`--stats=N`).
    pub stats_interval_secs: Option<u32>,

    /// Check that the interface exists before launching (Linux only).
    pub verify_interface: bool,

    /// Extra arguments inserted before the capture path.
    pub extra_args: Vec<String>,

    /// Buffered status events per observer.
    pub event_capacity: usize,

    /// Buffered progress events per observer; older snapshots are dropped first.
    pub progress_capacity: usize,

    pub limits: SpeedLimits,

    pub history: HistorySettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            replay_binary: PathBuf::from(DEFAULT_REPLAY_BINARY),
            poll_interval_ms: 250,
            grace_period_ms: 5_000,
            inter_loop_delay_ms: 2_000,
            progress_interval_ms: 2_000,
            stats_interval_secs: Some(1),
            verify_interface: true,
            extra_args: Vec::new(),
            event_capacity: 256,
            progress_capacity: 16,
            limits: SpeedLimits::default(),
            history: HistorySettings::default(),
        }
    }
}

impl EngineSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.clamp(1, MAX_POLL_INTERVAL_MS))
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn inter_loop_delay(&self) -> Duration {
        Duration::from_millis(self.inter_loop_delay_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    /// Parse settings from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Render settings as TOML (used by `config show`).
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Semantic validation; collects every problem rather than stopping at the first.
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.replay_binary.as_os_str().is_empty() {
            result.push(ValidationError::new("replay_binary", "must not be empty"));
        }
        if self.poll_interval_ms == 0 || self.poll_interval_ms > MAX_POLL_INTERVAL_MS {
            result.push(ValidationError::new(
                "poll_interval_ms",
                format!("must be within 1..={}", MAX_POLL_INTERVAL_MS),
            ));
        }
        if self.grace_period_ms == 0 {
            result.push(ValidationError::new("grace_period_ms", "must be positive"));
        }
        if self.progress_interval_ms < 10 {
            result.push(ValidationError::new(
                "progress_interval_ms",
                "must be at least 10ms",
            ));
        }
        if self.event_capacity == 0 {
            result.push(ValidationError::new("event_capacity", "must be positive"));
        }
        if self.progress_capacity == 0 {
            result.push(ValidationError::new("progress_capacity", "must be positive"));
        }
        if self.stats_interval_secs == Some(0) {
            result.push(ValidationError::new(
                "stats_interval_secs",
                "use no value to disable periodic stats, not 0",
            ));
        }
        if !(self.limits.max_multiplier.is_finite() && self.limits.max_multiplier > 0.0) {
            result.push(ValidationError::new("limits.max_multiplier", "must be positive"));
        }
        if !(self.limits.max_pps.is_finite() && self.limits.max_pps > 0.0) {
            result.push(ValidationError::new("limits.max_pps", "must be positive"));
        }
        if self.inter_loop_delay_ms < 100 {
            result.warn("inter_loop_delay_ms below 100ms may thrash the interface between loops");
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = EngineSettings::default();
        let result = settings.validate();
        assert!(result.is_valid(), "{:?}", result.errors);
        assert!(result.warnings.is_empty());
        assert!(settings.poll_interval() <= Duration::from_millis(MAX_POLL_INTERVAL_MS));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let settings = EngineSettings::from_toml(
            r#"
            grace_period_ms = 1500

            [history]
            retain = 100
            "#,
        )
        .unwrap();
        assert_eq!(settings.grace_period_ms, 1500);
        assert_eq!(settings.history.retain, Some(100));
        assert_eq!(settings.inter_loop_delay_ms, 2_000);
        assert_eq!(settings.replay_binary, PathBuf::from(DEFAULT_REPLAY_BINARY));
    }

    #[test]
    fn test_poll_interval_over_bound_rejected() {
        let settings = EngineSettings {
            poll_interval_ms: 2_000,
            ..Default::default()
        };
        let result = settings.validate();
        assert!(!result.is_valid());
        assert_eq!(result.errors[0].field, "poll_interval_ms");
        assert_eq!(
            settings.poll_interval(),
            Duration::from_millis(MAX_POLL_INTERVAL_MS)
        );
    }

    #[test]
    fn test_collects_multiple_errors() {
        let settings = EngineSettings {
            grace_period_ms: 0,
            event_capacity: 0,
            ..Default::default()
        };
        assert_eq!(settings.validate().errors.len(), 2);
    }

    #[test]
    fn test_short_loop_delay_warns() {
        let settings = EngineSettings {
            inter_loop_delay_ms: 10,
            ..Default::default()
        };
        let result = settings.validate();
        assert!(result.is_valid());
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_toml_roundtrip() {
        let settings = EngineSettings::default();
        let text = settings.to_toml().unwrap();
        assert_eq!(EngineSettings::from_toml(&text).unwrap(), settings);
    }
}
