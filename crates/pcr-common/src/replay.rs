//! Replay configuration, session status, and progress shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::Error;

/// How the replay speed value is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeedUnit {
    /// Multiple of the original inter-packet gaps (1.0 = real time).
    Multiplier,
    /// Fixed packets-per-second rate.
    #[serde(alias = "packets-per-second", alias = "packets_per_second")]
    Pps,
}

impl SpeedUnit {
    pub fn as_str(self) -> &'static str {
        match self {
            SpeedUnit::Multiplier => "multiplier",
            SpeedUnit::Pps => "pps",
        }
    }
}

impl fmt::Display for SpeedUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SpeedUnit {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "multiplier" | "x" => Ok(SpeedUnit::Multiplier),
            "pps" | "packets-per-second" | "packets_per_second" => Ok(SpeedUnit::Pps),
            other => Err(Error::Validation(format!(
                "invalid speed unit '{}': must be 'multiplier' or 'pps'",
                other
            ))),
        }
    }
}

/// Lifecycle status of a replay session.
///
/// ```text
/// starting ──▶ running ──▶ completed
///    │            │   └──▶ failed
///    │            ▼
///    └──────▶ stopping ──▶ stopped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayStatus {
    Starting,
    Running,
    Stopping,
    Completed,
    Failed,
    Stopped,
}

impl ReplayStatus {
    pub const ALL: [ReplayStatus; 6] = [
        ReplayStatus::Starting,
        ReplayStatus::Running,
        ReplayStatus::Stopping,
        ReplayStatus::Completed,
        ReplayStatus::Failed,
        ReplayStatus::Stopped,
    ];

    /// Terminal statuses never change once reached.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ReplayStatus::Completed | ReplayStatus::Failed | ReplayStatus::Stopped
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReplayStatus::Starting => "starting",
            ReplayStatus::Running => "running",
            ReplayStatus::Stopping => "stopping",
            ReplayStatus::Completed => "completed",
            ReplayStatus::Failed => "failed",
            ReplayStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ReplayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReplayStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        ReplayStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == lowered)
            .ok_or_else(|| Error::Validation(format!("unknown replay status '{}'", s)))
    }
}

/// Validated replay parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayConfiguration {
    /// Logical identifier of the uploaded capture.
    pub file_id: String,
    /// Target network interface.
    pub interface: String,
    pub speed: f64,
    pub speed_unit: SpeedUnit,
    /// Replay repeatedly until stopped.
    #[serde(default)]
    pub continuous: bool,
    /// Number of passes for a non-continuous replay. Ignored when continuous.
    #[serde(default)]
    pub loop_count: Option<u32>,
    /// Load the capture into memory before transmitting.
    #[serde(default)]
    pub preload: bool,
}

impl ReplayConfiguration {
    pub fn new(file_id: impl Into<String>, interface: impl Into<String>, speed: f64) -> Self {
        Self {
            file_id: file_id.into(),
            interface: interface.into(),
            speed,
            speed_unit: SpeedUnit::Multiplier,
            continuous: false,
            loop_count: None,
            preload: false,
        }
    }

    pub fn with_unit(mut self, unit: SpeedUnit) -> Self {
        self.speed_unit = unit;
        self
    }

    pub fn continuous(mut self) -> Self {
        self.continuous = true;
        self
    }

    pub fn with_loop_count(mut self, loops: u32) -> Self {
        self.loop_count = Some(loops);
        self
    }

    /// Loop hint that actually applies (None in continuous mode).
    pub fn effective_loop_count(&self) -> Option<u32> {
        if self.continuous {
            None
        } else {
            self.loop_count.filter(|n| *n > 1)
        }
    }

    /// Minimal checks the engine re-applies even to pre-validated input.
    pub fn check(&self) -> Result<(), Error> {
        if self.interface.trim().is_empty() {
            return Err(Error::Validation("network interface is required".into()));
        }
        if !self.speed.is_finite() || self.speed <= 0.0 {
            return Err(Error::Validation(format!(
                "speed must be greater than 0 (got {})",
                self.speed
            )));
        }
        Ok(())
    }
}

/// A ready-to-transmit capture supplied by the upload collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureFile {
    pub file_id: String,
    pub path: PathBuf,
    /// Display name, normally the uploaded file's basename.
    pub filename: String,
    pub size_bytes: u64,
    /// Packet count from capture analysis, when known.
    #[serde(default)]
    pub total_packets: Option<u64>,
}

impl CaptureFile {
    /// Build a capture description from a path, deriving the display name.
    pub fn from_path(file_id: impl Into<String>, path: impl Into<PathBuf>, size_bytes: u64) -> Self {
        let path = path.into();
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            file_id: file_id.into(),
            path,
            filename,
            size_bytes,
            total_packets: None,
        }
    }

    pub fn with_total_packets(mut self, total: u64) -> Self {
        self.total_packets = Some(total);
        self
    }
}

/// Session-wide transmission counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplayCounters {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    /// Clean passes over the capture.
    pub loops_completed: u32,
}

/// Point-in-time progress derived from session counters. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub session_id: String,
    /// Monotonic per session; observers discard anything older than the last seen.
    pub seq: u64,
    pub sampled_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_per_second: f64,
    /// `None` when the total is unknown or the replay is continuous.
    pub percent_complete: Option<f64>,
    pub loops_completed: u32,
    pub continuous: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        let terminal: Vec<_> = ReplayStatus::ALL
            .into_iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(
            terminal,
            vec![
                ReplayStatus::Completed,
                ReplayStatus::Failed,
                ReplayStatus::Stopped
            ]
        );
    }

    #[test]
    fn test_status_parse_is_case_insensitive() {
        assert_eq!(
            "COMPLETED".parse::<ReplayStatus>().unwrap(),
            ReplayStatus::Completed
        );
        assert!("error".parse::<ReplayStatus>().is_err());
    }

    #[test]
    fn test_speed_unit_aliases() {
        let unit: SpeedUnit = serde_json::from_str("\"packets-per-second\"").unwrap();
        assert_eq!(unit, SpeedUnit::Pps);
        assert_eq!("multiplier".parse::<SpeedUnit>().unwrap(), SpeedUnit::Multiplier);
        assert!("gbps".parse::<SpeedUnit>().is_err());
    }

    #[test]
    fn test_check_rejects_empty_interface_and_bad_speed() {
        assert!(ReplayConfiguration::new("f", "  ", 1.0).check().is_err());
        assert!(ReplayConfiguration::new("f", "eth0", 0.0).check().is_err());
        assert!(ReplayConfiguration::new("f", "eth0", -2.0).check().is_err());
        assert!(ReplayConfiguration::new("f", "eth0", f64::NAN).check().is_err());
        assert!(ReplayConfiguration::new("f", "eth0", 2.0).check().is_ok());
    }

    #[test]
    fn test_loop_hint_ignored_when_continuous() {
        let cfg = ReplayConfiguration::new("f", "eth0", 1.0).with_loop_count(5);
        assert_eq!(cfg.effective_loop_count(), Some(5));
        assert_eq!(cfg.clone().continuous().effective_loop_count(), None);
        let single = ReplayConfiguration::new("f", "eth0", 1.0).with_loop_count(1);
        assert_eq!(single.effective_loop_count(), None);
    }

    #[test]
    fn test_capture_filename_from_path() {
        let capture = CaptureFile::from_path("abc", "/tmp/uploads/abc_trace.pcap", 42);
        assert_eq!(capture.filename, "abc_trace.pcap");
        assert_eq!(capture.total_packets, None);
    }
}
