//! Semantic validation for settings and replay requests.

use pcr_common::{ReplayConfiguration, SpeedUnit};
use serde::Serialize;
use std::fmt;

use crate::settings::SpeedLimits;

/// Longest interface name the kernel accepts (IFNAMSIZ - 1).
pub const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Smallest multiplier `--multiplier` can carry at two decimals.
pub const MIN_MULTIPLIER: f64 = 0.01;

/// A single validation problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

impl From<ValidationError> for pcr_common::Error {
    fn from(err: ValidationError) -> Self {
        pcr_common::Error::Validation(err.to_string())
    }
}

/// Outcome of validating a whole document.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn push(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn warn(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Collapse into a single error listing every problem.
    pub fn into_result(self) -> Result<(), pcr_common::Error> {
        if self.errors.is_empty() {
            return Ok(());
        }
        let joined = self
            .errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Err(pcr_common::Error::Config(joined))
    }
}

/// Validate a replay request and return a sanitized copy.
///
/// Rules:
/// - speed is a finite number greater than zero
/// - `MIN_MULTIPLIER` ≤ multiplier ≤ `limits.max_multiplier`, pps ≤ `limits.max_pps`
/// - pps values are whole packets per second
/// - interface is non-empty after trimming, at most 15 bytes, and only
///   contains alphanumerics, `-`, `_`, or `.`
pub fn validate_request(
    config: &ReplayConfiguration,
    limits: &SpeedLimits,
) -> Result<ReplayConfiguration, ValidationError> {
    let speed = config.speed;
    if !speed.is_finite() {
        return Err(ValidationError::new("speed", "must be a valid number"));
    }
    if speed <= 0.0 {
        return Err(ValidationError::new("speed", "must be greater than 0"));
    }
    match config.speed_unit {
        SpeedUnit::Multiplier if speed > limits.max_multiplier => {
            return Err(ValidationError::new(
                "speed",
                format!("multiplier cannot exceed {}x", limits.max_multiplier),
            ));
        }
        SpeedUnit::Multiplier if speed < MIN_MULTIPLIER => {
            return Err(ValidationError::new(
                "speed",
                format!("multiplier must be at least {}x", MIN_MULTIPLIER),
            ));
        }
        SpeedUnit::Pps if speed > limits.max_pps => {
            return Err(ValidationError::new(
                "speed",
                format!("pps cannot exceed {}", limits.max_pps),
            ));
        }
        SpeedUnit::Pps if speed < 1.0 => {
            return Err(ValidationError::new("speed", "pps must be at least 1"));
        }
        _ => {}
    }

    let interface = config.interface.trim();
    if interface.is_empty() {
        return Err(ValidationError::new("interface", "network interface is required"));
    }
    if interface.len() > MAX_INTERFACE_NAME_LEN {
        return Err(ValidationError::new(
            "interface",
            format!("name longer than {} bytes", MAX_INTERFACE_NAME_LEN),
        ));
    }
    if !interface
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(ValidationError::new("interface", "invalid interface name"));
    }

    if config.file_id.trim().is_empty() {
        return Err(ValidationError::new("file_id", "file ID is required"));
    }

    if let Some(0) = config.loop_count {
        return Err(ValidationError::new("loop_count", "must be at least 1"));
    }

    let mut sanitized = config.clone();
    sanitized.interface = interface.to_string();
    sanitized.file_id = config.file_id.trim().to_string();
    Ok(sanitized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn request(interface: &str, speed: f64, unit: SpeedUnit) -> ReplayConfiguration {
        ReplayConfiguration::new("abc123", interface, speed).with_unit(unit)
    }

    #[test]
    fn test_valid_request_is_trimmed() {
        let cfg = request("  eth0 ", 2.0, SpeedUnit::Multiplier);
        let sanitized = validate_request(&cfg, &SpeedLimits::default()).unwrap();
        assert_eq!(sanitized.interface, "eth0");
    }

    #[test]
    fn test_speed_limits_depend_on_unit() {
        let limits = SpeedLimits::default();
        assert!(validate_request(&request("eth0", 150.0, SpeedUnit::Multiplier), &limits).is_err());
        assert!(validate_request(&request("eth0", 150.0, SpeedUnit::Pps), &limits).is_ok());
        assert!(validate_request(&request("eth0", 2_000_000.0, SpeedUnit::Pps), &limits).is_err());
        assert!(validate_request(&request("eth0", 0.5, SpeedUnit::Pps), &limits).is_err());
    }

    #[test]
    fn test_multiplier_below_two_decimals_rejected() {
        let limits = SpeedLimits::default();
        for speed in [0.004, 0.0049, 0.009] {
            let err = validate_request(&request("eth0", speed, SpeedUnit::Multiplier), &limits)
                .unwrap_err();
            assert_eq!(err.field, "speed");
        }
        assert!(validate_request(&request("eth0", 0.01, SpeedUnit::Multiplier), &limits).is_ok());
    }

    #[test]
    fn test_rejects_bad_interface_names() {
        let limits = SpeedLimits::default();
        for name in ["", "   ", "eth0; rm -rf /", "a-very-long-interface-name", "eth 0"] {
            let err = validate_request(&request(name, 1.0, SpeedUnit::Multiplier), &limits)
                .expect_err(name);
            assert_eq!(err.field, "interface");
        }
        for name in ["eth0", "enp0s31f6", "br-lan", "veth_1", "eth0.100"] {
            assert!(validate_request(&request(name, 1.0, SpeedUnit::Multiplier), &limits).is_ok());
        }
    }

    #[test]
    fn test_rejects_zero_loop_count() {
        let cfg = request("eth0", 1.0, SpeedUnit::Multiplier).with_loop_count(0);
        let err = validate_request(&cfg, &SpeedLimits::default()).unwrap_err();
        assert_eq!(err.field, "loop_count");
    }

    #[test]
    fn test_into_result_joins_errors() {
        let mut result = ValidationResult::default();
        result.push(ValidationError::new("a", "bad"));
        result.push(ValidationError::new("b", "worse"));
        let err = result.into_result().unwrap_err();
        assert_eq!(err.to_string(), "configuration error: a: bad; b: worse");
    }

    proptest! {
        #[test]
        fn non_positive_speed_always_rejected(speed in -1.0e6f64..=0.0) {
            let cfg = request("eth0", speed, SpeedUnit::Multiplier);
            prop_assert!(validate_request(&cfg, &SpeedLimits::default()).is_err());
        }

        #[test]
        fn accepted_requests_pass_engine_check(speed in 0.01f64..100.0) {
            let cfg = request("eth0", speed, SpeedUnit::Multiplier);
            let sanitized = validate_request(&cfg, &SpeedLimits::default()).unwrap();
            prop_assert!(sanitized.check().is_ok());
        }

        #[test]
        fn accepted_multiplier_never_formats_to_zero(speed in 0.0f64..1.0) {
            let cfg = request("eth0", speed, SpeedUnit::Multiplier);
            if let Ok(sanitized) = validate_request(&cfg, &SpeedLimits::default()) {
                prop_assert_ne!(format!("{:.2}", sanitized.speed), "0.00");
            }
        }
    }
}
