//! PCAP replay configuration loading and validation.
//!
//! This crate provides:
//! - Typed engine settings (timings, limits, history location)
//! - Config resolution (CLI → env → XDG → defaults)
//! - Semantic validation for settings and replay requests

pub mod resolve;
pub mod settings;
pub mod validate;

pub use resolve::{resolve_config, resolve_data_dir, ConfigError, ConfigPaths};
pub use settings::{EngineSettings, HistorySettings, SpeedLimits};
pub use validate::{validate_request, ValidationError, ValidationResult};
