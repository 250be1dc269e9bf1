//! PCAP replay common types, IDs, and errors.
//!
//! This crate provides foundational types shared across the pcr crates:
//! - Session identity
//! - The replay configuration and session status model
//! - History record and query shapes
//! - Common error types

pub mod error;
pub mod history;
pub mod id;
pub mod replay;

pub use error::{Error, Result};
pub use history::{HistoryPage, HistoryQuery, HistoryRecord, StatusFilter};
pub use id::SessionId;
pub use replay::{
    CaptureFile, ProgressSnapshot, ReplayConfiguration, ReplayCounters, ReplayStatus, SpeedUnit,
};
