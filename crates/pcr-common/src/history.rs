//! History record and query shapes.
//!
//! A [`HistoryRecord`] is written once, when a session reaches a terminal
//! status, and never updated afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;
use crate::replay::{ReplayStatus, SpeedUnit};

/// Default page size for history queries.
pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// Upper bound on a single page.
pub const MAX_PAGE_SIZE: u32 = 1000;

/// Immutable record of one finished replay session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Store-assigned row id; `0` until recorded.
    #[serde(default)]
    pub id: i64,
    pub session_id: String,
    pub file_id: String,
    pub capture_filename: String,
    pub file_size: u64,
    pub interface: String,
    pub speed: f64,
    pub speed_unit: SpeedUnit,
    pub continuous: bool,
    #[serde(default)]
    pub loop_count_hint: Option<u32>,
    #[serde(default)]
    pub preload: bool,
    pub loops_completed: u32,
    pub status: ReplayStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Status restriction for history queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusFilter {
    #[default]
    All,
    Only(ReplayStatus),
}

impl StatusFilter {
    pub fn matches(self, status: ReplayStatus) -> bool {
        match self {
            StatusFilter::All => true,
            StatusFilter::Only(wanted) => wanted == status,
        }
    }
}

impl fmt::Display for StatusFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusFilter::All => f.write_str("all"),
            StatusFilter::Only(status) => write!(f, "{}", status),
        }
    }
}

impl FromStr for StatusFilter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() || trimmed == "*" || trimmed.eq_ignore_ascii_case("all") {
            return Ok(StatusFilter::All);
        }
        trimmed.parse::<ReplayStatus>().map(StatusFilter::Only)
    }
}

/// Paginated, filtered history query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryQuery {
    pub limit: u32,
    pub offset: u32,
    /// Case-insensitive substring matched against filename and interface.
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub status: StatusFilter,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_SIZE,
            offset: 0,
            search: None,
            status: StatusFilter::All,
        }
    }
}

impl HistoryQuery {
    pub fn page(limit: u32, offset: u32) -> Self {
        Self {
            limit,
            offset,
            ..Self::default()
        }
    }

    pub fn with_search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }

    pub fn with_status(mut self, status: StatusFilter) -> Self {
        self.status = status;
        self
    }

    /// Search text with surrounding whitespace removed; `None` when blank.
    pub fn search_term(&self) -> Option<String> {
        self.search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase)
    }

    /// Limit clamped to `1..=MAX_PAGE_SIZE`.
    pub fn effective_limit(&self) -> u32 {
        self.limit.clamp(1, MAX_PAGE_SIZE)
    }
}

/// One page of history results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryPage {
    pub entries: Vec<HistoryRecord>,
    /// Number of entries matching the filters, independent of paging.
    pub total_count: u64,
    pub limit: u32,
    pub offset: u32,
    pub has_more: bool,
}

impl HistoryPage {
    pub fn new(entries: Vec<HistoryRecord>, total_count: u64, limit: u32, offset: u32) -> Self {
        let has_more = u64::from(offset) + (entries.len() as u64) < total_count;
        Self {
            entries,
            total_count,
            limit,
            offset,
            has_more,
        }
    }

    pub fn empty(query: &HistoryQuery) -> Self {
        Self::new(Vec::new(), 0, query.effective_limit(), query.offset)
    }
}
