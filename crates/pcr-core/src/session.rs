//! Replay session state machine.
//!
//! # State Machine
//!
//! ```text
//! Starting ──▶ Running ──▶ Completed
//!    │  │         │  └───▶ Failed
//!    │  └──▶ Failed
//!    │            ▼
//!    └──────▶ Stopping ──▶ Stopped
//! ```
//!
//! A terminal status is written exactly once, through [`SessionCell::finish`].
//! The manual-stop flag is consulted before any exit code, so a stop request
//! always wins a race against natural completion.

use chrono::{DateTime, Utc};
use pcr_common::{
    CaptureFile, HistoryRecord, ReplayConfiguration, ReplayCounters, ReplayStatus, SessionId,
};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, warn};

use crate::launcher::ExitOutcome;

/// Error lines kept for failure messages.
const RECENT_ERROR_LINES: usize = 5;

/// Rejected status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid session transition {from} -> {to}")]
pub struct TransitionError {
    pub from: ReplayStatus,
    pub to: ReplayStatus,
}

/// Whether `from -> to` is an allowed edge. Self-edges are not.
pub fn can_transition(from: ReplayStatus, to: ReplayStatus) -> bool {
    use ReplayStatus::*;
    matches!(
        (from, to),
        (Starting, Running)
            | (Starting, Stopping)
            | (Starting, Failed)
            | (Running, Stopping)
            | (Running, Completed)
            | (Running, Failed)
            | (Stopping, Stopped)
    )
}

/// What to do after the replay process exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDecision {
    /// A stop was requested; the exit code is irrelevant.
    Stopped,
    /// Clean exit of a bounded replay.
    Completed,
    /// Clean exit in continuous mode; count the pass and relaunch.
    Loop,
    Failed(ExitOutcome),
}

/// Map a process exit to a session decision.
pub fn classify_exit(manual_stop: bool, exit: ExitOutcome, continuous: bool) -> ExitDecision {
    if manual_stop {
        ExitDecision::Stopped
    } else if !exit.success() {
        ExitDecision::Failed(exit)
    } else if continuous {
        ExitDecision::Loop
    } else {
        ExitDecision::Completed
    }
}

/// Counters for the replay pass currently in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct IterationCounters {
    pub packets_sent: u64,
    pub bytes_sent: u64,
}

/// One replay session. Owned by a [`SessionCell`].
#[derive(Debug, Clone)]
pub struct ReplaySession {
    pub session_id: SessionId,
    pub config: ReplayConfiguration,
    pub capture: CaptureFile,
    status: ReplayStatus,
    /// Totals folded in from finished passes.
    completed_totals: ReplayCounters,
    iteration: IterationCounters,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    manual_stop: bool,
    pub last_rate_pps: Option<f64>,
    pub pid: Option<u32>,
    recent_errors: VecDeque<String>,
    read_errors: Vec<String>,
}

impl ReplaySession {
    pub fn new(session_id: SessionId, config: ReplayConfiguration, capture: CaptureFile) -> Self {
        Self {
            session_id,
            config,
            capture,
            status: ReplayStatus::Starting,
            completed_totals: ReplayCounters::default(),
            iteration: IterationCounters::default(),
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            manual_stop: false,
            last_rate_pps: None,
            pid: None,
            recent_errors: VecDeque::with_capacity(RECENT_ERROR_LINES),
            read_errors: Vec::new(),
        }
    }

    pub fn status(&self) -> ReplayStatus {
        self.status
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a non-terminal transition.
    ///
    /// Returns `Ok(false)` for a self-transition, which changes nothing.
    /// Terminal statuses go through [`ReplaySession::finish`].
    pub fn transition(&mut self, to: ReplayStatus) -> Result<bool, TransitionError> {
        if self.status == to {
            return Ok(false);
        }
        if to.is_terminal() || !can_transition(self.status, to) {
            return Err(TransitionError {
                from: self.status,
                to,
            });
        }
        debug!(session_id = %self.session_id, from = %self.status, to = %to, "session transition");
        self.status = to;
        Ok(true)
    }

    /// Write the terminal status once. Returns `false` when the session was
    /// already terminal or the edge is not allowed from the current status.
    pub fn finish(&mut self, to: ReplayStatus, error: Option<String>) -> bool {
        if self.status.is_terminal() {
            debug!(session_id = %self.session_id, status = %self.status, ignored = %to, "terminal status already set");
            return false;
        }
        if !to.is_terminal() || !can_transition(self.status, to) {
            warn!(session_id = %self.session_id, from = %self.status, to = %to, "rejected terminal transition");
            return false;
        }
        self.status = to;
        self.completed_at = Some(Utc::now());
        if error.is_some() {
            self.error = error;
        }
        true
    }

    /// Set the manual-stop flag. Returns `true` only for the first request.
    pub fn request_stop(&mut self) -> bool {
        if self.manual_stop {
            return false;
        }
        self.manual_stop = true;
        true
    }

    pub fn manual_stop(&self) -> bool {
        self.manual_stop
    }

    /// Apply a cumulative counter line from the current pass.
    ///
    /// Counters never move backwards within a pass.
    pub fn observe_counters(&mut self, packets: u64, bytes: u64) {
        self.iteration.packets_sent = self.iteration.packets_sent.max(packets);
        self.iteration.bytes_sent = self.iteration.bytes_sent.max(bytes);
    }

    pub fn observe_rate(&mut self, pps: f64) {
        if pps.is_finite() && pps >= 0.0 {
            self.last_rate_pps = Some(pps);
        }
    }

    pub fn observe_error_line(&mut self, line: &str) {
        if self.recent_errors.len() == RECENT_ERROR_LINES {
            self.recent_errors.pop_front();
        }
        self.recent_errors.push_back(line.to_string());
    }

    pub fn observe_read_error(&mut self, message: String) {
        self.read_errors.push(message);
    }

    /// Output read errors from the current pass.
    pub fn read_errors(&self) -> &[String] {
        &self.read_errors
    }

    /// Recent error output joined for failure messages.
    pub fn recent_error_output(&self) -> Option<String> {
        if self.recent_errors.is_empty() {
            None
        } else {
            Some(self.recent_errors.iter().cloned().collect::<Vec<_>>().join("; "))
        }
    }

    /// Fold the finished pass into the session totals.
    ///
    /// `clean` marks a successful pass and advances the loop counter.
    pub fn end_iteration(&mut self, clean: bool) {
        self.completed_totals.packets_sent += self.iteration.packets_sent;
        self.completed_totals.bytes_sent += self.iteration.bytes_sent;
        if clean {
            self.completed_totals.loops_completed += 1;
        }
        self.iteration = IterationCounters::default();
        self.recent_errors.clear();
        self.read_errors.clear();
    }

    pub fn iteration(&self) -> IterationCounters {
        self.iteration
    }

    /// Session-wide totals including the pass in flight.
    pub fn counters(&self) -> ReplayCounters {
        ReplayCounters {
            packets_sent: self.completed_totals.packets_sent + self.iteration.packets_sent,
            bytes_sent: self.completed_totals.bytes_sent + self.iteration.bytes_sent,
            loops_completed: self.completed_totals.loops_completed,
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        let end = self.completed_at.unwrap_or_else(Utc::now);
        (end - self.started_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let counters = self.counters();
        SessionSnapshot {
            session_id: self.session_id.to_string(),
            status: self.status,
            file_id: self.config.file_id.clone(),
            capture_filename: self.capture.filename.clone(),
            interface: self.config.interface.clone(),
            speed: self.config.speed,
            speed_unit: self.config.speed_unit,
            continuous: self.config.continuous,
            loops_completed: counters.loops_completed,
            packets_sent: counters.packets_sent,
            bytes_sent: counters.bytes_sent,
            started_at: self.started_at,
            completed_at: self.completed_at,
            elapsed_secs: self.elapsed_secs(),
            pid: self.pid,
            error: self.error.clone(),
        }
    }

    /// History entry for a terminal session; `None` while still active.
    pub fn history_record(&self) -> Option<HistoryRecord> {
        let completed_at = self.completed_at.filter(|_| self.is_terminal())?;
        let counters = self.counters();
        Some(HistoryRecord {
            id: 0,
            session_id: self.session_id.to_string(),
            file_id: self.config.file_id.clone(),
            capture_filename: self.capture.filename.clone(),
            file_size: self.capture.size_bytes,
            interface: self.config.interface.clone(),
            speed: self.config.speed,
            speed_unit: self.config.speed_unit,
            continuous: self.config.continuous,
            loop_count_hint: self.config.effective_loop_count(),
            preload: self.config.preload,
            loops_completed: counters.loops_completed,
            status: self.status,
            started_at: self.started_at,
            completed_at,
            duration_secs: self.elapsed_secs(),
            packets_sent: counters.packets_sent,
            bytes_sent: counters.bytes_sent,
            error_message: self.error.clone(),
        })
    }
}

/// Serializable view of a session for status queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub status: ReplayStatus,
    pub file_id: String,
    pub capture_filename: String,
    pub interface: String,
    pub speed: f64,
    pub speed_unit: pcr_common::SpeedUnit,
    pub continuous: bool,
    pub loops_completed: u32,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub elapsed_secs: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Shared, lock-guarded session.
///
/// Critical sections are short and never span an `.await`.
#[derive(Debug)]
pub struct SessionCell {
    inner: Mutex<ReplaySession>,
}

impl SessionCell {
    pub fn new(session: ReplaySession) -> Self {
        Self {
            inner: Mutex::new(session),
        }
    }

    /// Lock the session, recovering from poisoning.
    pub fn lock(&self) -> MutexGuard<'_, ReplaySession> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut ReplaySession) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn status(&self) -> ReplayStatus {
        self.lock().status()
    }

    pub fn session_id(&self) -> SessionId {
        self.lock().session_id.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.lock().snapshot()
    }

    pub fn finish(&self, to: ReplayStatus, error: Option<String>) -> bool {
        self.lock().finish(to, error)
    }

    /// Set the manual-stop flag and move to `stopping` in one step.
    ///
    /// Returns `false` when the session is already terminal or stopping.
    pub fn request_stop(&self) -> bool {
        let mut session = self.lock();
        if session.is_terminal() {
            return false;
        }
        let first = session.request_stop();
        match session.transition(ReplayStatus::Stopping) {
            Ok(changed) => first || changed,
            Err(e) => {
                warn!(error = %e, "stop request in unexpected state");
                false
            }
        }
    }
}
