//! Replay engine facade.
//!
//! [`ReplayEngine`] owns the single active-session slot. Starting while a
//! session is active is rejected, never queued. A finished session is
//! recorded to history, announced with its terminal status event, and only
//! then removed from the slot.

use chrono::{DateTime, Utc};
use pcr_common::{
    CaptureFile, Error, HistoryPage, HistoryQuery, ReplayConfiguration, ReplayStatus, Result,
    SessionId,
};
use pcr_config::{validate_request, EngineSettings};
use pcr_history::{HistoryStore, SqliteHistoryStore};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::events::{EventPublisher, Subscription};
use crate::launcher::{LaunchPlan, Launcher, TcpreplayLauncher};
use crate::session::{ReplaySession, SessionCell, SessionSnapshot};
use crate::supervisor::{mark_stopping, Supervisor, SupervisorTiming};

/// A request to replay one capture.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayRequest {
    pub config: ReplayConfiguration,
    pub capture: CaptureFile,
}

impl ReplayRequest {
    pub fn new(config: ReplayConfiguration, capture: CaptureFile) -> Self {
        Self { config, capture }
    }
}

/// Returned by a successful start.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartReceipt {
    pub session_id: String,
    pub status: ReplayStatus,
    pub started_at: DateTime<Utc>,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// Result of a stop request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "session", rename_all = "snake_case")]
pub enum StopOutcome {
    /// Nothing was running.
    Idle,
    /// The session reached a terminal status.
    Finished(SessionSnapshot),
    /// The session had not finished within the stop budget.
    Pending(SessionSnapshot),
}

/// Engine status.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "session", rename_all = "snake_case")]
pub enum StatusReport {
    Idle,
    Active(SessionSnapshot),
    /// Most recent session, kept after it finished.
    Finished(SessionSnapshot),
}

impl StatusReport {
    pub fn session(&self) -> Option<&SessionSnapshot> {
        match self {
            StatusReport::Idle => None,
            StatusReport::Active(s) | StatusReport::Finished(s) => Some(s),
        }
    }
}

struct ActiveSession {
    cell: Arc<SessionCell>,
    stop: CancellationToken,
    done: watch::Receiver<Option<ReplayStatus>>,
}

struct EngineInner {
    settings: EngineSettings,
    timing: SupervisorTiming,
    launcher: Arc<dyn Launcher>,
    history: Arc<dyn HistoryStore>,
    publisher: Arc<EventPublisher>,
    slot: Mutex<Option<ActiveSession>>,
    last_finished: Mutex<Option<SessionSnapshot>>,
}

/// Replay orchestration entry point. Cheap to clone.
#[derive(Clone)]
pub struct ReplayEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for ReplayEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayEngine")
            .field("replay_binary", &self.inner.settings.replay_binary)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ReplayEngine {
    pub fn new(
        settings: EngineSettings,
        launcher: Arc<dyn Launcher>,
        history: Arc<dyn HistoryStore>,
    ) -> Self {
        let publisher = Arc::new(EventPublisher::new(
            settings.event_capacity,
            settings.progress_capacity,
        ));
        let timing = SupervisorTiming::from(&settings);
        Self {
            inner: Arc::new(EngineInner {
                settings,
                timing,
                launcher,
                history,
                publisher,
                slot: Mutex::new(None),
                last_finished: Mutex::new(None),
            }),
        }
    }

    /// Engine backed by tcpreplay and the configured SQLite history.
    pub fn open(settings: EngineSettings) -> Result<Self> {
        let db_path = settings
            .history
            .db_path
            .clone()
            .ok_or_else(|| Error::Config("history database path not resolved".to_string()))?;
        let store = SqliteHistoryStore::open(&db_path)?;
        info!(db = %db_path.display(), "history store opened");
        Ok(Self::new(
            settings,
            Arc::new(TcpreplayLauncher::new()),
            Arc::new(store),
        ))
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    pub fn timing(&self) -> SupervisorTiming {
        self.inner.timing
    }

    /// Validate, launch, and begin supervising a replay.
    ///
    /// Fails with `Conflict` while another session is active, `Validation`
    /// for bad parameters, and `Launch` when the process cannot be started.
    /// A launch failure leaves no session behind and writes no history.
    pub async fn start(&self, request: ReplayRequest) -> Result<StartReceipt> {
        let ReplayRequest { config, capture } = request;
        config.check()?;
        let config = validate_request(&config, &self.inner.settings.limits)?;
        if config.file_id != capture.file_id {
            warn!(config_file_id = %config.file_id, capture_file_id = %capture.file_id, "file id mismatch between request and capture");
        }

        let mut slot = lock(&self.inner.slot);
        if let Some(active) = slot.as_ref() {
            let active_session = active.cell.session_id().to_string();
            warn!(active_session = %active_session, "start rejected: replay already active");
            return Err(Error::Conflict { active_session });
        }

        let plan = LaunchPlan::new(&config, &capture, &self.inner.settings);
        let mut session = ReplaySession::new(SessionId::new(), config, capture);

        let handle = match self.inner.launcher.launch(&plan) {
            Ok(handle) => handle,
            Err(e) => {
                error!(session_id = %session.session_id, error = %e, "replay launch failed");
                return Err(e.into());
            }
        };

        // Stays `starting` until the supervisor has its output readers up.
        session.pid = handle.pid;

        let receipt = StartReceipt {
            session_id: session.session_id.to_string(),
            status: session.status(),
            started_at: session.started_at,
            command: plan.command_line(),
            pid: handle.pid,
        };
        info!(
            session_id = %receipt.session_id,
            pid = ?receipt.pid,
            interface = %session.config.interface,
            speed = session.config.speed,
            speed_unit = %session.config.speed_unit,
            continuous = session.config.continuous,
            "replay launched"
        );
        self.inner
            .publisher
            .publish_status(&session, Some("replay starting".to_string()));

        let cell = Arc::new(SessionCell::new(session));
        let stop = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(None);
        *slot = Some(ActiveSession {
            cell: Arc::clone(&cell),
            stop: stop.clone(),
            done: done_rx,
        });
        drop(slot);

        let supervisor = Supervisor::new(
            Arc::clone(&cell),
            Arc::clone(&self.inner.publisher),
            Arc::clone(&self.inner.launcher),
            plan,
            self.inner.timing,
            stop,
        );
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let supervised = tokio::spawn(supervisor.run(handle)).await;
            if let Err(e) = supervised {
                error!(error = %e, "supervisor task ended abnormally");
            }
            inner.finalize(cell, done_tx).await;
        });

        Ok(receipt)
    }

    /// Stop the active session and wait (bounded) for its terminal status.
    /// Safe to call when idle or repeatedly.
    pub async fn stop(&self) -> Result<StopOutcome> {
        let (cell, stop, mut done) = {
            let slot = lock(&self.inner.slot);
            match slot.as_ref() {
                None => return Ok(StopOutcome::Idle),
                Some(active) => (
                    Arc::clone(&active.cell),
                    active.stop.clone(),
                    active.done.clone(),
                ),
            }
        };

        if mark_stopping(&cell, &self.inner.publisher) {
            info!(session_id = %cell.session_id(), "stopping replay");
        }
        stop.cancel();

        let budget = self.inner.timing.stop_budget();
        let finished = tokio::time::timeout(budget, done.wait_for(Option::is_some))
            .await
            .is_ok();
        if finished {
            Ok(StopOutcome::Finished(cell.snapshot()))
        } else {
            warn!(budget_ms = budget.as_millis() as u64, "stop did not complete in time");
            Ok(StopOutcome::Pending(cell.snapshot()))
        }
    }

    pub fn status(&self) -> StatusReport {
        if let Some(active) = lock(&self.inner.slot).as_ref() {
            return StatusReport::Active(active.cell.snapshot());
        }
        match lock(&self.inner.last_finished).clone() {
            Some(snapshot) => StatusReport::Finished(snapshot),
            None => StatusReport::Idle,
        }
    }

    pub fn is_active(&self) -> bool {
        lock(&self.inner.slot).is_some()
    }

    /// Wait until no session is active; returns the last finished session.
    pub async fn wait_idle(&self) -> Option<SessionSnapshot> {
        let done = lock(&self.inner.slot).as_ref().map(|a| a.done.clone());
        if let Some(mut done) = done {
            // A closed channel means the session was already finalized.
            let _ = done.wait_for(Option::is_some).await;
        }
        lock(&self.inner.last_finished).clone()
    }

    pub fn subscribe(&self) -> Subscription {
        self.inner.publisher.subscribe()
    }

    pub fn publisher(&self) -> Arc<EventPublisher> {
        Arc::clone(&self.inner.publisher)
    }

    pub fn history_store(&self) -> Arc<dyn HistoryStore> {
        Arc::clone(&self.inner.history)
    }

    /// Query recorded sessions.
    pub async fn history(&self, query: HistoryQuery) -> Result<HistoryPage> {
        let store = Arc::clone(&self.inner.history);
        tokio::task::spawn_blocking(move || store.query(&query))
            .await
            .map_err(|e| Error::History(format!("history query task failed: {}", e)))?
            .map_err(Error::from)
    }
}

impl EngineInner {
    async fn finalize(&self, cell: Arc<SessionCell>, done_tx: watch::Sender<Option<ReplayStatus>>) {
        // The supervisor always writes a terminal status; this covers a panic.
        {
            let mut session = cell.lock();
            if !session.is_terminal() {
                let target = if session.manual_stop() {
                    let _ = session.transition(ReplayStatus::Stopping);
                    ReplayStatus::Stopped
                } else {
                    ReplayStatus::Failed
                };
                session.finish(target, Some("supervisor terminated unexpectedly".to_string()));
            }
        }

        let (record, session_id) = {
            let session = cell.lock();
            (session.history_record(), session.session_id.clone())
        };

        let mut history_error = None;
        match record {
            Some(record) => {
                let store = Arc::clone(&self.history);
                let written = tokio::task::spawn_blocking(move || store.record(&record)).await;
                match written {
                    Ok(Ok(id)) => info!(session_id = %session_id, history_id = id, "history recorded"),
                    Ok(Err(e)) => history_error = Some(e.to_string()),
                    Err(e) => history_error = Some(format!("history task failed: {}", e)),
                }
            }
            None => history_error = Some("session not terminal at finalize".to_string()),
        }
        if let Some(e) = &history_error {
            error!(session_id = %session_id, error = %e, "failed to record history");
        }

        let (status, snapshot) = {
            let session = cell.lock();
            let message = match &history_error {
                Some(e) => format!("replay {}; history not recorded: {}", session.status(), e),
                None => format!("replay {}", session.status()),
            };
            self.publisher.publish_status(&session, Some(message));
            (session.status(), session.snapshot())
        };

        {
            let mut slot = lock(&self.slot);
            let same = slot
                .as_ref()
                .is_some_and(|active| Arc::ptr_eq(&active.cell, &cell));
            if same {
                *slot = None;
            }
            *lock(&self.last_finished) = Some(snapshot);
        }

        info!(session_id = %session_id, status = %status, "session finalized");
        let _ = done_tx.send(Some(status));
    }
}
