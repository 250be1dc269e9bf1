//! Replay supervision.
//!
//! The supervisor owns a session from its first launched process until a
//! terminal status is written. Each iteration multiplexes three sources:
//! the stop token, reader events, and a poll tick that checks for exit.
//! None of them can block the others for longer than the poll interval.

use pcr_common::ReplayStatus;
use pcr_config::EngineSettings;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::events::EventPublisher;
use crate::launcher::{wait_bounded, ExitOutcome, LaunchPlan, Launcher, ProcessControl, ProcessHandle};
use crate::output::{spawn_reader, LineKind, ReaderEvent, ReaderOptions, StreamKind};
use crate::sampler::ProgressSampler;
use crate::session::{classify_exit, ExitDecision, SessionCell};

/// Buffered reader events per iteration.
const READER_CHANNEL_CAPACITY: usize = 1024;

/// How long to wait for the process to disappear after a forceful kill.
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Timing knobs for supervision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorTiming {
    pub poll: Duration,
    pub grace: Duration,
    pub kill_wait: Duration,
    pub inter_loop_delay: Duration,
    pub progress_interval: Duration,
}

impl SupervisorTiming {
    /// Longest a stop request can take to reach a terminal status.
    pub fn stop_budget(&self) -> Duration {
        self.grace + self.kill_wait + self.poll * 8
    }
}

impl From<&EngineSettings> for SupervisorTiming {
    fn from(settings: &EngineSettings) -> Self {
        Self {
            poll: settings.poll_interval(),
            grace: settings.grace_period(),
            kill_wait: KILL_WAIT,
            inter_loop_delay: settings.inter_loop_delay(),
            progress_interval: settings.progress_interval(),
        }
    }
}

/// How one process iteration ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum IterationEnd {
    Exited(ExitOutcome),
    /// Stop requested and the process could not be confirmed dead.
    Abandoned,
    /// Exit status could not be read.
    WaitFailed(String),
}

/// What ends or continues the session after an iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Conclusion {
    Iteration(IterationEnd),
    LaunchFailed(String),
    StoppedBetweenLoops,
}

/// Mark the session as stopping and announce it once.
///
/// Returns `true` when this call performed the change.
pub fn mark_stopping(cell: &SessionCell, publisher: &EventPublisher) -> bool {
    let mut session = cell.lock();
    if session.is_terminal() {
        return false;
    }
    let first = session.request_stop();
    let changed = match session.transition(ReplayStatus::Stopping) {
        Ok(changed) => changed,
        Err(e) => {
            warn!(session_id = %session.session_id, error = %e, "cannot enter stopping");
            false
        }
    };
    if changed {
        info!(session_id = %session.session_id, "stop requested");
        publisher.publish_status(&session, Some("stop requested".to_string()));
    }
    first || changed
}

/// Drives one session to a terminal status.
pub struct Supervisor {
    cell: Arc<SessionCell>,
    publisher: Arc<EventPublisher>,
    launcher: Arc<dyn Launcher>,
    plan: LaunchPlan,
    timing: SupervisorTiming,
    stop: CancellationToken,
}

impl Supervisor {
    pub fn new(
        cell: Arc<SessionCell>,
        publisher: Arc<EventPublisher>,
        launcher: Arc<dyn Launcher>,
        plan: LaunchPlan,
        timing: SupervisorTiming,
        stop: CancellationToken,
    ) -> Self {
        Self {
            cell,
            publisher,
            launcher,
            plan,
            timing,
            stop,
        }
    }

    /// Supervise starting from an already launched process.
    ///
    /// Returns the terminal status written to the session. The terminal
    /// status event is left to the caller, which persists history first.
    pub async fn run(self, first: ProcessHandle) -> ReplayStatus {
        let sampler_cancel = CancellationToken::new();
        let sampler = ProgressSampler::new(
            Arc::clone(&self.cell),
            Arc::clone(&self.publisher),
            self.timing.progress_interval,
        )
        .spawn(sampler_cancel.clone());

        let mut handle = first;
        let status = loop {
            let end = self.run_iteration(handle).await;
            if let Some(status) = self.conclude(Conclusion::Iteration(end)) {
                break status;
            }

            if self.pause_between_loops().await {
                break self.conclude_final(Conclusion::StoppedBetweenLoops);
            }

            handle = match self.launcher.launch(&self.plan) {
                Ok(next) => {
                    self.cell.with(|s| {
                        s.pid = next.pid;
                        info!(
                            session_id = %s.session_id,
                            loop_no = s.counters().loops_completed + 1,
                            pid = ?next.pid,
                            "starting replay loop"
                        );
                    });
                    next
                }
                Err(e) => {
                    error!(error = %e, "relaunch failed");
                    break self.conclude_final(Conclusion::LaunchFailed(e.to_string()));
                }
            };
        };

        sampler_cancel.cancel();
        if let Err(e) = sampler.await {
            warn!(error = %e, "progress sampler task failed");
        }
        status
    }

    /// Apply an iteration outcome under the session lock.
    ///
    /// Returns the terminal status, or `None` when the session loops.
    fn conclude(&self, conclusion: Conclusion) -> Option<ReplayStatus> {
        let binary = self
            .plan
            .program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.plan.program.display().to_string());

        let mut session = self.cell.lock();
        let session_id = session.session_id.clone();
        let manual_stop = session.manual_stop();
        let continuous = session.config.continuous;

        let (target, error) = match conclusion {
            Conclusion::Iteration(IterationEnd::Exited(exit)) => {
                match classify_exit(manual_stop, exit, continuous) {
                    ExitDecision::Stopped => {
                        session.end_iteration(false);
                        (ReplayStatus::Stopped, None)
                    }
                    ExitDecision::Completed => {
                        session.end_iteration(true);
                        (ReplayStatus::Completed, None)
                    }
                    ExitDecision::Loop => {
                        session.end_iteration(true);
                        let counters = session.counters();
                        info!(
                            session_id = %session_id,
                            loops_completed = counters.loops_completed,
                            packets_sent = counters.packets_sent,
                            "replay loop finished"
                        );
                        self.publisher.publish_status(
                            &session,
                            Some(format!("loop {} completed", counters.loops_completed)),
                        );
                        return None;
                    }
                    ExitDecision::Failed(exit) => {
                        let mut message = format!("{} {}", binary, exit);
                        if let Some(detail) = session.recent_error_output() {
                            message.push_str(": ");
                            message.push_str(&detail);
                        } else if let Some(read_error) = session.read_errors().last() {
                            message.push_str(": output read error: ");
                            message.push_str(read_error);
                        }
                        session.end_iteration(false);
                        (ReplayStatus::Failed, Some(message))
                    }
                }
            }
            Conclusion::Iteration(IterationEnd::Abandoned) | Conclusion::StoppedBetweenLoops => {
                session.end_iteration(false);
                (ReplayStatus::Stopped, None)
            }
            Conclusion::Iteration(IterationEnd::WaitFailed(message)) => {
                session.end_iteration(false);
                if manual_stop {
                    (ReplayStatus::Stopped, None)
                } else {
                    (ReplayStatus::Failed, Some(format!("lost track of {}: {}", binary, message)))
                }
            }
            Conclusion::LaunchFailed(message) => {
                if manual_stop {
                    (ReplayStatus::Stopped, None)
                } else {
                    (ReplayStatus::Failed, Some(message))
                }
            }
        };

        // A stop request always ends in `stopped`.
        let target = if session.manual_stop() {
            ReplayStatus::Stopped
        } else {
            target
        };
        if session.finish(target, error.clone()) {
            let counters = session.counters();
            match target {
                ReplayStatus::Failed => error!(
                    session_id = %session_id,
                    error = error.as_deref().unwrap_or(""),
                    "replay failed"
                ),
                _ => info!(
                    session_id = %session_id,
                    status = %target,
                    packets_sent = counters.packets_sent,
                    loops_completed = counters.loops_completed,
                    "replay finished"
                ),
            }
        }
        Some(session.status())
    }

    fn conclude_final(&self, conclusion: Conclusion) -> ReplayStatus {
        self.conclude(conclusion)
            .unwrap_or_else(|| self.cell.status())
    }

    /// Wait out the inter-loop delay. Returns `true` if a stop arrived.
    async fn pause_between_loops(&self) -> bool {
        if self.stop.is_cancelled() {
            mark_stopping(&self.cell, &self.publisher);
            return true;
        }
        tokio::select! {
            _ = self.stop.cancelled() => {
                mark_stopping(&self.cell, &self.publisher);
                true
            }
            _ = tokio::time::sleep(self.timing.inter_loop_delay) => false,
        }
    }

    async fn run_iteration(&self, handle: ProcessHandle) -> IterationEnd {
        let ProcessHandle {
            pid,
            stdout,
            stderr,
            mut control,
        } = handle;

        let (tx, mut rx) = mpsc::channel(READER_CHANNEL_CAPACITY);
        let reader_cancel = CancellationToken::new();
        let options = ReaderOptions::new(self.timing.poll);
        let readers = [
            spawn_reader(StreamKind::Stdout, stdout, tx.clone(), reader_cancel.clone(), options),
            spawn_reader(StreamKind::Stderr, stderr, tx, reader_cancel.clone(), options),
        ];

        {
            let mut session = self.cell.lock();
            debug!(session_id = %session.session_id, pid = ?pid, "supervising replay process");
            // A stop may already have moved the session to `stopping`.
            if session.status() == ReplayStatus::Starting {
                match session.transition(ReplayStatus::Running) {
                    Ok(_) => {
                        info!(session_id = %session.session_id, pid = ?pid, "replay running");
                        self.publisher
                            .publish_status(&session, Some("replay running".to_string()));
                    }
                    Err(e) => warn!(session_id = %session.session_id, error = %e, "cannot enter running"),
                }
            }
        }

        let mut ticker = tokio::time::interval(self.timing.poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut streams_open = 2usize;

        let end = loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    mark_stopping(&self.cell, &self.publisher);
                    break self.escalate(control.as_mut()).await;
                }
                event = rx.recv(), if streams_open > 0 => match event {
                    Some(event) => {
                        if matches!(event, ReaderEvent::Closed { .. }) {
                            streams_open -= 1;
                        }
                        self.apply(event);
                    }
                    None => streams_open = 0,
                },
                _ = ticker.tick() => match control.try_wait() {
                    Ok(Some(exit)) => break IterationEnd::Exited(exit),
                    Ok(None) => {}
                    Err(e) => {
                        error!(pid = ?pid, error = %e, "failed to poll replay process");
                        if let Err(kill_err) = control.kill() {
                            error!(pid = ?pid, error = %kill_err, "kill failed");
                        }
                        break IterationEnd::WaitFailed(e.to_string());
                    }
                },
            }
        };

        // The pipes close once the process is gone; collect the tail of its
        // output so final counters are applied before classification.
        let drain_deadline = Instant::now() + options.drain + self.timing.poll;
        while streams_open > 0 {
            match tokio::time::timeout_at(drain_deadline, rx.recv()).await {
                Ok(Some(event)) => {
                    if matches!(event, ReaderEvent::Closed { .. }) {
                        streams_open -= 1;
                    }
                    self.apply(event);
                }
                Ok(None) => break,
                Err(_) => {
                    debug!(streams_open, "output drain timed out");
                    break;
                }
            }
        }
        reader_cancel.cancel();
        for reader in readers {
            if let Err(e) = reader.await {
                warn!(error = %e, "output reader task failed");
            }
        }
        while let Ok(event) = rx.try_recv() {
            self.apply(event);
        }

        end
    }

    /// Graceful terminate, bounded wait, then forceful kill.
    async fn escalate(&self, control: &mut dyn ProcessControl) -> IterationEnd {
        let pid = control.pid();
        if let Err(e) = control.terminate() {
            warn!(pid = ?pid, error = %e, "graceful terminate failed");
        }
        match wait_bounded(control, self.timing.grace, self.timing.poll).await {
            Ok(Some(exit)) => {
                debug!(pid = ?pid, %exit, "replay process exited after terminate");
                return IterationEnd::Exited(exit);
            }
            Ok(None) => {
                warn!(pid = ?pid, grace_ms = self.timing.grace.as_millis() as u64, "grace period elapsed, killing replay process");
            }
            Err(e) => warn!(pid = ?pid, error = %e, "wait after terminate failed"),
        }

        if let Err(e) = control.kill() {
            error!(pid = ?pid, error = %e, "kill failed");
        }
        match wait_bounded(control, self.timing.kill_wait, self.timing.poll).await {
            Ok(Some(exit)) => IterationEnd::Exited(exit),
            Ok(None) => {
                error!(pid = ?pid, "replay process did not exit after kill");
                IterationEnd::Abandoned
            }
            Err(e) => {
                error!(pid = ?pid, error = %e, "wait after kill failed");
                IterationEnd::Abandoned
            }
        }
    }

    fn apply(&self, event: ReaderEvent) {
        let mut session = self.cell.lock();
        match event {
            ReaderEvent::Line(line) => match line.kind {
                LineKind::Counters { packets, bytes, .. } => {
                    session.observe_counters(packets, bytes);
                }
                LineKind::Rate { pps, .. } => session.observe_rate(pps),
                LineKind::Error => {
                    warn!(session_id = %session.session_id, stream = %line.stream, line = %line.text, "replay error output");
                    session.observe_error_line(&line.text);
                }
                LineKind::Info => {
                    debug!(session_id = %session.session_id, line = %line.text, "replay output");
                }
            },
            ReaderEvent::ReadError { stream, message } => {
                warn!(session_id = %session.session_id, stream = %stream, error = %message, "replay output unreadable");
                session.observe_read_error(format!("{}: {}", stream, message));
            }
            ReaderEvent::Closed { stream } => {
                debug!(session_id = %session.session_id, stream = %stream, "replay output closed");
            }
        }
    }
}
