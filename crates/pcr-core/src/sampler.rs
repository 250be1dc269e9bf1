//! Periodic progress sampling.

use chrono::Utc;
use pcr_common::{ProgressSnapshot, ReplayStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::events::EventPublisher;
use crate::session::{ReplaySession, SessionCell};

/// Build a progress snapshot from the current session state.
///
/// Percent complete is only reported for bounded replays with a known packet
/// total. The rate prefers the figure tcpreplay printed over the average.
pub fn sample(session: &ReplaySession, seq: u64) -> ProgressSnapshot {
    let counters = session.counters();
    let elapsed_secs = session.elapsed_secs();

    let percent_complete = match (session.capture.total_packets, session.config.continuous) {
        (Some(total), false) if total > 0 => {
            let passes = u64::from(session.config.effective_loop_count().unwrap_or(1));
            let expected = total.saturating_mul(passes) as f64;
            Some((session.iteration().packets_sent as f64 / expected * 100.0).min(100.0))
        }
        _ => None,
    };

    let packets_per_second = session.last_rate_pps.unwrap_or_else(|| {
        if elapsed_secs > 0.0 {
            counters.packets_sent as f64 / elapsed_secs
        } else {
            0.0
        }
    });

    ProgressSnapshot {
        session_id: session.session_id.to_string(),
        seq,
        sampled_at: Utc::now(),
        elapsed_secs,
        packets_sent: counters.packets_sent,
        bytes_sent: counters.bytes_sent,
        packets_per_second,
        percent_complete,
        loops_completed: counters.loops_completed,
        continuous: session.config.continuous,
    }
}

/// Publishes a snapshot every interval while the session is running.
pub struct ProgressSampler {
    cell: Arc<SessionCell>,
    publisher: Arc<EventPublisher>,
    interval: Duration,
}

impl ProgressSampler {
    pub fn new(cell: Arc<SessionCell>, publisher: Arc<EventPublisher>, interval: Duration) -> Self {
        Self {
            cell,
            publisher,
            interval: interval.max(Duration::from_millis(10)),
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<u64> {
        tokio::spawn(self.run(cancel))
    }

    /// Run until the session is terminal or `cancel` fires.
    /// Returns the number of snapshots published.
    pub async fn run(self, cancel: CancellationToken) -> u64 {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; progress starts one interval in.
        ticker.tick().await;

        let mut seq = 0u64;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // Publish under the session lock so no snapshot can follow the
            // terminal status write.
            let session = self.cell.lock();
            match session.status() {
                ReplayStatus::Running => {
                    seq += 1;
                    let snapshot = sample(&session, seq);
                    trace!(session_id = %snapshot.session_id, seq, packets = snapshot.packets_sent, "progress sample");
                    self.publisher.publish_progress(snapshot);
                }
                status if status.is_terminal() => break,
                // Starting or stopping: no progress.
                _ => {}
            }
        }

        debug!(published = seq, "progress sampler finished");
        seq
    }
}
