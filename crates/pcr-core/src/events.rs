//! Status and progress event publishing.
//!
//! Status and progress travel on separate broadcast channels. A slow
//! observer can fall behind on progress (older snapshots are dropped) without
//! ever losing its place in the status stream.

use chrono::{DateTime, Utc};
use pcr_common::{ProgressSnapshot, ReplayCounters, ReplayStatus};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{debug, warn};

use crate::session::ReplaySession;

/// A session status change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusEvent {
    pub session_id: String,
    /// Publisher-wide sequence number; strictly increasing.
    pub seq: u64,
    pub status: ReplayStatus,
    pub at: DateTime<Utc>,
    pub counters: ReplayCounters,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Anything an observer can receive.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ReplayEvent {
    Status(StatusEvent),
    Progress(ProgressSnapshot),
}

impl ReplayEvent {
    pub fn session_id(&self) -> &str {
        match self {
            ReplayEvent::Status(e) => &e.session_id,
            ReplayEvent::Progress(p) => &p.session_id,
        }
    }

    /// Terminal status events end a session's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReplayEvent::Status(e) if e.status.is_terminal())
    }
}

/// Fan-out of replay events to any number of observers.
#[derive(Debug)]
pub struct EventPublisher {
    status_tx: broadcast::Sender<StatusEvent>,
    progress_tx: broadcast::Sender<ProgressSnapshot>,
    seq: AtomicU64,
}

impl EventPublisher {
    pub fn new(status_capacity: usize, progress_capacity: usize) -> Self {
        let (status_tx, _) = broadcast::channel(status_capacity.max(1));
        let (progress_tx, _) = broadcast::channel(progress_capacity.max(1));
        Self {
            status_tx,
            progress_tx,
            seq: AtomicU64::new(0),
        }
    }

    /// Build and publish a status event from the current session state.
    ///
    /// Returns the number of observers that received it.
    pub fn publish_status(&self, session: &ReplaySession, message: Option<String>) -> usize {
        let event = StatusEvent {
            session_id: session.session_id.to_string(),
            seq: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
            status: session.status(),
            at: Utc::now(),
            counters: session.counters(),
            message,
            error: session.error.clone(),
        };
        debug!(session_id = %event.session_id, seq = event.seq, status = %event.status, "publishing status");
        // No receivers is not an error.
        self.status_tx.send(event).unwrap_or(0)
    }

    pub fn publish_progress(&self, snapshot: ProgressSnapshot) -> usize {
        self.progress_tx.send(snapshot).unwrap_or(0)
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            status_rx: Some(self.status_tx.subscribe()),
            progress_rx: Some(self.progress_tx.subscribe()),
            dropped_progress: 0,
            dropped_status: 0,
        }
    }

    pub fn observer_count(&self) -> usize {
        self.status_tx.receiver_count()
    }
}

/// One observer's view of the event stream. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    status_rx: Option<broadcast::Receiver<StatusEvent>>,
    progress_rx: Option<broadcast::Receiver<ProgressSnapshot>>,
    dropped_progress: u64,
    dropped_status: u64,
}

impl Subscription {
    /// Next event, status first. `None` once the publisher is gone.
    pub async fn recv(&mut self) -> Option<ReplayEvent> {
        loop {
            let status_open = self.status_rx.is_some();
            let progress_open = self.progress_rx.is_some();
            if !status_open && !progress_open {
                return None;
            }

            let next = tokio::select! {
                biased;
                res = recv_opt(&mut self.status_rx), if status_open => Next::Status(res),
                res = recv_opt(&mut self.progress_rx), if progress_open => Next::Progress(res),
            };

            match next {
                Next::Status(Ok(event)) => return Some(ReplayEvent::Status(event)),
                Next::Status(Err(RecvError::Lagged(n))) => {
                    warn!(skipped = n, "status observer lagged");
                    self.dropped_status += n;
                }
                Next::Status(Err(RecvError::Closed)) => self.status_rx = None,
                Next::Progress(Ok(snapshot)) => return Some(ReplayEvent::Progress(snapshot)),
                Next::Progress(Err(RecvError::Lagged(n))) => self.dropped_progress += n,
                Next::Progress(Err(RecvError::Closed)) => self.progress_rx = None,
            }
        }
    }

    /// Next already-buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<ReplayEvent> {
        if let Some(rx) = self.status_rx.as_mut() {
            loop {
                match rx.try_recv() {
                    Ok(event) => return Some(ReplayEvent::Status(event)),
                    Err(TryRecvError::Lagged(n)) => self.dropped_status += n,
                    Err(TryRecvError::Closed) => {
                        self.status_rx = None;
                        break;
                    }
                    Err(TryRecvError::Empty) => break,
                }
            }
        }
        if let Some(rx) = self.progress_rx.as_mut() {
            loop {
                match rx.try_recv() {
                    Ok(snapshot) => return Some(ReplayEvent::Progress(snapshot)),
                    Err(TryRecvError::Lagged(n)) => self.dropped_progress += n,
                    Err(TryRecvError::Closed) => {
                        self.progress_rx = None;
                        break;
                    }
                    Err(TryRecvError::Empty) => break,
                }
            }
        }
        None
    }

    /// Progress snapshots skipped because this observer fell behind.
    pub fn dropped_progress(&self) -> u64 {
        self.dropped_progress
    }

    pub fn dropped_status(&self) -> u64 {
        self.dropped_status
    }

    pub fn unsubscribe(self) {}
}

enum Next {
    Status(Result<StatusEvent, RecvError>),
    Progress(Result<ProgressSnapshot, RecvError>),
}

async fn recv_opt<T: Clone>(rx: &mut Option<broadcast::Receiver<T>>) -> Result<T, RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pcr_common::{CaptureFile, ReplayConfiguration, SessionId};

    fn session() -> ReplaySession {
        ReplaySession::new(
            SessionId::new(),
            ReplayConfiguration::new("f1", "eth0", 1.0),
            CaptureFile::from_path("f1", "/tmp/a.pcap", 10),
        )
    }

    fn snapshot(seq: u64) -> ProgressSnapshot {
        ProgressSnapshot {
            session_id: "s".into(),
            seq,
            sampled_at: Utc::now(),
            elapsed_secs: seq as f64,
            packets_sent: seq * 10,
            bytes_sent: seq * 640,
            packets_per_second: 10.0,
            percent_complete: None,
            loops_completed: 0,
            continuous: false,
        }
    }

    #[test]
    fn test_publish_without_observers_is_noop() {
        let publisher = EventPublisher::new(8, 4);
        assert_eq!(publisher.publish_status(&session(), None), 0);
        assert_eq!(publisher.publish_progress(snapshot(1)), 0);
    }

    #[tokio::test]
    async fn test_status_sequence_increases() {
        let publisher = EventPublisher::new(8, 4);
        let mut sub = publisher.subscribe();
        let mut s = session();
        publisher.publish_status(&s, Some("starting".into()));
        s.transition(ReplayStatus::Running).unwrap();
        publisher.publish_status(&s, None);

        let Some(ReplayEvent::Status(a)) = sub.recv().await else {
            panic!("expected status");
        };
        let Some(ReplayEvent::Status(b)) = sub.recv().await else {
            panic!("expected status");
        };
        assert!(b.seq > a.seq);
        assert_eq!(b.status, ReplayStatus::Running);
    }

    #[tokio::test]
    async fn test_progress_overflow_never_evicts_status() {
        let publisher = EventPublisher::new(8, 2);
        let mut sub = publisher.subscribe();
        for seq in 1..=10 {
            publisher.publish_progress(snapshot(seq));
        }
        publisher.publish_status(&session(), Some("hello".into()));

        let first = sub.recv().await.unwrap();
        assert!(matches!(first, ReplayEvent::Status(ref e) if e.message.as_deref() == Some("hello")));

        let mut seqs = Vec::new();
        while let Some(ReplayEvent::Progress(p)) = sub.try_recv() {
            seqs.push(p.seq);
        }
        assert_eq!(seqs, vec![9, 10]);
        assert_eq!(sub.dropped_progress(), 8);
    }

    #[tokio::test]
    async fn test_dropping_subscription_unsubscribes() {
        let publisher = EventPublisher::new(8, 4);
        let sub = publisher.subscribe();
        let other = publisher.subscribe();
        assert_eq!(publisher.observer_count(), 2);
        sub.unsubscribe();
        drop(other);
        assert_eq!(publisher.observer_count(), 0);
    }

    #[tokio::test]
    async fn test_recv_ends_when_publisher_dropped() {
        let publisher = EventPublisher::new(8, 4);
        let mut sub = publisher.subscribe();
        publisher.publish_progress(snapshot(1));
        drop(publisher);
        assert!(matches!(sub.recv().await, Some(ReplayEvent::Progress(_))));
        assert!(sub.recv().await.is_none());
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = ReplayEvent::Progress(snapshot(3));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "progress");
        assert_eq!(json["seq"], 3);
    }
}
