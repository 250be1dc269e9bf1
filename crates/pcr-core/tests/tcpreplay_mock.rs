//! End-to-end runs of the real launcher against mock tcpreplay scripts.

#![cfg(unix)]

mod common;

use common::*;
use pcr_common::{HistoryQuery, ReplayConfiguration, ReplayStatus};
use pcr_core::{ReplayEngine, ReplayRequest, StopOutcome, TcpreplayLauncher};
use pcr_history::SqliteHistoryStore;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(10);

fn engine_for(dir: &TempDir, binary: std::path::PathBuf) -> ReplayEngine {
    let mut settings = fast_settings();
    settings.replay_binary = binary;
    let store = SqliteHistoryStore::open(dir.path().join("history.db")).unwrap();
    ReplayEngine::new(settings, Arc::new(TcpreplayLauncher::new()), Arc::new(store))
}

fn request_for(dir: &TempDir, continuous: bool) -> ReplayRequest {
    let capture = capture_file(dir.path());
    let mut config = ReplayConfiguration::new(capture.file_id.clone(), "lo", 1.0);
    config.continuous = continuous;
    ReplayRequest::new(config, capture)
}

#[tokio::test]
async fn test_mock_replay_completes_with_parsed_counters() {
    let dir = TempDir::new().unwrap();
    let binary = mock_binary(
        dir.path(),
        "tcpreplay",
        r#"
echo "sending out lo"
echo "processing file: $@"
sleep 0.1
echo "Actual: 78 packets (49693 bytes) sent in 0.10 seconds"
echo "Rated: 496930.0 Bps, 3.97 Mbps, 780.00 pps"
exit 0
"#,
    );
    let engine = engine_for(&dir, binary);

    let receipt = engine.start(request_for(&dir, false)).await.unwrap();
    assert!(receipt.pid.is_some());
    assert!(receipt.command.ends_with("trace.pcap"));

    let finished = tokio::time::timeout(WAIT, engine.wait_idle())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(finished.status, ReplayStatus::Completed);
    assert_eq!(finished.packets_sent, 78);
    assert_eq!(finished.bytes_sent, 49_693);

    let page = engine.history(HistoryQuery::default()).await.unwrap();
    assert_eq!(page.total_count, 1);
    assert_eq!(page.entries[0].capture_filename, "trace.pcap");
}

#[tokio::test]
async fn test_mock_replay_failure_reports_stderr() {
    let dir = TempDir::new().unwrap();
    let binary = mock_binary(
        dir.path(),
        "tcpreplay",
        r#"
echo "Fatal Error: failed to open device lo: permission denied" >&2
exit 1
"#,
    );
    let engine = engine_for(&dir, binary);
    engine.start(request_for(&dir, false)).await.unwrap();

    let finished = tokio::time::timeout(WAIT, engine.wait_idle())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(finished.status, ReplayStatus::Failed);
    let message = finished.error.unwrap();
    assert!(message.starts_with("tcpreplay exited with code 1"), "{}", message);
    assert!(message.contains("permission denied"), "{}", message);
}

#[tokio::test]
async fn test_mock_replay_stopped_gracefully() {
    let dir = TempDir::new().unwrap();
    let binary = mock_binary(
        dir.path(),
        "tcpreplay",
        r#"
trap 'echo "Actual: 5 packets (500 bytes) sent in 0.20 seconds"; exit 143' TERM
while true; do sleep 0.05; done
"#,
    );
    let engine = engine_for(&dir, binary);
    engine.start(request_for(&dir, false)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    match engine.stop().await.unwrap() {
        StopOutcome::Finished(s) => {
            assert_eq!(s.status, ReplayStatus::Stopped);
            assert_eq!(s.packets_sent, 5);
        }
        other => panic!("expected finished stop, got {:?}", other),
    }
}

#[tokio::test]
async fn test_mock_replay_ignoring_term_is_killed() {
    let dir = TempDir::new().unwrap();
    let binary = mock_binary(
        dir.path(),
        "tcpreplay",
        r#"
trap '' TERM
echo "sending out lo"
exec sleep 30
"#,
    );
    let engine = engine_for(&dir, binary);
    engine.start(request_for(&dir, false)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    let outcome = engine.stop().await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(200));
    match outcome {
        StopOutcome::Finished(s) => assert_eq!(s.status, ReplayStatus::Stopped),
        other => panic!("expected finished stop, got {:?}", other),
    }
    assert_eq!(engine.history(HistoryQuery::default()).await.unwrap().total_count, 1);
}

#[tokio::test]
async fn test_mock_continuous_replay_relaunches() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("launches");
    let binary = mock_binary(
        dir.path(),
        "tcpreplay",
        &format!(
            r#"
echo run >> "{}"
echo "Actual: 4 packets (400 bytes) sent in 0.01 seconds"
exit 0
"#,
            marker.display()
        ),
    );
    let engine = engine_for(&dir, binary);
    engine.start(request_for(&dir, true)).await.unwrap();

    wait_until(&engine, WAIT, |r| {
        r.session().is_some_and(|s| s.loops_completed >= 2)
    })
    .await;
    let snapshot = match engine.stop().await.unwrap() {
        StopOutcome::Finished(s) => s,
        other => panic!("expected finished stop, got {:?}", other),
    };
    assert_eq!(snapshot.status, ReplayStatus::Stopped);
    assert!(snapshot.loops_completed >= 2);
    assert!(snapshot.packets_sent >= 4 * u64::from(snapshot.loops_completed));

    let runs = std::fs::read_to_string(&marker).unwrap();
    assert!(runs.lines().count() as u32 >= snapshot.loops_completed);
}

#[tokio::test]
async fn test_missing_binary_is_a_launch_error() {
    let dir = TempDir::new().unwrap();
    let engine = engine_for(&dir, dir.path().join("no-such-tcpreplay"));
    let err = engine.start(request_for(&dir, false)).await.unwrap_err();
    assert!(matches!(err, pcr_common::Error::Launch(_)));
    assert!(!engine.is_active());
    assert_eq!(engine.history(HistoryQuery::default()).await.unwrap().total_count, 0);
}
