//! Non-blocking replay output reader.
//!
//! One task per stream reads with a bounded timeout, splits lines, classifies
//! them, and forwards [`ReaderEvent`]s to the supervisor. A reader never
//! blocks a stop request for longer than its poll interval.

use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Lines longer than this are split.
const MAX_LINE_BYTES: usize = 64 * 1024;

const READ_CHUNK: usize = 8192;

static COUNTERS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Actual:\s*(\d+)\s+packets\s+\((\d+)\s+bytes\)\s+sent in\s+([\d.]+)\s+seconds")
        .expect("regex")
});

static RATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Rated:\s*([\d.]+)\s*Bps,\s*([\d.]+)\s*Mbps,\s*([\d.]+)\s*pps").expect("regex")
});

/// Per-device statistics from the end-of-run summary, e.g. `Failed packets: 0`.
static DEVICE_STATS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:Successful|Failed|Truncated|Retried) packets\b[^:]*:\s*\d+\s*$")
        .expect("regex")
});

const ERROR_MARKERS: [&str; 5] = [
    "error",
    "failed",
    "fatal",
    "permission denied",
    "no such device",
];

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a line of replay output means.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum LineKind {
    /// `Actual: N packets (M bytes) sent in S seconds`, cumulative for the run.
    Counters {
        packets: u64,
        bytes: u64,
        seconds: f64,
    },
    /// `Rated: X Bps, Y Mbps, Z pps`
    Rate {
        bytes_per_sec: f64,
        mbps: f64,
        pps: f64,
    },
    Error,
    Info,
}

/// A classified output line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputLine {
    pub stream: StreamKind,
    pub text: String,
    pub kind: LineKind,
}

impl OutputLine {
    pub fn new(stream: StreamKind, text: impl Into<String>) -> Self {
        let text = text.into();
        let kind = classify_line(stream, &text);
        Self { stream, text, kind }
    }
}

/// Events delivered from reader tasks to the supervisor.
#[derive(Debug, Clone, PartialEq)]
pub enum ReaderEvent {
    Line(OutputLine),
    /// The stream failed; the process may still be running.
    ReadError { stream: StreamKind, message: String },
    /// End of stream. Not the same as process exit.
    Closed { stream: StreamKind },
}

/// Classify one line of tcpreplay output.
pub fn classify_line(stream: StreamKind, text: &str) -> LineKind {
    if let Some(caps) = COUNTERS_RE.captures(text) {
        let packets = caps[1].parse::<u64>();
        let bytes = caps[2].parse::<u64>();
        let seconds = caps[3].parse::<f64>();
        if let (Ok(packets), Ok(bytes), Ok(seconds)) = (packets, bytes, seconds) {
            return LineKind::Counters {
                packets,
                bytes,
                seconds,
            };
        }
    }
    if let Some(caps) = RATE_RE.captures(text) {
        let parsed = (
            caps[1].parse::<f64>(),
            caps[2].parse::<f64>(),
            caps[3].parse::<f64>(),
        );
        if let (Ok(bytes_per_sec), Ok(mbps), Ok(pps)) = parsed {
            return LineKind::Rate {
                bytes_per_sec,
                mbps,
                pps,
            };
        }
    }
    if DEVICE_STATS_RE.is_match(text) {
        return LineKind::Info;
    }
    if stream == StreamKind::Stderr {
        return LineKind::Error;
    }
    let lowered = text.to_ascii_lowercase();
    if ERROR_MARKERS.iter().any(|m| lowered.contains(m)) {
        LineKind::Error
    } else {
        LineKind::Info
    }
}

/// Incremental line splitter over raw bytes.
///
/// Accepts `\n`, `\r\n`, and bare `\r` terminators, decodes lossily, and drops
/// blank lines.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buf: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes; returns every line completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in bytes {
            if b == b'\n' || b == b'\r' {
                self.take_line(&mut lines);
            } else {
                self.buf.push(b);
                if self.buf.len() >= MAX_LINE_BYTES {
                    self.take_line(&mut lines);
                }
            }
        }
        lines
    }

    /// Flush an unterminated trailing line.
    pub fn finish(&mut self) -> Option<String> {
        let mut lines = Vec::new();
        self.take_line(&mut lines);
        lines.pop()
    }

    fn take_line(&mut self, out: &mut Vec<String>) {
        if self.buf.is_empty() {
            return;
        }
        let line = String::from_utf8_lossy(&self.buf).trim().to_string();
        self.buf.clear();
        if !line.is_empty() {
            out.push(line);
        }
    }
}

/// Timing for a reader task.
#[derive(Debug, Clone, Copy)]
pub struct ReaderOptions {
    /// Upper bound on a single read.
    pub poll: Duration,
    /// After cancellation, keep reading this long to capture trailing output.
    pub drain: Duration,
}

impl ReaderOptions {
    pub fn new(poll: Duration) -> Self {
        Self {
            poll,
            drain: poll * 2,
        }
    }
}

/// Spawn a reader for one stream.
///
/// The task ends at EOF, on a read error, when the receiver is gone, or once
/// the drain window after cancellation has elapsed.
pub fn spawn_reader<R>(
    stream: StreamKind,
    reader: R,
    tx: mpsc::Sender<ReaderEvent>,
    cancel: CancellationToken,
    options: ReaderOptions,
) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(read_stream(stream, reader, tx, cancel, options))
}

async fn read_stream<R>(
    stream: StreamKind,
    mut reader: R,
    tx: mpsc::Sender<ReaderEvent>,
    cancel: CancellationToken,
    options: ReaderOptions,
) where
    R: AsyncRead + Unpin,
{
    let mut splitter = LineSplitter::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut drain_deadline: Option<Instant> = None;

    loop {
        if drain_deadline.is_none() && cancel.is_cancelled() {
            drain_deadline = Some(Instant::now() + options.drain);
        }
        let wait = match drain_deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    debug!(stream = %stream, "reader drain window elapsed");
                    break;
                }
                options.poll.min(deadline - now)
            }
            None => options.poll,
        };

        match timeout(wait, reader.read(&mut chunk)).await {
            // Nothing to read within the poll interval; re-check cancellation.
            Err(_) => continue,
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                for text in splitter.push(&chunk[..n]) {
                    trace!(stream = %stream, line = %text, "replay output");
                    if tx.send(ReaderEvent::Line(OutputLine::new(stream, text))).await.is_err() {
                        return;
                    }
                }
            }
            Ok(Err(e)) => {
                warn!(stream = %stream, error = %e, "replay output read failed");
                let _ = tx
                    .send(ReaderEvent::ReadError {
                        stream,
                        message: e.to_string(),
                    })
                    .await;
                break;
            }
        }
    }

    if let Some(text) = splitter.finish() {
        let _ = tx.send(ReaderEvent::Line(OutputLine::new(stream, text))).await;
    }
    let _ = tx.send(ReaderEvent::Closed { stream }).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_classify_counters() {
        let kind = classify_line(
            StreamKind::Stdout,
            "Actual: 78 packets (49693 bytes) sent in 3.71 seconds",
        );
        assert_eq!(
            kind,
            LineKind::Counters {
                packets: 78,
                bytes: 49693,
                seconds: 3.71
            }
        );
    }

    #[test]
    fn test_classify_rate() {
        let kind = classify_line(
            StreamKind::Stdout,
            "\tRated: 77648.8 Bps, 0.62 Mbps, 137.25 pps",
        );
        assert_eq!(
            kind,
            LineKind::Rate {
                bytes_per_sec: 77648.8,
                mbps: 0.62,
                pps: 137.25
            }
        );
    }

    #[test]
    fn test_classify_errors_and_info() {
        assert_eq!(
            classify_line(StreamKind::Stdout, "Fatal Error: Unable to open interface"),
            LineKind::Error
        );
        assert_eq!(
            classify_line(StreamKind::Stdout, "socket: Permission denied"),
            LineKind::Error
        );
        assert_eq!(
            classify_line(StreamKind::Stderr, "Warning: something odd"),
            LineKind::Error
        );
        assert_eq!(
            classify_line(StreamKind::Stdout, "Statistics for network device: ens224"),
            LineKind::Info
        );
    }

    #[test]
    fn test_run_summary_is_not_error_output() {
        let summary = "Actual: 78 packets (49693 bytes) sent in 3.71 seconds\n\
            Rated: 13394.3 Bps, 0.10 Mbps, 21.02 pps\n\
            Statistics for network device: eth0\n\
            \tSuccessful packets:        78\n\
            \tFailed packets:            0\n\
            \tTruncated packets:         0\n\
            \tRetried packets (ENOBUFS): 0\n\
            \tRetried packets (EAGAIN):  0\n";
        for line in summary.lines() {
            let kind = classify_line(StreamKind::Stdout, line);
            assert_ne!(kind, LineKind::Error, "{:?}", line);
        }
        assert_eq!(
            classify_line(StreamKind::Stdout, "\tFailed packets:            0"),
            LineKind::Info
        );
        // Marker words elsewhere still count.
        assert_eq!(
            classify_line(StreamKind::Stdout, "Failed packets: see log, send failed"),
            LineKind::Error
        );
    }

    #[test]
    fn test_counters_on_stderr_still_parsed() {
        let kind = classify_line(
            StreamKind::Stderr,
            "Actual: 10 packets (640 bytes) sent in 0.10 seconds",
        );
        assert!(matches!(kind, LineKind::Counters { packets: 10, .. }));
    }

    #[test]
    fn test_splitter_handles_partial_and_mixed_terminators() {
        let mut splitter = LineSplitter::new();
        assert!(splitter.push(b"Actual: 1 pack").is_empty());
        assert_eq!(
            splitter.push(b"ets\r\nRated: x\rtail"),
            vec!["Actual: 1 packets".to_string(), "Rated: x".to_string()]
        );
        assert_eq!(splitter.finish().as_deref(), Some("tail"));
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn test_splitter_is_lossy_on_invalid_utf8() {
        let mut splitter = LineSplitter::new();
        let lines = splitter.push(b"bad \xff byte\n\n\n");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("bad "));
    }

    #[tokio::test]
    async fn test_reader_forwards_lines_and_close() {
        let (tx, mut rx) = mpsc::channel(16);
        let data: &[u8] = b"Test start\nActual: 5 packets (320 bytes) sent in 0.01 seconds\npartial";
        let handle = spawn_reader(
            StreamKind::Stdout,
            data,
            tx,
            CancellationToken::new(),
            ReaderOptions::new(Duration::from_millis(50)),
        );
        handle.await.unwrap();

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(events.len(), 4);
        assert!(matches!(&events[1], ReaderEvent::Line(l) if matches!(l.kind, LineKind::Counters { packets: 5, .. })));
        assert!(matches!(&events[2], ReaderEvent::Line(l) if l.text == "partial"));
        assert_eq!(
            events[3],
            ReaderEvent::Closed {
                stream: StreamKind::Stdout
            }
        );
    }

    #[tokio::test]
    async fn test_reader_stops_promptly_on_cancel_when_stream_idle() {
        let (writer, reader) = tokio::io::duplex(64);
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = spawn_reader(
            StreamKind::Stderr,
            reader,
            tx,
            cancel.clone(),
            ReaderOptions::new(Duration::from_millis(20)),
        );

        let started = std::time::Instant::now();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("reader ended after cancel")
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(
            rx.recv().await,
            Some(ReaderEvent::Closed {
                stream: StreamKind::Stderr
            })
        );
        drop(writer);
    }

    #[tokio::test]
    async fn test_reader_drains_tail_after_cancel() {
        let (mut writer, reader) = tokio::io::duplex(256);
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        writer
            .write_all(b"Actual: 9 packets (900 bytes) sent in 1.00 seconds\n")
            .await
            .unwrap();
        cancel.cancel();
        let handle = spawn_reader(
            StreamKind::Stdout,
            reader,
            tx,
            cancel,
            ReaderOptions::new(Duration::from_millis(20)),
        );
        handle.await.unwrap();

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, ReaderEvent::Line(l) if matches!(l.kind, LineKind::Counters { packets: 9, .. })));
        drop(writer);
    }
}
