//! Test doubles: a scripted in-process launcher and mock tcpreplay binaries.

#![allow(dead_code)]

use pcr_common::{CaptureFile, ReplayConfiguration};
use pcr_config::EngineSettings;
use pcr_core::launcher::{
    ExitOutcome, LaunchError, LaunchPlan, Launcher, ProcessControl, ProcessHandle,
};
use pcr_core::{ReplayEngine, StatusReport};
use pcr_history::SqliteHistoryStore;
use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;

/// Behavior of one fake replay process.
#[derive(Debug, Clone)]
pub struct Script {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub run_for: Duration,
    pub exit_code: i32,
    /// Exit code reported after a graceful terminate; `None` ignores it.
    pub on_terminate: Option<ExitOutcome>,
    /// Error returned by every status poll.
    pub wait_error: Option<String>,
}

impl Script {
    pub fn clean(run_for: Duration) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            run_for,
            exit_code: 0,
            on_terminate: Some(ExitOutcome::Signal(15)),
            wait_error: None,
        }
    }

    pub fn with_counters(mut self, packets: u64, bytes: u64) -> Self {
        self.stdout.push(format!(
            "Actual: {} packets ({} bytes) sent in 0.50 seconds",
            packets, bytes
        ));
        self.stdout
            .push("Rated: 12800.0 Bps, 0.10 Mbps, 200.00 pps".to_string());
        self
    }

    pub fn exit_code(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    pub fn stderr_line(mut self, line: &str) -> Self {
        self.stderr.push(line.to_string());
        self
    }

    pub fn on_terminate(mut self, outcome: Option<ExitOutcome>) -> Self {
        self.on_terminate = outcome;
        self
    }

    pub fn wait_error(mut self, message: &str) -> Self {
        self.wait_error = Some(message.to_string());
        self
    }

    /// A process that runs until signalled.
    pub fn forever() -> Self {
        Self::clean(Duration::from_secs(3600))
    }
}

/// One planned launch.
#[derive(Debug, Clone)]
pub enum Step {
    Run(Script),
    Fail(String),
}

#[derive(Debug, Default)]
struct FakeState {
    terminated: bool,
    killed: bool,
}

/// Shared record of what a fake process went through.
#[derive(Debug, Clone, Default)]
pub struct ProcessLog {
    state: Arc<Mutex<FakeState>>,
}

impl ProcessLog {
    pub fn terminated(&self) -> bool {
        self.state.lock().unwrap().terminated
    }

    pub fn killed(&self) -> bool {
        self.state.lock().unwrap().killed
    }
}

struct FakeControl {
    pid: u32,
    exit_at: Instant,
    exit_code: i32,
    on_terminate: Option<ExitOutcome>,
    wait_error: Option<String>,
    log: ProcessLog,
}

impl FakeControl {
    fn outcome(&self) -> Option<ExitOutcome> {
        let state = self.log.state.lock().unwrap();
        if state.killed {
            return Some(ExitOutcome::Signal(9));
        }
        if state.terminated {
            if let Some(outcome) = self.on_terminate {
                return Some(outcome);
            }
        }
        if Instant::now() >= self.exit_at {
            return Some(ExitOutcome::Code(self.exit_code));
        }
        None
    }
}

impl ProcessControl for FakeControl {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitOutcome>> {
        if let Some(message) = &self.wait_error {
            return Err(io::Error::other(message.clone()));
        }
        Ok(self.outcome())
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.log.state.lock().unwrap().terminated = true;
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        self.log.state.lock().unwrap().killed = true;
        Ok(())
    }
}

/// Launcher that plays back [`Step`]s; the last step repeats.
pub struct ScriptedLauncher {
    steps: Mutex<VecDeque<Step>>,
    last: Mutex<Option<Step>>,
    plans: Mutex<Vec<LaunchPlan>>,
    logs: Mutex<Vec<ProcessLog>>,
}

impl ScriptedLauncher {
    pub fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            last: Mutex::new(None),
            plans: Mutex::new(Vec::new()),
            logs: Mutex::new(Vec::new()),
        })
    }

    pub fn repeating(script: Script) -> Arc<Self> {
        Self::new(vec![Step::Run(script)])
    }

    pub fn launches(&self) -> usize {
        self.plans.lock().unwrap().len()
    }

    pub fn plans(&self) -> Vec<LaunchPlan> {
        self.plans.lock().unwrap().clone()
    }

    pub fn process(&self, index: usize) -> ProcessLog {
        self.logs.lock().unwrap()[index].clone()
    }

    fn next_step(&self) -> Option<Step> {
        let mut steps = self.steps.lock().unwrap();
        let mut last = self.last.lock().unwrap();
        match steps.pop_front() {
            Some(step) => {
                *last = Some(step.clone());
                Some(step)
            }
            None => last.clone(),
        }
    }
}

impl Launcher for ScriptedLauncher {
    fn launch(&self, plan: &LaunchPlan) -> Result<ProcessHandle, LaunchError> {
        let step = self
            .next_step()
            .ok_or_else(|| LaunchError::ExecutableNotFound(plan.program.clone()))?;
        let script = match step {
            Step::Run(script) => script,
            Step::Fail(reason) => {
                return Err(LaunchError::Spawn(io::Error::other(reason)));
            }
        };
        self.plans.lock().unwrap().push(plan.clone());

        let log = ProcessLog::default();
        self.logs.lock().unwrap().push(log.clone());
        let control = FakeControl {
            pid: 40_000 + self.launches() as u32,
            exit_at: Instant::now() + script.run_for,
            exit_code: script.exit_code,
            on_terminate: script.on_terminate,
            wait_error: script.wait_error.clone(),
            log: log.clone(),
        };

        let (mut out_w, out_r) = tokio::io::duplex(16 * 1024);
        let (mut err_w, err_r) = tokio::io::duplex(16 * 1024);
        let watcher = FakeControl {
            pid: control.pid,
            exit_at: control.exit_at,
            exit_code: control.exit_code,
            on_terminate: control.on_terminate,
            wait_error: None,
            log,
        };
        tokio::spawn(async move {
            for line in &script.stdout {
                let _ = out_w.write_all(format!("{}\n", line).as_bytes()).await;
            }
            for line in &script.stderr {
                let _ = err_w.write_all(format!("{}\n", line).as_bytes()).await;
            }
            // Hold the pipes open until the process "exits".
            while watcher.outcome().is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            drop(out_w);
            drop(err_w);
        });

        Ok(ProcessHandle {
            pid: Some(control.pid),
            stdout: Box::new(out_r),
            stderr: Box::new(err_r),
            control: Box::new(control),
        })
    }
}

/// Settings with short timings for tests.
pub fn fast_settings() -> EngineSettings {
    EngineSettings {
        poll_interval_ms: 20,
        grace_period_ms: 200,
        inter_loop_delay_ms: 30,
        progress_interval_ms: 40,
        stats_interval_secs: None,
        verify_interface: false,
        ..EngineSettings::default()
    }
}

pub fn engine_with(launcher: Arc<dyn Launcher>, settings: EngineSettings) -> ReplayEngine {
    let store = SqliteHistoryStore::open_in_memory().unwrap();
    ReplayEngine::new(settings, launcher, Arc::new(store))
}

pub fn capture(total_packets: Option<u64>) -> CaptureFile {
    let mut capture = CaptureFile::from_path("file-1", "/captures/office.pcap", 49_693);
    capture.total_packets = total_packets;
    capture
}

pub fn config() -> ReplayConfiguration {
    ReplayConfiguration::new("file-1", "eth0", 2.0)
}

/// Poll engine status until `pred` holds or `limit` elapses.
pub async fn wait_until(
    engine: &ReplayEngine,
    limit: Duration,
    pred: impl Fn(&StatusReport) -> bool,
) -> StatusReport {
    let deadline = Instant::now() + limit;
    loop {
        let report = engine.status();
        if pred(&report) || Instant::now() >= deadline {
            return report;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Write an executable bash script standing in for tcpreplay.
pub fn mock_binary(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/bash\n{}\n", body)).unwrap();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
    }

    path
}

/// A small placeholder capture; the mock binaries never parse it.
pub fn capture_file(dir: &Path) -> CaptureFile {
    let path = dir.join("trace.pcap");
    fs::write(&path, b"\xd4\xc3\xb2\xa1\x02\x00\x04\x00").unwrap();
    CaptureFile::from_path("trace", &path, 8).with_total_packets(78)
}
