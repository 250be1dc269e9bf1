//! Replay process launching.
//!
//! The [`Launcher`] trait is the seam between supervision and the operating
//! system: production code spawns `tcpreplay` through [`TcpreplayLauncher`],
//! tests substitute scripted launchers that never touch a real interface.

use pcr_common::{CaptureFile, ReplayConfiguration, SpeedUnit};
use pcr_config::EngineSettings;
use serde::Serialize;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Limit on `--version` probes.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors raised before a replay process is running.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("replay executable not found: {0}")]
    ExecutableNotFound(PathBuf),

    #[error("permission denied launching {0}")]
    PermissionDenied(PathBuf),

    #[error("capture file not readable: {path}: {source}")]
    CaptureUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("network interface not available: {0}")]
    InterfaceUnavailable(String),

    #[error("failed to spawn replay process: {0}")]
    Spawn(#[source] io::Error),

    #[error("replay process started without a {0} pipe")]
    MissingPipe(&'static str),
}

impl From<LaunchError> for pcr_common::Error {
    fn from(err: LaunchError) -> Self {
        pcr_common::Error::Launch(err.to_string())
    }
}

/// How a replay process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum ExitOutcome {
    Code(i32),
    Signal(i32),
    Unknown,
}

impl ExitOutcome {
    pub fn from_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return ExitOutcome::Code(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ExitOutcome::Signal(signal);
            }
        }
        ExitOutcome::Unknown
    }

    /// Only a zero exit code counts as a clean exit.
    pub fn success(self) -> bool {
        matches!(self, ExitOutcome::Code(0))
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitOutcome::Code(code) => write!(f, "exited with code {}", code),
            ExitOutcome::Signal(signal) => write!(f, "terminated by signal {}", signal),
            ExitOutcome::Unknown => f.write_str("exited with unknown status"),
        }
    }
}

/// Control over a running replay process.
///
/// Every method returns promptly; callers that need to wait use
/// [`wait_bounded`], which polls `try_wait`.
pub trait ProcessControl: Send {
    fn pid(&self) -> Option<u32>;

    /// Exit outcome if the process has exited, without blocking.
    fn try_wait(&mut self) -> io::Result<Option<ExitOutcome>>;

    /// Ask the process to exit (SIGTERM on unix).
    fn terminate(&mut self) -> io::Result<()>;

    /// Force the process to exit (SIGKILL on unix).
    fn kill(&mut self) -> io::Result<()>;
}

pub type OutputStream = Box<dyn AsyncRead + Send + Unpin>;

/// A launched replay process.
pub struct ProcessHandle {
    pub pid: Option<u32>,
    pub stdout: OutputStream,
    pub stderr: OutputStream,
    pub control: Box<dyn ProcessControl>,
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle").field("pid", &self.pid).finish()
    }
}

/// Starts replay processes.
pub trait Launcher: Send + Sync {
    fn launch(&self, plan: &LaunchPlan) -> Result<ProcessHandle, LaunchError>;
}

/// Fully resolved command for one replay iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchPlan {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub capture_path: PathBuf,
    pub interface: String,
    pub verify_interface: bool,
}

impl LaunchPlan {
    /// Build the tcpreplay argument vector.
    ///
    /// Continuous replays are driven by relaunching, so no loop directive is
    /// passed for them; `--loop` is only used for a bounded pass count.
    pub fn new(
        config: &ReplayConfiguration,
        capture: &CaptureFile,
        settings: &EngineSettings,
    ) -> Self {
        let mut args = vec!["-i".to_string(), config.interface.clone()];

        match config.speed_unit {
            SpeedUnit::Multiplier => args.push(format!("--multiplier={:.2}", config.speed)),
            SpeedUnit::Pps => args.push(format!("--pps={}", config.speed.trunc() as u64)),
        }
        if let Some(loops) = config.effective_loop_count() {
            args.push(format!("--loop={}", loops));
        }
        if config.preload {
            args.push("--preload-pcap".to_string());
        }
        if let Some(secs) = settings.stats_interval_secs.filter(|s| *s > 0) {
            args.push(format!("--stats={}", secs));
        }
        args.extend(settings.extra_args.iter().cloned());
        args.push(capture.path.to_string_lossy().into_owned());

        Self {
            program: settings.replay_binary.clone(),
            args,
            capture_path: capture.path.clone(),
            interface: config.interface.clone(),
            verify_interface: settings.verify_interface,
        }
    }

    /// Shell-style rendering for logs.
    pub fn command_line(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Launches the real replay executable.
#[derive(Debug, Default, Clone)]
pub struct TcpreplayLauncher;

impl TcpreplayLauncher {
    pub fn new() -> Self {
        Self
    }
}

impl Launcher for TcpreplayLauncher {
    fn launch(&self, plan: &LaunchPlan) -> Result<ProcessHandle, LaunchError> {
        std::fs::File::open(&plan.capture_path).map_err(|e| LaunchError::CaptureUnreadable {
            path: plan.capture_path.clone(),
            source: e,
        })?;
        if plan.verify_interface && !interface_present(&plan.interface) {
            return Err(LaunchError::InterfaceUnavailable(plan.interface.clone()));
        }

        info!(command = %plan.command_line(), "launching replay process");

        let mut child = Command::new(&plan.program)
            .args(&plan.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => LaunchError::ExecutableNotFound(plan.program.clone()),
                io::ErrorKind::PermissionDenied => {
                    LaunchError::PermissionDenied(plan.program.clone())
                }
                _ => LaunchError::Spawn(e),
            })?;

        let stdout = child.stdout.take().ok_or(LaunchError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(LaunchError::MissingPipe("stderr"))?;
        let pid = child.id();
        debug!(pid = ?pid, "replay process spawned");

        Ok(ProcessHandle {
            pid,
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            control: Box::new(ChildControl { child }),
        })
    }
}

/// [`ProcessControl`] over a tokio child process.
#[derive(Debug)]
pub struct ChildControl {
    child: Child,
}

impl ChildControl {
    pub fn new(child: Child) -> Self {
        Self { child }
    }
}

impl ProcessControl for ChildControl {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitOutcome>> {
        Ok(self.child.try_wait()?.map(ExitOutcome::from_status))
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> io::Result<()> {
        // `id()` is None once the child has been reaped.
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        let pid = libc::pid_t::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        // SAFETY: kill(2) has no memory-safety preconditions.
        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            Ok(())
        } else {
            Err(err)
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> io::Result<()> {
        self.kill()
    }

    fn kill(&mut self) -> io::Result<()> {
        match self.child.start_kill() {
            Ok(()) => Ok(()),
            // Already exited and reaped.
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Wait up to `limit` for the process to exit, polling every `poll`.
///
/// Returns `None` if it is still running when the limit elapses.
pub async fn wait_bounded(
    control: &mut dyn ProcessControl,
    limit: Duration,
    poll: Duration,
) -> io::Result<Option<ExitOutcome>> {
    let deadline = Instant::now() + limit;
    loop {
        if let Some(exit) = control.try_wait()? {
            return Ok(Some(exit));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        tokio::time::sleep(poll.min(deadline - now)).await;
    }
}

/// Whether a network interface with this name exists.
#[cfg(target_os = "linux")]
pub fn interface_present(name: &str) -> bool {
    Path::new("/sys/class/net").join(name).exists()
}

/// Interface presence cannot be checked here; let the replay binary decide.
#[cfg(not(target_os = "linux"))]
pub fn interface_present(_name: &str) -> bool {
    true
}

/// Result of checking the replay binary and, optionally, an interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    pub binary: PathBuf,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface_present: Option<bool>,
}

/// Run `<binary> --version` and report whether replay is possible.
pub async fn probe(settings: &EngineSettings, interface: Option<&str>) -> ProbeReport {
    let binary = settings.replay_binary.clone();
    let mut report = ProbeReport {
        binary: binary.clone(),
        available: false,
        version: None,
        error: None,
        interface: interface.map(str::to_string),
        interface_present: interface.map(interface_present),
    };

    let output = Command::new(&binary)
        .arg("--version")
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(PROBE_TIMEOUT, output).await {
        Ok(Ok(out)) => {
            // tcpreplay prints its version banner on stdout; some builds use stderr.
            report.version = first_line(&out.stdout).or_else(|| first_line(&out.stderr));
            report.available = true;
            if !out.status.success() {
                warn!(binary = %binary.display(), status = %out.status, "version probe exited non-zero");
            }
        }
        Ok(Err(e)) => {
            report.error = Some(match e.kind() {
                io::ErrorKind::NotFound => LaunchError::ExecutableNotFound(binary.clone()).to_string(),
                io::ErrorKind::PermissionDenied => {
                    LaunchError::PermissionDenied(binary.clone()).to_string()
                }
                _ => LaunchError::Spawn(e).to_string(),
            });
        }
        Err(_) => {
            report.error = Some(format!(
                "{} --version timed out after {}s",
                binary.display(),
                PROBE_TIMEOUT.as_secs()
            ));
        }
    }
    report
}

fn first_line(bytes: &[u8]) -> Option<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}
