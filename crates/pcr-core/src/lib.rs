//! PCAP replay core.
//!
//! Launches and supervises `tcpreplay`, classifies its outcome, streams
//! status and progress to observers, and records every finished session to
//! history. Continuous replays are driven by relaunching the process after
//! each clean pass until stopped.

pub mod engine;
pub mod events;
pub mod exit_codes;
pub mod launcher;
pub mod logging;
pub mod output;
pub mod sampler;
pub mod session;
pub mod supervisor;

pub use engine::{ReplayEngine, ReplayRequest, StartReceipt, StatusReport, StopOutcome};
pub use events::{EventPublisher, ReplayEvent, StatusEvent, Subscription};
pub use exit_codes::ExitCode;
pub use launcher::{
    ExitOutcome, LaunchError, LaunchPlan, Launcher, ProcessControl, ProcessHandle,
    TcpreplayLauncher,
};
pub use session::{classify_exit, ExitDecision, ReplaySession, SessionCell, SessionSnapshot};
pub use supervisor::SupervisorTiming;
