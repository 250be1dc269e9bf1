//! `pcr` - replay PCAP captures with tcpreplay.
//!
//! `pcr run` streams status and progress events to stdout as JSON lines;
//! logs go to stderr.

use clap::{ArgAction, Args, Parser, Subcommand};
use pcr_common::{
    CaptureFile, Error, HistoryQuery, HistoryRecord, ReplayConfiguration, Result, SpeedUnit,
    StatusFilter,
};
use pcr_config::{resolve_config, validate_request, ConfigPaths, EngineSettings};
use pcr_core::exit_codes::ExitCode;
use pcr_core::launcher::{probe, LaunchPlan};
use pcr_core::logging::{default_level, init_logging, LogFormat};
use pcr_core::{ReplayEngine, ReplayEvent, ReplayRequest};
use pcr_history::{HistoryStore, SqliteHistoryStore};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "pcr")]
#[command(version, about = "Replay PCAP captures onto a network interface", long_about = None)]
struct Cli {
    /// Configuration file (overrides PCR_CONFIG and the XDG location)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Human, global = true)]
    log_format: LogFormat,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replay a capture, streaming events as JSON lines (Ctrl-C stops)
    Run(ReplayArgs),

    /// Validate replay parameters and print the command that would run
    Validate(ReplayArgs),

    /// Inspect and maintain replay history
    #[command(subcommand)]
    History(HistoryCommands),

    /// Show resolved configuration
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Check that the replay binary (and optionally an interface) is usable
    Probe {
        #[arg(short, long)]
        interface: Option<String>,
    },
}

#[derive(Args, Debug)]
struct ReplayArgs {
    /// Capture file to replay
    capture: PathBuf,

    /// Network interface to transmit on
    #[arg(short, long)]
    interface: String,

    /// Speed value, interpreted according to --unit
    #[arg(short, long, default_value_t = 1.0)]
    speed: f64,

    /// Speed unit: multiplier or pps
    #[arg(long, default_value = "multiplier")]
    unit: SpeedUnit,

    /// Replay repeatedly until stopped
    #[arg(long)]
    continuous: bool,

    /// Number of passes (ignored with --continuous)
    #[arg(long)]
    loops: Option<u32>,

    /// Load the capture into memory before sending
    #[arg(long)]
    preload: bool,

    /// Logical file identifier (defaults to the file stem)
    #[arg(long)]
    file_id: Option<String>,

    /// Packet count from capture analysis, enables percent complete
    #[arg(long)]
    total_packets: Option<u64>,
}

impl ReplayArgs {
    fn file_id(&self) -> String {
        self.file_id.clone().unwrap_or_else(|| {
            self.capture
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "capture".to_string())
        })
    }

    fn config(&self) -> ReplayConfiguration {
        let mut config = ReplayConfiguration::new(self.file_id(), self.interface.clone(), self.speed)
            .with_unit(self.unit);
        config.continuous = self.continuous;
        config.loop_count = self.loops;
        config.preload = self.preload;
        config
    }

    fn capture(&self) -> Result<CaptureFile> {
        let meta = fs::metadata(&self.capture)?;
        let mut capture = CaptureFile::from_path(self.file_id(), &self.capture, meta.len());
        capture.total_packets = self.total_packets;
        Ok(capture)
    }
}

#[derive(Subcommand, Debug)]
enum HistoryCommands {
    /// List sessions, newest first
    List {
        #[arg(long, default_value_t = 20)]
        limit: u32,
        #[arg(long, default_value_t = 0)]
        offset: u32,
        /// Case-insensitive match on capture name or interface
        #[arg(long)]
        search: Option<String>,
        /// Status filter (completed, failed, stopped, or all)
        #[arg(long, default_value = "all")]
        status: StatusFilter,
        /// Print the page as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show one session by history id or session id
    Show { id: String },

    /// Keep only the newest entries
    Prune {
        /// Entries to keep (defaults to history.retain)
        #[arg(long)]
        keep: Option<u32>,
    },

    /// Delete all history
    Clear {
        /// Required confirmation
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print the effective settings as TOML
    Show,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = init_logging(cli.log_format, default_level(cli.verbose, cli.quiet)) {
        eprintln!("warning: {}", e);
    }

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(code = e.code(), error = %e, "command failed");
            eprintln!("error: {}", e);
            ExitCode::from_error(&e)
        }
    };
    std::process::exit(code.as_i32());
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let (settings, paths) = resolve_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Run(args) => cmd_run(settings, &args).await,
        Commands::Validate(args) => cmd_validate(&settings, &args),
        Commands::History(cmd) => cmd_history(&settings, &paths, cmd),
        Commands::Config(ConfigCommands::Show) => cmd_config_show(&settings, &paths),
        Commands::Probe { interface } => {
            let report = probe(&settings, interface.as_deref()).await;
            print_json(&report)?;
            let usable = report.available && report.interface_present != Some(false);
            Ok(if usable {
                ExitCode::Clean
            } else {
                ExitCode::LaunchError
            })
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

async fn cmd_run(settings: EngineSettings, args: &ReplayArgs) -> Result<ExitCode> {
    let request = ReplayRequest::new(args.config(), args.capture()?);
    let engine = ReplayEngine::open(settings)?;
    let mut events = engine.subscribe();

    let receipt = engine.start(request).await?;
    print_json(&serde_json::json!({ "event": "started", "receipt": receipt }))?;

    let mut stop_task = None;
    let mut interrupts = true;
    let mut final_status = None;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    print_json(&event)?;
                    if let ReplayEvent::Status(status) = &event {
                        if status.status.is_terminal() && status.session_id == receipt.session_id {
                            final_status = Some(status.status);
                            break;
                        }
                    }
                }
                None => break,
            },
            signal = tokio::signal::ctrl_c(), if interrupts => {
                interrupts = false;
                match signal {
                    Ok(()) => {
                        info!(session_id = %receipt.session_id, "interrupt received, stopping replay");
                        let engine = engine.clone();
                        stop_task = Some(tokio::spawn(async move { engine.stop().await }));
                    }
                    Err(e) => warn!(error = %e, "cannot listen for interrupts"),
                }
            }
        }
    }

    if let Some(task) = stop_task {
        match task.await {
            Ok(Ok(outcome)) => info!(?outcome, "stop finished"),
            Ok(Err(e)) => warn!(error = %e, "stop failed"),
            Err(e) => warn!(error = %e, "stop task failed"),
        }
    }

    let status = match final_status {
        Some(status) => Some(status),
        None => engine.wait_idle().await.map(|s| s.status),
    };
    Ok(status.map(ExitCode::from_status).unwrap_or(ExitCode::InternalError))
}

fn cmd_validate(settings: &EngineSettings, args: &ReplayArgs) -> Result<ExitCode> {
    let config = validate_request(&args.config(), &settings.limits)?;
    let capture = args.capture()?;
    let plan = LaunchPlan::new(&config, &capture, settings);
    print_json(&serde_json::json!({
        "valid": true,
        "config": config,
        "capture": capture,
        "command": plan.command_line(),
    }))?;
    Ok(ExitCode::Clean)
}

fn open_store(paths: &ConfigPaths) -> Result<SqliteHistoryStore> {
    Ok(SqliteHistoryStore::open(&paths.history_db)?)
}

fn cmd_history(settings: &EngineSettings, paths: &ConfigPaths, cmd: HistoryCommands) -> Result<ExitCode> {
    let store = open_store(paths)?;
    match cmd {
        HistoryCommands::List {
            limit,
            offset,
            search,
            status,
            json,
        } => {
            let mut query = HistoryQuery::page(limit, offset).with_status(status);
            query.search = search;
            let page = store.query(&query)?;
            if json {
                print_json(&page)?;
            } else {
                print_history_table(&page.entries);
                println!(
                    "{} of {} entries (offset {}){}",
                    page.entries.len(),
                    page.total_count,
                    page.offset,
                    if page.has_more { ", more available" } else { "" }
                );
            }
            Ok(ExitCode::Clean)
        }
        HistoryCommands::Show { id } => {
            let found = match id.parse::<i64>() {
                Ok(row) => store.get(row)?,
                Err(_) => store.find_by_session(&id)?,
            };
            match found {
                Some(record) => {
                    println!("{}", serde_json::to_string_pretty(&record)?);
                    Ok(ExitCode::Clean)
                }
                None => Err(Error::SessionNotFound { session_id: id }),
            }
        }
        HistoryCommands::Prune { keep } => {
            let keep = keep.or(settings.history.retain).ok_or_else(|| {
                Error::Validation("--keep is required when history.retain is not configured".into())
            })?;
            let removed = store.prune(keep)?;
            print_json(&serde_json::json!({ "removed": removed, "kept": keep }))?;
            Ok(ExitCode::Clean)
        }
        HistoryCommands::Clear { yes } => {
            if !yes {
                return Err(Error::Validation("refusing to clear history without --yes".into()));
            }
            let removed = store.clear()?;
            print_json(&serde_json::json!({ "removed": removed }))?;
            Ok(ExitCode::Clean)
        }
    }
}

fn print_history_table(entries: &[HistoryRecord]) {
    println!(
        "{:>6}  {:<30}  {:<9}  {:<10}  {:<24}  {:>10}  {:>8}  {}",
        "ID", "SESSION", "STATUS", "INTERFACE", "CAPTURE", "PACKETS", "SECS", "STARTED"
    );
    for e in entries {
        println!(
            "{:>6}  {:<30}  {:<9}  {:<10}  {:<24}  {:>10}  {:>8.1}  {}",
            e.id,
            e.session_id,
            e.status,
            e.interface,
            truncate(&e.capture_filename, 24),
            e.packets_sent,
            e.duration_secs,
            e.started_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
}

fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        s.to_string()
    } else {
        let head: String = s.chars().take(width.saturating_sub(1)).collect();
        format!("{}…", head)
    }
}

fn cmd_config_show(settings: &EngineSettings, paths: &ConfigPaths) -> Result<ExitCode> {
    let rendered = settings
        .to_toml()
        .map_err(|e| Error::Config(format!("failed to render settings: {}", e)))?;
    match &paths.config_file {
        Some(path) => println!("# config file: {}", path.display()),
        None => println!("# config file: (defaults)"),
    }
    println!("# data dir: {}", paths.data_dir.display());
    println!("# history db: {}", paths.history_db.display());
    print!("{}", rendered);
    Ok(ExitCode::Clean)
}
