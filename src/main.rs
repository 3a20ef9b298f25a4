//! `mp285` command-line tool
//!
//! One-shot position/move/manipulator commands and the timed well cycle.
//!
//! ```text
//! mp285 --port /dev/ttyUSB0 position
//! mp285 --port COM5 --log log.csv move 3625 4108 9000
//! mp285 --config wells.toml cycle --interval-secs 600
//! ```
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mp285::config::Settings;
use mp285::cycle::{self, WellPlan};
use mp285::event_log::{AlwaysOverwrite, ExistingLog, ExistingLogPolicy, NumberedRename};
use mp285::{Position, Session};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mp285", version, about = "Control a Sutter MP-285 micro-positioner")]
struct Cli {
    /// Settings file (TOML); MP285_* environment variables override it
    #[arg(short, long, default_value = "mp285.toml")]
    config: PathBuf,

    /// Serial port, e.g. /dev/ttyUSB0 or COM5
    #[arg(short, long)]
    port: Option<String>,

    /// Read timeout in seconds
    #[arg(long)]
    timeout_secs: Option<f64>,

    /// CSV event log
    #[arg(short, long)]
    log: Option<PathBuf>,

    /// Overwrite an existing log without asking
    #[arg(long)]
    overwrite: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the current position in µm
    Position,
    /// Move to an absolute position in µm and wait for completion
    Move {
        #[arg(allow_negative_numbers = true)]
        x: f64,
        #[arg(allow_negative_numbers = true)]
        y: f64,
        #[arg(allow_negative_numbers = true)]
        z: f64,
    },
    /// Print the active manipulator
    Manipulator,
    /// Cycle through the configured wells until Ctrl-C
    Cycle {
        /// Seconds between moves
        #[arg(long)]
        interval_secs: Option<u64>,
        /// Seconds to wait before the first move
        #[arg(long)]
        settle_secs: Option<u64>,
        /// Stop after this many moves
        #[arg(long)]
        count: Option<usize>,
    },
}

/// Asks on the terminal before touching an existing log.
struct PromptPolicy;

impl ExistingLogPolicy for PromptPolicy {
    fn decide(&self, existing: &Path) -> ExistingLog {
        match prompt_existing(existing) {
            Ok(decision) => decision,
            Err(e) => {
                error!("Cannot prompt for log handling ({}), keeping existing file", e);
                NumberedRename.decide(existing)
            }
        }
    }
}

fn prompt_existing(existing: &Path) -> std::io::Result<ExistingLog> {
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();

    write!(
        stdout,
        "Logfile {} already exists! Overwrite?\noverwrite (y/n) > ",
        existing.display()
    )?;
    stdout.flush()?;
    let mut answer = String::new();
    stdin.lock().read_line(&mut answer)?;
    if answer.trim().eq_ignore_ascii_case("y") {
        writeln!(stdout, "Overwriting...")?;
        return Ok(ExistingLog::Overwrite);
    }

    write!(stdout, "input new path: ")?;
    stdout.flush()?;
    let mut new_path = String::new();
    stdin.lock().read_line(&mut new_path)?;
    let new_path = new_path.trim();
    if new_path.is_empty() {
        return Ok(NumberedRename.decide(existing));
    }
    Ok(ExistingLog::RenameTo(PathBuf::from(new_path)))
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut settings = Settings::extract(&cli.config)
        .with_context(|| format!("Failed to load settings from {}", cli.config.display()))?;

    if let Some(port) = cli.port {
        settings.stage.port = port;
    }
    if let Some(timeout_secs) = cli.timeout_secs {
        settings.stage.timeout_secs = timeout_secs;
    }
    if let Some(log) = cli.log {
        settings.log.path = Some(log);
    }
    if let Command::Cycle {
        interval_secs,
        settle_secs,
        count,
    } = &cli.command
    {
        if let Some(secs) = interval_secs {
            settings.cycle.interval_secs = *secs;
        }
        if let Some(secs) = settle_secs {
            settings.cycle.settle_secs = *secs;
        }
        if count.is_some() {
            settings.cycle.count = *count;
        }
    }
    settings.validate()?;

    let policy: Box<dyn ExistingLogPolicy> = if cli.overwrite {
        Box::new(AlwaysOverwrite)
    } else {
        Box::new(PromptPolicy)
    };

    // No device, no point continuing: a connection failure ends the process.
    let session = Session::open(settings.stage.clone(), &settings.log, policy.as_ref())
        .await
        .with_context(|| format!("Could not start MP-285 session on '{}'", settings.stage.port))?;

    let outcome = execute(&session, &settings, cli.command).await;
    session.close().await;
    outcome
}

async fn execute(session: &Session, settings: &Settings, command: Command) -> Result<()> {
    match command {
        Command::Position => {
            let position = session.query().await?;
            println!("{}", position);
        }
        Command::Move { x, y, z } => {
            let target = Position::new(x, y, z);
            session.move_to(target).await?;
            println!("{}", target);
        }
        Command::Manipulator => {
            let manipulator = session.query_manipulator().await?;
            println!("{}", manipulator);
        }
        Command::Cycle { .. } => {
            let plan = WellPlan::from(&settings.cycle);
            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for Ctrl-C: {}", e);
                    std::future::pending::<()>().await;
                }
            };
            let report = cycle::run(session, &plan, shutdown).await?;
            info!("Completed {} moves", report.moves);
        }
    }
    Ok(())
}
