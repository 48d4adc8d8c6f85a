//! # Millkit
//!
//! Streams one G-code program to the attached mill and exits with its outcome.
//!
//! ```bash
//! millkit part.nc
//! millkit --config ~/.config/millkit/config.toml part.nc
//! millkit --simulate part.nc
//! ```

use anyhow::{bail, Context};
use clap::Parser;
use millkit::{init_logging, Config, JobState, Machine, MachineEvent, Program, BUILD_DATE, VERSION};
use std::path::{Path, PathBuf};

/// Millkit - headless GRBL mill host
#[derive(Parser, Debug)]
#[command(name = "millkit")]
#[command(version)]
#[command(about = "Stream a G-code program to a GRBL mill")]
#[command(long_about = None)]
struct Args {
    /// Configuration file; the default path is used when it exists
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Use the built-in simulated controller regardless of configuration
    #[arg(short = 's', long)]
    simulate: bool,

    /// G-code program to run
    program: PathBuf,
}

fn program_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref()).context("loading configuration")?;
    if args.simulate {
        config.connection.simulation = true;
    }
    init_logging(config.logging.json)?;
    tracing::info!("millkit {} (built {})", VERSION, BUILD_DATE);

    let text = std::fs::read_to_string(&args.program)
        .with_context(|| format!("reading {}", args.program.display()))?;
    let program = Program::from_text(program_name(&args.program), &text);

    let machine = Machine::from_config(config)?;
    let kind = machine.connect()?;
    tracing::info!("Connected ({})", kind);
    machine.start_loops();

    let mut events = machine.subscribe();
    let reporter = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(MachineEvent::Snapshot(snapshot)) => match snapshot.to_json() {
                    Ok(json) => tracing::debug!("{}", json),
                    Err(e) => tracing::warn!("Snapshot serialization failed: {}", e),
                },
                Ok(MachineEvent::LineDispatched(_)) | Ok(MachineEvent::LineAcknowledged(_)) => {}
                Ok(event) => tracing::info!("{}", event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("Reporter skipped {} events", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    machine.load(program)?;
    machine.start()?;

    let outcome = tokio::select! {
        outcome = machine.wait_for_job() => outcome,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, stopping job");
            machine.stop().map(|()| JobState::Stopped)
        }
    };

    let snapshot = machine.snapshot();
    machine.shutdown().await;
    machine.disconnect()?;
    reporter.abort();

    match outcome? {
        JobState::Completed => {
            tracing::info!(
                "Job finished: {}/{} lines, work position {}",
                snapshot.current_line,
                snapshot.total_lines,
                snapshot.work_position
            );
            Ok(())
        }
        other => bail!("job ended {}", other),
    }
}
