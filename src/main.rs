//! CLI entry point for tomo_daq
//!
//! Run a scan document:
//! ```bash
//! tomo_daq run scan.yaml --mode debug
//! tomo_daq run scan.yaml --scan-mode fly --config tomo_daq.toml
//! ```
//!
//! Print the command sequence without touching devices:
//! ```bash
//! tomo_daq summarize scan.yaml
//! ```
//!
//! This binary carries no hardware drivers, so only `debug` mode binds here.
//! Beamline deployments register a `LiveBackend` in their own entry point.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tracing::info;

use tomo_daq::config::SessionConfig;
use tomo_daq::documents::Document;
use tomo_daq::engine::{summarize, Plan, RunEngine, ScanResult};
use tomo_daq::logging::{self, LogFormat, LoggingConfig};
use tomo_daq::mode::{Mode, ModeController};
use tomo_daq::output::OutputConfigurator;
use tomo_daq::scan::{ScanConfig, ScanMode};

#[derive(Parser)]
#[command(name = "tomo_daq")]
#[command(about = "Tomography scan sequencing for synchrotron endstations", long_about = None)]
struct Cli {
    /// Session configuration file
    #[arg(long, global = true, default_value = "tomo_daq.toml")]
    config: PathBuf,

    /// Log line format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ScanModeArg {
    Step,
    Fly,
}

impl From<ScanModeArg> for ScanMode {
    fn from(arg: ScanModeArg) -> Self {
        match arg {
            ScanModeArg::Step => ScanMode::Step,
            ScanModeArg::Fly => ScanMode::Fly,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scan document
    Run {
        /// Path to the YAML scan document
        scan: PathBuf,

        /// Device binding mode (overrides the session config)
        #[arg(long, value_enum)]
        mode: Option<Mode>,

        /// Projection sub-mode (overrides the scan document)
        #[arg(long, value_enum)]
        scan_mode: Option<ScanModeArg>,
    },

    /// Print the commands a scan would issue
    Summarize {
        /// Path to the YAML scan document
        scan: PathBuf,

        /// Projection sub-mode (overrides the scan document)
        #[arg(long, value_enum)]
        scan_mode: Option<ScanModeArg>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let session = SessionConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    logging::init(LoggingConfig::from_session_config(&session)?.with_format(cli.log_format))?;

    match cli.command {
        Commands::Run {
            scan,
            mode,
            scan_mode,
        } => run_scan(session, scan, mode, scan_mode).await,
        Commands::Summarize { scan, scan_mode } => summarize_scan(&session, scan, scan_mode),
    }
}

fn load_scan(path: &Path, scan_mode: Option<ScanModeArg>) -> Result<(ScanConfig, ScanMode)> {
    let config = ScanConfig::load(path).with_context(|| format!("loading {}", path.display()))?;
    let mode = scan_mode.map_or(config.mode, ScanMode::from);
    Ok((config, mode))
}

async fn run_scan(
    session: SessionConfig,
    path: PathBuf,
    mode: Option<Mode>,
    scan_mode: Option<ScanModeArg>,
) -> Result<()> {
    let (scan, scan_mode) = load_scan(&path, scan_mode)?;
    let mode = mode.unwrap_or(session.session.mode);

    let devices = ModeController::new().bind(mode).await?;
    let engine = RunEngine::new(devices, session);

    let mut docs = engine.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(doc) = docs.recv().await {
            if let Document::Stop(stop) = doc {
                info!(exit_status = %stop.exit_status, events = stop.num_events, "Run stopped");
                break;
            }
        }
    });

    let result = engine.run(&scan, scan_mode).await?;
    let _ = printer.await;

    match result {
        ScanResult::Success(summary) => {
            println!(
                "Scan {} complete: {} projections, {} triggers, {} frames archived via {}",
                summary.run_id,
                summary.n_projections,
                summary.triggers,
                summary.archived,
                summary.sink
            );
            Ok(())
        }
        ScanResult::Failed(failure) => {
            anyhow::bail!(
                "Scan {} failed during {}: {}",
                failure.run_id,
                failure.phase,
                failure.error
            )
        }
    }
}

fn summarize_scan(
    session: &SessionConfig,
    path: PathBuf,
    scan_mode: Option<ScanModeArg>,
) -> Result<()> {
    let (scan, scan_mode) = load_scan(&path, scan_mode)?;
    let output = OutputConfigurator::from_session(&session.session);
    let mut plan = tomo_daq::engine::TomoScan::from_config(&scan, scan_mode, &output)?;

    println!(
        "{}: {} projections, {} archived frames",
        plan.plan_name(),
        plan.num_points(),
        scan.total_images()
    );
    for (i, cmd) in summarize(&mut plan).iter().enumerate() {
        println!("{:>5}  {}", i + 1, cmd);
    }
    Ok(())
}
