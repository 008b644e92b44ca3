//! CLI Entry Point for vibroscan
//!
//! Provides command-line interface for:
//! - Running a raster scan (against hardware or the built-in simulators)
//! - Manual stage control: status, jog, home, unlock, zero
//!
//! # Usage
//!
//! Run a simulated scan and save the traces:
//! ```bash
//! vibroscan scan --simulate --output run.json
//! ```
//!
//! Jog the stage:
//! ```bash
//! vibroscan --config config/vibroscan.toml jog X -- -1.5
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{timeout, Instant};
use tracing::{info, warn};

use vibroscan::config::{Settings, DEFAULT_CONFIG_PATH};
use vibroscan::experiment::{ScanOrchestrator, SampleTable};
use vibroscan::hardware::capabilities::{Acquisition, ExcitationSource};
use vibroscan::hardware::grbl::{Axis, RunState};
use vibroscan::hardware::lecroy::LecroyScope;
use vibroscan::hardware::mock::{MockOscilloscope, MockSignalGenerator, SimulatedGrbl};
use vibroscan::hardware::motion::MotionController;
use vibroscan::hardware::tg2512a::Tg2512a;
use vibroscan::logging;

/// How long manual stage commands may take before the CLI gives up waiting.
const MANUAL_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "vibroscan")]
#[command(about = "Laser-vibrometer raster scanner", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured raster scan
    Scan {
        /// Use simulated stage and instruments
        #[arg(long)]
        simulate: bool,

        /// Write the collected traces as JSON
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Print the stage position and state
    Status,

    /// Jog one axis by a relative distance
    Jog {
        /// X, Y or Z
        axis: Axis,

        /// Distance in machine units
        #[arg(allow_hyphen_values = true)]
        distance: f64,
    },

    /// Run the homing cycle
    Home,

    /// Clear an alarm lock
    Unlock,

    /// Make the current position the working origin
    Zero,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    settings.validate()?;
    logging::init_from_settings(&settings)?;

    match cli.command {
        Commands::Scan { simulate, output } => run_scan(&settings, simulate, output).await,
        Commands::Status => manual(&settings, |_| {}).await,
        Commands::Jog { axis, distance } => {
            manual(&settings, move |stage| stage.jog(axis, distance)).await
        }
        Commands::Home => manual(&settings, MotionController::home).await,
        Commands::Unlock => manual(&settings, MotionController::unlock).await,
        Commands::Zero => manual(&settings, MotionController::zero_working_coordinates).await,
    }
}

async fn run_scan(settings: &Settings, simulate: bool, output: Option<PathBuf>) -> Result<()> {
    let params = settings.scan_parameters()?;
    println!(
        "Scanning {} points ({} x {} grid, {} samples each)",
        params.point_count(),
        params.nb_point_x,
        params.nb_point_y,
        params.samples_per_point
    );

    let stage = Arc::new(MotionController::new(settings.stage.clone()));
    let excitation: Arc<dyn ExcitationSource>;
    let acquisition: Arc<dyn Acquisition>;
    // handed back to front-panel control once the scan is over
    let mut generator: Option<Arc<Tg2512a>> = None;
    // keeps the firmware task alive for the duration of the scan
    let _simulator;

    if simulate {
        let (port, grbl) = SimulatedGrbl::spawn();
        stage.connect_with_port(port).await?;
        excitation = Arc::new(MockSignalGenerator::new());
        acquisition = Arc::new(MockOscilloscope::new());
        _simulator = Some(grbl);
    } else {
        stage.connect(&settings.stage.port).await?;
        let tg = Arc::new(Tg2512a::connect(&settings.signal_generator).await?);
        excitation = tg.clone();
        generator = Some(tg);
        acquisition = Arc::new(LecroyScope::connect(&settings.oscilloscope).await?);
        _simulator = None;
    }
    stage.start()?;

    let scan = ScanOrchestrator::new(Arc::clone(&stage), excitation, acquisition, params);
    let abort = scan.abort_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, aborting scan");
            abort.abort();
        }
    });

    let mut progress = scan.subscribe_progress();
    let reporter = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let snapshot = *progress.borrow_and_update();
            info!(%snapshot, "Progress");
            if snapshot.phase.is_terminal() {
                break;
            }
        }
    });

    let result = scan.run().await;
    stage.stop().await?;
    reporter.abort();
    if let Some(generator) = generator {
        if let Err(e) = generator.disconnect().await {
            warn!(error = %format!("{e:#}"), "Signal generator did not return to local control");
        }
    }

    let table = result?;
    println!("Recorded {} traces (run {})", table.len(), table.run_id);
    if let Some(path) = output {
        write_table(&table, &path)?;
        println!("Saved to {}", path.display());
    }
    Ok(())
}

fn write_table(table: &SampleTable, path: &Path) -> Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("creating {}", path.display()))?;
    serde_json::to_writer_pretty(std::io::BufWriter::new(file), table)
        .context("serializing sample table")?;
    Ok(())
}

/// Connect, run one manual action, wait for the stage to come to rest, print where
/// it ended up.
async fn manual<F>(settings: &Settings, action: F) -> Result<()>
where
    F: FnOnce(&MotionController),
{
    let stage = MotionController::new(settings.stage.clone());
    stage.connect(&settings.stage.port).await?;
    stage.start()?;

    let mut updates = stage.subscribe();
    action(&stage);

    // Give the consumer time to forward the command, then wait for an idle report.
    let started = Instant::now();
    let settle_after = settings.stage.poll_interval * 2;
    let waited = timeout(MANUAL_COMMAND_TIMEOUT, async {
        loop {
            match updates.recv().await {
                Ok(update)
                    if started.elapsed() >= settle_after
                        && matches!(update.state, RunState::Idle | RunState::Alarm) =>
                {
                    break
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    })
    .await;
    if waited.is_err() {
        warn!("Stage did not report idle in time");
    }

    let snapshot = stage.snapshot();
    stage.stop().await?;

    println!("State:   {:?}", snapshot.run_state);
    println!(
        "Machine: X{:.3} Y{:.3} Z{:.3}",
        snapshot.machine.x, snapshot.machine.y, snapshot.machine.z
    );
    println!(
        "Working: X{:.3} Y{:.3} Z{:.3}",
        snapshot.working.x, snapshot.working.y, snapshot.working.z
    );
    Ok(())
}
