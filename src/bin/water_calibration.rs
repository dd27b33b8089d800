//! Headless water calibration: alternate the left and right valves.

use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info, warn};
use trialsm::config::{build_executor, RigConfig};
use trialsm::core::StateMatrix;
use trialsm::session::{attach, SessionController};
use trialsm::tasks::{CalibrationParams, WaterCalibration};

/// Calibrate water delivery by opening each valve for a fixed time.
#[derive(Parser, Debug)]
#[command(name = "water_calibration", version, about)]
struct Args {
    /// Rig configuration file (TOML). Defaults to an emulated rig.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of trials to run.
    #[arg(short = 'n', long, default_value_t = 100)]
    trials: u32,

    /// Left valve open time in seconds.
    #[arg(long, default_value_t = 0.1)]
    left: f64,

    /// Right valve open time in seconds.
    #[arg(long, default_value_t = 0.1)]
    right: f64,

    /// Delay between valves in seconds.
    #[arg(long, default_value_t = 0.5)]
    delay: f64,

    /// Write the trial reports to this file as JSON.
    #[arg(long)]
    report: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> trialsm::Result<()> {
    let args = Args::parse();
    trialsm::logging::init(&args.log);

    let mut rig = match &args.config {
        Some(path) => RigConfig::load(path)?,
        None => RigConfig::emulated(["Lin", "Cin", "Rin"], ["ValveL", "ValveR"]),
    };
    rig.session.max_trials = Some(args.trials);

    let executor = build_executor(&rig)?;
    info!(interface = executor.name(), "Connecting");
    let session = SessionController::spawn(executor, rig.session.clone()).await?;

    let params = CalibrationParams {
        left_valve_duration: args.left,
        right_valve_duration: args.right,
        inter_valve_delay: args.delay,
        n_trials: args.trials,
    };
    let matrix = StateMatrix::new(rig.inputs.clone(), rig.outputs.clone())?;
    let calibration = attach(session.clone(), WaterCalibration::new(matrix, params));

    session.start().await?;
    tokio::select! {
        idle = session.wait_idle() => idle?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping session");
            session.stop().await?;
        }
    }
    session.shutdown().await?;

    let calibration = match calibration.await {
        Ok(task) => task,
        Err(e) => {
            error!(error = %e, "Calibration task failed");
            return Ok(());
        }
    };
    info!(trials = calibration.trials_completed(), "Calibration finished");

    if let Some(path) = &args.report {
        let file = std::io::BufWriter::new(std::fs::File::create(path)?);
        serde_json::to_writer_pretty(file, calibration.reports())?;
        info!(path = %path.display(), "Wrote trial reports");
    }
    Ok(())
}
