use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use extruder_calibration::simulator::{SimulatedRig, SimulatorConfig};
use extruder_calibration::telemetry;
use extruder_calibration::{init_logging, AppConfig, CalibrationManager, ProcedureKind, RunOutcome};
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser, Debug)]
#[command(
    name = "nxcal",
    about = "Run extruder calibration procedures against a simulated encoder and printer"
)]
struct Cli {
    /// JSON configuration file (defaults are used when omitted)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Multiply every settle wait, e.g. 0.001 for a fast dry run
    #[arg(long, global = true)]
    settle_scale: Option<f64>,
    /// Abort the run after this many seconds
    #[arg(long, global = true)]
    abort_after: Option<f64>,
    /// Print a telemetry snapshot after the outcome
    #[arg(long, global = true)]
    telemetry: bool,
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone)]
struct RigArgs {
    /// Steps/mm the simulated printer starts with
    #[arg(long, default_value_t = 93.0)]
    steps_per_mm: f64,
    /// Steps/mm that would extrude exactly as commanded
    #[arg(long, default_value_t = 93.0)]
    true_steps_per_mm: f64,
    /// Flow limit of the simulated hotend in mm³/s
    #[arg(long, default_value_t = 15.0)]
    max_flow: f64,
    /// Uniform measurement noise in mm
    #[arg(long, default_value_t = 0.0)]
    noise: f64,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Correct steps/mm in a coarse and a fine pass
    Esteps(RigArgs),
    /// Measure the spread of 20 identical extrusions
    Consistency(RigArgs),
    /// Search the maximum volumetric flow
    Volumetric(RigArgs),
}

impl Commands {
    fn split(&self) -> (ProcedureKind, &RigArgs) {
        match self {
            Commands::Esteps(rig) => (ProcedureKind::ESteps, rig),
            Commands::Consistency(rig) => (ProcedureKind::Consistency, rig),
            Commands::Volumetric(rig) => (ProcedureKind::Volumetric, rig),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::from(1)
        }
    }
}

async fn run() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => {
            anyhow::ensure!(path.exists(), "config file {} not found", path.display());
            AppConfig::load_from_file(path)
        }
        None => AppConfig::default(),
    };
    if let Some(scale) = cli.settle_scale {
        config.timing.settle_scale = scale;
    }

    let (kind, rig_args) = cli.command.split();
    let rig = SimulatedRig::new(SimulatorConfig {
        steps_per_mm: rig_args.steps_per_mm,
        true_steps_per_mm: rig_args.true_steps_per_mm,
        max_flow_mm3_per_s: rig_args.max_flow,
        noise_mm: rig_args.noise,
        ..SimulatorConfig::default()
    });

    let manager = CalibrationManager::new(config);
    let mut events = manager.subscribe();
    let run = manager
        .start(kind, 0, rig.channels())
        .context("failed to start calibration")?;

    let abort_at = cli
        .abort_after
        .map(|secs| tokio::time::Instant::now() + Duration::from_secs_f64(secs.max(0.0)));
    let mut abort_sent = false;

    loop {
        let pending_abort = abort_at.filter(|_| !abort_sent);
        let deadline = async move {
            match pending_abort {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = deadline => {
                run.abort("abort requested from command line");
                abort_sent = true;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    println!("{}", serde_json::to_string(&event)?);
                    if event.is_terminal() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("[nxcal] Skipped {} progress events", skipped);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    let outcome = run.join().await;
    let mut report = serde_json::to_value(&outcome)?;
    if let Some(fields) = report.as_object_mut() {
        fields.insert(
            "steps_per_mm_after".to_string(),
            serde_json::json!(rig.steps_per_mm()),
        );
    }
    println!("{}", report);

    if cli.telemetry {
        println!("{}", serde_json::to_string(&telemetry::hub().snapshot())?);
    }

    Ok(match outcome {
        RunOutcome::Finished { .. } => ExitCode::SUCCESS,
        RunOutcome::Failed { .. } => ExitCode::from(2),
        RunOutcome::Aborted { .. } => ExitCode::from(3),
    })
}
