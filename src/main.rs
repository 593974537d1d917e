//! Autonomous synthesis campaign runner.
//!
//! Drives the lab supervisor through a closed loop: run an experiment on the
//! simulated rig, measure the product with a synthetic assay, record the
//! outcome, and ask the suggestion engine for the next parameter set. The
//! first run uses the baseline recipe; subsequent runs follow suggestions.

use anyhow::{Context, Result};
use clap::Parser;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use agnw_lab::config::Settings;
use agnw_lab::devices::{DeviceBus, SimulatedRig, SpectrometerChannel};
use agnw_lab::error::LabError;
use agnw_lab::messages::LabCommand;
use agnw_lab::outcome::{ExperimentOutcome, TargetMetric};
use agnw_lab::params::ExperimentParameters;
use agnw_lab::state::ExperimentStatus;
use agnw_lab::supervisor::{self, reply_or_gone};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "agnw_lab", about = "Autonomous silver-nanowire synthesis campaign")]
struct Cli {
    /// Number of experiments to run.
    #[arg(long, default_value_t = 5)]
    runs: usize,

    /// Metric to optimize: aspect_ratio, diameter, or yield.
    #[arg(long, default_value = "aspect_ratio")]
    target: TargetMetric,

    /// Seed for the campaign (suggestions and synthetic assay). Random when
    /// omitted.
    #[arg(long)]
    seed: Option<u64>,

    /// Path to a TOML settings file.
    #[arg(long)]
    config: Option<String>,

    /// Simulated-time multiplier; 600 makes a 60-minute reaction take about
    /// six seconds of wall-clock time.
    #[arg(long, default_value_t = 600.0)]
    time_scale: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::new(cli.config.as_deref())?;
    settings.control.time_scale = cli.time_scale;

    let campaign_seed = cli.seed.unwrap_or_else(rand::random);
    let mut assay_rng = ChaCha8Rng::seed_from_u64(campaign_seed);
    info!(
        runs = cli.runs,
        target = %cli.target,
        seed = campaign_seed,
        "starting campaign"
    );

    let rig = Arc::new(SimulatedRig::new(
        settings.control.ambient_temp_c,
        campaign_seed,
    ));
    let (commands, supervisor_task) = supervisor::spawn(rig.clone(), &settings);

    for run in 1..=cli.runs {
        let params = if run == 1 {
            ExperimentParameters::default()
        } else {
            let (cmd, rx) = LabCommand::suggest_next(cli.target, Some(campaign_seed.wrapping_add(run as u64)));
            commands.send(cmd).await.map_err(|_| LabError::SupervisorGone)?;
            let suggestion = reply_or_gone(rx.await)??;
            info!(
                run,
                confidence = suggestion.confidence,
                predicted = ?suggestion.predicted,
                "suggestion received"
            );
            suggestion.params
        };

        let (cmd, rx) = LabCommand::configure(params);
        commands.send(cmd).await.map_err(|_| LabError::SupervisorGone)?;
        reply_or_gone(rx.await)??;

        let (cmd, rx) = LabCommand::start();
        commands.send(cmd).await.map_err(|_| LabError::SupervisorGone)?;
        reply_or_gone(rx.await)??;
        info!(
            run,
            temperature_c = params.temperature_c,
            stirring_rpm = params.stirring_rpm,
            duration_min = params.reaction_time_min,
            "experiment started"
        );

        // Poll until the run leaves the active states.
        let status = loop {
            tokio::time::sleep(settings.control.tick_period).await;
            let (cmd, rx) = LabCommand::get_status();
            commands.send(cmd).await.map_err(|_| LabError::SupervisorGone)?;
            let state = reply_or_gone(rx.await)?;
            match state.status {
                ExperimentStatus::Running | ExperimentStatus::Paused => continue,
                other => break other,
            }
        };

        if status == ExperimentStatus::Error {
            warn!(run, "run faulted; acknowledging and continuing campaign");
            let (cmd, rx) = LabCommand::acknowledge();
            commands.send(cmd).await.map_err(|_| LabError::SupervisorGone)?;
            reply_or_gone(rx.await)??;
            continue;
        }

        // In-situ absorbance check before the product leaves the rig.
        match rig.read_spectrum(SpectrometerChannel::UvVis).await {
            Ok(spectrum) => {
                let peak = spectrum
                    .iter()
                    .copied()
                    .max_by(|a, b| a.1.total_cmp(&b.1));
                if let Some((wavelength_nm, absorbance)) = peak {
                    info!(run, wavelength_nm, absorbance, "UV-Vis plasmon peak");
                }
            }
            Err(cause) => warn!(run, %cause, "UV-Vis read failed; skipping"),
        }

        let outcome = synthetic_assay(&params, &mut assay_rng)
            .context("synthetic assay produced an invalid outcome")?;
        let (cmd, rx) = LabCommand::record_outcome(outcome);
        commands.send(cmd).await.map_err(|_| LabError::SupervisorGone)?;
        let record = reply_or_gone(rx.await)??;
        info!(
            run,
            id = record.id,
            diameter_nm = outcome.diameter_nm,
            length_um = outcome.length_um,
            yield_percent = outcome.yield_percent,
            aspect_ratio = outcome.aspect_ratio(),
            "outcome recorded"
        );
    }

    let (cmd, rx) = LabCommand::get_history();
    commands.send(cmd).await.map_err(|_| LabError::SupervisorGone)?;
    let history = reply_or_gone(rx.await)?;
    let best = history.iter().max_by(|a, b| {
        cli.target
            .value_of(&a.outcome)
            .total_cmp(&cli.target.value_of(&b.outcome))
    });
    match best {
        Some(record) => {
            info!(
                id = record.id,
                value = cli.target.value_of(&record.outcome),
                target = %cli.target,
                "campaign best"
            );
            // Machine-readable summary for downstream analysis.
            println!("{}", serde_json::to_string_pretty(record.as_ref())?);
        }
        None => warn!("campaign produced no completed experiments"),
    }

    let (cmd, rx) = LabCommand::shutdown();
    commands.send(cmd).await.map_err(|_| LabError::SupervisorGone)?;
    reply_or_gone(rx.await)?;
    supervisor_task.await.context("supervisor task panicked")?;
    Ok(())
}

/// Synthetic characterization of the product a parameter set would produce.
///
/// A smooth ground-truth surface with an optimum inside the design space:
/// thin wires favor moderate temperature and generous PVP, length grows with
/// reaction time, and yield peaks near the baseline AgNO3 loading.
fn synthetic_assay(
    params: &ExperimentParameters,
    rng: &mut ChaCha8Rng,
) -> Result<ExperimentOutcome, LabError> {
    let temp_dev = (params.temperature_c - 160.0) / 20.0;
    let pvp_factor = (params.pvp_volume_ml / 10.0).clamp(0.2, 2.0);

    let diameter_nm = (95.0 + 30.0 * temp_dev * temp_dev - 10.0 * (pvp_factor - 1.0)
        + rng.gen_range(-5.0..=5.0))
    .max(20.0);
    let length_um = (8.0 + 0.18 * params.reaction_time_min * (1.0 - 0.5 * temp_dev * temp_dev)
        + rng.gen_range(-1.0..=1.0))
    .max(1.0);
    let agno3_dev = (params.agno3_volume_ml - 5.0) / 5.0;
    let yield_percent = (85.0 - 25.0 * agno3_dev * agno3_dev - 10.0 * temp_dev.abs()
        + rng.gen_range(-3.0..=3.0))
    .clamp(0.0, 100.0);

    ExperimentOutcome::new(diameter_nm, length_um, yield_percent)
}
