#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! CLI entrypoint for the self-calibration engine.
//!
//! Responsibilities:
//! - Parse config/flags and assemble the simulated rig, tracker, and solver
//! - Initialize tracing and manage log sinks
//! - Drive the engine frame loop and surface keyframe events
//! - Map Ctrl-C onto the engine's cooperative cancel flag

mod cli;
mod run;
mod tracing_setup;

use std::fs;

use clap::Parser;
use eyre::WrapErr;
use selfcal_config::Config;

use cli::{Cli, Commands};
use run::{RunOpts, run};
use tracing_setup::init_tracing;

fn main() -> eyre::Result<()> {
    let _ = color_eyre::install();

    let cli = Cli::parse();

    // 1) Load typed config from TOML
    let cfg_text = fs::read_to_string(&cli.config)
        .wrap_err_with(|| format!("read config {:?}", cli.config))?;
    let cfg: Config =
        toml::from_str(&cfg_text).wrap_err_with(|| format!("parse config {:?}", cli.config))?;

    // Validate configuration with clear errors
    cfg.validate().wrap_err("invalid configuration")?;

    init_tracing(
        cli.json,
        &cli.log_level,
        cfg.logging.file.as_deref(),
        cfg.logging.rotation.as_deref(),
    );

    match cli.cmd {
        Commands::CheckConfig => {
            tracing::info!(config = ?cli.config, "configuration valid");
            Ok(())
        }
        Commands::Run {
            frames,
            drift_at,
            drift_factor,
            imu_log,
            frame_period,
        } => run(
            &cfg,
            &RunOpts {
                frames,
                drift_at,
                drift_factor,
                imu_log,
                frame_period,
            },
        ),
    }
}
