//! CLI argument definitions and shared statics.

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::OnceLock;

pub static FILE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(name = "selfcal", version, about = "Online self-calibration engine")]
pub struct Cli {
    /// Path to config TOML (typed)
    #[arg(long, value_name = "FILE", default_value = "etc/selfcal.toml")]
    pub config: PathBuf,

    /// Log as JSON lines instead of pretty
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,

    /// Console log level (error|warn|info|debug|trace)
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// Command to execute
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the engine over a simulated sequence.
    Run {
        /// Number of image frames to feed
        #[arg(long, default_value_t = 200)]
        frames: usize,

        /// Scale fx by `drift-factor` at this frame (drift injection)
        #[arg(long)]
        drift_at: Option<usize>,

        /// Multiplier applied to fx at `drift-at`
        #[arg(long, default_value_t = 1.1)]
        drift_factor: f64,

        /// Replay a recorded IMU log (CSV: time,gx,gy,gz,ax,ay,az)
        /// instead of synthesizing samples
        #[arg(long, value_name = "FILE")]
        imu_log: Option<PathBuf>,

        /// Frame period in seconds
        #[arg(long, default_value_t = 0.1)]
        frame_period: f64,
    },
    /// Parse and validate the config, then exit.
    CheckConfig,
}
