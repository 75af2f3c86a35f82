#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Config schemas and IMU log parsing for the self-calibration engine.
//!
//! - `Config` and sub-structs are deserialized from TOML and validated.
//! - The IMU CSV loader enforces headers and monotonic timestamps so a
//!   recorded log can be replayed into the interpolation buffer.
use serde::Deserialize;

/// IMU log CSV schema.
///
/// Expected headers:
/// time,gx,gy,gz,ax,ay,az
///
/// Example:
/// time,gx,gy,gz,ax,ay,az
/// 1403636579.75,0.001,-0.002,0.0005,0.02,-0.01,9.79
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct ImuLogRow {
    pub time: f64,
    pub gx: f64,
    pub gy: f64,
    pub gz: f64,
    pub ax: f64,
    pub ay: f64,
    pub az: f64,
}

/// Camera rig description: one camera, flat intrinsics vector plus the
/// camera-from-body transform as a 6-vector (translation, axis-angle).
#[derive(Debug, Deserialize)]
pub struct RigCfg {
    /// Intrinsics in model order, length 4 (pinhole) or 5 (pinhole + FOV w).
    pub cam_params: Vec<f64>,
    pub width: u32,
    pub height: u32,
    /// Camera pose relative to the body/IMU frame; identity when absent.
    #[serde(default)]
    pub t_bc: Option<[f64; 6]>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SelfCalCfg {
    /// Enable the self-calibration subsystem.
    pub enabled: bool,
    /// Priority-queue length (number of retained calibration windows).
    pub num_segments: usize,
    /// Pose count of a candidate calibration window.
    pub segment_length: usize,
    /// Consecutive low-divergence keyframes required to declare drift.
    pub num_change_needed: usize,
    /// Also estimate the camera-to-body transform (requires IMU).
    pub do_imu_self_cal: bool,
    /// Per-parameter weights applied before the log-det score. Length must
    /// match the calibration dimension; empty means all ones.
    pub covariance_weights: Vec<f64>,
    /// Start with the calibration treated as unknown (forces an initial batch).
    pub unknown_calibration: bool,
    /// Also solve the full batch whenever the queue is re-analysed (diagnostics).
    pub compare_with_batch: bool,
}

impl Default for SelfCalCfg {
    fn default() -> Self {
        Self {
            enabled: true,
            num_segments: 5,
            segment_length: 10,
            num_change_needed: 3,
            do_imu_self_cal: false,
            covariance_weights: vec![1.0, 1.0, 1.7, 1.7, 3.2e5],
            unknown_calibration: true,
            compare_with_batch: false,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BaCfg {
    /// Foreground BA horizon in poses.
    pub num_ba_poses: usize,
    /// Foreground solver iterations per keyframe.
    pub num_iterations: usize,
    pub use_dogleg: bool,
    pub use_robust_norm_for_proj: bool,
    /// Per-landmark robust-norm ratio above which a track is marked outlier.
    pub outlier_threshold: f64,
    pub do_outlier_rejection: bool,
    pub regularize_biases_in_batch: bool,
}

impl Default for BaCfg {
    fn default() -> Self {
        Self {
            num_ba_poses: 10,
            num_iterations: 3,
            use_dogleg: true,
            use_robust_norm_for_proj: false,
            outlier_threshold: 1.0,
            do_outlier_rejection: true,
            regularize_biases_in_batch: false,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ImuCfg {
    /// Use inertial measurements at all.
    pub enabled: bool,
    /// Pose count before the visual-inertial BA takes over from visual-only.
    pub min_poses_for_imu: usize,
    /// Added to image timestamps to align the IMU clock.
    pub time_offset: f64,
    pub gyro_sigma: f64,
    pub accel_sigma: f64,
    pub gyro_bias_sigma: f64,
    pub accel_bias_sigma: f64,
    /// Seed the tracker guess from integrated IMU when enough poses exist.
    pub use_for_guess: bool,
}

impl Default for ImuCfg {
    fn default() -> Self {
        Self {
            enabled: false,
            min_poses_for_imu: 30,
            time_offset: 0.0,
            gyro_sigma: 5.3088444e-5,
            accel_sigma: 1.6e-3,
            gyro_bias_sigma: 1.4125375e-5,
            accel_bias_sigma: 1.2589254e-2,
            use_for_guess: true,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AdaptiveCfg {
    /// Run the background adaptive-conditioning loop.
    pub enabled: bool,
    /// Baseline active-window size for the async BA.
    pub num_aac_poses: usize,
    /// Chi-square quantile (p-value) for the conditioning tests.
    pub threshold: f64,
}

impl Default for AdaptiveCfg {
    fn default() -> Self {
        Self {
            enabled: false,
            num_aac_poses: 20,
            threshold: 0.9,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TrackerCfg {
    /// Feature budget; the failure ratio is measured against this.
    pub num_features: usize,
}

impl Default for TrackerCfg {
    fn default() -> Self {
        Self { num_features: 128 }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Logging {
    pub file: Option<String>,  // path to .log (JSON lines)
    pub level: Option<String>, // "info","debug"
    /// Log rotation policy: "never" | "daily" | "hourly" (default: never)
    pub rotation: Option<String>,
    /// Directory for the sigmas/pq/batch/timings diagnostic files.
    pub diagnostics_dir: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub rig: RigCfg,
    #[serde(default)]
    pub selfcal: SelfCalCfg,
    #[serde(default)]
    pub ba: BaCfg,
    #[serde(default)]
    pub imu: ImuCfg,
    #[serde(default)]
    pub adaptive: AdaptiveCfg,
    #[serde(default)]
    pub tracker: TrackerCfg,
    #[serde(default)]
    pub logging: Logging,
}

pub fn load_toml(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}

impl Config {
    pub fn validate(&self) -> eyre::Result<()> {
        // Rig
        let k = self.rig.cam_params.len();
        if !(k == 4 || k == 5) {
            eyre::bail!("rig.cam_params must have 4 or 5 entries, got {k}");
        }
        if self.rig.cam_params.iter().any(|p| !p.is_finite()) {
            eyre::bail!("rig.cam_params must all be finite");
        }
        if self.rig.width == 0 || self.rig.height == 0 {
            eyre::bail!("rig.width and rig.height must be > 0");
        }
        if let Some(t) = &self.rig.t_bc
            && t.iter().any(|v| !v.is_finite())
        {
            eyre::bail!("rig.t_bc components must be finite");
        }

        // Self-cal
        if self.selfcal.num_segments == 0 {
            eyre::bail!("selfcal.num_segments must be >= 1");
        }
        if self.selfcal.segment_length < 2 {
            eyre::bail!("selfcal.segment_length must be >= 2");
        }
        if self.selfcal.num_change_needed == 0 {
            eyre::bail!("selfcal.num_change_needed must be >= 1");
        }
        if self.selfcal.do_imu_self_cal && !self.imu.enabled {
            eyre::bail!("selfcal.do_imu_self_cal requires imu.enabled");
        }
        if !self.selfcal.covariance_weights.is_empty() {
            let d = if self.selfcal.do_imu_self_cal { k + 6 } else { k };
            if self.selfcal.covariance_weights.len() != d {
                eyre::bail!(
                    "selfcal.covariance_weights must have {d} entries, got {}",
                    self.selfcal.covariance_weights.len()
                );
            }
            if self
                .selfcal
                .covariance_weights
                .iter()
                .any(|w| !w.is_finite() || *w <= 0.0)
            {
                eyre::bail!("selfcal.covariance_weights must be finite and > 0");
            }
        }

        // BA
        if self.ba.num_ba_poses < 2 {
            eyre::bail!("ba.num_ba_poses must be >= 2");
        }
        if self.ba.num_iterations == 0 {
            eyre::bail!("ba.num_iterations must be >= 1");
        }
        if !self.ba.outlier_threshold.is_finite() || self.ba.outlier_threshold <= 0.0 {
            eyre::bail!("ba.outlier_threshold must be finite and > 0");
        }

        // IMU
        for (name, v) in [
            ("imu.gyro_sigma", self.imu.gyro_sigma),
            ("imu.accel_sigma", self.imu.accel_sigma),
            ("imu.gyro_bias_sigma", self.imu.gyro_bias_sigma),
            ("imu.accel_bias_sigma", self.imu.accel_bias_sigma),
        ] {
            if !v.is_finite() || v <= 0.0 {
                eyre::bail!("{name} must be finite and > 0");
            }
        }
        if !self.imu.time_offset.is_finite() {
            eyre::bail!("imu.time_offset must be finite");
        }
        if self.imu.min_poses_for_imu < 2 {
            eyre::bail!("imu.min_poses_for_imu must be >= 2");
        }

        // Adaptive
        if self.adaptive.enabled && !self.imu.enabled {
            eyre::bail!("adaptive.enabled requires imu.enabled");
        }
        if self.adaptive.num_aac_poses < 2 {
            eyre::bail!("adaptive.num_aac_poses must be >= 2");
        }
        if !(self.adaptive.threshold > 0.0 && self.adaptive.threshold < 1.0) {
            eyre::bail!("adaptive.threshold must be in (0.0, 1.0)");
        }

        // Tracker
        if self.tracker.num_features == 0 {
            eyre::bail!("tracker.num_features must be >= 1");
        }

        Ok(())
    }
}

/// Load a recorded IMU log with strict `time,gx,gy,gz,ax,ay,az` headers.
/// Timestamps must be strictly increasing.
pub fn load_imu_csv(path: &std::path::Path) -> eyre::Result<Vec<ImuLogRow>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(|e| eyre::eyre!("open IMU log {:?}: {}", path, e))?;

    // Enforce exact headers
    let headers = rdr
        .headers()
        .map_err(|e| eyre::eyre!("read CSV headers {:?}: {}", path, e))?
        .clone();
    let expected = ["time", "gx", "gy", "gz", "ax", "ay", "az"];
    let actual: Vec<String> = headers.iter().map(|s| s.to_string()).collect();
    if actual != expected {
        eyre::bail!(
            "IMU log must have headers 'time,gx,gy,gz,ax,ay,az', got: {}",
            actual.join(",")
        );
    }

    let mut rows: Vec<ImuLogRow> = Vec::new();
    for (idx, rec) in rdr.deserialize::<ImuLogRow>().enumerate() {
        let row = match rec {
            Ok(row) => row,
            Err(e) => eyre::bail!("invalid CSV row {}: {}", idx + 2, e),
        };
        if !row.time.is_finite() {
            eyre::bail!("non-finite timestamp at CSV row {}", idx + 2);
        }
        if let Some(prev) = rows.last()
            && row.time <= prev.time
        {
            eyre::bail!(
                "IMU timestamps must be strictly increasing (row {} went {} -> {})",
                idx + 2,
                prev.time,
                row.time
            );
        }
        rows.push(row);
    }
    Ok(rows)
}
