//! Front-end state machine and the per-keyframe self-calibration controller.
//!
//! `SelfCalEngine` owns what the pipeline shares: the pose/track store under
//! the BA mutex, the tracker, the foreground BA instances, the online
//! calibrator, and the background adaptive-conditioning thread. Frames are
//! fed through `process_frame`; everything else happens internally.
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel as xch;
use nalgebra::{DVector, Isometry3, Matrix3, Rotation3, UnitQuaternion, Vector2, Vector3};
use selfcal_traits::clock::{Clock, MonotonicClock};
use selfcal_traits::{BaMode, BaSolver, BaSolverFactory, FeatureTracker};

use crate::aac::{AacConfig, AdaptiveConditioning};
use crate::ba::{self, BaRunSpec, BaTuning, RigSource, horizon_segment};
use crate::calibrator::OnlineCalibrator;
use crate::detect::{ChangeDetector, DriftDecision, batch_recalibration_complete};
use crate::error::{BuildError, Result};
use crate::imu::{ImuBuffer, integrate_measurements};
use crate::logs::CalibLogs;
use crate::rig::Rig;
use crate::store::{FOREGROUND_SLOT, KeyframePose, Shared, SharedState, lock};
use crate::track::{FeatureTrack, Observation, RefKeypoint};
use crate::window::{CalibrationWindow, CovarianceWeights};
use crate::{queue::AdmitOutcome, stats};

/// Solver iterations for calibration posterior solves.
const SELFCAL_ITERATIONS: usize = 50;
/// Minimum successful tracks before the tracker result is trusted with IMU.
const TRACKING_FAILURE_MIN_TRACKS: usize = 10;
/// Fraction of the feature budget that must track for the motion-model guess.
const GUESS_MIN_SUCCESS_RATIO: f64 = 0.3;
const KEYFRAME_TRACK_RATIO: f64 = 0.8;
const KEYFRAME_TRANSLATION_M: f64 = 0.2;
const KEYFRAME_ROTATION_RAD: f64 = 0.1;
/// How long the foreground waits for the IMU buffer to cover a frame.
const IMU_WAIT: Duration = Duration::from_millis(100);

/// Runtime configuration, assembled from `selfcal_config::Config` or built
/// directly in tests.
#[derive(Debug, Clone)]
pub struct EngineCfg {
    pub do_self_cal: bool,
    pub num_self_cal_segments: usize,
    pub self_cal_segment_length: usize,
    pub num_change_needed: usize,
    pub do_imu_self_cal: bool,
    pub unknown_cam_calibration: bool,
    pub unknown_imu_calibration: bool,
    pub compare_self_cal_with_batch: bool,
    pub covariance_weights: Vec<f64>,

    pub use_imu: bool,
    pub min_poses_for_imu: usize,
    pub imu_time_offset: f64,
    pub use_imu_for_guess: bool,

    pub num_ba_poses: usize,
    pub num_ba_iterations: usize,

    pub do_adaptive: bool,
    pub num_aac_poses: usize,
    pub adaptive_threshold: f64,

    pub num_features: usize,
    /// Inverse depth assigned to freshly seeded tracks.
    pub default_rho: f64,
    pub tuning: BaTuning,
    /// Directory for sigmas/pq/batch/timings files; None disables them.
    pub diagnostics_dir: Option<PathBuf>,
}

impl Default for EngineCfg {
    fn default() -> Self {
        Self {
            do_self_cal: true,
            num_self_cal_segments: 5,
            self_cal_segment_length: 10,
            num_change_needed: 3,
            do_imu_self_cal: false,
            unknown_cam_calibration: true,
            unknown_imu_calibration: false,
            compare_self_cal_with_batch: false,
            covariance_weights: vec![1.0, 1.0, 1.7, 1.7, 3.2e5],
            use_imu: false,
            min_poses_for_imu: 30,
            imu_time_offset: 0.0,
            use_imu_for_guess: true,
            num_ba_poses: 10,
            num_ba_iterations: 3,
            do_adaptive: false,
            num_aac_poses: 20,
            adaptive_threshold: 0.9,
            num_features: 128,
            default_rho: 1.0,
            tuning: BaTuning::default(),
            diagnostics_dir: None,
        }
    }
}

impl EngineCfg {
    /// Build from the parsed TOML schema.
    pub fn from_config(cfg: &selfcal_config::Config) -> Self {
        Self {
            do_self_cal: cfg.selfcal.enabled,
            num_self_cal_segments: cfg.selfcal.num_segments,
            self_cal_segment_length: cfg.selfcal.segment_length,
            num_change_needed: cfg.selfcal.num_change_needed,
            do_imu_self_cal: cfg.selfcal.do_imu_self_cal,
            unknown_cam_calibration: cfg.selfcal.unknown_calibration,
            unknown_imu_calibration: cfg.selfcal.do_imu_self_cal && cfg.selfcal.unknown_calibration,
            compare_self_cal_with_batch: cfg.selfcal.compare_with_batch,
            covariance_weights: cfg.selfcal.covariance_weights.clone(),
            use_imu: cfg.imu.enabled,
            min_poses_for_imu: cfg.imu.min_poses_for_imu,
            imu_time_offset: cfg.imu.time_offset,
            use_imu_for_guess: cfg.imu.use_for_guess,
            num_ba_poses: cfg.ba.num_ba_poses,
            num_ba_iterations: cfg.ba.num_iterations,
            do_adaptive: cfg.adaptive.enabled,
            num_aac_poses: cfg.adaptive.num_aac_poses,
            adaptive_threshold: cfg.adaptive.threshold,
            num_features: cfg.tracker.num_features,
            default_rho: 1.0,
            tuning: BaTuning {
                gyro_sigma: cfg.imu.gyro_sigma,
                accel_sigma: cfg.imu.accel_sigma,
                gyro_bias_sigma: cfg.imu.gyro_bias_sigma,
                accel_bias_sigma: cfg.imu.accel_bias_sigma,
                use_dogleg: cfg.ba.use_dogleg,
                use_robust_norm_for_proj: cfg.ba.use_robust_norm_for_proj,
                outlier_threshold: cfg.ba.outlier_threshold,
                do_outlier_rejection: cfg.ba.do_outlier_rejection,
                regularize_biases_in_batch: cfg.ba.regularize_biases_in_batch,
                ..BaTuning::default()
            },
            diagnostics_dir: cfg.logging.diagnostics_dir.as_ref().map(PathBuf::from),
        }
    }
}

/// Which calibrations are currently trusted.
#[derive(Debug, Clone, Copy)]
pub struct CalibrationStatus {
    pub unknown_cam_calibration: bool,
    pub unknown_imu_calibration: bool,
    pub unknown_cam_calibration_start_pose: usize,
    pub unknown_imu_calibration_start_pose: usize,
}

/// Per-frame outcome handed back to the caller.
#[derive(Debug, Clone)]
pub struct FrameSummary {
    pub frame: usize,
    pub is_keyframe: bool,
    pub num_poses: usize,
    pub num_successful_tracks: usize,
    pub tracking_failed: bool,
    pub divergence: f64,
}

/// Published on the event channel after each keyframe.
#[derive(Debug, Clone)]
pub struct KeyframeEvent {
    pub keyframe_id: usize,
    pub params: DVector<f64>,
    pub divergence: f64,
    pub score: f64,
    pub unknown_calibration: bool,
}

pub struct SelfCalEngine {
    shared: Shared,
    imu_buffer: Arc<ImuBuffer>,
    tracker: Box<dyn FeatureTracker>,
    factory: Box<dyn BaSolverFactory>,
    fg_visual: Box<dyn BaSolver>,
    fg_inertial: Box<dyn BaSolver>,
    calibrator: OnlineCalibrator,
    detector: ChangeDetector,
    cfg: EngineCfg,
    cancel: Arc<AtomicBool>,
    aac: Option<AdaptiveConditioning>,
    logs: CalibLogs,
    events: Option<xch::Sender<KeyframeEvent>>,
    // Unified clock for deterministic time in tests
    clock: Arc<dyn Clock + Send + Sync>,

    // Front-end state (the file-scope globals of old, made explicit).
    frame_count: usize,
    start_time: Option<Instant>,
    is_keyframe: bool,
    is_prev_keyframe: bool,
    keyframe_tracks: Option<usize>,
    last_t_ba: Isometry3<f64>,
    prev_t_ba: Isometry3<f64>,
    prev_delta_t_ba: Isometry3<f64>,
    status: CalibrationStatus,
    pq_window: CalibrationWindow,
    candidate_window: CalibrationWindow,
    last_window_kl_divergence: f64,
    last_added_window_kl_divergence: f64,
    total_last_frame_proj_error: f64,
    ba_imu_residual_ids: Vec<usize>,
    track_index: HashMap<u64, (usize, usize)>,
}

impl std::fmt::Debug for SelfCalEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfCalEngine")
            .field("frame_count", &self.frame_count)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Builder validated on `try_build`.
#[derive(Default)]
pub struct EngineBuilder {
    tracker: Option<Box<dyn FeatureTracker>>,
    factory: Option<Box<dyn BaSolverFactory>>,
    rig: Option<Rig>,
    cfg: Option<EngineCfg>,
    clock: Option<Box<dyn Clock + Send + Sync>>,
}

impl EngineBuilder {
    pub fn with_tracker(mut self, tracker: impl FeatureTracker + 'static) -> Self {
        self.tracker = Some(Box::new(tracker));
        self
    }

    pub fn with_solver_factory(mut self, factory: impl BaSolverFactory + 'static) -> Self {
        self.factory = Some(Box::new(factory));
        self
    }

    pub fn with_rig(mut self, rig: Rig) -> Self {
        self.rig = Some(rig);
        self
    }

    pub fn with_config(mut self, cfg: EngineCfg) -> Self {
        self.cfg = Some(cfg);
        self
    }

    /// Provide a custom clock implementation; defaults to MonotonicClock.
    pub fn with_clock(mut self, clock: Box<dyn Clock + Send + Sync>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn try_build(self) -> Result<SelfCalEngine> {
        let tracker = self
            .tracker
            .ok_or_else(|| eyre::Report::new(BuildError::MissingTracker))?;
        let factory = self
            .factory
            .ok_or_else(|| eyre::Report::new(BuildError::MissingSolverFactory))?;
        let rig = self.rig.ok_or_else(|| eyre::Report::new(BuildError::MissingRig))?;
        let cfg = self.cfg.unwrap_or_default();

        if rig.num_cameras() == 0 {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "rig needs at least one camera",
            )));
        }
        if cfg.self_cal_segment_length < 2 {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "self_cal_segment_length must be >= 2",
            )));
        }
        if cfg.num_self_cal_segments == 0 {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "num_self_cal_segments must be >= 1",
            )));
        }
        if cfg.num_change_needed == 0 {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "num_change_needed must be >= 1",
            )));
        }
        if cfg.do_imu_self_cal && !cfg.use_imu {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "do_imu_self_cal requires use_imu",
            )));
        }
        if cfg.num_features == 0 {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "num_features must be >= 1",
            )));
        }
        if !(cfg.adaptive_threshold > 0.0 && cfg.adaptive_threshold < 1.0) {
            return Err(eyre::Report::new(BuildError::InvalidConfig(
                "adaptive_threshold must be in (0, 1)",
            )));
        }

        let num_cam_params = rig.primary().num_params();
        let weights = if cfg.covariance_weights.is_empty() {
            CovarianceWeights::ones(num_cam_params)
        } else {
            CovarianceWeights::from_slice(&cfg.covariance_weights)
        };

        let logs = match &cfg.diagnostics_dir {
            Some(dir) => CalibLogs::create(dir),
            None => CalibLogs::disabled(),
        };

        let fg_visual = factory.create(BaMode::Visual);
        let fg_inertial = factory.create(BaMode::VisualInertial);
        let calibrator = OnlineCalibrator::new(
            factory.as_ref(),
            rig.clone(),
            cfg.num_self_cal_segments,
            weights,
            cfg.tuning.clone(),
            cfg.min_poses_for_imu,
        );

        let status = CalibrationStatus {
            unknown_cam_calibration: cfg.unknown_cam_calibration,
            unknown_imu_calibration: cfg.unknown_imu_calibration && cfg.do_imu_self_cal,
            unknown_cam_calibration_start_pose: 0,
            unknown_imu_calibration_start_pose: 0,
        };
        let clock: Arc<dyn Clock + Send + Sync> = match self.clock {
            Some(b) => Arc::from(b),
            None => Arc::new(MonotonicClock::new()),
        };

        Ok(SelfCalEngine {
            shared: Arc::new(Mutex::new(SharedState::new(rig))),
            imu_buffer: Arc::new(ImuBuffer::new()),
            tracker,
            factory,
            fg_visual,
            fg_inertial,
            calibrator,
            detector: ChangeDetector::new(cfg.num_change_needed),
            cfg,
            cancel: Arc::new(AtomicBool::new(false)),
            aac: None,
            logs,
            events: None,
            clock,
            frame_count: 0,
            start_time: None,
            is_keyframe: true,
            is_prev_keyframe: true,
            keyframe_tracks: None,
            last_t_ba: Isometry3::identity(),
            prev_t_ba: Isometry3::identity(),
            prev_delta_t_ba: Isometry3::identity(),
            status,
            pq_window: CalibrationWindow::default(),
            candidate_window: CalibrationWindow::default(),
            last_window_kl_divergence: 0.0,
            last_added_window_kl_divergence: 0.0,
            total_last_frame_proj_error: 0.0,
            ba_imu_residual_ids: Vec::new(),
            track_index: HashMap::new(),
        })
    }
}

impl SelfCalEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Handle for the IMU driver callback thread.
    pub fn imu_buffer(&self) -> Arc<ImuBuffer> {
        self.imu_buffer.clone()
    }

    pub fn add_imu_measurement(&self, w: Vector3<f64>, a: Vector3<f64>, time: f64) {
        self.imu_buffer.add(w, a, time);
    }

    pub fn shared(&self) -> Shared {
        self.shared.clone()
    }

    /// Cooperative cancellation flag, checked wherever the engine sleeps.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn calibration_status(&self) -> CalibrationStatus {
        self.status
    }

    pub fn calibrator(&self) -> &OnlineCalibrator {
        &self.calibrator
    }

    pub fn last_divergence(&self) -> f64 {
        self.last_window_kl_divergence
    }

    /// Divergence recorded at the last queue membership change.
    pub fn last_added_divergence(&self) -> f64 {
        self.last_added_window_kl_divergence
    }

    /// Inertial residual ids of the last foreground solve (viewer overlay).
    pub fn imu_residual_ids(&self) -> &[usize] {
        &self.ba_imu_residual_ids
    }

    pub fn mean_last_frame_proj_error(&self) -> f64 {
        self.total_last_frame_proj_error
    }

    pub fn aac(&self) -> Option<&AdaptiveConditioning> {
        self.aac.as_ref()
    }

    /// Subscribe to per-keyframe events; one subscriber is supported.
    pub fn subscribe(&mut self) -> xch::Receiver<KeyframeEvent> {
        let (tx, rx) = xch::unbounded();
        self.events = Some(tx);
        rx
    }

    /// Spawn the background adaptive-conditioning thread. No-op without IMU.
    pub fn start_background(&mut self) {
        if !self.cfg.use_imu || self.aac.is_some() {
            return;
        }
        let solver = self.factory.create(BaMode::VisualInertial);
        let aac_cfg = AacConfig {
            num_aac_poses: self.cfg.num_aac_poses,
            adaptive_threshold: self.cfg.adaptive_threshold,
            do_adaptive: self.cfg.do_adaptive,
            min_poses_for_imu: self.cfg.min_poses_for_imu,
            iterations: self.cfg.num_ba_iterations,
            tuning: self.cfg.tuning.clone(),
        };
        self.aac = Some(AdaptiveConditioning::spawn(
            self.shared.clone(),
            self.imu_buffer.clone(),
            solver,
            aac_cfg,
            self.cancel.clone(),
        ));
        tracing::info!("adaptive conditioning thread started");
    }

    pub fn stop_background(&mut self) {
        self.aac = None;
    }

    /// Ingest one image frame. The tracker owns the pixels; the engine only
    /// needs the timestamp.
    pub fn process_frame(&mut self, timestamp: f64) -> Result<FrameSummary> {
        if self.start_time.is_none() {
            self.start_time = Some(self.clock.now());
        }
        self.frame_count += 1;
        let new_pose_created = self.is_prev_keyframe;

        self.prev_delta_t_ba = self.tracker.t_ba() * self.prev_t_ba.inverse();
        self.prev_t_ba = if self.is_prev_keyframe {
            Isometry3::identity()
        } else {
            self.tracker.t_ba()
        };

        if self.is_prev_keyframe {
            self.append_pose(timestamp);
        }
        let pose_time = timestamp + self.cfg.imu_time_offset;
        {
            let mut state = lock(&self.shared);
            if let Some(pose) = state.poses.last_mut() {
                pose.time = pose_time;
            }
        }

        // Wait until the inertial stream has caught up with this frame.
        if self.cfg.use_imu
            && !self
                .imu_buffer
                .wait_until(pose_time, IMU_WAIT, &self.cancel, self.clock.as_ref())
        {
            tracing::warn!(pose_time, "imu buffer behind frame; proceeding with partial range");
        }

        let mut guess = self.motion_model_guess();
        if self.cfg.use_imu && self.cfg.use_imu_for_guess {
            if let Some(imu_guess) = self.imu_integrated_guess() {
                guess = imu_guess;
            }
        }

        let (num_successful, tracking_failed) = {
            let mut state = lock(&self.shared);
            self.tracker.add_image(pose_time, &guess);
            self.tracker.optimize_tracks(true, true);
            self.tracker.prune_tracks();

            let num_successful = self.tracker.num_successful_tracks();
            let tracking_failed =
                num_successful < TRACKING_FAILURE_MIN_TRACKS && self.cfg.use_imu;
            if tracking_failed {
                tracing::warn!(num_successful, "tracking failed, substituting integrated guess");
                self.tracker.set_t_ba(&guess);
            }

            // Chain the newest pose off the tracker delta.
            let n = state.poses.len();
            if n > 1 {
                let t_prev = state.poses[n - 2].t_wp;
                state.poses[n - 1].t_wp = t_prev * self.tracker.t_ba().inverse();
            }
            if let Some(pose) = state.poses.last_mut() {
                pose.longest_track = self.tracker.longest_track_len();
            }

            append_observations(
                self.tracker.as_ref(),
                &self.track_index,
                &mut state,
                new_pose_created,
            );
            (num_successful, tracking_failed)
        };

        // Keyframe heuristic: enough track attrition or enough motion.
        if let Some(kf_tracks) = self.keyframe_tracks
            && kf_tracks > 0
        {
            let ratio = num_successful as f64 / kf_tracks as f64;
            let t_ba = self.tracker.t_ba();
            let total_trans = t_ba.translation.vector.norm();
            let total_rot = crate::geometry::rotation_angle(&t_ba);
            self.is_keyframe = ratio < KEYFRAME_TRACK_RATIO
                || total_trans > KEYFRAME_TRANSLATION_M
                || total_rot > KEYFRAME_ROTATION_RAD;
            tracing::trace!(ratio, total_trans, total_rot, keyframe = self.is_keyframe, "keyframe check");
        }
        if self.is_keyframe {
            self.tracker.add_keyframe();
        }
        self.is_prev_keyframe = self.is_keyframe;

        if self.is_keyframe {
            self.ba_and_start_new_landmarks()?;
            self.keyframe_tracks = Some(self.live_track_count());
        }

        let num_poses = lock(&self.shared).poses.len();
        let fps = self.start_time.map_or(0.0, |t0| {
            let elapsed = self.clock.secs_since(t0);
            if elapsed > 0.0 {
                self.frame_count as f64 / elapsed
            } else {
                0.0
            }
        });
        tracing::debug!(
            frame = self.frame_count,
            keyframe = self.is_keyframe,
            num_poses,
            num_successful,
            fps,
            "frame processed"
        );
        Ok(FrameSummary {
            frame: self.frame_count,
            is_keyframe: self.is_keyframe,
            num_poses,
            num_successful_tracks: num_successful,
            tracking_failed,
            divergence: self.last_window_kl_divergence,
        })
    }

    fn live_track_count(&self) -> usize {
        let mut ids: Vec<u64> = self
            .tracker
            .current_observations()
            .iter()
            .map(|o| o.track_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }

    fn append_pose(&mut self, timestamp: f64) {
        let mut state = lock(&self.shared);
        let params = state.live_rig.primary().params();
        let pose = if let Some(prev) = state.poses.last() {
            let mut pose =
                KeyframePose::new(prev.t_wp * self.last_t_ba.inverse(), params, timestamp);
            if self.cfg.use_imu {
                pose.v_w = prev.v_w;
                pose.b = prev.b;
            }
            pose
        } else {
            let mut pose = KeyframePose::new(Isometry3::identity(), params, timestamp);
            if self.cfg.use_imu
                && let Some(first) = self.imu_buffer.front()
            {
                // Align the first pose so the gravity plane is level.
                pose.t_wp = gravity_aligned_pose(&first.a);
                tracing::debug!(down = ?(-first.a.normalize()).as_slice(), "gravity-aligned initial pose");
            }
            pose
        };
        state.poses.push(pose);
    }

    fn motion_model_guess(&self) -> Isometry3<f64> {
        let success_ratio =
            self.tracker.num_successful_tracks() as f64 / self.cfg.num_features as f64;
        let mut guess = if success_ratio > GUESS_MIN_SUCCESS_RATIO {
            self.prev_delta_t_ba * self.prev_t_ba
        } else {
            Isometry3::identity()
        };
        let num_poses = lock(&self.shared).poses.len();
        if guess.translation.vector == Vector3::zeros() && num_poses > 1 {
            // A perfectly zero guess makes the depth Jacobians degenerate.
            guess.translation.vector.z = 0.001;
        }
        guess
    }

    /// Integrate the buffered IMU over the last inter-pose interval; also
    /// refreshes the newest pose's state from the integrated trajectory.
    fn imu_integrated_guess(&mut self) -> Option<Isometry3<f64>> {
        let (start, t0, t1) = {
            let state = lock(&self.shared);
            let n = state.poses.len();
            if n < self.cfg.min_poses_for_imu.max(2) {
                return None;
            }
            let p = &state.poses[n - 2];
            ((p.t_wp, p.v_w, p.b), p.time, state.poses[n - 1].time)
        };
        let meas = self.imu_buffer.get_range(t0, t1);
        let imu_poses =
            integrate_measurements(&start.0, &start.1, &start.2, &self.cfg.tuning.gravity, &meas);
        if imu_poses.len() < 2 {
            return None;
        }
        let last = imu_poses.last()?;
        let guess = last.t_wp.inverse() * imu_poses[0].t_wp;
        let mut state = lock(&self.shared);
        if let Some(pose) = state.poses.last_mut() {
            pose.t_wp = last.t_wp;
            pose.v_w = last.v_w;
        }
        Some(guess)
    }

    /// The per-keyframe controller: batch recalibration, foreground BA,
    /// candidate analysis + drift detection, priority-queue refresh, and
    /// new-landmark seeding.
    fn ba_and_start_new_landmarks(&mut self) -> Result<()> {
        let imu_selfcal_active = self.cfg.use_imu && self.cfg.do_imu_self_cal;
        let num_poses = lock(&self.shared).poses.len();
        let keyframe_id = num_poses;
        let mut current_window = CalibrationWindow::default();

        let batch_start = self.status.unknown_cam_calibration_start_pose;
        let batch_end = num_poses;

        // Batch mode while any calibration is unknown.
        let t_batch = self.clock.now();
        if self.cfg.do_self_cal
            && (self.status.unknown_cam_calibration || self.status.unknown_imu_calibration)
            && batch_end - batch_start > self.cfg.self_cal_segment_length
        {
            let mut analyzed = false;
            if imu_selfcal_active
                && num_poses > self.cfg.min_poses_for_imu
                && self.status.unknown_imu_calibration
            {
                let mode = if self.status.unknown_cam_calibration {
                    BaMode::VisualInertialTvs
                } else {
                    BaMode::InertialTvs
                };
                self.pq_window = self.calibrator.analyze_window(
                    &self.shared,
                    &self.imu_buffer,
                    batch_start,
                    batch_end,
                    SELFCAL_ITERATIONS,
                    true,
                    batch_start,
                    mode,
                );
                analyzed = true;
            } else if self.status.unknown_cam_calibration {
                self.pq_window = self.calibrator.analyze_window(
                    &self.shared,
                    &self.imu_buffer,
                    batch_start,
                    batch_end,
                    SELFCAL_ITERATIONS,
                    true,
                    batch_start,
                    BaMode::Visual,
                );
                analyzed = true;
            } else {
                tracing::debug!(
                    "imu calibration unknown but imu self-cal inactive; batch deferred"
                );
            }

            let score = if analyzed {
                self.calibrator.window_score(&self.pq_window)
            } else {
                0.0
            };
            if !self.pq_window.is_empty() {
                current_window = self.pq_window.clone();
            }
            self.logs.batch(keyframe_id, &self.pq_window, score);
            tracing::debug!(score, mean = ?self.pq_window.mean.as_slice(), "batch posterior");

            if analyzed
                && batch_recalibration_complete(
                    score,
                    batch_end - batch_start,
                    self.cfg.self_cal_segment_length,
                )
            {
                tracing::info!(score, "batch converged, switching to incremental self-cal");
                self.status.unknown_cam_calibration = false;
                self.status.unknown_imu_calibration = false;
                self.detector.reset();
            }
        }
        let batch_s = self.clock.secs_since(t_batch);

        // Foreground odometry BA over the recent horizon (stretched to cover
        // the whole unknown range during recalibration).
        let t_ba = self.clock.now();
        let ba_horizon = if self.status.unknown_cam_calibration {
            self.cfg.num_ba_poses.max(batch_end - batch_start)
        } else {
            self.cfg.num_ba_poses
        };
        let use_vi = self.cfg.use_imu && num_poses > self.cfg.min_poses_for_imu;
        let spec = BaRunSpec {
            slot: FOREGROUND_SLOT,
            mode: if use_vi {
                BaMode::VisualInertial
            } else {
                BaMode::Visual
            },
            estimate_cam_params: false,
            iterations: self.cfg.num_ba_iterations,
            segments: vec![horizon_segment(num_poses, ba_horizon)],
            longest_track_id: Some(self.tracker.longest_track_id()),
            do_adaptive: false,
            is_keyframe: true,
            do_outlier_rejection: self.cfg.tuning.do_outlier_rejection
                && !self.status.unknown_cam_calibration,
            min_poses_for_imu: self.cfg.min_poses_for_imu,
        };
        let solver = if use_vi {
            self.fg_inertial.as_mut()
        } else {
            self.fg_visual.as_mut()
        };
        match ba::run(
            &self.shared,
            solver,
            &self.imu_buffer,
            &self.cfg.tuning,
            RigSource::Live,
            &spec,
            None,
        ) {
            Ok(res) => {
                self.last_t_ba = res.last_t_ba;
                self.total_last_frame_proj_error = res.mean_last_frame_proj_error;
                self.ba_imu_residual_ids = res.imu_residual_ids;
            }
            Err(e) => {
                tracing::debug!(error = %e, "foreground ba skipped");
            }
        }
        let ba_s = self.clock.secs_since(t_ba);

        // Candidate window over the newest segment, drift detection, queue.
        let mut analyze_s = 0.0;
        let mut queue_s = 0.0;
        if self.cfg.do_self_cal && batch_end - batch_start >= self.cfg.self_cal_segment_length {
            let t_analyze = self.clock.now();
            let start_pose = num_poses.saturating_sub(self.cfg.self_cal_segment_length);
            let mode = if imu_selfcal_active {
                BaMode::VisualInertialTvs
            } else {
                BaMode::Visual
            };
            let mut candidate = self.calibrator.analyze_window(
                &self.shared,
                &self.imu_buffer,
                start_pose,
                num_poses,
                SELFCAL_ITERATIONS,
                false,
                batch_start,
                mode,
            );

            let outcome = self.calibrator.try_admit(&mut candidate);
            if outcome != AdmitOutcome::Rejected {
                tracing::debug!(?outcome, score = candidate.score, "candidate window admitted");
            }
            self.candidate_window = candidate;

            let div = stats::yao_1965(&self.pq_window, &self.candidate_window);
            self.last_window_kl_divergence = if div.is_finite() { div } else { 0.0 };
            if !self.candidate_window.is_empty() {
                current_window = self.candidate_window.clone();
            }
            tracing::debug!(
                divergence = self.last_window_kl_divergence,
                suspects = self.detector.suspect_count(),
                "drift signal"
            );

            let queue_full = self.calibrator.num_windows() == self.calibrator.queue_length();
            match self.detector.observe(
                div,
                queue_full,
                !self.status.unknown_cam_calibration,
            ) {
                DriftDecision::Drifted => {
                    self.status.unknown_cam_calibration = true;
                    self.status.unknown_cam_calibration_start_pose =
                        num_poses.saturating_sub(self.detector.num_change_needed());
                    self.calibrator.clear_queue();
                    tracing::warn!(
                        start_pose = self.status.unknown_cam_calibration_start_pose,
                        "parameter change detected, entering recalibration"
                    );
                }
                DriftDecision::Suspect(k) => {
                    tracing::debug!(consecutive = k, divergence = div, "possible drift");
                }
                DriftDecision::Consistent => {}
            }
            analyze_s = self.clock.secs_since(t_analyze);

            // Queue membership changed: recompute the joint distribution.
            if self.calibrator.needs_update() && !self.status.unknown_cam_calibration {
                let t_queue = self.clock.now();
                self.last_added_window_kl_divergence = self.last_window_kl_divergence;
                let apply = !(self.status.unknown_cam_calibration
                    || self.status.unknown_imu_calibration);
                let pq = self.calibrator.analyze_priority_queue(
                    &self.shared,
                    &self.imu_buffer,
                    SELFCAL_ITERATIONS,
                    apply,
                    self.status.unknown_cam_calibration_start_pose,
                    mode,
                );
                if !pq.is_empty() {
                    self.pq_window = pq;
                }
                self.calibrator.set_queue_distribution(&self.pq_window);
                self.calibrator.finish_queue_update();

                let score = self.calibrator.window_score(&self.pq_window);
                self.logs
                    .pq(keyframe_id, &self.pq_window, score, self.last_window_kl_divergence);
                tracing::debug!(score, mean = ?self.pq_window.mean.as_slice(), "queue distribution refreshed");

                if self.cfg.compare_self_cal_with_batch && !self.status.unknown_cam_calibration {
                    let batch_window = self.calibrator.analyze_window(
                        &self.shared,
                        &self.imu_buffer,
                        0,
                        num_poses,
                        SELFCAL_ITERATIONS,
                        false,
                        0,
                        mode,
                    );
                    let batch_score = self.calibrator.window_score(&batch_window);
                    self.logs.batch(keyframe_id, &batch_window, batch_score);
                }
                queue_s = self.clock.secs_since(t_queue);
            }
        }

        if self.cfg.do_self_cal && !current_window.is_empty() {
            self.logs
                .sigmas(keyframe_id, &current_window, self.last_window_kl_divergence);
        }

        // New landmarks for the freshly minted keyframe.
        let t_snl = self.clock.now();
        self.tracker.start_new_landmarks();
        let seeds = self.tracker.take_new_track_seeds();
        {
            let mut state = lock(&self.shared);
            let pose_idx = state.poses.len().saturating_sub(1);
            let num_cams = state.live_rig.num_cameras();
            for seed in seeds {
                let ray = state.live_rig.primary().unproject_unit(&seed.center_px);
                let track = FeatureTrack::new(
                    seed.track_id,
                    pose_idx,
                    RefKeypoint {
                        center_px: seed.center_px,
                        ray,
                        rho: self.cfg.default_rho,
                    },
                    num_cams,
                );
                let slot = state.poses[pose_idx].tracks.len();
                state.poses[pose_idx].tracks.push(track);
                self.track_index.insert(seed.track_id, (pose_idx, slot));
            }
        }
        let snl_s = self.clock.secs_since(t_snl);

        self.logs
            .timings(keyframe_id, batch_s, ba_s, analyze_s, queue_s, snl_s);

        if let Some(tx) = &self.events {
            let params = lock(&self.shared).live_rig.primary().params();
            let _ = tx.send(KeyframeEvent {
                keyframe_id,
                params,
                divergence: self.last_window_kl_divergence,
                score: current_window.score,
                unknown_calibration: self.status.unknown_cam_calibration,
            });
        }

        Ok(())
    }
}

impl Drop for SelfCalEngine {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        // The AAC handle joins its thread on drop.
        self.aac = None;
    }
}

/// Push (keyframe) or overwrite (intermediate frame) the newest observation
/// slot of every live track.
fn append_observations(
    tracker: &dyn FeatureTracker,
    track_index: &HashMap<u64, (usize, usize)>,
    state: &mut SharedState,
    new_pose_created: bool,
) {
    let num_cams = state.live_rig.num_cameras();
    let mut by_track: HashMap<u64, Vec<(usize, Vector2<f64>, bool)>> = HashMap::new();
    for obs in tracker.current_observations() {
        by_track
            .entry(obs.track_id)
            .or_default()
            .push((obs.cam_id, obs.px, obs.tracked));
    }

    for (&track_id, &(pose_idx, track_idx)) in track_index {
        let Some(track) = state
            .poses
            .get_mut(pose_idx)
            .and_then(|p| p.tracks.get_mut(track_idx))
        else {
            continue;
        };
        debug_assert_eq!(track.id, track_id);
        match by_track.remove(&track_id) {
            Some(cams) => {
                let mut per_cam = vec![
                    Observation {
                        px: Vector2::zeros(),
                        tracked: false,
                    };
                    num_cams
                ];
                for (cam_id, px, tracked) in cams {
                    if cam_id < num_cams {
                        per_cam[cam_id] = Observation { px, tracked };
                    }
                }
                let any_tracked = per_cam.iter().any(|o| o.tracked);
                if new_pose_created {
                    track.keypoints.push(per_cam);
                    if any_tracked {
                        track.num_good_tracked_frames += 1;
                    }
                } else if let Some(last) = track.keypoints.last_mut() {
                    *last = per_cam;
                }
                track.tracked = any_tracked;
            }
            None => {
                track.tracked = false;
            }
        }
    }
}

/// World-from-body rotation whose z row opposes the measured specific force,
/// so the initial pose sits level in the gravity field.
fn gravity_aligned_pose(accel: &Vector3<f64>) -> Isometry3<f64> {
    let down = -accel.normalize();
    let mut forward = Vector3::new(1.0, 0.0, 0.0);
    let mut right = down.cross(&forward);
    if right.norm() < 1e-9 {
        forward = Vector3::new(0.0, 1.0, 0.0);
        right = down.cross(&forward);
    }
    right.normalize_mut();
    forward = right.cross(&down);
    forward.normalize_mut();

    let mut m = Matrix3::zeros();
    m.set_row(0, &forward.transpose());
    m.set_row(1, &right.transpose());
    m.set_row(2, &down.transpose());
    let rot = Rotation3::from_matrix_unchecked(m);
    Isometry3::from_parts(
        nalgebra::Translation3::identity(),
        UnitQuaternion::from_rotation_matrix(&rot),
    )
}
