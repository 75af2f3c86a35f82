//! Bundle-adjustment facade.
//!
//! One `run` drives any of the four solver parameterisations (visual,
//! visual-inertial, visual-inertial + extrinsics, extrinsics-only) over a
//! set of pose segments: problem assembly and result readback run under the
//! shared BA mutex, the solve itself does not. The same code path serves the
//! foreground odometry BA, the background adaptive-conditioning BA, and the
//! calibrator's posterior solves.
use std::sync::Mutex;

use nalgebra::{DMatrix, DVector, Isometry3, Vector3, Vector4};
use selfcal_traits::{BaMode, BaOptions, BaSolver, SolutionSummary, UNASSIGNED};

use crate::error::CalibError;
use crate::geometry::mult_homogeneous;
use crate::imu::ImuBuffer;
use crate::math::chi2inv;
use crate::store::{SharedState, lock};

/// Pose count below which biases are always regularised.
pub const POSES_TO_INIT: usize = 30;
/// Robust-norm ratio above which an untracked landmark is marked outlier.
pub const LANDMARK_OUTLIER_RATIO: f64 = 0.3;
/// Growth step of the adaptive conditioning window.
pub const ADAPTIVE_GROWTH: usize = 30;
const PROJ_RESIDUAL_WEIGHT: f64 = 2.0;

/// Select `BaMode` from the (use_imu, do_tvs) flag pair. The combination
/// `(false, true)` has no backend and is rejected.
pub fn mode_from_flags(use_imu: bool, do_tvs: bool) -> Result<BaMode, CalibError> {
    match (use_imu, do_tvs) {
        (false, false) => Ok(BaMode::Visual),
        (true, false) => Ok(BaMode::VisualInertial),
        (true, true) => Ok(BaMode::VisualInertialTvs),
        (false, true) => Err(CalibError::DisallowedMode),
    }
}

/// Solver sigmas and switches carried by the engine configuration.
#[derive(Debug, Clone)]
pub struct BaTuning {
    pub gyro_sigma: f64,
    pub accel_sigma: f64,
    pub gyro_bias_sigma: f64,
    pub accel_bias_sigma: f64,
    pub use_dogleg: bool,
    pub use_robust_norm_for_proj: bool,
    pub outlier_threshold: f64,
    pub do_outlier_rejection: bool,
    pub regularize_biases_in_batch: bool,
    pub gravity: Vector3<f64>,
}

impl Default for BaTuning {
    fn default() -> Self {
        Self {
            gyro_sigma: 5.3088444e-5,
            accel_sigma: 1.6e-3,
            gyro_bias_sigma: 1.4125375e-5,
            accel_bias_sigma: 1.2589254e-2,
            use_dogleg: true,
            use_robust_norm_for_proj: false,
            outlier_threshold: 1.0,
            do_outlier_rejection: true,
            regularize_biases_in_batch: false,
            gravity: Vector3::new(0.0, 0.0, -9.806),
        }
    }
}

impl BaTuning {
    fn to_options(
        &self,
        mode: BaMode,
        estimate_cam_params: bool,
        num_poses_total: usize,
    ) -> BaOptions {
        BaOptions {
            gyro_sigma: self.gyro_sigma,
            accel_sigma: self.accel_sigma,
            gyro_bias_sigma: self.gyro_bias_sigma,
            accel_bias_sigma: self.accel_bias_sigma,
            use_dogleg: self.use_dogleg,
            use_sparse_solver: true,
            param_change_threshold: 1e-10,
            error_change_threshold: 1e-3,
            use_robust_norm_for_proj_residuals: self.use_robust_norm_for_proj,
            projection_outlier_threshold: self.outlier_threshold,
            use_per_pose_cam_params: true,
            regularize_biases_in_batch: num_poses_total < POSES_TO_INIT
                || self.regularize_biases_in_batch,
            estimate_cam_params,
            gravity: self.gravity,
            mode,
        }
    }
}

/// Which rig the problem reads camera parameters and extrinsics from.
#[derive(Debug, Clone, Copy)]
pub enum RigSource {
    Live,
    Async,
}

/// `[start, end)` pose registration range; poses from `active_start` on are
/// free, earlier ones are fixed context.
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    pub start: usize,
    pub end: usize,
    pub active_start: usize,
}

impl Segment {
    /// Fully-active segment.
    pub fn all_active(start: usize, end: usize) -> Self {
        Self {
            start,
            end,
            active_start: start,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BaRunSpec {
    /// opt_id / external_id slot this problem owns.
    pub slot: usize,
    pub mode: BaMode,
    pub estimate_cam_params: bool,
    pub iterations: usize,
    pub segments: Vec<Segment>,
    /// Held fixed in all-active visual solves to pin the gauge.
    pub longest_track_id: Option<u64>,
    /// Track conditioning residuals and drive the window-growth decision.
    pub do_adaptive: bool,
    /// Whether the newest pose is a keyframe (readback anchor selection).
    pub is_keyframe: bool,
    /// Outlier marking enabled for this run (off while the calibration is
    /// untrusted, and for solves that do not own the outlier flags).
    pub do_outlier_rejection: bool,
    pub min_poses_for_imu: usize,
}

#[derive(Debug)]
pub struct BaRunResult {
    pub mean_last_frame_proj_error: f64,
    pub num_outliers: usize,
    pub num_proj_residuals: usize,
    pub imu_residual_ids: Vec<usize>,
    pub summary: SolutionSummary,
    /// Constant-motion delta for the next pose guess.
    pub last_t_ba: Isometry3<f64>,
    /// Refined intrinsics, present when `estimate_cam_params`.
    pub refined_params: Option<DVector<f64>>,
    /// Refined camera-from-body transform, present when the mode frees it.
    pub refined_t_bc: Option<Isometry3<f64>>,
    pub calibration_covariance: Option<DMatrix<f64>>,
}

/// Mutable state of the adaptive conditioning loop, owned by the background
/// thread across solves within one cycle.
#[derive(Debug)]
pub struct AdaptiveState {
    pub num_active_poses: usize,
    pub orig_num_aac_poses: usize,
    /// Negative = no previous cycle error.
    pub prev_cond_error: f64,
    /// Pose index the conditioning inertial residual starts at; -1 unset.
    pub cond_start_pose: i64,
    pub cond_residual_id: usize,
    /// Chi-square quantile for the conditioning tests.
    pub threshold: f64,
}

impl AdaptiveState {
    pub fn new(num_aac_poses: usize, threshold: f64) -> Self {
        Self {
            num_active_poses: num_aac_poses,
            orig_num_aac_poses: num_aac_poses,
            prev_cond_error: -1.0,
            cond_start_pose: -1,
            cond_residual_id: 0,
            threshold,
        }
    }

    /// Forget conditioning tracking between outer cycles.
    pub fn reset_cycle(&mut self) {
        self.cond_start_pose = -1;
        self.cond_residual_id = 0;
        self.prev_cond_error = -1.0;
    }
}

struct BuiltProblem {
    /// pose index -> solver pose id for registered poses.
    pose_opt: Vec<Option<usize>>,
    imu_residual_ids: Vec<usize>,
    last_frame_residual_ids: Vec<usize>,
    num_proj_residuals: usize,
    /// Highest registered pose index.
    end_pose: usize,
}

/// Run one bundle adjustment over `spec.segments`.
///
/// Fails with `EmptyRange` when fewer than two poses would be registered;
/// nothing is touched in that case.
pub fn run(
    shared: &Mutex<SharedState>,
    solver: &mut dyn BaSolver,
    imu_buffer: &ImuBuffer,
    tuning: &BaTuning,
    rig_source: RigSource,
    spec: &BaRunSpec,
    mut adaptive: Option<&mut AdaptiveState>,
) -> Result<BaRunResult, CalibError> {
    let built = {
        let mut state = lock(shared);
        build_problem(
            &mut state,
            solver,
            imu_buffer,
            tuning,
            rig_source,
            spec,
            adaptive.as_deref_mut(),
        )?
    };

    // The solve itself runs without the mutex; the foreground keeps tracking
    // while the background BA grinds.
    solver.solve(spec.iterations);

    let mut state = lock(shared);
    let result = read_back(&mut state, solver, rig_source, spec, &built);

    if spec.do_adaptive
        && spec.mode.uses_imu()
        && let Some(st) = adaptive.as_deref_mut()
        && st.cond_start_pose != -1
    {
        update_adaptive(st, solver, &result.summary, spec.mode.pose_dim(), built.end_pose);
    }

    Ok(result)
}

#[allow(clippy::too_many_arguments)]
fn build_problem(
    state: &mut SharedState,
    solver: &mut dyn BaSolver,
    imu_buffer: &ImuBuffer,
    tuning: &BaTuning,
    rig_source: RigSource,
    spec: &BaRunSpec,
    mut adaptive: Option<&mut AdaptiveState>,
) -> Result<BuiltProblem, CalibError> {
    let num_poses = state.poses.len();
    if state.reset_outliers {
        for pose in &mut state.poses {
            for track in &mut pose.tracks {
                track.is_outlier = false;
            }
        }
        state.reset_outliers = false;
    }

    // Clamp and extend the segments. In IMU modes a fully-active segment
    // gains one earlier, fixed pose so the first inertial residual has
    // something to condition on.
    let use_imu = spec.mode.uses_imu();
    let mut segments: Vec<Segment> = Vec::with_capacity(spec.segments.len());
    for seg in &spec.segments {
        let mut seg = *seg;
        seg.end = seg.end.min(num_poses);
        if seg.start >= seg.end {
            continue;
        }
        if use_imu && seg.start == seg.active_start && seg.start > 0 {
            seg.start -= 1;
        }
        segments.push(seg);
    }
    let total: usize = segments.iter().map(|s| s.end - s.start).sum();
    if total < 2 {
        return Err(CalibError::EmptyRange);
    }
    let all_poses_active = segments
        .first()
        .is_some_and(|s| s.start == s.active_start);

    let rig = match rig_source {
        RigSource::Live => state.live_rig.clone(),
        RigSource::Async => state.async_rig.clone(),
    };
    let t_bc = rig.primary().t_bc;

    let num_tracks: usize = segments
        .iter()
        .flat_map(|s| state.poses[s.start..s.end].iter())
        .map(|p| p.tracks.len())
        .sum();
    let options = tuning.to_options(spec.mode, spec.estimate_cam_params, num_poses);
    solver.init(&options, total, num_tracks.max(1));
    for cam in &rig.cameras {
        solver.add_camera(&cam.params(), &cam.t_bc);
    }

    let mut pose_opt: Vec<Option<usize>> = vec![None; num_poses];
    let mut imu_residual_ids = Vec::new();
    let mut end_pose = 0;

    for seg in &segments {
        for idx in seg.start..seg.end {
            if pose_opt[idx].is_some() {
                continue;
            }
            let is_active = idx >= seg.active_start;
            let opt = {
                let pose = &state.poses[idx];
                solver.add_pose(&pose.t_wp, &pose.cam_params, &pose.v_w, &pose.b, is_active, pose.time)
            };
            state.poses[idx].opt_id[spec.slot] = opt;
            pose_opt[idx] = Some(opt);
            end_pose = end_pose.max(idx);

            if idx == seg.active_start && use_imu && all_poses_active {
                solver.regularize_pose(opt, true, true, false, false);
            }

            if use_imu && is_active && idx > seg.start && idx > 0 {
                let (t0, t1) = (state.poses[idx - 1].time, state.poses[idx].time);
                let meas = imu_buffer.get_range(t0, t1);
                let prev_opt = pose_opt[idx - 1].unwrap_or(UNASSIGNED);
                if prev_opt != UNASSIGNED {
                    let rid = solver.add_imu_residual(prev_opt, opt, &meas);
                    imu_residual_ids.push(rid);
                    if spec.do_adaptive
                        && let Some(st) = adaptive.as_deref_mut()
                    {
                        // Remember the residual coupling the fixed prefix to
                        // the first active pose.
                        let prev_active = (idx - 1) >= seg.active_start;
                        if st.cond_start_pose == -1 && !prev_active && is_active {
                            st.cond_start_pose = (idx - 1) as i64;
                            st.cond_residual_id = rid;
                        } else if st.cond_start_pose == (idx - 1) as i64 {
                            st.cond_residual_id = rid;
                        }
                    }
                }
            }

            let pose_t_wc = state.poses[idx].t_wp * t_bc;
            let longest = spec.longest_track_id;
            for track in &mut state.poses[idx].tracks {
                let constrains_active = track.num_frames() + idx > seg.active_start;
                if !track.is_admissible() || !constrains_active {
                    track.external_id[spec.slot] = UNASSIGNED;
                    continue;
                }
                let mut ray = Vector4::new(
                    track.ref_keypoint.ray.x,
                    track.ref_keypoint.ray.y,
                    track.ref_keypoint.ray.z,
                    track.ref_keypoint.rho,
                );
                ray = mult_homogeneous(&pose_t_wc, &ray);
                let lm_active =
                    longest != Some(track.id) || !all_poses_active || use_imu;
                track.external_id[spec.slot] = solver.add_landmark(&ray, opt, 0, lm_active);
            }
        }
    }

    // Projection residuals in a second pass, once every target pose id is
    // known. Observations landing on unregistered poses are skipped.
    let mut last_frame_residual_ids = Vec::new();
    let mut num_proj_residuals = 0usize;
    for seg in &segments {
        for idx in seg.start..seg.end {
            for track in &state.poses[idx].tracks {
                if track.external_id[spec.slot] == UNASSIGNED {
                    continue;
                }
                for (frame, obs_per_cam) in track.keypoints.iter().enumerate() {
                    let Some(target_opt) = pose_opt.get(idx + frame).copied().flatten() else {
                        continue;
                    };
                    for (cam_id, obs) in obs_per_cam.iter().enumerate() {
                        if !obs.tracked {
                            continue;
                        }
                        let rid = solver.add_projection_residual(
                            &obs.px,
                            target_opt,
                            track.external_id[spec.slot],
                            cam_id,
                            PROJ_RESIDUAL_WEIGHT,
                        );
                        if idx + frame == end_pose {
                            last_frame_residual_ids.push(rid);
                        }
                        num_proj_residuals += 1;
                    }
                }
            }
        }
    }

    Ok(BuiltProblem {
        pose_opt,
        imu_residual_ids,
        last_frame_residual_ids,
        num_proj_residuals,
        end_pose,
    })
}

fn read_back(
    state: &mut SharedState,
    solver: &mut dyn BaSolver,
    rig_source: RigSource,
    spec: &BaRunSpec,
    built: &BuiltProblem,
) -> BaRunResult {
    let use_imu = spec.mode.uses_imu();
    let t_bc = match rig_source {
        RigSource::Live => state.live_rig.primary().t_bc,
        RigSource::Async => state.async_rig.primary().t_bc,
    };

    // Mean projection error on the newest frame, for the drift plots.
    let mean_last_frame_proj_error = if built.last_frame_residual_ids.is_empty() {
        0.0
    } else {
        let sum: f64 = built
            .last_frame_residual_ids
            .iter()
            .map(|&id| solver.projection_residual(id).norm())
            .sum();
        sum / built.last_frame_residual_ids.len() as f64
    };

    let num_poses = state.poses.len();
    let last_pose_idx = if spec.is_keyframe {
        num_poses.saturating_sub(1)
    } else {
        num_poses.saturating_sub(2)
    };
    if let Some(opt) = built.pose_opt.get(last_pose_idx).copied().flatten() {
        state.poses[last_pose_idx].t_wp = solver.pose(opt).t_wp;
    }
    let last_t_wp = state.poses[last_pose_idx].t_wp;

    let allow_outlier_marks = spec.do_outlier_rejection && num_poses > POSES_TO_INIT;
    let mut num_outliers = 0usize;
    let mut last_t_ba = Isometry3::identity();
    let mut t_ba = Isometry3::identity();

    for idx in 0..built.pose_opt.len() {
        let Some(opt) = built.pose_opt[idx] else {
            continue;
        };
        let est = solver.pose(opt);
        let pose = &mut state.poses[idx];
        pose.t_wp = est.t_wp;
        if use_imu {
            pose.v_w = est.v_w;
            pose.b = est.b;
        }

        last_t_ba = t_ba;
        t_ba = last_t_wp.inverse() * pose.t_wp;
        let t_cw = (pose.t_wp * t_bc).inverse();
        for track in &mut pose.tracks {
            if track.external_id[spec.slot] == UNASSIGNED {
                continue;
            }
            track.t_ba = t_ba;

            let x_w = solver.landmark(track.external_id[spec.slot]);
            let ratio = solver.landmark_outlier_ratio(track.external_id[spec.slot]);
            if allow_outlier_marks {
                let range_ok = built.end_pose + 1 >= spec.min_poses_for_imu || !use_imu;
                if ratio > LANDMARK_OUTLIER_RATIO && !track.tracked && range_ok {
                    num_outliers += 1;
                    track.is_outlier = true;
                } else {
                    track.is_outlier = false;
                }
            }

            // Re-derive the inverse depth from the solved landmark, expressed
            // back in the reference camera frame.
            let mut x_r = mult_homogeneous(&t_cw, &x_w);
            let norm = x_r.fixed_rows::<3>(0).norm();
            if norm > 0.0 {
                x_r /= norm;
                track.ref_keypoint.rho = x_r.w;
            }
        }
    }

    if !spec.do_adaptive && num_outliers > 0 {
        tracing::debug!(num_outliers, "rejected outlier tracks");
    }

    let summary = solver.solution_summary();
    let refined_params = spec
        .estimate_cam_params
        .then(|| solver.camera_params(0));
    let refined_t_bc = spec.mode.estimates_tvs().then(|| solver.camera_pose(0));
    let calibration_covariance =
        if spec.estimate_cam_params || spec.mode.estimates_tvs() {
            solver.calibration_covariance()
        } else {
            None
        };

    BaRunResult {
        mean_last_frame_proj_error,
        num_outliers,
        num_proj_residuals: built.num_proj_residuals,
        imu_residual_ids: built.imu_residual_ids.clone(),
        summary,
        last_t_ba,
        refined_params,
        refined_t_bc,
        calibration_covariance,
    }
}

fn update_adaptive(
    st: &mut AdaptiveState,
    solver: &dyn BaSolver,
    summary: &SolutionSummary,
    pose_dim: usize,
    end_pose: usize,
) {
    let cond_dims = summary.num_cond_inertial_residuals * pose_dim
        + summary.num_cond_proj_residuals * 2;
    let cond_error = summary.cond_inertial_error + summary.cond_proj_error;
    let cond_inertial_error = solver.imu_residual_mahalanobis(st.cond_residual_id);

    if st.prev_cond_error < 0.0 {
        st.prev_cond_error = f64::MAX;
    }

    let cond_v_chi2 = chi2inv(st.threshold, (summary.num_cond_proj_residuals * 2) as f64);
    let cond_i_chi2 = chi2inv(st.threshold, pose_dim as f64);

    if st.num_active_poses > end_pose {
        // Batch-sized already; start the next cycle from the baseline.
        st.num_active_poses = st.orig_num_aac_poses;
    }

    if cond_error == 0.0 || cond_dims == 0 {
        return;
    }
    let cond_total_error = cond_inertial_error + summary.cond_proj_error;
    let inertial_ratio = cond_inertial_error / cond_i_chi2;
    let visual_ratio = summary.cond_proj_error / cond_v_chi2;
    let improved = cond_total_error <= st.prev_cond_error
        && (st.prev_cond_error - cond_total_error) / st.prev_cond_error > 1e-5;
    if (inertial_ratio > 1.0 || visual_ratio > 1.0) && improved {
        st.num_active_poses += ADAPTIVE_GROWTH;
        tracing::debug!(
            inertial_ratio,
            visual_ratio,
            num_active_poses = st.num_active_poses,
            "conditioning poor, growing active window"
        );
    } else {
        st.num_active_poses = st.orig_num_aac_poses;
    }
    st.prev_cond_error = cond_total_error;
}

/// Derive the foreground/background registration segment from a horizon.
pub fn horizon_segment(num_poses: usize, num_active_poses: usize) -> Segment {
    let active_start = num_poses.saturating_sub(num_active_poses);
    Segment {
        start: active_start,
        end: num_poses,
        active_start,
    }
}
