//! Online calibrator: runs posterior solves over pose windows, maintains the
//! priority queue, and writes accepted parameters back to the live rig.
use std::collections::HashMap;
use std::sync::Mutex;

use nalgebra::{DVector, Isometry3};
use selfcal_traits::{BaMode, BaSolver, BaSolverFactory};

use crate::ba::{self, BaRunSpec, BaTuning, RigSource, Segment};
use crate::geometry::{se3_from_tangent, se3_tangent};
use crate::imu::ImuBuffer;
use crate::queue::{AdmitOutcome, WindowQueue};
use crate::rig::Rig;
use crate::store::{SELFCAL_SLOT, SharedState, lock};
use crate::window::{CalibrationWindow, CovarianceWeights, is_full_rank, window_score};

pub struct OnlineCalibrator {
    /// Candidate parameters under evaluation; synced from the live rig
    /// before every solve.
    selfcal_rig: Rig,
    queue: WindowQueue,
    weights: CovarianceWeights,
    tuning: BaTuning,
    min_poses_for_imu: usize,
    solvers: HashMap<BaMode, Box<dyn BaSolver>>,
}

impl OnlineCalibrator {
    pub fn new(
        factory: &dyn BaSolverFactory,
        rig: Rig,
        queue_length: usize,
        weights: CovarianceWeights,
        tuning: BaTuning,
        min_poses_for_imu: usize,
    ) -> Self {
        let mut solvers: HashMap<BaMode, Box<dyn BaSolver>> = HashMap::new();
        for mode in [
            BaMode::Visual,
            BaMode::VisualInertial,
            BaMode::VisualInertialTvs,
            BaMode::InertialTvs,
        ] {
            solvers.insert(mode, factory.create(mode));
        }
        Self {
            selfcal_rig: rig,
            queue: WindowQueue::new(queue_length),
            weights,
            tuning,
            min_poses_for_imu,
            solvers,
        }
    }

    pub fn queue(&self) -> &WindowQueue {
        &self.queue
    }

    pub fn needs_update(&self) -> bool {
        self.queue.needs_update()
    }

    pub fn clear_queue(&mut self) {
        self.queue.clear();
    }

    /// Mark the pending membership change as consumed.
    pub fn finish_queue_update(&mut self) {
        self.queue.clear_needs_update();
    }

    pub fn num_windows(&self) -> usize {
        self.queue.len()
    }

    pub fn queue_length(&self) -> usize {
        self.queue.queue_length()
    }

    pub fn selfcal_rig(&self) -> &Rig {
        &self.selfcal_rig
    }

    /// Weighted log-det score of a window under this calibrator's weights.
    pub fn window_score(&self, window: &CalibrationWindow) -> f64 {
        window_score(window, &self.weights.resized(window.mean.len()))
    }

    pub fn set_queue_distribution(&mut self, window: &CalibrationWindow) {
        self.queue.set_distribution(
            window.covariance.clone(),
            window.mean.clone(),
            window.num_measurements,
        );
    }

    /// Offer a candidate to the priority queue.
    pub fn try_admit(&mut self, candidate: &mut CalibrationWindow) -> AdmitOutcome {
        let weights = self.weights.resized(candidate.mean.len());
        self.queue.try_admit(candidate, &weights)
    }

    /// Solve the calibration posterior over `[start_pose, end_pose)`.
    ///
    /// On `apply = true` and a full-rank posterior, the refined parameters
    /// are committed to the live rig and propagated to the pose snapshots
    /// from `apply_from` on, all under the BA mutex. A sub-two-pose range
    /// returns an empty window and touches nothing.
    #[allow(clippy::too_many_arguments)]
    pub fn analyze_window(
        &mut self,
        shared: &Mutex<SharedState>,
        imu_buffer: &ImuBuffer,
        start_pose: usize,
        end_pose: usize,
        iterations: usize,
        apply: bool,
        apply_from: usize,
        mode: BaMode,
    ) -> CalibrationWindow {
        if end_pose.saturating_sub(start_pose) < 2 {
            return CalibrationWindow::default();
        }
        let segments = vec![Segment::all_active(start_pose, end_pose)];
        self.solve_segments(shared, imu_buffer, segments, iterations, apply, apply_from, mode)
            .map(|mut w| {
                w.start_index = start_pose;
                w.end_index = end_pose;
                w
            })
            .unwrap_or_default()
    }

    /// Joint solve over the union of all queued windows, with the
    /// calibration tied to a single parameter vector across segments.
    /// Returns the pooled posterior used as the queue distribution.
    pub fn analyze_priority_queue(
        &mut self,
        shared: &Mutex<SharedState>,
        imu_buffer: &ImuBuffer,
        iterations: usize,
        apply: bool,
        apply_from: usize,
        mode: BaMode,
    ) -> CalibrationWindow {
        let ranges = self.queue.ranges();
        if ranges.is_empty() {
            return CalibrationWindow::default();
        }
        let segments: Vec<Segment> = ranges
            .iter()
            .map(|&(s, e)| Segment::all_active(s, e))
            .collect();
        self.solve_segments(shared, imu_buffer, segments, iterations, apply, apply_from, mode)
            .map(|mut w| {
                w.start_index = ranges[0].0;
                w.end_index = ranges[ranges.len() - 1].1;
                w
            })
            .unwrap_or_default()
    }

    #[allow(clippy::too_many_arguments)]
    fn solve_segments(
        &mut self,
        shared: &Mutex<SharedState>,
        imu_buffer: &ImuBuffer,
        segments: Vec<Segment>,
        iterations: usize,
        apply: bool,
        apply_from: usize,
        mode: BaMode,
    ) -> Option<CalibrationWindow> {
        // The posterior is solved around the live parameters.
        {
            let state = lock(shared);
            let params = state.live_rig.primary().params();
            self.selfcal_rig.primary_mut().set_params(&params);
            self.selfcal_rig.primary_mut().t_bc = state.live_rig.primary().t_bc;
        }

        // Intrinsics stay fixed in the extrinsics-only parameterisation.
        let estimate_cam_params = mode != BaMode::InertialTvs;
        let spec = BaRunSpec {
            slot: SELFCAL_SLOT,
            mode,
            estimate_cam_params,
            iterations,
            segments,
            longest_track_id: None,
            do_adaptive: false,
            is_keyframe: true,
            do_outlier_rejection: false,
            min_poses_for_imu: self.min_poses_for_imu,
        };
        let solver = self.solvers.get_mut(&mode)?;
        let result = match ba::run(
            shared,
            solver.as_mut(),
            imu_buffer,
            &self.tuning,
            RigSource::Live,
            &spec,
            None,
        ) {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(error = %e, "calibration window solve skipped");
                return None;
            }
        };

        let mut window = CalibrationWindow::default();
        let mut mean_parts: Vec<f64> = Vec::new();
        if let Some(params) = &result.refined_params {
            mean_parts.extend(params.iter());
            self.selfcal_rig.primary_mut().set_params(params);
        }
        if let Some(t_bc) = &result.refined_t_bc {
            mean_parts.extend(se3_tangent(t_bc).iter());
            self.selfcal_rig.primary_mut().t_bc = *t_bc;
        }
        window.mean = DVector::from_vec(mean_parts);
        if let Some(cov) = result.calibration_covariance {
            window.covariance = cov;
        }
        window.num_measurements = result.num_proj_residuals;
        window.score = self.window_score(&window);

        let dim = window.mean.len();
        let full_rank = is_full_rank(&window.covariance, dim);
        if !full_rank {
            tracing::debug!(
                rank = crate::window::covariance_rank(&window.covariance),
                dim,
                "calibration posterior is rank deficient"
            );
        }

        if apply && full_rank {
            let params = result.refined_params.clone();
            let t_bc = result.refined_t_bc;
            let mut state = lock(shared);
            apply_parameters(&mut state, params.as_ref(), t_bc.as_ref(), apply_from);
        }

        Some(window)
    }
}

/// Commit accepted parameters: live rig camera 0, the parameter snapshot of
/// every pose from `apply_from` on, and every affected track's reference
/// ray, which is flagged for re-projection. Callers hold the BA mutex.
pub fn apply_parameters(
    state: &mut SharedState,
    params: Option<&DVector<f64>>,
    t_bc: Option<&Isometry3<f64>>,
    apply_from: usize,
) {
    if let Some(params) = params {
        state.live_rig.primary_mut().set_params(params);
    }
    if let Some(t_bc) = t_bc {
        state.live_rig.primary_mut().t_bc = *t_bc;
    }
    let params = params
        .cloned()
        .unwrap_or_else(|| state.live_rig.primary().params());
    let (live_rig, poses) = (&state.live_rig, &mut state.poses);
    let start = apply_from.min(poses.len());
    tracing::info!(
        apply_from = start,
        num_poses = poses.len(),
        params = ?params.as_slice(),
        "applying calibration parameters"
    );
    for pose in &mut poses[start..] {
        pose.cam_params = params.clone();
        for track in &mut pose.tracks {
            track.ref_keypoint.ray = live_rig.primary().unproject_unit(&track.ref_keypoint.center_px);
            track.needs_backprojection = true;
        }
    }
}

/// Rebuild an extrinsics estimate from the tail of a calibration mean when
/// the mode appends one (diagnostics and tests).
pub fn tvs_from_mean(mean: &DVector<f64>, num_cam_params: usize) -> Option<Isometry3<f64>> {
    if mean.len() != num_cam_params + 6 {
        return None;
    }
    let tail = mean.rows(num_cam_params, 6).into_owned();
    Some(se3_from_tangent(&nalgebra::Vector6::from_iterator(
        tail.iter().copied(),
    )))
}
