//! Scripted bundle-adjustment backend.
//!
//! The solver accepts the full problem the facade registers, then produces a
//! posterior by blending the registered parameters towards a configured
//! ground truth, with a covariance shrinking in the measurement count.
//! Poses and landmarks pass through unchanged, so the engine's geometric
//! bookkeeping stays consistent. Conditioning statistics replay from a
//! schedule, which is how the adaptive-loop scenarios drive window growth.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use nalgebra::{DMatrix, DVector, Isometry3, Vector2, Vector3, Vector4, Vector6};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use selfcal_core::geometry::{se3_from_tangent, se3_tangent};
use selfcal_traits::{
    BaMode, BaOptions, BaSolver, BaSolverFactory, ImuMeasurement, PoseEstimate, SolutionSummary,
};

/// One replayed conditioning sample for the adaptive loop.
#[derive(Debug, Clone, Copy)]
pub struct CondSample {
    pub inertial_error: f64,
    pub proj_error: f64,
    pub num_inertial: usize,
    pub num_proj: usize,
}

/// Shared scripted world: ground truth and solver behaviour knobs. Tests
/// hold the handle and mutate it mid-run (parameter drift, rank collapse).
///
/// The true intrinsics are a step function of time, so a posterior solved
/// over old poses recovers the old parameters while one over fresh poses
/// sees the drifted values, exactly like re-solving recorded observations.
#[derive(Debug)]
pub struct SimTruth {
    /// `(valid_from_time, params)`, sorted by time; first entry covers -inf.
    epochs: Vec<(f64, DVector<f64>)>,
    /// True camera-from-body transform.
    pub t_bc: Isometry3<f64>,
    /// Per-iteration blend factor towards the truth.
    pub convergence_rate: f64,
    /// Posterior sigma of each parameter at one measurement.
    pub sigma_base: DVector<f64>,
    /// Collapse the fx/fy information (planar-degenerate motion).
    pub rank_deficient: bool,
    /// Reported per-landmark outlier ratio.
    pub outlier_ratio: f64,
    /// Conditioning statistics replayed one entry per solve.
    pub cond_schedule: VecDeque<CondSample>,
    pub noise_seed: u64,
    /// Registered pose count of every solve, in order (test observability).
    pub solve_log: Vec<usize>,
    /// Inertial residuals registered across all solver instances.
    pub total_imu_residuals: usize,
}

impl SimTruth {
    pub fn new(params: &[f64]) -> Self {
        let n = params.len();
        let mut sigma = DVector::from_element(n, 0.5);
        if n == 5 {
            // The distortion coefficient lives on a much smaller scale.
            sigma[4] = 1e-5;
        }
        Self {
            epochs: vec![(f64::NEG_INFINITY, DVector::from_row_slice(params))],
            t_bc: Isometry3::identity(),
            convergence_rate: 0.2,
            sigma_base: sigma,
            rank_deficient: false,
            outlier_ratio: 0.0,
            cond_schedule: VecDeque::new(),
            noise_seed: 42,
            solve_log: Vec::new(),
            total_imu_residuals: 0,
        }
    }

    /// True parameters in effect at `time`.
    pub fn params_at(&self, time: f64) -> &DVector<f64> {
        let idx = self
            .epochs
            .iter()
            .rposition(|(t, _)| *t <= time)
            .unwrap_or(0);
        &self.epochs[idx].1
    }

    pub fn current_params(&self) -> &DVector<f64> {
        &self.epochs[self.epochs.len() - 1].1
    }

    /// Start a new truth epoch at `from_time` (must be ahead of existing
    /// epochs).
    pub fn push_epoch(&mut self, from_time: f64, params: DVector<f64>) {
        self.epochs.push((from_time, params));
    }

    /// Convenience: scale one parameter from `from_time` on.
    pub fn scale_param(&mut self, idx: usize, factor: f64, from_time: f64) {
        let mut params = self.current_params().clone();
        params[idx] *= factor;
        self.push_epoch(from_time, params);
    }
}

#[derive(Clone)]
pub struct SyntheticBaFactory {
    truth: Arc<Mutex<SimTruth>>,
}

impl SyntheticBaFactory {
    pub fn new(truth: SimTruth) -> Self {
        Self {
            truth: Arc::new(Mutex::new(truth)),
        }
    }

    /// A factory sharing an existing scripted world.
    pub fn from_handle(truth: Arc<Mutex<SimTruth>>) -> Self {
        Self { truth }
    }

    /// Shared handle for mid-run mutation from tests and the tracker.
    pub fn handle(&self) -> Arc<Mutex<SimTruth>> {
        self.truth.clone()
    }
}

impl BaSolverFactory for SyntheticBaFactory {
    fn create(&self, mode: BaMode) -> Box<dyn BaSolver> {
        Box::new(SyntheticBa::new(mode, self.truth.clone()))
    }
}

pub struct SyntheticBa {
    mode: BaMode,
    truth: Arc<Mutex<SimTruth>>,
    options: BaOptions,
    cameras: Vec<(DVector<f64>, Isometry3<f64>)>,
    poses: Vec<PoseEstimate>,
    landmarks: Vec<Vector4<f64>>,
    num_proj_residuals: usize,
    num_imu_residuals: usize,
    est_params: Option<DVector<f64>>,
    est_t_bc: Option<Isometry3<f64>>,
    covariance: Option<DMatrix<f64>>,
    summary: SolutionSummary,
    last_cond_inertial: f64,
    solve_counter: u64,
}

impl SyntheticBa {
    pub fn new(mode: BaMode, truth: Arc<Mutex<SimTruth>>) -> Self {
        Self {
            mode,
            truth,
            options: BaOptions::default(),
            cameras: Vec::new(),
            poses: Vec::new(),
            landmarks: Vec::new(),
            num_proj_residuals: 0,
            num_imu_residuals: 0,
            est_params: None,
            est_t_bc: None,
            covariance: None,
            summary: SolutionSummary::default(),
            last_cond_inertial: 0.0,
            solve_counter: 0,
        }
    }

    fn calibration_dim(&self) -> usize {
        let k = self.cameras.first().map_or(0, |(p, _)| p.len());
        let intrinsics = if self.options.estimate_cam_params { k } else { 0 };
        let tvs = if self.mode.estimates_tvs() { 6 } else { 0 };
        intrinsics + tvs
    }
}

impl BaSolver for SyntheticBa {
    fn init(&mut self, options: &BaOptions, _num_poses: usize, _num_landmarks: usize) {
        self.options = options.clone();
        self.cameras.clear();
        self.poses.clear();
        self.landmarks.clear();
        self.num_proj_residuals = 0;
        self.num_imu_residuals = 0;
        self.est_params = None;
        self.est_t_bc = None;
        self.covariance = None;
        self.summary = SolutionSummary::default();
    }

    fn add_camera(&mut self, params: &DVector<f64>, t_bc: &Isometry3<f64>) {
        self.cameras.push((params.clone(), *t_bc));
    }

    fn add_pose(
        &mut self,
        t_wp: &Isometry3<f64>,
        _cam_params: &DVector<f64>,
        v_w: &Vector3<f64>,
        b: &Vector6<f64>,
        is_active: bool,
        time: f64,
    ) -> usize {
        self.poses.push(PoseEstimate {
            t_wp: *t_wp,
            v_w: *v_w,
            b: *b,
            is_active,
            time,
        });
        self.poses.len() - 1
    }

    fn regularize_pose(&mut self, _: usize, _: bool, _: bool, _: bool, _: bool) {}

    fn add_landmark(
        &mut self,
        ray_w: &Vector4<f64>,
        _pose_id: usize,
        _cam_id: usize,
        _is_active: bool,
    ) -> usize {
        self.landmarks.push(*ray_w);
        self.landmarks.len() - 1
    }

    fn add_projection_residual(
        &mut self,
        _z: &Vector2<f64>,
        _pose_id: usize,
        _landmark_id: usize,
        _cam_id: usize,
        _weight: f64,
    ) -> usize {
        self.num_proj_residuals += 1;
        self.num_proj_residuals - 1
    }

    fn add_imu_residual(
        &mut self,
        _pose0_id: usize,
        _pose1_id: usize,
        _measurements: &[ImuMeasurement],
    ) -> usize {
        self.num_imu_residuals += 1;
        if let Ok(mut truth) = self.truth.lock() {
            truth.total_imu_residuals += 1;
        }
        self.num_imu_residuals - 1
    }

    fn solve(&mut self, iterations: usize) {
        self.solve_counter += 1;
        let mut truth = match self.truth.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        truth.solve_log.push(self.poses.len());
        tracing::trace!(
            poses = self.poses.len(),
            landmarks = self.landmarks.len(),
            proj_residuals = self.num_proj_residuals,
            iterations,
            "scripted solve"
        );

        let n = self.num_proj_residuals.max(1) as f64;
        let blend = 1.0 - (1.0 - truth.convergence_rate).powi(iterations as i32);
        let mut rng =
            StdRng::seed_from_u64(truth.noise_seed ^ self.solve_counter.wrapping_mul(0x9E3779B9));

        if self.options.estimate_cam_params
            && let Some((p0, _)) = self.cameras.first()
        {
            // The recoverable truth is what the registered poses observed:
            // average the epoch parameters over the pose timestamps.
            let mut target = DVector::zeros(p0.len());
            let mut count = 0.0;
            for pose in &self.poses {
                let p = truth.params_at(pose.time);
                let k = p0.len().min(p.len());
                for i in 0..k {
                    target[i] += p[i];
                }
                count += 1.0;
            }
            if count > 0.0 {
                target /= count;
            } else {
                target.copy_from(p0);
            }
            let mut est = p0.clone();
            for i in 0..p0.len() {
                let u: f64 = rng.sample(StandardNormal);
                let sigma = truth.sigma_base.get(i).copied().unwrap_or(0.5);
                est[i] = p0[i] + (target[i] - p0[i]) * blend + sigma / n * u;
            }
            self.est_params = Some(est);
        }
        if self.mode.estimates_tvs()
            && let Some((_, t0)) = self.cameras.first()
        {
            let delta = se3_tangent(&(t0.inverse() * truth.t_bc)) * blend;
            self.est_t_bc = Some(t0 * se3_from_tangent(&delta));
        }

        let dim = self.calibration_dim();
        if dim > 0 {
            let mut diag = DVector::from_element(dim, 1e-4_f64 / n);
            let k = if self.options.estimate_cam_params {
                self.cameras.first().map_or(0, |(p, _)| p.len())
            } else {
                0
            };
            for i in 0..k {
                let sigma = truth.sigma_base.get(i).copied().unwrap_or(0.5);
                diag[i] = sigma * sigma / n;
            }
            if truth.rank_deficient && k >= 2 {
                // Focal lengths unobservable: no information along fx/fy.
                diag[0] = 0.0;
                diag[1] = 0.0;
            }
            self.covariance = Some(DMatrix::from_diagonal(&diag));
        }

        self.summary = if let Some(c) = truth.cond_schedule.pop_front() {
            self.last_cond_inertial = c.inertial_error;
            SolutionSummary {
                cond_inertial_error: c.inertial_error,
                cond_proj_error: c.proj_error,
                num_cond_inertial_residuals: c.num_inertial,
                num_cond_proj_residuals: c.num_proj,
            }
        } else {
            self.last_cond_inertial = 0.0;
            SolutionSummary::default()
        };
    }

    fn num_poses(&self) -> usize {
        self.poses.len()
    }

    fn pose(&self, pose_id: usize) -> PoseEstimate {
        self.poses[pose_id].clone()
    }

    fn landmark(&self, landmark_id: usize) -> Vector4<f64> {
        self.landmarks[landmark_id]
    }

    fn landmark_outlier_ratio(&self, _landmark_id: usize) -> f64 {
        match self.truth.lock() {
            Ok(g) => g.outlier_ratio,
            Err(p) => p.into_inner().outlier_ratio,
        }
    }

    fn projection_residual(&self, _residual_id: usize) -> Vector2<f64> {
        Vector2::zeros()
    }

    fn imu_residual_mahalanobis(&self, _residual_id: usize) -> f64 {
        self.last_cond_inertial
    }

    fn solution_summary(&self) -> SolutionSummary {
        self.summary
    }

    fn camera_params(&self, cam_id: usize) -> DVector<f64> {
        self.est_params
            .clone()
            .unwrap_or_else(|| self.cameras[cam_id].0.clone())
    }

    fn camera_pose(&self, cam_id: usize) -> Isometry3<f64> {
        self.est_t_bc.unwrap_or(self.cameras[cam_id].1)
    }

    fn calibration_covariance(&self) -> Option<DMatrix<f64>> {
        self.covariance.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(estimate: bool, mode: BaMode) -> BaOptions {
        BaOptions {
            estimate_cam_params: estimate,
            mode,
            ..BaOptions::default()
        }
    }

    fn register(ba: &mut SyntheticBa, initial: &[f64], num_proj: usize) {
        ba.init(&options(true, BaMode::Visual), 10, 100);
        ba.add_camera(&DVector::from_row_slice(initial), &Isometry3::identity());
        for i in 0..10 {
            ba.add_pose(
                &Isometry3::identity(),
                &DVector::from_row_slice(initial),
                &Vector3::zeros(),
                &Vector6::zeros(),
                true,
                i as f64,
            );
        }
        for _ in 0..num_proj {
            ba.add_projection_residual(&Vector2::zeros(), 0, 0, 0, 2.0);
        }
    }

    #[test]
    fn posterior_converges_to_truth() {
        let factory = SyntheticBaFactory::new(SimTruth::new(&[400.0, 400.0, 320.0, 240.0, 1.0]));
        let mut ba = SyntheticBa::new(BaMode::Visual, factory.handle());
        register(&mut ba, &[320.0, 320.0, 320.0, 240.0, 1.0], 500);
        ba.solve(50);
        let est = ba.camera_params(0);
        assert!((est[0] - 400.0).abs() < 1.0, "fx estimate {}", est[0]);
        let cov = ba.calibration_covariance().unwrap();
        assert_eq!(cov.nrows(), 5);
        assert!(cov[(0, 0)] > 0.0);
    }

    #[test]
    fn rank_deficiency_zeroes_focal_information() {
        let mut truth = SimTruth::new(&[400.0, 400.0, 320.0, 240.0, 1.0]);
        truth.rank_deficient = true;
        let factory = SyntheticBaFactory::new(truth);
        let mut ba = SyntheticBa::new(BaMode::Visual, factory.handle());
        register(&mut ba, &[400.0, 400.0, 320.0, 240.0, 1.0], 500);
        ba.solve(10);
        let cov = ba.calibration_covariance().unwrap();
        assert_eq!(cov[(0, 0)], 0.0);
        assert_eq!(cov[(1, 1)], 0.0);
        assert!(cov[(2, 2)] > 0.0);
    }

    #[test]
    fn conditioning_schedule_replays_in_order() {
        let mut truth = SimTruth::new(&[400.0, 400.0, 320.0, 240.0]);
        truth.cond_schedule.push_back(CondSample {
            inertial_error: 100.0,
            proj_error: 5.0,
            num_inertial: 1,
            num_proj: 10,
        });
        let factory = SyntheticBaFactory::new(truth);
        let mut ba = SyntheticBa::new(BaMode::VisualInertial, factory.handle());
        register(&mut ba, &[400.0, 400.0, 320.0, 240.0], 10);
        ba.solve(1);
        assert_eq!(ba.solution_summary().num_cond_proj_residuals, 10);
        assert_eq!(ba.imu_residual_mahalanobis(0), 100.0);
        ba.solve(1);
        assert_eq!(ba.solution_summary().num_cond_proj_residuals, 0);
    }
}
