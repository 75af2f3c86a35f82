#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Traits that define the estimation back-end and sensor front-end seams.
//!
//! - `BaSolver` is the bundle-adjustment back-end: the engine registers poses,
//!   landmarks, and residuals, calls `solve`, and reads the refined state plus
//!   the posterior covariance of the calibration block back out.
//! - `FeatureTracker` produces 2D keypoint observations with per-frame
//!   associations and the inter-keyframe delta transform.
//! - `CameraModel` is the projection model: intrinsic parameter vector plus
//!   project/unproject.
//! - `clock` offers a `MonotonicClock` for deterministic timing and testability.
//!
//! The engine crate depends only on these traits, so solver, tracker, and
//! camera implementations can be swapped (including fully scripted ones for
//! tests) without touching the calibration logic.
pub mod clock;

pub use clock::{Clock, MonotonicClock};

use nalgebra::{DMatrix, DVector, Isometry3, Vector2, Vector3, Vector4, Vector6};

/// Slot-id value meaning "not registered with this BA instance".
pub const UNASSIGNED: usize = usize::MAX;

/// A single gyro + accel sample.
#[derive(Debug, Clone, Copy)]
pub struct ImuMeasurement {
    /// Angular rate (rad/s), body frame.
    pub w: Vector3<f64>,
    /// Specific force (m/s^2), body frame.
    pub a: Vector3<f64>,
    /// Device time (seconds).
    pub time: f64,
}

impl ImuMeasurement {
    pub fn new(w: Vector3<f64>, a: Vector3<f64>, time: f64) -> Self {
        Self { w, a, time }
    }
}

/// Which bundle-adjustment parameterisation a solver instance implements.
///
/// The (pose-dim, calibration-dim) pairing is fixed per variant; the
/// calibration dimension additionally depends on the camera parameter count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaMode {
    /// Pose dim 6, camera intrinsics free.
    Visual,
    /// Pose dim 15 (pose + velocity + bias), camera intrinsics free.
    VisualInertial,
    /// Pose dim 15, camera intrinsics and camera-to-body transform free.
    VisualInertialTvs,
    /// Pose dim 15, only the camera-to-body transform free.
    InertialTvs,
}

impl BaMode {
    pub fn uses_imu(self) -> bool {
        !matches!(self, BaMode::Visual)
    }

    pub fn estimates_tvs(self) -> bool {
        matches!(self, BaMode::VisualInertialTvs | BaMode::InertialTvs)
    }

    /// Dimension of a single pose block.
    pub fn pose_dim(self) -> usize {
        if self.uses_imu() { 15 } else { 6 }
    }

    /// Length of the free calibration vector for a camera with
    /// `num_cam_params` intrinsics.
    pub fn calibration_dim(self, num_cam_params: usize) -> usize {
        match self {
            BaMode::Visual | BaMode::VisualInertial => num_cam_params,
            BaMode::VisualInertialTvs => num_cam_params + 6,
            BaMode::InertialTvs => 6,
        }
    }
}

/// Solver options assembled by the facade before every `init`.
#[derive(Debug, Clone)]
pub struct BaOptions {
    pub gyro_sigma: f64,
    pub accel_sigma: f64,
    pub gyro_bias_sigma: f64,
    pub accel_bias_sigma: f64,
    pub use_dogleg: bool,
    pub use_sparse_solver: bool,
    pub param_change_threshold: f64,
    pub error_change_threshold: f64,
    pub use_robust_norm_for_proj_residuals: bool,
    pub projection_outlier_threshold: f64,
    pub use_per_pose_cam_params: bool,
    pub regularize_biases_in_batch: bool,
    /// Treat the camera intrinsics as free variables (self-cal solves) or
    /// hold them fixed (odometry solves).
    pub estimate_cam_params: bool,
    /// Gravity vector in the world frame.
    pub gravity: Vector3<f64>,
    /// Parameterisation this instance must implement.
    pub mode: BaMode,
}

impl Default for BaOptions {
    fn default() -> Self {
        Self {
            gyro_sigma: 5.3088444e-5,
            accel_sigma: 1.6e-3,
            gyro_bias_sigma: 1.4125375e-5,
            accel_bias_sigma: 1.2589254e-2,
            use_dogleg: true,
            use_sparse_solver: true,
            param_change_threshold: 1e-10,
            error_change_threshold: 1e-3,
            use_robust_norm_for_proj_residuals: false,
            projection_outlier_threshold: 1.0,
            use_per_pose_cam_params: true,
            regularize_biases_in_batch: false,
            estimate_cam_params: false,
            gravity: Vector3::new(0.0, 0.0, -9.806),
            mode: BaMode::Visual,
        }
    }
}

/// A pose as stored inside the solver.
#[derive(Debug, Clone)]
pub struct PoseEstimate {
    pub t_wp: Isometry3<f64>,
    pub v_w: Vector3<f64>,
    pub b: Vector6<f64>,
    pub is_active: bool,
    pub time: f64,
}

/// Per-solve statistics, including the conditioning split used by the
/// adaptive window loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct SolutionSummary {
    /// Inertial error coupling active poses to the fixed prefix.
    pub cond_inertial_error: f64,
    /// Projection error coupling active poses to the fixed prefix.
    pub cond_proj_error: f64,
    pub num_cond_inertial_residuals: usize,
    pub num_cond_proj_residuals: usize,
}

/// Bundle-adjustment back-end.
///
/// One instance per (mode, consumer) pairing; instances are rebuilt with
/// `init` before each solve, so ids returned by the `add_*` calls are only
/// valid until the next `init`.
pub trait BaSolver: Send {
    fn init(&mut self, options: &BaOptions, num_poses: usize, num_landmarks: usize);
    fn add_camera(&mut self, params: &DVector<f64>, t_bc: &Isometry3<f64>);
    #[allow(clippy::too_many_arguments)]
    fn add_pose(
        &mut self,
        t_wp: &Isometry3<f64>,
        cam_params: &DVector<f64>,
        v_w: &Vector3<f64>,
        b: &Vector6<f64>,
        is_active: bool,
        time: f64,
    ) -> usize;
    /// Add a unary prior on the selected components of a pose.
    fn regularize_pose(
        &mut self,
        pose_id: usize,
        translation: bool,
        rotation: bool,
        velocity: bool,
        bias: bool,
    );
    /// Landmark as homogeneous world ray `[x, y, z, rho]` anchored at `pose_id`.
    fn add_landmark(
        &mut self,
        ray_w: &Vector4<f64>,
        pose_id: usize,
        cam_id: usize,
        is_active: bool,
    ) -> usize;
    fn add_projection_residual(
        &mut self,
        z: &Vector2<f64>,
        pose_id: usize,
        landmark_id: usize,
        cam_id: usize,
        weight: f64,
    ) -> usize;
    fn add_imu_residual(
        &mut self,
        pose0_id: usize,
        pose1_id: usize,
        measurements: &[ImuMeasurement],
    ) -> usize;
    fn solve(&mut self, iterations: usize);

    fn num_poses(&self) -> usize;
    fn pose(&self, pose_id: usize) -> PoseEstimate;
    /// Solved landmark as homogeneous world point `[x, y, z, w]`.
    fn landmark(&self, landmark_id: usize) -> Vector4<f64>;
    /// Fraction of this landmark's residuals flagged by the robust norm.
    fn landmark_outlier_ratio(&self, landmark_id: usize) -> f64;
    /// Post-solve residual (pixels) for a projection constraint.
    fn projection_residual(&self, residual_id: usize) -> Vector2<f64>;
    /// Mahalanobis distance of an inertial residual.
    fn imu_residual_mahalanobis(&self, residual_id: usize) -> f64;
    fn solution_summary(&self) -> SolutionSummary;

    /// Refined intrinsics for a camera (mode-dependent; fixed modes return
    /// the input parameters unchanged).
    fn camera_params(&self, cam_id: usize) -> DVector<f64>;
    /// Refined camera-to-body transform, when the mode estimates it.
    fn camera_pose(&self, cam_id: usize) -> Isometry3<f64>;
    /// Posterior covariance of the calibration block, ordered like the
    /// parameter vector (intrinsics first, then tvs tangent components).
    /// `None` when the mode holds calibration fixed.
    fn calibration_covariance(&self) -> Option<DMatrix<f64>>;
}

/// Constructs solver instances for the facade. Implementations decide how a
/// `BaMode` maps onto their own parameterisation machinery.
pub trait BaSolverFactory: Send {
    fn create(&self, mode: BaMode) -> Box<dyn BaSolver>;
}

/// One keypoint observation of a live track in the newest image.
#[derive(Debug, Clone, Copy)]
pub struct TrackObservation {
    pub track_id: u64,
    pub cam_id: usize,
    pub px: Vector2<f64>,
    /// False when the tracker lost the point this frame but keeps the slot.
    pub tracked: bool,
}

/// A track born at the current keyframe.
#[derive(Debug, Clone, Copy)]
pub struct NewTrackSeed {
    pub track_id: u64,
    pub center_px: Vector2<f64>,
}

/// Semi-dense feature tracker front-end.
pub trait FeatureTracker: Send {
    /// Ingest the next image with a pose-delta guess (current-from-last-keyframe).
    fn add_image(&mut self, time: f64, guess: &Isometry3<f64>);
    fn optimize_tracks(&mut self, optimize_landmarks: bool, optimize_pose: bool);
    fn prune_tracks(&mut self);
    /// Latch the current frame as the new reference keyframe.
    fn add_keyframe(&mut self);
    /// Spawn new tracks in under-covered image regions.
    fn start_new_landmarks(&mut self);

    /// Observations of all live tracks in the newest frame.
    fn current_observations(&self) -> Vec<TrackObservation>;
    /// Drain the seeds created by the last `start_new_landmarks`.
    fn take_new_track_seeds(&mut self) -> Vec<NewTrackSeed>;
    fn num_successful_tracks(&self) -> usize;
    fn longest_track_id(&self) -> u64;
    fn longest_track_len(&self) -> usize;
    /// Delta transform from the last keyframe to the current frame.
    fn t_ba(&self) -> Isometry3<f64>;
    fn set_t_ba(&mut self, t_ba: &Isometry3<f64>);
}

/// Camera projection model with a flat intrinsic parameter vector.
pub trait CameraModel: Send {
    fn num_params(&self) -> usize;
    fn params(&self) -> DVector<f64>;
    fn set_params(&mut self, params: &DVector<f64>);
    /// Project a camera-frame ray to pixel coordinates.
    fn project(&self, ray: &Vector3<f64>) -> Vector2<f64>;
    /// Back-project a pixel to a camera-frame ray (not normalized).
    fn unproject(&self, px: &Vector2<f64>) -> Vector3<f64>;
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    /// Clone into a new boxed model (rigs are snapshotted across threads).
    fn clone_model(&self) -> Box<dyn CameraModel>;
}

// Allow boxed trait objects to be used where a generic bound is expected.
impl<T: ?Sized + BaSolver> BaSolver for Box<T> {
    fn init(&mut self, options: &BaOptions, num_poses: usize, num_landmarks: usize) {
        (**self).init(options, num_poses, num_landmarks);
    }
    fn add_camera(&mut self, params: &DVector<f64>, t_bc: &Isometry3<f64>) {
        (**self).add_camera(params, t_bc);
    }
    fn add_pose(
        &mut self,
        t_wp: &Isometry3<f64>,
        cam_params: &DVector<f64>,
        v_w: &Vector3<f64>,
        b: &Vector6<f64>,
        is_active: bool,
        time: f64,
    ) -> usize {
        (**self).add_pose(t_wp, cam_params, v_w, b, is_active, time)
    }
    fn regularize_pose(
        &mut self,
        pose_id: usize,
        translation: bool,
        rotation: bool,
        velocity: bool,
        bias: bool,
    ) {
        (**self).regularize_pose(pose_id, translation, rotation, velocity, bias);
    }
    fn add_landmark(
        &mut self,
        ray_w: &Vector4<f64>,
        pose_id: usize,
        cam_id: usize,
        is_active: bool,
    ) -> usize {
        (**self).add_landmark(ray_w, pose_id, cam_id, is_active)
    }
    fn add_projection_residual(
        &mut self,
        z: &Vector2<f64>,
        pose_id: usize,
        landmark_id: usize,
        cam_id: usize,
        weight: f64,
    ) -> usize {
        (**self).add_projection_residual(z, pose_id, landmark_id, cam_id, weight)
    }
    fn add_imu_residual(
        &mut self,
        pose0_id: usize,
        pose1_id: usize,
        measurements: &[ImuMeasurement],
    ) -> usize {
        (**self).add_imu_residual(pose0_id, pose1_id, measurements)
    }
    fn solve(&mut self, iterations: usize) {
        (**self).solve(iterations);
    }
    fn num_poses(&self) -> usize {
        (**self).num_poses()
    }
    fn pose(&self, pose_id: usize) -> PoseEstimate {
        (**self).pose(pose_id)
    }
    fn landmark(&self, landmark_id: usize) -> Vector4<f64> {
        (**self).landmark(landmark_id)
    }
    fn landmark_outlier_ratio(&self, landmark_id: usize) -> f64 {
        (**self).landmark_outlier_ratio(landmark_id)
    }
    fn projection_residual(&self, residual_id: usize) -> Vector2<f64> {
        (**self).projection_residual(residual_id)
    }
    fn imu_residual_mahalanobis(&self, residual_id: usize) -> f64 {
        (**self).imu_residual_mahalanobis(residual_id)
    }
    fn solution_summary(&self) -> SolutionSummary {
        (**self).solution_summary()
    }
    fn camera_params(&self, cam_id: usize) -> DVector<f64> {
        (**self).camera_params(cam_id)
    }
    fn camera_pose(&self, cam_id: usize) -> Isometry3<f64> {
        (**self).camera_pose(cam_id)
    }
    fn calibration_covariance(&self) -> Option<DMatrix<f64>> {
        (**self).calibration_covariance()
    }
}

impl<T: ?Sized + CameraModel> CameraModel for Box<T> {
    fn num_params(&self) -> usize {
        (**self).num_params()
    }
    fn params(&self) -> DVector<f64> {
        (**self).params()
    }
    fn set_params(&mut self, params: &DVector<f64>) {
        (**self).set_params(params);
    }
    fn project(&self, ray: &Vector3<f64>) -> Vector2<f64> {
        (**self).project(ray)
    }
    fn unproject(&self, px: &Vector2<f64>) -> Vector3<f64> {
        (**self).unproject(px)
    }
    fn width(&self) -> u32 {
        (**self).width()
    }
    fn height(&self) -> u32 {
        (**self).height()
    }
    fn clone_model(&self) -> Box<dyn CameraModel> {
        (**self).clone_model()
    }
}

#[cfg(test)]
mod mode_tests {
    use super::BaMode;

    #[test]
    fn pose_and_calibration_dims() {
        assert_eq!(BaMode::Visual.pose_dim(), 6);
        assert_eq!(BaMode::VisualInertial.pose_dim(), 15);
        assert_eq!(BaMode::Visual.calibration_dim(5), 5);
        assert_eq!(BaMode::VisualInertial.calibration_dim(5), 5);
        assert_eq!(BaMode::VisualInertialTvs.calibration_dim(5), 11);
        assert_eq!(BaMode::InertialTvs.calibration_dim(5), 6);
    }

    #[test]
    fn imu_and_tvs_flags() {
        assert!(!BaMode::Visual.uses_imu());
        assert!(BaMode::InertialTvs.uses_imu());
        assert!(!BaMode::VisualInertial.estimates_tvs());
        assert!(BaMode::VisualInertialTvs.estimates_tvs());
    }
}
