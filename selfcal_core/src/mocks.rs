//! Test and helper mocks for selfcal_core

use nalgebra::{Isometry3, Vector2};
use selfcal_traits::{FeatureTracker, NewTrackSeed, TrackObservation};

/// A tracker that never produces tracks; useful when driving the engine's
/// calibration paths directly against a pre-populated pose store.
#[derive(Default)]
pub struct NoopTracker {
    t_ba: Isometry3<f64>,
}

impl FeatureTracker for NoopTracker {
    fn add_image(&mut self, _time: f64, _guess: &Isometry3<f64>) {}
    fn optimize_tracks(&mut self, _optimize_landmarks: bool, _optimize_pose: bool) {}
    fn prune_tracks(&mut self) {}
    fn add_keyframe(&mut self) {}
    fn start_new_landmarks(&mut self) {}
    fn current_observations(&self) -> Vec<TrackObservation> {
        Vec::new()
    }
    fn take_new_track_seeds(&mut self) -> Vec<NewTrackSeed> {
        Vec::new()
    }
    fn num_successful_tracks(&self) -> usize {
        0
    }
    fn longest_track_id(&self) -> u64 {
        u64::MAX
    }
    fn longest_track_len(&self) -> usize {
        0
    }
    fn t_ba(&self) -> Isometry3<f64> {
        self.t_ba
    }
    fn set_t_ba(&mut self, t_ba: &Isometry3<f64>) {
        self.t_ba = *t_ba;
    }
}

/// Fixed-intrinsics pinhole camera for unit tests (`[fx, fy, cx, cy]`).
pub struct TestPinhole {
    pub params: nalgebra::DVector<f64>,
    pub width: u32,
    pub height: u32,
}

impl TestPinhole {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self {
            params: nalgebra::DVector::from_row_slice(&[fx, fy, cx, cy]),
            width: 640,
            height: 480,
        }
    }
}

impl selfcal_traits::CameraModel for TestPinhole {
    fn num_params(&self) -> usize {
        self.params.len()
    }
    fn params(&self) -> nalgebra::DVector<f64> {
        self.params.clone()
    }
    fn set_params(&mut self, params: &nalgebra::DVector<f64>) {
        self.params = params.clone();
    }
    fn project(&self, ray: &nalgebra::Vector3<f64>) -> Vector2<f64> {
        let (fx, fy, cx, cy) = (self.params[0], self.params[1], self.params[2], self.params[3]);
        Vector2::new(fx * ray.x / ray.z + cx, fy * ray.y / ray.z + cy)
    }
    fn unproject(&self, px: &Vector2<f64>) -> nalgebra::Vector3<f64> {
        let (fx, fy, cx, cy) = (self.params[0], self.params[1], self.params[2], self.params[3]);
        nalgebra::Vector3::new((px.x - cx) / fx, (px.y - cy) / fy, 1.0)
    }
    fn width(&self) -> u32 {
        self.width
    }
    fn height(&self) -> u32 {
        self.height
    }
    fn clone_model(&self) -> Box<dyn selfcal_traits::CameraModel> {
        Box::new(Self {
            params: self.params.clone(),
            width: self.width,
            height: self.height,
        })
    }
}
