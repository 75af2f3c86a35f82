//! Camera rig: ordered cameras, each a projection model plus its pose
//! relative to the body/IMU frame.
//!
//! Three rig instances co-exist at runtime: the live rig driven by the
//! foreground thread, the self-cal rig holding candidate parameters under
//! evaluation, and the async rig snapshotted by the background BA. After a
//! successful parameter application all three agree on camera 0.
use nalgebra::{DVector, Isometry3, Vector2, Vector3};
use selfcal_traits::CameraModel;

pub struct RigCamera {
    pub model: Box<dyn CameraModel>,
    /// Camera pose in the body frame.
    pub t_bc: Isometry3<f64>,
}

impl RigCamera {
    pub fn new(model: Box<dyn CameraModel>, t_bc: Isometry3<f64>) -> Self {
        Self { model, t_bc }
    }

    pub fn params(&self) -> DVector<f64> {
        self.model.params()
    }

    pub fn set_params(&mut self, params: &DVector<f64>) {
        self.model.set_params(params);
    }

    pub fn num_params(&self) -> usize {
        self.model.num_params()
    }

    /// Unit-norm back-projection of a pixel.
    pub fn unproject_unit(&self, px: &Vector2<f64>) -> Vector3<f64> {
        self.model.unproject(px).normalize()
    }
}

impl Clone for RigCamera {
    fn clone(&self) -> Self {
        Self {
            model: self.model.clone_model(),
            t_bc: self.t_bc,
        }
    }
}

impl std::fmt::Debug for RigCamera {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RigCamera")
            .field("params", &self.params())
            .field("t_bc", &self.t_bc)
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Rig {
    pub cameras: Vec<RigCamera>,
}

impl Rig {
    pub fn new(cameras: Vec<RigCamera>) -> Self {
        Self { cameras }
    }

    pub fn num_cameras(&self) -> usize {
        self.cameras.len()
    }

    /// Camera 0 is the calibration target throughout the engine.
    pub fn primary(&self) -> &RigCamera {
        &self.cameras[0]
    }

    pub fn primary_mut(&mut self) -> &mut RigCamera {
        &mut self.cameras[0]
    }
}
