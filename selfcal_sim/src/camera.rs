//! FOV-distortion camera model (`[fx, fy, cx, cy, w]`).
//!
//! The radial mapping follows the field-of-view model: an undistorted radius
//! `ru` maps to `rd = atan(2 ru tan(w/2)) / w`. With `w` near zero the model
//! degenerates to a plain pinhole.
use nalgebra::{DVector, Vector2, Vector3};
use selfcal_traits::CameraModel;

const W_PINHOLE_EPS: f64 = 1e-9;

#[derive(Debug, Clone)]
pub struct FovCamera {
    params: DVector<f64>,
    width: u32,
    height: u32,
}

impl FovCamera {
    pub fn new(params: &[f64], width: u32, height: u32) -> Self {
        assert!(
            params.len() == 4 || params.len() == 5,
            "fov camera takes 4 or 5 parameters"
        );
        Self {
            params: DVector::from_row_slice(params),
            width,
            height,
        }
    }

    fn w(&self) -> f64 {
        if self.params.len() == 5 {
            self.params[4]
        } else {
            0.0
        }
    }

    /// Distortion factor rd/ru for an undistorted radius.
    fn factor(&self, ru: f64) -> f64 {
        let w = self.w();
        if w.abs() < W_PINHOLE_EPS || ru < 1e-12 {
            return 1.0;
        }
        let mul2tanwby2 = 2.0 * (w / 2.0).tan();
        (ru * mul2tanwby2).atan() / (ru * w)
    }

    /// Inverse factor ru/rd for a distorted radius.
    fn factor_inv(&self, rd: f64) -> f64 {
        let w = self.w();
        if w.abs() < W_PINHOLE_EPS || rd < 1e-12 {
            return 1.0;
        }
        (rd * w).tan() / (rd * 2.0 * (w / 2.0).tan())
    }
}

impl CameraModel for FovCamera {
    fn num_params(&self) -> usize {
        self.params.len()
    }

    fn params(&self) -> DVector<f64> {
        self.params.clone()
    }

    fn set_params(&mut self, params: &DVector<f64>) {
        self.params = params.clone();
    }

    fn project(&self, ray: &Vector3<f64>) -> Vector2<f64> {
        let (fx, fy, cx, cy) = (self.params[0], self.params[1], self.params[2], self.params[3]);
        let xn = ray.x / ray.z;
        let yn = ray.y / ray.z;
        let ru = (xn * xn + yn * yn).sqrt();
        let f = self.factor(ru);
        Vector2::new(fx * f * xn + cx, fy * f * yn + cy)
    }

    fn unproject(&self, px: &Vector2<f64>) -> Vector3<f64> {
        let (fx, fy, cx, cy) = (self.params[0], self.params[1], self.params[2], self.params[3]);
        let xd = (px.x - cx) / fx;
        let yd = (px.y - cy) / fy;
        let rd = (xd * xd + yd * yd).sqrt();
        let f = self.factor_inv(rd);
        Vector3::new(f * xd, f * yd, 1.0)
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn clone_model(&self) -> Box<dyn CameraModel> {
        Box::new(self.clone())
    }
}
