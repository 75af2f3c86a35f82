//! Small SE(3) helpers shared by the BA facade and the calibrator.
use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3, Vector4, Vector6};

/// Apply a rigid transform to a homogeneous landmark ray `[x, y, z, rho]`.
///
/// Landmarks are parameterised as a (not necessarily unit) direction with an
/// inverse-depth-like scale in the last component, so translation couples
/// through `rho` rather than through a plain point transform.
pub fn mult_homogeneous(t: &Isometry3<f64>, v: &Vector4<f64>) -> Vector4<f64> {
    let xyz = t.rotation * Vector3::new(v.x, v.y, v.z) + t.translation.vector * v.w;
    Vector4::new(xyz.x, xyz.y, xyz.z, v.w)
}

/// Tangent-space coordinates of a rigid transform: translation then
/// scaled rotation axis. Used to order the extrinsics block of the
/// calibration vector.
pub fn se3_tangent(t: &Isometry3<f64>) -> Vector6<f64> {
    let w = t.rotation.scaled_axis();
    let p = t.translation.vector;
    Vector6::new(p.x, p.y, p.z, w.x, w.y, w.z)
}

/// Rebuild a rigid transform from `se3_tangent` coordinates.
pub fn se3_from_tangent(v: &Vector6<f64>) -> Isometry3<f64> {
    let p = Translation3::new(v[0], v[1], v[2]);
    let r = UnitQuaternion::from_scaled_axis(Vector3::new(v[3], v[4], v[5]));
    Isometry3::from_parts(p, r)
}

/// Rotation magnitude of a transform in radians.
pub fn rotation_angle(t: &Isometry3<f64>) -> f64 {
    t.rotation.angle()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn homogeneous_transform_matches_point_transform() {
        let t = Isometry3::new(Vector3::new(0.3, -0.1, 2.0), Vector3::new(0.1, 0.2, -0.05));
        // rho = 1: behaves like a point transform of the unit-scale point.
        let v = Vector4::new(0.2, -0.4, 1.0, 1.0);
        let out = mult_homogeneous(&t, &v);
        let p = t * nalgebra::Point3::new(0.2, -0.4, 1.0);
        assert!((out.x - p.x).abs() < 1e-12);
        assert!((out.y - p.y).abs() < 1e-12);
        assert!((out.z - p.z).abs() < 1e-12);
        assert_eq!(out.w, 1.0);
    }

    #[test]
    fn rho_zero_transforms_direction_only() {
        let t = Isometry3::new(Vector3::new(5.0, 5.0, 5.0), Vector3::zeros());
        let v = Vector4::new(0.0, 0.0, 1.0, 0.0);
        let out = mult_homogeneous(&t, &v);
        assert_eq!(out, Vector4::new(0.0, 0.0, 1.0, 0.0));
    }

    #[test]
    fn tangent_round_trip() {
        let t = Isometry3::new(Vector3::new(0.1, 0.0, -0.3), Vector3::new(0.0, 0.2, 0.1));
        let v = se3_tangent(&t);
        let back = se3_from_tangent(&v);
        assert!((t.translation.vector - back.translation.vector).norm() < 1e-12);
        assert!(t.rotation.angle_to(&back.rotation) < 1e-12);
    }
}
