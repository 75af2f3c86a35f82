//! Feature tracks with inverse-depth reference keypoints.
use nalgebra::{Isometry3, Vector2, Vector3};

use crate::store::NUM_BA_SLOTS;
use selfcal_traits::UNASSIGNED;

/// The keypoint a track was born from: pixel center, unit back-projected
/// ray, and inverse depth along it.
#[derive(Debug, Clone)]
pub struct RefKeypoint {
    pub center_px: Vector2<f64>,
    pub ray: Vector3<f64>,
    pub rho: f64,
}

/// One observation of a track in one camera at one keyframe.
#[derive(Debug, Clone, Copy)]
pub struct Observation {
    pub px: Vector2<f64>,
    pub tracked: bool,
}

/// A feature track, owned by the pose at which it was born. The reference
/// pose is carried as a plain index into the pose sequence.
#[derive(Debug, Clone)]
pub struct FeatureTrack {
    pub id: u64,
    pub ref_pose_index: usize,
    pub ref_keypoint: RefKeypoint,
    /// Per keyframe since birth (index 0 = the reference keyframe itself),
    /// one observation per camera.
    pub keypoints: Vec<Vec<Observation>>,
    pub is_outlier: bool,
    /// Live in the newest frame.
    pub tracked: bool,
    pub num_good_tracked_frames: u32,
    /// Landmark slot ids, one per BA instance.
    pub external_id: [usize; NUM_BA_SLOTS],
    /// Raised when a parameter application invalidated the reference ray.
    pub needs_backprojection: bool,
    /// Delta transform readback from the last BA (reference to newest pose).
    pub t_ba: Isometry3<f64>,
}

impl FeatureTrack {
    pub fn new(id: u64, ref_pose_index: usize, ref_keypoint: RefKeypoint, num_cams: usize) -> Self {
        let first = vec![
            Observation {
                px: ref_keypoint.center_px,
                tracked: true,
            };
            num_cams
        ];
        Self {
            id,
            ref_pose_index,
            ref_keypoint,
            keypoints: vec![first],
            is_outlier: false,
            tracked: true,
            num_good_tracked_frames: 1,
            external_id: [UNASSIGNED; NUM_BA_SLOTS],
            needs_backprojection: false,
            t_ba: Isometry3::identity(),
        }
    }

    /// A track constrains a BA only once it has been tracked across more
    /// than one keyframe and has not been rejected.
    pub fn is_admissible(&self) -> bool {
        self.num_good_tracked_frames > 1 && !self.is_outlier
    }

    /// Number of keyframes this track spans (including its reference).
    pub fn num_frames(&self) -> usize {
        self.keypoints.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_track_is_not_admissible_until_tracked_again() {
        let kp = RefKeypoint {
            center_px: Vector2::new(100.0, 120.0),
            ray: Vector3::new(0.0, 0.0, 1.0),
            rho: 1.0,
        };
        let mut track = FeatureTrack::new(7, 3, kp, 1);
        assert!(!track.is_admissible());
        track.num_good_tracked_frames = 2;
        assert!(track.is_admissible());
        track.is_outlier = true;
        assert!(!track.is_admissible());
    }
}
