//! Parameter application semantics: live rig, pose snapshots, track rays.
use nalgebra::{DVector, Isometry3, Vector2};
use selfcal_core::calibrator::apply_parameters;
use selfcal_core::mocks::TestPinhole;
use selfcal_core::rig::{Rig, RigCamera};
use selfcal_core::store::{KeyframePose, SharedState};
use selfcal_core::track::{FeatureTrack, RefKeypoint};
use selfcal_traits::CameraModel;

fn state_with_tracks(num_poses: usize, tracks_per_pose: usize) -> SharedState {
    let cam = TestPinhole::new(320.0, 320.0, 320.0, 240.0);
    let rig = Rig::new(vec![RigCamera::new(Box::new(cam), Isometry3::identity())]);
    let mut state = SharedState::new(rig);
    let mut next_id = 0;
    for idx in 0..num_poses {
        let params = state.live_rig.primary().params();
        let mut pose = KeyframePose::new(Isometry3::identity(), params, idx as f64);
        for t in 0..tracks_per_pose {
            let px = Vector2::new(100.0 + 40.0 * t as f64, 120.0 + 10.0 * idx as f64);
            let ray = state.live_rig.primary().unproject_unit(&px);
            pose.tracks.push(FeatureTrack::new(
                next_id,
                idx,
                RefKeypoint {
                    center_px: px,
                    ray,
                    rho: 1.0,
                },
                1,
            ));
            next_id += 1;
        }
        state.poses.push(pose);
    }
    state
}

#[test]
fn application_updates_rig_snapshots_and_rays() {
    let mut state = state_with_tracks(8, 3);
    let new_params = DVector::from_row_slice(&[400.0, 400.0, 318.0, 242.0]);
    apply_parameters(&mut state, Some(&new_params), None, 5);

    assert_eq!(state.live_rig.primary().params(), new_params);
    for (idx, pose) in state.poses.iter().enumerate() {
        if idx < 5 {
            // Untouched prefix keeps the creation-time snapshot.
            assert_ne!(pose.cam_params, new_params, "pose {idx} touched");
            for track in &pose.tracks {
                assert!(!track.needs_backprojection);
            }
        } else {
            assert_eq!(pose.cam_params, new_params, "pose {idx} missed");
            for track in &pose.tracks {
                assert!(track.needs_backprojection, "track {} not flagged", track.id);
                // Ray re-derived from the new model reprojects onto the
                // stored pixel center.
                let px = state.live_rig.primary().model.project(&track.ref_keypoint.ray);
                assert!((px - track.ref_keypoint.center_px).norm() < 1e-9);
            }
        }
    }
}

#[test]
fn extrinsics_only_application_keeps_params() {
    let mut state = state_with_tracks(4, 2);
    let old_params = state.live_rig.primary().params();
    let t_bc = Isometry3::translation(0.05, -0.01, 0.002);
    apply_parameters(&mut state, None, Some(&t_bc), 0);

    assert_eq!(state.live_rig.primary().params(), old_params);
    assert!((state.live_rig.primary().t_bc.translation.vector
        - t_bc.translation.vector)
        .norm()
        < 1e-12);
    // Snapshots still refreshed (from the unchanged live params) and tracks
    // flagged, since the projection geometry moved.
    for pose in &state.poses {
        assert_eq!(pose.cam_params, old_params);
        for track in &pose.tracks {
            assert!(track.needs_backprojection);
        }
    }
}

#[test]
fn apply_from_past_the_end_is_a_noop_on_poses() {
    let mut state = state_with_tracks(3, 1);
    let new_params = DVector::from_row_slice(&[500.0, 500.0, 320.0, 240.0]);
    apply_parameters(&mut state, Some(&new_params), None, 10);
    assert_eq!(state.live_rig.primary().params(), new_params);
    for pose in &state.poses {
        assert_ne!(pose.cam_params, new_params);
    }
}
