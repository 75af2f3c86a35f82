//! Scripted feature tracker over a synthetic landmark field.
//!
//! The body translates sideways at a fixed step per frame while the camera
//! looks down +z at landmarks seeded inside the current frustum. Tracks live
//! until their landmark leaves the image; new landmarks are seeded back up
//! to the feature budget on every keyframe. Pixels come from the ground
//! truth camera in `SimTruth`, so a mid-run intrinsics change in the truth
//! shows up in the observations exactly like a physical drift would.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use nalgebra::{Isometry3, Translation3, Vector2, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use selfcal_traits::{CameraModel, FeatureTracker, NewTrackSeed, TrackObservation};

use crate::camera::FovCamera;
use crate::solver::SimTruth;

#[derive(Debug, Clone)]
pub struct TrackerSimCfg {
    pub num_features: usize,
    pub width: u32,
    pub height: u32,
    /// Body translation along +x per frame (meters).
    pub step_m: f64,
    /// Landmark depth range (meters).
    pub min_depth: f64,
    pub max_depth: f64,
    /// Pixel observation noise sigma.
    pub pixel_noise: f64,
    pub seed: u64,
}

impl Default for TrackerSimCfg {
    fn default() -> Self {
        Self {
            num_features: 128,
            width: 640,
            height: 480,
            step_m: 0.25,
            min_depth: 4.0,
            max_depth: 8.0,
            pixel_noise: 0.2,
            seed: 99,
        }
    }
}

struct LiveTrack {
    landmark: usize,
    born_frame: usize,
    px: Vector2<f64>,
    visible: bool,
}

pub struct ScriptedTracker {
    truth: Arc<Mutex<SimTruth>>,
    cfg: TrackerSimCfg,
    landmarks: Vec<Vector3<f64>>,
    live: HashMap<u64, LiveTrack>,
    seeds: Vec<NewTrackSeed>,
    next_id: u64,
    frame: usize,
    time: f64,
    t_wp: Isometry3<f64>,
    keyframe_t_wp: Isometry3<f64>,
    t_ba: Isometry3<f64>,
    rng: StdRng,
}

impl ScriptedTracker {
    pub fn new(truth: Arc<Mutex<SimTruth>>, cfg: TrackerSimCfg) -> Self {
        let seed = cfg.seed;
        Self {
            truth,
            cfg,
            landmarks: Vec::new(),
            live: HashMap::new(),
            seeds: Vec::new(),
            next_id: 0,
            frame: 0,
            time: 0.0,
            t_wp: Isometry3::identity(),
            keyframe_t_wp: Isometry3::identity(),
            t_ba: Isometry3::identity(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn truth_camera(&self, time: f64) -> (FovCamera, Isometry3<f64>) {
        let truth = match self.truth.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        (
            FovCamera::new(
                truth.params_at(time).as_slice(),
                self.cfg.width,
                self.cfg.height,
            ),
            truth.t_bc,
        )
    }
}

impl FeatureTracker for ScriptedTracker {
    fn add_image(&mut self, time: f64, _guess: &Isometry3<f64>) {
        self.frame += 1;
        self.time = time;
        self.t_wp = Isometry3::from_parts(
            Translation3::new(self.cfg.step_m * self.frame as f64, 0.0, 0.0),
            nalgebra::UnitQuaternion::identity(),
        );
        // Delta convention: current pose = previous * t_ba^-1.
        self.t_ba = self.t_wp.inverse() * self.keyframe_t_wp;

        let (camera, t_bc) = self.truth_camera(time);
        let t_cw = (self.t_wp * t_bc).inverse();
        let noise = self.cfg.pixel_noise;
        let (w, h) = (f64::from(self.cfg.width), f64::from(self.cfg.height));
        for track in self.live.values_mut() {
            let p_c = t_cw * nalgebra::Point3::from(self.landmarks[track.landmark]);
            if p_c.z <= 0.1 {
                track.visible = false;
                continue;
            }
            let mut px = camera.project(&p_c.coords);
            if noise > 0.0 {
                px.x += noise * self.rng.sample::<f64, _>(rand_distr::StandardNormal);
                px.y += noise * self.rng.sample::<f64, _>(rand_distr::StandardNormal);
            }
            track.visible = px.x >= 0.0 && px.y >= 0.0 && px.x < w && px.y < h;
            if track.visible {
                track.px = px;
            }
        }
    }

    fn optimize_tracks(&mut self, _optimize_landmarks: bool, _optimize_pose: bool) {}

    fn prune_tracks(&mut self) {
        self.live.retain(|_, t| t.visible);
    }

    fn add_keyframe(&mut self) {
        self.keyframe_t_wp = self.t_wp;
    }

    fn start_new_landmarks(&mut self) {
        let (camera, t_bc) = self.truth_camera(self.time);
        let t_wc = self.t_wp * t_bc;
        let before = self.live.len();
        while self.live.len() < self.cfg.num_features {
            let px = Vector2::new(
                self.rng.gen_range(20.0..f64::from(self.cfg.width) - 20.0),
                self.rng.gen_range(20.0..f64::from(self.cfg.height) - 20.0),
            );
            let depth = self.rng.gen_range(self.cfg.min_depth..self.cfg.max_depth);
            let ray = camera.unproject(&px).normalize() * depth;
            let p_w = t_wc * nalgebra::Point3::from(ray);
            self.landmarks.push(p_w.coords);

            let id = self.next_id;
            self.next_id += 1;
            self.live.insert(
                id,
                LiveTrack {
                    landmark: self.landmarks.len() - 1,
                    born_frame: self.frame,
                    px,
                    visible: true,
                },
            );
            self.seeds.push(NewTrackSeed {
                track_id: id,
                center_px: px,
            });
        }
        tracing::debug!(
            seeded = self.live.len() - before,
            live = self.live.len(),
            "landmarks replenished"
        );
    }

    fn current_observations(&self) -> Vec<TrackObservation> {
        self.live
            .iter()
            .filter(|(_, t)| t.visible)
            .map(|(&id, t)| TrackObservation {
                track_id: id,
                cam_id: 0,
                px: t.px,
                tracked: true,
            })
            .collect()
    }

    fn take_new_track_seeds(&mut self) -> Vec<NewTrackSeed> {
        std::mem::take(&mut self.seeds)
    }

    fn num_successful_tracks(&self) -> usize {
        self.live.values().filter(|t| t.visible).count()
    }

    fn longest_track_id(&self) -> u64 {
        self.live
            .iter()
            .min_by_key(|(_, t)| t.born_frame)
            .map_or(u64::MAX, |(&id, _)| id)
    }

    fn longest_track_len(&self) -> usize {
        self.live
            .values()
            .map(|t| self.frame - t.born_frame + 1)
            .max()
            .unwrap_or(0)
    }

    fn t_ba(&self) -> Isometry3<f64> {
        self.t_ba
    }

    fn set_t_ba(&mut self, t_ba: &Isometry3<f64>) {
        self.t_ba = *t_ba;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::{SimTruth, SyntheticBaFactory};

    fn tracker() -> ScriptedTracker {
        let factory = SyntheticBaFactory::new(SimTruth::new(&[400.0, 400.0, 320.0, 240.0, 0.9]));
        ScriptedTracker::new(factory.handle(), TrackerSimCfg::default())
    }

    #[test]
    fn seeds_fill_the_feature_budget() {
        let mut t = tracker();
        t.add_image(0.0, &Isometry3::identity());
        t.start_new_landmarks();
        assert_eq!(t.num_successful_tracks(), 128);
        assert_eq!(t.take_new_track_seeds().len(), 128);
        assert!(t.take_new_track_seeds().is_empty());
    }

    #[test]
    fn tracks_survive_small_motion_and_die_eventually() {
        let mut t = tracker();
        t.add_image(0.0, &Isometry3::identity());
        t.start_new_landmarks();
        t.add_keyframe();
        t.add_image(0.1, &Isometry3::identity());
        t.prune_tracks();
        assert!(t.num_successful_tracks() > 100);
        // Far enough along, all original landmarks leave the frustum.
        for i in 2..100 {
            t.add_image(i as f64 * 0.1, &Isometry3::identity());
            t.prune_tracks();
        }
        assert_eq!(t.num_successful_tracks(), 0);
    }

    #[test]
    fn keyframe_delta_grows_with_motion() {
        let mut t = tracker();
        t.add_image(0.0, &Isometry3::identity());
        t.add_keyframe();
        t.add_image(0.1, &Isometry3::identity());
        let d1 = t.t_ba().translation.vector.norm();
        assert!((d1 - 0.25).abs() < 1e-9);
    }
}
