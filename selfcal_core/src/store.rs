//! Keyframe poses and the thread-shared engine state.
//!
//! The pose sequence, the live rig, and the async rig are owned by a single
//! `Mutex<SharedState>`. That mutex is the BA mutex of the concurrency
//! model: problem assembly, result readback, and parameter application all
//! run under it, while `solve` itself runs unlocked.
use std::sync::{Arc, Mutex, MutexGuard};

use nalgebra::{DVector, Isometry3, Vector3, Vector6};

use crate::rig::Rig;
use crate::track::FeatureTrack;

/// BA instance slots: foreground, async (adaptive conditioning), self-cal.
pub const NUM_BA_SLOTS: usize = 3;
pub const FOREGROUND_SLOT: usize = 0;
pub const ASYNC_SLOT: usize = 1;
pub const SELFCAL_SLOT: usize = 2;

/// A keyframe pose with its inertial state, parameter snapshot, and the
/// tracks born at it. Poses are appended on keyframe detection and never
/// removed; indices are stable.
#[derive(Debug, Clone)]
pub struct KeyframePose {
    pub t_wp: Isometry3<f64>,
    pub v_w: Vector3<f64>,
    /// Bias, accel then gyro.
    pub b: Vector6<f64>,
    /// Image timestamp plus the configured IMU time offset, seconds.
    pub time: f64,
    /// Camera-0 parameter snapshot at creation (or last application).
    pub cam_params: DVector<f64>,
    /// Pose slot ids, one per BA instance; reset whenever that BA rebuilds.
    pub opt_id: [usize; NUM_BA_SLOTS],
    /// Longest covisible track length observed at this pose.
    pub longest_track: usize,
    pub tracks: Vec<FeatureTrack>,
}

impl KeyframePose {
    pub fn new(t_wp: Isometry3<f64>, cam_params: DVector<f64>, time: f64) -> Self {
        Self {
            t_wp,
            v_w: Vector3::zeros(),
            b: Vector6::zeros(),
            time,
            cam_params,
            opt_id: [selfcal_traits::UNASSIGNED; NUM_BA_SLOTS],
            longest_track: 0,
            tracks: Vec::new(),
        }
    }
}

/// Everything the two threads mutate, behind the single BA mutex.
#[derive(Debug)]
pub struct SharedState {
    pub poses: Vec<KeyframePose>,
    pub live_rig: Rig,
    pub async_rig: Rig,
    /// One-shot request to clear all outlier marks before the next solve.
    pub reset_outliers: bool,
}

impl SharedState {
    pub fn new(live_rig: Rig) -> Self {
        let async_rig = live_rig.clone();
        Self {
            poses: Vec::new(),
            live_rig,
            async_rig,
            reset_outliers: false,
        }
    }
}

/// Shared handle passed to the background thread and the calibrator.
pub type Shared = Arc<Mutex<SharedState>>;

/// Lock helper that survives a poisoned mutex (a panicked solver thread
/// must not wedge the engine).
pub fn lock(shared: &Mutex<SharedState>) -> MutexGuard<'_, SharedState> {
    match shared.lock() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}
