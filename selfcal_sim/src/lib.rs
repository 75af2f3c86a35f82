#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Synthetic backends for the self-calibration engine.
//!
//! Provides everything needed to run the engine without hardware or a real
//! solver: an FOV-distortion camera model, a scripted feature tracker fed by
//! a synthetic landmark field, a scripted bundle-adjustment backend whose
//! posterior converges towards a configurable ground truth, and IMU sample
//! synthesis with Gaussian noise. All randomness is seeded, so simulated
//! runs are reproducible.
pub mod camera;
pub mod imu;
pub mod solver;
pub mod tracker;

pub use camera::FovCamera;
pub use imu::StationaryImu;
pub use solver::{CondSample, SimTruth, SyntheticBa, SyntheticBaFactory};
pub use tracker::{ScriptedTracker, TrackerSimCfg};
