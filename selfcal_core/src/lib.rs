#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Online self-calibration engine for a visual-inertial odometry pipeline
//! (solver- and tracker-agnostic). The estimation back-end, the feature
//! tracker, and the camera model all enter through `selfcal_traits`.
//!
//! ## Architecture
//!
//! - **Store**: keyframe poses with owned tracks, live/async rigs, all under
//!   the single BA mutex (`store` module)
//! - **BA facade**: one `run` over the four solver parameterisations (`ba`)
//! - **Calibrator**: posterior solves over pose windows, the priority queue
//!   of informative windows, parameter application (`calibrator`, `queue`,
//!   `window`)
//! - **Drift detection**: Yao-divergence change detector and batch
//!   recalibration gating (`detect`, `stats`)
//! - **Engine**: the front-end state machine and per-keyframe controller
//!   (`engine`)
//! - **Background**: adaptive-conditioning loop on its own thread (`aac`)
//!
//! ## Concurrency
//!
//! Two threads mutate shared state: the foreground capture/track/BA thread
//! and the background conditioning thread. Problem assembly, readback, and
//! parameter application serialise on one mutex; solves run unlocked. The
//! IMU driver appends to a lock-internal interpolation buffer from its own
//! thread.

pub mod aac;
pub mod ba;
pub mod calibrator;
pub mod detect;
pub mod engine;
pub mod error;
pub mod geometry;
pub mod imu;
pub mod logs;
pub mod math;
pub mod mocks;
pub mod queue;
pub mod rig;
pub mod stats;
pub mod store;
pub mod track;
pub mod window;

pub use ba::{BaRunSpec, BaTuning, RigSource, Segment, mode_from_flags};
pub use calibrator::OnlineCalibrator;
pub use detect::{ChangeDetector, DriftDecision};
pub use engine::{
    CalibrationStatus, EngineBuilder, EngineCfg, FrameSummary, KeyframeEvent, SelfCalEngine,
};
pub use error::{BuildError, CalibError, Result};
pub use imu::ImuBuffer;
pub use queue::{AdmitOutcome, WindowQueue};
pub use rig::{Rig, RigCamera};
pub use store::{KeyframePose, Shared, SharedState};
pub use track::{FeatureTrack, Observation, RefKeypoint};
pub use window::{CalibrationWindow, CovarianceWeights, window_score};
