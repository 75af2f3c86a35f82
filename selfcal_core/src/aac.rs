//! Background adaptive-conditioning loop.
//!
//! Spawns a thread that owns the async BA instance, snapshots the live
//! camera into the async rig, and re-solves a growing pose window until the
//! conditioning residuals pass their chi-square tests.
//!
//! Safety: each handle spawns exactly one thread that is shut down when the
//! handle is dropped, preventing thread leaks. The cooperative cancel flag
//! is checked at every sleep point.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use selfcal_traits::{BaMode, BaSolver};

use crate::ba::{self, AdaptiveState, BaRunSpec, BaTuning, RigSource, horizon_segment};
use crate::imu::ImuBuffer;
use crate::store::{ASYNC_SLOT, Shared, lock};

/// Pose count before the background loop starts solving at all.
const MIN_POSES_FOR_AAC: usize = 10;
const INNER_NAP: Duration = Duration::from_micros(10);
const OUTER_NAP: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct AacConfig {
    pub num_aac_poses: usize,
    pub adaptive_threshold: f64,
    /// When false the loop still solves, but never grows the window.
    pub do_adaptive: bool,
    pub min_poses_for_imu: usize,
    pub iterations: usize,
    pub tuning: BaTuning,
}

pub struct AdaptiveConditioning {
    shutdown: Arc<AtomicBool>,
    join_handle: Option<std::thread::JoinHandle<()>>,
    num_active_poses: Arc<AtomicUsize>,
}

impl AdaptiveConditioning {
    pub fn spawn(
        shared: Shared,
        imu_buffer: Arc<ImuBuffer>,
        mut solver: Box<dyn BaSolver>,
        cfg: AacConfig,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();
        let num_active_poses = Arc::new(AtomicUsize::new(cfg.num_aac_poses));
        let num_active_clone = num_active_poses.clone();

        let join_handle = std::thread::spawn(move || {
            let stop = || {
                shutdown_clone.load(Ordering::Relaxed) || cancel.load(Ordering::Relaxed)
            };
            let mut st = AdaptiveState::new(cfg.num_aac_poses, cfg.adaptive_threshold);
            loop {
                if stop() {
                    break;
                }
                let num_poses = lock(&shared).poses.len();
                if num_poses > MIN_POSES_FOR_AAC {
                    st.orig_num_aac_poses = cfg.num_aac_poses;
                    loop {
                        let num_poses = lock(&shared).poses.len();
                        if num_poses > cfg.min_poses_for_imu {
                            {
                                // Async BA solves against a snapshot of the live
                                // camera so a mid-solve application cannot tear it.
                                let mut state = lock(&shared);
                                let params = state.live_rig.primary().params();
                                let t_bc = state.live_rig.primary().t_bc;
                                state.async_rig.primary_mut().set_params(&params);
                                state.async_rig.primary_mut().t_bc = t_bc;
                            }
                            let spec = BaRunSpec {
                                slot: ASYNC_SLOT,
                                mode: BaMode::VisualInertial,
                                estimate_cam_params: false,
                                iterations: cfg.iterations,
                                segments: vec![horizon_segment(num_poses, st.num_active_poses)],
                                longest_track_id: None,
                                do_adaptive: cfg.do_adaptive,
                                is_keyframe: true,
                                do_outlier_rejection: false,
                                min_poses_for_imu: cfg.min_poses_for_imu,
                            };
                            match ba::run(
                                &shared,
                                solver.as_mut(),
                                &imu_buffer,
                                &cfg.tuning,
                                RigSource::Async,
                                &spec,
                                Some(&mut st),
                            ) {
                                Ok(_) => {
                                    num_active_clone
                                        .store(st.num_active_poses, Ordering::Relaxed);
                                }
                                Err(e) => {
                                    tracing::debug!(error = %e, "async solve skipped");
                                }
                            }
                        }

                        if st.num_active_poses == st.orig_num_aac_poses || !cfg.do_adaptive {
                            break;
                        }
                        if stop() {
                            break;
                        }
                        std::thread::sleep(INNER_NAP);
                    }
                    st.reset_cycle();
                }
                if stop() {
                    break;
                }
                std::thread::sleep(OUTER_NAP);
            }
            tracing::trace!("adaptive conditioning thread exiting cleanly");
        });

        Self {
            shutdown,
            join_handle: Some(join_handle),
            num_active_poses,
        }
    }

    /// Current active-window size of the async BA (observability for the
    /// viewer and tests).
    pub fn num_active_poses(&self) -> usize {
        self.num_active_poses.load(Ordering::Relaxed)
    }
}

impl Drop for AdaptiveConditioning {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.join_handle.take() {
            match handle.join() {
                Ok(()) => tracing::trace!("adaptive conditioning thread joined"),
                Err(e) => {
                    tracing::warn!(?e, "adaptive conditioning thread panicked during shutdown");
                }
            }
        }
    }
}
