//! Drive the engine over a simulated sequence built from the config.
use std::path::PathBuf;
use std::sync::atomic::Ordering;

use eyre::WrapErr;
use nalgebra::{Isometry3, Vector3};
use selfcal_core::geometry::se3_from_tangent;
use selfcal_core::{EngineCfg, Rig, RigCamera, SelfCalEngine};
use selfcal_config::Config;
use selfcal_sim::{FovCamera, ScriptedTracker, SimTruth, StationaryImu, SyntheticBaFactory, TrackerSimCfg};

pub struct RunOpts {
    pub frames: usize,
    pub drift_at: Option<usize>,
    pub drift_factor: f64,
    pub imu_log: Option<PathBuf>,
    pub frame_period: f64,
}

pub fn run(cfg: &Config, opts: &RunOpts) -> eyre::Result<()> {
    let truth = SimTruth::new(&cfg.rig.cam_params);
    let factory = SyntheticBaFactory::new(truth);
    let handle = factory.handle();

    let tracker_cfg = TrackerSimCfg {
        num_features: cfg.tracker.num_features,
        width: cfg.rig.width,
        height: cfg.rig.height,
        ..TrackerSimCfg::default()
    };
    let tracker = ScriptedTracker::new(factory.handle(), tracker_cfg);

    let t_bc = cfg
        .rig
        .t_bc
        .map(|v| se3_from_tangent(&nalgebra::Vector6::from_row_slice(&v)))
        .unwrap_or_else(Isometry3::identity);
    let rig = Rig::new(vec![RigCamera::new(
        Box::new(FovCamera::new(&cfg.rig.cam_params, cfg.rig.width, cfg.rig.height)),
        t_bc,
    )]);

    // A broken IMU source is not fatal: fall back to vision-only.
    let mut engine_cfg = EngineCfg::from_config(cfg);
    let imu_rows = match &opts.imu_log {
        Some(path) => match selfcal_config::load_imu_csv(path) {
            Ok(rows) => Some(rows),
            Err(e) => {
                tracing::warn!(?path, error = %e, "imu log unavailable, continuing without imu");
                engine_cfg.use_imu = false;
                engine_cfg.do_imu_self_cal = false;
                engine_cfg.do_adaptive = false;
                None
            }
        },
        None => None,
    };
    let use_imu = engine_cfg.use_imu;
    let do_adaptive = engine_cfg.do_adaptive;

    let mut engine = SelfCalEngine::builder()
        .with_tracker(tracker)
        .with_solver_factory(factory)
        .with_rig(rig)
        .with_config(engine_cfg)
        .try_build()
        .wrap_err("building engine")?;

    // Ctrl-C raises the engine's cooperative cancel flag.
    let cancel = engine.cancel_flag();
    ctrlc::set_handler(move || {
        eprintln!("\nstopping...");
        cancel.store(true, Ordering::SeqCst);
    })
    .wrap_err("installing signal handler")?;

    let mut imu_synth = StationaryImu::new(Vector3::new(0.0, 0.0, -9.806), 100.0, 11);
    let mut imu_cursor = 0usize;

    let events = engine.subscribe();
    if use_imu && do_adaptive {
        engine.start_background();
    }
    let cancel = engine.cancel_flag();

    for frame in 0..opts.frames {
        if cancel.load(Ordering::Relaxed) {
            tracing::info!(frame, "cancelled");
            break;
        }
        let t = frame as f64 * opts.frame_period;

        if let Some(at) = opts.drift_at
            && frame == at
        {
            let mut truth = handle.lock().map_err(|_| eyre::eyre!("truth poisoned"))?;
            truth.scale_param(0, opts.drift_factor, t - opts.frame_period / 2.0);
            tracing::warn!(frame, factor = opts.drift_factor, "injected fx drift");
        }

        if use_imu {
            let buffer = engine.imu_buffer();
            match &imu_rows {
                Some(rows) => {
                    // Feed slightly ahead so the engine never stalls waiting
                    // for the buffer to cover the frame timestamp.
                    let horizon = t + cfg.imu.time_offset + 0.05;
                    while imu_cursor < rows.len() && rows[imu_cursor].time <= horizon {
                        let r = &rows[imu_cursor];
                        buffer.add(
                            Vector3::new(r.gx, r.gy, r.gz),
                            Vector3::new(r.ax, r.ay, r.az),
                            r.time,
                        );
                        imu_cursor += 1;
                    }
                }
                None => {
                    for (w, a, ts) in imu_synth.samples_until(t + 0.01) {
                        buffer.add(w, a, ts);
                    }
                }
            }
        }

        let summary = engine.process_frame(t).wrap_err_with(|| format!("frame {frame}"))?;
        while let Ok(ev) = events.try_recv() {
            tracing::info!(
                keyframe = ev.keyframe_id,
                params = ?ev.params.as_slice(),
                divergence = ev.divergence,
                score = ev.score,
                recalibrating = ev.unknown_calibration,
                "keyframe"
            );
        }
        tracing::trace!(
            frame = summary.frame,
            keyframe = summary.is_keyframe,
            tracks = summary.num_successful_tracks,
            "frame done"
        );
    }

    let status = engine.calibration_status();
    let shared = engine.shared();
    let state = selfcal_core::store::lock(&shared);
    tracing::info!(
        num_poses = state.poses.len(),
        params = ?state.live_rig.primary().params().as_slice(),
        recalibrating = status.unknown_cam_calibration,
        "run finished"
    );
    Ok(())
}
