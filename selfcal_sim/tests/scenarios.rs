//! End-to-end scenarios against the scripted solver and tracker.
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nalgebra::{Isometry3, Vector3};
use selfcal_core::store::lock;
use selfcal_core::{
    BaTuning, CovarianceWeights, EngineCfg, OnlineCalibrator, Rig, RigCamera, SelfCalEngine,
};
use selfcal_sim::{
    CondSample, FovCamera, ScriptedTracker, SimTruth, StationaryImu, SyntheticBaFactory,
    TrackerSimCfg,
};
use selfcal_traits::{BaMode, CameraModel};

fn make_rig(params: &[f64]) -> Rig {
    Rig::new(vec![RigCamera::new(
        Box::new(FovCamera::new(params, 640, 480)),
        Isometry3::identity(),
    )])
}

fn build_engine(
    initial: &[f64],
    truth_params: &[f64],
    tweak: impl FnOnce(&mut EngineCfg),
) -> (SelfCalEngine, Arc<Mutex<SimTruth>>) {
    let factory = SyntheticBaFactory::new(SimTruth::new(truth_params));
    let handle = factory.handle();
    let tracker = ScriptedTracker::new(factory.handle(), TrackerSimCfg::default());
    let mut cfg = EngineCfg::default();
    tweak(&mut cfg);
    let engine = SelfCalEngine::builder()
        .with_tracker(tracker)
        .with_solver_factory(factory)
        .with_rig(make_rig(initial))
        .with_config(cfg)
        .try_build()
        .unwrap();
    (engine, handle)
}

const TRUTH: [f64; 5] = [400.0, 400.0, 320.0, 240.0, 1.0];

#[test]
fn s1_cold_start_converges_via_batch() {
    let initial = [320.0, 320.0, 320.0, 240.0, 1.0];
    let (mut engine, _h) = build_engine(&initial, &TRUTH, |c| {
        c.unknown_cam_calibration = true;
    });
    let shared = engine.shared();

    let mut cleared_at = None;
    for i in 0..40 {
        engine.process_frame(i as f64 * 0.1).unwrap();
        if !engine.calibration_status().unknown_cam_calibration && cleared_at.is_none() {
            cleared_at = Some(lock(&shared).poses.len());
        }
    }
    let cleared = cleared_at.expect("batch recalibration never converged");
    assert!(cleared > 10, "cleared before the first full segment: {cleared}");
    assert!(cleared <= 20, "cleared too late: keyframe {cleared}");

    let params = lock(&shared).live_rig.primary().params();
    for i in 0..4 {
        assert!(
            (params[i] - TRUTH[i]).abs() < 5.0,
            "param {i}: {} vs {}",
            params[i],
            TRUTH[i]
        );
    }
}

#[test]
fn s2_steady_state_fills_queue_disjointly() {
    let (mut engine, _h) = build_engine(&TRUTH, &TRUTH, |c| {
        c.unknown_cam_calibration = false;
    });

    let mut full_at = None;
    for i in 0..200 {
        engine.process_frame(i as f64 * 0.1).unwrap();
        let windows = engine.calibrator().queue().windows();
        for (a, wa) in windows.iter().enumerate() {
            for wb in windows.iter().skip(a + 1) {
                assert!(
                    !wa.overlaps(wb),
                    "queue ranges overlap: [{}, {}) vs [{}, {})",
                    wa.start_index,
                    wa.end_index,
                    wb.start_index,
                    wb.end_index
                );
            }
        }
        if windows.len() == 5 && full_at.is_none() {
            full_at = Some(i + 1);
        }
    }
    let full = full_at.expect("queue never filled");
    assert!(full <= 60, "queue filled at keyframe {full}");
}

#[test]
fn s3_drift_detection_triggers_recalibration() {
    let (mut engine, h) = build_engine(&TRUTH, &TRUTH, |c| {
        c.unknown_cam_calibration = false;
    });
    let shared = engine.shared();

    for i in 0..100 {
        engine.process_frame(i as f64 * 0.1).unwrap();
    }
    assert_eq!(lock(&shared).poses.len(), 100);
    assert_eq!(engine.calibrator().num_windows(), 5);
    assert!(!engine.calibration_status().unknown_cam_calibration);

    // fx jumps by 10% for everything observed from here on.
    let drift_time = lock(&shared).poses.last().unwrap().time + 0.05;
    h.lock().unwrap().scale_param(0, 1.1, drift_time);
    let new_fx = TRUTH[0] * 1.1;

    let mut low_div_streak = 0usize;
    let mut max_streak = 0usize;
    let mut detected_at = None;
    for i in 100..160 {
        engine.process_frame(i as f64 * 0.1).unwrap();
        let div = engine.last_divergence();
        if div > 0.0 && div < 0.2 {
            low_div_streak += 1;
            max_streak = max_streak.max(low_div_streak);
        } else {
            low_div_streak = 0;
        }
        if engine.calibration_status().unknown_cam_calibration && detected_at.is_none() {
            detected_at = Some(lock(&shared).poses.len());
        }
    }
    let detected = detected_at.expect("drift never detected");
    assert!(
        (101..=131).contains(&detected),
        "drift detected at keyframe {detected}"
    );
    assert!(max_streak >= 3, "no run of low divergences: {max_streak}");

    // Batch recalibration restored the new truth.
    assert!(
        !engine.calibration_status().unknown_cam_calibration,
        "recalibration did not converge"
    );
    let fx = lock(&shared).live_rig.primary().params()[0];
    assert!(
        (fx - new_fx).abs() / new_fx < 0.01,
        "fx {fx} not within 1% of {new_fx}"
    );
}

#[test]
fn s4_rank_deficient_posteriors_never_enter_queue() {
    let (mut engine, h) = build_engine(&TRUTH, &TRUTH, |c| {
        c.unknown_cam_calibration = false;
    });
    h.lock().unwrap().rank_deficient = true;

    for i in 0..60 {
        engine.process_frame(i as f64 * 0.1).unwrap();
        assert_eq!(
            engine.calibrator().num_windows(),
            0,
            "rank-deficient window admitted at frame {i}"
        );
    }
}

#[test]
fn s5_adaptive_window_grows_then_resets() {
    let (mut engine, h) = build_engine(&TRUTH, &TRUTH, |c| {
        c.unknown_cam_calibration = false;
        c.do_self_cal = false;
        c.use_imu = true;
        c.min_poses_for_imu = 15;
        c.do_adaptive = true;
        c.num_aac_poses = 20;
    });

    let mut imu = StationaryImu::new(Vector3::new(0.0, 0.0, -9.806), 100.0, 3);
    let buffer = engine.imu_buffer();
    for i in 0..90 {
        let t = i as f64 * 0.1;
        for (w, a, ts) in imu.samples_until(t + 0.01) {
            buffer.add(w, a, ts);
        }
        engine.process_frame(t).unwrap();
    }
    assert_eq!(lock(&engine.shared()).poses.len(), 90);

    // Conditioning over threshold for two solves, then healthy again.
    {
        let mut truth = h.lock().unwrap();
        truth.cond_schedule.push_back(CondSample {
            inertial_error: 30_000.0,
            proj_error: 100.0,
            num_inertial: 1,
            num_proj: 10,
        });
        truth.cond_schedule.push_back(CondSample {
            inertial_error: 20_000.0,
            proj_error: 100.0,
            num_inertial: 1,
            num_proj: 10,
        });
        truth.cond_schedule.push_back(CondSample {
            inertial_error: 1.0,
            proj_error: 1.0,
            num_inertial: 1,
            num_proj: 10,
        });
    }
    let log_start = h.lock().unwrap().solve_log.len();
    engine.start_background();

    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        let drained = h.lock().unwrap().cond_schedule.is_empty();
        let reset = engine.aac().is_some_and(|a| a.num_active_poses() == 20);
        if drained && reset {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    let truth = h.lock().unwrap();
    assert!(
        truth.cond_schedule.is_empty(),
        "adaptive loop never consumed the conditioning schedule"
    );
    // 90 poses: active windows of 20/50/80 register 21/51/81 poses (one
    // extra conditioning pose each).
    let aac_solves = &truth.solve_log[log_start..];
    assert!(aac_solves.contains(&51), "never grew to 50: {aac_solves:?}");
    assert!(aac_solves.contains(&81), "never grew to 80: {aac_solves:?}");
    drop(truth);
    assert_eq!(engine.aac().unwrap().num_active_poses(), 20);
}

#[test]
fn s6_application_flags_tracks_and_reprojects_to_center() {
    let initial = [320.0, 320.0, 320.0, 240.0, 1.0];
    let (mut engine, _h) = build_engine(&initial, &TRUTH, |c| {
        c.unknown_cam_calibration = true;
    });
    let shared = engine.shared();

    // Stop right at the keyframe whose batch applied the parameters.
    let mut applied = false;
    for i in 0..40 {
        engine.process_frame(i as f64 * 0.1).unwrap();
        if !engine.calibration_status().unknown_cam_calibration {
            applied = true;
            break;
        }
    }
    assert!(applied, "parameters never applied");

    let state = lock(&shared);
    let live_params = state.live_rig.primary().params();
    let num_poses = state.poses.len();
    let start = engine
        .calibration_status()
        .unknown_cam_calibration_start_pose;
    for (idx, pose) in state.poses.iter().enumerate().skip(start) {
        assert_eq!(
            pose.cam_params, live_params,
            "pose {idx} snapshot diverges from the live rig"
        );
        // The newest pose gained fresh tracks after the application.
        if idx + 1 == num_poses {
            continue;
        }
        for track in &pose.tracks {
            assert!(
                track.needs_backprojection,
                "track {} on pose {idx} not flagged",
                track.id
            );
            let px = state.live_rig.primary().model.project(&track.ref_keypoint.ray);
            let err = (px - track.ref_keypoint.center_px).norm();
            assert!(
                err < 1e-6,
                "track {} reprojects {err} px from its center",
                track.id
            );
        }
    }
}

#[test]
fn repeated_window_analysis_is_idempotent() {
    let (mut engine, h) = build_engine(&TRUTH, &TRUTH, |c| {
        c.unknown_cam_calibration = false;
    });
    for i in 0..30 {
        engine.process_frame(i as f64 * 0.1).unwrap();
    }

    let factory = SyntheticBaFactory::from_handle(h);
    let mut calib = OnlineCalibrator::new(
        &factory,
        make_rig(&TRUTH),
        5,
        CovarianceWeights::from_slice(&[1.0, 1.0, 1.7, 1.7, 3.2e5]),
        BaTuning::default(),
        30,
    );
    let shared = engine.shared();
    let buffer = engine.imu_buffer();
    let w1 = calib.analyze_window(&shared, &buffer, 10, 20, 50, false, 0, BaMode::Visual);
    let w2 = calib.analyze_window(&shared, &buffer, 10, 20, 50, false, 0, BaMode::Visual);

    assert_eq!(w1.mean.len(), w2.mean.len());
    assert!(!w1.is_empty());
    for i in 0..w1.mean.len() {
        assert!(
            (w1.mean[i] - w2.mean[i]).abs() < 0.05,
            "mean {i} not reproducible: {} vs {}",
            w1.mean[i],
            w2.mean[i]
        );
    }
    assert_eq!(w1.num_measurements, w2.num_measurements);
    // Analysis alone never touches the queue.
    assert_eq!(calib.num_windows(), 0);
}

#[test]
fn visual_mode_ignores_buffered_imu() {
    let (mut engine, h) = build_engine(&TRUTH, &TRUTH, |c| {
        c.unknown_cam_calibration = false;
        c.use_imu = false;
    });
    // A well-stocked buffer must not leak inertial residuals into the solves.
    let buffer = engine.imu_buffer();
    for i in 0..500 {
        buffer.add(Vector3::zeros(), Vector3::new(0.0, 0.0, 9.806), i as f64 * 0.01);
    }
    for i in 0..30 {
        engine.process_frame(i as f64 * 0.1).unwrap();
    }
    assert_eq!(h.lock().unwrap().total_imu_residuals, 0);
}

#[test]
fn short_ranges_never_reach_the_queue() {
    let (mut engine, _h) = build_engine(&TRUTH, &TRUTH, |c| {
        c.unknown_cam_calibration = false;
        c.self_cal_segment_length = 10;
    });
    // Fewer keyframes than a segment: no candidate analysis at all.
    for i in 0..9 {
        engine.process_frame(i as f64 * 0.1).unwrap();
    }
    assert_eq!(engine.calibrator().num_windows(), 0);
    assert_eq!(engine.last_divergence(), 0.0);
}
