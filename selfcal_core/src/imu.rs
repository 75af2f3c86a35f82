//! Time-indexed IMU sample store and the pose-guess integrator.
//!
//! Producers (the IMU driver callback) append from their own thread; the
//! foreground and background BA threads query ranges across pose timestamps.
//! Range endpoints are interpolated so every inertial residual integrates
//! over exactly its pose-time interval.
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3, Vector6};
use selfcal_traits::{Clock, ImuMeasurement};

/// Thread-safe interpolation buffer.
#[derive(Debug, Default)]
pub struct ImuBuffer {
    inner: Mutex<Vec<ImuMeasurement>>,
}

impl ImuBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sample. Out-of-order samples are dropped.
    pub fn add(&self, w: Vector3<f64>, a: Vector3<f64>, time: f64) {
        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        if let Some(last) = inner.last()
            && time <= last.time
        {
            tracing::warn!(time, last = last.time, "dropping out-of-order imu sample");
            return;
        }
        inner.push(ImuMeasurement::new(w, a, time));
    }

    /// Timestamp of the newest sample, or -inf when empty.
    pub fn end_time(&self) -> f64 {
        let inner = match self.inner.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        inner.last().map_or(f64::NEG_INFINITY, |m| m.time)
    }

    pub fn len(&self) -> usize {
        match self.inner.lock() {
            Ok(g) => g.len(),
            Err(p) => p.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// First sample, if any (used for the gravity-aligned initial pose).
    pub fn front(&self) -> Option<ImuMeasurement> {
        let inner = match self.inner.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        inner.first().copied()
    }

    /// Samples covering `[t0, t1]`, with the endpoints interpolated when the
    /// buffer straddles them. Returns an empty vector when the interval is
    /// outside the buffered range.
    pub fn get_range(&self, t0: f64, t1: f64) -> Vec<ImuMeasurement> {
        let inner = match self.inner.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        if t1 <= t0 || inner.is_empty() {
            return Vec::new();
        }
        let first_in = inner.partition_point(|m| m.time < t0);
        let end_in = inner.partition_point(|m| m.time <= t1);
        let mut out = Vec::with_capacity(end_in.saturating_sub(first_in) + 2);

        // Interpolated sample exactly at t0.
        if first_in > 0 && first_in < inner.len() && inner[first_in].time > t0 {
            out.push(interpolate(&inner[first_in - 1], &inner[first_in], t0));
        }
        out.extend_from_slice(&inner[first_in..end_in]);
        // Interpolated sample exactly at t1.
        if end_in > 0 && end_in < inner.len() && inner[end_in - 1].time < t1 {
            out.push(interpolate(&inner[end_in - 1], &inner[end_in], t1));
        }
        out
    }

    /// Busy-wait (10 us naps) until the buffer covers `t`, the timeout
    /// elapses, or `cancel` is raised. Returns true when covered.
    pub fn wait_until(
        &self,
        t: f64,
        timeout: Duration,
        cancel: &AtomicBool,
        clock: &dyn Clock,
    ) -> bool {
        let start = clock.now();
        loop {
            if self.end_time() >= t {
                return true;
            }
            if cancel.load(Ordering::Relaxed) || clock.secs_since(start) >= timeout.as_secs_f64() {
                return false;
            }
            clock.sleep(Duration::from_micros(10));
        }
    }
}

fn interpolate(m0: &ImuMeasurement, m1: &ImuMeasurement, t: f64) -> ImuMeasurement {
    let dt = m1.time - m0.time;
    let alpha = if dt > 0.0 { (t - m0.time) / dt } else { 0.0 };
    ImuMeasurement::new(
        m0.w + (m1.w - m0.w) * alpha,
        m0.a + (m1.a - m0.a) * alpha,
        t,
    )
}

/// Inertial state snapshot used by the integrator.
#[derive(Debug, Clone)]
pub struct ImuPose {
    pub t_wp: Isometry3<f64>,
    pub v_w: Vector3<f64>,
    pub time: f64,
}

/// Midpoint integration of gyro/accel samples from a starting state.
///
/// Returns the trajectory including the start state; the caller reads the
/// final element for the propagated pose and velocity. The bias vector is
/// ordered accel then gyro.
pub fn integrate_measurements(
    t_wp: &Isometry3<f64>,
    v_w: &Vector3<f64>,
    b: &Vector6<f64>,
    gravity: &Vector3<f64>,
    measurements: &[ImuMeasurement],
) -> Vec<ImuPose> {
    let ba = Vector3::new(b[0], b[1], b[2]);
    let bg = Vector3::new(b[3], b[4], b[5]);

    let mut poses = Vec::with_capacity(measurements.len().max(1));
    let start_time = measurements.first().map_or(0.0, |m| m.time);
    poses.push(ImuPose {
        t_wp: *t_wp,
        v_w: *v_w,
        time: start_time,
    });
    if measurements.len() < 2 {
        return poses;
    }

    let mut r = t_wp.rotation;
    let mut p = t_wp.translation.vector;
    let mut v = *v_w;
    for pair in measurements.windows(2) {
        let dt = pair[1].time - pair[0].time;
        if dt <= 0.0 {
            continue;
        }
        let w_mid = 0.5 * (pair[0].w + pair[1].w) - bg;
        let a_mid = 0.5 * (pair[0].a + pair[1].a) - ba;

        // Rotate the specific force at the interval midpoint orientation.
        let r_half = r * UnitQuaternion::from_scaled_axis(w_mid * (0.5 * dt));
        let a_w = r_half * a_mid + gravity;

        p += v * dt + 0.5 * a_w * dt * dt;
        v += a_w * dt;
        r *= UnitQuaternion::from_scaled_axis(w_mid * dt);

        poses.push(ImuPose {
            t_wp: Isometry3::from_parts(Translation3::from(p), r),
            v_w: v,
            time: pair[1].time,
        });
    }
    poses
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn sample(t: f64, az: f64) -> (Vector3<f64>, Vector3<f64>, f64) {
        (Vector3::zeros(), Vector3::new(0.0, 0.0, az), t)
    }

    #[test]
    fn range_interpolates_endpoints() {
        let buf = ImuBuffer::new();
        for i in 0..10 {
            let (w, a, t) = sample(i as f64 * 0.1, i as f64);
            buf.add(w, a, t);
        }
        let out = buf.get_range(0.15, 0.45);
        assert_eq!(out.first().map(|m| m.time), Some(0.15));
        assert_eq!(out.last().map(|m| m.time), Some(0.45));
        // Interpolated accel halfway between samples 1 and 2.
        assert!((out[0].a.z - 1.5).abs() < 1e-12);
        // Interior samples pass through untouched.
        assert!(out.iter().any(|m| (m.time - 0.2).abs() < 1e-12));
    }

    #[test]
    fn range_outside_buffer_is_empty() {
        let buf = ImuBuffer::new();
        buf.add(Vector3::zeros(), Vector3::zeros(), 1.0);
        assert!(buf.get_range(2.0, 3.0).is_empty());
        assert!(buf.get_range(3.0, 2.0).is_empty());
    }

    #[test]
    fn out_of_order_samples_are_dropped() {
        let buf = ImuBuffer::new();
        buf.add(Vector3::zeros(), Vector3::zeros(), 1.0);
        buf.add(Vector3::zeros(), Vector3::zeros(), 0.5);
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.end_time(), 1.0);
    }

    #[test]
    fn wait_until_times_out_and_cancels() {
        let clock = selfcal_traits::MonotonicClock::new();
        let buf = ImuBuffer::new();
        let cancel = AtomicBool::new(false);
        assert!(!buf.wait_until(1.0, Duration::from_millis(2), &cancel, &clock));
        cancel.store(true, Ordering::Relaxed);
        assert!(!buf.wait_until(1.0, Duration::from_millis(100), &cancel, &clock));
        buf.add(Vector3::zeros(), Vector3::zeros(), 2.0);
        assert!(buf.wait_until(1.0, Duration::from_millis(2), &cancel, &clock));
    }

    #[test]
    fn stationary_integration_cancels_gravity() {
        // Accelerometer reads -g when stationary; integrating with the
        // matching gravity vector should not move the pose.
        let g = Vector3::new(0.0, 0.0, -9.806);
        let meas: Vec<ImuMeasurement> = (0..20)
            .map(|i| ImuMeasurement::new(Vector3::zeros(), -g, i as f64 * 0.005))
            .collect();
        let poses = integrate_measurements(
            &Isometry3::identity(),
            &Vector3::zeros(),
            &Vector6::zeros(),
            &g,
            &meas,
        );
        let last = poses.last().unwrap();
        assert!(last.t_wp.translation.vector.norm() < 1e-9);
        assert!(last.v_w.norm() < 1e-9);
    }

    #[test]
    fn constant_acceleration_integrates_quadratically() {
        // 1 m/s^2 along x for 1 s with gravity zeroed out: p = 0.5 a t^2.
        let meas: Vec<ImuMeasurement> = (0..=100)
            .map(|i| {
                ImuMeasurement::new(Vector3::zeros(), Vector3::new(1.0, 0.0, 0.0), i as f64 * 0.01)
            })
            .collect();
        let poses = integrate_measurements(
            &Isometry3::identity(),
            &Vector3::zeros(),
            &Vector6::zeros(),
            &Vector3::zeros(),
            &meas,
        );
        let last = poses.last().unwrap();
        assert!((last.t_wp.translation.vector.x - 0.5).abs() < 1e-3);
        assert!((last.v_w.x - 1.0).abs() < 1e-6);
    }
}
