//! IMU sample synthesis with Gaussian noise.
use nalgebra::Vector3;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

/// Generates samples for a stationary (or constant-velocity) body: the
/// accelerometer reads the specific force opposing gravity plus noise, the
/// gyro reads noise around zero.
pub struct StationaryImu {
    gravity: Vector3<f64>,
    rate_hz: f64,
    next_t: f64,
    gyro_noise: Normal<f64>,
    accel_noise: Normal<f64>,
    rng: StdRng,
}

impl StationaryImu {
    pub fn new(gravity: Vector3<f64>, rate_hz: f64, seed: u64) -> Self {
        Self {
            gravity,
            rate_hz,
            next_t: 0.0,
            gyro_noise: Normal::new(0.0, 1e-4).unwrap(),
            accel_noise: Normal::new(0.0, 5e-3).unwrap(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Produce all samples up to and including `t_end`.
    pub fn samples_until(&mut self, t_end: f64) -> Vec<(Vector3<f64>, Vector3<f64>, f64)> {
        let dt = 1.0 / self.rate_hz;
        let mut out = Vec::new();
        while self.next_t <= t_end {
            let w = Vector3::new(
                self.gyro_noise.sample(&mut self.rng),
                self.gyro_noise.sample(&mut self.rng),
                self.gyro_noise.sample(&mut self.rng),
            );
            let a = -self.gravity
                + Vector3::new(
                    self.accel_noise.sample(&mut self.rng),
                    self.accel_noise.sample(&mut self.rng),
                    self.accel_noise.sample(&mut self.rng),
                );
            out.push((w, a, self.next_t));
            self.next_t += dt;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_cover_the_interval_at_rate() {
        let mut imu = StationaryImu::new(Vector3::new(0.0, 0.0, -9.806), 100.0, 7);
        let s = imu.samples_until(0.5);
        assert_eq!(s.len(), 51);
        assert!(s.iter().all(|(_, a, _)| (a.z - 9.806).abs() < 0.1));
        // Subsequent calls continue where the last left off.
        let s2 = imu.samples_until(1.0);
        assert!(s2.first().map(|x| x.2).unwrap_or(0.0) > 0.5);
    }
}
