//! Static bias calibration: the vehicle is assumed stationary and level.

use crate::state::ImuSample;

/// Running mean / variance per axis (Welford).
#[derive(Clone, Copy, Debug, Default)]
struct Welford3 {
    count: u32,
    mean: [f32; 3],
    m2: [f32; 3],
}

impl Welford3 {
    fn push(&mut self, x: [f32; 3]) {
        self.count += 1;
        let n = self.count as f32;
        for i in 0..3 {
            let delta = x[i] - self.mean[i];
            self.mean[i] += delta / n;
            self.m2[i] += delta * (x[i] - self.mean[i]);
        }
    }

    fn variance(&self) -> [f32; 3] {
        if self.count == 0 {
            return [0.0; 3];
        }
        let n = self.count as f32;
        [self.m2[0] / n, self.m2[1] / n, self.m2[2] / n]
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SensorBias {
    pub gyro_dps: [f32; 3],
    pub accel_g: [f32; 3],
}

impl SensorBias {
    pub const ZERO: SensorBias = SensorBias {
        gyro_dps: [0.0; 3],
        accel_g: [0.0; 3],
    };
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CalibrationStatus {
    InProgress,
    Converged(SensorBias),
    /// Gave up; the caller falls back to zero offsets.
    TimedOut,
}

#[derive(Clone, Copy, Debug)]
pub struct Calibration {
    window_len: u32,
    timeout: u32,
    max_gyro_variance: f32,
    consumed: u32,
    gyro: Welford3,
    accel: Welford3,
}

impl Calibration {
    pub fn new(window_len: u32, timeout: u32, max_gyro_variance: f32) -> Self {
        Self {
            window_len: window_len.max(1),
            timeout: timeout.max(window_len),
            max_gyro_variance,
            consumed: 0,
            gyro: Welford3::default(),
            accel: Welford3::default(),
        }
    }

    pub fn consumed(&self) -> u32 {
        self.consumed
    }

    pub fn push(&mut self, sample: &ImuSample) -> CalibrationStatus {
        self.consumed += 1;
        self.gyro.push(sample.gyro_dps);
        self.accel.push(sample.accel_g);

        if self.gyro.count >= self.window_len {
            let still = self
                .gyro
                .variance()
                .iter()
                .all(|&v| v <= self.max_gyro_variance);
            if still {
                let mut accel_g = self.accel.mean;
                accel_g[2] -= 1.0; // level: gravity on +Z only
                return CalibrationStatus::Converged(SensorBias {
                    gyro_dps: self.gyro.mean,
                    accel_g,
                });
            }
            // Moved during the window; start a fresh one.
            self.gyro = Welford3::default();
            self.accel = Welford3::default();
        }

        if self.consumed >= self.timeout {
            return CalibrationStatus::TimedOut;
        }
        CalibrationStatus::InProgress
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn still_sample(i: u32) -> ImuSample {
        // Deterministic ±0.1 dps jitter around a fixed bias.
        let j = if i % 2 == 0 { 0.1 } else { -0.1 };
        ImuSample::new([1.5 + j, -0.8 - j, 0.3 + j], [0.02, -0.01, 1.03])
    }

    #[test]
    fn converges_after_one_window_when_still() {
        let mut cal = Calibration::new(100, 1000, 0.05);
        for i in 0..99 {
            assert_eq!(cal.push(&still_sample(i)), CalibrationStatus::InProgress);
        }
        match cal.push(&still_sample(99)) {
            CalibrationStatus::Converged(bias) => {
                assert_relative_eq!(bias.gyro_dps[0], 1.5, epsilon = 1e-3);
                assert_relative_eq!(bias.gyro_dps[1], -0.8, epsilon = 1e-3);
                assert_relative_eq!(bias.gyro_dps[2], 0.3, epsilon = 1e-3);
                assert_relative_eq!(bias.accel_g[0], 0.02, epsilon = 1e-4);
                assert_relative_eq!(bias.accel_g[2], 0.03, epsilon = 1e-4);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(cal.consumed(), 100);
    }

    #[test]
    fn motion_restarts_window_then_times_out() {
        let mut cal = Calibration::new(50, 200, 0.05);
        let mut last = CalibrationStatus::InProgress;
        for i in 0..200 {
            // Vehicle being waved around: large alternating rates.
            let r = if i % 2 == 0 { 40.0 } else { -40.0 };
            last = cal.push(&ImuSample::new([r, 0.0, 0.0], [0.0, 0.0, 1.0]));
            if i < 199 {
                assert_eq!(last, CalibrationStatus::InProgress);
            }
        }
        assert_eq!(last, CalibrationStatus::TimedOut);
    }
}
