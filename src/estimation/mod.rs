//! Attitude estimation: bias calibration, pre-filtering and sensor fusion.
//!
//! The estimator runs `Uninitialized → Calibrating → Tracking`. Only in
//! `Tracking` does it publish a meaningful [`AttitudeEstimate`].

pub mod ahrs;
pub mod calibration;
pub mod complementary;
pub mod filter;

use micromath::F32Ext;

use crate::config::EstimatorConfig;
use crate::state::{AttitudeEstimate, ImuSample};

use self::ahrs::Mahony;
use self::calibration::{Calibration, CalibrationStatus, SensorBias};
use self::complementary::{wrap_pi, ComplementaryFilter};
use self::filter::{Biquad3, BiquadFilter};

/// Butterworth Q for the pre-filters.
const BUTTERWORTH_Q: f32 = 0.707;

#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FusionFilter {
    /// `blend` is the per-cycle gyro weight, in (0, 1).
    Complementary { blend: f32 },
    /// Quaternion Mahony filter with proportional / integral feedback gains.
    /// The integral correction is bounded to ±`i_limit_dps` per axis.
    Mahony { kp: f32, ki: f32, i_limit_dps: f32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EstimatorPhase {
    Uninitialized,
    Calibrating,
    Tracking,
}

/// Reported once, on the transition into `Tracking`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CalibrationOutcome {
    pub bias: SensorBias,
    pub degraded: bool,
    pub samples: u32,
}

#[derive(Clone, Copy, Debug)]
enum Fusion {
    Complementary(ComplementaryFilter),
    Mahony(Mahony),
}

impl Fusion {
    fn new(filter: FusionFilter) -> Self {
        match filter {
            FusionFilter::Complementary { blend } => {
                Fusion::Complementary(ComplementaryFilter::new(blend))
            }
            FusionFilter::Mahony { kp, ki, i_limit_dps } => {
                Fusion::Mahony(Mahony::new(kp, ki, i_limit_dps.to_radians()))
            }
        }
    }

    fn update(&mut self, dt: f32, gyro_rad: [f32; 3], accel: Option<[f32; 3]>) {
        match self {
            Fusion::Complementary(f) => f.update(dt, gyro_rad, accel),
            Fusion::Mahony(f) => f.update(dt, gyro_rad, accel),
        }
    }

    /// Radians.
    fn angles(&self) -> (f32, f32, f32) {
        match self {
            Fusion::Complementary(f) => f.angles(),
            Fusion::Mahony(f) => f.q.euler(),
        }
    }
}

pub struct AttitudeEstimator {
    config: EstimatorConfig,
    loop_hz: f32,
    phase: EstimatorPhase,
    calibration: Calibration,
    bias: SensorBias,
    gyro_notch: Biquad3,
    gyro_lpf: Biquad3,
    accel_lpf: Biquad3,
    fusion: Fusion,
    estimate: AttitudeEstimate,
    age_cycles: u32,
}

impl AttitudeEstimator {
    pub fn new(config: &EstimatorConfig, loop_hz: u32) -> Self {
        let loop_hz = loop_hz as f32;
        Self {
            config: *config,
            loop_hz,
            phase: EstimatorPhase::Uninitialized,
            calibration: Self::calibration_for(config),
            bias: SensorBias::ZERO,
            gyro_notch: Self::notch_for(config, loop_hz),
            gyro_lpf: Biquad3::new(BiquadFilter::new_lpf(config.gyro_lpf_hz, loop_hz, BUTTERWORTH_Q)),
            accel_lpf: Biquad3::new(BiquadFilter::new_lpf(config.accel_lpf_hz, loop_hz, BUTTERWORTH_Q)),
            fusion: Fusion::new(config.fusion),
            estimate: AttitudeEstimate::default(),
            age_cycles: 0,
        }
    }

    fn calibration_for(config: &EstimatorConfig) -> Calibration {
        Calibration::new(
            config.calibration_samples,
            config.calibration_timeout_samples,
            config.calibration_max_gyro_variance,
        )
    }

    fn notch_for(config: &EstimatorConfig, loop_hz: f32) -> Biquad3 {
        Biquad3::new(BiquadFilter::new_notch(
            config.gyro_notch_hz,
            loop_hz,
            config.gyro_notch_q,
        ))
    }

    /// Swap in new tuning between cycles. Calibration results are kept; the
    /// pre-filters restart from the next sample.
    pub fn reconfigure(&mut self, config: &EstimatorConfig, loop_hz: u32) {
        let loop_hz = loop_hz as f32;
        if config.fusion != self.config.fusion {
            self.fusion = match (&mut self.fusion, config.fusion) {
                (Fusion::Complementary(f), FusionFilter::Complementary { blend }) => {
                    f.set_blend(blend);
                    Fusion::Complementary(*f)
                }
                (Fusion::Mahony(f), FusionFilter::Mahony { kp, ki, i_limit_dps }) => {
                    f.set_gains(kp, ki, i_limit_dps.to_radians());
                    Fusion::Mahony(*f)
                }
                (_, other) => Fusion::new(other),
            };
        }
        self.gyro_notch = Self::notch_for(config, loop_hz);
        self.gyro_lpf = Biquad3::new(BiquadFilter::new_lpf(config.gyro_lpf_hz, loop_hz, BUTTERWORTH_Q));
        self.accel_lpf = Biquad3::new(BiquadFilter::new_lpf(config.accel_lpf_hz, loop_hz, BUTTERWORTH_Q));
        if self.phase != EstimatorPhase::Tracking {
            self.calibration = Self::calibration_for(config);
        }
        self.config = *config;
        self.loop_hz = loop_hz;
    }

    pub fn phase(&self) -> EstimatorPhase {
        self.phase
    }

    pub fn is_tracking(&self) -> bool {
        self.phase == EstimatorPhase::Tracking
    }

    pub fn estimate(&self) -> &AttitudeEstimate {
        &self.estimate
    }

    pub fn bias(&self) -> SensorBias {
        self.bias
    }

    /// Cycles since the last fresh sample was fused.
    pub fn age_cycles(&self) -> u32 {
        self.age_cycles
    }

    /// Feed one cycle. `fresh = false` marks a reused (held) sample; `None`
    /// means nothing usable arrived and the estimate only ages.
    pub fn update(
        &mut self,
        sample: Option<&ImuSample>,
        fresh: bool,
        dt: f32,
    ) -> Option<CalibrationOutcome> {
        let Some(sample) = sample else {
            self.age_cycles = self.age_cycles.saturating_add(1);
            return None;
        };

        match self.phase {
            EstimatorPhase::Uninitialized | EstimatorPhase::Calibrating => {
                self.phase = EstimatorPhase::Calibrating;
                if !fresh {
                    return None;
                }
                self.calibrate(sample)
            }
            EstimatorPhase::Tracking => {
                self.track(sample, dt);
                if fresh {
                    self.age_cycles = 0;
                } else {
                    self.age_cycles = self.age_cycles.saturating_add(1);
                }
                None
            }
        }
    }

    fn calibrate(&mut self, sample: &ImuSample) -> Option<CalibrationOutcome> {
        let (bias, degraded) = match self.calibration.push(sample) {
            CalibrationStatus::InProgress => return None,
            CalibrationStatus::Converged(bias) => (bias, false),
            CalibrationStatus::TimedOut => (SensorBias::ZERO, true),
        };

        self.bias = bias;
        self.phase = EstimatorPhase::Tracking;
        self.gyro_notch.reset();
        self.gyro_lpf.reset();
        self.accel_lpf.reset();
        self.fusion = Fusion::new(self.config.fusion);
        self.estimate = AttitudeEstimate {
            degraded,
            ..AttitudeEstimate::default()
        };
        self.age_cycles = 0;

        if degraded {
            warn!("calibration timed out, tracking on default offsets");
        } else {
            info!("calibration converged after {} samples", self.calibration.consumed());
        }

        Some(CalibrationOutcome {
            bias,
            degraded,
            samples: self.calibration.consumed(),
        })
    }

    fn track(&mut self, sample: &ImuSample, dt: f32) {
        let mut gyro = [0.0f32; 3];
        let mut accel = [0.0f32; 3];
        for i in 0..3 {
            gyro[i] = sample.gyro_dps[i] - self.bias.gyro_dps[i];
            accel[i] = sample.accel_g[i] - self.bias.accel_g[i];
        }

        let gyro = self.gyro_lpf.apply(self.gyro_notch.apply(gyro));
        let accel = self.accel_lpf.apply(accel);

        let norm = (accel[0] * accel[0] + accel[1] * accel[1] + accel[2] * accel[2]).sqrt();
        let accel_ok = norm.is_finite() && norm > 0.0 && (norm - 1.0).abs() <= self.config.accel_reject_g;

        let gyro_rad = [
            gyro[0].to_radians(),
            gyro[1].to_radians(),
            gyro[2].to_radians(),
        ];
        self.fusion
            .update(dt, gyro_rad, if accel_ok { Some(accel) } else { None });

        let (roll, pitch, yaw) = self.fusion.angles();
        self.estimate = AttitudeEstimate {
            roll: roll.to_degrees(),
            pitch: pitch.to_degrees(),
            yaw: wrap_pi(yaw).to_degrees(),
            roll_rate: gyro[0],
            pitch_rate: gyro[1],
            yaw_rate: gyro[2],
            degraded: self.estimate.degraded,
            accel_rejected: !accel_ok,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlightConfig;

    fn config(fusion: FusionFilter) -> EstimatorConfig {
        EstimatorConfig {
            fusion,
            ..FlightConfig::default().estimator
        }
    }

    /// Stationary, level vehicle with a gyro bias and a small mounting tilt.
    fn still(i: u32) -> ImuSample {
        let j = match i % 4 {
            0 => 0.05,
            1 => -0.05,
            2 => 0.02,
            _ => -0.02,
        };
        ImuSample::new([0.6 + j, -0.4 - j, 0.25 + j], [0.015 + j * 0.01, -0.02, 1.01])
    }

    fn run_level(fusion: FusionFilter) {
        let cfg = config(fusion);
        let mut est = AttitudeEstimator::new(&cfg, 1000);
        assert_eq!(est.phase(), EstimatorPhase::Uninitialized);

        let mut outcome = None;
        let mut i = 0;
        while outcome.is_none() {
            outcome = est.update(Some(&still(i)), true, 0.001);
            i += 1;
            assert!(i <= cfg.calibration_samples, "calibration did not finish in time");
        }
        let outcome = outcome.unwrap();
        assert!(!outcome.degraded);
        assert_eq!(est.phase(), EstimatorPhase::Tracking);

        for k in 0..5_000 {
            est.update(Some(&still(i + k)), true, 0.001);
        }
        let e = est.estimate();
        assert!(e.roll.abs() < 1.0, "roll {}", e.roll);
        assert!(e.pitch.abs() < 1.0, "pitch {}", e.pitch);
        assert!(e.yaw.abs() < 1.0, "yaw {}", e.yaw);
        assert!(!e.accel_rejected);
    }

    #[test]
    fn complementary_converges_to_level() {
        run_level(FusionFilter::Complementary { blend: 0.995 });
    }

    #[test]
    fn mahony_converges_to_level() {
        run_level(FusionFilter::Mahony {
            kp: 2.0,
            ki: 0.0,
            i_limit_dps: 10.0,
        });
    }

    #[test]
    fn timeout_forces_degraded_tracking() {
        let mut cfg = config(FusionFilter::Complementary { blend: 0.99 });
        cfg.calibration_samples = 50;
        cfg.calibration_timeout_samples = 120;
        let mut est = AttitudeEstimator::new(&cfg, 1000);
        let mut outcome = None;
        for i in 0..120 {
            let r = if i % 2 == 0 { 50.0 } else { -50.0 };
            outcome = est.update(Some(&ImuSample::new([r, r, 0.0], [0.0, 0.0, 1.0])), true, 0.001);
            if outcome.is_some() {
                break;
            }
        }
        let outcome = outcome.expect("estimator must leave calibration at the timeout");
        assert!(outcome.degraded);
        assert_eq!(outcome.bias, SensorBias::ZERO);
        assert!(est.estimate().degraded);
        assert!(est.is_tracking());
    }

    #[test]
    fn high_g_rejects_accel_and_missing_samples_age() {
        let cfg = config(FusionFilter::Complementary { blend: 0.99 });
        let mut est = AttitudeEstimator::new(&cfg, 1000);
        let mut i = 0;
        while !est.is_tracking() {
            est.update(Some(&still(i)), true, 0.001);
            i += 1;
        }
        for _ in 0..50 {
            est.update(Some(&ImuSample::new([0.6, -0.4, 0.25], [0.0, 0.0, 3.0])), true, 0.001);
        }
        assert!(est.estimate().accel_rejected);

        est.update(None, false, 0.001);
        est.update(None, false, 0.001);
        assert_eq!(est.age_cycles(), 2);
        est.update(Some(&still(0)), false, 0.001);
        assert_eq!(est.age_cycles(), 3);
        est.update(Some(&still(1)), true, 0.001);
        assert_eq!(est.age_cycles(), 0);
    }
}
