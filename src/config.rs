//! Flight configuration and the staged/active store.
//!
//! Nothing reads tuning from globals: the active [`FlightConfig`] is passed by
//! reference into every cycle and replaced only between cycles.

use crate::control::{ClipStrategy, MixerMatrix, PidGains};
use crate::error::ConfigError;
use crate::estimation::FusionFilter;
use crate::io::{ChannelMap, OutputDriver, OutputProtocol};
use crate::protocol::dshot::DshotRate;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ControlConfig {
    /// Inner rate loop, roll/pitch/yaw. Error in deg/s, output normalized.
    pub rate: [PidGains; 3],
    /// Outer angle loop. Error in deg, output deg/s; `output_limit` is
    /// replaced by `max_rate_dps` of the same axis.
    pub angle: [PidGains; 3],
    /// D-term PT1 cut-off, 0 = unfiltered.
    pub d_lpf_hz: f32,
    pub max_rate_dps: [f32; 3],
    pub max_angle_deg: f32,
    /// Integrators hold below this throttle.
    pub integrator_throttle_min: f32,
    pub estimate_stale_cycles: u32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MixerConfig {
    pub matrix: MixerMatrix,
    pub clip: ClipStrategy,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OutputConfig {
    pub protocol: OutputProtocol,
    /// Armed output range, normalized. `min` is motor idle.
    pub min: f32,
    pub max: f32,
    /// Output while disarmed or in a non-descent failsafe.
    pub disarmed: f32,
    /// Gap between consecutive channel pulses.
    pub guard_us: u32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SensorConfig {
    /// Consecutive faults bridged with the last good sample.
    pub hold_cycles: u32,
    pub gyro_limit_dps: f32,
    pub accel_limit_g: f32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EstimatorConfig {
    pub fusion: FusionFilter,
    pub calibration_samples: u32,
    /// deg²/s², per gyro axis.
    pub calibration_max_gyro_variance: f32,
    pub calibration_timeout_samples: u32,
    /// 0 disables the stage.
    pub gyro_lpf_hz: f32,
    pub gyro_notch_hz: f32,
    pub gyro_notch_q: f32,
    pub accel_lpf_hz: f32,
    /// Accel correction is skipped when |‖a‖ − 1 g| exceeds this.
    pub accel_reject_g: f32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SafetyConfig {
    pub arm_throttle_max: f32,
    pub max_tilt_deg: f32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FailsafeConfig {
    /// No valid receiver frame for this long is a signal loss.
    pub signal_timeout_ms: u32,
    /// Failsafe gives up and disarms after this long.
    pub timeout_ms: u32,
    /// Collective throttle of the level descent.
    pub throttle: f32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FlightConfig {
    pub loop_hz: u32,
    pub control: ControlConfig,
    pub mixer: MixerConfig,
    pub output: OutputConfig,
    pub sensor: SensorConfig,
    pub estimator: EstimatorConfig,
    pub safety: SafetyConfig,
    pub failsafe: FailsafeConfig,
    pub channels: ChannelMap,
}

impl Default for FlightConfig {
    /// 1 kHz loop, 5" quad X on DShot300.
    fn default() -> Self {
        Self {
            loop_hz: 1000,
            control: ControlConfig {
                rate: [
                    PidGains::new(0.0035, 0.00003, 0.02, 0.3, 1.0),
                    PidGains::new(0.0038, 0.00003, 0.022, 0.3, 1.0),
                    PidGains::new(0.004, 0.00004, 0.0, 0.3, 1.0),
                ],
                angle: [
                    PidGains::new(6.0, 0.002, 0.0, 20.0, 400.0),
                    PidGains::new(6.0, 0.002, 0.0, 20.0, 400.0),
                    PidGains::new(3.0, 0.0, 0.0, 0.0, 250.0),
                ],
                d_lpf_hz: 90.0,
                max_rate_dps: [400.0, 400.0, 250.0],
                max_angle_deg: 35.0,
                integrator_throttle_min: 0.1,
                estimate_stale_cycles: 20,
            },
            mixer: MixerConfig {
                matrix: MixerMatrix::quad_x(),
                clip: ClipStrategy::AttitudePreserving,
            },
            output: OutputConfig {
                protocol: OutputProtocol::Dshot {
                    rate: DshotRate::Dshot300,
                },
                min: 0.05,
                max: 1.0,
                disarmed: 0.0,
                guard_us: 10,
            },
            sensor: SensorConfig {
                hold_cycles: 3,
                gyro_limit_dps: 2000.0,
                accel_limit_g: 16.0,
            },
            estimator: EstimatorConfig {
                fusion: FusionFilter::Complementary { blend: 0.998 },
                calibration_samples: 1000,
                calibration_max_gyro_variance: 0.25,
                calibration_timeout_samples: 5000,
                gyro_lpf_hz: 90.0,
                gyro_notch_hz: 0.0,
                gyro_notch_q: 5.0,
                accel_lpf_hz: 20.0,
                accel_reject_g: 0.25,
            },
            safety: SafetyConfig {
                arm_throttle_max: 0.05,
                max_tilt_deg: 70.0,
            },
            failsafe: FailsafeConfig {
                signal_timeout_ms: 500,
                timeout_ms: 5000,
                throttle: 0.35,
            },
            channels: ChannelMap::default(),
        }
    }
}

fn check(name: &'static str, value: f32, lo: f32, hi: f32) -> Result<(), ConfigError> {
    if !value.is_finite() {
        return Err(ConfigError::NotFinite(name));
    }
    if value < lo || value > hi {
        return Err(ConfigError::OutOfBounds(name));
    }
    Ok(())
}

fn check_int(name: &'static str, value: u32, lo: u32, hi: u32) -> Result<(), ConfigError> {
    if value < lo || value > hi {
        return Err(ConfigError::OutOfBounds(name));
    }
    Ok(())
}

/// Per-axis names, in the parameter link's dotted form.
const RATE_NAMES: [[&str; 5]; 3] = [
    ["rate.roll.kp", "rate.roll.ki", "rate.roll.kd", "rate.roll.i_limit", "rate.roll.output_limit"],
    ["rate.pitch.kp", "rate.pitch.ki", "rate.pitch.kd", "rate.pitch.i_limit", "rate.pitch.output_limit"],
    ["rate.yaw.kp", "rate.yaw.ki", "rate.yaw.kd", "rate.yaw.i_limit", "rate.yaw.output_limit"],
];
const ANGLE_NAMES: [[&str; 4]; 3] = [
    ["angle.roll.kp", "angle.roll.ki", "angle.roll.kd", "angle.roll.i_limit"],
    ["angle.pitch.kp", "angle.pitch.ki", "angle.pitch.kd", "angle.pitch.i_limit"],
    ["angle.yaw.kp", "angle.yaw.ki", "angle.yaw.kd", "angle.yaw.i_limit"],
];
const MAX_RATE_NAMES: [&str; 3] = ["control.max_rate.roll", "control.max_rate.pitch", "control.max_rate.yaw"];

impl FlightConfig {
    pub fn period_s(&self) -> f32 {
        1.0 / self.loop_hz as f32
    }

    pub fn period_us(&self) -> u32 {
        1_000_000 / self.loop_hz.max(1)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_int("loop_hz", self.loop_hz, 50, 8000)?;
        let nyquist = self.loop_hz as f32 / 2.0;

        let c = &self.control;
        for (gains, names) in c.rate.iter().zip(RATE_NAMES.iter()) {
            check(names[0], gains.kp, 0.0, 1.0)?;
            check(names[1], gains.ki, 0.0, 0.1)?;
            check(names[2], gains.kd, 0.0, 1.0)?;
            check(names[3], gains.i_limit, 0.0, 1.0)?;
            check(names[4], gains.output_limit, 0.01, 1.0)?;
        }
        for i in 0..3 {
            check(MAX_RATE_NAMES[i], c.max_rate_dps[i], 1.0, 2000.0)?;
            let (gains, names) = (&c.angle[i], &ANGLE_NAMES[i]);
            check(names[0], gains.kp, 0.0, 50.0)?;
            check(names[1], gains.ki, 0.0, 1.0)?;
            check(names[2], gains.kd, 0.0, 10.0)?;
            check(names[3], gains.i_limit, 0.0, c.max_rate_dps[i])?;
        }
        check("control.d_lpf_hz", c.d_lpf_hz, 0.0, nyquist)?;
        check("control.max_angle_deg", c.max_angle_deg, 1.0, 80.0)?;
        check("control.integrator_throttle_min", c.integrator_throttle_min, 0.0, 1.0)?;
        check_int("control.estimate_stale_cycles", c.estimate_stale_cycles, 1, 1000)?;

        self.mixer.matrix.validate()?;

        let o = &self.output;
        check("output.min", o.min, 0.0, 1.0)?;
        check("output.max", o.max, 0.0, 1.0)?;
        check("output.disarmed", o.disarmed, 0.0, o.min)?;
        if o.min >= o.max {
            return Err(ConfigError::OutOfBounds("output.min"));
        }
        check_int("output.guard_us", o.guard_us, 0, 1000)?;
        if let OutputProtocol::Pwm { min_us, max_us } = o.protocol {
            check_int("output.pwm_min_us", min_us as u32, 500, 2500)?;
            check_int("output.pwm_max_us", max_us as u32, min_us as u32 + 1, 2500)?;
        }
        OutputDriver::check_fits(o, self.mixer.matrix.motor_count(), self.loop_hz)?;

        let s = &self.sensor;
        check_int("sensor.hold_cycles", s.hold_cycles, 0, 100)?;
        check("sensor.gyro_limit_dps", s.gyro_limit_dps, 100.0, 4000.0)?;
        check("sensor.accel_limit_g", s.accel_limit_g, 2.0, 32.0)?;

        let e = &self.estimator;
        match e.fusion {
            FusionFilter::Complementary { blend } => {
                check("estimator.blend", blend, 0.5, 0.99999)?;
            }
            FusionFilter::Mahony { kp, ki, i_limit_dps } => {
                check("estimator.mahony_kp", kp, 0.0, 50.0)?;
                check("estimator.mahony_ki", ki, 0.0, 5.0)?;
                check("estimator.mahony_i_limit_dps", i_limit_dps, 0.0, 100.0)?;
            }
        }
        check_int("estimator.calibration_samples", e.calibration_samples, 10, 100_000)?;
        check(
            "estimator.calibration_max_gyro_variance",
            e.calibration_max_gyro_variance,
            1e-6,
            100.0,
        )?;
        check_int(
            "estimator.calibration_timeout_samples",
            e.calibration_timeout_samples,
            e.calibration_samples,
            1_000_000,
        )?;
        check("estimator.gyro_lpf_hz", e.gyro_lpf_hz, 0.0, nyquist * 0.9)?;
        check("estimator.accel_lpf_hz", e.accel_lpf_hz, 0.0, nyquist * 0.9)?;
        check("estimator.gyro_notch_hz", e.gyro_notch_hz, 0.0, nyquist * 0.9)?;
        check("estimator.gyro_notch_q", e.gyro_notch_q, 0.1, 50.0)?;
        check("estimator.accel_reject_g", e.accel_reject_g, 0.01, 2.0)?;

        let sf = &self.safety;
        check("safety.arm_throttle_max", sf.arm_throttle_max, 0.0, 0.3)?;
        // Normal angle-mode flight must never look like a divergence.
        check("safety.max_tilt_deg", sf.max_tilt_deg, c.max_angle_deg + 5.0, 180.0)?;

        let f = &self.failsafe;
        check_int("failsafe.signal_timeout_ms", f.signal_timeout_ms, 50, 5000)?;
        check_int("failsafe.timeout_ms", f.timeout_ms, 0, 60_000)?;
        check("failsafe.throttle", f.throttle, 0.0, 1.0)?;

        self.channels.validate()?;
        Ok(())
    }
}

/// Active configuration plus at most one staged replacement.
///
/// Writers stage a full copy; the control cycle swaps it in at the start of
/// its next step. A staged copy that fails validation never becomes active.
pub struct ConfigStore {
    active: FlightConfig,
    staged: Option<FlightConfig>,
    generation: u32,
}

impl ConfigStore {
    pub fn new(config: FlightConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            active: config,
            staged: None,
            generation: 0,
        })
    }

    pub fn active(&self) -> &FlightConfig {
        &self.active
    }

    /// Bumped on every applied update.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn has_staged(&self) -> bool {
        self.staged.is_some()
    }

    /// Validate and stage; replaces any earlier staged copy.
    pub fn stage(&mut self, config: FlightConfig) -> Result<(), ConfigError> {
        if let Err(e) = config.validate() {
            warn!("config update rejected: {}", e);
            return Err(e);
        }
        self.staged = Some(config);
        Ok(())
    }

    /// Swap in the staged copy, if any. Returns the new active config.
    pub fn apply_staged(&mut self) -> Option<&FlightConfig> {
        let staged = self.staged.take()?;
        self.active = staged;
        self.generation = self.generation.wrapping_add(1);
        info!("config generation {} applied", self.generation);
        Some(&self.active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert_eq!(FlightConfig::default().validate(), Ok(()));
    }

    #[test]
    fn names_the_offending_value() {
        let mut cfg = FlightConfig::default();
        cfg.control.rate[1].ki = -0.1;
        assert_eq!(cfg.validate(), Err(ConfigError::OutOfBounds("rate.pitch.ki")));

        let mut cfg = FlightConfig::default();
        cfg.failsafe.throttle = f32::NAN;
        assert_eq!(cfg.validate(), Err(ConfigError::NotFinite("failsafe.throttle")));

        let mut cfg = FlightConfig::default();
        cfg.safety.max_tilt_deg = cfg.control.max_angle_deg;
        assert_eq!(cfg.validate(), Err(ConfigError::OutOfBounds("safety.max_tilt_deg")));
    }

    #[test]
    fn gain_bounds_follow_loop_units() {
        // Rate integral is normalized torque: a deg/s-scale gain is refused.
        let mut cfg = FlightConfig::default();
        cfg.control.rate[0].ki = 0.5;
        assert_eq!(cfg.validate(), Err(ConfigError::OutOfBounds("rate.roll.ki")));

        let mut cfg = FlightConfig::default();
        cfg.control.rate[2].i_limit = 10.0;
        assert_eq!(cfg.validate(), Err(ConfigError::OutOfBounds("rate.yaw.i_limit")));

        // Angle integral is deg/s and may not exceed the axis rate limit.
        let mut cfg = FlightConfig::default();
        cfg.control.angle[1].i_limit = cfg.control.max_rate_dps[1] + 1.0;
        assert_eq!(cfg.validate(), Err(ConfigError::OutOfBounds("angle.pitch.i_limit")));
        cfg.control.angle[1].i_limit = cfg.control.max_rate_dps[1];
        assert_eq!(cfg.validate(), Ok(()));
    }

    #[test]
    fn pwm_at_1khz_does_not_fit() {
        let mut cfg = FlightConfig::default();
        cfg.output.protocol = OutputProtocol::Pwm {
            min_us: 1000,
            max_us: 2000,
        };
        assert_eq!(cfg.validate(), Err(ConfigError::ScheduleOverflow));
        cfg.loop_hz = 100;
        cfg.control.d_lpf_hz = 40.0;
        cfg.estimator.gyro_lpf_hz = 40.0;
        cfg.estimator.accel_lpf_hz = 20.0;
        assert_eq!(cfg.validate(), Ok(()));
    }

    #[test]
    fn rejected_update_keeps_active() {
        let mut store = ConfigStore::new(FlightConfig::default()).unwrap();
        let mut bad = FlightConfig::default();
        bad.loop_hz = 20_000;
        assert!(store.stage(bad).is_err());
        assert!(!store.has_staged());
        assert!(store.apply_staged().is_none());
        assert_eq!(store.active().loop_hz, 1000);
        assert_eq!(store.generation(), 0);
    }

    #[test]
    fn staged_update_applies_once() {
        let mut store = ConfigStore::new(FlightConfig::default()).unwrap();
        let mut next = FlightConfig::default();
        next.control.rate[0].kp = 0.005;
        store.stage(next).unwrap();
        // Still the old value until the cycle boundary.
        assert_eq!(store.active().control.rate[0].kp, 0.0035);
        assert_eq!(store.apply_staged().map(|c| c.control.rate[0].kp), Some(0.005));
        assert!(store.apply_staged().is_none());
        assert_eq!(store.generation(), 1);
    }
}
