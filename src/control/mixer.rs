//! Airframe mixing: collective throttle plus roll/pitch/yaw torque into
//! per-motor outputs.
//!
//! Sign convention: positive roll raises the left side (rolls right),
//! positive pitch raises the rear (nose down), positive yaw turns the nose
//! left seen from above. Motor order follows the usual Betaflight layouts.

use micromath::F32Ext;

use crate::error::ConfigError;
use crate::state::{ActuatorCommands, MAX_MOTORS};

#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MotorMix {
    pub throttle: f32,
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
}

impl MotorMix {
    pub const fn new(throttle: f32, roll: f32, pitch: f32, yaw: f32) -> Self {
        Self {
            throttle,
            roll,
            pitch,
            yaw,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Airframe {
    QuadX,
    QuadPlus,
    HexX,
    Custom,
}

impl Airframe {
    /// Numeric id used by the parameter link.
    pub fn id(self) -> u32 {
        match self {
            Airframe::QuadX => 0,
            Airframe::QuadPlus => 1,
            Airframe::HexX => 2,
            Airframe::Custom => 3,
        }
    }
}

const QUAD_X: [MotorMix; 4] = [
    MotorMix::new(1.0, -1.0, 1.0, -1.0), // rear right
    MotorMix::new(1.0, -1.0, -1.0, 1.0), // front right
    MotorMix::new(1.0, 1.0, 1.0, 1.0),   // rear left
    MotorMix::new(1.0, 1.0, -1.0, -1.0), // front left
];

const QUAD_PLUS: [MotorMix; 4] = [
    MotorMix::new(1.0, 0.0, 1.0, -1.0),  // rear
    MotorMix::new(1.0, -1.0, 0.0, 1.0),  // right
    MotorMix::new(1.0, 1.0, 0.0, 1.0),   // left
    MotorMix::new(1.0, 0.0, -1.0, -1.0), // front
];

const HEX_X: [MotorMix; 6] = [
    MotorMix::new(1.0, -0.5, 0.866025, 1.0),  // rear right
    MotorMix::new(1.0, -0.5, -0.866025, 1.0), // front right
    MotorMix::new(1.0, 0.5, 0.866025, -1.0),  // rear left
    MotorMix::new(1.0, 0.5, -0.866025, -1.0), // front left
    MotorMix::new(1.0, -1.0, 0.0, -1.0),      // right
    MotorMix::new(1.0, 1.0, 0.0, 1.0),        // left
];

/// Fixed per-airframe mixing table, one row per motor.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MixerMatrix {
    airframe: Airframe,
    rows: [MotorMix; MAX_MOTORS],
    count: usize,
}

impl MixerMatrix {
    fn from_rows(airframe: Airframe, rows: &[MotorMix]) -> Self {
        let count = rows.len().min(MAX_MOTORS);
        let mut table = [MotorMix::default(); MAX_MOTORS];
        table[..count].copy_from_slice(&rows[..count]);
        Self {
            airframe,
            rows: table,
            count,
        }
    }

    pub fn quad_x() -> Self {
        Self::from_rows(Airframe::QuadX, &QUAD_X)
    }

    pub fn quad_plus() -> Self {
        Self::from_rows(Airframe::QuadPlus, &QUAD_PLUS)
    }

    pub fn hex_x() -> Self {
        Self::from_rows(Airframe::HexX, &HEX_X)
    }

    pub fn custom(rows: &[MotorMix]) -> Result<Self, ConfigError> {
        if rows.is_empty() || rows.len() > MAX_MOTORS {
            return Err(ConfigError::MixerSize);
        }
        Ok(Self::from_rows(Airframe::Custom, rows))
    }

    /// Preset by parameter-link id.
    pub fn preset(id: u32) -> Option<Self> {
        match id {
            0 => Some(Self::quad_x()),
            1 => Some(Self::quad_plus()),
            2 => Some(Self::hex_x()),
            _ => None,
        }
    }

    pub fn airframe(&self) -> Airframe {
        self.airframe
    }

    pub fn rows(&self) -> &[MotorMix] {
        &self.rows[..self.count]
    }

    pub fn motor_count(&self) -> usize {
        self.count
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.count == 0 || self.count > MAX_MOTORS {
            return Err(ConfigError::MixerSize);
        }
        for row in self.rows() {
            let coeffs = [row.throttle, row.roll, row.pitch, row.yaw];
            if coeffs.iter().any(|c| !c.is_finite()) {
                return Err(ConfigError::NotFinite("mixer.rows"));
            }
            if !(0.0..=1.0).contains(&row.throttle) {
                return Err(ConfigError::OutOfBounds("mixer.rows"));
            }
        }
        Ok(())
    }
}

/// What gives way when throttle plus torque does not fit the output range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ClipStrategy {
    /// Keep collective throttle, shrink all torques by the same factor.
    ThrottlePreserving,
    /// Keep torques, shift collective throttle. Torques are only scaled when
    /// their spread alone exceeds the output range.
    AttitudePreserving,
}

impl ClipStrategy {
    pub fn id(self) -> u32 {
        match self {
            ClipStrategy::ThrottlePreserving => 0,
            ClipStrategy::AttitudePreserving => 1,
        }
    }

    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            0 => Some(ClipStrategy::ThrottlePreserving),
            1 => Some(ClipStrategy::AttitudePreserving),
            _ => None,
        }
    }
}

/// Stateless mixer: the same inputs always give the same outputs.
#[derive(Clone, Copy, Debug)]
pub struct Mixer {
    matrix: MixerMatrix,
    clip: ClipStrategy,
    output_min: f32,
    output_max: f32,
}

fn finite_or_zero(v: f32) -> f32 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

impl Mixer {
    pub fn new(matrix: MixerMatrix, clip: ClipStrategy, output_min: f32, output_max: f32) -> Self {
        Self {
            matrix,
            clip,
            output_min,
            output_max,
        }
    }

    pub fn motor_count(&self) -> usize {
        self.matrix.motor_count()
    }

    /// `throttle` in [0, 1], torques in [-1, 1]. Inputs outside those ranges
    /// are clamped, non-finite inputs read as zero.
    pub fn mix(&self, throttle: f32, roll: f32, pitch: f32, yaw: f32) -> ActuatorCommands {
        let throttle = finite_or_zero(throttle).clamp(0.0, 1.0);
        let roll = finite_or_zero(roll).clamp(-1.0, 1.0);
        let pitch = finite_or_zero(pitch).clamp(-1.0, 1.0);
        let yaw = finite_or_zero(yaw).clamp(-1.0, 1.0);

        let rows = self.matrix.rows();
        let mut thrust = [0.0f32; MAX_MOTORS];
        let mut torque = [0.0f32; MAX_MOTORS];
        for (i, m) in rows.iter().enumerate() {
            thrust[i] = throttle * m.throttle;
            torque[i] = roll * m.roll + pitch * m.pitch + yaw * m.yaw;
        }
        let n = rows.len();
        let thrust = &thrust[..n];
        let torque = &mut torque[..n];

        let mut saturated = false;
        let mut shift = 0.0f32;

        match self.clip {
            ClipStrategy::ThrottlePreserving => {
                // Largest uniform scale that keeps every motor inside [0, 1].
                let mut scale = 1.0f32;
                for (&t, &q) in thrust.iter().zip(torque.iter()) {
                    if q > 0.0 && t + q > 1.0 {
                        scale = scale.min((1.0 - t) / q);
                    } else if q < 0.0 && t + q < 0.0 {
                        scale = scale.min(t / -q);
                    }
                }
                if scale < 1.0 {
                    saturated = true;
                    let scale = scale.max(0.0);
                    torque.iter_mut().for_each(|q| *q *= scale);
                }
            }
            ClipStrategy::AttitudePreserving => {
                let (lo, hi) = torque
                    .iter()
                    .fold((f32::MAX, f32::MIN), |(lo, hi), &q| (lo.min(q), hi.max(q)));
                let spread = hi - lo;
                let (lo, hi) = if spread > 1.0 {
                    saturated = true;
                    let scale = 1.0 / spread;
                    torque.iter_mut().for_each(|q| *q *= scale);
                    (lo * scale, hi * scale)
                } else {
                    (lo, hi)
                };
                let (t_lo, t_hi) = thrust
                    .iter()
                    .fold((f32::MAX, f32::MIN), |(a, b), &t| (a.min(t), b.max(t)));
                if t_hi + hi > 1.0 {
                    shift = 1.0 - (t_hi + hi);
                } else if t_lo + lo < 0.0 {
                    shift = -(t_lo + lo);
                }
                if shift != 0.0 {
                    saturated = true;
                }
            }
        }

        let span = self.output_max - self.output_min;
        let mut out = [0.0f32; MAX_MOTORS];
        for i in 0..n {
            let u = thrust[i] + torque[i] + shift;
            let clamped = u.clamp(0.0, 1.0);
            // Rounding and uneven throttle columns can still leave a sliver.
            if (u - clamped).abs() > 1e-4 {
                saturated = true;
            }
            out[i] = self.output_min + clamped * span;
        }

        ActuatorCommands::from_slice(&out[..n], saturated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn quad(clip: ClipStrategy) -> Mixer {
        Mixer::new(MixerMatrix::quad_x(), clip, 0.05, 1.0)
    }

    #[test]
    fn hover_is_uniform() {
        let out = quad(ClipStrategy::ThrottlePreserving).mix(0.5, 0.0, 0.0, 0.0);
        assert_eq!(out.len(), 4);
        for &v in out.as_slice() {
            assert_relative_eq!(v, 0.05 + 0.5 * 0.95, epsilon = 1e-6);
        }
        assert!(!out.saturated);
    }

    #[test]
    fn roll_right_speeds_up_left_motors() {
        let out = quad(ClipStrategy::ThrottlePreserving).mix(0.5, 0.2, 0.0, 0.0);
        let v = out.as_slice();
        assert!(v[2] > v[0] && v[3] > v[1]);
        assert_relative_eq!(v[0], v[1]);
    }

    #[test]
    fn mixing_is_idempotent() {
        for clip in [ClipStrategy::ThrottlePreserving, ClipStrategy::AttitudePreserving] {
            let m = quad(clip);
            let a = m.mix(0.7, 0.9, -0.6, 0.4);
            let b = m.mix(0.7, 0.9, -0.6, 0.4);
            assert_eq!(a, b);
        }
    }

    #[test]
    fn throttle_preserving_scales_torque() {
        let out = quad(ClipStrategy::ThrottlePreserving).mix(0.9, 0.5, 0.0, 0.0);
        assert!(out.saturated);
        let v = out.as_slice();
        // Collective stays at the commanded throttle.
        let mean = v.iter().sum::<f32>() / 4.0;
        assert_relative_eq!(mean, 0.05 + 0.9 * 0.95, epsilon = 1e-5);
        assert_relative_eq!(v[2], 1.0, epsilon = 1e-5);
        assert!(v[0] < v[2]);
    }

    #[test]
    fn attitude_preserving_shifts_throttle() {
        let out = quad(ClipStrategy::AttitudePreserving).mix(0.9, 0.3, 0.0, 0.0);
        assert!(out.saturated);
        let v = out.as_slice();
        // Full differential kept: 0.6 of the unit range between the sides.
        assert_relative_eq!(v[2] - v[0], 0.6 * 0.95, epsilon = 1e-5);
        assert_relative_eq!(v[2], 1.0, epsilon = 1e-5);
    }

    #[test]
    fn full_stick_stays_in_range() {
        for clip in [ClipStrategy::ThrottlePreserving, ClipStrategy::AttitudePreserving] {
            let m = quad(clip);
            for &thr in &[0.0, 0.1, 0.5, 0.95, 1.0] {
                for &(r, p, y) in &[(1.0, 1.0, 1.0), (-1.0, 1.0, -1.0), (1.0, -1.0, 0.5)] {
                    let out = m.mix(thr, r, p, y);
                    for &v in out.as_slice() {
                        assert!((0.05..=1.0).contains(&v), "{:?} {} -> {}", clip, thr, v);
                    }
                }
            }
        }
    }

    #[test]
    fn non_finite_inputs_read_as_zero() {
        let out = quad(ClipStrategy::AttitudePreserving).mix(f32::NAN, f32::INFINITY, 0.0, 0.0);
        for &v in out.as_slice() {
            assert_relative_eq!(v, 0.05);
        }
    }

    #[test]
    fn custom_matrix_bounds() {
        assert_eq!(MixerMatrix::custom(&[]), Err(ConfigError::MixerSize));
        let rows = [MotorMix::new(1.0, 0.0, 0.0, 0.0); 9];
        assert_eq!(MixerMatrix::custom(&rows), Err(ConfigError::MixerSize));
        let m = MixerMatrix::custom(&rows[..2]).unwrap();
        assert_eq!(m.motor_count(), 2);
        assert_eq!(m.airframe(), Airframe::Custom);
        assert_eq!(MixerMatrix::hex_x().motor_count(), 6);
    }
}
