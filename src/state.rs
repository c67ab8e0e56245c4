//! Data exchanged between the stages of one control cycle.
//!
//! All types are `Copy` so they can be handed across embassy channels and
//! held in the cycle report without borrowing the core.

// ── Axes ──────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Axis {
    Roll = 0,
    Pitch = 1,
    Yaw = 2,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::Roll, Axis::Pitch, Axis::Yaw];

    pub fn name(self) -> &'static str {
        match self {
            Axis::Roll => "roll",
            Axis::Pitch => "pitch",
            Axis::Yaw => "yaw",
        }
    }
}

// ── Sensor ────────────────────────────────────────────────────────────────────

/// One IMU read, already scaled to physical units.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ImuSample {
    /// Body angular rate, deg/s (x = roll, y = pitch, z = yaw).
    pub gyro_dps: [f32; 3],
    /// Specific force, g. Level and at rest reads (0, 0, 1).
    pub accel_g: [f32; 3],
}

impl ImuSample {
    pub const fn new(gyro_dps: [f32; 3], accel_g: [f32; 3]) -> Self {
        Self { gyro_dps, accel_g }
    }

    pub fn is_finite(&self) -> bool {
        self.gyro_dps.iter().chain(self.accel_g.iter()).all(|v| v.is_finite())
    }
}

// ── Estimate ──────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct AttitudeEstimate {
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
    pub roll_rate: f32,
    pub pitch_rate: f32,
    pub yaw_rate: f32,
    /// Calibration timed out; offsets are defaults.
    pub degraded: bool,
    /// The accelerometer correction was skipped this cycle.
    pub accel_rejected: bool,
}

impl AttitudeEstimate {
    pub fn angle(&self, axis: Axis) -> f32 {
        match axis {
            Axis::Roll => self.roll,
            Axis::Pitch => self.pitch,
            Axis::Yaw => self.yaw,
        }
    }

    pub fn rate(&self, axis: Axis) -> f32 {
        match axis {
            Axis::Roll => self.roll_rate,
            Axis::Pitch => self.pitch_rate,
            Axis::Yaw => self.yaw_rate,
        }
    }
}

// ── Pilot commands ────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlightMode {
    /// Self-level: sticks command angles, yaw stick steers the heading.
    #[default]
    Angle,
    /// Acro: sticks command body rates.
    Rate,
}

impl FlightMode {
    pub fn label(self) -> &'static str {
        match self {
            FlightMode::Angle => "ANGL",
            FlightMode::Rate => "ACRO",
        }
    }
}

pub const AUX_CHANNELS: usize = 4;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CommandChannels {
    /// 0..1
    pub throttle: f32,
    /// -1..1
    pub roll: f32,
    /// -1..1
    pub pitch: f32,
    /// -1..1
    pub yaw: f32,
    pub arm_switch: bool,
    pub mode: FlightMode,
    /// -1..1
    pub aux: [f32; AUX_CHANNELS],
}

impl CommandChannels {
    pub fn stick(&self, axis: Axis) -> f32 {
        match axis {
            Axis::Roll => self.roll,
            Axis::Pitch => self.pitch,
            Axis::Yaw => self.yaw,
        }
    }
}

// ── Actuators ─────────────────────────────────────────────────────────────────

pub const MAX_MOTORS: usize = 8;

/// Normalized per-motor outputs for one cycle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ActuatorCommands {
    values: [f32; MAX_MOTORS],
    count: usize,
    /// The mixer had to clip to stay inside the output range.
    pub saturated: bool,
}

impl ActuatorCommands {
    pub fn uniform(count: usize, value: f32) -> Self {
        let count = count.min(MAX_MOTORS);
        let mut values = [0.0; MAX_MOTORS];
        values[..count].fill(value);
        Self {
            values,
            count,
            saturated: false,
        }
    }

    pub fn from_slice(outputs: &[f32], saturated: bool) -> Self {
        let count = outputs.len().min(MAX_MOTORS);
        let mut values = [0.0; MAX_MOTORS];
        values[..count].copy_from_slice(&outputs[..count]);
        Self {
            values,
            count,
            saturated,
        }
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values[..self.count]
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.values[..self.count]
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

// ── Safety ────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SafetyState {
    #[default]
    Disarmed,
    Armed,
    Failsafe,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FailsafeCause {
    SignalLoss,
    SensorFault,
    AttitudeDivergence,
}

impl FailsafeCause {
    /// Whether the attitude can still be trusted to fly the descent profile.
    pub fn allows_descent(self) -> bool {
        matches!(self, FailsafeCause::SignalLoss)
    }
}
