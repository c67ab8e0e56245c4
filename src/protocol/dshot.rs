//! DShot digital ESC protocol: 11-bit value, 1 telemetry bit, 4-bit checksum.

/// Lowest throttle code; 1..=47 are reserved for ESC commands.
pub const THROTTLE_MIN: u16 = 48;
pub const THROTTLE_MAX: u16 = 2047;
/// Motor stop.
pub const CMD_MOTOR_STOP: u16 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DshotRate {
    Dshot150,
    Dshot300,
    Dshot600,
}

impl DshotRate {
    pub fn kbit_per_s(self) -> u32 {
        match self {
            DshotRate::Dshot150 => 150,
            DshotRate::Dshot300 => 300,
            DshotRate::Dshot600 => 600,
        }
    }

    /// Duration of one 16-bit frame, rounded up to whole µs.
    pub fn frame_us(self) -> u32 {
        16_000u32.div_ceil(self.kbit_per_s())
    }
}

/// Throttle code for a normalized output. Zero (and anything below) stops
/// the motor; the rest maps linearly onto 48..=2047.
pub fn throttle_code(value: f32) -> u16 {
    if value.is_nan() || value <= 0.0 {
        return CMD_MOTOR_STOP;
    }
    let span = (THROTTLE_MAX - THROTTLE_MIN) as f32;
    let code = THROTTLE_MIN as f32 + value.min(1.0) * span;
    (code + 0.5) as u16
}

pub fn frame(value: u16, telemetry: bool) -> u16 {
    let packet = ((value & 0x07FF) << 1) | telemetry as u16;
    let csum = (packet ^ (packet >> 4) ^ (packet >> 8)) & 0x000F;
    (packet << 4) | csum
}
