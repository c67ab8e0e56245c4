//! Normalized actuator commands to ESC pulses.

use crate::config::OutputConfig;
use crate::error::ConfigError;
use crate::protocol::dshot::{self, DshotRate};
use crate::state::{ActuatorCommands, MAX_MOTORS};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OutputProtocol {
    /// Classic servo-style pulses, `min_us` = stopped, `max_us` = full.
    Pwm { min_us: u16, max_us: u16 },
    Dshot { rate: DshotRate },
}

impl OutputProtocol {
    /// Longest pulse one channel can need.
    pub fn max_pulse_us(&self) -> u32 {
        match *self {
            OutputProtocol::Pwm { max_us, .. } => max_us as u32,
            OutputProtocol::Dshot { rate } => rate.frame_us(),
        }
    }
}

/// Where one channel's pulse sits inside the output window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PulseSlot {
    pub offset_us: u32,
    pub width_us: u32,
}

impl PulseSlot {
    pub fn end_us(&self) -> u32 {
        self.offset_us + self.width_us
    }
}

/// Channel pulses laid out back to back, in channel order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PulseSchedule {
    slots: [PulseSlot; MAX_MOTORS],
    count: usize,
}

impl PulseSchedule {
    fn build(widths: &[u32], guard_us: u32) -> Self {
        let mut slots = [PulseSlot::default(); MAX_MOTORS];
        let count = widths.len().min(MAX_MOTORS);
        let mut offset = 0;
        for (slot, &width_us) in slots.iter_mut().zip(widths.iter()) {
            *slot = PulseSlot {
                offset_us: offset,
                width_us,
            };
            offset += width_us + guard_us;
        }
        Self { slots, count }
    }

    pub fn slots(&self) -> &[PulseSlot] {
        &self.slots[..self.count]
    }

    /// End of the last pulse.
    pub fn span_us(&self) -> u32 {
        self.slots().last().map_or(0, PulseSlot::end_us)
    }

    pub fn is_well_formed(&self) -> bool {
        self.slots()
            .windows(2)
            .all(|w| w[0].end_us() <= w[1].offset_us)
    }
}

/// One cycle's worth of output, ready for the pin driver.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OutputFrame {
    pub protocol: OutputProtocol,
    /// Pulse width in µs for PWM, the full 16-bit frame for DShot.
    words: [u16; MAX_MOTORS],
    count: usize,
    pub schedule: PulseSchedule,
}

impl OutputFrame {
    pub fn words(&self) -> &[u16] {
        &self.words[..self.count]
    }

    /// DShot throttle values without telemetry bit and checksum.
    pub fn dshot_values(&self) -> impl Iterator<Item = u16> + '_ {
        self.words().iter().map(|w| w >> 5)
    }
}

/// Consumes one frame per cycle.
pub trait ActuatorSink {
    fn emit(&mut self, frame: &OutputFrame);
}

impl<T: ActuatorSink + ?Sized> ActuatorSink for &mut T {
    fn emit(&mut self, frame: &OutputFrame) {
        (**self).emit(frame)
    }
}

pub struct OutputDriver {
    protocol: OutputProtocol,
    guard_us: u32,
}

impl OutputDriver {
    pub fn new(config: &OutputConfig) -> Self {
        Self {
            protocol: config.protocol,
            guard_us: config.guard_us,
        }
    }

    /// Check that `motors` worst-case pulses fit in one control period.
    pub fn check_fits(config: &OutputConfig, motors: usize, loop_hz: u32) -> Result<(), ConfigError> {
        let widths = [config.protocol.max_pulse_us(); MAX_MOTORS];
        let schedule = PulseSchedule::build(&widths[..motors.min(MAX_MOTORS)], config.guard_us);
        let period_us = 1_000_000 / loop_hz.max(1);
        if schedule.span_us() > period_us {
            return Err(ConfigError::ScheduleOverflow);
        }
        Ok(())
    }

    pub fn encode(&self, commands: &ActuatorCommands) -> OutputFrame {
        let mut words = [0u16; MAX_MOTORS];
        let mut widths = [0u32; MAX_MOTORS];
        let n = commands.len();

        for (i, &v) in commands.as_slice().iter().enumerate() {
            let v = if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 };
            match self.protocol {
                OutputProtocol::Pwm { min_us, max_us } => {
                    let us = min_us as f32 + v * (max_us - min_us) as f32;
                    words[i] = (us + 0.5) as u16;
                    widths[i] = words[i] as u32;
                }
                OutputProtocol::Dshot { rate } => {
                    words[i] = dshot::frame(dshot::throttle_code(v), false);
                    widths[i] = rate.frame_us();
                }
            }
        }

        OutputFrame {
            protocol: self.protocol,
            words,
            count: n,
            schedule: PulseSchedule::build(&widths[..n], self.guard_us),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlightConfig;

    fn pwm_config() -> OutputConfig {
        OutputConfig {
            protocol: OutputProtocol::Pwm {
                min_us: 1000,
                max_us: 2000,
            },
            ..FlightConfig::default().output
        }
    }

    #[test]
    fn pwm_widths_and_schedule() {
        let cfg = pwm_config();
        let driver = OutputDriver::new(&cfg);
        let frame = driver.encode(&ActuatorCommands::from_slice(&[0.0, 0.5, 1.0, 0.25], false));
        assert_eq!(frame.words(), &[1000, 1500, 2000, 1250]);

        let slots = frame.schedule.slots();
        assert_eq!(slots[0], PulseSlot { offset_us: 0, width_us: 1000 });
        assert_eq!(slots[1].offset_us, 1000 + cfg.guard_us);
        assert!(frame.schedule.is_well_formed());
        assert_eq!(frame.schedule.span_us(), 5750 + 3 * cfg.guard_us);
    }

    #[test]
    fn dshot_stop_and_full() {
        let cfg = FlightConfig::default().output;
        let driver = OutputDriver::new(&cfg);
        let frame = driver.encode(&ActuatorCommands::from_slice(&[0.0, 1.0, f32::NAN], false));
        let values: heapless::Vec<u16, 8> = frame.dshot_values().collect();
        assert_eq!(values.as_slice(), &[0, 2047, 0]);
        assert!(frame.schedule.is_well_formed());
    }

    #[test]
    fn schedule_must_fit_period() {
        let pwm = pwm_config();
        assert_eq!(OutputDriver::check_fits(&pwm, 4, 1000), Err(ConfigError::ScheduleOverflow));
        assert!(OutputDriver::check_fits(&pwm, 4, 100).is_ok());
        let dshot = FlightConfig::default().output;
        assert!(OutputDriver::check_fits(&dshot, 8, 1000).is_ok());
        assert_eq!(OutputDriver::check_fits(&dshot, 8, 8000), Err(ConfigError::ScheduleOverflow));
    }
}
