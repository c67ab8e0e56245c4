use crate::error::{ConfigError, SignalLoss};
use crate::protocol::crsf::{CHANNEL_MAX, CHANNEL_MID, CHANNEL_MIN, CRSF_CHANNELS};
use crate::state::{CommandChannels, FlightMode, AUX_CHANNELS};

/// Raw channel ticks more than this far outside the stick range mark the
/// frame as garbage.
const OUT_OF_RANGE_MARGIN: u16 = 100;
/// Switch channels read as "high" above this tick value (≈ 1.6 ms).
const SWITCH_HIGH: u16 = 1400;

/// One decoded receiver frame, raw 11-bit ticks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RcFrame {
    pub channels: [u16; CRSF_CHANNELS],
}

impl Default for RcFrame {
    fn default() -> Self {
        Self {
            channels: [CHANNEL_MID; CRSF_CHANNELS],
        }
    }
}

/// Latest-value buffer between the receiver driver and the control cycle.
pub trait FrameSource {
    fn poll(&mut self) -> Option<RcFrame>;
}

impl<T: FrameSource + ?Sized> FrameSource for &mut T {
    fn poll(&mut self) -> Option<RcFrame> {
        (**self).poll()
    }
}

/// Zero-based channel index for every function.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChannelMap {
    pub roll: u8,
    pub pitch: u8,
    pub throttle: u8,
    pub yaw: u8,
    pub arm: u8,
    pub mode: u8,
    pub aux: [u8; AUX_CHANNELS],
}

impl Default for ChannelMap {
    /// AETR plus arm on channel 5 and mode on channel 6.
    fn default() -> Self {
        Self {
            roll: 0,
            pitch: 1,
            throttle: 2,
            yaw: 3,
            arm: 4,
            mode: 5,
            aux: [6, 7, 8, 9],
        }
    }
}

impl ChannelMap {
    fn primary(&self) -> [u8; 6] {
        [self.roll, self.pitch, self.throttle, self.yaw, self.arm, self.mode]
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let primary = self.primary();
        let in_range = primary
            .iter()
            .chain(self.aux.iter())
            .all(|&c| (c as usize) < CRSF_CHANNELS);
        let distinct = primary
            .iter()
            .enumerate()
            .all(|(i, c)| !primary[i + 1..].contains(c));
        if in_range && distinct {
            Ok(())
        } else {
            Err(ConfigError::ChannelMap)
        }
    }
}

fn stick(raw: u16) -> f32 {
    let half = (CHANNEL_MAX - CHANNEL_MIN) as f32 / 2.0;
    ((raw as f32 - CHANNEL_MID as f32) / half).clamp(-1.0, 1.0)
}

fn unit(raw: u16) -> f32 {
    ((raw as f32 - CHANNEL_MIN as f32) / (CHANNEL_MAX - CHANNEL_MIN) as f32).clamp(0.0, 1.0)
}

fn plausible(raw: u16) -> bool {
    (CHANNEL_MIN - OUT_OF_RANGE_MARGIN..=CHANNEL_MAX + OUT_OF_RANGE_MARGIN).contains(&raw)
}

/// Turns raw frames into pilot commands and watches the link timeout.
pub struct ReceiverInterface {
    map: ChannelMap,
    timeout_ms: u32,
    last: Option<CommandChannels>,
    last_valid_us: Option<u64>,
    rejected: u32,
}

impl ReceiverInterface {
    pub fn new(map: ChannelMap, timeout_ms: u32) -> Self {
        Self {
            map,
            timeout_ms,
            last: None,
            last_valid_us: None,
            rejected: 0,
        }
    }

    pub fn reconfigure(&mut self, map: ChannelMap, timeout_ms: u32) {
        self.map = map;
        self.timeout_ms = timeout_ms;
    }

    /// Frames discarded because the sticks were far outside the range.
    pub fn rejected(&self) -> u32 {
        self.rejected
    }

    /// Last accepted commands, even if the link has since timed out.
    pub fn last_commands(&self) -> Option<&CommandChannels> {
        self.last.as_ref()
    }

    pub fn decode(&self, frame: &RcFrame) -> Option<CommandChannels> {
        let ch = |idx: u8| frame.channels[idx as usize];
        let m = &self.map;

        let sticks = [ch(m.roll), ch(m.pitch), ch(m.throttle), ch(m.yaw)];
        if !sticks.iter().all(|&raw| plausible(raw)) {
            return None;
        }

        let mut aux = [0.0; AUX_CHANNELS];
        for (a, &idx) in aux.iter_mut().zip(m.aux.iter()) {
            *a = stick(ch(idx));
        }

        Some(CommandChannels {
            throttle: unit(ch(m.throttle)),
            roll: stick(ch(m.roll)),
            pitch: stick(ch(m.pitch)),
            yaw: stick(ch(m.yaw)),
            arm_switch: ch(m.arm) > SWITCH_HIGH,
            mode: if ch(m.mode) > SWITCH_HIGH {
                FlightMode::Rate
            } else {
                FlightMode::Angle
            },
            aux,
        })
    }

    /// Called once per cycle with whatever frame arrived since the last one.
    /// Without a new frame the previous commands stay valid until
    /// `timeout_ms` has passed since the last good frame.
    pub fn read(&mut self, now_us: u64, frame: Option<RcFrame>) -> Result<CommandChannels, SignalLoss> {
        if let Some(frame) = frame {
            match self.decode(&frame) {
                Some(commands) => {
                    self.last = Some(commands);
                    self.last_valid_us = Some(now_us);
                    return Ok(commands);
                }
                None => {
                    self.rejected = self.rejected.wrapping_add(1);
                    warn!("receiver frame rejected, sticks out of range");
                }
            }
        }

        let loss = SignalLoss {
            timeout_ms: self.timeout_ms,
        };
        match (self.last, self.last_valid_us) {
            (Some(commands), Some(t)) if now_us.saturating_sub(t) <= self.timeout_ms as u64 * 1000 => {
                Ok(commands)
            }
            _ => Err(loss),
        }
    }
}
