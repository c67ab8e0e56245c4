//! CRSF (Crossfire) serial framing: `[sync][len][type][payload..][crc8]`.
//!
//! `len` counts type, payload and CRC. The CRC is CRC-8/DVB-S2 (poly 0xD5)
//! over type and payload.

pub const CRSF_SYNC: u8 = 0xC8;
pub const CRSF_MAX_FRAME: usize = 64;

pub const FRAMETYPE_LINK_STATISTICS: u8 = 0x14;
pub const FRAMETYPE_RC_CHANNELS_PACKED: u8 = 0x16;
pub const FRAMETYPE_ATTITUDE: u8 = 0x1E;
pub const FRAMETYPE_FLIGHT_MODE: u8 = 0x21;

pub const CRSF_CHANNELS: usize = 16;
const RC_PAYLOAD_LEN: usize = 22;
const LINK_STATS_PAYLOAD_LEN: usize = 10;

/// Raw stick range of an 11-bit CRSF channel (≈ 988..2012 µs).
pub const CHANNEL_MIN: u16 = 172;
pub const CHANNEL_MID: u16 = 992;
pub const CHANNEL_MAX: u16 = 1811;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LinkStatistics {
    pub uplink_rssi_1: u8,
    pub uplink_rssi_2: u8,
    /// Percent.
    pub uplink_link_quality: u8,
    pub uplink_snr: i8,
    pub active_antenna: u8,
    pub rf_mode: u8,
    pub uplink_tx_power: u8,
    pub downlink_rssi: u8,
    pub downlink_link_quality: u8,
    pub downlink_snr: i8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CrsfFrame {
    RcChannels([u16; CRSF_CHANNELS]),
    LinkStatistics(LinkStatistics),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ParseState {
    Sync,
    Len,
    Body { len: usize },
}

/// Byte-at-a-time frame parser. Frames failing the CRC are dropped.
pub struct CrsfParser {
    state: ParseState,
    buffer: heapless::Vec<u8, CRSF_MAX_FRAME>,
    crc_errors: u32,
}

impl Default for CrsfParser {
    fn default() -> Self {
        Self::new()
    }
}

impl CrsfParser {
    pub const fn new() -> Self {
        Self {
            state: ParseState::Sync,
            buffer: heapless::Vec::new(),
            crc_errors: 0,
        }
    }

    pub fn crc_errors(&self) -> u32 {
        self.crc_errors
    }

    pub fn push_byte(&mut self, b: u8) -> Option<CrsfFrame> {
        match self.state {
            ParseState::Sync => {
                if b == CRSF_SYNC {
                    self.state = ParseState::Len;
                }
                None
            }
            ParseState::Len => {
                // type + crc at least; the whole frame must fit the buffer
                if !(2..=(CRSF_MAX_FRAME - 2) as u8).contains(&b) {
                    self.state = if b == CRSF_SYNC {
                        ParseState::Len
                    } else {
                        ParseState::Sync
                    };
                    return None;
                }
                self.buffer.clear();
                self.state = ParseState::Body { len: b as usize };
                None
            }
            ParseState::Body { len } => {
                // Capacity is checked in the Len state.
                let _ = self.buffer.push(b);
                if self.buffer.len() < len {
                    return None;
                }
                self.state = ParseState::Sync;
                let (body, crc) = self.buffer.split_at(len - 1);
                if crc8(body) != crc[0] {
                    self.crc_errors = self.crc_errors.wrapping_add(1);
                    return None;
                }
                decode(body[0], &body[1..])
            }
        }
    }

    /// Feed a chunk; returns the last complete frame in it.
    pub fn push_bytes(&mut self, data: &[u8]) -> Option<CrsfFrame> {
        data.iter().fold(None, |last, &b| self.push_byte(b).or(last))
    }
}

fn decode(frame_type: u8, payload: &[u8]) -> Option<CrsfFrame> {
    match frame_type {
        FRAMETYPE_RC_CHANNELS_PACKED if payload.len() == RC_PAYLOAD_LEN => {
            Some(CrsfFrame::RcChannels(unpack_channels(payload)))
        }
        FRAMETYPE_LINK_STATISTICS if payload.len() == LINK_STATS_PAYLOAD_LEN => {
            Some(CrsfFrame::LinkStatistics(LinkStatistics {
                uplink_rssi_1: payload[0],
                uplink_rssi_2: payload[1],
                uplink_link_quality: payload[2],
                uplink_snr: payload[3] as i8,
                active_antenna: payload[4],
                rf_mode: payload[5],
                uplink_tx_power: payload[6],
                downlink_rssi: payload[7],
                downlink_link_quality: payload[8],
                downlink_snr: payload[9] as i8,
            }))
        }
        _ => None,
    }
}

pub fn crc8(data: &[u8]) -> u8 {
    let mut crc: u8 = 0;
    for &b in data {
        crc ^= b;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0xD5
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// 16 little-endian 11-bit fields packed back to back.
fn unpack_channels(payload: &[u8]) -> [u16; CRSF_CHANNELS] {
    let mut channels = [0u16; CRSF_CHANNELS];
    let mut acc: u32 = 0;
    let mut bits = 0;
    let mut bytes = payload.iter();
    for ch in channels.iter_mut() {
        while bits < 11 {
            let Some(&b) = bytes.next() else {
                return channels;
            };
            acc |= (b as u32) << bits;
            bits += 8;
        }
        *ch = (acc & 0x07FF) as u16;
        acc >>= 11;
        bits -= 11;
    }
    channels
}

fn pack_channels(channels: &[u16; CRSF_CHANNELS]) -> [u8; RC_PAYLOAD_LEN] {
    let mut out = [0u8; RC_PAYLOAD_LEN];
    let mut acc: u32 = 0;
    let mut bits = 0;
    let mut i = 0;
    for &ch in channels {
        acc |= ((ch & 0x07FF) as u32) << bits;
        bits += 11;
        while bits >= 8 {
            out[i] = acc as u8;
            i += 1;
            acc >>= 8;
            bits -= 8;
        }
    }
    out
}

/// Serialize one frame into `buf`; returns the number of bytes written, or 0
/// if `buf` is too small.
pub fn write_frame(buf: &mut [u8], frame_type: u8, payload: &[u8]) -> usize {
    let len = payload.len() + 2;
    let total = len + 2;
    if buf.len() < total || total > CRSF_MAX_FRAME {
        return 0;
    }
    buf[0] = CRSF_SYNC;
    buf[1] = len as u8;
    buf[2] = frame_type;
    buf[3..3 + payload.len()].copy_from_slice(payload);
    buf[total - 1] = crc8(&buf[2..total - 1]);
    total
}

/// RC channels frame, as a receiver would send it.
pub fn write_rc_channels(buf: &mut [u8], channels: &[u16; CRSF_CHANNELS]) -> usize {
    write_frame(buf, FRAMETYPE_RC_CHANNELS_PACKED, &pack_channels(channels))
}

/// Attitude telemetry. Angles in radians, sent as 1/10000 rad big endian in
/// pitch, roll, yaw order.
pub fn write_attitude(buf: &mut [u8], roll: f32, pitch: f32, yaw: f32) -> usize {
    let scale = |rad: f32| -> [u8; 2] {
        let v = (rad * 10_000.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        v.to_be_bytes()
    };
    let mut payload = [0u8; 6];
    payload[0..2].copy_from_slice(&scale(pitch));
    payload[2..4].copy_from_slice(&scale(roll));
    payload[4..6].copy_from_slice(&scale(yaw));
    write_frame(buf, FRAMETYPE_ATTITUDE, &payload)
}

/// Flight mode telemetry: a NUL terminated ASCII label.
pub fn write_flight_mode(buf: &mut [u8], label: &str) -> usize {
    let mut payload: heapless::Vec<u8, 16> = heapless::Vec::new();
    for &b in label.as_bytes().iter().take(15) {
        let _ = payload.push(b);
    }
    let _ = payload.push(0);
    write_frame(buf, FRAMETYPE_FLIGHT_MODE, &payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_channels() -> [u16; CRSF_CHANNELS] {
        let mut ch = [CHANNEL_MID; CRSF_CHANNELS];
        ch[0] = CHANNEL_MIN;
        ch[2] = CHANNEL_MAX;
        ch[4] = 1500;
        ch[15] = 2047;
        ch
    }

    #[test]
    fn crc_matches_known_vector() {
        // CRC-8/DVB-S2 check value for "123456789"
        assert_eq!(crc8(b"123456789"), 0xBC);
    }

    #[test]
    fn parses_rc_frame_from_noisy_stream() {
        let mut buf = [0u8; CRSF_MAX_FRAME];
        let n = write_rc_channels(&mut buf, &sample_channels());
        assert_eq!(n, 26);

        let mut parser = CrsfParser::new();
        assert_eq!(parser.push_bytes(&[0x00, 0x13, CRSF_SYNC, 0xFF]), None);
        match parser.push_bytes(&buf[..n]) {
            Some(CrsfFrame::RcChannels(ch)) => assert_eq!(ch, sample_channels()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn corrupted_frame_is_dropped() {
        let mut buf = [0u8; CRSF_MAX_FRAME];
        let n = write_rc_channels(&mut buf, &sample_channels());
        buf[7] ^= 0x40;

        let mut parser = CrsfParser::new();
        assert_eq!(parser.push_bytes(&buf[..n]), None);
        assert_eq!(parser.crc_errors(), 1);

        // The parser resynchronises on the next good frame.
        let n = write_rc_channels(&mut buf, &sample_channels());
        assert!(matches!(parser.push_bytes(&buf[..n]), Some(CrsfFrame::RcChannels(_))));
    }

    #[test]
    fn decodes_link_statistics() {
        let payload = [100, 98, 87, 0xF6, 1, 4, 3, 90, 100, 5];
        let mut buf = [0u8; CRSF_MAX_FRAME];
        let n = write_frame(&mut buf, FRAMETYPE_LINK_STATISTICS, &payload);

        let mut parser = CrsfParser::new();
        match parser.push_bytes(&buf[..n]) {
            Some(CrsfFrame::LinkStatistics(stats)) => {
                assert_eq!(stats.uplink_link_quality, 87);
                assert_eq!(stats.uplink_snr, -10);
                assert_eq!(stats.downlink_snr, 5);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn attitude_frame_layout() {
        let mut buf = [0u8; CRSF_MAX_FRAME];
        let n = write_attitude(&mut buf, 0.1, -0.2, 3.0);
        assert_eq!(n, 10);
        assert_eq!(&buf[..3], &[CRSF_SYNC, 8, FRAMETYPE_ATTITUDE]);
        assert_eq!(i16::from_be_bytes([buf[3], buf[4]]), -2000);
        assert_eq!(i16::from_be_bytes([buf[5], buf[6]]), 1000);
        assert_eq!(i16::from_be_bytes([buf[7], buf[8]]), 30000);
        assert_eq!(buf[9], crc8(&buf[2..9]));
    }

    #[test]
    fn flight_mode_is_nul_terminated() {
        let mut buf = [0u8; CRSF_MAX_FRAME];
        let n = write_flight_mode(&mut buf, "ANGL");
        assert_eq!(&buf[2..8], &[FRAMETYPE_FLIGHT_MODE, b'A', b'N', b'G', b'L', 0]);
        assert_eq!(n, 9);
    }

    #[test]
    fn short_buffer_writes_nothing() {
        let mut buf = [0u8; 8];
        assert_eq!(write_rc_channels(&mut buf, &sample_channels()), 0);
    }
}
