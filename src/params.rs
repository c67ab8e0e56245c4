//! Line-oriented parameter protocol for the USB console.
//!
//! ```text
//! get rate.roll.kp
//! set rate.roll.kp 0.004
//! list
//! apply
//! status
//! ```
//!
//! `set` edits a session-local staged copy; `apply` validates it and hands it
//! to the caller for submission to the [`ConfigStore`](crate::ConfigStore).

use core::fmt::Write;

use crate::config::FlightConfig;
use crate::control::{ClipStrategy, MixerMatrix};
use crate::error::ParamError;
use crate::estimation::FusionFilter;
use crate::io::OutputProtocol;
use crate::protocol::dshot::DshotRate;
use crate::telemetry::TelemetrySnapshot;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamKind {
    Float,
    /// Non-negative integer, also used for enumerations.
    Int,
}

pub struct ParamDef {
    pub name: &'static str,
    pub kind: ParamKind,
    /// `None` when the parameter does not apply to the current selection.
    pub get: fn(&FlightConfig) -> Option<f32>,
    pub set: fn(&mut FlightConfig, f32) -> Result<(), ParamError>,
}

macro_rules! float {
    ($name:literal, $($path:tt)+) => {
        ParamDef {
            name: $name,
            kind: ParamKind::Float,
            get: |c| Some(c.$($path)+),
            set: |c, v| {
                c.$($path)+ = v;
                Ok(())
            },
        }
    };
}

macro_rules! int {
    ($name:literal, $ty:ty, $($path:tt)+) => {
        ParamDef {
            name: $name,
            kind: ParamKind::Int,
            get: |c| Some(c.$($path)+ as f32),
            set: |c, v| {
                c.$($path)+ = v as $ty;
                Ok(())
            },
        }
    };
}

const DEFAULT_BLEND: f32 = 0.998;
const DEFAULT_MAHONY_KP: f32 = 2.0;
const DEFAULT_MAHONY_I_LIMIT_DPS: f32 = 10.0;

fn fusion_id(c: &FlightConfig) -> Option<f32> {
    Some(match c.estimator.fusion {
        FusionFilter::Complementary { .. } => 0.0,
        FusionFilter::Mahony { .. } => 1.0,
    })
}

fn set_fusion(c: &mut FlightConfig, v: f32) -> Result<(), ParamError> {
    c.estimator.fusion = match (v as u32, c.estimator.fusion) {
        (0, f @ FusionFilter::Complementary { .. }) | (1, f @ FusionFilter::Mahony { .. }) => f,
        (0, _) => FusionFilter::Complementary { blend: DEFAULT_BLEND },
        (1, _) => FusionFilter::Mahony {
            kp: DEFAULT_MAHONY_KP,
            ki: 0.0,
            i_limit_dps: DEFAULT_MAHONY_I_LIMIT_DPS,
        },
        _ => return Err(ParamError::InvalidChoice),
    };
    Ok(())
}

fn protocol_id(c: &FlightConfig) -> Option<f32> {
    Some(match c.output.protocol {
        OutputProtocol::Pwm { .. } => 0.0,
        OutputProtocol::Dshot { rate: DshotRate::Dshot150 } => 1.0,
        OutputProtocol::Dshot { rate: DshotRate::Dshot300 } => 2.0,
        OutputProtocol::Dshot { rate: DshotRate::Dshot600 } => 3.0,
    })
}

fn set_protocol(c: &mut FlightConfig, v: f32) -> Result<(), ParamError> {
    let dshot = |rate| OutputProtocol::Dshot { rate };
    c.output.protocol = match v as u32 {
        0 => match c.output.protocol {
            pwm @ OutputProtocol::Pwm { .. } => pwm,
            _ => OutputProtocol::Pwm {
                min_us: 1000,
                max_us: 2000,
            },
        },
        1 => dshot(DshotRate::Dshot150),
        2 => dshot(DshotRate::Dshot300),
        3 => dshot(DshotRate::Dshot600),
        _ => return Err(ParamError::InvalidChoice),
    };
    Ok(())
}

pub static PARAMS: &[ParamDef] = &[
    int!("loop_hz", u32, loop_hz),
    float!("rate.roll.kp", control.rate[0].kp),
    float!("rate.roll.ki", control.rate[0].ki),
    float!("rate.roll.kd", control.rate[0].kd),
    float!("rate.roll.i_limit", control.rate[0].i_limit),
    float!("rate.roll.output_limit", control.rate[0].output_limit),
    float!("rate.pitch.kp", control.rate[1].kp),
    float!("rate.pitch.ki", control.rate[1].ki),
    float!("rate.pitch.kd", control.rate[1].kd),
    float!("rate.pitch.i_limit", control.rate[1].i_limit),
    float!("rate.pitch.output_limit", control.rate[1].output_limit),
    float!("rate.yaw.kp", control.rate[2].kp),
    float!("rate.yaw.ki", control.rate[2].ki),
    float!("rate.yaw.kd", control.rate[2].kd),
    float!("rate.yaw.i_limit", control.rate[2].i_limit),
    float!("rate.yaw.output_limit", control.rate[2].output_limit),
    float!("angle.roll.kp", control.angle[0].kp),
    float!("angle.roll.ki", control.angle[0].ki),
    float!("angle.roll.kd", control.angle[0].kd),
    float!("angle.roll.i_limit", control.angle[0].i_limit),
    float!("angle.pitch.kp", control.angle[1].kp),
    float!("angle.pitch.ki", control.angle[1].ki),
    float!("angle.pitch.kd", control.angle[1].kd),
    float!("angle.pitch.i_limit", control.angle[1].i_limit),
    float!("angle.yaw.kp", control.angle[2].kp),
    float!("angle.yaw.ki", control.angle[2].ki),
    float!("angle.yaw.kd", control.angle[2].kd),
    float!("angle.yaw.i_limit", control.angle[2].i_limit),
    float!("control.d_lpf_hz", control.d_lpf_hz),
    float!("control.max_rate.roll", control.max_rate_dps[0]),
    float!("control.max_rate.pitch", control.max_rate_dps[1]),
    float!("control.max_rate.yaw", control.max_rate_dps[2]),
    float!("control.max_angle_deg", control.max_angle_deg),
    float!("control.integrator_throttle_min", control.integrator_throttle_min),
    int!("control.estimate_stale_cycles", u32, control.estimate_stale_cycles),
    ParamDef {
        name: "mixer.frame",
        kind: ParamKind::Int,
        get: |c| Some(c.mixer.matrix.airframe().id() as f32),
        set: |c, v| {
            c.mixer.matrix = MixerMatrix::preset(v as u32).ok_or(ParamError::InvalidChoice)?;
            Ok(())
        },
    },
    ParamDef {
        name: "mixer.clip",
        kind: ParamKind::Int,
        get: |c| Some(c.mixer.clip.id() as f32),
        set: |c, v| {
            c.mixer.clip = ClipStrategy::from_id(v as u32).ok_or(ParamError::InvalidChoice)?;
            Ok(())
        },
    },
    ParamDef {
        name: "output.protocol",
        kind: ParamKind::Int,
        get: protocol_id,
        set: set_protocol,
    },
    ParamDef {
        name: "output.pwm_min_us",
        kind: ParamKind::Int,
        get: |c| match c.output.protocol {
            OutputProtocol::Pwm { min_us, .. } => Some(min_us as f32),
            _ => None,
        },
        set: |c, v| match &mut c.output.protocol {
            OutputProtocol::Pwm { min_us, .. } => {
                *min_us = v as u16;
                Ok(())
            }
            _ => Err(ParamError::Inactive),
        },
    },
    ParamDef {
        name: "output.pwm_max_us",
        kind: ParamKind::Int,
        get: |c| match c.output.protocol {
            OutputProtocol::Pwm { max_us, .. } => Some(max_us as f32),
            _ => None,
        },
        set: |c, v| match &mut c.output.protocol {
            OutputProtocol::Pwm { max_us, .. } => {
                *max_us = v as u16;
                Ok(())
            }
            _ => Err(ParamError::Inactive),
        },
    },
    float!("output.min", output.min),
    float!("output.max", output.max),
    float!("output.disarmed", output.disarmed),
    int!("output.guard_us", u32, output.guard_us),
    int!("sensor.hold_cycles", u32, sensor.hold_cycles),
    float!("sensor.gyro_limit_dps", sensor.gyro_limit_dps),
    float!("sensor.accel_limit_g", sensor.accel_limit_g),
    ParamDef {
        name: "estimator.fusion",
        kind: ParamKind::Int,
        get: fusion_id,
        set: set_fusion,
    },
    ParamDef {
        name: "estimator.blend",
        kind: ParamKind::Float,
        get: |c| match c.estimator.fusion {
            FusionFilter::Complementary { blend } => Some(blend),
            _ => None,
        },
        set: |c, v| match &mut c.estimator.fusion {
            FusionFilter::Complementary { blend } => {
                *blend = v;
                Ok(())
            }
            _ => Err(ParamError::Inactive),
        },
    },
    ParamDef {
        name: "estimator.mahony_kp",
        kind: ParamKind::Float,
        get: |c| match c.estimator.fusion {
            FusionFilter::Mahony { kp, .. } => Some(kp),
            _ => None,
        },
        set: |c, v| match &mut c.estimator.fusion {
            FusionFilter::Mahony { kp, .. } => {
                *kp = v;
                Ok(())
            }
            _ => Err(ParamError::Inactive),
        },
    },
    ParamDef {
        name: "estimator.mahony_ki",
        kind: ParamKind::Float,
        get: |c| match c.estimator.fusion {
            FusionFilter::Mahony { ki, .. } => Some(ki),
            _ => None,
        },
        set: |c, v| match &mut c.estimator.fusion {
            FusionFilter::Mahony { ki, .. } => {
                *ki = v;
                Ok(())
            }
            _ => Err(ParamError::Inactive),
        },
    },
    ParamDef {
        name: "estimator.mahony_i_limit_dps",
        kind: ParamKind::Float,
        get: |c| match c.estimator.fusion {
            FusionFilter::Mahony { i_limit_dps, .. } => Some(i_limit_dps),
            _ => None,
        },
        set: |c, v| match &mut c.estimator.fusion {
            FusionFilter::Mahony { i_limit_dps, .. } => {
                *i_limit_dps = v;
                Ok(())
            }
            _ => Err(ParamError::Inactive),
        },
    },
    int!("estimator.calibration_samples", u32, estimator.calibration_samples),
    float!("estimator.calibration_max_gyro_variance", estimator.calibration_max_gyro_variance),
    int!("estimator.calibration_timeout_samples", u32, estimator.calibration_timeout_samples),
    float!("estimator.gyro_lpf_hz", estimator.gyro_lpf_hz),
    float!("estimator.gyro_notch_hz", estimator.gyro_notch_hz),
    float!("estimator.gyro_notch_q", estimator.gyro_notch_q),
    float!("estimator.accel_lpf_hz", estimator.accel_lpf_hz),
    float!("estimator.accel_reject_g", estimator.accel_reject_g),
    float!("safety.arm_throttle_max", safety.arm_throttle_max),
    float!("safety.max_tilt_deg", safety.max_tilt_deg),
    int!("failsafe.signal_timeout_ms", u32, failsafe.signal_timeout_ms),
    int!("failsafe.timeout_ms", u32, failsafe.timeout_ms),
    float!("failsafe.throttle", failsafe.throttle),
    int!("channels.roll", u8, channels.roll),
    int!("channels.pitch", u8, channels.pitch),
    int!("channels.throttle", u8, channels.throttle),
    int!("channels.yaw", u8, channels.yaw),
    int!("channels.arm", u8, channels.arm),
    int!("channels.mode", u8, channels.mode),
];

pub fn find(name: &str) -> Option<&'static ParamDef> {
    PARAMS.iter().find(|p| p.name == name)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command<'a> {
    Get(&'a str),
    Set(&'a str, &'a str),
    List,
    Apply,
    Status,
}

pub fn parse(line: &str) -> Result<Command<'_>, ParamError> {
    let mut words = line.split_whitespace();
    let verb = words.next().ok_or(ParamError::Empty)?;
    let cmd = match verb {
        "get" => Command::Get(words.next().ok_or(ParamError::MissingArgument)?),
        "set" => {
            let name = words.next().ok_or(ParamError::MissingArgument)?;
            let value = words.next().ok_or(ParamError::MissingArgument)?;
            Command::Set(name, value)
        }
        "list" => Command::List,
        "apply" => Command::Apply,
        "status" => Command::Status,
        _ => return Err(ParamError::UnknownCommand),
    };
    Ok(cmd)
}

fn parse_value(kind: ParamKind, text: &str) -> Result<f32, ParamError> {
    match kind {
        ParamKind::Float => match text.parse::<f32>() {
            Ok(v) if v.is_finite() => Ok(v),
            _ => Err(ParamError::InvalidNumber),
        },
        ParamKind::Int => match text.parse::<u32>() {
            Ok(v) => Ok(v as f32),
            Err(_) if text.parse::<f32>().is_ok() => Err(ParamError::NotAnInteger),
            Err(_) => Err(ParamError::InvalidNumber),
        },
    }
}

fn write_value<W: Write>(out: &mut W, def: &ParamDef, value: Option<f32>) -> core::fmt::Result {
    match (value, def.kind) {
        (None, _) => write!(out, "{} = n/a", def.name),
        (Some(v), ParamKind::Int) => write!(out, "{} = {}", def.name, v as u32),
        (Some(v), ParamKind::Float) => write!(out, "{} = {}", def.name, v),
    }
}

/// Result of one handled line.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    Done,
    /// Validated configuration to submit to the store.
    Apply(FlightConfig),
}

/// Per-connection state: the staged copy being edited.
pub struct ParamSession {
    staged: FlightConfig,
}

impl ParamSession {
    pub fn new(active: &FlightConfig) -> Self {
        Self { staged: *active }
    }

    pub fn staged(&self) -> &FlightConfig {
        &self.staged
    }

    /// Forget local edits and start again from `active`.
    pub fn sync(&mut self, active: &FlightConfig) {
        self.staged = *active;
    }

    /// Handle one input line. Output lines are written to `out`, each ending
    /// in `\r\n`. Errors are returned for the caller to report.
    pub fn handle<W: Write>(
        &mut self,
        line: &str,
        active: &FlightConfig,
        status: Option<&TelemetrySnapshot>,
        out: &mut W,
    ) -> Result<Reply, ParamError> {
        match parse(line)? {
            Command::Get(name) => {
                let def = find(name).ok_or(ParamError::UnknownParameter)?;
                let _ = write_value(out, def, (def.get)(&self.staged));
                let _ = out.write_str("\r\n");
            }
            Command::Set(name, text) => {
                let def = find(name).ok_or(ParamError::UnknownParameter)?;
                let value = parse_value(def.kind, text)?;
                (def.set)(&mut self.staged, value)?;
                let _ = write_value(out, def, (def.get)(&self.staged));
                let _ = out.write_str(" (staged)\r\n");
            }
            Command::List => {
                for def in PARAMS {
                    let value = (def.get)(&self.staged);
                    let _ = write_value(out, def, value);
                    if value != (def.get)(active) {
                        let _ = out.write_str(" *");
                    }
                    let _ = out.write_str("\r\n");
                }
            }
            Command::Apply => {
                self.staged.validate()?;
                let _ = out.write_str("ok\r\n");
                return Ok(Reply::Apply(self.staged));
            }
            Command::Status => {
                match status {
                    Some(s) => {
                        let _ = out.write_str(&s.status_line());
                    }
                    None => {
                        let _ = out.write_str("no telemetry yet");
                    }
                }
                let _ = out.write_str("\r\n");
            }
        }
        Ok(Reply::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;

    type Out = heapless::String<8192>;

    fn session() -> (FlightConfig, ParamSession, Out) {
        let active = FlightConfig::default();
        let s = ParamSession::new(&active);
        (active, s, Out::new())
    }

    #[test]
    fn parses_commands() {
        assert_eq!(parse("  get rate.roll.kp "), Ok(Command::Get("rate.roll.kp")));
        assert_eq!(parse("set a 1"), Ok(Command::Set("a", "1")));
        assert_eq!(parse("set a"), Err(ParamError::MissingArgument));
        assert_eq!(parse(""), Err(ParamError::Empty));
        assert_eq!(parse("reboot"), Err(ParamError::UnknownCommand));
    }

    #[test]
    fn every_name_is_unique_and_readable() {
        let cfg = FlightConfig::default();
        for (i, p) in PARAMS.iter().enumerate() {
            assert!(PARAMS[i + 1..].iter().all(|q| q.name != p.name), "{}", p.name);
            if p.name != "output.pwm_min_us" && p.name != "output.pwm_max_us" && !p.name.starts_with("estimator.mahony") {
                assert!((p.get)(&cfg).is_some(), "{}", p.name);
            }
        }
    }

    #[test]
    fn set_then_apply() {
        let (active, mut s, mut out) = session();
        assert_eq!(s.handle("set rate.roll.kp 0.005", &active, None, &mut out), Ok(Reply::Done));
        assert_eq!(out.as_str(), "rate.roll.kp = 0.005 (staged)\r\n");
        match s.handle("apply", &active, None, &mut out) {
            Ok(Reply::Apply(cfg)) => assert_eq!(cfg.control.rate[0].kp, 0.005),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn apply_rejects_invalid_staged_copy() {
        let (active, mut s, mut out) = session();
        s.handle("set failsafe.signal_timeout_ms 10", &active, None, &mut out).unwrap();
        assert_eq!(
            s.handle("apply", &active, None, &mut out),
            Err(ParamError::Rejected(ConfigError::OutOfBounds("failsafe.signal_timeout_ms")))
        );
    }

    #[test]
    fn value_errors() {
        let (active, mut s, mut out) = session();
        assert_eq!(s.handle("set nope 1", &active, None, &mut out), Err(ParamError::UnknownParameter));
        assert_eq!(s.handle("set rate.roll.kp abc", &active, None, &mut out), Err(ParamError::InvalidNumber));
        assert_eq!(s.handle("set failsafe.timeout_ms 1.5", &active, None, &mut out), Err(ParamError::NotAnInteger));
        assert_eq!(s.handle("set estimator.mahony_kp 1", &active, None, &mut out), Err(ParamError::Inactive));
        assert_eq!(s.handle("set mixer.frame 9", &active, None, &mut out), Err(ParamError::InvalidChoice));
    }

    #[test]
    fn angle_loop_gains_are_settable() {
        let (active, mut s, mut out) = session();
        s.handle("set angle.roll.ki 0.01", &active, None, &mut out).unwrap();
        s.handle("set angle.yaw.i_limit 5", &active, None, &mut out).unwrap();
        assert_eq!(s.staged().control.angle[0].ki, 0.01);
        assert_eq!(s.staged().control.angle[2].i_limit, 5.0);
        assert_eq!(
            s.handle("get angle.roll.output_limit", &active, None, &mut out),
            Err(ParamError::UnknownParameter)
        );
    }

    #[test]
    fn mahony_integral_limit_only_with_mahony() {
        let (active, mut s, mut out) = session();
        assert_eq!(
            s.handle("set estimator.mahony_i_limit_dps 5", &active, None, &mut out),
            Err(ParamError::Inactive)
        );
        s.handle("set estimator.fusion 1", &active, None, &mut out).unwrap();
        out.clear();
        s.handle("set estimator.mahony_i_limit_dps 5", &active, None, &mut out).unwrap();
        assert_eq!(out.as_str(), "estimator.mahony_i_limit_dps = 5 (staged)\r\n");
    }

    #[test]
    fn switching_fusion_filter() {
        let (active, mut s, mut out) = session();
        s.handle("set estimator.fusion 1", &active, None, &mut out).unwrap();
        s.handle("set estimator.mahony_ki 0.1", &active, None, &mut out).unwrap();
        assert_eq!(
            s.staged().estimator.fusion,
            FusionFilter::Mahony {
                kp: 2.0,
                ki: 0.1,
                i_limit_dps: 10.0
            }
        );
        out.clear();
        s.handle("get estimator.blend", &active, None, &mut out).unwrap();
        assert_eq!(out.as_str(), "estimator.blend = n/a\r\n");
    }

    #[test]
    fn list_marks_edited_values() {
        let (active, mut s, _) = session();
        s.handle("set mixer.frame 2", &active, None, &mut Out::new()).unwrap();
        let mut out = Out::new();
        s.handle("list", &active, None, &mut out).unwrap();
        assert!(out.contains("mixer.frame = 2 *\r\n"));
        assert!(out.contains("loop_hz = 1000\r\n"));
    }
}
