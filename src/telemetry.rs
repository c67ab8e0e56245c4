//! Per-cycle report and what gets sent to the ground from it.

use core::fmt::Write;

use crate::estimation::EstimatorPhase;
use crate::flight::FlightEvent;
use crate::io::SensorStatus;
use crate::protocol::crsf;
use crate::state::{ActuatorCommands, AttitudeEstimate, CommandChannels, FailsafeCause, FlightMode, SafetyState};

pub const MAX_EVENTS: usize = 8;
pub type Events = heapless::Vec<FlightEvent, MAX_EVENTS>;

/// Everything one control cycle did.
#[derive(Clone, Debug)]
pub struct CycleReport {
    pub cycle: u32,
    pub now_us: u64,
    pub state: SafetyState,
    pub failsafe_cause: Option<FailsafeCause>,
    pub phase: EstimatorPhase,
    pub estimate: AttitudeEstimate,
    /// Cycles since the estimate last saw a fresh sample.
    pub estimate_age: u32,
    pub sensor: SensorStatus,
    /// Valid pilot commands this cycle, `None` on signal loss.
    pub commands: Option<CommandChannels>,
    pub mode: FlightMode,
    pub outputs: ActuatorCommands,
    pub events: Events,
}

impl CycleReport {
    pub fn has_event(&self, event: &FlightEvent) -> bool {
        self.events.contains(event)
    }
}

/// Copyable subset of a [`CycleReport`] for the slow telemetry path.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TelemetrySnapshot {
    pub cycle: u32,
    pub state: SafetyState,
    pub failsafe_cause: Option<FailsafeCause>,
    pub phase: EstimatorPhase,
    pub estimate: AttitudeEstimate,
    pub mode: FlightMode,
    pub throttle: f32,
    pub outputs: ActuatorCommands,
    pub signal_ok: bool,
    pub sensor_ok: bool,
    /// Overruns seen since boot.
    pub overruns: u32,
    /// Most recent event and its cycle, kept until a newer one replaces it.
    pub last_event: Option<(u32, FlightEvent)>,
}

impl TelemetrySnapshot {
    pub fn from_report(report: &CycleReport, overruns: u32, last_event: Option<(u32, FlightEvent)>) -> Self {
        Self {
            cycle: report.cycle,
            state: report.state,
            failsafe_cause: report.failsafe_cause,
            phase: report.phase,
            estimate: report.estimate,
            mode: report.mode,
            throttle: report.commands.map_or(0.0, |c| c.throttle),
            outputs: report.outputs,
            signal_ok: report.commands.is_some(),
            sensor_ok: !matches!(report.sensor, SensorStatus::Failed(_)),
            overruns,
            last_event,
        }
    }

    /// Short mode text shown on the radio: `*` marks disarmed.
    pub fn mode_label(&self) -> heapless::String<8> {
        let mut s = heapless::String::new();
        match self.state {
            SafetyState::Failsafe => {
                let _ = s.push_str("!FS!");
            }
            SafetyState::Armed => {
                let _ = s.push_str(self.mode.label());
            }
            SafetyState::Disarmed => {
                let base = if self.phase == EstimatorPhase::Tracking {
                    self.mode.label()
                } else {
                    "CAL"
                };
                let _ = s.push_str(base);
                let _ = s.push('*');
            }
        }
        s
    }

    /// CRSF attitude then flight-mode frame; returns the bytes written.
    pub fn write_crsf(&self, buf: &mut [u8]) -> usize {
        let e = &self.estimate;
        let n = crsf::write_attitude(
            buf,
            e.roll.to_radians(),
            e.pitch.to_radians(),
            e.yaw.to_radians(),
        );
        n + crsf::write_flight_mode(&mut buf[n..], &self.mode_label())
    }

    /// One human-readable line for the USB console.
    pub fn status_line(&self) -> heapless::String<192> {
        let mut s = heapless::String::new();
        let state = match self.state {
            SafetyState::Disarmed => "DISARMED",
            SafetyState::Armed => "ARMED",
            SafetyState::Failsafe => "FAILSAFE",
        };
        let e = &self.estimate;
        let _ = write!(
            s,
            "#{} {} {} r={:.1} p={:.1} y={:.1} thr={:.2} m=",
            self.cycle,
            state,
            self.mode_label(),
            e.roll,
            e.pitch,
            e.yaw,
            self.throttle
        );
        for (i, v) in self.outputs.as_slice().iter().enumerate() {
            let sep = if i == 0 { "" } else { "," };
            let _ = write!(s, "{}{:.2}", sep, v);
        }
        let _ = write!(
            s,
            " rx={} imu={}",
            if self.signal_ok { "ok" } else { "LOST" },
            if self.sensor_ok { "ok" } else { "FAIL" }
        );
        if let Some(cause) = self.failsafe_cause {
            let _ = write!(s, " fs={:?}", cause);
        }
        if e.degraded {
            let _ = s.push_str(" degraded");
        }
        if self.overruns > 0 {
            let _ = write!(s, " overruns={}", self.overruns);
        }
        if let Some((cycle, event)) = self.last_event {
            let _ = write!(s, " ev={}@{}", event.label(), cycle);
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(state: SafetyState) -> TelemetrySnapshot {
        TelemetrySnapshot {
            cycle: 7,
            state,
            failsafe_cause: None,
            phase: EstimatorPhase::Tracking,
            estimate: AttitudeEstimate {
                roll: 1.3,
                pitch: -2.0,
                yaw: 90.0,
                ..Default::default()
            },
            mode: FlightMode::Angle,
            throttle: 0.4,
            outputs: ActuatorCommands::from_slice(&[0.4, 0.41, 0.39, 0.4], false),
            signal_ok: true,
            sensor_ok: true,
            overruns: 0,
            last_event: None,
        }
    }

    #[test]
    fn mode_labels() {
        assert_eq!(snapshot(SafetyState::Armed).mode_label().as_str(), "ANGL");
        assert_eq!(snapshot(SafetyState::Disarmed).mode_label().as_str(), "ANGL*");
        assert_eq!(snapshot(SafetyState::Failsafe).mode_label().as_str(), "!FS!");
        let mut s = snapshot(SafetyState::Disarmed);
        s.phase = EstimatorPhase::Calibrating;
        assert_eq!(s.mode_label().as_str(), "CAL*");
    }

    #[test]
    fn crsf_frames_back_to_back() {
        let mut buf = [0u8; 64];
        let n = snapshot(SafetyState::Armed).write_crsf(&mut buf);
        assert_eq!(n, 10 + 9);
        assert_eq!(buf[0], crsf::CRSF_SYNC);
        assert_eq!(buf[2], crsf::FRAMETYPE_ATTITUDE);
        assert_eq!(buf[10], crsf::CRSF_SYNC);
        assert_eq!(buf[12], crsf::FRAMETYPE_FLIGHT_MODE);
    }

    #[test]
    fn status_line_contents() {
        let mut s = snapshot(SafetyState::Failsafe);
        s.signal_ok = false;
        s.failsafe_cause = Some(FailsafeCause::SignalLoss);
        let line = s.status_line();
        assert!(line.starts_with("#7 FAILSAFE !FS! r=1.3 p=-2.0 y=90.0 thr=0.40 m=0.40,0.41,0.39,0.40"));
        assert!(line.contains("rx=LOST"));
        assert!(line.contains("fs=SignalLoss"));
        assert!(!line.contains("ev="));
    }

    #[test]
    fn status_line_shows_last_event() {
        let mut s = snapshot(SafetyState::Armed);
        s.last_event = Some((1234, FlightEvent::ActuatorSaturation));
        assert!(s.status_line().ends_with(" ev=saturation@1234"));
    }
}
