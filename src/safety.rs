//! Arming, disarming and failsafe.
//!
//! [`SafetySupervisor`] is the only place the [`SafetyState`] changes. It is
//! consulted twice per cycle: [`SafetySupervisor::check`] before control runs
//! and [`SafetySupervisor::gate`] on the final actuator commands.

use micromath::F32Ext;

use crate::config::FlightConfig;
use crate::state::{ActuatorCommands, AttitudeEstimate, CommandChannels, FailsafeCause, SafetyState};

/// What the supervisor sees at the start of a cycle.
#[derive(Clone, Copy, Debug)]
pub struct SafetyInputs<'a> {
    /// Valid pilot commands, `None` on signal loss.
    pub commands: Option<&'a CommandChannels>,
    pub sensor_failed: bool,
    pub estimator_tracking: bool,
    pub estimate: &'a AttitudeEstimate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DisarmReason {
    Switch,
    FailsafeTimeout,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Transition {
    Armed,
    Disarmed(DisarmReason),
    Failsafe(FailsafeCause),
}

/// Why an arm request was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ArmBlocker {
    SwitchNotCycled,
    ThrottleHigh,
    NotCalibrated,
    SensorFailed,
}

pub struct SafetySupervisor {
    state: SafetyState,
    cause: Option<FailsafeCause>,
    switch_seen_low: bool,
    failsafe_since_us: u64,
    last_blocker: Option<ArmBlocker>,
}

impl Default for SafetySupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl SafetySupervisor {
    pub const fn new() -> Self {
        Self {
            state: SafetyState::Disarmed,
            cause: None,
            switch_seen_low: false,
            failsafe_since_us: 0,
            last_blocker: None,
        }
    }

    pub fn state(&self) -> SafetyState {
        self.state
    }

    pub fn failsafe_cause(&self) -> Option<FailsafeCause> {
        self.cause
    }

    /// Failsafe with an attitude good enough to fly the level descent.
    pub fn descending(&self) -> bool {
        self.state == SafetyState::Failsafe && self.cause.is_some_and(FailsafeCause::allows_descent)
    }

    pub fn arm_blocker(&self) -> Option<ArmBlocker> {
        self.last_blocker
    }

    fn enter(&mut self, state: SafetyState) {
        self.state = state;
        if state != SafetyState::Failsafe {
            self.cause = None;
        }
    }

    fn disarm(&mut self, reason: DisarmReason) -> Option<Transition> {
        self.enter(SafetyState::Disarmed);
        // After a timeout the pilot must cycle the switch before re-arming.
        self.switch_seen_low = reason == DisarmReason::Switch;
        info!("disarmed: {}", reason);
        Some(Transition::Disarmed(reason))
    }

    fn failsafe(&mut self, now_us: u64, cause: FailsafeCause) -> Option<Transition> {
        self.enter(SafetyState::Failsafe);
        self.cause = Some(cause);
        self.failsafe_since_us = now_us;
        self.switch_seen_low = false;
        error!("FAILSAFE: {}", cause);
        Some(Transition::Failsafe(cause))
    }

    /// Replaces the cause of an active failsafe. The timeout keeps running
    /// from the original entry.
    fn escalate(&mut self, cause: FailsafeCause) -> Option<Transition> {
        self.cause = Some(cause);
        error!("FAILSAFE escalated: {}", cause);
        Some(Transition::Failsafe(cause))
    }

    fn arm_blocker_for(&self, cfg: &FlightConfig, cmd: &CommandChannels, inputs: &SafetyInputs) -> Option<ArmBlocker> {
        if !self.switch_seen_low {
            Some(ArmBlocker::SwitchNotCycled)
        } else if cmd.throttle > cfg.safety.arm_throttle_max {
            Some(ArmBlocker::ThrottleHigh)
        } else if !inputs.estimator_tracking {
            Some(ArmBlocker::NotCalibrated)
        } else if inputs.sensor_failed {
            Some(ArmBlocker::SensorFailed)
        } else {
            None
        }
    }

    /// Start-of-cycle evaluation. Returns the transition taken, if any.
    pub fn check(&mut self, cfg: &FlightConfig, now_us: u64, inputs: &SafetyInputs) -> Option<Transition> {
        match self.state {
            SafetyState::Disarmed => {
                let cmd = inputs.commands?;
                if !cmd.arm_switch {
                    self.switch_seen_low = true;
                    self.last_blocker = None;
                    return None;
                }
                match self.arm_blocker_for(cfg, cmd, inputs) {
                    None => {
                        self.last_blocker = None;
                        self.enter(SafetyState::Armed);
                        info!("armed");
                        Some(Transition::Armed)
                    }
                    Some(blocker) => {
                        if self.last_blocker != Some(blocker) {
                            warn!("arming refused: {}", blocker);
                        }
                        self.last_blocker = Some(blocker);
                        None
                    }
                }
            }
            SafetyState::Armed => {
                let Some(cmd) = inputs.commands else {
                    return self.failsafe(now_us, FailsafeCause::SignalLoss);
                };
                if !cmd.arm_switch {
                    return self.disarm(DisarmReason::Switch);
                }
                if inputs.sensor_failed {
                    return self.failsafe(now_us, FailsafeCause::SensorFault);
                }
                let e = inputs.estimate;
                let max_tilt = cfg.safety.max_tilt_deg;
                if e.roll.abs() > max_tilt || e.pitch.abs() > max_tilt {
                    return self.failsafe(now_us, FailsafeCause::AttitudeDivergence);
                }
                None
            }
            SafetyState::Failsafe => {
                if inputs.commands.is_some_and(|c| !c.arm_switch) {
                    return self.disarm(DisarmReason::Switch);
                }
                let elapsed_us = now_us.saturating_sub(self.failsafe_since_us);
                if elapsed_us >= cfg.failsafe.timeout_ms as u64 * 1000 {
                    return self.disarm(DisarmReason::FailsafeTimeout);
                }
                if self.descending() {
                    if inputs.sensor_failed {
                        return self.escalate(FailsafeCause::SensorFault);
                    }
                    let e = inputs.estimate;
                    let max_tilt = cfg.safety.max_tilt_deg;
                    if e.roll.abs() > max_tilt || e.pitch.abs() > max_tilt {
                        return self.escalate(FailsafeCause::AttitudeDivergence);
                    }
                }
                None
            }
        }
    }

    /// End-of-cycle output gate: whatever the controller produced, only
    /// state-appropriate values leave the core.
    pub fn gate(&self, cfg: &FlightConfig, commands: &ActuatorCommands, motors: usize) -> ActuatorCommands {
        let out = &cfg.output;
        let flying = self.state == SafetyState::Armed || self.descending();
        if !flying || commands.len() != motors {
            return ActuatorCommands::uniform(motors, out.disarmed);
        }
        let mut gated = *commands;
        for v in gated.as_mut_slice() {
            *v = if v.is_finite() {
                v.clamp(out.min, out.max)
            } else {
                out.min
            };
        }
        gated
    }
}
