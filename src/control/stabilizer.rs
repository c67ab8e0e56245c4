//! Cascaded attitude controller: angle PID (outer) feeding rate PID (inner).

use crate::config::ControlConfig;
use crate::state::{AttitudeEstimate, Axis, CommandChannels, FlightMode};

use super::pid::{Pid, PidGains};

/// Wrap an angle in degrees to (-180, 180].
pub fn wrap_180(deg: f32) -> f32 {
    let mut a = deg % 360.0;
    if a > 180.0 {
        a -= 360.0;
    } else if a <= -180.0 {
        a += 360.0;
    }
    a
}

/// How the sticks are to be interpreted this cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Guidance {
    /// Pilot sticks in the selected flight mode.
    Pilot,
    /// Hold level at the current heading, ignore sticks (failsafe descent).
    Level,
}

/// Normalized torque demand, each axis in [-1, 1].
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TorqueCommand {
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
}

impl TorqueCommand {
    fn set(&mut self, axis: Axis, value: f32) {
        match axis {
            Axis::Roll => self.roll = value,
            Axis::Pitch => self.pitch = value,
            Axis::Yaw => self.yaw = value,
        }
    }
}

pub struct Stabilizer {
    angle: [Pid; 3],
    rate: [Pid; 3],
    mode: Option<FlightMode>,
    heading: Option<f32>,
    /// Desired body rates of the last update, deg/s.
    rate_setpoint: [f32; 3],
}

/// Angle gains with the output bounded by the axis rate limit.
fn angle_gains(config: &ControlConfig, i: usize) -> PidGains {
    PidGains {
        output_limit: config.max_rate_dps[i],
        ..config.angle[i]
    }
}

impl Stabilizer {
    pub fn new(config: &ControlConfig, loop_hz: u32) -> Self {
        let hz = loop_hz as f32;
        Self {
            angle: [
                Pid::new(angle_gains(config, 0), config.d_lpf_hz, hz),
                Pid::new(angle_gains(config, 1), config.d_lpf_hz, hz),
                Pid::new(angle_gains(config, 2), config.d_lpf_hz, hz),
            ],
            rate: [
                Pid::new(config.rate[0], config.d_lpf_hz, hz),
                Pid::new(config.rate[1], config.d_lpf_hz, hz),
                Pid::new(config.rate[2], config.d_lpf_hz, hz),
            ],
            mode: None,
            heading: None,
            rate_setpoint: [0.0; 3],
        }
    }

    pub fn reconfigure(&mut self, config: &ControlConfig, loop_hz: u32) {
        let hz = loop_hz as f32;
        for (pid, gains) in self.rate.iter_mut().zip(config.rate.iter()) {
            pid.set_gains(*gains, config.d_lpf_hz, hz);
        }
        for (i, pid) in self.angle.iter_mut().enumerate() {
            pid.set_gains(angle_gains(config, i), config.d_lpf_hz, hz);
        }
    }

    /// Clear integrators, derivative history and the heading setpoint.
    pub fn reset(&mut self) {
        self.rate.iter_mut().for_each(Pid::reset);
        self.angle.iter_mut().for_each(Pid::reset);
        self.heading = None;
        self.rate_setpoint = [0.0; 3];
    }

    pub fn integrals(&self) -> [f32; 3] {
        [
            self.rate[0].integral(),
            self.rate[1].integral(),
            self.rate[2].integral(),
        ]
    }

    pub fn angle_integrals(&self) -> [f32; 3] {
        [
            self.angle[0].integral(),
            self.angle[1].integral(),
            self.angle[2].integral(),
        ]
    }

    pub fn heading(&self) -> Option<f32> {
        self.heading
    }

    pub fn rate_setpoint(&self) -> [f32; 3] {
        self.rate_setpoint
    }

    /// One control step. `stale` means the estimate has not been refreshed
    /// for too long: integrators freeze and the vehicle is held level.
    pub fn update(
        &mut self,
        config: &ControlConfig,
        estimate: &AttitudeEstimate,
        commands: &CommandChannels,
        guidance: Guidance,
        stale: bool,
        dt: f32,
    ) -> TorqueCommand {
        if self.mode.is_some_and(|m| m != commands.mode) {
            info!("flight mode -> {}", commands.mode.label());
            self.reset();
        }
        self.mode = Some(commands.mode);

        let level = stale || guidance == Guidance::Level;
        let on_ground = commands.throttle < config.integrator_throttle_min;
        let integrate = !stale && !on_ground;

        // The heading follows the vehicle while it cannot be steered.
        let heading = match self.heading {
            Some(h) if !on_ground && !level && commands.mode == FlightMode::Angle => h,
            _ => estimate.yaw,
        };

        let desired_rate = if level || commands.mode == FlightMode::Angle {
            let (roll_sp, pitch_sp, yaw_stick) = if level {
                (0.0, 0.0, 0.0)
            } else {
                (
                    commands.roll * config.max_angle_deg,
                    commands.pitch * config.max_angle_deg,
                    commands.yaw,
                )
            };
            let heading = if on_ground {
                heading
            } else {
                wrap_180(heading + yaw_stick * config.max_rate_dps[2] * dt)
            };
            self.heading = Some(heading);
            // Yaw differentiates the wrapped error, which stays continuous
            // across ±180°.
            let yaw_error = wrap_180(heading - estimate.yaw);
            [
                self.angle[0].update(roll_sp, estimate.roll, integrate),
                self.angle[1].update(pitch_sp, estimate.pitch, integrate),
                self.angle[2].update_error(yaw_error, -yaw_error, integrate),
            ]
        } else {
            self.heading = Some(estimate.yaw);
            [
                commands.roll * config.max_rate_dps[0],
                commands.pitch * config.max_rate_dps[1],
                commands.yaw * config.max_rate_dps[2],
            ]
        };
        self.rate_setpoint = desired_rate;

        let mut torque = TorqueCommand::default();
        for axis in Axis::ALL {
            let i = axis as usize;
            let out = self.rate[i].update(desired_rate[i], estimate.rate(axis), integrate);
            torque.set(axis, out);
        }
        torque
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlightConfig;
    use approx::assert_relative_eq;

    fn setup() -> (ControlConfig, Stabilizer) {
        let cfg = FlightConfig::default().control;
        let stab = Stabilizer::new(&cfg, 1000);
        (cfg, stab)
    }

    fn sticks(throttle: f32, roll: f32, mode: FlightMode) -> CommandChannels {
        CommandChannels {
            throttle,
            roll,
            mode,
            arm_switch: true,
            ..Default::default()
        }
    }

    #[test]
    fn wraps_heading() {
        assert_relative_eq!(wrap_180(190.0), -170.0);
        assert_relative_eq!(wrap_180(-190.0), 170.0);
        assert_relative_eq!(wrap_180(180.0), 180.0);
        assert_relative_eq!(wrap_180(540.0), 180.0);
    }

    #[test]
    fn angle_mode_commands_limited_rate() {
        let (cfg, mut stab) = setup();
        let est = AttitudeEstimate::default();
        let t = stab.update(&cfg, &est, &sticks(0.5, 1.0, FlightMode::Angle), Guidance::Pilot, false, 0.001);
        let sp = stab.rate_setpoint();
        let g = cfg.angle[0];
        let expected = ((g.kp + g.ki) * cfg.max_angle_deg).min(cfg.max_rate_dps[0]);
        assert_relative_eq!(sp[0], expected);
        assert!(t.roll > 0.0);
        assert_relative_eq!(sp[1], 0.0);
    }

    #[test]
    fn rate_mode_bypasses_angle_loop() {
        let (cfg, mut stab) = setup();
        let est = AttitudeEstimate {
            roll: 30.0,
            ..Default::default()
        };
        stab.update(&cfg, &est, &sticks(0.5, 0.5, FlightMode::Rate), Guidance::Pilot, false, 0.001);
        assert_relative_eq!(stab.rate_setpoint()[0], 0.5 * cfg.max_rate_dps[0]);
    }

    #[test]
    fn mode_change_resets_integrators() {
        let (cfg, mut stab) = setup();
        let est = AttitudeEstimate::default();
        for _ in 0..200 {
            stab.update(&cfg, &est, &sticks(0.5, 0.5, FlightMode::Rate), Guidance::Pilot, false, 0.001);
        }
        assert!(stab.integrals()[0] > 0.0);
        stab.update(&cfg, &est, &sticks(0.5, 0.0, FlightMode::Angle), Guidance::Pilot, false, 0.001);
        assert_eq!(stab.integrals()[0], 0.0);
    }

    #[test]
    fn low_throttle_holds_integrators() {
        let (cfg, mut stab) = setup();
        let est = AttitudeEstimate::default();
        for _ in 0..200 {
            stab.update(&cfg, &est, &sticks(0.0, 0.5, FlightMode::Rate), Guidance::Pilot, false, 0.001);
        }
        assert_eq!(stab.integrals(), [0.0; 3]);
    }

    #[test]
    fn stale_estimate_levels_and_freezes() {
        let (cfg, mut stab) = setup();
        let est = AttitudeEstimate {
            roll: 10.0,
            yaw: 42.0,
            ..Default::default()
        };
        let t = stab.update(&cfg, &est, &sticks(0.5, 1.0, FlightMode::Angle), Guidance::Pilot, true, 0.001);
        let sp = stab.rate_setpoint();
        // Stick is ignored; the controller rolls back toward level.
        assert!(sp[0] < 0.0);
        assert!(t.roll < 0.0);
        assert_relative_eq!(sp[2], 0.0);
        assert_eq!(stab.integrals(), [0.0; 3]);
        assert_eq!(stab.angle_integrals(), [0.0; 3]);
        assert_eq!(stab.heading(), Some(42.0));
    }

    #[test]
    fn angle_integrator_clamps_and_resets() {
        let (cfg, mut stab) = setup();
        let est = AttitudeEstimate {
            roll: -10.0,
            ..Default::default()
        };
        let cmd = sticks(0.5, 0.0, FlightMode::Angle);
        let limit = cfg.angle[0].i_limit;
        let cycles = (limit / (cfg.angle[0].ki * 10.0)) as usize + 100;
        for _ in 0..cycles {
            stab.update(&cfg, &est, &cmd, Guidance::Pilot, false, 0.001);
        }
        assert_relative_eq!(stab.angle_integrals()[0], limit);
        assert_relative_eq!(stab.rate_setpoint()[0], cfg.angle[0].kp * 10.0 + limit);

        stab.reset();
        assert_eq!(stab.angle_integrals(), [0.0; 3]);
    }

    #[test]
    fn angle_integrator_holds_at_low_throttle() {
        let (cfg, mut stab) = setup();
        let est = AttitudeEstimate {
            pitch: 5.0,
            ..Default::default()
        };
        for _ in 0..500 {
            stab.update(&cfg, &est, &sticks(0.0, 0.0, FlightMode::Angle), Guidance::Pilot, false, 0.001);
        }
        assert_eq!(stab.angle_integrals(), [0.0; 3]);
    }

    #[test]
    fn angle_output_limited_to_max_rate() {
        let (mut cfg, mut stab) = setup();
        cfg.angle[0].kp = 50.0;
        stab.reconfigure(&cfg, 1000);
        let est = AttitudeEstimate {
            roll: -30.0,
            ..Default::default()
        };
        stab.update(&cfg, &est, &sticks(0.5, 1.0, FlightMode::Angle), Guidance::Pilot, false, 0.001);
        assert_relative_eq!(stab.rate_setpoint()[0], cfg.max_rate_dps[0]);
    }

    #[test]
    fn yaw_error_wraps_across_180() {
        let (cfg, mut stab) = setup();
        let mut est = AttitudeEstimate {
            yaw: 179.0,
            ..Default::default()
        };
        let cmd = sticks(0.5, 0.0, FlightMode::Angle);
        stab.update(&cfg, &est, &cmd, Guidance::Pilot, false, 0.001);
        // Heading captured at 179; the vehicle drifts past ±180.
        est.yaw = -179.0;
        stab.update(&cfg, &est, &cmd, Guidance::Pilot, false, 0.001);
        assert_relative_eq!(stab.rate_setpoint()[2], -2.0 * cfg.angle[2].kp, epsilon = 1e-3);
    }

    #[test]
    fn yaw_stick_advances_heading() {
        let (cfg, mut stab) = setup();
        let est = AttitudeEstimate::default();
        let mut cmd = sticks(0.5, 0.0, FlightMode::Angle);
        cmd.yaw = 1.0;
        for _ in 0..100 {
            stab.update(&cfg, &est, &cmd, Guidance::Pilot, false, 0.001);
        }
        let expected = 100.0 * cfg.max_rate_dps[2] * 0.001;
        assert_relative_eq!(stab.heading().unwrap_or_default(), expected, epsilon = 1e-2);
        assert!(stab.rate_setpoint()[2] > 0.0);
    }
}
