use crate::estimation::filter::Pt1Filter;

/// Gains of one discrete PID, evaluated once per control cycle. `ki` and `kd`
/// are per-cycle gains, so retuning is needed when the loop rate changes.
///
/// The integral and limits are in output units: normalized torque for the
/// rate loop, deg/s for the angle loop.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PidGains {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
    /// Integral term is clamped to ±`i_limit`.
    pub i_limit: f32,
    /// Output is clamped to ±`output_limit`.
    pub output_limit: f32,
}

impl PidGains {
    pub const fn new(kp: f32, ki: f32, kd: f32, i_limit: f32, output_limit: f32) -> Self {
        Self {
            kp,
            ki,
            kd,
            i_limit,
            output_limit,
        }
    }
}

/// PID with clamped integrator and derivative on measurement.
#[derive(Clone, Copy, Debug)]
pub struct Pid {
    gains: PidGains,
    integral: f32,
    prev_measurement: Option<f32>,
    d_filter: Option<Pt1Filter>,
}

impl Pid {
    /// `d_cutoff_hz <= 0` leaves the derivative unfiltered.
    pub fn new(gains: PidGains, d_cutoff_hz: f32, loop_hz: f32) -> Self {
        Self {
            gains,
            integral: 0.0,
            prev_measurement: None,
            d_filter: Self::d_filter(d_cutoff_hz, loop_hz),
        }
    }

    fn d_filter(cutoff_hz: f32, loop_hz: f32) -> Option<Pt1Filter> {
        (cutoff_hz > 0.0).then(|| Pt1Filter::new(cutoff_hz, loop_hz))
    }

    /// New gains take effect on the next update; the integral is kept but
    /// re-clamped to the new limit.
    pub fn set_gains(&mut self, gains: PidGains, d_cutoff_hz: f32, loop_hz: f32) {
        self.gains = gains;
        self.integral = self.integral.clamp(-gains.i_limit, gains.i_limit);
        self.d_filter = Self::d_filter(d_cutoff_hz, loop_hz);
    }

    pub fn gains(&self) -> &PidGains {
        &self.gains
    }

    pub fn integral(&self) -> f32 {
        self.integral
    }

    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.prev_measurement = None;
        if let Some(f) = self.d_filter.as_mut() {
            f.reset();
        }
    }

    /// One step. With `integrate == false` the integral is held at its
    /// current value.
    pub fn update(&mut self, setpoint: f32, measurement: f32, integrate: bool) -> f32 {
        self.update_error(setpoint - measurement, measurement, integrate)
    }

    /// Same as [`Pid::update`] with the error computed by the caller, for
    /// errors that need wrapping. The derivative acts on `measurement`.
    pub fn update_error(&mut self, error: f32, measurement: f32, integrate: bool) -> f32 {
        let g = self.gains;

        let p = g.kp * error;

        if integrate {
            self.integral = (self.integral + g.ki * error).clamp(-g.i_limit, g.i_limit);
        }

        let d_raw = match self.prev_measurement {
            Some(prev) => g.kd * (prev - measurement),
            None => 0.0,
        };
        self.prev_measurement = Some(measurement);
        let d = match self.d_filter.as_mut() {
            Some(f) => f.filter(d_raw),
            None => d_raw,
        };

        let out = p + self.integral + d;
        if !out.is_finite() {
            self.reset();
            return 0.0;
        }
        out.clamp(-g.output_limit, g.output_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn integral_clamps_at_limit() {
        // Ki = 0.5, constant error 1.0, 100 cycles at 1 kHz, bound 10.
        let mut pid = Pid::new(PidGains::new(0.0, 0.5, 0.0, 10.0, 100.0), 0.0, 1000.0);
        for n in 1..=100 {
            pid.update(1.0, 0.0, true);
            let expected = (0.5 * n as f32).min(10.0);
            assert_relative_eq!(pid.integral(), expected, epsilon = 1e-5);
        }
        assert_relative_eq!(pid.integral(), 10.0);
        assert_relative_eq!(pid.update(1.0, 0.0, true), 10.0);
    }

    #[test]
    fn held_integrator_does_not_accumulate() {
        let mut pid = Pid::new(PidGains::new(0.0, 0.1, 0.0, 1.0, 1.0), 0.0, 1000.0);
        pid.update(1.0, 0.0, true);
        for _ in 0..50 {
            pid.update(1.0, 0.0, false);
        }
        assert_relative_eq!(pid.integral(), 0.1);
    }

    #[test]
    fn derivative_acts_on_measurement_only() {
        let mut pid = Pid::new(PidGains::new(0.0, 0.0, 2.0, 1.0, 10.0), 0.0, 1000.0);
        assert_eq!(pid.update(0.0, 0.0, true), 0.0);
        // Setpoint step: no derivative kick.
        assert_eq!(pid.update(5.0, 0.0, true), 0.0);
        // Measurement rises by 0.5: D opposes the motion.
        assert_relative_eq!(pid.update(5.0, 0.5, true), -1.0);
    }

    #[test]
    fn output_is_clamped() {
        let mut pid = Pid::new(PidGains::new(1.0, 0.0, 0.0, 0.0, 0.4), 0.0, 1000.0);
        assert_relative_eq!(pid.update(10.0, 0.0, true), 0.4);
        assert_relative_eq!(pid.update(-10.0, 0.0, true), -0.4);
    }

    #[test]
    fn reset_clears_state() {
        let mut pid = Pid::new(PidGains::new(0.0, 0.2, 1.0, 1.0, 1.0), 50.0, 1000.0);
        for _ in 0..10 {
            pid.update(1.0, 0.0, true);
        }
        pid.reset();
        assert_eq!(pid.integral(), 0.0);
        // No derivative kick from the measurement seen before the reset.
        assert_eq!(pid.update(0.0, 3.0, false), 0.0);
    }
}
