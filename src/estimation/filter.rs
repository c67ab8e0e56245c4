//! Discrete filters used on the sensor path and the D term.

use core::f32::consts::TAU;

use micromath::F32Ext;

/// First-order low pass, `y += k·(x − y)` with `k` from the RC time constant.
/// The first input primes the state.
#[derive(Clone, Copy, Debug)]
pub struct Pt1Filter {
    k: f32,
    y: Option<f32>,
}

impl Pt1Filter {
    pub fn new(cutoff_hz: f32, sample_hz: f32) -> Self {
        let dt = sample_hz.recip();
        let rc = (TAU * cutoff_hz).recip();
        Self {
            k: (dt / (rc + dt)).clamp(0.0, 1.0),
            y: None,
        }
    }

    pub fn filter(&mut self, x: f32) -> f32 {
        let y = match self.y {
            Some(y) => y + self.k * (x - y),
            None => x,
        };
        self.y = Some(y);
        y
    }

    pub fn reset(&mut self) {
        self.y = None;
    }
}

/// Normalized second-order section, `a0 = 1`.
#[derive(Clone, Copy, Debug, PartialEq)]
struct Coeffs {
    b: [f32; 3],
    a: [f32; 2],
}

impl Coeffs {
    const IDENTITY: Coeffs = Coeffs {
        b: [1.0, 0.0, 0.0],
        a: [0.0, 0.0],
    };

    /// Audio-EQ-cookbook prototype: returns `(cos ω, α)`.
    fn prototype(freq_hz: f32, sample_hz: f32, q: f32) -> (f32, f32) {
        let w = TAU * freq_hz / sample_hz;
        (w.cos(), w.sin() / (2.0 * q))
    }

    fn from_raw(b: [f32; 3], a0: f32, a: [f32; 2]) -> Self {
        Self {
            b: b.map(|v| v / a0),
            a: a.map(|v| v / a0),
        }
    }

    fn lowpass(cutoff_hz: f32, sample_hz: f32, q: f32) -> Self {
        let (cos_w, alpha) = Self::prototype(cutoff_hz, sample_hz, q);
        let half = (1.0 - cos_w) / 2.0;
        Self::from_raw([half, 1.0 - cos_w, half], 1.0 + alpha, [-2.0 * cos_w, 1.0 - alpha])
    }

    fn notch(center_hz: f32, sample_hz: f32, q: f32) -> Self {
        let (cos_w, alpha) = Self::prototype(center_hz, sample_hz, q);
        Self::from_raw([1.0, -2.0 * cos_w, 1.0], 1.0 + alpha, [-2.0 * cos_w, 1.0 - alpha])
    }
}

/// Biquad in transposed direct form II.
///
/// A cut-off or centre frequency of 0 gives a pass-through stage. The state
/// is primed from the first input as if it had been applied forever, so a
/// constant input (gyro bias, gravity) comes out without a transient.
#[derive(Clone, Copy, Debug)]
pub struct BiquadFilter {
    c: Coeffs,
    s: [f32; 2],
    primed: bool,
}

impl BiquadFilter {
    fn with(c: Coeffs) -> Self {
        Self {
            c,
            s: [0.0; 2],
            primed: false,
        }
    }

    pub const fn passthrough() -> Self {
        Self {
            c: Coeffs::IDENTITY,
            s: [0.0; 2],
            primed: false,
        }
    }

    pub fn new_lpf(cutoff_hz: f32, sample_hz: f32, q: f32) -> Self {
        if cutoff_hz <= 0.0 {
            return Self::passthrough();
        }
        Self::with(Coeffs::lowpass(cutoff_hz, sample_hz, q))
    }

    /// Band-stop around `center_hz`; higher `q` gives a narrower notch.
    pub fn new_notch(center_hz: f32, sample_hz: f32, q: f32) -> Self {
        if center_hz <= 0.0 {
            return Self::passthrough();
        }
        Self::with(Coeffs::notch(center_hz, sample_hz, q))
    }

    pub fn filter(&mut self, x: f32) -> f32 {
        let Coeffs { b, a } = self.c;
        if !self.primed {
            // Steady state of a unity-DC-gain section fed x for ever.
            self.s = [x * (1.0 - b[0]), x * (b[2] - a[1])];
            self.primed = true;
        }
        let y = b[0] * x + self.s[0];
        self.s[0] = b[1] * x - a[0] * y + self.s[1];
        self.s[1] = b[2] * x - a[1] * y;
        y
    }

    pub fn reset(&mut self) {
        self.s = [0.0; 2];
        self.primed = false;
    }
}

/// One biquad per axis.
#[derive(Clone, Copy, Debug)]
pub struct Biquad3([BiquadFilter; 3]);

impl Biquad3 {
    pub fn new(filter: BiquadFilter) -> Self {
        Self([filter; 3])
    }

    pub fn apply(&mut self, input: [f32; 3]) -> [f32; 3] {
        let [x, y, z] = &mut self.0;
        [x.filter(input[0]), y.filter(input[1]), z.filter(input[2])]
    }

    pub fn reset(&mut self) {
        self.0.iter_mut().for_each(BiquadFilter::reset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn lpf_passes_dc_without_transient() {
        let mut lpf = BiquadFilter::new_lpf(70.0, 1000.0, 0.707);
        for _ in 0..50 {
            assert_relative_eq!(lpf.filter(3.0), 3.0, epsilon = 1e-4);
        }
    }

    #[test]
    fn lpf_attenuates_high_frequency() {
        let mut lpf = BiquadFilter::new_lpf(20.0, 1000.0, 0.707);
        let mut peak: f32 = 0.0;
        for i in 0..2000 {
            // 250 Hz square-ish alternation around zero
            let x = if (i / 2) % 2 == 0 { 1.0 } else { -1.0 };
            let y = lpf.filter(x);
            if i > 1000 {
                peak = peak.max(y.abs());
            }
        }
        assert!(peak < 0.05, "peak {}", peak);
    }

    #[test]
    fn notch_removes_center_frequency() {
        let fs = 1000.0;
        let f0 = 80.0;
        let mut notch = BiquadFilter::new_notch(f0, fs, 5.0);
        let mut peak: f32 = 0.0;
        for i in 0..4000 {
            let t = i as f32 / fs;
            let y = notch.filter((2.0 * core::f32::consts::PI * f0 * t).sin());
            if i > 3000 {
                peak = peak.max(y.abs());
            }
        }
        assert!(peak < 0.05, "peak {}", peak);
    }

    #[test]
    fn disabled_stage_is_identity() {
        let mut f = BiquadFilter::new_lpf(0.0, 1000.0, 0.707);
        assert_eq!(f.filter(1.25), 1.25);
        assert_eq!(f.filter(-7.0), -7.0);
    }

    #[test]
    fn pt1_converges_to_step() {
        let mut pt1 = Pt1Filter::new(30.0, 1000.0);
        pt1.filter(0.0);
        let mut y = 0.0;
        for _ in 0..200 {
            y = pt1.filter(1.0);
        }
        assert_relative_eq!(y, 1.0, epsilon = 1e-3);
    }
}
