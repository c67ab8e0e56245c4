//! Quaternion attitude with Mahony's explicit complementary filter.

use core::f32::consts::FRAC_PI_2;

use micromath::F32Ext;

type Vec3 = [f32; 3];

fn cross(a: Vec3, b: Vec3) -> Vec3 {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

/// Unit quaternion, body to earth.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Quaternion {
    pub w: f32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Default for Quaternion {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Quaternion {
    pub const IDENTITY: Quaternion = Quaternion {
        w: 1.0,
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    fn norm_sq(&self) -> f32 {
        self.w * self.w + self.x * self.x + self.y * self.y + self.z * self.z
    }

    /// `None` when the quaternion has collapsed or blown up.
    fn normalized(self) -> Option<Self> {
        let n = self.norm_sq();
        if !(n.is_finite() && n > 0.0) {
            return None;
        }
        let r = n.sqrt().recip();
        Some(Self {
            w: self.w * r,
            x: self.x * r,
            y: self.y * r,
            z: self.z * r,
        })
    }

    /// First-order step of `q̇ = ½ q ⊗ (0, ω)`.
    fn integrate(self, omega: Vec3, dt: f32) -> Self {
        let [p, q, r] = omega.map(|v| v * 0.5 * dt);
        let Self { w, x, y, z } = self;
        Self {
            w: w - x * p - y * q - z * r,
            x: x + w * p + y * r - z * q,
            y: y + w * q - x * r + z * p,
            z: z + w * r + x * q - y * p,
        }
    }

    /// Half the earth z axis expressed in the body frame, i.e. where the
    /// accelerometer should see gravity, scaled by ½.
    fn half_gravity(&self) -> Vec3 {
        let Self { w, x, y, z } = *self;
        [x * z - w * y, w * x + y * z, w * w - 0.5 + z * z]
    }

    /// Roll, pitch, yaw in radians, ZYX order. Pitch saturates at ±90°.
    pub fn euler(&self) -> (f32, f32, f32) {
        let Self { w, x, y, z } = *self;
        let roll = (2.0 * (w * x + y * z)).atan2(1.0 - 2.0 * (x * x + y * y));
        let sin_pitch = 2.0 * (w * y - z * x);
        let pitch = if sin_pitch.abs() >= 1.0 {
            FRAC_PI_2.copysign(sin_pitch)
        } else {
            sin_pitch.asin()
        };
        let yaw = (2.0 * (w * z + x * y)).atan2(1.0 - 2.0 * (y * y + z * z));
        (roll, pitch, yaw)
    }
}

/// Mahony filter: the gravity direction error feeds back into the gyro rate
/// through a PI term. Gyro in rad/s; only the direction of the accelerometer
/// vector matters.
#[derive(Clone, Copy, Debug)]
pub struct Mahony {
    kp: f32,
    ki: f32,
    /// Bound on each component of `bias`, rad/s.
    i_limit: f32,
    /// Integrated correction, rad/s.
    bias: Vec3,
    pub q: Quaternion,
}

impl Mahony {
    pub fn new(kp: f32, ki: f32, i_limit: f32) -> Self {
        Self {
            kp,
            ki,
            i_limit,
            bias: [0.0; 3],
            q: Quaternion::IDENTITY,
        }
    }

    pub fn set_gains(&mut self, kp: f32, ki: f32, i_limit: f32) {
        self.kp = kp;
        self.ki = ki;
        self.i_limit = i_limit;
        if ki <= 0.0 {
            self.bias = [0.0; 3];
        }
        self.bias = self.bias.map(|b| b.clamp(-i_limit, i_limit));
    }

    pub fn bias(&self) -> Vec3 {
        self.bias
    }

    pub fn reset(&mut self) {
        self.bias = [0.0; 3];
        self.q = Quaternion::IDENTITY;
    }

    /// One filter step. `accel = None` integrates the gyro alone.
    pub fn update(&mut self, dt: f32, gyro: Vec3, accel: Option<Vec3>) {
        let mut omega = gyro;

        let measured = accel.and_then(|a| {
            let n = (a[0] * a[0] + a[1] * a[1] + a[2] * a[2]).sqrt();
            (n > 0.0).then(|| a.map(|v| v / n))
        });
        if let Some(g) = measured {
            let e = cross(g, self.q.half_gravity());
            if self.ki > 0.0 {
                for (b, e) in self.bias.iter_mut().zip(e) {
                    *b = (*b + self.ki * e * dt).clamp(-self.i_limit, self.i_limit);
                }
            }
            for i in 0..3 {
                omega[i] += self.kp * e[i] + self.bias[i];
            }
        }

        match self.q.integrate(omega, dt).normalized() {
            Some(q) => self.q = q,
            None => self.reset(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn level_and_still_stays_identity() {
        let mut m = Mahony::new(2.0, 0.0, 0.2);
        for _ in 0..1000 {
            m.update(0.001, [0.0; 3], Some([0.0, 0.0, 1.0]));
        }
        let (r, p, y) = m.q.euler();
        assert_relative_eq!(r, 0.0, epsilon = 1e-4);
        assert_relative_eq!(p, 0.0, epsilon = 1e-4);
        assert_relative_eq!(y, 0.0, epsilon = 1e-4);
    }

    #[test]
    fn gyro_only_integrates_yaw() {
        let mut m = Mahony::new(2.0, 0.0, 0.2);
        // 90 deg/s for 0.5 s
        for _ in 0..500 {
            m.update(0.001, [0.0, 0.0, 90f32.to_radians()], None);
        }
        let (_, _, y) = m.q.euler();
        assert_relative_eq!(y.to_degrees(), 45.0, epsilon = 0.1);
    }

    #[test]
    fn accel_pulls_roll_toward_gravity() {
        let mut m = Mahony::new(5.0, 0.0, 0.2);
        let tilt = 20f32.to_radians();
        // Gravity seen by a vehicle rolled +20 degrees.
        let accel = [0.0, tilt.sin(), tilt.cos()];
        for _ in 0..5000 {
            m.update(0.001, [0.0; 3], Some(accel));
        }
        let (r, p, _) = m.q.euler();
        assert_relative_eq!(r.to_degrees(), 20.0, epsilon = 0.2);
        assert_relative_eq!(p.to_degrees(), 0.0, epsilon = 0.2);
    }

    #[test]
    fn sustained_spin_keeps_unit_norm() {
        let mut m = Mahony::new(2.0, 0.01, 0.2);
        for _ in 0..20_000 {
            m.update(0.001, [30.0, -25.0, 35.0], Some([0.1, -0.2, 0.9]));
        }
        let q = m.q;
        let n = q.w * q.w + q.x * q.x + q.y * q.y + q.z * q.z;
        assert_relative_eq!(n, 1.0, epsilon = 1e-4);
    }

    #[test]
    fn integral_feedback_is_bounded() {
        let limit = 0.05;
        let mut m = Mahony::new(2.0, 5.0, limit);
        for _ in 0..10_000 {
            // Gyro spins about x while the accelerometer insists on level.
            m.update(0.001, [3.0, 0.0, 0.0], Some([0.0, 0.0, 1.0]));
            assert!(m.bias().iter().all(|b| b.abs() <= limit));
        }
        assert!(m.bias().iter().any(|&b| b != 0.0));

        m.set_gains(2.0, 5.0, 0.01);
        assert!(m.bias().iter().all(|b| b.abs() <= 0.01));
    }
}
