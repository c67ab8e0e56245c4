use core::f32::consts::{FRAC_PI_2, PI};
use micromath::F32Ext;

/// Smallest |cos(pitch)| used in the Euler-rate transform; keeps the yaw
/// and roll kinematics finite near ±90° pitch.
const MIN_COS_PITCH: f32 = 0.01;

/// Wrap an angle in radians to (-π, π].
pub fn wrap_pi(angle: f32) -> f32 {
    let mut a = angle % (2.0 * PI);
    if a > PI {
        a -= 2.0 * PI;
    } else if a <= -PI {
        a += 2.0 * PI;
    }
    a
}

/// Roll and pitch (rad) of the gravity vector seen by the accelerometer.
pub fn accel_angles(accel: [f32; 3]) -> (f32, f32) {
    let [ax, ay, az] = accel;
    let roll = ay.atan2(az);
    let pitch = (-ax).atan2((ay * ay + az * az).sqrt());
    (roll, pitch)
}

/// Gyro-integrated Euler angles blended with accelerometer angles.
///
/// `blend` is the per-cycle weight of the gyro path: the accel correction
/// has a time constant of `dt / (1 - blend)`.
#[derive(Clone, Copy, Debug)]
pub struct ComplementaryFilter {
    blend: f32,
    roll: f32,
    pitch: f32,
    yaw: f32,
    seeded: bool,
}

impl ComplementaryFilter {
    pub fn new(blend: f32) -> Self {
        Self {
            blend: blend.clamp(0.0, 1.0),
            roll: 0.0,
            pitch: 0.0,
            yaw: 0.0,
            seeded: false,
        }
    }

    pub fn set_blend(&mut self, blend: f32) {
        self.blend = blend.clamp(0.0, 1.0);
    }

    pub fn reset(&mut self) {
        self.roll = 0.0;
        self.pitch = 0.0;
        self.yaw = 0.0;
        self.seeded = false;
    }

    /// Roll, pitch, yaw in radians.
    pub fn angles(&self) -> (f32, f32, f32) {
        (self.roll, self.pitch, self.yaw)
    }

    /// Gyro in rad/s. `accel = None` integrates the gyro alone.
    pub fn update(&mut self, dt: f32, gyro: [f32; 3], accel: Option<[f32; 3]>) {
        let [p, q, r] = gyro;

        if let (false, Some(a)) = (self.seeded, accel) {
            let (roll, pitch) = accel_angles(a);
            self.roll = roll;
            self.pitch = pitch;
            self.seeded = true;
            return;
        }

        let (sr, cr) = (self.roll.sin(), self.roll.cos());
        let cp = self.pitch.cos();
        let cp = if cp.abs() < MIN_COS_PITCH {
            MIN_COS_PITCH.copysign(cp)
        } else {
            cp
        };
        let tp = self.pitch.sin() / cp;

        let roll_dot = p + (q * sr + r * cr) * tp;
        let pitch_dot = q * cr - r * sr;
        let yaw_dot = (q * sr + r * cr) / cp;

        let roll_gyro = wrap_pi(self.roll + roll_dot * dt);
        let pitch_gyro = (self.pitch + pitch_dot * dt).clamp(-FRAC_PI_2, FRAC_PI_2);
        self.yaw = wrap_pi(self.yaw + yaw_dot * dt);

        match accel {
            Some(a) => {
                let (roll_acc, pitch_acc) = accel_angles(a);
                let k = 1.0 - self.blend;
                self.roll = wrap_pi(roll_gyro + k * wrap_pi(roll_acc - roll_gyro));
                self.pitch = pitch_gyro + k * (pitch_acc - pitch_gyro);
            }
            None => {
                self.roll = roll_gyro;
                self.pitch = pitch_gyro;
            }
        }
    }
}
