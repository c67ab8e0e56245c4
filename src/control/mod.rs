//! Stabilization control and motor mixing.

pub mod mixer;
pub mod pid;
pub mod stabilizer;

pub use mixer::{Airframe, ClipStrategy, Mixer, MixerMatrix, MotorMix};
pub use pid::{Pid, PidGains};
pub use stabilizer::{Guidance, Stabilizer, TorqueCommand};
