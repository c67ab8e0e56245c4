//! Wire formats spoken by the board: CRSF to the receiver, DShot to the ESCs.

pub mod crsf;
pub mod dshot;
