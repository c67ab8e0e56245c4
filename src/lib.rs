//! Stabilization core for a mini quadcopter.
//!
//! Everything in this library is hardware independent and allocation free so
//! it runs unchanged inside the firmware's fast loop and in host tests. The
//! board glue (SPI IMU, DShot pins, CRSF UART, USB link) lives in the
//! `hoverfc` binary behind the `firmware` feature.
//!
//! One control cycle is [`flight::FlightCore::step`]:
//! sensor read → receiver read → estimation → safety check → control →
//! mixing → output gate → output.
#![cfg_attr(not(test), no_std)]

#[macro_use]
mod fmt;

pub mod config;
pub mod control;
pub mod error;
pub mod estimation;
pub mod flight;
pub mod io;
pub mod params;
pub mod protocol;
pub mod safety;
pub mod state;
pub mod telemetry;

pub use config::{ConfigStore, FlightConfig};
pub use error::{ConfigError, FlightError, ParamError, SensorFault, SignalLoss};
pub use flight::FlightCore;
pub use state::{ActuatorCommands, AttitudeEstimate, CommandChannels, ImuSample, SafetyState};
