//! Error kinds of the control core.

use thiserror::Error;

/// IMU could not deliver a trustworthy sample.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SensorFault {
    #[error("IMU did not acknowledge within the read timeout")]
    Timeout,

    #[error("IMU bus transfer failed")]
    Bus,

    #[error("IMU reading outside the plausible range")]
    OutOfRange,
}

/// No valid receiver frame arrived within the configured window.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[error("no valid receiver frame for more than {timeout_ms} ms")]
pub struct SignalLoss {
    pub timeout_ms: u32,
}

/// A configuration value outside its safe bounds. The offending parameter is
/// named with the same dotted path the parameter link uses.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    #[error("{0} is out of safe bounds")]
    OutOfBounds(&'static str),

    #[error("{0} is not a finite number")]
    NotFinite(&'static str),

    #[error("mixer must have between 1 and 8 motors")]
    MixerSize,

    #[error("output pulses do not fit in one control period")]
    ScheduleOverflow,

    #[error("receiver channel map reuses or exceeds channel indices")]
    ChannelMap,
}

/// Parameter link command errors.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParamError {
    #[error("empty command")]
    Empty,

    #[error("unknown command")]
    UnknownCommand,

    #[error("unknown parameter")]
    UnknownParameter,

    #[error("missing argument")]
    MissingArgument,

    #[error("value is not a number")]
    InvalidNumber,

    #[error("value must be a non-negative integer")]
    NotAnInteger,

    #[error("value is not one of the allowed choices")]
    InvalidChoice,

    #[error("parameter does not apply to the current selection")]
    Inactive,

    #[error("staged configuration rejected: {0}")]
    Rejected(#[from] ConfigError),
}

/// Umbrella error used where several subsystems report through one path.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlightError {
    #[error("sensor fault: {0}")]
    Sensor(#[from] SensorFault),

    #[error("signal loss: {0}")]
    Signal(#[from] SignalLoss),

    #[error("attitude calibration did not converge, running on default offsets")]
    EstimationDegraded,

    #[error("actuator output clipped")]
    ActuatorSaturation,

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("parameter link: {0}")]
    Param(#[from] ParamError),
}
