//! Hardware-facing seams of the control cycle: IMU in, receiver in, ESCs out.

pub mod output;
pub mod receiver;
pub mod sensor;

pub use output::{ActuatorSink, OutputDriver, OutputFrame, OutputProtocol, PulseSchedule, PulseSlot};
pub use receiver::{ChannelMap, FrameSource, RcFrame, ReceiverInterface};
pub use sensor::{ImuDevice, SensorInterface, SensorReading, SensorStatus};
