//! Board drivers behind the core's device traits.

pub mod icm42688;
pub mod motors;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Receiver;
use hoverfc::io::{FrameSource, RcFrame};

/// Control-cycle end of the receiver channel filled by the CRSF task.
pub struct RcLink {
    rx: Receiver<'static, CriticalSectionRawMutex, RcFrame, 1>,
}

impl RcLink {
    pub fn new(rx: Receiver<'static, CriticalSectionRawMutex, RcFrame, 1>) -> Self {
        Self { rx }
    }
}

impl FrameSource for RcLink {
    fn poll(&mut self) -> Option<RcFrame> {
        self.rx.try_receive().ok()
    }
}
