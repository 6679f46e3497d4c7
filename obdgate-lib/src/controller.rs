//! Hardware abstraction for one physical CAN bus.
//!
//! The register-level driver lives outside this crate. A frame stream only
//! needs the narrow contract below: bring the controller up, pull one frame
//! from it when the receive interrupt fires, and hand it frames to transmit.

use crate::frame::Frame;
use derive_more::{Display, Error};
use std::sync::Arc;

/// Status value drivers use to report success.
pub const STATUS_OK: i32 = 1;

/// Identifies one bus instance to the interrupt dispatcher.
pub type InstanceId = u8;

/// Receive notification installed by the frame stream.
///
/// Drivers call it once per received frame from their interrupt context,
/// passing the instance id the stream was configured with.
pub type ReceiveCallback = Arc<dyn Fn(InstanceId) + Send + Sync>;

/// A driver status other than [`STATUS_OK`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Error)]
#[display("controller status {code}")]
pub struct ControllerError {
    pub code: i32,
}

impl ControllerError {
    #[must_use]
    pub const fn new(code: i32) -> Self {
        Self { code }
    }

    /// Map a raw driver status onto a `Result`.
    pub const fn check(status: i32) -> Result<(), Self> {
        if status == STATUS_OK {
            Ok(())
        } else {
            Err(Self { code: status })
        }
    }
}

/// One CAN controller as seen by a frame stream.
///
/// Methods take `&self` because the receive path runs from interrupt context
/// while the poll loop transmits; drivers serialise their own bus access.
pub trait CanController: Send + Sync {
    /// Configure bit timing and, when `initialize_bus` is set, join the bus.
    fn begin(&self, baud_rate: u32, initialize_bus: bool) -> Result<(), ControllerError>;

    /// Leave the bus and release the controller.
    fn end(&self);

    /// Fetch one received frame, `None` when the controller had nothing pending.
    fn receive_frame(&self) -> Option<Frame>;

    fn transmit_frame(&self, frame: &Frame) -> Result<(), ControllerError>;

    fn register_receive_callback(&self, callback: ReceiveCallback);

    /// Probe whether the controller answers at all.
    fn detect_hardware(&self) -> bool;

    /// (address, value) pairs for the diagnostic register dump.
    fn register_dump(&self) -> Vec<(u8, u8)> {
        Vec::new()
    }
}

impl<T: CanController + ?Sized> CanController for Arc<T> {
    fn begin(&self, baud_rate: u32, initialize_bus: bool) -> Result<(), ControllerError> {
        (**self).begin(baud_rate, initialize_bus)
    }

    fn end(&self) {
        (**self).end();
    }

    fn receive_frame(&self) -> Option<Frame> {
        (**self).receive_frame()
    }

    fn transmit_frame(&self, frame: &Frame) -> Result<(), ControllerError> {
        (**self).transmit_frame(frame)
    }

    fn register_receive_callback(&self, callback: ReceiveCallback) {
        (**self).register_receive_callback(callback);
    }

    fn detect_hardware(&self) -> bool {
        (**self).detect_hardware()
    }

    fn register_dump(&self) -> Vec<(u8, u8)> {
        (**self).register_dump()
    }
}
