//! In-memory CAN controller for host runs and tests.
//!
//! Frames handed to [`VirtualController::inject`] are queued as if they had
//! arrived on the wire, then the registered receive callback fires on the
//! caller's thread, standing in for the controller's interrupt line. Several
//! threads may inject at once; the stream counts a receive that collides with
//! another one as a dropped frame.
//!
//! Begin and transmit outcomes are driven by raw driver status values, so the
//! error path is the same [`ControllerError::check`] mapping a register-level
//! driver goes through.

use crate::clock;
use crate::controller::{CanController, ControllerError, InstanceId, ReceiveCallback, STATUS_OK};
use crate::frame::Frame;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Device on the far side of the wire: sees each transmitted frame and may
/// answer with one frame of its own.
pub type PeerHook = Box<dyn FnMut(&Frame) -> Option<Frame> + Send>;

struct WireState {
    rx: VecDeque<Frame>,
    transmitted: Vec<Frame>,
    running: bool,
    begin_status: i32,
    transmit_status: i32,
}

impl Default for WireState {
    fn default() -> Self {
        Self {
            rx: VecDeque::new(),
            transmitted: Vec::new(),
            running: false,
            begin_status: STATUS_OK,
            transmit_status: STATUS_OK,
        }
    }
}

pub struct VirtualController {
    instance_id: InstanceId,
    wire: Mutex<WireState>,
    callback: Mutex<Option<ReceiveCallback>>,
    peer: Mutex<Option<PeerHook>>,
}

impl VirtualController {
    #[must_use]
    pub fn new(instance_id: InstanceId) -> Self {
        Self {
            instance_id,
            wire: Mutex::new(WireState::default()),
            callback: Mutex::new(None),
            peer: Mutex::new(None),
        }
    }

    fn wire(&self) -> std::sync::MutexGuard<'_, WireState> {
        self.wire.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Queue `frame` as received and fire the receive callback.
    ///
    /// Frames without a timestamp are stamped with the current tick.
    pub fn inject(&self, frame: Frame) {
        let frame = if frame.timestamp_ms == 0 {
            frame.at(clock::millis())
        } else {
            frame
        };
        self.wire().rx.push_back(frame);
        self.raise_interrupt();
    }

    /// Fire the receive callback without queueing anything.
    pub fn raise_interrupt(&self) {
        let callback = self
            .callback
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback(self.instance_id);
        }
    }

    /// Install the device that answers frames transmitted on this bus.
    pub fn set_peer(&self, hook: PeerHook) {
        *self.peer.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(hook);
    }

    /// Driver status `begin` reports from now on.
    pub fn set_begin_status(&self, status: i32) {
        self.wire().begin_status = status;
    }

    /// Driver status `transmit_frame` reports from now on.
    pub fn set_transmit_status(&self, status: i32) {
        self.wire().transmit_status = status;
    }

    /// Every frame successfully transmitted so far.
    #[must_use]
    pub fn transmitted(&self) -> Vec<Frame> {
        self.wire().transmitted.clone()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.wire().running
    }

    /// Frames queued in the controller but not yet fetched by the stream.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.wire().rx.len()
    }
}

impl CanController for VirtualController {
    fn begin(&self, _baud_rate: u32, initialize_bus: bool) -> Result<(), ControllerError> {
        let mut wire = self.wire();
        ControllerError::check(wire.begin_status)?;
        if initialize_bus {
            wire.running = true;
        }
        Ok(())
    }

    fn end(&self) {
        let mut wire = self.wire();
        wire.running = false;
        wire.rx.clear();
    }

    fn receive_frame(&self) -> Option<Frame> {
        self.wire().rx.pop_front()
    }

    fn transmit_frame(&self, frame: &Frame) -> Result<(), ControllerError> {
        {
            let mut wire = self.wire();
            ControllerError::check(wire.transmit_status)?;
            wire.transmitted.push(*frame);
        }

        // The peer answers outside the wire lock; its reply re-enters `inject`.
        let reply = self
            .peer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_mut()
            .and_then(|hook| hook(frame));
        if let Some(reply) = reply {
            self.inject(reply);
        }
        Ok(())
    }

    fn register_receive_callback(&self, callback: ReceiveCallback) {
        *self
            .callback
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(callback);
    }

    fn detect_hardware(&self) -> bool {
        self.wire().begin_status == STATUS_OK
    }

    fn register_dump(&self) -> Vec<(u8, u8)> {
        let wire = self.wire();
        #[allow(clippy::cast_possible_truncation)] // queue depth is tiny
        let pending = wire.rx.len().min(usize::from(u8::MAX)) as u8;
        vec![(0x0e, u8::from(wire.running) << 7), (0x2c, pending)]
    }
}
