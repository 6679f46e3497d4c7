//! Standalone ECU emulator: a single bus and a responder, no forwarding.

use crate::config::{BusConfig, ResponderConfig};
use crate::controller::{CanController, ControllerError};
use crate::frame::Frame;
use crate::registry::{InterruptRegistry, RegistryError};
use crate::responder::{ResponseCode, Responder, ECU_REPLY_ID};
use crate::stream::FrameStream;
use log::info;
use std::sync::Arc;

pub struct Emulator<C> {
    stream: FrameStream<C>,
    responder: Responder,
}

impl<C: CanController + 'static> Emulator<C> {
    pub fn new(
        bus: BusConfig,
        responder_config: &ResponderConfig,
        controller: C,
        capacity: usize,
        settle_delay_us: u32,
        registry: &Arc<InterruptRegistry>,
    ) -> Result<Self, RegistryError> {
        let stream = FrameStream::new(bus, controller, capacity, settle_delay_us, registry)?;
        let mut responder = Responder::new();
        if let Some(payload) = responder_config.monitor_status {
            responder.set_monitor_status_frame(Frame::new(ECU_REPLY_ID, &payload));
        }
        Ok(Self { stream, responder })
    }
}

impl<C: CanController> Emulator<C> {
    pub fn begin(&self) -> Result<(), ControllerError> {
        self.stream.begin()?;
        info!("OBD2Emulator: {} ready", self.stream.name());
        Ok(())
    }

    pub fn end(&self) {
        self.stream.end();
    }

    /// Answer the newest request if it is one of ours.
    ///
    /// Nothing else consumes this bus, so anything left unanswered is
    /// discarded.
    pub fn poll(&mut self) -> ResponseCode {
        let code = self.responder.handle_next_frame(&mut self.stream);
        if code.is_handled() {
            self.stream.log_stats();
        } else {
            self.stream.clear();
        }
        code
    }

    #[must_use]
    pub fn stream(&self) -> &FrameStream<C> {
        &self.stream
    }
}
