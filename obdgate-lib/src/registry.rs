//! Interrupt dispatch table for frame streams.
//!
//! Drivers report a received frame with nothing but an instance id. The
//! registry maps that id back to the producer routine of the stream that owns
//! the bus. Slots are filled once, when each stream is constructed, and the
//! dispatch path only reads them, so it never blocks.

use crate::controller::{InstanceId, ReceiveCallback};
use derive_more::{Display, Error};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// Number of bus instances the registry can address.
pub const MAX_INSTANCES: usize = 4;

/// Receiver side of an interrupt.
pub trait InterruptTarget: Send + Sync {
    /// Runs in interrupt context. Must be short and must not block.
    fn on_interrupt(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Error)]
pub enum RegistryError {
    #[display("instance id {id} is out of range")]
    OutOfRange { id: InstanceId },
    #[display("instance id {id} is already registered")]
    Taken { id: InstanceId },
}

pub struct InterruptRegistry {
    slots: [OnceLock<Weak<dyn InterruptTarget>>; MAX_INSTANCES],
    stray: AtomicU64,
}

impl Default for InterruptRegistry {
    fn default() -> Self {
        Self {
            slots: std::array::from_fn(|_| OnceLock::new()),
            stray: AtomicU64::new(0),
        }
    }
}

impl InterruptRegistry {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Bind `target` to `id`. The registry holds only a weak reference, so a
    /// dropped stream simply stops receiving dispatches.
    pub fn register(
        &self,
        id: InstanceId,
        target: Weak<dyn InterruptTarget>,
    ) -> Result<(), RegistryError> {
        let slot = self
            .slots
            .get(usize::from(id))
            .ok_or(RegistryError::OutOfRange { id })?;
        slot.set(target).map_err(|_| RegistryError::Taken { id })
    }

    /// Route one interrupt to the stream registered for `id`.
    ///
    /// Unknown or dropped ids are counted and otherwise ignored.
    pub fn dispatch(&self, id: InstanceId) {
        let target = self
            .slots
            .get(usize::from(id))
            .and_then(OnceLock::get)
            .and_then(Weak::upgrade);
        match target {
            Some(target) => target.on_interrupt(),
            None => {
                self.stray.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Callback to hand to a driver; it dispatches through this registry.
    #[must_use]
    pub fn dispatcher(self: &Arc<Self>) -> ReceiveCallback {
        let registry = Arc::clone(self);
        Arc::new(move |id| registry.dispatch(id))
    }

    /// Interrupts that arrived for an id with no live stream.
    #[must_use]
    pub fn stray_interrupts(&self) -> u64 {
        self.stray.load(Ordering::Relaxed)
    }
}
