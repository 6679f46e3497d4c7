//! Enable input for the local responder.
//!
//! The level of an external input (a GPIO on the reference board) decides
//! whether the proxy answers diagnostic requests itself or forwards everything.
//! The owner of the input reports each edge through an [`EnableHandle`]; the
//! proxy reads the level once per cycle.

use log::info;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Logical level of the enable input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Low,
    High,
}

/// Proxy-owned view of the enable input.
#[derive(Debug)]
pub struct ResponderGate {
    pin: u8,
    level: Arc<AtomicBool>,
}

/// Edge reporter handed to whatever watches the physical input.
///
/// Cheap to clone and safe to call from an interrupt handler.
#[derive(Debug, Clone)]
pub struct EnableHandle {
    pin: u8,
    level: Arc<AtomicBool>,
}

impl ResponderGate {
    /// A gate for `pin`, asserted until the first edge says otherwise.
    #[must_use]
    pub fn new(pin: u8) -> Self {
        Self {
            pin,
            level: Arc::new(AtomicBool::new(true)),
        }
    }

    #[must_use]
    pub fn pin(&self) -> u8 {
        self.pin
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.level.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn handle(&self) -> EnableHandle {
        EnableHandle {
            pin: self.pin,
            level: Arc::clone(&self.level),
        }
    }
}

impl EnableHandle {
    /// Report the input level after an edge.
    pub fn set_level(&self, level: Level) {
        let high = level == Level::High;
        let was_high = self.level.swap(high, Ordering::AcqRel);
        if was_high != high {
            if high {
                info!("CANProxy: OBD2Responder gpio {} is HIGH, enabling", self.pin);
            } else {
                info!("CANProxy: OBD2Responder gpio {} is LOW, disabling", self.pin);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_enabled() {
        let gate = ResponderGate::new(34);
        assert!(gate.is_enabled());
        assert_eq!(gate.pin(), 34);
    }

    #[test]
    fn handle_drives_gate() {
        let gate = ResponderGate::new(34);
        let handle = gate.handle();
        handle.set_level(Level::Low);
        assert!(!gate.is_enabled());

        let from_isr = handle.clone();
        std::thread::spawn(move || from_isr.set_level(Level::High))
            .join()
            .unwrap();
        assert!(gate.is_enabled());
    }
}
