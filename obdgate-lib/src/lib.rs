//! Core of the obdgate CAN proxy.
//!
//! The proxy sits between a scan tool (bus A) and a vehicle ECU (bus B).
//! Each bus is wrapped in a [`FrameStream`] fed from the controller's receive
//! interrupt through a lock-free ring. The [`ProxyEngine`] forwards traffic
//! in both directions, letting a local [`Responder`] answer a few diagnostic
//! requests itself while its enable gate is asserted.

pub mod clock;
pub mod config;
pub mod controller;
pub mod emulator;
pub mod frame;
pub mod gate;
pub mod proxy;
pub mod registry;
pub mod responder;
pub mod ring;
pub mod stream;
pub mod virtual_bus;

pub use config::{BusConfig, ConfigError, LogLevel, ProxyConfig, ResponderConfig};
pub use controller::{CanController, ControllerError, InstanceId};
pub use emulator::Emulator;
pub use frame::Frame;
pub use gate::{EnableHandle, Level, ResponderGate};
pub use proxy::{BusRole, CycleOutcome, ProxyEngine, ProxyError, ProxyStats, ReplyOutcome};
pub use registry::{InterruptRegistry, RegistryError};
pub use responder::{DiagnosticService, ResponseCode, Responder};
pub use stream::{FrameStream, StreamStats};
pub use virtual_bus::VirtualController;
