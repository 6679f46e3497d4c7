//! Bidirectional proxy between the scan tool bus (A) and the ECU bus (B).
//!
//! One call to [`ProxyEngine::poll`] runs one proxy cycle:
//! 1. Nothing buffered on A: no-op.
//! 2. With a responder attached and its gate asserted, the responder gets
//!    first look at A. A frame it answers is counted and never forwarded.
//! 3. Otherwise the oldest A frame is forwarded to B.
//! 4. The engine spins for up to `reply_timeout` waiting for B to produce a
//!    frame, and relays the oldest one back to A. This happens even when the
//!    forward failed. No reply is not an error.

use crate::config::{ConfigError, ProxyConfig, MAX_ENABLE_PIN};
use crate::controller::{CanController, ControllerError};
use crate::frame::Frame;
use crate::gate::{EnableHandle, ResponderGate};
use crate::registry::{InterruptRegistry, RegistryError};
use crate::responder::{ResponseCode, Responder, ECU_REPLY_ID};
use crate::stream::FrameStream;
use derive_more::{Display, Error};
use log::{debug, error, info, warn};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Which side of the proxy a bus sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum BusRole {
    /// Scan tool side
    #[display("bus A")]
    A,
    /// ECU side
    #[display("bus B")]
    B,
}

#[derive(Debug, Display, Error, PartialEq, Eq)]
pub enum ProxyError {
    #[display("failed to initialize {bus}: {source}")]
    BusInit { bus: BusRole, source: ControllerError },
}

impl ProxyError {
    /// Legacy numeric status: `-10 + code` for bus A, `-20 + code` for bus B.
    #[must_use]
    pub const fn status_code(&self) -> i32 {
        match self {
            Self::BusInit {
                bus: BusRole::A,
                source,
            } => -10 + source.code,
            Self::BusInit {
                bus: BusRole::B,
                source,
            } => -20 + source.code,
        }
    }
}

/// Proxy-level counters, separate from the per-stream ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProxyStats {
    pub frames_received_a: u64,
    pub frames_received_b: u64,
    pub forwarded_a_to_b: u64,
    pub forwarded_b_to_a: u64,
    pub errors_a: u64,
    pub errors_b: u64,
}

/// What happened to the ECU's answer after a forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// Relayed back to bus A
    Relayed,
    /// Received from B but could not be sent on A
    RelayFailed(ControllerError),
    /// Nothing arrived within the reply timeout
    NoReply,
}

/// Result of one proxy cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Bus A had nothing buffered
    Idle,
    /// The responder answered the request on bus A
    Answered(ResponseCode),
    /// The oldest bus A frame was forwarded to bus B
    Forwarded {
        forward: Result<(), ControllerError>,
        reply: ReplyOutcome,
    },
}

struct AttachedResponder {
    responder: Responder,
    gate: ResponderGate,
}

pub struct ProxyEngine<A, B> {
    bus_a: FrameStream<A>,
    bus_b: FrameStream<B>,
    responder: Option<AttachedResponder>,
    monitor_status: Option<[u8; 8]>,
    reply_timeout: Duration,
    stats: ProxyStats,
}

impl<A, B> ProxyEngine<A, B>
where
    A: CanController + 'static,
    B: CanController + 'static,
{
    /// Build both streams and claim their instance ids in `registry`.
    ///
    /// The responder stays detached until [`Self::activate_responder`].
    pub fn new(
        config: &ProxyConfig,
        controller_a: A,
        controller_b: B,
        registry: &Arc<InterruptRegistry>,
    ) -> Result<Self, RegistryError> {
        let bus_a = FrameStream::new(
            config.bus_a.clone(),
            controller_a,
            config.buffer_capacity,
            config.settle_delay_us,
            registry,
        )?;
        let bus_b = FrameStream::new(
            config.bus_b.clone(),
            controller_b,
            config.buffer_capacity,
            config.settle_delay_us,
            registry,
        )?;

        Ok(Self {
            bus_a,
            bus_b,
            responder: None,
            monitor_status: config.responder.monitor_status,
            reply_timeout: Duration::from_millis(config.reply_timeout_ms),
            stats: ProxyStats::default(),
        })
    }
}

impl<A: CanController, B: CanController> ProxyEngine<A, B> {
    /// Bring up bus A, then bus B. Bus B is never touched if A fails.
    pub fn begin(&self) -> Result<(), ProxyError> {
        info!("CANProxy: Initializing dual CAN proxy");

        self.bus_a.begin().map_err(|source| Self::init_failed(BusRole::A, source))?;
        self.bus_b.begin().map_err(|source| Self::init_failed(BusRole::B, source))?;

        info!("CANProxy: Both CAN controllers initialized successfully");
        Ok(())
    }

    fn init_failed(bus: BusRole, source: ControllerError) -> ProxyError {
        let err = ProxyError::BusInit { bus, source };
        error!("CANProxy: {err} (status {})", err.status_code());
        err
    }

    pub fn end(&self) {
        self.bus_a.end();
        self.bus_b.end();
        info!("CANProxy: Ended both CAN controllers");
    }

    /// Attach a responder to bus A, gated by the input on `pin`.
    ///
    /// The returned handle is how the owner of the input reports its level.
    /// Activating again replaces the previous responder and gate.
    pub fn activate_responder(&mut self, pin: u8) -> Result<EnableHandle, ConfigError> {
        if pin > MAX_ENABLE_PIN {
            warn!("CANProxy: Invalid GPIO pin number: {pin}");
            return Err(ConfigError::EnablePin { pin });
        }

        let mut responder = Responder::new();
        if let Some(payload) = self.monitor_status {
            responder.set_monitor_status_frame(Frame::new(ECU_REPLY_ID, &payload));
        }
        let gate = ResponderGate::new(pin);
        let handle = gate.handle();
        self.responder = Some(AttachedResponder { responder, gate });

        info!("CANProxy: OBD2Responder activated with GPIO pin {pin}");
        Ok(handle)
    }

    /// Run one proxy cycle.
    pub fn poll(&mut self) -> CycleOutcome {
        if !self.bus_a.available() {
            return CycleOutcome::Idle;
        }

        if let Some(attached) = self.responder.as_ref().filter(|r| r.gate.is_enabled()) {
            let code = attached.responder.handle_next_frame(&mut self.bus_a);
            if code.is_handled() {
                self.stats.frames_received_a += 1;
                debug!("CANProxy: OBD2Responder handled frame, not forwarding");
                return CycleOutcome::Answered(code);
            }
        }

        let frame = self.bus_a.read();
        self.stats.frames_received_a += 1;

        let forward = self.bus_b.send(&frame);
        match forward {
            Ok(()) => {
                self.stats.forwarded_a_to_b += 1;
                debug!(
                    "CANProxy: Forwarded frame from {} to {}, ID: 0x{:x}",
                    self.bus_a.name(),
                    self.bus_b.name(),
                    frame.id
                );
            }
            Err(e) => {
                self.stats.errors_a += 1;
                debug!(
                    "CANProxy: Failed to forward frame from {} to {}, error: {}",
                    self.bus_a.name(),
                    self.bus_b.name(),
                    e.code
                );
            }
        }

        let reply = if self.wait_for_reply() {
            self.relay_reply()
        } else {
            ReplyOutcome::NoReply
        };

        CycleOutcome::Forwarded { forward, reply }
    }

    /// Spin until bus B has a frame or the reply timeout passes.
    fn wait_for_reply(&self) -> bool {
        let deadline = Instant::now() + self.reply_timeout;
        while !self.bus_b.available() {
            if Instant::now() >= deadline {
                return false;
            }
            std::hint::spin_loop();
        }
        true
    }

    fn relay_reply(&mut self) -> ReplyOutcome {
        let reply = self.bus_b.read();
        self.stats.frames_received_b += 1;

        match self.bus_a.send(&reply) {
            Ok(()) => {
                self.stats.forwarded_b_to_a += 1;
                debug!(
                    "CANProxy: Forwarded frame from {} to {}, ID: 0x{:x}",
                    self.bus_b.name(),
                    self.bus_a.name(),
                    reply.id
                );
                ReplyOutcome::Relayed
            }
            Err(e) => {
                self.stats.errors_b += 1;
                debug!(
                    "CANProxy: Failed to forward frame from {} to {}, error: {}",
                    self.bus_b.name(),
                    self.bus_a.name(),
                    e.code
                );
                ReplyOutcome::RelayFailed(e)
            }
        }
    }

    #[must_use]
    pub fn stats(&self) -> ProxyStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = ProxyStats::default();
    }

    /// False when no responder is attached, otherwise the gate level.
    #[must_use]
    pub fn is_responder_enabled(&self) -> bool {
        self.responder
            .as_ref()
            .is_some_and(|attached| attached.gate.is_enabled())
    }

    pub fn log_stats(&self) {
        let report = ProxyStatsReport {
            name_a: self.bus_a.name(),
            name_b: self.bus_b.name(),
            stats: self.stats,
            responder: self
                .responder
                .as_ref()
                .map(|attached| (attached.gate.is_enabled(), attached.gate.pin())),
        };
        for line in report.to_string().lines() {
            info!("{line}");
        }
    }

    /// True only if both controllers answer.
    #[must_use]
    pub fn detect_hardware(&self) -> bool {
        self.bus_a.detect_hardware() && self.bus_b.detect_hardware()
    }

    pub fn log_hardware_status(&self) {
        info!("CANProxy Hardware Status:");
        self.bus_a.log_hardware_status();
        self.bus_b.log_hardware_status();
    }

    pub fn dump_registers(&self) {
        info!("CANProxy Register Dumps:");
        self.bus_a.dump_registers();
        self.bus_b.dump_registers();
    }

    #[must_use]
    pub fn bus_a(&self) -> &FrameStream<A> {
        &self.bus_a
    }

    #[must_use]
    pub fn bus_b(&self) -> &FrameStream<B> {
        &self.bus_b
    }
}

/// Proxy statistics dump with fixed labels.
pub struct ProxyStatsReport<'a> {
    pub name_a: &'a str,
    pub name_b: &'a str,
    pub stats: ProxyStats,
    /// Gate level and pin, if a responder is attached
    pub responder: Option<(bool, u8)>,
}

impl fmt::Display for ProxyStatsReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (a, b, s) = (self.name_a, self.name_b, &self.stats);
        writeln!(f, "CANProxy Statistics:")?;
        writeln!(f, "  {a} frames received: {}", s.frames_received_a)?;
        writeln!(f, "  {b} frames received: {}", s.frames_received_b)?;
        writeln!(f, "  Frames forwarded {a}->{b}: {}", s.forwarded_a_to_b)?;
        writeln!(f, "  Frames forwarded {b}->{a}: {}", s.forwarded_b_to_a)?;
        writeln!(f, "  {a} errors: {}", s.errors_a)?;
        write!(f, "  {b} errors: {}", s.errors_b)?;
        if let Some((enabled, pin)) = self.responder {
            let state = if enabled { "ENABLED" } else { "DISABLED" };
            write!(f, "\n  OBD2 Responder: {state}\n  OBD2 GPIO Pin: {pin}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::Level;
    use crate::responder::{FUNCTIONAL_REQUEST_ID, SUPPORTED_PIDS_REPLY};
    use crate::virtual_bus::VirtualController;

    type TestEngine = ProxyEngine<Arc<VirtualController>, Arc<VirtualController>>;

    fn engine() -> TestEngine {
        engine_with(ProxyConfig::default())
    }

    fn engine_with(mut config: ProxyConfig) -> TestEngine {
        config.settle_delay_us = 0;
        let registry = InterruptRegistry::new();
        let engine = ProxyEngine::new(
            &config,
            Arc::new(VirtualController::new(0)),
            Arc::new(VirtualController::new(1)),
            &registry,
        )
        .unwrap();
        engine.begin().unwrap();
        engine
    }

    /// ECU on bus B that answers every mode 01 request with vehicle speed.
    fn attach_ecu(engine: &TestEngine) {
        engine.bus_b().controller().set_peer(Box::new(|frame| {
            let pid = frame.payload().get(2).copied()?;
            Some(Frame::new(ECU_REPLY_ID, &[0x03, 0x41, pid, 0x2a]))
        }));
    }

    fn request(pid: u8) -> Frame {
        Frame::new(FUNCTIONAL_REQUEST_ID, &[0x02, 0x01, pid])
    }

    #[test]
    fn idle_without_traffic() {
        let mut engine = engine();
        assert_eq!(engine.poll(), CycleOutcome::Idle);
        assert_eq!(engine.stats(), ProxyStats::default());
    }

    #[test]
    fn answered_request_is_not_forwarded() {
        let mut engine = engine();
        attach_ecu(&engine);
        engine.activate_responder(34).unwrap();
        engine.bus_a().controller().inject(request(0x00));

        assert_eq!(
            engine.poll(),
            CycleOutcome::Answered(ResponseCode::SupportedPids)
        );
        let stats = engine.stats();
        assert_eq!(stats.frames_received_a, 1);
        assert_eq!(stats.forwarded_a_to_b, 0);
        assert_eq!(stats.frames_received_b, 0);
        assert!(engine.bus_b().controller().transmitted().is_empty());

        let replies = engine.bus_a().controller().transmitted();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].payload(), &SUPPORTED_PIDS_REPLY);
    }

    #[test]
    fn forwarded_request_relays_reply() {
        let mut engine = engine();
        attach_ecu(&engine);
        engine.activate_responder(34).unwrap();
        engine.bus_a().controller().inject(request(0x0d));

        assert_eq!(
            engine.poll(),
            CycleOutcome::Forwarded {
                forward: Ok(()),
                reply: ReplyOutcome::Relayed,
            }
        );
        let stats = engine.stats();
        assert_eq!(stats.frames_received_a, 1);
        assert_eq!(stats.forwarded_a_to_b, 1);
        assert_eq!(stats.frames_received_b, 1);
        assert_eq!(stats.forwarded_b_to_a, 1);

        let forwarded = engine.bus_b().controller().transmitted();
        assert_eq!(forwarded[0].payload(), request(0x0d).payload());
        let relayed = engine.bus_a().controller().transmitted();
        assert_eq!(relayed.len(), 1);
        assert_eq!(relayed[0].payload(), &[0x03, 0x41, 0x0d, 0x2a]);
    }

    #[test]
    fn missing_reply_times_out_silently() {
        let mut engine = engine();
        engine.bus_a().controller().inject(request(0x0c));

        let started = Instant::now();
        assert_eq!(
            engine.poll(),
            CycleOutcome::Forwarded {
                forward: Ok(()),
                reply: ReplyOutcome::NoReply,
            }
        );
        assert!(started.elapsed() >= Duration::from_millis(50));

        let stats = engine.stats();
        assert_eq!(stats.frames_received_a, 1);
        assert_eq!(stats.forwarded_a_to_b, 1);
        assert_eq!(stats.frames_received_b, 0);
        assert_eq!(stats.forwarded_b_to_a, 0);
        assert_eq!(stats.errors_a + stats.errors_b, 0);
    }

    #[test]
    fn reply_arriving_during_wait_is_relayed() {
        let mut config = ProxyConfig::default();
        config.reply_timeout_ms = 500;
        let mut engine = engine_with(config);
        engine.bus_a().controller().inject(request(0x0d));

        let ecu = Arc::clone(engine.bus_b().controller());
        let late_ecu = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            ecu.inject(Frame::new(ECU_REPLY_ID, &[0x03, 0x41, 0x0d, 0x2a]));
        });

        assert_eq!(
            engine.poll(),
            CycleOutcome::Forwarded {
                forward: Ok(()),
                reply: ReplyOutcome::Relayed,
            }
        );
        late_ecu.join().unwrap();

        let stats = engine.stats();
        assert_eq!(stats.forwarded_a_to_b, 1);
        assert_eq!(stats.frames_received_b, 1);
        assert_eq!(stats.forwarded_b_to_a, 1);
        let relayed = engine.bus_a().controller().transmitted();
        assert_eq!(relayed.len(), 1);
        assert_eq!(relayed[0].payload(), &[0x03, 0x41, 0x0d, 0x2a]);
    }

    #[test]
    fn reply_after_timeout_is_not_relayed() {
        let mut engine = engine();
        engine.bus_a().controller().inject(request(0x0d));

        let ecu = Arc::clone(engine.bus_b().controller());
        let late_ecu = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            ecu.inject(Frame::new(ECU_REPLY_ID, &[0x03, 0x41, 0x0d, 0x2a]));
        });

        assert_eq!(
            engine.poll(),
            CycleOutcome::Forwarded {
                forward: Ok(()),
                reply: ReplyOutcome::NoReply,
            }
        );
        late_ecu.join().unwrap();

        let stats = engine.stats();
        assert_eq!(stats.forwarded_a_to_b, 1);
        assert_eq!(stats.frames_received_b, 0);
        assert_eq!(stats.forwarded_b_to_a, 0);
        assert!(engine.bus_a().controller().transmitted().is_empty());
        // The late frame stays buffered on B; nothing reads it outside a cycle
        assert!(engine.bus_b().available());
        assert_eq!(engine.bus_b().stats().frames_buffered, 1);
    }

    #[test]
    fn forwards_oldest_frame_first() {
        let mut engine = engine();
        attach_ecu(&engine);
        for pid in [0x0c, 0x0d, 0x05] {
            engine.bus_a().controller().inject(request(pid));
        }
        for _ in 0..3 {
            engine.poll();
        }
        let pids: Vec<u8> = engine
            .bus_b()
            .controller()
            .transmitted()
            .iter()
            .map(|frame| frame.payload()[2])
            .collect();
        assert_eq!(pids, [0x0c, 0x0d, 0x05]);
    }

    #[test]
    fn disabled_gate_forwards_everything() {
        let mut engine = engine();
        attach_ecu(&engine);
        let handle = engine.activate_responder(34).unwrap();
        handle.set_level(Level::Low);
        assert!(!engine.is_responder_enabled());

        engine.bus_a().controller().inject(request(0x00));
        assert!(matches!(engine.poll(), CycleOutcome::Forwarded { .. }));
        assert_eq!(engine.stats().forwarded_a_to_b, 1);

        handle.set_level(Level::High);
        assert!(engine.is_responder_enabled());
        engine.bus_a().controller().inject(request(0x00));
        assert_eq!(
            engine.poll(),
            CycleOutcome::Answered(ResponseCode::SupportedPids)
        );
    }

    #[test]
    fn configured_monitor_status_is_applied() {
        let mut config = ProxyConfig::default();
        config.responder.monitor_status = Some([0x06, 0x41, 0x01, 0x00, 0x07, 0xff, 0x00, 0xcc]);
        let mut engine = engine_with(config);
        engine.activate_responder(34).unwrap();

        engine.bus_a().controller().inject(request(0x01));
        assert_eq!(
            engine.poll(),
            CycleOutcome::Answered(ResponseCode::MonitorStatus)
        );
        assert_eq!(
            engine.bus_a().controller().transmitted()[0].payload()[6],
            0x00
        );
    }

    #[test]
    fn forward_failure_counts_bus_a_error() {
        let mut engine = engine();
        engine.bus_b().controller().set_transmit_status(-3);
        engine.bus_a().controller().inject(request(0x0c));

        assert_eq!(
            engine.poll(),
            CycleOutcome::Forwarded {
                forward: Err(ControllerError::new(-3)),
                reply: ReplyOutcome::NoReply,
            }
        );
        let stats = engine.stats();
        assert_eq!(stats.errors_a, 1);
        assert_eq!(stats.forwarded_a_to_b, 0);
        assert_eq!(stats.frames_received_a, 1);
    }

    #[test]
    fn relay_failure_counts_bus_b_error() {
        let mut engine = engine();
        attach_ecu(&engine);
        engine.bus_a().controller().set_transmit_status(-5);
        engine.bus_a().controller().inject(request(0x0c));

        assert_eq!(
            engine.poll(),
            CycleOutcome::Forwarded {
                forward: Ok(()),
                reply: ReplyOutcome::RelayFailed(ControllerError::new(-5)),
            }
        );
        let stats = engine.stats();
        assert_eq!(stats.frames_received_b, 1);
        assert_eq!(stats.errors_b, 1);
        assert_eq!(stats.forwarded_b_to_a, 0);
    }

    #[test]
    fn bus_a_init_failure_is_attributed() {
        let registry = InterruptRegistry::new();
        let controller_a = Arc::new(VirtualController::new(0));
        let controller_b = Arc::new(VirtualController::new(1));
        controller_a.set_begin_status(-1);
        let engine = ProxyEngine::new(
            &ProxyConfig::default(),
            Arc::clone(&controller_a),
            Arc::clone(&controller_b),
            &registry,
        )
        .unwrap();

        let err = engine.begin().unwrap_err();
        assert_eq!(
            err,
            ProxyError::BusInit {
                bus: BusRole::A,
                source: ControllerError::new(-1),
            }
        );
        assert_eq!(err.status_code(), -11);
        assert!(!controller_b.is_running());
    }

    #[test]
    fn bus_b_init_failure_is_attributed() {
        let registry = InterruptRegistry::new();
        let controller_b = Arc::new(VirtualController::new(1));
        controller_b.set_begin_status(0);
        let engine = ProxyEngine::new(
            &ProxyConfig::default(),
            Arc::new(VirtualController::new(0)),
            controller_b,
            &registry,
        )
        .unwrap();

        let err = engine.begin().unwrap_err();
        assert_eq!(err.status_code(), -20);
        assert!(engine.bus_a().controller().is_running());
        assert!(!engine.detect_hardware());
    }

    #[test]
    fn responder_enable_reporting() {
        let mut engine = engine();
        assert!(!engine.is_responder_enabled());
        assert!(matches!(
            engine.activate_responder(40),
            Err(ConfigError::EnablePin { pin: 40 })
        ));
        assert!(!engine.is_responder_enabled());
        engine.activate_responder(34).unwrap();
        assert!(engine.is_responder_enabled());
    }

    #[test]
    fn reset_stats_zeroes_counters() {
        let mut engine = engine();
        engine.bus_a().controller().inject(request(0x0c));
        engine.poll();
        engine.reset_stats();
        assert_eq!(engine.stats(), ProxyStats::default());
    }

    #[test]
    fn stats_report_labels() {
        let report = ProxyStatsReport {
            name_a: "CAN1",
            name_b: "CAN2",
            stats: ProxyStats {
                forwarded_a_to_b: 4,
                errors_b: 1,
                ..ProxyStats::default()
            },
            responder: Some((false, 34)),
        }
        .to_string();
        let lines: Vec<&str> = report.lines().collect();
        assert_eq!(lines[0], "CANProxy Statistics:");
        assert_eq!(lines[3], "  Frames forwarded CAN1->CAN2: 4");
        assert_eq!(lines[6], "  CAN2 errors: 1");
        assert_eq!(lines[7], "  OBD2 Responder: DISABLED");
        assert_eq!(lines[8], "  OBD2 GPIO Pin: 34");

        let bare = ProxyStatsReport {
            name_a: "CAN1",
            name_b: "CAN2",
            stats: ProxyStats::default(),
            responder: None,
        }
        .to_string();
        assert_eq!(bare.lines().count(), 7);
    }
}
