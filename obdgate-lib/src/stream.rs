//! Interrupt-fed frame stream for one physical bus.
//!
//! Architecture:
//! - Producer: the driver's receive interrupt dispatches through the
//!   [`InterruptRegistry`] into [`StreamCore::receive_one`], which pulls one
//!   frame from the controller and pushes it onto the ring's [`Producer`]
//!   half. It never blocks, never logs, and drops the frame when the ring is
//!   full or another interrupt is mid-push.
//! - Consumer: the poll loop owns the stream and with it the [`Consumer`]
//!   half. [`FrameStream::read`] and [`FrameStream::clear`] take `&mut self`,
//!   so there is only ever one reader.

use crate::clock;
use crate::config::BusConfig;
use crate::controller::{CanController, ControllerError};
use crate::frame::Frame;
use crate::registry::{InterruptRegistry, InterruptTarget, RegistryError};
use crate::ring::{self, Consumer, Producer};
use log::{debug, error, info, warn};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Running counters, shared between the interrupt and the poll loop.
#[derive(Debug, Default)]
struct StreamCounters {
    received: AtomicU64,
    sent: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
    interrupts: AtomicU64,
}

impl StreamCounters {
    fn reset(&self) {
        self.received.store(0, Ordering::Relaxed);
        self.sent.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.interrupts.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time copy of a stream's statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub frames_received: u64,
    /// Frames waiting in the ring right now
    pub frames_buffered: usize,
    pub buffer_head: usize,
    pub buffer_tail: usize,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub errors: u64,
    pub interrupts: u64,
}

/// Ring and counters reachable from interrupt context.
struct StreamCore<C> {
    controller: C,
    producer: Producer,
    counters: StreamCounters,
}

impl<C: CanController> StreamCore<C> {
    /// Producer routine: fetch exactly one frame and enqueue it.
    fn receive_one(&self) {
        self.counters.interrupts.fetch_add(1, Ordering::Relaxed);

        let Some(frame) = self.controller.receive_frame() else {
            return;
        };

        if self.producer.push(frame) {
            self.counters.received.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl<C: CanController> InterruptTarget for StreamCore<C> {
    fn on_interrupt(&self) {
        self.receive_one();
    }
}

pub struct FrameStream<C> {
    config: BusConfig,
    settle_delay_us: u32,
    core: Arc<StreamCore<C>>,
    consumer: Consumer,
    registry: Arc<InterruptRegistry>,
}

impl<C: CanController + 'static> FrameStream<C> {
    /// Wrap `controller` and claim `config.instance_id` in `registry`.
    pub fn new(
        config: BusConfig,
        controller: C,
        capacity: usize,
        settle_delay_us: u32,
        registry: &Arc<InterruptRegistry>,
    ) -> Result<Self, RegistryError> {
        let (producer, consumer) = ring::frame_ring(capacity);
        let core = Arc::new(StreamCore {
            controller,
            producer,
            counters: StreamCounters::default(),
        });

        let target: Arc<dyn InterruptTarget> = core.clone();
        registry.register(config.instance_id, Arc::downgrade(&target))?;

        Ok(Self {
            config,
            settle_delay_us,
            core,
            consumer,
            registry: Arc::clone(registry),
        })
    }
}

impl<C: CanController> FrameStream<C> {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The underlying controller, for diagnostics and tests.
    #[must_use]
    pub fn controller(&self) -> &C {
        &self.core.controller
    }

    /// Install the receive callback and bring the controller onto the bus.
    pub fn begin(&self) -> Result<(), ControllerError> {
        info!(
            "CANStream: Initializing {} ({} slot buffer)",
            self.config.name,
            self.consumer.capacity()
        );

        self.core
            .controller
            .register_receive_callback(self.registry.dispatcher());

        match self.core.controller.begin(self.config.baud_rate, true) {
            Ok(()) => {
                info!("CANStream: Successfully initialized {}", self.config.name);
                Ok(())
            }
            Err(e) => {
                error!(
                    "CANStream: Failed to initialize {} with error {}",
                    self.config.name, e.code
                );
                self.core.counters.errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    pub fn end(&self) {
        self.core.controller.end();
        info!("CANStream: Ended {}", self.config.name);
    }

    /// True if at least one frame is buffered.
    #[must_use]
    pub fn available(&self) -> bool {
        !self.consumer.is_empty()
    }

    /// Dequeue the oldest buffered frame, or [`Frame::EMPTY`] if none.
    ///
    /// Waits out the settle delay first so the frame's ACK, end-of-frame and
    /// inter-frame space have elapsed on the wire.
    pub fn read(&mut self) -> Frame {
        clock::delay_micros(self.settle_delay_us);
        self.consumer.pop().unwrap_or(Frame::EMPTY)
    }

    /// Copy of the most recently received frame, or [`Frame::EMPTY`] if none.
    /// Nothing is removed.
    pub fn peek_latest(&self) -> Frame {
        clock::delay_micros(self.settle_delay_us);
        self.consumer.peek_latest().unwrap_or(Frame::EMPTY)
    }

    /// Discard every buffered frame.
    pub fn clear(&mut self) {
        self.consumer.clear();
    }

    /// Run the producer routine directly, as the receive interrupt would.
    pub fn handle_interrupt(&self) {
        self.core.receive_one();
    }

    /// Transmit `frame` once; failures are counted, never retried.
    pub fn send(&self, frame: &Frame) -> Result<(), ControllerError> {
        match self.core.controller.transmit_frame(frame) {
            Ok(()) => {
                self.core.counters.sent.fetch_add(1, Ordering::Relaxed);
                debug!("CANStream: Sent frame on {}", self.config.name);
                debug!("{frame}");
                Ok(())
            }
            Err(e) => {
                self.core.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "CANStream: Failed to send frame on {}, error {}",
                    self.config.name, e.code
                );
                Err(e)
            }
        }
    }

    #[must_use]
    pub fn stats(&self) -> StreamStats {
        let counters = &self.core.counters;
        let (buffer_head, buffer_tail) = self.consumer.indices();
        StreamStats {
            frames_received: counters.received.load(Ordering::Relaxed),
            frames_buffered: self.consumer.len(),
            buffer_head,
            buffer_tail,
            frames_sent: counters.sent.load(Ordering::Relaxed),
            frames_dropped: counters.dropped.load(Ordering::Relaxed),
            errors: counters.errors.load(Ordering::Relaxed),
            interrupts: counters.interrupts.load(Ordering::Relaxed),
        }
    }

    pub fn reset_stats(&self) {
        self.core.counters.reset();
    }

    pub fn log_stats(&self) {
        let report = StatsReport {
            name: &self.config.name,
            stats: self.stats(),
        };
        for line in report.to_string().lines() {
            info!("{line}");
        }
    }

    #[must_use]
    pub fn detect_hardware(&self) -> bool {
        self.core.controller.detect_hardware()
    }

    pub fn log_hardware_status(&self) {
        info!(
            "CANStream {} Hardware: {}",
            self.config.name,
            if self.detect_hardware() {
                "DETECTED"
            } else {
                "NOT DETECTED"
            }
        );
    }

    pub fn dump_registers(&self) {
        info!("CANStream {} Register Dump:", self.config.name);
        for (address, value) in self.core.controller.register_dump() {
            info!("  0x{address:02x}: 0x{value:02x}");
        }
    }
}

/// Statistics dump with the fixed field labels the status page parses.
pub struct StatsReport<'a> {
    pub name: &'a str,
    pub stats: StreamStats,
}

impl fmt::Display for StatsReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = &self.stats;
        writeln!(f, "CANStream {} Statistics:", self.name)?;
        writeln!(f, "  Frames received: {}", s.frames_received)?;
        writeln!(f, "  Frames buffered: {}", s.frames_buffered)?;
        writeln!(f, "  Ring buffer head: {}", s.buffer_head)?;
        writeln!(f, "  Ring buffer tail: {}", s.buffer_tail)?;
        writeln!(f, "  Frames sent: {}", s.frames_sent)?;
        writeln!(f, "  Frames dropped: {}", s.frames_dropped)?;
        writeln!(f, "  Errors: {}", s.errors)?;
        write!(f, "  Interrupts: {}", s.interrupts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_bus::VirtualController;

    fn stream(capacity: usize) -> FrameStream<Arc<VirtualController>> {
        let registry = InterruptRegistry::new();
        let controller = Arc::new(VirtualController::new(0));
        let stream = FrameStream::new(BusConfig::new(0, "CAN1"), controller, capacity, 0, &registry)
            .unwrap();
        stream.begin().unwrap();
        stream
    }

    fn request(pid: u8) -> Frame {
        Frame::new(0x7df, &[0x02, 0x01, pid])
    }

    #[test]
    fn fifo_read_order() {
        let mut stream = stream(20);
        for pid in 0..5 {
            stream.controller().inject(request(pid));
        }
        for pid in 0..5 {
            assert!(stream.available());
            assert_eq!(stream.read().payload(), request(pid).payload());
        }
        assert!(!stream.available());
    }

    #[test]
    fn read_on_empty_returns_sentinel() {
        let mut stream = stream(20);
        assert!(!stream.available());
        assert!(stream.read().is_sentinel());
        assert!(stream.peek_latest().is_sentinel());
    }

    #[test]
    fn peek_latest_does_not_consume() {
        let mut stream = stream(20);
        for pid in 0..3 {
            stream.controller().inject(request(pid));
        }
        assert_eq!(stream.peek_latest().payload(), request(2).payload());
        assert_eq!(stream.stats().frames_buffered, 3);

        // Still the newest after the oldest is consumed
        stream.read();
        assert_eq!(stream.peek_latest().payload(), request(2).payload());
        assert_eq!(stream.stats().frames_buffered, 2);
    }

    #[test]
    fn clear_then_read_gives_sentinel() {
        let mut stream = stream(20);
        for pid in 0..4 {
            stream.controller().inject(request(pid));
        }
        stream.clear();
        assert!(!stream.available());
        assert!(stream.read().is_sentinel());
    }

    #[test]
    fn overflow_drops_newest_and_counts() {
        let mut stream = stream(4);
        for pid in 0..6 {
            stream.controller().inject(request(pid));
        }
        let stats = stream.stats();
        assert_eq!(stats.frames_received, 3);
        assert_eq!(stats.frames_dropped, 3);
        assert_eq!(stats.interrupts, 6);
        for pid in 0..3 {
            assert_eq!(stream.read().payload(), request(pid).payload());
        }
    }

    #[test]
    fn empty_interrupt_leaves_buffer_alone() {
        let stream = stream(20);
        stream.handle_interrupt();
        let stats = stream.stats();
        assert_eq!(stats.interrupts, 1);
        assert_eq!(stats.frames_received, 0);
        assert!(!stream.available());
    }

    #[test]
    fn send_counts_success_and_failure() {
        let stream = stream(20);
        assert!(stream.send(&request(0x0c)).is_ok());
        stream.controller().set_transmit_status(-2);
        assert_eq!(stream.send(&request(0x0c)), Err(ControllerError::new(-2)));

        let stats = stream.stats();
        assert_eq!(stats.frames_sent, 1);
        assert_eq!(stats.errors, 1);
        assert_eq!(stream.controller().transmitted().len(), 1);
    }

    #[test]
    fn failed_begin_counts_error() {
        let registry = InterruptRegistry::new();
        let controller = Arc::new(VirtualController::new(0));
        controller.set_begin_status(-1);
        let stream =
            FrameStream::new(BusConfig::new(0, "CAN1"), controller, 20, 0, &registry).unwrap();
        assert_eq!(stream.begin(), Err(ControllerError::new(-1)));
        assert_eq!(stream.stats().errors, 1);
    }

    #[test]
    fn concurrent_interrupts_never_lose_counted_frames() {
        let mut stream = stream(1024);
        let injectors: Vec<_> = (0..2)
            .map(|_| {
                let controller = Arc::clone(stream.controller());
                std::thread::spawn(move || {
                    for pid in 0..200u8 {
                        controller.inject(request(pid));
                    }
                })
            })
            .collect();
        for injector in injectors {
            injector.join().unwrap();
        }

        let stats = stream.stats();
        assert_eq!(stats.interrupts, 400);
        assert_eq!(stats.frames_received + stats.frames_dropped, 400);
        assert_eq!(stats.frames_buffered as u64, stats.frames_received);

        let mut drained = 0;
        while stream.available() {
            assert!(!stream.read().is_sentinel());
            drained += 1;
        }
        assert_eq!(drained, stats.frames_received);
    }

    #[test]
    fn reset_stats_zeroes_counters() {
        let stream = stream(20);
        stream.controller().inject(request(0));
        stream.send(&request(0)).unwrap();
        stream.reset_stats();
        let stats = stream.stats();
        assert_eq!(stats.frames_received, 0);
        assert_eq!(stats.frames_sent, 0);
        assert_eq!(stats.interrupts, 0);
        // Buffered frames are not statistics
        assert_eq!(stats.frames_buffered, 1);
    }

    #[test]
    fn duplicate_instance_is_rejected() {
        let registry = InterruptRegistry::new();
        let first = FrameStream::new(
            BusConfig::new(1, "CAN1"),
            VirtualController::new(1),
            20,
            0,
            &registry,
        );
        assert!(first.is_ok());
        let second = FrameStream::new(
            BusConfig::new(1, "CAN2"),
            VirtualController::new(1),
            20,
            0,
            &registry,
        );
        assert!(matches!(second, Err(RegistryError::Taken { id: 1 })));
    }

    #[test]
    fn stats_report_labels() {
        let report = StatsReport {
            name: "CAN1",
            stats: StreamStats {
                frames_received: 7,
                frames_dropped: 2,
                ..StreamStats::default()
            },
        }
        .to_string();
        let lines: Vec<&str> = report.lines().collect();
        assert_eq!(lines[0], "CANStream CAN1 Statistics:");
        assert_eq!(lines[1], "  Frames received: 7");
        assert_eq!(lines[6], "  Frames dropped: 2");
        assert_eq!(lines.len(), 9);
    }
}
