//! Local OBD2 responder.
//!
//! Emulates just enough of an engine ECU to answer a handful of mode 01/03/07
//! requests on the scan tool bus. Everything else is left for the proxy to
//! forward. Only the newest buffered request is ever answered: after a reply
//! the stream is cleared, since older requests are stale by then.

use crate::clock;
use crate::controller::CanController;
use crate::frame::Frame;
use crate::stream::FrameStream;
use log::debug;

/// Functional (broadcast) request identifier used by scan tools.
pub const FUNCTIONAL_REQUEST_ID: u32 = 0x7df;

/// Identifier the emulated engine ECU replies with.
pub const ECU_REPLY_ID: u32 = 0x7e8;

/// Mode 01 PID 00: supported PIDs 01-20.
pub const SUPPORTED_PIDS_REPLY: [u8; 8] = [0x06, 0x41, 0x00, 0xbe, 0x1f, 0xe8, 0x1b, 0xcc];

/// Mode 01 PID 01 default: all monitors complete except the O2 sensor.
pub const MONITOR_STATUS_REPLY: [u8; 8] = [0x06, 0x41, 0x01, 0x00, 0x07, 0xff, 0x20, 0xcc];

/// Mode 01 PID 01 with every monitor complete.
pub const MONITOR_STATUS_ALL_READY: [u8; 8] = [0x06, 0x41, 0x01, 0x00, 0x07, 0xff, 0x00, 0xcc];

/// Mode 03/07: no trouble codes.
pub const NO_TROUBLE_CODES_REPLY: [u8; 8] = [0x02, 0x43, 0x00, 0xcc, 0xcc, 0xcc, 0xcc, 0xcc];

/// Mode 01 PID 11 reply.
pub const OXYGEN_SENSOR_REPLY: [u8; 8] = [0x04, 0x41, 0x11, 0x80, 0x80, 0xcc, 0xcc, 0xcc];

/// Diagnostic services the responder answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticService {
    SupportedPids,
    MonitorStatus,
    StoredTroubleCodes,
    PendingTroubleCodes,
    OxygenSensor,
}

impl DiagnosticService {
    /// Request payload prefixes, in match order.
    const TABLE: [(Self, &'static [u8]); 5] = [
        (Self::SupportedPids, &[0x02, 0x01, 0x00]),
        (Self::MonitorStatus, &[0x02, 0x01, 0x01]),
        (Self::StoredTroubleCodes, &[0x01, 0x03]),
        (Self::PendingTroubleCodes, &[0x01, 0x07]),
        (Self::OxygenSensor, &[0x02, 0x01, 0x11]),
    ];

    /// Find the service a functional request asks for.
    #[must_use]
    pub fn match_request(frame: &Frame) -> Option<Self> {
        if frame.id != FUNCTIONAL_REQUEST_ID {
            return None;
        }
        Self::TABLE
            .iter()
            .find(|(_, prefix)| frame.payload().starts_with(prefix))
            .map(|&(service, _)| service)
    }

    #[must_use]
    pub const fn code(self) -> ResponseCode {
        match self {
            Self::SupportedPids => ResponseCode::SupportedPids,
            Self::MonitorStatus => ResponseCode::MonitorStatus,
            Self::StoredTroubleCodes => ResponseCode::StoredTroubleCodes,
            Self::PendingTroubleCodes => ResponseCode::PendingTroubleCodes,
            Self::OxygenSensor => ResponseCode::OxygenSensor,
        }
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::SupportedPids => "supported PIDs",
            Self::MonitorStatus => "monitor status",
            Self::StoredTroubleCodes => "trouble codes",
            Self::PendingTroubleCodes => "pending trouble codes",
            Self::OxygenSensor => "oxygen sensor",
        }
    }
}

/// Outcome of one [`Responder::handle_next_frame`] call.
///
/// Positive codes mean the request was answered locally; zero and negative
/// codes mean it was left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum ResponseCode {
    SupportedPids = 1,
    MonitorStatus = 2,
    StoredTroubleCodes = 3,
    OxygenSensor = 4,
    PendingTroubleCodes = 5,
    NoFrame = 0,
    RemoteRequest = -1,
    Extended = -2,
    SelfOriginated = -3,
    Unknown = -4,
}

impl ResponseCode {
    #[must_use]
    pub const fn code(self) -> i8 {
        self as i8
    }

    /// True when a reply was sent and the frame must not be forwarded.
    #[must_use]
    pub const fn is_handled(self) -> bool {
        self.code() > 0
    }
}

/// Canned-reply table bound to one stream by its owner.
#[derive(Debug, Clone)]
pub struct Responder {
    monitor_status: Frame,
}

impl Default for Responder {
    fn default() -> Self {
        Self {
            monitor_status: Frame::new(ECU_REPLY_ID, &MONITOR_STATUS_REPLY),
        }
    }
}

impl Responder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the monitor status reply, which reports vehicle-specific
    /// readiness bits.
    pub fn set_monitor_status_frame(&mut self, frame: Frame) {
        self.monitor_status = frame;
    }

    /// Classify a frame without acting on it.
    #[must_use]
    pub fn classify(frame: &Frame) -> Result<DiagnosticService, ResponseCode> {
        if frame.is_retransmit || frame.is_remote {
            Err(ResponseCode::RemoteRequest)
        } else if frame.is_extended {
            Err(ResponseCode::Extended)
        } else if frame.id == ECU_REPLY_ID {
            Err(ResponseCode::SelfOriginated)
        } else {
            DiagnosticService::match_request(frame).ok_or(ResponseCode::Unknown)
        }
    }

    /// Reply frame for `service`.
    #[must_use]
    pub fn reply_for(&self, service: DiagnosticService) -> Frame {
        let payload = match service {
            DiagnosticService::MonitorStatus => return self.monitor_status.at(clock::millis()),
            DiagnosticService::SupportedPids => &SUPPORTED_PIDS_REPLY,
            DiagnosticService::StoredTroubleCodes | DiagnosticService::PendingTroubleCodes => {
                &NO_TROUBLE_CODES_REPLY
            }
            DiagnosticService::OxygenSensor => &OXYGEN_SENSOR_REPLY,
        };
        Frame::new(ECU_REPLY_ID, payload).at(clock::millis())
    }

    /// Look at the newest frame on `stream` and answer it if it is one of
    /// ours. On a match exactly one reply is sent and the stream is cleared;
    /// otherwise the stream is left untouched.
    pub fn handle_next_frame<C: CanController>(&self, stream: &mut FrameStream<C>) -> ResponseCode {
        if !stream.available() {
            return ResponseCode::NoFrame;
        }

        let frame = stream.peek_latest();
        debug!("OBD2Responder: Processing frame.");
        debug!("{frame}");

        let service = match Self::classify(&frame) {
            Ok(service) => service,
            Err(code) => {
                if code == ResponseCode::Unknown {
                    debug!("OBD2Responder: Unknown frame");
                }
                return code;
            }
        };

        debug!("OBD2Responder: Received request for {}", service.label());
        let reply = self.reply_for(service);
        // The request stays consumed even when the reply fails, so the ECU
        // never sees it.
        if let Err(e) = stream.send(&reply) {
            debug!(
                "OBD2Responder: Reply for {} lost on {}, error {}",
                service.label(),
                stream.name(),
                e.code
            );
        }
        stream.clear();
        service.code()
    }
}
