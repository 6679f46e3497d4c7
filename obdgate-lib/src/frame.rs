//! CAN frame value type shared by every layer of the proxy.

use std::fmt;

/// Maximum payload length of a classic CAN frame.
pub const MAX_DATA_LEN: usize = 8;

/// A single captured CAN frame.
///
/// Frames are plain values: once captured they are copied between the ring
/// buffer, the responder and the outgoing bus, never mutated in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Frame {
    /// 11-bit standard or 29-bit extended identifier.
    pub id: u32,
    /// Extended (29-bit) addressing.
    pub is_extended: bool,
    /// Remote transmission request.
    pub is_remote: bool,
    /// Frame was flagged as a retransmission by the controller.
    pub is_retransmit: bool,
    len: u8,
    data: [u8; MAX_DATA_LEN],
    /// Capture time in monotonic milliseconds.
    pub timestamp_ms: u64,
}

impl Frame {
    /// The sentinel returned when a stream has nothing buffered (id 0, no payload).
    pub const EMPTY: Self = Self {
        id: 0,
        is_extended: false,
        is_remote: false,
        is_retransmit: false,
        len: 0,
        data: [0; MAX_DATA_LEN],
        timestamp_ms: 0,
    };

    /// Build a standard data frame. Payloads longer than 8 bytes are truncated.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // len is clamped to 8
    pub fn new(id: u32, payload: &[u8]) -> Self {
        let len = payload.len().min(MAX_DATA_LEN);
        let mut data = [0u8; MAX_DATA_LEN];
        data[..len].copy_from_slice(&payload[..len]);
        Self {
            id,
            len: len as u8,
            data,
            ..Self::EMPTY
        }
    }

    /// Builder-style extended addressing flag.
    #[must_use]
    pub const fn extended(mut self) -> Self {
        self.is_extended = true;
        self
    }

    /// Builder-style remote request flag.
    #[must_use]
    pub const fn remote(mut self) -> Self {
        self.is_remote = true;
        self
    }

    /// Builder-style retransmission flag.
    #[must_use]
    pub const fn retransmit(mut self) -> Self {
        self.is_retransmit = true;
        self
    }

    #[must_use]
    pub const fn at(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    /// Number of meaningful payload bytes (0..=8).
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len as usize
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The meaningful part of the payload.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len()]
    }

    /// True for the empty sentinel returned by reads on an empty stream.
    #[must_use]
    pub fn is_sentinel(&self) -> bool {
        self.id == 0 && self.len == 0
    }

    /// Payload rendered as a bit string, eight characters per byte.
    #[must_use]
    pub fn payload_bits(&self) -> String {
        self.payload().iter().map(|b| format!("{b:08b}")).collect()
    }
}

/// Debug line format used by the telemetry sink.
impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Frame data: time: {}, id={:x} length: {}, hex: {}, binary: {}",
            self.timestamp_ms,
            self.id,
            self.len,
            hex::encode(self.payload()),
            self.payload_bits()
        )
    }
}
