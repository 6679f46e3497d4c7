//! Monotonic time helpers in the style of a microcontroller tick counter.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Milliseconds since the first call into this module.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // u64 millis outlives the hardware
pub fn millis() -> u64 {
    epoch().elapsed().as_millis() as u64
}

/// Busy-wait for `micros` microseconds on the monotonic clock.
pub fn delay_micros(micros: u32) {
    if micros == 0 {
        return;
    }
    let deadline = Instant::now() + Duration::from_micros(u64::from(micros));
    while Instant::now() < deadline {
        std::hint::spin_loop();
    }
}
