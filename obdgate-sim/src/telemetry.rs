//! Telemetry sink: one plain text line per log record.
//!
//! On the board these lines go out over UDP broadcast; here any byte writer
//! will do.

use log::{LevelFilter, Log, Metadata, Record};
use obdgate_lib::clock;
use std::io::Write;
use std::sync::{Mutex, PoisonError};

pub struct TelemetryLogger {
    level: LevelFilter,
    out: Mutex<Box<dyn Write + Send>>,
}

impl TelemetryLogger {
    pub fn new(out: Box<dyn Write + Send>, level: LevelFilter) -> Self {
        Self {
            level,
            out: Mutex::new(out),
        }
    }

    /// Install as the global logger.
    pub fn install(self) -> Result<(), log::SetLoggerError> {
        let level = self.level;
        log::set_boxed_logger(Box::new(self))?;
        log::set_max_level(level);
        Ok(())
    }
}

impl Log for TelemetryLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        // Nowhere to report a failing log sink
        let _ = writeln!(
            out,
            "{:>8} {:<5} {}",
            clock::millis(),
            record.level(),
            record.args()
        );
    }

    fn flush(&self) {
        let _ = self
            .out
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush();
    }
}
