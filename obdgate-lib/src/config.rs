//! Construction-time configuration for the proxy and its two buses.

use crate::controller::InstanceId;
use crate::registry::MAX_INSTANCES;
use crate::ring::{DEFAULT_CAPACITY, MAX_CAPACITY, MIN_CAPACITY};
use derive_more::{Display, Error, From};
use log::LevelFilter;
use serde::{Deserialize, Serialize};

/// Highest GPIO number the enable input may use.
pub const MAX_ENABLE_PIN: u8 = 39;

/// Configurable log level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
}

impl LogLevel {
    #[must_use]
    pub const fn as_level_filter(self) -> LevelFilter {
        match self {
            Self::Off => LevelFilter::Off,
            Self::Error => LevelFilter::Error,
            Self::Warn => LevelFilter::Warn,
            Self::Info => LevelFilter::Info,
            Self::Debug => LevelFilter::Debug,
        }
    }
}

/// One physical bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BusConfig {
    /// Slot in the interrupt registry
    pub instance_id: InstanceId,
    /// Name used in log lines (e.g. "CAN1")
    pub name: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Controller oscillator frequency in Hz
    #[serde(default = "default_clock_frequency")]
    pub clock_frequency: u32,
}

const fn default_baud_rate() -> u32 {
    500_000
}

const fn default_clock_frequency() -> u32 {
    8_000_000
}

impl BusConfig {
    #[must_use]
    pub fn new(instance_id: InstanceId, name: &str) -> Self {
        Self {
            instance_id,
            name: name.to_string(),
            baud_rate: default_baud_rate(),
            clock_frequency: default_clock_frequency(),
        }
    }
}

/// Local OBD2 responder settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponderConfig {
    /// Attach the responder to the scan tool bus at startup
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// GPIO that gates the responder (high = answer locally)
    #[serde(default = "default_enable_pin")]
    pub enable_pin: u8,
    /// Replacement payload for the monitor status reply (mode 01 PID 01)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor_status: Option<[u8; 8]>,
}

const fn default_true() -> bool {
    true
}

const fn default_enable_pin() -> u8 {
    34
}

impl Default for ResponderConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            enable_pin: default_enable_pin(),
            monitor_status: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Scan tool side
    #[serde(default = "default_bus_a")]
    pub bus_a: BusConfig,
    /// ECU side
    #[serde(default = "default_bus_b")]
    pub bus_b: BusConfig,
    /// Active ring slots per bus (holds one fewer frame)
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    /// Bus settle time applied before each read (microseconds)
    #[serde(default = "default_settle_delay_us")]
    pub settle_delay_us: u32,
    /// How long to wait for the ECU to answer a forwarded frame
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,
    /// Interval between statistics dumps
    #[serde(default = "default_stats_interval_ms")]
    pub stats_interval_ms: u64,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default)]
    pub responder: ResponderConfig,
}

fn default_bus_a() -> BusConfig {
    BusConfig::new(0, "CAN1")
}

fn default_bus_b() -> BusConfig {
    BusConfig::new(1, "CAN2")
}

const fn default_buffer_capacity() -> usize {
    DEFAULT_CAPACITY
}

const fn default_settle_delay_us() -> u32 {
    50
}

const fn default_reply_timeout_ms() -> u64 {
    50
}

const fn default_stats_interval_ms() -> u64 {
    10_000
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bus_a: default_bus_a(),
            bus_b: default_bus_b(),
            buffer_capacity: default_buffer_capacity(),
            settle_delay_us: default_settle_delay_us(),
            reply_timeout_ms: default_reply_timeout_ms(),
            stats_interval_ms: default_stats_interval_ms(),
            log_level: LogLevel::default(),
            responder: ResponderConfig::default(),
        }
    }
}

#[derive(Debug, Display, Error, From)]
pub enum ConfigError {
    #[display("invalid config JSON: {_0}")]
    #[from]
    Json(serde_json::Error),
    #[display("buffer capacity {capacity} is outside 2..=1024")]
    Capacity { capacity: usize },
    #[display("bus '{name}' uses instance id {id}, registry holds 4")]
    InstanceRange { name: String, id: InstanceId },
    #[display("both buses use instance id {id}")]
    DuplicateInstance { id: InstanceId },
    #[display("enable pin {pin} is above GPIO 39")]
    EnablePin { pin: u8 },
}

impl ProxyConfig {
    /// Parse and validate a JSON document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_CAPACITY..=MAX_CAPACITY).contains(&self.buffer_capacity) {
            return Err(ConfigError::Capacity {
                capacity: self.buffer_capacity,
            });
        }
        for bus in [&self.bus_a, &self.bus_b] {
            if usize::from(bus.instance_id) >= MAX_INSTANCES {
                return Err(ConfigError::InstanceRange {
                    name: bus.name.clone(),
                    id: bus.instance_id,
                });
            }
        }
        if self.bus_a.instance_id == self.bus_b.instance_id {
            return Err(ConfigError::DuplicateInstance {
                id: self.bus_a.instance_id,
            });
        }
        if self.responder.enable_pin > MAX_ENABLE_PIN {
            return Err(ConfigError::EnablePin {
                pin: self.responder.enable_pin,
            });
        }
        Ok(())
    }
}
