// Loop rate, topics, serial defaults, safety thresholds and the startup config file
use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::can::CanError;
use crate::messages::CommandError;
use crate::motor::RoboClawError;

// Runtime loop frequency (10ms cycle)
pub const LOOP_HZ: u64 = 100;

// Zenoh topics
pub const TOPIC_CMD: &str = "lizard/cmd"; // one command line per sample
pub const TOPIC_STATE: &str = "lizard/state"; // "<module> <status>" lines

// Name the bare `pw` shortcut is routed to
pub const DEFAULT_DRIVE_ALIAS: &str = "dm";

// RoboClaw serial defaults
pub const ROBOCLAW_ADDRESS: u8 = 128;
pub const ROBOCLAW_BAUDRATE: u32 = 38_400;

// SLCAN adapter default bitrate
pub const CAN_BITRATE: u32 = 1_000_000;

// Drive safety limits
pub const MAX_TEMPERATURE_C: f64 = 70.0;
pub const SPEED_ACCELERATION: f64 = 0.7; // m/s^2, converted to counts/s^2 per send
pub const BUMP_LOCKOUT_MS: u64 = 2_000;
pub const BUMPER_DEBOUNCE_MS: u64 = 1_000;

// Drive phase durations (ms)
pub const POWER_HOLD_MS: u64 = 500;
pub const SPEED_HOLD_MS: u64 = 200;
pub const SPEED_RAMP_END_MS: u64 = 500;
pub const SPEED_ZERO_END_MS: u64 = 700;
pub const BRAKE_HOLD_MS: u64 = 1_000;
pub const REVERSE_MS: u64 = 400;

/// Startup configuration, read once from a JSON file
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_loop_hz")]
    pub loop_hz: u64,
    #[serde(default = "default_drive_alias")]
    pub drive_alias: String,
    #[serde(default)]
    pub can: Option<CanConfig>,
    pub modules: Vec<ModuleConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CanConfig {
    pub port: String,
    #[serde(default = "default_can_bitrate")]
    pub bitrate: u32,
}

/// One controller instance; `params` are replayed through `set` at construction
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModuleConfig {
    Drive {
        name: String,
        port: String,
        #[serde(default = "default_address")]
        address: u8,
        #[serde(default = "default_baud")]
        baud: u32,
        #[serde(default)]
        bumper: Option<InputConfig>,
        #[serde(default)]
        params: BTreeMap<String, String>,
    },
    Axis {
        name: String,
        can_id: String,
        #[serde(default)]
        home_switch: Option<InputConfig>,
        #[serde(default)]
        params: BTreeMap<String, String>,
    },
}

impl ModuleConfig {
    pub fn name(&self) -> &str {
        match self {
            ModuleConfig::Drive { name, .. } | ModuleConfig::Axis { name, .. } => name,
        }
    }
}

/// A digital input wired to a modem status line of a serial adapter
#[derive(Debug, Clone, Deserialize)]
pub struct InputConfig {
    pub port: String,
    pub line: crate::io::ModemLine,
    #[serde(default)]
    pub active_low: bool,
}

fn default_loop_hz() -> u64 {
    LOOP_HZ
}

fn default_drive_alias() -> String {
    DEFAULT_DRIVE_ALIAS.to_string()
}

fn default_can_bitrate() -> u32 {
    CAN_BITRATE
}

fn default_address() -> u8 {
    ROBOCLAW_ADDRESS
}

fn default_baud() -> u32 {
    ROBOCLAW_BAUDRATE
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid CAN id {0:?} (expected hex, e.g. \"0x060\")")]
    InvalidCanId(String),

    #[error("Module {0} is configured twice")]
    DuplicateModule(String),

    #[error("Axis {0} needs a `can` section")]
    MissingCan(String),

    #[error("Parameter for module {module}: {source}")]
    Parameter {
        module: String,
        #[source]
        source: CommandError,
    },

    #[error(transparent)]
    RoboClaw(#[from] RoboClawError),

    #[error(transparent)]
    Can(#[from] CanError),

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),
}

impl RuntimeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Parse an axis base id such as "0x060", "060" or "0X60"
pub fn parse_can_id(text: &str) -> Result<u16, ConfigError> {
    let digits = text
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    u16::from_str_radix(digits, 16)
        .ok()
        .filter(|id| *id <= 0x7FF)
        .ok_or_else(|| ConfigError::InvalidCanId(text.to_string()))
}
