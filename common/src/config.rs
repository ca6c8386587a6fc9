use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Interval, OperatingMode};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_client_id: String,
    pub mqtt_user: String,
    pub mqtt_pass: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_client_id: "pump-controller".to_string(),
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ControllerConfig {
    pub network: NetworkConfig,
    pub relay_pin: i32,
    pub data_dir: String,
    /// Publish `off` instead of the legacy `offS` relay status literal.
    pub normalize_off_payload: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            relay_pin: 12,
            data_dir: "./.pump".to_string(),
            normalize_off_payload: false,
        }
    }
}

impl ControllerConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();

        if self.relay_pin < 0 {
            self.relay_pin = defaults.relay_pin;
        }
        if self.data_dir.trim().is_empty() {
            self.data_dir = defaults.data_dir;
        }

        let network = &mut self.network;
        if network.mqtt_host.trim().is_empty() {
            network.mqtt_host = defaults.network.mqtt_host;
        }
        if network.mqtt_port == 0 {
            network.mqtt_port = defaults.network.mqtt_port;
        }
        if network.mqtt_client_id.trim().is_empty() {
            network.mqtt_client_id = defaults.network.mqtt_client_id;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error("record is missing the {0} line")]
    MissingLine(&'static str),
    #[error("invalid {field} value `{value}`")]
    InvalidNumber { field: &'static str, value: String },
    #[error("stored interval {0} is not positive")]
    NonPositiveInterval(i64),
    #[error("unknown mode code {0}")]
    UnknownMode(i64),
    #[error("unexpected data after the mode line")]
    TrailingData,
}

/// Durable `(interval, mode)` pair, stored as two decimal lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PersistedRecord {
    pub interval: Interval,
    pub mode: OperatingMode,
}

impl PersistedRecord {
    /// Parses exactly an interval line followed by a mode line. A final newline
    /// is optional and CRLF line endings are accepted; anything after the mode
    /// line is rejected.
    pub fn parse(raw: &str) -> Result<Self, RecordError> {
        let mut lines = raw
            .split('\n')
            .map(|line| line.strip_suffix('\r').unwrap_or(line));

        let interval_ms = parse_field(lines.next(), "interval")?;
        let mode_code = parse_field(lines.next(), "mode")?;

        match (lines.next(), lines.next()) {
            (None, _) | (Some(""), None) => {}
            _ => return Err(RecordError::TrailingData),
        }

        let interval = Interval::from_millis(interval_ms)
            .ok_or(RecordError::NonPositiveInterval(interval_ms))?;
        let mode =
            OperatingMode::from_code(mode_code).ok_or(RecordError::UnknownMode(mode_code))?;

        Ok(Self { interval, mode })
    }

    pub fn encode(&self) -> String {
        format!("{}\n{}\n", self.interval.as_millis(), self.mode.code())
    }
}

impl FromStr for PersistedRecord {
    type Err = RecordError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::parse(raw)
    }
}

impl fmt::Display for PersistedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "interval={}ms mode={}",
            self.interval.as_millis(),
            self.mode.as_str()
        )
    }
}

fn parse_field(line: Option<&str>, field: &'static str) -> Result<i64, RecordError> {
    let line = match line {
        Some(line) if !line.is_empty() => line,
        _ => return Err(RecordError::MissingLine(field)),
    };
    line.trim()
        .parse::<i64>()
        .map_err(|_| RecordError::InvalidNumber {
            field,
            value: line.to_string(),
        })
}
