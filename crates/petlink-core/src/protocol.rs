use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::UNKNOWN_SENTINEL;

/// Outbound command, tagged by `event`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum Command {
    #[serde(rename = "ble-scan")]
    Scan,
    #[serde(rename = "ble-connect")]
    Connect { address: String },
    #[serde(rename = "ble-disconnect")]
    Disconnect,
    #[serde(rename = "ble-status")]
    Status,
}

impl Command {
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Scan => "ble-scan",
            Command::Connect { .. } => "ble-connect",
            Command::Disconnect => "ble-disconnect",
            Command::Status => "ble-status",
        }
    }
}

fn sentinel_name() -> String {
    UNKNOWN_SENTINEL.to_string()
}

// The worker sends `null` names for unnamed devices on some platforms.
fn name_or_sentinel<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(d)?.unwrap_or_else(sentinel_name))
}

// Accepts a string or a number and keeps it as display text.
fn lenient_text<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    match Value::deserialize(d)? {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeripheralDevice {
    #[serde(default = "sentinel_name", deserialize_with = "name_or_sentinel")]
    pub name: String,
    pub address: String,
    #[serde(
        default,
        deserialize_with = "lenient_text",
        skip_serializing_if = "Option::is_none"
    )]
    pub rssi: Option<String>,
}

/// Body shared by `ble-status-result` and `ble-connect-result`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionReport {
    pub connected: bool,
    #[serde(default = "sentinel_name", deserialize_with = "name_or_sentinel")]
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum BleEvent {
    #[serde(rename = "ble-scan-result")]
    ScanResult {
        #[serde(default)]
        data: Vec<PeripheralDevice>,
    },
    #[serde(rename = "ble-status-result")]
    StatusResult(SessionReport),
    #[serde(rename = "ble-connect-result")]
    ConnectResult(SessionReport),
    #[serde(rename = "ble-disconnect-result")]
    DisconnectResult {
        #[serde(default)]
        success: Option<bool>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct AudioAmplitude {
    #[serde(default)]
    pub amplitude: f64,
    #[serde(default)]
    pub peak: f64,
    #[serde(default)]
    pub rms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaEvent {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub artist: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub is_playing: bool,
    #[serde(default)]
    pub audio_amplitude: Option<AudioAmplitude>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEvent {
    #[serde(default)]
    pub app: String,
    #[serde(default, deserialize_with = "lenient_text")]
    pub time: Option<String>,
    #[serde(default)]
    pub texts: Vec<String>,
}

/// Telemetry pushed by the worker, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkerEvent {
    Media(MediaEvent),
    Notification(NotificationEvent),
}

/// Decoded inbound frame. Decoding never fails: anything that is not a known
/// tagged event degrades to `Unrecognized` (valid JSON) or `Raw` (everything else).
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Ble(BleEvent),
    Worker(WorkerEvent),
    Unrecognized(Value),
    Raw(String),
}

impl Inbound {
    pub fn kind(&self) -> &'static str {
        match self {
            Inbound::Ble(BleEvent::ScanResult { .. }) => "ble-scan-result",
            Inbound::Ble(BleEvent::StatusResult(_)) => "ble-status-result",
            Inbound::Ble(BleEvent::ConnectResult(_)) => "ble-connect-result",
            Inbound::Ble(BleEvent::DisconnectResult { .. }) => "ble-disconnect-result",
            Inbound::Worker(WorkerEvent::Media(_)) => "media",
            Inbound::Worker(WorkerEvent::Notification(_)) => "notification",
            Inbound::Unrecognized(_) => "unrecognized",
            Inbound::Raw(_) => "raw",
        }
    }
}

const BLE_EVENTS: [&str; 4] = [
    "ble-scan-result",
    "ble-status-result",
    "ble-connect-result",
    "ble-disconnect-result",
];
const WORKER_TYPES: [&str; 2] = ["media", "notification"];

pub fn decode(payload: &str) -> Inbound {
    let value: Value = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(_) => return Inbound::Raw(payload.to_string()),
    };

    let tag_in = |key: &str, known: &[&str]| {
        value
            .get(key)
            .and_then(Value::as_str)
            .map(|t| known.contains(&t))
            .unwrap_or(false)
    };

    if tag_in("event", &BLE_EVENTS) {
        return match BleEvent::deserialize(&value) {
            Ok(ev) => Inbound::Ble(ev),
            Err(_) => Inbound::Raw(payload.to_string()),
        };
    }
    if tag_in("type", &WORKER_TYPES) {
        return match WorkerEvent::deserialize(&value) {
            Ok(ev) => Inbound::Worker(ev),
            Err(_) => Inbound::Raw(payload.to_string()),
        };
    }
    Inbound::Unrecognized(value)
}
