//! Structured messages carried over duplex connections.
//!
//! Every field is optional. Routing depends only on which of `command`,
//! `type` and `status` are present; everything else rides along.

use crate::frame::TelemetryRecord;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// One message on a duplex connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<MessageType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<CommandStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
    /// Explicit correlation id. Numeric ids are kept as their decimal text.
    #[serde(
        default,
        deserialize_with = "lenient_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,
    /// Fields this crate does not interpret (command arguments and the like).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Tag for non-command messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    HardwareHello,
    HardwareStatus,
    Telemetry,
    Log,
    Text,
    Error,
    ImageInit,
    ImagePart,
    ImageComplete,
    RawFrame,
    Generic,
    Other(String),
}

/// Outcome carried by a command response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Success,
    Error,
    #[serde(other)]
    Unknown,
}

/// Message timestamp as the peer sent it.
///
/// Peers disagree on the unit: the bridge stamps Unix milliseconds, some
/// firmware sends fractional Unix seconds, some a clock string. None of
/// them is worth dropping a message over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Timestamp {
    Millis(u64),
    Seconds(f64),
    Text(String),
    Other(Value),
}

/// Error parsing an envelope.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("envelope must be a JSON object")]
    NotAnObject,
}

fn lenient_id<'de, D: Deserializer<'de>>(de: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<Value>::deserialize(de)? {
        None | Some(Value::Null) => None,
        Some(Value::String(id)) => Some(id),
        Some(other) => Some(other.to_string()),
    })
}

/// Current wall-clock time in Unix milliseconds.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

impl Envelope {
    /// Parse an envelope from its JSON text.
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_str(text)?;
        if !value.is_object() {
            return Err(EnvelopeError::NotAnObject);
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Serialize to JSON text.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// A bare command envelope.
    pub fn command(name: impl Into<String>) -> Self {
        Self {
            command: Some(name.into()),
            ..Self::default()
        }
    }

    /// A command response.
    pub fn response(status: CommandStatus, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: Some(message.into()),
            ..Self::default()
        }
    }

    /// A typed, non-command message.
    pub fn typed(kind: MessageType, payload: Value) -> Self {
        Self {
            kind: Some(kind),
            payload: Some(payload),
            ..Self::default()
        }
    }

    /// Liveness notification for the hardware peer or one of its subsystems.
    pub fn hardware_status(connected: bool, subsystem: Option<&str>, reason: Option<&str>) -> Self {
        let payload = serde_json::json!({
            "connected": connected,
            "subsystem": subsystem,
            "reason": reason,
        });
        Self::typed(MessageType::HardwareStatus, payload).with_timestamp(unix_millis())
    }

    /// A decoded telemetry record.
    pub fn telemetry(record: &TelemetryRecord) -> Self {
        let payload = serde_json::to_value(record).unwrap_or(Value::Null);
        Self::typed(MessageType::Telemetry, payload).with_timestamp(unix_millis())
    }

    /// A non-telemetry datagram frame, forwarded as raw bytes.
    pub fn raw_frame(frame_type: u8, data: &[u8]) -> Self {
        let payload = serde_json::json!({ "frame_type": frame_type, "data": data });
        Self::typed(MessageType::RawFrame, payload).with_timestamp(unix_millis())
    }

    /// An error response.
    pub fn error(message: impl Into<String>) -> Self {
        Self::response(CommandStatus::Error, message).with_timestamp(unix_millis())
    }

    pub fn with_timestamp(mut self, millis: u64) -> Self {
        self.timestamp = Some(Timestamp::Millis(millis));
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Carries a command and neither a status nor a type.
    pub fn is_bare_command(&self) -> bool {
        self.command.is_some() && self.status.is_none() && self.kind.is_none()
    }

    /// Free text of a log-style message: `message`, or a string `payload`.
    pub fn text(&self) -> Option<&str> {
        self.message
            .as_deref()
            .or_else(|| self.payload.as_ref().and_then(Value::as_str))
    }
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::HardwareHello => "hardware-hello",
            Self::HardwareStatus => "hardware-status",
            Self::Telemetry => "telemetry",
            Self::Log => "log",
            Self::Text => "text",
            Self::Error => "error",
            Self::ImageInit => "image-init",
            Self::ImagePart => "image-part",
            Self::ImageComplete => "image-complete",
            Self::RawFrame => "raw-frame",
            Self::Generic => "generic",
            Self::Other(s) => s,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for MessageType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "hardware-hello" => Self::HardwareHello,
            "hardware-status" => Self::HardwareStatus,
            "telemetry" => Self::Telemetry,
            "log" => Self::Log,
            "text" => Self::Text,
            "error" => Self::Error,
            "image-init" => Self::ImageInit,
            "image-part" => Self::ImagePart,
            "image-complete" => Self::ImageComplete,
            "raw-frame" => Self::RawFrame,
            "generic" => Self::Generic,
            _ => Self::Other(s),
        }
    }
}

impl From<MessageType> for String {
    fn from(kind: MessageType) -> Self {
        match kind {
            MessageType::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}
