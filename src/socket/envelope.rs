//! Envelope model and MessagePack codec.
//!
//! An envelope is the unit every process exchanges:
//!
//! ```text
//! { "msg-type": "event", "msg-id": "<uuid>", "timestamp": 1700000000000, "payload": { ... } }
//! ```
//!
//! Encoding is a MessagePack map with named keys, so payload shapes need no
//! schema registration. Decoding is strict about the top-level shape: it must
//! be a map carrying all four fields.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Structured payload carried by an envelope.
pub type Payload = Map<String, Value>;

/// Envelope message type, drives dispatch on the receiving side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MsgType {
    /// Something happened (window, connection, gesture).
    Event,
    /// Request for the receiver to act.
    Command,
    /// Log line forwarded to the main process.
    Log,
    /// Named numeric or structured measurement.
    Metric,
    /// Reply to a command.
    Response,
    /// Process status report.
    Status,
    /// Error report with context.
    Error,
    /// Device state snapshot.
    State,
    /// Diagnostic output.
    Debug,
}

impl MsgType {
    /// Wire name of this type.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Event => "event",
            Self::Command => "command",
            Self::Log => "log",
            Self::Metric => "metric",
            Self::Response => "response",
            Self::Status => "status",
            Self::Error => "error",
            Self::State => "state",
            Self::Debug => "debug",
        }
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope encode/decode errors.
#[derive(Debug)]
pub enum EnvelopeError {
    /// Bytes were not a well-formed envelope.
    Malformed(String),
    /// Serialization failed.
    Encode(String),
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(msg) => write!(f, "Malformed envelope: {msg}"),
            Self::Encode(msg) => write!(f, "Envelope encode failed: {msg}"),
        }
    }
}

impl std::error::Error for EnvelopeError {}

/// The four-field message exchanged between processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Dispatch type.
    #[serde(rename = "msg-type")]
    pub msg_type: MsgType,
    /// Unique message id (UUID v4).
    #[serde(rename = "msg-id")]
    pub msg_id: String,
    /// Creation time in milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Structured body.
    pub payload: Payload,
}

/// Current wall clock in epoch milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn to_payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}

impl Envelope {
    /// Build an envelope with a fresh id and timestamp.
    pub fn new(msg_type: MsgType, payload: Payload) -> Self {
        Self {
            msg_type,
            msg_id: uuid::Uuid::new_v4().to_string(),
            timestamp: now_millis(),
            payload,
        }
    }

    // ── Builders ────────────────────────────────────────────────────────

    /// `event` envelope from a JSON object.
    pub fn event(payload: Value) -> Self {
        Self::new(MsgType::Event, to_payload(payload))
    }

    /// `command` envelope: `{action, ...params}`.
    pub fn command(action: &str, params: Payload) -> Self {
        let mut payload = params;
        payload.insert("action".to_string(), Value::String(action.to_string()));
        Self::new(MsgType::Command, payload)
    }

    /// `response` envelope from a JSON object.
    pub fn response(payload: Value) -> Self {
        Self::new(MsgType::Response, to_payload(payload))
    }

    /// `status` envelope from a JSON object.
    pub fn status(payload: Value) -> Self {
        Self::new(MsgType::Status, to_payload(payload))
    }

    /// `state` envelope carrying an extracted device state map.
    pub fn state(payload: Payload) -> Self {
        Self::new(MsgType::State, payload)
    }

    /// `log` envelope: `{level, message, process}`.
    pub fn log(level: log::Level, message: &str, process: &str) -> Self {
        Self::new(
            MsgType::Log,
            to_payload(json!({
                "level": level.as_str(),
                "message": message,
                "process": process,
            })),
        )
    }

    /// `metric` envelope: `{name, value}`.
    pub fn metric(name: &str, value: Value) -> Self {
        Self::new(MsgType::Metric, to_payload(json!({ "name": name, "value": value })))
    }

    /// `error` envelope: `{context, error, process}`.
    pub fn error(context: &str, error: &str, process: &str) -> Self {
        Self::new(
            MsgType::Error,
            to_payload(json!({
                "context": context,
                "error": error,
                "process": process,
            })),
        )
    }

    // ── Accessors ───────────────────────────────────────────────────────

    /// `payload.action` as a string, if present.
    pub fn action(&self) -> Option<&str> {
        self.payload.get("action").and_then(Value::as_str)
    }

    /// True for a `command` envelope with the given action.
    pub fn is_command(&self, action: &str) -> bool {
        self.msg_type == MsgType::Command && self.action() == Some(action)
    }

    // ── Codec ───────────────────────────────────────────────────────────

    /// Encode as a MessagePack map.
    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        rmp_serde::to_vec_named(self).map_err(|e| EnvelopeError::Encode(e.to_string()))
    }

    /// Decode from MessagePack bytes.
    ///
    /// The top level must be a map. Arrays are refused even though
    /// MessagePack's struct encoding would otherwise accept them.
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let value: Value =
            rmp_serde::from_slice(bytes).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
        if !value.is_object() {
            return Err(EnvelopeError::Malformed(format!(
                "expected map at top level, got {}",
                value_kind(&value)
            )));
        }
        serde_json::from_value(value).map_err(|e| EnvelopeError::Malformed(e.to_string()))
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "nil",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "map",
    }
}
