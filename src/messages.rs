//! Wire schema of latency probe messages.
//!
//! Messages are JSON objects sharing the `messageType` discriminator:
//!
//! ```text
//! latency_request:  { messageType, messageId, timestamp, timestamps: {T1}, data }
//! latency_response: { messageType, originalMessageId, timestamp,
//!                     timestamps: {T1, T2, [T2_5], T3}, data, sourceTag }
//! ```
//!
//! Inbound payloads are validated here, before dispatch, and turned into the
//! tagged [`Message`] variant.

use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::{Number, Value};
use thiserror::Error;

use crate::stages::{whole_millis, StageTimestamps};

/// Discriminator value of probe requests.
pub const LATENCY_REQUEST: &str = "latency_request";
/// Discriminator value of probe responses.
pub const LATENCY_RESPONSE: &str = "latency_response";

/// Errors raised while decoding an inbound payload. Both are malformed messages.
#[derive(Error, Debug)]
pub enum MessageError {
    /// Payload is not well-formed JSON (or not a JSON object).
    #[error("Malformed message: {0}")]
    Malformed(String),
    /// Payload is JSON but does not match the schema of its `messageType`.
    #[error("Invalid {message_type} message: {reason}")]
    InvalidSchema {
        message_type: &'static str,
        reason: String,
    },
}

/// Probe request published by the emitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyRequest {
    pub message_id: String,
    /// Send time (T1) in milliseconds.
    #[serde(deserialize_with = "floor_millis")]
    pub timestamp: i64,
    #[serde(default)]
    pub timestamps: StageTimestamps,
    #[serde(default)]
    pub data: Value,
}

/// Response echoing a request, carrying the stages stamped on the way back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyResponse {
    pub original_message_id: String,
    /// Time the response was published.
    #[serde(deserialize_with = "floor_millis")]
    pub timestamp: i64,
    #[serde(default)]
    pub timestamps: StageTimestamps,
    #[serde(default)]
    pub data: Value,
    /// Identifies the responder. Older responders call this `websocketType`.
    #[serde(default, alias = "websocketType", skip_serializing_if = "Option::is_none")]
    pub source_tag: Option<String>,
}

/// Reads a timestamp, flooring fractional milliseconds.
fn floor_millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    let value = Number::deserialize(deserializer)?;
    whole_millis(&value)
        .ok_or_else(|| de::Error::custom(format!("timestamp {} is out of range", value)))
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(LatencyRequest),
    Response(LatencyResponse),
    /// Well-formed message with a discriminator this engine does not handle.
    /// `None` when the `messageType` field is missing.
    Unknown(Option<String>),
}

impl Message {
    /// Decodes and validates a raw payload.
    pub fn decode(bytes: &[u8]) -> Result<Message, MessageError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| MessageError::Malformed(e.to_string()))?;

        let message_type = match &value {
            Value::Object(map) => map.get("messageType").cloned(),
            _ => return Err(MessageError::Malformed("not a JSON object".to_string())),
        };

        match message_type {
            Some(Value::String(t)) if t == LATENCY_REQUEST => serde_json::from_value(value)
                .map(Message::Request)
                .map_err(|e| MessageError::InvalidSchema {
                    message_type: LATENCY_REQUEST,
                    reason: e.to_string(),
                }),
            Some(Value::String(t)) if t == LATENCY_RESPONSE => serde_json::from_value(value)
                .map(Message::Response)
                .map_err(|e| MessageError::InvalidSchema {
                    message_type: LATENCY_RESPONSE,
                    reason: e.to_string(),
                }),
            Some(Value::String(t)) => Ok(Message::Unknown(Some(t))),
            Some(other) => Ok(Message::Unknown(Some(other.to_string()))),
            None => Ok(Message::Unknown(None)),
        }
    }

    /// Serializes the message with its `messageType` discriminator.
    ///
    /// `Unknown` messages cannot be encoded and yield `None`.
    pub fn encode(&self) -> Option<Result<Vec<u8>, serde_json::Error>> {
        match self {
            Message::Request(req) => Some(encode_tagged(LATENCY_REQUEST, req)),
            Message::Response(resp) => Some(encode_tagged(LATENCY_RESPONSE, resp)),
            Message::Unknown(_) => None,
        }
    }
}

impl LatencyRequest {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        encode_tagged(LATENCY_REQUEST, self)
    }
}

impl LatencyResponse {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        encode_tagged(LATENCY_RESPONSE, self)
    }
}

fn encode_tagged<T: Serialize>(message_type: &str, body: &T) -> Result<Vec<u8>, serde_json::Error> {
    #[derive(Serialize)]
    struct Tagged<'a, T> {
        #[serde(rename = "messageType")]
        message_type: &'a str,
        #[serde(flatten)]
        body: &'a T,
    }
    serde_json::to_vec(&Tagged { message_type, body })
}
