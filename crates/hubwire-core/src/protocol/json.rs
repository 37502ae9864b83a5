//! JSON hub protocol.
//!
//! One JSON object per record, terminated by [`RECORD_SEPARATOR`]. The
//! integer `type` property selects the message kind:
//!
//! | type | message |
//! |------|---------|
//! | 1 | Invocation |
//! | 2 | StreamItem |
//! | 3 | Completion |
//! | 4 | StreamInvocation |
//! | 5 | CancelInvocation |
//! | 6 | Ping |
//! | 7 | Close |
//!
//! [`RECORD_SEPARATOR`]: super::framing::RECORD_SEPARATOR

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::framing::{try_split_record, write_record};
use super::messages::{
    CancelInvocationMessage, CloseMessage, CompletionMessage, HubMessage, InvocationMessage,
    StreamInvocationMessage, StreamItemMessage,
};
use super::HubProtocol;
use crate::errors::ProtocolError;

const INVOCATION: u64 = 1;
const STREAM_ITEM: u64 = 2;
const COMPLETION: u64 = 3;
const STREAM_INVOCATION: u64 = 4;
const CANCEL_INVOCATION: u64 = 5;
const PING: u64 = 6;
const CLOSE: u64 = 7;

/// The JSON hub protocol (`"json"`, version 1).
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonHubProtocol;

impl JsonHubProtocol {
    /// Protocol name used in the handshake.
    pub const NAME: &'static str = "json";

    /// Create the codec.
    pub fn new() -> Self {
        Self
    }
}

impl HubProtocol for JsonHubProtocol {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn version(&self) -> u32 {
        1
    }

    fn try_parse_message(&self, buf: &mut BytesMut) -> Result<Option<HubMessage>, ProtocolError> {
        let Some(record) = try_split_record(buf) else {
            return Ok(None);
        };
        let wire: InboundWire = serde_json::from_slice(&record)
            .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?;
        wire.into_message().map(Some)
    }

    fn write_message(&self, message: &HubMessage) -> Result<Bytes, ProtocolError> {
        let wire = OutboundWire::from(message);
        let payload =
            serde_json::to_vec(&wire).map_err(|e| ProtocolError::Serialize(e.to_string()))?;
        let mut out = BytesMut::with_capacity(payload.len() + 1);
        write_record(&payload, &mut out);
        Ok(out.freeze())
    }
}

// ── Wire shapes ─────────────────────────────────────────────────────────────

/// Deserialize a property that may legitimately be `null`.
///
/// Paired with `#[serde(default)]`: absent → `None`, `null` → `Some(Null)`.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboundWire {
    #[serde(rename = "type")]
    kind: Option<u64>,
    invocation_id: Option<String>,
    target: Option<String>,
    arguments: Option<Vec<Value>>,
    #[serde(default, deserialize_with = "present")]
    item: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    result: Option<Value>,
    error: Option<String>,
    #[serde(default)]
    non_blocking: bool,
}

impl InboundWire {
    fn into_message(self) -> Result<HubMessage, ProtocolError> {
        let kind = self.kind.ok_or(ProtocolError::MissingProperty("type"))?;
        let message = match kind {
            INVOCATION => HubMessage::Invocation(InvocationMessage {
                invocation_id: self.invocation_id,
                target: self.target.ok_or(ProtocolError::MissingProperty("target"))?,
                arguments: self
                    .arguments
                    .ok_or(ProtocolError::MissingProperty("arguments"))?,
                non_blocking: self.non_blocking,
            }),
            STREAM_INVOCATION => HubMessage::StreamInvocation(StreamInvocationMessage {
                invocation_id: self
                    .invocation_id
                    .ok_or(ProtocolError::MissingProperty("invocationId"))?,
                target: self.target.ok_or(ProtocolError::MissingProperty("target"))?,
                arguments: self
                    .arguments
                    .ok_or(ProtocolError::MissingProperty("arguments"))?,
            }),
            STREAM_ITEM => HubMessage::StreamItem(StreamItemMessage {
                invocation_id: self
                    .invocation_id
                    .ok_or(ProtocolError::MissingProperty("invocationId"))?,
                item: self.item.ok_or(ProtocolError::MissingProperty("item"))?,
            }),
            COMPLETION => {
                if self.error.is_some() && self.result.is_some() {
                    return Err(ProtocolError::InvalidPayload(
                        "the 'error' and 'result' properties are mutually exclusive".into(),
                    ));
                }
                HubMessage::Completion(CompletionMessage {
                    invocation_id: self
                        .invocation_id
                        .ok_or(ProtocolError::MissingProperty("invocationId"))?,
                    error: self.error,
                    result: self.result,
                })
            }
            CANCEL_INVOCATION => HubMessage::CancelInvocation(CancelInvocationMessage {
                invocation_id: self
                    .invocation_id
                    .ok_or(ProtocolError::MissingProperty("invocationId"))?,
            }),
            PING => HubMessage::Ping,
            CLOSE => HubMessage::Close(CloseMessage { error: self.error }),
            other => return Err(ProtocolError::UnknownMessageType(other)),
        };
        Ok(message)
    }
}

#[derive(Serialize, Default)]
#[serde(rename_all = "camelCase")]
struct OutboundWire<'a> {
    #[serde(rename = "type")]
    kind: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    invocation_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<&'a [Value]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    item: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    non_blocking: bool,
}

impl<'a> From<&'a HubMessage> for OutboundWire<'a> {
    fn from(message: &'a HubMessage) -> Self {
        match message {
            HubMessage::Invocation(m) => Self {
                kind: INVOCATION,
                invocation_id: m.invocation_id.as_deref(),
                target: Some(&m.target),
                arguments: Some(&m.arguments),
                non_blocking: m.non_blocking,
                ..Self::default()
            },
            HubMessage::StreamInvocation(m) => Self {
                kind: STREAM_INVOCATION,
                invocation_id: Some(&m.invocation_id),
                target: Some(&m.target),
                arguments: Some(&m.arguments),
                ..Self::default()
            },
            HubMessage::StreamItem(m) => Self {
                kind: STREAM_ITEM,
                invocation_id: Some(&m.invocation_id),
                item: Some(&m.item),
                ..Self::default()
            },
            HubMessage::Completion(m) => Self {
                kind: COMPLETION,
                invocation_id: Some(&m.invocation_id),
                result: m.result.as_ref(),
                error: m.error.as_deref(),
                ..Self::default()
            },
            HubMessage::CancelInvocation(m) => Self {
                kind: CANCEL_INVOCATION,
                invocation_id: Some(&m.invocation_id),
                ..Self::default()
            },
            HubMessage::Ping => Self {
                kind: PING,
                ..Self::default()
            },
            HubMessage::Close(m) => Self {
                kind: CLOSE,
                error: m.error.as_deref(),
                ..Self::default()
            },
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
