//! Handshake exchange.
//!
//! The client opens with `{"protocol":"json","version":1}` followed by the
//! record separator; the server answers `{}` on success or
//! `{"error":"..."}` on failure, also separator-terminated. Both sides use
//! text framing regardless of the protocol being negotiated.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use super::framing::{try_split_record, write_record};
use crate::errors::ProtocolError;

/// The client's opening message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Requested protocol name.
    pub protocol: String,
    /// Requested protocol version.
    pub version: u32,
}

impl HandshakeRequest {
    /// Create a request.
    pub fn new(protocol: impl Into<String>, version: u32) -> Self {
        Self {
            protocol: protocol.into(),
            version,
        }
    }
}

/// The server's reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    /// Set when the handshake failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HandshakeResponse {
    /// Successful response (`{}`).
    pub fn success() -> Self {
        Self::default()
    }

    /// Failed response.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
        }
    }
}

/// Parse a handshake request from the front of `buf`.
pub fn try_parse_request(buf: &mut BytesMut) -> Result<Option<HandshakeRequest>, ProtocolError> {
    parse_record(buf)
}

/// Parse a handshake response from the front of `buf`.
pub fn try_parse_response(buf: &mut BytesMut) -> Result<Option<HandshakeResponse>, ProtocolError> {
    parse_record(buf)
}

/// Encode a handshake request.
pub fn write_request(request: &HandshakeRequest) -> Result<Bytes, ProtocolError> {
    write_json(request)
}

/// Encode a handshake response.
pub fn write_response(response: &HandshakeResponse) -> Result<Bytes, ProtocolError> {
    write_json(response)
}

fn parse_record<T: for<'de> Deserialize<'de>>(
    buf: &mut BytesMut,
) -> Result<Option<T>, ProtocolError> {
    let Some(record) = try_split_record(buf) else {
        return Ok(None);
    };
    serde_json::from_slice(&record)
        .map(Some)
        .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))
}

fn write_json<T: Serialize>(value: &T) -> Result<Bytes, ProtocolError> {
    let payload = serde_json::to_vec(value).map_err(|e| ProtocolError::Serialize(e.to_string()))?;
    let mut out = BytesMut::with_capacity(payload.len() + 1);
    write_record(&payload, &mut out);
    Ok(out.freeze())
}
