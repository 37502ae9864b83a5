//! Hub protocol: message model, codec trait and the built-in JSON codec.

pub mod framing;
pub mod handshake;
pub mod json;
pub mod messages;

use std::fmt;

use bytes::{Bytes, BytesMut};

use crate::errors::ProtocolError;

pub use json::JsonHubProtocol;
pub use messages::{
    CancelInvocationMessage, CloseMessage, CompletionMessage, HubMessage, InvocationMessage,
    StreamInvocationMessage, StreamItemMessage,
};

/// A wire codec for [`HubMessage`]s.
///
/// Implementations are stateless and shared across connections; the
/// connection owns the read buffer and hands it to
/// [`try_parse_message`](HubProtocol::try_parse_message) after every read.
pub trait HubProtocol: Send + Sync + fmt::Debug {
    /// Name negotiated during the handshake (e.g. `"json"`).
    fn name(&self) -> &str;

    /// Highest protocol version this codec speaks.
    fn version(&self) -> u32;

    /// Whether a client asking for `version` can be served.
    fn is_version_supported(&self, version: u32) -> bool {
        version <= self.version()
    }

    /// Decode one message from the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` holds no complete message yet; consumed
    /// bytes are removed from `buf`.
    fn try_parse_message(&self, buf: &mut BytesMut) -> Result<Option<HubMessage>, ProtocolError>;

    /// Encode a message, including any framing.
    fn write_message(&self, message: &HubMessage) -> Result<Bytes, ProtocolError>;
}
