//! Error types for the hub engine.
//!
//! [`ProtocolError`] covers codec and framing failures. [`HubError`] is the
//! single error type used across the server: invocation failures, handshake
//! failures, connection aborts and configuration mistakes all map onto one
//! of its variants. Both are `Clone` so the first abort error of a
//! connection can be captured and handed to several observers.

use thiserror::Error;

/// Codec-level failures raised while parsing or writing hub messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The payload was not valid for the protocol (bad JSON, wrong shape).
    #[error("invalid message payload: {0}")]
    InvalidPayload(String),
    /// A property required by the message type was absent.
    #[error("missing required property '{0}'")]
    MissingProperty(&'static str),
    /// The `type` discriminator is not a known message type.
    #[error("unknown message type: {0}")]
    UnknownMessageType(u64),
    /// Encoding a message failed.
    #[error("failed to serialize message: {0}")]
    Serialize(String),
}

/// Errors produced by the hub engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    /// A frame could not be decoded, or the client sent a message kind the
    /// server does not accept.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The handshake failed or timed out.
    #[error("handshake failed: {0}")]
    Handshake(String),
    /// No method with this name is registered.
    #[error("Unknown hub method '{0}'")]
    UnknownMethod(String),
    /// The caller does not satisfy the method's policies.
    #[error("Failed to invoke '{0}' because user is unauthorized")]
    Unauthorized(String),
    /// Invocation arguments could not be bound to the method's parameters.
    #[error("argument binding failed: {0}")]
    Binding(String),
    /// An error raised by hub code whose message is meant for the caller.
    #[error("{0}")]
    Hub(String),
    /// Any other failure raised by hub code.
    #[error("internal error: {0}")]
    Internal(String),
    /// The operation observed cancellation.
    #[error("operation was canceled")]
    Canceled,
    /// The connection's outbound queue is gone.
    #[error("connection is closed")]
    ConnectionClosed,
    /// The connection was aborted.
    #[error("connection aborted: {0}")]
    ConnectionAborted(String),
    /// Nothing was received from the client within the timeout window.
    #[error("client sent nothing for {0} ms")]
    ClientTimeout(u64),
    /// Reading from or writing to the transport failed.
    #[error("transport error: {0}")]
    Transport(String),
    /// Two methods were registered under the same case-insensitive name.
    #[error("Duplicate definitions of '{0}'. Overloading is not supported.")]
    DuplicateMethod(String),
    /// An argument supplied by the application was invalid.
    #[error("{0}")]
    InvalidArgument(String),
    /// The call is not valid in the current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl HubError {
    /// Short machine-readable code for logs and metrics labels.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "protocol",
            Self::Handshake(_) => "handshake",
            Self::UnknownMethod(_) => "unknown_method",
            Self::Unauthorized(_) => "unauthorized",
            Self::Binding(_) => "binding",
            Self::Hub(_) => "hub",
            Self::Internal(_) => "internal",
            Self::Canceled => "canceled",
            Self::ConnectionClosed => "connection_closed",
            Self::ConnectionAborted(_) => "connection_aborted",
            Self::ClientTimeout(_) => "client_timeout",
            Self::Transport(_) => "transport",
            Self::DuplicateMethod(_) => "duplicate_method",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::InvalidOperation(_) => "invalid_operation",
        }
    }

    /// Build a [`HubError::Internal`] from any displayable error.
    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<ProtocolError> for HubError {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err.to_string())
    }
}

impl From<std::io::Error> for HubError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Result type for hub operations.
pub type Result<T> = std::result::Result<T, HubError>;

/// Compose the text sent to a client for a failure.
///
/// The generic message is always sent; the error's own text is appended only
/// when detailed errors are enabled.
pub fn build_error_message(generic: &str, err: &HubError, detailed: bool) -> String {
    if detailed {
        format!("{generic} {err}")
    } else {
        generic.to_owned()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
