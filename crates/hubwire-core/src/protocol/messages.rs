//! Hub protocol message model.
//!
//! These are the protocol-independent shapes exchanged between client and
//! server. Codecs ([`super::HubProtocol`]) map them to and from bytes.

use serde_json::Value;

/// Any message that can travel over a hub connection.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    /// Call a method; the reply (if any) is a single [`CompletionMessage`].
    Invocation(InvocationMessage),
    /// Call a streaming method; the reply is zero or more
    /// [`StreamItemMessage`]s followed by one [`CompletionMessage`].
    StreamInvocation(StreamInvocationMessage),
    /// One item of a streaming result.
    StreamItem(StreamItemMessage),
    /// Terminal reply to an invocation.
    Completion(CompletionMessage),
    /// Client request to stop an active stream.
    CancelInvocation(CancelInvocationMessage),
    /// Keep-alive.
    Ping,
    /// Graceful close, optionally carrying the reason.
    Close(CloseMessage),
}

impl HubMessage {
    /// Human-readable message kind for logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Invocation(_) => "invocation",
            Self::StreamInvocation(_) => "stream_invocation",
            Self::StreamItem(_) => "stream_item",
            Self::Completion(_) => "completion",
            Self::CancelInvocation(_) => "cancel_invocation",
            Self::Ping => "ping",
            Self::Close(_) => "close",
        }
    }

    /// The invocation id carried by the message, if any.
    pub fn invocation_id(&self) -> Option<&str> {
        match self {
            Self::Invocation(m) => m.invocation_id.as_deref(),
            Self::StreamInvocation(m) => Some(&m.invocation_id),
            Self::StreamItem(m) => Some(&m.invocation_id),
            Self::Completion(m) => Some(&m.invocation_id),
            Self::CancelInvocation(m) => Some(&m.invocation_id),
            Self::Ping | Self::Close(_) => None,
        }
    }
}

/// A (possibly fire-and-forget) method call.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationMessage {
    /// Correlates the reply. Absent for fire-and-forget calls.
    pub invocation_id: Option<String>,
    /// Method name.
    pub target: String,
    /// Positional arguments.
    pub arguments: Vec<Value>,
    /// The caller does not want a reply even though it supplied an id.
    pub non_blocking: bool,
}

impl InvocationMessage {
    /// Fire-and-forget invocation, the shape the server uses to call clients.
    pub fn new(target: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self {
            invocation_id: None,
            target: target.into(),
            arguments,
            non_blocking: false,
        }
    }

    /// Invocation that expects a completion.
    pub fn with_id(
        invocation_id: impl Into<String>,
        target: impl Into<String>,
        arguments: Vec<Value>,
    ) -> Self {
        Self {
            invocation_id: Some(invocation_id.into()),
            target: target.into(),
            arguments,
            non_blocking: false,
        }
    }

    /// Whether the caller waits for a completion.
    pub fn expects_reply(&self) -> bool {
        self.invocation_id.is_some() && !self.non_blocking
    }
}

/// Call to a streaming method.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInvocationMessage {
    /// Identifies the stream for items, completion and cancellation.
    pub invocation_id: String,
    /// Method name.
    pub target: String,
    /// Positional arguments.
    pub arguments: Vec<Value>,
}

impl StreamInvocationMessage {
    /// Create a stream invocation.
    pub fn new(
        invocation_id: impl Into<String>,
        target: impl Into<String>,
        arguments: Vec<Value>,
    ) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            target: target.into(),
            arguments,
        }
    }
}

/// One streamed value.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamItemMessage {
    /// Stream the item belongs to.
    pub invocation_id: String,
    /// The value.
    pub item: Value,
}

impl StreamItemMessage {
    /// Create a stream item.
    pub fn new(invocation_id: impl Into<String>, item: Value) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            item,
        }
    }
}

/// Terminal reply for an invocation or stream.
///
/// At most one of `error` and `result` is set. Neither set means the call
/// finished without a value (a void method or a completed stream).
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionMessage {
    /// Invocation being completed.
    pub invocation_id: String,
    /// Failure text.
    pub error: Option<String>,
    /// Return value. `Some(Value::Null)` is a present-but-null result.
    pub result: Option<Value>,
}

impl CompletionMessage {
    /// Successful completion carrying a value.
    pub fn with_result(invocation_id: impl Into<String>, result: Value) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            error: None,
            result: Some(result),
        }
    }

    /// Failed completion.
    pub fn with_error(invocation_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            error: Some(error.into()),
            result: None,
        }
    }

    /// Completion with neither value nor error.
    pub fn empty(invocation_id: impl Into<String>) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            error: None,
            result: None,
        }
    }
}

/// Client request to cancel a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelInvocationMessage {
    /// Stream to cancel.
    pub invocation_id: String,
}

impl CancelInvocationMessage {
    /// Create a cancel request.
    pub fn new(invocation_id: impl Into<String>) -> Self {
        Self {
            invocation_id: invocation_id.into(),
        }
    }
}

/// Close notification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloseMessage {
    /// Reason the connection closed with an error, if it did.
    pub error: Option<String>,
}

impl CloseMessage {
    /// Close without error.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Close carrying an error description.
    pub fn with_error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
        }
    }
}
