//! Error types shared by the transport, the lifecycle and both routers.

use std::sync::Arc;

/// Boxed error returned by user handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Failures reported by the broker-protocol collaborator.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Broker unreachable at {address}: {reason}")]
    Unreachable { address: String, reason: String },

    #[error("Server closed channel: {code} {text}")]
    ServerClosed { code: u16, text: String },

    #[error("Channel is closed")]
    ChannelClosed,

    #[error("Connection is closed")]
    ConnectionClosed,

    #[error("Broker transport failure: {0}")]
    Io(String),

    #[cfg(feature = "amqp")]
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),
}

impl TransportError {
    /// AMQP reply code for an unknown delivery tag or other precondition failure.
    pub const PRECONDITION_FAILED: u16 = 406;
    /// AMQP reply code for a missing exchange or queue.
    pub const NOT_FOUND: u16 = 404;

    pub fn server_closed(code: u16, text: impl Into<String>) -> Self {
        Self::ServerClosed {
            code,
            text: text.into(),
        }
    }
}

/// Payload serialization failures.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Errors surfaced by the client, either as operation failures or through
/// [`ClientEvent::Errored`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Connection failed: {0}")]
    Connection(#[source] TransportError),

    #[error("Channel error: {0}")]
    Channel(#[source] TransportError),

    #[error("Broker rejected publish to exchange '{exchange}' on topic '{topic}'")]
    PublishRejected { exchange: String, topic: String },

    #[error("Broker rejected enqueue on queue '{queue}'")]
    EnqueueRejected { queue: String },

    #[error(transparent)]
    Encode(CodecError),

    #[error(transparent)]
    Decode(CodecError),

    #[error("Handler failed: {0}")]
    Handler(#[source] BoxError),

    #[error("Subscription '{tag}' was cancelled by the broker")]
    RemoteCancellation { tag: String },

    #[error("Not connected to broker")]
    NotConnected,
}

impl From<CodecError> for ClientError {
    fn from(err: CodecError) -> Self {
        if matches!(err, CodecError::Encode(_)) {
            Self::Encode(err)
        } else {
            Self::Decode(err)
        }
    }
}

/// Observable notifications emitted by a client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The connection/channel pair was torn down. Carries the connection
    /// error when the broker closed the connection because of one.
    Closed(Option<Arc<TransportError>>),
    /// An asynchronous failure that did not belong to any call site.
    Errored(Arc<ClientError>),
}

impl ClientEvent {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }

    pub fn error(&self) -> Option<&ClientError> {
        match self {
            Self::Errored(err) => Some(err),
            Self::Closed(_) => None,
        }
    }
}
