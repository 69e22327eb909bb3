//! Error taxonomy for bus operations.

use thiserror::Error;

/// Errors from subscription registry mutations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubscriptionError {
    /// The (event, handler) pair is already registered.
    #[error("handler '{handler}' is already subscribed to '{event_name}'")]
    Duplicate {
        event_name: String,
        handler: &'static str,
    },

    /// Unsubscribe of a pair that was never registered.
    #[error("handler '{handler}' has no subscription for '{event_name}'")]
    NotFound {
        event_name: String,
        handler: &'static str,
    },
}

/// Errors from payload encoding/decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Errors raised while processing an inbound message.
///
/// Both variants are non-fatal to the bus: the receive loop logs them and
/// acknowledges the message anyway, since redelivery cannot help.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Wire name with no registered event shape.
    #[error("no event type registered for '{0}'")]
    UnknownEventType(String),

    /// Payload bytes do not match the registered event shape.
    #[error("failed to decode payload for '{event_name}'")]
    Decode {
        event_name: String,
        #[source]
        source: CodecError,
    },
}

/// Errors from the broker connection state machine.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Retries exhausted; fatal to the requesting operation only. The bus
    /// remains usable for subsequent attempts.
    #[error("broker connection unavailable, retries exhausted")]
    Unavailable,

    /// A single connection attempt failed.
    #[error("broker connection failed: {0}")]
    Connect(String),
}

/// Error raised by an integration event handler.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<Box<dyn std::error::Error + Send + Sync>> for HandlerError {
    fn from(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self(err.to_string())
    }
}

/// Umbrella error for bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("failed to encode event: {0}")]
    Encode(#[from] CodecError),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("broker operation failed: {0}")]
    Broker(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),
}
