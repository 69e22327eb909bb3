//! Ferrobus - broker-agnostic integration event bus.
//!
//! Services publish and consume integration events without coupling to a
//! specific message-broker SDK. The crate provides:
//! - [`registry::SubscriptionRegistry`]: subscription bookkeeping keyed by
//!   wire event name
//! - [`dispatch::Dispatcher`]: inbound wire message to typed handler dispatch
//! - [`connection::PersistentConnection`]: single-flight reconnect with
//!   bounded exponential backoff
//! - Transports: RabbitMQ (queue/exchange topology) and ServiceBus-style
//!   (topic/subscription topology), selected by [`bus::EventBusFactory`]
//!   from configuration.

pub mod bus;
pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod registry;

pub use bus::{EventBus, EventBusExt, EventBusFactory, SubscriptionRequest};
pub use codec::{JsonCodec, PayloadCodec};
pub use config::{AckPolicy, BrokerConnection, BusConfig};
pub use connection::{Connect, PersistentConnection};
pub use dispatch::{DispatchOutcome, Dispatcher, HandlerRegistry, HandlerResolver};
pub use error::{
    BusError, CodecError, ConnectionError, DispatchError, HandlerError, SubscriptionError,
};
pub use event::{EventNameTrimmer, IntegrationEvent, IntegrationEventHandler};
pub use registry::{HandlerId, SubscriptionRegistry};
