//! Event bus contract and transport selection.
//!
//! This module contains:
//! - `EventBus` trait: the broker-agnostic publish/subscribe contract
//! - `EventBusExt`: typed convenience surface over `dyn EventBus`
//! - `SubscriptionRequest`: subscribe-time pairing of a payload decoder with
//!   a typed invoker, so dispatch needs no runtime type introspection
//! - `EventBusFactory`: builds the transport matching the configured broker
//!
//! Implementations: RabbitMQ (queue/exchange) and ServiceBus-style
//! (topic/subscription).

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::info;

#[cfg(feature = "amqp")]
pub mod rabbitmq;
pub mod service_bus;

#[cfg(feature = "amqp")]
pub use rabbitmq::RabbitMqEventBus;
pub use service_bus::{
    InboundMessage, OutboundMessage, ServiceBusClient, ServiceBusConnector, ServiceBusError,
    ServiceBusEventBus,
};

use crate::codec::{JsonCodec, PayloadCodec};
use crate::config::{BrokerConnection, BusConfig};
use crate::dispatch::HandlerResolver;
use crate::error::{BusError, CodecError, HandlerError};
use crate::event::{IntegrationEvent, IntegrationEventHandler};
use crate::registry::{
    DecodedEvent, EventDecoder, HandlerId, InvokeFn, InvokeOutcome, Subscription,
};

/// Broker-agnostic event bus contract.
///
/// Both transports compose the same registry, dispatcher, and connection
/// manager; only topology realization differs.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish a pre-encoded event under its raw (untrimmed) name.
    async fn publish_raw(&self, event_name: &str, payload: serde_json::Value)
        -> Result<(), BusError>;

    /// Register a subscription built by [`SubscriptionRequest::of`].
    async fn subscribe(&self, request: SubscriptionRequest) -> Result<(), BusError>;

    /// Remove the (event, handler) subscription.
    async fn unsubscribe(&self, event_name: &str, handler: HandlerId) -> Result<(), BusError>;

    /// Stop intake and release broker resources. Idempotent; an in-progress
    /// handler call is not interrupted.
    async fn dispose(&self) -> Result<(), BusError>;
}

/// Typed convenience surface, usable through `Arc<dyn EventBus>`.
#[async_trait]
pub trait EventBusExt: EventBus {
    async fn publish<E: IntegrationEvent>(&self, event: &E) -> Result<(), BusError> {
        let payload = serde_json::to_value(event).map_err(CodecError::from)?;
        self.publish_raw(E::NAME, payload).await
    }

    async fn subscribe_to<E, H>(&self) -> Result<(), BusError>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        self.subscribe(SubscriptionRequest::of::<E, H>()).await
    }

    async fn unsubscribe_from<E, H>(&self) -> Result<(), BusError>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        self.unsubscribe(E::NAME, HandlerId::of::<H>()).await
    }
}

impl<T: EventBus + ?Sized> EventBusExt for T {}

/// A subscription prepared at the call site.
///
/// Pairs the event's payload decoder with a typed invoker closure. The
/// invoker resolves the live handler through the bus's [`HandlerResolver`] at
/// dispatch time, downcasts the shared decoded event, and calls `handle`.
pub struct SubscriptionRequest {
    event_name: &'static str,
    subscription: Subscription,
    decoder: EventDecoder,
}

impl SubscriptionRequest {
    pub fn of<E, H>() -> Self
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        let handler = HandlerId::of::<H>();

        let invoke: Arc<InvokeFn> = Arc::new(move |resolver, event: DecodedEvent| {
            let instance = resolver.resolve(&handler);
            Box::pin(async move {
                let Some(instance) = instance else {
                    return Ok(InvokeOutcome::HandlerUnavailable);
                };
                let Ok(instance) = instance.downcast::<H>() else {
                    return Ok(InvokeOutcome::HandlerUnavailable);
                };
                let Ok(event) = event.downcast::<E>() else {
                    return Err(HandlerError::new(
                        "decoded event does not match subscription shape",
                    ));
                };
                instance
                    .handle(event.as_ref())
                    .await
                    .map(|()| InvokeOutcome::Handled)
            }) as BoxFuture<'static, _>
        });

        let decoder: EventDecoder = Arc::new(|value| {
            let event: E = serde_json::from_value(value).map_err(CodecError::from)?;
            Ok(Arc::new(event) as DecodedEvent)
        });

        Self {
            event_name: E::NAME,
            subscription: Subscription::new(handler, invoke),
            decoder,
        }
    }

    pub fn event_name(&self) -> &'static str {
        self.event_name
    }

    pub(crate) fn into_parts(self) -> (&'static str, Subscription, EventDecoder) {
        (self.event_name, self.subscription, self.decoder)
    }
}

/// Builds the transport variant matching the configured broker kind.
///
/// Each bus gets a fresh connection manager, registry, and dispatcher. The
/// ServiceBus client library is an external collaborator, so a
/// [`ServiceBusConnector`] must be registered before a ServiceBus bus can be
/// built.
pub struct EventBusFactory {
    codec: Arc<dyn PayloadCodec>,
    service_bus: Option<Arc<dyn ServiceBusConnector>>,
}

impl EventBusFactory {
    pub fn new() -> Self {
        Self {
            codec: Arc::new(JsonCodec),
            service_bus: None,
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn PayloadCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_service_bus(mut self, connector: Arc<dyn ServiceBusConnector>) -> Self {
        self.service_bus = Some(connector);
        self
    }

    pub async fn create(
        &self,
        config: BusConfig,
        resolver: Arc<dyn HandlerResolver>,
    ) -> Result<Arc<dyn EventBus>, BusError> {
        match config.connection {
            BrokerConnection::RabbitMq { .. } => {
                #[cfg(feature = "amqp")]
                {
                    let bus =
                        RabbitMqEventBus::new(config, resolver, Arc::clone(&self.codec)).await?;
                    info!(broker = "rabbitmq", "event bus initialized");
                    Ok(Arc::new(bus))
                }

                #[cfg(not(feature = "amqp"))]
                {
                    let _ = (config, resolver);
                    Err(BusError::Configuration(
                        "RabbitMQ support requires the 'amqp' feature".to_string(),
                    ))
                }
            }
            BrokerConnection::ServiceBus { .. } => {
                let connector = self.service_bus.clone().ok_or_else(|| {
                    BusError::Configuration(
                        "no service bus connector registered with the factory".to_string(),
                    )
                })?;
                let bus = ServiceBusEventBus::new(
                    config,
                    resolver,
                    Arc::clone(&self.codec),
                    connector,
                )
                .await?;
                info!(broker = "servicebus", "event bus initialized");
                Ok(Arc::new(bus))
            }
        }
    }
}

impl Default for EventBusFactory {
    fn default() -> Self {
        Self::new()
    }
}
