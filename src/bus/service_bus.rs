//! ServiceBus-style transport: one topic, per-event subscriptions filtered by
//! label correlation rules.
//!
//! The broker's socket/queue primitives come from an external client library
//! behind [`ServiceBusClient`]; this module owns topology management, the
//! receive loops, and the acknowledgment decisions.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{EventBus, SubscriptionRequest};
use crate::codec::PayloadCodec;
use crate::config::{BrokerConnection, BusConfig};
use crate::connection::{Connect, PersistentConnection};
use crate::dispatch::{Dispatcher, HandlerResolver};
use crate::error::{BusError, ConnectionError};
use crate::event::EventNameTrimmer;
use crate::registry::{HandlerId, SubscriptionRegistry};

/// Catch-all rule every new subscription starts with; removed so only label
/// rules match.
pub const DEFAULT_RULE_NAME: &str = "$Default";

/// Message sent to the broker.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Unique message identifier, generated per publish.
    pub id: String,
    /// Normalized event wire name.
    pub label: String,
    /// Encoded event record.
    pub body: Vec<u8>,
}

/// Message delivered by the broker.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub label: String,
    pub body: Vec<u8>,
    /// Settlement token for complete/abandon.
    pub lock_token: String,
}

/// Client-library failures, classified for retry decisions.
#[derive(Debug, thiserror::Error)]
pub enum ServiceBusError {
    /// Network/broker-unavailable failure worth retrying.
    #[error("transient service bus failure: {0}")]
    Transient(String),
    /// Missing topic/subscription/rule; a warning during teardown.
    #[error("messaging entity not found: {0}")]
    EntityNotFound(String),
    #[error("service bus failure: {0}")]
    Other(String),
}

impl ServiceBusError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Topic/subscription broker operations the bus needs from the vendor SDK.
#[async_trait]
pub trait ServiceBusClient: Send + Sync {
    async fn topic_exists(&self, topic: &str) -> Result<bool, ServiceBusError>;
    async fn create_topic(&self, topic: &str) -> Result<(), ServiceBusError>;

    async fn send(&self, topic: &str, message: OutboundMessage) -> Result<(), ServiceBusError>;

    async fn subscription_exists(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<bool, ServiceBusError>;
    async fn create_subscription(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<(), ServiceBusError>;

    async fn rule_exists(
        &self,
        topic: &str,
        subscription: &str,
        rule: &str,
    ) -> Result<bool, ServiceBusError>;
    /// Add a rule matching messages whose label equals `label`; the rule is
    /// named after the label.
    async fn add_label_rule(
        &self,
        topic: &str,
        subscription: &str,
        label: &str,
    ) -> Result<(), ServiceBusError>;
    async fn delete_rule(
        &self,
        topic: &str,
        subscription: &str,
        rule: &str,
    ) -> Result<(), ServiceBusError>;

    /// Stream of deliveries for a subscription; ends when the client closes.
    async fn consume(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<BoxStream<'static, InboundMessage>, ServiceBusError>;
    async fn complete(
        &self,
        topic: &str,
        subscription: &str,
        lock_token: &str,
    ) -> Result<(), ServiceBusError>;
    async fn abandon(
        &self,
        topic: &str,
        subscription: &str,
        lock_token: &str,
    ) -> Result<(), ServiceBusError>;

    fn is_open(&self) -> bool;
    async fn close(&self) -> Result<(), ServiceBusError>;
}

/// Opens [`ServiceBusClient`] handles from a connection string; implemented
/// by the vendor SDK binding and registered with the factory.
#[async_trait]
pub trait ServiceBusConnector: Send + Sync + 'static {
    async fn connect(
        &self,
        connection_string: &str,
    ) -> Result<Arc<dyn ServiceBusClient>, ServiceBusError>;
}

struct SbConnect {
    connector: Arc<dyn ServiceBusConnector>,
    connection_string: String,
}

#[async_trait]
impl Connect for SbConnect {
    type Connection = Arc<dyn ServiceBusClient>;

    async fn connect(&self) -> Result<Self::Connection, ConnectionError> {
        self.connector
            .connect(&self.connection_string)
            .await
            .map_err(|e| ConnectionError::Connect(e.to_string()))
    }

    fn is_open(&self, client: &Self::Connection) -> bool {
        client.is_open()
    }

    async fn disconnect(&self, client: &Self::Connection) {
        if let Err(err) = client.close().await {
            debug!(error = %err, "error closing service bus client");
        }
    }
}

fn broker_err(err: ServiceBusError) -> BusError {
    BusError::Broker(err.to_string())
}

struct Inner {
    config: BusConfig,
    trimmer: EventNameTrimmer,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Dispatcher,
    codec: Arc<dyn PayloadCodec>,
    connection: PersistentConnection<SbConnect>,
    /// Stop signals for the per-subscription receive loops.
    receivers: Mutex<HashMap<String, watch::Sender<bool>>>,
}

/// Topic/subscription event bus over an external ServiceBus client.
pub struct ServiceBusEventBus {
    inner: Arc<Inner>,
}

impl ServiceBusEventBus {
    pub async fn new(
        config: BusConfig,
        resolver: Arc<dyn HandlerResolver>,
        codec: Arc<dyn PayloadCodec>,
        connector: Arc<dyn ServiceBusConnector>,
    ) -> Result<Self, BusError> {
        let BrokerConnection::ServiceBus { connection_string } = &config.connection else {
            return Err(BusError::Configuration(
                "ServiceBus bus requires a servicebus connection".to_string(),
            ));
        };

        let trimmer = EventNameTrimmer::from_config(&config);
        let registry = Arc::new(SubscriptionRegistry::new());
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            resolver,
            Arc::clone(&codec),
            trimmer.clone(),
        );
        let connection = PersistentConnection::new(
            SbConnect {
                connector,
                connection_string: connection_string.clone(),
            },
            config.connection_retry_count,
        );

        let inner = Arc::new(Inner {
            config,
            trimmer,
            registry,
            dispatcher,
            codec,
            connection,
            receivers: Mutex::new(HashMap::new()),
        });

        if let Some(mut removals) = inner.registry.take_removal_listener().await {
            let weak = Arc::downgrade(&inner);
            tokio::spawn(async move {
                while let Some(event_name) = removals.recv().await {
                    let Some(inner) = weak.upgrade() else { break };
                    inner.tear_down_rule(&event_name).await;
                }
            });
        }

        Ok(Self { inner })
    }
}

impl Inner {
    async fn client(&self) -> Result<Arc<dyn ServiceBusClient>, BusError> {
        Ok(self.connection.handle().await?.as_ref().clone())
    }

    async fn publish_with_retry(&self, wire_name: &str, body: Vec<u8>) -> Result<(), BusError> {
        let topic = &self.config.default_topic_name;
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_secs(2))
            .with_factor(2.0)
            .with_max_times(self.config.connection_retry_count as usize)
            .build();
        let mut last_error = None;

        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }

            let client = match self.client().await {
                Ok(client) => client,
                Err(err) => {
                    warn!(
                        attempt = attempt + 1,
                        error = %err,
                        "publish could not obtain a client, retrying"
                    );
                    last_error = Some(err);
                    continue;
                }
            };

            let result = async {
                if !client.topic_exists(topic).await? {
                    client.create_topic(topic).await?;
                    info!(topic = %topic, "created topic");
                }
                client
                    .send(
                        topic,
                        OutboundMessage {
                            id: Uuid::new_v4().to_string(),
                            label: wire_name.to_string(),
                            body: body.clone(),
                        },
                    )
                    .await
            }
            .await;

            match result {
                Ok(()) => {
                    debug!(topic = %topic, label = %wire_name, "published event");
                    return Ok(());
                }
                Err(err) if err.is_transient() => {
                    warn!(
                        attempt = attempt + 1,
                        error = %err,
                        "transient publish failure, retrying"
                    );
                    last_error = Some(BusError::Publish(err.to_string()));
                }
                Err(err) => return Err(BusError::Publish(err.to_string())),
            }
        }

        Err(last_error.unwrap_or_else(|| BusError::Publish("retries exhausted".to_string())))
    }

    /// Create the subscription and its label rule on first subscribe for an
    /// event name. A freshly created subscription matches everything until
    /// its default rule is removed.
    async fn ensure_subscription(
        &self,
        client: &Arc<dyn ServiceBusClient>,
        wire_name: &str,
    ) -> Result<(), BusError> {
        let topic = &self.config.default_topic_name;
        let subscription = self.config.subscription_name(wire_name);

        if !client.topic_exists(topic).await.map_err(broker_err)? {
            client.create_topic(topic).await.map_err(broker_err)?;
            info!(topic = %topic, "created topic");
        }

        if !client
            .subscription_exists(topic, &subscription)
            .await
            .map_err(broker_err)?
        {
            client
                .create_subscription(topic, &subscription)
                .await
                .map_err(broker_err)?;
            info!(subscription = %subscription, "created subscription");

            match client
                .delete_rule(topic, &subscription, DEFAULT_RULE_NAME)
                .await
            {
                Ok(()) | Err(ServiceBusError::EntityNotFound(_)) => {}
                Err(err) => return Err(BusError::Subscribe(err.to_string())),
            }
        }

        let rule_exists = match client.rule_exists(topic, &subscription, wire_name).await {
            Ok(exists) => exists,
            Err(ServiceBusError::EntityNotFound(_)) => false,
            Err(err) => return Err(BusError::Subscribe(err.to_string())),
        };
        if !rule_exists {
            client
                .add_label_rule(topic, &subscription, wire_name)
                .await
                .map_err(|e| BusError::Subscribe(e.to_string()))?;
            debug!(subscription = %subscription, label = %wire_name, "added label rule");
        }

        Ok(())
    }

    async fn start_receive_loop(inner: &Arc<Self>, wire_name: String) -> Result<(), BusError> {
        let client = inner.client().await?;
        let subscription = inner.config.subscription_name(&wire_name);
        let stream = client
            .consume(&inner.config.default_topic_name, &subscription)
            .await
            .map_err(|e| BusError::Subscribe(format!("failed to start receiver: {e}")))?;

        let (stop_tx, stop_rx) = watch::channel(false);
        inner.receivers.lock().await.insert(wire_name, stop_tx);

        let weak = Arc::downgrade(inner);
        let concurrency = inner.config.receive_concurrency.max(1);
        tokio::spawn(async move {
            Self::receive_loop(weak, client, subscription, stream, stop_rx, concurrency).await;
        });
        Ok(())
    }

    /// One receive loop per subscription, bounded to `receive_concurrency`
    /// simultaneous deliveries.
    async fn receive_loop(
        weak: Weak<Inner>,
        client: Arc<dyn ServiceBusClient>,
        subscription: String,
        stream: BoxStream<'static, InboundMessage>,
        mut stop_rx: watch::Receiver<bool>,
        concurrency: usize,
    ) {
        let stopped = async move {
            while stop_rx.changed().await.is_ok() {
                if *stop_rx.borrow() {
                    break;
                }
            }
        };

        stream
            .take_until(stopped)
            .for_each_concurrent(concurrency, |message| {
                let weak = weak.clone();
                let client = Arc::clone(&client);
                let subscription = subscription.clone();
                async move {
                    let Some(inner) = weak.upgrade() else { return };
                    inner.handle_message(&client, &subscription, message).await;
                }
            })
            .await;

        debug!(subscription = %subscription, "receive loop ended");
    }

    async fn handle_message(
        &self,
        client: &Arc<dyn ServiceBusClient>,
        subscription: &str,
        message: InboundMessage,
    ) {
        let topic = &self.config.default_topic_name;

        match self
            .dispatcher
            .process_event(&message.label, &message.body)
            .await
        {
            Ok(outcome) => {
                if outcome.should_complete(self.config.on_handler_failure) {
                    if let Err(err) = client
                        .complete(topic, subscription, &message.lock_token)
                        .await
                    {
                        error!(error = %err, "failed to complete message");
                    }
                } else if let Err(err) = client
                    .abandon(topic, subscription, &message.lock_token)
                    .await
                {
                    error!(error = %err, "failed to abandon message");
                }
            }
            Err(err) => {
                // Unknown event type or undecodable payload: redelivery
                // cannot help, settle the message.
                warn!(label = %message.label, error = %err, "message could not be processed");
                if let Err(err) = client
                    .complete(topic, subscription, &message.lock_token)
                    .await
                {
                    error!(error = %err, "failed to complete message");
                }
            }
        }
    }

    /// Consumes the registry's removal notifications: delete the label rule
    /// and stop that subscription's receive loop.
    async fn tear_down_rule(&self, event_name: &str) {
        let subscription = self.config.subscription_name(event_name);

        match self.client().await {
            Ok(client) => {
                match client
                    .delete_rule(&self.config.default_topic_name, &subscription, event_name)
                    .await
                {
                    Ok(()) => info!(subscription = %subscription, rule = %event_name, "removed rule"),
                    Err(ServiceBusError::EntityNotFound(entity)) => {
                        warn!(entity = %entity, "messaging entity could not be found")
                    }
                    Err(err) => {
                        warn!(subscription = %subscription, error = %err, "failed to remove rule")
                    }
                }
            }
            Err(err) => warn!(subscription = %subscription, error = %err, "could not remove rule"),
        }

        if let Some(stop) = self.receivers.lock().await.remove(event_name) {
            let _ = stop.send(true);
        }
    }
}

#[async_trait]
impl EventBus for ServiceBusEventBus {
    async fn publish_raw(
        &self,
        event_name: &str,
        payload: serde_json::Value,
    ) -> Result<(), BusError> {
        let wire_name = self.inner.trimmer.trim(event_name);

        if !self.inner.connection.is_connected().await && !self.inner.connection.try_connect().await
        {
            return Err(ConnectionError::Unavailable.into());
        }

        let body = self.inner.codec.encode(&payload)?;
        self.inner.publish_with_retry(&wire_name, body).await
    }

    async fn subscribe(&self, request: SubscriptionRequest) -> Result<(), BusError> {
        let (raw_name, subscription, decoder) = request.into_parts();
        let wire_name = self.inner.trimmer.trim(raw_name);

        if !self.inner.registry.has_subscriptions(&wire_name).await {
            let client = self.inner.client().await?;
            self.inner.ensure_subscription(&client, &wire_name).await?;
            Inner::start_receive_loop(&self.inner, wire_name.clone()).await?;
        }

        info!(
            event_name = %wire_name,
            handler = subscription.handler().type_name(),
            "subscribing"
        );
        self.inner
            .registry
            .add(&wire_name, subscription, decoder)
            .await?;
        Ok(())
    }

    async fn unsubscribe(&self, event_name: &str, handler: HandlerId) -> Result<(), BusError> {
        let wire_name = self.inner.trimmer.trim(event_name);
        info!(event_name = %wire_name, handler = handler.type_name(), "unsubscribing");
        self.inner.registry.remove(&wire_name, handler).await?;
        Ok(())
    }

    async fn dispose(&self) -> Result<(), BusError> {
        let receivers: Vec<_> = self.inner.receivers.lock().await.drain().collect();
        for (_, stop) in receivers {
            let _ = stop.send(true);
        }
        self.inner.registry.clear().await;
        self.inner.connection.dispose().await;
        Ok(())
    }
}
