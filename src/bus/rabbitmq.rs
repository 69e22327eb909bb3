//! RabbitMQ transport: durable direct exchange with per-event queues.
//!
//! Events are published to a direct exchange with the wire name as routing
//! key. Each subscribed event gets a durable queue `{client}.{name}` bound to
//! the exchange, with one receive loop per queue.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, ExchangeKind};
use tokio::sync::RwLock;
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

/// Pause before re-establishing a broken consumer stream.
const RECONSUME_DELAY: Duration = Duration::from_secs(5);

/// Opens AMQP connections via lapin.
pub struct AmqpConnector {
    url: String,
}

impl AmqpConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connect for AmqpConnector {
    type Connection = lapin::Connection;

    async fn connect(&self) -> Result<Self::Connection, ConnectionError> {
        lapin::Connection::connect(&self.url, lapin::ConnectionProperties::default())
            .await
            .map_err(|e| ConnectionError::Connect(e.to_string()))
    }

    fn is_open(&self, connection: &Self::Connection) -> bool {
        connection.status().connected()
    }

    async fn disconnect(&self, connection: &Self::Connection) {
        if let Err(err) = connection.close(200, "bus disposed").await {
            debug!(error = %err, "error closing AMQP connection");
        }
    }
}

/// Network/broker-unavailable failures worth retrying; protocol-level
/// failures are not.
fn is_transient(err: &lapin::Error) -> bool {
    matches!(
        err,
        lapin::Error::IOError(_)
            | lapin::Error::InvalidConnectionState(_)
            | lapin::Error::InvalidChannelState(_)
    )
}

struct Inner {
    config: BusConfig,
    trimmer: EventNameTrimmer,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Dispatcher,
    codec: Arc<dyn PayloadCodec>,
    connection: PersistentConnection<AmqpConnector>,
    consumer_channel: RwLock<Option<Channel>>,
}

/// Queue/exchange event bus on RabbitMQ.
pub struct RabbitMqEventBus {
    inner: Arc<Inner>,
}

impl RabbitMqEventBus {
    pub async fn new(
        config: BusConfig,
        resolver: Arc<dyn HandlerResolver>,
        codec: Arc<dyn PayloadCodec>,
    ) -> Result<Self, BusError> {
        let BrokerConnection::RabbitMq { url } = &config.connection else {
            return Err(BusError::Configuration(
                "RabbitMQ bus requires a rabbitmq connection".to_string(),
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
            AmqpConnector::new(url.clone()),
            config.connection_retry_count,
        );

        let inner = Arc::new(Inner {
            config,
            trimmer,
            registry,
            dispatcher,
            codec,
            connection,
            consumer_channel: RwLock::new(None),
        });

        if let Some(mut removals) = inner.registry.take_removal_listener().await {
            let weak = Arc::downgrade(&inner);
            tokio::spawn(async move {
                while let Some(event_name) = removals.recv().await {
                    let Some(inner) = weak.upgrade() else { break };
                    inner.tear_down_binding(&event_name).await;
                }
            });
        }

        Ok(Self { inner })
    }
}

impl Inner {
    /// Channel used for topology and consuming, recreated when broken. The
    /// exchange is declared with it, so holding a channel implies the
    /// exchange exists.
    async fn consumer_channel(&self) -> Result<Channel, BusError> {
        {
            let guard = self.consumer_channel.read().await;
            if let Some(channel) = guard.as_ref() {
                if channel.status().connected() {
                    return Ok(channel.clone());
                }
            }
        }

        let connection = self.connection.handle().await?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BusError::Broker(format!("failed to create channel: {e}")))?;
        channel
            .exchange_declare(
                &self.config.default_topic_name,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Broker(format!("failed to declare exchange: {e}")))?;

        *self.consumer_channel.write().await = Some(channel.clone());
        Ok(channel)
    }

    async fn publish_with_retry(&self, wire_name: &str, body: Vec<u8>) -> Result<(), BusError> {
        let queue = self.config.subscription_name(wire_name);
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

            let channel = match self.consumer_channel().await {
                Ok(channel) => channel,
                Err(err) => {
                    warn!(
                        attempt = attempt + 1,
                        error = %err,
                        "publish could not obtain a channel, retrying"
                    );
                    last_error = Some(err);
                    continue;
                }
            };

            let result = async {
                // Re-declare the durable queue so a publish never races
                // topology setup.
                channel
                    .queue_declare(
                        &queue,
                        QueueDeclareOptions {
                            durable: true,
                            ..Default::default()
                        },
                        FieldTable::default(),
                    )
                    .await?;

                let confirm = channel
                    .basic_publish(
                        &self.config.default_topic_name,
                        wire_name,
                        BasicPublishOptions::default(),
                        &body,
                        BasicProperties::default()
                            .with_content_type("application/json".into())
                            .with_message_id(Uuid::new_v4().to_string().into())
                            .with_delivery_mode(2),
                    )
                    .await?;
                confirm.await?;
                Ok::<(), lapin::Error>(())
            }
            .await;

            match result {
                Ok(()) => {
                    debug!(
                        exchange = %self.config.default_topic_name,
                        routing_key = %wire_name,
                        "published event"
                    );
                    return Ok(());
                }
                Err(err) if is_transient(&err) => {
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

    async fn open_consumer(&self, wire_name: &str, queue: &str) -> Result<lapin::Consumer, BusError> {
        let channel = self.consumer_channel().await?;
        channel
            .basic_consume(
                queue,
                &format!("{}-{}", self.config.subscriber_client_name, wire_name),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("failed to start consumer: {e}")))
    }

    async fn start_receive_loop(inner: &Arc<Self>, wire_name: String) -> Result<(), BusError> {
        let queue = inner.config.subscription_name(&wire_name);
        let consumer = inner.open_consumer(&wire_name, &queue).await?;

        let weak = Arc::downgrade(inner);
        tokio::spawn(async move {
            Self::receive_loop(weak, wire_name, queue, consumer).await;
        });
        Ok(())
    }

    /// One receive loop per queue, sequential per loop. Re-establishes its
    /// consumer after a broken stream as long as the event still has
    /// subscriptions.
    async fn receive_loop(
        weak: Weak<Inner>,
        wire_name: String,
        queue: String,
        mut consumer: lapin::Consumer,
    ) {
        loop {
            while let Some(delivery) = consumer.next().await {
                let Some(inner) = weak.upgrade() else { return };
                match delivery {
                    Ok(delivery) => inner.handle_delivery(delivery).await,
                    Err(err) => {
                        error!(queue = %queue, error = %err, "consumer delivery error");
                        break;
                    }
                }
            }

            let Some(inner) = weak.upgrade() else { return };
            if !inner.registry.has_subscriptions(&wire_name).await {
                debug!(queue = %queue, "receive loop stopping, no subscriptions remain");
                return;
            }

            tokio::time::sleep(RECONSUME_DELAY).await;
            match inner.open_consumer(&wire_name, &queue).await {
                Ok(reopened) => {
                    info!(queue = %queue, "consumer re-established");
                    consumer = reopened;
                }
                Err(err) => {
                    warn!(queue = %queue, error = %err, "failed to re-establish consumer");
                }
            }
        }
    }

    async fn handle_delivery(&self, delivery: Delivery) {
        let routing_key = delivery.routing_key.as_str().to_string();

        match self
            .dispatcher
            .process_event(&routing_key, &delivery.data)
            .await
        {
            Ok(outcome) => {
                if outcome.should_complete(self.config.on_handler_failure) {
                    if let Err(err) = delivery.ack(BasicAckOptions::default()).await {
                        error!(error = %err, "failed to ack message");
                    }
                } else if let Err(err) = delivery
                    .nack(BasicNackOptions {
                        requeue: true,
                        ..Default::default()
                    })
                    .await
                {
                    error!(error = %err, "failed to nack message");
                }
            }
            Err(err) => {
                // Unknown event type or undecodable payload: redelivery
                // cannot help, remove the message from the queue.
                warn!(routing_key = %routing_key, error = %err, "message could not be processed");
                if let Err(err) = delivery.ack(BasicAckOptions::default()).await {
                    error!(error = %err, "failed to ack message");
                }
            }
        }
    }

    /// Consumes the registry's removal notifications: unbind the queue and,
    /// once nothing is subscribed at all, close the consumer channel.
    async fn tear_down_binding(&self, event_name: &str) {
        let queue = self.config.subscription_name(event_name);

        match self.consumer_channel().await {
            Ok(channel) => {
                if let Err(err) = channel
                    .queue_unbind(
                        &queue,
                        &self.config.default_topic_name,
                        event_name,
                        FieldTable::default(),
                    )
                    .await
                {
                    warn!(queue = %queue, error = %err, "failed to unbind queue");
                } else {
                    info!(queue = %queue, routing_key = %event_name, "unbound queue");
                }
            }
            Err(err) => warn!(queue = %queue, error = %err, "could not unbind queue"),
        }

        if self.registry.is_empty().await {
            if let Some(channel) = self.consumer_channel.write().await.take() {
                if let Err(err) = channel.close(200, "no subscriptions remain").await {
                    debug!(error = %err, "error closing consumer channel");
                }
            }
        }
    }
}

#[async_trait]
impl EventBus for RabbitMqEventBus {
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
            let queue = self.inner.config.subscription_name(&wire_name);
            let channel = self.inner.consumer_channel().await?;
            channel
                .queue_declare(
                    &queue,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BusError::Subscribe(format!("failed to declare queue: {e}")))?;
            channel
                .queue_bind(
                    &queue,
                    &self.inner.config.default_topic_name,
                    &wire_name,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BusError::Subscribe(format!("failed to bind queue: {e}")))?;
            info!(queue = %queue, routing_key = %wire_name, "bound queue to exchange");

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
        self.inner.registry.clear().await;
        if let Some(channel) = self.inner.consumer_channel.write().await.take() {
            if let Err(err) = channel.close(200, "bus disposed").await {
                debug!(error = %err, "error closing consumer channel");
            }
        }
        self.inner.connection.dispose().await;
        Ok(())
    }
}
