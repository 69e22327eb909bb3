//! Shared test fixtures: an in-memory ServiceBus client double plus test
//! events and handlers.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use ferrobus::bus::{
    InboundMessage, OutboundMessage, ServiceBusClient, ServiceBusConnector, ServiceBusError,
};
use ferrobus::{HandlerError, IntegrationEvent, IntegrationEventHandler};

// ============================================================================
// In-memory broker
// ============================================================================

type Entity = (String, String);

#[derive(Default)]
struct State {
    topics: HashSet<String>,
    /// (topic, subscription) -> rule names.
    rules: HashMap<Entity, HashSet<String>>,
    /// (topic, subscription) -> sender feeding that subscription's stream.
    consumers: HashMap<Entity, mpsc::UnboundedSender<InboundMessage>>,
    sent: Vec<OutboundMessage>,
    completed: Vec<String>,
    abandoned: Vec<String>,
}

/// In-memory broker with ServiceBus-style topics, subscriptions, and label
/// rules. Routes sends to matching subscription streams synchronously.
#[derive(Default)]
pub struct InMemoryServiceBus {
    state: Mutex<State>,
    closed: AtomicBool,
    /// Fail the next N sends with a transient error.
    fail_sends: AtomicU32,
    next_lock_token: AtomicU32,
}

impl InMemoryServiceBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn fail_next_sends(&self, count: u32) {
        self.fail_sends.store(count, Ordering::SeqCst);
    }

    pub fn sent_count(&self) -> usize {
        self.state().sent.len()
    }

    pub fn completed_count(&self) -> usize {
        self.state().completed.len()
    }

    pub fn abandoned_count(&self) -> usize {
        self.state().abandoned.len()
    }

    pub fn has_rule(&self, topic: &str, subscription: &str, rule: &str) -> bool {
        self.state()
            .rules
            .get(&(topic.to_string(), subscription.to_string()))
            .is_some_and(|rules| rules.contains(rule))
    }

    pub fn has_subscription(&self, topic: &str, subscription: &str) -> bool {
        self.state()
            .rules
            .contains_key(&(topic.to_string(), subscription.to_string()))
    }
}

#[async_trait]
impl ServiceBusClient for InMemoryServiceBus {
    async fn topic_exists(&self, topic: &str) -> Result<bool, ServiceBusError> {
        Ok(self.state().topics.contains(topic))
    }

    async fn create_topic(&self, topic: &str) -> Result<(), ServiceBusError> {
        self.state().topics.insert(topic.to_string());
        Ok(())
    }

    async fn send(&self, topic: &str, message: OutboundMessage) -> Result<(), ServiceBusError> {
        if self
            .fail_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ServiceBusError::Transient("broker unreachable".to_string()));
        }

        let mut state = self.state();
        let matching: Vec<_> = state
            .rules
            .iter()
            .filter(|((entity_topic, _), rules)| {
                entity_topic == topic
                    && (rules.contains(&message.label) || rules.contains("$Default"))
            })
            .map(|(entity, _)| entity.clone())
            .collect();

        for entity in matching {
            if let Some(sender) = state.consumers.get(&entity) {
                let token = self.next_lock_token.fetch_add(1, Ordering::SeqCst);
                let _ = sender.send(InboundMessage {
                    label: message.label.clone(),
                    body: message.body.clone(),
                    lock_token: token.to_string(),
                });
            }
        }

        state.sent.push(message);
        Ok(())
    }

    async fn subscription_exists(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<bool, ServiceBusError> {
        Ok(self
            .state()
            .rules
            .contains_key(&(topic.to_string(), subscription.to_string())))
    }

    async fn create_subscription(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<(), ServiceBusError> {
        self.state().rules.insert(
            (topic.to_string(), subscription.to_string()),
            HashSet::from(["$Default".to_string()]),
        );
        Ok(())
    }

    async fn rule_exists(
        &self,
        topic: &str,
        subscription: &str,
        rule: &str,
    ) -> Result<bool, ServiceBusError> {
        let state = self.state();
        let rules = state
            .rules
            .get(&(topic.to_string(), subscription.to_string()))
            .ok_or_else(|| ServiceBusError::EntityNotFound(subscription.to_string()))?;
        Ok(rules.contains(rule))
    }

    async fn add_label_rule(
        &self,
        topic: &str,
        subscription: &str,
        label: &str,
    ) -> Result<(), ServiceBusError> {
        let mut state = self.state();
        let rules = state
            .rules
            .get_mut(&(topic.to_string(), subscription.to_string()))
            .ok_or_else(|| ServiceBusError::EntityNotFound(subscription.to_string()))?;
        rules.insert(label.to_string());
        Ok(())
    }

    async fn delete_rule(
        &self,
        topic: &str,
        subscription: &str,
        rule: &str,
    ) -> Result<(), ServiceBusError> {
        let mut state = self.state();
        let rules = state
            .rules
            .get_mut(&(topic.to_string(), subscription.to_string()))
            .ok_or_else(|| ServiceBusError::EntityNotFound(subscription.to_string()))?;
        if !rules.remove(rule) {
            return Err(ServiceBusError::EntityNotFound(rule.to_string()));
        }
        Ok(())
    }

    async fn consume(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<BoxStream<'static, InboundMessage>, ServiceBusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state()
            .consumers
            .insert((topic.to_string(), subscription.to_string()), tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn complete(
        &self,
        _topic: &str,
        _subscription: &str,
        lock_token: &str,
    ) -> Result<(), ServiceBusError> {
        self.state().completed.push(lock_token.to_string());
        Ok(())
    }

    async fn abandon(
        &self,
        _topic: &str,
        _subscription: &str,
        lock_token: &str,
    ) -> Result<(), ServiceBusError> {
        self.state().abandoned.push(lock_token.to_string());
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), ServiceBusError> {
        self.closed.store(true, Ordering::SeqCst);
        self.state().consumers.clear();
        Ok(())
    }
}

/// Connector handing out a shared in-memory broker, with a scriptable number
/// of failing connection attempts.
pub struct InMemoryConnector {
    client: Arc<InMemoryServiceBus>,
    fail_first: u32,
    attempts: AtomicU32,
}

impl InMemoryConnector {
    pub fn new(client: Arc<InMemoryServiceBus>) -> Self {
        Self {
            client,
            fail_first: 0,
            attempts: AtomicU32::new(0),
        }
    }

    pub fn failing_first(client: Arc<InMemoryServiceBus>, fail_first: u32) -> Self {
        Self {
            client,
            fail_first,
            attempts: AtomicU32::new(0),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServiceBusConnector for InMemoryConnector {
    async fn connect(
        &self,
        _connection_string: &str,
    ) -> Result<Arc<dyn ServiceBusClient>, ServiceBusError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_first {
            return Err(ServiceBusError::Transient("broker unreachable".to_string()));
        }
        Ok(Arc::clone(&self.client) as Arc<dyn ServiceBusClient>)
    }
}

// ============================================================================
// Test events and handlers
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderStartedIntegrationEvent {
    pub order_id: u64,
}

impl IntegrationEvent for OrderStartedIntegrationEvent {
    const NAME: &'static str = "OrderStartedIntegrationEvent";
}

/// Forwards received order ids to a channel the test can await.
pub struct OrderStartedHandler {
    tx: mpsc::UnboundedSender<u64>,
}

impl OrderStartedHandler {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<u64>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl IntegrationEventHandler<OrderStartedIntegrationEvent> for OrderStartedHandler {
    async fn handle(&self, event: &OrderStartedIntegrationEvent) -> Result<(), HandlerError> {
        self.tx
            .send(event.order_id)
            .map_err(|e| HandlerError::new(e.to_string()))
    }
}

/// Always fails; used to exercise the acknowledgment policies.
pub struct RejectingHandler;

#[async_trait]
impl IntegrationEventHandler<OrderStartedIntegrationEvent> for RejectingHandler {
    async fn handle(&self, _event: &OrderStartedIntegrationEvent) -> Result<(), HandlerError> {
        Err(HandlerError::new("rejected by handler"))
    }
}
