//! In-memory subscription bookkeeping.
//!
//! Maps wire event names to their subscriptions and payload decoders. The
//! owning transport consumes a removal channel to tear down broker topology
//! when an event's last subscription goes away.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::debug;

use crate::dispatch::HandlerResolver;
use crate::error::{CodecError, DispatchError, HandlerError, SubscriptionError};

/// A decoded event, shared by every handler invocation for one message.
pub type DecodedEvent = Arc<dyn Any + Send + Sync>;

/// Decodes the codec's structured value into the registered event shape.
pub type EventDecoder =
    Arc<dyn Fn(serde_json::Value) -> Result<DecodedEvent, CodecError> + Send + Sync>;

/// Outcome of invoking a single subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeOutcome {
    Handled,
    /// Handler resolution yielded no live instance; the subscription is
    /// skipped with a diagnostic.
    HandlerUnavailable,
}

/// Type-erased invoker built at subscribe time: resolves the live handler,
/// downcasts the decoded event, and calls `handle`.
pub type InvokeFn = dyn Fn(&dyn HandlerResolver, DecodedEvent) -> BoxFuture<'static, Result<InvokeOutcome, HandlerError>>
    + Send
    + Sync;

/// Identity of a handler type within the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId {
    type_id: TypeId,
    type_name: &'static str,
}

impl HandlerId {
    pub fn of<H: Any>() -> Self {
        Self {
            type_id: TypeId::of::<H>(),
            type_name: std::any::type_name::<H>(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub(crate) fn type_id(&self) -> TypeId {
        self.type_id
    }
}

/// A registered (event, handler) pair with its type-erased invoker.
#[derive(Clone)]
pub struct Subscription {
    handler: HandlerId,
    invoke: Arc<InvokeFn>,
}

impl Subscription {
    pub fn new(handler: HandlerId, invoke: Arc<InvokeFn>) -> Self {
        Self { handler, invoke }
    }

    pub fn handler(&self) -> HandlerId {
        self.handler
    }

    pub fn invoke(
        &self,
        resolver: &dyn HandlerResolver,
        event: DecodedEvent,
    ) -> BoxFuture<'static, Result<InvokeOutcome, HandlerError>> {
        (self.invoke)(resolver, event)
    }
}

#[derive(Default)]
struct Inner {
    subscriptions: HashMap<String, Vec<Subscription>>,
    decoders: HashMap<String, EventDecoder>,
}

/// Subscription store keyed by wire event name.
///
/// All mutations are linearizable; dispatch takes a snapshot of the
/// subscription list for the name it is processing, so insertion order is
/// preserved and concurrent mutation cannot tear a dispatch in progress.
pub struct SubscriptionRegistry {
    inner: RwLock<Inner>,
    removed_tx: mpsc::UnboundedSender<String>,
    removed_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        let (removed_tx, removed_rx) = mpsc::unbounded_channel();
        Self {
            inner: RwLock::default(),
            removed_tx,
            removed_rx: Mutex::new(Some(removed_rx)),
        }
    }

    /// Channel of event names whose last subscription was removed.
    ///
    /// The owning transport consumes it to tear down broker topology. Yields
    /// `None` once taken.
    pub async fn take_removal_listener(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.removed_rx.lock().await.take()
    }

    pub async fn has_subscriptions(&self, event_name: &str) -> bool {
        self.inner.read().await.subscriptions.contains_key(event_name)
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.subscriptions.is_empty()
    }

    /// Snapshot of the subscriptions for an event, in registration order.
    pub async fn handlers(&self, event_name: &str) -> Vec<Subscription> {
        self.inner
            .read()
            .await
            .subscriptions
            .get(event_name)
            .cloned()
            .unwrap_or_default()
    }

    /// Register a subscription, recording the event's decoder if this is the
    /// first registration for the name.
    pub async fn add(
        &self,
        event_name: &str,
        subscription: Subscription,
        decoder: EventDecoder,
    ) -> Result<(), SubscriptionError> {
        let mut inner = self.inner.write().await;

        let duplicate = inner
            .subscriptions
            .get(event_name)
            .is_some_and(|subs| subs.iter().any(|s| s.handler() == subscription.handler()));
        if duplicate {
            return Err(SubscriptionError::Duplicate {
                event_name: event_name.to_string(),
                handler: subscription.handler().type_name(),
            });
        }

        inner
            .decoders
            .entry(event_name.to_string())
            .or_insert(decoder);
        inner
            .subscriptions
            .entry(event_name.to_string())
            .or_default()
            .push(subscription);
        Ok(())
    }

    /// Remove a subscription. Emits an `event removed` notification when the
    /// last subscription for the name goes away.
    pub async fn remove(
        &self,
        event_name: &str,
        handler: HandlerId,
    ) -> Result<(), SubscriptionError> {
        let mut inner = self.inner.write().await;

        let not_found = || SubscriptionError::NotFound {
            event_name: event_name.to_string(),
            handler: handler.type_name(),
        };

        let subs = inner.subscriptions.get_mut(event_name).ok_or_else(not_found)?;
        let position = subs
            .iter()
            .position(|s| s.handler() == handler)
            .ok_or_else(not_found)?;
        subs.remove(position);

        if subs.is_empty() {
            inner.subscriptions.remove(event_name);
            inner.decoders.remove(event_name);
            debug!(event_name = %event_name, "last subscription removed");
            let _ = self.removed_tx.send(event_name.to_string());
        }
        Ok(())
    }

    /// Decoder for a wire event name.
    pub async fn decoder(&self, event_name: &str) -> Result<EventDecoder, DispatchError> {
        self.inner
            .read()
            .await
            .decoders
            .get(event_name)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownEventType(event_name.to_string()))
    }

    /// Drop all state; used on bus disposal.
    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.subscriptions.clear();
        inner.decoders.clear();
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct HandlerA;
    struct HandlerB;

    fn subscription<H: Any>() -> Subscription {
        Subscription::new(
            HandlerId::of::<H>(),
            Arc::new(|_, _| Box::pin(async { Ok(InvokeOutcome::Handled) })),
        )
    }

    fn decoder() -> EventDecoder {
        Arc::new(|value| Ok(Arc::new(value) as DecodedEvent))
    }

    #[tokio::test]
    async fn test_duplicate_subscription_rejected() {
        let registry = SubscriptionRegistry::new();
        registry
            .add("OrderCreated", subscription::<HandlerA>(), decoder())
            .await
            .expect("first add");

        let err = registry
            .add("OrderCreated", subscription::<HandlerA>(), decoder())
            .await
            .expect_err("second add of the same pair must fail");
        assert!(matches!(err, SubscriptionError::Duplicate { .. }));
        assert_eq!(registry.handlers("OrderCreated").await.len(), 1);
    }

    #[tokio::test]
    async fn test_distinct_handlers_share_event() {
        let registry = SubscriptionRegistry::new();
        registry
            .add("OrderCreated", subscription::<HandlerA>(), decoder())
            .await
            .expect("add A");
        registry
            .add("OrderCreated", subscription::<HandlerB>(), decoder())
            .await
            .expect("add B");

        let handlers = registry.handlers("OrderCreated").await;
        assert_eq!(handlers.len(), 2);
        assert_eq!(handlers[0].handler(), HandlerId::of::<HandlerA>());
        assert_eq!(handlers[1].handler(), HandlerId::of::<HandlerB>());
    }

    #[tokio::test]
    async fn test_removing_last_subscription_notifies_once() {
        let registry = SubscriptionRegistry::new();
        let mut removals = registry
            .take_removal_listener()
            .await
            .expect("listener available once");

        registry
            .add("OrderCreated", subscription::<HandlerA>(), decoder())
            .await
            .expect("add");
        registry
            .remove("OrderCreated", HandlerId::of::<HandlerA>())
            .await
            .expect("remove");

        assert_eq!(removals.recv().await.as_deref(), Some("OrderCreated"));
        assert!(removals.try_recv().is_err(), "exactly one notification");
        assert!(!registry.has_subscriptions("OrderCreated").await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_removal_with_remaining_handlers_does_not_notify() {
        let registry = SubscriptionRegistry::new();
        let mut removals = registry.take_removal_listener().await.expect("listener");

        registry
            .add("OrderCreated", subscription::<HandlerA>(), decoder())
            .await
            .expect("add A");
        registry
            .add("OrderCreated", subscription::<HandlerB>(), decoder())
            .await
            .expect("add B");
        registry
            .remove("OrderCreated", HandlerId::of::<HandlerA>())
            .await
            .expect("remove A");

        assert!(removals.try_recv().is_err());
        assert!(registry.has_subscriptions("OrderCreated").await);
    }

    #[tokio::test]
    async fn test_remove_unknown_pair_fails() {
        let registry = SubscriptionRegistry::new();
        let err = registry
            .remove("OrderCreated", HandlerId::of::<HandlerA>())
            .await
            .expect_err("unknown pair");
        assert!(matches!(err, SubscriptionError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_unknown_event_has_no_decoder() {
        let registry = SubscriptionRegistry::new();
        let err = match registry.decoder("Ghost").await {
            Ok(_) => panic!("no decoder"),
            Err(e) => e,
        };
        assert!(matches!(err, DispatchError::UnknownEventType(name) if name == "Ghost"));
    }

    #[tokio::test]
    async fn test_concurrent_adds_for_distinct_names() {
        let registry = Arc::new(SubscriptionRegistry::new());

        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    registry
                        .add(&format!("Event{i}"), subscription::<HandlerA>(), decoder())
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.expect("join").expect("add");
        }

        for i in 0..32 {
            assert_eq!(registry.handlers(&format!("Event{i}")).await.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_clear_drops_all_state() {
        let registry = SubscriptionRegistry::new();
        registry
            .add("OrderCreated", subscription::<HandlerA>(), decoder())
            .await
            .expect("add");
        registry.clear().await;
        assert!(registry.is_empty().await);
        assert!(registry.decoder("OrderCreated").await.is_err());
    }
}
