//! Generic dispatch from inbound wire messages to registered handlers.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, error, warn};

use crate::codec::PayloadCodec;
use crate::config::AckPolicy;
use crate::error::{DispatchError, HandlerError};
use crate::event::EventNameTrimmer;
use crate::registry::{HandlerId, InvokeOutcome, SubscriptionRegistry};

/// Resolves a live handler instance for a handler identity.
///
/// The bus never constructs handlers; the consuming service registers
/// instances with a resolver (typically [`HandlerRegistry`]) at startup.
pub trait HandlerResolver: Send + Sync {
    fn resolve(&self, handler: &HandlerId) -> Option<Arc<dyn Any + Send + Sync>>;
}

/// In-memory handler resolver keyed by handler type.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<H: Any + Send + Sync>(&self, handler: H) {
        self.register_arc(Arc::new(handler));
    }

    pub fn register_arc<H: Any + Send + Sync>(&self, handler: Arc<H>) {
        self.map().insert(TypeId::of::<H>(), handler);
    }

    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<TypeId, Arc<dyn Any + Send + Sync>>> {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl HandlerResolver for HandlerRegistry {
    fn resolve(&self, handler: &HandlerId) -> Option<Arc<dyn Any + Send + Sync>> {
        self.map().get(&handler.type_id()).cloned()
    }
}

/// Failure of a single handler during dispatch.
#[derive(Debug)]
pub struct HandlerFailure {
    pub handler: &'static str,
    pub error: HandlerError,
}

/// Result of processing one inbound message.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// No subscriptions for the event name; expected, silently ignored.
    Unmatched,
    /// All handlers were invoked; failures are reported individually.
    Processed { failures: Vec<HandlerFailure> },
}

impl DispatchOutcome {
    /// Whether a handler set was matched and invoked.
    pub fn processed(&self) -> bool {
        matches!(self, Self::Processed { .. })
    }

    /// Whether the message should be removed from the queue under `policy`.
    pub fn should_complete(&self, policy: AckPolicy) -> bool {
        match self {
            Self::Unmatched => true,
            Self::Processed { failures } => {
                failures.is_empty() || policy == AckPolicy::AlwaysComplete
            }
        }
    }
}

/// Broker-agnostic dispatch pipeline: trim, look up, decode once, invoke all.
pub struct Dispatcher {
    registry: Arc<SubscriptionRegistry>,
    resolver: Arc<dyn HandlerResolver>,
    codec: Arc<dyn PayloadCodec>,
    trimmer: EventNameTrimmer,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        resolver: Arc<dyn HandlerResolver>,
        codec: Arc<dyn PayloadCodec>,
        trimmer: EventNameTrimmer,
    ) -> Self {
        Self {
            registry,
            resolver,
            codec,
            trimmer,
        }
    }

    /// Process one inbound message.
    ///
    /// Unmatched events are not an error. Unknown event types and decode
    /// failures surface as errors the receive loop acknowledges anyway;
    /// handler failures are collected in the outcome without aborting later
    /// handlers.
    pub async fn process_event(
        &self,
        wire_name: &str,
        payload: &[u8],
    ) -> Result<DispatchOutcome, DispatchError> {
        let event_name = self.trimmer.trim(wire_name);

        if !self.registry.has_subscriptions(&event_name).await {
            debug!(event_name = %event_name, "no subscriptions for event");
            return Ok(DispatchOutcome::Unmatched);
        }

        let decoder = self.registry.decoder(&event_name).await?;
        let value = self
            .codec
            .decode(payload)
            .map_err(|source| DispatchError::Decode {
                event_name: event_name.clone(),
                source,
            })?;
        let event = decoder(value).map_err(|source| DispatchError::Decode {
            event_name: event_name.clone(),
            source,
        })?;

        let subscriptions = self.registry.handlers(&event_name).await;
        let mut failures = Vec::new();
        for subscription in subscriptions {
            match subscription
                .invoke(self.resolver.as_ref(), Arc::clone(&event))
                .await
            {
                Ok(InvokeOutcome::Handled) => {}
                Ok(InvokeOutcome::HandlerUnavailable) => {
                    warn!(
                        event_name = %event_name,
                        handler = subscription.handler().type_name(),
                        "no live handler instance, skipping"
                    );
                }
                Err(err) => {
                    error!(
                        event_name = %event_name,
                        handler = subscription.handler().type_name(),
                        error = %err,
                        "handler failed"
                    );
                    failures.push(HandlerFailure {
                        handler: subscription.handler().type_name(),
                        error: err,
                    });
                }
            }
        }
        Ok(DispatchOutcome::Processed { failures })
    }
}
