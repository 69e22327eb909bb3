//! Integration event and handler contracts, plus wire-name derivation.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::BusConfig;
use crate::error::HandlerError;

/// A named, serializable integration event.
///
/// `NAME` is the raw event type name as declared by the publishing service
/// (e.g. `"OrderStartedIntegrationEvent"`); the bus derives the wire name
/// from it by trimming the configured prefix/suffix.
pub trait IntegrationEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    const NAME: &'static str;
}

/// Handler for a single integration event type.
///
/// Handlers are registered with a [`crate::dispatch::HandlerResolver`] by the
/// consuming service; the bus looks them up at dispatch time and never
/// constructs them itself.
#[async_trait]
pub trait IntegrationEventHandler<E: IntegrationEvent>: Send + Sync + 'static {
    async fn handle(&self, event: &E) -> Result<(), HandlerError>;
}

/// Derives wire-level event names by trimming a configured prefix/suffix.
///
/// Trimming repeats until neither affix matches, so the function is
/// idempotent: `trim(trim(x)) == trim(x)`.
#[derive(Debug, Clone, Default)]
pub struct EventNameTrimmer {
    prefix: String,
    suffix: String,
}

impl EventNameTrimmer {
    pub fn new(prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            suffix: suffix.into(),
        }
    }

    pub fn from_config(config: &BusConfig) -> Self {
        Self::new(
            config.event_name_prefix.clone(),
            config.event_name_suffix.clone(),
        )
    }

    /// Wire name for a raw event type name. Pure, no failure modes.
    pub fn trim(&self, raw: &str) -> String {
        let mut name = raw;
        loop {
            let mut trimmed = name;
            if !self.prefix.is_empty() {
                if let Some(rest) = trimmed.strip_prefix(self.prefix.as_str()) {
                    trimmed = rest;
                }
            }
            if !self.suffix.is_empty() {
                if let Some(rest) = trimmed.strip_suffix(self.suffix.as_str()) {
                    trimmed = rest;
                }
            }
            if trimmed == name {
                return name.to_string();
            }
            name = trimmed;
        }
    }
}
