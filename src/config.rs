//! Bus configuration types.
//!
//! Supports plain struct construction plus YAML file and environment
//! variable overrides.

use serde::Deserialize;

use crate::error::BusError;

/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "FERROBUS";
/// Default configuration file name (without extension).
pub const DEFAULT_CONFIG_FILE: &str = "ferrobus";

/// Bus configuration shared by both transports.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Max reconnect/publish retry attempts.
    pub connection_retry_count: u32,
    /// Exchange/topic all events on this bus go through.
    pub default_topic_name: String,
    /// Namespaces queue/subscription names per consuming service.
    pub subscriber_client_name: String,
    /// Stripped from the start of type names to form wire names.
    pub event_name_prefix: String,
    /// Stripped from the end of type names to form wire names.
    pub event_name_suffix: String,
    /// Acknowledgment policy when a handler fails.
    pub on_handler_failure: AckPolicy,
    /// Max simultaneous deliveries per receive loop.
    pub receive_concurrency: usize,
    /// Broker connection, tagged by broker kind.
    pub connection: BrokerConnection,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            connection_retry_count: 5,
            default_topic_name: "ferrobus.events".to_string(),
            subscriber_client_name: "ferrobus".to_string(),
            event_name_prefix: String::new(),
            event_name_suffix: "IntegrationEvent".to_string(),
            on_handler_failure: AckPolicy::default(),
            receive_concurrency: 1,
            connection: BrokerConnection::default(),
        }
    }
}

impl BusConfig {
    /// Load configuration from files and environment.
    ///
    /// Sources (later overrides earlier):
    /// 1. `ferrobus.yaml` in the current directory (if present)
    /// 2. File given by `path` (if provided)
    /// 3. Environment variables with the `FERROBUS` prefix
    pub fn load(path: Option<&str>) -> Result<Self, BusError> {
        use ::config::{Config, Environment, File, FileFormat};

        let mut builder = Config::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(path) = path {
            builder = builder.add_source(File::new(path, FileFormat::Yaml).required(true));
        }

        builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| BusError::Configuration(e.to_string()))?
            .try_deserialize()
            .map_err(|e| BusError::Configuration(e.to_string()))
    }

    /// Queue/subscription name for a wire event name, namespaced by the
    /// consuming service to avoid cross-service collisions.
    pub fn subscription_name(&self, wire_name: &str) -> String {
        format!("{}.{}", self.subscriber_client_name, wire_name)
    }
}

/// Broker connection descriptor, tagged by broker kind.
///
/// Each variant carries only the fields that kind's client library needs;
/// the variant also selects which transport the factory builds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BrokerConnection {
    /// AMQP queue/exchange broker.
    RabbitMq { url: String },
    /// Topic/subscription broker addressed by connection string.
    ServiceBus { connection_string: String },
}

impl Default for BrokerConnection {
    fn default() -> Self {
        Self::RabbitMq {
            url: "amqp://localhost:5672".to_string(),
        }
    }
}

/// What the receive loop does with a message whose handler failed.
///
/// Unmatched and undecodable messages are always completed; this policy only
/// governs handler failures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    /// Remove the message from the queue regardless of handler outcome
    /// (at-most-once delivery to handlers).
    #[default]
    AlwaysComplete,
    /// Return the message to the broker for redelivery when any handler
    /// failed.
    AbandonOnHandlerFailure,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BusConfig::default();
        assert_eq!(config.connection_retry_count, 5);
        assert_eq!(config.event_name_suffix, "IntegrationEvent");
        assert_eq!(config.on_handler_failure, AckPolicy::AlwaysComplete);
        assert_eq!(config.receive_concurrency, 1);
        assert_eq!(
            config.connection,
            BrokerConnection::RabbitMq {
                url: "amqp://localhost:5672".to_string()
            }
        );
    }

    #[test]
    fn test_subscription_name_namespaced_by_client() {
        let config = BusConfig {
            subscriber_client_name: "payment-service".to_string(),
            ..BusConfig::default()
        };
        assert_eq!(
            config.subscription_name("OrderStarted"),
            "payment-service.OrderStarted"
        );
    }

    #[test]
    fn test_connection_deserializes_tagged_by_kind() {
        let config: BusConfig = serde_json::from_str(
            r#"{
                "connection_retry_count": 3,
                "connection": { "kind": "servicebus", "connection_string": "sb://broker" }
            }"#,
        )
        .expect("config should deserialize");
        assert_eq!(config.connection_retry_count, 3);
        assert_eq!(
            config.connection,
            BrokerConnection::ServiceBus {
                connection_string: "sb://broker".to_string()
            }
        );
    }

    #[test]
    fn test_ack_policy_deserializes_snake_case() {
        let policy: AckPolicy = serde_json::from_str(r#""abandon_on_handler_failure""#)
            .expect("policy should deserialize");
        assert_eq!(policy, AckPolicy::AbandonOnHandlerFailure);
    }
}
