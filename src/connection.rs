//! Broker connection state machine: single-flight connect with bounded
//! exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::ConnectionError;

/// Opens physical broker connections; implemented per broker client library.
#[async_trait]
pub trait Connect: Send + Sync + 'static {
    type Connection: Send + Sync + 'static;

    async fn connect(&self) -> Result<Self::Connection, ConnectionError>;

    /// Whether the given connection handle still reports open.
    fn is_open(&self, connection: &Self::Connection) -> bool;

    /// Gracefully release a connection on disposal.
    async fn disconnect(&self, _connection: &Self::Connection) {}
}

/// Owns the single live connection shared by all bus operations.
///
/// `try_connect` is single-flight: concurrent callers wait on the in-flight
/// attempt instead of opening parallel physical connections. Channel creation
/// off the returned handle proceeds concurrently once connected.
pub struct PersistentConnection<C: Connect> {
    connector: C,
    retry_count: u32,
    current: RwLock<Option<Arc<C::Connection>>>,
    connect_gate: Mutex<()>,
}

impl<C: Connect> PersistentConnection<C> {
    pub fn new(connector: C, retry_count: u32) -> Self {
        Self {
            connector,
            retry_count,
            current: RwLock::new(None),
            connect_gate: Mutex::new(()),
        }
    }

    pub async fn is_connected(&self) -> bool {
        match self.current.read().await.as_ref() {
            Some(connection) => self.connector.is_open(connection),
            None => false,
        }
    }

    /// Attempt to connect, waiting `2^k` seconds before attempt `k`.
    ///
    /// Returns `true` on the first successful attempt, `false` once
    /// `retry_count + 1` attempts are exhausted. Callers arriving while an
    /// attempt is in flight wait for it and share its result.
    pub async fn try_connect(&self) -> bool {
        let _flight = self.connect_gate.lock().await;
        if self.is_connected().await {
            return true;
        }

        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_secs(2))
            .with_factor(2.0)
            .with_max_times(self.retry_count as usize)
            .build();

        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
            if attempt > 0 {
                debug!(
                    attempt,
                    delay_secs = delay.as_secs(),
                    "waiting before reconnect attempt"
                );
                tokio::time::sleep(delay).await;
            }

            match self.connector.connect().await {
                Ok(connection) => {
                    *self.current.write().await = Some(Arc::new(connection));
                    info!(attempt = attempt + 1, "broker connection established");
                    return true;
                }
                Err(err) => {
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = self.retry_count + 1,
                        error = %err,
                        "broker connection attempt failed"
                    );
                }
            }
        }

        false
    }

    /// Live connection handle, connecting first if necessary.
    pub async fn handle(&self) -> Result<Arc<C::Connection>, ConnectionError> {
        if !self.is_connected().await {
            debug!("no live broker connection, reconnecting");
            if !self.try_connect().await {
                return Err(ConnectionError::Unavailable);
            }
        }
        self.current
            .read()
            .await
            .clone()
            .ok_or(ConnectionError::Unavailable)
    }

    /// Release the connection. Idempotent.
    pub async fn dispose(&self) {
        if let Some(connection) = self.current.write().await.take() {
            self.connector.disconnect(&connection).await;
        }
    }
}
