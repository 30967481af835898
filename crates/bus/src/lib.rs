//! Message bus client
//!
//! Thin wrapper over an `async-nats` connection. Every other component talks
//! to the bus through this crate: fire-and-forget `publish`, wildcard-capable
//! `subscribe`, and a `healthy` probe fed into the readiness check.
//!
//! Delivery is at-most-once; per-message losses are tolerated by design and
//! recovered at a higher level (session timeouts).

mod error;

pub use error::BusError;

use std::time::Duration;

use async_nats::connection::State;
use bytes::Bytes;

/// Handle to an inbound message stream. Re-exported so services can spawn
/// their own reader tasks without depending on `async-nats` directly.
pub type Subscriber = async_nats::Subscriber;
/// One delivered message (subject, payload, optional reply subject).
pub type Message = async_nats::Message;

/// Publish side of the bus, the seam services depend on. The live
/// implementation is [`BusClient`]; tests substitute collectors.
#[async_trait::async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError>;
}

/// Connected bus client, cheap to clone.
#[derive(Clone)]
pub struct BusClient {
    client: async_nats::Client,
}

#[async_trait::async_trait]
impl Publisher for BusClient {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError> {
        BusClient::publish(self, subject, payload).await
    }
}

impl BusClient {
    /// Connect using the configured servers, credentials and timeout.
    pub async fn connect(cfg: &loqa_config::BusConfig) -> Result<Self, BusError> {
        if cfg.servers.is_empty() {
            return Err(BusError::NoServers);
        }

        let mut options = async_nats::ConnectOptions::new()
            .name("loqa-runtime")
            .connection_timeout(Duration::from_millis(cfg.connect_timeout_ms));

        if let (Some(user), Some(pass)) = (cfg.username.clone(), cfg.password.clone()) {
            options = options.user_and_password(user, pass);
        }
        if let Some(token) = cfg.token.clone() {
            options = options.token(token);
        }

        let url = cfg.servers.join(",");
        let client = async_nats::connect_with_options(url.clone(), options)
            .await
            .map_err(|source| BusError::Connect {
                servers: url.clone(),
                source,
            })?;

        tracing::info!(servers = %url, "connected to message bus");
        Ok(Self { client })
    }

    /// Publish a payload. Non-blocking on success; the send is buffered and
    /// flushed by the client's writer task.
    pub async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BusError> {
        self.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(BusError::from)
    }

    /// Subscribe to a subject pattern (`*` single token, `>` trailing tail).
    /// The returned stream yields one [`Message`] per delivery; callers spawn
    /// their own reader task and must not block it beyond an enqueue.
    pub async fn subscribe(&self, subject: &str) -> Result<Subscriber, BusError> {
        self.client
            .subscribe(subject.to_string())
            .await
            .map_err(|source| BusError::Subscribe {
                subject: subject.to_string(),
                source,
            })
    }

    /// True iff the underlying connection is currently connected.
    pub fn healthy(&self) -> bool {
        self.client.connection_state() == State::Connected
    }

    /// Flush buffered sends; the connection closes when the last clone is
    /// dropped.
    pub async fn close(&self) {
        if let Err(error) = self.client.flush().await {
            tracing::warn!(%error, "bus flush on close failed");
        }
        tracing::info!("message bus connection closed");
    }
}

impl std::fmt::Debug for BusClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusClient")
            .field("state", &self.client.connection_state())
            .finish()
    }
}
