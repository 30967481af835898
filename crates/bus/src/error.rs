//! Bus transport error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("no bus servers configured")]
    NoServers,

    #[error("failed to connect to bus at {servers}: {source}")]
    Connect {
        servers: String,
        source: async_nats::ConnectError,
    },

    #[error("publish failed: {0}")]
    Publish(#[from] async_nats::PublishError),

    #[error("subscribe to {subject} failed: {source}")]
    Subscribe {
        subject: String,
        source: async_nats::SubscribeError,
    },
}
