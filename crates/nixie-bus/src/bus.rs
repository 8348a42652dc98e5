//! Pub/sub transport trait
//!
//! Delivery is fire-and-forget: publishing to a channel with no subscribers
//! succeeds and the payload is dropped. Subscribers on the same channel each
//! receive every payload published after they subscribed; nothing is
//! replayed.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Result type alias for bus operations
pub type BusResult<T> = std::result::Result<T, BusError>;

/// Transport error types
#[derive(Error, Debug)]
pub enum BusError {
    #[error("publish to channel {channel} failed: {reason}")]
    PublishFailed { channel: String, reason: String },

    #[error("subscribe to channel {channel} failed: {reason}")]
    SubscribeFailed { channel: String, reason: String },

    #[error("bus connection lost: {reason}")]
    ConnectionLost { reason: String },
}

/// One payload delivered to a subscriber
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// The channel the payload was published on
    pub channel: String,
    /// The raw payload
    pub payload: String,
}

/// Fire-and-forget pub/sub transport
#[async_trait]
pub trait Bus: Send + Sync + std::fmt::Debug {
    /// Publish a payload to a channel
    ///
    /// Succeeds even when nobody is subscribed.
    async fn publish(&self, channel: &str, payload: String) -> BusResult<()>;

    /// Subscribe to a channel
    ///
    /// Returns a receiver yielding every payload published to the channel
    /// after this call. Dropping the receiver unsubscribes.
    async fn subscribe(&self, channel: &str) -> BusResult<mpsc::UnboundedReceiver<BusMessage>>;
}
