//! In-process pub/sub bus
//!
//! Backs tests and single-process deployments. Channels are created lazily
//! on first subscribe; dead subscribers are pruned on the next publish to
//! their channel.

use crate::bus::{Bus, BusError, BusMessage, BusResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// In-memory fire-and-forget pub/sub
#[derive(Debug, Clone, Default)]
pub struct MemoryBus {
    channels: Arc<Mutex<HashMap<String, Vec<mpsc::UnboundedSender<BusMessage>>>>>,
}

impl MemoryBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscribers on a channel (for tests)
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .get(channel)
            .map(|senders| senders.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, channel: &str, payload: String) -> BusResult<()> {
        let mut channels = self.channels.lock();

        let Some(senders) = channels.get_mut(channel) else {
            // Nobody listening; fire-and-forget drops the payload.
            tracing::trace!(channel, "publish to silent channel dropped");
            return Ok(());
        };

        senders.retain(|sender| {
            sender
                .send(BusMessage {
                    channel: channel.to_string(),
                    payload: payload.clone(),
                })
                .is_ok()
        });

        if senders.is_empty() {
            channels.remove(channel);
        }

        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> BusResult<mpsc::UnboundedReceiver<BusMessage>> {
        let (tx, rx) = mpsc::unbounded_channel();

        self.channels
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push(tx);

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_dropped() {
        let bus = MemoryBus::new();
        bus.publish("service:ghost@0", "hello".into()).await.unwrap();
        assert_eq!(bus.subscriber_count("service:ghost@0"), 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_after_subscribe_only() {
        let bus = MemoryBus::new();
        bus.publish("c", "before".into()).await.unwrap();

        let mut rx = bus.subscribe("c").await.unwrap();
        bus.publish("c", "after".into()).await.unwrap();

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.payload, "after");
        assert_eq!(msg.channel, "c");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fanout_to_all_subscribers() {
        let bus = MemoryBus::new();
        let mut rx1 = bus.subscribe("c").await.unwrap();
        let mut rx2 = bus.subscribe("c").await.unwrap();

        bus.publish("c", "x".into()).await.unwrap();

        assert_eq!(rx1.recv().await.unwrap().payload, "x");
        assert_eq!(rx2.recv().await.unwrap().payload, "x");
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let bus = MemoryBus::new();
        let rx = bus.subscribe("c").await.unwrap();
        drop(rx);

        bus.publish("c", "x".into()).await.unwrap();
        assert_eq!(bus.subscriber_count("c"), 0);
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let bus = MemoryBus::new();
        let mut rx_a = bus.subscribe("a").await.unwrap();
        let mut rx_b = bus.subscribe("b").await.unwrap();

        bus.publish("a", "for-a".into()).await.unwrap();

        assert_eq!(rx_a.recv().await.unwrap().payload, "for-a");
        assert!(rx_b.try_recv().is_err());
    }
}
