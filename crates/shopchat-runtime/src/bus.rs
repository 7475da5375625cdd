//! Broadcast event bus
//!
//! Fans [`BusEvent`]s out to any number of subscribers over a tokio broadcast
//! channel. Slow subscribers lag and drop rather than back-pressuring the
//! delivery components.

use shopchat_core::{BusEvent, EventBus};
use tokio::sync::broadcast;
use tracing::trace;

const DEFAULT_BUS_CAPACITY: usize = 256;

/// Clonable broadcast-backed event bus
#[derive(Debug, Clone)]
pub struct BroadcastBus {
    sender: broadcast::Sender<BusEvent>,
}

impl BroadcastBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// New subscription; receives events published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus for BroadcastBus {
    fn publish(&self, event: BusEvent) {
        trace!(event = event.name(), "bus publish");
        // Err means no subscribers, which is fine
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus = BroadcastBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(BusEvent::Open);
        assert_eq!(a.recv().await.unwrap(), BusEvent::Open);
        assert_eq!(b.recv().await.unwrap(), BusEvent::Open);
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let bus = BroadcastBus::new();
        bus.publish(BusEvent::Close);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
