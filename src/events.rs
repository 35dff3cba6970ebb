//! Publish/subscribe broker for pipeline events.
//!
//! Framer, queue and forwarder only see [`EventSink`]; subscribers (live
//! dashboards, the real-time forwarder) receive events from [`EventBroker`].

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::protocol::TelemetryRecord;
use crate::types::{ConnectionId, DeviceIdentity, RecordId};

/// Event topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    RecordStored,
    DeviceUpdated,
    ItemFailed,
    Connection,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Topic::RecordStored => "record.stored",
            Topic::DeviceUpdated => "device.updated",
            Topic::ItemFailed => "item.failed",
            Topic::Connection => "connection",
        };
        f.write_str(name)
    }
}

/// Pipeline event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A record was accepted by storage.
    RecordStored {
        id: RecordId,
        record: Arc<TelemetryRecord>,
    },
    /// A connection learned or changed its device identity.
    DeviceUpdated {
        identity: DeviceIdentity,
        connection: ConnectionId,
        peer: SocketAddr,
    },
    /// A queue item was dropped after exhausting its retries.
    ItemFailed {
        item: u64,
        identity: Option<DeviceIdentity>,
        retries: u32,
        reason: String,
    },
    ConnectionOpened {
        connection: ConnectionId,
        peer: SocketAddr,
    },
    ConnectionClosed {
        connection: ConnectionId,
        peer: SocketAddr,
        identity: Option<DeviceIdentity>,
    },
}

impl Event {
    pub fn topic(&self) -> Topic {
        match self {
            Event::RecordStored { .. } => Topic::RecordStored,
            Event::DeviceUpdated { .. } => Topic::DeviceUpdated,
            Event::ItemFailed { .. } => Topic::ItemFailed,
            Event::ConnectionOpened { .. } | Event::ConnectionClosed { .. } => Topic::Connection,
        }
    }
}

/// Anything events can be published to.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: Event);
}

/// Broadcast-backed broker.
pub struct EventBroker {
    tx: broadcast::Sender<Event>,
    published: AtomicU64,
}

impl EventBroker {
    /// Create a broker whose subscribers may lag by up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            published: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBroker {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventSink for EventBroker {
    fn publish(&self, event: Event) {
        trace!(topic = %event.topic(), "Publishing event");
        self.published.fetch_add(1, Ordering::Relaxed);
        // No subscribers is not an error
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let broker = EventBroker::new(8);
        let mut rx = broker.subscribe();

        broker.publish(Event::ItemFailed {
            item: 4,
            identity: None,
            retries: 3,
            reason: "storage down".into(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.topic(), Topic::ItemFailed);
        assert_eq!(broker.published(), 1);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let broker = EventBroker::default();
        broker.publish(Event::ConnectionOpened {
            connection: ConnectionId::new(),
            peer: "127.0.0.1:1".parse().unwrap(),
        });
        assert_eq!(broker.published(), 1);
        assert_eq!(Topic::RecordStored.to_string(), "record.stored");
    }
}
