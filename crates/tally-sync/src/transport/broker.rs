//! # Broker
//!
//! In-process fan-out point every link attaches to.
//!
//! ```text
//!   terminal (memory link) ──┐                       ┌──► terminal
//!   phone A (ws via hub) ────┼──► Broker (broadcast) ┼──► phone A (joined topics only)
//!   phone B (ws via hub) ────┘                       └──► phone B (joined topics only)
//! ```
//!
//! A link never receives what it published itself.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::protocol::{Envelope, LinkFrame};

/// Capacity of the fan-out ring. A port that falls this far behind skips
/// ahead and loses the oldest envelopes.
const BROKER_CAPACITY: usize = 1024;

/// An envelope tagged with the port that published it.
#[derive(Debug, Clone)]
pub struct Routed {
    pub origin: u64,
    pub envelope: Envelope,
}

/// Shared pub/sub hub. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Broker {
    tx: broadcast::Sender<Routed>,
    next_port: Arc<AtomicU64>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROKER_CAPACITY);
        Broker {
            tx,
            next_port: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Attaches a port that only receives topics it has joined.
    pub fn attach(&self) -> (BrokerPort, broadcast::Receiver<Routed>) {
        self.attach_with(true)
    }

    /// Attaches a port that receives every topic.
    pub fn attach_unfiltered(&self) -> (BrokerPort, broadcast::Receiver<Routed>) {
        self.attach_with(false)
    }

    fn attach_with(&self, filtered: bool) -> (BrokerPort, broadcast::Receiver<Routed>) {
        let id = self.next_port.fetch_add(1, Ordering::Relaxed);
        let rx = self.tx.subscribe();
        debug!(port = id, filtered, "Port attached to broker");

        let port = BrokerPort {
            id,
            broker: self.clone(),
            topics: HashSet::new(),
            filtered,
        };
        (port, rx)
    }

    /// Fans an envelope out to every attached port. Returns the number of
    /// receivers, including the origin (which filters itself out).
    pub fn publish(&self, origin: u64, envelope: Envelope) -> usize {
        trace!(port = origin, topic = %envelope.topic, event = %envelope.event, "Broker publish");
        // No receivers is not an error: nobody is listening yet
        self.tx.send(Routed { origin, envelope }).unwrap_or(0)
    }

    /// Number of currently attached ports.
    pub fn port_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

// =============================================================================
// Broker Port
// =============================================================================

/// One link's view of the broker: its id and joined topics.
///
/// The receiver half is handed out separately by [`Broker::attach`] so a
/// pump can wait on it while still mutating the port.
#[derive(Debug)]
pub struct BrokerPort {
    id: u64,
    broker: Broker,
    topics: HashSet<String>,
    filtered: bool,
}

impl BrokerPort {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Applies a frame sent up by the link.
    ///
    /// A join returns the `joined` reply to send back down this link. The
    /// topic is already in effect when the reply is produced.
    pub fn apply(&mut self, frame: LinkFrame) -> Option<Envelope> {
        match frame {
            LinkFrame::Join { topic } => {
                debug!(port = self.id, topic = %topic, "Joined topic");
                let reply = Envelope::joined(&topic);
                self.topics.insert(topic);
                Some(reply)
            }
            LinkFrame::Leave { topic } => {
                debug!(port = self.id, topic = %topic, "Left topic");
                self.topics.remove(&topic);
                None
            }
            LinkFrame::Publish(envelope) => {
                self.broker.publish(self.id, envelope);
                None
            }
        }
    }

    /// Whether a routed envelope should be delivered down this link.
    pub fn accepts(&self, routed: &Routed) -> bool {
        routed.origin != self.id
            && (!self.filtered || self.topics.contains(&routed.envelope.topic))
    }

    pub fn has_joined(&self, topic: &str) -> bool {
        self.topics.contains(topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn envelope(topic: &str) -> Envelope {
        Envelope {
            topic: topic.into(),
            event: "request-carts".into(),
            payload: Value::Null,
        }
    }

    #[tokio::test]
    async fn test_no_self_echo() {
        let broker = Broker::new();
        let (mut a, mut a_rx) = broker.attach_unfiltered();
        let (b, mut b_rx) = broker.attach_unfiltered();

        a.apply(LinkFrame::Publish(envelope("pos-scans")));

        let at_b = b_rx.recv().await.unwrap();
        assert!(b.accepts(&at_b));

        let at_a = a_rx.recv().await.unwrap();
        assert!(!a.accepts(&at_a));
    }

    #[tokio::test]
    async fn test_filtered_port_needs_join() {
        let broker = Broker::new();
        let (mut publisher, _rx) = broker.attach_unfiltered();
        let (mut phone, mut phone_rx) = broker.attach();

        publisher.apply(LinkFrame::Publish(envelope("device_x")));
        let routed = phone_rx.recv().await.unwrap();
        assert!(!phone.accepts(&routed));

        let reply = phone.apply(LinkFrame::Join {
            topic: "device_x".into(),
        });
        assert!(reply.unwrap().is_join_reply());
        assert!(phone.accepts(&routed));

        phone.apply(LinkFrame::Leave {
            topic: "device_x".into(),
        });
        assert!(!phone.accepts(&routed));
    }

    #[test]
    fn test_port_ids_are_unique() {
        let broker = Broker::new();
        let (a, _a_rx) = broker.attach();
        let (b, _b_rx) = broker.attach();
        assert_ne!(a.id(), b.id());
        assert_eq!(broker.port_count(), 2);
    }
}
