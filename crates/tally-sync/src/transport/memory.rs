//! # Memory Link
//!
//! Connects a [`ChannelClient`](super::ChannelClient) to a [`Broker`] in the
//! same process. The terminal uses it to sit on the broker its hub serves;
//! tests use it to wire terminals and scanners together without sockets.
//!
//! `set_online(false)` simulates a network outage: live links are cut and
//! new connection attempts fail until it is set back.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, warn};

use super::broker::{Broker, BrokerPort, Routed};
use super::{Connector, Link, LINK_BUFFER};
use crate::error::{SyncResult, TransportError};
use crate::protocol::{Envelope, LinkFrame};

/// Connector that attaches to an in-process broker.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    broker: Broker,
    online: Arc<watch::Sender<bool>>,
}

impl MemoryConnector {
    pub fn new(broker: Broker) -> Self {
        let (online, _) = watch::channel(true);
        MemoryConnector {
            broker,
            online: Arc::new(online),
        }
    }

    /// Simulates connectivity. Going offline drops every live link.
    pub fn set_online(&self, online: bool) {
        debug!(online, "Memory link connectivity changed");
        self.online.send_replace(online);
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }
}

impl Connector for MemoryConnector {
    async fn connect(&self) -> SyncResult<Link> {
        if !self.is_online() {
            return Err(TransportError::ConnectFailed("broker unreachable".into()).into());
        }

        let (port, broker_rx) = self.broker.attach_unfiltered();
        let (frame_tx, frame_rx) = mpsc::channel::<LinkFrame>(LINK_BUFFER);
        let (envelope_tx, envelope_rx) = mpsc::channel::<Envelope>(LINK_BUFFER);

        tokio::spawn(pump(
            port,
            broker_rx,
            frame_rx,
            envelope_tx,
            self.online.subscribe(),
        ));

        Ok(Link {
            tx: frame_tx,
            rx: envelope_rx,
        })
    }
}

/// Moves frames up into the broker and envelopes down to the client until
/// either side goes away or the link is taken offline.
async fn pump(
    mut port: BrokerPort,
    mut broker_rx: broadcast::Receiver<Routed>,
    mut frame_rx: mpsc::Receiver<LinkFrame>,
    envelope_tx: mpsc::Sender<Envelope>,
    mut online: watch::Receiver<bool>,
) {
    let port_id = port.id();
    debug!(port = port_id, "Memory link up");

    loop {
        tokio::select! {
            frame = frame_rx.recv() => match frame {
                Some(frame) => {
                    if let Some(reply) = port.apply(frame) {
                        if envelope_tx.send(reply).await.is_err() {
                            break;
                        }
                    }
                }
                None => break,
            },

            routed = broker_rx.recv() => match routed {
                Ok(routed) => {
                    if port.accepts(&routed) && envelope_tx.send(routed.envelope).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(port = port_id, skipped, "Memory link lagged behind broker");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },

            changed = online.changed() => {
                if changed.is_err() || !*online.borrow_and_update() {
                    break;
                }
            }
        }
    }

    debug!(port = port_id, "Memory link down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SCAN_TOPIC;
    use serde_json::Value;
    use std::time::Duration;

    fn publish() -> LinkFrame {
        LinkFrame::Publish(Envelope {
            topic: SCAN_TOPIC.into(),
            event: "request-carts".into(),
            payload: Value::Null,
        })
    }

    #[tokio::test]
    async fn test_links_exchange_envelopes() {
        let connector = MemoryConnector::new(Broker::new());
        let a = connector.connect().await.unwrap();
        let mut b = connector.connect().await.unwrap();

        a.tx.send(publish()).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), b.rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.topic, SCAN_TOPIC);
    }

    #[tokio::test]
    async fn test_offline_refuses_and_cuts_links() {
        let connector = MemoryConnector::new(Broker::new());
        let mut live = connector.connect().await.unwrap();

        connector.set_online(false);
        assert!(connector.connect().await.is_err());

        let closed = tokio::time::timeout(Duration::from_secs(1), live.rx.recv())
            .await
            .unwrap();
        assert!(closed.is_none());

        connector.set_online(true);
        assert!(connector.connect().await.is_ok());
    }
}
