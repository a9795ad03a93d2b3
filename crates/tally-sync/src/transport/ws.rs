//! # WebSocket Link
//!
//! Connects a [`ChannelClient`](super::ChannelClient) to the hub's `/ws`
//! endpoint with `tokio-tungstenite`.
//!
//! ```text
//! ChannelClient ──LinkFrame──► pump ──Text(JSON)──► hub /ws ──► Broker
//! ChannelClient ◄──Envelope─── pump ◄──Text(JSON)── hub /ws ◄── Broker
//! ```

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use super::{Connector, Link, LINK_BUFFER};
use crate::error::{SyncError, SyncResult};
use crate::protocol::{Envelope, LinkFrame};

/// Ping interval for keepalive.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Connector for `ws://host:port/ws`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: Url,
}

impl WsConnector {
    /// Creates a connector, rejecting anything that is not a WebSocket URL.
    pub fn new(url: &str) -> SyncResult<Self> {
        let url = Url::parse(url)?;
        match url.scheme() {
            "ws" | "wss" => Ok(WsConnector { url }),
            other => Err(SyncError::InvalidUrl(format!(
                "expected ws:// or wss://, got {}://",
                other
            ))),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl Connector for WsConnector {
    async fn connect(&self) -> SyncResult<Link> {
        let (stream, response) = connect_async(self.url.as_str()).await?;
        info!(url = %self.url, status = ?response.status(), "WebSocket connected");

        let (frame_tx, frame_rx) = mpsc::channel::<LinkFrame>(LINK_BUFFER);
        let (envelope_tx, envelope_rx) = mpsc::channel::<Envelope>(LINK_BUFFER);

        tokio::spawn(pump(stream, frame_rx, envelope_tx));

        Ok(Link {
            tx: frame_tx,
            rx: envelope_rx,
        })
    }
}

/// Runs one socket until it closes, errors, or the client drops the link.
async fn pump(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut frame_rx: mpsc::Receiver<LinkFrame>,
    envelope_tx: mpsc::Sender<Envelope>,
) {
    let (mut write, mut read) = stream.split();

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick completes immediately
    ping.tick().await;

    loop {
        tokio::select! {
            frame = frame_rx.recv() => {
                let Some(frame) = frame else {
                    let _ = write.send(WsMessage::Close(None)).await;
                    break;
                };
                let json = match frame.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(?e, "Failed to encode link frame");
                        continue;
                    }
                };
                if let Err(e) = write.send(WsMessage::Text(json.into())).await {
                    warn!(?e, "WebSocket send failed");
                    break;
                }
            }

            message = read.next() => match message {
                Some(Ok(WsMessage::Text(text))) => match Envelope::from_json(&text) {
                    Ok(envelope) => {
                        if envelope_tx.send(envelope).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(?e, "Dropping malformed envelope"),
                },
                Some(Ok(WsMessage::Ping(data))) => {
                    if write.send(WsMessage::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    info!(?frame, "Hub closed the connection");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(?e, "WebSocket error");
                    break;
                }
                None => break,
            },

            _ = ping.tick() => {
                if write.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                debug!("Sent ping");
            }
        }
    }

    debug!("WebSocket link closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connector_requires_ws_scheme() {
        assert!(WsConnector::new("ws://192.168.1.10:8765/ws").is_ok());
        assert!(WsConnector::new("wss://hub.local/ws").is_ok());

        let err = WsConnector::new("http://192.168.1.10:8765/ws").unwrap_err();
        assert!(err.is_config_error());
        assert!(WsConnector::new("not a url").unwrap_err().is_config_error());
    }
}
