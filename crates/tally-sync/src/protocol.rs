//! # Channel Protocol
//!
//! Topics, event names and payloads carried over the pub/sub channel.
//!
//! ## Topics & Events
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Topic "pos-scans"                                                      │
//! │  ─────────────────                                                      │
//! │   remote-scan    phone → terminal   { code, device, quantity, cartId }  │
//! │   cart-sync      terminal → phones  { carts: [{ id, name }] }           │
//! │   request-carts  phone → terminal   {}                                  │
//! │   scan-ack       terminal → phones  { status, code, device, ... }       │
//! │                                                                         │
//! │  Topic "device_<deviceId>"                                              │
//! │  ─────────────────────────                                              │
//! │   status         terminal → phone   Device record                       │
//! │   removed        terminal → phone   { device_id }                       │
//! │                                                                         │
//! │  Any topic                                                              │
//! │  ─────────                                                              │
//! │   joined         hub → joining link  null, once the join is in effect   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Format
//! What a subscriber receives is an [`Envelope`]:
//! ```json
//! { "topic": "pos-scans", "event": "remote-scan", "payload": { "code": "1042", ... } }
//! ```
//!
//! What a client sends up its link is a [`LinkFrame`] (adjacently tagged):
//! ```json
//! { "type": "join",    "payload": { "topic": "pos-scans" } }
//! { "type": "publish", "payload": { "topic": "...", "event": "...", "payload": {} } }
//! ```
//!
//! Payloads are decoded into [`ChannelEvent`] at the transport boundary and
//! validated there; anything that fails is dropped before a handler sees it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use tally_core::{device_topic, CartSyncMessage, Device, DeviceRemoved, ScanAck, ScanEvent};

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Constants
// =============================================================================

/// Shared topic for scans, cart advertisements and acknowledgements.
pub const SCAN_TOPIC: &str = "pos-scans";

pub const EVENT_REMOTE_SCAN: &str = "remote-scan";
pub const EVENT_CART_SYNC: &str = "cart-sync";
pub const EVENT_REQUEST_CARTS: &str = "request-carts";
pub const EVENT_SCAN_ACK: &str = "scan-ack";
pub const EVENT_DEVICE_STATUS: &str = "status";
pub const EVENT_DEVICE_REMOVED: &str = "removed";

/// Reply to a join, sent only down the joining link. Handled by the
/// transport itself, never dispatched to subscribers.
pub const EVENT_JOINED: &str = "joined";

// =============================================================================
// Envelope & Link Frames
// =============================================================================

/// A message as it travels between links.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Join confirmation for `topic`.
    pub fn joined(topic: &str) -> Self {
        Envelope {
            topic: topic.to_string(),
            event: EVENT_JOINED.to_string(),
            payload: Value::Null,
        }
    }

    pub fn is_join_reply(&self) -> bool {
        self.event == EVENT_JOINED
    }
}

/// Client → hub frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum LinkFrame {
    /// Start receiving envelopes for a topic.
    Join { topic: String },
    /// Stop receiving envelopes for a topic.
    Leave { topic: String },
    /// Fan an envelope out to every other link.
    Publish(Envelope),
}

impl LinkFrame {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Empty `request-carts` payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Empty {}

// =============================================================================
// Channel Event (tagged union over event names)
// =============================================================================

/// Every payload the system exchanges, keyed by event name.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    RemoteScan(ScanEvent),
    CartSync(CartSyncMessage),
    RequestCarts,
    ScanAck(ScanAck),
    DeviceStatus(Device),
    DeviceRemoved(DeviceRemoved),
}

impl ChannelEvent {
    /// Wire event name.
    pub fn event_name(&self) -> &'static str {
        match self {
            ChannelEvent::RemoteScan(_) => EVENT_REMOTE_SCAN,
            ChannelEvent::CartSync(_) => EVENT_CART_SYNC,
            ChannelEvent::RequestCarts => EVENT_REQUEST_CARTS,
            ChannelEvent::ScanAck(_) => EVENT_SCAN_ACK,
            ChannelEvent::DeviceStatus(_) => EVENT_DEVICE_STATUS,
            ChannelEvent::DeviceRemoved(_) => EVENT_DEVICE_REMOVED,
        }
    }

    /// Wraps this event for publication on `topic`.
    pub fn to_envelope(&self, topic: &str) -> SyncResult<Envelope> {
        let payload = match self {
            ChannelEvent::RemoteScan(scan) => serde_json::to_value(scan)?,
            ChannelEvent::CartSync(sync) => serde_json::to_value(sync)?,
            ChannelEvent::RequestCarts => serde_json::to_value(Empty {})?,
            ChannelEvent::ScanAck(ack) => serde_json::to_value(ack)?,
            ChannelEvent::DeviceStatus(device) => serde_json::to_value(device)?,
            ChannelEvent::DeviceRemoved(removed) => serde_json::to_value(removed)?,
        };

        Ok(Envelope {
            topic: topic.to_string(),
            event: self.event_name().to_string(),
            payload,
        })
    }

    /// Decodes and validates an envelope.
    ///
    /// ## Errors
    /// - `UnknownEvent` for an event name this topic does not carry
    /// - `SerializationFailed` for a payload of the wrong shape
    /// - `InvalidMessage` for a payload that parses but fails validation
    pub fn decode(envelope: &Envelope) -> SyncResult<ChannelEvent> {
        let unknown = || SyncError::UnknownEvent {
            topic: envelope.topic.clone(),
            event: envelope.event.clone(),
        };

        if envelope.topic == SCAN_TOPIC {
            return match envelope.event.as_str() {
                EVENT_REMOTE_SCAN => {
                    let scan: ScanEvent = serde_json::from_value(envelope.payload.clone())?;
                    scan.validate()
                        .map_err(|e| SyncError::InvalidMessage(e.to_string()))?;
                    Ok(ChannelEvent::RemoteScan(scan))
                }
                EVENT_CART_SYNC => Ok(ChannelEvent::CartSync(serde_json::from_value(
                    envelope.payload.clone(),
                )?)),
                EVENT_REQUEST_CARTS => Ok(ChannelEvent::RequestCarts),
                EVENT_SCAN_ACK => Ok(ChannelEvent::ScanAck(serde_json::from_value(
                    envelope.payload.clone(),
                )?)),
                _ => Err(unknown()),
            };
        }

        if envelope.topic.starts_with("device_") {
            return match envelope.event.as_str() {
                EVENT_DEVICE_STATUS => {
                    let device: Device = serde_json::from_value(envelope.payload.clone())?;
                    ensure_own_topic(&envelope.topic, &device.device_id)?;
                    Ok(ChannelEvent::DeviceStatus(device))
                }
                EVENT_DEVICE_REMOVED => {
                    let removed: DeviceRemoved = serde_json::from_value(envelope.payload.clone())?;
                    ensure_own_topic(&envelope.topic, &removed.device_id)?;
                    Ok(ChannelEvent::DeviceRemoved(removed))
                }
                _ => Err(unknown()),
            };
        }

        Err(unknown())
    }
}

/// A device push must describe the device whose topic it arrived on.
fn ensure_own_topic(topic: &str, device_id: &str) -> SyncResult<()> {
    if topic != device_topic(device_id) {
        return Err(SyncError::InvalidMessage(format!(
            "record for {} published on {}",
            device_id, topic
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tally_core::CartSummary;

    #[test]
    fn test_remote_scan_wire_shape() {
        let event = ChannelEvent::RemoteScan(ScanEvent::new("1042", "Phone A", 2).to_cart("cart-3"));
        let envelope = event.to_envelope(SCAN_TOPIC).unwrap();

        assert_eq!(envelope.event, "remote-scan");
        assert_eq!(
            envelope.payload,
            json!({ "code": "1042", "device": "Phone A", "quantity": 2, "cartId": "cart-3" })
        );
        assert_eq!(ChannelEvent::decode(&envelope).unwrap(), event);
    }

    #[test]
    fn test_null_cart_id_decodes() {
        let envelope = Envelope {
            topic: SCAN_TOPIC.into(),
            event: EVENT_REMOTE_SCAN.into(),
            payload: json!({ "code": "1042", "device": "Phone A", "quantity": 1, "cartId": null }),
        };

        match ChannelEvent::decode(&envelope).unwrap() {
            ChannelEvent::RemoteScan(scan) => assert_eq!(scan.cart_id, None),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_cart_sync_carries_only_ids_and_names() {
        let event = ChannelEvent::CartSync(CartSyncMessage {
            carts: vec![CartSummary {
                id: "cart-1".into(),
                name: "Mostrador".into(),
            }],
        });
        let envelope = event.to_envelope(SCAN_TOPIC).unwrap();
        assert_eq!(
            envelope.payload,
            json!({ "carts": [{ "id": "cart-1", "name": "Mostrador" }] })
        );
    }

    #[test]
    fn test_invalid_quantity_is_rejected() {
        let envelope = Envelope {
            topic: SCAN_TOPIC.into(),
            event: EVENT_REMOTE_SCAN.into(),
            payload: json!({ "code": "1042", "device": "Phone A", "quantity": 0 }),
        };
        let err = ChannelEvent::decode(&envelope).unwrap_err();
        assert!(err.is_protocol_error());
    }

    #[test]
    fn test_schema_mismatch_is_rejected() {
        let envelope = Envelope {
            topic: SCAN_TOPIC.into(),
            event: EVENT_REMOTE_SCAN.into(),
            payload: json!({ "barcode": 1042 }),
        };
        assert!(ChannelEvent::decode(&envelope).unwrap_err().is_protocol_error());
    }

    #[test]
    fn test_unknown_event_is_rejected() {
        let envelope = Envelope {
            topic: SCAN_TOPIC.into(),
            event: "explode".into(),
            payload: Value::Null,
        };
        assert!(matches!(
            ChannelEvent::decode(&envelope),
            Err(SyncError::UnknownEvent { .. })
        ));
    }

    #[test]
    fn test_device_push_must_match_topic() {
        let device = Device::register("dev-1", "Phone A");
        let mut envelope = ChannelEvent::DeviceStatus(device)
            .to_envelope(&device_topic("dev-1"))
            .unwrap();
        assert!(ChannelEvent::decode(&envelope).is_ok());

        envelope.topic = device_topic("dev-2");
        assert!(ChannelEvent::decode(&envelope).unwrap_err().is_protocol_error());
    }

    #[test]
    fn test_link_frame_format() {
        let frame = LinkFrame::Join {
            topic: SCAN_TOPIC.into(),
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({ "type": "join", "payload": { "topic": "pos-scans" } })
        );

        let parsed = LinkFrame::from_json(&frame.to_json().unwrap()).unwrap();
        assert_eq!(parsed, frame);
    }
}
