//! # Scan Wire Types
//!
//! Messages exchanged on the `pos-scans` topic, plus the catalog product a
//! scan resolves to.
//!
//! ```text
//! phone ── remote-scan { code, device, quantity, cartId } ──► terminal
//! phone ◄── scan-ack   { status, code, device, message, ... } ── terminal
//! phone ◄── cart-sync  { carts: [{ id, name }] } ────────────── terminal
//! phone ── request-carts {} ─────────────────────────────────► terminal
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use ts_rs::TS;

use crate::cart::CartSummary;
use crate::error::ValidationError;
use crate::money::Money;
use crate::validation::{validate_code, validate_quantity};
use crate::CONNECTIVITY_TEST_CODE;

// =============================================================================
// Scan Event
// =============================================================================

/// A scan pushed by a mobile device. Transient; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct ScanEvent {
    pub code: String,

    /// Name of the sending device.
    #[serde(rename = "device")]
    pub device_name: String,

    pub quantity: i64,

    /// Destination chosen on the phone; `None` means "active cart".
    #[serde(default)]
    pub cart_id: Option<String>,
}

impl ScanEvent {
    pub fn new(code: impl Into<String>, device_name: impl Into<String>, quantity: i64) -> Self {
        ScanEvent {
            code: code.into(),
            device_name: device_name.into(),
            quantity,
            cart_id: None,
        }
    }

    /// Sets the target cart.
    pub fn to_cart(mut self, cart_id: impl Into<String>) -> Self {
        self.cart_id = Some(cart_id.into());
        self
    }

    /// Builds the connectivity-test event for a device.
    pub fn connectivity_test(device_name: impl Into<String>) -> Self {
        ScanEvent::new(CONNECTIVITY_TEST_CODE, device_name, 1)
    }

    pub fn is_connectivity_test(&self) -> bool {
        self.code == CONNECTIVITY_TEST_CODE
    }

    /// Checks the fields a malformed or hostile sender could get wrong.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_code(&self.code)?;
        if self.device_name.trim().is_empty() {
            return Err(ValidationError::Required {
                field: "device".to_string(),
            });
        }
        validate_quantity(self.quantity)?;
        if matches!(&self.cart_id, Some(id) if id.trim().is_empty()) {
            return Err(ValidationError::InvalidFormat {
                field: "cartId".to_string(),
                reason: "must be null or a cart id".to_string(),
            });
        }
        Ok(())
    }
}

// =============================================================================
// Acknowledgement
// =============================================================================

/// Outcome category of a routed scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum AckStatus {
    /// Line added or incremented.
    Ok,
    /// Connectivity test answered; nothing mutated.
    Test,
    /// Code did not resolve against the catalog.
    NotFound,
    /// Resolved but refused (line limit, catalog failure).
    Rejected,
}

impl AckStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, AckStatus::Ok | AckStatus::Test)
    }
}

impl fmt::Display for AckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckStatus::Ok => write!(f, "ok"),
            AckStatus::Test => write!(f, "test"),
            AckStatus::NotFound => write!(f, "not_found"),
            AckStatus::Rejected => write!(f, "rejected"),
        }
    }
}

/// Terminal's answer to a scan; shown on the terminal and on the phone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct ScanAck {
    pub status: AckStatus,
    pub code: String,
    pub device: String,
    pub message: String,
    #[serde(default)]
    pub product_name: Option<String>,
    pub quantity: i64,
    #[serde(default)]
    pub cart_id: Option<String>,
    #[serde(default)]
    pub cart_name: Option<String>,
    /// True when the requested cart was gone and another one received the line.
    #[serde(default)]
    pub fell_back: bool,
}

impl ScanAck {
    fn base(event: &ScanEvent, status: AckStatus, message: String) -> Self {
        ScanAck {
            status,
            code: event.code.clone(),
            device: event.device_name.clone(),
            message,
            product_name: None,
            quantity: event.quantity,
            cart_id: None,
            cart_name: None,
            fell_back: false,
        }
    }

    pub fn connectivity_ok(event: &ScanEvent) -> Self {
        ScanAck::base(event, AckStatus::Test, "Connection OK".to_string())
    }

    pub fn not_found(event: &ScanEvent) -> Self {
        ScanAck::base(
            event,
            AckStatus::NotFound,
            format!("Product not found: {}", event.code),
        )
    }

    pub fn rejected(event: &ScanEvent, reason: impl Into<String>) -> Self {
        ScanAck::base(event, AckStatus::Rejected, reason.into())
    }

    pub fn applied(
        event: &ScanEvent,
        product_name: &str,
        cart: &CartSummary,
        fell_back: bool,
    ) -> Self {
        let mut ack = ScanAck::base(
            event,
            AckStatus::Ok,
            format!("Added {} x {} to {}", event.quantity, product_name, cart.name),
        );
        ack.product_name = Some(product_name.to_string());
        ack.cart_id = Some(cart.id.clone());
        ack.cart_name = Some(cart.name.clone());
        ack.fell_back = fell_back;
        ack
    }
}

// =============================================================================
// Cart Advertisement
// =============================================================================

/// `cart-sync` payload: cart ids and names only, never contents.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CartSyncMessage {
    pub carts: Vec<CartSummary>,
}

/// `removed` payload on a device topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct DeviceRemoved {
    pub device_id: String,
}

// =============================================================================
// Catalog Product
// =============================================================================

/// Read-only product view the router resolves scans against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct CatalogProduct {
    pub id: String,
    /// Human-readable secondary code (SKU).
    pub code: String,
    pub name: String,
    pub price: Money,
}

impl CatalogProduct {
    pub fn new(
        id: impl Into<String>,
        code: impl Into<String>,
        name: impl Into<String>,
        price: Money,
    ) -> Self {
        CatalogProduct {
            id: id.into(),
            code: code.into(),
            name: name.into(),
            price,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_event_wire_names() {
        let event = ScanEvent::new("1042", "Phone A", 2).to_cart("cart-1");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["code"], "1042");
        assert_eq!(json["device"], "Phone A");
        assert_eq!(json["quantity"], 2);
        assert_eq!(json["cartId"], "cart-1");
    }

    #[test]
    fn test_missing_cart_id_means_none() {
        let event: ScanEvent =
            serde_json::from_str(r#"{"code":"1042","device":"Phone A","quantity":1}"#).unwrap();
        assert_eq!(event.cart_id, None);
        assert!(event.validate().is_ok());
    }

    #[test]
    fn test_scan_event_validation() {
        assert!(ScanEvent::new("", "Phone A", 1).validate().is_err());
        assert!(ScanEvent::new("1042", " ", 1).validate().is_err());
        assert!(ScanEvent::new("1042", "Phone A", 0).validate().is_err());
        assert!(ScanEvent::new("1042", "Phone A", 1)
            .to_cart("")
            .validate()
            .is_err());
    }

    #[test]
    fn test_connectivity_sentinel() {
        let event = ScanEvent::connectivity_test("Phone A");
        assert!(event.is_connectivity_test());
        assert!(event.validate().is_ok());

        let ack = ScanAck::connectivity_ok(&event);
        assert!(ack.status.is_success());
        assert!(ack.cart_id.is_none());
    }

    #[test]
    fn test_applied_ack_names_product_and_cart() {
        let event = ScanEvent::new("1042", "Phone A", 1);
        let cart = CartSummary {
            id: "cart-1".into(),
            name: "Mostrador".into(),
        };
        let ack = ScanAck::applied(&event, "Widget", &cart, false);
        assert_eq!(ack.message, "Added 1 x Widget to Mostrador");
        assert_eq!(ack.cart_name.as_deref(), Some("Mostrador"));
    }
}
