//! # tally-core: Pure Domain Logic for Tally POS
//!
//! Everything the terminal and the mobile scanners agree on, with zero I/O:
//! device approval rules, cart line math, the wire types that travel over the
//! channel, and input validation.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tally POS Architecture                           │
//! │                                                                         │
//! │  ┌──────────────────────┐                 ┌──────────────────────┐     │
//! │  │   apps/terminal      │                 │   apps/scanner       │     │
//! │  │   (cart owner, hub)  │◄── channel ───► │   (phone stand-in)   │     │
//! │  └──────────┬───────────┘                 └──────────┬───────────┘     │
//! │             │                                        │                  │
//! │  ┌──────────▼────────────────────────────────────────▼───────────────┐ │
//! │  │                        tally-sync                                 │ │
//! │  │   transport • pairing • carts • router • scanner client          │ │
//! │  └──────────┬────────────────────────────────────────────────────────┘ │
//! │             │                                                           │
//! │  ┌──────────▼───────────────┐   ┌─────────────────────────────────┐    │
//! │  │        tally-db          │   │   ★ tally-core (THIS CRATE) ★   │    │
//! │  │  devices, carts, catalog │──►│   device • cart • scan • money  │    │
//! │  └──────────────────────────┘   │   NO I/O • PURE FUNCTIONS       │    │
//! │                                 └─────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`device`] - Paired device record and its approval state machine
//! - [`cart`] - Carts, cart lines, and the terminal's cart book
//! - [`scan`] - Scan events, acknowledgements, catalog products
//! - [`money`] - Money type with integer arithmetic
//! - [`error`] - Domain error types
//! - [`validation`] - Input validation
//!
//! ## Example Usage
//!
//! ```rust
//! use tally_core::{CartBook, CatalogProduct, Money};
//!
//! let mut book = CartBook::new("Mostrador");
//! let widget = CatalogProduct::new("p-1042", "1042", "Widget", Money::from_cents(1000));
//!
//! let active = book.active_id().to_string();
//! book.apply(&active, &widget, 1).unwrap();
//! book.apply(&active, &widget, 1).unwrap();
//!
//! let cart = book.get(&active).unwrap();
//! assert_eq!(cart.items.len(), 1);
//! assert_eq!(cart.items[0].quantity, 2);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod cart;
pub mod device;
pub mod error;
pub mod money;
pub mod scan;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use cart::{Cart, CartBook, CartLine, CartSnapshot, CartSummary, LineChange};
pub use device::{device_topic, Device, DeviceAction, DeviceStatus, Transition};
pub use error::{CoreError, CoreResult, ValidationError};
pub use money::Money;
pub use scan::{AckStatus, CartSyncMessage, CatalogProduct, DeviceRemoved, ScanAck, ScanEvent};

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Reserved scan code that denotes a connectivity test.
///
/// The terminal acknowledges it and never touches a cart.
pub const CONNECTIVITY_TEST_CODE: &str = "__TEST_CONNECTION__";

/// Name given to the cart that exists when nothing else does.
pub const DEFAULT_CART_NAME: &str = "Mostrador";

/// Maximum quantity of a single line in a cart.
///
/// ## Business Reason
/// Prevents accidental over-scanning (e.g., typing 1000 instead of 10).
pub const MAX_ITEM_QUANTITY: i64 = 999;

/// Maximum length of cart and device names.
pub const MAX_NAME_LENGTH: usize = 60;
