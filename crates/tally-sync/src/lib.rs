//! # tally-sync: Cart Sync for Tally POS
//!
//! One terminal and any number of paired phone scanners, talking over a
//! topic-based pub/sub channel hosted by the terminal.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Terminal Process                               │
//! │                                                                         │
//! │  ┌────────────────┐   ┌─────────────────────────────────────────────┐  │
//! │  │   HubServer    │   │              TerminalService                │  │
//! │  │                │   │                                             │  │
//! │  │ GET  /ws       │   │  ScanRouter ──► CartRegistry ──► cart-sync  │  │
//! │  │ POST /devices  │   │  (Catalog)      (snapshot)       scan-ack   │  │
//! │  │ GET  /devices/ │   │                                             │  │
//! │  └───────┬────────┘   └──────────────────────▲──────────────────────┘  │
//! │          │                                   │ remote-scan             │
//! │  ┌───────▼────────┐   ┌──────────────────────┴──────────────────────┐  │
//! │  │    Broker      │◄──┤        ChannelClient (memory link)          │  │
//! │  │ topic fan-out  │   └─────────────────────────────────────────────┘  │
//! │  └───────▲────────┘                                                    │
//! │          │              PairingRegistry ──► status / removed pushes    │
//! └──────────┼──────────────────────────────────────────────────────────────┘
//!            │ ws://
//! ┌──────────┴──────────────────────────────────────────────────────────────┐
//! │  Phone: MobileScanner ── ChannelClient (WsConnector) + HttpPairingClient│
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Topics
//! - `pos-scans`: `remote-scan`, `cart-sync`, `request-carts`, `scan-ack`
//! - `device_<id>`: `status`, `removed`
//!
//! ## Module Organization
//! - [`transport`] - Channel client, broker, memory and WebSocket links
//! - [`protocol`] - Wire envelope and typed channel events
//! - [`pairing`] - Device registry and the scanner's pairing client
//! - [`carts`] - Terminal cart registry with persistence
//! - [`router`] - Scan routing against a catalog
//! - [`terminal`] - Single-task terminal service and handle
//! - [`scanner`] - Mobile scanner state machine
//! - [`hub`] - axum server hosting the channel and pairing API
//! - [`config`] - TOML + env configuration for both apps
//! - [`clock`] - Sleep seam for the reconnect path
//! - [`error`] - Sync error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tally_sync::{Broker, ChannelClient, MemoryConnector, TransportConfig};
//!
//! let broker = Broker::new();
//! let channel = ChannelClient::spawn(
//!     MemoryConnector::new(broker.clone()),
//!     TransportConfig::labeled("terminal"),
//! );
//!
//! let carts = CartRegistry::load(&db, Some(channel.clone()), "Mostrador").await?;
//! let handle = TerminalService::new(carts, ScanRouter::new(db.products()), channel).start();
//!
//! let overview = handle.carts().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod clock;
pub mod config;
pub mod error;
pub mod protocol;
pub mod transport;

pub mod carts;
pub mod hub;
pub mod pairing;
pub mod router;
pub mod scanner;
pub mod terminal;

// =============================================================================
// Re-exports
// =============================================================================

pub use clock::{Clock, ManualClock, TokioClock};
pub use config::{ScannerConfig, TerminalConfig, TransportSettings};
pub use error::{PairingError, SyncError, SyncResult, TransportError};
pub use protocol::{ChannelEvent, SCAN_TOPIC};
pub use transport::{
    Broker, ChannelClient, ConnectionState, MemoryConnector, Subscription, TransportConfig,
    WsConnector,
};

pub use carts::CartRegistry;
pub use hub::{HubConfig, HubHandle, HubServer, HubState};
pub use pairing::{HttpPairingClient, PairingClient, PairingRegistry};
pub use router::{Catalog, ScanRouter, StaticCatalog};
pub use scanner::{
    ConfigIdentity, IdentityStore, MemoryIdentity, MobileScanner, PendingScan, ScanPhase,
    ScannerState,
};
pub use terminal::{
    CartsOverview, NoOpEmitter, TerminalEventEmitter, TerminalHandle, TerminalService,
};
