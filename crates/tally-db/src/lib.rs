//! # tally-db: Database Layer for Tally POS
//!
//! SQLite storage for the terminal side of the system.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tally POS Data Flow                              │
//! │                                                                         │
//! │  PairingRegistry   CartRegistry     ScanRouter (Catalog)               │
//! │       │                 │                 │                             │
//! │       ▼                 ▼                 ▼                             │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     tally-db (THIS CRATE)                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌────────────────┐   ┌──────────────┐   │   │
//! │  │   │   Database    │    │  Repositories  │   │  Migrations  │   │   │
//! │  │   │   (pool.rs)   │◄───│ DeviceRepo     │   │  (embedded)  │   │   │
//! │  │   │               │    │ CartRepo       │   │              │   │   │
//! │  │   │ SqlitePool    │    │ ProductRepo    │   │ 0001..0003   │   │   │
//! │  │   └───────────────┘    └────────────────┘   └──────────────┘   │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite file (terminal.db)                                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tally_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("terminal.db")).await?;
//! let pending = db.devices().list().await?;
//! let widget = db.products().lookup("1042").await?;
//! ```

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

pub use repository::cart::CartRepository;
pub use repository::device::DeviceRepository;
pub use repository::product::ProductRepository;
