//! # Repository Module
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  db.devices()  ── DeviceRepository  ── devices table                   │
//! │  db.carts()    ── CartRepository    ── cart_snapshot table (JSON)      │
//! │  db.products() ── ProductRepository ── products table (catalog)        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each repository owns a clone of the pool; construct them freely.

pub mod cart;
pub mod device;
pub mod product;
