//! # Carts
//!
//! The terminal owns every cart. [`CartBook`] is the in-memory collection the
//! terminal mutates; the sync layer persists and advertises it.
//!
//! ## Invariants
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  1. The book is never empty. Deleting the last cart creates a fresh    │
//! │     default cart in the same call.                                     │
//! │  2. Cart ids come from a monotonic counter and are never reused.       │
//! │  3. At most one line per product_id per cart. A repeat scan bumps      │
//! │     the quantity of the existing line.                                 │
//! │  4. A line's unit price is frozen when the line is created.            │
//! │  5. The active cart id always names a live cart.                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::{CoreError, CoreResult};
use crate::money::Money;
use crate::scan::CatalogProduct;
use crate::validation::{validate_cart_name, validate_quantity};
use crate::MAX_ITEM_QUANTITY;

// =============================================================================
// Cart Line
// =============================================================================

/// One product in a cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct CartLine {
    pub product_id: String,
    pub product_name: String,
    /// Secondary code of the product when the line was created.
    pub code: String,
    pub quantity: i64,
    /// Price captured when the line was created. Later catalog changes do
    /// not touch it.
    pub unit_price: Money,
}

impl CartLine {
    fn from_product(product: &CatalogProduct, quantity: i64) -> Self {
        CartLine {
            product_id: product.id.clone(),
            product_name: product.name.clone(),
            code: product.code.clone(),
            quantity,
            unit_price: product.price,
        }
    }

    pub fn total(&self) -> Money {
        self.unit_price.multiply_quantity(self.quantity)
    }
}

// =============================================================================
// Cart
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct Cart {
    pub id: String,
    pub name: String,
    pub items: Vec<CartLine>,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
}

impl Cart {
    fn new(id: String, name: String) -> Self {
        Cart {
            id,
            name,
            items: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn line(&self, product_id: &str) -> Option<&CartLine> {
        self.items.iter().find(|l| l.product_id == product_id)
    }

    pub fn total(&self) -> Money {
        self.items.iter().map(CartLine::total).sum()
    }

    pub fn total_quantity(&self) -> i64 {
        self.items.iter().map(|l| l.quantity).sum()
    }

    pub fn summary(&self) -> CartSummary {
        CartSummary {
            id: self.id.clone(),
            name: self.name.clone(),
        }
    }

    /// Adds `quantity` of `product`, merging into an existing line.
    fn add(&mut self, product: &CatalogProduct, quantity: i64) -> CoreResult<LineChange> {
        if let Some(line) = self.items.iter_mut().find(|l| l.product_id == product.id) {
            let requested = line.quantity + quantity;
            if requested > MAX_ITEM_QUANTITY {
                return Err(CoreError::QuantityTooLarge {
                    requested,
                    max: MAX_ITEM_QUANTITY,
                });
            }
            let from = line.quantity;
            line.quantity = requested;
            return Ok(LineChange::Incremented { from, to: requested });
        }

        self.items.push(CartLine::from_product(product, quantity));
        Ok(LineChange::Added { quantity })
    }
}

/// `{ id, name }` pair advertised in `cart-sync`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CartSummary {
    pub id: String,
    pub name: String,
}

/// What a scan did to the destination cart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineChange {
    Added { quantity: i64 },
    Incremented { from: i64, to: i64 },
}

impl LineChange {
    /// Line quantity after the change.
    pub fn quantity(&self) -> i64 {
        match self {
            LineChange::Added { quantity } => *quantity,
            LineChange::Incremented { to, .. } => *to,
        }
    }
}

// =============================================================================
// Cart Book
// =============================================================================

/// Serializable state of a [`CartBook`], persisted by the terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartSnapshot {
    pub carts: Vec<Cart>,
    pub active_id: Option<String>,
    pub next_id: u64,
}

/// Ordered collection of live carts plus the active selection.
#[derive(Debug, Clone)]
pub struct CartBook {
    carts: Vec<Cart>,
    active_id: String,
    next_id: u64,
    default_name: String,
}

impl CartBook {
    /// Creates a book holding a single default cart.
    pub fn new(default_name: impl Into<String>) -> Self {
        let mut book = CartBook {
            carts: Vec::new(),
            active_id: String::new(),
            next_id: 1,
            default_name: default_name.into(),
        };
        book.seed_default();
        book
    }

    /// Restores a book from a snapshot, repairing an empty list or a stale
    /// active id instead of failing.
    pub fn from_snapshot(snapshot: CartSnapshot, default_name: impl Into<String>) -> Self {
        // Never hand out an id lower than one already seen.
        let highest = snapshot
            .carts
            .iter()
            .filter_map(|c| c.id.strip_prefix("cart-")?.parse::<u64>().ok())
            .max()
            .unwrap_or(0);

        let mut book = CartBook {
            carts: snapshot.carts,
            active_id: snapshot.active_id.unwrap_or_default(),
            next_id: snapshot.next_id.max(highest + 1).max(1),
            default_name: default_name.into(),
        };

        if book.carts.is_empty() {
            book.seed_default();
        } else if book.get(&book.active_id).is_none() {
            book.active_id = book.carts[0].id.clone();
        }
        book
    }

    pub fn snapshot(&self) -> CartSnapshot {
        CartSnapshot {
            carts: self.carts.clone(),
            active_id: Some(self.active_id.clone()),
            next_id: self.next_id,
        }
    }

    fn allocate_id(&mut self) -> String {
        let id = format!("cart-{}", self.next_id);
        self.next_id += 1;
        id
    }

    fn seed_default(&mut self) {
        let id = self.allocate_id();
        self.carts.push(Cart::new(id.clone(), self.default_name.clone()));
        self.active_id = id;
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn carts(&self) -> &[Cart] {
        &self.carts
    }

    pub fn summaries(&self) -> Vec<CartSummary> {
        self.carts.iter().map(Cart::summary).collect()
    }

    pub fn get(&self, id: &str) -> Option<&Cart> {
        self.carts.iter().find(|c| c.id == id)
    }

    fn get_mut(&mut self, id: &str) -> CoreResult<&mut Cart> {
        self.carts
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| CoreError::CartNotFound(id.to_string()))
    }

    pub fn active_id(&self) -> &str {
        &self.active_id
    }

    pub fn len(&self) -> usize {
        self.carts.len()
    }

    /// Always false; kept for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.carts.is_empty()
    }

    // =========================================================================
    // Administration
    // =========================================================================

    /// Appends a new empty cart and returns its summary.
    pub fn create(&mut self, name: &str) -> CoreResult<CartSummary> {
        let name = validate_cart_name(name)?;
        let id = self.allocate_id();
        let cart = Cart::new(id, name);
        let summary = cart.summary();
        self.carts.push(cart);
        Ok(summary)
    }

    /// Removes a cart. Moves the selection if the active cart went away and
    /// recreates the default cart if the book would become empty.
    pub fn delete(&mut self, id: &str) -> CoreResult<Cart> {
        let index = self
            .carts
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| CoreError::CartNotFound(id.to_string()))?;
        let removed = self.carts.remove(index);

        if self.carts.is_empty() {
            self.seed_default();
        } else if self.active_id == removed.id {
            self.active_id = self.carts[0].id.clone();
        }

        Ok(removed)
    }

    pub fn select(&mut self, id: &str) -> CoreResult<()> {
        if self.get(id).is_none() {
            return Err(CoreError::CartNotFound(id.to_string()));
        }
        self.active_id = id.to_string();
        Ok(())
    }

    pub fn rename(&mut self, id: &str, name: &str) -> CoreResult<CartSummary> {
        let name = validate_cart_name(name)?;
        let cart = self.get_mut(id)?;
        cart.name = name;
        Ok(cart.summary())
    }

    /// Empties a cart's lines, keeping the cart itself.
    pub fn clear(&mut self, id: &str) -> CoreResult<()> {
        self.get_mut(id)?.items.clear();
        Ok(())
    }

    // =========================================================================
    // Scan Application
    // =========================================================================

    /// Picks the cart a scan lands in.
    ///
    /// Order: the requested cart if it is live, else the active cart, else
    /// the first cart. The flag is true when a requested cart was missing.
    pub fn resolve_target(&self, requested: Option<&str>) -> (CartSummary, bool) {
        if let Some(cart) = requested.and_then(|id| self.get(id)) {
            return (cart.summary(), false);
        }

        let fell_back = requested.is_some();
        let cart = self
            .get(&self.active_id)
            .unwrap_or(&self.carts[0]);
        (cart.summary(), fell_back)
    }

    /// Adds `quantity` of `product` to cart `id`.
    pub fn apply(
        &mut self,
        id: &str,
        product: &CatalogProduct,
        quantity: i64,
    ) -> CoreResult<LineChange> {
        validate_quantity(quantity)?;
        self.get_mut(id)?.add(product, quantity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn widget() -> CatalogProduct {
        CatalogProduct::new("p-1042", "1042", "Widget", Money::from_cents(1000))
    }

    #[test]
    fn test_new_book_has_default_cart() {
        let book = CartBook::new("Mostrador");
        assert_eq!(book.len(), 1);
        assert_eq!(book.carts()[0].name, "Mostrador");
        assert_eq!(book.active_id(), "cart-1");
    }

    #[test]
    fn test_repeat_scan_increments_single_line() {
        let mut book = CartBook::new("Mostrador");
        let id = book.active_id().to_string();

        assert_eq!(
            book.apply(&id, &widget(), 1).unwrap(),
            LineChange::Added { quantity: 1 }
        );
        assert_eq!(
            book.apply(&id, &widget(), 1).unwrap(),
            LineChange::Incremented { from: 1, to: 2 }
        );

        let cart = book.get(&id).unwrap();
        assert_eq!(cart.items.len(), 1);
        assert_eq!(cart.items[0].product_name, "Widget");
        assert_eq!(cart.items[0].quantity, 2);
        assert_eq!(cart.items[0].unit_price, Money::from_cents(1000));
        assert_eq!(cart.total(), Money::from_cents(2000));
    }

    #[test]
    fn test_price_is_frozen_on_first_add() {
        let mut book = CartBook::new("Mostrador");
        let id = book.active_id().to_string();
        book.apply(&id, &widget(), 1).unwrap();

        let mut repriced = widget();
        repriced.price = Money::from_cents(1500);
        book.apply(&id, &repriced, 1).unwrap();

        assert_eq!(
            book.get(&id).unwrap().items[0].unit_price,
            Money::from_cents(1000)
        );
    }

    #[test]
    fn test_line_limit_rejects_without_mutation() {
        let mut book = CartBook::new("Mostrador");
        let id = book.active_id().to_string();
        book.apply(&id, &widget(), 999).unwrap();

        let err = book.apply(&id, &widget(), 1).unwrap_err();
        assert!(matches!(err, CoreError::QuantityTooLarge { requested: 1000, .. }));
        assert_eq!(book.get(&id).unwrap().items[0].quantity, 999);
    }

    #[test]
    fn test_deleting_last_cart_recreates_default() {
        let mut book = CartBook::new("Mostrador");
        book.delete("cart-1").unwrap();

        assert_eq!(book.len(), 1);
        assert_eq!(book.carts()[0].id, "cart-2");
        assert_eq!(book.carts()[0].name, "Mostrador");
        assert_eq!(book.active_id(), "cart-2");
    }

    #[test]
    fn test_ids_are_never_reused() {
        let mut book = CartBook::new("Mostrador");
        let second = book.create("Mesa 2").unwrap();
        book.delete(&second.id).unwrap();
        let third = book.create("Mesa 3").unwrap();

        assert_eq!(second.id, "cart-2");
        assert_eq!(third.id, "cart-3");
    }

    #[test]
    fn test_deleting_active_cart_moves_selection() {
        let mut book = CartBook::new("Mostrador");
        let mesa = book.create("Mesa 2").unwrap();
        book.select(&mesa.id).unwrap();

        book.delete(&mesa.id).unwrap();
        assert_eq!(book.active_id(), "cart-1");
    }

    #[test]
    fn test_resolve_target_fallback_chain() {
        let mut book = CartBook::new("Mostrador");
        let mesa = book.create("Mesa 2").unwrap();

        let (cart, fell_back) = book.resolve_target(Some(&mesa.id));
        assert_eq!(cart.id, mesa.id);
        assert!(!fell_back);

        let (cart, fell_back) = book.resolve_target(None);
        assert_eq!(cart.id, "cart-1");
        assert!(!fell_back);

        book.select(&mesa.id).unwrap();
        book.delete(&mesa.id).unwrap();
        let (cart, fell_back) = book.resolve_target(Some(&mesa.id));
        assert_eq!(cart.id, "cart-1");
        assert!(fell_back);
    }

    #[test]
    fn test_snapshot_restore_repairs_state() {
        let mut book = CartBook::new("Mostrador");
        book.create("Mesa 2").unwrap();
        let mut snapshot = book.snapshot();
        snapshot.active_id = Some("cart-99".into());
        snapshot.next_id = 1;

        let restored = CartBook::from_snapshot(snapshot, "Mostrador");
        assert_eq!(restored.active_id(), "cart-1");

        let mut restored = restored;
        assert_eq!(restored.create("Mesa 3").unwrap().id, "cart-3");

        let empty = CartSnapshot {
            carts: vec![],
            active_id: None,
            next_id: 7,
        };
        let seeded = CartBook::from_snapshot(empty, "Mostrador");
        assert_eq!(seeded.active_id(), "cart-7");
    }

    #[test]
    fn test_rename_and_clear() {
        let mut book = CartBook::new("Mostrador");
        book.apply("cart-1", &widget(), 3).unwrap();

        book.rename("cart-1", "Barra").unwrap();
        book.clear("cart-1").unwrap();

        let cart = book.get("cart-1").unwrap();
        assert_eq!(cart.name, "Barra");
        assert!(cart.items.is_empty());
        assert!(book.rename("cart-1", " ").is_err());
        assert!(book.clear("cart-9").is_err());
    }
}
