//! # Scan Event Router
//!
//! Turns a [`ScanEvent`] into a cart mutation and a [`ScanAck`].
//!
//! ## Routing Steps
//! ```text
//! ScanEvent
//!    │
//!    ├─ code == __TEST_CONNECTION__ ──────────────► ack(test)      no mutation
//!    │
//!    ├─ catalog.lookup(code)  id → SKU → barcode
//!    │     └─ miss ───────────────────────────────► ack(not_found) no mutation
//!    │
//!    ├─ target: cartId if live → active cart → first cart
//!    │
//!    ├─ cart.apply(product, quantity)
//!    │     └─ line would exceed 999 ──────────────► ack(rejected)  no mutation
//!    │
//!    └────────────────────────────────────────────► ack(ok, product, cart, fell_back)
//! ```
//!
//! The router is only ever called from the terminal task, one event at a
//! time, which is what makes each application atomic.

use std::future::Future;

use tracing::{debug, info, warn};

use tally_core::{CatalogProduct, CoreError, ScanAck, ScanEvent};
use tally_db::ProductRepository;

use crate::carts::CartRegistry;
use crate::error::{SyncError, SyncResult};

// =============================================================================
// Catalog Seam
// =============================================================================

/// Read-only product lookup.
pub trait Catalog: Send + Sync + 'static {
    /// Resolves a scanned code: product id first, then SKU, then barcode.
    fn lookup(
        &self,
        code: &str,
    ) -> impl Future<Output = SyncResult<Option<CatalogProduct>>> + Send;
}

impl Catalog for ProductRepository {
    async fn lookup(&self, code: &str) -> SyncResult<Option<CatalogProduct>> {
        Ok(ProductRepository::lookup(self, code).await?)
    }
}

/// Fixed in-memory catalog for demos and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    entries: Vec<(CatalogProduct, Option<String>)>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_product(mut self, product: CatalogProduct) -> Self {
        self.entries.push((product, None));
        self
    }

    pub fn with_barcode(mut self, product: CatalogProduct, barcode: impl Into<String>) -> Self {
        self.entries.push((product, Some(barcode.into())));
        self
    }
}

impl Catalog for StaticCatalog {
    async fn lookup(&self, code: &str) -> SyncResult<Option<CatalogProduct>> {
        let code = code.trim();
        let found = self
            .entries
            .iter()
            .find(|(p, _)| p.id == code)
            .or_else(|| self.entries.iter().find(|(p, _)| p.code == code))
            .or_else(|| {
                self.entries
                    .iter()
                    .find(|(_, barcode)| barcode.as_deref() == Some(code))
            })
            .map(|(p, _)| p.clone());
        Ok(found)
    }
}

// =============================================================================
// Router
// =============================================================================

/// Applies scans to the cart registry.
#[derive(Debug)]
pub struct ScanRouter<C> {
    catalog: C,
}

impl<C: Catalog> ScanRouter<C> {
    pub fn new(catalog: C) -> Self {
        ScanRouter { catalog }
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    /// Routes one event. Never fails: every outcome is an acknowledgement.
    pub async fn route(&self, carts: &mut CartRegistry, event: &ScanEvent) -> ScanAck {
        if event.is_connectivity_test() {
            info!(device = %event.device_name, "Connectivity test received");
            return ScanAck::connectivity_ok(event);
        }

        if let Err(e) = event.validate() {
            warn!(device = %event.device_name, code = %event.code, error = %e, "Rejecting invalid scan");
            return ScanAck::rejected(event, e.to_string());
        }

        let product = match self.catalog.lookup(&event.code).await {
            Ok(Some(product)) => product,
            Ok(None) => {
                let err = SyncError::Resolution {
                    code: event.code.clone(),
                };
                info!(device = %event.device_name, error = %err, "Scan did not resolve");
                return ScanAck::not_found(event);
            }
            Err(e) => {
                warn!(code = %event.code, error = %e, "Catalog lookup failed");
                return ScanAck::rejected(event, format!("Catalog unavailable: {}", e));
            }
        };

        let (target, fell_back) = carts.resolve_target(event.cart_id.as_deref());
        if fell_back {
            info!(
                device = %event.device_name,
                requested = event.cart_id.as_deref().unwrap_or_default(),
                cart_id = %target.id,
                "Requested cart is gone; using fallback"
            );
        }

        match carts.apply_scan(&target.id, &product, event.quantity).await {
            Ok(change) => {
                debug!(
                    device = %event.device_name,
                    product_id = %product.id,
                    cart_id = %target.id,
                    line_quantity = change.quantity(),
                    "Scan applied"
                );
                ScanAck::applied(event, &product.name, &target, fell_back)
            }
            Err(SyncError::Core(e @ CoreError::QuantityTooLarge { .. })) => {
                info!(cart_id = %target.id, product_id = %product.id, error = %e, "Scan rejected");
                ScanAck::rejected(event, e.to_string())
            }
            Err(e) => {
                warn!(cart_id = %target.id, error = %e, "Scan could not be applied");
                ScanAck::rejected(event, e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::{AckStatus, Money};
    use tally_db::{Database, DbConfig};

    fn catalog() -> StaticCatalog {
        StaticCatalog::new()
            .with_barcode(
                CatalogProduct::new("p-1042", "1042", "Widget", Money::from_cents(1000)),
                "7501234567890",
            )
            .with_product(CatalogProduct::new("p-7", "GAD-7", "Gadget", Money::from_cents(250)))
    }

    async fn carts() -> CartRegistry {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        CartRegistry::load(&db, None, "Mostrador").await.unwrap()
    }

    #[tokio::test]
    async fn test_static_catalog_lookup_order() {
        let catalog = catalog();
        assert_eq!(catalog.lookup("p-1042").await.unwrap().unwrap().name, "Widget");
        assert_eq!(catalog.lookup("GAD-7").await.unwrap().unwrap().name, "Gadget");
        assert_eq!(catalog.lookup("7501234567890").await.unwrap().unwrap().id, "p-1042");
        assert!(catalog.lookup("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sentinel_never_mutates() {
        let router = ScanRouter::new(catalog());
        let mut carts = carts().await;

        let ack = router
            .route(&mut carts, &ScanEvent::connectivity_test("Phone A"))
            .await;

        assert_eq!(ack.status, AckStatus::Test);
        assert!(ack.status.is_success());
        assert!(carts.carts().iter().all(|c| c.items.is_empty()));
    }

    #[tokio::test]
    async fn test_repeat_scan_increments_one_line() {
        let router = ScanRouter::new(catalog());
        let mut carts = carts().await;
        let scan = ScanEvent::new("1042", "Phone A", 1);

        let ack = router.route(&mut carts, &scan).await;
        assert_eq!(ack.status, AckStatus::Ok);
        assert_eq!(ack.product_name.as_deref(), Some("Widget"));
        assert_eq!(ack.cart_name.as_deref(), Some("Mostrador"));

        router.route(&mut carts, &scan).await;

        let cart = carts.get(carts.active_id()).unwrap();
        assert_eq!(cart.items.len(), 1);
        assert_eq!(cart.items[0].product_name, "Widget");
        assert_eq!(cart.items[0].quantity, 2);
        assert_eq!(cart.items[0].unit_price, Money::from_cents(1000));
    }

    #[tokio::test]
    async fn test_unknown_code_is_named_in_ack() {
        let router = ScanRouter::new(catalog());
        let mut carts = carts().await;

        let ack = router
            .route(&mut carts, &ScanEvent::new("9999", "Phone A", 1))
            .await;

        assert_eq!(ack.status, AckStatus::NotFound);
        assert!(ack.message.contains("9999"));
        assert!(carts.carts().iter().all(|c| c.items.is_empty()));
    }

    #[tokio::test]
    async fn test_targeted_scan_leaves_other_carts_alone() {
        let router = ScanRouter::new(catalog());
        let mut carts = carts().await;
        let mesa = carts.create("Mesa 2").await.unwrap();

        let ack = router
            .route(&mut carts, &ScanEvent::new("GAD-7", "Phone A", 4).to_cart(&mesa.id))
            .await;

        assert_eq!(ack.cart_id.as_deref(), Some(mesa.id.as_str()));
        assert!(!ack.fell_back);
        assert_eq!(carts.get(&mesa.id).unwrap().items[0].quantity, 4);
        assert!(carts.get(carts.active_id()).unwrap().items.is_empty());
    }

    #[tokio::test]
    async fn test_deleted_target_falls_back_to_active() {
        let router = ScanRouter::new(catalog());
        let mut carts = carts().await;
        let mesa = carts.create("Mesa 2").await.unwrap();
        carts.delete(&mesa.id).await.unwrap();

        let ack = router
            .route(&mut carts, &ScanEvent::new("1042", "Phone A", 1).to_cart(&mesa.id))
            .await;

        assert_eq!(ack.status, AckStatus::Ok);
        assert!(ack.fell_back);
        assert_eq!(ack.cart_id.as_deref(), Some(carts.active_id()));
        assert_eq!(carts.get(carts.active_id()).unwrap().items[0].quantity, 1);
    }

    #[tokio::test]
    async fn test_line_limit_rejects_without_mutation() {
        let router = ScanRouter::new(catalog());
        let mut carts = carts().await;

        router
            .route(&mut carts, &ScanEvent::new("1042", "Phone A", 999))
            .await;
        let ack = router
            .route(&mut carts, &ScanEvent::new("1042", "Phone A", 1))
            .await;

        assert_eq!(ack.status, AckStatus::Rejected);
        assert_eq!(carts.get(carts.active_id()).unwrap().items[0].quantity, 999);
    }

    #[tokio::test]
    async fn test_line_grows_by_quantity_unless_rejected() {
        let router = ScanRouter::new(catalog());
        let mut carts = carts().await;
        let line = |carts: &CartRegistry| {
            carts
                .get(carts.active_id())
                .and_then(|c| c.items.first())
                .map_or(0, |l| l.quantity)
        };

        // The last two cross the 999 cap and must leave the line as it was
        for quantity in [5, 400, 590, 3, 2, 999] {
            let before = line(&carts);
            let ack = router
                .route(&mut carts, &ScanEvent::new("1042", "Phone A", quantity))
                .await;

            match ack.status {
                AckStatus::Ok => assert_eq!(line(&carts), before + quantity),
                _ => {
                    assert_eq!(ack.status, AckStatus::Rejected);
                    assert_eq!(line(&carts), before);
                }
            }
        }
        assert_eq!(line(&carts), 998);
    }

    #[tokio::test]
    async fn test_product_repository_is_a_catalog() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let products = db.products();
        products
            .upsert(
                &CatalogProduct::new("p-1042", "1042", "Widget", Money::from_cents(1000)),
                Some("7501234567890"),
            )
            .await
            .unwrap();

        let router = ScanRouter::new(products);
        let mut carts = CartRegistry::load(&db, None, "Mostrador").await.unwrap();

        let ack = router
            .route(&mut carts, &ScanEvent::new("7501234567890", "Phone A", 2))
            .await;
        assert_eq!(ack.status, AckStatus::Ok);
        assert_eq!(ack.product_name.as_deref(), Some("Widget"));
    }
}
