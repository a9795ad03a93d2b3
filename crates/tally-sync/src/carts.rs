//! # Cart Registry
//!
//! The terminal's live carts. Owned by exactly one task (see
//! [`crate::terminal`]), so every method takes `&mut self` and nothing here
//! locks.
//!
//! ## Mutation Pipeline
//! ```text
//! create / delete / select / rename / clear / apply_scan
//!        │
//!        ▼
//!   CartBook (in memory, authoritative)
//!        │
//!        ├──► cart_snapshot table   (failure: error! + queued warning)
//!        │
//!        └──► cart-sync on pos-scans (failure: warn!, dropped)
//! ```

use tracing::{debug, error, info, warn};

use tally_core::{Cart, CartBook, CartSummary, CartSyncMessage, CatalogProduct, LineChange};
use tally_db::{CartRepository, Database};

use crate::error::{SyncError, SyncResult};
use crate::protocol::{ChannelEvent, SCAN_TOPIC};
use crate::transport::ChannelClient;

/// Ordered list of live carts plus the active selection.
#[derive(Debug)]
pub struct CartRegistry {
    book: CartBook,
    repo: CartRepository,
    channel: Option<ChannelClient>,
    persist_failures: Vec<String>,
}

impl CartRegistry {
    /// Restores the last snapshot, or seeds a single default cart.
    pub async fn load(
        db: &Database,
        channel: Option<ChannelClient>,
        default_name: &str,
    ) -> SyncResult<Self> {
        let repo = db.carts();

        let (book, fresh) = match repo.load().await? {
            Some(snapshot) => {
                let book = CartBook::from_snapshot(snapshot, default_name);
                info!(carts = book.len(), active = %book.active_id(), "Restored carts");
                (book, false)
            }
            None => {
                info!(name = %default_name, "No saved carts; seeding default cart");
                (CartBook::new(default_name), true)
            }
        };

        let mut registry = CartRegistry {
            book,
            repo,
            channel,
            persist_failures: Vec::new(),
        };
        if fresh {
            registry.persist().await;
        }
        Ok(registry)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// `{ id, name }` of every cart, in order.
    pub fn list(&self) -> Vec<CartSummary> {
        self.book.summaries()
    }

    pub fn carts(&self) -> &[Cart] {
        self.book.carts()
    }

    pub fn get(&self, id: &str) -> Option<&Cart> {
        self.book.get(id)
    }

    pub fn active_id(&self) -> &str {
        self.book.active_id()
    }

    pub fn len(&self) -> usize {
        self.book.len()
    }

    /// Never true: the registry always holds at least one cart.
    pub fn is_empty(&self) -> bool {
        self.book.is_empty()
    }

    /// Where a scan for `requested` lands, and whether that was a fallback.
    pub fn resolve_target(&self, requested: Option<&str>) -> (CartSummary, bool) {
        self.book.resolve_target(requested)
    }

    /// Persistence failures since the last call, oldest first.
    pub fn take_persist_failures(&mut self) -> Vec<String> {
        std::mem::take(&mut self.persist_failures)
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    pub async fn create(&mut self, name: &str) -> SyncResult<CartSummary> {
        let summary = self.book.create(name)?;
        info!(cart_id = %summary.id, name = %summary.name, "Cart created");
        self.commit().await;
        Ok(summary)
    }

    /// Deletes a cart. Deleting the last one recreates the default cart.
    pub async fn delete(&mut self, id: &str) -> SyncResult<Cart> {
        let removed = self.book.delete(id)?;
        info!(
            cart_id = %removed.id,
            lines = removed.items.len(),
            active = %self.book.active_id(),
            "Cart deleted"
        );
        self.commit().await;
        Ok(removed)
    }

    pub async fn select(&mut self, id: &str) -> SyncResult<()> {
        self.book.select(id)?;
        debug!(cart_id = %id, "Active cart changed");
        self.commit().await;
        Ok(())
    }

    pub async fn rename(&mut self, id: &str, name: &str) -> SyncResult<CartSummary> {
        let summary = self.book.rename(id, name)?;
        info!(cart_id = %summary.id, name = %summary.name, "Cart renamed");
        self.commit().await;
        Ok(summary)
    }

    pub async fn clear(&mut self, id: &str) -> SyncResult<()> {
        self.book.clear(id)?;
        info!(cart_id = %id, "Cart cleared");
        self.commit().await;
        Ok(())
    }

    /// Adds a resolved product to cart `id`.
    pub async fn apply_scan(
        &mut self,
        id: &str,
        product: &CatalogProduct,
        quantity: i64,
    ) -> SyncResult<LineChange> {
        let change = self.book.apply(id, product, quantity)?;
        self.commit().await;
        Ok(change)
    }

    /// Broadcasts the current `{ id, name }` list on `pos-scans`.
    pub fn announce(&self) -> SyncResult<()> {
        let Some(ref channel) = self.channel else {
            return Ok(());
        };
        let message = CartSyncMessage {
            carts: self.book.summaries(),
        };
        debug!(carts = message.carts.len(), "Announcing carts");
        channel.broadcast(SCAN_TOPIC, &ChannelEvent::CartSync(message))
    }

    async fn commit(&mut self) {
        self.persist().await;
        if let Err(e) = self.announce() {
            warn!(error = %e, "Cart sync broadcast failed");
        }
    }

    async fn persist(&mut self) {
        if let Err(e) = self.repo.save(&self.book.snapshot()).await {
            let err = SyncError::from(e);
            error!(error = %err, "Failed to persist carts");
            self.persist_failures
                .push(format!("Carts not saved: {}", err));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EVENT_CART_SYNC;
    use crate::transport::{Broker, MemoryConnector, TransportConfig};
    use std::time::Duration;
    use tally_core::{CoreError, Money};
    use tally_db::DbConfig;
    use tokio::sync::mpsc;

    fn widget() -> CatalogProduct {
        CatalogProduct::new("p-1042", "1042", "Widget", Money::from_cents(1000))
    }

    async fn db() -> Database {
        Database::new(DbConfig::in_memory()).await.unwrap()
    }

    #[tokio::test]
    async fn test_fresh_registry_has_default_cart() {
        let registry = CartRegistry::load(&db().await, None, "Mostrador").await.unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.list()[0].name, "Mostrador");
        assert_eq!(registry.active_id(), registry.list()[0].id);
    }

    #[tokio::test]
    async fn test_deleting_last_cart_recreates_default() {
        let mut registry = CartRegistry::load(&db().await, None, "Mostrador").await.unwrap();
        let only = registry.active_id().to_string();

        registry.delete(&only).await.unwrap();

        assert_eq!(registry.len(), 1);
        assert_ne!(registry.list()[0].id, only);
        assert_eq!(registry.list()[0].name, "Mostrador");
    }

    #[tokio::test]
    async fn test_deleting_active_moves_selection_to_first() {
        let mut registry = CartRegistry::load(&db().await, None, "Mostrador").await.unwrap();
        let first = registry.active_id().to_string();
        let second = registry.create("Mesa 2").await.unwrap();

        registry.select(&second.id).await.unwrap();
        registry.delete(&second.id).await.unwrap();

        assert_eq!(registry.active_id(), first);
    }

    #[tokio::test]
    async fn test_unknown_cart_errors() {
        let mut registry = CartRegistry::load(&db().await, None, "Mostrador").await.unwrap();
        assert!(matches!(
            registry.select("cart-99").await,
            Err(SyncError::Core(CoreError::CartNotFound(_)))
        ));
        assert!(registry.delete("cart-99").await.is_err());
        assert!(registry.create("  ").await.is_err());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let db = db().await;
        {
            let mut registry = CartRegistry::load(&db, None, "Mostrador").await.unwrap();
            let mesa = registry.create("Mesa 2").await.unwrap();
            registry.apply_scan(&mesa.id, &widget(), 3).await.unwrap();
            registry.select(&mesa.id).await.unwrap();
        }

        let registry = CartRegistry::load(&db, None, "Mostrador").await.unwrap();
        assert_eq!(registry.len(), 2);
        let active = registry.get(registry.active_id()).unwrap();
        assert_eq!(active.name, "Mesa 2");
        assert_eq!(active.items[0].quantity, 3);
    }

    #[tokio::test]
    async fn test_persist_failure_is_queued_not_fatal() {
        let db = db().await;
        let mut registry = CartRegistry::load(&db, None, "Mostrador").await.unwrap();
        db.close().await;

        let summary = registry.create("Mesa 2").await.unwrap();

        assert!(registry.get(&summary.id).is_some());
        let failures = registry.take_persist_failures();
        assert_eq!(failures.len(), 1);
        assert!(registry.take_persist_failures().is_empty());
    }

    #[tokio::test]
    async fn test_mutations_broadcast_cart_sync() {
        let connector = MemoryConnector::new(Broker::new());
        let terminal = ChannelClient::spawn(connector.clone(), TransportConfig::labeled("terminal"));
        let phone = ChannelClient::spawn(connector, TransportConfig::labeled("phone"));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = phone.subscribe(SCAN_TOPIC, EVENT_CART_SYNC, move |e| {
            let _ = tx.send(e.clone());
        });
        terminal.wait_connected(Duration::from_secs(2)).await.unwrap();
        phone.wait_connected(Duration::from_secs(2)).await.unwrap();

        let mut registry = CartRegistry::load(&db().await, Some(terminal), "Mostrador")
            .await
            .unwrap();
        // The fresh-seed path persists but does not announce
        registry.create("Mesa 2").await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            ChannelEvent::CartSync(sync) => {
                let names: Vec<_> = sync.carts.iter().map(|c| c.name.as_str()).collect();
                assert_eq!(names, vec!["Mostrador", "Mesa 2"]);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
