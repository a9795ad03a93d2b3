//! # Cart Repository
//!
//! The terminal's carts are stored as one JSON snapshot row. The book is
//! small and always rewritten whole after a mutation, so a document is
//! simpler than normalized tables.

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::DbResult;
use tally_core::CartSnapshot;

#[derive(Debug, Clone)]
pub struct CartRepository {
    pool: SqlitePool,
}

impl CartRepository {
    pub fn new(pool: SqlitePool) -> Self {
        CartRepository { pool }
    }

    /// Loads the last saved snapshot, if any.
    pub async fn load(&self) -> DbResult<Option<CartSnapshot>> {
        let payload: Option<String> =
            sqlx::query_scalar("SELECT payload FROM cart_snapshot WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;

        match payload {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Replaces the stored snapshot.
    pub async fn save(&self, snapshot: &CartSnapshot) -> DbResult<()> {
        let payload = serde_json::to_string(snapshot)?;

        debug!(
            carts = snapshot.carts.len(),
            next_id = snapshot.next_id,
            "Saving cart snapshot"
        );

        sqlx::query(
            r#"
            INSERT INTO cart_snapshot (id, payload, updated_at)
            VALUES (1, ?1, ?2)
            ON CONFLICT(id) DO UPDATE SET
                payload = excluded.payload,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(payload)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use tally_core::{CartBook, CatalogProduct, Money};

    #[tokio::test]
    async fn test_load_empty() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        assert!(db.carts().load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_and_reload_preserves_counter() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.carts();

        let mut book = CartBook::new("Mostrador");
        let mesa = book.create("Mesa 4").unwrap();
        let widget = CatalogProduct::new("p-1042", "1042", "Widget", Money::from_cents(1000));
        book.apply(&mesa.id, &widget, 2).unwrap();
        book.delete(&mesa.id).unwrap();

        repo.save(&book.snapshot()).await.unwrap();
        // Second save exercises the upsert path
        repo.save(&book.snapshot()).await.unwrap();

        let restored = CartBook::from_snapshot(repo.load().await.unwrap().unwrap(), "Mostrador");
        assert_eq!(restored.len(), 1);

        let mut restored = restored;
        let next = restored.create("Mesa 5").unwrap();
        assert_eq!(next.id, "cart-3");
    }
}
