//! # Product Repository
//!
//! Catalog lookups for incoming scans.
//!
//! ## Lookup Order
//! ```text
//! code "1042"
//!    │
//!    ├── products.id      = code ?  → hit
//!    ├── products.sku     = code ?  → hit
//!    └── products.barcode = code ?  → hit
//!                                   → None (not found)
//! ```
//!
//! Inactive products never match.

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{DbError, DbResult};
use tally_core::CatalogProduct;

const PRODUCT_COLUMNS: &str = "id, sku AS code, name, price_cents AS price";

/// Repository for catalog products.
///
/// ## Usage
/// ```rust,ignore
/// let repo = ProductRepository::new(pool);
/// let widget = repo.lookup("1042").await?;
/// ```
#[derive(Debug, Clone)]
pub struct ProductRepository {
    pool: SqlitePool,
}

impl ProductRepository {
    pub fn new(pool: SqlitePool) -> Self {
        ProductRepository { pool }
    }

    /// Resolves a scanned code to an active product.
    pub async fn lookup(&self, code: &str) -> DbResult<Option<CatalogProduct>> {
        let code = code.trim();
        if code.is_empty() {
            return Ok(None);
        }

        for column in ["id", "sku", "barcode"] {
            let sql = format!(
                "SELECT {} FROM products WHERE {} = ?1 AND is_active = 1 LIMIT 1",
                PRODUCT_COLUMNS, column
            );

            let found = sqlx::query_as::<_, CatalogProduct>(&sql)
                .bind(code)
                .fetch_optional(&self.pool)
                .await?;

            if let Some(product) = found {
                debug!(code = %code, matched_on = column, product_id = %product.id, "Catalog hit");
                return Ok(Some(product));
            }
        }

        debug!(code = %code, "Catalog miss");
        Ok(None)
    }

    /// Inserts or replaces a product keyed by id.
    pub async fn upsert(&self, product: &CatalogProduct, barcode: Option<&str>) -> DbResult<()> {
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO products (id, sku, barcode, name, price_cents, is_active, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6)
            ON CONFLICT(id) DO UPDATE SET
                sku = excluded.sku,
                barcode = excluded.barcode,
                name = excluded.name,
                price_cents = excluded.price_cents,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&product.id)
        .bind(&product.code)
        .bind(barcode)
        .bind(&product.name)
        .bind(product.price)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| match DbError::from(e) {
            DbError::UniqueViolation { field, .. } => DbError::UniqueViolation {
                field,
                value: product.code.clone(),
            },
            other => other,
        })?;

        Ok(())
    }

    /// Hides a product from lookups without deleting it.
    pub async fn deactivate(&self, id: &str) -> DbResult<()> {
        let result = sqlx::query("UPDATE products SET is_active = 0, updated_at = ?1 WHERE id = ?2")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Product", id));
        }
        Ok(())
    }

    pub async fn list(&self) -> DbResult<Vec<CatalogProduct>> {
        let sql = format!(
            "SELECT {} FROM products WHERE is_active = 1 ORDER BY name ASC",
            PRODUCT_COLUMNS
        );

        let products = sqlx::query_as::<_, CatalogProduct>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(products)
    }

    pub async fn count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM products WHERE is_active = 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use tally_core::Money;

    async fn seeded() -> ProductRepository {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.products();
        repo.upsert(
            &CatalogProduct::new("p-1042", "1042", "Widget", Money::from_cents(1000)),
            Some("7501234567890"),
        )
        .await
        .unwrap();
        repo.upsert(
            &CatalogProduct::new("p-2000", "GADGET", "Gadget", Money::from_cents(2550)),
            None,
        )
        .await
        .unwrap();
        repo
    }

    #[tokio::test]
    async fn test_lookup_by_id_sku_and_barcode() {
        let repo = seeded().await;

        for code in ["p-1042", "1042", "7501234567890", "  1042  "] {
            let product = repo.lookup(code).await.unwrap().unwrap();
            assert_eq!(product.id, "p-1042");
            assert_eq!(product.code, "1042");
            assert_eq!(product.name, "Widget");
            assert_eq!(product.price, Money::from_cents(1000));
        }
    }

    #[tokio::test]
    async fn test_lookup_miss() {
        let repo = seeded().await;
        assert!(repo.lookup("9999").await.unwrap().is_none());
        assert!(repo.lookup("").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_inactive_products_do_not_match() {
        let repo = seeded().await;
        repo.deactivate("p-2000").await.unwrap();

        assert!(repo.lookup("GADGET").await.unwrap().is_none());
        assert_eq!(repo.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_upsert_updates_price() {
        let repo = seeded().await;
        repo.upsert(
            &CatalogProduct::new("p-1042", "1042", "Widget", Money::from_cents(1200)),
            None,
        )
        .await
        .unwrap();

        let product = repo.lookup("1042").await.unwrap().unwrap();
        assert_eq!(product.price, Money::from_cents(1200));
        assert_eq!(repo.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_sku_is_rejected() {
        let repo = seeded().await;
        let err = repo
            .upsert(
                &CatalogProduct::new("p-other", "1042", "Clone", Money::from_cents(1)),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::UniqueViolation { .. }));
    }
}
