//! # Device Repository
//!
//! Persistence for paired scanner devices.
//!
//! ```text
//! register ──► insert()         (status = pending)
//! approve  ──► update_status()  (pending/blocked → approved)
//! block    ──► update_status()  (any → blocked)
//! heartbeat──► touch()          (last_active = now)
//! remove   ──► delete()         (row gone; device must re-register)
//! ```

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{DbError, DbResult};
use tally_core::{Device, DeviceStatus};

const DEVICE_COLUMNS: &str = "device_id, name, status, last_active, registered_at";

/// Repository for device records.
#[derive(Debug, Clone)]
pub struct DeviceRepository {
    pool: SqlitePool,
}

impl DeviceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        DeviceRepository { pool }
    }

    /// Inserts a new device.
    ///
    /// ## Errors
    /// `DbError::UniqueViolation` when the id is already registered.
    pub async fn insert(&self, device: &Device) -> DbResult<()> {
        debug!(device_id = %device.device_id, name = %device.name, "Inserting device");

        sqlx::query(
            r#"
            INSERT INTO devices (device_id, name, status, last_active, registered_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&device.device_id)
        .bind(&device.name)
        .bind(device.status)
        .bind(device.last_active)
        .bind(device.registered_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match DbError::from(e) {
            DbError::UniqueViolation { field, .. } => DbError::UniqueViolation {
                field,
                value: device.device_id.clone(),
            },
            other => other,
        })?;

        Ok(())
    }

    pub async fn get(&self, device_id: &str) -> DbResult<Option<Device>> {
        let sql = format!("SELECT {} FROM devices WHERE device_id = ?1", DEVICE_COLUMNS);

        let device = sqlx::query_as::<_, Device>(&sql)
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(device)
    }

    /// All devices, oldest registration first.
    pub async fn list(&self) -> DbResult<Vec<Device>> {
        let sql = format!(
            "SELECT {} FROM devices ORDER BY registered_at ASC, device_id ASC",
            DEVICE_COLUMNS
        );

        let devices = sqlx::query_as::<_, Device>(&sql)
            .fetch_all(&self.pool)
            .await?;

        Ok(devices)
    }

    pub async fn update_status(&self, device_id: &str, status: DeviceStatus) -> DbResult<()> {
        debug!(device_id = %device_id, status = %status, "Updating device status");

        let result = sqlx::query("UPDATE devices SET status = ?1 WHERE device_id = ?2")
            .bind(status)
            .bind(device_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Device", device_id));
        }
        Ok(())
    }

    /// Records activity from the device.
    pub async fn touch(&self, device_id: &str, at: DateTime<Utc>) -> DbResult<()> {
        let result = sqlx::query("UPDATE devices SET last_active = ?1 WHERE device_id = ?2")
            .bind(at)
            .bind(device_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Device", device_id));
        }
        Ok(())
    }

    pub async fn delete(&self, device_id: &str) -> DbResult<()> {
        debug!(device_id = %device_id, "Deleting device");

        let result = sqlx::query("DELETE FROM devices WHERE device_id = ?1")
            .bind(device_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Device", device_id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Database, DbConfig};
    use chrono::Duration;

    async fn repo() -> DeviceRepository {
        Database::new(DbConfig::in_memory()).await.unwrap().devices()
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let repo = repo().await;
        let device = Device::register("3f1c0e9a-0000-4000-8000-000000000001", "Phone A");

        repo.insert(&device).await.unwrap();

        let loaded = repo.get(&device.device_id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "Phone A");
        assert_eq!(loaded.status, DeviceStatus::Pending);
        assert_eq!(loaded.registered_at, device.registered_at);
    }

    #[tokio::test]
    async fn test_duplicate_insert_is_unique_violation() {
        let repo = repo().await;
        let device = Device::register("dev-1", "Phone A");

        repo.insert(&device).await.unwrap();
        let err = repo.insert(&device).await.unwrap_err();

        match err {
            DbError::UniqueViolation { value, .. } => assert_eq!(value, "dev-1"),
            other => panic!("expected UniqueViolation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let repo = repo().await;
        assert!(repo.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_status() {
        let repo = repo().await;
        repo.insert(&Device::register("dev-1", "Phone A")).await.unwrap();

        repo.update_status("dev-1", DeviceStatus::Approved).await.unwrap();
        assert_eq!(
            repo.get("dev-1").await.unwrap().unwrap().status,
            DeviceStatus::Approved
        );

        repo.update_status("dev-1", DeviceStatus::Blocked).await.unwrap();
        assert_eq!(
            repo.get("dev-1").await.unwrap().unwrap().status,
            DeviceStatus::Blocked
        );
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let repo = repo().await;
        let err = repo
            .update_status("ghost", DeviceStatus::Approved)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_touch_moves_last_active() {
        let repo = repo().await;
        let device = Device::register("dev-1", "Phone A");
        repo.insert(&device).await.unwrap();

        let later = device.last_active + Duration::minutes(5);
        repo.touch("dev-1", later).await.unwrap();

        let loaded = repo.get("dev-1").await.unwrap().unwrap();
        assert_eq!(loaded.last_active, later);
        assert_eq!(loaded.registered_at, device.registered_at);
    }

    #[tokio::test]
    async fn test_delete() {
        let repo = repo().await;
        repo.insert(&Device::register("dev-1", "Phone A")).await.unwrap();

        repo.delete("dev-1").await.unwrap();
        assert!(repo.get("dev-1").await.unwrap().is_none());
        assert!(repo.delete("dev-1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_list_orders_by_registration() {
        let repo = repo().await;
        let mut first = Device::register("dev-b", "Phone B");
        first.registered_at -= Duration::minutes(10);
        let second = Device::register("dev-a", "Phone A");

        repo.insert(&second).await.unwrap();
        repo.insert(&first).await.unwrap();

        let ids: Vec<_> = repo
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.device_id)
            .collect();
        assert_eq!(ids, vec!["dev-b", "dev-a"]);
    }
}
