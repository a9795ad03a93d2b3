//! # Device Pairing
//!
//! The terminal's device registry, and the seam through which a scanner
//! talks to it.
//!
//! ## Pairing Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  Scanner                      Hub / Registry                Admin      │
//! │  ───────                      ──────────────                ─────      │
//! │  register(id, "Phone A") ──►  devices: Pending                          │
//! │  join device_<id>                                                       │
//! │                                               ◄── approve(id)           │
//! │                               devices: Approved                         │
//! │  ◄── status {Approved} ────── push on device_<id>                       │
//! │  Scanning                                                               │
//! │                                               ◄── block(id)             │
//! │  ◄── status {Blocked} ─────── push on device_<id>                       │
//! │  halt                                                                   │
//! │                                               ◄── delete(id)            │
//! │  ◄── removed {device_id} ──── push on device_<id>                       │
//! │  identity cleared                                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Pushes are best-effort. The database row is the source of truth; a
//! device that missed a push catches up through [`PairingClient::fetch`].

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use tally_core::validation::{validate_device_id, validate_device_name};
use tally_core::{device_topic, Device, DeviceAction, DeviceRemoved};
use tally_db::{Database, DbError, DeviceRepository};

use crate::error::{PairingError, SyncError, SyncResult};
use crate::hub::{ApiErrorBody, RegisterRequest, CODE_NOT_FOUND};
use crate::protocol::ChannelEvent;
use crate::transport::ChannelClient;

/// Maps a missing row to `PairingError::UnknownDevice`.
fn unknown_device(device_id: &str) -> impl FnOnce(DbError) -> SyncError + '_ {
    move |err| {
        if err.is_not_found() {
            PairingError::UnknownDevice(device_id.to_string()).into()
        } else {
            err.into()
        }
    }
}

// =============================================================================
// Pairing Registry
// =============================================================================

/// Durable device records plus status pushes.
///
/// Cheap to clone; the hub's HTTP routes and the terminal share one.
#[derive(Debug, Clone)]
pub struct PairingRegistry {
    devices: DeviceRepository,
    channel: Option<ChannelClient>,
}

impl PairingRegistry {
    /// Creates a registry. Without a channel, changes are stored but never
    /// pushed.
    pub fn new(db: &Database, channel: Option<ChannelClient>) -> Self {
        PairingRegistry {
            devices: db.devices(),
            channel,
        }
    }

    /// Registers a new device under a freshly generated id.
    pub async fn register(&self, name: &str) -> SyncResult<Device> {
        self.register_with_id(&Uuid::new_v4().to_string(), name)
            .await
    }

    /// Registers a device under a client-generated id.
    ///
    /// Registering an id that is already live returns the stored record
    /// unchanged, so a client retrying after a lost response does not fail.
    pub async fn register_with_id(&self, device_id: &str, name: &str) -> SyncResult<Device> {
        validate_device_id(device_id)?;
        let name = validate_device_name(name)?;

        if let Some(existing) = self.devices.get(device_id).await? {
            debug!(device_id = %device_id, status = %existing.status, "Device already registered");
            return Ok(existing);
        }

        let device = Device::register(device_id, name);
        self.devices.insert(&device).await?;

        info!(device_id = %device.device_id, name = %device.name, "Device registered (pending)");
        Ok(device)
    }

    pub async fn approve(&self, device_id: &str) -> SyncResult<Device> {
        self.apply(device_id, DeviceAction::Approve).await
    }

    pub async fn block(&self, device_id: &str) -> SyncResult<Device> {
        self.apply(device_id, DeviceAction::Block).await
    }

    pub async fn unblock(&self, device_id: &str) -> SyncResult<Device> {
        self.apply(device_id, DeviceAction::Unblock).await
    }

    /// Runs `action` through the approval state machine.
    ///
    /// Re-applying the current state returns the record without writing or
    /// pushing anything. Invalid transitions leave the record untouched.
    pub async fn apply(&self, device_id: &str, action: DeviceAction) -> SyncResult<Device> {
        let mut device = self.require(device_id).await?;
        let transition = device.apply(action)?;

        if !transition.is_changed() {
            debug!(device_id = %device_id, action = %action, status = %device.status, "No-op transition");
            return Ok(device);
        }

        self.devices
            .update_status(device_id, device.status)
            .await
            .map_err(unknown_device(device_id))?;

        info!(device_id = %device_id, action = %action, status = %device.status, "Device status changed");
        self.push(&device.topic(), ChannelEvent::DeviceStatus(device.clone()));
        Ok(device)
    }

    /// Removes a device. Its next start must register again.
    pub async fn delete(&self, device_id: &str) -> SyncResult<()> {
        self.devices
            .delete(device_id)
            .await
            .map_err(unknown_device(device_id))?;

        info!(device_id = %device_id, "Device deleted");
        self.push(
            &device_topic(device_id),
            ChannelEvent::DeviceRemoved(DeviceRemoved {
                device_id: device_id.to_string(),
            }),
        );
        Ok(())
    }

    pub async fn get(&self, device_id: &str) -> SyncResult<Option<Device>> {
        Ok(self.devices.get(device_id).await?)
    }

    /// All devices, oldest registration first.
    pub async fn list(&self) -> SyncResult<Vec<Device>> {
        Ok(self.devices.list().await?)
    }

    /// Records activity. Never changes status.
    pub async fn heartbeat(&self, device_id: &str) -> SyncResult<Device> {
        self.devices
            .touch(device_id, Utc::now())
            .await
            .map_err(unknown_device(device_id))?;
        self.require(device_id).await
    }

    async fn require(&self, device_id: &str) -> SyncResult<Device> {
        self.devices
            .get(device_id)
            .await?
            .ok_or_else(|| PairingError::UnknownDevice(device_id.to_string()).into())
    }

    fn push(&self, topic: &str, event: ChannelEvent) {
        let Some(ref channel) = self.channel else {
            return;
        };
        if let Err(e) = channel.broadcast(topic, &event) {
            warn!(topic = %topic, event = event.event_name(), error = %e, "Device push failed");
        }
    }
}

// =============================================================================
// Pairing Client Seam
// =============================================================================

/// What a scanner needs from the registry.
///
/// Implemented by [`PairingRegistry`] (same process) and
/// [`HttpPairingClient`] (over the hub's HTTP routes).
pub trait PairingClient: Send + Sync + 'static {
    /// Registers `device_id`, or returns its record if already live.
    fn register(
        &self,
        device_id: &str,
        name: &str,
    ) -> impl Future<Output = SyncResult<Device>> + Send;

    /// Current record.
    ///
    /// ## Errors
    /// `PairingError::UnknownDevice` if the record was deleted.
    fn fetch(&self, device_id: &str) -> impl Future<Output = SyncResult<Device>> + Send;

    fn heartbeat(&self, device_id: &str) -> impl Future<Output = SyncResult<Device>> + Send;
}

impl PairingClient for PairingRegistry {
    async fn register(&self, device_id: &str, name: &str) -> SyncResult<Device> {
        self.register_with_id(device_id, name).await
    }

    async fn fetch(&self, device_id: &str) -> SyncResult<Device> {
        self.require(device_id).await
    }

    async fn heartbeat(&self, device_id: &str) -> SyncResult<Device> {
        PairingRegistry::heartbeat(self, device_id).await
    }
}

/// Default timeout for pairing HTTP calls.
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Pairing over `POST /devices`, `GET /devices/{id}` and
/// `POST /devices/{id}/heartbeat`.
#[derive(Debug, Clone)]
pub struct HttpPairingClient {
    http: reqwest::Client,
    base: Url,
}

impl HttpPairingClient {
    pub fn new(base_url: &str) -> SyncResult<Self> {
        let mut base = Url::parse(base_url)?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(SyncError::InvalidUrl(format!(
                "expected http:// or https://, got {}://",
                base.scheme()
            )));
        }
        // Url::join replaces the last segment unless the path ends in '/'
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(HttpPairingClient { http, base })
    }

    fn endpoint(&self, path: &str) -> SyncResult<Url> {
        Ok(self.base.join(path)?)
    }

    async fn read_device(response: reqwest::Response, device_id: &str) -> SyncResult<Device> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<Device>().await?);
        }

        let body = response.json::<ApiErrorBody>().await.unwrap_or(ApiErrorBody {
            code: status.as_str().to_string(),
            message: status
                .canonical_reason()
                .unwrap_or("unexpected response")
                .to_string(),
        });

        if body.code == CODE_NOT_FOUND {
            return Err(PairingError::UnknownDevice(device_id.to_string()).into());
        }
        Err(SyncError::Api {
            code: body.code,
            message: body.message,
        })
    }
}

impl PairingClient for HttpPairingClient {
    async fn register(&self, device_id: &str, name: &str) -> SyncResult<Device> {
        let url = self.endpoint("devices")?;
        debug!(url = %url, device_id = %device_id, "Registering over HTTP");

        let response = self
            .http
            .post(url)
            .json(&RegisterRequest {
                device_id: Some(device_id.to_string()),
                name: name.to_string(),
            })
            .send()
            .await?;
        Self::read_device(response, device_id).await
    }

    async fn fetch(&self, device_id: &str) -> SyncResult<Device> {
        let url = self.endpoint(&format!("devices/{}", device_id))?;
        let response = self.http.get(url).send().await?;
        Self::read_device(response, device_id).await
    }

    async fn heartbeat(&self, device_id: &str) -> SyncResult<Device> {
        let url = self.endpoint(&format!("devices/{}/heartbeat", device_id))?;
        let response = self.http.post(url).send().await?;
        Self::read_device(response, device_id).await
    }
}
