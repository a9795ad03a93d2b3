//! # Mobile Scanner Client
//!
//! The phone side: pairing state, the scan review loop, and delivery of
//! scans over the channel.
//!
//! ## State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  Init ──start()──► Registering ──► Pending ──status:approved──┐        │
//! │   │                                                            │        │
//! │   └── stored id, fetch ok ─► (follows stored status)           ▼        │
//! │                                                   ┌─── Approved ───┐    │
//! │                                                   │                │    │
//! │                                                   │   Scanning     │    │
//! │                                                   │     │ decode   │    │
//! │                                                   │     ▼          │    │
//! │                                  cancel_review ◄──│   Review  ◄──┐ │    │
//! │                                                   │     │ send   │ │    │
//! │                                                   │     ▼        │ │    │
//! │                                                   │   Sending ───┘ │    │
//! │                                                   │     │   failure│    │
//! │                                                   │     ▼          │    │
//! │                                                   │   Success      │    │
//! │                                                   └───────┬────────┘    │
//! │                                          status:blocked   │  ▲ unblock  │
//! │                                                           ▼  │          │
//! │                                            Blocked { held scan }        │
//! │                                                                         │
//! │  removed (any state) ──► Unregistered ──start()──► Registering          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Send Path
//! ```text
//! Connected? ──yes──► broadcast ──ok──► Success
//!     │                   │
//!     no             retryable error
//!     │                   │
//!     └───────┬───────────┘
//!             ▼
//!      reconnect() ─► sleep(settle) ─► broadcast once ─ok─► Success
//!                                            │
//!                                          error ─► Review { error }
//! ```
//!
//! Status pushes take the state lock synchronously on the channel's driver
//! task, so a `Blocked` push is applied before any later `decode` is looked
//! at. The lock is never held across an `.await`.
//!
//! ## Missed Pushes
//! The device record is read only after the hub has confirmed the join of
//! `device_<id>`, and read again every time the channel reconnects. A push
//! published before the join, or while the link was down, is therefore
//! covered by the read that follows it.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tally_core::validation::validate_quantity;
use tally_core::{device_topic, CartSummary, DeviceStatus, ScanAck, ScanEvent};

use crate::clock::Clock;
use crate::config::ScannerConfig;
use crate::error::{PairingError, SyncError, SyncResult, TransportError};
use crate::pairing::PairingClient;
use crate::protocol::{
    ChannelEvent, EVENT_CART_SYNC, EVENT_DEVICE_REMOVED, EVENT_DEVICE_STATUS, EVENT_SCAN_ACK,
    SCAN_TOPIC,
};
use crate::transport::{ChannelClient, ConnectionState, Subscription};

/// Default wait between a reconnect request and the retried send.
pub const DEFAULT_SETTLE: Duration = Duration::from_millis(1500);

/// Bound on waiting for the hub to confirm the device topic.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// =============================================================================
// Identity Store
// =============================================================================

/// Where the scanner keeps its device id between sessions.
pub trait IdentityStore: Send + Sync {
    fn device_id(&self) -> Option<String>;

    fn store(&self, device_id: &str) -> SyncResult<()>;

    /// Forgets the id; the next start registers again.
    fn clear(&self) -> SyncResult<()>;
}

/// Identity that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryIdentity {
    device_id: Mutex<Option<String>>,
}

impl MemoryIdentity {
    pub fn new(device_id: Option<String>) -> Self {
        MemoryIdentity {
            device_id: Mutex::new(device_id),
        }
    }
}

impl IdentityStore for MemoryIdentity {
    fn device_id(&self) -> Option<String> {
        lock(&self.device_id).clone()
    }

    fn store(&self, device_id: &str) -> SyncResult<()> {
        *lock(&self.device_id) = Some(device_id.to_string());
        Ok(())
    }

    fn clear(&self) -> SyncResult<()> {
        *lock(&self.device_id) = None;
        Ok(())
    }
}

/// Identity persisted in the `[device]` section of scanner.toml.
#[derive(Debug)]
pub struct ConfigIdentity {
    path: Option<PathBuf>,
    config: Mutex<ScannerConfig>,
}

impl ConfigIdentity {
    /// `path: None` uses the platform default config path.
    pub fn new(config: ScannerConfig, path: Option<PathBuf>) -> Self {
        ConfigIdentity {
            path,
            config: Mutex::new(config),
        }
    }

    fn write(&self, device_id: Option<&str>) -> SyncResult<()> {
        let snapshot = {
            let mut config = lock(&self.config);
            config.device.id = device_id.map(str::to_string);
            config.clone()
        };
        snapshot.save(self.path.clone())
    }
}

impl IdentityStore for ConfigIdentity {
    fn device_id(&self) -> Option<String> {
        lock(&self.config).device.id.clone()
    }

    fn store(&self, device_id: &str) -> SyncResult<()> {
        self.write(Some(device_id))
    }

    fn clear(&self) -> SyncResult<()> {
        self.write(None)
    }
}

// =============================================================================
// States
// =============================================================================

/// A decoded scan awaiting confirmation or delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingScan {
    pub code: String,
    pub quantity: i64,
    /// Chosen cart; `None` lets the terminal pick its active cart.
    pub target: Option<String>,
}

/// Sub-state while approved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanPhase {
    Scanning,
    Review {
        scan: PendingScan,
        /// Why the last send failed, if it did.
        error: Option<String>,
    },
    Sending(PendingScan),
    Success {
        scan: PendingScan,
        /// Terminal's answer, once it arrives.
        ack: Option<ScanAck>,
    },
}

/// What the scanner UI shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScannerState {
    Init,
    Registering,
    Pending,
    Approved(ScanPhase),
    /// Scanning halted. A scan that was under review or in flight is kept
    /// and returned to review on unblock.
    Blocked { held: Option<PendingScan> },
    /// The terminal deleted this device.
    Unregistered,
}

impl ScannerState {
    pub fn is_scanning(&self) -> bool {
        matches!(self, ScannerState::Approved(ScanPhase::Scanning))
    }

    /// The scan under review, if any.
    pub fn review(&self) -> Option<&PendingScan> {
        match self {
            ScannerState::Approved(ScanPhase::Review { scan, .. }) => Some(scan),
            _ => None,
        }
    }

    fn not_allowed(&self) -> SyncError {
        match self {
            ScannerState::Pending => PairingError::NotApproved.into(),
            ScannerState::Blocked { .. } => PairingError::Blocked.into(),
            ScannerState::Init | ScannerState::Registering | ScannerState::Unregistered => {
                PairingError::Unregistered.into()
            }
            ScannerState::Approved(_) => SyncError::InvalidState(self.to_string()),
        }
    }
}

impl fmt::Display for ScannerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScannerState::Init => write!(f, "starting"),
            ScannerState::Registering => write!(f, "registering"),
            ScannerState::Pending => write!(f, "waiting for approval"),
            ScannerState::Approved(ScanPhase::Scanning) => write!(f, "scanning"),
            ScannerState::Approved(ScanPhase::Review { .. }) => write!(f, "reviewing a scan"),
            ScannerState::Approved(ScanPhase::Sending(_)) => write!(f, "sending a scan"),
            ScannerState::Approved(ScanPhase::Success { .. }) => write!(f, "showing a sent scan"),
            ScannerState::Blocked { .. } => write!(f, "blocked"),
            ScannerState::Unregistered => write!(f, "unregistered"),
        }
    }
}

/// Applies a status from the registry to the current state.
///
/// A device never returns to `pending` once decided, so a `pending` seen
/// while approved or blocked is a stale read and changes nothing.
pub fn on_status(state: ScannerState, status: DeviceStatus) -> ScannerState {
    use ScannerState::*;

    match (state, status) {
        (Unregistered, _) => Unregistered,
        (state @ (Approved(_) | Blocked { .. }), DeviceStatus::Pending) => state,

        (Blocked { held }, DeviceStatus::Approved) => match held {
            Some(scan) => Approved(ScanPhase::Review { scan, error: None }),
            None => Approved(ScanPhase::Scanning),
        },
        (Approved(phase), DeviceStatus::Approved) => Approved(phase),
        (_, DeviceStatus::Approved) => Approved(ScanPhase::Scanning),

        (Approved(ScanPhase::Review { scan, .. }), DeviceStatus::Blocked)
        | (Approved(ScanPhase::Sending(scan)), DeviceStatus::Blocked) => {
            Blocked { held: Some(scan) }
        }
        (Blocked { held }, DeviceStatus::Blocked) => Blocked { held },
        (_, DeviceStatus::Blocked) => Blocked { held: None },

        (_, DeviceStatus::Pending) => Pending,
    }
}

// =============================================================================
// Shared State
// =============================================================================

#[derive(Debug)]
struct Machine {
    state: ScannerState,
    device_id: Option<String>,
    /// Sticky cart choice applied to new scans.
    target: Option<String>,
    carts: Vec<CartSummary>,
    last_ack: Option<ScanAck>,
}

/// What channel handlers need; never holds a subscription.
struct Shared {
    name: String,
    machine: Mutex<Machine>,
    state_tx: watch::Sender<ScannerState>,
    identity: Arc<dyn IdentityStore>,
}

impl Shared {
    /// Runs `f` under the lock and publishes the resulting state.
    fn update<R>(&self, f: impl FnOnce(&mut Machine) -> R) -> R {
        let mut machine = lock(&self.machine);
        let before = machine.state.clone();
        let result = f(&mut machine);
        if machine.state != before {
            debug!(device = %self.name, from = %before, to = %machine.state, "Scanner state changed");
            self.state_tx.send_replace(machine.state.clone());
        }
        result
    }

    fn apply_status(&self, device_id: &str, status: DeviceStatus) {
        self.update(|m| {
            if m.device_id.as_deref() != Some(device_id) {
                return;
            }
            let state = std::mem::replace(&mut m.state, ScannerState::Init);
            m.state = on_status(state, status);
        });
    }

    /// The device id, once registration has produced a status.
    fn paired_id(&self) -> Option<String> {
        let machine = lock(&self.machine);
        match machine.state {
            ScannerState::Pending | ScannerState::Approved(_) | ScannerState::Blocked { .. } => {
                machine.device_id.clone()
            }
            _ => None,
        }
    }

    fn unregister(&self, device_id: &str) {
        let removed = self.update(|m| {
            if m.device_id.as_deref() != Some(device_id) {
                return false;
            }
            m.device_id = None;
            m.state = ScannerState::Unregistered;
            true
        });
        if removed {
            warn!(device = %self.name, device_id = %device_id, "Device was removed by the terminal");
            if let Err(e) = self.identity.clear() {
                warn!(error = %e, "Failed to clear stored identity");
            }
        }
    }

    fn handle(&self, event: &ChannelEvent) {
        match event {
            ChannelEvent::DeviceStatus(device) => {
                info!(device_id = %device.device_id, status = %device.status, "Status pushed");
                self.apply_status(&device.device_id, device.status);
            }
            ChannelEvent::DeviceRemoved(removed) => self.unregister(&removed.device_id),
            ChannelEvent::CartSync(sync) => {
                debug!(carts = sync.carts.len(), "Carts advertised");
                self.update(|m| m.carts = sync.carts.clone());
            }
            ChannelEvent::ScanAck(ack) if ack.device == self.name => {
                debug!(code = %ack.code, status = %ack.status, "Scan acknowledged");
                self.update(|m| {
                    m.last_ack = Some(ack.clone());
                    if let ScannerState::Approved(ScanPhase::Success { scan, ack: slot }) = &mut m.state {
                        if slot.is_none() && scan.code == ack.code {
                            *slot = Some(ack.clone());
                        }
                    }
                });
            }
            _ => {}
        }
    }
}

// =============================================================================
// Mobile Scanner
// =============================================================================

/// A paired scanner.
///
/// ## Usage
/// ```rust,ignore
/// let channel = ChannelClient::spawn(WsConnector::new(&config.transport.hub_url)?, transport);
/// let pairing = HttpPairingClient::new(&config.pairing.base_url)?;
/// let identity = Arc::new(ConfigIdentity::new(config.clone(), None));
///
/// let scanner = MobileScanner::new(&config.device.name, pairing, channel, identity, TokioClock);
/// scanner.start().await?;
///
/// if scanner.decode("1042")? {
///     scanner.send().await?;
/// }
/// ```
pub struct MobileScanner<P, K> {
    shared: Arc<Shared>,
    pairing: Arc<P>,
    clock: K,
    channel: ChannelClient,
    settle: Duration,
    subscriptions: Vec<Subscription>,
    device_subscriptions: Mutex<Vec<Subscription>>,
}

impl<P: PairingClient, K: Clock> MobileScanner<P, K> {
    /// Creates the scanner and subscribes to `pos-scans`. Call
    /// [`start`](Self::start) to pair.
    pub fn new(
        name: &str,
        pairing: P,
        channel: ChannelClient,
        identity: Arc<dyn IdentityStore>,
        clock: K,
    ) -> Self {
        let (state_tx, _) = watch::channel(ScannerState::Init);
        let shared = Arc::new(Shared {
            name: name.trim().to_string(),
            machine: Mutex::new(Machine {
                state: ScannerState::Init,
                device_id: None,
                target: None,
                carts: Vec::new(),
                last_ack: None,
            }),
            state_tx,
            identity,
        });

        let mut subscriptions = Vec::new();
        for event in [EVENT_CART_SYNC, EVENT_SCAN_ACK] {
            let handler = shared.clone();
            subscriptions.push(channel.subscribe(SCAN_TOPIC, event, move |e| handler.handle(e)));
        }

        let pairing = Arc::new(pairing);
        let requester = channel.clone();
        let resync_shared = shared.clone();
        let resync_pairing = pairing.clone();
        subscriptions.push(channel.on_state_change(move |state| {
            if state == ConnectionState::Connected {
                request_carts(&requester);
                tokio::spawn(resync(
                    resync_shared.clone(),
                    resync_pairing.clone(),
                    requester.clone(),
                ));
            }
        }));
        if channel.is_connected() {
            request_carts(&channel);
        }

        MobileScanner {
            shared,
            pairing,
            clock,
            channel,
            settle: DEFAULT_SETTLE,
            subscriptions,
            device_subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Overrides the settle interval of the reconnect path.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    // =========================================================================
    // Observation
    // =========================================================================

    pub fn state(&self) -> ScannerState {
        lock(&self.shared.machine).state.clone()
    }

    pub fn state_watch(&self) -> watch::Receiver<ScannerState> {
        self.shared.state_tx.subscribe()
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn device_id(&self) -> Option<String> {
        lock(&self.shared.machine).device_id.clone()
    }

    /// Carts from the latest `cart-sync`.
    pub fn carts(&self) -> Vec<CartSummary> {
        lock(&self.shared.machine).carts.clone()
    }

    /// Latest acknowledgement addressed to this device.
    pub fn last_ack(&self) -> Option<ScanAck> {
        lock(&self.shared.machine).last_ack.clone()
    }

    pub fn channel(&self) -> &ChannelClient {
        &self.channel
    }

    // =========================================================================
    // Pairing
    // =========================================================================

    /// Resumes the stored identity or registers a new one.
    ///
    /// A stored id the registry no longer knows is discarded and the device
    /// registers again. The record is read after the device topic is
    /// joined, so a push sent in between is not lost.
    pub async fn start(&self) -> SyncResult<ScannerState> {
        let Some(device_id) = self.shared.identity.device_id() else {
            return self.register().await;
        };

        self.shared.update(|m| {
            m.device_id = Some(device_id.clone());
            if m.state == ScannerState::Unregistered {
                m.state = ScannerState::Init;
            }
        });
        self.watch_device(&device_id).await;

        match self.pairing.fetch(&device_id).await {
            Ok(device) => {
                info!(device_id = %device_id, status = %device.status, "Resumed identity");
                self.shared.apply_status(&device_id, device.status);
                Ok(self.state())
            }
            Err(e) if e.is_unknown_device() => {
                warn!(device_id = %device_id, "Stored identity is unknown; registering again");
                self.shared.update(|m| m.device_id = None);
                self.shared.identity.clear()?;
                self.register().await
            }
            Err(e) => Err(e),
        }
    }

    /// Registers under a fresh client-generated id.
    pub async fn register(&self) -> SyncResult<ScannerState> {
        let device_id = Uuid::new_v4().to_string();
        let previous = self.shared.update(|m| {
            m.device_id = Some(device_id.clone());
            std::mem::replace(&mut m.state, ScannerState::Registering)
        });

        // Listen before registering so no push can slip past
        self.watch_device(&device_id).await;

        let device = match self.pairing.register(&device_id, self.name()).await {
            Ok(device) => device,
            Err(e) => {
                warn!(device_id = %device_id, error = %e, "Registration failed");
                self.shared.update(|m| {
                    m.device_id = None;
                    m.state = previous;
                });
                return Err(e);
            }
        };

        if let Err(e) = self.shared.identity.store(&device.device_id) {
            warn!(error = %e, "Identity not saved; this session keeps it in memory");
        }
        info!(device_id = %device.device_id, status = %device.status, "Registered");

        self.shared.update(|m| {
            if matches!(m.state, ScannerState::Registering) {
                m.state = on_status(ScannerState::Registering, device.status);
            }
        });
        Ok(self.state())
    }

    /// Refreshes `last_active` and catches up on any missed status push.
    pub async fn heartbeat(&self) -> SyncResult<DeviceStatus> {
        let device_id = self.device_id().ok_or(PairingError::Unregistered)?;

        match self.pairing.heartbeat(&device_id).await {
            Ok(device) => {
                self.shared.apply_status(&device_id, device.status);
                Ok(device.status)
            }
            Err(e) if e.is_unknown_device() => {
                self.shared.unregister(&device_id);
                Err(PairingError::Unregistered.into())
            }
            Err(e) => Err(e),
        }
    }

    /// Subscribes to `device_<id>` and waits for the hub to confirm it.
    /// Without a confirmation the reconnect resync covers the gap.
    async fn watch_device(&self, device_id: &str) {
        let topic = device_topic(device_id);
        let subscriptions: Vec<Subscription> = [EVENT_DEVICE_STATUS, EVENT_DEVICE_REMOVED]
            .into_iter()
            .map(|event| {
                let handler = self.shared.clone();
                self.channel
                    .subscribe(&topic, event, move |e| handler.handle(e))
            })
            .collect();

        // Replacing drops the previous identity's subscriptions
        *lock(&self.device_subscriptions) = subscriptions;

        if let Err(e) = self.channel.wait_joined(&topic, JOIN_TIMEOUT).await {
            warn!(topic = %topic, error = %e, "Device topic not confirmed; relying on resync");
        }
    }

    // =========================================================================
    // Scan Review
    // =========================================================================

    /// Offers a decoded code.
    ///
    /// Returns `Ok(false)` if a scan is already under review or being sent.
    ///
    /// ## Errors
    /// `PairingError` unless approved.
    pub fn decode(&self, code: &str) -> SyncResult<bool> {
        let code = code.trim().to_string();
        self.shared.update(|m| match &m.state {
            ScannerState::Approved(ScanPhase::Scanning)
            | ScannerState::Approved(ScanPhase::Success { .. }) => {
                m.state = ScannerState::Approved(ScanPhase::Review {
                    scan: PendingScan {
                        code,
                        quantity: 1,
                        target: m.target.clone(),
                    },
                    error: None,
                });
                Ok(true)
            }
            ScannerState::Approved(_) => {
                debug!(code = %code, "Decode ignored; a scan is already in flight");
                Ok(false)
            }
            other => Err(other.not_allowed()),
        })
    }

    pub fn set_quantity(&self, quantity: i64) -> SyncResult<()> {
        validate_quantity(quantity)?;
        self.edit_review(|scan| scan.quantity = quantity)
    }

    /// Chooses the destination cart; also used for later scans.
    pub fn set_target(&self, cart_id: Option<&str>) -> SyncResult<()> {
        let target = cart_id.map(str::to_string);
        self.shared.update(|m| m.target = target.clone());
        match self.edit_review(|scan| scan.target = target) {
            Err(SyncError::InvalidState(_)) => Ok(()),
            other => other,
        }
    }

    /// Drops the scan under review.
    pub fn cancel_review(&self) -> SyncResult<()> {
        self.shared.update(|m| match m.state {
            ScannerState::Approved(ScanPhase::Review { .. }) => {
                m.state = ScannerState::Approved(ScanPhase::Scanning);
                Ok(())
            }
            ref other => Err(other.not_allowed()),
        })
    }

    /// Leaves `Success` for `Scanning`.
    pub fn dismiss(&self) {
        self.shared.update(|m| {
            if matches!(m.state, ScannerState::Approved(ScanPhase::Success { .. })) {
                m.state = ScannerState::Approved(ScanPhase::Scanning);
            }
        });
    }

    fn edit_review(&self, edit: impl FnOnce(&mut PendingScan)) -> SyncResult<()> {
        self.shared.update(|m| match &mut m.state {
            ScannerState::Approved(ScanPhase::Review { scan, error }) => {
                edit(scan);
                *error = None;
                Ok(())
            }
            other => Err(other.not_allowed()),
        })
    }

    // =========================================================================
    // Delivery
    // =========================================================================

    /// Sends the scan under review.
    ///
    /// On failure the scan goes back to review with the error attached.
    pub async fn send(&self) -> SyncResult<()> {
        let scan = self.shared.update(|m| {
            let state = std::mem::replace(&mut m.state, ScannerState::Init);
            match state {
                ScannerState::Approved(ScanPhase::Review { scan, .. }) => {
                    m.state = ScannerState::Approved(ScanPhase::Sending(scan.clone()));
                    Ok(scan)
                }
                other => {
                    let err = other.not_allowed();
                    m.state = other;
                    Err(err)
                }
            }
        })?;

        let mut event = ScanEvent::new(&scan.code, self.name(), scan.quantity);
        event.cart_id = scan.target.clone();

        let result = self.deliver(event).await;

        self.shared.update(|m| {
            // A push may have moved us on (blocked, removed) meanwhile
            if m.state != ScannerState::Approved(ScanPhase::Sending(scan.clone())) {
                return;
            }
            m.state = match &result {
                Ok(()) => ScannerState::Approved(ScanPhase::Success {
                    scan: scan.clone(),
                    ack: None,
                }),
                Err(e) => ScannerState::Approved(ScanPhase::Review {
                    scan: scan.clone(),
                    error: Some(e.to_string()),
                }),
            };
        });

        match &result {
            Ok(()) => info!(code = %scan.code, quantity = scan.quantity, "Scan sent"),
            Err(e) => warn!(code = %scan.code, error = %e, "Scan not sent; kept for review"),
        }
        result
    }

    /// Sends the connectivity-test code through the same path. Does not
    /// touch the review state.
    pub async fn test_connection(&self) -> SyncResult<()> {
        self.deliver(ScanEvent::connectivity_test(self.name())).await
    }

    /// One broadcast, and at most one more after a bounded reconnect.
    async fn deliver(&self, event: ScanEvent) -> SyncResult<()> {
        let message = ChannelEvent::RemoteScan(event);

        let first = if self.channel.is_connected() {
            self.channel.broadcast(SCAN_TOPIC, &message)
        } else {
            Err(TransportError::NotConnected.into())
        };

        match first {
            Ok(()) => Ok(()),
            Err(e) if e.is_retryable() => {
                info!(error = %e, settle_ms = self.settle.as_millis() as u64, "Reconnecting before retry");
                if let Err(e) = self.channel.reconnect() {
                    debug!(error = %e, "Reconnect request not queued");
                }
                self.clock.sleep(self.settle).await;
                self.channel.broadcast(SCAN_TOPIC, &message)
            }
            Err(e) => Err(e),
        }
    }

    /// Drops every channel subscription.
    pub fn close(self) {
        drop(self.subscriptions);
        lock(&self.device_subscriptions).clear();
    }
}

/// Re-reads the device record after a reconnect. Pushes sent while the
/// link was down were never delivered.
async fn resync<P: PairingClient>(shared: Arc<Shared>, pairing: Arc<P>, channel: ChannelClient) {
    let Some(device_id) = shared.paired_id() else {
        return;
    };
    if let Err(e) = channel
        .wait_joined(&device_topic(&device_id), JOIN_TIMEOUT)
        .await
    {
        debug!(error = %e, "Device topic not confirmed before resync");
    }

    match pairing.fetch(&device_id).await {
        Ok(device) => {
            debug!(device_id = %device_id, status = %device.status, "Status resynced");
            shared.apply_status(&device_id, device.status);
        }
        Err(e) if e.is_unknown_device() => shared.unregister(&device_id),
        Err(e) => warn!(error = %e, "Status resync failed; the next heartbeat catches up"),
    }
}

fn request_carts(channel: &ChannelClient) {
    if let Err(e) = channel.broadcast(SCAN_TOPIC, &ChannelEvent::RequestCarts) {
        debug!(error = %e, "request-carts not sent");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(code: &str) -> PendingScan {
        PendingScan {
            code: code.into(),
            quantity: 1,
            target: None,
        }
    }

    #[test]
    fn test_approval_enters_scanning() {
        assert_eq!(
            on_status(ScannerState::Pending, DeviceStatus::Approved),
            ScannerState::Approved(ScanPhase::Scanning)
        );
        assert_eq!(
            on_status(ScannerState::Init, DeviceStatus::Pending),
            ScannerState::Pending
        );
    }

    #[test]
    fn test_block_holds_scan_in_flight() {
        let reviewing = ScannerState::Approved(ScanPhase::Review {
            scan: scan("1042"),
            error: None,
        });
        let blocked = on_status(reviewing, DeviceStatus::Blocked);
        assert_eq!(blocked, ScannerState::Blocked { held: Some(scan("1042")) });

        let sending = ScannerState::Approved(ScanPhase::Sending(scan("7")));
        assert_eq!(
            on_status(sending, DeviceStatus::Blocked),
            ScannerState::Blocked { held: Some(scan("7")) }
        );

        assert_eq!(
            on_status(ScannerState::Approved(ScanPhase::Scanning), DeviceStatus::Blocked),
            ScannerState::Blocked { held: None }
        );
    }

    #[test]
    fn test_unblock_returns_held_scan_to_review() {
        let state = on_status(
            ScannerState::Blocked { held: Some(scan("1042")) },
            DeviceStatus::Approved,
        );
        assert_eq!(state.review(), Some(&scan("1042")));

        let state = on_status(ScannerState::Blocked { held: None }, DeviceStatus::Approved);
        assert!(state.is_scanning());
    }

    #[test]
    fn test_repeated_push_keeps_phase() {
        let reviewing = ScannerState::Approved(ScanPhase::Review {
            scan: scan("1042"),
            error: None,
        });
        assert_eq!(on_status(reviewing.clone(), DeviceStatus::Approved), reviewing);
    }

    #[test]
    fn test_stale_pending_is_ignored() {
        let scanning = ScannerState::Approved(ScanPhase::Scanning);
        assert_eq!(on_status(scanning.clone(), DeviceStatus::Pending), scanning);

        let blocked = ScannerState::Blocked { held: Some(scan("1042")) };
        assert_eq!(on_status(blocked.clone(), DeviceStatus::Pending), blocked);
    }

    #[test]
    fn test_unregistered_ignores_pushes() {
        assert_eq!(
            on_status(ScannerState::Unregistered, DeviceStatus::Approved),
            ScannerState::Unregistered
        );
    }

    #[test]
    fn test_not_allowed_errors() {
        assert!(matches!(
            ScannerState::Pending.not_allowed(),
            SyncError::Pairing(PairingError::NotApproved)
        ));
        assert!(matches!(
            ScannerState::Blocked { held: None }.not_allowed(),
            SyncError::Pairing(PairingError::Blocked)
        ));
        assert!(matches!(
            ScannerState::Unregistered.not_allowed(),
            SyncError::Pairing(PairingError::Unregistered)
        ));
    }

    #[test]
    fn test_memory_identity() {
        let identity = MemoryIdentity::default();
        assert!(identity.device_id().is_none());
        identity.store("abc").unwrap();
        assert_eq!(identity.device_id().as_deref(), Some("abc"));
        identity.clear().unwrap();
        assert!(identity.device_id().is_none());
    }

    #[test]
    fn test_config_identity_persists() {
        let path = std::env::temp_dir().join(format!("tally-identity-{}.toml", Uuid::new_v4()));
        let id = Uuid::new_v4().to_string();

        let identity = ConfigIdentity::new(ScannerConfig::default(), Some(path.clone()));
        identity.store(&id).unwrap();

        let saved: ScannerConfig = toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved.device.id.as_deref(), Some(id.as_str()));

        identity.clear().unwrap();
        let saved: ScannerConfig = toml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(saved.device.id.is_none());

        let _ = std::fs::remove_file(path);
    }
}
