//! # Channel Transport
//!
//! Topic-scoped publish/subscribe with connection-state tracking. No
//! business logic lives here.
//!
//! ## Connection Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Channel Connection States                            │
//! │                                                                         │
//! │  ┌────────────┐   spawn / backoff    ┌────────────┐                    │
//! │  │Disconnected│ ───────────────────► │ Connecting │                    │
//! │  └────────────┘    / reconnect()     └─────┬──────┘                    │
//! │        ▲                                   │                            │
//! │        │                         success   │   failure                  │
//! │        │                       ┌───────────┴──────┐                    │
//! │        │                       ▼                  │                    │
//! │        │                ┌────────────┐            │                    │
//! │        └─── link lost ──│ Connected  │            │                    │
//! │        └────────────────┴────────────┴────────────┘                    │
//! │                                                                         │
//! │  BACKOFF: 500ms → 1s → 2s → ... → 60s (jittered)                       │
//! │  max_retries = 0 means retry forever; after the limit the driver       │
//! │  idles in Disconnected until reconnect() or shutdown().                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//! - `broadcast` succeeds only while `Connected`; otherwise it fails at once.
//!   Nothing is queued across a disconnect.
//! - At-most-once delivery, ordered per sender per connection.
//! - A dropped [`Subscription`] is never called again.
//! - A topic counts as joined once the far side has confirmed the join.
//!   [`ChannelClient::wait_joined`] waits for that; joins are forgotten
//!   when the link drops and confirmed again after the rejoin.
//!
//! Handlers run on the driver task and must not block: hand work off to a
//! channel or take a short synchronous lock.

pub mod broker;
pub mod memory;
pub mod ws;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::error::{SyncResult, TransportError};
use crate::protocol::{ChannelEvent, Envelope, LinkFrame};

pub use broker::Broker;
pub use memory::MemoryConnector;
pub use ws::WsConnector;

/// Capacity of the outbound queue between handles and the driver.
pub const OUTBOUND_CAPACITY: usize = 256;

/// Buffer of each direction inside a link.
pub(crate) const LINK_BUFFER: usize = 256;

// =============================================================================
// Connection State
// =============================================================================

/// Externally observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Reconnect policy and queue sizing for a [`ChannelClient`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Label used in logs ("terminal", a device name, ...).
    pub label: String,

    /// Bound on a single connection attempt.
    pub connect_timeout: Duration,

    pub initial_backoff: Duration,

    pub max_backoff: Duration,

    /// Consecutive failed attempts before idling (0 = infinite).
    pub max_retries: u32,

    pub outbound_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            label: "channel".to_string(),
            connect_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            max_retries: 0, // Infinite
            outbound_capacity: OUTBOUND_CAPACITY,
        }
    }
}

impl TransportConfig {
    pub fn labeled(label: impl Into<String>) -> Self {
        TransportConfig {
            label: label.into(),
            ..Default::default()
        }
    }
}

// =============================================================================
// Connector Seam
// =============================================================================

/// Both halves of a live connection as seen by the driver.
///
/// The link is considered lost when `rx` yields `None`.
#[derive(Debug)]
pub struct Link {
    pub tx: mpsc::Sender<LinkFrame>,
    pub rx: mpsc::Receiver<Envelope>,
}

/// Produces links. Implemented by [`MemoryConnector`] and [`WsConnector`].
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> impl Future<Output = SyncResult<Link>> + Send;
}

// =============================================================================
// Subscriptions
// =============================================================================

type Handler = Arc<dyn Fn(&ChannelEvent) + Send + Sync>;

struct HandlerEntry {
    id: u64,
    active: Arc<AtomicBool>,
    handler: Handler,
}

/// topic → event → handlers, plus the topics the far side has confirmed.
struct SubscriptionTable {
    topics: RwLock<HashMap<String, HashMap<String, Vec<HandlerEntry>>>>,
    next_id: AtomicU64,
    joined: watch::Sender<HashSet<String>>,
}

impl SubscriptionTable {
    fn new() -> Self {
        let (joined, _) = watch::channel(HashSet::new());
        SubscriptionTable {
            topics: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            joined,
        }
    }

    /// Inserts a handler; returns true if the topic is new.
    fn insert(&self, topic: &str, event: &str, entry: HandlerEntry) -> bool {
        let mut topics = self.topics.write().unwrap_or_else(|e| e.into_inner());
        let is_new = !topics.contains_key(topic);
        topics
            .entry(topic.to_string())
            .or_default()
            .entry(event.to_string())
            .or_default()
            .push(entry);
        is_new
    }

    /// Removes a handler; returns true if the topic has no handlers left.
    fn remove(&self, topic: &str, event: &str, id: u64) -> bool {
        let mut topics = self.topics.write().unwrap_or_else(|e| e.into_inner());
        let Some(events) = topics.get_mut(topic) else {
            return false;
        };
        if let Some(entries) = events.get_mut(event) {
            entries.retain(|entry| entry.id != id);
            if entries.is_empty() {
                events.remove(event);
            }
        }
        if events.is_empty() {
            topics.remove(topic);
            self.joined.send_if_modified(|joined| joined.remove(topic));
            return true;
        }
        false
    }

    /// Records a join reply. Ignored if the topic was left meanwhile.
    fn mark_joined(&self, topic: &str) {
        let known = {
            let topics = self.topics.read().unwrap_or_else(|e| e.into_inner());
            topics.contains_key(topic)
        };
        if known {
            self.joined
                .send_if_modified(|joined| joined.insert(topic.to_string()));
        }
    }

    fn clear_joined(&self) {
        self.joined.send_if_modified(|joined| {
            let had_any = !joined.is_empty();
            joined.clear();
            had_any
        });
    }

    fn topics(&self) -> Vec<String> {
        let topics = self.topics.read().unwrap_or_else(|e| e.into_inner());
        topics.keys().cloned().collect()
    }

    /// Live handlers for an envelope, cloned out so the lock is not held
    /// while they run.
    fn handlers_for(&self, topic: &str, event: &str) -> Vec<(Arc<AtomicBool>, Handler)> {
        let topics = self.topics.read().unwrap_or_else(|e| e.into_inner());
        topics
            .get(topic)
            .and_then(|events| events.get(event))
            .map(|entries| {
                entries
                    .iter()
                    .map(|entry| (entry.active.clone(), entry.handler.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Unsubscribe handle. Dropping it (or calling [`Subscription::cancel`])
/// tears the registration down.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    active: Arc<AtomicBool>,
    teardown: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    fn new(active: Arc<AtomicBool>, teardown: impl FnOnce() + Send + Sync + 'static) -> Self {
        Subscription {
            active,
            teardown: Some(Box::new(teardown)),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Unsubscribes now.
    pub fn cancel(mut self) {
        self.teardown_now();
    }

    fn teardown_now(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(teardown) = self.teardown.take() {
            teardown();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.teardown_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

// =============================================================================
// Channel Client (handle)
// =============================================================================

enum DriverCommand {
    Reconnect,
    Shutdown,
}

struct ClientShared {
    label: String,
    outbound: mpsc::Sender<LinkFrame>,
    commands: mpsc::Sender<DriverCommand>,
    state: watch::Receiver<ConnectionState>,
    subscriptions: Arc<SubscriptionTable>,
}

/// Cloneable handle to one channel connection and its driver task.
///
/// ## Usage
/// ```rust,ignore
/// let broker = Broker::new();
/// let client = ChannelClient::spawn(MemoryConnector::new(broker), TransportConfig::labeled("terminal"));
///
/// let _sub = client.subscribe(SCAN_TOPIC, EVENT_REQUEST_CARTS, |event| { /* ... */ });
/// client.broadcast(SCAN_TOPIC, &ChannelEvent::RequestCarts)?;
/// ```
#[derive(Clone)]
pub struct ChannelClient {
    shared: Arc<ClientShared>,
}

impl fmt::Debug for ChannelClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelClient")
            .field("label", &self.shared.label)
            .field("state", &self.state())
            .finish()
    }
}

impl ChannelClient {
    /// Creates a client and spawns its driver. Must run inside a Tokio runtime.
    pub fn spawn<C: Connector>(connector: C, config: TransportConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let (command_tx, command_rx) = mpsc::channel(8);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let subscriptions = Arc::new(SubscriptionTable::new());

        let driver = Driver {
            connector,
            config: config.clone(),
            state: state_tx,
            outbound: outbound_rx,
            commands: command_rx,
            subscriptions: subscriptions.clone(),
        };
        tokio::spawn(driver.run());

        ChannelClient {
            shared: Arc::new(ClientShared {
                label: config.label,
                outbound: outbound_tx,
                commands: command_tx,
                state: state_rx,
                subscriptions,
            }),
        }
    }

    /// Publishes an event on `topic`. Fire-and-forget.
    ///
    /// ## Errors
    /// - `TransportError::NotConnected` unless currently `Connected`
    /// - `TransportError::QueueFull` if the outbound queue is at capacity
    pub fn broadcast(&self, topic: &str, event: &ChannelEvent) -> SyncResult<()> {
        if self.state() != ConnectionState::Connected {
            return Err(TransportError::NotConnected.into());
        }

        let envelope = event.to_envelope(topic)?;
        debug!(
            label = %self.shared.label,
            topic = %topic,
            event = %envelope.event,
            "Broadcasting"
        );

        self.shared
            .outbound
            .try_send(LinkFrame::Publish(envelope))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => TransportError::QueueFull.into(),
                mpsc::error::TrySendError::Closed(_) => TransportError::Closed.into(),
            })
    }

    /// Registers `handler` for `event` on `topic`.
    ///
    /// The handler receives decoded, validated events only. Keep the
    /// returned [`Subscription`] alive for as long as the handler should run.
    pub fn subscribe<F>(&self, topic: &str, event: &str, handler: F) -> Subscription
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        let table = &self.shared.subscriptions;
        let id = table.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));

        let is_new_topic = table.insert(
            topic,
            event,
            HandlerEntry {
                id,
                active: active.clone(),
                handler: Arc::new(handler),
            },
        );

        debug!(label = %self.shared.label, topic = %topic, event = %event, "Subscribed");

        // The driver joins every known topic after connecting; this covers
        // topics added while already connected.
        if is_new_topic && self.state() == ConnectionState::Connected {
            let _ = self.shared.outbound.try_send(LinkFrame::Join {
                topic: topic.to_string(),
            });
        }

        let subscriptions = Arc::downgrade(&self.shared.subscriptions);
        let outbound = self.shared.outbound.downgrade();
        let state = self.shared.state.clone();
        let topic = topic.to_string();
        let event = event.to_string();

        Subscription::new(active, move || {
            let Some(table) = subscriptions.upgrade() else {
                return;
            };
            let topic_empty = table.remove(&topic, &event, id);
            if topic_empty && *state.borrow() == ConnectionState::Connected {
                if let Some(outbound) = outbound.upgrade() {
                    let _ = outbound.try_send(LinkFrame::Leave { topic });
                }
            }
        })
    }

    /// Invokes `callback` with every connection state change until the
    /// returned subscription is dropped.
    pub fn on_state_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        let active = Arc::new(AtomicBool::new(true));
        let mut state = self.shared.state.clone();
        let _ = state.borrow_and_update();

        let flag = active.clone();
        let task = tokio::spawn(async move {
            while state.changed().await.is_ok() {
                let current = *state.borrow_and_update();
                if !flag.load(Ordering::SeqCst) {
                    break;
                }
                callback(current);
            }
        });

        Subscription::new(active, move || task.abort())
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// A receiver for UIs and tests that want to await state themselves.
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.clone()
    }

    /// Waits until `Connected`, up to `timeout`.
    pub async fn wait_connected(&self, timeout: Duration) -> SyncResult<()> {
        let mut state = self.shared.state.clone();
        let outcome = tokio::time::timeout(
            timeout,
            state.wait_for(|s| *s == ConnectionState::Connected),
        )
        .await
        .map(|waited| waited.map(|_| ()));

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::Closed.into()),
            Err(_) => Err(TransportError::Timeout(timeout.as_millis() as u64).into()),
        }
    }

    /// Whether the far side has confirmed the join of `topic` on the
    /// current link.
    pub fn is_joined(&self, topic: &str) -> bool {
        self.shared.subscriptions.joined.borrow().contains(topic)
    }

    /// Waits until `topic` is joined, up to `timeout`. From then on every
    /// envelope published on the topic reaches this client's handlers.
    ///
    /// ## Errors
    /// `TransportError::Timeout` if no confirmation arrives in time, for
    /// instance because the link is down.
    pub async fn wait_joined(&self, topic: &str, timeout: Duration) -> SyncResult<()> {
        let mut joined = self.shared.subscriptions.joined.subscribe();
        let outcome = tokio::time::timeout(
            timeout,
            joined.wait_for(|topics| topics.contains(topic)),
        )
        .await
        .map(|waited| waited.map(|_| ()));

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::Closed.into()),
            Err(_) => Err(TransportError::Timeout(timeout.as_millis() as u64).into()),
        }
    }

    /// Requests one immediate connection attempt, bounded by the connect
    /// timeout. No-op while already connected.
    pub fn reconnect(&self) -> SyncResult<()> {
        info!(label = %self.shared.label, "Reconnect requested");
        self.shared
            .commands
            .try_send(DriverCommand::Reconnect)
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => TransportError::QueueFull.into(),
                mpsc::error::TrySendError::Closed(_) => TransportError::Closed.into(),
            })
    }

    /// Stops the driver and closes the link.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.shared
            .commands
            .send(DriverCommand::Shutdown)
            .await
            .map_err(|_| TransportError::Closed.into())
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }
}

// =============================================================================
// Driver
// =============================================================================

/// One connection attempt, bounded by `timeout`.
async fn connect_once<C: Connector>(connector: &C, timeout: Duration) -> SyncResult<Link> {
    match tokio::time::timeout(timeout, connector.connect()).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(timeout.as_millis() as u64).into()),
    }
}

enum LinkExit {
    Lost,
    Shutdown,
}

struct Driver<C> {
    connector: C,
    config: TransportConfig,
    state: watch::Sender<ConnectionState>,
    outbound: mpsc::Receiver<LinkFrame>,
    commands: mpsc::Receiver<DriverCommand>,
    subscriptions: Arc<SubscriptionTable>,
}

impl<C: Connector> Driver<C> {
    async fn run(mut self) {
        info!(label = %self.config.label, "Channel driver starting");

        let mut backoff = self.create_backoff();
        let mut failures = 0u32;

        'outer: loop {
            self.set_state(ConnectionState::Connecting);

            match connect_once(&self.connector, self.config.connect_timeout).await {
                Ok(link) => {
                    backoff.reset();
                    failures = 0;

                    // Frames queued while disconnected are stale
                    self.drain_outbound();
                    self.set_state(ConnectionState::Connected);
                    info!(label = %self.config.label, "Channel connected");

                    let exit = self.serve(link).await;
                    self.subscriptions.clear_joined();
                    self.set_state(ConnectionState::Disconnected);
                    self.drain_outbound();

                    match exit {
                        LinkExit::Shutdown => break 'outer,
                        LinkExit::Lost => {
                            warn!(label = %self.config.label, "Channel link lost");
                        }
                    }
                }
                Err(e) => {
                    failures += 1;
                    self.set_state(ConnectionState::Disconnected);
                    warn!(label = %self.config.label, attempt = failures, ?e, "Channel connect failed");
                }
            }

            // Retry limit reached: idle until asked again
            if self.config.max_retries > 0 && failures >= self.config.max_retries {
                error!(
                    label = %self.config.label,
                    max_retries = self.config.max_retries,
                    "Max reconnection attempts reached"
                );
                loop {
                    tokio::select! {
                        command = self.commands.recv() => match command {
                            Some(DriverCommand::Reconnect) => {
                                failures = self.config.max_retries.saturating_sub(1);
                                continue 'outer;
                            }
                            Some(DriverCommand::Shutdown) | None => break 'outer,
                        },
                        frame = self.outbound.recv() => {
                            if frame.is_none() {
                                break 'outer;
                            }
                        }
                    }
                }
            }

            let delay = backoff
                .next_backoff()
                .unwrap_or(self.config.max_backoff);
            debug!(label = %self.config.label, ?delay, "Waiting before reconnect");

            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    command = self.commands.recv() => match command {
                        Some(DriverCommand::Reconnect) => break,
                        Some(DriverCommand::Shutdown) | None => break 'outer,
                    },
                    frame = self.outbound.recv() => {
                        // Sent while disconnected: lost by contract
                        if frame.is_none() {
                            break 'outer;
                        }
                    }
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!(label = %self.config.label, "Channel driver stopped");
    }

    /// Pumps one live link until it drops or the client shuts down.
    async fn serve(&mut self, mut link: Link) -> LinkExit {
        for topic in self.subscriptions.topics() {
            if link.tx.send(LinkFrame::Join { topic }).await.is_err() {
                return LinkExit::Lost;
            }
        }

        loop {
            tokio::select! {
                frame = self.outbound.recv() => match frame {
                    Some(frame) => {
                        if link.tx.send(frame).await.is_err() {
                            return LinkExit::Lost;
                        }
                    }
                    // Every handle is gone
                    None => return LinkExit::Shutdown,
                },

                envelope = link.rx.recv() => match envelope {
                    Some(envelope) => self.dispatch(envelope),
                    None => return LinkExit::Lost,
                },

                command = self.commands.recv() => match command {
                    Some(DriverCommand::Reconnect) => {
                        debug!(label = %self.config.label, "Already connected; reconnect ignored");
                    }
                    Some(DriverCommand::Shutdown) | None => return LinkExit::Shutdown,
                },
            }
        }
    }

    /// Decodes an envelope and runs the matching live handlers.
    fn dispatch(&self, envelope: Envelope) {
        if envelope.is_join_reply() {
            debug!(label = %self.config.label, topic = %envelope.topic, "Join confirmed");
            self.subscriptions.mark_joined(&envelope.topic);
            return;
        }

        let handlers = self
            .subscriptions
            .handlers_for(&envelope.topic, &envelope.event);
        if handlers.is_empty() {
            debug!(
                label = %self.config.label,
                topic = %envelope.topic,
                event = %envelope.event,
                "No subscriber; envelope ignored"
            );
            return;
        }

        let event = match ChannelEvent::decode(&envelope) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    label = %self.config.label,
                    topic = %envelope.topic,
                    event = %envelope.event,
                    error = %e,
                    "Dropping malformed message"
                );
                return;
            }
        };

        for (active, handler) in handlers {
            if active.load(Ordering::SeqCst) {
                handler(&event);
            }
        }
    }

    fn drain_outbound(&mut self) {
        let mut dropped = 0usize;
        while self.outbound.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(label = %self.config.label, dropped, "Discarded frames queued while offline");
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.config.initial_backoff,
            max_interval: self.config.max_backoff,
            multiplier: 2.0,
            max_elapsed_time: None, // No limit on total time
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{EVENT_REQUEST_CARTS, SCAN_TOPIC};
    use std::sync::Mutex;

    const WAIT: Duration = Duration::from_secs(2);

    fn quick() -> TransportConfig {
        TransportConfig {
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(50),
            connect_timeout: Duration::from_millis(200),
            ..TransportConfig::labeled("test")
        }
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::Disconnected.to_string(), "disconnected");
    }

    #[test]
    fn test_transport_config_default() {
        let config = TransportConfig::default();
        assert_eq!(config.initial_backoff, Duration::from_millis(500));
        assert_eq!(config.max_backoff, Duration::from_secs(60));
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.outbound_capacity, 256);
    }

    #[tokio::test]
    async fn test_broadcast_requires_connection() {
        let connector = MemoryConnector::new(Broker::new());
        connector.set_online(false);
        let client = ChannelClient::spawn(connector, quick());

        let err = client
            .broadcast(SCAN_TOPIC, &ChannelEvent::RequestCarts)
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_other_client_not_self() {
        let connector = MemoryConnector::new(Broker::new());
        let a = ChannelClient::spawn(connector.clone(), quick());
        let b = ChannelClient::spawn(connector.clone(), quick());

        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let _a_sub = a.subscribe(SCAN_TOPIC, EVENT_REQUEST_CARTS, move |e| {
            let _ = a_tx.send(e.clone());
        });
        let _b_sub = b.subscribe(SCAN_TOPIC, EVENT_REQUEST_CARTS, move |e| {
            let _ = b_tx.send(e.clone());
        });

        a.wait_connected(WAIT).await.unwrap();
        b.wait_connected(WAIT).await.unwrap();

        a.broadcast(SCAN_TOPIC, &ChannelEvent::RequestCarts).unwrap();

        let got = tokio::time::timeout(WAIT, b_rx.recv()).await.unwrap();
        assert_eq!(got, Some(ChannelEvent::RequestCarts));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_not_called() {
        let connector = MemoryConnector::new(Broker::new());
        let sender = ChannelClient::spawn(connector.clone(), quick());
        let receiver = ChannelClient::spawn(connector.clone(), quick());

        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        let sub = receiver.subscribe(SCAN_TOPIC, EVENT_REQUEST_CARTS, move |_| {
            *counter.lock().unwrap() += 1;
        });
        assert!(sub.is_active());

        sender.wait_connected(WAIT).await.unwrap();
        receiver.wait_connected(WAIT).await.unwrap();

        drop(sub);
        sender.broadcast(SCAN_TOPIC, &ChannelEvent::RequestCarts).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_state_callbacks_and_reconnect() {
        let connector = MemoryConnector::new(Broker::new());
        let client = ChannelClient::spawn(connector.clone(), quick());
        client.wait_connected(WAIT).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let _watch = client.on_state_change(move |state| log.lock().unwrap().push(state));

        connector.set_online(false);
        let mut state = client.state_watch();
        tokio::time::timeout(
            WAIT,
            state.wait_for(|s| *s != ConnectionState::Connected),
        )
        .await
        .unwrap()
        .unwrap();

        connector.set_online(true);
        client.reconnect().unwrap();
        client.wait_connected(WAIT).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let seen = seen.lock().unwrap();
        assert!(seen.contains(&ConnectionState::Disconnected) || seen.contains(&ConnectionState::Connecting));
        assert_eq!(seen.last(), Some(&ConnectionState::Connected));
    }

    #[tokio::test]
    async fn test_join_is_confirmed_and_forgotten_on_link_loss() {
        let connector = MemoryConnector::new(Broker::new());
        let client = ChannelClient::spawn(connector.clone(), quick());
        client.wait_connected(WAIT).await.unwrap();

        let _sub = client.subscribe("device_d-1", "status", |_| {});
        client.wait_joined("device_d-1", WAIT).await.unwrap();
        assert!(client.is_joined("device_d-1"));
        assert!(!client.is_joined(SCAN_TOPIC));

        connector.set_online(false);
        let mut state = client.state_watch();
        tokio::time::timeout(WAIT, state.wait_for(|s| *s != ConnectionState::Connected))
            .await
            .unwrap()
            .unwrap();
        assert!(!client.is_joined("device_d-1"));

        connector.set_online(true);
        client.reconnect().unwrap();
        client.wait_joined("device_d-1", WAIT).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_joined_times_out_while_offline() {
        let connector = MemoryConnector::new(Broker::new());
        connector.set_online(false);
        let client = ChannelClient::spawn(connector, quick());

        let _sub = client.subscribe("device_d-1", "status", |_| {});
        let err = client
            .wait_joined("device_d-1", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_shutdown_stops_driver() {
        let connector = MemoryConnector::new(Broker::new());
        let client = ChannelClient::spawn(connector, quick());
        client.wait_connected(WAIT).await.unwrap();

        client.shutdown().await.unwrap();
        let mut state = client.state_watch();
        tokio::time::timeout(WAIT, state.wait_for(|s| *s == ConnectionState::Disconnected))
            .await
            .unwrap()
            .unwrap();
        assert!(!client.is_connected());
    }
}
