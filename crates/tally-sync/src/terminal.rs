//! # Terminal Service
//!
//! The single writer for carts. Channel handlers and the administrator's
//! [`TerminalHandle`] only enqueue [`TerminalCommand`]s; one task drains
//! both queues.
//!
//! Channel input goes through an unbounded intake: a handler runs on the
//! channel's driver and cannot wait, and a scan the phone already counts as
//! sent must not be dropped. Administrator commands use a bounded queue and
//! wait for room.
//!
//! ## Task Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  remote-scan handler ──┐                                                │
//! │  request-carts handler ├──► intake (unbounded) ──┐                      │
//! │  state: Connected ─────┘                         ├──► TerminalService   │
//! │  TerminalHandle ──────────► mpsc (256) ──────────┘        │             │
//! │                                      ┌────────────────────┤             │
//! │                                      ▼                    ▼             │
//! │                               ScanRouter ──► CartRegistry ──► SQLite    │
//! │                                      │                    │             │
//! │                                      ▼                    ▼             │
//! │                           scan-ack broadcast      cart-sync broadcast   │
//! │                           emitter.emit_scan_ack   emitter.emit_carts_…  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use tally_core::{AckStatus, Cart, CartSummary, ScanAck, ScanEvent};

use crate::carts::CartRegistry;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{ChannelEvent, EVENT_REMOTE_SCAN, EVENT_REQUEST_CARTS, SCAN_TOPIC};
use crate::router::{Catalog, ScanRouter};
use crate::transport::{ChannelClient, ConnectionState, Subscription};

/// Capacity of the administrator command queue.
const COMMAND_CAPACITY: usize = 256;

// =============================================================================
// Event Emitter Trait
// =============================================================================

/// Local notifications for the terminal's UI.
pub trait TerminalEventEmitter: Send + Sync {
    /// A scan was routed (toast).
    fn emit_scan_ack(&self, ack: &ScanAck);

    /// The cart list, the selection or a cart's lines changed.
    fn emit_carts_changed(&self, carts: &[CartSummary], active_id: &str);

    fn emit_error(&self, message: &str);
}

/// No-op event emitter for testing.
pub struct NoOpEmitter;

impl TerminalEventEmitter for NoOpEmitter {
    fn emit_scan_ack(&self, _ack: &ScanAck) {}
    fn emit_carts_changed(&self, _carts: &[CartSummary], _active_id: &str) {}
    fn emit_error(&self, _message: &str) {}
}

// =============================================================================
// Commands & Handle
// =============================================================================

/// Full view of the carts for the administrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CartsOverview {
    pub carts: Vec<Cart>,
    pub active_id: String,
}

type Reply<T> = oneshot::Sender<SyncResult<T>>;

/// Work items for the terminal task.
#[derive(Debug)]
pub enum TerminalCommand {
    /// Scan received over the channel; the ack is broadcast.
    RemoteScan(ScanEvent),
    /// A device asked for the cart list.
    RequestCarts,
    /// The channel (re)connected.
    ChannelUp,
    /// Scan entered at the terminal itself.
    Scan { event: ScanEvent, reply: Reply<ScanAck> },
    Create { name: String, reply: Reply<CartSummary> },
    Delete { id: String, reply: Reply<Cart> },
    Select { id: String, reply: Reply<()> },
    Rename { id: String, name: String, reply: Reply<CartSummary> },
    Clear { id: String, reply: Reply<()> },
    List { reply: oneshot::Sender<CartsOverview> },
    Get { id: String, reply: oneshot::Sender<Option<Cart>> },
    Shutdown,
}

/// Handle for talking to the terminal task.
#[derive(Debug, Clone)]
pub struct TerminalHandle {
    cmd_tx: mpsc::Sender<TerminalCommand>,
}

impl TerminalHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> TerminalCommand,
    ) -> SyncResult<T> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(reply))
            .await
            .map_err(|_| SyncError::ShuttingDown)?;
        rx.await.map_err(|_| SyncError::ShuttingDown)
    }

    /// Routes a scan entered locally. The ack is also broadcast.
    pub async fn scan(&self, event: ScanEvent) -> SyncResult<ScanAck> {
        self.request(|reply| TerminalCommand::Scan { event, reply })
            .await?
    }

    pub async fn create_cart(&self, name: &str) -> SyncResult<CartSummary> {
        let name = name.to_string();
        self.request(|reply| TerminalCommand::Create { name, reply })
            .await?
    }

    pub async fn delete_cart(&self, id: &str) -> SyncResult<Cart> {
        let id = id.to_string();
        self.request(|reply| TerminalCommand::Delete { id, reply })
            .await?
    }

    pub async fn select_cart(&self, id: &str) -> SyncResult<()> {
        let id = id.to_string();
        self.request(|reply| TerminalCommand::Select { id, reply })
            .await?
    }

    pub async fn rename_cart(&self, id: &str, name: &str) -> SyncResult<CartSummary> {
        let (id, name) = (id.to_string(), name.to_string());
        self.request(|reply| TerminalCommand::Rename { id, name, reply })
            .await?
    }

    pub async fn clear_cart(&self, id: &str) -> SyncResult<()> {
        let id = id.to_string();
        self.request(|reply| TerminalCommand::Clear { id, reply })
            .await?
    }

    pub async fn carts(&self) -> SyncResult<CartsOverview> {
        self.request(|reply| TerminalCommand::List { reply }).await
    }

    pub async fn cart(&self, id: &str) -> SyncResult<Option<Cart>> {
        let id = id.to_string();
        self.request(|reply| TerminalCommand::Get { id, reply })
            .await
    }

    /// Re-broadcasts the cart list.
    pub async fn announce(&self) -> SyncResult<()> {
        self.cmd_tx
            .send(TerminalCommand::RequestCarts)
            .await
            .map_err(|_| SyncError::ShuttingDown)
    }

    /// Stops the task and drops its channel subscriptions.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.cmd_tx
            .send(TerminalCommand::Shutdown)
            .await
            .map_err(|_| SyncError::ShuttingDown)
    }
}

// =============================================================================
// Terminal Service
// =============================================================================

/// Owns the cart registry and the router.
pub struct TerminalService<C> {
    carts: CartRegistry,
    router: ScanRouter<C>,
    channel: ChannelClient,
    emitter: Arc<dyn TerminalEventEmitter>,
}

impl<C: Catalog> TerminalService<C> {
    pub fn new(carts: CartRegistry, router: ScanRouter<C>, channel: ChannelClient) -> Self {
        Self::with_emitter(carts, router, channel, Arc::new(NoOpEmitter))
    }

    pub fn with_emitter(
        carts: CartRegistry,
        router: ScanRouter<C>,
        channel: ChannelClient,
        emitter: Arc<dyn TerminalEventEmitter>,
    ) -> Self {
        TerminalService {
            carts,
            router,
            channel,
            emitter,
        }
    }

    /// Subscribes to the channel and spawns the task.
    pub fn start(self) -> TerminalHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (intake_tx, intake_rx) = mpsc::unbounded_channel();

        let subscriptions = self.subscribe(&intake_tx);
        tokio::spawn(self.run(cmd_rx, intake_rx, subscriptions));

        TerminalHandle { cmd_tx }
    }

    fn subscribe(&self, intake: &mpsc::UnboundedSender<TerminalCommand>) -> Vec<Subscription> {
        let scans = intake.clone();
        let on_scan = self.channel.subscribe(SCAN_TOPIC, EVENT_REMOTE_SCAN, move |event| {
            if let ChannelEvent::RemoteScan(scan) = event {
                if scans.send(TerminalCommand::RemoteScan(scan.clone())).is_err() {
                    debug!(code = %scan.code, "Terminal stopped; scan not taken");
                }
            }
        });

        let requests = intake.clone();
        let on_request = self
            .channel
            .subscribe(SCAN_TOPIC, EVENT_REQUEST_CARTS, move |_| {
                let _ = requests.send(TerminalCommand::RequestCarts);
            });

        let state = intake.clone();
        let on_state = self.channel.on_state_change(move |s| {
            if s == ConnectionState::Connected {
                let _ = state.send(TerminalCommand::ChannelUp);
            }
        });

        vec![on_scan, on_request, on_state]
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<TerminalCommand>,
        mut intake_rx: mpsc::UnboundedReceiver<TerminalCommand>,
        subscriptions: Vec<Subscription>,
    ) {
        info!(carts = self.carts.len(), "Terminal service started");

        if self.channel.is_connected() {
            self.announce();
        }

        loop {
            let cmd = tokio::select! {
                Some(cmd) = intake_rx.recv() => cmd,
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => cmd,
                    // Every handle is gone
                    None => break,
                },
            };

            match cmd {
                TerminalCommand::Shutdown => {
                    info!("Terminal service shutting down");
                    break;
                }
                TerminalCommand::RemoteScan(event) => {
                    self.route(event).await;
                }
                TerminalCommand::RequestCarts => {
                    debug!("Cart list requested");
                    self.announce();
                }
                TerminalCommand::ChannelUp => {
                    self.announce();
                }
                TerminalCommand::Scan { event, reply } => {
                    let ack = self.route(event).await;
                    let _ = reply.send(Ok(ack));
                }
                TerminalCommand::Create { name, reply } => {
                    let result = self.carts.create(&name).await;
                    self.after_mutation(result.is_ok());
                    let _ = reply.send(result);
                }
                TerminalCommand::Delete { id, reply } => {
                    let result = self.carts.delete(&id).await;
                    self.after_mutation(result.is_ok());
                    let _ = reply.send(result);
                }
                TerminalCommand::Select { id, reply } => {
                    let result = self.carts.select(&id).await;
                    self.after_mutation(result.is_ok());
                    let _ = reply.send(result);
                }
                TerminalCommand::Rename { id, name, reply } => {
                    let result = self.carts.rename(&id, &name).await;
                    self.after_mutation(result.is_ok());
                    let _ = reply.send(result);
                }
                TerminalCommand::Clear { id, reply } => {
                    let result = self.carts.clear(&id).await;
                    self.after_mutation(result.is_ok());
                    let _ = reply.send(result);
                }
                TerminalCommand::List { reply } => {
                    let _ = reply.send(CartsOverview {
                        carts: self.carts.carts().to_vec(),
                        active_id: self.carts.active_id().to_string(),
                    });
                }
                TerminalCommand::Get { id, reply } => {
                    let _ = reply.send(self.carts.get(&id).cloned());
                }
            }
        }

        drop(subscriptions);
        info!("Terminal service stopped");
    }

    /// Routes one scan and publishes the acknowledgement.
    async fn route(&mut self, event: ScanEvent) -> ScanAck {
        let ack = self.router.route(&mut self.carts, &event).await;

        self.emitter.emit_scan_ack(&ack);
        self.after_mutation(ack.status == AckStatus::Ok);

        if let Err(e) = self
            .channel
            .broadcast(SCAN_TOPIC, &ChannelEvent::ScanAck(ack.clone()))
        {
            warn!(device = %ack.device, code = %ack.code, error = %e, "Scan ack broadcast failed");
        }
        ack
    }

    fn announce(&self) {
        if let Err(e) = self.carts.announce() {
            warn!(error = %e, "Cart announcement failed");
        }
    }

    fn after_mutation(&mut self, changed: bool) {
        if changed {
            self.emitter
                .emit_carts_changed(&self.carts.list(), self.carts.active_id());
        }
        for failure in self.carts.take_persist_failures() {
            self.emitter.emit_error(&failure);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{EVENT_CART_SYNC, EVENT_SCAN_ACK};
    use crate::router::StaticCatalog;
    use crate::transport::{Broker, MemoryConnector, TransportConfig};
    use std::sync::Mutex;
    use std::time::Duration;
    use tally_core::{CatalogProduct, Money};
    use tally_db::{Database, DbConfig};

    const WAIT: Duration = Duration::from_secs(2);

    #[derive(Default)]
    struct RecordingEmitter {
        acks: Mutex<Vec<ScanAck>>,
        changes: Mutex<usize>,
    }

    impl TerminalEventEmitter for RecordingEmitter {
        fn emit_scan_ack(&self, ack: &ScanAck) {
            self.acks.lock().unwrap().push(ack.clone());
        }
        fn emit_carts_changed(&self, _carts: &[CartSummary], _active_id: &str) {
            *self.changes.lock().unwrap() += 1;
        }
        fn emit_error(&self, _message: &str) {}
    }

    fn catalog() -> StaticCatalog {
        StaticCatalog::new().with_product(CatalogProduct::new(
            "p-1042",
            "1042",
            "Widget",
            Money::from_cents(1000),
        ))
    }

    async fn start(
        connector: &MemoryConnector,
        emitter: Arc<dyn TerminalEventEmitter>,
    ) -> TerminalHandle {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let channel = ChannelClient::spawn(connector.clone(), TransportConfig::labeled("terminal"));
        let carts = CartRegistry::load(&db, Some(channel.clone()), "Mostrador")
            .await
            .unwrap();
        channel.wait_connected(WAIT).await.unwrap();
        TerminalService::with_emitter(carts, ScanRouter::new(catalog()), channel, emitter).start()
    }

    #[tokio::test]
    async fn test_admin_commands() {
        let connector = MemoryConnector::new(Broker::new());
        let terminal = start(&connector, Arc::new(NoOpEmitter)).await;

        let mesa = terminal.create_cart("Mesa 2").await.unwrap();
        terminal.select_cart(&mesa.id).await.unwrap();
        terminal.rename_cart(&mesa.id, "Mesa 3").await.unwrap();

        let overview = terminal.carts().await.unwrap();
        assert_eq!(overview.carts.len(), 2);
        assert_eq!(overview.active_id, mesa.id);
        assert_eq!(terminal.cart(&mesa.id).await.unwrap().unwrap().name, "Mesa 3");

        assert!(terminal.select_cart("cart-99").await.is_err());

        terminal.shutdown().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(
            terminal.carts().await,
            Err(SyncError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_local_scan_is_acked_and_emitted() {
        let connector = MemoryConnector::new(Broker::new());
        let emitter = Arc::new(RecordingEmitter::default());
        let terminal = start(&connector, emitter.clone()).await;

        let ack = terminal
            .scan(ScanEvent::new("1042", "Counter", 1))
            .await
            .unwrap();
        assert_eq!(ack.status, AckStatus::Ok);

        let overview = terminal.carts().await.unwrap();
        assert_eq!(overview.carts[0].items[0].quantity, 1);
        assert_eq!(emitter.acks.lock().unwrap().len(), 1);
        assert_eq!(*emitter.changes.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_remote_scan_and_request_carts() {
        let connector = MemoryConnector::new(Broker::new());
        let _terminal = start(&connector, Arc::new(NoOpEmitter)).await;

        let phone = ChannelClient::spawn(connector.clone(), TransportConfig::labeled("phone"));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let acks = tx.clone();
        let _acks = phone.subscribe(SCAN_TOPIC, EVENT_SCAN_ACK, move |e| {
            let _ = acks.send(e.clone());
        });
        let _carts = phone.subscribe(SCAN_TOPIC, EVENT_CART_SYNC, move |e| {
            let _ = tx.send(e.clone());
        });
        phone.wait_connected(WAIT).await.unwrap();

        phone
            .broadcast(SCAN_TOPIC, &ChannelEvent::RequestCarts)
            .unwrap();
        match tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap() {
            ChannelEvent::CartSync(sync) => assert_eq!(sync.carts[0].name, "Mostrador"),
            other => panic!("expected cart-sync, got {:?}", other),
        }

        phone
            .broadcast(
                SCAN_TOPIC,
                &ChannelEvent::RemoteScan(ScanEvent::new("9999", "Phone A", 1)),
            )
            .unwrap();
        match tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap() {
            ChannelEvent::ScanAck(ack) => {
                assert_eq!(ack.status, AckStatus::NotFound);
                assert_eq!(ack.device, "Phone A");
            }
            other => panic!("expected scan-ack, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_scan_burst_from_several_phones_is_fully_applied() {
        let connector = MemoryConnector::new(Broker::new());
        let terminal = start(&connector, Arc::new(NoOpEmitter)).await;

        let mut phones = Vec::new();
        for i in 0..4 {
            let phone = ChannelClient::spawn(
                connector.clone(),
                TransportConfig::labeled(format!("phone-{}", i)),
            );
            phone.wait_connected(WAIT).await.unwrap();
            phones.push(phone);
        }

        let mut sent = 0;
        for _ in 0..200 {
            for (i, phone) in phones.iter().enumerate() {
                let scan = ScanEvent::new("1042", &format!("Phone {}", i), 1);
                phone
                    .broadcast(SCAN_TOPIC, &ChannelEvent::RemoteScan(scan))
                    .unwrap();
                sent += 1;
            }
            tokio::task::yield_now().await;
        }

        let applied = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let overview = terminal.carts().await.unwrap();
                let applied: i64 = overview.carts[0].items.iter().map(|l| l.quantity).sum();
                if applied >= sent {
                    return applied;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(applied, 800);
    }
}
