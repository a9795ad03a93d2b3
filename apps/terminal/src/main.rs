//! # Tally POS Terminal
//!
//! Hosts the channel for the shop's scanners and owns the carts.
//!
//! ## Startup Sequence
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Terminal Startup                                  │
//! │                                                                         │
//! │  1. Initialize Logging ───────────────────────────────────────────────► │
//! │     • tracing-subscriber with env filter (RUST_LOG)                     │
//! │                                                                         │
//! │  2. Load terminal.toml ───────────────────────────────────────────────► │
//! │     • defaults → file → TALLY_* env → validate                          │
//! │                                                                         │
//! │  3. Open Database ────────────────────────────────────────────────────► │
//! │     • SQLite with WAL mode, pending migrations applied                  │
//! │                                                                         │
//! │  4. Start Hub ────────────────────────────────────────────────────────► │
//! │     • Broker + /ws + /devices on the configured port                    │
//! │                                                                         │
//! │  5. Start Terminal Service ───────────────────────────────────────────► │
//! │     • Carts restored from the snapshot, router on the product table     │
//! │                                                                         │
//! │  6. Admin Console until `quit` or Ctrl+C                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

mod console;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use tally_core::{AckStatus, CartSummary, ScanAck};
use tally_db::{Database, DbConfig};
use tally_sync::{
    Broker, CartRegistry, ChannelClient, HubServer, HubState, MemoryConnector, PairingRegistry,
    ScanRouter, TerminalConfig, TerminalEventEmitter, TerminalService,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    info!("Starting Tally POS terminal");

    // Optional first argument: path to terminal.toml
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = TerminalConfig::load(config_path)?;

    if let Some(dir) = config.database.path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let db = Database::new(DbConfig::new(config.database.path.clone())).await?;
    info!(path = ?config.database.path, "Database connected and migrations applied");

    let broker = Broker::new();
    let channel = ChannelClient::spawn(
        MemoryConnector::new(broker.clone()),
        config.transport.to_transport_config("terminal"),
    );

    let registry = PairingRegistry::new(&db, Some(channel.clone()));
    let hub = HubServer::new(
        config.hub.clone(),
        HubState::new(broker, registry.clone()),
    )
    .start()
    .await?;
    info!(addr = %hub.local_addr(), "Hub listening for scanners");

    let carts = CartRegistry::load(
        &db,
        Some(channel.clone()),
        &config.terminal.default_cart_name,
    )
    .await?;
    let terminal = TerminalService::with_emitter(
        carts,
        ScanRouter::new(db.products()),
        channel.clone(),
        Arc::new(LogEmitter),
    )
    .start();

    tokio::select! {
        result = console::run(terminal.clone(), registry, db.products()) => {
            if let Err(e) = result {
                error!(error = %e, "Console stopped");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
        }
    }

    if let Err(e) = terminal.shutdown().await {
        warn!(error = %e, "Terminal service already stopped");
    }
    if let Err(e) = hub.shutdown().await {
        warn!(error = %e, "Hub already stopped");
    }
    let _ = channel.shutdown().await;
    db.close().await;

    info!("Terminal shutdown complete");
    Ok(())
}

/// Initializes the tracing subscriber for structured logging.
///
/// ## Log Levels
/// - `RUST_LOG=debug` - Show debug messages
/// - `RUST_LOG=tally=trace` - Show trace for tally crates only
/// - Default: INFO, DEBUG for tally crates
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tally=debug,sqlx=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_max_level(Level::TRACE)
        .init();
}

/// Stand-in for the terminal UI: notifications go to the log.
struct LogEmitter;

impl TerminalEventEmitter for LogEmitter {
    fn emit_scan_ack(&self, ack: &ScanAck) {
        match ack.status {
            AckStatus::Ok | AckStatus::Test => {
                info!(device = %ack.device, cart = ?ack.cart_name, "{}", ack.message)
            }
            AckStatus::NotFound | AckStatus::Rejected => {
                warn!(device = %ack.device, code = %ack.code, "{}", ack.message)
            }
        }
    }

    fn emit_carts_changed(&self, carts: &[CartSummary], active_id: &str) {
        info!(carts = carts.len(), active = %active_id, "Carts changed");
    }

    fn emit_error(&self, message: &str) {
        error!("{}", message);
    }
}
