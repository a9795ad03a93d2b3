//! # Tally POS Scanner
//!
//! Headless scanner client. Each stdin line is one decoded code:
//!
//! ```text
//! 1042              scan 1042, quantity 1, terminal's active cart
//! 1042 3            quantity 3
//! 1042 3 cart-2     quantity 3 into cart-2
//! test              connectivity test
//! carts             carts advertised by the terminal
//! status            current pairing / scan state
//! retry             send the scan held in review again
//! discard           drop the scan held in review
//! quit
//! ```
//!
//! A scan that could not be sent stays in review. New codes are refused
//! until it is retried or discarded.
//!
//! The identity is kept in scanner.toml, so restarting resumes the same
//! device instead of registering a new one.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use tally_sync::{
    ChannelClient, ConfigIdentity, HttpPairingClient, MobileScanner, ScanPhase, ScannerConfig,
    ScannerState, SyncError, SyncResult, TokioClock, WsConnector,
};

type Scanner = MobileScanner<HttpPairingClient, TokioClock>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    // Optional first argument: path to scanner.toml
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = ScannerConfig::load(config_path.clone())?;
    info!(name = %config.device.name, hub = %config.transport.hub_url, "Starting Tally POS scanner");

    let channel = ChannelClient::spawn(
        WsConnector::new(&config.transport.hub_url)?,
        config.transport.to_transport_config(&config.device.name),
    );
    let pairing = HttpPairingClient::new(&config.pairing.base_url)?;
    let identity = Arc::new(ConfigIdentity::new(config.clone(), config_path));

    let scanner = MobileScanner::new(
        &config.device.name,
        pairing,
        channel.clone(),
        identity,
        TokioClock,
    )
    .with_settle(config.transport.settle());

    if let Err(e) = scanner.start().await {
        warn!(error = %e, "Pairing failed; retrying on the next heartbeat");
    }

    let mut heartbeat = interval(config.heartbeat_interval());
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await;

    let mut states = scanner.state_watch();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match line.trim() {
                    "" => {}
                    "quit" | "exit" => break,
                    input => {
                        if let Err(e) = handle_line(&scanner, input).await {
                            println!("error: {}", e);
                        }
                    }
                }
            }

            _ = heartbeat.tick() => {
                let result = match scanner.state() {
                    ScannerState::Init | ScannerState::Unregistered => {
                        scanner.start().await.map(|_| ())
                    }
                    _ => scanner.heartbeat().await.map(|_| ()),
                };
                if let Err(e) = result {
                    warn!(error = %e, "Heartbeat failed");
                }
            }

            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                print_state(&state);
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    scanner.close();
    let _ = channel.shutdown().await;
    info!("Scanner shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tally=debug"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_max_level(Level::TRACE)
        .init();
}

/// One line of operator input.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Input {
    Test,
    Carts,
    Status,
    Retry,
    Discard,
    Scan {
        code: String,
        quantity: Option<i64>,
        target: Option<String>,
    },
}

fn parse(input: &str) -> Result<Input, String> {
    let input = match input {
        "test" => Input::Test,
        "carts" => Input::Carts,
        "status" => Input::Status,
        "retry" => Input::Retry,
        "discard" => Input::Discard,
        _ => {
            let mut words = input.split_whitespace();
            let code = words.next().ok_or("empty scan")?.to_string();
            let quantity = words
                .next()
                .map(str::parse::<i64>)
                .transpose()
                .map_err(|_| format!("bad quantity in '{}'", input))?;
            Input::Scan {
                code,
                quantity,
                target: words.next().map(str::to_string),
            }
        }
    };
    Ok(input)
}

async fn handle_line(scanner: &Scanner, input: &str) -> SyncResult<()> {
    let input = parse(input).map_err(SyncError::InvalidMessage)?;

    match input {
        Input::Test => {
            scanner.test_connection().await?;
            println!("test sent");
        }
        Input::Carts => {
            for cart in scanner.carts() {
                println!("{}  {}", cart.id, cart.name);
            }
        }
        Input::Status => print_state(&scanner.state()),
        Input::Retry => scanner.send().await?,
        Input::Discard => {
            scanner.cancel_review()?;
            println!("discarded");
        }
        Input::Scan {
            code,
            quantity,
            target,
        } => {
            if let Some(held) = scanner.state().review() {
                println!(
                    "{} x{} is still waiting; 'retry' or 'discard' it first",
                    held.code, held.quantity
                );
                return Ok(());
            }
            if !scanner.decode(&code)? {
                println!("busy; scan ignored");
                return Ok(());
            }
            if let Some(quantity) = quantity {
                scanner.set_quantity(quantity)?;
            }
            if target.is_some() {
                scanner.set_target(target.as_deref())?;
            }
            scanner.send().await?;
        }
    }
    Ok(())
}

fn print_state(state: &ScannerState) {
    match state {
        ScannerState::Approved(ScanPhase::Success { ack: Some(ack), .. }) => {
            println!("[{}] {}", ack.status, ack.message);
        }
        ScannerState::Approved(ScanPhase::Review {
            scan,
            error: Some(error),
        }) => {
            println!("[not sent] {} x{}: {}", scan.code, scan.quantity, error);
        }
        other => println!("[{}]", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scan_lines() {
        assert_eq!(
            parse("1042").unwrap(),
            Input::Scan {
                code: "1042".into(),
                quantity: None,
                target: None,
            }
        );
        assert_eq!(
            parse("1042 3 cart-2").unwrap(),
            Input::Scan {
                code: "1042".into(),
                quantity: Some(3),
                target: Some("cart-2".into()),
            }
        );
        assert!(parse("1042 many").is_err());
    }

    #[test]
    fn test_parse_review_commands() {
        assert_eq!(parse("retry").unwrap(), Input::Retry);
        assert_eq!(parse("discard").unwrap(), Input::Discard);
        assert_eq!(parse("status").unwrap(), Input::Status);
    }
}
