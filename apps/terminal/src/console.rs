//! Line-oriented admin console on stdin.
//!
//! ```text
//! devices                          list paired devices
//! approve|block|unblock|remove ID  change a device
//! carts                            list carts (* = active)
//! cart ID                          show a cart's lines
//! new NAME                         create a cart
//! select|clear|delete ID           act on a cart
//! rename ID NAME                   rename a cart
//! scan CODE [QTY] [CART]           scan at the terminal itself
//! product ID CODE CENTS NAME       add or update a catalog product
//! products                         list the catalog
//! quit
//! ```

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use tally_core::{CatalogProduct, DeviceAction, Money, ScanEvent};
use tally_db::ProductRepository;
use tally_sync::{PairingRegistry, SyncError, SyncResult, TerminalHandle};

/// Name used for scans typed at the terminal.
const LOCAL_DEVICE: &str = "terminal";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Help,
    Devices,
    Device(DeviceAction, String),
    RemoveDevice(String),
    Carts,
    Cart(String),
    NewCart(String),
    Select(String),
    Clear(String),
    Delete(String),
    Rename(String, String),
    Scan {
        code: String,
        quantity: i64,
        cart_id: Option<String>,
    },
    Product {
        id: String,
        code: String,
        price: Money,
        name: String,
    },
    Products,
    Quit,
}

fn parse(line: &str) -> Result<Option<Command>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let args: Vec<&str> = words.collect();

    let arg = |i: usize| -> Result<String, String> {
        args.get(i)
            .map(|s| s.to_string())
            .ok_or_else(|| format!("{}: missing argument {}", verb, i + 1))
    };
    let rest = |from: usize| -> Result<String, String> {
        if args.len() <= from {
            return Err(format!("{}: missing name", verb));
        }
        Ok(args[from..].join(" "))
    };

    let command = match verb {
        "help" | "?" => Command::Help,
        "devices" => Command::Devices,
        "approve" => Command::Device(DeviceAction::Approve, arg(0)?),
        "block" => Command::Device(DeviceAction::Block, arg(0)?),
        "unblock" => Command::Device(DeviceAction::Unblock, arg(0)?),
        "remove" => Command::RemoveDevice(arg(0)?),
        "carts" => Command::Carts,
        "cart" => Command::Cart(arg(0)?),
        "new" => Command::NewCart(rest(0)?),
        "select" => Command::Select(arg(0)?),
        "clear" => Command::Clear(arg(0)?),
        "delete" => Command::Delete(arg(0)?),
        "rename" => Command::Rename(arg(0)?, rest(1)?),
        "scan" => Command::Scan {
            code: arg(0)?,
            quantity: match args.get(1) {
                Some(q) => q.parse().map_err(|_| format!("scan: bad quantity '{}'", q))?,
                None => 1,
            },
            cart_id: args.get(2).map(|s| s.to_string()),
        },
        "product" => Command::Product {
            id: arg(0)?,
            code: arg(1)?,
            price: arg(2)?
                .parse()
                .map(Money::from_cents)
                .map_err(|_| "product: price must be in cents".to_string())?,
            name: rest(3)?,
        },
        "products" => Command::Products,
        "quit" | "exit" => Command::Quit,
        other => return Err(format!("unknown command '{}' (try help)", other)),
    };
    Ok(Some(command))
}

/// Reads commands until `quit` or end of input.
pub async fn run(
    terminal: TerminalHandle,
    registry: PairingRegistry,
    products: ProductRepository,
) -> SyncResult<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("Tally terminal ready. Type 'help' for commands.");

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| SyncError::Internal(format!("stdin: {}", e)))?
    {
        let command = match parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(message) => {
                println!("{}", message);
                continue;
            }
        };

        if command == Command::Quit {
            info!("Console quit");
            break;
        }
        if let Err(e) = execute(command, &terminal, &registry, &products).await {
            println!("error: {}", e);
        }
    }
    Ok(())
}

async fn execute(
    command: Command,
    terminal: &TerminalHandle,
    registry: &PairingRegistry,
    products: &ProductRepository,
) -> SyncResult<()> {
    match command {
        Command::Help => println!("{}", HELP),
        Command::Devices => {
            for device in registry.list().await? {
                println!(
                    "{}  {:<10} {}  (last seen {})",
                    device.device_id,
                    device.status.to_string(),
                    device.name,
                    device.last_active.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        Command::Device(action, id) => {
            let device = registry.apply(&id, action).await?;
            println!("{} is now {}", device.name, device.status);
        }
        Command::RemoveDevice(id) => {
            registry.delete(&id).await?;
            println!("removed {}", id);
        }
        Command::Carts => {
            let overview = terminal.carts().await?;
            for cart in &overview.carts {
                let marker = if cart.id == overview.active_id { '*' } else { ' ' };
                println!("{} {}  {} ({} lines)", marker, cart.id, cart.name, cart.items.len());
            }
        }
        Command::Cart(id) => match terminal.cart(&id).await? {
            Some(cart) => {
                println!("{} {}", cart.id, cart.name);
                for line in &cart.items {
                    println!(
                        "  {:>3} x {:<24} {:>10}",
                        line.quantity, line.product_name, line.unit_price
                    );
                }
            }
            None => println!("no cart {}", id),
        },
        Command::NewCart(name) => {
            let cart = terminal.create_cart(&name).await?;
            println!("created {} {}", cart.id, cart.name);
        }
        Command::Select(id) => terminal.select_cart(&id).await?,
        Command::Clear(id) => terminal.clear_cart(&id).await?,
        Command::Delete(id) => {
            let cart = terminal.delete_cart(&id).await?;
            println!("deleted {} ({} lines)", cart.name, cart.items.len());
        }
        Command::Rename(id, name) => {
            terminal.rename_cart(&id, &name).await?;
        }
        Command::Scan {
            code,
            quantity,
            cart_id,
        } => {
            let mut event = ScanEvent::new(&code, LOCAL_DEVICE, quantity);
            event.cart_id = cart_id;
            let ack = terminal.scan(event).await?;
            println!("{}: {}", ack.status, ack.message);
        }
        Command::Product {
            id,
            code,
            price,
            name,
        } => {
            products
                .upsert(&CatalogProduct::new(id, code, name, price), None)
                .await?;
        }
        Command::Products => {
            for product in products.list().await? {
                println!(
                    "{}  {:<12} {:<24} {:>10}",
                    product.id, product.code, product.name, product.price
                );
            }
        }
        Command::Quit => {}
    }
    Ok(())
}

const HELP: &str = "\
devices | approve ID | block ID | unblock ID | remove ID
carts | cart ID | new NAME | select ID | rename ID NAME | clear ID | delete ID
scan CODE [QTY] [CART] | product ID CODE CENTS NAME | products | quit";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device_commands() {
        assert_eq!(
            parse("approve d-1").unwrap(),
            Some(Command::Device(DeviceAction::Approve, "d-1".into()))
        );
        assert!(parse("block").is_err());
        assert_eq!(parse("   ").unwrap(), None);
    }

    #[test]
    fn test_parse_multiword_names() {
        assert_eq!(
            parse("new Mesa 2").unwrap(),
            Some(Command::NewCart("Mesa 2".into()))
        );
        assert_eq!(
            parse("rename cart-2 Mesa del fondo").unwrap(),
            Some(Command::Rename("cart-2".into(), "Mesa del fondo".into()))
        );
    }

    #[test]
    fn test_parse_scan() {
        assert_eq!(
            parse("scan 1042").unwrap(),
            Some(Command::Scan {
                code: "1042".into(),
                quantity: 1,
                cart_id: None
            })
        );
        assert_eq!(
            parse("scan 1042 3 cart-2").unwrap(),
            Some(Command::Scan {
                code: "1042".into(),
                quantity: 3,
                cart_id: Some("cart-2".into())
            })
        );
        assert!(parse("scan 1042 many").is_err());
    }

    #[test]
    fn test_parse_product() {
        assert_eq!(
            parse("product p-1042 1042 1000 Widget grande").unwrap(),
            Some(Command::Product {
                id: "p-1042".into(),
                code: "1042".into(),
                price: Money::from_cents(1000),
                name: "Widget grande".into(),
            })
        );
        assert!(parse("product p-1 1 ten Widget").is_err());
        assert!(parse("launch").is_err());
    }
}
