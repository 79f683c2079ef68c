//! Line-oriented operator console on stdin
//!
//! Drives the user-facing protocol commands: announcing a trade, confirming
//! fiat receipt, reporting the settlement broadcast and cancelling. Closing
//! stdin (or `quit`) ends the loop, which the daemon treats as a shutdown
//! request.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::error;

use trade_protocol::chain::ChainLookup;
use trade_protocol::channel::PeerChannel;
use trade_protocol::record::TradeRecord;
use trade_protocol::{PeerId, ProtocolService, TradeId, TradeRole};

pub async fn run<C, P>(service: Arc<ProtocolService<C, P>>)
where
    C: ChainLookup + 'static,
    P: PeerChannel + 'static,
{
    println!("Trade console ready. Type 'help' for commands.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("Failed to read stdin: {}", e);
                break;
            }
        };
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some((&command, args)) = parts.split_first() else {
            continue;
        };
        match command {
            "help" => print_help(),
            "quit" | "exit" => break,
            "list" => {
                let trades = service.list_trades().await;
                if trades.is_empty() {
                    println!("No trades.");
                }
                for record in &trades {
                    print_summary(record);
                }
            }
            "show" => match args {
                [trade_id] => match service.get_trade(&TradeId::from(*trade_id)).await {
                    Ok(record) => print_record(&record),
                    Err(e) => println!("Error: {}", e),
                },
                _ => println!("Usage: show <trade-id>"),
            },
            "start" => run_start(&service, args).await,
            "confirm" => match args {
                [trade_id] => report(service.confirm_fiat_received(&TradeId::from(*trade_id)).await),
                _ => println!("Usage: confirm <trade-id>"),
            },
            "broadcast" => match args {
                [trade_id, tx_id, address] => report(
                    service
                        .broadcast_settlement(
                            &TradeId::from(*trade_id),
                            tx_id.to_string(),
                            address.to_string(),
                        )
                        .await,
                ),
                _ => println!("Usage: broadcast <trade-id> <tx-id> <address>"),
            },
            "cancel" => match args {
                [trade_id] => report(service.cancel_trade(&TradeId::from(*trade_id)).await),
                _ => println!("Usage: cancel <trade-id>"),
            },
            other => println!("Unknown command '{}'. Type 'help'.", other),
        }
    }
}

async fn run_start<C, P>(service: &ProtocolService<C, P>, args: &[&str])
where
    C: ChainLookup + 'static,
    P: PeerChannel + 'static,
{
    let (trade_id, role, peer, payment_reference, settlement_address) = match parse_start(args) {
        Ok(parsed) => parsed,
        Err(message) => {
            println!("{}", message);
            return;
        }
    };
    report(
        service
            .start_trade(trade_id, role, peer, payment_reference, settlement_address)
            .await,
    );
}

type StartArgs = (TradeId, TradeRole, PeerId, Option<String>, Option<String>);

/// `start [trade-id] buyer <peer> <settlement-address>`
/// `start [trade-id] seller <peer> <payment-reference...>`
///
/// The trade id is optional for the initiating side: when the first argument
/// is a role name, a fresh id is generated and shown, and the counterparty
/// starts its side with that id.
fn parse_start(args: &[&str]) -> Result<StartArgs, String> {
    const USAGE: &str = "Usage: start [trade-id] <buyer|seller> <peer-id> <address|payment-ref>";
    let (trade_id, rest) = match args.first() {
        Some(&"buyer") | Some(&"seller") => (TradeId::new(), args),
        Some(id) => (TradeId::from(*id), &args[1..]),
        None => return Err(USAGE.to_string()),
    };
    let (role, peer, detail) = match rest {
        [role, peer, detail @ ..] if !detail.is_empty() => (*role, *peer, detail.join(" ")),
        _ => return Err(USAGE.to_string()),
    };
    let (role, payment_reference, settlement_address) = match role {
        "buyer" => (TradeRole::Buyer, None, Some(detail)),
        "seller" => (TradeRole::Seller, Some(detail), None),
        other => return Err(format!("Role must be 'buyer' or 'seller', got '{}'", other)),
    };
    Ok((trade_id, role, PeerId::from(peer), payment_reference, settlement_address))
}

fn report(result: Result<TradeRecord, trade_protocol::TradeError>) {
    match result {
        Ok(record) => print_summary(&record),
        Err(e) => println!("Error: {}", e),
    }
}

fn print_summary(record: &TradeRecord) {
    println!(
        "{}  {:?}  {:?}  v{}  peer={}",
        record.trade_id, record.state, record.role, record.version, record.counterparty_id
    );
}

fn print_record(record: &TradeRecord) {
    println!("Trade:           {}", record.trade_id);
    println!("State:           {:?}", record.state);
    println!("Role:            {:?}", record.role);
    println!("Counterparty:    {}", record.counterparty_id);
    println!("Version:         {}", record.version);
    println!(
        "Payment ref:     {}",
        record.payment_reference.as_deref().unwrap_or("-")
    );
    println!(
        "Settlement addr: {}",
        record.settlement_address.as_deref().unwrap_or("-")
    );
    println!(
        "Settlement tx:   {}",
        record.settlement_tx_id.as_deref().unwrap_or("-")
    );
    match record.confirmed_amount {
        Some(amount) => println!("Confirmed amt:   {}", amount),
        None => println!("Confirmed amt:   -"),
    }
    println!("Created:         {}", record.created_at.to_rfc3339());
    println!("Updated:         {}", record.last_updated_at.to_rfc3339());
}

fn print_help() {
    println!("Commands:");
    println!("  start [trade-id] buyer <peer-id> <settlement-address>");
    println!("  start [trade-id] seller <peer-id> <payment-reference>");
    println!("      omit the trade id to generate one; the counterparty reuses it");
    println!("  confirm <trade-id>                 mark fiat as received (seller)");
    println!("  broadcast <trade-id> <tx> <addr>   report the settlement broadcast (seller)");
    println!("  cancel <trade-id>");
    println!("  show <trade-id>");
    println!("  list");
    println!("  quit");
}
