//! Trade daemon: P2P fiat/crypto trade coordination
//!
//! Wires the protocol service up to real infrastructure: a file-backed trade
//! store, a mempool-style block explorer and a TCP line transport, plus an
//! operator console on stdin. Shuts down cleanly on Ctrl-C or `quit`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use trade_protocol::explorer::ExplorerClient;
use trade_protocol::store::FileTradeStore;
use trade_protocol::ProtocolService;

mod config;
mod console;
mod transport;

use config::DaemonConfig;
use transport::TcpPeerChannel;

#[derive(Parser)]
#[command(name = "trade-daemon")]
#[command(about = "Decentralized fiat/crypto trade daemon")]
struct Cli {
    /// Path to daemon configuration file
    #[arg(short, long, default_value = "trade.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Run without the stdin console (service mode)
    #[arg(long)]
    no_console: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    trade_protocol::logging::init_logging(
        cli.verbose,
        &["trade_daemon", "trade_protocol"],
        "trade-daemon",
    );

    let config = DaemonConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config from {:?}", cli.config))?;
    info!("Starting trade daemon");
    info!("Party ID: {}", config.party_id);
    info!("Data dir: {}", config.protocol.data_dir.display());
    info!("Explorer: {}", config.explorer_url);

    let store = Arc::new(
        FileTradeStore::open(&config.protocol.data_dir).context("Failed to open trade store")?,
    );
    let chain = Arc::new(
        ExplorerClient::new(&config.explorer_url).context("Failed to create explorer client")?,
    );
    let channel = Arc::new(TcpPeerChannel::new(config.peers.clone()));

    let service = ProtocolService::new(&config.protocol, store, chain, channel);
    service
        .initialize()
        .await
        .context("Failed to initialize protocol service")?;

    let listener = {
        let service = Arc::clone(&service);
        let listen_addr = config.listen_addr.clone();
        tokio::spawn(async move {
            if let Err(e) = transport::serve(&listen_addr, service).await {
                error!("Transport failed: {}", e);
            }
        })
    };

    if cli.no_console {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
        info!("Ctrl-C received, shutting down");
    } else {
        let console = console::run(Arc::clone(&service));
        tokio::select! {
            _ = console => info!("Console closed, shutting down"),
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                info!("Ctrl-C received, shutting down");
            }
        }
    }

    listener.abort();
    service.shutdown().await;
    Ok(())
}
