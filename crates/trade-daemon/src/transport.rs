//! TCP transport: newline-delimited JSON protocol messages
//!
//! Outbound sends open a short-lived connection per message; the P2P layer
//! underneath a production deployment would hold sessions, but one message
//! per connection keeps the framing trivial and restarts painless. Inbound
//! connections are read line by line and fed to the protocol service.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use trade_protocol::chain::ChainLookup;
use trade_protocol::channel::PeerChannel;
use trade_protocol::error::DeliveryFailure;
use trade_protocol::types::ProtocolMessage;
use trade_protocol::{PeerId, ProtocolService};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const SEND_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Address-book backed channel: one connect-write-close per message with a
/// few quick retries. Anything still undeliverable is reported upward and
/// recovered by the peer protocol's redelivery.
pub struct TcpPeerChannel {
    peers: HashMap<PeerId, String>,
}

impl TcpPeerChannel {
    pub fn new(peers: HashMap<String, String>) -> Self {
        Self {
            peers: peers
                .into_iter()
                .map(|(id, addr)| (PeerId::from(id.as_str()), addr))
                .collect(),
        }
    }
}

#[async_trait]
impl PeerChannel for TcpPeerChannel {
    async fn send(&self, peer: &PeerId, message: ProtocolMessage) -> Result<(), DeliveryFailure> {
        let addr = self.peers.get(peer).ok_or_else(|| DeliveryFailure {
            peer: peer.clone(),
            reason: "no known address".to_string(),
        })?;
        let mut line = serde_json::to_string(&message).map_err(|e| DeliveryFailure {
            peer: peer.clone(),
            reason: format!("encode failed: {}", e),
        })?;
        line.push('\n');

        let mut last_error = String::new();
        for attempt in 1..=SEND_ATTEMPTS {
            match write_once(addr, line.as_bytes()).await {
                Ok(()) => {
                    debug!("Delivered {} message to {} ({})", message.body.kind(), peer, addr);
                    return Ok(());
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt < SEND_ATTEMPTS {
                        debug!("Send to {} failed ({}), retrying", addr, last_error);
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        }
        Err(DeliveryFailure {
            peer: peer.clone(),
            reason: last_error,
        })
    }
}

async fn write_once(addr: &str, line: &[u8]) -> std::io::Result<()> {
    let mut stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out")
        })??;
    stream.write_all(line).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Accept inbound connections and feed each JSON line to the service.
/// Malformed lines and protocol-level rejections are logged and skipped;
/// an inbound peer can never crash the daemon.
pub async fn serve<C, P>(listen_addr: &str, service: Arc<ProtocolService<C, P>>) -> Result<()>
where
    C: ChainLookup + 'static,
    P: PeerChannel + 'static,
{
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", listen_addr))?;
    info!("Listening for peers on {}", listen_addr);

    loop {
        let (stream, remote) = listener.accept().await.context("Accept failed")?;
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<ProtocolMessage>(line) {
                            Ok(message) => {
                                if let Err(e) = service.on_peer_message(message).await {
                                    warn!("Inbound message from {} rejected: {}", remote, e);
                                }
                            }
                            Err(e) => {
                                warn!("Malformed message from {}: {}", remote, e);
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!("Connection from {} dropped: {}", remote, e);
                        break;
                    }
                }
            }
        });
    }
}
