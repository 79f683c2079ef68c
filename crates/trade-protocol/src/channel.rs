//! Peer channel abstraction
//!
//! The P2P transport is an external collaborator: it delivers authenticated,
//! peer-addressed messages at-least-once within a session, with no ordering
//! guarantee across channels. The service only needs `send`; inbound
//! messages are pushed into `ProtocolService::on_peer_message` by whatever
//! owns the transport (the daemon's TCP listener, or a test harness).

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::DeliveryFailure;
use crate::types::{PeerId, ProtocolMessage};

/// Outbound half of the network message channel
#[async_trait]
pub trait PeerChannel: Send + Sync {
    /// Send a protocol message to a peer identity. Delivery retries are the
    /// transport's concern; callers never block on delivery success.
    async fn send(&self, peer: &PeerId, message: ProtocolMessage) -> Result<(), DeliveryFailure>;
}

/// In-process loopback channel connecting peers within one process.
///
/// Used by the test harness to wire two services together; delivery is a
/// bounded-queue push to the registered receiver.
#[derive(Default)]
pub struct InProcessChannel {
    inboxes: Mutex<HashMap<PeerId, mpsc::UnboundedSender<ProtocolMessage>>>,
}

impl InProcessChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer and get its inbound message stream
    pub fn register(&self, peer: PeerId) -> mpsc::UnboundedReceiver<ProtocolMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.lock().expect("channel lock").insert(peer, tx);
        rx
    }
}

#[async_trait]
impl PeerChannel for InProcessChannel {
    async fn send(&self, peer: &PeerId, message: ProtocolMessage) -> Result<(), DeliveryFailure> {
        let sender = {
            let inboxes = self.inboxes.lock().expect("channel lock");
            inboxes.get(peer).cloned()
        };
        let sender = sender.ok_or_else(|| DeliveryFailure {
            peer: peer.clone(),
            reason: "peer not registered".to_string(),
        })?;
        sender.send(message).map_err(|_| DeliveryFailure {
            peer: peer.clone(),
            reason: "receiver dropped".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MessageBody, TradeId};

    #[tokio::test]
    async fn test_loopback_delivery() {
        let channel = InProcessChannel::new();
        let mut inbox = channel.register(PeerId::from("bob"));

        let msg = ProtocolMessage {
            trade_id: TradeId::from("t-1"),
            version: 1,
            body: MessageBody::Cancel,
        };
        channel.send(&PeerId::from("bob"), msg.clone()).await.unwrap();
        assert_eq!(inbox.recv().await.unwrap(), msg);
    }

    #[tokio::test]
    async fn test_unknown_peer_is_delivery_failure() {
        let channel = InProcessChannel::new();
        let msg = ProtocolMessage {
            trade_id: TradeId::from("t-1"),
            version: 0,
            body: MessageBody::Cancel,
        };
        let err = channel.send(&PeerId::from("nobody"), msg).await.unwrap_err();
        assert!(err.to_string().contains("not registered"));
    }
}
