//! Shared types for the trade protocol
//!
//! Identifiers, protocol states, wire messages, events and side effects.

use serde::{Deserialize, Serialize};

/// Opaque unique trade identifier, stable for the trade's lifetime
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TradeId(String);

impl TradeId {
    /// Generate a fresh random trade id
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TradeId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for TradeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for TradeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity handle of a peer on the network
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which side of the trade this node plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeRole {
    /// Pays fiat, receives crypto
    Buyer,
    /// Receives fiat, broadcasts the on-chain settlement
    Seller,
}

impl std::fmt::Display for TradeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradeRole::Buyer => write!(f, "buyer"),
            TradeRole::Seller => write!(f, "seller"),
        }
    }
}

/// Protocol state of a trade
///
/// The buyer path mirrors the seller path with role-swapped obligations:
/// only the seller passes through `FiatPaymentConfirmed`; the buyer moves to
/// `SettlementBroadcast` when the seller's broadcast notice arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeState {
    /// Trade created (offer taken), payment info not yet exchanged
    Initiated,
    /// Both sides know the fiat payment reference and settlement address
    PaymentInfoExchanged,
    /// Seller confirmed receipt of the fiat payment
    FiatPaymentConfirmed,
    /// Settlement transaction broadcast, awaiting chain confirmation
    SettlementBroadcast,
    /// Settlement confirmed on-chain — terminal
    Completed,
    /// Trade cancelled before settlement broadcast — terminal
    Cancelled,
}

impl TradeState {
    /// Terminal states accept no further events; their records are retired
    pub fn is_terminal(&self) -> bool {
        matches!(self, TradeState::Completed | TradeState::Cancelled)
    }
}

impl std::fmt::Display for TradeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradeState::Initiated => write!(f, "Initiated"),
            TradeState::PaymentInfoExchanged => write!(f, "PaymentInfoExchanged"),
            TradeState::FiatPaymentConfirmed => write!(f, "FiatPaymentConfirmed"),
            TradeState::SettlementBroadcast => write!(f, "SettlementBroadcast"),
            TradeState::Completed => write!(f, "Completed"),
            TradeState::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Typed body of a peer protocol message
///
/// One tagged union dispatched through a single handler keyed by kind — no
/// per-type listener wiring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageBody {
    /// Exchange of the fiat payment reference (seller) and the on-chain
    /// settlement address (buyer). Each side fills only the fields it owns.
    PaymentInfo {
        payment_reference: Option<String>,
        settlement_address: Option<String>,
    },
    /// Seller broadcast the settlement transaction
    SettlementBroadcastNotice { tx_id: String },
    /// Sender cancelled the trade
    Cancel,
}

impl MessageBody {
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::PaymentInfo { .. } => "PAYMENT_INFO",
            MessageBody::SettlementBroadcastNotice { .. } => "SETTLEMENT_BROADCAST_NOTICE",
            MessageBody::Cancel => "CANCEL",
        }
    }
}

/// A peer-addressed protocol message
///
/// Carries the sender's record version so the receiving state machine can
/// discard stale or duplicate deliveries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolMessage {
    pub trade_id: TradeId,
    pub version: u64,
    #[serde(flatten)]
    pub body: MessageBody,
}

/// One output of a looked-up transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub address: String,
    pub value: u64,
}

/// Result of a chain lookup for a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxLookup {
    pub tx_id: String,
    pub outputs: Vec<TxOutput>,
    pub confirmed: bool,
}

/// Event applied to a trade state machine
#[derive(Debug, Clone)]
pub enum TradeEvent {
    /// Inbound protocol message from the counterparty
    PeerMessage(ProtocolMessage),
    /// User confirmed receipt of the fiat payment (seller command)
    FiatReceiptConfirmed,
    /// User broadcast the settlement transaction (seller command)
    SettlementBroadcast { tx_id: String, address: String },
    /// A chain lookup for the settlement transaction resolved
    ChainLookup(TxLookup),
    /// User cancelled the trade
    Cancel,
}

impl TradeEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            TradeEvent::PeerMessage(m) => m.body.kind(),
            TradeEvent::FiatReceiptConfirmed => "FIAT_RECEIPT_CONFIRMED",
            TradeEvent::SettlementBroadcast { .. } => "SETTLEMENT_BROADCAST",
            TradeEvent::ChainLookup(_) => "CHAIN_LOOKUP_RESULT",
            TradeEvent::Cancel => "CANCEL",
        }
    }
}

/// Side effects a successful transition asks the service to execute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideEffect {
    /// Send a message to the counterparty
    Send(ProtocolMessage),
    /// Start confirmation polling for the settlement transaction
    StartPolling { tx_id: String },
    /// Stop confirmation polling (settlement confirmed)
    StopPolling,
}
