//! Durable trade record
//!
//! One `TradeRecord` is the persisted, versioned state of one trade. It is
//! mutated exclusively by the owning state machine and written on every
//! successful transition. Terminal records are retired, never deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{PeerId, TradeId, TradeRole, TradeState};

/// Persisted state of one trade
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeRecord {
    /// Immutable, globally unique
    pub trade_id: TradeId,
    pub role: TradeRole,
    pub counterparty_id: PeerId,
    pub state: TradeState,
    /// Opaque fiat-payment identifier, set once known
    pub payment_reference: Option<String>,
    /// Destination address for the on-chain settlement, set once known
    pub settlement_address: Option<String>,
    /// Set once the settling party has broadcast; immutable afterwards
    pub settlement_tx_id: Option<String>,
    /// Output amount observed at the settlement address on confirmation
    pub confirmed_amount: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    /// Strictly increases with every persisted mutation; doubles as the
    /// optimistic-concurrency write guard
    pub version: u64,
}

impl TradeRecord {
    /// Create a fresh record in `Initiated` at version 0.
    ///
    /// `payment_reference` is the seller's own fiat reference;
    /// `settlement_address` is the buyer's own receive address. Each side
    /// supplies only the field it owns and learns the other from the
    /// counterparty's payment info message.
    pub fn new(
        trade_id: TradeId,
        role: TradeRole,
        counterparty_id: PeerId,
        payment_reference: Option<String>,
        settlement_address: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            trade_id,
            role,
            counterparty_id,
            state: TradeState::Initiated,
            payment_reference,
            settlement_address,
            settlement_tx_id: None,
            confirmed_amount: None,
            created_at: now,
            last_updated_at: now,
            version: 0,
        }
    }

    /// Whether this record is retired (no longer accepts transitions)
    pub fn is_retired(&self) -> bool {
        self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_record_defaults() {
        let record = TradeRecord::new(
            TradeId::from("t-1"),
            TradeRole::Seller,
            PeerId::from("peer-a"),
            Some("SEPA-123".to_string()),
            None,
        );
        assert_eq!(record.state, TradeState::Initiated);
        assert_eq!(record.version, 0);
        assert!(record.settlement_tx_id.is_none());
        assert!(record.confirmed_amount.is_none());
        assert!(!record.is_retired());
        assert_eq!(record.created_at, record.last_updated_at);
    }

    #[test]
    fn test_record_json_roundtrip() {
        let mut record = TradeRecord::new(
            TradeId::from("t-2"),
            TradeRole::Buyer,
            PeerId::from("peer-b"),
            None,
            Some("addr1".to_string()),
        );
        record.state = TradeState::SettlementBroadcast;
        record.settlement_tx_id = Some("txid-1".to_string());
        record.version = 4;

        let json = serde_json::to_string(&record).unwrap();
        let back: TradeRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
