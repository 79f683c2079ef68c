//! Error taxonomy for the trade protocol
//!
//! Transition-level errors (`ProtocolViolation`, `UnknownTrade`) are returned
//! as typed results to the caller. Infrastructure errors (`LookupFailure`,
//! `DeliveryFailure`) are absorbed by the retry policies of the component
//! they belong to. `PersistenceFailure` is the only class that aborts an
//! in-progress command; the in-memory record is rolled back to the last
//! persisted version when it occurs.

use thiserror::Error;

use crate::types::{PeerId, TradeId, TradeState};

/// Errors surfaced to callers of the command surface and `apply`
#[derive(Debug, Error)]
pub enum TradeError {
    /// An event inapplicable to the current state: stale message, invalid
    /// command ordering, or an event for a retired trade. Never corrupts
    /// state.
    #[error("trade {trade_id}: {event} not applicable in state {state}")]
    ProtocolViolation {
        trade_id: TradeId,
        state: TradeState,
        event: String,
    },

    /// Command referenced a trade id that does not exist
    #[error("unknown trade {0}")]
    UnknownTrade(TradeId),

    /// Writing the trade record failed; the transition was not applied
    #[error("trade {trade_id}: persistence failed")]
    Persistence {
        trade_id: TradeId,
        #[source]
        source: PersistenceFailure,
    },
}

impl TradeError {
    pub fn violation(trade_id: &TradeId, state: TradeState, event: impl Into<String>) -> Self {
        TradeError::ProtocolViolation {
            trade_id: trade_id.clone(),
            state,
            event: event.into(),
        }
    }

    /// Whether this error is a local rejection rather than a fault
    pub fn is_violation(&self) -> bool {
        matches!(self, TradeError::ProtocolViolation { .. })
    }
}

/// Failure writing or reading a durable trade record
#[derive(Debug, Error)]
pub enum PersistenceFailure {
    /// Optimistic-concurrency guard: a write raced with another transition
    /// from the same starting version
    #[error("version conflict for trade {trade_id}: stored {stored}, attempted {attempted}")]
    VersionConflict {
        trade_id: TradeId,
        stored: u64,
        attempted: u64,
    },

    #[error("record encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Transient chain-inspection error: explorer outage, timeout, bad response.
/// Recovered locally via backoff retry; it never fails the trade.
#[derive(Debug, Error)]
#[error("chain lookup failed: {0}")]
pub struct LookupFailure(pub String);

/// Outbound peer message could not be sent. The transport retries delivery;
/// the state machine never blocks on delivery success.
#[derive(Debug, Error)]
#[error("delivery to {peer} failed: {reason}")]
pub struct DeliveryFailure {
    pub peer: PeerId,
    pub reason: String,
}
