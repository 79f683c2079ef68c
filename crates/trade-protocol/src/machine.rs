//! Per-trade state machine
//!
//! Owns one `TradeRecord`, validates events against the transition table and
//! applies transitions atomically: the staged record is persisted first, and
//! only a successful write commits it in memory, so a `PersistenceFailure`
//! leaves the machine at the last persisted version. Side effects (messages
//! to send, polling to start or stop) are returned to the service, never
//! executed here.
//!
//! Transition table (seller path; the buyer path mirrors it):
//!   Initiated            --PAYMENT_INFO-->              PaymentInfoExchanged
//!   PaymentInfoExchanged --FiatReceiptConfirmed-->      FiatPaymentConfirmed
//!   FiatPaymentConfirmed --SettlementBroadcast-->       SettlementBroadcast
//!   SettlementBroadcast  --ChainLookup(confirmed)-->    Completed
//! `Cancelled` is reachable from any non-terminal state until the settlement
//! transaction is broadcast; after broadcast, cancellation is rejected since
//! funds may already be in flight.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::error::TradeError;
use crate::record::TradeRecord;
use crate::store::TradeStore;
use crate::types::{
    MessageBody, ProtocolMessage, SideEffect, TradeEvent, TradeRole, TradeState,
};

/// Result of a successful `apply`
#[derive(Debug)]
pub struct Applied {
    /// Side effects for the service to execute
    pub effects: Vec<SideEffect>,
    /// Post-transition snapshot of the record
    pub snapshot: TradeRecord,
    /// False for accepted-but-neutral events (an unconfirmed chain lookup
    /// changes nothing; the poll loop just reschedules)
    pub transitioned: bool,
}

/// State machine owning one trade record
pub struct TradeStateMachine {
    record: TradeRecord,
    store: Arc<dyn TradeStore>,
}

impl TradeStateMachine {
    /// Wrap an already-persisted record (fresh at version 0, or rehydrated)
    pub fn new(record: TradeRecord, store: Arc<dyn TradeStore>) -> Self {
        Self { record, store }
    }

    pub fn current_state(&self) -> TradeState {
        self.record.state
    }

    pub fn record(&self) -> &TradeRecord {
        &self.record
    }

    /// The payment info message this side announces when the trade starts:
    /// the seller owns the fiat payment reference, the buyer the settlement
    /// address. Sent by the service right after trade creation.
    pub fn payment_info_message(&self) -> ProtocolMessage {
        ProtocolMessage {
            trade_id: self.record.trade_id.clone(),
            version: self.record.version,
            body: self.own_payment_info(&self.record),
        }
    }

    /// Validate and apply one event.
    ///
    /// Inapplicable events are rejected with `ProtocolViolation` and do not
    /// mutate the record. On success the state and version update together
    /// and the returned effects are ready to execute.
    pub fn apply(&mut self, event: TradeEvent) -> Result<Applied, TradeError> {
        if let TradeEvent::PeerMessage(message) = &event {
            if message.trade_id != self.record.trade_id {
                return Err(self.violation("message for different trade"));
            }
            // Redelivery tolerance: a message older than our record is a
            // duplicate or out-of-order copy, not a fault.
            if message.version < self.record.version {
                debug!(
                    "[{}] Dropping stale {} (message v{}, local v{})",
                    self.record.trade_id,
                    message.body.kind(),
                    message.version,
                    self.record.version
                );
                return Err(self.violation(format!("stale {}", message.body.kind())));
            }
        }

        let mut staged = self.record.clone();
        staged.version += 1;
        staged.last_updated_at = Utc::now();
        let mut effects: Vec<SideEffect> = Vec::new();

        match (self.record.state, &event) {
            (TradeState::Initiated, TradeEvent::PeerMessage(m)) => match &m.body {
                MessageBody::PaymentInfo {
                    payment_reference,
                    settlement_address,
                } => {
                    // Learn the counterparty-owned fields; ours stay as set
                    // at trade creation.
                    if staged.payment_reference.is_none() {
                        staged.payment_reference = payment_reference.clone();
                    }
                    if staged.settlement_address.is_none() {
                        staged.settlement_address = settlement_address.clone();
                    }
                    staged.state = TradeState::PaymentInfoExchanged;
                    // Reply with our own info so the counterparty can advance
                    // too; if it already has it, the duplicate is dropped.
                    effects.push(SideEffect::Send(ProtocolMessage {
                        trade_id: staged.trade_id.clone(),
                        version: staged.version,
                        body: self.own_payment_info(&staged),
                    }));
                }
                MessageBody::Cancel => staged.state = TradeState::Cancelled,
                _ => return Err(self.event_violation(&event)),
            },

            (TradeState::PaymentInfoExchanged, TradeEvent::PeerMessage(m)) => match &m.body {
                MessageBody::SettlementBroadcastNotice { tx_id }
                    if self.record.role == TradeRole::Buyer =>
                {
                    staged.settlement_tx_id = Some(tx_id.clone());
                    staged.state = TradeState::SettlementBroadcast;
                    effects.push(SideEffect::StartPolling { tx_id: tx_id.clone() });
                }
                MessageBody::Cancel => staged.state = TradeState::Cancelled,
                _ => return Err(self.event_violation(&event)),
            },

            (TradeState::FiatPaymentConfirmed, TradeEvent::PeerMessage(m)) => match &m.body {
                MessageBody::Cancel => staged.state = TradeState::Cancelled,
                _ => return Err(self.event_violation(&event)),
            },

            (TradeState::PaymentInfoExchanged, TradeEvent::FiatReceiptConfirmed)
                if self.record.role == TradeRole::Seller =>
            {
                staged.state = TradeState::FiatPaymentConfirmed;
            }

            (TradeState::FiatPaymentConfirmed, TradeEvent::SettlementBroadcast { tx_id, address })
                if self.record.role == TradeRole::Seller =>
            {
                // settlement_tx_id is write-once; the state guard ensures it
                // is still unset here.
                staged.settlement_tx_id = Some(tx_id.clone());
                match staged.settlement_address.as_deref() {
                    None => staged.settlement_address = Some(address.clone()),
                    Some(recorded) if recorded != address => {
                        warn!(
                            "[{}] Broadcast address {} differs from recorded {}, keeping recorded",
                            staged.trade_id, address, recorded
                        );
                    }
                    Some(_) => {}
                }
                staged.state = TradeState::SettlementBroadcast;
                effects.push(SideEffect::Send(ProtocolMessage {
                    trade_id: staged.trade_id.clone(),
                    version: staged.version,
                    body: MessageBody::SettlementBroadcastNotice { tx_id: tx_id.clone() },
                }));
                effects.push(SideEffect::StartPolling { tx_id: tx_id.clone() });
            }

            (TradeState::SettlementBroadcast, TradeEvent::ChainLookup(lookup)) => {
                if self.record.settlement_tx_id.as_deref() != Some(lookup.tx_id.as_str()) {
                    return Err(self.violation(format!(
                        "chain lookup for unexpected tx {}",
                        lookup.tx_id
                    )));
                }
                if !lookup.confirmed {
                    return Ok(self.no_op());
                }
                let expected = self.record.settlement_address.as_deref().unwrap_or_default();
                // First output matching the settlement address; multiple
                // outputs to the same address keep first-match behavior.
                let matched = lookup.outputs.iter().find(|o| o.address == expected);
                match matched {
                    Some(output) => {
                        staged.confirmed_amount = Some(output.value);
                        staged.state = TradeState::Completed;
                        effects.push(SideEffect::StopPolling);
                    }
                    None => {
                        warn!(
                            "[{}] Tx {} confirmed but no output at {}, keeping polling",
                            self.record.trade_id, lookup.tx_id, expected
                        );
                        return Ok(self.no_op());
                    }
                }
            }

            // Unilateral cancellation, permitted until settlement broadcast
            (state, TradeEvent::Cancel)
                if !state.is_terminal() && state != TradeState::SettlementBroadcast =>
            {
                staged.state = TradeState::Cancelled;
                effects.push(SideEffect::Send(ProtocolMessage {
                    trade_id: staged.trade_id.clone(),
                    version: staged.version,
                    body: MessageBody::Cancel,
                }));
            }

            (_, event) => return Err(self.event_violation(event)),
        }

        // Persist before committing in memory: a failed write leaves the
        // machine at the last persisted version.
        self.store
            .persist(&staged)
            .map_err(|source| TradeError::Persistence {
                trade_id: self.record.trade_id.clone(),
                source,
            })?;
        self.record = staged;

        Ok(Applied {
            effects,
            snapshot: self.record.clone(),
            transitioned: true,
        })
    }

    fn own_payment_info(&self, record: &TradeRecord) -> MessageBody {
        match record.role {
            TradeRole::Seller => MessageBody::PaymentInfo {
                payment_reference: record.payment_reference.clone(),
                settlement_address: None,
            },
            TradeRole::Buyer => MessageBody::PaymentInfo {
                payment_reference: None,
                settlement_address: record.settlement_address.clone(),
            },
        }
    }

    fn no_op(&self) -> Applied {
        Applied {
            effects: Vec::new(),
            snapshot: self.record.clone(),
            transitioned: false,
        }
    }

    fn violation(&self, event: impl Into<String>) -> TradeError {
        TradeError::violation(&self.record.trade_id, self.record.state, event)
    }

    fn event_violation(&self, event: &TradeEvent) -> TradeError {
        self.violation(event.kind())
    }
}
