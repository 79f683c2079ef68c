//! Protocol service: the single entrypoint for trade lifecycle operations
//!
//! Owns one state machine per trade and serializes event application per
//! trade through a tokio mutex, so concurrent trades never block each other
//! while concurrent events on one trade apply one at a time. Confirmation
//! polling runs as one background task per broadcast trade; outbound sends
//! are fire-and-forget with the handles drained on shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures::future::join_all;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::chain::{BackoffPolicy, ChainLookup, PollTask};
use crate::channel::PeerChannel;
use crate::config::ProtocolConfig;
use crate::error::TradeError;
use crate::machine::{Applied, TradeStateMachine};
use crate::record::TradeRecord;
use crate::store::TradeStore;
use crate::types::{
    MessageBody, PeerId, ProtocolMessage, SideEffect, TradeEvent, TradeId, TradeRole, TradeState,
    TxLookup,
};

/// Callback invoked with the post-transition snapshot after each committed
/// transition
pub type TradeObserver = Box<dyn Fn(&TradeRecord) + Send + Sync>;

/// Whether a poll loop should keep going after delivering a lookup
enum PollControl {
    Continue,
    Stop,
}

/// Per-trade slot: the machine itself plus its poll task, if any
struct TradeHandle {
    machine: Mutex<TradeStateMachine>,
    poll: Mutex<Option<JoinHandle<()>>>,
}

impl TradeHandle {
    fn new(machine: TradeStateMachine) -> Self {
        Self {
            machine: Mutex::new(machine),
            poll: Mutex::new(None),
        }
    }

    async fn stop_polling(&self) {
        if let Some(task) = self.poll.lock().await.take() {
            task.abort();
        }
    }
}

pub struct ProtocolService<C: ChainLookup, P: PeerChannel> {
    store: Arc<dyn TradeStore>,
    chain: Arc<C>,
    channel: Arc<P>,
    backoff: BackoffPolicy,
    startup_timeout: Duration,
    send_drain_timeout: Duration,
    trades: Mutex<HashMap<TradeId, Arc<TradeHandle>>>,
    observers: Mutex<Vec<TradeObserver>>,
    send_tasks: Mutex<Vec<JoinHandle<()>>>,
    shutting_down: AtomicBool,
    self_ref: Weak<Self>,
}

impl<C, P> ProtocolService<C, P>
where
    C: ChainLookup + 'static,
    P: PeerChannel + 'static,
{
    pub fn new(
        config: &ProtocolConfig,
        store: Arc<dyn TradeStore>,
        chain: Arc<C>,
        channel: Arc<P>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            store,
            chain,
            channel,
            backoff: BackoffPolicy::new(config.poll_base, config.poll_cap),
            startup_timeout: config.startup_timeout,
            send_drain_timeout: config.send_drain_timeout,
            trades: Mutex::new(HashMap::new()),
            observers: Mutex::new(Vec::new()),
            send_tasks: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
            self_ref: weak.clone(),
        })
    }

    /// Rehydrate all stored trades and resume confirmation polling for any
    /// trade that was mid-settlement when the process last stopped. Bounded
    /// by the startup timeout; a failure on a single trade marks that trade
    /// CANCELLED instead of aborting the whole startup.
    pub async fn initialize(&self) -> Result<()> {
        tokio::time::timeout(self.startup_timeout, self.rehydrate_all())
            .await
            .map_err(|_| anyhow!("Initialization exceeded {:?}", self.startup_timeout))?
    }

    async fn rehydrate_all(&self) -> Result<()> {
        let records = self
            .store
            .load_all()
            .context("Failed to load stored trade records")?;

        let mut active = 0usize;
        let mut resumed = 0usize;
        for mut record in records {
            if let Err(reason) = Self::validate_record(&record) {
                warn!(
                    "[{}] Inconsistent stored record ({}), marking cancelled",
                    record.trade_id, reason
                );
                record.state = TradeState::Cancelled;
                record.version += 1;
                record.last_updated_at = chrono::Utc::now();
                if let Err(e) = self.store.persist(&record) {
                    error!("[{}] Failed to persist cancellation: {}", record.trade_id, e);
                }
            }

            let trade_id = record.trade_id.clone();
            let poll_target = match record.state {
                TradeState::SettlementBroadcast => record.settlement_tx_id.clone(),
                _ => None,
            };
            if !record.is_retired() {
                active += 1;
            }

            let handle = Arc::new(TradeHandle::new(TradeStateMachine::new(
                record,
                Arc::clone(&self.store),
            )));
            self.trades.lock().await.insert(trade_id.clone(), Arc::clone(&handle));

            if let Some(tx_id) = poll_target {
                self.spawn_poll(&handle, trade_id, tx_id).await;
                resumed += 1;
            }
        }

        info!(
            "Protocol service initialized: {} active trade(s), {} poll loop(s) resumed",
            active, resumed
        );
        Ok(())
    }

    /// A SETTLEMENT_BROADCAST record needs both a transaction id to poll for
    /// and an address to match outputs against; missing either, the resumed
    /// poll could never complete. Treat such records as corrupt.
    fn validate_record(record: &TradeRecord) -> std::result::Result<(), &'static str> {
        if record.state == TradeState::SettlementBroadcast {
            if record.settlement_tx_id.is_none() {
                return Err("settlement broadcast without a transaction id");
            }
            if record.settlement_address.is_none() {
                return Err("settlement broadcast without a settlement address");
            }
        }
        Ok(())
    }

    /// Register a new trade and announce our payment info to the
    /// counterparty. Both parties call this with the same trade id after
    /// agreeing on the trade out of band.
    pub async fn start_trade(
        &self,
        trade_id: TradeId,
        role: TradeRole,
        counterparty_id: PeerId,
        payment_reference: Option<String>,
        settlement_address: Option<String>,
    ) -> Result<TradeRecord, TradeError> {
        let record = TradeRecord::new(
            trade_id.clone(),
            role,
            counterparty_id,
            payment_reference,
            settlement_address,
        );

        {
            let mut trades = self.trades.lock().await;
            if let Some(existing) = trades.get(&trade_id) {
                let state = existing.machine.lock().await.current_state();
                return Err(TradeError::violation(&trade_id, state, "trade already exists"));
            }
            // Persist before the trade becomes visible
            self.store
                .persist(&record)
                .map_err(|source| TradeError::Persistence {
                    trade_id: trade_id.clone(),
                    source,
                })?;
            let machine = TradeStateMachine::new(record.clone(), Arc::clone(&self.store));
            let announce = machine.payment_info_message();
            trades.insert(trade_id.clone(), Arc::new(TradeHandle::new(machine)));
            self.dispatch_send(record.counterparty_id.clone(), announce)
                .await;
        }

        info!("[{}] Trade started as {:?}", trade_id, role);
        self.notify_observers(&record).await;
        Ok(record)
    }

    /// Seller command: fiat arrived on the seller's payment rail.
    pub async fn confirm_fiat_received(
        &self,
        trade_id: &TradeId,
    ) -> Result<TradeRecord, TradeError> {
        self.apply_command(trade_id, TradeEvent::FiatReceiptConfirmed)
            .await
    }

    /// Seller command: the settlement transaction was broadcast. Notifies
    /// the buyer and starts confirmation polling.
    pub async fn broadcast_settlement(
        &self,
        trade_id: &TradeId,
        tx_id: String,
        destination_address: String,
    ) -> Result<TradeRecord, TradeError> {
        self.apply_command(
            trade_id,
            TradeEvent::SettlementBroadcast {
                tx_id,
                address: destination_address,
            },
        )
        .await
    }

    /// Unilateral cancellation; rejected once settlement is on chain.
    pub async fn cancel_trade(&self, trade_id: &TradeId) -> Result<TradeRecord, TradeError> {
        let snapshot = self.apply_command(trade_id, TradeEvent::Cancel).await?;
        if let Some(handle) = self.trades.lock().await.get(trade_id) {
            handle.stop_polling().await;
        }
        Ok(snapshot)
    }

    /// Inbound protocol message from the transport. Stale, duplicate and
    /// otherwise inapplicable messages are dropped here; they must never
    /// fail the trade.
    pub async fn on_peer_message(&self, message: ProtocolMessage) -> Result<(), TradeError> {
        let trade_id = message.trade_id.clone();
        let handle = match self.handle(&trade_id).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Dropping message for unknown trade {}", trade_id);
                return Err(e);
            }
        };

        let result = {
            let mut machine = handle.machine.lock().await;
            machine.apply(TradeEvent::PeerMessage(message))
        };
        match result {
            Ok(applied) => {
                self.execute_effects(&handle, &applied).await;
                if applied.transitioned {
                    self.notify_observers(&applied.snapshot).await;
                }
                Ok(())
            }
            Err(e) if e.is_violation() => {
                debug!("[{}] Dropping inapplicable message: {}", trade_id, e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn get_trade(&self, trade_id: &TradeId) -> Result<TradeRecord, TradeError> {
        let handle = self.handle(trade_id).await?;
        let machine = handle.machine.lock().await;
        Ok(machine.record().clone())
    }

    pub async fn list_trades(&self) -> Vec<TradeRecord> {
        let trades = self.trades.lock().await;
        let mut records = Vec::with_capacity(trades.len());
        for handle in trades.values() {
            records.push(handle.machine.lock().await.record().clone());
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }

    /// Register a callback for committed transitions. Observers run inline
    /// after the transition is persisted; keep them cheap.
    pub async fn subscribe<F>(&self, observer: F)
    where
        F: Fn(&TradeRecord) + Send + Sync + 'static,
    {
        self.observers.lock().await.push(Box::new(observer));
    }

    /// Stop poll loops and drain in-flight outbound sends, bounded by the
    /// drain timeout.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);

        let trades = self.trades.lock().await;
        for handle in trades.values() {
            handle.stop_polling().await;
        }
        drop(trades);

        let tasks: Vec<JoinHandle<()>> = self.send_tasks.lock().await.drain(..).collect();
        if !tasks.is_empty() {
            info!("Draining {} outbound send task(s)...", tasks.len());
            if tokio::time::timeout(self.send_drain_timeout, join_all(tasks))
                .await
                .is_err()
            {
                warn!("Send drain timed out after {:?}", self.send_drain_timeout);
            }
        }
        info!("Protocol service shut down");
    }

    async fn apply_command(
        &self,
        trade_id: &TradeId,
        event: TradeEvent,
    ) -> Result<TradeRecord, TradeError> {
        let handle = self.handle(trade_id).await?;
        let applied = {
            let mut machine = handle.machine.lock().await;
            machine.apply(event)?
        };
        self.execute_effects(&handle, &applied).await;
        if applied.transitioned {
            self.notify_observers(&applied.snapshot).await;
        }
        Ok(applied.snapshot)
    }

    async fn handle(&self, trade_id: &TradeId) -> Result<Arc<TradeHandle>, TradeError> {
        self.trades
            .lock()
            .await
            .get(trade_id)
            .cloned()
            .ok_or_else(|| TradeError::UnknownTrade(trade_id.clone()))
    }

    async fn execute_effects(&self, handle: &Arc<TradeHandle>, applied: &Applied) {
        for effect in &applied.effects {
            match effect {
                SideEffect::Send(message) => {
                    self.dispatch_send(applied.snapshot.counterparty_id.clone(), message.clone())
                        .await;
                }
                SideEffect::StartPolling { tx_id } => {
                    self.spawn_poll(handle, applied.snapshot.trade_id.clone(), tx_id.clone())
                        .await;
                }
                SideEffect::StopPolling => {
                    handle.stop_polling().await;
                }
            }
        }
    }

    /// Feed a chain lookup into the machine from inside a poll loop. The
    /// StopPolling effect is handled by returning `Stop` rather than by
    /// aborting the loop's own task from within.
    async fn deliver_chain_lookup(
        &self,
        handle: &Arc<TradeHandle>,
        trade_id: &TradeId,
        lookup: TxLookup,
    ) -> PollControl {
        let result = {
            let mut machine = handle.machine.lock().await;
            machine.apply(TradeEvent::ChainLookup(lookup))
        };
        match result {
            Ok(applied) => {
                for effect in &applied.effects {
                    if let SideEffect::Send(message) = effect {
                        self.dispatch_send(
                            applied.snapshot.counterparty_id.clone(),
                            message.clone(),
                        )
                        .await;
                    }
                }
                if applied.transitioned {
                    self.notify_observers(&applied.snapshot).await;
                }
                if applied.snapshot.state.is_terminal() {
                    PollControl::Stop
                } else {
                    PollControl::Continue
                }
            }
            Err(e) if e.is_violation() => {
                // The trade moved out from under the poll (e.g. cancelled)
                warn!("[{}] Lookup no longer applicable: {}", trade_id, e);
                PollControl::Stop
            }
            Err(e) => {
                error!(
                    "[{}] Failed to commit confirmation, will retry: {}",
                    trade_id, e
                );
                PollControl::Continue
            }
        }
    }

    async fn spawn_poll(&self, handle: &Arc<TradeHandle>, trade_id: TradeId, tx_id: String) {
        let Some(service) = self.self_ref.upgrade() else {
            return;
        };
        let handle_clone = Arc::clone(handle);
        let backoff = self.backoff;
        let task = tokio::spawn(async move {
            let mut poll = PollTask::new(trade_id, tx_id);
            loop {
                tokio::time::sleep_until(poll.next_attempt_at).await;
                if service.shutting_down.load(Ordering::Relaxed) {
                    break;
                }
                // The transport keeps no delivery state, so a notice the
                // buyer could not yet apply would otherwise be lost; repeat
                // it at the poll cadence until the trade resolves. Peers
                // drop copies they have already applied.
                if poll.attempt_count > 0 {
                    service.reannounce_broadcast(&handle_clone).await;
                }
                match service.chain.request_tx(&poll.target_tx_id).await {
                    Ok(lookup) => {
                        match service
                            .deliver_chain_lookup(&handle_clone, &poll.trade_id, lookup)
                            .await
                        {
                            PollControl::Stop => break,
                            PollControl::Continue => poll.reschedule(&backoff),
                        }
                    }
                    Err(failure) => {
                        // Explorer outages never cancel a trade
                        warn!(
                            "[{}] Lookup attempt {} failed ({}), backing off",
                            poll.trade_id,
                            poll.attempt_count + 1,
                            failure
                        );
                        poll.reschedule(&backoff);
                    }
                }
            }
        });

        let mut poll_slot = handle.poll.lock().await;
        if let Some(existing) = poll_slot.take() {
            existing.abort();
        }
        *poll_slot = Some(task);
    }

    /// Re-send the settlement broadcast notice while the seller is still
    /// polling; a no-op for the buyer side or once the trade left
    /// SETTLEMENT_BROADCAST.
    async fn reannounce_broadcast(&self, handle: &Arc<TradeHandle>) {
        let outbound = {
            let machine = handle.machine.lock().await;
            let record = machine.record();
            if record.role != TradeRole::Seller
                || record.state != TradeState::SettlementBroadcast
            {
                return;
            }
            let Some(tx_id) = record.settlement_tx_id.clone() else {
                return;
            };
            (
                record.counterparty_id.clone(),
                ProtocolMessage {
                    trade_id: record.trade_id.clone(),
                    version: record.version,
                    body: MessageBody::SettlementBroadcastNotice { tx_id },
                },
            )
        };
        self.dispatch_send(outbound.0, outbound.1).await;
    }

    async fn dispatch_send(&self, peer: PeerId, message: ProtocolMessage) {
        let channel = Arc::clone(&self.channel);
        let task = tokio::spawn(async move {
            if let Err(e) = channel.send(&peer, message).await {
                // At-least-once delivery belongs to the transport; dropped
                // messages are recovered by the peer's next retransmit
                warn!("Outbound delivery failed: {}", e);
            }
        });
        let mut tasks = self.send_tasks.lock().await;
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    async fn notify_observers(&self, snapshot: &TradeRecord) {
        for observer in self.observers.lock().await.iter() {
            observer(snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::InProcessChannel;
    use crate::error::LookupFailure;
    use crate::store::MemoryTradeStore;
    use crate::types::TxOutput;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Fails the first `fail_first` lookups, then answers unconfirmed until
    /// `confirm_at` total calls have been made, then confirms.
    struct ScriptedChain {
        fail_first: usize,
        confirm_at: usize,
        calls: AtomicUsize,
        address: String,
        value: u64,
    }

    impl ScriptedChain {
        fn confirming(address: &str, value: u64, confirm_at: usize) -> Self {
            Self {
                fail_first: 0,
                confirm_at,
                calls: AtomicUsize::new(0),
                address: address.to_string(),
                value,
            }
        }

        fn flaky(address: &str, value: u64, fail_first: usize, confirm_at: usize) -> Self {
            Self {
                fail_first,
                confirm_at,
                calls: AtomicUsize::new(0),
                address: address.to_string(),
                value,
            }
        }
    }

    #[async_trait]
    impl ChainLookup for ScriptedChain {
        async fn request_tx(&self, tx_id: &str) -> Result<TxLookup, LookupFailure> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_first {
                return Err(LookupFailure("explorer unreachable".to_string()));
            }
            Ok(TxLookup {
                tx_id: tx_id.to_string(),
                outputs: vec![TxOutput {
                    address: self.address.clone(),
                    value: self.value,
                }],
                confirmed: call >= self.confirm_at,
            })
        }
    }

    fn fast_config() -> ProtocolConfig {
        ProtocolConfig {
            poll_base: Duration::from_millis(1),
            poll_cap: Duration::from_millis(5),
            ..ProtocolConfig::default()
        }
    }

    async fn wait_for_state<C, P>(
        service: &ProtocolService<C, P>,
        trade_id: &TradeId,
        state: TradeState,
    ) where
        C: ChainLookup + 'static,
        P: PeerChannel + 'static,
    {
        for _ in 0..400 {
            if service.get_trade(trade_id).await.unwrap().state == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "trade {} never reached {:?} (at {:?})",
            trade_id,
            state,
            service.get_trade(trade_id).await.unwrap().state
        );
    }

    fn pump_inbound<C, P>(
        service: Arc<ProtocolService<C, P>>,
        mut rx: tokio::sync::mpsc::UnboundedReceiver<ProtocolMessage>,
    ) where
        C: ChainLookup + 'static,
        P: PeerChannel + 'static,
    {
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let _ = service.on_peer_message(message).await;
            }
        });
    }

    #[tokio::test]
    async fn test_full_trade_between_two_services() {
        let channel = Arc::new(InProcessChannel::new());
        let rx_seller = channel.register(PeerId::from("seller"));
        let rx_buyer = channel.register(PeerId::from("buyer"));
        let config = fast_config();

        let seller = ProtocolService::new(
            &config,
            Arc::new(MemoryTradeStore::new()),
            Arc::new(ScriptedChain::confirming("bc1qbuyer", 42_000, 2)),
            Arc::clone(&channel),
        );
        let buyer = ProtocolService::new(
            &config,
            Arc::new(MemoryTradeStore::new()),
            Arc::new(ScriptedChain::confirming("bc1qbuyer", 42_000, 2)),
            Arc::clone(&channel),
        );
        pump_inbound(Arc::clone(&seller), rx_seller);
        pump_inbound(Arc::clone(&buyer), rx_buyer);

        let trade_id = TradeId::from("trade-e2e");
        // Buyer first: its opening announce targets a trade the seller has
        // not registered yet and is dropped; the seller's own announce then
        // completes the exchange.
        buyer
            .start_trade(
                trade_id.clone(),
                TradeRole::Buyer,
                PeerId::from("seller"),
                None,
                Some("bc1qbuyer".to_string()),
            )
            .await
            .unwrap();
        seller
            .start_trade(
                trade_id.clone(),
                TradeRole::Seller,
                PeerId::from("buyer"),
                Some("SEPA ref 991".to_string()),
                None,
            )
            .await
            .unwrap();

        wait_for_state(&seller, &trade_id, TradeState::PaymentInfoExchanged).await;
        wait_for_state(&buyer, &trade_id, TradeState::PaymentInfoExchanged).await;

        // Both sides now hold the full payment info
        let buyer_view = buyer.get_trade(&trade_id).await.unwrap();
        assert_eq!(buyer_view.payment_reference.as_deref(), Some("SEPA ref 991"));

        seller.confirm_fiat_received(&trade_id).await.unwrap();
        let broadcast = seller
            .broadcast_settlement(&trade_id, "tx-final".to_string(), "bc1qbuyer".to_string())
            .await
            .unwrap();
        assert_eq!(broadcast.state, TradeState::SettlementBroadcast);

        wait_for_state(&seller, &trade_id, TradeState::Completed).await;
        wait_for_state(&buyer, &trade_id, TradeState::Completed).await;

        let done = buyer.get_trade(&trade_id).await.unwrap();
        assert_eq!(done.settlement_tx_id.as_deref(), Some("tx-final"));
        assert_eq!(done.confirmed_amount, Some(42_000));

        seller.shutdown().await;
        buyer.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_resumes_polling() {
        let store = Arc::new(MemoryTradeStore::new());
        let mut record = TradeRecord::new(
            TradeId::from("trade-resume"),
            TradeRole::Buyer,
            PeerId::from("seller"),
            None,
            Some("bc1qresume".to_string()),
        );
        record.state = TradeState::SettlementBroadcast;
        record.settlement_tx_id = Some("tx-pending".to_string());
        record.version = 3;
        store.seed(record);

        let channel = Arc::new(InProcessChannel::new());
        let service = ProtocolService::new(
            &fast_config(),
            store,
            Arc::new(ScriptedChain::confirming("bc1qresume", 7_000, 1)),
            channel,
        );
        service.initialize().await.unwrap();

        let trade_id = TradeId::from("trade-resume");
        wait_for_state(&service, &trade_id, TradeState::Completed).await;
        let record = service.get_trade(&trade_id).await.unwrap();
        assert_eq!(record.confirmed_amount, Some(7_000));
        assert_eq!(record.version, 4);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_explorer_outage_does_not_fail_trade() {
        let store = Arc::new(MemoryTradeStore::new());
        let mut record = TradeRecord::new(
            TradeId::from("trade-flaky"),
            TradeRole::Seller,
            PeerId::from("buyer"),
            Some("ref".to_string()),
            Some("bc1qflaky".to_string()),
        );
        record.state = TradeState::SettlementBroadcast;
        record.settlement_tx_id = Some("tx-flaky".to_string());
        record.version = 4;
        store.seed(record);

        let service = ProtocolService::new(
            &fast_config(),
            store,
            Arc::new(ScriptedChain::flaky("bc1qflaky", 1_000, 3, 5)),
            Arc::new(InProcessChannel::new()),
        );
        service.initialize().await.unwrap();

        let trade_id = TradeId::from("trade-flaky");
        wait_for_state(&service, &trade_id, TradeState::Completed).await;
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_inconsistent_record_cancelled_on_startup() {
        let store = Arc::new(MemoryTradeStore::new());
        // Broadcast state but no transaction id: cannot resume polling
        let mut broken = TradeRecord::new(
            TradeId::from("trade-broken"),
            TradeRole::Buyer,
            PeerId::from("seller"),
            None,
            Some("bc1qx".to_string()),
        );
        broken.state = TradeState::SettlementBroadcast;
        broken.version = 2;
        store.seed(broken);
        let healthy = TradeRecord::new(
            TradeId::from("trade-healthy"),
            TradeRole::Seller,
            PeerId::from("buyer"),
            Some("ref".to_string()),
            None,
        );
        store.seed(healthy);

        let service = ProtocolService::new(
            &fast_config(),
            store,
            Arc::new(ScriptedChain::confirming("bc1qx", 1, 1)),
            Arc::new(InProcessChannel::new()),
        );
        service.initialize().await.unwrap();

        let broken = service.get_trade(&TradeId::from("trade-broken")).await.unwrap();
        assert_eq!(broken.state, TradeState::Cancelled);
        assert_eq!(broken.version, 3);
        let healthy = service.get_trade(&TradeId::from("trade-healthy")).await.unwrap();
        assert_eq!(healthy.state, TradeState::Initiated);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_record_without_address_cancelled_on_startup() {
        let store = Arc::new(MemoryTradeStore::new());
        // Has a transaction id but no address to match outputs against:
        // the resumed poll could never complete
        let mut record = TradeRecord::new(
            TradeId::from("trade-noaddr"),
            TradeRole::Seller,
            PeerId::from("buyer"),
            Some("ref".to_string()),
            None,
        );
        record.state = TradeState::SettlementBroadcast;
        record.settlement_tx_id = Some("tx-1".to_string());
        record.version = 3;
        store.seed(record);

        let service = ProtocolService::new(
            &fast_config(),
            store,
            Arc::new(ScriptedChain::confirming("bc1qx", 1, 1)),
            Arc::new(InProcessChannel::new()),
        );
        service.initialize().await.unwrap();

        let record = service.get_trade(&TradeId::from("trade-noaddr")).await.unwrap();
        assert_eq!(record.state, TradeState::Cancelled);
        assert_eq!(record.version, 4);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_seller_repeats_notice_while_polling() {
        let channel = Arc::new(InProcessChannel::new());
        let mut rx_buyer = channel.register(PeerId::from("buyer"));
        let store = Arc::new(MemoryTradeStore::new());
        let mut record = TradeRecord::new(
            TradeId::from("trade-replay"),
            TradeRole::Seller,
            PeerId::from("buyer"),
            Some("ref".to_string()),
            Some("bc1qreplay".to_string()),
        );
        record.state = TradeState::SettlementBroadcast;
        record.settlement_tx_id = Some("tx-replay".to_string());
        record.version = 3;
        store.seed(record);

        let service = ProtocolService::new(
            &fast_config(),
            store,
            Arc::new(ScriptedChain::confirming("bc1qreplay", 1, 1_000_000)),
            channel,
        );
        service.initialize().await.unwrap();

        // A notice the buyer missed is recovered from the poll loop
        let message = tokio::time::timeout(Duration::from_secs(2), rx_buyer.recv())
            .await
            .expect("no re-announced notice")
            .unwrap();
        assert_eq!(message.trade_id, TradeId::from("trade-replay"));
        assert!(matches!(
            message.body,
            MessageBody::SettlementBroadcastNotice { ref tx_id } if tx_id == "tx-replay"
        ));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_trade_command_and_message() {
        let service = ProtocolService::new(
            &fast_config(),
            Arc::new(MemoryTradeStore::new()),
            Arc::new(ScriptedChain::confirming("a", 1, 1)),
            Arc::new(InProcessChannel::new()),
        );

        let missing = TradeId::from("trade-missing");
        let err = service.confirm_fiat_received(&missing).await.unwrap_err();
        assert!(matches!(err, TradeError::UnknownTrade(_)));

        let err = service
            .on_peer_message(ProtocolMessage {
                trade_id: missing,
                version: 0,
                body: crate::types::MessageBody::Cancel,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TradeError::UnknownTrade(_)));
    }

    #[tokio::test]
    async fn test_duplicate_peer_message_dropped_silently() {
        let service = ProtocolService::new(
            &fast_config(),
            Arc::new(MemoryTradeStore::new()),
            Arc::new(ScriptedChain::confirming("a", 1, 1)),
            Arc::new(InProcessChannel::new()),
        );
        let trade_id = TradeId::from("trade-dup");
        service
            .start_trade(
                trade_id.clone(),
                TradeRole::Seller,
                PeerId::from("buyer"),
                Some("ref".to_string()),
                None,
            )
            .await
            .unwrap();

        let info = ProtocolMessage {
            trade_id: trade_id.clone(),
            version: 0,
            body: crate::types::MessageBody::PaymentInfo {
                payment_reference: None,
                settlement_address: Some("bc1qdup".to_string()),
            },
        };
        service.on_peer_message(info.clone()).await.unwrap();
        let after_first = service.get_trade(&trade_id).await.unwrap();
        assert_eq!(after_first.state, TradeState::PaymentInfoExchanged);

        // Redelivered copy: version is now stale, dropped without error
        service.on_peer_message(info).await.unwrap();
        let after_second = service.get_trade(&trade_id).await.unwrap();
        assert_eq!(after_second.version, after_first.version);
    }

    #[tokio::test]
    async fn test_observers_see_each_transition() {
        let service = ProtocolService::new(
            &fast_config(),
            Arc::new(MemoryTradeStore::new()),
            Arc::new(ScriptedChain::confirming("a", 1, 1)),
            Arc::new(InProcessChannel::new()),
        );
        let seen: Arc<std::sync::Mutex<Vec<TradeState>>> =
            Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        service
            .subscribe(move |record: &TradeRecord| {
                sink.lock().unwrap().push(record.state);
            })
            .await;

        let trade_id = TradeId::from("trade-observed");
        service
            .start_trade(
                trade_id.clone(),
                TradeRole::Buyer,
                PeerId::from("seller"),
                None,
                Some("bc1qobs".to_string()),
            )
            .await
            .unwrap();
        service.cancel_trade(&trade_id).await.unwrap();

        let states = seen.lock().unwrap().clone();
        assert_eq!(states, vec![TradeState::Initiated, TradeState::Cancelled]);
    }

    #[tokio::test]
    async fn test_cancel_stops_poll_and_later_lookup_is_ignored() {
        let service = ProtocolService::new(
            &fast_config(),
            Arc::new(MemoryTradeStore::new()),
            Arc::new(ScriptedChain::confirming("bc1qc", 1, 1_000_000)),
            Arc::new(InProcessChannel::new()),
        );
        let trade_id = TradeId::from("trade-cxl");
        service
            .start_trade(
                trade_id.clone(),
                TradeRole::Buyer,
                PeerId::from("seller"),
                None,
                Some("bc1qc".to_string()),
            )
            .await
            .unwrap();
        service.cancel_trade(&trade_id).await.unwrap();

        let record = service.get_trade(&trade_id).await.unwrap();
        assert_eq!(record.state, TradeState::Cancelled);

        // Further commands on a retired trade are rejected
        let err = service.confirm_fiat_received(&trade_id).await.unwrap_err();
        assert!(err.is_violation());
        service.shutdown().await;
    }
}
