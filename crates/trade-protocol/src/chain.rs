//! Chain lookup and confirmation polling
//!
//! Settlement confirmation is polling-driven, not push: one sequential poll
//! loop per trade asks the chain-inspection collaborator for the settlement
//! transaction, backing off exponentially between attempts. The sequential
//! loop is also what makes lookups single-flight per (trade, tx): a new
//! attempt is only issued after the previous one resolved.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::time::Instant;

use crate::error::LookupFailure;
use crate::types::{TradeId, TxLookup};

/// External ledger-inspection capability.
///
/// Answers "is transaction T confirmed, and what are its outputs?". A
/// timeout or outage is a `LookupFailure`, never a crash, and never fails
/// the trade.
#[async_trait]
pub trait ChainLookup: Send + Sync {
    async fn request_tx(&self, tx_id: &str) -> Result<TxLookup, LookupFailure>;
}

/// Exponential backoff with a ceiling and full jitter.
///
/// Block propagation delay is highly variable, so a single fixed-delay retry
/// is not enough; the ceiling keeps long-unconfirmed transactions polled at
/// a steady rate and the jitter staggers many concurrent trades.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    base: Duration,
    cap: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Deterministic delay ceiling for the given attempt: `base * 2^attempt`,
    /// capped. Strictly increases per attempt until the cap is reached.
    pub fn ceiling_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(16); // avoid shift overflow; cap dominates anyway
        self.base
            .checked_mul(1u32 << exp)
            .map_or(self.cap, |d| d.min(self.cap))
    }

    /// Full jitter: uniform in `[ceiling/2, ceiling]`, so delays stay
    /// monotonically non-trivial while spreading poll bursts.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling_delay(attempt);
        if ceiling.is_zero() {
            return ceiling;
        }
        let half = ceiling / 2;
        half + rand::thread_rng().gen_range(Duration::ZERO..=ceiling - half)
    }
}

impl Default for BackoffPolicy {
    /// Base 20s doubling to a 5min ceiling
    fn default() -> Self {
        Self::new(Duration::from_secs(20), Duration::from_secs(300))
    }
}

/// Ephemeral bookkeeping for one trade's confirmation polling.
///
/// Owned by the poll loop that created it; destroyed on confirmation,
/// cancellation or shutdown.
#[derive(Debug)]
pub struct PollTask {
    pub trade_id: TradeId,
    pub target_tx_id: String,
    pub next_attempt_at: Instant,
    pub attempt_count: u32,
}

impl PollTask {
    /// New task with the first attempt due immediately
    pub fn new(trade_id: TradeId, target_tx_id: String) -> Self {
        Self {
            trade_id,
            target_tx_id,
            next_attempt_at: Instant::now(),
            attempt_count: 0,
        }
    }

    /// Record a resolved attempt (unconfirmed or failed) and schedule the
    /// next one with a strictly larger backoff ceiling, up to the cap.
    pub fn reschedule(&mut self, policy: &BackoffPolicy) {
        let delay = policy.jittered_delay(self.attempt_count);
        self.attempt_count += 1;
        self.next_attempt_at = Instant::now() + delay;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_monotone_to_ceiling() {
        let policy = BackoffPolicy::new(Duration::from_secs(20), Duration::from_secs(300));
        let mut previous = Duration::ZERO;
        for attempt in 0..8 {
            let delay = policy.ceiling_delay(attempt);
            assert!(delay >= previous, "attempt {} not monotone", attempt);
            previous = delay;
        }
        assert_eq!(policy.ceiling_delay(0), Duration::from_secs(20));
        assert_eq!(policy.ceiling_delay(1), Duration::from_secs(40));
        assert_eq!(policy.ceiling_delay(2), Duration::from_secs(80));
        assert_eq!(policy.ceiling_delay(3), Duration::from_secs(160));
        // Capped from here on
        assert_eq!(policy.ceiling_delay(4), Duration::from_secs(300));
        assert_eq!(policy.ceiling_delay(30), Duration::from_secs(300));
    }

    #[test]
    fn test_jitter_stays_within_ceiling() {
        let policy = BackoffPolicy::default();
        for attempt in 0..6 {
            let ceiling = policy.ceiling_delay(attempt);
            for _ in 0..50 {
                let d = policy.jittered_delay(attempt);
                assert!(d <= ceiling);
                assert!(d >= ceiling / 2);
            }
        }
    }

    #[test]
    fn test_poll_task_reschedule_counts_attempts() {
        let policy = BackoffPolicy::new(Duration::from_millis(0), Duration::from_millis(0));
        let mut task = PollTask::new(TradeId::from("t-1"), "tx-1".to_string());
        assert_eq!(task.attempt_count, 0);
        task.reschedule(&policy);
        task.reschedule(&policy);
        assert_eq!(task.attempt_count, 2);
    }
}
