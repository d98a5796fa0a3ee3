// Quota Ledger
// Per-user daily counters for chat requests and generated tokens. Counters
// key on (user_id, UTC day); increments are atomic so N parallel requests
// against a cap of L admit exactly min(N, L).

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::contracts::QuotaLedger;
use crate::types::UtcDay;

#[derive(Default)]
struct DayCounters {
    requests: AtomicI64,
    tokens: AtomicI64,
}

/// In-process quota ledger.
///
/// Rollover happens by key: a new UTC day addresses fresh counters, and
/// entries older than the previous day are pruned opportunistically on
/// access, which bounds the map to at most two days per active user.
pub struct MemoryQuotaLedger {
    counters: DashMap<(i64, UtcDay), Arc<DayCounters>>,
}

impl MemoryQuotaLedger {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
        }
    }

    fn day_counters(&self, user_id: i64, day: UtcDay) -> Arc<DayCounters> {
        self.prune_before(day);
        self.counters
            .entry((user_id, day))
            .or_insert_with(|| Arc::new(DayCounters::default()))
            .clone()
    }

    fn prune_before(&self, day: UtcDay) {
        self.counters.retain(|(_, entry_day), _| *entry_day >= day);
    }
}

impl Default for MemoryQuotaLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QuotaLedger for MemoryQuotaLedger {
    async fn incr_requests(&self, user_id: i64, day: UtcDay) -> Result<i64> {
        let counters = self.day_counters(user_id, day);
        Ok(counters.requests.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn read_tokens(&self, user_id: i64, day: UtcDay) -> Result<i64> {
        let counters = self.day_counters(user_id, day);
        Ok(counters.tokens.load(Ordering::SeqCst))
    }

    async fn add_tokens(&self, user_id: i64, day: UtcDay, amount: i64) -> Result<i64> {
        let counters = self.day_counters(user_id, day);
        Ok(counters.tokens.fetch_add(amount, Ordering::SeqCst) + amount)
    }
}

/// Production factory for the quota ledger.
pub fn create_quota_ledger() -> Arc<dyn QuotaLedger> {
    Arc::new(MemoryQuotaLedger::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[tokio::test]
    async fn test_request_counter_increments() -> Result<()> {
        let ledger = MemoryQuotaLedger::new();
        let day = UtcDay::today();

        assert_eq!(ledger.incr_requests(1, day).await?, 1);
        assert_eq!(ledger.incr_requests(1, day).await?, 2);
        // Different user, independent counter.
        assert_eq!(ledger.incr_requests(2, day).await?, 1);

        Ok(())
    }

    #[tokio::test]
    async fn test_token_counter() -> Result<()> {
        let ledger = MemoryQuotaLedger::new();
        let day = UtcDay::today();

        assert_eq!(ledger.read_tokens(1, day).await?, 0);
        assert_eq!(ledger.add_tokens(1, day, 150).await?, 150);
        assert_eq!(ledger.add_tokens(1, day, 50).await?, 200);
        assert_eq!(ledger.read_tokens(1, day).await?, 200);

        Ok(())
    }

    #[tokio::test]
    async fn test_day_rollover_resets() -> Result<()> {
        let ledger = MemoryQuotaLedger::new();
        let yesterday =
            UtcDay::from_datetime(Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap());
        let today = UtcDay::from_datetime(Utc.with_ymd_and_hms(2026, 6, 2, 0, 0, 1).unwrap());

        ledger.incr_requests(1, yesterday).await?;
        ledger.add_tokens(1, yesterday, 500).await?;

        // A new day starts from zero.
        assert_eq!(ledger.incr_requests(1, today).await?, 1);
        assert_eq!(ledger.read_tokens(1, today).await?, 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_parallel_increments_are_linearizable() -> Result<()> {
        let ledger = Arc::new(MemoryQuotaLedger::new());
        let day = UtcDay::today();

        let mut handles = Vec::new();
        for _ in 0..32 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(
                async move { ledger.incr_requests(9, day).await },
            ));
        }

        let mut seen = Vec::new();
        for handle in handles {
            seen.push(handle.await??);
        }
        seen.sort_unstable();

        // Every increment observed a distinct value 1..=32.
        assert_eq!(seen, (1..=32).collect::<Vec<_>>());
        Ok(())
    }
}
