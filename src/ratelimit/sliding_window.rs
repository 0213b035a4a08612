//! Sliding window log.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;
use uuid::Uuid;

use super::algorithm::Algorithm;
use super::identity::Identity;
use super::limiter::{Admission, Limiter, Remaining};
use crate::clock::Clock;
use crate::store::{CounterStore, SlidingWindowOp, StoreError};

/// Admits a request if fewer than `limit` requests were admitted for the
/// identity during the preceding `window`.
///
/// Each admitted request is logged with its microsecond timestamp. Entries
/// older than the window are purged before every count, which both bounds the
/// log and keeps stale entries from counting. Rejected requests are not logged.
pub struct SlidingWindow {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    limit: u64,
    window: Duration,
}

impl SlidingWindow {
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        limit: u64,
        window: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            limit,
            window,
        }
    }
}

#[async_trait]
impl Limiter for SlidingWindow {
    fn algorithm(&self) -> Algorithm {
        Algorithm::SlidingWindow
    }

    async fn allow(&self, identity: &Identity) -> Result<Admission, StoreError> {
        let now = self.clock.now_micros();
        let window_micros = i64::try_from(self.window.as_micros()).unwrap_or(i64::MAX);

        // Members must be unique or two requests in the same microsecond
        // would collapse into one entry.
        let op = SlidingWindowOp {
            now_micros: now,
            window_start_micros: now.saturating_sub(window_micros),
            limit: self.limit,
            ttl: self.window,
            member: format!("{}-{}", now, Uuid::new_v4().simple()),
        };

        let reply = self
            .store
            .record_in_window(&identity.sliding_window_key(), &op)
            .await?;

        let admitted = reply.count < self.limit;
        let remaining = if admitted {
            self.limit - reply.count - 1
        } else {
            0
        };

        trace!(
            identity = %identity,
            count = reply.count,
            limit = self.limit,
            admitted,
            "Sliding window decision"
        );

        Ok(Admission {
            admitted,
            remaining: Remaining::Count(remaining),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryCounterStore;
    use proptest::prelude::*;

    fn limiter(
        limit: u64,
        window_secs: u64,
    ) -> (Arc<ManualClock>, Arc<MemoryCounterStore>, SlidingWindow) {
        let clock = Arc::new(ManualClock::at_secs(1_704_067_200));
        let store = Arc::new(MemoryCounterStore::with_clock(clock.clone()));
        let limiter = SlidingWindow::new(
            store.clone(),
            clock.clone(),
            limit,
            Duration::from_secs(window_secs),
        );
        (clock, store, limiter)
    }

    #[tokio::test]
    async fn test_remaining_counts_down_then_blocks() {
        let (clock, _, limiter) = limiter(3, 10);
        let identity = Identity::new("search", "client");

        for expected in [2, 1, 0] {
            let admission = limiter.allow(&identity).await.unwrap();
            assert!(admission.admitted);
            assert_eq!(admission.remaining, Remaining::Count(expected));
            clock.advance(Duration::from_millis(100));
        }

        let admission = limiter.allow(&identity).await.unwrap();
        assert!(!admission.admitted);
        assert_eq!(admission.remaining, Remaining::Count(0));
    }

    #[tokio::test]
    async fn test_rejected_requests_are_not_logged() {
        let (_, store, limiter) = limiter(2, 10);
        let identity = Identity::new("search", "client");

        for _ in 0..5 {
            limiter.allow(&identity).await.unwrap();
        }

        assert_eq!(store.sorted_set_len(&identity.sliding_window_key()), Some(2));
    }

    #[tokio::test]
    async fn test_slot_frees_once_oldest_entry_leaves_window() {
        let (clock, _, limiter) = limiter(2, 10);
        let identity = Identity::new("search", "client");

        limiter.allow(&identity).await.unwrap();
        clock.advance(Duration::from_secs(4));
        limiter.allow(&identity).await.unwrap();
        assert!(!limiter.allow(&identity).await.unwrap().admitted);

        // First entry is exactly one window old now and no longer counts.
        clock.advance(Duration::from_secs(6));
        let admission = limiter.allow(&identity).await.unwrap();
        assert!(admission.admitted);
        assert_eq!(admission.remaining, Remaining::Count(0));
    }

    #[tokio::test]
    async fn test_no_boundary_burst() {
        let (clock, _, limiter) = limiter(5, 60);
        let identity = Identity::new("strict", "client");

        let mut admitted = 0;
        for _ in 0..5 {
            admitted += limiter.allow(&identity).await.unwrap().admitted as u32;
        }
        clock.advance(Duration::from_secs(1));
        for _ in 0..5 {
            admitted += limiter.allow(&identity).await.unwrap().admitted as u32;
        }

        assert_eq!(admitted, 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_callers_never_exceed_limit() {
        let (_, _, limiter) = limiter(10, 60);
        let limiter = Arc::new(limiter);
        let identity = Identity::new("search", "hot-client");

        let handles: Vec<_> = (0..100)
            .map(|_| {
                let limiter = limiter.clone();
                let identity = identity.clone();
                tokio::spawn(async move { limiter.allow(&identity).await.unwrap().admitted })
            })
            .collect();

        let admitted = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();

        assert_eq!(admitted, 10);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Requests spread across two windows never admit more than `limit`
        /// inside any rolling window.
        #[test]
        fn prop_rolling_window_bound(
            limit in 1u64..8,
            window_secs in 1u64..20,
            gaps in proptest::collection::vec(0u64..3_000, 1..60),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let (clock, _, limiter) = limiter(limit, window_secs);
                let identity = Identity::new("prop", "client");
                let window_micros = (window_secs * 1_000_000) as i64;

                let mut admitted_at = Vec::new();
                for gap in gaps {
                    clock.advance(Duration::from_millis(gap));
                    if limiter.allow(&identity).await.unwrap().admitted {
                        admitted_at.push(clock.now_micros());
                    }
                }

                for (i, start) in admitted_at.iter().enumerate() {
                    let in_window = admitted_at[i..]
                        .iter()
                        .take_while(|t| **t - *start < window_micros)
                        .count() as u64;
                    prop_assert!(in_window <= limit);
                }
                Ok(())
            })?;
        }
    }
}
