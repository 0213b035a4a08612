//! Fixed window counting.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use super::algorithm::Algorithm;
use super::identity::Identity;
use super::limiter::{Admission, Limiter, Remaining};
use crate::clock::Clock;
use crate::store::{CounterStore, StoreError};

/// Admits up to `limit` requests per identity in each window aligned to the
/// epoch (`floor(now / window) * window`).
///
/// The counter for a window expires when the window ends. A burst just before
/// and just after a boundary lands in two windows, so up to `2 * limit`
/// requests can be admitted within a short span.
pub struct FixedWindow {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    limit: u64,
    window: Duration,
}

impl FixedWindow {
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

    /// Start of the window containing `now_secs`, in Unix seconds.
    pub fn window_start(&self, now_secs: i64) -> i64 {
        let window = self.window.as_secs().max(1) as i64;
        now_secs.div_euclid(window) * window
    }
}

#[async_trait]
impl Limiter for FixedWindow {
    fn algorithm(&self) -> Algorithm {
        Algorithm::FixedWindow
    }

    async fn allow(&self, identity: &Identity) -> Result<Admission, StoreError> {
        let window_start = self.window_start(self.clock.now_secs());
        let key = identity.fixed_window_key(window_start);

        let count = self.store.incr_window(&key, self.window).await?;
        let admitted = count <= self.limit;

        trace!(
            identity = %identity,
            window_start,
            count,
            limit = self.limit,
            admitted,
            "Fixed window decision"
        );

        Ok(Admission {
            admitted,
            remaining: Remaining::Count(self.limit.saturating_sub(count)),
        })
    }
}
