//! Token bucket.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use super::algorithm::Algorithm;
use super::identity::Identity;
use super::limiter::{Admission, Limiter, Remaining};
use crate::clock::Clock;
use crate::store::{CounterStore, StoreError, TokenBucketOp};

/// Expiry for the state of identities that stop calling.
pub const DEFAULT_BUCKET_TTL: Duration = Duration::from_secs(3600);

/// Each identity holds up to `capacity` tokens, refilled continuously at
/// `refill_rate` per second. A request is admitted if it can take one whole
/// token. A never-seen identity starts with a full bucket.
pub struct TokenBucket {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    capacity: f64,
    refill_rate: f64,
    ttl: Duration,
}

impl TokenBucket {
    pub fn new(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        capacity: f64,
        refill_rate: f64,
    ) -> Self {
        Self {
            store,
            clock,
            capacity,
            refill_rate,
            ttl: DEFAULT_BUCKET_TTL,
        }
    }

    /// Bucket holding `limit` tokens that refills completely over `window`.
    pub fn for_window(
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        limit: u64,
        window: Duration,
    ) -> Self {
        let capacity = limit as f64;
        let refill_rate = capacity / window.as_secs_f64().max(1.0);
        Self::new(store, clock, capacity, refill_rate)
    }

    /// Override how long idle bucket state is kept.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }
}

#[async_trait]
impl Limiter for TokenBucket {
    fn algorithm(&self) -> Algorithm {
        Algorithm::TokenBucket
    }

    async fn allow(&self, identity: &Identity) -> Result<Admission, StoreError> {
        let op = TokenBucketOp {
            capacity: self.capacity,
            refill_rate: self.refill_rate,
            now_micros: self.clock.now_micros(),
            ttl: self.ttl,
        };

        let reply = self.store.take_token(&identity.bucket_keys(), &op).await?;

        trace!(
            identity = %identity,
            tokens = reply.tokens,
            capacity = self.capacity,
            admitted = reply.allowed,
            "Token bucket decision"
        );

        Ok(Admission {
            admitted: reply.allowed,
            remaining: Remaining::Tokens(reply.tokens),
        })
    }
}
