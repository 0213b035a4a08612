//! Shared counter store and the atomic operations the limiters run against it.
//!
//! Every operation on [`CounterStore`] is one indivisible read-decide-write
//! sequence against one key (or one fixed pair of keys). Implementations must
//! never split an operation into a separate read and write: that reintroduces
//! the check-then-act race the limiters exist to avoid.

mod memory;
mod redis_store;
pub mod scripts;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use self::memory::MemoryCounterStore;
pub use self::redis_store::RedisCounterStore;

/// Errors from the counter store.
///
/// All variants mean the admission outcome is unknown: the caller must not
/// treat the request as either admitted or blocked.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or dropped the connection.
    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    /// The store did not answer within the command timeout.
    #[error("counter store timed out after {0:?}")]
    Timeout(Duration),

    /// The store rejected or failed the atomic script.
    #[error("atomic script failed: {0}")]
    Script(String),

    /// The store answered with something the limiter cannot interpret.
    #[error("unexpected reply from counter store: {0}")]
    Reply(String),
}

/// Arguments for one sliding-window admission.
#[derive(Debug, Clone)]
pub struct SlidingWindowOp {
    /// Score for the new entry, in microseconds.
    pub now_micros: i64,
    /// Entries scored at or below this are purged before counting.
    pub window_start_micros: i64,
    /// Maximum entries allowed in the window.
    pub limit: u64,
    /// Expiry refreshed on the set whenever an entry is inserted.
    pub ttl: Duration,
    /// Unique member name for the new entry.
    pub member: String,
}

/// Outcome of a sliding-window admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingWindowReply {
    /// Entries in the window after the purge and before any insert.
    pub count: u64,
    /// Whether a new entry was inserted (count was below the limit).
    pub inserted: bool,
}

/// The two keys holding one token bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketKeys {
    pub tokens: String,
    pub last_refill: String,
}

/// Arguments for one token-bucket admission.
#[derive(Debug, Clone, Copy)]
pub struct TokenBucketOp {
    /// Maximum tokens the bucket holds; a new bucket starts full.
    pub capacity: f64,
    /// Tokens added per second.
    pub refill_rate: f64,
    /// Current time in microseconds.
    pub now_micros: i64,
    /// Expiry applied to both keys on every write.
    pub ttl: Duration,
}

/// Outcome of a token-bucket admission.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketReply {
    pub allowed: bool,
    /// Tokens left after the decision.
    pub tokens: f64,
}

/// A keyed store able to run each limiter's decision atomically.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment `key` and return the new count. The first increment also sets
    /// the key to expire after `ttl`.
    async fn incr_window(&self, key: &str, ttl: Duration) -> Result<u64, StoreError>;

    /// Purge expired entries from the sorted set at `key`, count the rest and
    /// insert a new entry only if the count is below the limit.
    async fn record_in_window(
        &self,
        key: &str,
        op: &SlidingWindowOp,
    ) -> Result<SlidingWindowReply, StoreError>;

    /// Refill the bucket held in `keys`, take one token if available and
    /// persist the new state.
    async fn take_token(
        &self,
        keys: &BucketKeys,
        op: &TokenBucketOp,
    ) -> Result<TokenBucketReply, StoreError>;

    /// Check the store is reachable.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Token-bucket refill shared by the in-memory store and the tests; the Lua
/// script performs the same arithmetic server-side.
pub(crate) fn refill_and_take(
    tokens: f64,
    last_refill_micros: i64,
    op: &TokenBucketOp,
) -> TokenBucketReply {
    let elapsed_secs = (op.now_micros - last_refill_micros).max(0) as f64 / 1_000_000.0;
    let mut tokens = (tokens + elapsed_secs * op.refill_rate).min(op.capacity);

    let allowed = tokens >= 1.0;
    if allowed {
        tokens -= 1.0;
    }

    TokenBucketReply { allowed, tokens }
}
