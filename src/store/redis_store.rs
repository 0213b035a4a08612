//! Redis-backed counter store running the limiter scripts server-side.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{ErrorKind, RedisError, Script};
use tracing::{debug, info, warn};

use super::scripts;
use super::{
    BucketKeys, CounterStore, SlidingWindowOp, SlidingWindowReply, StoreError, TokenBucketOp,
    TokenBucketReply,
};
use crate::config::StoreConfig;

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        if err.is_timeout() {
            return StoreError::Unavailable(format!("timeout: {}", err));
        }
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            return StoreError::Unavailable(err.to_string());
        }
        match err.kind() {
            ErrorKind::TypeError => StoreError::Reply(err.to_string()),
            _ => StoreError::Script(err.to_string()),
        }
    }
}

/// Counter store backed by a shared Redis instance.
///
/// The connection manager multiplexes all callers over one connection and
/// reconnects on failure; it is cheap to clone per call.
#[derive(Clone)]
pub struct RedisCounterStore {
    conn: ConnectionManager,
    fixed_window: Script,
    sliding_window: Script,
    token_bucket: Script,
    command_timeout: Duration,
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("command_timeout", &self.command_timeout)
            .finish()
    }
}

impl RedisCounterStore {
    /// Open a managed connection to `url`.
    pub async fn connect(url: &str, command_timeout: Duration) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;

        Ok(Self {
            conn,
            fixed_window: Script::new(scripts::FIXED_WINDOW),
            sliding_window: Script::new(scripts::SLIDING_WINDOW),
            token_bucket: Script::new(scripts::TOKEN_BUCKET),
            command_timeout,
        })
    }

    /// Connect and ping, retrying a bounded number of times.
    ///
    /// Used at startup where the store may come up after this process (for
    /// example while its DNS name is still propagating).
    pub async fn connect_with_retry(config: &StoreConfig) -> Result<Self, StoreError> {
        let timeout = Duration::from_millis(config.command_timeout_ms);
        let backoff = Duration::from_millis(config.connect_backoff_ms);
        let attempts = config.connect_attempts.max(1);

        let mut last_err = None;
        for attempt in 1..=attempts {
            let result = match Self::connect(&config.redis_url, timeout).await {
                Ok(store) => store.ping().await.map(|_| store),
                Err(e) => Err(e),
            };

            match result {
                Ok(store) => {
                    info!(url = %config.redis_url, attempt, "Connected to counter store");
                    return Ok(store);
                }
                Err(e) => {
                    warn!(
                        url = %config.redis_url,
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "Counter store connection attempt failed"
                    );
                    last_err = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| StoreError::Unavailable("no connection attempts made".into())))
    }

    /// Bound a store round trip by the command timeout.
    ///
    /// On timeout the future is dropped; a script already delivered to Redis
    /// still runs to completion there.
    async fn bounded<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, RedisError>>,
    {
        match tokio::time::timeout(self.command_timeout, fut).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(self.command_timeout)),
        }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn incr_window(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let count: u64 = self
            .bounded(
                self.fixed_window
                    .key(key)
                    .arg(ttl.as_secs().max(1))
                    .invoke_async(&mut conn),
            )
            .await?;

        debug!(key = %key, count, "Fixed window incremented");
        Ok(count)
    }

    async fn record_in_window(
        &self,
        key: &str,
        op: &SlidingWindowOp,
    ) -> Result<SlidingWindowReply, StoreError> {
        let mut conn = self.conn.clone();
        let (count, inserted): (u64, i64) = self
            .bounded(
                self.sliding_window
                    .key(key)
                    .arg(op.now_micros)
                    .arg(op.window_start_micros)
                    .arg(op.limit)
                    .arg(op.ttl.as_secs().max(1))
                    .arg(&op.member)
                    .invoke_async(&mut conn),
            )
            .await?;

        debug!(key = %key, count, inserted, "Sliding window evaluated");
        Ok(SlidingWindowReply {
            count,
            inserted: inserted == 1,
        })
    }

    async fn take_token(
        &self,
        keys: &BucketKeys,
        op: &TokenBucketOp,
    ) -> Result<TokenBucketReply, StoreError> {
        let mut conn = self.conn.clone();
        let (allowed, tokens): (i64, String) = self
            .bounded(
                self.token_bucket
                    .key(&keys.tokens)
                    .key(&keys.last_refill)
                    .arg(op.capacity)
                    .arg(op.refill_rate)
                    .arg(op.now_micros)
                    .arg(op.ttl.as_secs().max(1))
                    .invoke_async(&mut conn),
            )
            .await?;

        let tokens: f64 = tokens
            .parse()
            .map_err(|_| StoreError::Reply(format!("token count {:?} is not a number", tokens)))?;

        debug!(key = %keys.tokens, allowed, tokens, "Token bucket evaluated");
        Ok(TokenBucketReply {
            allowed: allowed == 1,
            tokens,
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = self
            .bounded(redis::cmd("PING").query_async(&mut conn))
            .await?;
        Ok(())
    }
}
