//! In-process counter store.
//!
//! Every operation holds one store-wide lock for its whole read-decide-write
//! sequence, the same serialization Redis gives a script. Useful for a single
//! instance deployment and for exercising the limiters in tests.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    refill_and_take, BucketKeys, CounterStore, SlidingWindowOp, SlidingWindowReply, StoreError,
    TokenBucketOp, TokenBucketReply,
};
use crate::clock::{Clock, SystemClock};

#[derive(Debug)]
enum Value {
    Counter(u64),
    /// (score, member), ordered by score.
    SortedSet(BTreeSet<(i64, String)>),
    Float(f64),
    Int(i64),
}

#[derive(Debug)]
struct Slot {
    value: Value,
    expires_at_micros: Option<i64>,
}

fn deadline(now_micros: i64, ttl: Duration) -> i64 {
    let ttl = i64::try_from(ttl.as_micros()).unwrap_or(i64::MAX);
    now_micros.saturating_add(ttl)
}

#[derive(Debug, Default)]
struct Keyspace {
    slots: HashMap<String, Slot>,
    /// (deadline, key) for every slot with an expiry, soonest first.
    expiries: BTreeSet<(i64, String)>,
}

impl Keyspace {
    /// Drop every key whose deadline has passed. Runs before each operation,
    /// so keys nobody touches again are still reclaimed.
    fn sweep(&mut self, now_micros: i64) {
        while self
            .expiries
            .first()
            .is_some_and(|(at, _)| *at <= now_micros)
        {
            if let Some((_, key)) = self.expiries.pop_first() {
                self.slots.remove(&key);
            }
        }
    }

    /// Replace whatever is at `key`.
    fn insert(&mut self, key: &str, value: Value, expires_at_micros: Option<i64>) {
        self.remove(key);
        if let Some(at) = expires_at_micros {
            self.expiries.insert((at, key.to_string()));
        }
        self.slots.insert(
            key.to_string(),
            Slot {
                value,
                expires_at_micros,
            },
        );
    }

    fn set_expiry(&mut self, key: &str, at: i64) {
        let Some(slot) = self.slots.get_mut(key) else {
            return;
        };
        if let Some(old) = slot.expires_at_micros.replace(at) {
            self.expiries.remove(&(old, key.to_string()));
        }
        self.expiries.insert((at, key.to_string()));
    }

    fn remove(&mut self, key: &str) {
        if let Some(Slot {
            expires_at_micros: Some(at),
            ..
        }) = self.slots.remove(key)
        {
            self.expiries.remove(&(at, key.to_string()));
        }
    }
}

/// Counter store kept in this process.
#[derive(Debug)]
pub struct MemoryCounterStore {
    keyspace: Mutex<Keyspace>,
    clock: Arc<dyn Clock>,
}

impl MemoryCounterStore {
    /// Create an empty store using the system clock for key expiry.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store that expires keys according to `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            keyspace: Mutex::new(Keyspace::default()),
            clock,
        }
    }

    /// Number of entries in the sorted set at `key`, if there is one.
    pub fn sorted_set_len(&self, key: &str) -> Option<usize> {
        let now = self.clock.now_micros();
        let mut keyspace = self.keyspace.lock();
        keyspace.sweep(now);
        match keyspace.slots.get(key).map(|slot| &slot.value) {
            Some(Value::SortedSet(set)) => Some(set.len()),
            _ => None,
        }
    }

    /// Remaining time to live of `key`.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now_micros();
        let mut keyspace = self.keyspace.lock();
        keyspace.sweep(now);
        let at = keyspace.slots.get(key)?.expires_at_micros?;
        Some(Duration::from_micros((at - now).max(0) as u64))
    }
}

impl Default for MemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Script(format!(
        "WRONGTYPE operation against key {} holding the wrong kind of value",
        key
    ))
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn incr_window(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let now = self.clock.now_micros();
        let mut keyspace = self.keyspace.lock();
        keyspace.sweep(now);

        if let Some(slot) = keyspace.slots.get_mut(key) {
            return match &mut slot.value {
                Value::Counter(count) => {
                    *count += 1;
                    Ok(*count)
                }
                _ => Err(wrong_type(key)),
            };
        }

        keyspace.insert(key, Value::Counter(1), Some(deadline(now, ttl)));
        Ok(1)
    }

    async fn record_in_window(
        &self,
        key: &str,
        op: &SlidingWindowOp,
    ) -> Result<SlidingWindowReply, StoreError> {
        let now = self.clock.now_micros();
        let mut keyspace = self.keyspace.lock();
        keyspace.sweep(now);

        if !keyspace.slots.contains_key(key) {
            keyspace.insert(key, Value::SortedSet(BTreeSet::new()), None);
        }
        let Some(Slot {
            value: Value::SortedSet(set),
            ..
        }) = keyspace.slots.get_mut(key)
        else {
            return Err(wrong_type(key));
        };

        set.retain(|(score, _)| *score > op.window_start_micros);
        let count = set.len() as u64;

        let inserted = count < op.limit;
        if inserted {
            set.insert((op.now_micros, op.member.clone()));
            keyspace.set_expiry(key, deadline(now, op.ttl));
        } else if count == 0 {
            // An empty set does not exist in Redis either.
            keyspace.remove(key);
        }

        Ok(SlidingWindowReply { count, inserted })
    }

    async fn take_token(
        &self,
        keys: &BucketKeys,
        op: &TokenBucketOp,
    ) -> Result<TokenBucketReply, StoreError> {
        let now = self.clock.now_micros();
        let mut keyspace = self.keyspace.lock();
        keyspace.sweep(now);

        let tokens = match keyspace.slots.get(&keys.tokens).map(|s| &s.value) {
            Some(Value::Float(tokens)) => *tokens,
            Some(_) => return Err(wrong_type(&keys.tokens)),
            None => op.capacity,
        };
        let last_refill = match keyspace.slots.get(&keys.last_refill).map(|s| &s.value) {
            Some(Value::Int(at)) => *at,
            Some(_) => return Err(wrong_type(&keys.last_refill)),
            None => op.now_micros,
        };

        let reply = refill_and_take(tokens, last_refill, op);

        let expires_at = Some(deadline(now, op.ttl));
        keyspace.insert(&keys.tokens, Value::Float(reply.tokens), expires_at);
        keyspace.insert(&keys.last_refill, Value::Int(op.now_micros), expires_at);

        Ok(reply)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store_at(secs: i64) -> (Arc<ManualClock>, MemoryCounterStore) {
        let clock = Arc::new(ManualClock::at_secs(secs));
        let store = MemoryCounterStore::with_clock(clock.clone());
        (clock, store)
    }

    fn sliding_op(now_micros: i64, window: Duration, limit: u64, member: &str) -> SlidingWindowOp {
        SlidingWindowOp {
            now_micros,
            window_start_micros: now_micros - window.as_micros() as i64,
            limit,
            ttl: window,
            member: member.to_string(),
        }
    }

    /// Keys physically held, expired or not.
    fn held(store: &MemoryCounterStore) -> (usize, usize) {
        let keyspace = store.keyspace.lock();
        (keyspace.slots.len(), keyspace.expiries.len())
    }

    #[tokio::test]
    async fn test_incr_sets_expiry_on_first_increment_only() {
        let (clock, store) = store_at(1_000);
        let ttl = Duration::from_secs(60);

        assert_eq!(store.incr_window("k", ttl).await.unwrap(), 1);
        clock.advance(Duration::from_secs(10));
        assert_eq!(store.incr_window("k", ttl).await.unwrap(), 2);

        // Expiry still counts from the first increment.
        assert_eq!(store.ttl("k"), Some(Duration::from_secs(50)));
    }

    #[tokio::test]
    async fn test_incr_restarts_after_expiry() {
        let (clock, store) = store_at(1_000);
        let ttl = Duration::from_secs(60);

        store.incr_window("k", ttl).await.unwrap();
        store.incr_window("k", ttl).await.unwrap();
        clock.advance(ttl);

        assert_eq!(store.incr_window("k", ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sliding_window_leaves_full_set_untouched() {
        let (clock, store) = store_at(1_000);
        let window = Duration::from_secs(10);

        for i in 0..2 {
            let now = clock.now_micros();
            let reply = store
                .record_in_window("s", &sliding_op(now, window, 2, &format!("m{}", i)))
                .await
                .unwrap();
            assert!(reply.inserted);
            clock.advance(Duration::from_millis(1));
        }

        let now = clock.now_micros();
        let reply = store
            .record_in_window("s", &sliding_op(now, window, 2, "m2"))
            .await
            .unwrap();
        assert_eq!(reply, SlidingWindowReply { count: 2, inserted: false });
        assert_eq!(store.sorted_set_len("s"), Some(2));
    }

    #[tokio::test]
    async fn test_sliding_window_same_microsecond_members_both_count() {
        let (clock, store) = store_at(1_000);
        let now = clock.now_micros();
        let window = Duration::from_secs(10);

        store.record_in_window("s", &sliding_op(now, window, 5, "a")).await.unwrap();
        store.record_in_window("s", &sliding_op(now, window, 5, "b")).await.unwrap();

        assert_eq!(store.sorted_set_len("s"), Some(2));
    }

    #[tokio::test]
    async fn test_wrong_type_is_a_script_error() {
        let (_clock, store) = store_at(1_000);
        store.incr_window("k", Duration::from_secs(5)).await.unwrap();

        let result = store
            .record_in_window("k", &sliding_op(1_000_000_000, Duration::from_secs(5), 1, "m"))
            .await;
        assert!(matches!(result, Err(StoreError::Script(_))));
    }

    #[tokio::test]
    async fn test_token_bucket_state_expires() {
        let (clock, store) = store_at(1_000);
        let keys = BucketKeys {
            tokens: "b:tokens".into(),
            last_refill: "b:last_refill".into(),
        };
        let op = |now_micros| TokenBucketOp {
            capacity: 2.0,
            refill_rate: 0.0,
            now_micros,
            ttl: Duration::from_secs(3600),
        };

        store.take_token(&keys, &op(clock.now_micros())).await.unwrap();
        store.take_token(&keys, &op(clock.now_micros())).await.unwrap();
        let drained = store.take_token(&keys, &op(clock.now_micros())).await.unwrap();
        assert!(!drained.allowed);

        // With no refill the bucket only recovers once the keys expire.
        clock.advance(Duration::from_secs(3600));
        let fresh = store.take_token(&keys, &op(clock.now_micros())).await.unwrap();
        assert!(fresh.allowed);
        assert_eq!(fresh.tokens, 1.0);
    }

    #[tokio::test]
    async fn test_past_windows_are_reclaimed() {
        let (clock, store) = store_at(1_704_067_200);
        let window = Duration::from_secs(60);

        for i in 0..1000 {
            let start = clock.now_secs() / 60 * 60;
            let key = format!("fixed:default:alice:{}", start);
            assert_eq!(store.incr_window(&key, window).await.unwrap(), 1, "window {i}");
            clock.advance(window);
        }

        // Only the last window's key survives, and it goes on the next sweep.
        assert_eq!(held(&store), (1, 1));
        assert_eq!(store.ttl("fixed:default:alice:0"), None);
        assert_eq!(held(&store), (0, 0));
    }

    #[tokio::test]
    async fn test_idle_sliding_and_bucket_keys_are_reclaimed() {
        let (clock, store) = store_at(1_000);
        let window = Duration::from_secs(10);
        let keys = BucketKeys {
            tokens: "b:tokens".into(),
            last_refill: "b:last_refill".into(),
        };
        let op = TokenBucketOp {
            capacity: 5.0,
            refill_rate: 1.0,
            now_micros: clock.now_micros(),
            ttl: Duration::from_secs(60),
        };

        for i in 0..3 {
            let now = clock.now_micros();
            store
                .record_in_window("s", &sliding_op(now, window, 5, &format!("m{}", i)))
                .await
                .unwrap();
            clock.advance(Duration::from_secs(1));
        }
        store.take_token(&keys, &op).await.unwrap();
        assert_eq!(held(&store), (3, 3));

        // Refreshing an expiry replaces the old index entry.
        clock.advance(Duration::from_secs(8));
        assert_eq!(store.ttl("s"), Some(Duration::from_secs(1)));
        assert_eq!(held(&store), (3, 3));

        clock.advance(Duration::from_secs(60));
        let other = store.incr_window("k", window).await.unwrap();
        assert_eq!(other, 1);
        assert_eq!(held(&store), (1, 1));
    }
}
