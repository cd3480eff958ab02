/**
 * TTL CACHE - Memoized backend reads with request coalescing
 *
 * ROLE :
 * Wraps every expensive producer (CLI calls, aggregated summaries) behind a
 * per-key freshness window.
 *
 * FONCTIONNEMENT :
 * - fresh entry (now - produced_at < ttl) => returned as-is, producer untouched
 * - otherwise, if a computation for the key is in flight => every caller awaits
 *   that same computation (at most one producer invocation per key at a time)
 * - otherwise a new computation is spawned and registered as in flight
 * - success replaces the entry; failure caches nothing and leaves the previous
 *   entry readable through `peek` for callers that want a stale fallback
 * - `invalidate` drops entries and in-flight markers; a computation whose
 *   marker was dropped finishes for its own waiters but is not stored
 */

use futures::future::{BoxFuture, FutureExt, Shared as SharedFuture};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::clock::{duration_ms, SharedClock};
use crate::error::{OpsError, OpsResult};
use crate::state::{new_state, Shared};

type Computation<V> = SharedFuture<BoxFuture<'static, OpsResult<V>>>;

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    pub produced_at_ms: i64,
}

struct InFlight<V> {
    generation: u64,
    computation: Computation<V>,
}

enum Lookup<V> {
    Hit(V),
    Join(Computation<V>),
    Miss,
}

struct CacheTable<V> {
    entries: HashMap<String, CacheEntry<V>>,
    inflight: HashMap<String, InFlight<V>>,
    next_generation: u64,
}

pub struct TtlCache<V> {
    table: Shared<CacheTable<V>>,
    clock: SharedClock,
}

impl<V> TtlCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(clock: SharedClock) -> Self {
        Self {
            table: new_state(CacheTable {
                entries: HashMap::new(),
                inflight: HashMap::new(),
                next_generation: 0,
            }),
            clock,
        }
    }

    /// Returns the cached value for `key`, or the result of the (shared) producer call.
    pub async fn get<F, Fut>(&self, key: &str, ttl: Duration, producer: F) -> OpsResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = OpsResult<V>> + Send + 'static,
    {
        let first = self.lookup(&self.table.lock(), key, ttl);
        match first {
            Lookup::Hit(value) => return Ok(value),
            Lookup::Join(computation) => return computation.await,
            Lookup::Miss => {}
        }

        // Producer future is built outside the lock, then registered only if
        // nobody raced us to it. An unregistered candidate is dropped unpolled.
        let candidate = producer();

        let computation = {
            let mut table = self.table.lock();
            match self.lookup(&table, key, ttl) {
                Lookup::Hit(value) => return Ok(value),
                Lookup::Join(computation) => computation,
                Lookup::Miss => {
                    table.next_generation += 1;
                    let generation = table.next_generation;
                    let computation = self.spawn(key.to_string(), generation, candidate);
                    table.inflight.insert(
                        key.to_string(),
                        InFlight { generation, computation: computation.clone() },
                    );
                    debug!("[cache] computing {} (generation {})", key, generation);
                    computation
                }
            }
        };

        computation.await
    }

    fn lookup(&self, table: &CacheTable<V>, key: &str, ttl: Duration) -> Lookup<V> {
        let now_ms = self.clock.now_ms();
        if let Some(entry) = table.entries.get(key) {
            if now_ms - entry.produced_at_ms < duration_ms(ttl) {
                return Lookup::Hit(entry.value.clone());
            }
        }
        match table.inflight.get(key) {
            Some(flight) => Lookup::Join(flight.computation.clone()),
            None => Lookup::Miss,
        }
    }

    fn spawn<Fut>(&self, key: String, generation: u64, producer: Fut) -> Computation<V>
    where
        Fut: Future<Output = OpsResult<V>> + Send + 'static,
    {
        let table = self.table.clone();
        let clock = self.clock.clone();
        let handle = tokio::spawn(async move {
            let result = producer.await;
            let mut table = table.lock();
            let still_current = table
                .inflight
                .get(&key)
                .map(|f| f.generation == generation)
                .unwrap_or(false);
            if still_current {
                table.inflight.remove(&key);
                if let Ok(value) = &result {
                    table.entries.insert(
                        key.clone(),
                        CacheEntry { key, value: value.clone(), produced_at_ms: clock.now_ms() },
                    );
                }
            }
            result
        });

        async move {
            handle
                .await
                .unwrap_or_else(|e| Err(OpsError::UpstreamFailed(format!("producer task aborted: {e}"))))
        }
        .boxed()
        .shared()
    }

    /// Last stored value for `key`, whatever its age.
    pub fn peek(&self, key: &str) -> Option<V> {
        self.table.lock().entries.get(key).map(|e| e.value.clone())
    }

    pub fn entry(&self, key: &str) -> Option<CacheEntry<V>> {
        self.table.lock().entries.get(key).cloned()
    }

    /// Drops the given keys (entries and in-flight markers).
    pub fn invalidate(&self, keys: &[&str]) {
        let mut table = self.table.lock();
        for key in keys {
            table.entries.remove(*key);
            table.inflight.remove(*key);
        }
        debug!("[cache] invalidated {:?}", keys);
    }

    pub fn invalidate_all(&self) {
        let mut table = self.table.lock();
        table.entries.clear();
        table.inflight.clear();
        debug!("[cache] cleared");
    }

    pub fn len(&self) -> usize {
        self.table.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self, key: &str) -> bool {
        self.table.lock().inflight.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::Notify;

    const TTL: Duration = Duration::from_secs(15);

    fn cache() -> (Arc<TtlCache<u32>>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        (Arc::new(TtlCache::new(clock.clone())), clock)
    }

    async fn counted(cache: &TtlCache<u32>, key: &str, calls: &Arc<AtomicUsize>, value: u32) -> OpsResult<u32> {
        let calls = calls.clone();
        cache
            .get(key, TTL, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(value)
            })
            .await
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_producer_call() {
        let (cache, _clock) = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get("status", TTL, move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        gate.notified().await;
                        Ok(42)
                    })
                    .await
            }));
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.in_flight("status"));
        gate.notify_one();

        for h in handles {
            assert_eq!(h.await.unwrap(), Ok(42));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!cache.in_flight("status"));
    }

    #[tokio::test]
    async fn test_fresh_entry_skips_producer_until_ttl_elapses() {
        let (cache, clock) = cache();
        let calls = Arc::new(AtomicUsize::new(0));

        assert_eq!(counted(&cache, "crons", &calls, 1).await, Ok(1));
        clock.advance(Duration::from_secs(14));
        assert_eq!(counted(&cache, "crons", &calls, 2).await, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        clock.advance(Duration::from_secs(1));
        assert_eq!(counted(&cache, "crons", &calls, 3).await, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_recompute_for_that_key_only() {
        let (cache, _clock) = cache();
        let calls = Arc::new(AtomicUsize::new(0));

        counted(&cache, "a", &calls, 1).await.unwrap();
        counted(&cache, "b", &calls, 1).await.unwrap();
        cache.invalidate(&["a"]);

        assert_eq!(counted(&cache, "a", &calls, 5).await, Ok(5));
        assert_eq!(counted(&cache, "b", &calls, 5).await, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        cache.invalidate_all();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_failure_is_propagated_and_not_cached() {
        let (cache, clock) = cache();
        let calls = Arc::new(AtomicUsize::new(0));
        counted(&cache, "status", &calls, 7).await.unwrap();
        clock.advance(Duration::from_secs(60));

        let err = cache
            .get("status", TTL, || async { Err(OpsError::UpstreamTimeout("gateway".into())) })
            .await;
        assert_eq!(err, Err(OpsError::UpstreamTimeout("gateway".into())));
        assert!(!cache.in_flight("status"));
        // stale value stays readable for fallback
        assert_eq!(cache.peek("status"), Some(7));

        assert_eq!(counted(&cache, "status", &calls, 8).await, Ok(8));
    }

    #[tokio::test]
    async fn test_invalidate_during_flight_starts_new_computation() {
        let (cache, _clock) = cache();
        let gate = Arc::new(Notify::new());

        let slow = {
            let cache = cache.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                cache
                    .get("k", TTL, move || async move {
                        gate.notified().await;
                        Ok(1)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.invalidate(&["k"]);

        let calls = Arc::new(AtomicUsize::new(0));
        assert_eq!(counted(&cache, "k", &calls, 2).await, Ok(2));

        gate.notify_one();
        assert_eq!(slow.await.unwrap(), Ok(1));
        // the superseded computation does not overwrite the newer entry
        assert_eq!(cache.peek("k"), Some(2));
    }
}
