use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;

use crate::clock::Clock;
use crate::model::OrderTicket;

/// Default lifetime of a cached submission result.
pub const DEFAULT_TTL_MS: i64 = 60_000;

/// Default width of the order dedup window in seconds.
pub const DEFAULT_WINDOW_SECS: i64 = 60;

#[derive(Debug, Clone)]
enum Slot<V> {
    /// The guarded operation has started but not yet resolved. Invisible
    /// to `get`/`has`; blocks a second executor for the same key.
    InFlight { started_at: i64, ttl_ms: i64 },
    Ready {
        value: V,
        created_at: i64,
        ttl_ms: i64,
    },
}

impl<V> Slot<V> {
    fn expired(&self, now: i64) -> bool {
        match self {
            Slot::InFlight { started_at, ttl_ms } => now - started_at > *ttl_ms,
            Slot::Ready {
                created_at, ttl_ms, ..
            } => now - created_at > *ttl_ms,
        }
    }
}

/// What an occupying slot resolved to when a new executor tried to claim
/// its key.
enum Existing<V> {
    Fresh(V),
    Pending,
}

#[derive(Debug, Error, PartialEq)]
pub enum IdempotencyError<E> {
    /// Another caller is still executing the guarded operation for this key.
    #[error("operation already in flight for this key")]
    InFlight,
    /// The guarded operation failed; nothing was cached, so the next call
    /// with the same key retries.
    #[error("guarded operation failed: {0}")]
    Operation(E),
}

/// In-memory TTL cache guaranteeing at-most-one logical execution of a
/// side-effecting operation per key within a bounded time window.
///
/// Expiry is checked lazily on every read, so a stale value is never
/// returned even if no sweeper is running. An expired entry is treated
/// as absent regardless of whether physical removal has happened yet.
pub struct IdempotencyCache<V> {
    entries: DashMap<String, Slot<V>>,
    clock: Arc<dyn Clock>,
}

impl<V: Clone + Send + Sync + 'static> IdempotencyCache<V> {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Store `value` under `key`, starting a fresh TTL window. Overwrites
    /// any previous entry for the key, including an in-flight marker.
    pub fn set(&self, key: &str, value: V, ttl_ms: i64) {
        self.entries.insert(
            key.to_string(),
            Slot::Ready {
                value,
                created_at: self.clock.now_millis(),
                ttl_ms,
            },
        );
    }

    /// Fetch the cached value, treating expired entries as absent.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now_millis();
        let hit = {
            let slot = self.entries.get(key)?;
            match slot.value() {
                Slot::Ready {
                    value,
                    created_at,
                    ttl_ms,
                } if now - *created_at <= *ttl_ms => Some(value.clone()),
                _ => None,
            }
        };
        if hit.is_none() {
            // Evict whatever expired under this key now that the read
            // guard is released.
            self.entries.remove_if(key, |_, slot| slot.expired(now));
        }
        hit
    }

    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.entries.len();
        self.entries.retain(|_, slot| !slot.expired(now));
        before - self.entries.len()
    }

    /// Execute `op` at most once per key window.
    ///
    /// A fresh cached value is returned without invoking `op`. Otherwise
    /// the key is claimed atomically before `op` runs; a concurrent call
    /// for the same key observes the claim and receives
    /// [`IdempotencyError::InFlight`] instead of executing a duplicate.
    /// Only a successful result is cached; on failure the claim is
    /// released so the next call retries.
    pub async fn with_idempotency<F, Fut, E>(
        &self,
        key: &str,
        ttl_ms: i64,
        op: F,
    ) -> Result<V, IdempotencyError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let now = self.clock.now_millis();

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let existing = if occupied.get().expired(now) {
                    None
                } else {
                    match occupied.get() {
                        Slot::Ready { value, .. } => Some(Existing::Fresh(value.clone())),
                        Slot::InFlight { .. } => Some(Existing::Pending),
                    }
                };
                match existing {
                    Some(Existing::Fresh(value)) => return Ok(value),
                    Some(Existing::Pending) => return Err(IdempotencyError::InFlight),
                    None => {
                        // Expired remnant: reclaim the key.
                        occupied.insert(Slot::InFlight {
                            started_at: now,
                            ttl_ms,
                        });
                    }
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::InFlight {
                    started_at: now,
                    ttl_ms,
                });
            }
        }

        match op().await {
            Ok(value) => {
                self.set(key, value.clone(), ttl_ms);
                Ok(value)
            }
            Err(e) => {
                self.entries
                    .remove_if(key, |_, slot| matches!(slot, Slot::InFlight { .. }));
                Err(IdempotencyError::Operation(e))
            }
        }
    }
}

/// Periodic purge so the map does not grow unboundedly between reads.
/// Lazy expiry in `get` stays authoritative either way.
pub fn spawn_sweeper<V: Clone + Send + Sync + 'static>(
    cache: Arc<IdempotencyCache<V>>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            let purged = cache.purge_expired();
            if purged > 0 {
                debug!(purged, "idempotency sweep evicted expired entries");
            }
        }
    })
}

// --- Order key derivation ---

/// FNV-1a, 32-bit. The key space is low-cardinality and a collision only
/// collapses an order into an earlier identical-looking one, never a
/// spurious execution. Not a security control.
fn fnv1a_32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for b in bytes {
        hash ^= u32::from(*b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Derive the dedup key for an order ticket.
///
/// Deterministic over (actor, workspace, instrument, side, quantity) plus
/// the current time bucket, so two rapid duplicate submissions collapse to
/// one logical order while a deliberate resubmission in the next window is
/// treated as distinct.
pub fn derive_order_key(ticket: &OrderTicket, now_ms: i64, window_secs: i64) -> String {
    let bucket = (now_ms / 1000) / window_secs.max(1);
    let raw = format!(
        "{}|{}|{}|{}|{}|{}",
        ticket.account_id,
        ticket.workspace_id,
        ticket.symbol,
        ticket.side,
        ticket.quantity.normalize(),
        bucket
    );
    format!("{:08x}", fnv1a_32(raw.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::Side;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_cache() -> (Arc<IdempotencyCache<String>>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let cache = Arc::new(IdempotencyCache::new(clock.clone()));
        (cache, clock)
    }

    fn ticket(symbol: &str, qty: rust_decimal::Decimal) -> OrderTicket {
        OrderTicket {
            account_id: "acct-1".to_string(),
            workspace_id: "ws-1".to_string(),
            bot_id: None,
            symbol: symbol.to_string(),
            side: Side::Buy,
            quantity: qty,
            live: false,
        }
    }

    #[test]
    fn test_get_within_ttl_returns_value() {
        let (cache, clock) = test_cache();
        cache.set("k1", "v1".to_string(), 60_000);

        clock.advance(59_999);
        assert_eq!(cache.get("k1"), Some("v1".to_string()));
        assert!(cache.has("k1"));
    }

    #[test]
    fn test_get_after_ttl_returns_none() {
        let (cache, clock) = test_cache();
        cache.set("k1", "v1".to_string(), 60_000);

        clock.advance(60_001);
        assert_eq!(cache.get("k1"), None);
        assert!(!cache.has("k1"));
        // Lazy expiry also removed the entry physically.
        assert!(cache.is_empty());
    }

    #[test]
    fn test_unknown_key_is_absent_not_error() {
        let (cache, _clock) = test_cache();
        assert_eq!(cache.get("missing"), None);
        assert!(!cache.delete("missing"));
    }

    #[test]
    fn test_set_overwrites_and_restarts_window() {
        let (cache, clock) = test_cache();
        cache.set("k1", "old".to_string(), 10_000);

        clock.advance(9_000);
        cache.set("k1", "new".to_string(), 10_000);

        // Past the first window but inside the restarted one.
        clock.advance(9_000);
        assert_eq!(cache.get("k1"), Some("new".to_string()));
    }

    #[test]
    fn test_clear_removes_everything() {
        let (cache, _clock) = test_cache();
        cache.set("a", "1".to_string(), 60_000);
        cache.set("b", "2".to_string(), 60_000);

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn test_purge_expired_counts() {
        let (cache, clock) = test_cache();
        cache.set("short", "1".to_string(), 1_000);
        cache.set("long", "2".to_string(), 120_000);

        clock.advance(2_000);
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("long"), Some("2".to_string()));
    }

    #[tokio::test]
    async fn test_with_idempotency_executes_once() {
        let (cache, _clock) = test_cache();
        let calls = AtomicU32::new(0);

        let first: Result<String, IdempotencyError<&str>> = cache
            .with_idempotency("k1", 60_000, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok("receipt".to_string())
            })
            .await;
        assert_eq!(first.unwrap(), "receipt");

        let second: Result<String, IdempotencyError<&str>> = cache
            .with_idempotency("k1", 60_000, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok("other".to_string())
            })
            .await;

        // Second call returns the original cached value without executing.
        assert_eq!(second.unwrap(), "receipt");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_idempotency_failure_not_cached() {
        let (cache, _clock) = test_cache();
        let calls = AtomicU32::new(0);

        let failed: Result<String, IdempotencyError<&str>> = cache
            .with_idempotency("k1", 60_000, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("exchange unavailable")
            })
            .await;
        assert!(matches!(
            failed,
            Err(IdempotencyError::Operation("exchange unavailable"))
        ));
        assert!(!cache.has("k1"));

        // Retry re-invokes the operation.
        let retried: Result<String, IdempotencyError<&str>> = cache
            .with_idempotency("k1", 60_000, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok("receipt".to_string())
            })
            .await;
        assert_eq!(retried.unwrap(), "receipt");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_with_idempotency_concurrent_duplicate_rejected() {
        let (cache, _clock) = test_cache();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let cache_bg = cache.clone();
        let first = tokio::spawn(async move {
            cache_bg
                .with_idempotency("k1", 60_000, || async {
                    release_rx.await.ok();
                    Ok::<_, &str>("receipt".to_string())
                })
                .await
        });

        // Let the first call claim the key before racing it.
        tokio::task::yield_now().await;
        while cache.len() == 0 {
            tokio::task::yield_now().await;
        }

        let racer: Result<String, IdempotencyError<&str>> = cache
            .with_idempotency("k1", 60_000, || async {
                panic!("duplicate must not execute");
            })
            .await;
        assert!(matches!(racer, Err(IdempotencyError::InFlight)));

        // In-flight markers are invisible to reads.
        assert!(!cache.has("k1"));

        release_tx.send(()).unwrap();
        let settled = first.await.unwrap().unwrap();
        assert_eq!(settled, "receipt");
        assert_eq!(cache.get("k1"), Some("receipt".to_string()));
    }

    #[test]
    fn test_order_key_deterministic() {
        let t = ticket("AAPL", dec!(10));
        let k1 = derive_order_key(&t, 1_000_000, 60);
        let k2 = derive_order_key(&t, 1_000_000, 60);
        assert_eq!(k1, k2);
        assert_eq!(k1.len(), 8);
    }

    #[test]
    fn test_order_key_same_bucket_collapses() {
        let t = ticket("AAPL", dec!(10));
        // 5 seconds apart, same 60s bucket.
        let k1 = derive_order_key(&t, 60_000, 60);
        let k2 = derive_order_key(&t, 65_000, 60);
        assert_eq!(k1, k2);
    }

    #[test]
    fn test_order_key_next_window_differs() {
        let t = ticket("AAPL", dec!(10));
        let k1 = derive_order_key(&t, 60_000, 60);
        let k2 = derive_order_key(&t, 121_000, 60);
        assert_ne!(k1, k2);
    }

    #[test]
    fn test_order_key_distinguishes_tuples() {
        let now = 1_000_000;
        let a = derive_order_key(&ticket("AAPL", dec!(10)), now, 60);
        let b = derive_order_key(&ticket("TSLA", dec!(10)), now, 60);
        let c = derive_order_key(&ticket("AAPL", dec!(11)), now, 60);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_order_key_quantity_normalized() {
        let now = 1_000_000;
        let a = derive_order_key(&ticket("AAPL", dec!(1.5)), now, 60);
        let b = derive_order_key(&ticket("AAPL", dec!(1.50)), now, 60);
        assert_eq!(a, b);
    }
}
