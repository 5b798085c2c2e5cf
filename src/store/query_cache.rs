use dashmap::DashMap;
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, OnceCell};

/// Entry stored in the map with an expiry timestamp. The cell is shared by
/// every concurrent reader so a key is loaded at most once at a time.
struct CacheEntry<V> {
    cell: OnceCell<V>,
    expires_at: Instant,
}

/// Change notification sent to subscribers when entries are dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    Key(String),
    Prefix(String),
    All,
}

/// Keyed memoization of async loads.
///
/// Entries expire after `ttl` and are checked on read; `evict_expired()`
/// sweeps them in bulk. Failed loads are never stored.
pub struct QueryCache<K, V> {
    entries: DashMap<K, Arc<CacheEntry<V>>>,
    ttl: Duration,
    events: broadcast::Sender<Invalidation>,
}

impl<K, V> QueryCache<K, V>
where
    K: Eq + Hash + Clone + Display,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            entries: DashMap::new(),
            ttl,
            events,
        }
    }

    /// Cached value for `key`, loading it with `load` when absent or
    /// expired. Concurrent callers for the same key share one load.
    pub async fn get_or_try_load<F, Fut, E>(&self, key: K, load: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let entry = self.entry(key);
        entry.cell.get_or_try_init(load).await.cloned()
    }

    /// Cached value without loading.
    pub fn peek(&self, key: &K) -> Option<V> {
        let entry = self.entries.get(key)?;
        if Instant::now() >= entry.expires_at {
            return None;
        }
        entry.cell.get().cloned()
    }

    fn entry(&self, key: K) -> Arc<CacheEntry<V>> {
        let now = Instant::now();
        let mut slot = self.entries.entry(key).or_insert_with(|| {
            Arc::new(CacheEntry {
                cell: OnceCell::new(),
                expires_at: now + self.ttl,
            })
        });
        // Only initialized entries age out; an in-flight load keeps its cell.
        if now >= slot.expires_at && slot.cell.initialized() {
            *slot = Arc::new(CacheEntry {
                cell: OnceCell::new(),
                expires_at: now + self.ttl,
            });
        }
        slot.value().clone()
    }

    pub fn invalidate(&self, key: &K) {
        if self.entries.remove(key).is_some() {
            let _ = self.events.send(Invalidation::Key(key.to_string()));
        }
    }

    /// Drop every entry whose key renders with `prefix`.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|k, _| !k.to_string().starts_with(prefix));
        let removed = before - self.entries.len();
        if removed > 0 {
            let _ = self.events.send(Invalidation::Prefix(prefix.to_string()));
        }
        removed
    }

    pub fn invalidate_all(&self) {
        self.entries.clear();
        let _ = self.events.send(Invalidation::All);
    }

    /// Remove all expired entries.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.expires_at > now || !entry.cell.initialized());
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Invalidation> {
        self.events.subscribe()
    }
}
