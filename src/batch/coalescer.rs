//! Request coalescing: concurrent per-key loads collapse into one batch call.
//!
//! Every key requested before the queue settles lands in the same batch. A key that is already part of an in-flight batch joins that
//! batch's waiters instead of being queued again. When a batch fails,
//! every waiter receives the same error and nothing is cached, so the
//! next call for that key starts a fresh batch.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex};

use crate::errors::{BackendError, LoadError};

/// One backend call serving many keys.
#[async_trait]
pub trait BatchLoader: Send + Sync + 'static {
    type Key: Clone + Send + Sync + 'static;
    type Value: Clone + Send + Sync + 'static;

    /// Structural identity of a key. Two keys with the same id are the
    /// same request.
    fn key_id(&self, key: &Self::Key) -> String;

    /// Load every key; entries are looked up by [`BatchLoader::key_id`].
    /// Keys missing from the map resolve to `None`.
    async fn load(&self, keys: Vec<Self::Key>) -> Result<HashMap<String, Self::Value>, BackendError>;
}

type Reply<V> = oneshot::Sender<Result<Option<V>, LoadError>>;
type Receiver<V> = oneshot::Receiver<Result<Option<V>, LoadError>>;

/// Consecutive unchanged queue checks before a zero-window dispatch.
const SETTLE_ROUNDS: usize = 2;
const MAX_SETTLE_ROUNDS: usize = 64;

struct State<K, V> {
    queued: Vec<K>,
    queued_ids: HashSet<String>,
    in_flight: HashSet<String>,
    waiters: HashMap<String, Vec<Reply<V>>>,
    scheduled: bool,
}

impl<K, V> Default for State<K, V> {
    fn default() -> Self {
        Self {
            queued: Vec::new(),
            queued_ids: HashSet::new(),
            in_flight: HashSet::new(),
            waiters: HashMap::new(),
            scheduled: false,
        }
    }
}

struct Inner<L: BatchLoader> {
    loader: L,
    window: Duration,
    state: Mutex<State<L::Key, L::Value>>,
    batches: AtomicU64,
}

pub struct Coalescer<L: BatchLoader> {
    inner: Arc<Inner<L>>,
}

impl<L: BatchLoader> Clone for Coalescer<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<L: BatchLoader> Coalescer<L> {
    /// `window` of zero dispatches once the queue stops growing across
    /// scheduler yields.
    pub fn new(loader: L, window: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                loader,
                window,
                state: Mutex::new(State::default()),
                batches: AtomicU64::new(0),
            }),
        }
    }

    pub fn loader(&self) -> &L {
        &self.inner.loader
    }

    /// Number of batch calls dispatched so far.
    pub fn batches_dispatched(&self) -> u64 {
        self.inner.batches.load(Ordering::Relaxed)
    }

    /// Resolve one key. `Ok(None)` means the batch succeeded but had no
    /// entry for this key.
    pub async fn load(&self, key: L::Key) -> Result<Option<L::Value>, LoadError> {
        let rx = {
            let mut state = self.inner.state.lock().await;
            let rx = self.enqueue(&mut state, key);
            self.schedule(&mut state);
            rx
        };
        wait(rx).await
    }

    /// Resolve many keys through the same batch. Every key is queued under
    /// one lock, so a dispatcher on another worker never sees a partial set.
    pub async fn load_many(&self, keys: Vec<L::Key>) -> Vec<Result<Option<L::Value>, LoadError>> {
        let receivers: Vec<_> = {
            let mut state = self.inner.state.lock().await;
            let receivers: Vec<Receiver<L::Value>> = keys
                .into_iter()
                .map(|key| self.enqueue(&mut state, key))
                .collect();
            self.schedule(&mut state);
            receivers
        };
        futures::future::join_all(receivers.into_iter().map(wait)).await
    }

    fn enqueue(&self, state: &mut State<L::Key, L::Value>, key: L::Key) -> Receiver<L::Value> {
        let id = self.inner.loader.key_id(&key);
        let (tx, rx) = oneshot::channel();
        state.waiters.entry(id.clone()).or_default().push(tx);

        if !state.in_flight.contains(&id) && state.queued_ids.insert(id) {
            state.queued.push(key);
        }
        rx
    }

    fn schedule(&self, state: &mut State<L::Key, L::Value>) {
        if !state.scheduled && !state.queued.is_empty() {
            state.scheduled = true;
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { dispatch(inner).await });
        }
    }
}

async fn wait<V>(rx: Receiver<V>) -> Result<Option<V>, LoadError> {
    match rx.await {
        Ok(result) => result,
        Err(_) => Err(LoadError::Dropped),
    }
}

/// Yield until the queue length holds still for `SETTLE_ROUNDS` checks in a
/// row. Callers running on other workers keep enqueueing meanwhile.
async fn settle<L: BatchLoader>(inner: &Inner<L>) {
    let mut last = 0;
    let mut stable = 0;
    for _ in 0..MAX_SETTLE_ROUNDS {
        tokio::task::yield_now().await;
        let len = inner.state.lock().await.queued.len();
        if len == last {
            stable += 1;
            if stable >= SETTLE_ROUNDS {
                return;
            }
        } else {
            last = len;
            stable = 0;
        }
    }
}

async fn dispatch<L: BatchLoader>(inner: Arc<Inner<L>>) {
    if inner.window.is_zero() {
        settle(&inner).await;
    } else {
        tokio::time::sleep(inner.window).await;
    }

    let (keys, ids) = {
        let mut state = inner.state.lock().await;
        state.scheduled = false;
        let keys = std::mem::take(&mut state.queued);
        let ids: Vec<String> = keys.iter().map(|k| inner.loader.key_id(k)).collect();
        state.queued_ids.clear();
        state.in_flight.extend(ids.iter().cloned());
        (keys, ids)
    };

    if keys.is_empty() {
        return;
    }

    inner.batches.fetch_add(1, Ordering::Relaxed);
    tracing::debug!(keys = keys.len(), "dispatching coalesced batch");

    let outcome = inner.loader.load(keys).await;

    let mut state = inner.state.lock().await;
    match outcome {
        Ok(mut entries) => {
            for id in ids {
                state.in_flight.remove(&id);
                let value = entries.remove(&id);
                for reply in state.waiters.remove(&id).unwrap_or_default() {
                    let _ = reply.send(Ok(value.clone()));
                }
            }
        }
        Err(e) => {
            tracing::warn!(keys = ids.len(), error = %e, "coalesced batch failed");
            let shared = LoadError::Batch(Arc::new(e));
            for id in ids {
                state.in_flight.remove(&id);
                for reply in state.waiters.remove(&id).unwrap_or_default() {
                    let _ = reply.send(Err(shared.clone()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Records every batch it receives and echoes keys back uppercased,
    /// except keys starting with `missing`.
    #[derive(Default)]
    struct EchoLoader {
        calls: StdMutex<Vec<Vec<String>>>,
        fail: std::sync::atomic::AtomicBool,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl BatchLoader for EchoLoader {
        type Key = String;
        type Value = String;

        fn key_id(&self, key: &String) -> String {
            key.clone()
        }

        async fn load(&self, keys: Vec<String>) -> Result<HashMap<String, String>, BackendError> {
            self.calls.lock().unwrap().push(keys.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(BackendError::Transport("connection reset".into()));
            }
            Ok(keys
                .into_iter()
                .filter(|k| !k.starts_with("missing"))
                .map(|k| (k.clone(), k.to_uppercase()))
                .collect())
        }
    }

    // ── Tests ────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_same_tick_requests_share_one_batch() {
        let coalescer = Coalescer::new(EchoLoader::default(), Duration::ZERO);

        let keys: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        let results = coalescer.load_many(keys.clone()).await;

        let calls = coalescer.loader().calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        let mut batch = calls[0].clone();
        batch.sort();
        assert_eq!(batch, keys);

        for (key, result) in keys.iter().zip(results) {
            assert_eq!(result.unwrap(), Some(key.to_uppercase()));
        }
    }

    #[tokio::test]
    async fn test_duplicate_keys_are_requested_once() {
        let coalescer = Coalescer::new(EchoLoader::default(), Duration::ZERO);
        let results = coalescer
            .load_many(vec!["a".into(), "a".into(), "b".into()])
            .await;

        let calls = coalescer.loader().calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].len(), 2);
        assert!(results.iter().all(|r| r.is_ok()));
    }

    #[tokio::test]
    async fn test_missing_entry_resolves_none() {
        let coalescer = Coalescer::new(EchoLoader::default(), Duration::ZERO);
        let result = coalescer.load("missing-1".into()).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_failure_rejects_all_and_does_not_poison() {
        let loader = EchoLoader::default();
        loader.fail.store(true, Ordering::SeqCst);
        let coalescer = Coalescer::new(loader, Duration::ZERO);

        let results = coalescer.load_many(vec!["a".into(), "b".into()]).await;
        let errors: Vec<String> = results
            .into_iter()
            .map(|r| r.unwrap_err().to_string())
            .collect();
        assert_eq!(errors[0], errors[1]);
        assert!(errors[0].contains("connection reset"));

        coalescer.loader().fail.store(false, Ordering::SeqCst);
        let retry = coalescer.load("a".into()).await.unwrap();
        assert_eq!(retry.as_deref(), Some("A"));
        assert_eq!(coalescer.batches_dispatched(), 2);
    }

    #[tokio::test]
    async fn test_in_flight_key_joins_existing_batch() {
        let loader = EchoLoader {
            delay: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let coalescer = Coalescer::new(loader, Duration::ZERO);

        let first = {
            let c = coalescer.clone();
            tokio::spawn(async move { c.load("a".into()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // "a" is in flight: it joins, "b" starts the next batch.
        let (a, b) = tokio::join!(coalescer.load("a".into()), coalescer.load("b".into()));

        assert_eq!(first.await.unwrap().unwrap().as_deref(), Some("A"));
        assert_eq!(a.unwrap().as_deref(), Some("A"));
        assert_eq!(b.unwrap().as_deref(), Some("B"));

        let calls = coalescer.loader().calls.lock().unwrap().clone();
        assert_eq!(calls, vec![vec!["a".to_string()], vec!["b".to_string()]]);
    }

    #[tokio::test]
    async fn test_load_is_pending_until_dispatch() {
        let coalescer = Coalescer::new(EchoLoader::default(), Duration::ZERO);
        let mut fut = tokio_test::task::spawn(coalescer.load("a".into()));

        tokio_test::assert_pending!(fut.poll());
        assert!(coalescer.loader().calls.lock().unwrap().is_empty());

        let result = fut.await.unwrap();
        assert_eq!(result.as_deref(), Some("A"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_load_many_is_one_batch_across_workers() {
        for _ in 0..200 {
            let coalescer = Coalescer::new(EchoLoader::default(), Duration::ZERO);
            let keys: Vec<String> = (0..32).map(|i| format!("k{}", i)).collect();

            let results = coalescer.load_many(keys).await;

            assert!(results.iter().all(|r| matches!(r, Ok(Some(_)))));
            let sizes: Vec<usize> = coalescer.loader().calls.lock().unwrap().iter().map(Vec::len).collect();
            assert_eq!(sizes, vec![32]);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_loads_share_window_across_workers() {
        for _ in 0..20 {
            let coalescer = Coalescer::new(EchoLoader::default(), Duration::from_millis(20));
            let loads = (0..16).map(|i| coalescer.load(format!("k{}", i)));

            let results = futures::future::join_all(loads).await;

            assert!(results.iter().all(|r| matches!(r, Ok(Some(_)))));
            assert_eq!(coalescer.batches_dispatched(), 1);
        }
    }
}
