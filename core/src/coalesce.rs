/// Request coalescing and per-key serialization
///
/// `InFlight` collapses concurrent calls for the same key into one future whose
/// output every caller receives. `KeyedLocks` queues work per key so that
/// operations on one key reach the network in issue order.
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

type SharedCall<V> = Shared<BoxFuture<'static, V>>;

pub struct InFlight<K, V>
where
    V: Clone,
{
    pending: Mutex<HashMap<K, (u64, SharedCall<V>)>>,
    generation: AtomicU64,
}

impl<K, V> Default for InFlight<K, V>
where
    V: Clone,
{
    fn default() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }
}

impl<K, V> InFlight<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug + Send,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `make()` unless a call for `key` is already in flight, in which
    /// case await that call instead
    pub async fn run<F, Fut>(&self, key: K, make: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let (generation, call) = {
            let mut pending = self.pending.lock().await;
            match pending.get(&key) {
                Some((generation, call)) => {
                    debug!("Joining in-flight call for {:?}", key);
                    (*generation, call.clone())
                }
                None => {
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                    let call = make().boxed().shared();
                    pending.insert(key.clone(), (generation, call.clone()));
                    (generation, call)
                }
            }
        };

        let output = call.await;

        let mut pending = self.pending.lock().await;
        if matches!(pending.get(&key), Some((current, _)) if *current == generation) {
            pending.remove(&key);
        }
        output
    }

    pub async fn is_in_flight(&self, key: &K) -> bool {
        self.pending.lock().await.contains_key(key)
    }
}

/// Per-key FIFO serialization
#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for every earlier holder of `key`; the guard releases on drop
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            // Idle entries are only referenced by the map itself
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            locks.entry(key.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}
