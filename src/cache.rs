use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};

use lru::LruCache;

/// A capacity of zero disables memoisation.
pub struct QueryCache<K: Hash + Eq, V> {
    cache: Option<Mutex<LruCache<K, Arc<V>>>>,
}

impl<K: Hash + Eq, V> QueryCache<K, V> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: NonZeroUsize::new(capacity).map(|capacity| Mutex::new(LruCache::new(capacity))),
        }
    }

    /// With `refresh`, any memoised value is ignored and replaced.
    /// Failures are never memoised.
    pub fn get_or_try_insert<E>(
        &self,
        key: K,
        refresh: bool,
        compute: impl FnOnce() -> Result<V, E>,
    ) -> Result<Arc<V>, E> {
        let Some(cache) = &self.cache else {
            return compute().map(Arc::new);
        };
        if !refresh && let Some(hit) = lock(cache).get(&key).cloned() {
            return Ok(hit);
        }
        let value = Arc::new(compute()?);
        lock(cache).put(key, Arc::clone(&value));
        Ok(value)
    }

    pub fn clear(&self) {
        if let Some(cache) = &self.cache {
            lock(cache).clear();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.as_ref().map_or(0, |cache| lock(cache).len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
