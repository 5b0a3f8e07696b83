use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::CacheError;
use crate::events::safe_invoke;
use crate::refs::RefCounters;

use super::ReleaseFn;

/// The synchronous in-memory tier: a guarded `key -> Arc<T>` map.
///
/// Presence of a key means the value can be served without any I/O. The
/// cache never evicts on its own; entries leave either through the
/// reference-counting layer (an exact 1→0 transition) or through the
/// checked [`remove`](Self::remove)/[`clear`](Self::clear) operations,
/// which refuse to free an entry that live [`Reference`](crate::Reference)s
/// still alias.
pub struct MemoryCache<T> {
    inner: Arc<MemoryCacheInner<T>>,
}

impl<T> Clone for MemoryCache<T> {
    fn clone(&self) -> Self {
        MemoryCache {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct MemoryCacheInner<T> {
    entries: Mutex<HashMap<String, Arc<T>>>,
    counters: RefCounters,
    release: Option<ReleaseFn<T>>,
}

impl<T> MemoryCache<T> {
    pub(crate) fn new(counters: RefCounters, release: Option<ReleaseFn<T>>) -> Self {
        MemoryCache {
            inner: Arc::new(MemoryCacheInner {
                entries: Mutex::new(HashMap::new()),
                counters,
                release,
            }),
        }
    }

    /// Whether a value is cached for `key`.
    pub fn contains(&self, key: &str) -> bool {
        let entries = self.inner.entries.lock().unwrap();
        entries.contains_key(key)
    }

    /// Stores `value` under `key`.
    ///
    /// An existing entry is only overwritten when `replace` is set;
    /// otherwise the call fails with [`CacheError::Conflict`] and the cached
    /// value stays in place.
    pub fn save(&self, key: &str, value: Arc<T>, replace: bool) -> Result<(), CacheError> {
        let evicted = {
            let mut entries = self.inner.entries.lock().unwrap();
            if !replace && entries.contains_key(key) {
                return Err(CacheError::Conflict {
                    key: key.to_owned(),
                });
            }
            entries.insert(key.to_owned(), value)
        };
        if let Some(old) = evicted {
            self.run_release(key, &old);
        }
        Ok(())
    }

    /// Returns the cached value for `key`, if any.
    pub fn load(&self, key: &str) -> Option<Arc<T>> {
        let entries = self.inner.entries.lock().unwrap();
        entries.get(key).cloned()
    }

    /// Removes the entry for `key`.
    ///
    /// Fails with [`CacheError::InUse`] while references to the value are
    /// outstanding; freeing it underneath them would be a use-after-free
    /// hazard for the holders. Removing an absent key is a no-op.
    pub fn remove(&self, key: &str) -> Result<(), CacheError> {
        let count = self.inner.counters.count(key);
        if count > 0 {
            return Err(CacheError::InUse {
                key: key.to_owned(),
                count: count as usize,
            });
        }
        self.evict(key);
        Ok(())
    }

    /// Removes all entries.
    ///
    /// Fails with [`CacheError::InUse`] on the first key that still has
    /// outstanding references; no entry is removed in that case.
    pub fn clear(&self) -> Result<(), CacheError> {
        let drained = {
            let mut entries = self.inner.entries.lock().unwrap();
            for key in entries.keys() {
                let count = self.inner.counters.count(key);
                if count > 0 {
                    return Err(CacheError::InUse {
                        key: key.clone(),
                        count: count as usize,
                    });
                }
            }
            std::mem::take(&mut *entries)
        };
        for (key, value) in &drained {
            self.run_release(key, value);
        }
        Ok(())
    }

    /// Unchecked removal, used by the reference-counting layer once the
    /// counter for `key` has reached zero.
    pub(crate) fn evict(&self, key: &str) {
        let removed = {
            let mut entries = self.inner.entries.lock().unwrap();
            entries.remove(key)
        };
        if let Some(value) = removed {
            tracing::debug!(key, "evicting memory cache entry");
            self.run_release(key, &value);
        }
    }

    /// The number of cached entries.
    pub fn len(&self) -> usize {
        let entries = self.inner.entries.lock().unwrap();
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn run_release(&self, key: &str, value: &Arc<T>) {
        if let Some(release) = &self.inner.release {
            tracing::trace!(key, "running release function");
            safe_invoke("release function", || release(value));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn cache() -> (MemoryCache<String>, RefCounters) {
        let counters = RefCounters::default();
        (MemoryCache::new(counters.clone(), None), counters)
    }

    #[test]
    fn test_save_load_contains() {
        let (cache, _) = cache();
        assert!(!cache.contains("a"));
        assert!(cache.load("a").is_none());

        cache.save("a", Arc::new("one".into()), false).unwrap();
        assert!(cache.contains("a"));
        assert_eq!(cache.load("a").unwrap().as_str(), "one");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_save_conflict() {
        let (cache, _) = cache();
        cache.save("a", Arc::new("one".into()), false).unwrap();

        let err = cache.save("a", Arc::new("two".into()), false).unwrap_err();
        assert!(matches!(err, CacheError::Conflict { .. }));
        assert_eq!(cache.load("a").unwrap().as_str(), "one");

        cache.save("a", Arc::new("two".into()), true).unwrap();
        assert_eq!(cache.load("a").unwrap().as_str(), "two");
    }

    #[test]
    fn test_remove_refuses_referenced_entry() {
        let (cache, counters) = cache();
        cache.save("a", Arc::new("one".into()), false).unwrap();
        counters.increment("a");

        let err = cache.remove("a").unwrap_err();
        assert!(matches!(err, CacheError::InUse { count: 1, .. }));
        assert!(cache.contains("a"));

        counters.decrement("a");
        cache.remove("a").unwrap();
        assert!(!cache.contains("a"));
    }

    #[test]
    fn test_clear_refuses_referenced_entry() {
        let (cache, counters) = cache();
        cache.save("a", Arc::new("one".into()), false).unwrap();
        cache.save("b", Arc::new("two".into()), false).unwrap();
        counters.increment("b");

        assert!(matches!(
            cache.clear().unwrap_err(),
            CacheError::InUse { .. }
        ));
        assert_eq!(cache.len(), 2);

        counters.decrement("b");
        cache.clear().unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_release_runs_on_eviction() {
        let released = Arc::new(AtomicUsize::new(0));
        let hook = released.clone();
        let release: ReleaseFn<String> = Arc::new(move |_| {
            hook.fetch_add(1, Ordering::SeqCst);
        });
        let cache = MemoryCache::new(RefCounters::default(), Some(release));

        cache.save("a", Arc::new("one".into()), false).unwrap();
        cache.evict("a");
        assert_eq!(released.load(Ordering::SeqCst), 1);

        // evicting an absent key does not run the release function
        cache.evict("a");
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
