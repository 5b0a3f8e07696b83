//! Reference counting for memory-cached values.
//!
//! Every [`Reference`] created for a key bumps a process-wide counter; its
//! disposal decrements it again. When a counter makes an exact 1→0
//! transition and the disposed handle was not pinned, the memory cache entry
//! for that key is evicted. The counters are also what lets the cache
//! refuse to clear an entry that is still aliased.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::caching::MemoryCache;
use crate::subscription::{Listener, SubscriptionToken, WeakBroadcast};

/// The global per-key reference counters.
///
/// Shared between the [`ReferenceRegistry`] (writes) and the
/// [`MemoryCache`](crate::MemoryCache) (clear-safety reads).
#[derive(Clone, Default)]
pub struct RefCounters {
    counts: Arc<Mutex<HashMap<String, i64>>>,
}

impl RefCounters {
    /// The current count for `key`. Pure read.
    pub fn count(&self, key: &str) -> i64 {
        let counts = self.counts.lock().unwrap();
        counts.get(key).copied().unwrap_or(0)
    }

    pub(crate) fn increment(&self, key: &str) -> i64 {
        let mut counts = self.counts.lock().unwrap();
        let count = counts.entry(key.to_owned()).or_insert(0);
        *count += 1;
        *count
    }

    /// Decrements the counter for `key`, returning the new value.
    ///
    /// A negative result is a caller lifetime-management bug (for example a
    /// manual double-decrement). It is logged as an error rather than
    /// panicking, because the system must stay usable after a caller's
    /// double-dispose. Non-positive entries are pruned either way so the
    /// map does not grow on caller bugs.
    pub(crate) fn decrement(&self, key: &str) -> i64 {
        let mut counts = self.counts.lock().unwrap();
        let count = counts.entry(key.to_owned()).or_insert(0);
        *count -= 1;
        let value = *count;
        if value <= 0 {
            counts.remove(key);
            if value < 0 {
                tracing::error!(key, count = value, "reference counter underflow");
            }
        }
        value
    }

    /// The number of keys with live counters.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        let counts = self.counts.lock().unwrap();
        counts.len()
    }
}

/// A cache maintenance notification delivered to live references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClearEvent {
    /// One key is being cleared.
    Key(String),
    /// The whole memory cache is being cleared.
    All,
}

/// Creates and tracks [`Reference`] handles for one value type.
pub struct ReferenceRegistry<T> {
    inner: Arc<RegistryInner<T>>,
}

impl<T> Clone for ReferenceRegistry<T> {
    fn clone(&self) -> Self {
        ReferenceRegistry {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct RegistryInner<T> {
    counters: RefCounters,
    memory: MemoryCache<T>,
    broadcast: WeakBroadcast<ClearEvent>,
}

impl<T: Send + Sync + 'static> ReferenceRegistry<T> {
    pub(crate) fn new(memory: MemoryCache<T>, counters: RefCounters) -> Self {
        ReferenceRegistry {
            inner: Arc::new(RegistryInner {
                counters,
                memory,
                broadcast: WeakBroadcast::default(),
            }),
        }
    }

    /// Wraps `value` in a counted handle for `key`.
    ///
    /// The handle subscribes (weakly) to clear notifications so a global
    /// clear can dispose it without the owner's involvement.
    pub fn make_reference(&self, key: &str, value: Arc<T>) -> Reference<T> {
        self.inner.counters.increment(key);

        let inner = Arc::new(ReferenceInner {
            key: key.to_owned(),
            value: Mutex::new(Some(value)),
            pinned: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            registry: self.clone(),
            subscription: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let listener: Listener<ClearEvent> = Arc::new(move |event| {
            if let Some(reference) = weak.upgrade() {
                let affected = match event {
                    ClearEvent::All => true,
                    ClearEvent::Key(key) => *key == reference.key,
                };
                if affected {
                    reference.dispose();
                }
            }
        });
        let token = self.inner.broadcast.subscribe(&listener);
        *inner.subscription.lock().unwrap() = Some((token, listener));

        tracing::trace!(key, count = self.counter(key), "created reference");
        Reference { inner }
    }

    /// The current reference count for `key`.
    pub fn counter(&self, key: &str) -> i64 {
        self.inner.counters.count(key)
    }

    /// Disposes every live reference for `key`.
    pub fn dispose_key(&self, key: &str) {
        self.inner.broadcast.emit(&ClearEvent::Key(key.to_owned()));
    }

    /// Disposes every live reference, for all keys.
    pub fn dispose_all(&self) {
        self.inner.broadcast.emit(&ClearEvent::All);
    }

    /// The number of live clear-event subscriptions.
    pub fn subscriptions(&self) -> usize {
        self.inner.broadcast.len()
    }
}

/// A counted, shared handle to a value resident in the memory cache.
///
/// Each handle contributes exactly one to the counter for its key; the
/// handle is deliberately not `Clone` — aliasing requires pulling a fresh
/// handle from the registry. Dropping the handle disposes it.
pub struct Reference<T: Send + Sync + 'static> {
    inner: Arc<ReferenceInner<T>>,
}

struct ReferenceInner<T: Send + Sync + 'static> {
    key: String,
    value: Mutex<Option<Arc<T>>>,
    pinned: AtomicBool,
    disposed: AtomicBool,
    registry: ReferenceRegistry<T>,
    /// The clear-event subscription; holding the listener keeps the weak
    /// slot in the broadcaster alive.
    #[allow(clippy::type_complexity)]
    subscription: Mutex<Option<(SubscriptionToken, Listener<ClearEvent>)>>,
}

impl<T: Send + Sync + 'static> Reference<T> {
    /// The key this handle aliases.
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// The referenced value, or `None` once disposed.
    pub fn value(&self) -> Option<Arc<T>> {
        self.inner.value.lock().unwrap().clone()
    }

    /// Opts this handle out of triggering automatic eviction on disposal.
    ///
    /// Also known as "keep": the cached value survives even when this was
    /// the last reference, and releasing it becomes the owner's job.
    pub fn pin(&self) {
        self.inner.pinned.store(true, Ordering::SeqCst);
    }

    /// Re-enables automatic eviction for this handle.
    pub fn unpin(&self) {
        self.inner.pinned.store(false, Ordering::SeqCst);
    }

    pub fn is_pinned(&self) -> bool {
        self.inner.pinned.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Releases this handle.
    ///
    /// Idempotent. Decrements the counter for the key; on an exact 1→0
    /// transition the memory cache entry is evicted, unless the handle is
    /// pinned.
    pub fn dispose(&self) {
        self.inner.dispose();
    }
}

impl<T: Send + Sync + 'static> ReferenceInner<T> {
    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        *self.value.lock().unwrap() = None;
        if let Some((token, _listener)) = self.subscription.lock().unwrap().take() {
            self.registry.inner.broadcast.unsubscribe(token);
        }

        let remaining = self.registry.inner.counters.decrement(&self.key);
        if remaining == 0 {
            if self.pinned.load(Ordering::SeqCst) {
                tracing::info!(
                    key = self.key.as_str(),
                    "last reference was pinned; releasing the cached value is now the owner's responsibility"
                );
            } else {
                self.registry.inner.memory.evict(&self.key);
            }
        }
    }
}

impl<T: Send + Sync + 'static> Drop for Reference<T> {
    fn drop(&mut self) {
        self.inner.dispose();
    }
}

impl<T: Send + Sync + 'static> std::fmt::Debug for Reference<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reference")
            .field("key", &self.inner.key)
            .field("pinned", &self.is_pinned())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (ReferenceRegistry<String>, MemoryCache<String>) {
        let counters = RefCounters::default();
        let memory = MemoryCache::new(counters.clone(), None);
        (ReferenceRegistry::new(memory.clone(), counters), memory)
    }

    fn warm(memory: &MemoryCache<String>, key: &str) -> Arc<String> {
        let value = Arc::new(format!("value for {key}"));
        memory.save(key, value.clone(), false).unwrap();
        value
    }

    #[test]
    fn test_counter_conservation() {
        let (registry, memory) = registry();
        let value = warm(&memory, "k");

        let a = registry.make_reference("k", value.clone());
        let b = registry.make_reference("k", value.clone());
        let c = registry.make_reference("k", value);
        assert_eq!(registry.counter("k"), 3);

        a.dispose();
        assert_eq!(registry.counter("k"), 2);
        // dispose is idempotent
        a.dispose();
        assert_eq!(registry.counter("k"), 2);

        drop(b);
        assert_eq!(registry.counter("k"), 1);
        drop(c);
        assert_eq!(registry.counter("k"), 0);
    }

    #[test]
    fn test_eviction_on_last_dispose() {
        let (registry, memory) = registry();
        let value = warm(&memory, "k");

        let a = registry.make_reference("k", value.clone());
        let b = registry.make_reference("k", value);

        a.dispose();
        assert!(a.value().is_none());
        assert!(memory.contains("k"));

        b.dispose();
        assert!(!memory.contains("k"));
    }

    #[test]
    fn test_pinned_reference_keeps_entry() {
        let (registry, memory) = registry();
        let value = warm(&memory, "k");

        let reference = registry.make_reference("k", value);
        reference.pin();
        assert!(reference.is_pinned());
        reference.dispose();

        assert_eq!(registry.counter("k"), 0);
        assert!(memory.contains("k"));
    }

    #[test]
    fn test_clear_events_dispose_references() {
        let (registry, memory) = registry();
        let a_val = warm(&memory, "a");
        let b_val = warm(&memory, "b");

        let a = registry.make_reference("a", a_val);
        let b = registry.make_reference("b", b_val);
        assert_eq!(registry.subscriptions(), 2);

        registry.dispose_key("a");
        assert!(a.is_disposed());
        assert!(!b.is_disposed());
        assert!(!memory.contains("a"));
        assert!(memory.contains("b"));

        registry.dispose_all();
        assert!(b.is_disposed());
        assert!(!memory.contains("b"));
        assert_eq!(registry.subscriptions(), 0);
    }

    #[test]
    fn test_underflow_is_loud_but_survivable() {
        let counters = RefCounters::default();
        assert_eq!(counters.decrement("k"), -1);
        // the underflowed entry is pruned, not kept around
        assert_eq!(counters.count("k"), 0);
        assert_eq!(counters.len(), 0);

        // the system keeps working afterwards
        assert_eq!(counters.increment("k"), 1);
        assert_eq!(counters.decrement("k"), 0);
        assert_eq!(counters.len(), 0);
    }
}
