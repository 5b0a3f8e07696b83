//! The in-flight load table used for request deduplication.
//!
//! At most one load per key is ever in flight. The first caller to register
//! a key becomes its *leader* and actually performs the tier walk; everyone
//! else arriving while the entry exists becomes a *follower* of the
//! leader's future. Removal is exactly-once and wakes all waiters, who then
//! re-check the table.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::future::LoadFuture;

/// Tracks the single in-flight [`LoadFuture`] per key.
pub(crate) struct LoadRegistry<T> {
    inner: Arc<RegistryInner<T>>,
}

impl<T> Clone for LoadRegistry<T> {
    fn clone(&self) -> Self {
        LoadRegistry {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct RegistryInner<T> {
    in_flight: Mutex<HashMap<String, LoadFuture<T>>>,
    released: Notify,
}

impl<T: Send + Sync + 'static> Default for LoadRegistry<T> {
    fn default() -> Self {
        LoadRegistry {
            inner: Arc::new(RegistryInner {
                in_flight: Mutex::new(HashMap::new()),
                released: Notify::new(),
            }),
        }
    }
}

impl<T: Send + Sync + 'static> LoadRegistry<T> {
    /// Attempts to register `future` as the in-flight load for its key.
    ///
    /// Returns `None` when the slot was free and `future` is now the
    /// leader. Otherwise returns the already-registered future; the caller
    /// should follow it.
    pub fn register(&self, future: &LoadFuture<T>) -> Option<LoadFuture<T>> {
        let mut in_flight = self.inner.in_flight.lock().unwrap();
        match in_flight.get(future.key()) {
            Some(leader) => Some(leader.clone()),
            None => {
                in_flight.insert(future.key().to_owned(), future.clone());
                None
            }
        }
    }

    /// Returns the in-flight future for `key`, if any.
    pub fn get(&self, key: &str) -> Option<LoadFuture<T>> {
        let in_flight = self.inner.in_flight.lock().unwrap();
        in_flight.get(key).cloned()
    }

    /// Releases the in-flight slot held by `future` and wakes all waiters.
    ///
    /// Only removes the entry if it still belongs to `future`; a slower
    /// follower-turned-leader for the same key must not be kicked out by
    /// the previous leader's cleanup.
    pub fn remove(&self, future: &LoadFuture<T>) {
        let removed = {
            let mut in_flight = self.inner.in_flight.lock().unwrap();
            match in_flight.get(future.key()) {
                Some(current) if current.id() == future.id() => {
                    in_flight.remove(future.key());
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.inner.released.notify_waiters();
        }
    }

    /// Waits until `key` no longer has an in-flight load.
    ///
    /// Spurious wakeups are possible (any removal wakes every waiter); the
    /// caller re-checks its own conditions after this returns.
    pub async fn wait_released(&self, key: &str) {
        loop {
            // Create the notified future before the check so a removal
            // between the check and the await cannot be missed.
            let notified = self.inner.released.notified();
            if self.get(key).is_none() {
                return;
            }
            notified.await;
        }
    }

    /// The number of keys currently loading.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        let in_flight = self.inner.in_flight.lock().unwrap();
        in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn future(key: &str) -> LoadFuture<String> {
        LoadFuture::new(key, Duration::from_secs(5))
    }

    #[test]
    fn test_first_registration_leads() {
        let registry = LoadRegistry::default();
        let leader = future("k");
        assert!(registry.register(&leader).is_none());
        assert_eq!(registry.len(), 1);

        let follower = future("k");
        let existing = registry.register(&follower).unwrap();
        assert_eq!(existing.id(), leader.id());
        // the follower did not displace the leader
        assert_eq!(registry.len(), 1);

        let other = future("other");
        assert!(registry.register(&other).is_none());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_remove_only_by_owner() {
        let registry = LoadRegistry::default();
        let first = future("k");
        assert!(registry.register(&first).is_none());
        registry.remove(&first);
        assert!(registry.get("k").is_none());

        let second = future("k");
        assert!(registry.register(&second).is_none());
        // the stale handle's cleanup must not evict the new leader
        registry.remove(&first);
        assert_eq!(registry.get("k").unwrap().id(), second.id());

        registry.remove(&second);
        assert!(registry.get("k").is_none());
    }

    #[tokio::test]
    async fn test_wait_released() {
        let registry: LoadRegistry<String> = LoadRegistry::default();
        let leader = future("k");
        assert!(registry.register(&leader).is_none());

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.wait_released("k").await })
        };
        tokio::task::yield_now().await;

        registry.remove(&leader);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_released_on_free_key_returns_immediately() {
        let registry: LoadRegistry<String> = LoadRegistry::default();
        registry.wait_released("never-registered").await;
    }
}
