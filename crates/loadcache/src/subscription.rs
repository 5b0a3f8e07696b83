//! A weak-reference multi-listener broadcaster.
//!
//! Used for cross-object lifecycle coupling (e.g. "memory cache cleared"
//! notifications to live [`Reference`](crate::Reference)s) without creating
//! ownership cycles: the broadcaster only holds [`Weak`] pointers, so a
//! listener that was dropped without unsubscribing is simply pruned on the
//! next emit. Subscriptions additionally return a token so owners with an
//! explicit disposal path can release their slot eagerly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::events::safe_invoke;

/// A shared listener invoked with a reference to the broadcast event.
pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

type WeakListener<E> = Weak<dyn Fn(&E) + Send + Sync>;

/// Identifies one subscription on a [`WeakBroadcast`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionToken(u64);

/// An ordered broadcaster over weakly held listeners.
pub struct WeakBroadcast<E> {
    listeners: Mutex<Vec<(SubscriptionToken, WeakListener<E>)>>,
    next_token: AtomicU64,
}

impl<E> Default for WeakBroadcast<E> {
    fn default() -> Self {
        WeakBroadcast {
            listeners: Mutex::new(Vec::new()),
            next_token: AtomicU64::new(1),
        }
    }
}

impl<E> WeakBroadcast<E> {
    /// Subscribes `listener`, holding it weakly.
    ///
    /// The caller keeps the strong [`Arc`]; once it is dropped the slot goes
    /// dead and is pruned on the next [`emit`](Self::emit).
    pub fn subscribe(&self, listener: &Listener<E>) -> SubscriptionToken {
        let token = SubscriptionToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let mut listeners = self.listeners.lock().unwrap();
        listeners.push((token, Arc::downgrade(listener)));
        token
    }

    /// Releases the subscription identified by `token`.
    ///
    /// Unknown tokens are ignored; double-unsubscribe is not an error.
    pub fn unsubscribe(&self, token: SubscriptionToken) {
        let mut listeners = self.listeners.lock().unwrap();
        listeners.retain(|(t, _)| *t != token);
    }

    /// Notifies every live listener, in subscription order.
    ///
    /// The listener list is snapshot before invocation, so a listener
    /// unsubscribing itself (or others) during delivery is safe. Dead weak
    /// slots are pruned.
    pub fn emit(&self, event: &E) {
        let live: Vec<Listener<E>> = {
            let mut listeners = self.listeners.lock().unwrap();
            listeners.retain(|(_, weak)| weak.strong_count() > 0);
            listeners
                .iter()
                .filter_map(|(_, weak)| weak.upgrade())
                .collect()
        };
        for listener in live {
            safe_invoke("broadcast listener", || listener(event));
        }
    }

    /// The number of live subscriptions.
    pub fn len(&self) -> usize {
        let listeners = self.listeners.lock().unwrap();
        listeners
            .iter()
            .filter(|(_, weak)| weak.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn counting_listener(hits: &Arc<AtomicUsize>) -> Listener<u32> {
        let hits = hits.clone();
        Arc::new(move |_: &u32| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_emit_reaches_live_listeners() {
        let broadcast = WeakBroadcast::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let a = counting_listener(&hits);
        let b = counting_listener(&hits);
        broadcast.subscribe(&a);
        broadcast.subscribe(&b);

        broadcast.emit(&7);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(broadcast.len(), 2);
    }

    #[test]
    fn test_dropped_listener_is_pruned() {
        let broadcast = WeakBroadcast::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let a = counting_listener(&hits);
        broadcast.subscribe(&a);
        {
            let transient = counting_listener(&hits);
            broadcast.subscribe(&transient);
        }

        broadcast.emit(&7);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(broadcast.len(), 1);
    }

    #[test]
    fn test_unsubscribe_token() {
        let broadcast = WeakBroadcast::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let a = counting_listener(&hits);
        let token = broadcast.subscribe(&a);
        broadcast.unsubscribe(token);
        broadcast.unsubscribe(token);

        broadcast.emit(&7);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let broadcast = WeakBroadcast::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let bad: Listener<u32> = Arc::new(|_| panic!("listener bug"));
        let good = counting_listener(&hits);
        broadcast.subscribe(&bad);
        broadcast.subscribe(&good);

        broadcast.emit(&7);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
