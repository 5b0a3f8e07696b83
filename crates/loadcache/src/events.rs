//! Callback plumbing shared by futures and registries.
//!
//! Every user-supplied callback in this crate runs through [`safe_invoke`]:
//! a panicking consumer is logged and contained, it never unwinds into the
//! orchestration logic. Callback lists are ordered and snapshot before
//! invocation, so a callback removing itself (or others) cannot corrupt
//! iteration.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Runs `f`, catching and logging any panic it raises.
pub fn safe_invoke<F: FnOnce()>(context: &str, f: F) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
        let message = panic_message(panic.as_ref());
        tracing::error!(context, panic = message, "callback panicked");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}

/// A shared, immutable callback taking its argument by reference.
pub type Callback<A> = Arc<dyn Fn(&A) + Send + Sync>;

/// An opaque handle identifying one registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackToken(u64);

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

impl CallbackToken {
    fn next() -> Self {
        CallbackToken(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
    }

    /// A token that never entered any list.
    ///
    /// Returned when a callback fired immediately on registration and there
    /// is nothing left to remove.
    pub(crate) fn spent() -> Self {
        CallbackToken::next()
    }
}

/// An ordered list of callbacks for one lifecycle point.
///
/// Not internally synchronized: it lives inside the owning object's state
/// mutex. [`snapshot`](Self::snapshot) hands out `Arc` clones that the owner
/// invokes after releasing the lock.
pub struct CallbackList<A> {
    entries: Vec<(CallbackToken, Callback<A>)>,
}

impl<A> Default for CallbackList<A> {
    fn default() -> Self {
        CallbackList {
            entries: Vec::new(),
        }
    }
}

impl<A> CallbackList<A> {
    /// Appends a callback, returning a token usable with [`remove`](Self::remove).
    pub fn add(&mut self, callback: Callback<A>) -> CallbackToken {
        let token = CallbackToken::next();
        self.entries.push((token, callback));
        token
    }

    /// Removes the callback registered under `token`.
    ///
    /// Returns `false` if the token is unknown, which is fine: the list may
    /// have been cleared by a completed future in the meantime.
    pub fn remove(&mut self, token: CallbackToken) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(t, _)| *t != token);
        self.entries.len() != before
    }

    /// Copies out the current callbacks, in registration order.
    pub fn snapshot(&self) -> Vec<Callback<A>> {
        self.entries.iter().map(|(_, cb)| Arc::clone(cb)).collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Invokes every callback in `callbacks` with `arg`, isolating panics.
pub fn emit<A>(context: &str, callbacks: &[Callback<A>], arg: &A) {
    for callback in callbacks {
        safe_invoke(context, || callback(arg));
    }
}
