//! The single-assignment future handed out for every load request.
//!
//! A [`LoadFuture`] is a shared handle onto one load operation. The loader
//! drives its state machine; external callers subscribe to lifecycle
//! events, register consumers and placeholders, `await` the outcome, or
//! cancel. All state transitions happen under one mutex that is never held
//! across an await or a user callback: callbacks are snapshot under the
//! lock and invoked after it is released, in the fixed order the state
//! machine prescribes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{LoadError, LoadResult};
use crate::events::{emit, safe_invoke, Callback, CallbackList, CallbackToken};

static NEXT_FUTURE_ID: AtomicU64 = AtomicU64::new(1);

/// The lifecycle state of a [`LoadFuture`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Created, no tier consulted yet.
    Initialized,
    /// A disk cache entry exists and is being read.
    LoadingFromDiskCache,
    /// The origin is being fetched.
    LoadingFromSource,
    /// Served synchronously from the memory tier.
    LoadedFromMemoryCache,
    /// Served from the disk tier.
    LoadedFromDiskCache,
    /// Served from the origin.
    LoadedFromSource,
    /// The load failed; [`LoadFuture::error`] holds the reason.
    FailedToLoad,
    /// The load was canceled; neither value nor error is exposed.
    Canceled,
    /// The future was disposed; no further events fire.
    Disposed,
}

impl Status {
    /// Whether a value was successfully loaded.
    pub fn is_loaded(&self) -> bool {
        matches!(
            self,
            Status::LoadedFromMemoryCache | Status::LoadedFromDiskCache | Status::LoadedFromSource
        )
    }

    /// Whether the state machine has settled (no more transitions except
    /// disposal).
    pub fn is_terminal(&self) -> bool {
        self.is_loaded()
            || matches!(self, Status::FailedToLoad | Status::Canceled | Status::Disposed)
    }

    /// The placeholder trigger active in this state, if any.
    fn trigger(&self) -> Option<Trigger> {
        match self {
            Status::LoadingFromDiskCache => Some(Trigger::LoadingFromDiskCache),
            Status::LoadingFromSource => Some(Trigger::LoadingFromSource),
            Status::FailedToLoad => Some(Trigger::FailedToLoad),
            Status::Canceled => Some(Trigger::Canceled),
            _ => None,
        }
    }
}

/// One layer of the cache hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    MemoryCache,
    DiskCache,
    Source,
}

impl Tier {
    fn loaded_status(&self) -> Status {
        match self {
            Tier::MemoryCache => Status::LoadedFromMemoryCache,
            Tier::DiskCache => Status::LoadedFromDiskCache,
            Tier::Source => Status::LoadedFromSource,
        }
    }
}

/// Lifecycle points a placeholder value can be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    LoadingFromDiskCache,
    LoadingFromSource,
    FailedToLoad,
    Canceled,
}

/// The per-lifecycle-point callback lists.
struct Events<T> {
    loading_from_disk: CallbackList<()>,
    loading_from_source: CallbackList<()>,
    loaded_from_memory: CallbackList<Arc<T>>,
    loaded_from_disk: CallbackList<Arc<T>>,
    loaded_from_source: CallbackList<Arc<T>>,
    loaded: CallbackList<Arc<T>>,
    failed: CallbackList<LoadError>,
    canceled: CallbackList<()>,
    completed: CallbackList<bool>,
}

impl<T> Default for Events<T> {
    fn default() -> Self {
        Events {
            loading_from_disk: CallbackList::default(),
            loading_from_source: CallbackList::default(),
            loaded_from_memory: CallbackList::default(),
            loaded_from_disk: CallbackList::default(),
            loaded_from_source: CallbackList::default(),
            loaded: CallbackList::default(),
            failed: CallbackList::default(),
            canceled: CallbackList::default(),
            completed: CallbackList::default(),
        }
    }
}

impl<T> Events<T> {
    fn clear(&mut self) {
        self.loading_from_disk.clear();
        self.loading_from_source.clear();
        self.loaded_from_memory.clear();
        self.loaded_from_disk.clear();
        self.loaded_from_source.clear();
        self.loaded.clear();
        self.failed.clear();
        self.canceled.clear();
        self.completed.clear();
    }
}

struct State<T> {
    status: Status,
    value: Option<Arc<T>>,
    error: Option<LoadError>,
    /// The flag `completed` fired with, kept for late subscribers.
    completed: Option<bool>,
    events: Events<T>,
    placeholders: HashMap<Trigger, Arc<T>>,
    consumers: Vec<Callback<T>>,
    /// Set once the terminal transition cleared the callback lists.
    cleared: bool,
}

struct FutureInner<T> {
    id: u64,
    key: String,
    timeout: Duration,
    cancel: CancellationToken,
    state: Mutex<State<T>>,
    settled_tx: watch::Sender<bool>,
}

/// A shared handle onto one load operation.
///
/// Clones refer to the same operation. The last handle to drop disposes the
/// underlying state as a diagnostic backstop; owners are expected to let
/// the future settle or to call [`cancel`](Self::cancel)/[`dispose`](Self::dispose)
/// themselves.
pub struct LoadFuture<T> {
    inner: Arc<FutureInner<T>>,
}

impl<T> Clone for LoadFuture<T> {
    fn clone(&self) -> Self {
        LoadFuture {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> std::fmt::Debug for LoadFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadFuture")
            .field("id", &self.inner.id)
            .field("key", &self.inner.key)
            .field("status", &self.status())
            .finish()
    }
}

impl<T: Send + Sync + 'static> LoadFuture<T> {
    pub(crate) fn new(key: &str, timeout: Duration) -> Self {
        let (settled_tx, _) = watch::channel(false);
        LoadFuture {
            inner: Arc::new(FutureInner {
                id: NEXT_FUTURE_ID.fetch_add(1, Ordering::Relaxed),
                key: key.to_owned(),
                timeout,
                cancel: CancellationToken::new(),
                state: Mutex::new(State {
                    status: Status::Initialized,
                    value: None,
                    error: None,
                    completed: None,
                    events: Events::default(),
                    placeholders: HashMap::new(),
                    consumers: Vec::new(),
                    cleared: false,
                }),
                settled_tx,
            }),
        }
    }

    /// The process-wide monotonic id of this operation.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The requested key.
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// The time budget this load races against.
    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    pub fn status(&self) -> Status {
        self.lock().status
    }

    /// The loaded value, if the future reached a loaded state.
    pub fn value(&self) -> Option<Arc<T>> {
        self.lock().value.clone()
    }

    /// The failure reason, if the future failed.
    pub fn error(&self) -> Option<LoadError> {
        self.lock().error.clone()
    }

    pub fn is_canceled(&self) -> bool {
        self.status() == Status::Canceled
    }

    pub fn is_settled(&self) -> bool {
        self.status().is_terminal()
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.inner.state.lock().unwrap()
    }

    // ---- subscriptions -------------------------------------------------

    /// Called when the future starts reading an existing disk cache entry.
    pub fn on_loading_from_disk_cache(
        &self,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> CallbackToken {
        fn list<T>(e: &mut Events<T>) -> &mut CallbackList<()> {
            &mut e.loading_from_disk
        }
        self.on_progress(Status::LoadingFromDiskCache, callback, list)
    }

    /// Called when the future starts fetching from the origin.
    pub fn on_loading_from_source(
        &self,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> CallbackToken {
        fn list<T>(e: &mut Events<T>) -> &mut CallbackList<()> {
            &mut e.loading_from_source
        }
        self.on_progress(Status::LoadingFromSource, callback, list)
    }

    fn on_progress(
        &self,
        status: Status,
        callback: impl Fn() + Send + Sync + 'static,
        list: fn(&mut Events<T>) -> &mut CallbackList<()>,
    ) -> CallbackToken {
        let callback: Callback<()> = Arc::new(move |_| callback());
        {
            let mut state = self.lock();
            if state.status != status {
                // settled futures never reach this state again
                if state.cleared {
                    return CallbackToken::spent();
                }
                return list(&mut state.events).add(callback);
            }
        }
        safe_invoke("loading callback", || callback(&()));
        CallbackToken::spent()
    }

    /// Called with the value when it was served from the memory tier.
    pub fn on_loaded_from_memory_cache(
        &self,
        callback: impl Fn(&T) + Send + Sync + 'static,
    ) -> CallbackToken {
        fn list<T>(e: &mut Events<T>) -> &mut CallbackList<Arc<T>> {
            &mut e.loaded_from_memory
        }
        self.on_loaded_from(Status::LoadedFromMemoryCache, callback, list)
    }

    /// Called with the value when it was served from the disk tier.
    pub fn on_loaded_from_disk_cache(
        &self,
        callback: impl Fn(&T) + Send + Sync + 'static,
    ) -> CallbackToken {
        fn list<T>(e: &mut Events<T>) -> &mut CallbackList<Arc<T>> {
            &mut e.loaded_from_disk
        }
        self.on_loaded_from(Status::LoadedFromDiskCache, callback, list)
    }

    /// Called with the value when it was fetched from the origin.
    pub fn on_loaded_from_source(
        &self,
        callback: impl Fn(&T) + Send + Sync + 'static,
    ) -> CallbackToken {
        fn list<T>(e: &mut Events<T>) -> &mut CallbackList<Arc<T>> {
            &mut e.loaded_from_source
        }
        self.on_loaded_from(Status::LoadedFromSource, callback, list)
    }

    fn on_loaded_from(
        &self,
        status: Status,
        callback: impl Fn(&T) + Send + Sync + 'static,
        list: fn(&mut Events<T>) -> &mut CallbackList<Arc<T>>,
    ) -> CallbackToken {
        let callback: Callback<Arc<T>> = Arc::new(move |value: &Arc<T>| callback(value));
        let value = {
            let mut state = self.lock();
            if state.status == status {
                state.value.clone()
            } else {
                if state.cleared {
                    return CallbackToken::spent();
                }
                return list(&mut state.events).add(callback);
            }
        };
        if let Some(value) = value {
            safe_invoke("loaded callback", || callback(&value));
        }
        CallbackToken::spent()
    }

    /// Called with the value once the future reaches any loaded state.
    ///
    /// Subscribing after the fact invokes the callback immediately and
    /// synchronously with the known value: late subscribers observe state
    /// truthfully.
    pub fn on_loaded(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> CallbackToken {
        let callback: Callback<Arc<T>> = Arc::new(move |value: &Arc<T>| callback(value));
        let value = {
            let mut state = self.lock();
            if state.status.is_loaded() {
                state.value.clone()
            } else {
                if state.cleared {
                    return CallbackToken::spent();
                }
                return state.events.loaded.add(callback);
            }
        };
        if let Some(value) = value {
            safe_invoke("loaded callback", || callback(&value));
        }
        CallbackToken::spent()
    }

    /// Called with the error if the future fails.
    pub fn on_failed(
        &self,
        callback: impl Fn(&LoadError) + Send + Sync + 'static,
    ) -> CallbackToken {
        let callback: Callback<LoadError> = Arc::new(move |error| callback(error));
        let error = {
            let mut state = self.lock();
            if state.status == Status::FailedToLoad {
                state.error.clone()
            } else {
                if state.cleared {
                    return CallbackToken::spent();
                }
                return state.events.failed.add(callback);
            }
        };
        if let Some(error) = error {
            safe_invoke("failed callback", || callback(&error));
        }
        CallbackToken::spent()
    }

    /// Called if the future is canceled.
    pub fn on_canceled(&self, callback: impl Fn() + Send + Sync + 'static) -> CallbackToken {
        let callback: Callback<()> = Arc::new(move |_| callback());
        {
            let mut state = self.lock();
            if state.status != Status::Canceled {
                if state.cleared {
                    return CallbackToken::spent();
                }
                return state.events.canceled.add(callback);
            }
        }
        safe_invoke("canceled callback", || callback(&()));
        CallbackToken::spent()
    }

    /// Called exactly once when the future settles; `true` on success.
    pub fn on_completed(&self, callback: impl Fn(bool) + Send + Sync + 'static) -> CallbackToken {
        let callback: Callback<bool> = Arc::new(move |flag: &bool| callback(*flag));
        let flag = {
            let mut state = self.lock();
            match state.completed {
                Some(flag) => flag,
                None => return state.events.completed.add(callback),
            }
        };
        safe_invoke("completed callback", || callback(&flag));
        CallbackToken::spent()
    }

    /// Registers a consumer sink.
    ///
    /// The sink receives the final value when the future loads, and any
    /// placeholder active while it is pending. A sink registered while a
    /// placeholder is active (or after the future loaded) is fed
    /// immediately. Failures inside a sink are isolated and logged.
    pub fn consume(&self, sink: impl Fn(&T) + Send + Sync + 'static) {
        let sink: Callback<T> = Arc::new(move |value| sink(value));
        let feed = {
            let mut state = self.lock();
            let feed = if state.status.is_loaded() {
                state.value.clone()
            } else {
                state
                    .status
                    .trigger()
                    .and_then(|t| state.placeholders.get(&t).cloned())
            };
            if !state.cleared {
                state.consumers.push(Arc::clone(&sink));
            }
            feed
        };
        if let Some(value) = feed {
            safe_invoke("consumer sink", || sink(&value));
        }
    }

    /// Registers a substitute value fed to consumers while `trigger` is
    /// active.
    ///
    /// If `trigger` matches the future's *current* state the value is fed
    /// to the consumers immediately instead of being stored.
    pub fn set_placeholder(&self, trigger: Trigger, value: T) {
        let value = Arc::new(value);
        let feed = {
            let mut state = self.lock();
            if state.status.trigger() == Some(trigger) {
                Some((state.consumers.clone(), value))
            } else {
                state.placeholders.insert(trigger, value);
                None
            }
        };
        if let Some((consumers, value)) = feed {
            emit("consumer sink", &consumers, &value);
        }
    }

    /// Removes a previously registered event callback.
    pub fn remove_callback(&self, token: CallbackToken) {
        let mut state = self.lock();
        let events = &mut state.events;
        let _ = events.loading_from_disk.remove(token)
            || events.loading_from_source.remove(token)
            || events.loaded_from_memory.remove(token)
            || events.loaded_from_disk.remove(token)
            || events.loaded_from_source.remove(token)
            || events.loaded.remove(token)
            || events.failed.remove(token)
            || events.canceled.remove(token)
            || events.completed.remove(token);
    }

    // ---- outcome -------------------------------------------------------

    /// Waits for the future to settle.
    ///
    /// Returns the loaded value, `Err(LoadError::Canceled)` on
    /// cancellation, or the failure reason.
    pub async fn wait(&self) -> LoadResult<Arc<T>> {
        let mut settled = self.inner.settled_tx.subscribe();
        // The sender lives in our own inner, so this cannot fail while we
        // hold a handle.
        settled.wait_for(|settled| *settled).await.ok();
        self.outcome()
    }

    fn outcome(&self) -> LoadResult<Arc<T>> {
        let state = self.lock();
        match state.status {
            status if status.is_loaded() => state
                .value
                .clone()
                .ok_or(LoadError::InternalError),
            Status::Canceled => Err(LoadError::Canceled),
            Status::FailedToLoad | Status::Disposed => Err(state
                .error
                .clone()
                .unwrap_or(LoadError::InternalError)),
            _ => Err(LoadError::InternalError),
        }
    }

    // ---- transitions (driven by the loader) ----------------------------

    /// Enters a loading state and feeds its placeholder to all consumers.
    pub(crate) fn mark_loading(&self, tier: Tier) {
        let loading_status = match tier {
            Tier::DiskCache => Status::LoadingFromDiskCache,
            Tier::Source => Status::LoadingFromSource,
            Tier::MemoryCache => return, // memory is a synchronous shortcut
        };
        let (callbacks, feed) = {
            let mut state = self.lock();
            if state.status.is_terminal() || state.cleared {
                return;
            }
            state.status = loading_status;
            let callbacks = match tier {
                Tier::DiskCache => state.events.loading_from_disk.snapshot(),
                _ => state.events.loading_from_source.snapshot(),
            };
            let placeholder = loading_status
                .trigger()
                .and_then(|t| state.placeholders.get(&t).cloned());
            let consumers = placeholder
                .map(|p| (state.consumers.clone(), p));
            (callbacks, consumers)
        };
        tracing::trace!(key = self.inner.key.as_str(), status = ?loading_status, "future loading");
        emit("loading callback", &callbacks, &());
        if let Some((consumers, placeholder)) = feed {
            emit("consumer sink", &consumers, &placeholder);
        }
    }

    /// Settles the future with `value`, loaded from `tier`.
    ///
    /// Fires, in order: the tier-specific loaded callbacks, the generic
    /// loaded callbacks, the consumers, and `completed(true)`, then clears
    /// all callback lists. Ignored if the future already settled.
    pub(crate) fn complete(&self, tier: Tier, value: Arc<T>) {
        let fired = {
            let mut state = self.lock();
            if state.status.is_terminal() || state.cleared {
                tracing::debug!(key = self.inner.key.as_str(), "late completion ignored");
                return;
            }
            state.status = tier.loaded_status();
            state.value = Some(Arc::clone(&value));
            state.completed = Some(true);
            let tier_callbacks = match tier {
                Tier::MemoryCache => state.events.loaded_from_memory.snapshot(),
                Tier::DiskCache => state.events.loaded_from_disk.snapshot(),
                Tier::Source => state.events.loaded_from_source.snapshot(),
            };
            let loaded = state.events.loaded.snapshot();
            let consumers = std::mem::take(&mut state.consumers);
            let completed = state.events.completed.snapshot();
            state.events.clear();
            state.cleared = true;
            (tier_callbacks, loaded, consumers, completed)
        };
        tracing::debug!(key = self.inner.key.as_str(), tier = ?tier, "future loaded");

        let (tier_callbacks, loaded, consumers, completed) = fired;
        emit("loaded callback", &tier_callbacks, &value);
        emit("loaded callback", &loaded, &value);
        for sink in &consumers {
            safe_invoke("consumer sink", || sink(&value));
        }
        emit("completed callback", &completed, &true);
        self.inner.settled_tx.send_replace(true);
    }

    /// Settles the future with `error`.
    ///
    /// Fires the failed callbacks, feeds the failure placeholder to
    /// consumers, fires `completed(false)`, then clears all callback
    /// lists. A future that already settled ignores late failure signals.
    pub(crate) fn fail(&self, error: LoadError) {
        let fired = {
            let mut state = self.lock();
            if state.status.is_terminal() || state.cleared {
                tracing::debug!(key = self.inner.key.as_str(), ?error, "late failure ignored");
                return;
            }
            state.status = Status::FailedToLoad;
            state.error = Some(error.clone());
            state.completed = Some(false);
            let failed = state.events.failed.snapshot();
            let placeholder = state.placeholders.get(&Trigger::FailedToLoad).cloned();
            let consumers = std::mem::take(&mut state.consumers);
            let completed = state.events.completed.snapshot();
            state.events.clear();
            state.cleared = true;
            (failed, placeholder, consumers, completed)
        };
        tracing::debug!(key = self.inner.key.as_str(), %error, "future failed");

        let (failed, placeholder, consumers, completed) = fired;
        emit("failed callback", &failed, &error);
        if let Some(placeholder) = placeholder {
            for sink in &consumers {
                safe_invoke("consumer sink", || sink(&placeholder));
            }
        }
        emit("completed callback", &completed, &false);
        self.inner.settled_tx.send_replace(true);
    }

    /// Cancels the load.
    ///
    /// A no-op (logged at debug, not an error) when the future already
    /// loaded, failed, was canceled, or was cleared. Otherwise fires the
    /// canceled callbacks, feeds the cancellation placeholder to consumers,
    /// fires `completed(false)`, clears all callback lists and signals the
    /// cooperative cancellation token.
    pub fn cancel(&self) {
        let fired = {
            let mut state = self.lock();
            if state.status.is_terminal() || state.cleared {
                tracing::debug!(
                    key = self.inner.key.as_str(),
                    status = ?state.status,
                    "cancel ignored, future already settled"
                );
                return;
            }
            state.status = Status::Canceled;
            state.completed = Some(false);
            let canceled = state.events.canceled.snapshot();
            let placeholder = state.placeholders.get(&Trigger::Canceled).cloned();
            let consumers = std::mem::take(&mut state.consumers);
            let completed = state.events.completed.snapshot();
            state.events.clear();
            state.cleared = true;
            (canceled, placeholder, consumers, completed)
        };
        tracing::debug!(key = self.inner.key.as_str(), "future canceled");
        self.inner.cancel.cancel();

        let (canceled, placeholder, consumers, completed) = fired;
        emit("canceled callback", &canceled, &());
        if let Some(placeholder) = placeholder {
            for sink in &consumers {
                safe_invoke("consumer sink", || sink(&placeholder));
            }
        }
        emit("completed callback", &completed, &false);
        self.inner.settled_tx.send_replace(true);
    }

    /// Disposes the future.
    ///
    /// Cancels the operation if it is still pending (with the same effects
    /// as [`cancel`](Self::cancel)), then releases the value and error and
    /// drops all placeholders. Idempotent; no event ever fires after
    /// disposal.
    pub fn dispose(&self) {
        self.cancel();
        let mut state = self.lock();
        if state.status == Status::Disposed {
            return;
        }
        state.status = Status::Disposed;
        state.value = None;
        state.error = None;
        state.placeholders.clear();
        state.consumers.clear();
        state.events.clear();
        state.cleared = true;
    }
}

impl<T> Drop for FutureInner<T> {
    fn drop(&mut self) {
        // Backstop only: the last handle is gone, nobody can observe events
        // anymore. Make sure a still-pending operation gets its cooperative
        // cancellation signal.
        let state = self.state.get_mut().unwrap();
        if !state.status.is_terminal() {
            tracing::debug!(
                key = self.key.as_str(),
                status = ?state.status,
                "load future dropped while pending, canceling"
            );
            self.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    use super::*;

    fn future() -> LoadFuture<String> {
        LoadFuture::new("key", Duration::from_secs(5))
    }

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) + Clone) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let log = log.clone();
            move |entry: &str| log.lock().unwrap().push(entry.to_owned())
        };
        (log, sink)
    }

    #[test]
    fn test_ids_are_monotonic() {
        let a = future();
        let b = future();
        assert!(b.id() > a.id());
    }

    #[test]
    fn test_event_order_on_source_load() {
        let fut = future();
        let (log, record) = recorder();

        let r = record.clone();
        fut.on_loading_from_source(move || r("loading_from_source"));
        let r = record.clone();
        fut.on_loaded_from_source(move |v| r(&format!("loaded_from_source:{v}")));
        let r = record.clone();
        fut.on_loaded(move |v| r(&format!("loaded:{v}")));
        let r = record.clone();
        fut.consume(move |v| r(&format!("consume:{v}")));
        let r = record.clone();
        fut.on_completed(move |ok| r(&format!("completed:{ok}")));

        fut.mark_loading(Tier::Source);
        fut.complete(Tier::Source, Arc::new("V".into()));

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "loading_from_source",
                "loaded_from_source:V",
                "loaded:V",
                "consume:V",
                "completed:true",
            ]
        );
        assert_eq!(fut.status(), Status::LoadedFromSource);
        assert_eq!(fut.value().unwrap().as_str(), "V");
    }

    #[test]
    fn test_completed_fires_exactly_once() {
        let fut = future();
        let completions = Arc::new(AtomicUsize::new(0));
        let c = completions.clone();
        fut.on_completed(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        fut.complete(Tier::Source, Arc::new("V".into()));
        fut.complete(Tier::DiskCache, Arc::new("W".into()));
        fut.fail(LoadError::InternalError);
        fut.cancel();

        assert_eq!(completions.load(Ordering::SeqCst), 1);
        assert_eq!(fut.status(), Status::LoadedFromSource);
        assert_eq!(fut.value().unwrap().as_str(), "V");
    }

    #[test]
    fn test_late_subscription_fires_immediately() {
        let fut = future();
        fut.complete(Tier::MemoryCache, Arc::new("V".into()));

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        fut.on_loaded(move |v| {
            assert_eq!(v, "V");
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let h = hits.clone();
        fut.on_loaded_from_memory_cache(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        let h = hits.clone();
        fut.on_completed(move |ok| {
            assert!(ok);
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        // events for states never reached stay silent
        fut.on_failed(|_| panic!("never failed"));
        fut.on_canceled(|| panic!("never canceled"));
    }

    #[test]
    fn test_failure_order_and_late_failed_subscription() {
        let fut = future();
        let (log, record) = recorder();

        let r = record.clone();
        fut.on_failed(move |e| r(&format!("failed:{e}")));
        let r = record.clone();
        fut.on_completed(move |ok| r(&format!("completed:{ok}")));

        fut.fail(LoadError::Source("boom".into()));
        assert_eq!(
            *log.lock().unwrap(),
            vec!["failed:fetch failed: boom", "completed:false"]
        );
        assert_eq!(fut.error(), Some(LoadError::Source("boom".into())));
        assert!(fut.value().is_none());

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        fut.on_failed(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_is_noop_after_load() {
        let fut = future();
        fut.complete(Tier::Source, Arc::new("V".into()));
        fut.cancel();
        assert_eq!(fut.status(), Status::LoadedFromSource);
        assert!(!fut.is_canceled());
    }

    #[test]
    fn test_cancel_fires_events_and_token() {
        let fut = future();
        let (log, record) = recorder();
        let r = record.clone();
        fut.on_canceled(move || r("canceled"));
        let r = record.clone();
        fut.on_completed(move |ok| r(&format!("completed:{ok}")));

        let token = fut.cancel_token();
        assert!(!token.is_cancelled());
        fut.cancel();
        assert!(token.is_cancelled());
        assert_eq!(*log.lock().unwrap(), vec!["canceled", "completed:false"]);

        // idempotent
        fut.cancel();
        assert_eq!(log.lock().unwrap().len(), 2);
        assert!(fut.value().is_none());
        assert!(fut.error().is_none());
    }

    #[test]
    fn test_placeholder_feeds_consumers_on_loading() {
        let fut = future();
        let (log, record) = recorder();
        let r = record.clone();
        fut.consume(move |v| r(&format!("sink:{v}")));
        fut.set_placeholder(Trigger::LoadingFromSource, "loading...".into());

        fut.mark_loading(Tier::Source);
        assert_eq!(*log.lock().unwrap(), vec!["sink:loading..."]);
        // the placeholder does not become the value
        assert!(fut.value().is_none());

        fut.complete(Tier::Source, Arc::new("V".into()));
        assert_eq!(*log.lock().unwrap(), vec!["sink:loading...", "sink:V"]);
    }

    #[test]
    fn test_placeholder_for_current_state_feeds_immediately() {
        let fut = future();
        let (log, record) = recorder();
        let r = record.clone();
        fut.consume(move |v| r(&format!("sink:{v}")));

        fut.mark_loading(Tier::Source);
        assert!(log.lock().unwrap().is_empty());

        fut.set_placeholder(Trigger::LoadingFromSource, "late placeholder".into());
        assert_eq!(*log.lock().unwrap(), vec!["sink:late placeholder"]);
    }

    #[test]
    fn test_late_consumer_sees_active_placeholder() {
        let fut = future();
        fut.set_placeholder(Trigger::FailedToLoad, "broken".into());
        fut.fail(LoadError::Source("gone".into()));

        let (log, record) = recorder();
        let r = record.clone();
        fut.consume(move |v| r(&format!("sink:{v}")));
        assert_eq!(*log.lock().unwrap(), vec!["sink:broken"]);
    }

    #[test]
    fn test_debug_output() {
        let fut = future();
        let rendered = format!("{fut:?}");
        assert!(rendered.contains("\"key\""));
        assert!(rendered.contains("Initialized"));
    }

    #[test]
    fn test_settled_future_does_not_accumulate_callbacks() {
        let fut = future();
        fut.complete(Tier::Source, Arc::new("V".into()));

        // none of these conditions can occur anymore; the callbacks must
        // not pile up in the cleared lists
        fut.on_failed(|_| {});
        fut.on_canceled(|| {});
        fut.on_loading_from_source(|| {});
        fut.on_loading_from_disk_cache(|| {});
        fut.on_loaded_from_disk_cache(|_| {});

        let state = fut.lock();
        assert!(state.events.failed.is_empty());
        assert!(state.events.canceled.is_empty());
        assert!(state.events.loading_from_source.is_empty());
        assert!(state.events.loading_from_disk.is_empty());
        assert!(state.events.loaded_from_disk.is_empty());
    }

    #[test]
    fn test_remove_callback() {
        let fut = future();
        let token = fut.on_loaded(|_| panic!("removed callback must not fire"));
        fut.remove_callback(token);
        fut.complete(Tier::Source, Arc::new("V".into()));
    }

    #[test]
    fn test_dispose_releases_everything() {
        let fut = future();
        fut.set_placeholder(Trigger::LoadingFromSource, "p".into());
        fut.complete(Tier::Source, Arc::new("V".into()));
        assert!(fut.value().is_some());

        fut.dispose();
        assert_eq!(fut.status(), Status::Disposed);
        assert!(fut.value().is_none());
        assert!(fut.error().is_none());

        // idempotent
        fut.dispose();
        assert_eq!(fut.status(), Status::Disposed);
    }

    #[test]
    fn test_dispose_cancels_pending() {
        let fut = future();
        let (log, record) = recorder();
        let r = record.clone();
        fut.on_canceled(move || r("canceled"));

        fut.dispose();
        assert_eq!(*log.lock().unwrap(), vec!["canceled"]);
        assert_eq!(fut.status(), Status::Disposed);
    }

    #[tokio::test]
    async fn test_wait_outcomes() {
        let loaded = future();
        loaded.complete(Tier::Source, Arc::new("V".into()));
        assert_eq!(loaded.wait().await.unwrap().as_str(), "V");

        let failed = future();
        failed.fail(LoadError::Source("boom".into()));
        assert_eq!(
            failed.wait().await.unwrap_err(),
            LoadError::Source("boom".into())
        );

        let canceled = future();
        canceled.cancel();
        assert_eq!(canceled.wait().await.unwrap_err(), LoadError::Canceled);
    }

    #[tokio::test]
    async fn test_wait_pending_then_settle() {
        let fut = future();
        let waiter = {
            let fut = fut.clone();
            tokio::spawn(async move { fut.wait().await })
        };
        tokio::task::yield_now().await;
        fut.complete(Tier::Source, Arc::new("V".into()));
        assert_eq!(waiter.await.unwrap().unwrap().as_str(), "V");
    }
}
