//! The orchestrator: walks the cache tiers and drives futures to
//! completion.
//!
//! For every request the [`Loader`] creates a [`LoadFuture`], then walks
//! memory cache → dedup registry → disk cache → origin. The first request
//! for a key becomes its leader and performs the actual I/O; concurrent
//! requests follow the leader and re-enter the walk once it finishes,
//! finding the memory tier warm.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::caching::{DiskCache, MemoryCache, ReleaseFn};
use crate::config::Config;
use crate::error::{CacheError, LoadError, LoadResult};
use crate::future::{LoadFuture, Status, Tier};
use crate::refs::{RefCounters, Reference, ReferenceRegistry};
use crate::registry::LoadRegistry;

/// The origin transport, injected by the caller.
///
/// The loader only cares about bytes or an error; nothing protocol-specific
/// leaks into the orchestration.
pub trait Fetcher: Send + Sync {
    /// Fetches the raw bytes for `key` from the origin.
    fn fetch<'a>(&'a self, key: &'a str) -> BoxFuture<'a, LoadResult<Bytes>>;
}

/// Decodes raw bytes into a value, injected by the caller.
///
/// Must be pure with respect to loader state. Returning `None` fails the
/// load; no other tier is tried.
pub type DecodeFn<T> = Arc<dyn Fn(&[u8]) -> Option<T> + Send + Sync>;

/// Per-request overrides of the process-wide [`Config`] defaults.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Overrides [`Config::timeout`] for this load.
    pub timeout: Option<Duration>,
    /// Overrides [`Config::use_memory_cache`] for this load.
    pub use_memory_cache: Option<bool>,
    /// Overrides [`Config::use_disk_cache`] for this load.
    pub use_disk_cache: Option<bool>,
}

/// Assembles a [`Loader`] from its injected collaborators.
pub struct LoaderBuilder<T> {
    config: Config,
    fetcher: Arc<dyn Fetcher>,
    decode: DecodeFn<T>,
    release: Option<ReleaseFn<T>>,
    cache_name: String,
}

impl<T: Send + Sync + 'static> LoaderBuilder<T> {
    /// Starts a builder with the two mandatory collaborators.
    pub fn new(fetcher: Arc<dyn Fetcher>, decode: DecodeFn<T>) -> Self {
        LoaderBuilder {
            config: Config::default(),
            fetcher,
            decode,
            release: None,
            cache_name: "objects".to_owned(),
        }
    }

    /// Uses `config` instead of the built-in defaults.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Installs a release function for evicted values.
    pub fn release(mut self, release: ReleaseFn<T>) -> Self {
        self.release = Some(release);
        self
    }

    /// Names the disk cache subdirectory for this value type.
    ///
    /// Defaults to `"objects"`.
    pub fn cache_name(mut self, name: &str) -> Self {
        self.cache_name = name.to_owned();
        self
    }

    /// Builds the loader, creating the disk cache directories and spawning
    /// the disk I/O worker.
    ///
    /// Must be called within a tokio runtime when the disk tier is enabled.
    pub fn build(self) -> Result<Loader<T>, CacheError> {
        let disk = match (&self.config.cache_dir, self.config.use_disk_cache) {
            (Some(root), true) => Some(DiskCache::new(root, &self.cache_name)?),
            (None, true) => {
                tracing::debug!("no cache directory configured, disk tier disabled");
                None
            }
            _ => None,
        };

        let counters = RefCounters::default();
        let memory = MemoryCache::new(counters.clone(), self.release);
        let references = ReferenceRegistry::new(memory.clone(), counters.clone());

        Ok(Loader {
            inner: Arc::new(LoaderInner {
                config: self.config,
                fetcher: self.fetcher,
                decode: self.decode,
                memory,
                disk,
                counters,
                references,
                in_flight: LoadRegistry::default(),
            }),
        })
    }
}

/// Outcome of a leader's tier walk, applied to the future after the
/// dedup registry entry has been released.
enum Settle<T> {
    Loaded(Tier, Arc<T>),
    Failed(LoadError),
    Canceled,
    TimedOut,
}

struct LoaderInner<T> {
    config: Config,
    fetcher: Arc<dyn Fetcher>,
    decode: DecodeFn<T>,
    memory: MemoryCache<T>,
    disk: Option<DiskCache>,
    counters: RefCounters,
    references: ReferenceRegistry<T>,
    in_flight: LoadRegistry<T>,
}

/// The loader for one value type.
///
/// Cheap to clone; all clones share the caches and registries.
pub struct Loader<T> {
    inner: Arc<LoaderInner<T>>,
}

impl<T> Clone for Loader<T> {
    fn clone(&self) -> Self {
        Loader {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Loader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loader")
            .field("disk", &self.inner.disk)
            .finish()
    }
}

impl<T: Send + Sync + 'static> Loader<T> {
    /// Starts a load for `key` with the configured defaults.
    ///
    /// Returns immediately; subscribe to the future's events or `await` its
    /// [`wait`](LoadFuture::wait) for the outcome.
    pub fn load(&self, key: &str) -> LoadFuture<T> {
        self.load_with(key, LoadOptions::default())
    }

    /// Starts a load for `key` with per-request overrides.
    pub fn load_with(&self, key: &str, options: LoadOptions) -> LoadFuture<T> {
        let timeout = options.timeout.unwrap_or(self.inner.config.timeout);
        let future = LoadFuture::new(key, timeout);

        if key.is_empty() {
            future.fail(LoadError::InvalidKey);
            return future;
        }

        tracing::debug!(key, id = future.id(), "starting load");
        let loader = self.clone();
        let driven = future.clone();
        tokio::spawn(async move {
            loader.drive(driven, options).await;
        });
        future
    }

    /// The tier walk. Loops so a follower can re-enter after its leader
    /// finishes; the leader's cache writes precede registry release, so the
    /// retry is normally a synchronous memory hit.
    async fn drive(&self, future: LoadFuture<T>, options: LoadOptions) {
        let use_memory = options
            .use_memory_cache
            .unwrap_or(self.inner.config.use_memory_cache);
        let use_disk = options
            .use_disk_cache
            .unwrap_or(self.inner.config.use_disk_cache);
        let disk = self.inner.disk.as_ref().filter(|_| use_disk);
        // One time budget for the whole operation, leader or follower,
        // across re-entries.
        let deadline = tokio::time::Instant::now() + future.timeout();

        loop {
            if future.is_settled() {
                return;
            }

            if use_memory {
                if let Some(value) = self.inner.memory.load(future.key()) {
                    future.complete(Tier::MemoryCache, value);
                    return;
                }
            }

            match self.inner.in_flight.register(&future) {
                None => {
                    self.lead(&future, use_memory, disk, deadline).await;
                    return;
                }
                Some(leader) => {
                    if !self.follow(&future, &leader, deadline).await {
                        return;
                    }
                    // leader gone without failing; retry from the top
                }
            }
        }
    }

    /// Runs the leader's tier walk, racing the cancellation signal and the
    /// timeout, then releases the registry entry and settles the future.
    ///
    /// The registry release happens before any completion callback fires:
    /// a follower waking up observes a leader whose value is already
    /// committed to the caches.
    async fn lead(
        &self,
        future: &LoadFuture<T>,
        use_memory: bool,
        disk: Option<&DiskCache>,
        deadline: tokio::time::Instant,
    ) {
        let cancel = future.cancel_token();
        let settle = tokio::select! {
            _ = cancel.cancelled() => Settle::Canceled,
            outcome = tokio::time::timeout_at(
                deadline,
                self.leader_work(future, use_memory, disk),
            ) => match outcome {
                Ok(settle) => settle,
                Err(_) => Settle::TimedOut,
            },
        };

        self.inner.in_flight.remove(future);

        match settle {
            Settle::Loaded(tier, value) => future.complete(tier, value),
            Settle::Failed(error) => future.fail(error),
            // cancel() already settled the future; only the registry entry
            // needed cleaning up.
            Settle::Canceled => {}
            Settle::TimedOut => {
                if future.status() == Status::LoadingFromSource {
                    tracing::warn!(
                        key = future.key(),
                        timeout = ?future.timeout(),
                        "load timed out while fetching from source"
                    );
                }
                future.fail(LoadError::Timeout(future.timeout()));
            }
        }
    }

    /// Disk then origin. Cache writes happen in here, before the caller
    /// releases the registry entry.
    async fn leader_work(
        &self,
        future: &LoadFuture<T>,
        use_memory: bool,
        disk: Option<&DiskCache>,
    ) -> Settle<T> {
        let key = future.key();

        if let Some(disk) = disk {
            if disk.contains(key).await {
                future.mark_loading(Tier::DiskCache);
                match disk.load(key).await {
                    Ok(Some(bytes)) => {
                        let value = match self.decode(key, &bytes) {
                            Ok(value) => Arc::new(value),
                            Err(error) => return Settle::Failed(error),
                        };
                        if use_memory {
                            self.save_memory(key, &value);
                        }
                        return Settle::Loaded(Tier::DiskCache, value);
                    }
                    Ok(None) => {
                        tracing::debug!(key, "disk cache entry vanished, fetching from source");
                    }
                    Err(error) => {
                        tracing::warn!(
                            key,
                            error = %error,
                            "disk cache read failed, fetching from source"
                        );
                    }
                }
            }
        }

        future.mark_loading(Tier::Source);
        let bytes = match self.inner.fetcher.fetch(key).await {
            Ok(bytes) => bytes,
            Err(error) => return Settle::Failed(error),
        };
        let value = match self.decode(key, &bytes) {
            Ok(value) => Arc::new(value),
            Err(error) => return Settle::Failed(error),
        };

        if let Some(disk) = disk {
            if let Err(error) = disk.save(key, bytes).await {
                tracing::warn!(key, error = %error, "failed to persist fetched bytes");
            }
        }
        if use_memory {
            self.save_memory(key, &value);
        }
        Settle::Loaded(Tier::Source, value)
    }

    /// Mirrors the leader's progress into `future` and waits for the
    /// leader to release the registry entry, for `future` to be canceled,
    /// or for the follower's own deadline to elapse.
    ///
    /// Returns `true` when the caller should re-enter the tier walk.
    async fn follow(
        &self,
        future: &LoadFuture<T>,
        leader: &LoadFuture<T>,
        deadline: tokio::time::Instant,
    ) -> bool {
        tracing::debug!(
            key = future.key(),
            id = future.id(),
            leader = leader.id(),
            "following in-flight load"
        );

        let mirror = future.clone();
        let on_disk = leader.on_loading_from_disk_cache(move || mirror.mark_loading(Tier::DiskCache));
        let mirror = future.clone();
        let on_source = leader.on_loading_from_source(move || mirror.mark_loading(Tier::Source));
        let mirror = future.clone();
        let on_failed = leader.on_failed(move |error| mirror.fail(error.clone()));

        let cancel = future.cancel_token();
        let timed_out = tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep_until(deadline) => true,
            _ = self.inner.in_flight.wait_released(future.key()) => false,
        };

        leader.remove_callback(on_disk);
        leader.remove_callback(on_source);
        leader.remove_callback(on_failed);

        if future.is_settled() {
            return false;
        }
        // the follower's own budget wins over the leader's progress
        if timed_out {
            future.fail(LoadError::Timeout(future.timeout()));
            return false;
        }
        if leader.status() == Status::FailedToLoad {
            future.fail(leader.error().unwrap_or(LoadError::InternalError));
            return false;
        }
        // Success warms the memory tier; a canceled leader simply vacates
        // the slot. Either way the retry is handled by the tier walk.
        true
    }

    fn decode(&self, key: &str, bytes: &[u8]) -> LoadResult<T> {
        // The decode function is caller-supplied; a panic in it must fail
        // this load, not take down the drive task and strand followers.
        let decoded = catch_unwind(AssertUnwindSafe(|| (self.inner.decode)(bytes)));
        match decoded {
            Ok(Some(value)) => Ok(value),
            Ok(None) => Err(LoadError::Decode(format!(
                "no value decoded from {} bytes",
                bytes.len()
            ))),
            Err(_) => {
                tracing::error!(key, "decode function panicked");
                Err(LoadError::Decode("decode function panicked".to_owned()))
            }
        }
    }

    fn save_memory(&self, key: &str, value: &Arc<T>) {
        if let Err(error) = self.inner.memory.save(key, Arc::clone(value), true) {
            tracing::error!(key, error = %error, "failed to store value in memory cache");
        }
    }

    // ---- cache maintenance ---------------------------------------------

    /// Wraps the memory-cached value for `key` in a fresh counted handle.
    pub fn make_reference(&self, key: &str) -> Option<Reference<T>> {
        let value = self.inner.memory.load(key)?;
        Some(self.inner.references.make_reference(key, value))
    }

    /// The current reference count for `key`.
    pub fn counter(&self, key: &str) -> i64 {
        self.inner.counters.count(key)
    }

    /// Clears `key` from the memory tier.
    ///
    /// Live references for the key are disposed first (via the clear
    /// broadcast), then the entry is removed. Fails with
    /// [`CacheError::InUse`] if the counter somehow stayed positive.
    pub fn clear_memory(&self, key: &str) -> Result<(), CacheError> {
        self.inner.references.dispose_key(key);
        self.inner.memory.remove(key)
    }

    /// Clears the whole memory tier, disposing all live references first.
    pub fn clear_memory_all(&self) -> Result<(), CacheError> {
        self.inner.references.dispose_all();
        self.inner.memory.clear()
    }

    /// Deletes the disk entry for `key`. A no-op without a disk tier.
    pub async fn clear_disk(&self, key: &str) -> Result<(), CacheError> {
        match &self.inner.disk {
            Some(disk) => disk.remove(key).await,
            None => Ok(()),
        }
    }

    /// Deletes every disk entry. A no-op without a disk tier.
    pub async fn clear_disk_all(&self) -> Result<(), CacheError> {
        match &self.inner.disk {
            Some(disk) => disk.clear().await,
            None => Ok(()),
        }
    }

    /// The in-memory tier, for inspection.
    pub fn memory_cache(&self) -> &MemoryCache<T> {
        &self.inner.memory
    }

    /// The disk tier, if enabled.
    pub fn disk_cache(&self) -> Option<&DiskCache> {
        self.inner.disk.as_ref()
    }
}
