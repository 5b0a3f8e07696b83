//! Helpers for testing the loader.
//!
//! This crate is private and never published; it only exists as a
//! dev-dependency of `loadcache` so scenario tests share one set of stubs.

#![warn(missing_docs)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;

use loadcache::{Config, DecodeFn, Fetcher, LoadError, LoadResult};

pub use tempfile::TempDir;

/// Setup the test environment.
///
/// - Initializes logs: The logger only captures logs from this crate and
///   fails silently if setup has already happened.
pub fn setup() {
    tracing_subscriber::fmt()
        .with_env_filter("loadcache=trace")
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// `TempDir::into_path()` is called. Files created in it stay on disk for the
/// whole test.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// A loader [`Config`] with both tiers enabled and a generous timeout,
/// rooted in `cache_dir`.
pub fn test_config(cache_dir: &TempDir) -> Config {
    Config {
        cache_dir: Some(cache_dir.path().to_owned()),
        timeout: Duration::from_secs(10),
        ..Config::default()
    }
}

/// A decode function producing the fetched bytes as a `String`.
pub fn utf8_decoder() -> DecodeFn<String> {
    Arc::new(|bytes| String::from_utf8(bytes.to_vec()).ok())
}

/// A scripted origin transport.
///
/// Responses are registered per key; unknown keys fail with a source error.
/// Every call is counted so tests can assert on deduplication.
#[derive(Default)]
pub struct StubFetcher {
    responses: Mutex<HashMap<String, LoadResult<Bytes>>>,
    hanging: Mutex<HashSet<String>>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
}

impl StubFetcher {
    /// Creates a fetcher with no scripted responses.
    pub fn new() -> Arc<Self> {
        Arc::new(StubFetcher::default())
    }

    /// Scripts a successful response for `key`.
    pub fn respond(&self, key: &str, bytes: impl Into<Bytes>) {
        let mut responses = self.responses.lock().unwrap();
        responses.insert(key.to_owned(), Ok(bytes.into()));
    }

    /// Scripts a failure for `key`.
    pub fn fail(&self, key: &str, message: &str) {
        let mut responses = self.responses.lock().unwrap();
        responses.insert(key.to_owned(), Err(LoadError::Source(message.to_owned())));
    }

    /// Makes fetches for `key` never resolve.
    pub fn hang(&self, key: &str) {
        let mut hanging = self.hanging.lock().unwrap();
        hanging.insert(key.to_owned());
    }

    /// Lets fetches for `key` resolve again.
    pub fn unhang(&self, key: &str) {
        let mut hanging = self.hanging.lock().unwrap();
        hanging.remove(key);
    }

    /// Delays every response by `delay`.
    pub fn delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// How many times [`Fetcher::fetch`] was invoked.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Fetcher for StubFetcher {
    fn fetch<'a>(&'a self, key: &'a str) -> BoxFuture<'a, LoadResult<Bytes>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let hangs = self.hanging.lock().unwrap().contains(key);
        let delay = *self.delay.lock().unwrap();
        let response = self
            .responses
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .unwrap_or_else(|| Err(LoadError::Source(format!("no stub response for {key:?}"))));

        Box::pin(async move {
            if hangs {
                futures::future::pending::<()>().await;
            }
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            response
        })
    }
}
