//! An asynchronous, tiered resource loader.
//!
//! Resources are identified by an opaque string key (typically a URL) and
//! flow through three tiers: a synchronous in-memory cache of decoded
//! values, an on-disk byte cache with serialized I/O, and the injected
//! origin transport. Every request returns a [`LoadFuture`] reporting
//! fine-grained lifecycle events; concurrent requests for the same key are
//! deduplicated so at most one fetch per key is ever in flight.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use bytes::Bytes;
//! use futures::future::BoxFuture;
//! use loadcache::{Fetcher, LoadResult, LoaderBuilder};
//!
//! struct HttpFetcher;
//!
//! impl Fetcher for HttpFetcher {
//!     fn fetch<'a>(&'a self, key: &'a str) -> BoxFuture<'a, LoadResult<Bytes>> {
//!         unimplemented!("transport goes here")
//!     }
//! }
//!
//! # async fn example() -> anyhow::Result<()> {
//! let loader = LoaderBuilder::new(
//!     Arc::new(HttpFetcher),
//!     Arc::new(|bytes: &[u8]| String::from_utf8(bytes.to_vec()).ok()),
//! )
//! .cache_name("images")
//! .build()?;
//!
//! let value = loader.load("https://example.com/a.png").wait().await?;
//! # Ok(())
//! # }
//! ```

mod caching;
mod config;
mod error;
mod events;
mod future;
mod loader;
pub mod logging;
mod refs;
mod registry;
mod subscription;

pub use caching::{DiskCache, MemoryCache, ReleaseFn};
pub use config::{Config, LogFormat, Logging};
pub use error::{CacheError, LoadError, LoadResult};
pub use events::CallbackToken;
pub use future::{LoadFuture, Status, Tier, Trigger};
pub use loader::{DecodeFn, Fetcher, LoadOptions, Loader, LoaderBuilder};
pub use refs::{ClearEvent, RefCounters, Reference, ReferenceRegistry};
pub use subscription::{Listener, SubscriptionToken, WeakBroadcast};
