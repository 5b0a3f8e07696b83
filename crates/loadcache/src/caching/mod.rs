//! The two cache tiers in front of the origin.
//!
//! A load request walks the tiers in order:
//!
//! - The in-memory tier ([`MemoryCache`]) is synchronous and holds decoded
//!   values. Presence means "ready to serve without I/O". Eviction is gated
//!   by the reference counters, never by the cache itself.
//! - The disk tier ([`DiskCache`]) is an asynchronous byte store with one
//!   file per key. All of its I/O is serialized through a single worker
//!   task, so concurrent saves and loads never race on the filesystem.
//! - On a full miss the loader fetches from the origin and populates
//!   whichever tiers are enabled before the future completes.
//!
//! A successful disk load always re-populates the memory tier (when
//! enabled), so the next request for the same key is a synchronous hit.

use std::sync::Arc;

mod disk;
mod memory;

pub use disk::DiskCache;
pub use memory::MemoryCache;

/// Frees native resources tied to a cached value.
///
/// Invoked by the reference-counting layer and by memory-cache eviction.
/// The callable must tolerate being handed a value that other `Arc` clones
/// may still observe; it runs through the panic isolation of
/// [`safe_invoke`](crate::events::safe_invoke).
pub type ReleaseFn<T> = Arc<dyn Fn(&T) + Send + Sync>;
