use std::time::Duration;

use thiserror::Error;

/// An error that settles a [`LoadFuture`](crate::LoadFuture) in a failed or
/// canceled state.
///
/// These are signaled through the future, never thrown out of the loader's
/// public entry points.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// The requested key was empty. No I/O is attempted.
    #[error("empty key")]
    InvalidKey,
    /// The configured timeout elapsed before the load completed.
    #[error("load timed out after {0:?}")]
    Timeout(Duration),
    /// The injected fetch function reported a failure.
    ///
    /// The attached string contains the transport's own description.
    #[error("fetch failed: {0}")]
    Source(String),
    /// The injected decode function could not produce a value from the
    /// fetched bytes.
    ///
    /// For the state machine this behaves exactly like [`Source`](Self::Source):
    /// the future fails and no other tier is tried.
    #[error("decode failed: {0}")]
    Decode(String),
    /// The load was canceled. Not a failure: a canceled future exposes
    /// neither value nor error.
    #[error("canceled")]
    Canceled,
    /// An unexpected error in loadcache itself.
    #[error("internal error")]
    InternalError,
}

/// The outcome of a load operation.
pub type LoadResult<T> = Result<T, LoadError>;

/// Errors reported by cache maintenance operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A value is already cached for this key and `replace` was not set.
    #[error("cache entry for {key:?} already exists")]
    Conflict {
        /// The conflicting key.
        key: String,
    },
    /// The entry cannot be cleared because live references still point at it.
    ///
    /// This is the one failure that is surfaced loudly: silently freeing
    /// memory a [`Reference`](crate::Reference) still aliases would be a
    /// use-after-free risk.
    #[error("cache entry for {key:?} is still referenced {count} time(s)")]
    InUse {
        /// The affected key.
        key: String,
        /// The outstanding reference count.
        count: usize,
    },
    /// The disk cache worker is no longer running.
    #[error("disk cache worker is gone")]
    WorkerGone,
    /// A filesystem error during disk cache maintenance.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
