use std::fmt::Write as _;
use std::io;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};

use crate::error::CacheError;

/// How many jobs may queue up before submitters are backpressured.
const JOB_QUEUE_SIZE: usize = 256;

/// The asynchronous disk tier: a byte store with one file per key.
///
/// All reads, writes and removals are serialized through a single worker
/// task consuming a job queue. Callers perceive this as "eventually runs,
/// in submission order": concurrent saves and loads for any keys never race
/// on the filesystem, and writes cannot interleave corruptingly. Writes go
/// through a temp file and are persisted atomically.
///
/// File names are derived from a SHA-256 hash of the key, fanned out into a
/// one-byte subdirectory to keep directories small.
pub struct DiskCache {
    cache_dir: PathBuf,
    tmp_dir: PathBuf,
    job_tx: mpsc::Sender<DiskJob>,
}

impl Clone for DiskCache {
    fn clone(&self) -> Self {
        DiskCache {
            cache_dir: self.cache_dir.clone(),
            tmp_dir: self.tmp_dir.clone(),
            job_tx: self.job_tx.clone(),
        }
    }
}

impl std::fmt::Debug for DiskCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskCache")
            .field("cache_dir", &self.cache_dir)
            .finish()
    }
}

enum DiskJob {
    Save {
        path: PathBuf,
        tmp_dir: PathBuf,
        bytes: Bytes,
        done: oneshot::Sender<Result<(), CacheError>>,
    },
    Load {
        path: PathBuf,
        done: oneshot::Sender<Result<Option<Bytes>, CacheError>>,
    },
    Remove {
        path: PathBuf,
        done: oneshot::Sender<Result<(), CacheError>>,
    },
    Clear {
        cache_dir: PathBuf,
        done: oneshot::Sender<Result<(), CacheError>>,
    },
}

impl DiskCache {
    /// Creates the cache under `<root>/<name>` and spawns its I/O worker.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(root: &Path, name: &str) -> io::Result<Self> {
        let cache_dir = root.join(name);
        let tmp_dir = root.join("tmp");
        std::fs::create_dir_all(&cache_dir)?;
        std::fs::create_dir_all(&tmp_dir)?;

        let (job_tx, job_rx) = mpsc::channel(JOB_QUEUE_SIZE);
        tokio::spawn(Self::io_worker(job_rx));

        Ok(DiskCache {
            cache_dir,
            tmp_dir,
            job_tx,
        })
    }

    /// Long running task executing disk jobs one at a time, in submission
    /// order.
    async fn io_worker(mut job_rx: mpsc::Receiver<DiskJob>) {
        while let Some(job) = job_rx.recv().await {
            match job {
                DiskJob::Save {
                    path,
                    tmp_dir,
                    bytes,
                    done,
                } => {
                    done.send(write_atomically(&path, &tmp_dir, &bytes).await)
                        .ok();
                }
                DiskJob::Load { path, done } => {
                    done.send(read_entry(&path).await).ok();
                }
                DiskJob::Remove { path, done } => {
                    done.send(remove_entry(&path).await).ok();
                }
                DiskJob::Clear { cache_dir, done } => {
                    done.send(clear_dir(&cache_dir).await).ok();
                }
            }
        }
        tracing::debug!("disk cache worker terminated");
    }

    /// The file path backing `key`.
    pub fn entry_path(&self, key: &str) -> PathBuf {
        let hash = Sha256::digest(key.as_bytes());
        let mut name = String::with_capacity(62);
        for b in &hash[1..] {
            name.write_fmt(format_args!("{b:02x}")).unwrap();
        }
        self.cache_dir.join(format!("{:02x}", hash[0])).join(name)
    }

    /// A fast existence probe for `key`.
    ///
    /// Metadata only; does not go through the worker queue.
    pub async fn contains(&self, key: &str) -> bool {
        fs::try_exists(self.entry_path(key)).await.unwrap_or(false)
    }

    /// Persists `bytes` as the entry for `key`, replacing any previous one.
    pub async fn save(&self, key: &str, bytes: Bytes) -> Result<(), CacheError> {
        self.submit(|done| DiskJob::Save {
            path: self.entry_path(key),
            tmp_dir: self.tmp_dir.clone(),
            bytes,
            done,
        })
        .await
    }

    /// Reads the entry for `key`, or `None` if it does not exist.
    pub async fn load(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        self.submit(|done| DiskJob::Load {
            path: self.entry_path(key),
            done,
        })
        .await
    }

    /// Deletes the entry for `key`. Absent entries are not an error.
    pub async fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.submit(|done| DiskJob::Remove {
            path: self.entry_path(key),
            done,
        })
        .await
    }

    /// Deletes every entry of this cache.
    pub async fn clear(&self) -> Result<(), CacheError> {
        self.submit(|done| DiskJob::Clear {
            cache_dir: self.cache_dir.clone(),
            done,
        })
        .await
    }

    async fn submit<R>(
        &self,
        job: impl FnOnce(oneshot::Sender<Result<R, CacheError>>) -> DiskJob,
    ) -> Result<R, CacheError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.job_tx
            .send(job(done_tx))
            .await
            .map_err(|_| CacheError::WorkerGone)?;
        done_rx.await.map_err(|_| CacheError::WorkerGone)?
    }
}

/// Writes `bytes` to a temp file and atomically persists it at `path`.
async fn write_atomically(path: &Path, tmp_dir: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let temp_file = NamedTempFile::new_in(tmp_dir)?;
    let mut file = fs::File::from_std(temp_file.reopen()?);
    file.write_all(bytes).await?;
    file.flush().await?;

    temp_file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

async fn read_entry(path: &Path) -> Result<Option<Bytes>, CacheError> {
    match fs::read(path).await {
        Ok(data) => Ok(Some(Bytes::from(data))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn remove_entry(path: &Path) -> Result<(), CacheError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn clear_dir(cache_dir: &Path) -> Result<(), CacheError> {
    match fs::remove_dir_all(cache_dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    fs::create_dir_all(cache_dir).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tempdir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let dir = tempdir();
        let cache = DiskCache::new(dir.path(), "objects").unwrap();

        assert!(!cache.contains("imgA").await);
        assert_eq!(cache.load("imgA").await.unwrap(), None);

        cache
            .save("imgA", Bytes::from_static(b"payload"))
            .await
            .unwrap();
        assert!(cache.contains("imgA").await);
        assert_eq!(
            cache.load("imgA").await.unwrap(),
            Some(Bytes::from_static(b"payload"))
        );
    }

    #[tokio::test]
    async fn test_save_replaces() {
        let dir = tempdir();
        let cache = DiskCache::new(dir.path(), "objects").unwrap();

        cache.save("k", Bytes::from_static(b"old")).await.unwrap();
        cache.save("k", Bytes::from_static(b"new")).await.unwrap();
        assert_eq!(
            cache.load("k").await.unwrap(),
            Some(Bytes::from_static(b"new"))
        );
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let dir = tempdir();
        let cache = DiskCache::new(dir.path(), "objects").unwrap();

        cache.save("a", Bytes::from_static(b"1")).await.unwrap();
        cache.save("b", Bytes::from_static(b"2")).await.unwrap();

        cache.remove("a").await.unwrap();
        assert!(!cache.contains("a").await);
        assert!(cache.contains("b").await);
        // removing an absent entry is fine
        cache.remove("a").await.unwrap();

        cache.clear().await.unwrap();
        assert!(!cache.contains("b").await);
        // the cache stays usable after a clear
        cache.save("c", Bytes::from_static(b"3")).await.unwrap();
        assert!(cache.contains("c").await);
    }

    #[tokio::test]
    async fn test_submission_order() {
        let dir = tempdir();
        let cache = DiskCache::new(dir.path(), "objects").unwrap();

        // queue a save and a load without awaiting in between; the worker
        // must run them in submission order.
        let save = cache.save("k", Bytes::from_static(b"ordered"));
        let load = cache.load("k");
        let (save_res, load_res) = futures::join!(save, load);
        save_res.unwrap();
        assert_eq!(load_res.unwrap(), Some(Bytes::from_static(b"ordered")));
    }

    #[test]
    fn test_entry_path_fanout() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let _guard = rt.enter();
        let dir = tempdir();
        let cache = DiskCache::new(dir.path(), "objects").unwrap();

        let path = cache.entry_path("https://example.com/a.png");
        let rel = path.strip_prefix(dir.path().join("objects")).unwrap();
        let components: Vec<_> = rel.components().collect();
        assert_eq!(components.len(), 2);
        assert_eq!(components[0].as_os_str().len(), 2);
        assert_eq!(components[1].as_os_str().len(), 62);

        // stable and collision-free for distinct keys
        assert_eq!(path, cache.entry_path("https://example.com/a.png"));
        assert_ne!(path, cache.entry_path("https://example.com/b.png"));
    }
}
