use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use quick_cache::sync::Cache;
use sha2::{Digest as _, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::CacheSettings;
use crate::error::LindiError;
use crate::fetch::{FetchResult, UrlResolver};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CacheErrorKind {
    #[error("i/o error in chunk cache")]
    Io(#[from] std::io::Error),
    #[error("cached data size does not match: expected {expected}, got {actual}")]
    InvalidSize { expected: u64, actual: u64 },
}

pub type CacheError = LindiError<CacheErrorKind>;

impl<E> From<E> for CacheError
where
    E: Into<CacheErrorKind>,
{
    fn from(value: E) -> Self {
        Self::new(value.into())
    }
}

impl From<Infallible> for CacheErrorKind {
    fn from(value: Infallible) -> Self {
        match value {}
    }
}

pub type CacheResult<T> = Result<T, CacheError>;

fn default_cache_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".lindi").join("cache"))
        .unwrap_or_else(|| PathBuf::from(".lindi-cache"))
}

/// Entry key: strong digest of the full (url, offset, size) triple, so that
/// distinct ranges can never collide.
fn entry_digest(url: &str, offset: u64, size: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hasher.update(b"\n");
    hasher.update(offset.to_le_bytes());
    hasher.update(size.to_le_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Disk backed memoization of remote range reads, shared by all stores that
/// are handed the same instance.
///
/// Writes are atomic (temp file then rename) so concurrent readers never see
/// a partial entry. Eviction is LRU by file modification time, guarded by a
/// lock file so only one process evicts at a time.
#[derive(Debug)]
pub struct LocalCache {
    dir: PathBuf,
    settings: CacheSettings,
    hot: Cache<String, Bytes>,
    evicting: Mutex<()>,
}

impl LocalCache {
    pub fn new(settings: CacheSettings) -> CacheResult<Self> {
        let dir = settings.directory.clone().unwrap_or_else(default_cache_dir);
        std::fs::create_dir_all(&dir).map_err(CacheErrorKind::Io)?;
        let hot = Cache::new(settings.num_memory_chunks() as usize);
        Ok(Self { dir, settings, hot, evicting: Mutex::new(()) })
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, digest: &str) -> PathBuf {
        self.dir.join(&digest[..2]).join(digest)
    }

    pub async fn get(
        &self,
        url: &str,
        offset: u64,
        size: u64,
    ) -> CacheResult<Option<Bytes>> {
        let digest = entry_digest(url, offset, size);
        if let Some(bytes) = self.hot.get(&digest) {
            return Ok(Some(bytes));
        }
        let path = self.entry_path(&digest);
        match tokio::fs::read(&path).await {
            Ok(data) => {
                if data.len() as u64 != size {
                    // a stale or truncated entry; drop it and report a miss
                    warn!(?path, "removing cache entry with wrong size");
                    let _ = tokio::fs::remove_file(&path).await;
                    return Ok(None);
                }
                let bytes = Bytes::from(data);
                self.hot.insert(digest, bytes.clone());
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CacheErrorKind::Io(e).into()),
        }
    }

    #[instrument(skip(self, data))]
    pub async fn put(
        &self,
        url: &str,
        offset: u64,
        size: u64,
        data: Bytes,
    ) -> CacheResult<()> {
        if data.len() as u64 != size {
            return Err(CacheErrorKind::InvalidSize {
                expected: size,
                actual: data.len() as u64,
            }
            .into());
        }
        let digest = entry_digest(url, offset, size);
        let path = self.entry_path(&digest);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(CacheErrorKind::Io)?;
        }
        let tmp = self.dir.join(format!(".tmp-{digest}"));
        tokio::fs::write(&tmp, &data).await.map_err(CacheErrorKind::Io)?;
        tokio::fs::rename(&tmp, &path).await.map_err(CacheErrorKind::Io)?;
        self.hot.insert(digest, data);
        self.maybe_evict().await;
        Ok(())
    }

    /// Delete least recently used entries until the cache fits its budget.
    /// Best effort: failures only log.
    async fn maybe_evict(&self) {
        let Ok(_guard) = self.evicting.try_lock() else {
            return;
        };
        let lock_path = self.dir.join(".lock");
        // advisory cross-process exclusion; skip the pass if somebody else
        // holds the lock
        let lock_file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path);
        if lock_file.is_err() {
            return;
        }
        let result = self.evict_pass().await;
        let _ = std::fs::remove_file(&lock_path);
        if let Err(e) = result {
            warn!(error = %e, "cache eviction pass failed");
        }
    }

    async fn evict_pass(&self) -> CacheResult<()> {
        let max_bytes = self.settings.max_size_bytes();
        let mut entries: Vec<(PathBuf, u64, std::time::SystemTime)> = Vec::new();
        let mut total = 0u64;
        let mut outer = tokio::fs::read_dir(&self.dir).await.map_err(CacheErrorKind::Io)?;
        while let Some(shard) = outer.next_entry().await.map_err(CacheErrorKind::Io)? {
            if !shard.file_type().await.map_err(CacheErrorKind::Io)?.is_dir() {
                continue;
            }
            let mut inner =
                tokio::fs::read_dir(shard.path()).await.map_err(CacheErrorKind::Io)?;
            while let Some(entry) = inner.next_entry().await.map_err(CacheErrorKind::Io)? {
                let meta = entry.metadata().await.map_err(CacheErrorKind::Io)?;
                let modified =
                    meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH);
                total += meta.len();
                entries.push((entry.path(), meta.len(), modified));
            }
        }
        if total <= max_bytes {
            return Ok(());
        }
        entries.sort_by_key(|(_, _, modified)| *modified);
        for (path, len, _) in entries {
            if total <= max_bytes {
                break;
            }
            debug!(?path, "evicting cache entry");
            if tokio::fs::remove_file(&path).await.is_ok() {
                total = total.saturating_sub(len);
            }
        }
        Ok(())
    }
}

/// A [`UrlResolver`] that consults the local cache before going to the
/// network, and stores what it fetched.
#[derive(Debug)]
pub struct CachingResolver {
    resolver: UrlResolver,
    cache: Option<Arc<LocalCache>>,
}

impl CachingResolver {
    pub fn new(resolver: UrlResolver, cache: Option<Arc<LocalCache>>) -> Self {
        Self { resolver, cache }
    }

    pub async fn fetch(
        &self,
        url: &str,
        offset: u64,
        size: u64,
        cancel: Option<&CancellationToken>,
    ) -> FetchResult<Bytes> {
        if let Some(cache) = &self.cache {
            match cache.get(url, offset, size).await {
                Ok(Some(bytes)) => {
                    debug!(url, offset, size, "chunk cache hit");
                    return Ok(bytes);
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "chunk cache lookup failed"),
            }
        }
        let bytes = self.resolver.fetch(url, offset, size, cancel).await?;
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.put(url, offset, size, bytes.clone()).await {
                warn!(error = %e, "chunk cache store failed");
            }
        }
        Ok(bytes)
    }
}
