use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::cache::CachingResolver;
use crate::config::LindiConfig;
use crate::error::LindiError;
use crate::fetch::FetchError;
use crate::format::metadata::{ZArray, parse_chunk_name};
use crate::format::rfs::{RefValue, ReferenceFileSystem};
use crate::format::{FormatError, is_metadata_key, is_self_url, split_key};
use crate::staging::{StagingArea, StagingError};
use crate::tar::{LindiTarFile, TarError, TarErrorKind, dir::LindiDirContainer};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreErrorKind {
    #[error("key not found: `{key}`")]
    NotFound { key: String },
    #[error("cannot write to read-only store")]
    ReadOnly,
    #[error("chunk key `{key}` is outside the declared array shape")]
    ChunkOutOfBounds { key: String },
    #[error("self reference for key `{key}` but the store has no container")]
    SelfRefWithoutContainer { key: String },
    #[error("object id mismatch resolving reference to `{path}`: expected {expected}, found {found}")]
    ObjectIdMismatch { path: String, expected: String, found: String },
    #[error("bad metadata: `{0}`")]
    BadMetadata(#[from] serde_json::Error),
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Tar(#[from] TarError),
    #[error(transparent)]
    Staging(#[from] StagingError),
    #[error(transparent)]
    Cache(#[from] crate::cache::CacheError),
}

pub type StoreError = LindiError<StoreErrorKind>;

impl<E> From<E> for StoreError
where
    E: Into<StoreErrorKind>,
{
    fn from(value: E) -> Self {
        Self::new(value.into())
    }
}

impl From<Infallible> for StoreErrorKind {
    fn from(value: Infallible) -> Self {
        match value {}
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// The container a store is bound to, when it was opened from a tar or a
/// directory. Self references resolve through it.
#[derive(Debug)]
pub enum Container {
    Tar(LindiTarFile),
    Dir(LindiDirContainer),
}

#[derive(Debug)]
struct StoreInner {
    rfs: ReferenceFileSystem,
    container: Option<Container>,
    staging: Option<StagingArea>,
    json_path: Option<std::path::PathBuf>,
}

/// A Zarr v2 key/value store over a reference file system.
///
/// Entries are inline bytes or `(url, offset, size)` references; one uniform
/// random access surface covers inline data, bytes embedded in the enclosing
/// container, and ranges of arbitrary remote files. Reads are concurrent;
/// a writer serializes with readers through the single RwLock.
#[derive(Debug, Clone)]
pub struct ReferenceStore {
    inner: Arc<RwLock<StoreInner>>,
    resolver: Arc<CachingResolver>,
    config: LindiConfig,
    read_only: bool,
}

impl ReferenceStore {
    pub fn new(
        rfs: ReferenceFileSystem,
        resolver: Arc<CachingResolver>,
        config: LindiConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RwLock::new(StoreInner {
                rfs,
                container: None,
                staging: None,
                json_path: None,
            })),
            resolver,
            config,
            read_only: true,
        }
    }

    pub fn writable(mut self) -> Self {
        self.read_only = false;
        self
    }

    pub(crate) async fn bind_container(&self, container: Container) {
        self.inner.write().await.container = Some(container);
    }

    pub(crate) async fn bind_json_path(&self, path: std::path::PathBuf) {
        self.inner.write().await.json_path = Some(path);
    }

    pub async fn set_staging_area(&self, staging: StagingArea) -> StoreResult<()> {
        if self.read_only {
            return Err(StoreErrorKind::ReadOnly.into());
        }
        self.inner.write().await.staging = Some(staging);
        Ok(())
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn config(&self) -> &LindiConfig {
        &self.config
    }

    pub async fn get(&self, key: &str) -> StoreResult<Bytes> {
        self.get_cancellable(key, None).await
    }

    #[instrument(skip(self, cancel))]
    pub async fn get_cancellable(
        &self,
        key: &str,
        cancel: Option<&CancellationToken>,
    ) -> StoreResult<Bytes> {
        let guard = self.inner.read().await;
        let value = guard
            .rfs
            .get(key)
            .ok_or_else(|| StoreErrorKind::NotFound { key: key.to_string() })?;
        match value {
            RefValue::Inline(_) | RefValue::Base64(_) => {
                // inline_bytes is Some for both inline forms
                value.inline_bytes().ok_or_else(|| {
                    StoreErrorKind::NotFound { key: key.to_string() }.into()
                })
            }
            RefValue::External(reference) if is_self_url(&reference.url) => {
                let container = guard.container.as_ref().ok_or_else(|| {
                    StoreErrorKind::SelfRefWithoutContainer { key: key.to_string() }
                })?;
                resolve_self_ref(
                    container,
                    &reference.url,
                    reference.offset,
                    reference.size,
                )
                .await
            }
            RefValue::External(reference) => Ok(self
                .resolver
                .fetch(&reference.url, reference.offset, reference.size, cancel)
                .await
                .map_err(StoreErrorKind::Fetch)?),
        }
    }

    /// Get several keys concurrently, results in the same order as the keys.
    /// Errors retrieving individual keys are flagged per key.
    pub async fn get_many(
        &self,
        keys: impl IntoIterator<Item = String>,
        concurrency: usize,
    ) -> Vec<StoreResult<Bytes>> {
        use futures::StreamExt as _;
        futures::stream::iter(keys)
            .map(|key| async move { self.get(&key).await })
            .buffered(concurrency.max(1))
            .collect()
            .await
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.inner.read().await.rfs.contains_key(key)
    }

    /// Immediate children under a prefix. Soft-linked groups are plain
    /// entries here; enumeration never dereferences them.
    pub async fn list_dir(&self, prefix: &str) -> Vec<String> {
        self.inner.read().await.rfs.list_dir(prefix)
    }

    pub async fn keys(&self) -> Vec<String> {
        self.inner.read().await.rfs.refs.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.rfs.refs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.rfs.refs.is_empty()
    }

    /// Snapshot of the manifest, staged references included.
    pub async fn to_rfs(&self) -> ReferenceFileSystem {
        self.inner.read().await.rfs.clone()
    }

    /// Store a value. Metadata documents and small chunks are inlined;
    /// larger chunks go to the staging area or straight into the bound
    /// container, leaving an external reference in the manifest.
    #[instrument(skip(self, value), fields(len = value.len()))]
    pub async fn set(&self, key: &str, value: Bytes) -> StoreResult<()> {
        if self.read_only {
            return Err(StoreErrorKind::ReadOnly.into());
        }
        let mut guard = self.inner.write().await;
        let key = key.trim_start_matches('/');
        self.check_chunk_bounds(&guard.rfs, key)?;
        let inline = is_metadata_key(key)
            || value.len() <= self.config.inline_chunk_threshold_bytes() as usize;
        if inline {
            guard.rfs.insert(key, RefValue::from_bytes(&value));
            return Ok(());
        }
        if let Some(staging) = &guard.staging {
            let path = staging.store_blob(&value).await.map_err(StoreErrorKind::Staging)?;
            let url = path.to_string_lossy().to_string();
            debug!(key, url = %url, "staged chunk");
            guard.rfs.insert(
                key,
                RefValue::external(url, 0, value.len() as u64),
            );
            return Ok(());
        }
        match &mut guard.container {
            Some(Container::Tar(tar)) => {
                let member_name = format!("blobs/{key}");
                let info = tar
                    .write_member(&member_name, &value)
                    .await
                    .map_err(StoreErrorKind::Tar)?;
                guard.rfs.insert(
                    key,
                    RefValue::external(
                        crate::format::SELF_REF_URL,
                        info.data_offset,
                        value.len() as u64,
                    ),
                );
                Ok(())
            }
            Some(Container::Dir(container)) => {
                let member_name = format!("blobs/{key}");
                container
                    .write_member(&member_name, &value)
                    .await
                    .map_err(StoreErrorKind::Tar)?;
                guard.rfs.insert(
                    key,
                    RefValue::external(
                        format!("./{member_name}"),
                        0,
                        value.len() as u64,
                    ),
                );
                Ok(())
            }
            None => {
                // a bare JSON store keeps everything in the manifest
                guard.rfs.insert(key, RefValue::from_bytes(&value));
                Ok(())
            }
        }
    }

    pub async fn delete(&self, key: &str) -> StoreResult<()> {
        if self.read_only {
            return Err(StoreErrorKind::ReadOnly.into());
        }
        let mut guard = self.inner.write().await;
        guard
            .rfs
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StoreErrorKind::NotFound { key: key.to_string() }.into())
    }

    /// Persist the manifest into the bound container. A no-op for stores
    /// without one; JSON-file stores persist through
    /// [`crate::file::write_lindi`].
    pub async fn flush(&self) -> StoreResult<()> {
        let mut guard = self.inner.write().await;
        let StoreInner { rfs, container, staging, json_path } = &mut *guard;
        match container {
            Some(Container::Tar(tar)) => {
                if let Some(staging) = staging {
                    staging
                        .finalize_into_tar(rfs, tar)
                        .await
                        .map_err(StoreErrorKind::Staging)?;
                }
                tar.write_rfs(rfs).await.map_err(StoreErrorKind::Tar)?;
                Ok(())
            }
            Some(Container::Dir(dir)) => {
                if let Some(staging) = staging {
                    staging
                        .finalize_into_dir(rfs, dir)
                        .await
                        .map_err(StoreErrorKind::Staging)?;
                }
                dir.write_rfs(rfs).await.map_err(StoreErrorKind::Tar)?;
                Ok(())
            }
            None => match json_path {
                Some(path) => {
                    let json = rfs.to_json_bytes().map_err(StoreErrorKind::Format)?;
                    crate::file::atomic_write(path, &json)
                        .await
                        .map_err(StoreErrorKind::Tar)?;
                    Ok(())
                }
                None => Ok(()),
            },
        }
    }

    /// Resolve an object reference to the store key of its target node,
    /// cross-checking the recorded object ids. A mismatch is a warning by
    /// default and an error when `validate_object_ids` is set.
    pub async fn resolve_reference(
        &self,
        reference: &crate::format::metadata::ObjectReference,
    ) -> StoreResult<String> {
        let target = reference.path.trim_start_matches('/').to_string();
        let guard = self.inner.read().await;
        let exists = target.is_empty()
            || guard.rfs.contains_key(&crate::format::join_key(&target, ".zgroup"))
            || guard.rfs.contains_key(&crate::format::join_key(&target, ".zarray"));
        if !exists {
            return Err(StoreErrorKind::NotFound { key: target }.into());
        }
        if let Some(expected) = &reference.object_id {
            self.check_object_id(&guard.rfs, &target, expected)?;
        }
        if let Some(expected) = &reference.source_object_id {
            self.check_object_id(&guard.rfs, "", expected)?;
        }
        Ok(target)
    }

    fn check_object_id(
        &self,
        rfs: &ReferenceFileSystem,
        path: &str,
        expected: &str,
    ) -> StoreResult<()> {
        let zattrs_key = crate::format::join_key(path, ".zattrs");
        let Some(bytes) = rfs.get(&zattrs_key).and_then(RefValue::inline_bytes) else {
            return Ok(());
        };
        let attrs: serde_json::Value =
            serde_json::from_slice(&bytes).map_err(StoreErrorKind::BadMetadata)?;
        let Some(found) = attrs.get("object_id").and_then(|v| v.as_str()) else {
            return Ok(());
        };
        if found != expected {
            if self.config.validate_object_ids() {
                return Err(StoreErrorKind::ObjectIdMismatch {
                    path: path.to_string(),
                    expected: expected.to_string(),
                    found: found.to_string(),
                }
                .into());
            }
            tracing::warn!(
                path,
                expected,
                found,
                "object id mismatch in reference, continuing"
            );
        }
        Ok(())
    }

    /// Validate a chunk write against the array's declared shape, when the
    /// sibling `.zarray` is present.
    fn check_chunk_bounds(
        &self,
        rfs: &ReferenceFileSystem,
        key: &str,
    ) -> StoreResult<()> {
        if is_metadata_key(key) {
            return Ok(());
        }
        let (parent, name) = split_key(key);
        let Some(coords) = parse_chunk_name(name) else {
            return Ok(());
        };
        let zarray_key = crate::format::join_key(parent, ".zarray");
        let Some(zarray_bytes) =
            rfs.get(&zarray_key).and_then(RefValue::inline_bytes)
        else {
            return Ok(());
        };
        let zarray = ZArray::from_slice(&zarray_bytes).map_err(StoreErrorKind::Format)?;
        if !zarray.chunk_in_bounds(&coords) {
            return Err(StoreErrorKind::ChunkOutOfBounds { key: key.to_string() }.into());
        }
        Ok(())
    }
}

async fn resolve_self_ref(
    container: &Container,
    url: &str,
    offset: u64,
    size: u64,
) -> StoreResult<Bytes> {
    match container {
        Container::Tar(tar) => {
            let name = url.trim_start_matches("./");
            if name.is_empty() || name == "." {
                Ok(tar.read_self_range(offset, size).await.map_err(StoreErrorKind::Tar)?)
            } else {
                Ok(tar
                    .read_member_range(name, offset, size)
                    .await
                    .map_err(StoreErrorKind::Tar)?)
            }
        }
        Container::Dir(dir) => {
            let name = url.trim_start_matches("./");
            if name.is_empty() || name == "." {
                return Err(StoreError::from(StoreErrorKind::Tar(TarError::new(
                    TarErrorKind::SelfRefOutOfBounds { offset, size },
                ))));
            }
            Ok(dir
                .read_member_range(name, offset, size)
                .await
                .map_err(StoreErrorKind::Tar)?)
        }
    }
}
