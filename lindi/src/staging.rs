use std::convert::Infallible;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use rand::Rng as _;
use rand::distr::Alphanumeric;
use sha2::{Digest as _, Sha256};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::error::LindiError;
use crate::format::rfs::{ExternalRef, RefValue, ReferenceFileSystem};
use crate::tar::{LindiTarFile, TarError, dir::LindiDirContainer};

/// Consolidated staging files are capped at this size, a good size for
/// cloud bucket objects.
const MAX_CONSOLIDATED_FILE_SIZE: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StagingErrorKind {
    #[error("i/o error in staging area")]
    Io(#[from] std::io::Error),
    #[error("staged blob disappeared: `{path}`")]
    MissingBlob { path: String },
    #[error("error writing staged blobs into container")]
    Tar(#[from] Box<TarError>),
    #[error("upload failed: {0}")]
    Upload(String),
}

pub type StagingError = LindiError<StagingErrorKind>;

impl<E> From<E> for StagingError
where
    E: Into<StagingErrorKind>,
{
    fn from(value: E) -> Self {
        Self::new(value.into())
    }
}

impl From<Infallible> for StagingErrorKind {
    fn from(value: Infallible) -> Self {
        match value {}
    }
}

pub type StagingResult<T> = Result<T, StagingError>;

fn random_str(n: usize) -> String {
    let mut rng = rand::rng();
    (0..n).map(|_| rng.sample(Alphanumeric) as char).collect::<String>().to_lowercase()
}

/// Uploads staged artifacts to wherever the application keeps them; returns
/// the URL (or local path) each artifact ends up at.
#[async_trait]
pub trait UploadSink: Send + Sync {
    async fn upload_blob(&self, path: &Path) -> StagingResult<String>;
    async fn upload_manifest(&self, path: &Path) -> StagingResult<String>;
}

/// A scoped directory collecting chunks written to a mutable store until
/// finalization folds them into a container. The directory is removed on
/// drop unless it was explicitly kept.
#[derive(Debug)]
pub struct StagingArea {
    dir: PathBuf,
    remove_on_drop: bool,
}

impl StagingArea {
    /// Create a fresh staging directory under `base_dir`, named so that
    /// lexicographic order is chronological.
    pub fn create(base_dir: &Path) -> StagingResult<Self> {
        let name =
            format!("{}-{}", Utc::now().format("%Y%m%d%H%M%S"), random_str(8));
        let dir = base_dir.join(name);
        std::fs::create_dir_all(&dir).map_err(StagingErrorKind::Io)?;
        Ok(Self { dir, remove_on_drop: true })
    }

    /// Use an exact directory, e.g. `<file>.d` next to the file being edited.
    /// The directory outlives the staging area; the caller owns it.
    pub fn at(dir: &Path) -> StagingResult<Self> {
        std::fs::create_dir_all(dir).map_err(StagingErrorKind::Io)?;
        Ok(Self { dir: dir.to_path_buf(), remove_on_drop: false })
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    /// Keep the directory on drop; used when finalization moved the blobs
    /// somewhere durable already.
    pub fn keep(&mut self) {
        self.remove_on_drop = false;
    }

    /// True when a reference URL points into this staging area.
    pub fn owns_url(&self, url: &str) -> bool {
        Path::new(url).starts_with(&self.dir)
    }

    /// Store a chunk under a content-addressed filename and return its path.
    pub async fn store_blob(&self, data: &[u8]) -> StagingResult<PathBuf> {
        let mut hasher = Sha256::new();
        hasher.update(data);
        let digest: String =
            hasher.finalize().iter().map(|b| format!("{b:02x}")).collect();
        let path = self.dir.join("blobs").join(&digest[..2]).join(&digest);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(StagingErrorKind::Io)?;
        }
        if tokio::fs::try_exists(&path).await.map_err(StagingErrorKind::Io)? {
            // identical content is already staged
            return Ok(path);
        }
        let tmp = self.dir.join(format!(".tmp-{}", random_str(8)));
        tokio::fs::write(&tmp, data).await.map_err(StagingErrorKind::Io)?;
        tokio::fs::rename(&tmp, &path).await.map_err(StagingErrorKind::Io)?;
        Ok(path)
    }

    /// Relative path of a staged blob inside the staging directory.
    fn relative(&self, url: &str) -> StagingResult<String> {
        Path::new(url)
            .strip_prefix(&self.dir)
            .ok()
            .and_then(|p| p.to_str())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                StagingErrorKind::MissingBlob { path: url.to_string() }.into()
            })
    }

    /// The keys of `rfs` whose references point into this staging area.
    fn staged_keys(&self, rfs: &ReferenceFileSystem) -> Vec<String> {
        rfs.refs
            .iter()
            .filter_map(|(key, value)| {
                value.as_external().filter(|r| self.owns_url(&r.url)).map(|_| key.clone())
            })
            .collect()
    }

    /// Coalesce staged chunks into large consolidated files, rewriting the
    /// references to offsets within them. Bounded by
    /// [`MAX_CONSOLIDATED_FILE_SIZE`] per output file.
    #[instrument(skip(self, rfs))]
    pub async fn consolidate_chunks(
        &self,
        rfs: &mut ReferenceFileSystem,
    ) -> StagingResult<()> {
        let keys = self.staged_keys(rfs);
        if keys.len() <= 1 {
            return Ok(());
        }
        info!(files = keys.len(), "consolidating staged chunks");
        let consolidated_id = random_str(8);
        let mut consolidated_index = 0u32;
        let mut offset = 0u64;
        let mut current_path = self
            .dir
            .join(format!("consolidated.{consolidated_id}.{consolidated_index}"));
        let mut consumed: Vec<PathBuf> = Vec::new();
        tokio::fs::write(&current_path, b"").await.map_err(StagingErrorKind::Io)?;
        for key in keys {
            let Some(RefValue::External(reference)) = rfs.get(&key).cloned() else {
                continue;
            };
            let blob_path = PathBuf::from(&reference.url);
            let data = tokio::fs::read(&blob_path).await.map_err(|_| {
                StagingErrorKind::MissingBlob { path: reference.url.clone() }
            })?;
            if offset > 0 && offset + data.len() as u64 > MAX_CONSOLIDATED_FILE_SIZE {
                consolidated_index += 1;
                offset = 0;
                current_path = self.dir.join(format!(
                    "consolidated.{consolidated_id}.{consolidated_index}"
                ));
                tokio::fs::write(&current_path, b"")
                    .await
                    .map_err(StagingErrorKind::Io)?;
            }
            let mut file = tokio::fs::OpenOptions::new()
                .append(true)
                .open(&current_path)
                .await
                .map_err(StagingErrorKind::Io)?;
            use tokio::io::AsyncWriteExt as _;
            file.write_all(&data).await.map_err(StagingErrorKind::Io)?;
            let new_ref = ExternalRef::new(
                current_path.to_string_lossy().to_string(),
                offset + reference.offset,
                reference.size,
            );
            rfs.insert(key, RefValue::External(new_ref));
            offset += data.len() as u64;
            consumed.push(blob_path);
        }
        consumed.sort();
        consumed.dedup();
        for path in consumed {
            let _ = tokio::fs::remove_file(&path).await;
        }
        Ok(())
    }

    /// Append every staged blob into the tar and rewrite its references to
    /// archive-absolute self references.
    #[instrument(skip_all)]
    pub async fn finalize_into_tar(
        &self,
        rfs: &mut ReferenceFileSystem,
        tar: &mut LindiTarFile,
    ) -> StagingResult<()> {
        let keys = self.staged_keys(rfs);
        let mut members: Vec<(String, Bytes)> = Vec::new();
        let mut member_names: Vec<String> = Vec::new();
        for key in &keys {
            let Some(RefValue::External(reference)) = rfs.get(key) else { continue };
            let member_name = format!("blobs/{}", self.relative(&reference.url)?);
            if !member_names.contains(&member_name) {
                let data = tokio::fs::read(&reference.url).await.map_err(|_| {
                    StagingErrorKind::MissingBlob { path: reference.url.clone() }
                })?;
                members.push((member_name.clone(), data.into()));
                member_names.push(member_name);
            }
        }
        let infos = tar
            .write_members(members)
            .await
            .map_err(|e| StagingErrorKind::Tar(Box::new(e)))?;
        for key in keys {
            let Some(RefValue::External(reference)) = rfs.get(&key).cloned() else {
                continue;
            };
            let member_name = format!("blobs/{}", self.relative(&reference.url)?);
            let Some(info) = infos.iter().find(|m| m.name == member_name) else {
                continue;
            };
            debug!(key = %key, member = %member_name, "rewriting staged ref to self ref");
            rfs.insert(
                key,
                RefValue::external(
                    crate::format::SELF_REF_URL,
                    info.data_offset + reference.offset,
                    reference.size,
                ),
            );
        }
        Ok(())
    }

    /// Copy every staged blob into the directory container and rewrite its
    /// references to member-relative self references.
    #[instrument(skip_all)]
    pub async fn finalize_into_dir(
        &self,
        rfs: &mut ReferenceFileSystem,
        container: &LindiDirContainer,
    ) -> StagingResult<()> {
        for key in self.staged_keys(rfs) {
            let Some(RefValue::External(reference)) = rfs.get(&key).cloned() else {
                continue;
            };
            let member_name = format!("blobs/{}", self.relative(&reference.url)?);
            if !container.has_member(&member_name).await {
                let data = tokio::fs::read(&reference.url).await.map_err(|_| {
                    StagingErrorKind::MissingBlob { path: reference.url.clone() }
                })?;
                container
                    .write_member(&member_name, &data)
                    .await
                    .map_err(|e| StagingErrorKind::Tar(Box::new(e)))?;
            }
            rfs.insert(
                key,
                RefValue::external(
                    format!("./{member_name}"),
                    reference.offset,
                    reference.size,
                ),
            );
        }
        Ok(())
    }

    /// Upload staged blobs and the manifest through the sink, returning the
    /// URL of the uploaded manifest. References are rewritten to the URLs
    /// the sink reports.
    #[instrument(skip(self, rfs, sink))]
    pub async fn upload(
        &self,
        rfs: &ReferenceFileSystem,
        sink: &dyn UploadSink,
        consolidate: bool,
    ) -> StagingResult<String> {
        let mut rfs = rfs.clone();
        if consolidate {
            self.consolidate_chunks(&mut rfs).await?;
        }
        for key in self.staged_keys(&rfs) {
            let Some(RefValue::External(reference)) = rfs.get(&key).cloned() else {
                continue;
            };
            let url = sink.upload_blob(Path::new(&reference.url)).await?;
            rfs.insert(
                key,
                RefValue::External(ExternalRef::new(url, reference.offset, reference.size)),
            );
        }
        let manifest_path = self.dir.join("rfs.lindi.json");
        let json = rfs.to_json_bytes().map_err(|e| {
            StagingErrorKind::Upload(format!("cannot serialize manifest: {e}"))
        })?;
        tokio::fs::write(&manifest_path, &json).await.map_err(StagingErrorKind::Io)?;
        sink.upload_manifest(&manifest_path).await
    }

    pub fn cleanup(&self) {
        if self.dir.exists() {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }
}

impl Drop for StagingArea {
    fn drop(&mut self) {
        if self.remove_on_drop {
            self.cleanup();
        }
    }
}
