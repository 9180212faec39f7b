//! Directory representation of a LINDI container (`.lindi.d`).
//!
//! The same logical object as the tar, for local workflows: members are plain
//! files under a root directory, so no entry/index members are needed and
//! member offsets are per-file.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _};
use tracing::instrument;

use super::{MANIFEST_NAME, TRASH_PREFIX, TarErrorKind, TarResult, random_suffix};
use crate::format::rfs::ReferenceFileSystem;

#[derive(Debug)]
pub struct LindiDirContainer {
    root: PathBuf,
}

fn check_member_name(name: &str) -> TarResult<()> {
    let escapes = name.starts_with('/')
        || name.split('/').any(|segment| segment == ".." || segment.is_empty());
    if escapes {
        return Err(TarErrorKind::MemberNotFound { name: name.to_string() }.into());
    }
    Ok(())
}

impl LindiDirContainer {
    #[instrument]
    pub async fn open(root: &Path) -> TarResult<Self> {
        let manifest = root.join(MANIFEST_NAME);
        if !tokio::fs::try_exists(&manifest).await.map_err(TarErrorKind::Io)? {
            return Err(TarErrorKind::CorruptContainer {
                reason: format!("directory container has no {MANIFEST_NAME}"),
            }
            .into());
        }
        Ok(Self { root: root.to_path_buf() })
    }

    #[instrument(skip(rfs))]
    pub async fn create(root: &Path, rfs: &ReferenceFileSystem) -> TarResult<Self> {
        tokio::fs::create_dir_all(root).await.map_err(TarErrorKind::Io)?;
        let container = Self { root: root.to_path_buf() };
        container.write_rfs(rfs).await?;
        Ok(container)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn has_member(&self, name: &str) -> bool {
        check_member_name(name).is_ok()
            && tokio::fs::try_exists(self.root.join(name)).await.unwrap_or(false)
    }

    pub async fn read_member(&self, name: &str) -> TarResult<Bytes> {
        check_member_name(name)?;
        match tokio::fs::read(self.root.join(name)).await {
            Ok(data) => Ok(data.into()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(TarErrorKind::MemberNotFound { name: name.to_string() }.into())
            }
            Err(e) => Err(TarErrorKind::Io(e).into()),
        }
    }

    pub async fn read_member_range(
        &self,
        name: &str,
        offset: u64,
        size: u64,
    ) -> TarResult<Bytes> {
        check_member_name(name)?;
        let path = self.root.join(name);
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TarErrorKind::MemberNotFound { name: name.to_string() }.into());
            }
            Err(e) => return Err(TarErrorKind::Io(e).into()),
        };
        let len = file.metadata().await.map_err(TarErrorKind::Io)?.len();
        if offset + size > len {
            return Err(TarErrorKind::SelfRefOutOfBounds { offset, size }.into());
        }
        file.seek(std::io::SeekFrom::Start(offset)).await.map_err(TarErrorKind::Io)?;
        let mut buf = vec![0u8; size as usize];
        file.read_exact(&mut buf).await.map_err(TarErrorKind::Io)?;
        Ok(buf.into())
    }

    /// Atomic per-member write: temp file in the same directory, then rename.
    pub async fn write_member(&self, name: &str, data: &[u8]) -> TarResult<()> {
        check_member_name(name)?;
        let path = self.root.join(name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(TarErrorKind::Io)?;
        }
        let tmp = path.with_extension(format!("tmp-{}", random_suffix()));
        tokio::fs::write(&tmp, data).await.map_err(TarErrorKind::Io)?;
        tokio::fs::rename(&tmp, &path).await.map_err(TarErrorKind::Io)?;
        Ok(())
    }

    pub async fn write_rfs(&self, rfs: &ReferenceFileSystem) -> TarResult<()> {
        let json = rfs.to_json_bytes().map_err(|e| TarErrorKind::CorruptContainer {
            reason: format!("cannot serialize manifest: {e}"),
        })?;
        self.write_member(MANIFEST_NAME, &json).await
    }

    pub async fn trash_member(&self, name: &str) -> TarResult<()> {
        check_member_name(name)?;
        let from = self.root.join(name);
        let trash_name = format!("{name}.{}", random_suffix());
        let to = self.root.join(TRASH_PREFIX.trim_start_matches("./")).join(trash_name);
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(TarErrorKind::Io)?;
        }
        match tokio::fs::rename(&from, &to).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(TarErrorKind::MemberNotFound { name: name.to_string() }.into())
            }
            Err(e) => Err(TarErrorKind::Io(e).into()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::format::rfs::RefValue;

    fn small_rfs() -> ReferenceFileSystem {
        let mut rfs = ReferenceFileSystem::empty_root_group();
        rfs.insert("g/.zgroup", RefValue::Inline(r#"{"zarr_format":2}"#.to_string()));
        rfs
    }

    #[tokio::test]
    async fn test_create_write_read() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("t.lindi.d");
        let container = LindiDirContainer::create(&root, &small_rfs()).await.unwrap();
        container.write_member("blobs/g/d/0.0", b"0123456789").await.unwrap();

        let container = LindiDirContainer::open(&root).await.unwrap();
        let manifest = container.read_member(MANIFEST_NAME).await.unwrap();
        assert!(ReferenceFileSystem::from_slice(&manifest)
            .unwrap()
            .contains_key("g/.zgroup"));
        let range =
            container.read_member_range("blobs/g/d/0.0", 2, 4).await.unwrap();
        assert_eq!(range.as_ref(), b"2345");
    }

    #[tokio::test]
    async fn test_range_out_of_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("t.lindi.d");
        let container = LindiDirContainer::create(&root, &small_rfs()).await.unwrap();
        container.write_member("blobs/x", b"abc").await.unwrap();
        let err = container.read_member_range("blobs/x", 1, 5).await.unwrap_err();
        assert!(matches!(err.kind(), TarErrorKind::SelfRefOutOfBounds { .. }));
    }

    #[tokio::test]
    async fn test_trash_member() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("t.lindi.d");
        let container = LindiDirContainer::create(&root, &small_rfs()).await.unwrap();
        container.write_member("blobs/x", b"abc").await.unwrap();
        container.trash_member("blobs/x").await.unwrap();
        assert!(!container.has_member("blobs/x").await);
        let err = container.read_member("blobs/x").await.unwrap_err();
        assert!(matches!(err.kind(), TarErrorKind::MemberNotFound { .. }));
    }

    #[tokio::test]
    async fn test_rejects_escaping_names() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("t.lindi.d");
        let container = LindiDirContainer::create(&root, &small_rfs()).await.unwrap();
        assert!(container.read_member("../outside").await.is_err());
        assert!(container.write_member("/abs", b"x").await.is_err());
    }
}
