//! Opening and writing the three on-disk shapes of a LINDI store:
//! a bare JSON manifest, a random-access tar, or a directory.

use std::path::Path;
use std::sync::Arc;

use rand::Rng as _;
use rand::distr::Alphanumeric;
use tracing::instrument;

use crate::cache::{CachingResolver, LocalCache};
use crate::config::LindiConfig;
use crate::fetch::UrlResolver;
use crate::format::rfs::ReferenceFileSystem;
use crate::staging::StagingArea;
use crate::store::{Container, ReferenceStore, StoreErrorKind, StoreResult};
use crate::tar::{
    LindiTarFile, MANIFEST_NAME, TAR_ENTRY_NAME, TarErrorKind, dir::LindiDirContainer,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Json,
    Tar,
    Dir,
}

impl Format {
    /// Guess the format from the file name alone.
    pub fn from_name(name: &str) -> Format {
        if name.ends_with(".tar") {
            Format::Tar
        } else if name.ends_with(".d") || name.ends_with('/') {
            Format::Dir
        } else {
            Format::Json
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenMode {
    #[default]
    Read,
    ReadWrite,
}

fn is_remote(path_or_url: &str) -> bool {
    path_or_url.starts_with("http://") || path_or_url.starts_with("https://")
}

fn mk_resolver(
    config: &LindiConfig,
    base_dir: Option<std::path::PathBuf>,
) -> StoreResult<Arc<CachingResolver>> {
    let cache = match config.cache {
        Some(_) => {
            Some(Arc::new(LocalCache::new(config.cache()).map_err(StoreErrorKind::Cache)?))
        }
        None => None,
    };
    Ok(Arc::new(CachingResolver::new(
        UrlResolver::new(config.retries(), base_dir),
        cache,
    )))
}

/// Open a LINDI store from a local path or a URL.
///
/// A `.lindi.tar` opens with two range requests; a `.lindi.json` is read
/// whole; a `.lindi.d` directory reads its `lindi.json`. Self references in
/// the manifest resolve through the opened container.
pub async fn open_lindi(path_or_url: &str) -> StoreResult<ReferenceStore> {
    open_lindi_opts(path_or_url, LindiConfig::default(), OpenMode::Read).await
}

#[instrument(skip(config))]
pub async fn open_lindi_opts(
    path_or_url: &str,
    config: LindiConfig,
    mode: OpenMode,
) -> StoreResult<ReferenceStore> {
    if is_remote(path_or_url) {
        if mode == OpenMode::ReadWrite {
            return Err(StoreErrorKind::ReadOnly.into());
        }
        return open_remote(path_or_url, config).await;
    }

    let path = Path::new(path_or_url);
    let resolver = mk_resolver(&config, path.parent().map(Path::to_path_buf))?;

    if path.is_dir() {
        let container = LindiDirContainer::open(path).await.map_err(StoreErrorKind::Tar)?;
        let manifest =
            container.read_member(MANIFEST_NAME).await.map_err(StoreErrorKind::Tar)?;
        let rfs =
            ReferenceFileSystem::from_slice(&manifest).map_err(StoreErrorKind::Format)?;
        let store = mk_store(rfs, resolver, config, mode);
        store.bind_container(Container::Dir(container)).await;
        return Ok(store);
    }

    if sniff_tar(path).await? {
        let tar = LindiTarFile::open_local(path).await.map_err(StoreErrorKind::Tar)?;
        let manifest =
            tar.read_member(MANIFEST_NAME).await.map_err(StoreErrorKind::Tar)?;
        let rfs =
            ReferenceFileSystem::from_slice(&manifest).map_err(StoreErrorKind::Format)?;
        let store = mk_store(rfs, resolver, config, mode);
        store.bind_container(Container::Tar(tar)).await;
        return Ok(store);
    }

    let data = tokio::fs::read(path).await.map_err(|e| {
        StoreErrorKind::Tar(crate::tar::TarError::new(TarErrorKind::Io(e)))
    })?;
    let rfs = ReferenceFileSystem::from_slice(&data).map_err(StoreErrorKind::Format)?;
    let store = mk_store(rfs, resolver, config, mode);
    store.bind_json_path(path.to_path_buf()).await;
    if store.is_read_only() {
        return Ok(store);
    }
    // writes to a JSON store stage next to the file
    let staging_dir = std::path::PathBuf::from(format!("{path_or_url}.d"));
    let staging = StagingArea::at(&staging_dir).map_err(StoreErrorKind::Staging)?;
    store.set_staging_area(staging).await?;
    Ok(store)
}

fn mk_store(
    rfs: ReferenceFileSystem,
    resolver: Arc<CachingResolver>,
    config: LindiConfig,
    mode: OpenMode,
) -> ReferenceStore {
    let store = ReferenceStore::new(rfs, resolver, config);
    match mode {
        OpenMode::Read => store,
        OpenMode::ReadWrite => store.writable(),
    }
}

async fn open_remote(url: &str, config: LindiConfig) -> StoreResult<ReferenceStore> {
    let resolver = mk_resolver(&config, None)?;
    if Format::from_name(url) == Format::Tar {
        let tar_resolver = Arc::new(UrlResolver::new(config.retries(), None));
        let tar = LindiTarFile::open_remote(url, tar_resolver)
            .await
            .map_err(StoreErrorKind::Tar)?;
        let manifest =
            tar.read_member(MANIFEST_NAME).await.map_err(StoreErrorKind::Tar)?;
        let rfs =
            ReferenceFileSystem::from_slice(&manifest).map_err(StoreErrorKind::Format)?;
        let store = mk_store(rfs, resolver, config, OpenMode::Read);
        store.bind_container(Container::Tar(tar)).await;
        Ok(store)
    } else {
        let data = crate::fetch::fetch_whole_url(url, &config.retries())
            .await
            .map_err(StoreErrorKind::Fetch)?;
        let rfs = ReferenceFileSystem::from_slice(&data).map_err(StoreErrorKind::Format)?;
        Ok(mk_store(rfs, resolver, config, OpenMode::Read))
    }
}

/// Does the file start with the container's well-known first member?
async fn sniff_tar(path: &Path) -> StoreResult<bool> {
    use tokio::io::AsyncReadExt as _;
    let io = |e| StoreErrorKind::Tar(crate::tar::TarError::new(TarErrorKind::Io(e)));
    let mut file = tokio::fs::File::open(path).await.map_err(io)?;
    let mut head = [0u8; 512];
    let n = file.read(&mut head).await.map_err(io)?;
    Ok(n >= TAR_ENTRY_NAME.len() && head.starts_with(TAR_ENTRY_NAME.as_bytes()))
}

/// Serialize a reference file system to one of the three on-disk shapes.
/// The write is atomic at the outermost file: tempfile then rename.
#[instrument(skip(rfs))]
pub async fn write_lindi(
    rfs: &ReferenceFileSystem,
    path: &Path,
    format: Format,
) -> StoreResult<()> {
    match format {
        Format::Json => {
            let json = rfs.to_json_bytes().map_err(StoreErrorKind::Format)?;
            atomic_write(path, &json).await.map_err(StoreErrorKind::Tar)?;
            Ok(())
        }
        Format::Tar => {
            let tmp = tmp_sibling(path);
            LindiTarFile::create(&tmp, rfs).await.map_err(StoreErrorKind::Tar)?;
            tokio::fs::rename(&tmp, path).await.map_err(|e| {
                StoreErrorKind::Tar(crate::tar::TarError::new(TarErrorKind::Io(e)))
            })?;
            Ok(())
        }
        Format::Dir => {
            LindiDirContainer::create(path, rfs).await.map_err(StoreErrorKind::Tar)?;
            Ok(())
        }
    }
}

fn tmp_sibling(path: &Path) -> std::path::PathBuf {
    let mut rng = rand::rng();
    let suffix: String = (0..8).map(|_| rng.sample(Alphanumeric) as char).collect();
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("lindi");
    path.with_file_name(format!(".{name}.tmp-{suffix}"))
}

pub(crate) async fn atomic_write(
    path: &Path,
    data: &[u8],
) -> Result<(), crate::tar::TarError> {
    let tmp = tmp_sibling(path);
    tokio::fs::write(&tmp, data).await.map_err(TarErrorKind::Io)?;
    tokio::fs::rename(&tmp, path).await.map_err(TarErrorKind::Io)?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use bytes::Bytes;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::format::rfs::RefValue;

    fn sample_rfs() -> ReferenceFileSystem {
        let mut rfs = ReferenceFileSystem::empty_root_group();
        rfs.insert("g/.zgroup", RefValue::Inline(r#"{"zarr_format":2}"#.to_string()));
        rfs.insert("g/.zattrs", RefValue::Inline(r#"{"a":7}"#.to_string()));
        rfs
    }

    #[test]
    fn test_format_from_name() {
        assert_eq!(Format::from_name("x.lindi.tar"), Format::Tar);
        assert_eq!(Format::from_name("x.lindi.d"), Format::Dir);
        assert_eq!(Format::from_name("x.lindi.json"), Format::Json);
    }

    #[tokio::test]
    async fn test_round_trip_all_formats() {
        let dir = tempfile::tempdir().unwrap();
        let rfs = sample_rfs();
        for (name, format) in [
            ("t.lindi.json", Format::Json),
            ("t.lindi.tar", Format::Tar),
            ("t.lindi.d", Format::Dir),
        ] {
            let path = dir.path().join(name);
            write_lindi(&rfs, &path, format).await.unwrap();
            let store = open_lindi(path.to_str().unwrap()).await.unwrap();
            assert_eq!(store.to_rfs().await, rfs, "format {format:?}");
            let attrs = store.get("g/.zattrs").await.unwrap();
            assert_eq!(attrs.as_ref(), br#"{"a":7}"#);
        }
    }

    #[tokio::test]
    async fn test_tar_write_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.lindi.tar");
        write_lindi(&sample_rfs(), &path, Format::Tar).await.unwrap();

        let store = open_lindi_opts(
            path.to_str().unwrap(),
            LindiConfig::default(),
            OpenMode::ReadWrite,
        )
        .await
        .unwrap();
        let chunk = Bytes::from(vec![5u8; 4000]);
        store.set("g/d/0", chunk.clone()).await.unwrap();
        store.flush().await.unwrap();

        let store = open_lindi(path.to_str().unwrap()).await.unwrap();
        assert_eq!(store.get("g/d/0").await.unwrap(), chunk);
        let rfs = store.to_rfs().await;
        let reference = rfs.get("g/d/0").unwrap().as_external().unwrap();
        assert_eq!(reference.url, crate::format::SELF_REF_URL);
    }

    #[tokio::test]
    async fn test_json_rw_with_staging() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.lindi.json");
        write_lindi(&sample_rfs(), &path, Format::Json).await.unwrap();

        let store = open_lindi_opts(
            path.to_str().unwrap(),
            LindiConfig::default(),
            OpenMode::ReadWrite,
        )
        .await
        .unwrap();
        let chunk = Bytes::from(vec![3u8; 2000]);
        store.set("g/d/0", chunk.clone()).await.unwrap();
        assert_eq!(store.get("g/d/0").await.unwrap(), chunk);
    }
}
