use std::collections::HashMap;
use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use rand::Rng as _;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _, AsyncWriteExt as _};
use tracing::{debug, instrument};

use crate::error::LindiError;
use crate::fetch::{FetchError, UrlResolver};
use crate::format::rfs::ReferenceFileSystem;

pub mod dir;
pub mod header;

use header::{BLOCK_SIZE, blocks, create_header, header_name, header_size, rename_header};

pub const TAR_ENTRY_NAME: &str = ".tar_entry.json";
pub const TAR_INDEX_NAME: &str = ".tar_index.json";
pub const MANIFEST_NAME: &str = "lindi.json";
pub const TRASH_PREFIX: &str = "./trash/";

pub const TAR_ENTRY_JSON_SIZE: u64 = 1024;
pub const INITIAL_INDEX_CAPACITY: u64 = 8 * 1024;
pub const INITIAL_MANIFEST_CAPACITY: u64 = 8 * 1024;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TarErrorKind {
    #[error("member `{name}` not found in container")]
    MemberNotFound { name: String },
    #[error("container is corrupt: {reason}")]
    CorruptContainer { reason: String },
    #[error("self reference [{offset}, {size}] lies outside every member's data region")]
    SelfRefOutOfBounds { offset: u64, size: u64 },
    #[error("member name `{name}` does not fit in a tar header")]
    NameTooLong { name: String },
    #[error("cannot mutate a remote container")]
    RemoteWrite,
    #[error("i/o error on container")]
    Io(#[from] std::io::Error),
    #[error("json error in container index")]
    Json(#[from] serde_json::Error),
    #[error("error fetching remote container bytes")]
    Fetch(#[from] Box<FetchError>),
}

pub type TarError = LindiError<TarErrorKind>;

impl<E> From<E> for TarError
where
    E: Into<TarErrorKind>,
{
    fn from(value: E) -> Self {
        Self::new(value.into())
    }
}

impl From<Infallible> for TarErrorKind {
    fn from(value: Infallible) -> Self {
        match value {}
    }
}

pub type TarResult<T> = Result<T, TarError>;

/// One row of the member table. Field names match the wire format:
/// name, header offset, data offset, content size, padded capacity.
///
/// For the entry and index members `s == p`: their content is parsed after
/// trimming the whitespace padding, so in-place growth of the index never
/// requires rewriting `.tar_entry.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    #[serde(rename = "n")]
    pub name: String,
    #[serde(rename = "o")]
    pub header_offset: u64,
    #[serde(rename = "d")]
    pub data_offset: u64,
    #[serde(rename = "s")]
    pub size: u64,
    #[serde(rename = "p")]
    pub capacity: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct TarIndex {
    files: Vec<MemberInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct TarEntry {
    index: MemberInfo,
}

#[derive(Debug, Clone)]
enum TarLocation {
    Local(PathBuf),
    Remote { url: String, resolver: Arc<UrlResolver> },
}

/// Pad policy for growable members: start at `initial` and double until the
/// capacity is at least four times the content, leaving room to grow in
/// place.
fn padded_capacity(len: u64, initial: u64) -> u64 {
    let mut total = initial.max(BLOCK_SIZE);
    while total < len.saturating_mul(4) {
        total *= 2;
    }
    total
}

fn is_growable(name: &str) -> bool {
    name == MANIFEST_NAME || name == TAR_INDEX_NAME
}

fn random_suffix() -> String {
    let mut rng = rand::rng();
    (0..10).map(|_| rng.sample(Alphanumeric) as char).collect::<String>().to_lowercase()
}

fn trim_padding(data: &[u8]) -> &[u8] {
    let end = data
        .iter()
        .rposition(|b| !b.is_ascii_whitespace() && *b != 0)
        .map(|p| p + 1)
        .unwrap_or(0);
    &data[..end]
}

/// A tar archive with a self-describing in-archive index.
///
/// The archive always opens with `.tar_entry.json` (exactly 1024 data bytes)
/// whose JSON points at `.tar_index.json`; the index enumerates every member.
/// Opening therefore costs two range reads, local or remote. Designated
/// members carry whitespace padding and can grow in place; when a write
/// exceeds the padded capacity the member is tombstoned under `./trash/` (by
/// rewriting its header only) and a fresh padded member is appended.
#[derive(Debug)]
pub struct LindiTarFile {
    location: TarLocation,
    index: TarIndex,
    lookup: HashMap<String, usize>,
    dirty: bool,
}

impl LindiTarFile {
    #[instrument]
    pub async fn open_local(path: &Path) -> TarResult<Self> {
        let location = TarLocation::Local(path.to_path_buf());
        Self::open(location).await
    }

    #[instrument(skip(resolver))]
    pub async fn open_remote(url: &str, resolver: Arc<UrlResolver>) -> TarResult<Self> {
        let location = TarLocation::Remote { url: url.to_string(), resolver };
        Self::open(location).await
    }

    async fn open(location: TarLocation) -> TarResult<Self> {
        // request 1: the entry header plus its 1024 data bytes
        let head = read_range(&location, 0, BLOCK_SIZE + TAR_ENTRY_JSON_SIZE).await?;
        let header: &[u8; 512] =
            head[..512].try_into().map_err(|_| TarErrorKind::CorruptContainer {
                reason: "archive shorter than one block".to_string(),
            })?;
        if header_name(header) != TAR_ENTRY_NAME {
            return Err(TarErrorKind::CorruptContainer {
                reason: format!("first member must be {TAR_ENTRY_NAME}"),
            }
            .into());
        }
        if header_size(header)? != TAR_ENTRY_JSON_SIZE {
            return Err(TarErrorKind::CorruptContainer {
                reason: format!("{TAR_ENTRY_NAME} must be exactly {TAR_ENTRY_JSON_SIZE} bytes"),
            }
            .into());
        }
        let entry: TarEntry =
            serde_json::from_slice(trim_padding(&head[512..])).map_err(|e| {
                TarErrorKind::CorruptContainer {
                    reason: format!("cannot parse {TAR_ENTRY_NAME}: {e}"),
                }
            })?;

        // request 2: the index
        let index_raw =
            read_range(&location, entry.index.data_offset, entry.index.capacity).await?;
        let index: TarIndex =
            serde_json::from_slice(trim_padding(&index_raw)).map_err(|e| {
                TarErrorKind::CorruptContainer {
                    reason: format!("cannot parse {TAR_INDEX_NAME}: {e}"),
                }
            })?;

        let mut file = Self { location, index, lookup: HashMap::new(), dirty: false };
        file.rebuild_lookup();
        Ok(file)
    }

    fn rebuild_lookup(&mut self) {
        self.lookup = self
            .index
            .files
            .iter()
            .enumerate()
            .map(|(i, m)| (m.name.clone(), i))
            .collect();
    }

    pub fn member(&self, name: &str) -> Option<&MemberInfo> {
        self.lookup.get(name).map(|i| &self.index.files[*i])
    }

    pub fn has_member(&self, name: &str) -> bool {
        self.lookup.contains_key(name)
    }

    /// Live members, tombstones excluded.
    pub fn member_names(&self) -> impl Iterator<Item = &str> {
        self.index
            .files
            .iter()
            .filter(|m| !m.name.starts_with(TRASH_PREFIX))
            .map(|m| m.name.as_str())
    }

    pub async fn read_member(&self, name: &str) -> TarResult<Bytes> {
        let info = self
            .member(name)
            .ok_or_else(|| TarErrorKind::MemberNotFound { name: name.to_string() })?;
        let raw = read_range(&self.location, info.data_offset, info.size).await?;
        if is_growable(name) || name == TAR_ENTRY_NAME {
            Ok(Bytes::copy_from_slice(trim_padding(&raw)))
        } else {
            Ok(raw)
        }
    }

    /// Read an archive-absolute byte range, verifying it lies inside the data
    /// region of some present member.
    pub async fn read_self_range(&self, offset: u64, size: u64) -> TarResult<Bytes> {
        let inside = self
            .index
            .files
            .iter()
            .any(|m| offset >= m.data_offset && offset + size <= m.data_offset + m.capacity);
        if !inside {
            return Err(TarErrorKind::SelfRefOutOfBounds { offset, size }.into());
        }
        read_range(&self.location, offset, size).await
    }

    /// Read a range relative to the data region of a named member.
    pub async fn read_member_range(
        &self,
        name: &str,
        offset: u64,
        size: u64,
    ) -> TarResult<Bytes> {
        let info = self
            .member(name)
            .ok_or_else(|| TarErrorKind::MemberNotFound { name: name.to_string() })?;
        if offset + size > info.capacity {
            return Err(TarErrorKind::SelfRefOutOfBounds {
                offset: info.data_offset + offset,
                size,
            }
            .into());
        }
        read_range(&self.location, info.data_offset + offset, size).await
    }

    /// Write a member: in place when the content still fits its padded
    /// capacity, else tombstone-and-append. The index is updated last.
    #[instrument(skip(self, data), fields(len = data.len()))]
    pub async fn write_member(&mut self, name: &str, data: &[u8]) -> TarResult<MemberInfo> {
        let info = self.put_member(name, data).await?;
        self.update_index().await?;
        Ok(info)
    }

    /// Write several members in one grow-or-append cycle with a single index
    /// update at the end.
    pub async fn write_members(
        &mut self,
        members: Vec<(String, Bytes)>,
    ) -> TarResult<Vec<MemberInfo>> {
        let mut infos = Vec::with_capacity(members.len());
        for (name, data) in &members {
            infos.push(self.put_member(name, data).await?);
        }
        self.update_index().await?;
        Ok(infos)
    }

    /// Serialize the manifest into its growable member.
    pub async fn write_rfs(&mut self, rfs: &ReferenceFileSystem) -> TarResult<MemberInfo> {
        let json = rfs.to_json_bytes().map_err(|e| TarErrorKind::CorruptContainer {
            reason: format!("cannot serialize manifest: {e}"),
        })?;
        self.write_member(MANIFEST_NAME, &json).await
    }

    /// Tombstone a member: its 512-byte header is renamed under `./trash/`,
    /// data stays where it is so stale readers keep a consistent view.
    pub async fn trash_member(&mut self, name: &str) -> TarResult<()> {
        self.trash_no_index(name).await?;
        self.update_index().await
    }

    async fn trash_no_index(&mut self, name: &str) -> TarResult<()> {
        let position = *self
            .lookup
            .get(name)
            .ok_or_else(|| TarErrorKind::MemberNotFound { name: name.to_string() })?;
        let info = self.index.files[position].clone();
        let trash_name = format!("{TRASH_PREFIX}{name}.{}", random_suffix());
        debug!(name, trash_name = %trash_name, "tombstoning member");
        let raw = read_range(&self.location, info.header_offset, BLOCK_SIZE).await?;
        let mut block: [u8; 512] =
            raw[..].try_into().map_err(|_| TarErrorKind::CorruptContainer {
                reason: "short header read".to_string(),
            })?;
        rename_header(&mut block, &trash_name)?;
        self.write_at(info.header_offset, &block).await?;
        self.index.files[position].name = trash_name.clone();
        self.lookup.remove(name);
        self.lookup.insert(trash_name, position);
        self.dirty = true;
        Ok(())
    }

    async fn put_member(&mut self, name: &str, data: &[u8]) -> TarResult<MemberInfo> {
        if let Some(position) = self.lookup.get(name).copied() {
            let info = self.index.files[position].clone();
            if data.len() as u64 <= info.capacity {
                let mut payload = data.to_vec();
                payload.resize(info.capacity as usize, b' ');
                self.write_at(info.data_offset, &payload).await?;
                let updated = MemberInfo { size: data.len() as u64, ..info };
                self.index.files[position] = updated.clone();
                self.dirty = true;
                return Ok(updated);
            }
            self.trash_no_index(name).await?;
        }
        let capacity = if is_growable(name) {
            padded_capacity(data.len() as u64, INITIAL_MANIFEST_CAPACITY)
        } else {
            data.len() as u64
        };
        self.append_member(name, data, capacity).await
    }

    async fn append_member(
        &mut self,
        name: &str,
        data: &[u8],
        capacity: u64,
    ) -> TarResult<MemberInfo> {
        let end = self.terminator_offset().await?;
        let header = create_header(name, capacity)?;
        let mut payload = data.to_vec();
        payload.resize(capacity as usize, b' ');
        payload.resize(blocks(capacity) as usize, 0);
        // the two zero blocks get overwritten, fresh terminators follow
        let mut out = Vec::with_capacity(512 + payload.len() + 1024);
        out.extend_from_slice(&header);
        out.extend_from_slice(&payload);
        out.extend_from_slice(&[0u8; 1024]);
        self.write_at(end, &out).await?;
        let info = MemberInfo {
            name: name.to_string(),
            header_offset: end,
            data_offset: end + BLOCK_SIZE,
            size: data.len() as u64,
            capacity,
        };
        self.index.files.push(info.clone());
        self.lookup.insert(name.to_string(), self.index.files.len() - 1);
        self.dirty = true;
        Ok(info)
    }

    /// Offset of the two terminating zero blocks, verified to be zero.
    async fn terminator_offset(&self) -> TarResult<u64> {
        let TarLocation::Local(path) = &self.location else {
            return Err(TarErrorKind::RemoteWrite.into());
        };
        let len = tokio::fs::metadata(path).await.map_err(TarErrorKind::Io)?.len();
        if len < 1024 {
            return Err(TarErrorKind::CorruptContainer {
                reason: "archive shorter than its terminator".to_string(),
            }
            .into());
        }
        let tail = read_range(&self.location, len - 1024, 1024).await?;
        if tail.iter().any(|b| *b != 0) {
            return Err(TarErrorKind::CorruptContainer {
                reason: "archive does not end with 1024 zero bytes".to_string(),
            }
            .into());
        }
        Ok(len - 1024)
    }

    /// Persist the member table. Written last in every mutation cycle; when
    /// the index itself outgrows its padding the same tombstone-and-append
    /// procedure applies to it, and `.tar_entry.json` is repointed.
    async fn update_index(&mut self) -> TarResult<()> {
        if !self.dirty {
            return Ok(());
        }
        let position = *self.lookup.get(TAR_INDEX_NAME).ok_or_else(|| {
            TarErrorKind::CorruptContainer { reason: "index member missing".to_string() }
        })?;
        let info = self.index.files[position].clone();
        let json = serde_json::to_vec_pretty(&self.index)?;
        if json.len() as u64 <= info.capacity {
            let mut payload = json;
            payload.resize(info.capacity as usize, b' ');
            self.write_at(info.data_offset, &payload).await?;
            self.dirty = false;
            return Ok(());
        }

        // overflow of the index itself
        self.trash_no_index(TAR_INDEX_NAME).await?;
        let end = self.terminator_offset().await?;
        let mut capacity = padded_capacity(json.len() as u64, INITIAL_INDEX_CAPACITY);
        let (new_info, payload) = loop {
            let candidate = MemberInfo {
                name: TAR_INDEX_NAME.to_string(),
                header_offset: end,
                data_offset: end + BLOCK_SIZE,
                size: capacity,
                capacity,
            };
            let mut files = self.index.files.clone();
            files.push(candidate.clone());
            let body = serde_json::to_vec_pretty(&TarIndex { files })?;
            if body.len() as u64 <= capacity {
                break (candidate, body);
            }
            capacity *= 2;
        };
        let header = create_header(TAR_INDEX_NAME, capacity)?;
        let mut out = Vec::with_capacity(512 + blocks(capacity) as usize + 1024);
        out.extend_from_slice(&header);
        let mut data = payload;
        data.resize(capacity as usize, b' ');
        data.resize(blocks(capacity) as usize, 0);
        out.extend_from_slice(&data);
        out.extend_from_slice(&[0u8; 1024]);
        self.write_at(end, &out).await?;
        self.index.files.push(new_info.clone());
        self.lookup.insert(TAR_INDEX_NAME.to_string(), self.index.files.len() - 1);

        // repoint the entry member, written after the index is in place
        let entry = TarEntry { index: new_info };
        let mut entry_json = serde_json::to_vec_pretty(&entry)?;
        entry_json.resize(TAR_ENTRY_JSON_SIZE as usize, b' ');
        self.write_at(BLOCK_SIZE, &entry_json).await?;
        self.dirty = false;
        Ok(())
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> TarResult<()> {
        let TarLocation::Local(path) = &self.location else {
            return Err(TarErrorKind::RemoteWrite.into());
        };
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(path)
            .await
            .map_err(TarErrorKind::Io)?;
        file.seek(std::io::SeekFrom::Start(offset)).await.map_err(TarErrorKind::Io)?;
        file.write_all(data).await.map_err(TarErrorKind::Io)?;
        file.flush().await.map_err(TarErrorKind::Io)?;
        Ok(())
    }

    /// Create a fresh container holding the given manifest.
    #[instrument(skip(rfs))]
    pub async fn create(path: &Path, rfs: &ReferenceFileSystem) -> TarResult<Self> {
        let entry_info = MemberInfo {
            name: TAR_ENTRY_NAME.to_string(),
            header_offset: 0,
            data_offset: BLOCK_SIZE,
            size: TAR_ENTRY_JSON_SIZE,
            capacity: TAR_ENTRY_JSON_SIZE,
        };
        let index_header_offset = BLOCK_SIZE + TAR_ENTRY_JSON_SIZE;
        let index_info = MemberInfo {
            name: TAR_INDEX_NAME.to_string(),
            header_offset: index_header_offset,
            data_offset: index_header_offset + BLOCK_SIZE,
            size: INITIAL_INDEX_CAPACITY,
            capacity: INITIAL_INDEX_CAPACITY,
        };

        let mut entry_json =
            serde_json::to_vec_pretty(&TarEntry { index: index_info.clone() })?;
        entry_json.resize(TAR_ENTRY_JSON_SIZE as usize, b' ');

        let index =
            TarIndex { files: vec![entry_info.clone(), index_info.clone()] };
        let mut index_json = serde_json::to_vec_pretty(&index)?;
        index_json.resize(INITIAL_INDEX_CAPACITY as usize, b' ');

        let mut out = Vec::new();
        out.extend_from_slice(&create_header(TAR_ENTRY_NAME, TAR_ENTRY_JSON_SIZE)?);
        out.extend_from_slice(&entry_json);
        out.extend_from_slice(&create_header(TAR_INDEX_NAME, INITIAL_INDEX_CAPACITY)?);
        out.extend_from_slice(&index_json);
        out.extend_from_slice(&[0u8; 1024]);
        tokio::fs::write(path, &out).await.map_err(TarErrorKind::Io)?;

        let mut file = Self::open_local(path).await?;
        file.write_rfs(rfs).await?;
        Ok(file)
    }
}

async fn read_range(location: &TarLocation, offset: u64, size: u64) -> TarResult<Bytes> {
    match location {
        TarLocation::Local(path) => {
            let mut file =
                tokio::fs::File::open(path).await.map_err(TarErrorKind::Io)?;
            file.seek(std::io::SeekFrom::Start(offset))
                .await
                .map_err(TarErrorKind::Io)?;
            let mut buf = vec![0u8; size as usize];
            file.read_exact(&mut buf).await.map_err(TarErrorKind::Io)?;
            Ok(buf.into())
        }
        TarLocation::Remote { url, resolver } => Ok(resolver
            .fetch(url, offset, size, None)
            .await
            .map_err(|e| TarErrorKind::Fetch(Box::new(e)))?),
    }
}
