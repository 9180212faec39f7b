use std::num::NonZeroU16;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

/// Retry behavior for range requests against remote files.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Default)]
pub struct RetriesSettings {
    pub max_tries: Option<NonZeroU16>,
    pub initial_backoff_ms: Option<u32>,
    pub max_backoff_ms: Option<u32>,
}

impl RetriesSettings {
    pub fn max_tries(&self) -> NonZeroU16 {
        self.max_tries.unwrap_or_else(|| NonZeroU16::new(6).unwrap_or(NonZeroU16::MIN))
    }

    pub fn initial_backoff_ms(&self) -> u32 {
        self.initial_backoff_ms.unwrap_or(500)
    }

    pub fn max_backoff_ms(&self) -> u32 {
        self.max_backoff_ms.unwrap_or(30_000)
    }

    pub fn merge(&self, other: Self) -> Self {
        Self {
            max_tries: other.max_tries.or(self.max_tries),
            initial_backoff_ms: other.initial_backoff_ms.or(self.initial_backoff_ms),
            max_backoff_ms: other.max_backoff_ms.or(self.max_backoff_ms),
        }
    }
}

/// Settings for the on-disk chunk cache.
#[skip_serializing_none]
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Default)]
pub struct CacheSettings {
    /// Directory holding cached chunks. Defaults to `~/.lindi/cache`.
    pub directory: Option<PathBuf>,

    /// Total bytes of chunk data kept on disk before eviction kicks in.
    #[serde(default)]
    pub max_size_bytes: Option<u64>,

    /// Number of chunks kept in the in-memory hot layer.
    #[serde(default)]
    pub num_memory_chunks: Option<u64>,
}

impl CacheSettings {
    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_bytes.unwrap_or(10 * 1024 * 1024 * 1024)
    }

    pub fn num_memory_chunks(&self) -> u64 {
        self.num_memory_chunks.unwrap_or(128)
    }

    pub fn merge(&self, other: Self) -> Self {
        Self {
            directory: other.directory.or_else(|| self.directory.clone()),
            max_size_bytes: other.max_size_bytes.or(self.max_size_bytes),
            num_memory_chunks: other.num_memory_chunks.or(self.num_memory_chunks),
        }
    }
}

/// Top level configuration for opening, translating and writing LINDI stores.
#[skip_serializing_none]
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Default)]
pub struct LindiConfig {
    /// Datasets with more stored chunks than this get an external array link
    /// instead of per-chunk references.
    #[serde(default)]
    pub num_dataset_chunks_threshold: Option<u64>,

    /// Written chunks smaller than this are inlined into the manifest.
    #[serde(default)]
    pub inline_chunk_threshold_bytes: Option<u32>,

    /// When true, an object-id mismatch while resolving a reference is an
    /// error instead of a warning.
    #[serde(default)]
    pub validate_object_ids: Option<bool>,

    #[serde(default)]
    pub retries: Option<RetriesSettings>,

    #[serde(default)]
    pub cache: Option<CacheSettings>,
}

impl LindiConfig {
    pub fn num_dataset_chunks_threshold(&self) -> u64 {
        self.num_dataset_chunks_threshold.unwrap_or(1000)
    }

    pub fn inline_chunk_threshold_bytes(&self) -> u32 {
        self.inline_chunk_threshold_bytes.unwrap_or(1000)
    }

    pub fn validate_object_ids(&self) -> bool {
        self.validate_object_ids.unwrap_or(false)
    }

    pub fn retries(&self) -> RetriesSettings {
        self.retries.clone().unwrap_or_default()
    }

    pub fn cache(&self) -> CacheSettings {
        self.cache.clone().unwrap_or_default()
    }

    pub fn merge(&self, other: Self) -> Self {
        Self {
            num_dataset_chunks_threshold: other
                .num_dataset_chunks_threshold
                .or(self.num_dataset_chunks_threshold),
            inline_chunk_threshold_bytes: other
                .inline_chunk_threshold_bytes
                .or(self.inline_chunk_threshold_bytes),
            validate_object_ids: other.validate_object_ids.or(self.validate_object_ids),
            retries: match (&self.retries, other.retries) {
                (Some(mine), Some(theirs)) => Some(mine.merge(theirs)),
                (mine, theirs) => theirs.or_else(|| mine.clone()),
            },
            cache: match (&self.cache, other.cache) {
                (Some(mine), Some(theirs)) => Some(mine.merge(theirs)),
                (mine, theirs) => theirs.or_else(|| mine.clone()),
            },
        }
    }
}
