use std::convert::Infallible;

use thiserror::Error;

use crate::error::LindiError;

pub mod metadata;
pub mod rfs;

/// Schema version of the reference file system document.
pub const LINDI_SPEC_VERSION: u32 = 1;

/// Reserved URL marking a byte range inside the enclosing LINDI container.
///
/// The bare `"./"` form addresses the archive itself: the reference offset is
/// a byte offset into the tar. The longer `"./name"` form addresses a member
/// (or a file of a directory container) by name, with the offset relative to
/// that member's data.
pub const SELF_REF_URL: &str = "./";

pub fn is_self_url(url: &str) -> bool {
    url.is_empty() || url == "." || url.starts_with(SELF_REF_URL)
}

/// True for keys that must always be stored inline: Zarr metadata documents
/// and other JSON side files.
pub fn is_metadata_key(key: &str) -> bool {
    let base = key.rsplit('/').next().unwrap_or(key);
    base.starts_with('.') || base.ends_with(".json")
}

/// Split a Zarr key into the node path and the final segment.
pub fn split_key(key: &str) -> (&str, &str) {
    match key.rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => ("", key),
    }
}

pub fn join_key(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FormatErrorKind {
    #[error("reference for key `{key}` has invalid shape: {reason}")]
    BadRefShape { key: String, reason: String },
    #[error("reference for key `{key}` holds invalid base64 data")]
    BadBase64 { key: String },
    #[error("json error")]
    Json(#[from] serde_json::Error),
}

pub type FormatError = LindiError<FormatErrorKind>;

// it would be great to define this impl in error.rs, but it conflicts with
// the blanket `impl From<T> for T`
impl<E> From<E> for FormatError
where
    E: Into<FormatErrorKind>,
{
    fn from(value: E) -> Self {
        Self::new(value.into())
    }
}

impl From<Infallible> for FormatErrorKind {
    fn from(value: Infallible) -> Self {
        match value {}
    }
}

pub type FormatResult<T> = Result<T, FormatError>;
