//! The external codec catalog collaborator.
//!
//! LINDI stores raw HDF5 chunk bytes and names the codecs that decode them in
//! Zarr metadata; the actual codec implementations live outside the core.

use std::convert::Infallible;

use bytes::Bytes;
use thiserror::Error;

use crate::error::LindiError;
use crate::format::metadata::CodecSpec;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CodecErrorKind {
    #[error("no codec registered with id `{id}`")]
    UnknownCodec { id: String },
    #[error("codec `{id}` failed: {reason}")]
    CodecFailed { id: String, reason: String },
}

pub type CodecError = LindiError<CodecErrorKind>;

impl<E> From<E> for CodecError
where
    E: Into<CodecErrorKind>,
{
    fn from(value: E) -> Self {
        Self::new(value.into())
    }
}

impl From<Infallible> for CodecErrorKind {
    fn from(value: Infallible) -> Self {
        match value {}
    }
}

pub type CodecResult<T> = Result<T, CodecError>;

/// Resolves codec specs (`{"id": "zlib", "level": 4}` and friends) to
/// byte transformations.
pub trait CodecCatalog: Send + Sync {
    fn encode(&self, spec: &CodecSpec, data: Bytes) -> CodecResult<Bytes>;
    fn decode(&self, spec: &CodecSpec, data: Bytes) -> CodecResult<Bytes>;
}

/// Decode stored chunk bytes: the compressor runs first, then the filters in
/// reverse of their declared order, per Zarr v2.
pub fn decode_chunk(
    catalog: &dyn CodecCatalog,
    compressor: Option<&CodecSpec>,
    filters: &[CodecSpec],
    data: Bytes,
) -> CodecResult<Bytes> {
    let mut data = match compressor {
        Some(spec) => catalog.decode(spec, data)?,
        None => data,
    };
    for spec in filters.iter().rev() {
        data = catalog.decode(spec, data)?;
    }
    Ok(data)
}

/// Encode chunk bytes for storage: filters in declared order, compressor
/// last.
pub fn encode_chunk(
    catalog: &dyn CodecCatalog,
    compressor: Option<&CodecSpec>,
    filters: &[CodecSpec],
    data: Bytes,
) -> CodecResult<Bytes> {
    let mut data = data;
    for spec in filters {
        data = catalog.encode(spec, data)?;
    }
    match compressor {
        Some(spec) => catalog.encode(spec, data),
        None => Ok(data),
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    /// A catalog with a single reversible codec that xors every byte, enough
    /// to observe application order.
    #[derive(Debug)]
    struct XorCatalog;

    impl CodecCatalog for XorCatalog {
        fn encode(&self, spec: &CodecSpec, data: Bytes) -> CodecResult<Bytes> {
            let key = spec
                .config
                .get("key")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| CodecErrorKind::UnknownCodec { id: spec.id.clone() })?;
            Ok(data.iter().map(|b| b ^ key as u8).collect::<Vec<u8>>().into())
        }

        fn decode(&self, spec: &CodecSpec, data: Bytes) -> CodecResult<Bytes> {
            self.encode(spec, data)
        }
    }

    #[test]
    fn test_round_trip_through_pipeline() {
        let catalog = XorCatalog;
        let filters = vec![
            CodecSpec::new("xor").with("key", serde_json::json!(1)),
            CodecSpec::new("xor").with("key", serde_json::json!(2)),
        ];
        let compressor = CodecSpec::new("xor").with("key", serde_json::json!(4));
        let raw = Bytes::from_static(b"chunk");
        let encoded =
            encode_chunk(&catalog, Some(&compressor), &filters, raw.clone()).unwrap();
        // 1 ^ 2 ^ 4 applied to every byte
        assert_eq!(encoded.as_ref(), b"chunk".iter().map(|b| b ^ 7).collect::<Vec<_>>().as_slice());
        let decoded =
            decode_chunk(&catalog, Some(&compressor), &filters, encoded).unwrap();
        assert_eq!(decoded, raw);
    }
}
