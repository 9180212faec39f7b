//! The HDF5 collaborator surface and the HDF5 to Zarr translation layer.
//!
//! The full HDF5 reader is an external collaborator; [`Hdf5Reader`] is the
//! exact surface the translator consumes: object enumeration, per-object
//! type, dataset shape/dtype/chunks/filter pipeline, per-chunk byte ranges,
//! and raw attribute values. Crates like `hdf5` expose all of this
//! synchronously, so the trait is synchronous too.

use std::convert::Infallible;

use serde_json::Value;
use thiserror::Error;

use crate::error::LindiError;
use crate::format::metadata::{ObjectReference, float_to_json};

mod codecs;
mod translate;

pub use codecs::filters_to_codecs;
pub use translate::{translate_hdf5, validate_chunk_keys};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum H5ErrorKind {
    #[error("hdf5 object not found: `{path}`")]
    NotFound { path: String },
    #[error("hdf5 object `{path}` is not a {expected}")]
    WrongKind { path: String, expected: &'static str },
    #[error("unsupported hdf5 feature at `{path}`: {what}")]
    Unsupported { path: String, what: String },
    #[error("unsupported hdf5 filter: {filter}")]
    UnsupportedFilter { filter: String },
    #[error("error reading hdf5 file: {0}")]
    Read(String),
    #[error("json error")]
    Json(#[from] serde_json::Error),
}

pub type H5Error = LindiError<H5ErrorKind>;

impl<E> From<E> for H5Error
where
    E: Into<H5ErrorKind>,
{
    fn from(value: E) -> Self {
        Self::new(value.into())
    }
}

impl From<Infallible> for H5ErrorKind {
    fn from(value: Infallible) -> Self {
        match value {}
    }
}

pub type H5Result<T> = Result<T, H5Error>;

/// Element type of an HDF5 dataset or attribute, reduced to what the
/// translation layer distinguishes.
#[derive(Debug, Clone, PartialEq)]
pub enum H5Dtype {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Bool,
    /// Variable length string, a Zarr object array.
    VarString,
    /// HDF5 object reference.
    Reference,
    Compound(Vec<(String, H5Dtype)>),
}

impl H5Dtype {
    /// The Zarr v2 dtype string; object-like types all map to `|O`.
    pub fn zarr_dtype(&self) -> &'static str {
        match self {
            H5Dtype::Int8 => "|i1",
            H5Dtype::Int16 => "<i2",
            H5Dtype::Int32 => "<i4",
            H5Dtype::Int64 => "<i8",
            H5Dtype::UInt8 => "|u1",
            H5Dtype::UInt16 => "<u2",
            H5Dtype::UInt32 => "<u4",
            H5Dtype::UInt64 => "<u8",
            H5Dtype::Float32 => "<f4",
            H5Dtype::Float64 => "<f8",
            H5Dtype::Bool => "|b1",
            H5Dtype::VarString | H5Dtype::Reference | H5Dtype::Compound(_) => "|O",
        }
    }

    /// The name used in `_COMPOUND_DTYPE` field descriptors.
    pub fn type_name(&self) -> String {
        match self {
            H5Dtype::Int8 => "int8".to_string(),
            H5Dtype::Int16 => "int16".to_string(),
            H5Dtype::Int32 => "int32".to_string(),
            H5Dtype::Int64 => "int64".to_string(),
            H5Dtype::UInt8 => "uint8".to_string(),
            H5Dtype::UInt16 => "uint16".to_string(),
            H5Dtype::UInt32 => "uint32".to_string(),
            H5Dtype::UInt64 => "uint64".to_string(),
            H5Dtype::Float32 => "float32".to_string(),
            H5Dtype::Float64 => "float64".to_string(),
            H5Dtype::Bool => "bool".to_string(),
            H5Dtype::VarString => "object".to_string(),
            H5Dtype::Reference => "object".to_string(),
            H5Dtype::Compound(_) => "object".to_string(),
        }
    }

    pub fn is_numeric(&self) -> bool {
        !matches!(
            self,
            H5Dtype::VarString | H5Dtype::Reference | H5Dtype::Compound(_)
        )
    }

    pub fn item_size(&self) -> Option<u64> {
        match self {
            H5Dtype::Int8 | H5Dtype::UInt8 | H5Dtype::Bool => Some(1),
            H5Dtype::Int16 | H5Dtype::UInt16 => Some(2),
            H5Dtype::Int32 | H5Dtype::UInt32 | H5Dtype::Float32 => Some(4),
            H5Dtype::Int64 | H5Dtype::UInt64 | H5Dtype::Float64 => Some(8),
            H5Dtype::VarString | H5Dtype::Reference | H5Dtype::Compound(_) => None,
        }
    }
}

/// An HDF5 object reference as handed over by the reader. The ids are the
/// `object_id` attributes of the target object and of the file root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct H5ObjectRef {
    pub path: String,
    pub object_id: Option<String>,
    pub source_object_id: Option<String>,
}

impl From<&H5ObjectRef> for ObjectReference {
    fn from(value: &H5ObjectRef) -> Self {
        ObjectReference::new(
            value.path.clone(),
            value.object_id.clone(),
            value.source_object_id.clone(),
        )
    }
}

/// A raw attribute or element value.
#[derive(Debug, Clone, PartialEq)]
pub enum H5Value {
    Int(i64),
    Uint(u64),
    Float(f64),
    Bool(bool),
    String(String),
    Array(Vec<H5Value>),
    Reference(H5ObjectRef),
}

impl H5Value {
    /// Convert to the JSON shape stored in `.zattrs`: non-finite floats as
    /// strings, object references wrapped under `_REFERENCE`.
    pub fn to_zarr_json(&self) -> H5Result<Value> {
        match self {
            H5Value::Int(v) => Ok(Value::from(*v)),
            H5Value::Uint(v) => Ok(Value::from(*v)),
            H5Value::Float(v) => Ok(float_to_json(*v)),
            H5Value::Bool(v) => Ok(Value::from(*v)),
            H5Value::String(v) => Ok(Value::from(v.clone())),
            H5Value::Array(items) => Ok(Value::Array(
                items.iter().map(|v| v.to_zarr_json()).collect::<H5Result<_>>()?,
            )),
            H5Value::Reference(r) => {
                Ok(ObjectReference::from(r).wrap().map_err(|e| H5ErrorKind::Read(e.to_string()))?)
            }
        }
    }

    /// Little-endian bytes of a numeric scalar, the inline payload of a
    /// `_SCALAR` dataset chunk.
    pub fn scalar_bytes(&self, dtype: &H5Dtype) -> Option<Vec<u8>> {
        match (dtype, self) {
            (H5Dtype::Int8, H5Value::Int(v)) => Some((*v as i8).to_le_bytes().to_vec()),
            (H5Dtype::Int16, H5Value::Int(v)) => Some((*v as i16).to_le_bytes().to_vec()),
            (H5Dtype::Int32, H5Value::Int(v)) => Some((*v as i32).to_le_bytes().to_vec()),
            (H5Dtype::Int64, H5Value::Int(v)) => Some(v.to_le_bytes().to_vec()),
            (H5Dtype::UInt8, H5Value::Uint(v)) => Some((*v as u8).to_le_bytes().to_vec()),
            (H5Dtype::UInt16, H5Value::Uint(v)) => {
                Some((*v as u16).to_le_bytes().to_vec())
            }
            (H5Dtype::UInt32, H5Value::Uint(v)) => {
                Some((*v as u32).to_le_bytes().to_vec())
            }
            (H5Dtype::UInt64, H5Value::Uint(v)) => Some(v.to_le_bytes().to_vec()),
            (H5Dtype::Float32, H5Value::Float(v)) => {
                Some((*v as f32).to_le_bytes().to_vec())
            }
            (H5Dtype::Float64, H5Value::Float(v)) => Some(v.to_le_bytes().to_vec()),
            (H5Dtype::Bool, H5Value::Bool(v)) => Some(vec![u8::from(*v)]),
            _ => None,
        }
    }
}

/// Filter pipeline entry of an HDF5 dataset, by filter id.
#[derive(Debug, Clone, PartialEq)]
pub enum H5Filter {
    Gzip { level: u32 },
    Shuffle { element_size: u32 },
    Blosc { cname: String, clevel: u32, shuffle: u32, blocksize: u32 },
    Zstd { level: i32 },
    Fletcher32,
    ScaleOffset,
    Szip,
    Lzf,
    Other { id: u32 },
}

/// Kind of an object in the HDF5 tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum H5Node {
    Group,
    Dataset,
    SoftLink { target: String },
    ExternalLink { file: String, path: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct H5DatasetInfo {
    /// Empty for scalar datasets.
    pub shape: Vec<u64>,
    pub dtype: H5Dtype,
    /// `None` for contiguous (and scalar) datasets.
    pub chunk_shape: Option<Vec<u64>>,
    pub filters: Vec<H5Filter>,
    pub fill_value: Option<f64>,
}

/// The external HDF5 reader collaborator. Paths are slash-delimited, with
/// the empty string for the root group.
pub trait Hdf5Reader: Send + Sync {
    fn node(&self, path: &str) -> H5Result<H5Node>;

    /// Child names of a group, in file order; the translator sorts them.
    fn children(&self, path: &str) -> H5Result<Vec<String>>;

    fn attributes(&self, path: &str) -> H5Result<Vec<(String, H5Value)>>;

    fn dataset_info(&self, path: &str) -> H5Result<H5DatasetInfo>;

    /// File byte range of a stored chunk, `None` when the chunk was never
    /// allocated.
    fn chunk_byte_range(&self, path: &str, coords: &[u64]) -> H5Result<Option<(u64, u64)>>;

    /// File byte range of a contiguous dataset.
    fn contiguous_byte_range(&self, path: &str) -> H5Result<(u64, u64)>;

    /// Value of a scalar dataset.
    fn scalar_value(&self, path: &str) -> H5Result<H5Value>;

    /// All elements of an object/string/compound dataset, row major. For
    /// compound datasets every element is an `H5Value::Array` of fields.
    fn object_values(&self, path: &str) -> H5Result<Vec<H5Value>>;
}
