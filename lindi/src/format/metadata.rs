use itertools::Itertools as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::{FormatErrorKind, FormatResult};

/// Attribute names recognized by LINDI on top of plain Zarr v2 metadata.
pub const ATTR_SCALAR: &str = "_SCALAR";
pub const ATTR_SOFT_LINK: &str = "_SOFT_LINK";
pub const ATTR_REFERENCE: &str = "_REFERENCE";
pub const ATTR_COMPOUND_DTYPE: &str = "_COMPOUND_DTYPE";
pub const ATTR_EXTERNAL_ARRAY_LINK: &str = "_EXTERNAL_ARRAY_LINK";

/// A named codec configuration handed to the external codec catalog,
/// e.g. `{"id": "zlib", "level": 4}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodecSpec {
    pub id: String,
    #[serde(flatten)]
    pub config: Map<String, Value>,
}

impl CodecSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), config: Map::new() }
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.config.insert(key.to_string(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZGroup {
    pub zarr_format: u32,
}

impl ZGroup {
    pub fn v2() -> Self {
        Self { zarr_format: 2 }
    }
}

impl Default for ZGroup {
    fn default() -> Self {
        Self::v2()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZArray {
    pub zarr_format: u32,
    pub shape: Vec<u64>,
    pub chunks: Vec<u64>,
    pub dtype: String,
    pub compressor: Option<CodecSpec>,
    pub filters: Option<Vec<CodecSpec>>,
    pub fill_value: Value,
    pub order: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimension_separator: Option<String>,
}

impl ZArray {
    pub fn new(shape: Vec<u64>, chunks: Vec<u64>, dtype: impl Into<String>) -> Self {
        Self {
            zarr_format: 2,
            shape,
            chunks,
            dtype: dtype.into(),
            compressor: None,
            filters: None,
            fill_value: json!(0),
            order: "C".to_string(),
            dimension_separator: None,
        }
    }

    pub fn from_slice(data: &[u8]) -> FormatResult<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Compact JSON, the form stored in the manifest.
    pub fn to_json_bytes(&self) -> FormatResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Number of chunks along each dimension.
    pub fn chunk_grid_shape(&self) -> Vec<u64> {
        self.shape
            .iter()
            .zip(self.chunks.iter())
            .map(|(s, c)| if *c == 0 { 0 } else { s.div_ceil(*c) })
            .collect()
    }

    pub fn num_chunks(&self) -> u64 {
        self.chunk_grid_shape().iter().product()
    }

    /// True when `coords` addresses a chunk inside the declared grid.
    pub fn chunk_in_bounds(&self, coords: &[u64]) -> bool {
        let grid = self.chunk_grid_shape();
        coords.len() == grid.len() && coords.iter().zip(grid.iter()).all(|(c, g)| c < g)
    }
}

/// `i0.i1.…` chunk key segment for the given coordinates.
pub fn chunk_name(coords: &[u64]) -> String {
    if coords.is_empty() {
        "0".to_string()
    } else {
        coords.iter().map(|c| c.to_string()).join(".")
    }
}

pub fn parse_chunk_name(name: &str) -> Option<Vec<u64>> {
    name.split('.').map(|part| part.parse::<u64>().ok()).collect()
}

/// Row-major iteration over all chunk coordinates of a grid.
pub fn chunk_coords_iter(grid: &[u64]) -> impl Iterator<Item = Vec<u64>> {
    let grid = grid.to_vec();
    let total: u64 = grid.iter().product();
    let empty = grid.is_empty();
    (0..total).filter_map(move |mut index| {
        if empty {
            return None;
        }
        let mut coords = vec![0u64; grid.len()];
        for (axis, extent) in grid.iter().enumerate().rev() {
            coords[axis] = index % extent;
            index /= extent;
        }
        Some(coords)
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftLink {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalArrayLink {
    pub link_type: String,
    pub url: String,
    pub name: String,
}

impl ExternalArrayLink {
    pub fn hdf5_dataset(url: impl Into<String>, name: impl Into<String>) -> Self {
        Self { link_type: "hdf5_dataset".to_string(), url: url.into(), name: name.into() }
    }
}

/// The value stored under `_REFERENCE`, both in attributes and embedded in
/// compound dataset rows. The object ids are cross-checks against the objects
/// the path resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectReference {
    pub object_id: Option<String>,
    pub path: String,
    pub source: String,
    pub source_object_id: Option<String>,
}

impl ObjectReference {
    pub fn new(
        path: impl Into<String>,
        object_id: Option<String>,
        source_object_id: Option<String>,
    ) -> Self {
        Self { object_id, path: path.into(), source: ".".to_string(), source_object_id }
    }

    pub fn wrap(&self) -> FormatResult<Value> {
        let mut wrapper = Map::new();
        wrapper.insert(ATTR_REFERENCE.to_string(), serde_json::to_value(self)?);
        Ok(Value::Object(wrapper))
    }

    /// Extract a reference from an attribute value, if it is one.
    pub fn unwrap(value: &Value) -> Option<FormatResult<ObjectReference>> {
        let inner = value.as_object()?.get(ATTR_REFERENCE)?;
        Some(
            serde_json::from_value(inner.clone())
                .map_err(|e| FormatErrorKind::Json(e).into()),
        )
    }
}

/// JSON has no representation for non-finite floats; encode them the way the
/// manifest format requires, as the strings "NaN", "Infinity", "-Infinity".
pub fn float_to_json(value: f64) -> Value {
    if value.is_nan() {
        Value::String("NaN".to_string())
    } else if value.is_infinite() {
        Value::String(if value > 0.0 { "Infinity" } else { "-Infinity" }.to_string())
    } else {
        serde_json::Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
    }
}

pub fn json_to_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => match s.as_str() {
            "NaN" => Some(f64::NAN),
            "Infinity" => Some(f64::INFINITY),
            "-Infinity" => Some(f64::NEG_INFINITY),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_zarray_json_shape() {
        let mut zarray = ZArray::new(vec![10], vec![10], "<f4");
        zarray.filters =
            Some(vec![CodecSpec::new("zlib").with("level", json!(4))]);
        let text = String::from_utf8(zarray.to_json_bytes().unwrap()).unwrap();
        assert!(text.contains(r#""dtype":"<f4""#));
        assert!(text.contains(r#""filters":[{"id":"zlib","level":4}]"#));
        assert!(text.contains(r#""compressor":null"#));
        let back = ZArray::from_slice(text.as_bytes()).unwrap();
        assert_eq!(back, zarray);
    }

    #[test]
    fn test_chunk_grid() {
        let zarray = ZArray::new(vec![10, 25], vec![4, 10], "<i8");
        assert_eq!(zarray.chunk_grid_shape(), vec![3, 3]);
        assert_eq!(zarray.num_chunks(), 9);
        assert!(zarray.chunk_in_bounds(&[2, 2]));
        assert!(!zarray.chunk_in_bounds(&[3, 0]));
        assert!(!zarray.chunk_in_bounds(&[0]));
    }

    #[test]
    fn test_chunk_names() {
        assert_eq!(chunk_name(&[]), "0");
        assert_eq!(chunk_name(&[1, 0, 7]), "1.0.7");
        assert_eq!(parse_chunk_name("1.0.7"), Some(vec![1, 0, 7]));
        assert_eq!(parse_chunk_name("a.b"), None);

        let coords: Vec<_> = chunk_coords_iter(&[2, 2]).collect();
        assert_eq!(coords, vec![vec![0, 0], vec![0, 1], vec![1, 0], vec![1, 1]]);
    }

    #[test]
    fn test_reference_round_trip() {
        let reference = ObjectReference::new(
            "/g/target",
            Some("abc".to_string()),
            Some("def".to_string()),
        );
        let wrapped = reference.wrap().unwrap();
        let back = ObjectReference::unwrap(&wrapped).unwrap().unwrap();
        assert_eq!(back, reference);
        assert_eq!(back.source, ".");
        assert!(ObjectReference::unwrap(&json!({"a": 1})).is_none());
    }

    #[test]
    fn test_non_finite_floats() {
        assert_eq!(float_to_json(f64::NAN), json!("NaN"));
        assert_eq!(float_to_json(f64::INFINITY), json!("Infinity"));
        assert_eq!(float_to_json(f64::NEG_INFINITY), json!("-Infinity"));
        assert_eq!(float_to_json(1.5), json!(1.5));
        assert!(json_to_float(&json!("NaN")).unwrap().is_nan());
        assert_eq!(json_to_float(&json!(2.0)), Some(2.0));
    }
}
