use std::collections::BTreeMap;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer, ser::SerializeSeq};
use serde_json::Value;

use super::{FormatErrorKind, FormatResult, LINDI_SPEC_VERSION};

const BASE64_PREFIX: &str = "base64:";

/// One entry of the reference file system.
///
/// The on-disk shape follows the kerchunk convention: a bare string is inline
/// UTF-8 (or base64 bytes behind a `base64:` prefix), a three element array is
/// `[url, offset, size]`. A one element array holding base64 bytes is also
/// accepted on read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefValue {
    Inline(String),
    Base64(Vec<u8>),
    External(ExternalRef),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExternalRef {
    pub url: String,
    pub offset: u64,
    pub size: u64,
}

impl ExternalRef {
    pub fn new(url: impl Into<String>, offset: u64, size: u64) -> Self {
        Self { url: url.into(), offset, size }
    }
}

impl RefValue {
    /// Choose the inline representation for raw bytes. Text that could be
    /// mistaken for the base64 marker is stored base64-encoded.
    pub fn from_bytes(data: &[u8]) -> RefValue {
        match std::str::from_utf8(data) {
            Ok(s) if !s.starts_with(BASE64_PREFIX) && !s.contains('\u{0}') => {
                RefValue::Inline(s.to_string())
            }
            _ => RefValue::Base64(data.to_vec()),
        }
    }

    pub fn external(url: impl Into<String>, offset: u64, size: u64) -> RefValue {
        RefValue::External(ExternalRef::new(url, offset, size))
    }

    /// Decoded payload for the inline forms, `None` for external references.
    pub fn inline_bytes(&self) -> Option<Bytes> {
        match self {
            RefValue::Inline(s) => Some(Bytes::copy_from_slice(s.as_bytes())),
            RefValue::Base64(data) => Some(Bytes::copy_from_slice(data)),
            RefValue::External(_) => None,
        }
    }

    pub fn as_external(&self) -> Option<&ExternalRef> {
        match self {
            RefValue::External(r) => Some(r),
            _ => None,
        }
    }
}

impl Serialize for RefValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RefValue::Inline(s) => serializer.serialize_str(s),
            RefValue::Base64(data) => {
                serializer.serialize_str(&format!("{BASE64_PREFIX}{}", BASE64.encode(data)))
            }
            RefValue::External(ExternalRef { url, offset, size }) => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element(url)?;
                seq.serialize_element(offset)?;
                seq.serialize_element(size)?;
                seq.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for RefValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        ref_value_from_json("<ref>", &value).map_err(|e| D::Error::custom(e.kind))
    }
}

fn ref_value_from_json(key: &str, value: &Value) -> FormatResult<RefValue> {
    let bad = |reason: &str| FormatErrorKind::BadRefShape {
        key: key.to_string(),
        reason: reason.to_string(),
    };
    match value {
        Value::String(s) => match s.strip_prefix(BASE64_PREFIX) {
            Some(encoded) => {
                let data = BASE64
                    .decode(encoded)
                    .map_err(|_| FormatErrorKind::BadBase64 { key: key.to_string() })?;
                Ok(RefValue::Base64(data))
            }
            None => Ok(RefValue::Inline(s.clone())),
        },
        Value::Array(items) => match items.as_slice() {
            [Value::String(encoded)] => {
                let data = BASE64
                    .decode(encoded)
                    .map_err(|_| FormatErrorKind::BadBase64 { key: key.to_string() })?;
                Ok(RefValue::Base64(data))
            }
            [Value::String(url), offset, size] => {
                let offset = offset
                    .as_u64()
                    .ok_or_else(|| bad("offset must be a non-negative integer"))?;
                let size =
                    size.as_u64().ok_or_else(|| bad("size must be a non-negative integer"))?;
                if size == 0 {
                    return Err(bad("size must be positive").into());
                }
                Ok(RefValue::External(ExternalRef::new(url.clone(), offset, size)))
            }
            _ => Err(bad("array refs must be [b64] or [url, offset, size]").into()),
        },
        _ => Err(bad("value must be a string or an array").into()),
    }
}

fn default_version() -> u32 {
    LINDI_SPEC_VERSION
}

/// The reference file system: the JSON manifest of a LINDI store.
///
/// Keys are slash-delimited Zarr store keys. Serialization is deterministic:
/// keys come out in lexicographic order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceFileSystem {
    #[serde(default = "default_version")]
    pub version: u32,
    pub refs: BTreeMap<String, RefValue>,
}

impl Default for ReferenceFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceFileSystem {
    pub fn new() -> Self {
        Self { version: LINDI_SPEC_VERSION, refs: BTreeMap::new() }
    }

    /// A single empty root group, the starting point for writable stores.
    pub fn empty_root_group() -> Self {
        let mut rfs = Self::new();
        rfs.refs.insert(
            ".zgroup".to_string(),
            RefValue::Inline(r#"{"zarr_format":2}"#.to_string()),
        );
        rfs
    }

    pub fn from_slice(data: &[u8]) -> FormatResult<Self> {
        let value: Value = serde_json::from_slice(data)?;
        let obj = value.as_object().ok_or_else(|| FormatErrorKind::BadRefShape {
            key: "<root>".to_string(),
            reason: "manifest must be a JSON object".to_string(),
        })?;
        let version = match obj.get("version") {
            None => LINDI_SPEC_VERSION,
            Some(v) => v.as_u64().ok_or_else(|| FormatErrorKind::BadRefShape {
                key: "version".to_string(),
                reason: "version must be an integer".to_string(),
            })? as u32,
        };
        let refs_value =
            obj.get("refs").and_then(Value::as_object).ok_or_else(|| {
                FormatErrorKind::BadRefShape {
                    key: "refs".to_string(),
                    reason: "manifest must contain a `refs` object".to_string(),
                }
            })?;
        let mut refs = BTreeMap::new();
        for (key, value) in refs_value {
            refs.insert(key.clone(), ref_value_from_json(key, value)?);
        }
        Ok(Self { version, refs })
    }

    /// Serialize with two-space indentation and lexicographic keys, the shape
    /// stored in `lindi.json`.
    pub fn to_json_bytes(&self) -> FormatResult<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn get(&self, key: &str) -> Option<&RefValue> {
        self.refs.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: RefValue) {
        self.refs.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<RefValue> {
        self.refs.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.refs.contains_key(key)
    }

    /// Immediate children under a prefix, deduplicated and sorted.
    pub fn list_dir(&self, prefix: &str) -> Vec<String> {
        let prefix = prefix.trim_matches('/');
        let mut children: Vec<String> = Vec::new();
        let start = if prefix.is_empty() { String::new() } else { format!("{prefix}/") };
        for key in self.refs.range(start.clone()..) {
            let (key, _) = key;
            let Some(rest) = key.strip_prefix(&start) else { break };
            let child = rest.split('/').next().unwrap_or(rest);
            if child.is_empty() || child.starts_with('.') {
                continue;
            }
            if children.last().map(String::as_str) != Some(child) {
                children.push(child.to_string());
            }
        }
        children.dedup();
        children
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_ref_value_shapes() {
        let parsed: RefValue = serde_json::from_str(r#""hello""#).unwrap();
        assert_eq!(parsed, RefValue::Inline("hello".to_string()));

        let parsed: RefValue = serde_json::from_str(r#""base64:AAEC""#).unwrap();
        assert_eq!(parsed, RefValue::Base64(vec![0, 1, 2]));

        let parsed: RefValue =
            serde_json::from_str(r#"["https://x.org/f.h5", 100, 42]"#).unwrap();
        assert_eq!(parsed, RefValue::external("https://x.org/f.h5", 100, 42));

        // one element form
        let parsed: RefValue = serde_json::from_str(r#"["AAEC"]"#).unwrap();
        assert_eq!(parsed, RefValue::Base64(vec![0, 1, 2]));
    }

    #[test]
    fn test_zero_size_rejected() {
        let res: Result<RefValue, _> = serde_json::from_str(r#"["u", 0, 0]"#);
        assert!(res.is_err());
    }

    #[test]
    fn test_from_bytes_avoids_ambiguity() {
        assert_eq!(
            RefValue::from_bytes(b"plain text"),
            RefValue::Inline("plain text".to_string())
        );
        // content that happens to start with the marker must round-trip
        let tricky = b"base64:not-really";
        let value = RefValue::from_bytes(tricky);
        assert_eq!(value.inline_bytes().unwrap(), Bytes::copy_from_slice(tricky));
        let json = serde_json::to_string(&value).unwrap();
        let back: RefValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back.inline_bytes().unwrap(), Bytes::copy_from_slice(tricky));
    }

    #[test]
    fn test_rfs_round_trip_and_order() {
        let mut rfs = ReferenceFileSystem::new();
        rfs.insert("b/.zgroup", RefValue::Inline(r#"{"zarr_format":2}"#.to_string()));
        rfs.insert("a/.zgroup", RefValue::Inline(r#"{"zarr_format":2}"#.to_string()));
        rfs.insert("a/d/0", RefValue::external("./", 512, 16));
        let bytes = rfs.to_json_bytes().unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.find("a/.zgroup").unwrap() < text.find("b/.zgroup").unwrap());
        let back = ReferenceFileSystem::from_slice(&bytes).unwrap();
        assert_eq!(back, rfs);
        assert_eq!(back.version, LINDI_SPEC_VERSION);
    }

    mod properties {
        use test_strategy::proptest;

        use super::*;
        use crate::strategies::reference_file_systems;
        use pretty_assertions::assert_eq;

        #[proptest]
        fn test_json_round_trip(
            #[strategy(reference_file_systems())] rfs: ReferenceFileSystem,
        ) {
            let bytes = rfs.to_json_bytes().unwrap();
            let back = ReferenceFileSystem::from_slice(&bytes).unwrap();
            assert_eq!(back, rfs);
        }

        #[proptest]
        fn test_serialization_is_deterministic(
            #[strategy(reference_file_systems())] rfs: ReferenceFileSystem,
        ) {
            assert_eq!(rfs.to_json_bytes().unwrap(), rfs.clone().to_json_bytes().unwrap());
        }
    }

    #[test]
    fn test_list_dir() {
        let mut rfs = ReferenceFileSystem::new();
        rfs.insert(".zgroup", RefValue::Inline("{}".to_string()));
        rfs.insert("g/.zgroup", RefValue::Inline("{}".to_string()));
        rfs.insert("g/d/.zarray", RefValue::Inline("{}".to_string()));
        rfs.insert("g/d/0", RefValue::external("./", 0, 1));
        rfs.insert("g/e/.zarray", RefValue::Inline("{}".to_string()));
        assert_eq!(rfs.list_dir(""), vec!["g".to_string()]);
        assert_eq!(rfs.list_dir("g"), vec!["d".to_string(), "e".to_string()]);
        assert_eq!(rfs.list_dir("g/d"), vec!["0".to_string()]);
        assert_eq!(rfs.list_dir("nope"), Vec::<String>::new());
    }
}
