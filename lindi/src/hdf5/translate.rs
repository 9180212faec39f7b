use serde_json::{Map, Value, json};
use tracing::{debug, instrument, warn};

use super::codecs::filters_to_codecs;
use super::{H5Dtype, H5ErrorKind, H5Node, H5Result, H5Value, Hdf5Reader};
use crate::config::LindiConfig;
use crate::format::metadata::{
    ATTR_COMPOUND_DTYPE, ATTR_EXTERNAL_ARRAY_LINK, ATTR_SCALAR, ATTR_SOFT_LINK,
    CodecSpec, ExternalArrayLink, ZArray, chunk_coords_iter, chunk_name, float_to_json,
};
use crate::format::rfs::{RefValue, ReferenceFileSystem};
use crate::format::{join_key, split_key};

/// Walk an HDF5 tree and emit a reference file system whose bulk data
/// references point back into the HDF5 file at `url`.
///
/// Traversal is depth first with children in lexicographic order, so the
/// same file always yields byte-identical output.
#[instrument(skip(reader, config))]
pub fn translate_hdf5(
    reader: &dyn Hdf5Reader,
    url: &str,
    config: &LindiConfig,
) -> H5Result<ReferenceFileSystem> {
    let mut translator = Translator {
        reader,
        url,
        config,
        rfs: ReferenceFileSystem::new(),
    };
    translator.process_group("")?;
    Ok(translator.rfs)
}

struct Translator<'a> {
    reader: &'a dyn Hdf5Reader,
    url: &'a str,
    config: &'a LindiConfig,
    rfs: ReferenceFileSystem,
}

impl Translator<'_> {
    fn emit_json(&mut self, key: String, value: &Value) -> H5Result<()> {
        let text = serde_json::to_string(value)?;
        self.rfs.insert(key, RefValue::Inline(text));
        Ok(())
    }

    fn emit_zattrs(&mut self, path: &str, attrs: Map<String, Value>) -> H5Result<()> {
        if !attrs.is_empty() {
            self.emit_json(join_key(path, ".zattrs"), &Value::Object(attrs))?;
        }
        Ok(())
    }

    fn attrs_map(&self, path: &str) -> H5Result<Map<String, Value>> {
        let mut map = Map::new();
        for (name, value) in self.reader.attributes(path)? {
            map.insert(name, value.to_zarr_json()?);
        }
        Ok(map)
    }

    fn process_group(&mut self, path: &str) -> H5Result<()> {
        self.emit_json(join_key(path, ".zgroup"), &json!({"zarr_format": 2}))?;
        self.emit_zattrs(path, self.attrs_map(path)?)?;

        let mut children = self.reader.children(path)?;
        children.sort();
        for child in children {
            let child_path = join_key(path, &child);
            match self.reader.node(&child_path)? {
                H5Node::Group => self.process_group(&child_path)?,
                H5Node::Dataset => self.process_dataset(&child_path)?,
                H5Node::SoftLink { target } => {
                    // an empty group carrying only the link attribute;
                    // resolution is lazy, enumeration never follows it
                    self.emit_json(
                        join_key(&child_path, ".zgroup"),
                        &json!({"zarr_format": 2}),
                    )?;
                    let mut attrs = Map::new();
                    attrs.insert(
                        ATTR_SOFT_LINK.to_string(),
                        json!({"path": target}),
                    );
                    self.emit_zattrs(&child_path, attrs)?;
                }
                H5Node::ExternalLink { file, path: target } => {
                    warn!(
                        path = %child_path,
                        file = %file,
                        target = %target,
                        "external links are not supported, skipping"
                    );
                }
            }
        }
        Ok(())
    }

    fn process_dataset(&mut self, path: &str) -> H5Result<()> {
        let info = self.reader.dataset_info(path)?;
        let mut attrs = self.attrs_map(path)?;

        if info.shape.is_empty() {
            return self.process_scalar(path, &info.dtype, attrs);
        }

        match &info.dtype {
            dtype if dtype.is_numeric() => {
                let codecs = match filters_to_codecs(&info.filters) {
                    Ok(codecs) => codecs,
                    Err(e) => {
                        return self.downgrade_to_external_link(
                            path,
                            &info,
                            attrs,
                            &format!("{}", e.kind()),
                        );
                    }
                };
                let chunks =
                    info.chunk_shape.clone().unwrap_or_else(|| info.shape.clone());
                let mut zarray =
                    ZArray::new(info.shape.clone(), chunks, dtype.zarr_dtype());
                zarray.fill_value = fill_value_json(dtype, info.fill_value);
                if !codecs.is_empty() {
                    zarray.filters = Some(codecs);
                }

                if info.chunk_shape.is_some()
                    && zarray.num_chunks() > self.config.num_dataset_chunks_threshold()
                {
                    return self.downgrade_to_external_link(
                        path,
                        &info,
                        attrs,
                        "chunk count exceeds threshold",
                    );
                }

                self.emit_json(
                    join_key(path, ".zarray"),
                    &serde_json::to_value(&zarray)?,
                )?;
                self.emit_zattrs(path, attrs)?;

                if info.chunk_shape.is_some() {
                    for coords in chunk_coords_iter(&zarray.chunk_grid_shape()) {
                        match self.reader.chunk_byte_range(path, &coords)? {
                            Some((offset, size)) => {
                                self.rfs.insert(
                                    join_key(path, &chunk_name(&coords)),
                                    RefValue::external(self.url, offset, size),
                                );
                            }
                            None => {
                                debug!(path, ?coords, "chunk not allocated, skipped")
                            }
                        }
                    }
                } else {
                    // contiguous dataset: a single chunk spanning the array
                    let (offset, size) = self.reader.contiguous_byte_range(path)?;
                    let coords = vec![0u64; info.shape.len()];
                    self.rfs.insert(
                        join_key(path, &chunk_name(&coords)),
                        RefValue::external(self.url, offset, size),
                    );
                }
                Ok(())
            }
            H5Dtype::VarString | H5Dtype::Reference => {
                let values = self.reader.object_values(path)?;
                let mut payload: Vec<Value> = values
                    .iter()
                    .map(|v| v.to_zarr_json())
                    .collect::<H5Result<_>>()?;
                payload.push(json!("|O"));
                payload.push(json!(info.shape));
                let mut zarray =
                    ZArray::new(info.shape.clone(), info.shape.clone(), "|O");
                zarray.fill_value = json!(" ");
                zarray.filters = Some(vec![CodecSpec::new("json2")]);
                self.emit_json(
                    join_key(path, ".zarray"),
                    &serde_json::to_value(&zarray)?,
                )?;
                self.emit_zattrs(path, attrs)?;
                let coords = vec![0u64; info.shape.len()];
                self.emit_json(
                    join_key(path, &chunk_name(&coords)),
                    &Value::Array(payload),
                )?;
                Ok(())
            }
            H5Dtype::Compound(fields) => {
                if info.shape.len() != 1 {
                    warn!(
                        path,
                        ndim = info.shape.len(),
                        "only 1-d compound datasets are supported, skipping"
                    );
                    return Ok(());
                }
                let rows = self.reader.object_values(path)?;
                let mut payload: Vec<Value> = rows
                    .iter()
                    .map(|row| row.to_zarr_json())
                    .collect::<H5Result<_>>()?;
                payload.push(json!("|O"));
                payload.push(json!(info.shape));
                let field_descriptors: Vec<Value> = fields
                    .iter()
                    .map(|(name, dtype)| json!([name, dtype.type_name()]))
                    .collect();
                attrs.insert(
                    ATTR_COMPOUND_DTYPE.to_string(),
                    Value::Array(field_descriptors),
                );
                let mut zarray =
                    ZArray::new(info.shape.clone(), info.shape.clone(), "|O");
                zarray.fill_value = json!(" ");
                zarray.filters = Some(vec![CodecSpec::new("json2")]);
                self.emit_json(
                    join_key(path, ".zarray"),
                    &serde_json::to_value(&zarray)?,
                )?;
                self.emit_zattrs(path, attrs)?;
                self.emit_json(join_key(path, "0"), &Value::Array(payload))?;
                Ok(())
            }
            _ => unreachable!("numeric dtypes are handled above"),
        }
    }

    fn process_scalar(
        &mut self,
        path: &str,
        dtype: &H5Dtype,
        mut attrs: Map<String, Value>,
    ) -> H5Result<()> {
        attrs.insert(ATTR_SCALAR.to_string(), json!(true));
        let value = self.reader.scalar_value(path)?;
        if dtype.is_numeric() {
            let Some(bytes) = value.scalar_bytes(dtype) else {
                warn!(path, "scalar value does not match its dtype, skipping");
                return Ok(());
            };
            let mut zarray = ZArray::new(vec![1], vec![1], dtype.zarr_dtype());
            zarray.fill_value = fill_value_json(dtype, None);
            self.emit_json(join_key(path, ".zarray"), &serde_json::to_value(&zarray)?)?;
            self.emit_zattrs(path, attrs)?;
            self.rfs.insert(join_key(path, "0"), RefValue::from_bytes(&bytes));
            Ok(())
        } else if let H5Value::String(text) = &value {
            let mut zarray = ZArray::new(vec![1], vec![1], "|O");
            zarray.fill_value = json!(" ");
            zarray.filters = Some(vec![CodecSpec::new("json2")]);
            self.emit_json(join_key(path, ".zarray"), &serde_json::to_value(&zarray)?)?;
            self.emit_zattrs(path, attrs)?;
            self.emit_json(join_key(path, "0"), &json!([text, "|O", [1]]))?;
            Ok(())
        } else {
            warn!(path, ?value, "unsupported scalar dataset, skipping");
            Ok(())
        }
    }

    /// Emit the dataset without any chunk references, directing readers to
    /// open the HDF5 file for it instead.
    fn downgrade_to_external_link(
        &mut self,
        path: &str,
        info: &super::H5DatasetInfo,
        mut attrs: Map<String, Value>,
        reason: &str,
    ) -> H5Result<()> {
        if self.url.is_empty() {
            warn!(path, reason, "no url for external array link, dataset skipped");
            return Ok(());
        }
        warn!(path, reason, "dataset downgraded to external array link");
        let link = ExternalArrayLink::hdf5_dataset(self.url, path);
        attrs.insert(ATTR_EXTERNAL_ARRAY_LINK.to_string(), serde_json::to_value(&link)?);
        let chunks = info.chunk_shape.clone().unwrap_or_else(|| info.shape.clone());
        let mut zarray = ZArray::new(info.shape.clone(), chunks, info.dtype.zarr_dtype());
        zarray.fill_value = fill_value_json(&info.dtype, info.fill_value);
        self.emit_json(join_key(path, ".zarray"), &serde_json::to_value(&zarray)?)?;
        self.emit_zattrs(path, attrs)?;
        Ok(())
    }
}

fn fill_value_json(dtype: &H5Dtype, fill: Option<f64>) -> Value {
    match fill {
        None => json!(0),
        Some(f) => match dtype {
            H5Dtype::Float32 | H5Dtype::Float64 => float_to_json(f),
            _ => json!(f as i64),
        },
    }
}

/// Check that every chunk key in an RFS lies within the grid declared by its
/// array. Used by tests and by consumers validating untrusted manifests.
pub fn validate_chunk_keys(rfs: &ReferenceFileSystem) -> H5Result<()> {
    for key in rfs.refs.keys() {
        let (parent, name) = split_key(key);
        let Some(coords) = crate::format::metadata::parse_chunk_name(name) else {
            continue;
        };
        let zarray_key = join_key(parent, ".zarray");
        let Some(zarray_bytes) = rfs.get(&zarray_key).and_then(RefValue::inline_bytes)
        else {
            continue;
        };
        let zarray = ZArray::from_slice(&zarray_bytes)
            .map_err(|e| H5ErrorKind::Read(e.to_string()))?;
        if !zarray.chunk_in_bounds(&coords) {
            return Err(H5ErrorKind::Read(format!(
                "chunk key `{key}` outside declared shape"
            ))
            .into());
        }
    }
    Ok(())
}
