//! Translation of HDF5 filter pipelines into the Zarr codec names the
//! external codec catalog understands, so raw HDF5 chunk bytes decode
//! correctly without rewriting them.

use serde_json::json;

use super::{H5ErrorKind, H5Filter, H5Result};
use crate::format::metadata::CodecSpec;

/// Map a dataset's filter pipeline to Zarr codec specs, in pipeline order.
///
/// Filters with no Zarr equivalent (szip, lzf, scaleoffset, anything
/// unknown) are an error; the caller downgrades the dataset to an external
/// array link instead of emitting chunk references that cannot decode.
pub fn filters_to_codecs(filters: &[H5Filter]) -> H5Result<Vec<CodecSpec>> {
    let mut codecs = Vec::with_capacity(filters.len());
    for filter in filters {
        match filter {
            H5Filter::Shuffle { element_size } => codecs.push(
                CodecSpec::new("shuffle").with("elementsize", json!(element_size)),
            ),
            H5Filter::Gzip { level } => {
                codecs.push(CodecSpec::new("zlib").with("level", json!(level)));
            }
            H5Filter::Blosc { cname, clevel, shuffle, blocksize } => codecs.push(
                CodecSpec::new("blosc")
                    .with("cname", json!(cname))
                    .with("clevel", json!(clevel))
                    .with("shuffle", json!(shuffle))
                    .with("blocksize", json!(blocksize)),
            ),
            H5Filter::Zstd { level } => {
                codecs.push(CodecSpec::new("zstd").with("level", json!(level)));
            }
            H5Filter::Fletcher32 => codecs.push(CodecSpec::new("fletcher32")),
            H5Filter::ScaleOffset => {
                return Err(H5ErrorKind::UnsupportedFilter {
                    filter: "scaleoffset".to_string(),
                }
                .into());
            }
            H5Filter::Szip => {
                return Err(
                    H5ErrorKind::UnsupportedFilter { filter: "szip".to_string() }.into()
                );
            }
            H5Filter::Lzf => {
                return Err(
                    H5ErrorKind::UnsupportedFilter { filter: "lzf".to_string() }.into()
                );
            }
            H5Filter::Other { id } => {
                return Err(H5ErrorKind::UnsupportedFilter {
                    filter: format!("filter id {id}"),
                }
                .into());
            }
        }
    }
    Ok(codecs)
}
