//! Proptest strategies for the on-disk formats, used by property tests.

use proptest::prelude::*;
use proptest::string::string_regex;

use crate::format::rfs::{ExternalRef, RefValue, ReferenceFileSystem};

#[allow(clippy::expect_used)]
pub fn zarr_keys() -> impl Strategy<Value = String> {
    string_regex("[a-z0-9_]{1,8}(/[a-z0-9_]{1,8}){0,3}").expect("valid regex")
}

pub fn external_refs() -> impl Strategy<Value = ExternalRef> {
    (
        prop_oneof![
            Just("https://example.org/file.h5".to_string()),
            Just("./".to_string()),
            Just("./blobs/chunk".to_string()),
        ],
        0u64..(1 << 40),
        1u64..(1 << 32),
    )
        .prop_map(|(url, offset, size)| ExternalRef::new(url, offset, size))
}

pub fn ref_values() -> impl Strategy<Value = RefValue> {
    prop_oneof![
        // arbitrary bytes pick their own inline representation
        proptest::collection::vec(any::<u8>(), 0..64)
            .prop_map(|data| RefValue::from_bytes(&data)),
        external_refs().prop_map(RefValue::External),
    ]
}

pub fn reference_file_systems() -> impl Strategy<Value = ReferenceFileSystem> {
    proptest::collection::btree_map(zarr_keys(), ref_values(), 0..16).prop_map(|refs| {
        ReferenceFileSystem { version: crate::format::LINDI_SPEC_VERSION, refs }
    })
}
