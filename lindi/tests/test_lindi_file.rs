#![allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]

use bytes::Bytes;
use lindi::format::metadata::ZArray;
use lindi::store::StoreErrorKind;
use lindi::{
    Format, LindiConfig, OpenMode, RefValue, ReferenceFileSystem, open_lindi,
    open_lindi_opts, write_lindi,
};
use pretty_assertions::assert_eq;

fn store_with_group_and_dataset() -> ReferenceFileSystem {
    let mut rfs = ReferenceFileSystem::empty_root_group();
    rfs.insert("g/.zgroup", RefValue::Inline(r#"{"zarr_format":2}"#.to_string()));
    rfs.insert("g/.zattrs", RefValue::Inline(r#"{"a":7}"#.to_string()));
    let zarray = ZArray::new(vec![10], vec![10], "<f4");
    rfs.insert(
        "g/d/.zarray",
        RefValue::Inline(String::from_utf8(zarray.to_json_bytes().unwrap()).unwrap()),
    );
    rfs.insert("g/d/0", RefValue::Base64(vec![0u8; 40]));
    rfs
}

#[tokio::test]
async fn test_create_write_reopen_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.lindi.json");
    write_lindi(&store_with_group_and_dataset(), &path, Format::Json).await.unwrap();

    let store = open_lindi(path.to_str().unwrap()).await.unwrap();
    let attrs = store.get("g/.zattrs").await.unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&attrs).unwrap();
    assert_eq!(parsed, serde_json::json!({"a": 7}));

    let chunk = store.get("g/d/0").await.unwrap();
    assert_eq!(chunk.len(), 40);
    assert!(chunk.iter().all(|b| *b == 0));
}

#[tokio::test]
async fn test_round_trip_preserves_rfs_exactly() {
    let dir = tempfile::tempdir().unwrap();
    let rfs = store_with_group_and_dataset();
    for (name, format) in [
        ("a.lindi.json", Format::Json),
        ("a.lindi.tar", Format::Tar),
        ("a.lindi.d", Format::Dir),
    ] {
        let path = dir.path().join(name);
        write_lindi(&rfs, &path, format).await.unwrap();
        let reopened = open_lindi(path.to_str().unwrap()).await.unwrap();
        assert_eq!(reopened.to_rfs().await, rfs, "format {format:?}");
    }
}

#[tokio::test]
async fn test_reads_identical_across_formats() {
    let dir = tempfile::tempdir().unwrap();
    let rfs = store_with_group_and_dataset();

    let mut stores = Vec::new();
    for (name, format) in [
        ("e.lindi.json", Format::Json),
        ("e.lindi.tar", Format::Tar),
        ("e.lindi.d", Format::Dir),
    ] {
        let path = dir.path().join(name);
        write_lindi(&rfs, &path, format).await.unwrap();
        stores.push(open_lindi(path.to_str().unwrap()).await.unwrap());
    }

    for key in rfs.refs.keys() {
        let baseline = stores[0].get(key).await.unwrap();
        for store in &stores[1..] {
            assert_eq!(store.get(key).await.unwrap(), baseline, "key {key}");
        }
    }
}

#[tokio::test]
async fn test_no_op_edit_cycle_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.lindi.tar");
    let rfs = store_with_group_and_dataset();
    write_lindi(&rfs, &path, Format::Tar).await.unwrap();

    let store = open_lindi_opts(
        path.to_str().unwrap(),
        LindiConfig::default(),
        OpenMode::ReadWrite,
    )
    .await
    .unwrap();
    store.flush().await.unwrap();

    let reopened = open_lindi(path.to_str().unwrap()).await.unwrap();
    assert_eq!(reopened.to_rfs().await, rfs);
}

#[tokio::test]
async fn test_corrupt_reference_size_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    // a "remote" file with only 10 bytes
    let remote = dir.path().join("remote.bin");
    std::fs::write(&remote, vec![1u8; 10]).unwrap();

    let mut rfs = ReferenceFileSystem::empty_root_group();
    rfs.insert(
        "g/d/0",
        RefValue::external(remote.to_str().unwrap().to_string(), 0, 4096),
    );
    let path = dir.path().join("t.lindi.json");
    write_lindi(&rfs, &path, Format::Json).await.unwrap();

    let store = open_lindi(path.to_str().unwrap()).await.unwrap();
    let err = store.get("g/d/0").await.unwrap_err();
    match err.kind() {
        StoreErrorKind::Fetch(fetch_err) => {
            assert!(matches!(
                fetch_err.kind(),
                lindi::fetch::FetchErrorKind::SizeMismatch { expected: 4096, .. }
            ));
        }
        other => panic!("expected a size mismatch, got {other}"),
    }
}

#[tokio::test]
async fn test_relative_refs_resolve_against_manifest_dir() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("sidecar.bin"), b"0123456789").unwrap();

    let mut rfs = ReferenceFileSystem::empty_root_group();
    rfs.insert("g/d/0", RefValue::external("sidecar.bin", 2, 4));
    let path = dir.path().join("t.lindi.json");
    write_lindi(&rfs, &path, Format::Json).await.unwrap();

    let store = open_lindi(path.to_str().unwrap()).await.unwrap();
    assert_eq!(store.get("g/d/0").await.unwrap().as_ref(), b"2345");
}

#[tokio::test]
async fn test_writable_json_store_stages_and_flushes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.lindi.json");
    write_lindi(&ReferenceFileSystem::empty_root_group(), &path, Format::Json)
        .await
        .unwrap();

    let store = open_lindi_opts(
        path.to_str().unwrap(),
        LindiConfig::default(),
        OpenMode::ReadWrite,
    )
    .await
    .unwrap();
    store
        .set("g/.zgroup", Bytes::from_static(br#"{"zarr_format":2}"#))
        .await
        .unwrap();
    let chunk = Bytes::from(vec![8u8; 3000]);
    store.set("g/d/0", chunk.clone()).await.unwrap();
    store.flush().await.unwrap();

    // the manifest on disk now holds the metadata and a staged chunk ref
    let reopened = open_lindi(path.to_str().unwrap()).await.unwrap();
    assert!(reopened.contains("g/.zgroup").await);
    assert_eq!(reopened.get("g/d/0").await.unwrap(), chunk);
}
