#![allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]

use bytes::Bytes;
use lindi::tar::{LindiTarFile, MANIFEST_NAME, TAR_ENTRY_NAME, TAR_INDEX_NAME};
use lindi::{
    Format, LindiConfig, OpenMode, RefValue, ReferenceFileSystem, open_lindi,
    open_lindi_opts, write_lindi,
};
use pretty_assertions::assert_eq;

fn base_rfs() -> ReferenceFileSystem {
    let mut rfs = ReferenceFileSystem::empty_root_group();
    rfs.insert("g/.zgroup", RefValue::Inline(r#"{"zarr_format":2}"#.to_string()));
    rfs.insert("g/.zattrs", RefValue::Inline(r#"{"a":1}"#.to_string()));
    rfs
}

#[tokio::test]
async fn test_small_edit_grows_manifest_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.lindi.tar");
    write_lindi(&base_rfs(), &path, Format::Tar).await.unwrap();

    // record all member offsets before the edit
    let before = LindiTarFile::open_local(&path).await.unwrap();
    let offsets_before: Vec<_> = before
        .member_names()
        .map(|n| (n.to_string(), before.member(n).unwrap().data_offset))
        .collect();

    // grow lindi.json by ~100 bytes through a store edit
    let store = open_lindi_opts(
        path.to_str().unwrap(),
        LindiConfig::default(),
        OpenMode::ReadWrite,
    )
    .await
    .unwrap();
    let attr = format!(r#"{{"a":1,"note":"{}"}}"#, "x".repeat(80));
    store.set("g/.zattrs", Bytes::from(attr.clone())).await.unwrap();
    store.flush().await.unwrap();

    // the mutation is visible after reopening, member offsets are unchanged
    let after = LindiTarFile::open_local(&path).await.unwrap();
    for (name, offset) in &offsets_before {
        assert_eq!(
            after.member(name).unwrap().data_offset,
            *offset,
            "member {name} moved"
        );
    }
    let store = open_lindi(path.to_str().unwrap()).await.unwrap();
    assert_eq!(store.get("g/.zattrs").await.unwrap().as_ref(), attr.as_bytes());
}

#[tokio::test]
async fn test_manifest_overflow_tombstones_and_reopens() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.lindi.tar");
    write_lindi(&base_rfs(), &path, Format::Tar).await.unwrap();

    let before = LindiTarFile::open_local(&path).await.unwrap();
    let old_manifest = before.member(MANIFEST_NAME).unwrap().clone();

    // push lindi.json far past its padded capacity
    let store = open_lindi_opts(
        path.to_str().unwrap(),
        LindiConfig::default(),
        OpenMode::ReadWrite,
    )
    .await
    .unwrap();
    for i in 0..400 {
        store
            .set(
                &format!("g/a{i:04}/.zattrs"),
                Bytes::from(format!(r#"{{"i":{i},"pad":"{}"}}"#, "y".repeat(48))),
            )
            .await
            .unwrap();
    }
    store.flush().await.unwrap();

    let after = LindiTarFile::open_local(&path).await.unwrap();
    let new_manifest = after.member(MANIFEST_NAME).unwrap();
    assert!(new_manifest.data_offset > old_manifest.data_offset);
    assert!(new_manifest.capacity > old_manifest.capacity);
    // the original manifest data region is now a tombstone, at its old offset
    assert!(
        !after.member_names().any(|n| n.starts_with("./trash/")),
        "tombstones must not be listed as live members"
    );

    let store = open_lindi(path.to_str().unwrap()).await.unwrap();
    assert!(store.contains("g/a0399/.zattrs").await);
    assert_eq!(store.get("g/.zattrs").await.unwrap().as_ref(), br#"{"a":1}"#);
}

#[tokio::test]
async fn test_arbitrary_grow_sequences_keep_archive_consistent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.lindi.tar");
    write_lindi(&base_rfs(), &path, Format::Tar).await.unwrap();

    // alternate small inline growth (manifest) and blob appends (index
    // growth) over several sessions, the way a long-lived file evolves
    for round in 0..4 {
        let store = open_lindi_opts(
            path.to_str().unwrap(),
            LindiConfig::default(),
            OpenMode::ReadWrite,
        )
        .await
        .unwrap();
        for i in 0..20 {
            store
                .set(
                    &format!("small_{round}_{i}/.zattrs"),
                    Bytes::from(format!(r#"{{"v":{i}}}"#)),
                )
                .await
                .unwrap();
            store
                .set(
                    &format!("big_{round}_{i}/0"),
                    Bytes::from(vec![round as u8; 2000]),
                )
                .await
                .unwrap();
        }
        store.flush().await.unwrap();

        let reopened = open_lindi(path.to_str().unwrap()).await.unwrap();
        for i in 0..20 {
            let chunk = reopened.get(&format!("big_{round}_{i}/0")).await.unwrap();
            assert_eq!(chunk.as_ref(), vec![round as u8; 2000].as_slice());
        }
        assert_eq!(
            reopened.get("g/.zattrs").await.unwrap().as_ref(),
            br#"{"a":1}"#
        );
    }

    // the index still enumerates every live member and no tombstone leaks
    let tar = LindiTarFile::open_local(&path).await.unwrap();
    assert!(tar.has_member(TAR_ENTRY_NAME));
    assert!(tar.has_member(TAR_INDEX_NAME));
    assert!(tar.has_member(MANIFEST_NAME));
    for round in 0..4 {
        for i in 0..20 {
            assert!(tar.has_member(&format!("blobs/big_{round}_{i}/0")));
        }
    }
    assert!(!tar.member_names().any(|n| n.starts_with("./trash/")));
}

#[tokio::test]
async fn test_dir_container_equivalent_workflow() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.lindi.d");
    write_lindi(&base_rfs(), &path, Format::Dir).await.unwrap();

    let store = open_lindi_opts(
        path.to_str().unwrap(),
        LindiConfig::default(),
        OpenMode::ReadWrite,
    )
    .await
    .unwrap();
    let chunk = Bytes::from(vec![6u8; 4000]);
    store.set("g/d/0", chunk.clone()).await.unwrap();
    store.flush().await.unwrap();

    let reopened = open_lindi(path.to_str().unwrap()).await.unwrap();
    assert_eq!(reopened.get("g/d/0").await.unwrap(), chunk);
    let rfs = reopened.to_rfs().await;
    let reference = rfs.get("g/d/0").unwrap().as_external().unwrap();
    assert!(reference.url.starts_with("./blobs/"));
}
