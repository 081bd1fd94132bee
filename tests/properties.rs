//! Property tests over arbitrary content.

use blobtrail::{BlobStorage, Digest, ObjectDatabase, StoreConfig, StoreError, Tree};
use proptest::collection::{btree_map, vec};
use proptest::prelude::*;
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

fn test_blobs(dir: &TempDir) -> BlobStorage {
    let db = ObjectDatabase::open(StoreConfig {
        path: dir.path().join("index"),
        sync_writes: false,
        read_buffer_size: 4096,
        ..Default::default()
    })
    .unwrap();
    BlobStorage::new(Arc::new(db))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn blob_round_trip(data in vec(any::<u8>(), 0..20_000)) {
        let dir = TempDir::new().unwrap();
        let blobs = test_blobs(&dir);

        let source = dir.path().join("source");
        fs::write(&source, &data).unwrap();

        let digest = blobs.ingest(&source).unwrap();
        prop_assert_eq!(digest, Digest::from_bytes(&data));

        let dest = dir.path().join("dest");
        blobs.retrieve(&digest, &dest).unwrap();
        prop_assert_eq!(fs::read(&dest).unwrap(), data);
    }

    #[test]
    fn blob_bit_flip_detected(
        data in vec(any::<u8>(), 1024..8192),
        position in any::<prop::sample::Index>(),
    ) {
        let dir = TempDir::new().unwrap();
        let blobs = test_blobs(&dir);

        let source = dir.path().join("source");
        fs::write(&source, &data).unwrap();
        let digest = blobs.ingest(&source).unwrap();

        let object = blobs.database().object_path(&digest);
        let mut raw = fs::read(&object).unwrap();
        let at = position.index(raw.len());
        raw[at] ^= 0x01;
        fs::write(&object, raw).unwrap();

        let result = blobs.retrieve(&digest, dir.path().join("dest"));
        prop_assert!(
            matches!(result, Err(StoreError::BlobCorruption { .. })),
            "flip at {} not detected: {:?}", at, result
        );
    }

    #[test]
    fn tree_digest_independent_of_insertion_order(
        entries in btree_map("[a-z]{1,8}(/[a-z]{1,8}){0,2}", vec(any::<u8>(), 0..16), 0..32),
    ) {
        let dir = TempDir::new().unwrap();
        let blobs = test_blobs(&dir);
        let db = blobs.database();

        let mut forward = Tree::new();
        for (path, content) in &entries {
            forward.add(path.clone(), Digest::from_bytes(content)).unwrap();
        }
        let mut backward = Tree::new();
        for (path, content) in entries.iter().rev() {
            backward.add(path.clone(), Digest::from_bytes(content)).unwrap();
        }

        let digest = forward.persist(db).unwrap();
        prop_assert_eq!(digest, backward.persist(db).unwrap());

        let loaded = Tree::load(db, &digest).unwrap();
        prop_assert_eq!(loaded.entries(), forward.entries());
    }
}
