#![cfg(feature = "test-utils")]
//! Property tests for the store invariants: write/read fidelity, overwrite
//! semantics, soft-delete versus snapshots, descendant exclusion, and the
//! single-winner guarantee for concurrent create-only writes.

mod support;

use std::collections::BTreeMap;
use std::sync::Arc;

use proptest::prelude::*;
use support::*;

use leo_core::store::data_stream_from;
use leo_core::{Metadata, SecureStoreOptions, StoreLocation};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("test runtime")
}

fn user_metadata_strategy() -> impl Strategy<Value = BTreeMap<String, String>> {
    proptest::collection::btree_map("[a-z]{1,8}", "[a-zA-Z0-9 ]{0,16}", 0..5)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Written bytes read back identically and the read metadata is a
    /// superset of the user metadata.
    #[test]
    fn write_then_read_is_faithful(
        payload in proptest::collection::vec(any::<u8>(), 0..2048),
        user in user_metadata_strategy(),
    ) {
        runtime().block_on(async {
            let (store, _queue) = test_engine();
            let location = StoreLocation::new("kalixtest", "prop/roundtrip");
            let metadata: Metadata = user.clone().into();

            let saved = store
                .save_data(
                    &location,
                    metadata,
                    None,
                    None,
                    data_stream_from(payload.clone()),
                    SecureStoreOptions::NONE,
                )
                .await
                .unwrap();
            prop_assert_eq!(saved.content_length(), Some(payload.len() as u64));

            let loaded = store.load_data(&location, None, None).await.unwrap().unwrap();
            for (key, value) in &user {
                prop_assert_eq!(loaded.metadata.get(key), Some(value.as_str()));
            }
            let bytes = loaded.read_all().await.unwrap();
            prop_assert_eq!(bytes, payload);
            Ok(())
        })?;
    }

    /// A second write's metadata fully replaces the first's: no key from the
    /// first write survives unless the second set it too.
    #[test]
    fn successive_writes_overwrite_metadata(
        first in user_metadata_strategy(),
        second in user_metadata_strategy(),
    ) {
        runtime().block_on(async {
            let (store, _queue) = test_engine();
            let location = StoreLocation::new("kalixtest", "prop/overwrite");

            store
                .save_data(
                    &location,
                    first.clone().into(),
                    None,
                    None,
                    data_stream_from(b"one".to_vec()),
                    SecureStoreOptions::NONE,
                )
                .await
                .unwrap();
            store
                .save_data(
                    &location,
                    second.clone().into(),
                    None,
                    None,
                    data_stream_from(b"two".to_vec()),
                    SecureStoreOptions::NONE,
                )
                .await
                .unwrap();

            let fetched = store.get_metadata(&location, None).await.unwrap().unwrap();
            for key in first.keys() {
                if !second.contains_key(key) {
                    prop_assert!(
                        fetched.get(key).is_none(),
                        "stale key {} survived the overwrite",
                        key
                    );
                }
            }
            for (key, value) in &second {
                prop_assert_eq!(fetched.get(key), Some(value.as_str()));
            }
            Ok(())
        })?;
    }

    /// Soft delete hides the current version while every prior snapshot
    /// stays readable; permanent delete removes them all.
    #[test]
    fn soft_delete_keeps_snapshots_readable(
        payloads in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 1..256),
            1..4,
        ),
    ) {
        runtime().block_on(async {
            let (store, _queue) = test_engine();
            let location = StoreLocation::new("kalixtest", "prop/softdelete");

            let mut snapshots = Vec::new();
            for payload in &payloads {
                let saved = store
                    .save_data(
                        &location,
                        Metadata::new(),
                        None,
                        None,
                        data_stream_from(payload.clone()),
                        SecureStoreOptions::NONE,
                    )
                    .await
                    .unwrap();
                snapshots.push(saved.snapshot().unwrap().to_string());
            }

            store
                .delete(&location, None, SecureStoreOptions::KEEP_DELETES)
                .await
                .unwrap();
            prop_assert!(store.load_data(&location, None, None).await.unwrap().is_none());

            for (snapshot, payload) in snapshots.iter().zip(&payloads) {
                let loaded = store
                    .load_data(&location, Some(snapshot), None)
                    .await
                    .unwrap()
                    .expect("snapshot survives soft delete");
                let bytes = loaded.read_all().await.unwrap();
                prop_assert_eq!(&bytes, payload);
            }

            store
                .delete(&location, None, SecureStoreOptions::NONE)
                .await
                .unwrap();
            for snapshot in &snapshots {
                prop_assert!(store
                    .load_data(&location, Some(snapshot), None)
                    .await
                    .unwrap()
                    .is_none());
            }
            Ok(())
        })?;
    }

    /// `find_snapshots` never reports versions of a strict descendant path.
    #[test]
    fn snapshot_listing_excludes_descendants(
        parent_writes in 1usize..4,
        child_suffixes in proptest::collection::vec("[a-z]{1,6}", 0..3),
    ) {
        runtime().block_on(async {
            let (store, _queue) = test_engine();
            let parent = StoreLocation::new("kalixtest", "prop/tree/node");

            for i in 0..parent_writes {
                store
                    .save_data(
                        &parent,
                        Metadata::new(),
                        None,
                        None,
                        data_stream_from(vec![i as u8]),
                        SecureStoreOptions::NONE,
                    )
                    .await
                    .unwrap();
            }
            for suffix in &child_suffixes {
                let child =
                    StoreLocation::new("kalixtest", format!("prop/tree/node/{suffix}"));
                store
                    .save_data(
                        &child,
                        Metadata::new(),
                        None,
                        None,
                        data_stream_from(b"child".to_vec()),
                        SecureStoreOptions::NONE,
                    )
                    .await
                    .unwrap();
            }

            let snapshots = store.find_snapshots(&parent).await.unwrap();
            prop_assert_eq!(snapshots.len(), parent_writes);
            Ok(())
        })?;
    }
}

/// Out of N concurrent create-only attempts exactly one commits, and its
/// payload is the one left visible.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_create_only_writes_have_one_winner() {
    tracing_init();
    let (store, _queue) = test_engine();
    let store = Arc::new(store);
    let location = StoreLocation::new("kalixtest", "prop/single-winner");

    let mut attempts = Vec::new();
    for i in 0..16u8 {
        let store = Arc::clone(&store);
        let location = location.clone();
        attempts.push(tokio::spawn(async move {
            let result = store
                .try_optimistic_write(
                    &location,
                    Metadata::new(),
                    None,
                    None,
                    data_stream_from(vec![i; 8]),
                    SecureStoreOptions::NONE,
                )
                .await
                .unwrap();
            (i, result.ok)
        }));
    }

    let mut winners = Vec::new();
    for attempt in attempts {
        let (i, won) = attempt.await.unwrap();
        if won {
            winners.push(i);
        }
    }
    assert_eq!(winners.len(), 1, "exactly one create-only attempt commits");

    let visible = store
        .load_data(&location, None, None)
        .await
        .unwrap()
        .unwrap()
        .read_all()
        .await
        .unwrap();
    assert_eq!(visible, vec![winners[0]; 8]);
}

/// The encrypted pipeline preserves arbitrary payloads end to end.
#[test]
fn encrypted_roundtrip_property() {
    let encryptor = test_encryptor();
    proptest!(ProptestConfig::with_cases(16), |(payload in proptest::collection::vec(any::<u8>(), 0..4096))| {
        runtime().block_on(async {
            let (store, _queue) = test_engine();
            let location = StoreLocation::new("kalixtest", "prop/secret");
            store
                .save_data(
                    &location,
                    Metadata::new(),
                    None,
                    Some(&encryptor),
                    data_stream_from(payload.clone()),
                    SecureStoreOptions::COMPRESS,
                )
                .await
                .unwrap();
            let loaded = store
                .load_data(&location, None, Some(&encryptor))
                .await
                .unwrap()
                .unwrap();
            let bytes = loaded.read_all().await.unwrap();
            prop_assert_eq!(bytes, payload);
            Ok(())
        })?;
    });
}
