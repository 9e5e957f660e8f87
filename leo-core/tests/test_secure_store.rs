#![cfg(feature = "test-utils")]
//! End-to-end secure-store behavior against the in-memory backend:
//! write/read fidelity, metadata overwrite semantics, optimistic writes,
//! soft-delete versus snapshots, metadata-only updates, re-index walks and
//! the encryption/compression pipeline.

mod support;

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use leo_core::metadata::keys;
use leo_core::partition::{DocumentPartition, ItemConfiguration, RecordPartition};
use leo_core::queue::Queue;
use leo_core::store::data_stream_from;
use leo_core::{Metadata, SecureStoreOptions, StoreDataDetails, StoreError, StoreLocation};
use support::*;
use tokio_util::sync::CancellationToken;

fn md(pairs: &[(&str, &str)]) -> Metadata {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

async fn drain_queue(queue: &Arc<leo_core::queue::memory::MemoryQueue>) -> Vec<StoreDataDetails> {
    let ct = CancellationToken::new();
    let mut out = Vec::new();
    loop {
        let batch = queue.listen_for_next_message(32, &ct).await.unwrap();
        if batch.is_empty() {
            break;
        }
        for message in batch {
            out.push(serde_json::from_str(message.message()).unwrap());
            message.complete().await.unwrap();
        }
    }
    out
}

/// Scenario: 1 KiB write carries its metadata through to `get_metadata`.
#[tokio::test]
async fn small_write_reports_length_metadata_and_modified() {
    tracing_init();
    let (store, _queue) = test_engine();
    let location = StoreLocation::new("kalixtest", "tests/A.dat");

    store
        .save_data(
            &location,
            md(&[("metadata1", "somemetadata")]),
            None,
            None,
            data_stream_from(payload_of(1024, 1)),
            SecureStoreOptions::NONE,
        )
        .await
        .unwrap();

    let fetched = store.get_metadata(&location, None).await.unwrap().unwrap();
    assert_eq!(fetched.get(keys::CONTENT_LENGTH), Some("1024"));
    assert_eq!(fetched.get("metadata1"), Some("somemetadata"));
    assert!(fetched.modified().is_some());
}

/// Scenario: a 7 MiB payload reads back byte-identical with a snapshot id.
#[tokio::test]
async fn large_write_roundtrips_and_snapshots() {
    tracing_init();
    let (store, _queue) = test_engine();
    let location = StoreLocation::new("kalixtest", "tests/large.bin");
    let payload = payload_of(7 * 1024 * 1024, 2);

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
    assert!(!saved.snapshot().unwrap_or("").is_empty());

    let loaded = store.load_data(&location, None, None).await.unwrap().unwrap();
    assert!(!loaded.metadata.snapshot().unwrap_or("").is_empty());
    assert_eq!(loaded.read_all().await.unwrap(), payload);
}

/// Scenario: the second write's metadata fully replaces the first's.
#[tokio::test]
async fn writes_overwrite_metadata_never_merge() {
    tracing_init();
    let (store, _queue) = test_engine();
    let location = StoreLocation::new("kalixtest", "tests/meta.dat");

    store
        .save_data(
            &location,
            md(&[("metadata1", "x")]),
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
            md(&[("metadata2", "y")]),
            None,
            None,
            data_stream_from(b"two".to_vec()),
            SecureStoreOptions::NONE,
        )
        .await
        .unwrap();

    let fetched = store.get_metadata(&location, None).await.unwrap().unwrap();
    assert_eq!(fetched.get("metadata2"), Some("y"));
    assert!(fetched.get("metadata1").is_none());
}

/// Scenario: two create-only writes; only the first commits.
#[tokio::test]
async fn create_only_write_wins_once() {
    tracing_init();
    let (store, _queue) = test_engine();
    let location = StoreLocation::new("kalixtest", "tests/cas.dat");

    let first = store
        .try_optimistic_write(
            &location,
            Metadata::new(),
            None,
            None,
            data_stream_from(b"first".to_vec()),
            SecureStoreOptions::NONE,
        )
        .await
        .unwrap();
    assert!(first.ok);

    let second = store
        .try_optimistic_write(
            &location,
            Metadata::new(),
            None,
            None,
            data_stream_from(b"second".to_vec()),
            SecureStoreOptions::NONE,
        )
        .await
        .unwrap();
    assert!(!second.ok);

    let visible = store.load_data(&location, None, None).await.unwrap().unwrap();
    assert_eq!(visible.read_all().await.unwrap(), b"first");
}

/// Scenario: soft delete hides the current version but snapshots stay
/// readable; permanent delete removes them too.
#[tokio::test]
async fn soft_delete_preserves_snapshots_permanent_delete_removes_them() {
    tracing_init();
    let (store, _queue) = test_engine();
    let location = StoreLocation::new("kalixtest", "tests/deleted.dat");

    let saved = store
        .save_data(
            &location,
            md(&[("keep", "me")]),
            None,
            None,
            data_stream_from(b"payload".to_vec()),
            SecureStoreOptions::NONE,
        )
        .await
        .unwrap();
    let snapshot_id = saved.snapshot().unwrap().to_string();

    store
        .delete(&location, None, SecureStoreOptions::KEEP_DELETES)
        .await
        .unwrap();

    assert!(store.load_data(&location, None, None).await.unwrap().is_none());
    let marker = store.get_metadata(&location, None).await.unwrap().unwrap();
    assert!(marker.is_deleted());
    assert_eq!(marker.get("keep"), Some("me"), "user metadata survives");

    let old = store
        .load_data(&location, Some(&snapshot_id), None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(old.read_all().await.unwrap(), b"payload");

    store
        .delete(&location, None, SecureStoreOptions::NONE)
        .await
        .unwrap();
    assert!(store
        .load_data(&location, Some(&snapshot_id), None)
        .await
        .unwrap()
        .is_none());
    assert!(store.find_snapshots(&location).await.unwrap().is_empty());
}

#[tokio::test]
async fn snapshots_list_newest_first_and_exclude_children() {
    tracing_init();
    let (store, _queue) = test_engine();
    let parent = StoreLocation::new("kalixtest", "tree/node");
    let child = StoreLocation::new("kalixtest", "tree/node/child");

    for payload in [b"v1".to_vec(), b"v2".to_vec(), b"v3".to_vec()] {
        store
            .save_data(
                &parent,
                Metadata::new(),
                None,
                None,
                data_stream_from(payload),
                SecureStoreOptions::NONE,
            )
            .await
            .unwrap();
    }
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

    let snapshots = store.find_snapshots(&parent).await.unwrap();
    assert_eq!(snapshots.len(), 3, "children are not the parent's versions");
    assert!(snapshots.windows(2).all(|w| w[0].modified > w[1].modified));
}

#[tokio::test]
async fn save_metadata_preserves_content() {
    tracing_init();
    let (store, _queue) = test_engine();
    let location = StoreLocation::new("kalixtest", "tests/touch.dat");

    store
        .save_data(
            &location,
            md(&[("old", "value")]),
            None,
            None,
            data_stream_from(b"stable bytes".to_vec()),
            SecureStoreOptions::NONE,
        )
        .await
        .unwrap();

    let updated = store
        .save_metadata(
            &location,
            md(&[("fresh", "tag")]),
            None,
            SecureStoreOptions::NONE,
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.get("fresh"), Some("tag"));
    assert_eq!(updated.content_length(), Some(12));

    let loaded = store.load_data(&location, None, None).await.unwrap().unwrap();
    assert_eq!(loaded.metadata.get("fresh"), Some("tag"));
    assert!(loaded.metadata.get("old").is_none());
    assert_eq!(loaded.read_all().await.unwrap(), b"stable bytes");

    let missing = store
        .save_metadata(
            &StoreLocation::new("kalixtest", "tests/nothing.dat"),
            Metadata::new(),
            None,
            SecureStoreOptions::NONE,
        )
        .await
        .unwrap();
    assert!(missing.is_none());
}

#[tokio::test]
async fn save_metadata_does_not_rewrite_prior_snapshots() {
    tracing_init();
    let (store, _queue) = test_engine();
    let location = StoreLocation::new("kalixtest", "tests/immutable.dat");

    let saved = store
        .save_data(
            &location,
            md(&[("old", "value")]),
            None,
            None,
            data_stream_from(b"captured bytes".to_vec()),
            SecureStoreOptions::NONE,
        )
        .await
        .unwrap();
    let captured_id = saved.snapshot().unwrap().to_string();

    let updated = store
        .save_metadata(
            &location,
            md(&[("fresh", "tag")]),
            None,
            SecureStoreOptions::NONE,
        )
        .await
        .unwrap()
        .unwrap();
    assert_ne!(
        updated.snapshot().unwrap(),
        captured_id,
        "a metadata update is a new version, not a rewrite"
    );

    // The snapshot keeps the metadata captured at its creation.
    let old = store
        .load_data(&location, Some(&captured_id), None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(old.metadata.get("old"), Some("value"));
    assert!(old.metadata.get("fresh").is_none());
    assert_eq!(old.read_all().await.unwrap(), b"captured bytes");

    let snapshots = store.find_snapshots(&location).await.unwrap();
    assert_eq!(snapshots.len(), 2);
    let captured = snapshots.iter().find(|s| s.id == captured_id).unwrap();
    assert_eq!(captured.metadata.get("old"), Some("value"));
    assert!(captured.metadata.get("fresh").is_none());

    // The current version carries the new metadata over the same content.
    let current = store.load_data(&location, None, None).await.unwrap().unwrap();
    assert_eq!(current.metadata.get("fresh"), Some("tag"));
    assert!(current.metadata.get("old").is_none());
    assert_eq!(current.read_all().await.unwrap(), b"captured bytes");
}

#[tokio::test]
async fn encrypted_and_compressed_payload_roundtrips() {
    tracing_init();
    let (store, _queue) = test_engine();
    let location = StoreLocation::new("kalixtest", "tests/secret.dat");
    let encryptor = test_encryptor();
    let payload = payload_of(300_000, 7);

    let saved = store
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
    assert_eq!(saved.content_length(), Some(payload.len() as u64));

    let loaded = store
        .load_data(&location, None, Some(&encryptor))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.read_all().await.unwrap(), payload);

    // Without the key the stream cannot be decoded.
    let wrong = store.load_data(&location, None, None).await.unwrap().unwrap();
    assert!(wrong.read_all().await.is_err());
}

#[tokio::test]
async fn save_emits_index_event_and_backup_event() {
    tracing_init();
    let (store, index_queue) = test_engine();
    let backup_queue = Arc::new(leo_core::queue::memory::MemoryQueue::new("backup"));
    let store = store.with_backup_queue(backup_queue.clone() as Arc<dyn Queue>);
    let location = StoreLocation::new("kalixtest", "orders/15");

    store
        .save_data(
            &location,
            Metadata::new(),
            Some(15),
            None,
            data_stream_from(b"data".to_vec()),
            SecureStoreOptions::BACKUP,
        )
        .await
        .unwrap();

    let index_events = drain_queue(&index_queue).await;
    assert_eq!(index_events.len(), 1);
    assert_eq!(index_events[0].id, Some(15));
    assert_eq!(index_events[0].base_path, "orders/15");

    let backup_events = drain_queue(&backup_queue).await;
    assert_eq!(backup_events.len(), 1);
}

#[tokio::test]
async fn backup_all_requires_a_backup_queue() {
    tracing_init();
    let (store, _queue) = test_engine();
    let result = store.backup_all("kalixtest", None).await;
    assert!(matches!(result, Err(StoreError::Queue { .. })));
}

#[tokio::test]
async fn re_index_all_marks_events_and_skips_soft_deleted() {
    tracing_init();
    let (store, index_queue) = test_engine();

    for (path, alive) in [("docs/a", true), ("docs/b", false), ("docs/c", true)] {
        let location = StoreLocation::new("kalixtest", path);
        store
            .save_data(
                &location,
                Metadata::new(),
                None,
                None,
                data_stream_from(b"x".to_vec()),
                SecureStoreOptions::NONE,
            )
            .await
            .unwrap();
        if !alive {
            store
                .delete(&location, None, SecureStoreOptions::KEEP_DELETES)
                .await
                .unwrap();
        }
    }
    // Organic write events out of the way first.
    drain_queue(&index_queue).await;

    let emitted = store.re_index_all("kalixtest", Some("docs/")).await.unwrap();
    assert_eq!(emitted, 2);

    let events = drain_queue(&index_queue).await;
    assert_eq!(events.len(), 2);
    for event in &events {
        assert!(event.metadata.is_reindex());
        assert_ne!(event.base_path, "docs/b");
    }
}

#[tokio::test]
async fn document_partition_maps_paths_and_locks() {
    tracing_init();
    let (store, _queue) = test_engine();
    let partition = DocumentPartition::new(
        store.clone(),
        7u64,
        ItemConfiguration {
            base_path: Some("documents".to_string()),
            compress: false,
            backup: false,
            keep_deletes: true,
        },
        None,
    );

    partition
        .save(
            "letters/a.txt",
            md(&[("metadata1", "x")]),
            data_stream_from(b"hello".to_vec()),
        )
        .await
        .unwrap();

    // The partition addresses `(container = partition id, prefixed path)`.
    let raw = store
        .get_metadata(
            &StoreLocation::new("7", "documents/letters/a.txt"),
            None,
        )
        .await
        .unwrap();
    assert!(raw.is_some());

    let loaded = partition.load("letters/a.txt", None).await.unwrap().unwrap();
    assert_eq!(loaded.read_all().await.unwrap(), b"hello");

    // keep_deletes routes deletes through the soft path.
    partition.delete("letters/a.txt").await.unwrap();
    assert!(partition.load("letters/a.txt", None).await.unwrap().is_none());
    assert_eq!(partition.find_snapshots("letters/a.txt").await.unwrap().len(), 2);

    let lock = partition.lock("letters/a.txt").await.unwrap();
    assert!(matches!(
        partition.lock("letters/a.txt").await,
        Err(StoreError::Lock(_))
    ));
    lock.release().await;
    let reacquired = partition.lock("letters/a.txt").await;
    assert!(reacquired.is_ok());
}

#[tokio::test]
async fn record_partition_encodes_ids_and_stamps_events() {
    tracing_init();
    let (store, index_queue) = test_engine();
    let partition = RecordPartition::new(
        store.clone(),
        9u64,
        ItemConfiguration::default(),
        None,
    );

    partition
        .save(15, Metadata::new(), data_stream_from(b"row".to_vec()))
        .await
        .unwrap();

    let raw = store
        .get_metadata(&StoreLocation::new("9", "00000000000000000015"), None)
        .await
        .unwrap();
    assert!(raw.is_some());

    let events = drain_queue(&index_queue).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].id, Some(15));

    let loaded = partition.load(15, None).await.unwrap().unwrap();
    assert_eq!(loaded.read_all().await.unwrap(), b"row");
}

#[tokio::test]
async fn lazy_encryptor_resolves_once_on_first_use() {
    tracing_init();
    let (store, _queue) = test_engine();
    let resolutions = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counting = Arc::clone(&resolutions);
    let partition = DocumentPartition::new(
        store,
        11u64,
        ItemConfiguration::default(),
        Some(Arc::new(move || {
            let counting = Arc::clone(&counting);
            async move {
                counting.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(Some(
                    Arc::new(leo_core::ChunkedEncryptor::new(&[9u8; 32]))
                        as Arc<dyn leo_core::Encryptor>,
                ))
            }
            .boxed()
        })),
    );

    assert_eq!(resolutions.load(std::sync::atomic::Ordering::SeqCst), 0);
    partition
        .save("a", Metadata::new(), data_stream_from(b"x".to_vec()))
        .await
        .unwrap();
    let loaded = partition.load("a", None).await.unwrap().unwrap();
    assert_eq!(loaded.read_all().await.unwrap(), b"x");
    assert_eq!(
        resolutions.load(std::sync::atomic::Ordering::SeqCst),
        1,
        "factory runs once, not per call"
    );
}

#[tokio::test]
async fn queue_outage_does_not_fail_the_write() {
    tracing_init();

    struct BrokenQueue;
    #[async_trait::async_trait]
    impl Queue for BrokenQueue {
        fn name(&self) -> &str {
            "broken"
        }
        async fn send_message(&self, _body: String) -> Result<(), StoreError> {
            Err(StoreError::queue("broken", "offline"))
        }
        async fn listen_for_next_message(
            &self,
            _max: usize,
            _ct: &CancellationToken,
        ) -> Result<Vec<Box<dyn leo_core::queue::QueueMessage>>, StoreError> {
            Ok(Vec::new())
        }
        async fn create_queue_if_not_exists(&self) -> Result<(), StoreError> {
            Ok(())
        }
        async fn delete_queue_if_exists(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    let store = leo_core::SecureStore::new(
        Arc::new(leo_core::store::memory::MemoryStore::new()),
        Arc::new(BrokenQueue),
    );
    let location = StoreLocation::new("kalixtest", "tests/eventless.dat");
    let saved = store
        .save_data(
            &location,
            Metadata::new(),
            None,
            None,
            data_stream_from(b"still saved".to_vec()),
            SecureStoreOptions::NONE,
        )
        .await
        .unwrap();
    assert_eq!(saved.content_length(), Some(11));
    assert!(store.load_data(&location, None, None).await.unwrap().is_some());
}

#[tokio::test]
async fn wait_until_helper_times_out() {
    // Keeps the helper honest so listener tests can rely on it.
    assert!(!wait_until(Duration::from_millis(30), || false).await);
    assert!(wait_until(Duration::from_millis(30), || true).await);
}
