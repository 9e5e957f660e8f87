//! The engine-facing facade.
//!
//! Orchestrates the encryption/compression pipeline, snapshot and soft-delete
//! semantics, metadata normalization, change-event emission and locking on
//! top of a backend [`ObjectStore`]. Partitions talk to this; nothing above
//! this layer sees backend-specific behavior.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tokio_util::io::StreamReader;
use tracing::{error, info, warn};

use crate::error::StoreError;
use crate::events::StoreDataDetails;
use crate::location::StoreLocation;
use crate::metadata::{keys, now_ticks, Metadata};
use crate::options::SecureStoreOptions;
use crate::pipeline::{self, Encryptor};
use crate::queue::Queue;
use crate::store::{
    DataStream, DataWithMetadata, DataWriter, ObjectStore, OptimisticResult, Snapshot, StoreLock,
};

/// Secure store over one backend adapter and the engine's queues.
///
/// The encryptor is supplied per call: different partitions of one engine
/// use different keys against the same backend.
#[derive(Clone)]
pub struct SecureStore {
    store: Arc<dyn ObjectStore>,
    index_queue: Arc<dyn Queue>,
    backup_queue: Option<Arc<dyn Queue>>,
}

impl SecureStore {
    pub fn new(store: Arc<dyn ObjectStore>, index_queue: Arc<dyn Queue>) -> Self {
        SecureStore {
            store,
            index_queue,
            backup_queue: None,
        }
    }

    pub fn with_backup_queue(mut self, backup_queue: Arc<dyn Queue>) -> Self {
        self.backup_queue = Some(backup_queue);
        self
    }

    pub fn backend(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub async fn create_container_if_not_exists(&self, container: &str) -> Result<(), StoreError> {
        self.store.create_container_if_not_exists(container).await
    }

    /// Write a new current version. The payload streams through the
    /// compression and encryption stages; `ContentLength` is the logical
    /// byte count taken before either. An index event is always emitted on
    /// success (`GENERATE_INDEX_EVENT` is implied for saves), a backup event
    /// when `BACKUP` is set. Event failures never roll back the write.
    pub async fn save_data(
        &self,
        location: &StoreLocation,
        user_metadata: Metadata,
        id: Option<u64>,
        encryptor: Option<&Arc<dyn Encryptor>>,
        data: DataStream,
        options: SecureStoreOptions,
    ) -> Result<Metadata, StoreError> {
        let (effective, writer) = self.prepare_write(user_metadata, None, encryptor, data, options);
        let saved = self.store.save_data(location, effective, writer).await?;
        info!(
            "saved {} ({} bytes)",
            location,
            saved.content_length().unwrap_or(0)
        );
        self.emit_change_events(
            location,
            id,
            &saved,
            options | SecureStoreOptions::GENERATE_INDEX_EVENT,
        )
        .await;
        let mut outbound = saved;
        outbound.strip_internal();
        Ok(outbound)
    }

    /// Conditional write. The condition comes from the `ETag` in the caller
    /// metadata: absent means create-only, a value must match, `"*"` is
    /// unconditional. Precondition failure is `ok == false`, never an error.
    pub async fn try_optimistic_write(
        &self,
        location: &StoreLocation,
        user_metadata: Metadata,
        id: Option<u64>,
        encryptor: Option<&Arc<dyn Encryptor>>,
        data: DataStream,
        options: SecureStoreOptions,
    ) -> Result<OptimisticResult, StoreError> {
        let condition_etag = user_metadata.etag().map(str::to_string);
        let (effective, writer) =
            self.prepare_write(user_metadata, condition_etag, encryptor, data, options);
        let result = self
            .store
            .try_optimistic_write(location, effective, writer)
            .await?;
        if !result.ok {
            return Ok(result);
        }
        let saved = result.metadata.expect("committed write carries metadata");
        self.emit_change_events(
            location,
            id,
            &saved,
            options | SecureStoreOptions::GENERATE_INDEX_EVENT,
        )
        .await;
        let mut outbound = saved;
        outbound.strip_internal();
        Ok(OptimisticResult::committed(outbound))
    }

    /// Read the current version, or one snapshot. Soft-deleted records are
    /// hidden unless a snapshot is requested explicitly.
    pub async fn load_data(
        &self,
        location: &StoreLocation,
        snapshot: Option<&str>,
        encryptor: Option<&Arc<dyn Encryptor>>,
    ) -> Result<Option<DataWithMetadata>, StoreError> {
        let loaded = match self.store.load_data(location, snapshot).await? {
            Some(loaded) => loaded,
            None => return Ok(None),
        };
        if snapshot.is_none() && loaded.metadata.is_deleted() {
            return Ok(None);
        }
        let compressed = loaded.metadata.contains_key(keys::COMPRESSED);
        let stream = pipeline::apply_read_pipeline(loaded.stream, compressed, encryptor);
        let mut metadata = loaded.metadata;
        metadata.strip_internal();
        Ok(Some(DataWithMetadata { stream, metadata }))
    }

    /// Metadata of the current version or one snapshot. Returns metadata for
    /// soft-deleted records too; hiding them is the caller's decision.
    pub async fn get_metadata(
        &self,
        location: &StoreLocation,
        snapshot: Option<&str>,
    ) -> Result<Option<Metadata>, StoreError> {
        let metadata = self.store.get_metadata(location, snapshot).await?;
        Ok(metadata.map(|mut md| {
            md.strip_internal();
            md
        }))
    }

    /// Metadata-only update preserving content.
    pub async fn save_metadata(
        &self,
        location: &StoreLocation,
        user_metadata: Metadata,
        id: Option<u64>,
        options: SecureStoreOptions,
    ) -> Result<Option<Metadata>, StoreError> {
        let mut effective = user_metadata.user_only();
        effective.set_modified(now_ticks());
        let updated = match self.store.save_metadata(location, effective).await? {
            Some(updated) => updated,
            None => return Ok(None),
        };
        self.emit_change_events(
            location,
            id,
            &updated,
            options | SecureStoreOptions::GENERATE_INDEX_EVENT,
        )
        .await;
        let mut outbound = updated;
        outbound.strip_internal();
        Ok(Some(outbound))
    }

    /// Soft- or permanent-delete, by option: `KEEP_DELETES` writes the
    /// soft-delete marker and preserves snapshots, otherwise the key and all
    /// its snapshots are removed. With `GENERATE_INDEX_EVENT` set, a change
    /// event carrying the delete marker goes to the index queue so indexers
    /// drop the record.
    pub async fn delete(
        &self,
        location: &StoreLocation,
        id: Option<u64>,
        options: SecureStoreOptions,
    ) -> Result<(), StoreError> {
        if options.contains(SecureStoreOptions::KEEP_DELETES) {
            self.store.soft_delete(location).await?;
            info!("soft-deleted {}", location);
        } else {
            self.store.permanent_delete(location).await?;
            info!("permanently deleted {}", location);
        }
        if options.contains(SecureStoreOptions::GENERATE_INDEX_EVENT)
            || options.contains(SecureStoreOptions::BACKUP)
        {
            let mut marker = Metadata::new();
            marker.mark_deleted(now_ticks());
            self.emit_change_events(location, id, &marker, options).await;
        }
        Ok(())
    }

    /// Exact-key versions, newest first, with internal metadata keys
    /// scrubbed.
    pub async fn find_snapshots(
        &self,
        location: &StoreLocation,
    ) -> Result<Vec<Snapshot>, StoreError> {
        let mut snapshots = self.store.find_snapshots(location).await?;
        for snapshot in &mut snapshots {
            snapshot.metadata.strip_internal();
        }
        Ok(snapshots)
    }

    /// Live records under a prefix. Soft-deleted records are filtered here
    /// regardless of what the adapter includes.
    pub async fn find_files(
        &self,
        container: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<(StoreLocation, Metadata)>, StoreError> {
        let files = self.store.find_files(container, prefix).await?;
        Ok(files
            .into_iter()
            .filter(|(_, metadata)| !metadata.is_deleted())
            .map(|(location, mut metadata)| {
                metadata.strip_internal();
                (location, metadata)
            })
            .collect())
    }

    /// Acquire the per-key lock, or `None` when another holder has it.
    pub async fn lock(&self, location: &StoreLocation) -> Result<Option<StoreLock>, StoreError> {
        self.store.lock(location).await
    }

    /// Walk the container and re-emit every live record into the index queue
    /// with the transient `Reindex` marker set. Returns the emitted count.
    pub async fn re_index_all(
        &self,
        container: &str,
        prefix: Option<&str>,
    ) -> Result<usize, StoreError> {
        self.emit_all(container, prefix, &self.index_queue).await
    }

    /// The symmetric walk against the backup queue.
    pub async fn backup_all(
        &self,
        container: &str,
        prefix: Option<&str>,
    ) -> Result<usize, StoreError> {
        let backup_queue = self
            .backup_queue
            .as_ref()
            .ok_or_else(|| StoreError::queue("backup", "no backup queue configured"))?
            .clone();
        self.emit_all(container, prefix, &backup_queue).await
    }

    async fn emit_all(
        &self,
        container: &str,
        prefix: Option<&str>,
        queue: &Arc<dyn Queue>,
    ) -> Result<usize, StoreError> {
        let files = self.find_files(container, prefix).await?;
        let mut emitted = 0;
        for (location, mut metadata) in files {
            metadata.set_reindex(true);
            let details = StoreDataDetails {
                container: location.container.clone(),
                base_path: location.base_path.clone(),
                id: record_id_from_path(&location.base_path),
                metadata,
            };
            let body = serde_json::to_string(&details)?;
            queue.send_message(body).await?;
            emitted += 1;
        }
        info!("re-emitted {} records from {}", emitted, container);
        Ok(emitted)
    }

    /// Shared write preparation: normalize metadata, count logical bytes,
    /// stack the pipeline and wrap everything into the adapter's writer.
    fn prepare_write(
        &self,
        user_metadata: Metadata,
        condition_etag: Option<String>,
        encryptor: Option<&Arc<dyn Encryptor>>,
        data: DataStream,
        options: SecureStoreOptions,
    ) -> (Metadata, DataWriter) {
        let mut effective = user_metadata.user_only();
        effective.set_modified(now_ticks());
        if let Some(etag) = condition_etag {
            effective.set_etag(etag);
        }

        let compress =
            options.contains(SecureStoreOptions::COMPRESS) && self.store.can_compress();
        if compress {
            effective.insert(keys::COMPRESSED, "true");
        }

        let counter = Arc::new(AtomicU64::new(0));
        let counted = pipeline::counted(data, Arc::clone(&counter));
        let stored = pipeline::apply_write_pipeline(counted, compress, encryptor);

        let writer: DataWriter = Box::new(move |mut sink| {
            async move {
                let mut reader = StreamReader::new(stored);
                tokio::io::copy(&mut reader, &mut sink).await?;
                use tokio::io::AsyncWriteExt;
                sink.shutdown().await?;
                Ok(counter.load(Ordering::Relaxed))
            }
            .boxed()
        });

        (effective, writer)
    }

    /// Push change events after a successful write. Failures are logged and
    /// swallowed; the write has already committed.
    async fn emit_change_events(
        &self,
        location: &StoreLocation,
        id: Option<u64>,
        metadata: &Metadata,
        options: SecureStoreOptions,
    ) {
        let mut event_metadata = metadata.clone();
        event_metadata.strip_internal();
        let details = StoreDataDetails {
            container: location.container.clone(),
            base_path: location.base_path.clone(),
            id,
            metadata: event_metadata,
        };
        let body = match serde_json::to_string(&details) {
            Ok(body) => body,
            Err(e) => {
                error!("failed to serialize change event for {}: {}", location, e);
                return;
            }
        };

        if options.contains(SecureStoreOptions::GENERATE_INDEX_EVENT) {
            if let Err(e) = self.index_queue.send_message(body.clone()).await {
                warn!("index event for {} not delivered: {}", location, e);
            }
        }
        if options.contains(SecureStoreOptions::BACKUP) {
            match &self.backup_queue {
                Some(queue) => {
                    if let Err(e) = queue.send_message(body).await {
                        warn!("backup event for {} not delivered: {}", location, e);
                    }
                }
                None => warn!("backup requested for {} but no backup queue", location),
            }
        }
    }
}

/// Numeric record id encoded in the final path segment, if any. Record
/// partitions store ids as zero-padded decimal segments.
fn record_id_from_path(base_path: &str) -> Option<u64> {
    let last = base_path
        .rsplit(['/', '\\'])
        .find(|segment| !segment.is_empty())?;
    if last.is_empty() || !last.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    last.parse().ok()
}
