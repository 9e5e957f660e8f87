//! Partition façades.
//!
//! Thin sugar mapping application-level `(partition id, path)` or
//! `(partition id, record id)` addressing onto secure-store locations. A
//! partition carries its retention options and a lazily resolved encryptor;
//! everything else relays straight to [`SecureStore`].

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::OnceCell;

use crate::error::StoreError;
use crate::location::StoreLocation;
use crate::metadata::Metadata;
use crate::options::SecureStoreOptions;
use crate::pipeline::Encryptor;
use crate::secure_store::SecureStore;
use crate::store::{DataStream, DataWithMetadata, OptimisticResult, Snapshot, StoreLock};

/// Resolves the partition's encryptor on first use. `None` means the
/// partition stores plaintext.
pub type EncryptorFactory =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Option<Arc<dyn Encryptor>>, StoreError>> + Send + Sync>;

/// Per-partition item settings.
#[derive(Clone, Default)]
pub struct ItemConfiguration {
    /// Prefix prepended to every path inside the partition's container.
    pub base_path: Option<String>,
    /// Compress payloads before encryption.
    pub compress: bool,
    /// Mirror change events into the backup queue.
    pub backup: bool,
    /// Deletes keep snapshots behind a soft-delete marker instead of
    /// removing the key.
    pub keep_deletes: bool,
}

impl ItemConfiguration {
    fn save_options(&self) -> SecureStoreOptions {
        let mut options = SecureStoreOptions::GENERATE_INDEX_EVENT;
        if self.compress {
            options |= SecureStoreOptions::COMPRESS;
        }
        if self.backup {
            options |= SecureStoreOptions::BACKUP;
        }
        options
    }

    fn delete_options(&self) -> SecureStoreOptions {
        let mut options = SecureStoreOptions::GENERATE_INDEX_EVENT;
        if self.keep_deletes {
            options |= SecureStoreOptions::KEEP_DELETES;
        }
        if self.backup {
            options |= SecureStoreOptions::BACKUP;
        }
        options
    }
}

/// Shared plumbing for both partition flavors.
struct PartitionInner {
    store: SecureStore,
    container: String,
    config: ItemConfiguration,
    encryptor_factory: Option<EncryptorFactory>,
    encryptor: OnceCell<Option<Arc<dyn Encryptor>>>,
}

impl PartitionInner {
    fn location(&self, path: &str) -> StoreLocation {
        let base_path = match &self.config.base_path {
            Some(prefix) => format!("{}/{}", prefix.trim_end_matches('/'), path),
            None => path.to_string(),
        };
        StoreLocation::new(self.container.clone(), base_path)
    }

    async fn encryptor(&self) -> Result<Option<Arc<dyn Encryptor>>, StoreError> {
        let resolved = self
            .encryptor
            .get_or_try_init(|| async {
                match &self.encryptor_factory {
                    Some(factory) => factory().await,
                    None => Ok(None),
                }
            })
            .await?;
        Ok(resolved.clone())
    }
}

/// Partition addressed by string paths.
pub struct DocumentPartition {
    inner: PartitionInner,
}

impl DocumentPartition {
    pub fn new(
        store: SecureStore,
        partition_id: impl ToString,
        config: ItemConfiguration,
        encryptor_factory: Option<EncryptorFactory>,
    ) -> Self {
        DocumentPartition {
            inner: PartitionInner {
                store,
                container: partition_id.to_string(),
                config,
                encryptor_factory,
                encryptor: OnceCell::new(),
            },
        }
    }

    pub async fn save(
        &self,
        path: &str,
        metadata: Metadata,
        data: DataStream,
    ) -> Result<Metadata, StoreError> {
        let encryptor = self.inner.encryptor().await?;
        self.inner
            .store
            .save_data(
                &self.inner.location(path),
                metadata,
                None,
                encryptor.as_ref(),
                data,
                self.inner.config.save_options(),
            )
            .await
    }

    pub async fn try_optimistic_save(
        &self,
        path: &str,
        metadata: Metadata,
        data: DataStream,
    ) -> Result<OptimisticResult, StoreError> {
        let encryptor = self.inner.encryptor().await?;
        self.inner
            .store
            .try_optimistic_write(
                &self.inner.location(path),
                metadata,
                None,
                encryptor.as_ref(),
                data,
                self.inner.config.save_options(),
            )
            .await
    }

    pub async fn load(
        &self,
        path: &str,
        snapshot: Option<&str>,
    ) -> Result<Option<DataWithMetadata>, StoreError> {
        let encryptor = self.inner.encryptor().await?;
        self.inner
            .store
            .load_data(&self.inner.location(path), snapshot, encryptor.as_ref())
            .await
    }

    pub async fn get_metadata(
        &self,
        path: &str,
        snapshot: Option<&str>,
    ) -> Result<Option<Metadata>, StoreError> {
        self.inner
            .store
            .get_metadata(&self.inner.location(path), snapshot)
            .await
    }

    pub async fn save_metadata(
        &self,
        path: &str,
        metadata: Metadata,
    ) -> Result<Option<Metadata>, StoreError> {
        self.inner
            .store
            .save_metadata(
                &self.inner.location(path),
                metadata,
                None,
                self.inner.config.save_options(),
            )
            .await
    }

    pub async fn delete(&self, path: &str) -> Result<(), StoreError> {
        self.inner
            .store
            .delete(
                &self.inner.location(path),
                None,
                self.inner.config.delete_options(),
            )
            .await
    }

    pub async fn find_snapshots(&self, path: &str) -> Result<Vec<Snapshot>, StoreError> {
        self.inner
            .store
            .find_snapshots(&self.inner.location(path))
            .await
    }

    /// Acquire the per-key lock, failing with `StoreError::Lock` when a
    /// competing holder has it. Callers that can proceed without the lock
    /// use [`SecureStore::lock`] directly.
    pub async fn lock(&self, path: &str) -> Result<StoreLock, StoreError> {
        let location = self.inner.location(path);
        match self.inner.store.lock(&location).await? {
            Some(lock) => Ok(lock),
            None => Err(StoreError::Lock(location.to_string())),
        }
    }

    /// Re-emit every live record of this partition into the index queue.
    pub async fn re_index_all(&self) -> Result<usize, StoreError> {
        self.inner
            .store
            .re_index_all(&self.inner.container, self.inner.config.base_path.as_deref())
            .await
    }
}

/// Partition addressed by numeric record ids, encoded as zero-padded
/// 20-digit path segments so lexicographic listing follows id order.
pub struct RecordPartition {
    inner: PartitionInner,
}

impl RecordPartition {
    pub fn new(
        store: SecureStore,
        partition_id: impl ToString,
        config: ItemConfiguration,
        encryptor_factory: Option<EncryptorFactory>,
    ) -> Self {
        RecordPartition {
            inner: PartitionInner {
                store,
                container: partition_id.to_string(),
                config,
                encryptor_factory,
                encryptor: OnceCell::new(),
            },
        }
    }

    fn path_for(id: u64) -> String {
        format!("{id:020}")
    }

    pub async fn save(
        &self,
        id: u64,
        metadata: Metadata,
        data: DataStream,
    ) -> Result<Metadata, StoreError> {
        let encryptor = self.inner.encryptor().await?;
        self.inner
            .store
            .save_data(
                &self.inner.location(&Self::path_for(id)),
                metadata,
                Some(id),
                encryptor.as_ref(),
                data,
                self.inner.config.save_options(),
            )
            .await
    }

    pub async fn try_optimistic_save(
        &self,
        id: u64,
        metadata: Metadata,
        data: DataStream,
    ) -> Result<OptimisticResult, StoreError> {
        let encryptor = self.inner.encryptor().await?;
        self.inner
            .store
            .try_optimistic_write(
                &self.inner.location(&Self::path_for(id)),
                metadata,
                Some(id),
                encryptor.as_ref(),
                data,
                self.inner.config.save_options(),
            )
            .await
    }

    pub async fn load(
        &self,
        id: u64,
        snapshot: Option<&str>,
    ) -> Result<Option<DataWithMetadata>, StoreError> {
        let encryptor = self.inner.encryptor().await?;
        self.inner
            .store
            .load_data(
                &self.inner.location(&Self::path_for(id)),
                snapshot,
                encryptor.as_ref(),
            )
            .await
    }

    pub async fn get_metadata(
        &self,
        id: u64,
        snapshot: Option<&str>,
    ) -> Result<Option<Metadata>, StoreError> {
        self.inner
            .store
            .get_metadata(&self.inner.location(&Self::path_for(id)), snapshot)
            .await
    }

    pub async fn save_metadata(
        &self,
        id: u64,
        metadata: Metadata,
    ) -> Result<Option<Metadata>, StoreError> {
        self.inner
            .store
            .save_metadata(
                &self.inner.location(&Self::path_for(id)),
                metadata,
                Some(id),
                self.inner.config.save_options(),
            )
            .await
    }

    pub async fn delete(&self, id: u64) -> Result<(), StoreError> {
        self.inner
            .store
            .delete(
                &self.inner.location(&Self::path_for(id)),
                Some(id),
                self.inner.config.delete_options(),
            )
            .await
    }

    pub async fn find_snapshots(&self, id: u64) -> Result<Vec<Snapshot>, StoreError> {
        self.inner
            .store
            .find_snapshots(&self.inner.location(&Self::path_for(id)))
            .await
    }

    pub async fn lock(&self, id: u64) -> Result<StoreLock, StoreError> {
        let location = self.inner.location(&Self::path_for(id));
        match self.inner.store.lock(&location).await? {
            Some(lock) => Ok(lock),
            None => Err(StoreError::Lock(location.to_string())),
        }
    }

    pub async fn re_index_all(&self) -> Result<usize, StoreError> {
        self.inner
            .store
            .re_index_all(&self.inner.container, self.inner.config.base_path.as_deref())
            .await
    }
}
