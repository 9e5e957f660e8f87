//! In-process store with full versioning semantics.
//!
//! Keeps every version of every key, models etags, leases and soft-delete
//! markers, and checks optimistic conditions under one lock so concurrent
//! create-only writes race exactly like they do against a real backend.
//! Every integration and property test runs against this store.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use super::{
    finish_writer, spawn_writer, DataStream, DataWithMetadata, DataWriter, ObjectStore,
    OptimisticResult, Snapshot, StoreLock, WriteCondition,
};
use crate::error::StoreError;
use crate::location::StoreLocation;
use crate::metadata::{keys, now_ticks, Metadata};

const LEASE_DURATION: Duration = Duration::from_secs(60);
const LEASE_RENEW_EVERY: Duration = Duration::from_secs(20);

#[derive(Clone)]
struct VersionRecord {
    version_id: String,
    etag: String,
    modified: i64,
    metadata: Metadata,
    data: Bytes,
}

#[derive(Default)]
struct StoreInner {
    /// container -> base_path -> versions, oldest first; last is current.
    containers: HashMap<String, HashMap<String, Vec<VersionRecord>>>,
}

struct Lease {
    id: String,
    expires_at: Instant,
}

/// In-memory [`ObjectStore`].
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<StoreInner>>,
    leases: Arc<Mutex<HashMap<StoreLocation, Lease>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    fn next_version(prior: Option<&VersionRecord>) -> (String, String, i64) {
        let version_id = Uuid::new_v4().simple().to_string();
        let etag = format!("\"0x{}\"", Uuid::new_v4().simple());
        let modified = match prior {
            Some(prev) => now_ticks().max(prev.modified + 1),
            None => now_ticks(),
        };
        (version_id, etag, modified)
    }

    /// Commit one new version under the lock, checking `condition` against
    /// the state at commit time.
    fn commit(
        &self,
        location: &StoreLocation,
        caller_metadata: Metadata,
        logical_length: u64,
        data: Bytes,
        condition: &WriteCondition,
    ) -> Result<Option<Metadata>, StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        let container = inner
            .containers
            .entry(location.container.clone())
            .or_default();
        let versions = container.entry(location.base_path.clone()).or_default();

        let condition_holds = match condition {
            WriteCondition::Unconditional => true,
            WriteCondition::IfNotExists => versions.last().is_none(),
            WriteCondition::IfMatch(expected) => versions
                .last()
                .map(|record| &record.etag == expected)
                .unwrap_or(false),
        };
        if !condition_holds {
            return Ok(None);
        }

        let (version_id, etag, modified) = Self::next_version(versions.last());
        let mut metadata = caller_metadata.without_computed();
        metadata.set_content_length(logical_length);
        metadata.set_modified(modified);
        metadata.set_snapshot(version_id.clone());
        metadata.set_etag(etag.clone());

        versions.push(VersionRecord {
            version_id,
            etag,
            modified,
            metadata: metadata.clone(),
            data,
        });
        Ok(Some(metadata))
    }

    fn find_record(
        &self,
        location: &StoreLocation,
        snapshot: Option<&str>,
    ) -> Option<VersionRecord> {
        let inner = self.inner.lock().expect("store lock");
        let versions = inner
            .containers
            .get(&location.container)?
            .get(&location.base_path)?;
        match snapshot {
            Some(id) => versions.iter().find(|v| v.version_id == id).cloned(),
            None => versions.last().cloned(),
        }
    }

    /// Drain the writer callback fully before touching shared state, so a
    /// failing writer leaves nothing observable.
    async fn stage(writer: DataWriter) -> Result<(u64, Bytes), StoreError> {
        let (handle, mut rx) = spawn_writer(writer);
        let mut staged = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut rx, &mut staged).await?;
        let logical = finish_writer(handle).await?;
        Ok((logical, Bytes::from(staged)))
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn can_compress(&self) -> bool {
        true
    }

    async fn create_container_if_not_exists(&self, container: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        inner.containers.entry(container.to_string()).or_default();
        Ok(())
    }

    async fn save_data(
        &self,
        location: &StoreLocation,
        metadata: Metadata,
        writer: DataWriter,
    ) -> Result<Metadata, StoreError> {
        let (logical, data) = Self::stage(writer).await?;
        let committed = self.commit(
            location,
            metadata,
            logical,
            data,
            &WriteCondition::Unconditional,
        )?;
        Ok(committed.expect("unconditional commit"))
    }

    async fn try_optimistic_write(
        &self,
        location: &StoreLocation,
        metadata: Metadata,
        writer: DataWriter,
    ) -> Result<OptimisticResult, StoreError> {
        let condition = WriteCondition::from_metadata(&metadata);
        let (logical, data) = Self::stage(writer).await?;
        match self.commit(location, metadata, logical, data, &condition)? {
            Some(committed) => Ok(OptimisticResult::committed(committed)),
            None => Ok(OptimisticResult::precondition_failed()),
        }
    }

    async fn get_metadata(
        &self,
        location: &StoreLocation,
        snapshot: Option<&str>,
    ) -> Result<Option<Metadata>, StoreError> {
        Ok(self.find_record(location, snapshot).map(|r| r.metadata))
    }

    async fn load_data(
        &self,
        location: &StoreLocation,
        snapshot: Option<&str>,
    ) -> Result<Option<DataWithMetadata>, StoreError> {
        let record = match self.find_record(location, snapshot) {
            Some(record) => record,
            None => return Ok(None),
        };
        if snapshot.is_none() && record.metadata.is_deleted() {
            return Ok(None);
        }
        let stream: DataStream = super::data_stream_from(record.data);
        Ok(Some(DataWithMetadata {
            stream,
            metadata: record.metadata,
        }))
    }

    async fn find_snapshots(&self, location: &StoreLocation) -> Result<Vec<Snapshot>, StoreError> {
        let inner = self.inner.lock().expect("store lock");
        let versions = inner
            .containers
            .get(&location.container)
            .and_then(|c| c.get(&location.base_path));
        let mut snapshots: Vec<Snapshot> = versions
            .map(|vs| {
                vs.iter()
                    .map(|v| Snapshot {
                        id: v.version_id.clone(),
                        modified: v.modified,
                        metadata: v.metadata.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        snapshots.sort_by(|a, b| b.modified.cmp(&a.modified));
        Ok(snapshots)
    }

    async fn find_files(
        &self,
        container: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<(StoreLocation, Metadata)>, StoreError> {
        let inner = self.inner.lock().expect("store lock");
        let mut out = Vec::new();
        if let Some(blobs) = inner.containers.get(container) {
            for (base_path, versions) in blobs {
                if let Some(prefix) = prefix {
                    if !base_path.starts_with(prefix) {
                        continue;
                    }
                }
                if let Some(current) = versions.last() {
                    out.push((
                        StoreLocation::new(container, base_path.clone()),
                        current.metadata.clone(),
                    ));
                }
            }
        }
        out.sort_by(|a, b| a.0.base_path.cmp(&b.0.base_path));
        Ok(out)
    }

    async fn soft_delete(&self, location: &StoreLocation) -> Result<(), StoreError> {
        let prior = match self.find_record(location, None) {
            Some(record) => record,
            None => return Ok(()),
        };
        let mut metadata = prior.metadata.user_only();
        metadata.mark_deleted(now_ticks());
        self.commit(location, metadata, 0, Bytes::new(), &WriteCondition::Unconditional)?;
        Ok(())
    }

    async fn permanent_delete(&self, location: &StoreLocation) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        if let Some(blobs) = inner.containers.get_mut(&location.container) {
            blobs.remove(&location.base_path);
        }
        Ok(())
    }

    async fn save_metadata(
        &self,
        location: &StoreLocation,
        metadata: Metadata,
    ) -> Result<Option<Metadata>, StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        let versions = inner
            .containers
            .get_mut(&location.container)
            .and_then(|c| c.get_mut(&location.base_path));
        let versions = match versions {
            Some(versions) if !versions.is_empty() => versions,
            _ => return Ok(None),
        };

        // Re-put of the current content under the new metadata: the prior
        // version keeps the metadata captured at its creation.
        let current = versions.last().expect("checked non-empty");
        let data = current.data.clone();
        let content_length = current.metadata.content_length().unwrap_or(0);
        let compressed = current.metadata.get(keys::COMPRESSED).map(str::to_string);
        let (version_id, etag, modified) = Self::next_version(Some(current));

        let mut updated = metadata.user_only();
        // The stored bytes do not change, so the pipeline markers must not
        // change either.
        if let Some(flag) = compressed {
            updated.insert(keys::COMPRESSED, flag);
        }
        updated.set_content_length(content_length);
        updated.set_modified(modified);
        updated.set_snapshot(version_id.clone());
        updated.set_etag(etag.clone());

        versions.push(VersionRecord {
            version_id,
            etag,
            modified,
            metadata: updated.clone(),
            data,
        });
        Ok(Some(updated))
    }

    async fn lock(&self, location: &StoreLocation) -> Result<Option<StoreLock>, StoreError> {
        let lease_id = Uuid::new_v4().simple().to_string();
        {
            let mut leases = self.leases.lock().expect("lease lock");
            let now = Instant::now();
            match leases.get(location) {
                Some(lease) if lease.expires_at > now => return Ok(None),
                _ => {}
            }
            leases.insert(
                location.clone(),
                Lease {
                    id: lease_id.clone(),
                    expires_at: now + LEASE_DURATION,
                },
            );
        }

        let renew_leases = Arc::clone(&self.leases);
        let renew_loc = location.clone();
        let renew_id = lease_id.clone();
        let renew_task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(LEASE_RENEW_EVERY).await;
                let mut leases = renew_leases.lock().expect("lease lock");
                match leases.get_mut(&renew_loc) {
                    Some(lease) if lease.id == renew_id => {
                        lease.expires_at = Instant::now() + LEASE_DURATION;
                    }
                    _ => break,
                }
            }
        });

        let release_leases = Arc::clone(&self.leases);
        let release_loc = location.clone();
        let release = Box::pin(async move {
            let mut leases = release_leases.lock().expect("lease lock");
            if let Some(lease) = leases.get(&release_loc) {
                if lease.id == lease_id {
                    leases.remove(&release_loc);
                }
            }
        });

        Ok(Some(StoreLock::new(location.clone(), renew_task, release)))
    }
}
