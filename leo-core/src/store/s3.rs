//! List-versions backend over S3.
//!
//! Requires a bucket with versioning enabled. Containers map to top-level
//! key prefixes inside the bucket, snapshots are object versions enumerated
//! with `ListObjectVersions` (filtered to the exact key), and optimistic
//! writes use S3 conditional puts (`If-Match` / `If-None-Match: *`).
//!
//! S3 has no native lease; the lock is a small lock object written
//! create-only and carrying its own expiry stamp, renewed by rewriting it
//! `If-Match` and stealable once the stamp lapses.
//!
//! Unlike the native-versioning backend this one writes no store-version
//! marker; consumers must not depend on its presence.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::complete_multipart_upload::builders::CompleteMultipartUploadFluentBuilder;
use aws_sdk_s3::operation::put_object::builders::PutObjectFluentBuilder;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, MetadataDirective};
use aws_sdk_s3::Client;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    finish_writer, percent_encode_path, spawn_writer, stage_payload, ChunkedReader, DataStream,
    DataWithMetadata, DataWriter, ObjectStore, OptimisticResult, Snapshot, StoreLock,
    WriteCondition,
};
use crate::error::StoreError;
use crate::location::StoreLocation;
use crate::metadata::{canonicalize_key, keys, now_ticks, Metadata};
use crate::retry::retry_once_if;

/// Uploads larger than this go through the multipart path.
const MULTIPART_THRESHOLD: usize = 8 * 1024 * 1024;
const MULTIPART_CHUNK: usize = 8 * 1024 * 1024;

const LOCK_SUFFIX: &str = ".leo-lock";
const LOCK_DURATION_MS: i64 = 60_000;
const LOCK_RENEW_EVERY: Duration = Duration::from_secs(20);

/// S3 connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3StoreConfig {
    pub bucket: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub endpoint: Option<String>,
}

impl S3StoreConfig {
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.bucket.trim().is_empty() {
            return Err(StoreError::storage("s3", "bucket name cannot be empty"));
        }
        if self.region.trim().is_empty() {
            return Err(StoreError::storage("s3", "region cannot be empty"));
        }
        if self.access_key.trim().is_empty() || self.secret_key.trim().is_empty() {
            return Err(StoreError::storage("s3", "credentials cannot be empty"));
        }
        Ok(())
    }
}

/// Contents of a lock object.
#[derive(Debug, Serialize, Deserialize)]
struct LockDocument {
    lease_id: String,
    expires_at: i64,
}

pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    /// Build a client for an existing, versioning-enabled bucket.
    pub async fn new(config: S3StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;
        let credentials = Credentials::new(
            config.access_key,
            config.secret_key,
            None,
            None,
            "leo-s3-store",
        );
        let mut builder = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region))
            .credentials_provider(credentials);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint.trim_end_matches('/'));
        }
        let aws_config = builder.load().await;
        let s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
            .force_path_style(true)
            .build();
        info!("created S3 store client for bucket {}", config.bucket);
        Ok(S3Store {
            client: Client::from_conf(s3_config),
            bucket: config.bucket,
        })
    }

    fn key_for(location: &StoreLocation) -> String {
        format!("{}/{}", location.container, location.base_path)
    }

    fn storage_err(key: &str, err: impl std::fmt::Display) -> StoreError {
        StoreError::Storage {
            path: key.to_string(),
            message: err.to_string(),
        }
    }

    /// Post-write metadata: caller metadata with the computed keys refreshed.
    fn finalize_metadata(caller: &Metadata, logical_length: u64) -> Metadata {
        let mut metadata = caller.without_computed();
        metadata.set_content_length(logical_length);
        metadata.set_modified(caller.modified().unwrap_or_else(now_ticks));
        metadata
    }

    fn to_user_map(metadata: &Metadata) -> HashMap<String, String> {
        metadata
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn metadata_from_parts(
        user: Option<&HashMap<String, String>>,
        e_tag: Option<&str>,
        version_id: Option<&str>,
        last_modified_ms: Option<i64>,
    ) -> Metadata {
        let mut metadata = Metadata::new();
        if let Some(user) = user {
            for (key, value) in user {
                metadata.insert(canonicalize_key(key), value.clone());
            }
        }
        if metadata.modified().is_none() {
            if let Some(ms) = last_modified_ms {
                metadata.set_modified(ms);
            }
        }
        if let Some(e_tag) = e_tag {
            metadata.set_etag(e_tag);
        }
        if let Some(version_id) = version_id {
            metadata.set_snapshot(version_id);
        }
        metadata
    }

    fn apply_put_condition(
        req: PutObjectFluentBuilder,
        condition: &WriteCondition,
    ) -> PutObjectFluentBuilder {
        match condition {
            WriteCondition::Unconditional => req,
            WriteCondition::IfNotExists => req.if_none_match("*"),
            WriteCondition::IfMatch(etag) => req.if_match(etag.clone()),
        }
    }

    fn apply_complete_condition(
        req: CompleteMultipartUploadFluentBuilder,
        condition: &WriteCondition,
    ) -> CompleteMultipartUploadFluentBuilder {
        match condition {
            WriteCondition::Unconditional => req,
            WriteCondition::IfNotExists => req.if_none_match("*"),
            WriteCondition::IfMatch(etag) => req.if_match(etag.clone()),
        }
    }

    /// Upload and commit a new version, honoring `condition`. `Ok(None)`
    /// means the precondition failed and nothing was written.
    async fn write_object(
        &self,
        location: &StoreLocation,
        caller_metadata: Metadata,
        writer: DataWriter,
        condition: WriteCondition,
    ) -> Result<Option<Metadata>, StoreError> {
        let key = Self::key_for(location);
        let (handle, mut rx) = spawn_writer(writer);
        match stage_payload(&mut rx, MULTIPART_THRESHOLD).await? {
            Ok(whole) => {
                let logical = finish_writer(handle).await?;
                self.put_whole(&key, &caller_metadata, logical, whole, &condition)
                    .await
            }
            Err(staged) => {
                self.put_multipart(&key, &caller_metadata, staged.head, rx, handle, &condition)
                    .await
            }
        }
    }

    async fn put_whole(
        &self,
        key: &str,
        caller_metadata: &Metadata,
        logical_length: u64,
        body: Bytes,
        condition: &WriteCondition,
    ) -> Result<Option<Metadata>, StoreError> {
        let mut metadata = Self::finalize_metadata(caller_metadata, logical_length);
        let user_map = Self::to_user_map(&metadata);
        let result = retry_once_if("s3 put_object", is_transient, || {
            let mut req = self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .set_metadata(Some(user_map.clone()))
                .body(ByteStream::from(body.clone()));
            if let Some(content_type) = metadata.content_type() {
                req = req.content_type(content_type);
            }
            req = Self::apply_put_condition(req, condition);
            async move { req.send().await }
        })
        .await;

        match result {
            Ok(resp) => {
                if let Some(e_tag) = resp.e_tag() {
                    metadata.set_etag(e_tag);
                }
                if let Some(version_id) = resp.version_id() {
                    metadata.set_snapshot(version_id);
                }
                Ok(Some(metadata))
            }
            Err(e) if is_precondition(&e) => Ok(None),
            Err(e) => Err(Self::storage_err(key, e)),
        }
    }

    async fn put_multipart(
        &self,
        key: &str,
        caller_metadata: &Metadata,
        head: Bytes,
        rx: tokio::io::DuplexStream,
        handle: tokio::task::JoinHandle<std::io::Result<u64>>,
        condition: &WriteCondition,
    ) -> Result<Option<Metadata>, StoreError> {
        // ContentLength is unknown until the writer finishes, so the parts
        // upload under interim metadata and a same-key metadata-replace copy
        // stamps the final values afterwards.
        let interim = caller_metadata.without_computed();
        let interim_map = Self::to_user_map(&interim);
        let created = retry_once_if("s3 create_multipart_upload", is_transient, || {
            let mut req = self
                .client
                .create_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .set_metadata(Some(interim_map.clone()));
            if let Some(content_type) = interim.content_type() {
                req = req.content_type(content_type);
            }
            async move { req.send().await }
        })
        .await
        .map_err(|e| Self::storage_err(key, e))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| Self::storage_err(key, "multipart upload id missing"))?
            .to_string();

        let outcome = self
            .upload_parts_and_complete(key, &upload_id, head, rx, handle, condition)
            .await;
        let (logical, interim_version) = match outcome {
            Ok(Some(done)) => done,
            Ok(None) => {
                self.abort_multipart(key, &upload_id).await;
                return Ok(None);
            }
            Err(e) => {
                self.abort_multipart(key, &upload_id).await;
                return Err(e);
            }
        };

        // Stamp the final metadata, then drop the interim version so one
        // save leaves exactly one snapshot behind.
        let mut metadata = Self::finalize_metadata(caller_metadata, logical);
        let final_map = Self::to_user_map(&metadata);
        let copy_source = format!("{}/{}", self.bucket, percent_encode_path(key));
        let copied = retry_once_if("s3 copy_object", is_transient, || {
            let mut req = self
                .client
                .copy_object()
                .bucket(&self.bucket)
                .key(key)
                .copy_source(&copy_source)
                .metadata_directive(MetadataDirective::Replace)
                .set_metadata(Some(final_map.clone()));
            if let Some(content_type) = metadata.content_type() {
                req = req.content_type(content_type);
            }
            async move { req.send().await }
        })
        .await
        .map_err(|e| Self::storage_err(key, e))?;

        if let Some(version_id) = copied.version_id() {
            metadata.set_snapshot(version_id);
        }
        if let Some(e_tag) = copied.copy_object_result().and_then(|r| r.e_tag()) {
            metadata.set_etag(e_tag);
        }
        if let Some(interim_version) = interim_version {
            let _ = self
                .client
                .delete_object()
                .bucket(&self.bucket)
                .key(key)
                .version_id(&interim_version)
                .send()
                .await;
        }
        Ok(Some(metadata))
    }

    /// Upload all parts and complete. `Ok(None)` is a precondition failure
    /// at commit time.
    async fn upload_parts_and_complete(
        &self,
        key: &str,
        upload_id: &str,
        head: Bytes,
        rx: tokio::io::DuplexStream,
        handle: tokio::task::JoinHandle<std::io::Result<u64>>,
        condition: &WriteCondition,
    ) -> Result<Option<(u64, Option<String>)>, StoreError> {
        let mut chunks = ChunkedReader::new(head, rx, MULTIPART_CHUNK);
        let mut parts: Vec<CompletedPart> = Vec::new();
        let mut part_number = 1i32;
        while let Some(chunk) = chunks.next_chunk().await? {
            let uploaded = retry_once_if("s3 upload_part", is_transient, || {
                let req = self
                    .client
                    .upload_part()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(upload_id)
                    .part_number(part_number)
                    .body(ByteStream::from(chunk.clone()));
                async move { req.send().await }
            })
            .await
            .map_err(|e| Self::storage_err(key, e))?;
            parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .set_e_tag(uploaded.e_tag().map(str::to_string))
                    .build(),
            );
            debug!("uploaded part {} for {}", part_number, key);
            part_number += 1;
        }

        // The writer has hit end of stream; surface its failure before
        // committing anything.
        let logical = finish_writer(handle).await?;

        let completed_parts = CompletedMultipartUpload::builder()
            .set_parts(Some(parts.clone()))
            .build();
        let result = retry_once_if("s3 complete_multipart_upload", is_transient, || {
            let req = self
                .client
                .complete_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .multipart_upload(completed_parts.clone());
            let req = Self::apply_complete_condition(req, condition);
            async move { req.send().await }
        })
        .await;

        match result {
            Ok(resp) => Ok(Some((logical, resp.version_id().map(str::to_string)))),
            Err(e) if is_precondition(&e) => Ok(None),
            Err(e) => Err(Self::storage_err(key, e)),
        }
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) {
        let result = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await;
        if let Err(e) = result {
            warn!("failed to abort multipart upload for {}: {}", key, e);
        }
    }

    async fn head(
        &self,
        key: &str,
        version_id: Option<&str>,
    ) -> Result<Option<Metadata>, StoreError> {
        let result = retry_once_if("s3 head_object", is_transient, || {
            let mut req = self.client.head_object().bucket(&self.bucket).key(key);
            if let Some(version_id) = version_id {
                req = req.version_id(version_id);
            }
            async move { req.send().await }
        })
        .await;
        match result {
            Ok(resp) => {
                let last_modified = resp.last_modified().and_then(|t| t.to_millis().ok());
                Ok(Some(Self::metadata_from_parts(
                    resp.metadata(),
                    resp.e_tag(),
                    version_id.or(resp.version_id()),
                    last_modified,
                )))
            }
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(Self::storage_err(key, e)),
        }
    }

    /// Every version of the exact key, including delete markers.
    async fn list_exact_versions(&self, key: &str) -> Result<Vec<(String, i64)>, StoreError> {
        let mut versions: Vec<(String, i64)> = Vec::new();
        let mut key_marker: Option<String> = None;
        let mut version_marker: Option<String> = None;
        loop {
            let resp = retry_once_if("s3 list_object_versions", is_transient, || {
                let mut req = self
                    .client
                    .list_object_versions()
                    .bucket(&self.bucket)
                    .prefix(key);
                if let Some(marker) = &key_marker {
                    req = req.key_marker(marker.clone());
                }
                if let Some(marker) = &version_marker {
                    req = req.version_id_marker(marker.clone());
                }
                async move { req.send().await }
            })
            .await
            .map_err(|e| Self::storage_err(key, e))?;

            for version in resp.versions() {
                if version.key() != Some(key) {
                    continue;
                }
                if let Some(version_id) = version.version_id() {
                    let modified = version
                        .last_modified()
                        .and_then(|t| t.to_millis().ok())
                        .unwrap_or(0);
                    versions.push((version_id.to_string(), modified));
                }
            }
            for marker in resp.delete_markers() {
                if marker.key() != Some(key) {
                    continue;
                }
                if let Some(version_id) = marker.version_id() {
                    versions.push((version_id.to_string(), 0));
                }
            }

            if resp.is_truncated() == Some(true) {
                key_marker = resp.next_key_marker().map(str::to_string);
                version_marker = resp.next_version_id_marker().map(str::to_string);
            } else {
                break;
            }
        }
        Ok(versions)
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    fn can_compress(&self) -> bool {
        true
    }

    /// Containers are key prefixes inside the bucket; nothing to create.
    async fn create_container_if_not_exists(&self, _container: &str) -> Result<(), StoreError> {
        Ok(())
    }

    async fn save_data(
        &self,
        location: &StoreLocation,
        metadata: Metadata,
        writer: DataWriter,
    ) -> Result<Metadata, StoreError> {
        let committed = self
            .write_object(location, metadata, writer, WriteCondition::Unconditional)
            .await?;
        Ok(committed.expect("unconditional write commits"))
    }

    async fn try_optimistic_write(
        &self,
        location: &StoreLocation,
        metadata: Metadata,
        writer: DataWriter,
    ) -> Result<OptimisticResult, StoreError> {
        let condition = WriteCondition::from_metadata(&metadata);
        match self.write_object(location, metadata, writer, condition).await? {
            Some(committed) => Ok(OptimisticResult::committed(committed)),
            None => Ok(OptimisticResult::precondition_failed()),
        }
    }

    async fn get_metadata(
        &self,
        location: &StoreLocation,
        snapshot: Option<&str>,
    ) -> Result<Option<Metadata>, StoreError> {
        self.head(&Self::key_for(location), snapshot).await
    }

    async fn load_data(
        &self,
        location: &StoreLocation,
        snapshot: Option<&str>,
    ) -> Result<Option<DataWithMetadata>, StoreError> {
        let key = Self::key_for(location);
        let result = retry_once_if("s3 get_object", is_transient, || {
            let mut req = self.client.get_object().bucket(&self.bucket).key(&key);
            if let Some(snapshot) = snapshot {
                req = req.version_id(snapshot);
            }
            async move { req.send().await }
        })
        .await;
        let resp = match result {
            Ok(resp) => resp,
            Err(e) if is_not_found(&e) => return Ok(None),
            Err(e) => return Err(Self::storage_err(&key, e)),
        };

        let last_modified = resp.last_modified().and_then(|t| t.to_millis().ok());
        let metadata = Self::metadata_from_parts(
            resp.metadata(),
            resp.e_tag(),
            snapshot.or(resp.version_id()),
            last_modified,
        );
        if snapshot.is_none() && metadata.is_deleted() {
            return Ok(None);
        }
        let stream: DataStream = Box::pin(ReaderStream::new(resp.body.into_async_read()));
        Ok(Some(DataWithMetadata { stream, metadata }))
    }

    async fn find_snapshots(&self, location: &StoreLocation) -> Result<Vec<Snapshot>, StoreError> {
        let key = Self::key_for(location);
        let mut snapshots = Vec::new();
        for (version_id, listed_modified) in self.list_exact_versions(&key).await? {
            let metadata = match self.head(&key, Some(&version_id)).await? {
                Some(metadata) => metadata,
                // Raced with a permanent delete; skip.
                None => continue,
            };
            let modified = metadata.modified().unwrap_or(listed_modified);
            snapshots.push(Snapshot {
                id: version_id,
                modified,
                metadata,
            });
        }
        snapshots.sort_by(|a, b| b.modified.cmp(&a.modified));
        Ok(snapshots)
    }

    async fn find_files(
        &self,
        container: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<(StoreLocation, Metadata)>, StoreError> {
        let list_prefix = format!("{}/{}", container, prefix.unwrap_or(""));
        let mut out = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let resp = retry_once_if("s3 list_objects_v2", is_transient, || {
                let mut req = self
                    .client
                    .list_objects_v2()
                    .bucket(&self.bucket)
                    .prefix(&list_prefix);
                if let Some(token) = &continuation {
                    req = req.continuation_token(token.clone());
                }
                async move { req.send().await }
            })
            .await
            .map_err(|e| Self::storage_err(&list_prefix, e))?;

            for object in resp.contents() {
                let key = match object.key() {
                    Some(key) => key,
                    None => continue,
                };
                if key.ends_with(LOCK_SUFFIX) {
                    continue;
                }
                let base_path = match key.strip_prefix(&format!("{container}/")) {
                    Some(base_path) => base_path.to_string(),
                    None => continue,
                };
                if let Some(metadata) = self.head(key, None).await? {
                    out.push((StoreLocation::new(container, base_path), metadata));
                }
            }

            if resp.is_truncated() == Some(true) {
                continuation = resp.next_continuation_token().map(str::to_string);
            } else {
                break;
            }
        }
        Ok(out)
    }

    async fn soft_delete(&self, location: &StoreLocation) -> Result<(), StoreError> {
        let key = Self::key_for(location);
        let current = match self.head(&key, None).await? {
            Some(current) => current,
            None => return Ok(()),
        };
        let mut marker = current.user_only();
        marker.mark_deleted(now_ticks());
        marker.set_modified(now_ticks());
        self.put_whole(&key, &marker, 0, Bytes::new(), &WriteCondition::Unconditional)
            .await?;
        Ok(())
    }

    async fn permanent_delete(&self, location: &StoreLocation) -> Result<(), StoreError> {
        let key = Self::key_for(location);
        for (version_id, _) in self.list_exact_versions(&key).await? {
            let result = self
                .client
                .delete_object()
                .bucket(&self.bucket)
                .key(&key)
                .version_id(&version_id)
                .send()
                .await;
            if let Err(e) = result {
                if !is_not_found(&e) {
                    return Err(Self::storage_err(&key, e));
                }
            }
        }
        Ok(())
    }

    async fn save_metadata(
        &self,
        location: &StoreLocation,
        metadata: Metadata,
    ) -> Result<Option<Metadata>, StoreError> {
        let key = Self::key_for(location);
        let current = match self.head(&key, None).await? {
            Some(current) => current,
            None => return Ok(None),
        };

        let mut updated = metadata.without_computed();
        updated.strip_internal();
        if let Some(flag) = current.get(keys::COMPRESSED) {
            updated.insert(keys::COMPRESSED, flag.to_string());
        }
        updated.set_content_length(current.content_length().unwrap_or(0));
        updated.set_modified(now_ticks());
        let user_map = Self::to_user_map(&updated);

        let copy_source = format!("{}/{}", self.bucket, percent_encode_path(&key));
        let copied = retry_once_if("s3 copy_object", is_transient, || {
            let mut req = self
                .client
                .copy_object()
                .bucket(&self.bucket)
                .key(&key)
                .copy_source(&copy_source)
                .metadata_directive(MetadataDirective::Replace)
                .set_metadata(Some(user_map.clone()));
            if let Some(content_type) = updated.content_type() {
                req = req.content_type(content_type);
            }
            async move { req.send().await }
        })
        .await
        .map_err(|e| Self::storage_err(&key, e))?;

        if let Some(version_id) = copied.version_id() {
            updated.set_snapshot(version_id);
        }
        if let Some(e_tag) = copied.copy_object_result().and_then(|r| r.e_tag()) {
            updated.set_etag(e_tag);
        }
        Ok(Some(updated))
    }

    async fn lock(&self, location: &StoreLocation) -> Result<Option<StoreLock>, StoreError> {
        let lock_key = format!("{}{}", Self::key_for(location), LOCK_SUFFIX);
        let lease_id = Uuid::new_v4().simple().to_string();

        let etag = match self.acquire_lock_object(&lock_key, &lease_id).await? {
            Some(etag) => etag,
            None => return Ok(None),
        };

        let shared_etag = Arc::new(Mutex::new(etag));
        let renew_client = self.client.clone();
        let renew_bucket = self.bucket.clone();
        let renew_key = lock_key.clone();
        let renew_lease = lease_id.clone();
        let renew_etag = Arc::clone(&shared_etag);
        let renew_task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(LOCK_RENEW_EVERY).await;
                let document = LockDocument {
                    lease_id: renew_lease.clone(),
                    expires_at: now_ticks() + LOCK_DURATION_MS,
                };
                let body = serde_json::to_vec(&document).expect("lock document");
                let current_etag = renew_etag.lock().expect("lock etag").clone();
                let result = renew_client
                    .put_object()
                    .bucket(&renew_bucket)
                    .key(&renew_key)
                    .if_match(current_etag)
                    .body(ByteStream::from(body))
                    .send()
                    .await;
                match result {
                    Ok(resp) => {
                        if let Some(new_etag) = resp.e_tag() {
                            *renew_etag.lock().expect("lock etag") = new_etag.to_string();
                        }
                    }
                    Err(e) => {
                        warn!("lost lock {}: {}", renew_key, e);
                        break;
                    }
                }
            }
        });

        let release_client = self.client.clone();
        let release_bucket = self.bucket.clone();
        let release_key = lock_key.clone();
        let release_lease = lease_id.clone();
        let release = Box::pin(async move {
            // Only remove the lock object if it is still ours.
            let current = release_client
                .get_object()
                .bucket(&release_bucket)
                .key(&release_key)
                .send()
                .await;
            let body = match current {
                Ok(resp) => resp.body.collect().await.ok().map(|b| b.into_bytes()),
                Err(_) => None,
            };
            let still_ours = body
                .as_deref()
                .and_then(|bytes| serde_json::from_slice::<LockDocument>(bytes).ok())
                .map(|doc| doc.lease_id == release_lease)
                .unwrap_or(false);
            if still_ours {
                let _ = release_client
                    .delete_object()
                    .bucket(&release_bucket)
                    .key(&release_key)
                    .send()
                    .await;
            }
        });

        Ok(Some(StoreLock::new(location.clone(), renew_task, release)))
    }
}

impl S3Store {
    /// Create-only put of the lock object, stealing an expired stamp with a
    /// conditional overwrite. Returns the lock object's etag when acquired.
    async fn acquire_lock_object(
        &self,
        lock_key: &str,
        lease_id: &str,
    ) -> Result<Option<String>, StoreError> {
        for _ in 0..2 {
            let document = LockDocument {
                lease_id: lease_id.to_string(),
                expires_at: now_ticks() + LOCK_DURATION_MS,
            };
            let body = serde_json::to_vec(&document)?;
            let created = self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(lock_key)
                .if_none_match("*")
                .body(ByteStream::from(body.clone()))
                .send()
                .await;
            match created {
                Ok(resp) => return Ok(resp.e_tag().map(str::to_string)),
                Err(e) if is_precondition(&e) => {}
                Err(e) => return Err(Self::storage_err(lock_key, e)),
            }

            // Held by someone; steal only if their stamp expired.
            let existing = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(lock_key)
                .send()
                .await;
            let resp = match existing {
                Ok(resp) => resp,
                // Released between attempts; try the create-only path again.
                Err(e) if is_not_found(&e) => continue,
                Err(e) => return Err(Self::storage_err(lock_key, e)),
            };
            let existing_etag = resp.e_tag().map(str::to_string);
            let bytes = resp
                .body
                .collect()
                .await
                .map_err(|e| Self::storage_err(lock_key, e))?
                .into_bytes();
            let holder: Option<LockDocument> = serde_json::from_slice(&bytes).ok();
            let expired = holder.map(|doc| doc.expires_at < now_ticks()).unwrap_or(true);
            if !expired {
                return Ok(None);
            }
            let existing_etag = match existing_etag {
                Some(etag) => etag,
                None => return Ok(None),
            };
            let stolen = self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(lock_key)
                .if_match(existing_etag)
                .body(ByteStream::from(body))
                .send()
                .await;
            match stolen {
                Ok(resp) => return Ok(resp.e_tag().map(str::to_string)),
                Err(e) if is_precondition(&e) => return Ok(None),
                Err(e) => return Err(Self::storage_err(lock_key, e)),
            }
        }
        Ok(None)
    }
}

fn status_of<E>(err: &SdkError<E>) -> Option<u16> {
    match err {
        SdkError::ServiceError(ctx) => Some(ctx.raw().status().as_u16()),
        _ => None,
    }
}

fn is_not_found<E>(err: &SdkError<E>) -> bool {
    status_of(err) == Some(404)
}

fn is_precondition<E>(err: &SdkError<E>) -> bool {
    matches!(status_of(err), Some(412) | Some(409))
}

fn is_transient<E>(err: &SdkError<E>) -> bool {
    match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            true
        }
        SdkError::ServiceError(ctx) => {
            let status = ctx.raw().status().as_u16();
            status >= 500 || status == 429
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_join_container_and_path() {
        let loc = StoreLocation::new("7", "orders/2026/1.json");
        assert_eq!(S3Store::key_for(&loc), "7/orders/2026/1.json");
    }

    #[test]
    fn metadata_from_parts_restores_reserved_casing() {
        let mut user = HashMap::new();
        user.insert("contentlength".to_string(), "1024".to_string());
        user.insert("metadata1".to_string(), "somemetadata".to_string());
        let metadata = S3Store::metadata_from_parts(
            Some(&user),
            Some("\"abc\""),
            Some("v1"),
            Some(1_700_000_000_000),
        );
        assert_eq!(metadata.content_length(), Some(1024));
        assert_eq!(metadata.get("metadata1"), Some("somemetadata"));
        assert_eq!(metadata.etag(), Some("\"abc\""));
        assert_eq!(metadata.snapshot(), Some("v1"));
        assert_eq!(metadata.modified(), Some(1_700_000_000_000));
    }

    #[test]
    fn lock_document_roundtrips() {
        let doc = LockDocument {
            lease_id: "abc".to_string(),
            expires_at: 42,
        };
        let json = serde_json::to_string(&doc).unwrap();
        let back: LockDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(back.lease_id, "abc");
        assert_eq!(back.expires_at, 42);
    }

    #[test]
    fn config_validation_rejects_blanks() {
        let config = S3StoreConfig {
            bucket: "".to_string(),
            region: "us-east-1".to_string(),
            access_key: "k".to_string(),
            secret_key: "s".to_string(),
            endpoint: None,
        };
        assert!(config.validate().is_err());
    }
}
