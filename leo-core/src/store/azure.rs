//! Native-versioning backend over the Azure Blob Storage REST API.
//!
//! Azure gives the engine everything natively: blob snapshots for
//! versioning, etag conditions for optimistic writes, and blob leases for
//! the per-key lock. Every successful write commits the blob, takes a
//! snapshot of it, then stamps the snapshot id into the blob metadata, so
//! the current version always knows the snapshot that captured it. Payloads
//! above the block threshold go through staged blocks and a block-list
//! commit.
//!
//! This backend writes the adapter-private `leo-store-version="2.0"` marker
//! into blob metadata; it is stripped before metadata leaves the adapter.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
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

const API_VERSION: &str = "2021-08-06";
const STORE_VERSION_VALUE: &str = "2.0";

/// Payloads above this upload as staged blocks.
const BLOCK_THRESHOLD: usize = 4 * 1024 * 1024;
const BLOCK_SIZE: usize = 4 * 1024 * 1024;

const LOCK_SUFFIX: &str = ".leo-lock";
const LEASE_DURATION_SECS: u32 = 60;
const LEASE_RENEW_EVERY: Duration = Duration::from_secs(20);

const META_PREFIX: &str = "x-ms-meta-";

/// Azure connection settings. `endpoint` overrides the public cloud URL,
/// e.g. for an azurite emulator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AzureStoreConfig {
    pub account: String,
    /// Base64 shared key for the storage account.
    pub access_key: String,
    pub endpoint: Option<String>,
}

impl AzureStoreConfig {
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.account.trim().is_empty() {
            return Err(StoreError::storage("azure", "account cannot be empty"));
        }
        if BASE64.decode(&self.access_key).is_err() {
            return Err(StoreError::storage(
                "azure",
                "access key is not valid base64",
            ));
        }
        Ok(())
    }
}

pub struct AzureStore {
    http: reqwest::Client,
    account: String,
    key: Vec<u8>,
    endpoint: String,
}

struct AzureRequest<'a> {
    method: Method,
    container: &'a str,
    blob: Option<&'a str>,
    query: Vec<(String, String)>,
    ms_headers: Vec<(String, String)>,
    content_type: Option<String>,
    if_match: Option<String>,
    if_none_match: Option<String>,
    body: Option<Bytes>,
    label: &'static str,
}

impl<'a> AzureRequest<'a> {
    fn new(method: Method, container: &'a str, blob: Option<&'a str>, label: &'static str) -> Self {
        AzureRequest {
            method,
            container,
            blob,
            query: Vec::new(),
            ms_headers: Vec::new(),
            content_type: None,
            if_match: None,
            if_none_match: None,
            body: None,
            label,
        }
    }
}

impl AzureStore {
    pub fn new(config: AzureStoreConfig) -> Result<Self, StoreError> {
        config.validate()?;
        let key = BASE64
            .decode(&config.access_key)
            .map_err(|e| StoreError::storage("azure", e))?;
        let endpoint = config
            .endpoint
            .map(|e| e.trim_end_matches('/').to_string())
            .unwrap_or_else(|| format!("https://{}.blob.core.windows.net", config.account));
        info!("created Azure store client for account {}", config.account);
        Ok(AzureStore {
            http: reqwest::Client::new(),
            account: config.account,
            key,
            endpoint,
        })
    }

    /// Shared Key string-to-sign for the 2015-02-21+ wire format.
    fn string_to_sign(
        account: &str,
        method: &str,
        content_length: usize,
        content_type: &str,
        if_match: &str,
        if_none_match: &str,
        ms_headers: &[(String, String)],
        container: &str,
        blob: Option<&str>,
        query: &[(String, String)],
    ) -> String {
        let mut canonical_headers: Vec<(String, String)> = ms_headers
            .iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
            .collect();
        canonical_headers.sort();
        let canonical_headers: String = canonical_headers
            .iter()
            .map(|(name, value)| format!("{name}:{value}\n"))
            .collect();

        let mut canonical_resource = format!("/{account}/{container}");
        if let Some(blob) = blob {
            canonical_resource.push('/');
            canonical_resource.push_str(blob);
        }
        let mut sorted_query: Vec<(String, String)> = query
            .iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
            .collect();
        sorted_query.sort();
        for (name, value) in &sorted_query {
            canonical_resource.push_str(&format!("\n{name}:{value}"));
        }

        let length_field = if content_length == 0 {
            String::new()
        } else {
            content_length.to_string()
        };

        format!(
            "{method}\n\n\n{length_field}\n\n{content_type}\n\n\n{if_match}\n{if_none_match}\n\n\n{canonical_headers}{canonical_resource}"
        )
    }

    fn authorization(&self, string_to_sign: &str) -> String {
        let mut mac =
            Hmac::<Sha256>::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(string_to_sign.as_bytes());
        let signature = BASE64.encode(mac.finalize().into_bytes());
        format!("SharedKey {}:{}", self.account, signature)
    }

    fn build(&self, req: &AzureRequest<'_>) -> Result<reqwest::Request, StoreError> {
        let mut ms_headers = req.ms_headers.clone();
        ms_headers.push((
            "x-ms-date".to_string(),
            Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
        ));
        ms_headers.push(("x-ms-version".to_string(), API_VERSION.to_string()));

        let content_length = req.body.as_ref().map(|b| b.len()).unwrap_or(0);
        let string_to_sign = Self::string_to_sign(
            &self.account,
            req.method.as_str(),
            content_length,
            req.content_type.as_deref().unwrap_or(""),
            req.if_match.as_deref().unwrap_or(""),
            req.if_none_match.as_deref().unwrap_or(""),
            &ms_headers,
            req.container,
            req.blob,
            &req.query,
        );
        let authorization = self.authorization(&string_to_sign);

        let mut url = format!("{}/{}", self.endpoint, req.container);
        if let Some(blob) = req.blob {
            url.push('/');
            url.push_str(&percent_encode_path(blob));
        }

        let mut headers = HeaderMap::new();
        for (name, value) in &ms_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| StoreError::storage(req.container, e))?;
            let value =
                HeaderValue::from_str(value).map_err(|e| StoreError::storage(req.container, e))?;
            headers.insert(name, value);
        }
        headers.insert(
            reqwest::header::AUTHORIZATION,
            HeaderValue::from_str(&authorization)
                .map_err(|e| StoreError::storage(req.container, e))?,
        );
        if let Some(content_type) = &req.content_type {
            headers.insert(
                reqwest::header::CONTENT_TYPE,
                HeaderValue::from_str(content_type)
                    .map_err(|e| StoreError::storage(req.container, e))?,
            );
        }
        if let Some(if_match) = &req.if_match {
            headers.insert(
                reqwest::header::IF_MATCH,
                HeaderValue::from_str(if_match)
                    .map_err(|e| StoreError::storage(req.container, e))?,
            );
        }
        if let Some(if_none_match) = &req.if_none_match {
            headers.insert(
                reqwest::header::IF_NONE_MATCH,
                HeaderValue::from_str(if_none_match)
                    .map_err(|e| StoreError::storage(req.container, e))?,
            );
        }

        let mut builder = self
            .http
            .request(req.method.clone(), &url)
            .query(&req.query)
            .headers(headers);
        if let Some(body) = &req.body {
            builder = builder.body(body.clone());
        }
        builder
            .build()
            .map_err(|e| StoreError::storage(req.container, e))
    }

    /// Send with one retry on transport faults and transient statuses.
    async fn exec(&self, req: AzureRequest<'_>) -> Result<reqwest::Response, StoreError> {
        for attempt in 0..2u8 {
            let request = self.build(&req)?;
            match self.http.execute(request).await {
                Ok(resp) => {
                    if attempt == 0 && is_transient_status(resp.status()) {
                        warn!("{} got {}, retrying once", req.label, resp.status());
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(e) if attempt == 0 && (e.is_timeout() || e.is_connect()) => {
                    warn!("{} failed transiently, retrying once: {}", req.label, e);
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                Err(e) if e.is_timeout() || e.is_connect() => {
                    return Err(StoreError::Transient(format!("{}: {e}", req.label)));
                }
                Err(e) => {
                    return Err(StoreError::storage(req.container, e));
                }
            }
        }
        unreachable!("exec always returns within two attempts")
    }

    /// Map a non-success response to the engine error kinds.
    async fn fail(path: &str, resp: reqwest::Response) -> StoreError {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        let message = format!("{status}: {}", body.chars().take(200).collect::<String>());
        if is_transient_status(status) {
            StoreError::Transient(message)
        } else {
            StoreError::Storage {
                path: path.to_string(),
                message,
            }
        }
    }

    fn meta_headers(metadata: &Metadata) -> Vec<(String, String)> {
        metadata
            .iter()
            .map(|(key, value)| (format!("{META_PREFIX}{key}"), value.to_string()))
            .collect()
    }

    fn metadata_from_headers(headers: &HeaderMap) -> Metadata {
        let mut metadata = Metadata::new();
        for (name, value) in headers {
            if let Some(key) = name.as_str().strip_prefix(META_PREFIX) {
                if let Ok(value) = value.to_str() {
                    metadata.insert(canonicalize_key(key), value.to_string());
                }
            }
        }
        if metadata.modified().is_none() {
            if let Some(last_modified) = headers
                .get(reqwest::header::LAST_MODIFIED)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| chrono::DateTime::parse_from_rfc2822(v).ok())
            {
                metadata.set_modified(last_modified.timestamp_millis());
            }
        }
        if let Some(etag) = headers
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
        {
            metadata.set_etag(etag);
        }
        metadata
    }

    /// Post-write metadata: computed keys refreshed plus the store marker.
    fn finalize_metadata(caller: &Metadata, logical_length: u64) -> Metadata {
        let mut metadata = caller.without_computed();
        metadata.set_content_length(logical_length);
        metadata.set_modified(caller.modified().unwrap_or_else(now_ticks));
        metadata.insert(keys::STORE_VERSION, STORE_VERSION_VALUE);
        metadata
    }

    fn condition_headers(condition: &WriteCondition) -> (Option<String>, Option<String>) {
        match condition {
            WriteCondition::Unconditional => (None, None),
            WriteCondition::IfNotExists => (None, Some("*".to_string())),
            WriteCondition::IfMatch(etag) => (Some(etag.clone()), None),
        }
    }

    /// Commit `body` as the new current version: put, snapshot, then stamp
    /// the snapshot id into the blob metadata. `Ok(None)` means the
    /// precondition failed before anything was written.
    async fn commit_bytes(
        &self,
        location: &StoreLocation,
        mut metadata: Metadata,
        body: Bytes,
        condition: &WriteCondition,
    ) -> Result<Option<Metadata>, StoreError> {
        let (if_match, if_none_match) = Self::condition_headers(condition);
        let mut put = AzureRequest::new(
            Method::PUT,
            &location.container,
            Some(&location.base_path),
            "azure put_blob",
        );
        put.ms_headers = Self::meta_headers(&metadata);
        put.ms_headers
            .push(("x-ms-blob-type".to_string(), "BlockBlob".to_string()));
        if let Some(content_type) = metadata.content_type() {
            put.ms_headers.push((
                "x-ms-blob-content-type".to_string(),
                content_type.to_string(),
            ));
        }
        put.if_match = if_match;
        put.if_none_match = if_none_match;
        put.body = Some(body);

        let resp = self.exec(put).await?;
        match resp.status() {
            StatusCode::CREATED => {}
            StatusCode::PRECONDITION_FAILED | StatusCode::CONFLICT => return Ok(None),
            _ => return Err(Self::fail(&location.base_path, resp).await),
        }
        self.seal_version(location, &mut metadata).await?;
        metadata.remove(keys::STORE_VERSION);
        Ok(Some(metadata))
    }

    /// Snapshot the just-written blob and stamp the snapshot id into its
    /// metadata, so reads of the current version report the snapshot that
    /// captured it.
    async fn seal_version(
        &self,
        location: &StoreLocation,
        metadata: &mut Metadata,
    ) -> Result<(), StoreError> {
        let snapshot_id = self.snapshot_blob(location).await?;
        metadata.set_snapshot(snapshot_id);

        let mut set_meta = AzureRequest::new(
            Method::PUT,
            &location.container,
            Some(&location.base_path),
            "azure set_metadata",
        );
        set_meta.query.push(("comp".to_string(), "metadata".to_string()));
        set_meta.ms_headers = Self::meta_headers(metadata);
        let resp = self.exec(set_meta).await?;
        if resp.status() != StatusCode::OK {
            return Err(Self::fail(&location.base_path, resp).await);
        }
        if let Some(etag) = resp
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
        {
            metadata.set_etag(etag);
        }
        Ok(())
    }

    async fn snapshot_blob(&self, location: &StoreLocation) -> Result<String, StoreError> {
        let mut req = AzureRequest::new(
            Method::PUT,
            &location.container,
            Some(&location.base_path),
            "azure snapshot",
        );
        req.query.push(("comp".to_string(), "snapshot".to_string()));
        let resp = self.exec(req).await?;
        if resp.status() != StatusCode::CREATED {
            return Err(Self::fail(&location.base_path, resp).await);
        }
        resp.headers()
            .get("x-ms-snapshot")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| StoreError::storage(&location.base_path, "snapshot id missing"))
    }

    async fn write_blocks(
        &self,
        location: &StoreLocation,
        caller_metadata: &Metadata,
        head: Bytes,
        rx: tokio::io::DuplexStream,
        handle: tokio::task::JoinHandle<std::io::Result<u64>>,
        condition: &WriteCondition,
    ) -> Result<Option<Metadata>, StoreError> {
        let mut chunks = ChunkedReader::new(head, rx, BLOCK_SIZE);
        let mut block_ids: Vec<String> = Vec::new();
        while let Some(chunk) = chunks.next_chunk().await? {
            let block_id = BASE64.encode(format!("{:08}", block_ids.len()));
            let mut req = AzureRequest::new(
                Method::PUT,
                &location.container,
                Some(&location.base_path),
                "azure put_block",
            );
            req.query.push(("comp".to_string(), "block".to_string()));
            req.query.push(("blockid".to_string(), block_id.clone()));
            req.body = Some(chunk);
            let resp = self.exec(req).await?;
            if resp.status() != StatusCode::CREATED {
                return Err(Self::fail(&location.base_path, resp).await);
            }
            debug!("staged block {} for {}", block_ids.len(), location);
            block_ids.push(block_id);
        }

        // Uncommitted blocks are invisible and expire on their own, so a
        // failed writer leaves nothing observable.
        let logical = finish_writer(handle).await?;
        let mut metadata = Self::finalize_metadata(caller_metadata, logical);

        let mut block_list = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?><BlockList>");
        for block_id in &block_ids {
            block_list.push_str(&format!("<Latest>{block_id}</Latest>"));
        }
        block_list.push_str("</BlockList>");

        let (if_match, if_none_match) = Self::condition_headers(condition);
        let mut commit = AzureRequest::new(
            Method::PUT,
            &location.container,
            Some(&location.base_path),
            "azure put_block_list",
        );
        commit.query.push(("comp".to_string(), "blocklist".to_string()));
        commit.ms_headers = Self::meta_headers(&metadata);
        if let Some(content_type) = metadata.content_type() {
            commit.ms_headers.push((
                "x-ms-blob-content-type".to_string(),
                content_type.to_string(),
            ));
        }
        commit.if_match = if_match;
        commit.if_none_match = if_none_match;
        commit.content_type = Some("application/xml".to_string());
        commit.body = Some(Bytes::from(block_list));

        let resp = self.exec(commit).await?;
        match resp.status() {
            StatusCode::CREATED => {}
            StatusCode::PRECONDITION_FAILED | StatusCode::CONFLICT => return Ok(None),
            _ => return Err(Self::fail(&location.base_path, resp).await),
        }
        self.seal_version(location, &mut metadata).await?;
        metadata.remove(keys::STORE_VERSION);
        Ok(Some(metadata))
    }

    async fn write_blob(
        &self,
        location: &StoreLocation,
        caller_metadata: Metadata,
        writer: DataWriter,
        condition: WriteCondition,
    ) -> Result<Option<Metadata>, StoreError> {
        let (handle, mut rx) = spawn_writer(writer);
        match stage_payload(&mut rx, BLOCK_THRESHOLD).await? {
            Ok(whole) => {
                let logical = finish_writer(handle).await?;
                let metadata = Self::finalize_metadata(&caller_metadata, logical);
                self.commit_bytes(location, metadata, whole, &condition).await
            }
            Err(staged) => {
                self.write_blocks(location, &caller_metadata, staged.head, rx, handle, &condition)
                    .await
            }
        }
    }

    async fn head_blob(
        &self,
        location: &StoreLocation,
        snapshot: Option<&str>,
    ) -> Result<Option<Metadata>, StoreError> {
        let mut req = AzureRequest::new(
            Method::HEAD,
            &location.container,
            Some(&location.base_path),
            "azure head_blob",
        );
        if let Some(snapshot) = snapshot {
            req.query
                .push(("snapshot".to_string(), snapshot.to_string()));
        }
        let resp = self.exec(req).await?;
        match resp.status() {
            StatusCode::OK => {
                let mut metadata = Self::metadata_from_headers(resp.headers());
                metadata.remove(keys::STORE_VERSION);
                if let Some(snapshot) = snapshot {
                    metadata.set_snapshot(snapshot);
                }
                Ok(Some(metadata))
            }
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(Self::fail(&location.base_path, resp).await),
        }
    }

    async fn list_blobs(
        &self,
        container: &str,
        prefix: Option<&str>,
        include_snapshots: bool,
    ) -> Result<Vec<ListedBlob>, StoreError> {
        let mut items = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let mut req = AzureRequest::new(Method::GET, container, None, "azure list_blobs");
            req.query
                .push(("restype".to_string(), "container".to_string()));
            req.query.push(("comp".to_string(), "list".to_string()));
            if let Some(prefix) = prefix {
                req.query.push(("prefix".to_string(), prefix.to_string()));
            }
            if include_snapshots {
                req.query
                    .push(("include".to_string(), "snapshots".to_string()));
            }
            if let Some(marker) = &marker {
                req.query.push(("marker".to_string(), marker.clone()));
            }
            let resp = self.exec(req).await?;
            if resp.status() != StatusCode::OK {
                return Err(Self::fail(container, resp).await);
            }
            let text = resp
                .text()
                .await
                .map_err(|e| StoreError::storage(container, e))?;
            let parsed: ListBlobsResponse = quick_xml::de::from_str(&text)
                .map_err(|e| StoreError::storage(container, format!("bad listing: {e}")))?;
            if let Some(blobs) = parsed.blobs {
                items.extend(blobs.items);
            }
            match parsed.next_marker.filter(|m| !m.is_empty()) {
                Some(next) => marker = Some(next),
                None => break,
            }
        }
        Ok(items)
    }

    async fn lease_op(
        &self,
        container: &str,
        blob: &str,
        action: &str,
        lease_id: Option<&str>,
        proposed_id: Option<&str>,
    ) -> Result<reqwest::Response, StoreError> {
        let mut req = AzureRequest::new(Method::PUT, container, Some(blob), "azure lease");
        req.query.push(("comp".to_string(), "lease".to_string()));
        req.ms_headers
            .push(("x-ms-lease-action".to_string(), action.to_string()));
        if action == "acquire" {
            req.ms_headers.push((
                "x-ms-lease-duration".to_string(),
                LEASE_DURATION_SECS.to_string(),
            ));
        }
        if let Some(lease_id) = lease_id {
            req.ms_headers
                .push(("x-ms-lease-id".to_string(), lease_id.to_string()));
        }
        if let Some(proposed_id) = proposed_id {
            req.ms_headers
                .push(("x-ms-proposed-lease-id".to_string(), proposed_id.to_string()));
        }
        self.exec(req).await
    }
}

#[async_trait]
impl ObjectStore for AzureStore {
    fn can_compress(&self) -> bool {
        true
    }

    async fn create_container_if_not_exists(&self, container: &str) -> Result<(), StoreError> {
        let mut req = AzureRequest::new(Method::PUT, container, None, "azure create_container");
        req.query
            .push(("restype".to_string(), "container".to_string()));
        let resp = self.exec(req).await?;
        match resp.status() {
            StatusCode::CREATED | StatusCode::CONFLICT => Ok(()),
            _ => Err(Self::fail(container, resp).await),
        }
    }

    async fn save_data(
        &self,
        location: &StoreLocation,
        metadata: Metadata,
        writer: DataWriter,
    ) -> Result<Metadata, StoreError> {
        let committed = self
            .write_blob(location, metadata, writer, WriteCondition::Unconditional)
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
        match self.write_blob(location, metadata, writer, condition).await? {
            Some(committed) => Ok(OptimisticResult::committed(committed)),
            None => Ok(OptimisticResult::precondition_failed()),
        }
    }

    async fn get_metadata(
        &self,
        location: &StoreLocation,
        snapshot: Option<&str>,
    ) -> Result<Option<Metadata>, StoreError> {
        self.head_blob(location, snapshot).await
    }

    async fn load_data(
        &self,
        location: &StoreLocation,
        snapshot: Option<&str>,
    ) -> Result<Option<DataWithMetadata>, StoreError> {
        let mut req = AzureRequest::new(
            Method::GET,
            &location.container,
            Some(&location.base_path),
            "azure get_blob",
        );
        if let Some(snapshot) = snapshot {
            req.query
                .push(("snapshot".to_string(), snapshot.to_string()));
        }
        let resp = self.exec(req).await?;
        match resp.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Ok(None),
            _ => return Err(Self::fail(&location.base_path, resp).await),
        }

        let mut metadata = Self::metadata_from_headers(resp.headers());
        metadata.remove(keys::STORE_VERSION);
        if let Some(snapshot) = snapshot {
            metadata.set_snapshot(snapshot);
        }
        if snapshot.is_none() && metadata.is_deleted() {
            return Ok(None);
        }
        let stream: DataStream = Box::pin(
            resp.bytes_stream()
                .map(|chunk| chunk.map_err(std::io::Error::other)),
        );
        Ok(Some(DataWithMetadata { stream, metadata }))
    }

    async fn find_snapshots(&self, location: &StoreLocation) -> Result<Vec<Snapshot>, StoreError> {
        let listed = self
            .list_blobs(&location.container, Some(&location.base_path), true)
            .await?;
        let mut snapshots = Vec::new();
        for blob in listed {
            if blob.name != location.base_path {
                continue;
            }
            let snapshot_id = match blob.snapshot {
                Some(snapshot_id) => snapshot_id,
                None => continue,
            };
            let metadata = match self.head_blob(location, Some(&snapshot_id)).await? {
                Some(metadata) => metadata,
                None => continue,
            };
            let listed_modified = blob
                .properties
                .as_ref()
                .and_then(|p| p.last_modified.as_deref())
                .and_then(|v| chrono::DateTime::parse_from_rfc2822(v).ok())
                .map(|t| t.timestamp_millis())
                .unwrap_or(0);
            let modified = metadata.modified().unwrap_or(listed_modified);
            snapshots.push(Snapshot {
                id: snapshot_id,
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
        let listed = self.list_blobs(container, prefix, false).await?;
        let mut out = Vec::new();
        for blob in listed {
            if blob.name.ends_with(LOCK_SUFFIX) {
                continue;
            }
            let location = StoreLocation::new(container, blob.name);
            if let Some(metadata) = self.head_blob(&location, None).await? {
                out.push((location, metadata));
            }
        }
        Ok(out)
    }

    async fn soft_delete(&self, location: &StoreLocation) -> Result<(), StoreError> {
        let current = match self.head_blob(location, None).await? {
            Some(current) => current,
            None => return Ok(()),
        };
        let mut marker = Self::finalize_metadata(&current.user_only(), 0);
        marker.mark_deleted(now_ticks());
        self.commit_bytes(location, marker, Bytes::new(), &WriteCondition::Unconditional)
            .await?;
        Ok(())
    }

    async fn permanent_delete(&self, location: &StoreLocation) -> Result<(), StoreError> {
        let mut req = AzureRequest::new(
            Method::DELETE,
            &location.container,
            Some(&location.base_path),
            "azure delete_blob",
        );
        req.ms_headers
            .push(("x-ms-delete-snapshots".to_string(), "include".to_string()));
        let resp = self.exec(req).await?;
        match resp.status() {
            StatusCode::ACCEPTED | StatusCode::NOT_FOUND => Ok(()),
            _ => Err(Self::fail(&location.base_path, resp).await),
        }
    }

    async fn save_metadata(
        &self,
        location: &StoreLocation,
        metadata: Metadata,
    ) -> Result<Option<Metadata>, StoreError> {
        let current = match self.head_blob(location, None).await? {
            Some(current) => current,
            None => return Ok(None),
        };

        let mut updated = metadata.user_only();
        // The stored bytes do not change, so the pipeline markers, snapshot
        // pointer and logical length all carry over.
        if let Some(flag) = current.get(keys::COMPRESSED) {
            updated.insert(keys::COMPRESSED, flag.to_string());
        }
        if let Some(snapshot) = current.snapshot() {
            updated.set_snapshot(snapshot);
        }
        updated.set_content_length(current.content_length().unwrap_or(0));
        updated.set_modified(now_ticks());
        updated.insert(keys::STORE_VERSION, STORE_VERSION_VALUE);

        let mut req = AzureRequest::new(
            Method::PUT,
            &location.container,
            Some(&location.base_path),
            "azure set_metadata",
        );
        req.query.push(("comp".to_string(), "metadata".to_string()));
        req.ms_headers = Self::meta_headers(&updated);
        let resp = self.exec(req).await?;
        if resp.status() != StatusCode::OK {
            return Err(Self::fail(&location.base_path, resp).await);
        }
        if let Some(etag) = resp
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
        {
            updated.set_etag(etag);
        }
        updated.remove(keys::STORE_VERSION);
        Ok(Some(updated))
    }

    async fn lock(&self, location: &StoreLocation) -> Result<Option<StoreLock>, StoreError> {
        let lock_blob = format!("{}{}", location.base_path, LOCK_SUFFIX);
        let container = location.container.clone();

        // Make sure the lock blob exists; racing creators both succeed in
        // reaching the lease attempt.
        let mut ensure = AzureRequest::new(
            Method::PUT,
            &container,
            Some(&lock_blob),
            "azure create_lock_blob",
        );
        ensure
            .ms_headers
            .push(("x-ms-blob-type".to_string(), "BlockBlob".to_string()));
        ensure.if_none_match = Some("*".to_string());
        ensure.body = Some(Bytes::new());
        let resp = self.exec(ensure).await?;
        match resp.status() {
            StatusCode::CREATED | StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {}
            _ => return Err(Self::fail(&lock_blob, resp).await),
        }

        let proposed_id = Uuid::new_v4().to_string();
        let resp = self
            .lease_op(&container, &lock_blob, "acquire", None, Some(&proposed_id))
            .await?;
        let lease_id = match resp.status() {
            StatusCode::CREATED => resp
                .headers()
                .get("x-ms-lease-id")
                .and_then(|v| v.to_str().ok())
                .unwrap_or(&proposed_id)
                .to_string(),
            StatusCode::CONFLICT => return Ok(None),
            _ => return Err(Self::fail(&lock_blob, resp).await),
        };

        let renew_store = self.clone_for_tasks();
        let renew_container = container.clone();
        let renew_blob = lock_blob.clone();
        let renew_lease = lease_id.clone();
        let renew_task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(LEASE_RENEW_EVERY).await;
                match renew_store
                    .lease_op(&renew_container, &renew_blob, "renew", Some(&renew_lease), None)
                    .await
                {
                    Ok(resp) if resp.status() == StatusCode::OK => {}
                    Ok(resp) => {
                        warn!("lost lease on {}: {}", renew_blob, resp.status());
                        break;
                    }
                    Err(e) => {
                        warn!("lease renewal failed for {}: {}", renew_blob, e);
                        break;
                    }
                }
            }
        });

        let release_store = self.clone_for_tasks();
        let release_container = container.clone();
        let release_blob = lock_blob.clone();
        let release_lease = lease_id.clone();
        let release = Box::pin(async move {
            let _ = release_store
                .lease_op(
                    &release_container,
                    &release_blob,
                    "release",
                    Some(&release_lease),
                    None,
                )
                .await;
        });

        Ok(Some(StoreLock::new(location.clone(), renew_task, release)))
    }
}

impl AzureStore {
    /// Cheap handle for background lease tasks.
    fn clone_for_tasks(&self) -> Arc<AzureStore> {
        Arc::new(AzureStore {
            http: self.http.clone(),
            account: self.account.clone(),
            key: self.key.clone(),
            endpoint: self.endpoint.clone(),
        })
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 408 | 429 | 500 | 503)
}

#[derive(Debug, Deserialize)]
struct ListBlobsResponse {
    #[serde(rename = "Blobs")]
    blobs: Option<BlobsNode>,
    #[serde(rename = "NextMarker")]
    next_marker: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct BlobsNode {
    #[serde(rename = "Blob", default)]
    items: Vec<ListedBlob>,
}

#[derive(Debug, Deserialize)]
struct ListedBlob {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Snapshot")]
    snapshot: Option<String>,
    #[serde(rename = "Properties")]
    properties: Option<ListedProperties>,
}

#[derive(Debug, Default, Deserialize)]
struct ListedProperties {
    #[serde(rename = "Last-Modified")]
    last_modified: Option<String>,
    #[serde(rename = "Etag")]
    etag: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_to_sign_layout_matches_shared_key_format() {
        let ms_headers = vec![
            ("x-ms-version".to_string(), "2021-08-06".to_string()),
            (
                "x-ms-date".to_string(),
                "Mon, 27 Jan 2026 12:00:00 GMT".to_string(),
            ),
        ];
        let query = vec![
            ("restype".to_string(), "container".to_string()),
            ("comp".to_string(), "list".to_string()),
        ];
        let signed = AzureStore::string_to_sign(
            "account",
            "GET",
            0,
            "",
            "",
            "",
            &ms_headers,
            "kalixtest",
            None,
            &query,
        );
        assert_eq!(
            signed,
            "GET\n\n\n\n\n\n\n\n\n\n\n\n\
             x-ms-date:Mon, 27 Jan 2026 12:00:00 GMT\nx-ms-version:2021-08-06\n\
             /account/kalixtest\ncomp:list\nrestype:container"
        );
    }

    #[test]
    fn string_to_sign_includes_length_and_conditions() {
        let signed = AzureStore::string_to_sign(
            "account",
            "PUT",
            10,
            "application/xml",
            "",
            "*",
            &[],
            "c",
            Some("a/b"),
            &[],
        );
        assert!(signed.starts_with("PUT\n\n\n10\n\napplication/xml\n\n\n\n*\n\n\n"));
        assert!(signed.ends_with("/account/c/a/b"));
    }

    #[test]
    fn listing_xml_parses() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
<EnumerationResults ServiceEndpoint="https://acct.blob.core.windows.net/" ContainerName="c">
  <Blobs>
    <Blob>
      <Name>tests/A.dat</Name>
      <Snapshot>2026-01-27T12:34:56.1234567Z</Snapshot>
      <Properties>
        <Last-Modified>Tue, 27 Jan 2026 12:34:56 GMT</Last-Modified>
        <Etag>0x8D1234</Etag>
        <Content-Length>1024</Content-Length>
      </Properties>
    </Blob>
    <Blob>
      <Name>tests/A.dat</Name>
      <Properties>
        <Last-Modified>Tue, 27 Jan 2026 12:40:00 GMT</Last-Modified>
        <Etag>0x8D5678</Etag>
        <Content-Length>2048</Content-Length>
      </Properties>
    </Blob>
  </Blobs>
  <NextMarker />
</EnumerationResults>"#;
        let parsed: ListBlobsResponse = quick_xml::de::from_str(xml).unwrap();
        let items = parsed.blobs.unwrap().items;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].name, "tests/A.dat");
        assert!(items[0].snapshot.is_some());
        assert!(items[1].snapshot.is_none());
        assert_eq!(
            items[1].properties.as_ref().unwrap().etag.as_deref(),
            Some("0x8D5678")
        );
        assert!(parsed.next_marker.unwrap().is_empty());
    }

    #[test]
    fn meta_headers_prefix_every_key() {
        let mut metadata = Metadata::new();
        metadata.set_content_length(9);
        metadata.insert("custom", "v");
        let headers = AzureStore::meta_headers(&metadata);
        assert!(headers.contains(&("x-ms-meta-ContentLength".to_string(), "9".to_string())));
        assert!(headers.contains(&("x-ms-meta-custom".to_string(), "v".to_string())));
    }

    #[test]
    fn config_requires_base64_key() {
        let config = AzureStoreConfig {
            account: "acct".to_string(),
            access_key: "!!!not-base64!!!".to_string(),
            endpoint: None,
        };
        assert!(config.validate().is_err());
    }
}
