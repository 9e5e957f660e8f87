//! Backend store adapter contract.
//!
//! An [`ObjectStore`] abstracts one cloud object store: data I/O, snapshot
//! listing, metadata fetch, soft-delete markers, optimistic conditional
//! writes, lease-based per-key locks, and prefix listing. Two cloud
//! implementations exist: [`azure::AzureStore`] (native snapshots and blob
//! leases) and [`s3::S3Store`] (bucket versioning and version listings).
//! [`memory::MemoryStore`] implements the same contract in-process for tests.
//!
//! Failure mapping happens here and only here: missing objects are `Ok(None)`,
//! precondition failures are `OptimisticResult { ok: false }`, transient
//! faults retry once then surface as `StoreError::Transient`, everything else
//! wraps into `StoreError::Storage` with the offending path.

pub mod azure;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod s3;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::task::JoinHandle;

use crate::error::StoreError;
use crate::location::StoreLocation;
use crate::metadata::Metadata;

/// Lazy sequence of payload chunks. Finite, single-consumer; dropping the
/// stream releases it. Errors surface through the items.
pub type DataStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Write side handed to a [`DataWriter`].
pub type ByteSink = Pin<Box<dyn AsyncWrite + Send>>;

/// Callback that pumps the payload into the backend's write stream and
/// resolves to the count of *logical* bytes written (pre-compression,
/// pre-encryption). The adapter persists that count as `ContentLength`.
/// If the writer fails, the partial object is never committed.
pub type DataWriter = Box<dyn FnOnce(ByteSink) -> BoxFuture<'static, std::io::Result<u64>> + Send>;

/// The read projection: a lazy byte stream plus the record's metadata.
pub struct DataWithMetadata {
    pub stream: DataStream,
    pub metadata: Metadata,
}

impl DataWithMetadata {
    /// Drain the stream into memory. Mostly useful in tests and small reads.
    pub async fn read_all(self) -> std::io::Result<Vec<u8>> {
        collect_stream(self.stream).await
    }
}

impl std::fmt::Debug for DataWithMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataWithMetadata")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// An immutable prior version of a location.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Backend-assigned opaque version id.
    pub id: String,
    /// Modified tick captured at snapshot creation.
    pub modified: i64,
    /// Metadata captured at snapshot creation.
    pub metadata: Metadata,
}

/// Outcome of a conditional write.
#[derive(Debug)]
pub struct OptimisticResult {
    pub ok: bool,
    /// Post-write metadata when the write committed.
    pub metadata: Option<Metadata>,
}

impl OptimisticResult {
    pub fn committed(metadata: Metadata) -> Self {
        OptimisticResult {
            ok: true,
            metadata: Some(metadata),
        }
    }

    pub fn precondition_failed() -> Self {
        OptimisticResult {
            ok: false,
            metadata: None,
        }
    }
}

/// Commit condition derived from the `ETag` metadata key.
///
/// Absent etag means create-only, `"*"` means unconditional, anything else
/// must match the current tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteCondition {
    Unconditional,
    IfNotExists,
    IfMatch(String),
}

impl WriteCondition {
    pub fn from_metadata(metadata: &Metadata) -> WriteCondition {
        match metadata.etag() {
            None => WriteCondition::IfNotExists,
            Some("*") => WriteCondition::Unconditional,
            Some(etag) => WriteCondition::IfMatch(etag.to_string()),
        }
    }
}

/// A held per-key lock backed by an auto-renewed backend lease.
///
/// `release` is explicit and idempotent; dropping the handle abandons the
/// lease with a best-effort release.
pub struct StoreLock {
    location: StoreLocation,
    renew_task: Option<JoinHandle<()>>,
    release: Option<BoxFuture<'static, ()>>,
}

impl StoreLock {
    pub fn new(
        location: StoreLocation,
        renew_task: JoinHandle<()>,
        release: BoxFuture<'static, ()>,
    ) -> Self {
        StoreLock {
            location,
            renew_task: Some(renew_task),
            release: Some(release),
        }
    }

    pub fn location(&self) -> &StoreLocation {
        &self.location
    }

    /// Stop renewing and release the lease.
    pub async fn release(mut self) {
        if let Some(task) = self.renew_task.take() {
            task.abort();
        }
        if let Some(release) = self.release.take() {
            release.await;
        }
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Some(task) = self.renew_task.take() {
            task.abort();
        }
        if let Some(release) = self.release.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(release);
            }
        }
    }
}

impl std::fmt::Debug for StoreLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreLock")
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

/// Backend store adapter. All methods deal in already-transformed bytes; the
/// secure store owns compression and encryption.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Whether payloads stored here may be compressed by the secure store.
    fn can_compress(&self) -> bool;

    /// Idempotent container creation.
    async fn create_container_if_not_exists(&self, container: &str) -> Result<(), StoreError>;

    /// Persist a new current version. `writer` is invoked with the write-side
    /// stream; the adapter commits only after it resolves successfully.
    /// Returns the post-write metadata including assigned `Snapshot`, `ETag`,
    /// `Modified` and `ContentLength`. All user-visible metadata is replaced,
    /// never merged.
    async fn save_data(
        &self,
        location: &StoreLocation,
        metadata: Metadata,
        writer: DataWriter,
    ) -> Result<Metadata, StoreError>;

    /// Like `save_data`, but the commit is conditional on the `ETag` carried
    /// in `metadata` (absent: create-only; present: must match; `"*"`:
    /// unconditional). Precondition failure has no side effects.
    async fn try_optimistic_write(
        &self,
        location: &StoreLocation,
        metadata: Metadata,
        writer: DataWriter,
    ) -> Result<OptimisticResult, StoreError>;

    /// Metadata of the current version, or of one snapshot. `None` iff the
    /// target does not exist. A soft-deleted current version still returns
    /// its metadata; hiding it is the reader's decision.
    async fn get_metadata(
        &self,
        location: &StoreLocation,
        snapshot: Option<&str>,
    ) -> Result<Option<Metadata>, StoreError>;

    /// Payload of the current version, or of one snapshot. `None` when the
    /// target is missing, or when no snapshot was requested and the current
    /// version carries the soft-delete marker.
    async fn load_data(
        &self,
        location: &StoreLocation,
        snapshot: Option<&str>,
    ) -> Result<Option<DataWithMetadata>, StoreError>;

    /// All versions whose key equals `location` exactly (children excluded),
    /// newest first.
    async fn find_snapshots(&self, location: &StoreLocation) -> Result<Vec<Snapshot>, StoreError>;

    /// Current versions under a prefix. Soft-deleted records may be included;
    /// the secure store filters them.
    async fn find_files(
        &self,
        container: &str,
        prefix: Option<&str>,
    ) -> Result<Vec<(StoreLocation, Metadata)>, StoreError>;

    /// Append a zero-length current version carrying the soft-delete marker,
    /// preserving prior user metadata. Missing targets succeed silently.
    async fn soft_delete(&self, location: &StoreLocation) -> Result<(), StoreError>;

    /// Remove the current version and every snapshot. Missing targets succeed
    /// silently.
    async fn permanent_delete(&self, location: &StoreLocation) -> Result<(), StoreError>;

    /// Metadata-only update preserving content. Returns the post-update
    /// metadata, or `None` when the target does not exist.
    async fn save_metadata(
        &self,
        location: &StoreLocation,
        metadata: Metadata,
    ) -> Result<Option<Metadata>, StoreError>;

    /// Acquire the lease-backed lock for a location. `None` when another
    /// holder has it. The lease renews itself until released.
    async fn lock(&self, location: &StoreLocation) -> Result<Option<StoreLock>, StoreError>;
}

/// Single-chunk stream over a byte buffer.
pub fn data_stream_from(bytes: impl Into<Bytes>) -> DataStream {
    let bytes = bytes.into();
    Box::pin(futures::stream::once(async move { Ok(bytes) }))
}

pub fn empty_data_stream() -> DataStream {
    Box::pin(futures::stream::empty())
}

/// Drain a stream into memory.
pub async fn collect_stream(mut stream: DataStream) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}

/// Buffer size for the duplex pipe between a writer callback and the
/// adapter's upload loop.
pub(crate) const WRITER_PIPE_CAPACITY: usize = 64 * 1024;

/// Spawn `writer` against one end of a duplex pipe and hand back the read
/// side plus the join handle resolving to the logical byte count.
pub(crate) fn spawn_writer(
    writer: DataWriter,
) -> (JoinHandle<std::io::Result<u64>>, tokio::io::DuplexStream) {
    let (tx, rx) = tokio::io::duplex(WRITER_PIPE_CAPACITY);
    let handle = tokio::spawn(writer(Box::pin(tx)));
    (handle, rx)
}

/// Await the writer task, flattening panics into I/O errors.
pub(crate) async fn finish_writer(
    handle: JoinHandle<std::io::Result<u64>>,
) -> std::io::Result<u64> {
    match handle.await {
        Ok(result) => result,
        Err(join_err) => Err(std::io::Error::other(format!(
            "payload writer aborted: {join_err}"
        ))),
    }
}

/// Percent-encode a blob path for use inside a URL, leaving `/` separators
/// intact.
pub(crate) fn percent_encode_path(path: &str) -> String {
    const UNRESERVED: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~/";
    let mut out = String::with_capacity(path.len());
    for byte in path.bytes() {
        if UNRESERVED.contains(&byte) {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

/// Read up to `cap` bytes from `reader`. A short result means end of stream.
pub(crate) async fn read_up_to<R: AsyncRead + Unpin>(
    reader: &mut R,
    cap: usize,
) -> std::io::Result<Bytes> {
    let mut limited = reader.take(cap as u64);
    let mut buf = Vec::with_capacity(cap.min(WRITER_PIPE_CAPACITY));
    limited.read_to_end(&mut buf).await?;
    Ok(Bytes::from(buf))
}

/// Staged first read for the chunked path: returns the oversized head chunk
/// so the caller can replay it before continuing to stream.
pub(crate) struct StagedPayload {
    pub head: Bytes,
}

/// Read the head of the payload, deciding between the single-shot and the
/// chunked upload path. `Ok(Ok(bytes))` means the whole payload fit under
/// `cap`; `Ok(Err(staged))` means it did not and `staged.head` holds the
/// first `cap + 1` bytes already consumed.
pub(crate) async fn stage_payload<R: AsyncRead + Unpin>(
    reader: &mut R,
    cap: usize,
) -> std::io::Result<Result<Bytes, StagedPayload>> {
    let head = read_up_to(reader, cap + 1).await?;
    if head.len() <= cap {
        Ok(Ok(head))
    } else {
        Ok(Err(StagedPayload { head }))
    }
}

/// Assemble chunk-sized buffers from a staged head followed by the rest of
/// the reader. Yields buffers of exactly `chunk_size` bytes except the last.
pub(crate) struct ChunkedReader<R> {
    head: BytesMut,
    reader: R,
    chunk_size: usize,
    done: bool,
}

impl<R: AsyncRead + Unpin> ChunkedReader<R> {
    pub(crate) fn new(head: Bytes, reader: R, chunk_size: usize) -> Self {
        ChunkedReader {
            head: BytesMut::from(&head[..]),
            reader,
            chunk_size,
            done: false,
        }
    }

    /// Next chunk, or `None` at end of payload.
    pub(crate) async fn next_chunk(&mut self) -> std::io::Result<Option<Bytes>> {
        if self.done && self.head.is_empty() {
            return Ok(None);
        }
        while self.head.len() < self.chunk_size && !self.done {
            let more = read_up_to(&mut self.reader, self.chunk_size - self.head.len()).await?;
            if more.is_empty() {
                self.done = true;
            } else {
                self.head.extend_from_slice(&more);
            }
        }
        if self.head.is_empty() {
            return Ok(None);
        }
        let take = self.head.len().min(self.chunk_size);
        Ok(Some(self.head.split_to(take).freeze()))
    }
}
