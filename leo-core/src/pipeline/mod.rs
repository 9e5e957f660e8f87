//! Streaming transforms between caller bytes and the backend adapter.
//!
//! Write order: caller bytes -> gzip (optional) -> encrypt (optional) ->
//! backend. Reads reverse it. The logical byte count (`ContentLength`) is
//! taken on the caller side of the pipeline.

pub mod compression;
pub mod encryption;

pub use encryption::{ChunkedEncryptor, EncryptionError, Encryptor};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::StreamExt;

use crate::store::DataStream;

/// Count logical bytes as they pass.
pub fn counted(data: DataStream, counter: Arc<AtomicU64>) -> DataStream {
    Box::pin(data.map(move |chunk| {
        if let Ok(bytes) = &chunk {
            counter.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        }
        chunk
    }))
}

/// Assemble the write-side pipeline.
pub fn apply_write_pipeline(
    data: DataStream,
    compress: bool,
    encryptor: Option<&Arc<dyn Encryptor>>,
) -> DataStream {
    let mut data = data;
    if compress {
        data = compression::compress(data);
    }
    if let Some(encryptor) = encryptor {
        data = encryptor.encrypt(data);
    }
    data
}

/// Assemble the read-side pipeline (inverse order).
pub fn apply_read_pipeline(
    data: DataStream,
    compressed: bool,
    encryptor: Option<&Arc<dyn Encryptor>>,
) -> DataStream {
    let mut data = data;
    if let Some(encryptor) = encryptor {
        data = encryptor.decrypt(data);
    }
    if compressed {
        data = compression::decompress(data);
    }
    data
}
