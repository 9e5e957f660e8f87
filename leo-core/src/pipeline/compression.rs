//! Streaming gzip stage.

use async_compression::tokio::bufread::{GzipDecoder, GzipEncoder};
use tokio_util::io::{ReaderStream, StreamReader};

use crate::store::DataStream;

/// Gzip the stream.
pub fn compress(data: DataStream) -> DataStream {
    let encoder = GzipEncoder::new(StreamReader::new(data));
    Box::pin(ReaderStream::new(encoder))
}

/// Gunzip the stream. Corrupt input fails the stream items.
pub fn decompress(data: DataStream) -> DataStream {
    let decoder = GzipDecoder::new(StreamReader::new(data));
    Box::pin(ReaderStream::new(decoder))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{collect_stream, data_stream_from};

    #[tokio::test]
    async fn roundtrips() {
        let payload: Vec<u8> = (0..100_000).map(|i| (i % 7) as u8).collect();
        let packed = collect_stream(compress(data_stream_from(payload.clone())))
            .await
            .unwrap();
        assert!(packed.len() < payload.len());
        let unpacked = collect_stream(decompress(data_stream_from(packed)))
            .await
            .unwrap();
        assert_eq!(unpacked, payload);
    }

    #[tokio::test]
    async fn corrupt_input_fails() {
        let result = collect_stream(decompress(data_stream_from(vec![0u8; 64]))).await;
        assert!(result.is_err());
    }
}
