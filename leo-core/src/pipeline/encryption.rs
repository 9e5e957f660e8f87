//! Streaming authenticated encryption.
//!
//! The engine treats the cipher as pluggable: anything implementing
//! [`Encryptor`] can sit in the pipeline, and an absent encryptor means
//! bytes pass through untouched. [`ChunkedEncryptor`] is the shipped
//! implementation: ChaCha20-Poly1305 over length-prefixed frames so that
//! arbitrarily large payloads stream without buffering, and truncation or
//! tampering fails the read stream.

use bytes::{Buf, BufMut, BytesMut};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use futures::StreamExt;
use thiserror::Error;

use crate::store::DataStream;

#[derive(Debug, Error)]
pub enum EncryptionError {
    #[error("key management error: {0}")]
    KeyManagement(String),
}

/// Streaming transform inserted between caller bytes and the backend.
///
/// Both directions wrap lazily; failures surface through the stream items.
pub trait Encryptor: Send + Sync {
    fn encrypt(&self, data: DataStream) -> DataStream;
    fn decrypt(&self, data: DataStream) -> DataStream;
}

/// Plaintext bytes per frame.
const FRAME_LEN: usize = 64 * 1024;
/// Poly1305 tag length.
const TAG_LEN: usize = 16;
/// Random per-stream nonce prefix length.
const STREAM_ID_LEN: usize = 8;
/// High bit of the frame length word marks the final frame. The flag is
/// bound into the AAD so a truncated stream cannot be re-terminated.
const FINAL_FLAG: u32 = 0x8000_0000;

/// Framed ChaCha20-Poly1305 stream cipher.
///
/// Wire layout: an 8-byte random stream id, then frames of
/// `u32-be length-word | ciphertext`. The nonce for frame `n` is
/// `stream_id || n` (big-endian u32). The final frame (possibly empty) has
/// the high bit of its length word set, so an honest end of stream is
/// distinguishable from truncation.
#[derive(Clone)]
pub struct ChunkedEncryptor {
    cipher: ChaCha20Poly1305,
}

impl std::fmt::Debug for ChunkedEncryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedEncryptor")
            .field("cipher", &"<initialized>")
            .finish()
    }
}

impl ChunkedEncryptor {
    pub fn new(key: &[u8; 32]) -> Self {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
        ChunkedEncryptor { cipher }
    }

    /// Parse a 64-hex-character key.
    pub fn from_hex_key(hex_key: &str) -> Result<Self, EncryptionError> {
        let bytes = hex::decode(hex_key)
            .map_err(|e| EncryptionError::KeyManagement(format!("invalid key format: {e}")))?;
        let key: [u8; 32] = bytes.try_into().map_err(|_| {
            EncryptionError::KeyManagement("invalid key length, expected 32 bytes".to_string())
        })?;
        Ok(ChunkedEncryptor::new(&key))
    }
}

fn frame_nonce(stream_id: &[u8; STREAM_ID_LEN], counter: u32) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..STREAM_ID_LEN].copy_from_slice(stream_id);
    nonce[STREAM_ID_LEN..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

struct EncryptState {
    input: DataStream,
    buf: BytesMut,
    stream_id: [u8; STREAM_ID_LEN],
    counter: u32,
    header_pending: bool,
    input_done: bool,
    finished: bool,
}

struct DecryptState {
    input: DataStream,
    buf: BytesMut,
    stream_id: Option<[u8; STREAM_ID_LEN]>,
    counter: u32,
    finished: bool,
}

impl Encryptor for ChunkedEncryptor {
    fn encrypt(&self, data: DataStream) -> DataStream {
        let cipher = self.cipher.clone();
        let state = EncryptState {
            input: data,
            buf: BytesMut::new(),
            stream_id: rand::random(),
            counter: 0,
            header_pending: true,
            input_done: false,
            finished: false,
        };
        Box::pin(futures::stream::unfold(state, move |mut st| {
            let cipher = cipher.clone();
            async move {
                if st.finished {
                    return None;
                }
                // Buffer past one frame so the final frame is recognizable.
                while !st.input_done && st.buf.len() <= FRAME_LEN {
                    match st.input.next().await {
                        Some(Ok(chunk)) => st.buf.extend_from_slice(&chunk),
                        Some(Err(e)) => {
                            st.finished = true;
                            return Some((Err(e), st));
                        }
                        None => st.input_done = true,
                    }
                }
                let (plain_len, is_final) = if st.buf.len() > FRAME_LEN {
                    (FRAME_LEN, false)
                } else {
                    (st.buf.len(), true)
                };
                if st.counter == u32::MAX {
                    st.finished = true;
                    return Some((
                        Err(std::io::Error::other("payload exceeds frame counter range")),
                        st,
                    ));
                }
                let plaintext = st.buf.split_to(plain_len);
                let nonce = frame_nonce(&st.stream_id, st.counter);
                let sealed = cipher.encrypt(
                    Nonce::from_slice(&nonce),
                    Payload {
                        msg: &plaintext,
                        aad: &[is_final as u8],
                    },
                );
                let ciphertext = match sealed {
                    Ok(ct) => ct,
                    Err(_) => {
                        st.finished = true;
                        return Some((Err(std::io::Error::other("encryption failed")), st));
                    }
                };
                st.counter += 1;
                let header = if st.header_pending { STREAM_ID_LEN } else { 0 };
                let mut frame = BytesMut::with_capacity(header + 4 + ciphertext.len());
                if st.header_pending {
                    frame.extend_from_slice(&st.stream_id);
                    st.header_pending = false;
                }
                let mut len_word = ciphertext.len() as u32;
                if is_final {
                    len_word |= FINAL_FLAG;
                    st.finished = true;
                }
                frame.put_u32(len_word);
                frame.extend_from_slice(&ciphertext);
                Some((Ok(frame.freeze()), st))
            }
        }))
    }

    fn decrypt(&self, data: DataStream) -> DataStream {
        let cipher = self.cipher.clone();
        let state = DecryptState {
            input: data,
            buf: BytesMut::new(),
            stream_id: None,
            counter: 0,
            finished: false,
        };
        Box::pin(futures::stream::unfold(state, move |mut st| {
            let cipher = cipher.clone();
            async move {
                if st.finished {
                    return None;
                }
                loop {
                    if st.stream_id.is_none() && st.buf.len() >= STREAM_ID_LEN {
                        let mut id = [0u8; STREAM_ID_LEN];
                        id.copy_from_slice(&st.buf.split_to(STREAM_ID_LEN));
                        st.stream_id = Some(id);
                    }
                    if let Some(stream_id) = st.stream_id {
                        if st.buf.len() >= 4 {
                            let len_word = u32::from_be_bytes(st.buf[..4].try_into().unwrap());
                            let is_final = len_word & FINAL_FLAG != 0;
                            let ct_len = (len_word & !FINAL_FLAG) as usize;
                            if ct_len > FRAME_LEN + TAG_LEN {
                                st.finished = true;
                                return Some((
                                    Err(invalid_data("oversized encrypted frame")),
                                    st,
                                ));
                            }
                            if st.buf.len() >= 4 + ct_len {
                                st.buf.advance(4);
                                let ciphertext = st.buf.split_to(ct_len);
                                let nonce = frame_nonce(&stream_id, st.counter);
                                let opened = cipher.decrypt(
                                    Nonce::from_slice(&nonce),
                                    Payload {
                                        msg: &ciphertext,
                                        aad: &[is_final as u8],
                                    },
                                );
                                let plaintext = match opened {
                                    Ok(pt) => pt,
                                    Err(_) => {
                                        st.finished = true;
                                        return Some((
                                            Err(invalid_data("ciphertext authentication failed")),
                                            st,
                                        ));
                                    }
                                };
                                st.counter += 1;
                                if is_final {
                                    st.finished = true;
                                    if let Err(e) = expect_end(&mut st).await {
                                        return Some((Err(e), st));
                                    }
                                    if plaintext.is_empty() {
                                        return None;
                                    }
                                    return Some((Ok(plaintext.into()), st));
                                }
                                if plaintext.is_empty() {
                                    st.finished = true;
                                    return Some((
                                        Err(invalid_data("empty non-final encrypted frame")),
                                        st,
                                    ));
                                }
                                return Some((Ok(plaintext.into()), st));
                            }
                        }
                    }
                    match st.input.next().await {
                        Some(Ok(chunk)) => st.buf.extend_from_slice(&chunk),
                        Some(Err(e)) => {
                            st.finished = true;
                            return Some((Err(e), st));
                        }
                        None => {
                            st.finished = true;
                            return Some((
                                Err(std::io::Error::new(
                                    std::io::ErrorKind::UnexpectedEof,
                                    "truncated encrypted stream",
                                )),
                                st,
                            ));
                        }
                    }
                }
            }
        }))
    }
}

fn invalid_data(message: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, message.to_string())
}

/// After the final frame nothing else may follow.
async fn expect_end(st: &mut DecryptState) -> std::io::Result<()> {
    if !st.buf.is_empty() {
        return Err(invalid_data("trailing data after final frame"));
    }
    loop {
        match st.input.next().await {
            None => return Ok(()),
            Some(Ok(chunk)) if chunk.is_empty() => continue,
            Some(Ok(_)) => return Err(invalid_data("trailing data after final frame")),
            Some(Err(e)) => return Err(e),
        }
    }
}
