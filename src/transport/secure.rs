use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use crate::transport::TransportError;

/// Largest plaintext carried by a single frame (100 MB)
pub const MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

const LEN_SIZE: usize = 4;
const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
const HEADER_SIZE: usize = LEN_SIZE + NONCE_SIZE;

struct SendHalf<S> {
    writer: WriteHalf<S>,
    cipher: Option<Aes256Gcm>,
    max_frame_len: usize,
}

struct RecvHalf<S> {
    reader: ReadHalf<S>,
    cipher: Option<Aes256Gcm>,
    max_frame_len: usize,
    /// Decrypted bytes the caller had no room for yet
    leftover: Vec<u8>,
    offset: usize,
}

impl<S> RecvHalf<S> {
    fn drain_leftover(&mut self, buf: &mut [u8]) -> usize {
        let available = &self.leftover[self.offset..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.offset += n;
        if self.offset == self.leftover.len() {
            self.leftover.clear();
            self.offset = 0;
        }
        n
    }
}

/// AES-256-GCM framing over any byte stream.
///
/// Wire format per frame: `[len: u32 LE][nonce: 12][ciphertext: len][tag: 16]`
/// where `len` is the plaintext length. Reads and writes are independent;
/// each direction allows one caller at a time.
pub struct SecureTransport<S> {
    send: Mutex<SendHalf<S>>,
    recv: Mutex<RecvHalf<S>>,
}

impl<S> SecureTransport<S>
where
    S: AsyncRead + AsyncWrite + Send,
{
    pub fn new(stream: S, key: &[u8]) -> Result<Self, TransportError> {
        let cipher =
            Aes256Gcm::new_from_slice(key).map_err(|_| TransportError::InvalidKey(key.len()))?;
        let (reader, writer) = tokio::io::split(stream);
        Ok(Self {
            send: Mutex::new(SendHalf {
                writer,
                cipher: Some(cipher.clone()),
                max_frame_len: MAX_FRAME_LEN,
            }),
            recv: Mutex::new(RecvHalf {
                reader,
                cipher: Some(cipher),
                max_frame_len: MAX_FRAME_LEN,
                leftover: Vec::new(),
                offset: 0,
            }),
        })
    }

    /// Lower the per-frame plaintext limit for both directions. Values of 0
    /// or above [`MAX_FRAME_LEN`] are clamped. Both peers must agree.
    pub fn with_max_frame_len(self, max_frame_len: usize) -> Self {
        let max_frame_len = max_frame_len.clamp(1, MAX_FRAME_LEN);
        let mut send = self.send.into_inner();
        let mut recv = self.recv.into_inner();
        send.max_frame_len = max_frame_len;
        recv.max_frame_len = max_frame_len;
        Self {
            send: Mutex::new(send),
            recv: Mutex::new(recv),
        }
    }

    /// Encrypt and write `data`. Payloads over the frame limit span several
    /// frames; an empty payload writes nothing.
    pub async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut half = self.send.lock().await;
        let cipher = half.cipher.clone().ok_or(TransportError::Disposed)?;

        for chunk in data.chunks(half.max_frame_len) {
            let mut nonce = [0u8; NONCE_SIZE];
            rand::thread_rng().fill_bytes(&mut nonce);
            let sealed = cipher
                .encrypt(Nonce::from_slice(&nonce), chunk)
                .map_err(|_| TransportError::Encryption)?;

            let mut frame = Vec::with_capacity(HEADER_SIZE + sealed.len());
            frame.extend_from_slice(&(chunk.len() as u32).to_le_bytes());
            frame.extend_from_slice(&nonce);
            frame.extend_from_slice(&sealed);
            half.writer.write_all(&frame).await?;
        }
        half.writer.flush().await?;
        Ok(())
    }

    /// Read decrypted bytes into `buf`. Returns 0 on a clean end of stream.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut half = self.recv.lock().await;
        let cipher = half.cipher.clone().ok_or(TransportError::Disposed)?;
        if buf.is_empty() {
            return Ok(0);
        }
        if !half.leftover.is_empty() {
            return Ok(half.drain_leftover(buf));
        }

        let mut header = [0u8; HEADER_SIZE];
        let mut filled = 0;
        while filled < HEADER_SIZE {
            let n = half.reader.read(&mut header[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(0);
                }
                return Err(TransportError::DataCorruption(format!(
                    "stream ended inside a frame header after {} bytes",
                    filled
                )));
            }
            filled += n;
        }

        let mut len_bytes = [0u8; LEN_SIZE];
        len_bytes.copy_from_slice(&header[..LEN_SIZE]);
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len == 0 || len > half.max_frame_len {
            return Err(TransportError::DataCorruption(format!(
                "invalid frame length {}",
                len
            )));
        }

        let mut body = vec![0u8; len + TAG_SIZE];
        half.reader.read_exact(&mut body).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                TransportError::DataCorruption("stream ended inside a frame".to_string())
            } else {
                TransportError::Io(e)
            }
        })?;

        let plaintext = cipher
            .decrypt(Nonce::from_slice(&header[LEN_SIZE..]), body.as_slice())
            .map_err(|_| TransportError::Tampered)?;

        let n = plaintext.len().min(buf.len());
        buf[..n].copy_from_slice(&plaintext[..n]);
        if n < plaintext.len() {
            half.leftover = plaintext;
            half.offset = n;
        }
        Ok(n)
    }

    /// Fill `buf` completely.
    pub async fn recv_exact(&self, buf: &mut [u8]) -> Result<(), TransportError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.recv(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(TransportError::DataCorruption(format!(
                    "stream ended after {} of {} bytes",
                    filled,
                    buf.len()
                )));
            }
            filled += n;
        }
        Ok(())
    }

    /// Drop key material and buffered plaintext. Safe to call repeatedly.
    pub async fn dispose(&self) {
        {
            let mut send = self.send.lock().await;
            send.cipher = None;
            let _ = send.writer.shutdown().await;
        }
        let mut recv = self.recv.lock().await;
        recv.cipher = None;
        recv.leftover = Vec::new();
        recv.offset = 0;
    }

    pub async fn is_disposed(&self) -> bool {
        self.send.lock().await.cipher.is_none()
    }
}
