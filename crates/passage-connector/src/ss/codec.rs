//! AEAD chunk stream.
//!
//! Wire format per direction: `salt(32)` once, then chunks of
//! `seal(len)(2+16) | seal(payload)(len+16)` with a little-endian
//! counter nonce bumped after every seal/open. Chunk payloads cap at
//! 0x3FFF bytes.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use passage_core::contract::Stream;

use super::{KEY_LEN, SALT_LEN, session_subkey};

const TAG_LEN: usize = 16;
const LEN_FRAME: usize = 2 + TAG_LEN;
const MAX_CHUNK: usize = 0x3FFF;

struct Crypter {
    cipher: ChaCha20Poly1305,
    nonce: [u8; 12],
}

impl Crypter {
    fn new(subkey: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(subkey)),
            nonce: [0u8; 12],
        }
    }

    fn bump(&mut self) {
        for byte in self.nonce.iter_mut() {
            *byte = byte.wrapping_add(1);
            if *byte != 0 {
                break;
            }
        }
    }

    fn seal(&mut self, plain: &[u8]) -> Vec<u8> {
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&self.nonce), plain)
            .expect("chacha20poly1305 seal cannot fail");
        self.bump();
        sealed
    }

    fn open(&mut self, sealed: &[u8]) -> io::Result<Vec<u8>> {
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(&self.nonce), sealed)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "aead open failed"))?;
        self.bump();
        Ok(plain)
    }
}

enum ReadState {
    Salt { buf: [u8; SALT_LEN], pos: usize },
    Len { crypter: Crypter, buf: [u8; LEN_FRAME], pos: usize },
    Payload { crypter: Crypter, buf: Vec<u8>, pos: usize },
    Eof,
}

struct WriteState {
    crypter: Option<Crypter>,
    pending: Vec<u8>,
    pos: usize,
}

/// Symmetric AEAD stream: the reader awaits the peer's salt, the writer
/// lazily sends its own with the first chunk.
pub struct AeadStream {
    inner: Stream,
    master: [u8; KEY_LEN],
    read: ReadState,
    write: WriteState,
    plain: Bytes,
}

impl AeadStream {
    pub fn new(inner: Stream, master: [u8; KEY_LEN]) -> Self {
        Self {
            inner,
            master,
            read: ReadState::Salt {
                buf: [0u8; SALT_LEN],
                pos: 0,
            },
            write: WriteState {
                crypter: None,
                pending: Vec::new(),
                pos: 0,
            },
            plain: Bytes::new(),
        }
    }

    /// Read into `buf[*pos..]`; Ok(true) when full, Ok(false) on EOF.
    fn fill(
        inner: &mut Stream,
        cx: &mut Context<'_>,
        buf: &mut [u8],
        pos: &mut usize,
    ) -> Poll<io::Result<bool>> {
        while *pos < buf.len() {
            let mut read_buf = ReadBuf::new(&mut buf[*pos..]);
            match Pin::new(&mut *inner).poll_read(cx, &mut read_buf) {
                Poll::Ready(Ok(())) => {
                    let n = read_buf.filled().len();
                    if n == 0 {
                        return Poll::Ready(Ok(false));
                    }
                    *pos += n;
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(Ok(true))
    }

    /// Push queued ciphertext into the inner stream.
    fn flush_pending(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.write.pos < self.write.pending.len() {
            let chunk = &self.write.pending[self.write.pos..];
            match Pin::new(&mut self.inner).poll_write(cx, chunk) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                }
                Poll::Ready(Ok(n)) => self.write.pos += n,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        self.write.pending.clear();
        self.write.pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for AeadStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            if !this.plain.is_empty() {
                let n = this.plain.len().min(buf.remaining());
                buf.put_slice(&this.plain[..n]);
                this.plain = this.plain.slice(n..);
                return Poll::Ready(Ok(()));
            }

            match &mut this.read {
                ReadState::Salt { buf: salt, pos } => {
                    match Self::fill(&mut this.inner, cx, salt, pos) {
                        Poll::Ready(Ok(true)) => {
                            let subkey = session_subkey(&this.master, &salt[..]);
                            this.read = ReadState::Len {
                                crypter: Crypter::new(&subkey),
                                buf: [0u8; LEN_FRAME],
                                pos: 0,
                            };
                        }
                        Poll::Ready(Ok(false)) => {
                            this.read = ReadState::Eof;
                            return Poll::Ready(Ok(()));
                        }
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                }
                ReadState::Len { crypter, buf: frame, pos } => {
                    match Self::fill(&mut this.inner, cx, frame, pos) {
                        Poll::Ready(Ok(true)) => {
                            let plain = crypter.open(&frame[..])?;
                            let len = u16::from_be_bytes([plain[0], plain[1]]) as usize & MAX_CHUNK;
                            let crypter = match std::mem::replace(&mut this.read, ReadState::Eof) {
                                ReadState::Len { crypter, .. } => crypter,
                                _ => unreachable!(),
                            };
                            this.read = ReadState::Payload {
                                crypter,
                                buf: vec![0u8; len + TAG_LEN],
                                pos: 0,
                            };
                        }
                        Poll::Ready(Ok(false)) => {
                            this.read = ReadState::Eof;
                            return Poll::Ready(Ok(()));
                        }
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                }
                ReadState::Payload { crypter, buf: frame, pos } => {
                    match Self::fill(&mut this.inner, cx, frame, pos) {
                        Poll::Ready(Ok(true)) => {
                            let plain = crypter.open(&frame[..])?;
                            this.plain = Bytes::from(plain);
                            let crypter = match std::mem::replace(&mut this.read, ReadState::Eof) {
                                ReadState::Payload { crypter, .. } => crypter,
                                _ => unreachable!(),
                            };
                            this.read = ReadState::Len {
                                crypter,
                                buf: [0u8; LEN_FRAME],
                                pos: 0,
                            };
                        }
                        Poll::Ready(Ok(false)) => {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "truncated aead chunk",
                            )));
                        }
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                }
                ReadState::Eof => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl AsyncWrite for AeadStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;

        // never take new input while ciphertext is still queued
        match this.flush_pending(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }

        if this.write.crypter.is_none() {
            let mut salt = [0u8; SALT_LEN];
            rand::rngs::OsRng.fill_bytes(&mut salt);
            let subkey = session_subkey(&this.master, &salt);
            this.write.crypter = Some(Crypter::new(&subkey));
            this.write.pending.extend_from_slice(&salt);
        }

        let chunk = &buf[..buf.len().min(MAX_CHUNK)];
        let crypter = this.write.crypter.as_mut().expect("installed above");
        let len_frame = crypter.seal(&(chunk.len() as u16).to_be_bytes());
        let payload_frame = crypter.seal(chunk);
        this.write.pending.extend_from_slice(&len_frame);
        this.write.pending.extend_from_slice(&payload_frame);

        // opportunistic flush; leftovers drain on the next call
        match this.flush_pending(cx) {
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            _ => {}
        }
        Poll::Ready(Ok(chunk.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        match this.flush_pending(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_flush(cx),
            other => other,
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        match this.flush_pending(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_shutdown(cx),
            other => other,
        }
    }
}
