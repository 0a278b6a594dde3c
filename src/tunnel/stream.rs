//! Encrypting stream wrapper
//!
//! `FramedStream` turns a raw byte stream into the tunnel's cipher-framed
//! duplex. There is no framing to speak of: the first `iv_len` bytes in
//! each direction ARE the IV, everything after is one keystream. Once the
//! handshake bytes have flowed, the wrapper is a transparent
//! bytes-in/bytes-out duplex.

use super::TunnelError;
use crate::crypto::{Cipher, IV_LEN};
use bytes::{Buf, BytesMut};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Largest plaintext chunk accepted per write; bounds the ciphertext
/// buffer.
const WRITE_CHUNK: usize = 8 * 1024;

enum ReadState {
    /// Collecting the peer IV; bytes are withheld from the caller.
    PeerIv { buf: [u8; IV_LEN], filled: usize },
    /// IV consumed; reads decrypt in place.
    Streaming,
}

/// A duplex stream that encrypts writes and decrypts reads.
pub struct FramedStream<S> {
    io: S,
    cipher: Cipher,
    read_state: ReadState,
    write_buf: BytesMut,
}

impl<S> FramedStream<S> {
    pub fn new(io: S, cipher: Cipher) -> Self {
        let read_state = if cipher.needs_peer_iv() {
            ReadState::PeerIv {
                buf: [0u8; IV_LEN],
                filled: 0,
            }
        } else {
            ReadState::Streaming
        };
        Self {
            io,
            cipher,
            read_state,
            write_buf: BytesMut::new(),
        }
    }

    /// Consume the wrapper, returning the inner stream.
    pub fn into_inner(self) -> S {
        self.io
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> FramedStream<S> {
    /// Write buffered ciphertext to the inner stream until empty.
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.write_buf.is_empty() {
            let n = ready!(Pin::new(&mut self.io).poll_write(cx, &self.write_buf))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.write_buf.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for FramedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match &mut this.read_state {
                ReadState::PeerIv { buf: iv, filled } => {
                    let mut tmp = [0u8; IV_LEN];
                    let mut iv_buf = ReadBuf::new(&mut tmp[..IV_LEN - *filled]);
                    ready!(Pin::new(&mut this.io).poll_read(cx, &mut iv_buf))?;

                    let n = iv_buf.filled().len();
                    if n == 0 {
                        if *filled == 0 {
                            // EOF before any handshake byte: a clean close
                            // (the peer rejected us without answering).
                            return Poll::Ready(Ok(()));
                        }
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            TunnelError::HandshakeTruncated,
                        )));
                    }

                    iv[*filled..*filled + n].copy_from_slice(iv_buf.filled());
                    *filled += n;

                    if *filled == IV_LEN {
                        let iv = *iv;
                        this.cipher
                            .begin_decrypt(&iv)
                            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                        this.read_state = ReadState::Streaming;
                    }
                }
                ReadState::Streaming => {
                    let before = buf.filled().len();
                    ready!(Pin::new(&mut this.io).poll_read(cx, buf))?;
                    let filled = buf.filled_mut();
                    if filled.len() > before {
                        this.cipher
                            .decrypt(&mut filled[before..])
                            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                    }
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for FramedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        // Previously accepted ciphertext goes first; plaintext is only
        // consumed into an empty buffer so acceptance stays bounded.
        ready!(this.poll_drain(cx))?;

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let n = buf.len().min(WRITE_CHUNK);
        if let Some(iv) = this.cipher.iv_to_send() {
            this.write_buf.extend_from_slice(&iv);
        }
        let start = this.write_buf.len();
        this.write_buf.extend_from_slice(&buf[..n]);
        this.cipher.encrypt(&mut this.write_buf[start..]);

        // Opportunistic drain; leftover goes out on the next write or
        // flush. A Pending here still counts as having accepted the bytes.
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }

        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.io).poll_shutdown(cx)
    }
}
