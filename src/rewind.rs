//! Rewindable stream buffer used for non-destructive protocol sniffing
//!
//! While recording, every byte pulled from the inner stream is also kept in a
//! bounded buffer. [`RewindStream::reset`] moves the read cursor back to the
//! start of that buffer so the next detector sees the same prefix, and
//! [`RewindStream::rewind`] does the same but ends recording: once the recorded
//! bytes are replayed, reads fall through to the inner stream. Writes are never
//! touched.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Detection window used for accepted connections
pub const DEFAULT_CAPACITY: usize = 255;

#[derive(Debug)]
pub struct RewindStream<S> {
    inner: S,
    buf: BytesMut,
    capacity: usize,
    cursor: usize,
    recording: bool,
    overflowed: bool,
}

impl<S> RewindStream<S> {
    pub fn new(inner: S, capacity: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(capacity),
            capacity,
            cursor: 0,
            recording: true,
            overflowed: false,
        }
    }

    /// Move the read cursor back to offset zero, keeping the recording mode.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    /// Replay the recorded bytes from the start, then pass reads through.
    pub fn rewind(&mut self) -> io::Result<()> {
        if self.overflowed {
            return Err(capacity_error(self.capacity));
        }
        self.cursor = 0;
        self.recording = false;
        Ok(())
    }

    /// True once a read needed more than `capacity` bytes of history.
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Bytes captured so far
    pub fn recorded(&self) -> &[u8] {
        &self.buf
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

/// A read needed more history than the detection window holds.
#[derive(Debug, thiserror::Error)]
#[error("rewind buffer capacity of {0} bytes exceeded")]
pub struct CapacityExceeded(pub usize);

/// True when `err` was produced by a read past the detection window.
pub fn is_capacity_error(err: &io::Error) -> bool {
    err.get_ref()
        .is_some_and(|inner| inner.is::<CapacityExceeded>())
}

fn capacity_error(capacity: usize) -> io::Error {
    io::Error::other(CapacityExceeded(capacity))
}

impl<S: AsyncRead + Unpin> AsyncRead for RewindStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        if this.cursor < this.buf.len() {
            let n = (this.buf.len() - this.cursor).min(out.remaining());
            out.put_slice(&this.buf[this.cursor..this.cursor + n]);
            this.cursor += n;
            if !this.recording && this.cursor == this.buf.len() {
                // replay finished; the history is never needed again
                this.buf.advance(this.cursor);
                this.cursor = 0;
            }
            return Poll::Ready(Ok(()));
        }

        if !this.recording {
            return Pin::new(&mut this.inner).poll_read(cx, out);
        }

        if out.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        let room = this.capacity - this.buf.len();
        if room == 0 {
            this.overflowed = true;
            return Poll::Ready(Err(capacity_error(this.capacity)));
        }

        // Never pull more from the network than the window can hold.
        let limit = room.min(out.remaining());
        let mut scratch = vec![0u8; limit];
        let mut chunk = ReadBuf::new(&mut scratch);
        match Pin::new(&mut this.inner).poll_read(cx, &mut chunk) {
            Poll::Ready(Ok(())) => {
                this.buf.extend_from_slice(chunk.filled());
                this.cursor = this.buf.len();
                out.put_slice(chunk.filled());
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for RewindStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
