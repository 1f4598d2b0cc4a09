//! [`LinkTransport`] over any tokio byte stream.
//!
//! Bytes read past a terminator stay buffered for the next call, so an
//! LRC that arrives in the same chunk as its ETX is not lost.
//!
//! # Example
//!
//! ```ignore
//! use visa1_link::transport::StreamTransport;
//!
//! let port = tokio_serial::new("/dev/ttyS1", 1200).open_native_async()?;
//! let transport = StreamTransport::new(port);
//! ```

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use super::LinkTransport;
use crate::error::{LinkError, Result};

/// Size of a single read from the underlying stream.
const READ_CHUNK: usize = 512;

/// Buffered adapter from an async byte stream to [`LinkTransport`].
pub struct StreamTransport<S> {
    stream: S,
    pending: BytesMut,
}

/// What a single fill attempt produced.
enum Fill {
    Data,
    TimedOut,
    Eof,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap a connected stream.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            pending: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Number of bytes read from the stream but not yet consumed.
    #[inline]
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Get a reference to the underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Unwrap the stream, dropping buffered input.
    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Pull one chunk from the stream into the buffer, bounded by `deadline`.
    ///
    /// An already-passed deadline still polls the stream once, so data that
    /// is ready is picked up.
    async fn fill(&mut self, deadline: Instant) -> Result<Fill> {
        let mut chunk = [0u8; READ_CHUNK];
        match tokio::time::timeout_at(deadline, self.stream.read(&mut chunk)).await {
            Ok(Ok(0)) => Ok(Fill::Eof),
            Ok(Ok(n)) => {
                self.pending.extend_from_slice(&chunk[..n]);
                Ok(Fill::Data)
            }
            Ok(Err(e)) => Err(LinkError::Io(e)),
            Err(_) => Ok(Fill::TimedOut),
        }
    }

    fn take_pending(&mut self) -> Vec<u8> {
        self.pending.split().to_vec()
    }
}

impl<S> LinkTransport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data).await?;
        Ok(())
    }

    async fn flush_outgoing(&mut self) -> Result<()> {
        self.stream.flush().await?;
        Ok(())
    }

    async fn flush_incoming(&mut self) -> Result<()> {
        self.pending.clear();
        loop {
            let mut chunk = [0u8; READ_CHUNK];
            match tokio::time::timeout(Duration::ZERO, self.stream.read(&mut chunk)).await {
                Ok(Ok(0)) | Err(_) => return Ok(()),
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => return Err(LinkError::Io(e)),
            }
        }
    }

    async fn read_until(
        &mut self,
        terminators: &[u8],
        timeout: Duration,
        include_terminator: bool,
    ) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut scanned = 0;

        loop {
            if let Some(pos) = self.pending[scanned..]
                .iter()
                .position(|b| terminators.contains(b))
            {
                let end = scanned + pos + 1;
                let mut chunk = self.pending.split_to(end);
                if !include_terminator {
                    chunk.truncate(end - 1);
                }
                return Ok(chunk.to_vec());
            }
            scanned = self.pending.len();

            match self.fill(deadline).await? {
                Fill::Data => continue,
                Fill::TimedOut => return Ok(self.take_pending()),
                Fill::Eof if self.pending.is_empty() => return Err(LinkError::ConnectionClosed),
                Fill::Eof => return Ok(self.take_pending()),
            }
        }
    }

    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        if self.pending.is_empty() {
            match self.fill(Instant::now() + timeout).await? {
                Fill::Data => {}
                Fill::TimedOut => return Ok(0),
                Fill::Eof => return Err(LinkError::ConnectionClosed),
            }
        }
        let n = buf.len().min(self.pending.len());
        let chunk = self.pending.split_to(n);
        buf[..n].copy_from_slice(&chunk);
        Ok(n)
    }
}
