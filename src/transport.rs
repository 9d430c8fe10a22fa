//! Substrate contract and length-prefixed framing
//!
//! Frame layout: `[kind: u8][len: u32 BE][payload]`, kind 0 = control letter,
//! kind 1 = binary chunk.

use bytes::{Bytes, BytesMut};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest payload accepted from a peer.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const KIND_CONTROL: u8 = 0;
const KIND_BINARY: u8 = 1;
const HEADER_LEN: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// An encoded letter envelope.
    Control(Bytes),
    /// Raw file payload.
    Binary(Bytes),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection closed by peer")]
    Closed,
    #[error("no frame received within {0:?}")]
    TimedOut(Duration),
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("unknown frame kind {0}")]
    UnknownKind(u8),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// What a transfer session needs from the connection underneath it.
pub trait Connection: Send {
    fn transmit(&mut self, frame: Frame) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Wait for the next complete frame, bounded by the configured timeout.
    fn receive(&mut self) -> impl Future<Output = Result<Frame, TransportError>> + Send;

    fn set_timeout(&mut self, timeout: Option<Duration>);

    fn is_alive(&self) -> bool;

    /// Finish the sending side; frames already transmitted are still delivered
    /// and receiving keeps working.
    fn close(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// [`Connection`] over any pair of async byte streams.
pub struct FramedConnection<R, W> {
    reader: R,
    writer: W,
    timeout: Option<Duration>,
    alive: bool,
}

impl<R, W> FramedConnection<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            timeout: None,
            alive: true,
        }
    }

    async fn read_frame(&mut self) -> Result<Frame, TransportError> {
        let mut header = [0u8; HEADER_LEN];
        match self.reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(TransportError::Closed);
            }
            Err(e) => return Err(e.into()),
        }

        let kind = header[0];
        let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(TransportError::FrameTooLarge {
                len,
                max: MAX_FRAME_LEN,
            });
        }

        let mut payload = BytesMut::zeroed(len);
        match self.reader.read_exact(&mut payload).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(TransportError::Closed);
            }
            Err(e) => return Err(e.into()),
        }
        let payload = payload.freeze();

        match kind {
            KIND_CONTROL => Ok(Frame::Control(payload)),
            KIND_BINARY => Ok(Frame::Binary(payload)),
            other => Err(TransportError::UnknownKind(other)),
        }
    }

    async fn write_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
        let (kind, payload) = match frame {
            Frame::Control(b) => (KIND_CONTROL, b),
            Frame::Binary(b) => (KIND_BINARY, b),
        };
        if payload.len() > MAX_FRAME_LEN {
            return Err(TransportError::FrameTooLarge {
                len: payload.len(),
                max: MAX_FRAME_LEN,
            });
        }

        let mut header = [0u8; HEADER_LEN];
        header[0] = kind;
        header[1..].copy_from_slice(&(payload.len() as u32).to_be_bytes());
        self.writer.write_all(&header).await?;
        self.writer.write_all(&payload).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

impl<R, W> Connection for FramedConnection<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn transmit(&mut self, frame: Frame) -> Result<(), TransportError> {
        let limit = self.timeout;
        let result = bounded(limit, self.write_frame(frame)).await;
        if result.is_err() {
            self.alive = false;
        }
        result
    }

    async fn receive(&mut self) -> Result<Frame, TransportError> {
        let limit = self.timeout;
        let result = bounded(limit, self.read_frame()).await;
        if result.is_err() {
            self.alive = false;
        }
        result
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    fn is_alive(&self) -> bool {
        self.alive
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let limit = self.timeout;
        bounded(limit, async { self.writer.shutdown().await.map_err(TransportError::from) }).await
    }
}

/// Run `op`, giving up after `limit` when one is set.
async fn bounded<T>(
    limit: Option<Duration>,
    op: impl Future<Output = Result<T, TransportError>>,
) -> Result<T, TransportError> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, op)
            .await
            .unwrap_or(Err(TransportError::TimedOut(limit))),
        None => op.await,
    }
}
