//! Per-connection transfer state machines

pub mod client;
pub mod server;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::{self, CodecError, Letter};
use crate::transport::{Connection, Frame, TransportError};

pub use client::{ClientSession, Intent, TransferReport};
pub use server::{ServerOutcome, ServerSession};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("file I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected `{tag}` letter while {state}")]
    UnexpectedLetter { state: &'static str, tag: String },
    #[error("unexpected binary frame while {state}")]
    UnexpectedBinary { state: &'static str },
    #[error("peer closed the exchange while {state}")]
    PeerClosed { state: &'static str },
    #[error("source ended after {actual} of {expected} bytes")]
    SourceTruncated { expected: u64, actual: u64 },
}

impl SessionError {
    pub(crate) fn unexpected(state: &'static str, letter: &Letter) -> Self {
        SessionError::UnexpectedLetter {
            state,
            tag: letter.tag().to_string(),
        }
    }
}

pub(crate) async fn send_letter<C: Connection>(conn: &mut C, letter: &Letter) -> Result<(), SessionError> {
    let bytes = protocol::encode(letter)?;
    tracing::trace!("-> {}", letter.tag());
    conn.transmit(Frame::Control(Bytes::from(bytes))).await?;
    Ok(())
}

/// Receive one control frame and decode it. A binary frame here is a
/// protocol violation.
pub(crate) async fn receive_letter<C: Connection>(
    conn: &mut C,
    state: &'static str,
) -> Result<Letter, SessionError> {
    match conn.receive().await? {
        Frame::Control(bytes) => {
            let letter = protocol::decode(&bytes)?;
            tracing::trace!("<- {}", letter.tag());
            Ok(letter)
        }
        Frame::Binary(_) => Err(SessionError::UnexpectedBinary { state }),
    }
}

/// Best-effort `ConnectionClose`; the exchange is over either way.
pub(crate) async fn say_goodbye<C: Connection>(conn: &mut C) {
    if !conn.is_alive() {
        return;
    }
    if let Err(e) = send_letter(conn, &Letter::ConnectionClose).await {
        tracing::debug!("Could not send close letter: {}", e);
    }
}

/// Wait for the peer to finish its sending side, so a transport close on our
/// end cannot cut off frames it has not processed yet.
pub(crate) async fn await_peer_finish<C: Connection>(conn: &mut C) {
    while conn.is_alive() {
        match conn.receive().await {
            Ok(Frame::Control(bytes) | Frame::Binary(bytes)) => {
                tracing::debug!("Ignoring {} byte frame after the exchange", bytes.len())
            }
            Err(TransportError::Closed) => break,
            Err(e) => {
                tracing::debug!("Stopped waiting for peer to finish: {}", e);
                break;
            }
        }
    }
}

/// Read up to `limit` bytes, filling the chunk unless the source ends first.
pub(crate) async fn read_chunk<R: AsyncRead + Unpin>(source: &mut R, limit: usize) -> std::io::Result<Bytes> {
    let mut buf = BytesMut::zeroed(limit);
    let mut filled = 0;
    while filled < limit {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf.freeze())
}

/// Write `chunk` and flush, so the bytes have left our buffers before the
/// caller acknowledges them.
pub(crate) async fn write_through<W: AsyncWrite + Unpin>(sink: &mut W, chunk: &[u8]) -> std::io::Result<()> {
    sink.write_all(chunk).await?;
    sink.flush().await
}

#[cfg(test)]
mod tests;
