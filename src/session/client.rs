//! Initiating end of a transfer

use std::path::PathBuf;
use std::time::Duration;

use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::{
    await_peer_finish, read_chunk, receive_letter, say_goodbye, send_letter, write_through, SessionError,
};
use crate::progress::Progress;
use crate::protocol::{self, Letter};
use crate::transport::{Connection, Frame};

/// What the client wants from this connection, fixed before the exchange starts.
#[derive(Debug)]
pub enum Intent {
    Upload {
        source: fs::File,
        size: u64,
        destination: String,
    },
    Download {
        source: String,
        destination: PathBuf,
    },
}

/// Result of an exchange that followed the protocol to its end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferReport {
    Completed { bytes: u64 },
    Rejected { reason: String },
}

enum State {
    Idle(Intent),
    AwaitingUploadReply { source: fs::File, size: u64 },
    Uploading { source: fs::File, size: u64 },
    AwaitingDownloadReply { destination: PathBuf },
    Downloading { sink: fs::File, size: u64 },
    Finished(TransferReport),
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::Idle(_) => "idle",
            State::AwaitingUploadReply { .. } => "awaiting upload reply",
            State::Uploading { .. } => "uploading",
            State::AwaitingDownloadReply { .. } => "awaiting download reply",
            State::Downloading { .. } => "downloading",
            State::Finished(_) => "finished",
        }
    }
}

pub struct ClientSession<C> {
    conn: C,
    intent: Intent,
    chunk_size: usize,
    progress: Progress,
}

impl<C: Connection> ClientSession<C> {
    pub fn new(mut conn: C, intent: Intent, chunk_size: usize, timeout: Option<Duration>) -> Self {
        conn.set_timeout(timeout);
        Self {
            conn,
            intent,
            chunk_size,
            progress: Progress::new(),
        }
    }

    /// Read-only view of the byte counter, valid while `run` is in flight.
    pub fn progress(&self) -> Progress {
        self.progress.clone()
    }

    /// Run the exchange. A `ConnectionClose` is sent on every exit path the
    /// connection still allows, then the peer is given the chance to finish.
    pub async fn run(self) -> Result<TransferReport, SessionError> {
        let Self {
            mut conn,
            intent,
            chunk_size,
            progress,
        } = self;
        let mut machine = Machine {
            conn: &mut conn,
            chunk_size,
            progress,
        };

        let mut state = State::Idle(intent);
        let result = loop {
            if let State::Finished(report) = state {
                break Ok(report);
            }
            let name = state.name();
            tracing::debug!("Client session: {}", name);
            match machine.step(state).await {
                Ok(next) => state = next,
                Err(e) => {
                    tracing::debug!("Client session failed while {}: {}", name, e);
                    break Err(e);
                }
            }
        };

        say_goodbye(&mut conn).await;
        if let Err(e) = conn.close().await {
            tracing::debug!("Could not finish sending side: {}", e);
        }
        await_peer_finish(&mut conn).await;
        result
    }
}

struct Machine<'a, C> {
    conn: &'a mut C,
    chunk_size: usize,
    progress: Progress,
}

impl<C: Connection> Machine<'_, C> {
    async fn step(&mut self, state: State) -> Result<State, SessionError> {
        match state {
            State::Idle(intent) => self.begin(intent).await,
            State::AwaitingUploadReply { source, size } => self.await_upload_reply(source, size).await,
            State::Uploading { source, size } => self.upload(source, size).await,
            State::AwaitingDownloadReply { destination } => self.await_download_reply(destination).await,
            State::Downloading { sink, size } => self.download(sink, size).await,
            finished @ State::Finished(_) => Ok(finished),
        }
    }

    async fn begin(&mut self, intent: Intent) -> Result<State, SessionError> {
        match intent {
            Intent::Upload {
                source,
                size,
                destination,
            } => {
                send_letter(&mut *self.conn, &Letter::upload_request(size, destination)).await?;
                Ok(State::AwaitingUploadReply { source, size })
            }
            Intent::Download { source, destination } => {
                send_letter(&mut *self.conn, &Letter::download_request(source)).await?;
                Ok(State::AwaitingDownloadReply { destination })
            }
        }
    }

    async fn await_upload_reply(&mut self, source: fs::File, size: u64) -> Result<State, SessionError> {
        const STATE: &str = "awaiting upload reply";
        match receive_letter(&mut *self.conn, STATE).await? {
            Letter::Confirmation => Ok(State::Uploading { source, size }),
            Letter::Rejection(rejection) => Ok(State::Finished(TransferReport::Rejected {
                reason: rejection.reason,
            })),
            Letter::ConnectionClose => Err(SessionError::PeerClosed { state: STATE }),
            other => Err(SessionError::unexpected(STATE, &other)),
        }
    }

    /// Stream the source; the server acknowledges every chunk and the last
    /// acknowledgment doubles as the completion confirmation.
    async fn upload(&mut self, mut source: fs::File, size: u64) -> Result<State, SessionError> {
        const STATE: &str = "uploading";
        self.progress.begin(size);
        let mut sent = 0u64;

        while sent < size {
            let limit = std::cmp::min(self.chunk_size as u64, size - sent) as usize;
            let chunk = read_chunk(&mut source, limit).await?;
            if chunk.is_empty() {
                return Err(SessionError::SourceTruncated {
                    expected: size,
                    actual: sent,
                });
            }
            let len = chunk.len() as u64;
            self.conn.transmit(Frame::Binary(chunk)).await?;

            match receive_letter(&mut *self.conn, STATE).await? {
                Letter::Confirmation => {}
                Letter::Rejection(rejection) => {
                    return Ok(State::Finished(TransferReport::Rejected {
                        reason: rejection.reason,
                    }));
                }
                Letter::ConnectionClose => return Err(SessionError::PeerClosed { state: STATE }),
                other => return Err(SessionError::unexpected(STATE, &other)),
            }
            sent = self.progress.advance(len);
        }

        self.progress.finish();
        Ok(State::Finished(TransferReport::Completed { bytes: sent }))
    }

    async fn await_download_reply(&mut self, destination: PathBuf) -> Result<State, SessionError> {
        const STATE: &str = "awaiting download reply";
        let size = match receive_letter(&mut *self.conn, STATE).await? {
            Letter::DownloadConfirmation(confirmation) => confirmation.file_size,
            Letter::Rejection(rejection) => {
                return Ok(State::Finished(TransferReport::Rejected {
                    reason: rejection.reason,
                }));
            }
            Letter::ConnectionClose => return Err(SessionError::PeerClosed { state: STATE }),
            other => return Err(SessionError::unexpected(STATE, &other)),
        };

        let sink = match fs::File::create(&destination).await {
            Ok(sink) => sink,
            Err(e) => {
                let reason = format!("cannot write {}: {}", destination.display(), e);
                send_letter(&mut *self.conn, &Letter::rejection(reason)).await?;
                return Err(e.into());
            }
        };
        send_letter(&mut *self.conn, &Letter::Confirmation).await?;
        Ok(State::Downloading { sink, size })
    }

    async fn download(&mut self, mut sink: fs::File, size: u64) -> Result<State, SessionError> {
        const STATE: &str = "downloading";
        self.progress.begin(size);
        let mut received = 0u64;

        while received < size {
            match self.conn.receive().await? {
                Frame::Binary(chunk) => {
                    write_through(&mut sink, &chunk).await?;
                    received = self.progress.advance(chunk.len() as u64);
                }
                Frame::Control(bytes) => {
                    sink.flush().await?;
                    return match protocol::decode(&bytes)? {
                        Letter::ConnectionClose => Err(SessionError::PeerClosed { state: STATE }),
                        other => Err(SessionError::unexpected(STATE, &other)),
                    };
                }
            }
        }

        drop(sink);
        send_letter(&mut *self.conn, &Letter::Confirmation).await?;
        self.progress.finish();
        Ok(State::Finished(TransferReport::Completed { bytes: received }))
    }
}
