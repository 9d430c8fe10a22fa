//! Responding end of a transfer: receives uploads, serves downloads

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::{read_chunk, receive_letter, say_goodbye, send_letter, write_through, SessionError};
use crate::progress::Progress;
use crate::protocol::{self, DownloadRequest, Letter, UploadRequest};
use crate::transport::{Connection, Frame};

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Size of each binary frame when serving a download.
    pub chunk_size: usize,
    pub timeout: Option<Duration>,
    /// Confine requested paths beneath this directory.
    pub root: Option<PathBuf>,
}

/// How a server session ended.
#[derive(Debug)]
pub enum ServerOutcome {
    Uploaded { path: String, bytes: u64 },
    UploadRejected { path: String, reason: String },
    Downloaded { path: String, bytes: u64 },
    DownloadRejected { path: String, reason: String },
    /// The client answered the download offer with something other than a confirmation.
    DownloadDeclined { path: String, reply: String },
    PeerClosed { during: &'static str },
    Failed(SessionError),
}

enum State {
    Idle,
    AwaitingIntent,
    UploadReceiving {
        file: fs::File,
        path: String,
        size: u64,
    },
    AwaitingDownloadAccept {
        local: PathBuf,
        path: String,
        size: u64,
    },
    DownloadSending {
        local: PathBuf,
        path: String,
        size: u64,
    },
    Closed(ServerOutcome),
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::Idle => "idle",
            State::AwaitingIntent => "awaiting intent",
            State::UploadReceiving { .. } => "receiving upload",
            State::AwaitingDownloadAccept { .. } => "awaiting download acceptance",
            State::DownloadSending { .. } => "sending download",
            State::Closed(_) => "closed",
        }
    }
}

pub struct ServerSession<C> {
    conn: C,
    options: ServerOptions,
    progress: Progress,
}

impl<C: Connection> ServerSession<C> {
    pub fn new(mut conn: C, options: ServerOptions) -> Self {
        conn.set_timeout(options.timeout);
        Self {
            conn,
            options,
            progress: Progress::new(),
        }
    }

    /// Drive the exchange to completion. Never fails; the outcome says how it ended.
    pub async fn run(mut self) -> ServerOutcome {
        let mut state = State::Idle;
        loop {
            if let State::Closed(outcome) = state {
                if let Err(e) = self.conn.close().await {
                    tracing::debug!("Could not finish sending side: {}", e);
                }
                return outcome;
            }
            let name = state.name();
            tracing::debug!("Server session: {}", name);
            state = match self.step(state).await {
                Ok(next) => next,
                Err(e) => {
                    tracing::debug!("Server session failed while {}: {}", name, e);
                    State::Closed(ServerOutcome::Failed(e))
                }
            };
        }
    }

    async fn step(&mut self, state: State) -> Result<State, SessionError> {
        match state {
            State::Idle => Ok(State::AwaitingIntent),
            State::AwaitingIntent => self.await_intent().await,
            State::UploadReceiving { file, path, size } => self.receive_upload(file, path, size).await,
            State::AwaitingDownloadAccept { local, path, size } => {
                self.await_download_accept(local, path, size).await
            }
            State::DownloadSending { local, path, size } => self.send_download(local, path, size).await,
            closed @ State::Closed(_) => Ok(closed),
        }
    }

    async fn await_intent(&mut self) -> Result<State, SessionError> {
        const STATE: &str = "awaiting intent";
        match receive_letter(&mut self.conn, STATE).await? {
            Letter::UploadRequest(request) => self.open_upload(request).await,
            Letter::DownloadRequest(request) => self.offer_download(request).await,
            Letter::ConnectionClose => Ok(State::Closed(ServerOutcome::PeerClosed { during: STATE })),
            Letter::Opaque(opaque) => {
                tracing::warn!("Unrecognized `{}` letter: {:?}", opaque.tag, opaque.fields);
                Err(SessionError::UnexpectedLetter {
                    state: STATE,
                    tag: opaque.tag,
                })
            }
            other => Err(SessionError::unexpected(STATE, &other)),
        }
    }

    async fn open_upload(&mut self, request: UploadRequest) -> Result<State, SessionError> {
        let UploadRequest {
            file_size,
            destination_path,
        } = request;

        let opened = match self.resolve(&destination_path) {
            Ok(local) => fs::File::create(&local)
                .await
                .map_err(|e| format!("cannot write {}: {}", destination_path, e)),
            Err(reason) => Err(reason),
        };

        match opened {
            Ok(file) => {
                tracing::info!("📝 Receiving: {} ({} bytes)", destination_path, file_size);
                send_letter(&mut self.conn, &Letter::Confirmation).await?;
                self.progress.begin(file_size);
                Ok(State::UploadReceiving {
                    file,
                    path: destination_path,
                    size: file_size,
                })
            }
            Err(reason) => {
                tracing::warn!("Rejecting upload: {}", reason);
                send_letter(&mut self.conn, &Letter::rejection(reason.clone())).await?;
                Ok(State::Closed(ServerOutcome::UploadRejected {
                    path: destination_path,
                    reason,
                }))
            }
        }
    }

    async fn receive_upload(&mut self, mut file: fs::File, path: String, size: u64) -> Result<State, SessionError> {
        const STATE: &str = "receiving upload";
        let mut received = 0u64;

        while received < size {
            let chunk = match self.conn.receive().await? {
                Frame::Binary(chunk) => chunk,
                Frame::Control(bytes) => {
                    file.flush().await?;
                    return match protocol::decode(&bytes)? {
                        Letter::ConnectionClose => {
                            tracing::warn!("Upload of {} abandoned after {} bytes", path, received);
                            Ok(State::Closed(ServerOutcome::PeerClosed { during: STATE }))
                        }
                        other => Err(SessionError::unexpected(STATE, &other)),
                    };
                }
            };

            received = self.progress.advance(chunk.len() as u64);
            // The acknowledgment promises the chunk is on disk.
            if let Err(e) = write_through(&mut file, &chunk).await {
                let reason = format!("write to {} failed: {}", path, e);
                send_letter(&mut self.conn, &Letter::rejection(reason)).await?;
                return Err(e.into());
            }
            send_letter(&mut self.conn, &Letter::Confirmation).await?;
            tracing::debug!("Received {}/{} bytes ({}%)", received, size, self.progress.percent());
        }

        drop(file);
        self.progress.finish();

        tracing::info!("✅ Written: {} ({} bytes)", path, received);
        Ok(State::Closed(ServerOutcome::Uploaded { path, bytes: received }))
    }

    async fn offer_download(&mut self, request: DownloadRequest) -> Result<State, SessionError> {
        let DownloadRequest { download_path } = request;

        let probed = match self.resolve(&download_path) {
            Ok(local) => match fs::metadata(&local).await {
                Ok(meta) if meta.is_file() => Ok((local, meta.len())),
                Ok(_) => Err(format!("{} is not a regular file", download_path)),
                Err(e) => Err(format!("cannot read {}: {}", download_path, e)),
            },
            Err(reason) => Err(reason),
        };

        match probed {
            Ok((local, size)) => {
                send_letter(&mut self.conn, &Letter::download_confirmation(size)).await?;
                Ok(State::AwaitingDownloadAccept {
                    local,
                    path: download_path,
                    size,
                })
            }
            Err(reason) => {
                tracing::warn!("Rejecting download: {}", reason);
                send_letter(&mut self.conn, &Letter::rejection(reason.clone())).await?;
                Ok(State::Closed(ServerOutcome::DownloadRejected {
                    path: download_path,
                    reason,
                }))
            }
        }
    }

    async fn await_download_accept(&mut self, local: PathBuf, path: String, size: u64) -> Result<State, SessionError> {
        const STATE: &str = "awaiting download acceptance";
        let next = match receive_letter(&mut self.conn, STATE).await? {
            Letter::Confirmation => State::DownloadSending { local, path, size },
            Letter::ConnectionClose => State::Closed(ServerOutcome::PeerClosed { during: STATE }),
            Letter::Rejection(rejection) => State::Closed(ServerOutcome::DownloadDeclined {
                path,
                reply: rejection.reason,
            }),
            other => State::Closed(ServerOutcome::DownloadDeclined {
                path,
                reply: format!("unexpected `{}` letter", other.tag()),
            }),
        };
        Ok(next)
    }

    async fn send_download(&mut self, local: PathBuf, path: String, size: u64) -> Result<State, SessionError> {
        const STATE: &str = "finishing download";
        tracing::info!("📤 Sending: {} ({} bytes)", path, size);

        let mut file = fs::File::open(&local).await?;
        self.progress.begin(size);
        let mut sent = 0u64;

        while sent < size {
            let limit = std::cmp::min(self.options.chunk_size as u64, size - sent) as usize;
            let chunk = read_chunk(&mut file, limit).await?;
            if chunk.is_empty() {
                say_goodbye(&mut self.conn).await;
                return Err(SessionError::SourceTruncated {
                    expected: size,
                    actual: sent,
                });
            }
            self.conn.transmit(Frame::Binary(chunk.clone())).await?;
            sent = self.progress.advance(chunk.len() as u64);
            tracing::debug!("Sent {}/{} bytes ({}%)", sent, size, self.progress.percent());
        }
        drop(file);

        match receive_letter(&mut self.conn, STATE).await? {
            Letter::Confirmation => {}
            other => tracing::warn!("Download of {} ended with `{}` instead of a confirmation", path, other.tag()),
        }
        self.progress.finish();

        tracing::info!("✅ Served: {} ({} bytes)", path, sent);
        Ok(State::Closed(ServerOutcome::Downloaded { path, bytes: sent }))
    }

    fn resolve(&self, requested: &str) -> Result<PathBuf, String> {
        resolve_under(self.options.root.as_deref(), requested)
    }
}

/// Map a requested path onto local disk, refusing to leave `root` when one is set.
fn resolve_under(root: Option<&Path>, requested: &str) -> Result<PathBuf, String> {
    let Some(root) = root else {
        return Ok(PathBuf::from(requested));
    };
    let relative = Path::new(requested.trim_start_matches('/'));
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(format!("{} escapes the served directory", requested));
    }
    Ok(root.join(relative))
}
