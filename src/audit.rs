//! Listener audit trail (JSON lines)

use anyhow::Result;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::session::ServerOutcome;

/// One line of the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: DateTime<Local>,
    pub event: AuditEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer: Option<SocketAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    ListenerStart,
    Connect,
    Disconnect,
    UploadReceived,
    UploadRejected,
    DownloadServed,
    DownloadRejected,
    DownloadDeclined,
    SessionAborted,
}

impl AuditEntry {
    pub fn event(event: AuditEvent) -> Self {
        Self {
            at: Local::now(),
            event,
            peer: None,
            path: None,
            bytes: None,
            ok: true,
            detail: None,
        }
    }

    /// Summarize how a server session ended.
    pub fn from_outcome(outcome: &ServerOutcome) -> Self {
        match outcome {
            ServerOutcome::Uploaded { path, bytes } => {
                Self::event(AuditEvent::UploadReceived).file(path, Some(*bytes))
            }
            ServerOutcome::Downloaded { path, bytes } => {
                Self::event(AuditEvent::DownloadServed).file(path, Some(*bytes))
            }
            ServerOutcome::UploadRejected { path, reason } => {
                Self::event(AuditEvent::UploadRejected).file(path, None).failed(reason)
            }
            ServerOutcome::DownloadRejected { path, reason } => {
                Self::event(AuditEvent::DownloadRejected).file(path, None).failed(reason)
            }
            ServerOutcome::DownloadDeclined { path, reply } => {
                Self::event(AuditEvent::DownloadDeclined).file(path, None).failed(reply)
            }
            ServerOutcome::PeerClosed { during } => {
                Self::event(AuditEvent::SessionAborted).failed(format!("peer closed while {}", during))
            }
            ServerOutcome::Failed(e) => Self::event(AuditEvent::SessionAborted).failed(e.to_string()),
        }
    }

    pub fn peer(mut self, addr: SocketAddr) -> Self {
        self.peer = Some(addr);
        self
    }

    pub fn file(mut self, path: &str, bytes: Option<u64>) -> Self {
        self.path = Some(path.to_string());
        self.bytes = bytes;
        self
    }

    pub fn note(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn failed(self, detail: impl Into<String>) -> Self {
        Self { ok: false, ..self.note(detail) }
    }
}

impl fmt::Display for AuditEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.event)?;
        if let Some(peer) = self.peer {
            write!(f, " peer={}", peer)?;
        }
        if let Some(path) = &self.path {
            write!(f, " path={}", path)?;
        }
        if let Some(bytes) = self.bytes {
            write!(f, " bytes={}", bytes)?;
        }
        match (&self.detail, self.ok) {
            (Some(detail), true) => write!(f, " ({})", detail),
            (Some(detail), false) => write!(f, " failed: {}", detail),
            (None, true) => Ok(()),
            (None, false) => write!(f, " failed"),
        }
    }
}

/// Cloneable handle for recording entries; a no-op when auditing is off.
#[derive(Debug, Clone, Default)]
pub struct AuditSink {
    tx: Option<mpsc::Sender<AuditEntry>>,
}

impl AuditSink {
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub async fn record(&self, entry: AuditEntry) {
        tracing::debug!("audit: {}", entry);
        if let Some(tx) = &self.tx {
            if tx.send(entry).await.is_err() {
                tracing::warn!("Audit writer has stopped; entry dropped");
            }
        }
    }
}

/// Open `log_path` for appending and start the background writer.
pub async fn start(log_path: PathBuf) -> Result<AuditSink> {
    if let Some(parent) = log_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file = OpenOptions::new().create(true).append(true).open(&log_path).await?;
    let (tx, rx) = mpsc::channel::<AuditEntry>(100);
    tokio::spawn(write_entries(file, rx));
    Ok(AuditSink { tx: Some(tx) })
}

async fn write_entries(mut file: File, mut rx: mpsc::Receiver<AuditEntry>) {
    while let Some(entry) = rx.recv().await {
        let mut line = match serde_json::to_vec(&entry) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!("Cannot serialize audit entry: {}", e);
                continue;
            }
        };
        line.push(b'\n');
        let written = match file.write_all(&line).await {
            Ok(()) => file.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            tracing::error!("Failed to write audit log: {}", e);
        }
    }
}
