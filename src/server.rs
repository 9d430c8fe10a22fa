//! Listener - accepts connections and runs one server session per connection

use anyhow::Result;
use quinn::Endpoint;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::audit::{self, AuditEntry, AuditEvent, AuditSink};
use crate::config::Settings;
use crate::quic;
use crate::session::server::ServerOptions;
use crate::session::{ServerOutcome, ServerSession};
use crate::transport::FramedConnection;

pub async fn run(
    settings: &Settings,
    host: &str,
    port: u16,
    root: Option<PathBuf>,
    audit_log: Option<PathBuf>,
) -> Result<()> {
    let options = settings.server_options(root);
    if let Some(root) = &options.root {
        tokio::fs::create_dir_all(root).await?;
        tracing::info!("📁 Root: {:?}", root);
    }

    let audit = match audit_log {
        Some(path) => {
            tracing::info!("📋 Audit log: {:?}", path);
            audit::start(path).await?
        }
        None => AuditSink::disabled(),
    };

    let addr = quic::resolve(host, port).await?;
    let endpoint = quic::listen(addr, settings.timeout)?;
    let local = endpoint.local_addr()?;
    tracing::info!("🚀 Listening on {}", local);
    audit
        .record(AuditEntry::event(AuditEvent::ListenerStart).note(format!("bind={}", local)))
        .await;

    serve(endpoint, options, audit).await
}

/// Accept connections until the endpoint is closed.
pub async fn serve(endpoint: Endpoint, options: ServerOptions, audit: AuditSink) -> Result<()> {
    while let Some(incoming) = endpoint.accept().await {
        let options = options.clone();
        let audit = audit.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(incoming, options, audit).await {
                tracing::error!("Connection error: {}", e);
            }
        });
    }

    Ok(())
}

async fn handle_connection(incoming: quinn::Incoming, options: ServerOptions, audit: AuditSink) -> Result<()> {
    let connection = incoming.await?;
    let remote = connection.remote_address();
    connection_opened(remote, &audit).await;

    let result = exchange(&connection, options, remote, &audit).await;

    connection_closed(remote, &audit).await;
    result
}

async fn exchange(
    connection: &quinn::Connection,
    options: ServerOptions,
    remote: SocketAddr,
    audit: &AuditSink,
) -> Result<()> {
    let (send, recv) = match connection.accept_bi().await {
        Ok(stream) => stream,
        Err(quinn::ConnectionError::ApplicationClosed(_)) => {
            tracing::debug!("{} closed before starting an exchange", remote);
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let linger = options.timeout;
    let outcome = ServerSession::new(FramedConnection::new(recv, send), options).run().await;
    match &outcome {
        ServerOutcome::Failed(e) => tracing::warn!("Session with {} failed: {}", remote, e),
        ServerOutcome::PeerClosed { during } => {
            tracing::info!("{} ended the exchange while {}", remote, during)
        }
        _ => {}
    }
    audit.record(AuditEntry::from_outcome(&outcome).peer(remote)).await;

    // Let the client read our last frames and close on its side.
    if let Some(linger) = linger {
        let _ = tokio::time::timeout(linger, connection.closed()).await;
    } else {
        connection.closed().await;
    }
    Ok(())
}

async fn connection_opened(remote: SocketAddr, audit: &AuditSink) {
    tracing::info!("📥 Connection opened from {}", remote);
    audit.record(AuditEntry::event(AuditEvent::Connect).peer(remote)).await;
}

async fn connection_closed(remote: SocketAddr, audit: &AuditSink) {
    tracing::info!("Connection closed from {}", remote);
    audit.record(AuditEntry::event(AuditEvent::Disconnect).peer(remote)).await;
}
