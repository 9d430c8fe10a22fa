//! QUIC substrate: one bidirectional stream per connection

use anyhow::Result;
use quinn::{Endpoint, RecvStream, SendStream, TransportConfig, VarInt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::tls;
use crate::transport::FramedConnection;

pub type QuicConnection = FramedConnection<RecvStream, SendStream>;

fn transport_config(idle: Duration, peer_streams: u32) -> TransportConfig {
    let idle_ms = u32::try_from(idle.as_millis()).unwrap_or(u32::MAX);
    let mut transport = TransportConfig::default();
    transport
        .max_concurrent_bidi_streams(peer_streams.into())
        .max_concurrent_uni_streams(0u32.into())
        .max_idle_timeout(Some(VarInt::from_u32(idle_ms).into()))
        .keep_alive_interval(Some(idle / 3));
    transport
}

/// Bind a listening endpoint with a fresh self-signed identity.
pub fn listen(addr: SocketAddr, idle: Duration) -> Result<Endpoint> {
    let identity = tls::generate_identity()?;
    let mut config = quinn::ServerConfig::with_crypto(Arc::new(tls::server_crypto(identity)?));
    config.transport_config(Arc::new(transport_config(idle, 1)));
    Ok(Endpoint::server(config, addr)?)
}

pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| anyhow::anyhow!("Could not resolve {}:{}", host, port))
}

/// Client side of an established connection, kept until the exchange is over.
pub struct Link {
    endpoint: Endpoint,
    connection: quinn::Connection,
}

impl Link {
    /// Close the connection and let the close frame reach the peer.
    pub async fn finish(self) {
        self.connection.close(0u32.into(), b"done");
        self.endpoint.wait_idle().await;
    }
}

/// Dial `host:port` and open the transfer stream.
pub async fn connect(host: &str, port: u16, idle: Duration) -> Result<(Link, QuicConnection)> {
    let addr = resolve(host, port).await?;
    let bind: SocketAddr = if addr.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" }.parse()?;

    let mut config = quinn::ClientConfig::new(Arc::new(tls::client_crypto()?));
    config.transport_config(Arc::new(transport_config(idle, 0)));

    let mut endpoint = Endpoint::client(bind)?;
    endpoint.set_default_client_config(config);

    let connecting = endpoint.connect(addr, tls::SERVER_NAME)?;
    let connection = tokio::time::timeout(idle, connecting)
        .await
        .map_err(|_| anyhow::anyhow!("Timed out connecting to {}", addr))??;
    tracing::info!("🔗 Connected to {}:{}", host, port);

    let (send, recv) = connection.open_bi().await?;
    Ok((Link { endpoint, connection }, FramedConnection::new(recv, send)))
}
