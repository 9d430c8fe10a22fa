//! Transfer orchestration - resolves paths, connects, runs one client session

use anyhow::Result;

use crate::config::Settings;
use crate::path;
use crate::plan::{Direction, TransferPlan};
use crate::progress;
use crate::quic;
use crate::session::{ClientSession, TransferReport};

/// Copy between one local and one remote path, in whichever direction the
/// arguments describe.
pub async fn run<S: AsRef<str>>(paths: &[S], settings: &Settings) -> Result<u64> {
    let parsed = path::parse_all(paths)?;
    let plan = TransferPlan::from_paths(parsed)?;

    let remote = plan.remote().clone();
    let port = remote.port_or(settings.default_port);
    match plan.direction() {
        Direction::Upload => tracing::info!("📤 Uploading to {}:{}{}", remote.host, port, plan.remote_path()),
        Direction::Download => tracing::info!("📥 Downloading from {}:{}{}", remote.host, port, plan.remote_path()),
    }

    let (link, conn) = quic::connect(&remote.host, port, settings.timeout).await?;
    let session = ClientSession::new(conn, plan.into_intent(), settings.chunk_size, Some(settings.timeout));

    let result = if settings.progress {
        let progress = session.progress();
        progress::display_while(session.run(), &progress, settings.progress_interval).await
    } else {
        session.run().await
    };
    link.finish().await;

    match result? {
        TransferReport::Completed { bytes } => {
            tracing::info!("✅ Done: {} bytes transferred", bytes);
            Ok(bytes)
        }
        TransferReport::Rejected { reason } => {
            anyhow::bail!("Transfer rejected by {}: {}", remote.host, reason)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditSink;
    use crate::config::{Config, Overrides};
    use crate::server;
    use std::time::Duration;

    fn settings() -> Settings {
        let mut settings = Settings::resolve(
            Config::default(),
            &Overrides {
                chunk_size: Some(64 * 1024),
                timeout_secs: Some(10),
                progress: false,
            },
        )
        .unwrap();
        settings.progress_interval = Duration::from_millis(20);
        settings
    }

    #[tokio::test]
    async fn round_trip_over_loopback_quic() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("original.bin");
        let uploaded = dir.path().join("uploaded.bin");
        let downloaded = dir.path().join("downloaded.bin");
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 253) as u8).collect();
        std::fs::write(&original, &data).unwrap();

        let settings = settings();
        let endpoint = quic::listen("127.0.0.1:0".parse().unwrap(), settings.timeout).unwrap();
        let port = endpoint.local_addr().unwrap().port();
        let listener = tokio::spawn(server::serve(
            endpoint.clone(),
            settings.server_options(None),
            AuditSink::disabled(),
        ));

        let remote = format!("127.0.0.1:{}:{}", port, uploaded.display());
        let sent = run(&[original.to_string_lossy().into_owned(), remote.clone()], &settings)
            .await
            .unwrap();
        assert_eq!(sent, data.len() as u64);
        assert_eq!(std::fs::read(&uploaded).unwrap(), data);

        let mut with_progress = settings.clone();
        with_progress.progress = true;
        let fetched = run(&[remote, downloaded.to_string_lossy().into_owned()], &with_progress)
            .await
            .unwrap();
        assert_eq!(fetched, data.len() as u64);
        assert_eq!(std::fs::read(&downloaded).unwrap(), data);

        endpoint.close(0u32.into(), b"test over");
        listener.abort();
    }

    #[tokio::test]
    async fn rejection_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("original.txt");
        std::fs::write(&original, b"some bytes").unwrap();

        let settings = settings();
        let endpoint = quic::listen("127.0.0.1:0".parse().unwrap(), settings.timeout).unwrap();
        let port = endpoint.local_addr().unwrap().port();
        let listener = tokio::spawn(server::serve(
            endpoint.clone(),
            settings.server_options(None),
            AuditSink::disabled(),
        ));

        let unwritable = dir.path().join("no").join("such").join("dir.txt");
        let remote = format!("127.0.0.1:{}:{}", port, unwritable.display());
        let err = run(&[original.to_string_lossy().into_owned(), remote], &settings)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("rejected"), "{}", err);
        assert!(!unwritable.exists());

        endpoint.close(0u32.into(), b"test over");
        listener.abort();
    }

    #[tokio::test]
    async fn argument_errors_stop_before_connecting() {
        let settings = settings();
        let err = run(&["missing-local.txt", "127.0.0.1:1:/x"], &settings).await.unwrap_err();
        assert!(err.to_string().contains("does not exist"), "{}", err);

        let err = run(&["a:b:c:d", "x"], &settings).await.unwrap_err();
        assert!(err.to_string().contains("invalid remote path"), "{}", err);
    }
}
