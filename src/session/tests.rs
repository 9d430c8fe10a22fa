use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use tokio::fs;

use super::*;
use crate::protocol::Letter;
use crate::session::server::ServerOptions;
use crate::transport::tests::pair;
use crate::transport::{Connection, Frame};

const MIB: usize = 1024 * 1024;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn server_options(chunk_size: usize) -> ServerOptions {
    ServerOptions {
        chunk_size,
        timeout: Some(Duration::from_secs(5)),
        root: None,
    }
}

async fn upload_intent(source: &Path, destination: &Path) -> Intent {
    let file = fs::File::open(source).await.unwrap();
    let size = file.metadata().await.unwrap().len();
    Intent::Upload {
        source: file,
        size,
        destination: destination.to_string_lossy().into_owned(),
    }
}

async fn expect_letter<C: Connection>(conn: &mut C) -> Letter {
    receive_letter(conn, "test").await.unwrap()
}

#[tokio::test]
async fn upload_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source.bin");
    let destination = dir.path().join("destination.bin");
    let data = pattern(10 * MIB);
    std::fs::write(&source, &data).unwrap();

    let (client_end, server_end) = pair();
    let server = tokio::spawn(ServerSession::new(server_end, server_options(4 * MIB)).run());

    let intent = upload_intent(&source, &destination).await;
    let session = ClientSession::new(client_end, intent, 4 * MIB, Some(Duration::from_secs(5)));
    let progress = session.progress();
    let report = session.run().await.unwrap();

    assert_eq!(report, TransferReport::Completed { bytes: data.len() as u64 });
    assert_eq!(progress.percent(), 100);
    assert!(matches!(server.await.unwrap(), ServerOutcome::Uploaded { bytes, .. } if bytes == data.len() as u64));
    assert_eq!(std::fs::read(&destination).unwrap(), data);
}

#[tokio::test]
async fn upload_acknowledges_every_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("acks.bin");
    let data = pattern(10 * MIB);

    let (mut peer, server_end) = pair();
    let server = tokio::spawn(ServerSession::new(server_end, server_options(4 * MIB)).run());

    let request = Letter::upload_request(data.len() as u64, destination.to_string_lossy());
    send_letter(&mut peer, &request).await.unwrap();
    assert_eq!(expect_letter(&mut peer).await, Letter::Confirmation);

    let mut chunk_acks = 0;
    for chunk in data.chunks(4 * MIB) {
        peer.transmit(Frame::Binary(Bytes::copy_from_slice(chunk))).await.unwrap();
        assert_eq!(expect_letter(&mut peer).await, Letter::Confirmation);
        chunk_acks += 1;
    }
    assert_eq!(chunk_acks, 3);

    assert!(matches!(server.await.unwrap(), ServerOutcome::Uploaded { .. }));
    assert_eq!(std::fs::read(&destination).unwrap(), data);

    // Nothing beyond the per-chunk confirmations was sent.
    peer.set_timeout(Some(Duration::from_millis(100)));
    assert!(peer.receive().await.is_err());
}

#[tokio::test]
async fn upload_to_unwritable_destination_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source.txt");
    std::fs::write(&source, b"payload").unwrap();
    let destination = dir.path().join("missing-parent").join("dest.txt");

    let (client_end, server_end) = pair();
    let server = tokio::spawn(ServerSession::new(server_end, server_options(MIB)).run());

    let intent = upload_intent(&source, &destination).await;
    let report = ClientSession::new(client_end, intent, MIB, None).run().await.unwrap();

    match report {
        TransferReport::Rejected { reason } => assert!(reason.contains("dest.txt"), "{}", reason),
        other => panic!("expected rejection, got {:?}", other),
    }
    assert!(matches!(server.await.unwrap(), ServerOutcome::UploadRejected { .. }));
    assert!(!destination.exists());
}

#[tokio::test]
async fn empty_upload_completes_without_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("empty");
    let destination = dir.path().join("empty.copy");
    std::fs::write(&source, b"").unwrap();

    let (client_end, server_end) = pair();
    let server = tokio::spawn(ServerSession::new(server_end, server_options(MIB)).run());

    let intent = upload_intent(&source, &destination).await;
    let session = ClientSession::new(client_end, intent, MIB, Some(Duration::from_secs(5)));
    let progress = session.progress();
    assert_eq!(session.run().await.unwrap(), TransferReport::Completed { bytes: 0 });
    assert_eq!(progress.percent(), 100);
    assert!(matches!(server.await.unwrap(), ServerOutcome::Uploaded { bytes: 0, .. }));
    assert_eq!(std::fs::metadata(&destination).unwrap().len(), 0);
}

#[tokio::test]
async fn upload_abandoned_mid_stream_leaves_partial_file() {
    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("partial.bin");

    let (mut peer, server_end) = pair();
    let server = tokio::spawn(ServerSession::new(server_end, server_options(MIB)).run());

    send_letter(&mut peer, &Letter::upload_request(3000, destination.to_string_lossy()))
        .await
        .unwrap();
    assert_eq!(expect_letter(&mut peer).await, Letter::Confirmation);
    peer.transmit(Frame::Binary(Bytes::from(vec![1u8; 1000]))).await.unwrap();
    assert_eq!(expect_letter(&mut peer).await, Letter::Confirmation);
    send_letter(&mut peer, &Letter::ConnectionClose).await.unwrap();

    assert!(matches!(
        server.await.unwrap(),
        ServerOutcome::PeerClosed { during: "receiving upload" }
    ));
    assert_eq!(std::fs::metadata(&destination).unwrap().len(), 1000);
}

#[tokio::test]
async fn upload_disconnect_fails_only_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("cut.bin");

    let (mut peer, server_end) = pair();
    let server = tokio::spawn(ServerSession::new(server_end, server_options(MIB)).run());

    send_letter(&mut peer, &Letter::upload_request(10, destination.to_string_lossy()))
        .await
        .unwrap();
    assert_eq!(expect_letter(&mut peer).await, Letter::Confirmation);
    drop(peer);

    assert!(matches!(
        server.await.unwrap(),
        ServerOutcome::Failed(SessionError::Transport(crate::transport::TransportError::Closed))
    ));
}

#[tokio::test]
async fn download_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let remote = dir.path().join("served.bin");
    let local = dir.path().join("fetched.bin");
    let data = pattern(5 * MIB + 17);
    std::fs::write(&remote, &data).unwrap();

    let (client_end, server_end) = pair();
    let server = tokio::spawn(ServerSession::new(server_end, server_options(2 * MIB)).run());

    let intent = Intent::Download {
        source: remote.to_string_lossy().into_owned(),
        destination: local.clone(),
    };
    let session = ClientSession::new(client_end, intent, MIB, Some(Duration::from_secs(5)));
    let progress = session.progress();
    let report = session.run().await.unwrap();

    assert_eq!(report, TransferReport::Completed { bytes: data.len() as u64 });
    assert_eq!(progress.percent(), 100);
    assert!(matches!(server.await.unwrap(), ServerOutcome::Downloaded { bytes, .. } if bytes == data.len() as u64));
    assert_eq!(std::fs::read(&local).unwrap(), data);
}

#[tokio::test]
async fn download_client_follows_the_handshake() {
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("out.bin");
    let data = pattern(3000);

    let (client_end, mut peer) = pair();
    let intent = Intent::Download {
        source: "/srv/data.bin".into(),
        destination: local.clone(),
    };
    let client = tokio::spawn(ClientSession::new(client_end, intent, MIB, None).run());

    assert_eq!(expect_letter(&mut peer).await, Letter::download_request("/srv/data.bin"));
    send_letter(&mut peer, &Letter::download_confirmation(data.len() as u64)).await.unwrap();
    assert_eq!(expect_letter(&mut peer).await, Letter::Confirmation);

    for chunk in data.chunks(1024) {
        peer.transmit(Frame::Binary(Bytes::copy_from_slice(chunk))).await.unwrap();
    }
    assert_eq!(expect_letter(&mut peer).await, Letter::Confirmation);
    assert_eq!(expect_letter(&mut peer).await, Letter::ConnectionClose);
    peer.close().await.unwrap();

    assert_eq!(
        client.await.unwrap().unwrap(),
        TransferReport::Completed { bytes: data.len() as u64 }
    );
    assert_eq!(std::fs::read(&local).unwrap(), data);
}

#[tokio::test]
async fn download_of_missing_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("never.bin");

    let (client_end, server_end) = pair();
    let server = tokio::spawn(ServerSession::new(server_end, server_options(MIB)).run());

    let intent = Intent::Download {
        source: dir.path().join("absent.bin").to_string_lossy().into_owned(),
        destination: local.clone(),
    };
    let report = ClientSession::new(client_end, intent, MIB, None).run().await.unwrap();

    assert!(matches!(report, TransferReport::Rejected { .. }));
    assert!(matches!(server.await.unwrap(), ServerOutcome::DownloadRejected { .. }));
    assert!(!local.exists());
}

#[tokio::test]
async fn declined_download_sends_no_data() {
    let dir = tempfile::tempdir().unwrap();
    let remote = dir.path().join("offer.bin");
    std::fs::write(&remote, pattern(100)).unwrap();

    let (mut peer, server_end) = pair();
    let server = tokio::spawn(ServerSession::new(server_end, server_options(MIB)).run());

    send_letter(&mut peer, &Letter::download_request(remote.to_string_lossy())).await.unwrap();
    assert_eq!(expect_letter(&mut peer).await, Letter::download_confirmation(100));
    send_letter(&mut peer, &Letter::rejection("no space")).await.unwrap();

    match server.await.unwrap() {
        ServerOutcome::DownloadDeclined { reply, .. } => assert_eq!(reply, "no space"),
        other => panic!("expected declined download, got {:?}", other),
    }
    assert!(matches!(peer.receive().await, Err(_)));
}

#[tokio::test]
async fn close_before_intent_ends_gracefully() {
    let (mut peer, server_end) = pair();
    let server = tokio::spawn(ServerSession::new(server_end, server_options(MIB)).run());
    send_letter(&mut peer, &Letter::ConnectionClose).await.unwrap();
    assert!(matches!(
        server.await.unwrap(),
        ServerOutcome::PeerClosed { during: "awaiting intent" }
    ));
}

#[tokio::test]
async fn undecodable_letter_closes_the_session() {
    let (mut peer, server_end) = pair();
    let server = tokio::spawn(ServerSession::new(server_end, server_options(MIB)).run());
    peer.transmit(Frame::Control(Bytes::from_static(b"{not json")))
        .await
        .unwrap();
    assert!(matches!(
        server.await.unwrap(),
        ServerOutcome::Failed(SessionError::Codec(_))
    ));
}

#[tokio::test]
async fn letters_out_of_place_are_protocol_violations() {
    let (mut peer, server_end) = pair();
    let server = tokio::spawn(ServerSession::new(server_end, server_options(MIB)).run());
    peer.transmit(Frame::Binary(Bytes::from_static(b"early")))
        .await
        .unwrap();
    assert!(matches!(
        server.await.unwrap(),
        ServerOutcome::Failed(SessionError::UnexpectedBinary { .. })
    ));

    let (mut peer, server_end) = pair();
    let server = tokio::spawn(ServerSession::new(server_end, server_options(MIB)).run());
    peer.transmit(Frame::Control(Bytes::from_static(
        br#"{"tag":"resume-request","fields":{"offset":1}}"#,
    )))
    .await
    .unwrap();
    match server.await.unwrap() {
        ServerOutcome::Failed(SessionError::UnexpectedLetter { tag, .. }) => {
            assert_eq!(tag, "resume-request")
        }
        other => panic!("expected protocol violation, got {:?}", other),
    }
}

#[tokio::test]
async fn served_root_rejects_escapes() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source.txt");
    std::fs::write(&source, b"abc").unwrap();

    let (client_end, server_end) = pair();
    let options = ServerOptions {
        root: Some(dir.path().join("jail")),
        ..server_options(MIB)
    };
    let server = tokio::spawn(ServerSession::new(server_end, options).run());

    let intent = upload_intent(&source, Path::new("/../escaped.txt")).await;
    let report = ClientSession::new(client_end, intent, MIB, None).run().await.unwrap();

    assert!(matches!(report, TransferReport::Rejected { .. }));
    assert!(matches!(server.await.unwrap(), ServerOutcome::UploadRejected { .. }));
    assert!(!dir.path().join("escaped.txt").exists());
}

#[tokio::test]
async fn stalled_peer_times_out_the_client() {
    let (client_end, _silent) = pair();
    let intent = Intent::Download {
        source: "/anything".into(),
        destination: "unused".into(),
    };
    let result = ClientSession::new(client_end, intent, MIB, Some(Duration::from_millis(100)))
        .run()
        .await;
    assert!(matches!(
        result,
        Err(SessionError::Transport(crate::transport::TransportError::TimedOut(_)))
    ));
}

#[tokio::test]
async fn upload_to_a_peer_that_stops_reading_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("big.bin");
    std::fs::write(&source, pattern(4 * MIB)).unwrap();

    let (client_end, mut peer) = pair();
    let intent = upload_intent(&source, Path::new("/srv/big.bin")).await;
    let client = tokio::spawn(
        ClientSession::new(client_end, intent, 4 * MIB, Some(Duration::from_millis(200))).run(),
    );

    assert!(matches!(expect_letter(&mut peer).await, Letter::UploadRequest(_)));
    send_letter(&mut peer, &Letter::Confirmation).await.unwrap();

    // The peer keeps the pipe open but never reads the chunk.
    let result = tokio::time::timeout(Duration::from_secs(3), client)
        .await
        .expect("client hung on a stalled peer")
        .unwrap();
    assert!(matches!(
        result,
        Err(SessionError::Transport(crate::transport::TransportError::TimedOut(_)))
    ));
    drop(peer);
}

#[tokio::test]
async fn download_to_a_client_that_stops_reading_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let remote = dir.path().join("served.bin");
    std::fs::write(&remote, pattern(4 * MIB)).unwrap();

    let (mut peer, server_end) = pair();
    let options = ServerOptions {
        timeout: Some(Duration::from_millis(200)),
        ..server_options(4 * MIB)
    };
    let server = tokio::spawn(ServerSession::new(server_end, options).run());

    send_letter(&mut peer, &Letter::download_request(remote.to_string_lossy())).await.unwrap();
    assert_eq!(expect_letter(&mut peer).await, Letter::download_confirmation(4 * MIB as u64));
    send_letter(&mut peer, &Letter::Confirmation).await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(3), server)
        .await
        .expect("server hung on a stalled client")
        .unwrap();
    assert!(matches!(
        outcome,
        ServerOutcome::Failed(SessionError::Transport(crate::transport::TransportError::TimedOut(_)))
    ));
    drop(peer);
}

#[tokio::test]
async fn empty_download_completes_without_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let remote = dir.path().join("empty");
    let local = dir.path().join("empty.copy");
    std::fs::write(&remote, b"").unwrap();

    let (client_end, server_end) = pair();
    let server = tokio::spawn(ServerSession::new(server_end, server_options(MIB)).run());

    let intent = Intent::Download {
        source: remote.to_string_lossy().into_owned(),
        destination: local.clone(),
    };
    let session = ClientSession::new(client_end, intent, MIB, Some(Duration::from_secs(5)));
    let progress = session.progress();
    assert_eq!(session.run().await.unwrap(), TransferReport::Completed { bytes: 0 });
    assert_eq!(progress.percent(), 100);
    assert!(matches!(server.await.unwrap(), ServerOutcome::Downloaded { bytes: 0, .. }));
    assert_eq!(std::fs::metadata(&local).unwrap().len(), 0);
}

#[tokio::test]
async fn empty_download_handshake_has_no_binary_frames() {
    let dir = tempfile::tempdir().unwrap();
    let remote = dir.path().join("empty");
    std::fs::write(&remote, b"").unwrap();

    let (mut peer, server_end) = pair();
    let server = tokio::spawn(ServerSession::new(server_end, server_options(MIB)).run());

    send_letter(&mut peer, &Letter::download_request(remote.to_string_lossy())).await.unwrap();
    assert_eq!(expect_letter(&mut peer).await, Letter::download_confirmation(0));
    send_letter(&mut peer, &Letter::Confirmation).await.unwrap();
    // Final confirmation follows immediately; no data was due.
    send_letter(&mut peer, &Letter::Confirmation).await.unwrap();

    assert!(matches!(server.await.unwrap(), ServerOutcome::Downloaded { bytes: 0, .. }));
    assert!(matches!(
        peer.receive().await,
        Err(crate::transport::TransportError::Closed)
    ));
}

#[tokio::test]
async fn acknowledged_chunks_are_already_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let destination = dir.path().join("durable.bin");

    let (mut peer, server_end) = pair();
    let server = tokio::spawn(ServerSession::new(server_end, server_options(MIB)).run());

    send_letter(&mut peer, &Letter::upload_request(4000, destination.to_string_lossy()))
        .await
        .unwrap();
    assert_eq!(expect_letter(&mut peer).await, Letter::Confirmation);
    for written in [1000u64, 2000, 3000] {
        peer.transmit(Frame::Binary(Bytes::from(vec![9u8; 1000]))).await.unwrap();
        assert_eq!(expect_letter(&mut peer).await, Letter::Confirmation);
        assert_eq!(std::fs::metadata(&destination).unwrap().len(), written);
    }
    send_letter(&mut peer, &Letter::ConnectionClose).await.unwrap();

    assert!(matches!(server.await.unwrap(), ServerOutcome::PeerClosed { .. }));
    assert_eq!(std::fs::metadata(&destination).unwrap().len(), 3000);
}

#[tokio::test]
async fn read_chunk_fills_until_limit_or_end() {
    let data = pattern(10_000);
    let mut reader = &data[..];
    assert_eq!(read_chunk(&mut reader, 4096).await.unwrap().len(), 4096);
    assert_eq!(read_chunk(&mut reader, 4096).await.unwrap().len(), 4096);
    assert_eq!(read_chunk(&mut reader, 4096).await.unwrap().len(), 1808);
    assert!(read_chunk(&mut reader, 4096).await.unwrap().is_empty());
}
