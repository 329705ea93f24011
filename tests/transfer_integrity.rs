//! Length-prefixed transfer: integrity across chunk boundaries and
//! truncation detection.

use std::time::Duration;

use bytes::Bytes;
use proptest::prelude::*;
use tokio::io::AsyncWriteExt;

use attested_migration_gate::transfer::{
    self, TransferDescriptor, TransferOptions, DEFAULT_CHUNK_SIZE,
};
use attested_migration_gate::transport::tcp;
use attested_migration_gate::TransferError;

const T: Duration = Duration::from_secs(5);

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn duplex_roundtrip(data: Vec<u8>, chunk_size: usize) -> Vec<u8> {
    let opts = TransferOptions {
        chunk_size,
        ..TransferOptions::default()
    };
    let (mut client, mut server) = tokio::io::duplex(64);
    let mut out = Vec::new();
    let (sent, recv) = tokio::join!(
        transfer::write_payload(&mut client, &data, &opts),
        transfer::read_payload(&mut server, &mut out, &opts),
    );
    assert_eq!(sent.unwrap(), data.len() as u64);
    assert_eq!(recv.unwrap(), data.len() as u64);
    out
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn received_bytes_equal_sent_bytes(
        data in prop::collection::vec(any::<u8>(), 0..4096),
        chunk_size in 1usize..600,
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let out = rt.block_on(duplex_roundtrip(data.clone(), chunk_size));
        prop_assert_eq!(out, data);
    }
}

#[tokio::test]
async fn chunk_boundary_sizes_over_tcp() {
    for len in [0, 1, 255, 256, 257, 64 * 1024 + 3] {
        let data = payload(len);
        let listener = tcp::listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let opts = TransferOptions::default();

        let server_opts = opts.clone();
        let sent = Bytes::from(data.clone());
        let server =
            tokio::spawn(async move { transfer::serve_once(listener, sent, T, &server_opts).await });

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("recv.dat");
        let desc = TransferDescriptor::receiver("127.0.0.1", addr.port());
        let n = transfer::receive_file(&desc, &dest, T, &opts).await.unwrap();

        assert_eq!(n, len as u64, "len {len}");
        assert_eq!(server.await.unwrap().unwrap(), len as u64);
        assert_eq!(std::fs::read(&dest).unwrap(), data, "len {len}");
    }
}

#[tokio::test]
async fn paced_transfer_delivers_everything() {
    let data = payload(DEFAULT_CHUNK_SIZE * 3 + 10);
    let opts = TransferOptions {
        pacing: Some(Duration::from_millis(2)),
        ..TransferOptions::default()
    };
    let (mut client, mut server) = tokio::io::duplex(DEFAULT_CHUNK_SIZE);
    let mut out = Vec::new();
    let (sent, recv) = tokio::join!(
        transfer::write_payload(&mut client, &data, &opts),
        transfer::read_payload(&mut server, &mut out, &opts),
    );
    sent.unwrap();
    recv.unwrap();
    assert_eq!(out, data);
}

#[tokio::test]
async fn serve_once_refuses_second_peer() {
    let listener = tcp::listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let opts = TransferOptions::default();

    let server_opts = opts.clone();
    let server = tokio::spawn(async move {
        transfer::serve_once(listener, Bytes::from_static(b"quote"), T, &server_opts).await
    });

    let dir = tempfile::tempdir().unwrap();
    let desc = TransferDescriptor::receiver("127.0.0.1", addr.port());
    transfer::receive_file(&desc, &dir.path().join("a"), T, &opts)
        .await
        .unwrap();
    server.await.unwrap().unwrap();

    let second = transfer::receive_file(&desc, &dir.path().join("b"), T, &opts).await;
    assert!(matches!(second, Err(TransferError::ConnectionFailed(_))));
}

#[tokio::test]
async fn truncated_stream_is_reported_and_partial_file_removed() {
    let listener = tcp::listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = listener.local_addr().unwrap();

    // Declares 500 bytes, sends 100, hangs up.
    let server = tokio::spawn(async move {
        let (mut stream, _) = tcp::accept(&listener, T).await.unwrap();
        stream.write_u64(500).await.unwrap();
        stream.write_all(&payload(100)).await.unwrap();
        stream.shutdown().await.unwrap();
    });

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("recv.dat");
    let desc = TransferDescriptor::receiver("127.0.0.1", addr.port());
    let err = transfer::receive_file(&desc, &dest, T, &TransferOptions::default())
        .await
        .unwrap_err();
    server.await.unwrap();

    assert!(matches!(
        err,
        TransferError::Truncated {
            expected: 500,
            received: 100
        }
    ));
    assert!(!dest.exists());
}

#[tokio::test]
async fn send_file_leaves_source_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("send.dat");
    std::fs::write(&src, payload(777)).unwrap();

    let listener = tcp::listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let desc = TransferDescriptor::sender(listener.local_addr().unwrap());
    assert_eq!(desc.direction, transfer::Direction::Send);

    let opts = TransferOptions::default();
    let server_opts = opts.clone();
    let server_src = src.clone();
    let server = tokio::spawn(async move {
        transfer::send_file(listener, &server_src, T, &server_opts).await
    });

    let dest = dir.path().join("recv.dat");
    let recv = TransferDescriptor::receiver("127.0.0.1", desc.port);
    transfer::receive_file(&recv, &dest, T, &opts).await.unwrap();

    assert_eq!(server.await.unwrap().unwrap(), 777);
    assert_eq!(std::fs::read(&dest).unwrap(), payload(777));
    assert!(src.exists());
}

#[tokio::test]
async fn stalled_sender_times_out() {
    let opts = TransferOptions {
        io_timeout: Duration::from_millis(100),
        ..TransferOptions::default()
    };
    // Keep the writer alive without sending anything.
    let (_client, mut server) = tokio::io::duplex(64);
    let mut out = Vec::new();
    let err = transfer::read_payload(&mut server, &mut out, &opts)
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::Timeout));
}
