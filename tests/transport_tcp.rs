//! Tests for the `transport::tcp` helper functions.

use std::time::Duration;

use attested_migration_gate::transport::tcp;
use attested_migration_gate::TransferError;

const T: Duration = Duration::from_secs(5);

#[tokio::test]
async fn listen_and_accept() {
    let listener = tcp::listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let client_handle = tokio::spawn(async move { tcp::connect(addr, T).await.unwrap() });

    let (server_stream, peer_addr) = tcp::accept(&listener, T).await.unwrap();
    let client_stream = client_handle.await.unwrap();

    // Both sides should have nodelay set.
    assert!(server_stream.nodelay().unwrap());
    assert!(client_stream.nodelay().unwrap());

    assert!(peer_addr.ip().is_loopback());
}

#[tokio::test]
async fn connect_to_unbound_port_fails() {
    // Bind and immediately drop to get a port that is not listening.
    let listener = tcp::listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = tcp::connect(addr, T).await;
    assert!(matches!(result, Err(TransferError::ConnectionFailed(_))));
}

#[tokio::test]
async fn connect_timeout_is_a_connection_failure() {
    // TEST-NET-1 is unroutable: the connect either hangs until the timeout or
    // is refused by the local stack. Both must surface as ConnectionFailed.
    let result = tcp::connect("192.0.2.1:9", Duration::from_millis(100)).await;
    assert!(
        matches!(result, Err(TransferError::ConnectionFailed(_))),
        "{result:?}"
    );
}

#[tokio::test]
async fn accept_times_out_without_peer() {
    let listener = tcp::listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let result = tcp::accept(&listener, Duration::from_millis(50)).await;
    assert!(matches!(result, Err(TransferError::Timeout)));
}
