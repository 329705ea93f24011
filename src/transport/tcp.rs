use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use crate::error::TransferError;

/// Connect to a TCP endpoint, giving up after `timeout`.
///
/// Every failure to connect, including running out of time, is
/// `ConnectionFailed`.
pub async fn connect<A: ToSocketAddrs>(
    addr: A,
    timeout: Duration,
) -> Result<TcpStream, TransferError> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TransferError::ConnectionFailed(io::ErrorKind::TimedOut.into()))?
        .map_err(TransferError::ConnectionFailed)?;
    stream
        .set_nodelay(true)
        .map_err(TransferError::ConnectionFailed)?;
    Ok(stream)
}

/// Bind a TCP listener and return it.
pub async fn listen(addr: SocketAddr) -> Result<TcpListener, TransferError> {
    TcpListener::bind(addr)
        .await
        .map_err(TransferError::ConnectionFailed)
}

/// Accept a single connection from a listener, giving up after `timeout`.
pub async fn accept(
    listener: &TcpListener,
    timeout: Duration,
) -> Result<(TcpStream, SocketAddr), TransferError> {
    let (stream, addr) = tokio::time::timeout(timeout, listener.accept())
        .await
        .map_err(|_| TransferError::Timeout)?
        .map_err(TransferError::ConnectionFailed)?;
    stream
        .set_nodelay(true)
        .map_err(TransferError::ConnectionFailed)?;
    Ok((stream, addr))
}
