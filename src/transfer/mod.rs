//! Single-shot, length-prefixed file transfer.
//!
//! Wire format: a `u64` length in network byte order, followed by exactly that
//! many payload bytes written in fixed-size chunks. The sending side accepts
//! one connection per invocation and then closes its listener.

use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::error::TransferError;
use crate::transport::tcp;

/// Bytes per chunk on the wire unless configured otherwise.
pub const DEFAULT_CHUNK_SIZE: usize = 256;

/// Size of the length prefix on the wire.
pub const LENGTH_PREFIX_SIZE: usize = 8;

/// Upper bound on a declared payload length accepted by a receiver (16 MiB).
///
/// Quotes are a few KiB; the cap keeps a misbehaving peer from filling the disk.
pub const DEFAULT_MAX_TRANSFER_SIZE: u64 = 16 * 1024 * 1024;

/// Which half of a transfer a descriptor governs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

/// Peer address, port and direction for one transfer session.
///
/// Built fresh for every attempt and never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferDescriptor {
    pub host: String,
    pub port: u16,
    pub direction: Direction,
}

impl TransferDescriptor {
    pub fn sender(bind: SocketAddr) -> Self {
        Self {
            host: bind.ip().to_string(),
            port: bind.port(),
            direction: Direction::Send,
        }
    }

    pub fn receiver(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            direction: Direction::Receive,
        }
    }

    /// `host:port`, bracketing bare IPv6 literals.
    pub fn endpoint(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for TransferDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = match self.direction {
            Direction::Send => "send",
            Direction::Receive => "recv",
        };
        write!(f, "{dir}:{}", self.endpoint())
    }
}

/// Tuning for one transfer.
#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// Bytes per write (sender) and per read (receiver).
    pub chunk_size: usize,
    /// Optional delay after every chunk written, for peers with slow receive loops.
    pub pacing: Option<Duration>,
    /// Largest declared length a receiver accepts.
    pub max_len: u64,
    /// Bound on any single read or write once connected.
    pub io_timeout: Duration,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            pacing: None,
            max_len: DEFAULT_MAX_TRANSFER_SIZE,
            io_timeout: Duration::from_secs(30),
        }
    }
}

impl TransferOptions {
    fn chunk(&self) -> usize {
        self.chunk_size.max(1)
    }
}

async fn bounded<F, T>(timeout: Duration, fut: F) -> Result<T, TransferError>
where
    F: std::future::Future<Output = std::io::Result<T>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| TransferError::Timeout)?
        .map_err(TransferError::Io)
}

/// Write the length prefix and the payload in chunks. Returns the payload size.
pub async fn write_payload<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
    opts: &TransferOptions,
) -> Result<u64, TransferError> {
    let len = payload.len() as u64;
    bounded(opts.io_timeout, writer.write_u64(len)).await?;

    for chunk in payload.chunks(opts.chunk()) {
        bounded(opts.io_timeout, writer.write_all(chunk)).await?;
        if let Some(delay) = opts.pacing {
            tokio::time::sleep(delay).await;
        }
    }
    bounded(opts.io_timeout, writer.flush()).await?;
    Ok(len)
}

/// Read a length prefix, then copy exactly that many bytes into `sink`,
/// chunk by chunk as they arrive.
///
/// A peer that closes before the declared length is consumed yields
/// [`TransferError::Truncated`].
pub async fn read_payload<R, W>(
    reader: &mut R,
    sink: &mut W,
    opts: &TransferOptions,
) -> Result<u64, TransferError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let declared = match tokio::time::timeout(opts.io_timeout, reader.read_u64()).await {
        Err(_) => return Err(TransferError::Timeout),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(TransferError::Truncated {
                expected: LENGTH_PREFIX_SIZE as u64,
                received: 0,
            })
        }
        Ok(Err(e)) => return Err(TransferError::Io(e)),
        Ok(Ok(n)) => n,
    };
    if declared > opts.max_len {
        return Err(TransferError::TooLarge {
            declared,
            max: opts.max_len,
        });
    }

    let mut buf = vec![0u8; opts.chunk()];
    let mut received = 0u64;
    while received < declared {
        let want = (declared - received).min(buf.len() as u64) as usize;
        let n = bounded(opts.io_timeout, reader.read(&mut buf[..want])).await?;
        if n == 0 {
            return Err(TransferError::Truncated {
                expected: declared,
                received,
            });
        }
        bounded(opts.io_timeout, sink.write_all(&buf[..n])).await?;
        received += n as u64;
    }
    bounded(opts.io_timeout, sink.flush()).await?;
    Ok(received)
}

/// Accept exactly one connection on `listener` and send `payload` to it.
///
/// The listener is consumed, so later connections are refused.
pub async fn serve_once(
    listener: TcpListener,
    payload: Bytes,
    accept_timeout: Duration,
    opts: &TransferOptions,
) -> Result<u64, TransferError> {
    let (mut stream, peer) = tcp::accept(&listener, accept_timeout).await?;
    drop(listener);
    tracing::debug!(%peer, bytes = payload.len(), "serving transfer");

    let sent = write_payload(&mut stream, &payload, opts).await?;
    // Peer may already have hung up after reading everything.
    stream.shutdown().await.ok();
    Ok(sent)
}

/// Read the file at `path` and serve it to one peer.
///
/// The source file is left in place; removing it is the caller's job.
pub async fn send_file(
    listener: TcpListener,
    path: &Path,
    accept_timeout: Duration,
    opts: &TransferOptions,
) -> Result<u64, TransferError> {
    let contents = tokio::fs::read(path).await?;
    serve_once(listener, Bytes::from(contents), accept_timeout, opts).await
}

/// Connect to the descriptor's endpoint and write the received payload to `dest`.
///
/// `dest` is created or truncated. On any failure the partial file is removed
/// so a short transfer never looks like a complete one.
pub async fn receive_file(
    descriptor: &TransferDescriptor,
    dest: &Path,
    connect_timeout: Duration,
    opts: &TransferOptions,
) -> Result<u64, TransferError> {
    debug_assert_eq!(descriptor.direction, Direction::Receive);
    let mut stream = tcp::connect(descriptor.endpoint(), connect_timeout).await?;

    let mut file = tokio::fs::File::create(dest).await?;
    let result = read_payload(&mut stream, &mut file, opts).await;
    drop(file);

    match result {
        Ok(n) => {
            tracing::debug!(%descriptor, bytes = n, path = %dest.display(), "transfer received");
            Ok(n)
        }
        Err(e) => {
            tokio::fs::remove_file(dest).await.ok();
            Err(e)
        }
    }
}
