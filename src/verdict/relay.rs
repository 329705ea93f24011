use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::SourceConfig;
use crate::error::{AttestationError, TransferError};
use crate::handshake::AttemptId;
use crate::quote::Quote;
use crate::transfer::{self, TransferOptions};
use crate::transport::tcp;

/// Longest quote identifier carried in the metadata record.
pub const MAX_QUOTE_ID_LEN: usize = 256;

/// The record sent ahead of the quote on a relay connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayMetadata {
    /// Attempt the verifier must echo back with its verdict.
    pub attempt: AttemptId,
    pub quote_id: String,
}

/// Write the metadata record: `u64` big-endian attempt id, `u16` big-endian
/// identifier length, then the identifier.
pub async fn write_metadata<W: AsyncWrite + Unpin>(
    writer: &mut W,
    attempt: AttemptId,
    quote_id: &str,
) -> Result<(), TransferError> {
    let id = quote_id.as_bytes();
    if id.len() > MAX_QUOTE_ID_LEN {
        return Err(TransferError::TooLarge {
            declared: id.len() as u64,
            max: MAX_QUOTE_ID_LEN as u64,
        });
    }
    writer.write_u64(attempt.as_u64()).await?;
    writer.write_u16(id.len() as u16).await?;
    writer.write_all(id).await?;
    Ok(())
}

/// Read a metadata record written by [`write_metadata`].
pub async fn read_metadata<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<RelayMetadata, TransferError> {
    let attempt = AttemptId::from(reader.read_u64().await?);
    let len = reader.read_u16().await? as usize;
    if len > MAX_QUOTE_ID_LEN {
        return Err(TransferError::TooLarge {
            declared: len as u64,
            max: MAX_QUOTE_ID_LEN as u64,
        });
    }
    let mut id = vec![0u8; len];
    reader.read_exact(&mut id).await?;
    let quote_id = String::from_utf8(id).map_err(|e| {
        TransferError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })?;
    Ok(RelayMetadata { attempt, quote_id })
}

/// Pushes a fetched quote to the verifier.
///
/// Only sends; the verdict comes back on a separate connection.
#[derive(Debug, Clone)]
pub struct VerdictRelayClient {
    verifier_addr: SocketAddr,
    connect_timeout: Duration,
    opts: TransferOptions,
}

impl VerdictRelayClient {
    pub fn new(verifier_addr: SocketAddr, connect_timeout: Duration, opts: TransferOptions) -> Self {
        Self {
            verifier_addr,
            connect_timeout,
            opts,
        }
    }

    pub fn from_config(config: &SourceConfig) -> Self {
        Self::new(
            config.verifier_addr,
            config.connect_timeout,
            config.relay_options(),
        )
    }

    /// Send the metadata record for `attempt` and stream the quote. Returns
    /// bytes of quote sent.
    pub async fn relay(&self, quote: &Quote, attempt: AttemptId) -> Result<u64, AttestationError> {
        let addr = self.verifier_addr;
        let to_unreachable =
            |e: TransferError| AttestationError::VerifierUnreachable(format!("{addr}: {e}"));

        let mut stream = tcp::connect(addr, self.connect_timeout)
            .await
            .map_err(to_unreachable)?;
        tracing::debug!(%addr, quote_id = %quote.id(), "relaying quote to verifier");

        let io_timeout = self.opts.io_timeout;
        tokio::time::timeout(io_timeout, write_metadata(&mut stream, attempt, quote.id()))
            .await
            .map_err(|_| to_unreachable(TransferError::Timeout))?
            .map_err(to_unreachable)?;

        let sent = transfer::write_payload(&mut stream, quote.bytes(), &self.opts)
            .await
            .map_err(to_unreachable)?;
        stream.shutdown().await.ok();

        tracing::info!(%addr, bytes = sent, "quote relayed to verifier");
        Ok(sent)
    }
}
