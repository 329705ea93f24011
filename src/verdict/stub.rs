use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

use crate::error::TransferError;
use crate::handshake::AttemptId;
use crate::transfer::{self, TransferOptions};
use crate::transport::tcp;

use super::relay::read_metadata;
use super::{encode_report, PASS_TOKEN};

/// What the stub verifier received from the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayedQuote {
    pub attempt: AttemptId,
    pub quote_id: String,
    pub bytes: Bytes,
    /// The identifier matched the SHA-256 of the bytes.
    pub digest_ok: bool,
}

/// Stand-in for the external verification service.
///
/// Accepts a relay connection, then dials the verdict address and reports a
/// fixed token followed by the attempt id from the relay metadata. It never
/// looks inside the quote, but a relay whose identifier does not match its
/// bytes is answered with `"0"`.
///
/// # Security Warning
///
/// Performs **no** quote validation. Enable only via `features = ["mock"]`
/// for development and testing.
pub struct StubVerifier {
    listener: TcpListener,
    verdict_addr: SocketAddr,
    token: Option<Bytes>,
    report_delay: Duration,
    timeout: Duration,
}

impl StubVerifier {
    /// Bind the relay port. Reports `"1"` to `verdict_addr` by default.
    pub async fn bind(addr: SocketAddr, verdict_addr: SocketAddr) -> Result<Self, TransferError> {
        Ok(Self {
            listener: tcp::listen(addr).await?,
            verdict_addr,
            token: Some(Bytes::from_static(PASS_TOKEN)),
            report_delay: Duration::ZERO,
            timeout: Duration::from_secs(10),
        })
    }

    /// Report this token instead of `"1"`.
    pub fn with_token(mut self, token: impl Into<Bytes>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Accept the relay but never report back.
    pub fn silent(mut self) -> Self {
        self.token = None;
        self
    }

    /// Wait this long after the relay before reporting.
    pub fn with_report_delay(mut self, delay: Duration) -> Self {
        self.report_delay = delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve one relay, report the verdict, and close the relay port.
    pub async fn run_once(self) -> Result<RelayedQuote, TransferError> {
        self.serve().await
    }

    /// Serve the next relay and report its verdict, keeping the relay port
    /// open for another.
    pub async fn serve(&self) -> Result<RelayedQuote, TransferError> {
        let (mut stream, peer) = tcp::accept(&self.listener, self.timeout).await?;

        let opts = TransferOptions {
            io_timeout: self.timeout,
            ..TransferOptions::default()
        };
        let meta = tokio::time::timeout(self.timeout, read_metadata(&mut stream))
            .await
            .map_err(|_| TransferError::Timeout)??;
        let mut body = Vec::new();
        transfer::read_payload(&mut stream, &mut body, &opts).await?;
        drop(stream);

        let digest_ok = hex::encode(Sha256::digest(&body)) == meta.quote_id;
        tracing::debug!(
            %peer,
            attempt = %meta.attempt,
            quote_id = %meta.quote_id,
            bytes = body.len(),
            digest_ok,
            "stub verifier received quote"
        );

        if let Some(token) = &self.token {
            let token: &[u8] = if digest_ok { token } else { b"0" };
            if !self.report_delay.is_zero() {
                tokio::time::sleep(self.report_delay).await;
            }
            let mut report = tcp::connect(self.verdict_addr, self.timeout).await?;
            report.write_all(&encode_report(token, meta.attempt)).await?;
            report.shutdown().await.ok();
        }

        Ok(RelayedQuote {
            attempt: meta.attempt,
            quote_id: meta.quote_id,
            bytes: Bytes::from(body),
            digest_ok,
        })
    }
}
