use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::AttestationError;
use crate::handshake::AttemptId;

use super::{Verdict, MAX_VERDICT_REPORT_LEN};

/// Accepts the verifier's verdict report for one handshake attempt.
///
/// A listener belongs to exactly one attempt. Only a report echoing that
/// attempt's id can pass, so a late report meant for an older attempt that
/// lands on a newer listener is a failure, never a pass.
#[derive(Debug)]
pub struct VerdictListener {
    listener: TcpListener,
    attempt: AttemptId,
    expected_peer: Option<IpAddr>,
    timeout: Duration,
}

impl VerdictListener {
    /// Bind the verdict-report port for `attempt`.
    pub async fn bind(
        addr: SocketAddr,
        attempt: AttemptId,
        timeout: Duration,
    ) -> Result<Self, AttestationError> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            AttestationError::VerifierUnreachable(format!("cannot bind verdict port {addr}: {e}"))
        })?;
        Ok(Self {
            listener,
            attempt,
            expected_peer: None,
            timeout,
        })
    }

    /// Ignore verdict connections from any other address.
    pub fn expect_peer(mut self, ip: IpAddr) -> Self {
        self.expected_peer = Some(ip);
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Wait for the first (acceptable) connection and read its verdict.
    ///
    /// Resolves to `Indeterminate` if nothing arrives within the timeout.
    pub async fn wait(self) -> Verdict {
        let timeout = self.timeout;
        match tokio::time::timeout(timeout, self.accept_verdict()).await {
            Ok(verdict) => verdict,
            Err(_) => {
                tracing::warn!(timeout_ms = timeout.as_millis() as u64, "no verdict before timeout");
                Verdict::Indeterminate
            }
        }
    }

    /// Run [`wait`](Self::wait) on its own task.
    pub fn spawn(self) -> PendingVerdict {
        PendingVerdict {
            handle: tokio::spawn(self.wait()),
        }
    }

    async fn accept_verdict(self) -> Verdict {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(error = %e, "verdict accept failed");
                    return Verdict::Fail;
                }
            };
            if let Some(expected) = self.expected_peer {
                if peer.ip() != expected {
                    tracing::warn!(%peer, %expected, "ignoring verdict from unexpected peer");
                    continue;
                }
            }
            let verdict = read_verdict(stream, self.attempt).await;
            tracing::info!(%peer, %verdict, "verdict received");
            return verdict;
        }
    }
}

/// Read a short report until EOF, a terminator, or the size cap.
async fn read_verdict(mut stream: TcpStream, attempt: AttemptId) -> Verdict {
    let mut buf = [0u8; MAX_VERDICT_REPORT_LEN];
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => {
                filled += n;
                if buf[..filled].iter().any(|b| matches!(b, b'\n' | 0)) {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "verdict read failed");
                return Verdict::Fail;
            }
        }
    }
    Verdict::from_report(&buf[..filled], attempt)
}

/// A verdict listener running in the background.
///
/// Dropping it aborts the listener task, which releases the verdict port.
#[derive(Debug)]
pub struct PendingVerdict {
    handle: JoinHandle<Verdict>,
}

impl PendingVerdict {
    /// Wait for the verdict, or stop early when `cancel` fires.
    ///
    /// The listener task is always finished or aborted before this returns.
    pub async fn join(mut self, cancel: &CancellationToken) -> Result<Verdict, AttestationError> {
        let joined = tokio::select! {
            joined = &mut self.handle => Some(joined),
            _ = cancel.cancelled() => None,
        };
        match joined {
            Some(Ok(verdict)) => Ok(verdict),
            Some(Err(e)) => {
                tracing::warn!(error = %e, "verdict listener task failed");
                Ok(Verdict::Indeterminate)
            }
            None => {
                self.cancel().await;
                Err(AttestationError::Cancelled)
            }
        }
    }

    /// Abort the listener and wait for its task to wind down.
    pub async fn cancel(mut self) {
        self.handle.abort();
        let _ = (&mut self.handle).await;
    }
}

impl Drop for PendingVerdict {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
