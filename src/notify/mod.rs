//! Tells the guest that migration is starting or has completed.
//!
//! Runs independently of the attestation handshake; a failed notification is
//! reported to the caller but never gates migration.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::{Error, TransferError};

/// Default Unix-domain socket the host-side guest agent listens on.
pub const DEFAULT_NOTIFY_SOCKET: &str = "/var/lib/libvirt/qemu/mig_port";

/// Migration lifecycle events delivered to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestEvent {
    MigrationStarting,
    MigrationCompleted,
}

impl GuestEvent {
    /// Bytes written to the guest channel for this event.
    pub fn wire(self) -> &'static [u8] {
        match self {
            GuestEvent::MigrationStarting => b"MIGRATION\n",
            // The completion message carries its C string terminator.
            GuestEvent::MigrationCompleted => b"MIGRATED\n\0",
        }
    }
}

/// Delivers [`GuestEvent`]s to the guest.
#[async_trait]
pub trait GuestNotifier: Send + Sync {
    async fn notify(&self, event: GuestEvent) -> Result<(), Error>;
}

/// Writes events to an already-open byte stream.
pub struct StreamNotifier<W> {
    inner: Mutex<W>,
}

impl<W> StreamNotifier<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }

    pub fn into_inner(self) -> W {
        self.inner.into_inner()
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> GuestNotifier for StreamNotifier<W> {
    async fn notify(&self, event: GuestEvent) -> Result<(), Error> {
        let mut w = self.inner.lock().await;
        w.write_all(event.wire()).await?;
        w.flush().await?;
        tracing::debug!(?event, "guest notified");
        Ok(())
    }
}

/// Connects to a Unix-domain socket per event, writes it, and disconnects.
#[cfg(unix)]
#[derive(Debug, Clone)]
pub struct UnixSocketNotifier {
    path: PathBuf,
    timeout: Duration,
}

#[cfg(unix)]
impl UnixSocketNotifier {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            timeout: Duration::from_secs(5),
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[cfg(unix)]
impl Default for UnixSocketNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_NOTIFY_SOCKET)
    }
}

#[cfg(unix)]
#[async_trait]
impl GuestNotifier for UnixSocketNotifier {
    async fn notify(&self, event: GuestEvent) -> Result<(), Error> {
        let deliver = async {
            let mut stream = tokio::net::UnixStream::connect(&self.path)
                .await
                .map_err(TransferError::ConnectionFailed)?;
            stream.write_all(event.wire()).await.map_err(TransferError::Io)?;
            stream.shutdown().await.ok();
            Ok::<_, TransferError>(())
        };
        tokio::time::timeout(self.timeout, deliver)
            .await
            .map_err(|_| TransferError::Timeout)??;
        tracing::info!(?event, socket = %self.path.display(), "guest notified");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stream_notifier_writes_wire_text() {
        let notifier = StreamNotifier::new(Vec::new());
        notifier.notify(GuestEvent::MigrationStarting).await.unwrap();
        notifier.notify(GuestEvent::MigrationCompleted).await.unwrap();
        assert_eq!(notifier.into_inner(), b"MIGRATION\nMIGRATED\n\0".to_vec());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unix_notifier_delivers_event() {
        use tokio::io::AsyncReadExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mig_port");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();

        let reader = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut got = Vec::new();
            conn.read_to_end(&mut got).await.unwrap();
            got
        });

        UnixSocketNotifier::new(&path)
            .notify(GuestEvent::MigrationCompleted)
            .await
            .unwrap();
        assert_eq!(reader.await.unwrap(), b"MIGRATED\n\0");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unix_notifier_missing_socket_errors() {
        let dir = tempfile::tempdir().unwrap();
        let err = UnixSocketNotifier::new(dir.path().join("absent"))
            .notify(GuestEvent::MigrationStarting)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Transfer(TransferError::ConnectionFailed(_))
        ));
    }
}
