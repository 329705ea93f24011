pub mod fetcher;
pub mod publisher;

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};

use crate::error::AttestationError;

/// Opaque attestation evidence produced by the destination platform.
///
/// Never interpreted here; identified only by its size and SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quote {
    bytes: Bytes,
    id: String,
}

impl Quote {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        let id = hex::encode(Sha256::digest(&bytes));
        Self { bytes, id }
    }

    /// Read a quote file from disk.
    pub async fn read_from(path: &Path) -> io::Result<Self> {
        let raw = tokio::fs::read(path).await?;
        Ok(Self::new(raw))
    }

    /// Lowercase hex SHA-256 of the quote bytes.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Produces a fresh quote file on the destination host.
#[async_trait]
pub trait QuoteGenerator: Send + Sync {
    /// Generate a quote and return the path it was written to.
    async fn generate(&self) -> Result<PathBuf, AttestationError>;
}

/// Runs an external program that writes the quote to an agreed path.
///
/// Generation succeeds only if the program exits successfully and the quote
/// file exists afterwards. Any file left at that path from an earlier run is
/// removed first so it cannot pass for a fresh quote.
#[derive(Debug, Clone)]
pub struct CommandQuoteGenerator {
    program: PathBuf,
    args: Vec<String>,
    output: PathBuf,
    timeout: Duration,
}

impl CommandQuoteGenerator {
    pub fn new(program: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            output: output.into(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn output(&self) -> &Path {
        &self.output
    }
}

pub(crate) async fn remove_if_present(path: &Path) -> io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl QuoteGenerator for CommandQuoteGenerator {
    async fn generate(&self) -> Result<PathBuf, AttestationError> {
        let fail = |msg: String| AttestationError::QuoteGenerationFailed(msg);

        if remove_if_present(&self.output)
            .await
            .map_err(|e| fail(format!("cannot clear {}: {e}", self.output.display())))?
        {
            tracing::debug!(path = %self.output.display(), "removed stale quote");
        }

        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| fail(format!("cannot run {}: {e}", self.program.display())))?;

        let status = tokio::time::timeout(self.timeout, child.wait())
            .await
            .map_err(|_| fail(format!("{} timed out", self.program.display())))?
            .map_err(|e| fail(format!("{}: {e}", self.program.display())))?;

        if !status.success() {
            return Err(fail(format!("{} exited with {status}", self.program.display())));
        }

        match tokio::fs::metadata(&self.output).await {
            Ok(meta) if meta.is_file() => {
                tracing::info!(
                    path = %self.output.display(),
                    bytes = meta.len(),
                    "quote generated"
                );
                Ok(self.output.clone())
            }
            _ => Err(fail(format!(
                "{} did not produce {}",
                self.program.display(),
                self.output.display()
            ))),
        }
    }
}
