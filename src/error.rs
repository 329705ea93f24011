use std::io;

/// Errors from the length-prefixed file transfer primitive.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("connection failed: {0}")]
    ConnectionFailed(#[source] io::Error),

    #[error("transfer truncated: declared {expected} bytes, received {received}")]
    Truncated { expected: u64, received: u64 },

    #[error("declared transfer size too large: {declared} bytes (max {max})")]
    TooLarge { declared: u64, max: u64 },

    #[error("transfer timed out")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Attempt-scoped errors from the attestation-gated handshake.
///
/// None of these is retried inside the attempt that produced it. The caller
/// may start a fresh attempt.
#[derive(Debug, thiserror::Error)]
pub enum AttestationError {
    #[error("quote generation failed: {0}")]
    QuoteGenerationFailed(String),

    #[error("quote unavailable after {attempts} attempts: {last_error}")]
    QuoteUnavailable { attempts: u32, last_error: String },

    #[error("verifier unreachable: {0}")]
    VerifierUnreachable(String),

    #[error("verifier did not report a verdict in time")]
    VerdictTimeout,

    #[error("verifier rejected the destination quote")]
    VerdictFailed,

    #[error("handshake attempt cancelled")]
    Cancelled,

    #[error("invalid migration target address: {0}")]
    InvalidTargetAddress(String),

    #[error("invalid handshake transition: {from} -> {to}")]
    InvalidState {
        from: &'static str,
        to: &'static str,
    },
}

impl AttestationError {
    /// Short, stable reason code for operator-facing surfaces.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::QuoteGenerationFailed(_) => "quote-generation-failed",
            Self::QuoteUnavailable { .. } => "quote-unavailable",
            Self::VerifierUnreachable(_) => "verifier-unreachable",
            Self::VerdictTimeout => "verdict-timeout",
            Self::VerdictFailed => "verdict-fail",
            Self::Cancelled => "cancelled",
            Self::InvalidTargetAddress(_) => "invalid-target",
            Self::InvalidState { .. } => "invalid-state",
        }
    }
}

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Attestation(#[from] AttestationError),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// The gate opened but the migration transport could not start.
    #[error("migration transport failed to proceed: {0}")]
    Proceed(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Reason code suitable for reporting why a migration did not proceed.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Error::Attestation(e) => e.reason_code(),
            Error::Transfer(TransferError::Truncated { .. }) => "transfer-truncated",
            Error::Transfer(_) => "transfer-failed",
            Error::Config(_) => "invalid-config",
            Error::Proceed(_) => "proceed-failed",
            Error::Io(_) => "io-error",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
