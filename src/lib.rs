pub mod config;
pub mod error;
pub mod handshake;
pub mod notify;
pub mod quote;
pub mod transfer;
pub mod transport;
pub mod verdict;

// Re-export key types at crate root for convenience.
pub use config::retry::RetryPolicy;
pub use config::{PublisherConfig, SourceConfig};
pub use error::{AttestationError, Error, Result, TransferError};
pub use handshake::coordinator::{
    AttemptReport, HandshakeCoordinator, MigrationParams, MigrationTransport,
};
pub use handshake::{AttemptId, HandshakeAttempt, HandshakeState};
pub use notify::{GuestEvent, GuestNotifier};
pub use quote::publisher::{PublishHandle, QuotePublisher};
pub use quote::{CommandQuoteGenerator, Quote, QuoteGenerator};
pub use verdict::Verdict;

#[cfg(feature = "mock")]
pub use verdict::stub::StubVerifier;
