pub mod retry;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Error;
use crate::transfer::{TransferOptions, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_TRANSFER_SIZE};

use self::retry::RetryPolicy;

/// Port the destination serves its quote on.
pub const DEFAULT_QUOTE_PORT: u16 = 8888;
/// Port the source listens on for the verifier's verdict.
pub const DEFAULT_VERDICT_PORT: u16 = 8889;
/// Pinned file naming the migration destination.
pub const DEFAULT_TARGET_FILE: &str = "/tmp/mig_tgtip.tmp";
/// Where the external generator leaves the quote on the destination.
pub const DEFAULT_QUOTE_PATH: &str = "/tmp/send.dat";
/// External quote generation procedure.
pub const DEFAULT_QUOTE_GENERATOR: &str = "/usr/script/gen.sh";

/// Configuration for the source-side handshake coordinator.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// File holding the destination's address (default: `/tmp/mig_tgtip.tmp`).
    pub target_file: PathBuf,

    /// Destination quote-serving port (default: 8888).
    pub quote_port: u16,

    /// Explicit quote-service endpoint, overriding `<target>:<quote_port>`.
    pub quote_addr: Option<SocketAddr>,

    /// Local address the verdict listener binds (default: `0.0.0.0:8889`).
    pub verdict_addr: SocketAddr,

    /// Verifier relay endpoint.
    pub verifier_addr: SocketAddr,

    /// Only accept verdict connections from the verifier's IP (default: on).
    ///
    /// With this off, any host that can reach `verdict_addr` may report.
    pub verify_verdict_peer: bool,

    /// Directory for attempt-scoped quote copies (default: `/tmp`).
    pub work_dir: PathBuf,

    /// Retry budget for fetching the destination's quote.
    pub retry_policy: RetryPolicy,

    /// Bound on each TCP connect (default: 5s).
    pub connect_timeout: Duration,

    /// Bound on each read/write once connected (default: 30s).
    pub io_timeout: Duration,

    /// Absolute bound on waiting for the verdict (default: 30s).
    pub verdict_timeout: Duration,

    /// Transfer chunk size in bytes (default: 256).
    pub chunk_size: usize,

    /// Delay after each chunk relayed to the verifier (default: none).
    pub relay_pacing: Option<Duration>,

    /// Largest quote accepted from the destination (default: 16 MiB).
    pub max_quote_size: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            target_file: PathBuf::from(DEFAULT_TARGET_FILE),
            quote_port: DEFAULT_QUOTE_PORT,
            quote_addr: None,
            verdict_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_VERDICT_PORT)),
            verifier_addr: SocketAddr::from(([127, 0, 0, 1], 9999)),
            verify_verdict_peer: true,
            work_dir: std::env::temp_dir(),
            retry_policy: RetryPolicy::default(),
            connect_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(30),
            verdict_timeout: Duration::from_secs(30),
            chunk_size: DEFAULT_CHUNK_SIZE,
            relay_pacing: None,
            max_quote_size: DEFAULT_MAX_TRANSFER_SIZE,
        }
    }
}

impl SourceConfig {
    /// Create a builder for constructing a `SourceConfig`.
    pub fn builder() -> SourceConfigBuilder {
        SourceConfigBuilder {
            inner: SourceConfig::default(),
        }
    }

    /// Options for pulling the quote from the destination.
    pub fn fetch_options(&self) -> TransferOptions {
        TransferOptions {
            chunk_size: self.chunk_size,
            pacing: None,
            max_len: self.max_quote_size,
            io_timeout: self.io_timeout,
        }
    }

    /// Options for pushing the quote to the verifier.
    pub fn relay_options(&self) -> TransferOptions {
        TransferOptions {
            pacing: self.relay_pacing,
            ..self.fetch_options()
        }
    }
}

/// Builder for [`SourceConfig`].
#[derive(Debug, Clone)]
pub struct SourceConfigBuilder {
    inner: SourceConfig,
}

impl SourceConfigBuilder {
    pub fn target_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.inner.target_file = path.into();
        self
    }

    pub fn quote_port(mut self, port: u16) -> Self {
        self.inner.quote_port = port;
        self
    }

    pub fn quote_addr(mut self, addr: SocketAddr) -> Self {
        self.inner.quote_addr = Some(addr);
        self
    }

    pub fn verdict_addr(mut self, addr: SocketAddr) -> Self {
        self.inner.verdict_addr = addr;
        self
    }

    pub fn verifier_addr(mut self, addr: SocketAddr) -> Self {
        self.inner.verifier_addr = addr;
        self
    }

    pub fn verify_verdict_peer(mut self, enabled: bool) -> Self {
        self.inner.verify_verdict_peer = enabled;
        self
    }

    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.inner.work_dir = dir.into();
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.inner.retry_policy = policy;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.inner.connect_timeout = timeout;
        self
    }

    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.inner.io_timeout = timeout;
        self
    }

    pub fn verdict_timeout(mut self, timeout: Duration) -> Self {
        self.inner.verdict_timeout = timeout;
        self
    }

    pub fn chunk_size(mut self, size: usize) -> Self {
        self.inner.chunk_size = size;
        self
    }

    pub fn relay_pacing(mut self, delay: Duration) -> Self {
        self.inner.relay_pacing = Some(delay);
        self
    }

    pub fn max_quote_size(mut self, size: u64) -> Self {
        self.inner.max_quote_size = size;
        self
    }

    /// Build the `SourceConfig`, validating that all values are sensible.
    pub fn build(self) -> Result<SourceConfig, Error> {
        let c = self.inner;
        if c.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be > 0".into()));
        }
        if c.connect_timeout.is_zero() || c.io_timeout.is_zero() {
            return Err(Error::Config("connect and I/O timeouts must be > 0".into()));
        }
        if c.verdict_timeout.is_zero() {
            return Err(Error::Config("verdict_timeout must be > 0".into()));
        }
        if c.quote_port == 0 && c.quote_addr.is_none() {
            return Err(Error::Config("quote_port must be > 0".into()));
        }
        Ok(c)
    }
}

/// Configuration for the destination-side quote publisher.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Address the quote is served on (default: `0.0.0.0:8888`).
    pub listen_addr: SocketAddr,

    /// Path the generator writes the quote to (default: `/tmp/send.dat`).
    pub quote_path: PathBuf,

    /// Quote generation program (default: `/usr/script/gen.sh`).
    pub generator: PathBuf,

    /// Extra arguments for the generation program.
    pub generator_args: Vec<String>,

    /// Bound on the generation program's runtime (default: 60s).
    pub generation_timeout: Duration,

    /// How long the publisher waits for the source to connect (default: 60s).
    pub serve_timeout: Duration,

    /// Bound on each write once the source is connected (default: 30s).
    pub io_timeout: Duration,

    /// Transfer chunk size in bytes (default: 256).
    pub chunk_size: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_QUOTE_PORT)),
            quote_path: PathBuf::from(DEFAULT_QUOTE_PATH),
            generator: PathBuf::from(DEFAULT_QUOTE_GENERATOR),
            generator_args: Vec::new(),
            generation_timeout: Duration::from_secs(60),
            serve_timeout: Duration::from_secs(60),
            io_timeout: Duration::from_secs(30),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl PublisherConfig {
    pub fn builder() -> PublisherConfigBuilder {
        PublisherConfigBuilder {
            inner: PublisherConfig::default(),
        }
    }

    pub fn transfer_options(&self) -> TransferOptions {
        TransferOptions {
            chunk_size: self.chunk_size,
            io_timeout: self.io_timeout,
            ..TransferOptions::default()
        }
    }
}

/// Builder for [`PublisherConfig`].
#[derive(Debug, Clone)]
pub struct PublisherConfigBuilder {
    inner: PublisherConfig,
}

impl PublisherConfigBuilder {
    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.inner.listen_addr = addr;
        self
    }

    pub fn quote_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.inner.quote_path = path.into();
        self
    }

    pub fn generator(mut self, program: impl Into<PathBuf>) -> Self {
        self.inner.generator = program.into();
        self
    }

    pub fn generator_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.generator_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn generation_timeout(mut self, timeout: Duration) -> Self {
        self.inner.generation_timeout = timeout;
        self
    }

    pub fn serve_timeout(mut self, timeout: Duration) -> Self {
        self.inner.serve_timeout = timeout;
        self
    }

    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.inner.io_timeout = timeout;
        self
    }

    pub fn chunk_size(mut self, size: usize) -> Self {
        self.inner.chunk_size = size;
        self
    }

    pub fn build(self) -> Result<PublisherConfig, Error> {
        let c = self.inner;
        if c.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be > 0".into()));
        }
        if c.serve_timeout.is_zero() || c.generation_timeout.is_zero() || c.io_timeout.is_zero()
        {
            return Err(Error::Config("timeouts must be > 0".into()));
        }
        Ok(c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_defaults_match_wire_constants() {
        let c = SourceConfig::default();
        assert_eq!(c.quote_port, 8888);
        assert_eq!(c.verdict_addr.port(), 8889);
        assert_eq!(c.target_file, PathBuf::from("/tmp/mig_tgtip.tmp"));
        assert_eq!(c.chunk_size, 256);
        assert!(c.relay_pacing.is_none());
        assert!(c.verify_verdict_peer);
    }

    #[test]
    fn builder_rejects_zero_verdict_timeout() {
        let err = SourceConfig::builder()
            .verdict_timeout(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn builder_rejects_zero_chunk() {
        assert!(SourceConfig::builder().chunk_size(0).build().is_err());
        assert!(PublisherConfig::builder().chunk_size(0).build().is_err());
    }

    #[test]
    fn relay_options_carry_pacing_only_for_relay() {
        let c = SourceConfig::builder()
            .relay_pacing(Duration::from_millis(5))
            .build()
            .unwrap();
        assert_eq!(c.relay_options().pacing, Some(Duration::from_millis(5)));
        assert_eq!(c.fetch_options().pacing, None);
    }
}
