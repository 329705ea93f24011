//! Operator entry point for the attestation-gated migration handshake.
//!
//! Usage:
//!   migration-gate serve-quote --listen 0.0.0.0:8888
//!   migration-gate migrate --verifier-addr 192.0.2.10:9999 --uri fd:migfd -- /usr/bin/start-migration
//!   migration-gate verifier-stub --listen 0.0.0.0:9999 --verdict-addr 127.0.0.1:8889
//!   migration-gate notify completed

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

#[cfg(feature = "mock")]
use attested_migration_gate::StubVerifier;

use attested_migration_gate::config::{
    DEFAULT_QUOTE_GENERATOR, DEFAULT_QUOTE_PATH, DEFAULT_QUOTE_PORT, DEFAULT_TARGET_FILE,
};
use attested_migration_gate::notify::{UnixSocketNotifier, DEFAULT_NOTIFY_SOCKET};
use attested_migration_gate::{
    AttestationError, Error, GuestEvent, GuestNotifier, HandshakeCoordinator, MigrationParams,
    MigrationTransport, PublisherConfig, QuotePublisher, RetryPolicy, SourceConfig,
};

#[derive(Parser)]
#[command(name = "migration-gate")]
#[command(about = "Gate live migration on a remote attestation verdict")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Destination: generate a quote and serve it to one source.
    ServeQuote {
        #[arg(long, default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_QUOTE_PORT)))]
        listen: SocketAddr,
        #[arg(long, default_value = DEFAULT_QUOTE_PATH)]
        quote_path: PathBuf,
        #[arg(long, default_value = DEFAULT_QUOTE_GENERATOR)]
        generator: PathBuf,
        /// Extra argument for the generator (repeatable).
        #[arg(long = "generator-arg", value_name = "ARG")]
        generator_args: Vec<String>,
        #[arg(long, default_value_t = 60)]
        serve_timeout_secs: u64,
    },

    /// Source: attest the destination, then run the proceed command.
    Migrate {
        #[arg(long, default_value = DEFAULT_TARGET_FILE)]
        target_file: PathBuf,
        #[arg(long, default_value_t = DEFAULT_QUOTE_PORT)]
        quote_port: u16,
        /// Fetch the quote from here instead of `<target>:<quote-port>`.
        #[arg(long)]
        quote_addr: Option<SocketAddr>,
        #[arg(long, default_value = "0.0.0.0:8889")]
        verdict_addr: SocketAddr,
        #[arg(long)]
        verifier_addr: SocketAddr,
        /// UNSAFE: accept a verdict from any host that can reach the verdict
        /// port, not just the verifier's IP.
        #[arg(long)]
        accept_any_verdict_peer: bool,
        #[arg(long)]
        work_dir: Option<PathBuf>,
        #[arg(long, default_value_t = 5)]
        retries: u32,
        #[arg(long, default_value_t = 30)]
        verdict_timeout_secs: u64,
        #[arg(long)]
        relay_pacing_ms: Option<u64>,
        /// Send MIGRATION to the guest over this socket once attested.
        #[arg(long)]
        notify_socket: Option<PathBuf>,
        /// Migration transport URI, exported to the proceed command as `MIGRATION_URI`.
        #[arg(long, default_value = "")]
        uri: String,
        /// Program (and args) run on a passing verdict; the target is appended.
        #[arg(last = true)]
        proceed: Vec<String>,
    },

    /// Stand-in verifier: accept one relayed quote and report a verdict.
    #[cfg(feature = "mock")]
    VerifierStub {
        #[arg(long, default_value = "0.0.0.0:9999")]
        listen: SocketAddr,
        #[arg(long)]
        verdict_addr: SocketAddr,
        #[arg(long, default_value = "1")]
        token: String,
    },

    /// Send a migration event to the guest agent socket.
    Notify {
        event: EventArg,
        #[arg(long, default_value = DEFAULT_NOTIFY_SOCKET)]
        socket: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum EventArg {
    Starting,
    Completed,
}

impl From<EventArg> for GuestEvent {
    fn from(e: EventArg) -> Self {
        match e {
            EventArg::Starting => GuestEvent::MigrationStarting,
            EventArg::Completed => GuestEvent::MigrationCompleted,
        }
    }
}

/// Runs an external command once the gate opens.
struct CommandTransport {
    proceed: Vec<String>,
}

#[async_trait]
impl MigrationTransport for CommandTransport {
    async fn proceed(&self, target: &str, params: &MigrationParams) -> Result<(), Error> {
        let Some((program, args)) = self.proceed.split_first() else {
            tracing::info!(%target, "gate open; no proceed command configured");
            return Ok(());
        };
        let status = tokio::process::Command::new(program)
            .args(args)
            .env("MIGRATION_URI", &params.uri)
            .arg(target)
            .status()
            .await
            .map_err(|e| Error::Proceed(format!("cannot run {program}: {e}")))?;
        if !status.success() {
            return Err(Error::Proceed(format!("{program} exited with {status}")));
        }
        tracing::info!(%target, "proceed command finished");
        Ok(())
    }

    async fn abort(&self, reason: &AttestationError) {
        tracing::warn!(reason = reason.reason_code(), "migration will not proceed");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::ServeQuote {
            listen,
            quote_path,
            generator,
            generator_args,
            serve_timeout_secs,
        } => {
            let config = PublisherConfig::builder()
                .listen_addr(listen)
                .quote_path(&quote_path)
                .generator(&generator)
                .generator_args(generator_args)
                .serve_timeout(Duration::from_secs(serve_timeout_secs))
                .build()?;

            let publisher = QuotePublisher::from_config(config);
            let handle = publisher.publish().await.context("quote publication failed")?;
            tracing::info!(addr = %handle.local_addr(), "waiting for source");
            let sent = handle.wait().await.context("quote transfer failed")?;
            tracing::info!(bytes = sent, "done");
        }

        Command::Migrate {
            target_file,
            quote_port,
            quote_addr,
            verdict_addr,
            verifier_addr,
            accept_any_verdict_peer,
            work_dir,
            retries,
            verdict_timeout_secs,
            relay_pacing_ms,
            notify_socket,
            uri,
            proceed,
        } => {
            let mut builder = SourceConfig::builder()
                .target_file(target_file)
                .quote_port(quote_port)
                .verdict_addr(verdict_addr)
                .verifier_addr(verifier_addr)
                .verify_verdict_peer(!accept_any_verdict_peer)
                .retry_policy(RetryPolicy {
                    max_retries: retries,
                    ..RetryPolicy::default()
                })
                .verdict_timeout(Duration::from_secs(verdict_timeout_secs));
            if let Some(addr) = quote_addr {
                builder = builder.quote_addr(addr);
            }
            if let Some(dir) = work_dir {
                builder = builder.work_dir(dir);
            }
            if let Some(ms) = relay_pacing_ms {
                builder = builder.relay_pacing(Duration::from_millis(ms));
            }

            let transport = Arc::new(CommandTransport { proceed });
            let mut coordinator = HandshakeCoordinator::new(builder.build()?, transport);
            if let Some(socket) = notify_socket {
                coordinator = coordinator.with_notifier(Arc::new(UnixSocketNotifier::new(socket)));
            }

            let mut attempt = coordinator.new_attempt();
            let cancel = attempt.cancel_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupted, cancelling attempt");
                    cancel.cancel();
                }
            });

            match coordinator
                .run_attempt(&mut attempt, &MigrationParams::new(uri))
                .await
            {
                Ok(report) => {
                    tracing::info!(attempt = %report.attempt, target = %report.target, "migration started")
                }
                Err(e) => anyhow::bail!("migration did not start ({}): {e}", e.reason_code()),
            }
        }

        #[cfg(feature = "mock")]
        Command::VerifierStub {
            listen,
            verdict_addr,
            token,
        } => {
            let stub = StubVerifier::bind(listen, verdict_addr)
                .await?
                .with_token(token.into_bytes());
            let relayed = stub.run_once().await?;
            tracing::info!(
                quote_id = %relayed.quote_id,
                bytes = relayed.bytes.len(),
                digest_ok = relayed.digest_ok,
                "relay served"
            );
        }

        Command::Notify { event, socket } => {
            UnixSocketNotifier::new(socket).notify(event.into()).await?;
        }
    }

    Ok(())
}
