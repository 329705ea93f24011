use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::SourceConfig;
use crate::error::{AttestationError, Error};
use crate::notify::{GuestEvent, GuestNotifier};
use crate::quote::fetcher::{read_target_address, QuoteFetcher};
use crate::quote::Quote;
use crate::verdict::listener::VerdictListener;
use crate::verdict::relay::VerdictRelayClient;
use crate::verdict::Verdict;

use super::{AttemptId, HandshakeAttempt, HandshakeState};

/// Parameters of the migration request, handed to the transport untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationParams {
    /// Transport URI as given by the operator, e.g. `fd:migfd` or `tcp:host:port`.
    pub uri: String,
}

impl MigrationParams {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

/// The real migration transport, gated by the handshake.
#[async_trait]
pub trait MigrationTransport: Send + Sync {
    /// Start migrating to `target`. Only ever called after a passing verdict.
    async fn proceed(&self, target: &str, params: &MigrationParams) -> Result<(), Error>;

    /// Give up on this migration request. Must be idempotent.
    async fn abort(&self, reason: &AttestationError);
}

/// Summary of an attempt that reached `Proceeding`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptReport {
    pub attempt: AttemptId,
    pub target: String,
    pub quote_id: String,
    pub state: HandshakeState,
}

type TargetLocks = HashMap<String, Arc<AsyncMutex<()>>>;

/// Source-side driver of the attestation-gated handshake.
///
/// Attempts for the same target are serialized end to end. All attempts
/// share the one verdict port, so attempts for different targets may fetch
/// their quotes concurrently but take turns from binding the verdict
/// listener until their verdict is in.
pub struct HandshakeCoordinator {
    config: SourceConfig,
    transport: Arc<dyn MigrationTransport>,
    notifier: Option<Arc<dyn GuestNotifier>>,
    target_locks: Mutex<TargetLocks>,
    verdict_port: AsyncMutex<()>,
}

impl HandshakeCoordinator {
    pub fn new(config: SourceConfig, transport: Arc<dyn MigrationTransport>) -> Self {
        Self {
            config,
            transport,
            notifier: None,
            target_locks: Mutex::new(HashMap::new()),
            verdict_port: AsyncMutex::new(()),
        }
    }

    /// Tell the guest that migration is starting once the gate opens.
    pub fn with_notifier(mut self, notifier: Arc<dyn GuestNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    /// Create a fresh attempt in the configured work directory.
    pub fn new_attempt(&self) -> HandshakeAttempt {
        HandshakeAttempt::new(&self.config.work_dir)
    }

    /// Run one migration request on a fresh attempt.
    pub async fn run(&self, params: &MigrationParams) -> Result<AttemptReport, Error> {
        let mut attempt = self.new_attempt();
        self.run_attempt(&mut attempt, params).await
    }

    /// Drive `attempt` from `Idle` to a terminal state.
    ///
    /// The transport's `proceed` is called exactly once if and only if this
    /// attempt's own verdict listener reported `Pass`; every other outcome
    /// calls `abort` and returns the reason. A failed `proceed` is returned
    /// as [`Error::Proceed`] with the attempt left in `Proceeding`.
    pub async fn run_attempt(
        &self,
        attempt: &mut HandshakeAttempt,
        params: &MigrationParams,
    ) -> Result<AttemptReport, Error> {
        if attempt.state() != HandshakeState::Idle {
            return Err(AttestationError::InvalidState {
                from: attempt.state().name(),
                to: HandshakeState::FetchingQuote.name(),
            }
            .into());
        }

        let span = tracing::info_span!(
            "attempt",
            id = %attempt.id(),
            target = tracing::field::Empty
        );
        async move {
            let result = self.drive(attempt, params).await;
            attempt.release().await;
            result
        }
        .instrument(span)
        .await
    }

    async fn drive(
        &self,
        attempt: &mut HandshakeAttempt,
        params: &MigrationParams,
    ) -> Result<AttemptReport, Error> {
        // The lease keeps this target's attempts serialized through proceed.
        let (report, _lease) = match self.gate(attempt).await {
            Ok(gated) => gated,
            Err(e) => {
                attempt.abort();
                tracing::warn!(reason = e.reason_code(), error = %e, "migration aborted");
                self.transport.abort(&e).await;
                return Err(e.into());
            }
        };

        attempt.advance(HandshakeState::Proceeding)?;
        if let Err(e) = self.transport.proceed(&report.target, params).await {
            tracing::error!(
                reason = e.reason_code(),
                error = %e,
                "gate open but migration did not start"
            );
            return Err(e);
        }
        Ok(AttemptReport {
            state: attempt.state(),
            ..report
        })
    }

    /// Everything up to and including a passing verdict.
    async fn gate(
        &self,
        attempt: &mut HandshakeAttempt,
    ) -> Result<(AttemptReport, TargetLease<'_>), AttestationError> {
        let target = read_target_address(&self.config.target_file).await?;
        tracing::Span::current().record("target", target.as_str());
        attempt.set_target(target.clone());
        let cancel = attempt.cancel_token();

        let lease = tokio::select! {
            lease = self.lock_target(&target) => lease,
            _ = cancel.cancelled() => return Err(AttestationError::Cancelled),
        };

        attempt.advance(HandshakeState::FetchingQuote)?;
        let quote = QuoteFetcher::new(&self.config)
            .fetch(&target, attempt.quote_path(), &cancel)
            .await?;
        attempt.set_quote_id(quote.id());

        attempt.advance(HandshakeState::RelayingQuote)?;
        let verdict = self.relay_for_verdict(attempt.id(), &quote, &cancel).await?;
        attempt.record_verdict(verdict);
        match verdict {
            Verdict::Pass => attempt.advance(HandshakeState::Verified)?,
            Verdict::Fail => return Err(AttestationError::VerdictFailed),
            Verdict::Indeterminate => return Err(AttestationError::VerdictTimeout),
        }
        tracing::info!(%target, quote_id = %quote.id(), "destination attested");

        self.notify_guest().await;

        let report = AttemptReport {
            attempt: attempt.id(),
            target,
            quote_id: quote.id().to_owned(),
            state: attempt.state(),
        };
        Ok((report, lease))
    }

    /// Relay the quote and wait for this attempt's verdict.
    ///
    /// Holds the verdict port from bind until the listener task is gone.
    async fn relay_for_verdict(
        &self,
        attempt: AttemptId,
        quote: &Quote,
        cancel: &CancellationToken,
    ) -> Result<Verdict, AttestationError> {
        let _port = tokio::select! {
            guard = self.verdict_port.lock() => guard,
            _ = cancel.cancelled() => return Err(AttestationError::Cancelled),
        };

        let mut listener =
            VerdictListener::bind(self.config.verdict_addr, attempt, self.config.verdict_timeout)
                .await?;
        if self.config.verify_verdict_peer {
            listener = listener.expect_peer(self.config.verifier_addr.ip());
        } else {
            tracing::warn!(addr = %self.config.verdict_addr, "accepting verdicts from any peer");
        }
        // Listen before relaying: the verifier may report before the relay returns.
        let pending = listener.spawn();

        let relay = VerdictRelayClient::from_config(&self.config);
        let relayed = tokio::select! {
            r = relay.relay(quote, attempt) => r,
            _ = cancel.cancelled() => Err(AttestationError::Cancelled),
        };
        if let Err(e) = relayed {
            pending.cancel().await;
            return Err(e);
        }

        pending.join(cancel).await
    }

    async fn lock_target(&self, target: &str) -> TargetLease<'_> {
        let lock = {
            let mut locks = self
                .target_locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(locks.entry(target.to_owned()).or_default())
        };
        TargetLease {
            locks: &self.target_locks,
            target: target.to_owned(),
            guard: Some(lock.lock_owned().await),
        }
    }

    async fn notify_guest(&self) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        let sent = tokio::time::timeout(
            self.config.connect_timeout,
            notifier.notify(GuestEvent::MigrationStarting),
        )
        .await;
        match sent {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "guest notification failed"),
            Err(_) => tracing::warn!("guest notification timed out"),
        }
    }
}

/// Exclusive hold on one target. Dropping it unlocks the target and forgets
/// the target's lock if nobody else is waiting on it.
struct TargetLease<'a> {
    locks: &'a Mutex<TargetLocks>,
    target: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for TargetLease<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Waiters clone the Arc under this same mutex, so a count of one
        // means the map holds the only reference.
        if locks
            .get(&self.target)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.target);
        }
    }
}
