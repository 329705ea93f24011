pub mod coordinator;

use std::fmt;
use std::path::{Path, PathBuf};

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::AttestationError;
use crate::verdict::Verdict;

/// Progress of one handshake attempt.
///
/// `Proceeding` and `Aborted` are terminal; an attempt never leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    FetchingQuote,
    /// Quote is being relayed while the verdict listener waits.
    RelayingQuote,
    Verified,
    Proceeding,
    Aborted,
}

impl HandshakeState {
    pub fn name(self) -> &'static str {
        match self {
            HandshakeState::Idle => "Idle",
            HandshakeState::FetchingQuote => "FetchingQuote",
            HandshakeState::RelayingQuote => "RelayingQuote",
            HandshakeState::Verified => "Verified",
            HandshakeState::Proceeding => "Proceeding",
            HandshakeState::Aborted => "Aborted",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, HandshakeState::Proceeding | HandshakeState::Aborted)
    }

    /// Whether `self -> next` is an edge of the handshake state machine.
    pub fn can_transition_to(self, next: HandshakeState) -> bool {
        use HandshakeState::*;
        match (self, next) {
            (Idle, FetchingQuote) => true,
            (FetchingQuote, RelayingQuote) => true,
            (RelayingQuote, Verified) => true,
            (Verified, Proceeding) => true,
            (from, Aborted) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Random per-attempt token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttemptId(u64);

impl AttemptId {
    pub fn random() -> Self {
        Self(rand::thread_rng().gen())
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for AttemptId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// One end-to-end run of the attestation-gated handshake.
///
/// Owns its target, quote copy, verdict and cancellation token. The quote
/// copy lives under an attempt-scoped name and is removed when the attempt is
/// dropped. A finished attempt cannot be run again; retries need a new one.
#[derive(Debug)]
pub struct HandshakeAttempt {
    id: AttemptId,
    state: HandshakeState,
    target: Option<String>,
    quote_path: PathBuf,
    quote_id: Option<String>,
    verdict: Option<Verdict>,
    cancel: CancellationToken,
}

impl HandshakeAttempt {
    /// Create a fresh attempt whose temporary files live in `work_dir`.
    pub fn new(work_dir: &Path) -> Self {
        let id = AttemptId::random();
        Self {
            id,
            state: HandshakeState::Idle,
            target: None,
            quote_path: work_dir.join(format!("recv-{id}.dat")),
            quote_id: None,
            verdict: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> AttemptId {
        self.id
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn quote_path(&self) -> &Path {
        &self.quote_path
    }

    pub fn quote_id(&self) -> Option<&str> {
        self.quote_id.as_deref()
    }

    pub fn verdict(&self) -> Option<Verdict> {
        self.verdict
    }

    /// Token that cancels this attempt; hand a clone to the operator layer.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn set_target(&mut self, target: String) {
        self.target = Some(target);
    }

    pub(crate) fn set_quote_id(&mut self, id: &str) {
        self.quote_id = Some(id.to_owned());
    }

    pub(crate) fn record_verdict(&mut self, verdict: Verdict) {
        self.verdict = Some(verdict);
    }

    pub(crate) fn advance(&mut self, next: HandshakeState) -> Result<(), AttestationError> {
        if !self.state.can_transition_to(next) {
            return Err(AttestationError::InvalidState {
                from: self.state.name(),
                to: next.name(),
            });
        }
        tracing::debug!(attempt = %self.id, from = %self.state, to = %next, "handshake transition");
        self.state = next;
        Ok(())
    }

    /// Move to `Aborted` unless already terminal.
    pub(crate) fn abort(&mut self) {
        if !self.state.is_terminal() {
            self.state = HandshakeState::Aborted;
        }
    }

    /// Remove the attempt's quote copy.
    pub(crate) async fn release(&self) {
        log_release(&self.quote_path, tokio::fs::remove_file(&self.quote_path).await);
    }
}

fn log_release(path: &Path, removed: std::io::Result<()>) {
    match removed {
        Ok(()) => tracing::debug!(path = %path.display(), "removed attempt quote copy"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove attempt quote copy"),
    }
}

impl Drop for HandshakeAttempt {
    fn drop(&mut self) {
        self.cancel.cancel();
        log_release(&self.quote_path, std::fs::remove_file(&self.quote_path));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use HandshakeState::*;

    #[test]
    fn happy_path_edges() {
        assert!(Idle.can_transition_to(FetchingQuote));
        assert!(FetchingQuote.can_transition_to(RelayingQuote));
        assert!(RelayingQuote.can_transition_to(Verified));
        assert!(Verified.can_transition_to(Proceeding));
    }

    #[test]
    fn no_shortcuts_to_proceeding() {
        for from in [Idle, FetchingQuote, RelayingQuote, Aborted, Proceeding] {
            assert!(!from.can_transition_to(Proceeding), "{from} -> Proceeding");
        }
    }

    #[test]
    fn terminal_states_are_final() {
        for next in [Idle, FetchingQuote, RelayingQuote, Verified, Proceeding, Aborted] {
            assert!(!Aborted.can_transition_to(next));
            assert!(!Proceeding.can_transition_to(next));
        }
    }

    #[test]
    fn abort_reachable_from_every_live_state() {
        for from in [Idle, FetchingQuote, RelayingQuote, Verified] {
            assert!(from.can_transition_to(Aborted));
        }
    }

    #[test]
    fn attempt_rejects_reentry_after_abort() {
        let dir = tempfile::tempdir().unwrap();
        let mut attempt = HandshakeAttempt::new(dir.path());
        attempt.advance(FetchingQuote).unwrap();
        attempt.abort();
        assert_eq!(attempt.state(), Aborted);

        let err = attempt.advance(FetchingQuote).unwrap_err();
        assert!(matches!(
            err,
            AttestationError::InvalidState {
                from: "Aborted",
                to: "FetchingQuote"
            }
        ));
    }

    #[test]
    fn attempts_get_distinct_scoped_paths() {
        let dir = tempfile::tempdir().unwrap();
        let a = HandshakeAttempt::new(dir.path());
        let b = HandshakeAttempt::new(dir.path());
        assert_ne!(a.id(), b.id());
        assert_ne!(a.quote_path(), b.quote_path());
        assert!(a.quote_path().starts_with(dir.path()));
    }

    #[tokio::test]
    async fn release_removes_quote_copy_and_tolerates_missing() {
        let dir = tempfile::tempdir().unwrap();
        let attempt = HandshakeAttempt::new(dir.path());
        std::fs::write(attempt.quote_path(), b"quote").unwrap();
        attempt.release().await;
        assert!(!attempt.quote_path().exists());
        attempt.release().await;
    }

    #[test]
    fn drop_removes_quote_copy() {
        let dir = tempfile::tempdir().unwrap();
        let attempt = HandshakeAttempt::new(dir.path());
        let path = attempt.quote_path().to_path_buf();
        std::fs::write(&path, b"quote").unwrap();
        drop(attempt);
        assert!(!path.exists());
    }
}
