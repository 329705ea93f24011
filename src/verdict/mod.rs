pub mod listener;
pub mod relay;

#[cfg(feature = "mock")]
pub mod stub;

use std::fmt;

use crate::handshake::AttemptId;

/// Wire token the verifier sends for a passing quote.
pub const PASS_TOKEN: &[u8] = b"1";

/// Most bytes read from a verdict connection.
pub const MAX_VERDICT_REPORT_LEN: usize = 32;

/// Encode a verdict report: the token, one space, then the attempt id echoed
/// from the relay metadata record.
pub fn encode_report(token: &[u8], attempt: AttemptId) -> Vec<u8> {
    let mut report = Vec::with_capacity(token.len() + 18);
    report.extend_from_slice(token);
    report.push(b' ');
    report.extend_from_slice(attempt.to_string().as_bytes());
    report.push(b'\n');
    report
}

/// Outcome of verifying the destination's quote for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail,
    /// No verdict arrived (timeout or the listener task died).
    Indeterminate,
}

impl Verdict {
    /// Map a verdict report received for `attempt` to a verdict.
    ///
    /// Trailing whitespace and NUL terminators are ignored. After that the
    /// report passes only if it is exactly `"1 <attempt>"`; a report echoing
    /// any other attempt is a failure.
    pub fn from_report(report: &[u8], attempt: AttemptId) -> Self {
        let end = report
            .iter()
            .rposition(|b| !b.is_ascii_whitespace() && *b != 0)
            .map_or(0, |i| i + 1);
        let mut parts = report[..end].splitn(2, |b| *b == b' ');
        let token = parts.next().unwrap_or_default();
        let echoed = parts.next().unwrap_or_default();
        if echoed != attempt.to_string().as_bytes() {
            tracing::warn!(
                expected = %attempt,
                echoed = %String::from_utf8_lossy(echoed),
                "verdict report is for another attempt"
            );
            return Verdict::Fail;
        }
        if token == PASS_TOKEN {
            Verdict::Pass
        } else {
            Verdict::Fail
        }
    }

    pub fn is_pass(self) -> bool {
        self == Verdict::Pass
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Verdict::Pass => "pass",
            Verdict::Fail => "fail",
            Verdict::Indeterminate => "indeterminate",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt() -> AttemptId {
        AttemptId::from(0xdead_beef_u64)
    }

    #[test]
    fn only_exact_one_with_own_attempt_passes() {
        let a = attempt();
        assert_eq!(Verdict::from_report(b"1 00000000deadbeef", a), Verdict::Pass);
        assert_eq!(Verdict::from_report(b"1 00000000deadbeef\n", a), Verdict::Pass);
        assert_eq!(Verdict::from_report(b"1 00000000deadbeef\0", a), Verdict::Pass);
        assert_eq!(Verdict::from_report(&encode_report(b"1", a), a), Verdict::Pass);

        assert_eq!(Verdict::from_report(b"0 00000000deadbeef", a), Verdict::Fail);
        assert_eq!(Verdict::from_report(b"11 00000000deadbeef", a), Verdict::Fail);
        assert_eq!(Verdict::from_report(b" 1 00000000deadbeef", a), Verdict::Fail);
        assert_eq!(Verdict::from_report(b"true 00000000deadbeef", a), Verdict::Fail);
        assert_eq!(Verdict::from_report(b"", a), Verdict::Fail);
    }

    #[test]
    fn pass_without_matching_attempt_fails() {
        let a = attempt();
        assert_eq!(Verdict::from_report(b"1", a), Verdict::Fail);
        assert_eq!(Verdict::from_report(b"1\n", a), Verdict::Fail);
        assert_eq!(Verdict::from_report(b"1 deadbeef", a), Verdict::Fail);
        assert_eq!(Verdict::from_report(b"1 00000000deadbeee", a), Verdict::Fail);
        let other = encode_report(b"1", AttemptId::from(7_u64));
        assert_eq!(Verdict::from_report(&other, a), Verdict::Fail);
    }
}
