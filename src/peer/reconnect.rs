//! Client-role reconnect policy (§4.3.2, resolved Open Question #1)
//!
//! "Prefer same attempt type on success, otherwise re-STATUS after 10s":
//! if the previous session reached `established` via a given attempt kind,
//! the next reconnect retries that same kind first; otherwise the daemon
//! waits [`crate::peer::nat::RESTART_DISCOVERY_PAUSE`] and re-announces
//! STATUS to let the tracker drive a fresh discovery round.

use crate::peer::nat::AttemptKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    RetryAttemptKind(AttemptKind),
    RestartDiscovery,
}

/// `last_successful_kind` is `Some` only when the previous session actually
/// reached `established` (`PeerSession::successful`); otherwise discovery restarts.
pub fn decide(last_successful_kind: Option<AttemptKind>) -> ReconnectDecision {
    match last_successful_kind {
        Some(kind) => ReconnectDecision::RetryAttemptKind(kind),
        None => ReconnectDecision::RestartDiscovery,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_same_attempt_kind_on_prior_success() {
        assert_eq!(
            decide(Some(AttemptKind::External)),
            ReconnectDecision::RetryAttemptKind(AttemptKind::External)
        );
    }

    #[test]
    fn restarts_discovery_with_no_prior_success() {
        assert_eq!(decide(None), ReconnectDecision::RestartDiscovery);
    }
}
