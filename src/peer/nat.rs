//! Outbound NAT-traversal attempt ordering for client-role sessions (§4.3.2)
//!
//! (a) each internal address the tracker reports for the peer, dialed
//! directly; (b) on failure, the external (tracker-observed) address,
//! preceded by ten UDP punch packets; (c) on punch failure, wait 10s and
//! re-STATUS the tracker to restart discovery.

use std::net::SocketAddr;
use std::time::Duration;

use crate::peer::utp::UtpEndpoint;

/// Number of UDP punch packets sent before attempting the external address (§4.3.2 (b))
pub const PUNCH_PACKET_COUNT: usize = 10;
/// Pause before giving up and re-announcing STATUS (§4.3.2 (c))
pub const RESTART_DISCOVERY_PAUSE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptKind {
    Internal,
    External,
}

/// One ordered attempt plan for a single discovery round
pub struct AttemptPlan {
    pub internal_addresses: Vec<SocketAddr>,
    pub external_address: Option<SocketAddr>,
}

impl AttemptPlan {
    /// Sends punch probes to the external address ahead of dialing it (§4.3.2 (b))
    pub async fn punch_external(&self, endpoint: &UtpEndpoint) -> std::io::Result<()> {
        let Some(external) = self.external_address else {
            return Ok(());
        };
        for _ in 0..PUNCH_PACKET_COUNT {
            endpoint.send_punch_probe(external).await?;
        }
        Ok(())
    }

    /// The full ordered list of `(addr, kind)` attempts for one discovery round
    pub fn ordered_attempts(&self) -> Vec<(SocketAddr, AttemptKind)> {
        let mut attempts: Vec<_> = self
            .internal_addresses
            .iter()
            .map(|a| (*a, AttemptKind::Internal))
            .collect();
        if let Some(external) = self.external_address {
            attempts.push((external, AttemptKind::External));
        }
        attempts
    }

    /// [`Self::ordered_attempts`], stably reordered so `preferred`'s attempts
    /// come first (resolved Open Question #1, §4.3.2/§4.3.6: "prefer same
    /// attempt type on success").
    pub fn ordered_attempts_preferring(&self, preferred: Option<AttemptKind>) -> Vec<(SocketAddr, AttemptKind)> {
        let mut attempts = self.ordered_attempts();
        if let Some(preferred) = preferred {
            attempts.sort_by_key(|(_, kind)| *kind != preferred);
        }
        attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_addresses_precede_external() {
        let plan = AttemptPlan {
            internal_addresses: vec!["10.0.0.1:1".parse().unwrap(), "10.0.0.2:1".parse().unwrap()],
            external_address: Some("203.0.113.1:1".parse().unwrap()),
        };
        let attempts = plan.ordered_attempts();
        assert_eq!(attempts.len(), 3);
        assert_eq!(attempts[2].1, AttemptKind::External);
        assert!(attempts[..2].iter().all(|(_, kind)| *kind == AttemptKind::Internal));
    }

    #[test]
    fn no_external_address_yields_internal_only() {
        let plan = AttemptPlan {
            internal_addresses: vec!["10.0.0.1:1".parse().unwrap()],
            external_address: None,
        };
        assert_eq!(plan.ordered_attempts().len(), 1);
    }

    #[test]
    fn preferring_external_moves_it_to_the_front() {
        let plan = AttemptPlan {
            internal_addresses: vec!["10.0.0.1:1".parse().unwrap(), "10.0.0.2:1".parse().unwrap()],
            external_address: Some("203.0.113.1:1".parse().unwrap()),
        };
        let attempts = plan.ordered_attempts_preferring(Some(AttemptKind::External));
        assert_eq!(attempts[0].1, AttemptKind::External);
    }

    #[test]
    fn preferring_none_keeps_natural_order() {
        let plan = AttemptPlan {
            internal_addresses: vec!["10.0.0.1:1".parse().unwrap()],
            external_address: Some("203.0.113.1:1".parse().unwrap()),
        };
        let attempts = plan.ordered_attempts_preferring(None);
        assert_eq!(attempts[0].1, AttemptKind::Internal);
    }
}
