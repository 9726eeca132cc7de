//! Peer session state machine (§4.3)

use std::net::SocketAddr;

use rsa::RsaPublicKey;

/// `connecting -> connected -> verified -> established -> closed` (§4.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    Verified,
    Established,
    Closed,
}

/// Which side opened the session — drives the outbound attempt/reconnect
/// policy in §4.3.2, which only applies to the client (outbound-dial) role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Outbound,
    Inbound,
}

pub struct PeerSession {
    pub tracker: String,
    pub tunnel: String,
    pub role: SessionRole,
    pub remote_addr: SocketAddr,
    pub state: SessionState,
    pub peer_fingerprint: Option<String>,
    pub peer_public_key: Option<RsaPublicKey>,
    pub encrypted: bool,
    /// ephemeral X25519 keypair generated fresh for this session (§4.3.3)
    pub local_ephemeral_private: [u8; 32],
    pub local_ephemeral_public: [u8; 32],
    pub remote_ephemeral_public: Option<[u8; 32]>,
    /// memoized DH output, computed once on first encrypt/decrypt (§4.3.3)
    shared_key: Option<[u8; 32]>,
    /// `successful=true` once this session reaches `established`; the
    /// reconnect policy in §4.3.2 prefers the same attempt type when set.
    pub successful: bool,
}

impl PeerSession {
    pub fn new(tracker: String, tunnel: String, role: SessionRole, remote_addr: SocketAddr) -> Self {
        let (local_ephemeral_private, local_ephemeral_public) = crate::crypto::x25519::generate_keypair();
        Self {
            tracker,
            tunnel,
            role,
            remote_addr,
            state: SessionState::Connecting,
            peer_fingerprint: None,
            peer_public_key: None,
            encrypted: false,
            local_ephemeral_private,
            local_ephemeral_public,
            remote_ephemeral_public: None,
            shared_key: None,
            successful: false,
        }
    }

    /// Computes (and memoizes) the shared session key via X25519 DH (§4.3.3)
    pub fn shared_key(&mut self) -> Option<[u8; 32]> {
        if self.shared_key.is_none() {
            let remote = self.remote_ephemeral_public?;
            self.shared_key = Some(crate::crypto::x25519::dh(&self.local_ephemeral_private, &remote));
        }
        self.shared_key
    }

    pub fn is_established(&self) -> bool {
        self.state == SessionState::Established
    }

    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_key_requires_remote_ephemeral_key() {
        let mut session = PeerSession::new(
            "t".into(),
            "n".into(),
            SessionRole::Outbound,
            "127.0.0.1:1".parse().unwrap(),
        );
        assert!(session.shared_key().is_none());

        let (_, remote_public) = crate::crypto::x25519::generate_keypair();
        session.remote_ephemeral_public = Some(remote_public);
        assert!(session.shared_key().is_some());
    }

    #[test]
    fn shared_key_is_memoized() {
        let mut session = PeerSession::new(
            "t".into(),
            "n".into(),
            SessionRole::Outbound,
            "127.0.0.1:1".parse().unwrap(),
        );
        let (_, remote_public) = crate::crypto::x25519::generate_keypair();
        session.remote_ephemeral_public = Some(remote_public);

        let first = session.shared_key();
        let second = session.shared_key();
        assert_eq!(first, second);
    }
}
