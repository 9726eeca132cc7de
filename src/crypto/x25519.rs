//! X25519 Diffie-Hellman for per-session ephemeral keys (§4.3.3)
//!
//! Each Peer session generates a fresh ephemeral X25519 keypair; the shared
//! secret from both sides' ephemeral DH becomes the symmetric session key
//! fed to [`crate::crypto::aead`].

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

/// Key length for X25519 (both private and public keys are 32 bytes)
pub const KEY_LEN: usize = 32;

/// Generates a new ephemeral X25519 keypair: `(private_key, public_key)`
pub fn generate_keypair() -> ([u8; KEY_LEN], [u8; KEY_LEN]) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (secret.to_bytes(), public.to_bytes())
}

/// Derives the public key from a private key
pub fn public_key(private_key: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    let secret = StaticSecret::from(*private_key);
    PublicKey::from(&secret).to_bytes()
}

/// Performs X25519 Diffie-Hellman, producing the shared session secret
pub fn dh(private_key: &[u8; KEY_LEN], public_key: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    let secret = StaticSecret::from(*private_key);
    let public = PublicKey::from(*public_key);
    secret.diffie_hellman(&public).to_bytes()
}

/// Rejects the all-zero (identity) point; low-order points are caught by
/// x25519-dalek's own DH computation.
pub fn is_valid_public_key(key: &[u8; KEY_LEN]) -> bool {
    !key.iter().all(|&b| b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypair_generation_derives_matching_public_key() {
        let (private, public) = generate_keypair();
        assert!(!private.iter().all(|&b| b == 0));
        assert!(!public.iter().all(|&b| b == 0));
        assert_eq!(public_key(&private), public);
    }

    #[test]
    fn dh_shared_secret_matches_both_sides() {
        let (alice_private, alice_public) = generate_keypair();
        let (bob_private, bob_public) = generate_keypair();

        let shared_alice = dh(&alice_private, &bob_public);
        let shared_bob = dh(&bob_private, &alice_public);

        assert_eq!(shared_alice, shared_bob);
    }

    #[test]
    fn dh_differs_across_peers() {
        let (alice_private, _) = generate_keypair();
        let (_, bob_public) = generate_keypair();
        let (_, carol_public) = generate_keypair();

        let shared_bob = dh(&alice_private, &bob_public);
        let shared_carol = dh(&alice_private, &carol_public);

        assert_ne!(shared_bob, shared_carol);
    }

    #[test]
    fn public_key_derivation_matches_rfc7748_vector() {
        let private = [
            0x77, 0x07, 0x6d, 0x0a, 0x73, 0x18, 0xa5, 0x7d, 0x3c, 0x16, 0xc1, 0x72, 0x51, 0xb2,
            0x66, 0x45, 0xdf, 0x4c, 0x2f, 0x87, 0xeb, 0xc0, 0x99, 0x2a, 0xb1, 0x77, 0xfb, 0xa5,
            0x1d, 0xb9, 0x2c, 0x2a,
        ];
        let expected_public = [
            0x85, 0x20, 0xf0, 0x09, 0x89, 0x30, 0xa7, 0x54, 0x74, 0x8b, 0x7d, 0xdc, 0xb4, 0x3e,
            0xf7, 0x5a, 0x0d, 0xbf, 0x3a, 0x0d, 0x26, 0x38, 0x1a, 0xf4, 0xeb, 0xa4, 0xa9, 0x8e,
            0xaa, 0x9b, 0x4e, 0x6a,
        ];
        assert_eq!(public_key(&private), expected_public);
    }

    #[test]
    fn rejects_zero_public_key() {
        let (_, valid_key) = generate_keypair();
        assert!(is_valid_public_key(&valid_key));
        assert!(!is_valid_public_key(&[0u8; 32]));
    }
}
