//! Peer handshake: build and verify CONNECT_REQUEST/RESPONSE (§4.3, §6)

use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::crypto::signature;
use crate::error::PeerError;
use crate::wire::peer::{ConnectRequest, ConnectResponse};

pub fn build_connect_request(
    identity_fingerprint: &str,
    private_key: &RsaPrivateKey,
    ephemeral_public_key: &[u8; 32],
    encrypted: bool,
) -> Result<ConnectRequest, PeerError> {
    let sig = signature::sign(private_key, ephemeral_public_key)?;
    Ok(ConnectRequest {
        identity_fingerprint: identity_fingerprint.to_string(),
        ephemeral_public_key: ephemeral_public_key.to_vec(),
        signature: sig,
        encrypted,
    })
}

pub fn build_connect_response(
    identity_fingerprint: &str,
    private_key: &RsaPrivateKey,
    ephemeral_public_key: &[u8; 32],
    encrypted: bool,
    accepted: bool,
) -> Result<ConnectResponse, PeerError> {
    let sig = signature::sign(private_key, ephemeral_public_key)?;
    Ok(ConnectResponse {
        identity_fingerprint: identity_fingerprint.to_string(),
        ephemeral_public_key: ephemeral_public_key.to_vec(),
        signature: sig,
        encrypted,
        accepted,
    })
}

/// Verifies the RSA signature over the SHA-256 digest of the ephemeral
/// public key against the claimed identity's RSA public key (§4.3, §3).
pub fn verify_handshake(
    peer_public_key: &RsaPublicKey,
    ephemeral_public_key: &[u8],
    sig: &[u8],
) -> Result<(), PeerError> {
    signature::verify(peer_public_key, ephemeral_public_key, sig).map_err(|_| PeerError::SignatureInvalid {
        peer: String::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::rand_core::OsRng;

    #[test]
    fn request_signature_verifies_against_sender_identity() {
        let private = RsaPrivateKey::new(&mut OsRng, 2048).unwrap();
        let public = RsaPublicKey::from(&private);
        let (_, ephemeral_public) = crate::crypto::x25519::generate_keypair();

        let request = build_connect_request("fingerprint", &private, &ephemeral_public, true).unwrap();
        assert!(verify_handshake(&public, &request.ephemeral_public_key, &request.signature).is_ok());
    }

    #[test]
    fn tampered_ephemeral_key_fails_verification() {
        let private = RsaPrivateKey::new(&mut OsRng, 2048).unwrap();
        let public = RsaPublicKey::from(&private);
        let (_, ephemeral_public) = crate::crypto::x25519::generate_keypair();

        let request = build_connect_request("fingerprint", &private, &ephemeral_public, false).unwrap();
        let mut tampered = request.ephemeral_public_key.clone();
        tampered[0] ^= 1;
        assert!(verify_handshake(&public, &tampered, &request.signature).is_err());
    }
}
