//! RSA signing of the ephemeral handshake key (§4.3.3, §3)
//!
//! A peer's long-lived identity is an RSA-2048 keypair (§3). During the
//! handshake it signs the SHA-256 digest of its freshly generated X25519
//! ephemeral public key so the other side can bind the ephemeral DH to a
//! known, persistent identity.

use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::error::CryptoError;

/// Signs `ephemeral_public_key` with the identity's RSA private key
pub fn sign(private_key: &RsaPrivateKey, ephemeral_public_key: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let digest = Sha256::digest(ephemeral_public_key);
    let signing_key = SigningKey::<Sha256>::new(private_key.clone());
    let signature = signing_key.sign_with_rng(&mut rand::thread_rng(), &digest);
    Ok(signature.to_vec())
}

/// Verifies a signature produced by [`sign`] against the claimed identity's
/// RSA public key
pub fn verify(
    public_key: &RsaPublicKey,
    ephemeral_public_key: &[u8],
    signature_bytes: &[u8],
) -> Result<(), CryptoError> {
    let digest = Sha256::digest(ephemeral_public_key);
    let verifying_key = VerifyingKey::<Sha256>::new(public_key.clone());
    let signature = Signature::try_from(signature_bytes).map_err(|_| CryptoError::SignatureInvalid)?;
    verifying_key
        .verify(&digest, &signature)
        .map_err(|_| CryptoError::SignatureInvalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::rand_core::OsRng;

    fn test_keypair() -> (RsaPrivateKey, RsaPublicKey) {
        let private = RsaPrivateKey::new(&mut OsRng, 2048).unwrap();
        let public = RsaPublicKey::from(&private);
        (private, public)
    }

    #[test]
    fn sign_then_verify_succeeds() {
        let (private, public) = test_keypair();
        let ephemeral = [42u8; 32];

        let signature = sign(&private, &ephemeral).unwrap();
        assert!(verify(&public, &ephemeral, &signature).is_ok());
    }

    #[test]
    fn verify_rejects_wrong_identity() {
        let (private, _) = test_keypair();
        let (_, other_public) = test_keypair();
        let ephemeral = [1u8; 32];

        let signature = sign(&private, &ephemeral).unwrap();
        assert!(verify(&other_public, &ephemeral, &signature).is_err());
    }

    #[test]
    fn verify_rejects_tampered_ephemeral_key() {
        let (private, public) = test_keypair();
        let ephemeral = [5u8; 32];
        let mut tampered = ephemeral;
        tampered[0] ^= 1;

        let signature = sign(&private, &ephemeral).unwrap();
        assert!(verify(&public, &tampered, &signature).is_err());
    }
}
