//! Session payload encryption (§4.3.4, §6 `EncryptedData`)
//!
//! Once a Peer session reaches `established`, every inner message is
//! wrapped in ChaCha20-Poly1305 with a fresh random nonce per message
//! (rather than a counter-derived one — unlike a single long-lived
//! transport tunnel, bhid sessions carry bursty, independently-keyed
//! tunnel streams multiplexed over one wire, so a counter would have to be
//! shared and ordered across all of them for no real benefit).

use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng, Payload},
    AeadCore, ChaCha20Poly1305, Key, Nonce,
};

use crate::error::CryptoError;

/// Authentication tag length
pub const TAG_LEN: usize = 16;
/// ChaCha20-Poly1305 key length
pub const KEY_LEN: usize = 32;
/// ChaCha20-Poly1305 nonce length
pub const NONCE_LEN: usize = 12;

/// A sealed payload as carried on the wire: `EncryptedData{nonce, ciphertext}`
#[derive(Debug, Clone)]
pub struct EncryptedData {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

/// Seals `plaintext` under `key`, generating a fresh random nonce
pub fn seal(key: &[u8; KEY_LEN], plaintext: &[u8], aad: &[u8]) -> Result<EncryptedData, CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::Encryption)?;

    Ok(EncryptedData {
        nonce: nonce.into(),
        ciphertext,
    })
}

/// Opens an [`EncryptedData`] sealed with [`seal`]
pub fn open(key: &[u8; KEY_LEN], data: &EncryptedData, aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.ciphertext.len() < TAG_LEN {
        return Err(CryptoError::Decryption);
    }

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let nonce = Nonce::from_slice(&data.nonce);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: &data.ciphertext,
                aad,
            },
        )
        .map_err(|_| CryptoError::Decryption)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let key = [7u8; KEY_LEN];
        let plaintext = b"inner message payload";
        let aad = b"session-id";

        let sealed = seal(&key, plaintext, aad).unwrap();
        let opened = open(&key, &sealed, aad).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn open_rejects_wrong_key() {
        let key = [7u8; KEY_LEN];
        let wrong_key = [9u8; KEY_LEN];
        let sealed = seal(&key, b"data", b"aad").unwrap();
        assert!(open(&wrong_key, &sealed, b"aad").is_err());
    }

    #[test]
    fn open_rejects_tampered_ciphertext() {
        let key = [7u8; KEY_LEN];
        let mut sealed = seal(&key, b"data", b"aad").unwrap();
        let last = sealed.ciphertext.len() - 1;
        sealed.ciphertext[last] ^= 0xff;
        assert!(open(&key, &sealed, b"aad").is_err());
    }

    #[test]
    fn open_rejects_wrong_aad() {
        let key = [7u8; KEY_LEN];
        let sealed = seal(&key, b"data", b"correct").unwrap();
        assert!(open(&key, &sealed, b"wrong").is_err());
    }

    #[test]
    fn successive_seals_use_distinct_nonces() {
        let key = [1u8; KEY_LEN];
        let a = seal(&key, b"same plaintext", b"").unwrap();
        let b = seal(&key, b"same plaintext", b"").unwrap();
        assert_ne!(a.nonce, b.nonce);
    }

    #[test]
    fn empty_plaintext_seals_to_just_the_tag() {
        let key = [0u8; KEY_LEN];
        let sealed = seal(&key, &[], b"").unwrap();
        assert_eq!(sealed.ciphertext.len(), TAG_LEN);
        assert!(open(&key, &sealed, b"").unwrap().is_empty());
    }
}
