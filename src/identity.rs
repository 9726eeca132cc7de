//! Cryptographic identity (§3)
//!
//! Each daemon instance has one long-lived RSA-2048 keypair. Its fingerprint
//! — `hex(sha256(base64(pem_public_key)))` — is the identity peers and the
//! tracker use to recognize it. Known peers' public keys are cached on disk
//! as `<peer-name>.rsa` files under a peers directory so repeat handshakes
//! don't require a fresh lookup.

use std::fs;
use std::path::{Path, PathBuf};

use base64::Engine;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey};
use rsa::rand_core::OsRng;
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::error::CryptoError;

/// RSA key size used for identities (§3)
pub const KEY_BITS: usize = 2048;

/// A daemon's own persistent identity
pub struct Identity {
    pub private_key: RsaPrivateKey,
    pub public_key: RsaPublicKey,
    pub fingerprint: String,
}

impl Identity {
    /// Loads the identity from `private_key_path`, generating and
    /// persisting a fresh RSA-2048 keypair if no file exists yet.
    pub fn load_or_generate(private_key_path: &Path) -> Result<Self, CryptoError> {
        let private_key = if private_key_path.exists() {
            let pem = fs::read_to_string(private_key_path)?;
            RsaPrivateKey::from_pkcs1_pem(&pem).map_err(|e| CryptoError::MalformedPem {
                reason: e.to_string(),
            })?
        } else {
            let key = RsaPrivateKey::new(&mut OsRng, KEY_BITS)
                .map_err(|e| CryptoError::KeyGeneration { reason: e.to_string() })?;
            write_private_key(private_key_path, &key)?;
            key
        };

        let public_key = RsaPublicKey::from(&private_key);
        let fingerprint = fingerprint_of(&public_key)?;

        Ok(Self {
            private_key,
            public_key,
            fingerprint,
        })
    }
}

/// `hex(sha256(base64(pem_public_key_string)))` (§3, resolved Open Question)
pub fn fingerprint_of(public_key: &RsaPublicKey) -> Result<String, CryptoError> {
    let pem = public_key
        .to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)
        .map_err(|e| CryptoError::MalformedPem { reason: e.to_string() })?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(pem.as_bytes());
    let digest = Sha256::digest(encoded.as_bytes());
    Ok(hex::encode(digest))
}

fn write_private_key(path: &Path, key: &RsaPrivateKey) -> Result<(), CryptoError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let pem = key
        .to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)
        .map_err(|e| CryptoError::MalformedPem { reason: e.to_string() })?;
    fs::write(path, pem.as_bytes())?;
    restrict_permissions(path, 0o600)?;
    Ok(())
}

#[cfg(unix)]
fn restrict_permissions(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(mode);
    fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

/// On-disk cache of known peers' public keys, one `<name>.rsa` file each
pub struct PeerDirectory {
    dir: PathBuf,
}

impl PeerDirectory {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, peer_name: &str) -> PathBuf {
        self.dir.join(format!("{peer_name}.rsa"))
    }

    pub fn load(&self, peer_name: &str) -> Result<Option<RsaPublicKey>, CryptoError> {
        let path = self.path_for(peer_name);
        if !path.exists() {
            return Ok(None);
        }
        let pem = fs::read_to_string(path)?;
        let key = RsaPublicKey::from_pkcs1_pem(&pem).map_err(|e| CryptoError::MalformedPem {
            reason: e.to_string(),
        })?;
        Ok(Some(key))
    }

    pub fn store(&self, peer_name: &str, public_key: &RsaPublicKey) -> Result<(), CryptoError> {
        fs::create_dir_all(&self.dir)?;
        let pem = public_key
            .to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)
            .map_err(|e| CryptoError::MalformedPem { reason: e.to_string() })?;
        let path = self.path_for(peer_name);
        fs::write(&path, pem.as_bytes())?;
        restrict_permissions(&path, 0o644)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_and_reloads_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");

        let first = Identity::load_or_generate(&path).unwrap();
        let second = Identity::load_or_generate(&path).unwrap();

        assert_eq!(first.fingerprint, second.fingerprint);
    }

    #[test]
    fn fingerprint_is_stable_for_the_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");
        let identity = Identity::load_or_generate(&path).unwrap();

        let recomputed = fingerprint_of(&identity.public_key).unwrap();
        assert_eq!(identity.fingerprint, recomputed);
    }

    #[test]
    fn peer_directory_round_trips_a_public_key() {
        let dir = tempfile::tempdir().unwrap();
        let identity_path = dir.path().join("identity.key");
        let identity = Identity::load_or_generate(&identity_path).unwrap();

        let peers = PeerDirectory::new(dir.path().join("peers"));
        peers.store("alice", &identity.public_key).unwrap();

        let loaded = peers.load("alice").unwrap().unwrap();
        assert_eq!(
            fingerprint_of(&loaded).unwrap(),
            fingerprint_of(&identity.public_key).unwrap()
        );
    }

    #[test]
    fn peer_directory_returns_none_for_unknown_peer() {
        let dir = tempfile::tempdir().unwrap();
        let peers = PeerDirectory::new(dir.path().to_path_buf());
        assert!(peers.load("nobody").unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn private_key_file_is_not_group_or_world_readable() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");
        Identity::load_or_generate(&path).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}
