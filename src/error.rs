//! Error types for the bhid tunneling daemon

use thiserror::Error;

/// Top-level error type returned from daemon operations
#[derive(Error, Debug)]
pub enum BhidError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),

    #[error("Front plane error: {0}")]
    Front(#[from] FrontError),

    #[error("Control socket error: {0}")]
    Control(#[from] ControlError),

    #[error("System error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration file errors (fatal at init, per spec §7)
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {path}")]
    FileNotFound { path: String },

    #[error("Invalid config format at line {line}: {message}")]
    ParseError { line: usize, message: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid port: {value}")]
    InvalidPort { value: String },

    #[error("MTU {value} is below the minimum of 21")]
    MtuTooSmall { value: u16 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Connections Registry errors
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("No entry for {tracker}#{name}")]
    NotFound { tracker: String, name: String },

    #[error("Failed to persist registry: {reason}")]
    PersistFailed { reason: String },

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cryptographic operation errors
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("RSA key generation failed: {reason}")]
    KeyGeneration { reason: String },

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("RSA signature invalid")]
    SignatureInvalid,

    #[error("Encryption failed")]
    Encryption,

    #[error("Decryption failed: invalid ciphertext or nonce")]
    Decryption,

    #[error("Malformed PEM: {reason}")]
    MalformedPem { reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tracker Client errors (§4.2, §7)
#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("Connect to {host}:{port} failed: {reason}")]
    ConnectFailed {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("TLS handshake failed: {reason}")]
    Tls { reason: String },

    #[error("Protocol decode error: {reason}")]
    Decode { reason: String },

    #[error("Tracker session timed out")]
    Timeout,

    #[error("Daemon is not registered with this tracker")]
    NotRegistered,

    #[error("Tracker rejected the request: {reason}")]
    Rejected { reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Peer Engine errors (§4.3, §7)
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Failed to bind UTP endpoint on {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    #[error("Handshake signature verification failed for peer {peer}")]
    SignatureInvalid { peer: String },

    #[error("Session did not reach established state within the establish deadline")]
    EstablishTimeout,

    #[error("Peer {peer} rejected by tunnel policy")]
    PolicyRejected { peer: String },

    #[error("Protocol decode error: {reason}")]
    Decode { reason: String },

    #[error("Identity for peer {peer} could not be resolved")]
    IdentityNotFound { peer: String },

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Front Plane errors (§4.4, §7)
#[derive(Error, Debug)]
pub enum FrontError {
    #[error("Failed to dial local service at {addr}: {reason}")]
    DialFailed { addr: String, reason: String },

    #[error("Failed to bind front listener on {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Control socket errors (§6 "Local control socket", SPEC_FULL §3)
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Failed to bind control socket at {path}: {reason}")]
    BindFailed { path: String, reason: String },

    #[error("Malformed control request: {reason}")]
    Decode { reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BhidError {
    /// User-facing message with a remediation hint, printed verbatim by the CLI shell
    pub fn user_message(&self) -> String {
        match self {
            Self::Config(ConfigError::FileNotFound { path }) => {
                format!("Config file not found: {path}\n  Check the path and try again.")
            }
            Self::Peer(PeerError::BindFailed { addr, reason }) => {
                format!(
                    "Could not bind the peer UTP endpoint on {addr}: {reason}\n  \
                     Another process may already be using this UDP port."
                )
            }
            Self::Tracker(TrackerError::ConnectFailed { host, port, reason }) => {
                format!("Could not reach tracker {host}:{port}: {reason}")
            }
            other => format!("{other}"),
        }
    }

    /// Process exit code, per spec §6 (non-zero on unrecoverable init failure)
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 1,
            Self::Peer(PeerError::BindFailed { .. }) => 2,
            Self::Registry(_) => 3,
            Self::Tracker(_) => 4,
            Self::Peer(_) => 5,
            Self::Front(_) => 6,
            Self::Crypto(_) => 7,
            Self::Control(_) => 8,
            Self::Io(_) => 9,
        }
    }
}

pub type Result<T> = std::result::Result<T, BhidError>;
