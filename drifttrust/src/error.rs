// DriftTrust error types

use thiserror::Error;

/// Top-level error type for the DriftTrust crate.
#[derive(Debug, Error)]
pub enum DriftTrustError {
    // ── Key material ────────────────────────────────────────────────────
    #[error("shared secret is empty")]
    EmptySecret,

    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    // ── Handshake errors ────────────────────────────────────────────────
    #[error("handshake message truncated: need {need} bytes, have {have}")]
    MessageTruncated { need: usize, have: usize },

    #[error("handshake padding too large: {size} bytes exceeds maximum {max}")]
    PaddingTooLarge { size: usize, max: usize },

    #[error("invalid handshake state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("peer public key is a low-order point")]
    WeakPeerKey,
}

/// Crate-level result alias.
pub type Result<T> = std::result::Result<T, DriftTrustError>;
