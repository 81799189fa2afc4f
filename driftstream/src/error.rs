use thiserror::Error;

/// All errors produced by the DriftStream transport.
#[derive(Debug, Error)]
pub enum DriftStreamError {
    // ── Frame level (dropped, never escalated) ──────────────────────────
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    FrameTooShort { expected: usize, actual: usize },

    #[error("unknown command: 0x{0:02x}")]
    UnknownCommand(u8),

    #[error("header hash mismatch")]
    HashMismatch,

    // ── Protocol violations (fail the connection set) ───────────────────
    #[error("header too large: {size} bytes exceeds maximum {max}")]
    HeaderTooLarge { size: usize, max: usize },

    #[error("packet resend limit exceeded")]
    ResendLimitExceeded,

    #[error("connection limit reached ({0})")]
    ConnectionLimitReached(usize),

    #[error("connection failed during setup phase")]
    SetupFailed,

    #[error("read buffer overflow: {0} segments queued")]
    ReadBufferOverflow(usize),

    // ── Lifecycle ───────────────────────────────────────────────────────
    #[error("connection is closed")]
    ConnectionClosed,

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection set failed: {0}")]
    SetFailed(String),

    #[error("engine is stopped")]
    EngineStopped,

    // ── Handshake ───────────────────────────────────────────────────────
    #[error("handshake error: {0}")]
    Handshake(String),

    #[error(transparent)]
    Crypto(#[from] drifttrust::DriftTrustError),

    // ── Generic ─────────────────────────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, DriftStreamError>;
