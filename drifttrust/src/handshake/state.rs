// Handshake state machine.

/// The current state of one side of the reference handshake.
#[derive(Debug)]
pub enum HandshakeState {
    /// No handshake in progress.
    Idle,

    /// Initiator has sent its hello and waits for the responder's.
    HelloSent {
        /// Ephemeral X25519 secret bytes (kept for DH).
        ephemeral_secret: [u8; 32],
        /// Ephemeral X25519 public bytes (sent in the hello).
        ephemeral_public: [u8; 32],
    },

    /// Shared secret agreed.
    Complete,

    /// A message was rejected; the handshake cannot continue.
    Failed,
}

impl HandshakeState {
    /// Human-readable label for the current state (used in error messages).
    pub fn label(&self) -> &'static str {
        match self {
            HandshakeState::Idle => "Idle",
            HandshakeState::HelloSent { .. } => "HelloSent",
            HandshakeState::Complete => "Complete",
            HandshakeState::Failed => "Failed",
        }
    }
}
