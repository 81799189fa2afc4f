// Reference handshake: one hello in each direction, X25519 + HKDF.
//
//   Initiator                     Responder
//     |--- Hello (pub_i, pad) ------->|   responder derives the secret
//     |<-- Hello (pub_r, pad) --------|   initiator derives the secret
//
// Both messages are sent in the clear. Only the key agreement is provided;
// peer authentication belongs to the layers above.

use rand::RngCore;
use zeroize::Zeroize;

use crate::crypto::x25519::{derive_session_secret, SessionSecret, X25519KeyPair};
use crate::error::{DriftTrustError, Result};
use crate::handshake::messages::Hello;
use crate::handshake::state::HandshakeState;

fn transition_error(from: &HandshakeState, to: &str) -> DriftTrustError {
    DriftTrustError::InvalidStateTransition {
        from: from.label().into(),
        to: to.into(),
    }
}

// ── Initiator ────────────────────────────────────────────────────────────

/// Side that opens the session.
pub struct Initiator {
    state: HandshakeState,
}

impl Initiator {
    pub fn new() -> Self {
        Self {
            state: HandshakeState::Idle,
        }
    }

    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    /// Step 1: create the opening hello with `padding_len` bytes of padding.
    pub fn create_hello(&mut self, padding_len: usize) -> Result<Hello> {
        if !matches!(self.state, HandshakeState::Idle) {
            return Err(transition_error(&self.state, "HelloSent"));
        }

        let mut secret_bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut secret_bytes);
        let keypair = X25519KeyPair::from_secret_bytes(secret_bytes);
        let hello = Hello::with_random_padding(keypair.public_key_bytes(), padding_len)?;

        self.state = HandshakeState::HelloSent {
            ephemeral_secret: secret_bytes,
            ephemeral_public: keypair.public_key_bytes(),
        };
        secret_bytes.zeroize();
        Ok(hello)
    }

    /// Step 3: process the responder's hello and derive the session secret.
    pub fn process_reply(&mut self, reply: &Hello) -> Result<SessionSecret> {
        let (secret_bytes, our_public) = match &self.state {
            HandshakeState::HelloSent {
                ephemeral_secret,
                ephemeral_public,
            } => (*ephemeral_secret, *ephemeral_public),
            other => return Err(transition_error(other, "Complete")),
        };

        let keypair = X25519KeyPair::from_secret_bytes(secret_bytes);
        let shared = match keypair.diffie_hellman(&reply.ephemeral_pub) {
            Ok(shared) => shared,
            Err(e) => {
                self.state = HandshakeState::Failed;
                return Err(e);
            }
        };
        let secret = derive_session_secret(&shared, &our_public, &reply.ephemeral_pub)?;
        self.state = HandshakeState::Complete;
        Ok(secret)
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state, HandshakeState::Complete)
    }
}

impl Default for Initiator {
    fn default() -> Self {
        Self::new()
    }
}

// ── Responder ────────────────────────────────────────────────────────────

/// Side that accepts the session.
pub struct Responder {
    state: HandshakeState,
}

impl Responder {
    pub fn new() -> Self {
        Self {
            state: HandshakeState::Idle,
        }
    }

    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    /// Step 2: process the initiator's hello, returning our hello and the secret.
    pub fn process_hello(&mut self, hello: &Hello, padding_len: usize) -> Result<(Hello, SessionSecret)> {
        if !matches!(self.state, HandshakeState::Idle) {
            return Err(transition_error(&self.state, "Complete"));
        }

        let keypair = X25519KeyPair::generate();
        let shared = match keypair.diffie_hellman(&hello.ephemeral_pub) {
            Ok(shared) => shared,
            Err(e) => {
                self.state = HandshakeState::Failed;
                return Err(e);
            }
        };
        let secret =
            derive_session_secret(&shared, &hello.ephemeral_pub, &keypair.public_key_bytes())?;
        let reply = Hello::with_random_padding(keypair.public_key_bytes(), padding_len)?;

        self.state = HandshakeState::Complete;
        Ok((reply, secret))
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state, HandshakeState::Complete)
    }
}

impl Default for Responder {
    fn default() -> Self {
        Self::new()
    }
}
