// X25519 Diffie-Hellman key agreement for the reference handshake.

use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{DriftTrustError, Result};

/// Size of an X25519 public key on the wire.
pub const PUBLIC_KEY_LEN: usize = 32;

/// An X25519 ephemeral keypair for one handshake.
pub struct X25519KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl X25519KeyPair {
    /// Generate a new random ephemeral keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Create from existing secret bytes (used in deterministic tests).
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_LEN] {
        *self.public.as_bytes()
    }

    /// Diffie-Hellman with the peer's public key. Rejects low-order peer keys.
    pub fn diffie_hellman(&self, peer_public: &[u8; PUBLIC_KEY_LEN]) -> Result<[u8; 32]> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*peer_public));
        if !shared.was_contributory() {
            return Err(DriftTrustError::WeakPeerKey);
        }
        Ok(*shared.as_bytes())
    }
}

/// Length of each payload filter key (an RC4 key).
pub const PAYLOAD_KEY_LEN: usize = 20;

/// Output of a completed handshake.
///
/// `secret` keys the frame headers; the two payload keys key the stream
/// filter in each direction.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionSecret {
    pub secret: [u8; 32],
    pub initiator_payload_key: [u8; PAYLOAD_KEY_LEN],
    pub responder_payload_key: [u8; PAYLOAD_KEY_LEN],
}

impl std::fmt::Debug for SessionSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionSecret { .. }")
    }
}

/// Derive the session secret from a DH output.
///
/// ```text
/// prk                   = HKDF-Extract(salt = initiator_pub || responder_pub, ikm = shared)
/// secret                = HKDF-Expand(prk, "drift session secret", 32)
/// initiator_payload_key = HKDF-Expand(prk, "drift initiator payload", 20)
/// responder_payload_key = HKDF-Expand(prk, "drift responder payload", 20)
/// ```
pub fn derive_session_secret(
    shared: &[u8; 32],
    initiator_public: &[u8; PUBLIC_KEY_LEN],
    responder_public: &[u8; PUBLIC_KEY_LEN],
) -> Result<SessionSecret> {
    let mut salt = [0u8; PUBLIC_KEY_LEN * 2];
    salt[..PUBLIC_KEY_LEN].copy_from_slice(initiator_public);
    salt[PUBLIC_KEY_LEN..].copy_from_slice(responder_public);
    let hk = Hkdf::<Sha256>::new(Some(&salt), shared);

    Ok(SessionSecret {
        secret: expand(&hk, b"drift session secret")?,
        initiator_payload_key: expand(&hk, b"drift initiator payload")?,
        responder_payload_key: expand(&hk, b"drift responder payload")?,
    })
}

fn expand<const N: usize>(hk: &Hkdf<Sha256>, label: &[u8]) -> Result<[u8; N]> {
    let mut out = [0u8; N];
    hk.expand(label, &mut out)
        .map_err(|e| DriftTrustError::KeyDerivation(format!("HKDF expand error: {e}")))?;
    Ok(out)
}
