// Header key derivation from a session's shared secret.
//
// Four keys are derived, each as SHA-1(iv || secret) with a fixed IV:
//
//   A, B  header keystreams (one per direction)
//   C, D  sequence-source whitening keystreams; also the PRNG seeds
//
// The side that opened the session and the side that accepted it use the
// same four keys with the directions crossed.

use crate::crypto::hash::sha1;
use crate::crypto::rc4::Rc4;
use crate::crypto::source::KeyedSequenceSource;
use crate::error::{DriftTrustError, Result};

const IV_A: &[u8] = b"UDPDriverKeyA";
const IV_B: &[u8] = b"UDPDriverKeyB";
const IV_C: &[u8] = b"UDPDriverKeyC";
const IV_D: &[u8] = b"UDPDriverKeyD";

/// Which end of the session we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// We sent the first handshake frame.
    Outgoing,
    /// We accepted the first handshake frame.
    Incoming,
}

/// Keystreams and sequence sources for one end of a session.
pub struct HeaderKeys {
    pub header_out: Rc4,
    pub header_in: Rc4,
    pub sequence_out: KeyedSequenceSource,
    pub sequence_in: KeyedSequenceSource,
    /// Seed for the per-session padding / jitter PRNG.
    pub padding_seed: u64,
}

impl std::fmt::Debug for HeaderKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeaderKeys").finish_non_exhaustive()
    }
}

fn seed(bytes: &[u8; 20], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_be_bytes(buf)
}

/// Derive the header keys for `role` from `secret`.
pub fn derive_header_keys(secret: &[u8], role: SessionRole) -> Result<HeaderKeys> {
    if secret.is_empty() {
        return Err(DriftTrustError::EmptySecret);
    }

    let a_key = sha1(&[IV_A, secret]);
    let b_key = sha1(&[IV_B, secret]);
    let c_key = sha1(&[IV_C, secret]);
    let d_key = sha1(&[IV_D, secret]);

    let keys = match role {
        SessionRole::Incoming => HeaderKeys {
            header_out: Rc4::new(&a_key)?,
            header_in: Rc4::new(&b_key)?,
            sequence_out: KeyedSequenceSource::new(seed(&d_key, 0), Rc4::new(&c_key)?),
            sequence_in: KeyedSequenceSource::new(seed(&c_key, 0), Rc4::new(&d_key)?),
            padding_seed: seed(&d_key, 8),
        },
        SessionRole::Outgoing => HeaderKeys {
            header_out: Rc4::new(&b_key)?,
            header_in: Rc4::new(&a_key)?,
            sequence_out: KeyedSequenceSource::new(seed(&c_key, 0), Rc4::new(&d_key)?),
            sequence_in: KeyedSequenceSource::new(seed(&d_key, 0), Rc4::new(&c_key)?),
            padding_seed: seed(&c_key, 8),
        },
    };
    Ok(keys)
}
