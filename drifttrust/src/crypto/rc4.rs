// RC4 stream cipher with an initial keystream drop.

use ::rc4::{consts::U20, KeyInit, StreamCipher};
use zeroize::Zeroize;

use crate::crypto::keystream::KeyStream;
use crate::error::{DriftTrustError, Result};

/// Keystream bytes discarded after key scheduling (RC4-drop1024).
pub const RC4_DROP: usize = 1024;

/// Key length accepted by [`Rc4::new`]: one SHA-1 digest.
pub const KEY_LEN: usize = 20;

/// An RC4 engine, used for header encryption, sequence whitening and the
/// payload filter.
pub struct Rc4 {
    cipher: ::rc4::Rc4<U20>,
}

impl Rc4 {
    /// Schedule `key` and discard the first [`RC4_DROP`] keystream bytes.
    pub fn new(key: &[u8]) -> Result<Self> {
        Self::with_drop(key, RC4_DROP)
    }

    /// Schedule `key` and discard the first `drop` keystream bytes.
    pub fn with_drop(key: &[u8], drop: usize) -> Result<Self> {
        let cipher =
            ::rc4::Rc4::<U20>::new_from_slice(key).map_err(|_| DriftTrustError::InvalidKeyLength {
                expected: KEY_LEN,
                actual: key.len(),
            })?;

        let mut rc4 = Self { cipher };
        let mut discard = vec![0u8; drop];
        rc4.cipher.apply_keystream(&mut discard);
        discard.zeroize();
        Ok(rc4)
    }
}

impl KeyStream for Rc4 {
    fn apply(&mut self, data: &mut [u8]) {
        self.cipher.apply_keystream(data);
    }
}

impl std::fmt::Debug for Rc4 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Rc4 { .. }")
    }
}
