// Handshake messages exchanged during the reference key agreement.

use rand::RngCore;

use crate::crypto::x25519::PUBLIC_KEY_LEN;
use crate::error::{DriftTrustError, Result};

/// Largest padding a hello may carry.
pub const MAX_PADDING: usize = 512;

/// Fixed part of a hello: public key plus the 2-byte padding length.
pub const HELLO_PREFIX_LEN: usize = PUBLIC_KEY_LEN + 2;

/// A hello, sent once in each direction.
///
/// ```text
/// +----------------+-------------+-------------------+
/// | ephemeral pub  | pad_len u16 | random padding    |
/// | (32B)          | (BE)        | (pad_len bytes)   |
/// +----------------+-------------+-------------------+
/// ```
///
/// The padding hides the otherwise fixed message length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub ephemeral_pub: [u8; PUBLIC_KEY_LEN],
    pub padding: Vec<u8>,
}

impl Hello {
    /// Build a hello with `padding_len` random padding bytes.
    pub fn with_random_padding(ephemeral_pub: [u8; PUBLIC_KEY_LEN], padding_len: usize) -> Result<Self> {
        if padding_len > MAX_PADDING {
            return Err(DriftTrustError::PaddingTooLarge {
                size: padding_len,
                max: MAX_PADDING,
            });
        }
        let mut padding = vec![0u8; padding_len];
        rand::thread_rng().fill_bytes(&mut padding);
        Ok(Self {
            ephemeral_pub,
            padding,
        })
    }

    pub fn encoded_len(&self) -> usize {
        HELLO_PREFIX_LEN + self.padding.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&self.ephemeral_pub);
        out.extend_from_slice(&(self.padding.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.padding);
        out
    }

    /// Total length of a hello given at least its first [`HELLO_PREFIX_LEN`] bytes.
    pub fn total_len(prefix: &[u8]) -> Result<usize> {
        if prefix.len() < HELLO_PREFIX_LEN {
            return Err(DriftTrustError::MessageTruncated {
                need: HELLO_PREFIX_LEN,
                have: prefix.len(),
            });
        }
        let pad = u16::from_be_bytes([prefix[PUBLIC_KEY_LEN], prefix[PUBLIC_KEY_LEN + 1]]) as usize;
        if pad > MAX_PADDING {
            return Err(DriftTrustError::PaddingTooLarge {
                size: pad,
                max: MAX_PADDING,
            });
        }
        Ok(HELLO_PREFIX_LEN + pad)
    }

    /// Decode a hello from the front of `data`, returning it and the bytes consumed.
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        let total = Self::total_len(data)?;
        if data.len() < total {
            return Err(DriftTrustError::MessageTruncated {
                need: total,
                have: data.len(),
            });
        }
        let mut ephemeral_pub = [0u8; PUBLIC_KEY_LEN];
        ephemeral_pub.copy_from_slice(&data[..PUBLIC_KEY_LEN]);
        let padding = data[HELLO_PREFIX_LEN..total].to_vec();
        Ok((
            Self {
                ephemeral_pub,
                padding,
            },
            total,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode() {
        let hello = Hello::with_random_padding([3u8; 32], 70).unwrap();
        let mut wire = hello.encode();
        assert_eq!(wire.len(), 32 + 2 + 70);
        wire.extend_from_slice(b"trailing");

        let (decoded, used) = Hello::decode(&wire).unwrap();
        assert_eq!(decoded, hello);
        assert_eq!(used, 104);
    }

    #[test]
    fn truncated_reports_need() {
        let hello = Hello::with_random_padding([3u8; 32], 10).unwrap();
        let wire = hello.encode();
        match Hello::decode(&wire[..40]) {
            Err(DriftTrustError::MessageTruncated { need, have }) => {
                assert_eq!(need, 44);
                assert_eq!(have, 40);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn oversized_padding_rejected() {
        assert!(Hello::with_random_padding([0u8; 32], MAX_PADDING + 1).is_err());

        let mut wire = vec![0u8; HELLO_PREFIX_LEN];
        wire[32..34].copy_from_slice(&(MAX_PADDING as u16 + 1).to_be_bytes());
        assert!(matches!(
            Hello::total_len(&wire),
            Err(DriftTrustError::PaddingTooLarge { .. })
        ));
    }
}
