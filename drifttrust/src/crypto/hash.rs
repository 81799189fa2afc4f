// SHA-1 helpers: truncated header hash and keyed derivation.

use sha1::{Digest, Sha1};

/// Length of the truncated hash that closes every encrypted header.
pub const HEADER_HASH_LEN: usize = 4;

/// SHA-1 over the concatenation of `parts`.
pub fn sha1(parts: &[&[u8]]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Truncated SHA-1 over `(seq || header)`.
///
/// `seq` is the cleartext real sequence number; `header` is the plaintext
/// header region before the hash is appended.
pub fn header_hash(seq: &[u8], header: &[u8]) -> [u8; HEADER_HASH_LEN] {
    let digest = sha1(&[seq, header]);
    let mut out = [0u8; HEADER_HASH_LEN];
    out.copy_from_slice(&digest[..HEADER_HASH_LEN]);
    out
}
