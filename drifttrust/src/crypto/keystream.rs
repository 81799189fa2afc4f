// Directional keystream abstraction used for header encryption.

/// A stateful keystream that XORs its output into a buffer.
///
/// Encryption and decryption are the same operation. Both ends of a session
/// must apply the stream to exactly the same byte positions in the same
/// order, or every later header fails to decrypt.
pub trait KeyStream: Send {
    /// XOR the next `data.len()` keystream bytes into `data`.
    fn apply(&mut self, data: &mut [u8]);

    /// Whiten a single 32-bit value (big-endian byte order).
    fn apply_u32(&mut self, value: u32) -> u32 {
        let mut bytes = value.to_be_bytes();
        self.apply(&mut bytes);
        u32::from_be_bytes(bytes)
    }
}

impl<K: KeyStream + ?Sized> KeyStream for Box<K> {
    fn apply(&mut self, data: &mut [u8]) {
        (**self).apply(data)
    }
}
