pub mod hash;
pub mod keystream;
pub mod rc4;
pub mod source;
pub mod x25519;
