//! DriftTrust -- the cryptographic layer beneath the Drift UDP transport.
//!
//! Provides:
//! - **Keystreams**: RC4-drop1024 engines used to encrypt frame headers and
//!   to whiten sequence numbers
//! - **Sequence sources**: keyed PRNGs from which both ends of a session
//!   independently derive the same stream of sequence tuples
//! - **Header keys**: the four directional keys derived from a shared secret
//! - **Reference handshake**: an X25519 exchange that produces that secret

pub mod crypto;
pub mod error;
pub mod handshake;
pub mod keys;

pub use crypto::keystream::KeyStream;
pub use crypto::rc4::Rc4;
pub use crypto::source::{CounterSource, KeyedSequenceSource, SequenceSource};
pub use error::{DriftTrustError, Result};
pub use keys::{derive_header_keys, HeaderKeys, SessionRole};
