//! DriftStream -- reliable, ordered, encrypted transport over UDP datagrams.
//!
//! Many logical connections to one remote endpoint share a single
//! connection set, which provides:
//! - **Header encryption**: RC4 keystreams derived from the handshake secret,
//!   with a truncated SHA-1 integrity hash per frame
//! - **Keyed sequencing**: both ends derive the same unpredictable sequence
//!   numbers; an alternate echoed in cleartext doubles as an implicit ACK
//! - **Reliability**: retransmission, explicit and lazy ACKs, out-of-order
//!   reassembly and an adaptive timer base negotiated with the peer
//! - **Multiplexing**: up to 128 connections per set, each closed
//!   independently
//!
//! An [`Engine`] demultiplexes datagrams from a [`glue`] implementation,
//! rate-limits new inbound sessions and drives the protocol timers.
//! Consumers see each connection as a non-blocking, selectable
//! [`TransportAdapter`].

pub mod bloom;
pub mod config;
pub mod connection;
pub mod connection_set;
pub mod error;
pub mod frame;
pub mod glue;
pub mod handshake;
pub mod manager;
pub mod packet;
pub mod rate_limit;
pub mod selector;
pub mod sequence;
pub mod timer;
pub mod transmit;
pub mod transport;
pub mod window;

// Re-export key public types at crate root.
pub use config::{EngineConfig, RateLimitConfig};
pub use connection::{Connection, ConnectionState};
pub use connection_set::{ConnectionSet, SessionCrypto, SessionKey, SetStats};
pub use error::{DriftStreamError, Result};
pub use frame::Command;
pub use handshake::{CryptoHandshake, HandshakeListener, X25519Handshake};
pub use manager::{ConnectListener, Engine, EngineStats, IncomingListener};
pub use rate_limit::{IncomingRateLimiter, RateDecision};
pub use selector::{SelectListener, Selector};
pub use transport::{SelectableTransport, TransportAdapter, TransportFilter};
