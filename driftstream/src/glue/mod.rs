//! Datagram glue: the boundary between the engine and a datagram network.
//!
//! - [`udp`]: tokio UDP socket with a send queue
//! - [`loopback`]: in-memory network with latency and drop policies

pub mod loopback;
pub mod udp;

use std::net::SocketAddr;
use std::sync::Weak;

use bytes::Bytes;

use crate::error::Result;

/// Receives datagrams from the glue.
pub trait DatagramListener: Send + Sync {
    fn receive(&self, local_port: u16, remote: SocketAddr, data: &[u8]);
}

/// Sends datagrams on behalf of the engine.
pub trait DatagramGlue: Send + Sync {
    /// Queue `data` for `remote`. Must not block.
    fn send(&self, local_port: u16, remote: SocketAddr, data: Bytes) -> Result<()>;

    /// Route received datagrams to `listener`.
    fn attach(&self, listener: Weak<dyn DatagramListener>);
}

/// Offered datagrams before the engine sees them. Returns true to claim one.
pub trait PrimordialHandler: Send + Sync {
    fn packet_received(&self, remote: SocketAddr, data: &[u8]) -> bool;
}
