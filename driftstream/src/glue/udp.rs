//! UDP glue over a tokio socket.
//!
//! A receive task dispatches datagrams: those without the reserved prefix
//! go to the primordial handlers only (another protocol shares the port),
//! the rest are offered to the handlers first and then to the engine. Sends
//! are queued to a send task so the engine never blocks on the socket.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{DriftStreamError, Result};
use crate::frame::has_reserved_prefix;
use crate::glue::{DatagramGlue, DatagramListener, PrimordialHandler};

const RECV_BUFFER: usize = 65_536;

#[derive(Debug, Default)]
pub struct UdpGlueStats {
    pub datagrams_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub datagrams_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub primordial_claimed: AtomicU64,
    pub legacy_unclaimed: AtomicU64,
    pub send_errors: AtomicU64,
}

struct Shared {
    local_port: u16,
    listener: RwLock<Option<Weak<dyn DatagramListener>>>,
    handlers: RwLock<Vec<Arc<dyn PrimordialHandler>>>,
    stats: UdpGlueStats,
}

impl Shared {
    fn dispatch(&self, remote: SocketAddr, data: &[u8]) {
        self.stats.datagrams_received.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_received
            .fetch_add(data.len() as u64, Ordering::Relaxed);

        let handlers = self.handlers.read().clone();
        if handlers.iter().any(|h| h.packet_received(remote, data)) {
            self.stats.primordial_claimed.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if !has_reserved_prefix(data) {
            self.stats.legacy_unclaimed.fetch_add(1, Ordering::Relaxed);
            trace!(%remote, len = data.len(), "unclaimed legacy datagram");
            return;
        }

        let listener = self.listener.read().as_ref().and_then(Weak::upgrade);
        match listener {
            Some(listener) => listener.receive(self.local_port, remote, data),
            None => trace!(%remote, "no listener attached, datagram dropped"),
        }
    }
}

/// UDP socket glue. Must be created inside a tokio runtime.
pub struct UdpGlue {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    send_tx: mpsc::UnboundedSender<(SocketAddr, Bytes)>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UdpGlue {
    pub async fn bind(addr: SocketAddr) -> Result<Arc<Self>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        let shared = Arc::new(Shared {
            local_port: local_addr.port(),
            listener: RwLock::new(None),
            handlers: RwLock::new(Vec::new()),
            stats: UdpGlueStats::default(),
        });
        let (send_tx, send_rx) = mpsc::unbounded_channel();

        let recv_task = tokio::spawn(recv_loop(Arc::clone(&socket), Arc::clone(&shared)));
        let send_task = tokio::spawn(send_loop(socket, Arc::clone(&shared), send_rx));
        debug!(%local_addr, "udp glue bound");

        Ok(Arc::new(Self {
            local_addr,
            shared,
            send_tx,
            tasks: Mutex::new(vec![recv_task, send_task]),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> &UdpGlueStats {
        &self.shared.stats
    }

    /// Handlers are consulted in registration order.
    pub fn add_primordial_handler(&self, handler: Arc<dyn PrimordialHandler>) {
        self.shared.handlers.write().push(handler);
    }

    /// Stop both socket tasks.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        debug!(local_addr = %self.local_addr, "udp glue shut down");
    }
}

impl DatagramGlue for UdpGlue {
    fn send(&self, _local_port: u16, remote: SocketAddr, data: Bytes) -> Result<()> {
        self.send_tx
            .send((remote, data))
            .map_err(|_| DriftStreamError::Io(std::io::ErrorKind::BrokenPipe.into()))
    }

    fn attach(&self, listener: Weak<dyn DatagramListener>) {
        *self.shared.listener.write() = Some(listener);
    }
}

impl Drop for UdpGlue {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

async fn recv_loop(socket: Arc<UdpSocket>, shared: Arc<Shared>) {
    let mut buf = vec![0u8; RECV_BUFFER];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, remote)) => shared.dispatch(remote, &buf[..n]),
            Err(e) => {
                // ICMP port unreachable surfaces here on some platforms.
                trace!(error = %e, "udp receive error");
                tokio::task::yield_now().await;
            }
        }
    }
}

async fn send_loop(
    socket: Arc<UdpSocket>,
    shared: Arc<Shared>,
    mut rx: mpsc::UnboundedReceiver<(SocketAddr, Bytes)>,
) {
    while let Some((remote, data)) = rx.recv().await {
        match socket.send_to(&data, remote).await {
            Ok(n) => {
                shared.stats.datagrams_sent.fetch_add(1, Ordering::Relaxed);
                shared.stats.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(e) => {
                shared.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                warn!(%remote, error = %e, "udp send failed");
            }
        }
    }
}
