//! In-memory datagram network.
//!
//! Endpoints attach under a socket address; datagrams sent between them are
//! queued and delivered either by hand ([`LoopbackNetwork::pump`]) or by a
//! delivery thread honouring the configured latency. A [`DropPolicy`]
//! decides which datagrams are lost on the way.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex, RwLock};
use rand::Rng;
use tracing::{debug, trace, warn};

use crate::error::{DriftStreamError, Result};
use crate::glue::{DatagramGlue, DatagramListener};

/// A datagram in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub data: Bytes,
}

type DropFn = Box<dyn FnMut(u64, &Datagram) -> bool + Send>;

/// Which datagrams the network loses.
pub enum DropPolicy {
    None,
    /// Drop each datagram with the given probability.
    Random(f64),
    /// Drop every nth datagram submitted (the nth, 2nth, ...).
    EveryNth(u64),
    /// Drop when the closure returns true. Receives the 1-based submission
    /// index and the datagram.
    Custom(DropFn),
}

impl DropPolicy {
    fn should_drop(&mut self, index: u64, datagram: &Datagram) -> bool {
        match self {
            DropPolicy::None => false,
            DropPolicy::Random(p) => rand::thread_rng().gen_bool(p.clamp(0.0, 1.0)),
            DropPolicy::EveryNth(n) => *n > 0 && index % *n == 0,
            DropPolicy::Custom(f) => f(index, datagram),
        }
    }
}

impl std::fmt::Debug for DropPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DropPolicy::None => write!(f, "None"),
            DropPolicy::Random(p) => write!(f, "Random({p})"),
            DropPolicy::EveryNth(n) => write!(f, "EveryNth({n})"),
            DropPolicy::Custom(_) => write!(f, "Custom"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopbackStats {
    pub submitted: u64,
    pub dropped: u64,
    pub delivered: u64,
    pub undeliverable: u64,
}

struct NetworkInner {
    endpoints: RwLock<HashMap<SocketAddr, Weak<dyn DatagramListener>>>,
    queue: Mutex<VecDeque<(Instant, Datagram)>>,
    queued: Condvar,
    drop_policy: Mutex<DropPolicy>,
    latency: Duration,
    capture: Mutex<Option<Vec<Datagram>>>,
    submitted: AtomicU64,
    dropped: AtomicU64,
    delivered: AtomicU64,
    undeliverable: AtomicU64,
    running: AtomicBool,
}

impl NetworkInner {
    fn submit(&self, datagram: Datagram) {
        let index = self.submitted.fetch_add(1, Ordering::Relaxed) + 1;
        if self.drop_policy.lock().should_drop(index, &datagram) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            trace!(from = %datagram.from, to = %datagram.to, index, "datagram dropped");
            return;
        }
        self.enqueue(datagram);
    }

    fn enqueue(&self, datagram: Datagram) {
        if let Some(captured) = self.capture.lock().as_mut() {
            captured.push(datagram.clone());
        }
        let due = Instant::now() + self.latency;
        self.queue.lock().push_back((due, datagram));
        self.queued.notify_one();
    }

    fn deliver(&self, datagram: Datagram) {
        let listener = self
            .endpoints
            .read()
            .get(&datagram.to)
            .and_then(Weak::upgrade);
        match listener {
            Some(listener) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                listener.receive(datagram.to.port(), datagram.from, &datagram.data);
            }
            None => {
                self.undeliverable.fetch_add(1, Ordering::Relaxed);
                trace!(to = %datagram.to, "no endpoint, datagram lost");
            }
        }
    }

    fn run(&self) {
        while self.running.load(Ordering::Acquire) {
            let next = {
                let mut queue = self.queue.lock();
                match queue.front() {
                    Some((due, _)) if *due <= Instant::now() => queue.pop_front(),
                    Some((due, _)) => {
                        let wait = due.saturating_duration_since(Instant::now());
                        self.queued.wait_for(&mut queue, wait);
                        None
                    }
                    None => {
                        self.queued.wait_for(&mut queue, Duration::from_millis(50));
                        None
                    }
                }
            };
            if let Some((_, datagram)) = next {
                self.deliver(datagram);
            }
        }
    }
}

/// An in-memory network shared by any number of endpoints.
pub struct LoopbackNetwork {
    inner: Arc<NetworkInner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl LoopbackNetwork {
    /// A network with no latency and no loss.
    pub fn new() -> Self {
        Self::with_latency(Duration::ZERO)
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                endpoints: RwLock::new(HashMap::new()),
                queue: Mutex::new(VecDeque::new()),
                queued: Condvar::new(),
                drop_policy: Mutex::new(DropPolicy::None),
                latency,
                capture: Mutex::new(None),
                submitted: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                undeliverable: AtomicU64::new(0),
                running: AtomicBool::new(false),
            }),
            handle: Mutex::new(None),
        }
    }

    pub fn set_drop_policy(&self, policy: DropPolicy) {
        debug!(?policy, "loopback drop policy set");
        *self.inner.drop_policy.lock() = policy;
    }

    /// Glue for an endpoint at `addr`.
    pub fn endpoint(&self, addr: SocketAddr) -> Arc<LoopbackGlue> {
        Arc::new(LoopbackGlue {
            addr,
            network: Arc::downgrade(&self.inner),
        })
    }

    /// Deliver every datagram queued at the time of the call, ignoring
    /// latency. Returns the number taken off the queue.
    pub fn pump(&self) -> usize {
        let batch: Vec<_> = self.inner.queue.lock().drain(..).collect();
        let count = batch.len();
        for (_, datagram) in batch {
            self.inner.deliver(datagram);
        }
        count
    }

    pub fn queued(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Remove queued datagrams without delivering them.
    pub fn discard_queued(&self) -> Vec<Datagram> {
        self.inner
            .queue
            .lock()
            .drain(..)
            .map(|(_, d)| d)
            .collect()
    }

    /// Record a copy of every datagram that survives the drop policy.
    pub fn set_capture(&self, on: bool) {
        *self.inner.capture.lock() = if on { Some(Vec::new()) } else { None };
    }

    pub fn captured(&self) -> Vec<Datagram> {
        self.inner.capture.lock().clone().unwrap_or_default()
    }

    /// Queue a datagram directly, bypassing the drop policy.
    pub fn inject(&self, datagram: Datagram) {
        self.inner.enqueue(datagram);
    }

    /// Start delivering on a background thread.
    pub fn start(&self) -> Result<()> {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return Ok(());
        }
        self.inner.running.store(true, Ordering::Release);
        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name("drift-loopback".into())
            .spawn(move || inner.run())
            .map_err(DriftStreamError::Io)?;
        *handle = Some(spawned);
        Ok(())
    }

    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::Release);
        self.inner.queued.notify_all();
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                warn!("loopback delivery thread panicked");
            }
        }
    }

    pub fn stats(&self) -> LoopbackStats {
        LoopbackStats {
            submitted: self.inner.submitted.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            undeliverable: self.inner.undeliverable.load(Ordering::Relaxed),
        }
    }
}

impl Default for LoopbackNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LoopbackNetwork {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One endpoint's view of a [`LoopbackNetwork`].
pub struct LoopbackGlue {
    addr: SocketAddr,
    network: Weak<NetworkInner>,
}

impl LoopbackGlue {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

impl DatagramGlue for LoopbackGlue {
    fn send(&self, _local_port: u16, remote: SocketAddr, data: Bytes) -> Result<()> {
        let network = self
            .network
            .upgrade()
            .ok_or_else(|| DriftStreamError::Io(std::io::ErrorKind::NotConnected.into()))?;
        network.submit(Datagram {
            from: self.addr,
            to: remote,
            data,
        });
        Ok(())
    }

    fn attach(&self, listener: Weak<dyn DatagramListener>) {
        if let Some(network) = self.network.upgrade() {
            network.endpoints.write().insert(self.addr, listener);
        }
    }
}
