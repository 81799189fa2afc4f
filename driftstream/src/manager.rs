//! The connection manager.
//!
//! An [`Engine`] owns every connection set reachable through one datagram
//! glue. It demultiplexes inbound datagrams by [`SessionKey`], decides which
//! unknown keys may open a session, starts the crypto handshake on each new
//! connection and drives the protocol timers of all sets.
//!
//! Nothing runs in the background until [`Engine::start`]. Without it the
//! engine is stepped by hand with [`Engine::tick`] and
//! [`Engine::dispatch_selects`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use crate::config::EngineConfig;
use crate::connection::Connection;
pub use crate::connection_set::SessionKey;
use crate::connection_set::{ConnectionSet, SetConfig, SetHost};
use crate::error::{DriftStreamError, Result};
use crate::glue::{DatagramGlue, DatagramListener};
use crate::handshake::{CryptoHandshake, HandshakeListener};
use crate::rate_limit::{IncomingRateLimiter, RateDecision};
use crate::selector::{PollSource, Selector};
use crate::timer::{TIMER_TICK, TIMER_TICK_MS};
use crate::transport::{SelectableTransport, TransportAdapter, TransportFilter};

/// How long a failed or idle key refuses new inbound sessions.
pub const DEAD_KEY_RETENTION: Duration = Duration::from_secs(30);

const STATS_LOG_TICKS: u64 = 60_000 / TIMER_TICK_MS as u64;

/// Receives connections opened by remote peers.
pub trait IncomingListener: Send + Sync {
    fn incoming_connection(&self, key: SessionKey, transport: Arc<TransportAdapter>);
}

/// Receives the outcome of [`Engine::connect_outbound`].
pub trait ConnectListener: Send + Sync {
    /// The handshake completed. `remaining` is the part of the initial data
    /// the handshake did not carry; the caller writes it.
    fn connect_success(&self, transport: Arc<TransportAdapter>, remaining: Bytes);

    fn connect_failure(&self, error: DriftStreamError);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub sessions: usize,
    pub setup_discards: u64,
    pub setup_discard_bytes: u64,
    pub rate_limit_discards: u64,
    pub rate_limit_discard_bytes: u64,
    pub outbound_in_flight: usize,
    pub connections_accepted: u64,
    pub connections_initiated: u64,
}

#[derive(Default)]
struct Sessions {
    sets: HashMap<SessionKey, Arc<ConnectionSet>>,
    dead: HashMap<SessionKey, Instant>,
}

impl Sessions {
    fn timeout_dead_keys(&mut self, now: Instant) {
        self.dead
            .retain(|_, died| now.saturating_duration_since(*died) <= DEAD_KEY_RETENTION);
    }
}

#[derive(Default)]
struct Counters {
    setup_discards: AtomicU64,
    setup_discard_bytes: AtomicU64,
    rate_limit_discards: AtomicU64,
    rate_limit_discard_bytes: AtomicU64,
    accepted: AtomicU64,
    initiated: AtomicU64,
}

struct EngineInner {
    config: EngineConfig,
    set_config: SetConfig,
    glue: Arc<dyn DatagramGlue>,
    handshake: Arc<dyn CryptoHandshake>,
    incoming: RwLock<Option<Arc<dyn IncomingListener>>>,
    selector: Arc<Selector>,
    sessions: Mutex<Sessions>,
    rate_limiter: Mutex<IncomingRateLimiter>,
    next_connection_id: AtomicI32,
    outbound_in_flight: AtomicUsize,
    outbound_cap_logged: AtomicBool,
    counters: Counters,
    tick_count: AtomicU64,
    threads_started: AtomicBool,
    stopped: AtomicBool,
    timer: Mutex<Option<JoinHandle<()>>>,
    timer_running: AtomicBool,
    self_ref: Weak<EngineInner>,
}

/// Connection manager for one datagram glue.
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Create an engine and attach it to `glue`.
    pub fn new(
        config: EngineConfig,
        glue: Arc<dyn DatagramGlue>,
        handshake: Arc<dyn CryptoHandshake>,
    ) -> Self {
        let now = Instant::now();
        let inner = Arc::new_cyclic(|self_ref| EngineInner {
            set_config: SetConfig::from(&config),
            rate_limiter: Mutex::new(IncomingRateLimiter::new(config.rate_limit.clone(), now)),
            selector: Selector::new(config.poll_interval),
            config,
            glue,
            handshake,
            incoming: RwLock::new(None),
            sessions: Mutex::new(Sessions::default()),
            next_connection_id: AtomicI32::new(0),
            outbound_in_flight: AtomicUsize::new(0),
            outbound_cap_logged: AtomicBool::new(false),
            counters: Counters::default(),
            tick_count: AtomicU64::new(0),
            threads_started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            timer: Mutex::new(None),
            timer_running: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        });
        let listener: Weak<dyn DatagramListener> = inner.self_ref.clone();
        inner.glue.attach(listener);
        debug!(local_port = inner.config.local_port, "engine created");
        Self { inner }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn selector(&self) -> &Arc<Selector> {
        &self.inner.selector
    }

    pub fn set_incoming_listener(&self, listener: Arc<dyn IncomingListener>) {
        *self.inner.incoming.write() = Some(listener);
    }

    /// Start the selector thread and, while sessions exist, the timer
    /// thread.
    pub fn start(&self) -> Result<()> {
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(DriftStreamError::EngineStopped);
        }
        if self.inner.threads_started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let poller: Weak<dyn PollSource> = self.inner.self_ref.clone();
        self.inner.selector.start(poller)?;
        if self.inner.session_count() > 0 {
            self.inner.ensure_timer()?;
        }
        info!(local_port = self.inner.config.local_port, "engine started");
        Ok(())
    }

    /// Fail every set and stop the background threads. The engine cannot be
    /// restarted.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let sets: Vec<_> = self.inner.sessions.lock().sets.values().cloned().collect();
        for set in sets {
            set.fail(DriftStreamError::EngineStopped);
        }
        self.inner.selector.stop();

        let handle = self.inner.timer.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("timer thread panicked");
            }
        }
        self.inner.log_stats();
        info!(local_port = self.inner.config.local_port, "engine stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Open a new connection to `remote`, reusing the set already keyed to
    /// it if one exists. The returned transport is usable once `listener`
    /// reports success.
    pub fn connect_outbound(
        &self,
        remote: SocketAddr,
        shared_secrets: &[Bytes],
        initial_data: Bytes,
        listener: Arc<dyn ConnectListener>,
    ) -> Result<Arc<TransportAdapter>> {
        let inner = &self.inner;
        if inner.stopped.load(Ordering::Acquire) {
            return Err(DriftStreamError::EngineStopped);
        }
        let key = SessionKey::new(inner.config.local_port, remote);
        let set = inner.register_outgoing(key);
        inner.ensure_timer()?;

        let connection = set.add_connection(inner.allocate_connection_id())?;
        let adapter = inner.adapter_for(connection);
        inner.counters.initiated.fetch_add(1, Ordering::Relaxed);

        let in_flight = inner.outbound_in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        if in_flight >= inner.config.max_outbound_connections
            && !inner.outbound_cap_logged.swap(true, Ordering::AcqRel)
        {
            warn!(
                limit = inner.config.max_outbound_connections,
                "outbound connection limit reached"
            );
        }

        let handshake_listener = Arc::new(OutboundHandshake {
            engine: inner.self_ref.clone(),
            adapter: Arc::clone(&adapter),
            listener,
            done: AtomicBool::new(false),
        });
        let transport: Arc<dyn SelectableTransport> = adapter.clone();
        inner.handshake.manage_crypto(
            transport,
            shared_secrets,
            false,
            initial_data,
            handshake_listener,
        );
        debug!(set = %key, connection = adapter.connection_id(), "outbound connect started");
        Ok(adapter)
    }

    /// Outbound handshakes that may still start before the cap is reached.
    pub fn max_outbound_permitted(&self) -> usize {
        self.inner
            .config
            .max_outbound_connections
            .saturating_sub(self.inner.outbound_in_flight.load(Ordering::Acquire))
    }

    /// Advance every set by one timer tick and tear down idle sets.
    pub fn tick(&self) {
        self.inner.tick();
    }

    /// Deliver queued readiness events on the calling thread.
    pub fn dispatch_selects(&self) -> usize {
        self.inner.selector.dispatch_pending()
    }

    pub fn connection_set(&self, key: &SessionKey) -> Option<Arc<ConnectionSet>> {
        self.inner.sessions.lock().sets.get(key).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.inner.session_count()
    }

    pub fn is_dead_key(&self, key: &SessionKey) -> bool {
        self.inner.sessions.lock().dead.contains_key(key)
    }

    pub fn timer_running(&self) -> bool {
        self.inner.timer_running.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> EngineStats {
        self.inner.stats()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("local_port", &self.inner.config.local_port)
            .field("sessions", &self.inner.session_count())
            .finish()
    }
}

impl EngineInner {
    fn session_count(&self) -> usize {
        self.sessions.lock().sets.len()
    }

    fn host(&self) -> Weak<dyn SetHost> {
        self.self_ref.clone()
    }

    /// Connection IDs wrap to zero before going negative.
    fn allocate_connection_id(&self) -> i32 {
        let previous = self
            .next_connection_id
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |id| {
                Some(if id == i32::MAX { 0 } else { id + 1 })
            });
        match previous {
            Ok(id) | Err(id) => id,
        }
    }

    fn adapter_for(&self, connection: Arc<Connection>) -> Arc<TransportAdapter> {
        TransportAdapter::new(connection, Arc::clone(&self.selector), self.config.effective_mss())
    }

    fn register_outgoing(&self, key: SessionKey) -> Arc<ConnectionSet> {
        let mut sessions = self.sessions.lock();
        if let Some(set) = sessions.sets.get(&key) {
            if !set.is_failed() {
                return Arc::clone(set);
            }
        }
        sessions.timeout_dead_keys(Instant::now());
        sessions.dead.remove(&key);
        let set = ConnectionSet::new(key, true, self.host(), self.set_config);
        sessions.sets.insert(key, Arc::clone(&set));
        debug!(set = %key, "created set, outgoing");
        set
    }

    /// Decide whether a datagram for an unknown key may open a session.
    ///
    /// A recently dead key only quietens the mismatch log: stray frames of
    /// the old set are expected, while a plausible opener starts a new set.
    fn register_incoming(&self, key: SessionKey, len: usize) -> Option<Arc<ConnectionSet>> {
        let now = Instant::now();
        let recently_dead = {
            let mut sessions = self.sessions.lock();
            if let Some(set) = sessions.sets.get(&key) {
                return Some(Arc::clone(set));
            }
            sessions.timeout_dead_keys(now);
            sessions.dead.contains_key(&key)
        };

        if len < self.config.initial_packet_min || len > self.config.initial_packet_max {
            self.counters.setup_discards.fetch_add(1, Ordering::Relaxed);
            self.counters
                .setup_discard_bytes
                .fetch_add(len as u64, Ordering::Relaxed);
            if recently_dead {
                trace!(set = %key, len, "datagram for recently dead key discarded");
            } else {
                debug!(set = %key, len, "datagram does not look like a session opener");
            }
            return None;
        }

        let decision = self.rate_limiter.lock().check(key.remote.ip(), now);
        if decision != RateDecision::Accepted {
            self.counters
                .rate_limit_discards
                .fetch_add(1, Ordering::Relaxed);
            self.counters
                .rate_limit_discard_bytes
                .fetch_add(len as u64, Ordering::Relaxed);
            debug!(set = %key, ?decision, "inbound session refused");
            return None;
        }

        let set = {
            let mut sessions = self.sessions.lock();
            sessions.dead.remove(&key);
            Arc::clone(sessions.sets.entry(key).or_insert_with(|| {
                debug!(set = %key, "created set, incoming");
                ConnectionSet::new(key, false, self.host(), self.set_config)
            }))
        };
        if let Err(e) = self.ensure_timer() {
            warn!(error = %e, "timer thread could not be started");
        }
        Some(set)
    }

    fn outbound_finished(&self) {
        let _ = self
            .outbound_in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(1))
            });
    }

    fn tick(&self) {
        let sets: Vec<_> = self.sessions.lock().sets.values().cloned().collect();
        for set in sets {
            set.timer_tick();
            if set.idle_limit_exceeded() {
                debug!(set = %set.key(), "idle limit exceeded, removing");
                set.fail(DriftStreamError::SetFailed("idle limit exceeded".into()));
            }
        }
        let ticks = self.tick_count.fetch_add(1, Ordering::Relaxed) + 1;
        if ticks % STATS_LOG_TICKS == 0 {
            self.log_stats();
        }
    }

    fn stats(&self) -> EngineStats {
        let c = &self.counters;
        EngineStats {
            sessions: self.session_count(),
            setup_discards: c.setup_discards.load(Ordering::Relaxed),
            setup_discard_bytes: c.setup_discard_bytes.load(Ordering::Relaxed),
            rate_limit_discards: c.rate_limit_discards.load(Ordering::Relaxed),
            rate_limit_discard_bytes: c.rate_limit_discard_bytes.load(Ordering::Relaxed),
            outbound_in_flight: self.outbound_in_flight.load(Ordering::Relaxed),
            connections_accepted: c.accepted.load(Ordering::Relaxed),
            connections_initiated: c.initiated.load(Ordering::Relaxed),
        }
    }

    fn log_stats(&self) {
        let s = self.stats();
        debug!(
            sessions = s.sessions,
            setup_discards = s.setup_discards,
            rate_limit_discards = s.rate_limit_discards,
            outbound_in_flight = s.outbound_in_flight,
            accepted = s.connections_accepted,
            initiated = s.connections_initiated,
            "engine stats"
        );
    }

    /// Start the timer thread if the engine runs threads and none is
    /// running.
    fn ensure_timer(&self) -> Result<()> {
        if !self.threads_started.load(Ordering::Acquire) || self.stopped.load(Ordering::Acquire)
        {
            return Ok(());
        }
        let mut handle = self.timer.lock();
        if self.timer_running.load(Ordering::Acquire) {
            return Ok(());
        }
        if let Some(previous) = handle.take() {
            if previous.join().is_err() {
                warn!("timer thread panicked");
            }
        }
        self.timer_running.store(true, Ordering::Release);
        let engine = self.self_ref.clone();
        let spawned = thread::Builder::new()
            .name("drift-timer".into())
            .spawn(move || timer_loop(engine));
        match spawned {
            Ok(spawned) => {
                *handle = Some(spawned);
                debug!("timer thread started");
                Ok(())
            }
            Err(e) => {
                self.timer_running.store(false, Ordering::Release);
                Err(DriftStreamError::Io(e))
            }
        }
    }
}

fn timer_loop(engine: Weak<EngineInner>) {
    let mut next = Instant::now() + TIMER_TICK;
    let mut idle_since: Option<Instant> = None;
    loop {
        thread::sleep(next.saturating_duration_since(Instant::now()));
        next += TIMER_TICK;

        let Some(engine) = engine.upgrade() else {
            return;
        };
        if engine.stopped.load(Ordering::Acquire) {
            engine.timer_running.store(false, Ordering::Release);
            return;
        }
        engine.tick();

        if engine.session_count() > 0 {
            idle_since = None;
            continue;
        }
        let since = *idle_since.get_or_insert_with(Instant::now);
        if since.elapsed() >= engine.config.timer_linger {
            // Decide under the handle lock so a concurrent registration
            // either sees the thread running or starts a new one.
            let _handle = engine.timer.lock();
            if engine.session_count() == 0 {
                engine.timer_running.store(false, Ordering::Release);
                debug!("timer thread idle, exiting");
                return;
            }
            idle_since = None;
        }
    }
}

impl DatagramListener for EngineInner {
    fn receive(&self, local_port: u16, remote: SocketAddr, data: &[u8]) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        let key = SessionKey::new(local_port, remote);
        let existing = self.sessions.lock().sets.get(&key).cloned();
        let set = match existing {
            Some(set) => set,
            None => match self.register_incoming(key, data.len()) {
                Some(set) => set,
                None => return,
            },
        };
        set.receive(BytesMut::from(data));
    }
}

impl PollSource for EngineInner {
    fn poll_all(&self) {
        let sets: Vec<_> = self.sessions.lock().sets.values().cloned().collect();
        for set in sets {
            set.poll_connections();
        }
    }
}

impl SetHost for EngineInner {
    fn send(&self, set: &Arc<ConnectionSet>, datagram: Bytes) -> Result<()> {
        let key = set.key();
        self.glue.send(key.local_port, key.remote, datagram)
    }

    fn accept(&self, set: &Arc<ConnectionSet>, connection: Arc<Connection>) {
        let key = set.key();
        let adapter = self.adapter_for(connection);
        self.counters.accepted.fetch_add(1, Ordering::Relaxed);
        trace!(set = %key, "inbound connection, starting handshake");

        let listener = Arc::new(InboundHandshake {
            engine: self.self_ref.clone(),
            key,
            adapter: Arc::clone(&adapter),
        });
        let transport: Arc<dyn SelectableTransport> = adapter;
        self.handshake
            .manage_crypto(transport, &[], true, Bytes::new(), listener);
    }

    fn set_failed(&self, set: &Arc<ConnectionSet>) {
        let key = set.key();
        let mut sessions = self.sessions.lock();
        let current = sessions
            .sets
            .get(&key)
            .is_some_and(|existing| Arc::ptr_eq(existing, set));
        if current {
            sessions.sets.remove(&key);
            sessions.dead.insert(key, Instant::now());
            debug!(set = %key, "connection set removed");
        }
    }

    fn connection_removed(&self, set: &Arc<ConnectionSet>, connection: &Arc<Connection>) {
        // An emptied set stays registered until its idle limit passes.
        trace!(
            set = %set.key(),
            connection = connection.id(),
            remaining = set.connection_count(),
            "connection removed"
        );
    }
}

fn install_secret(adapter: &TransportAdapter, secret: &[u8]) {
    if let Err(e) = adapter.connection().set_secret(secret) {
        debug!(connection = adapter.connection_id(), error = %e, "session secret rejected");
    }
}

struct OutboundHandshake {
    engine: Weak<EngineInner>,
    adapter: Arc<TransportAdapter>,
    listener: Arc<dyn ConnectListener>,
    done: AtomicBool,
}

impl OutboundHandshake {
    fn finished(&self) -> bool {
        if self.done.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(engine) = self.engine.upgrade() {
            engine.outbound_finished();
        }
        true
    }
}

impl HandshakeListener for OutboundHandshake {
    fn got_secret(&self, secret: &[u8]) {
        install_secret(&self.adapter, secret);
    }

    fn handshake_success(&self, filter: Box<dyn TransportFilter>, remaining: Bytes) {
        if !self.finished() {
            return;
        }
        self.adapter.set_filter(filter);
        if self.adapter.is_closed() {
            self.adapter.close("already closed");
            self.listener
                .connect_failure(DriftStreamError::ConnectionClosed);
            return;
        }
        debug!(
            connection = self.adapter.connection_id(),
            filter = %self.adapter.filter_name(),
            "outbound connection established"
        );
        self.listener
            .connect_success(Arc::clone(&self.adapter), remaining);
    }

    fn handshake_failure(&self, error: DriftStreamError) {
        if !self.finished() {
            return;
        }
        self.adapter.close(&format!("handshake failure: {error}"));
        self.listener.connect_failure(error);
    }
}

struct InboundHandshake {
    engine: Weak<EngineInner>,
    key: SessionKey,
    adapter: Arc<TransportAdapter>,
}

impl HandshakeListener for InboundHandshake {
    fn got_secret(&self, secret: &[u8]) {
        install_secret(&self.adapter, secret);
    }

    fn handshake_success(&self, filter: Box<dyn TransportFilter>, _remaining: Bytes) {
        self.adapter.set_filter(filter);
        let listener = self
            .engine
            .upgrade()
            .and_then(|engine| engine.incoming.read().clone());
        match listener {
            Some(listener) => {
                debug!(set = %self.key, "inbound connection established");
                listener.incoming_connection(self.key, Arc::clone(&self.adapter));
            }
            None => self.adapter.close("no incoming listener"),
        }
    }

    fn handshake_failure(&self, error: DriftStreamError) {
        debug!(set = %self.key, %error, "inbound handshake failure");
        self.adapter.close(&format!("handshake failure: {error}"));
    }
}
