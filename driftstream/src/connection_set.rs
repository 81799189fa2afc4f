//! Per-peer protocol engine.
//!
//! A connection set owns everything shared by the connections multiplexed
//! to one remote endpoint: header keys, both tuple streams, the transmit
//! queue, the receive window, the adaptive timer and the protocol timers.
//!
//! All state sits behind one lock. Work that reaches outside the set
//! (sending datagrams, accepting connections, waking consumers, failing)
//! is collected as [`Effects`] while the lock is held and carried out
//! after it is released.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use drifttrust::{derive_header_keys, KeyStream, SequenceSource, SessionRole};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace, warn};

use crate::config::EngineConfig;
use crate::connection::{Connection, PENDING_ID};
use crate::error::{DriftStreamError, Result};
use crate::frame::{
    decode_header, encode_header, read_alternate, read_sequence, Command, CommandBody, Header,
    HeaderFlags, MAX_ACK_ENTRIES, MAX_PADDING, MIN_HEADER, PROTOCOL_VERSION,
};
use crate::packet::Packet;
use crate::sequence::{SeqTuple, SequenceGenerator};
use crate::timer::{TimerBase, MIN_RETRANSMIT_TICKS, RETRANSMIT_LIMIT, TIMER_TICK_MS};
use crate::transmit::TransmitQueue;
use crate::window::{Placement, ReceiveWindow};

/// Connections multiplexed within one set, at most.
pub const MAX_CONNECTIONS: usize = 128;

/// Unacknowledged frames above which writes are refused.
pub const MAX_TRANSMIT_UNACK: usize = 10;

/// Unacknowledged in-order or out-of-order receptions that force an ACK.
const ACK_THRESHOLD: u64 = 3;

const IDLE_TICKS: u32 = 10_000 / TIMER_TICK_MS;
const IDLE_JITTER_TICKS: u32 = 2_000 / TIMER_TICK_MS;
const KEEP_ALIVE_MIN_TICKS: u32 = 10_000 / TIMER_TICK_MS;
const KEEP_ALIVE_MAX_TICKS: u32 = 20_000 / TIMER_TICK_MS;
const STATS_LOG_TICKS: u32 = 60_000 / TIMER_TICK_MS;

/// Recently closed connection identifiers whose late DATA is ignored.
const CLOSED_ID_MEMORY: usize = 32;

/// Identifies a session: local port plus remote endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub local_port: u16,
    pub remote: SocketAddr,
}

impl SessionKey {
    pub fn new(local_port: u16, remote: SocketAddr) -> Self {
        Self { local_port, remote }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.local_port,
            self.remote.ip(),
            self.remote.port()
        )
    }
}

/// What a set needs from the layer that owns it.
pub trait SetHost: Send + Sync {
    /// Put a datagram on the wire. Must not block.
    fn send(&self, set: &Arc<ConnectionSet>, datagram: Bytes) -> Result<()>;

    /// A new inbound connection appeared in the set.
    fn accept(&self, set: &Arc<ConnectionSet>, connection: Arc<Connection>);

    /// The set failed; every connection in it has already been failed.
    fn set_failed(&self, set: &Arc<ConnectionSet>);

    /// A connection left the set.
    fn connection_removed(&self, set: &Arc<ConnectionSet>, connection: &Arc<Connection>);
}

/// Settings a set takes from the engine configuration.
#[derive(Debug, Clone, Copy)]
pub struct SetConfig {
    pub mss: usize,
    pub read_buffer_capacity: usize,
    pub trace_protocol: bool,
}

impl From<&EngineConfig> for SetConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            mss: config.effective_mss(),
            read_buffer_capacity: config.read_buffer_capacity,
            trace_protocol: config.trace_protocol,
        }
    }
}

/// Header keystreams and tuple generators for one end of a session.
pub struct SessionCrypto {
    header_out: Box<dyn KeyStream>,
    header_in: Box<dyn KeyStream>,
    out_seq: SequenceGenerator,
    in_seq: SequenceGenerator,
    padding_seed: u64,
}

impl SessionCrypto {
    pub fn new(
        header_out: Box<dyn KeyStream>,
        header_in: Box<dyn KeyStream>,
        sequence_out: Box<dyn SequenceSource>,
        sequence_in: Box<dyn SequenceSource>,
        padding_seed: u64,
    ) -> Self {
        Self {
            header_out,
            header_in,
            out_seq: SequenceGenerator::new(sequence_out),
            in_seq: SequenceGenerator::new(sequence_in),
            padding_seed,
        }
    }

    /// Derive from a negotiated secret.
    pub fn derive(secret: &[u8], role: SessionRole) -> Result<Self> {
        let keys = derive_header_keys(secret, role)?;
        Ok(Self::new(
            Box::new(keys.header_out),
            Box::new(keys.header_in),
            Box::new(keys.sequence_out),
            Box::new(keys.sequence_in),
            keys.padding_seed,
        ))
    }
}

impl fmt::Debug for SessionCrypto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCrypto").finish_non_exhaustive()
    }
}

/// Traffic counters for one set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetStats {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_resent: u64,
    pub bytes_resent: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub data_sent: u64,
    pub data_received: u64,
    pub duplicates: u64,
    pub out_of_order: u64,
    pub hash_failures: u64,
    pub invalid_alternates: u64,
    pub discarded: u64,
}

/// Work carried out once the set lock is released.
#[derive(Default)]
struct Effects {
    datagrams: Vec<Bytes>,
    accepted: Vec<Arc<Connection>>,
    closed_by_peer: Vec<Arc<Connection>>,
    overflowed: Vec<(Arc<Connection>, DriftStreamError)>,
    to_poll: Vec<Arc<Connection>>,
    failure: Option<DriftStreamError>,
}

impl Effects {
    fn fail(&mut self, error: DriftStreamError) {
        if self.failure.is_none() {
            self.failure = Some(error);
        }
    }
}

struct SetState {
    failed: Option<Arc<DriftStreamError>>,
    connections: HashMap<i32, Arc<Connection>>,
    lead: Option<Arc<Connection>>,
    /// Connections that wrote since the last implicit acknowledgement.
    writers: VecDeque<Arc<Connection>>,
    closed_ids: VecDeque<i32>,

    crypto: Option<SessionCrypto>,
    /// Alternate of the outbound tuple skipped when keys were installed;
    /// carried by this side's crypto frame once known.
    crypto_alt: Option<u32>,
    first_frame_sent: bool,

    transmit: TransmitQueue,
    window: ReceiveWindow,
    timer: TimerBase,
    rng: StdRng,

    retransmit_ticks: u32,
    retransmit_target: Option<u64>,
    explicit_ack_ticks: u32,
    keep_alive_ticks: u32,
    idle_ticks: u32,
    idle_limit: u32,
    stats_log_ticks: u32,
    total_tick_count: u64,

    their_last_in_order_seq: Option<u32>,
    unack_in_sequence: u64,
    sent_unack_in_sequence: u64,
    out_of_order_count: u64,
    sent_out_of_order_count: u64,

    stats: SetStats,
}

impl SetState {
    fn new(mut rng: StdRng) -> Self {
        let idle_limit = IDLE_TICKS + rng.gen_range(0..=IDLE_JITTER_TICKS);
        Self {
            failed: None,
            connections: HashMap::new(),
            lead: None,
            writers: VecDeque::new(),
            closed_ids: VecDeque::with_capacity(CLOSED_ID_MEMORY),
            crypto: None,
            crypto_alt: None,
            first_frame_sent: false,
            transmit: TransmitQueue::new(),
            window: ReceiveWindow::new(),
            timer: TimerBase::new(Instant::now()),
            rng,
            retransmit_ticks: 0,
            retransmit_target: None,
            explicit_ack_ticks: 0,
            keep_alive_ticks: 0,
            idle_ticks: 0,
            idle_limit,
            stats_log_ticks: 0,
            total_tick_count: 0,
            their_last_in_order_seq: None,
            unack_in_sequence: 0,
            sent_unack_in_sequence: 0,
            out_of_order_count: 0,
            sent_out_of_order_count: 0,
            stats: SetStats::default(),
        }
    }

    fn is_lead(&self, connection: &Arc<Connection>) -> bool {
        self.lead
            .as_ref()
            .is_some_and(|lead| Arc::ptr_eq(lead, connection))
    }

    fn is_member(&self, connection: &Arc<Connection>) -> bool {
        self.connections
            .get(&connection.id())
            .is_some_and(|c| Arc::ptr_eq(c, connection))
    }

    fn remember_closed(&mut self, id: i32) {
        if self.closed_ids.len() == CLOSED_ID_MEMORY {
            self.closed_ids.pop_front();
        }
        self.closed_ids.push_back(id);
    }

    fn start_keep_alive(&mut self) {
        self.keep_alive_ticks = self.rng.gen_range(KEEP_ALIVE_MIN_TICKS..=KEEP_ALIVE_MAX_TICKS);
    }

    /// Re-aim the retransmit timer after the queue head changed.
    fn refresh_retransmit(&mut self) {
        let target = self.transmit.retransmit_target();
        if target != self.retransmit_target {
            self.retransmit_ticks = match target.and_then(|t| self.transmit.get(t)) {
                Some(p) => self.timer.retransmit_ticks(p.resend_count()),
                None => 0,
            };
            self.retransmit_target = target;
        }
    }
}

fn countdown(ticks: &mut u32) -> bool {
    if *ticks == 0 {
        return false;
    }
    *ticks -= 1;
    *ticks == 0
}

fn gather(buffers: &[&[u8]], limit: usize, out: &mut BytesMut) -> usize {
    let mut taken = 0;
    for buf in buffers {
        let room = limit - taken;
        if room == 0 {
            break;
        }
        let n = buf.len().min(room);
        out.extend_from_slice(&buf[..n]);
        taken += n;
    }
    taken
}

pub struct ConnectionSet {
    key: SessionKey,
    outgoing: bool,
    host: Weak<dyn SetHost>,
    config: SetConfig,
    state: Mutex<SetState>,
}

impl ConnectionSet {
    pub fn new(
        key: SessionKey,
        outgoing: bool,
        host: Weak<dyn SetHost>,
        config: SetConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            key,
            outgoing,
            host,
            config,
            state: Mutex::new(SetState::new(StdRng::from_entropy())),
        })
    }

    pub fn key(&self) -> SessionKey {
        self.key
    }

    /// Whether this side opened the session.
    pub fn is_outgoing(&self) -> bool {
        self.outgoing
    }

    pub fn is_failed(&self) -> bool {
        self.state.lock().failed.is_some()
    }

    pub fn failure(&self) -> Option<Arc<DriftStreamError>> {
        self.state.lock().failed.clone()
    }

    pub fn has_keys(&self) -> bool {
        self.state.lock().crypto.is_some()
    }

    pub fn stats(&self) -> SetStats {
        self.state.lock().stats
    }

    pub fn timer_base(&self) -> u32 {
        self.state.lock().timer.current()
    }

    pub fn transmit_len(&self) -> usize {
        self.state.lock().transmit.len()
    }

    pub fn out_of_order_pending(&self) -> usize {
        self.state.lock().window.pending_slots()
    }

    /// Out-of-order arrivals not yet listed in an ACK.
    pub fn unreported_out_of_order(&self) -> u64 {
        let st = self.state.lock();
        st.out_of_order_count - st.sent_out_of_order_count
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    pub fn connection(&self, id: i32) -> Option<Arc<Connection>> {
        self.state.lock().connections.get(&id).cloned()
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.state.lock().connections.values().cloned().collect()
    }

    /// Real sequence of the newest of our frames the peer has in order.
    pub fn their_last_in_order_seq(&self) -> Option<u32> {
        self.state.lock().their_last_in_order_seq
    }

    /// No connections for longer than the (jittered) idle limit.
    pub fn idle_limit_exceeded(&self) -> bool {
        let st = self.state.lock();
        st.connections.is_empty() && st.idle_ticks > st.idle_limit
    }

    /// Register a new outbound connection. The first becomes the lead.
    pub fn add_connection(self: &Arc<Self>, id: i32) -> Result<Arc<Connection>> {
        let mut st = self.state.lock();
        if let Some(error) = &st.failed {
            return Err(DriftStreamError::SetFailed(error.to_string()));
        }
        if st.connections.len() >= MAX_CONNECTIONS {
            return Err(DriftStreamError::ConnectionLimitReached(MAX_CONNECTIONS));
        }
        let connection = self.new_connection(id);
        if st.lead.is_none() {
            st.lead = Some(Arc::clone(&connection));
        }
        st.connections.insert(id, Arc::clone(&connection));
        debug!(set = %self.key, connection = id, "connection added");
        Ok(connection)
    }

    fn new_connection(self: &Arc<Self>, id: i32) -> Arc<Connection> {
        Connection::new(
            id,
            Arc::downgrade(self),
            self.config.mss,
            self.config.read_buffer_capacity,
        )
    }

    /// Re-poll readiness of every connection.
    pub fn poll_connections(&self) {
        let connections = self.connections();
        for connection in connections {
            connection.poll();
        }
    }

    // ── Keys ──────────────────────────────────────────────────────────────

    /// Install header keys derived from `secret`. Only the lead
    /// connection's secret is used, and only once.
    pub fn set_secret(&self, connection: &Arc<Connection>, secret: &[u8]) -> Result<()> {
        {
            let st = self.state.lock();
            if !st.is_lead(connection) || st.crypto.is_some() {
                return Ok(());
            }
        }
        let role = if self.outgoing {
            SessionRole::Outgoing
        } else {
            SessionRole::Incoming
        };
        self.install_crypto(SessionCrypto::derive(secret, role)?)
    }

    /// Install header keystreams and tuple generators directly.
    pub fn install_crypto(&self, mut crypto: SessionCrypto) -> Result<()> {
        let connections = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            if let Some(error) = &st.failed {
                return Err(DriftStreamError::SetFailed(error.to_string()));
            }
            if st.crypto.is_some() {
                return Ok(());
            }

            // The first tuple in each direction stands in for the crypto
            // frames, which carry no header of their own.
            let skipped_out = crypto.out_seq.next_tuple()?;
            let skipped_in = crypto.in_seq.next_tuple()?;
            st.window.set_initial_alt(skipped_in.alt);
            if !self.outgoing {
                for packet in st.transmit.iter_mut() {
                    if packet.command() == Command::Crypto && packet.alt().is_none() {
                        packet.set_alt(skipped_out.alt);
                    }
                }
            }
            st.crypto_alt = Some(skipped_out.alt);
            st.rng = StdRng::seed_from_u64(crypto.padding_seed);
            st.crypto = Some(crypto);
            st.connections.values().cloned().collect::<Vec<_>>()
        };

        debug!(set = %self.key, outgoing = self.outgoing, "header keys installed");
        for connection in connections {
            connection.poll();
        }
        Ok(())
    }

    // ── Writing ───────────────────────────────────────────────────────────

    pub fn can_write(&self, connection: &Arc<Connection>) -> bool {
        let st = self.state.lock();
        self.can_write_locked(&st, connection)
    }

    fn can_write_locked(&self, st: &SetState, connection: &Arc<Connection>) -> bool {
        if st.failed.is_some() || !st.is_member(connection) {
            return false;
        }
        if !st.first_frame_sent && !st.is_lead(connection) {
            return false;
        }
        if st.crypto.is_none() && st.first_frame_sent {
            return false;
        }
        st.transmit.len() < MAX_TRANSMIT_UNACK
    }

    /// Frame and send as much of `buffers` as fits one datagram.
    pub fn write(
        self: &Arc<Self>,
        connection: &Arc<Connection>,
        buffers: &[&[u8]],
    ) -> Result<usize> {
        let mut fx = Effects::default();
        let result = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            if let Some(error) = &st.failed {
                return Err(DriftStreamError::SetFailed(error.to_string()));
            }
            if !self.can_write_locked(st, connection) {
                return Ok(0);
            }

            st.writers.retain(|c| !Arc::ptr_eq(c, connection));
            st.writers.push_back(Arc::clone(connection));

            // The first frame each way is the raw opening of the handshake.
            let sent = if !st.first_frame_sent {
                self.send_crypto(st, connection, buffers, &mut fx)
            } else {
                self.send_data(st, connection, buffers, &mut fx)
            };
            match sent {
                Ok(n) => Ok(n),
                Err(e) => {
                    let reported = DriftStreamError::SetFailed(e.to_string());
                    fx.fail(e);
                    Err(reported)
                }
            }
        };
        self.complete(fx);
        result
    }

    fn send_crypto(
        &self,
        st: &mut SetState,
        connection: &Arc<Connection>,
        buffers: &[&[u8]],
        fx: &mut Effects,
    ) -> Result<usize> {
        let mut frame = BytesMut::with_capacity(self.config.mss);
        let taken = gather(buffers, self.config.mss, &mut frame);
        if taken == 0 {
            return Ok(0);
        }

        let id = st.transmit.allocate_id();
        let packet = Packet::new(
            id,
            None,
            st.crypto_alt,
            Command::Crypto,
            connection.id(),
            frame,
            st.unack_in_sequence,
        );
        st.transmit.push(packet);
        st.first_frame_sent = true;
        st.timer.record_unique_sent();
        self.send_packet(st, id, fx)?;
        Ok(taken)
    }

    fn send_data(
        &self,
        st: &mut SetState,
        connection: &Arc<Connection>,
        buffers: &[&[u8]],
        fx: &mut Effects,
    ) -> Result<usize> {
        if buffers.iter().all(|b| b.is_empty()) {
            return Ok(0);
        }
        let connection_id = connection.id();
        let (tuple, mut frame) = self.build_frame(
            st,
            HeaderFlags::NONE,
            CommandBody::Data { connection_id },
            0,
        )?;
        let room = self.config.mss.saturating_sub(frame.len());
        let taken = gather(buffers, room, &mut frame);

        let id = self.queue_frame(st, &tuple, Command::Data, connection_id, frame, true);
        st.stats.data_sent += 1;
        self.send_packet(st, id, fx)?;
        Ok(taken)
    }

    /// Draw the next tuple and build an encrypted header for it.
    fn build_frame(
        &self,
        st: &mut SetState,
        flags: HeaderFlags,
        body: CommandBody,
        padding: usize,
    ) -> Result<(SeqTuple, BytesMut)> {
        if self.outgoing {
            if let Some(base) = st.timer.evaluate(Instant::now()) {
                debug!(set = %self.key, base, "timer base adjusted");
            }
        }
        let header = Header {
            flags,
            timer_base: st.timer.current(),
            body,
        };
        let crypto = st.crypto.as_mut().ok_or(DriftStreamError::SetupFailed)?;
        let tuple = crypto.out_seq.next_tuple()?;
        let frame = encode_header(&tuple, &header, padding, crypto.header_out.as_mut())?;
        Ok((tuple, frame))
    }

    fn queue_frame(
        &self,
        st: &mut SetState,
        tuple: &SeqTuple,
        command: Command,
        connection_id: i32,
        frame: BytesMut,
        auto_retransmit: bool,
    ) -> u64 {
        let id = st.transmit.allocate_id();
        let mut packet = Packet::new(
            id,
            Some(tuple.seq),
            Some(tuple.alt),
            command,
            connection_id,
            frame,
            st.unack_in_sequence,
        );
        packet.set_auto_retransmit(auto_retransmit);
        st.transmit.push(packet);
        st.timer.record_unique_sent();
        id
    }

    /// (Re)send a queued packet with the current alternate echo.
    fn send_packet(&self, st: &mut SetState, id: u64, fx: &mut Effects) -> Result<()> {
        let (resend_count, unack) = match st.transmit.get(id) {
            Some(p) => (p.resend_count(), p.unack_in_sequence()),
            None => return Ok(()),
        };
        if resend_count > RETRANSMIT_LIMIT {
            return Err(DriftStreamError::ResendLimitExceeded);
        }
        if unack > st.sent_unack_in_sequence {
            st.sent_unack_in_sequence = unack;
        }

        let target = st.transmit.retransmit_target();
        match target {
            None => st.retransmit_ticks = 0,
            Some(t) => {
                if st.retransmit_target != Some(t) || t == id || st.retransmit_ticks == 0 {
                    let count = st.transmit.get(t).map_or(0, Packet::resend_count);
                    st.retransmit_ticks = st.timer.retransmit_ticks(count);
                }
            }
        }
        st.retransmit_target = target;

        let echo = st.window.last_in_order_alt().unwrap_or(0);
        let tick = st.total_tick_count;
        let Some(packet) = st.transmit.get_mut(id) else {
            return Ok(());
        };
        let datagram = packet.sent(tick, echo);

        st.stats.packets_sent += 1;
        st.stats.bytes_sent += datagram.len() as u64;
        if packet.send_count() > 1 {
            st.stats.packets_resent += 1;
            st.stats.bytes_resent += datagram.len() as u64;
        }
        if self.config.trace_protocol {
            trace!(set = %self.key, %packet, "send");
        }
        fx.datagrams.push(datagram);
        Ok(())
    }

    fn send_ack(&self, st: &mut SetState, timer_expired: bool, fx: &mut Effects) -> Result<()> {
        if let Some(id) = st.transmit.find_command(Command::Ack) {
            let wait = st.timer.explicit_ack_ticks() as u64;
            let stale = st
                .transmit
                .get(id)
                .is_some_and(|p| p.ticks_since_send(st.total_tick_count) >= wait);
            st.explicit_ack_ticks = 0;
            if stale {
                self.send_packet(st, id, fx)?;
            }
            return Ok(());
        }

        let lazy = st.transmit.is_empty() && timer_expired && !st.window.has_pending();
        let out_of_order = st.window.filled_sequences(MAX_ACK_ENTRIES);
        st.sent_out_of_order_count = if out_of_order.is_empty() {
            st.out_of_order_count
        } else {
            (st.sent_out_of_order_count + out_of_order.len() as u64).min(st.out_of_order_count)
        };

        let flags = if lazy {
            HeaderFlags::LAZY_ACK
        } else {
            HeaderFlags::NONE
        };
        let padding = st.rng.gen_range(0..MAX_PADDING);
        let (tuple, frame) =
            self.build_frame(st, flags, CommandBody::Ack { out_of_order }, padding)?;
        let id = self.queue_frame(st, &tuple, Command::Ack, 0, frame, !lazy);
        st.explicit_ack_ticks = 0;
        if lazy {
            st.start_keep_alive();
        }
        self.send_packet(st, id, fx)
    }

    fn send_stats_request(&self, st: &mut SetState, fx: &mut Effects) -> Result<()> {
        if st.transmit.find_command(Command::StatRequest).is_some() {
            return Ok(());
        }
        let padding = st.rng.gen_range(0..MAX_PADDING);
        let (tuple, frame) =
            self.build_frame(st, HeaderFlags::NONE, CommandBody::StatRequest, padding)?;
        let id = self.queue_frame(st, &tuple, Command::StatRequest, 0, frame, true);
        self.send_packet(st, id, fx)
    }

    fn send_stats_reply(&self, st: &mut SetState, fx: &mut Effects) -> Result<()> {
        if let Some(id) = st.transmit.find_command(Command::StatReply) {
            let stale = st
                .transmit
                .get(id)
                .is_some_and(|p| p.ticks_since_send(st.total_tick_count) >= MIN_RETRANSMIT_TICKS);
            if stale {
                self.send_packet(st, id, fx)?;
            }
            return Ok(());
        }

        let lazy = st.transmit.is_empty() && !st.window.has_pending();
        let flags = if lazy {
            HeaderFlags::LAZY_ACK
        } else {
            HeaderFlags::NONE
        };
        let padding = st.rng.gen_range(0..MAX_PADDING);
        let (tuple, frame) = self.build_frame(st, flags, CommandBody::StatReply, padding)?;
        let id = self.queue_frame(st, &tuple, Command::StatReply, 0, frame, !lazy);
        if lazy {
            st.start_keep_alive();
        }
        self.send_packet(st, id, fx)
    }

    fn send_close(&self, st: &mut SetState, connection_id: i32, fx: &mut Effects) -> Result<()> {
        let padding = st.rng.gen_range(0..MAX_PADDING);
        let (tuple, frame) = self.build_frame(
            st,
            HeaderFlags::NONE,
            CommandBody::Close { connection_id },
            padding,
        )?;
        let id = self.queue_frame(st, &tuple, Command::Close, connection_id, frame, true);
        self.send_packet(st, id, fx)
    }

    // ── Receiving ─────────────────────────────────────────────────────────

    /// Process one datagram from the peer.
    pub fn receive(self: &Arc<Self>, data: BytesMut) {
        let mut fx = Effects::default();
        {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            if st.failed.is_some() {
                return;
            }
            st.stats.packets_received += 1;
            st.stats.bytes_received += data.len() as u64;

            let processed = if st.crypto.is_none() {
                self.receive_crypto(st, data, &mut fx)
            } else {
                self.receive_framed(st, data, &mut fx)
            };
            if let Err(e) = processed {
                fx.fail(e);
            }
        }
        self.complete(fx);
    }

    /// Before keys exist every datagram is a raw crypto frame for the lead.
    fn receive_crypto(
        self: &Arc<Self>,
        st: &mut SetState,
        data: BytesMut,
        fx: &mut Effects,
    ) -> Result<()> {
        if data.len() < 8 {
            st.stats.discarded += 1;
            return Ok(());
        }
        let pseudo_seq = read_sequence(&data);
        if st.window.is_done(pseudo_seq) {
            st.stats.duplicates += 1;
            return Ok(());
        }
        st.window.mark_done(pseudo_seq);

        if self.outgoing && st.transmit.acknowledge_through(None).is_some() {
            st.refresh_retransmit();
            self.notify_writers(st, fx);
        }

        let lead = match &st.lead {
            Some(lead) => Arc::clone(lead),
            None => {
                let connection = self.new_connection(PENDING_ID);
                st.connections.insert(PENDING_ID, Arc::clone(&connection));
                st.lead = Some(Arc::clone(&connection));
                fx.accepted.push(Arc::clone(&connection));
                connection
            }
        };

        if self.config.trace_protocol {
            trace!(set = %self.key, len = data.len(), "crypto frame received");
        }
        if let Err(e) = lead.receive(data.freeze()) {
            fx.overflowed.push((Arc::clone(&lead), e));
        }
        fx.to_poll.push(lead);
        Ok(())
    }

    fn receive_framed(
        self: &Arc<Self>,
        st: &mut SetState,
        data: BytesMut,
        fx: &mut Effects,
    ) -> Result<()> {
        if data.len() < MIN_HEADER {
            st.stats.discarded += 1;
            return Ok(());
        }

        let alt = read_alternate(&data);
        let mut write_select = false;
        if let Some(seq) = st.transmit.acknowledge_through(Some(alt)) {
            st.their_last_in_order_seq = seq;
            st.refresh_retransmit();
            write_select = true;
        }

        let mut lazy_ack_found = false;
        let processed = self.process_framed(st, alt, data, &mut lazy_ack_found, fx);
        let acked = self.after_receive(st, lazy_ack_found, fx);

        if write_select {
            self.notify_writers(st, fx);
        }
        processed.and(acked)
    }

    fn process_framed(
        self: &Arc<Self>,
        st: &mut SetState,
        alt: u32,
        data: BytesMut,
        lazy_ack_found: &mut bool,
        fx: &mut Effects,
    ) -> Result<()> {
        let seq = read_sequence(&data);
        if st.window.is_done(seq) {
            st.stats.duplicates += 1;
            st.timer.record_duplicate();
            if let Some(id) = st
                .transmit
                .stale_lazy_sole(st.total_tick_count, MIN_RETRANSMIT_TICKS)
            {
                self.send_packet(st, id, fx)?;
            }
            return Ok(());
        }

        let crypto = st.crypto.as_mut().ok_or(DriftStreamError::SetupFailed)?;
        if !crypto.out_seq.is_valid_alternate(alt) {
            st.stats.invalid_alternates += 1;
            trace!(set = %self.key, alt, "unknown alternate, frame dropped");
            return Ok(());
        }

        match st.window.place(seq, data, &mut crypto.in_seq)? {
            Placement::Stored => {
                st.timer.record_unique_received();
            }
            Placement::Duplicate => {
                st.stats.duplicates += 1;
                st.timer.record_duplicate();
                return Ok(());
            }
            Placement::Overflow => {
                st.stats.discarded += 1;
                debug!(set = %self.key, "out-of-order window full, frame dropped");
                return Ok(());
            }
        }

        while let Some((_, frame)) = st.window.pop_ready() {
            st.unack_in_sequence += 1;
            self.process_in_order(st, frame, lazy_ack_found, fx)?;
        }

        if st.window.is_buffered(seq) {
            st.out_of_order_count += 1;
            st.stats.out_of_order += 1;
        }
        Ok(())
    }

    fn process_in_order(
        self: &Arc<Self>,
        st: &mut SetState,
        mut frame: BytesMut,
        lazy_ack_found: &mut bool,
        fx: &mut Effects,
    ) -> Result<()> {
        let crypto = st.crypto.as_mut().ok_or(DriftStreamError::SetupFailed)?;
        let header = match decode_header(&mut frame, crypto.header_in.as_mut()) {
            Ok(header) => header,
            Err(DriftStreamError::HashMismatch) => {
                st.stats.hash_failures += 1;
                debug!(set = %self.key, "header hash mismatch, frame dropped");
                return Ok(());
            }
            Err(e) => {
                st.stats.discarded += 1;
                debug!(set = %self.key, error = %e, "undecodable header, frame dropped");
                return Ok(());
            }
        };

        if header.version != PROTOCOL_VERSION {
            trace!(set = %self.key, version = header.version, "peer protocol version differs");
        }
        if header.flags.contains(HeaderFlags::LAZY_ACK) {
            *lazy_ack_found = true;
        }
        if st.timer.on_peer_base(header.timer_base, self.outgoing, Instant::now()) {
            debug!(set = %self.key, base = header.timer_base, "adopted peer timer base");
        }
        if self.config.trace_protocol {
            trace!(set = %self.key, command = %header.body.command(), len = frame.len(), "receive");
        }

        match header.body {
            CommandBody::Data { connection_id } => {
                let payload = frame.split_off(header.header_len).freeze();
                self.receive_data(st, connection_id, payload, fx)
            }
            CommandBody::Ack { out_of_order } => self.receive_ack(st, &out_of_order, fx),
            CommandBody::Close { connection_id } => {
                self.receive_close(st, connection_id, fx);
                Ok(())
            }
            CommandBody::StatRequest => self.send_stats_reply(st, fx),
            CommandBody::StatReply => Ok(()),
        }
    }

    fn receive_data(
        self: &Arc<Self>,
        st: &mut SetState,
        connection_id: i32,
        payload: Bytes,
        fx: &mut Effects,
    ) -> Result<()> {
        st.stats.data_received += 1;

        let connection = match st.connections.get(&connection_id) {
            Some(c) => Arc::clone(c),
            None if st.closed_ids.contains(&connection_id) => {
                trace!(set = %self.key, connection = connection_id, "data for closed connection ignored");
                return Ok(());
            }
            None => match st.connections.remove(&PENDING_ID) {
                Some(pending) => {
                    pending.set_id(connection_id);
                    st.connections.insert(connection_id, Arc::clone(&pending));
                    debug!(set = %self.key, connection = connection_id, "pending connection labelled");
                    pending
                }
                None => {
                    if st.connections.len() >= MAX_CONNECTIONS {
                        return Err(DriftStreamError::ConnectionLimitReached(MAX_CONNECTIONS));
                    }
                    let connection = self.new_connection(connection_id);
                    st.connections.insert(connection_id, Arc::clone(&connection));
                    fx.accepted.push(Arc::clone(&connection));
                    debug!(set = %self.key, connection = connection_id, "inbound connection");
                    connection
                }
            },
        };

        if !payload.is_empty() {
            if let Err(e) = connection.receive(payload) {
                fx.overflowed.push((Arc::clone(&connection), e));
            }
        }
        fx.to_poll.push(connection);
        Ok(())
    }

    fn receive_ack(&self, st: &mut SetState, out_of_order: &[u32], fx: &mut Effects) -> Result<()> {
        let resend = st
            .transmit
            .apply_ack(out_of_order, st.total_tick_count, MIN_RETRANSMIT_TICKS);
        st.refresh_retransmit();
        for id in resend {
            if let Some(packet) = st.transmit.get_mut(id) {
                packet.resent();
            }
            self.send_packet(st, id, fx)?;
        }
        Ok(())
    }

    fn receive_close(&self, st: &mut SetState, connection_id: i32, fx: &mut Effects) {
        if let Some(connection) = st.connections.remove(&connection_id) {
            st.writers.retain(|c| !Arc::ptr_eq(c, &connection));
            st.remember_closed(connection_id);
            fx.closed_by_peer.push(connection);
        }
    }

    /// Acknowledgement bookkeeping run after every framed datagram.
    fn after_receive(&self, st: &mut SetState, lazy_ack_found: bool, fx: &mut Effects) -> Result<()> {
        let unack_diff = st.unack_in_sequence - st.sent_unack_in_sequence;
        let oos_diff = st.out_of_order_count - st.sent_out_of_order_count;
        if unack_diff > ACK_THRESHOLD || oos_diff > ACK_THRESHOLD {
            self.send_ack(st, false, fx)?;
        }

        let unack_diff = st.unack_in_sequence - st.sent_unack_in_sequence;
        if unack_diff == 1 && lazy_ack_found && !st.window.has_pending() {
            st.start_keep_alive();
        } else {
            st.keep_alive_ticks = 0;
            if (unack_diff > 0 || st.window.has_pending()) && st.explicit_ack_ticks == 0 {
                st.explicit_ack_ticks = st.timer.explicit_ack_ticks();
            }
        }
        Ok(())
    }

    fn notify_writers(&self, st: &mut SetState, fx: &mut Effects) {
        st.writers.retain(|c| c.is_connected());
        fx.to_poll.extend(st.writers.iter().cloned());
    }

    // ── Timers ────────────────────────────────────────────────────────────

    /// Advance the protocol timers by one tick.
    pub fn timer_tick(self: &Arc<Self>) {
        let mut fx = Effects::default();
        {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            if st.failed.is_some() {
                return;
            }
            st.total_tick_count += 1;
            if st.connections.is_empty() {
                st.idle_ticks += 1;
            } else {
                st.idle_ticks = 0;
            }

            let retransmit = countdown(&mut st.retransmit_ticks);
            let ack = countdown(&mut st.explicit_ack_ticks);
            let keep_alive = countdown(&mut st.keep_alive_ticks);

            st.stats_log_ticks += 1;
            if st.stats_log_ticks >= STATS_LOG_TICKS {
                st.stats_log_ticks = 0;
                self.log_stats(st);
            }

            if let Err(e) = self.on_timers(st, retransmit, ack, keep_alive, &mut fx) {
                fx.fail(e);
            }
        }
        self.complete(fx);
    }

    fn on_timers(
        &self,
        st: &mut SetState,
        retransmit: bool,
        ack: bool,
        keep_alive: bool,
        fx: &mut Effects,
    ) -> Result<()> {
        if retransmit {
            if let Some(id) = st.retransmit_target {
                if let Some(packet) = st.transmit.get_mut(id) {
                    packet.resent();
                    trace!(set = %self.key, %packet, "retransmit timer expired");
                    st.timer.record_timer_resend();
                    self.send_packet(st, id, fx)?;
                }
            }
        }
        if ack && st.crypto.is_some() {
            self.send_ack(st, true, fx)?;
        }
        if keep_alive && st.crypto.is_some() {
            self.send_stats_request(st, fx)?;
        }
        Ok(())
    }

    fn log_stats(&self, st: &SetState) {
        let s = &st.stats;
        debug!(
            set = %self.key,
            connections = st.connections.len(),
            timer_base = st.timer.current(),
            sent = s.packets_sent,
            resent = s.packets_resent,
            received = s.packets_received,
            duplicates = s.duplicates,
            out_of_order = s.out_of_order,
            unacked = st.transmit.len(),
            "connection set stats"
        );
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────

    /// Remove `connection` from the set. Sends a CLOSE once keys exist;
    /// before then the set cannot continue and fails.
    pub fn close(self: &Arc<Self>, connection: &Arc<Connection>, reason: &str) {
        let mut fx = Effects::default();
        let id = connection.id();
        let removed = {
            let mut guard = self.state.lock();
            let st = &mut *guard;
            let present = st.is_member(connection);
            if present {
                st.connections.remove(&id);
                st.writers.retain(|c| !Arc::ptr_eq(c, connection));
                st.remember_closed(id);
                if st.failed.is_none() {
                    if st.crypto.is_some() {
                        if let Err(e) = self.send_close(st, id, &mut fx) {
                            fx.fail(e);
                        }
                    } else {
                        fx.fail(DriftStreamError::SetupFailed);
                    }
                }
            }
            present
        };

        if removed {
            debug!(set = %self.key, connection = id, reason, "connection closed");
        }
        self.complete(fx);
        if removed {
            if let Some(host) = self.host.upgrade() {
                host.connection_removed(self, connection);
            }
        }
    }

    /// Fail the set and every connection in it. Only the first failure
    /// counts.
    pub fn fail(self: &Arc<Self>, error: DriftStreamError) {
        let error = Arc::new(error);
        let connections = {
            let mut st = self.state.lock();
            if st.failed.is_some() {
                return;
            }
            st.failed = Some(Arc::clone(&error));
            st.writers.clear();
            st.retransmit_ticks = 0;
            st.explicit_ack_ticks = 0;
            st.keep_alive_ticks = 0;
            st.connections.drain().map(|(_, c)| c).collect::<Vec<_>>()
        };

        debug!(set = %self.key, %error, "connection set failed");
        for connection in connections {
            connection.failed(Arc::clone(&error));
        }
        if let Some(host) = self.host.upgrade() {
            host.set_failed(self);
        }
    }

    fn complete(self: &Arc<Self>, fx: Effects) {
        let Effects {
            datagrams,
            accepted,
            closed_by_peer,
            overflowed,
            to_poll,
            mut failure,
        } = fx;
        let host = self.host.upgrade();

        if let Some(host) = &host {
            for datagram in datagrams {
                if let Err(e) = host.send(self, datagram) {
                    debug!(set = %self.key, error = %e, "datagram send failed");
                    failure.get_or_insert(e);
                    break;
                }
            }
        }

        for (connection, error) in overflowed {
            warn!(set = %self.key, connection = connection.id(), %error, "read buffer overflow");
            connection.failed(Arc::new(error));
            self.close(&connection, "read buffer overflow");
        }

        for connection in closed_by_peer {
            connection.remote_closed();
            if let Some(host) = &host {
                host.connection_removed(self, &connection);
            }
        }

        if let Some(host) = &host {
            for connection in accepted {
                host.accept(self, connection);
            }
        }

        for connection in to_poll {
            connection.poll();
        }

        if let Some(error) = failure {
            self.fail(error);
        }
    }
}

impl fmt::Debug for ConnectionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSet")
            .field("key", &self.key)
            .field("outgoing", &self.outgoing)
            .finish()
    }
}
