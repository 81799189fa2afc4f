//! Connection set tests: two sets wired back to back through an in-memory
//! host, with deterministic header keys and sequence sources.

mod common;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use drifttrust::crypto::hash::HEADER_HASH_LEN;
use drifttrust::{CounterSource, Rc4};
use driftstream::connection_set::{SetConfig, SetHost, MAX_CONNECTIONS};
use driftstream::frame::DATA_HEADER_LEN;
use driftstream::timer::{DEFAULT_TIMER_BASE, MAX_TIMER_BASE, MIN_TIMER_BASE};
use driftstream::{
    Connection, ConnectionSet, ConnectionState, DriftStreamError, Result, SessionCrypto, SessionKey,
};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Wire {
    outbox: Mutex<Vec<Bytes>>,
    accepted: Mutex<Vec<Arc<Connection>>>,
    removed: Mutex<Vec<i32>>,
    failed: AtomicBool,
}

impl Wire {
    fn take(&self) -> Vec<Bytes> {
        std::mem::take(&mut *self.outbox.lock())
    }
}

impl SetHost for Wire {
    fn send(&self, _set: &Arc<ConnectionSet>, datagram: Bytes) -> Result<()> {
        self.outbox.lock().push(datagram);
        Ok(())
    }

    fn accept(&self, _set: &Arc<ConnectionSet>, connection: Arc<Connection>) {
        self.accepted.lock().push(connection);
    }

    fn set_failed(&self, _set: &Arc<ConnectionSet>) {
        self.failed.store(true, Ordering::SeqCst);
    }

    fn connection_removed(&self, _set: &Arc<ConnectionSet>, connection: &Arc<Connection>) {
        self.removed.lock().push(connection.id());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dir {
    AtoB,
    BtoA,
}

struct Pair {
    a: Arc<ConnectionSet>,
    b: Arc<ConnectionSet>,
    wire_a: Arc<Wire>,
    wire_b: Arc<Wire>,
    lead_a: Arc<Connection>,
    lead_b: Arc<Connection>,
}

const OPENING: &[u8] = b"opening handshake bytes";
const REPLY: &[u8] = b"reply handshake bytes";

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn set_config(read_buffer_capacity: usize) -> SetConfig {
    SetConfig {
        mss: 1400,
        read_buffer_capacity,
        trace_protocol: false,
    }
}

fn crypto_a() -> SessionCrypto {
    SessionCrypto::new(
        Box::new(Rc4::new(b"a-to-b header key 20").unwrap()),
        Box::new(Rc4::new(b"b-to-a header key 20").unwrap()),
        Box::new(CounterSource::new(0x1000_1000)),
        Box::new(CounterSource::new(0x2000_2000)),
        7,
    )
}

fn crypto_b() -> SessionCrypto {
    SessionCrypto::new(
        Box::new(Rc4::new(b"b-to-a header key 20").unwrap()),
        Box::new(Rc4::new(b"a-to-b header key 20").unwrap()),
        Box::new(CounterSource::new(0x2000_2000)),
        Box::new(CounterSource::new(0x1000_1000)),
        11,
    )
}

fn new_sets(b_read_capacity: usize) -> (Arc<ConnectionSet>, Arc<ConnectionSet>, Arc<Wire>, Arc<Wire>) {
    common::init_tracing();
    let wire_a = Arc::new(Wire::default());
    let wire_b = Arc::new(Wire::default());
    let host_a: Weak<dyn SetHost> = Arc::downgrade(&(Arc::clone(&wire_a) as Arc<dyn SetHost>));
    let host_b: Weak<dyn SetHost> = Arc::downgrade(&(Arc::clone(&wire_b) as Arc<dyn SetHost>));
    let a = ConnectionSet::new(SessionKey::new(6881, addr(6882)), true, host_a, set_config(256));
    let b = ConnectionSet::new(
        SessionKey::new(6882, addr(6881)),
        false,
        host_b,
        set_config(b_read_capacity),
    );
    (a, b, wire_a, wire_b)
}

fn read_all(connection: &Connection) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 2048];
    while let Ok(n) = connection.read(&mut buf) {
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    out
}

fn deliver(to: &Arc<ConnectionSet>, datagrams: Vec<Bytes>) {
    for d in datagrams {
        to.receive(BytesMut::from(&d[..]));
    }
}

/// Run the raw opening exchange, then install deterministic keys on both
/// sides. Returns once each lead has consumed the other's crypto bytes.
fn establish_with(lead_id: i32, b_read_capacity: usize) -> Pair {
    let (a, b, wire_a, wire_b) = new_sets(b_read_capacity);

    let lead_a = a.add_connection(lead_id).unwrap();
    assert_eq!(lead_a.write(&[OPENING]).unwrap(), OPENING.len());
    deliver(&b, wire_a.take());

    let lead_b = Arc::clone(&wire_b.accepted.lock()[0]);
    assert_eq!(read_all(&lead_b), OPENING);
    b.install_crypto(crypto_b()).unwrap();

    assert_eq!(lead_b.write(&[REPLY]).unwrap(), REPLY.len());
    deliver(&a, wire_b.take());
    assert_eq!(read_all(&lead_a), REPLY);
    a.install_crypto(crypto_a()).unwrap();

    // The raw reply removed the opening frame.
    assert_eq!(a.transmit_len(), 0);
    assert_eq!(b.transmit_len(), 1);

    Pair {
        a,
        b,
        wire_a,
        wire_b,
        lead_a,
        lead_b,
    }
}

fn establish() -> Pair {
    establish_with(7, 256)
}

/// Shuttle datagrams both ways until nothing is in flight. `lose` decides
/// per datagram whether the network drops it.
fn exchange(p: &Pair, lose: &mut dyn FnMut(Dir, &Bytes) -> bool) {
    for _ in 0..100 {
        let from_a = p.wire_a.take();
        let from_b = p.wire_b.take();
        if from_a.is_empty() && from_b.is_empty() {
            return;
        }
        for d in from_a {
            if !lose(Dir::AtoB, &d) {
                p.b.receive(BytesMut::from(&d[..]));
            }
        }
        for d in from_b {
            if !lose(Dir::BtoA, &d) {
                p.a.receive(BytesMut::from(&d[..]));
            }
        }
    }
}

fn run(p: &Pair, ticks: usize, lose: &mut dyn FnMut(Dir, &Bytes) -> bool) {
    for _ in 0..ticks {
        exchange(p, lose);
        p.a.timer_tick();
        p.b.timer_tick();
    }
    exchange(p, lose);
}

fn lossless(_: Dir, _: &Bytes) -> bool {
    false
}

fn sequence_of(d: &Bytes) -> u32 {
    u32::from_be_bytes([d[4], d[5], d[6], d[7]])
}

/// Drops the first transmission of every `nth` new A-to-B frame longer
/// than `min_len`. Retransmissions always get through.
fn first_send_dropper(nth: usize, min_len: usize) -> impl FnMut(Dir, &Bytes) -> bool {
    let mut seen = HashSet::new();
    let mut fresh = 0usize;
    move |dir, d| {
        if dir != Dir::AtoB || d.len() <= min_len {
            return false;
        }
        if !seen.insert(sequence_of(d)) {
            return false;
        }
        fresh += 1;
        fresh % nth == 0
    }
}

// ---------------------------------------------------------------------------
// Establishment and delivery
// ---------------------------------------------------------------------------

#[test]
fn hello_arrives_on_connection_seven() {
    let p = establish();
    assert_eq!(p.lead_a.write(&[&b"hello"[..]]).unwrap(), 5);
    run(&p, 0, &mut lossless);

    // The first DATA labels the pending inbound lead.
    assert_eq!(p.lead_b.id(), 7);
    assert_eq!(read_all(&p.lead_b), b"hello");
    assert_eq!(p.b.connection(7).unwrap().id(), 7);

    // Its echo acknowledged the reply.
    assert_eq!(p.b.transmit_len(), 0);
    assert!(p.lead_b.write(&[&b"world"[..]]).unwrap() > 0);
    run(&p, 30, &mut lossless);
    assert_eq!(read_all(&p.lead_a), b"world");
    assert_eq!(p.a.stats().data_received, 1);
    assert!(!p.a.is_failed());
}

#[test]
fn gathered_buffers_form_one_segment() {
    let p = establish();
    let n = p.lead_a.write(&[&b"abc"[..], &b""[..], &b"def"[..]]).unwrap();
    assert_eq!(n, 6);
    run(&p, 0, &mut lossless);
    assert_eq!(read_all(&p.lead_b), b"abcdef");
    assert_eq!(p.b.stats().data_received, 1);
}

#[test]
fn replayed_frame_is_delivered_once() {
    let p = establish();
    p.lead_a.write(&[&b"once"[..]]).unwrap();
    let sent = p.wire_a.take();
    assert_eq!(sent.len(), 1);

    deliver(&p.b, sent.clone());
    deliver(&p.b, sent.clone());
    assert_eq!(read_all(&p.lead_b), b"once");

    // Replaying it again after later traffic is still a duplicate.
    p.lead_a.write(&[&b"twice"[..]]).unwrap();
    run(&p, 0, &mut lossless);
    deliver(&p.b, sent);
    assert_eq!(read_all(&p.lead_b), b"twice");
    assert!(p.b.stats().duplicates >= 2);
}

#[test]
fn out_of_order_frames_are_delivered_in_order() {
    let p = establish();
    let messages: Vec<String> = (0..8).map(|i| format!("m{i};")).collect();
    for m in &messages {
        assert!(p.lead_a.write(&[m.as_bytes()]).unwrap() > 0);
    }
    let sent = p.wire_a.take();
    assert_eq!(sent.len(), 8);

    for i in [5usize, 2, 7, 0, 3, 6, 1, 4] {
        p.b.receive(BytesMut::from(&sent[i][..]));
    }
    assert_eq!(read_all(&p.lead_b), messages.concat().as_bytes());
    assert!(p.b.stats().out_of_order > 0);

    run(&p, 40, &mut lossless);
    assert_eq!(p.b.out_of_order_pending(), 0);
    assert!(p.lead_a.can_write());
}

#[test]
fn ack_reports_only_the_listed_out_of_order_frames() {
    let p = establish();
    let messages: Vec<String> = (0..6).map(|i| format!("k{i};")).collect();
    for m in &messages {
        assert!(p.lead_a.write(&[m.as_bytes()]).unwrap() > 0);
    }
    let sent = p.wire_a.take();
    assert_eq!(sent.len(), 6);
    p.wire_b.take();

    for d in &sent[1..4] {
        p.b.receive(BytesMut::from(&d[..]));
    }
    assert_eq!(p.b.unreported_out_of_order(), 3);
    assert!(p.wire_b.take().is_empty());

    // The fourth arrival crosses the threshold; the ACK lists three of them.
    p.b.receive(BytesMut::from(&sent[4][..]));
    assert_eq!(p.wire_b.take().len(), 1);
    assert_eq!(p.b.unreported_out_of_order(), 1);

    p.b.receive(BytesMut::from(&sent[0][..]));
    p.b.receive(BytesMut::from(&sent[5][..]));
    assert_eq!(read_all(&p.lead_b), messages.concat().as_bytes());
}

#[test]
fn corrupted_header_drops_only_that_frame() {
    let p = establish();
    p.lead_a.write(&[&b"one;"[..]]).unwrap();
    run(&p, 0, &mut lossless);
    assert_eq!(read_all(&p.lead_b), b"one;");

    p.lead_a.write(&[&b"two;"[..]]).unwrap();
    let mut sent = p.wire_a.take();
    assert_eq!(sent.len(), 1);
    let mut frame = BytesMut::from(&sent.remove(0)[..]);
    assert_eq!(frame.len(), DATA_HEADER_LEN + 4);
    // Last byte of the connection id, just ahead of the hash.
    frame[DATA_HEADER_LEN - HEADER_HASH_LEN - 1] ^= 0x01;
    p.b.receive(frame);

    assert_eq!(p.b.stats().hash_failures, 1);
    assert!(read_all(&p.lead_b).is_empty());
    assert!(!p.b.is_failed());
    assert!(p.lead_b.is_connected());

    p.lead_a.write(&[&b"three;"[..]]).unwrap();
    run(&p, 30, &mut lossless);
    assert_eq!(read_all(&p.lead_b), b"three;");
    assert_eq!(p.b.stats().hash_failures, 1);
    assert!(!p.a.is_failed());
    assert!(!p.b.is_failed());
}

#[test]
fn writes_stall_at_unacknowledged_limit() {
    let p = establish();
    let mut accepted = 0;
    for i in 0..20 {
        let msg = format!("burst-{i}");
        if p.lead_a.write(&[msg.as_bytes()]).unwrap() == 0 {
            break;
        }
        accepted += 1;
    }
    assert_eq!(accepted, driftstream::connection_set::MAX_TRANSMIT_UNACK);
    assert!(!p.lead_a.can_write());

    run(&p, 30, &mut lossless);
    assert!(p.lead_a.can_write());
}

#[test]
fn long_stream_survives_periodic_loss() {
    let p = establish();
    let mut lose = first_send_dropper(4, 80);
    let mut expected = Vec::new();
    let mut received = Vec::new();

    for i in 0..60 {
        let msg = format!("{i:03}:{}", "x".repeat(80));
        let mut spins = 0;
        while !p.lead_a.can_write() {
            run(&p, 1, &mut lose);
            received.extend(read_all(&p.lead_b));
            spins += 1;
            assert!(spins < 3000, "writer never unblocked");
        }
        assert_eq!(p.lead_a.write(&[msg.as_bytes()]).unwrap(), msg.len());
        expected.extend_from_slice(msg.as_bytes());
        exchange(&p, &mut lose);
        received.extend(read_all(&p.lead_b));
    }

    for _ in 0..3000 {
        if received.len() == expected.len() {
            break;
        }
        run(&p, 1, &mut lose);
        received.extend(read_all(&p.lead_b));
    }
    assert_eq!(received, expected);
    assert!(p.a.stats().packets_resent > 0);
    assert!(!p.a.is_failed());
    assert!(!p.b.is_failed());
}

#[test]
fn lost_ack_is_recovered_by_duplicate() {
    let p = establish();
    p.lead_a.write(&[&b"ping"[..]]).unwrap();

    let mut first_ack_lost = false;
    let mut lose = |dir: Dir, _: &Bytes| {
        if dir == Dir::BtoA && !first_ack_lost {
            first_ack_lost = true;
            return true;
        }
        false
    };
    run(&p, 60, &mut lose);

    assert!(first_ack_lost);
    assert_eq!(read_all(&p.lead_b), b"ping");
    assert_eq!(p.a.transmit_len(), 0);
    assert_eq!(p.a.stats().packets_resent, 1);
    assert!(p.b.stats().duplicates >= 1);
}

// ---------------------------------------------------------------------------
// Failure
// ---------------------------------------------------------------------------

#[test]
fn total_loss_fails_the_set() {
    let p = establish();
    p.lead_a.write(&[&b"into the void"[..]]).unwrap();

    let mut lose = |dir: Dir, _: &Bytes| dir == Dir::AtoB;
    for _ in 0..10_000 {
        if p.a.is_failed() {
            break;
        }
        run(&p, 1, &mut lose);
    }

    assert!(p.a.is_failed());
    let failure = p.a.failure().unwrap();
    assert!(matches!(*failure, DriftStreamError::ResendLimitExceeded));
    assert!(p.wire_a.failed.load(Ordering::SeqCst));
    assert_eq!(p.lead_a.state(), ConnectionState::Failed);
    assert!(p.lead_a.write(&[&b"more"[..]]).is_err());
}

#[test]
fn close_before_keys_fails_setup() {
    let (a, _b, wire_a, _wire_b) = new_sets(256);
    let lead = a.add_connection(1).unwrap();
    lead.write(&[OPENING]).unwrap();
    lead.close("gave up");

    assert!(a.is_failed());
    assert!(matches!(*a.failure().unwrap(), DriftStreamError::SetupFailed));
    assert!(wire_a.failed.load(Ordering::SeqCst));
}

#[test]
fn only_the_lead_writes_before_the_handshake() {
    let (a, _b, _wire_a, _wire_b) = new_sets(256);
    let lead = a.add_connection(1).unwrap();
    let other = a.add_connection(2).unwrap();
    assert!(!other.can_write());
    assert_eq!(other.write(&[&b"too early"[..]]).unwrap(), 0);

    lead.write(&[OPENING]).unwrap();
    // No keys yet, so nobody may send framed data.
    assert!(!lead.can_write());
    assert!(!other.can_write());
}

#[test]
fn read_buffer_overflow_closes_connection() {
    let p = establish_with(7, 2);
    for msg in [&b"one"[..], &b"two"[..], &b"three"[..]] {
        p.lead_a.write(&[msg]).unwrap();
    }
    run(&p, 30, &mut lossless);

    assert_eq!(p.lead_b.state(), ConnectionState::Failed);
    assert!(matches!(
        *p.lead_b.failure().unwrap(),
        DriftStreamError::ReadBufferOverflow(_)
    ));
    // The peer was told.
    assert_eq!(p.lead_a.state(), ConnectionState::Closed);
    assert!(!p.a.is_failed());
    assert!(!p.b.is_failed());
}

#[test]
fn connection_limit_is_enforced() {
    let p = establish();
    for id in 100..(100 + MAX_CONNECTIONS as i32 - 1) {
        p.a.add_connection(id).unwrap();
    }
    assert_eq!(p.a.connection_count(), MAX_CONNECTIONS);
    assert!(matches!(
        p.a.add_connection(999),
        Err(DriftStreamError::ConnectionLimitReached(MAX_CONNECTIONS))
    ));
}

// ---------------------------------------------------------------------------
// Multiplexing and lifecycle
// ---------------------------------------------------------------------------

#[test]
fn closing_one_connection_leaves_the_other() {
    let p = establish();
    p.lead_a.write(&[&b"a0"[..]]).unwrap();
    run(&p, 0, &mut lossless);
    assert_eq!(read_all(&p.lead_b), b"a0");

    let second = p.a.add_connection(8).unwrap();
    second.write(&[&b"b0"[..]]).unwrap();
    run(&p, 0, &mut lossless);
    let inbound = p.wire_b.accepted.lock().last().cloned().unwrap();
    assert_eq!(inbound.id(), 8);
    assert_eq!(read_all(&inbound), b"b0");

    p.lead_a.close("done with seven");
    run(&p, 20, &mut lossless);
    assert_eq!(p.lead_b.state(), ConnectionState::Closed);
    assert!(p.wire_b.removed.lock().contains(&7));
    assert!(p.wire_a.removed.lock().contains(&7));

    second.write(&[&b"b1"[..]]).unwrap();
    run(&p, 20, &mut lossless);
    assert_eq!(read_all(&inbound), b"b1");
    assert_eq!(inbound.state(), ConnectionState::Open);
    assert_eq!(p.b.connection_count(), 1);
    assert!(!p.a.is_failed());
    assert!(!p.b.is_failed());
}

#[test]
fn closed_reader_sees_queued_data_then_end() {
    let p = establish();
    p.lead_a.write(&[&b"last words"[..]]).unwrap();
    p.lead_a.close("finished");
    run(&p, 20, &mut lossless);

    let mut buf = [0u8; 64];
    let n = p.lead_b.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"last words");
    assert!(matches!(
        p.lead_b.read(&mut buf),
        Err(DriftStreamError::ConnectionClosed)
    ));
}

#[test]
fn empty_set_expires_after_idle_limit() {
    let p = establish();
    p.lead_a.write(&[&b"brief"[..]]).unwrap();
    run(&p, 0, &mut lossless);
    p.lead_a.close("done");
    run(&p, 20, &mut lossless);

    assert_eq!(p.a.connection_count(), 0);
    assert_eq!(p.b.connection_count(), 0);
    assert!(!p.a.idle_limit_exceeded());

    run(&p, 600, &mut lossless);
    assert!(p.a.idle_limit_exceeded());
    assert!(p.b.idle_limit_exceeded());
}

#[test]
fn quiet_sessions_exchange_keep_alives() {
    let p = establish();
    p.lead_a.write(&[&b"hi"[..]]).unwrap();
    run(&p, 40, &mut lossless);
    let before = p.a.stats().packets_sent + p.b.stats().packets_sent;

    // 25 seconds of silence from the application.
    run(&p, 1000, &mut lossless);
    let after = p.a.stats().packets_sent + p.b.stats().packets_sent;
    assert!(after > before);
    assert!(!p.a.is_failed());
    assert!(!p.b.is_failed());
}

// ---------------------------------------------------------------------------
// Timer base
// ---------------------------------------------------------------------------

#[test]
fn timer_base_grows_under_loss_and_peer_follows() {
    let p = establish();
    let mut lose = first_send_dropper(1, 80);
    let payload = vec![0x5a; 64];

    let mut max_a = p.a.timer_base();
    let mut max_b = p.b.timer_base();
    for _ in 0..8 {
        assert_eq!(p.lead_a.write(&[payload.as_slice()]).unwrap(), payload.len());
        for _ in 0..2000 {
            run(&p, 1, &mut lose);
            for base in [p.a.timer_base(), p.b.timer_base()] {
                assert!((MIN_TIMER_BASE..=MAX_TIMER_BASE).contains(&base));
            }
            max_a = max_a.max(p.a.timer_base());
            max_b = max_b.max(p.b.timer_base());
            if p.a.transmit_len() == 0 {
                break;
            }
        }
        read_all(&p.lead_b);
    }

    assert!(max_a > DEFAULT_TIMER_BASE);
    assert!(max_b > DEFAULT_TIMER_BASE);
    assert!(!p.a.is_failed());
}
