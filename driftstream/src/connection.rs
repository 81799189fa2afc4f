//! A logical connection multiplexed within a connection set.
//!
//! The connection owns only its read queue and lifecycle state. Every write
//! and close goes through the owning set, which holds the protocol state.
//! Lock order is always set then connection; the connection lock is a leaf.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};

use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use tracing::trace;

use crate::connection_set::ConnectionSet;
use crate::error::{DriftStreamError, Result};
use crate::frame::DATA_HEADER_LEN;
use crate::transport::TransportAdapter;

/// Identifier of an inbound connection whose real identifier has not yet
/// arrived in a DATA frame.
pub const PENDING_ID: i32 = -1;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    /// Closed locally or by the peer.
    Closed,
    /// Failed along with its set, or on read buffer overflow.
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Open => write!(f, "Open"),
            ConnectionState::Closed => write!(f, "Closed"),
            ConnectionState::Failed => write!(f, "Failed"),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: ConnectionState,
    read_queue: VecDeque<Bytes>,
    failure: Option<Arc<DriftStreamError>>,
}

pub struct Connection {
    id: AtomicI32,
    set: Weak<ConnectionSet>,
    adapter: Mutex<Weak<TransportAdapter>>,
    inner: Mutex<Inner>,
    mss: usize,
    read_capacity: usize,
}

impl Connection {
    pub(crate) fn new(
        id: i32,
        set: Weak<ConnectionSet>,
        mss: usize,
        read_capacity: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: AtomicI32::new(id),
            set,
            adapter: Mutex::new(Weak::new()),
            inner: Mutex::new(Inner {
                state: ConnectionState::Open,
                read_queue: VecDeque::new(),
                failure: None,
            }),
            mss,
            read_capacity,
        })
    }

    pub fn id(&self) -> i32 {
        self.id.load(Ordering::Acquire)
    }

    /// Relabel the pending inbound connection with the identifier the peer
    /// chose.
    pub(crate) fn set_id(&self, id: i32) {
        self.id.store(id, Ordering::Release);
    }

    pub fn set(&self) -> Option<Arc<ConnectionSet>> {
        self.set.upgrade()
    }

    pub(crate) fn set_adapter(&self, adapter: &Arc<TransportAdapter>) {
        *self.adapter.lock() = Arc::downgrade(adapter);
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn failure(&self) -> Option<Arc<DriftStreamError>> {
        self.inner.lock().failure.clone()
    }

    /// Largest payload one DATA frame carries.
    pub fn payload_capacity(&self) -> usize {
        self.mss.saturating_sub(DATA_HEADER_LEN)
    }

    /// Queue an in-order payload for the consumer. Fails once the queue
    /// holds its capacity of segments.
    pub(crate) fn receive(&self, payload: Bytes) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != ConnectionState::Open {
            return Ok(());
        }
        if inner.read_queue.len() >= self.read_capacity {
            return Err(DriftStreamError::ReadBufferOverflow(inner.read_queue.len()));
        }
        inner.read_queue.push_back(payload);
        Ok(())
    }

    /// Whether a read would return data (or report end of stream).
    pub fn can_read(&self) -> bool {
        let inner = self.inner.lock();
        !inner.read_queue.is_empty() || inner.state != ConnectionState::Open
    }

    /// Copy queued bytes into `buf`. Returns `Ok(0)` when nothing is queued
    /// on an open connection; once the queue drains on a closed or failed
    /// connection the terminal error is returned.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        let mut copied = 0;
        while copied < buf.len() {
            let Some(front) = inner.read_queue.front_mut() else {
                break;
            };
            let n = front.len().min(buf.len() - copied);
            buf[copied..copied + n].copy_from_slice(&front[..n]);
            front.advance(n);
            copied += n;
            if front.is_empty() {
                inner.read_queue.pop_front();
            }
        }

        if copied > 0 || buf.is_empty() {
            return Ok(copied);
        }
        match inner.state {
            ConnectionState::Open => Ok(0),
            ConnectionState::Closed => Err(DriftStreamError::ConnectionClosed),
            ConnectionState::Failed => Err(failure_error(inner.failure.as_deref())),
        }
    }

    pub fn queued_segments(&self) -> usize {
        self.inner.lock().read_queue.len()
    }

    pub fn can_write(self: &Arc<Self>) -> bool {
        if !self.is_connected() {
            return false;
        }
        match self.set.upgrade() {
            Some(set) => set.can_write(self),
            None => false,
        }
    }

    /// Write as much of `buffers` as fits one DATA frame. Returns the bytes
    /// taken, zero when the set cannot accept more right now.
    pub fn write(self: &Arc<Self>, buffers: &[&[u8]]) -> Result<usize> {
        {
            let inner = self.inner.lock();
            match inner.state {
                ConnectionState::Open => {}
                ConnectionState::Closed => return Err(DriftStreamError::ConnectionClosed),
                ConnectionState::Failed => {
                    return Err(failure_error(inner.failure.as_deref()))
                }
            }
        }
        let set = self.set.upgrade().ok_or(DriftStreamError::ConnectionClosed)?;
        set.write(self, buffers)
    }

    /// Hand the negotiated secret to the set. Ignored unless this is the
    /// set's lead connection.
    pub fn set_secret(self: &Arc<Self>, secret: &[u8]) -> Result<()> {
        let set = self.set.upgrade().ok_or(DriftStreamError::ConnectionClosed)?;
        set.set_secret(self, secret)
    }

    /// Close locally. Sends a CLOSE to the peer if the set has keys.
    pub fn close(self: &Arc<Self>, reason: &str) {
        if !self.transition(ConnectionState::Closed, None) {
            return;
        }
        trace!(connection = self.id(), reason, "connection closed");
        if let Some(set) = self.set.upgrade() {
            set.close(self, reason);
        }
        self.poll();
    }

    /// The peer closed this connection.
    pub(crate) fn remote_closed(&self) {
        if self.transition(ConnectionState::Closed, None) {
            trace!(connection = self.id(), "connection closed by peer");
        }
        self.poll();
    }

    /// Mark failed and wake the consumer.
    pub(crate) fn failed(&self, error: Arc<DriftStreamError>) {
        if self.transition(ConnectionState::Failed, Some(error)) {
            trace!(connection = self.id(), "connection failed");
        }
        self.poll();
    }

    /// Re-evaluate readiness for the consumer.
    pub fn poll(&self) {
        let adapter = self.adapter.lock().upgrade();
        if let Some(adapter) = adapter {
            adapter.poll();
        }
    }

    fn transition(&self, to: ConnectionState, failure: Option<Arc<DriftStreamError>>) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != ConnectionState::Open {
            return false;
        }
        inner.state = to;
        inner.failure = failure;
        true
    }
}

fn failure_error(failure: Option<&DriftStreamError>) -> DriftStreamError {
    match failure {
        Some(e) => DriftStreamError::ConnectionFailed(e.to_string()),
        None => DriftStreamError::ConnectionFailed("unknown failure".into()),
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        write!(
            f,
            "id={},state={},queued={}",
            self.id(),
            inner.state,
            inner.read_queue.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detached(capacity: usize) -> Arc<Connection> {
        Connection::new(3, Weak::new(), 1400, capacity)
    }

    #[test]
    fn read_spans_segments() {
        let conn = detached(8);
        conn.receive(Bytes::from_static(b"hel")).unwrap();
        conn.receive(Bytes::from_static(b"lo!")).unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(conn.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"hell");
        assert_eq!(conn.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"o!");
        assert_eq!(conn.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn overflow_is_reported() {
        let conn = detached(2);
        conn.receive(Bytes::from_static(b"a")).unwrap();
        conn.receive(Bytes::from_static(b"b")).unwrap();
        assert!(matches!(
            conn.receive(Bytes::from_static(b"c")),
            Err(DriftStreamError::ReadBufferOverflow(2))
        ));
    }

    #[test]
    fn queued_data_survives_failure() {
        let conn = detached(8);
        conn.receive(Bytes::from_static(b"tail")).unwrap();
        conn.failed(Arc::new(DriftStreamError::ResendLimitExceeded));
        assert_eq!(conn.state(), ConnectionState::Failed);

        let mut buf = [0u8; 8];
        assert_eq!(conn.read(&mut buf).unwrap(), 4);
        assert!(matches!(
            conn.read(&mut buf),
            Err(DriftStreamError::ConnectionFailed(_))
        ));
    }

    #[test]
    fn first_terminal_state_wins() {
        let conn = detached(8);
        conn.remote_closed();
        conn.failed(Arc::new(DriftStreamError::ResendLimitExceeded));
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(conn.can_read());
        assert!(!conn.can_write());
    }

    #[test]
    fn payload_capacity_excludes_data_header() {
        let conn = detached(8);
        assert_eq!(conn.payload_capacity(), 1400 - DATA_HEADER_LEN);
    }
}
