//! The consumer-facing transport.
//!
//! [`TransportAdapter`] presents one logical connection as a selectable,
//! filtered byte transport. Consumers register read and write listeners and
//! are told of readiness through the [`Selector`]; they never block.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::connection::Connection;
use crate::error::{DriftStreamError, Result};
use crate::selector::{SelectListener, Selector};

/// Payload transformation installed once the crypto handshake completes.
pub trait TransportFilter: Send {
    fn encrypt(&mut self, data: &mut [u8]);
    fn decrypt(&mut self, data: &mut [u8]);
    fn name(&self) -> &str;
}

/// Filter that leaves payloads untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainFilter;

impl TransportFilter for PlainFilter {
    fn encrypt(&mut self, _data: &mut [u8]) {}

    fn decrypt(&mut self, _data: &mut [u8]) {}

    fn name(&self) -> &str {
        "none"
    }
}

/// A non-blocking, selectable byte transport.
pub trait SelectableTransport: Send + Sync {
    /// Write from `buffers`, returning the bytes taken. Zero means try again
    /// after the next write readiness.
    fn write(&self, buffers: &[&[u8]]) -> Result<usize>;

    /// Read into `buf`. Zero means nothing available yet.
    fn read(&self, buf: &mut [u8]) -> Result<usize>;

    fn register_for_read_selects(&self, listener: Arc<dyn SelectListener>);
    fn register_for_write_selects(&self, listener: Arc<dyn SelectListener>);
    fn cancel_read_selects(&self);
    fn cancel_write_selects(&self);
    fn pause_read_selects(&self);
    fn resume_read_selects(&self);
    fn pause_write_selects(&self);
    fn resume_write_selects(&self);

    fn close(&self, reason: &str);
    fn is_closed(&self) -> bool;

    /// Maximum segment size of the underlying datagrams.
    fn mss(&self) -> usize;
}

#[derive(Default)]
struct Registration {
    listener: Option<Arc<dyn SelectListener>>,
    paused: bool,
    pending: Arc<AtomicBool>,
}

impl Registration {
    fn active(&self) -> Option<(Arc<dyn SelectListener>, Arc<AtomicBool>)> {
        match &self.listener {
            Some(l) if !self.paused => Some((Arc::clone(l), Arc::clone(&self.pending))),
            _ => None,
        }
    }
}

/// Selectable view of one [`Connection`].
pub struct TransportAdapter {
    connection: Arc<Connection>,
    selector: Arc<Selector>,
    mss: usize,
    filter: Mutex<Option<Box<dyn TransportFilter>>>,
    /// Filtered bytes the connection has not yet accepted.
    pending_write: Mutex<BytesMut>,
    read_select: Mutex<Registration>,
    write_select: Mutex<Registration>,
    closed: AtomicBool,
    failure_reported: AtomicBool,
}

impl TransportAdapter {
    pub fn new(connection: Arc<Connection>, selector: Arc<Selector>, mss: usize) -> Arc<Self> {
        let adapter = Arc::new(Self {
            connection,
            selector,
            mss,
            filter: Mutex::new(None),
            pending_write: Mutex::new(BytesMut::new()),
            read_select: Mutex::new(Registration::default()),
            write_select: Mutex::new(Registration::default()),
            closed: AtomicBool::new(false),
            failure_reported: AtomicBool::new(false),
        });
        adapter.connection.set_adapter(&adapter);
        adapter
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn connection_id(&self) -> i32 {
        self.connection.id()
    }

    /// Install the payload filter negotiated by the handshake.
    pub fn set_filter(&self, filter: Box<dyn TransportFilter>) {
        debug!(
            connection = self.connection.id(),
            filter = filter.name(),
            "transport filter installed"
        );
        *self.filter.lock() = Some(filter);
    }

    pub fn filter_name(&self) -> String {
        self.filter
            .lock()
            .as_ref()
            .map_or_else(|| "none".to_string(), |f| f.name().to_string())
    }

    /// Bytes accepted from the consumer but not yet framed.
    pub fn pending_write_len(&self) -> usize {
        self.pending_write.lock().len()
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DriftStreamError::ConnectionClosed);
        }
        Ok(())
    }

    fn can_write(&self) -> bool {
        self.connection.can_write()
    }

    /// Re-evaluate readiness and queue notifications with the selector.
    pub fn poll(&self) {
        if let Some(error) = self.connection.failure() {
            if !self.failure_reported.swap(true, Ordering::AcqRel) {
                let listeners: Vec<_> = [&self.read_select, &self.write_select]
                    .iter()
                    .filter_map(|r| r.lock().listener.clone())
                    .collect();
                for listener in listeners {
                    self.selector.failed(&listener, Arc::clone(&error));
                }
            }
            return;
        }

        let read = self.read_select.lock().active();
        if let Some((listener, pending)) = read {
            if self.connection.can_read() {
                self.selector.ready(&listener, &pending);
            }
        }

        let write = self.write_select.lock().active();
        if let Some((listener, pending)) = write {
            if self.can_write() {
                self.selector.ready(&listener, &pending);
            }
        }
    }

    fn flush_pending(&self, pending: &mut BytesMut) -> Result<()> {
        while !pending.is_empty() {
            let n = self.connection.write(&[&pending[..]])?;
            if n == 0 {
                break;
            }
            pending.advance(n);
        }
        Ok(())
    }
}

impl SelectableTransport for TransportAdapter {
    fn write(&self, buffers: &[&[u8]]) -> Result<usize> {
        self.check_open()?;
        if let Some(error) = self.connection.failure() {
            return Err(DriftStreamError::ConnectionFailed(error.to_string()));
        }
        if !self.connection.is_connected() {
            return Err(DriftStreamError::ConnectionClosed);
        }

        let mut pending = self.pending_write.lock();
        self.flush_pending(&mut pending)?;
        if !pending.is_empty() {
            return Ok(0);
        }

        let mut filter = self.filter.lock();
        let Some(filter) = filter.as_mut() else {
            return self.connection.write(buffers);
        };

        if !self.can_write() {
            return Ok(0);
        }

        let limit = self.connection.payload_capacity();
        let mut chunk = BytesMut::with_capacity(limit);
        for buf in buffers {
            let room = limit - chunk.len();
            if room == 0 {
                break;
            }
            chunk.extend_from_slice(&buf[..buf.len().min(room)]);
        }
        if chunk.is_empty() {
            return Ok(0);
        }

        let taken = chunk.len();
        filter.encrypt(&mut chunk);
        *pending = chunk;
        self.flush_pending(&mut pending)?;
        if !pending.is_empty() {
            trace!(
                connection = self.connection.id(),
                buffered = pending.len(),
                "encrypted bytes held for a later write"
            );
        }
        Ok(taken)
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.check_open()?;
        let n = self.connection.read(buf)?;
        if n > 0 {
            if let Some(filter) = self.filter.lock().as_mut() {
                filter.decrypt(&mut buf[..n]);
            }
        }
        Ok(n)
    }

    fn register_for_read_selects(&self, listener: Arc<dyn SelectListener>) {
        {
            let mut reg = self.read_select.lock();
            reg.listener = Some(listener);
            reg.paused = false;
        }
        self.poll();
    }

    fn register_for_write_selects(&self, listener: Arc<dyn SelectListener>) {
        {
            let mut reg = self.write_select.lock();
            reg.listener = Some(listener);
            reg.paused = false;
        }
        self.poll();
    }

    fn cancel_read_selects(&self) {
        self.read_select.lock().listener = None;
    }

    fn cancel_write_selects(&self) {
        self.write_select.lock().listener = None;
    }

    fn pause_read_selects(&self) {
        self.read_select.lock().paused = true;
    }

    fn resume_read_selects(&self) {
        self.read_select.lock().paused = false;
        self.poll();
    }

    fn pause_write_selects(&self) {
        self.write_select.lock().paused = true;
    }

    fn resume_write_selects(&self) {
        self.write_select.lock().paused = false;
        self.poll();
    }

    fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Closing polls once more, so registered listeners see the close.
        self.connection.close(reason);
        self.cancel_read_selects();
        self.cancel_write_selects();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || !self.connection.is_connected()
    }

    fn mss(&self) -> usize {
        self.mss
    }
}

impl fmt::Debug for TransportAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportAdapter")
            .field("connection", &self.connection)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}
