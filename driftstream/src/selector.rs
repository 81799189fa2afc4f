//! Readiness dispatch.
//!
//! Connections never call consumer code directly. Readiness and failure
//! notifications are queued here and run on the selector thread (or on the
//! caller of [`Selector::dispatch_pending`] when driven by hand), so protocol
//! locks are never held while consumer callbacks run.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::error::{DriftStreamError, Result};

/// Receives readiness callbacks for one transport direction.
pub trait SelectListener: Send + Sync {
    /// The transport is ready. Returns whether any progress was made.
    fn selected(&self) -> bool;

    /// The transport failed; no further readiness will be reported.
    fn select_failure(&self, error: &DriftStreamError);
}

/// Periodically asked to re-evaluate readiness of everything it owns.
pub trait PollSource: Send + Sync {
    fn poll_all(&self);
}

enum Event {
    Ready {
        listener: Arc<dyn SelectListener>,
        pending: Arc<AtomicBool>,
    },
    Failed {
        listener: Arc<dyn SelectListener>,
        error: Arc<DriftStreamError>,
    },
}

/// Counters kept by the selector.
#[derive(Debug, Default)]
pub struct SelectorStats {
    pub ready_dispatched: AtomicU64,
    pub failures_dispatched: AtomicU64,
    pub idle_selects: AtomicU64,
}

pub struct Selector {
    queue: SegQueue<Event>,
    wake_lock: Mutex<()>,
    wake: Condvar,
    running: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
    poll_interval: Duration,
    stats: SelectorStats,
}

impl Selector {
    pub fn new(poll_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            queue: SegQueue::new(),
            wake_lock: Mutex::new(()),
            wake: Condvar::new(),
            running: AtomicBool::new(false),
            handle: Mutex::new(None),
            poll_interval,
            stats: SelectorStats::default(),
        })
    }

    /// Queue a readiness callback. `pending` collapses repeated readiness of
    /// the same registration into one queued event.
    pub fn ready(&self, listener: &Arc<dyn SelectListener>, pending: &Arc<AtomicBool>) {
        if pending.swap(true, Ordering::AcqRel) {
            return;
        }
        self.queue.push(Event::Ready {
            listener: Arc::clone(listener),
            pending: Arc::clone(pending),
        });
        self.notify();
    }

    /// Queue a failure callback.
    pub fn failed(&self, listener: &Arc<dyn SelectListener>, error: Arc<DriftStreamError>) {
        self.queue.push(Event::Failed {
            listener: Arc::clone(listener),
            error,
        });
        self.notify();
    }

    fn notify(&self) {
        let _guard = self.wake_lock.lock();
        self.wake.notify_one();
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn stats(&self) -> &SelectorStats {
        &self.stats
    }

    /// Run every queued callback on the calling thread, including those
    /// queued by the callbacks themselves. Returns the number run.
    pub fn dispatch_pending(&self) -> usize {
        let mut count = 0;
        while let Some(event) = self.queue.pop() {
            count += 1;
            match event {
                Event::Ready { listener, pending } => {
                    pending.store(false, Ordering::Release);
                    self.stats.ready_dispatched.fetch_add(1, Ordering::Relaxed);
                    if !listener.selected() {
                        self.stats.idle_selects.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Event::Failed { listener, error } => {
                    self.stats.failures_dispatched.fetch_add(1, Ordering::Relaxed);
                    listener.select_failure(&error);
                }
            }
        }
        count
    }

    /// Start the dispatch thread. `poller` is asked to re-poll readiness
    /// every poll interval.
    pub fn start(self: &Arc<Self>, poller: Weak<dyn PollSource>) -> Result<()> {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return Ok(());
        }
        self.running.store(true, Ordering::Release);

        let selector = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("drift-selector".into())
            .spawn(move || selector.run(poller))?;
        *handle = Some(spawned);
        debug!(interval = ?self.poll_interval, "selector started");
        Ok(())
    }

    /// Stop the dispatch thread and wait for it to exit.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        {
            let _guard = self.wake_lock.lock();
            self.wake.notify_all();
        }
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("selector thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn run(&self, poller: Weak<dyn PollSource>) {
        let mut last_poll = Instant::now();
        while self.running.load(Ordering::Acquire) {
            self.dispatch_pending();

            if last_poll.elapsed() >= self.poll_interval {
                last_poll = Instant::now();
                match poller.upgrade() {
                    Some(source) => source.poll_all(),
                    None => break,
                }
                continue;
            }

            let mut guard = self.wake_lock.lock();
            if self.queue.is_empty() && self.running.load(Ordering::Acquire) {
                let remaining = self.poll_interval.saturating_sub(last_poll.elapsed());
                self.wake.wait_for(&mut guard, remaining);
            }
        }
        self.running.store(false, Ordering::Release);
        trace!("selector thread exiting");
    }
}

impl std::fmt::Debug for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selector")
            .field("queued", &self.queue.len())
            .field("running", &self.is_running())
            .finish()
    }
}
