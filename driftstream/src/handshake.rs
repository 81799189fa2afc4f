//! Crypto handshake collaborator.
//!
//! The transport does not negotiate keys itself. A [`CryptoHandshake`] runs
//! over a freshly created [`SelectableTransport`], reports the shared secret
//! (which keys the frame headers of the lead connection's set) and finally
//! hands back a payload [`TransportFilter`].
//!
//! [`X25519Handshake`] is the reference implementation:
//!
//! ```text
//!   Initiator                              Responder
//!     |--- Hello (pub_i, pad) -------------->|  got_secret, then reply
//!     |<-- Hello (pub_r, pad) ---------------|
//!     |    got_secret                        |
//!     |--- RC4(8 zero bytes) --------------->|  verify, success
//!     |    success                           |
//! ```
//!
//! The confirmation is the initiator's first framed DATA frame, so the
//! responder never sends framed traffic before the initiator has keys.

use std::ops::RangeInclusive;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use drifttrust::crypto::x25519::SessionSecret;
use drifttrust::handshake::messages::{Hello, HELLO_PREFIX_LEN};
use drifttrust::handshake::protocol::{Initiator, Responder};
use drifttrust::{KeyStream, Rc4};
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, trace};

use crate::error::{DriftStreamError, Result};
use crate::selector::SelectListener;
use crate::transport::{SelectableTransport, TransportFilter};

/// Length of the verification constant closing the handshake.
pub const CONFIRM_LEN: usize = 8;

/// Receives the outcome of a handshake.
pub trait HandshakeListener: Send + Sync {
    /// The shared secret is known. Called before any further handshake
    /// bytes are written.
    fn got_secret(&self, secret: &[u8]);

    fn handshake_success(&self, filter: Box<dyn TransportFilter>, remaining: Bytes);

    fn handshake_failure(&self, error: DriftStreamError);
}

/// Negotiates keys over a transport.
pub trait CryptoHandshake: Send + Sync {
    fn manage_crypto(
        &self,
        transport: Arc<dyn SelectableTransport>,
        shared_secrets: &[Bytes],
        incoming: bool,
        initial_data: Bytes,
        listener: Arc<dyn HandshakeListener>,
    );
}

/// RC4-drop1024 payload filter, one keystream per direction.
pub struct Rc4Filter {
    outbound: Rc4,
    inbound: Rc4,
}

impl Rc4Filter {
    pub fn new(outbound_key: &[u8], inbound_key: &[u8]) -> Result<Self> {
        Ok(Self {
            outbound: Rc4::new(outbound_key)?,
            inbound: Rc4::new(inbound_key)?,
        })
    }
}

impl TransportFilter for Rc4Filter {
    fn encrypt(&mut self, data: &mut [u8]) {
        self.outbound.apply(data);
    }

    fn decrypt(&mut self, data: &mut [u8]) {
        self.inbound.apply(data);
    }

    fn name(&self) -> &str {
        "RC4"
    }
}

/// Reference handshake: ephemeral X25519, HKDF-SHA256, RC4 payload filter.
#[derive(Debug, Clone)]
pub struct X25519Handshake {
    /// Padding of the opening hello. With the 34-byte hello prefix the
    /// default keeps the first datagram inside the inbound size window.
    pub initiator_padding: RangeInclusive<usize>,
    pub responder_padding: RangeInclusive<usize>,
}

impl Default for X25519Handshake {
    fn default() -> Self {
        Self {
            initiator_padding: 62..=190,
            responder_padding: 0..=32,
        }
    }
}

impl CryptoHandshake for X25519Handshake {
    fn manage_crypto(
        &self,
        transport: Arc<dyn SelectableTransport>,
        _shared_secrets: &[Bytes],
        incoming: bool,
        initial_data: Bytes,
        listener: Arc<dyn HandshakeListener>,
    ) {
        let task = Arc::new(HandshakeTask {
            transport: Arc::clone(&transport),
            listener,
            state: Mutex::new(TaskState {
                phase: if incoming {
                    Phase::AwaitHello
                } else {
                    Phase::Start
                },
                initiator: Initiator::new(),
                responder: Responder::new(),
                inbound: BytesMut::new(),
                outbound: BytesMut::new(),
                filter: None,
                initial_data,
            }),
            incoming,
            padding: if incoming {
                self.responder_padding.clone()
            } else {
                self.initiator_padding.clone()
            },
        });

        if !incoming {
            task.drive();
        }
        transport.register_for_read_selects(task.clone());
        transport.register_for_write_selects(task);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Initiator has not written its hello yet.
    Start,
    AwaitHello,
    AwaitConfirm,
    /// Final message queued; finish once it is written.
    Flushing,
    Done,
}

struct TaskState {
    phase: Phase,
    initiator: Initiator,
    responder: Responder,
    inbound: BytesMut,
    outbound: BytesMut,
    filter: Option<Rc4Filter>,
    initial_data: Bytes,
}

enum Outcome {
    Pending,
    Success(Box<dyn TransportFilter>, Bytes),
    Failure(DriftStreamError),
}

struct HandshakeTask {
    transport: Arc<dyn SelectableTransport>,
    listener: Arc<dyn HandshakeListener>,
    state: Mutex<TaskState>,
    incoming: bool,
    padding: RangeInclusive<usize>,
}

impl HandshakeTask {
    /// Advance as far as the transport allows. Returns whether progress was
    /// made.
    fn drive(&self) -> bool {
        let outcome = {
            let mut st = self.state.lock();
            if st.phase == Phase::Done {
                return false;
            }
            match self.step(&mut st) {
                Ok(progress) => {
                    if st.phase == Phase::Flushing && st.outbound.is_empty() {
                        st.phase = Phase::Done;
                        let remaining = std::mem::take(&mut st.initial_data);
                        match st.filter.take() {
                            Some(filter) => Outcome::Success(Box::new(filter), remaining),
                            None => Outcome::Failure(DriftStreamError::Internal(
                                "handshake finished without a filter".into(),
                            )),
                        }
                    } else if st.phase == Phase::Done {
                        match st.filter.take() {
                            Some(filter) => Outcome::Success(Box::new(filter), Bytes::new()),
                            None => Outcome::Failure(DriftStreamError::Internal(
                                "handshake finished without a filter".into(),
                            )),
                        }
                    } else if progress {
                        Outcome::Pending
                    } else {
                        return false;
                    }
                }
                Err(e) => {
                    st.phase = Phase::Done;
                    Outcome::Failure(e)
                }
            }
        };
        self.finish(outcome);
        true
    }

    fn step(&self, st: &mut TaskState) -> Result<bool> {
        let mut progress = self.flush(st)?;

        if st.phase == Phase::Start {
            let pad = rand::thread_rng().gen_range(self.padding.clone());
            let hello = st.initiator.create_hello(pad)?;
            st.outbound.extend_from_slice(&hello.encode());
            st.phase = Phase::AwaitHello;
            progress |= self.flush(st)?;
            trace!(len = hello.encoded_len(), "hello queued");
        }

        loop {
            let need = match st.phase {
                Phase::AwaitHello if st.inbound.len() < HELLO_PREFIX_LEN => HELLO_PREFIX_LEN,
                Phase::AwaitHello => Hello::total_len(&st.inbound)?,
                Phase::AwaitConfirm => CONFIRM_LEN,
                _ => break,
            };
            if st.inbound.len() < need {
                let mut buf = vec![0u8; need - st.inbound.len()];
                let n = self.transport.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                st.inbound.extend_from_slice(&buf[..n]);
                progress = true;
                continue;
            }

            if st.phase == Phase::AwaitHello {
                self.on_hello(st)?;
            } else {
                self.on_confirm(st)?;
            }
            progress = true;
            self.flush(st)?;
        }
        Ok(progress)
    }

    fn on_hello(&self, st: &mut TaskState) -> Result<()> {
        let (hello, used) = Hello::decode(&st.inbound)?;
        st.inbound.advance(used);

        if self.incoming {
            let pad = rand::thread_rng().gen_range(self.padding.clone());
            let (reply, secret) = st.responder.process_hello(&hello, pad)?;
            self.listener.got_secret(&secret.secret);
            st.filter = Some(filter_for(&secret, true)?);
            st.outbound.extend_from_slice(&reply.encode());
            st.phase = Phase::AwaitConfirm;
            debug!("handshake hello answered");
        } else {
            let secret = st.initiator.process_reply(&hello)?;
            self.listener.got_secret(&secret.secret);
            let mut filter = filter_for(&secret, false)?;
            let mut confirm = [0u8; CONFIRM_LEN];
            filter.encrypt(&mut confirm);
            st.outbound.extend_from_slice(&confirm);
            st.filter = Some(filter);
            st.phase = Phase::Flushing;
            debug!("handshake reply processed");
        }
        Ok(())
    }

    fn on_confirm(&self, st: &mut TaskState) -> Result<()> {
        let mut confirm = [0u8; CONFIRM_LEN];
        confirm.copy_from_slice(&st.inbound[..CONFIRM_LEN]);
        st.inbound.advance(CONFIRM_LEN);

        let filter = st
            .filter
            .as_mut()
            .ok_or_else(|| DriftStreamError::Handshake("confirmation before hello".into()))?;
        filter.decrypt(&mut confirm);
        if confirm != [0u8; CONFIRM_LEN] {
            return Err(DriftStreamError::Handshake(
                "verification constant mismatch".into(),
            ));
        }
        st.phase = Phase::Done;
        Ok(())
    }

    fn flush(&self, st: &mut TaskState) -> Result<bool> {
        let mut progress = false;
        while !st.outbound.is_empty() {
            let n = self.transport.write(&[&st.outbound[..]])?;
            if n == 0 {
                break;
            }
            st.outbound.advance(n);
            progress = true;
        }
        Ok(progress)
    }

    fn finish(&self, outcome: Outcome) {
        match outcome {
            Outcome::Pending => {}
            Outcome::Success(filter, remaining) => {
                self.transport.cancel_read_selects();
                self.transport.cancel_write_selects();
                debug!(incoming = self.incoming, "handshake complete");
                self.listener.handshake_success(filter, remaining);
            }
            Outcome::Failure(error) => {
                self.transport.cancel_read_selects();
                self.transport.cancel_write_selects();
                debug!(incoming = self.incoming, %error, "handshake failed");
                self.listener.handshake_failure(error);
            }
        }
    }
}

fn filter_for(secret: &SessionSecret, incoming: bool) -> Result<Rc4Filter> {
    if incoming {
        Rc4Filter::new(&secret.responder_payload_key, &secret.initiator_payload_key)
    } else {
        Rc4Filter::new(&secret.initiator_payload_key, &secret.responder_payload_key)
    }
}

impl SelectListener for HandshakeTask {
    fn selected(&self) -> bool {
        self.drive()
    }

    fn select_failure(&self, error: &DriftStreamError) {
        let first = {
            let mut st = self.state.lock();
            let first = st.phase != Phase::Done;
            st.phase = Phase::Done;
            first
        };
        if first {
            self.finish(Outcome::Failure(DriftStreamError::Handshake(
                error.to_string(),
            )));
        }
    }
}
