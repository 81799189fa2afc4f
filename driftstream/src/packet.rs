use std::fmt;

use bytes::{Bytes, BytesMut};

use crate::frame::{splice_alternate, Command};

/// An outbound frame awaiting acknowledgement.
///
/// The frame bytes are immutable once built except for the alternate echo
/// in the cleartext prefix, which is refreshed on every (re)send.
#[derive(Debug)]
pub struct Packet {
    id: u64,
    /// Real sequence number; `None` for crypto frames.
    seq: Option<u32>,
    /// Alternate the peer echoes when it has this frame in order.
    alt: Option<u32>,
    command: Command,
    connection_id: i32,
    frame: BytesMut,
    auto_retransmit: bool,
    /// Receiver's in-order count at the time the frame was built.
    unack_in_sequence: u64,
    send_count: u32,
    resend_count: u32,
    last_send_tick: u64,
    received: bool,
}

impl Packet {
    pub fn new(
        id: u64,
        seq: Option<u32>,
        alt: Option<u32>,
        command: Command,
        connection_id: i32,
        frame: BytesMut,
        unack_in_sequence: u64,
    ) -> Self {
        Self {
            id,
            seq,
            alt,
            command,
            connection_id,
            frame,
            auto_retransmit: true,
            unack_in_sequence,
            send_count: 0,
            resend_count: 0,
            last_send_tick: 0,
            received: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn seq(&self) -> Option<u32> {
        self.seq
    }

    pub fn alt(&self) -> Option<u32> {
        self.alt
    }

    /// Assign the alternate of a crypto frame once header keys are known.
    pub(crate) fn set_alt(&mut self, alt: u32) {
        self.alt = Some(alt);
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn connection_id(&self) -> i32 {
        self.connection_id
    }

    pub fn len(&self) -> usize {
        self.frame.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frame.is_empty()
    }

    pub fn auto_retransmit(&self) -> bool {
        self.auto_retransmit
    }

    pub fn set_auto_retransmit(&mut self, auto: bool) {
        self.auto_retransmit = auto;
    }

    pub fn unack_in_sequence(&self) -> u64 {
        self.unack_in_sequence
    }

    pub fn send_count(&self) -> u32 {
        self.send_count
    }

    pub fn resend_count(&self) -> u32 {
        self.resend_count
    }

    pub fn has_been_received(&self) -> bool {
        self.received
    }

    pub fn set_received(&mut self) {
        self.received = true;
    }

    pub fn ticks_since_send(&self, now_tick: u64) -> u64 {
        now_tick.saturating_sub(self.last_send_tick)
    }

    /// Count a resend attempt. Called before the frame goes out again.
    pub fn resent(&mut self) {
        self.resend_count += 1;
    }

    /// Stamp a send at `tick`, refresh the alternate echo and return the
    /// datagram. Crypto frames carry raw handshake bytes and are never spliced.
    pub fn sent(&mut self, tick: u64, echo: u32) -> Bytes {
        self.send_count += 1;
        self.last_send_tick = tick;
        if self.command != Command::Crypto {
            splice_alternate(&mut self.frame, echo);
        }
        Bytes::copy_from_slice(&self.frame)
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[conn={},len={},sent={},resent={}",
            self.command,
            self.connection_id,
            self.frame.len(),
            self.send_count,
            self.resend_count
        )?;
        if let Some(seq) = self.seq {
            write!(f, ",seq={seq:08x}")?;
        }
        if self.received {
            f.write_str(",received")?;
        }
        if !self.auto_retransmit {
            f.write_str(",lazy")?;
        }
        f.write_str("]")
    }
}
