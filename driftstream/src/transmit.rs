//! Queue of sent-but-unacknowledged frames, oldest first.
//!
//! Frames leave the queue only through the implicit acknowledgement: when
//! the peer echoes a frame's alternate, that frame and everything older is
//! dropped. Explicit ACKs merely mark entries received.

use std::collections::VecDeque;

use crate::frame::Command;
use crate::packet::Packet;

/// Entries queued by one explicit ACK for immediate resend, at most.
pub const MAX_ACK_RESENDS: usize = 3;

#[derive(Debug, Default)]
pub struct TransmitQueue {
    packets: VecDeque<Packet>,
    next_id: u64,
}

impl TransmitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Identifier for the next packet built.
    pub fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn push(&mut self, packet: Packet) {
        self.packets.push_back(packet);
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn get(&self, id: u64) -> Option<&Packet> {
        self.packets.iter().find(|p| p.id() == id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Packet> {
        self.packets.iter_mut().find(|p| p.id() == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Packet> {
        self.packets.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Packet> {
        self.packets.iter_mut()
    }

    /// First queued packet carrying `command`.
    pub fn find_command(&self, command: Command) -> Option<u64> {
        self.packets
            .iter()
            .find(|p| p.command() == command)
            .map(Packet::id)
    }

    /// The packet the retransmit timer should be guarding.
    ///
    /// The oldest unreceived packet that auto-retransmits, or that is not
    /// the newest entry (a lazy frame followed by newer traffic has
    /// evidently been overtaken).
    pub fn retransmit_target(&self) -> Option<u64> {
        let last = self.packets.len().checked_sub(1)?;
        self.packets
            .iter()
            .enumerate()
            .find(|(i, p)| !p.has_been_received() && (p.auto_retransmit() || *i != last))
            .map(|(_, p)| p.id())
    }

    /// The peer has everything up to and including the packet whose
    /// alternate is `alt`. Drops that prefix and returns the real sequence
    /// of the matched packet, if any matched.
    pub fn acknowledge_through(&mut self, alt: Option<u32>) -> Option<Option<u32>> {
        let idx = self.packets.iter().position(|p| p.alt() == alt)?;
        let seq = self.packets[idx].seq();
        self.packets.drain(..=idx);
        Some(seq)
    }

    /// Apply one explicit ACK.
    ///
    /// Every listed sequence is marked received. Unreceived packets older
    /// than a listed one that were last sent at least `min_ticks` ago are
    /// returned (oldest first, at most [`MAX_ACK_RESENDS`]) for immediate
    /// resend. The scan resumes where the previous listed sequence matched.
    pub fn apply_ack(&mut self, listed: &[u32], now_tick: u64, min_ticks: u64) -> Vec<u64> {
        let mut resend = Vec::new();
        let mut pos = 0;

        for &seq in listed {
            if resend.len() >= MAX_ACK_RESENDS {
                break;
            }
            let mut candidates = Vec::new();
            while pos < self.packets.len() {
                let p = &mut self.packets[pos];
                pos += 1;
                if p.seq() == Some(seq) {
                    p.set_received();
                    for id in candidates.drain(..) {
                        if resend.len() < MAX_ACK_RESENDS {
                            resend.push(id);
                        }
                    }
                    break;
                }
                if !p.has_been_received() && p.ticks_since_send(now_tick) >= min_ticks {
                    candidates.push(p.id());
                }
            }
        }
        resend
    }

    /// The sole queued packet, if it is a lazy (non auto-retransmit) frame
    /// last sent at least `min_ticks` ago.
    pub fn stale_lazy_sole(&self, now_tick: u64, min_ticks: u64) -> Option<u64> {
        match self.packets.front() {
            Some(p)
                if self.packets.len() == 1
                    && !p.auto_retransmit()
                    && p.ticks_since_send(now_tick) >= min_ticks =>
            {
                Some(p.id())
            }
            _ => None,
        }
    }
}
