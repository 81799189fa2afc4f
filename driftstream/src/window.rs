//! Receive window: duplicate ring and out-of-order slots.
//!
//! Because both ends derive the same tuple stream, the receiver knows which
//! sequence numbers to expect next. A frame that is not the next expected
//! one reserves slots for every tuple in between; the slots fill as the
//! missing frames arrive and drain from the front in order.

use std::collections::VecDeque;

use bytes::BytesMut;

use crate::error::Result;
use crate::sequence::SequenceGenerator;

/// Recently processed sequence numbers remembered for duplicate detection.
pub const DONE_RING_SIZE: usize = 128;

/// Out-of-order slots held at most.
pub const MAX_OUT_OF_ORDER: usize = 64;

/// Ring of the most recently processed sequence numbers.
#[derive(Debug, Clone)]
pub struct DoneRing {
    seqs: VecDeque<u32>,
}

impl DoneRing {
    pub fn new() -> Self {
        Self {
            seqs: VecDeque::with_capacity(DONE_RING_SIZE),
        }
    }

    pub fn contains(&self, seq: u32) -> bool {
        self.seqs.contains(&seq)
    }

    pub fn insert(&mut self, seq: u32) {
        if self.seqs.len() == DONE_RING_SIZE {
            self.seqs.pop_front();
        }
        self.seqs.push_back(seq);
    }
}

impl Default for DoneRing {
    fn default() -> Self {
        Self::new()
    }
}

/// An expected frame, filled once it arrives.
#[derive(Debug)]
pub struct Slot {
    pub seq: u32,
    pub alt: u32,
    pub frame: Option<BytesMut>,
}

/// Outcome of offering a frame to the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Stored in its slot.
    Stored,
    /// Its slot was already filled.
    Duplicate,
    /// Not found within [`MAX_OUT_OF_ORDER`] expected tuples.
    Overflow,
}

/// Receive-side sequencing state for one connection set.
#[derive(Debug)]
pub struct ReceiveWindow {
    done: DoneRing,
    slots: VecDeque<Slot>,
    last_in_order_seq: Option<u32>,
    last_in_order_alt: Option<u32>,
}

impl ReceiveWindow {
    pub fn new() -> Self {
        Self {
            done: DoneRing::new(),
            slots: VecDeque::new(),
            last_in_order_seq: None,
            last_in_order_alt: None,
        }
    }

    pub fn is_done(&self, seq: u32) -> bool {
        self.done.contains(seq)
    }

    pub fn mark_done(&mut self, seq: u32) {
        self.done.insert(seq);
    }

    pub fn last_in_order_seq(&self) -> Option<u32> {
        self.last_in_order_seq
    }

    /// Alternate echoed to the peer on every send.
    pub fn last_in_order_alt(&self) -> Option<u32> {
        self.last_in_order_alt
    }

    /// Seed the echo with the alternate of the skipped initial tuple.
    pub fn set_initial_alt(&mut self, alt: u32) {
        self.last_in_order_alt = Some(alt);
    }

    pub fn pending_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn has_pending(&self) -> bool {
        !self.slots.is_empty()
    }

    /// Whether `seq` is waiting in a filled slot.
    pub fn is_buffered(&self, seq: u32) -> bool {
        self.slots.iter().any(|s| s.seq == seq && s.frame.is_some())
    }

    /// Offer a frame with real sequence `seq`. New slots are drawn from
    /// `generator` until `seq` turns up or the slot bound is reached.
    pub fn place(
        &mut self,
        seq: u32,
        frame: BytesMut,
        generator: &mut SequenceGenerator,
    ) -> Result<Placement> {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.seq == seq) {
            if slot.frame.is_some() {
                return Ok(Placement::Duplicate);
            }
            slot.frame = Some(frame);
            return Ok(Placement::Stored);
        }

        while self.slots.len() < MAX_OUT_OF_ORDER {
            let tuple = generator.next_tuple()?;
            if tuple.seq == seq {
                self.slots.push_back(Slot {
                    seq,
                    alt: tuple.alt,
                    frame: Some(frame),
                });
                return Ok(Placement::Stored);
            }
            self.slots.push_back(Slot {
                seq: tuple.seq,
                alt: tuple.alt,
                frame: None,
            });
        }
        Ok(Placement::Overflow)
    }

    /// Pop the front slot if it is filled, advancing the in-order position.
    pub fn pop_ready(&mut self) -> Option<(u32, BytesMut)> {
        if self.slots.front().map_or(true, |s| s.frame.is_none()) {
            return None;
        }
        let slot = self.slots.pop_front()?;
        self.last_in_order_seq = Some(slot.seq);
        self.last_in_order_alt = Some(slot.alt);
        self.done.insert(slot.seq);
        let seq = slot.seq;
        slot.frame.map(|f| (seq, f))
    }

    /// Sequence numbers of filled out-of-order slots, oldest first.
    pub fn filled_sequences(&self, limit: usize) -> Vec<u32> {
        self.slots
            .iter()
            .filter(|s| s.frame.is_some())
            .map(|s| s.seq)
            .take(limit)
            .collect()
    }
}

impl Default for ReceiveWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drifttrust::CounterSource;

    fn generators() -> (SequenceGenerator, SequenceGenerator) {
        (
            SequenceGenerator::new(Box::new(CounterSource::new(0x2000_2000))),
            SequenceGenerator::new(Box::new(CounterSource::new(0x2000_2000))),
        )
    }

    fn frame(tag: u8) -> BytesMut {
        BytesMut::from(&[tag][..])
    }

    #[test]
    fn in_order_frames_drain_immediately() {
        let (mut sender, mut receiver) = generators();
        let mut w = ReceiveWindow::new();
        for tag in 0..3u8 {
            let t = sender.next_tuple().unwrap();
            assert_eq!(w.place(t.seq, frame(tag), &mut receiver).unwrap(), Placement::Stored);
            let (seq, f) = w.pop_ready().unwrap();
            assert_eq!(seq, t.seq);
            assert_eq!(f[0], tag);
            assert_eq!(w.last_in_order_alt(), Some(t.alt));
        }
        assert!(!w.has_pending());
    }

    #[test]
    fn reordered_frames_drain_in_send_order() {
        let (mut sender, mut receiver) = generators();
        let tuples: Vec<_> = (0..4).map(|_| sender.next_tuple().unwrap()).collect();
        let mut w = ReceiveWindow::new();

        for &i in &[2usize, 3, 1] {
            w.place(tuples[i].seq, frame(i as u8), &mut receiver).unwrap();
            assert!(w.pop_ready().is_none());
        }
        assert_eq!(w.filled_sequences(3), vec![tuples[1].seq, tuples[2].seq, tuples[3].seq]);

        w.place(tuples[0].seq, frame(0), &mut receiver).unwrap();
        let order: Vec<u8> = std::iter::from_fn(|| w.pop_ready()).map(|(_, f)| f[0]).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
        assert!(w.is_done(tuples[3].seq));
    }

    #[test]
    fn duplicate_slot_reported() {
        let (mut sender, mut receiver) = generators();
        sender.next_tuple().unwrap();
        let t = sender.next_tuple().unwrap();
        let mut w = ReceiveWindow::new();
        assert_eq!(w.place(t.seq, frame(1), &mut receiver).unwrap(), Placement::Stored);
        assert_eq!(w.place(t.seq, frame(1), &mut receiver).unwrap(), Placement::Duplicate);
    }

    #[test]
    fn unknown_sequence_overflows() {
        let (_, mut receiver) = generators();
        let mut w = ReceiveWindow::new();
        assert_eq!(
            w.place(0x0BAD_0BAD, frame(0), &mut receiver).unwrap(),
            Placement::Overflow
        );
        assert_eq!(w.pending_slots(), MAX_OUT_OF_ORDER);
    }

    #[test]
    fn done_ring_forgets_oldest() {
        let mut ring = DoneRing::new();
        for seq in 0..=DONE_RING_SIZE as u32 {
            ring.insert(seq);
        }
        assert!(!ring.contains(0));
        assert!(ring.contains(1));
        assert!(ring.contains(DONE_RING_SIZE as u32));
    }
}
