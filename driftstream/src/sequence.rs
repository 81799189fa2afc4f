//! Sequence-tuple generation.
//!
//! Every framed datagram starts with a tuple `(A, seq, C)` drawn from a keyed
//! source that both ends derive from the shared secret, plus an `alt` value
//! the peer later echoes back as an implicit acknowledgement. `A` and `C`
//! always have a bit set under [`RESERVED_MASK`], which is what keeps our
//! datagrams apart from the legacy protocol sharing the port.

use std::collections::VecDeque;

use drifttrust::SequenceSource;

use crate::error::{DriftStreamError, Result};

/// At least one of these bits is set in `A` and `C`.
pub const RESERVED_MASK: u32 = 0xffff_f800;

/// Number of recent sequence / alternate values remembered for collision and
/// replay checks.
pub const MAX_SEQ_MEMORY: usize = 64;

/// Rejections in a row after which the source is considered broken.
const MAX_REJECTIONS: usize = 1024;

/// One generated sequence tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SeqTuple {
    pub a: u32,
    pub seq: u32,
    pub c: u32,
    pub alt: u32,
}

impl SeqTuple {
    /// Whether the tuple satisfies the wire constraints.
    pub fn is_well_formed(&self) -> bool {
        self.a & RESERVED_MASK != 0
            && self.c & RESERVED_MASK != 0
            && self.seq != u32::MAX
            && self.alt & 0xffff_0000 != 0
            && self.alt & 0x0000_ffff != 0
    }
}

/// Bounded FIFO memory with a fixed capacity.
#[derive(Debug, Clone)]
struct Memory {
    values: VecDeque<u32>,
}

impl Memory {
    fn new() -> Self {
        Self {
            values: VecDeque::with_capacity(MAX_SEQ_MEMORY),
        }
    }

    fn contains(&self, value: u32) -> bool {
        self.values.contains(&value)
    }

    fn remember(&mut self, value: u32) {
        if self.values.len() == MAX_SEQ_MEMORY {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }
}

/// Produces the tuple stream for one direction of a session.
pub struct SequenceGenerator {
    source: Box<dyn SequenceSource>,
    seq_memory: Memory,
    alt_memory: Memory,
}

impl SequenceGenerator {
    pub fn new(source: Box<dyn SequenceSource>) -> Self {
        Self {
            source,
            seq_memory: Memory::new(),
            alt_memory: Memory::new(),
        }
    }

    /// Draw the next tuple, skipping malformed draws and recent collisions.
    pub fn next_tuple(&mut self) -> Result<SeqTuple> {
        for _ in 0..MAX_REJECTIONS {
            let tuple = SeqTuple {
                a: self.source.next_u32(),
                seq: self.source.next_u32(),
                c: self.source.next_u32(),
                alt: self.source.next_u32(),
            };

            if !tuple.is_well_formed()
                || self.seq_memory.contains(tuple.seq)
                || self.alt_memory.contains(tuple.alt)
            {
                continue;
            }

            self.seq_memory.remember(tuple.seq);
            self.alt_memory.remember(tuple.alt);
            return Ok(tuple);
        }
        Err(DriftStreamError::Internal(
            "sequence source produced no usable tuple".into(),
        ))
    }

    /// Whether `alt` is one of the recently generated alternates.
    pub fn is_valid_alternate(&self, alt: u32) -> bool {
        self.alt_memory.contains(alt)
    }
}

impl std::fmt::Debug for SequenceGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceGenerator")
            .field("remembered", &self.seq_memory.values.len())
            .finish()
    }
}
