//! Sequence numbers and the outstanding-request table
//!
//! Every frame the controller sends carries an 8-bit sequence number. Frames
//! that expect an answer are remembered in [`Outstanding`] until the board
//! acknowledges them. `0xFF` is reserved as "no acknowledgment" and is never
//! handed out, and neither is a value that is still outstanding.

use crate::frame::NO_ACK;

/// Wrapping sequence number generator
#[derive(Debug, Clone, Default)]
pub struct SequenceCounter {
    next: u8,
}

impl SequenceCounter {
    /// Start counting at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Start counting at `seq`
    pub fn starting_at(seq: u8) -> Self {
        Self { next: seq }
    }

    /// Hand out the next free sequence number
    ///
    /// `in_use` reports values that must be skipped. If every value is in
    /// use the plain successor is returned anyway.
    pub fn next(&mut self, in_use: impl Fn(u8) -> bool) -> u8 {
        let mut fallback = None;
        for _ in 0..=u8::MAX {
            let candidate = self.next;
            self.next = self.next.wrapping_add(1);
            if candidate == NO_ACK {
                continue;
            }
            fallback.get_or_insert(candidate);
            if !in_use(candidate) {
                return candidate;
            }
        }
        fallback.unwrap_or(0)
    }
}

/// Requests awaiting an acknowledgment, keyed by sequence number
#[derive(Debug)]
pub struct Outstanding<T> {
    entries: Vec<(u8, T)>,
}

impl<T> Default for Outstanding<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Outstanding<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Remember a request. A stale entry with the same sequence is replaced.
    pub fn insert(&mut self, seq: u8, value: T) {
        self.entries.retain(|(s, _)| *s != seq);
        self.entries.push((seq, value));
    }

    /// Remove and return the entry acknowledged by `ack`
    ///
    /// A second acknowledgment for the same sequence finds nothing.
    pub fn resolve(&mut self, ack: u8) -> Option<T> {
        let index = self.entries.iter().position(|(s, _)| *s == ack)?;
        Some(self.entries.remove(index).1)
    }

    pub fn contains(&self, seq: u8) -> bool {
        self.entries.iter().any(|(s, _)| *s == seq)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget every entry, returning how many were dropped
    pub fn clear(&mut self) -> usize {
        let dropped = self.entries.len();
        self.entries.clear();
        dropped
    }
}
