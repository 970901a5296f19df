//! Bounded replay ring for reconnecting subscribers.
//!
//! Keeps the most recent output bytes so a client that attaches late can
//! reconstruct terminal state. Truncation is by whole bytes with no escape
//! sequence awareness; a snapshot may start mid-sequence and the consuming
//! terminal emulator is expected to cope.

use std::collections::VecDeque;

/// Default ring capacity: enough for a screen plus recent scrollback.
pub const DEFAULT_REPLAY_CAPACITY: usize = 100 * 1024;

/// A bounded byte ring. On overflow the oldest prefix is dropped.
#[derive(Debug)]
pub struct ReplayRing {
    buf: VecDeque<u8>,
    cap: usize,
}

impl ReplayRing {
    pub fn new(cap: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(cap.min(DEFAULT_REPLAY_CAPACITY)),
            cap,
        }
    }

    /// Append bytes, discarding the oldest to stay within capacity.
    pub fn push(&mut self, data: &[u8]) {
        if self.cap == 0 {
            return;
        }
        if data.len() >= self.cap {
            self.buf.clear();
            self.buf.extend(&data[data.len() - self.cap..]);
            return;
        }
        let overflow = (self.buf.len() + data.len()).saturating_sub(self.cap);
        if overflow > 0 {
            self.buf.drain(..overflow);
        }
        self.buf.extend(data);
    }

    /// Point-in-time copy of the buffered bytes, oldest first.
    pub fn snapshot(&self) -> Vec<u8> {
        self.buf.iter().copied().collect()
    }

    /// The last `max` bytes (or fewer, if less is buffered).
    pub fn tail(&self, max: usize) -> Vec<u8> {
        let skip = self.buf.len().saturating_sub(max);
        self.buf.iter().skip(skip).copied().collect()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
