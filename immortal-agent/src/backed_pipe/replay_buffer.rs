//! Bounded history of local->remote bytes, addressed by sequence number.

use std::collections::VecDeque;

/// Default replay window (64 KiB)
pub const DEFAULT_REPLAY_BUFFER_SIZE: usize = 64 * 1024;

/// Ring of the newest `capacity` bytes written to the pipe.
///
/// Sequence numbers count bytes, not writes: the byte at sequence `s` is
/// the `s`-th byte ever pushed (zero based). Older bytes fall off the front.
pub struct ReplayBuffer {
    buf: VecDeque<u8>,
    capacity: usize,
    /// Sequence number one past the newest byte
    end_seq: u64,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
            end_seq: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total bytes ever pushed
    pub fn end_seq(&self) -> u64 {
        self.end_seq
    }

    /// Sequence number of the oldest byte still held
    pub fn start_seq(&self) -> u64 {
        self.end_seq - self.buf.len() as u64
    }

    pub fn push(&mut self, data: &[u8]) {
        self.end_seq += data.len() as u64;

        // Only the tail of an oversized write can survive anyway
        let data = if data.len() > self.capacity {
            &data[data.len() - self.capacity..]
        } else {
            data
        };

        let overflow = (self.buf.len() + data.len()).saturating_sub(self.capacity);
        self.buf.drain(..overflow);
        self.buf.extend(data);
    }

    /// Bytes from `seq` to the end, clamped to what is still held.
    ///
    /// Returns the sequence number the returned bytes actually start at,
    /// which is later than `seq` when the requested history was dropped.
    pub fn since(&self, seq: u64) -> (u64, Vec<u8>) {
        let start = seq.clamp(self.start_seq(), self.end_seq);
        let skip = (start - self.start_seq()) as usize;
        (start, self.buf.iter().skip(skip).copied().collect())
    }
}
