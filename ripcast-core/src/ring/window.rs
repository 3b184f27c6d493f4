use std::ops::Range;

use crate::error::{RingBufferError, Result};

/// Snapshot of the ring buffer's index state.
///
/// All position arithmetic lives here as plain functions over a copy of the
/// state, so it can be tested without a buffer or a lock. `base` is always
/// congruent to the oldest retained absolute position modulo `capacity`,
/// which lets an absolute position map straight to a physical index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    capacity: usize,
    base: usize,
    count: usize,
    write_pos: u64,
}

impl Window {
    #[must_use]
    pub const fn new(capacity: usize) -> Self {
        Self {
            capacity,
            base: 0,
            count: 0,
            write_pos: 0,
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub const fn base(&self) -> usize {
        self.base
    }

    #[must_use]
    pub const fn count(&self) -> usize {
        self.count
    }

    /// Absolute write position `W`.
    #[must_use]
    pub const fn write_pos(&self) -> u64 {
        self.write_pos
    }

    /// Absolute position of the oldest retained byte, `W - count`.
    #[must_use]
    pub const fn oldest(&self) -> u64 {
        self.write_pos - self.count as u64
    }

    #[must_use]
    pub const fn free(&self) -> usize {
        self.capacity - self.count
    }

    /// Physical index the next insert writes to.
    #[must_use]
    pub const fn write_index(&self) -> usize {
        (self.base + self.count) % self.capacity
    }

    /// Contiguous free bytes between the write index and the physical end.
    #[must_use]
    pub fn free_tail(&self) -> usize {
        (self.capacity - self.write_index()).min(self.free())
    }

    /// Physical index of `offset` bytes past the oldest retained byte.
    #[must_use]
    pub const fn offset_index(&self, offset: usize) -> usize {
        (self.base + offset % self.capacity) % self.capacity
    }

    /// Physical index of an absolute stream position.
    #[must_use]
    pub const fn physical(&self, pos: u64) -> usize {
        (pos % self.capacity as u64) as usize
    }

    #[must_use]
    pub const fn contains(&self, pos: u64) -> bool {
        pos >= self.oldest() && pos <= self.write_pos
    }

    /// Split a copy of `len` bytes starting at physical `index` into the
    /// run up to the physical end and the wrapped remainder.
    #[must_use]
    pub fn split(&self, index: usize, len: usize) -> (Range<usize>, Range<usize>) {
        let first_len = len.min(self.capacity - index);
        (index..index + first_len, 0..len - first_len)
    }

    /// Bytes a reader at `cursor` may take, capped at `max_len`.
    pub fn readable_from(&self, cursor: u64, max_len: usize) -> Result<usize> {
        if cursor > self.write_pos {
            return Err(RingBufferError::invalid(format!(
                "cursor {cursor} is ahead of write position {}",
                self.write_pos
            )));
        }
        if cursor < self.oldest() {
            return Err(RingBufferError::Overrun {
                cursor,
                oldest: self.oldest(),
            });
        }
        let behind = self.write_pos - cursor;
        let avail = usize::try_from(behind).map_or(max_len, |behind| behind.min(max_len));
        if avail == 0 {
            return Err(RingBufferError::BufferEmpty {
                requested: max_len,
                available: 0,
            });
        }
        Ok(avail)
    }

    pub(crate) fn advance_write(&mut self, len: usize) {
        debug_assert!(len <= self.free());
        self.count += len;
        self.write_pos += len as u64;
    }

    pub(crate) fn retire(&mut self, len: usize) {
        debug_assert!(len <= self.count);
        self.base = (self.base + len) % self.capacity;
        self.count -= len;
    }
}
