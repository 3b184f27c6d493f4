use std::collections::VecDeque;

use bytes::Bytes;

use crate::icy::EMPTY_BLOCK;

#[derive(Debug, Clone)]
struct Mark {
    position: u64,
    block: Bytes,
}

/// Track-change metadata blocks stamped at absolute stream positions.
///
/// Readers that want metadata emit one block after every `interval` bytes of
/// audio, at absolute positions that are multiples of `interval`. A mark
/// takes effect at the first boundary after its position and stays current
/// until a later mark takes effect, so readers joining mid-track still get
/// the title. Boundaries before the first mark carry the empty block.
#[derive(Debug)]
pub(crate) struct MetadataMarks {
    interval: u64,
    marks: VecDeque<Mark>,
}

impl MetadataMarks {
    pub(crate) fn new(interval: usize) -> Self {
        Self {
            interval: interval as u64,
            marks: VecDeque::new(),
        }
    }

    pub(crate) const fn interval(&self) -> u64 {
        self.interval
    }

    /// Interval boundary at which a mark at `position` is emitted.
    pub(crate) const fn boundary_after(&self, position: u64) -> u64 {
        (position / self.interval + 1) * self.interval
    }

    pub(crate) fn push(&mut self, position: u64, block: Bytes) {
        self.marks.push_back(Mark { position, block });
    }

    pub(crate) fn block_for(&self, boundary: u64) -> &[u8] {
        self.marks
            .iter()
            .rev()
            .find(|mark| self.boundary_after(mark.position) <= boundary)
            .map_or(EMPTY_BLOCK, |mark| &mark.block[..])
    }

    /// Drop marks superseded at every boundary a reader at or after `oldest`
    /// can still reach. The newest mark is always kept.
    pub(crate) fn prune(&mut self, oldest: u64) {
        let first_reachable = self.boundary_after(oldest);
        while self
            .marks
            .get(1)
            .is_some_and(|next| self.boundary_after(next.position) <= first_reachable)
        {
            self.marks.pop_front();
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.marks.len()
    }
}
