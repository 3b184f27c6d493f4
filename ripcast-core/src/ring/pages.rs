use std::collections::VecDeque;

use bytes::Bytes;

use crate::ogg::{PageFlags, PageSpan};

/// A page recorded in the buffer, addressed by absolute stream position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageBoundary {
    pub start: u64,
    pub len: usize,
    pub flags: PageFlags,
    pub stream_header: bool,
    pub headers: Option<Bytes>,
}

impl PageBoundary {
    pub(crate) fn from_span(chunk_start: u64, span: &PageSpan) -> Self {
        Self {
            start: chunk_start + span.offset as u64,
            len: span.len,
            flags: span.flags,
            stream_header: span.stream_header,
            headers: span.headers.clone(),
        }
    }

    #[must_use]
    pub const fn end(&self) -> u64 {
        self.start + self.len as u64
    }

    /// Whether a relay reader may begin its stream at this page.
    #[must_use]
    pub const fn is_relay_start(&self) -> bool {
        !self.flags.is_continuation() && !self.stream_header
    }
}

#[derive(Debug, Default)]
pub(crate) struct PageList {
    pages: VecDeque<PageBoundary>,
}

impl PageList {
    pub(crate) fn push(&mut self, page: PageBoundary) {
        self.pages.push_back(page);
    }

    /// Drop every page that ends at or before `oldest`.
    pub(crate) fn prune(&mut self, oldest: u64) -> usize {
        let mut pruned = 0;
        while self.pages.front().is_some_and(|page| page.end() <= oldest) {
            self.pages.pop_front();
            pruned += 1;
        }
        pruned
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// First page start at or after `pos`.
    pub(crate) fn next_start_at_or_after(&self, pos: u64) -> Option<u64> {
        self.pages
            .iter()
            .map(|page| page.start)
            .find(|&start| start >= pos)
    }

    /// Choose where a relay reader starts: the latest eligible page at or
    /// before `target`, else the earliest eligible page.
    pub(crate) fn relay_start(&self, oldest: u64, target: u64) -> Option<&PageBoundary> {
        let mut eligible = self
            .pages
            .iter()
            .filter(|page| page.start >= oldest && page.is_relay_start());
        let first = eligible.next()?;
        let mut chosen = first;
        for page in eligible {
            if page.start > target {
                break;
            }
            chosen = page;
        }
        Some(chosen)
    }

    pub(crate) fn snapshot(&self) -> Vec<PageBoundary> {
        self.pages.iter().cloned().collect()
    }
}
