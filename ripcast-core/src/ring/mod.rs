// Fixed-capacity circular byte store for one live stream
//
// One producer inserts chunks; any number of readers copy from their own
// absolute cursor. Index state and auxiliary records (page boundaries,
// metadata marks, the pending track boundary) are only touched under the
// single lock, and every read copies out while holding a consistent view of
// that state, so a concurrent insert can never be observed half-written.
//
// Inserts never overwrite retained bytes. The producer (or the file writer
// on its behalf) retires data with `consume`/`make_room`; a reader that falls
// behind the retained window gets `Overrun` instead of wrong-range data.

mod marks;
mod pages;
mod window;

pub use pages::PageBoundary;
pub use window::Window;

use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::error::{RingBufferError, Result};
use crate::icy::MetadataBlock;
use crate::ogg::PageSpan;
use marks::MetadataMarks;
use pages::PageList;

/// How the buffered bytes are framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentKind {
    /// Byte-oriented content such as MP3 or AAC.
    #[default]
    Opaque,
    /// Ogg content, tracked page by page.
    Paged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingBufferConfig {
    pub chunk_size: usize,
    pub chunk_count: usize,
    pub content_kind: ContentKind,
    /// ICY metadata interval offered to relay readers.
    pub meta_interval: Option<usize>,
}

impl RingBufferConfig {
    #[must_use]
    pub const fn new(chunk_size: usize, chunk_count: usize) -> Self {
        Self {
            chunk_size,
            chunk_count,
            content_kind: ContentKind::Opaque,
            meta_interval: None,
        }
    }

    #[must_use]
    pub const fn with_content_kind(mut self, content_kind: ContentKind) -> Self {
        self.content_kind = content_kind;
        self
    }

    #[must_use]
    pub const fn with_meta_interval(mut self, meta_interval: Option<usize>) -> Self {
        self.meta_interval = meta_interval;
        self
    }
}

/// A track change stamped into the stream by the producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackChange {
    /// Composed metadata text, e.g. `StreamTitle='Artist - Title';`.
    pub content: String,
}

impl TrackChange {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

/// Where a new relay reader begins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderStart {
    pub cursor: u64,
    /// Stream header pages to send before any buffered page.
    pub stream_headers: Option<Bytes>,
}

/// Bytes copied for one reader and the cursor following them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extracted {
    pub data: Bytes,
    pub next_cursor: u64,
}

struct State {
    storage: Box<[u8]>,
    window: Window,
    track_boundary: Option<u64>,
    pages: PageList,
    marks: Option<MetadataMarks>,
}

impl State {
    fn retire(&mut self, len: usize) {
        self.window.retire(len);
        let oldest = self.window.oldest();
        let pruned = self.pages.prune(oldest);
        if let Some(marks) = self.marks.as_mut() {
            marks.prune(oldest);
        }
        if pruned > 0 {
            trace!(pruned, oldest, "Pruned expired page boundaries");
        }
    }

    fn copy_out(&self, index: usize, out: &mut [u8]) {
        let (first, second) = self.window.split(index, out.len());
        let split = first.len();
        out[..split].copy_from_slice(&self.storage[first]);
        out[split..].copy_from_slice(&self.storage[second]);
    }

    fn append_range(&self, pos: u64, len: usize, out: &mut BytesMut) {
        let (first, second) = self.window.split(self.window.physical(pos), len);
        out.extend_from_slice(&self.storage[first]);
        out.extend_from_slice(&self.storage[second]);
    }
}

pub struct RingBuffer {
    state: RwLock<State>,
    chunk_size: usize,
    content_kind: ContentKind,
    meta_interval: Option<usize>,
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("chunk_size", &self.chunk_size)
            .field("content_kind", &self.content_kind)
            .field("meta_interval", &self.meta_interval)
            .field("window", &self.window())
            .finish()
    }
}

impl RingBuffer {
    pub fn new(config: RingBufferConfig) -> Result<Self> {
        if config.chunk_size == 0 || config.chunk_count == 0 {
            return Err(RingBufferError::invalid(
                "chunk size and chunk count must be greater than zero",
            ));
        }
        if config.meta_interval == Some(0) {
            return Err(RingBufferError::invalid(
                "metadata interval must be greater than zero",
            ));
        }
        let capacity = config
            .chunk_size
            .checked_mul(config.chunk_count)
            .ok_or_else(|| RingBufferError::invalid("buffer capacity overflows"))?;
        if let Some(interval) = config.meta_interval.filter(|&interval| interval > capacity) {
            return Err(RingBufferError::invalid(format!(
                "metadata interval {interval} exceeds buffer capacity {capacity}"
            )));
        }

        debug!(
            capacity,
            chunk_size = config.chunk_size,
            content_kind = ?config.content_kind,
            meta_interval = ?config.meta_interval,
            "Created ring buffer"
        );

        Ok(Self {
            state: RwLock::new(State {
                storage: vec![0u8; capacity].into_boxed_slice(),
                window: Window::new(capacity),
                track_boundary: None,
                pages: PageList::default(),
                marks: config.meta_interval.map(MetadataMarks::new),
            }),
            chunk_size: config.chunk_size,
            content_kind: config.content_kind,
            meta_interval: config.meta_interval,
        })
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.state.read().window.capacity()
    }

    #[must_use]
    pub const fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    #[must_use]
    pub const fn content_kind(&self) -> ContentKind {
        self.content_kind
    }

    #[must_use]
    pub const fn meta_interval(&self) -> Option<usize> {
        self.meta_interval
    }

    /// Consistent snapshot of the index state.
    #[must_use]
    pub fn window(&self) -> Window {
        self.state.read().window
    }

    /// Bytes currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().window.count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn free_space(&self) -> usize {
        self.state.read().window.free()
    }

    #[must_use]
    pub fn free_tail_space(&self) -> usize {
        self.state.read().window.free_tail()
    }

    #[must_use]
    pub fn write_index(&self) -> usize {
        self.state.read().window.write_index()
    }

    #[must_use]
    pub fn absolute_write_position(&self) -> u64 {
        self.state.read().window.write_pos()
    }

    #[must_use]
    pub fn oldest_position(&self) -> u64 {
        self.state.read().window.oldest()
    }

    /// Append `data` at the write position.
    ///
    /// Fails without writing anything if `data` does not fit in the free
    /// space. `pages` describes Ogg pages starting inside `data` and is only
    /// accepted for paged content. A track change is encoded up front and
    /// stamped at the chunk's start position.
    pub fn insert(
        &self,
        data: &[u8],
        pages: &[PageSpan],
        track: Option<&TrackChange>,
    ) -> Result<()> {
        if !pages.is_empty() && self.content_kind != ContentKind::Paged {
            return Err(RingBufferError::invalid(
                "page boundaries supplied for opaque content",
            ));
        }
        if let Some(span) = pages.iter().find(|span| span.offset >= data.len()) {
            return Err(RingBufferError::invalid(format!(
                "page offset {} outside chunk of {} bytes",
                span.offset,
                data.len()
            )));
        }
        let block = match (track, self.meta_interval) {
            (Some(track), Some(_)) => Some(MetadataBlock::encode(&track.content)?),
            _ => None,
        };

        let mut guard = self.state.write();
        let state = &mut *guard;
        let free = state.window.free();
        if data.len() > free {
            return Err(RingBufferError::BufferFull {
                requested: data.len(),
                free,
            });
        }

        let start = state.window.write_pos();
        let (first, second) = state.window.split(state.window.write_index(), data.len());
        let split = first.len();
        state.storage[first].copy_from_slice(&data[..split]);
        state.storage[second].copy_from_slice(&data[split..]);
        state.window.advance_write(data.len());

        for span in pages {
            state.pages.push(PageBoundary::from_span(start, span));
        }
        if let (Some(block), Some(marks)) = (block, state.marks.as_mut()) {
            debug!(position = start, len = block.len(), "Stamped track change");
            marks.push(start, block.into_bytes());
        }

        trace!(
            len = data.len(),
            pages = pages.len(),
            write_pos = state.window.write_pos(),
            count = state.window.count(),
            "Inserted chunk"
        );
        Ok(())
    }

    /// Copy `out.len()` bytes starting `offset` bytes past the oldest
    /// retained byte, without consuming them.
    pub fn peek(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        let state = self.state.read();
        let count = state.window.count();
        match offset.checked_add(out.len()) {
            Some(end) if end <= count => {}
            _ => {
                return Err(RingBufferError::BufferEmpty {
                    requested: out.len(),
                    available: count.saturating_sub(offset),
                })
            }
        }
        state.copy_out(state.window.offset_index(offset), out);
        Ok(())
    }

    /// Copy `out.len()` bytes starting at absolute stream position `start`.
    pub fn peek_region(&self, start: u64, out: &mut [u8]) -> Result<()> {
        let state = self.state.read();
        let window = state.window;
        let in_window = start >= window.oldest()
            && start
                .checked_add(out.len() as u64)
                .is_some_and(|end| end <= window.write_pos());
        if !in_window {
            return Err(RingBufferError::BufferEmpty {
                requested: out.len(),
                available: usize::try_from(window.write_pos().saturating_sub(start))
                    .unwrap_or(usize::MAX)
                    .min(window.count()),
            });
        }
        state.copy_out(window.physical(start), out);
        Ok(())
    }

    /// Retire the `len` oldest bytes.
    pub fn consume(&self, len: usize) -> Result<()> {
        let mut state = self.state.write();
        let count = state.window.count();
        if len > count {
            return Err(RingBufferError::BufferEmpty {
                requested: len,
                available: count,
            });
        }
        state.retire(len);
        Ok(())
    }

    /// Retire the oldest data until at least `len` bytes are free.
    ///
    /// Paged content is retired a whole page at a time and opaque content a
    /// whole chunk at a time. Returns the number of bytes retired.
    pub fn make_room(&self, len: usize) -> Result<usize> {
        let mut state = self.state.write();
        let window = state.window;
        if len > window.capacity() {
            return Err(RingBufferError::invalid(format!(
                "cannot free {len} bytes in a buffer of {}",
                window.capacity()
            )));
        }
        if window.free() >= len {
            return Ok(0);
        }

        let target = window.oldest() + (len - window.free()) as u64;
        let retire_to = match self.content_kind {
            ContentKind::Paged => state
                .pages
                .next_start_at_or_after(target)
                .filter(|&start| start <= window.write_pos())
                .unwrap_or(target),
            ContentKind::Opaque => {
                let chunk = self.chunk_size as u64;
                (target.div_ceil(chunk) * chunk).min(window.write_pos())
            }
        };
        let retired = (retire_to - window.oldest()) as usize;
        state.retire(retired);
        debug!(retired, oldest = retire_to, "Made room in ring buffer");
        Ok(retired)
    }

    /// Record the absolute position where the next track starts.
    ///
    /// A second call before `take_track_boundary` replaces the first.
    pub fn set_track_boundary(&self, pos: u64) -> Result<()> {
        let mut state = self.state.write();
        if !state.window.contains(pos) {
            return Err(RingBufferError::invalid(format!(
                "track boundary {pos} outside retained window {}..={}",
                state.window.oldest(),
                state.window.write_pos()
            )));
        }
        if let Some(previous) = state.track_boundary.replace(pos) {
            debug!(previous, pos, "Replaced pending track boundary");
        }
        Ok(())
    }

    pub fn take_track_boundary(&self) -> Option<u64> {
        self.state.write().track_boundary.take()
    }

    /// Snapshot of the retained page boundaries, oldest first.
    #[must_use]
    pub fn pages(&self) -> Vec<PageBoundary> {
        self.state.read().pages.snapshot()
    }

    /// Initial cursor for a relay reader that wants up to `burst` bytes of
    /// already-buffered stream.
    pub fn reader_start(&self, burst: usize) -> Result<ReaderStart> {
        let state = self.state.read();
        let window = state.window;
        let target = window.write_pos() - burst.min(window.count()) as u64;

        match self.content_kind {
            ContentKind::Opaque => {
                let align = self.meta_interval.unwrap_or(self.chunk_size) as u64;
                let mut cursor = target - target % align;
                if cursor < window.oldest() {
                    cursor += align;
                }
                if cursor > window.write_pos() {
                    return Err(RingBufferError::BufferEmpty {
                        requested: burst,
                        available: window.count(),
                    });
                }
                Ok(ReaderStart {
                    cursor,
                    stream_headers: None,
                })
            }
            ContentKind::Paged => {
                let page = state
                    .pages
                    .relay_start(window.oldest(), target)
                    .ok_or(RingBufferError::NoPages)?;
                let stream_headers = if page.flags.is_begin_of_stream() {
                    None
                } else {
                    page.headers.clone()
                };
                Ok(ReaderStart {
                    cursor: page.start,
                    stream_headers,
                })
            }
        }
    }

    /// Position a lapped reader jumps to.
    ///
    /// Plain readers jump to `W`. Metadata readers keep their phase within
    /// the metadata interval so their block framing stays intact, and paged
    /// readers jump to the latest page they can start on.
    #[must_use]
    pub fn resync_cursor(&self, cursor: u64, wants_metadata: bool) -> u64 {
        let state = self.state.read();
        let window = state.window;
        let write_pos = window.write_pos();
        match (self.content_kind, state.marks.as_ref()) {
            (ContentKind::Paged, _) => state
                .pages
                .relay_start(window.oldest(), write_pos)
                .map_or(write_pos, |page| page.start),
            (ContentKind::Opaque, Some(marks)) if wants_metadata && cursor <= write_pos => {
                write_pos - (write_pos - cursor) % marks.interval()
            }
            _ => write_pos,
        }
    }

    /// Copy up to `max_len` bytes of audio from `cursor` for one reader.
    pub fn extract_for_reader(
        &self,
        cursor: u64,
        max_len: usize,
        wants_metadata: bool,
    ) -> Result<Extracted> {
        let mut out = BytesMut::new();
        let next_cursor = self.extract_into(cursor, max_len, wants_metadata, &mut out)?;
        Ok(Extracted {
            data: out.freeze(),
            next_cursor,
        })
    }

    /// Like `extract_for_reader`, appending into a caller-owned buffer.
    ///
    /// When the reader wants metadata and the buffer has an interval, a
    /// block is appended after the audio byte at every absolute multiple of
    /// the interval. Otherwise only audio is copied.
    pub fn extract_into(
        &self,
        cursor: u64,
        max_len: usize,
        wants_metadata: bool,
        out: &mut BytesMut,
    ) -> Result<u64> {
        let state = self.state.read();
        let avail = state.window.readable_from(cursor, max_len)?;
        let end = cursor + avail as u64;

        match state.marks.as_ref().filter(|_| wants_metadata) {
            Some(marks) => {
                let interval = marks.interval();
                out.reserve(avail + (avail as u64 / interval + 1) as usize);
                let mut pos = cursor;
                while pos < end {
                    let boundary = (pos / interval + 1) * interval;
                    let segment_end = boundary.min(end);
                    state.append_range(pos, (segment_end - pos) as usize, out);
                    if segment_end == boundary {
                        out.extend_from_slice(marks.block_for(boundary));
                    }
                    pos = segment_end;
                }
            }
            None => {
                out.reserve(avail);
                state.append_range(cursor, avail, out);
            }
        }

        Ok(end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::icy::EMPTY_BLOCK;
    use crate::ogg::PageFlags;
    use std::sync::Arc;

    fn buffer(chunk_size: usize, chunk_count: usize) -> RingBuffer {
        RingBuffer::new(RingBufferConfig::new(chunk_size, chunk_count)).unwrap()
    }

    fn metadata_buffer(chunk_size: usize, chunk_count: usize, interval: usize) -> RingBuffer {
        RingBuffer::new(
            RingBufferConfig::new(chunk_size, chunk_count).with_meta_interval(Some(interval)),
        )
        .unwrap()
    }

    fn paged_buffer(chunk_size: usize, chunk_count: usize) -> RingBuffer {
        RingBuffer::new(
            RingBufferConfig::new(chunk_size, chunk_count).with_content_kind(ContentKind::Paged),
        )
        .unwrap()
    }

    fn span(offset: usize, len: usize, flags: u8) -> PageSpan {
        PageSpan {
            offset,
            len,
            flags: PageFlags::from_bits(flags),
            stream_header: false,
            headers: None,
        }
    }

    fn pattern(start: u64, len: usize) -> Vec<u8> {
        (start..start + len as u64).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_new_rejects_invalid_geometry() {
        for config in [
            RingBufferConfig::new(0, 4),
            RingBufferConfig::new(256, 0),
            RingBufferConfig::new(256, 4).with_meta_interval(Some(0)),
            RingBufferConfig::new(usize::MAX, 2),
            RingBufferConfig::new(256, 4).with_meta_interval(Some(1025)),
        ] {
            assert!(matches!(
                RingBuffer::new(config),
                Err(RingBufferError::InvalidParam(_))
            ));
        }
        assert_eq!(buffer(256, 4).capacity(), 1024);
        assert!(RingBuffer::new(RingBufferConfig::new(256, 4).with_meta_interval(Some(1024))).is_ok());
    }

    #[test]
    fn test_fill_then_reject() {
        let ring = buffer(256, 4);
        for _ in 0..4 {
            ring.insert(&[0xAA; 256], &[], None).unwrap();
        }
        assert_eq!(ring.len(), 1024);
        assert_eq!(ring.free_space(), 0);
        assert_eq!(
            ring.insert(&[0xAA; 1], &[], None),
            Err(RingBufferError::BufferFull {
                requested: 1,
                free: 0
            })
        );
        // A rejected insert leaves the state untouched.
        assert_eq!(ring.absolute_write_position(), 1024);
    }

    #[test]
    fn test_wrap_after_consume() {
        let ring = buffer(256, 4);
        for _ in 0..4 {
            ring.insert(&[0xAA; 256], &[], None).unwrap();
        }
        ring.consume(512).unwrap();
        ring.insert(&[0xBB; 512], &[], None).unwrap();

        assert_eq!(ring.window().base(), 512);
        assert_eq!(ring.len(), 1024);
        assert_eq!(ring.write_index(), 512);

        let mut out = [0u8; 512];
        ring.peek(512, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0xBB));
        ring.peek(0, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn test_count_never_exceeds_capacity() {
        let ring = buffer(64, 16);
        let mut seed = 0x2545_F491_u32;
        for _ in 0..2000 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            let len = (seed % 300) as usize;
            if seed % 2 == 0 {
                if len <= ring.free_space() {
                    ring.insert(&vec![1u8; len], &[], None).unwrap();
                } else {
                    assert!(ring.insert(&vec![1u8; len], &[], None).is_err());
                }
            } else if len <= ring.len() {
                ring.consume(len).unwrap();
            } else {
                assert!(ring.consume(len).is_err());
            }
            let window = ring.window();
            assert!(window.count() <= window.capacity());
            assert_eq!(window.write_index(), (window.base() + window.count()) % 1024);
        }
    }

    #[test]
    fn test_write_index_tracks_total_inserted() {
        let ring = buffer(100, 3);
        let mut total = 0usize;
        for len in [120usize, 90, 17, 73, 300, 1, 299] {
            let room = len.saturating_sub(ring.free_space());
            if room > 0 {
                ring.consume(room).unwrap();
            }
            ring.insert(&vec![0u8; len], &[], None).unwrap();
            total += len;
            assert_eq!(ring.write_index(), total % 300);
            assert_eq!(ring.absolute_write_position(), total as u64);
        }
    }

    #[test]
    fn test_peek_bounds() {
        let ring = buffer(256, 4);
        let mut out = [0u8; 100];
        assert_eq!(
            ring.peek(0, &mut out),
            Err(RingBufferError::BufferEmpty {
                requested: 100,
                available: 0
            })
        );

        ring.insert(&pattern(0, 500), &[], None).unwrap();
        assert!(ring.peek(450, &mut out).is_err());
        assert!(ring.peek(usize::MAX, &mut out).is_err());
        ring.peek(400, &mut out).unwrap();
        assert_eq!(&out[..], &pattern(400, 100)[..]);
        assert_eq!(ring.len(), 500);
    }

    #[test]
    fn test_peek_across_physical_end() {
        let ring = buffer(100, 5);
        ring.insert(&pattern(0, 400), &[], None).unwrap();
        ring.consume(350).unwrap();
        ring.insert(&pattern(400, 300), &[], None).unwrap();

        let mut out = vec![0u8; 350];
        ring.peek(0, &mut out).unwrap();
        assert_eq!(out, pattern(350, 350));
        assert_eq!(ring.window().base(), 350);
    }

    #[test]
    fn test_peek_region_absolute() {
        let ring = buffer(100, 5);
        ring.insert(&pattern(0, 500), &[], None).unwrap();
        ring.consume(200).unwrap();
        ring.insert(&pattern(500, 150), &[], None).unwrap();

        let mut out = vec![0u8; 200];
        ring.peek_region(420, &mut out).unwrap();
        assert_eq!(out, pattern(420, 200));

        assert!(ring.peek_region(199, &mut out[..10]).is_err());
        assert!(ring.peek_region(600, &mut out[..51]).is_err());
        ring.peek_region(600, &mut out[..50]).unwrap();
    }

    #[test]
    fn test_consume_more_than_held() {
        let ring = buffer(16, 4);
        ring.insert(&[1; 10], &[], None).unwrap();
        assert_eq!(
            ring.consume(11),
            Err(RingBufferError::BufferEmpty {
                requested: 11,
                available: 10
            })
        );
        ring.consume(10).unwrap();
        assert!(ring.is_empty());
        assert_eq!(ring.oldest_position(), 10);
    }

    #[test]
    fn test_free_tail_space() {
        let ring = buffer(100, 10);
        ring.insert(&[0; 800], &[], None).unwrap();
        ring.consume(600).unwrap();
        assert_eq!(ring.free_space(), 800);
        assert_eq!(ring.free_tail_space(), 200);
    }

    #[test]
    fn test_track_boundary_last_wins() {
        let ring = buffer(100, 10);
        ring.insert(&[0; 500], &[], None).unwrap();
        ring.consume(100).unwrap();

        assert!(ring.take_track_boundary().is_none());
        assert!(ring.set_track_boundary(99).is_err());
        assert!(ring.set_track_boundary(501).is_err());

        ring.set_track_boundary(200).unwrap();
        ring.set_track_boundary(450).unwrap();
        assert_eq!(ring.take_track_boundary(), Some(450));
        assert_eq!(ring.take_track_boundary(), None);

        ring.set_track_boundary(500).unwrap();
        assert_eq!(ring.take_track_boundary(), Some(500));
    }

    #[test]
    fn test_pages_rejected_for_opaque_content() {
        let ring = buffer(100, 10);
        assert!(matches!(
            ring.insert(&[0; 50], &[span(0, 50, 0)], None),
            Err(RingBufferError::InvalidParam(_))
        ));

        let paged = paged_buffer(100, 10);
        assert!(matches!(
            paged.insert(&[0; 50], &[span(50, 10, 0)], None),
            Err(RingBufferError::InvalidParam(_))
        ));
    }

    #[test]
    fn test_page_pruning() {
        let ring = paged_buffer(100, 10);
        for i in 0..10u64 {
            ring.insert(&[i as u8; 100], &[span(0, 100, 0)], None).unwrap();
        }
        assert_eq!(ring.pages().len(), 10);

        ring.consume(250).unwrap();
        let pages = ring.pages();
        assert_eq!(pages.len(), 8);
        assert_eq!(pages[0].start, 200);
        assert!(pages.iter().all(|page| page.end() > ring.oldest_position()));

        ring.insert(&[0; 250], &[span(0, 250, 0)], None).unwrap();
        ring.consume(750).unwrap();
        let pages = ring.pages();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].start, 1000);
    }

    #[test]
    fn test_make_room_retires_whole_pages() {
        let ring = paged_buffer(100, 10);
        ring.insert(
            &[0; 1000],
            &[span(0, 300, 0), span(300, 300, 0), span(600, 400, 0)],
            None,
        )
        .unwrap();

        assert_eq!(ring.make_room(0).unwrap(), 0);
        assert_eq!(ring.make_room(100).unwrap(), 300);
        assert_eq!(ring.oldest_position(), 300);
        assert_eq!(ring.pages().len(), 2);

        assert_eq!(ring.make_room(350).unwrap(), 300);
        assert!(matches!(
            ring.make_room(1001),
            Err(RingBufferError::InvalidParam(_))
        ));
    }

    #[test]
    fn test_make_room_without_pages_falls_back_to_bytes() {
        let ring = paged_buffer(100, 10);
        ring.insert(&[0; 1000], &[], None).unwrap();
        assert_eq!(ring.make_room(123).unwrap(), 123);
        assert_eq!(ring.free_space(), 123);
    }

    #[test]
    fn test_make_room_retires_whole_chunks() {
        let ring = buffer(100, 10);
        ring.insert(&[0; 950], &[], None).unwrap();
        assert_eq!(ring.make_room(120).unwrap(), 100);
        assert_eq!(ring.oldest_position(), 100);
        assert_eq!(ring.free_space(), 150);
    }

    #[test]
    fn test_reader_start_opaque_alignment() {
        let ring = buffer(256, 8);
        ring.insert(&[0; 1000], &[], None).unwrap();

        assert_eq!(ring.reader_start(0).unwrap().cursor, 768);
        assert_eq!(ring.reader_start(300).unwrap().cursor, 512);
        assert_eq!(ring.reader_start(5000).unwrap().cursor, 0);

        ring.consume(600).unwrap();
        // oldest 600: aligned start 512 is retired, so move up a chunk
        assert_eq!(ring.reader_start(400).unwrap().cursor, 768);
    }

    #[test]
    fn test_reader_start_waits_for_aligned_position() {
        let ring = metadata_buffer(100, 10, 1000);
        ring.insert(&[0; 900], &[], None).unwrap();
        ring.consume(500).unwrap();
        assert!(matches!(
            ring.reader_start(100),
            Err(RingBufferError::BufferEmpty { .. })
        ));

        ring.insert(&[0; 200], &[], None).unwrap();
        assert_eq!(ring.reader_start(0).unwrap().cursor, 1000);
    }

    #[test]
    fn test_reader_start_paged() {
        let ring = paged_buffer(1000, 5);
        assert_eq!(ring.reader_start(2000), Err(RingBufferError::NoPages));

        let headers = Bytes::from_static(b"OggS-headers");
        let mut audio = span(1000, 1000, 0);
        audio.headers = Some(headers.clone());
        let mut later = span(3000, 2000, 0);
        later.headers = Some(headers.clone());
        ring.insert(
            &[0; 5000],
            &[
                span(0, 1000, PageFlags::BEGIN_OF_STREAM),
                audio,
                span(2000, 1000, PageFlags::CONTINUATION),
                later,
            ],
            None,
        )
        .unwrap();

        let start = ring.reader_start(3000).unwrap();
        assert_eq!(start.cursor, 1000);
        assert_eq!(start.stream_headers, Some(headers.clone()));

        let start = ring.reader_start(2500).unwrap();
        assert_eq!(start.cursor, 1000);

        let start = ring.reader_start(5000).unwrap();
        assert_eq!(start.cursor, 0);
        assert!(start.stream_headers.is_none());

        let start = ring.reader_start(0).unwrap();
        assert_eq!(start.cursor, 3000);
        assert_eq!(start.stream_headers, Some(headers));
    }

    #[test]
    fn test_caught_up_reader_sees_every_byte() {
        let ring = buffer(64, 8);
        let mut cursor = 0u64;
        let mut received = Vec::new();
        let mut produced = 0u64;

        for round in 0..200usize {
            let len = 1 + (round * 37) % 200;
            ring.make_room(len).unwrap();
            ring.insert(&pattern(produced, len), &[], None).unwrap();
            produced += len as u64;

            loop {
                match ring.extract_for_reader(cursor, 96, false) {
                    Ok(extracted) => {
                        received.extend_from_slice(&extracted.data);
                        cursor = extracted.next_cursor;
                    }
                    Err(RingBufferError::BufferEmpty { .. }) => break,
                    Err(err) => panic!("unexpected {err}"),
                }
            }
        }

        assert_eq!(cursor, produced);
        assert_eq!(received, pattern(0, produced as usize));
    }

    #[test]
    fn test_lapped_reader_overruns() {
        let ring = buffer(256, 4);
        ring.insert(&[1; 1024], &[], None).unwrap();
        let cursor = 0;

        ring.consume(1024).unwrap();
        ring.insert(&[2; 512], &[], None).unwrap();
        ring.consume(1).unwrap();

        assert_eq!(
            ring.extract_for_reader(cursor, 256, false),
            Err(RingBufferError::Overrun {
                cursor: 0,
                oldest: 1025
            })
        );
        let resync = ring.absolute_write_position();
        assert!(matches!(
            ring.extract_for_reader(resync, 256, false),
            Err(RingBufferError::BufferEmpty { .. })
        ));
    }

    #[test]
    fn test_resync_cursor() {
        let ring = metadata_buffer(100, 10, 100);
        ring.insert(&[0; 1000], &[], None).unwrap();
        ring.consume(900).unwrap();
        ring.insert(&[0; 50], &[], None).unwrap();
        // write position 1050
        assert_eq!(ring.resync_cursor(10, false), 1050);
        assert_eq!(ring.resync_cursor(10, true), 1010);
        assert_eq!(ring.resync_cursor(60, true), 960);

        let paged = paged_buffer(100, 10);
        assert_eq!(paged.resync_cursor(0, false), 0);
        paged
            .insert(&[0; 600], &[span(0, 300, 0), span(300, 300, 0)], None)
            .unwrap();
        assert_eq!(paged.resync_cursor(0, false), 300);
    }

    #[test]
    fn test_extract_caps_at_max_len() {
        let ring = buffer(100, 10);
        ring.insert(&pattern(0, 300), &[], None).unwrap();
        let extracted = ring.extract_for_reader(50, 100, false).unwrap();
        assert_eq!(extracted.data, Bytes::from(pattern(50, 100)));
        assert_eq!(extracted.next_cursor, 150);
    }

    /// Split a metadata-interleaved reader stream into audio and texts.
    fn split_interleaved(stream: &[u8], interval: usize) -> (Vec<u8>, Vec<(usize, String)>) {
        let mut audio = Vec::new();
        let mut texts = Vec::new();
        let mut rest = stream;
        while !rest.is_empty() {
            let take = interval.min(rest.len());
            audio.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if take == interval && !rest.is_empty() {
                let (text, consumed) = MetadataBlock::decode(rest).unwrap();
                if !text.is_empty() {
                    texts.push((audio.len(), text));
                }
                rest = &rest[consumed..];
            }
        }
        (audio, texts)
    }

    #[test]
    fn test_metadata_reader_matches_plain_reader() {
        let ring = metadata_buffer(100, 10, 100);
        ring.insert(&pattern(0, 250), &[], None).unwrap();
        ring.insert(
            &pattern(250, 250),
            &[],
            Some(&TrackChange::new("StreamTitle='A - B';")),
        )
        .unwrap();
        ring.insert(&pattern(500, 300), &[], None).unwrap();

        let mut plain = Vec::new();
        let mut interleaved = Vec::new();
        let (mut plain_cursor, mut meta_cursor) = (0u64, 0u64);
        while plain_cursor < 800 {
            let extracted = ring.extract_for_reader(plain_cursor, 70, false).unwrap();
            plain.extend_from_slice(&extracted.data);
            plain_cursor = extracted.next_cursor;
        }
        while meta_cursor < 800 {
            let extracted = ring.extract_for_reader(meta_cursor, 70, true).unwrap();
            interleaved.extend_from_slice(&extracted.data);
            meta_cursor = extracted.next_cursor;
        }

        assert_eq!(plain, pattern(0, 800));
        let block = MetadataBlock::encode("StreamTitle='A - B';").unwrap();
        // empty blocks at 100 and 200, the title from 300 through 800
        assert_eq!(interleaved.len(), 800 + 2 + 6 * block.len());
        assert_eq!(interleaved[100], EMPTY_BLOCK[0]);
        assert_eq!(&interleaved[302..302 + block.len()], block.as_bytes());

        let (audio, texts) = split_interleaved(&interleaved, 100);
        assert_eq!(audio, plain);
        let expected: Vec<_> = (3..=8)
            .map(|i| (i * 100, "StreamTitle='A - B';".to_string()))
            .collect();
        assert_eq!(texts, expected);
    }

    #[test]
    fn test_late_metadata_reader_gets_current_title() {
        let ring = metadata_buffer(100, 10, 100);
        ring.insert(
            &pattern(0, 100),
            &[],
            Some(&TrackChange::new("StreamTitle='A - B';")),
        )
        .unwrap();
        for chunk in 1..16u64 {
            ring.make_room(100).unwrap();
            ring.insert(&pattern(chunk * 100, 100), &[], None).unwrap();
        }
        assert_eq!(ring.oldest_position(), 600);

        let mut cursor = ring.reader_start(1000).unwrap().cursor;
        assert_eq!(cursor, 600);
        let mut interleaved = Vec::new();
        while cursor < 1600 {
            let extracted = ring.extract_for_reader(cursor, 250, true).unwrap();
            interleaved.extend_from_slice(&extracted.data);
            cursor = extracted.next_cursor;
        }

        let (audio, texts) = split_interleaved(&interleaved, 100);
        assert_eq!(audio, pattern(600, 1000));
        // the change at 0 left the window long ago but is still current
        assert_eq!(texts.len(), 10);
        assert!(texts.iter().all(|(_, text)| text == "StreamTitle='A - B';"));
    }

    #[test]
    fn test_oversized_track_change_rejected() {
        let ring = metadata_buffer(100, 10, 100);
        let track = TrackChange::new("x".repeat(5000));
        assert!(matches!(
            ring.insert(&[0; 10], &[], Some(&track)),
            Err(RingBufferError::Metadata(_))
        ));
        assert!(ring.is_empty());
    }

    #[test]
    fn test_track_change_ignored_without_interval() {
        let ring = buffer(100, 10);
        ring.insert(&[0; 100], &[], Some(&TrackChange::new("StreamTitle='x';")))
            .unwrap();
        let extracted = ring.extract_for_reader(0, 1000, true).unwrap();
        assert_eq!(extracted.data.len(), 100);
    }

    #[test]
    fn test_concurrent_producer_and_reader() {
        let ring = Arc::new(buffer(128, 8));
        let total = 200_000u64;

        let producer = {
            let ring = Arc::clone(&ring);
            std::thread::spawn(move || {
                let mut produced = 0u64;
                while produced < total {
                    let len = 97.min((total - produced) as usize);
                    if ring.free_space() < len {
                        // Retire only bytes the reader cannot still need by
                        // keeping the window half full.
                        let _ = ring.consume(ring.len() / 2);
                        std::thread::yield_now();
                        continue;
                    }
                    ring.insert(&pattern(produced, len), &[], None).unwrap();
                    produced += len as u64;
                }
            })
        };

        let mut cursor = 0u64;
        let mut checked = 0u64;
        while cursor < total {
            match ring.extract_for_reader(cursor, 200, false) {
                Ok(extracted) => {
                    assert_eq!(&extracted.data[..], &pattern(cursor, extracted.data.len())[..]);
                    checked += extracted.data.len() as u64;
                    cursor = extracted.next_cursor;
                }
                Err(RingBufferError::BufferEmpty { .. }) => std::thread::yield_now(),
                Err(RingBufferError::Overrun { .. }) => {
                    cursor = ring.absolute_write_position();
                }
                Err(err) => panic!("unexpected {err}"),
            }
        }

        producer.join().unwrap();
        assert!(checked > 0);
    }
}
