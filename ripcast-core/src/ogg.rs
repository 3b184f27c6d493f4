// Ogg page header parsing and incremental page scanning
//
// Page header layout (27 bytes + segment table):
// - Capture pattern "OggS" (4 bytes)
// - Stream structure version, always 0 (1 byte)
// - Header type flags: 0x01 continuation, 0x02 BOS, 0x04 EOS (1 byte)
// - Granule position (8 bytes, little endian)
// - Bitstream serial number (4 bytes)
// - Page sequence number (4 bytes)
// - CRC checksum (4 bytes)
// - Number of segments (1 byte)
// - Segment table, one lacing value per segment
//
// The body length is the sum of the segment table.

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::error::OggError;

pub const CAPTURE_PATTERN: &[u8; 4] = b"OggS";
/// Fixed part of the page header, before the segment table.
pub const FIXED_HEADER_LEN: usize = 27;

/// Header type flags of one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageFlags(u8);

impl PageFlags {
    pub const CONTINUATION: u8 = 0x01;
    pub const BEGIN_OF_STREAM: u8 = 0x02;
    pub const END_OF_STREAM: u8 = 0x04;

    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub const fn is_continuation(self) -> bool {
        self.0 & Self::CONTINUATION != 0
    }

    #[must_use]
    pub const fn is_begin_of_stream(self) -> bool {
        self.0 & Self::BEGIN_OF_STREAM != 0
    }

    #[must_use]
    pub const fn is_end_of_stream(self) -> bool {
        self.0 & Self::END_OF_STREAM != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub flags: PageFlags,
    pub granule_position: u64,
    pub serial: u32,
    pub sequence: u32,
    /// Header length including the segment table.
    pub header_len: usize,
    pub body_len: usize,
}

impl PageHeader {
    /// Parse the page header at the start of `buf`.
    pub fn parse(buf: &[u8]) -> Result<Self, OggError> {
        if buf.len() < FIXED_HEADER_LEN {
            return Err(OggError::Truncated {
                needed: FIXED_HEADER_LEN,
                available: buf.len(),
            });
        }
        if &buf[..4] != CAPTURE_PATTERN {
            return Err(OggError::BadCapture);
        }
        if buf[4] != 0 {
            return Err(OggError::UnsupportedVersion(buf[4]));
        }

        let segments = usize::from(buf[26]);
        let header_len = FIXED_HEADER_LEN + segments;
        if buf.len() < header_len {
            return Err(OggError::Truncated {
                needed: header_len,
                available: buf.len(),
            });
        }
        let body_len = buf[FIXED_HEADER_LEN..header_len]
            .iter()
            .map(|&lacing| usize::from(lacing))
            .sum();

        Ok(Self {
            flags: PageFlags::from_bits(buf[5]),
            granule_position: u64::from_le_bytes(read_array(&buf[6..14])),
            serial: u32::from_le_bytes(read_array(&buf[14..18])),
            sequence: u32::from_le_bytes(read_array(&buf[18..22])),
            header_len,
            body_len,
        })
    }

    #[must_use]
    pub const fn page_len(&self) -> usize {
        self.header_len + self.body_len
    }
}

fn read_array<const N: usize>(src: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(src);
    out
}

/// One complete page cut from the input stream.
#[derive(Debug, Clone)]
pub struct OggPage {
    pub header: PageHeader,
    pub data: Bytes,
    /// True for the non-BOS header pages (comment, setup) that follow a BOS page.
    pub stream_header: bool,
}

/// Page boundary information supplied with an insert, relative to the
/// start of the inserted chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSpan {
    pub offset: usize,
    pub len: usize,
    pub flags: PageFlags,
    pub stream_header: bool,
    /// Stream header pages a reader starting at this page must receive first.
    pub headers: Option<Bytes>,
}

/// Cuts a byte stream into whole Ogg pages and tracks the current logical
/// stream's header pages.
#[derive(Debug, Default)]
pub struct PageScanner {
    pending: BytesMut,
    stream_headers: BytesMut,
    collecting_headers: bool,
    skipped: u64,
}

impl PageScanner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes discarded while searching for a capture pattern.
    #[must_use]
    pub const fn skipped(&self) -> u64 {
        self.skipped
    }

    /// The header pages of the current logical stream, if any were seen.
    #[must_use]
    pub fn stream_headers(&self) -> Option<Bytes> {
        if self.stream_headers.is_empty() {
            None
        } else {
            Some(Bytes::copy_from_slice(&self.stream_headers))
        }
    }

    /// Feed `input` and return every page it completed.
    pub fn push(&mut self, input: &[u8]) -> Vec<OggPage> {
        self.pending.extend_from_slice(input);
        let mut pages = Vec::new();

        loop {
            if !self.resync() {
                break;
            }
            let header = match PageHeader::parse(&self.pending) {
                Ok(header) => header,
                Err(OggError::Truncated { .. }) => break,
                Err(err) => {
                    debug!(error = %err, "Skipping invalid Ogg page header");
                    let _ = self.pending.split_to(1);
                    self.skipped += 1;
                    continue;
                }
            };
            if self.pending.len() < header.page_len() {
                break;
            }

            let data = self.pending.split_to(header.page_len()).freeze();
            let stream_header = self.track_headers(&header, &data);
            trace!(
                len = data.len(),
                flags = header.flags.bits(),
                granule = header.granule_position,
                "Scanned Ogg page"
            );
            pages.push(OggPage {
                header,
                data,
                stream_header,
            });
        }

        pages
    }

    /// Concatenate `pages` into one insertable chunk with matching spans.
    #[must_use]
    pub fn assemble(&self, pages: &[OggPage]) -> (Bytes, Vec<PageSpan>) {
        let total = pages.iter().map(|page| page.data.len()).sum();
        let mut chunk = BytesMut::with_capacity(total);
        let mut spans = Vec::with_capacity(pages.len());
        let headers = self.stream_headers();

        for page in pages {
            let is_header = page.stream_header || page.header.flags.is_begin_of_stream();
            spans.push(PageSpan {
                offset: chunk.len(),
                len: page.data.len(),
                flags: page.header.flags,
                stream_header: page.stream_header,
                headers: if is_header { None } else { headers.clone() },
            });
            chunk.extend_from_slice(&page.data);
        }

        (chunk.freeze(), spans)
    }

    /// Drop bytes before the next capture pattern. Returns false when more
    /// input is needed.
    fn resync(&mut self) -> bool {
        match find_capture(&self.pending) {
            Some(0) => true,
            Some(start) => {
                debug!(skipped = start, "Resynchronised Ogg stream");
                let _ = self.pending.split_to(start);
                self.skipped += start as u64;
                true
            }
            None => {
                // Keep a tail that might be the start of a split capture pattern.
                let keep = self.pending.len().min(CAPTURE_PATTERN.len() - 1);
                let drop = self.pending.len() - keep;
                if drop > 0 {
                    let _ = self.pending.split_to(drop);
                    self.skipped += drop as u64;
                }
                false
            }
        }
    }

    fn track_headers(&mut self, header: &PageHeader, data: &[u8]) -> bool {
        if header.flags.is_begin_of_stream() {
            self.stream_headers.clear();
            self.stream_headers.extend_from_slice(data);
            self.collecting_headers = true;
            return false;
        }
        if self.collecting_headers && header.granule_position == 0 {
            self.stream_headers.extend_from_slice(data);
            return true;
        }
        self.collecting_headers = false;
        false
    }
}

fn find_capture(buf: &[u8]) -> Option<usize> {
    buf.windows(CAPTURE_PATTERN.len())
        .position(|window| window == CAPTURE_PATTERN)
}

/// Build a page with a single lacing run covering `body`. Used by tests
/// across the workspace.
#[doc(hidden)]
#[must_use]
pub fn build_page(flags: u8, granule: u64, sequence: u32, body: &[u8]) -> Vec<u8> {
    let mut lacing = vec![255u8; body.len() / 255];
    lacing.push((body.len() % 255) as u8);

    let mut page = Vec::with_capacity(FIXED_HEADER_LEN + lacing.len() + body.len());
    page.extend_from_slice(CAPTURE_PATTERN);
    page.push(0);
    page.push(flags);
    page.extend_from_slice(&granule.to_le_bytes());
    page.extend_from_slice(&0x5EED_u32.to_le_bytes());
    page.extend_from_slice(&sequence.to_le_bytes());
    page.extend_from_slice(&[0; 4]);
    page.push(lacing.len() as u8);
    page.extend_from_slice(&lacing);
    page.extend_from_slice(body);
    page
}
