// ICY in-band metadata framing
//
// Wire format: one length byte `L`, then `L * 16` bytes of text, NUL padded.
// An empty block is the single byte 0x00. `L` must fit in one byte, so the
// longest encodable content is 255 * 16 = 4080 bytes.

use bytes::{Bytes, BytesMut};
use tracing::debug;

use crate::error::MetadataError;

/// Size of one metadata length unit.
pub const METADATA_UNIT: usize = 16;
/// Largest value the length byte may carry.
pub const MAX_LENGTH_BYTE: usize = u8::MAX as usize;
/// Largest encoded block: length byte plus 255 units.
pub const MAX_BLOCK_LEN: usize = 1 + MAX_LENGTH_BYTE * METADATA_UNIT;
/// The block emitted at an interval boundary with no pending change.
pub const EMPTY_BLOCK: &[u8] = &[0];

/// A wire-ready ICY metadata block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataBlock {
    encoded: Bytes,
}

impl MetadataBlock {
    /// Encode `content` into a length-prefixed block.
    ///
    /// Content that would need a length byte above 255 is rejected rather
    /// than truncated.
    pub fn encode(content: &str) -> Result<Self, MetadataError> {
        let raw = content.as_bytes();
        let units = raw.len().div_ceil(METADATA_UNIT);
        let length_byte =
            u8::try_from(units).map_err(|_| MetadataError::TooLong { len: raw.len() })?;

        let mut encoded = BytesMut::with_capacity(1 + units * METADATA_UNIT);
        encoded.extend_from_slice(&[length_byte]);
        encoded.extend_from_slice(raw);
        encoded.resize(1 + units * METADATA_UNIT, 0);

        Ok(Self {
            encoded: encoded.freeze(),
        })
    }

    #[must_use]
    pub fn empty() -> Self {
        Self {
            encoded: Bytes::from_static(EMPTY_BLOCK),
        }
    }

    /// Decode a block from the front of `buf`.
    ///
    /// Returns the content with trailing padding trimmed and the number of
    /// bytes the block occupied.
    pub fn decode(buf: &[u8]) -> Result<(String, usize), MetadataError> {
        let Some(&length_byte) = buf.first() else {
            return Err(MetadataError::Truncated {
                needed: 1,
                available: 0,
            });
        };
        let needed = 1 + usize::from(length_byte) * METADATA_UNIT;
        if buf.len() < needed {
            return Err(MetadataError::Truncated {
                needed,
                available: buf.len(),
            });
        }
        Ok((trim_padding(&buf[1..needed]), needed))
    }

    #[must_use]
    pub fn length_byte(&self) -> u8 {
        self.encoded[0]
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.length_byte() == 0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.encoded.len()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.encoded
    }

    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        self.encoded
    }
}

fn trim_padding(content: &[u8]) -> String {
    let end = content
        .iter()
        .rposition(|&b| b != 0 && b != b' ')
        .map_or(0, |i| i + 1);
    String::from_utf8_lossy(&content[..end]).into_owned()
}

/// Extract the value of `StreamTitle='...'` from decoded metadata text.
#[must_use]
pub fn stream_title(content: &str) -> Option<&str> {
    let rest = content.split_once("StreamTitle='")?.1;
    // Titles may contain quotes, so the field ends at the next `';Stream`
    // field or the last `';`.
    let end = rest
        .find("';Stream")
        .or_else(|| rest.rfind("';"))
        .unwrap_or(rest.len());
    Some(&rest[..end])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeinterleaveState {
    Audio,
    Length,
    Content { remaining: usize },
}

/// Splits an ICY-interleaved upstream byte stream into pure audio and the
/// metadata texts it carried.
///
/// Input may be pushed in arbitrary pieces; a block split across two pushes
/// is reassembled.
#[derive(Debug)]
pub struct IcyDeinterleaver {
    interval: usize,
    until_block: usize,
    state: DeinterleaveState,
    pending: Vec<u8>,
}

impl IcyDeinterleaver {
    pub fn new(interval: usize) -> Result<Self, MetadataError> {
        if interval == 0 {
            return Err(MetadataError::InvalidInterval);
        }
        Ok(Self {
            interval,
            until_block: interval,
            state: DeinterleaveState::Audio,
            pending: Vec::new(),
        })
    }

    #[must_use]
    pub const fn interval(&self) -> usize {
        self.interval
    }

    /// Append the audio part of `input` to `audio` and return every
    /// non-empty metadata text completed by this push.
    pub fn push(&mut self, input: &[u8], audio: &mut BytesMut) -> Vec<String> {
        let mut texts = Vec::new();
        let mut rest = input;

        while !rest.is_empty() {
            match self.state {
                DeinterleaveState::Audio => {
                    let take = self.until_block.min(rest.len());
                    audio.extend_from_slice(&rest[..take]);
                    rest = &rest[take..];
                    self.until_block -= take;
                    if self.until_block == 0 {
                        self.state = DeinterleaveState::Length;
                    }
                }
                DeinterleaveState::Length => {
                    let units = usize::from(rest[0]);
                    rest = &rest[1..];
                    if units == 0 {
                        self.resume_audio();
                    } else {
                        self.pending.clear();
                        self.state = DeinterleaveState::Content {
                            remaining: units * METADATA_UNIT,
                        };
                    }
                }
                DeinterleaveState::Content { remaining } => {
                    let take = remaining.min(rest.len());
                    self.pending.extend_from_slice(&rest[..take]);
                    rest = &rest[take..];
                    if take == remaining {
                        let text = trim_padding(&self.pending);
                        debug!(text = %text, "Decoded upstream metadata block");
                        if !text.is_empty() {
                            texts.push(text);
                        }
                        self.resume_audio();
                    } else {
                        self.state = DeinterleaveState::Content {
                            remaining: remaining - take,
                        };
                    }
                }
            }
        }

        texts
    }

    fn resume_audio(&mut self) {
        self.state = DeinterleaveState::Audio;
        self.until_block = self.interval;
    }
}
