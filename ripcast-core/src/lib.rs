pub mod error;
pub mod icy;
pub mod ogg;
pub mod ring;

pub use error::{MetadataError, OggError, Result, RingBufferError};
pub use icy::{IcyDeinterleaver, MetadataBlock};
pub use ogg::{OggPage, PageFlags, PageHeader, PageScanner, PageSpan};
pub use ring::{
    ContentKind, Extracted, PageBoundary, ReaderStart, RingBuffer, RingBufferConfig,
    TrackChange, Window,
};
