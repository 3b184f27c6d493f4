use thiserror::Error;

/// Errors raised by the ring buffer and its reader primitives.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RingBufferError {
    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    #[error("Buffer full: requested {requested} bytes, {free} free")]
    BufferFull { requested: usize, free: usize },

    #[error("Buffer empty: requested {requested} bytes, {available} available")]
    BufferEmpty { requested: usize, available: usize },

    /// The reader's cursor fell behind the oldest retained byte.
    #[error("Reader overrun: cursor {cursor} is behind oldest retained position {oldest}")]
    Overrun { cursor: u64, oldest: u64 },

    #[error("No page boundaries retained for relay start")]
    NoPages,

    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),
}

impl RingBufferError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidParam(msg.into())
    }
}

/// Errors raised when encoding or decoding ICY metadata blocks.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetadataError {
    #[error("Metadata content of {len} bytes needs more than 255 sixteen-byte blocks")]
    TooLong { len: usize },

    #[error("Metadata block truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Metadata interval must be greater than zero")]
    InvalidInterval,
}

/// Errors raised while parsing Ogg page headers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OggError {
    #[error("Missing OggS capture pattern")]
    BadCapture,

    #[error("Unsupported Ogg stream structure version {0}")]
    UnsupportedVersion(u8),

    #[error("Ogg page header truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
}

pub type Result<T> = std::result::Result<T, RingBufferError>;
