use std::time::Duration;

use ripcast_core::RingBufferError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Invalid relay configuration: {0}")]
    InvalidConfig(String),

    /// Every candidate port failed to bind.
    #[error("Cannot bind relay on any port in {first}..={last}")]
    NoPortAvailable { first: u16, last: u16 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request header exceeds {limit} bytes")]
    HeaderTooLarge { limit: usize },

    #[error("Client did not finish its request header within {0:?}")]
    HeaderTimeout(Duration),

    #[error("Client closed the connection")]
    ClientClosed,

    #[error("No stream attached to the relay")]
    NotReady,

    #[error("Relay full: {current}/{max} clients")]
    Full { current: usize, max: usize },

    #[error("Buffer error: {0}")]
    Buffer(#[from] RingBufferError),
}

pub type Result<T> = std::result::Result<T, RelayError>;
