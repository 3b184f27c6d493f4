// Per-client relay state
//
// Each session owns an absolute cursor into the shared ring buffer and a
// staging buffer holding the bytes of the current extraction. Sends are
// non-blocking: a partial send leaves `send_offset`/`send_remaining` pointing
// at the unsent tail, which is retried on the next distribution round before
// anything new is extracted.

use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::time::Instant;

use bytes::BytesMut;
use ripcast_core::{RingBuffer, RingBufferError};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::error::{RelayError, Result};

/// Non-blocking byte sink a session drains into.
pub trait RelaySink: Send {
    /// Write as much of `buf` as the peer accepts right now.
    fn try_send(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Read and discard anything the peer sent. Returns `false` once the
    /// peer has closed its side.
    fn discard_incoming(&mut self) -> io::Result<bool>;
}

impl RelaySink for TcpStream {
    fn try_send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.try_write(buf)
    }

    fn discard_incoming(&mut self) -> io::Result<bool> {
        let mut scratch = [0u8; 1024];
        loop {
            match self.try_read(&mut scratch) {
                Ok(0) => return Ok(false),
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(true),
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
    }
}

/// Limits applied to one session per distribution round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpLimits {
    /// Buffered bytes a new client starts behind the write position.
    pub burst_bytes: usize,
    /// Audio bytes taken from the buffer per extraction.
    pub max_send_bytes: usize,
    /// Extract/send cycles allowed per round.
    pub max_extracts: usize,
}

impl Default for PumpLimits {
    fn default() -> Self {
        Self {
            burst_bytes: 64 * 1024,
            max_send_bytes: 8192,
            max_extracts: 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Staged(usize),
    /// Nothing new to send yet.
    Empty,
    /// The buffer lapped the client; `lost` bytes were skipped.
    Overrun { lost: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendProgress {
    /// Nothing was staged.
    Idle,
    Drained,
    Partial,
    WouldBlock,
}

pub struct RelayClientSession<S = TcpStream> {
    id: u64,
    peer: SocketAddr,
    sink: S,
    wants_metadata: bool,
    cursor: u64,
    is_new: bool,
    stage: BytesMut,
    send_offset: usize,
    send_remaining: usize,
    bytes_sent: u64,
    overruns: u64,
    connected_at: Instant,
}

impl<S: RelaySink> RelayClientSession<S> {
    pub fn new(id: u64, peer: SocketAddr, sink: S, wants_metadata: bool) -> Self {
        Self {
            id,
            peer,
            sink,
            wants_metadata,
            cursor: 0,
            is_new: true,
            stage: BytesMut::new(),
            send_offset: 0,
            send_remaining: 0,
            bytes_sent: 0,
            overruns: 0,
            connected_at: Instant::now(),
        }
    }

    pub const fn id(&self) -> u64 {
        self.id
    }

    pub const fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub const fn wants_metadata(&self) -> bool {
        self.wants_metadata
    }

    pub const fn cursor(&self) -> u64 {
        self.cursor
    }

    pub const fn is_new(&self) -> bool {
        self.is_new
    }

    pub const fn send_remaining(&self) -> usize {
        self.send_remaining
    }

    pub const fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub const fn overruns(&self) -> u64 {
        self.overruns
    }

    pub const fn connected_at(&self) -> Instant {
        self.connected_at
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Place the cursor for a client's first round.
    ///
    /// Returns `false` when the buffer has no usable start position yet; the
    /// client stays new and is retried next round. Stream header pages, if
    /// any, are staged ahead of the buffered data.
    pub fn initialize(&mut self, buffer: &RingBuffer, burst: usize) -> Result<bool> {
        if !self.is_new {
            return Ok(true);
        }
        let start = match buffer.reader_start(burst) {
            Ok(start) => start,
            Err(RingBufferError::BufferEmpty { .. } | RingBufferError::NoPages) => {
                return Ok(false)
            }
            Err(err) => return Err(err.into()),
        };

        self.cursor = start.cursor;
        self.stage.clear();
        self.send_offset = 0;
        self.send_remaining = 0;
        if let Some(headers) = start.stream_headers {
            self.stage.extend_from_slice(&headers);
            self.send_remaining = headers.len();
        }
        self.is_new = false;

        debug!(
            client_id = self.id,
            cursor = self.cursor,
            behind = buffer.absolute_write_position() - self.cursor,
            "Relay client positioned"
        );
        Ok(true)
    }

    /// Extract the next run of bytes into the staging buffer.
    ///
    /// Must only be called once the previous extraction has been sent.
    pub fn stage_next(&mut self, buffer: &RingBuffer, max_len: usize) -> Result<StageOutcome> {
        debug_assert_eq!(self.send_remaining, 0);
        self.stage.clear();
        self.send_offset = 0;

        match buffer.extract_into(self.cursor, max_len, self.wants_metadata, &mut self.stage) {
            Ok(next_cursor) => {
                self.cursor = next_cursor;
                self.send_remaining = self.stage.len();
                Ok(StageOutcome::Staged(self.send_remaining))
            }
            Err(RingBufferError::BufferEmpty { .. }) => Ok(StageOutcome::Empty),
            Err(RingBufferError::Overrun { cursor, .. }) => {
                let resynced = buffer.resync_cursor(cursor, self.wants_metadata);
                self.cursor = resynced;
                self.overruns += 1;
                Ok(StageOutcome::Overrun {
                    lost: resynced.saturating_sub(cursor),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Send as much of the staged bytes as the peer accepts without blocking.
    pub fn flush(&mut self) -> io::Result<SendProgress> {
        if self.send_remaining == 0 {
            return Ok(SendProgress::Idle);
        }
        let pending = &self.stage[self.send_offset..self.send_offset + self.send_remaining];
        match self.sink.try_send(pending) {
            Ok(0) => Err(io::Error::new(
                ErrorKind::WriteZero,
                "relay client accepted zero bytes",
            )),
            Ok(sent) => {
                self.send_offset += sent;
                self.send_remaining -= sent;
                self.bytes_sent += sent as u64;
                if self.send_remaining == 0 {
                    Ok(SendProgress::Drained)
                } else {
                    Ok(SendProgress::Partial)
                }
            }
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                Ok(SendProgress::WouldBlock)
            }
            Err(err) => Err(err),
        }
    }

    /// Run one distribution round for this client.
    ///
    /// An error means the client must be disconnected.
    pub fn pump(&mut self, buffer: &RingBuffer, limits: PumpLimits) -> Result<()> {
        if !self.sink.discard_incoming()? {
            return Err(RelayError::ClientClosed);
        }
        if !self.initialize(buffer, limits.burst_bytes)? {
            return Ok(());
        }

        for _ in 0..limits.max_extracts {
            if self.send_remaining == 0 {
                match self.stage_next(buffer, limits.max_send_bytes)? {
                    StageOutcome::Staged(_) => {}
                    StageOutcome::Empty => break,
                    StageOutcome::Overrun { lost } => {
                        warn!(
                            client_id = self.id,
                            peer = %self.peer,
                            lost,
                            cursor = self.cursor,
                            "Relay client overrun, resynchronised"
                        );
                        break;
                    }
                }
            }
            match self.flush()? {
                SendProgress::Idle | SendProgress::Drained => {}
                SendProgress::Partial | SendProgress::WouldBlock => break,
            }
        }
        Ok(())
    }
}
