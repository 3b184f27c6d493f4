// Stand-in producer
//
// Reads the configured input and feeds the ring buffer the way a rip session
// would: audio only, ICY metadata stripped and turned into track changes,
// Ogg input inserted as whole pages. Old data is retired before each insert
// so the producer never blocks on slow readers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::{Bytes, BytesMut};
use ripcast_core::icy::stream_title;
use ripcast_core::{
    ContentKind, IcyDeinterleaver, PageScanner, PageSpan, RingBuffer, RingBufferError, TrackChange,
};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SourceConfig;

/// Why a pump run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpEnd {
    EndOfInput,
    Cancelled,
}

/// Sleeps so that input is consumed no faster than the configured bitrate.
#[derive(Debug)]
pub struct Pacer {
    bytes_per_sec: Option<u64>,
    started: Instant,
    consumed: u64,
}

impl Pacer {
    #[must_use]
    pub fn new(bitrate_kbps: Option<u32>) -> Self {
        Self {
            bytes_per_sec: bitrate_kbps.map(|kbps| u64::from(kbps) * 1000 / 8),
            started: Instant::now(),
            consumed: 0,
        }
    }

    /// Account for `len` more bytes and return when the next read is due.
    pub fn record(&mut self, len: usize) -> Option<Instant> {
        self.consumed += len as u64;
        let rate = self.bytes_per_sec.filter(|&rate| rate > 0)?;
        let due = Duration::from_secs_f64(self.consumed as f64 / rate as f64);
        Some(self.started + due)
    }

    pub fn reset(&mut self) {
        self.started = Instant::now();
        self.consumed = 0;
    }
}

/// Turns raw input into ring buffer inserts.
pub struct Ingest {
    buffer: Arc<RingBuffer>,
    deinterleaver: Option<IcyDeinterleaver>,
    scanner: Option<PageScanner>,
    current_title: Option<String>,
    pending_track: Option<TrackChange>,
    pending_boundary: Option<u64>,
    audio: BytesMut,
    inserted: u64,
}

impl Ingest {
    pub fn new(buffer: Arc<RingBuffer>, upstream_meta_interval: Option<usize>) -> anyhow::Result<Self> {
        let deinterleaver = upstream_meta_interval
            .map(IcyDeinterleaver::new)
            .transpose()
            .context("invalid upstream metadata interval")?;
        let scanner = (buffer.content_kind() == ContentKind::Paged).then(PageScanner::new);
        Ok(Self {
            buffer,
            deinterleaver,
            scanner,
            current_title: None,
            pending_track: None,
            pending_boundary: None,
            audio: BytesMut::new(),
            inserted: 0,
        })
    }

    /// Audio bytes inserted so far.
    #[must_use]
    pub const fn inserted(&self) -> u64 {
        self.inserted
    }

    #[must_use]
    pub fn current_title(&self) -> Option<&str> {
        self.current_title.as_deref()
    }

    /// Feed one read of raw input.
    pub fn feed(&mut self, input: &[u8]) -> anyhow::Result<()> {
        let audio = match self.deinterleaver.as_mut() {
            Some(deinterleaver) => {
                self.audio.clear();
                let texts = deinterleaver.push(input, &mut self.audio);
                for text in texts {
                    self.observe_metadata(&text);
                }
                Bytes::copy_from_slice(&self.audio)
            }
            None => Bytes::copy_from_slice(input),
        };

        match self.scanner.as_mut() {
            Some(scanner) => {
                let pages = scanner.push(&audio);
                if pages.is_empty() {
                    return Ok(());
                }
                let (chunk, spans) = scanner.assemble(&pages);
                self.insert_chunk(&chunk, &spans)
            }
            None => self.insert_chunk(&audio, &[]),
        }
    }

    fn observe_metadata(&mut self, text: &str) {
        let Some(title) = stream_title(text) else {
            debug!(text, "Metadata without a stream title");
            return;
        };
        if self.current_title.as_deref() == Some(title) {
            return;
        }
        info!(title, "Track changed");
        self.current_title = Some(title.to_string());
        self.pending_track = Some(TrackChange::new(text));
    }

    fn insert_chunk(&mut self, chunk: &[u8], spans: &[PageSpan]) -> anyhow::Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        if chunk.len() > self.buffer.capacity() {
            warn!(
                len = chunk.len(),
                capacity = self.buffer.capacity(),
                "Dropping chunk larger than the ring buffer"
            );
            return Ok(());
        }

        let retired = self.buffer.make_room(chunk.len())?;
        if retired > 0 {
            self.retire_boundary();
        }

        let start = self.buffer.absolute_write_position();
        let track = self.pending_track.take();
        match self.buffer.insert(chunk, spans, track.as_ref()) {
            Ok(()) => {}
            Err(RingBufferError::Metadata(err)) => {
                warn!(error = %err, "Track change not relayed");
                self.buffer.insert(chunk, spans, None)?;
            }
            Err(err) => return Err(err.into()),
        }
        self.inserted += chunk.len() as u64;

        if track.is_some() {
            self.buffer.set_track_boundary(start)?;
            self.pending_boundary = Some(start);
        }
        Ok(())
    }

    /// Hand the pending track boundary to the writer once it has left the window.
    fn retire_boundary(&mut self) {
        let oldest = self.buffer.oldest_position();
        if self.pending_boundary.is_some_and(|boundary| boundary < oldest) {
            self.pending_boundary = None;
            if let Some(boundary) = self.buffer.take_track_boundary() {
                info!(boundary, oldest, "Track boundary retired from the buffer");
            }
        }
    }
}

/// Read `reader` to the end, feeding `ingest` at the paced rate.
pub async fn pump<R>(
    reader: &mut R,
    ingest: &mut Ingest,
    pacer: &mut Pacer,
    read_size: usize,
    shutdown: &CancellationToken,
) -> anyhow::Result<PumpEnd>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; read_size.max(1)];
    loop {
        let n = tokio::select! {
            () = shutdown.cancelled() => return Ok(PumpEnd::Cancelled),
            read = reader.read(&mut buf) => read.context("failed to read input")?,
        };
        if n == 0 {
            return Ok(PumpEnd::EndOfInput);
        }
        ingest.feed(&buf[..n])?;

        if let Some(due) = pacer.record(n) {
            tokio::select! {
                () = shutdown.cancelled() => return Ok(PumpEnd::Cancelled),
                () = tokio::time::sleep_until(due) => {}
            }
        }
    }
}

/// Run the configured input until it ends or `shutdown` fires.
pub async fn run(
    source: &SourceConfig,
    ingest: &mut Ingest,
    read_size: usize,
    shutdown: &CancellationToken,
) -> anyhow::Result<PumpEnd> {
    let mut pacer = Pacer::new(source.bitrate_kbps);

    if source.is_stdin() {
        info!("Reading audio from stdin");
        return pump(&mut tokio::io::stdin(), ingest, &mut pacer, read_size, shutdown).await;
    }

    loop {
        let mut file = tokio::fs::File::open(&source.input)
            .await
            .with_context(|| format!("failed to open input {}", source.input))?;
        info!(input = %source.input, "Reading audio from file");

        let end = pump(&mut file, ingest, &mut pacer, read_size, shutdown).await?;
        if end == PumpEnd::Cancelled || !source.loop_input {
            return Ok(end);
        }
        debug!(inserted = ingest.inserted(), "Restarting input from the beginning");
        pacer.reset();
    }
}
