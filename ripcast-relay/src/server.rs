// Relay server
//
// Two activities share one `RelayShared`:
// - the accept loop binds the listener, reads each client's request header
//   under a timeout, reserves a client slot, sends the response header and
//   hands the admitted session over a channel;
// - the distribution loop owns every live session and, on a fixed tick,
//   pumps each one from the attached ring buffer without blocking.
//
// The ring buffer and response header are attached per upstream session.
// Re-attaching or detaching drops every client admitted under the previous
// source. Shutdown is cooperative through a `CancellationToken`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use ripcast_core::RingBuffer;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{RelayError, Result};
use crate::request::{read_request, DEFAULT_MAX_HEADER_BYTES};
use crate::response::ResponseHeader;
use crate::session::{PumpLimits, RelayClientSession};

/// Admitted sessions waiting to join the distribution loop.
const NEW_SESSION_CHANNEL_CAPACITY: usize = 64;
/// Pause after a failed accept before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);
/// How long `stop` waits for each activity to finish.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub host: String,
    /// First port tried. With `search_ports` off, port 0 binds an ephemeral port.
    pub port: u16,
    /// Last port tried when `search_ports` is on.
    pub max_port: u16,
    pub search_ports: bool,
    /// Maximum concurrent clients, 0 for unlimited.
    pub max_clients: usize,
    pub burst_bytes: usize,
    pub max_send_bytes: usize,
    pub max_extracts_per_round: usize,
    pub send_interval: Duration,
    pub header_timeout: Duration,
    pub max_header_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let limits = PumpLimits::default();
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            max_port: 18000,
            search_ports: true,
            max_clients: 0,
            burst_bytes: limits.burst_bytes,
            max_send_bytes: limits.max_send_bytes,
            max_extracts_per_round: limits.max_extracts,
            send_interval: Duration::from_millis(50),
            header_timeout: Duration::from_secs(5),
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<()> {
        if self.search_ports && self.max_port < self.port {
            return Err(RelayError::InvalidConfig(format!(
                "max_port {} is below port {}",
                self.max_port, self.port
            )));
        }
        if self.send_interval.is_zero() {
            return Err(RelayError::InvalidConfig(
                "send_interval must be greater than zero".to_string(),
            ));
        }
        if self.max_send_bytes == 0 || self.max_extracts_per_round == 0 {
            return Err(RelayError::InvalidConfig(
                "max_send_bytes and max_extracts_per_round must be greater than zero".to_string(),
            ));
        }
        if self.max_header_bytes == 0 {
            return Err(RelayError::InvalidConfig(
                "max_header_bytes must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub const fn pump_limits(&self) -> PumpLimits {
        PumpLimits {
            burst_bytes: self.burst_bytes,
            max_send_bytes: self.max_send_bytes,
            max_extracts: self.max_extracts_per_round,
        }
    }

    const fn last_port(&self) -> u16 {
        if self.search_ports {
            self.max_port
        } else {
            self.port
        }
    }
}

/// The stream a relay serves: one ring buffer and the header clients get.
#[derive(Debug, Clone)]
pub struct RelaySource {
    pub buffer: Arc<RingBuffer>,
    pub header: ResponseHeader,
}

struct AttachedSource {
    generation: u64,
    source: Arc<RelaySource>,
}

struct RelayShared {
    config: RelayConfig,
    source: RwLock<Option<AttachedSource>>,
    generations: AtomicU64,
    clients: Arc<AtomicUsize>,
    next_client_id: AtomicU64,
}

impl RelayShared {
    fn current_source(&self) -> Option<(u64, Arc<RelaySource>)> {
        self.source
            .read()
            .as_ref()
            .map(|attached| (attached.generation, Arc::clone(&attached.source)))
    }

    fn reserve_slot(&self) -> Result<ClientSlot> {
        let max = self.config.max_clients;
        self.clients
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (max == 0 || n < max).then_some(n + 1)
            })
            .map_err(|current| RelayError::Full { current, max })?;
        Ok(ClientSlot(Arc::clone(&self.clients)))
    }
}

/// One reserved client slot, released on drop.
struct ClientSlot(Arc<AtomicUsize>);

impl Drop for ClientSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

struct LiveClient {
    session: RelayClientSession,
    generation: u64,
    _slot: ClientSlot,
}

pub struct RelayServer {
    shared: Arc<RelayShared>,
    local_addr: SocketAddr,
    shutdown_token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RelayServer {
    /// Bind the listener and start the accept and distribution activities.
    pub async fn start(config: RelayConfig) -> Result<Self> {
        config.validate()?;
        let listener = bind_listener(&config).await?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(RelayShared {
            config,
            source: RwLock::new(None),
            generations: AtomicU64::new(0),
            clients: Arc::new(AtomicUsize::new(0)),
            next_client_id: AtomicU64::new(1),
        });
        let shutdown_token = CancellationToken::new();
        let (session_tx, session_rx) = mpsc::channel(NEW_SESSION_CHANNEL_CAPACITY);

        let tasks = vec![
            tokio::spawn(accept_loop(
                listener,
                Arc::clone(&shared),
                session_tx,
                shutdown_token.clone(),
            )),
            tokio::spawn(distribute_loop(
                Arc::clone(&shared),
                session_rx,
                shutdown_token.clone(),
            )),
        ];

        info!(
            %local_addr,
            max_clients = shared.config.max_clients,
            "Relay server listening"
        );

        Ok(Self {
            shared,
            local_addr,
            shutdown_token,
            tasks,
        })
    }

    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns a `CancellationToken` that can be used to signal graceful shutdown.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.shutdown_token.is_cancelled()
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.shared.clients.load(Ordering::Acquire)
    }

    /// Serve `source` to new clients, replacing any previous source.
    pub fn attach(&self, source: RelaySource) {
        let generation = self.shared.generations.fetch_add(1, Ordering::AcqRel) + 1;
        let replaced = self
            .shared
            .source
            .write()
            .replace(AttachedSource {
                generation,
                source: Arc::new(source),
            })
            .is_some();
        info!(generation, replaced, "Relay source attached");
    }

    /// Stop serving the current source. Live clients are dropped on the next round.
    pub fn detach(&self) {
        if self.shared.source.write().take().is_some() {
            info!("Relay source detached");
        }
    }

    /// Stop both activities, close every client and the listener.
    pub async fn stop(mut self) {
        self.shutdown_token.cancel();
        for handle in std::mem::take(&mut self.tasks) {
            match timeout(STOP_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(error = %err, "Relay task failed"),
                Err(_) => warn!(timeout = ?STOP_TIMEOUT, "Relay task did not stop in time"),
            }
        }
        info!(local_addr = %self.local_addr, "Relay server stopped");
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}

/// Bind the first available port in the configured range.
async fn bind_listener(config: &RelayConfig) -> Result<TcpListener> {
    let last = config.last_port();
    for port in config.port..=last {
        match TcpListener::bind((config.host.as_str(), port)).await {
            Ok(listener) => return Ok(listener),
            Err(err) => debug!(port, error = %err, "Relay port unavailable"),
        }
    }
    Err(RelayError::NoPortAvailable {
        first: config.port,
        last,
    })
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<RelayShared>,
    session_tx: mpsc::Sender<LiveClient>,
    shutdown_token: CancellationToken,
) {
    loop {
        tokio::select! {
            () = shutdown_token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let shared = Arc::clone(&shared);
                    let session_tx = session_tx.clone();
                    let token = shutdown_token.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            () = token.cancelled() => {}
                            admitted = admit(stream, peer, &shared) => match admitted {
                                Ok(client) => {
                                    // A closed channel means shutdown; the slot is released on drop.
                                    let _ = session_tx.send(client).await;
                                }
                                Err(err) => info!(%peer, error = %err, "Relay client rejected"),
                            }
                        }
                    });
                }
                Err(err) => {
                    warn!(error = %err, "Relay accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }
    info!("Relay accept loop stopped");
}

/// Run the handshake for one connection.
async fn admit(mut stream: TcpStream, peer: SocketAddr, shared: &RelayShared) -> Result<LiveClient> {
    let config = &shared.config;
    let (generation, source) = shared.current_source().ok_or(RelayError::NotReady)?;
    let slot = shared.reserve_slot()?;

    let request = timeout(
        config.header_timeout,
        read_request(&mut stream, config.max_header_bytes),
    )
    .await
    .map_err(|_| RelayError::HeaderTimeout(config.header_timeout))??;

    let wants_metadata = request.wants_metadata && source.buffer.meta_interval().is_some();
    let header = source.header.render(wants_metadata);
    timeout(config.header_timeout, stream.write_all(&header))
        .await
        .map_err(|_| RelayError::HeaderTimeout(config.header_timeout))??;
    if let Err(err) = stream.set_nodelay(true) {
        debug!(%peer, error = %err, "Failed to set TCP_NODELAY");
    }

    let id = shared.next_client_id.fetch_add(1, Ordering::Relaxed);
    info!(
        client_id = id,
        %peer,
        wants_metadata,
        user_agent = request.user_agent.as_deref().unwrap_or("-"),
        "Relay client admitted"
    );
    Ok(LiveClient {
        session: RelayClientSession::new(id, peer, stream, wants_metadata),
        generation,
        _slot: slot,
    })
}

async fn distribute_loop(
    shared: Arc<RelayShared>,
    mut session_rx: mpsc::Receiver<LiveClient>,
    shutdown_token: CancellationToken,
) {
    let mut clients: Vec<LiveClient> = Vec::new();
    let mut ticker = tokio::time::interval(shared.config.send_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let limits = shared.config.pump_limits();

    loop {
        tokio::select! {
            () = shutdown_token.cancelled() => break,
            Some(client) = session_rx.recv() => clients.push(client),
            _ = ticker.tick() => distribute_round(&shared, &mut clients, limits),
        }
    }

    let dropped = clients.len();
    clients.clear();
    info!(dropped, "Relay distribution loop stopped");
}

fn distribute_round(shared: &RelayShared, clients: &mut Vec<LiveClient>, limits: PumpLimits) {
    if clients.is_empty() {
        return;
    }
    let current = shared.current_source();

    clients.retain_mut(|client| {
        let session = &mut client.session;
        let source = match &current {
            Some((generation, source)) if *generation == client.generation => source,
            _ => {
                info!(
                    client_id = session.id(),
                    peer = %session.peer(),
                    "Dropping relay client of a detached stream"
                );
                return false;
            }
        };

        match session.pump(&source.buffer, limits) {
            Ok(()) => true,
            Err(err) => {
                info!(
                    client_id = session.id(),
                    peer = %session.peer(),
                    bytes_sent = session.bytes_sent(),
                    overruns = session.overruns(),
                    connected_secs = session.connected_at().elapsed().as_secs(),
                    error = %err,
                    "Relay client disconnected"
                );
                false
            }
        }
    });
}
