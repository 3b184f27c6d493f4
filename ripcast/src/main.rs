mod config;
mod ingest;
mod logging;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use ripcast_core::RingBuffer;
use ripcast_relay::{RelayServer, RelaySource, ResponseHeader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::ingest::{Ingest, PumpEnd};

#[derive(Parser, Debug)]
#[command(name = "ripcast")]
#[command(about = "Buffer a live audio stream and relay it to listeners", long_about = None)]
struct Args {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, env = "RIPCAST_CONFIG")]
    config: Option<String>,

    /// Audio input, a file path or "-" for stdin
    #[arg(short, long)]
    input: Option<String>,

    /// First relay port to try
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(input) = args.input {
        config.source.input = input;
    }
    if let Some(port) = args.port {
        config.relay.port = port;
    }
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("ripcast starting...");

    // 3. Ring buffer and relay
    let buffer = Arc::new(RingBuffer::new(config.buffer.ring_config())?);
    info!(
        capacity = buffer.capacity(),
        meta_interval = ?buffer.meta_interval(),
        content = ?buffer.content_kind(),
        "Ring buffer ready"
    );

    let relay = RelayServer::start(config.relay.to_relay_config()).await?;
    relay.attach(RelaySource {
        buffer: Arc::clone(&buffer),
        header: ResponseHeader::Generated(config.source.icy_response(buffer.meta_interval())),
    });
    info!("Relay listening on {}", relay.local_addr());

    // 4. Feed the buffer until the input ends or we are told to stop
    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let mut ingest = Ingest::new(Arc::clone(&buffer), config.source.upstream_meta_interval)?;
    let outcome = ingest::run(
        &config.source,
        &mut ingest,
        config.buffer.chunk_size,
        &shutdown,
    )
    .await;

    let inserted = ingest.inserted();
    let last_title = ingest.current_title().unwrap_or("-");
    match &outcome {
        Ok(PumpEnd::EndOfInput) => info!(inserted, last_title, "Input finished"),
        Ok(PumpEnd::Cancelled) => info!(inserted, last_title, "Input stopped"),
        Err(e) => error!("Input failed: {e:#}"),
    }

    // 5. Graceful shutdown
    relay.detach();
    relay.stop().await;
    info!("ripcast stopped");

    outcome.map(|_| ())
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    shutdown.cancel();
}
