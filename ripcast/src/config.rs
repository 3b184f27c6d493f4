use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use ripcast_core::{ContentKind, RingBufferConfig};
use ripcast_relay::{IcyResponse, RelayConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub buffer: BufferConfig,
    pub relay: RelaySettings,
    pub source: SourceConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferContent {
    #[default]
    Opaque,
    Paged,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub chunk_size: usize,
    pub chunk_count: usize,
    pub content: BufferContent,
    /// Audio bytes between metadata blocks sent to relay clients. Unset means
    /// `chunk_size` for opaque content and no metadata for paged content; 0
    /// disables metadata.
    pub meta_interval: Option<usize>,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 8192,
            chunk_count: 64,
            content: BufferContent::Opaque,
            meta_interval: None,
        }
    }
}

impl BufferConfig {
    #[must_use]
    pub fn effective_meta_interval(&self) -> Option<usize> {
        match (self.meta_interval, self.content) {
            (Some(0), _) | (None, BufferContent::Paged) => None,
            (Some(interval), _) => Some(interval),
            (None, BufferContent::Opaque) => Some(self.chunk_size),
        }
    }

    #[must_use]
    pub fn ring_config(&self) -> RingBufferConfig {
        let content_kind = match self.content {
            BufferContent::Opaque => ContentKind::Opaque,
            BufferContent::Paged => ContentKind::Paged,
        };
        RingBufferConfig::new(self.chunk_size, self.chunk_count)
            .with_content_kind(content_kind)
            .with_meta_interval(self.effective_meta_interval())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    pub host: String,
    pub port: u16,
    pub max_port: u16,
    pub search_ports: bool,
    /// 0 means unlimited
    pub max_clients: usize,
    pub burst_bytes: usize,
    pub send_interval_ms: u64,
    pub header_timeout_ms: u64,
    pub max_header_bytes: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        let defaults = RelayConfig::default();
        Self {
            host: defaults.host,
            port: defaults.port,
            max_port: defaults.max_port,
            search_ports: defaults.search_ports,
            max_clients: defaults.max_clients,
            burst_bytes: defaults.burst_bytes,
            send_interval_ms: 50,
            header_timeout_ms: 5000,
            max_header_bytes: defaults.max_header_bytes,
        }
    }
}

impl RelaySettings {
    #[must_use]
    pub fn to_relay_config(&self) -> RelayConfig {
        RelayConfig {
            host: self.host.clone(),
            port: self.port,
            max_port: self.max_port,
            search_ports: self.search_ports,
            max_clients: self.max_clients,
            burst_bytes: self.burst_bytes,
            send_interval: Duration::from_millis(self.send_interval_ms),
            header_timeout: Duration::from_millis(self.header_timeout_ms),
            max_header_bytes: self.max_header_bytes,
            ..RelayConfig::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// File path, or "-" for stdin
    pub input: String,
    pub content_type: String,
    pub name: Option<String>,
    pub genre: Option<String>,
    pub url: Option<String>,
    /// Input is paced at this rate when set.
    pub bitrate_kbps: Option<u32>,
    /// Set when the input carries ICY metadata every this many audio bytes.
    pub upstream_meta_interval: Option<usize>,
    pub loop_input: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            input: "-".to_string(),
            content_type: "audio/mpeg".to_string(),
            name: None,
            genre: None,
            url: None,
            bitrate_kbps: Some(128),
            upstream_meta_interval: None,
            loop_input: false,
        }
    }
}

impl SourceConfig {
    #[must_use]
    pub fn is_stdin(&self) -> bool {
        self.input == "-"
    }

    /// Response header fields for relay clients.
    #[must_use]
    pub fn icy_response(&self, meta_interval: Option<usize>) -> IcyResponse {
        IcyResponse {
            content_type: self.content_type.clone(),
            name: self.name.clone(),
            genre: self.genre.clone(),
            url: self.url.clone(),
            bitrate_kbps: self.bitrate_kbps,
            meta_interval,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // RIPCAST_RELAY__PORT, RIPCAST_BUFFER__CHUNK_SIZE, ...
        builder = builder.add_source(
            Environment::with_prefix("RIPCAST")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Check the whole configuration, reporting every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.buffer.chunk_size == 0 {
            errors.push("buffer.chunk_size must be greater than zero".to_string());
        }
        if self.buffer.chunk_count == 0 {
            errors.push("buffer.chunk_count must be greater than zero".to_string());
        }
        if self.buffer.content == BufferContent::Paged
            && self.buffer.meta_interval.is_some_and(|interval| interval > 0)
        {
            errors.push("buffer.meta_interval cannot be used with paged content".to_string());
        }

        if self.relay.search_ports && self.relay.max_port < self.relay.port {
            errors.push(format!(
                "relay.max_port {} is below relay.port {}",
                self.relay.max_port, self.relay.port
            ));
        }
        if self.relay.send_interval_ms == 0 {
            errors.push("relay.send_interval_ms must be greater than zero".to_string());
        }
        if self.relay.header_timeout_ms == 0 {
            errors.push("relay.header_timeout_ms must be greater than zero".to_string());
        }
        if self.relay.max_header_bytes == 0 {
            errors.push("relay.max_header_bytes must be greater than zero".to_string());
        }

        if self.source.bitrate_kbps == Some(0) {
            errors.push("source.bitrate_kbps must be greater than zero".to_string());
        }
        if self.source.upstream_meta_interval == Some(0) {
            errors.push("source.upstream_meta_interval must be greater than zero".to_string());
        }
        if self.source.input.is_empty() {
            errors.push("source.input must name a file or \"-\" for stdin".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
