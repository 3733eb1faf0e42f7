use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// CLI interface for the peer link tool.
#[derive(Parser)]
#[command(name = "peerdroid", about = "Wallet peer link inspector")]
#[command(version)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to a custom configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (repeat for more detail).
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Commands {
    /// Print the wallet's link public key.
    Identity,
    /// List linked peers known to the store.
    Peers,
    /// Delete a stored peer record.
    Forget {
        /// Peer id as printed by `peers`.
        id: String,
    },
    /// Parse a link payload (QR content) and describe it.
    Inspect {
        /// Raw payload text.
        payload: String,
    },
    /// Print the resolved configuration.
    Config,
}

/// Runtime configuration loaded from file, env, and defaults.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LinkConfig {
    /// WebSocket URL of the signaling relay.
    pub relay: String,
    /// STUN/TURN servers for the WebRTC capability.
    pub ice: IceConfig,
    /// Negotiation and teardown deadlines.
    pub timeouts: TimeoutConfig,
    /// Data-channel chunking and reassembly limits.
    pub chunking: ChunkingConfig,
    /// Re-link backoff for confirmed peers.
    pub reconnect: ReconnectConfig,
    /// WebSocket keepalive ping settings.
    pub keepalive: KeepaliveConfig,
    /// Peer-record store file. Defaults to the platform data dir.
    #[serde(default)]
    pub store_path: Option<PathBuf>,
    /// Wallet link identity key file. Defaults to the platform data dir.
    #[serde(default)]
    pub identity_path: Option<PathBuf>,
}

/// ICE server list.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct IceConfig {
    /// `stun:` / `turn:` URLs.
    pub servers: Vec<String>,
}

/// Deadlines, in seconds.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TimeoutConfig {
    /// Whole `link_peer` call, handshake included.
    pub link_secs: u64,
    /// Relay connect plus offer/answer exchange.
    pub offer_secs: u64,
    /// ICE phase, from local answer to open data channel.
    pub ice_secs: u64,
    /// How long teardown waits for a peer task before aborting it.
    pub close_secs: u64,
}

/// Chunking and reassembly limits.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ChunkingConfig {
    /// Largest raw chunk per data-channel frame.
    pub max_chunk_size: usize,
    /// Outbound buffer level at which sends wait for the channel to drain.
    pub max_buffered_bytes: usize,
    /// Largest message accepted from a peer, in bytes.
    pub max_message_bytes: u64,
    /// Partially received messages buffered per peer.
    pub max_pending_messages: usize,
    /// Inactivity window after which a partial message is dropped.
    pub stale_after_secs: u64,
    /// How often partial messages are checked for staleness.
    pub sweep_interval_secs: u64,
}

/// Reconnect backoff parameters.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ReconnectConfig {
    /// Whether confirmed peers are re-linked after a disconnect.
    pub enabled: bool,
    /// Initial delay before the first re-link attempt, in milliseconds.
    pub initial_delay_ms: u64,
    /// Maximum delay between re-link attempts, in milliseconds.
    pub max_delay_ms: u64,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_factor: f64,
}

/// WebSocket keepalive settings.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct KeepaliveConfig {
    /// Interval between keepalive pings, in seconds.
    pub interval_s: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            relay: "wss://signaling-server-rcnet.radixdlt.com/".to_string(),
            ice: IceConfig::default(),
            timeouts: TimeoutConfig::default(),
            chunking: ChunkingConfig::default(),
            reconnect: ReconnectConfig::default(),
            keepalive: KeepaliveConfig::default(),
            store_path: None,
            identity_path: None,
        }
    }
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            link_secs: 60,
            offer_secs: 30,
            ice_secs: 30,
            close_secs: 5,
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: peerdroid_common::chunk::DEFAULT_MAX_CHUNK_SIZE,
            max_buffered_bytes: 1_048_576,
            max_message_bytes: peerdroid_common::chunk::DEFAULT_MAX_MESSAGE_BYTES,
            max_pending_messages: peerdroid_common::chunk::DEFAULT_MAX_PENDING_MESSAGES,
            stale_after_secs: 60,
            sweep_interval_secs: 10,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_ms: 500,
            max_delay_ms: 30000,
            backoff_factor: 2.0,
        }
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self { interval_s: 30 }
    }
}

impl TimeoutConfig {
    /// Whole-link deadline.
    #[must_use]
    pub const fn link(&self) -> Duration {
        Duration::from_secs(self.link_secs)
    }

    /// Offer phase deadline.
    #[must_use]
    pub const fn offer(&self) -> Duration {
        Duration::from_secs(self.offer_secs)
    }

    /// ICE phase deadline.
    #[must_use]
    pub const fn ice(&self) -> Duration {
        Duration::from_secs(self.ice_secs)
    }

    /// Teardown wait.
    #[must_use]
    pub const fn close(&self) -> Duration {
        Duration::from_secs(self.close_secs)
    }
}

impl LinkConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.relay.is_empty() {
            return Err("relay URL must not be empty".to_string());
        }
        if !(self.relay.starts_with("ws://") || self.relay.starts_with("wss://")) {
            return Err(format!(
                "relay URL must start with ws:// or wss://, got: {}",
                self.relay
            ));
        }

        for server in &self.ice.servers {
            if !(server.starts_with("stun:")
                || server.starts_with("turn:")
                || server.starts_with("turns:"))
            {
                return Err(format!(
                    "ice server must start with stun:, turn: or turns:, got: {server}"
                ));
            }
        }

        let t = &self.timeouts;
        if t.link_secs == 0 || t.offer_secs == 0 || t.ice_secs == 0 || t.close_secs == 0 {
            return Err("timeouts must all be greater than 0".to_string());
        }
        if t.link_secs < t.offer_secs {
            return Err("timeouts.link_secs must be >= timeouts.offer_secs".to_string());
        }

        let c = &self.chunking;
        if c.max_chunk_size == 0 {
            return Err("chunking.max_chunk_size must be greater than 0".to_string());
        }
        if c.max_buffered_bytes < c.max_chunk_size {
            return Err("chunking.max_buffered_bytes must be >= max_chunk_size".to_string());
        }
        if c.max_message_bytes < c.max_chunk_size as u64 {
            return Err("chunking.max_message_bytes must be >= max_chunk_size".to_string());
        }
        if c.max_pending_messages == 0 {
            return Err("chunking.max_pending_messages must be greater than 0".to_string());
        }
        if c.stale_after_secs == 0 || c.sweep_interval_secs == 0 {
            return Err(
                "chunking.stale_after_secs and sweep_interval_secs must be greater than 0"
                    .to_string(),
            );
        }

        if self.reconnect.initial_delay_ms == 0 {
            return Err("reconnect.initial_delay_ms must be greater than 0".to_string());
        }
        if self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms {
            return Err("reconnect.max_delay_ms must be >= initial_delay_ms".to_string());
        }
        if !self.reconnect.backoff_factor.is_finite() || self.reconnect.backoff_factor <= 0.0 {
            return Err(
                "reconnect.backoff_factor must be a finite number greater than 0".to_string(),
            );
        }

        if self.keepalive.interval_s == 0 {
            return Err("keepalive.interval_s must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Resolved peer-record store path.
    #[must_use]
    pub fn store_file(&self) -> PathBuf {
        self.store_path
            .clone()
            .unwrap_or_else(|| data_dir().join("peers.toml"))
    }

    /// Resolved identity key path.
    #[must_use]
    pub fn identity_file(&self) -> PathBuf {
        self.identity_path
            .clone()
            .unwrap_or_else(|| data_dir().join("identity.key"))
    }
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("peerdroid")
}

/// # Errors
///
/// Returns an error if the configuration file cannot be read or parsed.
#[allow(clippy::cast_possible_wrap)]
pub fn load_config(path: Option<&Path>) -> anyhow::Result<LinkConfig> {
    let defaults = LinkConfig::default();
    let mut builder = config::Config::builder()
        .set_default("relay", defaults.relay.as_str())?
        .set_default("ice.servers", defaults.ice.servers.clone())?
        .set_default("timeouts.link_secs", defaults.timeouts.link_secs as i64)?
        .set_default("timeouts.offer_secs", defaults.timeouts.offer_secs as i64)?
        .set_default("timeouts.ice_secs", defaults.timeouts.ice_secs as i64)?
        .set_default("timeouts.close_secs", defaults.timeouts.close_secs as i64)?
        .set_default(
            "chunking.max_chunk_size",
            defaults.chunking.max_chunk_size as i64,
        )?
        .set_default(
            "chunking.max_buffered_bytes",
            defaults.chunking.max_buffered_bytes as i64,
        )?
        .set_default(
            "chunking.max_message_bytes",
            defaults.chunking.max_message_bytes as i64,
        )?
        .set_default(
            "chunking.max_pending_messages",
            defaults.chunking.max_pending_messages as i64,
        )?
        .set_default(
            "chunking.stale_after_secs",
            defaults.chunking.stale_after_secs as i64,
        )?
        .set_default(
            "chunking.sweep_interval_secs",
            defaults.chunking.sweep_interval_secs as i64,
        )?
        .set_default("reconnect.enabled", defaults.reconnect.enabled)?
        .set_default(
            "reconnect.initial_delay_ms",
            defaults.reconnect.initial_delay_ms as i64,
        )?
        .set_default(
            "reconnect.max_delay_ms",
            defaults.reconnect.max_delay_ms as i64,
        )?
        .set_default(
            "reconnect.backoff_factor",
            defaults.reconnect.backoff_factor,
        )?
        .set_default("keepalive.interval_s", defaults.keepalive.interval_s as i64)?;

    if let Some(config_path) = path {
        if config_path.exists() {
            builder = builder.add_source(config::File::from(config_path));
        }
    } else if let Some(config_path) = dirs::config_dir()
        .map(|d| d.join("peerdroid").join("config.toml"))
        .filter(|p| p.exists())
    {
        builder = builder.add_source(config::File::from(config_path));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("PEERDROID")
            .prefix_separator("_")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("ice.servers")
            .try_parsing(true),
    );

    let settings = builder.build()?;
    let config: LinkConfig = settings.try_deserialize()?;

    Ok(config)
}
