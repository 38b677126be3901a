//! Configuration for the node

use crate::{NodeError, Result};
use ash_ledger::{PublicKey, StoreConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// WebSocket listen address
    pub listen_addr: String,

    /// Peer URLs to dial (`ws://host:port`)
    pub peers: Vec<String>,

    /// Optional file with one peer URL per line
    pub peers_file: Option<PathBuf>,

    /// Hex-encoded Ed25519 seed, created on first start
    pub key_file: PathBuf,

    /// Ledger store configuration
    pub store: StoreConfig,

    /// Maximum payload size (bytes)
    pub max_frame_size: usize,

    /// Outbound queue capacity per session
    pub session_queue_capacity: usize,

    /// Replication actor mailbox capacity
    pub mailbox_capacity: usize,

    /// Handshake deadline (milliseconds)
    pub handshake_timeout_ms: u64,

    /// Drop a session after this long without inbound traffic (milliseconds)
    pub idle_timeout_ms: u64,

    /// Ping interval (milliseconds)
    pub ping_interval_ms: u64,

    /// Upper bound on flushing a draining session (milliseconds)
    pub drain_timeout_ms: u64,

    /// Verification failures tolerated per session before it is closed
    pub failure_threshold: u32,

    /// Out-of-order envelopes buffered while a gap is caught up
    pub max_pending: usize,

    /// Entries served per catch-up request
    pub catchup_batch_size: u64,

    /// Re-issue an unanswered catch-up request after this long (milliseconds)
    pub catchup_timeout_ms: u64,

    /// Redial policy for outbound peers
    pub reconnect: ReconnectConfig,

    /// Hex public keys allowed to connect (empty = any)
    pub allowed_peers: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:7420".to_string(),
            peers: Vec::new(),
            peers_file: None,
            key_file: PathBuf::from("./data/node.key"),
            store: StoreConfig::default(),
            max_frame_size: 1024 * 1024, // 1 MiB
            session_queue_capacity: 1000,
            mailbox_capacity: 1000,
            handshake_timeout_ms: 5_000,
            idle_timeout_ms: 30_000,
            ping_interval_ms: 10_000,
            drain_timeout_ms: 2_000,
            failure_threshold: 3,
            max_pending: 4096,
            catchup_batch_size: 512,
            catchup_timeout_ms: 5_000,
            reconnect: ReconnectConfig::default(),
            allowed_peers: Vec::new(),
        }
    }
}

/// Exponential redial policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// First retry delay (milliseconds)
    pub initial_ms: u64,

    /// Maximum retry delay (milliseconds)
    pub max_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_ms: 500,
            max_ms: 30_000,
        }
    }
}

impl NodeConfig {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: NodeConfig = toml::from_str(&content)
            .map_err(|e| NodeError::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = NodeConfig::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Override fields from `ASH_*` environment variables
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("ASH_LISTEN_ADDR") {
            self.listen_addr = addr;
        }

        if let Ok(peers) = std::env::var("ASH_PEERS") {
            self.peers = split_list(&peers);
        }

        if let Ok(path) = std::env::var("ASH_PEERS_FILE") {
            self.peers_file = Some(PathBuf::from(path));
        }

        if let Ok(path) = std::env::var("ASH_KEY_FILE") {
            self.key_file = PathBuf::from(path);
        }

        if let Ok(data_dir) = std::env::var("ASH_DATA_DIR") {
            self.store.data_dir = PathBuf::from(data_dir);
        }

        env_override("ASH_MAX_FRAME_SIZE", &mut self.max_frame_size)?;
        env_override("ASH_SESSION_QUEUE_CAPACITY", &mut self.session_queue_capacity)?;
        env_override("ASH_MAILBOX_CAPACITY", &mut self.mailbox_capacity)?;
        env_override("ASH_HANDSHAKE_TIMEOUT_MS", &mut self.handshake_timeout_ms)?;
        env_override("ASH_IDLE_TIMEOUT_MS", &mut self.idle_timeout_ms)?;
        env_override("ASH_PING_INTERVAL_MS", &mut self.ping_interval_ms)?;
        env_override("ASH_DRAIN_TIMEOUT_MS", &mut self.drain_timeout_ms)?;
        env_override("ASH_FAILURE_THRESHOLD", &mut self.failure_threshold)?;
        env_override("ASH_MAX_PENDING", &mut self.max_pending)?;
        env_override("ASH_CATCHUP_BATCH_SIZE", &mut self.catchup_batch_size)?;
        env_override("ASH_CATCHUP_TIMEOUT_MS", &mut self.catchup_timeout_ms)?;
        env_override("ASH_RECONNECT_INITIAL_MS", &mut self.reconnect.initial_ms)?;
        env_override("ASH_RECONNECT_MAX_MS", &mut self.reconnect.max_ms)?;

        if let Ok(keys) = std::env::var("ASH_ALLOWED_PEERS") {
            self.allowed_peers = split_list(&keys);
        }

        Ok(())
    }

    /// Reject values the node cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(NodeError::Config(format!(
                "listen_addr {:?} is not a socket address",
                self.listen_addr
            )));
        }

        let positive = [
            ("max_frame_size", self.max_frame_size as u64),
            ("session_queue_capacity", self.session_queue_capacity as u64),
            ("mailbox_capacity", self.mailbox_capacity as u64),
            ("handshake_timeout_ms", self.handshake_timeout_ms),
            ("idle_timeout_ms", self.idle_timeout_ms),
            ("ping_interval_ms", self.ping_interval_ms),
            ("catchup_batch_size", self.catchup_batch_size),
            ("max_pending", self.max_pending as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(NodeError::Config(format!("{} must be positive", name)));
            }
        }

        // A full catch-up batch must fit in an idle session's queue
        if self.catchup_batch_size >= self.session_queue_capacity as u64 {
            return Err(NodeError::Config(format!(
                "catchup_batch_size ({}) must be below session_queue_capacity ({})",
                self.catchup_batch_size, self.session_queue_capacity
            )));
        }

        if self.reconnect.initial_ms == 0 || self.reconnect.initial_ms > self.reconnect.max_ms {
            return Err(NodeError::Config(
                "reconnect.initial_ms must be positive and at most reconnect.max_ms".to_string(),
            ));
        }

        for url in &self.peers {
            peer_authority(url)?;
        }

        self.allowed_keys()?;
        self.store.validate()?;
        Ok(())
    }

    /// Parsed `allowed_peers`
    pub fn allowed_keys(&self) -> Result<Vec<PublicKey>> {
        self.allowed_peers
            .iter()
            .map(|hex| {
                PublicKey::from_hex(hex)
                    .ok_or_else(|| NodeError::Config(format!("Invalid peer key {:?}", hex)))
            })
            .collect()
    }

    /// Configured peers plus those listed in `peers_file`, deduplicated
    pub fn load_peers(&self) -> Result<Vec<String>> {
        let mut peers = self.peers.clone();

        if let Some(path) = &self.peers_file {
            let content = std::fs::read_to_string(path)?;
            for line in content.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                peer_authority(line)?;
                peers.push(line.to_string());
            }
        }

        let mut seen = std::collections::HashSet::new();
        peers.retain(|url| seen.insert(url.clone()));
        Ok(peers)
    }

    /// Handshake deadline
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Idle cutoff
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Ping interval
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Drain bound
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// `host:port` part of a `ws://host:port[/path]` URL
pub fn peer_authority(url: &str) -> Result<&str> {
    let rest = url
        .strip_prefix("ws://")
        .ok_or_else(|| NodeError::Config(format!("Peer URL {:?} must start with ws://", url)))?;
    let authority = rest.split('/').next().unwrap_or(rest);

    match authority.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(authority),
        _ => Err(NodeError::Config(format!(
            "Peer URL {:?} must name host and port",
            url
        ))),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn env_override<T: std::str::FromStr>(name: &str, field: &mut T) -> Result<()> {
    if let Ok(value) = std::env::var(name) {
        *field = parse_env(name, &value)?;
    }
    Ok(())
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| NodeError::Config(format!("{} has invalid value {:?}", name, value)))
}
