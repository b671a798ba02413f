//! Configuration management for the relay daemon.
//!
//! The configuration is a single TOML file. On first run, if no file exists
//! at the requested path, one is generated with defaults for the requested
//! role. Every component receives its section at construction time, so
//! several independent nodes can live in one process.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants;
use crate::error::ConfigError;
use crate::types::{generate_node_id, GeoCoordinate, NodeKind, Partition};

/// Get the platform-specific data directory
pub fn get_data_dir() -> PathBuf {
    if cfg!(windows) {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("meshrelay")
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".meshrelay")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Runs consensus and serves forwarded transactions
    Core,
    /// Admits, routes and forwards transactions
    Relay,
    /// Relay plus the multi-target bridge front door
    Bridge,
}

impl NodeRole {
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeRole::Core => NodeKind::Core,
            NodeRole::Relay | NodeRole::Bridge => NodeKind::Relay,
        }
    }
}

impl std::str::FromStr for NodeRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "core" => Ok(NodeRole::Core),
            "relay" => Ok(NodeRole::Relay),
            "bridge" => Ok(NodeRole::Bridge),
            other => Err(format!("unknown role '{}' (must be core/relay/bridge)", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    pub network: NetworkConfig,
    pub rpc: RpcConfig,
    pub consensus: ConsensusConfig,
    pub heartbeat: HeartbeatConfig,
    pub rate_limit: RateLimitConfig,
    pub routing: RoutingConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Generated on first load when empty
    #[serde(default)]
    pub node_id: String,
    pub role: NodeRole,
    #[serde(default = "default_partition")]
    pub partition: Partition,
    #[serde(default)]
    pub coordinate: Option<GeoCoordinate>,
}

fn default_partition() -> Partition {
    Partition::Alpha
}

/// A core node the relay probes and may route to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoreNodeEntry {
    pub node_id: String,
    pub address: String,
    pub partition: Partition,
    #[serde(default)]
    pub coordinate: Option<GeoCoordinate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Core nodes serve the forwarding transport on this address
    pub listen_address: String,
    #[serde(default)]
    pub core_nodes: Vec<CoreNodeEntry>,
    #[serde(default = "default_forward_timeout_ms")]
    pub forward_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    /// Endpoint names the bridge accepts, all served by the local relay
    #[serde(default = "default_bridge_targets")]
    pub bridge_targets: Vec<String>,
}

fn default_forward_timeout_ms() -> u64 {
    constants::network::FORWARD_TIMEOUT_MS
}

fn default_connect_timeout_ms() -> u64 {
    constants::network::CONNECT_TIMEOUT_MS
}

fn default_probe_interval_ms() -> u64 {
    constants::heartbeat::PROBE_INTERVAL_MS
}

fn default_bridge_targets() -> Vec<String> {
    vec!["default".to_string()]
}

impl NetworkConfig {
    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    pub enabled: bool,
    pub listen_address: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ConsensusMode {
    /// Commit after a fixed processing delay bounded by the deadline
    TrivialDelay,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    #[serde(default = "default_consensus_mode")]
    pub mode: ConsensusMode,
    pub deadline_ms: u64,
    #[serde(default = "default_processing_delay_ms")]
    pub processing_delay_ms: u64,
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
}

fn default_consensus_mode() -> ConsensusMode {
    ConsensusMode::TrivialDelay
}

fn default_processing_delay_ms() -> u64 {
    constants::consensus::PROCESSING_DELAY_MS
}

fn default_max_payload_bytes() -> usize {
    constants::consensus::MAX_PAYLOAD_BYTES
}

impl ConsensusConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    pub fn processing_delay(&self) -> Duration {
        Duration::from_millis(self.processing_delay_ms)
    }
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            mode: ConsensusMode::TrivialDelay,
            deadline_ms: constants::consensus::DEADLINE_MS,
            processing_delay_ms: constants::consensus::PROCESSING_DELAY_MS,
            max_payload_bytes: constants::consensus::MAX_PAYLOAD_BYTES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    pub stale_after_ms: u64,
    pub unreachable_after_ms: u64,
    #[serde(default = "default_evict_after_ms")]
    pub evict_after_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_max_probe_failures")]
    pub max_probe_failures: u32,
}

fn default_evict_after_ms() -> u64 {
    constants::heartbeat::EVICT_AFTER_MS
}

fn default_sweep_interval_ms() -> u64 {
    constants::heartbeat::SWEEP_INTERVAL_MS
}

fn default_max_probe_failures() -> u32 {
    constants::heartbeat::MAX_PROBE_FAILURES
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            stale_after_ms: constants::heartbeat::STALE_AFTER_MS,
            unreachable_after_ms: constants::heartbeat::UNREACHABLE_AFTER_MS,
            evict_after_ms: constants::heartbeat::EVICT_AFTER_MS,
            sweep_interval_ms: constants::heartbeat::SWEEP_INTERVAL_MS,
            max_probe_failures: constants::heartbeat::MAX_PROBE_FAILURES,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub capacity_per_window: u32,
    pub window_ms: u64,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity_per_window: constants::rate_limit::CAPACITY_PER_WINDOW,
            window_ms: constants::rate_limit::WINDOW_MS,
        }
    }
}

/// Routing weights. `latency` and `proximity` scale their terms;
/// `affinity` is the bonus added on a partition match.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RoutingConfig {
    pub latency: f64,
    pub proximity: f64,
    pub affinity: f64,
    #[serde(default = "default_latency_ceiling_ms")]
    pub latency_ceiling_ms: f64,
    #[serde(default = "default_distance_ceiling_m")]
    pub distance_ceiling_m: f64,
}

fn default_latency_ceiling_ms() -> f64 {
    constants::routing::LATENCY_CEILING_MS
}

fn default_distance_ceiling_m() -> f64 {
    constants::routing::DISTANCE_CEILING_M
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            latency: 1.0,
            proximity: 1.0,
            affinity: constants::routing::AFFINITY_BONUS,
            latency_ceiling_ms: constants::routing::LATENCY_CEILING_MS,
            distance_ceiling_m: constants::routing::DISTANCE_CEILING_M,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    /// "pretty" or "json"
    pub format: String,
    /// "stdout" or "file"
    pub output: String,
    pub file_path: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            output: "stdout".to_string(),
            file_path: "./logs/relayd.log".to_string(),
        }
    }
}

impl Config {
    pub fn for_role(role: NodeRole) -> Self {
        let (listen_port, rpc_port) = match role {
            NodeRole::Core => (
                constants::network::DEFAULT_CORE_PORT,
                constants::network::DEFAULT_CORE_PORT + 1,
            ),
            NodeRole::Relay | NodeRole::Bridge => (
                constants::network::DEFAULT_RPC_PORT + 1,
                constants::network::DEFAULT_RPC_PORT,
            ),
        };

        Self {
            node: NodeConfig {
                node_id: String::new(),
                role,
                partition: Partition::Alpha,
                coordinate: None,
            },
            network: NetworkConfig {
                listen_address: format!("0.0.0.0:{}", listen_port),
                core_nodes: vec![],
                forward_timeout_ms: constants::network::FORWARD_TIMEOUT_MS,
                connect_timeout_ms: constants::network::CONNECT_TIMEOUT_MS,
                probe_interval_ms: constants::heartbeat::PROBE_INTERVAL_MS,
                bridge_targets: default_bridge_targets(),
            },
            rpc: RpcConfig {
                enabled: true,
                listen_address: format!("127.0.0.1:{}", rpc_port),
            },
            consensus: ConsensusConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            rate_limit: RateLimitConfig::default(),
            routing: RoutingConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Default config for `role` with a freshly assigned node id.
    pub fn generate(role: NodeRole) -> Self {
        let mut config = Config::for_role(role);
        config.ensure_node_id();
        config
    }

    /// Load and validate `path`. A file without a node id gets one assigned
    /// and written back so the identity survives restarts.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        let assigned = config.ensure_node_id();
        config.validate()?;
        if assigned {
            config.save_to_file(path)?;
            tracing::info!("🆔 Assigned node id {} in {}", config.node.node_id, path.display());
        }
        Ok(config)
    }

    /// Load `path`, or write a default config for `role` there and return it.
    pub fn load_or_create(path: impl AsRef<Path>, role: NodeRole) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load_from_file(path);
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let config = Config::generate(role);
        config.validate()?;
        config.save_to_file(path)?;
        tracing::info!("📝 Generated default {:?} config at {}", role, path.display());
        Ok(config)
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    // true when a new id was assigned
    fn ensure_node_id(&mut self) -> bool {
        if !self.node.node_id.trim().is_empty() {
            return false;
        }
        self.node.node_id = generate_node_id(self.node.role.kind());
        true
    }

    /// Reject configurations that cannot work. Called at startup only.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.node.node_id.trim().is_empty() {
            return invalid("node.node_id must not be empty".into());
        }
        if let Some(coord) = &self.node.coordinate {
            if !coord.is_valid() {
                return invalid(format!("node.coordinate out of range: {:?}", coord));
            }
        }
        if self.rate_limit.capacity_per_window == 0 {
            return invalid("rate_limit.capacity_per_window must be > 0".into());
        }
        if self.rate_limit.window_ms == 0 {
            return invalid("rate_limit.window_ms must be > 0".into());
        }
        if self.consensus.deadline_ms == 0 {
            return invalid("consensus.deadline_ms must be > 0".into());
        }
        if self.consensus.processing_delay_ms >= self.consensus.deadline_ms {
            return invalid(format!(
                "consensus.processing_delay_ms ({}) must be below deadline_ms ({})",
                self.consensus.processing_delay_ms, self.consensus.deadline_ms
            ));
        }
        if self.consensus.max_payload_bytes == 0 {
            return invalid("consensus.max_payload_bytes must be > 0".into());
        }
        if self.heartbeat.stale_after_ms == 0 {
            return invalid("heartbeat.stale_after_ms must be > 0".into());
        }
        if self.heartbeat.unreachable_after_ms <= self.heartbeat.stale_after_ms {
            return invalid(format!(
                "heartbeat.unreachable_after_ms ({}) must exceed stale_after_ms ({})",
                self.heartbeat.unreachable_after_ms, self.heartbeat.stale_after_ms
            ));
        }
        if self.heartbeat.evict_after_ms < self.heartbeat.unreachable_after_ms {
            return invalid("heartbeat.evict_after_ms must be >= unreachable_after_ms".into());
        }
        if self.heartbeat.sweep_interval_ms == 0 || self.network.probe_interval_ms == 0 {
            return invalid("sweep and probe intervals must be > 0".into());
        }
        // A node answering every health check must never look stale between rounds
        let probe_span = self.network.probe_interval_ms + self.network.forward_timeout_ms;
        if self.heartbeat.stale_after_ms <= probe_span {
            return invalid(format!(
                "heartbeat.stale_after_ms ({}) must exceed probe_interval_ms + forward_timeout_ms ({})",
                self.heartbeat.stale_after_ms, probe_span
            ));
        }
        if self.heartbeat.max_probe_failures == 0 {
            return invalid("heartbeat.max_probe_failures must be > 0".into());
        }
        if self.network.forward_timeout_ms == 0 {
            return invalid("network.forward_timeout_ms must be > 0".into());
        }

        let r = &self.routing;
        for (name, value) in [
            ("latency", r.latency),
            ("proximity", r.proximity),
            ("affinity", r.affinity),
        ] {
            if !value.is_finite() || value < 0.0 {
                return invalid(format!("routing.{} must be a non-negative number", name));
            }
        }
        if !(r.latency_ceiling_ms > 0.0) || !(r.distance_ceiling_m > 0.0) {
            return invalid("routing ceilings must be > 0".into());
        }

        for entry in &self.network.core_nodes {
            if entry.node_id.is_empty() || entry.address.is_empty() {
                return invalid("network.core_nodes entries need node_id and address".into());
            }
        }
        if self.node.role == NodeRole::Bridge && self.network.bridge_targets.is_empty() {
            return invalid("bridge role needs at least one network.bridge_targets entry".into());
        }

        match self.logging.format.as_str() {
            "pretty" | "json" => {}
            other => return invalid(format!("logging.format '{}' (pretty/json)", other)),
        }
        match self.logging.output.as_str() {
            "stdout" | "file" => Ok(()),
            other => invalid(format!("logging.output '{}' (stdout/file)", other)),
        }
    }
}
