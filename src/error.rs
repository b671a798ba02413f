use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Typed outcome of a request that did not commit.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineError {
    #[error("Rate limited: {node_id} reached {capacity} requests per {window_ms}ms window")]
    RateLimited {
        node_id: String,
        capacity: u32,
        window_ms: u64,
    },

    #[error("No route available: no healthy core node")]
    NoRouteAvailable,

    #[error("Upstream failure at {node_id}: {reason}")]
    UpstreamFailure { node_id: String, reason: String },

    #[error("Consensus rejected: {0}")]
    ConsensusRejected(String),

    #[error("Consensus timed out after {elapsed_ms}ms")]
    ConsensusTimedOut { elapsed_ms: u64 },
}

impl PipelineError {
    /// Everything except an invalid payload may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, PipelineError::ConsensusRejected(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::RateLimited { .. } => "rate_limited",
            PipelineError::NoRouteAvailable => "no_route_available",
            PipelineError::UpstreamFailure { .. } => "upstream_failure",
            PipelineError::ConsensusRejected(_) => "consensus_rejected",
            PipelineError::ConsensusTimedOut { .. } => "consensus_timed_out",
        }
    }

    /// JSON-RPC error code (server-defined range)
    pub fn code(&self) -> i32 {
        match self {
            PipelineError::RateLimited { .. } => -32001,
            PipelineError::NoRouteAvailable => -32002,
            PipelineError::UpstreamFailure { .. } => -32003,
            PipelineError::ConsensusRejected(_) => -32004,
            PipelineError::ConsensusTimedOut { .. } => -32005,
        }
    }

    pub fn upstream(node_id: &str, reason: impl Into<String>) -> Self {
        PipelineError::UpstreamFailure {
            node_id: node_id.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Node not found: {0}")]
    NotFound(String),

    #[error("Invalid node record: {0}")]
    InvalidRecord(String),

    #[error("Node {node_id} already registered as {existing}")]
    KindMismatch { node_id: String, existing: String },
}

/// Relay↔core framing and connection errors.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: u64, max: u32 },

    #[error("Timed out after {0}ms")]
    Timeout(u64),

    #[error("Connection closed by peer")]
    Closed,

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("No endpoint at {0}")]
    UnknownEndpoint(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Network error: {0}")]
    Network(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("Initialization error: {0}")]
    Initialization(String),

    #[error("Not available on this node: {0}")]
    Unsupported(String),
}
