//! Multi-node transaction relay: health-tracked node registry, per-node
//! admission, weighted routing, consensus on core nodes, and a bridge that
//! fans one transaction out to several relay endpoints.

pub mod app_builder;
pub mod app_context;
pub mod bridge;
pub mod config;
pub mod consensus;
pub mod constants;
pub mod core_node;
pub mod error;
pub mod heartbeat;
pub mod metrics;
pub mod network;
pub mod node_registry;
pub mod rate_limiter;
pub mod relay;
pub mod routing;
pub mod rpc;
pub mod shutdown;
pub mod types;

pub use app_builder::AppBuilder;
pub use app_context::AppContext;
pub use config::{Config, NodeRole};
pub use error::{AppError, PipelineError};
