use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::bridge::{BridgeConnector, DispatchReport};
use crate::config::{Config, CoreNodeEntry};
use crate::core_node::CoreNodeService;
use crate::error::{AppError, PipelineError, RegistryError};
use crate::heartbeat::HealthProber;
use crate::metrics::MetricsSnapshot;
use crate::network::transport::CoreTransport;
use crate::node_registry::{NodeRegistry, SweepReport};
use crate::relay::RelayService;
use crate::routing::{RoutingEngine, RoutingSnapshotEntry};
use crate::types::{
    unix_millis, GeoCoordinate, NodeRecord, Partition, RelayResult, RoutingRequest, Transaction,
};

/// Source id used for requests entering through the local API.
pub const API_SOURCE: &str = "api";

/// Shared application context containing all major components
pub struct AppContext {
    pub config: Config,
    pub registry: NodeRegistry,
    pub routing: Arc<RoutingEngine>,
    pub transport: Arc<dyn CoreTransport>,
    pub relay: Arc<RelayService>,
    /// Present on core nodes only
    pub core: Option<Arc<CoreNodeService>>,
    /// Present on bridge nodes only
    pub bridge: Option<Arc<BridgeConnector>>,
    pub probe_targets: Vec<CoreNodeEntry>,
}

impl AppContext {
    pub fn node_id(&self) -> &str {
        &self.config.node.node_id
    }

    pub async fn submit_transaction(
        &self,
        payload: Vec<u8>,
        requester: Option<GeoCoordinate>,
        affinity: Option<Partition>,
    ) -> Result<RelayResult, PipelineError> {
        self.submit_transaction_by(payload, requester, affinity, None).await
    }

    pub async fn submit_transaction_by(
        &self,
        payload: Vec<u8>,
        requester: Option<GeoCoordinate>,
        affinity: Option<Partition>,
        deadline: Option<Instant>,
    ) -> Result<RelayResult, PipelineError> {
        let mut request = RoutingRequest::new(Transaction::new(payload))
            .with_requester(requester)
            .with_affinity(affinity);
        request.deadline = deadline;
        self.relay.handle(request, API_SOURCE).await
    }

    pub fn get_node_health(&self) -> Vec<NodeRecord> {
        self.registry.list_all()
    }

    pub fn get_routing_snapshot(&self) -> Vec<RoutingSnapshotEntry> {
        self.routing.snapshot(&self.registry.list_all())
    }

    /// Fan a transaction out to `targets`, or to every configured bridge
    /// target when none are given.
    pub async fn dispatch(
        &self,
        payload: Vec<u8>,
        requester: Option<GeoCoordinate>,
        affinity: Option<Partition>,
        targets: Option<Vec<String>>,
    ) -> Result<DispatchReport, AppError> {
        let bridge = self
            .bridge
            .as_ref()
            .ok_or_else(|| AppError::Unsupported("dispatch requires the bridge role".into()))?;
        let targets = targets.unwrap_or_else(|| self.config.network.bridge_targets.clone());
        let request = RoutingRequest::new(Transaction::new(payload))
            .with_requester(requester)
            .with_affinity(affinity);
        Ok(bridge.dispatch(request, &targets).await)
    }

    pub fn register_node(&self, record: NodeRecord) -> Result<NodeRecord, RegistryError> {
        let registered = self.registry.register(record)?;
        Ok(registered)
    }

    pub fn heartbeat(
        &self,
        node_id: &str,
        latency_ms: u64,
        coordinate: Option<GeoCoordinate>,
    ) -> Result<NodeRecord, RegistryError> {
        self.registry.heartbeat(node_id, latency_ms, coordinate)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.relay.metrics().snapshot()
    }

    pub fn prober(&self) -> HealthProber {
        HealthProber::new(
            self.registry.clone(),
            self.transport.clone(),
            self.probe_targets.clone(),
            self.config.network.probe_interval(),
        )
    }

    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(unix_millis())
    }

    /// Sweep the registry and drop routing diagnostics for evicted nodes.
    pub fn sweep_at(&self, now_ms: u64) -> SweepReport {
        let report = self.registry.sweep_at(now_ms);
        for node_id in &report.evicted {
            self.routing.forget(node_id);
        }
        report
    }

    /// Periodic sweep until `token` is cancelled.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, token: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("registry sweeper stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let report = self.sweep();
                    if !report.is_quiet() {
                        debug!(?report, "registry sweep");
                    }
                }
            }
        }
    }
}
