//! How a relay reaches core nodes.
//!
//! [`CoreTransport`] is the seam between the relay pipeline and the network.
//! `TcpTransport` (see `client.rs`) speaks the framed wire protocol;
//! [`LocalTransport`] calls in-process core services directly, which lets
//! one process host many simulated nodes.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::core_node::CoreNodeService;
use crate::error::{PipelineError, WireError};
use crate::types::{CommitResult, GeoCoordinate, NodeRecord, Partition, Transaction};

/// What a core node says about itself when probed.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReply {
    pub node_id: String,
    pub partition: Partition,
    pub coordinate: Option<GeoCoordinate>,
    pub round_trip: Duration,
}

#[async_trait]
pub trait CoreTransport: Send + Sync {
    /// Hand `tx` to `target` once. Transport faults come back as
    /// `UpstreamFailure`; consensus outcomes come back unchanged.
    async fn forward(
        &self,
        target: &NodeRecord,
        tx: &Transaction,
        deadline: Option<Instant>,
    ) -> Result<CommitResult, PipelineError>;

    async fn probe(&self, address: &str) -> Result<ProbeReply, WireError>;
}

/// Time left before `deadline`, capped by `limit`.
pub fn remaining_budget(limit: Duration, deadline: Option<Instant>) -> Duration {
    match deadline {
        Some(deadline) => limit.min(deadline.saturating_duration_since(Instant::now())),
        None => limit,
    }
}

/// In-process transport keyed by node address.
pub struct LocalTransport {
    services: DashMap<String, Arc<CoreNodeService>>,
    forward_timeout: Duration,
}

impl LocalTransport {
    pub fn new(forward_timeout: Duration) -> Self {
        Self {
            services: DashMap::new(),
            forward_timeout,
        }
    }

    pub fn attach(&self, address: impl Into<String>, service: Arc<CoreNodeService>) {
        self.services.insert(address.into(), service);
    }

    /// Subsequent calls to `address` fail as if the connection were refused.
    pub fn detach(&self, address: &str) -> Option<Arc<CoreNodeService>> {
        self.services.remove(address).map(|(_, service)| service)
    }

    fn lookup(&self, address: &str) -> Option<Arc<CoreNodeService>> {
        self.services.get(address).map(|s| s.value().clone())
    }
}

#[async_trait]
impl CoreTransport for LocalTransport {
    async fn forward(
        &self,
        target: &NodeRecord,
        tx: &Transaction,
        deadline: Option<Instant>,
    ) -> Result<CommitResult, PipelineError> {
        let service = self
            .lookup(&target.address)
            .ok_or_else(|| PipelineError::upstream(&target.node_id, "connection refused"))?;

        let budget = remaining_budget(self.forward_timeout, deadline);
        match tokio::time::timeout(budget, service.submit(tx, deadline)).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::upstream(
                &target.node_id,
                format!("no reply within {}ms", budget.as_millis()),
            )),
        }
    }

    async fn probe(&self, address: &str) -> Result<ProbeReply, WireError> {
        let started = Instant::now();
        let service = self
            .lookup(address)
            .ok_or_else(|| WireError::UnknownEndpoint(address.to_string()))?;
        Ok(ProbeReply {
            node_id: service.node_id().to_string(),
            partition: service.partition(),
            coordinate: service.coordinate(),
            round_trip: started.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{ConsensusCoordinator, TrivialDelay};
    use crate::types::NodeKind;

    fn core(delay_ms: u64, deadline_ms: u64) -> Arc<CoreNodeService> {
        let coordinator = ConsensusCoordinator::new(
            Arc::new(TrivialDelay::new(Duration::from_millis(delay_ms))),
            Duration::from_millis(deadline_ms),
            1024,
        );
        Arc::new(CoreNodeService::new("CORE_A", Partition::Gamma, Arc::new(coordinator)))
    }

    fn target() -> NodeRecord {
        NodeRecord::new("CORE_A", NodeKind::Core, "mem://a", Partition::Gamma)
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_forward_and_probe() {
        let transport = LocalTransport::new(Duration::from_secs(2));
        transport.attach("mem://a", core(10, 100));

        let commit = transport
            .forward(&target(), &Transaction::new(b"tx".to_vec()), None)
            .await
            .unwrap();
        assert_eq!(commit.node_id, "CORE_A");

        let reply = transport.probe("mem://a").await.unwrap();
        assert_eq!(reply.node_id, "CORE_A");
        assert_eq!(reply.partition, Partition::Gamma);
    }

    #[tokio::test]
    async fn test_detached_node_is_upstream_failure() {
        let transport = LocalTransport::new(Duration::from_secs(2));
        transport.attach("mem://a", core(0, 100));
        assert!(transport.detach("mem://a").is_some());

        let err = transport
            .forward(&target(), &Transaction::new(b"tx".to_vec()), None)
            .await
            .unwrap_err();
        assert_eq!(err, PipelineError::upstream("CORE_A", "connection refused"));
        assert!(matches!(
            transport.probe("mem://a").await,
            Err(WireError::UnknownEndpoint(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forward_timeout_is_upstream_failure() {
        // Consensus deadline longer than the transport allows
        let transport = LocalTransport::new(Duration::from_millis(50));
        transport.attach("mem://a", core(400, 1_000));

        let err = transport
            .forward(&target(), &Transaction::new(b"tx".to_vec()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::UpstreamFailure { .. }));
    }

    #[test]
    fn test_remaining_budget_is_capped() {
        let limit = Duration::from_millis(500);
        assert_eq!(remaining_budget(limit, None), limit);
        let soon = Instant::now() + Duration::from_secs(60);
        assert_eq!(remaining_budget(limit, Some(soon)), limit);
        let past = Instant::now() - Duration::from_millis(1);
        assert_eq!(remaining_budget(limit, Some(past)), Duration::ZERO);
    }
}
