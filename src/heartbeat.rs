//! Active health probing of configured core nodes.
//!
//! Each round pings every core node in the bootstrap list. A reply
//! registers the node on first contact and otherwise counts as a heartbeat
//! carrying the measured round trip. A failed probe counts against the node;
//! after `max_probe_failures` in a row the registry reports it unreachable.

use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::CoreNodeEntry;
use crate::network::transport::{CoreTransport, ProbeReply};
use crate::node_registry::NodeRegistry;
use crate::types::{NodeKind, NodeRecord};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProbeRound {
    pub healthy: usize,
    pub failed: usize,
}

pub struct HealthProber {
    registry: NodeRegistry,
    transport: Arc<dyn CoreTransport>,
    targets: Vec<CoreNodeEntry>,
    interval: Duration,
}

impl HealthProber {
    pub fn new(
        registry: NodeRegistry,
        transport: Arc<dyn CoreTransport>,
        targets: Vec<CoreNodeEntry>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            transport,
            targets,
            interval,
        }
    }

    /// Probe every target concurrently. Each reply is recorded as soon as it
    /// arrives, so a slow or dead target never delays the others' heartbeats.
    pub async fn probe_once(&self) -> ProbeRound {
        let probes = self.targets.iter().map(|entry| self.probe_target(entry));

        let mut round = ProbeRound::default();
        for ok in join_all(probes).await {
            if ok {
                round.healthy += 1;
            } else {
                round.failed += 1;
            }
        }
        round
    }

    async fn probe_target(&self, entry: &CoreNodeEntry) -> bool {
        match self.transport.probe(&entry.address).await {
            Ok(reply) if reply.node_id == entry.node_id => self.record_reply(entry, reply),
            Ok(reply) => {
                warn!(
                    "⚠️  {} answered as {} (expected {})",
                    entry.address, reply.node_id, entry.node_id
                );
                self.record_failure(entry);
                false
            }
            Err(e) => {
                debug!(node_id = %entry.node_id, address = %entry.address, "probe failed: {}", e);
                self.record_failure(entry);
                false
            }
        }
    }

    fn record_reply(&self, entry: &CoreNodeEntry, reply: ProbeReply) -> bool {
        let latency_ms = reply.round_trip.as_millis() as u64;
        let coordinate = reply.coordinate.or(entry.coordinate);

        if self.registry.get(&entry.node_id).is_none() {
            let mut record =
                NodeRecord::new(&entry.node_id, NodeKind::Core, &entry.address, reply.partition)
                    .with_latency(latency_ms);
            record.coordinate = coordinate;
            if let Err(e) = self.registry.register(record) {
                warn!("⚠️  Could not register {}: {}", entry.node_id, e);
                return false;
            }
            return true;
        }

        match self.registry.heartbeat(&entry.node_id, latency_ms, coordinate) {
            Ok(_) => true,
            Err(e) => {
                warn!("⚠️  Heartbeat for {} rejected: {}", entry.node_id, e);
                false
            }
        }
    }

    fn record_failure(&self, entry: &CoreNodeEntry) {
        // Nodes never reached are simply not registered yet
        let _ = self.registry.record_probe_failure(&entry.node_id);
    }

    /// Probe every `interval` until `token` is cancelled.
    pub async fn run(self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("health prober stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let round = self.probe_once().await;
                    debug!(healthy = round.healthy, failed = round.failed, "probe round");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeartbeatConfig;
    use crate::consensus::ConsensusCoordinator;
    use crate::core_node::CoreNodeService;
    use crate::network::transport::LocalTransport;
    use crate::error::{PipelineError, WireError};
    use crate::types::{CommitResult, GeoCoordinate, NodeStatus, Partition, Transaction};
    use async_trait::async_trait;
    use tokio::sync::Notify;
    use tokio::time::Instant;

    /// Answers probes for `mem://<id>`; `*_SLOW` ids wait for `gate`.
    struct GatedTransport {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl CoreTransport for GatedTransport {
        async fn forward(
            &self,
            target: &NodeRecord,
            _tx: &Transaction,
            _deadline: Option<Instant>,
        ) -> Result<CommitResult, PipelineError> {
            Err(PipelineError::upstream(&target.node_id, "not serving"))
        }

        async fn probe(&self, address: &str) -> Result<ProbeReply, WireError> {
            if address.ends_with("_SLOW") {
                self.gate.notified().await;
            }
            Ok(ProbeReply {
                node_id: address.trim_start_matches("mem://").to_string(),
                partition: Partition::Alpha,
                coordinate: None,
                round_trip: Duration::from_millis(1),
            })
        }
    }

    fn core(id: &str, partition: Partition) -> Arc<CoreNodeService> {
        let coordinator = ConsensusCoordinator::from_config(&Default::default());
        Arc::new(
            CoreNodeService::new(id, partition, Arc::new(coordinator))
                .with_coordinate(Some(GeoCoordinate::new(52.52, 13.40, 10.0))),
        )
    }

    fn entry(id: &str) -> CoreNodeEntry {
        CoreNodeEntry {
            node_id: id.to_string(),
            address: format!("mem://{}", id),
            partition: Partition::Alpha,
            coordinate: None,
        }
    }

    fn prober(registry: &NodeRegistry, transport: &Arc<LocalTransport>, ids: &[&str]) -> HealthProber {
        HealthProber::new(
            registry.clone(),
            transport.clone(),
            ids.iter().map(|id| entry(id)).collect(),
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn test_first_reply_registers_node() {
        let registry = NodeRegistry::new(HeartbeatConfig::default());
        let transport = Arc::new(LocalTransport::new(Duration::from_secs(1)));
        transport.attach("mem://CORE_A", core("CORE_A", Partition::Delta));

        let round = prober(&registry, &transport, &["CORE_A", "CORE_GONE"])
            .probe_once()
            .await;
        assert_eq!(round, ProbeRound { healthy: 1, failed: 1 });

        let node = registry.get("CORE_A").unwrap();
        // The node's own answer wins over the bootstrap entry
        assert_eq!(node.partition, Partition::Delta);
        assert!(node.coordinate.is_some());
        assert_eq!(node.status, NodeStatus::Healthy);
        assert!(registry.get("CORE_GONE").is_none());
    }

    #[tokio::test]
    async fn test_repeated_failures_take_node_out_and_recovery_restores_it() {
        let registry = NodeRegistry::new(HeartbeatConfig::default());
        let transport = Arc::new(LocalTransport::new(Duration::from_secs(1)));
        let service = core("CORE_A", Partition::Alpha);
        transport.attach("mem://CORE_A", service.clone());
        let prober = prober(&registry, &transport, &["CORE_A"]);

        prober.probe_once().await;
        transport.detach("mem://CORE_A");
        for _ in 0..3 {
            prober.probe_once().await;
        }
        assert_eq!(registry.get("CORE_A").unwrap().status, NodeStatus::Unreachable);
        assert!(registry.list_healthy(NodeKind::Core, None).is_empty());

        transport.attach("mem://CORE_A", service);
        prober.probe_once().await;
        assert_eq!(registry.list_healthy(NodeKind::Core, None).len(), 1);
    }

    #[tokio::test]
    async fn test_wrong_identity_counts_as_failure() {
        let registry = NodeRegistry::new(HeartbeatConfig::default());
        let transport = Arc::new(LocalTransport::new(Duration::from_secs(1)));
        transport.attach("mem://CORE_A", core("CORE_IMPOSTOR", Partition::Alpha));

        let round = prober(&registry, &transport, &["CORE_A"]).probe_once().await;
        assert_eq!(round.failed, 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_fast_reply_recorded_before_slow_reply_lands() {
        let registry = NodeRegistry::new(HeartbeatConfig::default());
        let gate = Arc::new(Notify::new());
        let transport = Arc::new(GatedTransport { gate: gate.clone() });
        let prober = HealthProber::new(
            registry.clone(),
            transport,
            vec![entry("CORE_FAST"), entry("CORE_SLOW")],
            Duration::from_secs(30),
        );

        let round = tokio::spawn(async move { prober.probe_once().await });

        tokio::time::timeout(Duration::from_secs(2), async {
            while registry.get("CORE_FAST").is_none() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("fast node recorded while the slow check is pending");
        assert!(!round.is_finished());
        assert!(registry.get("CORE_SLOW").is_none());

        gate.notify_one();
        let round = round.await.unwrap();
        assert_eq!(round, ProbeRound { healthy: 2, failed: 0 });
        assert_eq!(registry.len(), 2);
    }
}
