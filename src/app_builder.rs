//! Assembles an [`AppContext`] from a validated [`Config`].
//!
//! Every role gets the same relay pipeline. A core node also hosts a
//! `CoreNodeService` and routes its own API traffic to itself through an
//! in-process transport, probing itself to stay healthy in its registry.

use std::sync::Arc;
use tracing::info;

use crate::app_context::AppContext;
use crate::bridge::BridgeConnector;
use crate::config::{Config, CoreNodeEntry, NodeRole};
use crate::consensus::ConsensusCoordinator;
use crate::core_node::CoreNodeService;
use crate::error::AppError;
use crate::network::client::TcpTransport;
use crate::network::transport::{CoreTransport, LocalTransport};
use crate::node_registry::NodeRegistry;
use crate::rate_limiter::RateLimiter;
use crate::relay::RelayService;
use crate::routing::RoutingEngine;

pub struct AppBuilder {
    config: Config,
    transport: Option<Arc<dyn CoreTransport>>,
}

impl AppBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            transport: None,
        }
    }

    /// Replace the TCP transport relays use to reach core nodes. Core nodes
    /// always use their in-process transport.
    pub fn with_transport(mut self, transport: Arc<dyn CoreTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn build(self) -> Result<AppContext, AppError> {
        let config = self.config;
        config.validate()?;

        let node_id = config.node.node_id.clone();
        let registry = NodeRegistry::new(config.heartbeat.clone());
        let routing = Arc::new(RoutingEngine::new(config.routing));

        let (transport, core, probe_targets) = match config.node.role {
            NodeRole::Core => {
                let coordinator = Arc::new(ConsensusCoordinator::from_config(&config.consensus));
                let core = Arc::new(
                    CoreNodeService::new(&node_id, config.node.partition, coordinator)
                        .with_coordinate(config.node.coordinate),
                );
                let local = LocalTransport::new(config.network.forward_timeout());
                local.attach(config.network.listen_address.clone(), core.clone());
                let transport: Arc<dyn CoreTransport> = Arc::new(local);

                let own_entry = CoreNodeEntry {
                    node_id: node_id.clone(),
                    address: config.network.listen_address.clone(),
                    partition: config.node.partition,
                    coordinate: config.node.coordinate,
                };
                (transport, Some(core), vec![own_entry])
            }
            NodeRole::Relay | NodeRole::Bridge => {
                let transport: Arc<dyn CoreTransport> = match self.transport {
                    Some(transport) => transport,
                    None => Arc::new(TcpTransport::new(
                        config.network.connect_timeout(),
                        config.network.forward_timeout(),
                    )),
                };
                (transport, None, config.network.core_nodes.clone())
            }
        };

        let relay = Arc::new(RelayService::new(
            &node_id,
            registry.clone(),
            Arc::new(RateLimiter::new()),
            config.rate_limit,
            routing.clone(),
            transport.clone(),
        ));

        let bridge = match config.node.role {
            NodeRole::Bridge => {
                let connector = config
                    .network
                    .bridge_targets
                    .iter()
                    .fold(BridgeConnector::new(&node_id), |bridge, target| {
                        bridge.with_endpoint(target, relay.clone())
                    });
                Some(Arc::new(connector))
            }
            _ => None,
        };

        info!(
            "✓ Built {:?} node {} ({} core node(s) to probe, consensus deadline {}ms)",
            config.node.role,
            node_id,
            probe_targets.len(),
            config.consensus.deadline_ms
        );

        Ok(AppContext {
            config,
            registry,
            routing,
            transport,
            relay,
            core,
            bridge,
            probe_targets,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::types::{NodeKind, NodeRecord, NodeStatus, Partition, RoutingRequest, Transaction};
    use std::time::Duration;

    fn config(role: NodeRole) -> Config {
        let mut config = Config::for_role(role);
        config.node.node_id = format!("{}_UNIT", role.kind().id_prefix().trim_end_matches('_'));
        config
    }

    #[tokio::test]
    async fn test_core_node_serves_its_own_api_after_probe() {
        let ctx = AppBuilder::new(config(NodeRole::Core)).build().unwrap();
        assert!(ctx.core.is_some());
        assert!(ctx.bridge.is_none());

        // Not registered until the first probe succeeds
        let err = ctx.submit_transaction(b"tx".to_vec(), None, None).await.unwrap_err();
        assert_eq!(err, PipelineError::NoRouteAvailable);

        ctx.prober().probe_once().await;
        let result = ctx
            .submit_transaction(b"tx".to_vec(), None, Some(Partition::Alpha))
            .await
            .unwrap();
        assert_eq!(result.routed_to, "CORE_UNIT");

        let health = ctx.get_node_health();
        assert_eq!(health.len(), 1);
        assert_eq!(health[0].status, NodeStatus::Healthy);
        assert_eq!(ctx.get_routing_snapshot().len(), 1);
        assert_eq!(ctx.metrics().succeeded, 1);
    }

    #[tokio::test]
    async fn test_bridge_dispatches_to_configured_targets() {
        let mut cfg = config(NodeRole::Bridge);
        cfg.network.bridge_targets = vec!["eth".into(), "sol".into()];

        let shared = Arc::new(LocalTransport::new(Duration::from_secs(1)));
        let core = Arc::new(CoreNodeService::new(
            "CORE_X",
            Partition::Beta,
            Arc::new(ConsensusCoordinator::from_config(&Default::default())),
        ));
        shared.attach("mem://x", core);

        let ctx = AppBuilder::new(cfg).with_transport(shared).build().unwrap();
        ctx.register_node(NodeRecord::new("CORE_X", NodeKind::Core, "mem://x", Partition::Beta))
            .unwrap();

        let report = ctx.dispatch(b"tx".to_vec(), None, None, None).await.unwrap();
        assert_eq!(report.summary.succeeded, 2);
        assert_eq!(report.outcomes[1].target, "sol");
    }

    #[tokio::test]
    async fn test_relay_without_bridge_rejects_dispatch() {
        let ctx = AppBuilder::new(config(NodeRole::Relay)).build().unwrap();
        let err = ctx.dispatch(b"tx".to_vec(), None, None, None).await.unwrap_err();
        assert!(matches!(err, AppError::Unsupported(_)));
    }

    #[test]
    fn test_sweep_eviction_drops_routing_factors() {
        let ctx = AppBuilder::new(config(NodeRole::Relay)).build().unwrap();
        for (id, address) in [("CORE_OLD", "10.0.0.9:8888"), ("CORE_NEW", "10.0.0.8:8888")] {
            let record = NodeRecord::new(id, NodeKind::Core, address, Partition::Beta);
            ctx.registry.register_at(record, 1).unwrap();
        }

        let request = RoutingRequest::new(Transaction::new(b"tx".to_vec()));
        ctx.routing
            .select_target(&request, &ctx.registry.list_all_at(1))
            .unwrap();
        assert_eq!(ctx.routing.tracked(), 2);

        let evict_after = ctx.config.heartbeat.evict_after_ms;
        ctx.registry.heartbeat_at("CORE_NEW", 5, None, evict_after).unwrap();

        let report = ctx.sweep_at(evict_after + 2);
        assert_eq!(report.evicted, vec!["CORE_OLD".to_string()]);
        assert!(ctx.routing.last_factors("CORE_OLD").is_none());
        assert!(ctx.routing.last_factors("CORE_NEW").is_some());
        assert_eq!(ctx.routing.tracked(), 1);
    }

    #[test]
    fn test_invalid_config_fails_build() {
        let mut cfg = config(NodeRole::Relay);
        cfg.rate_limit.capacity_per_window = 0;
        assert!(matches!(AppBuilder::new(cfg).build(), Err(AppError::Config(_))));
    }
}
