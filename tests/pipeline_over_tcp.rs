//! Relay → core over real loopback sockets.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use meshrelay::config::{ConsensusConfig, CoreNodeEntry, HeartbeatConfig, RateLimitConfig, RoutingConfig};
use meshrelay::consensus::ConsensusCoordinator;
use meshrelay::core_node::CoreNodeService;
use meshrelay::error::PipelineError;
use meshrelay::heartbeat::HealthProber;
use meshrelay::network::{CoreNodeServer, CoreTransport, TcpTransport};
use meshrelay::node_registry::NodeRegistry;
use meshrelay::rate_limiter::RateLimiter;
use meshrelay::relay::RelayService;
use meshrelay::routing::RoutingEngine;
use meshrelay::types::{GeoCoordinate, NodeKind, NodeRecord, NodeStatus, Partition, RoutingRequest, Transaction};

struct RunningCore {
    address: String,
    service: Arc<CoreNodeService>,
    token: CancellationToken,
}

async fn start_core(id: &str, partition: Partition, processing_delay_ms: u64) -> RunningCore {
    let consensus = ConsensusConfig {
        processing_delay_ms,
        ..Default::default()
    };
    let service = Arc::new(
        CoreNodeService::new(id, partition, Arc::new(ConsensusCoordinator::from_config(&consensus)))
            .with_coordinate(Some(GeoCoordinate::new(52.52, 13.40, 25.0))),
    );
    let server = CoreNodeServer::bind("127.0.0.1:0", service.clone()).await.unwrap();
    let address = server.local_addr().unwrap().to_string();
    let token = CancellationToken::new();
    tokio::spawn(server.run(token.clone()));

    RunningCore {
        address,
        service,
        token,
    }
}

/// An address nothing listens on.
async fn dead_address() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);
    address
}

fn transport() -> Arc<TcpTransport> {
    Arc::new(TcpTransport::new(Duration::from_millis(500), Duration::from_secs(2)))
}

fn relay(registry: &NodeRegistry, transport: Arc<TcpTransport>) -> RelayService {
    RelayService::new(
        "RELAY_TCP",
        registry.clone(),
        Arc::new(RateLimiter::new()),
        RateLimitConfig {
            capacity_per_window: 100,
            window_ms: 1_000,
        },
        Arc::new(RoutingEngine::new(RoutingConfig::default())),
        transport,
    )
}

#[tokio::test]
async fn test_transaction_commits_through_tcp_core() {
    let core = start_core("CORE_TCP", Partition::Gamma, 5).await;
    let registry = NodeRegistry::new(HeartbeatConfig::default());
    registry
        .register(NodeRecord::new("CORE_TCP", NodeKind::Core, &core.address, Partition::Gamma))
        .unwrap();

    let relay = relay(&registry, transport());
    let request = RoutingRequest::new(Transaction::new(b"over-the-wire".to_vec()));
    let tx_id = request.transaction.id();

    let result = relay.handle(request, "client-tcp").await.unwrap();
    assert_eq!(result.transaction_id, tx_id);
    assert_eq!(result.routed_to, "CORE_TCP");
    assert_eq!(result.routed_address, core.address);
    assert_eq!(result.partition, Partition::Gamma);
    assert!(result.consensus_latency_ms >= 5);
    assert_eq!(core.service.stats().committed, 1);

    core.token.cancel();
}

#[tokio::test]
async fn test_core_rejection_crosses_the_wire_typed() {
    let core = start_core("CORE_REJ", Partition::Alpha, 1).await;
    let registry = NodeRegistry::new(HeartbeatConfig::default());
    registry
        .register(NodeRecord::new("CORE_REJ", NodeKind::Core, &core.address, Partition::Alpha))
        .unwrap();

    let relay = relay(&registry, transport());
    let err = relay
        .handle(RoutingRequest::new(Transaction::new(Vec::new())), "client")
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::ConsensusRejected(_)));
    assert!(!err.is_retryable());
    assert_eq!(core.service.stats().rejected, 1);

    core.token.cancel();
}

#[tokio::test]
async fn test_refused_connection_is_upstream_failure() {
    let registry = NodeRegistry::new(HeartbeatConfig::default());
    registry
        .register(NodeRecord::new("CORE_GONE", NodeKind::Core, dead_address().await, Partition::Beta))
        .unwrap();

    let relay = relay(&registry, transport());
    let err = relay
        .handle(RoutingRequest::new(Transaction::new(b"lost".to_vec())), "client")
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::UpstreamFailure { ref node_id, .. } if node_id == "CORE_GONE"));
    assert!(err.is_retryable());
    assert_eq!(registry.get("CORE_GONE").unwrap().failed_count, 1);
}

#[tokio::test]
async fn test_probe_over_tcp_registers_core() {
    let core = start_core("CORE_PROBED", Partition::Delta, 1).await;
    let registry = NodeRegistry::new(HeartbeatConfig::default());

    let reply = transport().probe(&core.address).await.unwrap();
    assert_eq!(reply.node_id, "CORE_PROBED");
    assert_eq!(reply.partition, Partition::Delta);
    assert!(reply.coordinate.is_some());

    let targets = vec![
        CoreNodeEntry {
            node_id: "CORE_PROBED".to_string(),
            address: core.address.clone(),
            partition: Partition::Delta,
            coordinate: None,
        },
        CoreNodeEntry {
            node_id: "CORE_DOWN".to_string(),
            address: dead_address().await,
            partition: Partition::Delta,
            coordinate: None,
        },
    ];
    let prober = HealthProber::new(registry.clone(), transport(), targets, Duration::from_secs(5));
    let round = prober.probe_once().await;

    assert_eq!((round.healthy, round.failed), (1, 1));
    let record = registry.get("CORE_PROBED").unwrap();
    assert_eq!(record.status, NodeStatus::Healthy);
    assert!(record.coordinate.is_some());
    assert!(registry.get("CORE_DOWN").is_none());

    core.token.cancel();
}
