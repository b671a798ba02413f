//! Relay pipeline: admission → route selection → forward → result.
//!
//! Steps run strictly in order for one request. The relay forwards to at
//! most one core node per call and never retries; callers that want another
//! attempt call again and get a fresh registry snapshot.

use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::RateLimitConfig;
use crate::error::PipelineError;
use crate::metrics::RelayMetrics;
use crate::network::transport::CoreTransport;
use crate::node_registry::NodeRegistry;
use crate::rate_limiter::RateLimiter;
use crate::routing::RoutingEngine;
use crate::types::{NodeKind, RelayResult, RoutingRequest};

pub struct RelayService {
    node_id: String,
    registry: NodeRegistry,
    limiter: Arc<RateLimiter>,
    limits: RateLimitConfig,
    routing: Arc<RoutingEngine>,
    transport: Arc<dyn CoreTransport>,
    metrics: Arc<RelayMetrics>,
}

impl RelayService {
    pub fn new(
        node_id: impl Into<String>,
        registry: NodeRegistry,
        limiter: Arc<RateLimiter>,
        limits: RateLimitConfig,
        routing: Arc<RoutingEngine>,
        transport: Arc<dyn CoreTransport>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            registry,
            limiter,
            limits,
            routing,
            transport,
            metrics: Arc::new(RelayMetrics::new()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn metrics(&self) -> &Arc<RelayMetrics> {
        &self.metrics
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn routing(&self) -> &Arc<RoutingEngine> {
        &self.routing
    }

    pub async fn handle(
        &self,
        request: RoutingRequest,
        source_node_id: &str,
    ) -> Result<RelayResult, PipelineError> {
        let started = Instant::now();
        let outcome = self.process(&request, source_node_id, started).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &outcome {
            Ok(result) => {
                self.metrics.record_success(elapsed_ms);
                info!(
                    tx = %result.transaction_id,
                    core = %result.routed_to,
                    consensus_ms = result.consensus_latency_ms,
                    "📨 Relayed transaction in {}ms",
                    elapsed_ms
                );
            }
            Err(e) => {
                self.metrics.record_failure(e, elapsed_ms);
                debug!(source = source_node_id, kind = e.kind(), "relay failed: {}", e);
            }
        }
        outcome
    }

    async fn process(
        &self,
        request: &RoutingRequest,
        source_node_id: &str,
        started: Instant,
    ) -> Result<RelayResult, PipelineError> {
        if !self.limiter.try_admit(
            &self.node_id,
            self.limits.capacity_per_window,
            self.limits.window(),
        ) {
            return Err(PipelineError::RateLimited {
                node_id: self.node_id.clone(),
                capacity: self.limits.capacity_per_window,
                window_ms: self.limits.window_ms,
            });
        }

        // Affinity is a preference, not a filter
        let candidates = self.registry.list_healthy(NodeKind::Core, None);
        let target = self
            .routing
            .select_target(request, &candidates)
            .ok_or(PipelineError::NoRouteAvailable)?;

        if let Some(deadline) = request.deadline {
            if Instant::now() >= deadline {
                return Err(PipelineError::ConsensusTimedOut {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
            }
        }

        let sent = Instant::now();
        let forwarded = self
            .transport
            .forward(&target, &request.transaction, request.deadline)
            .await;
        let round_trip_ms = sent.elapsed().as_millis() as u64;

        match forwarded {
            Ok(commit) => {
                // Consensus time says nothing about the link to the node
                let link_ms = round_trip_ms.saturating_sub(commit.consensus_latency_ms);
                self.registry.record_outcome(&target.node_id, link_ms, true);
                Ok(RelayResult {
                    transaction_id: commit.transaction_id,
                    relay_node_id: self.node_id.clone(),
                    source_node_id: source_node_id.to_string(),
                    routed_to: target.node_id,
                    routed_address: target.address,
                    partition: commit.partition,
                    consensus_latency_ms: commit.consensus_latency_ms,
                    processing_time_ms: started.elapsed().as_millis() as u64,
                    submitted_at_ms: request.submitted_at_ms(),
                    destination: request.transaction.destination.clone(),
                })
            }
            Err(e) => {
                self.registry
                    .record_outcome(&target.node_id, round_trip_ms, false);
                if matches!(e, PipelineError::UpstreamFailure { .. }) {
                    warn!("❌ Forward to {} failed: {}", target.node_id, e);
                }
                Err(e)
            }
        }
    }
}
