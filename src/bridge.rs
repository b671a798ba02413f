//! Multi-target front door.
//!
//! A dispatch sends the same request to each named endpoint. Targets run
//! concurrently and independently; results come back in input order and a
//! failing target never affects the others.

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::error::PipelineError;
use crate::relay::RelayService;
use crate::types::{RelayResult, RoutingRequest};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetOutcome {
    pub target: String,
    pub result: Result<RelayResult, PipelineError>,
}

impl TargetOutcome {
    pub fn succeeded(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DispatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchReport {
    pub outcomes: Vec<TargetOutcome>,
    pub summary: DispatchSummary,
}

pub struct BridgeConnector {
    node_id: String,
    endpoints: HashMap<String, Arc<RelayService>>,
}

impl BridgeConnector {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            endpoints: HashMap::new(),
        }
    }

    pub fn with_endpoint(mut self, name: impl Into<String>, relay: Arc<RelayService>) -> Self {
        self.endpoints.insert(name.into(), relay);
        self
    }

    pub fn endpoints(&self) -> Vec<String> {
        let mut names: Vec<String> = self.endpoints.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn dispatch(&self, request: RoutingRequest, targets: &[String]) -> DispatchReport {
        let runs = targets.iter().map(|target| {
            let mut per_target = request.clone();
            per_target.transaction.destination = Some(target.clone());
            self.dispatch_one(target, per_target)
        });
        let outcomes = join_all(runs).await;

        let succeeded = outcomes.iter().filter(|o| o.succeeded()).count();
        let summary = DispatchSummary {
            total: outcomes.len(),
            succeeded,
            failed: outcomes.len() - succeeded,
        };
        info!(
            "🌉 Dispatched to {} targets: {} ok, {} failed",
            summary.total, summary.succeeded, summary.failed
        );

        DispatchReport { outcomes, summary }
    }

    async fn dispatch_one(&self, target: &str, request: RoutingRequest) -> TargetOutcome {
        let result = match self.endpoints.get(target) {
            Some(relay) => relay.handle(request, &self.node_id).await,
            None => Err(PipelineError::upstream(target, "unknown endpoint")),
        };
        TargetOutcome {
            target: target.to_string(),
            result,
        }
    }
}
