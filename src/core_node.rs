//! Core node: runs forwarded transactions through consensus and reports the
//! commit back to the relay.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

use crate::consensus::{ConsensusCoordinator, ConsensusStatus};
use crate::error::PipelineError;
use crate::types::{unix_millis, CommitResult, GeoCoordinate, Partition, Transaction};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CoreNodeStats {
    pub committed: u64,
    pub rejected: u64,
    pub timed_out: u64,
}

pub struct CoreNodeService {
    node_id: String,
    partition: Partition,
    coordinate: Option<GeoCoordinate>,
    coordinator: Arc<ConsensusCoordinator>,
    committed: AtomicU64,
    rejected: AtomicU64,
    timed_out: AtomicU64,
}

impl CoreNodeService {
    pub fn new(
        node_id: impl Into<String>,
        partition: Partition,
        coordinator: Arc<ConsensusCoordinator>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            partition,
            coordinate: None,
            coordinator,
            committed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
        }
    }

    pub fn with_coordinate(mut self, coordinate: Option<GeoCoordinate>) -> Self {
        self.coordinate = coordinate;
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn partition(&self) -> Partition {
        self.partition
    }

    pub fn coordinate(&self) -> Option<GeoCoordinate> {
        self.coordinate
    }

    pub fn coordinator(&self) -> &Arc<ConsensusCoordinator> {
        &self.coordinator
    }

    /// Run `tx` through consensus. Failures are surfaced as-is; nothing here
    /// retries.
    pub async fn submit(
        &self,
        tx: &Transaction,
        deadline: Option<Instant>,
    ) -> Result<CommitResult, PipelineError> {
        let item = self
            .coordinator
            .submit_within(tx.payload.clone(), deadline)
            .await;

        match item.status {
            ConsensusStatus::Committed => {
                self.committed.fetch_add(1, Ordering::Relaxed);
                Ok(CommitResult {
                    transaction_id: item.id(),
                    node_id: self.node_id.clone(),
                    partition: self.partition,
                    consensus_latency_ms: item.latency_ms,
                    committed_at_ms: unix_millis(),
                })
            }
            ConsensusStatus::Rejected => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                Err(PipelineError::ConsensusRejected(
                    item.reason.unwrap_or_else(|| "rejected".to_string()),
                ))
            }
            ConsensusStatus::TimedOut => {
                self.timed_out.fetch_add(1, Ordering::Relaxed);
                Err(PipelineError::ConsensusTimedOut {
                    elapsed_ms: item.latency_ms,
                })
            }
            // submit_within always returns a terminal item
            ConsensusStatus::Pending => Err(PipelineError::ConsensusTimedOut {
                elapsed_ms: item.latency_ms,
            }),
        }
    }

    pub fn stats(&self) -> CoreNodeStats {
        CoreNodeStats {
            committed: self.committed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
        }
    }
}
