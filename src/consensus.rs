//! Bounded-latency agreement step.
//!
//! A submitted payload becomes a [`ConsensusItem`] that moves from `Pending`
//! to exactly one terminal state (`Committed`, `Rejected` or `TimedOut`)
//! before the configured deadline passes. The agreement itself is behind
//! [`AgreementProtocol`], so a quorum or BFT round can replace the default
//! trivial-delay protocol without touching callers.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::{ConsensusConfig, ConsensusMode};
use crate::types::{fingerprint, unix_millis, Hash256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConsensusStatus {
    Pending,
    Committed,
    Rejected,
    TimedOut,
}

impl ConsensusStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ConsensusStatus::Pending)
    }
}

#[derive(Debug, Clone)]
pub struct ConsensusItem {
    pub fingerprint: Hash256,
    pub payload: Vec<u8>,
    pub submitted_at_ms: u64,
    pub status: ConsensusStatus,
    /// Time from submission to the terminal state
    pub latency_ms: u64,
    pub reason: Option<String>,
}

impl ConsensusItem {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            fingerprint: fingerprint(&payload),
            payload,
            submitted_at_ms: unix_millis(),
            status: ConsensusStatus::Pending,
            latency_ms: 0,
            reason: None,
        }
    }

    /// Move to a terminal state. Returns false if already terminal.
    pub fn finish(&mut self, status: ConsensusStatus, latency: Duration, reason: Option<String>) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.latency_ms = latency.as_millis() as u64;
        self.reason = reason;
        true
    }

    pub fn id(&self) -> String {
        hex::encode(self.fingerprint)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Commit,
    Reject(String),
}

/// The pluggable agreement round run for every admitted item.
#[async_trait]
pub trait AgreementProtocol: Send + Sync {
    fn name(&self) -> &'static str;

    /// May suspend; the coordinator bounds it with the deadline.
    async fn agree(&self, item: &ConsensusItem) -> Verdict;
}

/// Optional semantic validation run before agreement.
pub trait PayloadValidator: Send + Sync {
    fn validate(&self, payload: &[u8]) -> Result<(), String>;
}

/// Commits every item after a fixed processing delay.
pub struct TrivialDelay {
    delay: Duration,
}

impl TrivialDelay {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl AgreementProtocol for TrivialDelay {
    fn name(&self) -> &'static str {
        "trivial-delay"
    }

    async fn agree(&self, _item: &ConsensusItem) -> Verdict {
        tokio::time::sleep(self.delay).await;
        Verdict::Commit
    }
}

pub struct ConsensusCoordinator {
    protocol: Arc<dyn AgreementProtocol>,
    validator: Option<Arc<dyn PayloadValidator>>,
    deadline: Duration,
    max_payload_bytes: usize,
    /// Fingerprint -> number of submissions still pending
    in_flight: DashMap<Hash256, usize>,
}

impl ConsensusCoordinator {
    pub fn new(protocol: Arc<dyn AgreementProtocol>, deadline: Duration, max_payload_bytes: usize) -> Self {
        Self {
            protocol,
            validator: None,
            deadline,
            max_payload_bytes,
            in_flight: DashMap::new(),
        }
    }

    pub fn from_config(config: &ConsensusConfig) -> Self {
        let protocol: Arc<dyn AgreementProtocol> = match config.mode {
            ConsensusMode::TrivialDelay => Arc::new(TrivialDelay::new(config.processing_delay())),
        };
        Self::new(protocol, config.deadline(), config.max_payload_bytes)
    }

    pub fn with_validator(mut self, validator: Arc<dyn PayloadValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn protocol_name(&self) -> &'static str {
        self.protocol.name()
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub async fn submit(&self, payload: Vec<u8>) -> ConsensusItem {
        self.submit_within(payload, None).await
    }

    /// Run one item to a terminal state. The effective deadline is the
    /// configured one, shortened by `caller_deadline` when that is sooner.
    pub async fn submit_within(&self, payload: Vec<u8>, caller_deadline: Option<Instant>) -> ConsensusItem {
        let started = Instant::now();
        let mut item = ConsensusItem::new(payload);

        if let Err(reason) = self.check(&item.payload) {
            tracing::debug!(id = %item.id(), %reason, "consensus rejected before agreement");
            item.finish(ConsensusStatus::Rejected, started.elapsed(), Some(reason));
            return item;
        }

        let mut budget = self.deadline;
        if let Some(deadline) = caller_deadline {
            budget = budget.min(deadline.saturating_duration_since(started));
        }
        if budget.is_zero() {
            item.finish(
                ConsensusStatus::TimedOut,
                started.elapsed(),
                Some("deadline already passed".to_string()),
            );
            return item;
        }

        let _guard = InFlightGuard::enter(&self.in_flight, item.fingerprint);
        let verdict = tokio::time::timeout(budget, self.protocol.agree(&item)).await;

        match verdict {
            Ok(Verdict::Commit) => {
                item.finish(ConsensusStatus::Committed, started.elapsed(), None);
                tracing::debug!(id = %item.id(), latency_ms = item.latency_ms, "✅ committed");
            }
            Ok(Verdict::Reject(reason)) => {
                item.finish(ConsensusStatus::Rejected, started.elapsed(), Some(reason));
            }
            Err(_) => {
                item.finish(
                    ConsensusStatus::TimedOut,
                    started.elapsed(),
                    Some(format!("no decision within {}ms", budget.as_millis())),
                );
                tracing::warn!(
                    id = %item.id(),
                    protocol = self.protocol.name(),
                    "⏱️ consensus timed out after {}ms",
                    budget.as_millis()
                );
            }
        }
        item
    }

    /// `Pending` while at least one submission of this payload is running.
    pub fn status(&self, fingerprint: &Hash256) -> Option<ConsensusStatus> {
        self.in_flight
            .get(fingerprint)
            .map(|_| ConsensusStatus::Pending)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.iter().map(|e| *e.value()).sum()
    }

    fn check(&self, payload: &[u8]) -> Result<(), String> {
        if payload.is_empty() {
            return Err("empty payload".to_string());
        }
        if payload.len() > self.max_payload_bytes {
            return Err(format!(
                "payload of {} bytes exceeds {} byte limit",
                payload.len(),
                self.max_payload_bytes
            ));
        }
        match &self.validator {
            Some(validator) => validator.validate(payload),
            None => Ok(()),
        }
    }
}

struct InFlightGuard<'a> {
    map: &'a DashMap<Hash256, usize>,
    key: Hash256,
}

impl<'a> InFlightGuard<'a> {
    fn enter(map: &'a DashMap<Hash256, usize>, key: Hash256) -> Self {
        *map.entry(key).or_insert(0) += 1;
        Self { map, key }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.map.remove_if_mut(&self.key, |_, count| {
            *count -= 1;
            *count == 0
        });
    }
}
