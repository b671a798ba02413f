//! Node registry and heartbeat tracking
//!
//! Every record lives in a `DashMap` entry, so an update to one node holds
//! only that entry's shard lock: heartbeats for different nodes proceed
//! independently and a reader never observes a half-applied update.
//!
//! Status is recomputed from `last_seen_ms` on every read, so a node that
//! stopped heartbeating is never reported healthy even between sweeps.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::HeartbeatConfig;
use crate::error::RegistryError;
use crate::types::{unix_millis, GeoCoordinate, NodeKind, NodeRecord, NodeStatus, Partition};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub stale: usize,
    pub unreachable: usize,
    /// Ids dropped from the registry in this sweep
    pub evicted: Vec<String>,
}

impl SweepReport {
    pub fn is_quiet(&self) -> bool {
        self.stale == 0 && self.unreachable == 0 && self.evicted.is_empty()
    }
}

#[derive(Clone)]
pub struct NodeRegistry {
    nodes: Arc<DashMap<String, NodeRecord>>,
    timeouts: HeartbeatConfig,
}

impl NodeRegistry {
    pub fn new(timeouts: HeartbeatConfig) -> Self {
        Self {
            nodes: Arc::new(DashMap::new()),
            timeouts,
        }
    }

    pub fn timeouts(&self) -> &HeartbeatConfig {
        &self.timeouts
    }

    /// Status a record should have at `now_ms`.
    fn classify(&self, record: &NodeRecord, now_ms: u64) -> NodeStatus {
        if record.probe_failures >= self.timeouts.max_probe_failures {
            return NodeStatus::Unreachable;
        }
        let silence = now_ms.saturating_sub(record.last_seen_ms);
        if silence > self.timeouts.unreachable_after_ms {
            NodeStatus::Unreachable
        } else if silence > self.timeouts.stale_after_ms {
            NodeStatus::Stale
        } else {
            NodeStatus::Healthy
        }
    }

    fn snapshot(&self, record: &NodeRecord, now_ms: u64) -> NodeRecord {
        let mut copy = record.clone();
        copy.status = self.classify(record, now_ms);
        copy
    }

    pub fn register(&self, record: NodeRecord) -> Result<NodeRecord, RegistryError> {
        self.register_at(record, unix_millis())
    }

    /// Insert a node, or refresh it if already known. Counters survive
    /// re-registration; the kind of an existing node cannot change.
    pub fn register_at(&self, record: NodeRecord, now_ms: u64) -> Result<NodeRecord, RegistryError> {
        if record.node_id.trim().is_empty() {
            return Err(RegistryError::InvalidRecord("empty node id".into()));
        }
        if record.address.trim().is_empty() {
            return Err(RegistryError::InvalidRecord(format!(
                "node {} has no address",
                record.node_id
            )));
        }
        if let Some(coord) = &record.coordinate {
            if !coord.is_valid() {
                return Err(RegistryError::InvalidRecord(format!(
                    "node {} has an out-of-range coordinate",
                    record.node_id
                )));
            }
        }

        let mut entry = self
            .nodes
            .entry(record.node_id.clone())
            .or_insert_with(|| NodeRecord {
                registered_at_ms: now_ms,
                ..record.clone()
            });
        let existing = entry.value_mut();

        if existing.kind != record.kind {
            return Err(RegistryError::KindMismatch {
                node_id: record.node_id,
                existing: existing.kind.to_string(),
            });
        }

        existing.address = record.address;
        existing.partition = record.partition;
        existing.latency_ms = record.latency_ms;
        if record.coordinate.is_some() {
            existing.coordinate = record.coordinate;
        }
        existing.last_seen_ms = now_ms;
        existing.probe_failures = 0;
        existing.status = NodeStatus::Healthy;

        info!(
            node_id = %existing.node_id,
            kind = %existing.kind,
            partition = %existing.partition,
            "✅ Registered node at {}",
            existing.address
        );
        Ok(existing.clone())
    }

    pub fn heartbeat(
        &self,
        node_id: &str,
        latency_ms: u64,
        coordinate: Option<GeoCoordinate>,
    ) -> Result<NodeRecord, RegistryError> {
        self.heartbeat_at(node_id, latency_ms, coordinate, unix_millis())
    }

    pub fn heartbeat_at(
        &self,
        node_id: &str,
        latency_ms: u64,
        coordinate: Option<GeoCoordinate>,
        now_ms: u64,
    ) -> Result<NodeRecord, RegistryError> {
        let mut entry = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| RegistryError::NotFound(node_id.to_string()))?;
        let record = entry.value_mut();

        let was = record.status;
        record.last_seen_ms = record.last_seen_ms.max(now_ms);
        record.latency_ms = latency_ms;
        if let Some(coord) = coordinate.filter(|c| c.is_valid()) {
            record.coordinate = Some(coord);
        }
        record.probe_failures = 0;
        record.status = NodeStatus::Healthy;

        if was != NodeStatus::Healthy {
            info!("💚 Node {} recovered ({} → healthy)", node_id, was);
        } else {
            debug!(node_id, latency_ms, "heartbeat");
        }
        Ok(record.clone())
    }

    /// Count a failed health probe. Returns the resulting status.
    pub fn record_probe_failure(&self, node_id: &str) -> Result<NodeStatus, RegistryError> {
        self.record_probe_failure_at(node_id, unix_millis())
    }

    pub fn record_probe_failure_at(
        &self,
        node_id: &str,
        now_ms: u64,
    ) -> Result<NodeStatus, RegistryError> {
        let mut entry = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| RegistryError::NotFound(node_id.to_string()))?;
        let record = entry.value_mut();

        record.probe_failures = record.probe_failures.saturating_add(1);
        let status = self.classify(record, now_ms);
        if status == NodeStatus::Unreachable && record.status != NodeStatus::Unreachable {
            warn!(
                "⚠️  Node {} marked unreachable after {} failed probes",
                node_id, record.probe_failures
            );
        }
        record.status = status;
        Ok(status)
    }

    /// Force a node out of rotation until its next successful heartbeat.
    pub fn mark_unreachable(&self, node_id: &str) -> Result<(), RegistryError> {
        let mut entry = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| RegistryError::NotFound(node_id.to_string()))?;
        let record = entry.value_mut();
        record.probe_failures = record.probe_failures.max(self.timeouts.max_probe_failures);
        record.status = NodeStatus::Unreachable;
        warn!("⚠️  Node {} marked unreachable", node_id);
        Ok(())
    }

    /// Book-keeping after a forward attempt. A success also refreshes the
    /// observed link latency, which excludes time spent in consensus.
    pub fn record_outcome(&self, node_id: &str, latency_ms: u64, success: bool) {
        if let Some(mut entry) = self.nodes.get_mut(node_id) {
            let record = entry.value_mut();
            record.processed_count += 1;
            if success {
                record.latency_ms = latency_ms;
            } else {
                record.failed_count += 1;
            }
        }
    }

    pub fn list_healthy(&self, kind: NodeKind, partition: Option<Partition>) -> Vec<NodeRecord> {
        self.list_healthy_at(kind, partition, unix_millis())
    }

    pub fn list_healthy_at(
        &self,
        kind: NodeKind,
        partition: Option<Partition>,
        now_ms: u64,
    ) -> Vec<NodeRecord> {
        let mut healthy: Vec<NodeRecord> = self
            .nodes
            .iter()
            .filter(|e| e.kind == kind)
            .filter(|e| partition.map_or(true, |p| e.partition == p))
            .map(|e| self.snapshot(e.value(), now_ms))
            .filter(|r| r.status == NodeStatus::Healthy)
            .collect();
        healthy.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        healthy
    }

    pub fn get(&self, node_id: &str) -> Option<NodeRecord> {
        let now = unix_millis();
        self.nodes.get(node_id).map(|e| self.snapshot(e.value(), now))
    }

    pub fn list_all(&self) -> Vec<NodeRecord> {
        self.list_all_at(unix_millis())
    }

    pub fn list_all_at(&self, now_ms: u64) -> Vec<NodeRecord> {
        let mut all: Vec<NodeRecord> = self
            .nodes
            .iter()
            .map(|e| self.snapshot(e.value(), now_ms))
            .collect();
        all.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        all
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(unix_millis())
    }

    /// Persist status transitions and evict nodes silent past `evict_after_ms`.
    pub fn sweep_at(&self, now_ms: u64) -> SweepReport {
        let mut report = SweepReport::default();

        self.nodes.retain(|node_id, record| {
            let silence = now_ms.saturating_sub(record.last_seen_ms);
            if silence > self.timeouts.evict_after_ms {
                info!("🗑️  Evicted node {} (silent for {}ms)", node_id, silence);
                report.evicted.push(node_id.clone());
                return false;
            }

            let status = self.classify(record, now_ms);
            if status != record.status {
                match status {
                    NodeStatus::Stale => {
                        warn!("⚠️  Node {} is stale (no heartbeat for {}ms)", node_id, silence);
                        report.stale += 1;
                    }
                    NodeStatus::Unreachable => {
                        warn!("⚠️  Node {} is unreachable (no heartbeat for {}ms)", node_id, silence);
                        report.unreachable += 1;
                    }
                    NodeStatus::Healthy => {}
                }
                record.status = status;
            }
            true
        });

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeouts() -> HeartbeatConfig {
        HeartbeatConfig {
            stale_after_ms: 1_000,
            unreachable_after_ms: 5_000,
            evict_after_ms: 60_000,
            sweep_interval_ms: 100,
            max_probe_failures: 3,
        }
    }

    fn core(id: &str, partition: Partition) -> NodeRecord {
        NodeRecord::new(id, NodeKind::Core, format!("{}:8888", id), partition)
    }

    #[test]
    fn test_register_and_list_healthy() {
        let registry = NodeRegistry::new(timeouts());
        registry.register_at(core("A", Partition::Alpha), 1_000).unwrap();
        registry.register_at(core("B", Partition::Beta), 1_000).unwrap();
        registry
            .register_at(
                NodeRecord::new("R", NodeKind::Relay, "r:1", Partition::Alpha),
                1_000,
            )
            .unwrap();

        let cores = registry.list_healthy_at(NodeKind::Core, None, 1_500);
        assert_eq!(cores.len(), 2);
        let alpha = registry.list_healthy_at(NodeKind::Core, Some(Partition::Alpha), 1_500);
        assert_eq!(alpha.len(), 1);
        assert_eq!(alpha[0].node_id, "A");
    }

    #[test]
    fn test_missed_heartbeats_exclude_node() {
        let registry = NodeRegistry::new(timeouts());
        registry.register_at(core("A", Partition::Alpha), 10_000).unwrap();
        assert_eq!(registry.list_healthy_at(NodeKind::Core, None, 10_900).len(), 1);

        // Past stale_after_ms without a heartbeat
        assert!(registry.list_healthy_at(NodeKind::Core, None, 11_001).is_empty());
        let all = registry.list_all_at(11_001);
        assert_eq!(all[0].status, NodeStatus::Stale);
        assert_eq!(registry.list_all_at(15_001)[0].status, NodeStatus::Unreachable);
    }

    #[test]
    fn test_heartbeat_restores_health() {
        let registry = NodeRegistry::new(timeouts());
        registry.register_at(core("A", Partition::Alpha), 0).unwrap();
        registry.sweep_at(2_000);
        assert_eq!(registry.list_all_at(2_000)[0].status, NodeStatus::Stale);

        let coord = GeoCoordinate::new(40.71, -74.0, 5.0);
        let record = registry.heartbeat_at("A", 42, Some(coord), 2_100).unwrap();
        assert_eq!(record.status, NodeStatus::Healthy);
        assert_eq!(record.latency_ms, 42);
        assert_eq!(record.coordinate, Some(coord));
        assert_eq!(registry.list_healthy_at(NodeKind::Core, None, 2_200).len(), 1);
    }

    #[test]
    fn test_heartbeat_unknown_node() {
        let registry = NodeRegistry::new(timeouts());
        assert_eq!(
            registry.heartbeat_at("ghost", 1, None, 0),
            Err(RegistryError::NotFound("ghost".into()))
        );
    }

    #[test]
    fn test_probe_failures_mark_unreachable() {
        let registry = NodeRegistry::new(timeouts());
        registry.register_at(core("A", Partition::Alpha), 0).unwrap();

        assert_eq!(registry.record_probe_failure_at("A", 10).unwrap(), NodeStatus::Healthy);
        assert_eq!(registry.record_probe_failure_at("A", 20).unwrap(), NodeStatus::Healthy);
        assert_eq!(
            registry.record_probe_failure_at("A", 30).unwrap(),
            NodeStatus::Unreachable
        );
        assert!(registry.list_healthy_at(NodeKind::Core, None, 40).is_empty());

        registry.heartbeat_at("A", 5, None, 50).unwrap();
        assert_eq!(registry.list_healthy_at(NodeKind::Core, None, 60).len(), 1);
    }

    #[test]
    fn test_mark_unreachable_is_sticky_until_heartbeat() {
        let registry = NodeRegistry::new(timeouts());
        registry.register_at(core("A", Partition::Alpha), 0).unwrap();
        registry.mark_unreachable("A").unwrap();
        assert!(registry.list_healthy_at(NodeKind::Core, None, 1).is_empty());
        registry.sweep_at(2);
        assert_eq!(registry.list_all_at(2)[0].status, NodeStatus::Unreachable);
        assert!(registry.mark_unreachable("missing").is_err());
    }

    #[test]
    fn test_sweep_reports_and_evicts() {
        let registry = NodeRegistry::new(timeouts());
        registry.register_at(core("A", Partition::Alpha), 0).unwrap();
        registry.register_at(core("B", Partition::Beta), 3_000).unwrap();

        let report = registry.sweep_at(6_000);
        assert_eq!(report.unreachable, 1);
        assert_eq!(report.stale, 1);

        // Transitions are only reported once
        assert_eq!(registry.sweep_at(6_100), SweepReport::default());

        let report = registry.sweep_at(61_000);
        assert_eq!(report.evicted, vec!["A".to_string()]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let registry = NodeRegistry::new(timeouts());
        registry.register_at(core("X", Partition::Alpha), 0).unwrap();
        let relay = NodeRecord::new("X", NodeKind::Relay, "x:1", Partition::Alpha);
        assert!(matches!(
            registry.register_at(relay, 1),
            Err(RegistryError::KindMismatch { .. })
        ));
    }

    #[test]
    fn test_reregistration_keeps_counters() {
        let registry = NodeRegistry::new(timeouts());
        registry.register_at(core("A", Partition::Alpha), 0).unwrap();
        registry.record_outcome("A", 30, true);
        registry.record_outcome("A", 0, false);

        let again = registry.register_at(core("A", Partition::Gamma), 10).unwrap();
        assert_eq!(again.processed_count, 2);
        assert_eq!(again.failed_count, 1);
        assert_eq!(again.partition, Partition::Gamma);
        assert_eq!(again.registered_at_ms, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_heartbeats_do_not_tear() {
        let registry = NodeRegistry::new(timeouts());
        for i in 0..8 {
            registry
                .register(core(&format!("N{}", i), Partition::Alpha))
                .unwrap();
        }

        let mut handles = Vec::new();
        for i in 0..8u64 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                for j in 0..200u64 {
                    let coord = GeoCoordinate::new(j as f64 / 10.0, j as f64 / 10.0, 1.0);
                    registry
                        .heartbeat(&format!("N{}", i), j, Some(coord))
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        for record in registry.list_all() {
            // latency and coordinate were written together
            let coord = record.coordinate.unwrap();
            assert_eq!(record.latency_ms, 199);
            assert_eq!(coord.latitude, 19.9);
        }
    }
}
