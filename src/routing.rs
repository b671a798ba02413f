//! Multi-factor core node selection.
//!
//! `score = latency_term + proximity_term + affinity_term`, where
//!
//! - `latency_term   = w_lat  * max(0, K_LAT  - latency_ms) / 10`
//! - `proximity_term = w_prox * max(0, K_DIST - distance_m) / 100` (both sides need coordinates)
//! - `affinity_term  = K_AFFINITY` when the node's partition matches the request
//!
//! Scores are recomputed on every call. The engine remembers the last
//! factors it computed per node for diagnostics only; they never feed back
//! into a selection.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::config::RoutingConfig;
use crate::constants::routing::{DISTANCE_DIVISOR, LATENCY_DIVISOR};
use crate::types::{unix_millis, NodeRecord, RoutingRequest};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoutingFactors {
    pub latency: f64,
    pub proximity: f64,
    pub affinity: f64,
    pub total: f64,
    pub distance_m: Option<f64>,
    pub computed_at_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingSnapshotEntry {
    pub node: NodeRecord,
    pub factors: RoutingFactors,
}

pub struct RoutingEngine {
    weights: RoutingConfig,
    last_factors: DashMap<String, RoutingFactors>,
}

impl RoutingEngine {
    pub fn new(weights: RoutingConfig) -> Self {
        Self {
            weights,
            last_factors: DashMap::new(),
        }
    }

    pub fn weights(&self) -> &RoutingConfig {
        &self.weights
    }

    /// Pure scoring of one candidate for one request.
    pub fn score(&self, request: &RoutingRequest, candidate: &NodeRecord) -> RoutingFactors {
        let w = &self.weights;

        let latency = w.latency
            * (w.latency_ceiling_ms - candidate.latency_ms as f64).max(0.0)
            / LATENCY_DIVISOR;

        let distance_m = match (&request.requester, &candidate.coordinate) {
            (Some(from), Some(to)) => Some(from.distance_m(to)),
            _ => None,
        };
        let proximity = distance_m
            .map(|d| w.proximity * ((w.distance_ceiling_m - d) / DISTANCE_DIVISOR).max(0.0))
            .unwrap_or(0.0);

        let affinity = match request.affinity {
            Some(wanted) if wanted == candidate.partition => w.affinity,
            _ => 0.0,
        };

        RoutingFactors {
            latency,
            proximity,
            affinity,
            total: latency + proximity + affinity,
            distance_m,
            computed_at_ms: unix_millis(),
        }
    }

    /// Pick the best candidate, or `None` when there is nothing to route to.
    ///
    /// Ties go to the most recently confirmed node (largest `last_seen_ms`),
    /// then to the smallest node id.
    pub fn select_target(
        &self,
        request: &RoutingRequest,
        candidates: &[NodeRecord],
    ) -> Option<NodeRecord> {
        let mut best: Option<(&NodeRecord, f64)> = None;

        for candidate in candidates {
            let factors = self.score(request, candidate);
            self.last_factors
                .insert(candidate.node_id.clone(), factors);

            best = match best {
                None => Some((candidate, factors.total)),
                Some((current, current_total)) => {
                    if Self::outranks(candidate, factors.total, current, current_total) {
                        Some((candidate, factors.total))
                    } else {
                        Some((current, current_total))
                    }
                }
            };
        }

        best.map(|(node, total)| {
            tracing::debug!(node_id = %node.node_id, score = total, "route selected");
            node.clone()
        })
    }

    fn outranks(a: &NodeRecord, a_total: f64, b: &NodeRecord, b_total: f64) -> bool {
        match a_total.partial_cmp(&b_total).unwrap_or(Ordering::Equal) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => match a.last_seen_ms.cmp(&b.last_seen_ms) {
                Ordering::Greater => true,
                Ordering::Less => false,
                Ordering::Equal => a.node_id < b.node_id,
            },
        }
    }

    /// Every node with the factors last computed for it, best first. Nodes
    /// never scored are evaluated against an affinity-free request.
    pub fn snapshot(&self, nodes: &[NodeRecord]) -> Vec<RoutingSnapshotEntry> {
        let neutral = RoutingRequest::new(crate::types::Transaction::new(Vec::new()));

        let mut entries: Vec<RoutingSnapshotEntry> = nodes
            .iter()
            .map(|node| {
                let factors = self
                    .last_factors
                    .get(&node.node_id)
                    .map(|f| *f.value())
                    .unwrap_or_else(|| self.score(&neutral, node));
                RoutingSnapshotEntry {
                    node: node.clone(),
                    factors,
                }
            })
            .collect();

        entries.sort_by(|a, b| {
            b.factors
                .total
                .partial_cmp(&a.factors.total)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.node.node_id.cmp(&b.node.node_id))
        });
        entries
    }

    /// Factors last computed for `node_id`, if it has been scored.
    pub fn last_factors(&self, node_id: &str) -> Option<RoutingFactors> {
        self.last_factors.get(node_id).map(|f| *f.value())
    }

    pub fn tracked(&self) -> usize {
        self.last_factors.len()
    }

    /// Drop diagnostics for a node that left the registry.
    pub fn forget(&self, node_id: &str) {
        self.last_factors.remove(node_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GeoCoordinate, NodeKind, Partition, Transaction};

    fn engine() -> RoutingEngine {
        RoutingEngine::new(RoutingConfig::default())
    }

    fn core(id: &str, latency_ms: u64, partition: Partition, last_seen_ms: u64) -> NodeRecord {
        let mut node = NodeRecord::new(id, NodeKind::Core, format!("{}:8888", id), partition)
            .with_latency(latency_ms);
        node.last_seen_ms = last_seen_ms;
        node
    }

    fn request(affinity: Option<Partition>) -> RoutingRequest {
        RoutingRequest::new(Transaction::new(b"tx".to_vec())).with_affinity(affinity)
    }

    #[test]
    fn test_empty_candidates_yield_none() {
        assert!(engine().select_target(&request(None), &[]).is_none());
        assert!(engine()
            .select_target(&request(Some(Partition::Alpha)), &[])
            .is_none());
    }

    #[test]
    fn test_low_latency_affinity_node_wins() {
        let a = core("A", 20, Partition::Alpha, 100);
        let b = core("B", 200, Partition::Beta, 100);
        let engine = engine();

        let picked = engine
            .select_target(&request(Some(Partition::Alpha)), &[b.clone(), a.clone()])
            .unwrap();
        assert_eq!(picked.node_id, "A");

        let fa = engine.score(&request(Some(Partition::Alpha)), &a);
        assert_eq!(fa.latency, 98.0);
        assert_eq!(fa.affinity, 20.0);
        assert_eq!(fa.total, 118.0);
    }

    #[test]
    fn test_affinity_can_outweigh_small_latency_gap() {
        // 50ms slower costs 5 points, affinity is worth 20
        let near = core("FAST", 10, Partition::Beta, 0);
        let affine = core("AFFINE", 60, Partition::Gamma, 0);
        let picked = engine()
            .select_target(&request(Some(Partition::Gamma)), &[near, affine])
            .unwrap();
        assert_eq!(picked.node_id, "AFFINE");
    }

    #[test]
    fn test_tie_goes_to_most_recent_heartbeat() {
        let older = core("OLD", 50, Partition::Alpha, 1_000);
        let newer = core("NEW", 50, Partition::Alpha, 2_000);
        let engine = engine();

        for order in [vec![older.clone(), newer.clone()], vec![newer.clone(), older.clone()]] {
            let picked = engine.select_target(&request(None), &order).unwrap();
            assert_eq!(picked.node_id, "NEW");
        }
    }

    #[test]
    fn test_full_tie_is_deterministic() {
        let x = core("X", 50, Partition::Alpha, 1_000);
        let y = core("Y", 50, Partition::Alpha, 1_000);
        let engine = engine();
        assert_eq!(
            engine.select_target(&request(None), &[y.clone(), x.clone()]).unwrap().node_id,
            "X"
        );
        assert_eq!(engine.select_target(&request(None), &[x, y]).unwrap().node_id, "X");
    }

    #[test]
    fn test_proximity_needs_both_coordinates() {
        let here = GeoCoordinate::new(40.7128, -74.0060, 5.0);
        let close = core("CLOSE", 100, Partition::Alpha, 0)
            .with_coordinate(GeoCoordinate::new(40.7228, -74.0060, 5.0));
        let engine = engine();

        let with_coord = request(None).with_requester(Some(here));
        let f = engine.score(&with_coord, &close);
        let d = f.distance_m.unwrap();
        assert!((1_100.0..1_125.0).contains(&d), "distance {}", d);
        assert!((f.proximity - (10_000.0 - d) / 100.0).abs() < 1e-9);

        let f = engine.score(&request(None), &close);
        assert_eq!(f.proximity, 0.0);
        assert!(f.distance_m.is_none());
    }

    #[test]
    fn test_far_and_slow_terms_floor_at_zero() {
        let here = GeoCoordinate::new(0.0, 0.0, 1.0);
        let far = core("FAR", 5_000, Partition::Alpha, 0)
            .with_coordinate(GeoCoordinate::new(10.0, 10.0, 1.0));
        let f = engine().score(&request(None).with_requester(Some(here)), &far);
        assert_eq!(f.latency, 0.0);
        assert_eq!(f.proximity, 0.0);
        assert_eq!(f.total, 0.0);
    }

    #[test]
    fn test_weights_scale_terms() {
        let engine = RoutingEngine::new(RoutingConfig {
            latency: 2.0,
            affinity: 5.0,
            ..RoutingConfig::default()
        });
        let f = engine.score(
            &request(Some(Partition::Delta)),
            &core("D", 0, Partition::Delta, 0),
        );
        assert_eq!(f.latency, 200.0);
        assert_eq!(f.affinity, 5.0);
    }

    #[test]
    fn test_snapshot_orders_by_score() {
        let engine = engine();
        let a = core("A", 20, Partition::Alpha, 0);
        let b = core("B", 200, Partition::Beta, 0);
        engine.select_target(&request(Some(Partition::Beta)), &[a.clone(), b.clone()]);

        let snapshot = engine.snapshot(&[a, b, core("C", 900, Partition::Zeta, 0)]);
        let ids: Vec<_> = snapshot.iter().map(|e| e.node.node_id.as_str()).collect();
        assert_eq!(ids, vec!["B", "A", "C"]);
        // B: 80 + 20 affinity from the last real request
        assert_eq!(snapshot[0].factors.total, 100.0);
        assert_eq!(snapshot[2].factors.total, 10.0);
    }
}
