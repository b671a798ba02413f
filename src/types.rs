use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::constants::geo::EARTH_RADIUS_M;

pub type Hash256 = [u8; 32];

/// Milliseconds since the Unix epoch, wall clock.
pub fn unix_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// SHA-256 of the raw payload bytes.
pub fn fingerprint(payload: &[u8]) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.finalize().into()
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Core,
    Relay,
}

impl NodeKind {
    /// Prefix used when generating node ids for this kind.
    pub fn id_prefix(&self) -> &'static str {
        match self {
            NodeKind::Core => "CORE_",
            NodeKind::Relay => "RELAY_",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Core => write!(f, "core"),
            NodeKind::Relay => write!(f, "relay"),
        }
    }
}

impl FromStr for NodeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "core" => Ok(NodeKind::Core),
            "relay" => Ok(NodeKind::Relay),
            other => Err(format!("unknown node kind '{}'", other)),
        }
    }
}

/// The fixed set of named partitions a node can belong to.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum Partition {
    Alpha,
    Beta,
    Gamma,
    Delta,
    Epsilon,
    Zeta,
}

impl Partition {
    pub const ALL: [Partition; 6] = [
        Partition::Alpha,
        Partition::Beta,
        Partition::Gamma,
        Partition::Delta,
        Partition::Epsilon,
        Partition::Zeta,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Partition::Alpha => "ALPHA",
            Partition::Beta => "BETA",
            Partition::Gamma => "GAMMA",
            Partition::Delta => "DELTA",
            Partition::Epsilon => "EPSILON",
            Partition::Zeta => "ZETA",
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Partition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();
        Partition::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == upper)
            .ok_or_else(|| format!("unknown partition '{}'", s))
    }
}

/// A geographic position supplied by the caller or a registered node.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct GeoCoordinate {
    pub latitude: f64,
    pub longitude: f64,
    /// Accuracy radius in meters
    #[serde(default)]
    pub accuracy_m: f64,
}

impl GeoCoordinate {
    pub fn new(latitude: f64, longitude: f64, accuracy_m: f64) -> Self {
        Self {
            latitude,
            longitude,
            accuracy_m,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
            && self.accuracy_m >= 0.0
    }

    /// Great-circle distance in meters (haversine).
    pub fn distance_m(&self, other: &GeoCoordinate) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let d_lat = lat2 - lat1;
        let d_lon = (other.longitude - self.longitude).to_radians();

        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
        EARTH_RADIUS_M * c
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Healthy,
    Stale,
    Unreachable,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Healthy => write!(f, "healthy"),
            NodeStatus::Stale => write!(f, "stale"),
            NodeStatus::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// A peer node as tracked by the registry. Callers only ever see clones.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NodeRecord {
    pub node_id: String,
    pub kind: NodeKind,
    pub address: String,
    pub partition: Partition,
    pub last_seen_ms: u64,
    pub latency_ms: u64,
    pub coordinate: Option<GeoCoordinate>,
    pub status: NodeStatus,
    pub registered_at_ms: u64,
    #[serde(default)]
    pub probe_failures: u32,
    #[serde(default)]
    pub processed_count: u64,
    #[serde(default)]
    pub failed_count: u64,
}

impl NodeRecord {
    pub fn new(
        node_id: impl Into<String>,
        kind: NodeKind,
        address: impl Into<String>,
        partition: Partition,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            kind,
            address: address.into(),
            partition,
            last_seen_ms: 0,
            latency_ms: 0,
            coordinate: None,
            status: NodeStatus::Healthy,
            registered_at_ms: 0,
            probe_failures: 0,
            processed_count: 0,
            failed_count: 0,
        }
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn with_coordinate(mut self, coordinate: GeoCoordinate) -> Self {
        self.coordinate = Some(coordinate);
        self
    }
}

/// Generate a fresh node id such as `RELAY_9F2C01AB33D4E5F6`.
pub fn generate_node_id(kind: NodeKind) -> String {
    let bytes: [u8; 8] = rand::random();
    format!("{}{}", kind.id_prefix(), hex::encode_upper(bytes))
}

/// A transaction as it travels from the relay to a core node.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Transaction {
    pub payload: Vec<u8>,
    pub submitted_at_ms: u64,
    /// Destination label set by the bridge for multi-target dispatch
    #[serde(default)]
    pub destination: Option<String>,
}

impl Transaction {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            payload,
            submitted_at_ms: unix_millis(),
            destination: None,
        }
    }

    pub fn fingerprint(&self) -> Hash256 {
        fingerprint(&self.payload)
    }

    pub fn id(&self) -> String {
        hex::encode(self.fingerprint())
    }
}

/// The unit being routed. Lives for one routing decision.
#[derive(Clone, Debug)]
pub struct RoutingRequest {
    pub requester: Option<GeoCoordinate>,
    pub affinity: Option<Partition>,
    pub transaction: Transaction,
    /// Caller-supplied deadline covering the whole pipeline
    pub deadline: Option<tokio::time::Instant>,
}

impl RoutingRequest {
    pub fn new(transaction: Transaction) -> Self {
        Self {
            requester: None,
            affinity: None,
            transaction,
            deadline: None,
        }
    }

    pub fn with_requester(mut self, coordinate: Option<GeoCoordinate>) -> Self {
        self.requester = coordinate;
        self
    }

    pub fn with_affinity(mut self, affinity: Option<Partition>) -> Self {
        self.affinity = affinity;
        self
    }

    pub fn with_deadline(mut self, deadline: tokio::time::Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn submitted_at_ms(&self) -> u64 {
        self.transaction.submitted_at_ms
    }
}

/// Successful commit reported by a core node.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CommitResult {
    pub transaction_id: String,
    pub node_id: String,
    pub partition: Partition,
    pub consensus_latency_ms: u64,
    pub committed_at_ms: u64,
}

/// What the relay hands back for an admitted, routed and committed request.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RelayResult {
    pub transaction_id: String,
    pub relay_node_id: String,
    pub source_node_id: String,
    pub routed_to: String,
    pub routed_address: String,
    pub partition: Partition,
    pub consensus_latency_ms: u64,
    pub processing_time_ms: u64,
    pub submitted_at_ms: u64,
    #[serde(default)]
    pub destination: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_parse_is_case_insensitive() {
        assert_eq!("alpha".parse::<Partition>().unwrap(), Partition::Alpha);
        assert_eq!(" ZETA ".parse::<Partition>().unwrap(), Partition::Zeta);
        assert!("OMEGA".parse::<Partition>().is_err());
    }

    #[test]
    fn test_distance_same_point_is_zero() {
        let nyc = GeoCoordinate::new(40.7128, -74.0060, 5.0);
        assert!(nyc.distance_m(&nyc) < 1e-6);
    }

    #[test]
    fn test_distance_nyc_to_london() {
        let nyc = GeoCoordinate::new(40.7128, -74.0060, 5.0);
        let london = GeoCoordinate::new(51.5074, -0.1278, 5.0);
        let km = nyc.distance_m(&london) / 1000.0;
        // ~5570 km
        assert!((5550.0..5600.0).contains(&km), "got {} km", km);
    }

    #[test]
    fn test_invalid_coordinates() {
        assert!(!GeoCoordinate::new(91.0, 0.0, 1.0).is_valid());
        assert!(!GeoCoordinate::new(0.0, f64::NAN, 1.0).is_valid());
        assert!(GeoCoordinate::new(-33.86, 151.2, 10.0).is_valid());
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let a = Transaction::new(b"transfer 10".to_vec());
        let b = Transaction::new(b"transfer 10".to_vec());
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.id().len(), 64);
        assert_ne!(a.fingerprint(), fingerprint(b"transfer 11"));
    }

    #[test]
    fn test_generated_node_ids() {
        let id = generate_node_id(NodeKind::Relay);
        assert!(id.starts_with("RELAY_"));
        assert_eq!(id.len(), "RELAY_".len() + 16);
        assert_ne!(id, generate_node_id(NodeKind::Relay));
    }
}
