//! Global constants for the relay network
//!
//! Defaults for every tunable live here; `config.rs` reads them when it
//! generates a fresh configuration.

/// Geographic constants
pub mod geo {
    /// Equatorial earth radius in meters (WGS-84)
    pub const EARTH_RADIUS_M: f64 = 6_378_137.0;
}

/// Routing score constants
pub mod routing {
    /// K_LAT: latencies at or above this contribute nothing
    pub const LATENCY_CEILING_MS: f64 = 1000.0;
    pub const LATENCY_DIVISOR: f64 = 10.0;

    /// K_DIST: distances at or above this contribute nothing
    pub const DISTANCE_CEILING_M: f64 = 10_000.0;
    pub const DISTANCE_DIVISOR: f64 = 100.0;

    /// K_AFFINITY: bonus for matching the requested partition
    pub const AFFINITY_BONUS: f64 = 20.0;
}

/// Consensus defaults
pub mod consensus {
    /// Upper bound for a commit decision (<100ms target)
    pub const DEADLINE_MS: u64 = 100;

    /// Fixed processing delay of the trivial-delay protocol
    pub const PROCESSING_DELAY_MS: u64 = 10;

    pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;
}

/// Heartbeat and health sweep defaults
pub mod heartbeat {
    /// Three check intervals: one slow or missed round never marks a node stale
    pub const STALE_AFTER_MS: u64 = 90_000;
    pub const UNREACHABLE_AFTER_MS: u64 = 180_000;
    pub const EVICT_AFTER_MS: u64 = 24 * 60 * 60 * 1000;
    pub const SWEEP_INTERVAL_MS: u64 = 5_000;
    pub const PROBE_INTERVAL_MS: u64 = 30_000;
    pub const MAX_PROBE_FAILURES: u32 = 3;
}

/// Relay admission defaults
pub mod rate_limit {
    /// 10,000 tx/minute relay capacity
    pub const CAPACITY_PER_WINDOW: u32 = 10_000;
    pub const WINDOW_MS: u64 = 60_000;

    /// Idle windows are dropped after this many window lengths
    pub const IDLE_WINDOWS_BEFORE_CLEANUP: u32 = 10;
    pub const CLEANUP_INTERVAL_SECS: u64 = 10;
}

/// Network constants
pub mod network {
    pub const DEFAULT_CORE_PORT: u16 = 8888;
    pub const DEFAULT_RPC_PORT: u16 = 8892;
    pub const FORWARD_TIMEOUT_MS: u64 = 2_000;
    pub const CONNECT_TIMEOUT_MS: u64 = 1_000;

    /// Maximum wire frame (4MB)
    pub const MAX_FRAME_SIZE: u32 = 4 * 1024 * 1024;
}
