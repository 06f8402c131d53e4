//! Process-wide constants.

use std::time::Duration;

/// Upper bound on a single consensus proposal, from submit to commit.
pub const RAFT_APPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Lock lease applied when the node config does not override it.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(5);

/// Client session lifetime applied when the client config does not override it.
pub const DEFAULT_SESSION_LEASE: Duration = Duration::from_secs(30);

/// Interval between watcher probes of the check endpoint.
pub const WATCH_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default capacity of the client-side ownership cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 64;

/// Raft election/heartbeat tuning (milliseconds).
pub const HEARTBEAT_INTERVAL_MS: u64 = 250;
pub const ELECTION_TIMEOUT_MIN_MS: u64 = 750;
pub const ELECTION_TIMEOUT_MAX_MS: u64 = 1500;
