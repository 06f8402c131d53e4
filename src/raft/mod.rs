//! Consensus integration: type config, storage, transport, and RPC surface.

pub mod network;
pub mod server;
pub mod storage;
pub mod types;

use std::sync::Arc;

use openraft::{Config, ConfigError};

use crate::constants::{ELECTION_TIMEOUT_MAX_MS, ELECTION_TIMEOUT_MIN_MS, HEARTBEAT_INTERVAL_MS};

/// Validated raft config with the service's election/heartbeat tuning.
pub fn raft_config() -> Result<Arc<Config>, ConfigError> {
    let config = Config {
        cluster_name: "warden".to_string(),
        heartbeat_interval: HEARTBEAT_INTERVAL_MS,
        election_timeout_min: ELECTION_TIMEOUT_MIN_MS,
        election_timeout_max: ELECTION_TIMEOUT_MAX_MS,
        ..Default::default()
    };
    Ok(Arc::new(config.validate()?))
}
