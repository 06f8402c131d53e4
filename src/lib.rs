//! Warden: a replicated advisory lock service.
//!
//! Clients request exclusive locks on named objects; the service grants at
//! most one owner per object, enforces leases so a crashed owner cannot hold
//! a lock forever, and replicates the lock map across a small cluster through
//! a leader-driven raft log.
//!
//! The crate splits into a server half and a client half:
//!
//! - [`store`]: the canonical lock map with lease arithmetic.
//! - [`raft`]: consensus type config, log storage, the replicated state
//!   machine, and the HTTP transport between peers.
//! - [`server`]: node orchestration plus the JSON lock protocol, with
//!   non-leader nodes proxying every request to the leader.
//! - [`client`]: the request layer with its advisory LRU cache, bounded
//!   sessions that release their holdings on expiry, a poll-based watcher,
//!   and the FIFO pounce queue for contended locks.

pub mod client;
pub mod constants;
pub mod raft;
pub mod server;
pub mod store;

pub use client::session::{Session, SessionManager};
pub use client::{ClientConfig, Descriptor, HttpLockClient, LockRpc};
pub use server::{Node, NodeConfig};
pub use store::{LockEntry, LockError, LockStore};
