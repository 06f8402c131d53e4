//! Canonical lock ownership state for a single node.
//!
//! The store is the single source of truth for which owner holds which
//! object. Every public operation serializes under one mutex, and every
//! mutation goes through [`LockStore::acquire`] or [`LockStore::release`].
//! Leases bound how long an entry stays authoritative: once
//! `now - acquired_at` exceeds the lease, the entry is treated as free and
//! the next acquire overwrites it.
//!
//! The store does no I/O and never retries; outcomes are returned as values
//! so the replicated state machine can forward them through the consensus
//! future unchanged.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tracing::debug;

/// Contention outcomes of lock-map transitions.
///
/// Display strings double as the HTTP error bodies, so they are part of the
/// wire contract.
#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockError {
    /// The object is held by a live lease.
    #[snafu(display("file already acquired"))]
    Held,
    /// Release of an object that has no entry.
    #[snafu(display("file cannot be released, wasn't locked before"))]
    NotHeld,
    /// Release of an entry whose lease has already lapsed.
    #[snafu(display("file cannot be released, lease of lock has expired"))]
    Expired,
    /// Release by an owner that does not hold the entry.
    #[snafu(display("file cannot be released, unauthorized access"))]
    Unauthorized,
}

/// Snapshot encode/decode failures.
#[derive(Debug, Snafu)]
pub enum SnapshotError {
    #[snafu(display("failed to encode lock map: {source}"))]
    Encode { source: serde_json::Error },

    #[snafu(display("failed to decode lock map: {source}"))]
    Decode { source: serde_json::Error },
}

/// One owner registration.
///
/// `acquired_at` is the instant (unix milliseconds) of the *most recent*
/// successful acquire, not the first one: taking over an expired entry
/// refreshes the stamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEntry {
    pub owner: String,
    pub acquired_at: u64,
}

#[derive(Debug, Default)]
struct LockMap {
    entries: BTreeMap<String, LockEntry>,
    /// Highest timestamp handed out so far. Successive acquires must see
    /// non-decreasing stamps even if the wall clock steps backwards.
    last_stamp: u64,
}

impl LockMap {
    fn now(&mut self) -> u64 {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        self.last_stamp = self.last_stamp.max(wall);
        self.last_stamp
    }
}

/// Mutex-guarded object → owner map with lease-based expiry.
#[derive(Debug)]
pub struct LockStore {
    lease: Duration,
    map: Mutex<LockMap>,
}

impl LockStore {
    /// Create a store whose entries stay authoritative for `lease`.
    ///
    /// # Panics
    ///
    /// Panics if `lease` is zero; a zero lease would make every entry
    /// expired at birth.
    pub fn new(lease: Duration) -> Self {
        assert!(lease > Duration::ZERO, "lease duration must be positive");
        Self {
            lease,
            map: Mutex::new(LockMap::default()),
        }
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    fn has_lease_expired(&self, acquired_at: u64, now: u64) -> bool {
        now.saturating_sub(acquired_at) > self.lease.as_millis() as u64
    }

    /// Read-only probe: would an acquire by `owner` succeed right now?
    ///
    /// Used by the routing layer to reject contended requests before they
    /// reach the replicated log.
    pub fn try_acquire(&self, object: &str, owner: &str) -> Result<(), LockError> {
        let mut map = self.map.lock();
        let now = map.now();
        match map.entries.get(object) {
            Some(entry) if !self.has_lease_expired(entry.acquired_at, now) => {
                debug!(object, owner, holder = %entry.owner, "try_acquire rejected, already held");
                Err(LockError::Held)
            }
            _ => Ok(()),
        }
    }

    /// Atomically take ownership of `object` if it is free or expired.
    ///
    /// This is the only path that writes entries.
    pub fn acquire(&self, object: &str, owner: &str) -> Result<(), LockError> {
        let mut map = self.map.lock();
        let now = map.now();
        match map.entries.get(object) {
            Some(entry) if !self.has_lease_expired(entry.acquired_at, now) => {
                debug!(object, owner, holder = %entry.owner, "can't acquire, already been acquired");
                Err(LockError::Held)
            }
            _ => {
                map.entries.insert(
                    object.to_owned(),
                    LockEntry {
                        owner: owner.to_owned(),
                        acquired_at: now,
                    },
                );
                debug!(object, owner, acquired_at = now, "locked");
                Ok(())
            }
        }
    }

    /// Read-only probe: would a release by `owner` succeed right now?
    pub fn try_release(&self, object: &str, owner: &str) -> Result<(), LockError> {
        let mut map = self.map.lock();
        let now = map.now();
        match map.entries.get(object) {
            None => {
                debug!(object, owner, "try_release rejected, hasn't been acquired");
                Err(LockError::NotHeld)
            }
            Some(entry) if self.has_lease_expired(entry.acquired_at, now) => {
                debug!(object, owner, "try_release rejected, lease of lock has expired");
                Err(LockError::Expired)
            }
            Some(entry) if entry.owner != owner => {
                debug!(object, owner, holder = %entry.owner, "try_release rejected, unauthorized access");
                Err(LockError::Unauthorized)
            }
            Some(_) => Ok(()),
        }
    }

    /// Atomically delete the entry iff `owner` holds it within its lease.
    pub fn release(&self, object: &str, owner: &str) -> Result<(), LockError> {
        let mut map = self.map.lock();
        let now = map.now();
        match map.entries.get(object) {
            None => {
                debug!(object, owner, "can't release, hasn't been acquired");
                Err(LockError::NotHeld)
            }
            Some(entry) if self.has_lease_expired(entry.acquired_at, now) => {
                debug!(object, owner, "can't release, lease of lock has expired");
                Err(LockError::Expired)
            }
            Some(entry) if entry.owner != owner => {
                debug!(object, owner, holder = %entry.owner, "can't release, unauthorized access");
                Err(LockError::Unauthorized)
            }
            Some(_) => {
                map.entries.remove(object);
                debug!(object, owner, "released");
                Ok(())
            }
        }
    }

    /// Current owner of `object`, regardless of lease state.
    ///
    /// Staleness decisions are left to the caller.
    pub fn lookup(&self, object: &str) -> Option<String> {
        let map = self.map.lock();
        map.entries.get(object).map(|entry| entry.owner.clone())
    }

    /// Point-in-time copy of the full map.
    ///
    /// The mutex is held only for the clone; serialization happens outside.
    pub fn entries(&self) -> BTreeMap<String, LockEntry> {
        self.map.lock().entries.clone()
    }

    /// Serialize the full map as JSON.
    pub fn snapshot(&self) -> Result<Vec<u8>, SnapshotError> {
        let entries = self.entries();
        serde_json::to_vec(&entries).context(EncodeSnafu)
    }

    /// Replace the map wholesale from snapshot bytes.
    ///
    /// No notifications are emitted; previously held entries are exactly as
    /// persisted.
    pub fn restore(&self, bytes: &[u8]) -> Result<(), SnapshotError> {
        let entries: BTreeMap<String, LockEntry> =
            serde_json::from_slice(bytes).context(DecodeSnafu)?;
        self.replace(entries);
        Ok(())
    }

    /// Swap in a fully formed map, keeping timestamp monotonicity intact.
    pub fn replace(&self, entries: BTreeMap<String, LockEntry>) {
        let mut map = self.map.lock();
        let max_stamp = entries
            .values()
            .map(|entry| entry.acquired_at)
            .max()
            .unwrap_or(0);
        map.last_stamp = map.last_stamp.max(max_stamp);
        map.entries = entries;
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use proptest::prelude::*;

    use super::*;

    fn store() -> LockStore {
        LockStore::new(Duration::from_secs(5))
    }

    #[test]
    fn acquire_then_lookup() {
        let ls = store();
        ls.acquire("file1", "owner1").unwrap();
        assert_eq!(ls.lookup("file1").as_deref(), Some("owner1"));
    }

    #[test]
    fn second_acquire_is_rejected() {
        let ls = store();
        ls.acquire("file1", "owner1").unwrap();
        assert_eq!(ls.acquire("file1", "owner2"), Err(LockError::Held));
        assert_eq!(ls.try_acquire("file1", "owner2"), Err(LockError::Held));
        // try_acquire never mutates
        assert_eq!(ls.lookup("file1").as_deref(), Some("owner1"));
    }

    #[test]
    fn release_by_owner_frees_the_object() {
        let ls = store();
        ls.acquire("file1", "owner1").unwrap();
        ls.release("file1", "owner1").unwrap();
        assert_eq!(ls.lookup("file1"), None);
        assert!(ls.acquire("file1", "owner2").is_ok());
    }

    #[test]
    fn release_errors() {
        let ls = store();
        assert_eq!(ls.release("file1", "owner1"), Err(LockError::NotHeld));
        ls.acquire("file1", "owner1").unwrap();
        assert_eq!(ls.release("file1", "owner2"), Err(LockError::Unauthorized));
        assert_eq!(ls.try_release("file1", "owner2"), Err(LockError::Unauthorized));
        assert!(ls.try_release("file1", "owner1").is_ok());
    }

    #[test]
    fn expired_lease_opens_the_object() {
        let ls = LockStore::new(Duration::from_millis(50));
        ls.acquire("file1", "owner1").unwrap();
        thread::sleep(Duration::from_millis(120));
        // owner1 can no longer release...
        assert_eq!(ls.release("file1", "owner1"), Err(LockError::Expired));
        assert_eq!(ls.try_release("file1", "owner1"), Err(LockError::Expired));
        // ...but anyone can take the lock over.
        assert!(ls.try_acquire("file1", "owner2").is_ok());
        ls.acquire("file1", "owner2").unwrap();
        assert_eq!(ls.lookup("file1").as_deref(), Some("owner2"));
    }

    #[test]
    fn takeover_refreshes_the_stamp() {
        let ls = LockStore::new(Duration::from_millis(50));
        ls.acquire("file1", "owner1").unwrap();
        let first = ls.entries()["file1"].acquired_at;
        thread::sleep(Duration::from_millis(120));
        ls.acquire("file1", "owner2").unwrap();
        assert!(ls.entries()["file1"].acquired_at > first);
    }

    #[test]
    fn snapshot_roundtrip_is_identity() {
        let ls = store();
        ls.acquire("a", "owner1").unwrap();
        ls.acquire("b", "owner2").unwrap();
        let bytes = ls.snapshot().unwrap();

        let restored = store();
        restored.restore(&bytes).unwrap();
        assert_eq!(restored.entries(), ls.entries());
    }

    #[test]
    fn restore_rejects_garbage() {
        let ls = store();
        assert!(ls.restore(b"not json").is_err());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Acquire(u8, u8),
        Release(u8, u8),
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..4, 0u8..4).prop_map(|(o, u)| Op::Acquire(o, u)),
            (0u8..4, 0u8..4).prop_map(|(o, u)| Op::Release(o, u)),
        ]
    }

    proptest! {
        // Invariants over arbitrary op sequences (lease long enough that
        // nothing expires mid-test): at most one entry per object, acquire
        // makes lookup observe the owner, and release only succeeds for the
        // current owner.
        #[test]
        fn ownership_invariants(ops in proptest::collection::vec(arb_op(), 1..64)) {
            let ls = LockStore::new(Duration::from_secs(3600));
            let mut model: BTreeMap<String, String> = BTreeMap::new();

            for op in ops {
                match op {
                    Op::Acquire(o, u) => {
                        let object = format!("obj-{o}");
                        let owner = format!("owner-{u}");
                        let res = ls.acquire(&object, &owner);
                        if model.contains_key(&object) {
                            prop_assert_eq!(res, Err(LockError::Held));
                        } else {
                            prop_assert!(res.is_ok());
                            model.insert(object.clone(), owner.clone());
                        }
                        prop_assert_eq!(ls.lookup(&object), model.get(&object).cloned());
                    }
                    Op::Release(o, u) => {
                        let object = format!("obj-{o}");
                        let owner = format!("owner-{u}");
                        let res = ls.release(&object, &owner);
                        match model.get(&object) {
                            None => prop_assert_eq!(res, Err(LockError::NotHeld)),
                            Some(holder) if holder != &owner => {
                                prop_assert_eq!(res, Err(LockError::Unauthorized));
                            }
                            Some(_) => {
                                prop_assert!(res.is_ok());
                                model.remove(&object);
                            }
                        }
                    }
                }
            }

            let entries = ls.entries();
            prop_assert_eq!(entries.len(), model.len());
            for (object, owner) in &model {
                prop_assert_eq!(&entries[object].owner, owner);
            }
        }
    }
}
