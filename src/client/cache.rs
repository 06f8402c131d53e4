//! Bounded most-recently-used cache of lock ownership.
//!
//! The doubly linked list is an arena: a vector of slots addressed by index,
//! with a free list for holes. Head is the most recently used entry, tail the
//! least; eviction always unlinks the tail. Indices instead of pointers keep
//! every operation O(1) without reference cycles.
//!
//! The cache is advisory. It never answers authoritatively for the server;
//! the request layer consults it and proceeds to the network regardless.

use std::collections::HashMap;

use parking_lot::Mutex;
use snafu::Snafu;

#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    #[snafu(display("element doesn't exist in the cache"))]
    Missing,
    #[snafu(display("element already exists in the cache"))]
    AlreadyExists,
}

#[derive(Debug)]
struct Slot {
    key: String,
    owner: String,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug, Default)]
struct CacheInner {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    map: HashMap<String, usize>,
}

impl CacheInner {
    fn alloc(&mut self, slot: Slot) -> usize {
        match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(slot);
                index
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        }
    }

    fn unlink(&mut self, index: usize) {
        let (prev, next) = {
            let slot = self.slots[index].as_ref().expect("linked slot is occupied");
            (slot.prev, slot.next)
        };
        match prev {
            Some(prev_index) => {
                self.slots[prev_index].as_mut().expect("prev slot is occupied").next = next;
            }
            None => self.head = next,
        }
        match next {
            Some(next_index) => {
                self.slots[next_index].as_mut().expect("next slot is occupied").prev = prev;
            }
            None => self.tail = prev,
        }
    }

    fn push_front(&mut self, index: usize) {
        {
            let slot = self.slots[index].as_mut().expect("pushed slot is occupied");
            slot.prev = None;
            slot.next = self.head;
        }
        if let Some(old_head) = self.head {
            self.slots[old_head].as_mut().expect("head slot is occupied").prev = Some(index);
        }
        self.head = Some(index);
        if self.tail.is_none() {
            self.tail = Some(index);
        }
    }

    fn drop_slot(&mut self, index: usize) {
        let slot = self.slots[index].take().expect("dropped slot is occupied");
        self.map.remove(&slot.key);
        self.free.push(index);
    }
}

/// Thread-safe LRU map from object id to last observed owner.
#[derive(Debug)]
pub struct LruCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

impl LruCache {
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "cache capacity must be positive");
        Self {
            capacity,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Insert `key → owner` at the MRU position, evicting the LRU entry if
    /// the cache is full. Fails if the key is already present.
    pub fn put(&self, key: &str, owner: &str) -> Result<(), CacheError> {
        let mut inner = self.inner.lock();
        if inner.map.contains_key(key) {
            return Err(CacheError::AlreadyExists);
        }
        if inner.map.len() == self.capacity {
            if let Some(tail) = inner.tail {
                inner.unlink(tail);
                inner.drop_slot(tail);
            }
        }
        let index = inner.alloc(Slot {
            key: key.to_owned(),
            owner: owner.to_owned(),
            prev: None,
            next: None,
        });
        inner.map.insert(key.to_owned(), index);
        inner.push_front(index);
        Ok(())
    }

    /// Look up the owner for `key`, promoting the entry to MRU.
    pub fn get(&self, key: &str) -> Result<String, CacheError> {
        let mut inner = self.inner.lock();
        let index = *inner.map.get(key).ok_or(CacheError::Missing)?;
        inner.unlink(index);
        inner.push_front(index);
        Ok(inner.slots[index].as_ref().expect("mapped slot is occupied").owner.clone())
    }

    /// Remove the entry for `key`.
    pub fn remove(&self, key: &str) -> Result<(), CacheError> {
        let mut inner = self.inner.lock();
        let index = *inner.map.get(key).ok_or(CacheError::Missing)?;
        inner.unlink(index);
        inner.drop_slot(index);
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn size(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn full(&self) -> bool {
        self.size() == self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_and_get() {
        let cache = LruCache::new(2);
        cache.put("a", "owner1").unwrap();
        assert_eq!(cache.get("a").unwrap(), "owner1");
        assert_eq!(cache.size(), 1);
        assert!(!cache.full());
    }

    #[test]
    fn duplicate_put_fails() {
        let cache = LruCache::new(2);
        cache.put("a", "owner1").unwrap();
        assert_eq!(cache.put("a", "owner2"), Err(CacheError::AlreadyExists));
    }

    #[test]
    fn missing_get_and_remove_fail() {
        let cache = LruCache::new(2);
        assert_eq!(cache.get("a"), Err(CacheError::Missing));
        assert_eq!(cache.remove("a"), Err(CacheError::Missing));
    }

    #[test]
    fn eviction_is_strictly_lru() {
        let cache = LruCache::new(3);
        cache.put("a", "1").unwrap();
        cache.put("b", "2").unwrap();
        cache.put("c", "3").unwrap();
        assert!(cache.full());

        // Touch "a" so "b" becomes the LRU entry.
        cache.get("a").unwrap();
        cache.put("d", "4").unwrap();

        assert_eq!(cache.get("b"), Err(CacheError::Missing));
        assert!(cache.get("a").is_ok());
        assert!(cache.get("c").is_ok());
        assert!(cache.get("d").is_ok());
        assert_eq!(cache.size(), 3);
    }

    #[test]
    fn first_inserts_fall_out_after_overflow() {
        // With capacity N and K distinct inserts, the first K-N keys are gone.
        let cache = LruCache::new(4);
        for i in 0..10 {
            cache.put(&format!("k{i}"), "o").unwrap();
        }
        for i in 0..6 {
            assert_eq!(cache.get(&format!("k{i}")), Err(CacheError::Missing), "k{i}");
        }
        for i in 6..10 {
            assert!(cache.get(&format!("k{i}")).is_ok(), "k{i}");
        }
    }

    #[test]
    fn remove_head_tail_middle_and_single() {
        let cache = LruCache::new(4);
        cache.put("a", "1").unwrap();
        cache.put("b", "2").unwrap();
        cache.put("c", "3").unwrap();
        cache.put("d", "4").unwrap();

        cache.remove("d").unwrap(); // head (MRU)
        cache.remove("a").unwrap(); // tail (LRU)
        cache.remove("b").unwrap(); // middle of what's left
        assert_eq!(cache.size(), 1);
        assert_eq!(cache.get("c").unwrap(), "3");

        cache.remove("c").unwrap(); // single element
        assert_eq!(cache.size(), 0);

        // List pointers survive emptying; reuse works.
        cache.put("e", "5").unwrap();
        assert_eq!(cache.get("e").unwrap(), "5");
    }

    #[test]
    fn slots_are_reused_after_eviction() {
        let cache = LruCache::new(2);
        for i in 0..20 {
            cache.put(&format!("k{i}"), "o").unwrap();
        }
        let inner = cache.inner.lock();
        assert!(inner.slots.len() <= 3, "arena grew past capacity: {}", inner.slots.len());
    }
}
