//! Fixed-capacity ring buffer mapping message id → sender, so Select/Confirm
//! can resolve a target message id back to its original producer.
//!
//! A `HashMap` plus a parallel ring of keys. `Add` always writes; when the
//! ring slot about to be reused still points at a live key, that key is
//! evicted from the map first.

use std::collections::HashMap;
use std::sync::RwLock;

const CAPACITY: usize = 1000;

#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub msg_type: &'static str,
    pub channel_type: u32,
    pub id: u64,
    pub src: u64,
    pub dst: u64,
    pub arg: String,
}

#[derive(Debug)]
struct Inner {
    store: HashMap<u64, MessageRecord>,
    ring: Vec<u64>,
    write_pos: usize,
}

#[derive(Debug)]
pub struct MessageStore {
    inner: RwLock<Inner>,
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner { store: HashMap::new(), ring: vec![0; CAPACITY], write_pos: 0 }),
        }
    }

    pub fn add(&self, record: MessageRecord) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let pos = inner.write_pos;
        let evict = inner.ring[pos];
        if evict != 0 {
            inner.store.remove(&evict);
        }
        inner.ring[pos] = record.id;
        inner.store.insert(record.id, record);
        inner.write_pos = (pos + 1) % CAPACITY;
    }

    /// Returns 0 ("sender unknown") on a miss, matching the original's
    /// `getSrcId`.
    pub fn lookup_sender(&self, id: u64) -> u64 {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.store.get(&id).map_or(0, |r| r.src)
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(id: u64, src: u64) -> MessageRecord {
        MessageRecord { msg_type: "NotifySupply", channel_type: 1, id, src, dst: 0, arg: String::new() }
    }

    #[test]
    fn lookup_returns_zero_on_miss() {
        let store = MessageStore::new();
        assert_eq!(store.lookup_sender(123), 0);
    }

    #[test]
    fn add_then_lookup_round_trips() {
        let store = MessageStore::new();
        store.add(rec(42, 7));
        assert_eq!(store.lookup_sender(42), 7);
    }

    #[test]
    fn never_exceeds_capacity() {
        let store = MessageStore::new();
        for i in 1..=(CAPACITY as u64 * 3) {
            store.add(rec(i, i));
        }
        assert!(store.len() <= CAPACITY);
        // the oldest two-thirds should have been evicted
        assert_eq!(store.lookup_sender(1), 0);
        // the most recent entry must still be present
        assert_eq!(store.lookup_sender(CAPACITY as u64 * 3), CAPACITY as u64 * 3);
    }
}
