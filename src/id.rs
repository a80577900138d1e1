//! Snowflake-style 64-bit id generator.
//!
//! Layout (MSB to LSB): 1 unused sign bit, 41 timestamp bits (ms since
//! [`EPOCH_MS`]), 10 node bits, 12 step bits. A full generator is
//! process-wide and is re-seeded whenever the owning node re-registers
//! with the directory (see [`IdAllocator::reseed`]).

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

const NODE_BITS: u32 = 10;
const STEP_BITS: u32 = 12;
const NODE_MAX: i64 = (1 << NODE_BITS) - 1;
const STEP_MASK: i64 = (1 << STEP_BITS) - 1;
const NODE_SHIFT: u32 = STEP_BITS;
const TIME_SHIFT: u32 = STEP_BITS + NODE_BITS;

/// Arbitrary custom epoch so the 41 timestamp bits stay meaningful longer
/// than the Unix epoch would allow. 2020-01-01T00:00:00Z.
const EPOCH_MS: i64 = 1_577_836_800_000;

#[derive(Debug)]
pub struct IdAllocator {
    node_id: AtomicI64,
    // packed (last_ms << STEP_BITS) | step
    state: AtomicI64,
}

impl IdAllocator {
    pub fn new(node_id: i32) -> Self {
        assert!((0..=NODE_MAX as i32).contains(&node_id), "node id out of range: {node_id}");
        Self { node_id: AtomicI64::new(i64::from(node_id)), state: AtomicI64::new(0) }
    }

    /// Re-seeds the node field, e.g. after a `Register` response carrying a
    /// new node id. In-flight ids already generated are unaffected.
    pub fn reseed(&self, node_id: i32) {
        self.node_id.store(i64::from(node_id), Ordering::SeqCst);
        self.state.store(0, Ordering::SeqCst);
    }

    pub fn next(&self) -> u64 {
        loop {
            let now = now_ms();
            let prev = self.state.load(Ordering::SeqCst);
            let prev_ms = prev >> STEP_BITS;
            let prev_step = prev & STEP_MASK;

            let (ms, step) = if now > prev_ms {
                (now, 0)
            } else {
                let next_step = (prev_step + 1) & STEP_MASK;
                if next_step == 0 {
                    // step space exhausted within this millisecond; spin to the next one.
                    (prev_ms + 1, 0)
                } else {
                    (prev_ms, next_step)
                }
            };

            let new_state = (ms << STEP_BITS) | step;
            if self.state.compare_exchange(prev, new_state, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
                let node = self.node_id.load(Ordering::SeqCst);
                let id = (ms << TIME_SHIFT) | (node << NODE_SHIFT) | step;
                return id as u64;
            }
        }
    }

    /// Extracts the snowflake node field embedded in a previously
    /// generated id.
    fn node_of(id: u64) -> i32 {
        ((id as i64 >> NODE_SHIFT) & NODE_MAX) as i32
    }
}

fn now_ms() -> i64 {
    let d = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    d.as_millis() as i64 - EPOCH_MS
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn ids_are_monotonic_and_unique() {
        let alloc = IdAllocator::new(5);
        let mut seen = HashSet::new();
        let mut last = 0u64;
        for _ in 0..5000 {
            let id = alloc.next();
            assert!(id > last || seen.is_empty());
            last = id;
            assert!(seen.insert(id), "duplicate id generated");
        }
    }

    #[test]
    fn node_field_round_trips() {
        let alloc = IdAllocator::new(42);
        let id = alloc.next();
        assert_eq!(IdAllocator::node_of(id), 42);
    }

    #[test]
    fn reseed_changes_node_field() {
        let alloc = IdAllocator::new(1);
        let _ = alloc.next();
        alloc.reseed(99);
        let id = alloc.next();
        assert_eq!(IdAllocator::node_of(id), 99);
    }

    #[test]
    fn concurrent_generation_is_unique() {
        let alloc = Arc::new(IdAllocator::new(3));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let a = Arc::clone(&alloc);
            handles.push(thread::spawn(move || {
                (0..2000).map(|_| a.next()).collect::<Vec<_>>()
            }));
        }
        let mut all = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(all.insert(id), "duplicate id across threads");
            }
        }
    }
}
