//! Slot hashing for the shared entry table
//!
//! Keys are placed with a simple multiplicative string hash and linear
//! probing. Every attached process must compute the same slot for the same
//! key, so the arithmetic is fixed: seed 7, `h = h * 31 + byte` in wrapping
//! 32-bit signed arithmetic over the key bytes (sign-extended, like a C
//! `char`), then `|h| mod capacity`.

const HASH_SEED: i32 = 7;
const HASH_MULTIPLIER: i32 = 31;

/// Home slot of `key` in a table of `capacity` slots.
pub fn slot_hash(key: &str, capacity: usize) -> usize {
    debug_assert!(capacity > 0, "table capacity must be non-zero");
    let mut h = HASH_SEED;
    for &b in key.as_bytes() {
        h = h.wrapping_mul(HASH_MULTIPLIER).wrapping_add(b as i8 as i32);
    }
    h.unsigned_abs() as usize % capacity
}

/// Linear probe over a fixed-capacity table.
///
/// Yields the home slot first, then every following slot (wrapping at
/// `capacity`), and stops after visiting each slot exactly once.
#[derive(Debug, Clone)]
pub struct ProbeSequence {
    next: usize,
    remaining: usize,
    capacity: usize,
}

impl ProbeSequence {
    pub fn new(key: &str, capacity: usize) -> Self {
        Self {
            next: slot_hash(key, capacity),
            remaining: capacity,
            capacity,
        }
    }
}

impl Iterator for ProbeSequence {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        let slot = self.next;
        self.next = (self.next + 1) % self.capacity;
        self.remaining -= 1;
        Some(slot)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for ProbeSequence {}
