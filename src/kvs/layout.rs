//! Records stored in shared memory
//!
//! Layout shared by every attached process. All records are `#[repr(C)]`
//! plain integers (plus the semaphore), so a zero-filled region is a valid
//! empty table.

use crate::common::{Error, Result};
use crate::kvs::Rank;

/// Bytes reserved for a key, including the terminating NUL.
pub const KEY_BYTES: usize = 50;

/// Longest key that fits in a record.
pub const MAX_KEY_LEN: usize = KEY_BYTES - 1;

/// Marks a head region written by this crate.
pub const HEAD_MAGIC: u64 = u64::from_le_bytes(*b"PSETKV01");

/// Table header: one per store.
#[repr(C)]
pub struct Head {
    pub magic: u64,
    /// Number of entry slots, fixed at creation
    pub capacity: u64,
    /// Global version, bumped on every write
    pub version: u64,
    pub sem: libc::sem_t,
}

pub const HEAD_SIZE: usize = std::mem::size_of::<Head>();

/// One slot of the entry table.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct EntryRecord {
    pub key: [u8; KEY_BYTES],
    pub key_len: u32,
    pub version: u64,
    /// Generation of the side buffers, bumped on every resize
    pub mem_version: u64,
    pub num_ranks: u32,
    pub num_updates: u32,
    /// Allocated capacity of the ranks buffer, in ranks
    pub mem_ranks: u32,
    /// Allocated capacity of the updates buffer, in ranks
    pub mem_updates: u32,
}

pub const ENTRY_SIZE: usize = std::mem::size_of::<EntryRecord>();

pub fn entries_size(capacity: usize) -> usize {
    capacity * ENTRY_SIZE
}

/// Bytes needed for a side buffer holding `capacity` ranks.
pub fn buffer_size(capacity: u32) -> usize {
    capacity as usize * std::mem::size_of::<Rank>()
}

impl EntryRecord {
    pub fn is_empty(&self) -> bool {
        self.key_len == 0
    }

    pub fn matches(&self, key: &str) -> bool {
        !self.is_empty() && self.key_bytes() == key.as_bytes()
    }

    fn key_bytes(&self) -> &[u8] {
        let len = (self.key_len as usize).min(MAX_KEY_LEN);
        &self.key[..len]
    }

    pub fn key(&self) -> Result<&str> {
        std::str::from_utf8(self.key_bytes())
            .map_err(|_| Error::Corrupted("entry key is not valid UTF-8".into()))
    }

    /// Store `key`; it must already be validated against `MAX_KEY_LEN`.
    pub fn set_key(&mut self, key: &str) {
        let bytes = key.as_bytes();
        debug_assert!(bytes.len() <= MAX_KEY_LEN);
        self.key = [0; KEY_BYTES];
        self.key[..bytes.len()].copy_from_slice(bytes);
        self.key_len = bytes.len() as u32;
    }

    /// Counts must never exceed the allocated capacities.
    pub fn check(&self, slot: usize) -> Result<()> {
        if self.key_len as usize > MAX_KEY_LEN
            || self.num_ranks > self.mem_ranks
            || self.num_updates > self.mem_updates
        {
            return Err(Error::Corrupted(format!(
                "slot {}: key_len {} ranks {}/{} updates {}/{}",
                slot,
                self.key_len,
                self.num_ranks,
                self.mem_ranks,
                self.num_updates,
                self.mem_updates
            )));
        }
        Ok(())
    }
}

/// The two growable arrays owned by every entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    Ranks,
    Updates,
}

impl BufferKind {
    pub fn capacity(self, entry: &EntryRecord) -> u32 {
        match self {
            BufferKind::Ranks => entry.mem_ranks,
            BufferKind::Updates => entry.mem_updates,
        }
    }

    pub fn set_capacity(self, entry: &mut EntryRecord, capacity: u32) {
        match self {
            BufferKind::Ranks => entry.mem_ranks = capacity,
            BufferKind::Updates => entry.mem_updates = capacity,
        }
    }

    pub fn count(self, entry: &EntryRecord) -> u32 {
        match self {
            BufferKind::Ranks => entry.num_ranks,
            BufferKind::Updates => entry.num_updates,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zeroed() -> EntryRecord {
        // Safety: every field is a plain integer array/integer
        unsafe { std::mem::zeroed() }
    }

    #[test]
    fn test_zeroed_entry_is_empty() {
        let entry = zeroed();
        assert!(entry.is_empty());
        assert!(!entry.matches(""));
        assert!(entry.check(0).is_ok());
    }

    #[test]
    fn test_key_roundtrip() {
        let mut entry = zeroed();
        entry.set_key("app://ocean");
        assert!(entry.matches("app://ocean"));
        assert!(!entry.matches("app://ocea"));
        assert_eq!(entry.key().unwrap(), "app://ocean");

        entry.set_key("a");
        assert_eq!(entry.key().unwrap(), "a");
        assert_eq!(entry.key[1], 0);
    }

    #[test]
    fn test_check_rejects_overfull() {
        let mut entry = zeroed();
        entry.num_ranks = 3;
        entry.mem_ranks = 2;
        assert!(matches!(entry.check(4), Err(Error::Corrupted(_))));
    }

    #[test]
    fn test_buffer_kind_accessors() {
        let mut entry = zeroed();
        BufferKind::Updates.set_capacity(&mut entry, 7);
        assert_eq!(entry.mem_updates, 7);
        assert_eq!(BufferKind::Ranks.capacity(&entry), 0);
        assert_eq!(buffer_size(7), 28);
    }
}
