//! Growable per-entry side buffers
//!
//! Every slot owns two shared rank arrays: the members of the set and the
//! ranks waiting for the next change. Their authoritative capacities and a
//! generation counter live in the slot's `EntryRecord`; each process also
//! keeps a private `Shadow` of the capacities it has actually mapped.
//!
//! Before touching either array a process calls `refresh`, which remaps
//! its view whenever another process grew a buffer. Growth is exact (to the
//! requested number of ranks) and always bumps the generation.

use crate::common::{Error, Result};
use crate::kvs::layout::{buffer_size, BufferKind, EntryRecord};
use crate::kvs::Rank;
use crate::shm::{GroupId, Purpose, RegionName, SharedRegion};

/// Capacities this process has mapped for one slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Shadow {
    pub generation: u64,
    pub ranks: u32,
    pub updates: u32,
}

impl Shadow {
    pub fn of(entry: &EntryRecord) -> Self {
        Self {
            generation: entry.mem_version,
            ranks: entry.mem_ranks,
            updates: entry.mem_updates,
        }
    }

    fn capacity(&self, kind: BufferKind) -> u32 {
        match kind {
            BufferKind::Ranks => self.ranks,
            BufferKind::Updates => self.updates,
        }
    }
}

pub struct SideBuffers {
    slot: usize,
    ranks: SharedRegion,
    updates: SharedRegion,
    shadow: Shadow,
}

impl SideBuffers {
    /// Create both buffers for `slot` with room for `capacity` ranks each,
    /// recording the capacities in `entry`.
    pub fn allocate(
        group: &GroupId,
        slot: usize,
        capacity: u32,
        entry: &mut EntryRecord,
    ) -> Result<Self> {
        let capacity = capacity.max(1);
        let ranks = SharedRegion::allocate(
            RegionName::new(group, Purpose::Ranks(slot)),
            buffer_size(capacity),
        )?;
        let updates = SharedRegion::allocate(
            RegionName::new(group, Purpose::Updates(slot)),
            buffer_size(capacity),
        )?;
        entry.mem_ranks = capacity;
        entry.mem_updates = capacity;
        Ok(Self {
            slot,
            ranks,
            updates,
            shadow: Shadow::of(entry),
        })
    }

    /// Map the buffers of `slot` at the capacities recorded in `entry`.
    pub fn open(group: &GroupId, slot: usize, entry: &EntryRecord) -> Result<Self> {
        entry.check(slot)?;
        let ranks = SharedRegion::open(
            RegionName::new(group, Purpose::Ranks(slot)),
            buffer_size(entry.mem_ranks),
        )?;
        let updates = SharedRegion::open(
            RegionName::new(group, Purpose::Updates(slot)),
            buffer_size(entry.mem_updates),
        )?;
        Ok(Self {
            slot,
            ranks,
            updates,
            shadow: Shadow::of(entry),
        })
    }

    pub fn shadow(&self) -> Shadow {
        self.shadow
    }

    /// Catch up with resizes done by other processes.
    ///
    /// Returns true if the local mappings had to change.
    pub fn refresh(&mut self, entry: &EntryRecord) -> Result<bool> {
        let current = Shadow::of(entry);
        if self.shadow == current {
            return Ok(false);
        }
        entry.check(self.slot)?;
        for kind in [BufferKind::Ranks, BufferKind::Updates] {
            let wanted = kind.capacity(entry);
            if wanted != self.shadow.capacity(kind) {
                self.region_mut(kind).grow(buffer_size(wanted))?;
            }
        }
        tracing::debug!(
            "Slot {}: remapped side buffers (generation {} -> {})",
            self.slot,
            self.shadow.generation,
            current.generation
        );
        self.shadow = current;
        Ok(true)
    }

    /// Copy out the live part of one buffer.
    pub fn read(&self, kind: BufferKind, entry: &EntryRecord) -> Result<Vec<Rank>> {
        let count = kind.count(entry);
        if count > self.shadow.capacity(kind) {
            return Err(Error::Corrupted(format!(
                "slot {}: {:?} count {} exceeds mapped capacity {}",
                self.slot,
                kind,
                count,
                self.shadow.capacity(kind)
            )));
        }
        Ok(self.view(kind, count as usize).to_vec())
    }

    /// Overwrite the member list, growing the buffer to fit if needed.
    pub fn write_ranks(&mut self, entry: &mut EntryRecord, ranks: &[Rank]) -> Result<()> {
        let needed = rank_count(ranks.len())?;
        self.ensure_capacity(BufferKind::Ranks, entry, needed)?;
        self.view_mut(BufferKind::Ranks, ranks.len())
            .copy_from_slice(ranks);
        entry.num_ranks = needed;
        Ok(())
    }

    /// Append one watcher, growing the buffer by exactly one if full.
    pub fn push_update(&mut self, entry: &mut EntryRecord, rank: Rank) -> Result<()> {
        let count = entry.num_updates;
        if count >= entry.mem_updates {
            self.ensure_capacity(BufferKind::Updates, entry, count + 1)?;
        }
        self.view_mut(BufferKind::Updates, count as usize + 1)[count as usize] = rank;
        entry.num_updates = count + 1;
        Ok(())
    }

    /// Replace the pending watchers with `ranks`.
    pub fn set_updates(&mut self, entry: &mut EntryRecord, ranks: &[Rank]) -> Result<()> {
        let count = rank_count(ranks.len())?;
        self.ensure_capacity(BufferKind::Updates, entry, count)?;
        self.view_mut(BufferKind::Updates, ranks.len())
            .copy_from_slice(ranks);
        entry.num_updates = count;
        Ok(())
    }

    /// Unmap and remove both buffers.
    pub fn destroy(self) -> Result<()> {
        self.ranks.destroy()?;
        self.updates.destroy()
    }

    fn ensure_capacity(
        &mut self,
        kind: BufferKind,
        entry: &mut EntryRecord,
        needed: u32,
    ) -> Result<()> {
        debug_assert_eq!(self.shadow, Shadow::of(entry), "refresh before writing");
        if needed <= kind.capacity(entry) {
            return Ok(());
        }
        self.region_mut(kind).grow(buffer_size(needed))?;
        kind.set_capacity(entry, needed);
        entry.mem_version += 1;
        self.shadow = Shadow::of(entry);
        Ok(())
    }

    fn region(&self, kind: BufferKind) -> &SharedRegion {
        match kind {
            BufferKind::Ranks => &self.ranks,
            BufferKind::Updates => &self.updates,
        }
    }

    fn region_mut(&mut self, kind: BufferKind) -> &mut SharedRegion {
        match kind {
            BufferKind::Ranks => &mut self.ranks,
            BufferKind::Updates => &mut self.updates,
        }
    }

    fn view(&self, kind: BufferKind, len: usize) -> &[Rank] {
        let region = self.region(kind);
        assert!(buffer_size(len as u32) <= region.len());
        // Safety: in bounds of the page-aligned mapping, checked above
        unsafe { std::slice::from_raw_parts(region.as_ptr() as *const Rank, len) }
    }

    fn view_mut(&mut self, kind: BufferKind, len: usize) -> &mut [Rank] {
        let region = self.region_mut(kind);
        assert!(buffer_size(len as u32) <= region.len());
        // Safety: in bounds of the page-aligned mapping, checked above
        unsafe { std::slice::from_raw_parts_mut(region.as_ptr() as *mut Rank, len) }
    }
}

fn rank_count(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::InvalidConfig(format!("too many ranks: {}", len)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (GroupId, EntryRecord) {
        let group =
            GroupId::new(format!("psetkv-buf-{}", uuid::Uuid::new_v4().simple())).unwrap();
        // Safety: plain integers
        let entry: EntryRecord = unsafe { std::mem::zeroed() };
        (group, entry)
    }

    #[test]
    fn test_write_within_capacity() {
        let (group, mut entry) = setup();
        let mut bufs = SideBuffers::allocate(&group, 0, 4, &mut entry).unwrap();

        bufs.write_ranks(&mut entry, &[3, 1, 2]).unwrap();
        assert_eq!(entry.num_ranks, 3);
        assert_eq!(entry.mem_ranks, 4);
        assert_eq!(entry.mem_version, 0);
        assert_eq!(bufs.read(BufferKind::Ranks, &entry).unwrap(), vec![3, 1, 2]);

        bufs.destroy().unwrap();
    }

    #[test]
    fn test_grow_is_exact_and_bumps_generation() {
        let (group, mut entry) = setup();
        let mut bufs = SideBuffers::allocate(&group, 1, 2, &mut entry).unwrap();
        bufs.write_ranks(&mut entry, &[10, 11]).unwrap();

        let ranks: Vec<Rank> = (10..15).collect();
        bufs.write_ranks(&mut entry, &ranks).unwrap();
        assert_eq!(entry.mem_ranks, 5);
        assert_eq!(entry.mem_version, 1);
        assert_eq!(bufs.read(BufferKind::Ranks, &entry).unwrap(), ranks);

        bufs.destroy().unwrap();
    }

    #[test]
    fn test_push_update_grows_by_one() {
        let (group, mut entry) = setup();
        let mut bufs = SideBuffers::allocate(&group, 2, 1, &mut entry).unwrap();

        bufs.push_update(&mut entry, 7).unwrap();
        assert_eq!(entry.mem_updates, 1);
        bufs.push_update(&mut entry, 8).unwrap();
        assert_eq!(entry.mem_updates, 2);
        bufs.push_update(&mut entry, 9).unwrap();
        assert_eq!(entry.mem_updates, 3);
        assert_eq!(entry.mem_version, 2);
        assert_eq!(
            bufs.read(BufferKind::Updates, &entry).unwrap(),
            vec![7, 8, 9]
        );

        bufs.destroy().unwrap();
    }

    #[test]
    fn test_other_mapping_catches_up() {
        let (group, mut entry) = setup();
        let mut writer = SideBuffers::allocate(&group, 3, 2, &mut entry).unwrap();
        writer.write_ranks(&mut entry, &[0, 1]).unwrap();

        let mut reader = SideBuffers::open(&group, 3, &entry).unwrap();
        assert!(!reader.refresh(&entry).unwrap());

        let ranks: Vec<Rank> = (0..1000).collect();
        writer.write_ranks(&mut entry, &ranks).unwrap();

        // stale shadow: mapped capacity is smaller than the live count
        assert!(reader.read(BufferKind::Ranks, &entry).is_err());
        assert!(reader.refresh(&entry).unwrap());
        assert_eq!(reader.shadow(), Shadow::of(&entry));
        assert_eq!(reader.read(BufferKind::Ranks, &entry).unwrap(), ranks);

        drop(reader);
        writer.destroy().unwrap();
    }

    #[test]
    fn test_set_updates_keeps_capacity() {
        let (group, mut entry) = setup();
        let mut bufs = SideBuffers::allocate(&group, 5, 3, &mut entry).unwrap();
        for rank in [4, 5, 6] {
            bufs.push_update(&mut entry, rank).unwrap();
        }

        bufs.set_updates(&mut entry, &[5, 6]).unwrap();
        assert_eq!(entry.num_updates, 2);
        assert_eq!(entry.mem_updates, 3);
        assert_eq!(entry.mem_version, 0);
        assert_eq!(bufs.read(BufferKind::Updates, &entry).unwrap(), vec![5, 6]);

        bufs.destroy().unwrap();
    }

    #[test]
    fn test_zero_capacity_rounds_up() {
        let (group, mut entry) = setup();
        let bufs = SideBuffers::allocate(&group, 4, 0, &mut entry).unwrap();
        assert_eq!(entry.mem_ranks, 1);
        assert_eq!(entry.mem_updates, 1);
        bufs.destroy().unwrap();
    }
}
