//! Shared process-set store
//!
//! `KvStore` is one process's handle on the shared table. The table is a
//! fixed-capacity, linearly probed array of `EntryRecord`s in shared
//! memory; each slot owns two growable side buffers (members and pending
//! watchers). Every compound operation runs under the single table lock
//! through `with_lock`, and composite operations (`add`, `del`,
//! `add_to_world`) reuse the locked primitives so they take the lock once.
//!
//! Writes drain the slot's watchers: each pending rank gets one
//! notification tagged with the slot index, then the list is cleared. If a
//! send fails, the write itself is already stored and only the watchers not
//! yet reached stay pending for the next write. The sends happen while the
//! lock is held, so a slow receiver stalls every other process's access
//! until it drains.

use crate::common::{validate_key, Error, ProbeSequence, Result};
use crate::kvs::buffers::{Shadow, SideBuffers};
use crate::kvs::layout::{
    entries_size, BufferKind, EntryRecord, Head, HEAD_MAGIC, HEAD_SIZE, MAX_KEY_LEN,
};
use crate::kvs::notify::{Notifier, NullNotifier};
use crate::kvs::sets::{SetDefinition, SELF_KEY, WORLD_KEY};
use crate::kvs::{Rank, SlotIndex};
use crate::shm::{GroupId, Purpose, RegionName, SemaphoreLock, SharedRegion, TableLock};
use serde::Serialize;
use std::ptr::{self, addr_of, addr_of_mut, NonNull};

/// Members of a set as seen by one read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Membership {
    pub ranks: Vec<Rank>,
    pub version: u64,
    /// Table slot, `None` for the synthetic self set
    pub slot: Option<SlotIndex>,
}

impl Membership {
    fn self_only(rank: Rank) -> Self {
        Self {
            ranks: vec![rank],
            version: 1,
            slot: None,
        }
    }

    pub fn len(&self) -> usize {
        self.ranks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranks.is_empty()
    }

    pub fn contains(&self, rank: Rank) -> bool {
        self.ranks.contains(&rank)
    }
}

/// One slot as captured by `KvStore::snapshot`.
#[derive(Debug, Clone, Serialize)]
pub struct EntrySnapshot {
    pub slot: SlotIndex,
    pub key: String,
    pub version: u64,
    pub generation: u64,
    pub ranks: Vec<Rank>,
    pub pending: Vec<Rank>,
    pub ranks_capacity: u32,
    pub updates_capacity: u32,
}

/// Mapped regions plus this process's shadow state.
struct Tables {
    head: SharedRegion,
    entries: SharedRegion,
    capacity: usize,
    buffers: Vec<SideBuffers>,
}

impl Tables {
    fn head_ptr(&self) -> *mut Head {
        self.head.as_ptr() as *mut Head
    }

    fn global_version(&self) -> u64 {
        // Safety: head region is mapped for HEAD_SIZE bytes
        unsafe { ptr::read(addr_of!((*self.head_ptr()).version)) }
    }

    fn bump_global(&mut self) {
        // Safety: head region is mapped and the table lock is held
        unsafe {
            let version = addr_of_mut!((*self.head_ptr()).version);
            version.write(version.read() + 1);
        }
    }

    fn entry(&self, slot: SlotIndex) -> EntryRecord {
        assert!(slot < self.capacity);
        // Safety: slot is in bounds of the entries mapping
        unsafe { ptr::read((self.entries.as_ptr() as *const EntryRecord).add(slot)) }
    }

    fn store_entry(&mut self, slot: SlotIndex, entry: &EntryRecord) {
        assert!(slot < self.capacity);
        // Safety: slot is in bounds of the entries mapping
        unsafe { ptr::write((self.entries.as_ptr() as *mut EntryRecord).add(slot), *entry) }
    }
}

/// Table access while the lock is held.
pub(crate) struct Locked<'a, N: Notifier> {
    tables: &'a mut Tables,
    notifier: &'a N,
    rank: Rank,
}

impl<N: Notifier> Locked<'_, N> {
    /// Probe for `key`; stops at the first empty slot.
    pub(crate) fn locate(&self, key: &str) -> Result<SlotIndex> {
        for slot in ProbeSequence::new(key, self.tables.capacity) {
            let entry = self.tables.entry(slot);
            if entry.matches(key) {
                return Ok(slot);
            }
            if entry.is_empty() {
                break;
            }
        }
        Err(Error::KeyNotFound(key.to_string()))
    }

    /// Claim the first free slot on `key`'s probe path. Used while
    /// populating the table; the new entry starts at version 1.
    pub(crate) fn insert_initial(&mut self, key: &str, ranks: &[Rank]) -> Result<SlotIndex> {
        validate_key(key, MAX_KEY_LEN)?;
        for slot in ProbeSequence::new(key, self.tables.capacity) {
            let entry = self.tables.entry(slot);
            if entry.matches(key) {
                return Err(Error::DuplicateKey(key.to_string()));
            }
            if !entry.is_empty() {
                continue;
            }

            let mut entry = self.refresh(slot)?;
            self.tables.buffers[slot].write_ranks(&mut entry, ranks)?;
            entry.set_key(key);
            entry.version = 1;
            self.tables.bump_global();
            self.tables.store_entry(slot, &entry);
            return Ok(slot);
        }
        Err(Error::CapacityExhausted {
            key: key.to_string(),
            capacity: self.tables.capacity,
        })
    }

    /// Catch the local mappings of `slot` up, returning its current record.
    pub(crate) fn refresh(&mut self, slot: SlotIndex) -> Result<EntryRecord> {
        let entry = self.tables.entry(slot);
        entry.check(slot)?;
        self.tables.buffers[slot].refresh(&entry)?;
        Ok(entry)
    }

    pub(crate) fn get(&mut self, key: &str) -> Result<Membership> {
        if key == SELF_KEY {
            return Ok(Membership::self_only(self.rank));
        }
        let slot = self.locate(key)?;
        let entry = self.refresh(slot)?;
        let ranks = self.tables.buffers[slot].read(BufferKind::Ranks, &entry)?;
        Ok(Membership {
            ranks,
            version: entry.version,
            slot: Some(slot),
        })
    }

    pub(crate) fn put(&mut self, key: &str, ranks: &[Rank]) -> Result<u64> {
        let slot = self.locate(key)?;
        self.write_slot(slot, ranks)
    }

    /// Replace the members of `slot` and drain its watchers.
    ///
    /// The global version moves by two per write, the entry version by one.
    fn write_slot(&mut self, slot: SlotIndex, ranks: &[Rank]) -> Result<u64> {
        let mut entry = self.refresh(slot)?;
        self.tables.buffers[slot].write_ranks(&mut entry, ranks)?;
        self.tables.bump_global();
        entry.version += 1;
        self.tables.bump_global();

        let watchers = self.tables.buffers[slot].read(BufferKind::Updates, &entry)?;
        self.tables.store_entry(slot, &entry);

        for (sent, &rank) in watchers.iter().enumerate() {
            if let Err(e) = self.notifier.notify(rank, slot) {
                // only the watchers not yet reached stay pending
                self.tables.buffers[slot].set_updates(&mut entry, &watchers[sent..])?;
                self.tables.store_entry(slot, &entry);
                return Err(e);
            }
        }
        entry.num_updates = 0;
        self.tables.store_entry(slot, &entry);

        if !watchers.is_empty() {
            tracing::debug!(
                "Slot {} v{}: notified {} watcher(s)",
                slot,
                entry.version,
                watchers.len()
            );
        }
        Ok(entry.version)
    }

    /// Replace the members of `key` by a function of the current members.
    fn update(&mut self, key: &str, f: impl FnOnce(&mut Vec<Rank>) -> Result<()>) -> Result<u64> {
        let mut membership = self.get(key)?;
        let slot = membership
            .slot
            .ok_or_else(|| Error::KeyNotFound(key.to_string()))?;
        f(&mut membership.ranks)?;
        self.write_slot(slot, &membership.ranks)
    }

    pub(crate) fn subscribe(&mut self, slot: SlotIndex) -> Result<()> {
        if slot >= self.tables.capacity {
            return Err(Error::SlotOutOfRange {
                slot,
                capacity: self.tables.capacity,
            });
        }
        let mut entry = self.refresh(slot)?;
        if entry.is_empty() {
            return Err(Error::KeyNotFound(format!("<empty slot {}>", slot)));
        }
        self.tables.buffers[slot].push_update(&mut entry, self.rank)?;
        self.tables.store_entry(slot, &entry);
        Ok(())
    }

    pub(crate) fn global_version(&self) -> u64 {
        self.tables.global_version()
    }

    fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for slot in 0..self.tables.capacity {
            let entry = self.tables.entry(slot);
            if !entry.is_empty() {
                keys.push(entry.key()?.to_string());
            }
        }
        Ok(keys)
    }

    fn snapshot(&mut self) -> Result<Vec<EntrySnapshot>> {
        let mut out = Vec::with_capacity(self.tables.capacity);
        for slot in 0..self.tables.capacity {
            let entry = self.refresh(slot)?;
            let buffers = &self.tables.buffers[slot];
            out.push(EntrySnapshot {
                slot,
                key: entry.key()?.to_string(),
                version: entry.version,
                generation: entry.mem_version,
                ranks: buffers.read(BufferKind::Ranks, &entry)?,
                pending: buffers.read(BufferKind::Updates, &entry)?,
                ranks_capacity: entry.mem_ranks,
                updates_capacity: entry.mem_updates,
            });
        }
        Ok(out)
    }
}

/// One process's handle on a shared store.
///
/// Created either by `initialize` (exactly one process per group) or by
/// `attach`. The handle owns this process's mappings and shadow state;
/// dropping it detaches.
pub struct KvStore<N: Notifier = NullNotifier> {
    lock: SemaphoreLock,
    tables: Tables,
    group: GroupId,
    notifier: N,
    rank: Rank,
}

impl<N: Notifier> KvStore<N> {
    /// Create the shared regions and populate them with the whole-group set
    /// (`mpi://WORLD`, ranks `0..world_size`) and one entry per named set.
    ///
    /// On failure every region created so far is unlinked again.
    pub fn initialize(
        group: GroupId,
        rank: Rank,
        world_size: u32,
        sets: &[SetDefinition],
        notifier: N,
    ) -> Result<Self> {
        for set in sets {
            set.validate()?;
        }
        let capacity = sets.len() + 1;
        let result = Self::create(group.clone(), rank, world_size, sets, notifier, capacity);
        if result.is_err() {
            unlink_all(&group, capacity);
        }
        result
    }

    fn create(
        group: GroupId,
        rank: Rank,
        world_size: u32,
        sets: &[SetDefinition],
        notifier: N,
        capacity: usize,
    ) -> Result<Self> {
        let head = SharedRegion::allocate(RegionName::new(&group, Purpose::Head), HEAD_SIZE)?;
        let head_ptr = head.as_ptr() as *mut Head;
        // Safety: freshly allocated, zeroed and not yet visible to anyone
        let lock = unsafe {
            addr_of_mut!((*head_ptr).magic).write(HEAD_MAGIC);
            addr_of_mut!((*head_ptr).capacity).write(capacity as u64);
            addr_of_mut!((*head_ptr).version).write(0);
            SemaphoreLock::init(NonNull::new_unchecked(addr_of_mut!((*head_ptr).sem)))?
        };

        let entries = SharedRegion::allocate(
            RegionName::new(&group, Purpose::Entries),
            entries_size(capacity),
        )?;
        let mut tables = Tables {
            head,
            entries,
            capacity,
            buffers: Vec::with_capacity(capacity),
        };
        for slot in 0..capacity {
            let mut entry = tables.entry(slot);
            let buffers = SideBuffers::allocate(&group, slot, world_size, &mut entry)?;
            tables.store_entry(slot, &entry);
            tables.buffers.push(buffers);
        }

        let mut store = Self {
            lock,
            tables,
            group,
            notifier,
            rank,
        };
        store.with_lock(|t| {
            let world: Vec<Rank> = (0..world_size).collect();
            t.insert_initial(WORLD_KEY, &world)?;
            for set in sets {
                t.insert_initial(&set.key(), &set.ranks())?;
            }
            Ok(())
        })?;

        tracing::info!(
            "Initialized store {} with {} slot(s), world size {}",
            store.group,
            capacity,
            world_size
        );
        Ok(store)
    }

    /// Map a store another process initialized.
    pub fn attach(group: GroupId, rank: Rank, notifier: N) -> Result<Self> {
        let head = SharedRegion::open(RegionName::new(&group, Purpose::Head), HEAD_SIZE)?;
        let head_ptr = head.as_ptr() as *mut Head;
        // Safety: head region is mapped for HEAD_SIZE bytes; magic and
        // capacity never change after initialization
        let (magic, capacity) = unsafe {
            (
                ptr::read(addr_of!((*head_ptr).magic)),
                ptr::read(addr_of!((*head_ptr).capacity)) as usize,
            )
        };
        if magic != HEAD_MAGIC || capacity == 0 {
            return Err(Error::Corrupted(format!(
                "{}: not an initialized store",
                head.name()
            )));
        }
        // Safety: the semaphore lives in the head region we keep mapped
        let lock = unsafe { SemaphoreLock::attach(NonNull::new_unchecked(addr_of_mut!((*head_ptr).sem))) };

        let entries = SharedRegion::open(
            RegionName::new(&group, Purpose::Entries),
            entries_size(capacity),
        )?;
        let mut tables = Tables {
            head,
            entries,
            capacity,
            buffers: Vec::with_capacity(capacity),
        };
        {
            let _guard = lock.lock()?;
            for slot in 0..capacity {
                let entry = tables.entry(slot);
                tables.buffers.push(SideBuffers::open(&group, slot, &entry)?);
            }
        }

        tracing::info!("Attached to store {} as rank {}", group, rank);
        Ok(Self {
            lock,
            tables,
            group,
            notifier,
            rank,
        })
    }

    /// Unmap this process's view. The store stays alive for the others.
    pub fn detach(self) {
        tracing::debug!("Rank {} detached from store {}", self.rank, self.group);
    }

    /// Destroy the lock and unlink every region.
    ///
    /// Only the process responsible for teardown calls this, after every
    /// other participant has detached.
    pub fn destroy(self) -> Result<()> {
        let KvStore {
            lock,
            tables,
            group,
            ..
        } = self;
        lock.destroy()?;
        let Tables {
            head,
            entries,
            buffers,
            ..
        } = tables;
        for buffer in buffers {
            buffer.destroy()?;
        }
        entries.destroy()?;
        head.destroy()?;
        tracing::info!("Destroyed store {}", group);
        Ok(())
    }

    /// Run `f` with the table lock held.
    pub(crate) fn with_lock<R>(
        &mut self,
        f: impl FnOnce(&mut Locked<'_, N>) -> Result<R>,
    ) -> Result<R> {
        let _guard = self.lock.lock()?;
        let mut locked = Locked {
            tables: &mut self.tables,
            notifier: &self.notifier,
            rank: self.rank,
        };
        f(&mut locked)
    }

    /// Members and version of `key`.
    ///
    /// `mpi://SELF` is answered without touching the table.
    pub fn get(&mut self, key: &str) -> Result<Membership> {
        if key == SELF_KEY {
            return Ok(Membership::self_only(self.rank));
        }
        self.with_lock(|t| t.get(key))
    }

    /// Replace the members of `key`; returns the new entry version.
    pub fn put(&mut self, key: &str, ranks: &[Rank]) -> Result<u64> {
        self.with_lock(|t| t.put(key, ranks))
    }

    /// Append `rank` to the members of `key`.
    pub fn add(&mut self, key: &str, rank: Rank) -> Result<u64> {
        self.with_lock(|t| {
            t.update(key, |ranks| {
                ranks.push(rank);
                Ok(())
            })
        })
    }

    /// Remove the member at position `index` of the current list.
    ///
    /// `index` is a position, not a rank value: `del(key, 1)` on members
    /// `[5, 6, 7]` leaves `[5, 7]`.
    pub fn del(&mut self, key: &str, index: usize) -> Result<u64> {
        self.with_lock(|t| {
            t.update(key, |ranks| {
                if index >= ranks.len() {
                    return Err(Error::IndexOutOfRange {
                        key: key.to_string(),
                        index,
                        len: ranks.len(),
                    });
                }
                ranks.remove(index);
                Ok(())
            })
        })
    }

    /// Append `count` newly joined ranks to `mpi://WORLD`, numbered from the
    /// current world size upward.
    pub fn add_to_world(&mut self, count: u32) -> Result<u64> {
        self.with_lock(|t| {
            t.update(WORLD_KEY, |ranks| {
                let start = ranks.len() as Rank;
                let end = start.checked_add(count).ok_or_else(|| {
                    Error::InvalidConfig(format!(
                        "cannot add {} ranks to a world of {}",
                        count, start
                    ))
                })?;
                ranks.extend(start..end);
                Ok(())
            })
        })
    }

    /// Register this rank for one notification on the next write to `slot`.
    ///
    /// Waiting for the notification is up to the caller.
    pub fn subscribe(&mut self, slot: SlotIndex) -> Result<()> {
        self.with_lock(|t| t.subscribe(slot))
    }

    pub fn global_version(&mut self) -> Result<u64> {
        self.with_lock(|t| Ok(t.global_version()))
    }

    /// Entry version of `key` (1 for `mpi://SELF`).
    pub fn latest_version(&mut self, key: &str) -> Result<u64> {
        Ok(self.get(key)?.version)
    }

    /// Is `rank` a member of `key`?
    pub fn contains(&mut self, key: &str, rank: Rank) -> Result<bool> {
        Ok(self.get(key)?.contains(rank))
    }

    /// Number of sets, counting `mpi://SELF`.
    pub fn global_set_count(&self) -> usize {
        self.tables.capacity + 1
    }

    /// Every stored key in slot order, then `mpi://SELF`.
    pub fn set_names(&mut self) -> Result<Vec<String>> {
        let mut names = self.with_lock(|t| t.keys())?;
        names.push(SELF_KEY.to_string());
        Ok(names)
    }

    /// The sets this rank belongs to, `mpi://SELF` included.
    pub fn local_set_names(&mut self) -> Result<Vec<String>> {
        let rank = self.rank;
        let mut names = self.with_lock(|t| {
            let mut local = Vec::new();
            for key in t.keys()? {
                if t.get(&key)?.contains(rank) {
                    local.push(key);
                }
            }
            Ok(local)
        })?;
        names.push(SELF_KEY.to_string());
        Ok(names)
    }

    /// Locked copy of every slot, for diagnostics.
    pub fn snapshot(&mut self) -> Result<Vec<EntrySnapshot>> {
        self.with_lock(|t| t.snapshot())
    }

    /// Side-buffer capacities this process currently has mapped for `slot`.
    pub fn shadow(&self, slot: SlotIndex) -> Option<Shadow> {
        self.tables.buffers.get(slot).map(SideBuffers::shadow)
    }

    pub fn capacity(&self) -> usize {
        self.tables.capacity
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn group(&self) -> &GroupId {
        &self.group
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }
}

/// Best-effort removal of every region name a store of `capacity` uses.
fn unlink_all(group: &GroupId, capacity: usize) {
    let mut names = vec![
        RegionName::new(group, Purpose::Head),
        RegionName::new(group, Purpose::Entries),
    ];
    for slot in 0..capacity {
        names.push(RegionName::new(group, Purpose::Ranks(slot)));
        names.push(RegionName::new(group, Purpose::Updates(slot)));
    }
    for name in names {
        _ = SharedRegion::unlink(&name);
    }
}
