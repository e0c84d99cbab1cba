//! Page unit pool and write reuse cache
//!
//! Units live in a fixed arena and are addressed by generation-checked
//! [`UnitHandle`]s. Each slot is in exactly one residency state:
//!
//! ```text
//!            try_alloc                      release (uncached or failed)
//!   Free ---------------> InUse --------------------------------------> Free
//!                           |  ^
//!            release        |  |  cache hit
//!            (cached, ok)   v  |
//!                         Resident ------------------------------------> Free
//!                                     evicted (oldest first)
//! ```
//!
//! `Resident` units hold the page image of an NVRAM page recently written
//! with a partial write, so the next partial write to the same page can
//! skip the page read. Every generation bump invalidates handles held by
//! the previous owner.
//!
//! `free + used == capacity` holds per kind after every call; resident
//! units count as used.

use crate::unit::{CacheState, OwnerToken, PageUnit, UnitKind, UnitTarget};
use bytes::Bytes;
use metaio_common::{ArrayId, PageKey};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Generation-checked reference to a pooled unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnitHandle {
    index: u32,
    generation: u32,
}

impl UnitHandle {
    /// Arena slot the handle points at
    #[must_use]
    pub const fn index(&self) -> u32 {
        self.index
    }
}

/// Where a slot currently belongs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    /// On its kind's free list
    Free,
    /// Owned by an orchestrator
    InUse,
    /// Idle, kept for reuse by the cache
    Resident,
}

/// How an allocation was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLookup {
    /// Not eligible for the cache
    Bypass,
    /// Fresh cache entry
    Miss,
    /// Reused a resident unit
    Hit,
}

#[derive(Debug, Clone, Copy)]
pub struct Allocation {
    pub handle: UnitHandle,
    pub lookup: CacheLookup,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    residency: Residency,
    unit: PageUnit,
    allocated_at: Option<Instant>,
}

/// Cache counters, reported through statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheCounters {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub absorbed: u64,
}

/// Bounded arena of read and write page units with a reuse cache
#[derive(Debug)]
pub struct UnitPool {
    slots: Vec<Slot>,
    free: [Vec<u32>; 2],
    capacity: [usize; 2],
    cache: HashMap<PageKey, u32>,
    /// Cache keys, oldest first
    cache_order: VecDeque<PageKey>,
    cache_capacity: usize,
    next_unit_id: u64,
    counters: CacheCounters,
}

impl UnitPool {
    /// Create a pool; a zero `cache_capacity` disables the reuse cache
    #[must_use]
    pub fn new(
        read_capacity: usize,
        write_capacity: usize,
        cache_capacity: usize,
        page_size: usize,
    ) -> Self {
        let mut slots = Vec::with_capacity(read_capacity + write_capacity);
        let mut free = [Vec::new(), Vec::new()];
        for (kind, capacity) in [
            (UnitKind::Read, read_capacity),
            (UnitKind::Write, write_capacity),
        ] {
            for _ in 0..capacity {
                free[kind.index()].push(slots.len() as u32);
                slots.push(Slot {
                    generation: 0,
                    residency: Residency::Free,
                    unit: PageUnit::new(kind, page_size),
                    allocated_at: None,
                });
            }
            // Pop from the back hands out low indexes first
            free[kind.index()].reverse();
        }

        Self {
            slots,
            free,
            capacity: [read_capacity, write_capacity],
            cache: HashMap::new(),
            cache_order: VecDeque::new(),
            cache_capacity: cache_capacity.min(write_capacity),
            next_unit_id: 1,
            counters: CacheCounters::default(),
        }
    }

    /// Take a unit for one page
    ///
    /// Partial NVRAM writes go through the reuse cache; everything else
    /// comes straight from the free list. `None` means the pool is
    /// exhausted (or the page's cached unit belongs to another owner) and
    /// the caller should retry later.
    pub fn try_alloc(
        &mut self,
        kind: UnitKind,
        target: UnitTarget,
        partial: bool,
        owner: OwnerToken,
    ) -> Option<Allocation> {
        let cacheable = kind == UnitKind::Write
            && target.tier.supports_write_cache()
            && partial
            && self.cache_capacity > 0;

        if !cacheable {
            if kind == UnitKind::Write && target.tier.supports_write_cache() {
                // A full-page write makes any resident image stale
                self.invalidate(target.key);
            }
            let index = self.pop_free_or_evict(kind)?;
            let handle = self.activate(index, target, partial, owner, CacheState::Uncached);
            return Some(Allocation {
                handle,
                lookup: CacheLookup::Bypass,
            });
        }

        if let Some(&index) = self.cache.get(&target.key) {
            let slot = &mut self.slots[index as usize];
            match slot.residency {
                Residency::Resident => {
                    slot.residency = Residency::InUse;
                    slot.allocated_at = Some(Instant::now());
                    slot.unit.configure(target, partial);
                    slot.unit.set_owner(owner);
                    slot.unit.set_id(self.next_unit_id);
                    self.next_unit_id += 1;
                    self.counters.hits += 1;
                    trace!(key = %target.key, index, "reuse cache hit");
                    return Some(Allocation {
                        handle: UnitHandle {
                            index,
                            generation: slot.generation,
                        },
                        lookup: CacheLookup::Hit,
                    });
                }
                Residency::InUse => {
                    debug!(key = %target.key, owner = ?slot.unit.owner(), "cached page busy with another request");
                    return None;
                }
                Residency::Free => {
                    debug_assert!(false, "cache entry for {} points at a free slot", target.key);
                    self.remove_cache_entry(target.key);
                }
            }
        }

        let index = self.pop_free_or_evict(kind)?;
        self.counters.misses += 1;
        if self.cache.len() >= self.cache_capacity && !self.evict_oldest_idle() {
            self.uncache_oldest();
        }
        let handle = self.activate(index, target, partial, owner, CacheState::FirstRead);
        self.cache.insert(target.key, index);
        self.cache_order.push_back(target.key);
        trace!(key = %target.key, index, "reuse cache insert");
        Some(Allocation {
            handle,
            lookup: CacheLookup::Miss,
        })
    }

    fn pop_free_or_evict(&mut self, kind: UnitKind) -> Option<u32> {
        if let Some(index) = self.free[kind.index()].pop() {
            return Some(index);
        }
        // Only write units are ever resident
        if kind == UnitKind::Write && self.evict_oldest_idle() {
            return self.free[kind.index()].pop();
        }
        None
    }

    fn activate(
        &mut self,
        index: u32,
        target: UnitTarget,
        partial: bool,
        owner: OwnerToken,
        cache_state: CacheState,
    ) -> UnitHandle {
        let slot = &mut self.slots[index as usize];
        slot.residency = Residency::InUse;
        slot.allocated_at = Some(Instant::now());
        slot.unit.configure(target, partial);
        slot.unit.set_cache_state(cache_state);
        slot.unit.set_owner(owner);
        slot.unit.set_id(self.next_unit_id);
        self.next_unit_id += 1;
        UnitHandle {
            index,
            generation: slot.generation,
        }
    }

    /// Return a unit after its I/O finished
    ///
    /// A cached unit that completed cleanly stays resident; anything else
    /// goes back to the free list. Returns `false` for a stale handle.
    pub fn release(&mut self, handle: UnitHandle) -> bool {
        if self.get(handle).is_none() {
            return false;
        }
        let index = handle.index;
        let slot = &mut self.slots[index as usize];
        let key = slot.unit.target().map(|t| t.key);
        let keep = slot.unit.is_cached()
            && slot.unit.error().is_none()
            && key.is_some_and(|k| self.cache.get(&k) == Some(&index));

        if keep {
            slot.unit.reset_for_reuse();
            slot.residency = Residency::Resident;
            slot.generation = slot.generation.wrapping_add(1);
            return true;
        }

        if slot.unit.is_cached() {
            if let Some(key) = key.filter(|k| self.cache.get(k) == Some(&index)) {
                self.remove_cache_entry(key);
            }
        }
        self.free_slot(index);
        true
    }

    fn free_slot(&mut self, index: u32) {
        let slot = &mut self.slots[index as usize];
        slot.unit.reset();
        slot.residency = Residency::Free;
        slot.generation = slot.generation.wrapping_add(1);
        self.free[slot.unit.kind().index()].push(index);
    }

    fn remove_cache_entry(&mut self, key: PageKey) {
        self.cache.remove(&key);
        self.cache_order.retain(|k| *k != key);
    }

    /// Evict the oldest resident unit; in-flight entries are never evicted
    fn evict_oldest_idle(&mut self) -> bool {
        let victim = self.cache_order.iter().copied().find(|key| {
            self.cache.get(key).is_some_and(|&index| {
                let slot = &self.slots[index as usize];
                slot.residency == Residency::Resident && slot.unit.is_idle()
            })
        });
        let Some(key) = victim else {
            return false;
        };
        if let Some(index) = self.cache.get(&key).copied() {
            self.remove_cache_entry(key);
            self.free_slot(index);
            self.counters.evictions += 1;
            trace!(%key, index, "reuse cache eviction");
        }
        true
    }

    /// Drop the oldest entry from the cache without touching its owner
    ///
    /// The unit keeps its cache state until its current I/O is done, so a
    /// merged image is still flushed as is. Without a cache entry it goes
    /// back to the free list on release.
    fn uncache_oldest(&mut self) {
        if let Some(key) = self.cache_order.pop_front() {
            self.cache.remove(&key);
        }
    }

    /// Forget any cached image of `key`
    fn invalidate(&mut self, key: PageKey) {
        let Some(&index) = self.cache.get(&key) else {
            return;
        };
        self.remove_cache_entry(key);
        if self.slots[index as usize].residency == Residency::Resident {
            self.free_slot(index);
        }
    }

    /// Hand a partial write to the in-flight cached unit for `key`
    ///
    /// Succeeds only while that unit has not merged its data yet; returns
    /// the unit's owner so the caller can join the request to it.
    pub fn try_absorb(
        &mut self,
        key: PageKey,
        offset_in_page: usize,
        data: Bytes,
    ) -> Option<OwnerToken> {
        let index = *self.cache.get(&key)?;
        let slot = &mut self.slots[index as usize];
        if slot.residency != Residency::InUse {
            return None;
        }
        let owner = slot.unit.owner()?;
        if !slot.unit.try_absorb(offset_in_page, data) {
            return None;
        }
        self.counters.absorbed += 1;
        Some(owner)
    }

    /// Return every resident unit to the free list
    ///
    /// In-flight cached units are detached from the cache and freed on
    /// their next release. Returns the number of resident units freed.
    pub fn release_all_cache(&mut self) -> usize {
        self.release_cache_where(|_| true)
    }

    /// Drop cached units belonging to one array
    pub fn release_array_cache(&mut self, array_id: ArrayId) -> usize {
        self.release_cache_where(|key| key.array_id == array_id)
    }

    fn release_cache_where(&mut self, matches: impl Fn(&PageKey) -> bool) -> usize {
        let keys: Vec<PageKey> = self
            .cache_order
            .iter()
            .copied()
            .filter(|k| matches(k))
            .collect();
        let mut freed = 0;
        for key in keys {
            let Some(index) = self.cache.get(&key).copied() else {
                continue;
            };
            self.remove_cache_entry(key);
            if self.slots[index as usize].residency == Residency::Resident {
                self.free_slot(index);
                freed += 1;
            }
        }
        freed
    }

    fn slot(&self, handle: UnitHandle) -> Option<&Slot> {
        self.slots
            .get(handle.index as usize)
            .filter(|s| s.generation == handle.generation && s.residency == Residency::InUse)
    }

    /// Unit behind a live handle
    #[must_use]
    pub fn get(&self, handle: UnitHandle) -> Option<&PageUnit> {
        self.slot(handle).map(|s| &s.unit)
    }

    pub fn get_mut(&mut self, handle: UnitHandle) -> Option<&mut PageUnit> {
        self.slot(handle)?;
        Some(&mut self.slots[handle.index as usize].unit)
    }

    /// Time since the unit behind `handle` was handed out
    #[must_use]
    pub fn held_for(&self, handle: UnitHandle) -> Option<Duration> {
        self.slot(handle)?.allocated_at.map(|at| at.elapsed())
    }

    #[must_use]
    pub const fn capacity(&self, kind: UnitKind) -> usize {
        self.capacity[kind.index()]
    }

    #[must_use]
    pub fn free_count(&self, kind: UnitKind) -> usize {
        self.free[kind.index()].len()
    }

    #[must_use]
    pub fn used_count(&self, kind: UnitKind) -> usize {
        self.capacity(kind) - self.free_count(kind)
    }

    /// Whether no unit of `kind` can be handed out without eviction
    #[must_use]
    pub fn is_exhausted(&self, kind: UnitKind) -> bool {
        self.free[kind.index()].is_empty()
    }

    /// Whether an allocation of `kind` could succeed right now
    #[must_use]
    pub fn has_capacity(&self, kind: UnitKind) -> bool {
        !self.is_exhausted(kind)
            || (kind == UnitKind::Write
                && self
                    .slots
                    .iter()
                    .any(|s| s.residency == Residency::Resident))
    }

    /// Cache entries, resident or in flight
    #[must_use]
    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }

    /// Idle resident units
    #[must_use]
    pub fn resident_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.residency == Residency::Resident)
            .count()
    }

    #[must_use]
    pub const fn counters(&self) -> CacheCounters {
        self.counters
    }

    /// Residency of a slot, for diagnostics
    #[must_use]
    pub fn residency(&self, index: u32) -> Option<Residency> {
        self.slots.get(index as usize).map(|s| s.residency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::Drive;
    use metaio_common::{IoDirection, Priority, StorageTier};
    use parking_lot::Mutex;
    use rand::Rng;
    use std::collections::HashMap;
    use std::sync::Arc;

    const PAGE: usize = 4096;

    fn target(tier: StorageTier, lpn: u64) -> UnitTarget {
        UnitTarget {
            key: PageKey::new(0, lpn),
            tier,
            fd: 1,
            priority: Priority::Normal,
        }
    }

    fn assert_invariant(pool: &UnitPool) {
        for kind in UnitKind::ALL {
            assert_eq!(
                pool.free_count(kind) + pool.used_count(kind),
                pool.capacity(kind)
            );
            let in_arena = pool
                .slots
                .iter()
                .filter(|s| s.unit.kind() == kind && s.residency == Residency::Free)
                .count();
            assert_eq!(in_arena, pool.free_count(kind));
        }
    }

    #[test]
    fn test_alloc_and_release_ssd() {
        let mut pool = UnitPool::new(4, 4, 4, PAGE);

        let read = pool
            .try_alloc(UnitKind::Read, target(StorageTier::Ssd, 0), false, 1)
            .unwrap();
        let write = pool
            .try_alloc(UnitKind::Write, target(StorageTier::Ssd, 0), true, 1)
            .unwrap();
        assert_eq!(read.lookup, CacheLookup::Bypass);
        assert_eq!(write.lookup, CacheLookup::Bypass);
        assert_eq!(pool.used_count(UnitKind::Read), 1);
        assert_eq!(pool.used_count(UnitKind::Write), 1);

        assert!(pool.release(read.handle));
        assert!(pool.release(write.handle));
        assert_eq!(pool.free_count(UnitKind::Read), 4);
        assert_eq!(pool.free_count(UnitKind::Write), 4);
        assert_eq!(pool.cached_count(), 0);
        assert_invariant(&pool);
    }

    #[test]
    fn test_nvram_partial_write_reuses_one_unit() {
        let mut pool = UnitPool::new(4, 4, 4, PAGE);
        let mut indexes = Vec::new();

        for owner in 0..10 {
            let alloc = pool
                .try_alloc(UnitKind::Write, target(StorageTier::Nvram, 7), true, owner)
                .unwrap();
            indexes.push(alloc.handle.index());
            assert!(pool.release(alloc.handle));
        }

        indexes.dedup();
        assert_eq!(indexes.len(), 1);
        assert_eq!(pool.used_count(UnitKind::Write), 1);
        assert_eq!(pool.counters().hits, 9);

        assert_eq!(pool.release_all_cache(), 1);
        assert_eq!(pool.free_count(UnitKind::Write), 4);
        assert_invariant(&pool);
    }

    #[test]
    fn test_stale_handle_is_rejected() {
        let mut pool = UnitPool::new(1, 1, 0, PAGE);
        let alloc = pool
            .try_alloc(UnitKind::Read, target(StorageTier::Ssd, 3), false, 1)
            .unwrap();

        assert!(pool.release(alloc.handle));
        assert!(!pool.release(alloc.handle));
        assert!(pool.get(alloc.handle).is_none());
        assert_invariant(&pool);
    }

    #[test]
    fn test_exhaustion_is_backpressure() {
        let mut pool = UnitPool::new(1, 1, 0, PAGE);
        let first = pool
            .try_alloc(UnitKind::Read, target(StorageTier::Ssd, 1), false, 1)
            .unwrap();
        assert!(pool.is_exhausted(UnitKind::Read));
        assert!(
            pool.try_alloc(UnitKind::Read, target(StorageTier::Ssd, 2), false, 2)
                .is_none()
        );

        pool.release(first.handle);
        assert!(
            pool.try_alloc(UnitKind::Read, target(StorageTier::Ssd, 2), false, 2)
                .is_some()
        );
    }

    #[test]
    fn test_in_flight_cached_unit_is_not_shared() {
        let mut pool = UnitPool::new(1, 2, 2, PAGE);
        let first = pool
            .try_alloc(UnitKind::Write, target(StorageTier::Nvram, 5), true, 1)
            .unwrap();
        let unit = pool.get_mut(first.handle).unwrap();
        assert!(matches!(unit.drive(), Drive::Submit(_)));

        // Another owner must wait, not share the unit
        assert!(
            pool.try_alloc(UnitKind::Write, target(StorageTier::Nvram, 5), true, 2)
                .is_none()
        );
        assert_invariant(&pool);
    }

    #[test]
    fn test_empty_pool_evicts_oldest_idle_entry() {
        let mut pool = UnitPool::new(1, 1, 4, PAGE);
        let first = pool
            .try_alloc(UnitKind::Write, target(StorageTier::Nvram, 1), true, 1)
            .unwrap();
        pool.release(first.handle);
        assert_eq!(pool.resident_count(), 1);
        assert!(pool.has_capacity(UnitKind::Write));

        let second = pool
            .try_alloc(UnitKind::Write, target(StorageTier::Nvram, 2), true, 2)
            .unwrap();
        assert_eq!(second.lookup, CacheLookup::Miss);
        assert_eq!(pool.counters().evictions, 1);
        assert_eq!(pool.cached_count(), 1);
        assert_invariant(&pool);

        // Nothing idle left to evict
        assert!(
            pool.try_alloc(UnitKind::Write, target(StorageTier::Nvram, 3), true, 3)
                .is_none()
        );
        assert!(!pool.has_capacity(UnitKind::Write));
    }

    #[test]
    fn test_full_page_write_invalidates_resident_image() {
        let mut pool = UnitPool::new(1, 2, 2, PAGE);
        let partial = pool
            .try_alloc(UnitKind::Write, target(StorageTier::Nvram, 9), true, 1)
            .unwrap();
        pool.release(partial.handle);
        assert_eq!(pool.cached_count(), 1);

        let full = pool
            .try_alloc(UnitKind::Write, target(StorageTier::Nvram, 9), false, 2)
            .unwrap();
        assert_eq!(full.lookup, CacheLookup::Bypass);
        assert_eq!(pool.cached_count(), 0);
        pool.release(full.handle);
        assert_eq!(pool.free_count(UnitKind::Write), 2);
    }

    #[test]
    fn test_failed_unit_leaves_cache() {
        let mut pool = UnitPool::new(1, 1, 1, PAGE);
        let alloc = pool
            .try_alloc(UnitKind::Write, target(StorageTier::Nvram, 4), true, 1)
            .unwrap();
        let unit = pool.get_mut(alloc.handle).unwrap();
        assert!(matches!(unit.drive(), Drive::Submit(_)));
        unit.on_submit_failed(metaio_common::Error::StorageStopped);
        assert!(matches!(unit.drive(), Drive::Complete));

        pool.release(alloc.handle);
        assert_eq!(pool.cached_count(), 0);
        assert_eq!(pool.free_count(UnitKind::Write), 1);
    }

    #[test]
    fn test_absorb_returns_owner() {
        let mut pool = UnitPool::new(1, 1, 1, PAGE);
        let alloc = pool
            .try_alloc(UnitKind::Write, target(StorageTier::Nvram, 4), true, 77)
            .unwrap();
        pool.get_mut(alloc.handle)
            .unwrap()
            .add_segment(0, Bytes::from_static(b"a"));

        assert_eq!(
            pool.try_absorb(PageKey::new(0, 4), 8, Bytes::from_static(b"b")),
            Some(77)
        );
        assert_eq!(pool.try_absorb(PageKey::new(0, 5), 8, Bytes::from_static(b"b")), None);
        assert_eq!(pool.counters().absorbed, 1);
    }

    #[test]
    fn test_cache_capacity_bounds_entries() {
        let mut pool = UnitPool::new(1, 4, 2, PAGE);
        for lpn in 0..4 {
            let alloc = pool
                .try_alloc(UnitKind::Write, target(StorageTier::Nvram, lpn), true, lpn)
                .unwrap();
            pool.release(alloc.handle);
            assert!(pool.cached_count() <= 2);
            assert_invariant(&pool);
        }
        assert_eq!(pool.resident_count(), 2);
    }

    fn write_through(pool: &mut UnitPool, handle: UnitHandle) -> Bytes {
        let unit = pool.get_mut(handle).unwrap();
        let mut written = None;
        loop {
            match unit.drive() {
                Drive::Submit(io) if io.direction == IoDirection::Read => {
                    unit.on_io_done(Ok(Some(Bytes::from(vec![0u8; PAGE]))));
                }
                Drive::Submit(io) => {
                    written = io.data;
                    unit.on_io_done(Ok(None));
                }
                Drive::Pending => unreachable!("results are fed back in place"),
                Drive::Complete => break,
            }
        }
        written.unwrap()
    }

    #[test]
    fn test_detached_hit_still_flushes_merged_image() {
        let mut pool = UnitPool::new(1, 4, 1, PAGE);
        let first = pool
            .try_alloc(UnitKind::Write, target(StorageTier::Nvram, 0), true, 1)
            .unwrap();
        pool.get_mut(first.handle)
            .unwrap()
            .add_segment(10, Bytes::from_static(b"old"));
        write_through(&mut pool, first.handle);
        pool.release(first.handle);
        assert_eq!(pool.resident_count(), 1);

        // Hit on page 0, then a miss on page 1 pushes page 0 out of the full cache
        let hit = pool
            .try_alloc(UnitKind::Write, target(StorageTier::Nvram, 0), true, 2)
            .unwrap();
        assert_eq!(hit.lookup, CacheLookup::Hit);
        pool.get_mut(hit.handle)
            .unwrap()
            .add_segment(100, Bytes::from_static(b"new"));
        let miss = pool
            .try_alloc(UnitKind::Write, target(StorageTier::Nvram, 1), true, 2)
            .unwrap();
        assert_eq!(miss.lookup, CacheLookup::Miss);
        assert_eq!(pool.cached_count(), 1);

        let unit = pool.get_mut(hit.handle).unwrap();
        let io = match unit.drive() {
            Drive::Submit(io) => io,
            other => panic!("expected a submission, got {other:?}"),
        };
        assert_eq!(io.direction, IoDirection::Write);
        let image = io.data.unwrap();
        assert_eq!(&image[10..13], b"old");
        assert_eq!(&image[100..103], b"new");
        unit.on_io_done(Ok(None));
        assert!(matches!(unit.drive(), Drive::Complete));

        // No longer cached, so release frees it
        pool.release(hit.handle);
        assert_eq!(pool.resident_count(), 0);
        write_through(&mut pool, miss.handle);
        pool.release(miss.handle);
        assert_eq!(pool.resident_count(), 1);
        assert_invariant(&pool);
    }

    #[test]
    fn test_release_all_cache_keeps_in_flight_path() {
        let mut pool = UnitPool::new(1, 2, 2, PAGE);
        let alloc = pool
            .try_alloc(UnitKind::Write, target(StorageTier::Nvram, 3), true, 1)
            .unwrap();
        pool.get_mut(alloc.handle)
            .unwrap()
            .add_segment(0, Bytes::from_static(b"abc"));

        assert_eq!(pool.release_all_cache(), 0);
        assert_eq!(pool.cached_count(), 0);

        let image = write_through(&mut pool, alloc.handle);
        assert_eq!(&image[..3], b"abc");
        pool.release(alloc.handle);
        assert_eq!(pool.free_count(UnitKind::Write), 2);
        assert_invariant(&pool);
    }

    #[test]
    fn test_random_sequences_keep_invariant() {
        let mut rng = rand::thread_rng();
        let mut pool = UnitPool::new(3, 5, 3, PAGE);
        let mut live: Vec<UnitHandle> = Vec::new();

        for step in 0..2000u64 {
            if !live.is_empty() && rng.gen_bool(0.45) {
                let handle = live.swap_remove(rng.gen_range(0..live.len()));
                assert!(pool.release(handle));
            } else {
                let kind = if rng.gen_bool(0.5) {
                    UnitKind::Read
                } else {
                    UnitKind::Write
                };
                let tier = if rng.gen_bool(0.5) {
                    StorageTier::Nvram
                } else {
                    StorageTier::Ssd
                };
                let lpn = rng.gen_range(0..6);
                if let Some(alloc) = pool.try_alloc(kind, target(tier, lpn), rng.gen_bool(0.7), step)
                {
                    assert!(!live.contains(&alloc.handle));
                    live.push(alloc.handle);
                }
            }
            assert_invariant(&pool);
        }
    }

    #[test]
    fn test_concurrent_lookup_and_eviction_never_share_units() {
        // Lookup, eviction and release all run under the one pool lock
        let pool = Arc::new(Mutex::new(UnitPool::new(2, 3, 3, PAGE)));
        let owners: Arc<Mutex<HashMap<u32, u64>>> = Arc::new(Mutex::new(HashMap::new()));

        let workers: Vec<_> = (0..4u64)
            .map(|worker| {
                let pool = Arc::clone(&pool);
                let owners = Arc::clone(&owners);
                std::thread::spawn(move || {
                    let mut rng = rand::thread_rng();
                    for i in 0..500u64 {
                        let owner = worker * 10_000 + i;
                        let lpn = rng.gen_range(0..4);
                        let alloc = {
                            let mut pool = pool.lock();
                            let alloc = pool.try_alloc(
                                UnitKind::Write,
                                target(StorageTier::Nvram, lpn),
                                true,
                                owner,
                            );
                            if let Some(alloc) = alloc {
                                let previous = owners.lock().insert(alloc.handle.index(), owner);
                                assert!(previous.is_none(), "unit handed to two owners");
                            }
                            alloc
                        };
                        std::thread::yield_now();
                        if let Some(alloc) = alloc {
                            let mut pool = pool.lock();
                            owners.lock().remove(&alloc.handle.index());
                            assert!(pool.release(alloc.handle));
                            assert_invariant(&pool);
                        }
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        let pool = pool.lock();
        assert_eq!(pool.used_count(UnitKind::Write), pool.resident_count());
        assert_invariant(&pool);
    }
}
