//! Oversized and over-aligned allocations, each in its own mapped region.

pub mod region;

use crate::platform;
use crate::sync::RawMutex;
use core::marker::PhantomData;
use core::mem::size_of;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
pub use region::{HugeRegion, RegionPlan, REGION_TAG};

/// Slots per table. Must be a power of two.
const TABLE_CAPACITY: usize = 4096;

/// Entries a table takes before inserts move on to the next one.
const TABLE_LOAD_LIMIT: usize = TABLE_CAPACITY * 3 / 4;

/// One open-addressing slot. Writers hold the registry lock; the fault
/// handler reads slots without it, so every field is atomic and `key` is
/// published last.
struct Slot {
    /// User pointer, 0 for an empty slot.
    key: AtomicUsize,
    base: AtomicUsize,
    total_size: AtomicUsize,
}

impl Slot {
    const fn empty() -> Self {
        Slot {
            key: AtomicUsize::new(0),
            base: AtomicUsize::new(0),
            total_size: AtomicUsize::new(0),
        }
    }

    fn load(&self) -> Option<HugeRegion> {
        let key = self.key.load(Ordering::Acquire);
        if key == 0 {
            return None;
        }
        Some(HugeRegion {
            base: self.base.load(Ordering::Relaxed),
            total_size: self.total_size.load(Ordering::Relaxed),
            user_ptr: key,
        })
    }

    fn store(&self, region: &HugeRegion) {
        self.base.store(region.base, Ordering::Relaxed);
        self.total_size.store(region.total_size, Ordering::Relaxed);
        self.key.store(region.user_ptr, Ordering::Release);
    }

    fn clear(&self) {
        self.key.store(0, Ordering::Release);
    }
}

/// A fixed open-addressed hash table. All-zero bytes are a valid empty
/// table, so overflow tables come straight from an anonymous mapping.
struct Table {
    slots: [Slot; TABLE_CAPACITY],
    count: AtomicUsize,
    next: AtomicPtr<Table>,
}

impl Table {
    const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const EMPTY: Slot = Slot::empty();
        Table {
            slots: [EMPTY; TABLE_CAPACITY],
            count: AtomicUsize::new(0),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn is_full(&self) -> bool {
        self.count.load(Ordering::Relaxed) >= TABLE_LOAD_LIMIT
    }

    /// Store `region`; false if the table is at its load limit. Caller holds
    /// the registry lock.
    fn insert(&self, region: &HugeRegion) -> bool {
        if self.is_full() {
            return false;
        }
        let mask = TABLE_CAPACITY - 1;
        let mut idx = hash_ptr(region.user_ptr) & mask;
        loop {
            let key = self.slots[idx].key.load(Ordering::Relaxed);
            if key == 0 || key == region.user_ptr {
                if key == 0 {
                    self.count.fetch_add(1, Ordering::Relaxed);
                }
                self.slots[idx].store(region);
                return true;
            }
            idx = (idx + 1) & mask;
        }
    }

    fn find_slot(&self, key: usize) -> Option<usize> {
        let mask = TABLE_CAPACITY - 1;
        let mut idx = hash_ptr(key) & mask;
        for _ in 0..TABLE_CAPACITY {
            match self.slots[idx].key.load(Ordering::Relaxed) {
                0 => return None,
                k if k == key => return Some(idx),
                _ => idx = (idx + 1) & mask,
            }
        }
        None
    }

    /// Remove the entry at `idx` and shift later probes back into the hole.
    fn remove_at(&self, idx: usize) {
        let mask = TABLE_CAPACITY - 1;
        self.slots[idx].clear();
        self.count.fetch_sub(1, Ordering::Relaxed);

        let mut next = (idx + 1) & mask;
        let mut vacancy = idx;
        while let Some(entry) = self.slots[next].load() {
            let ideal = hash_ptr(entry.user_ptr) & mask;
            let should_move = if next > vacancy {
                ideal <= vacancy || ideal > next
            } else {
                ideal <= vacancy && ideal > next
            };
            if should_move {
                self.slots[vacancy].store(&entry);
                self.slots[next].clear();
                vacancy = next;
            }
            next = (next + 1) & mask;
        }
    }

    fn regions(&self) -> impl Iterator<Item = HugeRegion> + '_ {
        self.slots.iter().filter_map(Slot::load)
    }
}

/// Table of live dedicated regions keyed by user pointer. Starts with one
/// inline table and chains mapped overflow tables as it fills; tables stay
/// linked until the registry is dropped.
pub struct HugeRegistry {
    lock: RawMutex,
    first: Table,
    count: AtomicUsize,
    overflow_tables: AtomicUsize,
}

/// Hash a pointer for the registry.
#[inline]
fn hash_ptr(key: usize) -> usize {
    // splitmix64 finalizer
    let mut x = key as u64;
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58476d1ce4e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d049bb133111eb);
    x ^= x >> 31;
    x as usize
}

struct Tables<'a> {
    next: *const Table,
    _registry: PhantomData<&'a HugeRegistry>,
}

impl<'a> Iterator for Tables<'a> {
    type Item = &'a Table;

    fn next(&mut self) -> Option<&'a Table> {
        // SAFETY: linked tables stay mapped until the registry is dropped.
        let table = unsafe { self.next.as_ref()? };
        self.next = table.next.load(Ordering::Acquire);
        Some(table)
    }
}

impl HugeRegistry {
    pub const fn new() -> Self {
        HugeRegistry {
            lock: RawMutex::new(),
            first: Table::new(),
            count: AtomicUsize::new(0),
            overflow_tables: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mapped tables chained after the inline one.
    pub fn overflow_tables(&self) -> usize {
        self.overflow_tables.load(Ordering::Relaxed)
    }

    fn tables(&self) -> Tables<'_> {
        Tables {
            next: &self.first,
            _registry: PhantomData,
        }
    }

    /// Record `region`. Returns false only if every table is full and no
    /// further table can be mapped.
    pub fn insert(&self, region: &HugeRegion) -> bool {
        self.lock.lock();
        let stored = self.insert_locked(region);
        self.lock.unlock();
        stored
    }

    fn insert_locked(&self, region: &HugeRegion) -> bool {
        let mut tail = &self.first;
        for table in self.tables() {
            if table.insert(region) {
                self.count.fetch_add(1, Ordering::Relaxed);
                return true;
            }
            tail = table;
        }
        // SAFETY: a fresh anonymous mapping is zeroed, which is an empty table.
        let table = unsafe { platform::map_anonymous(size_of::<Table>()) } as *mut Table;
        if table.is_null() {
            return false;
        }
        // SAFETY: just mapped and not yet published.
        let stored = unsafe { (*table).insert(region) };
        tail.next.store(table, Ordering::Release);
        self.overflow_tables.fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        stored
    }

    /// Exact lookup by user pointer.
    pub fn lookup(&self, ptr: usize) -> Option<HugeRegion> {
        if ptr == 0 {
            return None;
        }
        self.lock.lock();
        let found = self.tables().find_map(|table| {
            table.find_slot(ptr).and_then(|idx| table.slots[idx].load())
        });
        self.lock.unlock();
        found
    }

    /// Remove the region whose user pointer is `ptr` and return it.
    pub fn remove(&self, ptr: usize) -> Option<HugeRegion> {
        if ptr == 0 {
            return None;
        }
        self.lock.lock();
        let removed = self.tables().find_map(|table| {
            let idx = table.find_slot(ptr)?;
            let region = table.slots[idx].load();
            table.remove_at(idx);
            region
        });
        if removed.is_some() {
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
        self.lock.unlock();
        removed
    }

    /// Region whose mapping contains `address`, found by scanning every slot
    /// without the lock. Best effort while a writer is active.
    pub fn find_containing(&self, address: usize) -> Option<HugeRegion> {
        self.tables()
            .flat_map(Table::regions)
            .find(|region| region.contains(address))
    }

    /// Visit every registered region under the lock. `f` must not allocate.
    pub fn for_each(&self, mut f: impl FnMut(&HugeRegion)) {
        self.lock.lock();
        for region in self.tables().flat_map(Table::regions) {
            f(&region);
        }
        self.lock.unlock();
    }

    /// Empty every table and hand each region to `f`.
    pub fn drain(&self, mut f: impl FnMut(HugeRegion)) {
        self.lock.lock();
        for table in self.tables() {
            for slot in &table.slots {
                if let Some(region) = slot.load() {
                    slot.clear();
                    f(region);
                }
            }
            table.count.store(0, Ordering::Relaxed);
        }
        self.count.store(0, Ordering::Relaxed);
        self.lock.unlock();
    }

    /// Reset the lock.
    ///
    /// # Safety
    /// Only in the single-threaded child right after `fork`.
    pub unsafe fn force_unlock(&self) {
        self.lock.force_unlock();
    }
}

impl Default for HugeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HugeRegistry {
    fn drop(&mut self) {
        let mut cursor = self.first.next.swap(ptr::null_mut(), Ordering::AcqRel);
        while !cursor.is_null() {
            // SAFETY: overflow tables were mapped by `insert_locked` and
            // nothing can reach them once the registry is dropped.
            unsafe {
                let next = (*cursor).next.load(Ordering::Acquire);
                platform::unmap(cursor as *mut u8, size_of::<Table>());
                cursor = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(user_ptr: usize) -> HugeRegion {
        HugeRegion {
            base: user_ptr - 0x1000,
            total_size: 0x3000,
            user_ptr,
        }
    }

    #[test]
    fn insert_lookup_remove() {
        let registry = Box::new(HugeRegistry::new());
        assert!(registry.insert(&region(0x10_1000)));
        assert!(registry.insert(&region(0x20_1000)));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.lookup(0x10_1000), Some(region(0x10_1000)));
        assert_eq!(registry.lookup(0x10_1008), None);
        assert_eq!(registry.remove(0x10_1000), Some(region(0x10_1000)));
        assert_eq!(registry.lookup(0x10_1000), None);
        assert_eq!(registry.lookup(0x20_1000), Some(region(0x20_1000)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn containing_lookup_covers_the_whole_mapping() {
        let registry = Box::new(HugeRegistry::new());
        registry.insert(&region(0x40_1000));
        assert_eq!(registry.find_containing(0x40_0000), Some(region(0x40_1000)));
        assert_eq!(registry.find_containing(0x40_2fff), Some(region(0x40_1000)));
        assert_eq!(registry.find_containing(0x40_3000), None);
    }

    #[test]
    fn removal_keeps_colliding_entries_reachable() {
        let registry = Box::new(HugeRegistry::new());
        let keys: Vec<usize> = (1..=200).map(|i| i * 0x10_0000 + 0x1000).collect();
        for &key in &keys {
            assert!(registry.insert(&region(key)));
        }
        for &key in keys.iter().step_by(2) {
            assert!(registry.remove(key).is_some());
        }
        for (i, &key) in keys.iter().enumerate() {
            assert_eq!(registry.lookup(key).is_some(), i % 2 == 1, "key {:#x}", key);
        }
    }

    #[test]
    fn overflow_tables_take_inserts_past_the_load_limit() {
        let registry = Box::new(HugeRegistry::new());
        let total = TABLE_LOAD_LIMIT * 2 + 10;
        for i in 0..total {
            assert!(registry.insert(&region((i + 1) * 0x10_0000 + 0x1000)));
        }
        assert_eq!(registry.len(), total);
        assert_eq!(registry.overflow_tables(), 2);

        // Entries in every table stay reachable, exactly and by containment.
        for i in [0, TABLE_LOAD_LIMIT, total - 1] {
            let key = (i + 1) * 0x10_0000 + 0x1000;
            assert_eq!(registry.lookup(key), Some(region(key)));
            assert_eq!(registry.find_containing(key + 0x1000), Some(region(key)));
        }
        let last = total * 0x10_0000 + 0x1000;
        assert_eq!(registry.remove(last), Some(region(last)));
        assert_eq!(registry.lookup(last), None);
        assert_eq!(registry.len(), total - 1);

        let mut drained = 0;
        registry.drain(|_| drained += 1);
        assert_eq!(drained, total - 1);
        assert!(registry.is_empty());
        // Drained tables are reused before any new one is mapped.
        assert!(registry.insert(&region(0x7000_1000)));
        assert_eq!(registry.overflow_tables(), 2);
    }
}
