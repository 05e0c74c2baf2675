//! Process-wide allocation statistics: per-category counters and the map of live allocations.
//!
//! Each counter group and the live map sit behind their own lock, so threads recording
//! different categories do not contend with each other or with map updates.

use std::{
    collections::HashMap,
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
};

use serde::{Deserialize, Serialize};

/// Allocation address, as returned by the allocator.
pub type Address = usize;

/// Live allocations keyed by address.  Whatever is left at shutdown is a leak.
pub type LiveMap = HashMap<Address, AllocationRecord>;

/// Allocation call categories that carry counters.  `free` only affects the live map.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    Malloc,
    Calloc,
    Realloc,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Malloc, Category::Calloc, Category::Realloc];

    pub fn name(self) -> &'static str {
        match self {
            Category::Malloc => "malloc",
            Category::Calloc => "calloc",
            Category::Realloc => "realloc",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Bookkeeping for one live allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRecord {
    pub size: u64,
    /// Return address of the code that requested the allocation, if it could be captured.
    pub caller: Option<Address>,
}

/// Number of calls and total bytes requested for one category.
///
/// Both values wrap on overflow rather than saturate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCounters {
    pub count: u32,
    pub bytes: u64,
}

impl CategoryCounters {
    fn add(&mut self, size: u64) {
        self.count = self.count.wrapping_add(1);
        self.bytes = self.bytes.wrapping_add(size);
    }
}

#[derive(Debug, Default)]
pub struct Statistics {
    malloc: Mutex<CategoryCounters>,
    calloc: Mutex<CategoryCounters>,
    realloc: Mutex<CategoryCounters>,
    live: Mutex<LiveMap>,
}

// Recording runs inside the allocator, where panicking is not an option.  A poisoned lock still
// guards consistent data (every critical section is a single update), so just take it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    fn counters_for(&self, category: Category) -> &Mutex<CategoryCounters> {
        match category {
            Category::Malloc => &self.malloc,
            Category::Calloc => &self.calloc,
            Category::Realloc => &self.realloc,
        }
    }

    /// Consistent count/bytes pair for `category`.
    pub fn counters(&self, category: Category) -> CategoryCounters {
        *lock(self.counters_for(category))
    }

    pub fn count(&self, category: Category) -> u32 {
        self.counters(category).count
    }

    pub fn bytes(&self, category: Category) -> u64 {
        self.counters(category).bytes
    }

    /// Bumps the counters of `category` without touching the live map.
    pub fn count_call(&self, category: Category, size: u64) {
        lock(self.counters_for(category)).add(size);
    }

    /// Inserts a live-map record, replacing any record already stored at `address`.
    pub fn insert_allocation(&self, address: Address, record: AllocationRecord) {
        lock(&self.live).insert(address, record);
    }

    /// Counts a call of `category` and records the allocation it produced.
    pub fn record_allocation(
        &self,
        category: Category,
        address: Address,
        size: u64,
        caller: Option<Address>,
    ) {
        self.count_call(category, size);
        self.insert_allocation(address, AllocationRecord { size, caller });
    }

    /// Forgets the allocation at `address`.  Unknown addresses are ignored.
    pub fn remove_allocation(&self, address: Address) -> Option<AllocationRecord> {
        lock(&self.live).remove(&address)
    }

    pub fn live_allocation(&self, address: Address) -> Option<AllocationRecord> {
        lock(&self.live).get(&address).copied()
    }

    pub fn live_count(&self) -> usize {
        lock(&self.live).len()
    }

    /// Point-in-time copy of the live map.  The lock is released before returning, so callers
    /// can take as long as they like with the copy.
    pub fn clone_live_map(&self) -> LiveMap {
        lock(&self.live).clone()
    }
}
