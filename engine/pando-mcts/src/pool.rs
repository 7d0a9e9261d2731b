//! Fixed-capacity node allocator with striped free lists.
//!
//! Free indices are partitioned across `STRIPES` mutex-guarded lists.
//! Workers allocate through a per-worker local cache refilled in chunks,
//! so the stripe mutexes are touched once per `REFILL_BATCH` allocations
//! in the steady state. A worker never holds two stripe locks at once.

use std::sync::Mutex;

/// Number of free-list stripes.
pub const STRIPES: usize = 8;

/// Soft bound on a worker's local cache of free indices.
const LOCAL_CACHE_MAX: usize = 128;

/// How many indices a refill moves from a stripe into the local cache.
const REFILL_BATCH: usize = 64;

/// Striped pool of free node indices in `0..capacity`.
pub struct NodePool {
    stripes: [Mutex<Vec<u32>>; STRIPES],
    capacity: u32,
}

/// Per-worker cache of recently freed / prefetched indices.
///
/// Owned by one worker (or the controller); never shared.
#[derive(Debug)]
pub struct LocalCache {
    worker: usize,
    cache: Vec<u32>,
    flushes: usize,
}

impl LocalCache {
    pub fn new(worker: usize) -> Self {
        Self {
            worker,
            cache: Vec::with_capacity(LOCAL_CACHE_MAX + REFILL_BATCH),
            flushes: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

impl NodePool {
    /// Create a pool with every index in `0..capacity` free, distributed
    /// evenly across the stripes.
    pub fn new(capacity: u32) -> Self {
        let mut lists: [Vec<u32>; STRIPES] = Default::default();
        for (i, list) in lists.iter_mut().enumerate() {
            let mut idx = i as u32;
            while idx < capacity {
                list.push(idx);
                idx += STRIPES as u32;
            }
        }
        Self {
            stripes: lists.map(Mutex::new),
            capacity,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Pop a free index, refilling the local cache from the stripes on a
    /// miss. Returns `None` when every stripe is empty.
    pub fn alloc(&self, local: &mut LocalCache) -> Option<u32> {
        if let Some(idx) = local.cache.pop() {
            return Some(idx);
        }

        let start = local.worker % STRIPES;
        for offset in 0..STRIPES {
            let mut stripe = self.stripes[(start + offset) % STRIPES].lock().unwrap();
            if stripe.is_empty() {
                continue;
            }
            let take = REFILL_BATCH.min(stripe.len());
            let split = stripe.len() - take;
            local.cache.extend(stripe.drain(split..));
            drop(stripe);
            return local.cache.pop();
        }
        None
    }

    /// Return an index through the local cache, spilling half of the cache
    /// to a stripe when it grows past its soft bound.
    pub fn free(&self, local: &mut LocalCache, idx: u32) {
        local.cache.push(idx);
        if local.cache.len() > LOCAL_CACHE_MAX {
            let keep = local.cache.len() / 2;
            let spill: Vec<u32> = local.cache.drain(keep..).collect();
            let stripe = (local.worker + local.flushes) % STRIPES;
            local.flushes += 1;
            self.stripes[stripe].lock().unwrap().extend(spill);
        }
    }

    /// Return an index directly to its home stripe. Used outside worker
    /// context (reroot, subtree free on the controller thread).
    pub fn free_global(&self, idx: u32) {
        self.stripes[idx as usize % STRIPES].lock().unwrap().push(idx);
    }

    /// Empty a local cache back into the stripes. Workers call this when a
    /// search ends so the free count is observable again.
    pub fn flush_local(&self, local: &mut LocalCache) {
        if local.cache.is_empty() {
            return;
        }
        let stripe = (local.worker + local.flushes) % STRIPES;
        local.flushes += 1;
        let mut guard = self.stripes[stripe].lock().unwrap();
        guard.extend(local.cache.drain(..));
    }

    /// Total free indices sitting in the stripes. Excludes indices parked
    /// in local caches; exact between searches once caches are flushed.
    pub fn free_count(&self) -> usize {
        self.stripes
            .iter()
            .map(|s| s.lock().unwrap().len())
            .sum()
    }
}

impl std::fmt::Debug for NodePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodePool")
            .field("capacity", &self.capacity)
            .field("free", &self.free_count())
            .finish()
    }
}
