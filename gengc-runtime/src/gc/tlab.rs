use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::gc::remset::RemsetBuffer;
use crate::gc::{Address, Region, K};
use crate::object::fill_region;

pub const MIN_TLAB_SIZE: usize = 4 * K;
pub const DEFAULT_TLAB_SIZE: usize = 16 * K;

/// Per-thread bump region. Only the owning thread allocates from it; the
/// collector reads and resets it while the owner is stopped.
pub struct AllocationContext {
    thread_id: usize,
    top: AtomicUsize,
    limit: AtomicUsize,
    allocated_bytes: AtomicUsize,
    remset: Mutex<RemsetBuffer>,
}

impl AllocationContext {
    pub fn new(thread_id: usize) -> AllocationContext {
        AllocationContext {
            thread_id,
            top: AtomicUsize::new(0),
            limit: AtomicUsize::new(0),
            allocated_bytes: AtomicUsize::new(0),
            remset: Mutex::new(RemsetBuffer::new()),
        }
    }

    pub fn thread_id(&self) -> usize {
        self.thread_id
    }

    pub fn region(&self) -> Region {
        Region::new(
            self.top.load(Ordering::Relaxed).into(),
            self.limit.load(Ordering::Relaxed).into(),
        )
    }

    /// bytes handed to this context since it was created
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn allocate(&self, size: usize) -> Option<Address> {
        let top = self.top.load(Ordering::Relaxed);
        let limit = self.limit.load(Ordering::Relaxed);

        if limit - top >= size {
            self.top.store(top + size, Ordering::Relaxed);
            Some(top.into())
        } else {
            None
        }
    }

    pub fn install(&self, region: Region) {
        self.top.store(region.start.to_usize(), Ordering::Relaxed);
        self.limit.store(region.end.to_usize(), Ordering::Relaxed);
        self.allocated_bytes
            .fetch_add(region.size(), Ordering::Relaxed);
    }

    /// Abandons the rest of the region: fills it so that the page stays
    /// iterable and leaves the context empty.
    pub fn make_iterable(&self) {
        let region = self.region();
        fill_region(region.start, region.end);

        self.top.store(0, Ordering::Relaxed);
        self.limit.store(0, Ordering::Relaxed);
    }

    pub fn remset(&self) -> &Mutex<RemsetBuffer> {
        &self.remset
    }
}
