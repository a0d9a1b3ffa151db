use crate::gc::heap::{Heap, MAX_GENERATION};
use crate::gc::{Address, Region};
use crate::interface::SurvivorRecord;
use crate::object::Obj;

#[derive(Copy, Clone, Debug, Default)]
pub struct SweepStats {
    pub live_bytes: usize,
    pub freed_bytes: usize,
    pub released_pages: usize,
}

impl SweepStats {
    pub fn add(&mut self, other: &SweepStats) {
        self.live_bytes += other.live_bytes;
        self.freed_bytes += other.freed_bytes;
        self.released_pages += other.released_pages;
    }
}

/// Sums up the bytes of marked objects on each page.
pub fn compute_live_bytes(heap: &mut Heap, pages: &[usize]) {
    for &idx in pages {
        let mut live = 0;

        heap.walk_page(idx, |object| {
            if !object.is_filler() && object.header().is_marked() {
                live += object.size();
            }
        });

        heap.page_mut(idx).live_bytes = live;
    }
}

/// Sweeps a small page in place and moves it into `target`. Marked objects
/// survive with their GC bits cleared, everything else goes to the free
/// list of `target`. Pages without survivors are released.
pub fn sweep_page(
    heap: &mut Heap,
    idx: usize,
    target: usize,
    survivors: &mut Vec<SurvivorRecord>,
) -> SweepStats {
    let region = heap.page_region(idx);
    let top = heap.page(idx).top;
    let mut stats = SweepStats::default();
    let first_survivor = survivors.len();

    let free = walk_survivors(region.start, top, survivors, |object| {
        object.header().is_marked()
    });

    stats.live_bytes = survivors[first_survivor..]
        .iter()
        .map(|survivor| survivor.size)
        .sum();

    if stats.live_bytes == 0 {
        stats.freed_bytes = top.offset_from(region.start);
        stats.released_pages = 1;
        heap.release_page(idx);
        return stats;
    }

    heap.set_generation(idx, target);
    let page = heap.page_mut(idx);
    page.top = region.end;
    page.live_bytes = stats.live_bytes;
    page.pinned = false;

    stats.freed_bytes = add_free_ranges(heap, target, free, top, region.end);
    stats
}

/// Rebuilds an evacuated page that kept pinned objects. The page stays in
/// its generation; everything not pinned became free.
pub fn sweep_pinned_page(heap: &mut Heap, idx: usize) -> SweepStats {
    let region = heap.page_region(idx);
    let top = heap.page(idx).top;
    let generation = heap.page(idx).generation;
    let mut pinned = Vec::new();
    let mut stats = SweepStats::default();

    let free = walk_survivors(region.start, top, &mut pinned, |object| {
        object.header().is_pinned()
    });

    stats.live_bytes = pinned.iter().map(|survivor| survivor.size).sum();
    debug_assert!(stats.live_bytes > 0);

    let page = heap.page_mut(idx);
    page.top = region.end;
    page.live_bytes = stats.live_bytes;
    page.pinned = false;

    stats.freed_bytes = add_free_ranges(heap, generation, free, top, region.end);
    stats
}

/// Frees unmarked large objects of the oldest generation.
pub fn sweep_large(heap: &mut Heap, survivors: &mut Vec<SurvivorRecord>) -> SweepStats {
    let mut stats = SweepStats::default();

    for first in heap.large_objects(MAX_GENERATION) {
        let object = heap.page_start(first).to_obj();
        let size = object.size();

        if object.header().is_marked() {
            object.header().clear_gc_bits();
            stats.live_bytes += size;
            survivors.push(SurvivorRecord {
                old: object.address(),
                new: object.address(),
                size,
            });
        } else {
            stats.freed_bytes += size;
            stats.released_pages += 1;
            heap.free_large(first);
        }
    }

    stats
}

// Walks [start, top). Objects passing `survives` get their GC bits cleared
// and are recorded; returns the gaps between them.
fn walk_survivors<F>(
    start: Address,
    top: Address,
    survivors: &mut Vec<SurvivorRecord>,
    survives: F,
) -> Vec<Region>
where
    F: Fn(&Obj) -> bool,
{
    let mut free = Vec::new();
    let mut free_start = None;
    let mut scan = start;

    while scan < top {
        let object = scan.to_obj();
        let size = object.size();

        if !object.is_filler() && object.header().fwdptr().is_none() && survives(object) {
            if let Some(start) = free_start.take() {
                free.push(Region::new(start, scan));
            }

            object.header().clear_gc_bits();
            survivors.push(SurvivorRecord {
                old: scan,
                new: scan,
                size,
            });
        } else if free_start.is_none() {
            free_start = Some(scan);
        }

        scan = scan.offset(size);
    }

    assert_eq!(scan, top, "page not iterable at {}", top);

    if let Some(start) = free_start {
        free.push(Region::new(start, top));
    }

    free
}

fn add_free_ranges(
    heap: &mut Heap,
    generation: usize,
    mut free: Vec<Region>,
    top: Address,
    end: Address,
) -> usize {
    if top < end {
        match free.last_mut() {
            Some(last) if last.end == top => last.end = end,
            _ => free.push(Region::new(top, end)),
        }
    }

    let free_list = &mut heap.generation(generation).free_list;
    let mut freed = 0;

    for region in free {
        freed += region.size();
        free_list.add(region.start, region.end);
    }

    freed
}
