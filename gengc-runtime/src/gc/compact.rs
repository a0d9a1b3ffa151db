use fixedbitset::FixedBitSet;

use crate::gc::heap::{Heap, PageMap, MAX_GENERATION, PAGE_SIZE};
use crate::gc::root::Slot;
use crate::gc::Address;
use crate::interface::SurvivorRecord;

// old pages with less live data than this are evacuated
const EVACUATION_THRESHOLD: f32 = 0.666;

#[derive(Copy, Clone, Debug, Default)]
pub struct EvacuationStats {
    pub copied_objects: usize,
    pub copied_bytes: usize,
    pub promoted_bytes: usize,
    pub late_pinned: usize,
}

/// Picks the condemned pages whose survivors get copied out. Young pages
/// are always evacuated; pages of the oldest generation only when they are
/// sparsely populated. Pages with pinned objects are evacuated as well,
/// their pinned objects just stay behind.
pub fn select_pages(heap: &Heap, pages: &[usize]) -> Vec<usize> {
    pages
        .iter()
        .copied()
        .filter(|&idx| {
            let page = heap.page(idx);

            if page.live_bytes == 0 {
                false
            } else if page.generation < MAX_GENERATION {
                true
            } else {
                (page.live_bytes as f32) < EVACUATION_THRESHOLD * PAGE_SIZE as f32
            }
        })
        .collect()
}

/// generation survivors of `generation` are copied to
pub fn target_generation(generation: usize) -> usize {
    (generation + 1).min(MAX_GENERATION)
}

/// Copies the marked objects of a page to its target generation and leaves
/// a forwarding pointer behind. `pinned` holds the sorted pin queue entries
/// of the page; these objects stay where they are. Objects that cannot be
/// copied are pinned in place as well.
pub fn evacuate_page(
    heap: &mut Heap,
    idx: usize,
    pinned: &[Address],
    survivors: &mut Vec<SurvivorRecord>,
    stats: &mut EvacuationStats,
) {
    let region = heap.page_region(idx);
    let top = heap.page(idx).top;
    let generation = heap.page(idx).generation;
    let target = target_generation(generation);

    let mut pinned = pinned.iter().copied().peekable();
    let mut scan = region.start;

    while scan < top {
        let object = scan.to_obj();
        let size = object.size();

        if object.is_filler() || !object.header().is_marked() {
            scan = scan.offset(size);
            continue;
        }

        while pinned.next_if(|&pin| pin < scan).is_some() {}

        if pinned.next_if_eq(&scan).is_some() {
            debug_assert!(object.header().is_pinned());
            heap.page_mut(idx).pinned = true;
            survivors.push(SurvivorRecord {
                old: scan,
                new: scan,
                size,
            });
            scan = scan.offset(size);
            continue;
        }

        match heap.allocate(target, size) {
            Some(copy) => {
                object.copy_to(copy, size);
                object.header().install_fwdptr(copy);

                stats.copied_objects += 1;
                stats.copied_bytes += size;

                if target != generation {
                    stats.promoted_bytes += size;
                }

                survivors.push(SurvivorRecord {
                    old: scan,
                    new: copy,
                    size,
                });
            }

            None => {
                object.header().mark_pinned();
                heap.page_mut(idx).pinned = true;
                stats.late_pinned += 1;

                survivors.push(SurvivorRecord {
                    old: scan,
                    new: scan,
                    size,
                });
            }
        }

        scan = scan.offset(size);
    }

    assert_eq!(scan, top, "page {} not iterable", idx);
}

/// Resolves forwarding pointers left behind by evacuation.
pub struct Forwarding<'a> {
    page_map: &'a PageMap,
    evacuated: FixedBitSet,
}

impl<'a> Forwarding<'a> {
    pub fn new(page_map: &'a PageMap, pages: &[usize]) -> Forwarding<'a> {
        let page_count = page_map.region().size() / PAGE_SIZE;
        let mut evacuated = FixedBitSet::with_capacity(page_count);

        for &idx in pages {
            evacuated.insert(idx);
        }

        Forwarding {
            page_map,
            evacuated,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.evacuated.is_clear()
    }

    pub fn is_evacuated(&self, addr: Address) -> bool {
        self.page_map.contains(addr) && self.evacuated.contains(self.page_map.page_index(addr))
    }

    #[inline(always)]
    pub fn forward(&self, addr: Address) -> Address {
        if self.is_evacuated(addr) {
            if let Some(copy) = addr.to_obj().header().fwdptr() {
                return copy;
            }
        }

        addr
    }

    #[inline(always)]
    pub fn update_slot(&self, slot: Slot) {
        let value = slot.get();
        let forwarded = self.forward(value);

        if forwarded != value {
            slot.set(forwarded);
        }
    }

    pub fn update_object(&self, object: Address) {
        object
            .to_obj()
            .visit_reference_fields(|slot| self.update_slot(slot));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{initialize_object, TypeDescriptor, TypeRef};

    #[test]
    fn test_evacuate_and_forward() {
        let ty = TypeRef::register(TypeDescriptor::fixed("Cell", 2, &[0]));
        let mut heap = Heap::new(16 * PAGE_SIZE).expect("reservation failed");
        let size = ty.object_size(0);

        let mut objects = Vec::new();
        for _ in 0..4 {
            let address = heap.allocate(0, size).expect("heap full");
            unsafe { initialize_object(address, ty, 0, size) };
            objects.push(address);
        }
        heap.reset_allocation(0);

        objects[0].to_obj().field(0).set(objects[2]);
        objects[0].to_obj().field(1).set(Address::from(42));
        objects[0].to_obj().header().try_mark();
        objects[1].to_obj().header().mark_pinned();
        objects[2].to_obj().header().try_mark();

        let page = heap.page_index(objects[0]);
        let mut survivors = Vec::new();
        let mut stats = EvacuationStats::default();
        evacuate_page(&mut heap, page, &[objects[1]], &mut survivors, &mut stats);

        assert_eq!(2, stats.copied_objects);
        assert_eq!(2 * size, stats.promoted_bytes);
        assert!(heap.page(page).pinned);
        assert_eq!(3, survivors.len());

        let forwarding = Forwarding::new(heap.page_map(), &[page]);
        let copy = forwarding.forward(objects[0]);
        assert_ne!(copy, objects[0]);
        assert_eq!(Some(1), heap.page_map().generation_of(copy));
        assert_eq!(objects[1], forwarding.forward(objects[1]));

        forwarding.update_object(copy);
        assert_eq!(forwarding.forward(objects[2]), copy.to_obj().field(0).get());
        assert_eq!(Address::from(42), copy.to_obj().field(1).get());
        assert!(!copy.to_obj().header().is_marked());
    }

    #[test]
    fn test_select_pages() {
        let mut heap = Heap::new(16 * PAGE_SIZE).expect("reservation failed");
        let young = heap.acquire_page(0).expect("no page");
        let dense = heap.acquire_page(MAX_GENERATION).expect("no page");
        let sparse = heap.acquire_page(MAX_GENERATION).expect("no page");
        let empty = heap.acquire_page(0).expect("no page");

        heap.page_mut(young).live_bytes = PAGE_SIZE;
        heap.page_mut(dense).live_bytes = PAGE_SIZE - 64;
        heap.page_mut(sparse).live_bytes = 64;

        let selected = select_pages(&heap, &[young, dense, sparse, empty]);
        assert_eq!(vec![young, sparse], selected);
        assert_eq!(MAX_GENERATION, target_generation(MAX_GENERATION));
    }
}
