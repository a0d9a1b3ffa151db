use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use fixedbitset::FixedBitSet;

use crate::error::GcError;
use crate::gc::freelist::FreeList;
use crate::gc::{Address, Region, K};
use crate::mem;
use crate::object::{Obj, MIN_OBJECT_SIZE};
use crate::os::{self, Reservation};

pub const PAGE_SIZE_BITS: usize = 16;
pub const PAGE_SIZE: usize = 1 << PAGE_SIZE_BITS;

/// objects of at least this size are allocated in the large object space
pub const LARGE_OBJECT_SIZE: usize = 32 * K;

pub const MAX_GENERATION: usize = 2;
pub const GENERATIONS: usize = MAX_GENERATION + 1;

const NO_GENERATION: u8 = u8::MAX;
const MIN_PAGES: usize = 8;

/// Generation of every page, readable without the heap lock. Used by the
/// write barrier and by root classification.
pub struct PageMap {
    start: Address,
    end: Address,
    generations: Box<[AtomicU8]>,
}

impl PageMap {
    fn new(region: Region) -> PageMap {
        let pages = region.size() / PAGE_SIZE;

        PageMap {
            start: region.start,
            end: region.end,
            generations: (0..pages).map(|_| AtomicU8::new(NO_GENERATION)).collect(),
        }
    }

    pub fn region(&self) -> Region {
        Region::new(self.start, self.end)
    }

    #[inline(always)]
    pub fn contains(&self, addr: Address) -> bool {
        self.start <= addr && addr < self.end
    }

    #[inline(always)]
    pub fn page_index(&self, addr: Address) -> usize {
        debug_assert!(self.contains(addr));
        addr.offset_from(self.start) >> PAGE_SIZE_BITS
    }

    /// generation of the page holding `addr`, None outside the heap or for
    /// free pages
    #[inline(always)]
    pub fn generation_of(&self, addr: Address) -> Option<usize> {
        if !self.contains(addr) {
            return None;
        }

        match self.generations[self.page_index(addr)].load(Ordering::Acquire) {
            NO_GENERATION => None,
            generation => Some(generation as usize),
        }
    }

    /// true if `addr` lies in a page of generation `condemned` or younger
    #[inline(always)]
    pub fn is_condemned(&self, addr: Address, condemned: usize) -> bool {
        self.generation_of(addr)
            .is_some_and(|generation| generation <= condemned)
    }

    fn set_generation(&self, idx: usize, generation: Option<usize>) {
        let value = generation.map_or(NO_GENERATION, |g| g as u8);
        self.generations[idx].store(value, Ordering::Release);
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PageKind {
    Free,
    Small,
    LargeStart { pages: usize },
    LargeContinuation { start: usize },
}

#[derive(Copy, Clone, Debug)]
pub struct PageInfo {
    pub kind: PageKind,
    pub generation: usize,
    /// end of the iterable part of a small page
    pub top: Address,
    /// bytes of marked objects, valid after marking
    pub live_bytes: usize,
    /// holds at least one pinned object in the current cycle
    pub pinned: bool,
}

impl PageInfo {
    fn free() -> PageInfo {
        PageInfo {
            kind: PageKind::Free,
            generation: 0,
            top: Address::null(),
            live_bytes: 0,
            pinned: false,
        }
    }

    pub fn is_small(&self) -> bool {
        self.kind == PageKind::Small
    }
}

pub struct Generation {
    pub free_list: FreeList,
    alloc_page: Option<usize>,
}

impl Generation {
    fn new() -> Generation {
        Generation {
            free_list: FreeList::new(),
            alloc_page: None,
        }
    }
}

/// Page-granular heap: small pages belong to one generation each, large
/// objects get runs of consecutive pages of their own.
pub struct Heap {
    reservation: Reservation,
    page_map: Arc<PageMap>,
    pages: Vec<PageInfo>,
    free_pages: FixedBitSet,
    generations: Vec<Generation>,
}

impl Heap {
    pub fn new(max_heap_size: usize) -> Result<Heap, GcError> {
        let size = mem::align_usize_up(max_heap_size, PAGE_SIZE).max(MIN_PAGES * PAGE_SIZE);
        let reservation =
            os::reserve_align(size, PAGE_SIZE).ok_or(GcError::ReservationFailed(size))?;

        let region = Region::new(reservation.start(), reservation.end());
        let page_count = size / PAGE_SIZE;

        let mut free_pages = FixedBitSet::with_capacity(page_count);
        free_pages.insert_range(..);

        log::debug!("heap reserved at {} with {} pages", region, page_count);

        Ok(Heap {
            reservation,
            page_map: Arc::new(PageMap::new(region)),
            pages: vec![PageInfo::free(); page_count],
            free_pages,
            generations: (0..GENERATIONS).map(|_| Generation::new()).collect(),
        })
    }

    pub fn page_map(&self) -> &Arc<PageMap> {
        &self.page_map
    }

    pub fn region(&self) -> Region {
        Region::new(self.reservation.start(), self.reservation.end())
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn free_page_count(&self) -> usize {
        self.free_pages.count_ones(..)
    }

    pub fn page_start(&self, idx: usize) -> Address {
        self.reservation.start().offset(idx << PAGE_SIZE_BITS)
    }

    pub fn page_region(&self, idx: usize) -> Region {
        let start = self.page_start(idx);
        Region::new(start, start.offset(PAGE_SIZE))
    }

    pub fn page_index(&self, addr: Address) -> usize {
        self.page_map.page_index(addr)
    }

    pub fn page(&self, idx: usize) -> &PageInfo {
        &self.pages[idx]
    }

    pub fn page_mut(&mut self, idx: usize) -> &mut PageInfo {
        &mut self.pages[idx]
    }

    pub fn generation(&mut self, generation: usize) -> &mut Generation {
        &mut self.generations[generation]
    }

    /// small pages of the generation in address order
    pub fn small_pages(&self, generation: usize) -> Vec<usize> {
        self.pages
            .iter()
            .enumerate()
            .filter(|(_, page)| page.is_small() && page.generation == generation)
            .map(|(idx, _)| idx)
            .collect()
    }

    /// first page of every large object in the generation
    pub fn large_objects(&self, generation: usize) -> Vec<usize> {
        self.pages
            .iter()
            .enumerate()
            .filter(|(_, page)| {
                matches!(page.kind, PageKind::LargeStart { .. }) && page.generation == generation
            })
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Makes the page part of `generation`. Large objects move with all of
    /// their pages.
    pub fn set_generation(&mut self, idx: usize, generation: usize) {
        let pages = match self.pages[idx].kind {
            PageKind::Small => 1,
            PageKind::LargeStart { pages } => pages,
            kind => panic!("cannot change generation of page {} ({:?})", idx, kind),
        };

        for page in idx..idx + pages {
            self.pages[page].generation = generation;
            self.page_map.set_generation(page, Some(generation));
        }
    }

    pub fn acquire_page(&mut self, generation: usize) -> Option<usize> {
        let idx = self.free_pages.ones().next()?;
        self.free_pages.set(idx, false);

        let start = self.page_start(idx);
        self.pages[idx] = PageInfo {
            kind: PageKind::Small,
            generation,
            top: start,
            live_bytes: 0,
            pinned: false,
        };
        self.page_map.set_generation(idx, Some(generation));

        Some(idx)
    }

    pub fn release_page(&mut self, idx: usize) {
        let info = self.pages[idx];
        assert!(info.is_small(), "page {} is not a small page", idx);

        let region = self.page_region(idx);
        let generation = &mut self.generations[info.generation];
        generation.free_list.remove_within(region);

        if generation.alloc_page == Some(idx) {
            generation.alloc_page = None;
        }

        os::discard(region.start, PAGE_SIZE);
        self.pages[idx] = PageInfo::free();
        self.free_pages.insert(idx);
        self.page_map.set_generation(idx, None);
    }

    /// Bump or free-list allocation of a small object in `generation`.
    pub fn allocate(&mut self, generation: usize, size: usize) -> Option<Address> {
        debug_assert!(size >= MIN_OBJECT_SIZE && size < LARGE_OBJECT_SIZE);

        if let Some(address) = self.generations[generation].free_list.alloc_exact(size) {
            return Some(address);
        }

        let region = self.bump(generation, size, size)?;
        debug_assert_eq!(region.size(), size);
        Some(region.start)
    }

    /// Memory for an allocation context: at least `min` bytes, at most
    /// `preferred` bytes.
    pub fn allocate_context_area(&mut self, min: usize, preferred: usize) -> Option<Region> {
        debug_assert!(min <= preferred);
        let generation = &mut self.generations[0];

        if let Some(region) = generation.free_list.alloc(min) {
            if region.size() > preferred {
                let end = region.start.offset(preferred);
                generation.free_list.add(end, region.end);
                return Some(Region::new(region.start, end));
            }

            return Some(region);
        }

        self.bump(0, min, preferred)
    }

    fn bump(&mut self, generation: usize, min: usize, preferred: usize) -> Option<Region> {
        if let Some(idx) = self.generations[generation].alloc_page {
            let end = self.page_region(idx).end;
            let top = self.pages[idx].top;
            let available = end.offset_from(top);

            if available >= min {
                let size = preferred.min(available);
                self.pages[idx].top = top.offset(size);
                return Some(top.region_start(size));
            }

            self.retire_alloc_page(generation);
        }

        let idx = self.acquire_page(generation)?;
        self.generations[generation].alloc_page = Some(idx);

        let start = self.page_start(idx);
        let size = preferred.min(PAGE_SIZE);
        self.pages[idx].top = start.offset(size);
        Some(start.region_start(size))
    }

    fn retire_alloc_page(&mut self, generation: usize) {
        if let Some(idx) = self.generations[generation].alloc_page.take() {
            let end = self.page_region(idx).end;
            let top = self.pages[idx].top;
            self.pages[idx].top = end;
            self.generations[generation].free_list.add(top, end);
        }
    }

    /// Forgets free lists and the bump page of a generation, the unused
    /// memory stays covered by fillers.
    pub fn reset_allocation(&mut self, generation: usize) {
        self.retire_alloc_page(generation);
        self.generations[generation].free_list.clear();
    }

    pub fn alloc_large(&mut self, size: usize, generation: usize) -> Option<Address> {
        let pages = size.div_ceil(PAGE_SIZE);
        let first = self.find_free_run(pages)?;

        for idx in first..first + pages {
            self.free_pages.set(idx, false);
            self.pages[idx] = PageInfo {
                kind: if idx == first {
                    PageKind::LargeStart { pages }
                } else {
                    PageKind::LargeContinuation { start: first }
                },
                generation,
                top: self.page_start(first).offset(size),
                live_bytes: 0,
                pinned: false,
            };
            self.page_map.set_generation(idx, Some(generation));
        }

        Some(self.page_start(first))
    }

    pub fn free_large(&mut self, first: usize) {
        let pages = match self.pages[first].kind {
            PageKind::LargeStart { pages } => pages,
            kind => panic!("page {} does not start a large object ({:?})", first, kind),
        };

        os::discard(self.page_start(first), pages * PAGE_SIZE);

        for idx in first..first + pages {
            self.pages[idx] = PageInfo::free();
            self.free_pages.insert(idx);
            self.page_map.set_generation(idx, None);
        }
    }

    fn find_free_run(&self, pages: usize) -> Option<usize> {
        let mut run_start = 0;
        let mut run_length = 0;

        for idx in self.free_pages.ones() {
            if run_length > 0 && idx == run_start + run_length {
                run_length += 1;
            } else {
                run_start = idx;
                run_length = 1;
            }

            if run_length == pages {
                return Some(run_start);
            }
        }

        None
    }

    /// visits every object and filler of a small page in address order
    pub fn walk_page<F>(&self, idx: usize, mut f: F)
    where
        F: FnMut(&'static Obj),
    {
        let info = &self.pages[idx];
        debug_assert!(info.is_small());

        let mut scan = self.page_start(idx);
        let end = info.top;

        while scan < end {
            let object = scan.to_obj();
            f(object);
            scan = scan.offset(object.size());
        }

        assert_eq!(scan, end, "page {} is not iterable", idx);
    }

    /// Start of the object containing `addr`, None for free memory,
    /// fillers and addresses outside the heap.
    pub fn object_containing(&self, addr: Address) -> Option<Address> {
        if !self.page_map.contains(addr) {
            return None;
        }

        let idx = self.page_index(addr);

        match self.pages[idx].kind {
            PageKind::Free => None,

            PageKind::LargeStart { .. } | PageKind::LargeContinuation { .. } => {
                let first = match self.pages[idx].kind {
                    PageKind::LargeContinuation { start } => start,
                    _ => idx,
                };
                let object = self.page_start(first);
                (addr < self.pages[first].top).then_some(object)
            }

            PageKind::Small => {
                if addr >= self.pages[idx].top {
                    return None;
                }

                let mut scan = self.page_start(idx);

                loop {
                    let object = scan.to_obj();
                    let next = scan.offset(object.size());

                    if addr < next {
                        return (!object.is_filler()).then_some(scan);
                    }

                    scan = next;
                }
            }
        }
    }

    pub fn is_object_start(&self, addr: Address) -> bool {
        mem::is_aligned(addr.to_usize(), mem::WORD) && self.object_containing(addr) == Some(addr)
    }

    /// bytes in use by the generation, fillers on its pages included
    pub fn used_bytes(&self, generation: usize) -> usize {
        let mut used = 0;

        for (idx, page) in self.pages.iter().enumerate() {
            if page.generation != generation {
                continue;
            }

            match page.kind {
                PageKind::Small => used += page.top.offset_from(self.page_start(idx)),
                PageKind::LargeStart { .. } => used += page.top.offset_from(self.page_start(idx)),
                _ => {}
            }
        }

        used.saturating_sub(self.generations[generation].free_list.total())
    }

    pub fn page_count_of(&self, generation: usize) -> usize {
        self.pages
            .iter()
            .filter(|page| page.kind != PageKind::Free && page.generation == generation)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{initialize_object, TypeDescriptor, TypeRef};

    #[test]
    fn test_page_map() {
        let mut heap = Heap::new(16 * PAGE_SIZE).expect("reservation failed");
        assert_eq!(16, heap.page_count());
        assert_eq!(16, heap.free_page_count());

        let idx = heap.acquire_page(1).expect("no page");
        let start = heap.page_start(idx);
        assert_eq!(Some(1), heap.page_map().generation_of(start.offset(100)));
        assert!(heap.page_map().is_condemned(start, 1));
        assert!(!heap.page_map().is_condemned(start, 0));

        heap.set_generation(idx, 2);
        assert_eq!(Some(2), heap.page_map().generation_of(start));

        heap.release_page(idx);
        assert_eq!(None, heap.page_map().generation_of(start));
        assert_eq!(None, heap.page_map().generation_of(Address::from(8)));
    }

    #[test]
    fn test_allocate_and_walk() {
        let mut heap = Heap::new(16 * PAGE_SIZE).expect("reservation failed");
        let ty = TypeRef::register(TypeDescriptor::fixed("Node", 2, &[0]));
        let size = ty.object_size(0);

        let mut objects = Vec::new();
        for _ in 0..10 {
            let address = heap.allocate(1, size).expect("out of memory");
            unsafe { initialize_object(address, ty, 0, size) };
            objects.push(address);
        }

        let idx = heap.page_index(objects[0]);
        let mut walked = Vec::new();
        heap.walk_page(idx, |obj| walked.push(obj.address()));
        assert_eq!(objects, walked);

        assert_eq!(Some(objects[3]), heap.object_containing(objects[3].offset(8)));
        assert!(heap.is_object_start(objects[3]));
        assert!(!heap.is_object_start(objects[3].offset(8)));
        assert_eq!(10 * size, heap.used_bytes(1));
    }

    #[test]
    fn test_context_area() {
        let mut heap = Heap::new(16 * PAGE_SIZE).expect("reservation failed");
        let first = heap.allocate_context_area(64, 4 * K).expect("no memory");
        let second = heap.allocate_context_area(64, 4 * K).expect("no memory");
        assert_eq!(4 * K, first.size());
        assert!(first.disjunct(&second));
    }

    #[test]
    fn test_large_objects() {
        let mut heap = Heap::new(16 * PAGE_SIZE).expect("reservation failed");
        let size = 2 * PAGE_SIZE + 128;
        let address = heap
            .alloc_large(size, MAX_GENERATION)
            .expect("no pages");
        let first = heap.page_index(address);

        assert_eq!(13, heap.free_page_count());
        assert_eq!(
            Some(address),
            heap.object_containing(address.offset(PAGE_SIZE + 8))
        );
        assert_eq!(vec![first], heap.large_objects(MAX_GENERATION));

        heap.free_large(first);
        assert_eq!(16, heap.free_page_count());
        assert!(heap.alloc_large(17 * PAGE_SIZE, MAX_GENERATION).is_none());
    }
}
