use crate::gc::{Address, Region};
use crate::mem;
use crate::object::{fill_region, MIN_OBJECT_SIZE};

// smallest range worth keeping, anything below stays a filler
pub const MIN_FREE_SIZE: usize = 4 * mem::WORD;

const SIZE_CLASSES: usize = 12;

/// Segregated free list of unused ranges inside pages. Every range stays
/// covered by a free object so that pages remain iterable.
pub struct FreeList {
    classes: Vec<Vec<Region>>,
    total: usize,
}

impl FreeList {
    pub fn new() -> FreeList {
        FreeList {
            classes: (0..SIZE_CLASSES).map(|_| Vec::new()).collect(),
            total: 0,
        }
    }

    pub fn add(&mut self, start: Address, end: Address) {
        if start == end {
            return;
        }

        fill_region(start, end);
        let size = end.offset_from(start);

        if size < MIN_FREE_SIZE {
            return;
        }

        self.classes[size_class(size)].push(Region::new(start, end));
        self.total += size;
    }

    /// Takes a range of at least `size` bytes. The range keeps its filler
    /// until the caller overwrites it.
    pub fn alloc(&mut self, size: usize) -> Option<Region> {
        let first = size_class(size);

        // the own class holds ranges of mixed size, later classes always fit
        if let Some(pos) = self.classes[first].iter().position(|r| r.size() >= size) {
            let region = self.classes[first].swap_remove(pos);
            self.total -= region.size();
            return Some(region);
        }

        for class in first + 1..SIZE_CLASSES {
            if let Some(region) = self.classes[class].pop() {
                self.total -= region.size();
                return Some(region);
            }
        }

        None
    }

    /// Allocates exactly `size` bytes and returns the remainder of the
    /// range to the list.
    pub fn alloc_exact(&mut self, size: usize) -> Option<Address> {
        debug_assert!(size >= MIN_OBJECT_SIZE);
        let region = self.alloc(size)?;
        let object = region.start;
        self.add(object.offset(size), region.end);
        Some(object)
    }

    /// ranges overlapping `region`, used when a page gets released
    pub fn remove_within(&mut self, region: Region) {
        for class in &mut self.classes {
            class.retain(|free| {
                let keep = !region.fully_contains(free);
                if !keep {
                    self.total -= free.size();
                }
                keep
            });
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn clear(&mut self) {
        for class in &mut self.classes {
            class.clear();
        }
        self.total = 0;
    }
}

impl Default for FreeList {
    fn default() -> FreeList {
        FreeList::new()
    }
}

fn size_class(size: usize) -> usize {
    let words = size / mem::WORD;
    let class = (usize::BITS - words.leading_zeros()) as usize;
    // MIN_FREE_SIZE has four words, which lands in class 3
    class.saturating_sub(3).min(SIZE_CLASSES - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory(words: usize) -> (Vec<usize>, Address) {
        let mut memory = vec![0usize; words];
        let start = Address::from_ptr(memory.as_mut_ptr());
        (memory, start)
    }

    #[test]
    fn test_size_classes() {
        assert_eq!(0, size_class(MIN_FREE_SIZE));
        assert_eq!(0, size_class(7 * mem::WORD));
        assert_eq!(1, size_class(8 * mem::WORD));
        assert_eq!(SIZE_CLASSES - 1, size_class(usize::MAX / 2));
    }

    #[test]
    fn test_alloc_and_split() {
        let (_memory, start) = memory(64);
        let mut free_list = FreeList::new();
        free_list.add(start, start.add_ptr(64));
        assert_eq!(64 * mem::WORD, free_list.total());

        let object = free_list.alloc_exact(4 * mem::WORD).expect("no memory");
        assert_eq!(start, object);
        assert_eq!(60 * mem::WORD, free_list.total());

        let second = free_list.alloc_exact(60 * mem::WORD).expect("no memory");
        assert_eq!(start.add_ptr(4), second);
        assert!(free_list.is_empty());
        assert!(free_list.alloc(MIN_FREE_SIZE).is_none());
    }

    #[test]
    fn test_small_ranges_become_fillers() {
        let (_memory, start) = memory(8);
        let mut free_list = FreeList::new();
        free_list.add(start, start.add_ptr(2));
        assert!(free_list.is_empty());
        assert!(start.to_obj().is_filler());
        assert_eq!(2 * mem::WORD, start.to_obj().size());
    }

    #[test]
    fn test_remove_within() {
        let (_memory, start) = memory(64);
        let mut free_list = FreeList::new();
        free_list.add(start, start.add_ptr(16));
        free_list.add(start.add_ptr(32), start.add_ptr(64));

        free_list.remove_within(Region::new(start, start.add_ptr(32)));
        assert_eq!(32 * mem::WORD, free_list.total());
    }
}
