use std::fmt;

use crate::gc::hash_table::HashTable;
use crate::gc::{Address, Region};

/// Origin of a pin, kept for statistics only.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PinType {
    Stack,
    StaticData,
    Other,
}

impl PinType {
    pub const COUNT: usize = 3;

    pub fn index(self) -> usize {
        match self {
            PinType::Stack => 0,
            PinType::StaticData => 1,
            PinType::Other => 2,
        }
    }

    fn name(self) -> &'static str {
        match self {
            PinType::Stack => "stack",
            PinType::StaticData => "static",
            PinType::Other => "other",
        }
    }
}

impl fmt::Display for PinType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Clone, Default, Debug)]
pub struct PinStats {
    pub staged: [usize; PinType::COUNT],
    pub pinned_objects: usize,
    pub pinned_bytes: usize,
    pub overflows: usize,
}

impl PinStats {
    pub fn add(&mut self, other: &PinStats) {
        for idx in 0..PinType::COUNT {
            self.staged[idx] += other.staged[idx];
        }
        self.pinned_objects += other.pinned_objects;
        self.pinned_bytes += other.pinned_bytes;
        self.overflows += other.overflows;
    }
}

/// Addresses that must not move during the current cycle.
///
/// Entries are staged unsorted and may repeat; `optimize_queue` turns the
/// queue into a sorted set so lookups can binary search. Staging past
/// `capacity` flags the queue as overflowed: the address is only counted,
/// and from then on every address counts as pinned.
pub struct PinQueue {
    entries: Vec<Address>,
    capacity: usize,
    overflowed: bool,
    stats: PinStats,
}

impl PinQueue {
    pub fn new(capacity: usize) -> PinQueue {
        PinQueue {
            entries: Vec::with_capacity(capacity.min(4096)),
            capacity,
            overflowed: false,
            stats: PinStats::default(),
        }
    }

    /// Returns false if the queue is full and `address` was not recorded.
    pub fn stage_pointer(&mut self, address: Address, ty: PinType) -> bool {
        self.stats.staged[ty.index()] += 1;

        if self.entries.len() >= self.capacity && !self.overflowed {
            log::debug!(
                "pin queue overflow at {} entries, disabling compaction",
                self.capacity
            );
            self.overflowed = true;
            self.stats.overflows += 1;
        }

        if self.overflowed {
            return false;
        }

        self.entries.push(address);
        true
    }

    /// Sorts and deduplicates the entries from `start_slot` on and merges
    /// them into the already optimized prefix.
    pub fn optimize_queue(&mut self, start_slot: usize) {
        let start_slot = start_slot.min(self.entries.len());
        let suffix = &mut self.entries[start_slot..];
        suffix.sort_unstable();

        if start_slot == 0 {
            self.entries.dedup();
            return;
        }

        debug_assert!(self.entries[..start_slot].windows(2).all(|w| w[0] < w[1]));

        let tail = self.entries.split_off(start_slot);
        let head = std::mem::take(&mut self.entries);
        let mut merged = Vec::with_capacity(head.len() + tail.len());
        let (mut i, mut j) = (0, 0);

        while i < head.len() || j < tail.len() {
            let next = if j >= tail.len() || (i < head.len() && head[i] <= tail[j]) {
                i += 1;
                head[i - 1]
            } else {
                j += 1;
                tail[j - 1]
            };

            if merged.last() != Some(&next) {
                merged.push(next);
            }
        }

        self.entries = merged;
    }

    /// Only valid after `optimize_queue`.
    pub fn is_pinned(&self, address: Address) -> bool {
        self.overflowed || self.entries.binary_search(&address).is_ok()
    }

    /// sorted entries that fall into `region`
    pub fn entries_in(&self, region: Region) -> &[Address] {
        let start = self.entries.partition_point(|&a| a < region.start);
        let end = self.entries.partition_point(|&a| a < region.end);
        &self.entries[start..end]
    }

    pub fn entries(&self) -> &[Address] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn record_pinned_object(&mut self, size: usize) {
        self.stats.pinned_objects += 1;
        self.stats.pinned_bytes += size;
    }

    pub fn stats(&self) -> &PinStats {
        &self.stats
    }

    /// drops all entries and returns the statistics of the cycle
    pub fn finish_cycle(&mut self) -> PinStats {
        self.entries.clear();
        self.overflowed = false;
        std::mem::take(&mut self.stats)
    }
}

/// Pins that outlive a cycle. An object that keeps getting pinned while
/// referenced from an older generation is cemented after `threshold`
/// registrations and stays pinned until the next full collection.
pub struct CementTable {
    counts: HashTable<Address, usize>,
    threshold: usize,
    enabled: bool,
}

impl CementTable {
    pub fn new(enabled: bool, threshold: usize) -> CementTable {
        CementTable {
            counts: HashTable::new(),
            threshold: threshold.max(1),
            enabled,
        }
    }

    /// Registers another hit for `address`. Returns true once the object
    /// is cemented.
    pub fn cement(&mut self, address: Address) -> bool {
        if !self.enabled {
            return false;
        }

        if let Some(count) = self.counts.lookup_mut(address) {
            if *count < self.threshold {
                *count += 1;
            }
            return *count >= self.threshold;
        }

        self.counts.insert_or_replace(address, 1);
        self.threshold == 1
    }

    pub fn cement_lookup(&self, address: Address) -> bool {
        self.enabled
            && self
                .counts
                .lookup(address)
                .is_some_and(|&count| count >= self.threshold)
    }

    /// Stages every cemented object. Returns the ones that did not fit
    /// into the queue.
    pub fn stage_cemented(&self, pins: &mut PinQueue) -> Vec<Address> {
        let mut dropped = Vec::new();

        for (address, &count) in self.counts.iter() {
            if count >= self.threshold && !pins.stage_pointer(address, PinType::Other) {
                dropped.push(address);
            }
        }

        dropped
    }

    pub fn cemented(&self) -> usize {
        self.counts
            .iter()
            .filter(|(_, count)| **count >= self.threshold)
            .count()
    }

    /// after a minor collection, forget objects that did not make it
    pub fn clear_below_threshold(&mut self) {
        let threshold = self.threshold;
        self.counts.retain(|_, count| *count >= threshold);
    }

    /// after a full collection every object starts over
    pub fn reset(&mut self) {
        self.counts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_and_optimize() {
        let mut pins = PinQueue::new(16);
        pins.stage_pointer(0x1000.into(), PinType::Stack);
        pins.stage_pointer(0x2000.into(), PinType::Stack);
        pins.stage_pointer(0x1000.into(), PinType::Stack);
        assert_eq!(3, pins.len());

        pins.optimize_queue(0);
        assert_eq!(2, pins.len());
        assert!(pins.is_pinned(0x1000.into()));
        assert!(pins.is_pinned(0x2000.into()));
        assert!(!pins.is_pinned(0x3000.into()));
        assert_eq!(3, pins.stats().staged[PinType::Stack.index()]);
    }

    #[test]
    fn test_optimize_suffix_merges() {
        let mut pins = PinQueue::new(16);
        for addr in [0x40, 0x10, 0x30] {
            pins.stage_pointer(Address::from(addr), PinType::Stack);
        }
        pins.optimize_queue(0);

        for addr in [0x20, 0x30, 0x50, 0x20] {
            pins.stage_pointer(Address::from(addr), PinType::StaticData);
        }
        pins.optimize_queue(3);

        let expected: Vec<Address> = [0x10, 0x20, 0x30, 0x40, 0x50]
            .iter()
            .map(|&a| Address::from(a))
            .collect();
        assert_eq!(&expected[..], pins.entries());
    }

    #[test]
    fn test_entries_in_region() {
        let mut pins = PinQueue::new(16);
        for addr in [0x100, 0x180, 0x200, 0x280] {
            pins.stage_pointer(Address::from(addr), PinType::Other);
        }
        pins.optimize_queue(0);

        let region = Region::new(0x180.into(), 0x280.into());
        assert_eq!(2, pins.entries_in(region).len());
    }

    #[test]
    fn test_overflow_pins_everything() {
        let mut pins = PinQueue::new(2);
        pins.stage_pointer(0x10.into(), PinType::Stack);
        pins.stage_pointer(0x20.into(), PinType::Stack);
        assert!(!pins.overflowed());

        assert!(!pins.stage_pointer(0x30.into(), PinType::Stack));
        assert!(pins.overflowed());
        assert!(!pins.stage_pointer(0x40.into(), PinType::StaticData));
        pins.optimize_queue(0);
        assert!(pins.is_pinned(0x9990.into()));
        assert_eq!(2, pins.len());

        let stats = pins.finish_cycle();
        assert_eq!(1, stats.overflows);
        assert_eq!(3, stats.staged[PinType::Stack.index()]);
        assert_eq!(1, stats.staged[PinType::StaticData.index()]);
        assert!(!pins.overflowed());
        assert!(pins.is_empty());
    }

    #[test]
    fn test_cementing() {
        let mut cement = CementTable::new(true, 3);
        let addr = Address::from(0x1000);

        assert!(!cement.cement(addr));
        assert!(!cement.cement(addr));
        assert!(!cement.cement_lookup(addr));
        assert!(cement.cement(addr));
        assert!(cement.cement_lookup(addr));

        let other = Address::from(0x2000);
        cement.cement(other);
        cement.clear_below_threshold();
        assert!(cement.cement_lookup(addr));
        assert!(!cement.cement_lookup(other));

        let mut pins = PinQueue::new(8);
        assert!(cement.stage_cemented(&mut pins).is_empty());
        assert_eq!(1, pins.len());
        pins.optimize_queue(0);
        assert!(pins.is_pinned(addr));

        let mut full = PinQueue::new(0);
        assert_eq!(vec![addr], cement.stage_cemented(&mut full));

        cement.reset();
        assert!(!cement.cement_lookup(addr));
        assert_eq!(0, cement.cemented());
    }

    #[test]
    fn test_cementing_disabled() {
        let mut cement = CementTable::new(false, 1);
        assert!(!cement.cement(0x10.into()));
        assert!(!cement.cement_lookup(0x10.into()));
    }
}
