use parking_lot::Mutex;

use crate::gc::hash_table::{ArenaExhausted, HashTable};
use crate::gc::worklist::{Worklist, WorklistSegment};
use crate::gc::Address;

/// Thread-local buffer of objects the write barrier found holding a
/// reference into a younger generation.
pub struct RemsetBuffer {
    segment: WorklistSegment,
}

impl RemsetBuffer {
    pub fn new() -> RemsetBuffer {
        RemsetBuffer {
            segment: WorklistSegment::new(),
        }
    }

    /// Records `holder`. When the buffer runs full its segment is handed
    /// back so the caller can publish it.
    pub fn push(&mut self, holder: Address) -> Option<WorklistSegment> {
        if self.segment.push(holder) {
            return None;
        }

        let full = std::mem::replace(&mut self.segment, WorklistSegment::new());
        let pushed = self.segment.push(holder);
        debug_assert!(pushed);
        Some(full)
    }

    pub fn take(&mut self) -> WorklistSegment {
        std::mem::replace(&mut self.segment, WorklistSegment::new())
    }

    pub fn len(&self) -> usize {
        self.segment.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segment.is_empty()
    }
}

impl Default for RemsetBuffer {
    fn default() -> RemsetBuffer {
        RemsetBuffer::new()
    }
}

/// Full buffers published by mutators, merged at the start of a collection.
pub struct PendingRemset {
    segments: Mutex<Worklist>,
}

impl PendingRemset {
    pub fn new() -> PendingRemset {
        PendingRemset {
            segments: Mutex::new(Worklist::new()),
        }
    }

    pub fn publish(&self, segment: WorklistSegment) {
        self.segments.lock().push_segment(segment);
    }

    pub fn take(&self) -> Worklist {
        std::mem::take(&mut *self.segments.lock())
    }
}

impl Default for PendingRemset {
    fn default() -> PendingRemset {
        PendingRemset::new()
    }
}

/// Objects in older generations that reference younger ones, keyed by
/// object address. The value is the youngest generation referenced, so a
/// minor collection can skip holders that only point into generations it
/// does not condemn.
pub struct RememberedSet {
    table: HashTable<Address, u8>,
}

impl RememberedSet {
    pub fn new() -> RememberedSet {
        RememberedSet {
            table: HashTable::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.table.num_entries()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn contains(&self, holder: Address) -> bool {
        self.table.contains_key(holder)
    }

    pub fn youngest(&self, holder: Address) -> Option<usize> {
        self.table.lookup(holder).map(|&g| g as usize)
    }

    pub fn record(&mut self, holder: Address, youngest: usize) -> Result<(), ArenaExhausted> {
        self.table.try_insert_or_replace(holder, youngest as u8)?;
        Ok(())
    }

    /// Folds buffered holders into the set. Their youngest target is not
    /// known yet and assumed to be the nursery.
    pub fn merge(&mut self, buffers: &mut Worklist) -> Result<usize, ArenaExhausted> {
        let mut merged = 0;

        while let Some(mut segment) = buffers.pop_segment() {
            merged += self.merge_segment(&mut segment)?;
        }

        Ok(merged)
    }

    fn merge_segment(&mut self, segment: &mut WorklistSegment) -> Result<usize, ArenaExhausted> {
        let mut merged = 0;

        while let Some(holder) = segment.pop() {
            self.table.try_insert_or_replace(holder, 0)?;
            merged += 1;
        }

        Ok(merged)
    }

    /// holders whose youngest target is at most `generation`
    pub fn holders(&self, generation: usize) -> Vec<Address> {
        self.table
            .iter()
            .filter(|(_, youngest)| **youngest as usize <= generation)
            .map(|(holder, _)| holder)
            .collect()
    }

    /// Visits every entry. The closure returns the new youngest
    /// generation, or None to drop the entry.
    pub fn update<F>(&mut self, mut f: F)
    where
        F: FnMut(Address, usize) -> Option<usize>,
    {
        let mut cursor = self.table.cursor();

        while let Some(holder) = cursor.advance() {
            match f(holder, *cursor.value() as usize) {
                Some(youngest) => *cursor.value_mut() = youngest as u8,
                None => {
                    cursor.remove_current();
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.table.clear();
    }
}

impl Default for RememberedSet {
    fn default() -> RememberedSet {
        RememberedSet::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::worklist::SEGMENT_ENTRY_CAPACITY;

    #[test]
    fn test_buffer_flushes_full_segments() {
        let pending = PendingRemset::new();
        let mut buffer = RemsetBuffer::new();

        for idx in 0..SEGMENT_ENTRY_CAPACITY + 3 {
            if let Some(full) = buffer.push(Address::from((idx + 1) * 16)) {
                pending.publish(full);
            }
        }

        assert_eq!(3, buffer.len());

        let mut remset = RememberedSet::new();
        let mut segments = pending.take();
        assert_eq!(1, segments.segments());
        assert_eq!(Ok(SEGMENT_ENTRY_CAPACITY), remset.merge(&mut segments));
        assert_eq!(Ok(3), remset.merge_segment(&mut buffer.take()));
        assert_eq!(SEGMENT_ENTRY_CAPACITY + 3, remset.len());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_update_and_filter() {
        let mut remset = RememberedSet::new();
        for idx in 1..=10 {
            remset
                .record(Address::from(idx * 16), idx % 2)
                .expect("arena exhausted");
        }

        assert_eq!(5, remset.holders(0).len());
        assert_eq!(10, remset.holders(1).len());

        remset.update(|holder, youngest| {
            if holder.to_usize() <= 5 * 16 {
                None
            } else {
                Some(youngest + 1)
            }
        });

        assert_eq!(5, remset.len());
        assert_eq!(Some(2), remset.youngest(Address::from(7 * 16)));
        assert!(!remset.contains(Address::from(16)));
    }

    #[test]
    fn test_duplicate_holders_merge_once() {
        let mut remset = RememberedSet::new();
        let mut segment = WorklistSegment::new();
        segment.push(Address::from(32));
        segment.push(Address::from(32));
        assert_eq!(Ok(2), remset.merge_segment(&mut segment));
        assert_eq!(1, remset.len());
    }
}
