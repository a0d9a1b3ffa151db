use crate::error::{fatal_error, FatalError};
use crate::gc::Address;

const NIL: u32 = u32::MAX;

/// Maximum average chain length before the bucket array grows.
pub const MAX_LOAD_FACTOR: usize = 2;

/// Bucket counts, each roughly 1.5x the previous one.
const PRIMES: [usize; 34] = [
    11, 19, 37, 73, 109, 163, 251, 367, 557, 823, 1237, 1861, 2777, 4177, 6247, 9371, 14057,
    21089, 31627, 47431, 71143, 106721, 160073, 240101, 360163, 540217, 810343, 1215497, 1823231,
    2734867, 4102283, 6153409, 9230113, 13845163,
];

const MAX_ENTRIES: usize = PRIMES[PRIMES.len() - 1] * MAX_LOAD_FACTOR;

pub trait HashKey: Copy + Eq {
    fn hash_key(&self) -> usize;
}

impl HashKey for Address {
    fn hash_key(&self) -> usize {
        // objects are word aligned, low bits carry no information
        self.to_usize() >> 3
    }
}

impl HashKey for usize {
    fn hash_key(&self) -> usize {
        *self
    }
}

impl HashKey for u32 {
    fn hash_key(&self) -> usize {
        *self as usize
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ArenaExhausted;

struct Entry<K, V> {
    next: u32,
    key: K,
    value: V,
}

/// Open-chaining hash table. Entries live in an arena and are linked by
/// index. Not thread-safe, owners serialize access.
pub struct HashTable<K, V> {
    buckets: Vec<u32>,
    arena: Vec<Option<Entry<K, V>>>,
    free: Vec<u32>,
    arena_limit: usize,
    num_entries: usize,
}

impl<K: HashKey, V> HashTable<K, V> {
    pub fn new() -> HashTable<K, V> {
        HashTable::with_size(PRIMES[0])
    }

    /// table with at least `initial` buckets
    pub fn with_size(initial: usize) -> HashTable<K, V> {
        HashTable::with_arena_limit(initial, MAX_ENTRIES)
    }

    /// table whose arena never holds more than `arena_limit` entries
    pub fn with_arena_limit(initial: usize, arena_limit: usize) -> HashTable<K, V> {
        let size = next_prime(initial);

        HashTable {
            buckets: vec![NIL; size],
            arena: Vec::new(),
            free: Vec::new(),
            arena_limit: arena_limit.min(MAX_ENTRIES),
            num_entries: 0,
        }
    }

    /// number of buckets
    pub fn size(&self) -> usize {
        self.buckets.len()
    }

    pub fn num_entries(&self) -> usize {
        self.num_entries
    }

    pub fn is_empty(&self) -> bool {
        self.num_entries == 0
    }

    pub fn lookup(&self, key: K) -> Option<&V> {
        let idx = self.find(key)?;
        Some(&self.entry(idx).value)
    }

    pub fn lookup_mut(&mut self, key: K) -> Option<&mut V> {
        let idx = self.find(key)?;
        Some(&mut self.entry_mut(idx).value)
    }

    pub fn contains_key(&self, key: K) -> bool {
        self.find(key).is_some()
    }

    /// Inserts or replaces the value for `key` and returns the old value.
    /// Running out of arena space terminates the process.
    pub fn insert_or_replace(&mut self, key: K, value: V) -> Option<V> {
        match self.try_insert_or_replace(key, value) {
            Ok(old) => old,
            Err(ArenaExhausted) => fatal_error(FatalError::HashArenaExhausted),
        }
    }

    pub fn try_insert_or_replace(&mut self, key: K, value: V) -> Result<Option<V>, ArenaExhausted> {
        if let Some(idx) = self.find(key) {
            let old = std::mem::replace(&mut self.entry_mut(idx).value, value);
            return Ok(Some(old));
        }

        if self.num_entries + 1 > self.buckets.len() * MAX_LOAD_FACTOR {
            self.grow();
        }

        let bucket = self.bucket_of(key);
        let entry = Entry {
            next: self.buckets[bucket],
            key,
            value,
        };

        let idx = self.alloc_entry(entry)?;
        self.buckets[bucket] = idx;
        self.num_entries += 1;

        Ok(None)
    }

    /// true if the key was present
    pub fn remove(&mut self, key: K) -> bool {
        self.take(key).is_some()
    }

    pub fn take(&mut self, key: K) -> Option<V> {
        let bucket = self.bucket_of(key);
        let mut prev = NIL;
        let mut current = self.buckets[bucket];

        while current != NIL {
            let entry = self.entry(current);
            let next = entry.next;

            if entry.key == key {
                self.unlink(bucket, prev, next);
                return Some(self.free_entry(current));
            }

            prev = current;
            current = next;
        }

        None
    }

    pub fn clear(&mut self) {
        self.buckets.iter_mut().for_each(|head| *head = NIL);
        self.arena.clear();
        self.free.clear();
        self.num_entries = 0;
    }

    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(K, &V),
    {
        for (key, value) in self.iter() {
            f(key, value);
        }
    }

    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            table: self,
            bucket: 0,
            current: self.buckets[0],
        }
    }

    /// Cursor that visits every entry once and may remove the entry it
    /// currently points at.
    pub fn cursor(&mut self) -> Cursor<'_, K, V> {
        let next = self.buckets[0];

        Cursor {
            table: self,
            bucket: 0,
            prev: NIL,
            current: NIL,
            next,
        }
    }

    pub fn retain<F>(&mut self, mut f: F)
    where
        F: FnMut(K, &mut V) -> bool,
    {
        let mut cursor = self.cursor();

        while let Some(key) = cursor.advance() {
            if !f(key, cursor.value_mut()) {
                cursor.remove_current();
            }
        }
    }

    fn find(&self, key: K) -> Option<u32> {
        let mut current = self.buckets[self.bucket_of(key)];

        while current != NIL {
            let entry = self.entry(current);

            if entry.key == key {
                return Some(current);
            }

            current = entry.next;
        }

        None
    }

    fn bucket_of(&self, key: K) -> usize {
        key.hash_key() % self.buckets.len()
    }

    fn grow(&mut self) {
        let needed = (self.num_entries + 1).div_ceil(MAX_LOAD_FACTOR);
        let new_size = next_prime(needed.max(self.buckets.len() + 1));

        if new_size <= self.buckets.len() {
            return;
        }

        let old_buckets = std::mem::replace(&mut self.buckets, vec![NIL; new_size]);

        for mut current in old_buckets {
            while current != NIL {
                let bucket = self.bucket_of(self.entry(current).key);
                let next = self.entry(current).next;

                self.entry_mut(current).next = self.buckets[bucket];
                self.buckets[bucket] = current;

                current = next;
            }
        }
    }

    fn unlink(&mut self, bucket: usize, prev: u32, next: u32) {
        if prev == NIL {
            self.buckets[bucket] = next;
        } else {
            self.entry_mut(prev).next = next;
        }
    }

    fn alloc_entry(&mut self, entry: Entry<K, V>) -> Result<u32, ArenaExhausted> {
        if let Some(idx) = self.free.pop() {
            self.arena[idx as usize] = Some(entry);
            return Ok(idx);
        }

        if self.arena.len() >= self.arena_limit {
            return Err(ArenaExhausted);
        }

        let idx = self.arena.len() as u32;
        self.arena.push(Some(entry));
        Ok(idx)
    }

    fn free_entry(&mut self, idx: u32) -> V {
        let entry = self.arena[idx as usize]
            .take()
            .unwrap_or_else(|| panic!("entry {} freed twice", idx));
        self.free.push(idx);
        self.num_entries -= 1;
        entry.value
    }

    fn entry(&self, idx: u32) -> &Entry<K, V> {
        match &self.arena[idx as usize] {
            Some(entry) => entry,
            None => panic!("dangling entry {}", idx),
        }
    }

    fn entry_mut(&mut self, idx: u32) -> &mut Entry<K, V> {
        match &mut self.arena[idx as usize] {
            Some(entry) => entry,
            None => panic!("dangling entry {}", idx),
        }
    }
}

impl<K: HashKey, V> Default for HashTable<K, V> {
    fn default() -> HashTable<K, V> {
        HashTable::new()
    }
}

fn next_prime(size: usize) -> usize {
    PRIMES
        .iter()
        .copied()
        .find(|&prime| prime >= size)
        .unwrap_or(PRIMES[PRIMES.len() - 1])
}

pub struct Iter<'a, K, V> {
    table: &'a HashTable<K, V>,
    bucket: usize,
    current: u32,
}

impl<'a, K: HashKey, V> Iterator for Iter<'a, K, V> {
    type Item = (K, &'a V);

    fn next(&mut self) -> Option<(K, &'a V)> {
        while self.current == NIL {
            self.bucket += 1;

            if self.bucket >= self.table.buckets.len() {
                return None;
            }

            self.current = self.table.buckets[self.bucket];
        }

        let table: &'a HashTable<K, V> = self.table;
        let entry = table.entry(self.current);
        self.current = entry.next;
        Some((entry.key, &entry.value))
    }
}

pub struct Cursor<'a, K, V> {
    table: &'a mut HashTable<K, V>,
    bucket: usize,
    prev: u32,
    current: u32,
    next: u32,
}

impl<K: HashKey, V> Cursor<'_, K, V> {
    /// Moves to the next entry and returns its key. The successor is
    /// linked before the entry is handed out, so removing it is safe.
    pub fn advance(&mut self) -> Option<K> {
        if self.current != NIL {
            self.prev = self.current;
        }

        self.current = NIL;
        let mut candidate = self.next;

        while candidate == NIL {
            if self.bucket + 1 >= self.table.buckets.len() {
                return None;
            }

            self.bucket += 1;
            self.prev = NIL;
            candidate = self.table.buckets[self.bucket];
        }

        let entry = self.table.entry(candidate);
        self.current = candidate;
        self.next = entry.next;
        Some(entry.key)
    }

    pub fn key(&self) -> K {
        self.table.entry(self.current_idx()).key
    }

    pub fn value(&self) -> &V {
        &self.table.entry(self.current_idx()).value
    }

    pub fn value_mut(&mut self) -> &mut V {
        let idx = self.current_idx();
        &mut self.table.entry_mut(idx).value
    }

    pub fn remove_current(&mut self) -> V {
        let idx = self.current_idx();
        self.table.unlink(self.bucket, self.prev, self.next);
        self.current = NIL;
        self.table.free_entry(idx)
    }

    fn current_idx(&self) -> u32 {
        assert!(self.current != NIL, "cursor is not positioned on an entry");
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_insert_remove() {
        let mut table: HashTable<usize, &'static str> = HashTable::with_size(11);
        assert_eq!(11, table.size());

        assert_eq!(None, table.insert_or_replace(1, "a"));
        assert_eq!(None, table.insert_or_replace(2, "b"));
        assert_eq!(None, table.insert_or_replace(3, "c"));

        assert_eq!(Some(&"b"), table.lookup(2));
        assert!(table.remove(2));
        assert_eq!(None, table.lookup(2));
        assert_eq!(2, table.num_entries());
    }

    #[test]
    fn test_replace_returns_old_value() {
        let mut table: HashTable<usize, u32> = HashTable::new();
        assert_eq!(None, table.insert_or_replace(7, 1));
        assert_eq!(Some(1), table.insert_or_replace(7, 2));
        assert_eq!(Some(&2), table.lookup(7));
        assert_eq!(1, table.num_entries());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut table: HashTable<usize, ()> = HashTable::new();
        table.insert_or_replace(5, ());
        assert!(table.remove(5));
        assert!(!table.remove(5));
        assert!(!table.remove(6));
        assert_eq!(0, table.num_entries());
    }

    #[test]
    fn test_colliding_keys() {
        let mut table: HashTable<usize, usize> = HashTable::with_size(11);

        for key in (0..5).map(|i| i * 11) {
            table.insert_or_replace(key, key + 1);
        }

        assert!(table.remove(22));
        for key in [0, 11, 33, 44] {
            assert_eq!(Some(&(key + 1)), table.lookup(key));
        }
        assert_eq!(None, table.lookup(22));
    }

    #[test]
    fn test_growth_keeps_load_factor() {
        let mut table: HashTable<usize, usize> = HashTable::with_size(11);

        for key in 0..10_000 {
            table.insert_or_replace(key, key * 2);
            assert!(table.num_entries() <= table.size() * MAX_LOAD_FACTOR);
        }

        assert!(PRIMES.contains(&table.size()));
        for key in 0..10_000 {
            assert_eq!(Some(&(key * 2)), table.lookup(key));
        }
    }

    #[test]
    fn test_cursor_remove_current() {
        let mut table: HashTable<usize, usize> = HashTable::with_size(11);

        for key in 0..100 {
            table.insert_or_replace(key, key);
        }

        let mut visited = 0;
        let mut cursor = table.cursor();
        while let Some(key) = cursor.advance() {
            visited += 1;
            assert_eq!(key, *cursor.value());
            if key % 2 == 0 {
                assert_eq!(key, cursor.remove_current());
            } else {
                *cursor.value_mut() += 1000;
            }
        }

        assert_eq!(100, visited);
        assert_eq!(50, table.num_entries());
        for key in 0..100 {
            if key % 2 == 0 {
                assert!(!table.contains_key(key));
            } else {
                assert_eq!(Some(&(key + 1000)), table.lookup(key));
            }
        }
    }

    #[test]
    fn test_cursor_removes_everything() {
        let mut table: HashTable<usize, ()> = HashTable::with_size(11);
        for key in 0..40 {
            table.insert_or_replace(key * 11, ());
        }

        let mut cursor = table.cursor();
        while cursor.advance().is_some() {
            cursor.remove_current();
        }

        assert!(table.is_empty());
        assert_eq!(0, table.iter().count());
    }

    #[test]
    fn test_iter_and_retain() {
        let mut table: HashTable<Address, usize> = HashTable::new();
        for idx in 1..=20 {
            table.insert_or_replace(Address::from(idx * 16), idx);
        }

        let sum: usize = table.iter().map(|(_, value)| *value).sum();
        assert_eq!(210, sum);

        table.retain(|_, value| *value > 10);
        assert_eq!(10, table.num_entries());

        let mut keys = Vec::new();
        table.for_each(|key, _| keys.push(key));
        keys.sort();
        assert_eq!(Address::from(11 * 16), keys[0]);
    }

    #[test]
    fn test_arena_exhaustion() {
        let mut table: HashTable<usize, ()> = HashTable::with_arena_limit(11, 3);
        for key in 0..3 {
            assert_eq!(Ok(None), table.try_insert_or_replace(key, ()));
        }

        assert_eq!(Err(ArenaExhausted), table.try_insert_or_replace(3, ()));
        assert_eq!(Ok(Some(())), table.try_insert_or_replace(2, ()));

        assert!(table.remove(0));
        assert_eq!(Ok(None), table.try_insert_or_replace(3, ()));
        assert_eq!(3, table.num_entries());
    }

    #[test]
    fn test_clear() {
        let mut table: HashTable<usize, usize> = HashTable::new();
        for key in 0..100 {
            table.insert_or_replace(key, key);
        }
        let size = table.size();
        table.clear();
        assert!(table.is_empty());
        assert_eq!(size, table.size());
        assert_eq!(None, table.lookup(5));
    }
}
