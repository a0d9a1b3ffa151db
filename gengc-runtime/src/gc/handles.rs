use parking_lot::Mutex;

use crate::gc::root::Slot;
use crate::gc::Address;

pub const HANDLE_BLOCK_SIZE: usize = 256;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HandleKind {
    /// keeps the target alive
    Strong,
    /// cleared once the target is unreachable, before finalization
    WeakShort,
    /// cleared only if the target stays unreachable after finalization
    WeakLong,
    /// keeps the target alive and in place
    Pinned,
}

impl HandleKind {
    pub fn is_strong(self) -> bool {
        matches!(self, HandleKind::Strong | HandleKind::Pinned)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectHandle(u32);

impl ObjectHandle {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Handles owned by the collector. Slots live in boxed blocks so that
/// their addresses stay stable while the table grows.
pub struct HandleTable {
    inner: Mutex<HandleTableInner>,
}

struct HandleTableInner {
    blocks: Vec<Box<HandleBlock>>,
    kinds: Vec<Option<HandleKind>>,
    free: Vec<u32>,
}

struct HandleBlock {
    elements: [Address; HANDLE_BLOCK_SIZE],
}

impl HandleBlock {
    fn new() -> HandleBlock {
        HandleBlock {
            elements: [Address::null(); HANDLE_BLOCK_SIZE],
        }
    }
}

impl HandleTable {
    pub fn new() -> HandleTable {
        HandleTable {
            inner: Mutex::new(HandleTableInner {
                blocks: Vec::new(),
                kinds: Vec::new(),
                free: Vec::new(),
            }),
        }
    }

    pub fn create(&self, target: Address, kind: HandleKind) -> ObjectHandle {
        let mut inner = self.inner.lock();

        let idx = match inner.free.pop() {
            Some(idx) => idx as usize,
            None => {
                let idx = inner.kinds.len();
                if idx % HANDLE_BLOCK_SIZE == 0 {
                    inner.blocks.push(Box::new(HandleBlock::new()));
                }
                inner.kinds.push(None);
                idx
            }
        };

        inner.kinds[idx] = Some(kind);
        inner.slot(idx).set(target);

        ObjectHandle(idx as u32)
    }

    pub fn destroy(&self, handle: ObjectHandle) {
        let mut inner = self.inner.lock();
        let idx = handle.index();
        assert!(inner.kinds[idx].take().is_some(), "handle destroyed twice");
        inner.slot(idx).set(Address::null());
        inner.free.push(handle.0);
    }

    pub fn target(&self, handle: ObjectHandle) -> Address {
        let mut inner = self.inner.lock();
        inner.checked_slot(handle).get()
    }

    pub fn set_target(&self, handle: ObjectHandle, target: Address) {
        let mut inner = self.inner.lock();
        inner.checked_slot(handle).set(target);
    }

    pub fn kind(&self, handle: ObjectHandle) -> Option<HandleKind> {
        self.inner.lock().kinds[handle.index()]
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.kinds.len() - inner.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// visits the non-null slots of live handles whose kind passes `filter`
    pub fn visit<P, F>(&self, filter: P, mut f: F)
    where
        P: Fn(HandleKind) -> bool,
        F: FnMut(HandleKind, Slot),
    {
        let mut inner = self.inner.lock();

        for idx in 0..inner.kinds.len() {
            if let Some(kind) = inner.kinds[idx] {
                let slot = inner.slot(idx);

                if filter(kind) && slot.get().is_non_null() {
                    f(kind, slot);
                }
            }
        }
    }
}

impl Default for HandleTable {
    fn default() -> HandleTable {
        HandleTable::new()
    }
}

impl HandleTableInner {
    fn slot(&mut self, idx: usize) -> Slot {
        let block = &mut self.blocks[idx / HANDLE_BLOCK_SIZE];
        Slot::at(Address::from_ptr(
            &mut block.elements[idx % HANDLE_BLOCK_SIZE] as *mut Address,
        ))
    }

    fn checked_slot(&mut self, handle: ObjectHandle) -> Slot {
        let idx = handle.index();
        assert!(
            self.kinds.get(idx).is_some_and(|kind| kind.is_some()),
            "use of destroyed handle {}",
            idx
        );
        self.slot(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_destroy() {
        let table = HandleTable::new();
        let first = table.create(Address::from(0x100), HandleKind::Strong);
        let second = table.create(Address::from(0x200), HandleKind::WeakShort);

        assert_eq!(Address::from(0x100), table.target(first));
        assert_eq!(Some(HandleKind::WeakShort), table.kind(second));
        assert_eq!(2, table.len());

        table.destroy(first);
        assert_eq!(1, table.len());
        assert_eq!(None, table.kind(first));

        let third = table.create(Address::from(0x300), HandleKind::Pinned);
        assert_eq!(first.index(), third.index());
        assert_eq!(Address::from(0x300), table.target(third));
    }

    #[test]
    fn test_slots_stay_stable() {
        let table = HandleTable::new();
        let first = table.create(Address::from(0x10), HandleKind::Strong);

        let mut before = None;
        table.visit(|_| true, |_, slot| before = Some(slot.address()));

        for idx in 0..3 * HANDLE_BLOCK_SIZE {
            table.create(Address::from(0x20 + idx * 16), HandleKind::WeakLong);
        }

        let mut after = None;
        table.visit(
            |kind| kind == HandleKind::Strong,
            |_, slot| after = Some(slot.address()),
        );
        assert_eq!(before, after);
        assert_eq!(Address::from(0x10), table.target(first));
    }

    #[test]
    fn test_visit_filters_kinds() {
        let table = HandleTable::new();
        table.create(Address::from(0x10), HandleKind::Strong);
        table.create(Address::from(0x20), HandleKind::Pinned);
        table.create(Address::from(0x30), HandleKind::WeakShort);
        table.create(Address::null(), HandleKind::Strong);

        let mut strong = 0;
        table.visit(|kind| kind.is_strong(), |_, slot| {
            slot.set(Address::from(0x40));
            strong += 1;
        });
        assert_eq!(2, strong);

        let mut targets = Vec::new();
        table.visit(|_| true, |_, slot| targets.push(slot.get().to_usize()));
        targets.sort_unstable();
        assert_eq!(vec![0x30, 0x40, 0x40], targets);
    }
}
