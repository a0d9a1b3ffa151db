use std::collections::VecDeque;

use crate::gc::root::Slot;
use crate::gc::Address;

// pending finalizers beyond this are reported once per collection
const FREACHABLE_WARNING: usize = 10_000;

/// Objects with finalizers. `registered` objects are finalized once they
/// become unreachable; they then move to the f-reachable queue, which keeps
/// them alive until the finalizer thread picks them up.
pub struct FinalizeQueue {
    registered: Vec<Address>,
    freachable: VecDeque<Address>,
}

impl FinalizeQueue {
    pub fn new() -> FinalizeQueue {
        FinalizeQueue {
            registered: Vec::new(),
            freachable: VecDeque::new(),
        }
    }

    pub fn register(&mut self, obj: Address) {
        self.registered.push(obj);
    }

    /// Like `register`, but a suppressed object may still sit in the queue
    /// until the next scan drops it.
    pub fn reregister(&mut self, obj: Address) {
        if !self.registered.contains(&obj) {
            self.registered.push(obj);
        }
    }

    pub fn registered(&self) -> usize {
        self.registered.len()
    }

    pub fn freachable(&self) -> usize {
        self.freachable.len()
    }

    /// Moves dead objects to the f-reachable queue. `is_dead` decides
    /// reachability, `eager_finalized` lets the engine take over an object.
    /// Returns the objects that need to be resurrected.
    pub fn scan<D, E>(&mut self, is_dead: D, eager_finalized: E) -> Vec<Address>
    where
        D: Fn(Address) -> bool,
        E: Fn(Address) -> bool,
    {
        let mut resurrect = Vec::new();

        self.registered.retain(|&obj| {
            if !obj.to_obj().header().is_finalizable() {
                // finalization was suppressed
                return false;
            }

            if !is_dead(obj) {
                return true;
            }

            if !eager_finalized(obj) {
                resurrect.push(obj);
            }

            false
        });

        self.freachable.extend(resurrect.iter().copied());

        if self.freachable.len() > FREACHABLE_WARNING {
            log::warn!(
                "{} objects waiting for finalization",
                self.freachable.len()
            );
        }

        resurrect
    }

    /// Queues every registered object the engine agrees to finalize,
    /// reachable or not.
    pub fn finalize_all<F>(&mut self, should_finalize: F) -> usize
    where
        F: Fn(Address) -> bool,
    {
        let mut moved = 0;
        let freachable = &mut self.freachable;

        self.registered.retain(|&obj| {
            if obj.to_obj().header().is_finalizable() && should_finalize(obj) {
                freachable.push_back(obj);
                moved += 1;
                false
            } else {
                true
            }
        });

        moved
    }

    /// slots of the f-reachable queue, these are roots
    pub fn visit_freachable<F>(&mut self, mut f: F)
    where
        F: FnMut(Slot),
    {
        for obj in &mut self.freachable {
            f(Slot::at(Address::from_ptr(obj as *mut Address)));
        }
    }

    /// slots of registered objects, updated when objects move
    pub fn visit_registered<F>(&mut self, mut f: F)
    where
        F: FnMut(Slot),
    {
        for obj in &mut self.registered {
            f(Slot::at(Address::from_ptr(obj as *mut Address)));
        }
    }

    pub fn pop_freachable(&mut self) -> Option<Address> {
        self.freachable.pop_front()
    }

    pub fn drain_freachable(&mut self) -> Vec<Address> {
        self.freachable.drain(..).collect()
    }
}

impl Default for FinalizeQueue {
    fn default() -> FinalizeQueue {
        FinalizeQueue::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{initialize_object, TypeDescriptor, TypeRef};

    fn objects(count: usize, memory: &mut Vec<usize>) -> Vec<Address> {
        let ty = TypeRef::register(TypeDescriptor::fixed("Resource", 1, &[]).with_finalizer());
        let size = ty.object_size(0);
        memory.resize(count * 3, 0);
        let start = Address::from_ptr(memory.as_mut_ptr());

        (0..count)
            .map(|idx| {
                let address = start.offset(idx * size);
                unsafe { initialize_object(address, ty, 0, size) };
                address
            })
            .collect()
    }

    #[test]
    fn test_scan_moves_dead_objects() {
        let mut memory = Vec::new();
        let objs = objects(4, &mut memory);
        let mut queue = FinalizeQueue::new();
        for &obj in &objs {
            queue.register(obj);
        }

        objs[3].to_obj().header().clear_finalizable();

        let resurrect = queue.scan(|obj| obj != objs[0], |obj| obj == objs[2]);
        assert_eq!(vec![objs[1]], resurrect);
        assert_eq!(1, queue.registered());
        assert_eq!(1, queue.freachable());

        assert_eq!(Some(objs[1]), queue.pop_freachable());
        assert_eq!(None, queue.pop_freachable());
    }

    #[test]
    fn test_finalize_all() {
        let mut memory = Vec::new();
        let objs = objects(3, &mut memory);
        let mut queue = FinalizeQueue::new();
        for &obj in &objs {
            queue.register(obj);
        }

        assert_eq!(2, queue.finalize_all(|obj| obj != objs[1]));
        assert_eq!(1, queue.registered());
        assert_eq!(vec![objs[0], objs[2]], queue.drain_freachable());
    }

    #[test]
    fn test_reregister_keeps_single_entry() {
        let mut memory = Vec::new();
        let objs = objects(2, &mut memory);
        let mut queue = FinalizeQueue::new();
        queue.register(objs[0]);

        queue.reregister(objs[0]);
        queue.reregister(objs[1]);
        assert_eq!(2, queue.registered());

        let resurrect = queue.scan(|_| true, |_| false);
        assert_eq!(vec![objs[0], objs[1]], resurrect);
        assert_eq!(2, queue.freachable());
    }

    #[test]
    fn test_slots_update_entries() {
        let mut memory = Vec::new();
        let objs = objects(1, &mut memory);
        let mut queue = FinalizeQueue::new();
        queue.register(objs[0]);

        queue.visit_registered(|slot| slot.set(Address::from(0x1000)));
        let mut seen = Vec::new();
        queue.visit_registered(|slot| seen.push(slot.get()));
        assert_eq!(vec![Address::from(0x1000)], seen);
    }
}
