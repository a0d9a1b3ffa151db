use std::fmt;

use fixedbitset::FixedBitSet;

use crate::gc::heap::{Heap, PageKind};
use crate::gc::marking::MarkContext;
use crate::gc::remset::RememberedSet;
use crate::gc::root::Slot;
use crate::gc::Address;
use crate::mem;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VerifierPhase {
    PreCollection,
    PostCollection,
}

impl fmt::Display for VerifierPhase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = match self {
            VerifierPhase::PreCollection => "pre collection",
            VerifierPhase::PostCollection => "post collection",
        };

        write!(f, "{}", text)
    }
}

/// Walks the whole heap and checks that every page is iterable, that
/// every reference points to an object start and that the remembered set
/// covers every reference into a younger generation.
pub struct Verifier<'a> {
    heap: &'a Heap,
    remset: &'a RememberedSet,
    phase: VerifierPhase,
    starts: FixedBitSet,
    objects: Vec<Address>,
}

impl<'a> Verifier<'a> {
    pub fn new(heap: &'a Heap, remset: &'a RememberedSet, phase: VerifierPhase) -> Verifier<'a> {
        let words = heap.region().size() / mem::WORD;

        Verifier {
            heap,
            remset,
            phase,
            starts: FixedBitSet::with_capacity(words),
            objects: Vec::new(),
        }
    }

    /// Returns the number of objects verified.
    pub fn verify(&mut self) -> Result<usize, String> {
        let heap = self.heap;

        for idx in 0..heap.page_count() {
            let kind = heap.page(idx).kind;

            match kind {
                PageKind::Small => self.verify_page(idx)?,
                PageKind::LargeStart { .. } => self.add_object(heap.page_start(idx)),
                PageKind::Free | PageKind::LargeContinuation { .. } => {}
            }
        }

        let objects = std::mem::take(&mut self.objects);

        for &object in &objects {
            self.verify_object(object)?;
        }

        log::trace!("verified {} objects ({})", objects.len(), self.phase);
        Ok(objects.len())
    }

    fn verify_page(&mut self, idx: usize) -> Result<(), String> {
        let region = self.heap.page_region(idx);
        let top = self.heap.page(idx).top;
        let mut curr = region.start;

        while curr < top {
            let object = curr.to_obj();
            let size = object.size();
            let object_end = curr.offset(size);

            if object_end > region.end {
                return Err(format!(
                    "object {} (size {}) crosses the end of page {}",
                    curr, size, idx
                ));
            }

            if !object.is_filler() {
                self.add_object(curr);
            }

            curr = object_end;
        }

        if curr != top {
            return Err(format!("page {} doesn't end at its top {}", idx, top));
        }

        Ok(())
    }

    fn add_object(&mut self, object: Address) {
        self.starts.insert(self.word_index(object));
        self.objects.push(object);
    }

    fn word_index(&self, addr: Address) -> usize {
        addr.offset_from(self.heap.region().start) / mem::WORD
    }

    fn verify_object(&self, object_address: Address) -> Result<(), String> {
        let object = object_address.to_obj();

        if object.header().fwdptr().is_some() {
            return Err(format!("object {} is still forwarded", object_address));
        }

        if object.header().is_marked() || object.header().is_pinned() {
            return Err(format!(
                "object {} still has mark bits set ({})",
                object_address, self.phase
            ));
        }

        let mut result = Ok(());

        object.visit_reference_fields(|slot| {
            if result.is_ok() {
                result = self.verify_reference(slot, object_address);
            }
        });

        result
    }

    fn verify_reference(&self, slot: Slot, holder: Address) -> Result<(), String> {
        let reference = slot.get();

        if reference.is_null() {
            return Ok(());
        }

        let page_map = self.heap.page_map();

        if !page_map.contains(reference) || !self.starts.contains(self.word_index(reference)) {
            return Err(format!(
                "found invalid reference to {} (at {}, in object {} of type {}) during {} phase",
                reference,
                slot.address(),
                holder,
                holder.to_obj().descriptor().name(),
                self.phase,
            ));
        }

        let holder_generation = page_map.generation_of(holder);
        let target_generation = page_map.generation_of(reference);

        if let (Some(holder_generation), Some(target_generation)) =
            (holder_generation, target_generation)
        {
            if target_generation < holder_generation {
                let covered = self
                    .remset
                    .youngest(holder)
                    .is_some_and(|youngest| youngest <= target_generation);

                if !covered {
                    return Err(format!(
                        "reference from {} (gen {}) to {} (gen {}) missing in remembered set",
                        holder, holder_generation, reference, target_generation
                    ));
                }
            }
        }

        Ok(())
    }
}

/// Checks the tri-color invariant after marking: no black or gray
/// object references a white object of the condemned generations.
pub fn verify_marking(heap: &Heap, ctx: MarkContext, pages: &[usize]) -> Result<usize, String> {
    let mut checked = 0;
    let mut result = Ok(());

    let mut check = |object: Address| {
        let obj = object.to_obj();

        if obj.is_filler() || !obj.header().is_marked() {
            return;
        }

        checked += 1;

        obj.visit_reference_fields(|slot| {
            let child = slot.get();

            if result.is_ok() && child.is_non_null() && !ctx.is_live(child) {
                result = Err(format!(
                    "marked object {} references unmarked object {}",
                    object, child
                ));
            }
        });
    };

    for &idx in pages {
        heap.walk_page(idx, |object| check(object.address()));
    }

    for generation in 0..=ctx.condemned() {
        for first in heap.large_objects(generation) {
            check(heap.page_start(first));
        }
    }

    result.map(|()| checked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::heap::{MAX_GENERATION, PAGE_SIZE};
    use crate::object::{initialize_object, TypeDescriptor, TypeRef};

    fn setup() -> (Heap, Address, Address) {
        let ty = TypeRef::register(TypeDescriptor::fixed("Holder", 1, &[0]));
        let mut heap = Heap::new(16 * PAGE_SIZE).expect("reservation failed");
        let size = ty.object_size(0);

        let young = heap.allocate(0, size).expect("heap full");
        let old = heap.allocate(MAX_GENERATION, size).expect("heap full");
        unsafe {
            initialize_object(young, ty, 0, size);
            initialize_object(old, ty, 0, size);
        }
        heap.reset_allocation(0);
        heap.reset_allocation(MAX_GENERATION);

        (heap, young, old)
    }

    #[test]
    fn test_remset_coverage() {
        let (heap, young, old) = setup();
        old.to_obj().field(0).set(young);

        let mut remset = RememberedSet::new();
        let result = Verifier::new(&heap, &remset, VerifierPhase::PreCollection).verify();
        assert!(result.is_err());

        remset.record(old, 0).expect("arena exhausted");
        let result = Verifier::new(&heap, &remset, VerifierPhase::PreCollection).verify();
        assert_eq!(Ok(2), result);
    }

    #[test]
    fn test_invalid_reference() {
        let (heap, young, old) = setup();
        young.to_obj().field(0).set(old.offset(mem::WORD));

        let remset = RememberedSet::new();
        let result = Verifier::new(&heap, &remset, VerifierPhase::PostCollection).verify();
        assert!(result.is_err());
    }

    #[test]
    fn test_verify_marking() {
        let (heap, young, _) = setup();
        let ctx = MarkContext::new(heap.page_map(), 0);
        let pages = heap.small_pages(0);

        young.to_obj().field(0).set(young);
        young.to_obj().header().try_mark();
        assert_eq!(Ok(1), verify_marking(&heap, ctx, &pages));

        young.to_obj().header().clear_gc_bits();
        assert_eq!(Ok(0), verify_marking(&heap, ctx, &pages));
    }
}
