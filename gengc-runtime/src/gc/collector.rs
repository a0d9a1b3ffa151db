use std::sync::atomic::Ordering;

use fixedbitset::FixedBitSet;
use scoped_threadpool::Pool;

use crate::error::{FatalError, GcError};
use crate::flags::{CompactionMode, GcFlags};
use crate::gc::compact::{self, EvacuationStats, Forwarding};
use crate::gc::controller::{CollectionPhases, CycleOutcome};
use crate::gc::handles::HandleKind;
use crate::gc::heap::{Heap, PageMap, GENERATIONS, MAX_GENERATION, PAGE_SIZE};
use crate::gc::marking::{self, MarkContext};
use crate::gc::pinning::{CementTable, PinQueue, PinType};
use crate::gc::remset::RememberedSet;
use crate::gc::root::{PerThreadBuffers, PromoteFlags, ScanContext, Slot};
use crate::gc::sweep;
use crate::gc::verify::{verify_marking, Verifier, VerifierPhase};
use crate::gc::worklist::Worklist;
use crate::gc::{Address, CollectorState, Gc, GcReason};
use crate::interface::{GcToEe, SuspendReason, SurvivorRecord};
use crate::timer::Timer;

/// State that survives from one collection to the next. Lives behind the
/// collector lock of `Gc`, so at most one collection runs at a time.
pub struct Collector {
    pins: PinQueue,
    cement: CementTable,
    remset: RememberedSet,
    pool: Pool,
    workers: usize,
}

impl Collector {
    pub fn new(flags: &GcFlags) -> Collector {
        Collector {
            pins: PinQueue::new(flags.pin_queue_capacity),
            cement: CementTable::new(flags.cementing, flags.cement_threshold),
            remset: RememberedSet::new(),
            pool: Pool::new(flags.gc_workers as u32),
            workers: flags.gc_workers,
        }
    }

    pub fn remembered_set_len(&self) -> usize {
        self.remset.len()
    }

    /// Runs one stop-the-world cycle. Returns the condemned generation.
    pub fn collect(
        &mut self,
        gc: &Gc,
        ee: &dyn GcToEe,
        requested: Option<usize>,
        reason: GcReason,
    ) -> Result<usize, GcError> {
        gc.set_state(CollectorState::SelectingCondemnedGeneration);
        let condemned = gc.controller.lock().select_condemned(requested);

        gc.set_state(CollectorState::Suspending);
        suspend(gc, ee)?;

        let gc_index = gc.gc_index.fetch_add(1, Ordering::AcqRel) + 1;

        {
            let mut heap = gc.heap.lock();

            let mut collection = Collection {
                gc,
                ee,
                heap: &mut heap,
                pins: &mut self.pins,
                cement: &mut self.cement,
                remset: &mut self.remset,
                pool: &mut self.pool,
                workers: self.workers,

                gc_index,
                condemned,
                reason,

                condemned_pages: Vec::new(),
                evacuated: Vec::new(),
                survivors: Vec::new(),
                outcome: CycleOutcome::default(),
                phases: CollectionPhases::new(),
            };

            collection.collect();
        }

        gc.set_state(CollectorState::Restarting);
        ee.restart_ee(true);
        gc.set_state(CollectorState::Idle);

        if gc.finalizer.lock().freachable() > 0 {
            ee.enable_finalization(true);
        }

        Ok(condemned)
    }
}

fn suspend(gc: &Gc, ee: &dyn GcToEe) -> Result<(), GcError> {
    let retries = gc.flags.suspend_retries;
    let mut attempt = 0;

    loop {
        match ee.suspend_ee(SuspendReason::ForGc) {
            Ok(()) => return Ok(()),

            Err(err) if attempt < retries => {
                attempt += 1;
                log::warn!("GC: {}, retry {}/{}", err, attempt, retries);
            }

            Err(err) => {
                log::warn!("GC: {}, giving up", err);
                ee.restart_ee(false);
                gc.set_state(CollectorState::Idle);
                return Err(err);
            }
        }
    }
}

struct Collection<'a> {
    gc: &'a Gc,
    ee: &'a dyn GcToEe,
    heap: &'a mut Heap,
    pins: &'a mut PinQueue,
    cement: &'a mut CementTable,
    remset: &'a mut RememberedSet,
    pool: &'a mut Pool,
    workers: usize,

    gc_index: usize,
    condemned: usize,
    reason: GcReason,

    condemned_pages: Vec<usize>,
    evacuated: Vec<usize>,
    survivors: Vec<SurvivorRecord>,
    outcome: CycleOutcome,
    phases: CollectionPhases,
}

impl<'a> Collection<'a> {
    fn collect(&mut self) {
        let dev_verbose = self.gc.flags.gc_dev_verbose;
        let stats = self.gc.flags.gc_stats;

        if dev_verbose {
            log::debug!(
                "GC #{}: start gen{} ({})",
                self.gc_index,
                self.condemned,
                self.reason
            );
        }

        let mut timer = Timer::new(stats);

        self.prepare();
        let gray = self.mark_roots();

        if stats {
            self.phases.roots = timer.stop();
        }

        if dev_verbose {
            log::debug!("GC #{}: Phase 1 (roots)", self.gc_index);
        }

        self.mark_live(gray);

        if stats {
            self.phases.marking = timer.stop();
        }

        if dev_verbose {
            log::debug!("GC #{}: Phase 2 (marking)", self.gc_index);
        }

        self.filter_remembered_set();
        self.plan();
        self.sweep();

        if stats {
            self.phases.sweep = timer.stop();
        }

        if dev_verbose {
            log::debug!(
                "GC #{}: Phase 3 (sweep, {} page(s) to evacuate)",
                self.gc_index,
                self.evacuated.len()
            );
        }

        self.evacuate();

        if stats {
            self.phases.evacuate = timer.stop();
        }

        if dev_verbose {
            log::debug!("GC #{}: Phase 4 (evacuate)", self.gc_index);
        }

        self.update_references();
        self.free_evacuated_pages();
        self.rebuild_remembered_set();

        if stats {
            self.phases.update_refs = timer.stop();
        }

        if dev_verbose {
            log::debug!("GC #{}: Phase 5 (update refs)", self.gc_index);
        }

        self.finish();
    }

    fn prepare(&mut self) {
        let gc = self.gc;
        let ee = self.ee;

        gc.set_state(CollectorState::Marking);
        ee.diag_gc_start(self.gc_index, self.condemned, self.reason);
        gc.controller.lock().start(memory_size(&*self.heap));

        let mut buffers = Worklist::new();

        ee.for_each_alloc_context(&mut |context| {
            context.make_iterable();
            let segment = context.remset().lock().take();

            if !segment.is_empty() {
                buffers.push_segment(segment);
            }
        });

        let mut pending = gc.pending_remset.take();
        pending.append(&mut buffers);

        match self.remset.merge(&mut pending) {
            Ok(merged) => log::trace!("GC: {} remembered holder(s) merged", merged),
            Err(_) => gc.fatal(ee, FatalError::HashArenaExhausted),
        }

        for generation in 0..=self.condemned {
            self.heap.reset_allocation(generation);
        }

        self.condemned_pages = (0..=self.condemned)
            .flat_map(|generation| self.heap.small_pages(generation))
            .collect();

        if gc.flags.gc_verify {
            self.verify(VerifierPhase::PreCollection);
        }
    }

    fn mark_context(&self) -> MarkContext<'a> {
        let gc: &'a Gc = self.gc;
        MarkContext::new(&gc.page_map, self.condemned)
    }

    fn scan_context(&self, promotion: bool) -> ScanContext {
        ScanContext {
            promotion,
            condemned: self.condemned,
            max_generation: MAX_GENERATION,
            thread_number: 0,
        }
    }

    fn mark_roots(&mut self) -> Vec<Address> {
        let gc = self.gc;
        let ctx = self.mark_context();
        let gray = PerThreadBuffers::new(self.workers);
        let staged = PerThreadBuffers::new(self.workers);

        {
            let heap: &Heap = &*self.heap;

            let promote = |sc: &ScanContext, slot: Slot, flags: PromoteFlags| {
                let value = slot.get();

                if value.is_null() {
                    return;
                }

                if flags.is_pinning() {
                    // the word may point anywhere into an object
                    if let Some(object) = heap.object_containing(value) {
                        if ctx.is_condemned(object) {
                            staged.push(sc, (object, flags.pin_type()));
                        }
                    }
                } else if ctx.try_mark(value) {
                    gray.push(sc, value);
                }
            };

            let sc = self.scan_context(true);
            self.ee.scan_roots(&promote, &sc);
            self.ee.after_scan_roots(&sc);
        }

        let mut gray = gray.merge();
        let mut dropped = Vec::new();

        for (object, pin_type) in staged.merge() {
            if !self.pins.stage_pointer(object, pin_type) {
                dropped.push(object);
            }
        }

        gc.handles.visit(HandleKind::is_strong, |kind, slot| {
            let target = slot.get();

            if kind == HandleKind::Pinned {
                if ctx.is_condemned(target) && !self.pins.stage_pointer(target, PinType::Other) {
                    dropped.push(target);
                }
            } else if ctx.try_mark(target) {
                gray.push(target);
            }
        });

        gc.finalizer.lock().visit_freachable(|slot| {
            let object = slot.get();

            if ctx.try_mark(object) {
                gray.push(object);
            }
        });

        if self.condemned < MAX_GENERATION {
            dropped.extend(self.cement.stage_cemented(self.pins));
        }

        // the queue overflowed and nothing moves this cycle
        for object in dropped {
            if ctx.is_condemned(object) && ctx.try_mark(object) {
                gray.push(object);
            }
        }

        self.pins.optimize_queue(0);
        let entries = self.pins.entries().to_vec();

        for object in entries {
            // cemented objects may have left the condemned generations
            if !ctx.is_condemned(object) {
                continue;
            }

            let obj = object.to_obj();

            if obj.header().mark_pinned() {
                gray.push(object);
            }

            let idx = self.heap.page_index(object);
            self.heap.page_mut(idx).pinned = true;
            self.pins.record_pinned_object(obj.size());
        }

        if self.condemned < MAX_GENERATION {
            self.mark_from_remembered_set(ctx, &mut gray);
        }

        gray
    }

    // Older holders recorded with a reference into the condemned
    // generations are roots of a minor collection.
    fn mark_from_remembered_set(&mut self, ctx: MarkContext, gray: &mut Vec<Address>) {
        let cement = &mut *self.cement;
        let pins = &*self.pins;
        // an overflowed queue pins everything, that is no reason to cement
        let exact_pins = !pins.overflowed();

        for holder in self.remset.holders(self.condemned) {
            if ctx.is_condemned(holder) {
                continue;
            }

            holder.to_obj().visit_reference_fields(|slot| {
                let target = slot.get();

                if !ctx.is_condemned(target) {
                    return;
                }

                if exact_pins
                    && pins.is_pinned(target)
                    && !cement.cement_lookup(target)
                    && cement.cement(target)
                {
                    log::trace!("GC: cemented {}", target);
                }

                if ctx.try_mark(target) {
                    gray.push(target);
                }
            });
        }
    }

    fn mark_live(&mut self, gray: Vec<Address>) {
        let gc = self.gc;
        let ee = self.ee;
        let ctx = self.mark_context();

        let scanned = marking::drain(ctx, gray, self.pool, self.workers);
        log::trace!("GC: {} object(s) scanned", scanned);

        clear_weak_handles(gc, ctx, HandleKind::WeakShort);

        let resurrect = gc
            .finalizer
            .lock()
            .scan(|obj| !ctx.is_live(obj), |obj| ee.eager_finalized(obj));

        if !resurrect.is_empty() {
            let gray: Vec<Address> = resurrect
                .into_iter()
                .filter(|&obj| ctx.try_mark(obj))
                .collect();

            marking::drain(ctx, gray, self.pool, self.workers);
        }

        clear_weak_handles(gc, ctx, HandleKind::WeakLong);

        if gc.flags.gc_verify {
            if let Err(msg) = verify_marking(&*self.heap, ctx, &self.condemned_pages) {
                log::error!("GC: marking verification failed: {}", msg);
                gc.fatal(ee, FatalError::HeapCorruption);
            }
        }
    }

    // Entries of condemned holders are rebuilt from the survivors.
    fn filter_remembered_set(&mut self) {
        let ctx = self.mark_context();

        self.remset.update(|holder, youngest| {
            if ctx.is_condemned(holder) {
                holder.to_obj().header().clear_remembered();
                None
            } else {
                Some(youngest)
            }
        });
    }

    fn plan(&mut self) {
        self.gc.set_state(CollectorState::Sweeping);
        sweep::compute_live_bytes(self.heap, &self.condemned_pages);

        if self.should_compact() {
            self.evacuated = compact::select_pages(&*self.heap, &self.condemned_pages);
        }

        for &idx in &self.evacuated {
            let page = self.heap.page(idx);
            let used = page.top.offset_from(self.heap.page_start(idx));
            self.outcome.freed += used - page.live_bytes;
        }
    }

    fn should_compact(&self) -> bool {
        if self.pins.overflowed() {
            return false;
        }

        match self.gc.flags.compaction {
            CompactionMode::Never => false,
            CompactionMode::Always => true,
            CompactionMode::Auto if self.condemned < MAX_GENERATION => true,
            CompactionMode::Auto => {
                self.reason.forces_compaction()
                    || self.fragmentation() > self.gc.flags.fragmentation_limit()
            }
        }
    }

    // free fraction of the pages of the oldest generation
    fn fragmentation(&self) -> f32 {
        let mut pages = 0;
        let mut live = 0;

        for &idx in &self.condemned_pages {
            let page = self.heap.page(idx);

            if page.generation == MAX_GENERATION {
                pages += 1;
                live += page.live_bytes;
            }
        }

        if pages == 0 {
            return 0.0;
        }

        1.0 - live as f32 / (pages * PAGE_SIZE) as f32
    }

    fn sweep(&mut self) {
        let mut evacuated = FixedBitSet::with_capacity(self.heap.page_count());

        for &idx in &self.evacuated {
            evacuated.insert(idx);
        }

        for &idx in &self.condemned_pages {
            if evacuated.contains(idx) {
                continue;
            }

            let generation = self.heap.page(idx).generation;
            let target = compact::target_generation(generation);
            let stats = sweep::sweep_page(self.heap, idx, target, &mut self.survivors);

            self.outcome.freed += stats.freed_bytes;

            if target != generation {
                self.outcome.promoted[target] += stats.live_bytes;
            }
        }

        if self.condemned == MAX_GENERATION {
            let stats = sweep::sweep_large(self.heap, &mut self.survivors);
            self.outcome.freed += stats.freed_bytes;
        }
    }

    fn evacuate(&mut self) {
        if self.evacuated.is_empty() {
            return;
        }

        self.gc.set_state(CollectorState::Compacting);
        let mut stats = EvacuationStats::default();

        for &idx in &self.evacuated {
            let target = compact::target_generation(self.heap.page(idx).generation);
            let promoted = stats.promoted_bytes;

            let pinned = self.pins.entries_in(self.heap.page_region(idx));
            compact::evacuate_page(self.heap, idx, pinned, &mut self.survivors, &mut stats);

            self.outcome.promoted[target] += stats.promoted_bytes - promoted;
        }

        if stats.late_pinned > 0 {
            log::debug!(
                "GC: {} object(s) pinned in place, target generation full",
                stats.late_pinned
            );
        }

        self.outcome.copied += stats.copied_bytes;
        self.outcome.late_pinned += stats.late_pinned;
    }

    fn update_references(&mut self) {
        if self.evacuated.is_empty() {
            return;
        }

        let gc = self.gc;
        let forwarding = Forwarding::new(&gc.page_map, &self.evacuated);

        let update = |_: &ScanContext, slot: Slot, flags: PromoteFlags| {
            // pinning roots kept their object in place
            if !flags.is_pinning() {
                forwarding.update_slot(slot);
            }
        };

        let sc = self.scan_context(false);
        self.ee.scan_roots(&update, &sc);
        self.ee.after_scan_roots(&sc);

        gc.handles
            .visit(|_| true, |_, slot| forwarding.update_slot(slot));

        {
            let mut finalizer = gc.finalizer.lock();
            finalizer.visit_registered(|slot| forwarding.update_slot(slot));
            finalizer.visit_freachable(|slot| forwarding.update_slot(slot));
        }

        for holder in self.remset.holders(MAX_GENERATION) {
            forwarding.update_object(holder);
        }

        for survivor in &self.survivors {
            forwarding.update_object(survivor.new);
        }
    }

    fn free_evacuated_pages(&mut self) {
        for &idx in &self.evacuated {
            if self.heap.page(idx).pinned {
                sweep::sweep_pinned_page(self.heap, idx);
            } else {
                self.heap.release_page(idx);
            }
        }
    }

    // Recomputes the youngest referenced generation of every holder and
    // records survivors that now point into a younger generation.
    fn rebuild_remembered_set(&mut self) {
        let gc = self.gc;
        let page_map: &PageMap = &gc.page_map;

        self.remset.update(|holder, _| {
            let youngest = youngest_reference(page_map, holder);
            update_remembered_bit(holder, youngest);
            youngest
        });

        for survivor in &self.survivors {
            let object = survivor.new;

            if let Some(youngest) = youngest_reference(page_map, object) {
                if self.remset.record(object, youngest).is_err() {
                    gc.fatal(self.ee, FatalError::HashArenaExhausted);
                }

                update_remembered_bit(object, Some(youngest));
            }
        }
    }

    fn finish(&mut self) {
        let gc = self.gc;
        let ee = self.ee;

        if self.condemned == MAX_GENERATION {
            self.cement.reset();
        } else {
            self.cement.clear_below_threshold();
        }

        let pins = self.pins.finish_cycle();

        self.outcome.memory_size = memory_size(&*self.heap);
        self.outcome.old_size = self.heap.used_bytes(MAX_GENERATION);

        {
            let mut controller = gc.controller.lock();

            if gc.flags.gc_stats {
                controller.add_phases(self.condemned, std::mem::take(&mut self.phases));
            }

            controller.stop(self.condemned, self.reason, self.outcome, pins, &gc.flags);
        }

        if gc.flags.gc_verify {
            self.verify(VerifierPhase::PostCollection);
        }

        if ee.wants_survivor_walk() {
            ee.diag_walk_survivors(&self.survivors);
        }

        ee.diag_gc_end(self.gc_index, self.condemned, self.reason);
        ee.gc_done(self.condemned);
    }

    fn verify(&self, phase: VerifierPhase) {
        let mut verifier = Verifier::new(&*self.heap, &*self.remset, phase);

        match verifier.verify() {
            Ok(objects) => log::debug!("GC: {} object(s) verified ({})", objects, phase),
            Err(msg) => {
                log::error!("GC: heap verification failed: {}", msg);
                self.gc.fatal(self.ee, FatalError::HeapCorruption);
            }
        }
    }
}

fn memory_size(heap: &Heap) -> usize {
    (0..GENERATIONS).map(|generation| heap.used_bytes(generation)).sum()
}

fn clear_weak_handles(gc: &Gc, ctx: MarkContext, kind: HandleKind) {
    gc.handles.visit(
        |k| k == kind,
        |_, slot| {
            if !ctx.is_live(slot.get()) {
                slot.set(Address::null());
            }
        },
    );
}

/// youngest generation below its own that `object` references
fn youngest_reference(page_map: &PageMap, object: Address) -> Option<usize> {
    let generation = page_map.generation_of(object)?;
    let mut youngest = None;

    object.to_obj().visit_reference_fields(|slot| {
        if let Some(target) = page_map.generation_of(slot.get()) {
            if target < generation && youngest.map_or(true, |y| target < y) {
                youngest = Some(target);
            }
        }
    });

    youngest
}

// The bit stays set while the barrier has nothing left to report.
fn update_remembered_bit(holder: Address, youngest: Option<usize>) {
    let header = holder.to_obj().header();

    if youngest == Some(0) {
        header.try_remember();
    } else {
        header.clear_remembered();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::heap::MAX_GENERATION;
    use crate::object::{initialize_object, TypeDescriptor, TypeRef};

    #[test]
    fn test_youngest_reference() {
        let ty = TypeRef::register(TypeDescriptor::fixed("Pair", 2, &[0, 1]));
        let mut heap = Heap::new(16 * PAGE_SIZE).expect("reservation failed");
        let size = ty.object_size(0);

        let mut allocate = |generation| {
            let address = heap.allocate(generation, size).expect("heap full");
            unsafe { initialize_object(address, ty, 0, size) };
            address
        };

        let young = allocate(0);
        let middle = allocate(1);
        let old = allocate(MAX_GENERATION);
        let page_map = heap.page_map().clone();

        assert_eq!(None, youngest_reference(&page_map, old));

        old.to_obj().field(0).set(middle);
        assert_eq!(Some(1), youngest_reference(&page_map, old));

        old.to_obj().field(1).set(young);
        assert_eq!(Some(0), youngest_reference(&page_map, old));

        // references to older objects never count
        young.to_obj().field(0).set(old);
        assert_eq!(None, youngest_reference(&page_map, young));
    }

    #[test]
    fn test_remembered_bit() {
        let ty = TypeRef::register(TypeDescriptor::fixed("Leaf", 1, &[]));
        let mut heap = Heap::new(16 * PAGE_SIZE).expect("reservation failed");
        let size = ty.object_size(0);
        let object = heap.allocate(MAX_GENERATION, size).expect("heap full");
        unsafe { initialize_object(object, ty, 0, size) };

        update_remembered_bit(object, Some(0));
        assert!(object.to_obj().header().is_remembered());

        update_remembered_bit(object, Some(1));
        assert!(!object.to_obj().header().is_remembered());

        update_remembered_bit(object, None);
        assert!(!object.to_obj().header().is_remembered());
    }
}
