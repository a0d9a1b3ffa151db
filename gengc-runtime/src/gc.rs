use parking_lot::Mutex;

use std::cmp::{Ord, Ordering, PartialOrd};
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use crate::error::{fatal_error, FatalError, GcError};
use crate::flags::GcFlags;
use crate::gc::collector::Collector;
use crate::gc::controller::HeapController;
use crate::gc::finalizer::FinalizeQueue;
use crate::gc::handles::{HandleKind, HandleTable, ObjectHandle};
use crate::gc::heap::{Heap, PageMap, GENERATIONS, LARGE_OBJECT_SIZE, MAX_GENERATION};
use crate::gc::pinning::PinStats;
use crate::gc::remset::PendingRemset;
use crate::gc::tlab::AllocationContext;
use crate::interface::GcToEe;
use crate::mem;
use crate::object::{initialize_object, TypeRef};

pub mod collector;
pub mod compact;
pub mod controller;
pub mod finalizer;
pub mod freelist;
pub mod handles;
pub mod hash_table;
pub mod heap;
pub mod marking;
pub mod pinning;
pub mod remset;
pub mod root;
pub mod sweep;
pub mod tlab;
pub mod verify;
pub mod worklist;

pub const K: usize = 1024;
pub const M: usize = K * K;

/// The collector context. Created once by the execution engine and passed
/// by reference wherever the heap is touched.
pub struct Gc {
    flags: GcFlags,

    heap: Mutex<Heap>,
    page_map: Arc<PageMap>,

    // held for the whole cycle, serializes collections
    collector: Mutex<Collector>,
    controller: Mutex<HeapController>,

    state: AtomicU8,
    gc_index: AtomicUsize,

    pending_remset: PendingRemset,
    handles: HandleTable,
    finalizer: Mutex<FinalizeQueue>,
}

impl Gc {
    pub fn new(flags: GcFlags) -> Result<Gc, GcError> {
        flags.validate()?;

        let heap = Heap::new(flags.max_heap_size)?;
        let page_map = heap.page_map().clone();

        log::debug!(
            "gc: heap {}, gen0 budget {}, {} worker(s), compaction {}",
            formatted_size(flags.max_heap_size),
            formatted_size(flags.gen0_budget),
            flags.gc_workers,
            flags.compaction
        );

        Ok(Gc {
            collector: Mutex::new(Collector::new(&flags)),
            controller: Mutex::new(HeapController::new(&flags)),

            heap: Mutex::new(heap),
            page_map,

            state: AtomicU8::new(CollectorState::Idle as u8),
            gc_index: AtomicUsize::new(0),

            pending_remset: PendingRemset::new(),
            handles: HandleTable::new(),
            finalizer: Mutex::new(FinalizeQueue::new()),

            flags,
        })
    }

    pub fn flags(&self) -> &GcFlags {
        &self.flags
    }

    pub fn alloc(
        &self,
        ee: &dyn GcToEe,
        context: &AllocationContext,
        ty: TypeRef,
    ) -> Result<Address, GcError> {
        assert!(!ty.is_array(), "use alloc_array for {}", ty.name());
        self.alloc_object(ee, context, ty, 0)
    }

    pub fn alloc_array(
        &self,
        ee: &dyn GcToEe,
        context: &AllocationContext,
        ty: TypeRef,
        length: usize,
    ) -> Result<Address, GcError> {
        assert!(ty.is_array(), "{} is not an array type", ty.name());
        self.alloc_object(ee, context, ty, length)
    }

    fn alloc_object(
        &self,
        ee: &dyn GcToEe,
        context: &AllocationContext,
        ty: TypeRef,
        length: usize,
    ) -> Result<Address, GcError> {
        debug_assert!(ee.is_preemptive_gc_disabled());
        let size = ty.object_size(length);

        if size > self.flags.max_heap_size {
            return Err(GcError::ObjectTooLarge { size });
        }

        if self.flags.gc_stress_minor {
            self.collect(ee, Some(0), GcReason::StressMinor)?;
        }

        if self.flags.gc_stress {
            self.collect(ee, Some(MAX_GENERATION), GcReason::Stress)?;
        }

        let address = if size < LARGE_OBJECT_SIZE {
            self.alloc_small(ee, context, size)?
        } else {
            self.alloc_large(ee, size)?
        };

        unsafe {
            initialize_object(address, ty, length, size);
        }

        if ty.has_finalizer() {
            self.finalizer.lock().register(address);
        }

        Ok(address)
    }

    fn alloc_small(
        &self,
        ee: &dyn GcToEe,
        context: &AllocationContext,
        size: usize,
    ) -> Result<Address, GcError> {
        if let Some(address) = context.allocate(size) {
            return Ok(address);
        }

        // abandon the rest of the current area
        context.make_iterable();

        if let Some(address) = self.refill(context, size, true) {
            return Ok(address);
        }

        self.collect(ee, None, GcReason::AllocationFailure)?;

        if let Some(address) = self.refill(context, size, true) {
            return Ok(address);
        }

        self.collect(ee, Some(MAX_GENERATION), GcReason::LowMemory)?;

        self.refill(context, size, false)
            .ok_or(GcError::OutOfMemory { requested: size })
    }

    fn refill(
        &self,
        context: &AllocationContext,
        size: usize,
        respect_budget: bool,
    ) -> Option<Address> {
        if respect_budget && self.controller.lock().budget_exhausted(0) {
            return None;
        }

        let preferred = self.flags.tlab_size.max(size);
        let region = self.heap.lock().allocate_context_area(size, preferred)?;

        self.controller.lock().record_allocation(0, region.size());
        context.install(region);
        context.allocate(size)
    }

    fn alloc_large(&self, ee: &dyn GcToEe, size: usize) -> Result<Address, GcError> {
        if self.controller.lock().budget_exhausted(MAX_GENERATION) {
            self.collect(ee, Some(MAX_GENERATION), GcReason::AllocationFailure)?;
        }

        if let Some(address) = self.try_alloc_large(size) {
            return Ok(address);
        }

        self.collect(ee, Some(MAX_GENERATION), GcReason::LowMemory)?;

        self.try_alloc_large(size)
            .ok_or(GcError::OutOfMemory { requested: size })
    }

    fn try_alloc_large(&self, size: usize) -> Option<Address> {
        let address = self.heap.lock().alloc_large(size, MAX_GENERATION)?;
        self.controller
            .lock()
            .record_allocation(MAX_GENERATION, mem::align_usize_up(size, heap::PAGE_SIZE));
        Some(address)
    }

    /// Gives up the allocation context of a mutator that detaches: the rest
    /// of its area becomes a filler and its barrier buffer is published.
    pub fn retire_context(&self, context: &AllocationContext) {
        context.make_iterable();

        let segment = context.remset().lock().take();

        if !segment.is_empty() {
            self.pending_remset.publish(segment);
        }
    }

    /// Records `holder` in the remembered set if it now references an
    /// object of a younger generation. Called after every reference store.
    #[inline(always)]
    pub fn write_barrier(&self, context: &AllocationContext, holder: Address, value: Address) {
        if value.is_null() {
            return;
        }

        let holder_generation = match self.page_map.generation_of(holder) {
            Some(generation) if generation > 0 => generation,
            _ => return,
        };

        match self.page_map.generation_of(value) {
            Some(generation) if generation < holder_generation => {}
            _ => return,
        }

        if holder.to_obj().header().try_remember() {
            if let Some(full) = context.remset().lock().push(holder) {
                self.pending_remset.publish(full);
            }
        }
    }

    /// Collects generation `generation` and all younger ones, `None` lets
    /// the allocation budgets decide. Callable from mutators in cooperative
    /// mode and from threads unknown to the engine.
    pub fn collect(
        &self,
        ee: &dyn GcToEe,
        generation: Option<usize>,
        reason: GcReason,
    ) -> Result<(), GcError> {
        let switched = ee.enable_preemptive_gc();
        let index = self.gc_index();

        let result = {
            let mut collector = self.collector.lock();

            if generation.is_none() && self.gc_index() != index {
                // another thread collected while this one waited
                Ok(())
            } else {
                collector.collect(self, ee, generation, reason).map(|_| ())
            }
        };

        if switched {
            ee.disable_preemptive_gc();
        }

        result
    }

    pub fn gc_index(&self) -> usize {
        self.gc_index.load(AtomicOrdering::Acquire)
    }

    pub fn state(&self) -> CollectorState {
        self.state.load(AtomicOrdering::Acquire).into()
    }

    fn set_state(&self, state: CollectorState) {
        log::trace!("gc: state {}", state);
        self.state.store(state as u8, AtomicOrdering::Release);
    }

    pub fn collection_count(&self, generation: usize) -> usize {
        self.controller.lock().collections(generation)
    }

    /// generation of the page holding `addr`, None outside the heap
    pub fn generation_of(&self, addr: Address) -> Option<usize> {
        self.page_map.generation_of(addr)
    }

    pub fn is_object_start(&self, addr: Address) -> bool {
        self.heap.lock().is_object_start(addr)
    }

    pub fn heap_stats(&self) -> HeapStats {
        let heap = self.heap.lock();
        let mut stats = HeapStats {
            used_bytes: [0; GENERATIONS],
            pages: [0; GENERATIONS],
            free_pages: heap.free_page_count(),
            total_pages: heap.page_count(),
        };

        for generation in 0..GENERATIONS {
            stats.used_bytes[generation] = heap.used_bytes(generation);
            stats.pages[generation] = heap.page_count_of(generation);
        }

        stats
    }

    pub fn pin_stats(&self) -> PinStats {
        self.controller.lock().pin_stats().clone()
    }

    pub fn remembered_set_len(&self) -> usize {
        self.collector.lock().remembered_set_len()
    }

    pub fn create_handle(&self, target: Address, kind: HandleKind) -> ObjectHandle {
        self.handles.create(target, kind)
    }

    pub fn destroy_handle(&self, handle: ObjectHandle) {
        self.handles.destroy(handle);
    }

    pub fn handle_target(&self, handle: ObjectHandle) -> Address {
        self.handles.target(handle)
    }

    pub fn set_handle_target(&self, handle: ObjectHandle, target: Address) {
        self.handles.set_target(handle, target);
    }

    /// Registers `obj` for finalization again, e.g. after its finalizer ran
    /// or finalization was suppressed. Objects that are still registered,
    /// or waiting in the f-reachable queue, are left alone.
    pub fn register_for_finalization(&self, obj: Address) {
        if !obj.to_obj().header().set_finalizable() {
            return;
        }

        self.finalizer.lock().reregister(obj);
    }

    pub fn suppress_finalize(&self, obj: Address) {
        obj.to_obj().header().clear_finalizable();
    }

    /// Hands the next object whose finalizer is due to the caller. Once
    /// taken the object is an ordinary object again.
    pub fn next_finalizable(&self) -> Option<Address> {
        let obj = self.finalizer.lock().pop_freachable()?;
        obj.to_obj().header().clear_finalizable();
        Some(obj)
    }

    pub fn drain_finalizable(&self) -> Vec<Address> {
        let objects = self.finalizer.lock().drain_freachable();

        for obj in &objects {
            obj.to_obj().header().clear_finalizable();
        }

        objects
    }

    pub fn pending_finalizers(&self) -> usize {
        self.finalizer.lock().freachable()
    }

    /// Queues every registered object the engine agrees to finalize,
    /// reachable or not. Used when the engine shuts down.
    pub fn finalize_all_for_unload(&self, ee: &dyn GcToEe) -> usize {
        let moved = self
            .finalizer
            .lock()
            .finalize_all(|obj| ee.should_finalize_object_for_unload(obj));

        if moved > 0 {
            ee.enable_finalization(true);
        }

        moved
    }

    pub fn dump_summary(&self, runtime: f32) {
        self.controller.lock().dump_summary(runtime);
    }

    /// Reports `error` to the engine and terminates the process.
    pub fn fatal(&self, ee: &dyn GcToEe, error: FatalError) -> ! {
        ee.handle_fatal_error(error);
        fatal_error(error)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct HeapStats {
    pub used_bytes: [usize; GENERATIONS],
    pub pages: [usize; GENERATIONS],
    pub free_pages: usize,
    pub total_pages: usize,
}

impl HeapStats {
    pub fn total_used(&self) -> usize {
        self.used_bytes.iter().sum()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CollectorState {
    Idle = 0,
    SelectingCondemnedGeneration = 1,
    Suspending = 2,
    Marking = 3,
    Sweeping = 4,
    Compacting = 5,
    Restarting = 6,
}

impl From<u8> for CollectorState {
    fn from(value: u8) -> CollectorState {
        match value {
            0 => CollectorState::Idle,
            1 => CollectorState::SelectingCondemnedGeneration,
            2 => CollectorState::Suspending,
            3 => CollectorState::Marking,
            4 => CollectorState::Sweeping,
            5 => CollectorState::Compacting,
            6 => CollectorState::Restarting,
            _ => unreachable!("invalid collector state {}", value),
        }
    }
}

impl fmt::Display for CollectorState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            CollectorState::Idle => "idle",
            CollectorState::SelectingCondemnedGeneration => "selecting condemned generation",
            CollectorState::Suspending => "suspending",
            CollectorState::Marking => "marking",
            CollectorState::Sweeping => "sweeping",
            CollectorState::Compacting => "compacting",
            CollectorState::Restarting => "restarting",
        };

        write!(f, "{}", name)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct Address(usize);

impl Address {
    #[inline(always)]
    pub fn from(val: usize) -> Address {
        Address(val)
    }

    #[inline(always)]
    pub fn region_start(self, size: usize) -> Region {
        Region::new(self, self.offset(size))
    }

    #[inline(always)]
    pub fn offset_from(self, base: Address) -> usize {
        debug_assert!(self >= base);

        self.to_usize() - base.to_usize()
    }

    #[inline(always)]
    pub fn offset(self, offset: usize) -> Address {
        Address(self.0 + offset)
    }

    #[inline(always)]
    pub fn add_ptr(self, words: usize) -> Address {
        Address(self.0 + words * mem::ptr_width_usize())
    }

    #[inline(always)]
    pub fn to_obj(self) -> &'static crate::object::Obj {
        unsafe { &*self.to_mut_ptr::<crate::object::Obj>() }
    }

    #[inline(always)]
    pub fn to_usize(self) -> usize {
        self.0
    }

    #[inline(always)]
    pub fn from_ptr<T>(ptr: *const T) -> Address {
        Address(ptr as usize)
    }

    #[inline(always)]
    pub fn to_ptr<T>(&self) -> *const T {
        self.0 as *const T
    }

    #[inline(always)]
    pub fn to_mut_ptr<T>(&self) -> *mut T {
        self.0 as *const T as *mut T
    }

    #[inline(always)]
    pub fn null() -> Address {
        Address(0)
    }

    #[inline(always)]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub fn is_non_null(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:x}", self.to_usize())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:x}", self.to_usize())
    }
}

impl PartialOrd for Address {
    fn partial_cmp(&self, other: &Address) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Address {
    fn cmp(&self, other: &Address) -> Ordering {
        self.to_usize().cmp(&other.to_usize())
    }
}

impl From<usize> for Address {
    fn from(val: usize) -> Address {
        Address(val)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Region {
    pub start: Address,
    pub end: Address,
}

impl Region {
    pub fn new(start: Address, end: Address) -> Region {
        debug_assert!(start <= end);

        Region { start, end }
    }

    #[inline(always)]
    pub fn start(&self) -> Address {
        self.start
    }

    #[inline(always)]
    pub fn end(&self) -> Address {
        self.end
    }

    #[inline(always)]
    pub fn contains(&self, addr: Address) -> bool {
        self.start <= addr && addr < self.end
    }

    #[inline(always)]
    pub fn valid_top(&self, addr: Address) -> bool {
        self.start <= addr && addr <= self.end
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.end.to_usize() - self.start.to_usize()
    }

    #[inline(always)]
    pub fn empty(&self) -> bool {
        self.start == self.end
    }

    #[inline(always)]
    pub fn disjunct(&self, other: &Region) -> bool {
        self.end <= other.start || self.start >= other.end
    }

    #[inline(always)]
    pub fn overlaps(&self, other: &Region) -> bool {
        !self.disjunct(other)
    }

    #[inline(always)]
    pub fn fully_contains(&self, other: &Region) -> bool {
        self.contains(other.start) && self.valid_top(other.end)
    }
}

impl Default for Region {
    fn default() -> Region {
        Region {
            start: Address::null(),
            end: Address::null(),
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

pub struct FormattedSize {
    size: usize,
}

impl fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let ksize = (self.size as f64) / 1024f64;

        if ksize < 1f64 {
            return write!(f, "{}B", self.size);
        }

        let msize = ksize / 1024f64;

        if msize < 1f64 {
            return write!(f, "{:.1}K", ksize);
        }

        let gsize = msize / 1024f64;

        if gsize < 1f64 {
            write!(f, "{:.1}M", msize)
        } else {
            write!(f, "{:.1}G", gsize)
        }
    }
}

pub fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize { size }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GcReason {
    AllocationFailure,
    Induced,
    InducedCompacting,
    LowMemory,
    Stress,
    StressMinor,
}

impl GcReason {
    fn message(&self) -> &'static str {
        match self {
            GcReason::AllocationFailure => "alloc failure",
            GcReason::Induced => "induced",
            GcReason::InducedCompacting => "induced compacting",
            GcReason::LowMemory => "low memory",
            GcReason::Stress => "stress",
            GcReason::StressMinor => "stress minor",
        }
    }

    pub fn forces_compaction(&self) -> bool {
        matches!(self, GcReason::InducedCompacting | GcReason::LowMemory)
    }
}

impl fmt::Display for GcReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

struct CollectionStats {
    collections: usize,
    total_pause: f32,
    pauses: Vec<f32>,
}

impl CollectionStats {
    fn new() -> CollectionStats {
        CollectionStats {
            collections: 0,
            total_pause: 0f32,
            pauses: Vec::new(),
        }
    }

    fn add(&mut self, pause: f32) {
        self.collections += 1;
        self.total_pause += pause;
        self.pauses.push(pause);
    }

    fn pause(&self) -> f32 {
        self.total_pause
    }

    fn pauses(&self) -> AllNumbers {
        AllNumbers(self.pauses.clone())
    }

    fn collections(&self) -> usize {
        self.collections
    }
}

pub struct AllNumbers(Vec<f32>);

impl fmt::Display for AllNumbers {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[")?;
        let mut first = true;
        for num in &self.0 {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{:.1}", num)?;
            first = false;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_formatted_size() {
        assert_eq!("512B", formatted_size(512).to_string());
        assert_eq!("1.5K", formatted_size(1536).to_string());
        assert_eq!("64.0M", formatted_size(64 * M).to_string());
        assert_eq!("2.0G", formatted_size(2 * K * M).to_string());
    }

    #[test]
    fn test_region() {
        let region = Region::new(Address::from(0x1000), Address::from(0x2000));
        assert_eq!(0x1000, region.size());
        assert!(region.contains(Address::from(0x1fff)));
        assert!(!region.contains(Address::from(0x2000)));
        assert!(region.valid_top(Address::from(0x2000)));

        let other = Address::from(0x2000).region_start(0x100);
        assert!(region.disjunct(&other));
        assert!(!region.overlaps(&other));
    }

    #[test]
    fn test_collector_state() {
        for state in [
            CollectorState::Idle,
            CollectorState::Marking,
            CollectorState::Restarting,
        ] {
            assert_eq!(state, CollectorState::from(state as u8));
        }

        assert_eq!("sweeping", CollectorState::Sweeping.to_string());
    }

    #[test]
    fn test_all_numbers() {
        assert_eq!("[1.0,2.5]", AllNumbers(vec![1.0, 2.5]).to_string());
        assert_eq!("[]", AllNumbers(Vec::new()).to_string());
    }
}
