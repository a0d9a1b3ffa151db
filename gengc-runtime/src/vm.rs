//! Reference execution engine: mutator threads with shadow stacks, static
//! roots and a cooperative suspension protocol, wired to the collector
//! through [`GcToEe`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{FatalError, GcError};
use crate::flags::GcFlags;
use crate::gc::handles::{HandleKind, ObjectHandle};
use crate::gc::root::{PromoteFlags, PromoteFn, ScanContext};
use crate::gc::tlab::AllocationContext;
use crate::gc::{Address, Gc, GcReason};
use crate::interface::{GcConfig, GcToEe, SuspendReason, SurvivorRecord};
use crate::object::TypeRef;
use crate::safepoint::Coordinator;
use crate::threads::{
    current_thread, deinit_current_thread, init_current_thread, MutatorThread, RootStack,
    Threads,
};

/// String key-value configuration, typed on lookup.
#[derive(Clone, Debug, Default)]
pub struct VmConfig {
    values: HashMap<String, String>,
}

impl VmConfig {
    pub fn new() -> VmConfig {
        VmConfig::default()
    }

    pub fn set(mut self, key: &str, value: impl ToString) -> VmConfig {
        self.values.insert(key.into(), value.to_string());
        self
    }
}

impl GcConfig for VmConfig {
    fn get_boolean_config_value(&self, key: &str) -> Option<bool> {
        match self.values.get(key)?.as_str() {
            "1" | "true" => Some(true),
            "0" | "false" => Some(false),
            _ => None,
        }
    }

    fn get_int_config_value(&self, key: &str) -> Option<i64> {
        self.values.get(key)?.parse().ok()
    }

    fn get_string_config_value(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

/// One entry of the diagnostic event stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GcEvent {
    Start {
        gc_index: usize,
        condemned: usize,
        reason: GcReason,
    },
    End {
        gc_index: usize,
        condemned: usize,
        reason: GcReason,
    },
}

pub struct Vm {
    pub gc: Gc,
    pub threads: Threads,
    pub coordinator: Coordinator,
    config: VmConfig,

    statics: Mutex<RootStack>,

    events: Mutex<Vec<GcEvent>>,
    survivor_walk: AtomicBool,
    survivors_reported: AtomicUsize,
    finalizer_wakeups: AtomicUsize,
    fatal: Mutex<Option<FatalError>>,
}

impl Vm {
    pub fn new(flags: GcFlags) -> Result<Arc<Vm>, GcError> {
        Vm::build(flags, VmConfig::new())
    }

    /// Reads the collector flags from `config`.
    pub fn from_config(config: VmConfig) -> Result<Arc<Vm>, GcError> {
        let flags = GcFlags::from_config(&config)?;
        Vm::build(flags, config)
    }

    fn build(flags: GcFlags, config: VmConfig) -> Result<Arc<Vm>, GcError> {
        Ok(Arc::new(Vm {
            gc: Gc::new(flags)?,
            threads: Threads::new(),
            coordinator: Coordinator::new(),
            config,

            statics: Mutex::new(RootStack::new()),

            events: Mutex::new(Vec::new()),
            survivor_walk: AtomicBool::new(false),
            survivors_reported: AtomicUsize::new(0),
            finalizer_wakeups: AtomicUsize::new(0),
            fatal: Mutex::new(None),
        }))
    }

    /// Registers the calling OS thread as a mutator. The thread starts out
    /// in cooperative mode.
    pub fn attach_current_thread(self: &Arc<Vm>) -> Mutator {
        let thread = MutatorThread::new(self.threads.next_thread_id());
        self.threads.add_thread(thread.clone());
        init_current_thread(thread.clone());
        thread.unpark(&self.threads.barrier);

        log::trace!("thread {} attached", thread.id());

        Mutator {
            vm: self.clone(),
            thread,
        }
    }

    pub fn collect(&self, generation: Option<usize>, reason: GcReason) -> Result<(), GcError> {
        self.gc.collect(self, generation, reason)
    }

    pub fn add_static(&self, value: Address) -> StaticRoot {
        StaticRoot(self.statics.lock().push(value, PromoteFlags::STATIC))
    }

    /// A static the collector must not move, like a pinned data segment.
    pub fn add_pinned_static(&self, value: Address) -> StaticRoot {
        StaticRoot(
            self.statics
                .lock()
                .push(value, PromoteFlags::STATIC | PromoteFlags::PINNED),
        )
    }

    pub fn static_value(&self, root: StaticRoot) -> Address {
        self.statics.lock().get(root.0)
    }

    pub fn set_static(&self, root: StaticRoot, value: Address) {
        self.statics.lock().set(root.0, value);
    }

    pub fn set_survivor_walk(&self, enabled: bool) {
        self.survivor_walk.store(enabled, Ordering::Relaxed);
    }

    pub fn survivors_reported(&self) -> usize {
        self.survivors_reported.load(Ordering::Relaxed)
    }

    pub fn events(&self) -> Vec<GcEvent> {
        self.events.lock().clone()
    }

    pub fn finalizer_wakeups(&self) -> usize {
        self.finalizer_wakeups.load(Ordering::Relaxed)
    }

    pub fn fatal_error(&self) -> Option<FatalError> {
        *self.fatal.lock()
    }

    /// Runs `finalize` for every object whose finalizer is due.
    pub fn run_finalizers<F>(&self, mut finalize: F) -> usize
    where
        F: FnMut(Address),
    {
        let objects = self.gc.drain_finalizable();

        for &obj in &objects {
            finalize(obj);
        }

        objects.len()
    }

    /// Queues the finalizers of all remaining objects and runs them.
    pub fn shutdown<F>(&self, finalize: F) -> usize
    where
        F: FnMut(Address),
    {
        self.gc.finalize_all_for_unload(self);
        self.run_finalizers(finalize)
    }
}

impl GcConfig for Vm {
    fn get_boolean_config_value(&self, key: &str) -> Option<bool> {
        self.config.get_boolean_config_value(key)
    }

    fn get_int_config_value(&self, key: &str) -> Option<i64> {
        self.config.get_int_config_value(key)
    }

    fn get_string_config_value(&self, key: &str) -> Option<String> {
        self.config.get_string_config_value(key)
    }
}

impl GcToEe for Vm {
    fn suspend_ee(&self, reason: SuspendReason) -> Result<(), GcError> {
        self.coordinator.suspend(&self.threads, reason)
    }

    fn restart_ee(&self, finished_gc: bool) {
        self.coordinator.restart(&self.threads, finished_gc);
    }

    fn scan_roots(&self, promote: PromoteFn<'_>, sc: &ScanContext) {
        {
            let statics = self.statics.lock();
            let sc = sc.for_thread(0);

            for cell in statics.cells() {
                promote(&sc, cell.slot(), cell.flags());
            }
        }

        self.threads.each(|idx, thread| {
            let roots = thread.roots().lock();
            let sc = sc.for_thread(idx + 1);

            for cell in roots.cells() {
                promote(&sc, cell.slot(), cell.flags());
            }
        });
    }

    fn get_alloc_context(&self) -> Option<Arc<AllocationContext>> {
        current_thread().map(|thread| thread.context().clone())
    }

    fn for_each_alloc_context(&self, f: &mut dyn FnMut(&AllocationContext)) {
        self.threads.each(|_, thread| f(thread.context()));
    }

    fn is_preemptive_gc_disabled(&self) -> bool {
        current_thread().is_some_and(|thread| thread.is_running())
    }

    fn enable_preemptive_gc(&self) -> bool {
        match current_thread() {
            Some(thread) if thread.is_running() => {
                thread.park(&self.threads.barrier);
                true
            }
            _ => false,
        }
    }

    fn disable_preemptive_gc(&self) {
        if let Some(thread) = current_thread() {
            thread.unpark(&self.threads.barrier);
        }
    }

    fn diag_gc_start(&self, gc_index: usize, condemned: usize, reason: GcReason) {
        self.coordinator.begin_collection();
        self.events.lock().push(GcEvent::Start {
            gc_index,
            condemned,
            reason,
        });
    }

    fn diag_gc_end(&self, gc_index: usize, condemned: usize, reason: GcReason) {
        self.events.lock().push(GcEvent::End {
            gc_index,
            condemned,
            reason,
        });
    }

    fn wants_survivor_walk(&self) -> bool {
        self.survivor_walk.load(Ordering::Relaxed)
    }

    fn diag_walk_survivors(&self, survivors: &[SurvivorRecord]) {
        self.survivors_reported
            .fetch_add(survivors.len(), Ordering::Relaxed);
    }

    fn enable_finalization(&self, found_finalizers: bool) {
        if found_finalizers {
            self.finalizer_wakeups.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn handle_fatal_error(&self, error: FatalError) {
        log::error!("execution engine stopping: {}", error);
        *self.fatal.lock() = Some(error);
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StaticRoot(usize);

/// A root slot on the shadow stack of a mutator.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Local(usize);

/// Handle of an attached mutator thread. Addresses read through a mutator
/// are valid until its next allocation or safe point; keep references in
/// locals across those.
pub struct Mutator {
    vm: Arc<Vm>,
    thread: Arc<MutatorThread>,
}

impl Mutator {
    pub fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }

    pub fn thread(&self) -> &Arc<MutatorThread> {
        &self.thread
    }

    pub fn context(&self) -> &AllocationContext {
        self.thread.context()
    }

    /// Allocates an object and roots it in a new local.
    pub fn alloc(&self, ty: TypeRef) -> Result<Local, GcError> {
        self.safepoint();
        let obj = self.vm.gc.alloc(&*self.vm, self.context(), ty)?;
        Ok(self.local(obj))
    }

    pub fn alloc_array(&self, ty: TypeRef, length: usize) -> Result<Local, GcError> {
        self.safepoint();
        let obj = self
            .vm
            .gc
            .alloc_array(&*self.vm, self.context(), ty, length)?;
        Ok(self.local(obj))
    }

    pub fn local(&self, value: Address) -> Local {
        self.root(value, PromoteFlags::NONE)
    }

    /// a local whose target never moves
    pub fn pinned_local(&self, value: Address) -> Local {
        self.root(value, PromoteFlags::PINNED)
    }

    /// a word that may or may not be a reference
    pub fn conservative_local(&self, word: usize) -> Local {
        self.root(Address::from(word), PromoteFlags::CONSERVATIVE)
    }

    /// a pointer into the middle of an object
    pub fn interior_local(&self, value: Address) -> Local {
        self.root(value, PromoteFlags::INTERIOR)
    }

    fn root(&self, value: Address, flags: PromoteFlags) -> Local {
        Local(self.thread.roots().lock().push(value, flags))
    }

    pub fn get(&self, local: Local) -> Address {
        self.thread.roots().lock().get(local.0)
    }

    pub fn set(&self, local: Local, value: Address) {
        self.thread.roots().lock().set(local.0, value);
    }

    /// Runs `f` and drops all locals it created.
    pub fn scope<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&Mutator) -> R,
    {
        let mark = self.thread.roots().lock().len();
        let result = f(self);
        self.thread.roots().lock().truncate(mark);
        result
    }

    pub fn load_field(&self, holder: Local, idx: usize) -> Address {
        self.get(holder).to_obj().field(idx).get()
    }

    pub fn store_field(&self, holder: Local, idx: usize, value: Address) {
        let holder = self.get(holder);
        holder.to_obj().field(idx).set(value);
        self.vm.gc.write_barrier(self.context(), holder, value);
    }

    pub fn load_element(&self, array: Local, idx: usize) -> Address {
        self.get(array).to_obj().element(idx).get()
    }

    pub fn store_element(&self, array: Local, idx: usize, value: Address) {
        let array = self.get(array);
        array.to_obj().element(idx).set(value);
        self.vm.gc.write_barrier(self.context(), array, value);
    }

    /// Stops here if a suspension is pending.
    pub fn safepoint(&self) {
        if self.thread.safepoint_requested() {
            self.vm
                .coordinator
                .catch_at_safe_point(&self.vm.threads, &self.thread);
        }
    }

    /// Runs `f` in preemptive mode: collections may run meanwhile, so `f`
    /// must not touch the heap.
    pub fn enter_native<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        self.thread.park(&self.vm.threads.barrier);
        let result = f();
        self.thread.unpark(&self.vm.threads.barrier);
        result
    }

    pub fn collect(&self, generation: Option<usize>, reason: GcReason) -> Result<(), GcError> {
        self.vm.collect(generation, reason)
    }

    pub fn create_handle(&self, local: Local, kind: HandleKind) -> ObjectHandle {
        self.vm.gc.create_handle(self.get(local), kind)
    }

    pub fn handle_target(&self, handle: ObjectHandle) -> Option<Local> {
        let target = self.vm.gc.handle_target(handle);
        target.is_non_null().then(|| self.local(target))
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        let barrier = &self.vm.threads.barrier;

        if !self.thread.is_running() {
            self.thread.unpark(barrier);
        }

        self.vm.gc.retire_context(self.context());
        self.thread.park(barrier);
        self.vm.threads.remove_thread(&self.thread);
        deinit_current_thread();

        log::trace!("thread {} detached", self.thread.id());
    }
}
