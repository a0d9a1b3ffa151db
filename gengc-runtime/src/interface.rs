//! Calls the collector makes into the execution engine.
//!
//! The engine implements [`GcToEe`] once and passes it to every collector
//! entry point. Everything the collector needs to know about threads,
//! stacks and configuration goes through this trait.

use std::fmt;
use std::sync::Arc;

use crate::error::{FatalError, GcError};
use crate::gc::root::{PromoteFn, ScanContext};
use crate::gc::tlab::AllocationContext;
use crate::gc::{Address, GcReason};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SuspendReason {
    ForGc,
}

impl fmt::Display for SuspendReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SuspendReason::ForGc => write!(f, "suspend for gc"),
        }
    }
}

/// One moved or kept survivor, reported after compaction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SurvivorRecord {
    pub old: Address,
    pub new: Address,
    pub size: usize,
}

/// Opaque key-value configuration. Missing keys are `None`; the collector
/// decides on defaults.
pub trait GcConfig {
    fn get_boolean_config_value(&self, key: &str) -> Option<bool>;

    fn get_int_config_value(&self, key: &str) -> Option<i64>;

    fn get_string_config_value(&self, key: &str) -> Option<String>;
}

pub trait GcToEe: GcConfig + Sync {
    /// Blocks until every mutator is at a safe point or in preemptive
    /// mode. An error leaves all threads running.
    fn suspend_ee(&self, reason: SuspendReason) -> Result<(), GcError>;

    /// `finished_gc` is false when the cycle was abandoned before marking.
    fn restart_ee(&self, finished_gc: bool);

    /// Reports every root slot of every thread and all static data.
    fn scan_roots(&self, promote: PromoteFn<'_>, sc: &ScanContext);

    fn after_scan_roots(&self, _sc: &ScanContext) {}

    /// context of the calling thread, if it is a mutator
    fn get_alloc_context(&self) -> Option<Arc<AllocationContext>>;

    fn for_each_alloc_context(&self, f: &mut dyn FnMut(&AllocationContext));

    /// true if the calling thread is in cooperative mode
    fn is_preemptive_gc_disabled(&self) -> bool;

    /// Switches the calling thread to preemptive mode. Returns false if it
    /// already was or is no mutator.
    fn enable_preemptive_gc(&self) -> bool;

    fn disable_preemptive_gc(&self);

    fn diag_gc_start(&self, _gc_index: usize, _condemned: usize, _reason: GcReason) {}

    fn diag_gc_end(&self, _gc_index: usize, _condemned: usize, _reason: GcReason) {}

    /// gates the survivor walk, which costs a pass over all survivors
    fn wants_survivor_walk(&self) -> bool {
        false
    }

    fn diag_walk_survivors(&self, _survivors: &[SurvivorRecord]) {}

    fn gc_done(&self, _condemned: usize) {}

    /// asked for every registered object during `Gc::finalize_all_for_unload`
    fn should_finalize_object_for_unload(&self, _obj: Address) -> bool {
        true
    }

    /// true if the engine already ran the finalizer of this unreachable object
    fn eager_finalized(&self, _obj: Address) -> bool {
        false
    }

    /// wakes the finalizer thread after a collection found work for it
    fn enable_finalization(&self, _found_finalizers: bool) {}

    fn handle_fatal_error(&self, _error: FatalError) {}
}
