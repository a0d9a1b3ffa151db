//! A stop-the-world, generational mark/sweep/compact collector.
//!
//! The collector talks to its host only through [`GcToEe`]. [`Vm`] is a
//! small execution engine implementing it, used by the tests and the
//! `gengc` driver.

mod error;
mod flags;
mod gc;
mod interface;
mod mem;
mod object;
mod os;
mod safepoint;
mod threads;
mod timer;
mod vm;

pub use crate::error::{fatal_error, FatalError, GcError};
pub use crate::flags::{CompactionMode, GcFlags, MemSize};
pub use crate::gc::handles::{HandleKind, ObjectHandle};
pub use crate::gc::heap::{GENERATIONS, LARGE_OBJECT_SIZE, MAX_GENERATION, PAGE_SIZE};
pub use crate::gc::pinning::{PinStats, PinType};
pub use crate::gc::root::{PromoteFlags, PromoteFn, ScanContext, Slot};
pub use crate::gc::tlab::AllocationContext;
pub use crate::gc::{
    formatted_size, Address, CollectorState, Gc, GcReason, HeapStats, Region, K, M,
};
pub use crate::interface::{GcConfig, GcToEe, SuspendReason, SurvivorRecord};
pub use crate::object::{Obj, ObjectKind, TypeDescriptor, TypeRef};
pub use crate::safepoint::{Coordinator, SuspendState};
pub use crate::threads::{MutatorThread, ThreadState, Threads};
pub use crate::timer::Timer;
pub use crate::vm::{GcEvent, Local, Mutator, StaticRoot, Vm, VmConfig};
