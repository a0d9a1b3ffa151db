use std::cell::{Cell, RefCell};
use std::convert::From;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::gc::root::{PromoteFlags, Slot};
use crate::gc::tlab::AllocationContext;
use crate::gc::Address;

thread_local! {
    static THREAD: RefCell<Option<Arc<MutatorThread>>> = const { RefCell::new(None) };
}

/// the mutator attached to the calling OS thread
pub fn current_thread() -> Option<Arc<MutatorThread>> {
    THREAD.with(|thread| thread.borrow().clone())
}

pub fn init_current_thread(thread: Arc<MutatorThread>) {
    THREAD.with(|thread_local| {
        let mut current = thread_local.borrow_mut();
        assert!(current.is_none(), "thread already attached");
        *current = Some(thread);
    });
}

pub fn deinit_current_thread() {
    THREAD.with(|thread| {
        thread.borrow_mut().take();
    });
}

pub struct Threads {
    threads: Mutex<ThreadList>,
    cv_join: Condvar,
    cv_resumed: Condvar,

    next_thread_id: AtomicUsize,

    pub barrier: Barrier,
}

struct ThreadList {
    threads: Vec<Arc<MutatorThread>>,
    // set while the world is stopped, the list must not change then
    suspended: bool,
}

impl Threads {
    pub fn new() -> Threads {
        Threads {
            threads: Mutex::new(ThreadList {
                threads: Vec::new(),
                suspended: false,
            }),
            cv_join: Condvar::new(),
            cv_resumed: Condvar::new(),
            next_thread_id: AtomicUsize::new(1),
            barrier: Barrier::new(),
        }
    }

    pub fn next_thread_id(&self) -> usize {
        self.next_thread_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn add_thread(&self, thread: Arc<MutatorThread>) {
        assert!(thread.is_parked());
        let mut list = self.threads.lock();

        while list.suspended {
            self.cv_resumed.wait(&mut list);
        }

        list.threads.push(thread);
    }

    pub fn remove_thread(&self, thread: &MutatorThread) {
        assert!(thread.is_parked());
        let mut list = self.threads.lock();

        while list.suspended {
            self.cv_resumed.wait(&mut list);
        }

        let idx = list
            .threads
            .iter()
            .position(|t| t.id() == thread.id())
            .expect("thread not registered");
        list.threads.swap_remove(idx);
        self.cv_join.notify_all();
    }

    pub fn len(&self) -> usize {
        self.threads.lock().threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Freezes the thread list and returns it.
    pub fn freeze(&self) -> Vec<Arc<MutatorThread>> {
        let mut list = self.threads.lock();
        assert!(!list.suspended);
        list.suspended = true;
        list.threads.clone()
    }

    pub fn unfreeze(&self) {
        let mut list = self.threads.lock();
        assert!(list.suspended);
        list.suspended = false;
        self.cv_resumed.notify_all();
    }

    pub fn each<F>(&self, mut f: F)
    where
        F: FnMut(usize, &Arc<MutatorThread>),
    {
        let list = self.threads.lock();

        for (idx, thread) in list.threads.iter().enumerate() {
            f(idx, thread);
        }
    }

    pub fn join_all(&self) {
        let mut list = self.threads.lock();

        while !list.threads.is_empty() {
            self.cv_join.wait(&mut list);
        }
    }
}

impl Default for Threads {
    fn default() -> Threads {
        Threads::new()
    }
}

/// A root slot owned by a mutator. Boxed so the slot address stays stable
/// while the root stack grows.
pub struct RootCell {
    value: Box<Cell<Address>>,
    flags: PromoteFlags,
}

impl RootCell {
    pub fn new(value: Address, flags: PromoteFlags) -> RootCell {
        RootCell {
            value: Box::new(Cell::new(value)),
            flags,
        }
    }

    pub fn slot(&self) -> Slot {
        Slot::at(Address::from_ptr(self.value.as_ptr()))
    }

    pub fn flags(&self) -> PromoteFlags {
        self.flags
    }
}

/// Shadow stack of a mutator: every local that holds a reference.
pub struct RootStack {
    cells: Vec<RootCell>,
}

impl RootStack {
    pub fn new() -> RootStack {
        RootStack { cells: Vec::new() }
    }

    pub fn push(&mut self, value: Address, flags: PromoteFlags) -> usize {
        self.cells.push(RootCell::new(value, flags));
        self.cells.len() - 1
    }

    pub fn get(&self, idx: usize) -> Address {
        self.cells[idx].slot().get()
    }

    pub fn set(&mut self, idx: usize, value: Address) {
        self.cells[idx].slot().set(value);
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn truncate(&mut self, len: usize) {
        self.cells.truncate(len);
    }

    pub fn cells(&self) -> &[RootCell] {
        &self.cells
    }
}

impl Default for RootStack {
    fn default() -> RootStack {
        RootStack::new()
    }
}

pub struct MutatorThread {
    id: usize,
    state: AtomicU8,
    context: Arc<AllocationContext>,
    roots: Mutex<RootStack>,
}

impl MutatorThread {
    pub fn new(id: usize) -> Arc<MutatorThread> {
        Arc::new(MutatorThread {
            id,
            state: AtomicU8::new(ThreadState::Parked as u8),
            context: Arc::new(AllocationContext::new(id)),
            roots: Mutex::new(RootStack::new()),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn context(&self) -> &Arc<AllocationContext> {
        &self.context
    }

    pub fn roots(&self) -> &Mutex<RootStack> {
        &self.roots
    }

    pub fn state(&self) -> ThreadState {
        self.state.load(Ordering::SeqCst).into()
    }

    pub(crate) fn state_word(&self) -> &AtomicU8 {
        &self.state
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    pub fn is_parked(&self) -> bool {
        self.state().is_parked()
    }

    /// true if a suspension waits for this thread
    pub fn safepoint_requested(&self) -> bool {
        self.state() == ThreadState::SafepointRequested
    }

    /// Running -> Parked: the thread may run but not touch the heap.
    pub fn park(&self, barrier: &Barrier) {
        if self
            .state
            .compare_exchange(
                ThreadState::Running as u8,
                ThreadState::Parked as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            self.park_slow(barrier);
        }
    }

    fn park_slow(&self, barrier: &Barrier) {
        assert!(self
            .state
            .compare_exchange(
                ThreadState::SafepointRequested as u8,
                ThreadState::ParkedSafepointRequested as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok());
        barrier.notify_park();
    }

    /// Parked -> Running, waits while the world is stopped.
    pub fn unpark(&self, barrier: &Barrier) {
        if self
            .state
            .compare_exchange(
                ThreadState::Parked as u8,
                ThreadState::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            self.unpark_slow(barrier);
        }
    }

    fn unpark_slow(&self, barrier: &Barrier) {
        loop {
            match self.state.compare_exchange(
                ThreadState::Parked as u8,
                ThreadState::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(state) => {
                    assert_eq!(state, ThreadState::ParkedSafepointRequested as u8);
                    barrier.wait_in_unpark();
                }
            }
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ThreadState {
    Running = 0,
    Parked = 1,
    SafepointRequested = 2,
    ParkedSafepointRequested = 3,
    Safepoint = 4,
}

impl From<u8> for ThreadState {
    fn from(value: u8) -> ThreadState {
        match value {
            0 => ThreadState::Running,
            1 => ThreadState::Parked,
            2 => ThreadState::SafepointRequested,
            3 => ThreadState::ParkedSafepointRequested,
            4 => ThreadState::Safepoint,
            _ => unreachable!(),
        }
    }
}

impl ThreadState {
    pub fn is_running(&self) -> bool {
        matches!(*self, ThreadState::Running | ThreadState::SafepointRequested)
    }

    pub fn is_parked(&self) -> bool {
        matches!(
            *self,
            ThreadState::Parked | ThreadState::ParkedSafepointRequested
        )
    }
}

impl Default for ThreadState {
    fn default() -> ThreadState {
        ThreadState::Running
    }
}

pub struct Barrier {
    data: Mutex<BarrierData>,
    cv_wakeup: Condvar,
    cv_notify: Condvar,
}

impl Barrier {
    pub fn new() -> Barrier {
        Barrier {
            data: Mutex::new(BarrierData::new()),
            cv_wakeup: Condvar::new(),
            cv_notify: Condvar::new(),
        }
    }

    pub fn is_armed(&self) -> bool {
        self.data.lock().is_armed()
    }

    pub fn arm(&self) {
        let mut data = self.data.lock();
        assert!(!data.is_armed());
        data.arm();
    }

    pub fn disarm(&self) {
        let mut data = self.data.lock();
        assert!(data.is_armed());
        data.disarm();
        self.cv_wakeup.notify_all();
    }

    pub fn notify_park(&self) {
        let mut data = self.data.lock();
        assert!(data.is_armed());
        data.stopped += 1;
        self.cv_notify.notify_one();
    }

    pub fn wait_in_safepoint(&self) {
        let mut data = self.data.lock();
        assert!(data.is_armed());
        data.stopped += 1;
        self.cv_notify.notify_one();

        while data.is_armed() {
            self.cv_wakeup.wait(&mut data);
        }
    }

    pub fn wait_in_unpark(&self) {
        let mut data = self.data.lock();

        while data.is_armed() {
            self.cv_wakeup.wait(&mut data);
        }
    }

    pub fn wait_until_threads_stopped(&self, threads: usize) {
        let mut data = self.data.lock();
        assert!(data.is_armed());
        while data.stopped < threads {
            self.cv_notify.wait(&mut data);
        }
        assert_eq!(data.stopped, threads);
    }
}

impl Default for Barrier {
    fn default() -> Barrier {
        Barrier::new()
    }
}

struct BarrierData {
    armed: bool,
    stopped: usize,
}

impl BarrierData {
    fn new() -> BarrierData {
        BarrierData {
            armed: false,
            stopped: 0,
        }
    }

    fn is_armed(&self) -> bool {
        self.armed
    }

    fn arm(&mut self) {
        self.stopped = 0;
        self.armed = true;
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_park_unpark() {
        let barrier = Barrier::new();
        let thread = MutatorThread::new(1);
        assert!(thread.is_parked());

        thread.unpark(&barrier);
        assert_eq!(ThreadState::Running, thread.state());

        thread.park(&barrier);
        assert_eq!(ThreadState::Parked, thread.state());
    }

    #[test]
    fn test_park_with_pending_safepoint() {
        let barrier = Barrier::new();
        let thread = MutatorThread::new(1);
        thread.unpark(&barrier);

        barrier.arm();
        thread
            .state_word()
            .fetch_or(ThreadState::SafepointRequested as u8, Ordering::SeqCst);

        thread.park(&barrier);
        assert_eq!(ThreadState::ParkedSafepointRequested, thread.state());
        barrier.wait_until_threads_stopped(1);
        barrier.disarm();
    }

    #[test]
    fn test_root_stack() {
        let mut roots = RootStack::new();
        let a = roots.push(Address::from(0x100), PromoteFlags::NONE);
        let b = roots.push(Address::from(0x200), PromoteFlags::PINNED);
        let slot = roots.cells()[a].slot();

        // growing the stack keeps earlier slots in place
        for _ in 0..64 {
            roots.push(Address::null(), PromoteFlags::NONE);
        }

        assert_eq!(slot, roots.cells()[a].slot());
        slot.set(Address::from(0x300));
        assert_eq!(Address::from(0x300), roots.get(a));
        assert!(roots.cells()[b].flags().is_pinning());

        roots.truncate(1);
        assert_eq!(1, roots.len());
    }

    #[test]
    fn test_thread_list() {
        let threads = Threads::new();
        let first = MutatorThread::new(threads.next_thread_id());
        let second = MutatorThread::new(threads.next_thread_id());
        threads.add_thread(first.clone());
        threads.add_thread(second.clone());
        assert_eq!(2, threads.len());

        let frozen = threads.freeze();
        assert_eq!(2, frozen.len());
        threads.unfreeze();

        threads.remove_thread(&first);
        threads.remove_thread(&second);
        threads.join_all();
        assert!(threads.is_empty());
    }
}
