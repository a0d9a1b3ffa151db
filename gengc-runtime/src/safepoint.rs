use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::GcError;
use crate::interface::SuspendReason;
use crate::threads::{MutatorThread, ThreadState, Threads};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SuspendState {
    Running = 0,
    SuspendRequested = 1,
    AllThreadsSuspended = 2,
    CollectionInProgress = 3,
    RestartRequested = 4,
}

impl From<u8> for SuspendState {
    fn from(value: u8) -> SuspendState {
        match value {
            0 => SuspendState::Running,
            1 => SuspendState::SuspendRequested,
            2 => SuspendState::AllThreadsSuspended,
            3 => SuspendState::CollectionInProgress,
            4 => SuspendState::RestartRequested,
            _ => unreachable!(),
        }
    }
}

impl fmt::Display for SuspendState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            SuspendState::Running => "running",
            SuspendState::SuspendRequested => "suspend requested",
            SuspendState::AllThreadsSuspended => "all threads suspended",
            SuspendState::CollectionInProgress => "collection in progress",
            SuspendState::RestartRequested => "restart requested",
        };

        f.write_str(name)
    }
}

/// Brings every mutator to a safe point and back. Mutators in the
/// `Parked` state (preemptive mode) count as stopped right away; running
/// mutators stop the next time they poll.
pub struct Coordinator {
    state: AtomicU8,
    stopped: Mutex<Vec<Arc<MutatorThread>>>,
    suspensions: AtomicUsize,
    injected_failures: AtomicUsize,
}

impl Coordinator {
    pub fn new() -> Coordinator {
        Coordinator {
            state: AtomicU8::new(SuspendState::Running as u8),
            stopped: Mutex::new(Vec::new()),
            suspensions: AtomicUsize::new(0),
            injected_failures: AtomicUsize::new(0),
        }
    }

    pub fn state(&self) -> SuspendState {
        self.state.load(Ordering::Acquire).into()
    }

    fn transition(&self, from: SuspendState, to: SuspendState) {
        let old: SuspendState = self.state.swap(to as u8, Ordering::AcqRel).into();
        assert_eq!(old, from, "invalid suspension transition to {}", to);
    }

    /// number of completed suspensions
    pub fn suspensions(&self) -> usize {
        self.suspensions.load(Ordering::Relaxed)
    }

    /// Makes the next `count` suspensions fail before any thread is
    /// touched.
    pub fn inject_failures(&self, count: usize) {
        self.injected_failures.store(count, Ordering::Relaxed);
    }

    /// Blocks until all registered mutators are stopped.
    pub fn suspend(&self, threads: &Threads, reason: SuspendReason) -> Result<(), GcError> {
        if self.state() != SuspendState::Running {
            return Err(GcError::SuspendFailed(format!(
                "cannot suspend, threads are {}",
                self.state()
            )));
        }

        if self
            .injected_failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(GcError::SuspendFailed("injected failure".into()));
        }

        self.transition(SuspendState::Running, SuspendState::SuspendRequested);
        log::trace!("{}", reason);

        let list = threads.freeze();
        self.trap_returning_threads(threads, true);

        let mut running = 0;

        for thread in &list {
            let current_state = thread
                .state_word()
                .fetch_or(ThreadState::SafepointRequested as u8, Ordering::SeqCst);

            if current_state == ThreadState::Running as u8 {
                running += 1;
            } else {
                assert_eq!(current_state, ThreadState::Parked as u8);
            }
        }

        threads.barrier.wait_until_threads_stopped(running);

        *self.stopped.lock() = list;
        self.suspensions.fetch_add(1, Ordering::Relaxed);
        self.transition(
            SuspendState::SuspendRequested,
            SuspendState::AllThreadsSuspended,
        );

        Ok(())
    }

    pub fn begin_collection(&self) {
        self.transition(
            SuspendState::AllThreadsSuspended,
            SuspendState::CollectionInProgress,
        );
    }

    /// Lets the stopped mutators continue. A restart without a preceding
    /// suspension does nothing.
    pub fn restart(&self, threads: &Threads, finished_gc: bool) {
        let state = self.state();

        match state {
            SuspendState::Running => return,
            SuspendState::AllThreadsSuspended | SuspendState::CollectionInProgress => {
                self.transition(state, SuspendState::RestartRequested)
            }
            _ => panic!("restart while {}", state),
        }

        if !finished_gc {
            log::debug!("resuming threads after abandoned collection");
        }

        let list = std::mem::take(&mut *self.stopped.lock());

        for thread in &list {
            let old_state: ThreadState = thread
                .state_word()
                .swap(ThreadState::Parked as u8, Ordering::SeqCst)
                .into();

            assert!(
                old_state == ThreadState::Safepoint
                    || old_state == ThreadState::ParkedSafepointRequested
            );
        }

        self.trap_returning_threads(threads, false);
        threads.unfreeze();

        self.transition(SuspendState::RestartRequested, SuspendState::Running);
    }

    /// While trapping, threads leaving preemptive mode block until the
    /// world is restarted.
    pub fn trap_returning_threads(&self, threads: &Threads, trap: bool) {
        if trap {
            threads.barrier.arm();
        } else {
            threads.barrier.disarm();
        }
    }

    /// Called by a mutator that polled and found a pending suspension.
    /// Blocks until the world restarts.
    pub fn catch_at_safe_point(&self, threads: &Threads, thread: &MutatorThread) {
        let state: ThreadState = thread
            .state_word()
            .swap(ThreadState::Safepoint as u8, Ordering::SeqCst)
            .into();
        assert_eq!(state, ThreadState::SafepointRequested);
        threads.barrier.wait_in_safepoint();
        thread.unpark(&threads.barrier);
    }
}

impl Default for Coordinator {
    fn default() -> Coordinator {
        Coordinator::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    #[test]
    fn test_suspend_parked_threads() {
        let threads = Threads::new();
        let coordinator = Coordinator::new();
        let mutator = MutatorThread::new(threads.next_thread_id());
        threads.add_thread(mutator.clone());

        coordinator
            .suspend(&threads, SuspendReason::ForGc)
            .expect("suspension failed");
        assert_eq!(SuspendState::AllThreadsSuspended, coordinator.state());
        assert_eq!(ThreadState::ParkedSafepointRequested, mutator.state());

        coordinator.begin_collection();
        coordinator.restart(&threads, true);
        assert_eq!(SuspendState::Running, coordinator.state());
        assert_eq!(ThreadState::Parked, mutator.state());
        assert_eq!(1, coordinator.suspensions());
    }

    #[test]
    fn test_restart_without_suspension() {
        let threads = Threads::new();
        let coordinator = Coordinator::new();
        coordinator.restart(&threads, false);
        assert_eq!(SuspendState::Running, coordinator.state());
    }

    #[test]
    fn test_injected_failure() {
        let threads = Threads::new();
        let coordinator = Coordinator::new();
        coordinator.inject_failures(1);

        assert!(coordinator.suspend(&threads, SuspendReason::ForGc).is_err());
        assert_eq!(SuspendState::Running, coordinator.state());
        assert!(!threads.barrier.is_armed());

        coordinator
            .suspend(&threads, SuspendReason::ForGc)
            .expect("suspension failed");
        coordinator.restart(&threads, false);
    }

    #[test]
    fn test_catch_running_thread() {
        let threads = Arc::new(Threads::new());
        let coordinator = Arc::new(Coordinator::new());
        let mutator = MutatorThread::new(threads.next_thread_id());
        threads.add_thread(mutator.clone());
        mutator.unpark(&threads.barrier);

        let done = Arc::new(AtomicBool::new(false));
        let polls = Arc::new(AtomicUsize::new(0));

        let worker = {
            let threads = threads.clone();
            let coordinator = coordinator.clone();
            let mutator = mutator.clone();
            let done = done.clone();
            let polls = polls.clone();

            thread::spawn(move || {
                while !done.load(Ordering::SeqCst) {
                    if mutator.safepoint_requested() {
                        coordinator.catch_at_safe_point(&threads, &mutator);
                        polls.fetch_add(1, Ordering::SeqCst);
                    }
                    thread::yield_now();
                }

                mutator.park(&threads.barrier);
            })
        };

        coordinator
            .suspend(&threads, SuspendReason::ForGc)
            .expect("suspension failed");
        assert_eq!(ThreadState::Safepoint, mutator.state());
        coordinator.restart(&threads, true);

        done.store(true, Ordering::SeqCst);
        worker.join().expect("worker panicked");

        assert_eq!(1, polls.load(Ordering::SeqCst));
        threads.remove_thread(&mutator);
    }
}
