use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use rand::distributions::{Distribution, Uniform};
use rand::thread_rng;
use scoped_threadpool::Pool;

use crate::gc::heap::PageMap;
use crate::gc::worklist::GrayStack;
use crate::gc::Address;

// below this many gray objects the parallel drain is not worth it
const PARALLEL_THRESHOLD: usize = 64;

const LOCAL_MAXIMUM: usize = 64;

/// What marking needs to know about the heap: which objects are condemned.
#[derive(Copy, Clone)]
pub struct MarkContext<'a> {
    page_map: &'a PageMap,
    condemned: usize,
}

impl<'a> MarkContext<'a> {
    pub fn new(page_map: &'a PageMap, condemned: usize) -> MarkContext<'a> {
        MarkContext {
            page_map,
            condemned,
        }
    }

    pub fn condemned(&self) -> usize {
        self.condemned
    }

    #[inline(always)]
    pub fn is_condemned(&self, addr: Address) -> bool {
        self.page_map.is_condemned(addr, self.condemned)
    }

    /// White -> gray for condemned objects. Returns true if the caller has
    /// to push the object.
    #[inline(always)]
    pub fn try_mark(&self, addr: Address) -> bool {
        self.is_condemned(addr) && addr.to_obj().header().try_mark()
    }

    /// objects outside the condemned generations are live by definition
    #[inline(always)]
    pub fn is_live(&self, addr: Address) -> bool {
        !self.is_condemned(addr) || addr.to_obj().header().is_marked()
    }

    /// gray -> black, pushes newly grayed children
    #[inline(always)]
    fn trace<F>(&self, object: Address, mut push: F)
    where
        F: FnMut(Address),
    {
        let obj = object.to_obj();
        obj.header().set_scanned();

        obj.visit_reference_fields(|slot| {
            let field = slot.get();

            if self.try_mark(field) {
                push(field);
            }
        });
    }
}

/// Drains the gray objects until no gray object is left. Returns the
/// number of objects scanned.
pub fn drain(ctx: MarkContext, gray: Vec<Address>, pool: &mut Pool, workers: usize) -> usize {
    if workers <= 1 || gray.len() < PARALLEL_THRESHOLD {
        let mut stack = GrayStack::new();

        for object in gray {
            stack.push(object);
        }

        drain_serial(ctx, &mut stack)
    } else {
        drain_parallel(ctx, gray, pool, workers)
    }
}

pub fn drain_serial(ctx: MarkContext, stack: &mut GrayStack) -> usize {
    let mut scanned = 0;

    while let Some(object) = stack.pop() {
        ctx.trace(object, |child| stack.push(child));
        scanned += 1;
    }

    scanned
}

fn drain_parallel(ctx: MarkContext, gray: Vec<Address>, pool: &mut Pool, workers: usize) -> usize {
    let injector: Injector<Address> = Injector::new();

    for object in gray {
        injector.push(object);
    }

    let mut deques = Vec::with_capacity(workers);
    let mut stealers = Vec::with_capacity(workers);

    for _ in 0..workers {
        let w = Worker::new_lifo();
        stealers.push(w.stealer());
        deques.push(w);
    }

    let terminator = Terminator::new(workers);
    let scanned = AtomicUsize::new(0);

    pool.scoped(|scope| {
        for (task_id, worker) in deques.into_iter().enumerate() {
            let injector = &injector;
            let stealers = &stealers;
            let terminator = &terminator;
            let scanned = &scanned;

            scope.execute(move || {
                let mut task = MarkingTask {
                    task_id,
                    ctx,
                    local: Vec::with_capacity(LOCAL_MAXIMUM),
                    worker,
                    injector,
                    stealers,
                    terminator,
                    scanned: 0,
                };

                task.run();
                scanned.fetch_add(task.scanned, Ordering::Relaxed);
            });
        }
    });

    let scanned = scanned.load(Ordering::Relaxed);
    log::trace!("parallel marking with {} workers scanned {} objects", workers, scanned);
    scanned
}

struct MarkingTask<'a> {
    task_id: usize,
    ctx: MarkContext<'a>,
    local: Vec<Address>,
    worker: Worker<Address>,
    injector: &'a Injector<Address>,
    stealers: &'a [Stealer<Address>],
    terminator: &'a Terminator,
    scanned: usize,
}

impl<'a> MarkingTask<'a> {
    fn run(&mut self) {
        loop {
            let object = if let Some(object) = self.pop() {
                object
            } else if self.terminator.try_terminate() {
                break;
            } else {
                continue;
            };

            let ctx = self.ctx;
            let mut children = Vec::new();
            ctx.trace(object, |child| children.push(child));

            for child in children {
                self.push(child);
            }

            self.scanned += 1;
        }
    }

    fn push(&mut self, object: Address) {
        if self.local.len() < LOCAL_MAXIMUM {
            self.local.push(object);
        } else {
            self.worker.push(object);
        }
    }

    fn pop(&mut self) -> Option<Address> {
        self.pop_local()
            .or_else(|| self.pop_worker())
            .or_else(|| self.pop_global())
            .or_else(|| self.steal())
    }

    fn pop_local(&mut self) -> Option<Address> {
        self.local.pop()
    }

    fn pop_worker(&mut self) -> Option<Address> {
        self.worker.pop()
    }

    fn pop_global(&mut self) -> Option<Address> {
        loop {
            match self.injector.steal_batch_and_pop(&self.worker) {
                Steal::Empty => break,
                Steal::Success(object) => return Some(object),
                Steal::Retry => continue,
            }
        }

        None
    }

    fn steal(&self) -> Option<Address> {
        if self.stealers.len() == 1 {
            return None;
        }

        let mut rng = thread_rng();
        let range = Uniform::new(0, self.stealers.len());

        for _ in 0..2 * self.stealers.len() {
            let mut stealer_id = self.task_id;

            while stealer_id == self.task_id {
                stealer_id = range.sample(&mut rng);
            }

            let stealer = &self.stealers[stealer_id];

            loop {
                match stealer.steal_batch_and_pop(&self.worker) {
                    Steal::Empty => break,
                    Steal::Success(object) => return Some(object),
                    Steal::Retry => continue,
                }
            }
        }

        None
    }
}

/// Counts workers that still may produce work. Marking is done once all
/// of them ran out of work at the same time.
pub struct Terminator {
    nworkers: AtomicUsize,
}

impl Terminator {
    pub fn new(nworkers: usize) -> Terminator {
        Terminator {
            nworkers: AtomicUsize::new(nworkers),
        }
    }

    pub fn try_terminate(&self) -> bool {
        if self.decrease_workers() {
            return true;
        }

        thread::sleep(Duration::from_micros(1));
        self.zero_or_increase_workers()
    }

    fn decrease_workers(&self) -> bool {
        self.nworkers.fetch_sub(1, Ordering::SeqCst) == 1
    }

    fn zero_or_increase_workers(&self) -> bool {
        let mut nworkers = self.nworkers.load(Ordering::Relaxed);

        loop {
            if nworkers == 0 {
                return true;
            }

            match self.nworkers.compare_exchange(
                nworkers,
                nworkers + 1,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return false,
                Err(actual) => nworkers = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::heap::{Heap, PAGE_SIZE};
    use crate::object::{initialize_object, Color, TypeDescriptor, TypeRef};

    struct Graph {
        heap: Heap,
        nodes: Vec<Address>,
        anchor: Address,
    }

    // a chain of nodes, every node also points to a shared anchor
    fn chain(length: usize) -> Graph {
        let ty = TypeRef::register(TypeDescriptor::fixed("Node", 2, &[0, 1]));
        let mut heap = Heap::new(16 * PAGE_SIZE).expect("reservation failed");
        let size = ty.object_size(0);

        let mut allocate = || {
            let address = heap.allocate(0, size).expect("heap full");
            unsafe { initialize_object(address, ty, 0, size) };
            address
        };

        let anchor = allocate();
        let nodes: Vec<Address> = (0..length).map(|_| allocate()).collect();

        for pair in nodes.windows(2) {
            pair[0].to_obj().field(0).set(pair[1]);
        }

        for &node in &nodes {
            node.to_obj().field(1).set(anchor);
        }

        Graph {
            heap,
            nodes,
            anchor,
        }
    }

    #[test]
    fn test_serial_marks_reachable() {
        let graph = chain(100);
        let ctx = MarkContext::new(graph.heap.page_map(), 0);

        let mut stack = GrayStack::new();
        assert!(ctx.try_mark(graph.nodes[50]));
        stack.push(graph.nodes[50]);
        assert!(!ctx.try_mark(graph.nodes[50]));

        assert_eq!(51, drain_serial(ctx, &mut stack));

        assert_eq!(Color::Black, graph.anchor.to_obj().header().color());

        for (idx, &node) in graph.nodes.iter().enumerate() {
            let expected = if idx >= 50 {
                Color::Black
            } else {
                Color::White
            };
            assert_eq!(expected, node.to_obj().header().color(), "node {}", idx);
        }
    }

    #[test]
    fn test_outside_condemned_is_live() {
        let graph = chain(4);
        let ctx = MarkContext::new(graph.heap.page_map(), 0);

        assert!(!ctx.is_live(graph.nodes[1]));
        assert!(ctx.is_live(Address::from(0x10)));
        assert!(!ctx.try_mark(Address::null()));
    }

    #[test]
    fn test_parallel_marks_everything() {
        let graph = chain(2000);
        let ctx = MarkContext::new(graph.heap.page_map(), 0);
        let mut pool = Pool::new(4);

        let gray: Vec<Address> = graph
            .nodes
            .iter()
            .step_by(20)
            .copied()
            .filter(|&node| ctx.try_mark(node))
            .collect();
        assert_eq!(100, gray.len());

        assert_eq!(2001, drain(ctx, gray, &mut pool, 4));
        assert!(graph
            .nodes
            .iter()
            .all(|node| node.to_obj().header().color() == Color::Black));
    }

    #[test]
    fn test_terminator() {
        let terminator = Terminator::new(1);
        assert!(terminator.try_terminate());
    }
}
