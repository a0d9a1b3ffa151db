use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use gengc_runtime::{
    Address, GcError, GcReason, HandleKind, Local, Mutator, ObjectHandle, TypeDescriptor, TypeRef,
    Vm, MAX_GENERATION,
};

use crate::flags::WorkloadFlags;

const PINNED_HANDLES: usize = 16;
const FINALIZER_INTERVAL: usize = 4096;

#[derive(Copy, Clone)]
struct Types {
    node: TypeRef,
    resource: TypeRef,
    bytes: TypeRef,
    slots: TypeRef,
}

impl Types {
    fn register() -> Types {
        Types {
            node: TypeRef::register(TypeDescriptor::fixed("Node", 2, &[0])),
            resource: TypeRef::register(
                TypeDescriptor::fixed("Resource", 2, &[0]).with_finalizer(),
            ),
            bytes: TypeRef::register(TypeDescriptor::byte_array("Bytes")),
            slots: TypeRef::register(TypeDescriptor::ref_array("Slots")),
        }
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct Report {
    pub allocations: usize,
    pub large_allocations: usize,
    pub finalized: usize,
    pub verified: usize,
}

impl Report {
    fn add(&mut self, other: &Report) {
        self.allocations += other.allocations;
        self.large_allocations += other.large_allocations;
        self.finalized += other.finalized;
        self.verified += other.verified;
    }
}

/// Runs the workload on `flags.threads` mutator threads and waits for all
/// of them.
pub fn run(vm: &Arc<Vm>, flags: &WorkloadFlags) -> Result<Report, GcError> {
    let types = Types::register();

    let workers: Vec<_> = (0..flags.threads)
        .map(|idx| {
            let vm = vm.clone();
            let flags = flags.clone();

            thread::spawn(move || {
                let seed = flags.seed.wrapping_add(idx as u64);
                Worker::new(&vm, types, &flags, seed).run()
            })
        })
        .collect();

    let mut report = Report::default();

    for worker in workers {
        match worker.join() {
            Ok(result) => report.add(&result?),
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }

    report.finalized += vm.shutdown(|_| {});
    Ok(report)
}

struct Worker<'a> {
    mutator: Mutator,
    types: Types,
    flags: &'a WorkloadFlags,
    rng: StdRng,

    slots: Local,
    // id of the object in each slot, 0 for empty slots
    ids: Vec<usize>,
    pinned: VecDeque<ObjectHandle>,
    next_id: usize,
    report: Report,
}

impl<'a> Worker<'a> {
    fn new(vm: &Arc<Vm>, types: Types, flags: &'a WorkloadFlags, seed: u64) -> Worker<'a> {
        let mutator = vm.attach_current_thread();
        let slots = mutator.local(Address::null());

        Worker {
            mutator,
            types,
            flags,
            rng: StdRng::seed_from_u64(seed),

            slots,
            ids: vec![0; flags.live_slots.max(1)],
            pinned: VecDeque::new(),
            next_id: 1,
            report: Report::default(),
        }
    }

    fn run(mut self) -> Result<Report, GcError> {
        let slots = self.mutator.alloc_array(self.types.slots, self.ids.len())?;
        let slots = self.mutator.get(slots);
        self.mutator.set(self.slots, slots);

        for iteration in 1..=self.flags.iterations {
            self.step()?;

            if self.flags.induced_every > 0 && iteration % self.flags.induced_every == 0 {
                let generation = (iteration / self.flags.induced_every) % (MAX_GENERATION + 1);
                self.mutator.collect(Some(generation), GcReason::Induced)?;
                self.verify();
            }

            if iteration % FINALIZER_INTERVAL == 0 {
                self.report.finalized += self.mutator.vm().run_finalizers(|_| {});
            }
        }

        self.verify();

        let vm = self.mutator.vm().clone();
        for handle in self.pinned.drain(..) {
            vm.gc.destroy_handle(handle);
        }

        Ok(self.report)
    }

    fn step(&mut self) -> Result<(), GcError> {
        let percent = self.rng.gen_range(0..100);
        let idx = self.rng.gen_range(0..self.ids.len());
        let flags = self.flags;

        if percent < flags.large_percent {
            let length = self.rng.gen_range(32 * 1024..256 * 1024);
            let (slots, bytes) = (self.slots, self.types.bytes);

            self.mutator.scope(|m| -> Result<(), GcError> {
                let array = m.alloc_array(bytes, length)?;
                m.store_element(slots, idx, m.get(array));
                Ok(())
            })?;

            self.ids[idx] = 0;
            self.report.large_allocations += 1;
        } else if percent < flags.large_percent + flags.finalizable_percent {
            self.alloc_into(idx, self.types.resource)?;
        } else {
            self.alloc_into(idx, self.types.node)?;

            if self.rng.gen_range(0..100) < flags.pinned_percent {
                self.pin(idx);
            }

            let other = self.rng.gen_range(0..self.ids.len());

            if self.rng.gen_range(0..4) == 0 && other != idx && self.ids[other] != 0 {
                self.link(other, idx);
            }
        }

        self.report.allocations += 1;
        Ok(())
    }

    fn alloc_into(&mut self, idx: usize, ty: TypeRef) -> Result<(), GcError> {
        let id = self.next_id;
        let slots = self.slots;

        self.mutator.scope(|m| -> Result<(), GcError> {
            let object = m.alloc(ty)?;
            m.get(object).to_obj().field(1).set(Address::from(id));
            m.store_element(slots, idx, m.get(object));
            Ok(())
        })?;

        self.next_id += 1;
        self.ids[idx] = id;
        Ok(())
    }

    // The holder is usually older than the new object, so these stores
    // keep the write barrier busy.
    fn link(&mut self, holder: usize, target: usize) {
        let slots = self.slots;

        self.mutator.scope(|m| {
            let holder = m.local(m.load_element(slots, holder));
            m.store_field(holder, 0, m.load_element(slots, target));
        });
    }

    fn pin(&mut self, idx: usize) {
        let gc = &self.mutator.vm().gc;
        let target = self.mutator.load_element(self.slots, idx);
        self.pinned.push_back(gc.create_handle(target, HandleKind::Pinned));

        if self.pinned.len() > PINNED_HANDLES {
            if let Some(old) = self.pinned.pop_front() {
                gc.destroy_handle(old);
            }
        }
    }

    // Every slot must still hold the object stored last.
    fn verify(&mut self) {
        let m = &self.mutator;
        let gc = &m.vm().gc;

        for (idx, &id) in self.ids.iter().enumerate() {
            let object = m.load_element(self.slots, idx);

            if id == 0 {
                continue;
            }

            assert!(gc.is_object_start(object), "slot {} lost its object", idx);
            assert_eq!(id, object.to_obj().field(1).get().to_usize());
        }

        self.report.verified += 1;
    }
}
