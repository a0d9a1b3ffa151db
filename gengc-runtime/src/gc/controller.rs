use std::f32;
use std::fmt;
use std::time::Instant;

use crate::flags::GcFlags;
use crate::gc::heap::{GENERATIONS, MAX_GENERATION};
use crate::gc::pinning::{PinStats, PinType};
use crate::gc::{formatted_size, AllNumbers, CollectionStats, GcReason};

/// What a finished cycle reports back to the controller.
#[derive(Copy, Clone, Debug, Default)]
pub struct CycleOutcome {
    /// bytes promoted into each generation
    pub promoted: [usize; GENERATIONS],
    pub copied: usize,
    pub freed: usize,
    pub late_pinned: usize,
    /// bytes used by all generations after the cycle
    pub memory_size: usize,
    /// bytes used by the oldest generation after the cycle
    pub old_size: usize,
}

impl CycleOutcome {
    pub fn total_promoted(&self) -> usize {
        self.promoted.iter().sum()
    }
}

/// Allocation budgets per generation, condemned generation selection and
/// the statistics of all collections so far.
pub struct HeapController {
    min_heap_size: usize,

    budgets: [usize; GENERATIONS],
    allocated: [usize; GENERATIONS],
    full_requested: bool,

    gc_start: Option<Instant>,
    start_memory_size: usize,
    end_memory_size: usize,

    pub last: CycleOutcome,
    total_promoted: usize,
    total_freed: usize,

    collections: Vec<CollectionStats>,
    minor_phases: Vec<CollectionPhases>,
    full_phases: Vec<CollectionPhases>,
    pin_stats: PinStats,
}

impl HeapController {
    pub fn new(flags: &GcFlags) -> HeapController {
        assert!(flags.min_heap_size <= flags.max_heap_size);

        HeapController {
            min_heap_size: flags.min_heap_size,

            budgets: [flags.gen0_budget, flags.gen1_budget, flags.min_heap_size],
            allocated: [0; GENERATIONS],
            full_requested: false,

            gc_start: None,
            start_memory_size: 0,
            end_memory_size: 0,

            last: CycleOutcome::default(),
            total_promoted: 0,
            total_freed: 0,

            collections: (0..GENERATIONS).map(|_| CollectionStats::new()).collect(),
            minor_phases: Vec::new(),
            full_phases: Vec::new(),
            pin_stats: PinStats::default(),
        }
    }

    pub fn record_allocation(&mut self, generation: usize, size: usize) {
        self.allocated[generation] += size;
    }

    pub fn allocated(&self, generation: usize) -> usize {
        self.allocated[generation]
    }

    pub fn budget(&self, generation: usize) -> usize {
        self.budgets[generation]
    }

    pub fn budget_exhausted(&self, generation: usize) -> bool {
        self.allocated[generation] >= self.budgets[generation]
    }

    /// the next collection condemns the whole heap
    pub fn request_full(&mut self) {
        self.full_requested = true;
    }

    /// Picks the oldest generation to condemn. Older generations whose
    /// budget ran out are collected along with the requested one.
    pub fn select_condemned(&self, requested: Option<usize>) -> usize {
        let mut condemned = requested.unwrap_or(0).min(MAX_GENERATION);

        if self.full_requested {
            return MAX_GENERATION;
        }

        for generation in condemned + 1..=MAX_GENERATION {
            if self.budget_exhausted(generation) {
                condemned = generation;
            }
        }

        condemned
    }

    pub fn start(&mut self, memory_size: usize) {
        self.gc_start = Some(Instant::now());
        self.start_memory_size = memory_size;
    }

    /// Books a finished cycle and recomputes the budgets. Returns the
    /// pause in milliseconds.
    pub fn stop(
        &mut self,
        condemned: usize,
        reason: GcReason,
        outcome: CycleOutcome,
        pins: PinStats,
        flags: &GcFlags,
    ) -> f32 {
        let gc_duration = self.gc_start.take().expect("not started").elapsed();
        let gc_duration_ms = gc_duration.as_secs_f32() * 1000.0f32;

        for generation in 0..=condemned {
            self.allocated[generation] = 0;
        }

        // promotion into a generation that was not collected uses up its budget
        for generation in condemned + 1..GENERATIONS {
            self.allocated[generation] += outcome.promoted[generation];
        }

        if condemned == MAX_GENERATION {
            self.full_requested = false;
            self.budgets[MAX_GENERATION] = outcome.old_size.max(self.min_heap_size);
        }

        if outcome.late_pinned > 0 {
            // promotion ran out of space
            self.request_full();
        }

        self.end_memory_size = outcome.memory_size;
        self.last = outcome;
        self.total_promoted += outcome.total_promoted();
        self.total_freed += outcome.freed;
        self.pin_stats.add(&pins);

        self.collections[condemned].add(gc_duration_ms);

        if flags.gc_stats {
            let phases = if condemned == MAX_GENERATION {
                self.full_phases.last_mut()
            } else {
                self.minor_phases.last_mut()
            };

            if let Some(phases) = phases {
                phases.total = gc_duration_ms;
            }
        }

        if flags.gc_verbose {
            self.print(condemned, reason, gc_duration_ms);
        }

        gc_duration_ms
    }

    fn print(&self, condemned: usize, reason: GcReason, gc_duration: f32) {
        log::info!(
            "GC: gen{} ({}) {} -> {}; {:.2} ms; {} promoted; {} copied; {} freed",
            condemned,
            reason,
            formatted_size(self.start_memory_size),
            formatted_size(self.end_memory_size),
            gc_duration,
            formatted_size(self.last.total_promoted()),
            formatted_size(self.last.copied),
            formatted_size(self.last.freed),
        );
    }

    pub fn add_phases(&mut self, condemned: usize, phases: CollectionPhases) {
        if condemned == MAX_GENERATION {
            self.full_phases.push(phases);
        } else {
            self.minor_phases.push(phases);
        }
    }

    pub fn collections(&self, generation: usize) -> usize {
        self.collections[generation].collections()
    }

    pub fn total_pause(&self) -> f32 {
        self.collections.iter().map(|stats| stats.pause()).sum()
    }

    pub fn pin_stats(&self) -> &PinStats {
        &self.pin_stats
    }

    pub fn dump_summary(&self, runtime: f32) {
        let total_gc = self.total_pause();
        let minor_pause = self.collections[0].pause() + self.collections[1].pause();
        let full_pause = self.collections[MAX_GENERATION].pause();
        let (mutator_percentage, gc_percentage) = percentage(total_gc, runtime);
        let mutator = runtime - total_gc;

        println!("GC stats: total={:.1}", runtime);
        println!("GC stats: mutator={:.1}", mutator);
        println!("GC stats: collection={:.1}", total_gc);
        println!("GC stats: collection-minor={:.1}", minor_pause);
        println!("GC stats: collection-full={:.1}", full_pause);
        println!();

        for (generation, stats) in self.collections.iter().enumerate() {
            println!(
                "GC stats: gen{}-collections={}",
                generation,
                stats.collections()
            );
            println!("GC stats: gen{}-pauses={}", generation, stats.pauses());
        }

        println!();
        println!(
            "GC stats: promoted={} freed={}",
            formatted_size(self.total_promoted),
            formatted_size(self.total_freed)
        );

        for ty in [PinType::Stack, PinType::StaticData, PinType::Other] {
            println!(
                "GC stats: pins-{}={}",
                ty,
                self.pin_stats.staged[ty.index()]
            );
        }

        println!(
            "GC stats: pinned-objects={} ({})",
            self.pin_stats.pinned_objects,
            formatted_size(self.pin_stats.pinned_bytes)
        );
        println!("GC stats: pin-queue-overflows={}", self.pin_stats.overflows);
        println!();

        println!("GC stats: minor-total={}", all(&self.minor_phases, |p| p.total));
        println!("GC stats: minor-roots={}", all(&self.minor_phases, |p| p.roots));
        println!("GC stats: minor-marking={}", all(&self.minor_phases, |p| p.marking));
        println!("GC stats: full-total={}", all(&self.full_phases, |p| p.total));
        println!("GC stats: full-marking={}", all(&self.full_phases, |p| p.marking));
        println!("GC stats: full-sweep={}", all(&self.full_phases, |p| p.sweep));
        println!("GC stats: full-evacuate={}", all(&self.full_phases, |p| p.evacuate));
        println!(
            "GC stats: full-update-refs={}",
            all(&self.full_phases, |p| p.update_refs)
        );
        println!();

        println!(
            "GC summary: {:.1}ms minor ({}), {:.1}ms full ({}), {:.1}ms collection, {:.1}ms mutator, {:.1}ms total ({}% mutator, {}% GC)",
            minor_pause,
            self.collections[0].collections() + self.collections[1].collections(),
            full_pause,
            self.collections[MAX_GENERATION].collections(),
            total_gc,
            mutator,
            runtime,
            mutator_percentage,
            gc_percentage,
        );

        println!("\nMinor:");
        println!("\tRoots:\t\t{}", numbers(&self.minor_phases, |p| p.roots));
        println!("\tMarking:\t{}", numbers(&self.minor_phases, |p| p.marking));
        println!("\tSweep:\t\t{}", numbers(&self.minor_phases, |p| p.sweep));
        println!("\tEvacuate:\t{}", numbers(&self.minor_phases, |p| p.evacuate));
        println!("\tTotal:\t\t{}", numbers(&self.minor_phases, |p| p.total));

        println!("\nFull:");
        println!("\tRoots:\t\t{}", numbers(&self.full_phases, |p| p.roots));
        println!("\tMarking:\t{}", numbers(&self.full_phases, |p| p.marking));
        println!("\tSweep:\t\t{}", numbers(&self.full_phases, |p| p.sweep));
        println!("\tEvacuate:\t{}", numbers(&self.full_phases, |p| p.evacuate));
        println!("\tUpdate Refs:\t{}", numbers(&self.full_phases, |p| p.update_refs));
        println!("\tTotal:\t\t{}", numbers(&self.full_phases, |p| p.total));
        println!();
    }
}

fn percentage(total_gc: f32, runtime: f32) -> (f32, f32) {
    if runtime <= 0.0 {
        return (100.0, 0.0);
    }

    let gc_percentage = ((total_gc / runtime) * 100.0).round();
    (100.0 - gc_percentage, gc_percentage)
}

fn all<F>(phases: &[CollectionPhases], f: F) -> AllNumbers
where
    F: Fn(&CollectionPhases) -> f32,
{
    AllNumbers(phases.iter().map(f).collect())
}

fn numbers<F>(phases: &[CollectionPhases], f: F) -> Numbers
where
    F: Fn(&CollectionPhases) -> f32,
{
    let values: Vec<_> = phases.iter().map(f).collect();
    calculate_numbers(&values)
}

pub struct Numbers {
    pub avg: f32,
    pub sum: f32,
    pub min: f32,
    pub max: f32,
}

impl Numbers {
    fn zero() -> Numbers {
        Numbers {
            avg: 0f32,
            sum: 0f32,
            min: 0f32,
            max: 0f32,
        }
    }
}

impl fmt::Display for Numbers {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "avg={:<8.1} sum={:<8.1} min={:<8.1} max={:<8.1}",
            self.avg, self.sum, self.min, self.max
        )
    }
}

fn calculate_numbers(data: &[f32]) -> Numbers {
    if data.is_empty() {
        return Numbers::zero();
    }

    let mut sum = 0f32;
    let mut xmin = data[0];
    let mut xmax = data[0];

    for el in data {
        sum += *el;
        xmin = f32::min(xmin, *el);
        xmax = f32::max(xmax, *el);
    }

    let avg = sum / (data.len() as f32);

    Numbers {
        avg,
        sum,
        min: xmin,
        max: xmax,
    }
}

/// Phase timings of one collection in milliseconds, recorded with
/// `gc_stats`.
#[derive(Clone, Debug, Default)]
pub struct CollectionPhases {
    pub roots: f32,
    pub marking: f32,
    pub sweep: f32,
    pub evacuate: f32,
    pub update_refs: f32,
    pub total: f32,
}

impl CollectionPhases {
    pub fn new() -> CollectionPhases {
        CollectionPhases::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_condemned() {
        let flags = GcFlags::default();
        let mut controller = HeapController::new(&flags);

        assert_eq!(0, controller.select_condemned(None));
        assert_eq!(1, controller.select_condemned(Some(1)));

        controller.record_allocation(1, flags.gen1_budget);
        assert_eq!(1, controller.select_condemned(None));

        controller.request_full();
        assert_eq!(MAX_GENERATION, controller.select_condemned(Some(0)));
    }

    #[test]
    fn test_stop_resets_budgets() {
        let flags = GcFlags::default();
        let mut controller = HeapController::new(&flags);

        controller.record_allocation(0, flags.gen0_budget);
        assert!(controller.budget_exhausted(0));

        controller.start(flags.gen0_budget);
        let outcome = CycleOutcome {
            promoted: [0, 1024, 0],
            ..CycleOutcome::default()
        };
        controller.stop(0, GcReason::AllocationFailure, outcome, PinStats::default(), &flags);

        assert!(!controller.budget_exhausted(0));
        assert_eq!(1024, controller.allocated(1));
        assert_eq!(1, controller.collections(0));
        assert_eq!(0, controller.collections(MAX_GENERATION));
    }

    #[test]
    fn test_full_collection_adjusts_old_budget() {
        let flags = GcFlags::default();
        let mut controller = HeapController::new(&flags);

        controller.request_full();
        controller.start(0);
        let outcome = CycleOutcome {
            old_size: 4 * flags.min_heap_size,
            late_pinned: 0,
            ..CycleOutcome::default()
        };
        controller.stop(
            MAX_GENERATION,
            GcReason::Induced,
            outcome,
            PinStats::default(),
            &flags,
        );

        assert_eq!(4 * flags.min_heap_size, controller.budget(MAX_GENERATION));
        assert_eq!(0, controller.select_condemned(None));
    }

    #[test]
    fn test_promotion_charges_older_generations() {
        let flags = GcFlags::default();
        let mut controller = HeapController::new(&flags);

        controller.start(0);
        let outcome = CycleOutcome {
            promoted: [0, 4096, 512],
            ..CycleOutcome::default()
        };
        controller.stop(1, GcReason::Induced, outcome, PinStats::default(), &flags);

        assert_eq!(0, controller.allocated(1));
        assert_eq!(512, controller.allocated(MAX_GENERATION));

        controller.start(0);
        let outcome = CycleOutcome {
            late_pinned: 1,
            ..CycleOutcome::default()
        };
        controller.stop(0, GcReason::AllocationFailure, outcome, PinStats::default(), &flags);
        assert_eq!(MAX_GENERATION, controller.select_condemned(None));
    }

    #[test]
    fn test_calculate_numbers() {
        let numbers = calculate_numbers(&[1.0, 3.0, 2.0]);
        assert_eq!(6.0, numbers.sum);
        assert_eq!(1.0, numbers.min);
        assert_eq!(3.0, numbers.max);
        assert_eq!(2.0, numbers.avg);
    }
}
