use clap::{Args, Parser};

use gengc_runtime::{CompactionMode, GcError, GcFlags, MemSize};

#[derive(Parser)]
#[command(
    name = "gengc",
    version,
    about = "Runs a randomized allocation workload against the gengc collector"
)]
pub struct Cli {
    #[command(flatten)]
    pub workload: WorkloadFlags,

    #[command(flatten)]
    pub gc: CollectorFlags,
}

#[derive(Args, Clone, Debug)]
pub struct WorkloadFlags {
    /// Number of mutator threads
    #[arg(long, default_value_t = 4)]
    pub threads: usize,

    /// Allocations per mutator thread
    #[arg(long, default_value_t = 200_000)]
    pub iterations: usize,

    /// Number of object slots each thread keeps alive
    #[arg(long, default_value_t = 1024)]
    pub live_slots: usize,

    /// Seed for the random number generator
    #[arg(long, default_value_t = 0x5eed)]
    pub seed: u64,

    /// Percentage of allocations that are large byte arrays
    #[arg(long, default_value_t = 1)]
    pub large_percent: u32,

    /// Percentage of allocations that are pinned while live
    #[arg(long, default_value_t = 1)]
    pub pinned_percent: u32,

    /// Percentage of allocations with a finalizer
    #[arg(long, default_value_t = 2)]
    pub finalizable_percent: u32,

    /// Collect explicitly every N allocations, 0 disables induced collections
    #[arg(long, default_value_t = 0)]
    pub induced_every: usize,
}

#[derive(Args, Default)]
pub struct CollectorFlags {
    /// Collect garbage at every allocation
    #[arg(long)]
    pub gc_stress: bool,

    /// Minor collection at every allocation
    #[arg(long)]
    pub gc_stress_minor: bool,

    /// Print GC statistics
    #[arg(long)]
    pub gc_stats: bool,

    /// Verbose GC
    #[arg(long)]
    pub gc_verbose: bool,

    /// Log every GC phase
    #[arg(long)]
    pub gc_dev_verbose: bool,

    /// Verify heap before and after collections
    #[arg(long)]
    pub gc_verify: bool,

    /// Number of GC worker threads, 0 uses one per cpu
    #[arg(long)]
    pub gc_worker: Option<usize>,

    /// Allocation budget of the youngest generation
    #[arg(long, value_parser = parse_mem_size)]
    pub gc_young_size: Option<MemSize>,

    /// Allocation budget of the middle generation
    #[arg(long, value_parser = parse_mem_size)]
    pub gc_middle_size: Option<MemSize>,

    /// Size of thread-local allocation buffers
    #[arg(long, value_parser = parse_mem_size)]
    pub tlab_size: Option<MemSize>,

    /// Compaction policy (never, always, auto)
    #[arg(long, value_parser = parse_compaction)]
    pub gc_compaction: Option<CompactionMode>,

    /// Compact full collections more eagerly (0-9)
    #[arg(long)]
    pub gc_conserve_memory: Option<usize>,

    /// Capacity of the pin queue
    #[arg(long)]
    pub gc_pin_queue: Option<usize>,

    /// Disable cementing of pinned old-to-young targets
    #[arg(long)]
    pub gc_disable_cementing: bool,

    /// Pin count after which a cemented object stays cemented
    #[arg(long)]
    pub gc_cement_threshold: Option<usize>,

    /// Attempts to suspend the mutators before giving up on a collection
    #[arg(long)]
    pub gc_suspend_retries: Option<usize>,

    /// Request background collections (recorded only)
    #[arg(long)]
    pub gc_concurrent: bool,

    /// Request server collections (recorded only)
    #[arg(long)]
    pub gc_server: bool,

    /// Set minimum heap size
    #[arg(long, value_parser = parse_mem_size)]
    pub min_heap_size: Option<MemSize>,

    /// Set maximum heap size
    #[arg(long, value_parser = parse_mem_size)]
    pub max_heap_size: Option<MemSize>,
}

impl CollectorFlags {
    pub fn to_gc_flags(&self) -> Result<GcFlags, GcError> {
        let mut flags = GcFlags::default();

        if let Some(size) = self.max_heap_size {
            flags.max_heap_size = *size;
            flags.min_heap_size = flags.min_heap_size.min(*size);
        }

        if let Some(size) = self.min_heap_size {
            flags.min_heap_size = *size;
        }

        if let Some(size) = self.gc_young_size {
            flags.gen0_budget = *size;
        }

        if let Some(size) = self.gc_middle_size {
            flags.gen1_budget = *size;
        }

        if let Some(size) = self.tlab_size {
            flags.tlab_size = *size;
        }

        if let Some(workers) = self.gc_worker {
            flags.gc_workers = if workers == 0 {
                num_cpus::get()
            } else {
                workers
            };
        }

        if let Some(mode) = self.gc_compaction {
            flags.compaction = mode;
        }

        if let Some(level) = self.gc_conserve_memory {
            if level > 9 {
                return Err(GcError::InvalidConfig {
                    key: "gc-conserve-memory".into(),
                    value: level.to_string(),
                });
            }

            flags.conserve_memory = level;
        }

        if let Some(capacity) = self.gc_pin_queue {
            flags.pin_queue_capacity = capacity;
        }

        if let Some(threshold) = self.gc_cement_threshold {
            flags.cement_threshold = threshold;
        }

        if let Some(retries) = self.gc_suspend_retries {
            flags.suspend_retries = retries;
        }

        flags.cementing = !self.gc_disable_cementing;
        flags.gc_stress = self.gc_stress;
        flags.gc_stress_minor = self.gc_stress_minor;
        flags.gc_verify = self.gc_verify;
        flags.gc_verbose = self.gc_verbose;
        flags.gc_dev_verbose = self.gc_dev_verbose;
        flags.gc_stats = self.gc_stats;
        flags.concurrent = self.gc_concurrent;
        flags.server = self.gc_server;

        flags.validate()?;
        Ok(flags)
    }
}

fn parse_mem_size(value: &str) -> Result<MemSize, String> {
    value.parse()
}

fn parse_compaction(value: &str) -> Result<CompactionMode, String> {
    value.parse()
}
