use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

use crate::error::GcError;
use crate::gc::tlab::{DEFAULT_TLAB_SIZE, MIN_TLAB_SIZE};
use crate::gc::M;
use crate::interface::GcConfig;

pub const DEFAULT_CEMENT_THRESHOLD: usize = 1000;
pub const DEFAULT_PIN_QUEUE_CAPACITY: usize = 4096;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemSize(pub usize);

impl Deref for MemSize {
    type Target = usize;

    fn deref(&self) -> &usize {
        &self.0
    }
}

impl FromStr for MemSize {
    type Err = String;

    fn from_str(value: &str) -> Result<MemSize, String> {
        let suffix = if let Some(ch) = value.chars().last() {
            match ch {
                'k' | 'K' => 1024,
                'm' | 'M' => 1024 * 1024,
                'g' | 'G' => 1024 * 1024 * 1024,
                _ => 1,
            }
        } else {
            1
        };

        let prefix = if suffix != 1 {
            let (left, _) = value.split_at(value.len() - 1);
            left
        } else {
            value
        };

        match prefix.parse::<usize>() {
            Ok(size) => Ok(MemSize(size * suffix)),
            Err(_) => Err(format!("'{}' is not a valid mem size", value)),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CompactionMode {
    /// only sweep
    Never,
    /// evacuate in every collection
    Always,
    /// minor collections evacuate, full collections only when fragmented
    Auto,
}

impl FromStr for CompactionMode {
    type Err = String;

    fn from_str(value: &str) -> Result<CompactionMode, String> {
        match value {
            "never" => Ok(CompactionMode::Never),
            "always" => Ok(CompactionMode::Always),
            "auto" => Ok(CompactionMode::Auto),
            _ => Err(format!(
                "unknown compaction mode '{}', expected: never, always, auto",
                value
            )),
        }
    }
}

impl fmt::Display for CompactionMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = match self {
            CompactionMode::Never => "never",
            CompactionMode::Always => "always",
            CompactionMode::Auto => "auto",
        };

        f.write_str(text)
    }
}

#[derive(Clone, Debug)]
pub struct GcFlags {
    pub min_heap_size: usize,
    pub max_heap_size: usize,
    pub gen0_budget: usize,
    pub gen1_budget: usize,
    pub tlab_size: usize,
    pub gc_workers: usize,
    pub compaction: CompactionMode,
    /// 0 to 9, higher values compact full collections more eagerly
    pub conserve_memory: usize,
    pub pin_queue_capacity: usize,
    pub cementing: bool,
    pub cement_threshold: usize,
    pub suspend_retries: usize,
    pub gc_stress: bool,
    pub gc_stress_minor: bool,
    pub gc_verify: bool,
    pub gc_verbose: bool,
    pub gc_dev_verbose: bool,
    pub gc_stats: bool,
    /// recorded only, collections always stop the world
    pub concurrent: bool,
    /// recorded only, there is a single heap
    pub server: bool,
}

impl Default for GcFlags {
    fn default() -> GcFlags {
        GcFlags {
            min_heap_size: 8 * M,
            max_heap_size: 256 * M,
            gen0_budget: 4 * M,
            gen1_budget: 16 * M,
            tlab_size: DEFAULT_TLAB_SIZE,
            gc_workers: 1,
            compaction: CompactionMode::Auto,
            conserve_memory: 0,
            pin_queue_capacity: DEFAULT_PIN_QUEUE_CAPACITY,
            cementing: true,
            cement_threshold: DEFAULT_CEMENT_THRESHOLD,
            suspend_retries: 3,
            gc_stress: false,
            gc_stress_minor: false,
            gc_verify: false,
            gc_verbose: false,
            gc_dev_verbose: false,
            gc_stats: false,
            concurrent: false,
            server: false,
        }
    }
}

impl GcFlags {
    /// Reads the collector settings through the configuration queries of
    /// the execution engine. Missing keys keep their defaults.
    pub fn from_config(ee: &dyn GcConfig) -> Result<GcFlags, GcError> {
        let mut flags = GcFlags::default();

        if let Some(size) = size_value(ee, "GCgen0size")? {
            flags.gen0_budget = size;
        }

        if let Some(size) = size_value(ee, "GCgen1size")? {
            flags.gen1_budget = size;
        }

        if let Some(size) = size_value(ee, "GCHeapHardLimit")? {
            flags.max_heap_size = size;
            flags.min_heap_size = flags.min_heap_size.min(size);
        }

        if let Some(level) = int_value(ee, "GCConserveMemory")? {
            if level > 9 {
                return Err(invalid("GCConserveMemory", level));
            }
            flags.conserve_memory = level;
        }

        if let Some(workers) = int_value(ee, "GCWorkers")? {
            // 0 selects one worker per cpu
            flags.gc_workers = if workers == 0 {
                num_cpus::get()
            } else {
                workers
            };
        }

        if let Some(mode) = ee.get_string_config_value("GCCompactionMode") {
            flags.compaction = mode.parse().map_err(|_| invalid("GCCompactionMode", mode))?;
        }

        if let Some(cementing) = ee.get_boolean_config_value("GCCementing") {
            flags.cementing = cementing;
        }

        if let Some(verify) = ee.get_boolean_config_value("GCHeapVerify") {
            flags.gc_verify = verify;
        }

        if let Some(concurrent) = ee.get_boolean_config_value("GCConcurrent") {
            flags.concurrent = concurrent;
        }

        if let Some(server) = ee.get_boolean_config_value("GCServer") {
            flags.server = server;
        }

        flags.validate()?;
        Ok(flags)
    }

    pub fn validate(&self) -> Result<(), GcError> {
        if self.min_heap_size > self.max_heap_size {
            return Err(invalid("min_heap_size", self.min_heap_size));
        }

        if self.gen0_budget < self.tlab_size || self.gen0_budget > self.max_heap_size {
            return Err(invalid("GCgen0size", self.gen0_budget));
        }

        if self.tlab_size < MIN_TLAB_SIZE {
            return Err(invalid("tlab_size", self.tlab_size));
        }

        if self.gc_workers == 0 {
            return Err(invalid("GCWorkers", self.gc_workers));
        }

        Ok(())
    }

    /// fraction of a page that may be free before a full collection
    /// considers the oldest generation fragmented
    pub fn fragmentation_limit(&self) -> f32 {
        0.5 - 0.04 * self.conserve_memory as f32
    }
}

fn invalid(key: &str, value: impl ToString) -> GcError {
    GcError::InvalidConfig {
        key: key.into(),
        value: value.to_string(),
    }
}

fn int_value(ee: &dyn GcConfig, key: &str) -> Result<Option<usize>, GcError> {
    match ee.get_int_config_value(key) {
        Some(value) => usize::try_from(value)
            .map(Some)
            .map_err(|_| invalid(key, value)),
        None => match ee.get_string_config_value(key) {
            Some(value) => Err(invalid(key, value)),
            None => Ok(None),
        },
    }
}

// sizes are accepted as plain integers or as strings like "64M"
fn size_value(ee: &dyn GcConfig, key: &str) -> Result<Option<usize>, GcError> {
    if let Some(value) = ee.get_int_config_value(key) {
        return usize::try_from(value)
            .map(Some)
            .map_err(|_| invalid(key, value));
    }

    match ee.get_string_config_value(key) {
        Some(value) => value
            .parse::<MemSize>()
            .map(|size| Some(*size))
            .map_err(|_| invalid(key, value)),
        None => Ok(None),
    }
}
