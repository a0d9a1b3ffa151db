use std::fmt;

use thiserror::Error;

/// Failures surfaced to the caller of the collector. After marking has
/// started nothing is reported this way; such failures are fatal.
#[derive(Debug, Error)]
pub enum GcError {
    #[error("out of memory: could not allocate {requested} bytes")]
    OutOfMemory { requested: usize },

    #[error("object of {size} bytes exceeds the maximum object size")]
    ObjectTooLarge { size: usize },

    #[error("invalid value {value:?} for configuration key {key}")]
    InvalidConfig { key: String, value: String },

    #[error("suspending the execution engine failed: {0}")]
    SuspendFailed(String),

    #[error("reserving {0} bytes for the heap failed")]
    ReservationFailed(usize),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FatalError {
    HashArenaExhausted,
    HeapExhausted,
    HeapCorruption,
}

impl FatalError {
    pub fn exit_code(self) -> i32 {
        match self {
            FatalError::HashArenaExhausted => 70,
            FatalError::HeapExhausted => 71,
            FatalError::HeapCorruption => 72,
        }
    }

    fn message(self) -> &'static str {
        match self {
            FatalError::HashArenaExhausted => "hash table arena exhausted",
            FatalError::HeapExhausted => "heap exhausted after full collection",
            FatalError::HeapCorruption => "heap corruption detected",
        }
    }
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} (code {})", self.message(), self.exit_code())
    }
}

/// Terminates the process. Callers holding an execution engine go through
/// `Gc::fatal` so that `handle_fatal_error` runs first.
pub fn fatal_error(error: FatalError) -> ! {
    log::error!("fatal GC error: {}", error);
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        let err = GcError::OutOfMemory { requested: 64 };
        assert_eq!("out of memory: could not allocate 64 bytes", err.to_string());

        let err = GcError::InvalidConfig {
            key: "GCgen0size".into(),
            value: "abc".into(),
        };
        assert_eq!(
            "invalid value \"abc\" for configuration key GCgen0size",
            err.to_string()
        );

        assert_eq!(
            "heap corruption detected (code 72)",
            FatalError::HeapCorruption.to_string()
        );
    }
}
