use std::ops::BitOr;

use parking_lot::Mutex;

use crate::gc::pinning::PinType;
use crate::gc::Address;

/// Location holding a reference: a stack slot, a static, a handle or a
/// field inside an object.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Slot(Address);

impl Slot {
    pub fn at(addr: Address) -> Slot {
        Slot(addr)
    }

    pub fn address(self) -> Address {
        self.0
    }

    pub fn get(self) -> Address {
        unsafe { *self.0.to_ptr::<Address>() }
    }

    pub fn set(self, obj: Address) {
        unsafe {
            *self.0.to_mut_ptr::<Address>() = obj;
        }
    }
}

/// How the execution engine vouches for a reported slot.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PromoteFlags(u8);

impl PromoteFlags {
    pub const NONE: PromoteFlags = PromoteFlags(0);
    /// may point into the middle of an object
    pub const INTERIOR: PromoteFlags = PromoteFlags(1);
    /// the object must not move
    pub const PINNED: PromoteFlags = PromoteFlags(2);
    /// the slot holds a word that may or may not be a reference
    pub const CONSERVATIVE: PromoteFlags = PromoteFlags(4);
    /// the slot belongs to static data
    pub const STATIC: PromoteFlags = PromoteFlags(8);
    /// the slot belongs to a handle
    pub const HANDLE: PromoteFlags = PromoteFlags(16);

    pub fn contains(self, other: PromoteFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// slots the collector must not update or move the target of
    pub fn is_pinning(self) -> bool {
        self.0 & (Self::INTERIOR.0 | Self::PINNED.0 | Self::CONSERVATIVE.0) != 0
    }

    pub fn pin_type(self) -> PinType {
        if self.contains(PromoteFlags::STATIC) {
            PinType::StaticData
        } else if self.contains(PromoteFlags::HANDLE) {
            PinType::Other
        } else {
            PinType::Stack
        }
    }
}

impl BitOr for PromoteFlags {
    type Output = PromoteFlags;

    fn bitor(self, rhs: PromoteFlags) -> PromoteFlags {
        PromoteFlags(self.0 | rhs.0)
    }
}

/// Context handed to every promote call.
#[derive(Copy, Clone, Debug)]
pub struct ScanContext {
    /// true while marking, false while relocating
    pub promotion: bool,
    pub condemned: usize,
    pub max_generation: usize,
    /// index of the scanning thread, selects the buffer the callback uses
    pub thread_number: usize,
}

impl ScanContext {
    pub fn for_thread(&self, thread_number: usize) -> ScanContext {
        ScanContext {
            thread_number,
            ..*self
        }
    }
}

/// Callback the execution engine invokes for every root slot. It may be
/// called from several threads at once.
pub type PromoteFn<'a> = &'a (dyn Fn(&ScanContext, Slot, PromoteFlags) + Sync);

/// One buffer per scanning thread, merged once enumeration is done.
pub struct PerThreadBuffers<T> {
    buffers: Vec<Mutex<Vec<T>>>,
}

impl<T> PerThreadBuffers<T> {
    pub fn new(threads: usize) -> PerThreadBuffers<T> {
        PerThreadBuffers {
            buffers: (0..threads.max(1)).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    pub fn push(&self, sc: &ScanContext, value: T) {
        let idx = sc.thread_number % self.buffers.len();
        self.buffers[idx].lock().push(value);
    }

    pub fn merge(self) -> Vec<T> {
        let mut result = Vec::new();

        for buffer in self.buffers {
            result.append(&mut buffer.into_inner());
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scoped_threadpool::Pool;

    #[test]
    fn test_slot() {
        let mut value = 0usize;
        let slot = Slot::at(Address::from_ptr(&mut value as *mut usize));
        slot.set(Address::from(0x40));
        assert_eq!(Address::from(0x40), slot.get());
        assert_eq!(0x40, value);
    }

    #[test]
    fn test_flags() {
        let flags = PromoteFlags::CONSERVATIVE | PromoteFlags::STATIC;
        assert!(flags.contains(PromoteFlags::STATIC));
        assert!(flags.is_pinning());
        assert_eq!(PinType::StaticData, flags.pin_type());
        assert_eq!(PinType::Other, PromoteFlags::HANDLE.pin_type());
        assert_eq!(PinType::Stack, PromoteFlags::PINNED.pin_type());
        assert!(!PromoteFlags::NONE.is_pinning());
    }

    #[test]
    fn test_concurrent_buffers() {
        let buffers: PerThreadBuffers<usize> = PerThreadBuffers::new(4);
        let sc = ScanContext {
            promotion: true,
            condemned: 0,
            max_generation: 2,
            thread_number: 0,
        };
        let mut pool = Pool::new(4);

        pool.scoped(|scope| {
            for thread in 0..8 {
                let buffers = &buffers;
                let sc = sc.for_thread(thread);
                scope.execute(move || {
                    for value in 0..100 {
                        buffers.push(&sc, thread * 100 + value);
                    }
                });
            }
        });

        let mut merged = buffers.merge();
        merged.sort_unstable();
        assert_eq!((0..800).collect::<Vec<_>>(), merged);
    }
}
