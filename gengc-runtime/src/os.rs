use std::ptr;
use std::sync::OnceLock;

use crate::gc::Address;
use crate::mem;

static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

pub fn page_size() -> usize {
    *PAGE_SIZE.get_or_init(|| {
        let size = determine_page_size();
        assert!(size.is_power_of_two());
        size
    })
}

#[cfg(target_family = "unix")]
fn determine_page_size() -> usize {
    let val = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    if val <= 0 {
        panic!("could not determine page size.");
    }

    val as usize
}

#[cfg(target_family = "windows")]
fn determine_page_size() -> usize {
    use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

    unsafe {
        let mut system_info: SYSTEM_INFO = std::mem::zeroed();
        GetSystemInfo(&mut system_info);

        system_info.dwPageSize as usize
    }
}

/// Read-write memory reserved from the OS. Physical pages are only
/// backed on first touch and returned with `discard`.
pub struct Reservation {
    start: Address,
    size: usize,

    unaligned_start: Address,
    unaligned_size: usize,
}

impl Reservation {
    pub fn start(&self) -> Address {
        self.start
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn end(&self) -> Address {
        self.start.offset(self.size)
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        free(self.unaligned_start, self.unaligned_size);
    }
}

// SAFETY: a reservation is a plain address range without thread affinity.
unsafe impl Send for Reservation {}
unsafe impl Sync for Reservation {}

/// reserves `size` bytes starting at a multiple of `align`
pub fn reserve_align(size: usize, align: usize) -> Option<Reservation> {
    let page = page_size();
    debug_assert!(mem::is_aligned(size, page));

    let align = align.max(page);
    let unaligned_size = size + align - page;

    let unaligned_start = reserve(unaligned_size)?;
    let start: Address = mem::align_usize_up(unaligned_start.to_usize(), align).into();

    if cfg!(target_family = "unix") {
        let gap_start = start.offset_from(unaligned_start);
        let gap_end = unaligned_size - size - gap_start;

        if gap_start > 0 {
            free(unaligned_start, gap_start);
        }

        if gap_end > 0 {
            free(start.offset(size), gap_end);
        }

        Some(Reservation {
            start,
            size,
            unaligned_start: start,
            unaligned_size: size,
        })
    } else {
        Some(Reservation {
            start,
            size,
            unaligned_start,
            unaligned_size,
        })
    }
}

#[cfg(target_family = "unix")]
fn reserve(size: usize) -> Option<Address> {
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        return None;
    }

    Some(Address::from_ptr(ptr))
}

#[cfg(target_family = "windows")]
fn reserve(size: usize) -> Option<Address> {
    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE,
    };

    let ptr = unsafe { VirtualAlloc(ptr::null(), size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };

    if ptr.is_null() {
        return None;
    }

    Some(Address::from_ptr(ptr))
}

#[cfg(target_family = "unix")]
fn free(ptr: Address, size: usize) {
    let result = unsafe { libc::munmap(ptr.to_mut_ptr(), size) };

    if result != 0 {
        panic!("munmap() failed");
    }
}

#[cfg(target_family = "windows")]
fn free(ptr: Address, _size: usize) {
    use windows_sys::Win32::System::Memory::{VirtualFree, MEM_RELEASE};

    let result = unsafe { VirtualFree(ptr.to_mut_ptr(), 0, MEM_RELEASE) };

    if result == 0 {
        panic!("VirtualFree failed");
    }
}

/// gives the physical pages of the range back to the OS, the range
/// stays reserved and readable
#[cfg(target_family = "unix")]
pub fn discard(ptr: Address, size: usize) {
    debug_assert!(mem::is_aligned(ptr.to_usize(), page_size()));
    debug_assert!(mem::is_aligned(size, page_size()));

    let res = unsafe { libc::madvise(ptr.to_mut_ptr(), size, libc::MADV_DONTNEED) };

    if res != 0 {
        panic!("discarding memory with madvise() failed");
    }
}

#[cfg(target_family = "windows")]
pub fn discard(ptr: Address, size: usize) {
    debug_assert!(mem::is_aligned(ptr.to_usize(), page_size()));
    debug_assert!(mem::is_aligned(size, page_size()));

    use windows_sys::Win32::System::Memory::{VirtualAlloc, MEM_RESET, PAGE_READWRITE};

    let result = unsafe { VirtualAlloc(ptr.to_ptr(), size, MEM_RESET, PAGE_READWRITE) };

    if result.is_null() {
        panic!("VirtualAlloc(MEM_RESET) failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_align() {
        let align = 64 * 1024;
        let reservation = reserve_align(4 * align, align).expect("reservation failed");
        assert!(mem::is_aligned(reservation.start().to_usize(), align));
        assert_eq!(4 * align, reservation.size());

        unsafe {
            *reservation.start().to_mut_ptr::<usize>() = 17;
            assert_eq!(17, *reservation.start().to_ptr::<usize>());
        }

        discard(reservation.start(), align);
    }
}
