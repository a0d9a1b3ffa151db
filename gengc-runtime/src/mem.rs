/// size of a machine word in bytes
pub const WORD: usize = std::mem::size_of::<usize>();

#[inline(always)]
pub const fn ptr_width_usize() -> usize {
    WORD
}

/// rounds the given value up to the nearest multiple of `align`
#[inline(always)]
pub const fn align_usize_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// rounds the given value down to the nearest multiple of `align`
#[inline(always)]
pub const fn align_usize_down(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

#[inline(always)]
pub const fn is_aligned(value: usize, align: usize) -> bool {
    value & (align - 1) == 0
}
