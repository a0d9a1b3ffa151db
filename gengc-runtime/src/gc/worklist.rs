use std::alloc::{alloc, dealloc, Layout};
use std::mem::size_of;
use std::ptr::{self, NonNull};

use crate::gc::Address;
use crate::mem::ptr_width_usize;

const SEGMENT_SIZE: usize = 1024;
pub const SEGMENT_ENTRY_CAPACITY: usize =
    (SEGMENT_SIZE - size_of::<SegmentHeader>()) / ptr_width_usize();

/// Singly linked list of segments. Used for gray objects during marking and
/// for the remembered-set buffers flushed by mutators.
pub struct Worklist {
    head: *mut SegmentHeader,
    tail: *mut SegmentHeader,
    segments: usize,
}

impl Worklist {
    pub fn new() -> Worklist {
        Worklist {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            segments: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    pub fn segments(&self) -> usize {
        self.segments
    }

    pub fn append(&mut self, other: &mut Worklist) {
        if other.head.is_null() {
            return;
        }

        if self.head.is_null() {
            self.head = other.head;
        } else {
            self.tail_mut().next = other.head;
        }

        self.tail = other.tail;
        self.segments += other.segments;

        other.head = ptr::null_mut();
        other.tail = ptr::null_mut();
        other.segments = 0;
    }

    pub fn push_segment(&mut self, segment: WorklistSegment) {
        let ptr = segment.ptr.as_ptr();
        std::mem::forget(segment);

        if self.head.is_null() {
            self.head = ptr;
            self.tail = ptr;
        } else {
            self.tail_mut().next = ptr;
            self.tail = ptr;
        }

        self.segments += 1;
        debug_assert!(self.tail().next.is_null());
    }

    pub fn pop_segment(&mut self) -> Option<WorklistSegment> {
        if self.head.is_null() {
            None
        } else {
            let result = self.head;
            let new_head = self.head().next;

            self.head = new_head;
            if new_head.is_null() {
                self.tail = ptr::null_mut();
            }

            self.segments -= 1;

            unsafe {
                (*result).next = ptr::null_mut();
            }

            Some(WorklistSegment {
                ptr: unsafe { NonNull::new_unchecked(result) },
            })
        }
    }

    pub fn clear(&mut self) {
        let mut seg = self.head;
        let layout = layout_segment();

        while !seg.is_null() {
            unsafe {
                let next_seg = (*seg).next;
                dealloc(seg as *mut u8, layout);
                seg = next_seg;
            }
        }

        self.head = ptr::null_mut();
        self.tail = ptr::null_mut();
        self.segments = 0;
    }

    fn head(&self) -> &SegmentHeader {
        unsafe { &*self.head }
    }

    fn tail(&self) -> &SegmentHeader {
        unsafe { &*self.tail }
    }

    fn tail_mut(&mut self) -> &mut SegmentHeader {
        unsafe { &mut *self.tail }
    }
}

impl Default for Worklist {
    fn default() -> Worklist {
        Worklist::new()
    }
}

impl Drop for Worklist {
    fn drop(&mut self) {
        self.clear();
    }
}

unsafe impl Sync for Worklist {}
unsafe impl Send for Worklist {}

pub struct WorklistSegment {
    ptr: NonNull<SegmentHeader>,
}

impl WorklistSegment {
    pub fn new() -> WorklistSegment {
        WorklistSegment {
            ptr: alloc_segment(),
        }
    }

    pub fn push(&mut self, address: Address) -> bool {
        unsafe { self.ptr.as_mut().push(address) }
    }

    pub fn pop(&mut self) -> Option<Address> {
        unsafe { self.ptr.as_mut().pop() }
    }

    pub fn len(&self) -> usize {
        unsafe { self.ptr.as_ref().len }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == SEGMENT_ENTRY_CAPACITY
    }
}

impl Default for WorklistSegment {
    fn default() -> WorklistSegment {
        WorklistSegment::new()
    }
}

impl Drop for WorklistSegment {
    fn drop(&mut self) {
        unsafe {
            dealloc(self.ptr.as_ptr() as *mut u8, layout_segment());
        }
    }
}

unsafe impl Send for WorklistSegment {}

/// Stack of gray objects for a single marker: one active segment plus the
/// overflow list of full segments.
pub struct GrayStack {
    current: WorklistSegment,
    full: Worklist,
}

impl GrayStack {
    pub fn new() -> GrayStack {
        GrayStack {
            current: WorklistSegment::new(),
            full: Worklist::new(),
        }
    }

    pub fn push(&mut self, address: Address) {
        if !self.current.push(address) {
            let full = std::mem::replace(&mut self.current, WorklistSegment::new());
            self.full.push_segment(full);
            let pushed = self.current.push(address);
            debug_assert!(pushed);
        }
    }

    pub fn pop(&mut self) -> Option<Address> {
        if let Some(address) = self.current.pop() {
            return Some(address);
        }

        let segment = self.full.pop_segment()?;
        self.current = segment;
        self.current.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty() && self.full.is_empty()
    }
}

impl Default for GrayStack {
    fn default() -> GrayStack {
        GrayStack::new()
    }
}

#[repr(C)]
struct SegmentHeader {
    next: *mut SegmentHeader,
    len: usize,
}

impl SegmentHeader {
    fn push(&mut self, address: Address) -> bool {
        let old_len = self.len;
        if old_len < SEGMENT_ENTRY_CAPACITY {
            unsafe {
                ptr::write(self.data_raw_mut().add(old_len), address);
            }
            self.len = old_len + 1;
            true
        } else {
            false
        }
    }

    fn pop(&mut self) -> Option<Address> {
        let len = self.len;
        if len > 0 {
            self.len = len - 1;
            let value = unsafe { ptr::read(self.data_raw_mut().add(len - 1)) };
            Some(value)
        } else {
            None
        }
    }

    fn data_raw_mut(&mut self) -> *mut Address {
        unsafe { (self as *mut _ as *mut u8).add(size_of::<SegmentHeader>()) as *mut _ }
    }
}

fn alloc_segment() -> NonNull<SegmentHeader> {
    unsafe {
        let header = alloc(layout_segment()) as *mut SegmentHeader;

        if header.is_null() {
            std::alloc::handle_alloc_error(layout_segment());
        }

        (*header).next = ptr::null_mut();
        (*header).len = 0;

        NonNull::new_unchecked(header)
    }
}

fn layout_segment() -> Layout {
    // SEGMENT_SIZE is a non-zero multiple of the word size
    unsafe { Layout::from_size_align_unchecked(SEGMENT_SIZE, ptr_width_usize()) }
}

#[cfg(test)]
mod tests {
    use crate::gc::Address;

    use super::{GrayStack, Worklist, WorklistSegment, SEGMENT_ENTRY_CAPACITY};

    #[test]
    fn segments_in_worklist() {
        let mut worklist = Worklist::new();
        const SEGMENTS: usize = 10;

        for size in 0..SEGMENTS {
            let mut seg = WorklistSegment::new();
            for _ in 0..size {
                seg.push(Address::null());
            }
            assert_eq!(seg.len(), size);
            worklist.push_segment(seg);
        }

        assert_eq!(worklist.segments(), SEGMENTS);
        let mut popped = 0;

        while let Some(seg) = worklist.pop_segment() {
            assert_eq!(seg.len(), popped);
            popped += 1;
        }

        assert_eq!(popped, SEGMENTS);
        assert!(worklist.is_empty());
    }

    #[test]
    fn push_into_segment() {
        let mut seg = WorklistSegment::new();
        for idx in 0..SEGMENT_ENTRY_CAPACITY {
            assert_eq!(seg.len(), idx);
            assert!(seg.push(Address::null()));
        }
        assert!(seg.is_full());
        assert!(!seg.push(Address::null()));
    }

    #[test]
    fn pop_from_segment() {
        let mut seg = WorklistSegment::new();
        assert!(seg.push(1.into()));
        assert!(seg.push(2.into()));
        assert_eq!(seg.pop().expect("missing").to_usize(), 2);
        assert_eq!(seg.pop().expect("missing").to_usize(), 1);
        assert!(seg.pop().is_none());
    }

    #[test]
    fn append_and_clear() {
        let mut first = Worklist::new();
        let mut second = Worklist::new();
        first.push_segment(WorklistSegment::new());
        second.push_segment(WorklistSegment::new());
        second.push_segment(WorklistSegment::new());

        first.append(&mut second);
        assert_eq!(3, first.segments());
        assert!(second.is_empty());

        first.clear();
        assert!(first.is_empty());
    }

    #[test]
    fn gray_stack_overflows_into_segments() {
        let mut stack = GrayStack::new();
        let count = 3 * SEGMENT_ENTRY_CAPACITY + 5;

        for value in 1..=count {
            stack.push(value.into());
        }

        let mut sum = 0;
        let mut popped = 0;
        while let Some(address) = stack.pop() {
            sum += address.to_usize();
            popped += 1;
        }

        assert_eq!(count, popped);
        assert_eq!(count * (count + 1) / 2, sum);
        assert!(stack.is_empty());
    }
}
