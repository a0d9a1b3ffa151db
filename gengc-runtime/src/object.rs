use std::borrow::Cow;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::gc::root::Slot;
use crate::gc::Address;
use crate::mem;

pub const HEADER_SIZE: usize = 2 * mem::WORD;
pub const ARRAY_HEADER_SIZE: usize = HEADER_SIZE + mem::WORD;
pub const MIN_OBJECT_SIZE: usize = HEADER_SIZE;

const FWDPTR_BIT: usize = 1;

const MARK_BIT: usize = 1 << 0;
const SCANNED_BIT: usize = 1 << 1;
const REMEMBERED_BIT: usize = 1 << 2;
const PINNED_BIT: usize = 1 << 3;
const FINALIZABLE_BIT: usize = 1 << 4;

// bits that survive a copy to a new location
const PRESERVED_BITS: usize = FINALIZABLE_BIT;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ObjectKind {
    /// fixed number of words, some of them references
    Fixed,
    /// length word followed by references
    RefArray,
    /// length word followed by raw bytes
    ByteArray,
    /// unused memory, metadata word holds the size
    Free,
}

pub struct TypeDescriptor {
    name: Cow<'static, str>,
    kind: ObjectKind,
    instance_size: usize,
    reference_offsets: Vec<usize>,
    has_finalizer: bool,
}

static FREE_OBJECT: TypeDescriptor = TypeDescriptor {
    name: Cow::Borrowed("FreeObject"),
    kind: ObjectKind::Free,
    instance_size: 0,
    reference_offsets: Vec::new(),
    has_finalizer: false,
};

impl TypeDescriptor {
    /// Object with `words` payload words. `references` lists the payload
    /// word indices that hold references.
    pub fn fixed(name: impl Into<Cow<'static, str>>, words: usize, references: &[usize]) -> Self {
        for &idx in references {
            assert!(idx < words, "reference field {} out of bounds", idx);
        }

        TypeDescriptor {
            name: name.into(),
            kind: ObjectKind::Fixed,
            instance_size: HEADER_SIZE + words * mem::WORD,
            reference_offsets: references
                .iter()
                .map(|idx| HEADER_SIZE + idx * mem::WORD)
                .collect(),
            has_finalizer: false,
        }
    }

    pub fn ref_array(name: impl Into<Cow<'static, str>>) -> Self {
        TypeDescriptor {
            name: name.into(),
            kind: ObjectKind::RefArray,
            instance_size: ARRAY_HEADER_SIZE,
            reference_offsets: Vec::new(),
            has_finalizer: false,
        }
    }

    pub fn byte_array(name: impl Into<Cow<'static, str>>) -> Self {
        TypeDescriptor {
            name: name.into(),
            kind: ObjectKind::ByteArray,
            instance_size: ARRAY_HEADER_SIZE,
            reference_offsets: Vec::new(),
            has_finalizer: false,
        }
    }

    pub fn with_finalizer(mut self) -> Self {
        self.has_finalizer = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn has_finalizer(&self) -> bool {
        self.has_finalizer
    }

    pub fn is_array(&self) -> bool {
        matches!(self.kind, ObjectKind::RefArray | ObjectKind::ByteArray)
    }

    pub fn payload_words(&self) -> usize {
        debug_assert_eq!(self.kind, ObjectKind::Fixed);
        (self.instance_size - HEADER_SIZE) / mem::WORD
    }

    /// size in bytes of an instance, `length` is ignored for fixed objects
    pub fn object_size(&self, length: usize) -> usize {
        match self.kind {
            ObjectKind::Fixed => self.instance_size,
            ObjectKind::RefArray => ARRAY_HEADER_SIZE + length * mem::WORD,
            ObjectKind::ByteArray => mem::align_usize_up(ARRAY_HEADER_SIZE + length, mem::WORD),
            ObjectKind::Free => unreachable!("free objects have no instance size"),
        }
    }

    fn address(&'static self) -> Address {
        Address::from_ptr(self as *const TypeDescriptor)
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("instance_size", &self.instance_size)
            .finish()
    }
}

/// Handle to a registered type. Descriptors are referenced by address
/// from object headers and live as long as the process.
#[derive(Copy, Clone, Debug)]
pub struct TypeRef(&'static TypeDescriptor);

impl TypeRef {
    pub fn register(descriptor: TypeDescriptor) -> TypeRef {
        TypeRef(Box::leak(Box::new(descriptor)))
    }

    pub fn descriptor(self) -> &'static TypeDescriptor {
        self.0
    }
}

impl std::ops::Deref for TypeRef {
    type Target = TypeDescriptor;

    fn deref(&self) -> &TypeDescriptor {
        self.0
    }
}

impl PartialEq for TypeRef {
    fn eq(&self, other: &TypeRef) -> bool {
        ptr::eq(self.0, other.0)
    }
}

impl Eq for TypeRef {}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Color {
    White,
    Gray,
    Black,
}

pub enum VtblptrWordKind {
    /// one word of unused memory
    FillerWord,
    Vtblptr(&'static TypeDescriptor),
    Fwdptr(Address),
}

#[repr(C)]
pub struct Header {
    vtblptr: AtomicUsize,
    metadata: AtomicUsize,
}

impl Header {
    #[inline(always)]
    pub const fn size() -> usize {
        HEADER_SIZE
    }

    #[inline(always)]
    pub fn vtblptr_or_fwdptr(&self) -> VtblptrWordKind {
        let value = self.vtblptr.load(Ordering::Relaxed);

        if value == 0 {
            VtblptrWordKind::FillerWord
        } else if value & FWDPTR_BIT != 0 {
            VtblptrWordKind::Fwdptr((value & !FWDPTR_BIT).into())
        } else {
            VtblptrWordKind::Vtblptr(unsafe { &*(value as *const TypeDescriptor) })
        }
    }

    pub fn install_fwdptr(&self, address: Address) {
        debug_assert!(mem::is_aligned(address.to_usize(), mem::WORD));
        self.vtblptr
            .store(address.to_usize() | FWDPTR_BIT, Ordering::Relaxed);
    }

    pub fn fwdptr(&self) -> Option<Address> {
        match self.vtblptr_or_fwdptr() {
            VtblptrWordKind::Fwdptr(address) => Some(address),
            _ => None,
        }
    }

    /// white -> gray, true if this call did the transition
    #[inline(always)]
    pub fn try_mark(&self) -> bool {
        let mut current = self.metadata.load(Ordering::Relaxed);
        loop {
            if current & MARK_BIT != 0 {
                return false;
            }

            match self.metadata.compare_exchange_weak(
                current,
                current | MARK_BIT,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    #[inline(always)]
    pub fn is_marked(&self) -> bool {
        self.metadata.load(Ordering::Acquire) & MARK_BIT != 0
    }

    /// gray -> black
    #[inline(always)]
    pub fn set_scanned(&self) {
        self.metadata.fetch_or(SCANNED_BIT, Ordering::Relaxed);
    }

    pub fn color(&self) -> Color {
        let value = self.metadata.load(Ordering::Relaxed);

        if value & MARK_BIT == 0 {
            Color::White
        } else if value & SCANNED_BIT == 0 {
            Color::Gray
        } else {
            Color::Black
        }
    }

    /// marks and pins, true if the object was white before
    pub fn mark_pinned(&self) -> bool {
        let old = self
            .metadata
            .fetch_or(MARK_BIT | PINNED_BIT, Ordering::AcqRel);
        old & MARK_BIT == 0
    }

    #[inline(always)]
    pub fn is_pinned(&self) -> bool {
        self.metadata.load(Ordering::Relaxed) & PINNED_BIT != 0
    }

    /// resets color and pin state at the end of a collection
    pub fn clear_gc_bits(&self) {
        self.metadata
            .fetch_and(!(MARK_BIT | SCANNED_BIT | PINNED_BIT), Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn is_remembered(&self) -> bool {
        self.metadata.load(Ordering::Relaxed) & REMEMBERED_BIT != 0
    }

    /// true if the bit was not set before
    #[inline(always)]
    pub fn try_remember(&self) -> bool {
        let old = self.metadata.fetch_or(REMEMBERED_BIT, Ordering::AcqRel);
        old & REMEMBERED_BIT == 0
    }

    pub fn clear_remembered(&self) {
        self.metadata.fetch_and(!REMEMBERED_BIT, Ordering::Relaxed);
    }

    pub fn is_finalizable(&self) -> bool {
        self.metadata.load(Ordering::Relaxed) & FINALIZABLE_BIT != 0
    }

    /// Returns true if the bit was clear before.
    pub fn set_finalizable(&self) -> bool {
        let old = self.metadata.fetch_or(FINALIZABLE_BIT, Ordering::AcqRel);
        old & FINALIZABLE_BIT == 0
    }

    pub fn clear_finalizable(&self) {
        self.metadata.fetch_and(!FINALIZABLE_BIT, Ordering::Relaxed);
    }

    fn setup(&self, descriptor: &'static TypeDescriptor) {
        self.vtblptr
            .store(descriptor.address().to_usize(), Ordering::Relaxed);
        let metadata = if descriptor.has_finalizer {
            FINALIZABLE_BIT
        } else {
            0
        };
        self.metadata.store(metadata, Ordering::Relaxed);
    }

    fn reset_after_copy(&self) {
        let value = self.metadata.load(Ordering::Relaxed);
        self.metadata
            .store(value & PRESERVED_BITS, Ordering::Relaxed);
    }

    fn free_size(&self) -> usize {
        self.metadata.load(Ordering::Relaxed)
    }
}

// is used to reference any object
#[repr(C)]
pub struct Obj {
    header: Header,
}

impl Obj {
    #[inline(always)]
    pub fn address(&self) -> Address {
        Address::from_ptr(self as *const _)
    }

    #[inline(always)]
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// descriptor of this object, follows a forwarding pointer
    pub fn descriptor(&self) -> &'static TypeDescriptor {
        match self.header.vtblptr_or_fwdptr() {
            VtblptrWordKind::Vtblptr(descriptor) => descriptor,
            VtblptrWordKind::Fwdptr(address) => address.to_obj().descriptor(),
            VtblptrWordKind::FillerWord => panic!("filler word at {} has no type", self.address()),
        }
    }

    pub fn is_filler(&self) -> bool {
        match self.header.vtblptr_or_fwdptr() {
            VtblptrWordKind::FillerWord => true,
            VtblptrWordKind::Vtblptr(descriptor) => descriptor.kind == ObjectKind::Free,
            VtblptrWordKind::Fwdptr(_) => false,
        }
    }

    pub fn size(&self) -> usize {
        match self.header.vtblptr_or_fwdptr() {
            VtblptrWordKind::FillerWord => mem::WORD,
            VtblptrWordKind::Fwdptr(address) => address.to_obj().size(),
            VtblptrWordKind::Vtblptr(descriptor) => match descriptor.kind {
                ObjectKind::Free => self.header.free_size(),
                ObjectKind::Fixed => descriptor.instance_size,
                ObjectKind::RefArray | ObjectKind::ByteArray => {
                    descriptor.object_size(self.array_length())
                }
            },
        }
    }

    pub fn array_length(&self) -> usize {
        unsafe { *self.address().offset(HEADER_SIZE).to_ptr::<usize>() }
    }

    /// slot of the payload word `idx` of a fixed object
    pub fn field(&self, idx: usize) -> Slot {
        debug_assert!(idx < self.descriptor().payload_words());
        Slot::at(self.address().offset(HEADER_SIZE + idx * mem::WORD))
    }

    /// slot of element `idx` of a reference array
    pub fn element(&self, idx: usize) -> Slot {
        debug_assert_eq!(self.descriptor().kind, ObjectKind::RefArray);
        assert!(idx < self.array_length(), "array index out of bounds");
        Slot::at(self.address().offset(ARRAY_HEADER_SIZE + idx * mem::WORD))
    }

    pub fn bytes(&self) -> *mut u8 {
        debug_assert_eq!(self.descriptor().kind, ObjectKind::ByteArray);
        self.address().offset(ARRAY_HEADER_SIZE).to_mut_ptr()
    }

    pub fn visit_reference_fields<F>(&self, mut f: F)
    where
        F: FnMut(Slot),
    {
        let descriptor = self.descriptor();
        let object = self.address();

        match descriptor.kind {
            ObjectKind::Fixed => {
                for &offset in &descriptor.reference_offsets {
                    f(Slot::at(object.offset(offset)));
                }
            }

            ObjectKind::RefArray => {
                let mut ptr = object.offset(ARRAY_HEADER_SIZE);
                let limit = ptr.add_ptr(self.array_length());

                while ptr < limit {
                    f(Slot::at(ptr));
                    ptr = ptr.add_ptr(1);
                }
            }

            ObjectKind::ByteArray | ObjectKind::Free => {}
        }
    }

    /// copies the object and resets the GC bits of the copy
    pub fn copy_to(&self, dest: Address, size: usize) {
        unsafe {
            ptr::copy_nonoverlapping(
                self as *const Obj as *const u8,
                dest.to_mut_ptr::<u8>(),
                size,
            );
        }

        dest.to_obj().header().reset_after_copy();
    }
}

/// Writes a fresh object into zeroed memory of `size` bytes.
///
/// # Safety
///
/// `[address, address + size)` must be unused heap memory owned by the caller.
pub unsafe fn initialize_object(address: Address, ty: TypeRef, length: usize, size: usize) {
    unsafe {
        ptr::write_bytes(address.to_mut_ptr::<u8>(), 0, size);
    }

    let obj = address.to_obj();
    obj.header().setup(ty.descriptor());

    if ty.is_array() {
        unsafe {
            *address.offset(HEADER_SIZE).to_mut_ptr::<usize>() = length;
        }
    }
}

/// Fills unused memory with a filler so that the page stays iterable.
pub fn fill_region(start: Address, end: Address) {
    if start == end {
        // nothing to do
    } else if end.offset_from(start) == mem::WORD {
        unsafe {
            *start.to_mut_ptr::<usize>() = 0;
        }
    } else {
        let size = end.offset_from(start);
        debug_assert!(size >= MIN_OBJECT_SIZE);

        unsafe {
            *start.to_mut_ptr::<usize>() = FREE_OBJECT.address().to_usize();
            *start.add_ptr(1).to_mut_ptr::<usize>() = size;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_memory<F: FnOnce(Address)>(words: usize, f: F) {
        let mut memory = vec![0usize; words];
        f(Address::from_ptr(memory.as_mut_ptr()));
    }

    #[test]
    fn test_fixed_object() {
        let ty = TypeRef::register(TypeDescriptor::fixed("Pair", 3, &[0, 2]));
        assert_eq!(HEADER_SIZE + 3 * mem::WORD, ty.object_size(0));

        with_memory(8, |address| {
            unsafe { initialize_object(address, ty, 0, ty.object_size(0)) };
            let obj = address.to_obj();
            assert_eq!(ty.object_size(0), obj.size());
            assert_eq!("Pair", obj.descriptor().name());

            let mut slots = Vec::new();
            obj.visit_reference_fields(|slot| slots.push(slot.address()));
            assert_eq!(vec![obj.field(0).address(), obj.field(2).address()], slots);
        });
    }

    #[test]
    fn test_arrays() {
        let refs = TypeRef::register(TypeDescriptor::ref_array("Object[]"));
        let bytes = TypeRef::register(TypeDescriptor::byte_array("byte[]"));
        assert_eq!(ARRAY_HEADER_SIZE + 4 * mem::WORD, refs.object_size(4));
        assert_eq!(ARRAY_HEADER_SIZE + mem::WORD, bytes.object_size(3));

        with_memory(16, |address| {
            unsafe { initialize_object(address, refs, 4, refs.object_size(4)) };
            let obj = address.to_obj();
            assert_eq!(4, obj.array_length());
            let mut count = 0;
            obj.visit_reference_fields(|_| count += 1);
            assert_eq!(4, count);
        });
    }

    #[test]
    fn test_colors_and_pins() {
        let ty = TypeRef::register(TypeDescriptor::fixed("Leaf", 1, &[]));

        with_memory(4, |address| {
            unsafe { initialize_object(address, ty, 0, ty.object_size(0)) };
            let header = address.to_obj().header();
            assert_eq!(Color::White, header.color());
            assert!(header.try_mark());
            assert!(!header.try_mark());
            assert_eq!(Color::Gray, header.color());
            header.set_scanned();
            assert_eq!(Color::Black, header.color());
            assert!(!header.mark_pinned());
            assert!(header.is_pinned());
            header.clear_gc_bits();
            assert_eq!(Color::White, header.color());
            assert!(!header.is_pinned());
        });
    }

    #[test]
    fn test_forwarding() {
        let ty = TypeRef::register(TypeDescriptor::fixed("Leaf", 1, &[]).with_finalizer());
        let size = ty.object_size(0);

        with_memory(8, |address| {
            let copy = address.offset(size);
            unsafe { initialize_object(address, ty, 0, size) };
            let obj = address.to_obj();
            assert!(obj.header().is_finalizable());
            obj.header().try_mark();

            obj.copy_to(copy, size);
            obj.header().install_fwdptr(copy);

            assert_eq!(Some(copy), obj.header().fwdptr());
            assert_eq!(size, obj.size());
            assert!(!copy.to_obj().header().is_marked());
            assert!(copy.to_obj().header().is_finalizable());
        });
    }

    #[test]
    fn test_fill_region() {
        with_memory(8, |address| {
            fill_region(address, address.add_ptr(1));
            assert!(address.to_obj().is_filler());
            assert_eq!(mem::WORD, address.to_obj().size());

            fill_region(address.add_ptr(1), address.add_ptr(8));
            let obj = address.add_ptr(1).to_obj();
            assert!(obj.is_filler());
            assert_eq!(7 * mem::WORD, obj.size());
        });
    }
}
