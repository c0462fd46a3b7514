//! The allocation contract shared by every allocator

use core::mem::{align_of, size_of};
use core::ptr::{self, NonNull};
use std::sync::Arc;

use parking_lot::Mutex;

/// Size and alignment of a requested allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocRequest {
    /// Bytes requested
    pub size: usize,
    /// Required alignment, always a power of two
    pub alignment: usize,
}

impl AllocRequest {
    /// Alignment used when the caller does not care
    pub const DEFAULT_ALIGN: usize = 4;

    pub fn new(size: usize, alignment: usize) -> Self {
        assert!(
            alignment.is_power_of_two(),
            "alignment {} is not a power of two",
            alignment
        );
        Self { size, alignment }
    }

    /// Request with the default alignment
    pub fn sized(size: usize) -> Self {
        Self::new(size, Self::DEFAULT_ALIGN)
    }

    /// Request fitting a single `T`
    pub fn of<T>() -> Self {
        Self::new(size_of::<T>(), align_of::<T>())
    }

    /// Request fitting `count` consecutive `T`s
    pub fn array<T>(count: usize) -> Self {
        Self::new(size_of::<T>().saturating_mul(count), align_of::<T>())
    }
}

/// Outcome of an allocation
///
/// `memory` is `None` only when the allocator could not serve the request
/// and had nothing to fall back on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocResult {
    pub memory: Option<NonNull<u8>>,
    pub size: usize,
    pub alignment: usize,
}

impl AllocResult {
    pub fn new(memory: NonNull<u8>, size: usize, alignment: usize) -> Self {
        Self {
            memory: Some(memory),
            size,
            alignment,
        }
    }

    /// A result carrying no memory
    pub fn null(request: AllocRequest) -> Self {
        Self {
            memory: None,
            size: request.size,
            alignment: request.alignment,
        }
    }

    pub fn is_null(&self) -> bool {
        self.memory.is_none()
    }

    /// Raw pointer to the memory, null when the allocation failed
    pub fn as_ptr(&self) -> *mut u8 {
        self.memory.map_or(ptr::null_mut(), NonNull::as_ptr)
    }
}

/// Common trait for all allocators
pub trait Allocator {
    /// Allocate memory for the given request
    fn allocate(&self, request: AllocRequest) -> AllocResult;

    /// Return memory to the allocator. Null pointers are ignored.
    ///
    /// # Safety
    /// The pointer must have been returned by `allocate` on this allocator
    /// and must not have been deallocated since.
    unsafe fn deallocate(&self, pointer: *mut u8);

    /// Size originally requested for `pointer`, `None` if not tracked
    ///
    /// # Safety
    /// The pointer must be a live allocation of this allocator.
    unsafe fn allocated_size(&self, pointer: *mut u8) -> Option<usize>;

    /// Bytes currently attributed to this allocator, `None` if not tracked
    fn total_allocated(&self) -> Option<usize>;

    /// Allocate and initialize a single value
    fn create<T>(&self, value: T) -> Option<NonNull<T>>
    where
        Self: Sized,
    {
        let object = self.allocate(AllocRequest::of::<T>()).memory?.cast::<T>();
        unsafe {
            object.as_ptr().write(value);
        }
        Some(object)
    }

    /// Drop a value made with [`Allocator::create`] and free its memory
    ///
    /// # Safety
    /// `object` must come from `create` on this allocator and must not be
    /// used afterwards.
    unsafe fn destroy<T>(&self, object: NonNull<T>)
    where
        Self: Sized,
    {
        ptr::drop_in_place(object.as_ptr());
        self.deallocate(object.as_ptr().cast());
    }
}

macro_rules! forward_allocator {
    ($($target:ty),* $(,)?) => {$(
        impl<A: Allocator + ?Sized> Allocator for $target {
            #[inline]
            fn allocate(&self, request: AllocRequest) -> AllocResult {
                (**self).allocate(request)
            }

            #[inline]
            unsafe fn deallocate(&self, pointer: *mut u8) {
                (**self).deallocate(pointer)
            }

            #[inline]
            unsafe fn allocated_size(&self, pointer: *mut u8) -> Option<usize> {
                (**self).allocated_size(pointer)
            }

            #[inline]
            fn total_allocated(&self) -> Option<usize> {
                (**self).total_allocated()
            }
        }
    )*};
}

forward_allocator!(&A, Box<A>, Arc<A>);

/// Serialized access to an allocator that is not thread-safe on its own
impl<A: Allocator + ?Sized> Allocator for Mutex<A> {
    fn allocate(&self, request: AllocRequest) -> AllocResult {
        self.lock().allocate(request)
    }

    unsafe fn deallocate(&self, pointer: *mut u8) {
        self.lock().deallocate(pointer)
    }

    unsafe fn allocated_size(&self, pointer: *mut u8) -> Option<usize> {
        self.lock().allocated_size(pointer)
    }

    fn total_allocated(&self) -> Option<usize> {
        self.lock().total_allocated()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DefaultAllocator;

    #[test]
    fn test_request_constructors() {
        let request = AllocRequest::of::<u64>();
        assert_eq!(request.size, 8);
        assert_eq!(request.alignment, 8);

        let request = AllocRequest::array::<u32>(10);
        assert_eq!(request.size, 40);
        assert_eq!(request.alignment, 4);

        assert_eq!(AllocRequest::sized(3).alignment, AllocRequest::DEFAULT_ALIGN);
    }

    #[test]
    #[should_panic(expected = "not a power of two")]
    fn test_request_rejects_odd_alignment() {
        AllocRequest::new(16, 12);
    }

    #[test]
    fn test_null_result() {
        let result = AllocResult::null(AllocRequest::sized(8));
        assert!(result.is_null());
        assert!(result.as_ptr().is_null());
    }

    #[test]
    fn test_create_and_destroy() {
        let alloc = DefaultAllocator::new();

        let value = alloc.create([7u64; 4]).unwrap();
        unsafe {
            assert_eq!(*value.as_ptr(), [7; 4]);
            alloc.destroy(value);
        }
        assert_eq!(alloc.total_allocated(), Some(0));
    }

    #[test]
    fn test_forwarding_impls() {
        let alloc = Arc::new(DefaultAllocator::new());
        let shared: Arc<dyn Allocator + Send + Sync> = alloc.clone();
        let boxed: Box<dyn Allocator> = Box::new(Arc::clone(&alloc));
        let locked = Mutex::new(Arc::clone(&alloc));

        let a = shared.allocate(AllocRequest::sized(10));
        let b = boxed.allocate(AllocRequest::sized(20));
        let c = (&locked).allocate(AllocRequest::sized(30));

        unsafe {
            assert_eq!(alloc.allocated_size(a.as_ptr()), Some(10));
            assert_eq!(boxed.allocated_size(b.as_ptr()), Some(20));
            assert_eq!(locked.allocated_size(c.as_ptr()), Some(30));

            shared.deallocate(a.as_ptr());
            boxed.deallocate(b.as_ptr());
            locked.deallocate(c.as_ptr());
        }
        assert_eq!(alloc.total_allocated(), Some(0));
    }
}
