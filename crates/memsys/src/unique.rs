//! Allocator-owned boxes

use core::fmt;
use core::marker::PhantomData;
use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};
use core::ptr::{self, NonNull};

use crate::{AllocRequest, Allocator};

/// A single `T` living in memory from a borrowed allocator
///
/// Dropping the box drops the value and hands the memory back to the
/// allocator it came from.
pub struct AllocBox<'a, T, A: Allocator + ?Sized> {
    allocator: &'a A,
    pointer: NonNull<T>,
    _marker: PhantomData<T>,
}

impl<'a, T, A: Allocator + ?Sized> AllocBox<'a, T, A> {
    /// Move `value` into memory from `allocator`
    pub fn new_in(value: T, allocator: &'a A) -> Option<Self> {
        let pointer = allocator
            .allocate(AllocRequest::of::<T>())
            .memory?
            .cast::<T>();
        unsafe {
            pointer.as_ptr().write(value);
        }

        Some(Self {
            allocator,
            pointer,
            _marker: PhantomData,
        })
    }

    /// Rebuild a box from [`AllocBox::into_raw`]
    ///
    /// # Safety
    /// `pointer` must come from `into_raw` on a box using the same allocator,
    /// and must not be owned by anything else.
    pub unsafe fn from_raw_in(pointer: NonNull<T>, allocator: &'a A) -> Self {
        Self {
            allocator,
            pointer,
            _marker: PhantomData,
        }
    }

    /// Give up ownership without freeing anything
    pub fn into_raw(this: Self) -> NonNull<T> {
        ManuallyDrop::new(this).pointer
    }

    /// Move the value out and free its memory
    pub fn into_inner(this: Self) -> T {
        let this = ManuallyDrop::new(this);
        unsafe {
            let value = this.pointer.as_ptr().read();
            this.allocator.deallocate(this.pointer.as_ptr().cast());
            value
        }
    }

    pub fn allocator(this: &Self) -> &'a A {
        this.allocator
    }
}

impl<T, A: Allocator + ?Sized> Deref for AllocBox<'_, T, A> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.pointer.as_ref() }
    }
}

impl<T, A: Allocator + ?Sized> DerefMut for AllocBox<'_, T, A> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { self.pointer.as_mut() }
    }
}

impl<T, A: Allocator + ?Sized> Drop for AllocBox<'_, T, A> {
    fn drop(&mut self) {
        unsafe {
            ptr::drop_in_place(self.pointer.as_ptr());
            self.allocator.deallocate(self.pointer.as_ptr().cast());
        }
    }
}

impl<T: fmt::Debug, A: Allocator + ?Sized> fmt::Debug for AllocBox<'_, T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
