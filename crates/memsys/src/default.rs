//! Default allocator - platform heap with size tracking

use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::alloc::{self, Layout};

use crate::header::{self, AllocationHeader, HEADER_ALIGN, HEADER_SIZE, MAX_TRACKED_SIZE};
use crate::{AllocRequest, AllocResult, Allocator};

/// Tracked passthrough to the platform allocator
///
/// No pooling at all: each request becomes one platform allocation, padded
/// with an [`AllocationHeader`] so the requested and padded sizes can be
/// read back from the bare pointer. The running total is exact and is
/// expected to be zero again when the allocator is dropped.
#[derive(Debug, Default)]
pub struct DefaultAllocator {
    /// Padded bytes currently allocated
    total_allocated: AtomicUsize,
}

impl DefaultAllocator {
    pub const fn new() -> Self {
        Self {
            total_allocated: AtomicUsize::new(0),
        }
    }

    /// Bytes taken from the platform for a request
    fn size_with_padding(size: usize, align: usize) -> Option<usize> {
        HEADER_SIZE
            .checked_add(align)?
            .checked_add(size)
            .filter(|total| *total <= MAX_TRACKED_SIZE)
    }
}

impl Allocator for DefaultAllocator {
    fn allocate(&self, request: AllocRequest) -> AllocResult {
        let align = request.alignment.max(HEADER_ALIGN);

        let Some(layout) = Self::size_with_padding(request.size, align)
            .and_then(|total| Layout::from_size_align(total, HEADER_ALIGN).ok())
        else {
            log::trace!(
                "DefaultAllocator: {} bytes aligned to {} exceed the tracked size range",
                request.size,
                align
            );
            return AllocResult::null(request);
        };

        // SAFETY: the layout is never zero-sized, it always holds a header
        let Some(raw) = NonNull::new(unsafe { alloc::alloc(layout) }) else {
            log::warn!("DefaultAllocator: platform allocation of {} bytes failed", layout.size());
            return AllocResult::null(request);
        };

        let header = raw.as_ptr().cast::<AllocationHeader>();
        let data = header::data_pointer(header, align);
        unsafe {
            header::fill(header, data, layout.size(), request.size);
        }
        self.total_allocated.fetch_add(layout.size(), Ordering::Relaxed);

        match NonNull::new(data) {
            Some(data) => AllocResult::new(data, request.size, align),
            None => AllocResult::null(request),
        }
    }

    unsafe fn deallocate(&self, pointer: *mut u8) {
        if pointer.is_null() {
            return;
        }

        let header = header::header_of(pointer);
        let allocated = (*header).allocated_size as usize;
        self.total_allocated.fetch_sub(allocated, Ordering::Relaxed);
        alloc::dealloc(
            header.cast(),
            Layout::from_size_align_unchecked(allocated, HEADER_ALIGN),
        );
    }

    unsafe fn allocated_size(&self, pointer: *mut u8) -> Option<usize> {
        if pointer.is_null() {
            return None;
        }
        Some((*header::header_of(pointer)).requested_size as usize)
    }

    fn total_allocated(&self) -> Option<usize> {
        Some(self.total_allocated.load(Ordering::Relaxed))
    }
}

impl Drop for DefaultAllocator {
    fn drop(&mut self) {
        let leaked = *self.total_allocated.get_mut();
        if leaked != 0 {
            log::error!("DefaultAllocator dropped with {} bytes still allocated", leaked);
            if !std::thread::panicking() {
                panic!("DefaultAllocator leaked {} bytes", leaked);
            }
        }
    }
}
