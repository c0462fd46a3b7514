//! Ring allocator - scratch memory in a circular buffer
//!
//! Allocations are bumped through a fixed buffer by the `allocate` cursor
//! and wrap around at the end. The `free` cursor trails behind and only
//! moves past allocations that were released, in allocation order. The
//! circular span from `free` to `allocate` is live (or waiting to be
//! reclaimed), everything else is available.
//!
//! A long-lived allocation pins the `free` cursor. Once the ring runs into
//! it, requests are served by the backing allocator until it is released.

use core::cell::Cell;
use core::ptr::NonNull;

use crate::config::RingParams;
use crate::error::{MemError, Result};
use crate::header::{self, AllocationHeader, HEADER_ALIGN, HEADER_SIZE};
use crate::{AllocRequest, AllocResult, Allocator, align_up, is_aligned};

/// Marks a header's allocation as released
pub const FREE_BIT: u32 = 0x8000_0000;

/// Strips [`FREE_BIT`] from a size field
pub const FREE_MASK: u32 = !FREE_BIT;

/// Alignment requested for the ring buffer itself
const RING_BUFFER_ALIGN: usize = 16;

/// Ring allocator for short-lived allocations
///
/// Not thread-safe: the cursors are updated without synchronization. Use
/// one ring per thread, or wrap it in a `parking_lot::Mutex`.
pub struct RingAllocator<B: Allocator> {
    backing: B,
    params: RingParams,
    /// Start of the ring buffer
    begin: NonNull<u8>,
    capacity: usize,
    /// Offset where the next allocation starts
    allocate: Cell<usize>,
    /// Offset of the oldest allocation not yet reclaimed
    free: Cell<usize>,
    /// `allocate` caught up with `free` from behind
    full: Cell<bool>,
}

// Safety: the ring buffer is owned exclusively by this allocator
unsafe impl<B: Allocator + Send> Send for RingAllocator<B> {}

impl<B: Allocator> RingAllocator<B> {
    /// Create a ring allocator, taking its buffer from `backing`
    pub fn new(backing: B, params: RingParams) -> Result<Self> {
        params.validate()?;

        let request = AllocRequest::new(params.ring_buffer_size, RING_BUFFER_ALIGN);
        let begin = backing
            .allocate(request)
            .memory
            .ok_or(MemError::BackingExhausted {
                size: request.size,
                alignment: request.alignment,
            })?;
        assert!(
            is_aligned(begin.as_ptr(), HEADER_ALIGN),
            "backing allocator ignored the requested alignment"
        );

        log::debug!("RingAllocator: created {} byte ring", params.ring_buffer_size);

        Ok(Self {
            backing,
            capacity: params.ring_buffer_size,
            params,
            begin,
            allocate: Cell::new(0),
            free: Cell::new(0),
            full: Cell::new(false),
        })
    }

    pub fn params(&self) -> &RingParams {
        &self.params
    }

    pub fn backing(&self) -> &B {
        &self.backing
    }

    /// Size of the ring buffer
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// No allocation is outstanding in the ring
    pub fn is_empty(&self) -> bool {
        self.free.get() == self.allocate.get() && !self.full.get()
    }

    /// Bytes between the `free` and `allocate` cursors
    pub fn used(&self) -> usize {
        if self.full.get() {
            return self.capacity;
        }
        (self.allocate.get() + self.capacity - self.free.get()) % self.capacity
    }

    /// Check whether `pointer` lies inside the ring buffer
    pub fn owns(&self, pointer: *const u8) -> bool {
        let begin = self.begin.as_ptr() as usize;
        let address = pointer as usize;
        address >= begin && address < begin + self.capacity
    }

    /// Check whether the byte at `offset` belongs to the live span
    pub fn is_locked(&self, offset: usize) -> bool {
        let free = self.free.get();
        let allocate = self.allocate.get();

        if free == allocate {
            return self.full.get();
        }
        if allocate > free {
            return offset >= free && offset < allocate;
        }
        offset >= free || offset < allocate
    }

    /// The live span runs over the end of the buffer
    fn is_wrapped(&self) -> bool {
        !self.is_empty() && self.allocate.get() <= self.free.get()
    }

    /// Drop every outstanding allocation at once.
    ///
    /// Returns whether anything was discarded. The caller guarantees that
    /// no pointer into the ring is used afterwards.
    pub fn reset_and_discard(&self) -> bool {
        let discarded = !self.is_empty();
        if discarded {
            log::warn!("RingAllocator: discarded {} live bytes", self.used());
        }

        self.allocate.set(0);
        self.free.set(0);
        self.full.set(false);
        discarded
    }

    fn header_at(&self, offset: usize) -> *mut AllocationHeader {
        debug_assert!(offset + HEADER_SIZE <= self.capacity);
        self.begin.as_ptr().wrapping_add(offset).cast()
    }

    /// Offset of the data for a header placed at `header`
    fn data_offset(&self, header: usize, align: usize) -> usize {
        // May point past the end, only the resulting offset is used
        let header = self.begin.as_ptr().wrapping_add(header).cast();
        let data = header::data_pointer(header, align);
        data as usize - self.begin.as_ptr() as usize
    }

    /// Records the skipped space at the end of the ring as already released
    fn mark_tail(&self, header: usize) {
        if self.capacity - header >= HEADER_SIZE {
            let skipped = (self.capacity - header) as u32;
            unsafe {
                self.header_at(header).write(AllocationHeader {
                    requested_size: 0,
                    allocated_size: skipped | FREE_BIT,
                });
            }
        }
    }

    fn fallback(&self, request: AllocRequest) -> AllocResult {
        log::trace!(
            "RingAllocator: {} bytes served by the backing allocator",
            request.size
        );
        self.backing.allocate(request)
    }

    /// Advance `free` past every released allocation at its front
    fn reclaim(&self) {
        let mut free = self.free.get();

        while free != self.allocate.get() || self.full.get() {
            let mut header = align_up(free, HEADER_ALIGN);
            if self.capacity - header < HEADER_SIZE {
                header = 0;
            }

            // SAFETY: the header lies inside the ring, written by allocate
            let entry = unsafe { self.header_at(header).read() };
            if entry.allocated_size & FREE_BIT == 0 {
                break;
            }

            free = header + (entry.allocated_size & FREE_MASK) as usize;
            if free >= self.capacity {
                free = 0;
            }
            self.free.set(free);
            self.full.set(false);
        }
    }
}

impl<B: Allocator> Allocator for RingAllocator<B> {
    fn allocate(&self, request: AllocRequest) -> AllocResult {
        let align = request.alignment.max(HEADER_ALIGN);

        // Would not fit even into an empty ring
        let worst_case = request
            .size
            .saturating_add(HEADER_SIZE + align - HEADER_ALIGN);
        if worst_case >= self.capacity {
            return self.fallback(request);
        }

        let cursor = self.allocate.get();
        let mut header = align_up(cursor, HEADER_ALIGN);
        let mut data = self.data_offset(header, align);
        let mut data_end = data + request.size;
        let mut wrapped = false;

        if data_end >= self.capacity {
            // Past the end of the buffer lies the live span itself
            if self.is_wrapped() {
                return self.fallback(request);
            }

            header = 0;
            data = self.data_offset(header, align);
            data_end = data + request.size;
            wrapped = true;
            debug_assert!(data_end < self.capacity);
        }

        // [header, data_end) has to stay clear of the live span
        let locked = if wrapped {
            !self.is_empty() && data_end > self.free.get()
        } else {
            self.is_locked(data_end - 1)
        };
        if locked {
            return self.fallback(request);
        }

        if wrapped {
            if self.is_empty() {
                self.free.set(0);
            } else {
                self.mark_tail(align_up(cursor, HEADER_ALIGN));
            }
        }

        let header_ptr = self.header_at(header);
        // SAFETY: data and data_end lie inside the ring buffer
        let data_ptr = unsafe { self.begin.as_ptr().add(data) };
        unsafe {
            header::fill(header_ptr, data_ptr, data_end - header, request.size);
        }

        self.allocate.set(data_end);
        self.full.set(data_end == self.free.get());

        match NonNull::new(data_ptr) {
            Some(memory) => AllocResult::new(memory, request.size, align),
            None => AllocResult::null(request),
        }
    }

    unsafe fn deallocate(&self, pointer: *mut u8) {
        if pointer.is_null() {
            return;
        }
        if !self.owns(pointer) {
            self.backing.deallocate(pointer);
            return;
        }

        let header = header::header_of(pointer);
        let allocated = (*header).allocated_size;
        assert!(
            allocated & FREE_BIT == 0,
            "RingAllocator: double free of {:p}",
            pointer
        );
        (*header).allocated_size = allocated | FREE_BIT;

        self.reclaim();
    }

    unsafe fn allocated_size(&self, pointer: *mut u8) -> Option<usize> {
        if pointer.is_null() {
            return None;
        }
        if !self.owns(pointer) {
            return self.backing.allocated_size(pointer);
        }

        let header = header::header_of(pointer).read();
        (header.allocated_size & FREE_BIT == 0).then_some(header.requested_size as usize)
    }

    fn total_allocated(&self) -> Option<usize> {
        Some(self.used())
    }
}

impl<B: Allocator> Drop for RingAllocator<B> {
    fn drop(&mut self) {
        let outstanding = !self.is_empty();
        if outstanding {
            log::error!(
                "RingAllocator dropped with {} bytes outstanding",
                self.used()
            );
        }

        unsafe {
            self.backing.deallocate(self.begin.as_ptr());
        }

        if outstanding && !std::thread::panicking() {
            panic!("RingAllocator dropped with outstanding allocations");
        }
    }
}

impl<B: Allocator> core::fmt::Debug for RingAllocator<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RingAllocator")
            .field("capacity", &self.capacity)
            .field("allocate", &self.allocate.get())
            .field("free", &self.free.get())
            .field("full", &self.full.get())
            .finish()
    }
}
