//! Forward allocator - bump allocation through fixed buckets
//!
//! Every bucket is bumped forward by its own cursor and never moves back on
//! release. A bucket only becomes usable again after [`ForwardAllocator::reset`]
//! finds it without live allocations. Buckets are taken from the backing
//! allocator once, at construction; when none of them has room the request
//! goes to the backing allocator.

use core::cell::Cell;
use core::ptr::NonNull;

use crate::config::ForwardParams;
use crate::error::{MemError, Result};
use crate::header::{self, HEADER_ALIGN, HEADER_SIZE};
use crate::ring::FREE_BIT;
use crate::{AllocRequest, AllocResult, Allocator, align_up};

/// Alignment requested for each bucket
const BUCKET_ALIGN: usize = 16;

struct Bucket {
    begin: NonNull<u8>,
    size: usize,
    /// Offset of the first unused byte
    free: Cell<usize>,
    /// Allocations not yet released
    live: Cell<usize>,
    /// Requested bytes not yet released
    in_use: Cell<usize>,
}

impl Bucket {
    /// Zero-sized allocations may sit right at the `free` cursor
    fn contains(&self, pointer: *const u8) -> bool {
        let begin = self.begin.as_ptr() as usize;
        let address = pointer as usize;
        address >= begin && address <= begin + self.free.get() && address < begin + self.size
    }

    /// Offset of the data for a header placed at `header`
    fn data_offset(&self, header: usize, align: usize) -> usize {
        // May point past the end, only the resulting offset is used
        let header = self.begin.as_ptr().wrapping_add(header).cast();
        header::data_pointer(header, align) as usize - self.begin.as_ptr() as usize
    }
}

/// Bump allocator with per-bucket leak tracking
///
/// Not thread-safe, like [`crate::RingAllocator`].
pub struct ForwardAllocator<B: Allocator> {
    backing: B,
    params: ForwardParams,
    buckets: Vec<Bucket>,
}

// Safety: the buckets are owned exclusively by this allocator
unsafe impl<B: Allocator + Send> Send for ForwardAllocator<B> {}

impl<B: Allocator> ForwardAllocator<B> {
    /// Create a forward allocator, taking `min_bucket_count` buckets from `backing`
    pub fn new(backing: B, params: ForwardParams) -> Result<Self> {
        params.validate()?;

        let mut forward = Self {
            backing,
            params,
            buckets: Vec::with_capacity(params.min_bucket_count),
        };

        let request = AllocRequest::new(params.bucket_size, BUCKET_ALIGN);
        for _ in 0..params.min_bucket_count {
            let begin = forward
                .backing
                .allocate(request)
                .memory
                .ok_or(MemError::BackingExhausted {
                    size: request.size,
                    alignment: request.alignment,
                })?;
            forward.buckets.push(Bucket {
                begin,
                size: params.bucket_size,
                free: Cell::new(0),
                live: Cell::new(0),
                in_use: Cell::new(0),
            });
        }

        log::debug!(
            "ForwardAllocator: {} buckets of {} bytes",
            params.min_bucket_count,
            params.bucket_size
        );
        Ok(forward)
    }

    pub fn params(&self) -> &ForwardParams {
        &self.params
    }

    pub fn backing(&self) -> &B {
        &self.backing
    }

    /// Check whether `pointer` was handed out from one of the buckets
    pub fn owns(&self, pointer: *const u8) -> bool {
        self.bucket_of(pointer).is_some()
    }

    /// Allocations currently alive in the buckets
    pub fn live_allocations(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.live.get()).sum()
    }

    /// Rewind every bucket without live allocations.
    ///
    /// Returns the number of buckets rewound. Buckets still holding
    /// allocations keep bumping from where they are.
    pub fn reset(&self) -> usize {
        let mut rewound = 0;
        for bucket in &self.buckets {
            if bucket.live.get() == 0 && bucket.free.get() != 0 {
                bucket.free.set(0);
                rewound += 1;
            }
        }
        rewound
    }

    fn bucket_of(&self, pointer: *const u8) -> Option<&Bucket> {
        self.buckets.iter().find(|bucket| bucket.contains(pointer))
    }

    fn fallback(&self, request: AllocRequest) -> AllocResult {
        log::trace!(
            "ForwardAllocator: {} bytes served by the backing allocator",
            request.size
        );
        self.backing.allocate(request)
    }
}

impl<B: Allocator> Allocator for ForwardAllocator<B> {
    fn allocate(&self, request: AllocRequest) -> AllocResult {
        let align = request.alignment.max(HEADER_ALIGN);
        let bucket_size = self.params.bucket_size;

        let worst_case = request
            .size
            .saturating_add(HEADER_SIZE + align - HEADER_ALIGN);
        if worst_case > bucket_size {
            return self.fallback(request);
        }

        for bucket in &self.buckets {
            let header = align_up(bucket.free.get(), HEADER_ALIGN);
            let data = bucket.data_offset(header, align);
            let data_end = data + request.size;
            if data >= bucket_size || data_end > bucket_size {
                continue;
            }

            // SAFETY: header and data lie inside the bucket
            unsafe {
                let header_ptr = bucket.begin.as_ptr().add(header).cast();
                let data_ptr = bucket.begin.as_ptr().add(data);
                header::fill(header_ptr, data_ptr, data_end - header, request.size);

                bucket.free.set(data_end);
                bucket.live.set(bucket.live.get() + 1);
                bucket.in_use.set(bucket.in_use.get() + request.size);

                if let Some(memory) = NonNull::new(data_ptr) {
                    return AllocResult::new(memory, request.size, align);
                }
            }
        }

        self.fallback(request)
    }

    unsafe fn deallocate(&self, pointer: *mut u8) {
        if pointer.is_null() {
            return;
        }
        let Some(bucket) = self.bucket_of(pointer) else {
            self.backing.deallocate(pointer);
            return;
        };

        let header = header::header_of(pointer);
        let allocated = (*header).allocated_size;
        assert!(
            allocated & FREE_BIT == 0,
            "ForwardAllocator: double free of {:p}",
            pointer
        );
        (*header).allocated_size = allocated | FREE_BIT;

        bucket.live.set(bucket.live.get() - 1);
        bucket
            .in_use
            .set(bucket.in_use.get() - (*header).requested_size as usize);
    }

    unsafe fn allocated_size(&self, pointer: *mut u8) -> Option<usize> {
        if pointer.is_null() {
            return None;
        }
        if self.bucket_of(pointer).is_none() {
            return self.backing.allocated_size(pointer);
        }

        let header = header::header_of(pointer).read();
        (header.allocated_size & FREE_BIT == 0)
            .then_some(header.requested_size as usize)
    }

    fn total_allocated(&self) -> Option<usize> {
        Some(self.buckets.iter().map(|bucket| bucket.in_use.get()).sum())
    }
}

impl<B: Allocator> Drop for ForwardAllocator<B> {
    fn drop(&mut self) {
        let live = self.live_allocations();
        if live != 0 {
            log::error!("ForwardAllocator dropped with {} live allocations", live);
        }

        for bucket in &self.buckets {
            unsafe {
                self.backing.deallocate(bucket.begin.as_ptr());
            }
        }

        if live != 0 && !std::thread::panicking() {
            panic!("ForwardAllocator dropped with outstanding allocations");
        }
    }
}

impl<B: Allocator> core::fmt::Debug for ForwardAllocator<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ForwardAllocator")
            .field("params", &self.params)
            .field("live", &self.live_allocations())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DefaultAllocator, TrackedAllocator, is_aligned};

    type Backing = TrackedAllocator<DefaultAllocator>;

    fn backing() -> Backing {
        TrackedAllocator::new("backing", DefaultAllocator::new())
    }

    #[test]
    fn test_bumps_through_bucket() {
        let backing = backing();
        let forward = ForwardAllocator::new(&backing, ForwardParams::new(256, 2)).unwrap();
        assert_eq!(backing.stats().allocation_count, 2);

        let a = forward.allocate(AllocRequest::new(32, 4)).as_ptr();
        let b = forward.allocate(AllocRequest::new(32, 4)).as_ptr();
        assert!(forward.owns(a) && forward.owns(b));
        assert_eq!(b as usize - a as usize, 32 + HEADER_SIZE);
        assert_eq!(forward.total_allocated(), Some(64));

        unsafe {
            assert_eq!(forward.allocated_size(a), Some(32));
            forward.deallocate(a);
            forward.deallocate(b);
        }
        assert_eq!(forward.total_allocated(), Some(0));
        assert_eq!(forward.live_allocations(), 0);
    }

    #[test]
    fn test_exhausted_buckets_use_backing() {
        let backing = backing();
        let forward = ForwardAllocator::new(&backing, ForwardParams::new(256, 2)).unwrap();

        let first = forward.allocate(AllocRequest::new(200, 4)).as_ptr();
        let second = forward.allocate(AllocRequest::new(200, 4)).as_ptr();
        let third = forward.allocate(AllocRequest::new(200, 4)).as_ptr();
        assert!(forward.owns(first) && forward.owns(second));
        assert!(!forward.owns(third));
        assert_eq!(backing.stats().allocation_count, 3);

        unsafe {
            assert_eq!(forward.allocated_size(third), Some(200));
            forward.deallocate(third);
            forward.deallocate(second);
            forward.deallocate(first);
        }
        assert_eq!(backing.stats().allocation_count, 2);
    }

    #[test]
    fn test_zero_sized_allocations() {
        let backing = backing();
        let forward = ForwardAllocator::new(&backing, ForwardParams::new(256, 1)).unwrap();

        let empty = forward.allocate(AllocRequest::new(0, 4)).as_ptr();
        assert!(forward.owns(empty));
        unsafe {
            assert_eq!(forward.allocated_size(empty), Some(0));
            forward.deallocate(empty);
        }
        assert_eq!(forward.live_allocations(), 0);
        assert_eq!(backing.stats().allocation_count, 1);
    }

    #[test]
    fn test_oversized_request_uses_backing() {
        let backing = backing();
        let forward = ForwardAllocator::new(&backing, ForwardParams::new(256, 1)).unwrap();

        let big = forward.allocate(AllocRequest::new(300, 4)).as_ptr();
        assert!(!forward.owns(big));
        assert_eq!(forward.live_allocations(), 0);
        unsafe { forward.deallocate(big) };
    }

    #[test]
    fn test_reset_rewinds_only_empty_buckets() {
        let backing = backing();
        let forward = ForwardAllocator::new(&backing, ForwardParams::new(256, 2)).unwrap();

        let kept = forward.allocate(AllocRequest::new(200, 4)).as_ptr();
        let released = forward.allocate(AllocRequest::new(200, 4)).as_ptr();
        unsafe { forward.deallocate(released) };

        // Released memory is not reused before a reset
        let before_reset = forward.allocate(AllocRequest::new(200, 4)).as_ptr();
        assert!(!forward.owns(before_reset));
        unsafe { forward.deallocate(before_reset) };

        assert_eq!(forward.reset(), 1);
        let after_reset = forward.allocate(AllocRequest::new(200, 4)).as_ptr();
        assert_eq!(after_reset, released);

        unsafe {
            forward.deallocate(kept);
            forward.deallocate(after_reset);
        }
        assert_eq!(forward.reset(), 2);
        assert_eq!(forward.reset(), 0);
    }

    #[test]
    fn test_alignment_honored() {
        let backing = backing();
        let forward = ForwardAllocator::new(&backing, ForwardParams::new(1024, 1)).unwrap();

        let a = forward.allocate(AllocRequest::new(10, 4)).as_ptr();
        let b = forward.allocate(AllocRequest::new(64, 128)).as_ptr();
        assert!(forward.owns(b));
        assert!(is_aligned(b, 128));

        unsafe {
            assert_eq!(forward.allocated_size(b), Some(64));
            forward.deallocate(a);
            forward.deallocate(b);
        }
    }

    #[test]
    fn test_invalid_params_rejected() {
        let backing = backing();
        let result = ForwardAllocator::new(&backing, ForwardParams::new(256, 0));
        assert!(matches!(result, Err(MemError::InvalidConfig(_))));
        assert_eq!(backing.stats().allocation_total_count, 0);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_panics() {
        let backing = backing();
        let forward = ForwardAllocator::new(&backing, ForwardParams::new(256, 1)).unwrap();

        let ptr = forward.allocate(AllocRequest::new(16, 4)).as_ptr();
        unsafe {
            forward.deallocate(ptr);
            forward.deallocate(ptr);
        }
    }

    #[test]
    #[should_panic(expected = "outstanding allocations")]
    fn test_leak_detected_on_drop() {
        let backing = backing();
        let forward = ForwardAllocator::new(&backing, ForwardParams::new(256, 1)).unwrap();
        forward.allocate(AllocRequest::new(16, 4));
        drop(forward);
    }
}
