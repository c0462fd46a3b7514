//! Allocation tracking
//!
//! [`TrackedAllocator`] wraps any allocator under a name and keeps counts of
//! what flows through it. Leaks are reported when the tracker is dropped.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::{AllocRequest, AllocResult, Allocator};

/// Snapshot of a tracker's counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Allocations currently alive
    pub allocation_count: usize,
    /// Allocations made over the tracker's lifetime
    pub allocation_total_count: usize,
    /// Requested bytes currently alive
    pub size_in_use: usize,
}

/// Allocator wrapper that counts allocations
pub struct TrackedAllocator<A: Allocator> {
    name: String,
    inner: A,
    allocation_count: AtomicUsize,
    allocation_total_count: AtomicUsize,
    size_in_use: AtomicUsize,
}

impl<A: Allocator> TrackedAllocator<A> {
    pub fn new(name: impl Into<String>, inner: A) -> Self {
        Self {
            name: name.into(),
            inner,
            allocation_count: AtomicUsize::new(0),
            allocation_total_count: AtomicUsize::new(0),
            size_in_use: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }

    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            allocation_count: self.allocation_count.load(Ordering::Relaxed),
            allocation_total_count: self.allocation_total_count.load(Ordering::Relaxed),
            size_in_use: self.size_in_use.load(Ordering::Relaxed),
        }
    }

    /// Size the inner allocator reports for a live pointer
    unsafe fn tracked_size(&self, pointer: *mut u8) -> usize {
        self.inner.allocated_size(pointer).unwrap_or(0)
    }
}

impl<A: Allocator> Allocator for TrackedAllocator<A> {
    fn allocate(&self, request: AllocRequest) -> AllocResult {
        let result = self.inner.allocate(request);
        if !result.is_null() {
            let size = unsafe { self.tracked_size(result.as_ptr()) };
            self.allocation_count.fetch_add(1, Ordering::Relaxed);
            self.allocation_total_count.fetch_add(1, Ordering::Relaxed);
            self.size_in_use.fetch_add(size, Ordering::Relaxed);
        }
        result
    }

    unsafe fn deallocate(&self, pointer: *mut u8) {
        if pointer.is_null() {
            return;
        }

        let size = self.tracked_size(pointer);
        self.inner.deallocate(pointer);
        self.allocation_count.fetch_sub(1, Ordering::Relaxed);
        self.size_in_use.fetch_sub(size, Ordering::Relaxed);
    }

    unsafe fn allocated_size(&self, pointer: *mut u8) -> Option<usize> {
        self.inner.allocated_size(pointer)
    }

    fn total_allocated(&self) -> Option<usize> {
        self.inner.total_allocated()
    }
}

impl<A: Allocator> Drop for TrackedAllocator<A> {
    fn drop(&mut self) {
        let stats = self.stats();
        if stats.allocation_count > 0 {
            log::warn!(
                "Allocator '{}' dropped with {} live allocations ({} bytes)",
                self.name,
                stats.allocation_count,
                stats.size_in_use
            );
        }
    }
}

impl<A: Allocator> core::fmt::Debug for TrackedAllocator<A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TrackedAllocator")
            .field("name", &self.name)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DefaultAllocator;

    #[test]
    fn test_counts_follow_allocations() {
        let alloc = TrackedAllocator::new("test", DefaultAllocator::new());
        assert_eq!(alloc.name(), "test");

        let a = alloc.allocate(AllocRequest::sized(40)).as_ptr();
        let b = alloc.allocate(AllocRequest::sized(24)).as_ptr();
        assert_eq!(
            alloc.stats(),
            AllocatorStats {
                allocation_count: 2,
                allocation_total_count: 2,
                size_in_use: 64,
            }
        );

        unsafe { alloc.deallocate(a) };
        let stats = alloc.stats();
        assert_eq!(stats.allocation_count, 1);
        assert_eq!(stats.allocation_total_count, 2);
        assert_eq!(stats.size_in_use, 24);

        unsafe { alloc.deallocate(b) };
        assert_eq!(alloc.stats().allocation_count, 0);
        assert_eq!(alloc.stats().size_in_use, 0);
        assert_eq!(alloc.total_allocated(), Some(0));
    }

    #[test]
    fn test_null_pointer_ignored() {
        let alloc = TrackedAllocator::new("test", DefaultAllocator::new());
        unsafe { alloc.deallocate(core::ptr::null_mut()) };
        assert_eq!(alloc.stats(), AllocatorStats::default());
    }
}
