//! Process-wide allocators
//!
//! [`Memsys`] owns the two allocators every subsystem can fall back on: the
//! tracked heap allocator and the scratch ring built on top of it. The entry
//! point creates it once with [`Memsys::init`] and passes references down.

use std::sync::Arc;

use crate::config::{MemsysConfig, RingParams};
use crate::error::Result;
use crate::{DefaultAllocator, RingAllocator};

/// Scratch ring backed by the shared default allocator
pub type ScratchAllocator = RingAllocator<Arc<DefaultAllocator>>;

/// The default and scratch allocators, torn down in reverse order
pub struct Memsys {
    // Dropped before `default`, which backs it
    scratch: ScratchAllocator,
    default: Arc<DefaultAllocator>,
}

impl Memsys {
    /// Build the default allocator, then the scratch ring on top of it
    pub fn init(config: MemsysConfig) -> Result<Self> {
        config.validate()?;

        let default = Arc::new(DefaultAllocator::new());
        let scratch = RingAllocator::new(Arc::clone(&default), RingParams::new(config.scratch_size))?;

        log::info!(
            "Memory system initialized with a {} KB scratch ring",
            config.scratch_size / 1024
        );
        Ok(Self { scratch, default })
    }

    /// Tracked heap allocator
    pub fn default_allocator(&self) -> &Arc<DefaultAllocator> {
        &self.default
    }

    /// Scratch ring for short-lived allocations
    pub fn default_scratch_allocator(&self) -> &ScratchAllocator {
        &self.scratch
    }

    /// Tear down both allocators.
    ///
    /// Panics if either still has outstanding allocations.
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for Memsys {
    fn drop(&mut self) {
        log::debug!(
            "Memory system shutting down, {} bytes still in the scratch ring",
            self.scratch.used()
        );
    }
}

impl core::fmt::Debug for Memsys {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Memsys")
            .field("scratch", &self.scratch)
            .field("default", &self.default)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AllocRequest, Allocator, MemError};

    #[test]
    fn test_init_and_shutdown() {
        let memsys = Memsys::init(MemsysConfig::default().with_scratch_size(64 * 1024)).unwrap();
        assert_eq!(memsys.default_scratch_allocator().capacity(), 64 * 1024);

        // The ring buffer itself lives in the default allocator
        let ring_bytes = memsys.default_allocator().total_allocated().unwrap();
        assert!(ring_bytes >= 64 * 1024);

        let scratch = memsys.default_scratch_allocator();
        let ptr = scratch.allocate(AllocRequest::new(128, 16)).as_ptr();
        assert!(scratch.owns(ptr));
        unsafe { scratch.deallocate(ptr) };

        let heap = memsys.default_allocator();
        let ptr = heap.allocate(AllocRequest::sized(256)).as_ptr();
        assert_eq!(heap.total_allocated(), Some(ring_bytes + 8 + 4 + 256));
        unsafe { heap.deallocate(ptr) };

        memsys.shutdown();
    }

    #[test]
    fn test_scratch_overflow_goes_to_default() {
        let memsys = Memsys::init(MemsysConfig::default().with_scratch_size(1024)).unwrap();
        let before = memsys.default_allocator().total_allocated().unwrap();

        let scratch = memsys.default_scratch_allocator();
        let big = scratch.allocate(AllocRequest::sized(4096)).as_ptr();
        assert!(!scratch.owns(big));
        assert!(memsys.default_allocator().total_allocated().unwrap() > before);

        unsafe { scratch.deallocate(big) };
        assert_eq!(memsys.default_allocator().total_allocated(), Some(before));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = Memsys::init(MemsysConfig::default().with_scratch_size(10));
        assert!(matches!(result, Err(MemError::InvalidConfig(_))));
    }

    #[test]
    #[should_panic(expected = "outstanding allocations")]
    fn test_shutdown_with_live_scratch_panics() {
        let memsys = Memsys::init(MemsysConfig::default().with_scratch_size(1024)).unwrap();
        memsys.default_scratch_allocator().allocate(AllocRequest::sized(16));
        memsys.shutdown();
    }
}
