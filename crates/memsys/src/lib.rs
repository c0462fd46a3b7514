//! # memsys - Engine Memory Allocators
//!
//! Allocators for performance- and lifetime-sensitive engine allocations:
//! - DefaultAllocator: Platform heap with per-allocation size tracking
//! - RingAllocator: Scratch memory in a circular buffer, reclaimed in allocation order
//! - SlabAllocator: Size-classed buckets claimed with an atomic ticket
//! - ForwardAllocator: Bump allocation through fixed buckets, rewound on reset
//!
//! Every allocator is built on top of a backing allocator. Its own memory
//! comes from the backing allocator, and so does every request it cannot
//! serve itself, so `allocate` only comes back empty when the platform heap
//! is exhausted.

pub mod allocator;
pub mod config;
pub mod default;
pub mod error;
pub mod forward;
pub mod globals;
pub mod header;
pub mod ring;
pub mod slab;
pub mod tracker;
pub mod unique;

pub use allocator::{AllocRequest, AllocResult, Allocator};
pub use config::{ForwardParams, MemsysConfig, RingParams, SlabParams};
pub use default::DefaultAllocator;
pub use error::{MemError, Result};
pub use forward::ForwardAllocator;
pub use globals::{Memsys, ScratchAllocator};
pub use ring::RingAllocator;
pub use slab::{ChainStats, SlabAllocator};
pub use tracker::{AllocatorStats, TrackedAllocator};
pub use unique::AllocBox;

/// Align a value up to the given alignment
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Align a value down to the given alignment
#[inline]
pub const fn align_down(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Check if a pointer is aligned
#[inline]
pub fn is_aligned(ptr: *const u8, align: usize) -> bool {
    (ptr as usize) & (align - 1) == 0
}

pub mod prelude {
    pub use crate::{AllocBox, AllocRequest, AllocResult, Allocator};
    pub use crate::{DefaultAllocator, ForwardAllocator, Memsys, RingAllocator, SlabAllocator, TrackedAllocator};
    pub use crate::{ForwardParams, MemsysConfig, RingParams, SlabParams};
    pub use crate::{align_down, align_up, is_aligned};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_helpers() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_down(31, 16), 16);
        assert!(is_aligned(64 as *const u8, 32));
        assert!(!is_aligned(68 as *const u8, 8));
    }
}
