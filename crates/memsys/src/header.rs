//! Allocation headers recoverable from the data pointer
//!
//! Tracked allocations store an [`AllocationHeader`] in front of the user
//! data. When the data is aligned past the end of the header, every 4-byte
//! word in between is stamped with [`HEADER_PAD_VALUE`]. Walking backwards
//! from the data pointer over pad words therefore always lands right after
//! the header, whatever alignment was requested.
//!
//! ```text
//! | requested_size | allocated_size | pad | pad | ... | data ...
//! ^ header                                             ^ data_pointer(header, align)
//! ```
//!
//! The word directly in front of the first pad word is `allocated_size`,
//! which is kept below [`MAX_TRACKED_SIZE`] and so never equals the pad value.

use core::mem::{align_of, size_of};

use crate::align_up;

/// Size bookkeeping stored in front of each tracked allocation
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationHeader {
    /// Size the caller asked for
    pub requested_size: u32,
    /// Bytes consumed by the allocation, counted from the header start
    pub allocated_size: u32,
}

/// Value written into alignment padding between header and data
pub const HEADER_PAD_VALUE: u32 = 0xffff_ffff;

/// Size of an [`AllocationHeader`]
pub const HEADER_SIZE: usize = size_of::<AllocationHeader>();

/// Alignment of an [`AllocationHeader`], and the smallest data alignment
pub const HEADER_ALIGN: usize = align_of::<AllocationHeader>();

/// Largest size a header field may hold
pub const MAX_TRACKED_SIZE: usize = (u32::MAX >> 1) as usize;

/// Returns the data pointer for an allocation whose header lives at `header`.
///
/// The data starts right after the header, rounded up to `align` (never less
/// than [`HEADER_ALIGN`]). Nothing is written; see [`fill`].
#[inline]
pub fn data_pointer(header: *mut AllocationHeader, align: usize) -> *mut u8 {
    debug_assert!(align.is_power_of_two());
    let after_header = header.wrapping_add(1).cast::<u8>();
    let address = after_header as usize;
    let padding = align_up(address, align.max(HEADER_ALIGN)) - address;
    after_header.wrapping_add(padding)
}

/// Recovers the header of an allocation from its data pointer.
///
/// # Safety
/// `data` must have been produced by [`data_pointer`] for a header that was
/// initialized with [`fill`], and that memory must still be readable.
#[inline]
pub unsafe fn header_of(data: *mut u8) -> *mut AllocationHeader {
    let mut word = data.cast::<u32>();
    while word.sub(1).read() == HEADER_PAD_VALUE {
        word = word.sub(1);
    }
    word.cast::<u8>().sub(HEADER_SIZE).cast()
}

/// Writes both size fields and stamps the padding up to `data`.
///
/// Reused memory may contain stale pad words or stale sizes, so the padding
/// is rewritten on every fill.
///
/// # Safety
/// `header` must be valid for writes up to `data`, and `data` must come from
/// [`data_pointer`] on the same header.
#[inline]
pub unsafe fn fill(
    header: *mut AllocationHeader,
    data: *const u8,
    allocated_size: usize,
    requested_size: usize,
) {
    debug_assert!(allocated_size <= MAX_TRACKED_SIZE);
    debug_assert!(requested_size <= MAX_TRACKED_SIZE);

    header.write(AllocationHeader {
        requested_size: requested_size as u32,
        allocated_size: allocated_size as u32,
    });

    let mut word = header.add(1).cast::<u32>();
    while (word as usize) < data as usize {
        word.write(HEADER_PAD_VALUE);
        word = word.add(1);
    }
}
