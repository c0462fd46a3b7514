//! Slab allocator - size-classed buckets claimed by ticket
//!
//! Each size class is a chain of equally sized blocks, carved into buckets.
//! Every bucket starts with a 16-byte entry header followed by the user data.
//!
//! ```text
//! block: | entry | bucket data | entry | bucket data | ... | unused tail |
//! ```
//!
//! A claim never searches. The chain hands out a ticket from an atomic
//! counter and the ticket names exactly one bucket:
//! `block = ticket % block_count`, `bucket = (ticket / block_count) % buckets_per_block`.
//! If that bucket is still taken, the request goes to the backing allocator.

use core::mem::size_of;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::config::SlabParams;
use crate::error::{MemError, Result};
use crate::{AllocRequest, AllocResult, Allocator, align_up, is_aligned};

/// Requests above this size always go to the backing allocator
pub const MAX_BUCKET_SIZE: usize = 4096;

/// Upper bound on blocks per chain, block indices are stored in a byte
pub const MAX_CHAIN_CAPACITY: usize = 256;

/// Largest alignment a bucket can honor
pub const MAX_ALIGN: usize = 16;

const ENTRY_SIZE: usize = size_of::<Entry>();

/// Bucket header
#[repr(C, align(16))]
struct Entry {
    /// 1 while the bucket is available
    free: AtomicU8,
    /// Index of the block holding this bucket
    block_index: u8,
    _reserved: [u8; 2],
    requested_size: AtomicU32,
}

/// Distance between two buckets of the given size
pub(crate) const fn bucket_stride(bucket_size: usize) -> usize {
    ENTRY_SIZE + align_up(bucket_size, MAX_ALIGN)
}

/// Per-chain counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainStats {
    pub bucket_size: usize,
    pub block_count: usize,
    pub buckets_per_block: usize,
    /// Tickets handed out
    pub claimed: usize,
    /// Tickets settled, by a release or by a collision
    pub released: usize,
    /// Tickets that hit a taken bucket and fell back
    pub contended: usize,
}

impl ChainStats {
    /// Buckets currently handed out
    pub fn live(&self) -> usize {
        self.claimed.wrapping_sub(self.released)
    }
}

/// One size class
struct Chain {
    bucket_size: usize,
    block_size: usize,
    stride: usize,
    buckets_per_block: usize,
    blocks: Vec<NonNull<u8>>,
    allocated: CachePadded<AtomicUsize>,
    released: CachePadded<AtomicUsize>,
    contended: AtomicUsize,
}

impl Chain {
    fn new(bucket_size: usize, block_size: usize, capacity: usize) -> Self {
        let stride = bucket_stride(bucket_size);
        Self {
            bucket_size,
            block_size,
            stride,
            buckets_per_block: block_size / stride,
            blocks: Vec::with_capacity(capacity),
            allocated: CachePadded::new(AtomicUsize::new(0)),
            released: CachePadded::new(AtomicUsize::new(0)),
            contended: AtomicUsize::new(0),
        }
    }

    /// Allocate every block up front and mark all buckets free
    fn prepare<B: Allocator>(&mut self, backing: &B, capacity: usize) -> Result<()> {
        let request = AllocRequest::new(self.block_size, MAX_ALIGN);

        for index in 0..capacity {
            let block = backing
                .allocate(request)
                .memory
                .ok_or(MemError::BackingExhausted {
                    size: request.size,
                    alignment: request.alignment,
                })?;
            self.blocks.push(block);
            assert!(
                is_aligned(block.as_ptr(), MAX_ALIGN),
                "backing allocator ignored the requested alignment"
            );

            for bucket in 0..self.buckets_per_block {
                // SAFETY: every bucket lies inside the block just allocated
                unsafe {
                    self.entry(block, bucket).cast_mut().write(Entry {
                        free: AtomicU8::new(1),
                        block_index: index as u8,
                        _reserved: [0; 2],
                        requested_size: AtomicU32::new(0),
                    });
                }
            }
        }

        log::debug!(
            "SlabAllocator: chain of {} byte buckets, {} blocks x {} buckets",
            self.bucket_size,
            capacity,
            self.buckets_per_block
        );
        Ok(())
    }

    fn entry(&self, block: NonNull<u8>, bucket: usize) -> *const Entry {
        block.as_ptr().wrapping_add(bucket * self.stride).cast()
    }

    /// Bytes of a block covered by buckets
    fn used_block_size(&self) -> usize {
        self.buckets_per_block * self.stride
    }

    /// Try the one bucket the next ticket points at
    fn claim(&self, size: usize) -> Option<NonNull<u8>> {
        let ticket = self.allocated.fetch_add(1, Ordering::Relaxed);
        let block = ticket % self.blocks.len();
        let bucket = (ticket / self.blocks.len()) % self.buckets_per_block;

        let entry = self.entry(self.blocks[block], bucket);
        // SAFETY: entries are initialized in `prepare` and live as long as the chain
        let header = unsafe { &*entry };

        if header
            .free
            .compare_exchange(1, 0, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            self.released.fetch_add(1, Ordering::Relaxed);
            self.contended.fetch_add(1, Ordering::Relaxed);
            log::trace!(
                "SlabAllocator: ticket {} hit a taken {} byte bucket",
                ticket,
                self.bucket_size
            );
            return None;
        }

        header.requested_size.store(size as u32, Ordering::Relaxed);
        NonNull::new(entry.cast::<u8>().cast_mut().wrapping_add(ENTRY_SIZE))
    }

    /// Entry of the bucket whose data starts at `pointer`, if the chain owns it
    fn find(&self, pointer: *mut u8) -> Option<&Entry> {
        let address = pointer as usize;

        self.blocks.iter().enumerate().find_map(|(index, block)| {
            let start = block.as_ptr() as usize;
            if address < start + ENTRY_SIZE || address >= start + self.used_block_size() {
                return None;
            }

            let offset = address - start - ENTRY_SIZE;
            assert!(
                offset % self.stride == 0,
                "SlabAllocator: {:p} does not start a bucket",
                pointer
            );

            // SAFETY: the offset was checked to land on an entry of this block
            let entry = unsafe { &*self.entry(*block, offset / self.stride) };
            assert_eq!(
                entry.block_index as usize, index,
                "SlabAllocator: corrupted entry in front of {:p}",
                pointer
            );
            Some(entry)
        })
    }

    fn release(&self, entry: &Entry, pointer: *mut u8) {
        assert!(
            entry.free.load(Ordering::Relaxed) == 0,
            "SlabAllocator: double free of {:p}",
            pointer
        );
        entry.requested_size.store(0, Ordering::Relaxed);
        entry.free.store(1, Ordering::Release);
        self.released.fetch_add(1, Ordering::Relaxed);
    }

    fn stats(&self) -> ChainStats {
        ChainStats {
            bucket_size: self.bucket_size,
            block_count: self.blocks.len(),
            buckets_per_block: self.buckets_per_block,
            claimed: self.allocated.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            contended: self.contended.load(Ordering::Relaxed),
        }
    }
}

/// Slab allocator for small fixed-size allocations
///
/// Thread-safe. Claims cost one atomic increment and one compare-exchange,
/// at the price of sometimes missing free buckets elsewhere in the chain.
pub struct SlabAllocator<B: Allocator> {
    backing: B,
    params: SlabParams,
    /// Size classes by ascending bucket size
    chains: Vec<Chain>,
}

// Safety: blocks are owned by the allocator and buckets are claimed atomically
unsafe impl<B: Allocator + Send> Send for SlabAllocator<B> {}
unsafe impl<B: Allocator + Sync> Sync for SlabAllocator<B> {}

impl<B: Allocator> SlabAllocator<B> {
    /// Create a slab allocator, taking every block from `backing` up front
    pub fn new(backing: B, params: SlabParams) -> Result<Self> {
        params.validate()?;

        let mut classes: Vec<(usize, usize)> = params
            .bucket_sizes
            .iter()
            .copied()
            .zip(params.block_sizes.iter().copied())
            .collect();
        classes.sort_unstable_by_key(|&(bucket_size, _)| bucket_size);

        let capacity = params.chain_capacity;
        let mut slab = Self {
            backing,
            params,
            chains: Vec::with_capacity(classes.len()),
        };

        // Chains are pushed before their blocks so Drop returns partial work
        for (bucket_size, block_size) in classes {
            slab.chains.push(Chain::new(bucket_size, block_size, capacity));
            let last = slab.chains.len() - 1;
            slab.chains[last].prepare(&slab.backing, capacity)?;
        }

        slab.check_block_ranges()?;
        Ok(slab)
    }

    pub fn params(&self) -> &SlabParams {
        &self.params
    }

    pub fn backing(&self) -> &B {
        &self.backing
    }

    /// Counters of every chain, by ascending bucket size
    pub fn stats(&self) -> Vec<ChainStats> {
        self.chains.iter().map(Chain::stats).collect()
    }

    /// Check whether `pointer` is a bucket of this allocator
    pub fn owns(&self, pointer: *mut u8) -> bool {
        self.chains.iter().any(|chain| chain.find(pointer).is_some())
    }

    /// Deallocation identifies the owning chain by address range
    fn check_block_ranges(&self) -> Result<()> {
        let mut ranges: Vec<(usize, usize)> = self
            .chains
            .iter()
            .flat_map(|chain| {
                chain.blocks.iter().map(move |block| {
                    let start = block.as_ptr() as usize;
                    (start, start + chain.block_size)
                })
            })
            .collect();
        ranges.sort_unstable();

        match ranges.windows(2).find(|pair| pair[0].1 > pair[1].0) {
            Some(pair) => Err(MemError::OverlappingBlocks(pair[1].0)),
            None => Ok(()),
        }
    }

    fn fallback(&self, request: AllocRequest) -> AllocResult {
        log::trace!(
            "SlabAllocator: {} bytes aligned to {} served by the backing allocator",
            request.size,
            request.alignment
        );
        self.backing.allocate(request)
    }
}

impl<B: Allocator> Allocator for SlabAllocator<B> {
    fn allocate(&self, request: AllocRequest) -> AllocResult {
        if request.alignment > MAX_ALIGN || request.size > MAX_BUCKET_SIZE {
            return self.fallback(request);
        }

        let Some(chain) = self
            .chains
            .iter()
            .find(|chain| chain.bucket_size >= request.size)
        else {
            return self.fallback(request);
        };

        match chain.claim(request.size) {
            Some(memory) => AllocResult::new(memory, request.size, request.alignment),
            None => self.fallback(request),
        }
    }

    unsafe fn deallocate(&self, pointer: *mut u8) {
        if pointer.is_null() {
            return;
        }

        for chain in &self.chains {
            if let Some(entry) = chain.find(pointer) {
                chain.release(entry, pointer);
                return;
            }
        }
        self.backing.deallocate(pointer);
    }

    unsafe fn allocated_size(&self, pointer: *mut u8) -> Option<usize> {
        if pointer.is_null() {
            return None;
        }

        for chain in &self.chains {
            if let Some(entry) = chain.find(pointer) {
                if entry.free.load(Ordering::Acquire) != 0 {
                    return None;
                }
                return Some(entry.requested_size.load(Ordering::Relaxed) as usize);
            }
        }
        self.backing.allocated_size(pointer)
    }

    fn total_allocated(&self) -> Option<usize> {
        None
    }
}

impl<B: Allocator> Drop for SlabAllocator<B> {
    fn drop(&mut self) {
        let mut outstanding = 0;

        for chain in &self.chains {
            let live = chain.stats().live();
            if live != 0 {
                log::error!(
                    "SlabAllocator: chain of {} byte buckets dropped with {} live buckets",
                    chain.bucket_size,
                    live
                );
                outstanding += live;
            }

            for block in &chain.blocks {
                unsafe {
                    self.backing.deallocate(block.as_ptr());
                }
            }
        }

        if outstanding != 0 && !std::thread::panicking() {
            panic!("SlabAllocator dropped with {} outstanding allocations", outstanding);
        }
    }
}

impl<B: Allocator> core::fmt::Debug for SlabAllocator<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SlabAllocator")
            .field("chains", &self.stats())
            .finish()
    }
}
