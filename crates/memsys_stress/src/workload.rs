//! Frame-loop allocator traffic

use memsys::prelude::*;
use memsys::{MemError, ScratchAllocator};
use thiserror::Error;

use crate::config::{StressConfig, WorkloadConfig};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("Memory system setup failed: {0}")]
    Setup(#[from] MemError),

    #[error("Slab worker panicked in frame {0}")]
    WorkerPanicked(usize),
}

/// Totals gathered over a run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    pub frames: usize,
    pub scratch_allocations: usize,
    /// Scratch requests the ring handed to the default allocator
    pub scratch_overflows: usize,
    pub slab_allocations: usize,
    /// Slab requests that hit a taken bucket
    pub slab_contended: usize,
    /// Slab requests the slab could not serve at all
    pub slab_backing_allocations: usize,
}

/// Run the configured workload against a fresh memory system
pub fn run(config: &StressConfig) -> Result<RunReport, RunError> {
    let memsys = Memsys::init(config.memsys)?;
    let report = {
        let slab = TrackedAllocator::new(
            "slab",
            SlabAllocator::new(memsys.default_allocator().as_ref(), config.slab.clone())?,
        );
        let mut report = RunReport {
            frames: config.workload.frames,
            ..RunReport::default()
        };

        for frame in 0..config.workload.frames {
            scratch_frame(memsys.default_scratch_allocator(), &config.workload, frame, &mut report);
            let pooled = |ptr: *mut u8| slab.inner().owns(ptr);
            slab_frame(&slab, pooled, &config.workload, frame, &mut report)?;

            if frame % 60 == 0 {
                log::debug!(
                    "Frame {}: {} bytes in the default allocator",
                    frame,
                    memsys.default_allocator().total_allocated().unwrap_or(0)
                );
            }
        }

        let stats = slab.stats();
        log::info!(
            "Slab: {} allocations, {} still live",
            stats.allocation_total_count,
            stats.allocation_count
        );
        for chain in slab.inner().stats() {
            report.slab_contended += chain.contended;
            log::info!(
                "Chain {:>4} B: {} claimed, {} contended",
                chain.bucket_size,
                chain.claimed,
                chain.contended
            );
        }
        report
    };

    memsys.shutdown();
    Ok(report)
}

/// One frame of scratch traffic, released in allocation order
fn scratch_frame(
    scratch: &ScratchAllocator,
    workload: &WorkloadConfig,
    frame: usize,
    report: &mut RunReport,
) {
    let mut pointers = Vec::with_capacity(workload.scratch_allocations_per_frame);

    for i in 0..workload.scratch_allocations_per_frame {
        let size = 16 + (frame * 31 + i * 17) % 1024;
        let alignment = 4 << (i % 3);
        let ptr = scratch.allocate(AllocRequest::new(size, alignment)).as_ptr();
        if ptr.is_null() {
            continue;
        }
        if !scratch.owns(ptr) {
            report.scratch_overflows += 1;
        }
        unsafe { ptr.write_bytes(frame as u8, size) };
        pointers.push(ptr);
    }

    report.scratch_allocations += pointers.len();
    for ptr in pointers {
        unsafe { scratch.deallocate(ptr) };
    }
}

/// Buckets held by one worker, returned even when the worker unwinds
struct LiveSet<'a, A: Allocator> {
    allocator: &'a A,
    pointers: Vec<usize>,
}

impl<A: Allocator> LiveSet<'_, A> {
    fn release(&mut self, index: usize) {
        let ptr = self.pointers.swap_remove(index);
        unsafe { self.allocator.deallocate(ptr as *mut u8) };
    }
}

impl<A: Allocator> Drop for LiveSet<'_, A> {
    fn drop(&mut self) {
        for ptr in self.pointers.drain(..) {
            unsafe { self.allocator.deallocate(ptr as *mut u8) };
        }
    }
}

/// One frame of slab traffic spread over worker threads
///
/// `pooled` tells slab buckets apart from backing allocations.
fn slab_frame<A, P>(
    slab: &A,
    pooled: P,
    workload: &WorkloadConfig,
    frame: usize,
    report: &mut RunReport,
) -> Result<(), RunError>
where
    A: Allocator + Sync,
    P: Fn(*mut u8) -> bool + Sync,
{
    let pooled = &pooled;
    let results = crossbeam_utils::thread::scope(|scope| {
        let handles: Vec<_> = (0..workload.slab_threads)
            .map(|thread| {
                scope.spawn(move |_| {
                    let mut allocated = 0;
                    let mut from_backing = 0;
                    let mut live = LiveSet {
                        allocator: slab,
                        pointers: Vec::with_capacity(workload.slab_allocations_per_thread),
                    };

                    for i in 0..workload.slab_allocations_per_thread {
                        let size = 8 + (frame + thread * 13 + i * 7) % 2040;
                        let ptr = slab.allocate(AllocRequest::sized(size)).as_ptr();
                        if ptr.is_null() {
                            continue;
                        }
                        if !pooled(ptr) {
                            from_backing += 1;
                        }
                        unsafe { ptr.write_bytes(thread as u8, size) };
                        allocated += 1;
                        live.pointers.push(ptr as usize);

                        // Keep a few buckets alive to provoke collisions
                        if live.pointers.len() > 8 {
                            live.release(i % live.pointers.len());
                        }
                    }
                    (allocated, from_backing)
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|handle| handle.join())
            .collect::<Vec<_>>()
    })
    .map_err(|_| RunError::WorkerPanicked(frame))?;

    for result in results {
        let (allocated, from_backing) = result.map_err(|_| RunError::WorkerPanicked(frame))?;
        report.slab_allocations += allocated;
        report.slab_backing_allocations += from_backing;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_small_run_completes() {
        let config = StressConfig {
            memsys: MemsysConfig::default().with_scratch_size(64 * 1024),
            slab: SlabParams::uniform(&[16, 64, 256, 1024, 2048], 8 * 1024, 4),
            workload: WorkloadConfig {
                frames: 4,
                scratch_allocations_per_frame: 32,
                slab_threads: 2,
                slab_allocations_per_thread: 64,
            },
        };

        let report = run(&config).unwrap();
        assert_eq!(report.frames, 4);
        assert_eq!(report.scratch_allocations, 4 * 32);
        assert_eq!(report.slab_allocations, 4 * 2 * 64);
    }

    #[test]
    fn test_invalid_slab_config_fails() {
        let config = StressConfig {
            slab: SlabParams::uniform(&[24], 1024, 2),
            ..StressConfig::default()
        };
        assert!(matches!(
            run(&config),
            Err(RunError::Setup(MemError::InvalidConfig(_)))
        ));
    }

    /// Panics once a fixed number of allocations has been served
    struct Failing {
        inner: DefaultAllocator,
        remaining: AtomicUsize,
    }

    impl Allocator for Failing {
        fn allocate(&self, request: AllocRequest) -> AllocResult {
            self.remaining
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
                .expect("allocation budget exhausted");
            self.inner.allocate(request)
        }

        unsafe fn deallocate(&self, pointer: *mut u8) {
            self.inner.deallocate(pointer)
        }

        unsafe fn allocated_size(&self, pointer: *mut u8) -> Option<usize> {
            self.inner.allocated_size(pointer)
        }

        fn total_allocated(&self) -> Option<usize> {
            self.inner.total_allocated()
        }
    }

    #[test]
    fn test_worker_panic_is_reported() {
        let failing = Failing {
            inner: DefaultAllocator::new(),
            remaining: AtomicUsize::new(100),
        };
        let workload = WorkloadConfig {
            frames: 1,
            scratch_allocations_per_frame: 0,
            slab_threads: 2,
            slab_allocations_per_thread: 64,
        };
        let mut report = RunReport::default();

        let result = slab_frame(&failing, |_| true, &workload, 3, &mut report);
        assert!(matches!(result, Err(RunError::WorkerPanicked(3))));

        // The panicking worker still returned what it held
        assert_eq!(failing.total_allocated(), Some(0));
    }
}
