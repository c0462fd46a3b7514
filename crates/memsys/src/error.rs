//! Error types for allocator construction

use thiserror::Error;

/// Allocator construction errors
///
/// Only raised while building an allocator. Once built, allocators never
/// report errors: exhausted or contended pools defer to their backing
/// allocator, and misuse (double free, leaks) is a fatal assertion.
#[derive(Debug, Error)]
pub enum MemError {
    /// Parameters rejected by validation
    #[error("Invalid allocator configuration: {0}")]
    InvalidConfig(String),

    /// The backing allocator could not provide an allocator's own memory
    #[error("Backing allocator could not provide {size} bytes aligned to {alignment}")]
    BackingExhausted { size: usize, alignment: usize },

    /// Two slab blocks share an address range
    #[error("Slab block ranges overlap at {0:#x}")]
    OverlappingBlocks(usize),
}

/// Result type for allocator construction
pub type Result<T> = std::result::Result<T, MemError>;
