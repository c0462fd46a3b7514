//! Allocator parameters

use serde::{Deserialize, Serialize};

use crate::error::{MemError, Result};
use crate::header::{HEADER_ALIGN, HEADER_SIZE, MAX_TRACKED_SIZE};
use crate::ring::FREE_BIT;
use crate::slab::{MAX_BUCKET_SIZE, MAX_CHAIN_CAPACITY, bucket_stride};

/// Ring allocator configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RingParams {
    /// Size of the ring buffer in bytes
    pub ring_buffer_size: usize,
}

impl Default for RingParams {
    fn default() -> Self {
        Self {
            ring_buffer_size: 1024 * 1024, // 1 MB default
        }
    }
}

impl RingParams {
    /// Create parameters for a ring of the given size
    pub fn new(ring_buffer_size: usize) -> Self {
        Self { ring_buffer_size }
    }

    /// Create parameters for a ring of the given size in KB
    pub fn with_capacity_kb(kb: usize) -> Self {
        Self::new(kb * 1024)
    }

    pub fn validate(&self) -> Result<()> {
        let size = self.ring_buffer_size;
        if size % HEADER_ALIGN != 0 {
            return Err(MemError::InvalidConfig(format!(
                "ring_buffer_size {} is not a multiple of {}",
                size, HEADER_ALIGN
            )));
        }
        if size < 2 * HEADER_SIZE {
            return Err(MemError::InvalidConfig(format!(
                "ring_buffer_size {} cannot hold two allocation headers",
                size
            )));
        }
        if size >= FREE_BIT as usize {
            return Err(MemError::InvalidConfig(format!(
                "ring_buffer_size {} collides with the free bit",
                size
            )));
        }
        Ok(())
    }
}

/// Forward allocator configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardParams {
    /// Size of each bucket in bytes
    pub bucket_size: usize,
    /// Buckets taken from the backing allocator at construction
    pub min_bucket_count: usize,
}

impl Default for ForwardParams {
    fn default() -> Self {
        Self {
            bucket_size: 64 * 1024,
            min_bucket_count: 1,
        }
    }
}

impl ForwardParams {
    pub fn new(bucket_size: usize, min_bucket_count: usize) -> Self {
        Self {
            bucket_size,
            min_bucket_count,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.bucket_size % 16 != 0 || self.bucket_size < 4 * HEADER_SIZE {
            return Err(MemError::InvalidConfig(format!(
                "bucket_size {} must be a multiple of 16 and at least {}",
                self.bucket_size,
                4 * HEADER_SIZE
            )));
        }
        if self.bucket_size > MAX_TRACKED_SIZE {
            return Err(MemError::InvalidConfig(format!(
                "bucket_size {} exceeds {}",
                self.bucket_size, MAX_TRACKED_SIZE
            )));
        }
        if self.min_bucket_count == 0 {
            return Err(MemError::InvalidConfig("min_bucket_count must be at least 1".into()));
        }
        Ok(())
    }
}

/// Slab allocator configuration
///
/// `block_sizes[i]` and `bucket_sizes[i]` describe one size class. Every
/// class gets `chain_capacity` blocks, allocated up front.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlabParams {
    /// Bytes per block, one entry per size class
    pub block_sizes: Vec<usize>,
    /// Bucket size per size class (power of two, below 4 KiB)
    pub bucket_sizes: Vec<usize>,
    /// Blocks per size class (at most 256)
    pub chain_capacity: usize,
}

impl Default for SlabParams {
    fn default() -> Self {
        Self::uniform(&[16, 32, 64, 128, 256, 512, 1024, 2048], 16 * 1024, 16)
    }
}

impl SlabParams {
    /// Create parameters where every size class uses the same block size
    pub fn uniform(bucket_sizes: &[usize], block_size: usize, chain_capacity: usize) -> Self {
        Self {
            block_sizes: vec![block_size; bucket_sizes.len()],
            bucket_sizes: bucket_sizes.to_vec(),
            chain_capacity,
        }
    }

    /// Add a size class
    pub fn with_class(mut self, bucket_size: usize, block_size: usize) -> Self {
        self.bucket_sizes.push(bucket_size);
        self.block_sizes.push(block_size);
        self
    }

    /// Set the number of blocks per size class
    pub fn with_chain_capacity(mut self, chain_capacity: usize) -> Self {
        self.chain_capacity = chain_capacity;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_sizes.len() != self.bucket_sizes.len() {
            return Err(MemError::InvalidConfig(format!(
                "{} block sizes given for {} bucket sizes",
                self.block_sizes.len(),
                self.bucket_sizes.len()
            )));
        }
        if self.bucket_sizes.is_empty() {
            return Err(MemError::InvalidConfig("no size classes configured".into()));
        }
        if self.chain_capacity == 0 || self.chain_capacity > MAX_CHAIN_CAPACITY {
            return Err(MemError::InvalidConfig(format!(
                "chain_capacity {} is outside 1..={}",
                self.chain_capacity, MAX_CHAIN_CAPACITY
            )));
        }

        for (index, (&bucket_size, &block_size)) in
            self.bucket_sizes.iter().zip(&self.block_sizes).enumerate()
        {
            if !bucket_size.is_power_of_two() || bucket_size >= MAX_BUCKET_SIZE {
                return Err(MemError::InvalidConfig(format!(
                    "bucket size {} must be a power of two below {}",
                    bucket_size, MAX_BUCKET_SIZE
                )));
            }
            if block_size < bucket_stride(bucket_size) {
                return Err(MemError::InvalidConfig(format!(
                    "block size {} cannot hold a single {} byte bucket",
                    block_size, bucket_size
                )));
            }
            if self.bucket_sizes[..index].contains(&bucket_size) {
                return Err(MemError::InvalidConfig(format!(
                    "bucket size {} configured twice",
                    bucket_size
                )));
            }
        }
        Ok(())
    }
}

/// Process-wide allocator configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemsysConfig {
    /// Size of the default scratch ring in bytes
    pub scratch_size: usize,
}

impl Default for MemsysConfig {
    fn default() -> Self {
        Self {
            scratch_size: 4 * 1024 * 1024,
        }
    }
}

impl MemsysConfig {
    /// Set the scratch ring size
    pub fn with_scratch_size(mut self, scratch_size: usize) -> Self {
        self.scratch_size = scratch_size;
        self
    }

    pub fn validate(&self) -> Result<()> {
        RingParams::new(self.scratch_size).validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_params_are_valid() {
        RingParams::default().validate().unwrap();
        SlabParams::default().validate().unwrap();
        MemsysConfig::default().validate().unwrap();
        ForwardParams::default().validate().unwrap();
    }

    #[test]
    fn test_forward_params_rejected() {
        assert!(ForwardParams::new(100, 1).validate().is_err());
        assert!(ForwardParams::new(16, 1).validate().is_err());
        assert!(ForwardParams::new(256, 0).validate().is_err());
        assert!(ForwardParams::new(usize::MAX & !15, 1).validate().is_err());
        assert!(ForwardParams::new(256, 4).validate().is_ok());
    }

    #[test]
    fn test_ring_params_rejected() {
        assert!(RingParams::new(6).validate().is_err());
        assert!(RingParams::new(8).validate().is_err());
        assert!(RingParams::new(FREE_BIT as usize).validate().is_err());
        assert!(RingParams::new(256).validate().is_ok());
    }

    #[test]
    fn test_slab_params_rejected() {
        let mismatched = SlabParams {
            block_sizes: vec![1024],
            bucket_sizes: vec![32, 64],
            chain_capacity: 4,
        };
        assert!(matches!(mismatched.validate(), Err(MemError::InvalidConfig(_))));

        assert!(SlabParams::uniform(&[48], 1024, 4).validate().is_err());
        assert!(SlabParams::uniform(&[4096], 64 * 1024, 4).validate().is_err());
        assert!(SlabParams::uniform(&[64], 1024, 0).validate().is_err());
        assert!(SlabParams::uniform(&[64], 1024, 257).validate().is_err());
        assert!(SlabParams::uniform(&[64], 32, 4).validate().is_err());
        assert!(SlabParams::uniform(&[64, 64], 1024, 4).validate().is_err());
        assert!(SlabParams::uniform(&[64], 1024, 256).validate().is_ok());
    }

    #[test]
    fn test_slab_params_builder() {
        let params = SlabParams::uniform(&[], 0, 2)
            .with_class(64, 160)
            .with_class(16, 512)
            .with_chain_capacity(8);

        assert_eq!(params.bucket_sizes, vec![64, 16]);
        assert_eq!(params.block_sizes, vec![160, 512]);
        assert_eq!(params.chain_capacity, 8);
        params.validate().unwrap();
    }
}
