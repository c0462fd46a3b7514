//! Stress run configuration
//!
//! Loaded from the first source that exists:
//! 1. Path given as the first command line argument
//! 2. Path in `MEMSYS_STRESS_CONFIG`
//! 3. `memsys-stress.toml` in the working directory
//! 4. Built-in defaults

use std::path::{Path, PathBuf};

use memsys::{MemsysConfig, SlabParams};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable naming a config file
pub const CONFIG_ENV: &str = "MEMSYS_STRESS_CONFIG";

/// Config file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "memsys-stress.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {}: {}", .path.display(), .source)]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {}: {}", .path.display(), .source)]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Traffic generated by a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Frames to simulate
    pub frames: usize,
    /// Scratch allocations made (and released) every frame
    pub scratch_allocations_per_frame: usize,
    /// Threads hammering the slab allocator
    pub slab_threads: usize,
    /// Slab allocations per thread and frame
    pub slab_allocations_per_thread: usize,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            frames: 120,
            scratch_allocations_per_frame: 256,
            slab_threads: 4,
            slab_allocations_per_thread: 512,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StressConfig {
    pub memsys: MemsysConfig,
    pub slab: SlabParams,
    pub workload: WorkloadConfig,
}

impl StressConfig {
    /// Load from the highest priority source available
    pub fn load(arg: Option<String>) -> Result<Self, ConfigError> {
        if let Some(path) = arg {
            return Self::load_from_file(Path::new(&path));
        }

        if let Ok(path) = std::env::var(CONFIG_ENV) {
            if !path.is_empty() {
                log::info!("Config from env: {}", path);
                return Self::load_from_file(Path::new(&path));
            }
        }

        let local = Path::new(DEFAULT_CONFIG_FILE);
        if local.exists() {
            return Self::load_from_file(local);
        }

        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        let config = Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })?;

        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn print_summary(&self) {
        log::info!("Stress configuration:");
        log::info!("  Scratch ring: {} KB", self.memsys.scratch_size / 1024);
        log::info!(
            "  Slab: buckets {:?}, {} blocks per chain",
            self.slab.bucket_sizes,
            self.slab.chain_capacity
        );
        log::info!(
            "  Workload: {} frames, {} scratch allocations, {} threads x {} slab allocations",
            self.workload.frames,
            self.workload.scratch_allocations_per_frame,
            self.workload.slab_threads,
            self.workload.slab_allocations_per_thread
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = StressConfig::parse("").unwrap();
        assert_eq!(config, StressConfig::default());
    }

    #[test]
    fn test_partial_document() {
        let config = StressConfig::parse(
            r#"
            [memsys]
            scratch_size = 65536

            [slab]
            bucket_sizes = [32, 128]
            block_sizes = [4096, 8192]
            chain_capacity = 4

            [workload]
            frames = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.memsys.scratch_size, 65536);
        assert_eq!(config.slab.bucket_sizes, vec![32, 128]);
        assert_eq!(config.slab.chain_capacity, 4);
        assert_eq!(config.workload.frames, 3);
        assert_eq!(
            config.workload.slab_threads,
            WorkloadConfig::default().slab_threads
        );
        config.slab.validate().unwrap();
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = StressConfig::load_from_file(Path::new("/nonexistent/memsys-stress.toml"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
        assert!(err.to_string().contains("/nonexistent/memsys-stress.toml"));
    }

    #[test]
    fn test_malformed_document_rejected() {
        assert!(StressConfig::parse("[workload]\nframes = \"many\"").is_err());
    }
}
