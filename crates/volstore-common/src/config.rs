//! Engine configuration.

use crate::error::{Error, Result};
use crate::types::MIN_IO_SIZE;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// How the engine opens its devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenMode {
    /// Bypass the page cache (O_DIRECT); offsets and sizes must be aligned
    DirectIo,
    /// Go through the page cache; used for file-backed devices and tests
    BufferedIo,
    /// Read-only; disables every DM-info rewrite
    ReadOnly,
}

/// Slab schema for the variable-size block allocator.
///
/// `block_counts` are power-of-two unit sizes in blocks; `weights` bias
/// which class an allocation starts its search from. Both vectors must
/// have the same length.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlabConfig {
    pub block_counts: Vec<u32>,
    pub weights: Vec<f32>,
}

impl Default for SlabConfig {
    fn default() -> Self {
        let block_counts = vec![1, 2, 4, 8, 16, 32];
        let w = 1.0 / block_counts.len() as f32;
        Self {
            weights: vec![w; block_counts.len()],
            block_counts,
        }
    }
}

impl SlabConfig {
    /// Largest unit size in this schema, in blocks
    #[must_use]
    pub fn max_blocks(&self) -> u32 {
        self.block_counts.iter().copied().max().unwrap_or(1)
    }

    fn validate(&self) -> Result<()> {
        if self.block_counts.is_empty() || self.block_counts.len() != self.weights.len() {
            return Err(Error::Config(
                "slab block counts and weights must be non-empty and equal length".into(),
            ));
        }
        for &n in &self.block_counts {
            if !n.is_power_of_two() {
                return Err(Error::Config(format!("slab size {n} is not a power of two")));
            }
        }
        Ok(())
    }
}

/// Engine configuration.
///
/// Geometry fields fix the on-disk layout and must not change across boots
/// of the same device set; the remaining fields are operational tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Raw devices (or device-sized files) backing the engine
    pub devices: Vec<PathBuf>,
    /// UUID stamped into every superblock of this system
    pub system_uuid: Uuid,
    /// Device open mode
    pub open_mode: OpenMode,

    /// Smallest user-visible block; must equal the data vdev page size
    pub min_virtual_page_size: u32,
    /// Physical page size of the devices
    pub phys_page_size: u32,
    /// Atomic write unit of the devices; bounds the superblock slot size
    pub atomic_page_size: u32,
    /// Buffer alignment for direct I/O
    pub align_size: u32,

    /// Total memory budget including caches, in bytes
    pub app_mem_size: u64,
    /// Percent of `app_mem_size` above which cp-end releases cache memory
    pub soft_mem_release_threshold: u8,
    /// Percent above which cp-end releases memory aggressively
    pub aggressive_mem_release_threshold: u8,

    /// Grace period for a clean shutdown before it is elevated to force
    pub shutdown_timeout_secs: u64,
    /// Parallelism of the index dirty-buffer flush
    pub cache_flush_threads: usize,
    /// High watermark for back-pressuring index flush
    pub cache_max_throttle_cnt: usize,
    /// Low watermark for back-pressuring index flush
    pub cache_min_throttle_cnt: usize,

    /// I/O errors tolerated per device before it is reported down
    pub max_error_before_marking_dev_down: u64,
    /// Used fraction of an append-log vdev that fires the watermark callback
    pub vdev_high_watermark_percent: u8,

    /// Slab schema for the variable-size allocator
    pub slabs: SlabConfig,

    /// Size of the data vdev created on first boot
    pub data_vdev_size: u64,
    /// Size of the journal vdev created on first boot
    pub log_vdev_size: u64,
    /// Mirrors for the data vdev (0 = none)
    pub data_mirrors: u32,
}

impl EngineConfig {
    /// Configuration with defaults for the given devices.
    #[must_use]
    pub fn new(devices: Vec<PathBuf>) -> Self {
        Self {
            devices,
            system_uuid: Uuid::new_v4(),
            open_mode: OpenMode::DirectIo,
            min_virtual_page_size: MIN_IO_SIZE,
            phys_page_size: 4096,
            atomic_page_size: 4096,
            align_size: 4096,
            app_mem_size: 1024 * 1024 * 1024,
            soft_mem_release_threshold: 65,
            aggressive_mem_release_threshold: 85,
            shutdown_timeout_secs: 60,
            cache_flush_threads: 1,
            cache_max_throttle_cnt: 1024,
            cache_min_throttle_cnt: 64,
            max_error_before_marking_dev_down: 5,
            vdev_high_watermark_percent: 80,
            slabs: SlabConfig::default(),
            data_vdev_size: 0,
            log_vdev_size: 0,
            data_mirrors: 0,
        }
    }

    /// Smallest chunk the geometry permits
    #[must_use]
    pub fn min_chunk_size(&self) -> u64 {
        u64::from(self.phys_page_size) * crate::types::BLOCKS_PER_PORTION
            * crate::types::SEGMENTS_PER_CHUNK
    }

    /// Largest chunk a `BlockId` offset can address
    #[must_use]
    pub fn max_chunk_size(&self) -> u64 {
        crate::types::round_down(
            u64::from(u32::MAX) * u64::from(self.min_virtual_page_size),
            self.min_chunk_size(),
        )
    }

    pub fn validate(&self) -> Result<()> {
        if self.devices.is_empty() {
            return Err(Error::Config("at least one device is required".into()));
        }
        if self.min_virtual_page_size < MIN_IO_SIZE
            || !self.min_virtual_page_size.is_power_of_two()
        {
            return Err(Error::Config(format!(
                "min_virtual_page_size {} must be a power of two >= {}",
                self.min_virtual_page_size, MIN_IO_SIZE
            )));
        }
        if self.phys_page_size < self.atomic_page_size {
            return Err(Error::Config(
                "phys_page_size must be >= atomic_page_size".into(),
            ));
        }
        if self.soft_mem_release_threshold > self.aggressive_mem_release_threshold {
            return Err(Error::Config(
                "soft memory threshold must not exceed the aggressive threshold".into(),
            ));
        }
        if self.vdev_high_watermark_percent == 0 || self.vdev_high_watermark_percent > 100 {
            return Err(Error::Config("vdev_high_watermark_percent out of range".into()));
        }
        self.slabs.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = EngineConfig::new(vec![PathBuf::from("/tmp/d0")]);
        cfg.validate().unwrap();
        assert_eq!(cfg.min_virtual_page_size, 4096);
        assert_eq!(cfg.vdev_high_watermark_percent, 80);
    }

    #[test]
    fn test_config_rejects_bad_page_size() {
        let mut cfg = EngineConfig::new(vec![PathBuf::from("/tmp/d0")]);
        cfg.min_virtual_page_size = 512;
        assert!(cfg.validate().is_err());

        cfg.min_virtual_page_size = 5000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_config_rejects_empty_devices() {
        let cfg = EngineConfig::new(vec![]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_slab_schema_validation() {
        let mut cfg = EngineConfig::new(vec![PathBuf::from("/tmp/d0")]);
        cfg.slabs = SlabConfig {
            block_counts: vec![1, 3],
            weights: vec![0.5, 0.5],
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_min_chunk_size() {
        let cfg = EngineConfig::new(vec![PathBuf::from("/tmp/d0")]);
        // 4 KiB pages, 1024 blocks per portion, 8 segments
        assert_eq!(cfg.min_chunk_size(), 4096 * 1024 * 8);
    }
}
