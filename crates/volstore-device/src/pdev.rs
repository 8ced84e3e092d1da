//! Physical device.
//!
//! A `PhysicalDev` owns one raw device: its two superblock slots, the two
//! DM-info copy windows, positional sync I/O with per-device statistics,
//! and the error counter the device manager consults before marking the
//! device down.

use crate::raw_io::{AlignedBuffer, RawFile};
use crate::superblock::{DeviceLayout, Superblock};
use parking_lot::Mutex;
use std::io::{IoSlice, IoSliceMut};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};
use uuid::Uuid;
use volstore_common::{Error, OpenMode, Result};

/// Per-device I/O statistics
#[derive(Debug, Default)]
pub struct DevStats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub read_errors: AtomicU64,
    pub write_errors: AtomicU64,
}

/// One raw block device owned by the engine
pub struct PhysicalDev {
    file: RawFile,
    layout: DeviceLayout,
    sb: Mutex<Superblock>,
    /// Whether a valid superblock was found at open time
    formatted: bool,
    error_count: AtomicU64,
    stats: DevStats,
}

impl PhysicalDev {
    /// Open a device and load whichever superblock slots parse.
    /// Returns the device and whether it was already formatted.
    pub fn open(
        path: impl AsRef<Path>,
        mode: OpenMode,
        layout: DeviceLayout,
        system_uuid: Uuid,
    ) -> Result<(Self, bool)> {
        let align = layout.phys_page_size as usize;
        let file = RawFile::open(&path, mode, align)?;

        let mut slots = [None, None];
        for (slot, parsed) in slots.iter_mut().enumerate() {
            let mut buf = AlignedBuffer::new(layout.atomic_page_size as usize, align);
            if file
                .read_at(layout.sb_slot_offset(slot as u32), buf.as_mut_slice())
                .is_ok()
            {
                *parsed = Superblock::from_bytes(buf.as_slice()).ok();
            }
        }
        let [slot0, slot1] = slots;

        match Superblock::select(slot0, slot1) {
            Some(sb) => {
                if sb.system_uuid != system_uuid {
                    warn!(
                        device = file.path(),
                        "superblock belongs to a different system, treating as unformatted"
                    );
                    let sb = Superblock::new(u32::MAX, 0, system_uuid, &layout);
                    return Ok((Self::from_parts(file, layout, sb, false), false));
                }
                debug!(device = file.path(), gen = sb.gen, "loaded superblock");
                Ok((Self::from_parts(file, layout, sb, true), true))
            }
            None => {
                let sb = Superblock::new(u32::MAX, 0, system_uuid, &layout);
                Ok((Self::from_parts(file, layout, sb, false), false))
            }
        }
    }

    /// Create a file-backed device of `size` bytes (tests and first boot
    /// on files); real block devices keep their native size.
    pub fn create(
        path: impl AsRef<Path>,
        size: u64,
        mode: OpenMode,
        layout: DeviceLayout,
        system_uuid: Uuid,
    ) -> Result<Self> {
        let align = layout.phys_page_size as usize;
        let file = RawFile::create(&path, size, mode, align)?;
        let sb = Superblock::new(u32::MAX, 0, system_uuid, &layout);
        Ok(Self::from_parts(file, layout, sb, false))
    }

    fn from_parts(file: RawFile, layout: DeviceLayout, sb: Superblock, formatted: bool) -> Self {
        Self {
            file,
            layout,
            sb: Mutex::new(sb),
            formatted,
            error_count: AtomicU64::new(0),
            stats: DevStats::default(),
        }
    }

    /// Stamp a fresh identity onto this device and persist both slots.
    /// Used on first-time format and when a spare replaces a missing pdev.
    pub fn format(&self, dev_id: u32, dev_offset: u64, first_chunk_id: u32) -> Result<()> {
        let mut sb = self.sb.lock();
        sb.dev_id = dev_id;
        sb.dev_offset = dev_offset;
        sb.first_chunk_id = first_chunk_id;
        sb.gen = 0;
        sb.current_slot = 0;
        sb.seal();
        for slot in 0..2 {
            self.write_sb_slot(&sb, slot)?;
        }
        self.file.sync()?;
        debug!(device = self.file.path(), dev_id, "formatted device");
        Ok(())
    }

    /// Update the in-memory identity without persisting (recovery rename)
    pub fn assume_identity(&self, dev_id: u32, dev_offset: u64, first_chunk_id: u32) {
        let mut sb = self.sb.lock();
        sb.dev_id = dev_id;
        sb.dev_offset = dev_offset;
        sb.first_chunk_id = first_chunk_id;
    }

    /// Persist the superblock with a new generation into the inactive
    /// slot, then advance `current_slot`.
    pub fn write_superblock(&self, gen: u64) -> Result<()> {
        let mut sb = self.sb.lock();
        let next = 1 - sb.current_slot;
        sb.gen = gen;
        sb.current_slot = next;
        sb.seal();
        self.write_sb_slot(&sb, next)?;
        self.file.sync()
    }

    fn write_sb_slot(&self, sb: &Superblock, slot: u32) -> Result<()> {
        let mut buf = AlignedBuffer::new(
            self.layout.atomic_page_size as usize,
            self.layout.phys_page_size as usize,
        );
        buf.fill_from(&sb.to_bytes());
        self.file.write_at(self.layout.sb_slot_offset(slot), buf.as_slice())
    }

    /// Read the current DM-info copy into `buf`
    pub fn read_dm_copy(&self, buf: &mut [u8]) -> Result<()> {
        let slot = self.sb.lock().current_slot;
        let offset = self.layout.dm_copy_offset(slot);
        self.read_at(offset, buf)
    }

    /// Write a DM-info payload to the inactive copy and flip the
    /// superblock to it under the new generation.
    pub fn write_dm_copy(&self, gen: u64, payload: &[u8]) -> Result<()> {
        let next = 1 - self.sb.lock().current_slot;
        let offset = self.layout.dm_copy_offset(next);
        let mut buf = AlignedBuffer::new(
            self.layout.dm_info_size as usize,
            self.layout.phys_page_size as usize,
        );
        buf.fill_from(payload);
        self.write_at(offset, buf.as_slice())?;
        self.file.sync()?;
        self.write_superblock(gen)
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match self.file.read_at(offset, buf) {
            Ok(()) => {
                self.stats.reads.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .bytes_read
                    .fetch_add(buf.len() as u64, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.stats.read_errors.fetch_add(1, Ordering::Relaxed);
                self.error_count.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        match self.file.write_at(offset, buf) {
            Ok(()) => {
                self.stats.writes.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .bytes_written
                    .fetch_add(buf.len() as u64, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.stats.write_errors.fetch_add(1, Ordering::Relaxed);
                self.error_count.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Scatter read: fill each slice in turn from ascending offsets
    pub fn readv_at(&self, mut offset: u64, bufs: &mut [IoSliceMut<'_>]) -> Result<()> {
        for buf in bufs {
            self.read_at(offset, buf)?;
            offset += buf.len() as u64;
        }
        Ok(())
    }

    /// Gather write: write each slice in turn at ascending offsets
    pub fn writev_at(&self, mut offset: u64, bufs: &[IoSlice<'_>]) -> Result<()> {
        for buf in bufs {
            self.write_at(offset, buf)?;
            offset += buf.len() as u64;
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync()
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.file.size()
    }

    #[must_use]
    pub fn path(&self) -> &str {
        self.file.path()
    }

    #[must_use]
    pub fn is_formatted(&self) -> bool {
        self.formatted
    }

    #[must_use]
    pub fn dev_id(&self) -> u32 {
        self.sb.lock().dev_id
    }

    #[must_use]
    pub fn sb_gen(&self) -> u64 {
        self.sb.lock().gen
    }

    #[must_use]
    pub fn first_chunk_id(&self) -> u32 {
        self.sb.lock().first_chunk_id
    }

    pub fn set_first_chunk_id(&self, first: u32) {
        self.sb.lock().first_chunk_id = first;
    }

    #[must_use]
    pub fn layout(&self) -> &DeviceLayout {
        &self.layout
    }

    #[must_use]
    pub fn stats(&self) -> &DevStats {
        &self.stats
    }

    #[must_use]
    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    /// Bump the error counter for a failure observed above this layer
    pub fn note_error(&self) -> u64 {
        self.error_count.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn layout() -> DeviceLayout {
        DeviceLayout::new(4096, 4096, 70000)
    }

    #[test]
    fn test_format_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev0");
        let uuid = Uuid::new_v4();

        {
            let dev =
                PhysicalDev::create(&path, 64 << 20, OpenMode::BufferedIo, layout(), uuid).unwrap();
            assert!(!dev.is_formatted());
            dev.format(3, 0, u32::MAX).unwrap();
        }

        let (dev, formatted) =
            PhysicalDev::open(&path, OpenMode::BufferedIo, layout(), uuid).unwrap();
        assert!(formatted);
        assert_eq!(dev.dev_id(), 3);
        assert_eq!(dev.sb_gen(), 0);
    }

    #[test]
    fn test_superblock_slot_alternation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev0");
        let uuid = Uuid::new_v4();

        let dev =
            PhysicalDev::create(&path, 64 << 20, OpenMode::BufferedIo, layout(), uuid).unwrap();
        dev.format(0, 0, u32::MAX).unwrap();
        dev.write_superblock(1).unwrap();
        dev.write_superblock(2).unwrap();
        drop(dev);

        let (dev, formatted) =
            PhysicalDev::open(&path, OpenMode::BufferedIo, layout(), uuid).unwrap();
        assert!(formatted);
        assert_eq!(dev.sb_gen(), 2);
    }

    #[test]
    fn test_boot_from_single_slot_after_zeroing_other() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev0");
        let uuid = Uuid::new_v4();
        let l = layout();

        {
            let dev =
                PhysicalDev::create(&path, 64 << 20, OpenMode::BufferedIo, l, uuid).unwrap();
            dev.format(1, 0, u32::MAX).unwrap();
            dev.write_superblock(5).unwrap();
        }

        // Zero the slot that write_superblock(5) landed in; the other
        // still holds generation 0 and must boot the device.
        {
            let file = RawFile::open(&path, OpenMode::BufferedIo, 4096).unwrap();
            let zeros = vec![0u8; l.atomic_page_size as usize];
            file.write_at(l.sb_slot_offset(1), &zeros).unwrap();
            file.sync().unwrap();
        }

        let (dev, formatted) = PhysicalDev::open(&path, OpenMode::BufferedIo, l, uuid).unwrap();
        assert!(formatted);
        assert_eq!(dev.sb_gen(), 0);
    }

    #[test]
    fn test_dm_copy_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev0");
        let uuid = Uuid::new_v4();
        let l = layout();

        let dev = PhysicalDev::create(&path, 64 << 20, OpenMode::BufferedIo, l, uuid).unwrap();
        dev.format(0, 0, u32::MAX).unwrap();

        let payload = vec![0xCDu8; 1024];
        dev.write_dm_copy(1, &payload).unwrap();
        assert_eq!(dev.sb_gen(), 1);

        let mut buf = vec![0u8; l.dm_info_size as usize];
        dev.read_dm_copy(&mut buf).unwrap();
        assert_eq!(&buf[..1024], &payload[..]);
    }

    #[test]
    fn test_stats_and_error_count() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev0");
        let uuid = Uuid::new_v4();

        let dev =
            PhysicalDev::create(&path, 1 << 20, OpenMode::BufferedIo, layout(), uuid).unwrap();
        dev.write_at(0, &[0u8; 4096]).unwrap();
        let mut buf = [0u8; 4096];
        dev.read_at(0, &mut buf).unwrap();

        assert_eq!(dev.stats().writes.load(Ordering::Relaxed), 1);
        assert_eq!(dev.stats().reads.load(Ordering::Relaxed), 1);

        // Read past the end of the device fails and counts.
        assert!(dev.read_at(2 << 20, &mut buf).is_err());
        assert_eq!(dev.error_count(), 1);
    }
}
