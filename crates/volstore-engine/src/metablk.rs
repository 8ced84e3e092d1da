//! Meta-block registry.
//!
//! An out-of-band `(sub_type, key) → blob` store for subsystem state that
//! is not part of DM-info: allocator bitmaps, per-CP index superblocks,
//! volume superblocks. The whole registry persists as one snapshot
//! written to alternating halves of a dedicated block-mode vdev under a
//! generation counter, so a torn write always leaves the previous
//! snapshot intact; boot picks the higher valid generation.

use bytes::{Buf, BufMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};
use volstore_common::checksum::compute_crc32c;
use volstore_common::types::{round_up, MAGIC, MAX_BLKS_PER_UNIT};
use volstore_common::{BlockId, Error, Result};
use volstore_device::VirtualDev;

/// Key of one registry entry
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MetaKey {
    pub sub_type: String,
    pub id: u128,
}

impl MetaKey {
    #[must_use]
    pub fn new(sub_type: &str, id: u128) -> Self {
        Self {
            sub_type: sub_type.to_string(),
            id,
        }
    }
}

const SNAP_HEADER_SIZE: usize = 8 + 4 + 8 + 8;

struct RegState {
    entries: BTreeMap<MetaKey, Vec<u8>>,
    gen: u64,
    /// Half of the vdev the next persist writes to
    slot: u32,
}

/// Registry of subsystem meta blobs with A/B snapshot persistence
pub struct MetaRegistry {
    vdev: Arc<VirtualDev>,
    state: Mutex<RegState>,
}

impl MetaRegistry {
    /// Fresh registry on a newly created vdev
    #[must_use]
    pub fn format(vdev: Arc<VirtualDev>) -> Self {
        Self {
            vdev,
            state: Mutex::new(RegState {
                entries: BTreeMap::new(),
                gen: 0,
                slot: 0,
            }),
        }
    }

    /// Load the registry from whichever snapshot half carries the higher
    /// valid generation.
    pub fn open(vdev: Arc<VirtualDev>) -> Result<Self> {
        let mut best: Option<(u64, u32, BTreeMap<MetaKey, Vec<u8>>)> = None;
        for slot in 0..2u32 {
            match Self::read_snapshot(&vdev, slot) {
                Ok(Some((gen, entries))) => {
                    if best.as_ref().is_none_or(|(g, _, _)| gen > *g) {
                        best = Some((gen, slot, entries));
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(slot, "meta snapshot unreadable: {e}"),
            }
        }
        let (gen, slot, entries) = best.unwrap_or((0, 1, BTreeMap::new()));
        debug!(gen, entries = entries.len(), "meta registry loaded");
        Ok(Self {
            vdev,
            state: Mutex::new(RegState {
                entries,
                gen,
                // The next persist overwrites the other half.
                slot: 1 - slot,
            }),
        })
    }

    fn region_size(vdev: &VirtualDev) -> u64 {
        vdev.size() / 2
    }

    /// Add or replace an entry
    pub fn put(&self, sub_type: &str, id: u128, blob: Vec<u8>) {
        self.state.lock().entries.insert(MetaKey::new(sub_type, id), blob);
    }

    #[must_use]
    pub fn get(&self, sub_type: &str, id: u128) -> Option<Vec<u8>> {
        self.state.lock().entries.get(&MetaKey::new(sub_type, id)).cloned()
    }

    /// Remove an entry; removing a missing entry is a no-op
    pub fn remove(&self, sub_type: &str, id: u128) {
        self.state.lock().entries.remove(&MetaKey::new(sub_type, id));
    }

    /// All entries of one sub-type
    #[must_use]
    pub fn entries_of(&self, sub_type: &str) -> Vec<(u128, Vec<u8>)> {
        self.state
            .lock()
            .entries
            .range(
                MetaKey::new(sub_type, 0)..=MetaKey::new(sub_type, u128::MAX),
            )
            .map(|(k, v)| (k.id, v.clone()))
            .collect()
    }

    /// Write the whole registry to the inactive half and flip to it
    pub fn persist(&self) -> Result<()> {
        let mut st = self.state.lock();
        let payload = bincode::serialize(&st.entries)
            .map_err(|e| Error::Serialization(e.to_string()))?;

        let page = u64::from(self.vdev.page_size());
        let region = Self::region_size(&self.vdev);
        let total = round_up((SNAP_HEADER_SIZE + payload.len()) as u64, page);
        if total > region {
            return Err(Error::no_space(format!(
                "meta snapshot of {total} bytes exceeds its {region}-byte region"
            )));
        }

        let gen = st.gen + 1;
        let mut blob = Vec::with_capacity(total as usize);
        blob.put_u64_le(MAGIC);
        blob.put_u32_le(compute_crc32c(&payload));
        blob.put_u64_le(gen);
        blob.put_u64_le(payload.len() as u64);
        blob.extend_from_slice(&payload);
        blob.resize(total as usize, 0);

        self.write_region(st.slot, &blob)?;
        self.vdev.sync()?;

        st.gen = gen;
        st.slot = 1 - st.slot;
        debug!(gen, bytes = blob.len(), "meta registry persisted");
        Ok(())
    }

    fn write_region(&self, slot: u32, blob: &[u8]) -> Result<()> {
        let page = u64::from(self.vdev.page_size());
        let base_page = (u64::from(slot) * Self::region_size(&self.vdev) / page) as u32;
        let cid = self.vdev.primary_chunk_ids()[0];

        let unit_bytes = u64::from(MAX_BLKS_PER_UNIT) * page;
        for (i, piece) in blob.chunks(unit_bytes as usize).enumerate() {
            let n_pages = (piece.len() as u64).div_ceil(page) as u32;
            let offset = base_page + i as u32 * MAX_BLKS_PER_UNIT;
            let bid = BlockId::new(cid, n_pages, offset);
            self.vdev.write_block(bid, piece)?;
        }
        Ok(())
    }

    fn read_snapshot(
        vdev: &Arc<VirtualDev>,
        slot: u32,
    ) -> Result<Option<(u64, BTreeMap<MetaKey, Vec<u8>>)>> {
        let page = u64::from(vdev.page_size());
        let base_page = (u64::from(slot) * Self::region_size(vdev) / page) as u32;
        let cid = vdev.primary_chunk_ids()[0];

        let mut head = vec![0u8; page as usize];
        vdev.read_block(BlockId::new(cid, 1, base_page), &mut head)?;

        let mut buf = &head[..];
        if buf.get_u64_le() != MAGIC {
            return Ok(None);
        }
        let crc = buf.get_u32_le();
        let gen = buf.get_u64_le();
        let len = buf.get_u64_le() as usize;
        if (SNAP_HEADER_SIZE + len) as u64 > Self::region_size(vdev) {
            return Ok(None);
        }

        let total = round_up((SNAP_HEADER_SIZE + len) as u64, page);
        let mut blob = vec![0u8; total as usize];
        let unit_bytes = u64::from(MAX_BLKS_PER_UNIT) * page;
        for (i, piece) in blob.chunks_mut(unit_bytes as usize).enumerate() {
            let n_pages = (piece.len() as u64).div_ceil(page) as u32;
            let offset = base_page + i as u32 * MAX_BLKS_PER_UNIT;
            vdev.read_block(BlockId::new(cid, n_pages, offset), piece)?;
        }

        let payload = &blob[SNAP_HEADER_SIZE..SNAP_HEADER_SIZE + len];
        let actual = compute_crc32c(payload);
        if actual != crc {
            return Err(Error::ChecksumMismatch {
                expected: crc,
                actual,
            });
        }
        let entries = bincode::deserialize(payload)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(Some((gen, entries)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;
    use uuid::Uuid;
    use volstore_common::OpenMode;
    use volstore_device::dm::DmConfig;
    use volstore_device::DeviceManager;

    fn setup() -> (TempDir, Arc<VirtualDev>) {
        let dir = TempDir::new().unwrap();
        let devices: Vec<PathBuf> = (0..2)
            .map(|i| {
                let path = dir.path().join(format!("pdev{i}"));
                std::fs::File::create(&path).unwrap().set_len(512 << 20).unwrap();
                path
            })
            .collect();
        let dm = DeviceManager::new(DmConfig {
            open_mode: OpenMode::BufferedIo,
            phys_page_size: 4096,
            atomic_page_size: 4096,
            system_uuid: Uuid::new_v4(),
            max_error_before_marking_dev_down: 3,
        });
        dm.add_devices(&devices, true).unwrap();
        let vdev =
            VirtualDev::create(dm, "meta", 32 << 20, 0, 4096, false, b"meta", 80).unwrap();
        (dir, vdev)
    }

    #[test]
    fn test_put_get_remove() {
        let (_dir, vdev) = setup();
        let reg = MetaRegistry::format(vdev);

        reg.put("blkalloc", 7, vec![1, 2, 3]);
        assert_eq!(reg.get("blkalloc", 7), Some(vec![1, 2, 3]));

        reg.remove("blkalloc", 7);
        assert_eq!(reg.get("blkalloc", 7), None);
        // Removing again is harmless.
        reg.remove("blkalloc", 7);
    }

    #[test]
    fn test_persist_and_reload() {
        let (_dir, vdev) = setup();
        {
            let reg = MetaRegistry::format(vdev.clone());
            reg.put("vol", 42, b"volume sb".to_vec());
            reg.put("blkalloc", 1, vec![0xFF; 4096]);
            reg.persist().unwrap();
        }

        let reg = MetaRegistry::open(vdev).unwrap();
        assert_eq!(reg.get("vol", 42), Some(b"volume sb".to_vec()));
        assert_eq!(reg.get("blkalloc", 1), Some(vec![0xFF; 4096]));
    }

    #[test]
    fn test_reload_prefers_latest_generation() {
        let (_dir, vdev) = setup();
        {
            let reg = MetaRegistry::format(vdev.clone());
            reg.put("cpsb", 1, b"old".to_vec());
            reg.persist().unwrap();
            reg.put("cpsb", 1, b"new".to_vec());
            reg.persist().unwrap();
        }

        let reg = MetaRegistry::open(vdev).unwrap();
        assert_eq!(reg.get("cpsb", 1), Some(b"new".to_vec()));
    }

    #[test]
    fn test_entries_of_filters_by_sub_type() {
        let (_dir, vdev) = setup();
        let reg = MetaRegistry::format(vdev);
        reg.put("blkalloc", 0, vec![0]);
        reg.put("blkalloc", 1, vec![1]);
        reg.put("vol", 0, vec![9]);

        let mut blkalloc = reg.entries_of("blkalloc");
        blkalloc.sort_by_key(|(id, _)| *id);
        assert_eq!(blkalloc.len(), 2);
        assert_eq!(blkalloc[0], (0, vec![0]));
        assert_eq!(blkalloc[1], (1, vec![1]));
        assert_eq!(reg.entries_of("vol").len(), 1);
    }
}
