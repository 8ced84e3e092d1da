//! Block allocator.
//!
//! Each chunk of a data-bearing vdev gets a [`ChunkAllocator`]: two
//! bitmaps of equal length, the *cache* bitmap serving allocations and the
//! *disk* bitmap reflecting what the next checkpoint will persist. Bits
//! are guarded by one mutex per `BLOCKS_PER_PORTION` range so concurrent
//! allocations on one chunk rarely contend.
//!
//! Frees are staged: `free` clears the disk bit immediately (so the next
//! bitmap snapshot no longer references the block) but the cache bit only
//! clears at `cp_done`, which keeps the block unallocatable until the
//! bitmap that forgot it is durable.
//!
//! [`BlkStore`] wraps a vdev with per-chunk allocators and the allocation
//! policy: *Fixed* hands out single-block units, *Variable* serves
//! slab-sized contiguous units with device-hint plus round-robin
//! fallback.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;
use volstore_common::types::{BLOCKS_PER_PORTION, MAX_BLKS_PER_UNIT};
use volstore_common::{BlockId, ChunkId, Error, PdevId, Result, SlabConfig};
use volstore_device::VirtualDev;

/// Allocation hints: try the hinted device first, optionally roll over
/// the other devices in round-robin order.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocHints {
    pub dev_id_hint: Option<PdevId>,
    pub can_look_for_other_dev: bool,
}

impl AllocHints {
    #[must_use]
    pub fn any_device() -> Self {
        Self {
            dev_id_hint: None,
            can_look_for_other_dev: true,
        }
    }
}

/// Allocation policy of a vdev
#[derive(Debug, Clone)]
pub enum AllocPolicy {
    /// Single-block units, page granular (index and metadata stores)
    Fixed,
    /// Slab-bucketed contiguous units (volume data)
    Variable(SlabConfig),
}

/// One portion of the bitmaps: `BLOCKS_PER_PORTION` bits each
struct Portion {
    cache: Vec<u64>,
    disk: Vec<u64>,
}

const WORD_BITS: u64 = 64;

fn bit_get(words: &[u64], bit: u64) -> bool {
    words[(bit / WORD_BITS) as usize] & (1 << (bit % WORD_BITS)) != 0
}

fn bit_set(words: &mut [u64], bit: u64) {
    words[(bit / WORD_BITS) as usize] |= 1 << (bit % WORD_BITS);
}

fn bit_clear(words: &mut [u64], bit: u64) {
    words[(bit / WORD_BITS) as usize] &= !(1 << (bit % WORD_BITS));
}

/// Per-chunk bitmap allocator with disk and cache views
pub struct ChunkAllocator {
    chunk_id: ChunkId,
    total_blocks: u64,
    portions: Vec<Mutex<Portion>>,
    free_blocks: AtomicU64,
    /// Freed units waiting for `cp_done` before their cache bits clear
    staged: Mutex<Vec<(u32, u32)>>,
}

impl ChunkAllocator {
    #[must_use]
    pub fn new(chunk_id: ChunkId, total_blocks: u64) -> Self {
        let n_portions = total_blocks.div_ceil(BLOCKS_PER_PORTION) as usize;
        let words = (BLOCKS_PER_PORTION / WORD_BITS) as usize;
        Self {
            chunk_id,
            total_blocks,
            portions: (0..n_portions)
                .map(|_| {
                    Mutex::new(Portion {
                        cache: vec![0; words],
                        disk: vec![0; words],
                    })
                })
                .collect(),
            free_blocks: AtomicU64::new(total_blocks),
            staged: Mutex::new(Vec::new()),
        }
    }

    /// Rebuild from a persisted disk bitmap; the cache view starts as a
    /// copy of it.
    #[must_use]
    pub fn restore(chunk_id: ChunkId, total_blocks: u64, disk_bytes: &[u8]) -> Self {
        let alloc = Self::new(chunk_id, total_blocks);
        let mut used = 0u64;
        for (pi, portion) in alloc.portions.iter().enumerate() {
            let mut guard = portion.lock();
            let p = &mut *guard;
            for (wi, word) in p.disk.iter_mut().enumerate() {
                let byte_base = (pi * (BLOCKS_PER_PORTION / WORD_BITS) as usize + wi) * 8;
                let mut w = 0u64;
                for b in 0..8 {
                    if let Some(&byte) = disk_bytes.get(byte_base + b) {
                        w |= u64::from(byte) << (b * 8);
                    }
                }
                *word = w;
                used += w.count_ones() as u64;
            }
            p.cache.copy_from_slice(&p.disk);
        }
        alloc.free_blocks.store(total_blocks - used, Ordering::Relaxed);
        alloc
    }

    #[must_use]
    pub fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    #[must_use]
    pub fn free_count(&self) -> u64 {
        self.free_blocks.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn total_count(&self) -> u64 {
        self.total_blocks
    }

    /// Allocate `n` contiguous blocks from the cache bitmap. A unit never
    /// spans a portion boundary.
    pub fn alloc_contiguous(&self, n: u32) -> Option<u32> {
        debug_assert!(n >= 1 && n <= MAX_BLKS_PER_UNIT);
        for (pi, portion) in self.portions.iter().enumerate() {
            let base = pi as u64 * BLOCKS_PER_PORTION;
            let limit = (self.total_blocks - base).min(BLOCKS_PER_PORTION);
            if u64::from(n) > limit {
                continue;
            }
            let mut p = portion.lock();
            let mut run = 0u64;
            for bit in 0..limit {
                if bit_get(&p.cache, bit) {
                    run = 0;
                } else {
                    run += 1;
                    if run == u64::from(n) {
                        let start = bit + 1 - run;
                        for b in start..=bit {
                            bit_set(&mut p.cache, b);
                        }
                        self.free_blocks.fetch_sub(u64::from(n), Ordering::Relaxed);
                        return Some((base + start) as u32);
                    }
                }
            }
        }
        None
    }

    /// Undo an allocation that was never committed (rollback path)
    pub fn retract(&self, offset: u32, n: u32) {
        self.for_bits(offset, n, |p, bit| bit_clear(&mut p.cache, bit));
        self.free_blocks.fetch_add(u64::from(n), Ordering::Relaxed);
    }

    /// Make an allocation visible to the next disk-bitmap snapshot
    pub fn commit(&self, offset: u32, n: u32) {
        self.for_bits(offset, n, |p, bit| bit_set(&mut p.disk, bit));
    }

    /// Recovery: mark blocks allocated in both views. Re-reserving an
    /// already-set range is an idempotent success; an out-of-range
    /// request is an error.
    pub fn reserve(&self, offset: u32, n: u32) -> Result<()> {
        if u64::from(offset) + u64::from(n) > self.total_blocks {
            return Err(Error::io_error(format!(
                "reserve of {n} blocks at {offset} beyond chunk {}",
                self.chunk_id
            )));
        }
        let mut newly = 0u64;
        self.for_bits(offset, n, |p, bit| {
            if !bit_get(&p.cache, bit) {
                bit_set(&mut p.cache, bit);
                newly += 1;
            }
            bit_set(&mut p.disk, bit);
        });
        self.free_blocks.fetch_sub(newly, Ordering::Relaxed);
        Ok(())
    }

    /// Free a unit: the disk bit clears now, the cache bit is staged
    /// until `cp_done`.
    pub fn free(&self, offset: u32, n: u32) {
        self.for_bits(offset, n, |p, bit| bit_clear(&mut p.disk, bit));
        self.staged.lock().push((offset, n));
    }

    #[must_use]
    pub fn is_allocated(&self, offset: u32, n: u32) -> bool {
        let mut all = true;
        self.for_bits(offset, n, |p, bit| {
            if !bit_get(&p.cache, bit) {
                all = false;
            }
        });
        all
    }

    #[must_use]
    pub fn is_allocated_on_disk(&self, offset: u32, n: u32) -> bool {
        let mut all = true;
        self.for_bits(offset, n, |p, bit| {
            if !bit_get(&p.disk, bit) {
                all = false;
            }
        });
        all
    }

    /// Serialize the disk bitmap for persistence
    #[must_use]
    pub fn snapshot_disk(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_blocks.div_ceil(8) as usize);
        for portion in &self.portions {
            let p = portion.lock();
            for word in &p.disk {
                out.extend_from_slice(&word.to_le_bytes());
            }
        }
        out.truncate(self.total_blocks.div_ceil(8) as usize);
        out
    }

    /// Release staged frees: their cache bits clear and the blocks
    /// become allocatable again. A unit can be staged twice when journal
    /// replay rediscovers a free, so only bits that were actually set
    /// count toward the released total.
    pub fn cp_done(&self) {
        let staged = std::mem::take(&mut *self.staged.lock());
        let mut released = 0u64;
        for (offset, n) in staged {
            self.for_bits(offset, n, |p, bit| {
                if bit_get(&p.cache, bit) {
                    bit_clear(&mut p.cache, bit);
                    released += 1;
                }
            });
        }
        self.free_blocks.fetch_add(released, Ordering::Relaxed);
    }

    fn for_bits(&self, offset: u32, n: u32, mut f: impl FnMut(&mut Portion, u64)) {
        let mut bit = u64::from(offset);
        let end = u64::from(offset) + u64::from(n);
        while bit < end {
            let pi = (bit / BLOCKS_PER_PORTION) as usize;
            let mut p = self.portions[pi].lock();
            let portion_end = ((pi as u64) + 1) * BLOCKS_PER_PORTION;
            while bit < end.min(portion_end) {
                f(&mut p, bit % BLOCKS_PER_PORTION);
                bit += 1;
            }
        }
    }
}

/// Checkpoint handle of the allocator: a plain counter, as the bitmaps
/// themselves carry the state.
#[derive(Debug)]
pub struct BlkAllocCp {
    pub cnt: u64,
}

/// A vdev paired with per-chunk allocators and an allocation policy
pub struct BlkStore {
    vdev: Arc<VirtualDev>,
    policy: AllocPolicy,
    allocators: HashMap<ChunkId, Arc<ChunkAllocator>>,
    groups: Vec<(PdevId, Vec<ChunkId>)>,
    rr: AtomicUsize,
    page_size: u32,
}

impl BlkStore {
    #[must_use]
    pub fn new(vdev: Arc<VirtualDev>, policy: AllocPolicy) -> Self {
        let page_size = vdev.page_size();
        let blocks_per_chunk = vdev.chunk_size() / u64::from(page_size);
        let mut allocators = HashMap::new();
        for cid in vdev.primary_chunk_ids() {
            allocators.insert(cid, Arc::new(ChunkAllocator::new(cid, blocks_per_chunk)));
        }
        let groups = vdev.pdev_chunk_groups();
        Self {
            vdev,
            policy,
            allocators,
            groups,
            rr: AtomicUsize::new(0),
            page_size,
        }
    }

    #[must_use]
    pub fn vdev(&self) -> &Arc<VirtualDev> {
        &self.vdev
    }

    #[must_use]
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    #[must_use]
    pub fn chunk_ids(&self) -> Vec<ChunkId> {
        self.vdev.primary_chunk_ids()
    }

    /// Swap in a recovered disk bitmap for one chunk
    pub fn restore_bitmap(&mut self, chunk_id: ChunkId, disk_bytes: &[u8]) -> Result<()> {
        let blocks = self.vdev.chunk_size() / u64::from(self.page_size);
        if !self.allocators.contains_key(&chunk_id) {
            return Err(Error::io_error(format!(
                "bitmap for unknown chunk {chunk_id}"
            )));
        }
        self.allocators.insert(
            chunk_id,
            Arc::new(ChunkAllocator::restore(chunk_id, blocks, disk_bytes)),
        );
        Ok(())
    }

    fn allocator(&self, chunk_id: ChunkId) -> Result<&Arc<ChunkAllocator>> {
        self.allocators
            .get(&chunk_id)
            .ok_or_else(|| Error::io_error(format!("no allocator for chunk {chunk_id}")))
    }

    /// The unit size the policy serves for a remaining block count
    fn unit_for(&self, remaining: u32) -> u32 {
        match &self.policy {
            AllocPolicy::Fixed => 1,
            AllocPolicy::Variable(slabs) => slabs
                .block_counts
                .iter()
                .copied()
                .filter(|&s| s <= remaining)
                .max()
                .unwrap_or(1)
                .min(MAX_BLKS_PER_UNIT),
        }
    }

    /// Allocate units totalling `n_blocks` blocks. Tries the hinted
    /// device first, then round-robins; a unit that fails on every
    /// device is halved before the whole allocation gives up and rolls
    /// back.
    pub fn alloc(&self, n_blocks: u32, hints: AllocHints) -> Result<Vec<BlockId>> {
        let mut out: Vec<BlockId> = Vec::new();
        let mut remaining = n_blocks;

        while remaining > 0 {
            let mut unit = self.unit_for(remaining);
            let bid = loop {
                match self.alloc_unit(unit, hints) {
                    Some(bid) => break Some(bid),
                    None if unit > 1 => unit /= 2,
                    None => break None,
                }
            };
            match bid {
                Some(bid) => {
                    remaining -= bid.n_blocks();
                    out.push(bid);
                }
                None => {
                    for bid in &out {
                        if let Ok(alloc) = self.allocator(bid.chunk_id()) {
                            alloc.retract(bid.offset(), bid.n_blocks());
                        }
                    }
                    return Err(Error::no_space(format!(
                        "cannot allocate {n_blocks} blocks from vdev {}",
                        self.vdev.vdev_id()
                    )));
                }
            }
        }
        Ok(out)
    }

    /// Allocate exactly one contiguous unit of `n_blocks`
    pub fn alloc_contiguous(&self, n_blocks: u32, hints: AllocHints) -> Result<BlockId> {
        self.alloc_unit(n_blocks, hints).ok_or_else(|| {
            Error::no_space(format!(
                "no contiguous run of {n_blocks} blocks on vdev {}",
                self.vdev.vdev_id()
            ))
        })
    }

    fn alloc_unit(&self, n: u32, hints: AllocHints) -> Option<BlockId> {
        let n_groups = self.groups.len();
        let start = match hints.dev_id_hint {
            Some(hint) => self
                .groups
                .iter()
                .position(|(p, _)| *p == hint)
                .unwrap_or(0),
            None => self.rr.fetch_add(1, Ordering::Relaxed) % n_groups,
        };
        for i in 0..n_groups {
            let (_, chunks) = &self.groups[(start + i) % n_groups];
            for cid in chunks {
                if let Some(alloc) = self.allocators.get(cid) {
                    if let Some(offset) = alloc.alloc_contiguous(n) {
                        return Some(BlockId::new(*cid, n, offset));
                    }
                }
            }
            if !hints.can_look_for_other_dev {
                break;
            }
        }
        None
    }

    /// Commit: the unit becomes visible in the disk bitmap at the next CP
    pub fn commit(&self, bid: BlockId) -> Result<()> {
        self.allocator(bid.chunk_id())?.commit(bid.offset(), bid.n_blocks());
        Ok(())
    }

    /// Roll back an allocation that was never committed
    pub fn retract(&self, bid: BlockId) {
        if let Ok(alloc) = self.allocator(bid.chunk_id()) {
            alloc.retract(bid.offset(), bid.n_blocks());
        }
    }

    /// Recovery: mark a journaled unit allocated in both views
    pub fn reserve(&self, bid: BlockId) -> Result<()> {
        self.allocator(bid.chunk_id())?.reserve(bid.offset(), bid.n_blocks())
    }

    /// Free part of a unit (offset and count in blocks within the unit)
    pub fn free(&self, bid: BlockId, offset: u32, n_blocks: u32) -> Result<()> {
        self.allocator(bid.chunk_id())?
            .free(bid.offset() + offset, n_blocks);
        Ok(())
    }

    #[must_use]
    pub fn is_allocated(&self, bid: BlockId) -> bool {
        self.allocator(bid.chunk_id())
            .map(|a| a.is_allocated(bid.offset(), bid.n_blocks()))
            .unwrap_or(false)
    }

    #[must_use]
    pub fn free_count(&self) -> u64 {
        self.allocators.values().map(|a| a.free_count()).sum()
    }

    // ---- checkpoint hooks -------------------------------------------

    #[must_use]
    pub fn attach_prepare_cp(cur: Option<&Arc<BlkAllocCp>>) -> Arc<BlkAllocCp> {
        Arc::new(BlkAllocCp {
            cnt: cur.map_or(0, |c| c.cnt + 1),
        })
    }

    /// Snapshot every chunk's disk bitmap for persistence
    #[must_use]
    pub fn cp_start(&self) -> Vec<(ChunkId, Vec<u8>)> {
        let mut out: Vec<(ChunkId, Vec<u8>)> = self
            .allocators
            .iter()
            .map(|(cid, a)| (*cid, a.snapshot_disk()))
            .collect();
        out.sort_by_key(|(cid, _)| *cid);
        debug!(vdev = %self.vdev.vdev_id(), chunks = out.len(), "block allocator snapshot");
        out
    }

    /// Release staged frees on every chunk
    pub fn cp_done(&self) {
        for a in self.allocators.values() {
            a.cp_done();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;
    use uuid::Uuid;
    use volstore_common::{OpenMode, SlabConfig};
    use volstore_device::dm::DmConfig;
    use volstore_device::DeviceManager;

    fn store_rig(policy: AllocPolicy) -> (TempDir, BlkStore) {
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
            VirtualDev::create(dm, "data", 64 << 20, 0, 4096, true, &[], 80).unwrap();
        (dir, BlkStore::new(vdev, policy))
    }

    #[test]
    fn test_fixed_policy_allocates_single_block_units() {
        let (_dir, store) = store_rig(AllocPolicy::Fixed);
        let blocks = store.alloc(4, AllocHints::any_device()).unwrap();
        assert_eq!(blocks.len(), 4, "fixed policy is page granular");
        assert!(blocks.iter().all(|b| b.n_blocks() == 1));
    }

    #[test]
    fn test_variable_policy_uses_slab_units() {
        let (_dir, store) = store_rig(AllocPolicy::Variable(SlabConfig::default()));
        let blocks = store.alloc(40, AllocHints::any_device()).unwrap();
        // 40 blocks out of [1,2,4,8,16,32] slabs: 32 + 8.
        let sizes: Vec<u32> = blocks.iter().map(|b| b.n_blocks()).collect();
        assert_eq!(sizes.iter().sum::<u32>(), 40);
        assert_eq!(sizes, vec![32, 8]);
    }

    #[test]
    fn test_hinted_device_then_round_robin() {
        let (_dir, store) = store_rig(AllocPolicy::Variable(SlabConfig::default()));
        let (first_pdev, first_chunks) = store.groups[0].clone();
        let hint = AllocHints {
            dev_id_hint: Some(first_pdev),
            can_look_for_other_dev: true,
        };

        // Exhaust the hinted device's only chunk.
        let blocks_per_chunk =
            (store.vdev().chunk_size() / u64::from(store.page_size())) as u32;
        let mut allocated = 0;
        while allocated < blocks_per_chunk {
            let bid = store.alloc_contiguous(32, hint).unwrap();
            if bid.chunk_id() != first_chunks[0] {
                break;
            }
            allocated += 32;
        }

        // Further hinted allocations roll over to the other device.
        let bid = store.alloc_contiguous(32, hint).unwrap();
        assert!(!first_chunks.contains(&bid.chunk_id()));

        // With rollover disabled the hinted device's exhaustion is final.
        let pinned = AllocHints {
            dev_id_hint: Some(first_pdev),
            can_look_for_other_dev: false,
        };
        assert!(store.alloc_contiguous(32, pinned).is_err());
    }

    #[test]
    fn test_store_exhaustion_reports_no_space() {
        let (_dir, store) = store_rig(AllocPolicy::Variable(SlabConfig::default()));
        let total = store.free_count();
        // Consume everything, then one more unit must fail cleanly.
        let mut grabbed = 0u64;
        while grabbed < total {
            let bid = store.alloc(32, AllocHints::any_device()).unwrap();
            grabbed += u64::from(bid.iter().map(|b| b.n_blocks()).sum::<u32>());
        }
        let err = store.alloc(1, AllocHints::any_device()).unwrap_err();
        assert!(err.is_no_space());
        assert_eq!(store.free_count(), 0);
    }

    #[test]
    fn test_alloc_free_cycle() {
        let alloc = ChunkAllocator::new(ChunkId::new(0), 4096);
        assert_eq!(alloc.free_count(), 4096);

        let off = alloc.alloc_contiguous(8).unwrap();
        assert!(alloc.is_allocated(off, 8));
        assert_eq!(alloc.free_count(), 4088);
        assert!(!alloc.is_allocated_on_disk(off, 8));

        alloc.commit(off, 8);
        assert!(alloc.is_allocated_on_disk(off, 8));

        // Freed blocks stay unallocatable until cp_done.
        alloc.free(off, 8);
        assert!(!alloc.is_allocated_on_disk(off, 8));
        assert!(alloc.is_allocated(off, 8));
        assert_eq!(alloc.free_count(), 4088);

        alloc.cp_done();
        assert!(!alloc.is_allocated(off, 8));
        assert_eq!(alloc.free_count(), 4096);
    }

    #[test]
    fn test_alloc_contiguous_exhaustion() {
        let alloc = ChunkAllocator::new(ChunkId::new(1), 64);
        for _ in 0..8 {
            alloc.alloc_contiguous(8).unwrap();
        }
        assert!(alloc.alloc_contiguous(1).is_none());
        assert_eq!(alloc.free_count(), 0);
    }

    #[test]
    fn test_reserve_is_idempotent_but_checked() {
        let alloc = ChunkAllocator::new(ChunkId::new(2), 128);
        alloc.reserve(10, 4).unwrap();
        assert!(alloc.is_allocated(10, 4));
        assert!(alloc.is_allocated_on_disk(10, 4));
        let free_after_first = alloc.free_count();

        // Replaying the same reservation changes nothing.
        alloc.reserve(10, 4).unwrap();
        assert_eq!(alloc.free_count(), free_after_first);

        // Out-of-range reservations surface the real status.
        assert!(alloc.reserve(126, 4).is_err());
    }

    #[test]
    fn test_snapshot_restore_roundtrip() {
        let alloc = ChunkAllocator::new(ChunkId::new(3), 2048);
        let a = alloc.alloc_contiguous(16).unwrap();
        let b = alloc.alloc_contiguous(4).unwrap();
        alloc.commit(a, 16);
        alloc.commit(b, 4);

        let snap = alloc.snapshot_disk();
        let restored = ChunkAllocator::restore(ChunkId::new(3), 2048, &snap);
        assert!(restored.is_allocated(a, 16));
        assert!(restored.is_allocated(b, 4));
        assert_eq!(restored.free_count(), 2048 - 20);
    }

    #[test]
    fn test_disk_bitmap_equals_cache_after_cp() {
        // Allocator consistency after a checkpoint: committed cache state
        // and the persisted disk state agree.
        let alloc = ChunkAllocator::new(ChunkId::new(4), 1024);
        let a = alloc.alloc_contiguous(32).unwrap();
        alloc.commit(a, 32);
        let b = alloc.alloc_contiguous(8).unwrap();
        alloc.commit(b, 8);
        alloc.free(a, 32);
        alloc.cp_done();

        let snap = alloc.snapshot_disk();
        let restored = ChunkAllocator::restore(ChunkId::new(4), 1024, &snap);
        for bit in 0..1024u32 {
            assert_eq!(
                restored.is_allocated(bit, 1),
                alloc.is_allocated(bit, 1),
                "bit {bit} differs between disk and cache views"
            );
        }
    }
}
