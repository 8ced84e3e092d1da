//! Virtual device.
//!
//! A vdev stripes fixed-size chunks round-robin across the pdevs and
//! optionally keeps N mirror chunks per primary (each mirror on the next
//! pdev in rotation). Two access modes:
//!
//! * **Block-addressed**: `write_block`/`read_block` resolve a `BlockId`
//!   to a chunk-relative offset. Writes fan out to every mirror; reads
//!   come from the primary with mirror fallback on error.
//! * **Append-log**: `reserve` hands out logical offsets that never cross
//!   a chunk boundary (closing the current chunk and recording its
//!   end-of-data when they would), `write_at` consumes reserved space,
//!   reads truncate at the recorded chunk end, and `truncate` advances
//!   the durable `data_start_offset`.
//!
//! Logical append-log offsets live in `[0, size)` and wrap.

use crate::dm::DeviceManager;
use crate::pdev::PhysicalDev;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use volstore_common::types::{
    round_up, ChunkId, PdevId, VdevId, BLOCKS_PER_PORTION, SEGMENTS_PER_CHUNK,
};
use volstore_common::{Error, Result};

/// Fired once per run when used space crosses the watermark; re-armed by truncate
pub type HighWatermarkCb = Box<dyn Fn(u8) + Send + Sync>;

/// Cached placement of one chunk
struct ChunkSlot {
    chunk_id: ChunkId,
    pdev_id: PdevId,
    start_offset: u64,
    /// Bytes of valid data when the chunk was closed by the append path
    end_of_chunk: AtomicU64,
}

struct MirrorSlot {
    pdev_id: PdevId,
    start_offset: u64,
}

struct LogCursor {
    seek: u64,
    reserved: u64,
}

/// A striped, optionally mirrored logical device over chunks
pub struct VirtualDev {
    dm: Arc<DeviceManager>,
    vdev_id: VdevId,
    name: String,
    page_size: u32,
    chunk_size: u64,
    size: u64,
    mirror_count: u32,
    failed: AtomicBool,

    /// Primary chunks in stripe (logical) order
    slots: Vec<ChunkSlot>,
    /// Primary chunk ids grouped per pdev, for allocator hints
    pdev_groups: Vec<(PdevId, Vec<ChunkId>)>,
    /// chunk id -> index in `slots`
    slot_index: HashMap<ChunkId, usize>,
    mirrors: HashMap<ChunkId, Vec<MirrorSlot>>,

    data_start: AtomicU64,
    write_sz: AtomicU64,
    cursor: Mutex<LogCursor>,
    hwm_percent: u8,
    hwm_cb: Mutex<Option<HighWatermarkCb>>,
    hwm_fired: AtomicBool,
}

impl VirtualDev {
    /// Smallest chunk the geometry permits
    fn min_chunk_size(dm: &DeviceManager) -> u64 {
        u64::from(dm.layout().phys_page_size) * BLOCKS_PER_PORTION * SEGMENTS_PER_CHUNK
    }

    /// Largest chunk a block id page offset can address
    fn max_chunk_size(dm: &DeviceManager, page_size: u32) -> u64 {
        volstore_common::types::round_down(
            u64::from(u32::MAX) * u64::from(page_size),
            Self::min_chunk_size(dm),
        )
    }

    /// Create a new vdev of roughly `size` bytes (rounded up to the chunk
    /// grid), striped across every pdev when `stripe` is set.
    pub fn create(
        dm: Arc<DeviceManager>,
        name: &str,
        size: u64,
        mirror_count: u32,
        page_size: u32,
        stripe: bool,
        context: &[u8],
        hwm_percent: u8,
    ) -> Result<Arc<Self>> {
        let pdev_ids = dm.pdev_ids();
        if mirror_count as usize >= pdev_ids.len() {
            return Err(Error::Config(format!(
                "{mirror_count} mirrors need more than {} pdevs",
                pdev_ids.len()
            )));
        }

        let min_chunk = Self::min_chunk_size(&dm);
        let max_chunk = Self::max_chunk_size(&dm, page_size);
        let (mut num_chunks, mut chunk_size);
        if stripe {
            num_chunks = pdev_ids.len() as u64;
            chunk_size = size.div_ceil(num_chunks);
            let mut cnt = 2u64;
            while chunk_size > max_chunk {
                num_chunks = cnt * pdev_ids.len() as u64;
                chunk_size = size.div_ceil(num_chunks);
                cnt += 1;
            }
        } else {
            num_chunks = 1;
            chunk_size = size;
        }
        if chunk_size % min_chunk != 0 {
            chunk_size = round_up(chunk_size, min_chunk);
            info!(name, chunk_size, "chunk size rounded up to the chunk grid");
        }
        if chunk_size > max_chunk {
            return Err(Error::InvalidChunkSize(chunk_size));
        }
        let total = chunk_size * num_chunks;

        let vdev_id = dm.alloc_vdev(total, mirror_count, page_size, num_chunks as u32, context)?;

        let mut slots = Vec::with_capacity(num_chunks as usize);
        let mut mirrors: HashMap<ChunkId, Vec<MirrorSlot>> = HashMap::new();
        for i in 0..num_chunks as usize {
            let pdev_id = pdev_ids[i % pdev_ids.len()];
            let cid = dm.alloc_chunk(pdev_id, vdev_id, chunk_size, ChunkId::INVALID)?;
            let desc = dm
                .chunk(cid)
                .ok_or_else(|| Error::io_error("freshly allocated chunk missing"))?;
            slots.push(ChunkSlot {
                chunk_id: cid,
                pdev_id,
                start_offset: desc.start_offset,
                end_of_chunk: AtomicU64::new(chunk_size),
            });

            let mut mvec = Vec::with_capacity(mirror_count as usize);
            let mut next = i % pdev_ids.len();
            for _ in 0..mirror_count {
                next = (next + 1) % pdev_ids.len();
                let mcid = dm.alloc_chunk(pdev_ids[next], vdev_id, chunk_size, cid)?;
                let mdesc = dm
                    .chunk(mcid)
                    .ok_or_else(|| Error::io_error("freshly allocated mirror chunk missing"))?;
                mvec.push(MirrorSlot {
                    pdev_id: pdev_ids[next],
                    start_offset: mdesc.start_offset,
                });
            }
            if mirror_count > 0 {
                mirrors.insert(cid, mvec);
            }
        }

        info!(name, vdev = %vdev_id, num_chunks, chunk_size, "created vdev");
        Ok(Arc::new(Self::from_slots(
            dm,
            vdev_id,
            name,
            page_size,
            chunk_size,
            total,
            mirror_count,
            false,
            0,
            slots,
            mirrors,
            hwm_percent,
        )))
    }

    /// Reload a vdev from its persisted descriptor and chunk table
    pub fn load(dm: Arc<DeviceManager>, vdev_id: VdevId, name: &str, hwm_percent: u8) -> Result<Arc<Self>> {
        let desc = dm
            .vdev(vdev_id)
            .ok_or_else(|| Error::io_error(format!("vdev {vdev_id} not in the directory")))?;
        let chunks = dm.chunks_of_vdev(vdev_id);
        let primaries: Vec<_> = chunks.iter().filter(|c| !c.primary_id.is_valid()).collect();
        if primaries.is_empty() {
            return Err(Error::io_error(format!("vdev {vdev_id} has no chunks")));
        }
        let chunk_size = primaries[0].size;
        if desc.size != chunk_size * primaries.len() as u64 {
            return Err(Error::io_error(format!(
                "vdev {vdev_id} size does not match its chunks"
            )));
        }

        // Rebuild stripe order: chunk i went to pdev i % n, in per-pdev
        // offset order.
        let pdev_ids = dm.pdev_ids();
        let mut per_pdev: HashMap<PdevId, Vec<&crate::chunk::ChunkDescriptor>> = HashMap::new();
        for c in &primaries {
            per_pdev.entry(c.pdev_id).or_default().push(*c);
        }
        for list in per_pdev.values_mut() {
            list.sort_by_key(|c| c.start_offset);
        }
        let n = pdev_ids.len();
        let mut slots = Vec::with_capacity(primaries.len());
        for i in 0..primaries.len() {
            let pdev_id = pdev_ids[i % n];
            let c = per_pdev
                .get(&pdev_id)
                .and_then(|list| list.get(i / n))
                .ok_or_else(|| Error::io_error(format!("vdev {vdev_id} stripe order broken")))?;
            slots.push(ChunkSlot {
                chunk_id: c.chunk_id,
                pdev_id: c.pdev_id,
                start_offset: c.start_offset,
                end_of_chunk: AtomicU64::new(c.end_of_chunk_offset),
            });
        }

        let mut mirrors: HashMap<ChunkId, Vec<MirrorSlot>> = HashMap::new();
        for c in chunks.iter().filter(|c| c.primary_id.is_valid()) {
            mirrors.entry(c.primary_id).or_default().push(MirrorSlot {
                pdev_id: c.pdev_id,
                start_offset: c.start_offset,
            });
        }

        debug!(name, vdev = %vdev_id, chunks = slots.len(), "loaded vdev");
        Ok(Arc::new(Self::from_slots(
            dm,
            vdev_id,
            name,
            desc.page_size,
            chunk_size,
            desc.size,
            desc.mirror_count,
            desc.failed,
            desc.data_start_offset,
            slots,
            mirrors,
            hwm_percent,
        )))
    }

    #[allow(clippy::too_many_arguments)]
    fn from_slots(
        dm: Arc<DeviceManager>,
        vdev_id: VdevId,
        name: &str,
        page_size: u32,
        chunk_size: u64,
        size: u64,
        mirror_count: u32,
        failed: bool,
        data_start: u64,
        slots: Vec<ChunkSlot>,
        mirrors: HashMap<ChunkId, Vec<MirrorSlot>>,
        hwm_percent: u8,
    ) -> Self {
        let mut pdev_groups: Vec<(PdevId, Vec<ChunkId>)> = Vec::new();
        let mut slot_index = HashMap::new();
        for (i, s) in slots.iter().enumerate() {
            slot_index.insert(s.chunk_id, i);
            match pdev_groups.iter_mut().find(|(p, _)| *p == s.pdev_id) {
                Some((_, list)) => list.push(s.chunk_id),
                None => pdev_groups.push((s.pdev_id, vec![s.chunk_id])),
            }
        }
        Self {
            dm,
            vdev_id,
            name: name.to_string(),
            page_size,
            chunk_size,
            size,
            mirror_count,
            failed: AtomicBool::new(failed),
            slots,
            pdev_groups,
            slot_index,
            mirrors,
            data_start: AtomicU64::new(data_start),
            write_sz: AtomicU64::new(0),
            cursor: Mutex::new(LogCursor { seek: 0, reserved: 0 }),
            hwm_percent,
            hwm_cb: Mutex::new(None),
            hwm_fired: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn vdev_id(&self) -> VdevId {
        self.vdev_id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    #[must_use]
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn mirror_count(&self) -> u32 {
        self.mirror_count
    }

    #[must_use]
    pub fn num_chunks(&self) -> usize {
        self.slots.len()
    }

    /// Primary chunk ids in stripe order
    #[must_use]
    pub fn primary_chunk_ids(&self) -> Vec<ChunkId> {
        self.slots.iter().map(|s| s.chunk_id).collect()
    }

    /// Primary chunk ids grouped per pdev, for allocation hints
    #[must_use]
    pub fn pdev_chunk_groups(&self) -> Vec<(PdevId, Vec<ChunkId>)> {
        self.pdev_groups.clone()
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Mark this vdev failed in memory and in the directory
    pub fn set_failed(&self) -> Result<()> {
        self.failed.store(true, Ordering::Release);
        self.dm.mark_vdev_failed(self.vdev_id)
    }

    /// Clear the failed state once data has been reconstructed
    pub fn reset_failed_state(&self) -> Result<()> {
        self.failed.store(false, Ordering::Release);
        self.dm.reset_vdev_failed(self.vdev_id)
    }

    pub fn set_high_watermark_cb(&self, cb: impl Fn(u8) + Send + Sync + 'static) {
        *self.hwm_cb.lock() = Some(Box::new(cb));
    }

    /// Persist a subsystem blob into the vdev descriptor's context area
    pub fn update_context(&self, blob: &[u8]) -> Result<()> {
        self.dm.update_vdev_context(self.vdev_id, blob)
    }

    #[must_use]
    pub fn context(&self) -> Vec<u8> {
        self.dm.vdev_context(self.vdev_id)
    }

    /// Flush every pdev this vdev touches
    pub fn sync(&self) -> Result<()> {
        for (pdev_id, _) in &self.pdev_groups {
            self.dm.pdev(*pdev_id)?.sync()?;
        }
        Ok(())
    }

    fn check_failed(&self) -> Result<()> {
        if self.is_failed() {
            return Err(Error::io_error(format!("vdev {} is failed", self.vdev_id)));
        }
        Ok(())
    }

    fn slot_of(&self, chunk_id: ChunkId) -> Result<&ChunkSlot> {
        self.slot_index
            .get(&chunk_id)
            .map(|&i| &self.slots[i])
            .ok_or_else(|| {
                Error::io_error(format!("chunk {chunk_id} not part of vdev {}", self.vdev_id))
            })
    }

    // ---- block-addressed mode ---------------------------------------

    /// Write `data` at the location a block id names, fanning out to
    /// every mirror chunk.
    pub fn write_block(&self, bid: volstore_common::BlockId, data: &[u8]) -> Result<()> {
        self.check_failed()?;
        if data.len() as u64 > bid.data_size(self.page_size) {
            return Err(Error::io_error("write larger than the block unit"));
        }
        let slot = self.slot_of(bid.chunk_id())?;
        let in_chunk = u64::from(bid.offset()) * u64::from(self.page_size);

        self.write_chunk_local(slot.chunk_id, slot.pdev_id, slot.start_offset, in_chunk, data)
    }

    fn write_chunk_local(
        &self,
        chunk_id: ChunkId,
        pdev_id: PdevId,
        start_offset: u64,
        in_chunk: u64,
        data: &[u8],
    ) -> Result<()> {
        let pdev = self.dm.pdev(pdev_id)?;
        if let Err(e) = pdev.write_at(start_offset + in_chunk, data) {
            self.dm.handle_io_error(pdev_id);
            return Err(e);
        }
        if let Some(mirrors) = self.mirrors.get(&chunk_id) {
            for m in mirrors {
                let mdev = self.dm.pdev(m.pdev_id)?;
                if let Err(e) = mdev.write_at(m.start_offset + in_chunk, data) {
                    self.dm.handle_io_error(m.pdev_id);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Read the block a block id names. The primary chunk serves the
    /// read; on error each mirror is tried in turn.
    pub fn read_block(&self, bid: volstore_common::BlockId, buf: &mut [u8]) -> Result<()> {
        self.check_failed()?;
        let copies = self.num_copies();
        let mut last_err = None;
        for copy in 0..copies {
            match self.read_block_copy(bid, copy, buf) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(vdev = %self.vdev_id, ?bid, copy, "block read failed: {e}");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::io_error("block read failed")))
    }

    /// Number of stored copies of each block (primary plus mirrors)
    #[must_use]
    pub fn num_copies(&self) -> u32 {
        self.mirror_count + 1
    }

    /// Read one specific copy of a block: copy 0 is the primary, higher
    /// indices are mirrors. The caller uses this to retry a checksum
    /// failure against other copies.
    pub fn read_block_copy(
        &self,
        bid: volstore_common::BlockId,
        copy: u32,
        buf: &mut [u8],
    ) -> Result<()> {
        self.check_failed()?;
        let slot = self.slot_of(bid.chunk_id())?;
        let in_chunk = u64::from(bid.offset()) * u64::from(self.page_size);

        let (pdev_id, start) = if copy == 0 {
            (slot.pdev_id, slot.start_offset)
        } else {
            let m = self
                .mirrors
                .get(&slot.chunk_id)
                .and_then(|v| v.get(copy as usize - 1))
                .ok_or(Error::NotFound)?;
            (m.pdev_id, m.start_offset)
        };
        let pdev = self.dm.pdev(pdev_id)?;
        pdev.read_at(start + in_chunk, buf).inspect_err(|_| {
            self.dm.handle_io_error(pdev_id);
        })
    }

    // ---- append-log mode --------------------------------------------

    fn logical_to_slot(&self, offset: u64) -> (usize, u64) {
        debug_assert!(offset < self.size);
        ((offset / self.chunk_size) as usize, offset % self.chunk_size)
    }

    /// The durable start-of-data position
    #[must_use]
    pub fn data_start_offset(&self) -> u64 {
        self.data_start.load(Ordering::Acquire)
    }

    /// Bytes written plus chunk-tail waste (excludes reservations)
    #[must_use]
    pub fn write_bytes_total(&self) -> u64 {
        self.write_sz.load(Ordering::Acquire)
    }

    fn tail_locked(&self, cursor: &LogCursor) -> u64 {
        let mut tail =
            self.data_start.load(Ordering::Acquire) + self.write_sz.load(Ordering::Acquire)
                + cursor.reserved;
        if tail >= self.size {
            tail -= self.size;
        }
        tail
    }

    /// Logical tail (start + written + reserved, wrapped)
    #[must_use]
    pub fn tail_offset(&self) -> u64 {
        let cursor = self.cursor.lock();
        self.tail_locked(&cursor)
    }

    #[must_use]
    pub fn used_space(&self) -> u64 {
        self.write_sz.load(Ordering::Acquire) + self.cursor.lock().reserved
    }

    #[must_use]
    pub fn free_space(&self) -> u64 {
        self.size - self.used_space()
    }

    /// Reserve `size` bytes of append space and return their logical
    /// offset. Never returns an offset whose span crosses a chunk
    /// boundary: the current chunk is closed out (recording its end of
    /// data) and the cursor rolls to the next chunk in the stripe.
    pub fn reserve(&self, size: u64) -> Result<u64> {
        self.check_failed()?;
        let mut cursor = self.cursor.lock();

        if self.write_sz.load(Ordering::Acquire) + cursor.reserved + size > self.size {
            return Err(Error::no_space(format!(
                "append vdev {} full: {} used of {}",
                self.vdev_id,
                self.write_sz.load(Ordering::Acquire) + cursor.reserved,
                self.size
            )));
        }

        let tail = self.tail_locked(&cursor);
        let (idx, in_chunk) = self.logical_to_slot(tail);

        if in_chunk + size <= self.chunk_size {
            // Not crossing a boundary, nothing to do.
        } else if self.write_sz.load(Ordering::Acquire)
            + cursor.reserved
            + (self.chunk_size - in_chunk)
            + size
            <= self.size
        {
            // Close the current chunk at its used length and pay the tail
            // as write overhead.
            let waste = self.chunk_size - in_chunk;
            self.write_sz.fetch_add(waste, Ordering::AcqRel);

            let cur = &self.slots[idx];
            cur.end_of_chunk.store(in_chunk, Ordering::Release);
            self.dm.update_end_of_chunk(cur.chunk_id, in_chunk)?;

            // The next chunk is reused from its beginning.
            let next = &self.slots[(idx + 1) % self.slots.len()];
            next.end_of_chunk.store(self.chunk_size, Ordering::Release);
            self.dm.update_end_of_chunk(next.chunk_id, self.chunk_size)?;
        } else {
            return Err(Error::no_space(format!(
                "append vdev {}: tail roll would exceed capacity",
                self.vdev_id
            )));
        }

        let offset = self.tail_locked(&cursor);
        cursor.reserved += size;

        self.high_watermark_check(&cursor);
        Ok(offset)
    }

    /// Write into previously reserved space. The span must stay within
    /// one chunk, which `reserve` guarantees.
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.check_failed()?;
        let mut cursor = self.cursor.lock();
        if buf.len() as u64 > cursor.reserved {
            return Err(Error::io_error(format!(
                "write of {} bytes exceeds the {} reserved",
                buf.len(),
                cursor.reserved
            )));
        }
        cursor.reserved -= buf.len() as u64;
        drop(cursor);

        let (idx, in_chunk) = self.logical_to_slot(offset);
        if in_chunk + buf.len() as u64 > self.chunk_size {
            return Err(Error::io_error("append write crosses a chunk boundary"));
        }
        let slot = &self.slots[idx];
        self.write_chunk_local(slot.chunk_id, slot.pdev_id, slot.start_offset, in_chunk, buf)?;
        self.write_sz.fetch_add(buf.len() as u64, Ordering::AcqRel);
        Ok(())
    }

    /// Gather-write into previously reserved space
    pub fn writev_at(&self, offset: u64, bufs: &[&[u8]]) -> Result<()> {
        let mut off = offset;
        for buf in bufs {
            self.write_at(off, buf)?;
            off += buf.len() as u64;
        }
        Ok(())
    }

    /// Read at a logical offset. The read truncates at the chunk's end
    /// of data; the returned count may be less than `buf.len()`.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.check_failed()?;
        let (idx, in_chunk) = self.logical_to_slot(offset);
        let slot = &self.slots[idx];
        let eoc = slot
            .end_of_chunk
            .load(Ordering::Acquire)
            .min(self.chunk_size);
        if in_chunk >= eoc {
            return Ok(0);
        }
        let count = (buf.len() as u64).min(eoc - in_chunk) as usize;
        let pdev = self.dm.pdev(slot.pdev_id)?;
        pdev.read_at(slot.start_offset + in_chunk, &mut buf[..count])
            .inspect_err(|_| self.dm.handle_io_error(slot.pdev_id))?;
        Ok(count)
    }

    /// Read at the seek cursor, advancing it. When the read stops at a
    /// closed chunk's end of data the cursor also skips the dead tail,
    /// so the next call continues in the following chunk.
    pub fn read_from_cursor(&self, buf: &mut [u8]) -> Result<usize> {
        self.check_failed()?;
        let mut cursor = self.cursor.lock();
        loop {
            let (idx, in_chunk) = self.logical_to_slot(cursor.seek);
            let slot = &self.slots[idx];
            let eoc = slot
                .end_of_chunk
                .load(Ordering::Acquire)
                .min(self.chunk_size);
            if in_chunk >= eoc {
                // Sitting in a closed chunk's tail: hop to the next chunk.
                if eoc == self.chunk_size {
                    return Ok(0);
                }
                cursor.seek = (cursor.seek + (self.chunk_size - in_chunk)) % self.size;
                continue;
            }
            let count = (buf.len() as u64).min(eoc - in_chunk) as usize;
            let pdev = self.dm.pdev(slot.pdev_id)?;
            pdev.read_at(slot.start_offset + in_chunk, &mut buf[..count])
                .inspect_err(|_| self.dm.handle_io_error(slot.pdev_id))?;
            cursor.seek += count as u64;
            // Skip the tail when this read consumed the chunk's data.
            if in_chunk + count as u64 == eoc && eoc < self.chunk_size {
                cursor.seek += self.chunk_size - eoc;
            }
            cursor.seek %= self.size;
            return Ok(count);
        }
    }

    /// Position the seek cursor
    pub fn seek(&self, offset: u64) {
        self.cursor.lock().seek = offset % self.size;
    }

    #[must_use]
    pub fn seeked_pos(&self) -> u64 {
        self.cursor.lock().seek
    }

    /// Truncate the log: advance the durable `data_start_offset` to
    /// `new_start` (wrap-aware) and give the space back.
    pub fn truncate(&self, new_start: u64) -> Result<()> {
        let ds = self.data_start.load(Ordering::Acquire);
        let to_truncate = if new_start >= ds {
            new_start - ds
        } else {
            // Wrapped around into earlier chunks.
            self.size - (ds - new_start)
        };
        if to_truncate > self.write_sz.load(Ordering::Acquire) {
            return Err(Error::io_error(format!(
                "truncate past the written region of vdev {}",
                self.vdev_id
            )));
        }
        self.write_sz.fetch_sub(to_truncate, Ordering::AcqRel);
        self.data_start.store(new_start, Ordering::Release);
        self.dm.update_data_start_offset(self.vdev_id, new_start)?;
        self.hwm_fired.store(false, Ordering::Release);
        debug!(vdev = %self.vdev_id, new_start, freed = to_truncate, "truncated append log");
        Ok(())
    }

    /// Rebuild the in-memory write counter after recovery has scanned the
    /// log and found its real tail.
    pub fn update_tail_offset(&self, tail: u64) {
        let ds = self.data_start.load(Ordering::Acquire);
        let sz = if tail >= ds {
            tail - ds
        } else {
            self.size - ds + tail
        };
        self.write_sz.store(sz, Ordering::Release);
    }

    fn high_watermark_check(&self, cursor: &LogCursor) {
        let used = self.write_sz.load(Ordering::Acquire) + cursor.reserved;
        let pct = (used * 100 / self.size) as u8;
        if pct >= self.hwm_percent
            && !self.hwm_fired.swap(true, Ordering::AcqRel)
        {
            if let Some(cb) = self.hwm_cb.lock().as_ref() {
                info!(vdev = %self.vdev_id, pct, "append log crossed its high watermark");
                cb(pct);
            }
        }
    }

    /// End of valid data recorded for a chunk of this vdev
    #[must_use]
    pub fn end_of_chunk(&self, chunk_id: ChunkId) -> Option<u64> {
        self.slot_index
            .get(&chunk_id)
            .map(|&i| self.slots[i].end_of_chunk.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dm::DmConfig;
    use std::path::PathBuf;
    use tempfile::TempDir;
    use uuid::Uuid;
    use volstore_common::{BlockId, OpenMode};

    const DEV_SIZE: u64 = 512 << 20;
    const MIN_CHUNK: u64 = 32 << 20;

    fn setup(n: usize) -> (TempDir, Arc<DeviceManager>) {
        let dir = TempDir::new().unwrap();
        let devices: Vec<PathBuf> = (0..n)
            .map(|i| {
                let path = dir.path().join(format!("pdev{i}"));
                std::fs::File::create(&path).unwrap().set_len(DEV_SIZE).unwrap();
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
        (dir, dm)
    }

    #[test]
    fn test_create_striped_vdev() {
        let (_dir, dm) = setup(2);
        let vdev =
            VirtualDev::create(dm.clone(), "data", 2 * MIN_CHUNK, 0, 4096, true, &[], 80).unwrap();

        assert_eq!(vdev.num_chunks(), 2);
        assert_eq!(vdev.chunk_size(), MIN_CHUNK);
        // One chunk per pdev.
        let groups = vdev.pdev_chunk_groups();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].1.len(), 1);
        assert_eq!(groups[1].1.len(), 1);
    }

    #[test]
    fn test_block_write_read_roundtrip() {
        let (_dir, dm) = setup(2);
        let vdev =
            VirtualDev::create(dm.clone(), "data", 2 * MIN_CHUNK, 0, 4096, true, &[], 80).unwrap();

        let cid = vdev.primary_chunk_ids()[0];
        let bid = BlockId::new(cid, 2, 16);
        let data = vec![0xABu8; 2 * 4096];
        vdev.write_block(bid, &data).unwrap();

        let mut out = vec![0u8; 2 * 4096];
        vdev.read_block(bid, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_mirror_copies_readable() {
        let (_dir, dm) = setup(2);
        let vdev =
            VirtualDev::create(dm.clone(), "data", 2 * MIN_CHUNK, 1, 4096, true, &[], 80).unwrap();
        assert_eq!(vdev.num_copies(), 2);

        let cid = vdev.primary_chunk_ids()[0];
        let bid = BlockId::new(cid, 1, 0);
        let data = vec![0x5Au8; 4096];
        vdev.write_block(bid, &data).unwrap();

        let mut primary = vec![0u8; 4096];
        let mut mirror = vec![0u8; 4096];
        vdev.read_block_copy(bid, 0, &mut primary).unwrap();
        vdev.read_block_copy(bid, 1, &mut mirror).unwrap();
        assert_eq!(primary, data);
        assert_eq!(mirror, data);
    }

    #[test]
    fn test_append_reserve_write_read() {
        let (_dir, dm) = setup(2);
        let vdev =
            VirtualDev::create(dm.clone(), "log", 2 * MIN_CHUNK, 0, 4096, true, &[], 80).unwrap();

        let off = vdev.reserve(8192).unwrap();
        assert_eq!(off, 0);
        vdev.write_at(off, &vec![0x11u8; 8192]).unwrap();

        let off2 = vdev.reserve(4096).unwrap();
        assert_eq!(off2, 8192);
        vdev.write_at(off2, &vec![0x22u8; 4096]).unwrap();

        let mut buf = vec![0u8; 4096];
        let n = vdev.read_at(8192, &mut buf).unwrap();
        assert_eq!(n, 4096);
        assert_eq!(buf, vec![0x22u8; 4096]);
        assert_eq!(vdev.used_space(), 12288);
    }

    #[test]
    fn test_append_chunk_boundary_close_out() {
        let (_dir, dm) = setup(2);
        let vdev =
            VirtualDev::create(dm.clone(), "log", 2 * MIN_CHUNK, 0, 4096, true, &[], 95).unwrap();
        let chunk = vdev.chunk_size();

        // Fill most of chunk 0, then reserve past its end.
        let first = chunk - 4096;
        let off = vdev.reserve(first).unwrap();
        vdev.write_at(off, &vec![0x33u8; first as usize]).unwrap();

        let off2 = vdev.reserve(8192).unwrap();
        // The reservation rolled to chunk 1.
        assert_eq!(off2, chunk);
        vdev.write_at(off2, &vec![0x44u8; 8192]).unwrap();

        // Chunk 0 was closed at its used length.
        let cid0 = vdev.primary_chunk_ids()[0];
        assert_eq!(vdev.end_of_chunk(cid0), Some(first));
        // The wasted tail counts as used space.
        assert_eq!(vdev.used_space(), chunk + 8192);

        // A read at the tail returns end-of-chunk.
        let mut buf = vec![0u8; 4096];
        let n = vdev.read_at(first, &mut buf).unwrap();
        assert_eq!(n, 0);

        // Cursor reads skip the tail and land in chunk 1.
        vdev.seek(first);
        let n = vdev.read_from_cursor(&mut buf).unwrap();
        assert_eq!(n, 4096);
        assert_eq!(buf, vec![0x44u8; 4096]);
    }

    #[test]
    fn test_truncate_and_idempotence() {
        let (_dir, dm) = setup(2);
        let vdev =
            VirtualDev::create(dm.clone(), "log", 2 * MIN_CHUNK, 0, 4096, true, &[], 80).unwrap();

        let off = vdev.reserve(16384).unwrap();
        vdev.write_at(off, &vec![0x55u8; 16384]).unwrap();
        assert_eq!(vdev.write_bytes_total(), 16384);

        vdev.truncate(8192).unwrap();
        assert_eq!(vdev.data_start_offset(), 8192);
        assert_eq!(vdev.write_bytes_total(), 8192);

        // Truncating to the same point again changes nothing.
        vdev.truncate(8192).unwrap();
        assert_eq!(vdev.data_start_offset(), 8192);
        assert_eq!(vdev.write_bytes_total(), 8192);

        // The durable offset survives a reload.
        let reloaded = VirtualDev::load(dm.clone(), vdev.vdev_id(), "log", 80).unwrap();
        assert_eq!(reloaded.data_start_offset(), 8192);
    }

    #[test]
    fn test_high_watermark_fires_once_and_rearms() {
        let (_dir, dm) = setup(2);
        let vdev =
            VirtualDev::create(dm.clone(), "log", 2 * MIN_CHUNK, 0, 4096, true, &[], 80).unwrap();
        let fired = Arc::new(AtomicU64::new(0));
        let fired2 = fired.clone();
        vdev.set_high_watermark_cb(move |_| {
            fired2.fetch_add(1, Ordering::Relaxed);
        });

        let step = vdev.size() / 10;
        let mut reserved = Vec::new();
        for _ in 0..9 {
            reserved.push(vdev.reserve(step).unwrap());
        }
        assert_eq!(fired.load(Ordering::Relaxed), 1, "fires exactly once per run");

        // Consume a reservation, truncate, and confirm the callback
        // re-arms.
        vdev.write_at(reserved[0], &vec![0u8; 4096]).unwrap();
        // Give back everything reserved by writing nothing further and
        // resetting the counters through truncate.
        vdev.truncate(vdev.data_start_offset()).unwrap();
        assert!(!vdev.hwm_fired.load(Ordering::Relaxed));
    }

    #[test]
    fn test_update_tail_offset_rebuilds_counter() {
        let (_dir, dm) = setup(2);
        let vdev =
            VirtualDev::create(dm.clone(), "log", 2 * MIN_CHUNK, 0, 4096, true, &[], 80).unwrap();

        vdev.update_tail_offset(40960);
        assert_eq!(vdev.write_bytes_total(), 40960);
        assert_eq!(vdev.tail_offset(), 40960);
    }

    #[test]
    fn test_failed_vdev_rejects_io() {
        let (_dir, dm) = setup(2);
        let vdev =
            VirtualDev::create(dm.clone(), "data", 2 * MIN_CHUNK, 0, 4096, true, &[], 80).unwrap();
        vdev.set_failed().unwrap();

        let cid = vdev.primary_chunk_ids()[0];
        let bid = BlockId::new(cid, 1, 0);
        assert!(vdev.write_block(bid, &[0u8; 4096]).is_err());
        let mut buf = [0u8; 4096];
        assert!(vdev.read_block(bid, &mut buf).is_err());

        vdev.reset_failed_state().unwrap();
        assert!(vdev.write_block(bid, &[0u8; 4096]).is_ok());
    }
}
