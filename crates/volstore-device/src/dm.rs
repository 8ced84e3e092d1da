//! Device manager.
//!
//! Owns the pdev set, the chunk table and the vdev descriptors, and
//! persists the combined DM-info block to every pdev under a generation
//! counter and CRC16. On boot it recovers the highest-generation valid
//! copy, adopts spares for missing devices, and rewrites lower-generation
//! devices.
//!
//! DM-info layout:
//!
//! ```text
//! | magic u64 | crc16 | version u32 | size u64 |   <- crc covers from version on
//! | num_pdevs | num_chunks | num_vdevs | first_vdev_id |
//! | pdev table (MAX_PDEVS x 24) |
//! | chunk table (MAX_CHUNKS x 64) |
//! | vdev table (MAX_VDEVS x 4096) |
//! ```

use crate::chunk::ChunkDescriptor;
use crate::pdev::PhysicalDev;
use crate::superblock::DeviceLayout;
use bytes::{Buf, BufMut};
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use volstore_common::checksum::crc16_t10dif;
use volstore_common::types::{
    round_up, ChunkId, PdevId, VdevId, FORMAT_VERSION, MAGIC, MAX_CHUNKS, MAX_PDEVS, MAX_VDEVS,
    VDEV_CONTEXT_DATA_SIZE, VDEV_INFO_BLOCK_SIZE, VDEV_INFO_HEADER_SIZE,
};
use volstore_common::{Error, OpenMode, Result};

const DM_HEADER_SIZE: usize = 8 + 2 + 4 + 8;
const DM_COUNTS_SIZE: usize = 16;
const PDEV_INFO_SIZE: usize = 24;
/// CRC16 covers the payload starting here (after magic + checksum)
const DM_PAYLOAD_OFFSET: usize = 10;

/// Raw (unrounded) size of one DM-info copy
#[must_use]
pub fn dm_info_raw_size() -> u64 {
    (DM_HEADER_SIZE
        + DM_COUNTS_SIZE
        + MAX_PDEVS * PDEV_INFO_SIZE
        + MAX_CHUNKS * ChunkDescriptor::SIZE
        + MAX_VDEVS * VDEV_INFO_BLOCK_SIZE) as u64
}

/// One slot of the DM-info pdev table
#[derive(Debug, Clone)]
struct PdevInfo {
    dev_id: u32,
    dev_offset: u64,
    first_chunk_id: ChunkId,
    allocated: bool,
}

impl PdevInfo {
    fn empty() -> Self {
        Self {
            dev_id: u32::MAX,
            dev_offset: 0,
            first_chunk_id: ChunkId::INVALID,
            allocated: false,
        }
    }

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.dev_id);
        buf.put_u64_le(self.dev_offset);
        buf.put_u32_le(self.first_chunk_id.raw());
        buf.put_u8(u8::from(self.allocated));
        buf.put_bytes(0, 7);
    }

    fn decode(buf: &mut impl Buf) -> Self {
        let dev_id = buf.get_u32_le();
        let dev_offset = buf.get_u64_le();
        let first_chunk_id = ChunkId::new(buf.get_u32_le());
        let allocated = buf.get_u8() != 0;
        buf.advance(7);
        Self {
            dev_id,
            dev_offset,
            first_chunk_id,
            allocated,
        }
    }
}

/// One slot of the DM-info vdev table: a 512-byte header followed by
/// opaque context data owned by the subsystem using the vdev.
#[derive(Debug, Clone)]
pub struct VdevDescriptor {
    pub vdev_id: VdevId,
    pub size: u64,
    pub mirror_count: u32,
    pub page_size: u32,
    pub prev_id: VdevId,
    pub next_id: VdevId,
    pub allocated: bool,
    pub failed: bool,
    pub primary_chunk_count: u32,
    pub data_start_offset: u64,
    pub context_data: Vec<u8>,
}

impl VdevDescriptor {
    fn empty() -> Self {
        Self {
            vdev_id: VdevId::INVALID,
            size: 0,
            mirror_count: 0,
            page_size: 0,
            prev_id: VdevId::INVALID,
            next_id: VdevId::INVALID,
            allocated: false,
            failed: false,
            primary_chunk_count: 0,
            data_start_offset: 0,
            context_data: vec![0; VDEV_CONTEXT_DATA_SIZE],
        }
    }

    fn encode(&self, buf: &mut impl BufMut) {
        let header_used = 4 + 8 + 4 + 4 + 4 + 4 + 1 + 1 + 4 + 8;
        buf.put_u32_le(self.vdev_id.raw());
        buf.put_u64_le(self.size);
        buf.put_u32_le(self.mirror_count);
        buf.put_u32_le(self.page_size);
        buf.put_u32_le(self.prev_id.raw());
        buf.put_u32_le(self.next_id.raw());
        buf.put_u8(u8::from(self.allocated));
        buf.put_u8(u8::from(self.failed));
        buf.put_u32_le(self.primary_chunk_count);
        buf.put_u64_le(self.data_start_offset);
        buf.put_bytes(0, VDEV_INFO_HEADER_SIZE - header_used);
        debug_assert_eq!(self.context_data.len(), VDEV_CONTEXT_DATA_SIZE);
        buf.put_slice(&self.context_data);
    }

    fn decode(buf: &mut impl Buf) -> Self {
        let header_used = 4 + 8 + 4 + 4 + 4 + 4 + 1 + 1 + 4 + 8;
        let vdev_id = VdevId::new(buf.get_u32_le());
        let size = buf.get_u64_le();
        let mirror_count = buf.get_u32_le();
        let page_size = buf.get_u32_le();
        let prev_id = VdevId::new(buf.get_u32_le());
        let next_id = VdevId::new(buf.get_u32_le());
        let allocated = buf.get_u8() != 0;
        let failed = buf.get_u8() != 0;
        let primary_chunk_count = buf.get_u32_le();
        let data_start_offset = buf.get_u64_le();
        buf.advance(VDEV_INFO_HEADER_SIZE - header_used);
        let mut context_data = vec![0; VDEV_CONTEXT_DATA_SIZE];
        buf.copy_to_slice(&mut context_data);
        Self {
            vdev_id,
            size,
            mirror_count,
            page_size,
            prev_id,
            next_id,
            allocated,
            failed,
            primary_chunk_count,
            data_start_offset,
            context_data,
        }
    }
}

/// The three DM-info sub-tables plus their counts
struct DmTables {
    pdevs: Vec<PdevInfo>,
    num_pdevs: u32,
    chunks: Vec<ChunkDescriptor>,
    num_chunks: u32,
    vdevs: Vec<VdevDescriptor>,
    num_vdevs: u32,
    first_vdev_id: VdevId,
}

impl DmTables {
    fn new() -> Self {
        Self {
            pdevs: (0..MAX_PDEVS).map(|_| PdevInfo::empty()).collect(),
            num_pdevs: 0,
            chunks: (0..MAX_CHUNKS).map(|_| ChunkDescriptor::empty()).collect(),
            num_chunks: 0,
            vdevs: (0..MAX_VDEVS).map(|_| VdevDescriptor::empty()).collect(),
            num_vdevs: 0,
            first_vdev_id: VdevId::INVALID,
        }
    }

    fn serialize(&self, dm_info_size: u64) -> Vec<u8> {
        let mut buf = Vec::with_capacity(dm_info_raw_size() as usize);
        buf.put_u64_le(MAGIC);
        buf.put_u16_le(0); // checksum, patched below
        buf.put_u32_le(FORMAT_VERSION);
        buf.put_u64_le(dm_info_size);
        buf.put_u32_le(self.num_pdevs);
        buf.put_u32_le(self.num_chunks);
        buf.put_u32_le(self.num_vdevs);
        buf.put_u32_le(self.first_vdev_id.raw());
        for p in &self.pdevs {
            p.encode(&mut buf);
        }
        for c in &self.chunks {
            c.encode(&mut buf);
        }
        for v in &self.vdevs {
            v.encode(&mut buf);
        }
        let crc = crc16_t10dif(0, &buf[DM_PAYLOAD_OFFSET..]);
        buf[8..10].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    fn deserialize(data: &[u8], expected_size: u64) -> Result<Self> {
        if data.len() < dm_info_raw_size() as usize {
            return Err(Error::io_error("DM-info block truncated"));
        }
        let raw = &data[..dm_info_raw_size() as usize];

        let mut buf = raw;
        let magic = buf.get_u64_le();
        if magic != MAGIC {
            return Err(Error::io_error("DM-info magic mismatch"));
        }
        let checksum = buf.get_u16_le();
        let computed = crc16_t10dif(0, &raw[DM_PAYLOAD_OFFSET..]);
        if checksum != computed {
            return Err(Error::ChecksumMismatch {
                expected: u32::from(checksum),
                actual: u32::from(computed),
            });
        }
        let version = buf.get_u32_le();
        if version != FORMAT_VERSION {
            return Err(Error::io_error(format!("DM-info version {version} unsupported")));
        }
        let size = buf.get_u64_le();
        if size != expected_size {
            return Err(Error::io_error(format!(
                "DM-info size {size} does not match configured {expected_size}"
            )));
        }
        let num_pdevs = buf.get_u32_le();
        let num_chunks = buf.get_u32_le();
        let num_vdevs = buf.get_u32_le();
        let first_vdev_id = VdevId::new(buf.get_u32_le());

        let pdevs = (0..MAX_PDEVS).map(|_| PdevInfo::decode(&mut buf)).collect();
        let mut chunks = Vec::with_capacity(MAX_CHUNKS);
        for _ in 0..MAX_CHUNKS {
            chunks.push(ChunkDescriptor::decode(&mut buf)?);
        }
        let vdevs = (0..MAX_VDEVS).map(|_| VdevDescriptor::decode(&mut buf)).collect();

        Ok(Self {
            pdevs,
            num_pdevs,
            chunks,
            num_chunks,
            vdevs,
            num_vdevs,
            first_vdev_id,
        })
    }
}

struct DmState {
    tables: DmTables,
    gen: u64,
    last_vdev_id: VdevId,
    scan_complete: bool,
}

/// Device manager configuration
#[derive(Debug, Clone)]
pub struct DmConfig {
    pub open_mode: OpenMode,
    pub phys_page_size: u32,
    pub atomic_page_size: u32,
    pub system_uuid: Uuid,
    pub max_error_before_marking_dev_down: u64,
}

type VdevErrorCb = Box<dyn Fn(VdevId) + Send + Sync>;

/// Owner of all pdevs, the chunk table and the vdev descriptors
pub struct DeviceManager {
    cfg: DmConfig,
    layout: DeviceLayout,
    state: Mutex<DmState>,
    pdevs: RwLock<Vec<Option<Arc<PhysicalDev>>>>,
    vdev_error_cb: Mutex<Option<VdevErrorCb>>,
    error_notified: Mutex<HashSet<u32>>,
}

impl DeviceManager {
    #[must_use]
    pub fn new(cfg: DmConfig) -> Arc<Self> {
        let layout = DeviceLayout::new(cfg.atomic_page_size, cfg.phys_page_size, dm_info_raw_size());
        Arc::new(Self {
            cfg,
            layout,
            state: Mutex::new(DmState {
                tables: DmTables::new(),
                gen: 0,
                last_vdev_id: VdevId::INVALID,
                scan_complete: false,
            }),
            pdevs: RwLock::new((0..MAX_PDEVS).map(|_| None).collect()),
            vdev_error_cb: Mutex::new(None),
            error_notified: Mutex::new(HashSet::new()),
        })
    }

    /// Register the callback fired when a device crosses its error threshold
    pub fn set_vdev_error_cb(&self, cb: impl Fn(VdevId) + Send + Sync + 'static) {
        *self.vdev_error_cb.lock() = Some(Box::new(cb));
    }

    #[must_use]
    pub fn layout(&self) -> &DeviceLayout {
        &self.layout
    }

    #[must_use]
    pub fn system_uuid(&self) -> Uuid {
        self.cfg.system_uuid
    }

    /// Open the given devices. `first_time` formats them all; otherwise the
    /// layout is loaded from the highest-generation DM-info copy and
    /// repaired.
    pub fn add_devices(&self, devices: &[PathBuf], first_time: bool) -> Result<()> {
        if devices.is_empty() {
            return Err(Error::Config("no devices supplied".into()));
        }
        if devices.len() > MAX_PDEVS {
            return Err(Error::Config(format!(
                "{} devices exceeds the maximum of {MAX_PDEVS}",
                devices.len()
            )));
        }
        if first_time {
            self.init_devices(devices)
        } else {
            self.load_and_repair_devices(devices)
        }
    }

    /// Probe whether any of the devices carries a valid superblock
    pub fn any_device_formatted(&self, devices: &[PathBuf]) -> Result<bool> {
        for path in devices {
            let (_, formatted) = PhysicalDev::open(
                path,
                OpenMode::ReadOnly,
                self.layout,
                self.cfg.system_uuid,
            )?;
            if formatted {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn init_devices(&self, devices: &[PathBuf]) -> Result<()> {
        let mut st = self.state.lock();
        let mut pdevs = self.pdevs.write();

        let mut dev_offset = 0u64;
        let mut pdev_size = 0u64;
        for (i, path) in devices.iter().enumerate() {
            let (dev, _) = PhysicalDev::open(
                path,
                self.cfg.open_mode,
                self.layout,
                self.cfg.system_uuid,
            )?;
            if pdev_size == 0 {
                pdev_size = dev.size();
            } else if pdev_size != dev.size() {
                return Err(Error::HeterogeneousDisks {
                    expected: pdev_size,
                    found: dev.size(),
                    device: dev.path().to_string(),
                });
            }
            if dev.size() < self.layout.first_usable_offset() {
                return Err(Error::Config(format!(
                    "device {} too small for the on-disk layout",
                    dev.path()
                )));
            }

            let pdev_id = PdevId::new(i as u32);
            let first_chunk = self.init_pdev_chunks(&mut st.tables, pdev_id, dev.size())?;
            dev.format(pdev_id.raw(), dev_offset, first_chunk.raw())?;

            st.tables.pdevs[i] = PdevInfo {
                dev_id: pdev_id.raw(),
                dev_offset,
                first_chunk_id: first_chunk,
                allocated: true,
            };
            st.tables.num_pdevs += 1;
            dev_offset += dev.size();
            pdevs[i] = Some(Arc::new(dev));
            info!(device = %path.display(), pdev = %pdev_id, "formatted pdev");
        }
        drop(pdevs);

        st.scan_complete = true;
        self.write_dm_info_locked(&mut st)
    }

    /// Seed the chunk list of a fresh pdev: the two DM-info copy chunks
    /// followed by one free chunk covering the usable remainder.
    fn init_pdev_chunks(
        &self,
        tables: &mut DmTables,
        pdev_id: PdevId,
        dev_size: u64,
    ) -> Result<ChunkId> {
        let mut prev = ChunkId::INVALID;
        let mut first = ChunkId::INVALID;
        let specs = [
            (self.layout.dm_copy_offset(0), self.layout.dm_info_size, true),
            (self.layout.dm_copy_offset(1), self.layout.dm_info_size, true),
            (
                self.layout.first_usable_offset(),
                dev_size - self.layout.first_usable_offset(),
                false,
            ),
        ];
        for (start, size, is_sb) in specs {
            let cid = Self::alloc_chunk_slot(tables)?;
            let desc = &mut tables.chunks[cid.index()];
            desc.chunk_id = cid;
            desc.pdev_id = pdev_id;
            desc.vdev_id = VdevId::INVALID;
            desc.start_offset = start;
            desc.size = size;
            desc.prev_id = prev;
            desc.next_id = ChunkId::INVALID;
            desc.primary_id = ChunkId::INVALID;
            desc.is_sb_chunk = is_sb;
            desc.end_of_chunk_offset = size;
            if prev.is_valid() {
                tables.chunks[prev.index()].next_id = cid;
            } else {
                first = cid;
            }
            prev = cid;
            tables.num_chunks += 1;
        }
        Ok(first)
    }

    fn load_and_repair_devices(&self, devices: &[PathBuf]) -> Result<()> {
        let mut st = self.state.lock();
        let mut pdevs = self.pdevs.write();

        let mut spares: Vec<Arc<PhysicalDev>> = Vec::new();
        let mut pdev_size = 0u64;
        let mut max_gen = 0u64;
        let mut source: Option<PdevId> = None;

        for path in devices {
            let (dev, formatted) = PhysicalDev::open(
                path,
                self.cfg.open_mode,
                self.layout,
                self.cfg.system_uuid,
            )?;
            if !formatted {
                warn!(
                    device = %path.display(),
                    "device has no valid superblock; holding it as a spare"
                );
                spares.push(Arc::new(dev));
                continue;
            }
            if pdev_size == 0 {
                pdev_size = dev.size();
            } else if pdev_size != dev.size() {
                return Err(Error::HeterogeneousDisks {
                    expected: pdev_size,
                    found: dev.size(),
                    device: dev.path().to_string(),
                });
            }
            let id = dev.dev_id();
            if id as usize >= MAX_PDEVS || pdevs[id as usize].is_some() {
                return Err(Error::io_error(format!(
                    "device {} carries conflicting pdev id {id}",
                    dev.path()
                )));
            }
            if dev.sb_gen() >= max_gen {
                max_gen = dev.sb_gen();
                source = Some(PdevId::new(id));
            }
            pdevs[id as usize] = Some(Arc::new(dev));
        }

        let source = source.ok_or(Error::NoValidDevice)?;
        st.gen = max_gen;

        // Read DM-info from the authoritative device.
        let src_dev = pdevs[source.index()]
            .as_ref()
            .ok_or(Error::NoValidDevice)?
            .clone();
        let mut blob = vec![0u8; self.layout.dm_info_size as usize];
        src_dev.read_dm_copy(&mut blob)?;
        st.tables = DmTables::deserialize(&blob, self.layout.dm_info_size)?;

        // Replace missing pdevs with spares; mark their vdevs failed.
        let mut rewrite = false;
        for dev_id in 0..st.tables.num_pdevs {
            if pdevs[dev_id as usize].is_some() {
                continue;
            }
            let spare = spares.pop().ok_or(Error::NoSpareDisk(dev_id))?;
            if spare.size() != pdev_size {
                return Err(Error::HeterogeneousDisks {
                    expected: pdev_size,
                    found: spare.size(),
                    device: spare.path().to_string(),
                });
            }
            let (info_id, info_offset, info_first) = {
                let info = &st.tables.pdevs[dev_id as usize];
                (info.dev_id, info.dev_offset, info.first_chunk_id)
            };
            spare.format(info_id, info_offset, info_first.raw())?;
            warn!(pdev = dev_id, device = spare.path(), "adopted spare for missing pdev");

            let lost_vdevs: Vec<VdevId> = st
                .tables
                .chunks
                .iter()
                .filter(|c| {
                    c.allocated && c.pdev_id == PdevId::new(dev_id) && c.vdev_id.is_valid()
                })
                .map(|c| c.vdev_id)
                .collect();
            for vid in lost_vdevs {
                if !st.tables.vdevs[vid.index()].failed {
                    warn!(vdev = %vid, "marking vdev failed: chunk lost with pdev {dev_id}");
                    st.tables.vdevs[vid.index()].failed = true;
                }
            }
            pdevs[dev_id as usize] = Some(spare);
            rewrite = true;
        }
        if !spares.is_empty() {
            return Err(Error::Config(format!(
                "{} unformatted devices supplied that the system does not need",
                spares.len()
            )));
        }

        // Walk the per-pdev chunk lists and the vdev list to validate the
        // recovered directory.
        let mut seen_chunks = 0u32;
        for dev_id in 0..st.tables.num_pdevs {
            let mut cid = st.tables.pdevs[dev_id as usize].first_chunk_id;
            let mut prev_end = 0u64;
            while cid.is_valid() {
                let c = &st.tables.chunks[cid.index()];
                if !c.allocated || c.chunk_id != cid || c.pdev_id.raw() != dev_id {
                    return Err(Error::io_error(format!(
                        "chunk table corrupt at chunk {cid} on pdev {dev_id}"
                    )));
                }
                if c.start_offset < prev_end {
                    return Err(Error::io_error(format!(
                        "chunk {cid} overlaps its predecessor on pdev {dev_id}"
                    )));
                }
                prev_end = c.end_offset();
                seen_chunks += 1;
                cid = c.next_id;
            }
        }
        if seen_chunks != st.tables.num_chunks {
            return Err(Error::io_error(format!(
                "chunk walk found {seen_chunks} chunks, directory says {}",
                st.tables.num_chunks
            )));
        }

        let mut vid = st.tables.first_vdev_id;
        let mut seen_vdevs = 0u32;
        while vid.is_valid() {
            let (allocated, slot_id, next) = {
                let v = &st.tables.vdevs[vid.index()];
                (v.allocated, v.vdev_id, v.next_id)
            };
            if !allocated || slot_id != vid {
                return Err(Error::io_error(format!("vdev table corrupt at vdev {vid}")));
            }
            st.last_vdev_id = vid;
            seen_vdevs += 1;
            vid = next;
        }
        if seen_vdevs != st.tables.num_vdevs {
            return Err(Error::io_error(format!(
                "vdev walk found {seen_vdevs} vdevs, directory says {}",
                st.tables.num_vdevs
            )));
        }

        // Rewrite if anything was repaired or any device lags the
        // authoritative generation.
        let lagging = pdevs
            .iter()
            .flatten()
            .any(|p| p.sb_gen() != max_gen);
        drop(pdevs);

        st.scan_complete = true;
        if (rewrite || lagging) && self.cfg.open_mode != OpenMode::ReadOnly {
            info!(gen = st.gen + 1, "rewriting DM-info after recovery repair");
            self.write_dm_info_locked(&mut st)?;
        }
        Ok(())
    }

    /// Serialize the tables and replicate them to every pdev under a
    /// bumped generation. Caller holds the state lock.
    fn write_dm_info_locked(&self, st: &mut DmState) -> Result<()> {
        if !st.scan_complete || self.cfg.open_mode == OpenMode::ReadOnly {
            return Ok(());
        }
        st.gen += 1;
        let blob = st.tables.serialize(self.layout.dm_info_size);
        let pdevs = self.pdevs.read();
        for dev in pdevs.iter().flatten() {
            dev.write_dm_copy(st.gen, &blob)?;
        }
        debug!(gen = st.gen, "DM-info replicated to all pdevs");
        Ok(())
    }

    // ---- pdev access -------------------------------------------------

    pub fn pdev(&self, id: PdevId) -> Result<Arc<PhysicalDev>> {
        self.pdevs
            .read()
            .get(id.index())
            .and_then(|p| p.clone())
            .ok_or_else(|| Error::io_error(format!("no such pdev {id}")))
    }

    #[must_use]
    pub fn pdev_ids(&self) -> Vec<PdevId> {
        let st = self.state.lock();
        (0..st.tables.num_pdevs).map(PdevId::new).collect()
    }

    #[must_use]
    pub fn pdev_count(&self) -> u32 {
        self.state.lock().tables.num_pdevs
    }

    /// Total raw capacity across all pdevs (disks are homogeneous)
    #[must_use]
    pub fn total_capacity(&self) -> u64 {
        self.pdevs
            .read()
            .iter()
            .flatten()
            .map(|p| p.size())
            .sum()
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.state.lock().gen
    }

    /// Report an I/O error on a pdev. Past the configured threshold every
    /// vdev hosting a chunk on that device gets the error callback, once
    /// per crossing.
    pub fn handle_io_error(&self, pdev_id: PdevId) {
        let Ok(dev) = self.pdev(pdev_id) else {
            return;
        };
        if dev.error_count() < self.cfg.max_error_before_marking_dev_down {
            return;
        }
        if !self.error_notified.lock().insert(pdev_id.raw()) {
            return;
        }
        warn!(pdev = %pdev_id, errors = dev.error_count(), "pdev crossed error threshold");

        let mut vdev_ids = HashSet::new();
        {
            let st = self.state.lock();
            for chunk in &st.tables.chunks {
                if chunk.allocated && chunk.pdev_id == pdev_id && chunk.vdev_id.is_valid() {
                    vdev_ids.insert(chunk.vdev_id.raw());
                }
            }
        }
        let cb = self.vdev_error_cb.lock();
        if let Some(cb) = cb.as_ref() {
            for vid in vdev_ids {
                cb(VdevId::new(vid));
            }
        }
    }

    // ---- chunk table -------------------------------------------------

    fn alloc_chunk_slot(tables: &mut DmTables) -> Result<ChunkId> {
        let start = tables.num_chunks as usize % MAX_CHUNKS;
        for i in 0..MAX_CHUNKS {
            let slot = (start + i) % MAX_CHUNKS;
            if !tables.chunks[slot].allocated {
                tables.chunks[slot] = ChunkDescriptor::empty();
                tables.chunks[slot].allocated = true;
                return Ok(ChunkId::new(slot as u32));
            }
        }
        Err(Error::no_space("no free chunk slot"))
    }

    /// Best-fit search: the smallest free chunk on `pdev_id` whose size is
    /// at least `size`, ties broken by lowest offset.
    fn find_free_chunk(tables: &DmTables, pdev_id: PdevId, size: u64) -> Option<ChunkId> {
        let mut best: Option<ChunkId> = None;
        let mut cid = tables.pdevs[pdev_id.index()].first_chunk_id;
        while cid.is_valid() {
            let c = &tables.chunks[cid.index()];
            if c.is_free() && c.size >= size {
                let better = match best {
                    None => true,
                    Some(b) => c.size < tables.chunks[b.index()].size,
                };
                if better {
                    best = Some(cid);
                }
            }
            cid = c.next_id;
        }
        best
    }

    /// Allocate a chunk of exactly `size` bytes on `pdev_id` for
    /// `vdev_id`, splitting a larger free chunk in place. Persists DM-info
    /// synchronously.
    pub fn alloc_chunk(
        &self,
        pdev_id: PdevId,
        vdev_id: VdevId,
        size: u64,
        primary: ChunkId,
    ) -> Result<ChunkId> {
        debug_assert_eq!(size % u64::from(self.cfg.phys_page_size), 0);
        let mut st = self.state.lock();

        let cid = Self::find_free_chunk(&st.tables, pdev_id, size).ok_or_else(|| {
            Error::no_space(format!("no chunk of {size} bytes available on pdev {pdev_id}"))
        })?;

        let (chunk_size, chunk_start) = {
            let c = &mut st.tables.chunks[cid.index()];
            c.vdev_id = vdev_id;
            c.primary_id = primary;
            c.end_of_chunk_offset = size;
            (c.size, c.start_offset)
        };

        if chunk_size > size {
            // Split: the remainder becomes a new free chunk right after.
            let rest = Self::alloc_chunk_slot(&mut st.tables)?;
            let next_of_cur = st.tables.chunks[cid.index()].next_id;
            {
                let r = &mut st.tables.chunks[rest.index()];
                r.chunk_id = rest;
                r.pdev_id = pdev_id;
                r.vdev_id = VdevId::INVALID;
                r.start_offset = chunk_start + size;
                r.size = chunk_size - size;
                r.end_of_chunk_offset = r.size;
                r.prev_id = cid;
                r.next_id = next_of_cur;
            }
            if next_of_cur.is_valid() {
                st.tables.chunks[next_of_cur.index()].prev_id = rest;
            }
            st.tables.chunks[cid.index()].next_id = rest;
            st.tables.chunks[cid.index()].size = size;
            st.tables.num_chunks += 1;
        }

        debug!(chunk = %cid, pdev = %pdev_id, vdev = %vdev_id, size, "allocated chunk");
        self.write_dm_info_locked(&mut st)?;
        Ok(cid)
    }

    /// Free a chunk and coalesce it with free neighbours. Persists DM-info.
    pub fn free_chunk(&self, chunk_id: ChunkId) -> Result<()> {
        let mut st = self.state.lock();
        st.tables.chunks[chunk_id.index()].set_free();

        // Absorb the next chunk if free.
        let next = st.tables.chunks[chunk_id.index()].next_id;
        if next.is_valid() && st.tables.chunks[next.index()].is_free() {
            let (next_size, next_next) = {
                let n = &st.tables.chunks[next.index()];
                (n.size, n.next_id)
            };
            let c = &mut st.tables.chunks[chunk_id.index()];
            c.size += next_size;
            c.next_id = next_next;
            if next_next.is_valid() {
                st.tables.chunks[next_next.index()].prev_id = chunk_id;
            }
            st.tables.chunks[next.index()] = ChunkDescriptor::empty();
            st.tables.num_chunks -= 1;
        }

        // Let the previous chunk absorb us if free.
        let prev = st.tables.chunks[chunk_id.index()].prev_id;
        if prev.is_valid() && st.tables.chunks[prev.index()].is_free() {
            let (cur_size, cur_next) = {
                let c = &st.tables.chunks[chunk_id.index()];
                (c.size, c.next_id)
            };
            let p = &mut st.tables.chunks[prev.index()];
            p.size += cur_size;
            p.next_id = cur_next;
            if cur_next.is_valid() {
                st.tables.chunks[cur_next.index()].prev_id = prev;
            }
            st.tables.chunks[chunk_id.index()] = ChunkDescriptor::empty();
            st.tables.num_chunks -= 1;
        }

        // The freed chunk's end-of-data mark is meaningless now.
        if st.tables.chunks[chunk_id.index()].allocated {
            let c = &mut st.tables.chunks[chunk_id.index()];
            c.end_of_chunk_offset = c.size;
        }

        self.write_dm_info_locked(&mut st)
    }

    #[must_use]
    pub fn chunk(&self, chunk_id: ChunkId) -> Option<ChunkDescriptor> {
        let st = self.state.lock();
        let c = &st.tables.chunks[chunk_id.index()];
        c.allocated.then(|| c.clone())
    }

    /// Chunks owned by a vdev, in chunk-id discovery order per pdev
    #[must_use]
    pub fn chunks_of_vdev(&self, vdev_id: VdevId) -> Vec<ChunkDescriptor> {
        let st = self.state.lock();
        let mut out = Vec::new();
        for dev_id in 0..st.tables.num_pdevs {
            let mut cid = st.tables.pdevs[dev_id as usize].first_chunk_id;
            while cid.is_valid() {
                let c = &st.tables.chunks[cid.index()];
                if c.vdev_id == vdev_id {
                    out.push(c.clone());
                }
                cid = c.next_id;
            }
        }
        out
    }

    /// Free chunks on one pdev, for inspection and tests
    #[must_use]
    pub fn free_chunks_on(&self, pdev_id: PdevId) -> Vec<ChunkDescriptor> {
        let st = self.state.lock();
        let mut out = Vec::new();
        let mut cid = st.tables.pdevs[pdev_id.index()].first_chunk_id;
        while cid.is_valid() {
            let c = &st.tables.chunks[cid.index()];
            if c.is_free() {
                out.push(c.clone());
            }
            cid = c.next_id;
        }
        out
    }

    /// Persist a new end-of-data offset for an append-log chunk
    pub fn update_end_of_chunk(&self, chunk_id: ChunkId, offset: u64) -> Result<()> {
        let mut st = self.state.lock();
        st.tables.chunks[chunk_id.index()].end_of_chunk_offset = offset;
        self.write_dm_info_locked(&mut st)
    }

    // ---- vdev table --------------------------------------------------

    /// Pick a free vdev slot, link it into the vdev list and persist.
    pub fn alloc_vdev(
        &self,
        size: u64,
        mirror_count: u32,
        page_size: u32,
        primary_chunk_count: u32,
        context: &[u8],
    ) -> Result<VdevId> {
        if context.len() > VDEV_CONTEXT_DATA_SIZE {
            return Err(Error::Config(format!(
                "vdev context of {} bytes exceeds {VDEV_CONTEXT_DATA_SIZE}",
                context.len()
            )));
        }
        let mut st = self.state.lock();

        let vid = (0..MAX_VDEVS)
            .map(|i| VdevId::new(i as u32))
            .find(|v| !st.tables.vdevs[v.index()].allocated)
            .ok_or_else(|| Error::no_space("no free vdev slot"))?;

        let last = st.last_vdev_id;
        {
            let v = &mut st.tables.vdevs[vid.index()];
            *v = VdevDescriptor::empty();
            v.vdev_id = vid;
            v.allocated = true;
            v.size = size;
            v.mirror_count = mirror_count;
            v.page_size = page_size;
            v.primary_chunk_count = primary_chunk_count;
            v.data_start_offset = 0;
            v.prev_id = last;
            v.context_data[..context.len()].copy_from_slice(context);
        }
        if last.is_valid() {
            st.tables.vdevs[last.index()].next_id = vid;
        } else {
            st.tables.first_vdev_id = vid;
        }
        st.last_vdev_id = vid;
        st.tables.num_vdevs += 1;

        debug!(vdev = %vid, size, mirror_count, "created vdev");
        self.write_dm_info_locked(&mut st)?;
        Ok(vid)
    }

    /// Unlink a vdev slot and persist. Its chunks must be freed first.
    pub fn free_vdev(&self, vdev_id: VdevId) -> Result<()> {
        let mut st = self.state.lock();
        let (prev, next) = {
            let v = &st.tables.vdevs[vdev_id.index()];
            (v.prev_id, v.next_id)
        };
        if prev.is_valid() {
            st.tables.vdevs[prev.index()].next_id = next;
        } else {
            st.tables.first_vdev_id = next;
        }
        if next.is_valid() {
            st.tables.vdevs[next.index()].prev_id = prev;
        }
        if st.last_vdev_id == vdev_id {
            st.last_vdev_id = prev;
        }
        st.tables.vdevs[vdev_id.index()].allocated = false;
        st.tables.num_vdevs -= 1;
        self.write_dm_info_locked(&mut st)
    }

    #[must_use]
    pub fn vdev(&self, vdev_id: VdevId) -> Option<VdevDescriptor> {
        let st = self.state.lock();
        let v = &st.tables.vdevs[vdev_id.index()];
        v.allocated.then(|| v.clone())
    }

    /// All allocated vdevs in list order
    #[must_use]
    pub fn vdevs(&self) -> Vec<VdevDescriptor> {
        let st = self.state.lock();
        let mut out = Vec::new();
        let mut vid = st.tables.first_vdev_id;
        while vid.is_valid() {
            let v = &st.tables.vdevs[vid.index()];
            out.push(v.clone());
            vid = v.next_id;
        }
        out
    }

    /// Copy a blob into the vdev's context data and persist
    pub fn update_vdev_context(&self, vdev_id: VdevId, blob: &[u8]) -> Result<()> {
        if blob.len() > VDEV_CONTEXT_DATA_SIZE {
            return Err(Error::Config("vdev context blob too large".into()));
        }
        let mut st = self.state.lock();
        let ctx = &mut st.tables.vdevs[vdev_id.index()].context_data;
        ctx[..blob.len()].copy_from_slice(blob);
        ctx[blob.len()..].fill(0);
        self.write_dm_info_locked(&mut st)
    }

    #[must_use]
    pub fn vdev_context(&self, vdev_id: VdevId) -> Vec<u8> {
        self.state.lock().tables.vdevs[vdev_id.index()]
            .context_data
            .clone()
    }

    /// Persist the durable start-of-data position of an append-log vdev
    pub fn update_data_start_offset(&self, vdev_id: VdevId, offset: u64) -> Result<()> {
        let mut st = self.state.lock();
        st.tables.vdevs[vdev_id.index()].data_start_offset = offset;
        self.write_dm_info_locked(&mut st)
    }

    pub fn mark_vdev_failed(&self, vdev_id: VdevId) -> Result<()> {
        let mut st = self.state.lock();
        st.tables.vdevs[vdev_id.index()].failed = true;
        self.write_dm_info_locked(&mut st)
    }

    /// Clear the failed flag once a vdev's data has been reconstructed
    pub fn reset_vdev_failed(&self, vdev_id: VdevId) -> Result<()> {
        let mut st = self.state.lock();
        st.tables.vdevs[vdev_id.index()].failed = false;
        self.write_dm_info_locked(&mut st)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use volstore_common::types::MIN_IO_SIZE;

    const DEV_SIZE: u64 = 512 << 20;

    fn make_devices(dir: &TempDir, n: usize) -> Vec<PathBuf> {
        (0..n)
            .map(|i| {
                let path = dir.path().join(format!("pdev{i}"));
                let f = std::fs::File::create(&path).unwrap();
                f.set_len(DEV_SIZE).unwrap();
                path
            })
            .collect()
    }

    fn dm_config() -> DmConfig {
        DmConfig {
            open_mode: OpenMode::BufferedIo,
            phys_page_size: MIN_IO_SIZE,
            atomic_page_size: MIN_IO_SIZE,
            system_uuid: Uuid::new_v4(),
            max_error_before_marking_dev_down: 3,
        }
    }

    #[test]
    fn test_first_time_init_then_reload() {
        let dir = TempDir::new().unwrap();
        let devices = make_devices(&dir, 2);
        let cfg = dm_config();

        {
            let dm = DeviceManager::new(cfg.clone());
            dm.add_devices(&devices, true).unwrap();
            assert_eq!(dm.pdev_count(), 2);
            assert_eq!(dm.generation(), 1);
            // Both pdevs carry the same generation.
            for id in dm.pdev_ids() {
                assert_eq!(dm.pdev(id).unwrap().sb_gen(), 1);
            }
        }

        let dm = DeviceManager::new(cfg);
        dm.add_devices(&devices, false).unwrap();
        assert_eq!(dm.pdev_count(), 2);
        // Clean reload: every pdev already at max generation, no rewrite.
        assert_eq!(dm.generation(), 1);
    }

    #[test]
    fn test_alloc_chunk_splits_and_persists() {
        let dir = TempDir::new().unwrap();
        let devices = make_devices(&dir, 1);
        let dm = DeviceManager::new(dm_config());
        dm.add_devices(&devices, true).unwrap();

        let free_before = dm.free_chunks_on(PdevId::new(0));
        assert_eq!(free_before.len(), 1);
        let total_free = free_before[0].size;

        let cid = dm
            .alloc_chunk(PdevId::new(0), VdevId::new(0), 64 << 20, ChunkId::INVALID)
            .unwrap();
        let chunk = dm.chunk(cid).unwrap();
        assert_eq!(chunk.size, 64 << 20);
        assert_eq!(chunk.vdev_id, VdevId::new(0));

        let free_after = dm.free_chunks_on(PdevId::new(0));
        assert_eq!(free_after.len(), 1);
        assert_eq!(free_after[0].size, total_free - (64 << 20));
        assert_eq!(free_after[0].start_offset, chunk.end_offset());
    }

    #[test]
    fn test_exact_fit_leaves_no_residual() {
        let dir = TempDir::new().unwrap();
        let devices = make_devices(&dir, 1);
        let dm = DeviceManager::new(dm_config());
        dm.add_devices(&devices, true).unwrap();

        let free = dm.free_chunks_on(PdevId::new(0));
        let exact = free[0].size;
        let cid = dm
            .alloc_chunk(PdevId::new(0), VdevId::new(0), exact, ChunkId::INVALID)
            .unwrap();
        assert_eq!(dm.chunk(cid).unwrap().size, exact);
        assert!(dm.free_chunks_on(PdevId::new(0)).is_empty());

        // Nothing left: the next allocation reports no-space.
        let err = dm
            .alloc_chunk(PdevId::new(0), VdevId::new(1), 4096, ChunkId::INVALID)
            .unwrap_err();
        assert!(err.is_no_space());
    }

    #[test]
    fn test_free_chunk_coalesces() {
        let dir = TempDir::new().unwrap();
        let devices = make_devices(&dir, 1);
        let dm = DeviceManager::new(dm_config());
        dm.add_devices(&devices, true).unwrap();

        let a = dm
            .alloc_chunk(PdevId::new(0), VdevId::new(0), 32 << 20, ChunkId::INVALID)
            .unwrap();
        let b = dm
            .alloc_chunk(PdevId::new(0), VdevId::new(0), 32 << 20, ChunkId::INVALID)
            .unwrap();

        dm.free_chunk(a).unwrap();
        dm.free_chunk(b).unwrap();

        // a, b and the trailing free chunk all merged into one.
        let free = dm.free_chunks_on(PdevId::new(0));
        assert_eq!(free.len(), 1, "free neighbours must coalesce");
    }

    #[test]
    fn test_chunk_directory_integrity() {
        let dir = TempDir::new().unwrap();
        let devices = make_devices(&dir, 2);
        let dm = DeviceManager::new(dm_config());
        dm.add_devices(&devices, true).unwrap();

        for pd in 0..2u32 {
            for _ in 0..3 {
                dm.alloc_chunk(PdevId::new(pd), VdevId::new(0), 16 << 20, ChunkId::INVALID)
                    .unwrap();
            }
        }

        // Walk each pdev list: ascending, non-overlapping, visits all live
        // chunks exactly once.
        let mut walked = 0usize;
        for pd in 0..2u32 {
            let mut last_end = 0u64;
            let mut cid = {
                let dm_pdev = dm.pdev(PdevId::new(pd)).unwrap();
                ChunkId::new(dm_pdev.first_chunk_id())
            };
            while cid.is_valid() {
                let c = dm.chunk(cid).unwrap();
                assert!(c.start_offset >= last_end, "chunks must not overlap");
                last_end = c.end_offset();
                walked += 1;
                cid = c.next_id;
            }
        }
        // 2 sb chunks + chunks per pdev, all visited.
        assert!(walked >= 2 * (2 + 3));
    }

    #[test]
    fn test_vdev_alloc_and_context() {
        let dir = TempDir::new().unwrap();
        let devices = make_devices(&dir, 1);
        let dm = DeviceManager::new(dm_config());
        dm.add_devices(&devices, true).unwrap();

        let vid = dm.alloc_vdev(128 << 20, 0, 4096, 1, b"root=42").unwrap();
        let desc = dm.vdev(vid).unwrap();
        assert_eq!(desc.size, 128 << 20);
        assert_eq!(&desc.context_data[..7], b"root=42");

        dm.update_vdev_context(vid, b"root=43").unwrap();
        assert_eq!(&dm.vdev_context(vid)[..7], b"root=43");
    }

    #[test]
    fn test_recovery_picks_highest_generation() {
        let dir = TempDir::new().unwrap();
        let devices = make_devices(&dir, 2);
        let cfg = dm_config();

        {
            let dm = DeviceManager::new(cfg.clone());
            dm.add_devices(&devices, true).unwrap();
            // A few metadata updates bump the generation on both devices.
            dm.alloc_chunk(PdevId::new(0), VdevId::new(0), 16 << 20, ChunkId::INVALID)
                .unwrap();
            dm.alloc_chunk(PdevId::new(1), VdevId::new(0), 16 << 20, ChunkId::INVALID)
                .unwrap();
            assert_eq!(dm.generation(), 3);
        }

        let dm = DeviceManager::new(cfg);
        dm.add_devices(&devices, false).unwrap();
        assert_eq!(dm.generation(), 3);
        assert_eq!(dm.chunks_of_vdev(VdevId::new(0)).len(), 2);
    }

    #[test]
    fn test_recovery_adopts_spare_and_marks_vdev_failed() {
        let dir = TempDir::new().unwrap();
        let devices = make_devices(&dir, 2);
        let cfg = dm_config();

        {
            let dm = DeviceManager::new(cfg.clone());
            dm.add_devices(&devices, true).unwrap();
            let vid = dm.alloc_vdev(32 << 20, 0, 4096, 2, &[]).unwrap();
            dm.alloc_chunk(PdevId::new(0), vid, 16 << 20, ChunkId::INVALID)
                .unwrap();
            dm.alloc_chunk(PdevId::new(1), vid, 16 << 20, ChunkId::INVALID)
                .unwrap();
        }
        let old_gen = {
            let dm = DeviceManager::new(cfg.clone());
            dm.add_devices(&devices, false).unwrap();
            dm.generation()
        };

        // Pull pdev 1 and supply a fresh device of identical size.
        std::fs::remove_file(&devices[1]).unwrap();
        let f = std::fs::File::create(&devices[1]).unwrap();
        f.set_len(DEV_SIZE).unwrap();

        let dm = DeviceManager::new(cfg);
        dm.add_devices(&devices, false).unwrap();

        let vdevs = dm.vdevs();
        assert_eq!(vdevs.len(), 1);
        assert!(vdevs[0].failed, "vdev with a chunk on the lost pdev must fail");
        assert!(dm.generation() > old_gen, "repair must bump the generation");
        assert_eq!(dm.pdev(PdevId::new(1)).unwrap().dev_id(), 1);
    }

    #[test]
    fn test_recovery_without_spare_fails() {
        let dir = TempDir::new().unwrap();
        let devices = make_devices(&dir, 2);
        let cfg = dm_config();
        {
            let dm = DeviceManager::new(cfg.clone());
            dm.add_devices(&devices, true).unwrap();
        }
        std::fs::remove_file(&devices[1]).unwrap();

        let dm = DeviceManager::new(cfg);
        let err = dm.add_devices(&devices[..1], false).unwrap_err();
        assert!(matches!(err, Error::NoSpareDisk(1)));
    }

    #[test]
    fn test_recovery_all_blank_is_no_valid_device() {
        let dir = TempDir::new().unwrap();
        let devices = make_devices(&dir, 2);
        let dm = DeviceManager::new(dm_config());
        let err = dm.add_devices(&devices, false).unwrap_err();
        assert!(matches!(err, Error::NoValidDevice));
    }

    #[test]
    fn test_heterogeneous_disks_rejected() {
        let dir = TempDir::new().unwrap();
        let mut devices = make_devices(&dir, 1);
        let odd = dir.path().join("odd");
        let f = std::fs::File::create(&odd).unwrap();
        f.set_len(DEV_SIZE * 2).unwrap();
        devices.push(odd);

        let dm = DeviceManager::new(dm_config());
        let err = dm.add_devices(&devices, true).unwrap_err();
        assert!(matches!(err, Error::HeterogeneousDisks { .. }));
    }
}
