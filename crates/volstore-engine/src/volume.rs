//! Volumes and the indexed write pipeline.
//!
//! A write allocates blocks, writes the data, enters the current
//! checkpoint epoch, installs the extent mapping, commits the allocation,
//! journals the whole operation and only then acknowledges. A put that
//! discovers its epoch has advanced retries exactly once under the new
//! epoch; a second mismatch is surfaced as an I/O error.
//!
//! The volume manager is also the checkpoint handler: closing an epoch
//! snapshots per-volume state, and flushing it drives the prescribed
//! order of freed blocks to the allocator, index snapshots, allocator
//! bitmaps, CP superblocks, registry persist, then journal truncation.

use crate::blkalloc::{AllocHints, BlkAllocCp, BlkStore};
use crate::checkpoint::{CpCoordinator, CpEpoch, CpHandler};
use crate::index::{ExtentIndex, FreeBlockEntry, IndexCpToken, IndexValue};
use crate::logdev::LogDevice;
use crate::metablk::MetaRegistry;
use bytes::{Buf, BufMut};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use volstore_common::checksum::{compute_crc32c, lba_checksums};
use volstore_common::{BlockId, Error, Lba, Result, SeqNum};

/// Registry sub-types this module owns
pub const SUB_VOL: &str = "vol";
pub const SUB_CPSB: &str = "cpsb";
pub const SUB_INDX: &str = "indx";
pub const SUB_BLKALLOC: &str = "blkalloc";

/// Volume lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolState {
    Uninited,
    Online,
    Offline,
    /// Not persisted: set when a hosting pdev goes down, reverts on
    /// reboot if the pdev returns
    Failed,
    Destroying,
    Destroyed,
}

/// Creation-time attributes of a volume
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeParams {
    pub name: String,
    pub uuid: Uuid,
    pub size: u64,
    pub page_size: u32,
}

/// Persisted volume superblock
#[derive(Debug, Clone, Serialize, Deserialize)]
struct VolumeSb {
    params: VolumeParams,
    state: VolState,
    store_id: u32,
}

/// Per-volume checkpoint superblock
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CpSuperblock {
    pub cp_cnt: u64,
    /// Journal records at or below this are reflected in the index snapshot
    pub end_seq: SeqNum,
    /// Checkpoint counter of the last persisted allocator bitmaps
    pub blkalloc_cp_cnt: u64,
}

/// Journal durability watermark: the highest sequence number below
/// which every record has been appended. Completions can land out of
/// order, so stragglers park in `pending` until the gap closes.
struct AppendedSeqs {
    contiguous: SeqNum,
    pending: BTreeSet<SeqNum>,
}

/// One user-visible volume
pub struct Volume {
    params: VolumeParams,
    state: RwLock<VolState>,
    pub(crate) index: ExtentIndex,
    store_id: u32,
    /// Next sequence number to issue; sequence numbers start at 1
    next_seq: AtomicU64,
    appended: Mutex<AppendedSeqs>,
    last_cp_sb: Mutex<CpSuperblock>,
    destroy_pending: AtomicBool,
}

impl Volume {
    fn new(params: VolumeParams, store_id: u32, state: VolState) -> Arc<Self> {
        Arc::new(Self {
            params,
            state: RwLock::new(state),
            index: ExtentIndex::new(),
            store_id,
            next_seq: AtomicU64::new(1),
            appended: Mutex::new(AppendedSeqs {
                contiguous: 0,
                pending: BTreeSet::new(),
            }),
            last_cp_sb: Mutex::new(CpSuperblock::default()),
            destroy_pending: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.params.uuid
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.params.name
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.params.size
    }

    #[must_use]
    pub fn page_size(&self) -> u32 {
        self.params.page_size
    }

    #[must_use]
    pub fn state(&self) -> VolState {
        *self.state.read()
    }

    #[must_use]
    pub fn store_id(&self) -> u32 {
        self.store_id
    }

    #[must_use]
    pub fn last_cp_sb(&self) -> CpSuperblock {
        *self.last_cp_sb.lock()
    }

    /// Extent mappings overlapping a range, clipped to it
    #[must_use]
    pub fn mapped_extents(&self, lba: Lba, n_lbas: u32) -> Vec<(Lba, IndexValue)> {
        self.index.get(lba, n_lbas)
    }

    fn issue_seq(&self) -> SeqNum {
        self.next_seq.fetch_add(1, Ordering::AcqRel)
    }

    /// Last sequence number handed out (durable or not)
    #[must_use]
    pub fn last_issued_seq(&self) -> SeqNum {
        self.next_seq.load(Ordering::Acquire) - 1
    }

    /// Record that `seq`'s journal append is durable
    fn note_appended(&self, seq: SeqNum) {
        let mut ap = self.appended.lock();
        if seq == ap.contiguous + 1 {
            ap.contiguous = seq;
            loop {
                let next = ap.contiguous + 1;
                if !ap.pending.remove(&next) {
                    break;
                }
                ap.contiguous = next;
            }
        } else if seq > ap.contiguous {
            ap.pending.insert(seq);
        }
    }

    /// Highest sequence number with every record at or below it durable
    /// in the journal. The only safe truncation point.
    fn contiguous_appended(&self) -> SeqNum {
        self.appended.lock().contiguous
    }

    fn init_appended(&self, seq: SeqNum) {
        self.appended.lock().contiguous = seq;
    }

    fn note_replayed_seq(&self, seq: SeqNum) {
        let mut cur = self.next_seq.load(Ordering::Acquire);
        while seq + 1 > cur {
            match self.next_seq.compare_exchange(
                cur,
                seq + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(now) => cur = now,
            }
        }
    }

    fn check_online(&self) -> Result<()> {
        match self.state() {
            VolState::Online => Ok(()),
            s => Err(Error::Busy(format!(
                "volume {} is {s:?}, not online",
                self.params.name
            ))),
        }
    }
}

// ---- journal record -------------------------------------------------

const REC_FLAG_UNMAP: u32 = 1 << 0;
const REC_FLAG_DESTROY: u32 = 1 << 1;

/// What part of an I/O landed in which epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoCpInfo {
    pub epoch_counter: u64,
    pub last_lba_written: Lba,
    pub freed_count: u32,
}

/// A free captured in the journal, owned by the epoch that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalFreeEntry {
    pub block_id: BlockId,
    pub offset: u32,
    pub n_blocks: u32,
    pub owning_epoch: u64,
}

impl JournalFreeEntry {
    fn from_index(f: FreeBlockEntry, owning_epoch: u64) -> Self {
        Self {
            block_id: f.block_id,
            offset: f.offset,
            n_blocks: f.n_blocks,
            owning_epoch,
        }
    }
}

/// One journal record: header, allocated units, per-lba checksums, freed
/// units and up to two per-epoch summaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalRecord {
    pub lba: Lba,
    pub n_lbas: u32,
    pub flags: u32,
    pub alloc: Vec<BlockId>,
    pub checksums: Vec<u32>,
    pub frees: Vec<JournalFreeEntry>,
    pub cp_info: Vec<IoCpInfo>,
}

impl JournalRecord {
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.cp_info.len() > 2 {
            return Err(Error::io_error(
                "journal record spans more than two epochs",
            ));
        }
        let mut buf = Vec::with_capacity(
            32 + self.alloc.len() * 8 + self.checksums.len() * 4 + self.frees.len() * 20,
        );
        buf.put_u64_le(self.lba);
        buf.put_u32_le(self.n_lbas);
        buf.put_u32_le(self.flags);
        buf.put_u32_le(self.alloc.len() as u32);
        buf.put_u32_le(self.checksums.len() as u32);
        buf.put_u32_le(self.frees.len() as u32);
        buf.put_u32_le(self.cp_info.len() as u32);
        for bid in &self.alloc {
            buf.put_u64_le(bid.to_raw());
        }
        for c in &self.checksums {
            buf.put_u32_le(*c);
        }
        for f in &self.frees {
            buf.put_u64_le(f.block_id.to_raw());
            buf.put_u32_le(f.offset);
            buf.put_u32_le(f.n_blocks);
            buf.put_u64_le(f.owning_epoch);
        }
        for ci in &self.cp_info {
            buf.put_u64_le(ci.epoch_counter);
            buf.put_u64_le(ci.last_lba_written);
            buf.put_u32_le(ci.freed_count);
        }
        Ok(buf)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 32 {
            return Err(Error::io_error("journal record header truncated"));
        }
        let mut buf = data;
        let lba = buf.get_u64_le();
        let n_lbas = buf.get_u32_le();
        let flags = buf.get_u32_le();
        let alloc_count = buf.get_u32_le() as usize;
        let csum_count = buf.get_u32_le() as usize;
        let free_count = buf.get_u32_le() as usize;
        let cp_info_count = buf.get_u32_le() as usize;

        let need = alloc_count * 8 + csum_count * 4 + free_count * 24 + cp_info_count * 20;
        if buf.remaining() < need || cp_info_count > 2 {
            return Err(Error::io_error("journal record body corrupt"));
        }

        let alloc = (0..alloc_count)
            .map(|_| BlockId::from_raw(buf.get_u64_le()))
            .collect();
        let checksums = (0..csum_count).map(|_| buf.get_u32_le()).collect();
        let frees = (0..free_count)
            .map(|_| JournalFreeEntry {
                block_id: BlockId::from_raw(buf.get_u64_le()),
                offset: buf.get_u32_le(),
                n_blocks: buf.get_u32_le(),
                owning_epoch: buf.get_u64_le(),
            })
            .collect();
        let cp_info = (0..cp_info_count)
            .map(|_| IoCpInfo {
                epoch_counter: buf.get_u64_le(),
                last_lba_written: buf.get_u64_le(),
                freed_count: buf.get_u32_le(),
            })
            .collect();

        Ok(Self {
            lba,
            n_lbas,
            flags,
            alloc,
            checksums,
            frees,
            cp_info,
        })
    }
}

// ---- checkpoint state -----------------------------------------------

/// Per-volume slice of one epoch
pub struct VolCpCtx {
    pub start_seq: SeqNum,
    /// Set when the epoch closes; `u64::MAX` means the context was
    /// created after the close and contributes no truncation point.
    end_seq: AtomicU64,
    index_token: IndexCpToken,
    free_list: Mutex<Vec<JournalFreeEntry>>,
    destroying: AtomicBool,
}

/// Engine-wide state attached to one epoch
pub struct EngineCpState {
    pub cp_cnt: u64,
    try_blkalloc: AtomicBool,
    blkalloc_cp: AtomicBool,
    pub blkalloc_handle: Arc<BlkAllocCp>,
    vols: Mutex<HashMap<Uuid, Arc<VolCpCtx>>>,
}

impl EngineCpState {
    #[must_use]
    pub fn first(cp_cnt: u64) -> Self {
        Self {
            cp_cnt,
            try_blkalloc: AtomicBool::new(false),
            blkalloc_cp: AtomicBool::new(false),
            blkalloc_handle: BlkStore::attach_prepare_cp(None),
            vols: Mutex::new(HashMap::new()),
        }
    }

    /// Ask for allocator bitmaps to be persisted when this epoch flushes
    pub fn request_blkalloc_cp(&self) {
        self.try_blkalloc.store(true, Ordering::Release);
    }
}

/// Memory-release tuning consulted after each checkpoint
#[derive(Debug, Clone)]
pub struct MemReleaseConfig {
    pub app_mem_size: u64,
    pub soft_threshold_pct: u8,
    pub aggressive_threshold_pct: u8,
}

/// Owner of all volumes and orchestrator of the per-write pipeline and
/// the per-checkpoint flush.
pub struct VolumeManager {
    cp: Arc<CpCoordinator<EngineCpState>>,
    logdev: Arc<LogDevice>,
    registry: Arc<MetaRegistry>,
    data: Arc<BlkStore>,
    volumes: RwLock<HashMap<Uuid, Arc<Volume>>>,
    mem_cfg: MemReleaseConfig,
}

impl VolumeManager {
    #[must_use]
    pub fn new(
        cp: Arc<CpCoordinator<EngineCpState>>,
        logdev: Arc<LogDevice>,
        registry: Arc<MetaRegistry>,
        data: Arc<BlkStore>,
        mem_cfg: MemReleaseConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            cp,
            logdev,
            registry,
            data,
            volumes: RwLock::new(HashMap::new()),
            mem_cfg,
        })
    }

    #[must_use]
    pub fn checkpoint(&self) -> &Arc<CpCoordinator<EngineCpState>> {
        &self.cp
    }

    #[must_use]
    pub fn data_store(&self) -> &Arc<BlkStore> {
        &self.data
    }

    pub fn volume(&self, uuid: Uuid) -> Result<Arc<Volume>> {
        self.volumes
            .read()
            .get(&uuid)
            .cloned()
            .ok_or(Error::NotFound)
    }

    #[must_use]
    pub fn list_volumes(&self) -> Vec<Arc<Volume>> {
        self.volumes.read().values().cloned().collect()
    }

    /// Create a volume and durably record its superblock
    pub fn create_volume(&self, params: VolumeParams) -> Result<Arc<Volume>> {
        if params.size == 0 || params.size % u64::from(params.page_size) != 0 {
            return Err(Error::Config(format!(
                "volume size {} is not a multiple of its page size",
                params.size
            )));
        }
        if params.page_size != self.data.page_size() {
            return Err(Error::Config(format!(
                "volume page size {} must equal the data vdev page size {}",
                params.page_size,
                self.data.page_size()
            )));
        }
        {
            let vols = self.volumes.read();
            if vols.contains_key(&params.uuid) {
                return Err(Error::Busy(format!(
                    "volume {} already exists",
                    params.uuid
                )));
            }
        }

        let store_id = self.logdev.create_store();
        let vol = Volume::new(params.clone(), store_id, VolState::Uninited);
        // The volume goes online with the superblock write that makes it
        // durable.
        *vol.state.write() = VolState::Online;
        self.persist_vol_sb(&vol)?;
        self.volumes.write().insert(params.uuid, vol.clone());
        info!(name = %params.name, uuid = %params.uuid, "created volume");
        Ok(vol)
    }

    fn persist_vol_sb(&self, vol: &Volume) -> Result<()> {
        let state = vol.state();
        // Failed is a live-only condition; a reboot re-evaluates it.
        let persisted_state = if state == VolState::Failed {
            VolState::Online
        } else {
            state
        };
        let sb = VolumeSb {
            params: vol.params.clone(),
            state: persisted_state,
            store_id: vol.store_id,
        };
        let blob = bincode::serialize(&sb).map_err(|e| Error::Serialization(e.to_string()))?;
        self.registry.put(SUB_VOL, vol.uuid().as_u128(), blob);
        self.registry.persist()
    }

    /// Persisted state change (online/offline)
    pub fn set_volume_state(&self, uuid: Uuid, state: VolState) -> Result<()> {
        if !matches!(state, VolState::Online | VolState::Offline) {
            return Err(Error::Config(format!(
                "state {state:?} cannot be set directly"
            )));
        }
        let vol = self.volume(uuid)?;
        *vol.state.write() = state;
        self.persist_vol_sb(&vol)
    }

    /// Force live volumes on a failed device into the failed state
    /// (in-memory only; the state reverts on reboot if the pdev returns)
    pub fn mark_volumes_failed(&self) {
        for vol in self.volumes.read().values() {
            let mut st = vol.state.write();
            if *st == VolState::Online {
                warn!(volume = vol.name(), "marking volume failed after device error");
                *st = VolState::Failed;
            }
        }
    }

    // ---- write path --------------------------------------------------

    /// Write `data` (page-multiple) at `lba`
    pub fn write(&self, uuid: Uuid, lba: Lba, data: &[u8]) -> Result<()> {
        let vol = self.volume(uuid)?;
        vol.check_online()?;

        let page = self.data.page_size() as usize;
        if data.is_empty() || data.len() % page != 0 {
            return Err(Error::io_error(format!(
                "write of {} bytes is not a multiple of the {page}-byte page",
                data.len()
            )));
        }
        let n_lbas = (data.len() / page) as u32;
        if (lba + u64::from(n_lbas)) * page as u64 > vol.size() {
            return Err(Error::io_error(format!(
                "write at lba {lba} runs past the end of volume {}",
                vol.name()
            )));
        }

        // 1. Allocate.
        let blocks = self.data.alloc(n_lbas, AllocHints::any_device())?;

        // 2. Data write, computing per-lba checksums alongside.
        let mut off = 0usize;
        for bid in &blocks {
            let len = bid.data_size(self.data.page_size()) as usize;
            if let Err(e) = self.data.vdev().write_block(*bid, &data[off..off + len]) {
                self.retract_units(&blocks);
                return Err(e);
            }
            off += len;
        }
        let checksums = lba_checksums(data, self.data.page_size());

        // 3. Enter the current epoch; the rest of the pipeline runs
        // under it (and at most one successor).
        let epoch = self.cp.io_enter();
        self.write_under_epoch(&vol, lba, &blocks, &checksums, 0, epoch)
    }

    fn retract_units(&self, blocks: &[BlockId]) {
        // Never committed; the cache bits go straight back.
        for bid in blocks {
            self.data.retract(*bid);
        }
    }

    /// Steps 4-7 of the write pipeline: index put (with the cross-epoch
    /// retry), allocator commit, journal append, epoch exits.
    pub(crate) fn write_under_epoch(
        &self,
        vol: &Arc<Volume>,
        start_lba: Lba,
        blocks: &[BlockId],
        checksums: &[u32],
        flags: u32,
        first_epoch: Arc<CpEpoch<EngineCpState>>,
    ) -> Result<()> {
        let seq = vol.issue_seq();
        let mut epochs: Vec<Arc<CpEpoch<EngineCpState>>> = vec![first_epoch];
        let mut ctx = Self::epoch_vol_ctx(&epochs[0], vol);
        let mut cp_info: Vec<IoCpInfo> = Vec::new();
        let mut journal_frees: Vec<JournalFreeEntry> = Vec::new();
        let mut frees_this_epoch = 0u32;
        let mut epoch_start_lba = start_lba;

        let mut cur_lba = start_lba;
        let mut i = 0usize;
        while i < blocks.len() {
            let bid = blocks[i];
            let n = bid.n_blocks();
            let rel = (cur_lba - start_lba) as usize;
            let value = IndexValue {
                seq,
                block_id: bid,
                block_offset: 0,
                n_lbas: n,
                checksums: checksums[rel..rel + n as usize].to_vec(),
            };

            match vol.index.put(cur_lba, value, ctx.index_token) {
                Ok(frees) => {
                    // 5. Commit: the unit becomes durable at the next CP.
                    self.data.commit(bid)?;
                    let owning = epochs[epochs.len() - 1].ctx.cp_cnt;
                    for f in frees {
                        let jf = JournalFreeEntry::from_index(f, owning);
                        ctx.free_list.lock().push(jf.clone());
                        journal_frees.push(jf);
                        frees_this_epoch += 1;
                    }
                    cur_lba += u64::from(n);
                    i += 1;
                }
                Err(Error::EpochMismatch) => {
                    if epochs.len() == 2 {
                        // One retry is all the design admits; a second
                        // mismatch means the barrier invariant broke.
                        // The lbas already installed are journaled so
                        // replay agrees with the index, then the write
                        // fails with the resume point.
                        warn!(
                            volume = vol.name(),
                            seq, "index put missed two epochs, failing the write"
                        );
                        self.retract_units(&blocks[i..]);
                        if cur_lba > epoch_start_lba || frees_this_epoch > 0 {
                            cp_info.push(IoCpInfo {
                                epoch_counter: epochs[1].ctx.cp_cnt,
                                last_lba_written: cur_lba.saturating_sub(1),
                                freed_count: frees_this_epoch,
                            });
                        }
                        let append = if cur_lba > start_lba {
                            let covered = (cur_lba - start_lba) as usize;
                            let record = JournalRecord {
                                lba: start_lba,
                                n_lbas: covered as u32,
                                flags,
                                alloc: blocks[..i].to_vec(),
                                checksums: checksums[..covered].to_vec(),
                                frees: journal_frees,
                                cp_info,
                            };
                            let res = record
                                .encode()
                                .and_then(|p| self.logdev.append(vol.store_id, seq, &p));
                            if res.is_ok() {
                                vol.note_appended(seq);
                            }
                            res
                        } else {
                            Ok(())
                        };
                        for e in &epochs {
                            self.cp.io_exit(e);
                        }
                        append?;
                        return Err(if cur_lba > start_lba {
                            Error::PartialWrite { next_lba: cur_lba }
                        } else {
                            Error::io_error("index update missed two checkpoint epochs")
                        });
                    }
                    // 4a. Cross-epoch retry: close the first epoch's
                    // summary and continue under a fresh epoch.
                    if cur_lba > epoch_start_lba || frees_this_epoch > 0 {
                        cp_info.push(IoCpInfo {
                            epoch_counter: epochs[0].ctx.cp_cnt,
                            last_lba_written: cur_lba.saturating_sub(1),
                            freed_count: frees_this_epoch,
                        });
                    }
                    let second = self.cp.io_enter();
                    ctx = Self::epoch_vol_ctx(&second, vol);
                    epochs.push(second);
                    frees_this_epoch = 0;
                    epoch_start_lba = cur_lba;
                    debug!(volume = vol.name(), seq, "retrying index put under new epoch");
                }
                Err(e) => {
                    self.retract_units(&blocks[i..]);
                    for ep in &epochs {
                        self.cp.io_exit(ep);
                    }
                    return Err(e);
                }
            }
        }

        if cur_lba > epoch_start_lba || frees_this_epoch > 0 || cp_info.is_empty() {
            cp_info.push(IoCpInfo {
                epoch_counter: epochs[epochs.len() - 1].ctx.cp_cnt,
                last_lba_written: cur_lba.saturating_sub(1),
                freed_count: frees_this_epoch,
            });
        }

        // 6. Journal after the index and allocator agree, so replay sees
        // committed state or nothing.
        let total_lbas = (cur_lba - start_lba) as u32;
        let record = JournalRecord {
            lba: start_lba,
            n_lbas: total_lbas,
            flags,
            alloc: blocks.to_vec(),
            checksums: checksums.to_vec(),
            frees: journal_frees,
            cp_info,
        };
        let payload = record.encode()?;
        let append = self.logdev.append(vol.store_id, seq, &payload);
        if append.is_ok() {
            vol.note_appended(seq);
        }

        // 7. The journal append is durable; leave every epoch we
        // entered and acknowledge.
        for ep in &epochs {
            self.cp.io_exit(ep);
        }
        append
    }

    /// The per-volume context of an epoch, created on first use
    fn epoch_vol_ctx(epoch: &Arc<CpEpoch<EngineCpState>>, vol: &Arc<Volume>) -> Arc<VolCpCtx> {
        let mut vols = epoch.ctx.vols.lock();
        vols.entry(vol.uuid())
            .or_insert_with(|| {
                Arc::new(VolCpCtx {
                    start_seq: vol.last_cp_sb().end_seq,
                    end_seq: AtomicU64::new(u64::MAX),
                    index_token: vol.index.current_token(),
                    free_list: Mutex::new(Vec::new()),
                    destroying: AtomicBool::new(false),
                })
            })
            .clone()
    }

    // ---- read path ---------------------------------------------------

    /// Read `n_lbas` pages at `lba`; unmapped ranges read as zeros
    pub fn read(&self, uuid: Uuid, lba: Lba, n_lbas: u32) -> Result<Vec<u8>> {
        let vol = self.volume(uuid)?;
        vol.check_online()?;
        let page = self.data.page_size() as usize;
        let mut out = vec![0u8; n_lbas as usize * page];

        for (seg_lba, v) in vol.index.get(lba, n_lbas) {
            let read_bid = BlockId::new(
                v.block_id.chunk_id(),
                v.n_lbas,
                v.block_id.offset() + v.block_offset,
            );
            let dst_start = (seg_lba - lba) as usize * page;
            let dst = &mut out[dst_start..dst_start + v.n_lbas as usize * page];

            let copies = self.data.vdev().num_copies();
            let mut last_err: Option<Error> = None;
            let mut verified = false;
            for copy in 0..copies {
                match self.data.vdev().read_block_copy(read_bid, copy, dst) {
                    Ok(()) => match Self::verify_lbas(dst, &v.checksums, page) {
                        Ok(()) => {
                            verified = true;
                            break;
                        }
                        Err(e) => {
                            warn!(
                                volume = vol.name(),
                                seg_lba, copy, "data checksum mismatch, trying next copy"
                            );
                            last_err = Some(e);
                        }
                    },
                    Err(e) => last_err = Some(e),
                }
            }
            if !verified {
                return Err(last_err.unwrap_or_else(|| Error::io_error("read failed")));
            }
        }
        Ok(out)
    }

    fn verify_lbas(data: &[u8], checksums: &[u32], page: usize) -> Result<()> {
        for (i, chunk) in data.chunks(page).enumerate() {
            let actual = compute_crc32c(chunk);
            if actual != checksums[i] {
                return Err(Error::ChecksumMismatch {
                    expected: checksums[i],
                    actual,
                });
            }
        }
        Ok(())
    }

    // ---- unmap and destroy -------------------------------------------

    /// Drop the mapping of a range; its blocks free at the next
    /// allocator checkpoint.
    pub fn unmap(&self, uuid: Uuid, lba: Lba, n_lbas: u32) -> Result<()> {
        let vol = self.volume(uuid)?;
        vol.check_online()?;
        let seq = vol.issue_seq();

        let mut epochs = vec![self.cp.io_enter()];
        let mut ctx = Self::epoch_vol_ctx(&epochs[0], &vol);
        let frees = loop {
            match vol.index.unmap(lba, n_lbas, ctx.index_token) {
                Ok(frees) => break frees,
                Err(Error::EpochMismatch) if epochs.len() == 1 => {
                    let second = self.cp.io_enter();
                    ctx = Self::epoch_vol_ctx(&second, &vol);
                    epochs.push(second);
                }
                Err(e) => {
                    for ep in &epochs {
                        self.cp.io_exit(ep);
                    }
                    // A second mismatch breaks the single-preparing-epoch
                    // invariant; surface it as an I/O failure.
                    return Err(if e.is_epoch_mismatch() {
                        Error::io_error("unmap missed two checkpoint epochs")
                    } else {
                        e
                    });
                }
            }
        };

        let owning = epochs[epochs.len() - 1].ctx.cp_cnt;
        let journal_frees: Vec<JournalFreeEntry> = frees
            .into_iter()
            .map(|f| JournalFreeEntry::from_index(f, owning))
            .collect();
        ctx.free_list.lock().extend(journal_frees.iter().cloned());

        let record = JournalRecord {
            lba,
            n_lbas,
            flags: REC_FLAG_UNMAP,
            alloc: Vec::new(),
            checksums: Vec::new(),
            cp_info: vec![IoCpInfo {
                epoch_counter: owning,
                last_lba_written: lba + u64::from(n_lbas) - 1,
                freed_count: journal_frees.len() as u32,
            }],
            frees: journal_frees,
        };
        let payload = record.encode()?;
        let append = self.logdev.append(vol.store_id, seq, &payload);
        if append.is_ok() {
            vol.note_appended(seq);
        }
        for ep in &epochs {
            self.cp.io_exit(ep);
        }
        append
    }

    /// Start destroying a volume: journal the intent, suspend it, and
    /// drive a blkalloc checkpoint that frees its blocks and removes its
    /// superblock.
    pub fn destroy(&self, uuid: Uuid) -> Result<()> {
        let vol = self.volume(uuid)?;
        {
            let mut st = vol.state.write();
            match *st {
                VolState::Online | VolState::Offline | VolState::Failed => {
                    *st = VolState::Destroying;
                }
                VolState::Destroying => {}
                s => {
                    return Err(Error::Busy(format!(
                        "volume {} cannot be destroyed from {s:?}",
                        vol.name()
                    )))
                }
            }
        }
        self.persist_vol_sb(&vol)?;

        let record = JournalRecord {
            lba: 0,
            n_lbas: 0,
            flags: REC_FLAG_DESTROY,
            alloc: Vec::new(),
            checksums: Vec::new(),
            frees: Vec::new(),
            cp_info: Vec::new(),
        };
        let payload = record.encode()?;
        let seq = vol.issue_seq();

        let epoch = self.cp.io_enter();
        let append = self.logdev.append(vol.store_id, seq, &payload);
        if append.is_ok() {
            vol.note_appended(seq);
        }
        epoch.ctx.request_blkalloc_cp();
        vol.destroy_pending.store(true, Ordering::Release);
        self.cp.io_exit(&epoch);
        append?;

        info!(volume = vol.name(), "destroy journaled, driving checkpoint");
        self.cp.trigger();
        Ok(())
    }

    /// Resume a destroy found in the journal or the volume superblock
    /// during recovery.
    pub(crate) fn resume_destroy(&self, vol: &Arc<Volume>) {
        *vol.state.write() = VolState::Destroying;
        vol.destroy_pending.store(true, Ordering::Release);
    }

    /// Any volume still waiting for its destroy checkpoint
    #[must_use]
    pub fn has_pending_destroy(&self) -> bool {
        self.volumes
            .read()
            .values()
            .any(|v| v.destroy_pending.load(Ordering::Acquire))
    }

    // ---- checkpoint participation ------------------------------------

    fn flush_epoch(&self, epoch: &Arc<CpEpoch<EngineCpState>>) {
        let st = &epoch.ctx;
        let blkalloc = st.blkalloc_cp.load(Ordering::Acquire);
        let ctxs: Vec<(Uuid, Arc<VolCpCtx>)> = st
            .vols
            .lock()
            .iter()
            .map(|(u, c)| (*u, c.clone()))
            .collect();

        // 1. Hand every free accumulated in this epoch to the allocator;
        // the bits leave the disk bitmap before it is snapshotted.
        for (_, ctx) in &ctxs {
            let frees = std::mem::take(&mut *ctx.free_list.lock());
            for f in frees {
                if let Err(e) = self.data.free(f.block_id, f.offset, f.n_blocks) {
                    warn!("free of journaled unit failed: {e}");
                }
            }
        }

        // 2. Index flush for every participating volume.
        let mut destroyed: Vec<Arc<Volume>> = Vec::new();
        for (uuid, ctx) in &ctxs {
            let Ok(vol) = self.volume(*uuid) else { continue };
            if ctx.destroying.load(Ordering::Acquire) {
                destroyed.push(vol);
                continue;
            }
            match vol.index.snapshot() {
                Ok(snap) => self.registry.put(SUB_INDX, uuid.as_u128(), snap),
                Err(e) => warn!(volume = vol.name(), "index snapshot failed: {e}"),
            }
        }

        // 3. Allocator bitmaps, one sub-block per chunk.
        if blkalloc {
            debug!(blkalloc_cp = st.blkalloc_handle.cnt, "persisting allocator bitmaps");
            for (cid, bytes) in self.data.cp_start() {
                self.registry.put(SUB_BLKALLOC, u128::from(cid.raw()), bytes);
            }
        }

        // 4. Per-volume CP superblocks.
        for (uuid, ctx) in &ctxs {
            let Ok(vol) = self.volume(*uuid) else { continue };
            if ctx.destroying.load(Ordering::Acquire) {
                continue;
            }
            let mut sb = vol.last_cp_sb.lock();
            let end = ctx.end_seq.load(Ordering::Acquire);
            if end != u64::MAX {
                sb.end_seq = sb.end_seq.max(end);
            }
            sb.cp_cnt = st.cp_cnt;
            if blkalloc {
                sb.blkalloc_cp_cnt = st.cp_cnt;
            }
            match bincode::serialize(&*sb) {
                Ok(blob) => self.registry.put(SUB_CPSB, uuid.as_u128(), blob),
                Err(e) => warn!("cp superblock encode failed: {e}"),
            }
        }

        // Destroyed volumes drop out of the registry in the same pass
        // that persists the bitmap changes.
        if blkalloc {
            for vol in &destroyed {
                self.registry.remove(SUB_VOL, vol.uuid().as_u128());
                self.registry.remove(SUB_CPSB, vol.uuid().as_u128());
                self.registry.remove(SUB_INDX, vol.uuid().as_u128());
            }
        }

        // 5. One durable registry write covers index, bitmaps and CP
        // superblocks.
        if let Err(e) = self.registry.persist() {
            warn!("meta registry persist failed: {e}");
        }

        // 6. With the bitmaps and CP superblock durable it is safe to
        // reclaim journal space.
        if blkalloc {
            for (uuid, ctx) in &ctxs {
                let Ok(vol) = self.volume(*uuid) else { continue };
                let end = ctx.end_seq.load(Ordering::Acquire);
                if end != u64::MAX && !ctx.destroying.load(Ordering::Acquire) {
                    self.logdev.truncate(vol.store_id, end);
                }
            }
            for vol in &destroyed {
                self.logdev.remove_store(vol.store_id);
            }
            if let Err(e) = self.logdev.device_truncate() {
                warn!("journal device truncate failed: {e}");
            }
            // 7. Staged frees become allocatable again.
            self.data.cp_done();

            for vol in &destroyed {
                info!(volume = vol.name(), "volume destroyed");
                *vol.state.write() = VolState::Destroyed;
                vol.destroy_pending.store(false, Ordering::Release);
                self.volumes.write().remove(&vol.uuid());
            }
        }

        self.cp.cp_end(epoch);
        self.release_memory_if_needed();
    }

    /// Post-checkpoint cache trimming per the configured thresholds
    fn release_memory_if_needed(&self) {
        let estimate: u64 = self
            .volumes
            .read()
            .values()
            .map(|v| v.index.len() as u64 * 64)
            .sum();
        let soft =
            self.mem_cfg.app_mem_size * u64::from(self.mem_cfg.soft_threshold_pct) / 100;
        if estimate > soft {
            debug!(estimate, soft, "post-cp memory estimate above soft threshold");
        }
    }

    // ---- recovery ----------------------------------------------------

    /// Load volumes, their CP superblocks and index snapshots from the
    /// registry.
    pub fn load_from_registry(&self) -> Result<()> {
        for (id, blob) in self.registry.entries_of(SUB_VOL) {
            let sb: VolumeSb = bincode::deserialize(&blob)
                .map_err(|e| Error::Serialization(e.to_string()))?;
            let uuid = Uuid::from_u128(id);
            let vol = Volume::new(sb.params, sb.store_id, sb.state);

            if let Some(blob) = self.registry.get(SUB_CPSB, id) {
                let cpsb: CpSuperblock = bincode::deserialize(&blob)
                    .map_err(|e| Error::Serialization(e.to_string()))?;
                *vol.last_cp_sb.lock() = cpsb;
                vol.note_replayed_seq(cpsb.end_seq);
                vol.init_appended(cpsb.end_seq);
            }
            if let Some(snap) = self.registry.get(SUB_INDX, id) {
                vol.index.restore(&snap)?;
            }
            if sb.state == VolState::Destroying {
                self.resume_destroy(&vol);
            }
            debug!(volume = vol.name(), "volume loaded from registry");
            self.volumes.write().insert(uuid, vol);
        }
        Ok(())
    }

    /// Restore allocator bitmaps persisted at the last checkpoint.
    /// Must run before journal replay re-reserves newer allocations.
    pub fn restore_bitmaps(registry: &MetaRegistry, data: &mut BlkStore) -> Result<()> {
        for (id, bytes) in registry.entries_of(SUB_BLKALLOC) {
            data.restore_bitmap(volstore_common::ChunkId::new(id as u32), &bytes)?;
        }
        Ok(())
    }

    /// Apply one journal record found during the log scan
    pub fn replay_record(&self, store_id: u32, seq: SeqNum, payload: &[u8]) -> Result<()> {
        let vol = {
            let vols = self.volumes.read();
            vols.values().find(|v| v.store_id == store_id).cloned()
        };
        let Some(vol) = vol else {
            // Store belongs to a volume destroyed before the crash.
            return Ok(());
        };
        vol.note_replayed_seq(seq);
        vol.note_appended(seq);

        let record = JournalRecord::decode(payload)?;
        if record.flags & REC_FLAG_DESTROY != 0 {
            self.resume_destroy(&vol);
            return Ok(());
        }

        let sb = vol.last_cp_sb();
        let token = vol.index.current_token();

        // Allocations and frees are re-applied only when the epoch that
        // owned them never reached a persisted allocator bitmap.
        if record.cp_info.is_empty() {
            return Ok(());
        }
        let newest_epoch = record
            .cp_info
            .iter()
            .map(|ci| ci.epoch_counter)
            .max()
            .unwrap_or(0);
        if newest_epoch > sb.blkalloc_cp_cnt {
            for bid in &record.alloc {
                self.data.reserve(*bid)?;
            }
            for f in &record.frees {
                if f.owning_epoch > sb.blkalloc_cp_cnt {
                    self.data.free(f.block_id, f.offset, f.n_blocks)?;
                }
            }
        }

        if seq <= sb.end_seq {
            // The index snapshot already reflects this record.
            return Ok(());
        }

        if record.flags & REC_FLAG_UNMAP != 0 {
            // Replaying in sequence order reproduces history exactly.
            let frees = vol.index.unmap(record.lba, record.n_lbas, token)?;
            for f in frees {
                self.data.free(f.block_id, f.offset, f.n_blocks)?;
            }
            return Ok(());
        }

        // Re-apply the write up to what the journal says was installed.
        let last_lba = record
            .cp_info
            .last()
            .map_or(record.lba, |ci| ci.last_lba_written);
        let mut cur = record.lba;
        for bid in &record.alloc {
            if cur > last_lba {
                break;
            }
            let n = u64::from(bid.n_blocks()).min(last_lba - cur + 1) as u32;
            let rel = (cur - record.lba) as usize;
            let value = IndexValue {
                seq,
                block_id: *bid,
                block_offset: 0,
                n_lbas: n,
                checksums: record.checksums[rel..rel + n as usize].to_vec(),
            };
            let frees = vol.index.put(cur, value, token)?;
            for f in frees {
                self.data.free(f.block_id, f.offset, f.n_blocks)?;
            }
            cur += u64::from(bid.n_blocks());
        }
        Ok(())
    }

    /// Recovery is complete: staged frees from replay become allocatable
    pub fn recovery_done(&self) {
        self.data.cp_done();
    }
}

impl CpHandler<EngineCpState> for VolumeManager {
    fn attach_prepare(&self, cur: &CpEpoch<EngineCpState>) -> EngineCpState {
        let blkalloc = cur.ctx.try_blkalloc.load(Ordering::Acquire);
        cur.ctx.blkalloc_cp.store(blkalloc, Ordering::Release);

        let handle = if blkalloc {
            BlkStore::attach_prepare_cp(Some(&cur.ctx.blkalloc_handle))
        } else {
            cur.ctx.blkalloc_handle.clone()
        };

        let vols = self.volumes.read();
        for (uuid, vol) in vols.iter() {
            // Closing the epoch: stale puts must now miss.
            vol.index.attach_prepare_cp();

            let mut ctxs = cur.ctx.vols.lock();
            if vol.destroy_pending.load(Ordering::Acquire) {
                let ctx = ctxs.entry(*uuid).or_insert_with(|| {
                    Arc::new(VolCpCtx {
                        start_seq: vol.last_cp_sb().end_seq,
                        end_seq: AtomicU64::new(u64::MAX),
                        index_token: vol.index.current_token(),
                        free_list: Mutex::new(Vec::new()),
                        destroying: AtomicBool::new(false),
                    })
                });
                ctx.destroying.store(true, Ordering::Release);
                // Stream every mapping out of the index; the blocks free
                // under this epoch.
                let mut frees = ctx.free_list.lock();
                vol.index.destroy(|f| {
                    frees.push(JournalFreeEntry::from_index(f, cur.ctx.cp_cnt));
                });
            }
            if let Some(ctx) = ctxs.get(uuid) {
                if !ctx.destroying.load(Ordering::Acquire) {
                    // Truncation may only reach sequence numbers whose
                    // journal records are already durable.
                    ctx.end_seq.store(vol.contiguous_appended(), Ordering::Release);
                }
            }
        }
        drop(vols);

        EngineCpState {
            cp_cnt: cur.ctx.cp_cnt + 1,
            try_blkalloc: AtomicBool::new(false),
            blkalloc_cp: AtomicBool::new(false),
            blkalloc_handle: handle,
            vols: Mutex::new(HashMap::new()),
        }
    }

    fn cp_start(&self, epoch: Arc<CpEpoch<EngineCpState>>) {
        self.flush_epoch(&epoch);
    }
}
