//! Per-volume extent index.
//!
//! An ordered map from logical block ranges to
//! `{seq, block unit, offset, per-lba checksums}`. Entries never overlap;
//! a put splits whatever it lands on at the range boundaries. The
//! sequence-number policy makes journal replay idempotent: where an
//! existing entry carries `seq >= new.seq` the existing mapping wins and
//! the new physical blocks are handed back as frees (unless they are the
//! very same blocks, which is the replay-of-applied-record case).
//!
//! Every put validates its checkpoint token; a put carrying a token from
//! a closed epoch fails with `EpochMismatch` so the caller can retry
//! under the new epoch.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use volstore_common::{BlockId, Error, Lba, Result, SeqNum};

/// One stored mapping: `n_lbas` logical blocks backed by part of a block
/// unit, starting `block_offset` blocks into it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexValue {
    pub seq: SeqNum,
    pub block_id: BlockId,
    pub block_offset: u32,
    pub n_lbas: u32,
    pub checksums: Vec<u32>,
}

impl IndexValue {
    /// The sub-value covering `n` lbas starting `rel` lbas into this one
    fn slice(&self, rel: u32, n: u32) -> Self {
        debug_assert!(rel + n <= self.n_lbas);
        Self {
            seq: self.seq,
            block_id: self.block_id,
            block_offset: self.block_offset + rel,
            n_lbas: n,
            checksums: self.checksums[rel as usize..(rel + n) as usize].to_vec(),
        }
    }
}

/// Physical blocks released by an overwrite, unmap or destroy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeBlockEntry {
    pub block_id: BlockId,
    /// Blocks into the unit
    pub offset: u32,
    pub n_blocks: u32,
}

/// Token tying an index operation to the checkpoint it entered under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexCpToken {
    cp: u64,
}

/// Extent map of one volume
pub struct ExtentIndex {
    tree: RwLock<BTreeMap<Lba, IndexValue>>,
    cp_seq: AtomicU64,
}

impl Default for ExtentIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtentIndex {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tree: RwLock::new(BTreeMap::new()),
            cp_seq: AtomicU64::new(0),
        }
    }

    /// Token for operations entering under the current checkpoint
    #[must_use]
    pub fn current_token(&self) -> IndexCpToken {
        IndexCpToken {
            cp: self.cp_seq.load(Ordering::Acquire),
        }
    }

    /// Advance the index to the next checkpoint; in-flight puts holding
    /// the old token will fail with `EpochMismatch`.
    pub fn attach_prepare_cp(&self) -> IndexCpToken {
        IndexCpToken {
            cp: self.cp_seq.fetch_add(1, Ordering::AcqRel) + 1,
        }
    }

    fn check_token(&self, token: IndexCpToken) -> Result<()> {
        if token.cp != self.cp_seq.load(Ordering::Acquire) {
            return Err(Error::EpochMismatch);
        }
        Ok(())
    }

    /// Entries overlapping `[start, start + n_lbas)`, clipped to the
    /// range, in key order.
    #[must_use]
    pub fn get(&self, start: Lba, n_lbas: u32) -> Vec<(Lba, IndexValue)> {
        let end = start + u64::from(n_lbas); // exclusive
        let tree = self.tree.read();
        let mut out = Vec::new();

        // The entry at or before `start` may reach into the range.
        let from = tree
            .range(..=start)
            .next_back()
            .map_or(start, |(s, _)| *s);
        for (&e_start, v) in tree.range(from..end) {
            let e_end = e_start + u64::from(v.n_lbas);
            if e_end <= start {
                continue;
            }
            let clip_start = e_start.max(start);
            let clip_end = e_end.min(end);
            let rel = (clip_start - e_start) as u32;
            let n = (clip_end - clip_start) as u32;
            out.push((clip_start, v.slice(rel, n)));
        }
        out
    }

    /// Range put under a checkpoint token. Returns the physical blocks
    /// released by the operation: older overwritten mappings, plus the
    /// new blocks themselves wherever an existing higher-seq mapping
    /// won.
    pub fn put(
        &self,
        start: Lba,
        value: IndexValue,
        token: IndexCpToken,
    ) -> Result<Vec<FreeBlockEntry>> {
        self.check_token(token)?;
        debug_assert_eq!(value.n_lbas as usize, value.checksums.len());

        let end = start + u64::from(value.n_lbas); // exclusive
        let mut tree = self.tree.write();
        let mut frees = Vec::new();

        let overlapping = Self::take_overlapping(&mut tree, start, end);

        // Sub-ranges of the new range that an existing mapping keeps.
        let mut kept: Vec<(Lba, Lba)> = Vec::new();

        for (e_start, e_val) in overlapping {
            let e_end = e_start + u64::from(e_val.n_lbas);
            let ov_start = e_start.max(start);
            let ov_end = e_end.min(end);

            if e_start < ov_start {
                tree.insert(e_start, e_val.slice(0, (ov_start - e_start) as u32));
            }
            if e_end > ov_end {
                let rel = (ov_end - e_start) as u32;
                tree.insert(ov_end, e_val.slice(rel, (e_end - ov_end) as u32));
            }

            let rel = (ov_start - e_start) as u32;
            let n = (ov_end - ov_start) as u32;
            let middle = e_val.slice(rel, n);

            if e_val.seq >= value.seq {
                // Existing mapping wins; keep it and release the new
                // blocks for this sub-range, except when they are the
                // same blocks (replay of an applied record).
                let same = e_val.seq == value.seq && e_val.block_id == value.block_id;
                tree.insert(ov_start, middle);
                kept.push((ov_start, ov_end));
                if !same {
                    let new_rel = (ov_start - start) as u32;
                    frees.push(FreeBlockEntry {
                        block_id: value.block_id,
                        offset: value.block_offset + new_rel,
                        n_blocks: n,
                    });
                }
            } else {
                frees.push(FreeBlockEntry {
                    block_id: middle.block_id,
                    offset: middle.block_offset,
                    n_blocks: middle.n_lbas,
                });
            }
        }

        // Install the new value over whatever the existing mappings did
        // not keep.
        kept.sort_unstable();
        let mut cursor = start;
        for (k_start, k_end) in kept.iter().chain(std::iter::once(&(end, end))) {
            if cursor < *k_start {
                let rel = (cursor - start) as u32;
                let n = (*k_start - cursor) as u32;
                tree.insert(cursor, value.slice(rel, n));
            }
            cursor = (*k_end).max(cursor);
        }

        Ok(frees)
    }

    /// Remove every mapping overlapping the range, returning the released
    /// blocks.
    pub fn unmap(
        &self,
        start: Lba,
        n_lbas: u32,
        token: IndexCpToken,
    ) -> Result<Vec<FreeBlockEntry>> {
        self.check_token(token)?;
        let end = start + u64::from(n_lbas);
        let mut tree = self.tree.write();
        let mut frees = Vec::new();

        for (e_start, e_val) in Self::take_overlapping(&mut tree, start, end) {
            let e_end = e_start + u64::from(e_val.n_lbas);
            let ov_start = e_start.max(start);
            let ov_end = e_end.min(end);

            if e_start < ov_start {
                tree.insert(e_start, e_val.slice(0, (ov_start - e_start) as u32));
            }
            if e_end > ov_end {
                let rel = (ov_end - e_start) as u32;
                tree.insert(ov_end, e_val.slice(rel, (e_end - ov_end) as u32));
            }
            let middle = e_val.slice((ov_start - e_start) as u32, (ov_end - ov_start) as u32);
            frees.push(FreeBlockEntry {
                block_id: middle.block_id,
                offset: middle.block_offset,
                n_blocks: middle.n_lbas,
            });
        }
        Ok(frees)
    }

    fn take_overlapping(
        tree: &mut BTreeMap<Lba, IndexValue>,
        start: Lba,
        end: Lba,
    ) -> Vec<(Lba, IndexValue)> {
        let from = tree
            .range(..=start)
            .next_back()
            .map_or(start, |(s, _)| *s);
        let keys: Vec<Lba> = tree
            .range(from..end)
            .filter(|(s, v)| **s + u64::from(v.n_lbas) > start)
            .map(|(s, _)| *s)
            .collect();
        keys.into_iter()
            .filter_map(|k| tree.remove(&k).map(|v| (k, v)))
            .collect()
    }

    /// Walk every stored value out of the index, handing each to the
    /// callback so its blocks can be freed. Idempotent: a second call
    /// sees an empty index.
    pub fn destroy(&self, mut free_cb: impl FnMut(FreeBlockEntry)) {
        let drained = std::mem::take(&mut *self.tree.write());
        for v in drained.into_values() {
            free_cb(FreeBlockEntry {
                block_id: v.block_id,
                offset: v.block_offset,
                n_blocks: v.n_lbas,
            });
        }
    }

    /// Highest sequence number stored for any mapping in the range
    #[must_use]
    pub fn max_seq_in_range(&self, start: Lba, n_lbas: u32) -> Option<SeqNum> {
        self.get(start, n_lbas).iter().map(|(_, v)| v.seq).max()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tree.read().is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tree.read().len()
    }

    /// Serialize the whole map for the per-CP snapshot
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        let tree = self.tree.read();
        let entries: Vec<(Lba, IndexValue)> =
            tree.iter().map(|(k, v)| (*k, v.clone())).collect();
        bincode::serialize(&entries).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Replace the map with a persisted snapshot
    pub fn restore(&self, bytes: &[u8]) -> Result<()> {
        let entries: Vec<(Lba, IndexValue)> =
            bincode::deserialize(bytes).map_err(|e| Error::Serialization(e.to_string()))?;
        let mut tree = self.tree.write();
        tree.clear();
        for (k, v) in entries {
            tree.insert(k, v);
        }
        Ok(())
    }
}
