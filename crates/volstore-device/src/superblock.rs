//! Per-device superblock and the fixed on-disk layout.
//!
//! Each pdev carries two independent superblock slots right after a
//! reserved 4 KiB prefix. A DM-info write goes to the inactive slot and,
//! once durable, advances `current_slot`; a torn write therefore always
//! leaves the previous slot intact. Recovery parses both slots and picks
//! the one with the larger generation whose checksum verifies, breaking
//! ties with the `current_slot` field.
//!
//! ```text
//! offset 0                      : reserved zero (4 KiB)
//! offset 4096                   : superblock slot 0 (atomic-page-sized)
//! offset 4096 + atomic_page     : superblock slot 1
//! next phys-page boundary       : DM-info copy 0
//! + dm_info_size                : DM-info copy 1
//! next phys-page boundary       : user chunks
//! ```

use bytes::{Buf, BufMut};
use uuid::Uuid;
use volstore_common::checksum::compute_crc32c;
use volstore_common::types::{round_up, FORMAT_VERSION, MAGIC, SB_PAYLOAD_OFFSET};
use volstore_common::{Error, Result};

/// Name stamped into every superblock
pub const PRODUCT_NAME: &[u8; 8] = b"volstore";

/// Fixed per-device geometry shared by every on-disk structure
#[derive(Debug, Clone, Copy)]
pub struct DeviceLayout {
    pub atomic_page_size: u32,
    pub phys_page_size: u32,
    /// Size of one DM-info copy, rounded up to the physical page size
    pub dm_info_size: u64,
}

impl DeviceLayout {
    #[must_use]
    pub fn new(atomic_page_size: u32, phys_page_size: u32, raw_dm_info_size: u64) -> Self {
        Self {
            atomic_page_size,
            phys_page_size,
            dm_info_size: round_up(raw_dm_info_size, u64::from(phys_page_size)),
        }
    }

    /// Offset of superblock slot 0 or 1
    #[must_use]
    pub fn sb_slot_offset(&self, slot: u32) -> u64 {
        SB_PAYLOAD_OFFSET + u64::from(slot) * u64::from(self.atomic_page_size)
    }

    /// Offset of DM-info copy 0 or 1
    #[must_use]
    pub fn dm_copy_offset(&self, copy: u32) -> u64 {
        let after_slots = SB_PAYLOAD_OFFSET + 2 * u64::from(self.atomic_page_size);
        round_up(after_slots, u64::from(self.phys_page_size)) + u64::from(copy) * self.dm_info_size
    }

    /// First byte available for user chunks
    #[must_use]
    pub fn first_usable_offset(&self) -> u64 {
        round_up(
            self.dm_copy_offset(1) + self.dm_info_size,
            u64::from(self.phys_page_size),
        )
    }
}

/// On-disk reference to one DM-info copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmCopyRef {
    pub start_offset: u64,
    pub size: u64,
}

/// Per-device superblock, one instance per slot
#[derive(Debug, Clone)]
pub struct Superblock {
    pub magic: u64,
    pub version: u32,
    pub gen: u64,
    pub product: [u8; 8],
    /// Which slot is authoritative (0 or 1)
    pub current_slot: u32,
    pub dev_id: u32,
    pub dev_offset: u64,
    pub first_chunk_id: u32,
    pub dm_copies: [DmCopyRef; 2],
    pub system_uuid: Uuid,
    pub checksum: u32,
}

impl Superblock {
    /// Serialized size; must stay within one atomic page
    pub const SIZE: usize = 8 + 4 + 8 + 8 + 4 + 4 + 8 + 4 + 2 * 16 + 16 + 4;

    const CHECKSUM_OFFSET: usize = Self::SIZE - 4;

    #[must_use]
    pub fn new(dev_id: u32, dev_offset: u64, system_uuid: Uuid, layout: &DeviceLayout) -> Self {
        let mut sb = Self {
            magic: MAGIC,
            version: FORMAT_VERSION,
            gen: 0,
            product: *PRODUCT_NAME,
            current_slot: 0,
            dev_id,
            dev_offset,
            first_chunk_id: u32::MAX,
            dm_copies: [
                DmCopyRef {
                    start_offset: layout.dm_copy_offset(0),
                    size: layout.dm_info_size,
                },
                DmCopyRef {
                    start_offset: layout.dm_copy_offset(1),
                    size: layout.dm_info_size,
                },
            ],
            system_uuid,
            checksum: 0,
        };
        sb.checksum = sb.compute_checksum();
        sb
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.put_u64_le(self.magic);
        buf.put_u32_le(self.version);
        buf.put_u64_le(self.gen);
        buf.put_slice(&self.product);
        buf.put_u32_le(self.current_slot);
        buf.put_u32_le(self.dev_id);
        buf.put_u64_le(self.dev_offset);
        buf.put_u32_le(self.first_chunk_id);
        for c in &self.dm_copies {
            buf.put_u64_le(c.start_offset);
            buf.put_u64_le(c.size);
        }
        buf.put_slice(self.system_uuid.as_bytes());
        buf.put_u32_le(self.checksum);
        debug_assert_eq!(buf.len(), Self::SIZE);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(Error::io_error("superblock slot too small"));
        }
        let mut buf = &data[..Self::SIZE];

        let magic = buf.get_u64_le();
        if magic != MAGIC {
            return Err(Error::io_error("superblock magic mismatch"));
        }
        let version = buf.get_u32_le();
        if version != FORMAT_VERSION {
            return Err(Error::io_error(format!(
                "unsupported superblock version {version}"
            )));
        }
        let gen = buf.get_u64_le();
        let mut product = [0u8; 8];
        buf.copy_to_slice(&mut product);
        let current_slot = buf.get_u32_le();
        let dev_id = buf.get_u32_le();
        let dev_offset = buf.get_u64_le();
        let first_chunk_id = buf.get_u32_le();
        let mut dm_copies = [DmCopyRef {
            start_offset: 0,
            size: 0,
        }; 2];
        for c in &mut dm_copies {
            c.start_offset = buf.get_u64_le();
            c.size = buf.get_u64_le();
        }
        let mut uuid_bytes = [0u8; 16];
        buf.copy_to_slice(&mut uuid_bytes);
        let system_uuid = Uuid::from_bytes(uuid_bytes);
        let checksum = buf.get_u32_le();

        let sb = Self {
            magic,
            version,
            gen,
            product,
            current_slot,
            dev_id,
            dev_offset,
            first_chunk_id,
            dm_copies,
            system_uuid,
            checksum,
        };
        let computed = sb.compute_checksum();
        if computed != checksum {
            return Err(Error::ChecksumMismatch {
                expected: checksum,
                actual: computed,
            });
        }
        Ok(sb)
    }

    fn compute_checksum(&self) -> u32 {
        let mut clone = self.clone();
        clone.checksum = 0;
        let bytes = clone.to_bytes();
        compute_crc32c(&bytes[..Self::CHECKSUM_OFFSET])
    }

    /// Recompute the checksum after mutating fields
    pub fn seal(&mut self) {
        self.checksum = self.compute_checksum();
    }

    /// Pick the authoritative slot among the parsed candidates.
    /// Higher generation wins; on a tie the slot that `current_slot`
    /// points at wins.
    #[must_use]
    pub fn select(slot0: Option<Superblock>, slot1: Option<Superblock>) -> Option<Superblock> {
        match (slot0, slot1) {
            (Some(a), Some(b)) => {
                if a.gen > b.gen {
                    Some(a)
                } else if b.gen > a.gen {
                    Some(b)
                } else if a.current_slot == 0 {
                    Some(a)
                } else {
                    Some(b)
                }
            }
            (a, b) => a.or(b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> DeviceLayout {
        DeviceLayout::new(4096, 4096, 70000)
    }

    #[test]
    fn test_layout_offsets() {
        let l = layout();
        assert_eq!(l.dm_info_size, 70000_u64.div_ceil(4096) * 4096);
        assert_eq!(l.sb_slot_offset(0), 4096);
        assert_eq!(l.sb_slot_offset(1), 8192);
        assert_eq!(l.dm_copy_offset(0), 12288);
        assert_eq!(l.dm_copy_offset(1), 12288 + l.dm_info_size);
        assert_eq!(l.first_usable_offset() % 4096, 0);
    }

    #[test]
    fn test_superblock_roundtrip() {
        let sb = Superblock::new(2, 128 << 30, Uuid::new_v4(), &layout());
        let parsed = Superblock::from_bytes(&sb.to_bytes()).unwrap();
        assert_eq!(parsed.dev_id, 2);
        assert_eq!(parsed.dev_offset, 128 << 30);
        assert_eq!(parsed.system_uuid, sb.system_uuid);
        assert_eq!(parsed.dm_copies, sb.dm_copies);
    }

    #[test]
    fn test_superblock_rejects_corruption() {
        let sb = Superblock::new(0, 0, Uuid::new_v4(), &layout());
        let mut bytes = sb.to_bytes();
        bytes[20] ^= 0xFF;
        assert!(Superblock::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_select_prefers_higher_generation() {
        let l = layout();
        let mut a = Superblock::new(0, 0, Uuid::new_v4(), &l);
        let mut b = a.clone();
        a.gen = 3;
        a.seal();
        b.gen = 5;
        b.seal();
        assert_eq!(Superblock::select(Some(a), Some(b)).unwrap().gen, 5);
    }

    #[test]
    fn test_select_tie_uses_current_slot() {
        let l = layout();
        let mut a = Superblock::new(0, 0, Uuid::new_v4(), &l);
        a.gen = 7;
        a.current_slot = 1;
        a.seal();
        let b = a.clone();
        // Both say slot 1 is authoritative; slot 1's copy wins the tie.
        let winner = Superblock::select(Some(a), Some(b.clone())).unwrap();
        assert_eq!(winner.gen, b.gen);
    }

    #[test]
    fn test_select_survives_one_zeroed_slot() {
        let l = layout();
        let sb = Superblock::new(1, 0, Uuid::new_v4(), &l);
        assert!(Superblock::select(None, Some(sb.clone())).is_some());
        assert!(Superblock::select(Some(sb), None).is_some());
        assert!(Superblock::select(None, None).is_none());
    }
}
