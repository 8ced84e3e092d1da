//! Core identifier types and design constants.
//!
//! The three dense ids (`PdevId`, `ChunkId`, `VdevId`) index the device
//! manager's arrays; `u32::MAX` is the invalid sentinel for each. `BlockId`
//! packs a chunk id, a block count and a page offset into 48 bits of a
//! `u64`, which bounds the system at 256 chunks and 256 blocks per
//! allocation unit.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Magic value carried in the first bytes of every major on-disk record
pub const MAGIC: u64 = 0xCEED_DEEB;

/// Current on-disk format version (superblock and DM-info)
pub const FORMAT_VERSION: u32 = 1;

/// Offset of the superblock payload within a pdev; the first 4 KiB stay zero
pub const SB_PAYLOAD_OFFSET: u64 = 4096;

/// Maximum number of physical devices
pub const MAX_PDEVS: usize = 8;

/// Maximum number of chunks across the system
pub const MAX_CHUNKS: usize = 128;

/// Maximum number of virtual devices
pub const MAX_VDEVS: usize = 16;

/// Blocks covered by one allocator portion lock
pub const BLOCKS_PER_PORTION: u64 = 1024;

/// Segments a chunk is divided into for allocation sweeps
pub const SEGMENTS_PER_CHUNK: u64 = 8;

/// Smallest I/O unit the engine supports
pub const MIN_IO_SIZE: u32 = 4096;

/// A vdev descriptor (header plus opaque context) is exactly this size
pub const VDEV_INFO_BLOCK_SIZE: usize = 4096;

/// Fixed header portion of a vdev descriptor
pub const VDEV_INFO_HEADER_SIZE: usize = 512;

/// Opaque per-subsystem bytes carried in a vdev descriptor
pub const VDEV_CONTEXT_DATA_SIZE: usize = VDEV_INFO_BLOCK_SIZE - VDEV_INFO_HEADER_SIZE;

/// Largest number of blocks one `BlockId` can describe
pub const MAX_BLKS_PER_UNIT: u32 = 256;

/// Logical block address within a volume
pub type Lba = u64;

/// Monotonic per-store sequence number
pub type SeqNum = u64;

macro_rules! dense_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        pub struct $name(u32);

        impl $name {
            /// Sentinel for "no such id"
            pub const INVALID: $name = $name(u32::MAX);

            #[must_use]
            pub const fn new(raw: u32) -> Self {
                Self(raw)
            }

            #[must_use]
            pub const fn raw(self) -> u32 {
                self.0
            }

            /// Index into the owning arena
            #[must_use]
            pub const fn index(self) -> usize {
                self.0 as usize
            }

            #[must_use]
            pub const fn is_valid(self) -> bool {
                self.0 != u32::MAX
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.is_valid() {
                    write!(f, concat!(stringify!($name), "({})"), self.0)
                } else {
                    write!(f, concat!(stringify!($name), "(invalid)"))
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.is_valid() {
                    write!(f, "{}", self.0)
                } else {
                    write!(f, "invalid")
                }
            }
        }
    };
}

dense_id!(
    /// Index of a physical device in the device manager
    PdevId
);
dense_id!(
    /// Index of a chunk in the device manager's chunk table
    ChunkId
);
dense_id!(
    /// Index of a virtual device in the device manager
    VdevId
);

/// Globally unique id of a contiguous extent inside one chunk.
///
/// Packed layout (low to high): `offset : 32`, `n_blocks : 8`, `chunk : 8`.
/// The block count is stored biased by one so a unit can span the full
/// 1..=256 range.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockId(u64);

impl BlockId {
    /// Encoded size on disk
    pub const SIZE: usize = 8;

    /// Create a block id for `n_blocks` (1..=256) blocks starting at page
    /// `offset` within `chunk`.
    #[must_use]
    pub fn new(chunk: ChunkId, n_blocks: u32, offset: u32) -> Self {
        debug_assert!(chunk.raw() < MAX_CHUNKS as u32);
        debug_assert!((1..=MAX_BLKS_PER_UNIT).contains(&n_blocks));
        let packed = (u64::from(chunk.raw() & 0xFF) << 40)
            | (u64::from((n_blocks - 1) & 0xFF) << 32)
            | u64::from(offset);
        Self(packed)
    }

    #[must_use]
    pub const fn chunk_id(self) -> ChunkId {
        ChunkId::new(((self.0 >> 40) & 0xFF) as u32)
    }

    /// Number of blocks in this unit (1..=256)
    #[must_use]
    pub const fn n_blocks(self) -> u32 {
        (((self.0 >> 32) & 0xFF) as u32) + 1
    }

    /// Page offset of the first block within the chunk
    #[must_use]
    pub const fn offset(self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }

    /// Bytes covered by this unit for the given page size
    #[must_use]
    pub const fn data_size(self, page_size: u32) -> u64 {
        self.n_blocks() as u64 * page_size as u64
    }

    #[must_use]
    pub const fn to_raw(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BlockId(chunk={}, n={}, off={})",
            self.chunk_id(),
            self.n_blocks(),
            self.offset()
        )
    }
}

/// Round `value` up to the nearest multiple of `align`
#[inline]
#[must_use]
pub const fn round_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

/// Round `value` down to the nearest multiple of `align`
#[inline]
#[must_use]
pub const fn round_down(value: u64, align: u64) -> u64 {
    value / align * align
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_sentinels() {
        assert!(!PdevId::INVALID.is_valid());
        assert!(!ChunkId::INVALID.is_valid());
        assert!(!VdevId::INVALID.is_valid());
        assert!(PdevId::new(0).is_valid());
        assert_eq!(ChunkId::new(7).index(), 7);
    }

    #[test]
    fn test_block_id_packing() {
        let bid = BlockId::new(ChunkId::new(5), 8, 0x1234);
        assert_eq!(bid.chunk_id(), ChunkId::new(5));
        assert_eq!(bid.n_blocks(), 8);
        assert_eq!(bid.offset(), 0x1234);
        assert_eq!(bid.data_size(4096), 8 * 4096);
    }

    #[test]
    fn test_block_id_full_range() {
        // A unit may cover the full 256 blocks and the highest chunk slot.
        let bid = BlockId::new(ChunkId::new(127), 256, u32::MAX);
        assert_eq!(bid.chunk_id(), ChunkId::new(127));
        assert_eq!(bid.n_blocks(), 256);
        assert_eq!(bid.offset(), u32::MAX);
    }

    #[test]
    fn test_block_id_raw_roundtrip() {
        let bid = BlockId::new(ChunkId::new(3), 17, 99);
        assert_eq!(BlockId::from_raw(bid.to_raw()), bid);
    }

    #[test]
    fn test_round_up_down() {
        assert_eq!(round_up(1, 4096), 4096);
        assert_eq!(round_up(4096, 4096), 4096);
        assert_eq!(round_down(4097, 4096), 4096);
    }
}
