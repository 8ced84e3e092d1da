//! Chunk descriptors.
//!
//! A chunk is a fixed, contiguous byte range within one pdev. Descriptors
//! live in the DM-info table indexed by `ChunkId`; the chunks of one pdev
//! form a doubly-linked list in ascending offset order. A chunk is free
//! iff it belongs to no vdev and is not a superblock chunk.

use bytes::{Buf, BufMut};
use volstore_common::types::{ChunkId, PdevId, VdevId};
use volstore_common::{Error, Result};

const FLAG_ALLOCATED: u8 = 1 << 0;
const FLAG_SB_CHUNK: u8 = 1 << 1;

/// One slot of the DM-info chunk table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub start_offset: u64,
    pub size: u64,
    pub chunk_id: ChunkId,
    pub pdev_id: PdevId,
    pub vdev_id: VdevId,
    pub prev_id: ChunkId,
    pub next_id: ChunkId,
    /// Valid when this chunk mirrors another chunk
    pub primary_id: ChunkId,
    /// Slot in use
    pub allocated: bool,
    /// Chunk holds a DM-info copy rather than vdev data
    pub is_sb_chunk: bool,
    /// End of valid data within the chunk (append-log close-out)
    pub end_of_chunk_offset: u64,
}

impl ChunkDescriptor {
    /// Serialized size of one slot
    pub const SIZE: usize = 64;

    #[must_use]
    pub fn empty() -> Self {
        Self {
            start_offset: 0,
            size: 0,
            chunk_id: ChunkId::INVALID,
            pdev_id: PdevId::INVALID,
            vdev_id: VdevId::INVALID,
            prev_id: ChunkId::INVALID,
            next_id: ChunkId::INVALID,
            primary_id: ChunkId::INVALID,
            allocated: false,
            is_sb_chunk: false,
            end_of_chunk_offset: 0,
        }
    }

    /// A chunk is free when no vdev owns it and it is not a superblock chunk
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.allocated && !self.vdev_id.is_valid() && !self.is_sb_chunk
    }

    /// Release vdev ownership; the slot stays allocated until merged away
    pub fn set_free(&mut self) {
        self.vdev_id = VdevId::INVALID;
        self.primary_id = ChunkId::INVALID;
        self.is_sb_chunk = false;
    }

    #[must_use]
    pub fn end_offset(&self) -> u64 {
        self.start_offset + self.size
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.start_offset);
        buf.put_u64_le(self.size);
        buf.put_u32_le(self.chunk_id.raw());
        buf.put_u32_le(self.pdev_id.raw());
        buf.put_u32_le(self.vdev_id.raw());
        buf.put_u32_le(self.prev_id.raw());
        buf.put_u32_le(self.next_id.raw());
        buf.put_u32_le(self.primary_id.raw());
        let mut flags = 0u8;
        if self.allocated {
            flags |= FLAG_ALLOCATED;
        }
        if self.is_sb_chunk {
            flags |= FLAG_SB_CHUNK;
        }
        buf.put_u8(flags);
        buf.put_bytes(0, 15);
        buf.put_u64_le(self.end_of_chunk_offset);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < Self::SIZE {
            return Err(Error::io_error("chunk descriptor truncated"));
        }
        let start_offset = buf.get_u64_le();
        let size = buf.get_u64_le();
        let chunk_id = ChunkId::new(buf.get_u32_le());
        let pdev_id = PdevId::new(buf.get_u32_le());
        let vdev_id = VdevId::new(buf.get_u32_le());
        let prev_id = ChunkId::new(buf.get_u32_le());
        let next_id = ChunkId::new(buf.get_u32_le());
        let primary_id = ChunkId::new(buf.get_u32_le());
        let flags = buf.get_u8();
        buf.advance(15);
        let end_of_chunk_offset = buf.get_u64_le();
        Ok(Self {
            start_offset,
            size,
            chunk_id,
            pdev_id,
            vdev_id,
            prev_id,
            next_id,
            primary_id,
            allocated: flags & FLAG_ALLOCATED != 0,
            is_sb_chunk: flags & FLAG_SB_CHUNK != 0,
            end_of_chunk_offset,
        })
    }
}
