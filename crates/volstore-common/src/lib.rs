//! Common foundation for the volstore engine.
//!
//! This crate carries the pieces every layer of the engine shares:
//! identifier newtypes and the packed block id, the design constants that
//! fix the on-disk geometry, the error type, the engine configuration, and
//! the checksum primitives used by the on-disk formats.

pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use config::{EngineConfig, OpenMode, SlabConfig};
pub use error::{Error, Result};
pub use types::{BlockId, ChunkId, Lba, PdevId, SeqNum, VdevId};
