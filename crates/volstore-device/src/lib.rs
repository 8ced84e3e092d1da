//! Device layer of the volstore engine.
//!
//! Raw devices are opened by [`pdev::PhysicalDev`], carved into chunks
//! tracked by the device manager's chunk table, and assembled into striped,
//! optionally mirrored virtual devices. The layout directory (DM-info) is
//! replicated to every device under a two-copy generation-counter scheme
//! and repaired on boot.

pub mod chunk;
pub mod dm;
pub mod pdev;
pub mod raw_io;
pub mod superblock;
pub mod vdev;

pub use chunk::ChunkDescriptor;
pub use dm::{DeviceManager, DmConfig, VdevDescriptor};
pub use pdev::PhysicalDev;
pub use raw_io::{AlignedBuffer, RawFile};
pub use superblock::DeviceLayout;
pub use vdev::VirtualDev;
