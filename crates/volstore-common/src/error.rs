//! Error types for the volstore engine.

use thiserror::Error;

/// Common result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for the engine
#[derive(Debug, Error)]
pub enum Error {
    /// Allocator or chunk table cannot satisfy a request
    #[error("no space available: {0}")]
    NoSpace(String),

    /// Discovered devices have different sizes; fatal at bring-up
    #[error("heterogeneous disks: expected size {expected}, found {found} on {device}")]
    HeterogeneousDisks {
        expected: u64,
        found: u64,
        device: String,
    },

    /// Recovery found zero devices with a valid superblock
    #[error("no valid device found")]
    NoValidDevice,

    /// Recovery needs a replacement device but no unformatted spare was supplied
    #[error("no spare disk available to replace missing pdev {0}")]
    NoSpareDisk(u32),

    /// Requested vdev stripe geometry yields a chunk larger than the maximum
    #[error("invalid chunk size {0}")]
    InvalidChunkSize(u64),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Underlying read/write failed with device-level context
    #[error("device I/O error: {0}")]
    IoError(String),

    #[error("checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// An index put discovered its target epoch has advanced; recoverable by
    /// retrying under the new epoch exactly once
    #[error("checkpoint epoch advanced past this operation")]
    EpochMismatch,

    /// Engine is shut down or the volume is not online
    #[error("busy: {0}")]
    Busy(String),

    /// Lba range has no mapping
    #[error("not found")]
    NotFound,

    /// Index installed fewer lbas than requested; `next_lba` resumes
    #[error("partial write, resume at lba {next_lba}")]
    PartialWrite { next_lba: u64 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a no-space error
    pub fn no_space(msg: impl Into<String>) -> Self {
        Self::NoSpace(msg.into())
    }

    /// Create a device I/O error
    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::IoError(msg.into())
    }

    /// Check if this is a no-space condition
    #[must_use]
    pub fn is_no_space(&self) -> bool {
        matches!(self, Self::NoSpace(_))
    }

    /// Check if the caller may retry this operation under a new epoch
    #[must_use]
    pub fn is_epoch_mismatch(&self) -> bool {
        matches!(self, Self::EpochMismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Error::no_space("chunk full").is_no_space());
        assert!(Error::EpochMismatch.is_epoch_mismatch());
        assert!(!Error::NotFound.is_no_space());
    }

    #[test]
    fn test_error_display() {
        let err = Error::HeterogeneousDisks {
            expected: 100,
            found: 200,
            device: "/dev/sdb".into(),
        };
        assert!(err.to_string().contains("/dev/sdb"));

        let err = Error::PartialWrite { next_lba: 42 };
        assert!(err.to_string().contains("42"));
    }
}
