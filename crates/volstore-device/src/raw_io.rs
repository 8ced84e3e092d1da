//! Raw device access.
//!
//! Devices open with O_DIRECT on Linux (F_NOCACHE on macOS) when the engine
//! runs in direct mode; file-backed test devices use buffered I/O, where no
//! alignment constraints apply.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use volstore_common::{Error, OpenMode, Result};

#[cfg(target_os = "linux")]
use std::os::unix::fs::OpenOptionsExt;

/// A raw device or device-sized file
pub struct RawFile {
    file: File,
    path: String,
    size: u64,
    read_only: bool,
    direct: bool,
    align: usize,
}

impl RawFile {
    /// Open an existing device
    pub fn open(path: impl AsRef<Path>, mode: OpenMode, align: usize) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().into_owned();
        let read_only = mode == OpenMode::ReadOnly;
        let direct = mode == OpenMode::DirectIo;

        let mut options = OpenOptions::new();
        options.read(true);
        if !read_only {
            options.write(true);
        }

        #[cfg(target_os = "linux")]
        if direct {
            options.custom_flags(libc::O_DIRECT);
        }

        let file = options
            .open(&path)
            .map_err(|e| Error::io_error(format!("failed to open {path_str}: {e}")))?;

        #[cfg(target_os = "macos")]
        if direct {
            set_nocache(&file, &path_str)?;
        }

        let size = device_size(&file, &path)?;
        Ok(Self {
            file,
            path: path_str,
            size,
            read_only,
            direct,
            align,
        })
    }

    /// Create (or truncate) a file-backed device of the given size.
    /// A real block device is opened as-is and keeps its native size.
    pub fn create(path: impl AsRef<Path>, size: u64, mode: OpenMode, align: usize) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().into_owned();
        let direct = mode == OpenMode::DirectIo;
        let block_device = is_block_device(&path);

        let mut options = OpenOptions::new();
        options.read(true).write(true);
        if !block_device {
            options.create(true);
        }

        #[cfg(target_os = "linux")]
        if direct {
            options.custom_flags(libc::O_DIRECT);
        }

        let file = options
            .open(&path)
            .map_err(|e| Error::io_error(format!("failed to create {path_str}: {e}")))?;

        #[cfg(target_os = "macos")]
        if direct {
            set_nocache(&file, &path_str)?;
        }

        let actual_size = if block_device {
            device_size(&file, &path)?
        } else {
            file.set_len(size)
                .map_err(|e| Error::io_error(format!("failed to size {path_str}: {e}")))?;
            size
        };

        Ok(Self {
            file,
            path: path_str,
            size: actual_size,
            read_only: false,
            direct,
            align,
        })
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Read exactly `buf.len()` bytes at `offset`
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_alignment(offset, buf.len())?;
        self.file
            .read_exact_at(buf, offset)
            .map_err(|e| Error::io_error(format!("read failed on {} at {offset}: {e}", self.path)))
    }

    /// Write all of `buf` at `offset`
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::io_error(format!("{} is read-only", self.path)));
        }
        self.check_alignment(offset, buf.len())?;
        self.file
            .write_all_at(buf, offset)
            .map_err(|e| Error::io_error(format!("write failed on {} at {offset}: {e}", self.path)))
    }

    /// Flush data and metadata to stable storage
    pub fn sync(&self) -> Result<()> {
        self.file
            .sync_all()
            .map_err(|e| Error::io_error(format!("sync failed on {}: {e}", self.path)))
    }

    fn check_alignment(&self, offset: u64, len: usize) -> Result<()> {
        if !self.direct {
            return Ok(());
        }
        let align = self.align as u64;
        if offset % align != 0 || len as u64 % align != 0 {
            return Err(Error::io_error(format!(
                "unaligned direct I/O on {}: offset {offset} len {len} (align {align})",
                self.path
            )));
        }
        Ok(())
    }
}

fn is_block_device(path: impl AsRef<Path>) -> bool {
    use std::os::unix::fs::FileTypeExt;
    std::fs::metadata(&path)
        .map(|m| m.file_type().is_block_device())
        .unwrap_or(false)
}

#[cfg(target_os = "linux")]
fn device_size(file: &File, path: impl AsRef<Path>) -> Result<u64> {
    use std::os::unix::io::AsRawFd;

    if is_block_device(&path) {
        const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;
        let mut size: u64 = 0;
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size) };
        if ret == -1 {
            return Err(Error::io_error(format!(
                "BLKGETSIZE64 failed on {}: {}",
                path.as_ref().display(),
                std::io::Error::last_os_error()
            )));
        }
        Ok(size)
    } else {
        Ok(file
            .metadata()
            .map_err(|e| Error::io_error(format!("stat failed: {e}")))?
            .len())
    }
}

#[cfg(not(target_os = "linux"))]
fn device_size(file: &File, _path: impl AsRef<Path>) -> Result<u64> {
    Ok(file
        .metadata()
        .map_err(|e| Error::io_error(format!("stat failed: {e}")))?
        .len())
}

#[cfg(target_os = "macos")]
fn set_nocache(file: &File, path: &str) -> Result<()> {
    use std::os::unix::io::AsRawFd;
    let ret = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 1) };
    if ret == -1 {
        return Err(Error::io_error(format!(
            "F_NOCACHE failed on {path}: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// A zeroed buffer whose data pointer is aligned for direct I/O.
/// Alignment comes from over-allocating and offsetting into the
/// allocation.
pub struct AlignedBuffer {
    storage: Vec<u8>,
    start: usize,
    len: usize,
}

impl AlignedBuffer {
    /// A buffer of `len` bytes aligned to `align`
    #[must_use]
    pub fn new(len: usize, align: usize) -> Self {
        debug_assert!(align.is_power_of_two());
        let storage = vec![0u8; len + align];
        let addr = storage.as_ptr() as usize;
        let start = (align - (addr % align)) % align;
        Self { storage, start, len }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.start..self.start + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.storage[self.start..self.start + self.len]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `src` into the front of the buffer, zeroing the remainder
    pub fn fill_from(&mut self, src: &[u8]) {
        let n = src.len().min(self.len);
        let slice = self.as_mut_slice();
        slice[..n].copy_from_slice(&src[..n]);
        slice[n..].fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_aligned_buffer() {
        let mut buf = AlignedBuffer::new(4096, 4096);
        assert_eq!(buf.len(), 4096);
        assert_eq!(buf.as_slice().as_ptr() as usize % 4096, 0);

        buf.fill_from(b"hello");
        assert_eq!(&buf.as_slice()[..5], b"hello");
        assert_eq!(buf.as_slice()[5], 0);
    }

    #[test]
    fn test_create_write_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev0");

        {
            let file = RawFile::create(&path, 1 << 20, OpenMode::BufferedIo, 4096).unwrap();
            assert_eq!(file.size(), 1 << 20);
            file.write_at(8192, b"volstore raw io").unwrap();
            file.sync().unwrap();
        }

        {
            let file = RawFile::open(&path, OpenMode::BufferedIo, 4096).unwrap();
            let mut buf = vec![0u8; 15];
            file.read_at(8192, &mut buf).unwrap();
            assert_eq!(&buf, b"volstore raw io");
        }
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev0");
        RawFile::create(&path, 1 << 20, OpenMode::BufferedIo, 4096).unwrap();

        let file = RawFile::open(&path, OpenMode::ReadOnly, 4096).unwrap();
        assert!(file.write_at(0, b"nope").is_err());
    }
}
