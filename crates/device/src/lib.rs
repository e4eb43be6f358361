//! Block device abstraction under the page cache.
//!
//! Two implementations share the [`Device`] trait: [`FileDevice`] for a
//! host file (optionally memory-mapped) and [`MemoryDevice`] for a
//! growable in-process arena. Page I/O above this layer is page-aligned;
//! the device itself is byte-addressed so the environment header can be
//! probed before the page size is known.


use common::{Address, DbError, DbResult};
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Block-aligned read/write/truncate on the main file or arena.
pub trait Device {
    /// Read `buf.len()` bytes starting at `address`.
    ///
    /// Reading past the end of the device is an I/O error.
    fn read(&mut self, address: Address, buf: &mut [u8]) -> DbResult<()>;

    /// Write `data` starting at `address`; the range must be in bounds.
    fn write(&mut self, address: Address, data: &[u8]) -> DbResult<()>;

    /// Shrink the device to `new_size` bytes.
    fn truncate(&mut self, new_size: u64) -> DbResult<()>;

    /// Extend the device by `len` bytes; returns the address of the new
    /// region (the previous size).
    fn grow(&mut self, len: u64) -> DbResult<Address>;

    /// Current size in bytes.
    fn file_size(&self) -> u64;

    /// Force written data to stable storage.
    fn sync(&mut self) -> DbResult<()>;

    /// Whether the device currently holds a memory mapping.
    fn is_mapped(&self) -> bool;
}

/// File-backed device.
///
/// When mapping is enabled the whole file is mapped read-write and all
/// I/O copies through the map; the map is rebuilt after every size
/// change. With `disable_mmap` (or on a read-only open) it falls back
/// to plain seek + read/write.
#[derive(Debug)]
pub struct FileDevice {
    file: File,
    map: Option<MmapMut>,
    size: u64,
    use_mmap: bool,
    read_only: bool,
}

impl FileDevice {
    /// Create a new, empty file; truncates an existing one.
    pub fn create(path: &Path, disable_mmap: bool) -> DbResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            file,
            map: None,
            size: 0,
            use_mmap: !disable_mmap,
            read_only: false,
        })
    }

    /// Open an existing file.
    pub fn open(path: &Path, disable_mmap: bool, read_only: bool) -> DbResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => DbError::FileNotFound(path.display().to_string()),
                _ => DbError::Io(e),
            })?;
        let size = file.metadata()?.len();
        let mut dev = Self {
            file,
            map: None,
            size,
            use_mmap: !disable_mmap && !read_only,
            read_only,
        };
        dev.remap()?;
        Ok(dev)
    }

    /// Direct view of a mapped region, or `None` when not mapped.
    pub fn map_region(&mut self, address: Address, len: usize) -> Option<&mut [u8]> {
        let map = self.map.as_mut()?;
        let start = address as usize;
        let end = start.checked_add(len)?;
        if end > map.len() {
            return None;
        }
        Some(&mut map[start..end])
    }

    fn remap(&mut self) -> DbResult<()> {
        self.map = None;
        if self.use_mmap && self.size > 0 {
            // Safety: the environment owns the file exclusively for its
            // whole lifetime; no other process mutates it underneath us.
            self.map = Some(unsafe { MmapMut::map_mut(&self.file)? });
        }
        Ok(())
    }

    fn check_bounds(&self, address: Address, len: usize) -> DbResult<()> {
        let end = address
            .checked_add(len as u64)
            .ok_or_else(|| DbError::Io(io::Error::other("address overflow")))?;
        if end > self.size {
            return Err(DbError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("access at {address}+{len} past device end {}", self.size),
            )));
        }
        Ok(())
    }
}

impl Device for FileDevice {
    fn read(&mut self, address: Address, buf: &mut [u8]) -> DbResult<()> {
        self.check_bounds(address, buf.len())?;
        if let Some(map) = &self.map {
            let start = address as usize;
            buf.copy_from_slice(&map[start..start + buf.len()]);
            return Ok(());
        }
        self.file.seek(SeekFrom::Start(address))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write(&mut self, address: Address, data: &[u8]) -> DbResult<()> {
        if self.read_only {
            return Err(DbError::InvalidParameter(
                "write on a read-only device".into(),
            ));
        }
        self.check_bounds(address, data.len())?;
        if let Some(map) = &mut self.map {
            let start = address as usize;
            map[start..start + data.len()].copy_from_slice(data);
            return Ok(());
        }
        self.file.seek(SeekFrom::Start(address))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> DbResult<()> {
        // The map must be gone before the file shrinks underneath it.
        self.map = None;
        self.file.set_len(new_size)?;
        self.size = new_size;
        self.remap()
    }

    fn grow(&mut self, len: u64) -> DbResult<Address> {
        let old = self.size;
        self.map = None;
        self.file.set_len(old + len)?;
        self.size = old + len;
        self.remap()?;
        Ok(old)
    }

    fn file_size(&self) -> u64 {
        self.size
    }

    fn sync(&mut self) -> DbResult<()> {
        if let Some(map) = &self.map {
            map.flush()?;
        }
        self.file.sync_all()?;
        Ok(())
    }

    fn is_mapped(&self) -> bool {
        self.map.is_some()
    }
}

/// Arena-backed device for in-memory environments.
///
/// Never touches the file system; mapping is always off.
pub struct MemoryDevice {
    arena: Vec<u8>,
}

impl MemoryDevice {
    pub fn new() -> Self {
        Self { arena: Vec::new() }
    }
}

impl Default for MemoryDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for MemoryDevice {
    fn read(&mut self, address: Address, buf: &mut [u8]) -> DbResult<()> {
        let start = address as usize;
        let end = start + buf.len();
        if end > self.arena.len() {
            return Err(DbError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("arena read at {address}+{} past end {}", buf.len(), self.arena.len()),
            )));
        }
        buf.copy_from_slice(&self.arena[start..end]);
        Ok(())
    }

    fn write(&mut self, address: Address, data: &[u8]) -> DbResult<()> {
        let start = address as usize;
        let end = start + data.len();
        if end > self.arena.len() {
            return Err(DbError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("arena write at {address}+{} past end {}", data.len(), self.arena.len()),
            )));
        }
        self.arena[start..end].copy_from_slice(data);
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> DbResult<()> {
        self.arena.truncate(new_size as usize);
        Ok(())
    }

    fn grow(&mut self, len: u64) -> DbResult<Address> {
        let old = self.arena.len() as u64;
        self.arena.resize(self.arena.len() + len as usize, 0);
        Ok(old)
    }

    fn file_size(&self) -> u64 {
        self.arena.len() as u64
    }

    fn sync(&mut self) -> DbResult<()> {
        Ok(())
    }

    fn is_mapped(&self) -> bool {
        false
    }
}
