//! Memory-mapped file stores.
//!
//! A [`MappedStore`] is one shared mapping of a window of a file. Several
//! stores may map the same [`FileHandle`] at different (or overlapping)
//! offsets; writes are coherent between them and visible to other
//! processes mapping the same file. Releasing the last reservation unmaps
//! the window, and the file descriptor closes when the last mapping and
//! handle are gone.

use super::{ByteStore, SendPtr, StoreKind};
use crate::error::{Error, Result};
use crate::refcount::RefCount;
use rustix::fd::OwnedFd;
use rustix::fs::{Mode, OFlags};
use rustix::mm::{MapFlags, MsyncFlags, ProtFlags};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;

/// Shared handle to an open backing file.
pub struct FileHandle {
    fd: OwnedFd,
    path: PathBuf,
    read_only: bool,
}

impl FileHandle {
    /// Create (or truncate) a file of exactly `len` bytes.
    pub fn create<P: AsRef<Path>>(path: P, len: usize) -> Result<Arc<Self>> {
        let path = path.as_ref();
        let fd = rustix::fs::open(
            path,
            OFlags::RDWR | OFlags::CREATE | OFlags::TRUNC,
            Mode::from_raw_mode(0o644),
        )?;
        rustix::fs::ftruncate(&fd, len as u64)?;
        Ok(Arc::new(Self {
            fd,
            path: path.to_path_buf(),
            read_only: false,
        }))
    }

    /// Open an existing file for read/write access.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Arc<Self>> {
        Self::open_with(path.as_ref(), OFlags::RDWR, false)
    }

    /// Open a file for read/write access, creating it empty if missing.
    pub fn open_or_create<P: AsRef<Path>>(path: P) -> Result<Arc<Self>> {
        Self::open_with(path.as_ref(), OFlags::RDWR | OFlags::CREATE, false)
    }

    /// Open an existing file read-only.
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Arc<Self>> {
        Self::open_with(path.as_ref(), OFlags::RDONLY, true)
    }

    fn open_with(path: &Path, flags: OFlags, read_only: bool) -> Result<Arc<Self>> {
        let fd = rustix::fs::open(path, flags, Mode::from_raw_mode(0o644))?;
        Ok(Arc::new(Self {
            fd,
            path: path.to_path_buf(),
            read_only,
        }))
    }

    /// Current file length in bytes.
    pub fn len(&self) -> Result<usize> {
        let stat = rustix::fs::fstat(&self.fd)?;
        Ok(stat.st_size as usize)
    }

    /// Extend the file to `len` bytes. Never shrinks.
    pub fn grow_to(&self, len: usize) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        if len > self.len()? {
            rustix::fs::ftruncate(&self.fd, len as u64)?;
        }
        Ok(())
    }

    /// Path the handle was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the file was opened read-only.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("path", &self.path)
            .field("read_only", &self.read_only)
            .finish()
    }
}

/// Byte store backed by a shared mapping of a file window.
pub struct MappedStore {
    ptr: NonNull<u8>,
    capacity: usize,
    file_offset: usize,
    file: Arc<FileHandle>,
    refs: RefCount,
}

impl MappedStore {
    /// Map `[offset, offset + len)` of `file`.
    ///
    /// `offset` must be page-aligned. If the window extends past the end
    /// of a writable file the file grows to cover it; on a read-only file
    /// that is an error.
    pub fn map(file: &Arc<FileHandle>, offset: usize, len: usize) -> Result<Arc<Self>> {
        if len == 0 {
            return Err(Error::Allocation(
                "mapping length must be greater than 0".to_string(),
            ));
        }
        let page = rustix::param::page_size();
        if offset % page != 0 {
            return Err(Error::Misaligned {
                offset,
                align: page,
            });
        }
        let end = offset
            .checked_add(len)
            .ok_or_else(|| Error::Allocation("mapping range overflow".to_string()))?;
        if end > file.len()? {
            if file.is_read_only() {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!(
                        "window [{offset}, {end}) past end of read-only file {}",
                        file.path().display()
                    ),
                )));
            }
            file.grow_to(end)?;
        }

        let prot = if file.is_read_only() {
            ProtFlags::READ
        } else {
            ProtFlags::READ | ProtFlags::WRITE
        };
        // SAFETY: mapping a fresh region; the fd and range were validated
        // above.
        let addr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                len,
                prot,
                MapFlags::SHARED,
                &file.fd,
                offset as u64,
            )?
        };
        let ptr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| Error::Allocation("mmap returned null".to_string()))?;

        tracing::debug!(
            path = %file.path().display(),
            offset,
            len,
            read_only = file.is_read_only(),
            "mapped file window"
        );

        let owner = SendPtr(ptr);
        let refs = RefCount::new("mapped store", move || {
            // SAFETY: unmapping the exact window mapped above, exactly once.
            if let Err(err) = unsafe { rustix::mm::munmap(owner.as_ptr().cast(), len) } {
                tracing::warn!(?err, "munmap of mapped store failed");
            }
        });

        Ok(Arc::new(Self {
            ptr,
            capacity: len,
            file_offset: offset,
            file: Arc::clone(file),
            refs,
        }))
    }

    /// Create (or truncate) a file of `capacity` bytes and map all of it.
    pub fn create<P: AsRef<Path>>(path: P, capacity: usize) -> Result<Arc<Self>> {
        let file = FileHandle::create(path, capacity)?;
        Self::map(&file, 0, capacity)
    }

    /// Map the whole of an existing file read/write.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Arc<Self>> {
        let file = FileHandle::open(path)?;
        let len = file.len()?;
        Self::map(&file, 0, len)
    }

    /// Map the whole of an existing file read-only.
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Arc<Self>> {
        let file = FileHandle::open_read_only(path)?;
        let len = file.len()?;
        Self::map(&file, 0, len)
    }

    /// The backing file handle.
    pub fn file(&self) -> &Arc<FileHandle> {
        &self.file
    }

    /// Offset of this window within the backing file.
    pub fn file_offset(&self) -> usize {
        self.file_offset
    }

    /// Flush the window to disk, waiting for completion.
    pub fn sync(&self) -> Result<()> {
        // SAFETY: the mapping is valid while a reservation is held.
        unsafe {
            rustix::mm::msync(self.ptr.as_ptr().cast(), self.capacity, MsyncFlags::SYNC)?;
        }
        Ok(())
    }

    /// Schedule a flush of the window to disk without waiting.
    pub fn sync_async(&self) -> Result<()> {
        // SAFETY: as in `sync`.
        unsafe {
            rustix::mm::msync(self.ptr.as_ptr().cast(), self.capacity, MsyncFlags::ASYNC)?;
        }
        Ok(())
    }

    /// Touch every page of the window so later accesses do not fault.
    pub fn prefault(&self) {
        let page = rustix::param::page_size();
        let mut offset = 0;
        while offset < self.capacity {
            // SAFETY: offset < capacity; volatile stops the touch from
            // being optimized out.
            let _ = unsafe { std::ptr::read_volatile(self.ptr.as_ptr().add(offset)) };
            offset += page;
        }
    }
}

impl ByteStore for MappedStore {
    fn base_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn refs(&self) -> &RefCount {
        &self.refs
    }

    fn kind(&self) -> StoreKind {
        StoreKind::Mapped
    }

    fn is_read_only(&self) -> bool {
        self.file.read_only
    }
}

// SAFETY: the window is unmapped exactly once through the release action;
// cross-process coherence is the kernel's, and intra-process coordination
// is the caller's through the atomic accessors and locks.
unsafe impl Send for MappedStore {}
unsafe impl Sync for MappedStore {}

impl std::fmt::Debug for MappedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedStore")
            .field("path", &self.file.path)
            .field("file_offset", &self.file_offset)
            .field("capacity", &self.capacity)
            .field("read_only", &self.file.read_only)
            .field("refs", &self.refs)
            .finish()
    }
}
