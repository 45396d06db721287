//! Shared append-only arena over a mapped file.
//!
//! The file starts with a fixed 24-byte header: an 8-byte magic, the
//! 8-byte lock word coordinating appenders across processes, and a 32-bit
//! cursor holding the number of bytes in use (header included). Entries
//! are stop-bit length-prefixed blocks packed back to back from offset
//! 24. Appends take the write lock, bump the cursor with an ordered
//! store, and never move existing bytes, so readers can walk the entries
//! without any lock at all.

use crate::bytes::{stop_bit_len, Bytes};
use crate::error::{Error, Result};
use crate::lock::SharedLock;
use crate::store::{ByteStore, MappedStore};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// File magic, first 8 bytes of every arena file.
pub const ARENA_MAGIC: [u8; 8] = *b"UMBRARN\0";

const MAGIC_OFFSET: usize = 0;
const LOCK_OFFSET: usize = 8;
const CURSOR_OFFSET: usize = 16;
// 4 reserved bytes follow the cursor
/// Bytes taken by the arena header before the first entry.
pub const HEADER_LEN: usize = 24;

/// How long an append spins for the write lock before giving up.
const APPEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Append-only log of length-prefixed entries in one mapped file.
pub struct ArenaFile {
    store: Arc<MappedStore>,
    lock: SharedLock,
}

impl ArenaFile {
    /// Create (or truncate) an arena file with room for `capacity` bytes,
    /// header included.
    pub fn create<P: AsRef<Path>>(path: P, capacity: usize) -> Result<Self> {
        if capacity <= HEADER_LEN || capacity > u32::MAX as usize {
            return Err(Error::Allocation(format!(
                "arena capacity {capacity} must be in ({HEADER_LEN}, {}]",
                u32::MAX
            )));
        }
        let store = MappedStore::create(path, capacity)?;
        match Self::format(Arc::clone(&store)) {
            Ok(arena) => Ok(arena),
            Err(err) => {
                let _ = store.release();
                Err(err)
            }
        }
    }

    /// Open an existing arena file, mapping its full length.
    ///
    /// The lock word is adopted as found; use [`ArenaFile::recover`] if
    /// the previous holder died mid-append.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let store = MappedStore::open(path)?;
        match Self::attach(Arc::clone(&store)) {
            Ok(arena) => Ok(arena),
            Err(err) => {
                let _ = store.release();
                Err(err)
            }
        }
    }

    fn format(store: Arc<MappedStore>) -> Result<Self> {
        store.copy_from(MAGIC_OFFSET, &ARENA_MAGIC)?;
        store.write_ordered_u32_at(CURSOR_OFFSET, HEADER_LEN as u32)?;
        let lock = SharedLock::bind(Arc::clone(&store) as Arc<dyn ByteStore>, LOCK_OFFSET)?;
        lock.reset();
        store.sync()?;
        Ok(Self { store, lock })
    }

    fn attach(store: Arc<MappedStore>) -> Result<Self> {
        if store.capacity() < HEADER_LEN {
            return Err(Error::CorruptStream(format!(
                "arena file is {} bytes, shorter than its {HEADER_LEN}-byte header",
                store.capacity()
            )));
        }
        let mut magic = [0u8; 8];
        store.copy_to(MAGIC_OFFSET, &mut magic)?;
        if magic != ARENA_MAGIC {
            return Err(Error::CorruptStream(format!(
                "bad arena magic {magic:02X?}"
            )));
        }
        let used = store.read_volatile_u32_at(CURSOR_OFFSET)? as usize;
        if used < HEADER_LEN || used > store.capacity() {
            return Err(Error::CorruptStream(format!(
                "arena cursor {used} outside [{HEADER_LEN}, {}]",
                store.capacity()
            )));
        }
        let lock = SharedLock::bind(Arc::clone(&store) as Arc<dyn ByteStore>, LOCK_OFFSET)?;
        Ok(Self { store, lock })
    }

    /// Append one entry, returning the file offset its length prefix was
    /// written at.
    pub fn append(&self, payload: &[u8]) -> Result<usize> {
        if !self.lock.busy_write_lock(APPEND_TIMEOUT) {
            return Err(Error::LockState(format!(
                "arena append lock timed out ({})",
                self.lock.state()
            )));
        }
        let result = self.append_locked(payload);
        self.lock.unlock_write()?;
        result
    }

    fn append_locked(&self, payload: &[u8]) -> Result<usize> {
        let used = self.store.read_volatile_u32_at(CURSOR_OFFSET)? as usize;
        if used < HEADER_LEN || used > self.store.capacity() {
            return Err(Error::CorruptStream(format!(
                "arena cursor {used} outside [{HEADER_LEN}, {}]",
                self.store.capacity()
            )));
        }
        let entry_len = stop_bit_len(payload.len() as i64) + payload.len();
        let remaining = self.store.capacity() - used;
        if entry_len > remaining {
            return Err(Error::Overflow {
                needed: entry_len,
                remaining,
            });
        }
        let mut bytes = Bytes::wrap_range(
            Arc::clone(&self.store) as Arc<dyn ByteStore>,
            used,
            entry_len,
        )?;
        bytes.write_block(payload)?;
        // entry bytes land before the cursor moves
        self.store
            .write_ordered_u32_at(CURSOR_OFFSET, (used + entry_len) as u32)?;
        Ok(used)
    }

    /// Walk the entries appended so far. Entries landing after this call
    /// are not picked up; call again for a fresh view.
    pub fn entries(&self) -> Result<ArenaEntries> {
        let used = self.used()?;
        let bytes = Bytes::wrap_range(
            Arc::clone(&self.store) as Arc<dyn ByteStore>,
            HEADER_LEN,
            used - HEADER_LEN,
        )?;
        Ok(ArenaEntries {
            bytes,
            failed: false,
        })
    }

    /// Bytes in use, header included.
    pub fn used(&self) -> Result<usize> {
        let used = self.store.read_volatile_u32_at(CURSOR_OFFSET)? as usize;
        if used < HEADER_LEN || used > self.store.capacity() {
            return Err(Error::CorruptStream(format!(
                "arena cursor {used} outside [{HEADER_LEN}, {}]",
                self.store.capacity()
            )));
        }
        Ok(used)
    }

    /// Total capacity, header included.
    pub fn capacity(&self) -> usize {
        self.store.capacity()
    }

    /// Bytes still free for entries.
    pub fn remaining(&self) -> Result<usize> {
        Ok(self.store.capacity() - self.used()?)
    }

    /// The mapped store behind the arena.
    pub fn store(&self) -> &Arc<MappedStore> {
        &self.store
    }

    /// The cross-process append lock.
    pub fn lock(&self) -> &SharedLock {
        &self.lock
    }

    /// Force the lock word back to unlocked. For recovering after a
    /// holder died mid-append; live appenders are not consulted.
    pub fn recover(&self) {
        tracing::warn!(state = %self.lock.state(), "forcing arena lock open");
        self.lock.reset();
    }

    /// Flush header and entries to the backing file.
    pub fn sync(&self) -> Result<()> {
        self.store.sync()
    }
}

impl Drop for ArenaFile {
    fn drop(&mut self) {
        if let Err(err) = self.store.release() {
            tracing::warn!(%err, "arena store release failed");
        }
    }
}

impl std::fmt::Debug for ArenaFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArenaFile")
            .field("path", &self.store.file().path())
            .field("capacity", &self.store.capacity())
            .field("used", &self.used())
            .field("lock", &self.lock.state())
            .finish()
    }
}

/// Iterator over the entries of an [`ArenaFile`], oldest first.
///
/// Yields one `Vec<u8>` per entry. A corrupt length prefix yields the
/// error once and fuses the iterator.
pub struct ArenaEntries {
    bytes: Bytes,
    failed: bool,
}

impl Iterator for ArenaEntries {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.bytes.remaining() == 0 {
            return None;
        }
        match self.bytes.read_block() {
            Ok(entry) => Some(Ok(entry)),
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}
