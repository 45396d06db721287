//! Pools of mapped-file windows: chunk partitioning and a bounded LRU
//! block cache.
//!
//! Both pools hand out reserved [`MappedStore`] handles; the caller (or a
//! [`Bytes`] cursor wrapped around one) releases when done. File growth
//! and cache bookkeeping happen under a private mutex; plain access to an
//! acquired store never takes it.

use crate::bytes::Bytes;
use crate::error::{Error, Result};
use crate::store::{ByteStore, FileHandle, MappedStore};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, Weak};

/// Default chunk size: 4 MiB, a multiple of every sane page size.
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Options for a [`ChunkedMappedFile`].
#[derive(Debug, Clone)]
pub struct ChunkedMappedFileBuilder {
    path: PathBuf,
    chunk_size: usize,
    overlap: usize,
    read_only: bool,
}

impl ChunkedMappedFileBuilder {
    /// Chunk size in bytes; must be a non-zero multiple of the page size.
    pub fn chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes;
        self
    }

    /// Extra bytes mapped past each chunk boundary, so records spanning
    /// a boundary stay addressable through one window.
    pub fn overlap(mut self, bytes: usize) -> Self {
        self.overlap = bytes;
        self
    }

    /// Open the file read-only; chunks beyond the end of the file fail
    /// instead of growing it.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Open the backing file and build the pool.
    pub fn open(self) -> Result<ChunkedMappedFile> {
        let page = rustix::param::page_size();
        if self.chunk_size == 0 || self.chunk_size % page != 0 {
            return Err(Error::Allocation(format!(
                "chunk size {} is not a non-zero multiple of the {page}-byte page size",
                self.chunk_size
            )));
        }
        let file = if self.read_only {
            FileHandle::open_read_only(&self.path)?
        } else {
            FileHandle::open_or_create(&self.path)?
        };
        Ok(ChunkedMappedFile {
            file,
            chunk_size: self.chunk_size,
            overlap: self.overlap,
            chunks: Mutex::new(Vec::new()),
        })
    }
}

/// One file presented as a series of fixed-size mapped chunks.
///
/// The pool caches weak handles: a chunk stays mapped exactly as long as
/// someone holds a reservation on it, and a dead slot is remapped on the
/// next acquire.
pub struct ChunkedMappedFile {
    file: Arc<FileHandle>,
    chunk_size: usize,
    overlap: usize,
    chunks: Mutex<Vec<Option<Weak<MappedStore>>>>,
}

impl ChunkedMappedFile {
    /// Start building a pool over `path`.
    pub fn builder<P: AsRef<Path>>(path: P) -> ChunkedMappedFileBuilder {
        ChunkedMappedFileBuilder {
            path: path.as_ref().to_path_buf(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            overlap: 0,
            read_only: false,
        }
    }

    /// Chunk size in bytes.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Overlap mapped past each chunk in bytes.
    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// The backing file handle.
    pub fn file(&self) -> &Arc<FileHandle> {
        &self.file
    }

    /// Acquire the store for chunk `index`, reserving it for the caller.
    ///
    /// Returns the cached mapping when it is still live, otherwise maps a
    /// fresh window of `chunk_size + overlap` bytes at
    /// `index * chunk_size`, growing a writable file as needed.
    pub fn acquire_chunk(&self, index: usize) -> Result<Arc<MappedStore>> {
        let mut chunks = self.chunks.lock().unwrap_or_else(PoisonError::into_inner);
        if chunks.len() <= index {
            chunks.resize_with(index + 1, || None);
        }
        if let Some(weak) = &chunks[index] {
            if let Some(store) = weak.upgrade() {
                if store.try_reserve() {
                    return Ok(store);
                }
            }
        }
        let offset = index
            .checked_mul(self.chunk_size)
            .ok_or_else(|| Error::Allocation("chunk offset overflow".to_string()))?;
        let store = MappedStore::map(&self.file, offset, self.chunk_size + self.overlap)?;
        tracing::debug!(index, offset, len = self.chunk_size + self.overlap, "mapped chunk");
        chunks[index] = Some(Arc::downgrade(&store));
        Ok(store)
    }

    /// Acquire chunk `index` wrapped in a cursor that owns the
    /// reservation.
    pub fn bytes_for_chunk(&self, index: usize) -> Result<Bytes> {
        let store = self.acquire_chunk(index)?;
        let bytes = match Bytes::wrap(Arc::clone(&store) as Arc<dyn ByteStore>) {
            Ok(bytes) => bytes,
            Err(err) => {
                let _ = store.release();
                return Err(err);
            }
        };
        store.release()?;
        Ok(bytes)
    }

    /// Slots whose mapping still holds reservations. The cached `Arc`
    /// alone does not make a slot live: after the last release the window
    /// is already unmapped even though the allocation lingers until the
    /// weak reference lets go.
    fn count_live(chunks: &[Option<Weak<MappedStore>>]) -> usize {
        chunks
            .iter()
            .flatten()
            .filter_map(Weak::upgrade)
            .filter(|store| store.refs().count() > 0)
            .count()
    }

    /// Number of chunk slots whose mapping is currently reserved.
    pub fn live_chunks(&self) -> usize {
        let chunks = self.chunks.lock().unwrap_or_else(PoisonError::into_inner);
        Self::count_live(&chunks)
    }

    /// Drop the chunk cache. Outstanding reservations keep their mappings
    /// alive; the pool just forgets them. Idempotent.
    pub fn close(&self) {
        let mut chunks = self.chunks.lock().unwrap_or_else(PoisonError::into_inner);
        let live = Self::count_live(&chunks);
        if live > 0 {
            tracing::warn!(live, "closing chunked file with live chunk mappings");
        }
        chunks.clear();
    }
}

impl Drop for ChunkedMappedFile {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ChunkedMappedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedMappedFile")
            .field("path", &self.file.path())
            .field("chunk_size", &self.chunk_size)
            .field("overlap", &self.overlap)
            .field("live_chunks", &self.live_chunks())
            .finish()
    }
}

struct CacheEntry {
    store: Arc<MappedStore>,
    last_used: u64,
}

struct BlockCacheInner {
    entries: HashMap<u64, CacheEntry>,
    tick: u64,
    closed: bool,
}

/// Bounded cache of mapped file blocks keyed by block index.
///
/// The cache itself holds one reservation per cached block; every
/// successful [`BlockCache::acquire`] adds one more for the caller. When
/// the cache is full the least-recently-used block is evicted and its
/// cache reservation released, so an evicted block unmaps as soon as its
/// last outside holder lets go.
pub struct BlockCache {
    file: Arc<FileHandle>,
    block_size: usize,
    max_blocks: usize,
    inner: Mutex<BlockCacheInner>,
}

impl BlockCache {
    /// Open (or create) `path` and cache up to `max_blocks` mapped blocks
    /// of `block_size` bytes.
    pub fn new<P: AsRef<Path>>(path: P, block_size: usize, max_blocks: usize) -> Result<Self> {
        let file = FileHandle::open_or_create(path)?;
        Self::with_file(file, block_size, max_blocks)
    }

    /// Build a cache over an already-open file handle (read-only handles
    /// give a read-only cache).
    pub fn with_file(
        file: Arc<FileHandle>,
        block_size: usize,
        max_blocks: usize,
    ) -> Result<Self> {
        let page = rustix::param::page_size();
        if block_size == 0 || block_size % page != 0 {
            return Err(Error::Allocation(format!(
                "block size {block_size} is not a non-zero multiple of the {page}-byte page size"
            )));
        }
        if max_blocks == 0 {
            return Err(Error::Allocation(
                "cache must hold at least one block".to_string(),
            ));
        }
        Ok(Self {
            file,
            block_size,
            max_blocks,
            inner: Mutex::new(BlockCacheInner {
                entries: HashMap::new(),
                tick: 0,
                closed: false,
            }),
        })
    }

    /// Block size in bytes.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of blocks currently cached.
    pub fn cached_blocks(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.entries.len()
    }

    /// Acquire block `key`, reserving it for the caller.
    ///
    /// A hit bumps recency; a miss maps `[key * block_size, + block_size)`
    /// after evicting the least-recently-used entry if the cache is full.
    pub fn acquire(&self, key: u64) -> Result<Arc<MappedStore>> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.closed {
            return Err(Error::Released("block cache"));
        }
        inner.tick += 1;
        let tick = inner.tick;

        if let Some(entry) = inner.entries.get_mut(&key) {
            entry.last_used = tick;
            entry.store.reserve()?;
            return Ok(Arc::clone(&entry.store));
        }

        if inner.entries.len() >= self.max_blocks {
            let victim = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| *key);
            if let Some(victim) = victim {
                if let Some(entry) = inner.entries.remove(&victim) {
                    tracing::debug!(key = victim, "evicting least-recently-used block");
                    if let Err(err) = entry.store.release() {
                        tracing::warn!(key = victim, %err, "evicted block release failed");
                    }
                }
            }
        }

        let offset = key
            .checked_mul(self.block_size as u64)
            .and_then(|offset| usize::try_from(offset).ok())
            .ok_or_else(|| Error::Allocation("block offset overflow".to_string()))?;
        let store = MappedStore::map(&self.file, offset, self.block_size)?;
        store.reserve()?;
        inner.entries.insert(
            key,
            CacheEntry {
                store: Arc::clone(&store),
                last_used: tick,
            },
        );
        Ok(store)
    }

    /// Release every cached block and refuse further acquires.
    /// Idempotent; blocks already gone are skipped.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.closed {
            return;
        }
        inner.closed = true;
        for (key, entry) in inner.entries.drain() {
            if entry.store.refs().count() <= 0 {
                continue;
            }
            if let Err(err) = entry.store.release() {
                tracing::warn!(key, %err, "block release on close failed");
            }
        }
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCache")
            .field("path", &self.file.path())
            .field("block_size", &self.block_size)
            .field("max_blocks", &self.max_blocks)
            .field("cached_blocks", &self.cached_blocks())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("umbra-test-{}-{}", name, std::process::id()))
    }

    fn page() -> usize {
        rustix::param::page_size()
    }

    #[test]
    fn test_builder_rejects_bad_chunk_sizes() {
        let path = temp_path("pool-badsize");
        let _ = std::fs::remove_file(&path);
        assert!(ChunkedMappedFile::builder(&path)
            .chunk_size(0)
            .open()
            .is_err());
        assert!(ChunkedMappedFile::builder(&path)
            .chunk_size(page() + 1)
            .open()
            .is_err());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_chunks_are_recycled_while_held() {
        let path = temp_path("pool-recycle");
        let _ = std::fs::remove_file(&path);

        let pool = ChunkedMappedFile::builder(&path)
            .chunk_size(page())
            .open()
            .unwrap();

        let first = pool.acquire_chunk(2).unwrap();
        assert_eq!(first.file_offset(), 2 * page());
        let again = pool.acquire_chunk(2).unwrap();
        // same mapping, two reservations
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(first.refs().count(), 2);
        assert_eq!(pool.live_chunks(), 1);

        again.release().unwrap();
        first.release().unwrap();
        // the weak slot is dead now; the next acquire remaps
        assert_eq!(pool.live_chunks(), 0);
        let remapped = pool.acquire_chunk(2).unwrap();
        assert_eq!(remapped.refs().count(), 1);
        remapped.release().unwrap();

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_writable_pool_grows_the_file() {
        let path = temp_path("pool-grow");
        let _ = std::fs::remove_file(&path);

        let pool = ChunkedMappedFile::builder(&path)
            .chunk_size(page())
            .overlap(page())
            .open()
            .unwrap();
        let chunk = pool.acquire_chunk(3).unwrap();
        assert_eq!(chunk.capacity(), 2 * page());
        // chunk 3 plus one page of overlap
        assert_eq!(pool.file().len().unwrap(), 5 * page());
        chunk.release().unwrap();

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_read_only_pool_does_not_grow() {
        let path = temp_path("pool-ro");
        let _ = std::fs::remove_file(&path);

        {
            let store = MappedStore::create(&path, page()).unwrap();
            store.release().unwrap();
        }
        let pool = ChunkedMappedFile::builder(&path)
            .chunk_size(page())
            .read_only(true)
            .open()
            .unwrap();
        let chunk = pool.acquire_chunk(0).unwrap();
        assert!(chunk.is_read_only());
        assert!(pool.acquire_chunk(1).is_err());
        chunk.release().unwrap();

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_cursors_from_the_pool_write_through() {
        let path = temp_path("pool-bytes");
        let _ = std::fs::remove_file(&path);

        let pool = ChunkedMappedFile::builder(&path)
            .chunk_size(page())
            .open()
            .unwrap();
        {
            let mut bytes = pool.bytes_for_chunk(1).unwrap();
            bytes.write_u64(0xFEED_FACE).unwrap();
        }
        let chunk = pool.acquire_chunk(1).unwrap();
        assert_eq!(chunk.read_u64_at(0).unwrap(), 0xFEED_FACE);
        chunk.release().unwrap();

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_block_cache_evicts_least_recently_used() {
        let path = temp_path("cache-lru");
        let _ = std::fs::remove_file(&path);

        let cache = BlockCache::new(&path, page(), 2).unwrap();
        let b0 = cache.acquire(0).unwrap();
        let b1 = cache.acquire(1).unwrap();
        // touch 0 so 1 becomes the eviction victim
        cache.acquire(0).unwrap().release().unwrap();
        let b2 = cache.acquire(2).unwrap();
        assert_eq!(cache.cached_blocks(), 2);

        // block 1 lost its cache reservation; ours is the last one
        assert_eq!(b1.refs().count(), 1);
        assert_eq!(b0.refs().count(), 2);

        b0.release().unwrap();
        b1.release().unwrap();
        b2.release().unwrap();

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_block_cache_close_is_idempotent() {
        let path = temp_path("cache-close");
        let _ = std::fs::remove_file(&path);

        let cache = BlockCache::new(&path, page(), 4).unwrap();
        let held = cache.acquire(7).unwrap();
        cache.close();
        cache.close();
        assert!(cache.acquire(7).is_err());
        // our reservation still works after close
        assert_eq!(held.read_u8_at(0).unwrap(), 0);
        held.release().unwrap();

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_block_cache_validates_geometry() {
        let path = temp_path("cache-geometry");
        let _ = std::fs::remove_file(&path);
        assert!(BlockCache::new(&path, page() - 1, 4).is_err());
        assert!(BlockCache::new(&path, page(), 0).is_err());
        let _ = std::fs::remove_file(&path);
    }
}
