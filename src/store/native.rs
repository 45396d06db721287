//! Anonymous native-memory byte store.

use super::{ByteStore, SendPtr, StoreKind};
use crate::error::{Error, Result};
use crate::refcount::RefCount;
use rustix::mm::{MapFlags, ProtFlags};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(0);

/// Byte store backed by an anonymous private mapping.
///
/// Lives outside the Rust heap, so large regions do not disturb the
/// allocator. The mapping is released back to the system when the last
/// reservation goes away.
pub struct NativeStore {
    ptr: NonNull<u8>,
    capacity: usize,
    name: String,
    refs: RefCount,
}

impl NativeStore {
    /// Map a zeroed anonymous region of `capacity` bytes.
    pub fn allocate(capacity: usize) -> Result<Self> {
        let id = NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed);
        Self::with_name(format!("native-{id}"), capacity)
    }

    /// Map a zeroed anonymous region with a debug name.
    pub fn with_name(name: impl Into<String>, capacity: usize) -> Result<Self> {
        let name = name.into();
        if capacity == 0 {
            return Err(Error::Allocation(
                "capacity must be greater than 0".to_string(),
            ));
        }

        // SAFETY: requesting a fresh anonymous mapping; no existing memory
        // is touched.
        let addr = unsafe {
            rustix::mm::mmap_anonymous(
                std::ptr::null_mut(),
                capacity,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::PRIVATE,
            )?
        };
        let ptr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| Error::Allocation("mmap returned null".to_string()))?;

        tracing::debug!(name = %name, capacity, "mapped anonymous store");

        let owner = SendPtr(ptr);
        let refs = RefCount::new("native store", move || {
            // SAFETY: unmapping the exact region mapped above, exactly once.
            if let Err(err) = unsafe { rustix::mm::munmap(owner.as_ptr().cast(), capacity) } {
                tracing::warn!(?err, "munmap of native store failed");
            }
        });

        Ok(Self {
            ptr,
            capacity,
            name,
            refs,
        })
    }

    /// Debug name of this store.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl ByteStore for NativeStore {
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
        StoreKind::Native
    }
}

// SAFETY: the mapping is uniquely owned by this store and unmapped exactly
// once through the release action; all access goes through the
// bounds-checked trait accessors.
unsafe impl Send for NativeStore {}
unsafe impl Sync for NativeStore {}

impl std::fmt::Debug for NativeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeStore")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("refs", &self.refs)
            .finish()
    }
}
