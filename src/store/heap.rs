//! Heap-backed byte store.

use super::{ByteStore, SendPtr, StoreKind};
use crate::error::{Error, Result};
use crate::refcount::RefCount;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(0);

/// Byte store backed by a zero-initialized heap allocation.
pub struct HeapStore {
    ptr: NonNull<u8>,
    capacity: usize,
    name: String,
    refs: RefCount,
}

impl HeapStore {
    /// Allocate a zeroed store of `capacity` bytes.
    pub fn allocate(capacity: usize) -> Result<Self> {
        Self::from_boxed(vec![0u8; capacity].into_boxed_slice())
    }

    /// Take ownership of `data` and expose it as a store.
    pub fn from_vec(data: Vec<u8>) -> Result<Self> {
        Self::from_boxed(data.into_boxed_slice())
    }

    /// Allocate a store holding a copy of `data`.
    pub fn copy_of(data: &[u8]) -> Result<Self> {
        Self::from_boxed(data.to_vec().into_boxed_slice())
    }

    fn from_boxed(block: Box<[u8]>) -> Result<Self> {
        let capacity = block.len();
        if capacity == 0 {
            return Err(Error::Allocation(
                "capacity must be greater than 0".to_string(),
            ));
        }
        let id = NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed);
        let name = format!("heap-{id}");
        let raw = Box::into_raw(block);
        // SAFETY: Box::into_raw never returns null.
        let ptr = unsafe { NonNull::new_unchecked(raw.cast::<u8>()) };

        tracing::debug!(name = %name, capacity, "allocated heap store");

        let owner = SendPtr(ptr);
        let refs = RefCount::new("heap store", move || {
            let slice = std::ptr::slice_from_raw_parts_mut(owner.as_ptr(), capacity);
            // SAFETY: `slice` reconstructs the exact Box released by
            // Box::into_raw above, and the action runs exactly once.
            drop(unsafe { Box::from_raw(slice) });
        });
        Ok(Self {
            ptr,
            capacity,
            name,
            refs,
        })
    }

    /// Set a custom name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Debug name of this store.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl ByteStore for HeapStore {
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
        StoreKind::Heap
    }
}

// SAFETY: the heap block is uniquely owned by this store and freed exactly
// once through the release action; all access goes through the
// bounds-checked trait accessors.
unsafe impl Send for HeapStore {}
unsafe impl Sync for HeapStore {}

impl std::fmt::Debug for HeapStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapStore")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("refs", &self.refs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_is_zeroed() {
        let store = HeapStore::allocate(256).unwrap();
        assert_eq!(store.capacity(), 256);
        assert_eq!(store.kind(), StoreKind::Heap);
        for offset in [0, 100, 255] {
            assert_eq!(store.read_u8_at(offset).unwrap(), 0);
        }
    }

    #[test]
    fn test_zero_capacity_fails() {
        assert!(HeapStore::allocate(0).is_err());
        assert!(HeapStore::from_vec(Vec::new()).is_err());
    }

    #[test]
    fn test_from_vec_keeps_contents() {
        let store = HeapStore::from_vec(vec![1, 2, 3, 4]).unwrap();
        assert_eq!(store.capacity(), 4);
        let mut back = [0u8; 4];
        store.copy_to(0, &mut back).unwrap();
        assert_eq!(back, [1, 2, 3, 4]);
    }

    #[test]
    fn test_names_are_distinct() {
        let a = HeapStore::allocate(16).unwrap();
        let b = HeapStore::allocate(16).unwrap();
        assert_ne!(a.name(), b.name());
        let named = HeapStore::allocate(16).unwrap().with_name("scratch");
        assert_eq!(named.name(), "scratch");
    }

    #[test]
    fn test_release_invalidates_the_store() {
        let store = HeapStore::allocate(16).unwrap();
        store.release().unwrap();
        assert!(!store.try_reserve());
        assert!(store.release().is_err());
    }

    #[test]
    fn test_release_action_fires_on_a_foreign_thread() {
        let store = HeapStore::allocate(64).unwrap();
        store.write_u32_at(0, 7).unwrap();
        std::thread::spawn(move || {
            assert_eq!(store.read_u32_at(0).unwrap(), 7);
            store.release().unwrap();
        })
        .join()
        .unwrap();
    }
}
