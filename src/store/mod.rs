//! Byte store backends and the unified random-access trait.
//!
//! A store is a fixed-capacity region of addressable memory: a heap
//! allocation, an anonymous native mapping, or a window of a memory-mapped
//! file. All backends expose the same bounds-checked accessors through
//! [`ByteStore`] and share the reserve/release lifecycle from
//! [`crate::refcount`].

mod heap;
mod mapped;
mod native;

pub use heap::HeapStore;
pub use mapped::{FileHandle, MappedStore};
pub use native::NativeStore;

use crate::error::{Error, Result};
use crate::raw;
use crate::refcount::RefCount;
use std::ptr::NonNull;
use std::time::{Duration, Instant};

/// The kind of memory backing a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKind {
    /// Heap allocation, private to this process.
    Heap,
    /// Anonymous native mapping, private to this process.
    Native,
    /// Memory-mapped file window, shareable across processes.
    Mapped,
}

/// Pointer wrapper that lets release actions move a raw base address into
/// a `Send` closure.
///
/// SAFETY: holders only touch the pointer from the single release action
/// (or its Drop backstop), never concurrently.
pub(crate) struct SendPtr(NonNull<u8>);

// SAFETY: see the type-level comment.
unsafe impl Send for SendPtr {}

impl SendPtr {
    /// Raw address, read through the wrapper so a closure captures
    /// `SendPtr` itself; naming the field would capture only the
    /// non-`Send` `NonNull` inside it.
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.0.as_ptr()
    }
}

/// Fixed-capacity region of addressable memory.
///
/// Multi-byte plain accessors are little-endian regardless of target, so a
/// store persisted to a file reads the same everywhere. The fenced and
/// compare-and-swap accessors operate on native machine words and require
/// natural alignment.
///
/// Plain accessors are deliberately not serialized: concurrent plain access
/// to overlapping ranges is the caller's problem, exactly as it would be
/// for any shared memory region. The atomic accessors and the advisory
/// word locks are the tools for coordination.
pub trait ByteStore: Send + Sync {
    /// Base address of the region.
    ///
    /// Valid while the reference count is above zero.
    fn base_ptr(&self) -> *const u8;

    /// Capacity of the region in bytes.
    fn capacity(&self) -> usize;

    /// The reference count guarding the region's lifetime.
    fn refs(&self) -> &RefCount;

    /// The kind of memory backing this store.
    fn kind(&self) -> StoreKind;

    /// Whether mutating accessors are rejected.
    fn is_read_only(&self) -> bool {
        false
    }

    /// Increment the reference count, failing once the region is gone.
    fn reserve(&self) -> Result<()> {
        self.refs().reserve()
    }

    /// Increment the reference count if the region is still live.
    fn try_reserve(&self) -> bool {
        self.refs().try_reserve()
    }

    /// Decrement the reference count, freeing the region on the last one.
    fn release(&self) -> Result<()> {
        self.refs().release()
    }

    /// Validate that `[offset, offset + len)` lies inside the region.
    #[inline]
    fn check_bounds(&self, offset: usize, len: usize) -> Result<()> {
        debug_assert!(self.refs().count() > 0, "access to a released store");
        let capacity = self.capacity();
        match offset.checked_add(len) {
            Some(end) if end <= capacity => Ok(()),
            _ => Err(Error::OutOfBounds {
                offset,
                len,
                capacity,
            }),
        }
    }

    /// Validate bounds plus writability.
    #[inline]
    fn check_writable(&self, offset: usize, len: usize) -> Result<()> {
        if self.is_read_only() {
            return Err(Error::ReadOnly);
        }
        self.check_bounds(offset, len)
    }

    /// Validate bounds plus the natural alignment an atomic access needs.
    #[inline]
    fn check_atomic(&self, offset: usize, align: usize) -> Result<()> {
        self.check_bounds(offset, align)?;
        if (self.base_ptr() as usize + offset) % align != 0 {
            return Err(Error::Misaligned { offset, align });
        }
        Ok(())
    }

    /// Validate atomic access plus writability.
    #[inline]
    fn check_atomic_writable(&self, offset: usize, align: usize) -> Result<()> {
        if self.is_read_only() {
            return Err(Error::ReadOnly);
        }
        self.check_atomic(offset, align)
    }

    /// Read the byte at `offset`.
    #[inline]
    fn read_u8_at(&self, offset: usize) -> Result<u8> {
        self.check_bounds(offset, 1)?;
        // SAFETY: bounds checked; the region outlives the call.
        Ok(unsafe { raw::read_u8(self.base_ptr().add(offset)) })
    }

    /// Write a byte at `offset`.
    #[inline]
    fn write_u8_at(&self, offset: usize, value: u8) -> Result<()> {
        self.check_writable(offset, 1)?;
        // SAFETY: bounds and writability checked.
        unsafe { raw::write_u8(self.base_ptr().cast_mut().add(offset), value) };
        Ok(())
    }

    /// Read the byte at `offset` as a boolean; any non-zero byte is true.
    #[inline]
    fn read_bool_at(&self, offset: usize) -> Result<bool> {
        Ok(self.read_u8_at(offset)? != 0)
    }

    /// Write a boolean at `offset` as one byte, 1 for true.
    #[inline]
    fn write_bool_at(&self, offset: usize, value: bool) -> Result<()> {
        self.write_u8_at(offset, u8::from(value))
    }

    /// Read the little-endian `u16` at `offset`.
    #[inline]
    fn read_u16_at(&self, offset: usize) -> Result<u16> {
        self.check_bounds(offset, 2)?;
        // SAFETY: bounds checked.
        Ok(unsafe { raw::read_u16(self.base_ptr().add(offset)) })
    }

    /// Write a little-endian `u16` at `offset`.
    #[inline]
    fn write_u16_at(&self, offset: usize, value: u16) -> Result<()> {
        self.check_writable(offset, 2)?;
        // SAFETY: bounds and writability checked.
        unsafe { raw::write_u16(self.base_ptr().cast_mut().add(offset), value) };
        Ok(())
    }

    /// Read the little-endian `u32` at `offset`.
    #[inline]
    fn read_u32_at(&self, offset: usize) -> Result<u32> {
        self.check_bounds(offset, 4)?;
        // SAFETY: bounds checked.
        Ok(unsafe { raw::read_u32(self.base_ptr().add(offset)) })
    }

    /// Write a little-endian `u32` at `offset`.
    #[inline]
    fn write_u32_at(&self, offset: usize, value: u32) -> Result<()> {
        self.check_writable(offset, 4)?;
        // SAFETY: bounds and writability checked.
        unsafe { raw::write_u32(self.base_ptr().cast_mut().add(offset), value) };
        Ok(())
    }

    /// Read the little-endian `u64` at `offset`.
    #[inline]
    fn read_u64_at(&self, offset: usize) -> Result<u64> {
        self.check_bounds(offset, 8)?;
        // SAFETY: bounds checked.
        Ok(unsafe { raw::read_u64(self.base_ptr().add(offset)) })
    }

    /// Write a little-endian `u64` at `offset`.
    #[inline]
    fn write_u64_at(&self, offset: usize, value: u64) -> Result<()> {
        self.check_writable(offset, 8)?;
        // SAFETY: bounds and writability checked.
        unsafe { raw::write_u64(self.base_ptr().cast_mut().add(offset), value) };
        Ok(())
    }

    /// Read the little-endian `f32` at `offset`.
    #[inline]
    fn read_f32_at(&self, offset: usize) -> Result<f32> {
        Ok(f32::from_bits(self.read_u32_at(offset)?))
    }

    /// Write a little-endian `f32` at `offset`.
    #[inline]
    fn write_f32_at(&self, offset: usize, value: f32) -> Result<()> {
        self.write_u32_at(offset, value.to_bits())
    }

    /// Read the little-endian `f64` at `offset`.
    #[inline]
    fn read_f64_at(&self, offset: usize) -> Result<f64> {
        Ok(f64::from_bits(self.read_u64_at(offset)?))
    }

    /// Write a little-endian `f64` at `offset`.
    #[inline]
    fn write_f64_at(&self, offset: usize, value: f64) -> Result<()> {
        self.write_u64_at(offset, value.to_bits())
    }

    /// Copy `dst.len()` bytes starting at `offset` into `dst`.
    fn copy_to(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.check_bounds(offset, dst.len())?;
        // SAFETY: bounds checked; dst is a distinct Rust allocation.
        unsafe {
            std::ptr::copy_nonoverlapping(self.base_ptr().add(offset), dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    /// Copy `src` into the region starting at `offset`.
    fn copy_from(&self, offset: usize, src: &[u8]) -> Result<()> {
        self.check_writable(offset, src.len())?;
        // SAFETY: bounds and writability checked; src is a distinct
        // Rust allocation.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.base_ptr().cast_mut().add(offset), src.len());
        }
        Ok(())
    }

    /// Zero `[offset, offset + len)`.
    fn fill_zero(&self, offset: usize, len: usize) -> Result<()> {
        self.check_writable(offset, len)?;
        // SAFETY: bounds and writability checked.
        unsafe {
            std::ptr::write_bytes(self.base_ptr().cast_mut().add(offset), 0, len);
        }
        Ok(())
    }

    /// Acquire-load the native `u32` word at `offset`.
    fn read_volatile_u32_at(&self, offset: usize) -> Result<u32> {
        self.check_atomic(offset, 4)?;
        // SAFETY: bounds and alignment checked.
        Ok(unsafe { raw::read_volatile_u32(self.base_ptr().add(offset)) })
    }

    /// Release-store the native `u32` word at `offset`.
    fn write_ordered_u32_at(&self, offset: usize, value: u32) -> Result<()> {
        self.check_atomic_writable(offset, 4)?;
        // SAFETY: bounds, alignment and writability checked.
        unsafe { raw::write_ordered_u32(self.base_ptr().cast_mut().add(offset), value) };
        Ok(())
    }

    /// Acquire-load the native `u64` word at `offset`.
    fn read_volatile_u64_at(&self, offset: usize) -> Result<u64> {
        self.check_atomic(offset, 8)?;
        // SAFETY: bounds and alignment checked.
        Ok(unsafe { raw::read_volatile_u64(self.base_ptr().add(offset)) })
    }

    /// Release-store the native `u64` word at `offset`.
    fn write_ordered_u64_at(&self, offset: usize, value: u64) -> Result<()> {
        self.check_atomic_writable(offset, 8)?;
        // SAFETY: bounds, alignment and writability checked.
        unsafe { raw::write_ordered_u64(self.base_ptr().cast_mut().add(offset), value) };
        Ok(())
    }

    /// Compare-and-swap the native `u32` word at `offset`. Returns whether
    /// the swap happened.
    fn cas_u32_at(&self, offset: usize, expected: u32, new: u32) -> Result<bool> {
        self.check_atomic_writable(offset, 4)?;
        // SAFETY: bounds, alignment and writability checked.
        Ok(unsafe { raw::cas_u32(self.base_ptr().cast_mut().add(offset), expected, new) })
    }

    /// Compare-and-swap the native `u64` word at `offset`. Returns whether
    /// the swap happened.
    fn cas_u64_at(&self, offset: usize, expected: u64, new: u64) -> Result<bool> {
        self.check_atomic_writable(offset, 8)?;
        // SAFETY: bounds, alignment and writability checked.
        Ok(unsafe { raw::cas_u64(self.base_ptr().cast_mut().add(offset), expected, new) })
    }

    /// Try to take the word-sized advisory lock at `offset`.
    ///
    /// The lock is a bare CAS from 0 to `owner`. `owner` must be non-zero
    /// and identifies the holder (typically a thread or process token
    /// chosen by the caller).
    fn try_lock_u32_at(&self, offset: usize, owner: u32) -> Result<bool> {
        debug_assert!(owner != 0, "owner token must be non-zero");
        self.cas_u32_at(offset, 0, owner)
    }

    /// Spin until the `u32` advisory lock at `offset` is taken or the
    /// timeout elapses. Returns whether the lock was taken.
    fn busy_lock_u32_at(&self, offset: usize, owner: u32, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_lock_u32_at(offset, owner)? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::hint::spin_loop();
            std::thread::yield_now();
        }
    }

    /// Release the `u32` advisory lock at `offset`. Fails if `owner` does
    /// not hold it.
    fn unlock_u32_at(&self, offset: usize, owner: u32) -> Result<()> {
        if self.cas_u32_at(offset, owner, 0)? {
            Ok(())
        } else {
            Err(Error::LockState(format!(
                "word lock at offset {offset} not held by owner {owner:#x}"
            )))
        }
    }

    /// Try to take the 64-bit advisory lock at `offset`. See
    /// [`ByteStore::try_lock_u32_at`].
    fn try_lock_u64_at(&self, offset: usize, owner: u64) -> Result<bool> {
        debug_assert!(owner != 0, "owner token must be non-zero");
        self.cas_u64_at(offset, 0, owner)
    }

    /// Spin until the `u64` advisory lock at `offset` is taken or the
    /// timeout elapses. Returns whether the lock was taken.
    fn busy_lock_u64_at(&self, offset: usize, owner: u64, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_lock_u64_at(offset, owner)? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::hint::spin_loop();
            std::thread::yield_now();
        }
    }

    /// Release the `u64` advisory lock at `offset`. Fails if `owner` does
    /// not hold it.
    fn unlock_u64_at(&self, offset: usize, owner: u64) -> Result<()> {
        if self.cas_u64_at(offset, owner, 0)? {
            Ok(())
        } else {
            Err(Error::LockState(format!(
                "word lock at offset {offset} not held by owner {owner:#x}"
            )))
        }
    }
}
