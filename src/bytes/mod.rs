//! Streaming cursor over a byte store.
//!
//! [`Bytes`] adds sequential read/write state on top of any
//! [`ByteStore`]: a window `[start, end)` of the store, a `position`
//! cursor and a `limit`. The invariant `start <= position <= limit <= end`
//! holds at all times. All offsets in the public API are relative to the
//! window start, so a slice behaves exactly like a fresh buffer.

mod io;
mod stopbit;

pub use io::ObjectCodec;
pub use stopbit::{stop_bit_len, MAX_STOP_BIT_LEN};

use crate::error::{Error, Result};
use crate::raw;
use crate::store::{ByteStore, HeapStore, NativeStore};
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;

/// How sequential reads behave when fewer bytes remain than requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnderflowMode {
    /// Any shortfall is an error.
    #[default]
    Bounded,
    /// A read with nothing remaining yields the type's zero; a partial
    /// remainder is still an error.
    ZeroExtend,
    /// Bytes beyond the limit read as zero, never an error.
    Padded,
}

/// Tolerance used when deciding whether a float can take the compact
/// scaled-integer wire form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FloatMode {
    /// Bit-exact round-trip only.
    #[default]
    Exact,
    /// Allow one unit in the last place of drift.
    Ulp,
    /// Allow anything that rounds to the same 6 decimal places.
    Decimal6,
}

/// Outcome of claiming bytes for a sequential read.
enum ReadClaim {
    /// The full width is available at this address.
    Full(*const u8),
    /// Nothing remained; produce the type's zero.
    Empty,
    /// Only `avail` bytes remained at the address; zero-fill the rest.
    Partial { addr: *const u8, avail: usize },
}

/// Streaming cursor with absolute accessors over a reserved byte store.
///
/// Holds one reservation on the store for its whole lifetime; dropping
/// the cursor releases it. Cloning is deliberately not provided - use
/// [`Bytes::slice`] to get an independent cursor with its own
/// reservation.
pub struct Bytes {
    store: Arc<dyn ByteStore>,
    base: NonNull<u8>,
    read_only: bool,
    start: usize,
    end: usize,
    position: usize,
    limit: usize,
    underflow: UnderflowMode,
    float_mode: FloatMode,
}

// SAFETY: the cursor keeps its store alive through the Arc plus a
// reservation, and `base` is only dereferenced inside ranges validated
// against that window. Cursor state is only mutated through &mut self;
// concurrent plain access to the same underlying memory through other
// handles is the caller's concern, as for any shared region.
unsafe impl Send for Bytes {}
unsafe impl Sync for Bytes {}

impl Bytes {
    /// Wrap the whole of `store`, reserving it.
    pub fn wrap(store: Arc<dyn ByteStore>) -> Result<Self> {
        let capacity = store.capacity();
        Self::wrap_range(store, 0, capacity)
    }

    /// Wrap `[offset, offset + len)` of `store`, reserving it.
    pub fn wrap_range(store: Arc<dyn ByteStore>, offset: usize, len: usize) -> Result<Self> {
        let capacity = store.capacity();
        match offset.checked_add(len) {
            Some(end) if end <= capacity => {}
            _ => {
                return Err(Error::OutOfBounds {
                    offset,
                    len,
                    capacity,
                })
            }
        }
        store.reserve()?;
        let read_only = store.is_read_only();
        let base = match NonNull::new(store.base_ptr().cast_mut()) {
            Some(base) => base,
            None => {
                let _ = store.release();
                return Err(Error::Allocation("store base pointer is null".to_string()));
            }
        };
        Ok(Self {
            store,
            base,
            read_only,
            start: offset,
            end: offset + len,
            position: offset,
            limit: offset + len,
            underflow: UnderflowMode::default(),
            float_mode: FloatMode::default(),
        })
    }

    /// Allocate a zeroed heap store of `capacity` bytes and wrap it. The
    /// cursor owns the store's only reservation.
    pub fn alloc_heap(capacity: usize) -> Result<Self> {
        let store: Arc<dyn ByteStore> = Arc::new(HeapStore::allocate(capacity)?);
        let bytes = Self::wrap(Arc::clone(&store))?;
        store.release()?;
        Ok(bytes)
    }

    /// Allocate an anonymous native store of `capacity` bytes and wrap it.
    /// The cursor owns the store's only reservation.
    pub fn alloc_native(capacity: usize) -> Result<Self> {
        let store: Arc<dyn ByteStore> = Arc::new(NativeStore::allocate(capacity)?);
        let bytes = Self::wrap(Arc::clone(&store))?;
        store.release()?;
        Ok(bytes)
    }

    /// Replace the underflow mode.
    pub fn with_underflow_mode(mut self, mode: UnderflowMode) -> Self {
        self.underflow = mode;
        self
    }

    /// Replace the compact-float tolerance mode.
    pub fn with_float_mode(mut self, mode: FloatMode) -> Self {
        self.float_mode = mode;
        self
    }

    /// Active underflow mode.
    pub fn underflow_mode(&self) -> UnderflowMode {
        self.underflow
    }

    /// Set the underflow mode in place.
    pub fn set_underflow_mode(&mut self, mode: UnderflowMode) {
        self.underflow = mode;
    }

    /// Active compact-float tolerance mode.
    pub fn float_mode(&self) -> FloatMode {
        self.float_mode
    }

    /// Set the compact-float tolerance mode in place.
    pub fn set_float_mode(&mut self, mode: FloatMode) {
        self.float_mode = mode;
    }

    /// The store this cursor reads and writes.
    pub fn store(&self) -> &Arc<dyn ByteStore> {
        &self.store
    }

    /// Offset of this window within the store.
    pub fn window_offset(&self) -> usize {
        self.start
    }

    /// Window capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.end - self.start
    }

    /// Cursor position, relative to the window start.
    pub fn position(&self) -> usize {
        self.position - self.start
    }

    /// Move the cursor. `position` may not pass the limit.
    pub fn set_position(&mut self, position: usize) -> Result<()> {
        if position > self.limit - self.start {
            return Err(Error::OutOfBounds {
                offset: position,
                len: 0,
                capacity: self.limit - self.start,
            });
        }
        self.position = self.start + position;
        Ok(())
    }

    /// Current limit, relative to the window start.
    pub fn limit(&self) -> usize {
        self.limit - self.start
    }

    /// Move the limit. It may not pass the position in one direction nor
    /// the window capacity in the other.
    pub fn set_limit(&mut self, limit: usize) -> Result<()> {
        if limit < self.position() || limit > self.capacity() {
            return Err(Error::OutOfBounds {
                offset: limit,
                len: 0,
                capacity: self.capacity(),
            });
        }
        self.limit = self.start + limit;
        Ok(())
    }

    /// Bytes between the window start and the limit.
    pub fn len(&self) -> usize {
        self.limit - self.start
    }

    /// Whether the limit sits at the window start.
    pub fn is_empty(&self) -> bool {
        self.limit == self.start
    }

    /// Bytes between the position and the limit.
    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    /// Advance the position by `n` bytes without reading them.
    pub fn skip(&mut self, n: usize) -> Result<()> {
        let remaining = self.remaining();
        if n > remaining {
            return Err(Error::Underflow {
                needed: n,
                remaining,
            });
        }
        self.position += n;
        Ok(())
    }

    /// Switch from filling to draining: limit moves to the position, the
    /// position returns to the window start.
    pub fn flip(&mut self) {
        self.limit = self.position;
        self.position = self.start;
    }

    /// Reset for refilling: position returns to the window start, the
    /// limit to the window end. Contents are untouched.
    pub fn clear(&mut self) {
        self.position = self.start;
        self.limit = self.end;
    }

    /// Independent cursor over `[offset, offset + len)` of this window,
    /// with its own reservation on the store.
    pub fn slice(&self, offset: usize, len: usize) -> Result<Bytes> {
        let window = self.capacity();
        match offset.checked_add(len) {
            Some(end) if end <= window => {
                Bytes::wrap_range(Arc::clone(&self.store), self.start + offset, len)
            }
            _ => Err(Error::OutOfBounds {
                offset,
                len,
                capacity: window,
            }),
        }
    }

    // ------------------------------------------------------------------
    // sequential reads
    // ------------------------------------------------------------------

    #[inline]
    fn claim_read(&mut self, needed: usize) -> Result<ReadClaim> {
        let remaining = self.limit - self.position;
        if needed <= remaining {
            // SAFETY: position + needed <= limit <= end <= store capacity.
            let addr = unsafe { self.base.as_ptr().cast_const().add(self.position) };
            self.position += needed;
            return Ok(ReadClaim::Full(addr));
        }
        match self.underflow {
            UnderflowMode::Bounded => Err(Error::Underflow { needed, remaining }),
            UnderflowMode::ZeroExtend => {
                if remaining == 0 {
                    Ok(ReadClaim::Empty)
                } else {
                    Err(Error::Underflow { needed, remaining })
                }
            }
            UnderflowMode::Padded => {
                // SAFETY: position <= limit <= end; only `remaining` bytes
                // will be read from this address.
                let addr = unsafe { self.base.as_ptr().cast_const().add(self.position) };
                self.position = self.limit;
                Ok(ReadClaim::Partial {
                    addr,
                    avail: remaining,
                })
            }
        }
    }

    #[inline]
    fn read_le_bytes<const N: usize>(&mut self) -> Result<[u8; N]> {
        match self.claim_read(N)? {
            ReadClaim::Full(addr) => {
                let mut buf = [0u8; N];
                // SAFETY: claim_read validated N bytes at addr.
                unsafe { std::ptr::copy_nonoverlapping(addr, buf.as_mut_ptr(), N) };
                Ok(buf)
            }
            ReadClaim::Empty => Ok([0u8; N]),
            ReadClaim::Partial { addr, avail } => {
                let mut buf = [0u8; N];
                // SAFETY: claim_read validated `avail` bytes at addr.
                unsafe { std::ptr::copy_nonoverlapping(addr, buf.as_mut_ptr(), avail) };
                Ok(buf)
            }
        }
    }

    /// Read one byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_le_bytes::<1>()?[0])
    }

    /// Read one signed byte.
    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    /// Read a bool encoded as one byte (0 = false).
    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Read a little-endian `u16`.
    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read_le_bytes()?))
    }

    /// Read a little-endian `i16`.
    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(self.read_u16()? as i16)
    }

    /// Read a little-endian `u32`.
    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_le_bytes()?))
    }

    /// Read a little-endian `i32`.
    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    /// Read a little-endian `u64`.
    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_le_bytes()?))
    }

    /// Read a little-endian `i64`.
    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(self.read_u64()? as i64)
    }

    /// Read a little-endian `f32`.
    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    /// Read a little-endian `f64`.
    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    /// Fill `dst` from the stream, honoring the underflow mode exactly as
    /// the typed reads do: `Bounded` errors on any shortfall, `ZeroExtend`
    /// zero-fills only when nothing remains, `Padded` zero-fills the tail
    /// past the limit.
    pub fn read_raw(&mut self, dst: &mut [u8]) -> Result<()> {
        match self.claim_read(dst.len())? {
            ReadClaim::Full(addr) => {
                // SAFETY: claim_read validated dst.len() bytes at addr;
                // dst is a distinct Rust allocation.
                unsafe { std::ptr::copy_nonoverlapping(addr, dst.as_mut_ptr(), dst.len()) };
            }
            ReadClaim::Empty => dst.fill(0),
            ReadClaim::Partial { addr, avail } => {
                // SAFETY: claim_read validated `avail` bytes at addr.
                unsafe { std::ptr::copy_nonoverlapping(addr, dst.as_mut_ptr(), avail) };
                dst[avail..].fill(0);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // sequential writes
    // ------------------------------------------------------------------

    #[inline]
    fn claim_write(&mut self, needed: usize) -> Result<*mut u8> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let remaining = self.limit - self.position;
        if needed > remaining {
            return Err(Error::Overflow { needed, remaining });
        }
        // SAFETY: position + needed <= limit <= end <= store capacity.
        let addr = unsafe { self.base.as_ptr().add(self.position) };
        self.position += needed;
        Ok(addr)
    }

    /// Write one byte.
    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        let addr = self.claim_write(1)?;
        // SAFETY: claim_write validated the width.
        unsafe { raw::write_u8(addr, value) };
        Ok(())
    }

    /// Write one signed byte.
    pub fn write_i8(&mut self, value: i8) -> Result<()> {
        self.write_u8(value as u8)
    }

    /// Write a bool as one byte (1/0).
    pub fn write_bool(&mut self, value: bool) -> Result<()> {
        self.write_u8(u8::from(value))
    }

    /// Write a little-endian `u16`.
    pub fn write_u16(&mut self, value: u16) -> Result<()> {
        let addr = self.claim_write(2)?;
        // SAFETY: claim_write validated the width.
        unsafe { raw::write_u16(addr, value) };
        Ok(())
    }

    /// Write a little-endian `i16`.
    pub fn write_i16(&mut self, value: i16) -> Result<()> {
        self.write_u16(value as u16)
    }

    /// Write a little-endian `u32`.
    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        let addr = self.claim_write(4)?;
        // SAFETY: claim_write validated the width.
        unsafe { raw::write_u32(addr, value) };
        Ok(())
    }

    /// Write a little-endian `i32`.
    pub fn write_i32(&mut self, value: i32) -> Result<()> {
        self.write_u32(value as u32)
    }

    /// Write a little-endian `u64`.
    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        let addr = self.claim_write(8)?;
        // SAFETY: claim_write validated the width.
        unsafe { raw::write_u64(addr, value) };
        Ok(())
    }

    /// Write a little-endian `i64`.
    pub fn write_i64(&mut self, value: i64) -> Result<()> {
        self.write_u64(value as u64)
    }

    /// Write a little-endian `f32`.
    pub fn write_f32(&mut self, value: f32) -> Result<()> {
        self.write_u32(value.to_bits())
    }

    /// Write a little-endian `f64`.
    pub fn write_f64(&mut self, value: f64) -> Result<()> {
        self.write_u64(value.to_bits())
    }

    /// Append `src` to the stream.
    pub fn write_raw(&mut self, src: &[u8]) -> Result<()> {
        let addr = self.claim_write(src.len())?;
        // SAFETY: claim_write validated src.len() bytes; src is a distinct
        // Rust allocation.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), addr, src.len()) };
        Ok(())
    }

    // ------------------------------------------------------------------
    // absolute accessors (window-relative offsets, no cursor movement)
    // ------------------------------------------------------------------

    #[inline]
    fn abs_addr(&self, offset: usize, len: usize) -> Result<*const u8> {
        let window = self.end - self.start;
        match offset.checked_add(len) {
            Some(end) if end <= window => {
                // SAFETY: start + offset + len <= self.end <= capacity.
                Ok(unsafe { self.base.as_ptr().cast_const().add(self.start + offset) })
            }
            _ => Err(Error::OutOfBounds {
                offset,
                len,
                capacity: window,
            }),
        }
    }

    #[inline]
    fn abs_addr_mut(&mut self, offset: usize, len: usize) -> Result<*mut u8> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        Ok(self.abs_addr(offset, len)?.cast_mut())
    }

    /// Read the byte at `offset` from the window start.
    pub fn u8_at(&self, offset: usize) -> Result<u8> {
        let addr = self.abs_addr(offset, 1)?;
        // SAFETY: abs_addr validated the range.
        Ok(unsafe { raw::read_u8(addr) })
    }

    /// Read the little-endian `u16` at `offset`.
    pub fn u16_at(&self, offset: usize) -> Result<u16> {
        let addr = self.abs_addr(offset, 2)?;
        // SAFETY: abs_addr validated the range.
        Ok(unsafe { raw::read_u16(addr) })
    }

    /// Read the little-endian `u32` at `offset`.
    pub fn u32_at(&self, offset: usize) -> Result<u32> {
        let addr = self.abs_addr(offset, 4)?;
        // SAFETY: abs_addr validated the range.
        Ok(unsafe { raw::read_u32(addr) })
    }

    /// Read the little-endian `u64` at `offset`.
    pub fn u64_at(&self, offset: usize) -> Result<u64> {
        let addr = self.abs_addr(offset, 8)?;
        // SAFETY: abs_addr validated the range.
        Ok(unsafe { raw::read_u64(addr) })
    }

    /// Read the little-endian `i32` at `offset`.
    pub fn i32_at(&self, offset: usize) -> Result<i32> {
        Ok(self.u32_at(offset)? as i32)
    }

    /// Read the little-endian `i64` at `offset`.
    pub fn i64_at(&self, offset: usize) -> Result<i64> {
        Ok(self.u64_at(offset)? as i64)
    }

    /// Read the little-endian `f32` at `offset`.
    pub fn f32_at(&self, offset: usize) -> Result<f32> {
        Ok(f32::from_bits(self.u32_at(offset)?))
    }

    /// Read the little-endian `f64` at `offset`.
    pub fn f64_at(&self, offset: usize) -> Result<f64> {
        Ok(f64::from_bits(self.u64_at(offset)?))
    }

    /// Write a byte at `offset` from the window start.
    pub fn put_u8_at(&mut self, offset: usize, value: u8) -> Result<()> {
        let addr = self.abs_addr_mut(offset, 1)?;
        // SAFETY: abs_addr_mut validated the range and writability.
        unsafe { raw::write_u8(addr, value) };
        Ok(())
    }

    /// Write a little-endian `u16` at `offset`.
    pub fn put_u16_at(&mut self, offset: usize, value: u16) -> Result<()> {
        let addr = self.abs_addr_mut(offset, 2)?;
        // SAFETY: abs_addr_mut validated the range and writability.
        unsafe { raw::write_u16(addr, value) };
        Ok(())
    }

    /// Write a little-endian `u32` at `offset`.
    pub fn put_u32_at(&mut self, offset: usize, value: u32) -> Result<()> {
        let addr = self.abs_addr_mut(offset, 4)?;
        // SAFETY: abs_addr_mut validated the range and writability.
        unsafe { raw::write_u32(addr, value) };
        Ok(())
    }

    /// Write a little-endian `u64` at `offset`.
    pub fn put_u64_at(&mut self, offset: usize, value: u64) -> Result<()> {
        let addr = self.abs_addr_mut(offset, 8)?;
        // SAFETY: abs_addr_mut validated the range and writability.
        unsafe { raw::write_u64(addr, value) };
        Ok(())
    }

    /// Write a little-endian `i32` at `offset`.
    pub fn put_i32_at(&mut self, offset: usize, value: i32) -> Result<()> {
        self.put_u32_at(offset, value as u32)
    }

    /// Write a little-endian `i64` at `offset`.
    pub fn put_i64_at(&mut self, offset: usize, value: i64) -> Result<()> {
        self.put_u64_at(offset, value as u64)
    }

    /// Write a little-endian `f32` at `offset`.
    pub fn put_f32_at(&mut self, offset: usize, value: f32) -> Result<()> {
        self.put_u32_at(offset, value.to_bits())
    }

    /// Write a little-endian `f64` at `offset`.
    pub fn put_f64_at(&mut self, offset: usize, value: f64) -> Result<()> {
        self.put_u64_at(offset, value.to_bits())
    }

    // ------------------------------------------------------------------
    // text and blocks
    // ------------------------------------------------------------------

    /// Mode-governed read of `len` bytes into a fresh buffer, zero filled
    /// past the limit where the mode allows it. The claim happens before
    /// the allocation, so a shortfall surfaces before `len` sizes the
    /// buffer.
    fn read_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        let claim = self.claim_read(len)?;
        let mut buf = vec![0u8; len];
        match claim {
            ReadClaim::Full(addr) => {
                // SAFETY: claim_read validated `len` bytes at addr.
                unsafe { std::ptr::copy_nonoverlapping(addr, buf.as_mut_ptr(), len) };
            }
            ReadClaim::Empty => {}
            ReadClaim::Partial { addr, avail } => {
                // SAFETY: claim_read validated `avail` bytes at addr.
                unsafe { std::ptr::copy_nonoverlapping(addr, buf.as_mut_ptr(), avail) };
            }
        }
        Ok(buf)
    }

    /// Write a string as a stop-bit byte-length prefix plus UTF-8 bytes.
    pub fn write_utf8(&mut self, text: &str) -> Result<()> {
        self.write_stop_bit(text.len() as i64)?;
        self.write_raw(text.as_bytes())
    }

    /// Read a string written by [`Bytes::write_utf8`]. The payload bytes
    /// follow the underflow mode; under `Padded` a truncated text reads
    /// back NUL-extended.
    pub fn read_utf8(&mut self) -> Result<String> {
        let len = self.read_stop_bit()?;
        if len < 0 {
            return Err(Error::CorruptStream(format!("negative text length {len}")));
        }
        let buf = self.read_vec(len as usize)?;
        String::from_utf8(buf)
            .map_err(|err| Error::CorruptStream(format!("malformed UTF-8 text: {err}")))
    }

    /// Write a length-prefixed binary block.
    pub fn write_block(&mut self, payload: &[u8]) -> Result<()> {
        self.write_stop_bit(payload.len() as i64)?;
        self.write_raw(payload)
    }

    /// Read a block written by [`Bytes::write_block`]. The payload bytes
    /// follow the underflow mode; under `Padded` a truncated block reads
    /// back zero-extended to its prefixed length.
    pub fn read_block(&mut self) -> Result<Vec<u8>> {
        let len = self.read_stop_bit()?;
        if len < 0 {
            return Err(Error::CorruptStream(format!("negative block length {len}")));
        }
        self.read_vec(len as usize)
    }

    // ------------------------------------------------------------------
    // advisory word locks (window-relative offsets)
    // ------------------------------------------------------------------

    /// Try to take the `u32` advisory lock at `offset` from the window
    /// start. See [`ByteStore::try_lock_u32_at`].
    pub fn try_lock_u32_at(&self, offset: usize, owner: u32) -> Result<bool> {
        self.abs_addr(offset, 4)?;
        self.store.try_lock_u32_at(self.start + offset, owner)
    }

    /// Spin for the `u32` advisory lock at `offset` until the timeout.
    pub fn busy_lock_u32_at(&self, offset: usize, owner: u32, timeout: Duration) -> Result<bool> {
        self.abs_addr(offset, 4)?;
        self.store
            .busy_lock_u32_at(self.start + offset, owner, timeout)
    }

    /// Release the `u32` advisory lock at `offset`.
    pub fn unlock_u32_at(&self, offset: usize, owner: u32) -> Result<()> {
        self.abs_addr(offset, 4)?;
        self.store.unlock_u32_at(self.start + offset, owner)
    }

    /// Try to take the `u64` advisory lock at `offset` from the window
    /// start. See [`ByteStore::try_lock_u64_at`].
    pub fn try_lock_u64_at(&self, offset: usize, owner: u64) -> Result<bool> {
        self.abs_addr(offset, 8)?;
        self.store.try_lock_u64_at(self.start + offset, owner)
    }

    /// Spin for the `u64` advisory lock at `offset` until the timeout.
    pub fn busy_lock_u64_at(&self, offset: usize, owner: u64, timeout: Duration) -> Result<bool> {
        self.abs_addr(offset, 8)?;
        self.store
            .busy_lock_u64_at(self.start + offset, owner, timeout)
    }

    /// Release the `u64` advisory lock at `offset`.
    pub fn unlock_u64_at(&self, offset: usize, owner: u64) -> Result<()> {
        self.abs_addr(offset, 8)?;
        self.store.unlock_u64_at(self.start + offset, owner)
    }
}

impl Drop for Bytes {
    fn drop(&mut self) {
        if let Err(err) = self.store.release() {
            tracing::warn!(%err, "cursor release failed");
        }
    }
}

impl std::fmt::Debug for Bytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bytes")
            .field("kind", &self.store.kind())
            .field("window_offset", &self.start)
            .field("capacity", &self.capacity())
            .field("position", &self.position())
            .field("limit", &self.limit())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_round_trip_with_flip() {
        let mut bytes = Bytes::alloc_heap(128).unwrap();
        bytes.write_bool(true).unwrap();
        bytes.write_u8(0xAB).unwrap();
        bytes.write_i16(-12345).unwrap();
        bytes.write_u32(0xDEAD_BEEF).unwrap();
        bytes.write_i64(i64::MIN).unwrap();
        bytes.write_f64(1234.5678).unwrap();
        let written = bytes.position();

        bytes.flip();
        assert_eq!(bytes.limit(), written);
        assert!(bytes.read_bool().unwrap());
        assert_eq!(bytes.read_u8().unwrap(), 0xAB);
        assert_eq!(bytes.read_i16().unwrap(), -12345);
        assert_eq!(bytes.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(bytes.read_i64().unwrap(), i64::MIN);
        assert_eq!(bytes.read_f64().unwrap(), 1234.5678);
        assert_eq!(bytes.remaining(), 0);

        bytes.clear();
        assert_eq!(bytes.position(), 0);
        assert_eq!(bytes.limit(), 128);
    }

    #[test]
    fn test_cursor_invariants_are_enforced() {
        let mut bytes = Bytes::alloc_heap(32).unwrap();
        bytes.write_u64(1).unwrap();
        bytes.flip();
        // position may not pass the limit
        assert!(bytes.set_position(9).is_err());
        bytes.set_position(8).unwrap();
        // limit may not retreat past the position
        assert!(bytes.set_limit(7).is_err());
        // nor pass the capacity
        assert!(bytes.set_limit(33).is_err());
        bytes.set_limit(32).unwrap();
        assert_eq!(bytes.remaining(), 24);
        assert!(bytes.skip(25).is_err());
        bytes.skip(24).unwrap();
        assert_eq!(bytes.remaining(), 0);
    }

    #[test]
    fn test_bounded_mode_errors_on_shortfall() {
        let mut bytes = Bytes::alloc_heap(16).unwrap();
        bytes.write_u16(7).unwrap();
        bytes.flip();
        let err = bytes.read_u32().unwrap_err();
        match err {
            Error::Underflow { needed, remaining } => {
                assert_eq!(needed, 4);
                assert_eq!(remaining, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_zero_extend_mode_zeroes_only_when_empty() {
        let mut bytes = Bytes::alloc_heap(16)
            .unwrap()
            .with_underflow_mode(UnderflowMode::ZeroExtend);
        bytes.write_u16(0xFFFF).unwrap();
        bytes.flip();
        // partial remainder still errors
        assert!(bytes.read_u32().is_err());
        bytes.read_u16().unwrap();
        // empty reads yield zeros
        assert_eq!(bytes.read_u32().unwrap(), 0);
        assert_eq!(bytes.read_u64().unwrap(), 0);
        assert!(!bytes.read_bool().unwrap());
    }

    #[test]
    fn test_padded_mode_zero_fills_high_bytes() {
        let mut bytes = Bytes::alloc_heap(16)
            .unwrap()
            .with_underflow_mode(UnderflowMode::Padded);
        bytes.write_u16(0xBBAA).unwrap();
        bytes.flip();
        // two real bytes, two zeros
        assert_eq!(bytes.read_u32().unwrap(), 0x0000_BBAA);
        assert_eq!(bytes.remaining(), 0);
        // completely drained reads are all zeros
        assert_eq!(bytes.read_u64().unwrap(), 0);
    }

    #[test]
    fn test_writes_past_the_limit_always_error() {
        let mut bytes = Bytes::alloc_heap(8)
            .unwrap()
            .with_underflow_mode(UnderflowMode::Padded);
        bytes.write_u64(1).unwrap();
        let err = bytes.write_u8(2).unwrap_err();
        assert!(matches!(err, Error::Overflow { .. }));
    }

    #[test]
    fn test_absolute_accessors_do_not_move_the_cursor() {
        let mut bytes = Bytes::alloc_heap(64).unwrap();
        bytes.put_u64_at(16, 0x0123_4567_89AB_CDEF).unwrap();
        assert_eq!(bytes.position(), 0);
        assert_eq!(bytes.u64_at(16).unwrap(), 0x0123_4567_89AB_CDEF);
        assert_eq!(bytes.u8_at(16).unwrap(), 0xEF);
        assert_eq!(bytes.f64_at(16).unwrap().to_bits(), 0x0123_4567_89AB_CDEF);
        assert!(bytes.u64_at(57).is_err());
        assert!(bytes.put_u8_at(64, 0).is_err());
    }

    #[test]
    fn test_slices_are_window_relative() {
        let mut bytes = Bytes::alloc_heap(64).unwrap();
        bytes.put_u32_at(40, 0xCAFE_F00D).unwrap();

        let slice = bytes.slice(32, 16).unwrap();
        assert_eq!(slice.capacity(), 16);
        assert_eq!(slice.position(), 0);
        assert_eq!(slice.u32_at(8).unwrap(), 0xCAFE_F00D);
        assert!(slice.u32_at(13).is_err());
        assert!(bytes.slice(60, 8).is_err());

        // the slice holds its own reservation
        assert_eq!(bytes.store().refs().count(), 2);
        drop(slice);
        assert_eq!(bytes.store().refs().count(), 1);
    }

    #[test]
    fn test_utf8_round_trip_and_corruption() {
        let mut bytes = Bytes::alloc_heap(128).unwrap();
        bytes.write_utf8("caffè ☕").unwrap();
        bytes.write_utf8("").unwrap();
        bytes.flip();
        assert_eq!(bytes.read_utf8().unwrap(), "caffè ☕");
        assert_eq!(bytes.read_utf8().unwrap(), "");

        // corrupt the payload behind the length prefix
        let mut bytes = Bytes::alloc_heap(16).unwrap();
        bytes.write_utf8("ok").unwrap();
        bytes.put_u8_at(1, 0xFF).unwrap();
        bytes.flip();
        assert!(matches!(
            bytes.read_utf8(),
            Err(Error::CorruptStream(_))
        ));
    }

    #[test]
    fn test_truncated_utf8_length_is_underflow() {
        let mut bytes = Bytes::alloc_heap(16).unwrap();
        bytes.write_stop_bit(12).unwrap();
        bytes.write_raw(b"shor").unwrap();
        bytes.flip();
        assert!(matches!(bytes.read_utf8(), Err(Error::Underflow { .. })));
    }

    #[test]
    fn test_block_round_trip() {
        let mut bytes = Bytes::alloc_heap(64).unwrap();
        bytes.write_block(&[1, 2, 3, 4, 5]).unwrap();
        bytes.write_block(&[]).unwrap();
        bytes.flip();
        assert_eq!(bytes.read_block().unwrap(), vec![1, 2, 3, 4, 5]);
        assert_eq!(bytes.read_block().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_cursor_advisory_lock_uses_window_offsets() {
        let bytes = Bytes::alloc_native(4096).unwrap();
        let window = bytes.slice(64, 64).unwrap();
        assert!(window.try_lock_u64_at(0, 1).unwrap());
        // the same word through the parent window is held
        assert!(!bytes.try_lock_u64_at(64, 2).unwrap());
        window.unlock_u64_at(0, 1).unwrap();
        assert!(bytes.try_lock_u64_at(64, 2).unwrap());
        bytes.unlock_u64_at(64, 2).unwrap();
        assert!(window.unlock_u64_at(0, 9).is_err());
    }

    #[test]
    fn test_wrap_range_rejects_bad_windows() {
        let store: Arc<dyn ByteStore> = Arc::new(HeapStore::allocate(32).unwrap());
        assert!(Bytes::wrap_range(Arc::clone(&store), 16, 17).is_err());
        let bytes = Bytes::wrap_range(store, 16, 16).unwrap();
        assert_eq!(bytes.window_offset(), 16);
        assert_eq!(bytes.capacity(), 16);
    }
}
