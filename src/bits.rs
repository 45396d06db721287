//! Bit-addressable view over a byte store.
//!
//! A [`BitSet`] treats a span of a store as `bit_len` bits packed into
//! 64-bit little-endian words, so the on-disk layout of a mapped store is
//! the same on every target. Plain operations take `&mut self`;
//! [`BitSet::set_atomic`] is the one cross-thread entry point and goes
//! through a word CAS.

use crate::error::{Error, Result};
use crate::raw;
use crate::store::ByteStore;
use std::ptr::NonNull;
use std::sync::Arc;

const WORD_BITS: usize = 64;
const WORD_BYTES: usize = 8;

/// Fixed-length bit vector living inside a byte store.
///
/// Holds one reservation on the store; dropping the set releases it.
pub struct BitSet {
    store: Arc<dyn ByteStore>,
    base: NonNull<u8>,
    byte_offset: usize,
    bit_len: usize,
    read_only: bool,
}

// SAFETY: the set keeps its store alive through the Arc plus a
// reservation; word access stays inside the span validated at wrap time.
unsafe impl Send for BitSet {}
unsafe impl Sync for BitSet {}

impl BitSet {
    /// View `bit_len` bits starting at `byte_offset` of `store`.
    ///
    /// The span occupies whole 64-bit words, so `byte_offset` must be
    /// 8-aligned and the store must hold `ceil(bit_len / 64)` words.
    pub fn wrap(store: Arc<dyn ByteStore>, byte_offset: usize, bit_len: usize) -> Result<Self> {
        if bit_len == 0 {
            return Err(Error::Allocation(
                "bit length must be greater than 0".to_string(),
            ));
        }
        let byte_len = bit_len.div_ceil(WORD_BITS) * WORD_BYTES;
        match byte_offset.checked_add(byte_len) {
            Some(end) if end <= store.capacity() => {}
            _ => {
                return Err(Error::OutOfBounds {
                    offset: byte_offset,
                    len: byte_len,
                    capacity: store.capacity(),
                })
            }
        }
        store.check_atomic(byte_offset, WORD_BYTES)?;
        store.reserve()?;
        let read_only = store.is_read_only();
        // base_ptr is non-null for a live store; offset stays in bounds.
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
            byte_offset,
            bit_len,
            read_only,
        })
    }

    /// Number of addressable bits.
    pub fn bit_len(&self) -> usize {
        self.bit_len
    }

    /// The store the bits live in.
    pub fn store(&self) -> &Arc<dyn ByteStore> {
        &self.store
    }

    #[inline]
    fn word_ptr(&self, word: usize) -> *mut u8 {
        // SAFETY: word index was derived from a validated bit index.
        unsafe {
            self.base
                .as_ptr()
                .add(self.byte_offset + word * WORD_BYTES)
        }
    }

    #[inline]
    fn load_word(&self, word: usize) -> u64 {
        // SAFETY: in bounds per word_ptr; plain little-endian load.
        unsafe { raw::read_u64(self.word_ptr(word)) }
    }

    #[inline]
    fn store_word(&mut self, word: usize, value: u64) {
        // SAFETY: in bounds per word_ptr; writability checked by callers.
        unsafe { raw::write_u64(self.word_ptr(word), value) };
    }

    #[inline]
    fn check_bit(&self, index: usize) -> Result<(usize, u64)> {
        if index >= self.bit_len {
            return Err(Error::OutOfBounds {
                offset: index,
                len: 1,
                capacity: self.bit_len,
            });
        }
        Ok((index / WORD_BITS, 1u64 << (index % WORD_BITS)))
    }

    #[inline]
    fn check_range(&self, from: usize, to: usize) -> Result<()> {
        if from > to || to > self.bit_len {
            return Err(Error::OutOfBounds {
                offset: from,
                len: to.saturating_sub(from),
                capacity: self.bit_len,
            });
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    /// Whether bit `index` is set.
    pub fn get(&self, index: usize) -> Result<bool> {
        let (word, mask) = self.check_bit(index)?;
        Ok(self.load_word(word) & mask != 0)
    }

    /// Set bit `index`.
    pub fn set(&mut self, index: usize) -> Result<()> {
        self.check_writable()?;
        let (word, mask) = self.check_bit(index)?;
        let value = self.load_word(word) | mask;
        self.store_word(word, value);
        Ok(())
    }

    /// Clear bit `index`.
    pub fn clear(&mut self, index: usize) -> Result<()> {
        self.check_writable()?;
        let (word, mask) = self.check_bit(index)?;
        let value = self.load_word(word) & !mask;
        self.store_word(word, value);
        Ok(())
    }

    /// Invert bit `index`.
    pub fn flip(&mut self, index: usize) -> Result<()> {
        self.check_writable()?;
        let (word, mask) = self.check_bit(index)?;
        let value = self.load_word(word) ^ mask;
        self.store_word(word, value);
        Ok(())
    }

    /// Set every bit in `[from, to)`.
    pub fn set_range(&mut self, from: usize, to: usize) -> Result<()> {
        self.check_writable()?;
        self.check_range(from, to)?;
        self.apply_range(from, to, |word, mask| word | mask);
        Ok(())
    }

    /// Clear every bit in `[from, to)`.
    pub fn clear_range(&mut self, from: usize, to: usize) -> Result<()> {
        self.check_writable()?;
        self.check_range(from, to)?;
        self.apply_range(from, to, |word, mask| word & !mask);
        Ok(())
    }

    /// Invert every bit in `[from, to)`.
    pub fn flip_range(&mut self, from: usize, to: usize) -> Result<()> {
        self.check_writable()?;
        self.check_range(from, to)?;
        self.apply_range(from, to, |word, mask| word ^ mask);
        Ok(())
    }

    fn apply_range(&mut self, from: usize, to: usize, op: impl Fn(u64, u64) -> u64) {
        if from == to {
            return;
        }
        let first_word = from / WORD_BITS;
        let last_word = (to - 1) / WORD_BITS;
        let first_mask = !0u64 << (from % WORD_BITS);
        let last_mask = !0u64 >> (WORD_BITS - 1 - (to - 1) % WORD_BITS);
        if first_word == last_word {
            let mask = first_mask & last_mask;
            let value = op(self.load_word(first_word), mask);
            self.store_word(first_word, value);
        } else {
            let value = op(self.load_word(first_word), first_mask);
            self.store_word(first_word, value);
            for word in first_word + 1..last_word {
                let value = op(self.load_word(word), !0u64);
                self.store_word(word, value);
            }
            let value = op(self.load_word(last_word), last_mask);
            self.store_word(last_word, value);
        }
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> usize {
        let full_words = self.bit_len / WORD_BITS;
        let mut total = 0usize;
        for word in 0..full_words {
            total += self.load_word(word).count_ones() as usize;
        }
        let tail_bits = self.bit_len % WORD_BITS;
        if tail_bits > 0 {
            let mask = (1u64 << tail_bits) - 1;
            total += (self.load_word(full_words) & mask).count_ones() as usize;
        }
        total
    }

    /// Atomically test-and-set bit `index`. Returns whether this call set
    /// it (false means it was already set).
    ///
    /// The CAS sees the word in native order; the mask is byte-swapped to
    /// line up with the little-endian stored layout, so atomic and plain
    /// operations agree on which bit is which.
    pub fn set_atomic(&self, index: usize) -> Result<bool> {
        self.check_writable()?;
        let (word, mask) = self.check_bit(index)?;
        let native_mask = mask.to_le();
        let ptr = self.word_ptr(word);
        loop {
            // SAFETY: check_atomic at wrap time covers every word of the
            // span (byte_offset is 8-aligned).
            let current = unsafe { raw::read_volatile_u64(ptr) };
            if current & native_mask != 0 {
                return Ok(false);
            }
            // SAFETY: as above.
            if unsafe { raw::cas_u64(ptr, current, current | native_mask) } {
                return Ok(true);
            }
            std::hint::spin_loop();
        }
    }
}

impl Drop for BitSet {
    fn drop(&mut self) {
        if let Err(err) = self.store.release() {
            tracing::warn!(%err, "bit set release failed");
        }
    }
}

impl std::fmt::Debug for BitSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitSet")
            .field("byte_offset", &self.byte_offset)
            .field("bit_len", &self.bit_len)
            .field("count_ones", &self.count_ones())
            .finish()
    }
}
