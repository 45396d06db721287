//! Raw memory primitives: unaligned plain access, fenced access, and
//! compare-and-swap at arbitrary addresses.
//!
//! This is the leaf layer of the crate. Nothing here validates anything:
//! callers (the store layer) own bounds checking and, for the atomic
//! operations, natural alignment. Plain multi-byte values are fixed
//! little-endian so stores and files read the same on every target; the
//! atomic operations work on native machine words.

use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};

/// Read a byte at `addr`.
///
/// # Safety
///
/// `addr` must be valid for a 1-byte read.
#[inline]
pub unsafe fn read_u8(addr: *const u8) -> u8 {
    // SAFETY: caller guarantees validity.
    unsafe { addr.read() }
}

/// Write a byte at `addr`.
///
/// # Safety
///
/// `addr` must be valid for a 1-byte write.
#[inline]
pub unsafe fn write_u8(addr: *mut u8, value: u8) {
    // SAFETY: caller guarantees validity.
    unsafe { addr.write(value) }
}

/// Read a little-endian `u16` at `addr`. No alignment required.
///
/// # Safety
///
/// `addr` must be valid for a 2-byte read.
#[inline]
pub unsafe fn read_u16(addr: *const u8) -> u16 {
    // SAFETY: caller guarantees validity; read_unaligned has no alignment
    // requirement.
    u16::from_le(unsafe { addr.cast::<u16>().read_unaligned() })
}

/// Write a little-endian `u16` at `addr`. No alignment required.
///
/// # Safety
///
/// `addr` must be valid for a 2-byte write.
#[inline]
pub unsafe fn write_u16(addr: *mut u8, value: u16) {
    // SAFETY: caller guarantees validity.
    unsafe { addr.cast::<u16>().write_unaligned(value.to_le()) }
}

/// Read a little-endian `u32` at `addr`. No alignment required.
///
/// # Safety
///
/// `addr` must be valid for a 4-byte read.
#[inline]
pub unsafe fn read_u32(addr: *const u8) -> u32 {
    // SAFETY: caller guarantees validity.
    u32::from_le(unsafe { addr.cast::<u32>().read_unaligned() })
}

/// Write a little-endian `u32` at `addr`. No alignment required.
///
/// # Safety
///
/// `addr` must be valid for a 4-byte write.
#[inline]
pub unsafe fn write_u32(addr: *mut u8, value: u32) {
    // SAFETY: caller guarantees validity.
    unsafe { addr.cast::<u32>().write_unaligned(value.to_le()) }
}

/// Read a little-endian `u64` at `addr`. No alignment required.
///
/// # Safety
///
/// `addr` must be valid for an 8-byte read.
#[inline]
pub unsafe fn read_u64(addr: *const u8) -> u64 {
    // SAFETY: caller guarantees validity.
    u64::from_le(unsafe { addr.cast::<u64>().read_unaligned() })
}

/// Write a little-endian `u64` at `addr`. No alignment required.
///
/// # Safety
///
/// `addr` must be valid for an 8-byte write.
#[inline]
pub unsafe fn write_u64(addr: *mut u8, value: u64) {
    // SAFETY: caller guarantees validity.
    unsafe { addr.cast::<u64>().write_unaligned(value.to_le()) }
}

/// Read a signed byte at `addr`.
///
/// # Safety
///
/// `addr` must be valid for a 1-byte read.
#[inline]
pub unsafe fn read_i8(addr: *const u8) -> i8 {
    // SAFETY: same contract as read_u8.
    (unsafe { read_u8(addr) }) as i8
}

/// Write a signed byte at `addr`.
///
/// # Safety
///
/// `addr` must be valid for a 1-byte write.
#[inline]
pub unsafe fn write_i8(addr: *mut u8, value: i8) {
    // SAFETY: same contract as write_u8.
    unsafe { write_u8(addr, value as u8) }
}

/// Read a little-endian `i16` at `addr`. No alignment required.
///
/// # Safety
///
/// `addr` must be valid for a 2-byte read.
#[inline]
pub unsafe fn read_i16(addr: *const u8) -> i16 {
    // SAFETY: same contract as read_u16.
    (unsafe { read_u16(addr) }) as i16
}

/// Write a little-endian `i16` at `addr`. No alignment required.
///
/// # Safety
///
/// `addr` must be valid for a 2-byte write.
#[inline]
pub unsafe fn write_i16(addr: *mut u8, value: i16) {
    // SAFETY: same contract as write_u16.
    unsafe { write_u16(addr, value as u16) }
}

/// Read a little-endian `i32` at `addr`. No alignment required.
///
/// # Safety
///
/// `addr` must be valid for a 4-byte read.
#[inline]
pub unsafe fn read_i32(addr: *const u8) -> i32 {
    // SAFETY: same contract as read_u32.
    (unsafe { read_u32(addr) }) as i32
}

/// Write a little-endian `i32` at `addr`. No alignment required.
///
/// # Safety
///
/// `addr` must be valid for a 4-byte write.
#[inline]
pub unsafe fn write_i32(addr: *mut u8, value: i32) {
    // SAFETY: same contract as write_u32.
    unsafe { write_u32(addr, value as u32) }
}

/// Read a little-endian `i64` at `addr`. No alignment required.
///
/// # Safety
///
/// `addr` must be valid for an 8-byte read.
#[inline]
pub unsafe fn read_i64(addr: *const u8) -> i64 {
    // SAFETY: same contract as read_u64.
    (unsafe { read_u64(addr) }) as i64
}

/// Write a little-endian `i64` at `addr`. No alignment required.
///
/// # Safety
///
/// `addr` must be valid for an 8-byte write.
#[inline]
pub unsafe fn write_i64(addr: *mut u8, value: i64) {
    // SAFETY: same contract as write_u64.
    unsafe { write_u64(addr, value as u64) }
}

/// Read a little-endian `f32` at `addr`. No alignment required.
///
/// # Safety
///
/// `addr` must be valid for a 4-byte read.
#[inline]
pub unsafe fn read_f32(addr: *const u8) -> f32 {
    // SAFETY: same contract as read_u32.
    f32::from_bits(unsafe { read_u32(addr) })
}

/// Write a little-endian `f32` at `addr`. No alignment required.
///
/// # Safety
///
/// `addr` must be valid for a 4-byte write.
#[inline]
pub unsafe fn write_f32(addr: *mut u8, value: f32) {
    // SAFETY: same contract as write_u32.
    unsafe { write_u32(addr, value.to_bits()) }
}

/// Read a little-endian `f64` at `addr`. No alignment required.
///
/// # Safety
///
/// `addr` must be valid for an 8-byte read.
#[inline]
pub unsafe fn read_f64(addr: *const u8) -> f64 {
    // SAFETY: same contract as read_u64.
    f64::from_bits(unsafe { read_u64(addr) })
}

/// Write a little-endian `f64` at `addr`. No alignment required.
///
/// # Safety
///
/// `addr` must be valid for an 8-byte write.
#[inline]
pub unsafe fn write_f64(addr: *mut u8, value: f64) {
    // SAFETY: same contract as write_u64.
    unsafe { write_u64(addr, value.to_bits()) }
}

/// Acquire-load the native `u32` word at `addr`.
///
/// # Safety
///
/// `addr` must be valid for a 4-byte read and 4-byte aligned.
#[inline]
pub unsafe fn read_volatile_u32(addr: *const u8) -> u32 {
    // SAFETY: caller guarantees validity and alignment for the atomic view.
    unsafe { AtomicU32::from_ptr(addr.cast_mut().cast::<u32>()) }.load(Ordering::Acquire)
}

/// Release-store the native `u32` word at `addr`.
///
/// # Safety
///
/// `addr` must be valid for a 4-byte write and 4-byte aligned.
#[inline]
pub unsafe fn write_ordered_u32(addr: *mut u8, value: u32) {
    // SAFETY: caller guarantees validity and alignment for the atomic view.
    unsafe { AtomicU32::from_ptr(addr.cast::<u32>()) }.store(value, Ordering::Release);
}

/// Acquire-load the native `u64` word at `addr`.
///
/// # Safety
///
/// `addr` must be valid for an 8-byte read and 8-byte aligned.
#[inline]
pub unsafe fn read_volatile_u64(addr: *const u8) -> u64 {
    // SAFETY: caller guarantees validity and alignment for the atomic view.
    unsafe { AtomicU64::from_ptr(addr.cast_mut().cast::<u64>()) }.load(Ordering::Acquire)
}

/// Release-store the native `u64` word at `addr`.
///
/// # Safety
///
/// `addr` must be valid for an 8-byte write and 8-byte aligned.
#[inline]
pub unsafe fn write_ordered_u64(addr: *mut u8, value: u64) {
    // SAFETY: caller guarantees validity and alignment for the atomic view.
    unsafe { AtomicU64::from_ptr(addr.cast::<u64>()) }.store(value, Ordering::Release);
}

/// Sequentially consistent compare-and-swap of the native `u32` word at
/// `addr`. Returns whether the swap happened.
///
/// # Safety
///
/// `addr` must be valid for a 4-byte read/write and 4-byte aligned.
#[inline]
pub unsafe fn cas_u32(addr: *mut u8, expected: u32, new: u32) -> bool {
    // SAFETY: caller guarantees validity and alignment for the atomic view.
    unsafe { AtomicU32::from_ptr(addr.cast::<u32>()) }
        .compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
}

/// Sequentially consistent compare-and-swap of the native `u64` word at
/// `addr`. Returns whether the swap happened.
///
/// # Safety
///
/// `addr` must be valid for an 8-byte read/write and 8-byte aligned.
#[inline]
pub unsafe fn cas_u64(addr: *mut u8, expected: u64, new: u64) -> bool {
    // SAFETY: caller guarantees validity and alignment for the atomic view.
    unsafe { AtomicU64::from_ptr(addr.cast::<u64>()) }
        .compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
}

/// Store fence: prior writes become visible before later writes.
#[inline]
pub fn store_fence() {
    fence(Ordering::Release);
}

/// Load fence: later reads see at least everything prior reads saw.
#[inline]
pub fn load_fence() {
    fence(Ordering::Acquire);
}

/// Full fence: sequentially consistent barrier in both directions.
#[inline]
pub fn full_fence() {
    fence(Ordering::SeqCst);
}
