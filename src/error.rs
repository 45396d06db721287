//! Error types for Umbra.

use thiserror::Error;

/// Result type alias using Umbra's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Umbra operations.
#[derive(Error, Debug)]
pub enum Error {
    /// An offset-addressed access fell outside a store or view.
    #[error("access of {len} bytes at offset {offset} out of bounds for capacity {capacity}")]
    OutOfBounds {
        /// Requested offset.
        offset: usize,
        /// Width of the access in bytes (or bits, for bit sets).
        len: usize,
        /// Capacity of the store or view.
        capacity: usize,
    },

    /// A sequential read ran past the cursor's limit.
    #[error("buffer underflow: {needed} bytes needed, {remaining} remaining")]
    Underflow {
        /// Bytes the operation needed.
        needed: usize,
        /// Bytes left before the limit.
        remaining: usize,
    },

    /// A sequential write ran past the cursor's limit.
    #[error("buffer overflow: {needed} bytes needed, {remaining} remaining")]
    Overflow {
        /// Bytes the operation needed.
        needed: usize,
        /// Bytes left before the limit.
        remaining: usize,
    },

    /// Reserve or release on a resource whose count already reached zero.
    #[error("{0} already released")]
    Released(&'static str),

    /// A mutating operation on a read-only store.
    #[error("store is read-only")]
    ReadOnly,

    /// Unlock or downgrade of a lock the caller does not hold.
    #[error("lock state violation: {0}")]
    LockState(String),

    /// Malformed encoded data: bad UTF-8, an over-long stop-bit sequence,
    /// an unknown compact-float marker, or a broken file header.
    #[error("corrupt stream: {0}")]
    CorruptStream(String),

    /// Atomic access at an offset that is not naturally aligned.
    #[error("misaligned atomic access at offset {offset} (requires {align}-byte alignment)")]
    Misaligned {
        /// Offending offset.
        offset: usize,
        /// Required alignment in bytes.
        align: usize,
    },

    /// Memory allocation or mapping failed.
    #[error("memory allocation failed: {0}")]
    Allocation(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
