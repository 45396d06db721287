//! # Umbra
//!
//! Off-heap byte stores with checked cursors, atomics and shared-memory
//! locking.
//!
//! Umbra manages fixed-capacity byte regions on the heap, in anonymous
//! mappings or in memory-mapped files, and layers bounds-checked
//! little-endian access, streaming cursors and cross-process
//! coordination primitives on top of them.
//!
//! ## Features
//!
//! - **Byte stores**: heap, anonymous-mapped and file-mapped regions
//!   behind one reference-counted trait
//! - **Cursors**: windowed read/write positions with configurable
//!   underflow handling and compact number encodings
//! - **Shared locks**: a read/write/update lock packed into a single
//!   lockable word of any store, file-mapped ones included
//! - **Pools**: chunked file windows and a bounded LRU block cache
//! - **Arenas**: append-only entry logs shared between processes
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use umbra::prelude::*;
//!
//! // In-memory scratch buffer
//! let mut bytes = Bytes::alloc_heap(256)?;
//! bytes.write_stop_bit(42)?;
//! bytes.write_utf8("hello")?;
//! bytes.flip();
//! assert_eq!(bytes.read_stop_bit()?, 42);
//!
//! // Shared mapped file with a cross-process lock word
//! let store = MappedStore::create("scratch.dat", 4096)?;
//! let lock = SharedLock::bind(store.clone(), 0)?;
//! if lock.try_write_lock() {
//!     store.write_u64_at(8, 0xFEED)?;
//!     lock.unlock_write()?;
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod arena;
pub mod bits;
pub mod bytes;
pub mod error;
pub mod lock;
pub mod pool;
pub mod raw;
pub mod refcount;
pub mod store;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::arena::ArenaFile;
    pub use crate::bits::BitSet;
    pub use crate::bytes::{Bytes, FloatMode, UnderflowMode};
    pub use crate::error::{Error, Result};
    pub use crate::lock::{LockMode, SharedLock};
    pub use crate::pool::{BlockCache, ChunkedMappedFile};
    pub use crate::store::{ByteStore, HeapStore, MappedStore, NativeStore};
}

pub use error::{Error, Result};
