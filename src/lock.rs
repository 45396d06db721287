//! Shared read/write/update lock packed into one 64-bit word.
//!
//! The word lives inside a byte store, so when the store is a mapped file
//! the lock coordinates threads in any process mapping it. Layout, from
//! the low bits: reader-waiting (16 bits), reader-held (16 bits),
//! writer-waiting (16 bits), writer-held (8 bits), mode (2 bits). Every
//! transition is a single sequentially consistent compare-and-swap of the
//! whole word; the fast path never calls into the OS.
//!
//! Held modes: `Read` allows any number of readers. `Write` is exclusive.
//! `Update` is one writer-intent holder that still admits readers, can be
//! upgraded to `Write` once the readers drain, and blocks other writers
//! and updaters in the meantime.

use crate::error::{Error, Result};
use crate::raw;
use crate::store::ByteStore;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::{Duration, Instant};

const READER_WAITING_SHIFT: u32 = 0;
const READER_WAITING_MASK: u64 = 0xFFFF;
const READER_HELD_SHIFT: u32 = 16;
const READER_HELD_MASK: u64 = 0xFFFF;
const WRITER_WAITING_SHIFT: u32 = 32;
const WRITER_WAITING_MASK: u64 = 0xFFFF;
const WRITER_HELD_SHIFT: u32 = 48;
const WRITER_HELD_MASK: u64 = 0xFF;
const MODE_SHIFT: u32 = 56;
const MODE_MASK: u64 = 0x3;

/// Held mode of a [`SharedLock`] word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LockMode {
    /// Nobody holds the lock.
    None = 0,
    /// Held by readers only.
    Read = 1,
    /// Held exclusively by one writer.
    Write = 2,
    /// Held by one upgradable writer-intent, readers may coexist.
    Update = 3,
}

impl LockMode {
    fn from_bits(bits: u64) -> Self {
        match bits & MODE_MASK {
            0 => LockMode::None,
            1 => LockMode::Read,
            2 => LockMode::Write,
            _ => LockMode::Update,
        }
    }
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LockMode::None => "none",
            LockMode::Read => "read",
            LockMode::Write => "write",
            LockMode::Update => "update",
        };
        f.write_str(name)
    }
}

/// Decoded snapshot of a lock word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockState {
    /// Current held mode.
    pub mode: LockMode,
    /// Writers holding the lock (0 or 1).
    pub writers_held: u8,
    /// Writers registered as waiting.
    pub writers_waiting: u16,
    /// Readers holding the lock.
    pub readers_held: u16,
    /// Readers registered as waiting.
    pub readers_waiting: u16,
}

impl std::fmt::Display for LockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} w:{}/{} r:{}/{}",
            self.mode, self.writers_held, self.writers_waiting, self.readers_held, self.readers_waiting
        )
    }
}

/// One raw lock word plus bit-field accessors.
#[derive(Clone, Copy, PartialEq, Eq)]
struct LockWord(u64);

impl LockWord {
    fn field(self, shift: u32, mask: u64) -> u64 {
        (self.0 >> shift) & mask
    }

    fn with_field(self, shift: u32, mask: u64, value: u64) -> Self {
        debug_assert!(value <= mask);
        Self((self.0 & !(mask << shift)) | (value << shift))
    }

    fn mode(self) -> LockMode {
        LockMode::from_bits(self.0 >> MODE_SHIFT)
    }

    fn with_mode(self, mode: LockMode) -> Self {
        self.with_field(MODE_SHIFT, MODE_MASK, mode as u64)
    }

    fn readers_waiting(self) -> u64 {
        self.field(READER_WAITING_SHIFT, READER_WAITING_MASK)
    }

    fn readers_held(self) -> u64 {
        self.field(READER_HELD_SHIFT, READER_HELD_MASK)
    }

    fn with_readers_held(self, value: u64) -> Self {
        self.with_field(READER_HELD_SHIFT, READER_HELD_MASK, value)
    }

    fn writers_waiting(self) -> u64 {
        self.field(WRITER_WAITING_SHIFT, WRITER_WAITING_MASK)
    }

    fn writers_held(self) -> u64 {
        self.field(WRITER_HELD_SHIFT, WRITER_HELD_MASK)
    }

    fn with_writers_held(self, value: u64) -> Self {
        self.with_field(WRITER_HELD_SHIFT, WRITER_HELD_MASK, value)
    }

    fn decode(self) -> LockState {
        LockState {
            mode: self.mode(),
            writers_held: self.writers_held() as u8,
            writers_waiting: self.writers_waiting() as u16,
            readers_held: self.readers_held() as u16,
            readers_waiting: self.readers_waiting() as u16,
        }
    }
}

/// Read/write/update lock bound to an 8-aligned word of a byte store.
///
/// Binding reserves the store; the reservation is released when the lock
/// handle drops. The word itself is left untouched by drop, so other
/// handles (in this or another process) keep working.
pub struct SharedLock {
    store: Arc<dyn ByteStore>,
    addr: NonNull<u8>,
    offset: usize,
}

// SAFETY: the handle holds a reservation on the store for its whole
// lifetime and only touches the bound word through atomics.
unsafe impl Send for SharedLock {}
unsafe impl Sync for SharedLock {}

impl SharedLock {
    /// Bind a lock to the 64-bit word at `offset` inside `store`.
    ///
    /// The word is used as found: bind does not reset it, so a lock held
    /// through a mapped file stays held across reopen.
    pub fn bind(store: Arc<dyn ByteStore>, offset: usize) -> Result<Self> {
        store.check_atomic_writable(offset, 8)?;
        store.reserve()?;
        // SAFETY: check_atomic_writable validated offset + 8 <= capacity,
        // and base_ptr is non-null for a live store.
        let addr = unsafe { store.base_ptr().cast_mut().add(offset) };
        let addr = match NonNull::new(addr) {
            Some(addr) => addr,
            None => {
                let _ = store.release();
                return Err(Error::Allocation("store base pointer is null".to_string()));
            }
        };
        Ok(Self {
            store,
            addr,
            offset,
        })
    }

    /// The store the word lives in.
    pub fn store(&self) -> &Arc<dyn ByteStore> {
        &self.store
    }

    /// Offset of the word within the store.
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    fn load(&self) -> LockWord {
        // SAFETY: bind validated bounds and alignment; the reservation
        // keeps the address valid.
        LockWord(unsafe { raw::read_volatile_u64(self.addr.as_ptr()) })
    }

    #[inline]
    fn try_transition(&self, current: LockWord, next: LockWord) -> bool {
        // SAFETY: as in `load`.
        unsafe { raw::cas_u64(self.addr.as_ptr(), current.0, next.0) }
    }

    /// Force the word back to the unlocked state. For recovering a file
    /// whose holder died; concurrent holders are not consulted.
    pub fn reset(&self) {
        // SAFETY: as in `load`.
        unsafe { raw::write_ordered_u64(self.addr.as_ptr(), 0) };
    }

    /// Decoded snapshot of the word.
    pub fn state(&self) -> LockState {
        self.load().decode()
    }

    // ------------------------------------------------------------------
    // try-acquire
    // ------------------------------------------------------------------

    /// Take a read hold if the mode is none, read or update. Returns
    /// whether the hold was taken.
    pub fn try_read_lock(&self) -> bool {
        loop {
            let word = self.load();
            match word.mode() {
                LockMode::None | LockMode::Read | LockMode::Update => {
                    let readers = word.readers_held();
                    if readers == READER_HELD_MASK {
                        return false;
                    }
                    let mut next = word.with_readers_held(readers + 1);
                    if word.mode() == LockMode::None {
                        next = next.with_mode(LockMode::Read);
                    }
                    if self.try_transition(word, next) {
                        return true;
                    }
                }
                LockMode::Write => return false,
            }
            std::hint::spin_loop();
        }
    }

    /// Take the exclusive write hold if nobody holds anything. Returns
    /// whether the hold was taken.
    pub fn try_write_lock(&self) -> bool {
        loop {
            let word = self.load();
            if word.mode() != LockMode::None || word.writers_held() != 0 {
                return false;
            }
            let next = word.with_mode(LockMode::Write).with_writers_held(1);
            if self.try_transition(word, next) {
                return true;
            }
            std::hint::spin_loop();
        }
    }

    /// Take the update hold if the mode is none or read and no writer
    /// holds. Readers may keep arriving. Returns whether the hold was
    /// taken.
    pub fn try_update_lock(&self) -> bool {
        loop {
            let word = self.load();
            match word.mode() {
                LockMode::None | LockMode::Read if word.writers_held() == 0 => {
                    let next = word.with_mode(LockMode::Update).with_writers_held(1);
                    if self.try_transition(word, next) {
                        return true;
                    }
                }
                _ => return false,
            }
            std::hint::spin_loop();
        }
    }

    // ------------------------------------------------------------------
    // busy (timed) acquire
    // ------------------------------------------------------------------

    /// Spin for a read hold until `timeout` elapses. Registers in the
    /// reader-waiting counter while spinning. Returns whether the hold
    /// was taken; expiry is not an error.
    pub fn busy_read_lock(&self, timeout: Duration) -> bool {
        self.busy(timeout, READER_WAITING_SHIFT, READER_WAITING_MASK, |lock| {
            lock.try_read_lock()
        })
    }

    /// Spin for the write hold until `timeout` elapses. Registers in the
    /// writer-waiting counter while spinning.
    pub fn busy_write_lock(&self, timeout: Duration) -> bool {
        self.busy(timeout, WRITER_WAITING_SHIFT, WRITER_WAITING_MASK, |lock| {
            lock.try_write_lock()
        })
    }

    /// Spin for the update hold until `timeout` elapses. Update waiters
    /// register in the writer-waiting counter.
    pub fn busy_update_lock(&self, timeout: Duration) -> bool {
        self.busy(timeout, WRITER_WAITING_SHIFT, WRITER_WAITING_MASK, |lock| {
            lock.try_update_lock()
        })
    }

    fn busy(
        &self,
        timeout: Duration,
        waiting_shift: u32,
        waiting_mask: u64,
        mut attempt: impl FnMut(&Self) -> bool,
    ) -> bool {
        if !self.register_waiter(waiting_shift, waiting_mask) {
            return false;
        }
        let _guard = WaitGuard {
            lock: self,
            shift: waiting_shift,
            mask: waiting_mask,
        };
        let deadline = Instant::now() + timeout;
        loop {
            if attempt(self) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::hint::spin_loop();
            std::thread::yield_now();
        }
    }

    fn register_waiter(&self, shift: u32, mask: u64) -> bool {
        loop {
            let word = self.load();
            let waiting = word.field(shift, mask);
            if waiting == mask {
                return false;
            }
            if self.try_transition(word, word.with_field(shift, mask, waiting + 1)) {
                return true;
            }
            std::hint::spin_loop();
        }
    }

    fn deregister_waiter(&self, shift: u32, mask: u64) {
        loop {
            let word = self.load();
            let waiting = word.field(shift, mask);
            if waiting == 0 {
                // foreign reset while we were registered; nothing to undo
                tracing::trace!(offset = self.offset, "waiter count already zero");
                return;
            }
            if self.try_transition(word, word.with_field(shift, mask, waiting - 1)) {
                return;
            }
            std::hint::spin_loop();
        }
    }

    // ------------------------------------------------------------------
    // unlock
    // ------------------------------------------------------------------

    /// Drop one read hold. Read mode clears when the last reader leaves;
    /// update mode is untouched by reader traffic.
    pub fn unlock_read(&self) -> Result<()> {
        loop {
            let word = self.load();
            let readers = word.readers_held();
            if readers == 0 || !matches!(word.mode(), LockMode::Read | LockMode::Update) {
                return Err(Error::LockState(format!(
                    "read unlock while not read-locked ({})",
                    word.decode()
                )));
            }
            let mut next = word.with_readers_held(readers - 1);
            if readers == 1 && word.mode() == LockMode::Read {
                next = next.with_mode(LockMode::None);
            }
            if self.try_transition(word, next) {
                return Ok(());
            }
            std::hint::spin_loop();
        }
    }

    /// Drop the write hold.
    pub fn unlock_write(&self) -> Result<()> {
        loop {
            let word = self.load();
            if word.mode() != LockMode::Write || word.writers_held() == 0 {
                return Err(Error::LockState(format!(
                    "write unlock while not write-locked ({})",
                    word.decode()
                )));
            }
            let next = word.with_writers_held(0).with_mode(LockMode::None);
            if self.try_transition(word, next) {
                return Ok(());
            }
            std::hint::spin_loop();
        }
    }

    /// Drop the update hold. Mode falls back to read if readers are still
    /// inside, otherwise to none.
    pub fn unlock_update(&self) -> Result<()> {
        loop {
            let word = self.load();
            if word.mode() != LockMode::Update || word.writers_held() == 0 {
                return Err(Error::LockState(format!(
                    "update unlock while not update-locked ({})",
                    word.decode()
                )));
            }
            let fallback = if word.readers_held() > 0 {
                LockMode::Read
            } else {
                LockMode::None
            };
            let next = word.with_writers_held(0).with_mode(fallback);
            if self.try_transition(word, next) {
                return Ok(());
            }
            std::hint::spin_loop();
        }
    }

    // ------------------------------------------------------------------
    // upgrade / downgrade
    // ------------------------------------------------------------------

    /// Upgrade the update hold to the exclusive write hold. Fails with
    /// `Ok(false)` while readers are still inside; not holding update is
    /// an error.
    pub fn try_upgrade_update_to_write(&self) -> Result<bool> {
        loop {
            let word = self.load();
            if word.mode() != LockMode::Update || word.writers_held() == 0 {
                return Err(Error::LockState(format!(
                    "upgrade while not update-locked ({})",
                    word.decode()
                )));
            }
            if word.readers_held() > 0 {
                return Ok(false);
            }
            if self.try_transition(word, word.with_mode(LockMode::Write)) {
                return Ok(true);
            }
            std::hint::spin_loop();
        }
    }

    /// Spin upgrading until the readers drain or `timeout` elapses.
    pub fn busy_upgrade_update_to_write(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_upgrade_update_to_write()? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::hint::spin_loop();
            std::thread::yield_now();
        }
    }

    /// Step the exclusive write hold down to update, letting readers back
    /// in without giving up the writer intent.
    pub fn downgrade_write_to_update(&self) -> Result<()> {
        loop {
            let word = self.load();
            if word.mode() != LockMode::Write || word.writers_held() == 0 {
                return Err(Error::LockState(format!(
                    "downgrade while not write-locked ({})",
                    word.decode()
                )));
            }
            if self.try_transition(word, word.with_mode(LockMode::Update)) {
                return Ok(());
            }
            std::hint::spin_loop();
        }
    }

    /// Trade the update hold for an ordinary read hold.
    pub fn downgrade_update_to_read(&self) -> Result<()> {
        loop {
            let word = self.load();
            if word.mode() != LockMode::Update || word.writers_held() == 0 {
                return Err(Error::LockState(format!(
                    "downgrade while not update-locked ({})",
                    word.decode()
                )));
            }
            let readers = word.readers_held();
            if readers == READER_HELD_MASK {
                return Err(Error::LockState(format!(
                    "reader count saturated ({})",
                    word.decode()
                )));
            }
            let next = word
                .with_writers_held(0)
                .with_readers_held(readers + 1)
                .with_mode(LockMode::Read);
            if self.try_transition(word, next) {
                return Ok(());
            }
            std::hint::spin_loop();
        }
    }
}

/// Holds one waiting registration for the duration of a busy spin loop
/// and deregisters it on drop, so success, timeout and panic all leave
/// the waiting counter balanced.
struct WaitGuard<'a> {
    lock: &'a SharedLock,
    shift: u32,
    mask: u64,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.lock.deregister_waiter(self.shift, self.mask);
    }
}

impl Drop for SharedLock {
    fn drop(&mut self) {
        if let Err(err) = self.store.release() {
            tracing::warn!(%err, "lock handle release failed");
        }
    }
}

impl std::fmt::Debug for SharedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedLock")
            .field("offset", &self.offset)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NativeStore;

    fn lock_on_fresh_store() -> SharedLock {
        let store: Arc<dyn ByteStore> = Arc::new(NativeStore::allocate(64).unwrap());
        SharedLock::bind(store, 8).unwrap()
    }

    #[test]
    fn test_bind_validates_offset() {
        let store: Arc<dyn ByteStore> = Arc::new(NativeStore::allocate(64).unwrap());
        assert!(SharedLock::bind(Arc::clone(&store), 3).is_err());
        assert!(SharedLock::bind(Arc::clone(&store), 64).is_err());
        assert!(SharedLock::bind(store, 16).is_ok());
    }

    #[test]
    fn test_state_strings_render_all_fields() {
        let lock = lock_on_fresh_store();
        assert_eq!(lock.state().to_string(), "none w:0/0 r:0/0");

        assert!(lock.try_write_lock());
        assert_eq!(lock.state().to_string(), "write w:1/0 r:0/0");
        lock.unlock_write().unwrap();

        assert!(lock.try_read_lock());
        assert!(lock.try_read_lock());
        assert_eq!(lock.state().to_string(), "read w:0/0 r:2/0");

        assert!(lock.try_update_lock());
        assert_eq!(lock.state().to_string(), "update w:1/0 r:2/0");
        lock.unlock_update().unwrap();
        lock.unlock_read().unwrap();
        lock.unlock_read().unwrap();
        assert_eq!(lock.state().to_string(), "none w:0/0 r:0/0");
    }

    #[test]
    fn test_writers_exclude_everyone() {
        let lock = lock_on_fresh_store();
        assert!(lock.try_write_lock());
        assert!(!lock.try_write_lock());
        assert!(!lock.try_read_lock());
        assert!(!lock.try_update_lock());
        lock.unlock_write().unwrap();
        assert!(lock.try_read_lock());
        lock.unlock_read().unwrap();
    }

    #[test]
    fn test_readers_exclude_writers_but_not_each_other() {
        let lock = lock_on_fresh_store();
        assert!(lock.try_read_lock());
        assert!(lock.try_read_lock());
        assert!(!lock.try_write_lock());
        // update coexists with readers
        assert!(lock.try_update_lock());
        assert!(!lock.try_update_lock());
        lock.unlock_update().unwrap();
        lock.unlock_read().unwrap();
        lock.unlock_read().unwrap();
        assert_eq!(lock.state().mode, LockMode::None);
    }

    #[test]
    fn test_update_upgrades_only_after_readers_drain() {
        let lock = lock_on_fresh_store();
        assert!(lock.try_read_lock());
        assert!(lock.try_update_lock());
        assert!(!lock.try_upgrade_update_to_write().unwrap());
        lock.unlock_read().unwrap();
        assert!(lock.try_upgrade_update_to_write().unwrap());
        assert_eq!(lock.state().to_string(), "write w:1/0 r:0/0");
        lock.unlock_write().unwrap();
    }

    #[test]
    fn test_downgrades_walk_back_down() {
        let lock = lock_on_fresh_store();
        assert!(lock.try_write_lock());
        lock.downgrade_write_to_update().unwrap();
        assert_eq!(lock.state().mode, LockMode::Update);
        // readers can come back in under update
        assert!(lock.try_read_lock());
        lock.downgrade_update_to_read().unwrap();
        assert_eq!(lock.state().to_string(), "read w:0/0 r:2/0");
        lock.unlock_read().unwrap();
        lock.unlock_read().unwrap();
    }

    #[test]
    fn test_unlock_without_holding_is_an_error() {
        let lock = lock_on_fresh_store();
        assert!(matches!(lock.unlock_read(), Err(Error::LockState(_))));
        assert!(matches!(lock.unlock_write(), Err(Error::LockState(_))));
        assert!(matches!(lock.unlock_update(), Err(Error::LockState(_))));
        assert!(lock.try_upgrade_update_to_write().is_err());
        assert!(lock.downgrade_write_to_update().is_err());
        assert!(lock.downgrade_update_to_read().is_err());

        assert!(lock.try_read_lock());
        assert!(matches!(lock.unlock_write(), Err(Error::LockState(_))));
        lock.unlock_read().unwrap();
    }

    #[test]
    fn test_busy_acquire_times_out_and_deregisters() {
        let lock = lock_on_fresh_store();
        assert!(lock.try_write_lock());
        assert!(!lock.busy_read_lock(Duration::from_millis(10)));
        assert!(!lock.busy_write_lock(Duration::from_millis(10)));
        assert!(!lock.busy_update_lock(Duration::from_millis(10)));
        // every waiter deregistered on the way out
        assert_eq!(lock.state().to_string(), "write w:1/0 r:0/0");
        lock.unlock_write().unwrap();
        assert!(lock.busy_write_lock(Duration::from_millis(10)));
        lock.unlock_write().unwrap();
    }

    #[test]
    fn test_busy_upgrade_times_out_with_readers_inside() {
        let lock = lock_on_fresh_store();
        assert!(lock.try_read_lock());
        assert!(lock.try_update_lock());
        assert!(!lock
            .busy_upgrade_update_to_write(Duration::from_millis(10))
            .unwrap());
        lock.unlock_read().unwrap();
        assert!(lock
            .busy_upgrade_update_to_write(Duration::from_millis(10))
            .unwrap());
        lock.unlock_write().unwrap();
    }

    #[test]
    fn test_reader_saturation_refuses_new_holds() {
        let lock = lock_on_fresh_store();
        for _ in 0..0xFFFF {
            assert!(lock.try_read_lock());
        }
        assert!(!lock.try_read_lock());
        assert_eq!(lock.state().readers_held, 0xFFFF);
        lock.unlock_read().unwrap();
        assert!(lock.try_read_lock());
        assert_eq!(lock.state().readers_held, 0xFFFF);
    }

    #[test]
    fn test_reset_clears_a_poisoned_word() {
        let lock = lock_on_fresh_store();
        assert!(lock.try_write_lock());
        lock.reset();
        assert_eq!(lock.state().to_string(), "none w:0/0 r:0/0");
        assert!(lock.try_write_lock());
        lock.unlock_write().unwrap();
    }

    #[test]
    fn test_lock_word_survives_through_the_store() {
        // two handles on the same word act as one lock
        let store: Arc<dyn ByteStore> = Arc::new(NativeStore::allocate(64).unwrap());
        let a = SharedLock::bind(Arc::clone(&store), 8).unwrap();
        let b = SharedLock::bind(Arc::clone(&store), 8).unwrap();
        assert!(a.try_write_lock());
        assert!(!b.try_write_lock());
        a.unlock_write().unwrap();
        assert!(b.try_write_lock());
        b.unlock_write().unwrap();
    }
}
