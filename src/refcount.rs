//! Reference counting with a one-shot release action.
//!
//! Every store carries a [`RefCount`]. The count starts at 1 (owned by the
//! creator); views and pools reserve before touching the memory and release
//! when done. The transition from 1 to 0 fires the release action exactly
//! once, which is where backing memory is returned to the system.

use crate::error::{Error, Result};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI64, Ordering};

/// Atomic reference count guarding an off-heap resource.
///
/// Unlike `Arc`, the count is observable, reservations can fail once the
/// resource is gone, and releasing runs a caller-supplied action rather
/// than dropping a value.
pub struct RefCount {
    count: AtomicI64,
    action: UnsafeCell<Option<Box<dyn FnOnce() + Send>>>,
    label: &'static str,
}

// SAFETY: `action` is taken exactly once, either by the unique thread that
// wins the 1 -> 0 transition in `release` or by `Drop` (which has exclusive
// access). The CAS on `count` is the happens-before edge for the take.
unsafe impl Sync for RefCount {}

impl RefCount {
    /// Create a count of 1 with the action to run when it reaches 0.
    ///
    /// `label` names the guarded resource in lifecycle errors.
    pub fn new(label: &'static str, action: impl FnOnce() + Send + 'static) -> Self {
        Self {
            count: AtomicI64::new(1),
            action: UnsafeCell::new(Some(Box::new(action))),
            label,
        }
    }

    /// Current count. 0 means the resource has been released.
    #[inline]
    pub fn count(&self) -> i64 {
        self.count.load(Ordering::Acquire)
    }

    /// Increment the count, failing if it already reached 0.
    pub fn reserve(&self) -> Result<()> {
        if self.try_reserve() {
            Ok(())
        } else {
            Err(Error::Released(self.label))
        }
    }

    /// Increment the count if the resource is still live. Returns whether
    /// the reservation was taken.
    pub fn try_reserve(&self) -> bool {
        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if current <= 0 {
                return false;
            }
            match self.count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Decrement the count, running the release action if this was the
    /// last reservation. Releasing past 0 is an error.
    pub fn release(&self) -> Result<()> {
        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if current <= 0 {
                return Err(Error::Released(self.label));
            }
            match self.count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if current == 1 {
                        self.fire();
                    }
                    return Ok(());
                }
                Err(observed) => current = observed,
            }
        }
    }

    fn fire(&self) {
        // SAFETY: reached only by the unique 1 -> 0 winner or by Drop with
        // exclusive access; see the Sync impl.
        if let Some(action) = unsafe { (*self.action.get()).take() } {
            action();
        }
    }
}

impl Drop for RefCount {
    fn drop(&mut self) {
        let remaining = *self.count.get_mut();
        if remaining > 0 {
            tracing::warn!(
                label = self.label,
                remaining,
                "dropped with outstanding reservations, releasing anyway"
            );
            *self.count.get_mut() = 0;
            self.fire();
        }
    }
}

impl std::fmt::Debug for RefCount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefCount")
            .field("label", &self.label)
            .field("count", &self.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_starts_at_one_and_fires_on_release() {
        let fired = Arc::new(AtomicUsize::new(0));
        let observer = fired.clone();
        let refs = RefCount::new("test", move || {
            observer.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(refs.count(), 1);
        refs.release().unwrap();
        assert_eq!(refs.count(), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reserve_after_zero_fails() {
        let refs = RefCount::new("test", || {});
        refs.release().unwrap();
        assert!(!refs.try_reserve());
        assert!(refs.reserve().is_err());
        assert!(refs.release().is_err());
    }

    #[test]
    fn test_balanced_reserve_release_fires_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let observer = fired.clone();
        let refs = RefCount::new("test", move || {
            observer.fetch_add(1, Ordering::SeqCst);
        });
        for _ in 0..10 {
            refs.reserve().unwrap();
        }
        assert_eq!(refs.count(), 11);
        for _ in 0..11 {
            refs.release().unwrap();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_backstop_fires_pending_action() {
        let fired = Arc::new(AtomicUsize::new(0));
        let observer = fired.clone();
        {
            let _refs = RefCount::new("test", move || {
                observer.fetch_add(1, Ordering::SeqCst);
            });
            // never released
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_reserve_release_is_balanced() {
        let fired = Arc::new(AtomicUsize::new(0));
        let observer = fired.clone();
        let refs = Arc::new(RefCount::new("test", move || {
            observer.fetch_add(1, Ordering::SeqCst);
        }));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let refs = refs.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    refs.reserve().unwrap();
                    refs.release().unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(refs.count(), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        refs.release().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
