use std::any::Any;
use std::hint::spin_loop;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned};

/// Lock flag in bit 0 of the version-lock word; the version lives in the
/// upper 63 bits as `version << 1`.
pub(crate) const LOCK_BIT: u64 = 1;

/// Largest version representable next to the lock bit.
pub(crate) const MAX_VERSION: u64 = u64::MAX >> 1;

/// How many times `try_acquire` retries before giving up. Large compared
/// to the duration of a commit, so exhaustion means the owner is stuck.
const ACQUIRE_SPIN_CAP: usize = 10_000_000;

/// A transactional variable.
///
/// Pairs an opaque payload with a versioned write lock. The payload lives
/// behind an epoch-managed atomic pointer so that optimistic readers can
/// dereference it without locking while a committer swaps it out; replaced
/// payloads are retired through the epoch collector.
///
/// Create TVars through [`Stm::new_var`](crate::Stm::new_var) and share
/// them by reference. The engine identifies a TVar by its address, so a
/// logical variable must be backed by exactly one `TVar` allocation.
pub struct TVar<T> {
    /// Version-lock word: bit 0 is the lock flag, bits 1..=63 the version
    /// of the last committed write.
    vlock: AtomicU64,
    /// The current payload node.
    data: Atomic<T>,
}

impl<T: Any + Send + Sync + Clone> TVar<T> {
    pub(crate) fn new(val: T, version: u64) -> Self {
        Self {
            vlock: AtomicU64::new(version << 1),
            data: Atomic::new(val),
        }
    }

    /// Take a coherent `(version, payload)` view, or `None` if the
    /// variable is write-locked or was republished mid-read.
    ///
    /// The word is re-checked after the payload dereference, so a payload
    /// returned here is exactly the one committed at the returned version.
    pub(crate) fn snapshot<'g>(&self, guard: &'g Guard) -> Option<(u64, &'g T)> {
        let word = self.vlock.load(Ordering::Acquire);
        let (locked, version) = decode(word);
        if locked {
            return None;
        }

        let shared = self.data.load(Ordering::Acquire, guard);
        // SAFETY: the pointer is never null and the guard keeps the node
        // from being reclaimed while the reference is live.
        let payload = unsafe { shared.deref() };

        if self.vlock.load(Ordering::Acquire) != word {
            return None;
        }
        Some((version, payload))
    }

    /// Swap in a new payload and stamp the new version, releasing the
    /// write lock in the same store. Caller must hold the lock.
    pub(crate) fn publish(&self, val: T, version: u64, guard: &Guard) {
        let old = self.data.swap(Owned::new(val), Ordering::AcqRel, guard);
        // SAFETY: `old` was this TVar's payload until the swap; readers
        // that still hold it are pinned, so deferred destruction is safe.
        unsafe { guard.defer_destroy(old) };
        self.vlock.store(version << 1, Ordering::Release);
    }

    pub(crate) fn word_ptr(&self) -> *const AtomicU64 {
        &self.vlock
    }

    #[cfg(test)]
    pub(crate) fn try_acquire(&self) -> bool {
        try_acquire(&self.vlock)
    }

    #[cfg(test)]
    pub(crate) fn release(&self) {
        release(&self.vlock)
    }
}

impl<T> Drop for TVar<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no reader or committer can touch the
        // node anymore, so it can be freed without going through the
        // collector.
        unsafe {
            let node = self.data.load(Ordering::Relaxed, epoch::unprotected());
            if !node.is_null() {
                drop(node.into_owned());
            }
        }
    }
}

/// Decompose a version-lock word into `(is_locked, version)`.
#[inline]
pub(crate) fn decode(word: u64) -> (bool, u64) {
    (word & LOCK_BIT == LOCK_BIT, word >> 1)
}

/// Try to flip the lock bit 0 -> 1, preserving the version bits.
///
/// Bounded: gives up after [`ACQUIRE_SPIN_CAP`] attempts so a stuck owner
/// turns into an abort for this transaction instead of a livelock.
pub(crate) fn try_acquire(vlock: &AtomicU64) -> bool {
    for _ in 0..ACQUIRE_SPIN_CAP {
        let word = vlock.load(Ordering::Relaxed);
        if word & LOCK_BIT == 0
            && vlock
                .compare_exchange_weak(word, word | LOCK_BIT, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        {
            return true;
        }
        spin_loop();
    }
    false
}

/// Clear the lock bit. Caller must hold the lock.
pub(crate) fn release(vlock: &AtomicU64) {
    vlock.fetch_and(!LOCK_BIT, Ordering::Release);
}
