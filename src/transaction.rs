use std::any::Any;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_epoch::Guard;

use crate::var::{self, TVar};
use crate::{Stm, StmError};

/// Unique identity of a TVar (its address).
type TVarId = usize;

/// Read-set entry: the version-lock word of a TVar observed with an
/// unlocked, non-stale snapshot during speculation.
struct ReadEntry {
    vlock: *const AtomicU64,
}

/// Write-set entry. Type erasure lets one transaction buffer tentative
/// values for TVars of different payload types.
struct WriteEntry {
    key: TVarId,
    vlock: *const AtomicU64,
    /// The tentative value from the latest `store` to this TVar.
    pending: Box<dyn Any + Send>,
    /// Downcasts `pending` and publishes it into the TVar type-safely.
    publish: Box<dyn Fn(&(dyn Any + Send), u64, &Guard) + Send>,
}

/// Per-attempt bookkeeping for one transaction.
///
/// Handed to the closure by [`Stm::atomically`] and
/// [`Stm::read_only_atomically`]; all transactional reads and writes go
/// through it. A `Transaction` lives for exactly one attempt: the executor
/// builds a fresh one per retry and consumes it at commit.
pub struct Transaction<'a> {
    stm: &'a Stm,
    guard: &'a Guard,
    read_only: bool,
    /// Global clock sample taken when the attempt started.
    rv: u64,
    /// Cleared on the first conflict; afterwards every operation is inert
    /// and the executor restarts the attempt.
    alive: bool,
    /// Insertion-ordered, not deduplicated. Duplicates revalidate
    /// identically, so scanning them twice is merely redundant.
    read_set: Vec<ReadEntry>,
    /// Insertion-ordered, deduplicated by TVar identity.
    write_set: Vec<WriteEntry>,
    /// Side effects to run only after a successful commit.
    post_commit_hooks: Vec<Box<dyn FnOnce() + Send>>,
    /// Side effects to run only if the attempt dies uncommitted.
    post_rollback_hooks: Vec<Box<dyn FnOnce() + Send>>,
    committed: bool,
}

impl<'a> Drop for Transaction<'a> {
    fn drop(&mut self) {
        if !self.committed {
            let hooks = mem::take(&mut self.post_rollback_hooks);
            for hook in hooks {
                hook();
            }
        }
    }
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(stm: &'a Stm, guard: &'a Guard, read_only: bool) -> Self {
        Self {
            stm,
            guard,
            read_only,
            rv: stm.clock.sample(),
            alive: true,
            read_set: Vec::new(),
            write_set: Vec::new(),
            post_commit_hooks: Vec::new(),
            post_rollback_hooks: Vec::new(),
            committed: false,
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive
    }

    /// Mark the attempt dead and signal the executor to retry.
    fn conflict<R>(&mut self) -> Result<R, StmError> {
        self.alive = false;
        Err(StmError::Retry)
    }

    /// Read a TVar transactionally.
    ///
    /// Aborts the attempt if the variable is write-locked or carries a
    /// version newer than this attempt's snapshot. In writer mode an
    /// earlier `store` to the same TVar is returned instead of the
    /// committed value (read-your-own-write).
    pub fn load<T: Any + Send + Sync + Clone>(&mut self, tvar: &TVar<T>) -> Result<T, StmError> {
        if !self.alive {
            return Err(StmError::Retry);
        }

        let (version, data) = match tvar.snapshot(self.guard) {
            Some(snapshot) => snapshot,
            // In-flight write observed.
            None => return self.conflict(),
        };
        if version > self.rv {
            // Newer than our snapshot; the attempt cannot linearize at rv.
            return self.conflict();
        }

        // Read-only transactions validate through this per-load check and
        // never need a read set.
        if self.read_only {
            return Ok(data.clone());
        }

        let key = tvar as *const TVar<T> as TVarId;
        if let Some(entry) = self.write_set.iter().find(|w| w.key == key) {
            let pending = entry.pending.downcast_ref::<T>().unwrap();
            return Ok(pending.clone());
        }

        self.read_set.push(ReadEntry {
            vlock: tvar.word_ptr(),
        });
        Ok(data.clone())
    }

    /// Buffer a tentative write to a TVar.
    ///
    /// Nothing is published until commit. The last `store` to a TVar wins
    /// within one attempt.
    ///
    /// # Panics
    ///
    /// Panics when called inside a read-only transaction. That is a
    /// program bug, not a conflict; downgrading it silently would mask it.
    pub fn store<T: Any + Send + Sync + Clone>(
        &mut self,
        tvar: &TVar<T>,
        val: T,
    ) -> Result<(), StmError> {
        if !self.alive {
            return Ok(());
        }
        if self.read_only {
            panic!("store issued inside a read-only transaction");
        }

        let key = tvar as *const TVar<T> as TVarId;
        if let Some(entry) = self.write_set.iter_mut().find(|w| w.key == key) {
            entry.pending = Box::new(val);
            return Ok(());
        }

        let publish = Box::new(move |pending: &(dyn Any + Send), wv: u64, guard: &Guard| {
            let val = pending.downcast_ref::<T>().unwrap().clone();
            // SAFETY: `key` is the address of the TVar passed to `store`,
            // which outlives the enclosing `atomically` call.
            let tvar = unsafe { &*(key as *const TVar<T>) };
            tvar.publish(val, wv, guard);
        });

        self.write_set.push(WriteEntry {
            key,
            vlock: tvar.word_ptr(),
            pending: Box::new(val),
            publish,
        });
        Ok(())
    }

    /// Schedule a side effect to run only if the transaction commits.
    ///
    /// Runs after every write-set lock has been released. This is the
    /// supported way to attach I/O to a transaction: the closure body
    /// itself may be re-executed on retry, hooks fire once.
    pub fn on_commit<F>(&mut self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.post_commit_hooks.push(Box::new(f));
    }

    /// Schedule a side effect to run only if this attempt aborts.
    pub fn on_rollback<F>(&mut self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.post_rollback_hooks.push(Box::new(f));
    }

    /// Lock-acquire, validate, publish. Returns false on conflict; the
    /// caller retries with a fresh `Transaction`.
    pub(crate) fn commit(mut self) -> bool {
        // Drop needs self intact, so take the moving parts out first.
        let write_set = mem::take(&mut self.write_set);
        let post_commit_hooks = mem::take(&mut self.post_commit_hooks);

        // Nothing written: the per-load version checks already validated
        // every read against rv, and only write transactions may bump the
        // clock. Commit on the spot.
        if write_set.is_empty() {
            self.committed = true;
            for hook in post_commit_hooks {
                hook();
            }
            return true;
        }

        // 1. Lock the write set in insertion order. Any failure releases
        //    what was acquired and aborts the attempt.
        for (acquired, entry) in write_set.iter().enumerate() {
            // SAFETY: write-set pointers target TVars borrowed by the
            // closure, alive for the whole `atomically` call.
            if !var::try_acquire(unsafe { &*entry.vlock }) {
                for held in &write_set[..acquired] {
                    var::release(unsafe { &*held.vlock });
                }
                return false;
            }
        }

        // 2. Bump the global clock to obtain the write version.
        let wv = self.stm.clock.bump();

        // 3. Validate the read set. If wv == rv + 1 no other writer
        //    committed since our sample, so the reads cannot have been
        //    invalidated and the scan is skipped.
        if wv != self.rv + 1 {
            for entry in &self.read_set {
                // A lock observed on a TVar we also wrote is our own and
                // must not fail validation; the version check still
                // applies, since another writer may have republished the
                // TVar between our load and our lock acquisition.
                let self_held = write_set.iter().any(|w| w.vlock == entry.vlock);
                // SAFETY: as above, read-set pointers outlive the attempt.
                let word = unsafe { &*entry.vlock }.load(Ordering::Acquire);
                let (locked, version) = var::decode(word);
                if (locked && !self_held) || version > self.rv {
                    for held in &write_set {
                        var::release(unsafe { &*held.vlock });
                    }
                    return false;
                }
            }
        }

        // 4. Publish every tentative value in insertion order, stamping wv
        //    and releasing each lock as it goes.
        for entry in &write_set {
            (entry.publish)(&*entry.pending, wv, self.guard);
        }

        self.committed = true;
        for hook in post_commit_hooks {
            hook();
        }
        true
    }
}
