//! Software transactional memory with TL2-style optimistic concurrency.
//!
//! # Architecture
//!
//! The engine follows the TL2 (Transactional Locking II) recipe built
//! around a global version clock:
//!
//! - **Reads**: Optimistic. No locks are taken; every load checks the
//!   variable's versioned write lock against the transaction's clock
//!   snapshot and aborts the attempt on any in-flight or newer value.
//! - **Writes**: Buffered locally in a write set. Per-variable write locks
//!   are acquired only during the commit phase, with a bounded spin so a
//!   stuck lock owner produces an abort instead of a livelock.
//! - **Commit**: Lock the write set, bump the clock, validate the read
//!   set, publish. The clock bump is the linearization point of every
//!   write transaction.
//! - **Reclamation**: Replaced payload nodes are retired through the
//!   crossbeam epoch collector, so readers never race reclamation.
//!
//! Read-only transactions take a cheaper path: no read set, no locks, no
//! clock bump. Their chain of per-load version checks is equivalent to a
//! post-hoc read-set validation.
//!
//! DANGER AHEAD: Don't run I/O inside a transaction closure. Closures are
//! re-executed on conflict; use [`Transaction::on_commit`] to defer side
//! effects past the transactional boundary.
//!
//! # Example
//!
//! ```
//! use tl2_stm::Stm;
//!
//! let stm = Stm::new();
//! let var = stm.new_var(10);
//!
//! let seen = stm.atomically(|tx| {
//!     let val = tx.load(&var)?;
//!     tx.store(&var, val + 1)?;
//!     tx.load(&var)
//! });
//! assert_eq!(seen, 11);
//! ```

mod clock;
mod errors;
mod transaction;
mod var;

pub use errors::StmError;
pub use transaction::Transaction;
pub use var::TVar;

use std::any::Any;

use crossbeam_epoch as epoch;
use crossbeam_utils::Backoff;
use tracing::trace;

use clock::VersionClock;

/// The STM engine: owns the global version clock shared by every
/// transaction and every TVar it creates.
pub struct Stm {
    pub(crate) clock: VersionClock,
}

impl Stm {
    /// Create a new STM engine instance.
    pub const fn new() -> Self {
        Self {
            clock: VersionClock::new(),
        }
    }

    /// Create a transactional variable managed by this engine, versioned
    /// at the current clock value.
    pub fn new_var<T: Any + Send + Sync + Clone>(&self, initial: T) -> TVar<T> {
        TVar::new(initial, self.clock.sample())
    }

    /// Execute a closure as a read-write transaction, retrying on
    /// conflict until it commits, and return its result.
    ///
    /// Conflicts never surface to the caller; from the caller's view this
    /// always succeeds. Propagate [`StmError::Retry`] from `load`/`store`
    /// with `?` and never handle it inside the closure.
    pub fn atomically<T, F>(&self, f: F) -> T
    where
        F: FnMut(&mut Transaction) -> Result<T, StmError>,
    {
        self.run(false, f)
    }

    /// Execute a closure as a read-only transaction.
    ///
    /// Considerably cheaper than [`atomically`](Stm::atomically) for pure
    /// reads: no read set is built, no lock is acquired and the clock is
    /// never bumped.
    ///
    /// # Panics
    ///
    /// Panics if the closure calls [`Transaction::store`].
    pub fn read_only_atomically<T, F>(&self, f: F) -> T
    where
        F: FnMut(&mut Transaction) -> Result<T, StmError>,
    {
        self.run(true, f)
    }

    /// The shared retry loop behind both executors.
    fn run<T, F>(&self, read_only: bool, mut f: F) -> T
    where
        F: FnMut(&mut Transaction) -> Result<T, StmError>,
    {
        let backoff = Backoff::new();
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;

            // Pin the epoch for the whole attempt so every payload read
            // inside the closure stays valid until commit.
            let guard = epoch::pin();
            let mut tx = Transaction::new(self, &guard, read_only);

            match f(&mut tx) {
                Ok(res) => {
                    // The closure may have swallowed a conflict; a dead
                    // attempt must never reach commit.
                    if tx.is_alive() && tx.commit() {
                        if attempt > 1 {
                            trace!(attempt, "transaction committed after retries");
                        }
                        return res;
                    }
                }
                Err(StmError::Retry) => {}
            }

            trace!(attempt, read_only, "transaction attempt aborted, retrying");
            backoff.snooze();
        }
    }
}

impl Default for Stm {
    fn default() -> Self {
        Self::new()
    }
}

/// Global engine instance for programs that want one process-wide STM.
pub static STM: Stm = Stm::new();

/// [`Stm::atomically`] on the global [`STM`] instance.
pub fn atomically<T, F>(f: F) -> T
where
    F: FnMut(&mut Transaction) -> Result<T, StmError>,
{
    STM.atomically(f)
}

/// [`Stm::read_only_atomically`] on the global [`STM`] instance.
pub fn read_only_atomically<T, F>(f: F) -> T
where
    F: FnMut(&mut Transaction) -> Result<T, StmError>,
{
    STM.read_only_atomically(f)
}

/// [`Stm::new_var`] on the global [`STM`] instance.
pub fn new_var<T: Any + Send + Sync + Clone>(initial: T) -> TVar<T> {
    STM.new_var(initial)
}
