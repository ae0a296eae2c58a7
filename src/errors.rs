use thiserror::Error;

/// Errors surfaced to transaction closures.
///
/// Conflicts are never visible to the caller of [`Stm::atomically`]: the
/// executor catches `Retry` and restarts the attempt. Closures should
/// propagate it with `?` and never handle it themselves.
///
/// [`Stm::atomically`]: crate::Stm::atomically
#[derive(Debug, Error)]
pub enum StmError {
    /// The attempt observed a conflicting or in-flight value and must be
    /// retried from a fresh snapshot.
    #[error("transaction conflict, retry required")]
    Retry,
}
