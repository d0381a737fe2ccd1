//! Error types for canopy.

use thiserror::Error;

/// Result type alias using canopy's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for canopy operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The arena allocator is exhausted.
    ///
    /// Insert operations recover from this internally by migrating to a
    /// doubled successor arena; it only surfaces to callers when repeated
    /// migrations keep failing.
    #[error("arena exhausted")]
    OutOfArena,

    /// A lookup that is contractually required to succeed found nothing.
    #[error("node missing: {0}")]
    NodeMissing(String),

    /// An arena name does not match the `<base>_<generation>` grammar at a
    /// point where the successor name must be computed.
    #[error("invalid arena name: {0}")]
    InvalidName(String),

    /// The shared memory object could not be opened, created, or validated.
    #[error("arena unavailable: {name}: {reason}")]
    ArenaUnavailable {
        /// Name of the shared memory object.
        name: String,
        /// What went wrong.
        reason: String,
    },

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
