//! Client-visible error surface.

use thiserror::Error;
use zlog_common::Status;

/// Result alias for log operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by log operations.
///
/// Epoch staleness is normally absorbed by the retry loops inside the
/// library; [`Error::StaleView`] escapes only when a caller opts out of
/// retrying.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The operation ran under a view older than the object's epoch.
    #[error("view epoch is stale")]
    StaleView,

    /// The target position is already written or filled; appends must
    /// allocate a fresh position.
    #[error("position is read-only")]
    ReadOnly,

    /// The position was filled or trimmed; there is no payload to read.
    #[error("position has been invalidated")]
    Invalidated,

    /// The position has not been written yet.
    #[error("position has not been written")]
    NotWritten,

    /// The backing entry object has not been initialized.
    #[error("entry object not initialized")]
    NotInitialized,

    /// The log already exists and the options forbid opening it.
    #[error("log already exists")]
    AlreadyExists,

    /// The log does not exist and the options forbid creating it.
    #[error("log not found")]
    NotFound,

    /// An object header, cell, or view blob could not be decoded.
    #[error("corrupt log state: {0}")]
    Corruption(String),

    /// Malformed input, or a view proposal raced and lost.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The log handle has been closed.
    #[error("log handle is shut down")]
    Shutdown,

    /// A storage status with no more specific mapping at this call site.
    #[error("storage error: {0}")]
    Storage(Status),
}

impl From<Status> for Error {
    /// Context-free mapping from storage status codes. Call sites that can
    /// say something more precise (for example `NotFound` meaning "log does
    /// not exist" rather than "object not initialized") match first and fall
    /// back to this.
    fn from(status: Status) -> Self {
        match status {
            Status::StaleEpoch => Error::StaleView,
            Status::ReadOnly => Error::ReadOnly,
            Status::Invalidated => Error::Invalidated,
            Status::OutOfRange => Error::NotWritten,
            Status::NotFound => Error::NotInitialized,
            Status::Exists => Error::AlreadyExists,
            Status::Corrupt => Error::Corruption("storage reported corrupt object state".into()),
            Status::InvalidArgument => Error::InvalidArgument("storage rejected request".into()),
        }
    }
}
