//! Status codes shared by the server-side protocols and the object store.
//!
//! Every server-side method resolves to either a payload or one of these
//! codes. The store itself reports its own faults through the same type so
//! that clients see a single, portable error surface: infrastructure
//! failures are logged at the backend and surfaced as [`Status::Corrupt`].

use thiserror::Error;

/// Result alias for object-store and server-side method calls.
pub type StoreResult<T> = Result<T, Status>;

/// Portable status codes returned by server-side methods.
///
/// The protocol semantics (which code a method returns under which
/// precondition) are documented on the individual methods in
/// [`crate::protocol`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Status {
    /// The object (or log) does not exist.
    #[error("object not found")]
    NotFound,

    /// The object already exists and exclusive creation was requested.
    #[error("object already exists")]
    Exists,

    /// Malformed request, zero epoch, wrong next-epoch, empty prefix, or a
    /// stripe-geometry mismatch.
    #[error("invalid argument")]
    InvalidArgument,

    /// An object header or entry cell exists but cannot be decoded, or the
    /// backend itself failed.
    #[error("corrupt object state")]
    Corrupt,

    /// The requested position has not been written.
    #[error("position out of range")]
    OutOfRange,

    /// The caller's epoch is behind the object's epoch; its view is stale.
    #[error("stale epoch")]
    StaleEpoch,

    /// The entry cell is write-once and already occupied.
    #[error("entry is read-only")]
    ReadOnly,

    /// The entry cell holds an invalidated (filled or trimmed) marker.
    #[error("entry invalidated")]
    Invalidated,
}
