//! Server-side protocols executed inside the object store.
//!
//! Every log-specific mutation or query of an object goes through
//! [`dispatch`], which routes a named method to the entry-object or
//! head-object state machine. Handlers operate on a single object through the
//! narrow [`ObjectOps`] interface, so each backend can run them under its own
//! atomicity mechanism (an in-memory clone-and-swap, an LMDB write
//! transaction) while sharing one implementation of the semantics.
//!
//! # Persisted layout
//!
//! - Entry objects: header xattr [`DATA_HEADER_XATTR`] plus one keyed value
//!   per position, `zlog.data.entry.<position>` with the position zero-padded
//!   to 20 decimal digits.
//! - Head objects: header xattr [`HEAD_HEADER_XATTR`] plus one keyed value
//!   per view, `zlog.head.view.<epoch>` with the same padding.

mod entry;
mod view;

pub use entry::{
    EntryHeader, EpochRequest, InvalidateRequest, MaxPos, ReadRequest, StripeParams, WriteRequest,
};
pub use view::{HeadHeader, ViewCreateRequest, ViewInitRequest, ViewReadRequest, Views};

use bytes::Bytes;

use crate::status::{Status, StoreResult};

/// Namespace under which all server-side methods are registered.
pub const NAMESPACE: &str = "zlog";

/// Xattr holding an entry object's header.
pub const DATA_HEADER_XATTR: &str = "zlog.data.header";

/// Xattr holding a head object's header.
pub const HEAD_HEADER_XATTR: &str = "zlog.head.header";

/// Key prefix for entry cells.
pub const ENTRY_KEY_PREFIX: &str = "zlog.data.entry.";

/// Key prefix for view blobs.
pub const VIEW_KEY_PREFIX: &str = "zlog.head.view.";

/// Formats the keyed-value key for an entry cell.
pub fn entry_key(position: u64) -> String {
    format!("{}{:020}", ENTRY_KEY_PREFIX, position)
}

/// Formats the keyed-value key for a view blob.
pub fn view_key(epoch: u64) -> String {
    format!("{}{:020}", VIEW_KEY_PREFIX, epoch)
}

/// Single-object operations available to protocol handlers.
///
/// Implementations serialize all access to one object: a handler runs with
/// exclusive access and its mutations either all persist (handler returned
/// `Ok`) or none do.
pub trait ObjectOps {
    /// Whether the object exists.
    fn exists(&self) -> bool;

    /// Creates the object. With `exclusive`, fails [`Status::Exists`] if it
    /// already exists; otherwise idempotent.
    fn create(&mut self, exclusive: bool) -> StoreResult<()>;

    fn get_xattr(&self, name: &str) -> StoreResult<Option<Bytes>>;

    fn set_xattr(&mut self, name: &str, value: Bytes) -> StoreResult<()>;

    fn omap_get(&self, key: &str) -> StoreResult<Option<Bytes>>;

    fn omap_set(&mut self, key: &str, value: Bytes) -> StoreResult<()>;

    /// Scans keyed values with the given prefix, ascending from `start`
    /// (inclusive), returning at most `max` pairs.
    fn omap_scan(&self, start: &str, prefix: &str, max: u32) -> StoreResult<Vec<(String, Bytes)>>;
}

/// Routes a server-side method call to its handler.
///
/// Unknown methods and undecodable requests fail [`Status::InvalidArgument`].
/// Write-style methods return an empty payload on success.
pub fn dispatch(obj: &mut dyn ObjectOps, method: &str, input: &[u8]) -> StoreResult<Bytes> {
    match method {
        "entry_init" => entry::init(obj, input).map(|()| Bytes::new()),
        "entry_read" => entry::read(obj, input),
        "entry_write" => entry::write(obj, input).map(|()| Bytes::new()),
        "entry_invalidate" => entry::invalidate(obj, input).map(|()| Bytes::new()),
        "entry_seal" => entry::seal(obj, input).map(|()| Bytes::new()),
        "entry_max_position" => entry::max_position(obj, input),
        "view_init" => view::init(obj, input).map(|()| Bytes::new()),
        "view_create" => view::create(obj, input).map(|()| Bytes::new()),
        "view_read" => view::read(obj, input),
        _ => {
            tracing::debug!(method, "unknown server-side method");
            Err(Status::InvalidArgument)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_zero_pad_keys_to_twenty_digits() {
        assert_eq!(entry_key(160), "zlog.data.entry.00000000000000000160");
        assert_eq!(view_key(1), "zlog.head.view.00000000000000000001");
        assert_eq!(
            entry_key(u64::MAX),
            "zlog.data.entry.18446744073709551615"
        );
    }

    #[test]
    fn should_order_padded_keys_numerically() {
        // lexicographic order over padded keys matches numeric order
        assert!(entry_key(2) < entry_key(10));
        assert!(view_key(9) < view_key(11));
    }
}
