//! Object-store capability consumed by the log client.
//!
//! The store executes server-side methods ([`crate::protocol`]) and a small
//! set of generic object operations. All write operations submitted against
//! one object in a single [`ObjectStore::operate_write`] call apply
//! atomically: a failing op aborts the whole batch with no state change.
//! Single-object serialization is the ordering primitive the client's
//! epoch-fencing protocol rests on.

mod config;
mod lmdb;
mod memory;

pub use config::{create_store, LmdbStoreConfig, StoreConfig};
pub use lmdb::LmdbStore;
pub use memory::MemStore;

use async_trait::async_trait;
use bytes::Bytes;

use crate::protocol::{self, ObjectOps};
use crate::status::{Status, StoreResult};

/// A read-style operation against one object.
#[derive(Debug, Clone)]
pub enum ReadOp {
    /// Run a server-side method and collect its output.
    Exec {
        namespace: String,
        method: String,
        input: Bytes,
    },
    /// Read an extended attribute.
    GetXattr { name: String },
    /// Read a keyed value.
    OmapGet { key: String },
}

/// A write-style operation against one object.
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Create the object; with `exclusive`, fail if it already exists.
    Create { exclusive: bool },
    /// Set an extended attribute. The object must exist.
    SetXattr { name: String, value: Bytes },
    /// Set a keyed value. The object must exist.
    OmapSet { key: String, value: Bytes },
    /// Run a server-side method.
    Exec {
        namespace: String,
        method: String,
        input: Bytes,
    },
}

/// Capability interface over the backing object store.
///
/// Implementations must serialize operations per object and execute write
/// batches atomically. Two implementations ship with this crate:
/// [`MemStore`] for tests and ephemeral use, [`LmdbStore`] for durable
/// single-host deployments.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Creates an object. With `exclusive`, fails [`Status::Exists`] if the
    /// object already exists; otherwise creation is idempotent.
    async fn create(&self, oid: &str, exclusive: bool) -> StoreResult<()>;

    /// Sets an extended attribute on an existing object.
    async fn setxattr(&self, oid: &str, name: &str, value: Bytes) -> StoreResult<()>;

    /// Runs one server-side method and returns its output payload.
    async fn exec(
        &self,
        oid: &str,
        namespace: &str,
        method: &str,
        input: Bytes,
    ) -> StoreResult<Bytes>;

    /// Executes read-style ops in order, returning one payload per op.
    async fn operate_read(&self, oid: &str, ops: Vec<ReadOp>) -> StoreResult<Vec<Bytes>>;

    /// Executes write-style ops in order, atomically.
    async fn operate_write(&self, oid: &str, ops: Vec<WriteOp>) -> StoreResult<()>;

    /// Returns a store-supplied identifier, unique per call, scoped to the
    /// given object. Feeds the client token.
    async fn unique_id(&self, oid: &str) -> StoreResult<u64>;
}

/// Dispatches an exec op after validating its namespace.
fn run_exec(
    obj: &mut dyn ObjectOps,
    namespace: &str,
    method: &str,
    input: &[u8],
) -> StoreResult<Bytes> {
    if namespace != protocol::NAMESPACE {
        tracing::debug!(namespace, method, "unknown exec namespace");
        return Err(Status::InvalidArgument);
    }
    protocol::dispatch(obj, method, input)
}

/// Applies one read op. `Exec` methods may legitimately update object
/// metadata (an entry read can advance the object epoch), so the backend
/// commits on success even for the read path.
pub(crate) fn apply_read_op(obj: &mut dyn ObjectOps, op: &ReadOp) -> StoreResult<Bytes> {
    match op {
        ReadOp::Exec {
            namespace,
            method,
            input,
        } => run_exec(obj, namespace, method, input),
        ReadOp::GetXattr { name } => {
            if !obj.exists() {
                return Err(Status::NotFound);
            }
            obj.get_xattr(name)?.ok_or(Status::NotFound)
        }
        ReadOp::OmapGet { key } => {
            if !obj.exists() {
                return Err(Status::NotFound);
            }
            obj.omap_get(key)?.ok_or(Status::NotFound)
        }
    }
}

/// Applies one write op.
pub(crate) fn apply_write_op(obj: &mut dyn ObjectOps, op: &WriteOp) -> StoreResult<()> {
    match op {
        WriteOp::Create { exclusive } => obj.create(*exclusive),
        WriteOp::SetXattr { name, value } => {
            if !obj.exists() {
                return Err(Status::NotFound);
            }
            obj.set_xattr(name, value.clone())
        }
        WriteOp::OmapSet { key, value } => {
            if !obj.exists() {
                return Err(Status::NotFound);
            }
            obj.omap_set(key, value.clone())
        }
        WriteOp::Exec {
            namespace,
            method,
            input,
        } => run_exec(obj, namespace, method, input).map(|_| ()),
    }
}
