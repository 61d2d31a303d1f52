//! Storage-side building blocks for the zlog shared log.
//!
//! This crate holds everything that runs at (or stands in for) the object
//! store:
//!
//! - [`store`]: the [`ObjectStore`] capability the client consumes, with an
//!   in-memory implementation and a durable LMDB implementation, selected
//!   through [`StoreConfig`].
//! - [`protocol`]: the server-side state machines for entry objects (striped
//!   log cells under epoch fencing) and head objects (the strictly-ordered
//!   view log), executed atomically per object by the store.
//! - [`status`] / [`wire`]: the portable status codes and the byte codec the
//!   protocol speaks.
//!
//! The client library lives in the `zlog` crate; the split mirrors the
//! deployment boundary between log handles and the storage service.

pub mod protocol;
pub mod status;
pub mod store;
pub mod wire;

pub use status::{Status, StoreResult};
pub use store::{
    create_store, LmdbStore, LmdbStoreConfig, MemStore, ObjectStore, ReadOp, StoreConfig, WriteOp,
};
