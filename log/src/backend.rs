//! Typed client stubs for the server-side methods of one log.
//!
//! Bundles the store handle with the per-log naming state (head object id,
//! entry-object prefix, client token) so the rest of the client never
//! assembles wire requests or object ids by hand.

use std::sync::Arc;

use bytes::Bytes;

use zlog_common::protocol::{
    EpochRequest, InvalidateRequest, MaxPos, ReadRequest, ViewCreateRequest, ViewInitRequest,
    ViewReadRequest, Views, WriteRequest, NAMESPACE,
};
use zlog_common::{ObjectStore, Status, StoreResult};

use crate::Position;

/// Store handle plus the naming state of one open log.
pub(crate) struct LogBackend {
    store: Arc<dyn ObjectStore>,
    hoid: String,
    prefix: String,
    token: String,
}

impl LogBackend {
    pub fn new(store: Arc<dyn ObjectStore>, hoid: String, prefix: String, token: String) -> Self {
        Self {
            store,
            hoid,
            prefix,
            token,
        }
    }

    /// Object-name prefix for this log's entry objects.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// This client's per-open identity token.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub async fn entry_init(&self, oid: &str, epoch: u64) -> StoreResult<()> {
        let req = EpochRequest { epoch };
        self.store
            .exec(oid, NAMESPACE, "entry_init", req.encode())
            .await
            .map(|_| ())
    }

    pub async fn entry_read(
        &self,
        oid: &str,
        epoch: u64,
        position: Position,
        stride: u32,
        width: u32,
    ) -> StoreResult<Bytes> {
        let req = ReadRequest {
            epoch,
            position,
            stride,
            width,
        };
        self.store
            .exec(oid, NAMESPACE, "entry_read", req.encode())
            .await
    }

    pub async fn entry_write(
        &self,
        oid: &str,
        epoch: u64,
        position: Position,
        stride: u32,
        width: u32,
        payload: Bytes,
    ) -> StoreResult<()> {
        let req = WriteRequest {
            epoch,
            position,
            stride,
            width,
            payload,
        };
        self.store
            .exec(oid, NAMESPACE, "entry_write", req.encode())
            .await
            .map(|_| ())
    }

    pub async fn entry_invalidate(
        &self,
        oid: &str,
        epoch: u64,
        position: Position,
        stride: u32,
        width: u32,
        force: bool,
    ) -> StoreResult<()> {
        let req = InvalidateRequest {
            epoch,
            position,
            stride,
            width,
            force,
        };
        self.store
            .exec(oid, NAMESPACE, "entry_invalidate", req.encode())
            .await
            .map(|_| ())
    }

    pub async fn entry_seal(&self, oid: &str, epoch: u64) -> StoreResult<()> {
        let req = EpochRequest { epoch };
        self.store
            .exec(oid, NAMESPACE, "entry_seal", req.encode())
            .await
            .map(|_| ())
    }

    pub async fn entry_max_position(&self, oid: &str, epoch: u64) -> StoreResult<MaxPos> {
        let req = EpochRequest { epoch };
        let raw = self
            .store
            .exec(oid, NAMESPACE, "entry_max_position", req.encode())
            .await?;
        MaxPos::decode(&raw).map_err(|_| Status::Corrupt)
    }

    pub async fn view_init(&self, prefix: &str) -> StoreResult<()> {
        let req = ViewInitRequest {
            prefix: prefix.to_string(),
        };
        self.store
            .exec(&self.hoid, NAMESPACE, "view_init", req.encode())
            .await
            .map(|_| ())
    }

    pub async fn view_create(&self, epoch: u64, blob: Bytes) -> StoreResult<()> {
        let req = ViewCreateRequest { epoch, blob };
        self.store
            .exec(&self.hoid, NAMESPACE, "view_create", req.encode())
            .await
            .map(|_| ())
    }

    pub async fn view_read(&self, start_epoch: u64, max_views: u32) -> StoreResult<Views> {
        let req = ViewReadRequest {
            start_epoch,
            max_views,
        };
        let raw = self
            .store
            .exec(&self.hoid, NAMESPACE, "view_read", req.encode())
            .await?;
        Views::decode(&raw).map_err(|_| Status::Corrupt)
    }
}
