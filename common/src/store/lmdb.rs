//! LMDB-backed object store.
//!
//! Objects map onto three databases: an existence table, an xattr table, and
//! a keyed-value table. Xattr and keyed-value entries are keyed by
//! `<oid>\0<name>`, which keeps one object's keys contiguous and lets scans
//! run as a bounded range over the keyed-value table. Every batch (and every
//! exec) runs inside a single write transaction, so a failing op aborts with
//! no state change.

use std::ops::Bound;
use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use heed::types::{Bytes as RawBytes, Str, Unit};
use heed::{Database, Env, EnvOpenOptions, RwTxn};

use super::{apply_read_op, apply_write_op, ObjectStore, ReadOp, WriteOp};
use crate::protocol::ObjectOps;
use crate::status::{Status, StoreResult};

const MAX_DBS: u32 = 3;

fn lmdb_err(err: heed::Error) -> Status {
    tracing::error!(error = %err, "lmdb operation failed");
    Status::Corrupt
}

fn io_err(err: std::io::Error) -> Status {
    tracing::error!(error = %err, "lmdb store io failure");
    Status::Corrupt
}

#[derive(Clone, Copy)]
struct Tables {
    objects: Database<Str, Unit>,
    xattrs: Database<Str, RawBytes>,
    omap: Database<Str, RawBytes>,
}

fn scoped_key(oid: &str, name: &str) -> String {
    format!("{}\0{}", oid, name)
}

/// One object's view of the store inside a write transaction.
struct TxnObject<'a, 'e> {
    txn: &'a mut RwTxn<'e>,
    tables: Tables,
    oid: &'a str,
}

impl ObjectOps for TxnObject<'_, '_> {
    fn exists(&self) -> bool {
        self.tables
            .objects
            .get(&*self.txn, self.oid)
            .map(|marker| marker.is_some())
            .unwrap_or(false)
    }

    fn create(&mut self, exclusive: bool) -> StoreResult<()> {
        if self.exists() {
            if exclusive {
                return Err(Status::Exists);
            }
            return Ok(());
        }
        self.tables
            .objects
            .put(self.txn, self.oid, &())
            .map_err(lmdb_err)
    }

    fn get_xattr(&self, name: &str) -> StoreResult<Option<Bytes>> {
        self.tables
            .xattrs
            .get(&*self.txn, &scoped_key(self.oid, name))
            .map(|raw| raw.map(Bytes::copy_from_slice))
            .map_err(lmdb_err)
    }

    fn set_xattr(&mut self, name: &str, value: Bytes) -> StoreResult<()> {
        self.tables
            .xattrs
            .put(self.txn, &scoped_key(self.oid, name), &value)
            .map_err(lmdb_err)
    }

    fn omap_get(&self, key: &str) -> StoreResult<Option<Bytes>> {
        self.tables
            .omap
            .get(&*self.txn, &scoped_key(self.oid, key))
            .map(|raw| raw.map(Bytes::copy_from_slice))
            .map_err(lmdb_err)
    }

    fn omap_set(&mut self, key: &str, value: Bytes) -> StoreResult<()> {
        self.tables
            .omap
            .put(self.txn, &scoped_key(self.oid, key), &value)
            .map_err(lmdb_err)
    }

    fn omap_scan(&self, start: &str, prefix: &str, max: u32) -> StoreResult<Vec<(String, Bytes)>> {
        let scoped_start = scoped_key(self.oid, start);
        let scoped_prefix = scoped_key(self.oid, prefix);
        let iter = self
            .tables
            .omap
            .range(
                &*self.txn,
                &(Bound::Included(scoped_start.as_str()), Bound::Unbounded),
            )
            .map_err(lmdb_err)?;

        let mut pairs = Vec::new();
        for item in iter {
            let (key, value) = item.map_err(lmdb_err)?;
            if !key.starts_with(&scoped_prefix) {
                break;
            }
            if pairs.len() as u32 >= max {
                break;
            }
            let unscoped = key
                .strip_prefix(&scoped_key(self.oid, ""))
                .ok_or(Status::Corrupt)?;
            pairs.push((unscoped.to_string(), Bytes::copy_from_slice(value)));
        }
        Ok(pairs)
    }
}

/// Durable [`ObjectStore`] over an LMDB environment.
pub struct LmdbStore {
    env: Env,
    tables: Tables,
}

impl LmdbStore {
    /// Opens (or creates) a store under the given directory.
    pub fn open(path: impl AsRef<Path>, map_size: usize) -> StoreResult<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path).map_err(io_err)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(MAX_DBS)
                .open(path)
                .map_err(lmdb_err)?
        };

        let mut wtxn = env.write_txn().map_err(lmdb_err)?;
        let objects = env
            .create_database(&mut wtxn, Some("objects"))
            .map_err(lmdb_err)?;
        let xattrs = env
            .create_database(&mut wtxn, Some("xattrs"))
            .map_err(lmdb_err)?;
        let omap = env
            .create_database(&mut wtxn, Some("omap"))
            .map_err(lmdb_err)?;
        wtxn.commit().map_err(lmdb_err)?;

        Ok(Self {
            env,
            tables: Tables {
                objects,
                xattrs,
                omap,
            },
        })
    }

    /// Runs `f` inside one write transaction on a blocking worker thread,
    /// committing only when it succeeds.
    async fn with_txn<T, F>(&self, oid: &str, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut TxnObject<'_, '_>) -> StoreResult<T> + Send + 'static,
    {
        let env = self.env.clone();
        let tables = self.tables;
        let oid = oid.to_string();
        tokio::task::spawn_blocking(move || {
            let mut txn = env.write_txn().map_err(lmdb_err)?;
            let out = {
                let mut obj = TxnObject {
                    txn: &mut txn,
                    tables,
                    oid: &oid,
                };
                f(&mut obj)
            };
            match out {
                Ok(value) => {
                    txn.commit().map_err(lmdb_err)?;
                    Ok(value)
                }
                Err(status) => {
                    txn.abort();
                    Err(status)
                }
            }
        })
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "lmdb worker task failed");
            Status::Corrupt
        })?
    }
}

#[async_trait]
impl ObjectStore for LmdbStore {
    #[tracing::instrument(level = "trace", skip_all)]
    async fn create(&self, oid: &str, exclusive: bool) -> StoreResult<()> {
        self.operate_write(oid, vec![WriteOp::Create { exclusive }])
            .await
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn setxattr(&self, oid: &str, name: &str, value: Bytes) -> StoreResult<()> {
        self.operate_write(
            oid,
            vec![WriteOp::SetXattr {
                name: name.to_string(),
                value,
            }],
        )
        .await
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn exec(
        &self,
        oid: &str,
        namespace: &str,
        method: &str,
        input: Bytes,
    ) -> StoreResult<Bytes> {
        let op = ReadOp::Exec {
            namespace: namespace.to_string(),
            method: method.to_string(),
            input,
        };
        self.with_txn(oid, move |obj| apply_read_op(obj, &op)).await
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn operate_read(&self, oid: &str, ops: Vec<ReadOp>) -> StoreResult<Vec<Bytes>> {
        self.with_txn(oid, move |obj| {
            let mut outputs = Vec::with_capacity(ops.len());
            for op in &ops {
                outputs.push(apply_read_op(obj, op)?);
            }
            Ok(outputs)
        })
        .await
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn operate_write(&self, oid: &str, ops: Vec<WriteOp>) -> StoreResult<()> {
        self.with_txn(oid, move |obj| {
            for op in &ops {
                apply_write_op(obj, op)?;
            }
            Ok(())
        })
        .await
    }

    async fn unique_id(&self, _oid: &str) -> StoreResult<u64> {
        Ok(uuid::Uuid::new_v4().as_u64_pair().0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_MAP_SIZE: usize = 16 * 1024 * 1024;

    fn open_store() -> (tempfile::TempDir, LmdbStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LmdbStore::open(dir.path(), TEST_MAP_SIZE).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn should_persist_objects_across_reopen() {
        // given
        let dir = tempfile::tempdir().unwrap();
        {
            let store = LmdbStore::open(dir.path(), TEST_MAP_SIZE).unwrap();
            store.create("obj", true).await.unwrap();
            store
                .setxattr("obj", "a", Bytes::from_static(b"1"))
                .await
                .unwrap();
        }

        // when
        let store = LmdbStore::open(dir.path(), TEST_MAP_SIZE).unwrap();
        let out = store
            .operate_read(
                "obj",
                vec![ReadOp::GetXattr {
                    name: "a".to_string(),
                }],
            )
            .await
            .unwrap();

        // then
        assert_eq!(out, vec![Bytes::from_static(b"1")]);
    }

    #[tokio::test]
    async fn should_scope_keys_per_object() {
        // given
        let (_dir, store) = open_store();
        store.create("a", true).await.unwrap();
        store.create("b", true).await.unwrap();
        store
            .operate_write(
                "a",
                vec![WriteOp::OmapSet {
                    key: "k".to_string(),
                    value: Bytes::from_static(b"va"),
                }],
            )
            .await
            .unwrap();

        // when: the same key on the other object is absent
        let read = store
            .operate_read(
                "b",
                vec![ReadOp::OmapGet {
                    key: "k".to_string(),
                }],
            )
            .await;

        // then
        assert_eq!(read, Err(Status::NotFound));
    }

    #[tokio::test]
    async fn should_abort_batch_without_partial_state() {
        // given
        let (_dir, store) = open_store();

        // when: batch fails on the exclusive re-create
        let result = store
            .operate_write(
                "obj",
                vec![
                    WriteOp::Create { exclusive: true },
                    WriteOp::Create { exclusive: true },
                ],
            )
            .await;

        // then
        assert_eq!(result, Err(Status::Exists));
        assert_eq!(
            store.create("obj", true).await,
            Ok(()),
            "aborted create must leave no object behind"
        );
    }
}
