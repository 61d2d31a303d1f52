//! In-memory object store.
//!
//! Objects live in one mutexed map. Write batches are applied to a clone of
//! the target object and swapped in only when every op succeeds, which gives
//! the same all-or-nothing guarantee the durable backend gets from its
//! transactions.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

use super::{apply_read_op, apply_write_op, ObjectStore, ReadOp, WriteOp};
use crate::protocol::ObjectOps;
use crate::status::{Status, StoreResult};

#[derive(Debug, Clone, Default)]
struct Object {
    xattrs: HashMap<String, Bytes>,
    omap: BTreeMap<String, Bytes>,
}

/// A scratch view of one object while a batch executes.
struct Scratch {
    object: Option<Object>,
}

impl ObjectOps for Scratch {
    fn exists(&self) -> bool {
        self.object.is_some()
    }

    fn create(&mut self, exclusive: bool) -> StoreResult<()> {
        if self.object.is_some() {
            if exclusive {
                return Err(Status::Exists);
            }
            return Ok(());
        }
        self.object = Some(Object::default());
        Ok(())
    }

    fn get_xattr(&self, name: &str) -> StoreResult<Option<Bytes>> {
        let obj = self.object.as_ref().ok_or(Status::NotFound)?;
        Ok(obj.xattrs.get(name).cloned())
    }

    fn set_xattr(&mut self, name: &str, value: Bytes) -> StoreResult<()> {
        let obj = self.object.as_mut().ok_or(Status::NotFound)?;
        obj.xattrs.insert(name.to_string(), value);
        Ok(())
    }

    fn omap_get(&self, key: &str) -> StoreResult<Option<Bytes>> {
        let obj = self.object.as_ref().ok_or(Status::NotFound)?;
        Ok(obj.omap.get(key).cloned())
    }

    fn omap_set(&mut self, key: &str, value: Bytes) -> StoreResult<()> {
        let obj = self.object.as_mut().ok_or(Status::NotFound)?;
        obj.omap.insert(key.to_string(), value);
        Ok(())
    }

    fn omap_scan(&self, start: &str, prefix: &str, max: u32) -> StoreResult<Vec<(String, Bytes)>> {
        let obj = self.object.as_ref().ok_or(Status::NotFound)?;
        let pairs = obj
            .omap
            .range::<str, _>((Bound::Included(start), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .take(max as usize)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        Ok(pairs)
    }
}

/// In-memory [`ObjectStore`] for tests and ephemeral logs.
#[derive(Debug, Default)]
pub struct MemStore {
    objects: Mutex<HashMap<String, Object>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` against a scratch copy of the object, committing only on
    /// success.
    fn with_scratch<T>(
        &self,
        oid: &str,
        f: impl FnOnce(&mut Scratch) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut objects = self.objects.lock().expect("store mutex poisoned");
        let mut scratch = Scratch {
            object: objects.get(oid).cloned(),
        };
        let out = f(&mut scratch)?;
        match scratch.object {
            Some(obj) => {
                objects.insert(oid.to_string(), obj);
            }
            None => {
                objects.remove(oid);
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl ObjectStore for MemStore {
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
        self.with_scratch(oid, |scratch| apply_read_op(scratch, &op))
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn operate_read(&self, oid: &str, ops: Vec<ReadOp>) -> StoreResult<Vec<Bytes>> {
        self.with_scratch(oid, |scratch| {
            let mut outputs = Vec::with_capacity(ops.len());
            for op in &ops {
                outputs.push(apply_read_op(scratch, op)?);
            }
            Ok(outputs)
        })
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn operate_write(&self, oid: &str, ops: Vec<WriteOp>) -> StoreResult<()> {
        self.with_scratch(oid, |scratch| {
            for op in &ops {
                apply_write_op(scratch, op)?;
            }
            Ok(())
        })
    }

    async fn unique_id(&self, _oid: &str) -> StoreResult<u64> {
        Ok(uuid::Uuid::new_v4().as_u64_pair().0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn should_create_exclusively_once() {
        // given
        let store = MemStore::new();

        // when/then
        store.create("obj", true).await.unwrap();
        assert_eq!(store.create("obj", true).await, Err(Status::Exists));
        store.create("obj", false).await.unwrap();
    }

    #[tokio::test]
    async fn should_reject_setxattr_on_missing_object() {
        let store = MemStore::new();
        let result = store.setxattr("obj", "name", Bytes::new()).await;
        assert_eq!(result, Err(Status::NotFound));
    }

    #[tokio::test]
    async fn should_abort_whole_batch_on_failure() {
        // given
        let store = MemStore::new();

        // when: the second op fails because the object is never created
        let result = store
            .operate_write(
                "obj",
                vec![
                    WriteOp::Create { exclusive: true },
                    WriteOp::SetXattr {
                        name: "a".to_string(),
                        value: Bytes::from_static(b"1"),
                    },
                    WriteOp::OmapSet {
                        key: "".to_string(),
                        value: Bytes::new(),
                    },
                    WriteOp::Create { exclusive: true },
                ],
            )
            .await;

        // then: nothing was applied, not even the create
        assert_eq!(result, Err(Status::Exists));
        let read = store
            .operate_read(
                "obj",
                vec![ReadOp::GetXattr {
                    name: "a".to_string(),
                }],
            )
            .await;
        assert_eq!(read, Err(Status::NotFound));
    }

    #[tokio::test]
    async fn should_scan_omap_in_key_order() {
        // given
        let store = MemStore::new();
        store.create("obj", true).await.unwrap();
        for key in ["p.003", "p.001", "q.009", "p.002"] {
            store
                .operate_write(
                    "obj",
                    vec![WriteOp::OmapSet {
                        key: key.to_string(),
                        value: Bytes::copy_from_slice(key.as_bytes()),
                    }],
                )
                .await
                .unwrap();
        }

        // when
        let pairs = store
            .with_scratch("obj", |scratch| scratch.omap_scan("p.002", "p.", 10))
            .unwrap();

        // then
        let keys: Vec<_> = pairs.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["p.002", "p.003"]);
    }

    #[tokio::test]
    async fn should_hand_out_distinct_unique_ids() {
        let store = MemStore::new();
        let a = store.unique_id("obj").await.unwrap();
        let b = store.unique_id("obj").await.unwrap();
        assert_ne!(a, b);
    }
}
