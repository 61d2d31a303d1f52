//! Store configuration and factory.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{LmdbStore, MemStore, ObjectStore};
use crate::status::StoreResult;

/// Default LMDB map size (1 GiB).
const DEFAULT_MAP_SIZE: usize = 1 << 30;

fn default_map_size() -> usize {
    DEFAULT_MAP_SIZE
}

/// Object-store backend selection.
///
/// Defaults to `Memory`, which is the right choice for tests and ephemeral
/// logs; production single-host deployments use `Lmdb`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "type")]
pub enum StoreConfig {
    /// In-memory store. Contents are lost when the process exits.
    #[default]
    Memory,

    /// LMDB-backed durable store.
    Lmdb(LmdbStoreConfig),
}

/// LMDB-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LmdbStoreConfig {
    /// Directory holding the LMDB environment.
    pub path: String,

    /// Maximum size of the memory map, in bytes.
    #[serde(default = "default_map_size")]
    pub map_size: usize,
}

/// Creates a store instance from configuration.
pub fn create_store(config: &StoreConfig) -> StoreResult<Arc<dyn ObjectStore>> {
    match config {
        StoreConfig::Memory => Ok(Arc::new(MemStore::new())),
        StoreConfig::Lmdb(lmdb) => Ok(Arc::new(LmdbStore::open(&lmdb.path, lmdb.map_size)?)),
    }
}
