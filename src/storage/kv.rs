// Copyright (c) 2026 Amunchain
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! A small sorted key/value abstraction the version and endpoint tables are
//! built on, with a `sled`-backed implementation for production and an
//! in-memory one for tests.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, RwLock};

use thiserror::Error;

const META_TREE: &str = "_meta";
const SCHEMA_VERSION_KEY: &[u8] = b"dbVersion";

/// Storage errors. All are non-fatal to the announce loop (`ProtocolError::StoreError`).
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying I/O or sled engine error.
    #[error("storage io")]
    Io,
    /// A transaction was aborted (conflict or caller-returned error).
    #[error("transaction aborted")]
    Transaction,
    /// The on-disk schema version doesn't match and could not be rebuilt.
    #[error("schema mismatch")]
    SchemaMismatch,
}

impl From<sled::Error> for StoreError {
    fn from(_: sled::Error) -> Self {
        StoreError::Io
    }
}

/// A single write in an atomic batch.
#[derive(Clone, Debug)]
pub enum KvOp {
    /// Insert or overwrite `key` with `value`.
    Put {
        /// Key bytes.
        key: Vec<u8>,
        /// Value bytes.
        value: Vec<u8>,
    },
    /// Remove `key` if present.
    Del {
        /// Key bytes.
        key: Vec<u8>,
    },
}

/// Sorted key/value store, namespaced into named trees (one per logical
/// table: version table, endpoint table, …). All operations within one
/// `commit_atomic` call land or none do.
pub trait KvStore: Send + Sync {
    /// Point lookup.
    fn get(&self, tree: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    /// Apply a batch of writes atomically within one tree.
    fn commit_atomic(&self, tree: &str, ops: Vec<KvOp>) -> Result<(), StoreError>;
    /// Iterate all entries whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, tree: &str, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;
    /// Iterate every entry in a tree, in key order.
    fn scan_all(&self, tree: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        self.scan_prefix(tree, &[])
    }
}

/// `sled`-backed implementation. Schema is guarded by a `dbVersion` key in a
/// reserved `_meta` tree: missing on first open (written), rebuilt (all
/// non-meta trees dropped) on a version mismatch, and left to sled's own
/// crash-recovery on corruption (sled repairs its log on open; a corrupt
/// open surfaces as `StoreError::Io`).
pub struct SledKvStore {
    db: sled::Db,
}

impl SledKvStore {
    /// Open (or create) a sled database at `path`, enforcing `schema_version`.
    pub fn open(path: &Path, schema_version: u32, cache_capacity_bytes: Option<u64>) -> Result<Self, StoreError> {
        let mut cfg = sled::Config::new().path(path);
        if let Some(cap) = cache_capacity_bytes {
            cfg = cfg.cache_capacity(cap);
        }
        let db = cfg.open()?;
        Self::open_schema(&db, schema_version)?;
        Ok(Self { db })
    }

    fn open_schema(db: &sled::Db, expected: u32) -> Result<(), StoreError> {
        let meta = db.open_tree(META_TREE)?;
        match meta.get(SCHEMA_VERSION_KEY)? {
            None => {
                meta.insert(SCHEMA_VERSION_KEY, &expected.to_be_bytes())?;
                meta.flush()?;
                Ok(())
            }
            Some(v) => {
                let mut buf = [0u8; 4];
                if v.len() != 4 {
                    return Err(StoreError::SchemaMismatch);
                }
                buf.copy_from_slice(&v);
                let on_disk = u32::from_be_bytes(buf);
                if on_disk == expected {
                    return Ok(());
                }
                // Version mismatch: drop every non-meta tree and rebuild fresh.
                for name in db.tree_names() {
                    if name == META_TREE.as_bytes() {
                        continue;
                    }
                    db.drop_tree(&name)?;
                }
                meta.insert(SCHEMA_VERSION_KEY, &expected.to_be_bytes())?;
                meta.flush()?;
                Ok(())
            }
        }
    }
}

impl KvStore for SledKvStore {
    fn get(&self, tree: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let t = self.db.open_tree(tree)?;
        Ok(t.get(key)?.map(|v| v.to_vec()))
    }

    fn commit_atomic(&self, tree: &str, ops: Vec<KvOp>) -> Result<(), StoreError> {
        let t = self.db.open_tree(tree)?;
        t.transaction(|tx| {
            for op in &ops {
                match op {
                    KvOp::Put { key, value } => {
                        tx.insert(key.as_slice(), value.as_slice())?;
                    }
                    KvOp::Del { key } => {
                        tx.remove(key.as_slice())?;
                    }
                }
            }
            Ok(())
        })
        .map_err(|_: sled::transaction::TransactionError<()>| StoreError::Transaction)?;
        Ok(())
    }

    fn scan_prefix(&self, tree: &str, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let t = self.db.open_tree(tree)?;
        let mut out = Vec::new();
        for item in t.scan_prefix(prefix) {
            let (k, v) = item?;
            out.push((k.to_vec(), v.to_vec()));
        }
        Ok(out)
    }
}

/// In-memory implementation of [`KvStore`], used by tests and by the
/// announce loop's `--ephemeral` mode. Same interface, no persistence.
#[derive(Default)]
pub struct MemKvStore {
    trees: RwLock<BTreeMap<String, Mutex<BTreeMap<Vec<u8>, Vec<u8>>>>>,
}

impl MemKvStore {
    /// Construct an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_tree<T>(&self, name: &str, f: impl FnOnce(&mut BTreeMap<Vec<u8>, Vec<u8>>) -> T) -> T {
        {
            let read = self.trees.read().expect("lock poisoned");
            if let Some(tree) = read.get(name) {
                let mut guard = tree.lock().expect("lock poisoned");
                return f(&mut guard);
            }
        }
        let mut write = self.trees.write().expect("lock poisoned");
        let tree = write.entry(name.to_string()).or_insert_with(|| Mutex::new(BTreeMap::new()));
        let mut guard = tree.lock().expect("lock poisoned");
        f(&mut guard)
    }
}

impl KvStore for MemKvStore {
    fn get(&self, tree: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.with_tree(tree, |t| t.get(key).cloned()))
    }

    fn commit_atomic(&self, tree: &str, ops: Vec<KvOp>) -> Result<(), StoreError> {
        self.with_tree(tree, |t| {
            for op in ops {
                match op {
                    KvOp::Put { key, value } => {
                        t.insert(key, value);
                    }
                    KvOp::Del { key } => {
                        t.remove(&key);
                    }
                }
            }
        });
        Ok(())
    }

    fn scan_prefix(&self, tree: &str, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        Ok(self.with_tree(tree, |t| {
            t.iter()
                .filter(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        }))
    }
}
