//! Crash-safe persistence of pod bindings.
//!
//! Records live in a single LMDB database (`root`) inside one environment file.
//! Each pod is one key, `namespace \0 name`, whose value is the JSON encoding of
//! its container → binding map. Every operation runs in its own transaction, so
//! a record is always either fully written or absent.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use lmdb::Cursor;
use lmdb::Database;
use lmdb::DatabaseFlags;
use lmdb::Environment;
use lmdb::EnvironmentFlags;
use lmdb::Transaction;
use lmdb::WriteFlags;
use thiserror::Error;
use tracing::debug;
use tracing::warn;

use crate::types::Binding;
use crate::types::PodRecord;

/// Name of the only database in the environment.
pub const ROOT_BUCKET: &str = "root";

/// Separates namespace and name inside a key. Kubernetes object names cannot
/// contain it, so `(a, "b/c")` and `("a/b", c)` never share a key.
const KEY_DELIMITER: char = '\0';

const MAP_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no binding record for pod {namespace}/{name}")]
    NotFound { namespace: String, name: String },
    #[error("lmdb operation failed: {0}")]
    Lmdb(#[from] lmdb::Error),
    #[error("failed to encode or decode binding record: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("failed to prepare store directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed record key: {0:?}")]
    MalformedKey(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Persistent map from pod to its container bindings.
pub trait BindingStore: Send + Sync {
    /// Writes the whole record, replacing any previous value for the pod.
    fn save(&self, record: &PodRecord) -> Result<(), StoreError>;

    /// Fails with [`StoreError::NotFound`] when the pod has no record.
    fn load(&self, namespace: &str, name: &str) -> Result<PodRecord, StoreError>;

    /// Removes the pod's record with all its bindings. Missing records are fine.
    fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    /// Removes the pod's record only while it still holds exactly the bindings
    /// of `expected`. Returns false, leaving the store untouched, when the
    /// record was rewritten in the meantime.
    fn delete_if_unchanged(&self, expected: &PodRecord) -> Result<bool, StoreError>;

    /// Visits every entry in key order. Entries that cannot be decoded are
    /// passed as errors, the scan goes on.
    fn for_each(
        &self,
        visit: &mut dyn FnMut(Result<PodRecord, StoreError>),
    ) -> Result<(), StoreError>;

    /// Returns the stored record or a fresh empty one. Never writes.
    fn load_or_create(&self, namespace: &str, name: &str) -> PodRecord {
        match self.load(namespace, name) {
            Ok(record) => record,
            Err(e) => {
                if !e.is_not_found() {
                    warn!(namespace, pod = name, "failed to load binding record, starting empty: {e}");
                }
                PodRecord::new(namespace, name)
            }
        }
    }

    /// Every decodable record. Broken entries are logged and skipped.
    fn list(&self) -> Result<Vec<PodRecord>, StoreError> {
        let mut records = Vec::new();
        self.for_each(&mut |entry| match entry {
            Ok(record) => records.push(record),
            Err(e) => warn!("skipping undecodable binding record: {e}"),
        })?;
        Ok(records)
    }
}

/// [`BindingStore`] backed by an LMDB environment file.
pub struct LmdbBindingStore {
    env: Arc<Environment>,
    db: Database,
}

impl LmdbBindingStore {
    /// Opens (or creates) the environment at `path`. The parent directory is
    /// created if needed; LMDB adds a `-lock` file next to it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let env = Environment::new()
            .set_flags(EnvironmentFlags::NO_SUB_DIR | EnvironmentFlags::NO_TLS)
            .set_max_dbs(1)
            .set_map_size(MAP_SIZE)
            .open(path)?;
        let db = env.create_db(Some(ROOT_BUCKET), DatabaseFlags::empty())?;

        debug!(path = %path.display(), "binding store opened");
        Ok(Self {
            env: Arc::new(env),
            db,
        })
    }
}

impl BindingStore for LmdbBindingStore {
    fn save(&self, record: &PodRecord) -> Result<(), StoreError> {
        let key = encode_key(&record.namespace, &record.name);
        let value = serde_json::to_vec(&record.containers)?;

        let mut txn = self.env.begin_rw_txn()?;
        txn.put(self.db, &key, &value, WriteFlags::empty())?;
        txn.commit()?;
        Ok(())
    }

    fn load(&self, namespace: &str, name: &str) -> Result<PodRecord, StoreError> {
        let key = encode_key(namespace, name);
        let txn = self.env.begin_ro_txn()?;
        let value = match txn.get(self.db, &key) {
            Ok(value) => value,
            Err(lmdb::Error::NotFound) => {
                return Err(StoreError::NotFound {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        Ok(PodRecord {
            namespace: namespace.to_string(),
            name: name.to_string(),
            containers: decode_containers(value)?,
        })
    }

    fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let key = encode_key(namespace, name);
        let mut txn = self.env.begin_rw_txn()?;
        match txn.del(self.db, &key, None) {
            Ok(()) | Err(lmdb::Error::NotFound) => {}
            Err(e) => return Err(e.into()),
        }
        txn.commit()?;
        Ok(())
    }

    fn delete_if_unchanged(&self, expected: &PodRecord) -> Result<bool, StoreError> {
        let key = encode_key(&expected.namespace, &expected.name);
        let mut txn = self.env.begin_rw_txn()?;
        let current = match txn.get(self.db, &key) {
            Ok(value) => decode_containers(value)?,
            Err(lmdb::Error::NotFound) => return Ok(true),
            Err(e) => return Err(e.into()),
        };
        if current != expected.containers {
            debug!(namespace = %expected.namespace, pod = %expected.name, "binding record changed, not deleting");
            return Ok(false);
        }
        txn.del(self.db, &key, None)?;
        txn.commit()?;
        Ok(true)
    }

    fn for_each(
        &self,
        visit: &mut dyn FnMut(Result<PodRecord, StoreError>),
    ) -> Result<(), StoreError> {
        let txn = self.env.begin_ro_txn()?;
        let cursor = txn.open_ro_cursor(self.db)?;
        // `Cursor::iter` panics on read errors, step manually instead
        let mut op = lmdb_sys::MDB_FIRST;
        loop {
            match cursor.get(None, None, op) {
                Ok((Some(key), value)) => visit(decode_record(key, value)),
                Ok((None, _)) => visit(Err(StoreError::MalformedKey(String::new()))),
                Err(lmdb::Error::NotFound) => break,
                Err(e) => return Err(e.into()),
            }
            op = lmdb_sys::MDB_NEXT;
        }
        Ok(())
    }
}

fn encode_key(namespace: &str, name: &str) -> Vec<u8> {
    format!("{namespace}{KEY_DELIMITER}{name}").into_bytes()
}

fn decode_key(key: &[u8]) -> Result<(String, String), StoreError> {
    let key = std::str::from_utf8(key)
        .map_err(|_| StoreError::MalformedKey(String::from_utf8_lossy(key).into_owned()))?;
    key.split_once(KEY_DELIMITER)
        .map(|(namespace, name)| (namespace.to_string(), name.to_string()))
        .ok_or_else(|| StoreError::MalformedKey(key.to_string()))
}

fn decode_containers(value: &[u8]) -> Result<BTreeMap<String, Binding>, StoreError> {
    // a record saved without any container binding may be encoded as `null`
    let containers: Option<BTreeMap<String, Binding>> = serde_json::from_slice(value)?;
    Ok(containers.unwrap_or_default())
}

fn decode_record(key: &[u8], value: &[u8]) -> Result<PodRecord, StoreError> {
    let (namespace, name) = decode_key(key)?;
    Ok(PodRecord {
        containers: decode_containers(value)?,
        namespace,
        name,
    })
}
