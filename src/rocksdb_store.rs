//! RocksDB-backed descriptor and classification stores.
//!
//! Each store owns one database directory with a single column family. Keys
//! are `<type_label>/<uuid>` with both parts escaped, values are the same
//! encodings the file stores use: bincode `Vec<f32>` for descriptors and JSON
//! for classifications.
//!
//! Requires the `rocksdb` feature flag.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, DB};
use tracing::debug;

use crate::classification::{Classification, ClassificationStore};
use crate::descriptor::{DescriptorStore, Vector};
use crate::error::{Error, Result};
use crate::persistence::escape_key;

/// Column family holding descriptor vectors.
pub const CF_DESCRIPTORS: &str = "descriptors";
/// Column family holding classification results.
pub const CF_CLASSIFICATIONS: &str = "classifications";

fn rocks_err(operation: &'static str) -> impl FnOnce(rocksdb::Error) -> Error {
    move |source| Error::RocksDb { operation, source }
}

fn key(type_label: &str, uuid: &str) -> Vec<u8> {
    format!("{}/{}", escape_key(type_label), escape_key(uuid)).into_bytes()
}

/// One database directory with one column family.
struct KvDb {
    db: DB,
    cf: &'static str,
    path: PathBuf,
}

impl KvDb {
    fn open(path: &Path, cf: &'static str) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let descriptors = vec![ColumnFamilyDescriptor::new(cf, Options::default())];
        let db = DB::open_cf_descriptors(&opts, path, descriptors).map_err(rocks_err("open"))?;
        debug!(path = %path.display(), cf, "opened rocksdb store");
        Ok(Self {
            db,
            cf,
            path: path.to_path_buf(),
        })
    }

    fn handle(&self) -> Result<&ColumnFamily> {
        self.db.cf_handle(self.cf).ok_or_else(|| {
            Error::InvalidState(format!(
                "column family {} missing from {}",
                self.cf,
                self.path.display()
            ))
        })
    }

    fn get(&self, type_label: &str, uuid: &str) -> Result<Vec<u8>> {
        self.db
            .get_cf(self.handle()?, key(type_label, uuid))
            .map_err(rocks_err("get"))?
            .ok_or_else(|| Error::not_found(type_label, uuid))
    }

    fn put(&self, type_label: &str, uuid: &str, value: &[u8]) -> Result<()> {
        self.db
            .put_cf(self.handle()?, key(type_label, uuid), value)
            .map_err(rocks_err("put"))
    }

    /// Key lookup only; the value stays pinned in the block cache and is
    /// never decoded.
    fn contains(&self, type_label: &str, uuid: &str) -> Result<bool> {
        let cf = self.handle()?;
        let key = key(type_label, uuid);
        if !self.db.key_may_exist_cf(cf, &key) {
            return Ok(false);
        }
        Ok(self
            .db
            .get_pinned_cf(cf, &key)
            .map_err(rocks_err("get"))?
            .is_some())
    }

    fn delete(&self, type_label: &str, uuid: &str) -> Result<bool> {
        if !self.contains(type_label, uuid)? {
            return Ok(false);
        }
        self.db
            .delete_cf(self.handle()?, key(type_label, uuid))
            .map_err(rocks_err("delete"))?;
        Ok(true)
    }

    fn count(&self) -> Result<usize> {
        let mut n = 0;
        for entry in self.db.iterator_cf(self.handle()?, IteratorMode::Start) {
            entry.map_err(rocks_err("iterate"))?;
            n += 1;
        }
        Ok(n)
    }
}

impl fmt::Debug for KvDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KvDb")
            .field("path", &self.path)
            .field("cf", &self.cf)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

/// [`DescriptorStore`] in a RocksDB database.
///
/// `has` is a key lookup, so it stays cheap for large vectors and works even
/// when a stored payload can no longer be decoded.
#[derive(Debug, Clone)]
pub struct RocksDbDescriptorStore {
    kv: Arc<KvDb>,
}

impl RocksDbDescriptorStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            kv: Arc::new(KvDb::open(path.as_ref(), CF_DESCRIPTORS)?),
        })
    }

    pub fn path(&self) -> &Path {
        &self.kv.path
    }

    /// Number of stored vectors. Walks the whole column family.
    pub fn len(&self) -> Result<usize> {
        self.kv.count()
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl DescriptorStore for RocksDbDescriptorStore {
    fn get(&self, type_label: &str, uuid: &str) -> Result<Arc<Vector>> {
        let bytes = self.kv.get(type_label, uuid)?;
        let values: Vec<f32> =
            bincode::deserialize(&bytes).map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(Arc::new(Vector::from_vec(values)))
    }

    fn set(&self, type_label: &str, uuid: &str, vector: Arc<Vector>) -> Result<()> {
        let values: Vec<f32> = vector.iter().copied().collect();
        let bytes =
            bincode::serialize(&values).map_err(|e| Error::Serialization(e.to_string()))?;
        self.kv.put(type_label, uuid, &bytes)
    }

    fn has(&self, type_label: &str, uuid: &str) -> Result<bool> {
        self.kv.contains(type_label, uuid)
    }

    fn remove(&self, type_label: &str, uuid: &str) -> Result<bool> {
        self.kv.delete(type_label, uuid)
    }
}

// ---------------------------------------------------------------------------
// Classifications
// ---------------------------------------------------------------------------

/// [`ClassificationStore`] in a RocksDB database.
#[derive(Debug, Clone)]
pub struct RocksDbClassificationStore {
    kv: Arc<KvDb>,
}

impl RocksDbClassificationStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            kv: Arc::new(KvDb::open(path.as_ref(), CF_CLASSIFICATIONS)?),
        })
    }

    pub fn path(&self) -> &Path {
        &self.kv.path
    }

    pub fn len(&self) -> Result<usize> {
        self.kv.count()
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl ClassificationStore for RocksDbClassificationStore {
    fn get(&self, type_label: &str, uuid: &str) -> Result<Classification> {
        let data = self.kv.get(type_label, uuid)?;
        serde_json::from_slice(&data).map_err(|e| Error::Serialization(e.to_string()))
    }

    fn set(&self, type_label: &str, uuid: &str, classification: Classification) -> Result<()> {
        let data =
            serde_json::to_vec(&classification).map_err(|e| Error::Serialization(e.to_string()))?;
        self.kv.put(type_label, uuid, &data)
    }

    fn has(&self, type_label: &str, uuid: &str) -> Result<bool> {
        self.kv.contains(type_label, uuid)
    }

    fn remove(&self, type_label: &str, uuid: &str) -> Result<bool> {
        self.kv.delete(type_label, uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::DescriptorElementFactory;
    use ndarray::array;

    #[test]
    fn test_descriptor_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksDbDescriptorStore::open(dir.path()).unwrap();
        assert!(store.is_empty().unwrap());

        store.set("cnn", "a", Arc::new(array![1.0, -2.0, 3.5])).unwrap();
        assert_eq!(*store.get("cnn", "a").unwrap(), array![1.0, -2.0, 3.5]);
        assert!(store.has("cnn", "a").unwrap());
        assert!(!store.has("sift", "a").unwrap());
        assert!(matches!(store.get("cnn", "b"), Err(Error::NotFound { .. })));
        assert_eq!(store.len().unwrap(), 1);

        assert!(store.remove("cnn", "a").unwrap());
        assert!(!store.remove("cnn", "a").unwrap());
        assert!(!store.has("cnn", "a").unwrap());
    }

    #[test]
    fn test_descriptor_has_does_not_read_payload() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksDbDescriptorStore::open(dir.path()).unwrap();
        store.set("t", "x", Arc::new(array![1.0, 2.0])).unwrap();

        // Corrupt the payload: existence still reports true, reading fails.
        store.kv.put("t", "x", b"\x01").unwrap();
        assert!(store.has("t", "x").unwrap());
        assert!(matches!(store.get("t", "x"), Err(Error::Serialization(_))));
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        {
            let factory =
                DescriptorElementFactory::new(Arc::new(RocksDbDescriptorStore::open(dir.path()).unwrap()));
            factory.create("t", "kept", array![0.5, 0.5]).unwrap();
        }
        let factory =
            DescriptorElementFactory::new(Arc::new(RocksDbDescriptorStore::open(dir.path()).unwrap()));
        let element = factory.get("t", "kept").unwrap();
        assert_eq!(*element.vector().unwrap(), array![0.5, 0.5]);
    }

    #[test]
    fn test_keys_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksDbDescriptorStore::open(dir.path()).unwrap();
        store.set("a/b", "c", Arc::new(array![1.0])).unwrap();
        assert!(!store.has("a", "b/c").unwrap());
    }

    #[test]
    fn test_classification_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksDbClassificationStore::open(dir.path()).unwrap();
        let result: Classification = [("positive".to_string(), 0.75), ("negative".to_string(), 0.25)]
            .into_iter()
            .collect();
        store.set("iqr", "a", result.clone()).unwrap();
        assert_eq!(store.get("iqr", "a").unwrap(), result);
        assert!(store.has("iqr", "a").unwrap());
        assert_eq!(store.len().unwrap(), 1);

        store.kv.put("iqr", "a", b"{not json").unwrap();
        assert!(store.has("iqr", "a").unwrap());
        assert!(store.get("iqr", "a").is_err());

        assert!(store.remove("iqr", "a").unwrap());
        assert!(matches!(store.get("iqr", "a"), Err(Error::NotFound { .. })));
    }
}
