//! Classification results keyed by `(type_label, uuid)`.
//!
//! Same contract as the descriptor stores. IQR sessions can write each
//! refine's scores here so a surrounding service can read them back per
//! element.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::error::{Error, Result};

/// Label → confidence.
pub type Classification = BTreeMap<String, f64>;

pub trait ClassificationStore: Send + Sync + fmt::Debug {
    /// Fails with [`Error::NotFound`] when nothing is stored under the key.
    fn get(&self, type_label: &str, uuid: &str) -> Result<Classification>;

    fn set(&self, type_label: &str, uuid: &str, classification: Classification) -> Result<()>;

    fn has(&self, type_label: &str, uuid: &str) -> Result<bool>;

    fn remove(&self, type_label: &str, uuid: &str) -> Result<bool>;
}

/// Default, process-local [`ClassificationStore`].
#[derive(Debug, Default)]
pub struct MemoryClassificationStore {
    results: RwLock<HashMap<String, HashMap<String, Classification>>>,
}

impl MemoryClassificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.results.read().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ClassificationStore for MemoryClassificationStore {
    fn get(&self, type_label: &str, uuid: &str) -> Result<Classification> {
        self.results
            .read()
            .get(type_label)
            .and_then(|by_uuid| by_uuid.get(uuid))
            .cloned()
            .ok_or_else(|| Error::not_found(type_label, uuid))
    }

    fn set(&self, type_label: &str, uuid: &str, classification: Classification) -> Result<()> {
        self.results
            .write()
            .entry(type_label.to_string())
            .or_default()
            .insert(uuid.to_string(), classification);
        Ok(())
    }

    fn has(&self, type_label: &str, uuid: &str) -> Result<bool> {
        Ok(self
            .results
            .read()
            .get(type_label)
            .is_some_and(|by_uuid| by_uuid.contains_key(uuid)))
    }

    fn remove(&self, type_label: &str, uuid: &str) -> Result<bool> {
        Ok(self
            .results
            .write()
            .get_mut(type_label)
            .is_some_and(|by_uuid| by_uuid.remove(uuid).is_some()))
    }
}

#[cfg(feature = "persistence")]
pub use file::FileClassificationStore;

#[cfg(feature = "persistence")]
mod file {
    use std::path::{Path, PathBuf};

    use super::{Classification, ClassificationStore};
    use crate::error::{Error, Result};
    use crate::persistence::{atomic_write, escape_key};

    /// One JSON file per element under `<root>/<type_label>/<uuid>.json`.
    #[derive(Debug, Clone)]
    pub struct FileClassificationStore {
        root: PathBuf,
    }

    impl FileClassificationStore {
        pub fn open(root: impl AsRef<Path>) -> Result<Self> {
            let root = root.as_ref().to_path_buf();
            std::fs::create_dir_all(&root)?;
            Ok(Self { root })
        }

        fn path(&self, type_label: &str, uuid: &str) -> PathBuf {
            self.root
                .join(escape_key(type_label))
                .join(format!("{}.json", escape_key(uuid)))
        }
    }

    impl ClassificationStore for FileClassificationStore {
        fn get(&self, type_label: &str, uuid: &str) -> Result<Classification> {
            let data = match std::fs::read(self.path(type_label, uuid)) {
                Ok(data) => data,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(Error::not_found(type_label, uuid))
                }
                Err(e) => return Err(e.into()),
            };
            serde_json::from_slice(&data).map_err(|e| Error::Serialization(e.to_string()))
        }

        fn set(&self, type_label: &str, uuid: &str, classification: Classification) -> Result<()> {
            let data = serde_json::to_vec(&classification)
                .map_err(|e| Error::Serialization(e.to_string()))?;
            atomic_write(&self.path(type_label, uuid), &data)
        }

        fn has(&self, type_label: &str, uuid: &str) -> Result<bool> {
            Ok(self.path(type_label, uuid).is_file())
        }

        fn remove(&self, type_label: &str, uuid: &str) -> Result<bool> {
            match std::fs::remove_file(self.path(type_label, uuid)) {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e.into()),
            }
        }
    }
}

/// Handle to the classification stored under `(type_label, uuid)`.
#[derive(Clone)]
pub struct ClassificationElement {
    type_label: Arc<str>,
    uuid: Arc<str>,
    store: Arc<dyn ClassificationStore>,
}

impl ClassificationElement {
    pub fn new(
        store: Arc<dyn ClassificationStore>,
        type_label: impl Into<Arc<str>>,
        uuid: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            type_label: type_label.into(),
            uuid: uuid.into(),
            store,
        }
    }

    pub fn type_label(&self) -> &str {
        &self.type_label
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// The stored result, or [`Error::NotComputed`] if none has been set.
    pub fn classification(&self) -> Result<Classification> {
        match self.store.get(&self.type_label, &self.uuid) {
            Err(Error::NotFound { .. }) => Err(Error::NotComputed {
                type_label: self.type_label.to_string(),
                uuid: self.uuid.to_string(),
            }),
            other => other,
        }
    }

    /// Store a result. Empty maps and non-finite confidences are rejected.
    pub fn set_classification(&self, classification: Classification) -> Result<()> {
        if classification.is_empty() {
            return Err(Error::InvalidState(format!(
                "refusing to store an empty classification for {}/{}",
                self.type_label, self.uuid
            )));
        }
        if let Some((label, value)) = classification.iter().find(|(_, v)| !v.is_finite()) {
            return Err(Error::InvalidState(format!(
                "label {label} has non-finite confidence {value}"
            )));
        }
        self.store.set(&self.type_label, &self.uuid, classification)
    }

    pub fn has_classification(&self) -> Result<bool> {
        self.store.has(&self.type_label, &self.uuid)
    }

    /// Label with the highest confidence; ties go to the lexically first label.
    pub fn max_label(&self) -> Result<(String, f64)> {
        let classification = self.classification()?;
        let mut best: Option<(String, f64)> = None;
        for (label, value) in classification {
            if best.as_ref().map_or(true, |(_, b)| value > *b) {
                best = Some((label, value));
            }
        }
        best.ok_or_else(|| Error::NotComputed {
            type_label: self.type_label.to_string(),
            uuid: self.uuid.to_string(),
        })
    }
}

impl fmt::Debug for ClassificationElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassificationElement")
            .field("type_label", &self.type_label)
            .field("uuid", &self.uuid)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores(pairs: &[(&str, f64)]) -> Classification {
        pairs.iter().map(|(l, v)| (l.to_string(), *v)).collect()
    }

    #[test]
    fn test_memory_round_trip() {
        let store: Arc<dyn ClassificationStore> = Arc::new(MemoryClassificationStore::new());
        let c = ClassificationElement::new(store.clone(), "iqr", "img1");
        assert!(!c.has_classification().unwrap());
        assert!(matches!(c.classification(), Err(Error::NotComputed { .. })));

        c.set_classification(scores(&[("positive", 0.8), ("negative", 0.2)]))
            .unwrap();
        assert!(c.has_classification().unwrap());
        assert_eq!(c.max_label().unwrap(), ("positive".to_string(), 0.8));
        assert!(store.remove("iqr", "img1").unwrap());
        assert!(!c.has_classification().unwrap());
    }

    #[test]
    fn test_max_label_tie_goes_to_first_label() {
        let store = Arc::new(MemoryClassificationStore::new());
        let c = ClassificationElement::new(store, "iqr", "x");
        c.set_classification(scores(&[("b", 0.5), ("a", 0.5)])).unwrap();
        assert_eq!(c.max_label().unwrap().0, "a");
    }

    #[test]
    fn test_rejects_bad_results() {
        let store = Arc::new(MemoryClassificationStore::new());
        let c = ClassificationElement::new(store, "iqr", "x");
        assert!(c.set_classification(Classification::new()).is_err());
        assert!(c.set_classification(scores(&[("a", f64::NAN)])).is_err());
    }

    #[cfg(feature = "persistence")]
    #[test]
    fn test_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileClassificationStore::open(dir.path()).unwrap());
        let c = ClassificationElement::new(store.clone(), "iqr", "a/b");
        c.set_classification(scores(&[("positive", 0.25)])).unwrap();
        assert!(store.has("iqr", "a/b").unwrap());
        assert_eq!(c.classification().unwrap(), scores(&[("positive", 0.25)]));
        assert!(matches!(store.get("iqr", "zzz"), Err(Error::NotFound { .. })));
    }
}
