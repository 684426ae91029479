//! Descriptor elements: typed handles to feature vectors kept in a pluggable
//! [`DescriptorStore`].
//!
//! Elements never cache their vector. Every [`DescriptorElement::vector`] call
//! goes to the store, so a `set_vector` through any handle is visible to all
//! others immediately.

use std::fmt;
use std::sync::Arc;

use hashbrown::HashMap;
use ndarray::Array1;
use parking_lot::RwLock;

use crate::error::{Error, Result};

/// A descriptor vector. Shared immutably once stored.
pub type Vector = Array1<f32>;

/// Key-value storage for descriptor vectors, keyed by `(type_label, uuid)`.
///
/// One uuid maps to at most one vector per type label; `set` replaces.
pub trait DescriptorStore: Send + Sync + fmt::Debug {
    /// Fails with [`Error::NotFound`] when nothing is stored under the key.
    fn get(&self, type_label: &str, uuid: &str) -> Result<Arc<Vector>>;

    fn set(&self, type_label: &str, uuid: &str, vector: Arc<Vector>) -> Result<()>;

    /// Existence check. Must not deserialize the stored vector.
    fn has(&self, type_label: &str, uuid: &str) -> Result<bool>;

    /// Returns whether anything was removed.
    fn remove(&self, type_label: &str, uuid: &str) -> Result<bool>;
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// Process-local [`DescriptorStore`].
#[derive(Debug, Default)]
pub struct MemoryDescriptorStore {
    vectors: RwLock<HashMap<String, HashMap<String, Arc<Vector>>>>,
}

impl MemoryDescriptorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored vectors across all type labels.
    pub fn len(&self) -> usize {
        self.vectors.read().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DescriptorStore for MemoryDescriptorStore {
    fn get(&self, type_label: &str, uuid: &str) -> Result<Arc<Vector>> {
        self.vectors
            .read()
            .get(type_label)
            .and_then(|by_uuid| by_uuid.get(uuid))
            .cloned()
            .ok_or_else(|| Error::not_found(type_label, uuid))
    }

    fn set(&self, type_label: &str, uuid: &str, vector: Arc<Vector>) -> Result<()> {
        self.vectors
            .write()
            .entry(type_label.to_string())
            .or_default()
            .insert(uuid.to_string(), vector);
        Ok(())
    }

    fn has(&self, type_label: &str, uuid: &str) -> Result<bool> {
        Ok(self
            .vectors
            .read()
            .get(type_label)
            .is_some_and(|by_uuid| by_uuid.contains_key(uuid)))
    }

    fn remove(&self, type_label: &str, uuid: &str) -> Result<bool> {
        let mut vectors = self.vectors.write();
        let removed = match vectors.get_mut(type_label) {
            Some(by_uuid) => by_uuid.remove(uuid).is_some(),
            None => false,
        };
        if vectors.get(type_label).is_some_and(HashMap::is_empty) {
            vectors.remove(type_label);
        }
        Ok(removed)
    }
}

// ---------------------------------------------------------------------------
// File backend
// ---------------------------------------------------------------------------

#[cfg(feature = "persistence")]
pub use file::FileDescriptorStore;

#[cfg(feature = "persistence")]
mod file {
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    use super::{DescriptorStore, Vector};
    use crate::error::{Error, Result};
    use crate::persistence::{atomic_write, escape_key};

    const VECTOR_EXTENSION: &str = "vec";

    /// One bincode file per descriptor under `<root>/<type_label>/<uuid>.vec`.
    ///
    /// `has` is a plain existence check on the path, so it stays cheap for
    /// large vectors. Writes go to a temporary file and are renamed into place.
    #[derive(Debug, Clone)]
    pub struct FileDescriptorStore {
        root: PathBuf,
    }

    impl FileDescriptorStore {
        /// Open (creating if needed) a store rooted at `root`.
        pub fn open(root: impl AsRef<Path>) -> Result<Self> {
            let root = root.as_ref().to_path_buf();
            std::fs::create_dir_all(&root)?;
            Ok(Self { root })
        }

        pub fn root(&self) -> &Path {
            &self.root
        }

        fn path(&self, type_label: &str, uuid: &str) -> PathBuf {
            self.root
                .join(escape_key(type_label))
                .join(format!("{}.{VECTOR_EXTENSION}", escape_key(uuid)))
        }
    }

    impl DescriptorStore for FileDescriptorStore {
        fn get(&self, type_label: &str, uuid: &str) -> Result<Arc<Vector>> {
            let bytes = match std::fs::read(self.path(type_label, uuid)) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(Error::not_found(type_label, uuid))
                }
                Err(e) => return Err(e.into()),
            };
            let values: Vec<f32> =
                bincode::deserialize(&bytes).map_err(|e| Error::Serialization(e.to_string()))?;
            Ok(Arc::new(Vector::from_vec(values)))
        }

        fn set(&self, type_label: &str, uuid: &str, vector: Arc<Vector>) -> Result<()> {
            let values: Vec<f32> = vector.iter().copied().collect();
            let bytes =
                bincode::serialize(&values).map_err(|e| Error::Serialization(e.to_string()))?;
            atomic_write(&self.path(type_label, uuid), &bytes)
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

// ---------------------------------------------------------------------------
// Elements
// ---------------------------------------------------------------------------

/// Handle to the vector stored under `(type_label, uuid)`.
///
/// Cloning a handle is cheap and both clones see the same stored vector.
#[derive(Clone)]
pub struct DescriptorElement {
    type_label: Arc<str>,
    uuid: Arc<str>,
    store: Arc<dyn DescriptorStore>,
}

impl DescriptorElement {
    pub fn new(
        store: Arc<dyn DescriptorStore>,
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

    /// The stored vector, or [`Error::NotComputed`] if none has been set.
    pub fn vector(&self) -> Result<Arc<Vector>> {
        match self.store.get(&self.type_label, &self.uuid) {
            Err(Error::NotFound { .. }) => Err(Error::NotComputed {
                type_label: self.type_label.to_string(),
                uuid: self.uuid.to_string(),
            }),
            other => other,
        }
    }

    pub fn set_vector(&self, vector: Vector) -> Result<()> {
        if vector.is_empty() {
            return Err(Error::InvalidState(format!(
                "refusing to store an empty vector for {}/{}",
                self.type_label, self.uuid
            )));
        }
        self.store
            .set(&self.type_label, &self.uuid, Arc::new(vector))
    }

    pub fn has_vector(&self) -> Result<bool> {
        self.store.has(&self.type_label, &self.uuid)
    }
}

impl PartialEq for DescriptorElement {
    fn eq(&self, other: &Self) -> bool {
        self.type_label == other.type_label && self.uuid == other.uuid
    }
}

impl Eq for DescriptorElement {}

impl fmt::Debug for DescriptorElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorElement")
            .field("type_label", &self.type_label)
            .field("uuid", &self.uuid)
            .finish()
    }
}

/// Creates [`DescriptorElement`]s bound to one store.
#[derive(Clone, Debug)]
pub struct DescriptorElementFactory {
    store: Arc<dyn DescriptorStore>,
}

impl DescriptorElementFactory {
    pub fn new(store: Arc<dyn DescriptorStore>) -> Self {
        Self { store }
    }

    /// A factory over a fresh [`MemoryDescriptorStore`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryDescriptorStore::new()))
    }

    pub fn store(&self) -> &Arc<dyn DescriptorStore> {
        &self.store
    }

    /// A handle for `(type_label, uuid)`. Nothing is read or written.
    pub fn new_descriptor(
        &self,
        type_label: impl Into<Arc<str>>,
        uuid: impl Into<Arc<str>>,
    ) -> DescriptorElement {
        DescriptorElement::new(Arc::clone(&self.store), type_label, uuid)
    }

    /// A handle for an existing descriptor; [`Error::NotFound`] if the store
    /// holds no vector for the key.
    pub fn get(&self, type_label: &str, uuid: &str) -> Result<DescriptorElement> {
        if !self.store.has(type_label, uuid)? {
            return Err(Error::not_found(type_label, uuid));
        }
        Ok(self.new_descriptor(type_label, uuid))
    }

    /// Create a handle and store `vector` under it in one step.
    pub fn create(&self, type_label: &str, uuid: &str, vector: Vector) -> Result<DescriptorElement> {
        let element = self.new_descriptor(type_label, uuid);
        element.set_vector(vector)?;
        Ok(element)
    }
}
