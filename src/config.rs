//! Top-level configuration: index settings, ranker, session manager and
//! storage backend selection.
//!
//! ```json
//! {
//!   "index": { "hash_index": { "kind": "ball_tree", "leaf_size": 40 }, "overfetch_factor": 8 },
//!   "ranker": { "kernel": "histogram_intersection", "gain": 8.0 },
//!   "manager": {
//!     "expiration_enabled": true,
//!     "reap_interval_seconds": 30,
//!     "session": { "ttl_seconds": 1800, "pool_size": 200 }
//!   },
//!   "descriptor_store": { "kind": "file", "root": "/var/lib/iqr/descriptors" },
//!   "classification_store": { "kind": "memory" },
//!   "result_label": "iqr"
//! }
//! ```
//!
//! Every field is optional; missing ones take their defaults. Loading from
//! JSON requires the `persistence` feature.

use std::path::PathBuf;
use std::sync::Arc;

use crate::classification::{ClassificationStore, MemoryClassificationStore};
use crate::descriptor::{DescriptorElementFactory, DescriptorStore, MemoryDescriptorStore};
use crate::error::{Error, Result};
use crate::hash::LshFunctor;
use crate::index::{LshNearestNeighborsIndex, NnIndexConfig};
use crate::manager::{IqrSessionManager, ManagerConfig};
use crate::ranker::KernelRanker;

/// Where descriptors or classification results are kept.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "persistence",
    derive(serde::Serialize, serde::Deserialize),
    serde(tag = "kind", rename_all = "snake_case")
)]
pub enum StoreBackend {
    /// Process-local maps.
    #[default]
    Memory,
    /// One file per element under `root`. Needs the `persistence` feature.
    File { root: PathBuf },
    /// A RocksDB database at `path`. Needs the `rocksdb` feature.
    #[cfg_attr(feature = "persistence", serde(rename = "rocksdb"))]
    RocksDb { path: PathBuf },
}

impl StoreBackend {
    #[cfg(not(feature = "persistence"))]
    fn file_backend_unavailable(root: &std::path::Path) -> Error {
        Error::InvalidConfig(format!(
            "file store at {} requires the `persistence` feature",
            root.display()
        ))
    }

    #[cfg(not(feature = "rocksdb"))]
    fn rocksdb_backend_unavailable(path: &std::path::Path) -> Error {
        Error::InvalidConfig(format!(
            "rocksdb store at {} requires the `rocksdb` feature",
            path.display()
        ))
    }

    pub fn descriptor_store(&self) -> Result<Arc<dyn DescriptorStore>> {
        match self {
            StoreBackend::Memory => Ok(Arc::new(MemoryDescriptorStore::new())),
            #[cfg(feature = "persistence")]
            StoreBackend::File { root } => {
                Ok(Arc::new(crate::descriptor::FileDescriptorStore::open(root)?))
            }
            #[cfg(not(feature = "persistence"))]
            StoreBackend::File { root } => Err(Self::file_backend_unavailable(root)),
            #[cfg(feature = "rocksdb")]
            StoreBackend::RocksDb { path } => Ok(Arc::new(
                crate::rocksdb_store::RocksDbDescriptorStore::open(path)?,
            )),
            #[cfg(not(feature = "rocksdb"))]
            StoreBackend::RocksDb { path } => Err(Self::rocksdb_backend_unavailable(path)),
        }
    }

    pub fn classification_store(&self) -> Result<Arc<dyn ClassificationStore>> {
        match self {
            StoreBackend::Memory => Ok(Arc::new(MemoryClassificationStore::new())),
            #[cfg(feature = "persistence")]
            StoreBackend::File { root } => Ok(Arc::new(
                crate::classification::FileClassificationStore::open(root)?,
            )),
            #[cfg(not(feature = "persistence"))]
            StoreBackend::File { root } => Err(Self::file_backend_unavailable(root)),
            #[cfg(feature = "rocksdb")]
            StoreBackend::RocksDb { path } => Ok(Arc::new(
                crate::rocksdb_store::RocksDbClassificationStore::open(path)?,
            )),
            #[cfg(not(feature = "rocksdb"))]
            StoreBackend::RocksDb { path } => Err(Self::rocksdb_backend_unavailable(path)),
        }
    }
}

/// Everything needed to stand up the index and session layer.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(
    feature = "persistence",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct IqrConfig {
    pub index: NnIndexConfig,
    pub ranker: KernelRanker,
    pub manager: ManagerConfig,
    pub descriptor_store: StoreBackend,
    pub classification_store: StoreBackend,
    /// When set, sessions write each refine's scores to the classification
    /// store under this type label.
    pub result_label: Option<String>,
}

impl IqrConfig {
    pub fn validate(&self) -> Result<()> {
        self.index.validate()?;
        self.ranker.validate()?;
        self.manager.validate()?;
        if self.result_label.as_deref() == Some("") {
            return Err(Error::InvalidConfig("result_label must not be empty".into()));
        }
        // RocksDB holds an exclusive lock on its directory.
        if let (StoreBackend::RocksDb { path: a }, StoreBackend::RocksDb { path: b }) =
            (&self.descriptor_store, &self.classification_store)
        {
            if a == b {
                return Err(Error::InvalidConfig(format!(
                    "descriptor and classification stores share rocksdb path {}",
                    a.display()
                )));
            }
        }
        Ok(())
    }

    /// Open the configured descriptor store and wrap it in a factory.
    pub fn descriptor_factory(&self) -> Result<DescriptorElementFactory> {
        Ok(DescriptorElementFactory::new(
            self.descriptor_store.descriptor_store()?,
        ))
    }

    /// An empty nearest-neighbour index over `functor` with the configured
    /// settings.
    pub fn nn_index(&self, functor: Arc<dyn LshFunctor>) -> Result<LshNearestNeighborsIndex> {
        LshNearestNeighborsIndex::builder()
            .functor(functor)
            .config(self.index.clone())
            .build()
    }

    /// A session manager with the configured classification write-back.
    pub fn session_manager(&self) -> Result<IqrSessionManager> {
        let manager = IqrSessionManager::new(self.manager.clone())?;
        Ok(match &self.result_label {
            Some(label) => {
                let store = self.classification_store.classification_store()?;
                manager.with_classification_store(store, label.clone())
            }
            None => manager,
        })
    }
}

#[cfg(feature = "persistence")]
impl IqrConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::InvalidConfig(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_json_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidConfig(format!("failed to read config {}: {e}", path.display()))
        })?;
        Self::from_json_str(&contents)
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }
}
