//! # lsh_iqr
//!
//! Approximate nearest-neighbour search over descriptor vectors using
//! locality-sensitive hashing, plus interactive query refinement (IQR)
//! sessions that re-rank results from user relevance feedback.
//!
//! Descriptors are hashed to short bit codes, the unique codes are kept in a
//! ball tree searched by Hamming distance, and the candidates gathered from
//! the nearest codes are re-ranked by exact angular distance.
//!
//! ## Quick start
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use lsh_iqr::{
//!     DescriptorElementFactory, HyperplaneFunctor, IqrSessionManager, KernelRanker,
//!     LshNearestNeighborsIndex, ManagerConfig, RefineBudget,
//! };
//! use ndarray::array;
//! use rand::rngs::StdRng;
//! use rand::SeedableRng;
//!
//! let factory = DescriptorElementFactory::in_memory();
//! let functor = HyperplaneFunctor::random(3, 8, &mut StdRng::seed_from_u64(42)).unwrap();
//! let index = Arc::new(
//!     LshNearestNeighborsIndex::builder()
//!         .functor(Arc::new(functor))
//!         .build()
//!         .unwrap(),
//! );
//!
//! let elements = vec![
//!     factory.create("img", "cat", array![1.0, 0.1, 0.0]).unwrap(),
//!     factory.create("img", "lynx", array![0.9, 0.2, 0.0]).unwrap(),
//!     factory.create("img", "car", array![0.0, 0.1, 1.0]).unwrap(),
//! ];
//! index.build_index(elements).unwrap();
//!
//! let hits = index.nn(array![1.0, 0.0, 0.0].view(), 2).unwrap();
//! assert_eq!(hits[0].uuid, "cat");
//!
//! let manager = IqrSessionManager::new(ManagerConfig::default()).unwrap();
//! let session = manager
//!     .create_session(Arc::clone(&index), Arc::new(KernelRanker::default()))
//!     .unwrap();
//! let query = factory.create("query", "q1", array![1.0, 0.0, 0.0]).unwrap();
//! session.initialize(&query, 2).unwrap();
//! session.add_negative("car").unwrap();
//! let ranking = session.refine(&RefineBudget::unlimited()).unwrap();
//! assert_eq!(ranking.last().unwrap().uuid, "car");
//! ```
//!
//! ## Feature flags
//!
//! | Flag          | Effect                                                   |
//! |---------------|----------------------------------------------------------|
//! | `persistence` | File-backed stores, hash map artifacts, JSON config (default) |
//! | `parallel`    | Parallel hashing, batch queries and ranking via rayon     |
//! | `rocksdb`     | RocksDB descriptor and classification stores              |
//! | `full`        | Enables `parallel` + `persistence`                        |

pub mod classification;
pub mod clock;
pub mod config;
pub mod descriptor;
pub mod distance;
pub mod error;
pub mod hash;
pub mod hash_index;
pub mod index;
pub mod manager;
pub mod metrics;
pub mod ranker;
pub mod session;

#[cfg(feature = "persistence")]
pub mod persistence;
#[cfg(feature = "rocksdb")]
pub mod rocksdb_store;

// Re-exports for convenience.
pub use classification::{
    Classification, ClassificationElement, ClassificationStore, MemoryClassificationStore,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{IqrConfig, StoreBackend};
pub use descriptor::{
    DescriptorElement, DescriptorElementFactory, DescriptorStore, MemoryDescriptorStore, Vector,
};
pub use distance::{angular_distance, cosine_similarity, CosineSimilarity, Distance};
pub use error::{Error, Result};
pub use hash::{HashCode, HyperplaneFunctor, LshFunctor};
pub use hash_index::{
    BallTreeHashIndex, BallTreeParams, HashIndex, HashIndexKind, LinearHashIndex,
};
pub use index::{
    IndexStats, LshNearestNeighborsIndex, LshNearestNeighborsIndexBuilder, Neighbor, NnIndexConfig,
};
pub use manager::{IqrSessionManager, ManagerConfig, ReaperHandle};
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use ranker::{CancelToken, Kernel, KernelRanker, RefineBudget, RelevanceRanker};
pub use session::{IqrSession, RankedId, SessionConfig, SessionState};

#[cfg(feature = "persistence")]
pub use classification::FileClassificationStore;
#[cfg(feature = "persistence")]
pub use descriptor::FileDescriptorStore;
#[cfg(feature = "persistence")]
pub use persistence::HashToIds;
#[cfg(feature = "rocksdb")]
pub use rocksdb_store::{RocksDbClassificationStore, RocksDbDescriptorStore};
