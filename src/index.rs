use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use hashbrown::HashMap;
use ndarray::ArrayView1;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::descriptor::DescriptorElement;
use crate::distance::{angular_distance, Distance};
use crate::error::{Error, Result};
use crate::hash::{HashCode, LshFunctor};
use crate::hash_index::{HashIndex, HashIndexKind};
use crate::metrics::{MetricsCollector, MetricsSnapshot, QueryTimer};

/// Namespace reported in [`Error::NotFound`] for ids missing from the index.
pub const INDEX_NAMESPACE: &str = "lsh-index";

/// Configuration for the nearest-neighbour index.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "persistence",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct NnIndexConfig {
    /// Structure used to search hash codes.
    pub hash_index: HashIndexKind,
    /// A query for `n` neighbours gathers codes, nearest first, until at least
    /// `n * overfetch_factor` candidate ids are collected (or the index is
    /// exhausted) before exact re-ranking.
    pub overfetch_factor: usize,
}

impl Default for NnIndexConfig {
    fn default() -> Self {
        Self {
            hash_index: HashIndexKind::default(),
            overfetch_factor: 8,
        }
    }
}

impl NnIndexConfig {
    pub fn validate(&self) -> Result<()> {
        if self.overfetch_factor == 0 {
            return Err(Error::InvalidConfig("overfetch_factor must be > 0".into()));
        }
        if let HashIndexKind::BallTree { leaf_size: 0 } = self.hash_index {
            return Err(Error::InvalidConfig("leaf_size must be > 0".into()));
        }
        Ok(())
    }
}

/// A single nearest-neighbour result.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub uuid: String,
    /// Angular distance from the query.
    pub distance: Distance,
}

/// Aggregate statistics about the index.
#[derive(Debug, Clone)]
pub struct IndexStats {
    pub num_ids: usize,
    pub num_codes: usize,
    pub bit_length: usize,
    pub dimension: usize,
    pub avg_bucket_size: f64,
    pub max_bucket_size: usize,
}

impl std::fmt::Display for IndexStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "LshNearestNeighborsIndex {{ ids: {}, codes: {}, bits: {}, dim: {}, \
             avg_bucket: {:.1}, max_bucket: {} }}",
            self.num_ids,
            self.num_codes,
            self.bit_length,
            self.dimension,
            self.avg_bucket_size,
            self.max_bucket_size,
        )
    }
}

// ---------------------------------------------------------------------------
// Inner state (behind RwLock)
// ---------------------------------------------------------------------------

pub(crate) struct IndexInner {
    pub(crate) built: bool,
    /// Partitions every indexed id: each id sits under exactly one code.
    pub(crate) hash2uuids: BTreeMap<HashCode, BTreeSet<String>>,
    pub(crate) uuid2hash: HashMap<String, HashCode>,
    pub(crate) descriptors: HashMap<String, DescriptorElement>,
    pub(crate) hash_index: Box<dyn HashIndex>,
}

impl IndexInner {
    pub(crate) fn empty(kind: &HashIndexKind) -> Result<Self> {
        Ok(Self {
            built: false,
            hash2uuids: BTreeMap::new(),
            uuid2hash: HashMap::new(),
            descriptors: HashMap::new(),
            hash_index: kind.create()?,
        })
    }

    /// Move `uuid` under `code`. Returns the code it left if that code lost
    /// its last member, and whether `code` gained its first member.
    fn assign(&mut self, element: DescriptorElement, code: HashCode) -> (Option<HashCode>, bool) {
        let uuid = element.uuid().to_string();
        let mut emptied = None;
        if let Some(old) = self.uuid2hash.get(&uuid) {
            if *old != code {
                let old = old.clone();
                if let Some(bucket) = self.hash2uuids.get_mut(&old) {
                    bucket.remove(&uuid);
                    if bucket.is_empty() {
                        self.hash2uuids.remove(&old);
                        emptied = Some(old);
                    }
                }
            }
        }
        let bucket = self.hash2uuids.entry(code.clone()).or_default();
        let fresh = bucket.is_empty();
        bucket.insert(uuid.clone());
        self.uuid2hash.insert(uuid.clone(), code);
        self.descriptors.insert(uuid, element);
        (emptied, fresh)
    }

    /// Bring the hash index in line with `hash2uuids` for the touched codes.
    fn sync_codes(&mut self, emptied: Vec<HashCode>, added: Vec<HashCode>) -> Result<()> {
        let to_remove: Vec<HashCode> = emptied
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter(|c| !self.hash2uuids.contains_key(c) && self.hash_index.contains(c))
            .collect();
        let to_add: Vec<HashCode> = added
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter(|c| self.hash2uuids.contains_key(c) && !self.hash_index.contains(c))
            .collect();
        if !to_remove.is_empty() {
            self.hash_index.remove(&to_remove)?;
        }
        if !to_add.is_empty() {
            self.hash_index.update(&to_add)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// LshNearestNeighborsIndex
// ---------------------------------------------------------------------------

/// Approximate nearest-neighbour index: LSH codes narrow the search, exact
/// angular distance ranks the result.
///
/// Thread-safe: concurrent `nn` queries proceed in parallel; build, update,
/// remove and reset acquire exclusive access via `parking_lot::RwLock`, and
/// each appears atomic to readers. Descriptors are hashed before the write
/// lock is taken.
pub struct LshNearestNeighborsIndex {
    pub(crate) inner: RwLock<IndexInner>,
    pub(crate) functor: Arc<dyn LshFunctor>,
    pub(crate) config: NnIndexConfig,
    pub(crate) metrics: Option<Arc<MetricsCollector>>,
}

impl std::fmt::Debug for LshNearestNeighborsIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("LshNearestNeighborsIndex")
            .field("built", &inner.built)
            .field("num_ids", &inner.uuid2hash.len())
            .field("num_codes", &inner.hash2uuids.len())
            .field("functor", &self.functor)
            .field("config", &self.config)
            .field("has_metrics", &self.metrics.is_some())
            .finish()
    }
}

impl LshNearestNeighborsIndex {
    /// Start building an index with the builder pattern.
    pub fn builder() -> LshNearestNeighborsIndexBuilder {
        LshNearestNeighborsIndexBuilder::new()
    }

    pub fn new(functor: Arc<dyn LshFunctor>, config: NnIndexConfig) -> Result<Self> {
        Self::new_with_metrics(functor, config, false)
    }

    fn new_with_metrics(
        functor: Arc<dyn LshFunctor>,
        config: NnIndexConfig,
        enable_metrics: bool,
    ) -> Result<Self> {
        config.validate()?;
        if functor.dim() == 0 || functor.bit_length() == 0 {
            return Err(Error::InvalidConfig(
                "functor must have non-zero dimension and bit length".into(),
            ));
        }
        let inner = IndexInner::empty(&config.hash_index)?;
        let metrics = enable_metrics.then(|| Arc::new(MetricsCollector::new()));
        Ok(Self {
            inner: RwLock::new(inner),
            functor,
            config,
            metrics,
        })
    }

    // ------------------------------------------------------------------
    // Hashing
    // ------------------------------------------------------------------

    fn hash_element(&self, element: &DescriptorElement) -> Result<HashCode> {
        let vector = element.vector()?;
        self.functor.hash(vector.view())
    }

    #[cfg(not(feature = "parallel"))]
    fn prepare(&self, elements: Vec<DescriptorElement>) -> Result<Vec<(DescriptorElement, HashCode)>> {
        elements
            .into_iter()
            .map(|e| {
                let code = self.hash_element(&e)?;
                Ok((e, code))
            })
            .collect()
    }

    #[cfg(feature = "parallel")]
    fn prepare(&self, elements: Vec<DescriptorElement>) -> Result<Vec<(DescriptorElement, HashCode)>> {
        use rayon::prelude::*;

        elements
            .into_par_iter()
            .map(|e| {
                let code = self.hash_element(&e)?;
                Ok((e, code))
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Build / update / remove
    // ------------------------------------------------------------------

    /// Index `elements` from scratch.
    ///
    /// Fails with [`Error::InvalidState`] if the index is already built; call
    /// [`reset`](Self::reset) first, or grow it with
    /// [`update_index`](Self::update_index). An empty batch builds an empty,
    /// queryable index.
    pub fn build_index<I>(&self, elements: I) -> Result<()>
    where
        I: IntoIterator<Item = DescriptorElement>,
    {
        if self.inner.read().built {
            return Err(Error::InvalidState(
                "index is already built; reset it or use update_index".into(),
            ));
        }
        let prepared = self.prepare(elements.into_iter().collect())?;
        let count = prepared.len();

        let mut staged = IndexInner::empty(&self.config.hash_index)?;
        for (element, code) in prepared {
            staged.assign(element, code);
        }
        let codes: Vec<HashCode> = staged.hash2uuids.keys().cloned().collect();
        staged.hash_index.build(&codes)?;
        staged.built = true;

        let mut inner = self.inner.write();
        if inner.built {
            return Err(Error::InvalidState(
                "index was built concurrently; reset it or use update_index".into(),
            ));
        }
        *inner = staged;

        if let Some(ref m) = self.metrics {
            m.record_indexed(count as u64);
        }
        info!(
            elements = count,
            ids = inner.uuid2hash.len(),
            codes = inner.hash2uuids.len(),
            "built LSH index"
        );
        Ok(())
    }

    /// Add or re-index `elements`.
    ///
    /// An id already present is re-hashed and moved to its new code. Calling
    /// this on an unbuilt index builds it.
    pub fn update_index<I>(&self, elements: I) -> Result<()>
    where
        I: IntoIterator<Item = DescriptorElement>,
    {
        let prepared = self.prepare(elements.into_iter().collect())?;
        let count = prepared.len();

        let mut inner = self.inner.write();
        let mut emptied = Vec::new();
        let mut added = Vec::new();
        for (element, code) in prepared {
            let (left, fresh) = inner.assign(element, code.clone());
            emptied.extend(left);
            if fresh {
                added.push(code);
            }
        }
        inner.sync_codes(emptied, added)?;
        inner.built = true;

        if let Some(ref m) = self.metrics {
            m.record_indexed(count as u64);
        }
        debug!(
            elements = count,
            ids = inner.uuid2hash.len(),
            codes = inner.hash2uuids.len(),
            "updated LSH index"
        );
        Ok(())
    }

    /// Remove ids from the index. All-or-nothing: an unknown id fails with
    /// [`Error::NotFound`] and nothing is removed.
    pub fn remove_from_index<S: AsRef<str>>(&self, uuids: &[S]) -> Result<()> {
        let mut inner = self.inner.write();
        if let Some(missing) = uuids
            .iter()
            .find(|u| !inner.uuid2hash.contains_key(u.as_ref()))
        {
            return Err(Error::not_found(INDEX_NAMESPACE, missing.as_ref()));
        }

        let mut emptied = Vec::new();
        let mut removed = 0u64;
        for uuid in uuids {
            let uuid = uuid.as_ref();
            let Some(code) = inner.uuid2hash.remove(uuid) else {
                continue;
            };
            inner.descriptors.remove(uuid);
            if let Some(bucket) = inner.hash2uuids.get_mut(&code) {
                bucket.remove(uuid);
                if bucket.is_empty() {
                    inner.hash2uuids.remove(&code);
                    emptied.push(code);
                }
            }
            removed += 1;
        }
        inner.sync_codes(emptied, Vec::new())?;

        if let Some(ref m) = self.metrics {
            m.record_removed(removed);
        }
        debug!(removed, ids = inner.uuid2hash.len(), "removed ids from LSH index");
        Ok(())
    }

    /// Drop everything, returning the index to its unbuilt state. The functor
    /// and configuration are kept.
    pub fn reset(&self) -> Result<()> {
        let fresh = IndexInner::empty(&self.config.hash_index)?;
        *self.inner.write() = fresh;
        info!("reset LSH index");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Query
    // ------------------------------------------------------------------

    /// The `n` indexed descriptors nearest to `query` by angular distance.
    ///
    /// Results are sorted by ascending distance, ties broken by uuid. Fewer
    /// than `n` results come back only when fewer than `n` ids are indexed.
    pub fn nn(&self, query: ArrayView1<f32>, n: usize) -> Result<Vec<Neighbor>> {
        let timer = self.metrics.as_ref().map(|_| QueryTimer::new());
        let code = self.functor.hash(query)?;
        let inner = self.inner.read();

        let total_ids = inner.uuid2hash.len();
        let num_codes = inner.hash2uuids.len();
        if n == 0 || total_ids == 0 {
            self.record_query(timer, 0, 0, n > 0);
            return Ok(Vec::new());
        }

        // Widen the code neighbourhood until it holds enough candidates.
        let target = n.saturating_mul(self.config.overfetch_factor).min(total_ids);
        let mut k = n.min(num_codes);
        let codes = loop {
            let near = inner.hash_index.nearest(&code, k);
            let members: usize = near
                .iter()
                .map(|(c, _)| inner.hash2uuids.get(c).map_or(0, BTreeSet::len))
                .sum();
            if members >= target || near.len() < k || k >= num_codes {
                break near;
            }
            k = k.saturating_mul(2).min(num_codes);
        };

        let mut neighbors = Vec::new();
        for (c, _) in &codes {
            let Some(bucket) = inner.hash2uuids.get(c) else {
                continue;
            };
            for uuid in bucket {
                let element = inner.descriptors.get(uuid).ok_or_else(|| {
                    Error::InvalidState(format!("indexed id {uuid} has no descriptor handle"))
                })?;
                let vector = element.vector()?;
                if vector.len() != query.len() {
                    return Err(Error::DimensionMismatch {
                        expected: query.len(),
                        got: vector.len(),
                    });
                }
                neighbors.push(Neighbor {
                    uuid: uuid.clone(),
                    distance: angular_distance(&query, &vector.view()),
                });
            }
        }
        let candidates = neighbors.len();

        neighbors.sort_by(|a, b| {
            a.distance
                .cmp(&b.distance)
                .then_with(|| a.uuid.cmp(&b.uuid))
        });
        neighbors.truncate(n);

        let partial = neighbors.len() < n;
        if partial {
            debug!(
                requested = n,
                returned = neighbors.len(),
                "fewer ids indexed than requested"
            );
        }
        self.record_query(timer, codes.len() as u64, candidates as u64, partial);
        Ok(neighbors)
    }

    /// [`nn`](Self::nn) using a descriptor's stored vector as the query.
    pub fn nn_element(&self, query: &DescriptorElement, n: usize) -> Result<Vec<Neighbor>> {
        let vector = query.vector()?;
        self.nn(vector.view(), n)
    }

    fn record_query(&self, timer: Option<QueryTimer>, codes: u64, candidates: u64, partial: bool) {
        if let (Some(m), Some(t)) = (self.metrics.as_ref(), timer) {
            m.record_query(codes, candidates, t.elapsed_ns(), partial);
        }
    }

    // ------------------------------------------------------------------
    // Lookup / stats
    // ------------------------------------------------------------------

    /// Number of indexed ids.
    pub fn count(&self) -> usize {
        self.inner.read().uuid2hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn is_built(&self) -> bool {
        self.inner.read().built
    }

    pub fn contains(&self, uuid: &str) -> bool {
        self.inner.read().uuid2hash.contains_key(uuid)
    }

    /// Handle of an indexed descriptor.
    pub fn descriptor(&self, uuid: &str) -> Result<DescriptorElement> {
        self.inner
            .read()
            .descriptors
            .get(uuid)
            .cloned()
            .ok_or_else(|| Error::not_found(INDEX_NAMESPACE, uuid))
    }

    /// The code an indexed id is filed under.
    pub fn hash_code(&self, uuid: &str) -> Option<HashCode> {
        self.inner.read().uuid2hash.get(uuid).cloned()
    }

    /// All indexed ids in sorted order.
    pub fn uuids(&self) -> Vec<String> {
        let inner = self.inner.read();
        let mut ids: Vec<String> = inner.uuid2hash.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn functor(&self) -> &Arc<dyn LshFunctor> {
        &self.functor
    }

    pub fn config(&self) -> &NnIndexConfig {
        &self.config
    }

    pub fn stats(&self) -> IndexStats {
        let inner = self.inner.read();
        let num_codes = inner.hash2uuids.len();
        let num_ids = inner.uuid2hash.len();
        IndexStats {
            num_ids,
            num_codes,
            bit_length: self.functor.bit_length(),
            dimension: self.functor.dim(),
            avg_bucket_size: if num_codes > 0 {
                num_ids as f64 / num_codes as f64
            } else {
                0.0
            },
            max_bucket_size: inner.hash2uuids.values().map(BTreeSet::len).max().unwrap_or(0),
        }
    }

    /// Snapshot of runtime metrics (`None` if metrics were not enabled).
    pub fn metrics(&self) -> Option<MetricsSnapshot> {
        self.metrics.as_ref().map(|m| m.snapshot())
    }

    pub fn reset_metrics(&self) {
        if let Some(ref m) = self.metrics {
            m.reset();
        }
    }
}

// ---------------------------------------------------------------------------
// Parallel batch queries (behind `parallel` feature)
// ---------------------------------------------------------------------------

#[cfg(feature = "parallel")]
impl LshNearestNeighborsIndex {
    /// Run [`nn`](Self::nn) for many queries in parallel.
    pub fn par_nn_batch(
        &self,
        queries: &[crate::descriptor::Vector],
        n: usize,
    ) -> Result<Vec<Vec<Neighbor>>> {
        use rayon::prelude::*;

        queries.par_iter().map(|q| self.nn(q.view(), n)).collect()
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Fluent builder for [`LshNearestNeighborsIndex`].
#[derive(Default)]
pub struct LshNearestNeighborsIndexBuilder {
    functor: Option<Arc<dyn LshFunctor>>,
    config: NnIndexConfig,
    enable_metrics: bool,
}

impl LshNearestNeighborsIndexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn functor(mut self, functor: Arc<dyn LshFunctor>) -> Self {
        self.functor = Some(functor);
        self
    }

    pub fn config(mut self, config: NnIndexConfig) -> Self {
        self.config = config;
        self
    }

    pub fn hash_index(mut self, kind: HashIndexKind) -> Self {
        self.config.hash_index = kind;
        self
    }

    pub fn overfetch_factor(mut self, factor: usize) -> Self {
        self.config.overfetch_factor = factor;
        self
    }

    pub fn enable_metrics(mut self) -> Self {
        self.enable_metrics = true;
        self
    }

    /// Build the index, returning an error on invalid configuration.
    pub fn build(self) -> Result<LshNearestNeighborsIndex> {
        let functor = self
            .functor
            .ok_or_else(|| Error::InvalidConfig("an LSH functor is required".into()))?;
        LshNearestNeighborsIndex::new_with_metrics(functor, self.config, self.enable_metrics)
    }
}
