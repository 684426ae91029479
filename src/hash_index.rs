//! Indexes over the set of unique hash codes, answering "which stored codes
//! are nearest to this one" under Hamming distance.
//!
//! Two variants share the [`HashIndex`] trait:
//!
//! - [`BallTreeHashIndex`]: a ball tree over codes. Each node keeps a pivot
//!   code and a covering radius; queries are branch-and-bound using the
//!   triangle inequality.
//! - [`LinearHashIndex`]: a brute-force scan, used as a reference and for tiny
//!   code sets.
//!
//! Both return exactly the `k` nearest codes ordered by `(hamming, code)`, so
//! results are reproducible for a given set of indexed codes.
//!
//! # Cost
//!
//! Ball-tree queries are sub-linear in the number of unique codes on average
//! when codes are short relative to how clustered the data is. As the bit
//! length grows, pairwise Hamming distances concentrate around `bits / 2`, the
//! `d(q, pivot) - radius` bound stops pruning, and queries degrade toward a
//! linear scan of every leaf. Incremental updates only ever widen radii and
//! removals leave them as loose upper bounds, so heavy churn also erodes
//! pruning until [`BallTreeHashIndex::rebuild`] is called.

use std::collections::{BTreeSet, BinaryHeap};
use std::fmt;
use std::mem;

use hashbrown::HashSet;

use crate::error::{Error, Result};
use crate::hash::HashCode;

/// A searchable set of unique hash codes.
pub trait HashIndex: Send + Sync + fmt::Debug {
    /// Replace the contents with the unique codes in `codes`.
    ///
    /// An empty slice yields an empty, queryable index.
    fn build(&mut self, codes: &[HashCode]) -> Result<()>;

    /// Add codes. Codes already present are ignored.
    fn update(&mut self, codes: &[HashCode]) -> Result<()>;

    /// Remove codes. Fails without modifying the index if any code is absent.
    fn remove(&mut self, codes: &[HashCode]) -> Result<()>;

    /// Up to `k` codes nearest to `query`, ordered by `(hamming, code)`.
    fn nearest(&self, query: &HashCode, k: usize) -> Vec<(HashCode, u32)>;

    fn contains(&self, code: &HashCode) -> bool;

    /// Every indexed code, in lexical order.
    fn codes(&self) -> Vec<HashCode>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Which [`HashIndex`] implementation a nearest-neighbour index uses.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(
    feature = "persistence",
    derive(serde::Serialize, serde::Deserialize),
    serde(tag = "kind", rename_all = "snake_case")
)]
pub enum HashIndexKind {
    BallTree { leaf_size: usize },
    Linear,
}

impl Default for HashIndexKind {
    fn default() -> Self {
        HashIndexKind::BallTree {
            leaf_size: BallTreeParams::default().leaf_size,
        }
    }
}

impl HashIndexKind {
    pub fn create(&self) -> Result<Box<dyn HashIndex>> {
        Ok(match self {
            HashIndexKind::BallTree { leaf_size } => Box::new(BallTreeHashIndex::new(
                BallTreeParams {
                    leaf_size: *leaf_size,
                },
            )?),
            HashIndexKind::Linear => Box::new(LinearHashIndex::new()),
        })
    }
}

/// Every code in one index shares a bit length.
fn check_bit_length(current: Option<usize>, codes: &[HashCode]) -> Result<Option<usize>> {
    let mut expected = current;
    for code in codes {
        match expected {
            None => expected = Some(code.bit_length()),
            Some(bits) if bits != code.bit_length() => {
                return Err(Error::InvalidConfig(format!(
                    "hash code has {} bits, index holds {bits}-bit codes",
                    code.bit_length()
                )))
            }
            Some(_) => {}
        }
    }
    Ok(expected)
}

// ---------------------------------------------------------------------------
// Ball tree
// ---------------------------------------------------------------------------

/// Ball tree parameters.
#[derive(Debug, Clone)]
pub struct BallTreeParams {
    /// Codes per leaf at build time. Leaves split once incremental updates
    /// push them past twice this size.
    pub leaf_size: usize,
}

impl Default for BallTreeParams {
    fn default() -> Self {
        Self { leaf_size: 40 }
    }
}

#[derive(Debug)]
enum BallNode {
    Leaf {
        pivot: HashCode,
        radius: u32,
        codes: Vec<HashCode>,
    },
    Internal {
        pivot: HashCode,
        radius: u32,
        left: Box<BallNode>,
        right: Box<BallNode>,
    },
}

impl BallNode {
    fn empty() -> Self {
        BallNode::Leaf {
            pivot: HashCode::zeros(0),
            radius: 0,
            codes: Vec::new(),
        }
    }

    fn pivot(&self) -> &HashCode {
        match self {
            BallNode::Leaf { pivot, .. } | BallNode::Internal { pivot, .. } => pivot,
        }
    }

    fn radius(&self) -> u32 {
        match self {
            BallNode::Leaf { radius, .. } | BallNode::Internal { radius, .. } => *radius,
        }
    }

    fn is_empty(&self) -> bool {
        matches!(self, BallNode::Leaf { codes, .. } if codes.is_empty())
    }

    /// No code under this node can be closer to `query` than this.
    fn lower_bound(&self, query: &HashCode) -> u32 {
        query.hamming(self.pivot()).saturating_sub(self.radius())
    }

    fn depth(&self) -> usize {
        match self {
            BallNode::Leaf { .. } => 1,
            BallNode::Internal { left, right, .. } => 1 + left.depth().max(right.depth()),
        }
    }

    /// Build a subtree over unique, non-empty `codes`.
    fn build(codes: Vec<HashCode>, leaf_size: usize) -> BallNode {
        let pivot = majority_code(&codes);
        let radius = codes.iter().map(|c| c.hamming(&pivot)).max().unwrap_or(0);

        if codes.len() <= leaf_size || radius == 0 {
            return BallNode::Leaf {
                pivot,
                radius,
                codes,
            };
        }

        // Two far-apart seeds: farthest from the pivot, then farthest from that.
        let seed_a = farthest_from(&codes, &pivot).clone();
        let seed_b = farthest_from(&codes, &seed_a).clone();

        let mut left = Vec::with_capacity(codes.len() / 2 + 1);
        let mut right = Vec::with_capacity(codes.len() / 2 + 1);
        for code in codes {
            let da = code.hamming(&seed_a);
            let db = code.hamming(&seed_b);
            if da < db || (da == db && left.len() <= right.len()) {
                left.push(code);
            } else {
                right.push(code);
            }
        }
        if left.is_empty() || right.is_empty() {
            let mut all = left;
            all.append(&mut right);
            right = all.split_off(all.len() / 2);
            left = all;
        }

        BallNode::Internal {
            pivot,
            radius,
            left: Box::new(BallNode::build(left, leaf_size)),
            right: Box::new(BallNode::build(right, leaf_size)),
        }
    }

    fn insert(&mut self, code: HashCode, leaf_size: usize) {
        let overflow = match self {
            BallNode::Leaf {
                pivot,
                radius,
                codes,
            } => {
                if codes.is_empty() {
                    *pivot = code.clone();
                    *radius = 0;
                } else {
                    *radius = (*radius).max(code.hamming(pivot));
                }
                codes.push(code);
                codes.len() > 2 * leaf_size
            }
            BallNode::Internal {
                pivot,
                radius,
                left,
                right,
            } => {
                *radius = (*radius).max(code.hamming(pivot));
                if code.hamming(left.pivot()) <= code.hamming(right.pivot()) {
                    left.insert(code, leaf_size);
                } else {
                    right.insert(code, leaf_size);
                }
                false
            }
        };

        if overflow {
            if let BallNode::Leaf { codes, .. } = self {
                let mut codes = mem::take(codes);
                codes.sort();
                *self = BallNode::build(codes, leaf_size);
            }
        }
    }

    /// Remove `code` if present. Empty subtrees are collapsed into their
    /// sibling; radii above are left as upper bounds.
    fn remove(&mut self, code: &HashCode) -> bool {
        if code.hamming(self.pivot()) > self.radius() {
            return false;
        }
        let replacement = match self {
            BallNode::Leaf { codes, .. } => {
                return match codes.iter().position(|c| c == code) {
                    Some(pos) => {
                        codes.remove(pos);
                        true
                    }
                    None => false,
                };
            }
            BallNode::Internal { left, right, .. } => {
                if !(left.remove(code) || right.remove(code)) {
                    return false;
                }
                if left.is_empty() {
                    Some(mem::replace(right.as_mut(), BallNode::empty()))
                } else if right.is_empty() {
                    Some(mem::replace(left.as_mut(), BallNode::empty()))
                } else {
                    None
                }
            }
        };
        if let Some(node) = replacement {
            *self = node;
        }
        true
    }

    fn search(&self, query: &HashCode, k: usize, best: &mut BinaryHeap<(u32, HashCode)>) {
        if best.len() == k {
            if let Some((worst, _)) = best.peek() {
                // Strict: a code at the same distance may still win the lexical tie-break.
                if self.lower_bound(query) > *worst {
                    return;
                }
            }
        }
        match self {
            BallNode::Leaf { codes, .. } => {
                for code in codes {
                    offer(best, k, query.hamming(code), code);
                }
            }
            BallNode::Internal { left, right, .. } => {
                let (first, second) = if left.lower_bound(query) <= right.lower_bound(query) {
                    (left, right)
                } else {
                    (right, left)
                };
                first.search(query, k, best);
                second.search(query, k, best);
            }
        }
    }
}

/// Keep the `k` smallest `(distance, code)` pairs in a max-heap.
fn offer(best: &mut BinaryHeap<(u32, HashCode)>, k: usize, d: u32, code: &HashCode) {
    if best.len() < k {
        best.push((d, code.clone()));
        return;
    }
    let replace = match best.peek() {
        Some((worst_d, worst_code)) => (d, code) < (*worst_d, worst_code),
        None => false,
    };
    if replace {
        best.pop();
        best.push((d, code.clone()));
    }
}

/// Bitwise majority vote over `codes`: the code minimizing total Hamming
/// distance to the set.
fn majority_code(codes: &[HashCode]) -> HashCode {
    let bits = codes.first().map(HashCode::bit_length).unwrap_or(0);
    let mut counts = vec![0usize; bits];
    for code in codes {
        for (i, count) in counts.iter_mut().enumerate() {
            if code.bit(i) {
                *count += 1;
            }
        }
    }
    let bools: Vec<bool> = counts.iter().map(|&c| c * 2 > codes.len()).collect();
    HashCode::from_bools(&bools)
}

fn farthest_from<'a>(codes: &'a [HashCode], from: &HashCode) -> &'a HashCode {
    let mut best = &codes[0];
    let mut best_d = best.hamming(from);
    for code in &codes[1..] {
        let d = code.hamming(from);
        if d > best_d {
            best = code;
            best_d = d;
        }
    }
    best
}

/// Ball tree over hash codes with Hamming distance.
///
/// See the module documentation for the cost model.
pub struct BallTreeHashIndex {
    params: BallTreeParams,
    root: Option<BallNode>,
    members: HashSet<HashCode>,
    bit_length: Option<usize>,
}

impl fmt::Debug for BallTreeHashIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BallTreeHashIndex")
            .field("codes", &self.members.len())
            .field("bit_length", &self.bit_length)
            .field("leaf_size", &self.params.leaf_size)
            .field("depth", &self.depth())
            .finish()
    }
}

impl BallTreeHashIndex {
    pub fn new(params: BallTreeParams) -> Result<Self> {
        if params.leaf_size == 0 {
            return Err(Error::InvalidConfig("leaf_size must be > 0".into()));
        }
        Ok(Self {
            params,
            root: None,
            members: HashSet::new(),
            bit_length: None,
        })
    }

    /// Rebuild the tree from the current codes, tightening pivots and radii
    /// after incremental churn.
    pub fn rebuild(&mut self) {
        let codes: BTreeSet<HashCode> = self.members.iter().cloned().collect();
        self.root = if codes.is_empty() {
            None
        } else {
            Some(BallNode::build(codes.into_iter().collect(), self.params.leaf_size))
        };
    }

    /// Height of the tree; 0 when empty.
    pub fn depth(&self) -> usize {
        self.root.as_ref().map(BallNode::depth).unwrap_or(0)
    }
}

impl Default for BallTreeHashIndex {
    fn default() -> Self {
        Self {
            params: BallTreeParams::default(),
            root: None,
            members: HashSet::new(),
            bit_length: None,
        }
    }
}

impl HashIndex for BallTreeHashIndex {
    fn build(&mut self, codes: &[HashCode]) -> Result<()> {
        let bit_length = check_bit_length(None, codes)?;
        let unique: BTreeSet<HashCode> = codes.iter().cloned().collect();
        self.members = unique.iter().cloned().collect();
        self.bit_length = bit_length;
        self.root = if unique.is_empty() {
            None
        } else {
            Some(BallNode::build(unique.into_iter().collect(), self.params.leaf_size))
        };
        Ok(())
    }

    fn update(&mut self, codes: &[HashCode]) -> Result<()> {
        self.bit_length = check_bit_length(self.bit_length, codes)?;
        let fresh: BTreeSet<&HashCode> = codes
            .iter()
            .filter(|c| !self.members.contains(*c))
            .collect();
        for code in fresh {
            self.members.insert(code.clone());
            match self.root.as_mut() {
                Some(root) => root.insert(code.clone(), self.params.leaf_size),
                None => {
                    self.root = Some(BallNode::Leaf {
                        pivot: code.clone(),
                        radius: 0,
                        codes: vec![code.clone()],
                    })
                }
            }
        }
        Ok(())
    }

    fn remove(&mut self, codes: &[HashCode]) -> Result<()> {
        if let Some(missing) = codes.iter().find(|c| !self.members.contains(*c)) {
            return Err(Error::UnknownHashCode(missing.to_string()));
        }
        for code in codes {
            if !self.members.remove(code) {
                // Duplicate in `codes`, already removed.
                continue;
            }
            if let Some(root) = self.root.as_mut() {
                root.remove(code);
                if root.is_empty() {
                    self.root = None;
                }
            }
        }
        if self.members.is_empty() {
            self.bit_length = None;
        }
        Ok(())
    }

    fn nearest(&self, query: &HashCode, k: usize) -> Vec<(HashCode, u32)> {
        let k = k.min(self.members.len());
        let root = match self.root.as_ref() {
            Some(root) if k > 0 => root,
            _ => return Vec::new(),
        };
        let mut best = BinaryHeap::with_capacity(k + 1);
        root.search(query, k, &mut best);
        best.into_sorted_vec()
            .into_iter()
            .map(|(d, code)| (code, d))
            .collect()
    }

    fn contains(&self, code: &HashCode) -> bool {
        self.members.contains(code)
    }

    fn codes(&self) -> Vec<HashCode> {
        let mut codes: Vec<HashCode> = self.members.iter().cloned().collect();
        codes.sort();
        codes
    }

    fn len(&self) -> usize {
        self.members.len()
    }
}

// ---------------------------------------------------------------------------
// Linear scan
// ---------------------------------------------------------------------------

/// Brute-force [`HashIndex`]: every query scans all codes.
#[derive(Debug, Default)]
pub struct LinearHashIndex {
    codes: BTreeSet<HashCode>,
    bit_length: Option<usize>,
}

impl LinearHashIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HashIndex for LinearHashIndex {
    fn build(&mut self, codes: &[HashCode]) -> Result<()> {
        self.bit_length = check_bit_length(None, codes)?;
        self.codes = codes.iter().cloned().collect();
        Ok(())
    }

    fn update(&mut self, codes: &[HashCode]) -> Result<()> {
        self.bit_length = check_bit_length(self.bit_length, codes)?;
        self.codes.extend(codes.iter().cloned());
        Ok(())
    }

    fn remove(&mut self, codes: &[HashCode]) -> Result<()> {
        if let Some(missing) = codes.iter().find(|c| !self.codes.contains(*c)) {
            return Err(Error::UnknownHashCode(missing.to_string()));
        }
        for code in codes {
            self.codes.remove(code);
        }
        if self.codes.is_empty() {
            self.bit_length = None;
        }
        Ok(())
    }

    fn nearest(&self, query: &HashCode, k: usize) -> Vec<(HashCode, u32)> {
        let k = k.min(self.codes.len());
        if k == 0 {
            return Vec::new();
        }
        let mut best = BinaryHeap::with_capacity(k + 1);
        for code in &self.codes {
            offer(&mut best, k, query.hamming(code), code);
        }
        best.into_sorted_vec()
            .into_iter()
            .map(|(d, code)| (code, d))
            .collect()
    }

    fn contains(&self, code: &HashCode) -> bool {
        self.codes.contains(code)
    }

    fn codes(&self) -> Vec<HashCode> {
        self.codes.iter().cloned().collect()
    }

    fn len(&self) -> usize {
        self.codes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_codes(rng: &mut StdRng, n: usize, bits: usize) -> Vec<HashCode> {
        (0..n)
            .map(|_| {
                let bools: Vec<bool> = (0..bits).map(|_| rng.gen_bool(0.5)).collect();
                HashCode::from_bools(&bools)
            })
            .collect()
    }

    fn code(s: &str) -> HashCode {
        HashCode::from_bit_str(s).unwrap()
    }

    fn small_tree() -> BallTreeHashIndex {
        BallTreeHashIndex::new(BallTreeParams { leaf_size: 4 }).unwrap()
    }

    #[test]
    fn test_empty_build_is_valid() {
        let mut index = small_tree();
        index.build(&[]).unwrap();
        assert!(index.is_empty());
        assert!(index.nearest(&code("0101"), 3).is_empty());
        assert_eq!(index.depth(), 0);
    }

    #[test]
    fn test_nearest_with_unbounded_k() {
        let codes = [code("0110"), code("1001")];
        let mut tree = small_tree();
        tree.build(&codes).unwrap();
        let mut linear = LinearHashIndex::new();
        linear.build(&codes).unwrap();

        for k in [usize::MAX, usize::MAX / 64] {
            let got = tree.nearest(&code("0111"), k);
            assert_eq!(got, vec![(code("0110"), 1), (code("1001"), 3)]);
            assert_eq!(linear.nearest(&code("0111"), k), got);
        }
        assert!(LinearHashIndex::new().nearest(&code("0111"), usize::MAX).is_empty());
    }

    #[test]
    fn test_nearest_orders_by_distance_then_code() {
        let mut index = small_tree();
        index
            .build(&[code("0000"), code("0011"), code("1000"), code("0100"), code("1111")])
            .unwrap();
        let got = index.nearest(&code("0000"), 3);
        assert_eq!(
            got,
            vec![(code("0000"), 0), (code("0100"), 1), (code("1000"), 1)]
        );
    }

    #[test]
    fn test_duplicates_collapse() {
        let mut index = small_tree();
        index.build(&[code("01"), code("01"), code("10")]).unwrap();
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_ball_tree_matches_linear_scan() {
        let mut rng = StdRng::seed_from_u64(11);
        let codes = random_codes(&mut rng, 600, 24);
        let mut tree = small_tree();
        let mut linear = LinearHashIndex::new();
        tree.build(&codes).unwrap();
        linear.build(&codes).unwrap();
        assert!(tree.depth() > 1);

        for q in random_codes(&mut rng, 40, 24) {
            for k in [1, 5, 17, 100] {
                assert_eq!(tree.nearest(&q, k), linear.nearest(&q, k));
            }
        }
    }

    #[test]
    fn test_incremental_matches_linear_scan() {
        let mut rng = StdRng::seed_from_u64(5);
        let first = random_codes(&mut rng, 200, 16);
        let second = random_codes(&mut rng, 300, 16);

        let mut tree = small_tree();
        let mut linear = LinearHashIndex::new();
        tree.build(&first).unwrap();
        linear.build(&first).unwrap();
        tree.update(&second).unwrap();
        linear.update(&second).unwrap();

        let doomed: Vec<HashCode> = linear.codes.iter().step_by(3).cloned().collect();
        tree.remove(&doomed).unwrap();
        linear.remove(&doomed).unwrap();
        assert_eq!(tree.len(), linear.len());

        for q in random_codes(&mut rng, 30, 16) {
            assert_eq!(tree.nearest(&q, 10), linear.nearest(&q, 10));
        }

        tree.rebuild();
        for q in random_codes(&mut rng, 30, 16) {
            assert_eq!(tree.nearest(&q, 10), linear.nearest(&q, 10));
        }
    }

    #[test]
    fn test_remove_everything() {
        let mut tree = small_tree();
        let codes = vec![code("000"), code("011"), code("101"), code("110"), code("111")];
        tree.build(&codes).unwrap();
        tree.remove(&codes).unwrap();
        assert!(tree.is_empty());
        assert!(tree.nearest(&code("000"), 2).is_empty());

        // A different bit length is accepted once the index is empty again.
        tree.update(&[code("01")]).unwrap();
        assert_eq!(tree.nearest(&code("00"), 1), vec![(code("01"), 1)]);
    }

    #[test]
    fn test_remove_unknown_code_is_atomic() {
        let mut tree = small_tree();
        tree.build(&[code("00"), code("11")]).unwrap();
        let err = tree.remove(&[code("00"), code("01")]).unwrap_err();
        assert!(matches!(err, Error::UnknownHashCode(ref s) if s == "01"));
        assert!(tree.contains(&code("00")));
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn test_mixed_bit_lengths_rejected() {
        let mut tree = small_tree();
        assert!(tree.build(&[code("00"), code("111")]).is_err());
        tree.build(&[code("00")]).unwrap();
        assert!(tree.update(&[code("111")]).is_err());
    }

    #[test]
    fn test_leaf_overflow_splits() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut tree = small_tree();
        tree.build(&[]).unwrap();
        tree.update(&random_codes(&mut rng, 64, 12)).unwrap();
        assert!(tree.depth() > 1);
    }

    #[test]
    fn test_zero_leaf_size_rejected() {
        assert!(BallTreeHashIndex::new(BallTreeParams { leaf_size: 0 }).is_err());
    }
}
