//! Distance functions used to re-rank candidates and to score examples.
//!
//! Every function here returns a [`Distance`], a value clamped to `[0, 1]`
//! where smaller means closer. Similarities live in their own type
//! ([`CosineSimilarity`]) and must be converted explicitly, so a similarity
//! can never be handed to code that sorts ascending by distance.

use std::cmp::Ordering;
use std::f64::consts::PI;
use std::fmt;

use ndarray::{Array1, ArrayView1};

/// A normalized distance in `[0, 1]`. `0` means identical.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Distance(f32);

impl Distance {
    pub const ZERO: Distance = Distance(0.0);
    pub const MAX: Distance = Distance(1.0);

    /// Clamp a raw value into `[0, 1]`. NaN is treated as maximally distant.
    pub(crate) fn clamped(raw: f64) -> Self {
        if raw.is_nan() {
            return Distance::MAX;
        }
        Distance(raw.clamp(0.0, 1.0) as f32)
    }

    pub fn value(self) -> f32 {
        self.0
    }

    /// `1 - distance`, handy for turning a distance into a relevance score.
    pub fn closeness(self) -> f32 {
        1.0 - self.0
    }
}

impl Eq for Distance {}

impl PartialOrd for Distance {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Distance {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl fmt::Display for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}", self.0)
    }
}

/// Cosine similarity in `[-1, 1]`. Not a distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CosineSimilarity(f32);

impl CosineSimilarity {
    pub fn value(self) -> f32 {
        self.0
    }

    /// `arccos(similarity) / pi`.
    pub fn to_distance(self) -> Distance {
        let s = (self.0 as f64).clamp(-1.0, 1.0);
        Distance::clamped(s.acos() / PI)
    }
}

fn norm(v: &ArrayView1<f32>) -> f64 {
    v.iter().map(|&x| (x as f64) * (x as f64)).sum::<f64>().sqrt()
}

/// Cosine similarity of two vectors.
///
/// Two zero vectors are identical (`1`); a zero vector against anything else
/// is orthogonal (`0`).
pub fn cosine_similarity(a: &ArrayView1<f32>, b: &ArrayView1<f32>) -> CosineSimilarity {
    let (na, nb) = (norm(a), norm(b));
    if na < f64::EPSILON && nb < f64::EPSILON {
        return CosineSimilarity(1.0);
    }
    if na < f64::EPSILON || nb < f64::EPSILON {
        return CosineSimilarity(0.0);
    }
    let dot: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(&x, &y)| x as f64 * y as f64)
        .sum();
    CosineSimilarity((dot / (na * nb)).clamp(-1.0, 1.0) as f32)
}

/// Normalized angular distance: `arccos(cos(a, b)) / pi`.
///
/// Computed as `2 * atan2(|â - b̂|, |â + b̂|)` on the unit vectors, which is
/// exact at both ends of the range: identical directions give `0`, opposed
/// directions give `1`. Zero vectors follow [`cosine_similarity`].
pub fn angular_distance(a: &ArrayView1<f32>, b: &ArrayView1<f32>) -> Distance {
    let (na, nb) = (norm(a), norm(b));
    if na < f64::EPSILON || nb < f64::EPSILON {
        return cosine_similarity(a, b).to_distance();
    }
    let mut diff = 0.0f64;
    let mut sum = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        let ux = x as f64 / na;
        let uy = y as f64 / nb;
        diff += (ux - uy) * (ux - uy);
        sum += (ux + uy) * (ux + uy);
    }
    let theta = 2.0 * diff.sqrt().atan2(sum.sqrt());
    Distance::clamped(theta / PI)
}

/// Histogram intersection distance: `1 - sum(min(a_i, b_i))`.
///
/// Meaningful for non-negative, L1-normalized histograms. Other inputs are
/// clamped into `[0, 1]`.
pub fn histogram_intersection_distance(a: &ArrayView1<f32>, b: &ArrayView1<f32>) -> Distance {
    let intersection: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(&x, &y)| x.min(y) as f64)
        .sum();
    Distance::clamped(1.0 - intersection)
}

/// Scale a vector so its entries sum to one. Leaves all-zero vectors unchanged.
pub fn l1_normalize(v: &mut Array1<f32>) {
    let total: f32 = v.iter().map(|x| x.abs()).sum();
    if total > f32::EPSILON {
        *v /= total;
    }
}
