//! Relevance rankers: score a candidate pool from positive and negative
//! examples.
//!
//! A ranker is the CPU-heavy step of a refine, so every implementation takes a
//! [`RefineBudget`] and checks it while scoring.

use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ndarray::{Array1, ArrayView1};

use crate::descriptor::{DescriptorElement, Vector};
use crate::distance::{angular_distance, histogram_intersection_distance, l1_normalize};
use crate::error::{Error, Result};

/// Candidates scored between two budget checks.
pub const BUDGET_CHECK_INTERVAL: usize = 256;

// ---------------------------------------------------------------------------
// Budget
// ---------------------------------------------------------------------------

/// Shared flag for cancelling an in-flight refine from another thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Limits on one refine: an optional cancel token and an optional deadline.
#[derive(Debug, Clone, Default)]
pub struct RefineBudget {
    cancel: Option<CancelToken>,
    deadline: Option<Instant>,
}

impl RefineBudget {
    /// No cancellation, no deadline.
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// [`Error::Cancelled`] or [`Error::TimedOut`] once the budget is spent.
    pub fn check(&self) -> Result<()> {
        if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Err(Error::Cancelled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(Error::TimedOut);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Ranker trait
// ---------------------------------------------------------------------------

/// Scores candidates by relevance to a set of examples.
pub trait RelevanceRanker: Send + Sync + fmt::Debug {
    /// Score every element of `pool` in `[0, 1]`, higher meaning more
    /// relevant. Output order follows `pool`.
    ///
    /// `positives` is never empty when called from a session.
    fn rank(
        &self,
        positives: &[Arc<Vector>],
        negatives: &[Arc<Vector>],
        pool: &[DescriptorElement],
        budget: &RefineBudget,
    ) -> Result<Vec<(String, f64)>>;
}

// ---------------------------------------------------------------------------
// Kernel ranker
// ---------------------------------------------------------------------------

/// Similarity kernel used by [`KernelRanker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "persistence",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "snake_case")
)]
pub enum Kernel {
    /// `1 - angular distance`.
    #[default]
    Angular,
    /// Histogram intersection of L1-normalized vectors.
    HistogramIntersection,
}

impl Kernel {
    /// Angular works on the raw vector; only HIK needs a normalized copy.
    fn prepare(self, v: &Vector) -> Cow<'_, Vector> {
        match self {
            Kernel::Angular => Cow::Borrowed(v),
            Kernel::HistogramIntersection => {
                let mut h: Array1<f32> = v.clone();
                l1_normalize(&mut h);
                Cow::Owned(h)
            }
        }
    }

    fn similarity(self, a: &ArrayView1<f32>, b: &ArrayView1<f32>) -> f64 {
        let d = match self {
            Kernel::Angular => angular_distance(a, b),
            Kernel::HistogramIntersection => histogram_intersection_distance(a, b),
        };
        1.0 - d.value() as f64
    }
}

/// Kernel-mean classifier with a logistic output.
///
/// For a candidate `x`, with `sp` its mean kernel similarity to the positives
/// and `sn` its mean similarity to the negatives (`0.5` when there are none):
///
/// ```text
/// margin = (w⁺·sp − sn) / ((w⁺ + 1) / 2)      w⁺ = max(1, |neg| / |pos|)
/// score  = 1 / (1 + exp(−gain · margin))
/// ```
///
/// The positive weight rebalances the classes when negatives outnumber
/// positives, as is typical a few rounds into a session.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "persistence",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct KernelRanker {
    pub kernel: Kernel,
    pub gain: f64,
}

impl Default for KernelRanker {
    fn default() -> Self {
        Self {
            kernel: Kernel::Angular,
            gain: 8.0,
        }
    }
}

impl KernelRanker {
    pub fn new(kernel: Kernel) -> Self {
        Self {
            kernel,
            ..Self::default()
        }
    }

    pub fn with_gain(mut self, gain: f64) -> Self {
        self.gain = gain;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.gain.is_finite() || self.gain <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "ranker gain must be positive and finite, got {}",
                self.gain
            )));
        }
        Ok(())
    }

    fn mean_similarity(&self, x: &ArrayView1<f32>, examples: &[Cow<'_, Vector>]) -> Option<f64> {
        if examples.is_empty() {
            return None;
        }
        let total: f64 = examples
            .iter()
            .map(|e| self.kernel.similarity(x, &e.view()))
            .sum();
        Some(total / examples.len() as f64)
    }

    fn score(
        &self,
        x: &Vector,
        positives: &[Cow<'_, Vector>],
        negatives: &[Cow<'_, Vector>],
        w_pos: f64,
    ) -> f64 {
        let x = self.kernel.prepare(x);
        let sp = self.mean_similarity(&x.view(), positives).unwrap_or(0.0);
        let sn = self.mean_similarity(&x.view(), negatives).unwrap_or(0.5);
        let margin = (w_pos * sp - sn) / ((w_pos + 1.0) / 2.0);
        1.0 / (1.0 + (-self.gain * margin).exp())
    }

    fn score_chunk(
        &self,
        chunk: &[DescriptorElement],
        positives: &[Cow<'_, Vector>],
        negatives: &[Cow<'_, Vector>],
        w_pos: f64,
        dim: usize,
        budget: &RefineBudget,
    ) -> Result<Vec<(String, f64)>> {
        budget.check()?;
        chunk
            .iter()
            .map(|element| {
                let v = element.vector()?;
                if v.len() != dim {
                    return Err(Error::DimensionMismatch {
                        expected: dim,
                        got: v.len(),
                    });
                }
                let s = self.score(&v, positives, negatives, w_pos);
                Ok((element.uuid().to_string(), s))
            })
            .collect()
    }
}

impl RelevanceRanker for KernelRanker {
    fn rank(
        &self,
        positives: &[Arc<Vector>],
        negatives: &[Arc<Vector>],
        pool: &[DescriptorElement],
        budget: &RefineBudget,
    ) -> Result<Vec<(String, f64)>> {
        budget.check()?;
        let Some(first) = positives.first() else {
            return Err(Error::InvalidState(
                "ranking needs at least one positive example".into(),
            ));
        };
        let dim = first.len();
        if let Some(bad) = positives.iter().chain(negatives).find(|v| v.len() != dim) {
            return Err(Error::DimensionMismatch {
                expected: dim,
                got: bad.len(),
            });
        }

        let pos: Vec<Cow<'_, Vector>> = positives.iter().map(|v| self.kernel.prepare(v)).collect();
        let neg: Vec<Cow<'_, Vector>> = negatives.iter().map(|v| self.kernel.prepare(v)).collect();
        let w_pos = (neg.len() as f64 / pos.len() as f64).max(1.0);

        #[cfg(feature = "parallel")]
        let chunks: Vec<Vec<(String, f64)>> = {
            use rayon::prelude::*;

            pool.par_chunks(BUDGET_CHECK_INTERVAL)
                .map(|chunk| self.score_chunk(chunk, &pos, &neg, w_pos, dim, budget))
                .collect::<Result<_>>()?
        };

        #[cfg(not(feature = "parallel"))]
        let chunks: Vec<Vec<(String, f64)>> = pool
            .chunks(BUDGET_CHECK_INTERVAL)
            .map(|chunk| self.score_chunk(chunk, &pos, &neg, w_pos, dim, budget))
            .collect::<Result<_>>()?;

        Ok(chunks.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::DescriptorElementFactory;
    use ndarray::array;

    #[test]
    fn test_angular_prepare_borrows() {
        let v = array![3.0, 1.0, 0.0];
        assert!(matches!(Kernel::Angular.prepare(&v), Cow::Borrowed(_)));

        let h = Kernel::HistogramIntersection.prepare(&v);
        assert!(matches!(h, Cow::Owned(_)));
        assert_eq!(*h, array![0.75, 0.25, 0.0]);
        assert_eq!(v, array![3.0, 1.0, 0.0]);
    }

    fn pool(factory: &DescriptorElementFactory) -> Vec<DescriptorElement> {
        vec![
            factory.create("t", "near_pos", array![1.0, 0.1, 0.0]).unwrap(),
            factory.create("t", "near_neg", array![0.0, 0.1, 1.0]).unwrap(),
            factory.create("t", "middle", array![0.5, 0.0, 0.5]).unwrap(),
        ]
    }

    fn score_of(ranked: &[(String, f64)], uuid: &str) -> f64 {
        ranked.iter().find(|(u, _)| u == uuid).map(|(_, s)| *s).unwrap()
    }

    #[test]
    fn test_positive_side_scores_higher() {
        let factory = DescriptorElementFactory::in_memory();
        let pos = vec![Arc::new(array![1.0, 0.0, 0.0])];
        let neg = vec![Arc::new(array![0.0, 0.0, 1.0])];
        let ranked = KernelRanker::default()
            .rank(&pos, &neg, &pool(&factory), &RefineBudget::unlimited())
            .unwrap();

        assert_eq!(ranked.len(), 3);
        assert_eq!(ranked[0].0, "near_pos");
        assert!(score_of(&ranked, "near_pos") > score_of(&ranked, "middle"));
        assert!(score_of(&ranked, "middle") > score_of(&ranked, "near_neg"));
        assert!(ranked.iter().all(|(_, s)| (0.0..=1.0).contains(s)));
    }

    #[test]
    fn test_histogram_kernel() {
        let factory = DescriptorElementFactory::in_memory();
        let pos = vec![Arc::new(array![4.0, 1.0, 0.0])];
        let neg = vec![Arc::new(array![0.0, 1.0, 4.0])];
        let ranked = KernelRanker::new(Kernel::HistogramIntersection)
            .rank(&pos, &neg, &pool(&factory), &RefineBudget::unlimited())
            .unwrap();
        assert!(score_of(&ranked, "near_pos") > score_of(&ranked, "near_neg"));
    }

    #[test]
    fn test_requires_positive() {
        let factory = DescriptorElementFactory::in_memory();
        let err = KernelRanker::default()
            .rank(&[], &[], &pool(&factory), &RefineBudget::unlimited())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[test]
    fn test_cancelled_budget() {
        let factory = DescriptorElementFactory::in_memory();
        let token = CancelToken::new();
        token.cancel();
        let budget = RefineBudget::unlimited().with_cancel(token);
        let pos = vec![Arc::new(array![1.0, 0.0, 0.0])];
        let err = KernelRanker::default()
            .rank(&pos, &[], &pool(&factory), &budget)
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn test_expired_deadline() {
        let budget = RefineBudget::unlimited().with_deadline(Instant::now());
        assert!(matches!(budget.check(), Err(Error::TimedOut)));
        assert!(RefineBudget::unlimited().check().is_ok());
    }

    #[test]
    fn test_bad_gain_rejected() {
        assert!(KernelRanker::default().with_gain(0.0).validate().is_err());
        assert!(KernelRanker::default().with_gain(f64::NAN).validate().is_err());
        assert!(KernelRanker::default().validate().is_ok());
    }
}
