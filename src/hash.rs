use std::fmt;

use ndarray::{Array1, Array2, ArrayView1};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::{Error, Result};

/// A fixed-length bit vector produced by an [`LshFunctor`].
///
/// Bits are packed into `u64` words with bit 0 in the most significant
/// position of the first word, so the derived ordering is the lexical order of
/// the bit strings. That ordering is the tie-break used by the hash indexes.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HashCode {
    bits: usize,
    words: Box<[u64]>,
}

impl HashCode {
    /// An all-zero code of `bits` length.
    pub fn zeros(bits: usize) -> Self {
        Self {
            bits,
            words: vec![0u64; bits.div_ceil(64)].into_boxed_slice(),
        }
    }

    pub fn from_bools(bools: &[bool]) -> Self {
        let mut code = Self::zeros(bools.len());
        for (i, &b) in bools.iter().enumerate() {
            if b {
                code.set(i);
            }
        }
        code
    }

    /// Parse a string of `0`/`1` characters.
    pub fn from_bit_str(s: &str) -> Result<Self> {
        let bools = s
            .chars()
            .map(|c| match c {
                '0' => Ok(false),
                '1' => Ok(true),
                other => Err(Error::InvalidConfig(format!(
                    "hash code strings may only contain 0 and 1, found {other:?}"
                ))),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::from_bools(&bools))
    }

    pub fn bit_length(&self) -> usize {
        self.bits
    }

    pub fn bit(&self, i: usize) -> bool {
        debug_assert!(i < self.bits);
        self.words[i / 64] & (1u64 << (63 - i % 64)) != 0
    }

    pub(crate) fn set(&mut self, i: usize) {
        debug_assert!(i < self.bits);
        self.words[i / 64] |= 1u64 << (63 - i % 64);
    }

    /// Number of differing bits. Codes of different lengths compare over the
    /// shorter prefix; the indexes never mix lengths.
    pub fn hamming(&self, other: &HashCode) -> u32 {
        self.words
            .iter()
            .zip(other.words.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }

    pub fn count_ones(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    pub fn to_bools(&self) -> Vec<bool> {
        (0..self.bits).map(|i| self.bit(i)).collect()
    }
}

impl fmt::Display for HashCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..self.bits {
            f.write_str(if self.bit(i) { "1" } else { "0" })?;
        }
        Ok(())
    }
}

impl fmt::Debug for HashCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashCode({self})")
    }
}

// Serialized as its bit string so codes can key JSON maps.
#[cfg(feature = "persistence")]
impl serde::Serialize for HashCode {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

#[cfg(feature = "persistence")]
impl<'de> serde::Deserialize<'de> for HashCode {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bits = <String as serde::Deserialize>::deserialize(deserializer)?;
        HashCode::from_bit_str(&bits).map_err(serde::de::Error::custom)
    }
}

/// Maps a descriptor vector to a fixed-length [`HashCode`].
///
/// Implementations must be pure: the same vector always yields the same code
/// for a given set of trained parameters.
pub trait LshFunctor: Send + Sync + fmt::Debug {
    /// Input dimensionality.
    fn dim(&self) -> usize;

    /// Number of bits in every produced code.
    fn bit_length(&self) -> usize;

    fn hash(&self, vector: ArrayView1<f32>) -> Result<HashCode>;
}

/// Sign-of-projection (hyperplane) LSH.
///
/// Bit `i` is set when `<v - mean, p_i> >= 0`, where `p_i` is row `i` of the
/// projection matrix. The parameters are fixed once constructed; they are
/// expected to be trained offline and supplied via
/// [`HyperplaneFunctor::from_parameters`], or drawn from a seeded Gaussian for
/// plain random-hyperplane hashing.
#[derive(Debug, Clone)]
#[cfg_attr(
    feature = "persistence",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct HyperplaneFunctor {
    projections: Array2<f32>,
    mean: Option<Array1<f32>>,
}

impl HyperplaneFunctor {
    /// Random Gaussian hyperplanes of dimension `dim`, one per bit.
    pub fn random(dim: usize, bit_length: usize, rng: &mut impl Rng) -> Result<Self> {
        if dim == 0 {
            return Err(Error::InvalidConfig("dimension must be greater than 0".into()));
        }
        if bit_length == 0 {
            return Err(Error::InvalidConfig("bit length must be greater than 0".into()));
        }
        let projections =
            Array2::from_shape_fn((bit_length, dim), |_| rng.sample::<f32, _>(StandardNormal));
        Ok(Self {
            projections,
            mean: None,
        })
    }

    /// Use trained parameters: a `bits x dim` projection matrix and an optional
    /// centering vector of length `dim`.
    pub fn from_parameters(projections: Array2<f32>, mean: Option<Array1<f32>>) -> Result<Self> {
        let (bits, dim) = projections.dim();
        if bits == 0 || dim == 0 {
            return Err(Error::InvalidConfig(format!(
                "projection matrix must be non-empty, got {bits}x{dim}"
            )));
        }
        if let Some(m) = &mean {
            if m.len() != dim {
                return Err(Error::DimensionMismatch {
                    expected: dim,
                    got: m.len(),
                });
            }
        }
        Ok(Self { projections, mean })
    }

    pub fn projections(&self) -> &Array2<f32> {
        &self.projections
    }

    pub fn mean(&self) -> Option<&Array1<f32>> {
        self.mean.as_ref()
    }
}

impl LshFunctor for HyperplaneFunctor {
    fn dim(&self) -> usize {
        self.projections.ncols()
    }

    fn bit_length(&self) -> usize {
        self.projections.nrows()
    }

    fn hash(&self, vector: ArrayView1<f32>) -> Result<HashCode> {
        if vector.len() != self.dim() {
            return Err(Error::DimensionMismatch {
                expected: self.dim(),
                got: vector.len(),
            });
        }
        let dots = match &self.mean {
            Some(mean) => self.projections.dot(&(&vector - mean)),
            None => self.projections.dot(&vector),
        };
        let mut code = HashCode::zeros(self.bit_length());
        for (i, &d) in dots.iter().enumerate() {
            if d >= 0.0 {
                code.set(i);
            }
        }
        Ok(code)
    }
}
