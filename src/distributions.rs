//! Diagonal Gaussian distributions over the latent space.
//!
//! Both the target `T` and the proposal `P` of a coding call are [`DiagonalGaussian`]s.
//! Coders mostly operate on contiguous ranges of dimensions, which are represented by the
//! borrowed view [`GaussianSlice`].

use core::ops::Range;

use crate::InvalidDistributionError;

/// A multivariate normal distribution with independent dimensions.
///
/// The constructor guarantees that there is at least one dimension, that `means` and
/// `scales` have the same length, that all means are finite, and that all scales are
/// finite and strictly positive.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagonalGaussian {
    means: Vec<f64>,
    scales: Vec<f64>,
}

impl DiagonalGaussian {
    pub fn new(means: Vec<f64>, scales: Vec<f64>) -> Result<Self, InvalidDistributionError> {
        if means.is_empty() {
            return Err(InvalidDistributionError::Empty);
        }
        if means.len() != scales.len() {
            return Err(InvalidDistributionError::LengthMismatch {
                expected: means.len(),
                actual: scales.len(),
            });
        }
        if let Some((index, &value)) = means.iter().enumerate().find(|(_, m)| !m.is_finite()) {
            return Err(InvalidDistributionError::NonFiniteMean { index, value });
        }
        if let Some((index, &value)) = scales
            .iter()
            .enumerate()
            .find(|(_, &s)| !(s.is_finite() && s > 0.0))
        {
            return Err(InvalidDistributionError::NonPositiveScale { index, value });
        }

        Ok(Self { means, scales })
    }

    /// Standard normal distribution in `dim` dimensions.
    ///
    /// # Panics
    ///
    /// Panics if `dim == 0`.
    pub fn standard(dim: usize) -> Self {
        assert!(dim > 0, "a distribution needs at least one dimension");
        Self {
            means: vec![0.0; dim],
            scales: vec![1.0; dim],
        }
    }

    #[inline(always)]
    pub fn dim(&self) -> usize {
        self.means.len()
    }

    pub fn means(&self) -> &[f64] {
        &self.means
    }

    pub fn scales(&self) -> &[f64] {
        &self.scales
    }

    /// Borrowed view of the dimensions in `range`.
    ///
    /// # Panics
    ///
    /// Panics if `range` is out of bounds.
    pub fn slice(&self, range: Range<usize>) -> GaussianSlice<'_> {
        GaussianSlice {
            means: &self.means[range.clone()],
            scales: &self.scales[range],
        }
    }

    pub fn as_slice(&self) -> GaussianSlice<'_> {
        GaussianSlice {
            means: &self.means,
            scales: &self.scales,
        }
    }

    /// Returns an error unless `other` lives in the same space as `self`.
    pub fn check_compatible(&self, other: &Self) -> Result<(), InvalidDistributionError> {
        if self.dim() == other.dim() {
            Ok(())
        } else {
            Err(InvalidDistributionError::LengthMismatch {
                expected: self.dim(),
                actual: other.dim(),
            })
        }
    }

    /// `KL(self || proposal)` for each dimension separately, in nats.
    pub fn per_dimension_kl(
        &self,
        proposal: &Self,
    ) -> Result<Vec<f64>, InvalidDistributionError> {
        self.check_compatible(proposal)?;
        Ok(self.as_slice().per_dimension_kl(proposal.as_slice()).collect())
    }

    /// `KL(self || proposal)` in nats.
    pub fn kl_divergence(&self, proposal: &Self) -> Result<f64, InvalidDistributionError> {
        self.check_compatible(proposal)?;
        Ok(self.as_slice().kl_divergence(proposal.as_slice()))
    }
}

/// A contiguous range of dimensions of a [`DiagonalGaussian`].
#[derive(Debug, Clone, Copy)]
pub struct GaussianSlice<'a> {
    means: &'a [f64],
    scales: &'a [f64],
}

impl<'a> GaussianSlice<'a> {
    #[inline(always)]
    pub fn dim(&self) -> usize {
        self.means.len()
    }

    pub fn means(&self) -> &'a [f64] {
        self.means
    }

    pub fn scales(&self) -> &'a [f64] {
        self.scales
    }

    pub fn per_dimension_kl(
        self,
        proposal: GaussianSlice<'a>,
    ) -> impl Iterator<Item = f64> + ExactSizeIterator + 'a {
        self.means
            .iter()
            .zip(self.scales)
            .zip(proposal.means.iter().zip(proposal.scales))
            .map(|((&mt, &st), (&mp, &sp))| normal_kl(mt, st, mp, sp))
    }

    pub fn kl_divergence(self, proposal: GaussianSlice<'a>) -> f64 {
        clamp_finite(self.per_dimension_kl(proposal).sum())
    }

    /// Ratios `σ_T² / σ_P²` of the target variance (`self`) to the proposal variance.
    pub fn variance_ratios(
        self,
        proposal: GaussianSlice<'a>,
    ) -> impl Iterator<Item = f64> + ExactSizeIterator + 'a {
        self.scales
            .iter()
            .zip(proposal.scales)
            .map(|(&st, &sp)| clamp_finite((st / sp) * (st / sp)))
    }

    /// `ln(density_self(x) / density_proposal(x))`.
    ///
    /// The normalization constants `√(2π)` cancel, so this is a difference of two
    /// quadratic forms plus the log ratio of the scales. The result may be `-∞` for points
    /// far outside the bulk of a narrow target; callers clamp it.
    pub fn log_importance_ratio(self, proposal: GaussianSlice<'a>, x: &[f64]) -> f64 {
        self.importance_ratio(proposal).eval(x)
    }

    /// Prepares repeated evaluations of [`log_importance_ratio`](Self::log_importance_ratio)
    /// against the same proposal.
    pub fn importance_ratio(self, proposal: GaussianSlice<'a>) -> LogImportanceRatio<'a> {
        let log_scale_ratio = self
            .scales
            .iter()
            .zip(proposal.scales)
            .map(|(&st, &sp)| (sp / st).ln())
            .sum();
        LogImportanceRatio {
            target: self,
            proposal,
            log_scale_ratio,
        }
    }

    /// `sup_x ln(density_self(x) / density_proposal(x))`, or `+∞` if the ratio is
    /// unbounded (which happens whenever some target scale is at least as large as the
    /// corresponding proposal scale, unless the means coincide and the scales are equal).
    pub fn log_importance_ratio_sup(self, proposal: GaussianSlice<'_>) -> f64 {
        let mut acc = 0.0;
        for ((&mt, &st), (&mp, &sp)) in self
            .means
            .iter()
            .zip(self.scales)
            .zip(proposal.means.iter().zip(proposal.scales))
        {
            let ratio = (st / sp) * (st / sp);
            if ratio < 1.0 {
                let delta = (mt - mp) / sp;
                acc += (sp / st).ln() + 0.5 * delta * delta / (1.0 - ratio);
            } else if ratio > 1.0 || mt != mp {
                return f64::INFINITY;
            }
        }
        acc
    }

    /// Writes `μ + σ·z` into `out`, i.e., maps standard normal draws into this
    /// distribution.
    ///
    /// Both the encoder and the decoder reconstruct candidates through this function, so
    /// it must not be "optimized" in a way that changes rounding (e.g., by fusing the
    /// multiply-add).
    #[inline]
    pub fn transform_standard(self, z: &[f64], out: &mut Vec<f64>) {
        debug_assert_eq!(z.len(), self.dim());
        out.clear();
        out.extend(
            z.iter()
                .zip(self.means.iter().zip(self.scales))
                .map(|(&zi, (&m, &s))| m + s * zi),
        );
    }
}

/// `x ↦ ln(density_T(x) / density_P(x))` for a fixed pair of slices.
#[derive(Debug, Clone, Copy)]
pub struct LogImportanceRatio<'a> {
    target: GaussianSlice<'a>,
    proposal: GaussianSlice<'a>,
    log_scale_ratio: f64,
}

impl LogImportanceRatio<'_> {
    pub fn eval(&self, x: &[f64]) -> f64 {
        debug_assert_eq!(x.len(), self.target.dim());
        let mut acc = self.log_scale_ratio;
        for (((&xi, &mt), &st), (&mp, &sp)) in x
            .iter()
            .zip(self.target.means)
            .zip(self.target.scales)
            .zip(self.proposal.means.iter().zip(self.proposal.scales))
        {
            let zt = (xi - mt) / st;
            let zp = (xi - mp) / sp;
            acc += 0.5 * (zp * zp - zt * zt);
        }
        acc
    }
}

/// `KL(N(mt, st²) || N(mp, sp²))` in nats.
#[inline]
pub fn normal_kl(mt: f64, st: f64, mp: f64, sp: f64) -> f64 {
    let delta = mt - mp;
    let kl = (sp / st).ln() + (st * st + delta * delta) / (2.0 * sp * sp) - 0.5;
    // Rounding can make the KL of (nearly) identical distributions slightly negative.
    clamp_finite(kl.max(0.0))
}

/// Maps `±∞` to `±f64::MAX` and leaves everything else (including NaN) untouched.
#[inline(always)]
pub(crate) fn clamp_finite(x: f64) -> f64 {
    x.clamp(f64::MIN, f64::MAX)
}
