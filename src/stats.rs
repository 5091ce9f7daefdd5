//! Long-lived statistics shared by all coders that have to agree on a coding scheme.
//!
//! A [`VarianceRatioStats`] object tracks, for every latent dimension, an exponential
//! moving average (EMA) of the variance ratio `σ_T² / σ_P²` and of the KL divergence
//! `KL(T || P)` across many batches. The rejection coder sizes its acceptance bounds from
//! the variance ratios, and both coders derive their partition plans from the expected
//! KLs. Since the decoder never sees a target distribution, these statistics are the only
//! way in which the encoder and the decoder can agree on a plan.
//!
//! Statistics are never updated implicitly. The only entry points that mutate them are
//! [`VarianceRatioStats::update`], [`VarianceRatioStats::update_variance_ratios`] and
//! [`VarianceRatioStats::merge`]. Only the first and the last of these can change a
//! partition plan. Concurrent updates are serialized by an internal lock, so no update is
//! ever lost.

use std::sync::{PoisonError, RwLock};

use tracing::debug;

use crate::{ConfigurationError, DiagonalGaussian, InvalidDistributionError};

/// Default EMA decay factor.
pub const DEFAULT_DECAY: f64 = 0.9;

/// Per-dimension EMA of variance ratios and KL divergences.
#[derive(Debug)]
pub struct VarianceRatioStats {
    decay: f64,
    state: RwLock<StatsState>,
}

#[derive(Debug, Clone)]
struct StatsState {
    ratios: Vec<f64>,

    /// Raw (not bias-corrected) EMA of the per-dimension KL, starting at zero.
    kls: Vec<f64>,

    /// Number of EMA steps that have been applied to each dimension.
    counts: Vec<u64>,

    generation: u64,
}

/// An immutable copy of the statistics, taken at the start of a coding call.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    ratios: Vec<f64>,
    expected_kls: Vec<f64>,
    generation: u64,
    observed: bool,
}

impl StatsSnapshot {
    pub fn dim(&self) -> usize {
        self.ratios.len()
    }

    /// EMA of `σ_T² / σ_P²` per dimension. Always strictly positive.
    pub fn ratios(&self) -> &[f64] {
        &self.ratios
    }

    /// Bias-corrected EMA of the per-dimension KL in nats (zero before the first update).
    pub fn expected_kls(&self) -> Vec<f64> {
        self.expected_kls.clone()
    }

    /// Increases by one with every update of the expected KLs (but not with
    /// [`VarianceRatioStats::update_variance_ratios`]).
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether any KL has ever been observed. Plans derived from unobserved statistics
    /// put all dimensions into a single partition.
    pub fn has_observations(&self) -> bool {
        self.observed
    }
}

impl VarianceRatioStats {
    /// Creates statistics for `dim` dimensions with all variance ratios set to one.
    pub fn new(dim: usize, decay: f64) -> Result<Self, ConfigurationError> {
        if dim == 0 {
            return Err(ConfigurationError::EmptyDimension);
        }
        if !(decay > 0.0 && decay < 1.0) {
            return Err(ConfigurationError::InvalidDecay(decay));
        }

        Ok(Self {
            decay,
            state: RwLock::new(StatsState {
                ratios: vec![1.0; dim],
                kls: vec![0.0; dim],
                counts: vec![0; dim],
                generation: 0,
            }),
        })
    }

    pub fn with_default_decay(dim: usize) -> Result<Self, ConfigurationError> {
        Self::new(dim, DEFAULT_DECAY)
    }

    pub fn decay(&self) -> f64 {
        self.decay
    }

    pub fn dim(&self) -> usize {
        self.read().ratios.len()
    }

    pub fn generation(&self) -> u64 {
        self.read().generation
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let state = self.read();
        let expected_kls = state
            .kls
            .iter()
            .zip(&state.counts)
            .map(|(&kl, &count)| self.debias(kl, count))
            .collect();
        StatsSnapshot {
            ratios: state.ratios.clone(),
            expected_kls,
            generation: state.generation,
            observed: state.counts.iter().any(|&count| count != 0),
        }
    }

    /// Applies one EMA step with the batch means of the variance ratios and KLs of
    /// `targets` relative to `proposals`.
    ///
    /// This changes the expected KLs and therefore, in general, the partition plan. Encoder
    /// and decoder must apply the same sequence of updates. An empty batch leaves the
    /// statistics untouched.
    pub fn update(
        &self,
        targets: &[DiagonalGaussian],
        proposals: &[DiagonalGaussian],
    ) -> Result<(), InvalidDistributionError> {
        let Some((ratio_means, kl_means)) = self.batch_means(targets, proposals)? else {
            return Ok(());
        };

        let decay = self.decay;
        let mut state = self.write();
        let StatsState {
            ratios,
            kls,
            counts,
            generation,
        } = &mut *state;
        for i in 0..ratios.len() {
            ratios[i] = ema_ratio(decay, ratios[i], ratio_means[i]);
            kls[i] = decay * kls[i] + (1.0 - decay) * kl_means[i];
            counts[i] += 1;
        }
        *generation += 1;

        debug!(
            batch_size = targets.len(),
            dim = ratios.len(),
            generation = *generation,
            "updated variance ratio statistics"
        );
        Ok(())
    }

    /// Applies one EMA step to the variance ratios only.
    ///
    /// The variance ratios only size the rejection bounds, which decoding never needs, so
    /// this leaves the expected KLs, the partition plan, and the generation counter
    /// untouched. Encodings produced before the update still decode afterwards.
    pub fn update_variance_ratios(
        &self,
        targets: &[DiagonalGaussian],
        proposals: &[DiagonalGaussian],
    ) -> Result<(), InvalidDistributionError> {
        let Some((ratio_means, _)) = self.batch_means(targets, proposals)? else {
            return Ok(());
        };

        let decay = self.decay;
        let mut state = self.write();
        for (ratio, &mean) in state.ratios.iter_mut().zip(&ratio_means) {
            *ratio = ema_ratio(decay, *ratio, mean);
        }

        debug!(
            batch_size = targets.len(),
            generation = state.generation,
            "updated variance ratios"
        );
        Ok(())
    }

    /// Per-dimension batch means of the variance ratios and KLs, or `None` for an empty
    /// batch.
    fn batch_means(
        &self,
        targets: &[DiagonalGaussian],
        proposals: &[DiagonalGaussian],
    ) -> Result<Option<(Vec<f64>, Vec<f64>)>, InvalidDistributionError> {
        if targets.len() != proposals.len() {
            return Err(InvalidDistributionError::BatchMismatch {
                targets: targets.len(),
                proposals: proposals.len(),
            });
        }
        if targets.is_empty() {
            return Ok(None);
        }

        let dim = self.dim();
        let mut ratio_sums = vec![0.0; dim];
        let mut kl_sums = vec![0.0; dim];
        for (target, proposal) in targets.iter().zip(proposals) {
            for d in [target, proposal] {
                if d.dim() != dim {
                    return Err(InvalidDistributionError::LengthMismatch {
                        expected: dim,
                        actual: d.dim(),
                    });
                }
            }
            let (t, p) = (target.as_slice(), proposal.as_slice());
            for ((sum, ratio), (kl_sum, kl)) in ratio_sums
                .iter_mut()
                .zip(t.variance_ratios(p))
                .zip(kl_sums.iter_mut().zip(t.per_dimension_kl(p)))
            {
                *sum += ratio;
                *kl_sum += kl;
            }
        }

        let batch_size = targets.len() as f64;
        for sum in ratio_sums.iter_mut().chain(kl_sums.iter_mut()) {
            *sum /= batch_size;
        }
        Ok(Some((ratio_sums, kl_sums)))
    }

    /// Folds the statistics gathered by `other` into `self`.
    ///
    /// Both objects must have the same dimension and decay factor. Each dimension is
    /// averaged weighted by the number of updates it has seen on either side, so merging
    /// is commutative: `a.merge(&b)` and `b.merge(&a)` leave `a` and `b` in the same
    /// state (up to the generation counter).
    pub fn merge(&self, other: &VarianceRatioStats) -> Result<(), ConfigurationError> {
        if other.decay != self.decay {
            return Err(ConfigurationError::InvalidDecay(other.decay));
        }
        let theirs = other.read().clone();

        let decay = self.decay;
        let mut state = self.write();
        if theirs.ratios.len() != state.ratios.len() {
            return Err(ConfigurationError::InvalidParameter {
                name: "dim",
                reason: "cannot merge statistics of different dimensions",
            });
        }

        for i in 0..state.ratios.len() {
            let (n1, n2) = (state.counts[i], theirs.counts[i]);
            let n = n1 + n2;
            if n == 0 {
                continue;
            }
            let (w1, w2) = (n1 as f64 / n as f64, n2 as f64 / n as f64);
            state.ratios[i] = w1 * state.ratios[i] + w2 * theirs.ratios[i];

            let kl = w1 * self.debias(state.kls[i], n1) + w2 * self.debias(theirs.kls[i], n2);
            state.kls[i] = kl * (1.0 - decay.powf(n as f64));
            state.counts[i] = n;
        }
        state.generation += 1;
        Ok(())
    }

    #[inline]
    fn debias(&self, raw: f64, count: u64) -> f64 {
        if count == 0 {
            0.0
        } else {
            raw / (1.0 - self.decay.powf(count as f64))
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, StatsState> {
        // The state is only ever replaced field by field with valid values, so a panic in
        // another thread cannot leave it inconsistent.
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, StatsState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A positive ratio can still underflow in the EMA; the result stays strictly positive.
#[inline(always)]
fn ema_ratio(decay: f64, old: f64, batch_mean: f64) -> f64 {
    (decay * old + (1.0 - decay) * batch_mean).max(f64::MIN_POSITIVE)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use approx::assert_abs_diff_eq;

    fn pair(mean: f64, scale: f64, dim: usize) -> (DiagonalGaussian, DiagonalGaussian) {
        (
            DiagonalGaussian::new(vec![mean; dim], vec![scale; dim]).unwrap(),
            DiagonalGaussian::standard(dim),
        )
    }

    #[test]
    fn construction() {
        assert_eq!(
            VarianceRatioStats::new(0, 0.5).unwrap_err(),
            ConfigurationError::EmptyDimension
        );
        for decay in [0.0, 1.0, -0.1, f64::NAN] {
            assert!(VarianceRatioStats::new(3, decay).is_err());
        }

        let stats = VarianceRatioStats::with_default_decay(3).unwrap();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.ratios(), &[1.0, 1.0, 1.0]);
        assert_eq!(snapshot.expected_kls(), vec![0.0, 0.0, 0.0]);
        assert_eq!(snapshot.generation(), 0);
    }

    #[test]
    fn ema_of_batch_means() {
        let stats = VarianceRatioStats::new(1, 0.9).unwrap();
        let (t1, p1) = pair(5.0, 0.01, 1);
        let (t2, p2) = pair(-5.1, 0.01, 1);
        let batch_t = [t1.clone(), t2.clone()];
        let batch_p = [p1.clone(), p2.clone()];

        stats.update(&batch_t, &batch_p).unwrap();
        stats.update(&batch_t, &batch_p).unwrap();

        let expected_ratio = 0.81 * 1.0 + 0.19 * 1e-4;
        let snapshot = stats.snapshot();
        assert_abs_diff_eq!(snapshot.ratios()[0], expected_ratio, epsilon = 1e-12);
        assert_eq!(snapshot.generation(), 2);

        // Bias correction recovers the batch mean exactly for a stationary input.
        let batch_kl = (t1.kl_divergence(&p1).unwrap() + t2.kl_divergence(&p2).unwrap()) / 2.0;
        assert_abs_diff_eq!(snapshot.expected_kls()[0], batch_kl, epsilon = 1e-9);
    }

    #[test]
    fn ratio_updates_leave_the_plan_inputs_alone() {
        let stats = VarianceRatioStats::new(2, 0.5).unwrap();
        let (t, p) = pair(1.0, 0.5, 2);
        stats.update(&[t.clone()], &[p.clone()]).unwrap();
        let before = stats.snapshot();
        assert!(before.has_observations());

        let (t2, p2) = pair(-2.0, 0.1, 2);
        stats.update_variance_ratios(&[t2], &[p2]).unwrap();
        let after = stats.snapshot();

        assert_eq!(after.generation(), before.generation());
        assert_eq!(after.expected_kls(), before.expected_kls());
        for (&old, &new) in before.ratios().iter().zip(after.ratios()) {
            assert_abs_diff_eq!(new, 0.5 * old + 0.5 * 0.01, epsilon = 1e-12);
        }

        assert!(!VarianceRatioStats::new(2, 0.5).unwrap().snapshot().has_observations());
        assert!(stats.update_variance_ratios(&[t], &[]).is_err());
    }

    #[test]
    fn rejects_mismatched_batches() {
        let stats = VarianceRatioStats::new(2, 0.5).unwrap();
        let (t, p) = pair(0.0, 1.0, 2);
        assert_eq!(
            stats.update(&[t.clone()], &[]),
            Err(InvalidDistributionError::BatchMismatch {
                targets: 1,
                proposals: 0
            })
        );
        let (t3, _) = pair(0.0, 1.0, 3);
        assert_eq!(
            stats.update(&[t3], &[p.clone()]),
            Err(InvalidDistributionError::LengthMismatch {
                expected: 2,
                actual: 3
            })
        );
        assert_eq!(stats.generation(), 0);
        stats.update(&[], &[]).unwrap();
        assert_eq!(stats.generation(), 0);
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let stats = Arc::new(VarianceRatioStats::new(4, 0.99).unwrap());
        let (t, p) = pair(0.3, 0.5, 4);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let stats = Arc::clone(&stats);
                let (t, p) = (t.clone(), p.clone());
                scope.spawn(move || {
                    for _ in 0..25 {
                        stats.update(&[t.clone()], &[p.clone()]).unwrap();
                    }
                });
            }
        });

        assert_eq!(stats.generation(), 200);
        let expected = 1.0 * 0.99f64.powi(200) + 0.25 * (1.0 - 0.99f64.powi(200));
        for &ratio in stats.snapshot().ratios() {
            assert_abs_diff_eq!(ratio, expected, epsilon = 1e-9);
        }
    }

    #[test]
    fn merge_is_commutative() {
        let make = || VarianceRatioStats::new(2, 0.8).unwrap();
        let (a, b) = (make(), make());
        let (c, d) = (make(), make());

        let (t1, p1) = pair(1.0, 0.2, 2);
        let (t2, p2) = pair(-0.5, 0.7, 2);
        for s in [&a, &c] {
            s.update(&[t1.clone()], &[p1.clone()]).unwrap();
        }
        for s in [&b, &d] {
            s.update(&[t2.clone()], &[p2.clone()]).unwrap();
            s.update(&[t2.clone()], &[p2.clone()]).unwrap();
        }

        a.merge(&b).unwrap();
        d.merge(&c).unwrap();

        let (sa, sd) = (a.snapshot(), d.snapshot());
        for i in 0..2 {
            assert_abs_diff_eq!(sa.ratios()[i], sd.ratios()[i], epsilon = 1e-12);
            assert_abs_diff_eq!(sa.expected_kls()[i], sd.expected_kls()[i], epsilon = 1e-12);
        }

        // Merging with an untouched object is the identity.
        let fresh = make();
        let before = c.snapshot();
        c.merge(&fresh).unwrap();
        assert_eq!(c.snapshot().ratios(), before.ratios());

        assert!(a.merge(&VarianceRatioStats::new(3, 0.8).unwrap()).is_err());
        assert!(a.merge(&VarianceRatioStats::new(2, 0.5).unwrap()).is_err());
    }
}
