//! Splitting the latent space into chunks of bounded KL divergence.
//!
//! Coding cost (and, for rejection sampling, run time) grows exponentially with the KL
//! divergence that a single coding step has to bridge. A [`PartitionPlanner`] therefore
//! walks the dimensions from left to right and greedily groups them into contiguous
//! [`Partition`]s whose KL stays below a budget. A single dimension that exceeds the budget
//! on its own cannot be split further; it becomes its own partition and is flagged as
//! over budget.
//!
//! # Example
//!
//! ```
//! use rec_coder::{DiagonalGaussian, PartitionPlanner};
//!
//! let target = DiagonalGaussian::new(vec![0.5, 5.0, 0.1, 0.2], vec![0.5, 0.01, 0.9, 0.9]).unwrap();
//! let proposal = DiagonalGaussian::standard(4);
//!
//! let plan = PartitionPlanner::new(2.0).unwrap().plan(&target, &proposal).unwrap();
//! let ranges = plan.iter().map(|p| p.range()).collect::<Vec<_>>();
//! assert_eq!(ranges, [0..1, 1..2, 2..4]);
//! assert!(plan.partitions()[1].is_over_budget());
//! ```

use core::ops::Range;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::{stats::StatsSnapshot, CodingError, ConfigurationError, DiagonalGaussian};

/// A contiguous range of dimensions `start..end` together with its KL divergence.
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    start: usize,
    end: usize,
    kl: f64,
    over_budget: bool,
}

impl Partition {
    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.end
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// KL divergence over the partition's dimensions, in nats.
    pub fn kl(&self) -> f64 {
        self.kl
    }

    /// Whether this is a single dimension whose KL alone exceeds the budget.
    pub fn is_over_budget(&self) -> bool {
        self.over_budget
    }
}

/// An ordered sequence of [`Partition`]s that covers every dimension exactly once.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionPlan {
    partitions: Vec<Partition>,
    budget: f64,
}

impl PartitionPlan {
    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn iter(&self) -> core::slice::Iter<'_, Partition> {
        self.partitions.iter()
    }

    /// Number of partitions (and therefore of code indices).
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    /// Total number of dimensions covered.
    pub fn dim(&self) -> usize {
        self.partitions.last().map_or(0, Partition::end)
    }

    pub fn budget(&self) -> f64 {
        self.budget
    }

    pub fn total_kl(&self) -> f64 {
        self.partitions.iter().map(Partition::kl).sum()
    }

    pub fn over_budget_count(&self) -> usize {
        self.partitions.iter().filter(|p| p.over_budget).count()
    }
}

impl<'a> IntoIterator for &'a PartitionPlan {
    type Item = &'a Partition;
    type IntoIter = core::slice::Iter<'a, Partition>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Greedy left-to-right partitioning under a KL budget (in nats).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PartitionPlanner {
    budget: f64,
}

impl PartitionPlanner {
    pub fn new(budget: f64) -> Result<Self, ConfigurationError> {
        if budget.is_finite() && budget > 0.0 {
            Ok(Self { budget })
        } else {
            Err(ConfigurationError::InvalidBudget(budget))
        }
    }

    pub fn budget(&self) -> f64 {
        self.budget
    }

    /// Partitions the dimensions of `target` and `proposal` by their per-dimension KL.
    pub fn plan(
        &self,
        target: &DiagonalGaussian,
        proposal: &DiagonalGaussian,
    ) -> Result<PartitionPlan, CodingError> {
        let kls = target.per_dimension_kl(proposal)?;
        Ok(self.plan_from_kl(&kls)?)
    }

    /// Partitions dimensions given their (expected) KL divergences in nats.
    pub fn plan_from_kl(&self, kls: &[f64]) -> Result<PartitionPlan, ConfigurationError> {
        if kls.is_empty() {
            return Err(ConfigurationError::EmptyDimension);
        }

        let mut partitions = Vec::new();
        let mut start = 0;
        let mut accumulated = 0.0;

        for (i, &kl) in kls.iter().enumerate() {
            if kl > self.budget {
                if start != i {
                    partitions.push(Partition {
                        start,
                        end: i,
                        kl: accumulated,
                        over_budget: false,
                    });
                }
                partitions.push(Partition {
                    start: i,
                    end: i + 1,
                    kl,
                    over_budget: true,
                });
                start = i + 1;
                accumulated = 0.0;
            } else if accumulated + kl > self.budget {
                partitions.push(Partition {
                    start,
                    end: i,
                    kl: accumulated,
                    over_budget: false,
                });
                start = i;
                accumulated = kl;
            } else {
                accumulated += kl;
            }
        }

        if start != kls.len() {
            partitions.push(Partition {
                start,
                end: kls.len(),
                kl: accumulated,
                over_budget: false,
            });
        }

        Ok(PartitionPlan {
            partitions,
            budget: self.budget,
        })
    }
}

/// Caches the plan derived from shared statistics until the dimension, the budget, or the
/// statistics change.
#[derive(Debug, Clone, Default)]
pub(crate) struct PlanCache {
    key: Option<(usize, u64, u64)>,
    plan: Option<Arc<PartitionPlan>>,
}

impl PlanCache {
    pub(crate) fn get_or_plan(
        &mut self,
        planner: &PartitionPlanner,
        snapshot: &StatsSnapshot,
    ) -> Result<Arc<PartitionPlan>, ConfigurationError> {
        let key = (
            snapshot.dim(),
            planner.budget().to_bits(),
            snapshot.generation(),
        );
        if let (Some(cached_key), Some(plan)) = (self.key, &self.plan) {
            if cached_key == key {
                return Ok(Arc::clone(plan));
            }
        }

        let plan = Arc::new(planner.plan_from_kl(&snapshot.expected_kls())?);
        debug!(
            dim = key.0,
            budget = planner.budget(),
            generation = key.2,
            partitions = plan.len(),
            over_budget = plan.over_budget_count(),
            "recomputed partition plan"
        );
        if !snapshot.has_observations() {
            warn!(
                dim = key.0,
                "statistics have never been updated; coding all dimensions as one partition"
            );
        }
        self.key = Some(key);
        self.plan = Some(Arc::clone(&plan));
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_abs_diff_eq;
    use rand::{Rng, SeedableRng};
    use rand_pcg::Pcg64Mcg;

    use crate::VarianceRatioStats;

    fn check_invariants(plan: &PartitionPlan, kls: &[f64]) {
        let mut expected_start = 0;
        for partition in plan {
            assert_eq!(partition.start(), expected_start);
            assert!(partition.len() >= 1);
            expected_start = partition.end();

            let kl = kls[partition.range()].iter().sum::<f64>();
            assert_abs_diff_eq!(partition.kl(), kl, epsilon = 1e-9);
            if partition.is_over_budget() {
                assert_eq!(partition.len(), 1);
                assert!(partition.kl() > plan.budget());
            } else {
                assert!(partition.kl() <= plan.budget());
            }
        }
        assert_eq!(expected_start, kls.len());
        assert_eq!(plan.dim(), kls.len());
    }

    #[test]
    fn rejects_invalid_configuration() {
        assert_eq!(
            PartitionPlanner::new(0.0),
            Err(ConfigurationError::InvalidBudget(0.0))
        );
        assert!(PartitionPlanner::new(-1.0).is_err());
        assert!(PartitionPlanner::new(f64::NAN).is_err());
        assert_eq!(
            PartitionPlanner::new(1.0).unwrap().plan_from_kl(&[]),
            Err(ConfigurationError::EmptyDimension)
        );
    }

    #[test]
    fn greedy_grouping() {
        let planner = PartitionPlanner::new(1.0).unwrap();
        let kls = [0.4, 0.5, 0.2, 0.9, 3.0, 0.0, 0.1, 1.0];
        let plan = planner.plan_from_kl(&kls).unwrap();
        let ranges = plan.iter().map(Partition::range).collect::<Vec<_>>();
        assert_eq!(ranges, [0..2, 2..3, 3..4, 4..5, 5..7, 7..8]);
        assert_eq!(plan.over_budget_count(), 1);
        check_invariants(&plan, &kls);
    }

    #[test]
    fn single_over_budget_dimension() {
        let target = DiagonalGaussian::new(vec![5.0], vec![0.01]).unwrap();
        let proposal = DiagonalGaussian::standard(1);
        let plan = PartitionPlanner::new(6.0)
            .unwrap()
            .plan(&target, &proposal)
            .unwrap();
        assert_eq!(plan.len(), 1);
        assert!(plan.partitions()[0].is_over_budget());
        assert!(plan.total_kl() > 12.5);
    }

    #[test]
    fn zero_kl_collapses_into_one_partition() {
        let plan = PartitionPlanner::new(0.5)
            .unwrap()
            .plan_from_kl(&[0.0; 17])
            .unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.partitions()[0].range(), 0..17);
    }

    #[test]
    fn random_plans_satisfy_invariants() {
        let mut rng = Pcg64Mcg::new(0x1234_5678);
        for _ in 0..200 {
            let dim = rng.gen_range(1..64);
            let budget = rng.gen_range(0.1..8.0);
            let means = (0..dim).map(|_| rng.gen_range(-3.0..3.0)).collect();
            let scales = (0..dim).map(|_| rng.gen_range(0.01..2.0)).collect();
            let target = DiagonalGaussian::new(means, scales).unwrap();
            let proposal = DiagonalGaussian::standard(dim);

            let plan = PartitionPlanner::new(budget)
                .unwrap()
                .plan(&target, &proposal)
                .unwrap();
            let kls = target.per_dimension_kl(&proposal).unwrap();
            check_invariants(&plan, &kls);
            assert_abs_diff_eq!(
                plan.total_kl(),
                target.kl_divergence(&proposal).unwrap(),
                epsilon = 1e-9 * plan.total_kl().max(1.0)
            );
        }
    }

    #[test]
    fn cache_tracks_stats_generation() {
        let stats = VarianceRatioStats::new(4, 0.5).unwrap();
        let planner = PartitionPlanner::new(1.0).unwrap();
        let mut cache = PlanCache::default();

        let first = cache.get_or_plan(&planner, &stats.snapshot()).unwrap();
        let again = cache.get_or_plan(&planner, &stats.snapshot()).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(first.len(), 1);

        let target = DiagonalGaussian::new(vec![2.0; 4], vec![0.5; 4]).unwrap();
        stats
            .update(&[target], &[DiagonalGaussian::standard(4)])
            .unwrap();
        let updated = cache.get_or_plan(&planner, &stats.snapshot()).unwrap();
        assert!(!Arc::ptr_eq(&first, &updated));
        assert_eq!(updated.len(), 4);
        assert_eq!(updated.over_budget_count(), 4);
    }
}
