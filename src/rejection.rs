//! Greedy relative entropy coding by bounded rejection sampling.
//!
//! For every partition `p` of the plan, the [`RejectionCoder`] scans the stream of
//! proposal candidates `x_0, x_1, …` keyed by `(seed, p)` and accepts the first `x_k` with
//!
//! ```text
//! u_k ≤ w(x_k) / M_p,    where w(x) = density_T(x) / density_P(x),
//! ```
//!
//! and `u_k` is the uniform variate with the same index. Only `k` is transmitted; the
//! decoder regenerates `x_k` from the shared stream without any acceptance test.
//!
//! # The Bound `M_p`
//!
//! The Gaussian likelihood ratio is unbounded whenever a target scale is not smaller than
//! the proposal scale, and astronomically large when it is much smaller. Rather than
//! using `sup_x w(x)`, the bound is sized from the partition's KL and from the long-run
//! variance ratios `r̄_i` kept in [`VarianceRatioStats`]:
//!
//! ```text
//! ln M_p = KL(T_p || P_p) + bound_slack · sqrt(Σ_i ½ (1 − r̄_i)²),
//! ```
//!
//! where the square root estimates the spread of `ln w` under the target. Draws with
//! `w(x) > M_p` are accepted with probability one (and counted in
//! [`CodingReport::clamped_weights`]), which trades a small, controlled bias for a bound
//! that does not depend on any single extreme example. `ln M_p` is clamped to `[0, 700]`.
//!
//! # Termination
//!
//! A partition is abandoned after [`CoderConfig::max_draws_per_partition`] draws; the
//! draw with the largest importance weight seen so far is then accepted ("forced
//! accept"). This is not an error. It is counted in [`CodingReport::forced_accepts`] and
//! logged.

use core::slice;
use std::{fmt::Debug, sync::Arc, time::Instant};

use tracing::{debug, trace, warn};

use crate::{
    check_deadline,
    codelength::CodelengthAccountant,
    distributions::{clamp_finite, GaussianSlice},
    partition::{PartitionPlan, PartitionPlanner, PlanCache},
    sampler::{pool::SamplerBufferPool, StreamKey},
    stats::StatsSnapshot,
    Coder, CoderConfig, CodingError, CodingReport, ConfigurationError, DiagonalGaussian,
    Encoding, InvalidDistributionError, VarianceRatioStats,
};

/// Largest value of `ln M_p`; keeps `exp(ln M_p)` representable.
pub const MAX_LOG_BOUND: f64 = 700.0;

pub struct RejectionCoder {
    config: CoderConfig,
    planner: PartitionPlanner,
    stats: Arc<VarianceRatioStats>,
    pool: SamplerBufferPool,
    plans: PlanCache,
    accountant: CodelengthAccountant,
}

impl RejectionCoder {
    pub fn new(
        config: CoderConfig,
        stats: Arc<VarianceRatioStats>,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;
        Ok(Self {
            planner: PartitionPlanner::new(config.kl_per_partition)?,
            pool: SamplerBufferPool::new(config.sampler_buffer_sizes),
            config,
            stats,
            plans: PlanCache::default(),
            accountant: CodelengthAccountant::universal(),
        })
    }

    pub fn config(&self) -> &CoderConfig {
        &self.config
    }

    pub fn stats(&self) -> &Arc<VarianceRatioStats> {
        &self.stats
    }

    fn prepare(
        &mut self,
        dim: usize,
    ) -> Result<(StatsSnapshot, Arc<PartitionPlan>), CodingError> {
        let snapshot = self.stats.snapshot();
        if snapshot.dim() != dim {
            return Err(InvalidDistributionError::LengthMismatch {
                expected: snapshot.dim(),
                actual: dim,
            }
            .into());
        }
        let plan = self.plans.get_or_plan(&self.planner, &snapshot)?;
        Ok((snapshot, plan))
    }
}

/// Outcome of the rejection loop in a single partition.
#[derive(Debug, Clone, Copy)]
struct Accepted {
    index: u64,
    log_weight: f64,
    draws: u64,
    clamped: u64,
    forced: bool,
}

/// `ln M_p` for a partition with KL `kl` (nats) and long-run variance ratios `ratios`.
pub fn log_bound(kl: f64, ratios: &[f64], slack: f64) -> f64 {
    let spread = ratios
        .iter()
        .map(|&r| 0.5 * (1.0 - r) * (1.0 - r))
        .sum::<f64>()
        .sqrt();
    let log_bound = kl + slack * spread;
    if log_bound.is_nan() {
        MAX_LOG_BOUND
    } else {
        log_bound.clamp(0.0, MAX_LOG_BOUND)
    }
}

impl RejectionCoder {
    /// Runs the rejection loop for one partition and leaves the accepted candidate in
    /// `candidate`.
    fn sample_partition(
        &mut self,
        key: StreamKey,
        target: GaussianSlice<'_>,
        proposal: GaussianSlice<'_>,
        log_bound: f64,
        candidate: &mut Vec<f64>,
    ) -> Accepted {
        let max_draws = self.config.max_draws_per_partition;
        let dim = target.dim();
        let weight = target.importance_ratio(proposal);

        let mut clamped = 0;
        let mut best = (0, f64::NEG_INFINITY);
        let mut stream = self.pool.stream(key, dim);

        for _ in 0..max_draws {
            let (index, z) = stream.next_candidate();
            proposal.transform_standard(z, candidate);

            let mut log_weight = weight.eval(candidate.as_slice());
            if log_weight.is_nan() {
                trace!(partition = key.partition, index, "importance weight is NaN");
                clamped += 1;
                log_weight = f64::MIN;
            } else {
                log_weight = clamp_finite(log_weight);
            }
            let excess = log_weight - log_bound;
            if excess > 0.0 {
                clamped += 1;
            }

            let (_, u) = stream.next_uniform();
            if u.ln() <= excess {
                return Accepted {
                    index,
                    log_weight,
                    draws: index + 1,
                    clamped,
                    forced: false,
                };
            }

            if log_weight > best.1 || index == 0 {
                best = (index, log_weight);
            }
        }

        let (index, log_weight) = best;
        let z = self.pool.candidate_at(key, dim, index);
        proposal.transform_standard(z, candidate);
        Accepted {
            index,
            log_weight,
            draws: max_draws,
            clamped,
            forced: true,
        }
    }
}

impl Coder for RejectionCoder {
    fn encode(
        &mut self,
        target: &DiagonalGaussian,
        proposal: &DiagonalGaussian,
        seed: u64,
        update_sampler: bool,
    ) -> Result<Encoding, CodingError> {
        target.check_compatible(proposal)?;
        let started = Instant::now();
        let (snapshot, plan) = self.prepare(target.dim())?;

        let mut report = CodingReport::default();
        let mut indices = Vec::with_capacity(plan.len());
        let mut sample = Vec::with_capacity(target.dim());
        let mut candidate = Vec::new();

        for (p, partition) in plan.iter().enumerate() {
            check_deadline(self.config.timeout, started, p)?;

            let range = partition.range();
            let t = target.slice(range.clone());
            let q = proposal.slice(range.clone());
            let kl = t.kl_divergence(q);
            let over_budget = kl > self.config.kl_per_partition;
            let log_bound = log_bound(kl, &snapshot.ratios()[range], self.config.bound_slack);

            let accepted =
                self.sample_partition(StreamKey::new(seed, p), t, q, log_bound, &mut candidate);

            debug!(
                partition = p,
                dims = partition.len(),
                kl,
                log_bound,
                index = accepted.index,
                draws = accepted.draws,
                over_budget,
                "rejection sampling finished"
            );
            if over_budget {
                report.over_budget_partitions += 1;
            }
            if accepted.forced {
                warn!(
                    partition = p,
                    kl,
                    max_draws = self.config.max_draws_per_partition,
                    "draw cap reached; accepting best candidate"
                );
                report.forced_accepts += 1;
            }
            report.clamped_weights += accepted.clamped;
            report.total_draws += accepted.draws;
            report.log_weight += accepted.log_weight;

            indices.push(accepted.index);
            sample.extend_from_slice(&candidate);
        }

        if update_sampler {
            self.stats
                .update_variance_ratios(slice::from_ref(target), slice::from_ref(proposal))?;
        }

        Ok(Encoding {
            indices,
            sample,
            report,
        })
    }

    fn decode(
        &mut self,
        proposal: &DiagonalGaussian,
        indices: &[u64],
        seed: u64,
    ) -> Result<Vec<f64>, CodingError> {
        let (_, plan) = self.prepare(proposal.dim())?;
        if indices.len() != plan.len() {
            return Err(CodingError::PartitionCountMismatch {
                expected: plan.len(),
                actual: indices.len(),
            });
        }

        let bound = self.config.max_draws_per_partition;
        let mut sample = Vec::with_capacity(proposal.dim());
        let mut candidate = Vec::new();
        for (p, (partition, &index)) in plan.iter().zip(indices).enumerate() {
            if index >= bound {
                return Err(CodingError::SeedMismatch {
                    partition: p,
                    index,
                    bound,
                });
            }
            let z = self
                .pool
                .candidate_at(StreamKey::new(seed, p), partition.len(), index);
            proposal
                .slice(partition.range())
                .transform_standard(z, &mut candidate);
            sample.extend_from_slice(&candidate);
        }

        Ok(sample)
    }

    fn plan(&mut self) -> Result<Arc<PartitionPlan>, ConfigurationError> {
        self.plans.get_or_plan(&self.planner, &self.stats.snapshot())
    }

    fn index_code(&self) -> CodelengthAccountant {
        self.accountant
    }

    fn update_auxiliary_variance_ratios(
        &self,
        targets: &[DiagonalGaussian],
        proposals: &[DiagonalGaussian],
    ) -> Result<(), CodingError> {
        Ok(self.stats.update(targets, proposals)?)
    }
}

impl Clone for RejectionCoder {
    /// Clones share the statistics but get their own (empty) buffer pool.
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            planner: self.planner,
            stats: Arc::clone(&self.stats),
            pool: SamplerBufferPool::new(self.config.sampler_buffer_sizes),
            plans: self.plans.clone(),
            accountant: self.accountant,
        }
    }
}

impl Debug for RejectionCoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RejectionCoder")
            .field("config", &self.config)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
