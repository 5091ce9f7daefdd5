//! Relative entropy coding by a bounded beam search.
//!
//! The [`BeamCoder`] keeps up to `W = n_carry_over` partial solutions ("beams"). In each
//! partition, every live beam draws `K = candidates_per_partition` candidates from its own
//! sub-stream, keyed by the seed, the partition index, and the beam's index history (see
//! [`StreamKey::for_history`]). Every extension is scored by
//!
//! ```text
//! score' = score + ln w(x) + beam_perturbation · G(u),    G(u) = −ln(−ln u),
//! ```
//!
//! and the `W` best extensions survive. After the last partition, the best beam is
//! returned. Since each beam's sub-stream is determined by the indices it has chosen so
//! far, a decoder replays the selected branch directly and never repeats the search.
//!
//! Unlike the [`RejectionCoder`](crate::RejectionCoder), the amount of work per partition
//! is fixed (`W · K` candidates), and every index costs exactly `log2(K)` bits. The price
//! is a sample that is biased towards high importance weights (for `beam_perturbation ==
//! 0`) or, with Gumbel perturbations, only approximately distributed like the target.

use core::{cmp::Ordering, slice};
use std::{sync::Arc, time::Instant};

use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::{
    check_deadline,
    codelength::CodelengthAccountant,
    distributions::clamp_finite,
    partition::{PartitionPlan, PartitionPlanner, PlanCache},
    sampler::{DeterministicSampler, StreamKey},
    Coder, CoderConfig, CodingError, CodingReport, ConfigurationError, DiagonalGaussian,
    Encoding, InvalidDistributionError, VarianceRatioStats,
};

#[derive(Debug, Clone)]
pub struct BeamCoder {
    config: CoderConfig,
    planner: PartitionPlanner,
    stats: Arc<VarianceRatioStats>,
    sampler: DeterministicSampler,
    plans: PlanCache,
    accountant: CodelengthAccountant,
}

/// A partial solution of the beam search.
#[derive(Debug, Clone, PartialEq)]
pub struct BeamState {
    indices: SmallVec<[u64; 8]>,
    score: f64,
    log_weight: f64,
    sample: Vec<f64>,
}

impl BeamState {
    fn root() -> Self {
        Self {
            indices: SmallVec::new(),
            score: 0.0,
            log_weight: 0.0,
            sample: Vec::new(),
        }
    }

    /// The candidate indices chosen so far, one per completed partition.
    pub fn indices(&self) -> &[u64] {
        &self.indices
    }

    /// Cumulative (possibly perturbed) score.
    pub fn score(&self) -> f64 {
        self.score
    }

    /// Cumulative log importance weight of [`sample`](Self::sample), without perturbations.
    pub fn log_weight(&self) -> f64 {
        self.log_weight
    }

    pub fn sample(&self) -> &[f64] {
        &self.sample
    }
}

/// A scored candidate continuation of a beam.
#[derive(Debug, Clone, Copy)]
struct Extension {
    beam: usize,
    index: u64,
    score: f64,
    log_weight: f64,
}

impl Extension {
    /// Best first; ties go to the lower candidate index, then the lower beam.
    fn rank(&self, other: &Self) -> Ordering {
        other
            .score
            .total_cmp(&self.score)
            .then(self.index.cmp(&other.index))
            .then(self.beam.cmp(&other.beam))
    }
}

#[inline(always)]
fn gumbel(u: f64) -> f64 {
    -(-u.ln()).ln()
}

impl BeamCoder {
    pub fn new(
        config: CoderConfig,
        stats: Arc<VarianceRatioStats>,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;
        Ok(Self {
            planner: PartitionPlanner::new(config.kl_per_partition)?,
            accountant: CodelengthAccountant::uniform(config.candidates_per_partition as u64),
            config,
            stats,
            sampler: DeterministicSampler::new(),
            plans: PlanCache::default(),
        })
    }

    pub fn config(&self) -> &CoderConfig {
        &self.config
    }

    pub fn stats(&self) -> &Arc<VarianceRatioStats> {
        &self.stats
    }

    fn prepare(&mut self, dim: usize) -> Result<Arc<PartitionPlan>, CodingError> {
        let snapshot = self.stats.snapshot();
        if snapshot.dim() != dim {
            return Err(InvalidDistributionError::LengthMismatch {
                expected: snapshot.dim(),
                actual: dim,
            }
            .into());
        }
        Ok(self.plans.get_or_plan(&self.planner, &snapshot)?)
    }

    /// Runs the beam search and returns the surviving beams, best first.
    pub fn search(
        &mut self,
        target: &DiagonalGaussian,
        proposal: &DiagonalGaussian,
        seed: u64,
    ) -> Result<(Vec<BeamState>, CodingReport), CodingError> {
        target.check_compatible(proposal)?;
        let started = Instant::now();
        let plan = self.prepare(target.dim())?;

        let candidates = self.config.candidates_per_partition as u64;
        let width = self.config.n_carry_over;
        let perturbation = self.config.beam_perturbation;

        let mut report = CodingReport::default();
        let mut beams = vec![BeamState::root()];
        let mut extensions = Vec::with_capacity(width * candidates as usize);
        let mut z = Vec::new();
        let mut x = Vec::new();

        for (p, partition) in plan.iter().enumerate() {
            check_deadline(self.config.timeout, started, p)?;

            let range = partition.range();
            let t = target.slice(range.clone());
            let q = proposal.slice(range);
            let weight = t.importance_ratio(q);
            let over_budget = t.kl_divergence(q) > self.config.kl_per_partition;
            if over_budget {
                report.over_budget_partitions += 1;
            }

            extensions.clear();
            for (b, beam) in beams.iter().enumerate() {
                let key = StreamKey::for_history(seed, p, &beam.indices);
                for index in 0..candidates {
                    z.clear();
                    self.sampler.candidate_into(key, index, partition.len(), &mut z);
                    q.transform_standard(&z, &mut x);

                    let mut log_weight = weight.eval(&x);
                    if log_weight.is_nan() {
                        trace!(partition = p, beam = b, index, "importance weight is NaN");
                        report.clamped_weights += 1;
                        log_weight = f64::MIN;
                    } else {
                        log_weight = clamp_finite(log_weight);
                    }

                    let mut score = beam.score + log_weight;
                    if perturbation != 0.0 {
                        score += perturbation * gumbel(self.sampler.uniform(key, index));
                    }
                    extensions.push(Extension {
                        beam: b,
                        index,
                        score,
                        log_weight: beam.log_weight + log_weight,
                    });
                }
            }
            report.total_draws += extensions.len() as u64;

            if extensions.len() > width {
                extensions.select_nth_unstable_by(width - 1, Extension::rank);
                extensions.truncate(width);
            }
            extensions.sort_unstable_by(Extension::rank);

            beams = extensions
                .iter()
                .map(|extension| {
                    let parent = &beams[extension.beam];
                    let key = StreamKey::for_history(seed, p, &parent.indices);
                    z.clear();
                    self.sampler
                        .candidate_into(key, extension.index, partition.len(), &mut z);
                    q.transform_standard(&z, &mut x);

                    let mut indices = parent.indices.clone();
                    indices.push(extension.index);
                    let mut sample = Vec::with_capacity(target.dim());
                    sample.extend_from_slice(&parent.sample);
                    sample.extend_from_slice(&x);
                    BeamState {
                        indices,
                        score: extension.score,
                        log_weight: extension.log_weight,
                        sample,
                    }
                })
                .collect();

            debug!(
                partition = p,
                dims = partition.len(),
                beams = beams.len(),
                best_score = beams[0].score,
                over_budget,
                "beam search step finished"
            );
        }

        report.log_weight = beams[0].log_weight;
        Ok((beams, report))
    }
}

impl Coder for BeamCoder {
    fn encode(
        &mut self,
        target: &DiagonalGaussian,
        proposal: &DiagonalGaussian,
        seed: u64,
        update_sampler: bool,
    ) -> Result<Encoding, CodingError> {
        let (mut beams, report) = self.search(target, proposal, seed)?;

        if update_sampler {
            self.stats
                .update_variance_ratios(slice::from_ref(target), slice::from_ref(proposal))?;
        }

        let best = beams.swap_remove(0);
        Ok(Encoding {
            indices: best.indices.into_vec(),
            sample: best.sample,
            report,
        })
    }

    fn decode(
        &mut self,
        proposal: &DiagonalGaussian,
        indices: &[u64],
        seed: u64,
    ) -> Result<Vec<f64>, CodingError> {
        let plan = self.prepare(proposal.dim())?;
        if indices.len() != plan.len() {
            return Err(CodingError::PartitionCountMismatch {
                expected: plan.len(),
                actual: indices.len(),
            });
        }

        let bound = self.config.candidates_per_partition as u64;
        let mut sample = Vec::with_capacity(proposal.dim());
        let mut z = Vec::new();
        let mut x = Vec::new();
        for (p, (partition, &index)) in plan.iter().zip(indices).enumerate() {
            if index >= bound {
                return Err(CodingError::SeedMismatch {
                    partition: p,
                    index,
                    bound,
                });
            }
            let key = StreamKey::for_history(seed, p, &indices[..p]);
            z.clear();
            self.sampler.candidate_into(key, index, partition.len(), &mut z);
            proposal
                .slice(partition.range())
                .transform_standard(&z, &mut x);
            sample.extend_from_slice(&x);
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

#[cfg(test)]
mod tests {
    use super::*;

    fn coder(config: CoderConfig, stats: &Arc<VarianceRatioStats>) -> BeamCoder {
        BeamCoder::new(config, Arc::clone(stats)).unwrap()
    }

    fn fixture() -> (DiagonalGaussian, DiagonalGaussian, Arc<VarianceRatioStats>) {
        let target = DiagonalGaussian::new(
            vec![0.8, -0.4, 0.2, 1.0, -0.9],
            vec![0.4, 0.6, 0.3, 0.5, 0.7],
        )
        .unwrap();
        let proposal = DiagonalGaussian::standard(5);
        let stats = Arc::new(VarianceRatioStats::new(5, 0.5).unwrap());
        stats.update(&[target.clone()], &[proposal.clone()]).unwrap();
        (target, proposal, stats)
    }

    fn small_config() -> CoderConfig {
        CoderConfig {
            kl_per_partition: 1.0,
            n_carry_over: 3,
            candidates_per_partition: 16,
            ..Default::default()
        }
    }

    #[test]
    fn round_trip() {
        let (target, proposal, stats) = fixture();
        let mut encoder = coder(small_config(), &stats);
        let plan = encoder.plan().unwrap();
        assert!(plan.len() > 1);

        let encoding = encoder.encode(&target, &proposal, 42, false).unwrap();
        assert_eq!(encoding.indices.len(), plan.len());
        assert!(encoding.indices.iter().all(|&i| i < 16));
        assert_eq!(encoding.report.total_draws, 16 + 3 * 16 * (plan.len() as u64 - 1));
        assert_eq!(encoder.get_codelength(&encoding.indices), 4.0 * plan.len() as f64);

        let mut decoder = coder(small_config(), &stats);
        let decoded = decoder.decode(&proposal, &encoding.indices, 42).unwrap();
        assert_eq!(decoded, encoding.sample);

        // The reported weight is the weight of the returned sample.
        let expected = target
            .as_slice()
            .log_importance_ratio(proposal.as_slice(), &encoding.sample);
        assert!((encoding.report.log_weight - expected).abs() < 1e-9);
    }

    #[test]
    fn beams_are_sorted_and_distinct() {
        let (target, proposal, stats) = fixture();
        let mut coder = coder(small_config(), &stats);
        let (beams, _) = coder.search(&target, &proposal, 5).unwrap();
        assert_eq!(beams.len(), 3);
        for pair in beams.windows(2) {
            assert!(pair[0].score() >= pair[1].score());
            assert_ne!(pair[0].indices(), pair[1].indices());
        }
        for beam in &beams {
            assert_eq!(beam.sample().len(), 5);
            // Without perturbations, scores are plain log weights.
            assert_eq!(beam.score(), beam.log_weight());
        }
    }

    #[test]
    fn beam_width_is_irrelevant_for_a_single_partition() {
        // With a single partition, the result is the best of the same K candidates,
        // whatever the width.
        let target = DiagonalGaussian::new(vec![0.5, 0.5], vec![0.5, 0.5]).unwrap();
        let proposal = DiagonalGaussian::standard(2);
        let stats = Arc::new(VarianceRatioStats::new(2, 0.5).unwrap());
        let narrow = CoderConfig {
            n_carry_over: 1,
            candidates_per_partition: 64,
            ..Default::default()
        };
        let wide = CoderConfig {
            n_carry_over: 8,
            ..narrow.clone()
        };
        let a = coder(narrow, &stats).encode(&target, &proposal, 1, false).unwrap();
        let b = coder(wide, &stats).encode(&target, &proposal, 1, false).unwrap();
        assert_eq!(a.indices, b.indices);
        assert_eq!(a.sample, b.sample);
    }

    #[test]
    fn perturbed_search_is_reproducible() {
        let (target, proposal, stats) = fixture();
        let config = CoderConfig {
            beam_perturbation: 1.0,
            ..small_config()
        };
        let mut coder = coder(config, &stats);
        let first = coder.encode(&target, &proposal, 9, false).unwrap();
        let second = coder.clone().encode(&target, &proposal, 9, false).unwrap();
        assert_eq!(first, second);
        assert_eq!(coder.decode(&proposal, &first.indices, 9).unwrap(), first.sample);
    }

    #[test]
    fn decode_rejects_out_of_range_indices() {
        let (_, proposal, stats) = fixture();
        let mut coder = coder(small_config(), &stats);
        let n = coder.plan().unwrap().len();
        let mut indices = vec![0; n];
        indices[n - 1] = 16;
        assert_eq!(
            coder.decode(&proposal, &indices, 0),
            Err(CodingError::SeedMismatch {
                partition: n - 1,
                index: 16,
                bound: 16
            })
        );
        assert_eq!(
            coder.decode(&proposal, &indices[1..], 0),
            Err(CodingError::PartitionCountMismatch {
                expected: n,
                actual: n - 1
            })
        );
    }

    #[test]
    fn update_sampler_keeps_multi_partition_encodings_decodable() {
        let proposal = DiagonalGaussian::standard(4);
        let history = DiagonalGaussian::new(vec![0.3, 0.3, 0.3, 1.2], vec![0.6; 4]).unwrap();
        let stats = Arc::new(VarianceRatioStats::new(4, 0.5).unwrap());
        stats.update(&[history], &[proposal.clone()]).unwrap();

        let mut encoder = coder(small_config(), &stats);
        let plan = encoder.plan().unwrap();
        assert_eq!(
            plan.iter().map(|p| p.range()).collect::<Vec<_>>(),
            vec![0..3, 3..4]
        );

        let target = DiagonalGaussian::new(vec![0.3, 1.4, 0.3, 0.3], vec![0.6; 4]).unwrap();
        let generation = stats.generation();
        let encoding = encoder.encode(&target, &proposal, 13, true).unwrap();
        assert_eq!(stats.generation(), generation);
        assert_eq!(encoder.plan().unwrap(), plan);

        let mut decoder = coder(small_config(), &stats);
        let decoded = decoder.decode(&proposal, &encoding.indices, 13).unwrap();
        assert_eq!(decoded, encoding.sample);
    }

    #[test]
    fn over_budget_count_uses_the_actual_kl() {
        let stats = Arc::new(VarianceRatioStats::new(2, 0.5).unwrap());
        let config = CoderConfig {
            n_carry_over: 2,
            candidates_per_partition: 16,
            ..Default::default()
        };
        let mut coder = coder(config, &stats);
        let target = DiagonalGaussian::new(vec![2.5, 2.5], vec![0.5, 0.5]).unwrap();
        let proposal = DiagonalGaussian::standard(2);

        let encoding = coder.encode(&target, &proposal, 3, false).unwrap();
        assert_eq!(encoding.indices.len(), 1);
        assert_eq!(encoding.report.over_budget_partitions, 1);
        let encoding = coder.encode(&proposal, &proposal, 3, false).unwrap();
        assert_eq!(encoding.report.over_budget_partitions, 0);
    }

    #[test]
    fn nan_weights_are_counted_and_ranked_last() {
        let stats = Arc::new(VarianceRatioStats::new(1, 0.5).unwrap());
        let config = CoderConfig {
            n_carry_over: 2,
            candidates_per_partition: 16,
            ..Default::default()
        };
        let mut coder = coder(config, &stats);
        let target = DiagonalGaussian::new(vec![0.0], vec![1e-310]).unwrap();
        let proposal = DiagonalGaussian::standard(1);

        let encoding = coder.encode(&target, &proposal, 4, false).unwrap();
        assert_eq!(encoding.report.clamped_weights, 16);
        assert_eq!(encoding.indices, vec![0]);
        assert!(encoding.sample.iter().all(|x| x.is_finite()));
        assert_eq!(
            coder.decode(&proposal, &encoding.indices, 4).unwrap(),
            encoding.sample
        );
    }

    #[test]
    fn gumbel_is_monotonic() {
        assert!(gumbel(0.1) < gumbel(0.5));
        assert!(gumbel(0.5) < gumbel(0.9));
        assert!((gumbel(libm::exp(-1.0)) - 0.0).abs() < 1e-15);
    }
}
