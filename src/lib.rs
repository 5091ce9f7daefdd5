//! Relative Entropy Coding for Diagonal Gaussian Latents
//!
//! The `rec_coder` crate communicates a *sample* from a target distribution `T` to a
//! receiver who only knows a proposal distribution `P` and shares a source of common
//! randomness (a seed) with the sender. The expected number of transmitted bits is close to
//! the Kullback-Leibler divergence `KL(T || P)`, which makes the technique (relative entropy
//! coding, or "channel simulation") a useful tool for compressing the latent
//! representations of generative models without ever quantizing them.
//!
//! # Overview
//!
//! A latent with `D` independent dimensions usually carries far too much information to be
//! coded in one step (the number of candidate draws grows exponentially in the KL). The
//! engine therefore
//!
//! 1. splits the dimensions into contiguous chunks with a bounded KL each (see
//!    [`partition`]);
//! 2. draws reproducible candidates from the proposal for each chunk (see [`sampler`]); and
//! 3. selects one candidate per chunk, either by bounded rejection sampling
//!    ([`RejectionCoder`]) or by a beam search over candidate continuations
//!    ([`BeamCoder`]).
//!
//! The selected candidate indices are the only thing that has to be transmitted. Their
//! cost in bits is computed by [`Coder::get_codelength`]. [`Coder::write_indices`] turns them
//! into an actual bit string, which [`Coder::decode_bits`] parses and decodes.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use rec_coder::{Coder, CoderConfig, DiagonalGaussian, RejectionCoder, VarianceRatioStats};
//!
//! let target = DiagonalGaussian::new(vec![0.3, -0.2, 1.1], vec![0.5, 0.8, 0.4]).unwrap();
//! let proposal = DiagonalGaussian::standard(3);
//!
//! // Statistics are shared between all coders that must agree on how to code a latent.
//! let stats = Arc::new(VarianceRatioStats::with_default_decay(3).unwrap());
//! stats.update(&[target.clone()], &[proposal.clone()]).unwrap();
//!
//! let mut encoder = RejectionCoder::new(CoderConfig::default(), Arc::clone(&stats)).unwrap();
//! let encoding = encoder.encode(&target, &proposal, 1234, false).unwrap();
//! assert!(encoder.get_codelength(&encoding.indices) > 0.0);
//!
//! // The receiver only needs the proposal, the indices, and the seed.
//! let mut decoder = RejectionCoder::new(CoderConfig::default(), stats).unwrap();
//! let sample = decoder.decode(&proposal, &encoding.indices, 1234).unwrap();
//! assert_eq!(sample, encoding.sample);
//! ```
//!
//! # Shared State
//!
//! Apart from their explicit inputs, coders only depend on a [`VarianceRatioStats`]
//! object, which is constructed explicitly, injected into the coders (usually behind an
//! `Arc`), and mutated only through [`VarianceRatioStats::update`] (or, equivalently,
//! [`Coder::update_auxiliary_variance_ratios`]). Encoder and decoder must see the same
//! statistics; they determine the partitioning of the latent space.

#![warn(rust_2018_idioms, missing_debug_implementations)]

pub mod beam;
pub mod codelength;
pub mod config;
pub mod distributions;
pub mod partition;
pub mod rejection;
pub mod sampler;
pub mod stats;

use std::{sync::Arc, time::Duration};

use thiserror::Error;

use codelength::{BitBuffer, CodewordError};

pub use beam::BeamCoder;
pub use codelength::CodelengthAccountant;
pub use config::{CoderConfig, SamplerBufferSizes};
pub use distributions::DiagonalGaussian;
pub use partition::{Partition, PartitionPlan, PartitionPlanner};
pub use rejection::RejectionCoder;
pub use sampler::{pool::SamplerBufferPool, DeterministicSampler, StreamKey};
pub use stats::VarianceRatioStats;

// CODER CAPABILITY ===========================================================

/// The common interface of all relative entropy coders in this crate.
///
/// The two implementations, [`RejectionCoder`] and [`BeamCoder`], share no internals;
/// they only agree on this contract:
///
/// - `decode(proposal, encode(target, proposal, seed).indices, seed)` reproduces
///   `encode(..).sample` bit by bit, provided both calls see the same
///   [`VarianceRatioStats`] and the same configuration;
/// - encoding is deterministic given its inputs and the statistics; and
/// - `get_codelength` never returns a negative number.
pub trait Coder {
    /// Selects one candidate per partition so that the concatenated candidates are an
    /// (approximate) sample from `target`.
    ///
    /// If `update_sampler` is set then the variance ratios of `target` relative to
    /// `proposal` are fed into the shared [`VarianceRatioStats`] after the encoding has
    /// been produced (see [`VarianceRatioStats::update_variance_ratios`]). This tightens
    /// the rejection bounds of subsequent calls but never changes the partition plan, so
    /// the returned encoding stays decodable.
    fn encode(
        &mut self,
        target: &DiagonalGaussian,
        proposal: &DiagonalGaussian,
        seed: u64,
        update_sampler: bool,
    ) -> Result<Encoding, CodingError>;

    /// Reconstructs the sample identified by `indices` without repeating any search.
    fn decode(
        &mut self,
        proposal: &DiagonalGaussian,
        indices: &[u64],
        seed: u64,
    ) -> Result<Vec<f64>, CodingError>;

    /// The partition plan that the next `encode` or `decode` call will use.
    fn plan(&mut self) -> Result<Arc<PartitionPlan>, ConfigurationError>;

    /// The code that prices and serializes this coder's indices.
    fn index_code(&self) -> CodelengthAccountant;

    /// Returns the number of bits needed to transmit `indices`.
    fn get_codelength(&self, indices: &[u64]) -> f64 {
        self.index_code().codelength(indices)
    }

    /// Feeds a batch of target/proposal pairs into the shared statistics.
    ///
    /// Unlike the `update_sampler` flag of [`encode`](Self::encode), this updates the
    /// expected KLs and may therefore change the partition plan. Sender and receiver have
    /// to apply the same updates in the same order.
    fn update_auxiliary_variance_ratios(
        &self,
        targets: &[DiagonalGaussian],
        proposals: &[DiagonalGaussian],
    ) -> Result<(), CodingError>;

    /// Serializes `indices` into the bit string that is actually transmitted.
    fn write_indices(&self, indices: &[u64]) -> Result<BitBuffer, CodingError> {
        Ok(self.index_code().to_bits(indices)?)
    }

    /// Parses one index per partition of the current plan from `bits` and decodes them.
    fn decode_bits(
        &mut self,
        proposal: &DiagonalGaussian,
        bits: &BitBuffer,
        seed: u64,
    ) -> Result<Vec<f64>, CodingError> {
        let count = self.plan()?.len();
        let indices = self.index_code().from_bits(bits, count)?;
        self.decode(proposal, &indices, seed)
    }
}

/// The result of [`Coder::encode`].
#[derive(Debug, Clone, PartialEq)]
pub struct Encoding {
    /// One candidate index per partition, in plan order.
    pub indices: Vec<u64>,

    /// The reconstructed sample, i.e., exactly what [`Coder::decode`] will return.
    pub sample: Vec<f64>,

    /// Non-fatal events and metrics that occurred while encoding.
    pub report: CodingReport,
}

/// Metrics of a single [`Coder::encode`] call.
///
/// None of the counted events is an error: a forced accept degrades the quality of the
/// sample but still produces a valid encoding, and clamped importance weights only mean
/// that the acceptance probability saturated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CodingReport {
    /// Partitions in which the draw cap was hit and the best draw so far was accepted.
    pub forced_accepts: usize,

    /// Draws whose importance weight exceeded the rejection bound or was not finite.
    pub clamped_weights: u64,

    /// Total number of candidates evaluated across all partitions and beams.
    pub total_draws: u64,

    /// Partitions whose KL under this call's target and proposal exceeds the budget.
    pub over_budget_partitions: usize,

    /// Sum of `ln(density_T(x) / density_P(x))` over the returned sample.
    pub log_weight: f64,
}

// ERRORS =====================================================================

/// Invalid coder or statistics configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    #[error("KL budget per partition must be positive and finite, got {0}")]
    InvalidBudget(f64),

    #[error("cannot partition a distribution with zero dimensions")]
    EmptyDimension,

    #[error("EMA decay factor must lie strictly between 0 and 1, got {0}")]
    InvalidDecay(f64),

    #[error("invalid configuration value for `{name}`: {reason}")]
    InvalidParameter {
        name: &'static str,
        reason: &'static str,
    },
}

/// The parameters of a [`DiagonalGaussian`] (or a pair of them) are unusable.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvalidDistributionError {
    #[error("scale at dimension {index} must be positive and finite, got {value}")]
    NonPositiveScale { index: usize, value: f64 },

    #[error("mean at dimension {index} must be finite, got {value}")]
    NonFiniteMean { index: usize, value: f64 },

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("distribution must have at least one dimension")]
    Empty,

    #[error("batch sizes differ: {targets} targets but {proposals} proposals")]
    BatchMismatch { targets: usize, proposals: usize },
}

/// Errors returned by [`Coder`] operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodingError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    InvalidDistribution(#[from] InvalidDistributionError),

    #[error(transparent)]
    Codeword(#[from] CodewordError),

    /// The index cannot have been produced by an encoder with the same seed, proposal,
    /// and configuration.
    #[error("index {index} in partition {partition} is outside the valid range 0..{bound}")]
    SeedMismatch {
        partition: usize,
        index: u64,
        bound: u64,
    },

    /// The number of indices does not match the partition plan derived from the shared
    /// statistics (usually because encoder and decoder saw different statistics).
    #[error("expected {expected} indices (one per partition), got {actual}")]
    PartitionCountMismatch { expected: usize, actual: usize },

    /// The configured timeout expired; any partial result was discarded.
    #[error("timeout of {timeout:?} expired after {completed_partitions} partitions")]
    DeadlineExceeded {
        timeout: Duration,
        completed_partitions: usize,
    },
}

/// Fails with [`CodingError::DeadlineExceeded`] if `timeout` has expired since `started`.
///
/// Called before each partition, so partitions always run to completion. A zero timeout
/// expires immediately.
pub(crate) fn check_deadline(
    timeout: Option<Duration>,
    started: std::time::Instant,
    completed_partitions: usize,
) -> Result<(), CodingError> {
    match timeout {
        Some(timeout) if started.elapsed() >= timeout => Err(CodingError::DeadlineExceeded {
            timeout,
            completed_partitions,
        }),
        _ => Ok(()),
    }
}
