//! Reproducible randomness shared by encoder and decoder.
//!
//! The decoder has to regenerate exactly the candidates that the encoder looked at, without
//! ever receiving them. All randomness in this crate therefore comes from a
//! [`DeterministicSampler`], which is *counter based*: the `k`-th draw of a stream is a
//! pure function of the stream's [`StreamKey`], the lane (candidate or uniform), and `k`.
//! There is no generator state that would have to be advanced, so any draw can be
//! regenerated on its own, out of order, or in parallel.
//!
//! Internally, the triple `(key, lane, k)` is hashed into a 64 bit seed for a fresh
//! [`Xoshiro256StarStar`] generator. Standard normal variates are produced by the
//! Box-Muller transform using the pure Rust implementations of `ln`, `sqrt`, `sin`, and
//! `cos` from the `libm` crate, so they are bit-identical on every platform.
//!
//! The [`pool`] module adds buffering on top of this for the long sequential scans of the
//! rejection coder.

pub mod pool;

use rand::{distributions::Open01, Rng, SeedableRng};
use rand_xoshiro::Xoshiro256StarStar;

/// Identifies an independent stream of draws.
///
/// - `seed` is the seed shared by sender and receiver;
/// - `partition` is the index of the partition within the plan; and
/// - `branch` distinguishes sub-streams within a partition (the rejection coder always uses
///   branch zero, the beam coder derives it from a beam's index history, see
///   [`StreamKey::for_history`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub seed: u64,
    pub partition: u64,
    pub branch: u64,
}

impl StreamKey {
    pub fn new(seed: u64, partition: usize) -> Self {
        Self {
            seed,
            partition: partition as u64,
            branch: 0,
        }
    }

    /// Key of the sub-stream that a beam with index history `history` explores in
    /// `partition`.
    ///
    /// Different histories map to different branches (up to 64 bit hash collisions), and
    /// the empty history maps to a branch that differs from the rejection coder's branch
    /// zero.
    pub fn for_history(seed: u64, partition: usize, history: &[u64]) -> Self {
        let mut branch = mix(BRANCH_SALT ^ history.len() as u64);
        for &index in history {
            branch = mix(branch ^ index.wrapping_mul(GOLDEN_GAMMA));
        }
        Self {
            seed,
            partition: partition as u64,
            branch,
        }
    }
}

/// The two independent lanes of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum Lane {
    Candidate = 0x6361_6e64,
    Uniform = 0x756e_6966,
}

/// Stateless, counter-based source of standard normal candidates and uniform variates.
///
/// A candidate is returned as a vector of *standard* normal variates; the coders map it
/// into the proposal with
/// [`GaussianSlice::transform_standard`](crate::distributions::GaussianSlice::transform_standard).
/// Keeping the sampler independent of the proposal lets the buffer pool reuse draws across
/// calls whose proposals differ.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeterministicSampler;

impl DeterministicSampler {
    pub fn new() -> Self {
        Self
    }

    /// Appends the `dim` standard normal variates of draw `index` in stream `key` to `out`.
    pub fn candidate_into(&self, key: StreamKey, index: u64, dim: usize, out: &mut Vec<f64>) {
        let mut rng = generator(key, Lane::Candidate, index);
        let mut remaining = dim;
        while remaining != 0 {
            let (z0, z1) = box_muller(&mut rng);
            out.push(z0);
            if remaining >= 2 {
                out.push(z1);
                remaining -= 2;
            } else {
                remaining -= 1;
            }
        }
    }

    /// Returns the standard normal variates of draw `index` in stream `key`.
    pub fn candidate(&self, key: StreamKey, index: u64, dim: usize) -> Vec<f64> {
        let mut out = Vec::with_capacity(dim);
        self.candidate_into(key, index, dim, &mut out);
        out
    }

    /// Appends the candidates with indices `indices` to `out`, one after the other.
    pub fn fill_candidates(
        &self,
        key: StreamKey,
        indices: core::ops::Range<u64>,
        dim: usize,
        out: &mut Vec<f64>,
    ) {
        out.reserve(dim * (indices.end.saturating_sub(indices.start)) as usize);
        for index in indices {
            self.candidate_into(key, index, dim, out);
        }
    }

    /// Returns the uniform variate of draw `index` in stream `key`, from the open interval
    /// `(0, 1)`.
    pub fn uniform(&self, key: StreamKey, index: u64) -> f64 {
        generator(key, Lane::Uniform, index).sample(Open01)
    }

    /// Appends the uniform variates with indices `indices` to `out`.
    pub fn fill_uniforms(
        &self,
        key: StreamKey,
        indices: core::ops::Range<u64>,
        out: &mut Vec<f64>,
    ) {
        out.extend(indices.map(|index| self.uniform(key, index)));
    }
}

// COUNTER BASED SEEDING ======================================================

const GOLDEN_GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;
const BRANCH_SALT: u64 = 0xD1B5_4A32_D192_ED03;

/// SplitMix64 finalizer: a bijective mixing function on `u64`.
#[inline(always)]
fn mix(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[inline]
fn counter_seed(key: StreamKey, lane: Lane, index: u64) -> u64 {
    let mut h = mix(key.seed.wrapping_add(GOLDEN_GAMMA));
    h = mix(h ^ key.partition.wrapping_mul(GOLDEN_GAMMA));
    h = mix(h ^ key.branch);
    h = mix(h ^ lane as u64);
    mix(h ^ index.wrapping_mul(GOLDEN_GAMMA))
}

#[inline]
fn generator(key: StreamKey, lane: Lane, index: u64) -> Xoshiro256StarStar {
    Xoshiro256StarStar::seed_from_u64(counter_seed(key, lane, index))
}

#[inline]
fn box_muller(rng: &mut Xoshiro256StarStar) -> (f64, f64) {
    let u1: f64 = rng.sample(Open01);
    let u2: f64 = rng.gen();
    let radius = libm::sqrt(-2.0 * libm::log(u1));
    let angle = core::f64::consts::TAU * u2;
    (radius * libm::cos(angle), radius * libm::sin(angle))
}
