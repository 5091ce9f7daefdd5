//! Buffered access to the draws of a [`DeterministicSampler`].
//!
//! The rejection coder scans long sequences of draws of a single stream. Generating them
//! one at a time would re-derive a generator per call site; a [`SamplerBufferPool`]
//! instead generates chunks of consecutive draws into two preallocated buffers (one for
//! candidates, one for uniform variates) and hands them out in order.
//!
//! Buffering is purely an optimization: the `k`-th logical draw of a stream is the same
//! no matter where the refill boundaries fall, since every draw is generated from its own
//! counter-based seed. Two independent calls that consume the same prefix of a stream
//! therefore see identical values, whatever the buffer sizes.

use super::{DeterministicSampler, Lane, StreamKey};
use crate::config::SamplerBufferSizes;

/// Smallest refill, in scalars. Refills of a sequential scan double in size up to the
/// buffer's capacity.
const INITIAL_CHUNK: usize = 256;

#[derive(Debug, Clone)]
pub struct SamplerBufferPool {
    sampler: DeterministicSampler,
    candidates: DrawBuffer,
    uniforms: DrawBuffer,
}

impl SamplerBufferPool {
    pub fn new(sizes: SamplerBufferSizes) -> Self {
        Self {
            sampler: DeterministicSampler::new(),
            candidates: DrawBuffer::new(Lane::Candidate, sizes.candidate_capacity),
            uniforms: DrawBuffer::new(Lane::Uniform, sizes.uniform_capacity),
        }
    }

    /// Starts a sequential scan of stream `key` from draw zero.
    ///
    /// Draws that are still buffered from an earlier scan of the same stream are reused.
    pub fn stream(&mut self, key: StreamKey, dim: usize) -> DrawStream<'_> {
        DrawStream {
            pool: self,
            key,
            dim,
            next_candidate: 0,
            next_uniform: 0,
        }
    }

    /// Random access to the standard normal variates of candidate `index` in stream `key`.
    pub fn candidate_at(&mut self, key: StreamKey, dim: usize, index: u64) -> &[f64] {
        self.candidates.get(&self.sampler, key, dim, index)
    }

    /// Random access to uniform variate `index` in stream `key`.
    pub fn uniform_at(&mut self, key: StreamKey, index: u64) -> f64 {
        self.uniforms.get(&self.sampler, key, 1, index)[0]
    }

    /// Number of refills of the candidate and uniform buffer, respectively.
    pub fn refills(&self) -> (u64, u64) {
        (self.candidates.refills, self.uniforms.refills)
    }
}

/// A sequential scan over one stream of a [`SamplerBufferPool`].
#[derive(Debug)]
pub struct DrawStream<'a> {
    pool: &'a mut SamplerBufferPool,
    key: StreamKey,
    dim: usize,
    next_candidate: u64,
    next_uniform: u64,
}

impl DrawStream<'_> {
    pub fn key(&self) -> StreamKey {
        self.key
    }

    /// Returns the index and the standard normal variates of the next candidate.
    pub fn next_candidate(&mut self) -> (u64, &[f64]) {
        let index = self.next_candidate;
        self.next_candidate += 1;
        let pool = &mut *self.pool;
        let draw = pool.candidates.get(&pool.sampler, self.key, self.dim, index);
        (index, draw)
    }

    /// Returns the index and value of the next uniform variate.
    pub fn next_uniform(&mut self) -> (u64, f64) {
        let index = self.next_uniform;
        self.next_uniform += 1;
        let pool = &mut *self.pool;
        (index, pool.uniforms.get(&pool.sampler, self.key, 1, index)[0])
    }
}

// BUFFERS ====================================================================

/// A window of consecutive draws `start..start + len` of a single stream.
#[derive(Debug, Clone)]
struct DrawBuffer {
    lane: Lane,
    capacity: usize,
    key: Option<(StreamKey, usize)>,
    start: u64,
    len: u64,
    chunk: usize,
    data: Vec<f64>,
    refills: u64,
}

impl DrawBuffer {
    fn new(lane: Lane, capacity: usize) -> Self {
        Self {
            lane,
            capacity,
            key: None,
            start: 0,
            len: 0,
            chunk: 0,
            data: Vec::with_capacity(capacity),
            refills: 0,
        }
    }

    fn get(
        &mut self,
        sampler: &DeterministicSampler,
        key: StreamKey,
        width: usize,
        index: u64,
    ) -> &[f64] {
        if self.key != Some((key, width)) {
            self.key = Some((key, width));
            self.start = 0;
            self.len = 0;
            self.data.clear();
        }

        if index < self.start || index - self.start >= self.len {
            self.refill(sampler, key, width, index);
        }

        let offset = (index - self.start) as usize * width;
        &self.data[offset..offset + width]
    }

    fn refill(&mut self, sampler: &DeterministicSampler, key: StreamKey, width: usize, from: u64) {
        let max_draws = (self.capacity / width.max(1)).max(1);
        let initial = (INITIAL_CHUNK / width.max(1)).clamp(1, max_draws);
        self.chunk = if self.len != 0 && from == self.start + self.len {
            (self.chunk * 2).clamp(initial, max_draws)
        } else {
            initial
        };

        self.data.clear();
        let indices = from..from.saturating_add(self.chunk as u64);
        match self.lane {
            Lane::Candidate => sampler.fill_candidates(key, indices, width, &mut self.data),
            Lane::Uniform => sampler.fill_uniforms(key, indices, &mut self.data),
        }
        self.start = from;
        self.len = self.chunk as u64;
        self.refills += 1;
    }
}
