//! Bit cost and transport of code indices.
//!
//! A coder's output is a sequence of non-negative integers, one per partition. This module
//! prices such sequences ([`CodelengthAccountant::codelength`]) and turns them into an
//! actual bit string ([`CodelengthAccountant::to_bits`]) that a receiver can parse back
//! ([`CodelengthAccountant::from_bits`]).
//!
//! Two codes are supported:
//!
//! - [`IndexCode::Universal`] for unbounded indices (as produced by rejection sampling).
//!   The receiver does not know the acceptance probability that governed an index, so the
//!   price of index `k` is the ideal length of a universal integer code,
//!   `log2(k+1) + 2·log2(1 + log2(k+1)) + 1` bits. It is at least one bit, strictly
//!   increasing in `k`, and for a geometric index with success probability `e^{-KL}`
//!   amounts to `KL / ln 2 + O(log KL)` bits on average. The transport uses
//!   Exponential-Golomb coding (`2⌊log2(k+1)⌋ + 1` bits), which matches the ideal length
//!   for small indices and stays below twice the ideal length for large ones.
//! - [`IndexCode::Uniform`] for indices from a fixed alphabet `0..K` (as produced by the
//!   beam coder), priced at `log2(K)` bits each and transported with `⌈log2 K⌉` bits.

use smallvec::SmallVec;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexCode {
    Universal,
    Uniform { alphabet_size: u64 },
}

/// Converts code indices into bit costs and bit strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodelengthAccountant {
    code: IndexCode,
}

impl CodelengthAccountant {
    pub fn universal() -> Self {
        Self {
            code: IndexCode::Universal,
        }
    }

    /// # Panics
    ///
    /// Panics if `alphabet_size < 2`.
    pub fn uniform(alphabet_size: u64) -> Self {
        assert!(alphabet_size >= 2);
        Self {
            code: IndexCode::Uniform { alphabet_size },
        }
    }

    pub fn code(&self) -> IndexCode {
        self.code
    }

    /// Ideal cost of a single index, in bits.
    pub fn index_bits(&self, index: u64) -> f64 {
        match self.code {
            IndexCode::Universal => {
                let magnitude = (index as f64 + 1.0).log2();
                magnitude + 2.0 * (1.0 + magnitude).log2() + 1.0
            }
            IndexCode::Uniform { alphabet_size } => (alphabet_size as f64).log2(),
        }
    }

    /// Ideal cost of a sequence of indices, in bits. Never negative.
    pub fn codelength(&self, indices: &[u64]) -> f64 {
        indices.iter().map(|&index| self.index_bits(index)).sum()
    }

    /// Serializes `indices`.
    ///
    /// For a uniform code, indices outside of the alphabet are an error.
    pub fn to_bits(&self, indices: &[u64]) -> Result<BitBuffer, CodewordError> {
        let mut bits = BitBuffer::new();
        match self.code {
            IndexCode::Universal => {
                for &index in indices {
                    write_exp_golomb(index, &mut bits);
                }
            }
            IndexCode::Uniform { alphabet_size } => {
                let width = fixed_width(alphabet_size);
                for &index in indices {
                    if index >= alphabet_size {
                        return Err(CodewordError::OutOfRange {
                            index,
                            alphabet_size,
                        });
                    }
                    for shift in (0..width).rev() {
                        bits.push((index >> shift) & 1 != 0);
                    }
                }
            }
        }
        Ok(bits)
    }

    /// Parses `count` indices from the beginning of `bits`.
    pub fn from_bits(&self, bits: &BitBuffer, count: usize) -> Result<Vec<u64>, CodewordError> {
        let mut source = bits.iter();
        let mut indices = Vec::with_capacity(count);
        match self.code {
            IndexCode::Universal => {
                for _ in 0..count {
                    indices.push(read_exp_golomb(&mut source)?);
                }
            }
            IndexCode::Uniform { alphabet_size } => {
                let width = fixed_width(alphabet_size);
                for _ in 0..count {
                    let mut index = 0u64;
                    for _ in 0..width {
                        let bit = source.next().ok_or(CodewordError::Truncated)?;
                        index = (index << 1) | bit as u64;
                    }
                    if index >= alphabet_size {
                        return Err(CodewordError::OutOfRange {
                            index,
                            alphabet_size,
                        });
                    }
                    indices.push(index);
                }
            }
        }
        Ok(indices)
    }
}

#[inline]
fn fixed_width(alphabet_size: u64) -> u32 {
    u64::BITS - (alphabet_size - 1).leading_zeros()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodewordError {
    #[error("bit string ended in the middle of a codeword")]
    Truncated,

    #[error("codeword does not fit into the integer type")]
    Overflow,

    #[error("index {index} is outside of the alphabet 0..{alphabet_size}")]
    OutOfRange { index: u64, alphabet_size: u64 },
}

// EXPONENTIAL-GOLOMB CODE ====================================================
//
// The codeword of `k` is the binary representation of `k + 1`, preceded by one fewer
// zeros than it has digits, e.g., `0 → 1`, `1 → 010`, `3 → 00100`. Digits are counted in
// `u128` so that `u64::MAX` needs no special case: its codeword is 64 zeros, a `1`, and
// another 64 zeros.

/// Length of the Exponential-Golomb codeword of `index` in bits.
pub fn exp_golomb_len(index: u64) -> u32 {
    2 * significant_bits(index) - 1
}

#[inline]
fn significant_bits(index: u64) -> u32 {
    u128::BITS - (index as u128 + 1).leading_zeros()
}

fn write_exp_golomb(index: u64, bits: &mut BitBuffer) {
    let digits = significant_bits(index);
    for _ in 1..digits {
        bits.push(false);
    }
    let value = index as u128 + 1;
    for shift in (0..digits).rev() {
        bits.push((value >> shift) & 1 != 0);
    }
}

fn read_exp_golomb(source: &mut impl Iterator<Item = bool>) -> Result<u64, CodewordError> {
    let mut zeros = 0u32;
    loop {
        match source.next() {
            Some(false) => zeros += 1,
            Some(true) => break,
            None => return Err(CodewordError::Truncated),
        }
        if zeros > u64::BITS {
            return Err(CodewordError::Overflow);
        }
    }

    let mut value = 1u128;
    for _ in 0..zeros {
        let bit = source.next().ok_or(CodewordError::Truncated)?;
        value = (value << 1) | bit as u128;
    }
    u64::try_from(value - 1).map_err(|_| CodewordError::Overflow)
}

// BIT BUFFER =================================================================

/// Growable bit string, filled from the least significant bit of each `u32` word.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct BitBuffer {
    words: SmallVec<[u32; 4]>,
    len: usize,
}

impl BitBuffer {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn push(&mut self, bit: bool) {
        let offset = self.len % 32;
        if offset == 0 {
            self.words.push(0);
        }
        if bit {
            if let Some(word) = self.words.last_mut() {
                *word |= 1 << offset;
            }
        }
        self.len += 1;
    }

    /// Number of bits.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The bits, padded with zeros to full words.
    pub fn as_words(&self) -> &[u32] {
        &self.words
    }

    pub fn from_words(words: &[u32], len: usize) -> Option<Self> {
        if len > words.len() * 32 || words.len() > (len + 31) / 32 {
            return None;
        }
        Some(Self {
            words: words.iter().copied().collect(),
            len,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        (0..self.len).map(move |i| (self.words[i / 32] >> (i % 32)) & 1 != 0)
    }
}
