//! Configuration shared by [`RejectionCoder`](crate::RejectionCoder) and
//! [`BeamCoder`](crate::BeamCoder).
//!
//! Each coder only reads the fields that concern it, so a single configuration object
//! can be deserialized once (e.g., from an experiment's JSON or TOML file) and handed to
//! whichever coder is selected at run time.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ConfigurationError;

/// Capacities of the two buffers of a [`SamplerBufferPool`](crate::SamplerBufferPool),
/// counted in scalars (`f64`s).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerBufferSizes {
    pub candidate_capacity: usize,
    pub uniform_capacity: usize,
}

impl Default for SamplerBufferSizes {
    fn default() -> Self {
        Self {
            candidate_capacity: 10_000,
            uniform_capacity: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoderConfig {
    /// KL budget of a single partition, in nats.
    pub kl_per_partition: f64,

    pub sampler_buffer_sizes: SamplerBufferSizes,

    /// Beam width `W` of the [`BeamCoder`](crate::BeamCoder).
    pub n_carry_over: usize,

    /// Number `K` of candidates that the [`BeamCoder`](crate::BeamCoder) draws per beam
    /// and partition.
    pub candidates_per_partition: usize,

    /// Draw cap of the [`RejectionCoder`](crate::RejectionCoder); when it is reached, the
    /// best draw seen so far is accepted.
    pub max_draws_per_partition: u64,

    /// Multiple of the estimated standard deviation of the log importance weight by which
    /// the rejection bound exceeds the partition's KL.
    pub bound_slack: f64,

    /// Scale of the Gumbel noise added to beam scores (zero for a deterministic search).
    pub beam_perturbation: f64,

    /// Abort a whole `encode` call if it takes longer than this.
    pub timeout: Option<Duration>,
}

impl Default for CoderConfig {
    fn default() -> Self {
        Self {
            kl_per_partition: 6.0,
            sampler_buffer_sizes: SamplerBufferSizes::default(),
            n_carry_over: 10,
            candidates_per_partition: 1024,
            max_draws_per_partition: 1 << 28,
            bound_slack: 1.0,
            beam_perturbation: 0.0,
            timeout: None,
        }
    }
}

impl CoderConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        use ConfigurationError::*;

        if !(self.kl_per_partition.is_finite() && self.kl_per_partition > 0.0) {
            return Err(InvalidBudget(self.kl_per_partition));
        }

        let checks = [
            (
                self.sampler_buffer_sizes.candidate_capacity == 0,
                "candidate_capacity",
                "must be positive",
            ),
            (
                self.sampler_buffer_sizes.uniform_capacity == 0,
                "uniform_capacity",
                "must be positive",
            ),
            (self.n_carry_over == 0, "n_carry_over", "must be at least 1"),
            (
                self.candidates_per_partition < 2,
                "candidates_per_partition",
                "must be at least 2",
            ),
            (
                self.max_draws_per_partition == 0,
                "max_draws_per_partition",
                "must be positive",
            ),
            (
                !(self.bound_slack.is_finite() && self.bound_slack >= 0.0),
                "bound_slack",
                "must be finite and non-negative",
            ),
            (
                !(self.beam_perturbation.is_finite() && self.beam_perturbation >= 0.0),
                "beam_perturbation",
                "must be finite and non-negative",
            ),
        ];

        match checks.iter().find(|(failed, _, _)| *failed) {
            Some(&(_, name, reason)) => Err(InvalidParameter { name, reason }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        CoderConfig::default().validate().unwrap();
    }

    #[test]
    fn invalid_values() {
        let config = CoderConfig {
            kl_per_partition: -1.0,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigurationError::InvalidBudget(-1.0))
        );

        let config = CoderConfig {
            n_carry_over: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidParameter {
                name: "n_carry_over",
                ..
            })
        ));

        let config = CoderConfig {
            sampler_buffer_sizes: SamplerBufferSizes {
                candidate_capacity: 0,
                uniform_capacity: 10,
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = CoderConfig {
            bound_slack: f64::INFINITY,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: CoderConfig = serde_json::from_str(
            r#"{"kl_per_partition": 3.0, "sampler_buffer_sizes": {"candidate_capacity": 64}}"#,
        )
        .unwrap();
        assert_eq!(config.kl_per_partition, 3.0);
        assert_eq!(config.sampler_buffer_sizes.candidate_capacity, 64);
        assert_eq!(config.sampler_buffer_sizes.uniform_capacity, 1_000_000);
        assert_eq!(config.n_carry_over, 10);

        let json = serde_json::to_string(&config).unwrap();
        let back: CoderConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
