//! Update clipping, Gaussian noise and a rough privacy-budget estimate.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{CoreError, CoreResult};
use crate::model::Tensor;

/// What [`PrivacyEngine::apply`] actually did.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct PrivacyReport {
    pub clipped_tensors: usize,
    pub noised: bool,
    pub noise_std: Option<f64>,
}

/// Clipping plus optional Gaussian noise for weight deltas.
pub struct PrivacyEngine {
    clip_norm: Option<f64>,
    noise_multiplier: Option<f64>,
    enabled: bool,
    rng: StdRng,
}

impl PrivacyEngine {
    pub fn new(
        clip_norm: Option<f64>,
        noise_multiplier: Option<f64>,
        enabled: bool,
    ) -> CoreResult<Self> {
        if let Some(norm) = clip_norm {
            if !(norm > 0.0) {
                return Err(CoreError::InvalidPrivacyParameters(format!(
                    "clip_norm must be positive, got {norm}"
                )));
            }
        }
        if let Some(noise) = noise_multiplier {
            if noise < 0.0 || !noise.is_finite() {
                return Err(CoreError::InvalidPrivacyParameters(format!(
                    "noise_multiplier must be a non-negative number, got {noise}"
                )));
            }
        }
        Ok(Self {
            clip_norm,
            noise_multiplier,
            enabled,
            rng: StdRng::from_entropy(),
        })
    }

    /// Create with a deterministic seed (for testing).
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Noise std-dev when DP noise will actually be added.
    pub fn effective_noise(&self) -> Option<f64> {
        match (self.enabled, self.noise_multiplier) {
            (true, Some(noise)) if noise > 0.0 => Some(noise),
            _ => None,
        }
    }

    /// Scale `tensor` down so its L2 norm does not exceed the clip norm.
    pub fn clip(&self, tensor: &mut Tensor) -> bool {
        let Some(limit) = self.clip_norm else {
            return false;
        };
        let norm = tensor.l2_norm();
        if norm > limit {
            let scale = (limit / norm) as f32;
            for v in tensor.data.iter_mut() {
                *v *= scale;
            }
            true
        } else {
            false
        }
    }

    /// Clip every tensor, then add i.i.d. Gaussian noise when DP is enabled
    /// with a positive multiplier. DP without one is logged and skipped.
    pub fn apply(&mut self, deltas: &mut [Tensor]) -> CoreResult<PrivacyReport> {
        let mut clipped_tensors = 0;
        for tensor in deltas.iter_mut() {
            if self.clip(tensor) {
                clipped_tensors += 1;
            }
        }

        let Some(std) = self.effective_noise() else {
            if self.enabled {
                warn!(
                    "Differential privacy requested without a positive noise_multiplier; \
                     skipping noise"
                );
            }
            return Ok(PrivacyReport {
                clipped_tensors,
                noised: false,
                noise_std: None,
            });
        };

        let normal = Normal::new(0.0, std)
            .map_err(|e| CoreError::InvalidPrivacyParameters(e.to_string()))?;
        for tensor in deltas.iter_mut() {
            for v in tensor.data.iter_mut() {
                *v += normal.sample(&mut self.rng) as f32;
            }
        }

        Ok(PrivacyReport {
            clipped_tensors,
            noised: true,
            noise_std: Some(std),
        })
    }
}

/// Simplified epsilon estimate: `(batch_size / dataset_size * steps) /
/// noise_multiplier^2` with `steps = epochs * ceil(dataset_size / batch_size)`.
///
/// This is an approximation, not a moments-accountant computation, and it
/// does not use `delta` beyond validating it. Returns infinity when there is
/// no noise.
pub fn calculate_privacy_budget(
    epochs: usize,
    batch_size: usize,
    dataset_size: usize,
    noise_multiplier: f64,
    delta: f64,
) -> CoreResult<f64> {
    if batch_size == 0 || dataset_size == 0 {
        return Err(CoreError::InvalidPrivacyParameters(format!(
            "batch_size ({batch_size}) and dataset_size ({dataset_size}) must be positive"
        )));
    }
    if !(delta > 0.0 && delta < 1.0) {
        return Err(CoreError::InvalidPrivacyParameters(format!(
            "delta must be in (0, 1), got {delta}"
        )));
    }
    if noise_multiplier <= 0.0 {
        return Ok(f64::INFINITY);
    }

    let sampling_ratio = (batch_size as f64 / dataset_size as f64).min(1.0);
    let steps = (epochs * dataset_size.div_ceil(batch_size)) as f64;
    Ok(sampling_ratio * steps / (noise_multiplier * noise_multiplier))
}
