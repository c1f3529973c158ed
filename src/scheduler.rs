//! Noise schedule and seeded noise for the diffusion loop.
//!
//! The schedule interpolates log-SNR linearly from `logsnr_max` to `2.0` and
//! maps each point to a sigma through the logistic function:
//!
//! ```text
//! σ_i = 1 / (1 + exp(logsnr_i))
//! ```
//!
//! The first sigma is then pinned to the configured maximum and the last to 0.
//!
//! ## Randomness
//!
//! All noise comes from `ChaCha8Rng::seed_from_u64(seed)` sampled through
//! `rand_distr::StandardNormal` as `f32`. ChaCha output is specified
//! bit-for-bit, so a seed reproduces the same latent on every platform.

pub mod pingpong;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

/// Log-SNR at the start of a full-strength (`σmax = 1`) schedule.
pub const LOGSNR_MAX: f32 = -6.0;
/// Log-SNR at the end of every schedule.
pub const LOGSNR_MIN: f32 = 2.0;
/// Terminal sigma.
pub const SIGMA_MIN: f32 = 0.0;

/// Immutable sequence of `steps + 1` sigmas.
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseSchedule {
    sigmas: Vec<f32>,
}

impl NoiseSchedule {
    /// Build the schedule for `steps` sampler steps.
    ///
    /// `steps` is raised to 1 and `sigma_max` is expected in (0, 1].
    pub fn new(steps: usize, sigma_max: f32) -> Self {
        let steps = steps.max(1);
        let len = steps + 1;
        let start = logsnr_max(sigma_max);

        // Accumulated linspace in f32, pinned at both ends.
        let delta = (LOGSNR_MIN - start) / (len - 1) as f32;
        let mut sigmas = vec![0.0f32; len];
        sigmas[0] = start;
        sigmas[len - 1] = LOGSNR_MIN;
        for i in 1..len - 1 {
            sigmas[i] = sigmas[i - 1] + delta;
        }

        for s in sigmas.iter_mut() {
            *s = 1.0 / (1.0 + s.exp());
        }

        sigmas[0] = sigma_max;
        sigmas[len - 1] = SIGMA_MIN;
        Self { sigmas }
    }

    pub fn sigmas(&self) -> &[f32] {
        &self.sigmas
    }

    /// Number of sampler steps (one less than the number of sigmas).
    pub fn steps(&self) -> usize {
        self.sigmas.len() - 1
    }

    /// `(σ_i, σ_{i+1})` for step `i`.
    pub fn pair(&self, step: usize) -> Option<(f32, f32)> {
        Some((*self.sigmas.get(step)?, *self.sigmas.get(step + 1)?))
    }
}

/// Starting log-SNR for a given maximum sigma.
///
/// A reduced maximum starts the interpolation where the logistic curve
/// actually passes through it.
pub fn logsnr_max(sigma_max: f32) -> f32 {
    if sigma_max < 1.0 {
        ((1.0 - sigma_max) / sigma_max + 1e-6).ln()
    } else {
        LOGSNR_MAX
    }
}

/// Fill `buf` with standard-normal samples from `seed`.
pub fn fill_standard_normal(buf: &mut [f32], seed: u64) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    for x in buf.iter_mut() {
        *x = rng.sample(StandardNormal);
    }
}
