//! PingPong sampler (stochastic re-noising).
//!
//! Each step recovers the clean estimate from the model's prediction and
//! re-noises it toward the next point of the schedule:
//! ```text
//! x_0_hat = x_t - σ * v
//! x_next  = (1 - σ_next) * x_0_hat + σ_next * ε
//! ```
//! `ε` is drawn fresh every step from a seed derived from the request seed,
//! the step index and a fixed offset.

use super::fill_standard_normal;

/// Offset added to `seed + step` for per-step noise.
pub const DEFAULT_SEED_OFFSET: u64 = 4564;

#[derive(Debug, Clone, Copy)]
pub struct PingPongSampler {
    seed: u64,
    offset: u64,
}

impl PingPongSampler {
    pub fn new(seed: u64, offset: u64) -> Self {
        Self { seed, offset }
    }

    /// Seed used for the noise of step `step`.
    pub fn step_seed(&self, step: usize) -> u64 {
        self.seed.wrapping_add(step as u64).wrapping_add(self.offset)
    }

    /// Update `state` in place from `prediction`.
    ///
    /// `prediction` is overwritten with the denoised estimate. When
    /// `sigma_next` is zero no noise is drawn and `state` becomes the
    /// denoised estimate exactly.
    pub fn step(
        &self,
        prediction: &mut [f32],
        state: &mut [f32],
        sigma: f32,
        sigma_next: f32,
        step: usize,
    ) {
        debug_assert_eq!(prediction.len(), state.len());

        for (p, &x) in prediction.iter_mut().zip(state.iter()) {
            *p = x - sigma * *p;
        }

        if sigma_next == 0.0 {
            state.copy_from_slice(prediction);
            return;
        }

        let mut noise = vec![0.0f32; state.len()];
        fill_standard_normal(&mut noise, self.step_seed(step));
        for ((x, &d), &n) in state.iter_mut().zip(prediction.iter()).zip(noise.iter()) {
            *x = (1.0 - sigma_next) * d + sigma_next * n;
        }
    }
}
