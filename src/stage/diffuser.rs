//! Latent diffusion stage (DiT).
//!
//! The diffusion input tensor doubles as the sampler state: it is filled with
//! seeded noise once, then updated in place after every forward pass.

use std::time::Instant;

use super::encoder::Conditioning;
use super::{StageBuffer, StageKind, StageRunner, StageSettings, copy_lenient, expect_type};
use crate::runtime::{Graph, GraphRuntime, TensorType};
use crate::scheduler::pingpong::PingPongSampler;
use crate::scheduler::{NoiseSchedule, fill_standard_normal};
use crate::slots::{self, Slot, SlotRole};
use crate::stage::Residency;
use crate::{Error, Result};

/// Hooks polled by the diffusion loop.
pub trait DenoiseObserver {
    /// Checked before every step.
    fn cancelled(&self) -> bool;
    /// Called after step `completed` of `total` has been applied.
    fn step_done(&self, completed: usize, total: usize);
}

/// Sampler parameters for one request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiffusionParams {
    pub steps: usize,
    pub sigma_max: f32,
    pub seed: u64,
    pub seed_offset: u64,
}

#[derive(Clone)]
struct DiffuserSlots {
    x: Slot,
    t: Slot,
    cross_attention: Slot,
    global: Option<Slot>,
    out: Slot,
}

pub struct DiffuserStage<'r, R: GraphRuntime> {
    runner: StageRunner<'r, R>,
    slots: Option<DiffuserSlots>,
}

impl<'r, R: GraphRuntime> DiffuserStage<'r, R> {
    pub fn new(runtime: &'r R, settings: StageSettings, residency: Residency) -> Self {
        Self {
            runner: StageRunner::new(runtime, settings, residency),
            slots: None,
        }
    }

    pub fn runner(&self) -> &StageRunner<'r, R> {
        &self.runner
    }

    pub fn load(&mut self) -> Result<()> {
        if self.slots.is_some() {
            return Ok(());
        }
        self.runner.load()?;
        match self.resolve() {
            Ok(slots) => {
                self.slots = Some(slots);
                Ok(())
            }
            Err(error) => {
                self.runner.unload();
                Err(error)
            }
        }
    }

    fn resolve(&self) -> Result<DiffuserSlots> {
        let stage = StageKind::Diffuser;
        let graph = self.runner.graph()?;
        let (inputs, outputs) = (graph.inputs(), graph.outputs());
        tracing::debug!(format = ?slots::ExportFormat::detect(inputs), "diffuser export");

        let x = slots::require(stage, SlotRole::DiffusionInput, inputs, outputs)?;
        let t = slots::require(stage, SlotRole::DiffusionTime, inputs, outputs)?;
        let cross_attention = slots::require(stage, SlotRole::CrossAttentionIn, inputs, outputs)?;
        let global = slots::resolve(stage, SlotRole::GlobalConditioningIn, inputs, outputs)?;
        let out = slots::require(stage, SlotRole::DiffusionOutput, inputs, outputs)?;

        for slot in [&x, &t, &cross_attention, &out].into_iter().chain(global.as_ref()) {
            expect_type(stage, slot, &[TensorType::Float32])?;
        }
        if out.element_count() != x.element_count() {
            return Err(Error::ShapeMismatch {
                stage,
                role: SlotRole::DiffusionOutput,
                expected: x.element_count(),
                actual: out.element_count(),
            });
        }

        tracing::info!(
            x = %x.info.name,
            t = %t.info.name,
            cross_attention = %cross_attention.info.name,
            global = global.as_ref().map(|s| s.info.name.as_str()).unwrap_or("-"),
            out = %out.info.name,
            "diffuser slots"
        );

        Ok(DiffuserSlots {
            x,
            t,
            cross_attention,
            global,
            out,
        })
    }

    /// Element count of the latent this stage produces, when loaded.
    pub fn latent_len(&self) -> Option<usize> {
        self.slots.as_ref().map(|s| s.x.element_count())
    }

    /// Copy the encoder conditioning into the graph. The buffers are consumed
    /// and freed here.
    pub fn bind_conditioning(&mut self, conditioning: Conditioning) -> Result<()> {
        let slots = self.loaded_slots()?;
        let stage = StageKind::Diffuser;

        let dst = self.runner.input_f32(&slots.cross_attention)?;
        copy_lenient(stage, SlotRole::CrossAttentionIn, dst, &conditioning.cross_attention);

        match (&slots.global, &conditioning.global) {
            (Some(slot), Some(buf)) => {
                let dst = self.runner.input_f32(slot)?;
                copy_lenient(stage, SlotRole::GlobalConditioningIn, dst, buf);
            }
            (Some(slot), None) => {
                tracing::warn!(input = %slot.info.name, "diffuser expects global conditioning but encoder produced none, leaving zeros");
                self.runner.input_f32(slot)?.fill(0.0);
            }
            (None, Some(_)) => {
                tracing::info!("diffuser export has no global conditioning input, dropping buffer");
            }
            (None, None) => {}
        }
        drop(conditioning);
        Ok(())
    }

    /// Run the sampler loop and return the final latent.
    pub fn denoise(
        &mut self,
        params: &DiffusionParams,
        observer: &dyn DenoiseObserver,
    ) -> Result<StageBuffer> {
        let slots = self.loaded_slots()?;
        let schedule = NoiseSchedule::new(params.steps, params.sigma_max);
        let steps = schedule.steps();
        let sampler = PingPongSampler::new(params.seed, params.seed_offset);
        tracing::info!(
            steps,
            sigma_first = schedule.sigmas()[0],
            sigma_last = schedule.sigmas()[steps],
            "noise schedule"
        );

        fill_standard_normal(self.runner.input_f32(&slots.x)?, params.seed);
        let mut prediction = vec![0.0f32; slots.x.element_count()];

        let start = Instant::now();
        for step in 0..steps {
            if observer.cancelled() {
                tracing::info!(step, "diffusion cancelled");
                return Err(Error::Cancelled);
            }
            let Some((sigma, sigma_next)) = schedule.pair(step) else {
                break;
            };

            self.runner.input_f32(&slots.t)?.fill(sigma);
            self.runner.invoke(Some(step))?;
            let output = self.runner.output_f32(&slots.out)?;
            if output.len() != prediction.len() {
                return Err(Error::ShapeMismatch {
                    stage: StageKind::Diffuser,
                    role: SlotRole::DiffusionOutput,
                    expected: prediction.len(),
                    actual: output.len(),
                });
            }
            prediction.copy_from_slice(output);

            let state = self.runner.input_f32(&slots.x)?;
            sampler.step(&mut prediction, state, sigma, sigma_next, step);

            observer.step_done(step + 1, steps);
            if step < 2 || step + 2 >= steps {
                tracing::info!(step = step + 1, steps, sigma, sigma_next, "diffusion step");
            }
        }

        let elapsed_ms = start.elapsed().as_millis() as u64;
        tracing::info!(
            elapsed_ms,
            avg_step_ms = elapsed_ms as f64 / steps as f64,
            "diffusion done"
        );

        let latent = self.runner.input_f32(&slots.x)?.to_vec();
        tracing::debug!(
            elements = latent.len(),
            mb = (latent.len() * 4) as f64 / (1024.0 * 1024.0),
            "latent captured"
        );
        Ok(latent)
    }

    pub fn unload(&mut self) {
        self.slots = None;
        self.runner.unload();
    }

    fn loaded_slots(&self) -> Result<DiffuserSlots> {
        self.slots.clone().ok_or(Error::SlotResolution {
            stage: StageKind::Diffuser,
            role: SlotRole::DiffusionInput,
        })
    }
}
