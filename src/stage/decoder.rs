//! Latent-to-waveform stage (autoencoder decoder).
//!
//! The decoder is the largest intermediate-memory consumer, so unlike the
//! conditioning copy the latent must fit its input exactly.

use super::{StageBuffer, StageKind, StageRunner, StageSettings, expect_type};
use crate::audio::StereoAudio;
use crate::runtime::{Graph, GraphRuntime, TensorType};
use crate::slots::{self, Slot, SlotRole};
use crate::stage::Residency;
use crate::{Error, Result};

#[derive(Clone)]
struct DecoderSlots {
    latent: Slot,
    audio: Slot,
}

pub struct DecoderStage<'r, R: GraphRuntime> {
    runner: StageRunner<'r, R>,
    slots: Option<DecoderSlots>,
}

impl<'r, R: GraphRuntime> DecoderStage<'r, R> {
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

    fn resolve(&self) -> Result<DecoderSlots> {
        let stage = StageKind::Decoder;
        let graph = self.runner.graph()?;
        let (inputs, outputs) = (graph.inputs(), graph.outputs());

        let latent = slots::require(stage, SlotRole::LatentIn, inputs, outputs)?;
        let audio = slots::require(stage, SlotRole::AudioOut, inputs, outputs)?;
        expect_type(stage, &latent, &[TensorType::Float32])?;
        expect_type(stage, &audio, &[TensorType::Float32])?;

        tracing::info!(
            latent = %latent.info.name,
            latent_elements = latent.element_count(),
            audio = %audio.info.name,
            audio_dims = ?audio.info.dims,
            "decoder slots"
        );
        Ok(DecoderSlots { latent, audio })
    }

    /// Input size the latent must match, when loaded.
    pub fn expected_latent_len(&self) -> Option<usize> {
        self.slots.as_ref().map(|s| s.latent.element_count())
    }

    /// Decode `latent` into planar stereo audio.
    ///
    /// Fails with [`Error::ShapeMismatch`] unless the latent length equals the
    /// decoder input size exactly. The latent buffer is freed once copied in.
    pub fn decode(&mut self, latent: StageBuffer) -> Result<StereoAudio> {
        let slots = self.slots.clone().ok_or(Error::SlotResolution {
            stage: StageKind::Decoder,
            role: SlotRole::LatentIn,
        })?;

        let input = self.runner.input_f32(&slots.latent)?;
        if input.len() != latent.len() {
            tracing::error!(
                latent = latent.len(),
                expected = input.len(),
                "latent does not match decoder input"
            );
            return Err(Error::ShapeMismatch {
                stage: StageKind::Decoder,
                role: SlotRole::LatentIn,
                expected: input.len(),
                actual: latent.len(),
            });
        }
        input.copy_from_slice(&latent);
        drop(latent);

        self.runner.invoke(None)?;

        let output = self.runner.output_f32(&slots.audio)?;
        let frames = output.len() / 2;
        let (left, right) = output.split_at(frames);
        let audio = StereoAudio {
            left: left.to_vec(),
            right: right[..frames].to_vec(),
        };
        tracing::debug!(frames, "decoder output captured");
        Ok(audio)
    }

    pub fn unload(&mut self) {
        self.slots = None;
        self.runner.unload();
    }
}
