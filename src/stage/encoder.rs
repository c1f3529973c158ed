//! Text conditioning stage (T5 conditioners).

use super::{StageBuffer, StageKind, StageRunner, StageSettings, expect_type};
use crate::runtime::{Graph, GraphRuntime, TensorData, TensorType};
use crate::slots::{self, Slot, SlotRole};
use crate::stage::Residency;
use crate::tokenizer::EOS_TOKEN_ID;
use crate::{Error, Result};

/// Encoder outputs consumed by the diffuser.
#[derive(Debug, Clone, PartialEq)]
pub struct Conditioning {
    pub cross_attention: StageBuffer,
    /// Absent from newer exports.
    pub global: Option<StageBuffer>,
}

struct EncoderSlots {
    ids: Slot,
    mask: Slot,
    duration: Slot,
    cross_attention: Slot,
    global: Option<Slot>,
}

pub struct EncoderStage<'r, R: GraphRuntime> {
    runner: StageRunner<'r, R>,
    slots: Option<EncoderSlots>,
}

impl<'r, R: GraphRuntime> EncoderStage<'r, R> {
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

    fn resolve(&self) -> Result<EncoderSlots> {
        let stage = StageKind::Encoder;
        let graph = self.runner.graph()?;
        let (inputs, outputs) = (graph.inputs(), graph.outputs());
        tracing::debug!(format = ?slots::ExportFormat::detect(inputs), "encoder export");

        let ids = slots::require(stage, SlotRole::TokenIds, inputs, outputs)?;
        let mask = slots::require(stage, SlotRole::AttentionMask, inputs, outputs)?;
        let duration = slots::require(stage, SlotRole::Duration, inputs, outputs)?;
        let cross_attention = slots::require(stage, SlotRole::CrossAttentionOut, inputs, outputs)?;
        let global = slots::resolve(stage, SlotRole::GlobalConditioningOut, inputs, outputs)?;

        expect_type(stage, &ids, &[TensorType::Int32, TensorType::Int64])?;
        expect_type(
            stage,
            &mask,
            &[TensorType::Int32, TensorType::Int64, TensorType::Float32],
        )?;
        expect_type(
            stage,
            &duration,
            &[TensorType::Float32, TensorType::Int32, TensorType::Int64],
        )?;
        expect_type(stage, &cross_attention, &[TensorType::Float32])?;
        if let Some(global) = &global {
            expect_type(stage, global, &[TensorType::Float32])?;
        }

        tracing::info!(
            ids = %ids.info.name,
            mask = %mask.info.name,
            duration = %duration.info.name,
            cross_attention = %cross_attention.info.name,
            global = global.as_ref().map(|s| s.info.name.as_str()).unwrap_or("-"),
            "encoder slots"
        );

        Ok(EncoderSlots {
            ids,
            mask,
            duration,
            cross_attention,
            global,
        })
    }

    /// Capacity of the ids tensor, when loaded.
    pub fn max_tokens(&self) -> Option<usize> {
        self.slots.as_ref().map(|s| s.ids.element_count())
    }

    /// Bind the prompt and duration, run once and copy the conditioning out.
    pub fn encode(&mut self, token_ids: &[i64], duration_s: f32) -> Result<Conditioning> {
        let slots = self.slots.as_ref().ok_or(Error::SlotResolution {
            stage: StageKind::Encoder,
            role: SlotRole::TokenIds,
        })?;
        let (ids_slot, mask_slot, duration_slot) =
            (slots.ids.clone(), slots.mask.clone(), slots.duration.clone());
        let cross_slot = slots.cross_attention.clone();
        let global_slot = slots.global.clone();

        let tokens = fit_tokens(token_ids, ids_slot.element_count());
        let bound = tokens.len();

        match self.runner.input_mut(&ids_slot)? {
            TensorData::I32(buf) => fill_prefix(buf, tokens.iter().map(|&t| t as i32), 0),
            TensorData::I64(buf) => fill_prefix(buf, tokens.iter().copied(), 0),
            other => return Err(unsupported(&ids_slot, other)),
        }
        match self.runner.input_mut(&mask_slot)? {
            TensorData::I32(buf) => fill_prefix(buf, std::iter::repeat_n(1, bound), 0),
            TensorData::I64(buf) => fill_prefix(buf, std::iter::repeat_n(1, bound), 0),
            TensorData::F32(buf) => fill_prefix(buf, std::iter::repeat_n(1.0, bound), 0.0),
        }
        match self.runner.input_mut(&duration_slot)? {
            TensorData::F32(buf) => buf.fill(duration_s),
            TensorData::I32(buf) => buf.fill(duration_s as i32),
            TensorData::I64(buf) => buf.fill(duration_s as i64),
        }
        tracing::debug!(tokens = bound, duration_s, "encoder inputs bound");

        self.runner.invoke(None)?;

        let cross_attention = self.runner.output_f32(&cross_slot)?.to_vec();
        tracing::debug!(
            elements = cross_attention.len(),
            mb = (cross_attention.len() * 4) as f64 / (1024.0 * 1024.0),
            "cross-attention conditioning captured"
        );
        let global = match &global_slot {
            Some(slot) => {
                let buf = self.runner.output_f32(slot)?.to_vec();
                tracing::debug!(elements = buf.len(), "global conditioning captured");
                Some(buf)
            }
            None => {
                tracing::info!("encoder export has no global conditioning output");
                None
            }
        };

        Ok(Conditioning {
            cross_attention,
            global,
        })
    }

    pub fn unload(&mut self) {
        self.slots = None;
        self.runner.unload();
    }
}

/// Truncate `tokens` to `capacity`, keeping the end-of-sequence id last.
fn fit_tokens(tokens: &[i64], capacity: usize) -> Vec<i64> {
    if tokens.len() <= capacity {
        return tokens.to_vec();
    }
    tracing::warn!(
        tokens = tokens.len(),
        capacity,
        "prompt longer than encoder input, truncating"
    );
    let mut fitted = tokens[..capacity].to_vec();
    if let Some(last) = fitted.last_mut() {
        *last = EOS_TOKEN_ID;
    }
    fitted
}

fn fill_prefix<T: Copy>(buf: &mut [T], values: impl Iterator<Item = T>, pad: T) {
    let mut n = 0;
    for (dst, v) in buf.iter_mut().zip(values) {
        *dst = v;
        n += 1;
    }
    buf[n..].fill(pad);
}

fn unsupported(slot: &Slot, data: &TensorData) -> Error {
    Error::UnsupportedTensorType {
        stage: StageKind::Encoder,
        role: slot.role,
        ty: data.tensor_type(),
    }
}
