//! Scripted in-memory runtime for driving the pipeline without real models.
//!
//! Model files hold a single word naming the stage (`encoder`, `diffuser`,
//! `decoder`); the runtime builds a small graph with the matching tensor
//! layout and deterministic arithmetic in place of inference.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use stable_audio_rs::config::PipelineConfig;
use stable_audio_rs::pipeline::{AudioPipeline, GenerationControl};
use stable_audio_rs::runtime::{
    DelegateConfig, DelegateKind, Graph, GraphOptions, GraphRuntime, ModelFile, RuntimeError,
    TensorData, TensorInfo, TensorType,
};

pub const SAMPLE_RATE: usize = 44_100;
pub const MAX_TOKENS: usize = 8;
pub const LATENT_DIMS: [usize; 3] = [1, 4, 16];
pub const LATENT_LEN: usize = 64;
/// Frames per channel the decoder emits.
pub const DECODED_FRAMES: usize = 4 * SAMPLE_RATE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelKind {
    Encoder,
    Diffuser,
    Decoder,
}

/// One successful graph build.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildRecord {
    pub model: ModelKind,
    pub delegate: DelegateKind,
    pub threads: usize,
    pub low_memory: bool,
}

/// Knobs and recordings shared between a test and its runtime.
pub struct Script {
    unavailable: Mutex<HashSet<DelegateKind>>,
    rejected: Mutex<HashSet<(ModelKind, DelegateKind)>>,
    ids_type: Mutex<TensorType>,
    mask_type: Mutex<TensorType>,
    decoder_input_len: AtomicUsize,
    builds: Mutex<Vec<BuildRecord>>,
    diffuser_invokes: AtomicUsize,
    cancel_after: Mutex<Option<(usize, GenerationControl)>>,
    live: AtomicUsize,
    peak_live: AtomicUsize,
    last_ids: Mutex<Vec<i64>>,
    last_mask: Mutex<Vec<f32>>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            unavailable: Mutex::new(HashSet::new()),
            rejected: Mutex::new(HashSet::new()),
            ids_type: Mutex::new(TensorType::Int64),
            mask_type: Mutex::new(TensorType::Int64),
            decoder_input_len: AtomicUsize::new(LATENT_LEN),
            builds: Mutex::new(Vec::new()),
            diffuser_invokes: AtomicUsize::new(0),
            cancel_after: Mutex::new(None),
            live: AtomicUsize::new(0),
            peak_live: AtomicUsize::new(0),
            last_ids: Mutex::new(Vec::new()),
            last_mask: Mutex::new(Vec::new()),
        }
    }
}

impl Script {
    pub fn make_unavailable(&self, kind: DelegateKind) {
        self.unavailable.lock().unwrap().insert(kind);
    }

    /// Make `delegate` fail at build time for `model`.
    pub fn reject(&self, model: ModelKind, delegate: DelegateKind) {
        self.rejected.lock().unwrap().insert((model, delegate));
    }

    pub fn set_encoder_types(&self, ids: TensorType, mask: TensorType) {
        *self.ids_type.lock().unwrap() = ids;
        *self.mask_type.lock().unwrap() = mask;
    }

    /// Declare a decoder input of `len` elements instead of the latent size.
    pub fn set_decoder_input_len(&self, len: usize) {
        self.decoder_input_len.store(len, Ordering::SeqCst);
    }

    /// Signal `control` once the diffuser has run `invokes` forward passes in
    /// total. Fires once.
    pub fn cancel_after(&self, invokes: usize, control: GenerationControl) {
        *self.cancel_after.lock().unwrap() = Some((invokes, control));
    }

    pub fn builds(&self) -> Vec<BuildRecord> {
        self.builds.lock().unwrap().clone()
    }

    pub fn build_for(&self, model: ModelKind) -> Option<BuildRecord> {
        self.builds().into_iter().rev().find(|b| b.model == model)
    }

    pub fn diffuser_invokes(&self) -> usize {
        self.diffuser_invokes.load(Ordering::SeqCst)
    }

    /// Graphs alive right now.
    pub fn live_graphs(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Most graphs ever alive at once.
    pub fn peak_live_graphs(&self) -> usize {
        self.peak_live.load(Ordering::SeqCst)
    }

    pub fn last_ids(&self) -> Vec<i64> {
        self.last_ids.lock().unwrap().clone()
    }

    pub fn last_mask(&self) -> Vec<f32> {
        self.last_mask.lock().unwrap().clone()
    }
}

#[derive(Clone, Default)]
pub struct ScriptedRuntime {
    pub script: Arc<Script>,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GraphRuntime for ScriptedRuntime {
    type Graph = ScriptedGraph;

    fn delegate_available(&self, kind: DelegateKind) -> bool {
        !self.script.unavailable.lock().unwrap().contains(&kind)
    }

    fn build(
        &self,
        model: &ModelFile,
        options: &GraphOptions,
        delegate: &DelegateConfig,
    ) -> Result<ScriptedGraph, RuntimeError> {
        let kind = match model.bytes() {
            b"encoder" => ModelKind::Encoder,
            b"diffuser" => ModelKind::Diffuser,
            b"decoder" => ModelKind::Decoder,
            _ => return Err(RuntimeError::Build("not a scripted model".into())),
        };
        if self.script.rejected.lock().unwrap().contains(&(kind, delegate.kind())) {
            return Err(RuntimeError::DelegateRejected {
                kind: delegate.kind(),
                reason: "scripted rejection".into(),
            });
        }

        let low_memory = matches!(
            delegate,
            DelegateConfig::OptimizedCpu {
                low_memory: true,
                ..
            }
        );
        self.script.builds.lock().unwrap().push(BuildRecord {
            model: kind,
            delegate: delegate.kind(),
            threads: options.threads,
            low_memory,
        });

        let (inputs, outputs) = self.layout(kind);
        let now = self.script.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.script.peak_live.fetch_max(now, Ordering::SeqCst);

        Ok(ScriptedGraph {
            kind,
            inputs,
            outputs,
            input_data: Vec::new(),
            output_data: Vec::new(),
            script: Arc::clone(&self.script),
        })
    }
}

impl ScriptedRuntime {
    fn layout(&self, kind: ModelKind) -> (Vec<TensorInfo>, Vec<TensorInfo>) {
        let f32 = TensorType::Float32;
        match kind {
            ModelKind::Encoder => (
                vec![
                    TensorInfo::new("input_ids", *self.script.ids_type.lock().unwrap(), &[1, MAX_TOKENS]),
                    TensorInfo::new(
                        "attention_mask",
                        *self.script.mask_type.lock().unwrap(),
                        &[1, MAX_TOKENS],
                    ),
                    TensorInfo::new("seconds_total", f32, &[1]),
                ],
                vec![
                    TensorInfo::new("cross_attn_cond", f32, &[1, MAX_TOKENS, 4]),
                    TensorInfo::new("global_cond", f32, &[1, 4]),
                ],
            ),
            ModelKind::Diffuser => (
                vec![
                    TensorInfo::new("x", f32, &LATENT_DIMS),
                    TensorInfo::new("t", f32, &[1]),
                    TensorInfo::new("cross_attn_cond", f32, &[1, MAX_TOKENS, 4]),
                    TensorInfo::new("global_cond", f32, &[1, 4]),
                ],
                vec![TensorInfo::new("denoised", f32, &LATENT_DIMS)],
            ),
            ModelKind::Decoder => (
                vec![TensorInfo::new(
                    "latent",
                    f32,
                    &[self.script.decoder_input_len.load(Ordering::SeqCst)],
                )],
                vec![TensorInfo::new("audio", f32, &[1, 2, DECODED_FRAMES])],
            ),
        }
    }
}

pub struct ScriptedGraph {
    kind: ModelKind,
    inputs: Vec<TensorInfo>,
    outputs: Vec<TensorInfo>,
    input_data: Vec<Option<TensorData>>,
    output_data: Vec<Option<TensorData>>,
    script: Arc<Script>,
}

impl Drop for ScriptedGraph {
    fn drop(&mut self) {
        self.script.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedGraph {
    fn f32_input(&self, index: usize) -> Result<&[f32], RuntimeError> {
        self.input_data
            .get(index)
            .and_then(|d| d.as_ref())
            .and_then(TensorData::as_f32)
            .ok_or_else(|| RuntimeError::Invocation(format!("input {index} is not float")))
    }

    fn set_output(&mut self, index: usize, values: Vec<f32>) {
        self.output_data[index] = Some(TensorData::F32(values));
    }

    fn run_encoder(&mut self) -> Result<(), RuntimeError> {
        let ids: Vec<i64> = match &self.input_data[0] {
            Some(TensorData::I64(v)) => v.clone(),
            Some(TensorData::I32(v)) => v.iter().map(|&x| x as i64).collect(),
            _ => return Err(RuntimeError::Invocation("ids not bound".into())),
        };
        let mask: Vec<f32> = match &self.input_data[1] {
            Some(TensorData::I64(v)) => v.iter().map(|&x| x as f32).collect(),
            Some(TensorData::I32(v)) => v.iter().map(|&x| x as f32).collect(),
            Some(TensorData::F32(v)) => v.clone(),
            None => return Err(RuntimeError::Invocation("mask not bound".into())),
        };
        let seconds = self.f32_input(2)?[0];
        *self.script.last_ids.lock().unwrap() = ids.clone();
        *self.script.last_mask.lock().unwrap() = mask.clone();

        let cross = (0..MAX_TOKENS * 4)
            .map(|i| ids[i / 4] as f32 * mask[i / 4] * 0.01 + (i % 4) as f32 * 0.1)
            .collect();
        let global = (0..4).map(|i| seconds * 0.1 + i as f32 * 0.01).collect();
        self.set_output(0, cross);
        self.set_output(1, global);
        Ok(())
    }

    fn run_diffuser(&mut self) -> Result<(), RuntimeError> {
        let x = self.f32_input(0)?;
        let t = self.f32_input(1)?[0];
        let cross = self.f32_input(2)?;
        let global = self.f32_input(3)?;
        let out = x
            .iter()
            .enumerate()
            .map(|(i, &v)| v * (1.0 - t) * 0.5 + cross[i % cross.len()] * 0.1 + global[i % 4])
            .collect();
        self.set_output(0, out);

        let done = self.script.diffuser_invokes.fetch_add(1, Ordering::SeqCst) + 1;
        let mut pending = self.script.cancel_after.lock().unwrap();
        if pending.as_ref().is_some_and(|(after, _)| done >= *after)
            && let Some((_, control)) = pending.take()
        {
            control.cancel();
        }
        Ok(())
    }

    fn run_decoder(&mut self) -> Result<(), RuntimeError> {
        let latent = self.f32_input(0)?;
        // Planar: frame j of the right half mirrors frame j of the left half.
        let audio = (0..2 * DECODED_FRAMES)
            .map(|i| {
                let channel = if i < DECODED_FRAMES { 1.0 } else { -1.0 };
                let frame = i % DECODED_FRAMES;
                channel * (latent[frame % latent.len()] * 0.1).tanh()
            })
            .collect();
        self.set_output(0, audio);
        Ok(())
    }
}

impl Graph for ScriptedGraph {
    fn inputs(&self) -> &[TensorInfo] {
        &self.inputs
    }

    fn outputs(&self) -> &[TensorInfo] {
        &self.outputs
    }

    fn allocate(&mut self) -> Result<(), RuntimeError> {
        self.input_data = self.inputs.iter().map(TensorData::zeroed).collect();
        self.output_data = vec![None; self.outputs.len()];
        Ok(())
    }

    fn input_mut(&mut self, index: usize) -> Option<&mut TensorData> {
        self.input_data.get_mut(index)?.as_mut()
    }

    fn output(&self, index: usize) -> Option<&TensorData> {
        self.output_data.get(index)?.as_ref()
    }

    fn allocated_bytes(&self) -> usize {
        self.input_data
            .iter()
            .chain(&self.output_data)
            .flatten()
            .map(TensorData::bytes)
            .sum()
    }

    fn invoke(&mut self) -> Result<(), RuntimeError> {
        match self.kind {
            ModelKind::Encoder => self.run_encoder(),
            ModelKind::Diffuser => self.run_diffuser(),
            ModelKind::Decoder => self.run_decoder(),
        }
    }
}

/// Write the three scripted models and a placeholder tokenizer into `dir`.
pub fn write_models(dir: &Path) {
    let files = stable_audio_rs::config::ModelFiles::default();
    std::fs::write(dir.join(&files.encoder), b"encoder").unwrap();
    std::fs::write(dir.join(&files.diffuser), b"diffuser").unwrap();
    std::fs::write(dir.join(&files.decoder), b"decoder").unwrap();
    std::fs::write(dir.join(&files.tokenizer), b"{}").unwrap();
}

/// A model directory with a pipeline over a fresh scripted runtime.
pub struct Fixture {
    pub dir: tempfile::TempDir,
    pub script: Arc<Script>,
    pub pipeline: AudioPipeline<ScriptedRuntime>,
}

pub fn fixture() -> Fixture {
    fixture_with(PipelineConfig::default(), |_| {})
}

pub fn fixture_with(config: PipelineConfig, setup: impl FnOnce(&Script)) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    write_models(dir.path());
    let runtime = ScriptedRuntime::new();
    setup(&runtime.script);
    let script = Arc::clone(&runtime.script);
    let pipeline = AudioPipeline::new(dir.path(), config, runtime).unwrap();
    Fixture {
        dir,
        script,
        pipeline,
    }
}
