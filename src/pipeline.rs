//! End-to-end generation: encoder → diffuser → decoder.
//!
//! [`AudioPipeline`] holds no model between calls. Each [`generate`] loads
//! the three stages one after another, copying the stage outputs into host
//! buffers and unloading every stage before the next one loads:
//!
//! ```text
//! tokens ─▶ Encoder ─▶ conditioning ─▶ Diffuser (N steps) ─▶ latent ─▶ Decoder ─▶ stereo
//!           [0, 10%]                     [10%, 85%]                    [85%, 95%]
//! ```
//!
//! Only one generation runs at a time; concurrent callers block on an
//! internal lock. Progress and cancellation live in a [`GenerationControl`]
//! that other threads can poll and signal while a call is in flight.
//!
//! [`generate`]: AudioPipeline::generate

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use crate::accelerator::ShaderCache;
use crate::audio::{self, StereoAudio};
use crate::config::{ModelPaths, PipelineConfig};
use crate::runtime::{DelegateKind, Graph, GraphRuntime, RuntimeError, TensorInfo};
use crate::stage::decoder::DecoderStage;
use crate::stage::diffuser::{DenoiseObserver, DiffusionParams, DiffuserStage};
use crate::stage::encoder::EncoderStage;
use crate::stage::{Residency, StageKind, StageRunner, StageSettings};
use crate::{Error, Result};

const PROGRESS_TOKENIZED: f32 = 0.02;
const PROGRESS_ENCODER_BOUND: f32 = 0.05;
const PROGRESS_ENCODED: f32 = 0.10;
const PROGRESS_DIFFUSION_SPAN: f32 = 0.75;
const PROGRESS_DIFFUSED: f32 = 0.85;
const PROGRESS_DECODED: f32 = 0.95;

/// Parameters for one generation.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    /// Prompt token ids, ending in the end-of-sequence id.
    pub token_ids: Vec<i64>,
    /// Target length in seconds. Clamped to the configured range.
    pub duration_s: f32,
    /// Sampler steps. Clamped to the configured range.
    pub steps: usize,
    pub seed: u64,
}

impl GenerationRequest {
    pub fn new(token_ids: Vec<i64>) -> Self {
        Self {
            token_ids,
            duration_s: 5.0,
            steps: 8,
            seed: 0,
        }
    }

    pub fn with_duration(mut self, duration_s: f32) -> Self {
        self.duration_s = duration_s;
        self
    }

    pub fn with_steps(mut self, steps: usize) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

/// Result of a successful generation.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedAudio {
    pub audio: StereoAudio,
    pub sample_rate: u32,
    /// Duration after clamping.
    pub duration_s: f32,
    /// Step count after clamping.
    pub steps: usize,
    pub seed: u64,
}

impl GeneratedAudio {
    pub fn frames(&self) -> usize {
        self.audio.frames()
    }
}

/// Output of [`AudioPipeline::generate_to_file`].
#[derive(Debug, Clone, PartialEq)]
pub struct WrittenAudio {
    pub path: PathBuf,
    pub frames: usize,
    pub sample_rate: u32,
    pub channels: u16,
    pub duration_s: f32,
    pub bytes: usize,
}

struct ControlState {
    progress: AtomicU32,
    cancel: AtomicBool,
}

/// Progress and cancellation shared with other threads.
///
/// Cloning is cheap; all clones observe the same generation.
#[derive(Clone)]
pub struct GenerationControl {
    state: Arc<ControlState>,
}

impl Default for GenerationControl {
    fn default() -> Self {
        Self {
            state: Arc::new(ControlState {
                progress: AtomicU32::new(0f32.to_bits()),
                cancel: AtomicBool::new(false),
            }),
        }
    }
}

impl fmt::Debug for GenerationControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationControl")
            .field("progress", &self.progress())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl GenerationControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fraction of the current generation completed, in [0, 1].
    pub fn progress(&self) -> f32 {
        f32::from_bits(self.state.progress.load(Ordering::Acquire))
    }

    /// Request that the current generation stop at its next checkpoint.
    pub fn cancel(&self) {
        self.state.cancel.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancel.load(Ordering::Acquire)
    }

    /// Raise progress to `value`. Lower values are ignored.
    fn advance(&self, value: f32) {
        let value = value.clamp(0.0, 1.0);
        let _ = self
            .state
            .progress
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                (value > f32::from_bits(bits)).then_some(value.to_bits())
            });
    }

    fn reset(&self) {
        self.state.progress.store(0f32.to_bits(), Ordering::Release);
        self.state.cancel.store(false, Ordering::Release);
    }

    fn checkpoint(&self, at: &str) -> Result<()> {
        if self.is_cancelled() {
            tracing::info!(at, "generation cancelled");
            return Err(Error::Cancelled);
        }
        Ok(())
    }
}

impl DenoiseObserver for GenerationControl {
    fn cancelled(&self) -> bool {
        self.is_cancelled()
    }

    fn step_done(&self, completed: usize, total: usize) {
        self.advance(PROGRESS_ENCODED + PROGRESS_DIFFUSION_SPAN * completed as f32 / total as f32);
    }
}

/// Declared tensors of one stage model.
#[derive(Debug, Clone, PartialEq)]
pub struct StageReport {
    pub stage: StageKind,
    pub path: PathBuf,
    pub delegate: DelegateKind,
    pub inputs: Vec<TensorInfo>,
    pub outputs: Vec<TensorInfo>,
}

/// Output of [`AudioPipeline::inspect`].
#[derive(Debug, Clone, PartialEq)]
pub struct InspectionReport {
    pub stages: Vec<StageReport>,
}

impl fmt::Display for InspectionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for report in &self.stages {
            writeln!(
                f,
                "== {} ({}, delegate: {})",
                report.stage,
                report.path.display(),
                report.delegate
            )?;
            for (label, tensors) in [("input", &report.inputs), ("output", &report.outputs)] {
                for (i, t) in tensors.iter().enumerate() {
                    writeln!(
                        f,
                        "  {label}[{i}] {:<40} {:<8} {:?} elements={} bytes={}",
                        t.name,
                        t.ty.to_string(),
                        t.dims,
                        t.element_count(),
                        t.bytes()
                    )?;
                }
            }
        }
        Ok(())
    }
}

/// Memory-constrained three-stage text-to-audio pipeline.
pub struct AudioPipeline<R: GraphRuntime> {
    config: PipelineConfig,
    paths: ModelPaths,
    runtime: R,
    cache: ShaderCache,
    control: GenerationControl,
    residency: Residency,
    generation: Mutex<()>,
    last_error: Mutex<Option<String>>,
    accelerator_active: AtomicBool,
}

impl<R: GraphRuntime> AudioPipeline<R> {
    /// Create a pipeline over the models in `model_dir`.
    ///
    /// Verifies that every model file and the tokenizer exist, but loads
    /// nothing.
    pub fn new(model_dir: impl AsRef<Path>, config: PipelineConfig, runtime: R) -> Result<Self> {
        config.validate()?;
        let paths = ModelPaths::resolve(model_dir, &config.files);
        paths.verify()?;
        let cache = ShaderCache::new(&paths.directory, &config.accelerator);
        if config.use_accelerator {
            cache.ensure_dir()?;
        }
        tracing::info!(
            dir = %paths.directory.display(),
            threads = config.threads(),
            accelerator = config.use_accelerator,
            "pipeline ready (models load on demand)"
        );
        Ok(Self {
            config,
            paths,
            runtime,
            cache,
            control: GenerationControl::new(),
            residency: Residency::new(),
            generation: Mutex::new(()),
            last_error: Mutex::new(None),
            accelerator_active: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn paths(&self) -> &ModelPaths {
        &self.paths
    }

    /// Handle for polling progress and cancelling from other threads.
    pub fn control(&self) -> GenerationControl {
        self.control.clone()
    }

    pub fn progress(&self) -> f32 {
        self.control.progress()
    }

    pub fn cancel(&self) {
        self.control.cancel();
    }

    /// Resident-model counter shared by all stages.
    pub fn residency(&self) -> &Residency {
        &self.residency
    }

    /// Message of the most recent failure, cleared when a generation starts.
    pub fn last_error(&self) -> Option<String> {
        lock(&self.last_error).clone()
    }

    /// Whether a GPU delegate can be attached in this build/device.
    pub fn accelerator_available(&self) -> bool {
        self.runtime.delegate_available(DelegateKind::Gpu)
    }

    /// Whether the shader cache has been prepared.
    pub fn accelerator_ready(&self) -> bool {
        self.cache.is_ready()
    }

    /// Whether a stage has run on the GPU delegate.
    pub fn accelerator_active(&self) -> bool {
        self.accelerator_active.load(Ordering::Acquire)
    }

    /// Run the full pipeline and return the trimmed stereo output.
    pub fn generate(&self, request: &GenerationRequest) -> Result<GeneratedAudio> {
        self.exclusive(|| self.run(request))
    }

    /// Run the full pipeline and write the result as a WAV file.
    ///
    /// The file is written after the decoder has been unloaded.
    pub fn generate_to_file(
        &self,
        request: &GenerationRequest,
        path: impl AsRef<Path>,
    ) -> Result<WrittenAudio> {
        let path = path.as_ref();
        self.exclusive(|| {
            let generated = self.run(request)?;
            let spec = audio::write_wav(path, &generated.audio, generated.sample_rate)?;
            tracing::info!(path = %path.display(), frames = spec.frames, "audio saved");
            Ok(WrittenAudio {
                path: path.to_path_buf(),
                frames: spec.frames,
                sample_rate: spec.sample_rate,
                channels: spec.channels,
                duration_s: generated.audio.duration_s(spec.sample_rate),
                bytes: spec.file_len(),
            })
        })
    }

    /// Compile the GPU path of the diffuser and decoder and mark the shader
    /// cache ready. Models load one at a time and only the GPU delegate is
    /// allowed.
    pub fn prepare_accelerator(&self) -> Result<()> {
        let _guard = lock(&self.generation);
        let result = self.prepare_accelerator_locked();
        if let Err(error) = &result {
            self.record_error(error);
        }
        result
    }

    fn prepare_accelerator_locked(&self) -> Result<()> {
        if !self.accelerator_available() {
            return Err(Error::Load {
                stage: StageKind::Diffuser,
                source: RuntimeError::DelegateUnavailable(DelegateKind::Gpu),
            });
        }
        self.cache.ensure_dir()?;
        for kind in [StageKind::Diffuser, StageKind::Decoder] {
            let start = Instant::now();
            let settings = self.settings(kind).gpu_only(&self.cache);
            let mut runner = StageRunner::new(&self.runtime, settings, self.residency.clone());
            runner.load()?;
            runner.unload();
            tracing::info!(stage = %kind, elapsed_ms = start.elapsed().as_millis() as u64, "gpu path compiled");
        }
        self.accelerator_active.store(true, Ordering::Release);
        self.cache.mark_ready()
    }

    /// Load each stage in turn and report its declared tensors.
    pub fn inspect(&self) -> Result<InspectionReport> {
        let _guard = lock(&self.generation);
        let mut stages = Vec::with_capacity(3);
        for kind in StageKind::ALL {
            let settings = self.settings(kind);
            let path = settings.model_path.clone();
            let mut runner = StageRunner::new(&self.runtime, settings, self.residency.clone());
            runner.load()?;
            let graph = runner.graph()?;
            let report = StageReport {
                stage: kind,
                path,
                delegate: runner.active_delegate().unwrap_or(DelegateKind::DefaultKernels),
                inputs: graph.inputs().to_vec(),
                outputs: graph.outputs().to_vec(),
            };
            runner.unload();
            stages.push(report);
        }
        Ok(InspectionReport { stages })
    }

    fn settings(&self, kind: StageKind) -> StageSettings {
        StageSettings::new(kind, &self.config, &self.paths, &self.cache)
    }

    /// Serialize with other generations and record the outcome.
    fn exclusive<T>(&self, body: impl FnOnce() -> Result<T>) -> Result<T> {
        let _guard = lock(&self.generation);
        self.control.reset();
        *lock(&self.last_error) = None;

        let result = body();
        match &result {
            Ok(_) => self.control.advance(1.0),
            Err(error) => self.record_error(error),
        }
        result
    }

    fn record_error(&self, error: &Error) {
        if error.is_cancelled() {
            tracing::info!("generation cancelled by caller");
        } else {
            tracing::error!(kind = ?error.kind(), %error, "generation failed");
        }
        *lock(&self.last_error) = Some(error.to_string());
    }

    fn run(&self, request: &GenerationRequest) -> Result<GeneratedAudio> {
        let duration_s = self.config.clamp_duration(request.duration_s);
        let steps = self.config.clamp_steps(request.steps);
        if duration_s != request.duration_s || steps != request.steps {
            tracing::info!(
                requested_duration_s = request.duration_s,
                duration_s,
                requested_steps = request.steps,
                steps,
                "request clamped"
            );
        }
        tracing::info!(
            tokens = request.token_ids.len(),
            duration_s,
            steps,
            seed = request.seed,
            "generating audio"
        );
        let start = Instant::now();
        self.control.advance(PROGRESS_TOKENIZED);

        self.control.checkpoint("encoder")?;
        let conditioning = {
            let mut encoder = EncoderStage::new(
                &self.runtime,
                self.settings(StageKind::Encoder),
                self.residency.clone(),
            );
            encoder.load()?;
            self.control.advance(PROGRESS_ENCODER_BOUND);
            let conditioning = encoder.encode(&request.token_ids, duration_s)?;
            encoder.unload();
            conditioning
        };
        self.control.advance(PROGRESS_ENCODED);

        self.control.checkpoint("diffuser")?;
        let latent = {
            let mut diffuser = DiffuserStage::new(
                &self.runtime,
                self.settings(StageKind::Diffuser),
                self.residency.clone(),
            );
            diffuser.load()?;
            self.note_delegate(diffuser.runner().active_delegate());
            diffuser.bind_conditioning(conditioning)?;
            let params = DiffusionParams {
                steps,
                sigma_max: self.config.sigma_max,
                seed: request.seed,
                seed_offset: self.config.noise_seed_offset,
            };
            let latent = diffuser.denoise(&params, &self.control)?;
            diffuser.unload();
            latent
        };
        self.control.advance(PROGRESS_DIFFUSED);

        self.control.checkpoint("decoder")?;
        let mut stereo = {
            let mut decoder = DecoderStage::new(
                &self.runtime,
                self.settings(StageKind::Decoder),
                self.residency.clone(),
            );
            decoder.load()?;
            self.note_delegate(decoder.runner().active_delegate());
            let stereo = decoder.decode(latent)?;
            decoder.unload();
            stereo
        };
        self.control.advance(PROGRESS_DECODED);

        let available = stereo.frames();
        let frames = audio::trimmed_frames(duration_s, self.config.sample_rate, available);
        stereo.truncate(frames);
        tracing::info!(
            available,
            frames,
            seconds = stereo.duration_s(self.config.sample_rate),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "generation complete"
        );

        Ok(GeneratedAudio {
            audio: stereo,
            sample_rate: self.config.sample_rate,
            duration_s,
            steps,
            seed: request.seed,
        })
    }

    fn note_delegate(&self, delegate: Option<DelegateKind>) {
        if delegate == Some(DelegateKind::Gpu) {
            self.accelerator_active.store(true, Ordering::Release);
        }
    }
}

/// Lock ignoring poisoning; the guarded state stays consistent across panics.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
