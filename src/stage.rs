//! Lazily loaded model stages.
//!
//! Each of the three models is owned by a [`StageRunner`], a small state
//! machine:
//!
//! ```text
//! Unloaded ──load()──▶ Loading ──▶ Ready ──invoke()──▶ Invoking ──▶ Ready
//!     ▲                   │                                          │
//!     └──── failure ──────┘◀──────────────── unload() ───────────────┘
//! ```
//!
//! A loaded model lives in a [`ModelHandle`]. Handles register with a shared
//! [`Residency`] counter so the pipeline can assert that at most one model is
//! resident at any instant. Dropping a runner unloads it, so every early
//! return releases the model.
//!
//! The typed stages in [`encoder`], [`diffuser`] and [`decoder`] wrap a runner
//! with slot resolution and buffer handling.

pub mod decoder;
pub mod diffuser;
pub mod encoder;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use crate::accelerator::ShaderCache;
use crate::config::{ModelPaths, PipelineConfig};
use crate::runtime::{
    DelegateConfig, DelegateKind, Graph, GraphOptions, GraphRuntime, ModelFile, RuntimeError,
    TensorData, TensorType,
};
use crate::slots::{Slot, SlotRole};
use crate::{Error, Result};

/// Flat float buffer handed from one stage to the next.
pub type StageBuffer = Vec<f32>;

/// Which of the three models a stage runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Encoder,
    Diffuser,
    Decoder,
}

impl StageKind {
    pub const ALL: [StageKind; 3] = [StageKind::Encoder, StageKind::Diffuser, StageKind::Decoder];
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageKind::Encoder => "encoder",
            StageKind::Diffuser => "diffuser",
            StageKind::Decoder => "decoder",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Unloaded,
    Loading,
    Ready,
    Invoking,
}

/// Count of resident models, shared by every stage of one pipeline.
#[derive(Debug, Clone, Default)]
pub struct Residency {
    resident: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl Residency {
    pub fn new() -> Self {
        Self::default()
    }

    /// Models resident right now.
    pub fn current(&self) -> usize {
        self.resident.load(Ordering::SeqCst)
    }

    /// Highest value of [`current`](Self::current) since the last reset.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn reset_peak(&self) {
        self.peak.store(self.current(), Ordering::SeqCst);
    }

    fn enter(&self) -> ResidencyToken {
        let now = self.resident.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        ResidencyToken {
            resident: Arc::clone(&self.resident),
        }
    }
}

struct ResidencyToken {
    resident: Arc<AtomicUsize>,
}

impl Drop for ResidencyToken {
    fn drop(&mut self) {
        self.resident.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One loaded model: its graph, the mapped file backing it and the delegate
/// it was built with.
///
/// Fields drop in declaration order: graph first, then the mapping, then the
/// residency token.
pub struct ModelHandle<G> {
    graph: G,
    model: ModelFile,
    delegate: DelegateKind,
    _residency: ResidencyToken,
}

impl<G> ModelHandle<G> {
    pub fn delegate(&self) -> DelegateKind {
        self.delegate
    }

    pub fn model(&self) -> &ModelFile {
        &self.model
    }
}

/// Build-time settings of one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSettings {
    pub kind: StageKind,
    pub model_path: PathBuf,
    pub threads: usize,
    /// Delegates to try, in order. The last entry is the final fallback.
    pub delegates: Vec<DelegateConfig>,
}

impl StageSettings {
    /// Settings for `kind` under `config`.
    ///
    /// The encoder always runs on CPU. The diffuser and decoder try the GPU
    /// first when the accelerator is enabled. The decoder is pinned to one
    /// thread and low-memory CPU kernels to bound its working set.
    pub fn new(
        kind: StageKind,
        config: &PipelineConfig,
        paths: &ModelPaths,
        cache: &ShaderCache,
    ) -> Self {
        let (model_path, threads, low_memory) = match kind {
            StageKind::Encoder => (paths.encoder.clone(), config.threads(), false),
            StageKind::Diffuser => (paths.diffuser.clone(), config.threads(), false),
            StageKind::Decoder => (paths.decoder.clone(), 1, true),
        };

        let mut delegates = Vec::with_capacity(3);
        if config.use_accelerator && kind != StageKind::Encoder {
            delegates.push(gpu_delegate(cache));
        }
        delegates.push(DelegateConfig::OptimizedCpu {
            threads,
            low_memory,
        });
        delegates.push(DelegateConfig::DefaultKernels);

        Self {
            kind,
            model_path,
            threads,
            delegates,
        }
    }

    /// Settings allowing only the GPU delegate.
    pub fn gpu_only(mut self, cache: &ShaderCache) -> Self {
        self.delegates = vec![gpu_delegate(cache)];
        self
    }
}

fn gpu_delegate(cache: &ShaderCache) -> DelegateConfig {
    DelegateConfig::Gpu {
        cache_dir: cache.dir().to_path_buf(),
        model_token: cache.model_token().to_string(),
    }
}

/// Owns the lifecycle of one stage's model.
pub struct StageRunner<'r, R: GraphRuntime> {
    runtime: &'r R,
    settings: StageSettings,
    residency: Residency,
    state: StageState,
    handle: Option<ModelHandle<R::Graph>>,
}

impl<'r, R: GraphRuntime> StageRunner<'r, R> {
    pub fn new(runtime: &'r R, settings: StageSettings, residency: Residency) -> Self {
        Self {
            runtime,
            settings,
            residency,
            state: StageState::Unloaded,
            handle: None,
        }
    }

    pub fn kind(&self) -> StageKind {
        self.settings.kind
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    pub fn settings(&self) -> &StageSettings {
        &self.settings
    }

    /// Delegate the resident graph was built with.
    pub fn active_delegate(&self) -> Option<DelegateKind> {
        self.handle.as_ref().map(ModelHandle::delegate)
    }

    /// Map the model, build its graph and allocate tensors.
    ///
    /// No-op when already `Ready`. On failure the stage is `Unloaded` and
    /// everything acquired during the attempt has been released.
    pub fn load(&mut self) -> Result<()> {
        if self.handle.is_some() {
            tracing::debug!(stage = %self.kind(), "already loaded");
            return Ok(());
        }

        self.state = StageState::Loading;
        let result = self.try_load();
        match result {
            Ok(handle) => {
                self.handle = Some(handle);
                self.state = StageState::Ready;
                Ok(())
            }
            Err(error) => {
                self.state = StageState::Unloaded;
                Err(error)
            }
        }
    }

    fn try_load(&self) -> Result<ModelHandle<R::Graph>> {
        let kind = self.kind();
        let start = Instant::now();
        tracing::info!(stage = %kind, path = %self.settings.model_path.display(), "loading model");

        let token = self.residency.enter();
        let model = ModelFile::open(&self.settings.model_path)
            .map_err(|source| Error::Load { stage: kind, source })?;
        let options = GraphOptions {
            threads: self.settings.threads,
        };

        let (mut graph, delegate) = self.build_with_fallback(&model, &options)?;
        graph
            .allocate()
            .map_err(|source| Error::Load { stage: kind, source })?;

        log_memory(kind, &graph);
        tracing::info!(
            stage = %kind,
            %delegate,
            threads = self.settings.threads,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "model loaded"
        );

        Ok(ModelHandle {
            graph,
            model,
            delegate,
            _residency: token,
        })
    }

    fn build_with_fallback(
        &self,
        model: &ModelFile,
        options: &GraphOptions,
    ) -> Result<(R::Graph, DelegateKind)> {
        let kind = self.kind();
        let chain = &self.settings.delegates;
        let mut last_error = None;

        for (position, delegate) in chain.iter().enumerate() {
            let delegate_kind = delegate.kind();
            let is_last = position + 1 == chain.len();

            let attempt = if self.runtime.delegate_available(delegate_kind) {
                self.runtime.build(model, options, delegate)
            } else {
                Err(RuntimeError::DelegateUnavailable(delegate_kind))
            };

            match attempt {
                Ok(graph) => return Ok((graph, delegate_kind)),
                Err(error) if error.is_delegate_error() && !is_last => {
                    tracing::warn!(stage = %kind, delegate = %delegate_kind, %error, "delegate failed, falling back");
                    last_error = Some(error);
                }
                Err(error) => return Err(Error::Load { stage: kind, source: error }),
            }
        }

        Err(Error::Load {
            stage: kind,
            source: last_error.unwrap_or_else(|| RuntimeError::Build("empty delegate chain".into())),
        })
    }

    /// Release the graph, its delegate and the model mapping. Always safe.
    pub fn unload(&mut self) {
        if self.handle.take().is_some() {
            tracing::info!(stage = %self.kind(), "model unloaded");
        }
        self.state = StageState::Unloaded;
    }

    pub fn graph(&self) -> Result<&R::Graph> {
        self.handle
            .as_ref()
            .map(|h| &h.graph)
            .ok_or_else(|| self.not_loaded())
    }

    /// Run one forward pass. `step` tags errors from the diffusion loop.
    pub fn invoke(&mut self, step: Option<usize>) -> Result<()> {
        let kind = self.kind();
        let handle = self.handle.as_mut().ok_or(Error::Invocation {
            stage: kind,
            step,
            source: RuntimeError::Invocation("stage is not loaded".into()),
        })?;
        self.state = StageState::Invoking;
        let result = handle.graph.invoke();
        self.state = StageState::Ready;
        result.map_err(|source| Error::Invocation {
            stage: kind,
            step,
            source,
        })
    }

    pub fn input_mut(&mut self, slot: &Slot) -> Result<&mut TensorData> {
        let kind = self.kind();
        let handle = self.handle.as_mut().ok_or(Error::SlotResolution {
            stage: kind,
            role: slot.role,
        })?;
        handle
            .graph
            .input_mut(slot.index)
            .ok_or(Error::UnsupportedTensorType {
                stage: kind,
                role: slot.role,
                ty: slot.info.ty,
            })
    }

    pub fn output(&self, slot: &Slot) -> Result<&TensorData> {
        let kind = self.kind();
        let handle = self.handle.as_ref().ok_or(Error::SlotResolution {
            stage: kind,
            role: slot.role,
        })?;
        handle.graph.output(slot.index).ok_or(Error::Invocation {
            stage: kind,
            step: None,
            source: RuntimeError::Invocation(format!("output `{}` produced no data", slot.info.name)),
        })
    }

    /// Mutable float view of an input slot.
    pub fn input_f32(&mut self, slot: &Slot) -> Result<&mut [f32]> {
        let kind = self.kind();
        let (role, ty) = (slot.role, slot.info.ty);
        self.input_mut(slot)?
            .as_f32_mut()
            .ok_or(Error::UnsupportedTensorType { stage: kind, role, ty })
    }

    /// Float view of an output slot.
    pub fn output_f32(&self, slot: &Slot) -> Result<&[f32]> {
        let kind = self.kind();
        self.output(slot)?.as_f32().ok_or(Error::UnsupportedTensorType {
            stage: kind,
            role: slot.role,
            ty: slot.info.ty,
        })
    }

    fn not_loaded(&self) -> Error {
        Error::Invocation {
            stage: self.kind(),
            step: None,
            source: RuntimeError::Invocation("stage is not loaded".into()),
        }
    }
}

impl<R: GraphRuntime> Drop for StageRunner<'_, R> {
    fn drop(&mut self) {
        self.unload();
    }
}

/// Fail unless `slot` has one of `allowed` element types.
pub(crate) fn expect_type(stage: StageKind, slot: &Slot, allowed: &[TensorType]) -> Result<()> {
    if allowed.contains(&slot.info.ty) {
        Ok(())
    } else {
        Err(Error::UnsupportedTensorType {
            stage,
            role: slot.role,
            ty: slot.info.ty,
        })
    }
}

/// Copy `src` into `dst`, truncating or zero-padding on a size mismatch.
pub(crate) fn copy_lenient(stage: StageKind, role: SlotRole, dst: &mut [f32], src: &[f32]) {
    if src.len() != dst.len() {
        tracing::warn!(
            %stage,
            %role,
            buffer = src.len(),
            expected = dst.len(),
            "conditioning size mismatch, copying what fits"
        );
    }
    let n = src.len().min(dst.len());
    dst[..n].copy_from_slice(&src[..n]);
    dst[n..].fill(0.0);
}

/// Tensor footprint of a loaded graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorMemory {
    pub input_bytes: usize,
    pub output_bytes: usize,
    /// Every buffer the graph holds, bound or not.
    pub all_bytes: usize,
}

impl TensorMemory {
    pub fn of<G: Graph>(graph: &G) -> Self {
        Self {
            input_bytes: graph.inputs().iter().map(|t| t.bytes()).sum(),
            output_bytes: graph.outputs().iter().map(|t| t.bytes()).sum(),
            all_bytes: graph.allocated_bytes(),
        }
    }
}

fn log_memory<G: Graph>(stage: StageKind, graph: &G) {
    const MB: f64 = 1024.0 * 1024.0;
    let memory = TensorMemory::of(graph);
    tracing::debug!(
        %stage,
        input_mb = memory.input_bytes as f64 / MB,
        output_mb = memory.output_bytes as f64 / MB,
        all_tensors_mb = memory.all_bytes as f64 / MB,
        "tensor memory"
    );
}
