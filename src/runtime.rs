//! Tensor-graph runtime seam.
//!
//! Stages never talk to an inference engine directly. They build graphs
//! through [`GraphRuntime`], read declared tensors through [`Graph`], and fill
//! or read flat [`TensorData`] buffers. The ONNX Runtime backend lives in
//! [`onnx`]; tests drive the pipeline through a scripted in-memory runtime.
//!
//! ## Delegates
//!
//! A delegate is an execution backend attached to a graph at build time:
//!
//! | Kind | Meaning |
//! |------|---------|
//! | [`DelegateKind::Gpu`] | hardware accelerator (CUDA, NNAPI or CoreML) |
//! | [`DelegateKind::OptimizedCpu`] | optimized CPU kernels (XNNPACK) |
//! | [`DelegateKind::DefaultKernels`] | the runtime's plain CPU kernels |
//!
//! Stages walk a preference chain of delegates and fall back on failure.

#[cfg(feature = "onnx")]
pub mod onnx;

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;

/// Errors reported by a runtime backend.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("model file {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("graph build failed: {0}")]
    Build(String),

    #[error("{0} delegate is not available in this build")]
    DelegateUnavailable(DelegateKind),

    #[error("{kind} delegate rejected the graph: {reason}")]
    DelegateRejected { kind: DelegateKind, reason: String },

    #[error("tensor allocation failed: {0}")]
    Allocation(String),

    #[error("{0}")]
    Invocation(String),

    #[error("tensor binding failed: {0}")]
    Binding(String),
}

impl RuntimeError {
    /// Delegate errors are recoverable by trying the next delegate in a chain.
    pub fn is_delegate_error(&self) -> bool {
        matches!(
            self,
            RuntimeError::DelegateUnavailable(_) | RuntimeError::DelegateRejected { .. }
        )
    }
}

/// Element type of a declared tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorType {
    Float32,
    Float16,
    Int32,
    Int64,
    Int8,
    UInt8,
    Bool,
    Other,
}

impl TensorType {
    /// Size of one element in bytes, 0 when unknown.
    pub fn element_size(self) -> usize {
        match self {
            TensorType::Float32 | TensorType::Int32 => 4,
            TensorType::Float16 => 2,
            TensorType::Int64 => 8,
            TensorType::Int8 | TensorType::UInt8 | TensorType::Bool => 1,
            TensorType::Other => 0,
        }
    }
}

impl fmt::Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TensorType::Float32 => "float32",
            TensorType::Float16 => "float16",
            TensorType::Int32 => "int32",
            TensorType::Int64 => "int64",
            TensorType::Int8 => "int8",
            TensorType::UInt8 => "uint8",
            TensorType::Bool => "bool",
            TensorType::Other => "other",
        };
        f.write_str(name)
    }
}

/// Declared metadata of one graph input or output.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorInfo {
    pub name: String,
    pub ty: TensorType,
    /// Concrete dimensions. Dynamic axes are resolved to 1 by the backend.
    pub dims: Vec<usize>,
}

impl TensorInfo {
    pub fn new(name: impl Into<String>, ty: TensorType, dims: &[usize]) -> Self {
        Self {
            name: name.into(),
            ty,
            dims: dims.to_vec(),
        }
    }

    pub fn element_count(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn bytes(&self) -> usize {
        self.element_count() * self.ty.element_size()
    }
}

/// Backing buffer of a bound tensor.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    I32(Vec<i32>),
    I64(Vec<i64>),
}

impl TensorData {
    /// Zeroed buffer for a declared tensor, `None` for types the pipeline
    /// never binds.
    pub fn zeroed(info: &TensorInfo) -> Option<Self> {
        let n = info.element_count();
        match info.ty {
            TensorType::Float32 => Some(TensorData::F32(vec![0.0; n])),
            TensorType::Int32 => Some(TensorData::I32(vec![0; n])),
            TensorType::Int64 => Some(TensorData::I64(vec![0; n])),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::I32(v) => v.len(),
            TensorData::I64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> usize {
        self.len() * self.tensor_type().element_size()
    }

    pub fn tensor_type(&self) -> TensorType {
        match self {
            TensorData::F32(_) => TensorType::Float32,
            TensorData::I32(_) => TensorType::Int32,
            TensorData::I64(_) => TensorType::Int64,
        }
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match self {
            TensorData::F32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f32_mut(&mut self) -> Option<&mut [f32]> {
        match self {
            TensorData::F32(v) => Some(v),
            _ => None,
        }
    }
}

/// Execution backend a graph may be built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DelegateKind {
    Gpu,
    OptimizedCpu,
    DefaultKernels,
}

impl fmt::Display for DelegateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DelegateKind::Gpu => "gpu",
            DelegateKind::OptimizedCpu => "optimized-cpu",
            DelegateKind::DefaultKernels => "default-kernels",
        };
        f.write_str(name)
    }
}

/// One entry of a stage's delegate preference chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelegateConfig {
    Gpu {
        /// Directory for serialized shaders.
        cache_dir: PathBuf,
        /// Identifies this model family inside the cache.
        model_token: String,
    },
    OptimizedCpu {
        threads: usize,
        /// Trade speed for a smaller working set: no arena allocator and no
        /// memory-pattern preallocation.
        low_memory: bool,
    },
    DefaultKernels,
}

impl DelegateConfig {
    pub fn kind(&self) -> DelegateKind {
        match self {
            DelegateConfig::Gpu { .. } => DelegateKind::Gpu,
            DelegateConfig::OptimizedCpu { .. } => DelegateKind::OptimizedCpu,
            DelegateConfig::DefaultKernels => DelegateKind::DefaultKernels,
        }
    }
}

/// Graph build options independent of the delegate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphOptions {
    /// Intra-op thread count for the runtime's own pool.
    pub threads: usize,
}

/// A model file mapped into memory.
///
/// The bytes are paged in by the OS on demand, so a large model does not
/// cost its full size in heap.
pub struct ModelFile {
    path: PathBuf,
    map: Mmap,
}

impl ModelFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RuntimeError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|source| RuntimeError::Open {
            path: path.clone(),
            source,
        })?;
        // SAFETY: model files are treated as read-only for the lifetime of the
        // mapping; nothing in this crate writes to them.
        let map = unsafe { Mmap::map(&file) }.map_err(|source| RuntimeError::Open {
            path: path.clone(),
            source,
        })?;
        Ok(Self { path, map })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes(&self) -> &[u8] {
        &self.map
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl fmt::Debug for ModelFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelFile")
            .field("path", &self.path)
            .field("len", &self.map.len())
            .finish()
    }
}

/// Factory for executable graphs.
pub trait GraphRuntime: Send + Sync {
    type Graph: Graph;

    /// Whether `kind` can be attached at all in this build/device.
    fn delegate_available(&self, kind: DelegateKind) -> bool;

    /// Build a graph for `model` with exactly one delegate.
    ///
    /// Delegate failures must be reported as [`RuntimeError::DelegateUnavailable`]
    /// or [`RuntimeError::DelegateRejected`] so the caller can fall back.
    fn build(
        &self,
        model: &ModelFile,
        options: &GraphOptions,
        delegate: &DelegateConfig,
    ) -> Result<Self::Graph, RuntimeError>;
}

/// A built graph with bindable inputs and readable outputs.
pub trait Graph: Send {
    fn inputs(&self) -> &[TensorInfo];
    fn outputs(&self) -> &[TensorInfo];

    /// Allocate backing buffers for every input and output.
    fn allocate(&mut self) -> Result<(), RuntimeError>;

    fn input_mut(&mut self, index: usize) -> Option<&mut TensorData>;
    fn output(&self, index: usize) -> Option<&TensorData>;

    /// Run one forward pass over the current input buffers.
    fn invoke(&mut self) -> Result<(), RuntimeError>;

    /// Bytes of every tensor buffer the graph currently holds.
    fn allocated_bytes(&self) -> usize;
}
