//! ONNX Runtime backend.
//!
//! Delegates map onto execution providers:
//!
//! - `Gpu`: NNAPI on Android, CoreML on Apple targets, CUDA elsewhere. Only
//!   compiled in with the matching cargo feature.
//! - `OptimizedCpu`: XNNPACK when the `xnnpack` feature is on, otherwise the
//!   CPU provider with full graph optimization.
//! - `DefaultKernels`: the CPU provider with basic optimization only.
//!
//! Every provider is registered with `error_on_failure` so a rejected
//! delegate surfaces as an error and the stage can fall back itself.

use std::borrow::Cow;

use ort::ep::{self, ExecutionProviderDispatch};
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::{Session, SessionInputValue, SessionInputs};
use ort::tensor::TensorElementType;
use ort::value::TensorRef;

use super::{
    DelegateConfig, DelegateKind, Graph, GraphOptions, GraphRuntime, ModelFile, RuntimeError,
    TensorData, TensorInfo, TensorType,
};

/// [`GraphRuntime`] backed by ONNX Runtime sessions.
#[derive(Debug, Default, Clone, Copy)]
pub struct OnnxRuntime;

impl OnnxRuntime {
    pub fn new() -> Self {
        // Global environment; only the first commit in a process applies.
        let committed = ort::init().with_name("stable-audio").commit();
        tracing::debug!(?committed, "onnx runtime environment");
        Self
    }
}

impl GraphRuntime for OnnxRuntime {
    type Graph = OnnxGraph;

    fn delegate_available(&self, kind: DelegateKind) -> bool {
        match kind {
            DelegateKind::Gpu => gpu_available(),
            DelegateKind::OptimizedCpu | DelegateKind::DefaultKernels => true,
        }
    }

    fn build(
        &self,
        model: &ModelFile,
        options: &GraphOptions,
        delegate: &DelegateConfig,
    ) -> Result<OnnxGraph, RuntimeError> {
        let kind = delegate.kind();
        let level = match delegate {
            DelegateConfig::DefaultKernels => GraphOptimizationLevel::Level1,
            _ => GraphOptimizationLevel::Level3,
        };

        let builder = Session::builder()
            .and_then(|b| b.with_optimization_level(level))
            .and_then(|b| b.with_intra_threads(options.threads.max(1)))
            .and_then(|b| b.with_inter_threads(1))
            .and_then(|b| b.with_memory_pattern(!low_memory(delegate)))
            .map_err(|e| RuntimeError::Build(e.to_string()))?;

        let builder = attach_delegate(builder, delegate)?;

        let session = builder.commit_from_memory(model.bytes()).map_err(|e| {
            // A provider that accepted registration can still reject nodes
            // while partitioning the graph.
            if matches!(kind, DelegateKind::DefaultKernels) {
                RuntimeError::Build(e.to_string())
            } else {
                RuntimeError::DelegateRejected {
                    kind,
                    reason: e.to_string(),
                }
            }
        })?;

        let inputs = session
            .inputs()
            .iter()
            .map(|outlet| describe(outlet.name(), outlet.dtype()))
            .collect::<Vec<_>>();
        let outputs = session
            .outputs()
            .iter()
            .map(|outlet| describe(outlet.name(), outlet.dtype()))
            .collect::<Vec<_>>();

        Ok(OnnxGraph {
            session,
            inputs,
            outputs,
            input_data: Vec::new(),
            output_data: Vec::new(),
        })
    }
}

/// A committed ONNX Runtime session plus host-side tensor buffers.
pub struct OnnxGraph {
    session: Session,
    inputs: Vec<TensorInfo>,
    outputs: Vec<TensorInfo>,
    input_data: Vec<Option<TensorData>>,
    output_data: Vec<Option<TensorData>>,
}

impl Graph for OnnxGraph {
    fn inputs(&self) -> &[TensorInfo] {
        &self.inputs
    }

    fn outputs(&self) -> &[TensorInfo] {
        &self.outputs
    }

    fn allocate(&mut self) -> Result<(), RuntimeError> {
        self.input_data = self.inputs.iter().map(TensorData::zeroed).collect();
        self.output_data = self.outputs.iter().map(TensorData::zeroed).collect();
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
        let mut feeds: Vec<(Cow<'_, str>, SessionInputValue<'_>)> =
            Vec::with_capacity(self.inputs.len());
        for (info, data) in self.inputs.iter().zip(&self.input_data) {
            let data = data.as_ref().ok_or_else(|| {
                RuntimeError::Binding(format!("input `{}` ({}) has no buffer", info.name, info.ty))
            })?;
            let shape: Vec<i64> = info.dims.iter().map(|&d| d as i64).collect();
            // Views over the host buffers; nothing is copied per call.
            let value = match data {
                TensorData::F32(v) => {
                    TensorRef::from_array_view((shape, v.as_slice())).map(SessionInputValue::from)
                }
                TensorData::I32(v) => {
                    TensorRef::from_array_view((shape, v.as_slice())).map(SessionInputValue::from)
                }
                TensorData::I64(v) => {
                    TensorRef::from_array_view((shape, v.as_slice())).map(SessionInputValue::from)
                }
            }
            .map_err(|e| RuntimeError::Binding(format!("input `{}`: {e}", info.name)))?;
            feeds.push((Cow::Borrowed(info.name.as_str()), value));
        }

        let results = self
            .session
            .run(SessionInputs::from(feeds))
            .map_err(|e| RuntimeError::Invocation(e.to_string()))?;

        for (info, slot) in self.outputs.iter().zip(self.output_data.iter_mut()) {
            let Some(value) = results.get(info.name.as_str()) else {
                continue;
            };
            let data = match info.ty {
                TensorType::Float32 => value
                    .try_extract_tensor::<f32>()
                    .map(|(_, v)| TensorData::F32(v.to_vec())),
                TensorType::Int32 => value
                    .try_extract_tensor::<i32>()
                    .map(|(_, v)| TensorData::I32(v.to_vec())),
                TensorType::Int64 => value
                    .try_extract_tensor::<i64>()
                    .map(|(_, v)| TensorData::I64(v.to_vec())),
                _ => continue,
            }
            .map_err(|e| RuntimeError::Invocation(format!("output `{}`: {e}", info.name)))?;
            *slot = Some(data);
        }
        Ok(())
    }
}

fn describe(name: &str, dtype: &ort::value::ValueType) -> TensorInfo {
    let ty = dtype.tensor_type().map(map_type).unwrap_or(TensorType::Other);
    let dims = dtype
        .tensor_shape()
        .map(|shape| {
            shape
                .iter()
                .map(|&d| {
                    if d > 0 {
                        d as usize
                    } else {
                        tracing::debug!(tensor = name, "dynamic dimension resolved to 1");
                        1
                    }
                })
                .collect()
        })
        .unwrap_or_default();
    TensorInfo {
        name: name.to_string(),
        ty,
        dims,
    }
}

fn map_type(ty: TensorElementType) -> TensorType {
    match ty {
        TensorElementType::Float32 => TensorType::Float32,
        TensorElementType::Float16 => TensorType::Float16,
        TensorElementType::Int32 => TensorType::Int32,
        TensorElementType::Int64 => TensorType::Int64,
        TensorElementType::Int8 => TensorType::Int8,
        TensorElementType::Uint8 => TensorType::UInt8,
        TensorElementType::Bool => TensorType::Bool,
        _ => TensorType::Other,
    }
}

fn attach_delegate(
    builder: SessionBuilder,
    delegate: &DelegateConfig,
) -> Result<SessionBuilder, RuntimeError> {
    let kind = delegate.kind();
    let providers = match delegate {
        DelegateConfig::Gpu {
            cache_dir,
            model_token,
        } => {
            tracing::debug!(cache = %cache_dir.display(), token = %model_token, "configuring gpu provider");
            gpu_providers(cache_dir, model_token)
                .ok_or(RuntimeError::DelegateUnavailable(DelegateKind::Gpu))?
        }
        DelegateConfig::OptimizedCpu {
            threads,
            low_memory,
        } => optimized_cpu_providers(*threads, *low_memory),
        DelegateConfig::DefaultKernels => vec![ep::CPU::default().build().error_on_failure()],
    };

    builder
        .with_execution_providers(providers)
        .map_err(|e| RuntimeError::DelegateRejected {
            kind,
            reason: e.to_string(),
        })
}

/// Whether `delegate` asks for the smallest working set.
fn low_memory(delegate: &DelegateConfig) -> bool {
    matches!(delegate, DelegateConfig::OptimizedCpu { low_memory: true, .. })
}

#[cfg(feature = "xnnpack")]
fn optimized_cpu_providers(threads: usize, low_memory: bool) -> Vec<ExecutionProviderDispatch> {
    let threads = std::num::NonZeroUsize::new(threads).unwrap_or(std::num::NonZeroUsize::MIN);
    // XNNPACK has no arena knob; low-memory mode is applied on the session.
    tracing::debug!(threads, low_memory, "configuring xnnpack provider");
    vec![
        ep::XNNPACK::default()
            .with_intra_op_num_threads(threads)
            .build()
            .error_on_failure(),
    ]
}

#[cfg(not(feature = "xnnpack"))]
fn optimized_cpu_providers(threads: usize, low_memory: bool) -> Vec<ExecutionProviderDispatch> {
    tracing::debug!(threads, low_memory, "optimized cpu kernels via cpu provider");
    vec![
        ep::CPU::default()
            .with_arena_allocator(!low_memory)
            .build()
            .error_on_failure(),
    ]
}

#[cfg(all(feature = "nnapi", target_os = "android"))]
fn gpu_providers(
    _cache_dir: &std::path::Path,
    _model_token: &str,
) -> Option<Vec<ExecutionProviderDispatch>> {
    Some(vec![ep::NNAPI::default().with_fp16(true).build().error_on_failure()])
}

#[cfg(all(feature = "coreml", target_vendor = "apple"))]
fn gpu_providers(
    cache_dir: &std::path::Path,
    _model_token: &str,
) -> Option<Vec<ExecutionProviderDispatch>> {
    Some(vec![
        ep::CoreML::default()
            .with_model_cache_dir(cache_dir.display().to_string())
            .build()
            .error_on_failure(),
    ])
}

#[cfg(all(
    feature = "cuda",
    not(target_os = "android"),
    not(target_vendor = "apple")
))]
fn gpu_providers(
    _cache_dir: &std::path::Path,
    _model_token: &str,
) -> Option<Vec<ExecutionProviderDispatch>> {
    Some(vec![ep::CUDA::default().build().error_on_failure()])
}

#[cfg(not(any(
    all(feature = "nnapi", target_os = "android"),
    all(feature = "coreml", target_vendor = "apple"),
    all(feature = "cuda", not(target_os = "android"), not(target_vendor = "apple"))
)))]
fn gpu_providers(
    _cache_dir: &std::path::Path,
    _model_token: &str,
) -> Option<Vec<ExecutionProviderDispatch>> {
    None
}

#[cfg(all(feature = "nnapi", target_os = "android"))]
fn gpu_available() -> bool {
    use ort::ep::ExecutionProvider;
    ep::NNAPI::default().is_available().unwrap_or(false)
}

#[cfg(all(feature = "coreml", target_vendor = "apple"))]
fn gpu_available() -> bool {
    use ort::ep::ExecutionProvider;
    ep::CoreML::default().is_available().unwrap_or(false)
}

#[cfg(all(
    feature = "cuda",
    not(target_os = "android"),
    not(target_vendor = "apple")
))]
fn gpu_available() -> bool {
    use ort::ep::ExecutionProvider;
    ep::CUDA::default().is_available().unwrap_or(false)
}

#[cfg(not(any(
    all(feature = "nnapi", target_os = "android"),
    all(feature = "coreml", target_vendor = "apple"),
    all(feature = "cuda", not(target_os = "android"), not(target_vendor = "apple"))
)))]
fn gpu_available() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_types_map() {
        assert_eq!(map_type(TensorElementType::Float32), TensorType::Float32);
        assert_eq!(map_type(TensorElementType::Int64), TensorType::Int64);
        assert_eq!(map_type(TensorElementType::Uint8), TensorType::UInt8);
        assert_eq!(map_type(TensorElementType::String), TensorType::Other);
    }

    #[test]
    fn cpu_delegates_always_available() {
        let runtime = OnnxRuntime;
        assert!(runtime.delegate_available(DelegateKind::OptimizedCpu));
        assert!(runtime.delegate_available(DelegateKind::DefaultKernels));
    }

    #[test]
    fn low_memory_only_for_flagged_cpu_delegate() {
        assert!(low_memory(&DelegateConfig::OptimizedCpu {
            threads: 1,
            low_memory: true
        }));
        assert!(!low_memory(&DelegateConfig::OptimizedCpu {
            threads: 4,
            low_memory: false
        }));
        assert!(!low_memory(&DelegateConfig::DefaultKernels));
    }

    #[test]
    fn low_memory_delegate_still_reaches_graph_build() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.onnx");
        std::fs::write(&path, b"not a model").unwrap();
        let model = ModelFile::open(&path).unwrap();
        let result = OnnxRuntime::new().build(
            &model,
            &GraphOptions { threads: 1 },
            &DelegateConfig::OptimizedCpu {
                threads: 1,
                low_memory: true,
            },
        );
        // Session options were accepted; only the model bytes are rejected.
        assert!(matches!(result, Err(RuntimeError::DelegateRejected { .. })));
    }

    fn varint(mut v: u64, out: &mut Vec<u8>) {
        while v >= 0x80 {
            out.push((v as u8) | 0x80);
            v >>= 7;
        }
        out.push(v as u8);
    }

    fn field(tag: u64, bytes: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        varint(tag << 3 | 2, &mut out);
        varint(bytes.len() as u64, &mut out);
        out.extend_from_slice(bytes);
        out
    }

    fn int_field(tag: u64, v: u64) -> Vec<u8> {
        let mut out = Vec::new();
        varint(tag << 3, &mut out);
        varint(v, &mut out);
        out
    }

    /// Serialized ONNX model `y = Identity(x)` over float32 `[n]`.
    fn identity_model(n: u64) -> Vec<u8> {
        let value_info = |name: &str| {
            let dim = field(1, &int_field(1, n));
            let shape = field(2, &dim);
            let tensor = [int_field(1, 1), shape].concat();
            [field(1, name.as_bytes()), field(2, &field(1, &tensor))].concat()
        };
        let node = [field(1, b"x"), field(2, b"y"), field(4, b"Identity")].concat();
        let graph = [
            field(1, &node),
            field(2, b"identity"),
            field(11, &value_info("x")),
            field(12, &value_info("y")),
        ]
        .concat();
        let opset = int_field(2, 13);
        [int_field(1, 8), field(7, &graph), field(8, &opset)].concat()
    }

    #[test]
    fn invoke_reads_current_input_buffers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.onnx");
        std::fs::write(&path, identity_model(3)).unwrap();
        let model = ModelFile::open(&path).unwrap();
        let mut graph = OnnxRuntime::new()
            .build(
                &model,
                &GraphOptions { threads: 1 },
                &DelegateConfig::OptimizedCpu {
                    threads: 1,
                    low_memory: true,
                },
            )
            .unwrap();
        assert_eq!(graph.inputs()[0].dims, vec![3]);
        graph.allocate().unwrap();

        graph
            .input_mut(0)
            .unwrap()
            .as_f32_mut()
            .unwrap()
            .copy_from_slice(&[1.0, 2.0, 3.0]);
        graph.invoke().unwrap();
        assert_eq!(graph.output(0).unwrap().as_f32().unwrap(), &[1.0, 2.0, 3.0]);

        // In-place updates between calls are what the next pass sees.
        graph.input_mut(0).unwrap().as_f32_mut().unwrap()[1] = -5.0;
        graph.invoke().unwrap();
        assert_eq!(graph.output(0).unwrap().as_f32().unwrap(), &[1.0, -5.0, 3.0]);
        assert_eq!(graph.input_mut(0).unwrap().as_f32().unwrap(), &[1.0, -5.0, 3.0]);
    }

    #[test]
    fn garbage_model_fails_to_build() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.onnx");
        std::fs::write(&path, b"not a model").unwrap();
        let model = ModelFile::open(&path).unwrap();
        let runtime = OnnxRuntime::new();
        let result = runtime.build(
            &model,
            &GraphOptions { threads: 1 },
            &DelegateConfig::DefaultKernels,
        );
        assert!(matches!(result, Err(RuntimeError::Build(_))));
    }
}
