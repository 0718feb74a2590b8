//! Tensor Runtime Facade (TRF): a typed, name-indexed RPC to pre-compiled
//! ONNX graphs, wrapping [`ort::session::Session`].
//!
//! Graph optimizations run at the maximum level, execution mode is
//! parallel, and memory-pattern plus CPU-arena allocation are enabled.
//! Intra-op and inter-op thread pools default to `max(2, hardware_threads /
//! 4)` — deliberate under-subscription, since the generation loop is
//! memory-bound and over-threading worsens contention — but can be
//! overridden via `EngineConfig`.

use std::collections::HashMap;
use std::path::Path;

use half::f16;
use ndarray::{ArrayViewD, IxDyn};
use ort::ep::CPU;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::{Session, SessionInputValue, SessionInputs};
use ort::value::TensorRef;
use tracing::info;

use crate::error::{EngineError, Result};

/// The closed set of tensor element types the runtime facade supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElemType {
    /// 32-bit float.
    F32,
    /// 16-bit float (half precision).
    F16,
    /// 64-bit signed integer.
    I64,
    /// 32-bit signed integer.
    I32,
}

/// A polymorphic dense tensor, owned and shape-tagged.
///
/// Creation variants accept either `(shape, data)` or just `shape` for a
/// zero-initialized placeholder — used for the initial empty KV-cache slots,
/// whose shape carries a zero-sized sequence dimension.
#[derive(Debug, Clone)]
pub enum Tensor {
    /// `f32` dense array.
    F32 { shape: Vec<i64>, data: Vec<f32> },
    /// `f16` dense array (language-model KV-cache under `q4f16`).
    F16 { shape: Vec<i64>, data: Vec<f16> },
    /// `i64` dense array (token IDs, position IDs, attention masks).
    I64 { shape: Vec<i64>, data: Vec<i64> },
    /// `i32` dense array.
    I32 { shape: Vec<i64>, data: Vec<i32> },
}

impl Tensor {
    /// The shape of this tensor.
    pub fn shape(&self) -> &[i64] {
        match self {
            Self::F32 { shape, .. }
            | Self::F16 { shape, .. }
            | Self::I64 { shape, .. }
            | Self::I32 { shape, .. } => shape,
        }
    }

    /// The element type of this tensor.
    pub fn elem_type(&self) -> ElemType {
        match self {
            Self::F32 { .. } => ElemType::F32,
            Self::F16 { .. } => ElemType::F16,
            Self::I64 { .. } => ElemType::I64,
            Self::I32 { .. } => ElemType::I32,
        }
    }

    /// A zero-initialized `f32` placeholder of the given shape.
    pub fn zeros_f32(shape: impl Into<Vec<i64>>) -> Self {
        let shape = shape.into();
        let len = shape.iter().product::<i64>().max(0) as usize;
        Self::F32 {
            shape,
            data: vec![0.0; len],
        }
    }

    /// A zero-initialized `f16` placeholder of the given shape.
    pub fn zeros_f16(shape: impl Into<Vec<i64>>) -> Self {
        let shape = shape.into();
        let len = shape.iter().product::<i64>().max(0) as usize;
        Self::F16 {
            shape,
            data: vec![f16::ZERO; len],
        }
    }

    /// Returns the tensor's data upcast to `f32`, regardless of whether it
    /// was stored as `f32` or `f16`. Used so output extraction can treat
    /// fp16 KV-cache tensors transparently.
    ///
    /// # Errors
    ///
    /// Returns `ConditionalsInvalid` if this tensor holds integer data.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        match self {
            Self::F32 { data, .. } => Ok(data.clone()),
            Self::F16 { data, .. } => Ok(data.iter().map(|v| v.to_f32()).collect()),
            _ => Err(EngineError::ConditionalsInvalid(
                "expected a floating-point tensor".into(),
            )),
        }
    }

    /// Returns the tensor's `i64` data.
    ///
    /// # Errors
    ///
    /// Returns `ConditionalsInvalid` if this tensor does not hold `i64` data.
    pub fn to_i64_vec(&self) -> Result<Vec<i64>> {
        match self {
            Self::I64 { data, .. } => Ok(data.clone()),
            _ => Err(EngineError::ConditionalsInvalid(
                "expected an i64 tensor".into(),
            )),
        }
    }

    fn into_session_input_value(self) -> Result<SessionInputValue<'static>> {
        let shape: Vec<usize> = self.shape().iter().map(|&d| d.max(0) as usize).collect();
        match self {
            Self::F32 { data, .. } => {
                let tensor = ort::value::Tensor::from_array((shape, data)).map_err(|e| {
                    EngineError::RuntimeInvocationError(format!(
                        "failed to build f32 tensor: {e}"
                    ))
                })?;
                Ok(tensor.into())
            }
            Self::F16 { data, .. } => {
                let tensor = ort::value::Tensor::from_array((shape, data)).map_err(|e| {
                    EngineError::RuntimeInvocationError(format!(
                        "failed to build f16 tensor: {e}"
                    ))
                })?;
                Ok(tensor.into())
            }
            Self::I64 { data, .. } => {
                let tensor = ort::value::Tensor::from_array((shape, data)).map_err(|e| {
                    EngineError::RuntimeInvocationError(format!(
                        "failed to build i64 tensor: {e}"
                    ))
                })?;
                Ok(tensor.into())
            }
            Self::I32 { data, .. } => {
                let tensor = ort::value::Tensor::from_array((shape, data)).map_err(|e| {
                    EngineError::RuntimeInvocationError(format!(
                        "failed to build i32 tensor: {e}"
                    ))
                })?;
                Ok(tensor.into())
            }
        }
    }
}

/// An opaque handle to a loaded session. Methods invoked through a handle
/// are thread-compatible: one outstanding invocation per handle at a time
/// (enforced by `TensorRuntime` requiring `&mut self` to invoke).
#[derive(Debug, Clone)]
pub struct SessionHandle {
    logical_name: String,
}

impl SessionHandle {
    /// The logical name this handle was loaded under.
    pub fn logical_name(&self) -> &str {
        &self.logical_name
    }

    /// Construct a handle without a backing session, for tests that only
    /// exercise pre-invocation validation (e.g. input-shape checks) and
    /// never reach the runtime.
    #[cfg(test)]
    pub fn for_test(logical_name: &str) -> Self {
        Self {
            logical_name: logical_name.to_owned(),
        }
    }
}

/// A memory-info descriptor for CPU-arena allocations, reused across
/// invocations so no per-call allocation is needed to describe it.
#[derive(Debug, Clone, Copy)]
pub struct MemoryInfo {
    /// Whether the CPU arena allocator is enabled for sessions in this runtime.
    pub cpu_arena_enabled: bool,
}

/// Tensor Runtime Facade: owns loaded sessions and the shared resources
/// (thread-pool sizing, memory-info descriptor) every invocation reuses.
pub struct TensorRuntime {
    sessions: HashMap<String, Session>,
    input_names: HashMap<String, Vec<String>>,
    output_names: HashMap<String, Vec<String>>,
    memory_info: MemoryInfo,
    intra_threads: usize,
    inter_threads: usize,
}

/// `max(2, hardware_threads / 4)` — the spec's default thread-pool size,
/// under-subscribed on purpose since the generation loop is memory-bound.
pub fn default_thread_count() -> usize {
    let hardware_threads = std::thread::available_parallelism()
        .map(std::num::NonZero::get)
        .unwrap_or(4);
    (hardware_threads / 4).max(2)
}

impl TensorRuntime {
    /// Construct an empty runtime with the given thread-pool sizes.
    pub fn new(intra_threads: Option<usize>, inter_threads: Option<usize>) -> Self {
        Self {
            sessions: HashMap::new(),
            input_names: HashMap::new(),
            output_names: HashMap::new(),
            memory_info: MemoryInfo {
                cpu_arena_enabled: true,
            },
            intra_threads: intra_threads.unwrap_or_else(default_thread_count),
            inter_threads: inter_threads.unwrap_or_else(default_thread_count),
        }
    }

    /// Load a model by logical name from a filesystem path.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyLoaded` if `logical_name` was already loaded,
    /// `ModelNotFound` if `path` does not exist, `ModelLoadError` if the
    /// graph fails to commit.
    pub fn load(&mut self, logical_name: &str, path: &Path) -> Result<SessionHandle> {
        if self.sessions.contains_key(logical_name) {
            return Err(EngineError::AlreadyLoaded(logical_name.to_owned()));
        }
        if !path.is_file() {
            return Err(EngineError::ModelNotFound(path.display().to_string()));
        }

        info!("loading model '{logical_name}' from {}", path.display());

        let session = Session::builder()
            .and_then(|b| {
                Ok(b.with_execution_providers([CPU::default()
                    .with_arena_allocator(true)
                    .build()])?)
            })
            .and_then(|b| Ok(b.with_optimization_level(GraphOptimizationLevel::Level3)?))
            .and_then(|b| Ok(b.with_intra_threads(self.intra_threads)?))
            .and_then(|b| Ok(b.with_inter_threads(self.inter_threads)?))
            .and_then(|b| Ok(b.with_memory_pattern(true)?))
            .and_then(|mut b| b.commit_from_file(path))
            .map_err(|e| EngineError::ModelLoadError {
                name: logical_name.to_owned(),
                reason: e.to_string(),
            })?;

        let input_names: Vec<String> = session.inputs().iter().map(|i| i.name().to_owned()).collect();
        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_owned()).collect();

        self.sessions.insert(logical_name.to_owned(), session);
        self.input_names
            .insert(logical_name.to_owned(), input_names);
        self.output_names
            .insert(logical_name.to_owned(), output_names);

        Ok(SessionHandle {
            logical_name: logical_name.to_owned(),
        })
    }

    /// Retrieve a handle to an already-loaded session.
    ///
    /// # Errors
    ///
    /// Returns `ModelsNotReady` if `logical_name` has not been loaded.
    pub fn get(&self, logical_name: &str) -> Result<SessionHandle> {
        if self.sessions.contains_key(logical_name) {
            Ok(SessionHandle {
                logical_name: logical_name.to_owned(),
            })
        } else {
            Err(EngineError::ModelsNotReady)
        }
    }

    /// Cached input/output names and element types for a loaded session, in
    /// the order the graph declares them.
    ///
    /// # Errors
    ///
    /// Returns `ModelsNotReady` if the handle's session is not loaded.
    pub fn introspect(&self, handle: &SessionHandle) -> Result<(Vec<String>, Vec<String>)> {
        let inputs = self
            .input_names
            .get(&handle.logical_name)
            .ok_or(EngineError::ModelsNotReady)?
            .clone();
        let outputs = self
            .output_names
            .get(&handle.logical_name)
            .ok_or(EngineError::ModelsNotReady)?
            .clone();
        Ok((inputs, outputs))
    }

    /// Invoke a loaded model with named input tensors, receiving named
    /// output tensors in the order requested.
    ///
    /// Inputs are consumed: ownership moves into the runtime call.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeInvocationError` wrapping the upstream engine's
    /// message on any failure, or `ModelsNotReady` if the handle's session
    /// is not loaded.
    pub fn invoke(
        &mut self,
        handle: &SessionHandle,
        inputs: HashMap<String, Tensor>,
        out_names: &[&str],
    ) -> Result<Vec<Tensor>> {
        let session = self
            .sessions
            .get_mut(&handle.logical_name)
            .ok_or(EngineError::ModelsNotReady)?;

        let mut feed: HashMap<String, SessionInputValue> = HashMap::with_capacity(inputs.len());
        for (name, tensor) in inputs {
            feed.insert(name, tensor.into_session_input_value()?);
        }

        let outputs = session
            .run(SessionInputs::from(feed))
            .map_err(|e| EngineError::RuntimeInvocationError(e.to_string()))?;

        let mut results = Vec::with_capacity(out_names.len());
        for &name in out_names {
            let value = outputs.get(name).ok_or_else(|| {
                EngineError::RuntimeInvocationError(format!("missing output '{name}'"))
            })?;
            results.push(extract_tensor(value)?);
        }
        Ok(results)
    }

    /// Invoke the language model for one autoregressive decode step.
    ///
    /// Unlike [`Self::invoke`], `inputs_embeds`/`attention_mask`/
    /// `position_ids` are bound as borrowed tensor views over the caller's
    /// own scratch buffers rather than consumed by value — the caller
    /// reserves those buffers once, to their maximum length, and resizes
    /// them in place across steps instead of reallocating. The `logits`
    /// output is sliced down to just its last position before it is ever
    /// copied out, so the full `[1, L, V]` buffer is never materialized.
    /// KV-cache inputs are still moved by ownership, since each step's
    /// cache tensor is already exactly the size needed.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeInvocationError` on any failure to bind inputs, run
    /// the session, or locate/parse a requested output; `ModelsNotReady` if
    /// the handle's session is not loaded.
    pub fn invoke_decode_step(
        &mut self,
        handle: &SessionHandle,
        inputs_embeds: &[f32],
        embeds_shape: [usize; 3],
        attention_mask: &[i64],
        position_ids: &[i64],
        kv_cache: Vec<(String, Tensor)>,
        kv_output_names: &[String],
    ) -> Result<(Vec<f32>, Vec<Tensor>)> {
        let session = self
            .sessions
            .get_mut(&handle.logical_name)
            .ok_or(EngineError::ModelsNotReady)?;

        let embeds_view = ArrayViewD::from_shape(IxDyn(&embeds_shape), inputs_embeds).map_err(
            |e| EngineError::RuntimeInvocationError(format!("bad inputs_embeds view: {e}")),
        )?;
        let mask_view = ArrayViewD::from_shape(IxDyn(&[1, attention_mask.len()]), attention_mask)
            .map_err(|e| {
                EngineError::RuntimeInvocationError(format!("bad attention_mask view: {e}"))
            })?;
        let position_view = ArrayViewD::from_shape(IxDyn(&[1, position_ids.len()]), position_ids)
            .map_err(|e| {
                EngineError::RuntimeInvocationError(format!("bad position_ids view: {e}"))
            })?;

        let mut feed: HashMap<String, SessionInputValue> =
            HashMap::with_capacity(3 + kv_cache.len());
        feed.insert(
            "inputs_embeds".to_owned(),
            TensorRef::from_array_view(embeds_view)
                .map_err(|e| {
                    EngineError::RuntimeInvocationError(format!(
                        "failed to bind inputs_embeds: {e}"
                    ))
                })?
                .into(),
        );
        feed.insert(
            "attention_mask".to_owned(),
            TensorRef::from_array_view(mask_view)
                .map_err(|e| {
                    EngineError::RuntimeInvocationError(format!(
                        "failed to bind attention_mask: {e}"
                    ))
                })?
                .into(),
        );
        feed.insert(
            "position_ids".to_owned(),
            TensorRef::from_array_view(position_view)
                .map_err(|e| {
                    EngineError::RuntimeInvocationError(format!(
                        "failed to bind position_ids: {e}"
                    ))
                })?
                .into(),
        );
        for (name, tensor) in kv_cache {
            feed.insert(name, tensor.into_session_input_value()?);
        }

        let outputs = session
            .run(SessionInputs::from(feed))
            .map_err(|e| EngineError::RuntimeInvocationError(e.to_string()))?;

        let logits_value = outputs.get("logits").ok_or_else(|| {
            EngineError::RuntimeInvocationError("missing output 'logits'".into())
        })?;
        let last_logits = extract_last_logits_row(logits_value)?;

        let mut kv_outputs = Vec::with_capacity(kv_output_names.len());
        for name in kv_output_names {
            let value = outputs.get(name.as_str()).ok_or_else(|| {
                EngineError::RuntimeInvocationError(format!("missing output '{name}'"))
            })?;
            kv_outputs.push(extract_tensor(value)?);
        }

        Ok((last_logits, kv_outputs))
    }

    /// The shared memory-info descriptor, reused across invocations.
    pub fn memory_info(&self) -> &MemoryInfo {
        &self.memory_info
    }

    /// The intra-op thread count sessions in this runtime were built with.
    pub fn intra_threads(&self) -> usize {
        self.intra_threads
    }

    /// The inter-op thread count sessions in this runtime were built with.
    pub fn inter_threads(&self) -> usize {
        self.inter_threads
    }

    /// Whether a logical model name has been loaded.
    pub fn is_loaded(&self, logical_name: &str) -> bool {
        self.sessions.contains_key(logical_name)
    }

    /// Tear down every loaded session.
    pub fn unload_all(&mut self) {
        self.sessions.clear();
        self.input_names.clear();
        self.output_names.clear();
    }
}

/// Extract an output value into our owned `Tensor` representation, trying
/// each supported element type in turn. fp16 outputs upcast transparently
/// via [`Tensor::to_f32_vec`] at the call site; here we preserve the
/// original element type so KV-cache moves stay fp16 end to end.
fn extract_tensor(value: &ort::value::Value) -> Result<Tensor> {
    if let Ok((shape, data)) = value.try_extract_tensor::<f32>() {
        return Ok(Tensor::F32 {
            shape: shape.iter().map(|&d| d as i64).collect(),
            data: data.to_vec(),
        });
    }
    if let Ok((shape, data)) = value.try_extract_tensor::<f16>() {
        return Ok(Tensor::F16 {
            shape: shape.iter().map(|&d| d as i64).collect(),
            data: data.to_vec(),
        });
    }
    if let Ok((shape, data)) = value.try_extract_tensor::<i64>() {
        return Ok(Tensor::I64 {
            shape: shape.iter().map(|&d| d as i64).collect(),
            data: data.to_vec(),
        });
    }
    if let Ok((shape, data)) = value.try_extract_tensor::<i32>() {
        return Ok(Tensor::I32 {
            shape: shape.iter().map(|&d| d as i64).collect(),
            data: data.to_vec(),
        });
    }
    Err(EngineError::RuntimeInvocationError(
        "output tensor element type is none of f32/f16/i64/i32".into(),
    ))
}

/// Extract just the last position's row from a `[1, L, V]` logits output,
/// reading it directly out of the borrowed slice `try_extract_tensor`
/// returns so the `L - 1` rows before it are never copied.
fn extract_last_logits_row(value: &ort::value::Value) -> Result<Vec<f32>> {
    if let Ok((shape, data)) = value.try_extract_tensor::<f32>() {
        let shape: Vec<i64> = shape.iter().map(|&d| d as i64).collect();
        let (vocab, last_start) = last_row_bounds(&shape)?;
        return Ok(data[last_start..last_start + vocab].to_vec());
    }
    if let Ok((shape, data)) = value.try_extract_tensor::<f16>() {
        let shape: Vec<i64> = shape.iter().map(|&d| d as i64).collect();
        let (vocab, last_start) = last_row_bounds(&shape)?;
        return Ok(data[last_start..last_start + vocab]
            .iter()
            .map(|v| v.to_f32())
            .collect());
    }
    Err(EngineError::RuntimeInvocationError(
        "logits tensor is not floating point".into(),
    ))
}

fn last_row_bounds(shape: &[i64]) -> Result<(usize, usize)> {
    let &[_, seq_len, vocab] = shape else {
        return Err(EngineError::RuntimeInvocationError(format!(
            "expected rank-3 logits, got shape {shape:?}"
        )));
    };
    let vocab = vocab as usize;
    let last_start = (seq_len as usize).saturating_sub(1) * vocab;
    Ok((vocab, last_start))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn default_thread_count_is_at_least_two() {
        assert!(default_thread_count() >= 2);
    }

    #[test]
    fn last_row_bounds_points_at_final_position() {
        let (vocab, last_start) = last_row_bounds(&[1, 2, 3]).expect("bounds");
        assert_eq!(vocab, 3);
        assert_eq!(last_start, 3);
    }

    #[test]
    fn last_row_bounds_handles_single_position() {
        let (vocab, last_start) = last_row_bounds(&[1, 1, 5]).expect("bounds");
        assert_eq!(vocab, 5);
        assert_eq!(last_start, 0);
    }

    #[test]
    fn last_row_bounds_rejects_non_rank_3_shape() {
        assert!(last_row_bounds(&[1, 5]).is_err());
    }

    #[test]
    fn zeros_f32_produces_correct_length() {
        let t = Tensor::zeros_f32(vec![1, 16, 0, 64]);
        assert_eq!(t.shape(), &[1, 16, 0, 64]);
        let data = t.to_f32_vec().expect("f32");
        assert_eq!(data.len(), 0);
    }

    #[test]
    fn zeros_f16_produces_correct_length_and_upcasts() {
        let t = Tensor::zeros_f16(vec![1, 16, 4, 64]);
        let data = t.to_f32_vec().expect("upcast");
        assert_eq!(data.len(), 1 * 16 * 4 * 64);
        assert!(data.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn elem_type_matches_variant() {
        assert_eq!(Tensor::zeros_f32(vec![1]).elem_type(), ElemType::F32);
        assert_eq!(Tensor::zeros_f16(vec![1]).elem_type(), ElemType::F16);
        let i = Tensor::I64 {
            shape: vec![1],
            data: vec![6561],
        };
        assert_eq!(i.elem_type(), ElemType::I64);
    }

    #[test]
    fn to_i64_vec_rejects_float_tensor() {
        let t = Tensor::zeros_f32(vec![1]);
        assert!(t.to_i64_vec().is_err());
    }

    #[test]
    fn runtime_reports_not_ready_before_load() {
        let runtime = TensorRuntime::new(None, None);
        assert!(!runtime.is_loaded("speech_encoder"));
        assert!(runtime.get("speech_encoder").is_err());
    }

    #[test]
    fn missing_model_file_is_model_not_found() {
        let mut runtime = TensorRuntime::new(Some(2), Some(2));
        let err = runtime
            .load("speech_encoder", Path::new("/nonexistent/model.onnx"))
            .expect_err("should fail");
        assert!(matches!(err, EngineError::ModelNotFound(_)));
    }
}
