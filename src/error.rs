//! Error types for the voice-cloning inference engine.

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // --- Configuration ---
    /// A required model file is absent from `models_dir`.
    #[error("model not found: {0}")]
    ModelNotFound(String),

    /// A model file exists but failed to load into the runtime.
    #[error("failed to load model {name}: {reason}")]
    ModelLoadError {
        /// Logical model name (e.g. `"speech_encoder"`).
        name: String,
        /// Underlying error message from the tensor runtime.
        reason: String,
    },

    /// The requested quantization variant has no corresponding model files.
    #[error("quant variant unsupported: {0}")]
    QuantVariantUnsupported(String),

    /// A generation or encode call was made before all four models were loaded.
    #[error("models not ready: call load_models() first")]
    ModelsNotReady,

    /// `TensorRuntime::load` was called twice for the same logical name.
    #[error("model already loaded under logical name: {0}")]
    AlreadyLoaded(String),

    // --- Input ---
    /// The reference waveform is shorter than the minimum encodable duration.
    #[error("reference audio too short: {duration_s:.2}s (minimum 5.0s)")]
    ReferenceTooShort {
        /// Duration of the offending reference waveform, in seconds.
        duration_s: f32,
    },

    /// `generate` was called with an empty token sequence.
    #[error("token sequence is empty")]
    EmptyTokens,

    /// The conditionals bound to the engine (or passed explicitly) fail the
    /// VCR validity check: a non-empty, shape-consistent set of four arrays.
    #[error("voice conditionals are invalid: {0}")]
    ConditionalsInvalid(String),

    // --- Runtime ---
    /// A tensor-runtime invocation failed; wraps the upstream message verbatim.
    #[error("runtime invocation failed: {0}")]
    RuntimeInvocationError(String),

    /// The speech encoder returned fewer than the four required named outputs.
    #[error("encoder output shape mismatch: expected 4 outputs, got {got}")]
    EncoderOutputShapeMismatch {
        /// Number of outputs actually returned.
        got: usize,
    },

    /// The token embedder invocation failed.
    #[error("embedding failed: {0}")]
    EmbeddingFailure(String),

    /// The autoregressive language model invocation failed.
    #[error("language model failed: {0}")]
    LanguageModelFailure(String),

    /// The conditional decoder invocation failed.
    #[error("decoder failed: {0}")]
    DecoderFailure(String),

    // --- Cache ---
    /// A cache blob could not be read from disk.
    #[error("cache read failed: {0}")]
    CacheRead(String),

    /// A cache blob could not be written to disk (memory tier is unaffected).
    #[error("cache write failed: {0}")]
    CacheWrite(String),

    /// A cache blob's magic or version did not match; treated as a miss by
    /// callers but surfaced here for diagnostics.
    #[error("cache entry has unrecognized format")]
    CacheFormat,

    /// Informational: no entry exists for the given key. Not necessarily fatal.
    #[error("cache miss")]
    CacheMiss,

    // --- I/O ---
    /// Any filesystem error not otherwise classified above.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, EngineError>;
