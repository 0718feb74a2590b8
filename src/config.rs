//! Configuration types for the voice-cloning inference engine.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Tokenizer sentinel token appended twice after text tokens by the external
/// tokenizer collaborator.
pub const SENTINEL_TOKEN: i64 = 50256;
/// Marks the beginning of the speech-token sub-sequence in `generated`.
pub const START_OF_SPEECH_TOKEN: i64 = 6561;
/// Marks the end of the speech-token sub-sequence in `generated`.
pub const STOP_OF_SPEECH_TOKEN: i64 = 6562;
/// Inserted three times between the speech tokens and the prompt token when
/// assembling the conditional decoder's input.
pub const SILENCE_TOKEN: i64 = 4299;
/// Output waveform sample rate, in Hz.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;
/// Sample rate the speech encoder expects its reference waveform at.
pub const SPEECH_TOKENIZER_SAMPLE_RATE: u32 = 16_000;
/// Minimum reference waveform duration accepted by the speech encoder.
pub const MIN_REFERENCE_DURATION_S: f32 = 5.0;
/// Number of key/value attention heads in the language model.
pub const LM_HEAD_COUNT: usize = 16;
/// Per-head dimension of the language model's key/value cache.
pub const LM_HEAD_DIM: usize = 64;

/// Quantization variant. Chosen at engine construction and immutable for the
/// life of the engine; determines the model filename suffix and whether the
/// language model's KV-cache element type is fp16 or fp32.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantVariant {
    /// Full precision weights, fp32 KV-cache.
    Fp32,
    /// 8-bit quantized weights, fp32 KV-cache.
    Q8,
    /// 4-bit quantized weights, fp32 KV-cache.
    Q4,
    /// 4-bit quantized weights, fp16 KV-cache.
    Q4f16,
}

impl QuantVariant {
    /// The filename suffix inserted before `.onnx` for this variant.
    pub fn filename_suffix(self) -> &'static str {
        match self {
            Self::Fp32 => "",
            Self::Q8 => "_quantized",
            Self::Q4 => "_q4",
            Self::Q4f16 => "_q4f16",
        }
    }

    /// Whether this variant's language-model KV-cache uses fp16 elements.
    pub fn uses_fp16_kv_cache(self) -> bool {
        matches!(self, Self::Q4f16)
    }

    /// Parse a quant-variant tag, as it would appear in a config file or
    /// model directory name.
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "fp32" => Some(Self::Fp32),
            "q8" | "quantized" => Some(Self::Q8),
            "q4" => Some(Self::Q4),
            "q4f16" => Some(Self::Q4f16),
            _ => None,
        }
    }
}

impl Default for QuantVariant {
    fn default() -> Self {
        Self::Q4f16
    }
}

/// Construction-time engine configuration: where models and cache entries
/// live, which quant variant to load, and thread-pool sizing overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory containing the four `.onnx` model files (or an `onnx/`
    /// subdirectory, or a HuggingFace snapshot layout rooted here).
    pub models_dir: PathBuf,
    /// Directory for persisted voice-conditionals blobs (`<key>.cond`).
    pub cache_dir: PathBuf,
    /// Which pre-quantized weight set to load.
    pub quant_variant: QuantVariant,
    /// Override for the tensor runtime's intra-op thread count. `None`
    /// defaults to `max(2, available_parallelism / 4)` at load time.
    pub intra_threads: Option<usize>,
    /// Override for the tensor runtime's inter-op thread count. `None`
    /// defaults to `max(2, available_parallelism / 4)` at load time.
    pub inter_threads: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("./models"),
            cache_dir: PathBuf::from("./cache"),
            quant_variant: QuantVariant::default(),
            intra_threads: None,
            inter_threads: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file, falling back to defaults for
    /// missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| crate::error::EngineError::ConditionalsInvalid(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::EngineError::ConditionalsInvalid(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Per-call generation settings. Values are snapshotted at the start of a
/// generation call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Upper bound on autoregressive decode steps.
    pub max_new_tokens: usize,
    /// Repetition penalty `ρ ≥ 1` applied to every token seen in history.
    pub repetition_penalty: f32,
    /// Softmax temperature `τ > 0`.
    pub temperature: f32,
    /// Top-k filter width; `0` disables it.
    pub top_k: usize,
    /// Top-p (nucleus) filter threshold, in `(0, 1]`.
    pub top_p: f32,
    /// PRNG seed; `0` means nondeterministic (seeded from platform entropy).
    pub seed: u64,
    /// Whether the repetition penalty is applied to the start-of-speech
    /// token in addition to generated tokens. See `DESIGN.md` for the policy
    /// this resolves.
    pub penalize_start_token: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 1024,
            repetition_penalty: 1.2,
            temperature: 0.8,
            top_k: 1000,
            top_p: 0.95,
            seed: 0,
            penalize_start_token: true,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn quant_variant_suffixes_match_spec() {
        assert_eq!(QuantVariant::Fp32.filename_suffix(), "");
        assert_eq!(QuantVariant::Q8.filename_suffix(), "_quantized");
        assert_eq!(QuantVariant::Q4.filename_suffix(), "_q4");
        assert_eq!(QuantVariant::Q4f16.filename_suffix(), "_q4f16");
    }

    #[test]
    fn only_q4f16_uses_fp16_kv_cache() {
        assert!(!QuantVariant::Fp32.uses_fp16_kv_cache());
        assert!(!QuantVariant::Q8.uses_fp16_kv_cache());
        assert!(!QuantVariant::Q4.uses_fp16_kv_cache());
        assert!(QuantVariant::Q4f16.uses_fp16_kv_cache());
    }

    #[test]
    fn quant_variant_parse_round_trips_known_tags() {
        assert_eq!(QuantVariant::parse("fp32"), Some(QuantVariant::Fp32));
        assert_eq!(QuantVariant::parse("q8"), Some(QuantVariant::Q8));
        assert_eq!(QuantVariant::parse("q4"), Some(QuantVariant::Q4));
        assert_eq!(QuantVariant::parse("q4f16"), Some(QuantVariant::Q4f16));
        assert_eq!(QuantVariant::parse("bogus"), None);
    }

    #[test]
    fn generation_config_defaults_match_spec() {
        let cfg = GenerationConfig::default();
        assert_eq!(cfg.max_new_tokens, 1024);
        assert!((cfg.repetition_penalty - 1.2).abs() < f32::EPSILON);
        assert!((cfg.temperature - 0.8).abs() < f32::EPSILON);
        assert_eq!(cfg.top_k, 1000);
        assert!((cfg.top_p - 0.95).abs() < f32::EPSILON);
        assert_eq!(cfg.seed, 0);
        assert!(cfg.penalize_start_token);
    }

    #[test]
    fn engine_config_round_trips_through_toml_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("engine.toml");

        let mut cfg = EngineConfig::default();
        cfg.quant_variant = QuantVariant::Fp32;
        cfg.intra_threads = Some(4);
        cfg.save_to_file(&path).expect("save");

        let loaded = EngineConfig::from_file(&path).expect("load");
        assert_eq!(loaded.quant_variant, QuantVariant::Fp32);
        assert_eq!(loaded.intra_threads, Some(4));
    }

    #[test]
    fn engine_config_defaults_to_auto_thread_counts() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.intra_threads, None);
        assert_eq!(cfg.inter_threads, None);
    }
}
