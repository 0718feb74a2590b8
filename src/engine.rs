//! Top-level engine facade: wires the tensor runtime, voice-conditionals
//! cache, speech encoder, and generation engine behind the public surface.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::cache::VoiceConditionalsCache;
use crate::conditionals::VoiceConditionals;
use crate::config::{EngineConfig, GenerationConfig, QuantVariant};
use crate::encoder;
use crate::error::{EngineError, Result};
use crate::generation::{self, GenerationModels};
use crate::models_path::resolve_model_file;
use crate::progress::ProgressCallback;
use crate::runtime::TensorRuntime;

/// A loaded, ready-to-generate voice-cloning TTS engine.
///
/// Owns exactly one [`TensorRuntime`] and zero-or-one current
/// [`VoiceConditionals`]. Not `Send`-shared across threads for concurrent
/// generation calls — a single engine serializes its own calls, per the
/// orchestration model this crate implements.
pub struct Engine {
    config: EngineConfig,
    quant_variant: QuantVariant,
    runtime: TensorRuntime,
    cache: VoiceConditionalsCache,
    models: Option<LoadedModels>,
    current_conditionals: Option<VoiceConditionals>,
}

struct LoadedModels {
    speech_encoder: crate::runtime::SessionHandle,
    generation: GenerationModels,
}

impl Engine {
    /// Construct an engine for the given quant variant. Models are not
    /// loaded until [`Self::load_models`] is called.
    pub fn new(quant_variant: QuantVariant) -> Self {
        Self::with_config(EngineConfig {
            quant_variant,
            ..EngineConfig::default()
        })
    }

    /// Construct an engine from a full [`EngineConfig`].
    pub fn with_config(config: EngineConfig) -> Self {
        let runtime = TensorRuntime::new(config.intra_threads, config.inter_threads);
        let cache = VoiceConditionalsCache::new(config.cache_dir.clone());
        Self {
            quant_variant: config.quant_variant,
            config,
            runtime,
            cache,
            models: None,
            current_conditionals: None,
        }
    }

    /// Load all four ONNX models from `models_dir` (overriding the
    /// directory recorded in the engine's config).
    ///
    /// # Errors
    ///
    /// Returns `ModelNotFound`/`ModelLoadError` if any of the four model
    /// files is missing or fails to load, `AlreadyLoaded` if models are
    /// already loaded (call [`Self::unload_models`] first).
    pub fn load_models(&mut self, models_dir: &Path) -> Result<()> {
        if self.models.is_some() {
            return Err(EngineError::AlreadyLoaded("engine models".into()));
        }

        let load_one = |runtime: &mut TensorRuntime, logical_name: &str| -> Result<_> {
            let path = resolve_model_file(models_dir, logical_name, self.quant_variant)?;
            info!("loading '{logical_name}' from {}", path.display());
            let start = std::time::Instant::now();
            let handle = runtime.load(logical_name, &path)?;
            info!(
                "loaded '{logical_name}' in {:.0}ms",
                start.elapsed().as_millis()
            );
            Ok(handle)
        };

        let speech_encoder = load_one(&mut self.runtime, encoder::MODEL_NAME)?;
        let embed_tokens = load_one(&mut self.runtime, generation::EMBED_TOKENS_MODEL)?;
        let language_model = load_one(&mut self.runtime, generation::LANGUAGE_MODEL)?;
        let conditional_decoder = load_one(&mut self.runtime, generation::CONDITIONAL_DECODER_MODEL)?;

        self.models = Some(LoadedModels {
            speech_encoder,
            generation: GenerationModels {
                embed_tokens,
                language_model,
                conditional_decoder,
            },
        });

        Ok(())
    }

    /// Tear down all loaded models, freeing the underlying sessions.
    pub fn unload_models(&mut self) {
        self.runtime.unload_all();
        self.models = None;
    }

    /// Whether all four models are currently loaded.
    pub fn is_ready(&self) -> bool {
        self.models.is_some()
    }

    /// Encode a reference waveform into voice conditionals and set them as
    /// the engine's current conditionals. Does not touch the cache — use
    /// [`Self::prepare_conditionals_cached`] for cache-aware encoding.
    ///
    /// # Errors
    ///
    /// Returns `ModelsNotReady` if models are not loaded, `ReferenceTooShort`
    /// if `waveform` is under the minimum duration.
    pub fn prepare_conditionals(&mut self, waveform: &[f32]) -> Result<()> {
        let models = self.models.as_ref().ok_or(EngineError::ModelsNotReady)?;
        let vcr = encoder::encode(&mut self.runtime, &models.speech_encoder, waveform)?;
        self.current_conditionals = Some(vcr);
        Ok(())
    }

    /// Like [`Self::prepare_conditionals`], but checks the voice
    /// conditionals cache under `key` first, and persists a freshly encoded
    /// result back into it.
    ///
    /// # Errors
    ///
    /// Same as [`Self::prepare_conditionals`]; a cache-write failure is
    /// reported as `CacheWrite` even though the conditionals are still set.
    pub fn prepare_conditionals_cached(
        &mut self,
        key: &str,
        waveform: &[f32],
        persist: bool,
    ) -> Result<()> {
        let key = VoiceConditionalsCache::extract_key(key);
        if let Some(cached) = self.cache.get(&key) {
            self.current_conditionals = Some(cached.clone());
            return Ok(());
        }
        if let Some(vcr) = self.cache.load_from_disk(&key)? {
            self.current_conditionals = Some(vcr.clone());
            self.cache.put(&key, vcr, false)?;
            return Ok(());
        }

        let models = self.models.as_ref().ok_or(EngineError::ModelsNotReady)?;
        let vcr = encoder::encode(&mut self.runtime, &models.speech_encoder, waveform)?;
        self.current_conditionals = Some(vcr.clone());
        self.cache.put(&key, vcr, persist)
    }

    /// Explicitly set the engine's current conditionals (e.g. loaded
    /// directly from a `.cond` file without going through the cache).
    pub fn set_conditionals(&mut self, vcr: VoiceConditionals) {
        self.current_conditionals = Some(vcr);
    }

    /// The engine's current conditionals, if any have been set.
    pub fn get_conditionals(&self) -> Option<&VoiceConditionals> {
        self.current_conditionals.as_ref()
    }

    /// Generate 24 kHz PCM for `token_ids`, using the engine's current
    /// conditionals.
    ///
    /// # Errors
    ///
    /// Returns `ModelsNotReady` if models are not loaded, `ConditionalsInvalid`
    /// if no conditionals have been set or they fail validation, plus every
    /// error [`crate::generation::generate`] can return.
    pub fn generate(
        &mut self,
        token_ids: &[i64],
        config: &GenerationConfig,
        progress: Option<&ProgressCallback>,
    ) -> Result<Vec<f32>> {
        let models = self.models.as_ref().ok_or(EngineError::ModelsNotReady)?;
        let conditionals = self
            .current_conditionals
            .as_ref()
            .ok_or_else(|| EngineError::ConditionalsInvalid("no conditionals set".into()))?;

        generation::generate(
            &mut self.runtime,
            &models.generation,
            conditionals,
            token_ids,
            config,
            self.quant_variant,
            progress,
        )
    }

    /// The engine's construction-time configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Load every well-formed entry from the cache directory into memory,
    /// so subsequent `prepare_conditionals_cached` calls can hit without a
    /// disk read.
    ///
    /// # Errors
    ///
    /// Returns `IoError` if the cache directory exists but cannot be listed.
    pub fn warm_cache(&mut self) -> Result<usize> {
        self.cache.load_all_from_disk()
    }
}

/// Default path to the engine's TOML config file under the platform config
/// directory.
pub fn default_config_path() -> PathBuf {
    crate::dirs::config_file()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn fresh_engine_is_not_ready() {
        let engine = Engine::new(QuantVariant::Fp32);
        assert!(!engine.is_ready());
        assert!(engine.get_conditionals().is_none());
    }

    #[test]
    fn generate_before_load_models_is_models_not_ready() {
        let mut engine = Engine::new(QuantVariant::Fp32);
        let err = engine
            .generate(&[1, 2, 3], &GenerationConfig::default(), None)
            .expect_err("should fail");
        assert!(matches!(err, EngineError::ModelsNotReady));
    }

    #[test]
    fn load_models_with_missing_files_fails_without_marking_ready() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut engine = Engine::new(QuantVariant::Fp32);
        let err = engine
            .load_models(dir.path())
            .expect_err("should fail, no model files present");
        assert!(matches!(err, EngineError::ModelNotFound(_)));
        assert!(!engine.is_ready());
    }

    #[test]
    fn prepare_conditionals_before_load_models_is_models_not_ready() {
        let mut engine = Engine::new(QuantVariant::Fp32);
        let err = engine
            .prepare_conditionals(&[0.0; 16_000 * 5])
            .expect_err("should fail");
        assert!(matches!(err, EngineError::ModelsNotReady));
    }
}
