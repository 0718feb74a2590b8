//! Generation Engine (GE): the autoregressive decode loop that turns a
//! token-ID sequence plus voice conditionals into 24 kHz PCM.
//!
//! Four stages: prefill embedding (S1), autoregressive decode (S2), decoder
//! input assembly (S3), final decode to audio (S4). The loop in S2 is the
//! hot path — input/output names and the LM-input → KV-slot mapping are
//! resolved once before the loop, scratch buffers are reserved to their
//! maximum length up front, and KV-cache tensors move from one step's
//! output into the next step's input rather than being copied.

use std::time::Instant;

use tracing::{debug, info};

use crate::conditionals::VoiceConditionals;
use crate::config::{
    GenerationConfig, QuantVariant, SILENCE_TOKEN, START_OF_SPEECH_TOKEN, STOP_OF_SPEECH_TOKEN,
};
use crate::error::{EngineError, Result};
use crate::progress::{ProgressCallback, ProgressEvent};
use crate::runtime::{SessionHandle, Tensor, TensorRuntime};
use crate::sampler::{SamplingParams, Sampler};

/// Logical model name for the token embedder.
pub const EMBED_TOKENS_MODEL: &str = "embed_tokens";
/// Logical model name for the autoregressive language model.
pub const LANGUAGE_MODEL: &str = "language_model";
/// Logical model name for the conditional decoder.
pub const CONDITIONAL_DECODER_MODEL: &str = "conditional_decoder";

const KV_INPUT_PREFIX: &str = "past_key_values.";
const KV_OUTPUT_PREFIX: &str = "present.";

/// The three session handles a generation call needs, resolved once at
/// engine load time.
#[derive(Clone)]
pub struct GenerationModels {
    pub embed_tokens: SessionHandle,
    pub language_model: SessionHandle,
    pub conditional_decoder: SessionHandle,
}

/// Input/output name layout of the language model, discovered once via
/// introspection so the decode loop never re-queries it.
struct LmIo {
    /// Number of KV-cache slots (one tensor per slot, per the spec's
    /// `[1, 16, 0, 64]`-shaped cache — not split into separate key/value
    /// tensors).
    kv_input_names: Vec<String>,
    kv_output_names: Vec<String>,
}

impl LmIo {
    fn discover(runtime: &TensorRuntime, handle: &SessionHandle) -> Result<Self> {
        let (inputs, outputs) = runtime.introspect(handle)?;

        let mut kv_input_names: Vec<String> = inputs
            .into_iter()
            .filter(|n| n.starts_with(KV_INPUT_PREFIX))
            .collect();
        kv_input_names.sort_by_key(|n| kv_slot_index(n, KV_INPUT_PREFIX));

        let mut kv_output_names: Vec<String> = outputs
            .into_iter()
            .filter(|n| n.starts_with(KV_OUTPUT_PREFIX))
            .collect();
        kv_output_names.sort_by_key(|n| kv_slot_index(n, KV_OUTPUT_PREFIX));

        if kv_input_names.len() != kv_output_names.len() {
            return Err(EngineError::LanguageModelFailure(format!(
                "KV-cache input/output count mismatch: {} inputs, {} outputs",
                kv_input_names.len(),
                kv_output_names.len()
            )));
        }

        Ok(Self {
            kv_input_names,
            kv_output_names,
        })
    }
}

fn kv_slot_index(name: &str, prefix: &str) -> usize {
    name.strip_prefix(prefix)
        .and_then(|rest| rest.split('.').next())
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

/// Produce 24 kHz f32 PCM for `token_ids`, conditioned on `conditionals`.
///
/// # Errors
///
/// Returns `EmptyTokens` if `token_ids` is empty, `ConditionalsInvalid` if
/// `conditionals` fails its validity check, and the `EmbeddingFailure` /
/// `LanguageModelFailure` / `DecoderFailure` variants on the respective
/// stage's runtime invocation failing.
pub fn generate(
    runtime: &mut TensorRuntime,
    models: &GenerationModels,
    conditionals: &VoiceConditionals,
    token_ids: &[i64],
    config: &GenerationConfig,
    quant_variant: QuantVariant,
    progress: Option<&ProgressCallback>,
) -> Result<Vec<f32>> {
    if token_ids.is_empty() {
        return Err(EngineError::EmptyTokens);
    }
    if !conditionals.is_valid() {
        return Err(EngineError::ConditionalsInvalid(
            "bound voice conditionals failed the validity check".into(),
        ));
    }

    let start = Instant::now();
    if let Some(cb) = progress {
        cb(ProgressEvent::GenerationStarted {
            max_steps: config.max_new_tokens,
        });
    }

    // --- S1: prefill embedding ---
    let text_embeds = embed(runtime, &models.embed_tokens, token_ids)?;
    let hidden_dim = *text_embeds
        .shape()
        .last()
        .ok_or_else(|| EngineError::EmbeddingFailure("embed_tokens returned rank 0".into()))?;

    let cond_emb = &conditionals.cond_emb;
    let prefill = concat_sequence_axis(&cond_emb.data, &text_embeds.to_f32_vec()?, hidden_dim)?;
    let prefill_len = cond_emb.shape[1] + token_ids.len() as i64;

    // --- S2: autoregressive decode ---
    let lm_io = LmIo::discover(runtime, &models.language_model)?;
    let num_slots = lm_io.kv_input_names.len();

    let mut generated: Vec<i64> = Vec::with_capacity(config.max_new_tokens + 1);
    generated.push(START_OF_SPEECH_TOKEN);

    let mut kv_cache: Vec<Tensor> = (0..num_slots)
        .map(|_| match quant_variant {
            QuantVariant::Q4f16 => Tensor::zeros_f16(vec![1, 16, 0, 64]),
            _ => Tensor::zeros_f32(vec![1, 16, 0, 64]),
        })
        .collect();

    let mut sampler = if config.seed != 0 {
        Sampler::from_seed(config.seed)
    } else {
        Sampler::from_entropy()
    };
    let sampling_params = SamplingParams {
        repetition_penalty: config.repetition_penalty,
        temperature: config.temperature,
        top_k: config.top_k,
        top_p: config.top_p,
        penalize_start_token: config.penalize_start_token,
    };

    // Scratch buffers reserved to their maximum possible length up front and
    // only resized (via `clear`/`extend`), never reallocated, across steps.
    let mut attention_mask_buf: Vec<i64> =
        Vec::with_capacity(prefill_len as usize + config.max_new_tokens);
    let mut position_ids_buf: Vec<i64> = Vec::with_capacity((prefill_len as usize).max(1));
    let mut inputs_embeds_buf = prefill;

    let mut position: i64 = 0;
    let mut step_len = prefill_len;

    for step in 0..config.max_new_tokens {
        attention_mask_buf.extend(std::iter::repeat(1i64).take(step_len as usize));
        position_ids_buf.clear();
        position_ids_buf.extend(position..position + step_len);

        let kv_inputs: Vec<(String, Tensor)> = lm_io
            .kv_input_names
            .iter()
            .cloned()
            .zip(kv_cache.into_iter())
            .collect();

        let (mut last_logits, next_kv_cache) = runtime
            .invoke_decode_step(
                &models.language_model,
                &inputs_embeds_buf,
                [1, step_len as usize, hidden_dim as usize],
                &attention_mask_buf,
                &position_ids_buf,
                kv_inputs,
                &lm_io.kv_output_names,
            )
            .map_err(|e| EngineError::LanguageModelFailure(e.to_string()))?;
        kv_cache = next_kv_cache;

        let next_token = sampler.sample(&mut last_logits, &generated, &sampling_params);
        generated.push(next_token);

        if let Some(cb) = progress {
            cb(ProgressEvent::GenerationStep {
                step,
                max_steps: config.max_new_tokens,
            });
        }

        if next_token == STOP_OF_SPEECH_TOKEN {
            break;
        }

        position += step_len;
        step_len = 1;
        let next_embed = embed(runtime, &models.embed_tokens, &[next_token])?;
        inputs_embeds_buf.clear();
        inputs_embeds_buf.extend_from_slice(&next_embed.to_f32_vec()?);
    }

    debug!(
        "decode loop finished after {} steps, generated {} tokens",
        generated.len() - 1,
        generated.len()
    );

    // --- S3: assemble decoder input ---
    let speech_tokens = assemble_decoder_input(&generated, &conditionals.prompt_token.data);

    // --- S4: decode to audio ---
    let samples = decode_to_audio(runtime, &models.conditional_decoder, &speech_tokens, conditionals)?;

    let elapsed = start.elapsed();
    info!(
        "generated {} samples ({:.2}s audio) in {:.0}ms (rtf={:.2})",
        samples.len(),
        samples.len() as f32 / crate::config::OUTPUT_SAMPLE_RATE as f32,
        elapsed.as_millis(),
        elapsed.as_secs_f32() / (samples.len() as f32 / crate::config::OUTPUT_SAMPLE_RATE as f32).max(1e-6)
    );
    if let Some(cb) = progress {
        cb(ProgressEvent::GenerationComplete {
            samples: samples.len(),
            duration_secs: elapsed.as_secs_f64(),
        });
    }

    Ok(samples)
}

fn embed(runtime: &mut TensorRuntime, handle: &SessionHandle, token_ids: &[i64]) -> Result<Tensor> {
    let mut inputs = std::collections::HashMap::with_capacity(1);
    inputs.insert(
        "input_ids".to_owned(),
        Tensor::I64 {
            shape: vec![1, token_ids.len() as i64],
            data: token_ids.to_vec(),
        },
    );
    let mut outputs = runtime
        .invoke(handle, inputs, &["inputs_embeds"])
        .map_err(|e| EngineError::EmbeddingFailure(e.to_string()))?;
    Ok(outputs.remove(0))
}

fn concat_sequence_axis(cond_emb: &[f32], text_embeds: &[f32], _hidden_dim: i64) -> Result<Vec<f32>> {
    let mut out = Vec::with_capacity(cond_emb.len() + text_embeds.len());
    out.extend_from_slice(cond_emb);
    out.extend_from_slice(text_embeds);
    Ok(out)
}

/// Drop the leading start token and trailing stop token (if present),
/// append three silence tokens, and prepend the VCR prompt tokens.
fn assemble_decoder_input(generated: &[i64], prompt_token: &[i64]) -> Vec<i64> {
    let mut speech = &generated[..];
    if speech.first() == Some(&START_OF_SPEECH_TOKEN) {
        speech = &speech[1..];
    }
    if speech.last() == Some(&STOP_OF_SPEECH_TOKEN) {
        speech = &speech[..speech.len() - 1];
    }

    let mut out = Vec::with_capacity(prompt_token.len() + speech.len() + 3);
    out.extend_from_slice(prompt_token);
    out.extend_from_slice(speech);
    out.extend(std::iter::repeat(SILENCE_TOKEN).take(3));
    out
}

fn decode_to_audio(
    runtime: &mut TensorRuntime,
    handle: &SessionHandle,
    speech_tokens: &[i64],
    conditionals: &VoiceConditionals,
) -> Result<Vec<f32>> {
    let mut inputs = std::collections::HashMap::with_capacity(3);
    inputs.insert(
        "speech_tokens".to_owned(),
        Tensor::I64 {
            shape: vec![1, speech_tokens.len() as i64],
            data: speech_tokens.to_vec(),
        },
    );
    inputs.insert(
        "speaker_embeddings".to_owned(),
        Tensor::F32 {
            shape: conditionals.speaker_embeddings.shape.clone(),
            data: conditionals.speaker_embeddings.data.clone(),
        },
    );
    inputs.insert(
        "speaker_features".to_owned(),
        Tensor::F32 {
            shape: conditionals.speaker_features.shape.clone(),
            data: conditionals.speaker_features.data.clone(),
        },
    );

    let mut outputs = runtime
        .invoke(handle, inputs, &["waveform"])
        .map_err(|e| EngineError::DecoderFailure(e.to_string()))?;
    outputs.remove(0).to_f32_vec()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::conditionals::{FloatArray, IntArray};

    fn sample_conditionals() -> VoiceConditionals {
        VoiceConditionals {
            cond_emb: FloatArray {
                shape: vec![1, 2, 4],
                data: vec![0.1; 8],
            },
            prompt_token: IntArray {
                shape: vec![1, 3],
                data: vec![100, 101, 102],
            },
            speaker_embeddings: FloatArray {
                shape: vec![1, 4],
                data: vec![0.2; 4],
            },
            speaker_features: FloatArray {
                shape: vec![1, 2, 4],
                data: vec![0.3; 8],
            },
        }
    }

    #[test]
    fn empty_tokens_is_rejected_before_any_invocation() {
        let mut runtime = TensorRuntime::new(None, None);
        let models = GenerationModels {
            embed_tokens: SessionHandle::for_test(EMBED_TOKENS_MODEL),
            language_model: SessionHandle::for_test(LANGUAGE_MODEL),
            conditional_decoder: SessionHandle::for_test(CONDITIONAL_DECODER_MODEL),
        };
        let err = generate(
            &mut runtime,
            &models,
            &sample_conditionals(),
            &[],
            &GenerationConfig::default(),
            QuantVariant::Fp32,
            None,
        )
        .expect_err("should reject empty tokens");
        assert!(matches!(err, EngineError::EmptyTokens));
    }

    #[test]
    fn invalid_conditionals_are_rejected_before_any_invocation() {
        let mut runtime = TensorRuntime::new(None, None);
        let models = GenerationModels {
            embed_tokens: SessionHandle::for_test(EMBED_TOKENS_MODEL),
            language_model: SessionHandle::for_test(LANGUAGE_MODEL),
            conditional_decoder: SessionHandle::for_test(CONDITIONAL_DECODER_MODEL),
        };
        let mut bad = sample_conditionals();
        bad.cond_emb.data.clear();
        bad.cond_emb.shape = vec![0];

        let err = generate(
            &mut runtime,
            &models,
            &bad,
            &[1, 2, 3],
            &GenerationConfig::default(),
            QuantVariant::Fp32,
            None,
        )
        .expect_err("should reject invalid conditionals");
        assert!(matches!(err, EngineError::ConditionalsInvalid(_)));
    }

    #[test]
    fn assemble_decoder_input_strips_start_and_stop_and_appends_silence() {
        let generated = vec![START_OF_SPEECH_TOKEN, 10, 20, 30, STOP_OF_SPEECH_TOKEN];
        let prompt = vec![1, 2];
        let d = assemble_decoder_input(&generated, &prompt);
        assert_eq!(d, vec![1, 2, 10, 20, 30, SILENCE_TOKEN, SILENCE_TOKEN, SILENCE_TOKEN]);
    }

    #[test]
    fn assemble_decoder_input_tolerates_missing_stop_token() {
        let generated = vec![START_OF_SPEECH_TOKEN, 10, 20];
        let prompt = vec![5];
        let d = assemble_decoder_input(&generated, &prompt);
        assert_eq!(d, vec![5, 10, 20, SILENCE_TOKEN, SILENCE_TOKEN, SILENCE_TOKEN]);
    }

    #[test]
    fn kv_slot_index_parses_numeric_suffix() {
        assert_eq!(kv_slot_index("past_key_values.3", KV_INPUT_PREFIX), 3);
        assert_eq!(kv_slot_index("past_key_values.12.key", KV_INPUT_PREFIX), 12);
    }
}
