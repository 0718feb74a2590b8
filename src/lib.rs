//! Sonora: an on-device, zero-shot voice-cloning text-to-speech inference
//! engine.
//!
//! Given a short reference utterance and text token IDs, [`Engine`]
//! synthesizes 24 kHz mono PCM in the reference speaker's voice, without any
//! speaker-specific fine-tuning. Four ONNX models are composed behind a
//! single facade:
//!
//! - **Speech encoder** — turns a reference waveform into voice conditionals.
//! - **Token embedder** — embeds text and generated speech tokens.
//! - **Autoregressive language model** — the decode loop, KV-cache driven.
//! - **Conditional decoder** — turns speech tokens back into audio.
//!
//! # Architecture
//!
//! - [`runtime`] — Tensor Runtime Facade: a typed, name-indexed wrapper
//!   around `ort::Session`.
//! - [`conditionals`] — Voice Conditionals Record: the four-array output of
//!   the speech encoder, plus its binary serialization format.
//! - [`cache`] — Voice Conditionals Cache: a two-tier memory/disk cache over
//!   conditionals, keyed by reference-audio identity.
//! - [`encoder`] — Speech Encoder Front: waveform → conditionals.
//! - [`sampler`] — logit post-processing (repetition penalty, temperature,
//!   top-k, top-p, softmax, sampling).
//! - [`generation`] — Generation Engine: the autoregressive decode loop.
//! - [`models_path`] — filesystem layout resolution for model files.
//! - [`engine`] — the public facade tying the above together.

pub mod cache;
pub mod conditionals;
pub mod config;
pub mod dirs;
pub mod encoder;
pub mod engine;
pub mod error;
pub mod generation;
pub mod models_path;
pub mod progress;
pub mod runtime;
pub mod sampler;

pub use conditionals::VoiceConditionals;
pub use config::{EngineConfig, GenerationConfig, QuantVariant};
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use progress::{ProgressCallback, ProgressEvent};
