//! Speech Encoder Facade (SEF): turns a reference waveform into
//! [`VoiceConditionals`] via a single ONNX model invocation.

use tracing::info;

use crate::config::{MIN_REFERENCE_DURATION_S, SPEECH_TOKENIZER_SAMPLE_RATE};
use crate::conditionals::{FloatArray, IntArray, VoiceConditionals};
use crate::error::{EngineError, Result};
use crate::runtime::{SessionHandle, Tensor, TensorRuntime};

/// Logical model name the speech encoder is loaded under.
pub const MODEL_NAME: &str = "speech_encoder";

/// Names of the four encoder outputs, in the exact order the graph
/// declares them and the exact order [`encode`] assembles into a
/// [`VoiceConditionals`].
const OUTPUT_NAMES: [&str; 4] = [
    "cond_emb",
    "prompt_token",
    "speaker_embeddings",
    "speaker_features",
];

/// Encode a 16 kHz mono reference waveform into voice conditionals.
///
/// # Errors
///
/// Returns `ReferenceTooShort` if `waveform` is shorter than
/// [`MIN_REFERENCE_DURATION_S`]. Returns `EncoderOutputShapeMismatch` if the
/// graph does not produce all four named outputs. Returns
/// `RuntimeInvocationError` if the underlying invocation fails.
pub fn encode(
    runtime: &mut TensorRuntime,
    handle: &SessionHandle,
    waveform: &[f32],
) -> Result<VoiceConditionals> {
    let duration_s = waveform.len() as f32 / SPEECH_TOKENIZER_SAMPLE_RATE as f32;
    if duration_s < MIN_REFERENCE_DURATION_S {
        return Err(EngineError::ReferenceTooShort { duration_s });
    }

    info!("encoding reference audio ({duration_s:.2}s, {} samples)", waveform.len());

    let mut inputs = std::collections::HashMap::with_capacity(1);
    inputs.insert(
        "waveform".to_owned(),
        Tensor::F32 {
            shape: vec![1, waveform.len() as i64],
            data: waveform.to_vec(),
        },
    );

    let outputs = runtime.invoke(handle, inputs, &OUTPUT_NAMES)?;
    if outputs.len() != 4 {
        return Err(EngineError::EncoderOutputShapeMismatch { got: outputs.len() });
    }

    let mut outputs = outputs.into_iter();
    let cond_emb = into_float_array(outputs.next().expect("checked len == 4"))?;
    let prompt_token = into_int_array(outputs.next().expect("checked len == 4"))?;
    let speaker_embeddings = into_float_array(outputs.next().expect("checked len == 4"))?;
    let speaker_features = into_float_array(outputs.next().expect("checked len == 4"))?;

    let vcr = VoiceConditionals {
        cond_emb,
        prompt_token,
        speaker_embeddings,
        speaker_features,
    };

    if !vcr.is_valid() {
        return Err(EngineError::ConditionalsInvalid(
            "encoder produced an empty or shape-inconsistent output".into(),
        ));
    }

    Ok(vcr)
}

fn into_float_array(tensor: Tensor) -> Result<FloatArray> {
    let shape = tensor.shape().to_vec();
    let data = tensor.to_f32_vec()?;
    Ok(FloatArray { shape, data })
}

fn into_int_array(tensor: Tensor) -> Result<IntArray> {
    let shape = tensor.shape().to_vec();
    let data = tensor.to_i64_vec()?;
    Ok(IntArray { shape, data })
}
