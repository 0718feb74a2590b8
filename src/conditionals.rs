//! Voice Conditionals Representation (VCR): the four named arrays produced
//! by the speech encoder from a reference utterance, and the bespoke binary
//! format used to persist them.
//!
//! # Binary format
//!
//! Little-endian throughout:
//!
//! ```text
//! u32  magic    = 0x434F4E44 ("COND")
//! u32  version  = 1
//! <field: cond_emb>
//! <field: prompt_token>
//! <field: speaker_embeddings>
//! <field: speaker_features>
//! ```
//!
//! where each `<field>` is:
//!
//! ```text
//! u32        num_dims
//! i64 * n    shape
//! u64        byte_count
//! u8 * byte_count  raw little-endian element bytes
//! ```

use std::io::{self, Read, Write};

use crate::error::{EngineError, Result};

const MAGIC: u32 = 0x434F_4E44;
const VERSION: u32 = 1;

/// A named `f32` array with its shape.
#[derive(Debug, Clone, PartialEq)]
pub struct FloatArray {
    /// Tensor shape.
    pub shape: Vec<i64>,
    /// Row-major element data.
    pub data: Vec<f32>,
}

/// A named `i64` array with its shape.
#[derive(Debug, Clone, PartialEq)]
pub struct IntArray {
    /// Tensor shape.
    pub shape: Vec<i64>,
    /// Row-major element data.
    pub data: Vec<i64>,
}

/// The four encoder outputs that together condition generation on a
/// reference voice.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceConditionals {
    /// Continuous conditioning embedding fed to the language model.
    pub cond_emb: FloatArray,
    /// Discrete prompt token sequence prepended to generated tokens.
    pub prompt_token: IntArray,
    /// Fixed-size global speaker embedding.
    pub speaker_embeddings: FloatArray,
    /// Frame-level speaker feature sequence consumed by the decoder.
    pub speaker_features: FloatArray,
}

impl VoiceConditionals {
    /// A conditionals set is valid when every array is non-empty and its
    /// declared shape's product matches its data length.
    pub fn is_valid(&self) -> bool {
        shape_matches(&self.cond_emb.shape, self.cond_emb.data.len())
            && shape_matches(&self.prompt_token.shape, self.prompt_token.data.len())
            && shape_matches(
                &self.speaker_embeddings.shape,
                self.speaker_embeddings.data.len(),
            )
            && shape_matches(
                &self.speaker_features.shape,
                self.speaker_features.data.len(),
            )
            && !self.cond_emb.data.is_empty()
            && !self.prompt_token.data.is_empty()
            && !self.speaker_embeddings.data.is_empty()
            && !self.speaker_features.data.is_empty()
    }

    /// Serialize to the bespoke binary format.
    ///
    /// # Errors
    ///
    /// Returns `IoError` if the writer fails.
    pub fn write_to<W: Write>(&self, mut w: W) -> Result<()> {
        w.write_all(&MAGIC.to_le_bytes())?;
        w.write_all(&VERSION.to_le_bytes())?;
        write_f32_field(&mut w, &self.cond_emb)?;
        write_i64_field(&mut w, &self.prompt_token)?;
        write_f32_field(&mut w, &self.speaker_embeddings)?;
        write_f32_field(&mut w, &self.speaker_features)?;
        Ok(())
    }

    /// Deserialize from the bespoke binary format.
    ///
    /// # Errors
    ///
    /// Returns `CacheFormat` if the magic or version does not match.
    /// Returns `IoError` on any read failure (including truncation).
    pub fn read_from<R: Read>(mut r: R) -> Result<Self> {
        let magic = read_u32(&mut r)?;
        if magic != MAGIC {
            return Err(EngineError::CacheFormat);
        }
        let version = read_u32(&mut r)?;
        if version != VERSION {
            return Err(EngineError::CacheFormat);
        }

        let cond_emb = read_f32_field(&mut r)?;
        let prompt_token = read_i64_field(&mut r)?;
        let speaker_embeddings = read_f32_field(&mut r)?;
        let speaker_features = read_f32_field(&mut r)?;

        Ok(Self {
            cond_emb,
            prompt_token,
            speaker_embeddings,
            speaker_features,
        })
    }

    /// Serialize into an in-memory byte buffer.
    ///
    /// # Errors
    ///
    /// Returns `IoError` if writing to the in-memory buffer fails (never,
    /// in practice — surfaced for symmetry with [`Self::write_to`]).
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.write_to(&mut buf)?;
        Ok(buf)
    }

    /// Deserialize from an in-memory byte buffer.
    ///
    /// # Errors
    ///
    /// Returns `CacheFormat` on magic/version mismatch, `IoError` on
    /// truncated input.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::read_from(bytes)
    }
}

fn shape_matches(shape: &[i64], len: usize) -> bool {
    let expected: i64 = shape.iter().product();
    expected >= 0 && expected as usize == len
}

fn write_f32_field<W: Write>(w: &mut W, field: &FloatArray) -> Result<()> {
    write_shape(w, &field.shape)?;
    let byte_count = (field.data.len() * 4) as u64;
    w.write_all(&byte_count.to_le_bytes())?;
    for v in &field.data {
        w.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

fn write_i64_field<W: Write>(w: &mut W, field: &IntArray) -> Result<()> {
    write_shape(w, &field.shape)?;
    let byte_count = (field.data.len() * 8) as u64;
    w.write_all(&byte_count.to_le_bytes())?;
    for v in &field.data {
        w.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

fn write_shape<W: Write>(w: &mut W, shape: &[i64]) -> Result<()> {
    let num_dims = shape.len() as u32;
    w.write_all(&num_dims.to_le_bytes())?;
    for dim in shape {
        w.write_all(&dim.to_le_bytes())?;
    }
    Ok(())
}

fn read_shape<R: Read>(r: &mut R) -> Result<Vec<i64>> {
    let num_dims = read_u32(r)? as usize;
    let mut shape = Vec::with_capacity(num_dims);
    for _ in 0..num_dims {
        shape.push(read_i64(r)?);
    }
    Ok(shape)
}

fn read_f32_field<R: Read>(r: &mut R) -> Result<FloatArray> {
    let shape = read_shape(r)?;
    let byte_count = read_u64(r)? as usize;
    if byte_count % 4 != 0 {
        return Err(EngineError::CacheFormat);
    }
    let mut data = Vec::with_capacity(byte_count / 4);
    let mut buf = [0u8; 4];
    for _ in 0..(byte_count / 4) {
        r.read_exact(&mut buf)?;
        data.push(f32::from_le_bytes(buf));
    }
    Ok(FloatArray { shape, data })
}

fn read_i64_field<R: Read>(r: &mut R) -> Result<IntArray> {
    let shape = read_shape(r)?;
    let byte_count = read_u64(r)? as usize;
    if byte_count % 8 != 0 {
        return Err(EngineError::CacheFormat);
    }
    let mut data = Vec::with_capacity(byte_count / 8);
    let mut buf = [0u8; 8];
    for _ in 0..(byte_count / 8) {
        r.read_exact(&mut buf)?;
        data.push(i64::from_le_bytes(buf));
    }
    Ok(IntArray { shape, data })
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).map_err(io_err)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_i64<R: Read>(r: &mut R) -> Result<i64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn io_err(e: io::Error) -> EngineError {
    EngineError::IoError(e)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    fn sample() -> VoiceConditionals {
        VoiceConditionals {
            cond_emb: FloatArray {
                shape: vec![1, 4, 8],
                data: (0..32).map(|i| i as f32 * 0.5).collect(),
            },
            prompt_token: IntArray {
                shape: vec![1, 6],
                data: vec![6561, 10, 20, 30, 40, 6562],
            },
            speaker_embeddings: FloatArray {
                shape: vec![1, 192],
                data: vec![0.1; 192],
            },
            speaker_features: FloatArray {
                shape: vec![1, 4, 80],
                data: vec![0.2; 320],
            },
        }
    }

    #[test]
    fn round_trips_through_bytes() {
        let vcr = sample();
        let bytes = vcr.to_bytes().expect("serialize");
        let decoded = VoiceConditionals::from_bytes(&bytes).expect("deserialize");
        assert_eq!(vcr, decoded);
    }

    #[test]
    fn valid_sample_passes_validity_check() {
        assert!(sample().is_valid());
    }

    #[test]
    fn empty_array_is_invalid() {
        let mut vcr = sample();
        vcr.cond_emb.data.clear();
        vcr.cond_emb.shape = vec![0];
        assert!(!vcr.is_valid());
    }

    #[test]
    fn shape_mismatch_is_invalid() {
        let mut vcr = sample();
        vcr.speaker_embeddings.shape = vec![1, 999];
        assert!(!vcr.is_valid());
    }

    #[test]
    fn bad_magic_is_rejected_as_cache_format() {
        let mut bytes = sample().to_bytes().expect("serialize");
        bytes[0] ^= 0xFF;
        let err = VoiceConditionals::from_bytes(&bytes).expect_err("should fail");
        assert!(matches!(err, EngineError::CacheFormat));
    }

    #[test]
    fn bad_version_is_rejected_as_cache_format() {
        let mut bytes = sample().to_bytes().expect("serialize");
        bytes[4..8].copy_from_slice(&99u32.to_le_bytes());
        let err = VoiceConditionals::from_bytes(&bytes).expect_err("should fail");
        assert!(matches!(err, EngineError::CacheFormat));
    }

    #[test]
    fn truncated_input_is_io_error() {
        let bytes = sample().to_bytes().expect("serialize");
        let truncated = &bytes[..bytes.len() - 10];
        let err = VoiceConditionals::from_bytes(truncated).expect_err("should fail");
        assert!(matches!(err, EngineError::IoError(_)));
    }
}
