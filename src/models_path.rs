//! Resolves the on-disk location of a model file under `models_dir`.
//!
//! Model acquisition (downloading) is out of scope for this engine; the
//! caller is responsible for ensuring the files exist. This module only
//! locates them, accepting three layouts:
//!
//! 1. Directly under `models_dir`: `<models_dir>/<name><suffix>.onnx`.
//! 2. Under an `onnx/` subdirectory: `<models_dir>/onnx/<name><suffix>.onnx`.
//! 3. A HuggingFace Hub cache layout rooted at `models_dir`:
//!    `<models_dir>/models--<org>--<repo>/snapshots/<hash>/onnx/<name><suffix>.onnx`
//!    (the first matching snapshot directory found is used).

use std::path::{Path, PathBuf};

use crate::config::QuantVariant;
use crate::error::{EngineError, Result};

/// Find the path to a named model file for the given quant variant.
///
/// # Errors
///
/// Returns `ModelNotFound` if no candidate layout contains the file.
pub fn resolve_model_file(
    models_dir: &Path,
    logical_name: &str,
    quant_variant: QuantVariant,
) -> Result<PathBuf> {
    let filename = format!("{logical_name}{}.onnx", quant_variant.filename_suffix());

    for candidate in candidate_paths(models_dir, &filename) {
        if candidate.is_file() {
            return Ok(candidate);
        }
    }

    Err(EngineError::ModelNotFound(format!(
        "{filename} under {}",
        models_dir.display()
    )))
}

/// Path to the tokenizer file consumed by the external tokenizer collaborator.
///
/// # Errors
///
/// Returns `ModelNotFound` if no candidate layout contains the file.
pub fn resolve_tokenizer_file(models_dir: &Path) -> Result<PathBuf> {
    for candidate in candidate_paths(models_dir, "tokenizer.json") {
        if candidate.is_file() {
            return Ok(candidate);
        }
    }

    Err(EngineError::ModelNotFound(format!(
        "tokenizer.json under {}",
        models_dir.display()
    )))
}

/// Enumerate every layout-specific candidate path for `filename` under `root`.
fn candidate_paths(root: &Path, filename: &str) -> Vec<PathBuf> {
    let mut candidates = vec![root.join(filename), root.join("onnx").join(filename)];

    for snapshot_onnx_dir in huggingface_snapshot_onnx_dirs(root) {
        candidates.push(snapshot_onnx_dir.join(filename));
    }

    candidates
}

/// Walk `root` for `models--*/snapshots/*/onnx` directories, HuggingFace
/// Hub's on-disk cache layout. Missing or unreadable directories yield no
/// candidates rather than an error — this is a best-effort probe, not the
/// authoritative check (that happens in `resolve_model_file`).
fn huggingface_snapshot_onnx_dirs(root: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();

    let Ok(top_entries) = std::fs::read_dir(root) else {
        return found;
    };
    for top_entry in top_entries.flatten() {
        let name = top_entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with("models--") {
            continue;
        }

        let snapshots_dir = top_entry.path().join("snapshots");
        let Ok(snapshot_entries) = std::fs::read_dir(&snapshots_dir) else {
            continue;
        };
        for snapshot_entry in snapshot_entries.flatten() {
            found.push(snapshot_entry.path().join("onnx"));
        }
    }

    found
}
