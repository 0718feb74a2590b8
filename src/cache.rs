//! Voice Conditionals Cache (VCC): a two-tier cache over [`VoiceConditionals`],
//! an in-memory map backed by a directory of `<key>.cond` blobs.
//!
//! Writes are crash-safe: a blob is written to a temp file beside its final
//! path and then renamed into place, so a reader never observes a partially
//! written file. A disk-write failure does not roll back the memory tier —
//! the freshly computed conditionals are still usable for the rest of the
//! process, only persistence failed.
//!
//! A blob that fails to parse (bad magic/version) is treated as a cache miss
//! rather than an error: the caller falls back to recomputing it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::conditionals::VoiceConditionals;
use crate::error::{EngineError, Result};

/// Two-tier (memory + disk) cache of [`VoiceConditionals`], keyed by an
/// arbitrary caller-chosen string (typically derived from the reference
/// audio's file path).
pub struct VoiceConditionalsCache {
    dir: PathBuf,
    memory: HashMap<String, VoiceConditionals>,
}

impl VoiceConditionalsCache {
    /// Open a cache rooted at `dir`. The directory is created lazily on
    /// first write, not here.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            memory: HashMap::new(),
        }
    }

    /// Normalize a cache key: a bare key is used as-is, a filesystem path is
    /// reduced to its file stem. Idempotent — normalizing an already-bare
    /// key returns it unchanged.
    pub fn extract_key(raw: &str) -> String {
        let path = Path::new(raw);
        match path.extension() {
            Some(_) => path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or(raw)
                .to_owned(),
            None => raw.to_owned(),
        }
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.cond"))
    }

    /// Whether `key` is present in the in-memory tier.
    pub fn has_in_memory(&self, key: &str) -> bool {
        self.memory.contains_key(key)
    }

    /// Whether a blob exists on disk for `key`, without loading it.
    pub fn exists_on_disk(&self, key: &str) -> bool {
        self.blob_path(key).is_file()
    }

    /// Fetch conditionals for `key` from the memory tier only. Never touches
    /// disk: a memory miss is returned as `None` even if a blob for `key`
    /// exists on disk. Callers that want the disk tier composed in (e.g. to
    /// promote a disk hit into memory) call [`Self::load_from_disk`]
    /// themselves — keeping `get` a pure, non-blocking reader lets
    /// concurrent `get` calls run without any risk of one becoming an
    /// exclusive writer.
    pub fn get(&self, key: &str) -> Option<&VoiceConditionals> {
        self.memory.get(key)
    }

    /// Read a blob from disk without touching the memory tier. Returns
    /// `Ok(None)` for a clean miss (file absent) or a format mismatch
    /// (treated as a miss, per the cache's silent-miss contract).
    ///
    /// # Errors
    ///
    /// Returns `IoError` for I/O failures other than "file does not exist".
    pub fn load_from_disk(&self, key: &str) -> Result<Option<VoiceConditionals>> {
        let path = self.blob_path(key);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(EngineError::IoError(e)),
        };

        match VoiceConditionals::from_bytes(&bytes) {
            Ok(vcr) => Ok(Some(vcr)),
            Err(EngineError::CacheFormat) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Load every readable, well-formed blob under the cache directory into
    /// the memory tier. Unreadable or malformed entries are skipped.
    ///
    /// # Errors
    ///
    /// Returns `IoError` if the cache directory itself cannot be listed
    /// (absence of the directory is not an error: it yields zero entries).
    pub fn load_all_from_disk(&mut self) -> Result<usize> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(EngineError::IoError(e)),
        };

        let mut loaded = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("cond") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let key = stem.to_owned();

            match std::fs::read(&path) {
                Ok(bytes) => match VoiceConditionals::from_bytes(&bytes) {
                    Ok(vcr) => {
                        self.memory.insert(key, vcr);
                        loaded += 1;
                    }
                    Err(e) => warn!("skipping malformed cache entry {}: {e}", path.display()),
                },
                Err(e) => warn!("skipping unreadable cache entry {}: {e}", path.display()),
            }
        }
        Ok(loaded)
    }

    /// Store `vcr` under `key`. The memory tier is always updated. If
    /// `persist` is set, the blob is also written to disk via a
    /// write-to-temp-then-rename; a failure there is reported as
    /// `Err(CacheWrite)` without undoing the memory-tier update.
    ///
    /// # Errors
    ///
    /// Returns `CacheWrite` if `persist` is set and the disk write fails.
    pub fn put(&mut self, key: &str, vcr: VoiceConditionals, persist: bool) -> Result<()> {
        self.memory.insert(key.to_owned(), vcr.clone());

        if persist {
            self.write_blob(key, &vcr)
                .map_err(|e| EngineError::CacheWrite(e.to_string()))?;
        }

        Ok(())
    }

    fn write_blob(&self, key: &str, vcr: &VoiceConditionals) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;

        let bytes = vcr.to_bytes()?;
        let final_path = self.blob_path(key);
        let tmp_path = self
            .dir
            .join(format!(".{key}.cond.tmp-{}", std::process::id()));

        std::fs::write(&tmp_path, &bytes)?;
        std::fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }

    /// Remove `key` from both tiers. Absence on either tier is not an error.
    ///
    /// # Errors
    ///
    /// Returns `IoError` if the on-disk blob exists but cannot be removed.
    pub fn remove(&mut self, key: &str) -> Result<()> {
        self.memory.remove(key);
        let path = self.blob_path(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::IoError(e)),
        }
    }

    /// Drop every entry from both tiers: the memory map and every `.cond`
    /// blob under the cache directory.
    ///
    /// # Errors
    ///
    /// Returns `IoError` if the cache directory exists but cannot be listed,
    /// or if a blob exists but cannot be removed. The memory tier is cleared
    /// regardless of whether the disk sweep succeeds.
    pub fn clear(&mut self) -> Result<()> {
        self.memory.clear();

        let entries = match std::fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(EngineError::IoError(e)),
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("cond") {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    /// Number of entries currently held in the memory tier.
    pub fn len(&self) -> usize {
        self.memory.len()
    }

    /// Whether the memory tier is empty.
    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::conditionals::{FloatArray, IntArray};

    fn sample() -> VoiceConditionals {
        VoiceConditionals {
            cond_emb: FloatArray {
                shape: vec![1, 2],
                data: vec![1.0, 2.0],
            },
            prompt_token: IntArray {
                shape: vec![1, 2],
                data: vec![6561, 6562],
            },
            speaker_embeddings: FloatArray {
                shape: vec![1, 2],
                data: vec![0.5, 0.5],
            },
            speaker_features: FloatArray {
                shape: vec![1, 2],
                data: vec![0.25, 0.25],
            },
        }
    }

    #[test]
    fn extract_key_strips_extension() {
        assert_eq!(
            VoiceConditionalsCache::extract_key("/tmp/ref_audio.wav"),
            "ref_audio"
        );
    }

    #[test]
    fn extract_key_is_idempotent_on_bare_keys() {
        let once = VoiceConditionalsCache::extract_key("speaker_42");
        let twice = VoiceConditionalsCache::extract_key(&once);
        assert_eq!(once, twice);
        assert_eq!(once, "speaker_42");
    }

    #[test]
    fn put_without_persist_is_memory_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cache = VoiceConditionalsCache::new(dir.path());

        cache.put("k", sample(), false).expect("put");
        assert!(cache.has_in_memory("k"));
        assert!(!cache.exists_on_disk("k"));
    }

    #[test]
    fn put_with_persist_writes_through_and_reads_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cache = VoiceConditionalsCache::new(dir.path());

        cache.put("k", sample(), true).expect("put");
        assert!(cache.exists_on_disk("k"));

        let fresh = VoiceConditionalsCache::new(dir.path());
        assert_eq!(fresh.get("k"), None, "get must not read through to disk");
        let fetched = fresh.load_from_disk("k").expect("load_from_disk");
        assert_eq!(fetched, Some(sample()));
    }

    #[test]
    fn get_is_memory_only_and_never_touches_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut writer = VoiceConditionalsCache::new(dir.path());
        writer.put("k", sample(), true).expect("put");

        let fresh = VoiceConditionalsCache::new(dir.path());
        assert!(fresh.exists_on_disk("k"));
        assert_eq!(fresh.get("k"), None);
    }

    #[test]
    fn format_mismatch_is_silent_miss() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("bad.cond"), b"not a real blob").expect("write");

        let cache = VoiceConditionalsCache::new(dir.path());
        assert_eq!(cache.load_from_disk("bad").expect("load_from_disk"), None);
    }

    #[test]
    fn clear_empties_both_tiers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cache = VoiceConditionalsCache::new(dir.path());
        cache.put("k", sample(), true).expect("put");
        assert!(cache.has_in_memory("k"));
        assert!(cache.exists_on_disk("k"));

        cache.clear().expect("clear");
        assert!(!cache.has_in_memory("k"));
        assert!(!cache.exists_on_disk("k"));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn load_all_from_disk_skips_malformed_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut writer = VoiceConditionalsCache::new(dir.path());
        writer.put("good", sample(), true).expect("put");
        std::fs::write(dir.path().join("bad.cond"), b"garbage").expect("write");

        let mut cache = VoiceConditionalsCache::new(dir.path());
        let loaded = cache.load_all_from_disk().expect("load_all");
        assert_eq!(loaded, 1);
        assert!(cache.has_in_memory("good"));
        assert!(!cache.has_in_memory("bad"));
    }

    #[test]
    fn remove_clears_both_tiers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cache = VoiceConditionalsCache::new(dir.path());
        cache.put("k", sample(), true).expect("put");

        cache.remove("k").expect("remove");
        assert!(!cache.has_in_memory("k"));
        assert!(!cache.exists_on_disk("k"));
    }

    #[test]
    fn removing_absent_key_is_not_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cache = VoiceConditionalsCache::new(dir.path());
        assert!(cache.remove("nonexistent").is_ok());
    }
}
