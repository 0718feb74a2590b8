//! Default filesystem locations for engine configuration and cache data.
//!
//! Uses the [`dirs`] crate for platform-appropriate directory resolution.
//!
//! # Environment overrides
//!
//! - `SONORA_CONFIG_DIR` — overrides [`config_dir`]
//! - `SONORA_CACHE_DIR` — overrides [`cache_dir`]

use std::path::PathBuf;

/// Application config directory (`dirs::config_dir()/sonora/` by default).
///
/// Override with the `SONORA_CONFIG_DIR` environment variable.
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("SONORA_CONFIG_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::config_dir()
        .map(|d| d.join("sonora"))
        .unwrap_or_else(|| PathBuf::from("/tmp/sonora-config"))
}

/// Application cache directory (`dirs::cache_dir()/sonora/` by default).
///
/// Used for persisted voice-conditionals blobs. Override with the
/// `SONORA_CACHE_DIR` environment variable.
#[must_use]
pub fn cache_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("SONORA_CACHE_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::cache_dir()
        .map(|d| d.join("sonora"))
        .unwrap_or_else(|| PathBuf::from("/tmp/sonora-cache"))
}

/// Default engine config file path (`config_dir()/engine.toml`).
#[must_use]
pub fn config_file() -> PathBuf {
    config_dir().join("engine.toml")
}

/// Voice-conditionals cache directory (`cache_dir()/conditionals/`).
#[must_use]
pub fn conditionals_cache_dir() -> PathBuf {
    cache_dir().join("conditionals")
}
