//! Command-line configuration.
//!
//! One TOML file holding an `[upload]` table with the session options and
//! an optional `[cache]` table. The file path comes from the first argument
//! or from `BLOCKPUT_CONFIG`.

use std::path::{Path, PathBuf};

use anyhow::Context;
use blockput_session::UploaderConfig;
use serde::{Deserialize, Serialize};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "BLOCKPUT_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub upload: UploaderConfig,

    #[serde(default)]
    pub cache: CacheConfig,
}

/// Where resume records live.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Resume record file; the per-user default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// Keeps records in memory only, so nothing survives the process.
    #[serde(default)]
    pub in_memory: bool,
}

impl Config {
    /// Reads and parses the config file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }
}

/// Picks the config path: the first argument wins over the environment.
pub fn config_path(arg: Option<String>, env: Option<String>) -> anyhow::Result<PathBuf> {
    arg.or(env)
        .filter(|p| !p.trim().is_empty())
        .map(PathBuf::from)
        .with_context(|| format!("usage: blockput <config.toml> (or set {CONFIG_ENV})"))
}
