mod types;

pub use types::*;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let mut config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    expand_paths(&mut config);
    validate_config(&config)?;

    Ok(config)
}

/// Load config from default locations or return default config
pub fn load_config_or_default(custom_path: Option<&Path>) -> Result<Config> {
    if let Some(path) = custom_path {
        return load_config(path);
    }

    let default_paths = [
        "./reelforge.toml",
        "./config.toml",
        "~/.config/reelforge/config.toml",
        "/etc/reelforge/config.toml",
    ];

    for path_str in default_paths {
        let path = shellexpand::tilde(path_str);
        let path = Path::new(path.as_ref());
        if path.exists() {
            return load_config(path);
        }
    }

    let mut config = Config::default();
    expand_paths(&mut config);
    validate_config(&config)?;
    Ok(config)
}

fn expand(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).as_ref())
}

/// Expand `~` in every configured path.
pub fn expand_paths(config: &mut Config) {
    let storage = &mut config.storage;
    storage.media_root = expand(&storage.media_root);
    storage.temp_dir = expand(&storage.temp_dir);
    storage.hls_dir = expand(&storage.hls_dir);
    storage.db_path = expand(&storage.db_path);

    let tools = &mut config.tools;
    for slot in [&mut tools.ffmpeg, &mut tools.ffprobe, &mut tools.mp4hls] {
        if let Some(path) = slot.as_mut() {
            *path = expand(path);
        }
    }
}

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    if config.workers.concurrency == 0 {
        anyhow::bail!("Worker concurrency cannot be 0");
    }

    let encoding = &config.encoding;
    if encoding.chunk_duration_secs == 0 {
        anyhow::bail!("Chunk duration cannot be 0");
    }
    if encoding.chunking_threshold_secs < encoding.chunk_duration_secs as f64 {
        anyhow::bail!(
            "Chunking threshold ({}s) must not be shorter than the chunk duration ({}s)",
            encoding.chunking_threshold_secs,
            encoding.chunk_duration_secs
        );
    }

    if config.packaging.segment_duration_secs == 0 {
        anyhow::bail!("Packaging segment duration cannot be 0");
    }

    if !config.storage.media_root.is_absolute() {
        anyhow::bail!(
            "Media root must be an absolute path: {:?}",
            config.storage.media_root
        );
    }

    if !config.storage.temp_dir.exists() {
        tracing::warn!("Temp dir does not exist yet: {:?}", config.storage.temp_dir);
    }

    Ok(())
}
