//! Adaptive-streaming packaging with Bento4's `mp4hls`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result, ToolCommand};

/// Manifest file written by `mp4hls` at the root of its output directory.
pub const MANIFEST_NAME: &str = "master.m3u8";

pub fn package_args(inputs: &[PathBuf], output_dir: &Path, segment_duration: u32) -> Vec<String> {
    let mut args = vec![
        format!("--segment-duration={segment_duration}"),
        format!("--output-dir={}", output_dir.to_string_lossy()),
    ];
    args.extend(inputs.iter().map(|p| p.to_string_lossy().into_owned()));
    args
}

/// Package `inputs` into a multi-rendition HLS tree at `output_dir`, which
/// must not exist yet. Returns the manifest path.
pub async fn package(
    mp4hls: &Path,
    inputs: &[PathBuf],
    output_dir: &Path,
    segment_duration: u32,
    timeout: Duration,
) -> Result<PathBuf> {
    if inputs.is_empty() {
        return Err(Error::InvalidInput("no renditions to package".into()));
    }
    if let Some(parent) = output_dir.parent() {
        std::fs::create_dir_all(parent)?;
    }

    ToolCommand::new(mp4hls)
        .args(package_args(inputs, output_dir, segment_duration))
        .timeout(timeout)
        .execute()
        .await?;

    let manifest = output_dir.join(MANIFEST_NAME);
    if !manifest.exists() {
        return Err(Error::tool_failed("mp4hls", "no manifest produced"));
    }
    Ok(manifest)
}

/// Recursively copy `src` over `dest`, overwriting files that exist.
///
/// Segments land first, then variant playlists, and the root manifest
/// last, so a reader following the manifest only reaches files that are
/// already in place. Each file is written beside its target and renamed.
pub fn merge_into(src: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    for relative in merge_order(src)? {
        let from = src.join(&relative);
        let to = dest.join(&relative);
        let parent = to.parent().unwrap_or(dest);
        std::fs::create_dir_all(parent)?;
        let name = relative
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let staging = parent.join(format!(".{name}.merging"));
        std::fs::copy(&from, &staging)?;
        std::fs::rename(&staging, &to)?;
    }
    Ok(())
}

/// Files under `root`, relative to it, in the order they are safe to publish.
fn merge_order(root: &Path) -> Result<Vec<PathBuf>> {
    fn walk(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                walk(root, &path, out)?;
            } else if let Ok(relative) = path.strip_prefix(root) {
                out.push(relative.to_path_buf());
            }
        }
        Ok(())
    }

    let mut files = Vec::new();
    walk(root, root, &mut files)?;
    files.sort_by_key(|p| {
        let rank = if p.as_path() == Path::new(MANIFEST_NAME) {
            2
        } else if p.extension().is_some_and(|e| e == "m3u8") {
            1
        } else {
            0
        };
        (rank, p.clone())
    });
    Ok(files)
}
