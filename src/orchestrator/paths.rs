//! On-disk layout of engine outputs.

use reelforge_db::models::{EncodeProfile, Media};
use std::path::{Path, PathBuf};

/// Make `s` safe to use as a single path component.
fn component(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

/// `{media_root}/encoded/{profile_id}/{owner}/{uid}.{profile_name}.{ext}`
pub fn rendition_path(media_root: &Path, profile: &EncodeProfile, media: &Media) -> PathBuf {
    media_root
        .join("encoded")
        .join(profile.id.to_string())
        .join(component(&media.owner))
        .join(format!(
            "{}.{}.{}",
            component(&media.uid),
            profile.name,
            profile.extension
        ))
}

/// Where a copied source lives: `{media_root}/original/{owner}/{uid}.{ext}`.
pub fn source_path(media_root: &Path, owner: &str, uid: &str, extension: &str) -> PathBuf {
    media_root
        .join("original")
        .join(component(owner))
        .join(format!("{}.{extension}", component(uid)))
}

/// Scratch root of one chunk group.
pub fn group_dir(chunks_root: &Path, group_key: &str) -> PathBuf {
    chunks_root.join(component(group_key))
}

pub fn segments_dir(chunks_root: &Path, group_key: &str) -> PathBuf {
    group_dir(chunks_root, group_key).join("segments")
}

/// Encoded output of one segment for one profile.
pub fn chunk_output_path(
    chunks_root: &Path,
    group_key: &str,
    profile: &EncodeProfile,
    segment: &Path,
) -> PathBuf {
    let stem = segment
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "segment".to_string());
    group_dir(chunks_root, group_key)
        .join("out")
        .join(profile.id.to_string())
        .join(format!("{stem}.{}", profile.extension))
}

/// Stable adaptive-streaming directory of a media.
pub fn hls_dir(hls_root: &Path, media: &Media) -> PathBuf {
    hls_root.join(component(&media.uid))
}
