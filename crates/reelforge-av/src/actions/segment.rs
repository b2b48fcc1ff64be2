//! Lossless segmenting of a source into fixed-duration chunks.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result, ToolCommand};

/// Arguments for a stream-copy segmenting run.
pub fn segment_args(input: &Path, out_dir: &Path, segment_secs: u64, extension: &str) -> Vec<String> {
    let pattern = out_dir.join(format!("%05d.{extension}"));
    vec![
        "-y".into(),
        "-hide_banner".into(),
        "-i".into(),
        input.to_string_lossy().into_owned(),
        "-c".into(),
        "copy".into(),
        "-map".into(),
        "0:v:0".into(),
        "-map".into(),
        "0:a:0?".into(),
        "-f".into(),
        "segment".into(),
        "-segment_time".into(),
        segment_secs.to_string(),
        "-reset_timestamps".into(),
        "1".into(),
        pattern.to_string_lossy().into_owned(),
    ]
}

/// Split `input` into `segment_secs`-long pieces inside `out_dir`.
///
/// Returns the segment paths in playback order. Cuts land on keyframes, so
/// actual durations vary around the requested length.
pub async fn segment(
    ffmpeg: &Path,
    input: &Path,
    out_dir: &Path,
    segment_secs: u64,
    timeout: Duration,
) -> Result<Vec<PathBuf>> {
    if segment_secs == 0 {
        return Err(Error::InvalidInput("segment duration must be positive".into()));
    }
    let extension = input
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("mp4")
        .to_string();
    std::fs::create_dir_all(out_dir)?;

    ToolCommand::new(ffmpeg)
        .args(segment_args(input, out_dir, segment_secs, &extension))
        .timeout(timeout)
        .execute()
        .await?;

    let segments = list_segments(out_dir, &extension)?;
    if segments.is_empty() {
        return Err(Error::tool_failed("ffmpeg", "segmenting produced no output"));
    }
    tracing::debug!(count = segments.len(), dir = %out_dir.display(), "source segmented");
    Ok(segments)
}

/// Segment files in `dir`, ordered by their zero-padded index.
pub fn list_segments(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let mut segments: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().and_then(|e| e.to_str()) == Some(extension))
        .collect();
    segments.sort();
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_use_stream_copy_and_pattern() {
        let args = segment_args(Path::new("/src/a.mp4"), Path::new("/tmp/g"), 240, "mp4");
        assert!(args.windows(2).any(|w| w[0] == "-c" && w[1] == "copy"));
        assert!(args.windows(2).any(|w| w[0] == "-segment_time" && w[1] == "240"));
        assert_eq!(args.last().unwrap(), "/tmp/g/%05d.mp4");
    }

    #[test]
    fn segments_listed_in_index_order() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["00002.mp4", "00000.mp4", "00010.mp4", "00001.mp4", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let names: Vec<String> = list_segments(dir.path(), "mp4")
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["00000.mp4", "00001.mp4", "00002.mp4", "00010.mp4"]);
    }

    #[tokio::test]
    async fn zero_duration_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = segment(
            Path::new("ffmpeg"),
            Path::new("/src/a.mp4"),
            dir.path(),
            0,
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
