//! Lossless trimming: stream-copy one or more time ranges out of a file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use reelforge_common::TimeRange;

use super::concat::concat;
use crate::{Error, Result, ToolCommand, Workspace};

/// Arguments to stream-copy `range` of `input` into `output`.
pub fn cut_args(input: &Path, range: TimeRange, output: &Path) -> Vec<String> {
    vec![
        "-y".into(),
        "-hide_banner".into(),
        "-ss".into(),
        format!("{:.3}", range.start),
        "-i".into(),
        input.to_string_lossy().into_owned(),
        "-t".into(),
        format!("{:.3}", range.duration()),
        "-map".into(),
        "0".into(),
        "-c".into(),
        "copy".into(),
        "-avoid_negative_ts".into(),
        "make_zero".into(),
        output.to_string_lossy().into_owned(),
    ]
}

/// Keep only `ranges` of `input`, writing the result to `output`.
///
/// One range is a single cut. Several ranges are cut into parts inside
/// `scratch` and joined in the order given.
pub async fn cut(
    ffmpeg: &Path,
    input: &Path,
    ranges: &[TimeRange],
    output: &Path,
    scratch: &Workspace,
    timeout: Duration,
) -> Result<()> {
    if ranges.is_empty() {
        return Err(Error::InvalidInput("no time ranges to keep".into()));
    }
    if !input.exists() {
        return Err(Error::file_not_found(input));
    }

    if let [range] = ranges {
        return run_cut(ffmpeg, input, *range, output, timeout).await;
    }

    let extension = input
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("mp4");
    let mut parts: Vec<PathBuf> = Vec::with_capacity(ranges.len());
    for (i, range) in ranges.iter().enumerate() {
        let part = scratch.temp_file(&format!("part{i:03}.{extension}"));
        run_cut(ffmpeg, input, *range, &part, timeout).await?;
        parts.push(part);
    }
    concat(ffmpeg, &parts, &scratch.temp_file("parts.txt"), output, timeout).await
}

async fn run_cut(
    ffmpeg: &Path,
    input: &Path,
    range: TimeRange,
    output: &Path,
    timeout: Duration,
) -> Result<()> {
    ToolCommand::new(ffmpeg)
        .args(cut_args(input, range, output))
        .timeout(timeout)
        .execute()
        .await?;
    if !output.exists() {
        return Err(Error::tool_failed("ffmpeg", "cut produced no output"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_seek_and_copy() {
        let args = cut_args(
            Path::new("/media/a.mp4"),
            TimeRange::new(12.5, 40.0).unwrap(),
            Path::new("/tmp/out.mp4"),
        );
        assert!(args.windows(2).any(|w| w[0] == "-ss" && w[1] == "12.500"));
        assert!(args.windows(2).any(|w| w[0] == "-t" && w[1] == "27.500"));
        assert!(args.windows(2).any(|w| w[0] == "-c" && w[1] == "copy"));
        assert_eq!(args.last().unwrap(), "/tmp/out.mp4");
    }

    #[tokio::test]
    async fn empty_ranges_rejected() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::new_in(root.path(), "cut-").unwrap();
        let err = cut(
            Path::new("ffmpeg"),
            Path::new("/media/a.mp4"),
            &[],
            &root.path().join("o.mp4"),
            &ws,
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn multi_range_cuts_parts_then_joins() {
        // A stand-in "ffmpeg" that writes its last argument, so the
        // cut-then-concat flow can be observed without real media.
        let root = tempfile::tempdir().unwrap();
        let fake = root.path().join("fake-ffmpeg");
        std::fs::write(&fake, "#!/bin/sh\nfor last; do :; done\necho cut > \"$last\"\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let input = root.path().join("src.mp4");
        std::fs::write(&input, b"src").unwrap();
        let out = root.path().join("out.mp4");
        let ws = Workspace::new_in(root.path(), "cut-").unwrap();

        cut(
            &fake,
            &input,
            &[TimeRange::new(0.0, 5.0).unwrap(), TimeRange::new(10.0, 15.0).unwrap()],
            &out,
            &ws,
            Duration::from_secs(10),
        )
        .await
        .unwrap();

        assert!(out.exists());
        assert!(ws.temp_file("part000.mp4").exists());
        assert!(ws.temp_file("part001.mp4").exists());
    }
}
