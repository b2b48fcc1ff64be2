//! Stream-copy concatenation through ffmpeg's concat demuxer.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result, ToolCommand};

/// Render a concat-demuxer list file. Single quotes in paths are escaped.
pub fn concat_list(inputs: &[PathBuf]) -> String {
    inputs
        .iter()
        .map(|p| format!("file '{}'\n", p.to_string_lossy().replace('\'', r"'\''")))
        .collect()
}

/// Concatenate `inputs`, in the given order, into `output` without
/// re-encoding. Every input must share codec parameters.
pub async fn concat(
    ffmpeg: &Path,
    inputs: &[PathBuf],
    list_path: &Path,
    output: &Path,
    timeout: Duration,
) -> Result<()> {
    if inputs.is_empty() {
        return Err(Error::InvalidInput("nothing to concatenate".into()));
    }
    if let Some(missing) = inputs.iter().find(|p| !p.exists()) {
        return Err(Error::file_not_found(missing));
    }
    std::fs::write(list_path, concat_list(inputs))?;

    let mut cmd = ToolCommand::new(ffmpeg);
    cmd.args(["-y", "-hide_banner", "-f", "concat", "-safe", "0", "-i"])
        .path_arg(list_path)
        .args(["-map", "0", "-c", "copy"]);
    if output.extension().and_then(|e| e.to_str()) == Some("mp4") {
        cmd.args(["-movflags", "+faststart"]);
    }
    cmd.path_arg(output).timeout(timeout);

    let result = cmd.execute().await;
    let _ = std::fs::remove_file(list_path);
    result.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_preserves_order_and_escapes() {
        let list = concat_list(&[
            PathBuf::from("/tmp/b/00001.mp4"),
            PathBuf::from("/tmp/a/00000.mp4"),
            PathBuf::from("/tmp/it's.mp4"),
        ]);
        assert_eq!(
            list,
            "file '/tmp/b/00001.mp4'\nfile '/tmp/a/00000.mp4'\nfile '/tmp/it'\\''s.mp4'\n"
        );
    }

    #[tokio::test]
    async fn missing_input_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = concat(
            Path::new("ffmpeg"),
            &[dir.path().join("gone.mp4")],
            &dir.path().join("list.txt"),
            &dir.path().join("out.mp4"),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::FileNotFound { .. }));
    }
}
