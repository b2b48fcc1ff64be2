//! ffprobe-based media probing.

use std::path::Path;
use std::time::Duration;

use reelforge_common::MediaInfo;
use serde::Deserialize;

use crate::{Error, Result, ToolCommand};

const PROBE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    format: Option<FfprobeFormat>,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: String,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    field_order: Option<String>,
    duration: Option<String>,
}

/// Probe a media file using ffprobe.
pub async fn probe_with_ffprobe(ffprobe: &Path, path: &Path) -> Result<MediaInfo> {
    if !path.exists() {
        return Err(Error::file_not_found(path));
    }

    let output = ToolCommand::new(ffprobe)
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .path_arg(path)
        .timeout(PROBE_TIMEOUT)
        .execute()
        .await?;

    parse_ffprobe_json(&output.stdout)
}

/// Parse `ffprobe -print_format json -show_format -show_streams` output.
pub fn parse_ffprobe_json(json: &str) -> Result<MediaInfo> {
    let out: FfprobeOutput = serde_json::from_str(json)?;

    let video = out
        .streams
        .iter()
        .find(|s| s.codec_type == "video")
        .ok_or_else(|| Error::parse_error("ffprobe", "no video stream"))?;

    let duration_secs = out
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .or(video.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    // avg_frame_rate is 0/0 for some streams; r_frame_rate is the fallback.
    let frame_rate = video
        .avg_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .or_else(|| video.r_frame_rate.as_deref().and_then(parse_frame_rate))
        .unwrap_or(0.0);

    let interlaced = matches!(
        video.field_order.as_deref(),
        Some("tt" | "bb" | "tb" | "bt")
    );

    Ok(MediaInfo {
        duration_secs,
        frame_rate,
        width: video.width.unwrap_or(0),
        height: video.height.unwrap_or(0),
        has_audio: out.streams.iter().any(|s| s.codec_type == "audio"),
        interlaced,
        video_codec: video.codec_name.clone(),
    })
}

/// Parse a rational like `30000/1001` or a plain number.
fn parse_frame_rate(s: &str) -> Option<f64> {
    let fps = match s.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().ok()?;
            let den: f64 = den.parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => s.parse().ok()?,
    };
    (fps.is_finite() && fps > 0.0).then_some(fps)
}
