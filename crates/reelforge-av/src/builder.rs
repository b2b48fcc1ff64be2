//! Encoder command construction.
//!
//! [`build_commands`] is a pure function: no I/O, no clock, no randomness.
//! Identical requests always produce byte-identical argument vectors, which
//! is what makes re-running a job safe.

use std::path::{Path, PathBuf};

use reelforge_common::{Codec, Container, MediaInfo};
use serde::{Deserialize, Serialize};

/// Seconds between forced keyframes.
pub const SECONDS_PER_KEYFRAME: f64 = 4.0;

/// Minimum keyframe distance, in seconds.
pub const MIN_SECONDS_PER_KEYFRAME: f64 = 2.0;

/// Frame rate assumed when the probe did not report a usable one.
const FALLBACK_FPS: f64 = 30.0;

/// Highest frame rate emitted; anything above is halved until it fits.
const MAX_FPS: f64 = 60.0;

/// Tunables that come from configuration rather than from the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildSettings {
    /// Sources shorter than this use single-pass constant quality.
    pub short_source_secs: f64,
    /// Resolutions produced even when the source is smaller.
    pub minimum_resolutions: Vec<u32>,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            short_source_secs: 2.0,
            minimum_resolutions: vec![240, 360],
        }
    }
}

/// Everything needed to build the commands for one job.
#[derive(Debug, Clone)]
pub struct BuildRequest<'a> {
    pub ffmpeg: &'a Path,
    pub input: &'a Path,
    pub media_info: &'a MediaInfo,
    /// Target height in pixels.
    pub resolution: u32,
    /// Codec name as stored on the profile.
    pub codec: &'a str,
    pub output: &'a Path,
    /// Prefix for two-pass statistics files.
    pub pass_log: &'a Path,
    pub is_chunk: bool,
    pub settings: &'a BuildSettings,
}

/// Configuration errors: the profile can never be encoded as requested.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BuildError {
    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),
}

/// One encoder invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// `Some(1)` / `Some(2)` for two-pass runs, `None` for single pass.
    pub pass: Option<u8>,
    /// False for a first pass that discards its output.
    pub writes_output: bool,
}

impl EncoderCommand {
    /// Shell-like rendering, stored on the job record for diagnosis.
    pub fn display(&self) -> String {
        std::iter::once(self.program.to_string_lossy().into_owned())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Rate-control strategy chosen for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingType {
    /// Single pass constant quality.
    Crf,
    /// Two-pass average bitrate.
    TwoPass,
}

/// Constant-quality value per codec.
fn crf(codec: Codec) -> u32 {
    match codec {
        Codec::H264 | Codec::H264Nvenc => 23,
        Codec::H265 => 28,
        Codec::Vp9 => 32,
    }
}

/// Target video bitrate in kbit/s.
///
/// `fps_row` is 30 or 60. A missing 60fps entry falls back to the 30fps
/// row; a missing 30fps entry means the resolution is not supported.
pub fn target_bitrate(codec: Codec, fps_row: u32, resolution: u32) -> Option<u32> {
    fn lookup(codec: Codec, fps_row: u32, resolution: u32) -> Option<u32> {
        let row: &[(u32, u32)] = match (codec, fps_row) {
            (Codec::H264 | Codec::H264Nvenc, 30) => &[
                (144, 150),
                (240, 300),
                (360, 500),
                (480, 1000),
                (720, 2500),
                (1080, 4500),
                (1440, 9000),
                (2160, 18000),
            ],
            (Codec::H264 | Codec::H264Nvenc, 60) => {
                &[(720, 3500), (1080, 7500), (1440, 18000), (2160, 40000)]
            }
            (Codec::H265 | Codec::Vp9, 30) => &[
                (144, 75),
                (240, 150),
                (360, 275),
                (480, 500),
                (720, 1024),
                (1080, 1800),
                (1440, 4500),
                (2160, 10000),
            ],
            (Codec::H265 | Codec::Vp9, 60) => {
                &[(720, 1800), (1080, 3000), (1440, 8000), (2160, 18000)]
            }
            _ => &[],
        };
        row.iter().find(|(r, _)| *r == resolution).map(|(_, b)| *b)
    }

    lookup(codec, fps_row, resolution).or_else(|| {
        if fps_row == 30 {
            None
        } else {
            lookup(codec, 30, resolution)
        }
    })
}

/// Halve the input rate while above 60fps, never below 1fps.
pub fn target_fps(input_fps: f64) -> f64 {
    let mut fps = if input_fps.is_finite() && input_fps > 0.0 {
        input_fps
    } else {
        FALLBACK_FPS
    };
    while fps > MAX_FPS {
        fps /= 2.0;
    }
    fps.max(1.0)
}

/// Which bitrate-table row a frame rate belongs to.
pub fn fps_row(fps: f64) -> u32 {
    if fps > 30.0 {
        60
    } else {
        30
    }
}

/// Decide the rate-control strategy.
pub fn encoding_type(codec: Codec, duration_secs: f64, settings: &BuildSettings) -> EncodingType {
    if codec.is_hardware() || duration_secs < settings.short_source_secs {
        EncodingType::Crf
    } else {
        EncodingType::TwoPass
    }
}

/// Compact, deterministic rendering of a frame rate.
fn fmt_fps(fps: f64) -> String {
    if fps.fract() == 0.0 {
        format!("{fps:.0}")
    } else {
        let s = format!("{fps:.3}");
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

fn filter_chain(info: &MediaInfo, resolution: u32, fps: f64) -> String {
    let mut filters = Vec::with_capacity(3);
    if info.interlaced {
        filters.push("yadif".to_string());
    }
    filters.push(format!("scale=-2:{resolution}:flags=lanczos"));
    filters.push(format!("fps=fps={}", fmt_fps(fps)));
    filters.join(",")
}

fn path_str(p: &Path) -> String {
    p.to_string_lossy().into_owned()
}

/// Build the encoder commands for one job.
///
/// Returns `Ok(vec![])` when the profile must not be encoded for this
/// source: no bitrate entry for the resolution, or an upscale outside the
/// minimum-resolution allow-list.
pub fn build_commands(req: &BuildRequest<'_>) -> Result<Vec<EncoderCommand>, BuildError> {
    let codec: Codec = req
        .codec
        .parse()
        .map_err(|_| BuildError::UnsupportedCodec(req.codec.to_string()))?;

    let info = req.media_info;
    if info.height < req.resolution && !req.settings.minimum_resolutions.contains(&req.resolution) {
        return Ok(Vec::new());
    }

    let fps = target_fps(info.frame_rate);
    let Some(bitrate) = target_bitrate(codec, fps_row(fps), req.resolution) else {
        return Ok(Vec::new());
    };

    let container = codec.container();
    let keyint = (fps * SECONDS_PER_KEYFRAME).round() as u32;
    let keyint_min = (fps * MIN_SECONDS_PER_KEYFRAME).round() as u32;

    let mut base = vec![
        "-y".to_string(),
        "-hide_banner".to_string(),
        "-i".to_string(),
        path_str(req.input),
        "-map".to_string(),
        "0:v:0".to_string(),
    ];
    if info.has_audio {
        base.extend(["-map".to_string(), "0:a:0?".to_string()]);
    }
    base.extend([
        "-c:v".to_string(),
        codec.encoder().to_string(),
        "-filter:v".to_string(),
        filter_chain(info, req.resolution, fps),
        "-pix_fmt".to_string(),
        "yuv420p".to_string(),
        "-g".to_string(),
        keyint.to_string(),
        "-keyint_min".to_string(),
        keyint_min.to_string(),
    ]);
    base.extend(codec_flags(codec, keyint, keyint_min));

    let commands = match encoding_type(codec, info.duration_secs, req.settings) {
        EncodingType::Crf => {
            let mut args = base;
            args.extend(crf_flags(codec, bitrate));
            args.extend(audio_flags(codec, info.has_audio));
            args.extend(output_flags(container, req.is_chunk));
            args.push(path_str(req.output));
            vec![EncoderCommand {
                program: req.ffmpeg.to_path_buf(),
                args,
                pass: None,
                writes_output: true,
            }]
        }
        EncodingType::TwoPass => {
            let mut first = base.clone();
            first.extend(two_pass_flags(codec, bitrate, 1, req.pass_log));
            first.extend([
                "-an".to_string(),
                "-f".to_string(),
                container.muxer().to_string(),
                "/dev/null".to_string(),
            ]);

            let mut second = base;
            second.extend(two_pass_flags(codec, bitrate, 2, req.pass_log));
            second.extend(audio_flags(codec, info.has_audio));
            second.extend(output_flags(container, req.is_chunk));
            second.push(path_str(req.output));

            vec![
                EncoderCommand {
                    program: req.ffmpeg.to_path_buf(),
                    args: first,
                    pass: Some(1),
                    writes_output: false,
                },
                EncoderCommand {
                    program: req.ffmpeg.to_path_buf(),
                    args: second,
                    pass: Some(2),
                    writes_output: true,
                },
            ]
        }
    };

    Ok(commands)
}

fn strings<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Encoder tuning independent of rate control.
fn codec_flags(codec: Codec, keyint: u32, keyint_min: u32) -> Vec<String> {
    match codec {
        Codec::H264 => {
            let mut f = strings(["-preset", "medium", "-profile:v", "high", "-sc_threshold", "0"]);
            f.extend([
                "-x264-params".to_string(),
                format!("keyint={keyint}:min-keyint={keyint_min}:scenecut=0"),
            ]);
            f
        }
        Codec::H265 => strings(["-preset", "medium", "-tag:v", "hvc1"]),
        Codec::Vp9 => strings([
            "-deadline",
            "good",
            "-cpu-used",
            "2",
            "-row-mt",
            "1",
            "-tile-columns",
            "2",
        ]),
        Codec::H264Nvenc => strings(["-preset", "p5", "-profile:v", "high"]),
    }
}

fn crf_flags(codec: Codec, bitrate: u32) -> Vec<String> {
    let q = crf(codec).to_string();
    match codec {
        Codec::H264 | Codec::H265 => vec!["-crf".to_string(), q],
        // Constrained quality: the bitrate is a ceiling, not a target.
        Codec::Vp9 => vec![
            "-crf".to_string(),
            q,
            "-b:v".to_string(),
            format!("{bitrate}k"),
        ],
        Codec::H264Nvenc => vec![
            "-rc".to_string(),
            "vbr".to_string(),
            "-cq".to_string(),
            q,
            "-b:v".to_string(),
            "0".to_string(),
            "-maxrate".to_string(),
            format!("{bitrate}k"),
            "-bufsize".to_string(),
            format!("{}k", bitrate * 2),
        ],
    }
}

fn two_pass_flags(codec: Codec, bitrate: u32, pass: u8, pass_log: &Path) -> Vec<String> {
    let mut f = vec![
        "-b:v".to_string(),
        format!("{bitrate}k"),
        "-maxrate".to_string(),
        format!("{}k", bitrate * 3 / 2),
        "-bufsize".to_string(),
        format!("{}k", bitrate * 2),
    ];
    match codec {
        Codec::H265 => f.extend([
            "-x265-params".to_string(),
            format!("pass={pass}:stats={}", path_str(pass_log)),
        ]),
        _ => f.extend([
            "-pass".to_string(),
            pass.to_string(),
            "-passlogfile".to_string(),
            path_str(pass_log),
        ]),
    }
    f
}

fn audio_flags(codec: Codec, has_audio: bool) -> Vec<String> {
    if !has_audio {
        return strings(["-an"]);
    }
    match codec.container() {
        Container::Webm => strings(["-c:a", "libopus", "-b:a", "96k", "-ac", "2"]),
        Container::Mp4 => strings(["-c:a", "aac", "-b:a", "128k", "-ac", "2"]),
    }
}

fn output_flags(container: Container, is_chunk: bool) -> Vec<String> {
    match container {
        // Chunks are concatenated later; the moov atom is moved on the final file.
        Container::Mp4 if !is_chunk => strings(["-movflags", "+faststart", "-f", "mp4"]),
        Container::Mp4 => strings(["-f", "mp4"]),
        Container::Webm => strings(["-f", "webm"]),
    }
}
