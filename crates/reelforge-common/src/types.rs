//! Core enums shared by the database, the AV layer and the orchestrator.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Implements `as_str`, `Display` and `FromStr` for a unit-only enum with
/// fixed string forms.
macro_rules! string_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant),)+
                    other => Err(format!("unknown {}: {}", stringify!($name), other)),
                }
            }
        }
    };
}

/// Status of a single job record.
///
/// `Pending -> Running -> {Success, Fail}`. Terminal states are never mutated
/// back; a retry is a fresh `Pending` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncodingStatus {
    Pending,
    Running,
    Success,
    Fail,
}

string_enum!(EncodingStatus {
    Pending => "pending",
    Running => "running",
    Success => "success",
    Fail => "fail",
});

impl EncodingStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Fail)
    }

    /// Pending or running.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

/// Externally visible encoding status of a source media, projected from its
/// non-chunk job records. Shares the job status vocabulary.
pub type AggregateStatus = EncodingStatus;

/// Target codec of an encode profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    H264,
    H265,
    Vp9,
    /// Hardware-accelerated H.264 (NVENC). Always constant quality with a rate cap.
    H264Nvenc,
}

string_enum!(Codec {
    H264 => "h264",
    H265 => "h265",
    Vp9 => "vp9",
    H264Nvenc => "h264_nvenc",
});

impl Codec {
    pub const ALL: [Codec; 4] = [Codec::H264, Codec::H265, Codec::Vp9, Codec::H264Nvenc];

    /// ffmpeg encoder name.
    pub fn encoder(&self) -> &'static str {
        match self {
            Self::H264 => "libx264",
            Self::H265 => "libx265",
            Self::Vp9 => "libvpx-vp9",
            Self::H264Nvenc => "h264_nvenc",
        }
    }

    pub fn container(&self) -> Container {
        match self {
            Self::Vp9 => Container::Webm,
            _ => Container::Mp4,
        }
    }

    pub fn is_hardware(&self) -> bool {
        matches!(self, Self::H264Nvenc)
    }
}

/// Container family of a rendition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    Mp4,
    Webm,
}

string_enum!(Container {
    Mp4 => "mp4",
    Webm => "webm",
});

impl Container {
    pub fn extension(&self) -> &'static str {
        self.as_str()
    }

    /// The family eligible for adaptive-streaming packaging.
    pub fn is_packaged(&self) -> bool {
        matches!(self, Self::Mp4)
    }

    /// Muxer name for `-f` on null-output first passes and segmenting.
    pub fn muxer(&self) -> &'static str {
        self.as_str()
    }
}

/// What a trim request does with the source media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrimAction {
    /// Cut the existing media in place.
    Replace,
    /// Clone the media and cut the clone.
    SaveNew,
    /// Produce one new media per requested range.
    CreateSegments,
}

string_enum!(TrimAction {
    Replace => "replace",
    SaveNew => "save_new",
    CreateSegments => "create_segments",
});

/// Lifecycle of a trim request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrimStatus {
    Initial,
    Running,
    Success,
    Fail,
}

string_enum!(TrimStatus {
    Initial => "initial",
    Running => "running",
    Success => "success",
    Fail => "fail",
});

/// A `[start, end)` span of media time in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> crate::Result<Self> {
        if !(start.is_finite() && end.is_finite()) || start < 0.0 || end <= start {
            return Err(crate::Error::invalid_input(format!(
                "invalid time range {start}..{end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}-{:.3}", self.start, self.end)
    }
}

/// Probed properties of a source file, stored as JSON on the media row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub duration_secs: f64,
    pub frame_rate: f64,
    pub width: u32,
    pub height: u32,
    pub has_audio: bool,
    #[serde(default)]
    pub interlaced: bool,
    #[serde(default)]
    pub video_codec: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for s in ["pending", "running", "success", "fail"] {
            assert_eq!(s.parse::<EncodingStatus>().unwrap().as_str(), s);
        }
        assert!("done".parse::<EncodingStatus>().is_err());
    }

    #[test]
    fn status_classification() {
        assert!(EncodingStatus::Running.is_live());
        assert!(!EncodingStatus::Success.is_live());
        assert!(EncodingStatus::Fail.is_terminal());
        assert!(!EncodingStatus::Pending.is_terminal());
    }

    #[test]
    fn codec_container_mapping() {
        assert_eq!(Codec::H264.container(), Container::Mp4);
        assert_eq!(Codec::H265.container(), Container::Mp4);
        assert_eq!(Codec::H264Nvenc.container(), Container::Mp4);
        assert_eq!(Codec::Vp9.container(), Container::Webm);
        assert_eq!(Codec::Vp9.encoder(), "libvpx-vp9");
    }

    #[test]
    fn codec_parse() {
        assert_eq!("h264_nvenc".parse::<Codec>().unwrap(), Codec::H264Nvenc);
        assert!("av1".parse::<Codec>().is_err());
    }

    #[test]
    fn trim_action_serde() {
        let json = serde_json::to_string(&TrimAction::CreateSegments).unwrap();
        assert_eq!(json, "\"create_segments\"");
        assert_eq!(
            "save_new".parse::<TrimAction>().unwrap(),
            TrimAction::SaveNew
        );
    }

    #[test]
    fn media_info_tolerates_missing_optional_fields() {
        let info: MediaInfo = serde_json::from_str(
            r#"{"duration_secs":10.0,"frame_rate":25.0,"width":640,"height":480,"has_audio":true}"#,
        )
        .unwrap();
        assert!(!info.interlaced);
        assert!(info.video_codec.is_none());
    }

    #[test]
    fn time_range_validation() {
        assert!(TimeRange::new(1.0, 5.0).is_ok());
        assert!(TimeRange::new(5.0, 5.0).is_err());
        assert!(TimeRange::new(-1.0, 5.0).is_err());
        assert_eq!(TimeRange::new(2.0, 7.5).unwrap().duration(), 5.5);
    }
}
