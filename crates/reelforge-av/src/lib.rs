//! # reelforge-av
//!
//! Everything that touches an external media tool.
//!
//! - **Tool discovery** ([`ToolRegistry`]): locate ffmpeg, ffprobe and mp4hls.
//! - **Command building** ([`builder`]): the pure function turning a
//!   (source, resolution, codec, pass) tuple into exact encoder invocations.
//! - **Progress streaming** ([`runner`]): spawn one encoder command, stream
//!   timecode progress from its diagnostic output, classify the exit.
//! - **One-shot execution** ([`ToolCommand`]): async builder with timeout for
//!   short tool invocations.
//! - **Probing** ([`probe`]): ffprobe JSON into [`reelforge_common::MediaInfo`].
//! - **Actions** ([`actions`]): lossless segment, concat and cut, and
//!   adaptive-streaming packaging.
//! - **Workspaces** ([`Workspace`]): scratch directories with atomic finalize.

pub mod actions;
pub mod builder;
pub mod command;
pub mod error;
pub mod probe;
pub mod runner;
pub mod tools;
pub mod workspace;

pub use builder::{build_commands, BuildError, BuildRequest, BuildSettings, EncoderCommand};
pub use command::{ToolCommand, ToolOutput};
pub use error::{Error, Result};
pub use runner::{EncoderProcess, Progress, RunError, RunLog};
pub use tools::{ToolInfo, ToolOverrides, ToolRegistry};
pub use workspace::Workspace;
