//! The seam between orchestration and external media tools.
//!
//! Everything the engine asks of ffmpeg, ffprobe or mp4hls goes through
//! [`MediaTools`], so scenarios can run against a scripted implementation.

use async_trait::async_trait;
use reelforge_av::{
    actions, probe, tools, EncoderCommand, EncoderProcess, Progress, RunError, RunLog,
    ToolRegistry, Workspace,
};
use reelforge_common::{MediaInfo, TimeRange};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A running encoder invocation.
#[async_trait]
pub trait EncoderRun: Send {
    fn pid(&self) -> Option<u32>;

    /// Next progress sample, or `None` once the diagnostic stream closes.
    async fn next_progress(&mut self) -> Result<Option<Progress>, RunError>;

    /// Wait for exit and classify it.
    async fn finish(self: Box<Self>) -> Result<RunLog, RunError>;

    /// Force-terminate the process.
    async fn kill(&mut self);
}

#[async_trait]
impl EncoderRun for EncoderProcess {
    fn pid(&self) -> Option<u32> {
        EncoderProcess::pid(self)
    }

    async fn next_progress(&mut self) -> Result<Option<Progress>, RunError> {
        EncoderProcess::next_progress(self).await
    }

    async fn finish(self: Box<Self>) -> Result<RunLog, RunError> {
        EncoderProcess::finish(*self).await
    }

    async fn kill(&mut self) {
        EncoderProcess::kill(self).await
    }
}

#[async_trait]
pub trait MediaTools: Send + Sync {
    /// Path of the encoder binary, used as the program of built commands.
    fn ffmpeg(&self) -> reelforge_av::Result<PathBuf>;

    fn packager_available(&self) -> bool;

    async fn probe(&self, path: &Path) -> reelforge_av::Result<MediaInfo>;

    fn spawn_encoder(&self, cmd: &EncoderCommand) -> Result<Box<dyn EncoderRun>, RunError>;

    async fn segment(
        &self,
        input: &Path,
        out_dir: &Path,
        segment_secs: u64,
        timeout: Duration,
    ) -> reelforge_av::Result<Vec<PathBuf>>;

    async fn concat(
        &self,
        inputs: &[PathBuf],
        list_path: &Path,
        output: &Path,
        timeout: Duration,
    ) -> reelforge_av::Result<()>;

    async fn cut(
        &self,
        input: &Path,
        ranges: &[TimeRange],
        output: &Path,
        scratch: &Workspace,
        timeout: Duration,
    ) -> reelforge_av::Result<()>;

    async fn package(
        &self,
        inputs: &[PathBuf],
        output_dir: &Path,
        segment_duration: u32,
        timeout: Duration,
    ) -> reelforge_av::Result<PathBuf>;
}

/// [`MediaTools`] backed by the binaries found in a [`ToolRegistry`].
pub struct FfmpegTools {
    registry: ToolRegistry,
}

impl FfmpegTools {
    pub fn new(registry: ToolRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }
}

#[async_trait]
impl MediaTools for FfmpegTools {
    fn ffmpeg(&self) -> reelforge_av::Result<PathBuf> {
        self.registry.require(tools::FFMPEG).map(Path::to_path_buf)
    }

    fn packager_available(&self) -> bool {
        self.registry.is_available(tools::MP4HLS)
    }

    async fn probe(&self, path: &Path) -> reelforge_av::Result<MediaInfo> {
        let ffprobe = self.registry.require(tools::FFPROBE)?;
        probe::probe_with_ffprobe(ffprobe, path).await
    }

    fn spawn_encoder(&self, cmd: &EncoderCommand) -> Result<Box<dyn EncoderRun>, RunError> {
        Ok(Box::new(EncoderProcess::spawn(cmd)?))
    }

    async fn segment(
        &self,
        input: &Path,
        out_dir: &Path,
        segment_secs: u64,
        timeout: Duration,
    ) -> reelforge_av::Result<Vec<PathBuf>> {
        let ffmpeg = self.registry.require(tools::FFMPEG)?;
        actions::segment(ffmpeg, input, out_dir, segment_secs, timeout).await
    }

    async fn concat(
        &self,
        inputs: &[PathBuf],
        list_path: &Path,
        output: &Path,
        timeout: Duration,
    ) -> reelforge_av::Result<()> {
        let ffmpeg = self.registry.require(tools::FFMPEG)?;
        actions::concat(ffmpeg, inputs, list_path, output, timeout).await
    }

    async fn cut(
        &self,
        input: &Path,
        ranges: &[TimeRange],
        output: &Path,
        scratch: &Workspace,
        timeout: Duration,
    ) -> reelforge_av::Result<()> {
        let ffmpeg = self.registry.require(tools::FFMPEG)?;
        actions::cut(ffmpeg, input, ranges, output, scratch, timeout).await
    }

    async fn package(
        &self,
        inputs: &[PathBuf],
        output_dir: &Path,
        segment_duration: u32,
        timeout: Duration,
    ) -> reelforge_av::Result<PathBuf> {
        let mp4hls = self.registry.require(tools::MP4HLS)?;
        actions::package(mp4hls, inputs, output_dir, segment_duration, timeout).await
    }
}
