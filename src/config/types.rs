use reelforge_av::{BuildSettings, ToolOverrides};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub encoding: EncodingConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub workers: WorkerConfig,

    #[serde(default)]
    pub tools: ToolOverrides,

    #[serde(default)]
    pub packaging: PackagingConfig,
}

impl Config {
    /// Settings handed to the command builder for every job.
    pub fn build_settings(&self) -> BuildSettings {
        BuildSettings {
            short_source_secs: self.encoding.short_source_secs,
            minimum_resolutions: self.encoding.minimum_resolutions.clone(),
        }
    }

    /// Directory holding per-job scratch workspaces.
    pub fn work_dir(&self) -> PathBuf {
        self.storage.temp_dir.join("work")
    }

    /// Directory holding source segments and chunk outputs.
    pub fn chunks_dir(&self) -> PathBuf {
        self.storage.temp_dir.join("chunks")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Root under which encoded renditions are stored.
    #[serde(default = "default_media_root")]
    pub media_root: PathBuf,

    /// Scratch space for segments, chunk outputs and in-flight encodes.
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    /// Root of the per-media adaptive-streaming directories.
    #[serde(default = "default_hls_dir")]
    pub hls_dir: PathBuf,

    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            media_root: default_media_root(),
            temp_dir: default_temp_dir(),
            hls_dir: default_hls_dir(),
            db_path: default_db_path(),
        }
    }
}

fn default_media_root() -> PathBuf {
    PathBuf::from("~/.local/share/reelforge/media")
}

fn default_temp_dir() -> PathBuf {
    std::env::temp_dir().join("reelforge")
}

fn default_hls_dir() -> PathBuf {
    PathBuf::from("~/.local/share/reelforge/hls")
}

fn default_db_path() -> PathBuf {
    PathBuf::from("~/.local/share/reelforge/reelforge.db")
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EncodingConfig {
    /// Sources longer than this many seconds are split into chunks.
    #[serde(default = "default_chunking_threshold")]
    pub chunking_threshold_secs: f64,

    /// Target length of each source segment.
    #[serde(default = "default_chunk_duration")]
    pub chunk_duration_secs: u64,

    /// Sources shorter than this use CRF instead of two-pass.
    #[serde(default = "default_short_source")]
    pub short_source_secs: f64,

    /// Number of automatic retries for transient failures.
    #[serde(default = "default_retry_ceiling")]
    pub retry_ceiling: u32,

    /// Resolutions always produced, even when they upscale the source.
    #[serde(default = "default_minimum_resolutions")]
    pub minimum_resolutions: Vec<u32>,

    #[serde(default = "default_true")]
    pub allow_chunking: bool,

    /// Scratch directories older than this are removed by the orphan sweep.
    #[serde(default = "default_orphan_max_age")]
    pub orphan_max_age_secs: u64,
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            chunking_threshold_secs: default_chunking_threshold(),
            chunk_duration_secs: default_chunk_duration(),
            short_source_secs: default_short_source(),
            retry_ceiling: default_retry_ceiling(),
            minimum_resolutions: default_minimum_resolutions(),
            allow_chunking: true,
            orphan_max_age_secs: default_orphan_max_age(),
        }
    }
}

fn default_chunking_threshold() -> f64 {
    300.0
}

fn default_chunk_duration() -> u64 {
    240
}

fn default_short_source() -> f64 {
    2.0
}

fn default_retry_ceiling() -> u32 {
    3
}

fn default_minimum_resolutions() -> Vec<u32> {
    vec![240, 360]
}

fn default_orphan_max_age() -> u64 {
    2 * 24 * 60 * 60
}

fn default_true() -> bool {
    true
}

/// Wall-clock budgets for each class of external tool invocation, in seconds.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_encode_timeout")]
    pub encode_secs: u64,

    #[serde(default = "default_chunk_timeout")]
    pub chunk_secs: u64,

    #[serde(default = "default_tool_timeout")]
    pub segment_secs: u64,

    #[serde(default = "default_tool_timeout")]
    pub concat_secs: u64,

    #[serde(default = "default_tool_timeout")]
    pub package_secs: u64,

    #[serde(default = "default_tool_timeout")]
    pub cut_secs: u64,
}

impl TimeoutConfig {
    pub fn encode(&self) -> Duration {
        Duration::from_secs(self.encode_secs)
    }

    pub fn chunk(&self) -> Duration {
        Duration::from_secs(self.chunk_secs)
    }

    pub fn segment(&self) -> Duration {
        Duration::from_secs(self.segment_secs)
    }

    pub fn concat(&self) -> Duration {
        Duration::from_secs(self.concat_secs)
    }

    pub fn package(&self) -> Duration {
        Duration::from_secs(self.package_secs)
    }

    pub fn cut(&self) -> Duration {
        Duration::from_secs(self.cut_secs)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            encode_secs: default_encode_timeout(),
            chunk_secs: default_chunk_timeout(),
            segment_secs: default_tool_timeout(),
            concat_secs: default_tool_timeout(),
            package_secs: default_tool_timeout(),
            cut_secs: default_tool_timeout(),
        }
    }
}

fn default_encode_timeout() -> u64 {
    12 * 60 * 60
}

fn default_chunk_timeout() -> u64 {
    2 * 60 * 60
}

fn default_tool_timeout() -> u64 {
    60 * 60
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    /// Number of encodes run in parallel.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// How often the daemon re-scans for pending jobs that never reached the queue.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

fn default_concurrency() -> usize {
    2
}

fn default_poll_interval() -> u64 {
    30_000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PackagingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_segment_duration")]
    pub segment_duration_secs: u32,
}

impl Default for PackagingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            segment_duration_secs: default_segment_duration(),
        }
    }
}

fn default_segment_duration() -> u32 {
    4
}
