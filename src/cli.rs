use clap::{Parser, Subcommand};
use reelforge_common::{EncodingId, MediaId, ProfileId, TimeRange, TrimAction};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "reelforge")]
#[command(author, version, about = "Video transcoding orchestration engine")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the worker pool until interrupted
    Start {
        /// Number of parallel encodes (overrides config)
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Register a source file as a new media
    Import {
        /// Source video file
        #[arg(required = true)]
        source: PathBuf,

        /// Owner the renditions are filed under
        #[arg(long, default_value = "default")]
        owner: String,

        /// Stable identifier (random if omitted)
        #[arg(long)]
        uid: Option<String>,

        /// Display title (file name if omitted)
        #[arg(long)]
        title: Option<String>,

        /// Dispatch encodes for all active profiles right away
        #[arg(long)]
        encode: bool,
    },

    /// Dispatch encodes for a media
    Encode {
        media: MediaId,

        /// Restrict to these profiles (all active profiles by default)
        #[arg(short, long = "profile")]
        profiles: Vec<ProfileId>,

        /// Replace existing renditions
        #[arg(long)]
        force: bool,

        /// Never split the source into chunks
        #[arg(long)]
        no_chunking: bool,

        /// Run the queued jobs in this process before exiting
        #[arg(long)]
        wait: bool,
    },

    /// Keep only the given time ranges of a media
    Trim {
        media: MediaId,

        /// Range to keep as START-END in seconds, e.g. 12.5-30
        #[arg(short, long = "range", required = true, value_parser = parse_range)]
        ranges: Vec<TimeRange>,

        /// replace, save_new or create_segments
        #[arg(short, long, default_value = "replace")]
        action: TrimAction,

        /// Run the queued jobs in this process before exiting
        #[arg(long)]
        wait: bool,
    },

    /// Show media and job record status
    Status {
        /// Limit output to one media
        media: Option<MediaId>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// List encode profiles
    Profiles,

    /// Create the default profile ladder
    SeedProfiles,

    /// Cancel a pending or running job
    Cancel { encoding: EncodingId },

    /// Delete a media with all renditions and job records
    Delete { media: MediaId },

    /// Check that required external tools are available
    CheckTools,

    /// Validate configuration file
    Validate {
        /// Config file to validate (uses default if not specified)
        config: Option<PathBuf>,
    },

    /// Display version information
    Version,
}

/// Parse `START-END` into a [`TimeRange`].
pub fn parse_range(s: &str) -> Result<TimeRange, String> {
    let (start, end) = s
        .split_once('-')
        .ok_or_else(|| format!("expected START-END, got {s:?}"))?;
    let start: f64 = start
        .trim()
        .parse()
        .map_err(|e| format!("bad start {start:?}: {e}"))?;
    let end: f64 = end
        .trim()
        .parse()
        .map_err(|e| format!("bad end {end:?}: {e}"))?;
    TimeRange::new(start, end).map_err(|e| e.to_string())
}
