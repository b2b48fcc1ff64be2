//! Row models for every persisted entity.

use reelforge_common::{
    Codec, EncodingId, EncodingStatus, MediaId, MediaInfo, ProfileId, TimeRange, TrimAction,
    TrimRequestId, TrimStatus,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

fn conversion_err<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

#[derive(Debug)]
struct BadValue(String);

impl std::fmt::Display for BadValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for BadValue {}

/// Parse a UUID-based ID from a text column.
fn parse_id<T: From<Uuid>>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    let uuid = Uuid::parse_str(&s).map_err(|e| conversion_err(idx, e))?;
    Ok(T::from(uuid))
}

fn parse_opt_id<T: From<Uuid>>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<T>> {
    let s: Option<String> = row.get(idx)?;
    match s {
        Some(v) => {
            let uuid = Uuid::parse_str(&v).map_err(|e| conversion_err(idx, e))?;
            Ok(Some(T::from(uuid)))
        }
        None => Ok(None),
    }
}

/// Parse a string-backed enum column.
fn parse_enum<T: FromStr<Err = String>>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    s.parse().map_err(|e| conversion_err(idx, BadValue(e)))
}

fn parse_json<T: serde::de::DeserializeOwned>(
    row: &rusqlite::Row,
    idx: usize,
) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    serde_json::from_str(&s).map_err(|e| conversion_err(idx, e))
}

// ---------------------------------------------------------------------------
// Media
// ---------------------------------------------------------------------------

/// A source media file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Media {
    pub id: MediaId,
    /// Short unique token used in output file names and the HLS directory.
    pub uid: String,
    pub owner: String,
    pub title: String,
    pub source_path: String,
    pub duration_secs: f64,
    pub height: u32,
    pub media_info: MediaInfo,
    pub encoding_status: EncodingStatus,
    pub manifest_path: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Media {
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: parse_id(row, 0)?,
            uid: row.get(1)?,
            owner: row.get(2)?,
            title: row.get(3)?,
            source_path: row.get(4)?,
            duration_secs: row.get(5)?,
            height: row.get(6)?,
            media_info: parse_json(row, 7)?,
            encoding_status: parse_enum(row, 8)?,
            manifest_path: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }
}

// ---------------------------------------------------------------------------
// EncodeProfile
// ---------------------------------------------------------------------------

/// Target codec, resolution and container for one rendition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodeProfile {
    pub id: ProfileId,
    pub name: String,
    pub codec: Codec,
    /// Target height in pixels.
    pub resolution: u32,
    pub extension: String,
    pub active: bool,
    pub created_at: String,
}

impl EncodeProfile {
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: parse_id(row, 0)?,
            name: row.get(1)?,
            codec: parse_enum(row, 2)?,
            resolution: row.get(3)?,
            extension: row.get(4)?,
            active: row.get(5)?,
            created_at: row.get(6)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// A job record: one rendition of one source, or one chunk of one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Encoding {
    pub id: EncodingId,
    pub media_id: MediaId,
    pub profile_id: ProfileId,
    pub status: EncodingStatus,
    pub progress: f64,
    pub chunk: bool,
    pub chunk_group_key: Option<String>,
    pub chunk_source_path: Option<String>,
    pub retries: u32,
    pub total_run_time_secs: f64,
    pub output_path: Option<String>,
    pub logs: String,
    pub commands: String,
    pub priority: i32,
    pub pid: Option<u32>,
    pub created_at: String,
    pub updated_at: String,
    pub started_at: Option<String>,
}

impl Encoding {
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: parse_id(row, 0)?,
            media_id: parse_id(row, 1)?,
            profile_id: parse_id(row, 2)?,
            status: parse_enum(row, 3)?,
            progress: row.get(4)?,
            chunk: row.get(5)?,
            chunk_group_key: row.get(6)?,
            chunk_source_path: row.get(7)?,
            retries: row.get(8)?,
            total_run_time_secs: row.get(9)?,
            output_path: row.get(10)?,
            logs: row.get(11)?,
            commands: row.get(12)?,
            priority: row.get(13)?,
            pid: row.get(14)?,
            created_at: row.get(15)?,
            updated_at: row.get(16)?,
            started_at: row.get(17)?,
        })
    }

    /// True when the record has a usable output file.
    pub fn has_output(&self) -> bool {
        self.status == EncodingStatus::Success
            && self.output_path.as_deref().is_some_and(|p| !p.is_empty())
    }
}

// ---------------------------------------------------------------------------
// ChunkGroup
// ---------------------------------------------------------------------------

/// Current layout version of [`ChunkGroup::segments`].
pub const CHUNK_GROUP_FORMAT_VERSION: u32 = 1;

/// The ordered, immutable list of segment paths cut from one source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkGroup {
    pub key: String,
    pub media_id: MediaId,
    pub format_version: u32,
    pub segments: Vec<String>,
    pub created_at: String,
}

impl ChunkGroup {
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            key: row.get(0)?,
            media_id: parse_id(row, 1)?,
            format_version: row.get(2)?,
            segments: parse_json(row, 3)?,
            created_at: row.get(4)?,
        })
    }
}

// ---------------------------------------------------------------------------
// TrimRequest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrimRequest {
    pub id: TrimRequestId,
    pub media_id: MediaId,
    /// The media actually being cut: the source itself for `replace`,
    /// a clone otherwise.
    pub target_media_id: Option<MediaId>,
    pub parent_id: Option<TrimRequestId>,
    pub action: TrimAction,
    pub ranges: Vec<TimeRange>,
    pub status: TrimStatus,
    pub created_at: String,
    pub updated_at: String,
}

impl TrimRequest {
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: parse_id(row, 0)?,
            media_id: parse_id(row, 1)?,
            target_media_id: parse_opt_id(row, 2)?,
            parent_id: parse_opt_id(row, 3)?,
            action: parse_enum(row, 4)?,
            ranges: parse_json(row, 5)?,
            status: parse_enum(row, 6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }
}
