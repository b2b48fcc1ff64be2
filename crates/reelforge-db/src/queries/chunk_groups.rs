//! Chunk group records and once-only group finalization.

use chrono::Utc;
use reelforge_common::{EncodingId, EncodingStatus, Error, MediaId, ProfileId, Result};
use rusqlite::Connection;

use crate::models::{ChunkGroup, CHUNK_GROUP_FORMAT_VERSION};

const COLS: &str = "key, media_id, format_version, segments, created_at";

/// Record the ordered segment list for a new group. The row is immutable
/// afterwards.
pub fn insert_group(
    conn: &Connection,
    key: &str,
    media_id: MediaId,
    segments: &[String],
) -> Result<ChunkGroup> {
    if segments.is_empty() {
        return Err(Error::invalid_input("chunk group needs at least one segment"));
    }
    let now = Utc::now().to_rfc3339();
    let json = serde_json::to_string(segments)?;
    conn.execute(
        "INSERT INTO chunk_groups (key, media_id, format_version, segments, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![key, media_id.to_string(), CHUNK_GROUP_FORMAT_VERSION, json, now],
    )
    .map_err(|e| Error::database(e.to_string()))?;

    Ok(ChunkGroup {
        key: key.to_string(),
        media_id,
        format_version: CHUNK_GROUP_FORMAT_VERSION,
        segments: segments.to_vec(),
        created_at: now,
    })
}

pub fn get_group(conn: &Connection, key: &str) -> Result<Option<ChunkGroup>> {
    let q = format!("SELECT {COLS} FROM chunk_groups WHERE key = ?1");
    match conn.query_row(&q, [key], ChunkGroup::from_row) {
        Ok(g) => Ok(Some(g)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(Error::database(e.to_string())),
    }
}

pub fn list_groups(conn: &Connection) -> Result<Vec<ChunkGroup>> {
    let q = format!("SELECT {COLS} FROM chunk_groups ORDER BY created_at ASC");
    let mut stmt = conn.prepare(&q).map_err(|e| Error::database(e.to_string()))?;
    let rows = stmt
        .query_map([], ChunkGroup::from_row)
        .map_err(|e| Error::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(rows)
}

pub fn list_groups_for_media(conn: &Connection, media_id: MediaId) -> Result<Vec<ChunkGroup>> {
    let q = format!("SELECT {COLS} FROM chunk_groups WHERE media_id = ?1 ORDER BY created_at ASC");
    let mut stmt = conn.prepare(&q).map_err(|e| Error::database(e.to_string()))?;
    let rows = stmt
        .query_map([media_id.to_string()], ChunkGroup::from_row)
        .map_err(|e| Error::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(rows)
}

/// Claim the right to finalize `(group, profile)`.
///
/// A single conditional insert: exactly one caller ever sees `true`, no
/// matter how many chunks complete concurrently.
pub fn claim_finalization(
    conn: &Connection,
    group_key: &str,
    profile_id: ProfileId,
    encoding_id: EncodingId,
    outcome: EncodingStatus,
) -> Result<bool> {
    let now = Utc::now().to_rfc3339();
    let n = conn
        .execute(
            "INSERT OR IGNORE INTO chunk_group_finalizations
                (group_key, profile_id, encoding_id, outcome, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                group_key,
                profile_id.to_string(),
                encoding_id.to_string(),
                outcome.as_str(),
                now
            ],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

pub fn is_finalized(conn: &Connection, group_key: &str, profile_id: ProfileId) -> Result<bool> {
    conn.query_row(
        "SELECT COUNT(*) > 0 FROM chunk_group_finalizations
         WHERE group_key = ?1 AND profile_id = ?2",
        rusqlite::params![group_key, profile_id.to_string()],
        |row| row.get(0),
    )
    .map_err(|e| Error::database(e.to_string()))
}

/// Delete a group row once no chunk records reference it.
pub fn delete_group(conn: &Connection, key: &str) -> Result<bool> {
    let n = conn
        .execute("DELETE FROM chunk_groups WHERE key = ?1", [key])
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}
