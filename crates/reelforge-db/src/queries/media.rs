//! Source media operations.

use chrono::Utc;
use reelforge_common::{EncodingStatus, Error, MediaId, MediaInfo, Result};
use rusqlite::Connection;

use crate::models::Media;

const COLS: &str = "id, uid, owner, title, source_path, duration_secs, height, media_info,
    encoding_status, manifest_path, created_at, updated_at";

/// Fields required to register a source file.
#[derive(Debug, Clone)]
pub struct NewMedia {
    pub uid: String,
    pub owner: String,
    pub title: String,
    pub source_path: String,
    pub media_info: MediaInfo,
}

/// Insert a new source media row.
pub fn insert_media(conn: &Connection, new: &NewMedia) -> Result<Media> {
    let id = MediaId::new();
    let now = Utc::now().to_rfc3339();
    let info = serde_json::to_string(&new.media_info)?;

    conn.execute(
        "INSERT INTO media (id, uid, owner, title, source_path, duration_secs, height,
            media_info, encoding_status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', ?9, ?9)",
        rusqlite::params![
            id.to_string(),
            new.uid,
            new.owner,
            new.title,
            new.source_path,
            new.media_info.duration_secs,
            new.media_info.height,
            info,
            now,
        ],
    )
    .map_err(|e| match e {
        rusqlite::Error::SqliteFailure(ref f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Error::conflict(format!("media uid {} already exists", new.uid))
        }
        other => Error::database(other.to_string()),
    })?;

    get_media(conn, id)?.ok_or_else(|| Error::internal("inserted media vanished"))
}

/// Get a media by ID.
pub fn get_media(conn: &Connection, id: MediaId) -> Result<Option<Media>> {
    let q = format!("SELECT {COLS} FROM media WHERE id = ?1");
    match conn.query_row(&q, [id.to_string()], Media::from_row) {
        Ok(m) => Ok(Some(m)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(Error::database(e.to_string())),
    }
}

/// Get a media by ID, failing with `NotFound` when absent.
pub fn require_media(conn: &Connection, id: MediaId) -> Result<Media> {
    get_media(conn, id)?.ok_or_else(|| Error::not_found(format!("media {id}")))
}

/// List all media, newest first.
pub fn list_media(conn: &Connection) -> Result<Vec<Media>> {
    let q = format!("SELECT {COLS} FROM media ORDER BY created_at DESC");
    let mut stmt = conn.prepare(&q).map_err(|e| Error::database(e.to_string()))?;
    let rows = stmt
        .query_map([], Media::from_row)
        .map_err(|e| Error::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(rows)
}

/// Replace the source file and probed properties, e.g. after a trim.
pub fn update_source(
    conn: &Connection,
    id: MediaId,
    source_path: &str,
    info: &MediaInfo,
) -> Result<bool> {
    let now = Utc::now().to_rfc3339();
    let json = serde_json::to_string(info)?;
    let n = conn
        .execute(
            "UPDATE media SET source_path = ?1, duration_secs = ?2, height = ?3,
                media_info = ?4, updated_at = ?5
             WHERE id = ?6",
            rusqlite::params![
                source_path,
                info.duration_secs,
                info.height,
                json,
                now,
                id.to_string()
            ],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Write the aggregate encoding status. Returns true only when the stored
/// value actually changed.
pub fn set_encoding_status(conn: &Connection, id: MediaId, status: EncodingStatus) -> Result<bool> {
    let now = Utc::now().to_rfc3339();
    let n = conn
        .execute(
            "UPDATE media SET encoding_status = ?1, updated_at = ?2
             WHERE id = ?3 AND encoding_status != ?1",
            rusqlite::params![status.as_str(), now, id.to_string()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Record the adaptive-streaming manifest path. Returns true only when the
/// stored value actually changed.
pub fn set_manifest_path(conn: &Connection, id: MediaId, path: Option<&str>) -> Result<bool> {
    let now = Utc::now().to_rfc3339();
    let n = conn
        .execute(
            "UPDATE media SET manifest_path = ?1, updated_at = ?2
             WHERE id = ?3 AND manifest_path IS NOT ?1",
            rusqlite::params![path, now, id.to_string()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Insert a copy of `source` under a new uid, pointing at `source_path`.
/// Job records are not copied.
pub fn clone_media(
    conn: &Connection,
    source: &Media,
    uid: &str,
    title: &str,
    source_path: &str,
) -> Result<Media> {
    insert_media(
        conn,
        &NewMedia {
            uid: uid.to_string(),
            owner: source.owner.clone(),
            title: title.to_string(),
            source_path: source_path.to_string(),
            media_info: source.media_info.clone(),
        },
    )
}

/// Delete a media row. Job records, chunk groups and trim requests cascade.
pub fn delete_media(conn: &Connection, id: MediaId) -> Result<bool> {
    let n = conn
        .execute("DELETE FROM media WHERE id = ?1", [id.to_string()])
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}
