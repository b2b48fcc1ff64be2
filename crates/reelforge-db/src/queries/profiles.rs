//! Encode profile operations. Profiles are operator-managed and read-only
//! to the orchestrator.

use chrono::Utc;
use reelforge_common::{Codec, Error, ProfileId, Result};
use rusqlite::Connection;

use crate::models::EncodeProfile;

const COLS: &str = "id, name, codec, resolution, extension, active, created_at";

/// Canonical profile name, e.g. `h264-720`.
pub fn profile_name(codec: Codec, resolution: u32) -> String {
    format!("{}-{}", codec.as_str(), resolution)
}

/// Insert an active profile for `(codec, resolution)`.
pub fn insert_profile(conn: &Connection, codec: Codec, resolution: u32) -> Result<EncodeProfile> {
    let id = ProfileId::new();
    let now = Utc::now().to_rfc3339();
    let name = profile_name(codec, resolution);
    let extension = codec.container().extension();

    conn.execute(
        "INSERT INTO encode_profiles (id, name, codec, resolution, extension, active, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)",
        rusqlite::params![id.to_string(), name, codec.as_str(), resolution, extension, now],
    )
    .map_err(|e| Error::database(e.to_string()))?;

    Ok(EncodeProfile {
        id,
        name,
        codec,
        resolution,
        extension: extension.to_string(),
        active: true,
        created_at: now,
    })
}

/// Insert a profile unless one with the same name exists. Returns true if
/// inserted.
pub fn ensure_profile(conn: &Connection, codec: Codec, resolution: u32) -> Result<bool> {
    let now = Utc::now().to_rfc3339();
    let n = conn
        .execute(
            "INSERT OR IGNORE INTO encode_profiles
                (id, name, codec, resolution, extension, active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)",
            rusqlite::params![
                ProfileId::new().to_string(),
                profile_name(codec, resolution),
                codec.as_str(),
                resolution,
                codec.container().extension(),
                now
            ],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

pub fn get_profile(conn: &Connection, id: ProfileId) -> Result<Option<EncodeProfile>> {
    let q = format!("SELECT {COLS} FROM encode_profiles WHERE id = ?1");
    match conn.query_row(&q, [id.to_string()], EncodeProfile::from_row) {
        Ok(p) => Ok(Some(p)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(Error::database(e.to_string())),
    }
}

pub fn require_profile(conn: &Connection, id: ProfileId) -> Result<EncodeProfile> {
    get_profile(conn, id)?.ok_or_else(|| Error::not_found(format!("profile {id}")))
}

fn list_where(conn: &Connection, filter: &str) -> Result<Vec<EncodeProfile>> {
    let q = format!(
        "SELECT {COLS} FROM encode_profiles {filter} ORDER BY resolution ASC, codec ASC"
    );
    let mut stmt = conn.prepare(&q).map_err(|e| Error::database(e.to_string()))?;
    let rows = stmt
        .query_map([], EncodeProfile::from_row)
        .map_err(|e| Error::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(rows)
}

/// All profiles, lowest resolution first.
pub fn list_profiles(conn: &Connection) -> Result<Vec<EncodeProfile>> {
    list_where(conn, "")
}

/// Active profiles, lowest resolution first.
pub fn list_active_profiles(conn: &Connection) -> Result<Vec<EncodeProfile>> {
    list_where(conn, "WHERE active = 1")
}

pub fn set_active(conn: &Connection, id: ProfileId, active: bool) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE encode_profiles SET active = ?1 WHERE id = ?2",
            rusqlite::params![active, id.to_string()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}
