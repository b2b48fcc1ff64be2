//! Job record operations.
//!
//! Every status transition is a conditional write: the row is only touched
//! when its current status is one the caller expects, and the caller learns
//! whether the write applied.

use chrono::Utc;
use reelforge_common::{EncodingId, EncodingStatus, Error, MediaId, ProfileId, Result};
use rusqlite::Connection;

use crate::models::Encoding;

const COLS: &str = "id, media_id, profile_id, status, progress, chunk, chunk_group_key,
    chunk_source_path, retries, total_run_time_secs, output_path, logs, commands,
    priority, pid, created_at, updated_at, started_at";

/// Statuses that block a new non-forced record for the same pair.
const OCCUPIED: &str = "('pending', 'running', 'success')";

/// Fields for a new pending job record.
#[derive(Debug, Clone)]
pub struct NewEncoding {
    pub media_id: MediaId,
    pub profile_id: ProfileId,
    pub chunk: bool,
    pub chunk_group_key: Option<String>,
    pub chunk_source_path: Option<String>,
    pub retries: u32,
    pub priority: i32,
}

/// Result of [`create_encoding`].
#[derive(Debug)]
pub enum CreateOutcome {
    /// The record was inserted. `superseded` holds older non-chunk records
    /// for the same pair that were deleted to make room; their processes
    /// and files are the caller's to clean up.
    Created {
        encoding: Encoding,
        superseded: Vec<Encoding>,
    },
    /// A live or successful record already covers the pair; nothing written.
    Duplicate { existing: EncodingId },
}

/// A terminal non-chunk record produced by folding a chunk group, or by
/// copying a rendition onto a cloned media.
#[derive(Debug, Clone)]
pub struct FinalEncoding {
    pub media_id: MediaId,
    pub profile_id: ProfileId,
    pub status: EncodingStatus,
    pub output_path: Option<String>,
    pub logs: String,
    pub total_run_time_secs: f64,
    pub chunk_group_key: Option<String>,
}

fn collect(stmt: &mut rusqlite::Statement<'_>, params: impl rusqlite::Params) -> Result<Vec<Encoding>> {
    stmt.query_map(params, Encoding::from_row)
        .map_err(|e| Error::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))
}

fn delete_non_chunk_for_pair(
    conn: &Connection,
    media_id: MediaId,
    profile_id: ProfileId,
) -> Result<Vec<Encoding>> {
    let q = format!(
        "DELETE FROM encodings WHERE media_id = ?1 AND profile_id = ?2 AND chunk = 0
         RETURNING {COLS}"
    );
    let mut stmt = conn.prepare(&q).map_err(|e| Error::database(e.to_string()))?;
    collect(&mut stmt, rusqlite::params![media_id.to_string(), profile_id.to_string()])
}

/// Create a pending job record.
///
/// Without `force`, the insert is dropped when a pending, running or
/// successful record already exists for the same pair (or, for chunks, the
/// same pair, group and segment). A non-chunk insert supersedes every
/// older non-chunk record for its pair.
pub fn create_encoding(conn: &Connection, new: &NewEncoding, force: bool) -> Result<CreateOutcome> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| Error::database(e.to_string()))?;

    if !force {
        let existing = if new.chunk {
            tx.query_row(
                &format!(
                    "SELECT id FROM encodings
                     WHERE media_id = ?1 AND profile_id = ?2 AND chunk = 1
                       AND chunk_group_key IS ?3 AND chunk_source_path IS ?4
                       AND status IN {OCCUPIED} LIMIT 1"
                ),
                rusqlite::params![
                    new.media_id.to_string(),
                    new.profile_id.to_string(),
                    new.chunk_group_key,
                    new.chunk_source_path
                ],
                |row| row.get::<_, String>(0),
            )
        } else {
            tx.query_row(
                &format!(
                    "SELECT id FROM encodings
                     WHERE media_id = ?1 AND profile_id = ?2 AND chunk = 0
                       AND status IN {OCCUPIED} LIMIT 1"
                ),
                rusqlite::params![new.media_id.to_string(), new.profile_id.to_string()],
                |row| row.get::<_, String>(0),
            )
        };

        match existing {
            Ok(id) => {
                let existing = id
                    .parse::<EncodingId>()
                    .map_err(|e| Error::database(e.to_string()))?;
                return Ok(CreateOutcome::Duplicate { existing });
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => {}
            Err(e) => return Err(Error::database(e.to_string())),
        }
    }

    let superseded = if new.chunk {
        Vec::new()
    } else {
        delete_non_chunk_for_pair(&tx, new.media_id, new.profile_id)?
    };

    let id = EncodingId::new();
    let now = Utc::now().to_rfc3339();
    tx.execute(
        "INSERT INTO encodings (id, media_id, profile_id, status, chunk, chunk_group_key,
            chunk_source_path, retries, priority, created_at, updated_at)
         VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
        rusqlite::params![
            id.to_string(),
            new.media_id.to_string(),
            new.profile_id.to_string(),
            new.chunk,
            new.chunk_group_key,
            new.chunk_source_path,
            new.retries,
            new.priority,
            now
        ],
    )
    .map_err(|e| Error::database(e.to_string()))?;

    let encoding = tx
        .query_row(
            &format!("SELECT {COLS} FROM encodings WHERE id = ?1"),
            [id.to_string()],
            Encoding::from_row,
        )
        .map_err(|e| Error::database(e.to_string()))?;

    tx.commit().map_err(|e| Error::database(e.to_string()))?;

    Ok(CreateOutcome::Created {
        encoding,
        superseded,
    })
}

/// Insert a terminal non-chunk record, superseding older non-chunk records
/// for the pair. Returns the new record and the superseded ones.
///
/// Does not open its own transaction so it can run inside the caller's.
pub fn insert_final(conn: &Connection, fin: &FinalEncoding) -> Result<(Encoding, Vec<Encoding>)> {
    if !fin.status.is_terminal() {
        return Err(Error::invalid_input(format!(
            "final record must be terminal, got {}",
            fin.status
        )));
    }

    let superseded = delete_non_chunk_for_pair(conn, fin.media_id, fin.profile_id)?;

    let id = EncodingId::new();
    let now = Utc::now().to_rfc3339();
    let progress = if fin.status == EncodingStatus::Success { 100.0 } else { 0.0 };
    let q = format!(
        "INSERT INTO encodings (id, media_id, profile_id, status, progress, chunk,
            chunk_group_key, total_run_time_secs, output_path, logs, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?7, ?8, ?9, ?10, ?10)
         RETURNING {COLS}"
    );
    let encoding = conn
        .query_row(
            &q,
            rusqlite::params![
                id.to_string(),
                fin.media_id.to_string(),
                fin.profile_id.to_string(),
                fin.status.as_str(),
                progress,
                fin.chunk_group_key,
                fin.total_run_time_secs,
                fin.output_path,
                fin.logs,
                now
            ],
            Encoding::from_row,
        )
        .map_err(|e| Error::database(e.to_string()))?;

    Ok((encoding, superseded))
}

pub fn get_encoding(conn: &Connection, id: EncodingId) -> Result<Option<Encoding>> {
    let q = format!("SELECT {COLS} FROM encodings WHERE id = ?1");
    match conn.query_row(&q, [id.to_string()], Encoding::from_row) {
        Ok(e) => Ok(Some(e)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(Error::database(e.to_string())),
    }
}

/// Transition `pending -> running`. Returns false if another worker got
/// there first or the record is gone.
pub fn mark_running(conn: &Connection, id: EncodingId) -> Result<bool> {
    let now = Utc::now().to_rfc3339();
    let n = conn
        .execute(
            "UPDATE encodings SET status = 'running', progress = 0, started_at = ?1, updated_at = ?1
             WHERE id = ?2 AND status = 'pending'",
            rusqlite::params![now, id.to_string()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

pub fn set_pid(conn: &Connection, id: EncodingId, pid: Option<u32>) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE encodings SET pid = ?1 WHERE id = ?2",
            rusqlite::params![pid, id.to_string()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

pub fn set_commands(conn: &Connection, id: EncodingId, commands: &str) -> Result<bool> {
    let n = conn
        .execute(
            "UPDATE encodings SET commands = ?1 WHERE id = ?2",
            rusqlite::params![commands, id.to_string()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Record progress in percent. Only applies while running.
pub fn update_progress(conn: &Connection, id: EncodingId, progress: f64) -> Result<bool> {
    let now = Utc::now().to_rfc3339();
    let n = conn
        .execute(
            "UPDATE encodings SET progress = ?1, updated_at = ?2
             WHERE id = ?3 AND status = 'running'",
            rusqlite::params![progress.clamp(0.0, 100.0), now, id.to_string()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Transition a live record to `success`.
pub fn complete_success(
    conn: &Connection,
    id: EncodingId,
    output_path: &str,
    logs: &str,
    run_time_secs: f64,
) -> Result<bool> {
    let now = Utc::now().to_rfc3339();
    let n = conn
        .execute(
            "UPDATE encodings SET status = 'success', progress = 100, output_path = ?1,
                logs = ?2, total_run_time_secs = ?3, pid = NULL, updated_at = ?4
             WHERE id = ?5 AND status IN ('pending', 'running')",
            rusqlite::params![output_path, logs, run_time_secs, now, id.to_string()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Transition a live record to `fail`. Clears any output path.
pub fn complete_fail(
    conn: &Connection,
    id: EncodingId,
    logs: &str,
    run_time_secs: f64,
) -> Result<bool> {
    let now = Utc::now().to_rfc3339();
    let n = conn
        .execute(
            "UPDATE encodings SET status = 'fail', output_path = NULL, logs = ?1,
                total_run_time_secs = ?2, pid = NULL, updated_at = ?3
             WHERE id = ?4 AND status IN ('pending', 'running')",
            rusqlite::params![logs, run_time_secs, now, id.to_string()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Delete one record, returning it if it existed.
pub fn delete_encoding(conn: &Connection, id: EncodingId) -> Result<Option<Encoding>> {
    let q = format!("DELETE FROM encodings WHERE id = ?1 RETURNING {COLS}");
    match conn.query_row(&q, [id.to_string()], Encoding::from_row) {
        Ok(e) => Ok(Some(e)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(Error::database(e.to_string())),
    }
}

/// Delete every record, chunk or not, for a pair.
pub fn delete_for_pair(
    conn: &Connection,
    media_id: MediaId,
    profile_id: ProfileId,
) -> Result<Vec<Encoding>> {
    let q = format!(
        "DELETE FROM encodings WHERE media_id = ?1 AND profile_id = ?2 RETURNING {COLS}"
    );
    let mut stmt = conn.prepare(&q).map_err(|e| Error::database(e.to_string()))?;
    collect(&mut stmt, rusqlite::params![media_id.to_string(), profile_id.to_string()])
}

/// Delete every pending or running record of a media.
pub fn delete_live_for_media(conn: &Connection, media_id: MediaId) -> Result<Vec<Encoding>> {
    let q = format!(
        "DELETE FROM encodings WHERE media_id = ?1 AND status IN ('pending', 'running')
         RETURNING {COLS}"
    );
    let mut stmt = conn.prepare(&q).map_err(|e| Error::database(e.to_string()))?;
    collect(&mut stmt, [media_id.to_string()])
}

/// Delete every chunk record of a group for one profile.
pub fn delete_group_chunks(
    conn: &Connection,
    group_key: &str,
    profile_id: ProfileId,
) -> Result<Vec<Encoding>> {
    let q = format!(
        "DELETE FROM encodings WHERE chunk = 1 AND chunk_group_key = ?1 AND profile_id = ?2
         RETURNING {COLS}"
    );
    let mut stmt = conn.prepare(&q).map_err(|e| Error::database(e.to_string()))?;
    collect(&mut stmt, rusqlite::params![group_key, profile_id.to_string()])
}

/// All records of a media, oldest first.
pub fn list_for_media(conn: &Connection, media_id: MediaId) -> Result<Vec<Encoding>> {
    let q = format!("SELECT {COLS} FROM encodings WHERE media_id = ?1 ORDER BY created_at ASC");
    let mut stmt = conn.prepare(&q).map_err(|e| Error::database(e.to_string()))?;
    collect(&mut stmt, [media_id.to_string()])
}

/// Non-chunk records of a media.
pub fn list_renditions(conn: &Connection, media_id: MediaId) -> Result<Vec<Encoding>> {
    let q = format!(
        "SELECT {COLS} FROM encodings WHERE media_id = ?1 AND chunk = 0 ORDER BY created_at ASC"
    );
    let mut stmt = conn.prepare(&q).map_err(|e| Error::database(e.to_string()))?;
    collect(&mut stmt, [media_id.to_string()])
}

/// Chunk records of one group for one profile.
pub fn list_group(conn: &Connection, group_key: &str, profile_id: ProfileId) -> Result<Vec<Encoding>> {
    let q = format!(
        "SELECT {COLS} FROM encodings
         WHERE chunk = 1 AND chunk_group_key = ?1 AND profile_id = ?2
         ORDER BY created_at ASC"
    );
    let mut stmt = conn.prepare(&q).map_err(|e| Error::database(e.to_string()))?;
    collect(&mut stmt, rusqlite::params![group_key, profile_id.to_string()])
}

/// Count chunk records still referencing a group across all profiles.
pub fn count_group_chunks(conn: &Connection, group_key: &str) -> Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM encodings WHERE chunk = 1 AND chunk_group_key = ?1",
        [group_key],
        |row| row.get(0),
    )
    .map_err(|e| Error::database(e.to_string()))
}

/// Records in a given status, highest priority then oldest first.
pub fn list_by_status(conn: &Connection, status: EncodingStatus) -> Result<Vec<Encoding>> {
    let q = format!(
        "SELECT {COLS} FROM encodings WHERE status = ?1 ORDER BY priority DESC, created_at ASC"
    );
    let mut stmt = conn.prepare(&q).map_err(|e| Error::database(e.to_string()))?;
    collect(&mut stmt, [status.as_str()])
}

/// Any pending, running or successful record for a pair, chunk or not.
pub fn find_occupying(
    conn: &Connection,
    media_id: MediaId,
    profile_id: ProfileId,
) -> Result<Option<Encoding>> {
    let q = format!(
        "SELECT {COLS} FROM encodings
         WHERE media_id = ?1 AND profile_id = ?2 AND status IN {OCCUPIED}
         ORDER BY chunk ASC LIMIT 1"
    );
    match conn.query_row(
        &q,
        rusqlite::params![media_id.to_string(), profile_id.to_string()],
        Encoding::from_row,
    ) {
        Ok(e) => Ok(Some(e)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(Error::database(e.to_string())),
    }
}

/// Record counts per status across all media.
pub fn count_by_status(conn: &Connection) -> Result<Vec<(String, i64)>> {
    let mut stmt = conn
        .prepare("SELECT status, COUNT(*) FROM encodings GROUP BY status ORDER BY status")
        .map_err(|e| Error::database(e.to_string()))?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .map_err(|e| Error::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(rows)
}
