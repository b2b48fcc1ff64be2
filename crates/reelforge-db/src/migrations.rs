//! Embedded SQL migrations and runner.
//!
//! Migrations are stored as `&str` constants and executed in order. A
//! `schema_migrations` table tracks which versions have been applied.

use reelforge_common::{Error, Result};
use rusqlite::Connection;

/// V1: source media, encode profiles and job records.
const V1_INITIAL: &str = r#"
CREATE TABLE media (
    id              TEXT PRIMARY KEY,
    uid             TEXT UNIQUE NOT NULL,
    owner           TEXT NOT NULL,
    title           TEXT NOT NULL,
    source_path     TEXT NOT NULL,
    duration_secs   REAL NOT NULL DEFAULT 0,
    height          INTEGER NOT NULL DEFAULT 0,
    media_info      TEXT NOT NULL DEFAULT '{}',
    encoding_status TEXT NOT NULL DEFAULT 'pending',
    manifest_path   TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE TABLE encode_profiles (
    id         TEXT PRIMARY KEY,
    name       TEXT UNIQUE NOT NULL,
    codec      TEXT NOT NULL,
    resolution INTEGER NOT NULL,
    extension  TEXT NOT NULL,
    active     INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);

CREATE TABLE encodings (
    id                  TEXT PRIMARY KEY,
    media_id            TEXT NOT NULL REFERENCES media(id) ON DELETE CASCADE,
    profile_id          TEXT NOT NULL REFERENCES encode_profiles(id),
    status              TEXT NOT NULL DEFAULT 'pending',
    progress            REAL NOT NULL DEFAULT 0,
    chunk               INTEGER NOT NULL DEFAULT 0,
    chunk_group_key     TEXT,
    chunk_source_path   TEXT,
    retries             INTEGER NOT NULL DEFAULT 0,
    total_run_time_secs REAL NOT NULL DEFAULT 0,
    output_path         TEXT,
    logs                TEXT NOT NULL DEFAULT '',
    commands            TEXT NOT NULL DEFAULT '',
    priority            INTEGER NOT NULL DEFAULT 0,
    pid                 INTEGER,
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL,
    started_at          TEXT
);
CREATE INDEX idx_encodings_pair ON encodings(media_id, profile_id);
CREATE INDEX idx_encodings_group ON encodings(chunk_group_key);
CREATE INDEX idx_encodings_status ON encodings(status, priority);
"#;

/// V2: chunk groups. The segment list is written once and never updated.
const V2_CHUNK_GROUPS: &str = r#"
CREATE TABLE chunk_groups (
    key            TEXT PRIMARY KEY,
    media_id       TEXT NOT NULL REFERENCES media(id) ON DELETE CASCADE,
    format_version INTEGER NOT NULL,
    segments       TEXT NOT NULL,
    created_at     TEXT NOT NULL
);

CREATE TRIGGER chunk_groups_immutable BEFORE UPDATE ON chunk_groups
BEGIN
    SELECT RAISE(ABORT, 'chunk groups are immutable');
END;

CREATE TABLE chunk_group_finalizations (
    group_key   TEXT NOT NULL REFERENCES chunk_groups(key) ON DELETE CASCADE,
    profile_id  TEXT NOT NULL,
    encoding_id TEXT NOT NULL,
    outcome     TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    PRIMARY KEY (group_key, profile_id)
);
"#;

/// V3: trim requests.
const V3_TRIM_REQUESTS: &str = r#"
CREATE TABLE trim_requests (
    id              TEXT PRIMARY KEY,
    media_id        TEXT NOT NULL REFERENCES media(id) ON DELETE CASCADE,
    target_media_id TEXT REFERENCES media(id) ON DELETE SET NULL,
    parent_id       TEXT REFERENCES trim_requests(id) ON DELETE CASCADE,
    action          TEXT NOT NULL,
    ranges          TEXT NOT NULL,
    status          TEXT NOT NULL DEFAULT 'initial',
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);
CREATE INDEX idx_trim_requests_target ON trim_requests(target_media_id, status);
"#;

/// Ordered list of (version, sql) pairs.
const MIGRATIONS: &[(i64, &str)] = &[
    (1, V1_INITIAL),
    (2, V2_CHUNK_GROUPS),
    (3, V3_TRIM_REQUESTS),
];

/// Run all pending migrations on `conn`.
///
/// Creates the `schema_migrations` tracking table if it does not exist,
/// then applies each outstanding migration inside a transaction.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version    INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )
    .map_err(|e| Error::database(format!("Failed to create schema_migrations: {e}")))?;

    for &(version, sql) in MIGRATIONS {
        let already: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM schema_migrations WHERE version = ?1",
                [version],
                |row| row.get(0),
            )
            .map_err(|e| Error::database(e.to_string()))?;

        if already {
            continue;
        }

        let tx = conn
            .unchecked_transaction()
            .map_err(|e| Error::database(e.to_string()))?;

        tx.execute_batch(sql)
            .map_err(|e| Error::database(format!("Migration V{version} failed: {e}")))?;

        tx.execute(
            "INSERT INTO schema_migrations (version) VALUES (?1)",
            [version],
        )
        .map_err(|e| Error::database(e.to_string()))?;

        tx.commit().map_err(|e| Error::database(e.to_string()))?;
    }

    Ok(())
}

/// Highest schema version known to this build.
pub fn latest_version() -> i64 {
    MIGRATIONS.last().map(|(v, _)| *v).unwrap_or(0)
}
