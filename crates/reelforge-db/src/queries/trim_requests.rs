//! Trim request operations.

use chrono::Utc;
use reelforge_common::{Error, MediaId, Result, TimeRange, TrimAction, TrimRequestId, TrimStatus};
use rusqlite::Connection;

use crate::models::TrimRequest;

const COLS: &str = "id, media_id, target_media_id, parent_id, action, ranges, status,
    created_at, updated_at";

pub fn insert_trim_request(
    conn: &Connection,
    media_id: MediaId,
    parent_id: Option<TrimRequestId>,
    action: TrimAction,
    ranges: &[TimeRange],
) -> Result<TrimRequest> {
    let id = TrimRequestId::new();
    let now = Utc::now().to_rfc3339();
    let json = serde_json::to_string(ranges)?;
    conn.execute(
        "INSERT INTO trim_requests (id, media_id, parent_id, action, ranges, status,
            created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 'initial', ?6, ?6)",
        rusqlite::params![
            id.to_string(),
            media_id.to_string(),
            parent_id.map(|p| p.to_string()),
            action.as_str(),
            json,
            now
        ],
    )
    .map_err(|e| Error::database(e.to_string()))?;

    Ok(TrimRequest {
        id,
        media_id,
        target_media_id: None,
        parent_id,
        action,
        ranges: ranges.to_vec(),
        status: TrimStatus::Initial,
        created_at: now.clone(),
        updated_at: now,
    })
}

pub fn get_trim_request(conn: &Connection, id: TrimRequestId) -> Result<Option<TrimRequest>> {
    let q = format!("SELECT {COLS} FROM trim_requests WHERE id = ?1");
    match conn.query_row(&q, [id.to_string()], TrimRequest::from_row) {
        Ok(t) => Ok(Some(t)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(Error::database(e.to_string())),
    }
}

/// Move a request from `from` to `to`. Returns false if it was not in `from`.
pub fn transition(
    conn: &Connection,
    id: TrimRequestId,
    from: TrimStatus,
    to: TrimStatus,
) -> Result<bool> {
    let now = Utc::now().to_rfc3339();
    let n = conn
        .execute(
            "UPDATE trim_requests SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
            rusqlite::params![to.as_str(), now, id.to_string(), from.as_str()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

pub fn set_target_media(conn: &Connection, id: TrimRequestId, target: MediaId) -> Result<bool> {
    let now = Utc::now().to_rfc3339();
    let n = conn
        .execute(
            "UPDATE trim_requests SET target_media_id = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![target.to_string(), now, id.to_string()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Running requests whose target is `media_id`, waiting on renditions.
pub fn list_outstanding_for_target(conn: &Connection, media_id: MediaId) -> Result<Vec<TrimRequest>> {
    let q = format!(
        "SELECT {COLS} FROM trim_requests
         WHERE target_media_id = ?1 AND status = 'running'
         ORDER BY created_at ASC"
    );
    let mut stmt = conn.prepare(&q).map_err(|e| Error::database(e.to_string()))?;
    let rows = stmt
        .query_map([media_id.to_string()], TrimRequest::from_row)
        .map_err(|e| Error::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(rows)
}

pub fn list_children(conn: &Connection, parent: TrimRequestId) -> Result<Vec<TrimRequest>> {
    let q = format!("SELECT {COLS} FROM trim_requests WHERE parent_id = ?1 ORDER BY created_at ASC");
    let mut stmt = conn.prepare(&q).map_err(|e| Error::database(e.to_string()))?;
    let rows = stmt
        .query_map([parent.to_string()], TrimRequest::from_row)
        .map_err(|e| Error::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{get_conn, init_memory_pool};
    use crate::queries::test_support;

    #[test]
    fn test_insert_and_transition() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();
        let media = test_support::media(&conn, "m", 60.0, 720);
        let ranges = [TimeRange::new(5.0, 20.0).unwrap()];

        let req = insert_trim_request(&conn, media.id, None, TrimAction::Replace, &ranges).unwrap();
        assert_eq!(req.status, TrimStatus::Initial);

        assert!(transition(&conn, req.id, TrimStatus::Initial, TrimStatus::Running).unwrap());
        assert!(!transition(&conn, req.id, TrimStatus::Initial, TrimStatus::Running).unwrap());

        let stored = get_trim_request(&conn, req.id).unwrap().unwrap();
        assert_eq!(stored.ranges, ranges);
        assert_eq!(stored.status, TrimStatus::Running);
    }

    #[test]
    fn test_outstanding_by_target() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();
        let media = test_support::media(&conn, "m", 60.0, 720);
        let clone = test_support::media(&conn, "c", 60.0, 720);
        let ranges = [TimeRange::new(0.0, 10.0).unwrap()];

        let req = insert_trim_request(&conn, media.id, None, TrimAction::SaveNew, &ranges).unwrap();
        set_target_media(&conn, req.id, clone.id).unwrap();
        assert!(list_outstanding_for_target(&conn, clone.id).unwrap().is_empty());

        transition(&conn, req.id, TrimStatus::Initial, TrimStatus::Running).unwrap();
        let outstanding = list_outstanding_for_target(&conn, clone.id).unwrap();
        assert_eq!(outstanding.len(), 1);
        assert_eq!(outstanding[0].target_media_id, Some(clone.id));
    }

    #[test]
    fn test_children() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();
        let media = test_support::media(&conn, "m", 60.0, 720);
        let ranges = [
            TimeRange::new(0.0, 10.0).unwrap(),
            TimeRange::new(20.0, 30.0).unwrap(),
        ];

        let parent =
            insert_trim_request(&conn, media.id, None, TrimAction::CreateSegments, &ranges).unwrap();
        for r in &ranges {
            insert_trim_request(&conn, media.id, Some(parent.id), TrimAction::CreateSegments, &[*r])
                .unwrap();
        }
        let children = list_children(&conn, parent.id).unwrap();
        assert_eq!(children.len(), 2);
        assert!(children.iter().all(|c| c.parent_id == Some(parent.id)));
    }
}
