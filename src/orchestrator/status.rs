//! Aggregate encoding status of a media.

use super::Orchestrator;
use reelforge_common::{AggregateStatus, Container, EncodingStatus, MediaId, Result};
use reelforge_db::get_conn;
use reelforge_db::queries::{encodings, media, profiles};
use std::collections::HashMap;

/// Fold the statuses of a media's non-chunk renditions.
///
/// Any success wins, then any running job. The media only reads as failed
/// once every record of both container families has failed; with nothing
/// recorded yet it is pending.
pub fn project(renditions: &[(Container, EncodingStatus)]) -> AggregateStatus {
    let any = |status: EncodingStatus| {
        renditions.iter().any(|(_, s)| *s == status)
    };

    if any(EncodingStatus::Success) {
        AggregateStatus::Success
    } else if any(EncodingStatus::Running) {
        AggregateStatus::Running
    } else if any(EncodingStatus::Pending) {
        AggregateStatus::Pending
    } else if any(EncodingStatus::Fail) {
        AggregateStatus::Fail
    } else {
        AggregateStatus::Pending
    }
}

impl Orchestrator {
    /// Recompute and persist a media's aggregate status, firing the
    /// status hook when it changed.
    pub fn refresh_status(&self, media_id: MediaId) -> Result<AggregateStatus> {
        let (status, changed) = {
            let conn = get_conn(&self.pool)?;
            let containers: HashMap<_, _> = profiles::list_profiles(&conn)?
                .into_iter()
                .map(|p| (p.id, p.codec.container()))
                .collect();
            let renditions: Vec<_> = encodings::list_renditions(&conn, media_id)?
                .into_iter()
                .filter_map(|e| containers.get(&e.profile_id).map(|c| (*c, e.status)))
                .collect();
            let status = project(&renditions);
            let changed = media::set_encoding_status(&conn, media_id, status)?;
            (status, changed)
        };

        if changed {
            self.events.on_aggregate_status_changed(media_id, status);
        }
        Ok(status)
    }
}
