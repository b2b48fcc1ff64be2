//! Fan-in: fold a finished chunk group back into one rendition.
//!
//! Any number of chunk finishers may race here. Finalization is claimed
//! through a unique (group, profile) row inside the same transaction that
//! writes the final record, so exactly one of them commits; the others
//! roll back and discard their work.

use super::{paths, Orchestrator};
use chrono::DateTime;
use reelforge_av::Workspace;
use reelforge_common::{Error, EncodingStatus, MediaId, Result};
use reelforge_db::get_conn;
use reelforge_db::models::{EncodeProfile, Encoding};
use reelforge_db::queries::encodings::FinalEncoding;
use reelforge_db::queries::{chunk_groups, encodings, media};
use rusqlite::Connection;
use std::path::{Path, PathBuf};

/// Outcome of a committed finalization.
struct Folded {
    record: Encoding,
    chunks: Vec<Encoding>,
    superseded: Vec<Encoding>,
}

/// Chunk logs in segment order, each under a header.
fn aggregate_logs(chunks: &[&Encoding]) -> String {
    chunks
        .iter()
        .enumerate()
        .map(|(i, c)| format!("--- chunk {i} ({}) ---\n{}", c.id, c.logs))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Wall-clock span from the earliest chunk start to the latest chunk update.
/// Falls back to the summed run times when timestamps are unusable.
fn span_secs(chunks: &[&Encoding]) -> f64 {
    let parse = |s: &str| DateTime::parse_from_rfc3339(s).ok();
    let start = chunks
        .iter()
        .filter_map(|c| c.started_at.as_deref().and_then(parse))
        .min();
    let end = chunks.iter().filter_map(|c| parse(&c.updated_at)).max();
    match (start, end) {
        (Some(start), Some(end)) if end >= start => {
            (end - start).num_milliseconds() as f64 / 1000.0
        }
        _ => chunks.iter().map(|c| c.total_run_time_secs).sum(),
    }
}

/// Insert the final record, claim the group and fold its chunks, all in one
/// transaction. Returns `None` when another finisher holds the claim.
///
/// `staged` is moved to its destination while the claim is held.
fn commit_group(
    conn: &Connection,
    group_key: &str,
    fin: &FinalEncoding,
    staged: Option<(Workspace, &Path, &Path)>,
) -> Result<Option<Folded>> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| Error::database(e.to_string()))?;

    let (record, superseded) = encodings::insert_final(&tx, fin)?;
    if !chunk_groups::claim_finalization(&tx, group_key, fin.profile_id, record.id, fin.status)? {
        return Ok(None);
    }

    if let Some((workspace, produced, destination)) = staged {
        workspace.finalize(produced, destination)?;
    }

    let chunks = encodings::delete_group_chunks(&tx, group_key, fin.profile_id)?;
    tx.commit().map_err(|e| Error::database(e.to_string()))?;

    Ok(Some(Folded {
        record,
        chunks,
        superseded,
    }))
}

impl Orchestrator {
    /// Concatenate a group's chunk outputs for `profile` once every segment
    /// has a successful chunk. Does nothing while the group is incomplete.
    pub(crate) async fn try_finalize_group(
        &self,
        group_key: &str,
        profile: &EncodeProfile,
    ) -> Result<()> {
        let (group, chunks, media) = {
            let conn = get_conn(&self.pool)?;
            let Some(group) = chunk_groups::get_group(&conn, group_key)? else {
                return Ok(());
            };
            if chunk_groups::is_finalized(&conn, group_key, profile.id)? {
                return Ok(());
            }
            let chunks = encodings::list_group(&conn, group_key, profile.id)?;
            let media = media::require_media(&conn, group.media_id)?;
            (group, chunks, media)
        };

        let mut ordered: Vec<&Encoding> = Vec::with_capacity(group.segments.len());
        for segment in &group.segments {
            let done = chunks.iter().find(|c| {
                c.status == EncodingStatus::Success
                    && c.has_output()
                    && c.chunk_source_path.as_deref() == Some(segment.as_str())
            });
            match done {
                Some(chunk) => ordered.push(chunk),
                None => {
                    tracing::debug!(group = %group_key, profile = %profile.name, "chunk group incomplete");
                    return Ok(());
                }
            }
        }

        let inputs: Vec<PathBuf> = ordered
            .iter()
            .filter_map(|c| c.output_path.as_deref().map(PathBuf::from))
            .collect();
        let logs = aggregate_logs(&ordered);
        let run_time = span_secs(&ordered);

        let workspace = Workspace::new_in(&self.config.work_dir(), "concat-")?;
        let produced = workspace.temp_file(&format!("joined.{}", profile.extension));
        let list = workspace.temp_file("segments.txt");

        if let Err(e) = self
            .tools
            .concat(&inputs, &list, &produced, self.config.timeouts.concat())
            .await
        {
            tracing::warn!(group = %group_key, profile = %profile.name, error = %e, "chunk concatenation failed");
            let logs = format!("{logs}\nconcatenation failed: {e}");
            return self.fail_group(group_key, profile, media.id, &logs).await;
        }

        let destination = paths::rendition_path(&self.config.storage.media_root, profile, &media);
        let fin = FinalEncoding {
            media_id: media.id,
            profile_id: profile.id,
            status: EncodingStatus::Success,
            output_path: Some(destination.to_string_lossy().into_owned()),
            logs,
            total_run_time_secs: run_time,
            chunk_group_key: Some(group_key.to_string()),
        };

        let committed = {
            let conn = get_conn(&self.pool)?;
            commit_group(&conn, group_key, &fin, Some((workspace, &produced, &destination)))
        };
        let folded = match committed {
            Ok(Some(folded)) => folded,
            Ok(None) => {
                tracing::debug!(group = %group_key, profile = %profile.name, "group already finalized elsewhere");
                return Ok(());
            }
            Err(e) => {
                let lost_race = get_conn(&self.pool)
                    .and_then(|conn| chunk_groups::is_finalized(&conn, group_key, profile.id))
                    .unwrap_or(false);
                if lost_race {
                    tracing::debug!(group = %group_key, profile = %profile.name, error = %e, "group finalized elsewhere, discarding");
                    return Ok(());
                }
                tracing::error!(group = %group_key, profile = %profile.name, error = %e, "finalizing chunk group failed");
                let logs = format!("{}\nfinalization failed: {e}", fin.logs);
                return self.fail_group(group_key, profile, media.id, &logs).await;
            }
        };

        tracing::info!(
            encoding_id = %folded.record.id,
            media_id = %media.id,
            group = %group_key,
            profile = %profile.name,
            chunks = folded.chunks.len(),
            run_time_secs = run_time,
            "chunk group finalized"
        );

        self.discard_records(&folded.superseded, Some(&destination));
        self.discard_records(&folded.chunks, None);
        self.after_rendition(media.id, profile).await
    }

    /// Record a failed rendition for a chunk group and drop its chunks,
    /// killing any that are still running.
    pub(crate) async fn fail_group(
        &self,
        group_key: &str,
        profile: &EncodeProfile,
        media_id: MediaId,
        logs: &str,
    ) -> Result<()> {
        let fin = FinalEncoding {
            media_id,
            profile_id: profile.id,
            status: EncodingStatus::Fail,
            output_path: None,
            logs: logs.to_string(),
            total_run_time_secs: 0.0,
            chunk_group_key: Some(group_key.to_string()),
        };

        let (committed, leftovers) = {
            let conn = get_conn(&self.pool)?;
            match commit_group(&conn, group_key, &fin, None)? {
                Some(folded) => (Some(folded), Vec::new()),
                None => (None, encodings::delete_group_chunks(&conn, group_key, profile.id)?),
            }
        };

        match committed {
            Some(folded) => {
                tracing::warn!(
                    encoding_id = %folded.record.id,
                    media_id = %media_id,
                    group = %group_key,
                    profile = %profile.name,
                    chunks = folded.chunks.len(),
                    "chunk group failed"
                );
                self.discard_records(&folded.superseded, None);
                self.discard_records(&folded.chunks, None);
            }
            None => self.discard_records(&leftovers, None),
        }

        self.refresh_status(media_id)?;
        Ok(())
    }
}
