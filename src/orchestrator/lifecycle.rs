//! Media import, cancellation, deletion, restart recovery and scratch cleanup.

use super::{paths, remove_file_logged, Orchestrator};
use reelforge_common::{Codec, EncodingId, EncodingStatus, Error, MediaId, Result};
use reelforge_db::get_conn;
use reelforge_db::models::{EncodeProfile, Media};
use reelforge_db::queries::media::NewMedia;
use reelforge_db::queries::{chunk_groups, encodings, media, profiles};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Resolution ladder seeded for every default codec.
const DEFAULT_LADDER: [u32; 5] = [240, 360, 480, 720, 1080];
const DEFAULT_CODECS: [Codec; 2] = [Codec::H264, Codec::Vp9];

#[derive(Debug, Clone)]
pub struct ImportRequest {
    pub source: PathBuf,
    pub owner: String,
    /// Defaults to a fresh random uid.
    pub uid: Option<String>,
    /// Defaults to the file stem.
    pub title: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Records found running at startup and marked failed.
    pub interrupted: usize,
    /// Pending records handed to the dispatcher.
    pub requeued: usize,
}

impl Orchestrator {
    /// Probe a source file and register it as a new media.
    pub async fn import_media(&self, req: ImportRequest) -> Result<Media> {
        if !req.source.is_file() {
            return Err(Error::not_found(format!("source {}", req.source.display())));
        }
        let source = std::fs::canonicalize(&req.source)?;
        let info = self.tools.probe(&source).await?;

        let uid = req
            .uid
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        let title = req.title.unwrap_or_else(|| {
            source
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| uid.clone())
        });

        let conn = get_conn(&self.pool)?;
        let media = media::insert_media(
            &conn,
            &NewMedia {
                uid,
                owner: req.owner,
                title,
                source_path: source.to_string_lossy().into_owned(),
                media_info: info,
            },
        )?;
        tracing::info!(
            media_id = %media.id,
            uid = %media.uid,
            duration_secs = media.duration_secs,
            height = media.height,
            "media imported"
        );
        Ok(media)
    }

    /// Ensure the default profile ladder exists. Returns how many were added.
    pub fn seed_profiles(&self) -> Result<usize> {
        let conn = get_conn(&self.pool)?;
        let mut added = 0;
        for codec in DEFAULT_CODECS {
            for resolution in DEFAULT_LADDER {
                if profiles::ensure_profile(&conn, codec, resolution)? {
                    added += 1;
                }
            }
        }
        if added > 0 {
            tracing::info!(added, "default encode profiles seeded");
        }
        Ok(added)
    }

    /// Follow-up after a non-chunk rendition succeeded: status, packaging
    /// for the primary family, and outstanding trims.
    pub(crate) async fn after_rendition(
        &self,
        media_id: MediaId,
        profile: &EncodeProfile,
    ) -> Result<()> {
        self.refresh_status(media_id)?;

        if profile.codec.container().is_packaged() {
            let manifest = match self.package_media(media_id).await {
                Ok(manifest) => manifest,
                Err(e) => {
                    tracing::warn!(%media_id, error = %e, "packaging failed");
                    None
                }
            };
            self.events
                .on_primary_rendition_ready(media_id, manifest.as_deref());
        }

        self.complete_outstanding_trims(media_id)?;
        Ok(())
    }

    /// Stop a pending or running job and delete its record. Sibling records
    /// are left alone.
    pub async fn cancel_encoding(&self, id: EncodingId) -> Result<bool> {
        let record = {
            let conn = get_conn(&self.pool)?;
            encodings::get_encoding(&conn, id)?
        };
        let Some(record) = record else {
            return Ok(false);
        };
        if !record.status.is_live() {
            return Err(Error::conflict(format!(
                "encoding {id} is {} and cannot be cancelled",
                record.status
            )));
        }

        self.processes.terminate(id, record.pid);
        let deleted = {
            let conn = get_conn(&self.pool)?;
            encodings::delete_encoding(&conn, id)?
        };
        if let Some(deleted) = deleted {
            tracing::info!(encoding_id = %id, media_id = %deleted.media_id, "encoding cancelled");
            self.discard_records(&[deleted], None);
        }
        self.refresh_status(record.media_id)?;
        Ok(true)
    }

    /// Delete a media with every job record, output file, chunk scratch
    /// and streaming directory. The source file is left in place.
    pub async fn delete_media(&self, id: MediaId) -> Result<bool> {
        let (media, records, groups) = {
            let conn = get_conn(&self.pool)?;
            let Some(media) = media::get_media(&conn, id)? else {
                return Ok(false);
            };
            let records = encodings::list_for_media(&conn, id)?;
            let groups = chunk_groups::list_groups_for_media(&conn, id)?;
            (media, records, groups)
        };

        for record in records.iter().filter(|r| r.status.is_live()) {
            self.processes.terminate(record.id, record.pid);
        }

        {
            let conn = get_conn(&self.pool)?;
            media::delete_media(&conn, id)?;
        }

        for output in records.iter().filter_map(|r| r.output_path.as_deref()) {
            remove_file_logged(Path::new(output));
        }
        let chunks_root = self.config.chunks_dir();
        for group in &groups {
            remove_dir_logged(&paths::group_dir(&chunks_root, &group.key));
        }
        remove_dir_logged(&paths::hls_dir(&self.config.storage.hls_dir, &media));

        tracing::info!(
            media_id = %id,
            records = records.len(),
            groups = groups.len(),
            "media deleted"
        );
        Ok(true)
    }

    /// Reconcile records left by a previous run of the engine.
    ///
    /// Running records are failed and retried under the usual ceiling,
    /// then every pending record is handed back to the dispatcher. An
    /// encoder orphaned by a crash is killed only if its recorded pid
    /// still runs that job.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let running = {
            let conn = get_conn(&self.pool)?;
            encodings::list_by_status(&conn, EncodingStatus::Running)?
        };

        let mut report = RecoveryReport::default();
        for record in &running {
            self.processes.terminate(record.id, record.pid);
            let failed = {
                let conn = get_conn(&self.pool)?;
                encodings::complete_fail(&conn, record.id, "interrupted by engine restart", 0.0)?
            };
            if !failed {
                continue;
            }
            report.interrupted += 1;

            if record.retries < self.config.encoding.retry_ceiling {
                self.retry(record).await?;
            } else if let Some(key) = record.chunk_group_key.as_deref().filter(|_| record.chunk) {
                let profile = {
                    let conn = get_conn(&self.pool)?;
                    profiles::require_profile(&conn, record.profile_id)?
                };
                self.fail_group(key, &profile, record.media_id, "interrupted by engine restart")
                    .await?;
            }
            self.refresh_status(record.media_id)?;
        }

        report.requeued = self.requeue_pending().await?;
        tracing::info!(
            interrupted = report.interrupted,
            requeued = report.requeued,
            "startup recovery complete"
        );
        Ok(report)
    }

    /// Hand every pending record to the dispatcher. Records already queued
    /// are harmless to submit twice: only one worker can claim them.
    pub async fn requeue_pending(&self) -> Result<usize> {
        let pending = {
            let conn = get_conn(&self.pool)?;
            encodings::list_by_status(&conn, EncodingStatus::Pending)?
        };
        for record in &pending {
            self.submit(record).await?;
        }
        Ok(pending.len())
    }

    /// Remove scratch directories no job can still be using.
    ///
    /// Chunk directories of unknown groups and work or packaging scratch
    /// older than the configured age are deleted. Returns how many
    /// directories were removed.
    pub fn sweep_orphans(&self) -> Result<usize> {
        let max_age = Duration::from_secs(self.config.encoding.orphan_max_age_secs);
        let known: HashSet<String> = {
            let conn = get_conn(&self.pool)?;
            chunk_groups::list_groups(&conn)?
                .into_iter()
                .map(|g| g.key)
                .collect()
        };

        let mut removed = 0;
        for dir in subdirs(&self.config.chunks_dir()) {
            let name = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if !known.contains(&name) && older_than(&dir, max_age) {
                remove_dir_logged(&dir);
                removed += 1;
            }
        }
        for dir in subdirs(&self.config.work_dir()) {
            if older_than(&dir, max_age) {
                remove_dir_logged(&dir);
                removed += 1;
            }
        }
        for dir in subdirs(&self.config.storage.hls_dir) {
            let scratch = dir
                .file_name()
                .is_some_and(|n| n.to_string_lossy().starts_with('.'));
            if scratch && older_than(&dir, max_age) {
                remove_dir_logged(&dir);
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!(removed, "orphaned scratch directories removed");
        }
        Ok(removed)
    }
}

fn subdirs(root: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(root) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|e| e.path())
        .collect()
}

fn older_than(path: &Path, age: Duration) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|elapsed| elapsed >= age)
}

fn remove_dir_logged(dir: &Path) {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => tracing::debug!(dir = %dir.display(), "removed directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(dir = %dir.display(), error = %e, "failed to remove directory"),
    }
}
